//! Geo evaluator: downloads occurrence records for taxa awaiting evaluation,
//! aggregates them into per-taxon Köppen-Geiger zone/country histograms in
//! the climate store, then scores every specimen of that taxon against its
//! taxon's histogram.

pub mod client;
pub mod koppen;

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use client::{download_batch, OccurrenceClient};
use koppen::{clamp_coord, KoppenLookup, ZONES};
use rayon::prelude::*;

use crate::bitvector::{LOC_CHECKED, LOC_EMPTY, LOC_PASSED};
use crate::errors::Error;
use crate::store::models::ClimateRecord;
use crate::store::{ClimateStore, Store};

/// Row count per aggregation chunk handed to a rayon task, mirroring the
/// reference tracker's `TRACKER_CHUNK_SIZE`.
pub const TRACKER_CHUNK_SIZE: usize = 1_000_000;

/// Default number of taxon keys submitted per occurrence-download batch.
pub const GEO_DEFAULT_BATCH: usize = 1_000;

type ZoneCounts = HashMap<String, i64>;
type TaxonZoneMap = HashMap<i64, ZoneCounts>;
type TaxonCountryMap = HashMap<i64, BTreeSet<String>>;

struct OccurrenceRow {
    taxon_key: i64,
    lat: f64,
    lon: f64,
    country_code: String,
}

fn header_index(headers: &csv::StringRecord, names: &[&str]) -> Option<usize> {
    names.iter().find_map(|name| headers.iter().position(|h| h.eq_ignore_ascii_case(name)))
}

fn parse_occurrence_row(
    record: &csv::StringRecord,
    taxon_idx: Option<usize>,
    lat_idx: Option<usize>,
    lon_idx: Option<usize>,
    country_idx: Option<usize>,
) -> Option<OccurrenceRow> {
    let taxon_key = record.get(taxon_idx?)?.parse::<i64>().ok()?;
    let lat = record.get(lat_idx?)?.parse::<f64>().ok()?;
    let lon = record.get(lon_idx?)?.parse::<f64>().ok()?;
    let country_code = record.get(country_idx?)?.trim().to_string();
    if country_code.is_empty() {
        return None;
    }
    Some(OccurrenceRow { taxon_key, lat, lon, country_code: country_code.to_uppercase() })
}

/// Aggregates one chunk of occurrence rows into per-taxon zone counts and
/// country-code sets. Mirrors `tracker.py::process_chunk`.
fn process_chunk(rows: &[OccurrenceRow], koppen: &dyn KoppenLookup) -> (TaxonZoneMap, TaxonCountryMap) {
    let mut zones: TaxonZoneMap = HashMap::new();
    let mut countries: TaxonCountryMap = HashMap::new();

    for row in rows {
        let (lat, lon) = clamp_coord(row.lat, row.lon);
        let zone = koppen.lookup(lat, lon).to_lowercase();
        *zones.entry(row.taxon_key).or_default().entry(zone).or_insert(0) += 1;
        countries.entry(row.taxon_key).or_default().insert(row.country_code.clone());
    }
    (zones, countries)
}

/// Merges a list of per-chunk aggregates into one pair of maps. Mirrors
/// `tracker.py::combine_results`.
fn combine_results(results: Vec<(TaxonZoneMap, TaxonCountryMap)>) -> (TaxonZoneMap, TaxonCountryMap) {
    let mut zones: TaxonZoneMap = HashMap::new();
    let mut countries: TaxonCountryMap = HashMap::new();

    for (chunk_zones, chunk_countries) in results {
        for (taxon_key, counts) in chunk_zones {
            let entry = zones.entry(taxon_key).or_default();
            for (zone, count) in counts {
                *entry.entry(zone).or_insert(0) += count;
            }
        }
        for (taxon_key, codes) in chunk_countries {
            countries.entry(taxon_key).or_default().extend(codes);
        }
    }
    (zones, countries)
}

/// Streams `tsv_bytes` (a completed occurrence download), dropping rows
/// missing any of the four required columns, and aggregates the survivors in
/// chunks of [`TRACKER_CHUNK_SIZE`] across the global rayon pool.
fn aggregate_occurrences(tsv_bytes: &[u8], koppen: &dyn KoppenLookup) -> Result<(TaxonZoneMap, TaxonCountryMap), Error> {
    let mut reader = csv::ReaderBuilder::new().delimiter(b'\t').from_reader(tsv_bytes);
    let headers = reader.headers()?.clone();
    let taxon_idx = header_index(&headers, &["acceptedtaxonkey", "specieskey"]);
    let lat_idx = header_index(&headers, &["decimallatitude"]);
    let lon_idx = header_index(&headers, &["decimallongitude"]);
    let country_idx = header_index(&headers, &["countrycode"]);

    let mut chunks: Vec<Vec<OccurrenceRow>> = Vec::new();
    let mut current: Vec<OccurrenceRow> = Vec::with_capacity(TRACKER_CHUNK_SIZE);
    for record in reader.records() {
        let record = record?;
        if let Some(row) = parse_occurrence_row(&record, taxon_idx, lat_idx, lon_idx, country_idx) {
            current.push(row);
        }
        if current.len() >= TRACKER_CHUNK_SIZE {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    let results: Vec<(TaxonZoneMap, TaxonCountryMap)> = chunks.into_par_iter().map(|c| process_chunk(&c, koppen)).collect();
    Ok(combine_results(results))
}

fn build_climate_record(taxon_key: i64, zone_counts: &ZoneCounts, countries: Option<&BTreeSet<String>>) -> ClimateRecord {
    let count = |zone: &str| zone_counts.get(zone).copied().unwrap_or(0);
    let country_codes = countries.map(|set| set.iter().cloned().collect::<Vec<_>>().join(",")).unwrap_or_default();

    ClimateRecord {
        taxon_key,
        kg_af: count("af"),
        kg_am: count("am"),
        kg_as: count("as"),
        kg_aw: count("aw"),
        kg_bsh: count("bsh"),
        kg_bsk: count("bsk"),
        kg_bwh: count("bwh"),
        kg_bwk: count("bwk"),
        kg_cfa: count("cfa"),
        kg_cfb: count("cfb"),
        kg_cfc: count("cfc"),
        kg_csa: count("csa"),
        kg_csb: count("csb"),
        kg_csc: count("csc"),
        kg_cwa: count("cwa"),
        kg_cwb: count("cwb"),
        kg_cwc: count("cwc"),
        kg_dfa: count("dfa"),
        kg_dfb: count("dfb"),
        kg_dfc: count("dfc"),
        kg_dfd: count("dfd"),
        kg_dsa: count("dsa"),
        kg_dsb: count("dsb"),
        kg_dsc: count("dsc"),
        kg_dsd: count("dsd"),
        kg_dwa: count("dwa"),
        kg_dwb: count("dwb"),
        kg_dwc: count("dwc"),
        kg_dwd: count("dwd"),
        kg_ef: count("ef"),
        kg_et: count("et"),
        kg_ocean: count("ocean"),
        country_codes,
    }
}

/// Scores every specimen of `taxon_key` against the climate store's
/// aggregated record for that taxon (or, if the climate store has no data,
/// writes the score-`-1`/`LOC_EMPTY` outcome for every specimen). Mirrors
/// `tracker.py::_evaluate_location`.
fn evaluate_location(store: &Store, climate: &ClimateStore, taxon_key: i64) -> Result<(), Error> {
    let specimens = store.records_for_taxon(taxon_key)?;
    if specimens.is_empty() {
        return Ok(());
    }

    match climate.get(taxon_key)? {
        None => {
            let updates: Vec<(i64, f64, u64)> =
                specimens.iter().map(|s| (s.specimen_id, -1.0, LOC_CHECKED | LOC_EMPTY)).collect();
            store.apply_geo_scores(&updates)?;
        }
        Some(record) => {
            let total = record.total_occurrences();
            let mut updates = Vec::with_capacity(specimens.len());
            for specimen in &specimens {
                let mut score = 0.0;
                if let Some(iso) = specimen.country_iso.as_deref() {
                    if record.has_country(&iso.to_uppercase()) {
                        score += 2.0;
                    }
                }
                if let Some(zone) = specimen.kg_zone.as_deref() {
                    let count = record.zone_count(&zone.to_lowercase());
                    if count > 0 && total > 0 {
                        score += 1.0;
                        score += count as f64 / total as f64;
                    }
                }
                let mut mask = LOC_CHECKED;
                if score > 0.0 {
                    mask |= LOC_PASSED;
                }
                updates.push((specimen.specimen_id, score, mask));
            }
            store.apply_geo_scores(&updates)?;
        }
    }
    Ok(())
}

/// Drives the full geo evaluation for every taxon key awaiting one: taxa
/// already in the climate store are re-scored directly; taxa with no
/// climate data are downloaded in batches of `batch_size`, aggregated, and
/// upserted before being scored.
pub fn run_geo_evaluation(
    store: &Store,
    climate: &ClimateStore,
    client: &dyn OccurrenceClient,
    batch_size: usize,
    poll_interval: Duration,
    sleep: impl Fn(Duration) + Copy,
    koppen: &dyn KoppenLookup,
) -> Result<(), Error> {
    let keys = store.taxon_keys_needing_geo()?;
    let mut missing = Vec::new();

    for key in keys {
        if climate.get(key)?.is_some() {
            evaluate_location(store, climate, key)?;
        }
        else {
            missing.push(key);
        }
    }

    for batch in missing.chunks(batch_size.max(1)) {
        tracing::info!(batch_len = batch.len(), "downloading occurrence data");
        let tsv_bytes = download_batch(client, batch, poll_interval, sleep)?;
        let (zones, countries) = aggregate_occurrences(&tsv_bytes, koppen)?;

        for (taxon_key, zone_counts) in &zones {
            let record = build_climate_record(*taxon_key, zone_counts, countries.get(taxon_key));
            climate.upsert(&record)?;
        }
        for key in batch {
            evaluate_location(store, climate, *key)?;
        }
    }
    Ok(())
}
