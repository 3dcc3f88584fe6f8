//! Ingest pipeline: parses a vendor TSV against its schema descriptor,
//! computes a content hash, classifies rows as new/unchanged/changed, and
//! writes both the staging row and the specimen row.

pub mod schema_descriptor;

use std::path::Path;

use chrono::NaiveDate;
use sha2::{Digest, Sha256};

use crate::errors::Error;
use crate::geo::koppen::KoppenLookup;
use crate::store::models::Specimen;
use crate::store::{staging, Store};
use schema_descriptor::{Field, FieldType};

pub const BUILD_CHUNK: usize = 1000;
pub const UPDATE_CHUNK: usize = 1000;

/// A single typed cell, tagged by the schema descriptor's declared type.
/// Deliberately a tagged union rather than one anonymous map-of-any, so a
/// column's type is known at the point it's consumed.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Str(String),
    Date(NaiveDate),
    Int(i64),
    Num(f64),
    Array(Vec<String>),
    Null,
}

impl Cell {
    fn as_display(&self) -> String {
        match self {
            Cell::Str(s) => s.clone(),
            Cell::Date(d) => d.format("%Y-%m-%d").to_string(),
            Cell::Int(i) => i.to_string(),
            Cell::Num(n) => n.to_string(),
            Cell::Array(items) => items.join(","),
            Cell::Null => String::new(),
        }
    }

    fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }
}

/// Parses a raw TSV cell value through its declared type. Empty string and
/// the literal `"None"` are treated as null.
fn parse_cell(raw: &str, kind: FieldType) -> Cell {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "None" {
        return Cell::Null;
    }
    match kind {
        FieldType::Integer => trimmed.parse::<i64>().map(Cell::Int).unwrap_or(Cell::Null),
        FieldType::Number => trimmed.parse::<f64>().map(Cell::Num).unwrap_or(Cell::Null),
        FieldType::Date => parse_date(trimmed).map(Cell::Date).unwrap_or(Cell::Null),
        FieldType::Array => Cell::Array(trimmed.split(',').map(|s| s.trim().to_string()).collect()),
        FieldType::String => Cell::Str(trimmed.to_string()),
    }
}

/// Multi-format date fallback chain, in the spirit of the reference
/// importer's lenient date parser: try the common vendor formats in order,
/// null on exhaustion rather than erroring the whole row out.
fn parse_date(raw: &str) -> Option<NaiveDate> {
    const FORMATS: &[&str] = &["%Y-%m-%d", "%d.%m.%Y", "%d/%m/%Y", "%Y/%m/%d"];
    FORMATS.iter().find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

/// Parses a `"[lat, lon]"` coordinate cell. Returns `None` on any parse
/// failure rather than erroring the row.
fn parse_coord(raw: &str) -> Option<(f64, f64)> {
    let trimmed = raw.trim().trim_start_matches('[').trim_end_matches(']');
    let mut parts = trimmed.split(',').map(|p| p.trim().parse::<f64>());
    match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(lat)), Some(Ok(lon)), None) => Some((lat, lon)),
        _ => None,
    }
}

struct ParsedRow {
    specimen_id: i64,
    cells: Vec<Cell>,
    content_hash: String,
    fields: Vec<Field>,
    coord: Option<(f64, f64)>,
    kg_zone: Option<String>,
}

/// Parses one TSV data row (already split into cells by column) against
/// `fields`, applying the mandatory-field check and computing the content
/// hash. Returns `None` if the row is rejected (missing mandatory field).
fn parse_row(raw_cells: &[&str], fields: &[Field], koppen: &dyn KoppenLookup) -> Option<ParsedRow> {
    let mut cells: Vec<Cell> = fields.iter().map(|f| parse_cell(raw_cells.get(f.index).copied().unwrap_or(""), f.kind)).collect();

    let specimen_id_idx = fields.iter().position(|f| f.name == "specimenid")?;
    let nuc_idx = fields.iter().position(|f| f.name == "nuc")?;
    if cells[specimen_id_idx].is_null() || cells[nuc_idx].is_null() {
        return None;
    }

    // `kg_zone` is always derived from `coord` via the external lookup when
    // present, independent of whether the schema descriptor declares a
    // `kg_zone` column of its own (it's a derived field, not a vendor one).
    let mut coord = None;
    let mut kg_zone = None;
    if let Some(coord_idx) = fields.iter().position(|f| f.name == "coord") {
        if let Cell::Str(raw_coord) = &cells[coord_idx] {
            if let Some((lat, lon)) = parse_coord(raw_coord) {
                coord = Some((lat, lon));
                let zone = koppen.lookup(lat, lon).to_lowercase();
                if let Some(kg_idx) = fields.iter().position(|f| f.name == "kg_zone") {
                    cells[kg_idx] = Cell::Str(zone.clone());
                }
                kg_zone = Some(zone);
            }
        }
    }

    let specimen_id = match &cells[specimen_id_idx] {
        Cell::Int(i) => *i,
        _ => return None,
    };

    let hash_input: String = {
        let mut ordered: Vec<(&Field, &Cell)> = fields.iter().zip(cells.iter()).collect();
        ordered.sort_by_key(|(f, _)| f.index);
        ordered.iter().map(|(_, c)| c.as_display()).collect::<Vec<_>>().join("")
    };
    let mut hasher = Sha256::new();
    hasher.update(hash_input.as_bytes());
    let content_hash = format!("{:x}", hasher.finalize());

    Some(ParsedRow { specimen_id, cells, content_hash, fields: fields.to_vec(), coord, kg_zone })
}

fn cell_str(cells: &[Cell], fields: &[Field], name: &str) -> Option<String> {
    let idx = fields.iter().position(|f| f.name == name)?;
    match &cells[idx] {
        Cell::Str(s) => Some(s.clone()),
        Cell::Null => None,
        other => Some(other.as_display()),
    }
}

/// Builds the replacement `Specimen` row for a parsed record. `preserved_checks`
/// is the bitmask to carry into the fresh row's `checks` column: 0 for a
/// brand-new record, or an existing changed record's old `checks` already
/// masked down to its `LOC_*` bits by [`crate::bitvector::update_clear_mask`]
/// — re-ingesting a changed row must reset every check except location, not
/// wipe `checks` outright (spec.md §3 invariant / §4.3).
fn row_to_specimen(row: &ParsedRow, today: NaiveDate, preserved_checks: u64) -> Specimen {
    let ParsedRow { specimen_id, cells, content_hash, fields, coord, kg_zone } = row;
    let nuc_raw = cell_str(cells, fields, "nuc").unwrap_or_default();

    Specimen {
        specimen_id: *specimen_id,
        nuc_raw,
        nuc_san: None,
        hash: content_hash.clone(),
        last_updated: today,
        review: true,
        include: false,
        taxon_key: None,
        taxon_kingdom: cell_str(cells, fields, "kingdom"),
        taxon_phylum: cell_str(cells, fields, "phylum"),
        taxon_class: cell_str(cells, fields, "class"),
        taxon_order: cell_str(cells, fields, "order"),
        taxon_family: cell_str(cells, fields, "family"),
        taxon_subfamily: cell_str(cells, fields, "subfamily"),
        taxon_tribe: cell_str(cells, fields, "tribe"),
        taxon_genus: cell_str(cells, fields, "genus"),
        taxon_species: cell_str(cells, fields, "species"),
        taxon_subspecies: cell_str(cells, fields, "subspecies"),
        identification_rank: None,
        country_iso: cell_str(cells, fields, "country_iso"),
        lat: coord.map(|(lat, _)| lat),
        lon: coord.map(|(_, lon)| lon),
        kg_zone: kg_zone.clone(),
        checks: preserved_checks as i64,
        geo_info: None,
        processing_info: None,
    }
}

/// Reads `tsv_path` against `fields`, keeping only rows whose `marker_code`
/// column matches `marker_code`, parsing each into a `ParsedRow`.
fn read_rows(
    tsv_path: &Path,
    fields: &[Field],
    marker_code: &str,
    koppen: &dyn KoppenLookup,
) -> Result<Vec<ParsedRow>, Error> {
    let mut reader = csv::ReaderBuilder::new().delimiter(b'\t').from_path(tsv_path)?;
    let headers = reader.headers()?.clone();
    let marker_idx = headers.iter().position(|h| h == "marker_code");

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        if let Some(idx) = marker_idx {
            if record.get(idx) != Some(marker_code) {
                continue;
            }
        }
        let raw_cells: Vec<&str> = record.iter().collect();
        if let Some(parsed) = parse_row(&raw_cells, fields, koppen) {
            rows.push(parsed);
        } else {
            tracing::debug!("dropping ingest row: missing mandatory field");
        }
    }
    Ok(rows)
}

/// Build mode: write staging + specimen rows for every accepted row,
/// unconditionally, in batches of [`BUILD_CHUNK`].
pub fn build(
    store: &Store,
    tsv_path: &Path,
    schema_path: &Path,
    marker_code: &str,
    koppen: &dyn KoppenLookup,
    today: NaiveDate,
) -> Result<usize, Error> {
    let fields = schema_descriptor::load(schema_path)?;
    let rows = read_rows(tsv_path, &fields, marker_code, koppen)?;

    let mut conn = store.conn()?;
    staging::ensure_table(&mut conn, &fields)?;

    let bar = crate::progress::new_progress_bar(rows.len(), "Ingesting rows");
    let mut count = 0;
    for chunk in rows.chunks(BUILD_CHUNK) {
        for row in chunk {
            staging::insert_row(&mut conn, &fields, &row.cells)?;
        }
        let specimens: Vec<Specimen> = chunk.iter().map(|r| row_to_specimen(r, today, 0)).collect();
        store.bulk_insert(&specimens, BUILD_CHUNK)?;
        count += chunk.len();
        bar.inc(chunk.len() as u64);
    }
    bar.finish();
    Ok(count)
}

/// Result of classifying an ingested row in update mode.
pub struct UpdateOutcome {
    pub new_ids: Vec<i64>,
    /// (specimen_id, old_taxon_key) for records whose hash changed.
    pub changed: Vec<(i64, Option<i64>)>,
}

/// Update mode: look up the existing hash by `specimen_id`; classify as
/// new/changed/unchanged, writing only new or changed rows.
pub fn update(
    store: &Store,
    tsv_path: &Path,
    schema_path: &Path,
    marker_code: &str,
    koppen: &dyn KoppenLookup,
    today: NaiveDate,
) -> Result<UpdateOutcome, Error> {
    let fields = schema_descriptor::load(schema_path)?;
    let rows = read_rows(tsv_path, &fields, marker_code, koppen)?;

    let mut conn = store.conn()?;
    staging::ensure_table(&mut conn, &fields)?;

    let ids: Vec<i64> = rows.iter().map(|r| r.specimen_id).collect();
    let existing = store.existing_hash_and_taxon(&ids)?;

    let bar = crate::progress::new_progress_bar(rows.len(), "Diffing rows");
    let mut new_ids = Vec::new();
    let mut changed = Vec::new();
    let mut pending_specimens = Vec::new();

    for row in &rows {
        bar.inc(1);
        match existing.get(&row.specimen_id) {
            None => {
                staging::insert_row(&mut conn, &fields, &row.cells)?;
                new_ids.push(row.specimen_id);
                pending_specimens.push(row_to_specimen(row, today, 0));
            }
            Some((hash, old_taxon_key, old_checks)) if *hash != row.content_hash => {
                staging::insert_row(&mut conn, &fields, &row.cells)?;
                changed.push((row.specimen_id, *old_taxon_key));
                let preserved_checks = old_checks & crate::bitvector::update_clear_mask();
                pending_specimens.push(row_to_specimen(row, today, preserved_checks));
            }
            Some(_) => continue,
        }

        if pending_specimens.len() == UPDATE_CHUNK {
            store.bulk_insert(&pending_specimens, UPDATE_CHUNK)?;
            pending_specimens.clear();
        }
    }
    if !pending_specimens.is_empty() {
        store.bulk_insert(&pending_specimens, UPDATE_CHUNK)?;
    }
    bar.finish();

    Ok(UpdateOutcome { new_ids, changed })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullKoppen;
    impl KoppenLookup for NullKoppen {
        fn lookup(&self, _lat: f64, _lon: f64) -> String {
            "ocean".to_string()
        }
    }

    #[test]
    fn parse_cell_treats_empty_and_none_as_null() {
        assert!(parse_cell("", FieldType::String).is_null());
        assert!(parse_cell("None", FieldType::Integer).is_null());
        assert_eq!(parse_cell("42", FieldType::Integer), Cell::Int(42));
    }

    #[test]
    fn parse_coord_accepts_bracketed_pair() {
        assert_eq!(parse_coord("[12.5, -70.25]"), Some((12.5, -70.25)));
        assert_eq!(parse_coord("not a coord"), None);
    }

    #[test]
    fn content_hash_is_stable_sha256() {
        let fields = vec![
            Field { name: "specimenid".into(), index: 0, kind: FieldType::Integer },
            Field { name: "nuc".into(), index: 1, kind: FieldType::String },
        ];
        let row_a = parse_row(&["1", "ACGT"], &fields, &NullKoppen).unwrap();
        let row_b = parse_row(&["1", "ACGT"], &fields, &NullKoppen).unwrap();
        assert_eq!(row_a.content_hash, row_b.content_hash);
        assert_eq!(row_a.content_hash.len(), 64);
    }

    #[test]
    fn parse_row_rejects_missing_mandatory_fields() {
        let fields = vec![
            Field { name: "specimenid".into(), index: 0, kind: FieldType::Integer },
            Field { name: "nuc".into(), index: 1, kind: FieldType::String },
        ];
        assert!(parse_row(&["", "ACGT"], &fields, &NullKoppen).is_none());
        assert!(parse_row(&["1", ""], &fields, &NullKoppen).is_none());
    }

    #[test]
    fn coordinate_is_carried_through_to_the_specimen_row() {
        let fields = vec![
            Field { name: "specimenid".into(), index: 0, kind: FieldType::Integer },
            Field { name: "nuc".into(), index: 1, kind: FieldType::String },
            Field { name: "coord".into(), index: 2, kind: FieldType::String },
            Field { name: "kg_zone".into(), index: 3, kind: FieldType::String },
        ];
        let row = parse_row(&["1", "ACGT", "[12.5, -70.25]", ""], &fields, &NullKoppen).unwrap();
        assert_eq!(row.coord, Some((12.5, -70.25)));

        let specimen = row_to_specimen(&row, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), 0);
        assert_eq!(specimen.lat, Some(12.5));
        assert_eq!(specimen.lon, Some(-70.25));
        assert_eq!(specimen.kg_zone.as_deref(), Some("ocean"));
    }

    #[test]
    fn missing_coordinate_leaves_lat_lon_null() {
        let fields = vec![
            Field { name: "specimenid".into(), index: 0, kind: FieldType::Integer },
            Field { name: "nuc".into(), index: 1, kind: FieldType::String },
        ];
        let row = parse_row(&["1", "ACGT"], &fields, &NullKoppen).unwrap();
        let specimen = row_to_specimen(&row, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), 0);
        assert_eq!(specimen.lat, None);
        assert_eq!(specimen.lon, None);
    }

    fn write_schema(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("schema.json");
        std::fs::write(
            &path,
            r#"{"resources":[{"schema":{"fields":[
                {"name":"specimenid","index":0,"type":"integer"},
                {"name":"nuc","index":1,"type":"string"}
            ]}}]}"#,
        )
        .unwrap();
        path
    }

    #[test]
    fn changed_row_reingest_preserves_loc_bits_and_clears_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let schema = write_schema(dir.path());
        let tsv = dir.path().join("data.tsv");
        let today = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();

        std::fs::write(&tsv, "specimenid\tnuc\n1\tACGT\n").unwrap();
        let store = Store::create_empty(&dir.path().join("store.sqlite3")).unwrap();
        build(&store, &tsv, &schema, "", &NullKoppen, today).unwrap();

        // Simulate a prior curation pass that set NAME_CHECKED plus both
        // review-unrelated and LOC_* bits.
        let prior_mask = crate::bitvector::NAME_CHECKED | crate::bitvector::SELECTED | crate::bitvector::LOC_CHECKED | crate::bitvector::LOC_PASSED;
        store.or_checks(&[(1, prior_mask)]).unwrap();

        // Re-ingest the same specimen id with different sequence content, so
        // its content hash changes.
        std::fs::write(&tsv, "specimenid\tnuc\n1\tTTTT\n").unwrap();
        let outcome = update(&store, &tsv, &schema, "", &NullKoppen, today).unwrap();
        assert_eq!(outcome.changed, vec![(1, None)]);

        let row = store.select_in(&[1]).unwrap().into_iter().next().unwrap();
        let checks = row.checks as u64;
        assert_eq!(checks & crate::bitvector::update_clear_mask(), checks, "only LOC_* bits may survive a changed re-ingest");
        assert_eq!(checks & crate::bitvector::LOC_CHECKED, crate::bitvector::LOC_CHECKED);
        assert_eq!(checks & crate::bitvector::LOC_PASSED, crate::bitvector::LOC_PASSED);
        assert_eq!(checks & crate::bitvector::NAME_CHECKED, 0);
        assert_eq!(checks & crate::bitvector::SELECTED, 0);
    }
}
