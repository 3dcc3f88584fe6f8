use chrono::NaiveDate;
use diesel::prelude::*;

use super::schema::{climate_data, specimen};

/// The specimen record. Mirrors `schema::specimen` column for column;
/// lineage slots are the ten ranks kingdom..subspecies.
#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = specimen)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Specimen {
    pub specimen_id: i64,
    pub nuc_raw: String,
    pub nuc_san: Option<String>,
    pub hash: String,
    pub last_updated: NaiveDate,
    pub review: bool,
    pub include: bool,
    pub taxon_key: Option<i64>,
    pub taxon_kingdom: Option<String>,
    pub taxon_phylum: Option<String>,
    pub taxon_class: Option<String>,
    pub taxon_order: Option<String>,
    pub taxon_family: Option<String>,
    pub taxon_subfamily: Option<String>,
    pub taxon_tribe: Option<String>,
    pub taxon_genus: Option<String>,
    pub taxon_species: Option<String>,
    pub taxon_subspecies: Option<String>,
    pub identification_rank: Option<String>,
    pub country_iso: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub kg_zone: Option<String>,
    pub checks: i64,
    pub geo_info: Option<f64>,
    pub processing_info: Option<String>,
}

impl Specimen {
    /// The lineage slot at `depth` (0 = kingdom .. 9 = subspecies).
    pub fn lineage_at(&self, depth: usize) -> Option<&str> {
        let slot = match depth {
            0 => &self.taxon_kingdom,
            1 => &self.taxon_phylum,
            2 => &self.taxon_class,
            3 => &self.taxon_order,
            4 => &self.taxon_family,
            5 => &self.taxon_subfamily,
            6 => &self.taxon_tribe,
            7 => &self.taxon_genus,
            8 => &self.taxon_species,
            9 => &self.taxon_subspecies,
            _ => return None,
        };
        slot.as_deref()
    }

    /// The deepest rank depth (0..=9) whose lineage slot is non-null, if any.
    pub fn deepest_lineage_depth(&self) -> Option<usize> {
        (0..10).rev().find(|&depth| self.lineage_at(depth).is_some())
    }
}

/// The climate record, keyed by `taxon_key`.
#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = climate_data)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ClimateRecord {
    pub taxon_key: i64,
    pub kg_af: i64,
    pub kg_am: i64,
    pub kg_as: i64,
    pub kg_aw: i64,
    pub kg_bsh: i64,
    pub kg_bsk: i64,
    pub kg_bwh: i64,
    pub kg_bwk: i64,
    pub kg_cfa: i64,
    pub kg_cfb: i64,
    pub kg_cfc: i64,
    pub kg_csa: i64,
    pub kg_csb: i64,
    pub kg_csc: i64,
    pub kg_cwa: i64,
    pub kg_cwb: i64,
    pub kg_cwc: i64,
    pub kg_dfa: i64,
    pub kg_dfb: i64,
    pub kg_dfc: i64,
    pub kg_dfd: i64,
    pub kg_dsa: i64,
    pub kg_dsb: i64,
    pub kg_dsc: i64,
    pub kg_dsd: i64,
    pub kg_dwa: i64,
    pub kg_dwb: i64,
    pub kg_dwc: i64,
    pub kg_dwd: i64,
    pub kg_ef: i64,
    pub kg_et: i64,
    pub kg_ocean: i64,
    pub country_codes: String,
}

impl ClimateRecord {
    /// Lookup a zone's count by its lowercase code (e.g. `"cfb"`).
    pub fn zone_count(&self, zone: &str) -> i64 {
        match zone {
            "af" => self.kg_af,
            "am" => self.kg_am,
            "as" => self.kg_as,
            "aw" => self.kg_aw,
            "bsh" => self.kg_bsh,
            "bsk" => self.kg_bsk,
            "bwh" => self.kg_bwh,
            "bwk" => self.kg_bwk,
            "cfa" => self.kg_cfa,
            "cfb" => self.kg_cfb,
            "cfc" => self.kg_cfc,
            "csa" => self.kg_csa,
            "csb" => self.kg_csb,
            "csc" => self.kg_csc,
            "cwa" => self.kg_cwa,
            "cwb" => self.kg_cwb,
            "cwc" => self.kg_cwc,
            "dfa" => self.kg_dfa,
            "dfb" => self.kg_dfb,
            "dfc" => self.kg_dfc,
            "dfd" => self.kg_dfd,
            "dsa" => self.kg_dsa,
            "dsb" => self.kg_dsb,
            "dsc" => self.kg_dsc,
            "dsd" => self.kg_dsd,
            "dwa" => self.kg_dwa,
            "dwb" => self.kg_dwb,
            "dwc" => self.kg_dwc,
            "dwd" => self.kg_dwd,
            "ef" => self.kg_ef,
            "et" => self.kg_et,
            "ocean" => self.kg_ocean,
            _ => 0,
        }
    }

    pub fn total_occurrences(&self) -> i64 {
        crate::geo::koppen::ZONES.iter().map(|z| self.zone_count(z)).sum()
    }

    pub fn has_country(&self, iso: &str) -> bool {
        self.country_codes.split(',').any(|c| c == iso)
    }
}
