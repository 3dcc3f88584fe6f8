//! Hybrid marker: a single-pass scan flagging specimens whose species name
//! carries the hybrid token (`" x "` / `" X "`). The companion sequence-length
//! check it shares a threshold with lives in the purge engine's
//! `mark_duplicates`.

use diesel::prelude::*;

use crate::bitvector::HYBRID;
use crate::errors::Error;
use crate::store::schema::specimen;
use crate::store::Store;

const HYBRID_TOKENS: [&str; 2] = [" x ", " X "];

/// True if `species` contains either hybrid token, flanking spaces required
/// so `"Quercusxcrenata"` (no spaces) does not match.
pub fn is_hybrid(species: &str) -> bool {
    HYBRID_TOKENS.iter().any(|token| species.contains(token))
}

/// Scans every specimen's `taxon_species` and ORs in [`HYBRID`] for matches.
/// Returns the number of records marked.
pub fn mark_hybrids(store: &Store) -> Result<usize, Error> {
    let mut conn = store.conn()?;
    let rows: Vec<(i64, Option<String>)> =
        specimen::table.select((specimen::specimen_id, specimen::taxon_species)).load(&mut conn)?;
    drop(conn);

    let ids: Vec<i64> = rows
        .into_iter()
        .filter_map(|(id, species)| species.filter(|s| is_hybrid(s)).map(|_| id))
        .collect();

    let updates: Vec<(i64, u64)> = ids.iter().map(|&id| (id, HYBRID)).collect();
    store.or_checks(&updates)?;
    Ok(ids.len())
}
