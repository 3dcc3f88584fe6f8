//! Taxonomy harmoniser: for every unresolved rank, groups distinct
//! lineage tuples into query objects, resolves them against the external
//! name service through a bounded concurrent worker pool, and turns each
//! response into a batch of bitmask/lineage updates.

pub mod client;
pub mod gbif;

use std::time::Duration;

use crate::bitvector::{self, NAME_CHECKED, NAME_FAILED};
use crate::retry::{retry, DEFAULT_ATTEMPTS, DEFAULT_BACKOFF};
use crate::store::models::Specimen;
use crate::store::Store;
use client::{MatchType, NameMatch, NameQuery, NameResolver};

/// Default worker-pool width for concurrent name-service queries.
pub const DEFAULT_WORKERS: usize = 30;

/// One specimen's outcome from harmonising a single query object: the
/// bitmask to OR in, and the lineage/identification_rank/taxon_key columns
/// to write (`None` fields are left untouched).
#[derive(Debug, Clone, Default)]
pub struct HarmonizeUpdate {
    pub specimen_id: i64,
    pub checks_mask: u64,
    pub lineage: std::collections::BTreeMap<String, String>,
    pub identification_rank: Option<String>,
    pub taxon_key: Option<i64>,
}

/// Builds one query object per distinct lineage tuple among `review = true`
/// specimens whose deepest non-null rank is `depth`.
pub fn query_objects_at_depth(store: &Store, depth: usize) -> Result<Vec<NameQuery>, crate::errors::Error> {
    let rows = store.unresolved_at_depth(depth)?;
    let mut groups: std::collections::BTreeMap<String, Vec<i64>> = std::collections::BTreeMap::new();
    let rank_name = bitvector::RANKS[depth].0;

    for row in rows {
        let query_string = row.lineage_at(depth).unwrap_or_default().to_string();
        groups.entry(query_string).or_default().push(row.specimen_id);
    }

    Ok(groups
        .into_iter()
        .map(|(query_string, specimen_ids)| NameQuery { query_string, query_rank: rank_name.to_string(), specimen_ids })
        .collect())
}

/// Runs `query` against `resolver` with the standard retry policy, returning
/// the harmonised update to apply to every specimen in the query (a
/// terminal-failure update on an explicit no-match, or no update at all on
/// exhausted retries — a transport failure must leave `NAME_CHECKED` clear so
/// a later pass retries the same record).
pub fn harmonize_one(query: &NameQuery, resolver: &dyn NameResolver) -> Vec<HarmonizeUpdate> {
    match retry(DEFAULT_ATTEMPTS, DEFAULT_BACKOFF, || resolver.resolve(query)) {
        Ok(response) => apply_response(query, &response),
        Err(_) => Vec::new(),
    }
}

/// Runs `harmonize_one` for every query in `queries` across a bounded pool of
/// `workers` threads.
pub fn harmonize_all(queries: &[NameQuery], resolver: &dyn NameResolver, workers: usize) -> Vec<HarmonizeUpdate> {
    let pool = rayon::ThreadPoolBuilder::new().num_threads(workers.max(1)).build().expect("thread pool builds");
    pool.install(|| {
        use rayon::prelude::*;
        queries.par_iter().flat_map(|query| harmonize_one(query, resolver)).collect()
    })
}

/// Turns one query's response into the per-specimen bitmask/lineage update.
fn apply_response(query: &NameQuery, response: &NameMatch) -> Vec<HarmonizeUpdate> {
    let query_depth = bitvector::depth_for_rank(&query.query_rank).unwrap_or(0);
    let query_bit = bitvector::bit_for_depth(query_depth).unwrap_or(0);

    // Step 1: terminal failure.
    if response.match_type == Some(MatchType::None) && response.confidence == Some(100) {
        return query
            .specimen_ids
            .iter()
            .map(|&specimen_id| HarmonizeUpdate {
                specimen_id,
                checks_mask: NAME_CHECKED | NAME_FAILED,
                identification_rank: Some("Failed".to_string()),
                ..Default::default()
            })
            .collect();
    }

    // Step 2: start the index list with the query rank's own bit.
    let mut mask = query_bit;
    let mut lineage = std::collections::BTreeMap::new();
    let mut identification_rank = None;

    // Step 3: copy every rank present in the response, adding its bit.
    if matches!(response.match_type, Some(MatchType::Exact) | Some(MatchType::Fuzzy) | Some(MatchType::HigherRank)) {
        mask |= NAME_CHECKED;
        for (rank, name) in &response.lineage {
            lineage.insert(rank.clone(), name.clone());
            if let Some(bit) = bitvector::name_to_bit(rank) {
                mask |= bit;
            }
        }
    }

    // Step 4/5: effective rank shallower than query rank -> drop deeper bits.
    let is_higher_rank = response.match_type == Some(MatchType::HigherRank) || response.higher_rank_status;
    if is_higher_rank {
        if let Some(match_rank) = &response.match_rank {
            // Step 5: rank outside the ten-rank enum falls back to kingdom
            // (documented conservative default, see DESIGN.md Open Question 1).
            let effective_depth = bitvector::depth_for_rank(match_rank).unwrap_or(0);
            mask &= !bitvector::incl_bits_from_depth(effective_depth + 1);
            identification_rank = Some(match_rank.clone());
        }
    }

    // Step 7: sanity check — response rank differs from query rank without
    // declaring HIGHERRANK, and lacks a field at query_rank: treat as
    // mis-rank, drop query_rank_bit and everything deeper.
    if !is_higher_rank {
        let response_rank_matches_query = response
            .match_rank
            .as_deref()
            .map(|r| r.eq_ignore_ascii_case(&query.query_rank))
            .unwrap_or(true);
        let has_query_rank_field = response.lineage.contains_key(&query.query_rank);
        if !response_rank_matches_query && !has_query_rank_field {
            mask &= !bitvector::incl_bits_from_depth(query_depth);
        }
    }

    query
        .specimen_ids
        .iter()
        .map(|&specimen_id| HarmonizeUpdate {
            specimen_id,
            checks_mask: mask,
            lineage: lineage.clone(),
            identification_rank: identification_rank.clone(),
            taxon_key: response.taxon_key,
        })
        .collect()
}

/// Applies a batch of harmonised updates to the store: OR's the checks mask
/// and writes lineage/taxon_key columns, chunked by `MAX_BOUND_PARAMS`.
pub fn apply_updates(store: &Store, updates: &[HarmonizeUpdate]) -> Result<(), crate::errors::Error> {
    let mask_updates: Vec<(i64, u64)> = updates.iter().map(|u| (u.specimen_id, u.checks_mask)).collect();
    store.or_checks(&mask_updates)?;

    let ids: Vec<i64> = updates.iter().map(|u| u.specimen_id).collect();
    let existing = store.select_in(&ids)?;
    let mut by_id: std::collections::HashMap<i64, Specimen> = existing.into_iter().map(|s| (s.specimen_id, s)).collect();

    let mut rows = Vec::new();
    for update in updates {
        if let Some(mut row) = by_id.remove(&update.specimen_id) {
            for (rank, name) in &update.lineage {
                set_lineage_slot(&mut row, rank, name.clone());
            }
            if let Some(rank) = &update.identification_rank {
                row.identification_rank = Some(rank.clone());
            }
            if let Some(key) = update.taxon_key {
                row.taxon_key = Some(key);
            }
            rows.push(row);
        }
    }
    store.apply_updates(rows)?;
    Ok(())
}

fn set_lineage_slot(row: &mut Specimen, rank: &str, value: String) {
    match rank.to_lowercase().as_str() {
        "kingdom" => row.taxon_kingdom = Some(value),
        "phylum" => row.taxon_phylum = Some(value),
        "class" => row.taxon_class = Some(value),
        "order" => row.taxon_order = Some(value),
        "family" => row.taxon_family = Some(value),
        "subfamily" => row.taxon_subfamily = Some(value),
        "tribe" => row.taxon_tribe = Some(value),
        "genus" => row.taxon_genus = Some(value),
        "species" => row.taxon_species = Some(value),
        "subspecies" => row.taxon_subspecies = Some(value),
        _ => {}
    }
}

/// Per-call sleep used when no custom backoff is supplied. Exposed so the
/// occurrence-download poll loop can share the same policy as the
/// harmoniser's retry.
pub fn default_backoff() -> Duration {
    DEFAULT_BACKOFF
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(rank: &str) -> NameQuery {
        NameQuery { query_string: "Testus testa".into(), query_rank: rank.into(), specimen_ids: vec![1, 2] }
    }

    struct AlwaysTransportError;
    impl NameResolver for AlwaysTransportError {
        fn resolve(&self, _query: &NameQuery) -> Result<NameMatch, crate::errors::RemoteError> {
            Err(crate::errors::RemoteError::Transport("connection refused".to_string()))
        }
    }

    #[test]
    fn transport_failure_on_retry_exhaustion_leaves_record_unresolved() {
        let updates = harmonize_one(&query("species"), &AlwaysTransportError);
        assert!(updates.is_empty());
    }

    #[test]
    fn no_match_at_max_confidence_is_terminal_failure() {
        let response = NameMatch { match_type: Some(MatchType::None), confidence: Some(100), ..Default::default() };
        let updates = apply_response(&query("species"), &response);
        assert_eq!(updates.len(), 2);
        for u in updates {
            assert_eq!(u.checks_mask, NAME_CHECKED | NAME_FAILED);
            assert_eq!(u.identification_rank.as_deref(), Some("Failed"));
        }
    }

    #[test]
    fn exact_match_sets_name_checked_and_rank_bits() {
        let mut lineage = std::collections::BTreeMap::new();
        lineage.insert("genus".to_string(), "Testus".to_string());
        lineage.insert("species".to_string(), "Testus testa".to_string());
        let response = NameMatch {
            match_type: Some(MatchType::Exact),
            confidence: Some(98),
            lineage,
            taxon_key: Some(42),
            ..Default::default()
        };
        let updates = apply_response(&query("species"), &response);
        assert_eq!(updates[0].checks_mask & NAME_CHECKED, NAME_CHECKED);
        assert_eq!(updates[0].checks_mask & bitvector::INCL_SPECIES, bitvector::INCL_SPECIES);
        assert_eq!(updates[0].checks_mask & bitvector::INCL_GENUS, bitvector::INCL_GENUS);
        assert_eq!(updates[0].taxon_key, Some(42));
    }

    #[test]
    fn higher_rank_with_enum_rank_drops_deeper_bits() {
        let mut lineage = std::collections::BTreeMap::new();
        lineage.insert("genus".to_string(), "Testus".to_string());
        let response = NameMatch {
            match_type: Some(MatchType::HigherRank),
            confidence: Some(90),
            match_rank: Some("genus".to_string()),
            lineage,
            ..Default::default()
        };
        let updates = apply_response(&query("species"), &response);
        assert_eq!(updates[0].checks_mask & bitvector::INCL_SPECIES, 0);
        assert_eq!(updates[0].identification_rank.as_deref(), Some("genus"));
    }

    #[test]
    fn higher_rank_with_unknown_rank_falls_back_to_kingdom() {
        let response = NameMatch {
            match_type: Some(MatchType::HigherRank),
            confidence: Some(90),
            match_rank: Some("form".to_string()),
            ..Default::default()
        };
        let updates = apply_response(&query("species"), &response);
        // effective_depth falls back to 0 (kingdom), so everything at
        // kingdom depth and deeper is stripped from the mask.
        assert_eq!(updates[0].checks_mask & bitvector::incl_bits_from_depth(0), 0);
    }
}
