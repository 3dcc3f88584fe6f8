//! Duplicate-purge engine: within each taxon group, marks every
//! sequence that is an exact duplicate or proper substring of another,
//! longer-or-equal sequence in the same group, scaling from a handful of
//! records to hundreds of thousands via trivial/small/hard regimes.

use rayon::prelude::*;

use crate::bitvector::{DUPLICATE, FAILED_LENGTH};

pub const TRIVIAL_SIZE: usize = 5_000;
pub const SMALL_SIZE: usize = 50_000;
pub const SUBPROBLEM_SIZE_MIN: usize = 1_000;
pub const SUBPROBLEM_SIZE_MAX: usize = 5_000;
pub const SUBPROBLEM_SIZE_STEP: usize = 1_000;
pub const SIMPLE_PARALLEL_FACTOR: usize = 4;
pub const MIN_SEQUENCE_LENGTH: usize = 200;
const STRIP_CHARS: [char; 2] = ['_', 'N'];

/// One record going through the purge engine: its id and its raw sequence.
/// `nuc_san` is filled in by [`sanitize`] before any comparison.
#[derive(Debug, Clone)]
pub struct PurgeItem {
    pub specimen_id: i64,
    pub nuc_raw: String,
}

/// Outcome of purging one record: the sanitised sequence (always written)
/// and the bits to OR into `checks` (`DUPLICATE` and/or `FAILED_LENGTH`).
#[derive(Debug, Clone, PartialEq)]
pub struct PurgeResult {
    pub specimen_id: i64,
    pub nuc_san: String,
    pub mask: u64,
}

/// Sanitises a raw sequence: remove every `-`, then strip leading/trailing
/// characters in `{_, -, N}` (the `-` strip is redundant post-removal but
/// kept explicit to match the two-step reference sanitiser).
pub fn sanitize(raw: &str) -> String {
    let without_gaps: String = raw.chars().filter(|c| *c != '-').collect();
    without_gaps.trim_matches(|c| STRIP_CHARS.contains(&c) || c == '-').to_string()
}

/// The canonical sequential algorithm: sort by sanitised length descending
/// (stable, so ties keep the group's
/// original order), then linear-scan with a `seen` set of already-accepted
/// sanitised strings. A new string is a duplicate if it exactly matches a
/// seen string, or is a substring of one.
pub fn mark_duplicates(group: &[PurgeItem]) -> Vec<PurgeResult> {
    let mut sanitized: Vec<(&PurgeItem, String)> = group.iter().map(|item| (item, sanitize(&item.nuc_raw))).collect();
    sanitized.sort_by(|(_, a), (_, b)| b.chars().count().cmp(&a.chars().count()));

    let mut seen: Vec<String> = Vec::with_capacity(sanitized.len());
    let mut results = Vec::with_capacity(sanitized.len());

    for (item, nuc_san) in sanitized {
        let mut mask = 0u64;
        if nuc_san.chars().count() < MIN_SEQUENCE_LENGTH {
            mask |= FAILED_LENGTH;
        }

        let is_duplicate = seen.iter().any(|s| s == &nuc_san || s.contains(&nuc_san));
        if is_duplicate {
            mask |= DUPLICATE;
        } else {
            seen.push(nuc_san.clone());
        }

        results.push(PurgeResult { specimen_id: item.specimen_id, nuc_san, mask });
    }
    results
}

/// A duplicate-only pass local to one chunk: same algorithm, but the `seen`
/// set never crosses chunk boundaries. Used by the hard regime's sweep to
/// cheaply peel off exact and short-range duplicates before the expensive
/// full cross-group pass on the residual.
fn mark_duplicates_local(chunk: &[PurgeItem]) -> (Vec<PurgeResult>, Vec<PurgeItem>) {
    let results = mark_duplicates(chunk);
    let survivors: Vec<PurgeItem> = results
        .iter()
        .filter(|r| r.mask & DUPLICATE == 0)
        .map(|r| PurgeItem { specimen_id: r.specimen_id, nuc_raw: r.nuc_san.clone() })
        .collect();
    let duplicates: Vec<PurgeResult> = results.into_iter().filter(|r| r.mask & DUPLICATE != 0).collect();
    (duplicates, survivors)
}

fn physical_cores() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

/// Purges one taxon group, dispatching to the trivial/small/hard regime by
/// size.
pub fn purge_group(group: Vec<PurgeItem>) -> Vec<PurgeResult> {
    if group.len() <= TRIVIAL_SIZE {
        mark_duplicates(&group)
    } else if group.len() <= SMALL_SIZE {
        purge_small(group)
    } else {
        purge_hard(group)
    }
}

/// Small regime: the same sequential algorithm, but this single group is one
/// unit of work among many scheduled on the worker pool by the caller
/// ([`purge_groups`]); `mark_duplicates` itself is already the whole
/// algorithm for one group, so this is just a named alias for clarity at the
/// call site.
fn purge_small(group: Vec<PurgeItem>) -> Vec<PurgeResult> {
    mark_duplicates(&group)
}

/// Hard regime: adaptive sub-problem sweep. Chunks the
/// sanitised, length-sorted group at increasing sub-problem sizes, running a
/// duplicate-only local pass per chunk and re-chunking the survivors at each
/// step; the final survivors get one full cross-group pass.
fn purge_hard(group: Vec<PurgeItem>) -> Vec<PurgeResult> {
    let mut sanitized: Vec<PurgeItem> = {
        let mut tagged: Vec<(PurgeItem, String)> =
            group.into_iter().map(|item| { let s = sanitize(&item.nuc_raw); (item, s) }).collect();
        tagged.sort_by(|(_, a), (_, b)| b.chars().count().cmp(&a.chars().count()));
        tagged.into_iter().map(|(item, s)| PurgeItem { specimen_id: item.specimen_id, nuc_raw: s }).collect()
    };

    let mut all_duplicates: Vec<PurgeResult> = Vec::new();
    let mut size = SUBPROBLEM_SIZE_MIN;

    while size <= SUBPROBLEM_SIZE_MAX {
        if sanitized.len() <= size {
            break;
        }
        let chunks: Vec<Vec<PurgeItem>> = sanitized.chunks(size).map(|c| c.to_vec()).collect();
        let outcomes: Vec<(Vec<PurgeResult>, Vec<PurgeItem>)> = chunks.into_par_iter().map(|c| mark_duplicates_local(&c)).collect();

        let mut survivors = Vec::new();
        for (mut duplicates, mut chunk_survivors) in outcomes {
            all_duplicates.append(&mut duplicates);
            survivors.append(&mut chunk_survivors);
        }
        sanitized = survivors;
        size += SUBPROBLEM_SIZE_STEP;
    }

    // Final full cross-group pass on the residual; `nuc_raw` already holds
    // the sanitised sequence from the sweep above, so re-sanitising is a
    // no-op (sanitize is idempotent on already-sanitised input).
    let mut final_results = mark_duplicates(&sanitized);
    final_results.append(&mut all_duplicates);
    final_results
}

/// Purges every group in `groups` in parallel (one task per group), packing
/// trivial/small groups into batches of `PHYS_CORES * SIMPLE_PARALLEL_FACTOR`,
/// while hard groups each get their own task (their internal sweep is
/// already parallel).
pub fn purge_groups(groups: Vec<Vec<PurgeItem>>) -> Vec<PurgeResult> {
    let batch_size = physical_cores() * SIMPLE_PARALLEL_FACTOR;
    let (hard, simple): (Vec<_>, Vec<_>) = groups.into_iter().partition(|g| g.len() > SMALL_SIZE);

    let mut results = Vec::new();
    for batch in simple.chunks(batch_size.max(1)) {
        let batch_results: Vec<PurgeResult> =
            batch.to_vec().into_par_iter().flat_map(|g| purge_group(g)).collect();
        results.extend(batch_results);
    }
    let hard_results: Vec<PurgeResult> = hard.into_par_iter().flat_map(purge_group).collect();
    results.extend(hard_results);
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: i64, seq: &str) -> PurgeItem {
        PurgeItem { specimen_id: id, nuc_raw: seq.to_string() }
    }

    #[test]
    fn exact_duplicate_scenario() {
        let seq = "A".repeat(200);
        let group = vec![item(1, &seq), item(2, &seq)];
        let results = mark_duplicates(&group);
        let r1 = results.iter().find(|r| r.specimen_id == 1).unwrap();
        let r2 = results.iter().find(|r| r.specimen_id == 2).unwrap();
        assert_eq!(r1.mask & DUPLICATE, 0);
        assert_eq!(r2.mask & DUPLICATE, DUPLICATE);
    }

    #[test]
    fn substring_scenario_also_fails_length() {
        let long = "ACGT".repeat(51); // 204 bases, contains the short one
        let short = long[10..160].to_string(); // 150 bases, substring of long
        let group = vec![item(1, &long), item(2, &short)];
        let results = mark_duplicates(&group);
        let r2 = results.iter().find(|r| r.specimen_id == 2).unwrap();
        assert_eq!(r2.mask & DUPLICATE, DUPLICATE);
        assert_eq!(r2.mask & FAILED_LENGTH, FAILED_LENGTH);
    }

    #[test]
    fn length_filter_applies_regardless_of_uniqueness() {
        let seq = "ACGT".repeat(40); // 160 bases, unique
        let group = vec![item(1, &seq)];
        let results = mark_duplicates(&group);
        assert_eq!(results[0].mask & FAILED_LENGTH, FAILED_LENGTH);
        assert_eq!(results[0].mask & DUPLICATE, 0);
    }

    #[test]
    fn singleton_group_has_no_duplicates() {
        let group = vec![item(1, &"A".repeat(250))];
        let results = mark_duplicates(&group);
        assert_eq!(results[0].mask & DUPLICATE, 0);
    }

    #[test]
    fn sanitize_strips_gaps_and_flanking_markers() {
        assert_eq!(sanitize("--NNACGT-N--"), "ACGT");
        assert_eq!(sanitize("_ACGTN_"), "ACGT");
    }

    #[test]
    fn purge_is_idempotent() {
        let long = "ACGT".repeat(60);
        let short = long[5..150].to_string();
        let group = vec![item(1, &long), item(2, &short)];
        let first = mark_duplicates(&group);

        let reapplied: Vec<PurgeItem> =
            first.iter().map(|r| PurgeItem { specimen_id: r.specimen_id, nuc_raw: r.nuc_san.clone() }).collect();
        let second = mark_duplicates(&reapplied);

        for r in &first {
            let again = second.iter().find(|s| s.specimen_id == r.specimen_id).unwrap();
            assert_eq!(r.mask & (DUPLICATE | FAILED_LENGTH), again.mask & (DUPLICATE | FAILED_LENGTH));
        }
    }

    #[test]
    fn hard_regime_matches_sequential_reference_on_residual() {
        // Build a group just over SMALL_SIZE isn't practical in a unit test;
        // exercise the hard sweep directly on a small synthetic group to
        // confirm duplicates detected locally match the sequential result.
        let seq = "A".repeat(300);
        let mut group = vec![item(1, &seq)];
        for id in 2..=50 {
            group.push(item(id, &seq));
        }
        let sequential = mark_duplicates(&group);
        let hard = purge_hard(group);

        let mut seq_dupe_ids: Vec<i64> =
            sequential.iter().filter(|r| r.mask & DUPLICATE != 0).map(|r| r.specimen_id).collect();
        let mut hard_dupe_ids: Vec<i64> = hard.iter().filter(|r| r.mask & DUPLICATE != 0).map(|r| r.specimen_id).collect();
        seq_dupe_ids.sort();
        hard_dupe_ids.sort();
        assert_eq!(seq_dupe_ids, hard_dupe_ids);
    }
}
