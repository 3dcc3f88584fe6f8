//! Curate orchestrator: runs the full harmonise -> purge -> mark -> select ->
//! classify -> finalize sequence in the same "chunk, dispatch, collect,
//! progress-bar" shape `loggers::sequences::import` uses for its own batch
//! pipeline.

use std::path::PathBuf;
use std::time::Duration;

use crate::bitvector;
use crate::errors::Error;
use crate::geo::client::OccurrenceClient;
use crate::geo::koppen::KoppenLookup;
use crate::harmonize::client::NameResolver;
use crate::harmonize::{self, HarmonizeUpdate};
use crate::markers;
use crate::purge::{self, PurgeItem, PurgeResult};
use crate::store::models::Specimen;
use crate::store::{ClimateStore, Store};
use crate::{classify, geo};

/// Everything the orchestrator needs to run one curation pass: the two
/// stores, the three external-service boundaries, and the tunables a caller
/// might want to override from the CLI.
pub struct Orchestrator<'a> {
    pub store: &'a Store,
    pub climate: &'a ClimateStore,
    pub resolver: &'a dyn NameResolver,
    pub occurrence_client: &'a dyn OccurrenceClient,
    pub koppen: &'a dyn KoppenLookup,
    pub classifier_workdir: PathBuf,
    pub harmonizer_workers: usize,
    pub geo_batch_size: usize,
    pub geo_poll_interval: Duration,
}

impl<'a> Orchestrator<'a> {
    /// Step 1: for ranks descending (subspecies -> kingdom), harmonise every
    /// still-unresolved group and apply the updates. Naturally scoped to
    /// new/changed records, since `query_objects_at_depth` only considers
    /// `review = true` rows and `review` is cleared once a record's name is
    /// resolved (step 6).
    pub fn harmonize_all_ranks(&self) -> Result<(), Error> {
        for depth in (0..bitvector::RANKS.len()).rev() {
            let queries = harmonize::query_objects_at_depth(self.store, depth)?;
            if queries.is_empty() {
                continue;
            }
            tracing::info!(depth, queries = queries.len(), "harmonising rank");
            let bar = crate::progress::new_spinner(&format!("Harmonising {}", bitvector::RANKS[depth].0));
            let updates: Vec<HarmonizeUpdate> =
                harmonize::harmonize_all(&queries, self.resolver, self.harmonizer_workers);
            harmonize::apply_updates(self.store, &updates)?;
            bar.finish();
        }
        Ok(())
    }

    /// Step 2: purge duplicates within every taxon group named in
    /// `taxon_keys`.
    pub fn purge_taxa(&self, taxon_keys: &[i64]) -> Result<(), Error> {
        let mut groups = Vec::with_capacity(taxon_keys.len());
        for &taxon_key in taxon_keys {
            let records = self.store.records_for_taxon(taxon_key)?;
            let items: Vec<PurgeItem> =
                records.into_iter().map(|r| PurgeItem { specimen_id: r.specimen_id, nuc_raw: r.nuc_raw }).collect();
            if !items.is_empty() {
                groups.push(items);
            }
        }
        tracing::info!(groups = groups.len(), "purging duplicate groups");
        let bar = crate::progress::new_spinner("Purging duplicate sequences");
        let results = purge::purge_groups(groups);
        bar.finish();
        self.apply_purge_results(&results)
    }

    /// Step 2 (build variant): purge every distinct taxon in the store.
    pub fn purge_all(&self) -> Result<(), Error> {
        let taxon_keys = self.store.all_distinct_taxon_keys()?;
        self.purge_taxa(&taxon_keys)
    }

    fn apply_purge_results(&self, results: &[PurgeResult]) -> Result<(), Error> {
        let mask_updates: Vec<(i64, u64)> = results.iter().filter(|r| r.mask != 0).map(|r| (r.specimen_id, r.mask)).collect();
        if !mask_updates.is_empty() {
            self.store.or_checks(&mask_updates)?;
        }

        let ids: Vec<i64> = results.iter().map(|r| r.specimen_id).collect();
        let existing = self.store.select_in(&ids)?;
        let mut by_id: std::collections::HashMap<i64, Specimen> =
            existing.into_iter().map(|s| (s.specimen_id, s)).collect();

        let mut rows = Vec::with_capacity(results.len());
        for result in results {
            if let Some(mut row) = by_id.remove(&result.specimen_id) {
                row.nuc_san = Some(result.nuc_san.clone());
                rows.push(row);
            }
        }
        self.store.apply_updates(rows)
    }

    /// Step 3: hybrid marker.
    pub fn mark_hybrids(&self) -> Result<usize, Error> {
        markers::mark_hybrids(self.store)
    }

    /// Step 4: SELECTED for every record satisfying the golden predicate.
    pub fn select_golden(&self) -> Result<usize, Error> {
        self.store.mark_selected_where_golden()
    }

    /// Step 5: geo evaluation.
    pub fn run_geo_evaluation(&self) -> Result<(), Error> {
        geo::run_geo_evaluation(
            self.store,
            self.climate,
            self.occurrence_client,
            self.geo_batch_size,
            self.geo_poll_interval,
            |d| std::thread::sleep(d),
            self.koppen,
        )
    }

    /// Step 5 (continued): classifier bridge, marks `BAD_CLASSIFICATION`.
    pub fn run_classifier_bridge(&self) -> Result<usize, Error> {
        classify::run_classifier_bridge(self.store, &self.classifier_workdir)
    }

    /// Step 6/7: clear `review` for resolved records, set `include` for
    /// every `SELECTED` record.
    pub fn finalize(&self) -> Result<(), Error> {
        let cleared = self.store.clear_review_for_name_checked()?;
        let included = self.store.set_include_for_selected()?;
        tracing::info!(cleared, included, "finalized curation pass");
        Ok(())
    }

    /// Full build-mode curation: harmonise everything, purge every taxon,
    /// mark hybrids, select golden records, run geo evaluation and the
    /// classifier bridge, then finalize.
    pub fn curate(&self) -> Result<(), Error> {
        self.harmonize_all_ranks()?;
        self.purge_all()?;
        self.mark_hybrids()?;
        self.select_golden()?;
        self.run_geo_evaluation()?;
        self.run_classifier_bridge()?;
        self.finalize()?;
        Ok(())
    }

    /// Update-mode curation: before re-running the pipeline, clears every
    /// non-`LOC_*` bit and unsets `include` for records under
    /// `changed_taxon_keys`, then scopes the purge/classifier passes to just
    /// those taxa (resolved Open Question 2 — same scope as purge).
    pub fn curate_update(&self, changed_taxon_keys: &[i64]) -> Result<(), Error> {
        self.reset_for_update(changed_taxon_keys)?;
        self.harmonize_all_ranks()?;
        self.purge_taxa(changed_taxon_keys)?;
        self.mark_hybrids()?;
        self.select_golden()?;
        self.run_geo_evaluation()?;
        self.run_classifier_bridge()?;
        self.finalize()?;
        Ok(())
    }

    fn reset_for_update(&self, taxon_keys: &[i64]) -> Result<(), Error> {
        let clear_mask = bitvector::update_clear_mask();
        for &taxon_key in taxon_keys {
            let records = self.store.records_for_taxon(taxon_key)?;
            let ids: Vec<i64> = records.iter().map(|r| r.specimen_id).collect();
            if ids.is_empty() {
                continue;
            }
            self.store.and_checks(&ids, clear_mask)?;
            self.store.set_include(&ids, false)?;
        }
        Ok(())
    }
}
