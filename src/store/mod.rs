//! Record store: two tables in the primary SQLite file (`specimen`,
//! `processing_input`) plus a separate climate store file, behind batched
//! read/update primitives bounded by [`MAX_BOUND_PARAMS`].

pub mod models;
pub mod schema;
pub mod staging;

use std::path::Path;

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use crate::errors::Error;
use models::{ClimateRecord, Specimen};
use schema::{climate_data, specimen};

/// Statement-parameter ceiling the underlying engine enforces; every batched
/// operation chunks its parameter list to stay under it. Matches the
/// original system's `SQL_SAVE_NUM_VARS`.
pub const MAX_BOUND_PARAMS: usize = 950;

/// Column count of [`models::Specimen`] — one bound parameter per column per
/// row in a `replace_into(...).values(...)` statement.
const SPECIMEN_COLUMNS: usize = 26;

pub type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;
pub type SqliteConn = PooledConnection<ConnectionManager<SqliteConnection>>;

const PRIMARY_MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/primary");
const CLIMATE_MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/climate");

fn build_pool(path: &Path) -> Result<SqlitePool, Error> {
    let manager = ConnectionManager::<SqliteConnection>::new(path.to_string_lossy().to_string());
    let pool = Pool::builder().build(manager)?;
    // SQLite enforces foreign keys per-connection; every checked-out
    // connection needs this set, so a `CustomizeConnection` would be the
    // long-term home for it, but a single pragma at pool construction time
    // is sufficient for the single-writer access pattern this store uses.
    pool.get()?.batch_execute("PRAGMA foreign_keys = ON;")?;
    Ok(pool)
}

/// Splits `items` into chunks no larger than [`MAX_BOUND_PARAMS`] divided by
/// `params_per_item` (at least 1 chunk, never an empty chunk).
pub fn chunk_for_params<T>(items: &[T], params_per_item: usize) -> impl Iterator<Item = &[T]> {
    let per_chunk = (MAX_BOUND_PARAMS / params_per_item.max(1)).max(1);
    items.chunks(per_chunk)
}

/// The primary store: `specimen` (compile-time schema) plus `processing_input`
/// (runtime schema-driven, see [`staging`]).
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens an existing store file. Fails if the file does not exist.
    pub fn open(path: &Path) -> Result<Self, Error> {
        if !path.exists() {
            return Err(Error::StoreNotFound(path.display().to_string()));
        }
        let pool = build_pool(path)?;
        Ok(Self { pool })
    }

    /// Creates a new, empty store file and runs schema migrations. Fails if
    /// the file already exists.
    pub fn create_empty(path: &Path) -> Result<Self, Error> {
        if path.exists() {
            return Err(Error::StoreAlreadyExists(path.display().to_string()));
        }
        let pool = build_pool(path)?;
        {
            let mut conn = pool.get()?;
            conn.run_pending_migrations(PRIMARY_MIGRATIONS).map_err(Error::Migration)?;
        }
        Ok(Self { pool })
    }

    pub fn conn(&self) -> Result<SqliteConn, Error> {
        Ok(self.pool.get()?)
    }

    /// Inserts or replaces `rows` in commits of `chunk` rows (each chunk is
    /// atomic: it either commits fully or rolls back, never partially).
    /// `REPLACE` rather than plain `INSERT` so update-mode's re-ingested
    /// "changed" rows overwrite the existing record instead of conflicting
    /// on `specimen_id`, matching the staging table's own `INSERT OR
    /// REPLACE` convention.
    ///
    /// `chunk` bounds the atomic-commit unit, but a single `VALUES (...), ...`
    /// statement over `chunk` rows of `Specimen` (26 columns) would itself
    /// bind far more than [`MAX_BOUND_PARAMS`], so each commit is further
    /// split into `MAX_BOUND_PARAMS`-sized sub-statements within the same
    /// transaction.
    pub fn bulk_insert(&self, rows: &[Specimen], chunk: usize) -> Result<(), Error> {
        let mut conn = self.conn()?;
        for batch in rows.chunks(chunk.max(1)) {
            conn.transaction(|conn| {
                for sub_batch in chunk_for_params(batch, SPECIMEN_COLUMNS) {
                    diesel::replace_into(specimen::table).values(sub_batch).execute(conn)?;
                }
                Ok::<_, Error>(())
            })?;
        }
        Ok(())
    }

    /// Looks up `(hash, taxon_key, checks)` for every id in `ids` that
    /// already has a row, chunked by [`MAX_BOUND_PARAMS`]. Used by
    /// update-mode ingest both to classify each incoming row as
    /// new/unchanged/changed (spec.md §4.3: "look up existing
    /// `(taxon_key, hash)` by `specimen_id`") and to carry a changed row's
    /// `LOC_*` bits forward across the re-ingest.
    pub fn existing_hash_and_taxon(
        &self,
        ids: &[i64],
    ) -> Result<std::collections::HashMap<i64, (String, Option<i64>, u64)>, Error> {
        let mut conn = self.conn()?;
        let mut out = std::collections::HashMap::with_capacity(ids.len());
        for batch in chunk_for_params(ids, 1) {
            let rows: Vec<(i64, String, Option<i64>, i64)> = specimen::table
                .filter(specimen::specimen_id.eq_any(batch.to_vec()))
                .select((specimen::specimen_id, specimen::hash, specimen::taxon_key, specimen::checks))
                .load(&mut conn)?;
            for (id, hash, taxon_key, checks) in rows {
                out.insert(id, (hash, taxon_key, checks as u64));
            }
        }
        Ok(out)
    }

    /// Fetches specimens whose id is in `ids`, automatically chunking the
    /// `IN (?, ...)` clause by [`MAX_BOUND_PARAMS`].
    pub fn select_in(&self, ids: &[i64]) -> Result<Vec<Specimen>, Error> {
        let mut conn = self.conn()?;
        let mut out = Vec::with_capacity(ids.len());
        for batch in chunk_for_params(ids, 1) {
            let mut rows = specimen::table
                .filter(specimen::specimen_id.eq_any(batch.to_vec()))
                .select(Specimen::as_select())
                .load(&mut conn)?;
            out.append(&mut rows);
        }
        Ok(out)
    }

    /// Loads every specimen row with `review = true` whose deepest non-null
    /// lineage slot is at `depth` (0 = kingdom .. 9 = subspecies). Used by
    /// the harmoniser to build its per-rank query objects.
    pub fn unresolved_at_depth(&self, depth: usize) -> Result<Vec<Specimen>, Error> {
        let mut conn = self.conn()?;
        let rows = specimen::table
            .filter(specimen::review.eq(true))
            .select(Specimen::as_select())
            .load(&mut conn)?;
        Ok(rows.into_iter().filter(|r| r.deepest_lineage_depth() == Some(depth)).collect())
    }

    /// Applies a batch of `(id, mask)` OR-mask updates — the idempotent "OR
    /// bit mask into checks" primitive every engine writes through — chunked
    /// by [`MAX_BOUND_PARAMS`], each chunk committed once. Raw SQL rather
    /// than the query DSL: bitwise operators aren't portable across diesel's
    /// backends, only across the SQL the backend actually speaks.
    pub fn or_checks(&self, updates: &[(i64, u64)]) -> Result<(), Error> {
        let mut conn = self.conn()?;
        for batch in chunk_for_params(updates, 2) {
            conn.transaction(|conn| {
                for (id, mask) in batch {
                    diesel::sql_query("UPDATE specimen SET checks = checks | ? WHERE specimen_id = ?")
                        .bind::<diesel::sql_types::BigInt, _>(*mask as i64)
                        .bind::<diesel::sql_types::BigInt, _>(*id)
                        .execute(conn)?;
                }
                Ok::<_, Error>(())
            })?;
        }
        Ok(())
    }

    /// Clears `mask` from every record in `ids` (used only by the
    /// update-reset path with `update_clear_mask`).
    pub fn and_checks(&self, ids: &[i64], mask: u64) -> Result<(), Error> {
        let mut conn = self.conn()?;
        for batch in chunk_for_params(ids, 1) {
            conn.transaction(|conn| {
                for id in batch {
                    diesel::sql_query("UPDATE specimen SET checks = checks & ? WHERE specimen_id = ?")
                        .bind::<diesel::sql_types::BigInt, _>(mask as i64)
                        .bind::<diesel::sql_types::BigInt, _>(*id)
                        .execute(conn)?;
                }
                Ok::<_, Error>(())
            })?;
        }
        Ok(())
    }

    /// Applies arbitrary column updates to specific records (e.g. harmoniser
    /// lineage writes, purge `nuc_san`), chunked and committed per batch.
    pub fn apply_updates(&self, updates: Vec<Specimen>) -> Result<(), Error> {
        let mut conn = self.conn()?;
        for batch in updates.chunks((MAX_BOUND_PARAMS / 24).max(1)) {
            conn.transaction(|conn| {
                for row in batch {
                    diesel::update(specimen::table.filter(specimen::specimen_id.eq(row.specimen_id)))
                        .set(row)
                        .execute(conn)?;
                }
                Ok::<_, Error>(())
            })?;
        }
        Ok(())
    }

    /// Distinct taxon_keys among records whose `INCL_SPECIES` bit is set and
    /// `LOC_CHECKED` is clear (candidates for the geo evaluator).
    pub fn taxon_keys_needing_geo(&self) -> Result<Vec<i64>, Error> {
        use crate::bitvector::{INCL_SPECIES, LOC_CHECKED};
        #[derive(diesel::QueryableByName)]
        struct Row {
            #[diesel(sql_type = diesel::sql_types::Nullable<diesel::sql_types::BigInt>)]
            taxon_key: Option<i64>,
        }
        let mut conn = self.conn()?;
        let rows: Vec<Row> = diesel::sql_query(
            "SELECT DISTINCT taxon_key FROM specimen WHERE (checks & ?) = ? AND (checks & ?) = 0",
        )
        .bind::<diesel::sql_types::BigInt, _>(INCL_SPECIES as i64)
        .bind::<diesel::sql_types::BigInt, _>(INCL_SPECIES as i64)
        .bind::<diesel::sql_types::BigInt, _>(LOC_CHECKED as i64)
        .load(&mut conn)?;
        Ok(rows.into_iter().filter_map(|r| r.taxon_key).collect())
    }

    pub fn all_distinct_taxon_keys(&self) -> Result<Vec<i64>, Error> {
        let mut conn = self.conn()?;
        let rows: Vec<Option<i64>> = specimen::table.select(specimen::taxon_key).distinct().load(&mut conn)?;
        Ok(rows.into_iter().flatten().collect())
    }

    pub fn records_for_taxon(&self, taxon_key: i64) -> Result<Vec<Specimen>, Error> {
        let mut conn = self.conn()?;
        Ok(specimen::table
            .filter(specimen::taxon_key.eq(taxon_key))
            .select(Specimen::as_select())
            .load(&mut conn)?)
    }

    pub fn selected(&self) -> Result<Vec<Specimen>, Error> {
        use crate::bitvector::SELECTED;
        let mut conn = self.conn()?;
        Ok(specimen::table
            .filter(diesel::dsl::sql::<diesel::sql_types::Bool>(&format!("(checks & {SELECTED}) = {SELECTED}")))
            .select(Specimen::as_select())
            .load(&mut conn)?)
    }

    /// Creates a secondary index on `column` if it doesn't already exist.
    /// `column` is always an internal constant, never user input.
    pub fn index_on(&self, column: &str) -> Result<(), Error> {
        let mut conn = self.conn()?;
        conn.batch_execute(&format!("CREATE INDEX IF NOT EXISTS idx_specimen_{column} ON specimen ({column})"))?;
        Ok(())
    }

    /// Writes `(specimen_id, geo_info, checks_or_mask)` triples from the geo
    /// evaluator: sets `geo_info` and ORs `mask` into `checks`.
    pub fn apply_geo_scores(&self, updates: &[(i64, f64, u64)]) -> Result<(), Error> {
        let mut conn = self.conn()?;
        for batch in chunk_for_params(updates, 3) {
            conn.transaction(|conn| {
                for (id, score, mask) in batch {
                    diesel::sql_query("UPDATE specimen SET geo_info = ?, checks = checks | ? WHERE specimen_id = ?")
                        .bind::<diesel::sql_types::Double, _>(*score)
                        .bind::<diesel::sql_types::BigInt, _>(*mask as i64)
                        .bind::<diesel::sql_types::BigInt, _>(*id)
                        .execute(conn)?;
                }
                Ok::<_, Error>(())
            })?;
        }
        Ok(())
    }

    /// Sets `include` for every record in `ids`, chunked.
    pub fn set_include(&self, ids: &[i64], value: bool) -> Result<(), Error> {
        let mut conn = self.conn()?;
        for batch in chunk_for_params(ids, 1) {
            conn.transaction(|conn| {
                diesel::update(specimen::table.filter(specimen::specimen_id.eq_any(batch.to_vec())))
                    .set(specimen::include.eq(value))
                    .execute(conn)
            })?;
        }
        Ok(())
    }

    /// ORs [`crate::bitvector::SELECTED`] into every record satisfying the
    /// golden predicate. Returns the number of records touched.
    pub fn mark_selected_where_golden(&self) -> Result<usize, Error> {
        let (read_mask, golden_value) = crate::bitvector::read_mask_and_value_for_golden();
        let mut conn = self.conn()?;
        let n = diesel::sql_query("UPDATE specimen SET checks = checks | ? WHERE (checks & ?) = ?")
            .bind::<diesel::sql_types::BigInt, _>(crate::bitvector::SELECTED as i64)
            .bind::<diesel::sql_types::BigInt, _>(read_mask as i64)
            .bind::<diesel::sql_types::BigInt, _>(golden_value as i64)
            .execute(&mut conn)?;
        Ok(n)
    }

    /// Clears `review` for every record with `NAME_CHECKED` set. Returns the
    /// number of records touched.
    pub fn clear_review_for_name_checked(&self) -> Result<usize, Error> {
        use crate::bitvector::NAME_CHECKED;
        let mut conn = self.conn()?;
        let n = diesel::sql_query("UPDATE specimen SET review = 0 WHERE (checks & ?) = ? AND review = 1")
            .bind::<diesel::sql_types::BigInt, _>(NAME_CHECKED as i64)
            .bind::<diesel::sql_types::BigInt, _>(NAME_CHECKED as i64)
            .execute(&mut conn)?;
        Ok(n)
    }

    /// Sets `include = true` for every `SELECTED` record. Returns the number
    /// of records touched.
    pub fn set_include_for_selected(&self) -> Result<usize, Error> {
        use crate::bitvector::SELECTED;
        let mut conn = self.conn()?;
        let n = diesel::sql_query("UPDATE specimen SET include = 1 WHERE (checks & ?) = ?")
            .bind::<diesel::sql_types::BigInt, _>(SELECTED as i64)
            .bind::<diesel::sql_types::BigInt, _>(SELECTED as i64)
            .execute(&mut conn)?;
        Ok(n)
    }
}

/// The climate store: a single `climate_data` table in its own file.
pub struct ClimateStore {
    pool: SqlitePool,
}

impl ClimateStore {
    pub fn open(path: &Path) -> Result<Self, Error> {
        if !path.exists() {
            return Err(Error::StoreNotFound(path.display().to_string()));
        }
        Ok(Self { pool: build_pool(path)? })
    }

    pub fn create_empty(path: &Path) -> Result<Self, Error> {
        if path.exists() {
            return Err(Error::StoreAlreadyExists(path.display().to_string()));
        }
        let pool = build_pool(path)?;
        {
            let mut conn = pool.get()?;
            conn.run_pending_migrations(CLIMATE_MIGRATIONS).map_err(Error::Migration)?;
        }
        Ok(Self { pool })
    }

    /// Opens the store if it exists, otherwise creates it. The geo evaluator
    /// treats the climate store as an always-available side file.
    pub fn open_or_create(path: &Path) -> Result<Self, Error> {
        if path.exists() { Self::open(path) } else { Self::create_empty(path) }
    }

    pub fn get(&self, taxon_key: i64) -> Result<Option<ClimateRecord>, Error> {
        let mut conn = self.pool.get()?;
        Ok(climate_data::table
            .filter(climate_data::taxon_key.eq(taxon_key))
            .select(ClimateRecord::as_select())
            .first(&mut conn)
            .optional()?)
    }

    /// `INSERT OR REPLACE` for one taxon's aggregated climate record.
    pub fn upsert(&self, record: &ClimateRecord) -> Result<(), Error> {
        let mut conn = self.pool.get()?;
        diesel::replace_into(climate_data::table).values(record).execute(&mut conn)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitvector::{INCL_SPECIES, NAME_CHECKED};
    use chrono::NaiveDate;

    fn blank_specimen(id: i64, taxon_key: Option<i64>) -> Specimen {
        Specimen {
            specimen_id: id,
            nuc_raw: "ACGT".into(),
            nuc_san: None,
            hash: format!("hash-{id}"),
            last_updated: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            review: true,
            include: false,
            taxon_key,
            taxon_kingdom: None,
            taxon_phylum: None,
            taxon_class: None,
            taxon_order: None,
            taxon_family: None,
            taxon_subfamily: None,
            taxon_tribe: None,
            taxon_genus: None,
            taxon_species: None,
            taxon_subspecies: None,
            identification_rank: None,
            country_iso: None,
            lat: None,
            lon: None,
            kg_zone: None,
            checks: 0,
            geo_info: None,
            processing_info: None,
        }
    }

    #[test]
    fn create_empty_then_open_again_fails_and_succeeds_appropriately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.sqlite3");

        assert!(matches!(Store::open(&path), Err(Error::StoreNotFound(_))));
        let _store = Store::create_empty(&path).unwrap();
        assert!(matches!(Store::create_empty(&path), Err(Error::StoreAlreadyExists(_))));
        assert!(Store::open(&path).is_ok());
    }

    #[test]
    fn bulk_insert_and_select_in_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::create_empty(&dir.path().join("store.sqlite3")).unwrap();

        let rows: Vec<Specimen> = (1..=10).map(|id| blank_specimen(id, Some(1))).collect();
        store.bulk_insert(&rows, 4).unwrap();

        let fetched = store.select_in(&[3, 7, 42]).unwrap();
        let mut ids: Vec<i64> = fetched.iter().map(|s| s.specimen_id).collect();
        ids.sort();
        assert_eq!(ids, vec![3, 7]);
    }

    #[test]
    fn bulk_insert_chunks_past_max_bound_params_within_one_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::create_empty(&dir.path().join("store.sqlite3")).unwrap();

        // One `chunk` of rows whose bound-parameter count (rows * 26 columns)
        // comfortably exceeds MAX_BOUND_PARAMS, exercising the sub-batching
        // inside a single transaction.
        let n = (MAX_BOUND_PARAMS / SPECIMEN_COLUMNS) * 3 + 5;
        let rows: Vec<Specimen> = (1..=n as i64).map(|id| blank_specimen(id, Some(1))).collect();
        store.bulk_insert(&rows, n).unwrap();

        let ids: Vec<i64> = (1..=n as i64).collect();
        let fetched = store.select_in(&ids).unwrap();
        assert_eq!(fetched.len(), n);
    }

    #[test]
    fn select_in_chunks_past_max_bound_params() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::create_empty(&dir.path().join("store.sqlite3")).unwrap();

        let n = MAX_BOUND_PARAMS * 2 + 17;
        let rows: Vec<Specimen> = (1..=n as i64).map(|id| blank_specimen(id, Some(1))).collect();
        store.bulk_insert(&rows, 900).unwrap();

        let ids: Vec<i64> = (1..=n as i64).collect();
        let fetched = store.select_in(&ids).unwrap();
        assert_eq!(fetched.len(), n);
    }

    #[test]
    fn or_checks_and_golden_selection() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::create_empty(&dir.path().join("store.sqlite3")).unwrap();
        store.bulk_insert(&[blank_specimen(1, Some(1))], 10).unwrap();

        store.or_checks(&[(1, NAME_CHECKED | INCL_SPECIES)]).unwrap();
        let touched = store.mark_selected_where_golden().unwrap();
        assert_eq!(touched, 1);

        let row = store.select_in(&[1]).unwrap().into_iter().next().unwrap();
        assert_eq!(row.checks as u64 & crate::bitvector::SELECTED, crate::bitvector::SELECTED);
    }

    #[test]
    fn and_checks_clears_only_the_given_mask() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::create_empty(&dir.path().join("store.sqlite3")).unwrap();
        let mut row = blank_specimen(1, Some(1));
        row.checks = (NAME_CHECKED | INCL_SPECIES | crate::bitvector::LOC_CHECKED) as i64;
        store.bulk_insert(&[row], 10).unwrap();

        store.and_checks(&[1], crate::bitvector::update_clear_mask()).unwrap();
        let fetched = store.select_in(&[1]).unwrap().into_iter().next().unwrap();
        assert_eq!(fetched.checks as u64, crate::bitvector::LOC_CHECKED);
    }

    #[test]
    fn existing_hash_and_taxon_reflects_inserted_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::create_empty(&dir.path().join("store.sqlite3")).unwrap();
        store.bulk_insert(&[blank_specimen(1, Some(7))], 10).unwrap();

        let found = store.existing_hash_and_taxon(&[1, 99]).unwrap();
        assert_eq!(found.get(&1), Some(&("hash-1".to_string(), Some(7), 0u64)));
        assert_eq!(found.get(&99), None);
    }

    #[test]
    fn records_for_taxon_and_all_distinct_taxon_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::create_empty(&dir.path().join("store.sqlite3")).unwrap();
        store
            .bulk_insert(&[blank_specimen(1, Some(1)), blank_specimen(2, Some(1)), blank_specimen(3, Some(2))], 10)
            .unwrap();

        let group = store.records_for_taxon(1).unwrap();
        assert_eq!(group.len(), 2);

        let mut keys = store.all_distinct_taxon_keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec![1, 2]);
    }
}
