mod bitvector;
mod classify;
mod errors;
mod export;
mod geo;
mod harmonize;
mod ingest;
mod markers;
mod orchestrator;
mod progress;
mod purge;
mod retry;
mod store;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use errors::Error;
use geo::client::{GbifOccurrenceClient, OccurrenceClient};
use geo::koppen::{KoppenLookup, TableKoppenLookup};
use harmonize::client::NameResolver;
use harmonize::gbif::GbifResolver;
use orchestrator::Orchestrator;
use store::{ClimateStore, Store};
use tracing_subscriber::fmt::format::FmtSpan;

/// Curates raw DNA barcode dumps into a reviewed, exportable reference store.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short = 'v', long = "verbose", global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a vendor TSV and run the full curation pipeline over it.
    Build {
        store: PathBuf,
        climate_store: PathBuf,
        marker: String,
        tsv: PathBuf,
        schema: PathBuf,
    },

    /// Ingest a vendor TSV against an existing store, curating only what changed.
    Update {
        store: PathBuf,
        climate_store: PathBuf,
        marker: String,
        tsv: PathBuf,
        schema: PathBuf,
    },

    /// Re-run the curation pipeline over an existing store without ingesting.
    Review { store: PathBuf, climate_store: PathBuf, marker: String },

    /// Run an arbitrary SQL statement against a store and print the result.
    Query {
        store: PathBuf,
        climate_store: PathBuf,
        marker: String,
        sql: String,

        /// Write output to a file instead of stdout.
        #[arg(short = 'o', long = "out")]
        out: Option<PathBuf>,

        /// Output format.
        #[arg(short = 'f', long = "format", value_enum, default_value = "tsv")]
        format: QueryFormat,
    },

    /// Export curated records in one of several output shapes.
    Export {
        store: PathBuf,
        climate_store: PathBuf,
        marker: String,
        #[arg(value_enum)]
        kind: ExportKind,
        out: PathBuf,
    },

    /// Populate the climate store for every taxon awaiting geo evaluation.
    BuildLocationDb {
        store: PathBuf,
        climate_store: PathBuf,
        marker: String,

        /// Taxon keys per occurrence-download batch.
        #[arg(short = 's', long = "batch", default_value_t = geo::GEO_DEFAULT_BATCH)]
        batch: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum QueryFormat {
    Tsv,
    Csv,
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportKind {
    Fasta,
    Classifier,
    Tsv,
    Csv,
}

fn gbif_resolver() -> GbifResolver {
    GbifResolver::new()
}

fn gbif_occurrence_client() -> Result<GbifOccurrenceClient, Error> {
    let user = std::env::var("GBIF_USER")
        .map_err(|_| errors::ParseError::InvalidValue("GBIF_USER is not set".to_string()))?;
    let password = std::env::var("GBIF_PWD")
        .map_err(|_| errors::ParseError::InvalidValue("GBIF_PWD is not set".to_string()))?;
    Ok(GbifOccurrenceClient::new(user, password))
}

fn orchestrator_for<'a>(
    store: &'a Store,
    climate: &'a ClimateStore,
    resolver: &'a dyn NameResolver,
    occurrence_client: &'a dyn OccurrenceClient,
    koppen: &'a dyn KoppenLookup,
    geo_batch_size: usize,
) -> Orchestrator<'a> {
    Orchestrator {
        store,
        climate,
        resolver,
        occurrence_client,
        koppen,
        classifier_workdir: std::env::temp_dir().join("barcode-curator-classify"),
        harmonizer_workers: harmonize::DEFAULT_WORKERS,
        geo_batch_size,
        geo_poll_interval: retry::DOWNLOAD_POLL_INTERVAL,
    }
}

fn run_build(tsv: PathBuf, schema: PathBuf, store_path: PathBuf, climate_path: PathBuf, marker: String) -> Result<(), Error> {
    let store = Store::create_empty(&store_path)?;
    let climate = ClimateStore::open_or_create(&climate_path)?;
    let koppen = TableKoppenLookup;
    let today = chrono::Local::now().date_naive();

    let count = ingest::build(&store, &tsv, &schema, &marker, &koppen, today)?;
    tracing::info!(count, "ingested rows");

    let resolver = gbif_resolver();
    let occurrence_client = gbif_occurrence_client()?;
    let orchestrator = orchestrator_for(&store, &climate, &resolver, &occurrence_client, &koppen, geo::GEO_DEFAULT_BATCH);
    orchestrator.curate()
}

fn run_update(tsv: PathBuf, schema: PathBuf, store_path: PathBuf, climate_path: PathBuf, marker: String) -> Result<(), Error> {
    let store = Store::open(&store_path)?;
    let climate = ClimateStore::open_or_create(&climate_path)?;
    let koppen = TableKoppenLookup;
    let today = chrono::Local::now().date_naive();

    let outcome = ingest::update(&store, &tsv, &schema, &marker, &koppen, today)?;
    tracing::info!(new = outcome.new_ids.len(), changed = outcome.changed.len(), "ingested update");

    let resolver = gbif_resolver();
    let occurrence_client = gbif_occurrence_client()?;
    let orchestrator = orchestrator_for(&store, &climate, &resolver, &occurrence_client, &koppen, geo::GEO_DEFAULT_BATCH);

    // Re-resolve names for every still-unresolved record first: new rows
    // carry no taxon_key yet, and changed rows were re-ingested with a
    // cleared one, so the taxon_key scope for the rest of the pipeline only
    // exists once harmonisation has run.
    orchestrator.harmonize_all_ranks()?;

    let mut affected: Vec<i64> = outcome.new_ids.clone();
    affected.extend(outcome.changed.iter().map(|(id, _)| *id));
    let affected_taxon_keys: Vec<i64> = {
        let mut keys: Vec<i64> = store.select_in(&affected)?.into_iter().filter_map(|s| s.taxon_key).collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    };

    orchestrator.purge_taxa(&affected_taxon_keys)?;
    orchestrator.mark_hybrids()?;
    orchestrator.select_golden()?;
    orchestrator.run_geo_evaluation()?;
    orchestrator.run_classifier_bridge()?;
    orchestrator.finalize()
}

fn run_review(store_path: PathBuf, climate_path: PathBuf, marker: String) -> Result<(), Error> {
    let _span = tracing::info_span!("review", marker = marker.as_str()).entered();
    let store = Store::open(&store_path)?;
    let climate = ClimateStore::open_or_create(&climate_path)?;
    let koppen = TableKoppenLookup;

    let resolver = gbif_resolver();
    let occurrence_client = gbif_occurrence_client()?;
    let orchestrator = orchestrator_for(&store, &climate, &resolver, &occurrence_client, &koppen, geo::GEO_DEFAULT_BATCH);
    orchestrator.curate()
}

fn run_query(store_path: PathBuf, sql: String, out: Option<PathBuf>, format: QueryFormat) -> Result<(), Error> {
    // `climate_store`/`marker` are accepted for CLI uniformity (every
    // invocation takes the same three leading positionals) but an ad-hoc
    // SQL query has no use for either.
    if !store_path.exists() {
        return Err(Error::StoreNotFound(store_path.display().to_string()));
    }
    let conn = rusqlite::Connection::open(&store_path)
        .map_err(|err| errors::ParseError::Schema(format!("failed to open store: {err}")))?;
    let mut statement =
        conn.prepare(&sql).map_err(|err| errors::ParseError::Schema(format!("invalid SQL: {err}")))?;
    let column_names: Vec<String> = statement.column_names().iter().map(|s| s.to_string()).collect();

    let delimiter = match format {
        QueryFormat::Tsv => b'\t',
        QueryFormat::Csv => b',',
    };
    let mut writer: csv::Writer<Box<dyn std::io::Write>> = csv::WriterBuilder::new().delimiter(delimiter).from_writer(
        match &out {
            Some(path) => Box::new(std::fs::File::create(path)?),
            None => Box::new(std::io::stdout()),
        },
    );
    writer.write_record(&column_names)?;

    let mut rows = statement.query([]).map_err(|err| errors::ParseError::Schema(format!("query failed: {err}")))?;
    while let Some(row) = rows.next().map_err(|err| errors::ParseError::Schema(format!("query failed: {err}")))? {
        let values: Vec<String> = (0..column_names.len())
            .map(|i| match row.get::<_, rusqlite::types::Value>(i) {
                Ok(rusqlite::types::Value::Null) => String::new(),
                Ok(rusqlite::types::Value::Integer(v)) => v.to_string(),
                Ok(rusqlite::types::Value::Real(v)) => v.to_string(),
                Ok(rusqlite::types::Value::Text(v)) => v,
                Ok(rusqlite::types::Value::Blob(_)) => "<blob>".to_string(),
                Err(_) => String::new(),
            })
            .collect();
        writer.write_record(&values)?;
    }
    writer.flush()?;
    Ok(())
}

fn run_export(store_path: PathBuf, kind: ExportKind, out: PathBuf) -> Result<(), Error> {
    // `climate_store`/`marker` are accepted for CLI uniformity only; export
    // is a read-only projection over the primary store's SELECTED records.
    let store = Store::open(&store_path)?;
    let count = match kind {
        ExportKind::Fasta => export::export_fasta(&store, &out, false)?,
        ExportKind::Classifier => export::export_fasta(&store, &out, true)?,
        ExportKind::Tsv => export::export_table(&store, &out, b'\t')?,
        ExportKind::Csv => export::export_table(&store, &out, b',')?,
    };
    tracing::info!(count, "exported records");
    Ok(())
}

fn run_build_location_db(store_path: PathBuf, climate_path: PathBuf, batch: usize) -> Result<(), Error> {
    let store = Store::open(&store_path)?;
    let climate = ClimateStore::open_or_create(&climate_path)?;
    let koppen = TableKoppenLookup;
    let occurrence_client = gbif_occurrence_client()?;

    geo::run_geo_evaluation(
        &store,
        &climate,
        &occurrence_client,
        batch,
        retry::DOWNLOAD_POLL_INTERVAL,
        |d| std::thread::sleep(d),
        &koppen,
    )
}

fn exit_code_for(err: &Error) -> u8 {
    match err {
        Error::StoreNotFound(_) | Error::StoreAlreadyExists(_) => 3,
        Error::Parsing(_) | Error::Csv(_) => 2,
        _ => 1,
    }
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_max_level(level)
        .init();

    let result = match cli.command {
        Commands::Build { store, climate_store, marker, tsv, schema } => run_build(tsv, schema, store, climate_store, marker),
        Commands::Update { store, climate_store, marker, tsv, schema } => run_update(tsv, schema, store, climate_store, marker),
        Commands::Review { store, climate_store, marker } => run_review(store, climate_store, marker),
        Commands::Query { store, climate_store: _, marker: _, sql, out, format } => run_query(store, sql, out, format),
        Commands::Export { store, climate_store: _, marker: _, kind, out } => run_export(store, kind, out),
        Commands::BuildLocationDb { store, climate_store, marker: _, batch } => run_build_location_db(store, climate_store, batch),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}
