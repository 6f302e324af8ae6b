//! Run a single synthetic notification through the ingestion pipeline.
//!
//! ```text
//! geotag-local --bucket photos --key 1700000000-trip.jpg
//! geotag-local --bucket photos --key trip.jpg --source-dir ./fixtures --memory-store
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use geotag_processor::config::Config;
use geotag_processor::extractor::ExifGeoExtractor;
use geotag_processor::fetcher::{LocalObjectFetcher, ObjectFetcher};
use geotag_processor::pg_store::PgRecordStore;
use geotag_processor::pipeline::{BatchReport, IngestionNotification, IngestionPipeline};
use geotag_processor::record_store::{ImageRecord, MemoryRecordStore, RecordStore};
use geotag_processor::s3::{build_client, S3ObjectFetcher};
use geotag_processor::telemetry::{init_tracing, LogFormat};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "geotag-local", version, about = "Index one object's geotag")]
struct Args {
    /// Bucket (container) holding the object
    #[arg(long)]
    bucket: String,

    /// Object key, as it appears in the bucket
    #[arg(long)]
    key: String,

    /// Read objects from `<DIR>/<bucket>/<key>` instead of S3
    #[arg(long, value_name = "DIR")]
    source_dir: Option<PathBuf>,

    /// Keep records in memory and print them instead of writing to PostgreSQL
    #[arg(long)]
    memory_store: bool,

    /// Log level, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Serialize)]
struct Output {
    report: BatchReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    records: Option<Vec<ImageRecord>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, LogFormat::Compact);

    let config = Config::load().context("Failed to load configuration")?;

    let fetcher: Arc<dyn ObjectFetcher> = match &args.source_dir {
        Some(dir) => {
            info!(root = %dir.display(), "Reading objects from local directory");
            Arc::new(LocalObjectFetcher::new(dir))
        }
        None => Arc::new(S3ObjectFetcher::new(build_client(&config.s3).await)),
    };

    let memory_store = args.memory_store.then(|| Arc::new(MemoryRecordStore::new()));
    let store: Arc<dyn RecordStore> = match &memory_store {
        Some(store) => store.clone(),
        None => {
            let store = PgRecordStore::new(&config.database)
                .await
                .context("Failed to initialize record store")?;
            if config.database.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }
            Arc::new(store)
        }
    };

    let pipeline = IngestionPipeline::new(
        fetcher,
        Arc::new(ExifGeoExtractor::new(config.processor.max_buffered_bytes)),
        store,
    );

    let batch = vec![IngestionNotification::new(args.bucket, args.key)];
    let report = pipeline.process(batch).await;

    let output = Output {
        report,
        records: memory_store.map(|store| store.records()),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&output).context("Failed to serialize output")?
    );

    Ok(())
}
