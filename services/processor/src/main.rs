use anyhow::{Context, Result};
use geotag_processor::api::{start_api_server, AppState};
use geotag_processor::config::Config;
use geotag_processor::extractor::ExifGeoExtractor;
use geotag_processor::pg_store::PgRecordStore;
use geotag_processor::pipeline::IngestionPipeline;
use geotag_processor::s3::{build_client, S3ObjectFetcher, S3UploadSigner};
use geotag_processor::telemetry::{init_metrics, init_tracing, LogFormat};
use geotag_processor::trigger::NotificationConsumer;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, LogFormat::Json);

    info!(
        service = %config.service.name,
        "Starting geotag processor"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let record_store = Arc::new(
        PgRecordStore::new(&config.database)
            .await
            .context("Failed to initialize record store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        record_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let s3_client = build_client(&config.s3).await;

    let pipeline = Arc::new(
        IngestionPipeline::new(
            Arc::new(S3ObjectFetcher::new(s3_client.clone())),
            Arc::new(ExifGeoExtractor::new(config.processor.max_buffered_bytes)),
            record_store.clone(),
        )
        .with_concurrency(config.processor.concurrency)
        .with_batch_deadline(config.batch_deadline()),
    );

    let consumer = NotificationConsumer::new(&config.kafka, pipeline)
        .context("Failed to initialize Kafka consumer")?;

    let shutdown = CancellationToken::new();

    // Spawn Kafka consumer task
    let consumer_shutdown = shutdown.clone();
    let consumer_handle = tokio::spawn(async move {
        if let Err(e) = consumer.run(consumer_shutdown).await {
            error!(error = %e, "Kafka consumer error");
        }
    });

    // Spawn API server task
    let api_handle = if config.api.enabled {
        let api_state = AppState {
            points: record_store.clone(),
            signer: Arc::new(S3UploadSigner::new(
                s3_client,
                config.s3.upload_bucket.clone(),
            )),
            upload_url_expiry: config.upload_url_expiry(),
        };
        let api_config = config.api.clone();
        let api_shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = start_api_server(api_state, &api_config, api_shutdown).await {
                error!(error = %e, "API server error");
            }
        }))
    } else {
        info!("Read API disabled");
        None
    };

    info!("Geotag processor started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down geotag processor");
    shutdown.cancel();

    if let Err(e) = consumer_handle.await {
        error!(error = %e, "Kafka consumer task failed");
    }
    if let Some(handle) = api_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "API server task failed");
        }
    }

    info!("Geotag processor stopped");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
