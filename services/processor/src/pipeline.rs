//! Ingestion pipeline: fetch → extract → persist, one notification at a time.
//!
//! Every notification is handled on its own. A failure at any step is logged
//! with the object key and the step that failed, counted, and the pipeline
//! moves on; nothing a single item does can fail the batch. Records are
//! upserted, so redelivered notifications simply rewrite the same row.

use crate::extractor::{ExtractionError, GeoPoint, MetadataExtractor};
use crate::fetcher::{FetchError, ObjectFetcher};
use crate::record_store::{ImageRecord, RecordStore, StoreError};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// A newly created object that should be indexed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionNotification {
    /// Container (bucket) holding the object
    pub container_name: String,
    /// Object key, already URL-decoded
    pub object_key: String,
}

impl IngestionNotification {
    pub fn new(container_name: impl Into<String>, object_key: impl Into<String>) -> Self {
        Self {
            container_name: container_name.into(),
            object_key: object_key.into(),
        }
    }
}

/// Pipeline step an item failed at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Turning the trigger record into a notification
    Decode,
    Fetch,
    Extract,
    Persist,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Decode => "decode",
            Step::Fetch => "fetch",
            Step::Extract => "extract",
            Step::Persist => "persist",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a single notification produced no record
#[derive(Error, Debug)]
pub enum ItemError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Extract(#[from] ExtractionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ItemError {
    pub fn step(&self) -> Step {
        match self {
            ItemError::Fetch(_) => Step::Fetch,
            ItemError::Extract(_) => Step::Extract,
            ItemError::Store(_) => Step::Persist,
        }
    }
}

/// A skipped notification, kept for the batch report
#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub container: String,
    pub key: String,
    pub step: Step,
    pub error: String,
}

/// Outcome of one batch.
///
/// Purely informational: the batch itself always counts as handled.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    /// Keys written to the record store
    pub persisted: Vec<String>,
    /// Items skipped because a step failed
    pub failed: Vec<ItemFailure>,
    /// Keys not finished before the batch deadline
    pub abandoned: Vec<String>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.persisted.len() + self.failed.len() + self.abandoned.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.abandoned.is_empty()
    }
}

enum ItemOutcome {
    Persisted(ImageRecord),
    Failed(ItemFailure),
    Abandoned(String),
}

/// Orchestrates fetch, extraction and persistence for notification batches
pub struct IngestionPipeline {
    fetcher: Arc<dyn ObjectFetcher>,
    extractor: Arc<dyn MetadataExtractor>,
    store: Arc<dyn RecordStore>,
    concurrency: usize,
    batch_deadline: Option<Duration>,
}

impl IngestionPipeline {
    pub fn new(
        fetcher: Arc<dyn ObjectFetcher>,
        extractor: Arc<dyn MetadataExtractor>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            fetcher,
            extractor,
            store,
            concurrency: 1,
            batch_deadline: None,
        }
    }

    /// Process up to `concurrency` notifications of a batch at once
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Give up on items still running when the deadline passes
    pub fn with_batch_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.batch_deadline = deadline;
        self
    }

    /// Process a batch of notifications.
    ///
    /// Never fails: each item either ends up in the store or in the report's
    /// `failed`/`abandoned` lists. Outcomes are reported in delivery order.
    #[instrument(skip(self, batch), fields(batch_size = batch.len()))]
    pub async fn process(&self, batch: Vec<IngestionNotification>) -> BatchReport {
        let deadline = self.batch_deadline.map(|d| Instant::now() + d);

        let outcomes: Vec<ItemOutcome> = stream::iter(batch)
            .map(|notification| self.process_within(notification, deadline))
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut report = BatchReport::default();
        for outcome in outcomes {
            match outcome {
                ItemOutcome::Persisted(record) => report.persisted.push(record.image_id),
                ItemOutcome::Failed(failure) => report.failed.push(failure),
                ItemOutcome::Abandoned(key) => report.abandoned.push(key),
            }
        }

        info!(
            persisted = report.persisted.len(),
            failed = report.failed.len(),
            abandoned = report.abandoned.len(),
            "Batch processed"
        );

        report
    }

    async fn process_within(
        &self,
        notification: IngestionNotification,
        deadline: Option<Instant>,
    ) -> ItemOutcome {
        let started = std::time::Instant::now();

        let result = match deadline {
            Some(deadline) if Instant::now() >= deadline => None,
            Some(deadline) => tokio::time::timeout_at(deadline, self.process_one(&notification))
                .await
                .ok(),
            None => Some(self.process_one(&notification).await),
        };

        metrics::histogram!("geotag.item.duration_seconds").record(started.elapsed().as_secs_f64());

        match result {
            Some(Ok(record)) => {
                info!(
                    key = %record.image_id,
                    latitude = record.latitude,
                    longitude = record.longitude,
                    "Indexed image location"
                );
                metrics::counter!("geotag.items.persisted").increment(1);
                ItemOutcome::Persisted(record)
            }
            Some(Err(e)) => {
                let step = e.step();
                warn!(
                    container = %notification.container_name,
                    key = %notification.object_key,
                    step = %step,
                    error = %e,
                    "Skipping notification"
                );
                metrics::counter!("geotag.items.failed", "step" => step.as_str()).increment(1);
                ItemOutcome::Failed(ItemFailure {
                    container: notification.container_name,
                    key: notification.object_key,
                    step,
                    error: e.to_string(),
                })
            }
            None => {
                warn!(
                    container = %notification.container_name,
                    key = %notification.object_key,
                    "Batch deadline reached, leaving notification for redelivery"
                );
                metrics::counter!("geotag.items.abandoned").increment(1);
                ItemOutcome::Abandoned(notification.object_key)
            }
        }
    }

    /// Fetch, extract and persist a single notification
    #[instrument(skip(self, notification), fields(container = %notification.container_name, key = %notification.object_key))]
    pub async fn process_one(
        &self,
        notification: &IngestionNotification,
    ) -> Result<ImageRecord, ItemError> {
        let point = self.locate(notification).await?;
        let record = ImageRecord::from_notification(notification, point);
        self.store.put(&record).await?;

        Ok(record)
    }

    /// Fetch the object and read its geotag. The object stream is owned by
    /// this scope and released on every return path.
    async fn locate(&self, notification: &IngestionNotification) -> Result<GeoPoint, ItemError> {
        let mut object = self
            .fetcher
            .fetch(&notification.container_name, &notification.object_key)
            .await?;
        debug!(content_length = ?object.content_length(), "Fetched object");

        let point = self.extractor.extract(object.reader()).await?;
        Ok(point)
    }
}
