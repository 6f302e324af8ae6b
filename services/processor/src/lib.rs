//! Geotag Processor
//!
//! Indexes the locations of uploaded photos. The service consumes bucket
//! notifications from Kafka, streams each new object from S3, reads the GPS
//! coordinates out of its EXIF block and upserts them into PostgreSQL. A small
//! HTTP API serves the indexed points to a map page and presigns browser
//! uploads.
//!
//! ## Features
//!
//! - **Per-item isolation**: one unreadable or untagged image never fails the
//!   batch it arrived in
//! - **Streaming extraction**: JPEGs are read only up to their EXIF segment
//! - **Idempotent persistence**: records are keyed by object key and upserted
//! - **Read API**: map points, full records and presigned upload URLs
//!
//! ## Architecture
//!
//! ```text
//! Kafka Topic              S3 Bucket                PostgreSQL
//! ┌──────────────┐        ┌──────────────┐         ┌─────────────────┐
//! │ Bucket       │        │ uploaded     │         │ image_locations │
//! │ Notifications│        │ photos       │         └─────────────────┘
//! └──────────────┘        └──────────────┘            ▲          │
//!        │                       │                    │          │
//!        ▼                       ▼                    │          ▼
//! ┌──────────────┐  fetch ┌──────────────┐  upsert    │   ┌──────────────┐
//! │ Notification │───────▶│ Ingestion    │────────────┘   │ Read API     │
//! │ Consumer     │        │ Pipeline     │                │ (map, upload)│
//! └──────────────┘        └──────────────┘                └──────────────┘
//!                                │
//!                                ▼
//!                         ┌──────────────┐
//!                         │ EXIF GPS     │
//!                         │ Extractor    │
//!                         └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod event;
pub mod extractor;
pub mod fetcher;
pub mod pg_store;
pub mod pipeline;
pub mod record_store;
pub mod s3;
pub mod telemetry;
pub mod trigger;

#[cfg(test)]
mod test_support;

pub use api::{AppState, UploadSigner};
pub use config::Config;
pub use event::{parse_notifications, EventError};
pub use extractor::{ExifGeoExtractor, ExtractionError, GeoPoint, MetadataExtractor};
pub use fetcher::{FetchError, FetchedObject, LocalObjectFetcher, ObjectFetcher};
pub use pg_store::PgRecordStore;
pub use pipeline::{BatchReport, IngestionNotification, IngestionPipeline, ItemError, Step};
pub use record_store::{ImageRecord, MemoryRecordStore, PointSource, RecordStore, StoreError};
pub use s3::{S3ObjectFetcher, S3UploadSigner};
pub use trigger::NotificationConsumer;
