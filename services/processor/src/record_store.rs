//! Image location records and the store ports they are written through.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

use crate::extractor::GeoPoint;
use crate::pipeline::IngestionNotification;

/// Longest image id accepted by the stores
pub const MAX_IMAGE_ID_LEN: usize = 1024;

/// Errors returned by record store backends
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Record rejected: {0}")]
    Validation(String),

    #[error("Record store unavailable: {0}")]
    Unavailable(String),
}

/// A geotagged image, keyed by `image_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    /// Primary key, derived from the object key
    pub image_id: String,
    /// Location of the source object
    pub storage_key: String,
    /// Degrees, [-90, 90]
    pub latitude: f64,
    /// Degrees, [-180, 180]
    pub longitude: f64,
}

impl ImageRecord {
    /// Build the record for a notification whose object yielded `point`
    pub fn from_notification(notification: &IngestionNotification, point: GeoPoint) -> Self {
        Self {
            image_id: notification.object_key.clone(),
            storage_key: notification.object_key.clone(),
            latitude: point.latitude(),
            longitude: point.longitude(),
        }
    }

    /// Check the record before it is written
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.image_id.is_empty() {
            return Err(StoreError::Validation("image id is empty".to_string()));
        }
        if self.image_id.len() > MAX_IMAGE_ID_LEN {
            return Err(StoreError::Validation(format!(
                "image id exceeds {} bytes",
                MAX_IMAGE_ID_LEN
            )));
        }
        if self.storage_key.is_empty() {
            return Err(StoreError::Validation("storage key is empty".to_string()));
        }
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(StoreError::Validation(format!(
                "latitude {} out of range",
                self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(StoreError::Validation(format!(
                "longitude {} out of range",
                self.longitude
            )));
        }
        Ok(())
    }
}

/// Write side of the record store.
///
/// `put` is an upsert: a record with an existing `image_id` fully replaces
/// the stored one, so redelivered notifications are harmless.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn put(&self, record: &ImageRecord) -> Result<(), StoreError>;
}

/// Read side of the record store, used by the HTTP API
#[async_trait]
pub trait PointSource: Send + Sync {
    /// All records, ordered by image id
    async fn scan(&self) -> Result<Vec<ImageRecord>, StoreError>;

    /// Cheap connectivity check behind `GET /ready`
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-memory record store for tests and local runs
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<BTreeMap<String, ImageRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, image_id: &str) -> Option<ImageRecord> {
        self.records.read().get(image_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn records(&self) -> Vec<ImageRecord> {
        self.records.read().values().cloned().collect()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn put(&self, record: &ImageRecord) -> Result<(), StoreError> {
        record.validate()?;
        let replaced = self
            .records
            .write()
            .insert(record.image_id.clone(), record.clone())
            .is_some();
        debug!(image_id = %record.image_id, replaced, "Stored image record in memory");
        Ok(())
    }
}

#[async_trait]
impl PointSource for MemoryRecordStore {
    async fn scan(&self) -> Result<Vec<ImageRecord>, StoreError> {
        Ok(self.records())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, latitude: f64, longitude: f64) -> ImageRecord {
        ImageRecord {
            image_id: id.to_string(),
            storage_key: id.to_string(),
            latitude,
            longitude,
        }
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let json = serde_json::to_value(record("1700000000-trip.jpg", 40.7128, -74.006)).unwrap();
        assert_eq!(json["imageId"], "1700000000-trip.jpg");
        assert_eq!(json["storageKey"], "1700000000-trip.jpg");
        assert_eq!(json["latitude"], 40.7128);
        assert_eq!(json["longitude"], -74.006);
    }

    #[test]
    fn test_validate_bounds() {
        assert!(record("a.jpg", 90.0, 180.0).validate().is_ok());
        assert!(record("a.jpg", -90.0, -180.0).validate().is_ok());
        assert!(matches!(
            record("a.jpg", 90.5, 0.0).validate(),
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            record("a.jpg", 0.0, -180.1).validate(),
            Err(StoreError::Validation(_))
        ));
        assert!(record("a.jpg", f64::NAN, 0.0).validate().is_err());
        assert!(record("", 1.0, 1.0).validate().is_err());
        assert!(record(&"k".repeat(MAX_IMAGE_ID_LEN + 1), 1.0, 1.0)
            .validate()
            .is_err());
    }

    #[tokio::test]
    async fn test_memory_store_upserts() {
        let store = MemoryRecordStore::new();
        store.put(&record("b.jpg", 1.0, 2.0)).await.unwrap();
        store.put(&record("a.jpg", 3.0, 4.0)).await.unwrap();
        store.put(&record("b.jpg", 5.0, 6.0)).await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.get("b.jpg").unwrap().latitude, 5.0);

        let scanned = store.scan().await.unwrap();
        let ids: Vec<_> = scanned.iter().map(|r| r.image_id.as_str()).collect();
        assert_eq!(ids, vec!["a.jpg", "b.jpg"]);
    }

    #[tokio::test]
    async fn test_memory_store_rejects_invalid_record() {
        let store = MemoryRecordStore::new();
        let err = store.put(&record("a.jpg", 100.0, 0.0)).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert!(store.is_empty());
    }
}
