//! Bucket notification documents.
//!
//! AWS S3 and MinIO both publish object events as a JSON document with a
//! `Records` array; MinIO wraps it with `EventName`/`Key` fields that are not
//! needed here. Object keys in the records are form-URL-encoded.

use crate::pipeline::{IngestionNotification, ItemFailure, Step};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur while decoding a notification document
#[derive(Error, Debug)]
pub enum EventError {
    #[error("Failed to deserialize bucket notification: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Object key {key:?} is not valid URL-encoded UTF-8")]
    InvalidKey { key: String },
}

/// Bucket notification document
#[derive(Debug, Clone, Deserialize)]
pub struct BucketNotification {
    #[serde(rename = "Records", default)]
    pub records: Vec<EventRecord>,
}

/// One object event
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// e.g. `ObjectCreated:Put` (AWS) or `s3:ObjectCreated:Put` (MinIO)
    pub event_name: String,
    pub s3: S3Entity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Entity {
    pub bucket: S3Bucket,
    pub object: S3Object,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Bucket {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Object {
    /// URL-encoded object key
    pub key: String,
}

impl EventRecord {
    pub fn is_object_created(&self) -> bool {
        self.event_name.contains("ObjectCreated:")
    }
}

/// Decode a form-URL-encoded object key (`+` stands for a space)
pub fn decode_object_key(key: &str) -> Result<String, EventError> {
    let spaced = key.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| EventError::InvalidKey {
            key: key.to_string(),
        })
}

/// Notifications decoded from one document
#[derive(Debug, Default)]
pub struct NotificationBatch {
    /// Object creations ready for the pipeline
    pub notifications: Vec<IngestionNotification>,
    /// Records whose object key could not be decoded
    pub rejected: Vec<ItemFailure>,
}

/// Turn a notification document into a pipeline batch.
///
/// Records other than object creations are dropped; documents without
/// records (e.g. `s3:TestEvent`) yield an empty batch. A record with an
/// undecodable key is rejected on its own and does not affect its siblings.
pub fn parse_notifications(payload: &[u8]) -> Result<NotificationBatch, EventError> {
    let document: BucketNotification = serde_json::from_slice(payload)?;

    let mut batch = NotificationBatch {
        notifications: Vec::with_capacity(document.records.len()),
        rejected: Vec::new(),
    };
    for record in document.records {
        if !record.is_object_created() {
            debug!(
                event_name = %record.event_name,
                key = %record.s3.object.key,
                "Ignoring non-creation event"
            );
            continue;
        }

        match decode_object_key(&record.s3.object.key) {
            Ok(key) => batch
                .notifications
                .push(IngestionNotification::new(record.s3.bucket.name, key)),
            Err(e) => {
                warn!(
                    container = %record.s3.bucket.name,
                    key = %record.s3.object.key,
                    step = %Step::Decode,
                    error = %e,
                    "Skipping notification"
                );
                metrics::counter!("geotag.items.failed", "step" => Step::Decode.as_str())
                    .increment(1);
                batch.rejected.push(ItemFailure {
                    container: record.s3.bucket.name,
                    key: record.s3.object.key,
                    step: Step::Decode,
                    error: e.to_string(),
                });
            }
        }
    }

    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aws_notification() {
        let json = br#"{
            "Records": [{
                "eventVersion": "2.1",
                "eventSource": "aws:s3",
                "awsRegion": "us-east-1",
                "eventTime": "2023-11-14T22:13:20.000Z",
                "eventName": "ObjectCreated:Put",
                "s3": {
                    "s3SchemaVersion": "1.0",
                    "bucket": {"name": "photos", "arn": "arn:aws:s3:::photos"},
                    "object": {"key": "1700000000-trip.jpg", "size": 48211, "eTag": "abc"}
                }
            }]
        }"#;

        let batch = parse_notifications(json).unwrap();
        assert_eq!(
            batch.notifications,
            vec![IngestionNotification::new("photos", "1700000000-trip.jpg")]
        );
        assert!(batch.rejected.is_empty());
    }

    #[test]
    fn test_parse_minio_notification_skips_removals() {
        let json = br#"{
            "EventName": "s3:ObjectCreated:Put",
            "Key": "photos/a.jpg",
            "Records": [
                {"eventName": "s3:ObjectCreated:Put",
                 "s3": {"bucket": {"name": "photos"}, "object": {"key": "a.jpg"}}},
                {"eventName": "s3:ObjectRemoved:Delete",
                 "s3": {"bucket": {"name": "photos"}, "object": {"key": "b.jpg"}}},
                {"eventName": "s3:ObjectCreated:CompleteMultipartUpload",
                 "s3": {"bucket": {"name": "photos"}, "object": {"key": "c.jpg"}}}
            ]
        }"#;

        let keys: Vec<_> = parse_notifications(json)
            .unwrap()
            .notifications
            .into_iter()
            .map(|n| n.object_key)
            .collect();
        assert_eq!(keys, vec!["a.jpg", "c.jpg"]);
    }

    #[test]
    fn test_test_event_yields_empty_batch() {
        let json = br#"{"Service": "Amazon S3", "Event": "s3:TestEvent", "Bucket": "photos"}"#;
        let batch = parse_notifications(json).unwrap();
        assert!(batch.notifications.is_empty());
        assert!(batch.rejected.is_empty());
    }

    #[test]
    fn test_keys_are_url_decoded() {
        assert_eq!(
            decode_object_key("1700000000-summer+trip%2C+NYC.jpg").unwrap(),
            "1700000000-summer trip, NYC.jpg"
        );
        assert_eq!(decode_object_key("caf%C3%A9.jpg").unwrap(), "café.jpg");
        assert!(decode_object_key("bad%FF.jpg").is_err());
    }

    #[test]
    fn test_undecodable_key_rejects_only_its_record() {
        let json = br#"{"Records": [
            {"eventName": "ObjectCreated:Put",
             "s3": {"bucket": {"name": "photos"}, "object": {"key": "good.jpg"}}},
            {"eventName": "ObjectCreated:Put",
             "s3": {"bucket": {"name": "photos"}, "object": {"key": "bad%FF.jpg"}}},
            {"eventName": "ObjectCreated:Put",
             "s3": {"bucket": {"name": "photos"}, "object": {"key": "also+good.jpg"}}}
        ]}"#;

        let batch = parse_notifications(json).unwrap();
        let keys: Vec<_> = batch
            .notifications
            .iter()
            .map(|n| n.object_key.as_str())
            .collect();
        assert_eq!(keys, vec!["good.jpg", "also good.jpg"]);

        assert_eq!(batch.rejected.len(), 1);
        assert_eq!(batch.rejected[0].key, "bad%FF.jpg");
        assert_eq!(batch.rejected[0].container, "photos");
        assert_eq!(batch.rejected[0].step, Step::Decode);
    }

    #[test]
    fn test_malformed_payload() {
        assert!(matches!(
            parse_notifications(b"not json"),
            Err(EventError::Malformed(_))
        ));
    }
}
