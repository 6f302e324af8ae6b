use crate::api::UploadSigner;
use crate::config::S3Config;
use crate::fetcher::{FetchError, FetchedObject, ObjectFetcher};
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client as S3Client;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Build an S3 client from service configuration
pub async fn build_client(config: &S3Config) -> S3Client {
    let aws_config = aws_config::defaults(BehaviorVersion::latest())
        .region(aws_config::Region::new(config.region.clone()))
        .load()
        .await;

    let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

    // Configure custom endpoint for MinIO/LocalStack
    if let Some(ref endpoint_url) = config.endpoint_url {
        s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
    }

    // Force path-style access for MinIO compatibility
    if config.force_path_style {
        s3_config_builder = s3_config_builder.force_path_style(true);
    }

    info!(
        region = %config.region,
        endpoint = ?config.endpoint_url,
        "S3 client initialized"
    );

    S3Client::from_conf(s3_config_builder.build())
}

/// Object fetcher backed by S3 `GetObject`
#[derive(Clone)]
pub struct S3ObjectFetcher {
    client: S3Client,
}

impl S3ObjectFetcher {
    pub fn new(client: S3Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectFetcher for S3ObjectFetcher {
    #[instrument(skip(self))]
    async fn fetch(&self, container: &str, key: &str) -> Result<FetchedObject, FetchError> {
        let output = self
            .client
            .get_object()
            .bucket(container)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_get_object_error(container, key, e))?;

        let content_length = output.content_length().and_then(|len| u64::try_from(len).ok());

        debug!(?content_length, "Opened S3 object stream");

        Ok(FetchedObject::new(
            container,
            key,
            output.body.into_async_read(),
            content_length,
        ))
    }
}

fn classify_get_object_error(
    container: &str,
    key: &str,
    err: SdkError<GetObjectError, HttpResponse>,
) -> FetchError {
    let status = err.raw_response().map(|response| response.status().as_u16());
    let not_found = matches!(
        err.as_service_error(),
        Some(GetObjectError::NoSuchKey(_))
    ) || status == Some(404);

    if not_found {
        return FetchError::NotFound {
            container: container.to_string(),
            key: key.to_string(),
        };
    }

    if status == Some(403) {
        return FetchError::AccessDenied {
            container: container.to_string(),
            key: key.to_string(),
            reason: DisplayErrorContext(&err).to_string(),
        };
    }

    FetchError::Transient(DisplayErrorContext(&err).to_string())
}

/// Presigns browser uploads into the configured bucket
#[derive(Clone)]
pub struct S3UploadSigner {
    client: S3Client,
    bucket: String,
}

impl S3UploadSigner {
    pub fn new(client: S3Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl UploadSigner for S3UploadSigner {
    #[instrument(skip(self))]
    async fn presign_put(&self, key: &str, expires_in: Duration) -> Result<String> {
        let presigning_config = PresigningConfig::expires_in(expires_in)
            .context("Failed to create presigning config")?;

        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .context("Failed to presign upload URL")?;

        Ok(presigned.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::error::ErrorMetadata;
    use aws_sdk_s3::primitives::SdkBody;
    use aws_sdk_s3::types::error::NoSuchKey;

    fn response(status: u16) -> HttpResponse {
        HttpResponse::new(status.try_into().unwrap(), SdkBody::empty())
    }

    fn service_error(code: &str, status: u16) -> SdkError<GetObjectError, HttpResponse> {
        let err = GetObjectError::generic(ErrorMetadata::builder().code(code).build());
        SdkError::service_error(err, response(status))
    }

    fn classify(err: SdkError<GetObjectError, HttpResponse>) -> FetchError {
        classify_get_object_error("photos", "trip.jpg", err)
    }

    #[test]
    fn test_missing_key_is_not_found() {
        let err = SdkError::service_error(
            GetObjectError::NoSuchKey(NoSuchKey::builder().build()),
            response(404),
        );
        assert!(matches!(
            classify(err),
            FetchError::NotFound { ref container, ref key }
                if container == "photos" && key == "trip.jpg"
        ));

        // Without ListBucket permission S3 answers with a bare 404
        assert!(matches!(
            classify(service_error("NotFound", 404)),
            FetchError::NotFound { .. }
        ));
    }

    #[test]
    fn test_forbidden_is_access_denied() {
        assert!(matches!(
            classify(service_error("AccessDenied", 403)),
            FetchError::AccessDenied { ref key, .. } if key == "trip.jpg"
        ));
    }

    #[test]
    fn test_other_failures_are_transient() {
        assert!(matches!(
            classify(service_error("InternalError", 500)),
            FetchError::Transient(_)
        ));
        assert!(matches!(
            classify(service_error("SlowDown", 503)),
            FetchError::Transient(_)
        ));
        assert!(matches!(
            classify(SdkError::timeout_error("operation timed out")),
            FetchError::Transient(_)
        ));
    }
}
