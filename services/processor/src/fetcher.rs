//! Object fetching port and the filesystem backend.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use thiserror::Error;
use tokio::io::{AsyncRead, BufReader};
use tracing::{debug, instrument, trace};

/// Errors returned by object fetcher backends
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Object {container}/{key} not found")]
    NotFound { container: String, key: String },

    #[error("Access to {container}/{key} denied: {reason}")]
    AccessDenied {
        container: String,
        key: String,
        reason: String,
    },

    #[error("Object store request failed: {0}")]
    Transient(String),
}

/// An open object stream.
///
/// The stream is released when this value is dropped, so every exit path of
/// the caller closes the underlying connection or file handle.
pub struct FetchedObject {
    container: String,
    key: String,
    content_length: Option<u64>,
    reader: Pin<Box<dyn AsyncRead + Send>>,
}

impl FetchedObject {
    pub fn new<R>(container: &str, key: &str, reader: R, content_length: Option<u64>) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self {
            container: container.to_string(),
            key: key.to_string(),
            content_length,
            reader: Box::pin(reader),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Borrow the byte stream for reading
    pub fn reader(&mut self) -> &mut (dyn AsyncRead + Unpin + Send) {
        &mut self.reader
    }
}

impl std::fmt::Debug for FetchedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedObject")
            .field("container", &self.container)
            .field("key", &self.key)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

impl Drop for FetchedObject {
    fn drop(&mut self) {
        trace!(container = %self.container, key = %self.key, "Released object stream");
    }
}

/// Reads objects out of a content store by container and key
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    async fn fetch(&self, container: &str, key: &str) -> Result<FetchedObject, FetchError>;
}

/// Serves objects from `<root>/<container>/<key>` on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalObjectFetcher {
    root: PathBuf,
}

impl LocalObjectFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a container/key pair, refusing anything that escapes the root
    fn object_path(&self, container: &str, key: &str) -> Result<PathBuf, FetchError> {
        let denied = |reason: &str| FetchError::AccessDenied {
            container: container.to_string(),
            key: key.to_string(),
            reason: reason.to_string(),
        };

        if container.is_empty() || key.is_empty() {
            return Err(denied("empty container or key"));
        }

        for part in [container, key] {
            let normal = Path::new(part)
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
            if !normal {
                return Err(denied("path escapes the storage root"));
            }
        }

        Ok(self.root.join(container).join(key))
    }
}

#[async_trait]
impl ObjectFetcher for LocalObjectFetcher {
    #[instrument(skip(self))]
    async fn fetch(&self, container: &str, key: &str) -> Result<FetchedObject, FetchError> {
        let path = self.object_path(container, key)?;

        let file = tokio::fs::File::open(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => FetchError::NotFound {
                container: container.to_string(),
                key: key.to_string(),
            },
            ErrorKind::PermissionDenied => FetchError::AccessDenied {
                container: container.to_string(),
                key: key.to_string(),
                reason: e.to_string(),
            },
            _ => FetchError::Transient(format!("{}: {}", path.display(), e)),
        })?;

        let content_length = file.metadata().await.ok().map(|m| m.len());

        debug!(path = %path.display(), ?content_length, "Opened local object");

        Ok(FetchedObject::new(
            container,
            key,
            BufReader::new(file),
            content_length,
        ))
    }
}
