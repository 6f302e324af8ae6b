//! Fixtures shared by the unit tests: synthetic EXIF images, instrumented
//! readers and an in-memory object fetcher.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

use crate::fetcher::{FetchError, FetchedObject, ObjectFetcher};

const TYPE_ASCII: u16 = 2;
const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;
const TYPE_RATIONAL: u16 = 5;

fn push_entry(out: &mut Vec<u8>, tag: u16, kind: u16, count: u32, value: [u8; 4]) {
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(&value);
}

fn push_degrees(out: &mut Vec<u8>, degrees: f64) {
    let scaled = (degrees.abs() * 1_000_000.0).round() as u32;
    for (num, denom) in [(scaled, 1_000_000u32), (0, 1), (0, 1)] {
        out.extend_from_slice(&num.to_le_bytes());
        out.extend_from_slice(&denom.to_le_bytes());
    }
}

/// Little-endian TIFF block with IFD0 pointing at a GPS IFD
pub(crate) fn tiff_with_gps(latitude: f64, longitude: f64) -> Vec<u8> {
    const GPS_IFD_OFFSET: u32 = 8 + 18;
    const DATA_OFFSET: u32 = GPS_IFD_OFFSET + 2 + 4 * 12 + 4;

    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(b"II*\0");
    out.extend_from_slice(&8u32.to_le_bytes());

    // IFD0: GPSInfo pointer only
    out.extend_from_slice(&1u16.to_le_bytes());
    push_entry(&mut out, 0x8825, TYPE_LONG, 1, GPS_IFD_OFFSET.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());

    let lat_ref = if latitude < 0.0 { b'S' } else { b'N' };
    let lon_ref = if longitude < 0.0 { b'W' } else { b'E' };

    out.extend_from_slice(&4u16.to_le_bytes());
    push_entry(&mut out, 0x0001, TYPE_ASCII, 2, [lat_ref, 0, 0, 0]);
    push_entry(&mut out, 0x0002, TYPE_RATIONAL, 3, DATA_OFFSET.to_le_bytes());
    push_entry(&mut out, 0x0003, TYPE_ASCII, 2, [lon_ref, 0, 0, 0]);
    push_entry(&mut out, 0x0004, TYPE_RATIONAL, 3, (DATA_OFFSET + 24).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());

    push_degrees(&mut out, latitude);
    push_degrees(&mut out, longitude);
    out
}

/// Little-endian TIFF block carrying only an orientation tag
pub(crate) fn tiff_without_gps() -> Vec<u8> {
    let mut out = Vec::with_capacity(26);
    out.extend_from_slice(b"II*\0");
    out.extend_from_slice(&8u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    push_entry(&mut out, 0x0112, TYPE_SHORT, 1, [1, 0, 0, 0]);
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}

/// SOI, a JFIF APP0 segment and an APP1 `Exif` segment wrapping `tiff`
pub(crate) fn jpeg_exif_prefix(tiff: &[u8]) -> Vec<u8> {
    let mut out = jpeg_head();
    out.extend_from_slice(&[0xFF, 0xE1]);
    out.extend_from_slice(&((2 + 6 + tiff.len()) as u16).to_be_bytes());
    out.extend_from_slice(b"Exif\0\0");
    out.extend_from_slice(tiff);
    out
}

pub(crate) fn jpeg_with_exif(tiff: &[u8]) -> Vec<u8> {
    let mut out = jpeg_exif_prefix(tiff);
    out.extend_from_slice(&jpeg_scan());
    out
}

pub(crate) fn jpeg_with_gps(latitude: f64, longitude: f64) -> Vec<u8> {
    jpeg_with_exif(&tiff_with_gps(latitude, longitude))
}

pub(crate) fn jpeg_without_exif() -> Vec<u8> {
    let mut out = jpeg_head();
    out.extend_from_slice(&jpeg_scan());
    out
}

fn jpeg_head() -> Vec<u8> {
    let mut out = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
    out.extend_from_slice(b"JFIF\0");
    out.extend_from_slice(&[0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00]);
    out
}

fn jpeg_scan() -> Vec<u8> {
    let mut out = vec![0xFF, 0xDA, 0x00, 0x08, 0x01, 0x01, 0x00, 0x00, 0x3F, 0x00];
    out.extend_from_slice(&[0x12, 0x34, 0x56, 0x78]);
    out.extend_from_slice(&[0xFF, 0xD9]);
    out
}

/// Reader that fails every read
pub(crate) struct FailingReader;

impl AsyncRead for FailingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            "read past the metadata segment",
        )))
    }
}

/// Reader that yields `prefix` and then never completes
pub(crate) struct StalledReader {
    prefix: Cursor<Vec<u8>>,
}

impl AsyncRead for StalledReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.prefix.position() < self.prefix.get_ref().len() as u64 {
            return Pin::new(&mut self.prefix).poll_read(cx, buf);
        }
        Poll::Pending
    }
}

/// Reader that counts its own drops
pub(crate) struct TrackedReader {
    inner: Box<dyn AsyncRead + Send + Unpin>,
    released: Arc<AtomicUsize>,
}

impl AsyncRead for TrackedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Drop for TrackedReader {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
enum Fixture {
    Bytes(Vec<u8>),
    Stalled(Vec<u8>),
}

/// Object fetcher serving fixed byte blobs and counting open/released streams
#[derive(Default)]
pub(crate) struct FixtureFetcher {
    objects: HashMap<(String, String), Fixture>,
    opened: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl FixtureFetcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_object(mut self, container: &str, key: &str, bytes: Vec<u8>) -> Self {
        self.objects
            .insert((container.to_string(), key.to_string()), Fixture::Bytes(bytes));
        self
    }

    /// Object whose stream delivers `prefix` and then hangs
    pub(crate) fn with_stalled_object(
        mut self,
        container: &str,
        key: &str,
        prefix: Vec<u8>,
    ) -> Self {
        self.objects
            .insert((container.to_string(), key.to_string()), Fixture::Stalled(prefix));
        self
    }

    pub(crate) fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectFetcher for FixtureFetcher {
    async fn fetch(&self, container: &str, key: &str) -> Result<FetchedObject, FetchError> {
        let fixture = self
            .objects
            .get(&(container.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| FetchError::NotFound {
                container: container.to_string(),
                key: key.to_string(),
            })?;

        self.opened.fetch_add(1, Ordering::SeqCst);
        let (inner, content_length) = match fixture {
            Fixture::Bytes(bytes) => {
                let len = bytes.len() as u64;
                let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(Cursor::new(bytes));
                (reader, Some(len))
            }
            Fixture::Stalled(prefix) => {
                let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(StalledReader {
                    prefix: Cursor::new(prefix),
                });
                (reader, None)
            }
        };
        let reader = TrackedReader {
            inner,
            released: self.released.clone(),
        };

        Ok(FetchedObject::new(container, key, reader, content_length))
    }
}
