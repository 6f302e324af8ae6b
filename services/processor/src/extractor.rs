//! Geotag extraction from embedded EXIF metadata.
//!
//! JPEG input is walked segment by segment and reading stops as soon as the
//! APP1 `Exif` segment has been read, so the entropy-coded image data is
//! never pulled from the stream. Other containers the EXIF reader understands
//! (TIFF, PNG, WebP, HEIF) keep their metadata at arbitrary offsets and are
//! buffered up to a configurable limit before parsing.

use async_trait::async_trait;
use exif::{In, Reader, Tag, Value};
use std::io::{Cursor, ErrorKind};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

const MARKER_PREFIX: u8 = 0xFF;
const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;
const SOS: u8 = 0xDA;
const APP1: u8 = 0xE1;
const TEM: u8 = 0x01;
const EXIF_HEADER: &[u8] = b"Exif\0\0";

/// Default cap for containers that must be buffered whole
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = 64 * 1024 * 1024;

/// Reasons a stream did not yield a usable geotag
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Unrecognized image container")]
    UnrecognizedFormat,

    #[error("Image has no EXIF metadata segment")]
    MissingMetadata,

    #[error("EXIF metadata has no GPS position: {0}")]
    MissingGeotag(String),

    #[error("GPS position out of range: latitude {latitude}, longitude {longitude}")]
    OutOfRange { latitude: f64, longitude: f64 },

    #[error("Malformed EXIF metadata: {0}")]
    Malformed(String),

    #[error("Container exceeds the {limit} byte buffering limit")]
    TooLarge { limit: usize },

    #[error("Failed to read image stream: {0}")]
    Io(#[from] std::io::Error),
}

/// A validated latitude/longitude pair in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    latitude: f64,
    longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, ExtractionError> {
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);

        if !valid {
            return Err(ExtractionError::OutOfRange {
                latitude,
                longitude,
            });
        }

        Ok(Self {
            latitude,
            longitude,
        })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }
}

/// Recovers a geotag from an image byte stream.
///
/// Implementations must not perform I/O beyond reading `reader` and must be
/// safe to call concurrently on unrelated streams.
#[async_trait]
pub trait MetadataExtractor: Send + Sync {
    async fn extract(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<GeoPoint, ExtractionError>;
}

/// EXIF GPS extractor backed by `kamadak-exif`
#[derive(Debug, Clone)]
pub struct ExifGeoExtractor {
    max_buffered_bytes: usize,
}

impl ExifGeoExtractor {
    pub fn new(max_buffered_bytes: usize) -> Self {
        Self { max_buffered_bytes }
    }

    /// Buffer a non-streamable container and hand it to the EXIF reader
    async fn extract_buffered<R>(
        &self,
        reader: &mut R,
        header: &[u8],
    ) -> Result<GeoPoint, ExtractionError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let limit = self.max_buffered_bytes.max(header.len());
        let mut data = Vec::with_capacity(header.len());
        data.extend_from_slice(header);

        let remaining = (limit - header.len()) as u64 + 1;
        (&mut *reader).take(remaining).read_to_end(&mut data).await?;

        if data.len() > limit {
            return Err(ExtractionError::TooLarge { limit });
        }

        let exif = Reader::new()
            .read_from_container(&mut Cursor::new(data))
            .map_err(map_exif_error)?;

        geo_point_from_exif(&exif)
    }
}

impl Default for ExifGeoExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFERED_BYTES)
    }
}

#[async_trait]
impl MetadataExtractor for ExifGeoExtractor {
    async fn extract(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<GeoPoint, ExtractionError> {
        let mut header = [0u8; 12];
        read_header(reader, &mut header[..2]).await?;

        if header[..2] == [MARKER_PREFIX, SOI] {
            let tiff = read_jpeg_exif(reader).await?;
            trace!(size_bytes = tiff.len(), "Located EXIF segment in JPEG stream");
            let exif = Reader::new().read_raw(tiff).map_err(map_exif_error)?;
            return geo_point_from_exif(&exif);
        }

        read_header(reader, &mut header[2..]).await?;
        if !is_buffered_container(&header) {
            return Err(ExtractionError::UnrecognizedFormat);
        }

        self.extract_buffered(reader, &header).await
    }
}

async fn read_header<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ExtractionError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(ExtractionError::UnrecognizedFormat),
        Err(e) => Err(e.into()),
    }
}

/// TIFF, PNG, WebP or ISO-BMFF (HEIF) signatures
fn is_buffered_container(header: &[u8; 12]) -> bool {
    header.starts_with(b"II*\0")
        || header.starts_with(b"MM\0*")
        || header.starts_with(b"\x89PNG\r\n\x1a\n")
        || (header.starts_with(b"RIFF") && &header[8..12] == b"WEBP")
        || &header[4..8] == b"ftyp"
}

/// Walk JPEG marker segments after SOI and return the TIFF payload of the
/// first APP1 `Exif` segment.
async fn read_jpeg_exif<R>(reader: &mut R) -> Result<Vec<u8>, ExtractionError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        let marker = next_marker(reader).await?;
        match marker {
            EOI | SOS => return Err(ExtractionError::MissingMetadata),
            TEM | 0xD0..=0xD7 => continue,
            _ => {}
        }

        let length = reader.read_u16().await.map_err(truncated)? as usize;
        if length < 2 {
            return Err(ExtractionError::Malformed(format!(
                "segment 0x{:02X} has length {}",
                marker, length
            )));
        }
        let payload_len = length - 2;

        if marker == APP1 && payload_len >= EXIF_HEADER.len() {
            let mut payload = vec![0u8; payload_len];
            reader.read_exact(&mut payload).await.map_err(truncated)?;
            if payload.starts_with(EXIF_HEADER) {
                payload.drain(..EXIF_HEADER.len());
                return Ok(payload);
            }
            // XMP and other APP1 payloads
            continue;
        }

        let skipped = tokio::io::copy(
            &mut (&mut *reader).take(payload_len as u64),
            &mut tokio::io::sink(),
        )
        .await?;
        if skipped < payload_len as u64 {
            return Err(ExtractionError::MissingMetadata);
        }
    }
}

async fn next_marker<R>(reader: &mut R) -> Result<u8, ExtractionError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let prefix = reader.read_u8().await.map_err(truncated)?;
    if prefix != MARKER_PREFIX {
        return Err(ExtractionError::Malformed(format!(
            "expected JPEG marker, found 0x{:02X}",
            prefix
        )));
    }

    // Any number of 0xFF fill bytes may precede the marker code
    let mut code = reader.read_u8().await.map_err(truncated)?;
    while code == MARKER_PREFIX {
        code = reader.read_u8().await.map_err(truncated)?;
    }
    Ok(code)
}

fn truncated(err: std::io::Error) -> ExtractionError {
    if err.kind() == ErrorKind::UnexpectedEof {
        ExtractionError::MissingMetadata
    } else {
        ExtractionError::Io(err)
    }
}

fn map_exif_error(err: exif::Error) -> ExtractionError {
    match err {
        exif::Error::NotFound(_) => ExtractionError::MissingMetadata,
        exif::Error::Io(e) => ExtractionError::Io(e),
        other => ExtractionError::Malformed(other.to_string()),
    }
}

fn geo_point_from_exif(exif: &exif::Exif) -> Result<GeoPoint, ExtractionError> {
    let latitude = coordinate(exif, Tag::GPSLatitude, Tag::GPSLatitudeRef, (b'N', b'S'))?;
    let longitude = coordinate(exif, Tag::GPSLongitude, Tag::GPSLongitudeRef, (b'E', b'W'))?;
    GeoPoint::new(latitude, longitude)
}

/// Decimal degrees from a degrees/minutes/seconds rational triple and its
/// hemisphere reference.
fn coordinate(
    exif: &exif::Exif,
    value_tag: Tag,
    ref_tag: Tag,
    (positive, negative): (u8, u8),
) -> Result<f64, ExtractionError> {
    let field = exif
        .get_field(value_tag, In::PRIMARY)
        .ok_or_else(|| ExtractionError::MissingGeotag(format!("{} absent", value_tag)))?;

    let degrees = match &field.value {
        Value::Rational(parts) if !parts.is_empty() => parts
            .iter()
            .zip([1.0, 60.0, 3600.0])
            .map(|(part, scale)| part.to_f64() / scale)
            .sum::<f64>(),
        _ => {
            return Err(ExtractionError::MissingGeotag(format!(
                "{} is not a rational value",
                value_tag
            )))
        }
    };

    let reference = exif
        .get_field(ref_tag, In::PRIMARY)
        .ok_or_else(|| ExtractionError::MissingGeotag(format!("{} absent", ref_tag)))?;

    let hemisphere = match &reference.value {
        Value::Ascii(values) => values.first().and_then(|v| v.first()).copied(),
        _ => None,
    }
    .map(|b| b.to_ascii_uppercase());

    match hemisphere {
        Some(h) if h == positive => Ok(degrees),
        Some(h) if h == negative => Ok(-degrees),
        _ => Err(ExtractionError::MissingGeotag(format!(
            "{} is not {} or {}",
            ref_tag, positive as char, negative as char
        ))),
    }
}
