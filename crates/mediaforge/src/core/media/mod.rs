//! Media Value Types
//!
//! Immutable value wrappers for the four media kinds flowing through
//! transformation chains. A value owns its payload and metadata; lineage and
//! source references point backwards and are never used to re-derive it.

mod audio;
mod image;
pub mod sniff;
mod text;
mod video;

pub use audio::{Audio, AudioFormat, AudioMetadata};
pub use image::{Image, ImageFormat, ImageMetadata};
pub use text::{Text, TextFormat};
pub use video::{Video, VideoFormat, VideoMetadata};

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::fs::TempMediaFile;
use crate::core::lineage::{GenerationLineage, LineageChain};
use crate::core::{format_bytes, new_id, AssetId, CoreError, CoreResult, Options};

// =============================================================================
// Media Kind
// =============================================================================

/// The four media kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Text,
    Image,
    Audio,
    Video,
}

impl MediaKind {
    pub const ALL: [MediaKind; 4] = [
        MediaKind::Text,
        MediaKind::Image,
        MediaKind::Audio,
        MediaKind::Video,
    ];
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Text => write!(f, "text"),
            MediaKind::Image => write!(f, "image"),
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

impl std::str::FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(MediaKind::Text),
            "image" => Ok(MediaKind::Image),
            "audio" => Ok(MediaKind::Audio),
            "video" => Ok(MediaKind::Video),
            _ => Err(format!("Unknown media kind: {}", s)),
        }
    }
}

// =============================================================================
// Asset Header
// =============================================================================

/// Back-reference to the asset a value was loaded from.
///
/// Only identifies the original file; it never owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceAssetRef {
    pub asset_id: Option<AssetId>,
    pub path: Option<PathBuf>,
}

impl SourceAssetRef {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            asset_id: None,
            path: Some(path.into()),
        }
    }

    pub fn from_asset(asset_id: impl Into<AssetId>) -> Self {
        Self {
            asset_id: Some(asset_id.into()),
            path: None,
        }
    }
}

/// Identity and provenance shared by every media value
#[derive(Debug, Clone)]
pub struct AssetHeader {
    id: AssetId,
    created_at: DateTime<Utc>,
    lineage: Option<Arc<GenerationLineage>>,
    source_asset: Option<SourceAssetRef>,
}

impl AssetHeader {
    pub(crate) fn new() -> Self {
        Self {
            id: new_id(),
            created_at: Utc::now(),
            lineage: None,
            source_asset: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn lineage(&self) -> Option<&GenerationLineage> {
        self.lineage.as_deref()
    }

    pub fn source_asset(&self) -> Option<&SourceAssetRef> {
        self.source_asset.as_ref()
    }

    pub(crate) fn set_source_asset(&mut self, source: SourceAssetRef) {
        self.source_asset = Some(source);
    }

    pub(crate) fn set_lineage(&mut self, lineage: GenerationLineage) {
        self.lineage = Some(Arc::new(lineage));
    }
}

// =============================================================================
// MediaAsset Trait
// =============================================================================

/// Common contract of the concrete value types, used for typed role resolution.
pub trait MediaAsset: Clone + Send + Sync + Sized + 'static {
    /// The kind this type represents
    const KIND: MediaKind;

    fn header(&self) -> &AssetHeader;

    /// Whether the payload is usable (non-empty)
    fn is_valid(&self) -> bool;

    /// Payload length in bytes
    fn size_bytes(&self) -> u64;

    fn into_value(self) -> MediaValue;

    /// Extracts the concrete type, handing the value back on a kind mismatch
    fn from_value(value: MediaValue) -> Result<Self, MediaValue>;

    fn id(&self) -> &str {
        self.header().id()
    }

    fn lineage(&self) -> Option<&GenerationLineage> {
        self.header().lineage()
    }
}

// =============================================================================
// MediaValue
// =============================================================================

/// A media value of any kind
#[derive(Debug, Clone)]
pub enum MediaValue {
    Text(Text),
    Image(Image),
    Audio(Audio),
    Video(Video),
}

impl MediaValue {
    pub fn kind(&self) -> MediaKind {
        match self {
            MediaValue::Text(_) => MediaKind::Text,
            MediaValue::Image(_) => MediaKind::Image,
            MediaValue::Audio(_) => MediaKind::Audio,
            MediaValue::Video(_) => MediaKind::Video,
        }
    }

    pub fn header(&self) -> &AssetHeader {
        match self {
            MediaValue::Text(v) => v.header(),
            MediaValue::Image(v) => v.header(),
            MediaValue::Audio(v) => v.header(),
            MediaValue::Video(v) => v.header(),
        }
    }

    fn header_mut(&mut self) -> &mut AssetHeader {
        match self {
            MediaValue::Text(v) => &mut v.header,
            MediaValue::Image(v) => &mut v.header,
            MediaValue::Audio(v) => &mut v.header,
            MediaValue::Video(v) => &mut v.header,
        }
    }

    pub fn id(&self) -> &str {
        self.header().id()
    }

    pub fn is_valid(&self) -> bool {
        match self {
            MediaValue::Text(v) => v.is_valid(),
            MediaValue::Image(v) => v.is_valid(),
            MediaValue::Audio(v) => v.is_valid(),
            MediaValue::Video(v) => v.is_valid(),
        }
    }

    pub fn size_bytes(&self) -> u64 {
        match self {
            MediaValue::Text(v) => v.size_bytes(),
            MediaValue::Image(v) => v.size_bytes(),
            MediaValue::Audio(v) => v.size_bytes(),
            MediaValue::Video(v) => v.size_bytes(),
        }
    }

    /// Raw payload bytes (UTF-8 for text)
    pub fn payload(&self) -> &[u8] {
        match self {
            MediaValue::Text(v) => v.content().as_bytes(),
            MediaValue::Image(v) => v.data(),
            MediaValue::Audio(v) => v.data(),
            MediaValue::Video(v) => v.data(),
        }
    }

    /// Format tag as a file extension
    pub fn extension(&self) -> &'static str {
        match self {
            MediaValue::Text(v) => v.format().extension(),
            MediaValue::Image(v) => v.format().extension(),
            MediaValue::Audio(v) => v.format().extension(),
            MediaValue::Video(v) => v.format().extension(),
        }
    }

    /// Format tag as a MIME type
    pub fn mime_type(&self) -> &'static str {
        match self {
            MediaValue::Text(v) => v.format().mime_type(),
            MediaValue::Image(v) => v.format().mime_type(),
            MediaValue::Audio(v) => v.format().mime_type(),
            MediaValue::Video(v) => v.format().mime_type(),
        }
    }

    pub fn lineage(&self) -> Option<&GenerationLineage> {
        self.header().lineage()
    }

    pub fn source_asset(&self) -> Option<&SourceAssetRef> {
        self.header().source_asset()
    }

    /// Backward walk over the generation history of this value
    pub fn history(&self) -> LineageChain<'_> {
        LineageChain::new(self)
    }

    /// Number of transformations that produced this value (0 for an original)
    pub fn lineage_depth(&self) -> usize {
        self.history().count()
    }

    /// SHA-256 of the payload, hex encoded
    pub fn digest(&self) -> String {
        let hash = Sha256::digest(self.payload());
        hash.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn as_text(&self) -> Option<&Text> {
        match self {
            MediaValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_image(&self) -> Option<&Image> {
        match self {
            MediaValue::Image(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_audio(&self) -> Option<&Audio> {
        match self {
            MediaValue::Audio(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_video(&self) -> Option<&Video> {
        match self {
            MediaValue::Video(v) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn with_lineage(mut self, lineage: GenerationLineage) -> Self {
        self.header_mut().set_lineage(lineage);
        self
    }

    pub(crate) fn with_source_asset(mut self, source: Option<SourceAssetRef>) -> Self {
        if let Some(source) = source {
            self.header_mut().set_source_asset(source);
        }
        self
    }

    /// Builds a value of `kind` from raw backend output.
    ///
    /// Format tags may be extensions or MIME types; unknown tags fall back to
    /// sniffing the payload, then to the kind's default format.
    pub fn from_raw(kind: MediaKind, payload: RawPayload, format: Option<&str>, metadata: Options) -> CoreResult<Self> {
        let value = match (kind, payload) {
            (MediaKind::Text, RawPayload::Text(content)) => {
                let format = format.and_then(TextFormat::parse).unwrap_or_default();
                MediaValue::Text(Text::new(content).with_format(format).with_metadata(metadata))
            }
            (MediaKind::Text, RawPayload::Bytes(bytes)) => {
                let content = String::from_utf8(bytes).map_err(|e| {
                    CoreError::InvalidInput(format!("Text output is not valid UTF-8: {}", e))
                })?;
                return Self::from_raw(kind, RawPayload::Text(content), format, metadata);
            }
            (MediaKind::Image, RawPayload::Bytes(bytes)) => {
                let format = resolve_format(format, &bytes, ImageFormat::parse);
                MediaValue::Image(Image::new(bytes, format).with_extra_metadata(metadata))
            }
            (MediaKind::Audio, RawPayload::Bytes(bytes)) => {
                let format = resolve_format(format, &bytes, AudioFormat::parse);
                MediaValue::Audio(Audio::new(bytes, format).with_extra_metadata(metadata))
            }
            (MediaKind::Video, RawPayload::Bytes(bytes)) => {
                let format = resolve_format(format, &bytes, VideoFormat::parse);
                MediaValue::Video(Video::new(bytes, format).with_extra_metadata(metadata))
            }
            (kind, RawPayload::Text(_)) => {
                return Err(CoreError::InvalidInput(format!(
                    "Expected binary payload for {} output, got text",
                    kind
                )))
            }
        };
        Ok(value)
    }

    /// Serializable summary for diagnostics and reports
    pub fn summary(&self) -> MediaSummary {
        MediaSummary {
            id: self.id().to_string(),
            kind: self.kind(),
            format: self.extension().to_string(),
            size_bytes: self.size_bytes(),
            valid: self.is_valid(),
            digest: self.digest(),
            preview: self.as_text().map(|t| t.preview(80)),
            lineage_depth: self.lineage_depth(),
        }
    }
}

impl std::fmt::Display for MediaValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaValue::Text(v) => v.fmt(f),
            MediaValue::Image(v) => v.fmt(f),
            MediaValue::Audio(v) => v.fmt(f),
            MediaValue::Video(v) => v.fmt(f),
        }
    }
}

impl From<Text> for MediaValue {
    fn from(v: Text) -> Self {
        MediaValue::Text(v)
    }
}

impl From<Image> for MediaValue {
    fn from(v: Image) -> Self {
        MediaValue::Image(v)
    }
}

impl From<Audio> for MediaValue {
    fn from(v: Audio) -> Self {
        MediaValue::Audio(v)
    }
}

impl From<Video> for MediaValue {
    fn from(v: Video) -> Self {
        MediaValue::Video(v)
    }
}

fn resolve_format<F: Default>(tag: Option<&str>, bytes: &[u8], parse: fn(&str) -> Option<F>) -> F {
    tag.and_then(parse)
        .or_else(|| sniff::sniff(bytes).and_then(|(_, ext)| parse(ext)))
        .unwrap_or_default()
}

/// Serializable description of a media value
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaSummary {
    pub id: AssetId,
    pub kind: MediaKind,
    pub format: String,
    pub size_bytes: u64,
    pub valid: bool,
    pub digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    pub lineage_depth: usize,
}

impl std::fmt::Display for MediaSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} ({}, {})",
            self.kind,
            self.id,
            self.format,
            format_bytes(self.size_bytes)
        )
    }
}

// =============================================================================
// Raw Backend Output
// =============================================================================

/// Payload returned by a backend before it is wrapped in a value
#[derive(Debug)]
pub enum RawPayload {
    Bytes(Vec<u8>),
    Text(String),
}

/// Backend output as produced by a model invocation
#[derive(Debug)]
pub struct RawMedia {
    pub payload: RawMediaPayload,
    /// Extension or MIME type, if the backend reported one
    pub format: Option<String>,
    /// Backend-reported metadata (dimensions, duration, ...)
    pub metadata: Options,
}

/// Raw payload, possibly still sitting in a temp file
#[derive(Debug)]
pub enum RawMediaPayload {
    Bytes(Vec<u8>),
    Text(String),
    TempFile(TempMediaFile),
}

impl RawMedia {
    pub fn bytes(data: Vec<u8>, format: impl Into<String>) -> Self {
        Self {
            payload: RawMediaPayload::Bytes(data),
            format: Some(format.into()),
            metadata: Options::new(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self {
            payload: RawMediaPayload::Text(content.into()),
            format: None,
            metadata: Options::new(),
        }
    }

    pub fn temp_file(file: TempMediaFile, format: impl Into<String>) -> Self {
        Self {
            payload: RawMediaPayload::TempFile(file),
            format: Some(format.into()),
            metadata: Options::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Options) -> Self {
        self.metadata = metadata;
        self
    }

    /// Materializes the payload in memory and builds the value.
    ///
    /// Temp-file payloads are read and the file removed once the value exists;
    /// on a read failure the file is still removed when the guard drops.
    pub async fn into_value(self, kind: MediaKind) -> CoreResult<MediaValue> {
        let payload = match self.payload {
            RawMediaPayload::Bytes(b) => RawPayload::Bytes(b),
            RawMediaPayload::Text(t) => RawPayload::Text(t),
            RawMediaPayload::TempFile(file) => {
                let data = file.read().await?;
                let value = MediaValue::from_raw(
                    kind,
                    RawPayload::Bytes(data),
                    self.format.as_deref(),
                    self.metadata,
                )?;
                file.remove().await?;
                return Ok(value);
            }
        };
        MediaValue::from_raw(kind, payload, self.format.as_deref(), self.metadata)
    }
}

// =============================================================================
// Metadata helpers
// =============================================================================

/// Typed lookups over backend metadata, accepting camelCase and snake_case keys
pub(crate) fn meta_u64(metadata: &Options, keys: &[&str]) -> Option<u64> {
    keys.iter()
        .find_map(|k| metadata.get(*k))
        .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f as u64)))
}

pub(crate) fn meta_f64(metadata: &Options, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .find_map(|k| metadata.get(*k))
        .and_then(|v| v.as_f64())
}

pub(crate) fn meta_str(metadata: &Options, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| metadata.get(*k))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::sniff::fixtures::*;
    use super::*;

    #[test]
    fn test_media_kind_roundtrip() {
        for kind in MediaKind::ALL {
            assert_eq!(kind.to_string().parse::<MediaKind>().unwrap(), kind);
        }
        assert!("hologram".parse::<MediaKind>().is_err());
        assert_eq!(serde_json::to_string(&MediaKind::Audio).unwrap(), "\"audio\"");
    }

    #[test]
    fn test_values_get_distinct_ids() {
        let a = MediaValue::from(Text::new("same"));
        let b = MediaValue::from(Text::new("same"));

        assert_ne!(a.id(), b.id());
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);
    }

    #[test]
    fn test_clone_keeps_identity() {
        let a = MediaValue::from(Image::new(png_header(2, 2), ImageFormat::Png));
        let b = a.clone();
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_from_raw_image_sniffs_format_and_size() {
        let value = MediaValue::from_raw(
            MediaKind::Image,
            RawPayload::Bytes(png_header(320, 200)),
            None,
            Options::new(),
        )
        .unwrap();

        let image = value.as_image().unwrap();
        assert_eq!(image.format(), ImageFormat::Png);
        assert_eq!(image.width(), Some(320));
        assert_eq!(image.height(), Some(200));
    }

    #[test]
    fn test_from_raw_accepts_mime_type() {
        let value = MediaValue::from_raw(
            MediaKind::Audio,
            RawPayload::Bytes(vec![1, 2, 3]),
            Some("audio/mpeg"),
            Options::new(),
        )
        .unwrap();
        assert_eq!(value.as_audio().unwrap().format(), AudioFormat::Mp3);
    }

    #[test]
    fn test_from_raw_rejects_text_for_binary_kind() {
        let result = MediaValue::from_raw(
            MediaKind::Video,
            RawPayload::Text("oops".to_string()),
            None,
            Options::new(),
        );
        assert!(matches!(result, Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn test_from_raw_text_from_bytes() {
        let value = MediaValue::from_raw(
            MediaKind::Text,
            RawPayload::Bytes(b"hello".to_vec()),
            Some("md"),
            Options::new(),
        )
        .unwrap();
        let text = value.as_text().unwrap();
        assert_eq!(text.content(), "hello");
        assert_eq!(text.format(), TextFormat::Markdown);
    }

    #[tokio::test]
    async fn test_raw_temp_file_is_removed_after_materializing() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = TempMediaFile::create(Some(dir.path()), "wav", &wav_bytes(8000, 800))
            .await
            .unwrap();
        let path = file.path().to_path_buf();

        let value = RawMedia::temp_file(file, "wav")
            .into_value(MediaKind::Audio)
            .await
            .unwrap();

        assert!(value.is_valid());
        assert!(!path.exists());
    }

    #[test]
    fn test_summary() {
        let value = MediaValue::from(Text::new("a dragon"));
        let summary = value.summary();

        assert_eq!(summary.kind, MediaKind::Text);
        assert_eq!(summary.preview.as_deref(), Some("a dragon"));
        assert_eq!(summary.lineage_depth, 0);
        assert!(summary.valid);
    }
}
