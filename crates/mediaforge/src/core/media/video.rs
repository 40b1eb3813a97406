//! Video values

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{meta_f64, meta_str, meta_u64, AssetHeader, MediaAsset, MediaKind, MediaValue, SourceAssetRef};
use crate::core::{format_bytes, format_duration, Options, Size2D, TimeSec};

/// Video container tag
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    #[default]
    Mp4,
    Webm,
    Mov,
    Mkv,
    Avi,
}

impl VideoFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            VideoFormat::Mp4 => "mp4",
            VideoFormat::Webm => "webm",
            VideoFormat::Mov => "mov",
            VideoFormat::Mkv => "mkv",
            VideoFormat::Avi => "avi",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoFormat::Mp4 => "video/mp4",
            VideoFormat::Webm => "video/webm",
            VideoFormat::Mov => "video/quicktime",
            VideoFormat::Mkv => "video/x-matroska",
            VideoFormat::Avi => "video/x-msvideo",
        }
    }

    /// Parses an extension (with or without dot) or a MIME type
    pub fn parse(tag: &str) -> Option<Self> {
        let tag = tag.trim().trim_start_matches('.').to_ascii_lowercase();
        match tag.as_str() {
            "mp4" | "m4v" | "video/mp4" => Some(VideoFormat::Mp4),
            "webm" | "video/webm" => Some(VideoFormat::Webm),
            "mov" | "qt" | "video/quicktime" => Some(VideoFormat::Mov),
            "mkv" | "video/x-matroska" => Some(VideoFormat::Mkv),
            "avi" | "video/x-msvideo" => Some(VideoFormat::Avi),
            _ => None,
        }
    }
}

/// Video metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_sec: Option<TimeSec>,
    pub fps: Option<f64>,
    pub has_audio: Option<bool>,
    pub codec: Option<String>,
    /// Size of the original file, if known
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Options::is_empty")]
    pub extra: Options,
}

impl VideoMetadata {
    fn from_options(mut options: Options) -> Self {
        let meta = Self {
            width: meta_u64(&options, &["width"]).map(|v| v as u32),
            height: meta_u64(&options, &["height"]).map(|v| v as u32),
            duration_sec: meta_f64(&options, &["durationSec", "duration_sec", "duration"]),
            fps: meta_f64(&options, &["fps", "frameRate"]),
            has_audio: options
                .get("hasAudio")
                .or_else(|| options.get("has_audio"))
                .and_then(|v| v.as_bool()),
            codec: meta_str(&options, &["codec"]),
            file_size: meta_u64(&options, &["fileSize", "file_size"]),
            extra: Options::new(),
        };
        for key in [
            "width",
            "height",
            "durationSec",
            "duration_sec",
            "duration",
            "fps",
            "frameRate",
            "hasAudio",
            "has_audio",
            "codec",
            "fileSize",
            "file_size",
        ] {
            options.remove(key);
        }
        Self {
            extra: options,
            ..meta
        }
    }
}

/// A video clip
#[derive(Debug, Clone)]
pub struct Video {
    pub(crate) header: AssetHeader,
    data: Arc<[u8]>,
    format: VideoFormat,
    metadata: VideoMetadata,
}

impl Video {
    pub fn new(data: impl Into<Vec<u8>>, format: VideoFormat) -> Self {
        let data: Vec<u8> = data.into();
        Self {
            header: AssetHeader::new(),
            data: Arc::from(data),
            format,
            metadata: VideoMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: VideoMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub(crate) fn with_extra_metadata(self, options: Options) -> Self {
        self.with_metadata(VideoMetadata::from_options(options))
    }

    pub fn with_source_asset(mut self, source: SourceAssetRef) -> Self {
        self.header.set_source_asset(source);
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn format(&self) -> VideoFormat {
        self.format
    }

    pub fn metadata(&self) -> &VideoMetadata {
        &self.metadata
    }

    pub fn width(&self) -> Option<u32> {
        self.metadata.width
    }

    pub fn height(&self) -> Option<u32> {
        self.metadata.height
    }

    pub fn dimensions(&self) -> Option<Size2D> {
        Some(Size2D::new(self.width()?, self.height()?))
    }

    pub fn duration_sec(&self) -> Option<TimeSec> {
        self.metadata.duration_sec
    }

    pub fn has_audio(&self) -> Option<bool> {
        self.metadata.has_audio
    }

    /// File size; metadata wins since it may describe the original file
    pub fn file_size(&self) -> u64 {
        self.metadata.file_size.unwrap_or(self.data.len() as u64)
    }

    pub fn human_size(&self) -> String {
        format_bytes(self.file_size())
    }

    pub fn human_duration(&self) -> String {
        self.duration_sec()
            .map(format_duration)
            .unwrap_or_else(|| "unknown".to_string())
    }
}

impl MediaAsset for Video {
    const KIND: MediaKind = MediaKind::Video;

    fn header(&self) -> &AssetHeader {
        &self.header
    }

    fn is_valid(&self) -> bool {
        !self.data.is_empty()
    }

    fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    fn into_value(self) -> MediaValue {
        MediaValue::Video(self)
    }

    fn from_value(value: MediaValue) -> Result<Self, MediaValue> {
        match value {
            MediaValue::Video(v) => Ok(v),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for Video {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Video({}", self.format.extension())?;
        if let Some(dims) = self.dimensions() {
            write!(f, ", {}", dims)?;
        }
        write!(f, ", {}, {})", self.human_size(), self.human_duration())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_from_backend_options() {
        let video = Video::new(vec![0u8; 64], VideoFormat::Mp4).with_extra_metadata(
            crate::core::options_from(serde_json::json!({
                "width": 1280,
                "height": 720,
                "duration": 5.0,
                "hasAudio": true,
                "requestId": "abc"
            })),
        );

        assert_eq!(video.dimensions(), Some(Size2D::new(1280, 720)));
        assert_eq!(video.duration_sec(), Some(5.0));
        assert_eq!(video.has_audio(), Some(true));
        assert_eq!(video.metadata().extra.len(), 1);
        assert_eq!(video.to_string(), "Video(mp4, 1280x720, 64 B, 5.00s)");
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(VideoFormat::parse("video/quicktime"), Some(VideoFormat::Mov));
        assert_eq!(VideoFormat::parse("MKV"), Some(VideoFormat::Mkv));
        assert_eq!(VideoFormat::parse("gif"), None);
    }

    #[test]
    fn test_empty_video_is_invalid() {
        let video = Video::new(Vec::new(), VideoFormat::Webm);
        assert!(!video.is_valid());
        assert_eq!(video.file_size(), 0);
    }
}
