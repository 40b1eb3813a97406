//! Image values

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::sniff::image_dimensions;
use super::{meta_u64, AssetHeader, MediaAsset, MediaKind, MediaValue, SourceAssetRef};
use crate::core::{format_bytes, Options, Size2D};

/// Image encoding tag
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Png,
    Jpeg,
    Webp,
    Gif,
    Bmp,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Webp => "webp",
            ImageFormat::Gif => "gif",
            ImageFormat::Bmp => "bmp",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Webp => "image/webp",
            ImageFormat::Gif => "image/gif",
            ImageFormat::Bmp => "image/bmp",
        }
    }

    /// Parses an extension (with or without dot) or a MIME type
    pub fn parse(tag: &str) -> Option<Self> {
        let tag = tag.trim().trim_start_matches('.').to_ascii_lowercase();
        match tag.as_str() {
            "png" | "image/png" => Some(ImageFormat::Png),
            "jpg" | "jpeg" | "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
            "webp" | "image/webp" => Some(ImageFormat::Webp),
            "gif" | "image/gif" => Some(ImageFormat::Gif),
            "bmp" | "image/bmp" => Some(ImageFormat::Bmp),
            _ => None,
        }
    }
}

/// Image metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Size of the original file, if known
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Options::is_empty")]
    pub extra: Options,
}

/// A still image
#[derive(Debug, Clone)]
pub struct Image {
    pub(crate) header: AssetHeader,
    data: Arc<[u8]>,
    format: ImageFormat,
    metadata: ImageMetadata,
}

impl Image {
    /// Creates an image, reading dimensions from the header when possible
    pub fn new(data: impl Into<Vec<u8>>, format: ImageFormat) -> Self {
        let data: Vec<u8> = data.into();
        let dims = image_dimensions(&data);
        Self {
            header: AssetHeader::new(),
            data: Arc::from(data),
            format,
            metadata: ImageMetadata {
                width: dims.map(|d| d.width),
                height: dims.map(|d| d.height),
                ..Default::default()
            },
        }
    }

    /// Sets metadata; empty dimensions keep the values read from the header
    pub fn with_metadata(mut self, metadata: ImageMetadata) -> Self {
        self.metadata = ImageMetadata {
            width: metadata.width.or(self.metadata.width),
            height: metadata.height.or(self.metadata.height),
            file_size: metadata.file_size,
            extra: metadata.extra,
        };
        self
    }

    pub(crate) fn with_extra_metadata(self, mut options: Options) -> Self {
        let width = meta_u64(&options, &["width"]).map(|v| v as u32);
        let height = meta_u64(&options, &["height"]).map(|v| v as u32);
        let file_size = meta_u64(&options, &["fileSize", "file_size"]);
        for key in ["width", "height", "fileSize", "file_size"] {
            options.remove(key);
        }
        self.with_metadata(ImageMetadata {
            width,
            height,
            file_size,
            extra: options,
        })
    }

    pub fn with_source_asset(mut self, source: SourceAssetRef) -> Self {
        self.header.set_source_asset(source);
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn metadata(&self) -> &ImageMetadata {
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

    /// File size; metadata wins since it may describe the original file
    pub fn file_size(&self) -> u64 {
        self.metadata.file_size.unwrap_or(self.data.len() as u64)
    }

    pub fn human_size(&self) -> String {
        format_bytes(self.file_size())
    }
}

impl MediaAsset for Image {
    const KIND: MediaKind = MediaKind::Image;

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
        MediaValue::Image(self)
    }

    fn from_value(value: MediaValue) -> Result<Self, MediaValue> {
        match value {
            MediaValue::Image(v) => Ok(v),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.dimensions() {
            Some(dims) => write!(
                f,
                "Image({}, {}, {})",
                self.format.extension(),
                dims,
                self.human_size()
            ),
            None => write!(f, "Image({}, {})", self.format.extension(), self.human_size()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::sniff::fixtures::png_header;
    use super::*;

    #[test]
    fn test_dimensions_from_header() {
        let image = Image::new(png_header(1024, 768), ImageFormat::Png);
        assert_eq!(image.dimensions(), Some(Size2D::new(1024, 768)));
        assert!(image.to_string().starts_with("Image(png, 1024x768"));
    }

    #[test]
    fn test_metadata_overrides_header() {
        let image = Image::new(png_header(10, 10), ImageFormat::Png).with_metadata(ImageMetadata {
            width: Some(20),
            file_size: Some(2048),
            ..Default::default()
        });
        assert_eq!(image.width(), Some(20));
        assert_eq!(image.height(), Some(10));
        assert_eq!(image.human_size(), "2.0 KB");
    }

    #[test]
    fn test_unknown_dimensions() {
        let image = Image::new(vec![1, 2, 3], ImageFormat::Webp);
        assert_eq!(image.dimensions(), None);
        assert_eq!(image.to_string(), "Image(webp, 3 B)");
    }

    #[test]
    fn test_empty_image_is_invalid() {
        assert!(!Image::new(Vec::new(), ImageFormat::Png).is_valid());
    }
}
