//! Text values

use serde::{Deserialize, Serialize};

use super::{meta_f64, meta_str, AssetHeader, MediaAsset, MediaKind, MediaValue, SourceAssetRef};
use crate::core::Options;

/// Text content flavor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextFormat {
    #[default]
    Plain,
    Markdown,
    Json,
    Ssml,
}

impl TextFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            TextFormat::Plain => "txt",
            TextFormat::Markdown => "md",
            TextFormat::Json => "json",
            TextFormat::Ssml => "ssml",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            TextFormat::Plain => "text/plain",
            TextFormat::Markdown => "text/markdown",
            TextFormat::Json => "application/json",
            TextFormat::Ssml => "application/ssml+xml",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        let tag = tag.trim().trim_start_matches('.').to_ascii_lowercase();
        match tag.as_str() {
            "txt" | "text" | "plain" | "text/plain" => Some(TextFormat::Plain),
            "md" | "markdown" | "text/markdown" => Some(TextFormat::Markdown),
            "json" | "application/json" => Some(TextFormat::Json),
            "ssml" | "application/ssml+xml" => Some(TextFormat::Ssml),
            _ => None,
        }
    }
}

/// A piece of text such as a prompt or a transcript
#[derive(Debug, Clone)]
pub struct Text {
    pub(crate) header: AssetHeader,
    content: String,
    format: TextFormat,
    language: Option<String>,
    /// Recognition confidence for transcripts, 0..1
    confidence: Option<f32>,
    extra: Options,
}

impl Text {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            header: AssetHeader::new(),
            content: content.into(),
            format: TextFormat::default(),
            language: None,
            confidence: None,
            extra: Options::new(),
        }
    }

    pub fn with_format(mut self, format: TextFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    /// Applies backend metadata; `language` and `confidence` are lifted out
    pub fn with_metadata(mut self, mut metadata: Options) -> Self {
        if let Some(language) = meta_str(&metadata, &["language", "lang"]) {
            self.language = Some(language);
        }
        if let Some(confidence) = meta_f64(&metadata, &["confidence"]) {
            self = self.with_confidence(confidence as f32);
        }
        for key in ["language", "lang", "confidence"] {
            metadata.remove(key);
        }
        self.extra.extend(metadata);
        self
    }

    pub fn with_source_asset(mut self, source: SourceAssetRef) -> Self {
        self.header.set_source_asset(source);
        self
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn format(&self) -> TextFormat {
        self.format
    }

    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    pub fn confidence(&self) -> Option<f32> {
        self.confidence
    }

    pub fn extra(&self) -> &Options {
        &self.extra
    }

    pub fn char_count(&self) -> usize {
        self.content.chars().count()
    }

    pub fn word_count(&self) -> usize {
        self.content.split_whitespace().count()
    }

    /// First `max_chars` characters, with an ellipsis when truncated
    pub fn preview(&self, max_chars: usize) -> String {
        let mut chars = self.content.chars();
        let head: String = chars.by_ref().take(max_chars).collect();
        if chars.next().is_some() {
            format!("{}...", head)
        } else {
            head
        }
    }
}

impl MediaAsset for Text {
    const KIND: MediaKind = MediaKind::Text;

    fn header(&self) -> &AssetHeader {
        &self.header
    }

    /// Whitespace-only text is not a usable input
    fn is_valid(&self) -> bool {
        !self.content.trim().is_empty()
    }

    fn size_bytes(&self) -> u64 {
        self.content.len() as u64
    }

    fn into_value(self) -> MediaValue {
        MediaValue::Text(self)
    }

    fn from_value(value: MediaValue) -> Result<Self, MediaValue> {
        match value {
            MediaValue::Text(v) => Ok(v),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for Text {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Text({:?})", self.preview(40))
    }
}
