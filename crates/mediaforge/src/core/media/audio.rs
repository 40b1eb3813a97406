//! Audio values

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{meta_f64, meta_u64, AssetHeader, MediaAsset, MediaKind, MediaValue, SourceAssetRef};
use crate::core::{format_bytes, format_duration, CoreError, CoreResult, Options, TimeSec};

/// Audio container/codec tag
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Wav,
    Mp3,
    Ogg,
    Flac,
    Aac,
    M4a,
    Opus,
}

impl AudioFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Ogg => "ogg",
            AudioFormat::Flac => "flac",
            AudioFormat::Aac => "aac",
            AudioFormat::M4a => "m4a",
            AudioFormat::Opus => "opus",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "audio/wav",
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::Ogg => "audio/ogg",
            AudioFormat::Flac => "audio/flac",
            AudioFormat::Aac => "audio/aac",
            AudioFormat::M4a => "audio/mp4",
            AudioFormat::Opus => "audio/opus",
        }
    }

    /// Parses an extension (with or without dot) or a MIME type
    pub fn parse(tag: &str) -> Option<Self> {
        let tag = tag.trim().trim_start_matches('.').to_ascii_lowercase();
        match tag.as_str() {
            "wav" | "wave" | "audio/wav" | "audio/x-wav" | "audio/wave" => Some(AudioFormat::Wav),
            "mp3" | "audio/mpeg" | "audio/mp3" => Some(AudioFormat::Mp3),
            "ogg" | "oga" | "audio/ogg" => Some(AudioFormat::Ogg),
            "flac" | "audio/flac" | "audio/x-flac" => Some(AudioFormat::Flac),
            "aac" | "audio/aac" => Some(AudioFormat::Aac),
            "m4a" | "audio/mp4" | "audio/x-m4a" => Some(AudioFormat::M4a),
            "opus" | "audio/opus" => Some(AudioFormat::Opus),
            _ => None,
        }
    }
}

/// Audio metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioMetadata {
    pub duration_sec: Option<TimeSec>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub bitrate: Option<u32>,
    /// Size of the original file, if known
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Options::is_empty")]
    pub extra: Options,
}

impl AudioMetadata {
    fn from_options(mut options: Options) -> Self {
        let meta = Self {
            duration_sec: meta_f64(&options, &["durationSec", "duration_sec", "duration"]),
            sample_rate: meta_u64(&options, &["sampleRate", "sample_rate"]).map(|v| v as u32),
            channels: meta_u64(&options, &["channels"]).map(|v| v as u16),
            bitrate: meta_u64(&options, &["bitrate"]).map(|v| v as u32),
            file_size: meta_u64(&options, &["fileSize", "file_size"]),
            extra: Options::new(),
        };
        for key in [
            "durationSec",
            "duration_sec",
            "duration",
            "sampleRate",
            "sample_rate",
            "channels",
            "bitrate",
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

/// An audio clip
#[derive(Debug, Clone)]
pub struct Audio {
    pub(crate) header: AssetHeader,
    data: Arc<[u8]>,
    format: AudioFormat,
    metadata: AudioMetadata,
}

impl Audio {
    pub fn new(data: impl Into<Vec<u8>>, format: AudioFormat) -> Self {
        let data: Vec<u8> = data.into();
        let mut audio = Self {
            header: AssetHeader::new(),
            data: Arc::from(data),
            format,
            metadata: AudioMetadata::default(),
        };
        if format == AudioFormat::Wav {
            audio.fill_wav_metadata();
        }
        audio
    }

    /// Builds a WAV value, failing if the header cannot be parsed
    pub fn from_wav_bytes(data: impl Into<Vec<u8>>) -> CoreResult<Self> {
        let data: Vec<u8> = data.into();
        hound::WavReader::new(std::io::Cursor::new(&data[..]))
            .map_err(|e| CoreError::InvalidInput(format!("Invalid WAV data: {}", e)))?;
        Ok(Self::new(data, AudioFormat::Wav))
    }

    /// Sets metadata; fields left empty keep values probed from the payload
    pub fn with_metadata(mut self, metadata: AudioMetadata) -> Self {
        let probed = std::mem::take(&mut self.metadata);
        self.metadata = AudioMetadata {
            duration_sec: metadata.duration_sec.or(probed.duration_sec),
            sample_rate: metadata.sample_rate.or(probed.sample_rate),
            channels: metadata.channels.or(probed.channels),
            bitrate: metadata.bitrate.or(probed.bitrate),
            file_size: metadata.file_size,
            extra: metadata.extra,
        };
        self
    }

    pub(crate) fn with_extra_metadata(self, options: Options) -> Self {
        self.with_metadata(AudioMetadata::from_options(options))
    }

    pub fn with_source_asset(mut self, source: SourceAssetRef) -> Self {
        self.header.set_source_asset(source);
        self
    }

    fn fill_wav_metadata(&mut self) {
        if let Ok(reader) = hound::WavReader::new(std::io::Cursor::new(&self.data[..])) {
            let spec = reader.spec();
            self.metadata.sample_rate = Some(spec.sample_rate);
            self.metadata.channels = Some(spec.channels);
            if spec.sample_rate > 0 {
                self.metadata.duration_sec =
                    Some(reader.duration() as f64 / spec.sample_rate as f64);
            }
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn metadata(&self) -> &AudioMetadata {
        &self.metadata
    }

    pub fn duration_sec(&self) -> Option<TimeSec> {
        self.metadata.duration_sec
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.metadata.sample_rate
    }

    pub fn channels(&self) -> Option<u16> {
        self.metadata.channels
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

impl MediaAsset for Audio {
    const KIND: MediaKind = MediaKind::Audio;

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
        MediaValue::Audio(self)
    }

    fn from_value(value: MediaValue) -> Result<Self, MediaValue> {
        match value {
            MediaValue::Audio(v) => Ok(v),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for Audio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Audio({}, {}, {}",
            self.format.extension(),
            self.human_size(),
            self.human_duration()
        )?;
        if let Some(rate) = self.sample_rate() {
            write!(f, ", {} Hz", rate)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::super::sniff::fixtures::wav_bytes;
    use super::*;

    #[test]
    fn test_wav_metadata_is_probed() {
        let audio = Audio::from_wav_bytes(wav_bytes(16000, 8000)).unwrap();

        assert_eq!(audio.sample_rate(), Some(16000));
        assert_eq!(audio.channels(), Some(1));
        assert_eq!(audio.duration_sec(), Some(0.5));
        assert_eq!(audio.human_duration(), "0.50s");
        assert!(audio.is_valid());
    }

    #[test]
    fn test_invalid_wav_rejected() {
        assert!(matches!(
            Audio::from_wav_bytes(vec![1, 2, 3]),
            Err(CoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_empty_audio_is_invalid() {
        let audio = Audio::new(Vec::new(), AudioFormat::Mp3);
        assert!(!audio.is_valid());
        assert_eq!(audio.human_duration(), "unknown");
    }

    #[test]
    fn test_file_size_prefers_metadata() {
        let audio = Audio::new(vec![0u8; 10], AudioFormat::Mp3).with_metadata(AudioMetadata {
            file_size: Some(4096),
            ..Default::default()
        });
        assert_eq!(audio.file_size(), 4096);
        assert_eq!(audio.size_bytes(), 10);
    }

    #[test]
    fn test_extra_metadata_mapping() {
        let audio = Audio::new(vec![1u8; 4], AudioFormat::Mp3).with_extra_metadata(
            crate::core::options_from(serde_json::json!({
                "sampleRate": 44100,
                "duration": 2.5,
                "voice": "af_bella"
            })),
        );
        assert_eq!(audio.sample_rate(), Some(44100));
        assert_eq!(audio.duration_sec(), Some(2.5));
        assert_eq!(audio.metadata().extra.get("voice"), Some(&serde_json::json!("af_bella")));
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(AudioFormat::parse(".MP3"), Some(AudioFormat::Mp3));
        assert_eq!(AudioFormat::parse("audio/x-wav"), Some(AudioFormat::Wav));
        assert_eq!(AudioFormat::parse("midi"), None);
    }
}
