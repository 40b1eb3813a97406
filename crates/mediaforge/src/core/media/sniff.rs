//! Content Sniffing
//!
//! Identifies media kind/format from leading bytes and reads image dimensions
//! straight from PNG/JPEG headers, without decoding pixel data.

use super::MediaKind;
use crate::core::Size2D;

/// Number of leading bytes needed by [`sniff`]
pub const SNIFF_LEN: usize = 16;

/// Identifies the media kind and canonical extension from leading bytes.
pub fn sniff(bytes: &[u8]) -> Option<(MediaKind, &'static str)> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some((MediaKind::Image, "png"));
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some((MediaKind::Image, "jpg"));
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some((MediaKind::Image, "gif"));
    }
    if bytes.starts_with(b"BM") && bytes.len() >= 6 {
        return Some((MediaKind::Image, "bmp"));
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" {
        match &bytes[8..12] {
            b"WEBP" => return Some((MediaKind::Image, "webp")),
            b"WAVE" => return Some((MediaKind::Audio, "wav")),
            b"AVI " => return Some((MediaKind::Video, "avi")),
            _ => {}
        }
    }
    if bytes.starts_with(b"ID3") || bytes.starts_with(&[0xFF, 0xFB]) || bytes.starts_with(&[0xFF, 0xF3])
    {
        return Some((MediaKind::Audio, "mp3"));
    }
    if bytes.starts_with(b"fLaC") {
        return Some((MediaKind::Audio, "flac"));
    }
    if bytes.starts_with(b"OggS") {
        return Some((MediaKind::Audio, "ogg"));
    }
    if bytes.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some((MediaKind::Video, "webm"));
    }
    if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        return match &bytes[8..12] {
            b"M4A " => Some((MediaKind::Audio, "m4a")),
            b"qt  " => Some((MediaKind::Video, "mov")),
            _ => Some((MediaKind::Video, "mp4")),
        };
    }
    None
}

/// Reads width/height from a PNG IHDR chunk.
pub fn png_dimensions(bytes: &[u8]) -> Option<Size2D> {
    // signature (8) + chunk length (4) + "IHDR" (4) + width (4) + height (4)
    if bytes.len() < 24 || &bytes[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    let height = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
    Some(Size2D::new(width, height))
}

/// Reads width/height from the first JPEG start-of-frame segment.
pub fn jpeg_dimensions(bytes: &[u8]) -> Option<Size2D> {
    if !bytes.starts_with(&[0xFF, 0xD8]) {
        return None;
    }
    let mut pos = 2;
    while pos + 4 <= bytes.len() {
        if bytes[pos] != 0xFF {
            pos += 1;
            continue;
        }
        let marker = bytes[pos + 1];
        // Standalone markers carry no length
        if marker == 0xD8 || marker == 0x01 || (0xD0..=0xD7).contains(&marker) {
            pos += 2;
            continue;
        }
        let len = u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]) as usize;
        let is_sof = matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_sof {
            if pos + 9 > bytes.len() {
                return None;
            }
            let height = u16::from_be_bytes([bytes[pos + 5], bytes[pos + 6]]) as u32;
            let width = u16::from_be_bytes([bytes[pos + 7], bytes[pos + 8]]) as u32;
            return Some(Size2D::new(width, height));
        }
        pos += 2 + len;
    }
    None
}

/// Reads image dimensions for any format with a known header layout.
pub fn image_dimensions(bytes: &[u8]) -> Option<Size2D> {
    png_dimensions(bytes).or_else(|| jpeg_dimensions(bytes))
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// Minimal PNG header (signature + IHDR) for the given size
    pub fn png_header(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        bytes.extend_from_slice(&13u32.to_be_bytes());
        bytes.extend_from_slice(b"IHDR");
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&height.to_be_bytes());
        bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
        bytes
    }

    /// In-memory 16-bit mono WAV with the given number of samples
    pub fn wav_bytes(sample_rate: u32, samples: usize) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for i in 0..samples {
                writer.write_sample((i % 100) as i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }
}
