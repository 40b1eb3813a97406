//! Mediaforge Core Type Definitions
//!
//! Defines fundamental types used throughout the project.

use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Asset unique identifier (ULID)
pub type AssetId = String;

/// Job unique identifier (ULID)
pub type JobId = String;

/// Provider identifier (e.g. "fal", "huggingface")
pub type ProviderId = String;

/// Model identifier, unique within one provider's catalog
pub type ModelId = String;

/// Project unique identifier (ULID)
pub type ProjectId = String;

/// Generates a new sortable unique identifier
pub fn new_id() -> String {
    ulid::Ulid::new().to_string()
}

// =============================================================================
// Options
// =============================================================================

/// Model invocation options (parameter name -> JSON value).
///
/// Backed by a sorted map so recorded lineage serializes deterministically.
pub type Options = serde_json::Map<String, serde_json::Value>;

/// Builds an [`Options`] map from a `serde_json::json!({...})` object literal.
///
/// Non-object values produce an empty map.
pub fn options_from(value: serde_json::Value) -> Options {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Options::new(),
    }
}

// =============================================================================
// Time Types
// =============================================================================

/// Time in seconds (floating point)
pub type TimeSec = f64;

// =============================================================================
// Spatial Types
// =============================================================================

/// 2D size in pixels
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size2D {
    pub width: u32,
    pub height: u32,
}

impl Size2D {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Aspect ratio as width / height (0.0 for a zero height)
    pub fn aspect_ratio(&self) -> f64 {
        if self.height == 0 {
            return 0.0;
        }
        self.width as f64 / self.height as f64
    }
}

impl std::fmt::Display for Size2D {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// =============================================================================
// Human-readable formatting
// =============================================================================

/// Formats a byte count, e.g. `1536` -> `"1.5 KB"`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Formats a duration, e.g. `75.5` -> `"1:15.5"`, `3.25` -> `"3.25s"`.
pub fn format_duration(seconds: TimeSec) -> String {
    if !seconds.is_finite() || seconds < 0.0 {
        return "unknown".to_string();
    }
    if seconds < 60.0 {
        return format!("{:.2}s", seconds);
    }
    let minutes = (seconds / 60.0).floor() as u64;
    let rest = seconds - (minutes as f64 * 60.0);
    if minutes < 60 {
        return format!("{}:{:04.1}", minutes, rest);
    }
    format!("{}:{:02}:{:04.1}", minutes / 60, minutes % 60, rest)
}
