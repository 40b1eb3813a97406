//! Settings Persistence
//!
//! Provider credentials and endpoints, registry preferences and timeouts.
//!
//! - Atomic file writes (temp file + rename) under an advisory lock
//! - Tolerant loading: missing sections take defaults, bad values are clamped
//! - Environment overrides for credentials and service URLs
//!
//! Storage location: {config_dir}/mediaforge/settings.json

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::fs::atomic_write_json_pretty;
use crate::core::generative::{ProviderConfig, TieBreak};
use crate::core::{CoreError, CoreResult};

/// Settings schema version for migration support
pub const SETTINGS_VERSION: u32 = 1;

/// Settings file name
pub const SETTINGS_FILE: &str = "settings.json";

/// Lock file name (advisory lock to prevent concurrent writers)
pub const SETTINGS_LOCK_FILE: &str = "settings.json.lock";

/// Environment variable names
pub const ENV_FAL_KEY: &str = "FAL_KEY";
pub const ENV_HF_SERVICE_URL: &str = "HF_SERVICE_URL";
pub const ENV_FFMPEG_SERVICE_URL: &str = "FFMPEG_SERVICE_URL";
pub const ENV_CHATTERBOX_SERVICE_URL: &str = "CHATTERBOX_SERVICE_URL";
pub const ENV_PREFER_LOCAL: &str = "MEDIAFORGE_PREFER_LOCAL";

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Schema version for migrations
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub providers: ProvidersSettings,

    #[serde(default)]
    pub registry: RegistrySettings,

    #[serde(default)]
    pub timeouts: TimeoutSettings,

    /// Directory for upload/download temp files (system temp dir when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            providers: ProvidersSettings::default(),
            registry: RegistrySettings::default(),
            timeouts: TimeoutSettings::default(),
            temp_dir: None,
        }
    }
}

/// Per-provider configuration; `None` leaves the provider unregistered
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvidersSettings {
    #[serde(default)]
    pub fal: Option<ProviderConfig>,
    #[serde(default)]
    pub huggingface: Option<ProviderConfig>,
    #[serde(default)]
    pub ffmpeg: Option<ProviderConfig>,
    #[serde(default)]
    pub chatterbox: Option<ProviderConfig>,
}

/// Provider selection preferences
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySettings {
    /// Prefer local providers when any is available
    #[serde(default)]
    pub prefer_local: bool,
    /// Order among equally preferred candidates
    #[serde(default)]
    pub tie_break: TieBreak,
}

/// Timeouts, all in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutSettings {
    #[serde(default = "default_health_check_ms")]
    pub health_check_ms: u64,
    #[serde(default = "default_generation_ms")]
    pub generation_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_health_check_ms() -> u64 {
    crate::core::generative::registry::DEFAULT_PROBE_TIMEOUT_MS
}

fn default_generation_ms() -> u64 {
    crate::core::generative::models::DEFAULT_GENERATION_TIMEOUT_MS
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            health_check_ms: default_health_check_ms(),
            generation_ms: default_generation_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Settings {
    /// Normalizes and clamps settings so persisted state is always valid.
    ///
    /// Bad values are corrected instead of rejected.
    pub fn normalize(&mut self) {
        self.version = SETTINGS_VERSION;

        self.timeouts.health_check_ms = self.timeouts.health_check_ms.clamp(100, 60_000);
        self.timeouts.generation_ms = self.timeouts.generation_ms.clamp(1_000, 3_600_000);
        self.timeouts.poll_interval_ms = self.timeouts.poll_interval_ms.clamp(100, 60_000);

        for config in [
            &mut self.providers.fal,
            &mut self.providers.huggingface,
            &mut self.providers.ffmpeg,
            &mut self.providers.chatterbox,
        ]
        .into_iter()
        .flatten()
        {
            normalize_provider(config);
        }

        if self
            .temp_dir
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            self.temp_dir = None;
        }
    }

    /// Applies overrides from the process environment
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`; blank values are ignored
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(key) = get(ENV_FAL_KEY) {
            self.providers.fal.get_or_insert_with(ProviderConfig::default).api_key = Some(key);
        }
        if let Some(url) = get(ENV_HF_SERVICE_URL) {
            self.providers
                .huggingface
                .get_or_insert_with(ProviderConfig::default)
                .base_url = Some(url);
        }
        if let Some(url) = get(ENV_FFMPEG_SERVICE_URL) {
            self.providers
                .ffmpeg
                .get_or_insert_with(ProviderConfig::default)
                .base_url = Some(url);
        }
        if let Some(url) = get(ENV_CHATTERBOX_SERVICE_URL) {
            self.providers
                .chatterbox
                .get_or_insert_with(ProviderConfig::default)
                .base_url = Some(url);
        }
        if let Some(flag) = get(ENV_PREFER_LOCAL) {
            match parse_flag(&flag) {
                Some(prefer) => self.registry.prefer_local = prefer,
                None => warn!("Ignoring {}={:?}: expected a boolean", ENV_PREFER_LOCAL, flag),
            }
        }

        self.normalize();
        self
    }
}

fn normalize_provider(config: &mut ProviderConfig) {
    config.timeout_sec = config.timeout_sec.clamp(1, 3_600);
    config.max_retries = config.max_retries.min(10);
    config.api_key = config
        .api_key
        .take()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty());
    config.base_url = config
        .base_url
        .take()
        .map(|u| u.trim().trim_end_matches('/').to_string())
        .filter(|u| !u.is_empty());
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Default settings directory, `{config_dir}/mediaforge`
pub fn default_settings_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("mediaforge")
}

// =============================================================================
// SettingsManager
// =============================================================================

/// Settings manager for loading, saving, and resetting settings
#[derive(Debug, Clone)]
pub struct SettingsManager {
    settings_path: PathBuf,
}

impl Default for SettingsManager {
    fn default() -> Self {
        Self::new(default_settings_dir())
    }
}

impl SettingsManager {
    /// Creates a manager for `settings.json` inside `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            settings_path: dir.into().join(SETTINGS_FILE),
        }
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    fn lock_path(&self) -> PathBuf {
        self.settings_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(SETTINGS_LOCK_FILE)
    }

    fn with_lock<T>(&self, exclusive: bool, op: impl FnOnce() -> CoreResult<T>) -> CoreResult<T> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path())?;

        if exclusive {
            fs2::FileExt::lock_exclusive(&lock_file)?;
        } else {
            fs2::FileExt::lock_shared(&lock_file)?;
        }

        let result = op();

        if let Err(e) = fs2::FileExt::unlock(&lock_file) {
            warn!("Failed to unlock settings lock file: {}", e);
        }

        result
    }

    /// Reads settings; a missing file yields defaults
    pub fn try_load(&self) -> CoreResult<Settings> {
        self.with_lock(false, || {
            if !self.settings_path.exists() {
                info!("Settings file not found, using defaults");
                return Ok(Settings::default());
            }

            let content = fs::read_to_string(&self.settings_path)?;
            let mut settings: Settings = serde_json::from_str(&content).map_err(|e| {
                CoreError::Configuration(format!(
                    "Failed to parse {}: {}",
                    self.settings_path.display(),
                    e
                ))
            })?;

            if settings.version < SETTINGS_VERSION {
                info!(
                    "Migrating settings from version {} to {}",
                    settings.version, SETTINGS_VERSION
                );
            }
            settings.normalize();
            Ok(settings)
        })
    }

    /// Loads settings, falling back to defaults when the file is unreadable
    pub fn load(&self) -> Settings {
        match self.try_load() {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Failed to load settings, using defaults: {}", e);
                Settings::default()
            }
        }
    }

    /// Normalizes and writes settings atomically; returns what was written
    pub fn save(&self, settings: &Settings) -> CoreResult<Settings> {
        self.with_lock(true, || {
            let mut normalized = settings.clone();
            normalized.normalize();
            atomic_write_json_pretty(&self.settings_path, &normalized)?;
            info!("Settings saved to {}", self.settings_path.display());
            Ok(normalized)
        })
    }

    /// Deletes the settings file and returns defaults
    pub fn reset(&self) -> CoreResult<Settings> {
        self.with_lock(true, || {
            if self.settings_path.exists() {
                fs::remove_file(&self.settings_path)?;
                info!("Settings file deleted");
            }
            Ok(Settings::default())
        })
    }
}
