//! Media Discovery
//!
//! Decides which loader handles a file and turns files into media values.
//! Several discoveries may claim the same file; the registry probes them all
//! concurrently and ranks the matches by static priority.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::core::fs::validate_local_input_path;
use crate::core::media::sniff::{sniff, SNIFF_LEN};
use crate::core::media::{MediaKind, MediaValue, RawPayload, SourceAssetRef};
use crate::core::{CoreError, CoreResult, Options};

/// A strategy for recognizing and loading media files
#[async_trait]
pub trait MediaDiscovery: Send + Sync {
    /// Unique id within a registry
    fn id(&self) -> &str;

    /// Higher wins when several discoveries match
    fn priority(&self) -> i32;

    /// Whether this discovery recognizes the file; I/O failures read as `false`
    async fn can_handle(&self, path: &Path) -> bool;

    /// Loads the file as a value referencing it as its source asset
    async fn load(&self, path: &Path) -> CoreResult<MediaValue>;
}

/// Reads `path` and wraps it as a value of `kind`
async fn load_as(path: &Path, kind: MediaKind, format: Option<&str>) -> CoreResult<MediaValue> {
    let checked = validate_local_input_path(&path.to_string_lossy(), "media").await?;
    let bytes = tokio::fs::read(&checked).await?;
    let value = MediaValue::from_raw(kind, RawPayload::Bytes(bytes), format, Options::new())?;
    debug!("Loaded {} from {}", value, checked.display());
    Ok(value.with_source_asset(Some(SourceAssetRef::from_path(checked))))
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

// =============================================================================
// Extension Discovery
// =============================================================================

/// Matches file names against per-kind patterns
#[derive(Debug, Clone)]
pub struct ExtensionDiscovery {
    rules: Vec<(Regex, MediaKind)>,
}

impl ExtensionDiscovery {
    pub const ID: &'static str = "extension";

    /// Discovery with no rules
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Adds a rule; patterns are matched against the file name
    pub fn with_rule(mut self, pattern: &str, kind: MediaKind) -> CoreResult<Self> {
        let regex = Regex::new(pattern).map_err(|e| {
            CoreError::ValidationError(format!("Invalid discovery pattern '{}': {}", pattern, e))
        })?;
        self.rules.push((regex, kind));
        Ok(self)
    }

    /// Kind for a file name, first matching rule wins
    pub fn kind_for(&self, path: &Path) -> Option<MediaKind> {
        let name = path.file_name()?.to_str()?;
        self.rules
            .iter()
            .find(|(regex, _)| regex.is_match(name))
            .map(|(_, kind)| *kind)
    }
}

impl Default for ExtensionDiscovery {
    fn default() -> Self {
        let rules = [
            (r"(?i)\.(png|jpe?g|webp|gif|bmp)$", MediaKind::Image),
            (r"(?i)\.(wav|mp3|flac|ogg|m4a|aac)$", MediaKind::Audio),
            (r"(?i)\.(mp4|webm|mov|mkv|avi)$", MediaKind::Video),
            (r"(?i)\.(txt|md|markdown|json|ssml)$", MediaKind::Text),
        ];
        Self {
            rules: rules
                .into_iter()
                .filter_map(|(pattern, kind)| Regex::new(pattern).ok().map(|r| (r, kind)))
                .collect(),
        }
    }
}

#[async_trait]
impl MediaDiscovery for ExtensionDiscovery {
    fn id(&self) -> &str {
        Self::ID
    }

    fn priority(&self) -> i32 {
        10
    }

    async fn can_handle(&self, path: &Path) -> bool {
        self.kind_for(path).is_some()
    }

    async fn load(&self, path: &Path) -> CoreResult<MediaValue> {
        let kind = self.kind_for(path).ok_or_else(|| {
            CoreError::NotSupported(format!("No extension rule for {}", path.display()))
        })?;
        load_as(path, kind, extension_of(path).as_deref()).await
    }
}

// =============================================================================
// Magic Bytes Discovery
// =============================================================================

/// Recognizes binary formats from their leading bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct MagicBytesDiscovery;

impl MagicBytesDiscovery {
    pub const ID: &'static str = "magic-bytes";

    async fn sniff_file(path: &Path) -> Option<(MediaKind, &'static str)> {
        let mut file = tokio::fs::File::open(path).await.ok()?;
        let mut head = Vec::with_capacity(SNIFF_LEN);
        (&mut file)
            .take(SNIFF_LEN as u64)
            .read_to_end(&mut head)
            .await
            .ok()?;
        sniff(&head)
    }
}

#[async_trait]
impl MediaDiscovery for MagicBytesDiscovery {
    fn id(&self) -> &str {
        Self::ID
    }

    fn priority(&self) -> i32 {
        20
    }

    async fn can_handle(&self, path: &Path) -> bool {
        Self::sniff_file(path).await.is_some()
    }

    async fn load(&self, path: &Path) -> CoreResult<MediaValue> {
        let (kind, format) = Self::sniff_file(path).await.ok_or_else(|| {
            CoreError::NotSupported(format!("Unrecognized content in {}", path.display()))
        })?;
        load_as(path, kind, Some(format)).await
    }
}

// =============================================================================
// Discovery Registry
// =============================================================================

/// Registry of discoveries, ranked by priority
#[derive(Default)]
pub struct DiscoveryRegistry {
    discoveries: RwLock<Vec<Arc<dyn MediaDiscovery>>>,
}

impl DiscoveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the extension and magic-byte discoveries
    pub async fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(ExtensionDiscovery::default())).await;
        registry.register(Arc::new(MagicBytesDiscovery)).await;
        registry
    }

    /// Registers a discovery; returns `false` when the id is already taken
    pub async fn register(&self, discovery: Arc<dyn MediaDiscovery>) -> bool {
        let mut discoveries = self.discoveries.write().await;
        if discoveries.iter().any(|d| d.id() == discovery.id()) {
            debug!("Discovery {} already registered", discovery.id());
            return false;
        }
        info!("Registered discovery {}", discovery.id());
        discoveries.push(discovery);
        true
    }

    pub async fn len(&self) -> usize {
        self.discoveries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.discoveries.read().await.is_empty()
    }

    /// Discoveries that can handle `path`, highest priority first.
    ///
    /// All probes run concurrently and the ranking is computed after every
    /// probe has settled. Equal priorities keep registration order.
    pub async fn get_best_matching_discoveries(&self, path: &Path) -> Vec<Arc<dyn MediaDiscovery>> {
        let candidates = self.discoveries.read().await.clone();
        let verdicts = join_all(candidates.iter().map(|d| d.can_handle(path))).await;

        let mut matches: Vec<Arc<dyn MediaDiscovery>> = candidates
            .into_iter()
            .zip(verdicts)
            .filter_map(|(d, ok)| ok.then_some(d))
            .collect();
        matches.sort_by_key(|d| std::cmp::Reverse(d.priority()));
        matches
    }

    /// Loads `path` with the best matching discovery
    pub async fn load_media(&self, path: &Path) -> CoreResult<MediaValue> {
        let best = self
            .get_best_matching_discoveries(path)
            .await
            .into_iter()
            .next()
            .ok_or_else(|| {
                CoreError::NotSupported(format!("No discovery handles {}", path.display()))
            })?;
        debug!("Loading {} with {}", path.display(), best.id());
        best.load(path).await
    }
}

impl std::fmt::Debug for DiscoveryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryRegistry").finish_non_exhaustive()
    }
}
