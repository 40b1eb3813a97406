//! Composition Projects
//!
//! Persisted compositions referencing media assets by id: clips, overlays and
//! an optional crossfade. Storage sits behind [`ProjectStore`].

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::core::fs::{atomic_write_json_pretty, validate_path_id_component};
use crate::core::{new_id, AssetId, CoreError, CoreResult, ProjectId, TimeSec};

// =============================================================================
// Project Model
// =============================================================================

/// A segment of an asset placed on the composition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clip {
    pub asset_id: AssetId,
    pub in_point: TimeSec,
    pub out_point: TimeSec,
}

impl Clip {
    pub fn new(asset_id: impl Into<AssetId>, in_point: TimeSec, out_point: TimeSec) -> Self {
        Self {
            asset_id: asset_id.into(),
            in_point,
            out_point,
        }
    }

    pub fn duration(&self) -> TimeSec {
        (self.out_point - self.in_point).max(0.0)
    }
}

/// Normalized overlay position, (0, 0) top-left to (1, 1) bottom-right
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OverlayPosition {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Overlay {
    pub asset_id: AssetId,
    pub start: TimeSec,
    pub duration: TimeSec,
    #[serde(default)]
    pub position: OverlayPosition,
}

/// Transition applied between consecutive clips
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Crossfade {
    pub duration: TimeSec,
    pub transition: String,
}

/// A stored composition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionProject {
    pub id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub clips: Vec<Clip>,
    #[serde(default)]
    pub overlays: Vec<Overlay>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crossfade: Option<Crossfade>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Incremented on every save; 0 until first saved
    #[serde(default)]
    pub version: u64,
}

impl CompositionProject {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.into(),
            clips: Vec::new(),
            overlays: Vec::new(),
            crossfade: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn with_clip(mut self, clip: Clip) -> Self {
        self.clips.push(clip);
        self
    }

    pub fn with_overlay(mut self, overlay: Overlay) -> Self {
        self.overlays.push(overlay);
        self
    }

    pub fn with_crossfade(mut self, duration: TimeSec, transition: impl Into<String>) -> Self {
        self.crossfade = Some(Crossfade {
            duration,
            transition: transition.into(),
        });
        self
    }

    /// Ids of every asset the project references, in first-use order
    pub fn asset_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        let all = self
            .clips
            .iter()
            .map(|c| c.asset_id.as_str())
            .chain(self.overlays.iter().map(|o| o.asset_id.as_str()));
        for id in all {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }

    /// Playback length with crossfades overlapping consecutive clips
    pub fn total_duration(&self) -> TimeSec {
        let clips: TimeSec = self.clips.iter().map(Clip::duration).sum();
        let overlap = match &self.crossfade {
            Some(fade) if self.clips.len() > 1 => fade.duration * (self.clips.len() - 1) as f64,
            _ => 0.0,
        };
        (clips - overlap).max(0.0)
    }

    pub fn validate(&self) -> CoreResult<()> {
        validate_path_id_component(&self.id, "project id")?;
        if self.name.trim().is_empty() {
            return Err(CoreError::ValidationError(
                "Project name must not be empty".to_string(),
            ));
        }
        for (i, clip) in self.clips.iter().enumerate() {
            if !(clip.in_point >= 0.0 && clip.out_point > clip.in_point) {
                return Err(CoreError::ValidationError(format!(
                    "Clip {} has an invalid range {}..{}",
                    i, clip.in_point, clip.out_point
                )));
            }
        }
        for (i, overlay) in self.overlays.iter().enumerate() {
            if !(overlay.start >= 0.0 && overlay.duration > 0.0) {
                return Err(CoreError::ValidationError(format!(
                    "Overlay {} has an invalid timing",
                    i
                )));
            }
        }
        if let Some(fade) = &self.crossfade {
            if !(fade.duration > 0.0) {
                return Err(CoreError::ValidationError(
                    "Crossfade duration must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Stamps a project for saving over `existing`
fn stamp(mut project: CompositionProject, existing: Option<&CompositionProject>) -> CompositionProject {
    project.updated_at = Utc::now();
    match existing {
        Some(previous) => {
            project.created_at = previous.created_at;
            project.version = previous.version + 1;
        }
        None => project.version = 1,
    }
    project
}

// =============================================================================
// Store Trait
// =============================================================================

/// Document store for projects
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// All projects, most recently updated first
    async fn list(&self) -> CoreResult<Vec<CompositionProject>>;

    async fn get(&self, id: &str) -> CoreResult<Option<CompositionProject>>;

    /// Inserts or replaces a project and returns it as stored
    async fn save(&self, project: CompositionProject) -> CoreResult<CompositionProject>;

    /// Deletes a project; `ProjectNotFound` when absent
    async fn delete(&self, id: &str) -> CoreResult<()>;
}

fn sort_recent_first(projects: &mut [CompositionProject]) {
    projects.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
}

// =============================================================================
// In-Memory Store
// =============================================================================

#[derive(Debug, Default)]
pub struct InMemoryProjectStore {
    projects: RwLock<HashMap<ProjectId, CompositionProject>>,
}

impl InMemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectStore for InMemoryProjectStore {
    async fn list(&self) -> CoreResult<Vec<CompositionProject>> {
        let mut projects: Vec<_> = self.projects.read().await.values().cloned().collect();
        sort_recent_first(&mut projects);
        Ok(projects)
    }

    async fn get(&self, id: &str) -> CoreResult<Option<CompositionProject>> {
        Ok(self.projects.read().await.get(id).cloned())
    }

    async fn save(&self, project: CompositionProject) -> CoreResult<CompositionProject> {
        project.validate()?;
        let mut projects = self.projects.write().await;
        let existing = projects.get(&project.id).cloned();
        let stored = stamp(project, existing.as_ref());
        projects.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn delete(&self, id: &str) -> CoreResult<()> {
        self.projects
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| CoreError::ProjectNotFound(id.to_string()))
    }
}

// =============================================================================
// JSON File Store
// =============================================================================

/// On-disk document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDocument {
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub projects: Vec<CompositionProject>,
}

/// Projects stored in a single JSON file.
///
/// Writers take an advisory lock on a sibling `.lock` file and replace the
/// document atomically. Calls within one process are serialized.
#[derive(Debug)]
pub struct JsonFileProjectStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl JsonFileProjectStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `op` on the document under the file lock on a blocking thread
    async fn with_document<T, F>(&self, exclusive: bool, op: F) -> CoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ProjectDocument) -> CoreResult<(T, bool)> + Send + 'static,
    {
        let _serial = self.guard.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || locked_update(&path, exclusive, op))
            .await
            .map_err(|e| CoreError::Internal(format!("Project store task failed: {}", e)))?
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "projects.json".into());
    name.push(".lock");
    path.with_file_name(name)
}

fn read_document(path: &Path) -> CoreResult<ProjectDocument> {
    if !path.exists() {
        return Ok(ProjectDocument::default());
    }
    let content = std::fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(ProjectDocument::default());
    }
    Ok(serde_json::from_str(&content)?)
}

/// `op` returns its result and whether the document must be written back
fn locked_update<T>(
    path: &Path,
    exclusive: bool,
    op: impl FnOnce(&mut ProjectDocument) -> CoreResult<(T, bool)>,
) -> CoreResult<T> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path(path))?;

    if exclusive {
        fs2::FileExt::lock_exclusive(&lock_file)?;
    } else {
        fs2::FileExt::lock_shared(&lock_file)?;
    }

    let result = read_document(path).and_then(|mut document| {
        let (value, dirty) = op(&mut document)?;
        if dirty {
            document.last_updated = Some(Utc::now());
            atomic_write_json_pretty(path, &document)?;
            debug!("Wrote {} projects to {}", document.projects.len(), path.display());
        }
        Ok(value)
    });

    if let Err(e) = fs2::FileExt::unlock(&lock_file) {
        warn!("Failed to unlock project store: {}", e);
    }
    result
}

#[async_trait]
impl ProjectStore for JsonFileProjectStore {
    async fn list(&self) -> CoreResult<Vec<CompositionProject>> {
        self.with_document(false, |document| {
            let mut projects = document.projects.clone();
            sort_recent_first(&mut projects);
            Ok((projects, false))
        })
        .await
    }

    async fn get(&self, id: &str) -> CoreResult<Option<CompositionProject>> {
        let id = id.to_string();
        self.with_document(false, move |document| {
            Ok((document.projects.iter().find(|p| p.id == id).cloned(), false))
        })
        .await
    }

    async fn save(&self, project: CompositionProject) -> CoreResult<CompositionProject> {
        project.validate()?;
        let saved = self
            .with_document(true, move |document| {
                let index = document.projects.iter().position(|p| p.id == project.id);
                let stored = stamp(project, index.map(|i| &document.projects[i]));
                match index {
                    Some(i) => document.projects[i] = stored.clone(),
                    None => document.projects.push(stored.clone()),
                }
                Ok((stored, true))
            })
            .await?;
        info!("Saved project {} (v{})", saved.id, saved.version);
        Ok(saved)
    }

    async fn delete(&self, id: &str) -> CoreResult<()> {
        let id = id.to_string();
        self.with_document(true, move |document| {
            let before = document.projects.len();
            document.projects.retain(|p| p.id != id);
            if document.projects.len() == before {
                return Err(CoreError::ProjectNotFound(id));
            }
            Ok(((), true))
        })
        .await
    }
}
