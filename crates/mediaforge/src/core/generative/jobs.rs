//! Generation Jobs
//!
//! Per-provider job table. Jobs move `Pending -> Running -> terminal`; a
//! synchronous provider may jump straight from `Pending` to a terminal state.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use super::providers::GenerationResult;

use crate::core::{new_id, CoreError, CoreResult, JobId, ModelId};

/// Job status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted but not started
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether the job is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `next` is a legal successor of this status
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => next != JobStatus::Pending,
            JobStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Tracked job entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    pub model_id: ModelId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
    /// Request or task id assigned by the backend
    pub external_id: Option<String>,
    /// Backend-reported progress, 0 to 100
    pub progress: Option<f64>,
    pub stage: Option<String>,
    /// Final result, kept until the record is evicted
    #[serde(skip)]
    pub result: Option<GenerationResult>,
}

impl JobRecord {
    /// The stored result, or a snapshot of a job that has not finished
    pub fn to_result(&self, provider_id: &str) -> GenerationResult {
        if let Some(result) = &self.result {
            return result.clone();
        }
        GenerationResult {
            job_id: self.id.clone(),
            provider_id: provider_id.to_string(),
            model_id: self.model_id.clone(),
            status: self.status,
            outputs: Vec::new(),
            progress: self.progress,
            cost: None,
            currency: None,
            error: self.error.clone(),
            error_kind: None,
            started_at: self.created_at,
            finished_at: self.updated_at,
        }
    }
}

/// Bounds on how long finished jobs are kept
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobRetention {
    pub max_age: Duration,
    pub max_finished: usize,
}

impl Default for JobRetention {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(DEFAULT_RETENTION_HOURS * 3600),
            max_finished: DEFAULT_MAX_FINISHED_JOBS,
        }
    }
}

/// Finished jobs older than this are evicted
pub const DEFAULT_RETENTION_HOURS: u64 = 24;

/// Finished jobs kept per provider
pub const DEFAULT_MAX_FINISHED_JOBS: usize = 1000;

tokio::task_local! {
    static CURRENT_JOB: JobId;
}

/// Runs `fut` with `job_id` visible to [`current_job`]
pub async fn with_current_job<F: Future>(job_id: JobId, fut: F) -> F::Output {
    CURRENT_JOB.scope(job_id, fut).await
}

/// Id of the job the calling model invocation belongs to, if any
pub fn current_job() -> Option<JobId> {
    CURRENT_JOB.try_with(|id| id.clone()).ok()
}

/// Job table owned by one provider
#[derive(Debug)]
pub struct JobTracker {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    retention: JobRetention,
    started_at: Instant,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTracker {
    pub fn new() -> Self {
        Self::with_retention(JobRetention::default())
    }

    pub fn with_retention(retention: JobRetention) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            retention,
            started_at: Instant::now(),
        }
    }

    /// Time since the tracker (and its provider) was created
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Records a new pending job and returns its id
    pub async fn create(&self, model_id: &str) -> JobId {
        let now = Utc::now();
        let record = JobRecord {
            id: new_id(),
            model_id: model_id.to_string(),
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            error: None,
            external_id: None,
            progress: None,
            stage: None,
            result: None,
        };
        let id = record.id.clone();

        let mut jobs = self.jobs.write().await;
        prune(&mut jobs, &self.retention, now);
        jobs.insert(id.clone(), record);
        id
    }

    /// Moves a job to `status`, rejecting illegal transitions
    pub async fn transition(&self, job_id: &str, status: JobStatus) -> CoreResult<()> {
        let mut jobs = self.jobs.write().await;
        let record = jobs
            .get_mut(job_id)
            .ok_or_else(|| CoreError::JobNotFound(job_id.to_string()))?;
        apply_transition(record, status)
    }

    /// Records the final result and moves the job to its status. A job
    /// already in that status (e.g. cancelled mid-flight) just keeps the result.
    pub async fn finish(&self, result: &GenerationResult) -> CoreResult<()> {
        let mut jobs = self.jobs.write().await;
        let record = jobs
            .get_mut(&result.job_id)
            .ok_or_else(|| CoreError::JobNotFound(result.job_id.clone()))?;

        if record.status != result.status {
            apply_transition(record, result.status)?;
        }
        if result.error.is_some() {
            record.error = result.error.clone();
        }
        record.result = Some(result.clone());
        Ok(())
    }

    /// Associates the backend's id with a job
    pub async fn set_external_id(&self, job_id: &str, external_id: impl Into<String>) {
        if let Some(record) = self.jobs.write().await.get_mut(job_id) {
            record.external_id = Some(external_id.into());
        }
    }

    pub async fn update_progress(&self, job_id: &str, progress: f64, stage: Option<String>) {
        if let Some(record) = self.jobs.write().await.get_mut(job_id) {
            record.progress = Some(progress.clamp(0.0, 100.0));
            if stage.is_some() {
                record.stage = stage;
            }
            record.updated_at = Utc::now();
        }
    }

    pub async fn get(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.read().await.get(job_id).cloned()
    }

    pub async fn status(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs.read().await.get(job_id).map(|r| r.status)
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    pub async fn active_count(&self) -> usize {
        self.count(JobStatus::Running).await
    }

    pub async fn queued_count(&self) -> usize {
        self.count(JobStatus::Pending).await
    }

    async fn count(&self, status: JobStatus) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .filter(|r| r.status == status)
            .count()
    }
}

fn apply_transition(record: &mut JobRecord, status: JobStatus) -> CoreResult<()> {
    if !record.status.can_transition_to(status) {
        return Err(CoreError::ValidationError(format!(
            "Illegal job transition {} -> {} for {}",
            record.status, status, record.id
        )));
    }
    record.status = status;
    record.updated_at = Utc::now();
    Ok(())
}

/// Evicts finished jobs past the age bound, then the oldest beyond the count bound
fn prune(jobs: &mut HashMap<JobId, JobRecord>, retention: &JobRetention, now: DateTime<Utc>) {
    let max_age = chrono::Duration::from_std(retention.max_age)
        .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
    let before = jobs.len();
    jobs.retain(|_, r| !r.status.is_terminal() || now - r.updated_at < max_age);

    let mut finished: Vec<(DateTime<Utc>, JobId)> = jobs
        .values()
        .filter(|r| r.status.is_terminal())
        .map(|r| (r.updated_at, r.id.clone()))
        .collect();
    if finished.len() > retention.max_finished {
        finished.sort();
        let excess = finished.len() - retention.max_finished;
        for (_, id) in finished.into_iter().take(excess) {
            jobs.remove(&id);
        }
    }

    let evicted = before - jobs.len();
    if evicted > 0 {
        debug!("Evicted {} finished jobs", evicted);
    }
}
