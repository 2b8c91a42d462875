use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use gradmap_core::TaskDescriptor;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Opaque job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| OrchestratorError::JobNotFound(s.to_string()))
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One submitted batch.
///
/// Owned by the registry's orchestrator loop; every transition below is
/// invoked from that loop only.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub tasks: Arc<[TaskDescriptor]>,
    pub status: JobStatus,
    pub current: usize,
    pub total: usize,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_count: usize,
    /// Expected output locations, whether or not they were produced
    pub outputs: Vec<PathBuf>,
    pub cancel_requested: bool,
    /// Reason reported with a `failed` terminal event
    pub failure: Option<String>,
    /// Worker threads for this job's batch
    pub parallelism: usize,
}

impl Job {
    /// Create a new queued job
    pub fn new_queued(tasks: Vec<TaskDescriptor>, outputs: Vec<PathBuf>, parallelism: usize) -> Self {
        let total = tasks.len();
        Self {
            id: JobId::new(),
            tasks: tasks.into(),
            status: JobStatus::Queued,
            current: 0,
            total,
            created_at: Utc::now(),
            completed_at: None,
            error_count: 0,
            outputs,
            cancel_requested: false,
            failure: None,
            parallelism,
        }
    }

    fn invalid(&self, to: &str) -> OrchestratorError {
        OrchestratorError::InvalidStateTransition {
            from: self.status.as_str().to_string(),
            to: to.to_string(),
        }
    }

    fn finish(&mut self, status: JobStatus) {
        self.status = status;
        self.completed_at.get_or_insert_with(Utc::now);
    }

    /// Transition: QUEUED → PROCESSING
    pub fn start(&mut self) -> Result<()> {
        match self.status {
            JobStatus::Queued => {
                self.status = JobStatus::Processing;
                Ok(())
            }
            _ => Err(self.invalid("processing")),
        }
    }

    /// Record `current` tasks processed; never moves backwards
    pub fn record_progress(&mut self, current: usize) -> Result<()> {
        match self.status {
            JobStatus::Processing => {
                self.current = self.current.max(current.min(self.total));
                Ok(())
            }
            _ => Err(self.invalid("progress")),
        }
    }

    /// Transition: PROCESSING → COMPLETED | FAILED
    ///
    /// Only a batch where every task failed is `failed`; partial failure is
    /// still `completed` with `error_count` set.
    pub fn complete(&mut self, failed: usize) -> Result<JobStatus> {
        match self.status {
            JobStatus::Processing => {
                self.error_count = failed.min(self.total);
                if self.error_count == self.total {
                    self.failure = Some(format!("All {} tasks failed", self.total));
                    self.finish(JobStatus::Failed);
                } else {
                    self.finish(JobStatus::Completed);
                }
                Ok(self.status)
            }
            _ => Err(self.invalid("completed")),
        }
    }

    /// Mark cancellation as requested; false if already requested or terminal
    pub fn request_cancel(&mut self) -> bool {
        if self.status.is_terminal() || self.cancel_requested {
            return false;
        }
        self.cancel_requested = true;
        true
    }

    /// Transition: QUEUED | PROCESSING → CANCELLED
    pub fn cancel(&mut self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.invalid("cancelled"));
        }
        self.cancel_requested = true;
        self.finish(JobStatus::Cancelled);
        Ok(())
    }

    /// Transition: QUEUED | PROCESSING → FAILED (orchestration fault)
    pub fn fault(&mut self, reason: impl Into<String>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.invalid("failed"));
        }
        self.failure = Some(reason.into());
        self.finish(JobStatus::Failed);
        Ok(())
    }

    pub fn snapshot(&self, download_ref: Option<String>) -> JobSnapshot {
        let download_ref = download_ref.filter(|_| self.status == JobStatus::Completed);
        JobSnapshot {
            job_id: self.id,
            status: self.status,
            current: self.current,
            total: self.total,
            created_at: self.created_at,
            completed_at: self.completed_at,
            download_available: download_ref.is_some(),
            download_ref,
            error_count: self.error_count,
        }
    }
}

/// Point-in-time copy of a job, safe to hand to any caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub status: JobStatus,
    pub current: usize,
    pub total: usize,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub download_available: bool,
    pub download_ref: Option<String>,
    pub error_count: usize,
}
