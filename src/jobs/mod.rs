//! Background download jobs: the registry that tracks them and the runner
//! that drives each one to a terminal state.

mod registry;
mod runner;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::extractor::{MediaRequest, TransferProgress};

pub use registry::{JobRegistry, StatusQuery};
pub use runner::{JobRunner, RunnerSettings, download_with_retries};

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Downloading => 1,
            Self::Completed | Self::Failed => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub request: MediaRequest,
    pub status: JobStatus,
    pub progress: u8,
    pub progress_known: bool,
    pub title: Option<String>,
    pub filename: Option<String>,
    #[serde(skip_serializing)]
    pub file_path: Option<PathBuf>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Partial update of a job. Fields left as `None` are not touched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub progress_known: Option<bool>,
    pub title: Option<String>,
    pub filename: Option<String>,
    pub file_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl JobUpdate {
    pub fn downloading() -> Self {
        Self {
            status: Some(JobStatus::Downloading),
            ..Self::default()
        }
    }

    pub fn transfer(progress: TransferProgress) -> Self {
        match progress.percent() {
            Some(percent) => Self {
                progress: Some(percent),
                progress_known: Some(true),
                ..Self::default()
            },
            None => Self {
                progress_known: Some(false),
                ..Self::default()
            },
        }
    }

    pub fn completed(file_path: PathBuf, title: String, filename: String) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            title: Some(title),
            filename: Some(filename),
            file_path: Some(file_path),
            ..Self::default()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(reason.into()),
            ..Self::default()
        }
    }
}

impl Job {
    pub(crate) fn new(id: JobId, request: MediaRequest, now: DateTime<Utc>) -> Self {
        Self {
            id,
            request,
            status: JobStatus::Pending,
            progress: 0,
            progress_known: false,
            title: None,
            filename: None,
            file_path: None,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Applies `update` unless it would break the lifecycle invariants.
    /// Returns whether anything was applied.
    pub(crate) fn apply(&mut self, update: JobUpdate, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }

        let next_status = update.status.unwrap_or(self.status);
        if next_status.rank() < self.status.rank() {
            warn!(job_id = %self.id, "Transicion de estado invalida: {:?} -> {:?}", self.status, next_status);
            return false;
        }
        if update.file_path.is_some() != (next_status == JobStatus::Completed) {
            warn!(job_id = %self.id, "Resultado de descarga fuera del estado completado");
            return false;
        }
        if update.error.is_some() != (next_status == JobStatus::Failed) {
            warn!(job_id = %self.id, "Motivo de fallo fuera del estado fallido");
            return false;
        }

        if let Some(progress) = update.progress {
            self.progress = self.progress.max(progress.min(99));
        }
        if let Some(known) = update.progress_known {
            self.progress_known = known;
        }
        if update.title.is_some() {
            self.title = update.title;
        }
        if update.filename.is_some() {
            self.filename = update.filename;
        }

        match next_status {
            JobStatus::Completed => {
                self.progress = 100;
                self.progress_known = true;
                self.file_path = update.file_path;
                self.finished_at = Some(now);
            }
            JobStatus::Failed => {
                self.error = update.error;
                self.finished_at = Some(now);
            }
            JobStatus::Pending | JobStatus::Downloading => {}
        }

        self.status = next_status;
        self.updated_at = now;
        true
    }
}
