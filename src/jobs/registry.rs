use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{Job, JobId, JobStatus, JobUpdate};
use crate::extractor::MediaRequest;

/// Result of a status read.
#[derive(Debug, Clone)]
pub struct StatusQuery {
    pub job: Job,
    /// The read itself moved the job to failed because it went stale.
    pub timed_out: bool,
}

/// Process-wide table of download jobs.
///
/// Each entry has a single writer (its runner); the lock only guards the
/// map itself and is never held across an await point.
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Job>>,
    retention: Duration,
    max_jobs: usize,
}

fn elapsed_between(then: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or_default()
}

/// Whole minutes when the limit is a multiple of a minute, seconds otherwise.
fn describe_limit(limit: Duration) -> String {
    let seconds = limit.as_secs();
    match seconds {
        60 => "1 minuto".to_string(),
        s if s >= 60 && s % 60 == 0 => format!("{} minutos", s / 60),
        1 => "1 segundo".to_string(),
        s if s > 0 => format!("{s} segundos"),
        _ => format!("{} milisegundos", limit.as_millis()),
    }
}

impl JobRegistry {
    pub fn new(retention: Duration, max_jobs: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            retention,
            max_jobs: max_jobs.max(1),
        }
    }

    fn read_jobs(&self) -> RwLockReadGuard<'_, HashMap<JobId, Job>> {
        self.jobs.read().unwrap_or_else(|poisoned| {
            error!("RwLock de jobs envenenado en lectura");
            PoisonError::into_inner(poisoned)
        })
    }

    fn write_jobs(&self) -> RwLockWriteGuard<'_, HashMap<JobId, Job>> {
        self.jobs.write().unwrap_or_else(|poisoned| {
            error!("RwLock de jobs envenenado en escritura");
            PoisonError::into_inner(poisoned)
        })
    }

    pub fn create(&self, request: MediaRequest) -> JobId {
        let mut jobs = self.write_jobs();
        let mut id = Uuid::new_v4();
        while jobs.contains_key(&id) {
            id = Uuid::new_v4();
        }
        jobs.insert(id, Job::new(id, request, Utc::now()));
        debug!(job_id = %id, "Job registrado");
        id
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.read_jobs().get(&id).cloned()
    }

    /// No-op returning `false` for unknown ids or refused updates.
    pub fn update(&self, id: JobId, update: JobUpdate) -> bool {
        match self.write_jobs().get_mut(&id) {
            Some(job) => job.apply(update, Utc::now()),
            None => false,
        }
    }

    /// Snapshot for the status API. A job still pending or downloading after
    /// `max_age` is failed on the spot.
    pub fn query(&self, id: JobId, now: DateTime<Utc>, max_age: Duration) -> Option<StatusQuery> {
        let mut jobs = self.write_jobs();
        let job = jobs.get_mut(&id)?;

        let stale = !job.status.is_terminal() && elapsed_between(job.created_at, now) > max_age;
        let timed_out = stale
            && job.apply(
                JobUpdate::failed(format!(
                    "La descarga excedio el tiempo limite de {}",
                    describe_limit(max_age)
                )),
                now,
            );
        if timed_out {
            info!(job_id = %id, "Job marcado como fallido por tiempo limite");
        }

        Some(StatusQuery {
            job: job.clone(),
            timed_out,
        })
    }

    /// Evicts terminal jobs finished more than the retention window ago, then
    /// the oldest terminal jobs while above capacity. Non-terminal jobs are
    /// never evicted. Returns what was removed so callers can drop artifacts.
    pub fn prune(&self, now: DateTime<Utc>) -> Vec<Job> {
        let mut jobs = self.write_jobs();

        let mut expired: Vec<JobId> = jobs
            .values()
            .filter(|job| {
                job.status.is_terminal()
                    && job
                        .finished_at
                        .is_some_and(|finished| elapsed_between(finished, now) > self.retention)
            })
            .map(|job| job.id)
            .collect();

        let remaining = jobs.len() - expired.len();
        if remaining >= self.max_jobs {
            let mut terminal: Vec<(DateTime<Utc>, JobId)> = jobs
                .values()
                .filter(|job| job.status.is_terminal() && !expired.contains(&job.id))
                .map(|job| (job.finished_at.unwrap_or(job.updated_at), job.id))
                .collect();
            terminal.sort();
            let overflow = remaining + 1 - self.max_jobs;
            expired.extend(terminal.into_iter().take(overflow).map(|(_, id)| id));
        }

        let removed: Vec<Job> = expired
            .into_iter()
            .filter_map(|id| jobs.remove(&id))
            .collect();
        if !removed.is_empty() {
            debug!(count = removed.len(), "Jobs antiguos eliminados del registro");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.read_jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_jobs().is_empty()
    }

    pub fn count_with_status(&self, status: JobStatus) -> usize {
        self.read_jobs()
            .values()
            .filter(|job| job.status == status)
            .count()
    }
}
