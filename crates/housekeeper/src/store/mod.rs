//! Persistent storage of job records.
//!
//! The engine only talks to [`JobStore`]. Every mutation of a single record is applied
//! atomically; the engine itself makes sure that there is at most one writer per job.

mod journal;
mod memory;

pub use journal::{JournalJobStore, JournalReader, JournalWriter};
pub use memory::MemoryJobStore;

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Map;
use crate::job::{Failure, Job, JobId, JobState};

/// Partial update of a job record. Only fields that are `Some` are changed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub state: Option<JobState>,
    pub scheduler_handle: Option<String>,
    pub exit_code: Option<i32>,
    pub failure: Option<Failure>,
    pub script_path: Option<PathBuf>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    pub status_errors: Option<u32>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobUpdate {
    pub fn state(state: JobState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn apply(&self, job: &mut Job) {
        let JobUpdate {
            state,
            scheduler_handle,
            exit_code,
            failure,
            script_path,
            stdout_path,
            stderr_path,
            status_errors,
            submitted_at,
            started_at,
            completed_at,
        } = self.clone();

        if let Some(state) = state {
            job.state = state;
        }
        if scheduler_handle.is_some() {
            job.scheduler_handle = scheduler_handle;
        }
        if exit_code.is_some() {
            job.exit_code = exit_code;
        }
        if failure.is_some() {
            job.failure = failure;
        }
        if script_path.is_some() {
            job.script_path = script_path;
        }
        if stdout_path.is_some() {
            job.stdout_path = stdout_path;
        }
        if stderr_path.is_some() {
            job.stderr_path = stderr_path;
        }
        if let Some(errors) = status_errors {
            job.status_errors = errors;
        }
        if submitted_at.is_some() {
            job.submitted_at = submitted_at;
        }
        if started_at.is_some() {
            job.started_at = started_at;
        }
        if completed_at.is_some() {
            job.completed_at = completed_at;
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct JobFilter {
    /// Empty means any state.
    pub states: Vec<JobState>,
    pub parent: Option<JobId>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_states(states: Vec<JobState>) -> Self {
        Self {
            states,
            parent: None,
        }
    }

    pub fn children_of(parent: JobId) -> Self {
        Self {
            states: Vec::new(),
            parent: Some(parent),
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        (self.states.is_empty() || self.states.contains(&job.state))
            && self.parent.is_none_or(|parent| job.parent == Some(parent))
    }
}

pub trait JobStore: Send + Sync {
    /// Reserves a fresh job identifier. Identifiers grow monotonically.
    fn allocate_id(&self) -> crate::Result<JobId>;

    fn create(&self, job: Job) -> crate::Result<()>;

    fn get(&self, id: JobId) -> crate::Result<Option<Job>>;

    /// Atomically applies a partial update and returns the updated record.
    fn update(&self, id: JobId, update: JobUpdate) -> crate::Result<Job>;

    /// Jobs matching `filter`, in insertion order.
    fn list(&self, filter: &JobFilter) -> crate::Result<Vec<Job>>;

    /// Jobs that declare `id` as a predecessor.
    fn dependents_of(&self, id: JobId) -> crate::Result<Vec<JobId>>;

    fn remove(&self, id: JobId) -> crate::Result<Option<Job>>;
}

/// In-memory tables shared by the store implementations.
#[derive(Default)]
pub(crate) struct JobTable {
    jobs: BTreeMap<JobId, Job>,
    dependents: Map<JobId, Vec<JobId>>,
    /// Last allocated identifier, identifiers start at 1.
    last_id: u32,
}

impl JobTable {
    pub fn allocate_id(&mut self) -> JobId {
        self.last_id += 1;
        JobId::new(self.last_id)
    }

    pub fn insert(&mut self, job: Job) -> crate::Result<()> {
        if self.jobs.contains_key(&job.id) {
            return Err(crate::Error::InvalidJob(format!(
                "Job {} already exists",
                job.id
            )));
        }
        for (_, predecessor) in job.dependencies.edges() {
            let dependents = self.dependents.entry(predecessor).or_default();
            if !dependents.contains(&job.id) {
                dependents.push(job.id);
            }
        }
        self.last_id = self.last_id.max(job.id.as_num());
        self.jobs.insert(job.id, job);
        Ok(())
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn update(&mut self, id: JobId, update: &JobUpdate) -> crate::Result<Job> {
        let job = self
            .jobs
            .get_mut(&id)
            .ok_or(crate::Error::JobNotFound(id))?;
        update.apply(job);
        Ok(job.clone())
    }

    pub fn list(&self, filter: &JobFilter) -> Vec<Job> {
        self.jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect()
    }

    pub fn dependents_of(&self, id: JobId) -> Vec<JobId> {
        self.dependents.get(&id).cloned().unwrap_or_default()
    }

    pub fn remove(&mut self, id: JobId) -> Option<Job> {
        let job = self.jobs.remove(&id)?;
        for (_, predecessor) in job.dependencies.edges() {
            if let Some(dependents) = self.dependents.get_mut(&predecessor) {
                dependents.retain(|dependent| *dependent != id);
            }
        }
        Some(job)
    }
}
