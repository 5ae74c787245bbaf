//! Interface to the external cluster schedulers.

mod common;
pub mod pbs;
pub mod slurm;

pub use common::shell_quote;

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::common::config::ScriptConfig;
use crate::common::manager::info::SchedulerKind;
use crate::job::{DependencyKind, Environment, Job, JobState, ResourceRequest};
use crate::scheduler::pbs::PbsBackend;
use crate::scheduler::slurm::SlurmBackend;

pub type SchedulerResult<T> = anyhow::Result<T>;
pub type SchedulerFuture<T> = Pin<Box<dyn Future<Output = SchedulerResult<T>> + Send>>;

/// Scheduler handles of the predecessors of a job, by relation kind.
pub type DependencyMap = BTreeMap<DependencyKind, Vec<String>>;

/// Coarse job status as reported by the scheduler.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
    /// The scheduler answered, but the state could not be interpreted.
    Unknown,
}

impl SchedulerStatus {
    /// State of a finished job, `None` while the job is still alive or the status is unknown.
    pub fn terminal_state(&self) -> Option<JobState> {
        match self {
            SchedulerStatus::Completed => Some(JobState::Completed),
            SchedulerStatus::Failed => Some(JobState::Failed),
            SchedulerStatus::Cancelled => Some(JobState::Cancelled),
            SchedulerStatus::TimedOut => Some(JobState::TimedOut),
            SchedulerStatus::Pending | SchedulerStatus::Running | SchedulerStatus::Unknown => None,
        }
    }
}

impl Display for SchedulerStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SchedulerStatus::Pending => "pending",
            SchedulerStatus::Running => "running",
            SchedulerStatus::Completed => "completed",
            SchedulerStatus::Failed => "failed",
            SchedulerStatus::Cancelled => "cancelled",
            SchedulerStatus::TimedOut => "timed_out",
            SchedulerStatus::Unknown => "unknown",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusReport {
    pub status: SchedulerStatus,
    /// Exit code of the job script, if the scheduler knows it.
    pub exit_code: Option<i32>,
}

impl StatusReport {
    pub fn new(status: SchedulerStatus) -> Self {
        Self {
            status,
            exit_code: None,
        }
    }

    pub fn with_exit_code(status: SchedulerStatus, exit_code: Option<i32>) -> Self {
        Self { status, exit_code }
    }
}

/// Input of script generation.
#[derive(Clone, Debug)]
pub struct ScriptSpec {
    pub name: String,
    pub command: String,
    pub resources: ResourceRequest,
    pub workdir: PathBuf,
    pub env: Environment,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub dependencies: DependencyMap,
}

impl ScriptSpec {
    pub fn from_job(job: &Job, stdout: PathBuf, stderr: PathBuf, dependencies: DependencyMap) -> Self {
        Self {
            name: job.name.clone(),
            command: job.command.clone(),
            resources: job.resources.clone(),
            workdir: job.workdir.clone(),
            env: job.env.clone(),
            stdout,
            stderr,
            dependencies,
        }
    }
}

/// Capabilities of a scheduler family.
pub trait SchedulerBackend: Send + Sync {
    /// Renders a batch script. Identical input produces identical output.
    fn build_script(&self, spec: &ScriptSpec) -> String;

    /// Submits the script and returns the scheduler handle of the new job.
    fn submit(&self, script_path: &Path, workdir: &Path) -> SchedulerFuture<String>;

    fn poll_status(&self, handle: &str) -> SchedulerFuture<StatusReport>;

    /// Best-effort cancellation. Returns `false` if the job was already gone.
    fn cancel(&self, handle: &str) -> SchedulerFuture<bool>;
}

pub fn create_backend(kind: SchedulerKind, config: &ScriptConfig) -> Arc<dyn SchedulerBackend> {
    match kind {
        SchedulerKind::Pbs => Arc::new(PbsBackend::new(config.clone())),
        SchedulerKind::Slurm => Arc::new(SlurmBackend::new(config.clone())),
    }
}
