use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type Environment = BTreeMap<String, String>;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(u32);

impl JobId {
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    pub fn as_num(&self) -> u32 {
        self.0
    }
}

impl From<u32> for JobId {
    #[inline]
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
    Unknown,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed
                | JobState::Failed
                | JobState::Cancelled
                | JobState::TimedOut
                | JobState::Unknown
        )
    }

    /// Job has been handed over to the scheduler and has not finished yet.
    pub fn is_submitted(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::TimedOut => "timed_out",
            JobState::Unknown => "unknown",
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Scheduler,
    ExitCode,
    LogError,
    MissingFile,
    Timeout,
    Dependency,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Scheduler => "scheduler",
            FailureKind::ExitCode => "exit_code",
            FailureKind::LogError => "log_error",
            FailureKind::MissingFile => "missing_file",
            FailureKind::Timeout => "timeout",
            FailureKind::Dependency => "dependency",
            FailureKind::Unknown => "unknown",
        }
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure verdict recorded for a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub reason: String,
    /// Bounded set of log lines that justify the verdict.
    pub evidence: Vec<String>,
}

impl Failure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            evidence: Vec::new(),
        }
    }

    pub fn with_evidence(mut self, evidence: Vec<String>) -> Self {
        self.evidence = evidence;
        self
    }
}

pub const DEFAULT_MEMORY_MIB: u64 = 4 * 1024;
pub const DEFAULT_WALLTIME: Duration = Duration::from_secs(3600);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub nodes: u32,
    /// Cores per node
    pub cpus: u32,
    pub memory_mib: u64,
    #[serde(with = "humantime_serde")]
    pub walltime: Duration,
    pub gpus: u32,
    /// Queue (PBS) or partition (SLURM)
    pub queue: Option<String>,
    pub account: Option<String>,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            nodes: 1,
            cpus: 1,
            memory_mib: DEFAULT_MEMORY_MIB,
            walltime: DEFAULT_WALLTIME,
            gpus: 0,
            queue: None,
            account: None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    AfterSuccess,
    AfterFailure,
    AfterAny,
}

impl DependencyKind {
    pub const ALL: [DependencyKind; 3] = [
        DependencyKind::AfterSuccess,
        DependencyKind::AfterFailure,
        DependencyKind::AfterAny,
    ];
}

impl Display for DependencyKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DependencyKind::AfterSuccess => "after_success",
            DependencyKind::AfterFailure => "after_failure",
            DependencyKind::AfterAny => "after_any",
        })
    }
}

/// Predecessors of a job, split by the kind of the relation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependencies {
    pub after_success: Vec<JobId>,
    pub after_failure: Vec<JobId>,
    pub after_any: Vec<JobId>,
}

impl Dependencies {
    pub fn is_empty(&self) -> bool {
        self.after_success.is_empty() && self.after_failure.is_empty() && self.after_any.is_empty()
    }

    pub fn get(&self, kind: DependencyKind) -> &[JobId] {
        match kind {
            DependencyKind::AfterSuccess => &self.after_success,
            DependencyKind::AfterFailure => &self.after_failure,
            DependencyKind::AfterAny => &self.after_any,
        }
    }

    /// All (kind, predecessor) edges.
    pub fn edges(&self) -> impl Iterator<Item = (DependencyKind, JobId)> + '_ {
        DependencyKind::ALL
            .into_iter()
            .flat_map(move |kind| self.get(kind).iter().map(move |id| (kind, *id)))
    }
}

/// Everything a caller provides when registering a job.
#[derive(Clone, Debug, Default)]
pub struct JobSpec {
    pub name: Option<String>,
    pub command: String,
    pub resources: ResourceRequest,
    /// Directory in which the command is executed; defaults to the job directory.
    pub workdir: Option<PathBuf>,
    pub env: Environment,
    pub expected_files: Vec<String>,
    pub dependencies: Dependencies,
    pub max_retries: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,

    pub command: String,
    pub resources: ResourceRequest,
    pub workdir: PathBuf,
    pub env: Environment,
    pub expected_files: Vec<String>,
    pub dependencies: Dependencies,

    pub state: JobState,
    pub scheduler_handle: Option<String>,
    pub exit_code: Option<i32>,
    /// Directory that holds the generated script and the output logs.
    pub job_dir: PathBuf,
    pub script_path: Option<PathBuf>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    pub failure: Option<Failure>,

    pub attempt: u32,
    pub max_retries: u32,
    pub parent: Option<JobId>,
    /// Number of consecutive polls whose result was inconclusive.
    pub status_errors: u32,

    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: JobId, spec: JobSpec, job_dir: PathBuf, now: DateTime<Utc>) -> Self {
        let JobSpec {
            name,
            command,
            resources,
            workdir,
            env,
            expected_files,
            dependencies,
            max_retries,
        } = spec;

        Self {
            id,
            name: name.unwrap_or_else(|| format!("job_{id}")),
            command,
            resources,
            workdir: workdir.unwrap_or_else(|| job_dir.clone()),
            env,
            expected_files,
            dependencies,
            state: JobState::Pending,
            scheduler_handle: None,
            exit_code: None,
            job_dir,
            script_path: None,
            stdout_path: None,
            stderr_path: None,
            failure: None,
            attempt: 1,
            max_retries,
            parent: None,
            status_errors: 0,
            created_at: now,
            submitted_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Creates the next attempt of this job. Predecessors are resolved to their latest
    /// attempt, so copied dependencies that were already satisfied stay satisfied.
    pub fn next_attempt(&self, id: JobId, job_dir: PathBuf, now: DateTime<Utc>) -> Self {
        let spec = JobSpec {
            name: Some(self.name.clone()),
            command: self.command.clone(),
            resources: self.resources.clone(),
            workdir: Some(self.workdir.clone()),
            env: self.env.clone(),
            expected_files: self.expected_files.clone(),
            dependencies: self.dependencies.clone(),
            max_retries: self.max_retries,
        };
        let mut job = Job::new(id, spec, job_dir, now);
        job.attempt = self.attempt + 1;
        job.parent = Some(self.id);
        job
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::{Dependencies, DependencyKind, Job, JobId, JobSpec, JobState};
    use std::path::PathBuf;

    #[test]
    fn test_default_name_and_workdir() {
        let job = Job::new(
            JobId::new(7),
            JobSpec {
                command: "true".to_string(),
                ..Default::default()
            },
            PathBuf::from("/tmp/jobs/7"),
            chrono::Utc::now(),
        );
        assert_eq!(job.name, "job_7");
        assert_eq!(job.workdir, PathBuf::from("/tmp/jobs/7"));
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempt, 1);
    }

    #[test]
    fn test_next_attempt_links_parent() {
        let job = Job::new(
            JobId::new(1),
            JobSpec {
                name: Some("sim".to_string()),
                command: "./sim".to_string(),
                max_retries: 2,
                dependencies: Dependencies {
                    after_any: vec![JobId::new(0)],
                    ..Default::default()
                },
                ..Default::default()
            },
            PathBuf::from("/tmp/1"),
            chrono::Utc::now(),
        );
        let retry = job.next_attempt(JobId::new(2), PathBuf::from("/tmp/2"), chrono::Utc::now());
        assert_eq!(retry.parent, Some(JobId::new(1)));
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.max_retries, 2);
        assert_eq!(retry.name, "sim");
        assert_eq!(retry.workdir, PathBuf::from("/tmp/1"));
        assert_eq!(retry.dependencies.after_any, vec![JobId::new(0)]);
        assert!(retry.failure.is_none());
    }

    #[test]
    fn test_dependency_edges() {
        let deps = Dependencies {
            after_success: vec![JobId::new(1), JobId::new(2)],
            after_failure: vec![],
            after_any: vec![JobId::new(3)],
        };
        let edges: Vec<_> = deps.edges().collect();
        assert_eq!(
            edges,
            vec![
                (DependencyKind::AfterSuccess, JobId::new(1)),
                (DependencyKind::AfterSuccess, JobId::new(2)),
                (DependencyKind::AfterAny, JobId::new(3)),
            ]
        );
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_string(&JobState::TimedOut).unwrap(),
            "\"timed_out\""
        );
        assert!(JobState::Unknown.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }
}
