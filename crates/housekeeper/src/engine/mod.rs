//! The orchestration engine: submission gate, polling state machine, retries and
//! propagation of finished jobs to their dependents.

pub mod deps;
pub mod locks;
pub mod monitor;
pub mod retry;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::common::config::EngineConfig;
use crate::common::manager::info::{SchedulerKind, detect_scheduler};
use crate::common::utils::fs::{absolute_path, remove_dir_if_exists, write_executable};
use crate::engine::deps::{DependencyResolver, Readiness};
use crate::engine::locks::JobLocks;
use crate::engine::retry::RetryPolicy;
use crate::job::{Failure, FailureKind, Job, JobId, JobSpec, JobState};
use crate::scheduler::{
    SchedulerBackend, SchedulerFuture, SchedulerResult, SchedulerStatus, ScriptSpec, StatusReport,
    create_backend,
};
use crate::store::{JobFilter, JobStore, JobUpdate, JournalJobStore};
use crate::tracking::failure::{
    CANCELLED_REASON, FailureClassifier, FsProbe, Observed, Verdict, extract_exit_code,
    final_state, read_log,
};
use crate::{Error, Set};

pub const STDOUT_LOG_NAME: &str = "stdout.log";
pub const STDERR_LOG_NAME: &str = "stderr.log";

/// Snapshot of the whole job history.
#[derive(Serialize, Debug)]
pub struct Export {
    pub exported_at: DateTime<Utc>,
    pub total_jobs: usize,
    pub jobs: Vec<Job>,
}

struct EngineInner {
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    backend: Arc<dyn SchedulerBackend>,
    classifier: FailureClassifier,
    policy: RetryPolicy,
    locks: JobLocks,
}

/// Handle to the orchestration engine. Cloning is cheap, clones share all state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn JobStore>,
        backend: Arc<dyn SchedulerBackend>,
    ) -> crate::Result<Self> {
        let classifier = FailureClassifier::new(&config.logs)?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                backend,
                classifier,
                policy: RetryPolicy,
                locks: JobLocks::default(),
            }),
        })
    }

    /// Creates an engine backed by the journal in the configured working directory,
    /// using the configured (or detected) scheduler.
    pub fn open(mut config: EngineConfig) -> crate::Result<Self> {
        config.workdir = absolute_path(config.workdir)?;
        let kind = resolve_scheduler(config.scheduler)?;
        log::debug!(
            "Using {kind} scheduler, working directory {}",
            config.workdir.display()
        );
        let store = Arc::new(JournalJobStore::open(&config.journal_path())?);
        let backend = create_backend(kind, &config.script);
        let engine = Self::new(config, store, backend)?;
        engine.recover()?;
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    fn store(&self) -> &dyn JobStore {
        self.inner.store.as_ref()
    }

    fn resolver(&self) -> DependencyResolver<'_> {
        DependencyResolver::new(self.store())
    }

    // Queries

    pub fn get(&self, id: JobId) -> crate::Result<Job> {
        self.store().get(id)?.ok_or(Error::JobNotFound(id))
    }

    pub fn list(&self, filter: &JobFilter) -> crate::Result<Vec<Job>> {
        self.store().list(filter)
    }

    /// Newest attempt in the retry chain that starts at `id`.
    pub fn latest_attempt(&self, id: JobId) -> crate::Result<Job> {
        self.resolver()
            .latest_attempt(id)?
            .ok_or(Error::JobNotFound(id))
    }

    /// Returns `true` while some job is waiting, queued or running.
    pub fn has_active_jobs(&self) -> crate::Result<bool> {
        let active = self.store().list(&JobFilter::with_states(vec![
            JobState::Pending,
            JobState::Queued,
            JobState::Running,
        ]))?;
        Ok(!active.is_empty())
    }

    pub fn export(&self) -> crate::Result<Export> {
        let jobs = self.store().list(&JobFilter::all())?;
        Ok(Export {
            exported_at: Utc::now(),
            total_jobs: jobs.len(),
            jobs,
        })
    }

    // Registration

    /// Registers a new job and submits it right away if its dependencies allow it.
    pub async fn submit(&self, spec: JobSpec) -> crate::Result<JobId> {
        self.validate(&spec)?;

        let id = self.store().allocate_id()?;
        let job_dir = self.job_dir(id);
        std::fs::create_dir_all(&job_dir)?;
        let job = Job::new(id, spec, job_dir, Utc::now());
        log::debug!("Registering job {id} ({})", job.name);
        self.store().create(job)?;

        self.settle(vec![id]).await;
        Ok(id)
    }

    fn validate(&self, spec: &JobSpec) -> crate::Result<()> {
        if spec.command.trim().is_empty() {
            return Err(Error::InvalidJob("command is empty".to_string()));
        }
        let mut seen = Set::new();
        for (kind, predecessor) in spec.dependencies.edges() {
            if self.store().get(predecessor)?.is_none() {
                return Err(Error::InvalidJob(format!(
                    "{kind} dependency on job {predecessor}, which does not exist"
                )));
            }
            if !seen.insert(predecessor) {
                return Err(Error::InvalidJob(format!(
                    "job {predecessor} is listed more than once in dependencies"
                )));
            }
        }
        Ok(())
    }

    fn job_dir(&self, id: JobId) -> PathBuf {
        self.inner.config.workdir.join(id.to_string())
    }

    // Submission

    /// Submits `id` if it is pending and ready, then processes everything that follows from
    /// it. Returns the state of the job afterwards.
    pub async fn advance(&self, id: JobId) -> crate::Result<JobState> {
        self.settle(vec![id]).await;
        Ok(self.get(id)?.state)
    }

    /// Processes a worklist of jobs whose readiness may have changed, following the
    /// consequences (blocked dependents, new attempts) until nothing changes.
    async fn settle(&self, work: Vec<JobId>) {
        let mut queue: VecDeque<JobId> = work.into();
        while let Some(id) = queue.pop_front() {
            match self.try_submit(id).await {
                Ok(follow_ups) => queue.extend(follow_ups),
                Err(error) => log::error!("Cannot process job {id}: {error}"),
            }
        }
    }

    /// Evaluates a pending job and submits it when it is ready. The job lock and the
    /// `pending` check together guarantee that a job reaches the scheduler at most once.
    /// Returns jobs to be re-evaluated as a consequence.
    async fn try_submit(&self, id: JobId) -> crate::Result<Vec<JobId>> {
        let _guard = self.inner.locks.lock(id).await;
        let Some(job) = self.store().get(id)? else {
            return Ok(Vec::new());
        };
        if job.state != JobState::Pending {
            return Ok(Vec::new());
        }

        match self.resolver().readiness(&job)? {
            Readiness::Waiting => {
                log::debug!("Job {id} is waiting for its dependencies");
                Ok(Vec::new())
            }
            Readiness::Blocked(reason) => {
                log::info!("Job {id} cannot run: {reason}");
                let job = self.store().update(
                    id,
                    JobUpdate {
                        state: Some(JobState::Failed),
                        failure: Some(Failure::new(FailureKind::Dependency, reason)),
                        completed_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )?;
                self.on_finished(&job)
            }
            Readiness::Ready => self.submit_to_scheduler(job).await,
        }
    }

    async fn submit_to_scheduler(&self, job: Job) -> crate::Result<Vec<JobId>> {
        let id = job.id;
        let dependencies = self.resolver().scheduler_dependencies(&job)?;
        let stdout = job.job_dir.join(STDOUT_LOG_NAME);
        let stderr = job.job_dir.join(STDERR_LOG_NAME);
        let spec = ScriptSpec::from_job(&job, stdout.clone(), stderr.clone(), dependencies);
        let script = self.inner.backend.build_script(&spec);
        let script_path = job.job_dir.join(script_file_name(&job.name));

        let result = match prepare_script(&job.job_dir, &script_path, &script) {
            Ok(()) => {
                self.call_backend(
                    "submit",
                    self.inner.backend.submit(&script_path, &job.job_dir),
                )
                .await
            }
            Err(error) => Err(anyhow!("cannot write script: {error}")),
        };

        match result {
            Ok(handle) => {
                log::info!("Job {id} submitted as {handle}");
                self.store().update(
                    id,
                    JobUpdate {
                        state: Some(JobState::Queued),
                        scheduler_handle: Some(handle),
                        script_path: Some(script_path),
                        stdout_path: Some(stdout),
                        stderr_path: Some(stderr),
                        submitted_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )?;
                Ok(Vec::new())
            }
            Err(error) => {
                log::warn!("Submission of job {id} failed: {error:?}");
                let job = self.store().update(
                    id,
                    JobUpdate {
                        state: Some(JobState::Failed),
                        failure: Some(Failure::new(
                            FailureKind::Scheduler,
                            format!("submission failed: {error}"),
                        )),
                        script_path: Some(script_path),
                        completed_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )?;
                self.on_finished(&job)
            }
        }
    }

    /// Bounds a backend call by the configured timeout.
    async fn call_backend<T>(&self, operation: &str, future: SchedulerFuture<T>) -> SchedulerResult<T> {
        let timeout = self.inner.config.command_timeout;
        match tokio::time::timeout(timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "{operation} did not finish within {}",
                humantime::format_duration(timeout)
            )),
        }
    }

    /// Called with the job lock held, right after `job` reached a terminal state.
    /// Creates the next attempt if the retry policy allows it and returns the jobs
    /// that need to be re-evaluated.
    fn on_finished(&self, job: &Job) -> crate::Result<Vec<JobId>> {
        let mut follow_ups = Vec::new();
        if self.inner.policy.retries_automatically(job) {
            let retry = self.create_attempt(job, job.max_retries)?;
            log::info!(
                "Job {} ended as {}, retrying as job {} (attempt {}/{})",
                job.id,
                job.state,
                retry,
                job.attempt + 1,
                job.max_retries + 1
            );
            follow_ups.push(retry);
        }
        follow_ups.extend(self.resolver().dependents_of_chain(job)?);
        Ok(follow_ups)
    }

    fn create_attempt(&self, job: &Job, max_retries: u32) -> crate::Result<JobId> {
        let id = self.store().allocate_id()?;
        let job_dir = self.job_dir(id);
        std::fs::create_dir_all(&job_dir)?;
        let mut retry = job.next_attempt(id, job_dir, Utc::now());
        retry.max_retries = max_retries;
        self.store().create(retry)?;
        Ok(id)
    }

    // Tracking

    /// Performs one tracking step of a job: asks the scheduler for its status and applies
    /// the resulting transition. Returns the best known state of the job.
    pub async fn poll(&self, id: JobId) -> crate::Result<JobState> {
        let job = self.get(id)?;
        let handle = match (&job.scheduler_handle, job.state.is_submitted()) {
            (Some(handle), true) => handle.clone(),
            _ => return Ok(job.state),
        };

        let report = self
            .call_backend("status query", self.inner.backend.poll_status(&handle))
            .await;

        let (state, follow_ups) = {
            let _guard = self.inner.locks.lock(id).await;
            let job = self.get(id)?;
            if !job.state.is_submitted() {
                // Cancelled (or otherwise finished) while the query was running
                return Ok(job.state);
            }
            self.apply_report(job, report)?
        };
        self.settle(follow_ups).await;
        Ok(state)
    }

    fn apply_report(
        &self,
        job: Job,
        report: SchedulerResult<StatusReport>,
    ) -> crate::Result<(JobState, Vec<JobId>)> {
        let id = job.id;
        let report = match report {
            Ok(report) if report.status != SchedulerStatus::Unknown => report,
            result => {
                if let Err(error) = &result {
                    log::warn!("Status of job {id} could not be determined: {error:?}");
                }
                return self.record_status_error(job);
            }
        };

        let update = match report.status {
            SchedulerStatus::Pending => JobUpdate {
                status_errors: Some(0),
                ..Default::default()
            },
            SchedulerStatus::Running => JobUpdate {
                state: Some(JobState::Running),
                started_at: job.started_at.or_else(|| Some(Utc::now())),
                status_errors: Some(0),
                ..Default::default()
            },
            status => {
                let Some(reported) = status.terminal_state() else {
                    return Ok((job.state, Vec::new()));
                };
                return self.finish(job, reported, report.exit_code);
            }
        };
        if job.state == JobState::Queued && update.state == Some(JobState::Running) {
            log::debug!("Job {id} is running");
        }
        let job = self.store().update(id, update)?;
        Ok((job.state, Vec::new()))
    }

    fn record_status_error(&self, job: Job) -> crate::Result<(JobState, Vec<JobId>)> {
        let errors = job.status_errors + 1;
        if errors <= self.inner.config.max_status_errors {
            self.store().update(
                job.id,
                JobUpdate {
                    status_errors: Some(errors),
                    ..Default::default()
                },
            )?;
            return Ok((job.state, Vec::new()));
        }

        log::warn!(
            "Giving up on job {} after {errors} inconclusive status queries",
            job.id
        );
        let job = self.store().update(
            job.id,
            JobUpdate {
                state: Some(JobState::Unknown),
                status_errors: Some(errors),
                failure: Some(Failure::new(
                    FailureKind::Unknown,
                    format!("status could not be determined after {errors} attempts"),
                )),
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        )?;
        let follow_ups = self.on_finished(&job)?;
        Ok((job.state, follow_ups))
    }

    /// Classifies a job that the scheduler reported as finished and records the verdict
    /// together with the final state.
    fn finish(
        &self,
        job: Job,
        reported: JobState,
        exit_code: Option<i32>,
    ) -> crate::Result<(JobState, Vec<JobId>)> {
        let stderr = job.stderr_path.as_deref().and_then(read_log);
        let stdout = job.stdout_path.as_deref().and_then(read_log);
        let exit_code = exit_code.or_else(|| stderr.as_deref().and_then(extract_exit_code));
        let logs: Vec<String> = stderr.into_iter().chain(stdout).collect();

        let verdict = self.inner.classifier.classify(
            &Observed {
                reported,
                exit_code,
                logs: &logs,
                expected_files: &job.expected_files,
            },
            &FsProbe::new(&job.workdir),
        );
        let state = final_state(reported, &verdict);
        match &verdict {
            Verdict::Success => log::info!("Job {} completed", job.id),
            Verdict::Failed(failure) => {
                log::info!("Job {} ended as {state}: {}", job.id, failure.reason)
            }
        }

        let job = self.store().update(
            job.id,
            JobUpdate {
                state: Some(state),
                exit_code,
                failure: verdict.failure().cloned(),
                status_errors: Some(0),
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        )?;
        let follow_ups = self.on_finished(&job)?;
        Ok((state, follow_ups))
    }

    /// One tracking step for every submitted job, performed concurrently, followed by
    /// a re-evaluation of pending jobs.
    pub async fn sweep(&self) -> crate::Result<()> {
        let active = self.store().list(&JobFilter::with_states(vec![
            JobState::Queued,
            JobState::Running,
        ]))?;
        let results =
            futures::future::join_all(active.iter().map(|job| self.poll(job.id))).await;
        for (job, result) in active.iter().zip(results) {
            if let Err(error) = result {
                log::error!("Cannot update job {}: {error}", job.id);
            }
        }

        let pending = self
            .store()
            .list(&JobFilter::with_states(vec![JobState::Pending]))?;
        self.settle(pending.into_iter().map(|job| job.id).collect())
            .await;
        Ok(())
    }

    /// Creates attempts that should exist according to the retry policy but are missing,
    /// e.g. because a previous process ended between recording a failure and retrying.
    pub fn recover(&self) -> crate::Result<Vec<JobId>> {
        let finished = self.store().list(&JobFilter::with_states(vec![
            JobState::Failed,
            JobState::TimedOut,
        ]))?;
        let mut created = Vec::new();
        for job in finished {
            if self.inner.policy.retries_automatically(&job)
                && self
                    .store()
                    .list(&JobFilter::children_of(job.id))?
                    .is_empty()
            {
                let retry = self.create_attempt(&job, job.max_retries)?;
                log::info!("Recovered missing retry of job {} as job {retry}", job.id);
                created.push(retry);
            }
        }
        Ok(created)
    }

    // User actions

    /// Cancels a job. Pending jobs never reach the scheduler, submitted ones are cancelled
    /// there. Returns `false` if the job had already finished.
    pub async fn cancel(&self, id: JobId) -> crate::Result<bool> {
        let follow_ups = {
            let _guard = self.inner.locks.lock(id).await;
            let job = self.get(id)?;
            if job.is_terminal() {
                return Ok(false);
            }
            if let (true, Some(handle)) = (job.state.is_submitted(), &job.scheduler_handle) {
                match self
                    .call_backend("cancel", self.inner.backend.cancel(handle))
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => log::debug!("Job {id} ({handle}) was already gone"),
                    Err(error) => log::warn!("Cannot cancel job {id} ({handle}): {error:?}"),
                }
            }
            let job = self.store().update(
                id,
                JobUpdate {
                    state: Some(JobState::Cancelled),
                    failure: Some(Failure::new(FailureKind::Scheduler, CANCELLED_REASON)),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )?;
            log::info!("Job {id} cancelled");
            self.on_finished(&job)?
        };
        self.settle(follow_ups).await;
        Ok(true)
    }

    /// Cancels all jobs that have not finished yet. Dependents are cancelled before their
    /// predecessors, so that nothing gets submitted in the meantime.
    pub async fn cancel_all(&self) -> crate::Result<Vec<JobId>> {
        let active = self.store().list(&JobFilter::with_states(vec![
            JobState::Pending,
            JobState::Queued,
            JobState::Running,
        ]))?;
        let mut cancelled = Vec::new();
        for job in active.iter().rev() {
            if self.cancel(job.id).await? {
                cancelled.push(job.id);
            }
        }
        cancelled.reverse();
        Ok(cancelled)
    }

    /// Creates a new attempt of a finished job, regardless of its retry budget.
    pub async fn retry(&self, id: JobId) -> crate::Result<JobId> {
        let retry = {
            let _guard = self.inner.locks.lock(id).await;
            let job = self.get(id)?;
            if !job.is_terminal() {
                return Err(Error::InvalidState {
                    id,
                    state: job.state,
                });
            }
            if let Some(existing) = self.store().list(&JobFilter::children_of(id))?.first() {
                return Err(Error::InvalidJob(format!(
                    "job {id} was already retried as job {}",
                    existing.id
                )));
            }
            let budget = self.inner.policy.manual_retry_budget(&job);
            let retry = self.create_attempt(&job, budget)?;
            log::info!("Job {id} retried as job {retry}");
            retry
        };
        self.settle(vec![retry]).await;
        Ok(retry)
    }

    /// Removes a finished job record together with its job directory.
    pub async fn cleanup(&self, id: JobId) -> crate::Result<()> {
        {
            let _guard = self.inner.locks.lock(id).await;
            let job = self.get(id)?;
            if job.state.is_submitted() {
                return Err(Error::InvalidState {
                    id,
                    state: job.state,
                });
            }
            let latest = self.latest_attempt(id)?;
            if latest.id != id
                && (!latest.is_terminal() || self.inner.policy.retries_automatically(&latest))
            {
                return Err(Error::InvalidJob(format!(
                    "job {id} was retried as job {}, which has not finished yet",
                    latest.id
                )));
            }
            for dependent in self.store().dependents_of(id)? {
                let active = self
                    .store()
                    .get(dependent)?
                    .is_some_and(|dependent| !dependent.is_terminal());
                if active {
                    return Err(Error::InvalidJob(format!(
                        "job {dependent} still depends on job {id}"
                    )));
                }
            }
            remove_dir_if_exists(&job.job_dir)?;
            self.store().remove(id)?;
            log::info!("Job {id} removed");
        }
        self.inner.locks.forget(id);
        Ok(())
    }
}

fn resolve_scheduler(configured: Option<SchedulerKind>) -> crate::Result<SchedulerKind> {
    match configured.or_else(detect_scheduler) {
        Some(kind) => Ok(kind),
        None => Err(Error::SchedulerError(
            "No scheduler found: neither `sbatch` nor `qsub` is available in PATH. \
             Select one explicitly with --scheduler."
                .to_string(),
        )),
    }
}

fn script_file_name(name: &str) -> String {
    let name: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "-_.".contains(c) {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{name}.sh")
}

fn prepare_script(job_dir: &Path, script_path: &Path, script: &str) -> crate::Result<()> {
    std::fs::create_dir_all(job_dir)?;
    write_executable(script_path, script)
}

