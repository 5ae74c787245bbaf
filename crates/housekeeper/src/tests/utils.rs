use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use derive_builder::Builder;
use tempfile::TempDir;

use crate::common::config::EngineConfig;
use crate::engine::Engine;
use crate::job::{Dependencies, Job, JobId, JobSpec};
use crate::scheduler::{
    DependencyMap, SchedulerBackend, SchedulerFuture, SchedulerStatus, ScriptSpec, StatusReport,
};
use crate::store::{JobStore, MemoryJobStore};
use crate::{Map, Set};

#[derive(Default)]
pub struct FakeSchedulerState {
    pub submitted: Vec<String>,
    pub cancelled: Vec<String>,
    pub scripts: Vec<(String, DependencyMap)>,
    pub statuses: Map<String, StatusReport>,
    pub broken_statuses: Set<String>,
    pub polls: usize,
    pub submit_error: Option<String>,
    pub delay: Option<Duration>,
}

/// Scheduler backend that keeps jobs in memory. Job status is driven by the test.
#[derive(Clone, Default)]
pub struct FakeScheduler {
    state: Arc<Mutex<FakeSchedulerState>>,
}

impl FakeScheduler {
    pub fn get(&self) -> MutexGuard<'_, FakeSchedulerState> {
        self.state.lock().unwrap()
    }

    fn delay(&self) -> Option<Duration> {
        self.get().delay
    }
}

impl SchedulerBackend for FakeScheduler {
    fn build_script(&self, spec: &ScriptSpec) -> String {
        self.get()
            .scripts
            .push((spec.name.clone(), spec.dependencies.clone()));
        format!("#!/bin/bash\n{}\n", spec.command)
    }

    fn submit(&self, _script_path: &Path, _workdir: &Path) -> SchedulerFuture<String> {
        let state = self.state.clone();
        let delay = self.delay();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut state = state.lock().unwrap();
            if let Some(error) = &state.submit_error {
                return Err(anyhow!("{error}"));
            }
            let handle = format!("fake.{}", state.submitted.len() + 1);
            state.submitted.push(handle.clone());
            Ok(handle)
        })
    }

    fn poll_status(&self, handle: &str) -> SchedulerFuture<StatusReport> {
        let state = self.state.clone();
        let delay = self.delay();
        let handle = handle.to_string();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut state = state.lock().unwrap();
            state.polls += 1;
            if state.broken_statuses.contains(&handle) {
                return Err(anyhow!("cannot reach scheduler"));
            }
            Ok(state
                .statuses
                .get(&handle)
                .cloned()
                .unwrap_or_else(|| StatusReport::new(SchedulerStatus::Pending)))
        })
    }

    fn cancel(&self, handle: &str) -> SchedulerFuture<bool> {
        let state = self.state.clone();
        let handle = handle.to_string();
        Box::pin(async move {
            let mut state = state.lock().unwrap();
            state.cancelled.push(handle.clone());
            state
                .statuses
                .insert(handle, StatusReport::new(SchedulerStatus::Cancelled));
            Ok(true)
        })
    }
}

pub struct TestEnv {
    pub engine: Engine,
    pub scheduler: FakeScheduler,
    pub store: Arc<MemoryJobStore>,
    dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(configure: impl FnOnce(&mut EngineConfig)) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = TempDir::with_prefix("hk").unwrap();
        let mut config = EngineConfig {
            workdir: dir.path().join("jobs"),
            poll_interval: Duration::from_millis(10),
            command_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        configure(&mut config);
        let scheduler = FakeScheduler::default();
        let store = Arc::new(MemoryJobStore::default());
        let engine = Engine::new(config, store.clone(), Arc::new(scheduler.clone())).unwrap();
        Self {
            engine,
            scheduler,
            store,
            dir,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub async fn submit(&self, job: TestJobBuilder) -> JobId {
        self.engine.submit(job.build()).await.unwrap()
    }

    /// Registers a job directly in the store, without evaluating it.
    pub fn create_pending(&self, job: TestJobBuilder) -> JobId {
        let id = self.store.allocate_id().unwrap();
        let job_dir = self.engine.config().workdir.join(id.to_string());
        std::fs::create_dir_all(&job_dir).unwrap();
        self.store
            .create(Job::new(id, job.build(), job_dir, Utc::now()))
            .unwrap();
        id
    }

    pub fn handle(&self, id: JobId) -> String {
        self.engine.get(id).unwrap().scheduler_handle.unwrap()
    }

    /// Sets the status that the scheduler reports for the given job from now on.
    pub fn report(&self, id: JobId, status: SchedulerStatus, exit_code: Option<i32>) {
        let handle = self.handle(id);
        self.scheduler
            .get()
            .statuses
            .insert(handle, StatusReport::with_exit_code(status, exit_code));
    }

    pub fn break_status(&self, id: JobId) {
        let handle = self.handle(id);
        self.scheduler.get().broken_statuses.insert(handle);
    }

    pub fn write_stderr(&self, id: JobId, content: &str) {
        let path = self.engine.get(id).unwrap().stderr_path.unwrap();
        std::fs::write(path, content).unwrap();
    }

    pub fn submit_count(&self) -> usize {
        self.scheduler.get().submitted.len()
    }

    /// Reports the job as finished with the given status and processes the report.
    pub async fn finish(&self, id: JobId, status: SchedulerStatus, exit_code: Option<i32>) {
        self.report(id, status, exit_code);
        self.engine.poll(id).await.unwrap();
    }
}

#[derive(Builder)]
#[builder(pattern = "owned", build_fn(name = "finish"))]
pub struct TestJob {
    #[builder(default, setter(into, strip_option))]
    name: Option<String>,
    #[builder(default = "\"true\".to_string()", setter(into))]
    command: String,
    #[builder(default)]
    workdir: Option<PathBuf>,
    #[builder(default)]
    expected_files: Vec<String>,
    #[builder(default)]
    after_success: Vec<JobId>,
    #[builder(default)]
    after_failure: Vec<JobId>,
    #[builder(default)]
    after_any: Vec<JobId>,
    #[builder(default)]
    max_retries: u32,
}

impl TestJobBuilder {
    pub fn build(self) -> JobSpec {
        let TestJob {
            name,
            command,
            workdir,
            expected_files,
            after_success,
            after_failure,
            after_any,
            max_retries,
        } = self.finish().unwrap();
        JobSpec {
            name,
            command,
            workdir,
            expected_files,
            dependencies: Dependencies {
                after_success,
                after_failure,
                after_any,
            },
            max_retries,
            ..Default::default()
        }
    }
}

pub fn job() -> TestJobBuilder {
    TestJobBuilder::default()
}
