use std::time::Duration;

use serde_json::json;

use crate::JobId;
use crate::client::output::outputs::Output;
use crate::engine::monitor::WaitOutcome;
use crate::job::Job;

#[derive(Default)]
pub struct JsonOutput;

impl JsonOutput {
    fn print(&self, data: serde_json::Value) {
        match serde_json::to_string_pretty(&data) {
            Ok(text) => println!("{text}"),
            Err(error) => log::error!("Cannot serialize output: {error}"),
        }
    }
}

impl Output for JsonOutput {
    fn print_job_submitted(&self, job: &Job) {
        self.print(json!({
            "id": job.id,
            "state": job.state,
            "scheduler_handle": job.scheduler_handle,
        }));
    }

    fn print_job_list(&self, jobs: &[Job]) {
        self.print(json!(jobs));
    }

    fn print_job_detail(&self, job: &Job) {
        self.print(json!(job));
    }

    fn print_job_failure(&self, job: &Job) {
        self.print(json!({
            "id": job.id,
            "state": job.state,
            "exit_code": job.exit_code,
            "failure": job.failure,
        }));
    }

    fn print_job_wait(&self, duration: Duration, outcomes: &[WaitOutcome]) {
        self.print(json!({
            "duration": duration.as_secs_f64(),
            "jobs": outcomes,
        }));
    }

    fn print_jobs_cancelled(&self, cancelled: &[JobId], finished: &[JobId]) {
        self.print(json!({
            "cancelled": cancelled,
            "already_finished": finished,
        }));
    }

    fn print_job_retried(&self, original: JobId, retry: &Job) {
        self.print(json!({
            "original": original,
            "id": retry.id,
            "attempt": retry.attempt,
            "state": retry.state,
        }));
    }

    fn print_job_removed(&self, id: JobId) {
        self.print(json!({ "removed": id }));
    }

    fn print_error(&self, error: anyhow::Error) {
        self.print(json!({ "error": format!("{error:?}") }));
    }
}
