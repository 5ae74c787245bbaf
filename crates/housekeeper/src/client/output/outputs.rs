use std::time::Duration;

use crate::JobId;
use crate::engine::monitor::WaitOutcome;
use crate::job::Job;

#[derive(clap::ValueEnum, Clone)]
pub enum Outputs {
    CLI,
    JSON,
}

pub trait Output {
    fn print_job_submitted(&self, job: &Job);
    fn print_job_list(&self, jobs: &[Job]);
    fn print_job_detail(&self, job: &Job);
    fn print_job_failure(&self, job: &Job);
    fn print_job_wait(&self, duration: Duration, outcomes: &[WaitOutcome]);
    fn print_jobs_cancelled(&self, cancelled: &[JobId], finished: &[JobId]);
    fn print_job_retried(&self, original: JobId, retry: &Job);
    fn print_job_removed(&self, id: JobId);

    fn print_error(&self, error: anyhow::Error);
}
