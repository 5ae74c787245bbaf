use crate::job::{FailureKind, Job, JobState};

/// Decides whether a finished attempt is resubmitted automatically.
///
/// An attempt may be retried while `attempt < max_retries + 1`. Only failures of the job
/// itself are retried; cancellation, an undeterminable status and blocked dependencies
/// are not. Resubmission is immediate, the scheduler's queue provides the throttling.
#[derive(Default, Clone, Copy)]
pub struct RetryPolicy;

impl RetryPolicy {
    /// Whether the retry budget allows another attempt.
    pub fn should_retry(&self, job: &Job) -> bool {
        job.attempt < job.max_retries + 1
    }

    /// Whether the engine creates the next attempt on its own once `job` has finished.
    pub fn retries_automatically(&self, job: &Job) -> bool {
        let retryable_state = matches!(job.state, JobState::Failed | JobState::TimedOut);
        let blocked = job
            .failure
            .as_ref()
            .is_some_and(|failure| failure.kind == FailureKind::Dependency);
        retryable_state && !blocked && self.should_retry(job)
    }

    /// Retry budget of a manually requested attempt, so that the new attempt
    /// still satisfies `attempt <= max_retries + 1`.
    pub fn manual_retry_budget(&self, job: &Job) -> u32 {
        job.max_retries.max(job.attempt)
    }
}
