use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::engine::Engine;
use crate::engine::retry::RetryPolicy;
use crate::job::{JobId, JobState};

/// Where a waited-for job ended up. `job` is the attempt that decided the outcome, which
/// differs from `requested` when the job was retried.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct WaitOutcome {
    pub requested: JobId,
    pub job: JobId,
    pub state: JobState,
    /// `false` if the job had not finished before the wait ended.
    pub finished: bool,
}

enum MonitorMessage {
    WaitFor {
        ids: Vec<JobId>,
        response: oneshot::Sender<crate::Result<Vec<WaitOutcome>>>,
    },
    Stop,
}

struct Waiter {
    ids: Vec<JobId>,
    response: oneshot::Sender<crate::Result<Vec<WaitOutcome>>>,
}

/// Handle to a running monitoring loop.
#[derive(Clone)]
pub struct MonitorService {
    sender: mpsc::UnboundedSender<MonitorMessage>,
    engine: Engine,
}

impl MonitorService {
    /// Waits until every job in `ids` (following retries) has finished, or until `timeout`
    /// elapses. On timeout the best currently known states are returned.
    pub async fn wait_for(
        &self,
        ids: Vec<JobId>,
        timeout: Option<Duration>,
    ) -> crate::Result<Vec<WaitOutcome>> {
        let (response, receiver) = oneshot::channel();
        self.sender
            .send(MonitorMessage::WaitFor {
                ids: ids.clone(),
                response,
            })
            .map_err(|_| crate::Error::GenericError("monitor is not running".to_string()))?;

        let received = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, receiver).await {
                Ok(received) => received,
                Err(_) => {
                    log::debug!("Waiting for jobs timed out");
                    return outcomes(&self.engine, &ids);
                }
            },
            None => receiver.await,
        };
        received
            .map_err(|_| crate::Error::GenericError("monitor has stopped".to_string()))?
    }

    pub fn stop(&self) {
        let _ = self.sender.send(MonitorMessage::Stop);
    }
}

/// Creates a monitoring loop that sweeps the engine every `interval` and resolves waiters.
/// The returned future has to be polled for the service to make progress.
pub fn create_monitor_service(
    engine: Engine,
    interval: Duration,
) -> (MonitorService, impl Future<Output = ()>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let service = MonitorService {
        sender,
        engine: engine.clone(),
    };
    (service, monitor_process(engine, interval, receiver))
}

async fn monitor_process(
    engine: Engine,
    interval: Duration,
    mut receiver: mpsc::UnboundedReceiver<MonitorMessage>,
) {
    let mut waiters: Vec<Waiter> = Vec::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(error) = engine.sweep().await {
                    log::error!("Monitoring sweep failed: {error}");
                }
                waiters = resolve_waiters(&engine, waiters);
            }
            message = receiver.recv() => {
                match message {
                    Some(MonitorMessage::WaitFor { ids, response }) => {
                        waiters = resolve_waiters(&engine, vec![Waiter { ids, response }])
                            .into_iter()
                            .chain(waiters)
                            .collect();
                    }
                    Some(MonitorMessage::Stop) | None => break,
                }
            }
        }
    }
    log::debug!("Monitoring stopped");
}

/// Answers waiters whose jobs have all finished and returns the remaining ones.
fn resolve_waiters(engine: &Engine, waiters: Vec<Waiter>) -> Vec<Waiter> {
    let mut remaining = Vec::new();
    for waiter in waiters {
        if waiter.response.is_closed() {
            continue;
        }
        match outcomes(engine, &waiter.ids) {
            Ok(outcomes) if outcomes.iter().all(|outcome| outcome.finished) => {
                let _ = waiter.response.send(Ok(outcomes));
            }
            Ok(_) => remaining.push(waiter),
            Err(error) => {
                let _ = waiter.response.send(Err(error));
            }
        }
    }
    remaining
}

fn outcomes(engine: &Engine, ids: &[JobId]) -> crate::Result<Vec<WaitOutcome>> {
    ids.iter()
        .map(|&id| {
            let latest = engine.latest_attempt(id)?;
            let finished = latest.is_terminal() && !RetryPolicy.retries_automatically(&latest);
            Ok(WaitOutcome {
                requested: id,
                job: latest.id,
                state: latest.state,
                finished,
            })
        })
        .collect()
}

/// Sweeps the engine every `interval` until no job is waiting, queued or running.
pub async fn run_until_idle(engine: &Engine, interval: Duration) -> crate::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        engine.sweep().await?;
        if !engine.has_active_jobs()? {
            return Ok(());
        }
    }
}
