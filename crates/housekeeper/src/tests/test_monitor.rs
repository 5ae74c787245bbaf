use std::time::Duration;

use crate::engine::monitor::{WaitOutcome, create_monitor_service, run_until_idle};
use crate::job::JobState;
use crate::scheduler::{SchedulerStatus, StatusReport};
use crate::tests::utils::{TestEnv, job};

const INTERVAL: Duration = Duration::from_millis(10);

#[tokio::test]
async fn test_wait_for_completion() {
    let env = TestEnv::new();
    let x = env.submit(job()).await;
    let y = env.submit(job().after_success(vec![x])).await;
    env.report(x, SchedulerStatus::Completed, Some(0));
    env.scheduler.get().statuses.insert(
        "fake.2".to_string(),
        StatusReport::with_exit_code(SchedulerStatus::Completed, Some(0)),
    );

    let (service, process) = create_monitor_service(env.engine.clone(), INTERVAL);
    let process = tokio::spawn(process);
    let outcomes = service
        .wait_for(vec![x, y], Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(
        outcomes,
        vec![
            WaitOutcome {
                requested: x,
                job: x,
                state: JobState::Completed,
                finished: true,
            },
            WaitOutcome {
                requested: y,
                job: y,
                state: JobState::Completed,
                finished: true,
            }
        ]
    );

    service.stop();
    process.await.unwrap();
}

#[tokio::test]
async fn test_wait_follows_retries() {
    let env = TestEnv::new();
    let x = env.submit(job().max_retries(1)).await;
    env.report(x, SchedulerStatus::Failed, Some(1));
    env.scheduler.get().statuses.insert(
        "fake.2".to_string(),
        StatusReport::with_exit_code(SchedulerStatus::Completed, Some(0)),
    );

    let (service, process) = create_monitor_service(env.engine.clone(), INTERVAL);
    tokio::spawn(process);
    let outcomes = service
        .wait_for(vec![x], Some(Duration::from_secs(5)))
        .await
        .unwrap();
    let retry = env.engine.latest_attempt(x).unwrap();
    assert_ne!(retry.id, x);
    assert_eq!(outcomes[0].requested, x);
    assert_eq!(outcomes[0].job, retry.id);
    assert_eq!(outcomes[0].state, JobState::Completed);
    service.stop();
}

#[tokio::test]
async fn test_wait_timeout_returns_known_state() {
    let env = TestEnv::new();
    let x = env.submit(job()).await;
    env.report(x, SchedulerStatus::Running, None);

    let (service, process) = create_monitor_service(env.engine.clone(), INTERVAL);
    tokio::spawn(process);
    let outcomes = service
        .wait_for(vec![x], Some(Duration::from_millis(100)))
        .await
        .unwrap();
    assert_eq!(outcomes[0].state, JobState::Running);
    assert!(!outcomes[0].finished);
    service.stop();
}

#[tokio::test]
async fn test_wait_for_unknown_job() {
    let env = TestEnv::new();
    let (service, process) = create_monitor_service(env.engine.clone(), INTERVAL);
    tokio::spawn(process);
    assert!(
        service
            .wait_for(vec![crate::JobId::new(7)], Some(Duration::from_secs(1)))
            .await
            .is_err()
    );
    service.stop();
}

#[tokio::test]
async fn test_run_until_idle() {
    let env = TestEnv::new();
    let x = env.submit(job()).await;
    let y = env.submit(job().after_any(vec![x])).await;
    env.report(x, SchedulerStatus::Failed, None);
    env.scheduler.get().statuses.insert(
        "fake.2".to_string(),
        StatusReport::new(SchedulerStatus::Completed),
    );

    tokio::time::timeout(Duration::from_secs(5), run_until_idle(&env.engine, INTERVAL))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(env.engine.get(x).unwrap().state, JobState::Failed);
    assert_eq!(env.engine.get(y).unwrap().state, JobState::Completed);
}
