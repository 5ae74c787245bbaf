use std::time::{Duration, Instant};

use clap::Parser;

use crate::JobId;
use crate::client::globalsettings::GlobalSettings;
use crate::common::utils::time::ArgDuration;
use crate::engine::monitor::{create_monitor_service, run_until_idle};
use crate::job::JobState;
use crate::store::JobFilter;

#[derive(Parser)]
pub struct JobWaitOpts {
    /// Jobs to wait for. Retried jobs are followed to their last attempt
    #[arg(required = true, value_delimiter(','))]
    pub ids: Vec<JobId>,

    /// Stop waiting after this duration and report the currently known states
    #[arg(long)]
    pub timeout: Option<ArgDuration>,

    /// How often is the scheduler queried
    /// [default: `poll_interval` from the configuration]
    #[arg(long)]
    pub poll_interval: Option<ArgDuration>,
}

#[derive(Parser)]
pub struct MonitorOpts {
    /// How often is the scheduler queried
    /// [default: `poll_interval` from the configuration]
    #[arg(long)]
    pub poll_interval: Option<ArgDuration>,
}

fn poll_interval(gsettings: &GlobalSettings, value: Option<ArgDuration>) -> Duration {
    value
        .map(|interval| interval.unpack())
        .unwrap_or(gsettings.config().poll_interval)
}

pub async fn wait_for_jobs(gsettings: &GlobalSettings, opts: JobWaitOpts) -> anyhow::Result<()> {
    let engine = gsettings.engine()?;
    let interval = poll_interval(gsettings, opts.poll_interval);
    let start = Instant::now();

    let (service, process) = create_monitor_service(engine, interval);
    let monitor = tokio::spawn(process);
    let outcomes = service
        .wait_for(opts.ids, opts.timeout.map(|timeout| timeout.unpack()))
        .await;
    service.stop();
    if let Err(error) = monitor.await {
        log::warn!("Monitoring task failed: {error}");
    }
    let outcomes = outcomes?;
    gsettings.printer().print_job_wait(start.elapsed(), &outcomes);

    if outcomes
        .iter()
        .any(|outcome| outcome.state != JobState::Completed)
    {
        anyhow::bail!("Some jobs did not complete successfully");
    }
    Ok(())
}

pub async fn monitor_jobs(gsettings: &GlobalSettings, opts: MonitorOpts) -> anyhow::Result<()> {
    let engine = gsettings.engine()?;
    let interval = poll_interval(gsettings, opts.poll_interval);
    log::info!(
        "Monitoring jobs every {}",
        humantime::format_duration(interval)
    );
    run_until_idle(&engine, interval).await?;
    gsettings
        .printer()
        .print_job_list(&engine.list(&JobFilter::all())?);
    Ok(())
}
