use std::path::PathBuf;

use clap::Parser;

use crate::JobId;
use crate::client::globalsettings::GlobalSettings;
use crate::job::JobState;
use crate::store::JobFilter;

#[derive(Parser)]
pub struct JobStatusOpts {
    /// Jobs whose status is refreshed from the scheduler
    #[arg(required = true, value_delimiter(','))]
    pub ids: Vec<JobId>,
}

#[derive(Parser)]
pub struct JobListOpts {
    /// Display only jobs in the given state(s).
    /// You can use multiple states separated by a comma
    #[arg(long, value_delimiter(','), value_enum)]
    pub state: Vec<JobState>,
}

#[derive(Parser)]
pub struct JobInfoOpts {
    /// Job to display
    pub id: JobId,
}

#[derive(Parser)]
pub struct JobCancelOpts {
    /// Jobs to cancel
    #[arg(value_delimiter(','), required_unless_present("all"), conflicts_with("all"))]
    pub ids: Vec<JobId>,

    /// Cancel all jobs that have not finished yet
    #[arg(long)]
    pub all: bool,
}

#[derive(Parser)]
pub struct JobRetryOpts {
    /// Finished job that is submitted again as a new attempt
    pub id: JobId,
}

#[derive(Parser)]
pub struct JobCleanupOpts {
    /// Finished job whose record and job directory are removed
    pub id: JobId,
}

#[derive(Parser)]
pub struct ExportOpts {
    /// Write the snapshot into a file instead of the standard output
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    pub output: Option<PathBuf>,
}

pub async fn output_job_status(
    gsettings: &GlobalSettings,
    opts: JobStatusOpts,
) -> anyhow::Result<()> {
    let engine = gsettings.engine()?;
    let mut jobs = Vec::with_capacity(opts.ids.len());
    for id in opts.ids {
        engine.poll(id).await?;
        jobs.push(engine.get(id)?);
    }
    gsettings.printer().print_job_list(&jobs);
    Ok(())
}

pub fn output_job_list(gsettings: &GlobalSettings, opts: JobListOpts) -> anyhow::Result<()> {
    let engine = gsettings.engine()?;
    let filter = if opts.state.is_empty() {
        JobFilter::all()
    } else {
        JobFilter::with_states(opts.state)
    };
    gsettings.printer().print_job_list(&engine.list(&filter)?);
    Ok(())
}

pub fn output_job_detail(gsettings: &GlobalSettings, opts: JobInfoOpts) -> anyhow::Result<()> {
    let engine = gsettings.engine()?;
    gsettings.printer().print_job_detail(&engine.get(opts.id)?);
    Ok(())
}

pub fn output_job_failure(gsettings: &GlobalSettings, opts: JobInfoOpts) -> anyhow::Result<()> {
    let engine = gsettings.engine()?;
    gsettings.printer().print_job_failure(&engine.get(opts.id)?);
    Ok(())
}

pub async fn cancel_jobs(gsettings: &GlobalSettings, opts: JobCancelOpts) -> anyhow::Result<()> {
    let engine = gsettings.engine()?;
    if opts.all {
        let cancelled = engine.cancel_all().await?;
        gsettings.printer().print_jobs_cancelled(&cancelled, &[]);
        return Ok(());
    }

    let mut cancelled = Vec::new();
    let mut finished = Vec::new();
    for id in opts.ids {
        if engine.cancel(id).await? {
            cancelled.push(id);
        } else {
            finished.push(id);
        }
    }
    gsettings
        .printer()
        .print_jobs_cancelled(&cancelled, &finished);
    Ok(())
}

pub async fn retry_job(gsettings: &GlobalSettings, opts: JobRetryOpts) -> anyhow::Result<()> {
    let engine = gsettings.engine()?;
    let retry = engine.retry(opts.id).await?;
    gsettings
        .printer()
        .print_job_retried(opts.id, &engine.get(retry)?);
    Ok(())
}

pub async fn cleanup_job(gsettings: &GlobalSettings, opts: JobCleanupOpts) -> anyhow::Result<()> {
    let engine = gsettings.engine()?;
    engine.cleanup(opts.id).await?;
    gsettings.printer().print_job_removed(opts.id);
    Ok(())
}

pub fn export_jobs(gsettings: &GlobalSettings, opts: ExportOpts) -> anyhow::Result<()> {
    let engine = gsettings.engine()?;
    let export = engine.export()?;
    let json = serde_json::to_string_pretty(&export)?;
    match opts.output {
        Some(path) => {
            std::fs::write(&path, json)?;
            log::info!(
                "Exported {} jobs into {}",
                export.total_jobs,
                path.display()
            );
        }
        None => println!("{json}"),
    }
    Ok(())
}
