use std::path::PathBuf;

use clap::Parser;

use crate::client::commands::job::{
    ExportOpts, JobCancelOpts, JobCleanupOpts, JobInfoOpts, JobListOpts, JobRetryOpts,
    JobStatusOpts,
};
use crate::client::commands::submit::JobSubmitOpts;
use crate::client::commands::wait::{JobWaitOpts, MonitorOpts};
use crate::client::output::outputs::Outputs;
use crate::common::manager::info::SchedulerKind;

#[derive(clap::ValueEnum, Clone)]
pub enum ColorPolicy {
    /// Use colors if the stdout is detected to be a terminal.
    Auto,
    /// Always use colors.
    Always,
    /// Never use colors.
    Never,
}

// Common CLI options
#[derive(Parser)]
pub struct CommonOpts {
    /// Path to a TOML configuration file
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        global = true,
        env = "HK_CONFIG",
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub config: Option<PathBuf>,

    /// Directory that holds job directories and the job journal.
    /// Overrides `workdir` from the configuration file
    #[arg(
        long,
        value_hint = clap::ValueHint::DirPath,
        global = true,
        env = "HK_WORKDIR",
        help_heading("GLOBAL OPTIONS")
    )]
    pub workdir: Option<PathBuf>,

    /// Scheduler family. Detected from the available commands when not set
    #[arg(
        long,
        value_enum,
        global = true,
        env = "HK_SCHEDULER",
        help_heading("GLOBAL OPTIONS")
    )]
    pub scheduler: Option<SchedulerKind>,

    /// Sets console color policy
    #[arg(
        long,
        default_value_t = ColorPolicy::Auto,
        value_enum,
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub colors: ColorPolicy,

    /// Sets output formatting
    #[arg(
        long,
        env = "HK_OUTPUT_MODE",
        default_value_t = Outputs::CLI,
        value_enum,
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub output_mode: Outputs,

    /// Enables more detailed log output
    #[arg(
        long,
        env = "HK_DEBUG",
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub debug: bool,
}

// Root CLI options
#[derive(Parser)]
#[command(
    author,
    about,
    version(crate::HK_VERSION),
    disable_help_subcommand(true),
    help_expected(true)
)]
pub struct RootOptions {
    #[clap(flatten)]
    pub common: CommonOpts,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Parser)]
pub enum SubCommand {
    /// Submit a new job
    Submit(JobSubmitOpts),
    /// Refresh and display the state of jobs
    Status(JobStatusOpts),
    /// Wait until jobs finish
    Wait(JobWaitOpts),
    /// Cancel jobs
    Cancel(JobCancelOpts),
    /// Display all jobs
    List(JobListOpts),
    /// Display detailed information about a job
    Info(JobInfoOpts),
    /// Display why a job failed
    Failure(JobInfoOpts),
    /// Submit a finished job again
    Retry(JobRetryOpts),
    /// Write a JSON snapshot of all jobs
    Export(ExportOpts),
    /// Remove a finished job and its job directory
    Cleanup(JobCleanupOpts),
    /// Track all active jobs until they finish
    Monitor(MonitorOpts),
}
