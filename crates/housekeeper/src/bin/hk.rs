use std::io::IsTerminal;

use clap::{CommandFactory, FromArgMatches};
use cli_table::ColorChoice;

use housekeeper::client::commands::job::{
    cancel_jobs, cleanup_job, export_jobs, output_job_detail, output_job_failure,
    output_job_list, output_job_status, retry_job,
};
use housekeeper::client::commands::submit::submit_computation;
use housekeeper::client::commands::wait::{monitor_jobs, wait_for_jobs};
use housekeeper::client::globalsettings::GlobalSettings;
use housekeeper::client::output::cli::CliOutput;
use housekeeper::client::output::json::JsonOutput;
use housekeeper::client::output::outputs::{Output, Outputs};
use housekeeper::common::cli::{ColorPolicy, CommonOpts, RootOptions, SubCommand};
use housekeeper::common::config::EngineConfig;
use housekeeper::common::setup::setup_logging;

fn make_global_settings(opts: CommonOpts) -> anyhow::Result<GlobalSettings> {
    let mut config = EngineConfig::load(opts.config.as_deref())?;
    if let Some(workdir) = opts.workdir {
        config.workdir = workdir;
    }
    if opts.scheduler.is_some() {
        config.scheduler = opts.scheduler;
    }

    let color_policy = match opts.colors {
        ColorPolicy::Always => ColorChoice::AlwaysAnsi,
        ColorPolicy::Auto => {
            if std::io::stdout().is_terminal() {
                ColorChoice::Auto
            } else {
                ColorChoice::Never
            }
        }
        ColorPolicy::Never => ColorChoice::Never,
    };

    let printer: Box<dyn Output> = match opts.output_mode {
        Outputs::CLI => {
            match color_policy {
                ColorChoice::Always | ColorChoice::AlwaysAnsi => {
                    colored::control::set_override(true)
                }
                ColorChoice::Never => colored::control::set_override(false),
                _ => {}
            }
            Box::new(CliOutput::new(color_policy))
        }
        Outputs::JSON => Box::<JsonOutput>::default(),
    };

    Ok(GlobalSettings::new(config, printer))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> housekeeper::Result<()> {
    let matches = RootOptions::command().get_matches();
    let top_opts = match RootOptions::from_arg_matches(&matches) {
        Ok(opts) => opts,
        Err(error) => error.exit(),
    };

    setup_logging(top_opts.common.debug);

    let gsettings = match make_global_settings(top_opts.common) {
        Ok(gsettings) => gsettings,
        Err(error) => {
            eprintln!("{error:?}");
            std::process::exit(1);
        }
    };

    let result = match top_opts.subcmd {
        SubCommand::Submit(opts) => submit_computation(&gsettings, opts).await,
        SubCommand::Status(opts) => output_job_status(&gsettings, opts).await,
        SubCommand::Wait(opts) => wait_for_jobs(&gsettings, opts).await,
        SubCommand::Cancel(opts) => cancel_jobs(&gsettings, opts).await,
        SubCommand::List(opts) => output_job_list(&gsettings, opts),
        SubCommand::Info(opts) => output_job_detail(&gsettings, opts),
        SubCommand::Failure(opts) => output_job_failure(&gsettings, opts),
        SubCommand::Retry(opts) => retry_job(&gsettings, opts).await,
        SubCommand::Export(opts) => export_jobs(&gsettings, opts),
        SubCommand::Cleanup(opts) => cleanup_job(&gsettings, opts).await,
        SubCommand::Monitor(opts) => monitor_jobs(&gsettings, opts).await,
    };

    if let Err(e) = result {
        gsettings.printer().print_error(e);
        std::process::exit(1);
    }

    Ok(())
}
