use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;

use crate::JobId;
use crate::client::globalsettings::GlobalSettings;
use crate::common::parser::{consume_all, p_memory_mib};
use crate::common::utils::time::ExtendedArgDuration;
use crate::job::{Dependencies, Environment, JobSpec, ResourceRequest};
use crate::scheduler::shell_quote;

crate::arg_wrapper!(ArgMemory, u64, parse_memory);

fn parse_memory(input: &str) -> anyhow::Result<u64> {
    consume_all(p_memory_mib, input)
}

#[derive(Clone, Debug)]
pub struct ArgEnvironmentVar {
    key: String,
    value: String,
}

impl FromStr for ArgEnvironmentVar {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            anyhow::bail!("Environment variable cannot be empty");
        }
        let var = match s.find('=') {
            Some(0) => anyhow::bail!("Environment variable name cannot be empty"),
            Some(position) => ArgEnvironmentVar {
                key: s[..position].to_string(),
                value: s[position + 1..].to_string(),
            },
            None => ArgEnvironmentVar {
                key: s.to_string(),
                value: Default::default(),
            },
        };
        Ok(var)
    }
}

#[derive(Parser)]
pub struct JobSubmitOpts {
    /// Name of the job
    /// [default: job_<id>]
    #[arg(long)]
    name: Option<String>,

    /// Number of nodes
    /// [default: 1]
    #[arg(long)]
    nodes: Option<u32>,

    /// Number of CPU cores per node
    /// [default: 1]
    #[arg(long)]
    cpus: Option<u32>,

    /// Memory per node, e.g. `4GB`, `512mb` or `2G`. Plain numbers are megabytes
    /// [default: 4GB]
    #[arg(long)]
    memory: Option<ArgMemory>,

    /// Wall-time limit, either `HH:MM:SS` or humantime (`2h 30m`)
    /// [default: 1h]
    #[arg(long)]
    walltime: Option<ExtendedArgDuration>,

    /// Number of GPUs per node
    #[arg(long)]
    gpus: Option<u32>,

    /// Queue (PBS) or partition (SLURM)
    #[arg(long)]
    queue: Option<String>,

    /// Account charged for the job
    #[arg(long)]
    account: Option<String>,

    /// Working directory of the job
    /// [default: the job directory]
    #[arg(long, value_hint = clap::ValueHint::DirPath)]
    workdir: Option<PathBuf>,

    /// Environment variable exported for the job.
    /// You can pass this flag multiple times to pass multiple variables
    ///
    /// `--env=KEY=VAL` - set an environment variable named `KEY` with the value `VAL`
    #[arg(long)]
    env: Vec<ArgEnvironmentVar>,

    /// File that has to exist in the working directory after the job ends.
    /// Glob patterns (`*.csv`) are allowed. Can be passed multiple times
    #[arg(long = "expect")]
    expected_files: Vec<String>,

    /// Start only after these jobs complete successfully
    #[arg(long, value_delimiter(','))]
    after_ok: Vec<JobId>,

    /// Start only after these jobs fail
    #[arg(long, value_delimiter(','))]
    after_notok: Vec<JobId>,

    /// Start after these jobs end, regardless of their result
    #[arg(long, value_delimiter(','))]
    after_any: Vec<JobId>,

    /// How many times is the job resubmitted automatically when it fails
    #[arg(long, default_value_t = 0)]
    max_retries: u32,

    /// Command executed by the job. A single argument is passed to the shell as-is
    #[arg(required = true, trailing_var_arg(true))]
    command: Vec<String>,
}

impl JobSubmitOpts {
    fn into_spec(self) -> JobSpec {
        let defaults = ResourceRequest::default();
        let resources = ResourceRequest {
            nodes: self.nodes.unwrap_or(defaults.nodes),
            cpus: self.cpus.unwrap_or(defaults.cpus),
            memory_mib: self
                .memory
                .map(|memory| memory.unpack())
                .unwrap_or(defaults.memory_mib),
            walltime: self
                .walltime
                .map(|walltime| walltime.unpack())
                .unwrap_or(defaults.walltime),
            gpus: self.gpus.unwrap_or(defaults.gpus),
            queue: self.queue,
            account: self.account,
        };
        let env: Environment = self
            .env
            .into_iter()
            .map(|var| (var.key, var.value))
            .collect();
        JobSpec {
            name: self.name,
            command: format_command(&self.command),
            resources,
            workdir: self.workdir,
            env,
            expected_files: self.expected_files,
            dependencies: Dependencies {
                after_success: self.after_ok,
                after_failure: self.after_notok,
                after_any: self.after_any,
            },
            max_retries: self.max_retries,
        }
    }
}

/// A single argument is kept verbatim so that shell constructs (`a && b`) can be passed
/// in one string, multiple arguments are quoted individually.
fn format_command(args: &[String]) -> String {
    match args {
        [command] => command.clone(),
        args => args
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" "),
    }
}

pub async fn submit_computation(
    gsettings: &GlobalSettings,
    opts: JobSubmitOpts,
) -> anyhow::Result<()> {
    let mut spec = opts.into_spec();
    if let Some(workdir) = spec.workdir.take() {
        spec.workdir = Some(crate::common::utils::fs::absolute_path(workdir)?);
    }
    let engine = gsettings.engine()?;
    let id = engine.submit(spec).await?;
    gsettings.printer().print_job_submitted(&engine.get(id)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{ArgEnvironmentVar, JobSubmitOpts, format_command};
    use crate::JobId;
    use clap::Parser;
    use std::str::FromStr;
    use std::time::Duration;

    #[derive(Parser)]
    struct Wrapper {
        #[clap(flatten)]
        opts: JobSubmitOpts,
    }

    fn parse(args: &[&str]) -> JobSubmitOpts {
        let mut all = vec!["submit"];
        all.extend(args);
        Wrapper::try_parse_from(all).unwrap().opts
    }

    #[test]
    fn test_format_command() {
        assert_eq!(format_command(&["make && ./run".to_string()]), "make && ./run");
        assert_eq!(
            format_command(&["echo".to_string(), "hello world".to_string()]),
            "echo 'hello world'"
        );
    }

    #[test]
    fn test_parse_env_var() {
        let var = ArgEnvironmentVar::from_str("OMP_NUM_THREADS=4").unwrap();
        assert_eq!(var.key, "OMP_NUM_THREADS");
        assert_eq!(var.value, "4");
        assert!(ArgEnvironmentVar::from_str("=4").is_err());
        assert!(ArgEnvironmentVar::from_str("").is_err());
    }

    #[test]
    fn test_submit_options_to_spec() {
        let spec = parse(&[
            "--name",
            "solve",
            "--cpus",
            "8",
            "--memory",
            "2GB",
            "--walltime",
            "02:00:00",
            "--env",
            "A=1",
            "--expect",
            "out.dat",
            "--after-ok",
            "1,2",
            "--after-any",
            "3",
            "--max-retries",
            "2",
            "./solver",
            "--input",
            "mesh.dat",
        ])
        .into_spec();

        assert_eq!(spec.name.as_deref(), Some("solve"));
        assert_eq!(spec.command, "./solver --input mesh.dat");
        assert_eq!(spec.resources.cpus, 8);
        assert_eq!(spec.resources.nodes, 1);
        assert_eq!(spec.resources.memory_mib, 2048);
        assert_eq!(spec.resources.walltime, Duration::from_secs(7200));
        assert_eq!(spec.env["A"], "1");
        assert_eq!(spec.expected_files, vec!["out.dat"]);
        assert_eq!(
            spec.dependencies.after_success,
            vec![JobId::new(1), JobId::new(2)]
        );
        assert_eq!(spec.dependencies.after_any, vec![JobId::new(3)]);
        assert_eq!(spec.max_retries, 2);
    }

    #[test]
    fn test_submit_defaults() {
        let spec = parse(&["true"]).into_spec();
        assert_eq!(spec.resources.memory_mib, 4096);
        assert_eq!(spec.resources.walltime, Duration::from_secs(3600));
        assert!(spec.dependencies.is_empty());
    }
}
