use std::fmt::Write;
use std::path::Path;

use anyhow::Context;
use bstr::ByteSlice;

use crate::common::config::ScriptConfig;
use crate::common::manager::slurm::{
    format_slurm_duration, get_scontrol_items, parse_slurm_exit_code,
};
use crate::scheduler::common::{
    format_dependencies, reports_missing_job, run_checked_command, run_command, write_script_body,
};
use crate::scheduler::{
    SchedulerBackend, SchedulerFuture, SchedulerResult, SchedulerStatus, ScriptSpec, StatusReport,
};

pub struct SlurmBackend {
    config: ScriptConfig,
}

impl SlurmBackend {
    pub fn new(config: ScriptConfig) -> Self {
        Self { config }
    }
}

impl SchedulerBackend for SlurmBackend {
    fn build_script(&self, spec: &ScriptSpec) -> String {
        build_slurm_submit_script(&self.config, spec)
    }

    fn submit(&self, script_path: &Path, workdir: &Path) -> SchedulerFuture<String> {
        let script_path = script_path.to_path_buf();
        let workdir = workdir.to_path_buf();

        Box::pin(async move {
            let script = script_path.display().to_string();
            let output = run_checked_command(vec!["sbatch", &script], &workdir).await?;
            log::debug!("Sbatch output: {output}");
            parse_sbatch_output(&output)
        })
    }

    fn poll_status(&self, handle: &str) -> SchedulerFuture<StatusReport> {
        let handle = handle.to_string();

        Box::pin(async move {
            let workdir = std::env::temp_dir();
            match run_checked_command(vec!["scontrol", "show", "job", &handle], &workdir).await {
                Ok(output) => parse_scontrol_status(&output),
                Err(error) => {
                    // Finished jobs disappear from scontrol after `MinJobAge`
                    log::debug!("scontrol failed for job {handle}, trying sacct: {error:?}");
                    let output = run_checked_command(
                        vec!["sacct", "-j", &handle, "-n", "-X", "-P", "-o", "State,ExitCode"],
                        &workdir,
                    )
                    .await
                    .context("sacct execution failed")?;
                    parse_sacct_status(&output)
                }
            }
        })
    }

    fn cancel(&self, handle: &str) -> SchedulerFuture<bool> {
        let handle = handle.to_string();

        Box::pin(async move {
            let output = run_command(vec!["scancel", &handle], &std::env::temp_dir()).await?;
            if output.status.success() {
                Ok(true)
            } else if reports_missing_job(&output) {
                Ok(false)
            } else {
                anyhow::bail!(
                    "scancel failed for job {handle}: {}",
                    output.stderr.to_str_lossy().trim()
                )
            }
        })
    }
}

fn parse_sbatch_output(output: &str) -> SchedulerResult<String> {
    output
        .lines()
        .map(|l| l.trim())
        .find(|l| l.to_lowercase().starts_with("submitted batch job"))
        .and_then(|l| l.split(' ').nth(3))
        .map(|l| l.to_string())
        .ok_or_else(|| anyhow::anyhow!("Missing job id in sbatch output\n{output}"))
}

/// Maps a SLURM job state (as printed by `scontrol` or `sacct`) to a coarse status.
pub fn parse_slurm_state(state: &str) -> SchedulerStatus {
    // sacct prints e.g. `CANCELLED by 1000`
    let state = state.split_whitespace().next().unwrap_or_default();
    match state.trim_end_matches('+') {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED" | "RESV_DEL_HOLD"
        | "SUSPENDED" | "STOPPED" => SchedulerStatus::Pending,
        "RUNNING" | "COMPLETING" | "STAGE_OUT" | "SIGNALING" | "RESIZING" => {
            SchedulerStatus::Running
        }
        "COMPLETED" => SchedulerStatus::Completed,
        "CANCELLED" | "REVOKED" => SchedulerStatus::Cancelled,
        "TIMEOUT" | "DEADLINE" => SchedulerStatus::TimedOut,
        "FAILED" | "NODE_FAIL" | "OUT_OF_MEMORY" | "BOOT_FAIL" | "PREEMPTED" | "SPECIAL_EXIT" => {
            SchedulerStatus::Failed
        }
        _ => SchedulerStatus::Unknown,
    }
}

fn parse_scontrol_status(output: &str) -> SchedulerResult<StatusReport> {
    let items = get_scontrol_items(output);
    let state = items
        .get("JobState")
        .ok_or_else(|| anyhow::anyhow!("Missing key JobState in Slurm scontrol output"))?;
    let status = parse_slurm_state(state);
    let exit_code = match status.terminal_state() {
        Some(_) => items.get("ExitCode").and_then(|c| parse_slurm_exit_code(c)),
        None => None,
    };
    Ok(StatusReport::with_exit_code(status, exit_code))
}

fn parse_sacct_status(output: &str) -> SchedulerResult<StatusReport> {
    let line = output
        .lines()
        .map(|l| l.trim())
        .find(|l| !l.is_empty())
        .ok_or_else(|| anyhow::anyhow!("Job not found in sacct output"))?;
    let mut fields = line.split('|');
    let status = parse_slurm_state(fields.next().unwrap_or_default());
    let exit_code = match status.terminal_state() {
        Some(_) => fields.next().and_then(parse_slurm_exit_code),
        None => None,
    };
    Ok(StatusReport::with_exit_code(status, exit_code))
}

fn build_slurm_submit_script(config: &ScriptConfig, spec: &ScriptSpec) -> String {
    let resources = &spec.resources;
    let mut script = format!(
        r##"#!/bin/bash
#SBATCH --job-name={name}
#SBATCH --output={stdout}
#SBATCH --error={stderr}
#SBATCH --nodes={nodes}
#SBATCH --ntasks-per-node=1
#SBATCH --cpus-per-task={cpus}
#SBATCH --mem={memory}M
#SBATCH --time={walltime}
"##,
        name = spec.name,
        stdout = spec.stdout.display(),
        stderr = spec.stderr.display(),
        nodes = resources.nodes,
        cpus = resources.cpus,
        memory = resources.memory_mib,
        walltime = format_slurm_duration(&resources.walltime)
    );

    if resources.gpus > 0 {
        let _ = writeln!(script, "#SBATCH --gres=gpu:{}", resources.gpus);
    }
    if let Some(partition) = &resources.queue {
        let _ = writeln!(script, "#SBATCH --partition={partition}");
    }
    if let Some(account) = &resources.account {
        let _ = writeln!(script, "#SBATCH --account={account}");
    }
    if let Some(dependency) = format_dependencies(&spec.dependencies, ':') {
        let _ = writeln!(script, "#SBATCH --dependency={dependency}");
    }

    write_script_body(&mut script, "#SBATCH", config, spec);
    script
}

#[cfg(test)]
mod tests {
    use super::{
        SlurmBackend, parse_sacct_status, parse_sbatch_output, parse_scontrol_status,
        parse_slurm_state,
    };
    use crate::common::config::ScriptConfig;
    use crate::job::{DependencyKind, ResourceRequest};
    use crate::scheduler::{
        DependencyMap, SchedulerBackend, SchedulerStatus, ScriptSpec, StatusReport,
    };
    use std::path::PathBuf;
    use std::time::Duration;

    fn spec() -> ScriptSpec {
        let mut dependencies = DependencyMap::new();
        dependencies.insert(DependencyKind::AfterSuccess, vec!["101".to_string()]);
        dependencies.insert(DependencyKind::AfterAny, vec!["102".to_string(), "103".to_string()]);
        ScriptSpec {
            name: "simulate".to_string(),
            command: "./simulate --steps 10".to_string(),
            resources: ResourceRequest {
                nodes: 2,
                cpus: 8,
                memory_mib: 4096,
                walltime: Duration::from_secs(2 * 3600 + 30 * 60),
                gpus: 1,
                queue: Some("gpu".to_string()),
                account: Some("proj-42".to_string()),
            },
            workdir: PathBuf::from("/scratch/sim"),
            env: [("OMP_NUM_THREADS".to_string(), "8".to_string())].into(),
            stdout: PathBuf::from("/jobs/1/stdout.log"),
            stderr: PathBuf::from("/jobs/1/stderr.log"),
            dependencies,
        }
    }

    #[test]
    fn test_build_script() {
        let backend = SlurmBackend::new(ScriptConfig {
            directives: vec!["--qos=normal".to_string()],
            modules: vec!["gcc/12".to_string()],
            env: [
                ("OMP_NUM_THREADS".to_string(), "1".to_string()),
                ("LANG".to_string(), "C".to_string()),
            ]
            .into(),
            ..Default::default()
        });
        let script = backend.build_script(&spec());
        assert_eq!(
            script,
            r#"#!/bin/bash
#SBATCH --job-name=simulate
#SBATCH --output=/jobs/1/stdout.log
#SBATCH --error=/jobs/1/stderr.log
#SBATCH --nodes=2
#SBATCH --ntasks-per-node=1
#SBATCH --cpus-per-task=8
#SBATCH --mem=4096M
#SBATCH --time=02:30:00
#SBATCH --gres=gpu:1
#SBATCH --partition=gpu
#SBATCH --account=proj-42
#SBATCH --dependency=afterok:101,afterany:102:103
#SBATCH --qos=normal

module load gcc/12
export LANG=C
export OMP_NUM_THREADS=8
cd /scratch/sim
./simulate --steps 10
"#
        );
        assert_eq!(script, backend.build_script(&spec()));
    }

    #[test]
    fn test_parse_sbatch_output() {
        assert_eq!(
            parse_sbatch_output("Submitted batch job 4641914").unwrap(),
            "4641914"
        );
        assert!(parse_sbatch_output("sbatch: error: invalid partition").is_err());
    }

    #[test]
    fn test_granular_states() {
        assert_eq!(parse_slurm_state("PENDING"), SchedulerStatus::Pending);
        assert_eq!(parse_slurm_state("COMPLETING"), SchedulerStatus::Running);
        assert_eq!(parse_slurm_state("COMPLETED"), SchedulerStatus::Completed);
        assert_eq!(parse_slurm_state("CANCELLED"), SchedulerStatus::Cancelled);
        assert_eq!(parse_slurm_state("CANCELLED by 1000"), SchedulerStatus::Cancelled);
        assert_eq!(parse_slurm_state("TIMEOUT"), SchedulerStatus::TimedOut);
        assert_eq!(parse_slurm_state("NODE_FAIL"), SchedulerStatus::Failed);
        assert_eq!(parse_slurm_state("PREEMPTED"), SchedulerStatus::Failed);
        assert_eq!(parse_slurm_state("OUT_OF_MEMORY"), SchedulerStatus::Failed);
        assert_eq!(parse_slurm_state("WHATEVER"), SchedulerStatus::Unknown);
    }

    #[test]
    fn test_parse_scontrol() {
        let output = "JobId=4641914 JobName=simulate
   JobState=FAILED Reason=NonZeroExitCode Dependency=(null)
   Requeue=0 Restarts=0 BatchFlag=1 Reboot=0 ExitCode=3:0";
        assert_eq!(
            parse_scontrol_status(output).unwrap(),
            StatusReport::with_exit_code(SchedulerStatus::Failed, Some(3))
        );
        let output = "JobId=1 JobState=RUNNING ExitCode=0:0";
        assert_eq!(
            parse_scontrol_status(output).unwrap(),
            StatusReport::new(SchedulerStatus::Running)
        );
        assert!(parse_scontrol_status("JobId=1").is_err());
    }

    #[test]
    fn test_parse_sacct() {
        assert_eq!(
            parse_sacct_status("COMPLETED|0:0\n").unwrap(),
            StatusReport::with_exit_code(SchedulerStatus::Completed, Some(0))
        );
        assert_eq!(
            parse_sacct_status("CANCELLED by 1000|0:15").unwrap(),
            StatusReport::with_exit_code(SchedulerStatus::Cancelled, Some(143))
        );
        assert!(parse_sacct_status("").is_err());
    }
}
