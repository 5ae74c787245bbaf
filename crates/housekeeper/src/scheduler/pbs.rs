use std::fmt::Write;
use std::path::Path;

use anyhow::Context;
use bstr::ByteSlice;

use crate::common::config::{PbsResourceStyle, ScriptConfig};
use crate::common::manager::pbs::{PBS_EXIT_WALLTIME_EXCEEDED, format_pbs_duration};
use crate::scheduler::common::{
    check_command_output, format_dependencies, reports_missing_job, run_checked_command,
    run_command, write_script_body,
};
use crate::scheduler::{
    SchedulerBackend, SchedulerFuture, SchedulerResult, SchedulerStatus, ScriptSpec, StatusReport,
};

pub struct PbsBackend {
    config: ScriptConfig,
}

impl PbsBackend {
    pub fn new(config: ScriptConfig) -> Self {
        Self { config }
    }
}

impl SchedulerBackend for PbsBackend {
    fn build_script(&self, spec: &ScriptSpec) -> String {
        build_pbs_submit_script(&self.config, spec)
    }

    fn submit(&self, script_path: &Path, workdir: &Path) -> SchedulerFuture<String> {
        let script_path = script_path.to_path_buf();
        let workdir = workdir.to_path_buf();

        Box::pin(async move {
            let script = script_path.display().to_string();
            let output = run_checked_command(vec!["qsub", &script], &workdir).await?;
            log::debug!("Qsub output: {output}");
            match output.lines().map(|l| l.trim()).find(|l| !l.is_empty()) {
                Some(job_id) => Ok(job_id.to_string()),
                None => anyhow::bail!("Missing job id in qsub output"),
            }
        })
    }

    fn poll_status(&self, handle: &str) -> SchedulerFuture<StatusReport> {
        let handle = handle.to_string();

        Box::pin(async move {
            // -x will also display finished jobs
            let arguments = vec!["qstat", "-f", &handle, "-F", "json", "-x"];
            let output = run_command(arguments, &std::env::temp_dir()).await?;
            let output = check_command_output(output).context("qstat execution failed")?;

            log::trace!(
                "PBS qstat output\nStdout\n{}Stderr\n{}",
                output.stdout.to_str_lossy(),
                output.stderr.to_str_lossy()
            );

            let data: serde_json::Value =
                serde_json::from_slice(&output.stdout).context("Cannot parse qstat JSON output")?;
            parse_qstat_status(&data, &handle)
        })
    }

    fn cancel(&self, handle: &str) -> SchedulerFuture<bool> {
        let handle = handle.to_string();

        Box::pin(async move {
            let output = run_command(vec!["qdel", &handle], &std::env::temp_dir()).await?;
            if output.status.success() {
                Ok(true)
            } else if reports_missing_job(&output) {
                Ok(false)
            } else {
                anyhow::bail!(
                    "qdel failed for job {handle}: {}",
                    output.stderr.to_str_lossy().trim()
                )
            }
        })
    }
}

fn parse_qstat_status(data: &serde_json::Value, handle: &str) -> SchedulerResult<StatusReport> {
    let job = &data["Jobs"][handle];
    if job.is_null() {
        anyhow::bail!("Job {handle} not found in qstat output");
    }
    let state = get_json_str(&job["job_state"], "job_state")?;
    let status = match state {
        "Q" | "H" | "W" | "T" | "S" | "M" | "U" => StatusReport::new(SchedulerStatus::Pending),
        "R" | "E" | "B" => StatusReport::new(SchedulerStatus::Running),
        "F" | "X" => match job["Exit_status"].as_i64() {
            // Deleted before it started
            None => StatusReport::new(SchedulerStatus::Cancelled),
            Some(0) => StatusReport::with_exit_code(SchedulerStatus::Completed, Some(0)),
            Some(PBS_EXIT_WALLTIME_EXCEEDED) => StatusReport::new(SchedulerStatus::TimedOut),
            Some(code) => {
                let code = i32::try_from(code).ok();
                StatusReport::with_exit_code(SchedulerStatus::Failed, code)
            }
        },
        _ => StatusReport::new(SchedulerStatus::Unknown),
    };
    Ok(status)
}

fn get_json_str<'a>(value: &'a serde_json::Value, context: &str) -> SchedulerResult<&'a str> {
    value
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("JSON key {} not found", context))
}

fn build_pbs_submit_script(config: &ScriptConfig, spec: &ScriptSpec) -> String {
    let resources = &spec.resources;
    let mut script = format!(
        r##"#!/bin/bash
#PBS -N {name}
#PBS -o {stdout}
#PBS -e {stderr}
"##,
        name = spec.name,
        stdout = spec.stdout.display(),
        stderr = spec.stderr.display(),
    );

    match config.pbs_resource_style {
        PbsResourceStyle::Select => {
            let _ = write!(
                script,
                "#PBS -l select={}:ncpus={}:mem={}mb",
                resources.nodes, resources.cpus, resources.memory_mib
            );
            if resources.gpus > 0 {
                let _ = write!(script, ":ngpus={}", resources.gpus);
            }
            script.push('\n');
        }
        PbsResourceStyle::Nodes => {
            let _ = write!(
                script,
                "#PBS -l nodes={}:ppn={}",
                resources.nodes, resources.cpus
            );
            if resources.gpus > 0 {
                let _ = write!(script, ":gpus={}", resources.gpus);
            }
            let _ = writeln!(script, "\n#PBS -l mem={}mb", resources.memory_mib);
        }
    }
    let _ = writeln!(
        script,
        "#PBS -l walltime={}",
        format_pbs_duration(&resources.walltime)
    );

    if let Some(queue) = &resources.queue {
        let _ = writeln!(script, "#PBS -q {queue}");
    }
    if let Some(account) = &resources.account {
        let _ = writeln!(script, "#PBS -A {account}");
    }
    if let Some(dependency) = format_dependencies(&spec.dependencies, ':') {
        let _ = writeln!(script, "#PBS -W depend={dependency}");
    }

    write_script_body(&mut script, "#PBS", config, spec);
    script
}
