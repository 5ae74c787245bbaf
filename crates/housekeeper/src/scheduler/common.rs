use std::fmt::Write;
use std::path::Path;
use std::process::Output;

use anyhow::Context;
use bstr::ByteSlice;
use tokio::process::Command;

use crate::common::config::ScriptConfig;
use crate::job::DependencyKind;
use crate::scheduler::{DependencyMap, ScriptSpec, SchedulerResult};

pub fn create_command(arguments: Vec<&str>, workdir: &Path) -> Command {
    let mut command = Command::new(arguments[0]);
    command.args(&arguments[1..]);
    command.current_dir(workdir);
    command.kill_on_drop(true);
    command
}

pub fn check_command_output(output: Output) -> SchedulerResult<Output> {
    let status = output.status;
    if !status.success() {
        return Err(anyhow::anyhow!(
            "Exit code: {}\nStderr: {}\nStdout: {}",
            status.code().unwrap_or(-1),
            output.stderr.to_str_lossy().trim(),
            output.stdout.to_str_lossy().trim()
        ));
    }
    Ok(output)
}

/// Runs a scheduler program and returns its raw output, successful or not.
pub async fn run_command(arguments: Vec<&str>, workdir: &Path) -> SchedulerResult<Output> {
    let program = arguments[0];
    log::debug!("Running command `{}`", arguments.join(" "));
    create_command(arguments.clone(), workdir)
        .output()
        .await
        .with_context(|| format!("{program} start failed"))
}

/// Runs a scheduler program and returns its standard output if it succeeded.
pub async fn run_checked_command(arguments: Vec<&str>, workdir: &Path) -> SchedulerResult<String> {
    let program = arguments[0];
    let output = run_command(arguments, workdir).await?;
    let output =
        check_command_output(output).with_context(|| format!("{program} execution failed"))?;
    let stdout = output
        .stdout
        .to_str()
        .map_err(|e| anyhow::anyhow!("Invalid UTF-8 {} output: {:?}", program, e))?;
    Ok(stdout.trim().to_string())
}

/// Checks whether a failed cancel/status command reports that the job no longer exists.
pub fn reports_missing_job(output: &Output) -> bool {
    let stderr = output.stderr.to_str_lossy().to_lowercase();
    [
        "invalid job id",
        "unknown job id",
        "already completed",
        "job has finished",
        "job has already finished",
    ]
    .iter()
    .any(|message| stderr.contains(message))
}

/// Directive value used by both PBS and SLURM, e.g. `afterok:12:13,afterany:14`.
pub fn format_dependencies(dependencies: &DependencyMap, separator: char) -> Option<String> {
    let parts: Vec<String> = dependencies
        .iter()
        .filter(|(_, handles)| !handles.is_empty())
        .map(|(kind, handles)| {
            let keyword = match kind {
                DependencyKind::AfterSuccess => "afterok",
                DependencyKind::AfterFailure => "afternotok",
                DependencyKind::AfterAny => "afterany",
            };
            let mut part = keyword.to_string();
            for handle in handles {
                part.push(separator);
                part.push_str(handle);
            }
            part
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(","))
    }
}

/// Quotes a value for the POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Appends site directives and the executable part shared by all scheduler families:
/// module loads, exported variables, change of the directory and the command itself.
pub fn write_script_body(
    script: &mut String,
    directive_prefix: &str,
    config: &ScriptConfig,
    spec: &ScriptSpec,
) {
    for directive in &config.directives {
        let _ = writeln!(script, "{directive_prefix} {directive}");
    }
    script.push('\n');

    for module in &config.modules {
        let _ = writeln!(script, "module load {module}");
    }

    let mut env = config.env.clone();
    env.extend(spec.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    for (key, value) in &env {
        let _ = writeln!(script, "export {key}={}", shell_quote(value));
    }

    let _ = writeln!(
        script,
        "cd {}",
        shell_quote(&spec.workdir.display().to_string())
    );
    let _ = writeln!(script, "{}", spec.command);
}
