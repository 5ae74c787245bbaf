use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::manager::info::SchedulerKind;
use crate::job::Environment;

pub const DEFAULT_WORKDIR: &str = "housekeeper_jobs";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Upper bound for a single submit/status/cancel invocation of the scheduler.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
/// Inconclusive status polls tolerated before a job is declared `unknown`.
pub const DEFAULT_MAX_STATUS_ERRORS: u32 = 10;

pub const DEFAULT_WHITELIST_THRESHOLD: usize = 3;
pub const DEFAULT_MAX_SCANNED_LINES: usize = 10_000;
pub const DEFAULT_MAX_KEPT_LINES: usize = 50;
pub const DEFAULT_MAX_LINE_LENGTH: usize = 500;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Root directory for per-job directories and the job journal.
    pub workdir: PathBuf,
    /// Scheduler family. Detected from `PATH` when not set.
    pub scheduler: Option<SchedulerKind>,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    pub max_status_errors: u32,
    pub logs: LogConfig,
    pub script: ScriptConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from(DEFAULT_WORKDIR),
            scheduler: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            max_status_errors: DEFAULT_MAX_STATUS_ERRORS,
            logs: LogConfig::default(),
            script: ScriptConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Additional error patterns (regular expressions), appended to the built-in ones.
    pub patterns: Vec<String>,
    /// Phrases of benign messages that should not be reported as errors.
    pub whitelist: Vec<String>,
    pub whitelist_threshold: usize,
    pub max_lines: usize,
    pub max_kept_lines: usize,
    pub max_line_length: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            whitelist: Vec::new(),
            whitelist_threshold: DEFAULT_WHITELIST_THRESHOLD,
            max_lines: DEFAULT_MAX_SCANNED_LINES,
            max_kept_lines: DEFAULT_MAX_KEPT_LINES,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PbsResourceStyle {
    /// `-l select=N:ncpus=C:mem=M` (PBS Pro, OpenPBS)
    #[default]
    Select,
    /// `-l nodes=N:ppn=C` (Torque)
    Nodes,
}

/// Site specific additions to every generated batch script.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScriptConfig {
    /// Raw scheduler directives, e.g. `--qos=normal` or `-l place=scatter`.
    pub directives: Vec<String>,
    /// Environment modules loaded before the command.
    pub modules: Vec<String>,
    /// Variables exported for every job. Job variables take precedence.
    pub env: Environment,
    pub pbs_resource_style: PbsResourceStyle,
}

impl EngineConfig {
    /// Loads the configuration from a TOML file (or defaults when no file is given)
    /// and applies environment overrides.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                Self::parse(&content)?
            }
            None => Self::default(),
        };
        Ok(config.with_env_overrides())
    }

    pub fn parse(content: &str) -> crate::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn with_env_overrides(mut self) -> Self {
        if let Some(interval) = get_duration_from_env("HK_POLL_INTERVAL_MS") {
            self.poll_interval = interval;
        }
        if let Some(timeout) = get_duration_from_env("HK_COMMAND_TIMEOUT_MS") {
            self.command_timeout = timeout;
        }
        self
    }

    pub fn journal_path(&self) -> PathBuf {
        self.workdir.join("housekeeper.journal")
    }
}

fn get_duration_from_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::{EngineConfig, PbsResourceStyle};
    use crate::common::manager::info::SchedulerKind;
    use std::time::Duration;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = EngineConfig::parse("").unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.command_timeout, Duration::from_secs(5));
        assert_eq!(config.logs.whitelist_threshold, 3);
        assert_eq!(config.logs.max_lines, 10_000);
        assert_eq!(config.scheduler, None);
    }

    #[test]
    fn test_parse_config() {
        let config = EngineConfig::parse(
            r#"
workdir = "/scratch/jobs"
scheduler = "slurm"
poll_interval = "1m"
command_timeout = "10s"

[logs]
whitelist = ["Leap second table TAI_UTC seems out-of-date"]
whitelist_threshold = 4

[script]
modules = ["gcc/12", "openmpi"]
directives = ["--qos=long"]
pbs_resource_style = "nodes"

[script.env]
OMP_NUM_THREADS = "4"
"#,
        )
        .unwrap();
        assert_eq!(config.workdir.to_str(), Some("/scratch/jobs"));
        assert_eq!(config.scheduler, Some(SchedulerKind::Slurm));
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.command_timeout, Duration::from_secs(10));
        assert_eq!(config.logs.whitelist.len(), 1);
        assert_eq!(config.logs.whitelist_threshold, 4);
        assert_eq!(config.logs.max_kept_lines, 50);
        assert_eq!(config.script.modules, vec!["gcc/12", "openmpi"]);
        assert_eq!(config.script.pbs_resource_style, PbsResourceStyle::Nodes);
        assert_eq!(config.script.env.get("OMP_NUM_THREADS").unwrap(), "4");
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        assert!(EngineConfig::parse("pol_interval = \"1s\"").is_err());
    }
}
