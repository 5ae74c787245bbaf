use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use bstr::ByteSlice;
use regex::Regex;

use crate::common::config::LogConfig;
use crate::common::utils::str::pluralize;
use crate::job::{Failure, FailureKind, JobState};
use crate::tracking::logs::LogClassifier;

/// Maximum number of log lines stored as evidence of a `log_error` verdict.
pub const MAX_EVIDENCE_LINES: usize = 20;
/// Maximum number of missing patterns listed in a `missing_file` reason.
pub const MAX_LISTED_MISSING_FILES: usize = 5;
/// Number of trailing stderr lines searched for an exit code report.
const EXIT_CODE_SEARCH_LINES: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failed(Failure),
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        matches!(self, Verdict::Success)
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Verdict::Success => None,
            Verdict::Failed(failure) => Some(failure),
        }
    }
}

pub const CANCELLED_REASON: &str = "job was cancelled";

/// Job state recorded after classification of a job that the scheduler reported as `reported`.
pub fn final_state(reported: JobState, verdict: &Verdict) -> JobState {
    match (reported, verdict) {
        (JobState::Cancelled, _) => JobState::Cancelled,
        (JobState::TimedOut, _) => JobState::TimedOut,
        (_, Verdict::Success) => JobState::Completed,
        (_, Verdict::Failed(_)) => JobState::Failed,
    }
}

/// Answers whether an expected output file (or glob pattern) is present.
pub trait FileProbe {
    fn exists(&self, pattern: &str) -> bool;
}

impl<F: Fn(&str) -> bool> FileProbe for F {
    fn exists(&self, pattern: &str) -> bool {
        self(pattern)
    }
}

/// Resolves expected files relative to a job working directory.
/// Patterns containing `*`, `?` or `[` are matched as globs.
pub struct FsProbe {
    base: PathBuf,
}

impl FsProbe {
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
        }
    }
}

impl FileProbe for FsProbe {
    fn exists(&self, pattern: &str) -> bool {
        if pattern.contains(['*', '?', '[']) {
            let full_pattern = if Path::new(pattern).is_absolute() {
                pattern.to_string()
            } else {
                let base = glob::Pattern::escape(&self.base.to_string_lossy());
                format!("{}/{pattern}", base.trim_end_matches('/'))
            };
            match glob::glob(&full_pattern) {
                Ok(mut paths) => paths.any(|entry| entry.is_ok()),
                Err(error) => {
                    log::warn!("Invalid expected file pattern `{pattern}`: {error}");
                    false
                }
            }
        } else {
            self.base.join(pattern).exists()
        }
    }
}

/// Everything known about a job when the scheduler reports it as finished.
pub struct Observed<'a> {
    /// Terminal state reported by the scheduler.
    pub reported: JobState,
    pub exit_code: Option<i32>,
    /// Contents of the available log streams.
    pub logs: &'a [String],
    pub expected_files: &'a [String],
}

/// Combines the scheduler status, exit code, log content and expected files into one verdict.
/// Sources are consulted in that order and the first one that indicates a failure wins.
pub struct FailureClassifier {
    logs: LogClassifier,
}

impl FailureClassifier {
    pub fn new(config: &LogConfig) -> anyhow::Result<Self> {
        Ok(Self {
            logs: LogClassifier::new(config)?,
        })
    }

    pub fn classify(&self, observed: &Observed, probe: &dyn FileProbe) -> Verdict {
        match observed.reported {
            JobState::Cancelled => {
                return failed(FailureKind::Scheduler, CANCELLED_REASON.to_string());
            }
            JobState::Failed => {
                let mut reason = "scheduler reported failure".to_string();
                if let Some(code) = observed.exit_code.filter(|code| *code != 0) {
                    reason.push_str(&format!(" (exit code {code})"));
                }
                return failed(FailureKind::Scheduler, reason);
            }
            JobState::TimedOut => {
                return failed(FailureKind::Timeout, "job exceeded walltime".to_string());
            }
            _ => {}
        }

        if let Some(code) = observed.exit_code.filter(|code| *code != 0) {
            return failed(FailureKind::ExitCode, format!("exit code {code}"));
        }

        let scan = self.logs.scan(observed.logs.iter().map(|s| s.as_str()));
        if scan.has_errors() {
            let count = scan.error_count();
            let mut evidence = scan.error_lines;
            evidence.truncate(MAX_EVIDENCE_LINES);
            return Verdict::Failed(
                Failure::new(
                    FailureKind::LogError,
                    format!("found {count} {} in logs", pluralize("error", count)),
                )
                .with_evidence(evidence),
            );
        }

        let missing: Vec<&str> = observed
            .expected_files
            .iter()
            .map(|p| p.as_str())
            .filter(|pattern| !probe.exists(pattern))
            .collect();
        if !missing.is_empty() {
            return failed(FailureKind::MissingFile, missing_files_reason(&missing));
        }

        Verdict::Success
    }
}

fn failed(kind: FailureKind, reason: String) -> Verdict {
    Verdict::Failed(Failure::new(kind, reason))
}

fn missing_files_reason(missing: &[&str]) -> String {
    let mut reason = format!(
        "missing output files: {}",
        missing
            .iter()
            .take(MAX_LISTED_MISSING_FILES)
            .copied()
            .collect::<Vec<_>>()
            .join(", ")
    );
    if missing.len() > MAX_LISTED_MISSING_FILES {
        reason.push_str(&format!(
            " and {} more",
            missing.len() - MAX_LISTED_MISSING_FILES
        ));
    }
    reason
}

/// Reads a log file, replacing invalid UTF-8. Returns `None` if the file cannot be read.
pub fn read_log(path: &Path) -> Option<String> {
    match std::fs::read(path) {
        Ok(content) => Some(content.to_str_lossy().into_owned()),
        Err(error) => {
            log::debug!("Cannot read log {}: {error}", path.display());
            None
        }
    }
}

static EXIT_CODE_PATTERNS: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r"(?i)exit(?:ed)?\s+(?:with\s+)?code\s+(-?\d+)").unwrap(),
        Regex::new(r"(?i)exit\s+status:?\s+(-?\d+)").unwrap(),
    ]
});

/// Looks for an exit code report (`exit code 3`, `exited with code 3`, `exit status: 3`)
/// in the trailing lines of a stderr log. The first report within that window wins.
pub fn extract_exit_code(stderr: &str) -> Option<i32> {
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(EXIT_CODE_SEARCH_LINES);
    lines[start..].iter().find_map(|line| {
        EXIT_CODE_PATTERNS.iter().find_map(|pattern| {
            pattern
                .captures(line)
                .and_then(|captures| captures.get(1))
                .and_then(|code| code.as_str().parse().ok())
        })
    })
}
