use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Family of the external cluster scheduler that executes jobs.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    Pbs,
    Slurm,
}

impl SchedulerKind {
    /// Program used to submit a batch script.
    pub fn submit_program(&self) -> &'static str {
        match self {
            SchedulerKind::Pbs => "qsub",
            SchedulerKind::Slurm => "sbatch",
        }
    }
}

impl Display for SchedulerKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerKind::Pbs => f.write_str("PBS"),
            SchedulerKind::Slurm => f.write_str("SLURM"),
        }
    }
}

impl FromStr for SchedulerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pbs" => Ok(SchedulerKind::Pbs),
            "slurm" => Ok(SchedulerKind::Slurm),
            _ => anyhow::bail!("Unknown scheduler `{s}`, use `pbs` or `slurm`"),
        }
    }
}

/// Finds out which scheduler is available by looking for its submission program in `PATH`.
/// SLURM is preferred when both are present.
pub fn detect_scheduler() -> Option<SchedulerKind> {
    detect_scheduler_with(|program| which::which(program).is_ok())
}

fn detect_scheduler_with<F: Fn(&str) -> bool>(is_available: F) -> Option<SchedulerKind> {
    [SchedulerKind::Slurm, SchedulerKind::Pbs]
        .into_iter()
        .find(|kind| is_available(kind.submit_program()))
}
