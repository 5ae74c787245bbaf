use std::time::Duration;

use crate::common::manager::common::format_duration;

/// Exit status that PBS assigns to jobs killed for exceeding their wall-time.
pub const PBS_EXIT_WALLTIME_EXCEEDED: i64 = -29;

/// Format a duration as a PBS time string, e.g. 01:05:02
pub fn format_pbs_duration(duration: &Duration) -> String {
    format_duration(duration)
}
