use crate::Map;
use crate::common::manager::common::format_duration;
use std::time::Duration;

/// Format a duration as a SLURM time string, e.g. 01:05:02
pub fn format_slurm_duration(duration: &Duration) -> String {
    format_duration(duration)
}

/// Parse <key>=<value> pairs from the output of `scontrol show job <job-id>`.
pub fn get_scontrol_items(output: &str) -> Map<&str, &str> {
    let mut map = Map::new();
    for line in output.lines() {
        for item in line.trim().split(' ') {
            let iter: Vec<_> = item.splitn(2, '=').collect();
            if iter.len() < 2 {
                continue;
            }
            let (key, value) = (iter[0], iter[1]);
            map.insert(key, value);
        }
    }
    map
}

/// Parses a SLURM `ExitCode` value (`<exit-code>:<signal>`).
/// A job killed by a signal is reported as `128 + signal`.
pub fn parse_slurm_exit_code(value: &str) -> Option<i32> {
    let mut parts = value.trim().splitn(2, ':');
    let code: i32 = parts.next()?.parse().ok()?;
    let signal: i32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    if code == 0 && signal != 0 {
        Some(128 + signal)
    } else {
        Some(code)
    }
}
