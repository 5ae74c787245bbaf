use std::fmt::Display;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use cli_table::format::{Justify, Separator};
use cli_table::{Cell, CellStruct, Color, ColorChoice, Style, Table, TableStruct, print_stdout};
use colored::Color as Colorization;
use colored::Colorize;
use humantime::format_duration;

use crate::JobId;
use crate::client::output::outputs::Output;
use crate::common::utils::str::pluralize;
use crate::engine::monitor::WaitOutcome;
use crate::job::{Job, JobState, ResourceRequest};

pub const JOB_COLOR_COMPLETED: Colorization = Colorization::Green;
pub const JOB_COLOR_FAILED: Colorization = Colorization::Red;
pub const JOB_COLOR_CANCELLED: Colorization = Colorization::Magenta;
pub const JOB_COLOR_WAITING: Colorization = Colorization::Cyan;

pub struct CliOutput {
    color_policy: ColorChoice,
}

impl CliOutput {
    pub fn new(color_policy: ColorChoice) -> CliOutput {
        CliOutput { color_policy }
    }

    fn print_vertical_table(&self, rows: Vec<Vec<CellStruct>>) {
        let table = rows.table().separator(
            Separator::builder()
                .column(Some(Default::default()))
                .build(),
        );
        self.print_table(table);
    }

    fn print_horizontal_table(&self, rows: Vec<Vec<CellStruct>>, header: Vec<CellStruct>) {
        let table = rows
            .table()
            .separator(
                Separator::builder()
                    .title(Some(Default::default()))
                    .column(Some(Default::default()))
                    .build(),
            )
            .title(header);
        self.print_table(table);
    }

    fn print_table(&self, table: TableStruct) {
        let table = table.color_choice(self.color_policy);
        if let Err(e) = print_stdout(table) {
            log::error!("Cannot print table to stdout: {e:?}");
        }
    }
}

impl Output for CliOutput {
    fn print_job_submitted(&self, job: &Job) {
        match &job.scheduler_handle {
            Some(handle) => println!(
                "Job submitted {}, job ID: {}, scheduler ID: {handle}",
                "successfully".green(),
                job.id
            ),
            None if job.state == JobState::Pending => println!(
                "Job registered, job ID: {}, waiting for its dependencies",
                job.id
            ),
            None => {
                let reason = job
                    .failure
                    .as_ref()
                    .map(|failure| failure.reason.as_str())
                    .unwrap_or_default();
                println!(
                    "Job {} was {}: {reason}",
                    job.id,
                    "not submitted".color(JOB_COLOR_FAILED)
                );
            }
        }
    }

    fn print_job_list(&self, jobs: &[Job]) {
        if jobs.is_empty() {
            println!("There are no jobs");
            return;
        }
        let rows: Vec<_> = jobs
            .iter()
            .map(|job| {
                vec![
                    job.id.cell().justify(Justify::Right),
                    job.name.clone().cell(),
                    state_cell(job.state),
                    format!("{}/{}", job.attempt, job.max_retries + 1).cell(),
                    job.scheduler_handle.clone().unwrap_or_default().cell(),
                    job.failure
                        .as_ref()
                        .map(|failure| failure.reason.clone())
                        .unwrap_or_default()
                        .cell(),
                ]
            })
            .collect();
        let header = vec![
            "ID".cell().bold(true),
            "Name".cell().bold(true),
            "State".cell().bold(true),
            "Attempt".cell().bold(true),
            "Scheduler ID".cell().bold(true),
            "Reason".cell().bold(true),
        ];
        self.print_horizontal_table(rows, header);
    }

    fn print_job_detail(&self, job: &Job) {
        let mut rows = vec![
            vec!["ID".cell().bold(true), job.id.cell()],
            vec!["Name".cell().bold(true), job.name.clone().cell()],
            vec!["State".cell().bold(true), state_cell(job.state)],
            vec![
                "Attempt".cell().bold(true),
                format!("{} of {}", job.attempt, job.max_retries + 1).cell(),
            ],
            vec![
                "Retry of".cell().bold(true),
                optional(job.parent.as_ref()).cell(),
            ],
            vec![
                "Scheduler ID".cell().bold(true),
                optional(job.scheduler_handle.as_ref()).cell(),
            ],
            vec!["Command".cell().bold(true), job.command.clone().cell()],
            vec![
                "Resources".cell().bold(true),
                format_resources(&job.resources).cell(),
            ],
        ];

        let dependencies: Vec<String> = job
            .dependencies
            .edges()
            .map(|(kind, id)| format!("{kind}:{id}"))
            .collect();
        rows.push(vec![
            "Dependencies".cell().bold(true),
            dependencies.join("\n").cell(),
        ]);
        rows.push(vec![
            "Expected files".cell().bold(true),
            job.expected_files.join("\n").cell(),
        ]);
        rows.push(vec![
            "Environment".cell().bold(true),
            job.env
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join("\n")
                .cell(),
        ]);
        rows.push(vec![
            "Working directory".cell().bold(true),
            job.workdir.display().cell(),
        ]);
        rows.push(vec![
            "Job directory".cell().bold(true),
            job.job_dir.display().cell(),
        ]);
        for (name, path) in [
            ("Script", &job.script_path),
            ("Stdout", &job.stdout_path),
            ("Stderr", &job.stderr_path),
        ] {
            rows.push(vec![
                name.cell().bold(true),
                path.as_ref()
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|| "N/A".to_string())
                    .cell(),
            ]);
        }
        rows.push(vec![
            "Exit code".cell().bold(true),
            optional(job.exit_code.as_ref()).cell(),
        ]);
        if let Some(failure) = &job.failure {
            rows.push(vec![
                "Failure".cell().bold(true),
                format!("{}: {}", failure.kind, failure.reason)
                    .cell()
                    .foreground_color(Some(Color::Red)),
            ]);
        }
        rows.push(vec![
            "Created".cell().bold(true),
            format_time(job.created_at).cell(),
        ]);
        for (name, time) in [
            ("Submitted", job.submitted_at),
            ("Started", job.started_at),
            ("Completed", job.completed_at),
        ] {
            rows.push(vec![
                name.cell().bold(true),
                time.map(|time| format_time(time).to_string())
                    .unwrap_or_else(|| "N/A".to_string())
                    .cell(),
            ]);
        }
        self.print_vertical_table(rows);
    }

    fn print_job_failure(&self, job: &Job) {
        let Some(failure) = &job.failure else {
            println!("Job {} has no recorded failure (state: {})", job.id, job.state);
            return;
        };
        let mut rows = vec![
            vec!["Job".cell().bold(true), job.id.cell()],
            vec!["State".cell().bold(true), state_cell(job.state)],
            vec!["Kind".cell().bold(true), failure.kind.cell()],
            vec![
                "Reason".cell().bold(true),
                failure
                    .reason
                    .clone()
                    .cell()
                    .foreground_color(Some(Color::Red)),
            ],
        ];
        if !failure.evidence.is_empty() {
            rows.push(vec![
                "Evidence".cell().bold(true),
                failure.evidence.join("\n").cell(),
            ]);
        }
        self.print_vertical_table(rows);
    }

    fn print_job_wait(&self, duration: Duration, outcomes: &[WaitOutcome]) {
        let count = |state: JobState| {
            outcomes
                .iter()
                .filter(|outcome| outcome.finished && outcome.state == state)
                .count()
        };
        let unfinished = outcomes.iter().filter(|outcome| !outcome.finished).count();
        let mut summary = vec![format!(
            "{} {}",
            count(JobState::Completed),
            "COMPLETED".color(JOB_COLOR_COMPLETED)
        )];
        for (state, color) in [
            (JobState::Failed, JOB_COLOR_FAILED),
            (JobState::TimedOut, JOB_COLOR_FAILED),
            (JobState::Unknown, JOB_COLOR_FAILED),
            (JobState::Cancelled, JOB_COLOR_CANCELLED),
        ] {
            let count = count(state);
            if count > 0 {
                summary.push(format!(
                    "{count} {}",
                    state.as_str().to_uppercase().color(color)
                ));
            }
        }
        if unfinished > 0 {
            summary.push(format!(
                "{unfinished} {}",
                "UNFINISHED".color(JOB_COLOR_WAITING)
            ));
        }
        println!(
            "Wait finished in {}: {}",
            format_duration(Duration::from_millis(duration.as_millis() as u64)),
            summary.join(", ")
        );
        for outcome in outcomes {
            if outcome.job != outcome.requested {
                println!(
                    "Job {} was retried, job {} ended as {}",
                    outcome.requested, outcome.job, outcome.state
                );
            }
        }
    }

    fn print_jobs_cancelled(&self, cancelled: &[JobId], finished: &[JobId]) {
        if !cancelled.is_empty() {
            println!(
                "{} {}: {}",
                pluralize("Job", cancelled.len()),
                "cancelled".color(JOB_COLOR_CANCELLED),
                format_ids(cancelled)
            );
        }
        if !finished.is_empty() {
            println!(
                "Already finished {}: {}",
                pluralize("job", finished.len()),
                format_ids(finished)
            );
        }
        if cancelled.is_empty() && finished.is_empty() {
            println!("There was nothing to cancel");
        }
    }

    fn print_job_retried(&self, original: JobId, retry: &Job) {
        println!(
            "Job {original} retried as job {} (attempt {}), state: {}",
            retry.id, retry.attempt, retry.state
        );
    }

    fn print_job_removed(&self, id: JobId) {
        println!("Job {id} removed");
    }

    fn print_error(&self, error: anyhow::Error) {
        eprintln!("{error:?}");
    }
}

fn state_cell(state: JobState) -> CellStruct {
    let color = match state {
        JobState::Completed => Color::Green,
        JobState::Failed | JobState::TimedOut | JobState::Unknown => Color::Red,
        JobState::Cancelled => Color::Magenta,
        JobState::Running => Color::Yellow,
        JobState::Pending | JobState::Queued => Color::Cyan,
    };
    state.as_str().to_uppercase().cell().foreground_color(Some(color))
}

fn optional<T: ToString>(value: Option<&T>) -> String {
    value
        .map(|value| value.to_string())
        .unwrap_or_else(|| "N/A".to_string())
}

fn format_ids(ids: &[JobId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_resources(resources: &ResourceRequest) -> String {
    let mut result = format!(
        "{} {}, {} {} per node, {} MiB, walltime {}",
        resources.nodes,
        pluralize("node", resources.nodes as usize),
        resources.cpus,
        pluralize("cpu", resources.cpus as usize),
        resources.memory_mib,
        format_duration(resources.walltime)
    );
    if resources.gpus > 0 {
        result.push_str(&format!(", {} {}", resources.gpus, pluralize("gpu", resources.gpus as usize)));
    }
    if let Some(queue) = &resources.queue {
        result.push_str(&format!(", queue {queue}"));
    }
    if let Some(account) = &resources.account {
        result.push_str(&format!(", account {account}"));
    }
    result
}

fn format_time(time: DateTime<Utc>) -> impl Display {
    let datetime: DateTime<Local> = time.into();
    datetime.format("%d.%m.%Y %H:%M:%S")
}
