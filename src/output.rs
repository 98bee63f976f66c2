use std::collections::BTreeSet;
use std::fmt::Display;

use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color as TableColor, ContentArrangement, Table};
use console::style;

use crate::cancellation::{CancellationOutcome, CancellationReport, Strategy};
use crate::domain::{Build, Pipeline, PipelineId, PipelineSchedule, Status};
use crate::schedules::{CreatePipelineResponse, ScheduleRunOutcome, SweepEntry};

// Styling helpers

fn bright_green(text: impl Display) -> console::StyledObject<String> {
    style(text.to_string()).bright().green()
}

fn bright_yellow(text: impl Display) -> console::StyledObject<String> {
    style(text.to_string()).bright().yellow()
}

fn bright_red(text: impl Display) -> console::StyledObject<String> {
    style(text.to_string()).bright().red()
}

fn cyan(text: impl Display) -> console::StyledObject<String> {
    style(text.to_string()).cyan()
}

fn dim(text: impl Display) -> console::StyledObject<String> {
    style(text.to_string()).dim()
}

fn bright(text: impl Display) -> console::StyledObject<String> {
    style(text.to_string()).bright()
}

fn magenta_bold(text: impl Display) -> console::StyledObject<String> {
    style(text.to_string()).magenta().bold()
}

// Banner

pub fn print_banner() {
    eprintln!(
        r"
{} {}
  {}
",
        magenta_bold("⏹ ci-autocancel"),
        dim(env!("CARGO_PKG_VERSION")),
        dim("Redundant pipeline cancellation")
    );
}

// Tables

fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn status_cell(status: Status) -> Cell {
    let cell = Cell::new(status.as_str());
    match status {
        Status::Success => cell.fg(TableColor::Green),
        Status::Failed => cell.fg(TableColor::Red),
        Status::Canceled | Status::Skipped => cell.fg(TableColor::DarkGrey),
        Status::Running | Status::Pending | Status::Preparing | Status::WaitingForResource => {
            cell.fg(TableColor::Cyan)
        }
        Status::Created | Status::Manual | Status::Scheduled => cell.fg(TableColor::Yellow),
    }
}

fn id_list(ids: &BTreeSet<PipelineId>) -> String {
    if ids.is_empty() {
        return "-".to_string();
    }
    ids.iter()
        .map(|id| format!("#{id}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn strategy_name(strategy: Option<Strategy>) -> &'static str {
    match strategy {
        Some(Strategy::Flat) => "flat",
        Some(Strategy::Hierarchy) => "hierarchy",
        None => "-",
    }
}

fn outcome_line(outcome: &CancellationOutcome) -> String {
    match outcome {
        CancellationOutcome::Completed => bright_green("completed ✓").to_string(),
        CancellationOutcome::Skipped { reason } => {
            bright_yellow(format!("skipped ({reason:?})")).to_string()
        }
        CancellationOutcome::Abandoned { attempts } => {
            bright_red(format!("abandoned after {attempts} attempt(s)")).to_string()
        }
    }
}

pub fn render_cancellation(report: &CancellationReport) -> String {
    let summary = &report.summary;
    let mut table = create_table();
    table.set_header(vec![Cell::new("Field"), Cell::new("Value")]);
    table.add_row(vec![Cell::new("Strategy"), Cell::new(strategy_name(report.strategy))]);
    table.add_row(vec![
        Cell::new("Canceled"),
        Cell::new(id_list(&summary.canceled)).fg(TableColor::Green),
    ]);
    table.add_row(vec![
        Cell::new("Not interruptible"),
        Cell::new(id_list(&summary.not_interruptible)).fg(TableColor::Yellow),
    ]);
    table.add_row(vec![
        Cell::new("Already finished"),
        Cell::new(id_list(&summary.already_resolved)),
    ]);
    table.add_row(vec![
        Cell::new("Batches"),
        Cell::new(format!("{} (largest {})", summary.batches, summary.largest_batch)),
    ]);
    table.add_row(vec![Cell::new("Attempts"), Cell::new(summary.attempts)]);

    format!(
        "{} {} {}\n  {}\n{table}",
        bright("⏹"),
        bright("Redundant pipelines for").underlined(),
        cyan(format!("#{}", report.pipeline_id)),
        outcome_line(&report.outcome),
    )
}

pub fn print_cancellation(report: &CancellationReport) {
    println!("{}", render_cancellation(report));
}

pub fn render_creation(response: &CreatePipelineResponse) -> String {
    let mut output = String::new();
    match &response.pipeline {
        Some(pipeline) if response.is_success() => output.push_str(&format!(
            "{} {} {}\n",
            bright_green("✓"),
            bright("Created pipeline"),
            cyan(format!("#{} ({} @ {})", pipeline.id, pipeline.ref_, pipeline.sha)),
        )),
        Some(pipeline) => output.push_str(&format!(
            "{} {} {}\n",
            bright_yellow("!"),
            bright("Persisted rejected pipeline"),
            cyan(format!("#{} ({})", pipeline.id, pipeline.status)),
        )),
        None => output.push_str(&format!("{} {}\n", bright_red("✗"), bright("No pipeline created"))),
    }
    if let Some(message) = &response.message {
        output.push_str(&format!("  {} {}\n", dim("Message:"), message));
    }
    if let Some(report) = &response.cancellation {
        output.push_str(&render_cancellation(report));
    }
    output
}

pub fn print_creation(response: &CreatePipelineResponse) {
    println!("{}", render_creation(response));
}

fn schedule_outcome_cells(outcome: &ScheduleRunOutcome) -> [Cell; 2] {
    match outcome {
        ScheduleRunOutcome::Skipped => [Cell::new("skipped").fg(TableColor::DarkGrey), Cell::new("")],
        ScheduleRunOutcome::NotDue { next_run_at } => [
            Cell::new("not due").fg(TableColor::DarkGrey),
            Cell::new(format!("next run {}", next_run_at.format("%Y-%m-%d %H:%M UTC"))),
        ],
        ScheduleRunOutcome::AlreadyClaimed => [
            Cell::new("already claimed").fg(TableColor::DarkGrey),
            Cell::new(""),
        ],
        ScheduleRunOutcome::Created { pipeline_id } => [
            Cell::new("created").fg(TableColor::Green),
            Cell::new(format!("pipeline #{pipeline_id}")),
        ],
        ScheduleRunOutcome::CreationFailed { message } => [
            Cell::new("creation failed").fg(TableColor::Yellow),
            Cell::new(message),
        ],
        ScheduleRunOutcome::Errored { message } => {
            [Cell::new("error").fg(TableColor::Red), Cell::new(message)]
        }
    }
}

pub fn render_schedule_runs(entries: &[SweepEntry]) -> String {
    if entries.is_empty() {
        return dim("No pipeline schedules were due").to_string();
    }

    let mut table = create_table();
    table.set_header(vec![
        Cell::new("Schedule"),
        Cell::new("Outcome"),
        Cell::new("Details"),
    ]);
    for entry in entries {
        let [outcome, details] = schedule_outcome_cells(&entry.outcome);
        table.add_row(vec![Cell::new(format!("#{}", entry.schedule_id)), outcome, details]);
    }
    table.to_string()
}

pub fn print_schedule_runs(entries: &[SweepEntry]) {
    println!("{}", render_schedule_runs(entries));
}

fn jobs_cell(builds: &[Build]) -> Cell {
    if builds.is_empty() {
        return Cell::new("-");
    }
    let finished = builds.iter().filter(|b| b.status.is_completed()).count();
    Cell::new(format!("{finished}/{} done", builds.len()))
}

pub fn render_pipelines(
    pipelines: &[(Pipeline, Vec<Build>)],
    schedules: &[PipelineSchedule],
) -> String {
    let mut table = create_table();
    table.set_header(vec![
        Cell::new("ID"),
        Cell::new("Ref"),
        Cell::new("SHA"),
        Cell::new("Source"),
        Cell::new("Status"),
        Cell::new("Jobs"),
        Cell::new("Parent"),
        Cell::new("Canceled by"),
        Cell::new("Created"),
    ]);
    for (pipeline, builds) in pipelines {
        let optional = |id: Option<PipelineId>| id.map_or_else(String::new, |id| format!("#{id}"));
        table.add_row(vec![
            Cell::new(format!("#{}", pipeline.id)),
            Cell::new(&pipeline.ref_),
            Cell::new(pipeline.sha.chars().take(8).collect::<String>()),
            Cell::new(pipeline.source),
            status_cell(pipeline.status),
            jobs_cell(builds),
            Cell::new(optional(pipeline.parent_id)),
            Cell::new(optional(pipeline.auto_canceled_by_id)),
            Cell::new(pipeline.created_at.format("%Y-%m-%d %H:%M")),
        ]);
    }

    let mut output = format!("{} {}\n{table}", bright("📋"), bright("Pipelines").underlined());

    if !schedules.is_empty() {
        let mut table = create_table();
        table.set_header(vec![
            Cell::new("Schedule"),
            Cell::new("Ref"),
            Cell::new("Cron"),
            Cell::new("Active"),
            Cell::new("Next run"),
            Cell::new("Last pipeline"),
        ]);
        for schedule in schedules {
            table.add_row(vec![
                Cell::new(format!("#{}", schedule.id)),
                Cell::new(&schedule.ref_),
                Cell::new(&schedule.cron),
                Cell::new(if schedule.active { "yes" } else { "no" }),
                Cell::new(schedule.next_run_at.format("%Y-%m-%d %H:%M UTC")),
                Cell::new(
                    schedule
                        .last_pipeline_id
                        .map_or_else(String::new, |id| format!("#{id}")),
                ),
            ]);
        }
        output.push_str(&format!(
            "\n{} {}\n{table}",
            bright("⏰"),
            bright("Schedules").underlined()
        ));
    }

    output
}

pub fn print_pipelines(pipelines: &[(Pipeline, Vec<Build>)], schedules: &[PipelineSchedule]) {
    println!("{}", render_pipelines(pipelines, schedules));
}
