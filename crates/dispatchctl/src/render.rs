//! Output rendering for the dispatchctl CLI.

use chrono::{DateTime, TimeZone, Utc};
use dispatch_core::{AppProfile, ExecutionLogEntry, LogStatus, RunResult, UiEvent};

/// Print a run result: output verbatim, then a status line on failure.
pub fn print_run_result(result: &RunResult) {
    print!("{}", result.output);
    if !result.output.is_empty() && !result.output.ends_with('\n') {
        println!();
    }
    if let Some(ref error) = result.error {
        eprintln!("{}: {}", result.status.as_str(), error);
    }
}

/// Print one UI event the way a live console would show it.
pub fn print_event(event: &UiEvent, show_ids: bool) {
    let prefix = if show_ids {
        format!("[{}] ", event.execution_id().short())
    } else {
        String::new()
    };
    match event {
        UiEvent::ExecutionStarted { subcommand, .. } => {
            println!("{prefix}started: modal {subcommand}");
        }
        UiEvent::OutputLine { line, .. } => println!("{prefix}{line}"),
        UiEvent::ExecutionCompleted { result, .. } => match &result.error {
            Some(error) => println!("{prefix}{}: {}", result.status.as_str(), error),
            None => println!("{prefix}{}", result.status.as_str()),
        },
    }
}

/// Print a list of execution logs in tabular format.
pub fn print_log_list(logs: &[ExecutionLogEntry]) {
    if logs.is_empty() {
        println!("No execution logs found.");
        return;
    }

    println!(
        "{:<36}  {:<16}  {:<20}  {:<7}  {:<8}  {:<19}  {:>8}",
        "ID", "PROJECT", "SCRIPT", "COMMAND", "STATUS", "STARTED", "DURATION"
    );
    println!("{}", "-".repeat(126));

    for log in logs {
        println!(
            "{:<36}  {:<16}  {:<20}  {:<7}  {:<8}  {:<19}  {:>8}",
            log.id.0,
            truncate(&log.project_name, 16),
            truncate(&log.script_name, 20),
            log.command,
            format_log_status(log.status),
            format_unix(log.start_time),
            format_duration(log),
        );
    }

    println!();
    println!("{} log(s)", logs.len());
}

/// Print one execution log with its output.
pub fn print_log_details(log: &ExecutionLogEntry) {
    println!("Log: {}", log.id);
    println!();
    println!("  Project:   {} ({})", log.project_name, log.project_id);
    println!("  Script:    {}", log.script_name);
    println!("  Path:      {}", log.script_path);
    println!("  Command:   {}", log.command);
    println!("  Status:    {}", format_log_status(log.status));
    println!("  Started:   {}", format_unix(log.start_time));
    if log.end_time > 0 {
        println!("  Finished:  {}", format_unix(log.end_time));
        println!("  Duration:  {}", format_duration(log));
    }
    if !log.variables.is_empty() {
        println!();
        println!("  Variables:");
        for (key, value) in &log.variables {
            println!("    {key} = {value}");
        }
    }

    println!();
    println!("  Output:");
    for line in log.output.lines() {
        println!("    {line}");
    }
}

/// Print a list of app profiles in tabular format.
pub fn print_app_list(apps: &[AppProfile]) {
    if apps.is_empty() {
        println!("No apps found.");
        return;
    }

    println!(
        "{:<36}  {:<20}  {:<20}  {:<10}  {:<12}",
        "ID", "NAME", "APP", "SUFFIX", "TOKEN"
    );
    println!("{}", "-".repeat(106));

    for app in apps {
        println!(
            "{:<36}  {:<20}  {:<20}  {:<10}  {:<12}",
            app.id.0,
            truncate(&app.name, 20),
            truncate(&app.app_name, 20),
            app.suffix,
            app.credentials().redacted_id(),
        );
    }

    println!();
    println!("{} app(s)", apps.len());
}

fn format_log_status(status: LogStatus) -> &'static str {
    match status {
        LogStatus::Running => "RUNNING",
        LogStatus::Success => "SUCCESS",
        LogStatus::Failed => "FAILED",
    }
}

fn format_unix(secs: i64) -> String {
    Utc.timestamp_opt(secs, 0)
        .single()
        .map(|dt: DateTime<Utc>| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn format_duration(log: &ExecutionLogEntry) -> String {
    if log.end_time == 0 {
        return "-".to_string();
    }
    let secs = (log.end_time - log.start_time).max(0);
    if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{kept}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::Id;
    use std::collections::BTreeMap;

    fn entry(start: i64, end: i64) -> ExecutionLogEntry {
        ExecutionLogEntry {
            id: Id::new(),
            project_id: "p1".to_string(),
            project_name: "Demo".to_string(),
            script_name: "app.py".to_string(),
            script_path: "app.py".to_string(),
            script_content: String::new(),
            command: "deploy".to_string(),
            variables: BTreeMap::new(),
            start_time: start,
            end_time: end,
            status: LogStatus::Success,
            output: String::new(),
        }
    }

    #[test]
    fn duration_is_dash_while_running() {
        assert_eq!(format_duration(&entry(100, 0)), "-");
        assert_eq!(format_duration(&entry(100, 142)), "42s");
        assert_eq!(format_duration(&entry(100, 225)), "2m05s");
    }

    #[test]
    fn truncate_respects_multibyte_names() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééééééééé", 6), "ééé...");
    }
}
