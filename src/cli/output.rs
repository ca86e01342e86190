// Output formatting and display for CLI

use crate::config::{ConfigErrors, ProcessSpec};
use crate::logs::LogEntry;
use crate::process::{Operation, UnitPhase, UnitStatus};
use colored::*;
use std::time::Duration;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

/// Acknowledge an accepted lifecycle request
pub fn print_accepted(name: &str, op: Operation) {
    let verb = match op {
        Operation::Start => "starting",
        Operation::Stop => "stopping",
        Operation::Restart => "restarting",
    };
    println!(
        "{} {}",
        "✓".green().bold(),
        format!("Unit {} is {}", name.cyan(), verb).bold()
    );
}

/// Print an error message to stderr
pub fn print_error(error: &str) {
    eprintln!("{} {}", "✗ Error:".red().bold(), error);
}

/// Print a success message
pub fn print_success_msg(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print every violation found while validating a config file
pub fn print_violations(errors: &ConfigErrors) {
    eprintln!(
        "{}",
        format!("✗ {} configuration error(s):", errors.violations.len())
            .red()
            .bold()
    );
    for violation in &errors.violations {
        let unit = if violation.unit.is_empty() {
            "<unnamed>"
        } else {
            violation.unit.as_str()
        };
        eprintln!(
            "  {} {}: {}",
            unit.cyan(),
            violation.field.bold(),
            violation.message
        );
    }
}

/// Print a formatted table of units
pub fn print_unit_table(units: &[UnitStatus]) {
    if units.is_empty() {
        println!("{}", "No units are configured".yellow());
        return;
    }

    #[derive(Tabled)]
    struct UnitRow {
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "State")]
        state: String,
        #[tabled(rename = "PID")]
        pid: String,
        #[tabled(rename = "CPU")]
        cpu: String,
        #[tabled(rename = "Memory")]
        memory: String,
        #[tabled(rename = "Uptime")]
        uptime: String,
        #[tabled(rename = "Restarts")]
        restarts: String,
    }

    let rows: Vec<UnitRow> = units
        .iter()
        .map(|u| UnitRow {
            name: truncate(&u.name, 24),
            state: format_phase_colored(u.phase),
            pid: u
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            cpu: format!("{:.1}%", u.cpu_percent),
            memory: format_memory(u.memory_bytes),
            uptime: format_duration(&u.uptime),
            restarts: u.restarts.to_string(),
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    println!("\n{}\n", table);
    println!(
        "{}",
        format!("Total: {} unit(s)", units.len()).dimmed().italic()
    );
}

/// Print detailed status view for a single unit
pub fn print_detailed_status(unit: &UnitStatus) {
    println!("\n{}", "Unit Details".bold().underline());
    println!();
    println!("  {:<15} {}", "Name:".bold(), unit.name.cyan());
    println!("  {:<15} {}", "State:".bold(), format_phase_colored(unit.phase));

    if let Some(pid) = unit.pid {
        println!("  {:<15} {}", "PID:".bold(), pid);
    }

    println!("  {:<15} {:.1}%", "CPU Usage:".bold(), unit.cpu_percent);
    println!("  {:<15} {}", "Memory:".bold(), format_memory(unit.memory_bytes));
    println!("  {:<15} {}", "Uptime:".bold(), format_duration(&unit.uptime));
    println!("  {:<15} {}", "Restarts:".bold(), unit.restarts);
    println!("  {:<15} {}", "Recent exits:".bold(), unit.recent_exits);

    if let Some(exit) = unit.last_exit {
        println!("  {:<15} {}", "Last exit:".bold(), exit);
    }
    if let Some(failure) = &unit.last_failure {
        println!("  {:<15} {}", "Last failure:".bold(), failure.to_string().red());
    }
    if unit.log_dropped_lines > 0 || unit.log_write_failures > 0 {
        println!(
            "  {:<15} {} dropped, {} write failures",
            "Logs:".bold(),
            unit.log_dropped_lines,
            unit.log_write_failures
        );
    }
    if unit.busy {
        println!("  {:<15} {}", "Pending:".bold(), "transition in progress".yellow());
    }

    println!();
}

/// Print the units a config file defines
pub fn print_specs(specs: &[ProcessSpec]) {
    print_success_msg(&format!("Configuration is valid ({} unit(s))", specs.len()));
    for spec in specs {
        let memory = spec
            .max_memory
            .map(format_memory)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {} {} {} {}",
            spec.name.cyan(),
            spec.command,
            spec.args.join(" ").dimmed(),
            format!("(cwd {}, max memory {})", spec.cwd.display(), memory).dimmed()
        );
    }
}

/// Print log lines
pub fn print_logs(entries: &[LogEntry]) {
    if entries.is_empty() {
        println!("{}", "No logs available".yellow());
        return;
    }

    for entry in entries {
        println!("{}", entry.format());
    }
}

/// Format a unit phase with color coding
fn format_phase_colored(phase: UnitPhase) -> String {
    let text = phase.to_string();
    match phase {
        UnitPhase::Running => text.green().to_string(),
        UnitPhase::Starting | UnitPhase::Restarting | UnitPhase::Stopping => {
            text.yellow().to_string()
        }
        UnitPhase::CrashedBackoff => text.magenta().to_string(),
        UnitPhase::Stopped => text.bright_black().to_string(),
        UnitPhase::Failed => text.red().bold().to_string(),
    }
}

/// Format a duration in human-readable format
fn format_duration(duration: &Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        let mins = secs / 60;
        let secs = secs % 60;
        if secs > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}m", mins)
        }
    } else if secs < 86400 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        if mins > 0 {
            format!("{}h {}m", hours, mins)
        } else {
            format!("{}h", hours)
        }
    } else {
        let days = secs / 86400;
        let hours = (secs % 86400) / 3600;
        if hours > 0 {
            format!("{}d {}h", days, hours)
        } else {
            format!("{}d", days)
        }
    }
}

/// Format memory usage in human-readable format
fn format_memory(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes < KB {
        format!("{}B", bytes)
    } else if bytes < MB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    }
}

/// Truncate a string to at most `max_len` characters
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(&Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(&Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(&Duration::from_secs(3700)), "1h 1m");
        assert_eq!(format_duration(&Duration::from_secs(90000)), "1d 1h");
    }

    #[test]
    fn test_format_memory() {
        assert_eq!(format_memory(512), "512B");
        assert_eq!(format_memory(2048), "2.0KB");
        assert_eq!(format_memory(1024 * 1024 * 1024), "1.00GB");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("employee-frontend-primary", 10), "employe...");
    }
}
