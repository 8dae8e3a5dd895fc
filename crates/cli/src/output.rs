//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a rounded table, or a warning when there is nothing to show
pub fn print_table<T: Tabled>(items: &[T], empty_message: &str) {
    if items.is_empty() {
        print_warning(empty_message);
        return;
    }
    let table = Table::new(items).with(Style::rounded()).to_string();
    println!("{}", table);
}

/// Print any serializable report as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format a score in [0, 1] with four decimals
pub fn format_score(score: f64) -> String {
    format!("{:.4}", score)
}

/// Format a score, coloured by how good it is
pub fn color_score(score: f64) -> String {
    let formatted = format_score(score);
    if score >= 0.9 {
        formatted.green().to_string()
    } else if score >= 0.7 {
        formatted.yellow().to_string()
    } else {
        formatted.red().to_string()
    }
}

/// Color a change-detection status
pub fn color_status(status: &str) -> String {
    match status {
        "unchanged" => status.green().to_string(),
        "changed" | "first_run" => status.yellow().to_string(),
        "missing" => status.red().to_string(),
        _ => status.to_string(),
    }
}

/// Color a stage tag relative to the configured active and archived stages
pub fn color_stage(stage: &str, active: &str, archived: &str) -> String {
    if stage == active {
        stage.green().bold().to_string()
    } else if stage == archived {
        stage.dimmed().to_string()
    } else {
        stage.to_string()
    }
}

/// Shorten a run id for table display
pub fn truncate_id(id: &str) -> String {
    if id.chars().count() > 12 {
        let head: String = id.chars().take(12).collect();
        format!("{}…", head)
    } else {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_score() {
        assert_eq!(format_score(0.9666666), "0.9667");
        assert_eq!(format_score(1.0), "1.0000");
    }

    #[test]
    fn test_truncate_id() {
        assert_eq!(truncate_id("abc"), "abc");
        assert_eq!(truncate_id("0123456789abcdef"), "0123456789ab…");
    }

    #[test]
    fn test_color_stage_plain_for_unknown_stage() {
        colored::control::set_override(false);
        assert_eq!(color_stage("Staging", "Production", "Archived"), "Staging");
        assert_eq!(color_stage("Production", "Production", "Archived"), "Production");
    }
}
