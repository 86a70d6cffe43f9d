use console::style;

use crate::types::{Progress, SessionStatus, StageStatus};

pub struct Output;

impl Output {
    pub fn new() -> Self {
        Self
    }

    pub fn success(&self, message: &str) {
        println!("{} {}", style("✓").green(), message);
    }

    pub fn error(&self, message: &str) {
        eprintln!("{} {}", style("✗").red(), message);
    }

    pub fn warning(&self, message: &str) {
        println!("{} {}", style("⚠").yellow(), message);
    }

    pub fn info(&self, message: &str) {
        println!("{} {}", style("ℹ").blue(), message);
    }

    pub fn header(&self, message: &str) {
        println!("\n{}", style(message).bold().underlined());
    }

    pub fn section(&self, message: &str) {
        println!("\n{}", style(message).bold());
        println!("{}", "─".repeat(40));
    }

    pub fn field(&self, key: &str, value: impl std::fmt::Display) {
        println!("  {:<14} {}", style(format!("{}:", key)).dim(), value);
    }

    /// `[#####-----]  50%  message`
    pub fn progress(&self, label: &str, progress: &Progress) {
        let filled = ((progress.percent / 10.0).round() as usize).min(10);
        let bar = format!("{}{}", "#".repeat(filled), "-".repeat(10 - filled));
        let bar = if progress.percent >= 100.0 {
            style(bar).green()
        } else {
            style(bar).cyan()
        };
        println!(
            "  {:<20} [{}] {:>3.0}%  {}",
            label,
            bar,
            progress.percent,
            style(&progress.message).dim()
        );
    }

    pub fn session_status(&self, status: SessionStatus) -> String {
        match status {
            SessionStatus::Processing => style(status.as_str()).cyan().to_string(),
            SessionStatus::Completed => style(status.as_str()).green().to_string(),
            SessionStatus::Failed => style(status.as_str()).red().to_string(),
        }
    }

    pub fn stage_status(&self, status: StageStatus) -> String {
        match status {
            StageStatus::Processing => style(status.as_str()).cyan().to_string(),
            StageStatus::Completed => style(status.as_str()).green().to_string(),
            StageStatus::Failed => style(status.as_str()).red().to_string(),
        }
    }
}

impl Default for Output {
    fn default() -> Self {
        Self::new()
    }
}
