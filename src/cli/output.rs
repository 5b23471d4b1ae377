//! Output formatting module for Homestead
//!
//! Human output is printed as events arrive: a banner per play, one line
//! per (node, task) result and a recap at the end. In JSON mode nothing is
//! printed during the run; the command prints the serialized report.

use async_trait::async_trait;
use colored::Colorize;
use std::time::{Duration, Instant};

use homestead::callback::RunCallback;
use homestead::report::{PlayReport, RunReport, TaskOutcome, TaskRecord};

/// Output formatter for different output modes
pub struct OutputFormatter {
    /// Use colored output
    use_color: bool,
    /// JSON output mode
    json_mode: bool,
    /// Verbosity level
    verbosity: u8,
    /// Start time for duration calculations
    start_time: Instant,
}

impl OutputFormatter {
    /// Create a new output formatter
    pub fn new(use_color: bool, json_mode: bool, verbosity: u8) -> Self {
        Self {
            use_color,
            json_mode,
            verbosity,
            start_time: Instant::now(),
        }
    }

    pub fn is_json(&self) -> bool {
        self.json_mode
    }

    fn header(&self, header: String) {
        let stars = "*".repeat(80_usize.saturating_sub(header.len() + 1));
        if self.use_color {
            println!("\n{} {}", header.bright_white().bold(), stars.bright_black());
        } else {
            println!("\n{} {}", header, stars);
        }
    }

    /// Print a play header
    pub fn play_header(&self, play_name: &str) {
        if self.json_mode {
            return;
        }
        self.header(format!("PLAY [{}]", play_name));
    }

    fn status_label(&self, record: &TaskRecord) -> String {
        let label = match (record.outcome, record.ignored) {
            (TaskOutcome::Failed, true) => "ignored",
            (TaskOutcome::Failed, false) => "failed",
            (TaskOutcome::Changed, _) => "changed",
            (TaskOutcome::Unchanged, _) => "ok",
            (TaskOutcome::Skipped, _) => "skipping",
        };
        if !self.use_color {
            return label.to_string();
        }
        match (record.outcome, record.ignored) {
            (TaskOutcome::Failed, true) => label.blue().to_string(),
            (TaskOutcome::Failed, false) => label.red().bold().to_string(),
            (TaskOutcome::Changed, _) => label.yellow().to_string(),
            (TaskOutcome::Unchanged, _) => label.green().to_string(),
            (TaskOutcome::Skipped, _) => label.cyan().to_string(),
        }
    }

    /// Format one task result line
    pub fn task_line(&self, node: &str, record: &TaskRecord) -> String {
        let mut line = format!("{}: [{}] => {}", self.status_label(record), node, record.task);
        let show_message = match record.outcome {
            TaskOutcome::Failed => true,
            TaskOutcome::Skipped => self.verbosity >= 1,
            TaskOutcome::Changed | TaskOutcome::Unchanged => self.verbosity >= 1,
        };
        if let Some(message) = record.message.as_deref().filter(|_| show_message) {
            line.push_str(&format!(" ({})", message));
        }
        if self.verbosity >= 2 {
            line.push_str(&format!(" [{}ms]", record.duration_ms));
        }
        line
    }

    /// Print a recap summary
    pub fn recap(&self, report: &RunReport) {
        if self.json_mode {
            return;
        }
        self.header("PLAY RECAP".to_string());

        for (node, stats) in report.recap() {
            let line = format!(
                "{:<30} : ok={:<4} changed={:<4} failed={:<4} skipped={:<4} ignored={:<4}",
                node, stats.ok, stats.changed, stats.failed, stats.skipped, stats.ignored
            );
            if !self.use_color {
                println!("{}", line);
                continue;
            }

            let node_colored = if stats.failed > 0 {
                node.red().bold()
            } else if stats.changed > 0 {
                node.yellow()
            } else {
                node.green()
            };
            let fmt_stat = |label: &str, value: usize, color: colored::Color| -> String {
                if value > 0 {
                    format!("{}={:<4}", label.color(color), value)
                } else {
                    format!("{}={:<4}", label, value).dimmed().to_string()
                }
            };
            println!(
                "{:<30} : {} {} {} {} {}",
                node_colored,
                fmt_stat("ok", stats.ok, colored::Color::Green),
                fmt_stat("changed", stats.changed, colored::Color::Yellow),
                fmt_stat("failed", stats.failed, colored::Color::Red),
                fmt_stat("skipped", stats.skipped, colored::Color::Cyan),
                fmt_stat("ignored", stats.ignored, colored::Color::Blue),
            );
        }

        let duration = format_duration(self.start_time.elapsed());
        let status = if report.cancelled {
            "Run cancelled.".to_string()
        } else if report.success() {
            "Playbook completed successfully.".to_string()
        } else {
            format!("Playbook failed on: {}.", report.failed_nodes().join(", "))
        };
        let mode = if report.check_mode { " (check mode)" } else { "" };

        if self.use_color {
            println!("\n{} {}{}", "Playbook run took".bright_black(), duration.bright_white(), mode);
            if report.success() {
                println!("{}", status.green().bold());
            } else {
                println!("{}", status.red().bold());
            }
        } else {
            println!("\nPlaybook run took {}{}", duration, mode);
            println!("{}", status);
        }
    }

    /// Print an error message
    pub fn error(&self, message: &str) {
        if self.json_mode {
            let err = serde_json::json!({
                "type": "error",
                "message": message
            });
            eprintln!("{}", err);
            return;
        }

        if self.use_color {
            eprintln!("{} {}", "ERROR:".red().bold(), message);
        } else {
            eprintln!("ERROR: {}", message);
        }
    }

    /// Print a warning message
    pub fn warning(&self, message: &str) {
        if self.json_mode {
            let warn = serde_json::json!({
                "type": "warning",
                "message": message
            });
            eprintln!("{}", warn);
            return;
        }

        if self.use_color {
            eprintln!("{} {}", "WARNING:".yellow().bold(), message);
        } else {
            eprintln!("WARNING: {}", message);
        }
    }

    /// Print a plain line of human output
    pub fn line(&self, message: &str) {
        if !self.json_mode {
            println!("{}", message);
        }
    }
}

#[async_trait]
impl RunCallback for OutputFormatter {
    async fn on_play_start(&self, play: &str, nodes: &[String]) {
        self.play_header(play);
        if nodes.is_empty() {
            self.warning(&format!("play '{}' matched no nodes", play));
        }
    }

    async fn on_task_result(&self, node: &str, record: &TaskRecord) {
        if !self.json_mode {
            println!("{}", self.task_line(node, record));
        }
    }

    async fn on_play_end(&self, report: &PlayReport) {
        if self.verbosity >= 1 && !self.json_mode {
            for node in &report.nodes {
                println!("  {} -> {}", node.node, node.state);
            }
        }
    }

    async fn on_run_end(&self, report: &RunReport) {
        self.recap(report);
    }
}

/// Format a duration as a human-readable string
fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();

    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}.{:03}s", secs, millis)
    } else {
        format!("{}ms", millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homestead::report::TaskResult;

    fn record(result: TaskResult) -> TaskRecord {
        TaskRecord::new("docker : ensure-repo-added", "apt_repository", result, Duration::ZERO)
    }

    #[test]
    fn test_task_line() {
        let plain = OutputFormatter::new(false, false, 0);
        assert_eq!(
            plain.task_line("srv1", &record(TaskResult::changed("added"))),
            "changed: [srv1] => docker : ensure-repo-added"
        );
        assert_eq!(
            plain.task_line("srv1", &record(TaskResult::failed("boom"))),
            "failed: [srv1] => docker : ensure-repo-added (boom)"
        );

        let verbose = OutputFormatter::new(false, false, 1);
        assert_eq!(
            verbose.task_line("srv1", &record(TaskResult::unchanged("present"))),
            "ok: [srv1] => docker : ensure-repo-added (present)"
        );
    }

    #[test]
    fn test_ignored_label() {
        let plain = OutputFormatter::new(false, false, 0);
        let mut rec = record(TaskResult::failed("boom"));
        rec.ignored = true;
        assert!(plain.task_line("srv1", &rec).starts_with("ignored: "));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(5)), "5.000s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
        assert_eq!(format_duration(Duration::from_secs(3665)), "1h 1m 5s");
    }
}
