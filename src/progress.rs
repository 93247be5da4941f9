//! Terminal output for the CLI
//!
//! A spinner while exports run, plus the styled header, summary, schema
//! and capability tables printed around them.

use crate::backend::{BackendCapability, ProgressCallback};
use crate::config::OutputFormat;
use crate::error::ExportError;
use crate::export::{ExportPlan, ExportStats};
use crate::types::KindSet;
use console::style;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;

/// Spinner showing the current stage and rows written
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    /// Create a spinner on stderr
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        let spinner = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
        bar.set_style(spinner);
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    /// Replace the status line
    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    /// Callback reporting rows written for the export labelled `label`
    pub fn row_callback(&self, label: String) -> ProgressCallback {
        let bar = self.bar.clone();
        Box::new(move |written, total| {
            bar.set_message(format!(
                "{} | Rows: {} / {}",
                label,
                format_number(written),
                format_number(total)
            ));
        })
    }

    /// Stop the spinner, leaving `message` on screen
    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    /// Stop the spinner and erase it
    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a number with thousands separators
pub fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Print a header at the start of a run
pub fn print_header(configs: usize, parallelism: usize, backends: &[&str]) {
    println!();
    println!(
        "{} {}",
        style("duckport").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Exports:").bold(), configs);
    println!("  {} {}", style("Parallelism:").bold(), parallelism);
    println!("  {} {}", style("Backends:").bold(), backends.join(", "));
    println!();
}

/// Print one line per export and the totals
pub fn print_summary(outcomes: &[(&Path, Result<&ExportStats, &ExportError>)], duration: Duration) {
    let done = outcomes.iter().filter(|(_, r)| r.is_ok()).count();
    let failed = outcomes.len() - done;

    println!();
    if failed == 0 {
        println!("{}", style("Export Complete").green().bold());
    } else {
        println!("{}", style("Export Finished With Errors").yellow().bold());
    }
    println!("{}", style("─".repeat(50)).dim());

    let mut rows = 0u64;
    let mut bytes = 0u64;
    for (config, outcome) in outcomes {
        match outcome {
            Ok(stats) => {
                rows += stats.rows;
                bytes += stats.bytes;
                println!(
                    "  {} {} ({} rows, {}, {} via {}, {:.1}s)",
                    style("✓").green(),
                    stats.output_path.display(),
                    format_number(stats.rows),
                    format_size(stats.bytes, BINARY),
                    stats.format,
                    stats.backend,
                    stats.elapsed.as_secs_f64()
                );
            }
            Err(e) => {
                println!(
                    "  {} {} {}: {}",
                    style("✗").red(),
                    config.display(),
                    style(e.kind()).red().bold(),
                    e
                );
            }
        }
    }

    println!();
    println!("  {} {}", style("Rows:").bold(), format_number(rows));
    println!("  {} {}", style("Written:").bold(), format_size(bytes, BINARY));
    println!(
        "  {} {:.1}s",
        style("Duration:").bold(),
        duration.as_secs_f64()
    );
    if failed > 0 {
        println!(
            "  {} {}",
            style("Failed:").yellow().bold(),
            format_number(failed as u64)
        );
    }
    println!();
}

/// Print what `check` found: the column schema and the chosen backend
pub fn print_plan(config: &Path, plan: &ExportPlan) {
    println!();
    println!("{} {}", style("Check").cyan().bold(), config.display());
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Rows:").bold(), format_number(plan.rows as u64));
    println!(
        "  {} {} via {}",
        style("Output:").bold(),
        plan.format,
        plan.backend
    );
    println!();

    let width = plan
        .schema
        .columns()
        .iter()
        .map(|c| c.name.chars().count())
        .max()
        .unwrap_or(0)
        .max(6);
    println!(
        "  {:<width$}  {:<12}  {}",
        style("column").bold(),
        style("logical").bold(),
        style("native").bold(),
        width = width
    );
    for column in plan.schema.columns() {
        let native = match &column.timezone {
            Some(tz) => format!("{} ({})", column.native, tz),
            None => column.native.to_string(),
        };
        println!(
            "  {:<width$}  {:<12}  {}",
            column.name,
            column.logical.to_string(),
            style(native).dim(),
            width = width
        );
    }
    println!();
}

/// Print the probed capability table
pub fn print_capabilities(capabilities: &[BackendCapability]) {
    println!();
    println!("{}", style("Backends").cyan().bold());
    println!("{}", style("─".repeat(50)).dim());
    for cap in capabilities {
        let status = if cap.available {
            style("available").green()
        } else {
            style("unavailable").red()
        };
        let primary = if cap.primary { " (primary)" } else { "" };
        println!("  {}{} {}", style(cap.name).bold(), primary, status);
        if let Some(note) = &cap.note {
            println!("    {}", style(note).dim());
        }
        for format in OutputFormat::ALL {
            if let Some(kinds) = cap.kinds_for(format) {
                println!("    {:<8} {}", format.name(), describe_kinds(kinds));
            }
        }
        let widths = cap
            .integer_widths
            .iter()
            .map(|w| w.bits().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        println!("    {:<8} {}", "integers", widths);
    }
    println!();
}

/// Comma-separated kind names for the capability table
fn describe_kinds(kinds: KindSet) -> String {
    if kinds == KindSet::ALL {
        return "all kinds".to_string();
    }
    kinds.iter().map(|k| k.name()).collect::<Vec<_>>().join(", ")
}
