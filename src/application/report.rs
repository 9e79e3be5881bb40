//! End-of-run results: a console summary and a JSON record in the export
//! folder.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;

use crate::domain::counts::total;
use crate::domain::{AppError, Counts, Result};

/// File, inside the log directory, holding the JSON results.
pub const RESULTS_FILE: &str = "results.json";

/// Everything reported about a finished export.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub version: String,
    pub invocation: String,
    pub export_path: PathBuf,
    pub finished_at: DateTime<Local>,
    pub elapsed_secs: f64,
    pub counts: Counts,
}

impl RunSummary {
    #[must_use]
    pub fn new(export_path: &Path, counts: Counts, elapsed: Duration) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            invocation: std::env::args().collect::<Vec<_>>().join(" "),
            export_path: export_path.to_path_buf(),
            finished_at: Local::now(),
            elapsed_secs: elapsed.as_secs_f64(),
            counts,
        }
    }
}

/// Formats the results for the console.
pub fn format_results(summary: &RunSummary) -> String {
    let c = &summary.counts;
    let mut out = format!(
        "{}\n  bagoup version: {}\n  Invocation: {}\n  Export folder: {:?}\n",
        "BAGOUP RESULTS:".bold(),
        summary.version,
        summary.invocation,
        summary.export_path.display().to_string()
    );
    out.push_str(&format!(
        "  Export files written: {}\n  Chats exported: {}\n  Valid messages exported: {}\n",
        c.files.to_string().cyan(),
        c.chats.to_string().cyan(),
        c.messages.to_string().green()
    ));
    out.push_str(&format!(
        "  Invalid messages exported (see warnings above): {}\n",
        c.messages_invalid.to_string().yellow()
    ));
    out.push_str(&format!(
        "  Attachments copied: {}\n  Attachments referenced or embedded: {}\n  Attachments embedded: {}\n",
        total(&c.attachments_copied),
        total(&c.attachments),
        total(&c.attachments_embedded)
    ));
    out.push_str(&format!(
        "  Attachments missing (see warnings above): {}\n  HEIC conversions completed: {}\n  HEIC conversions failed (see warnings above): {}\n",
        c.attachments_missing.to_string().yellow(),
        c.conversions,
        c.conversions_failed.to_string().yellow()
    ));
    out.push_str(&format!("  Time elapsed: {:.1}s", summary.elapsed_secs));
    if !c.attachments.is_empty() {
        out.push('\n');
        out.push_str(&format_attachments_table(c));
    }
    out
}

/// Formats per-MIME-type attachment counts as a table.
pub fn format_attachments_table(counts: &Counts) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["MIME type", "Total", "Copied", "Embedded"]);

    for (mime_type, count) in &counts.attachments {
        let copied = counts.attachments_copied.get(mime_type).copied().unwrap_or(0);
        let embedded = counts
            .attachments_embedded
            .get(mime_type)
            .copied()
            .unwrap_or(0);
        table.add_row(vec![
            mime_type.clone(),
            count.to_string(),
            copied.to_string(),
            embedded.to_string(),
        ]);
    }

    table.to_string()
}

/// Writes the results as JSON into the log directory, returning its path.
///
/// # Errors
/// Returns error if the directory or file cannot be written.
pub fn write_results(log_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    fs::create_dir_all(log_dir)
        .map_err(|e| AppError::io(format!("create log directory {}", log_dir.display()), e))?;
    let path = log_dir.join(RESULTS_FILE);
    let json = serde_json::to_string_pretty(summary).map_err(|e| AppError::Config {
        message: format!("serialize results: {e}"),
    })?;
    fs::write(&path, json)
        .map_err(|e| AppError::io(format!("write results file {}", path.display()), e))?;
    tracing::info!(path = %path.display(), "Results written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn counts() -> Counts {
        let mut counts = Counts {
            files: 2,
            chats: 3,
            messages: 40,
            messages_invalid: 1,
            attachments_missing: 1,
            ..Default::default()
        };
        counts.add_attachment("image/png", true);
        counts.add_attachment("image/png", false);
        counts.add_copied("image/png");
        counts.add_attachment("text/vcard", false);
        counts
    }

    #[test]
    fn test_format_results_lists_totals() {
        colored::control::set_override(false);
        let summary = RunSummary::new(Path::new("/tmp/export"), counts(), Duration::from_secs(3));
        let text = format_results(&summary);
        assert!(text.contains("Export files written: 2"));
        assert!(text.contains("Valid messages exported: 40"));
        assert!(text.contains("Attachments referenced or embedded: 3"));
        assert!(text.contains("Attachments embedded: 1"));
        assert!(text.contains("text/vcard"));
    }

    #[test]
    fn test_attachments_table_rows() {
        let table = format_attachments_table(&counts());
        assert!(table.contains("MIME type"));
        assert!(table.contains("image/png"));
        assert_eq!(table.matches("image/png").count(), 1);
    }

    #[test]
    fn test_write_results_json() {
        let dir = tempdir().unwrap();
        let log_dir = dir.path().join(".bagoup");
        let summary = RunSummary::new(Path::new("/tmp/export"), counts(), Duration::from_millis(1500));

        let path = write_results(&log_dir, &summary).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["counts"]["files"], 2);
        assert_eq!(value["counts"]["attachments"]["image/png"], 2);
        assert_eq!(value["elapsed_secs"], 1.5);
    }
}
