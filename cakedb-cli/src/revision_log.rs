//! Human-readable revision log output for the `cakedb` CLI.

use anyhow::Result;
use cakedb_core::{Revision, RevisionStatus};
use std::io::Write;

/// Longest command shown before it is cut off.
const MAX_COMMAND_WIDTH: usize = 120;

fn format_millis(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}

/// Format a revision for display.
pub fn format_revision(revision: &Revision) -> String {
    let when = revision
        .commit_time
        .map(format_millis)
        .unwrap_or_else(|| format!("created {}", format_millis(revision.create_time)));

    let status = match revision.status {
        RevisionStatus::Commit => "COMMIT",
        RevisionStatus::Pending => "PENDING",
        RevisionStatus::Failure => "FAILED",
    };

    let command: String = revision.command.split_whitespace().collect::<Vec<_>>().join(" ");
    let command = if command.chars().count() > MAX_COMMAND_WIDTH {
        let cut: String = command.chars().take(MAX_COMMAND_WIDTH).collect();
        format!("{}...", cut)
    } else {
        command
    };

    format!("[{}] {} {} | {}", when, revision.id, status, command)
}

/// Print revisions, oldest first, with a short summary.
pub fn print_revisions(revisions: &[Revision], checkpoint: Option<&str>, writer: &mut dyn Write) -> Result<()> {
    if revisions.is_empty() {
        writeln!(writer, "No committed revisions found.")?;
        return Ok(());
    }

    writeln!(writer, "Revision Log ({} revisions):", revisions.len())?;
    writeln!(writer, "{}", "-".repeat(80))?;
    for revision in revisions {
        let marker = if checkpoint == Some(revision.id.as_str()) { "*" } else { " " };
        writeln!(writer, "{} {}", marker, format_revision(revision))?;
    }
    writeln!(writer, "{}", "-".repeat(80))?;

    if let (Some(first), Some(last)) = (revisions.first(), revisions.last()) {
        let span = last.commit_time.unwrap_or(0) - first.commit_time.unwrap_or(0);
        writeln!(writer, "Span: {}ms", span)?;
    }
    Ok(())
}
