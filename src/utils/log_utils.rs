use crate::processor::job::RunSummary;
use anyhow::{Context, Result};
use std::fs::{create_dir_all, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::info;

/// Appends one JSON line per run to the run log.
pub fn append_run_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if !dir.exists() {
            create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        }
    }

    let line = serde_json::to_string(summary)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open run log {}", path.display()))?;
    writeln!(file, "{}", line)?;

    Ok(())
}

/// Logs the per-node outcome of a run through tracing.
pub fn log_run_summary(summary: &RunSummary) {
    info!(
        run_id = %summary.run_id,
        job = %summary.job,
        succeeded = summary.succeeded,
        failed = summary.failed,
        skipped = summary.skipped,
        "Run finished"
    );
    for node in &summary.nodes {
        match &node.error {
            Some(error) => info!("  {:<32} {:<10} {:>8}ms  {}", node.name, node.status, node.duration_ms, error),
            None => info!("  {:<32} {:<10} {:>8}ms", node.name, node.status, node.duration_ms),
        }
    }
}
