//! Parsing of the engine's `--json` output.

use serde::Deserialize;

use crate::report::RunMetrics;

/// One line of JSON progress output. Only the `summary` line matters.
#[derive(Debug, Deserialize)]
struct MessageLine {
    message_type: String,
    #[serde(default)]
    files_new: u64,
    #[serde(default)]
    files_changed: u64,
    #[serde(default)]
    files_unmodified: u64,
    #[serde(default)]
    total_bytes_processed: u64,
    #[serde(default)]
    bytes_added: u64,
    #[serde(default)]
    snapshot_id: Option<String>,
}

/// Extract run metrics from the first `summary` message, if any.
pub fn parse_summary(stdout: &[u8]) -> Option<RunMetrics> {
    let text = String::from_utf8_lossy(stdout);
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str::<MessageLine>(line).ok())
        .find(|msg| msg.message_type == "summary")
        .map(|summary| RunMetrics {
            files_total: summary.files_new + summary.files_changed + summary.files_unmodified,
            bytes_total: summary.total_bytes_processed,
            data_added_bytes: summary.bytes_added,
            snapshot_id: summary.snapshot_id.filter(|id| !id.is_empty()),
        })
}
