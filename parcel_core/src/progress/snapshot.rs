use serde::Serialize;

/// Aggregate progress snapshot for one file download.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub file_id: String,
    pub total_bytes: u64,
    pub bytes_complete: u64,
    pub speed: f64,
    pub eta_secs: f64,
    pub done: bool,
}

/// Human-readable byte formatting.
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;

    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GB", b / GB)
    } else if b >= MB {
        format!("{:.2} MB", b / MB)
    } else if b >= KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}
