use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use parcel_core::progress::{ProgressObserver, ProgressSnapshot};

/// Renders download progress as an indicatif terminal bar per file.
///
/// Bars are created lazily on the first snapshot for a file and live under
/// a shared `MultiProgress` so batches render cleanly.
pub struct TerminalProgressObserver {
    multi: MultiProgress,
    /// file_id → bar
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl TerminalProgressObserver {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar_for(&self, snapshot: &ProgressSnapshot) -> ProgressBar {
        let mut bars = self.bars.lock().unwrap();
        if let Some(bar) = bars.get(&snapshot.file_id) {
            return bar.clone();
        }
        let style = ProgressStyle::with_template(
            "{msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({binary_bytes_per_sec}) ETA {eta}",
        )
        .unwrap()
        .progress_chars("=>-");
        let bar = self.multi.add(ProgressBar::new(snapshot.total_bytes.max(1)));
        bar.set_style(style);
        bar.set_message(snapshot.file_id.clone());
        bars.insert(snapshot.file_id.clone(), bar.clone());
        bar
    }
}

#[async_trait]
impl ProgressObserver for TerminalProgressObserver {
    async fn on_progress(&self, snapshot: &ProgressSnapshot) {
        let bar = self.bar_for(snapshot);
        bar.set_position(snapshot.bytes_complete);
    }

    async fn on_complete(&self, snapshot: &ProgressSnapshot) {
        let bar = self.bar_for(snapshot);
        bar.set_position(snapshot.bytes_complete);
        bar.finish();
    }

    async fn on_error(&self, error: &str) {
        let bars = self.bars.lock().unwrap();
        for bar in bars.values() {
            bar.abandon_with_message(error.to_string());
        }
    }
}
