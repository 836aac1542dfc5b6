use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use super::observer::ProgressObserver;
use super::snapshot::ProgressSnapshot;
use crate::types::types::ProgressEvent;

/// EMA smoothing factor. 0.3 = responsive but stable.
const EMA_ALPHA: f64 = 0.3;

/// Consumes `Result<ProgressEvent, String>` from the producer's progress
/// channel, folds byte deltas into `ProgressSnapshot`s, and fans out to all
/// registered observers.
///
/// | Channel message         | Observer method called         |
/// |-------------------------|--------------------------------|
/// | `Ok(ProgressEvent)`     | `on_progress(&snapshot)`       |
/// | `Err(String)`           | `on_error(&msg)` then stops    |
/// | Channel closed (no err) | `on_complete(&final_snapshot)` |
pub struct ProgressNotifier {
    file_id: String,
    total_bytes: u64,
    bytes_complete: u64,
    speed: f64,
    last_update: Instant,
    start_time: Instant,
    observers: Vec<Arc<dyn ProgressObserver>>,
}

impl ProgressNotifier {
    pub fn new(
        file_id: String,
        total_bytes: u64,
        observers: Vec<Arc<dyn ProgressObserver>>,
    ) -> Self {
        let now = Instant::now();
        Self {
            file_id,
            total_bytes,
            bytes_complete: 0,
            speed: 0.0,
            last_update: now,
            start_time: now,
            observers,
        }
    }

    /// Consume progress messages until the channel closes or an error
    /// arrives.
    pub async fn run(mut self, mut progress_rx: mpsc::Receiver<Result<ProgressEvent, String>>) {
        while let Some(msg) = progress_rx.recv().await {
            match msg {
                Ok(event) => {
                    let snapshot = self.handle_event(event);
                    for observer in &self.observers {
                        observer.on_progress(&snapshot).await;
                    }
                }
                Err(error) => {
                    for observer in &self.observers {
                        observer.on_error(&error).await;
                    }
                    return;
                }
            }
        }
        // channel closed cleanly, all senders dropped without an error
        self.finish().await;
    }

    fn handle_event(&mut self, event: ProgressEvent) -> ProgressSnapshot {
        let now = Instant::now();
        self.bytes_complete += event.bytes_delta;

        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        if elapsed > 0.0 {
            let instant_speed = event.bytes_delta as f64 / elapsed;
            self.speed = EMA_ALPHA * instant_speed + (1.0 - EMA_ALPHA) * self.speed;
            self.last_update = now;
        }

        self.build_snapshot(false)
    }

    fn build_snapshot(&self, done: bool) -> ProgressSnapshot {
        let remaining = self.total_bytes.saturating_sub(self.bytes_complete);
        let eta_secs = if self.speed > 0.0 {
            remaining as f64 / self.speed
        } else {
            0.0
        };
        ProgressSnapshot {
            file_id: self.file_id.clone(),
            total_bytes: self.total_bytes,
            bytes_complete: self.bytes_complete,
            speed: self.speed,
            eta_secs,
            done,
        }
    }

    async fn finish(self) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let avg_speed = if elapsed > 0.0 {
            self.bytes_complete as f64 / elapsed
        } else {
            0.0
        };

        let mut snapshot = self.build_snapshot(true);
        snapshot.speed = avg_speed;
        snapshot.eta_secs = 0.0;

        for observer in &self.observers {
            observer.on_complete(&snapshot).await;
        }
    }
}
