//! The download workers.
//!
//! A worker is a loop: take an interval from the shared work queue, fetch
//! it, repeat. A `None` sentinel ends the loop. Workers are stateless
//! beyond the interval in flight; a fatal fetch error is reported on the
//! completion channel so the producer can surface it as a file-level
//! failure.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::downloader::range_fetcher::RangeFetcher;
use crate::downloader::segment_producer::SharedWorkReceiver;
use crate::types::types::{CompletionResult, DownloadError};

pub fn spawn_workers(
    count: usize,
    fetcher: Arc<RangeFetcher>,
    work_rx: SharedWorkReceiver,
    completions: mpsc::Sender<CompletionResult>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|n| {
            let fetcher = Arc::clone(&fetcher);
            let work_rx = Arc::clone(&work_rx);
            let completions = completions.clone();
            tokio::spawn(run_worker(n, fetcher, work_rx, completions))
        })
        .collect()
}

async fn run_worker(
    n: usize,
    fetcher: Arc<RangeFetcher>,
    work_rx: SharedWorkReceiver,
    completions: mpsc::Sender<CompletionResult>,
) {
    loop {
        let item = {
            let mut rx = work_rx.lock().await;
            rx.recv().await
        };
        match item {
            Some(Some(interval)) => {
                if let Err(e) = fetcher.fetch(&interval).await {
                    if !matches!(e, DownloadError::Cancelled) {
                        log::error!(
                            "worker {}: interval [{}, {}) failed: {}",
                            n,
                            interval.begin,
                            interval.end,
                            e
                        );
                    }
                    let _ = completions.send(Err(e)).await;
                    return;
                }
            }
            // sentinel, or the producer dropped the queue
            Some(None) | None => return,
        }
    }
}
