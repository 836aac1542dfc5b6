//! Per-file download coordination.
//!
//! The coordinator asks the data server for a file's metadata, derives the
//! output and state paths, constructs the segment producer, launches the
//! worker pool, and blocks until the producer declares the file covered.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use reqwest::{header, Client, StatusCode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::ClientConfig;
use crate::downloader::filename::extract_filename;
use crate::downloader::offset_writer::{self, OffsetWriter};
use crate::downloader::range_fetcher::RangeFetcher;
use crate::downloader::segment_producer::SegmentProducer;
use crate::downloader::worker;
use crate::progress::{format_bytes, ProgressNotifier, ProgressObserver};
use crate::types::types::{DownloadError, FileDescriptor, FileInfo};

pub struct DownloadCoordinator {
    config: Arc<ClientConfig>,
    client: Client,
    cancel: CancellationToken,
    observers: Vec<Arc<dyn ProgressObserver>>,
}

impl DownloadCoordinator {
    pub fn new(
        config: Arc<ClientConfig>,
        client: Client,
        cancel: CancellationToken,
        observers: Vec<Arc<dyn ProgressObserver>>,
    ) -> Self {
        Self {
            config,
            client,
            cancel,
            observers,
        }
    }

    /// Download one file to completion (or resume it to completion).
    pub async fn download_file(&self, file_id: &str) -> Result<(), DownloadError> {
        let started = Instant::now();
        let url = join_url(&self.config.base_uri, file_id);

        let info = self.request_file_information(&url).await?;
        let (output_path, state_path) = self.derive_paths(file_id, info.file_name.as_deref());
        print_download_information(file_id, &info, &output_path);

        if info.size == 0 {
            offset_writer::preallocate(&output_path, 0)?;
            log::info!("{}: empty file, nothing to download", file_id);
            return Ok(());
        }

        let worker_count = effective_workers(
            self.config.worker_count,
            info.size,
            self.config.small_file_threshold,
        );
        let desc = FileDescriptor {
            file_id: file_id.to_string(),
            file_name: info.file_name.clone(),
            total_size: info.size,
            output_path,
            state_path,
            worker_count,
            segment_md5sums: self.config.segment_md5sums,
        };

        // state load and checksum scans are blocking file I/O
        let save_interval = self.config.save_interval;
        let construct_desc = desc.clone();
        let mut producer =
            tokio::task::spawn_blocking(move || SegmentProducer::new(construct_desc, save_interval))
                .await
                .map_err(|e| DownloadError::Worker(e.to_string()))??;

        if producer.is_already_complete() {
            return Ok(());
        }

        // progress pipeline: producer -> notifier task -> observers
        let (progress_tx, progress_rx) = mpsc::channel(256);
        producer.set_progress_tx(progress_tx.clone());
        let notifier = ProgressNotifier::new(
            file_id.to_string(),
            info.size,
            self.observers.clone(),
        );
        let notifier_handle = tokio::spawn(notifier.run(progress_rx));

        let writer = OffsetWriter::open(&desc.output_path, producer.is_regular_file())?;
        let fetcher = Arc::new(RangeFetcher {
            client: self.client.clone(),
            host: host_of(&url),
            url,
            token: self.config.token.clone(),
            total_size: info.size,
            chunk_size: self.config.http_chunk_size,
            transport_retries: self.config.transport_retries,
            mismatch_retries: self.config.mismatch_retries,
            segment_md5sums: self.config.segment_md5sums,
            writer,
            completions: producer.take_completion_sender(),
            cancel: self.cancel.clone(),
        });

        let work_rx = producer.take_work_receiver();
        let worker_completions = fetcher.completions.clone();
        let handles = worker::spawn_workers(worker_count, fetcher, work_rx, worker_completions);

        let outcome = producer.wait_for_completion().await;
        for handle in handles {
            let _ = handle.await;
        }

        // close the progress channel so the notifier can finish
        if let Err(e) = &outcome {
            let _ = progress_tx.try_send(Err(e.to_string()));
        }
        drop(progress_tx);
        producer.clear_progress_tx();
        let _ = notifier_handle.await;

        outcome?;

        let complete = producer.size_complete();
        if complete != info.size {
            return Err(DownloadError::Incomplete {
                complete,
                total: info.size,
            });
        }

        let elapsed = started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            let gbps = (info.size as f64 * 8.0 / 1e9) / elapsed;
            log::info!(
                "{}: download complete, {:.2} Gbps average ({:.2}s)",
                file_id,
                gbps,
                elapsed
            );
        }
        Ok(())
    }

    /// Metadata request: read `Content-Length` and the attachment filename
    /// from the headers, then drop the connection without consuming the
    /// body. The bytes themselves come later, range by range.
    async fn request_file_information(&self, url: &str) -> Result<FileInfo, DownloadError> {
        let response = self
            .client
            .get(url)
            .header("X-Auth-Token", &self.config.token)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(DownloadError::Auth(status));
        }
        if !status.is_success() {
            return Err(DownloadError::HttpStatus(status));
        }

        let size = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or(DownloadError::MissingLength)?;

        let file_name = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(extract_filename);

        drop(response);
        Ok(FileInfo { size, file_name })
    }

    fn derive_paths(&self, file_id: &str, file_name: Option<&str>) -> (PathBuf, PathBuf) {
        let stem = match file_name {
            Some(name) => format!("{}_{}", file_id, name),
            None => file_id.to_string(),
        };
        let output = self.config.directory.join(&stem);
        let state = self.config.directory.join(format!(".{}.parcel", stem));
        (output, state)
    }
}

fn join_url(base: &str, file_id: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), file_id)
}

fn host_of(url: &str) -> Option<String> {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

/// Small files are not worth fanning out; one worker takes the whole range.
fn effective_workers(requested: usize, total_size: u64, small_file_threshold: u64) -> usize {
    if total_size < small_file_threshold {
        1
    } else {
        requested.max(1)
    }
}

fn print_download_information(file_id: &str, info: &FileInfo, output_path: &std::path::Path) {
    log::info!("{}", "-".repeat(40));
    log::info!("starting download   : {}", file_id);
    log::info!(
        "file name           : {}",
        info.file_name.as_deref().unwrap_or("untitled")
    );
    log::info!(
        "download size       : {} B ({})",
        info.size,
        format_bytes(info.size)
    );
    log::info!("downloading file to : {}", output_path.display());
}
