//! Authenticated HTTP range fetching.
//!
//! Each worker drives one `fetch` at a time: a `Range` GET for a half-open
//! interval, streamed in fixed-size chunks that are written at their file
//! offsets and acknowledged on the completion queue. Transient transport
//! faults retry with exponential backoff; a short or oversized body retries
//! the whole interval.

use std::time::Duration;

use futures::StreamExt;
use reqwest::header;
use reqwest::{Client, StatusCode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::downloader::offset_writer::OffsetWriter;
use crate::interval::Interval;
use crate::types::types::{CompletionRecord, CompletionResult, DownloadError, SegmentDigest};

pub struct RangeFetcher {
    pub client: Client,
    /// Fully joined object URL (`{base_uri}/{file_id}`).
    pub url: String,
    /// Explicit `Host` header value; range requests fail on some servers
    /// without it.
    pub host: Option<String>,
    pub token: String,
    pub total_size: u64,
    pub chunk_size: usize,
    pub transport_retries: u32,
    pub mismatch_retries: u32,
    pub segment_md5sums: bool,
    pub writer: OffsetWriter,
    pub completions: mpsc::Sender<CompletionResult>,
    pub cancel: CancellationToken,
}

impl RangeFetcher {
    /// Download `interval`, writing every chunk at its offset and
    /// acknowledging it on the completion queue. Returns the byte count,
    /// which equals `interval.len()` on success.
    pub async fn fetch(&self, interval: &Interval) -> Result<u64, DownloadError> {
        let expected = interval.len();
        let mut attempts = 0u32;
        loop {
            match self.fetch_once(interval).await {
                Ok(written) if written == expected => return Ok(written),
                Ok(written) => {
                    attempts += 1;
                    log::warn!(
                        "transfer size incorrect for [{}, {}): {} != {} expected (attempt {})",
                        interval.begin,
                        interval.end,
                        written,
                        expected,
                        attempts
                    );
                    if attempts > self.mismatch_retries {
                        return Err(DownloadError::SizeMismatch {
                            expected,
                            actual: written,
                        });
                    }
                }
                Err(DownloadError::SizeMismatch { expected, actual }) => {
                    attempts += 1;
                    log::warn!(
                        "range [{}, {}) came back wrong-sized ({} != {}), attempt {}",
                        interval.begin,
                        interval.end,
                        actual,
                        expected,
                        attempts
                    );
                    if attempts > self.mismatch_retries {
                        return Err(DownloadError::SizeMismatch { expected, actual });
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One pass over the interval, with the transport retry policy applied.
    async fn fetch_once(&self, interval: &Interval) -> Result<u64, DownloadError> {
        let mut attempts = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            match self.stream_interval(interval).await {
                Ok(written) => return Ok(written),
                Err(e) if is_transient(&e) => {
                    attempts += 1;
                    if attempts > self.transport_retries {
                        return Err(e);
                    }
                    log::warn!(
                        "retrying range [{}, {}) after transport fault ({} of {}): {}",
                        interval.begin,
                        interval.end,
                        attempts,
                        self.transport_retries,
                        e
                    );
                    backoff(attempts).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn stream_interval(&self, interval: &Interval) -> Result<u64, DownloadError> {
        // Half-open internally, inclusive on the wire.
        let range = format!("bytes={}-{}", interval.begin, interval.end - 1);
        log::debug!("reading range [{}]", range);

        let mut request = self
            .client
            .get(&self.url)
            .header("X-Auth-Token", &self.token)
            .header(header::RANGE, &range);
        if let Some(host) = &self.host {
            request = request.header(header::HOST, host);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(DownloadError::Auth(status));
        }
        if !status.is_success() {
            return Err(DownloadError::HttpStatus(status));
        }
        // 200 on a sub-range request means the server ignored Range and is
        // sending the file from byte zero; those bytes must not land at
        // this interval's offsets.
        let whole_file = interval.begin == 0 && interval.end == self.total_size;
        if status == StatusCode::OK && !whole_file {
            return Err(DownloadError::SizeMismatch {
                expected: interval.len(),
                actual: response.content_length().unwrap_or(0),
            });
        }

        let expected = interval.len();
        let mut written: u64 = 0;
        let mut pending: Vec<u8> = Vec::with_capacity(self.chunk_size);
        let mut stream = response.bytes_stream();

        while let Some(next) = stream.next().await {
            if self.cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            let chunk = next?;
            if chunk.is_empty() {
                // keep-alives, not data
                continue;
            }
            // Never write past the interval; a server that over-delivers
            // must not clobber a neighbor's bytes.
            let room = expected - written - pending.len() as u64;
            let usable = (chunk.len() as u64).min(room) as usize;
            pending.extend_from_slice(&chunk[..usable]);
            while pending.len() >= self.chunk_size {
                let block: Vec<u8> = pending.drain(..self.chunk_size).collect();
                written += self.commit(interval.begin + written, block).await?;
            }
            if usable < chunk.len() {
                break;
            }
        }
        if !pending.is_empty() {
            let block = std::mem::take(&mut pending);
            written += self.commit(interval.begin + written, block).await?;
        }
        Ok(written)
    }

    /// Write one chunk at `offset`, then acknowledge it. The record is only
    /// emitted after the bytes are on disk.
    async fn commit(&self, offset: u64, block: Vec<u8>) -> Result<u64, DownloadError> {
        let length = block.len() as u64;
        let digest = self
            .segment_md5sums
            .then(|| SegmentDigest::of(&block));
        self.writer.write_at(offset, block).await?;
        let record = CompletionRecord {
            offset,
            length,
            digest,
        };
        if self.completions.send(Ok(record)).await.is_err() {
            // producer is gone; nothing left to report to
            return Err(DownloadError::Cancelled);
        }
        Ok(length)
    }
}

fn is_transient(error: &DownloadError) -> bool {
    match error {
        DownloadError::Transport(_) => true,
        DownloadError::HttpStatus(status) => status.is_server_error(),
        _ => false,
    }
}

/// 100ms, 200ms, 400ms, ... capped.
async fn backoff(attempt: u32) {
    let delay_ms = 100u64 * (1u64 << attempt.min(5));
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
}
