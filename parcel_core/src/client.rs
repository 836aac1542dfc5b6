//! The batch driver and its configuration.
//!
//! `HttpClient` is the public entry point: construct it once against a data
//! server, register observers, then hand it a set of identifiers. Files
//! download sequentially; each file fans out internally across the worker
//! pool. Per-file failures are captured in the report and do not abort the
//! batch.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::downloader::coordinator::DownloadCoordinator;
use crate::progress::ProgressObserver;
use crate::types::types::DownloadError;

/// Bytes streamed per HTTP chunk (1 MiB).
pub const HTTP_CHUNK_SIZE: usize = 1024 * 1024;

/// Bytes of newly completed work between state-file saves.
pub const SAVE_INTERVAL: u64 = 1_000_000;

/// Files smaller than this get a single worker (10 MiB).
pub const SMALL_FILE_THRESHOLD: u64 = 10 * 1024 * 1024;

const DEFAULT_WORKER_COUNT: usize = 8;
const DEFAULT_TRANSPORT_RETRIES: u32 = 16;
const DEFAULT_MISMATCH_RETRIES: u32 = 3;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_uri: String,
    pub token: String,
    pub worker_count: usize,
    pub directory: PathBuf,
    pub debug: bool,
    pub http_chunk_size: usize,
    pub save_interval: u64,
    pub segment_md5sums: bool,
    pub download_related_files: bool,
    pub download_annotations: bool,
    pub small_file_threshold: u64,
    pub transport_retries: u32,
    pub mismatch_retries: u32,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

/// Outcome of one batch: which identifiers landed on disk, and why the
/// rest did not.
#[derive(Debug, Default)]
pub struct DownloadReport {
    pub downloaded: BTreeSet<String>,
    pub errors: BTreeMap<String, String>,
}

pub struct HttpClient {
    config: Arc<ClientConfig>,
    http: Client,
    cancel: CancellationToken,
    observers: Vec<Arc<dyn ProgressObserver>>,
}

pub struct HttpClientBuilder {
    config: ClientConfig,
}

impl HttpClient {
    pub fn builder(base_uri: impl Into<String>, token: impl Into<String>) -> HttpClientBuilder {
        HttpClientBuilder::new(base_uri, token)
    }

    /// Register a progress observer. Must be called before `download()`.
    pub fn add_observer(&mut self, observer: Arc<dyn ProgressObserver>) {
        self.observers.push(observer);
    }

    /// The token that cancels every in-flight download. The producer still
    /// saves its state on the way out, so progress is preserved.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Download a set of identifiers. Duplicates collapse; identifiers
    /// discovered through related-file lookups join the queue when that
    /// option is on.
    pub async fn download(
        &self,
        file_ids: impl IntoIterator<Item = String>,
    ) -> DownloadReport {
        let mut report = DownloadReport::default();
        let mut seen: BTreeSet<String> = file_ids.into_iter().collect();

        if seen.is_empty() {
            log::warn!("no file ids given");
            return report;
        }
        for file_id in &seen {
            log::info!("given file id: {}", file_id);
        }

        let coordinator = DownloadCoordinator::new(
            Arc::clone(&self.config),
            self.http.clone(),
            self.cancel.clone(),
            self.observers.clone(),
        );

        let mut queue: VecDeque<String> = seen.iter().cloned().collect();
        while let Some(file_id) = queue.pop_front() {
            match coordinator.download_file(&file_id).await {
                Ok(()) => {
                    report.downloaded.insert(file_id.clone());
                    if self.config.download_annotations {
                        if let Err(e) = self.fetch_annotations(&file_id).await {
                            log::warn!("unable to fetch annotations for {}: {}", file_id, e);
                        }
                    }
                    if self.config.download_related_files {
                        match self.related_files(&file_id).await {
                            Ok(related) => {
                                for related_id in related {
                                    if seen.insert(related_id.clone()) {
                                        log::info!(
                                            "queueing related file {} of {}",
                                            related_id,
                                            file_id
                                        );
                                        queue.push_back(related_id);
                                    }
                                }
                            }
                            Err(e) => {
                                log::warn!(
                                    "unable to list related files for {}: {}",
                                    file_id,
                                    e
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    log::error!("{}: {}", file_id, e);
                    report.errors.insert(file_id, e.to_string());
                    if self.config.debug {
                        break;
                    }
                }
            }
        }

        self.print_summary(&report);
        report
    }

    /// Ask the secondary metadata endpoint which other identifiers belong
    /// with this file. Servers without the endpoint report none.
    async fn related_files(&self, file_id: &str) -> Result<Vec<String>, DownloadError> {
        #[derive(Deserialize)]
        struct RelatedDocument {
            #[serde(default)]
            related_files: Vec<String>,
        }

        let url = format!(
            "{}/{}/related",
            self.config.base_uri.trim_end_matches('/'),
            file_id
        );
        let response = self
            .http
            .get(&url)
            .header("X-Auth-Token", &self.config.token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(DownloadError::HttpStatus(response.status()));
        }
        let bytes = response.bytes().await?;
        let document: RelatedDocument = serde_json::from_slice(&bytes)
            .map_err(|e| DownloadError::BadResponse(e.to_string()))?;
        Ok(document.related_files)
    }

    /// Persist the file's annotation document next to the download.
    async fn fetch_annotations(&self, file_id: &str) -> Result<(), DownloadError> {
        let url = format!(
            "{}/{}/annotations",
            self.config.base_uri.trim_end_matches('/'),
            file_id
        );
        let response = self
            .http
            .get(&url)
            .header("X-Auth-Token", &self.config.token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(DownloadError::HttpStatus(response.status()));
        }
        let bytes = response.bytes().await?;
        let path = self
            .config
            .directory
            .join(format!("{}.annotations.json", file_id));
        tokio::fs::write(&path, &bytes).await?;
        log::info!("saved annotations for {} to {}", file_id, path.display());
        Ok(())
    }

    fn print_summary(&self, report: &DownloadReport) {
        log::info!(
            "batch finished: {} downloaded, {} failed",
            report.downloaded.len(),
            report.errors.len()
        );
        for file_id in &report.downloaded {
            log::info!("downloaded: {}", file_id);
        }
        for (file_id, reason) in &report.errors {
            log::warn!("failed: {}: {}", file_id, reason);
        }
    }
}

impl HttpClientBuilder {
    pub fn new(base_uri: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            config: ClientConfig {
                base_uri: base_uri.into(),
                token: token.into(),
                worker_count: DEFAULT_WORKER_COUNT,
                directory: PathBuf::from("."),
                debug: false,
                http_chunk_size: HTTP_CHUNK_SIZE,
                save_interval: SAVE_INTERVAL,
                segment_md5sums: false,
                download_related_files: false,
                download_annotations: false,
                small_file_threshold: SMALL_FILE_THRESHOLD,
                transport_retries: DEFAULT_TRANSPORT_RETRIES,
                mismatch_retries: DEFAULT_MISMATCH_RETRIES,
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                read_timeout: DEFAULT_READ_TIMEOUT,
            },
        }
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.config.worker_count = worker_count.max(1);
        self
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.config.directory = directory.into();
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    pub fn with_http_chunk_size(mut self, bytes: usize) -> Self {
        self.config.http_chunk_size = bytes.max(1);
        self
    }

    pub fn with_save_interval(mut self, bytes: u64) -> Self {
        self.config.save_interval = bytes.max(1);
        self
    }

    pub fn with_segment_md5sums(mut self, enabled: bool) -> Self {
        self.config.segment_md5sums = enabled;
        self
    }

    pub fn with_download_related_files(mut self, enabled: bool) -> Self {
        self.config.download_related_files = enabled;
        self
    }

    pub fn with_download_annotations(mut self, enabled: bool) -> Self {
        self.config.download_annotations = enabled;
        self
    }

    pub fn with_small_file_threshold(mut self, bytes: u64) -> Self {
        self.config.small_file_threshold = bytes;
        self
    }

    pub fn with_transport_retries(mut self, retries: u32) -> Self {
        self.config.transport_retries = retries;
        self
    }

    pub fn with_mismatch_retries(mut self, retries: u32) -> Self {
        self.config.mismatch_retries = retries;
        self
    }

    pub fn build(self) -> Result<HttpClient, DownloadError> {
        let http = Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .read_timeout(self.config.read_timeout)
            .pool_max_idle_per_host(self.config.worker_count)
            .tcp_nodelay(true)
            .no_gzip()
            .no_deflate()
            .no_brotli()
            .build()?;
        Ok(HttpClient {
            config: Arc::new(self.config),
            http,
            cancel: CancellationToken::new(),
            observers: Vec::new(),
        })
    }
}
