//! The segment scheduler.
//!
//! The producer owns the two interval sets that describe a download — the
//! work pool (still to fetch) and the completed set (already written) —
//! plus the state file that makes the download resumable. It slices the
//! work pool into worker-sized blocks up front, absorbs completion records
//! from the workers, persists the completed set periodically and atomically,
//! and terminates the pool with one sentinel per worker.
//!
//! The two sets partition `[0, total_size)` at every moment: dispatch chops
//! an interval out of the work pool, and its completion record inserts it
//! into the completed set.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::interval::{Interval, IntervalSet};
use crate::state;
use crate::types::types::{
    CompletionResult, DownloadError, FileDescriptor, ProgressEvent, SegmentDigest,
};

/// Work-queue item; `None` tells a worker to exit.
pub type WorkItem = Option<Interval>;

/// The work queue receiver, shared by every worker in the pool.
pub type SharedWorkReceiver = Arc<Mutex<mpsc::UnboundedReceiver<WorkItem>>>;

pub struct SegmentProducer {
    desc: FileDescriptor,
    work_pool: IntervalSet,
    completed: IntervalSet,
    size_complete: u64,
    save_interval: u64,
    block_size: u64,
    is_regular_file: bool,
    already_complete: bool,
    work_tx: mpsc::UnboundedSender<WorkItem>,
    work_rx: Option<SharedWorkReceiver>,
    completion_tx: Option<mpsc::Sender<CompletionResult>>,
    completion_rx: mpsc::Receiver<CompletionResult>,
    progress_tx: Option<mpsc::Sender<Result<ProgressEvent, String>>>,
}

impl SegmentProducer {
    /// Build the producer for one file: reconcile any saved state with the
    /// file on disk, preallocate the output, and dispatch every remaining
    /// block into the work queue.
    ///
    /// Does blocking file I/O (state load, optional checksum scan); callers
    /// on the async runtime wrap construction in `spawn_blocking`.
    pub fn new(desc: FileDescriptor, save_interval: u64) -> Result<Self, DownloadError> {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::channel(256);

        let is_regular_file = match std::fs::metadata(&desc.output_path) {
            Ok(meta) => meta.is_file(),
            // will be created as a regular file
            Err(_) => true,
        };

        let mut producer = Self {
            work_pool: IntervalSet::whole(desc.total_size),
            completed: IntervalSet::new(),
            size_complete: 0,
            save_interval: save_interval.max(1),
            block_size: 0,
            is_regular_file,
            already_complete: false,
            work_tx,
            work_rx: Some(Arc::new(Mutex::new(work_rx))),
            completion_tx: Some(completion_tx),
            completion_rx,
            progress_tx: None,
            desc,
        };

        producer.load_state();
        if producer.is_complete() {
            log::info!("{}: file already complete", producer.desc.file_id);
            producer.already_complete = true;
            return Ok(producer);
        }

        match crate::downloader::offset_writer::preallocate(
            &producer.desc.output_path,
            producer.desc.total_size,
        ) {
            Ok(()) => {}
            Err(DownloadError::NotRegular) => {
                log::warn!(
                    "unable to set length of {}; not a regular file, attempting to proceed",
                    producer.desc.output_path.display()
                );
                producer.is_regular_file = false;
            }
            Err(e) => return Err(e),
        }

        let work_size = producer.work_pool.measure();
        producer.block_size = work_size
            .div_ceil(producer.desc.worker_count.max(1) as u64)
            .max(1);
        producer.schedule();
        Ok(producer)
    }

    /// True when resume found nothing left to do; the coordinator returns
    /// without spawning workers.
    pub fn is_already_complete(&self) -> bool {
        self.already_complete
    }

    pub fn is_regular_file(&self) -> bool {
        self.is_regular_file
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Bytes currently covered by the completed set.
    pub fn size_complete(&self) -> u64 {
        self.size_complete
    }

    /// Inspection of the remaining work (for tests and diagnostics).
    pub fn work_pool(&self) -> &IntervalSet {
        &self.work_pool
    }

    pub fn completed(&self) -> &IntervalSet {
        &self.completed
    }

    /// Hand the shared work-queue receiver to the worker pool. Panics if
    /// taken twice.
    pub fn take_work_receiver(&mut self) -> SharedWorkReceiver {
        self.work_rx.take().expect("work receiver already taken")
    }

    /// Hand the completion sender to the worker pool. The producer keeps no
    /// copy, so the channel closes when the last worker exits.
    pub fn take_completion_sender(&mut self) -> mpsc::Sender<CompletionResult> {
        self.completion_tx
            .take()
            .expect("completion sender already taken")
    }

    /// Inject the progress sender before `wait_for_completion`.
    pub fn set_progress_tx(&mut self, tx: mpsc::Sender<Result<ProgressEvent, String>>) {
        self.progress_tx = Some(tx);
    }

    pub fn clear_progress_tx(&mut self) {
        self.progress_tx = None;
    }

    /// Resume protocol: reconcile a saved completed set with the file on
    /// disk. On any inconsistency the download restarts from scratch; the
    /// work pool stays `[0, total_size)`.
    fn load_state(&mut self) {
        let state_exists = self.desc.state_path.is_file();
        let file_exists = self.desc.output_path.exists();

        if !state_exists {
            if file_exists {
                log::warn!(
                    "a file named {} was found but no state file at {}; either it was downloaded \
                     elsewhere or its state was moved or deleted. Refusing to claim the file is \
                     complete; restarting the download",
                    self.desc.output_path.display(),
                    self.desc.state_path.display()
                );
            }
            return;
        }

        if !file_exists {
            log::warn!(
                "state file found at {} but no file for {}; restarting entire download",
                self.desc.state_path.display(),
                self.desc.file_id
            );
            return;
        }

        log::info!(
            "found state file {}, attempting to resume download",
            self.desc.state_path.display()
        );
        match state::load(&self.desc.state_path) {
            Ok(completed) => self.completed = completed,
            Err(e) => {
                log::error!("unable to resume file state: {}", e);
                self.completed = IntervalSet::new();
                return;
            }
        }

        if self.desc.segment_md5sums {
            self.validate_segment_md5sums();
        }

        self.size_complete = self.completed.measure();
        let covered: Vec<(u64, u64)> = self
            .completed
            .iter()
            .map(|iv| (iv.begin, iv.end))
            .collect();
        for (begin, end) in covered {
            self.work_pool.chop(begin, end);
        }
    }

    /// Re-read every recorded interval from the existing file and drop the
    /// ones whose digest is missing or no longer matches. Dropped ranges are
    /// simply scheduled again; the file itself is kept.
    fn validate_segment_md5sums(&mut self) {
        let mut file = match File::open(&self.desc.output_path) {
            Ok(f) => f,
            Err(e) => {
                log::error!(
                    "unable to open {} for checksum validation: {}; restarting",
                    self.desc.output_path.display(),
                    e
                );
                self.completed = IntervalSet::new();
                return;
            }
        };

        let mut rejected: Vec<(u64, u64)> = Vec::new();
        for interval in self.completed.iter() {
            let valid = match &interval.digest {
                None => {
                    log::error!(
                        "checksum validation requested but interval [{}, {}) recorded no digest",
                        interval.begin,
                        interval.end
                    );
                    false
                }
                Some(recorded) => {
                    match read_exact_range(&mut file, interval.begin, interval.len()) {
                        Ok(bytes) => SegmentDigest::of(&bytes) == *recorded,
                        Err(e) => {
                            log::warn!(
                                "unable to read [{}, {}) for validation: {}",
                                interval.begin,
                                interval.end,
                                e
                            );
                            false
                        }
                    }
                }
            };
            if !valid {
                rejected.push((interval.begin, interval.end));
            }
        }

        for (begin, end) in rejected {
            log::warn!("redownloading corrupt segment [{}, {})", begin, end);
            self.completed.chop(begin, end);
        }
    }

    /// Slice the whole work pool into blocks and enqueue them, ascending.
    fn schedule(&mut self) {
        while let Some(interval) = self.next_interval() {
            log::debug!(
                "dispatching interval [{}, {})",
                interval.begin,
                interval.end
            );
            if self.work_tx.send(Some(interval)).is_err() {
                return;
            }
        }
    }

    fn next_interval(&mut self) -> Option<Interval> {
        let first = self.work_pool.first()?;
        let begin = first.begin;
        let end = first.end.min(begin + self.block_size);
        self.work_pool.chop(begin, end);
        Some(Interval::new(begin, end))
    }

    pub fn is_complete(&self) -> bool {
        self.completed.measure() == self.desc.total_size && self.check_file_exists_and_size()
    }

    fn check_file_exists_and_size(&self) -> bool {
        if self.is_regular_file {
            match std::fs::metadata(&self.desc.output_path) {
                Ok(meta) => meta.is_file() && meta.len() == self.desc.total_size,
                Err(_) => false,
            }
        } else {
            log::debug!("destination is not a regular file, refusing to check size");
            self.desc.output_path.exists()
        }
    }

    /// Absorb completions until the file is covered, persisting every
    /// `save_interval` bytes. Always performs a final save and pushes the
    /// worker sentinels before returning, even on error or cancellation, so
    /// progress up to this point survives.
    pub async fn wait_for_completion(&mut self) -> Result<(), DownloadError> {
        let outcome = self.completion_loop().await;
        // Stop accepting completions so a worker still streaming a
        // duplicate range cannot block on a full queue and miss its
        // sentinel.
        self.completion_rx.close();
        let saved = self.save_state().await;
        self.finish_download();
        match outcome {
            Ok(()) => saved,
            Err(e) => {
                if let Err(save_err) = saved {
                    log::error!("unable to save state: {}", save_err);
                }
                Err(e)
            }
        }
    }

    async fn completion_loop(&mut self) -> Result<(), DownloadError> {
        let mut since_save: u64 = 0;
        while !self.is_complete() {
            while since_save < self.save_interval {
                let record = match self.completion_rx.recv().await {
                    Some(Ok(record)) => record,
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(DownloadError::Worker(
                            "workers exited before the file completed".into(),
                        ))
                    }
                };

                let interval = match record.digest {
                    Some(digest) => Interval::with_digest(
                        record.offset,
                        record.offset + record.length,
                        digest,
                    ),
                    None => Interval::new(record.offset, record.offset + record.length),
                };

                let before = self.size_complete;
                self.completed.insert(interval);
                self.size_complete = self.completed.measure();
                // a retried range can re-report bytes; only new coverage counts
                let delta = self.size_complete - before;
                since_save += delta;
                self.emit_progress(delta);
                if self.is_complete() {
                    break;
                }
            }
            since_save = 0;
            self.save_state().await?;
        }
        Ok(())
    }

    fn emit_progress(&self, bytes_delta: u64) {
        if bytes_delta == 0 {
            return;
        }
        if let Some(tx) = &self.progress_tx {
            let _ = tx.try_send(Ok(ProgressEvent { bytes_delta }));
        }
    }

    async fn save_state(&self) -> Result<(), DownloadError> {
        let completed = self.completed.clone();
        let state_path = self.desc.state_path.clone();
        tokio::task::spawn_blocking(move || state::save(&state_path, &completed))
            .await
            .map_err(|e| DownloadError::Worker(e.to_string()))?
    }

    /// Terminate the pool: one sentinel per worker. Each worker drains any
    /// in-flight interval, sees its sentinel, and exits.
    fn finish_download(&mut self) {
        for _ in 0..self.desc.worker_count {
            let _ = self.work_tx.send(None);
        }
    }
}

fn read_exact_range(file: &mut File, offset: u64, length: u64) -> std::io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; length as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}
