use std::path::PathBuf;

/// Fixed-width MD5 digest over the bytes of one completion record.
///
/// Recorded per flushed HTTP chunk when segment checksums are enabled, and
/// replayed on resume to detect on-disk corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDigest(pub [u8; 16]);

impl SegmentDigest {
    pub fn of(bytes: &[u8]) -> Self {
        Self(md5::compute(bytes).0)
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(32);
        for byte in self.0 {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }
        let mut digest = [0u8; 16];
        for (i, slot) in digest.iter_mut().enumerate() {
            *slot = u8::from_str_radix(&s[2 * i..2 * i + 2], 16).ok()?;
        }
        Some(Self(digest))
    }
}

/// One acknowledged write: `length` bytes at `offset`, already on disk by
/// the time the record is emitted.
#[derive(Debug, Clone)]
pub struct CompletionRecord {
    pub offset: u64,
    pub length: u64,
    pub digest: Option<SegmentDigest>,
}

/// Metadata the data server reports for a file before any range is fetched.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub size: u64,
    pub file_name: Option<String>,
}

/// Everything a single download needs to know about its file. Built by the
/// coordinator from server metadata; immutable afterwards.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub file_id: String,
    pub file_name: Option<String>,
    pub total_size: u64,
    pub output_path: PathBuf,
    pub state_path: PathBuf,
    /// Effective worker count (already clamped for small files).
    pub worker_count: usize,
    pub segment_md5sums: bool,
}

/// Byte-level progress emitted by the producer, one event per completion
/// record absorbed.
#[derive(Debug, Clone, Copy)]
pub struct ProgressEvent {
    pub bytes_delta: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server returned HTTP {0}")]
    HttpStatus(reqwest::StatusCode),
    #[error("authentication rejected (HTTP {0})")]
    Auth(reqwest::StatusCode),
    #[error("disk error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transfer size incorrect: {actual} != {expected} expected")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("destination is not a regular file")]
    NotRegular,
    #[error("state file unreadable: {0}")]
    StateCorrupt(String),
    #[error("metadata response carried no Content-Length")]
    MissingLength,
    #[error("malformed server response: {0}")]
    BadResponse(String),
    #[error("file incomplete: {complete} of {total} bytes")]
    Incomplete { complete: u64, total: u64 },
    #[error("worker failed: {0}")]
    Worker(String),
    #[error("cancelled")]
    Cancelled,
}

/// Workers report either an acknowledged write or the error that killed them.
pub type CompletionResult = Result<CompletionRecord, DownloadError>;
