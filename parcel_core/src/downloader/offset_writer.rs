//! Positional writes into the preallocated output file.
//!
//! Every worker writes through its own clone of `OffsetWriter`; the OS file
//! is the only shared resource. Regular files use `pwrite`-style positional
//! I/O with no shared cursor, so disjoint-offset writes may race freely.
//! Non-regular destinations (FIFO, character device) cannot seek; those
//! degrade to sequential writes behind a mutex, which matches the ascending
//! dispatch order of the single worker such destinations get.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::types::types::DownloadError;

/// Ensure the file at `path` exists with length exactly `length`.
///
/// Idempotent: an existing regular file already at `length` is left
/// untouched. A non-regular destination cannot have its length set; that
/// is reported as `NotRegular` and the caller proceeds with relaxed size
/// checks.
pub fn preallocate(path: &Path, length: u64) -> Result<(), DownloadError> {
    match fs::metadata(path) {
        Ok(meta) if !meta.is_file() => return Err(DownloadError::NotRegular),
        Ok(meta) if meta.len() == length => return Ok(()),
        _ => {}
    }
    let file = OpenOptions::new().write(true).create(true).open(path)?;
    file.set_len(length)?;
    Ok(())
}

struct WriterInner {
    file: File,
    regular: bool,
    // serializes writes on destinations that cannot seek
    stream_guard: Mutex<()>,
}

#[derive(Clone)]
pub struct OffsetWriter {
    inner: Arc<WriterInner>,
}

impl OffsetWriter {
    pub fn open(path: &Path, regular: bool) -> Result<Self, DownloadError> {
        let file = OpenOptions::new().write(true).create(true).open(path)?;
        Ok(Self {
            inner: Arc::new(WriterInner {
                file,
                regular,
                stream_guard: Mutex::new(()),
            }),
        })
    }

    /// Write all of `buf` at `offset` without blocking the async runtime.
    pub async fn write_at(&self, offset: u64, buf: Vec<u8>) -> io::Result<()> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.write_all_at(offset, &buf))
            .await
            .map_err(io::Error::other)?
    }
}

impl WriterInner {
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        if !self.regular {
            use std::io::Write;
            let _guard = self.stream_guard.lock().unwrap();
            return (&self.file).write_all(buf);
        }

        let mut written = 0usize;
        while written < buf.len() {
            match positional_write(&self.file, offset + written as u64, &buf[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "positional write returned 0 bytes",
                    ));
                }
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn positional_write(file: &File, offset: u64, buf: &[u8]) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn positional_write(file: &File, offset: u64, buf: &[u8]) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(buf, offset)
}
