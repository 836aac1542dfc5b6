//! On-disk serialization of the completed set.
//!
//! The state file is a small JSON document with a required magic header, so
//! a stray or truncated file is rejected instead of trusted. Saves are
//! atomic: write to a `.parcel_<uuid>` sibling, fsync, rename over the
//! state file. A crash leaves either the old state or the new, never a
//! partial one.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::interval::{Interval, IntervalSet};
use crate::types::types::{DownloadError, SegmentDigest};

pub const STATE_MAGIC: &str = "parcel-state";
pub const STATE_VERSION: u32 = 1;

const TEMP_PREFIX: &str = ".parcel_";

#[derive(Serialize, Deserialize)]
struct StateDocument {
    magic: String,
    version: u32,
    intervals: Vec<StateEntry>,
}

#[derive(Serialize, Deserialize)]
struct StateEntry {
    begin: u64,
    end: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    md5: Option<String>,
}

/// Atomically persist `completed` to `state_path`.
pub fn save(state_path: &Path, completed: &IntervalSet) -> Result<(), DownloadError> {
    let document = StateDocument {
        magic: STATE_MAGIC.to_string(),
        version: STATE_VERSION,
        intervals: completed
            .iter()
            .map(|interval| StateEntry {
                begin: interval.begin,
                end: interval.end,
                md5: interval.digest.as_ref().map(SegmentDigest::to_hex),
            })
            .collect(),
    };
    let bytes = serde_json::to_vec(&document).map_err(std::io::Error::other)?;

    let directory = state_path.parent().unwrap_or_else(|| Path::new("."));
    let temp_path = directory.join(format!(
        "{}{}",
        TEMP_PREFIX,
        uuid::Uuid::new_v4().simple()
    ));

    let written = (|| -> std::io::Result<()> {
        let mut temp = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        temp.write_all(&bytes)?;
        temp.sync_all()?;
        drop(temp);
        fs::rename(&temp_path, state_path)?;
        #[cfg(unix)]
        File::open(directory)?.sync_all()?;
        Ok(())
    })();

    if written.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    written.map_err(DownloadError::Io)
}

/// Load and validate a previously saved completed set.
///
/// Any structural problem maps to `StateCorrupt`; callers recover by
/// discarding the state and restarting the download.
pub fn load(state_path: &Path) -> Result<IntervalSet, DownloadError> {
    let bytes = fs::read(state_path)?;
    let document: StateDocument = serde_json::from_slice(&bytes)
        .map_err(|e| DownloadError::StateCorrupt(e.to_string()))?;

    if document.magic != STATE_MAGIC {
        return Err(DownloadError::StateCorrupt(format!(
            "bad magic: {:?}",
            document.magic
        )));
    }
    if document.version != STATE_VERSION {
        return Err(DownloadError::StateCorrupt(format!(
            "unsupported version: {}",
            document.version
        )));
    }

    let mut completed = IntervalSet::new();
    for entry in document.intervals {
        if entry.begin >= entry.end {
            return Err(DownloadError::StateCorrupt(format!(
                "empty interval [{}, {})",
                entry.begin, entry.end
            )));
        }
        let interval = match entry.md5 {
            Some(hex) => {
                let digest = SegmentDigest::from_hex(&hex).ok_or_else(|| {
                    DownloadError::StateCorrupt(format!("bad digest: {:?}", hex))
                })?;
                Interval::with_digest(entry.begin, entry.end, digest)
            }
            None => Interval::new(entry.begin, entry.end),
        };
        completed.insert(interval);
    }
    Ok(completed)
}
