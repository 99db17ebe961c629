/// Per-file size bookkeeping for incremental tail reads.
///
/// Each watched file remembers the size it had at the last observation.
/// A new observation yields the byte range that was appended since then.
/// A smaller size means the file was truncated or replaced, and reading
/// restarts at byte 0.
use std::path::{Path, PathBuf};

/// Inclusive byte range `[start, end]` of newly appended content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

/// A monitored file and the size it had when last observed.
#[derive(Debug, Clone)]
pub struct WatchedFile {
    path: PathBuf,
    last_size: u64,
}

impl WatchedFile {
    pub fn new(path: impl Into<PathBuf>, initial_size: u64) -> Self {
        Self {
            path: path.into(),
            last_size: initial_size,
        }
    }

    /// Seed from the file's current size so existing content is not replayed.
    /// A missing or unreadable file starts at 0.
    pub fn from_current_size(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let size = match std::fs::metadata(&path) {
            Ok(m) => m.len(),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "watched file not readable at startup, starting from offset 0"
                );
                0
            }
        };
        Self::new(path, size)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_size(&self) -> u64 {
        self.last_size
    }

    /// Compute the range to read for a newly observed size.
    ///
    /// Returns `None` when the size is unchanged (nothing to read) or the file
    /// became empty. `last_size` is updated unconditionally: the returned range
    /// is handed out once, whether or not the caller's read succeeds.
    pub fn compute_delta(&mut self, observed_size: u64) -> Option<ByteRange> {
        if observed_size == self.last_size {
            return None;
        }

        let start = if observed_size < self.last_size {
            tracing::debug!(
                path = %self.path.display(),
                last_size = self.last_size,
                observed_size,
                "file shrank, reading from start"
            );
            0
        } else {
            self.last_size
        };
        self.last_size = observed_size;

        if observed_size == 0 {
            return None;
        }
        Some(ByteRange {
            start,
            end: observed_size - 1,
        })
    }
}
