//! Numbered output directories (`logs-1`, `logs-2`, ...).
//!
//! No counter is persisted: every call re-scans the parent directory, so the
//! allocator stays correct across crashes and across processes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{HarnessError, Result};

#[derive(Debug, Clone)]
pub struct SequenceAllocator {
    root: PathBuf,
    prefix: String,
}

impl SequenceAllocator {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
        }
    }

    fn index_of(&self, name: &str) -> Option<u64> {
        name.strip_prefix(&self.prefix)?
            .strip_prefix('-')?
            .parse()
            .ok()
    }

    /// Highest index in use. Plain files holding a name still occupy it.
    fn max_index(&self, dirs_only: bool) -> Result<Option<u64>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(HarnessError::io(&self.root, e)),
        };

        let mut max = None;
        for entry in entries {
            let entry = entry.map_err(|e| HarnessError::io(&self.root, e))?;
            if dirs_only && !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(index) = name.to_str().and_then(|n| self.index_of(n)) {
                max = max.max(Some(index));
            }
        }
        Ok(max)
    }

    fn path_for(&self, index: u64) -> PathBuf {
        self.root.join(format!("{}-{}", self.prefix, index))
    }

    /// Path the next call to [`allocate`](Self::allocate) would create.
    pub fn peek_next(&self) -> Result<PathBuf> {
        Ok(self.path_for(self.max_index(false)?.map_or(1, |m| m + 1)))
    }

    /// Most recently allocated directory, compared numerically.
    pub fn latest(&self) -> Result<Option<PathBuf>> {
        Ok(self.max_index(true)?.map(|m| self.path_for(m)))
    }

    /// Create and return the next unused directory.
    pub fn allocate(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.root).map_err(|e| HarnessError::io(&self.root, e))?;
        loop {
            let next = self.peek_next()?;
            match fs::create_dir(&next) {
                Ok(()) => {
                    debug!("Allocated {}", next.display());
                    return Ok(next);
                }
                // Someone else took this index between scan and create.
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(HarnessError::io(&next, e)),
            }
        }
    }
}

/// Convenience for callers that only need the path.
pub fn allocate_dir(root: &Path, prefix: &str) -> Result<PathBuf> {
    SequenceAllocator::new(root, prefix).allocate()
}
