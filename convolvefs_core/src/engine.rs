//! The engine façade the filesystem bridge talks to.
//!
//! [`ConvolveFs`] owns the handler cache and the filter-directory
//! configuration. The bridging layer calls
//! [`ConvolveFs::create_handler`] on open, reads and stats through the
//! returned handler, [`ConvolveFs::stat_by_filename`] for paths it only
//! knows by name, and [`ConvolveFs::close`] on release.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info};

use crate::cache::FileHandlerCache;
use crate::handler::{FileHandler, FileStat, PassThroughHandler, SndFileHandler};
use crate::EngineError;

pub struct ConvolveFs {
    filter_dir: PathBuf,
    cache: FileHandlerCache,
    total_openings: AtomicU64,
    total_reopens: AtomicU64,
}

impl ConvolveFs {
    /// One-shot engine construction; `filter_dir` holds the
    /// `filter-<rate>-<bits>-<channels>.conf` files.
    pub fn new(filter_dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let filter_dir = filter_dir.into();
        if !filter_dir.is_dir() {
            return Err(EngineError::BadFilterDirectory(filter_dir));
        }
        info!("serving filters from {}", filter_dir.display());
        Ok(Self {
            filter_dir,
            cache: FileHandlerCache::new(),
            total_openings: AtomicU64::new(0),
            total_reopens: AtomicU64::new(0),
        })
    }

    pub fn filter_dir(&self) -> &Path {
        &self.filter_dir
    }

    /// Open `underlying` for the virtual path `fs_path` and return a
    /// pinned handler: convolving when the file is recognised audio with
    /// a configured filter, pass-through otherwise. Concurrent opens of
    /// one path share a handler.
    ///
    /// Every successful call owes one [`ConvolveFs::close`].
    pub fn create_handler(
        &self,
        fs_path: &str,
        underlying: &Path,
    ) -> Result<Arc<dyn FileHandler>, EngineError> {
        if let Some(handler) = self.cache.find_and_pin(fs_path) {
            self.total_reopens.fetch_add(1, Ordering::Relaxed);
            return Ok(handler);
        }

        let file = File::open(underlying)?;
        self.total_openings.fetch_add(1, Ordering::Relaxed);

        // Handler construction is deliberately outside the cache lock; a
        // racing open of the same path is resolved by insert_pinned.
        let handler: Arc<dyn FileHandler> =
            match SndFileHandler::create(file, fs_path, &self.filter_dir) {
                Ok(handler) => Arc::new(handler),
                Err((file, err)) => {
                    debug!("{fs_path}: {err}; serving pass-through");
                    Arc::new(PassThroughHandler::new(file))
                }
            };
        Ok(self.cache.insert_pinned(fs_path, handler))
    }

    /// Stat a path that may be open. `None` means "not open" and the
    /// caller should stat the underlying file itself.
    pub fn stat_by_filename(&self, fs_path: &str) -> Option<io::Result<FileStat>> {
        let handler = self.cache.find_and_pin(fs_path)?;
        let result = handler.stat();
        self.cache.unpin(fs_path);
        Some(result)
    }

    /// Release one reference on `fs_path`; the final close retires the
    /// handler and releases its resources.
    pub fn close(&self, fs_path: &str) {
        self.cache.unpin(fs_path);
    }

    /// Number of distinct handlers currently open.
    pub fn open_handler_count(&self) -> usize {
        self.cache.len()
    }

    /// Underlying files opened since start (cache misses).
    pub fn total_openings(&self) -> u64 {
        self.total_openings.load(Ordering::Relaxed)
    }

    /// Opens served from an already-open handler.
    pub fn total_reopens(&self) -> u64 {
        self.total_reopens.load(Ordering::Relaxed)
    }
}
