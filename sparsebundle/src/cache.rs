//! Shared cache of open band descriptors.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

/// Used when the descriptor limit cannot be queried.
pub const DEFAULT_MAX_OPEN_FILES: u64 = 1024;

pub const DEFAULT_ZERO_SOURCE: &str = "/dev/zero";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Ceiling on open descriptors. The cache is reset before an insertion
    /// would bring it to this many entries.
    pub max_open_files: u64,
    /// Source of infinite zero bytes used to pad unwritten regions.
    pub zero_source: PathBuf,
}

impl CacheConfig {
    /// Configuration with the ceiling taken from the process's soft
    /// `RLIMIT_NOFILE`, read once here.
    pub fn from_rlimit() -> CacheConfig {
        CacheConfig {
            max_open_files: open_file_limit(),
            ..CacheConfig::default()
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            zero_source: PathBuf::from(DEFAULT_ZERO_SOURCE),
        }
    }
}

/// Soft limit on open file descriptors for this process.
// rlim_t is not u64 on every platform.
#[allow(clippy::unnecessary_cast)]
pub fn open_file_limit() -> u64 {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };

    // SAFETY: getrlimit only writes into the struct we hand it.
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if ret != 0 {
        tracing::warn!(
            error = %io::Error::last_os_error(),
            fallback = DEFAULT_MAX_OPEN_FILES,
            "could not query open file limit"
        );
        return DEFAULT_MAX_OPEN_FILES;
    }

    limit.rlim_cur as u64
}

#[derive(Default)]
struct Entries {
    files: HashMap<PathBuf, Arc<File>>,
    evictions: u64,
}

impl Entries {
    fn clear(&mut self) -> usize {
        let closed = self.files.len();
        self.files.clear();
        self.evictions += 1;
        closed
    }
}

/// Map from band path to an open, read-only descriptor.
///
/// Lookup, insertion and eviction all happen under one lock, so a reader
/// never sees a cache that is partially torn down. Descriptors are handed
/// out as `Arc<File>`: eviction drops the cache's reference and the file is
/// closed once the last in-flight read using it finishes. Readers must use
/// positioned reads, as the descriptor is shared.
pub struct DescriptorCache {
    config: CacheConfig,
    entries: Mutex<Entries>,
}

impl DescriptorCache {
    pub fn new(config: CacheConfig) -> DescriptorCache {
        DescriptorCache {
            config,
            entries: Mutex::new(Entries::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns the cached descriptor for `path`, opening it read-only on first
    /// use. `Ok(None)` means the file does not exist, which callers treat as
    /// an unwritten region. Absence is not remembered.
    pub fn acquire(&self, path: &Path) -> io::Result<Option<Arc<File>>> {
        let mut entries = self.entries.lock();

        if let Some(file) = entries.files.get(path) {
            return Ok(Some(Arc::clone(file)));
        }

        if entries.files.len() as u64 + 1 >= self.config.max_open_files {
            let closed = entries.clear();
            tracing::debug!(
                closed,
                limit = self.config.max_open_files,
                "descriptor limit reached, evicted all cached descriptors"
            );
        }

        match File::open(path) {
            Ok(file) => {
                let file = Arc::new(file);
                entries.files.insert(path.to_path_buf(), Arc::clone(&file));
                tracing::trace!(path = %path.display(), cached = entries.files.len(), "opened descriptor");
                Ok(Some(file))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The shared zero source, opened through the cache like any band. Unlike
    /// a band, a missing zero source is an `ENOENT` error.
    pub fn zero_source(&self) -> io::Result<Arc<File>> {
        self.acquire(&self.config.zero_source)?
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    /// Closes every cached descriptor. Safe to call on an empty cache.
    pub fn evict_all(&self) {
        let closed = self.entries.lock().clear();
        tracing::debug!(closed, "evicted all cached descriptors");
    }

    pub fn len(&self) -> usize {
        self.entries.lock().files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().files.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.lock().files.contains_key(path)
    }

    /// Number of full resets so far, from either limit pressure or last close.
    pub fn evictions(&self) -> u64 {
        self.entries.lock().evictions
    }
}

impl std::fmt::Debug for DescriptorCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorCache")
            .field("config", &self.config)
            .field("cached", &self.len())
            .finish_non_exhaustive()
    }
}
