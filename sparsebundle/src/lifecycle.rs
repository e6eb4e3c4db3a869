use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::DescriptorCache;

/// Reference count of logical opens of the image.
///
/// When the last open is released the descriptor cache is emptied, so the
/// next open resolves band files afresh and sees changes made to the bundle
/// while it was closed. Eviction runs while the count is locked, which keeps
/// a concurrent open from slipping in between the count reaching zero and
/// the cache being reset.
#[derive(Debug)]
pub struct OpenLifecycle {
    cache: Arc<DescriptorCache>,
    opened: Mutex<u64>,
}

impl OpenLifecycle {
    pub fn new(cache: Arc<DescriptorCache>) -> OpenLifecycle {
        OpenLifecycle {
            cache,
            opened: Mutex::new(0),
        }
    }

    /// Records an open and returns the new reference count.
    pub fn open(&self) -> u64 {
        let mut opened = self.opened.lock();
        *opened += 1;
        tracing::debug!(references = *opened, "image opened");
        *opened
    }

    /// Records a release and returns the new reference count. A release
    /// with nothing open is ignored.
    pub fn release(&self) -> u64 {
        let mut opened = self.opened.lock();

        match *opened {
            0 => {
                tracing::warn!("release without a matching open, ignoring");
            }
            1 => {
                *opened = 0;
                tracing::debug!("no more references to image, cleaning up");
                self.cache.evict_all();
            }
            _ => {
                *opened -= 1;
                tracing::debug!(references = *opened, "image released");
            }
        }

        *opened
    }

    pub fn references(&self) -> u64 {
        *self.opened.lock()
    }

    pub fn is_open(&self) -> bool {
        self.references() > 0
    }

    pub fn cache(&self) -> &Arc<DescriptorCache> {
        &self.cache
    }
}
