use std::sync::Arc;

use tracing::debug;

use crate::{
    error::{Result, StoreError},
    PageId,
};

use super::{CacheHints, PageCache, PageView};

/// Per-worker access to the page cache. Holds at most one page at a time.
#[derive(Debug)]
pub struct CacheHandle {
    cache: Arc<PageCache>,
    held: Option<usize>,
}

impl CacheHandle {
    pub(super) fn new(cache: Arc<PageCache>) -> Self {
        Self { cache, held: None }
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    /// Locks `page` in the cache and returns a view of it. The page stays
    /// resident until [`CacheHandle::finish`].
    pub fn start(&mut self, page: PageId) -> Result<PageView<'_>> {
        if let Some(slot) = self.held {
            return Err(StoreError::invalid(format!(
                "handle still holds slot {slot}, finish it before starting page {page}"
            )));
        }
        let slot = self.cache.lock_slot(page)?;
        self.held = Some(slot);
        Ok(PageView {
            cache: &self.cache,
            slot,
            page,
        })
    }

    /// Releases the page taken by the last `start`.
    pub fn finish(&mut self) {
        match self.held.take() {
            Some(slot) => self.cache.unlock_slot(slot),
            None => debug!("finish without a started page"),
        }
    }

    /// Runs `f` on `page` between `start` and `finish`, then attaches `hints`.
    pub fn with_page<T, F>(&mut self, page: PageId, hints: CacheHints, f: F) -> Result<T>
    where
        F: FnOnce(&PageView<'_>) -> Result<T>,
    {
        let result = {
            let view = self.start(page)?;
            let result = f(&view);
            if !hints.is_empty() {
                view.set_hint(hints);
            }
            result
        };
        self.finish();
        result
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        if let Some(slot) = self.held.take() {
            debug!(slot, "cache handle dropped while holding a page");
            self.cache.unlock_slot(slot);
        }
    }
}
