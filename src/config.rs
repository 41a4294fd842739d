use std::time::Duration;

/// Knobs for creating or opening a datafile.
///
/// Layout values (`page_multiplier`, `index_pages`, `structure_pages`) are
/// only honoured by [`crate::Store::create`]; an existing file always wins on
/// open. Everything else is per process.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Page size as a multiple of the OS page size.
    pub page_multiplier: u16,
    /// Number of index pages holding entry records.
    pub index_pages: u16,
    /// Number of pages in the structure chapter.
    pub structure_pages: u16,
    /// Number of page cache slots.
    pub cache_slots: usize,
    /// Fraction of the slot count used as the hint boost in eviction scoring.
    pub cache_boost_ratio: f32,
    /// Number of deleted-page records kept mapped by the allocator.
    pub allocator_window: usize,
    /// Upper bound on any blocking wait. `None` waits forever.
    pub lock_timeout: Option<Duration>,
    /// Hard cap on the file size in pages. `None` grows until the OS refuses.
    pub page_limit: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_multiplier: 1,
            index_pages: 1,
            structure_pages: 1,
            cache_slots: 64,
            cache_boost_ratio: 0.10,
            allocator_window: 4,
            lock_timeout: None,
            page_limit: None,
        }
    }
}

impl StoreConfig {
    pub fn with_page_multiplier(mut self, page_multiplier: u16) -> Self {
        self.page_multiplier = page_multiplier;
        self
    }

    pub fn with_index_pages(mut self, index_pages: u16) -> Self {
        self.index_pages = index_pages;
        self
    }

    pub fn with_structure_pages(mut self, structure_pages: u16) -> Self {
        self.structure_pages = structure_pages;
        self
    }

    pub fn with_cache_slots(mut self, cache_slots: usize) -> Self {
        self.cache_slots = cache_slots;
        self
    }

    pub fn with_cache_boost_ratio(mut self, ratio: f32) -> Self {
        self.cache_boost_ratio = ratio;
        self
    }

    pub fn with_allocator_window(mut self, window: usize) -> Self {
        self.allocator_window = window;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn with_page_limit(mut self, limit: u64) -> Self {
        self.page_limit = Some(limit);
        self
    }

    /// Weight of one hint unit in the eviction score, at least one generation.
    pub(crate) fn slot_boost(&self) -> u64 {
        ((self.cache_slots as f32 * self.cache_boost_ratio) as u64).max(1)
    }
}
