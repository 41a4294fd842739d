//! Process-wide store state and per-thread workers.
//!
//! A [`Store`] owns everything shared by the threads of one process: the
//! datafile, the page cache, the allocator and the lock manager. Each thread
//! creates its own [`Worker`], which carries a cache handle and a lock owner
//! id and implements the entry, lookup and trash operations.

use std::{
    collections::HashMap,
    fmt,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::{
    allocator::{AllocatorStats, PageAllocator},
    config::StoreConfig,
    error::Result,
    file::{Datafile, Geometry},
    lock::{LockManager, LockTable, Locker},
    page::{self, EntryField, EntryRecord, IndexPage, IndexPageMut, PageType, RowLayout},
    page_cache::{CacheHandle, CacheHints, PageCache},
    EntryId, PageId, Strait,
};

pub(crate) struct Shared {
    pub(crate) file: Arc<Datafile>,
    pub(crate) cache: Arc<PageCache>,
    pub(crate) allocator: Mutex<PageAllocator>,
    pub(crate) locks: Arc<dyn LockManager>,
    pub(crate) config: StoreConfig,
    next_owner: AtomicU64,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("path", &self.file.path())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Summary produced by [`Store::check`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub pages: u64,
    pub index: u64,
    pub object: u64,
    pub lookup: u64,
    pub deleted: u64,
    /// Pages tagged as holding nothing, usually retired straits.
    pub unused: u64,
    pub bad_checksums: Vec<PageId>,
}

/// An open datafile. Cloning is cheap and shares all state.
#[derive(Clone, Debug)]
pub struct Store {
    shared: Arc<Shared>,
}

impl Store {
    /// Creates and formats a new datafile at `path`.
    pub fn create<P: AsRef<Path>>(path: P, config: StoreConfig) -> Result<Self> {
        let file = Datafile::create(path, &config)?;
        Self::assemble(file, config, None)
    }

    pub fn open<P: AsRef<Path>>(path: P, config: StoreConfig) -> Result<Self> {
        let file = Datafile::open(path, &config)?;
        Self::assemble(file, config, None)
    }

    /// Opens with an external lock manager, for sharing the file with other
    /// processes.
    pub fn open_with_locks<P: AsRef<Path>>(
        path: P,
        config: StoreConfig,
        locks: Arc<dyn LockManager>,
    ) -> Result<Self> {
        let file = Datafile::open(path, &config)?;
        Self::assemble(file, config, Some(locks))
    }

    fn assemble(
        file: Datafile,
        config: StoreConfig,
        locks: Option<Arc<dyn LockManager>>,
    ) -> Result<Self> {
        let file = Arc::new(file);
        let cache = PageCache::new(Arc::clone(&file), &config)?;
        let allocator = PageAllocator::open(Arc::clone(&file), &cache, config.allocator_window)?;
        let locks = locks.unwrap_or_else(|| Arc::new(LockTable::new(config.lock_timeout)));
        Ok(Self {
            shared: Arc::new(Shared {
                file,
                cache,
                allocator: Mutex::new(allocator),
                locks,
                config,
                next_owner: AtomicU64::new(1),
            }),
        })
    }

    /// A new worker with its own cache handle and lock owner id.
    pub fn worker(&self) -> Worker {
        let owner = self.shared.next_owner.fetch_add(1, Ordering::Relaxed);
        Worker {
            shared: Arc::clone(&self.shared),
            pages: self.shared.cache.handle(),
            locker: Locker::new(
                Arc::clone(&self.shared.locks),
                owner,
                self.shared.file.geometry(),
            ),
            layouts: HashMap::new(),
        }
    }

    pub fn file(&self) -> &Arc<Datafile> {
        &self.shared.file
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.shared.cache
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    pub fn set_page_limit(&self, limit: Option<u64>) {
        self.shared.file.set_page_limit(limit);
    }

    pub fn allocator_stats(&self) -> Result<AllocatorStats> {
        self.shared.allocator.lock().stats()
    }

    /// Writes back dirty pages and syncs the file.
    pub fn flush(&self) -> Result<()> {
        self.shared.cache.flush()?;
        self.shared.file.sync()
    }

    /// Flushes, then classifies every page and verifies the checksums of
    /// pages maintained through the cache.
    pub fn check(&self) -> Result<CheckReport> {
        self.flush()?;
        let file = &self.shared.file;
        let mut report = CheckReport {
            pages: file.refresh_page_count()?,
            ..Default::default()
        };
        for id in 1..report.pages {
            let page = PageId(id);
            let map = file.map_page(page)?;
            let verify = match page::page_type(&map)? {
                PageType::Index => {
                    report.index += 1;
                    true
                }
                PageType::Object | PageType::Structure => {
                    report.object += 1;
                    true
                }
                PageType::Lookup => {
                    report.lookup += 1;
                    true
                }
                PageType::Deleted => {
                    report.deleted += 1;
                    false
                }
                PageType::Init => {
                    report.unused += 1;
                    false
                }
            };
            if verify && !page::checksum_matches(&map) {
                error!(%page, "checksum mismatch");
                report.bad_checksums.push(page);
            }
        }
        Ok(report)
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Per-thread access to a [`Store`].
pub struct Worker {
    pub(crate) shared: Arc<Shared>,
    pub(crate) pages: CacheHandle,
    pub(crate) locker: Locker,
    /// Row layouts by structure id. Structures never change once created.
    pub(crate) layouts: HashMap<u16, RowLayout>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("owner", &self.locker.owner())
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn geometry(&self) -> Geometry {
        self.shared.file.geometry()
    }

    pub(crate) fn page_size(&self) -> usize {
        self.shared.file.page_size()
    }

    pub(crate) fn read_entry(&mut self, entry: EntryId) -> Result<EntryRecord> {
        let (page, slot) = self.geometry().entry_location(entry)?;
        self.pages.with_page(page, CacheHints::index(0), |view| {
            IndexPage::new(&view.read())?.entry(slot)
        })
    }

    pub(crate) fn write_entry(&mut self, entry: EntryId, record: &EntryRecord) -> Result<()> {
        let (page, slot) = self.geometry().entry_location(entry)?;
        self.pages
            .with_page(page, CacheHints::DIRTY | CacheHints::index(0), |view| {
                IndexPageMut::new(&mut view.write())?.set_entry(slot, record)
            })
    }

    pub(crate) fn write_entry_field(
        &mut self,
        entry: EntryId,
        field: EntryField,
        value: u64,
    ) -> Result<()> {
        let (page, slot) = self.geometry().entry_location(entry)?;
        self.pages
            .with_page(page, CacheHints::DIRTY | CacheHints::index(0), |view| {
                IndexPageMut::new(&mut view.write())?.set_field(slot, field, value)
            })
    }

    pub(crate) fn begin_pages(&self) -> PageTxn {
        PageTxn {
            shared: Arc::clone(&self.shared),
            pending: Vec::new(),
            committed: false,
        }
    }

    // ------------------------------------------------------------------------
    // Raw page primitives
    // ------------------------------------------------------------------------

    /// Allocates `count` contiguous pages. Recycled pages keep whatever they
    /// held; the caller initializes them.
    pub fn create_pages(&mut self, count: u16) -> Result<Strait> {
        let start = self.shared.allocator.lock().allocate(count)?;
        Ok(Strait::new(start, count))
    }

    /// Retires every page of the strait and returns it to the allocator.
    /// Cached copies become first in line for eviction.
    pub fn delete_pages(&mut self, strait: Strait) -> Result<()> {
        retire_strait(&mut self.pages, strait)?;
        // Before the free: afterwards the pages may already be handed out again.
        self.shared.cache.discard(strait);
        self.shared.allocator.lock().free(strait)
    }
}

fn retire_strait(pages: &mut CacheHandle, strait: Strait) -> Result<()> {
    for page in strait.pages() {
        pages.with_page(page, CacheHints::DIRTY, |view| {
            page::retire(&mut view.write());
            Ok(())
        })?;
    }
    Ok(())
}

// ============================================================================
// PageTxn
// ============================================================================

/// Pages created speculatively by one structural change. Unless committed,
/// dropping the transaction retires and frees them again.
pub(crate) struct PageTxn {
    shared: Arc<Shared>,
    pending: Vec<Strait>,
    committed: bool,
}

impl PageTxn {
    pub(crate) fn create(&mut self, count: u16) -> Result<Strait> {
        let start = self.shared.allocator.lock().allocate(count)?;
        let strait = Strait::new(start, count);
        self.pending.push(strait);
        Ok(strait)
    }

    pub(crate) fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PageTxn {
    fn drop(&mut self) {
        if self.committed || self.pending.is_empty() {
            return;
        }
        let mut pages = self.shared.cache.handle();
        for strait in self.pending.drain(..).rev() {
            let result = retire_strait(&mut pages, strait).and_then(|()| {
                self.shared.cache.discard(strait);
                self.shared.allocator.lock().free(strait)
            });
            match result {
                Ok(()) => debug!(start = %strait.start, count = strait.count, "rolled back pages"),
                Err(e) => error!(
                    start = %strait.start,
                    count = strait.count,
                    error = %e,
                    "page leak"
                ),
            }
        }
    }
}

#[cfg(test)]
mod store_tests {
    use super::*;
    use crate::{error::StoreError, test_utils::TestDir};

    #[test]
    fn raw_pages_round_trip_through_the_free_list() {
        let dir = TestDir::temp("store_raw");
        let store = dir.store(StoreConfig::default());
        let mut worker = store.worker();
        let strait = worker.create_pages(3).unwrap();
        worker.delete_pages(strait).unwrap();
        let again = worker.create_pages(3).unwrap();
        assert_eq!(again, strait);
        let stats = store.allocator_stats().unwrap();
        assert_eq!(stats.free_pages, 0);
        assert_eq!(stats.record_pages, 1);
    }

    #[test]
    fn uncommitted_txn_returns_its_pages() {
        let dir = TestDir::temp("store_txn");
        let store = dir.store(StoreConfig::default());
        let worker = store.worker();
        let strait = {
            let mut txn = worker.begin_pages();
            txn.create(4).unwrap()
        };
        let stats = store.allocator_stats().unwrap();
        assert_eq!(stats.free_pages, 4);

        let committed = {
            let mut txn = worker.begin_pages();
            let s = txn.create(4).unwrap();
            txn.commit();
            s
        };
        assert_eq!(committed, strait);
        assert_eq!(store.allocator_stats().unwrap().free_pages, 0);
    }

    #[test]
    fn page_limit_surfaces_as_no_space() {
        let dir = TestDir::temp("store_limit");
        let store = dir.store(StoreConfig::default());
        let pages = store.file().page_count();
        store.set_page_limit(Some(pages + 1));
        let mut worker = store.worker();
        assert!(matches!(worker.create_pages(2), Err(StoreError::NoSpace)));
        worker.create_pages(1).unwrap();
    }

    #[test]
    fn check_counts_the_reserved_chapters() {
        let dir = TestDir::temp("store_check");
        let store = dir.store(StoreConfig::default().with_structure_pages(2));
        let report = store.check().unwrap();
        assert_eq!(report.index, 1);
        assert_eq!(report.object, 2);
        assert!(report.bad_checksums.is_empty());
    }

    #[test]
    fn deleted_pages_are_evicted_before_live_ones() {
        let dir = TestDir::temp("store_discard");
        let store = dir.store(StoreConfig::default().with_cache_slots(3));
        let mut worker = store.worker();
        let keep = worker.create_pages(1).unwrap().start;
        let freed = worker.create_pages(1).unwrap();
        let mut handle = store.cache().handle();
        for page in [keep, freed.start, keep, freed.start] {
            handle.with_page(page, CacheHints::empty(), |_| Ok(())).unwrap();
        }

        worker.delete_pages(freed).unwrap();
        assert!(store.cache().is_resident(freed.start));

        let other = store.file().geometry().first_structure_page();
        handle.with_page(other, CacheHints::empty(), |_| Ok(())).unwrap();
        assert!(!store.cache().is_resident(freed.start));
        assert!(store.cache().is_resident(keep));
    }

    #[test]
    fn reopen_sees_the_free_list() {
        let dir = TestDir::temp("store_reopen");
        let path = dir.as_ref().join("db");
        {
            let store = Store::create(&path, StoreConfig::default()).unwrap();
            let mut worker = store.worker();
            let strait = worker.create_pages(5).unwrap();
            worker.delete_pages(strait).unwrap();
            store.flush().unwrap();
        }
        let store = Store::open(&path, StoreConfig::default()).unwrap();
        assert_eq!(store.allocator_stats().unwrap().free_pages, 5);
    }
}
