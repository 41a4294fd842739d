//! Slot cache of memory-mapped pages.
//!
//! # Shared Types
//!
//! - `SlotMeta`: per-slot state (page id, lock count, swap state, access history)
//! - `Frame`: the mapping held by a slot
//! - `CacheStats`: hit/miss counters
//! - `PageView`: access to a locked page, handed out by [`CacheHandle::start`]
//!
//! A page is admitted by exactly one faulting caller. The fault is announced
//! under the cache mutex (the slot takes the new page id and goes mid-swap)
//! and performed outside it, so other callers asking for the same page find
//! the slot and wait for the swap to finish instead of faulting twice.

mod handle;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use memmap2::MmapMut;
use parking_lot::{
    Condvar, MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};
use tracing::{debug, error};

pub use handle::CacheHandle;
pub use crate::replacement::CacheHints;

use crate::{
    config::StoreConfig,
    error::{Result, StoreError},
    file::Datafile,
    page,
    replacement::{History, PolicyState},
    PageId, Strait,
};

// ============================================================================
// SlotMeta
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SwapState {
    Ready,
    Swapping,
    /// The fault failed. Waiters report this and the slot is cleared once
    /// its last lock is gone.
    Failed(FaultError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FaultError {
    NoMemory,
    Critical,
}

impl FaultError {
    fn classify(err: &StoreError) -> Self {
        match err {
            StoreError::NoMemory(_) => FaultError::NoMemory,
            _ => FaultError::Critical,
        }
    }

    fn into_error(self, page: PageId) -> StoreError {
        match self {
            FaultError::NoMemory => StoreError::NoMemory(page),
            FaultError::Critical => StoreError::critical(format!("mapping page {page} failed")),
        }
    }
}

#[derive(Debug)]
struct SlotMeta {
    page: PageId,
    locks: u32,
    swap: SwapState,
    history: History,
}

impl SlotMeta {
    fn empty() -> Self {
        Self {
            page: PageId::NULL,
            locks: 0,
            swap: SwapState::Ready,
            history: History::default(),
        }
    }

    fn evictable(&self) -> bool {
        self.locks == 0 && self.swap != SwapState::Swapping
    }

    /// Drops one lock; a failed slot with no holders left becomes empty.
    fn release(&mut self) -> bool {
        self.locks = self.locks.saturating_sub(1);
        if self.locks == 0 && matches!(self.swap, SwapState::Failed(_)) {
            *self = SlotMeta::empty();
        }
        self.locks == 0
    }
}

#[derive(Debug)]
struct CacheState {
    slots: Vec<SlotMeta>,
    policy: PolicyState,
    next_start: usize,
}

// ============================================================================
// Frame
// ============================================================================

#[derive(Debug, Default)]
struct Frame {
    map: RwLock<Option<MmapMut>>,
}

fn write_back(map: &mut MmapMut, page: PageId) {
    page::update_checksum(map);
    if let Err(e) = map.flush() {
        error!(%page, error = %e, "write back of dirty page failed");
    }
}

// ============================================================================
// CacheStats
// ============================================================================

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicUsize,
    pub misses: AtomicUsize,
}

impl CacheStats {
    pub fn get(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Share of lookups served by a resident page, in percent.
    pub fn hit_rate(&self) -> f64 {
        let (hits, misses) = self.get();
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }
}

// ============================================================================
// PageCache
// ============================================================================

#[derive(Debug)]
pub struct PageCache {
    file: Arc<Datafile>,
    frames: Vec<Frame>,
    state: Mutex<CacheState>,
    swapped: Condvar,
    timeout: Option<Duration>,
    stats: OnceLock<Arc<CacheStats>>,
}

impl PageCache {
    pub fn new(file: Arc<Datafile>, config: &StoreConfig) -> Result<Arc<Self>> {
        let slots = config.cache_slots;
        if slots == 0 {
            return Err(StoreError::invalid("the page cache needs at least one slot"));
        }
        Ok(Arc::new(Self {
            file,
            frames: (0..slots).map(|_| Frame::default()).collect(),
            state: Mutex::new(CacheState {
                slots: (0..slots).map(|_| SlotMeta::empty()).collect(),
                policy: PolicyState::new(config.slot_boost()),
                next_start: 0,
            }),
            swapped: Condvar::new(),
            timeout: config.lock_timeout,
            stats: OnceLock::new(),
        }))
    }

    pub fn handle(self: &Arc<Self>) -> CacheHandle {
        CacheHandle::new(Arc::clone(self))
    }

    pub fn enable_stats(&self) -> Arc<CacheStats> {
        Arc::clone(self.stats.get_or_init(|| Arc::new(CacheStats::default())))
    }

    pub fn stats(&self) -> Option<Arc<CacheStats>> {
        self.stats.get().cloned()
    }

    pub fn slot_count(&self) -> usize {
        self.frames.len()
    }

    pub fn is_resident(&self, page: PageId) -> bool {
        self.state.lock().slots.iter().any(|s| s.page == page)
    }

    pub fn resident(&self) -> Vec<PageId> {
        self.state
            .lock()
            .slots
            .iter()
            .filter(|s| !s.page.is_null())
            .map(|s| s.page)
            .collect()
    }

    fn wait(&self, state: &mut parking_lot::MutexGuard<'_, CacheState>, deadline: Option<Instant>) -> Result<()> {
        match deadline {
            Some(deadline) => {
                if self.swapped.wait_until(state, deadline).timed_out() {
                    return Err(StoreError::Timeout("page cache slot"));
                }
            }
            None => self.swapped.wait(state),
        }
        Ok(())
    }

    /// Locks the slot holding `page`, faulting it in if needed.
    fn lock_slot(&self, page: PageId) -> Result<usize> {
        if page.is_null() {
            return Err(StoreError::invalid("page 0 cannot be cached"));
        }
        if page.0 >= self.file.page_count() && page.0 >= self.file.refresh_page_count()? {
            return Err(StoreError::Eof);
        }
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        let victim = loop {
            if let Some(idx) = state.slots.iter().position(|s| s.page == page) {
                let CacheState { slots, policy, .. } = &mut *state;
                slots[idx].locks += 1;
                if slots[idx].history.hints.contains(CacheHints::RESET) {
                    // Freed and handed out again: the old hints no longer apply.
                    slots[idx].history.hints = CacheHints::empty();
                }
                policy.record_hit(&mut slots[idx].history);
                if let Some(stats) = self.stats.get() {
                    stats.hits.fetch_add(1, Ordering::Relaxed);
                }
                loop {
                    match state.slots[idx].swap {
                        SwapState::Ready => return Ok(idx),
                        SwapState::Swapping => self.swapped.wait(&mut state),
                        SwapState::Failed(fault) => {
                            if state.slots[idx].release() {
                                self.swapped.notify_all();
                            }
                            return Err(fault.into_error(page));
                        }
                    }
                }
            }
            let count = state.slots.len();
            let start = state.next_start;
            let CacheState { slots, policy, .. } = &*state;
            let picked = policy.evict_slot(
                (0..count)
                    .map(|i| (start + i) % count)
                    .filter(|&i| slots[i].evictable())
                    .map(|i| (i, &slots[i].history)),
            );
            match picked {
                Some(idx) => break idx,
                None => self.wait(&mut state, deadline)?,
            }
        };

        let CacheState {
            slots,
            policy,
            next_start,
        } = &mut *state;
        let slot = &mut slots[victim];
        let evicted = slot.page;
        let evicted_hints = slot.history.hints;
        slot.page = page;
        slot.locks = 1;
        slot.swap = SwapState::Swapping;
        policy.on_slot_assigned(&mut slot.history);
        *next_start = (victim + 1) % slots.len();
        drop(state);
        if let Some(stats) = self.stats.get() {
            stats.misses.fetch_add(1, Ordering::Relaxed);
        }

        let result = self.swap_in(victim, evicted, evicted_hints, page);

        let mut state = self.state.lock();
        let slot = &mut state.slots[victim];
        let result = match result {
            Ok(()) => {
                slot.swap = SwapState::Ready;
                Ok(victim)
            }
            Err(e) => {
                slot.swap = SwapState::Failed(FaultError::classify(&e));
                slot.release();
                Err(e)
            }
        };
        self.swapped.notify_all();
        result
    }

    /// Writes back and unmaps whatever the frame held, then maps `page`.
    fn swap_in(&self, idx: usize, evicted: PageId, hints: CacheHints, page: PageId) -> Result<()> {
        let mut map = self.frames[idx].map.write();
        if let Some(mut old) = map.take() {
            if hints.contains(CacheHints::DIRTY) && !hints.contains(CacheHints::RESET) {
                write_back(&mut old, evicted);
            }
            debug!(slot = idx, page = %evicted, "evicted page");
        }
        *map = Some(self.file.map_page(page)?);
        Ok(())
    }

    fn unlock_slot(&self, idx: usize) {
        let mut state = self.state.lock();
        let CacheState { slots, policy, .. } = &mut *state;
        let slot = &mut slots[idx];
        if slot.locks == 0 {
            debug!(slot = idx, "finish on a slot that is not locked");
            return;
        }
        slot.history.score = policy.score(&slot.history);
        if slot.release() {
            self.swapped.notify_all();
        }
    }

    fn set_hint(&self, idx: usize, hints: CacheHints) {
        let mut state = self.state.lock();
        let CacheState { slots, policy, .. } = &mut *state;
        let slot = &mut slots[idx];
        slot.history.hints = slot.history.hints.merge(hints);
        slot.history.score = policy.score(&slot.history);
    }

    /// Marks resident copies of freed pages as garbage: first to be evicted,
    /// never written back.
    pub fn discard(&self, strait: Strait) {
        let end = strait.start.0 + strait.count as u64;
        let mut state = self.state.lock();
        for slot in state.slots.iter_mut() {
            if slot.page.0 >= strait.start.0 && slot.page.0 < end {
                slot.history.hints = CacheHints::RESET;
                slot.history.score = 0;
            }
        }
    }

    /// Writes back every dirty page that nobody holds.
    pub fn flush(&self) -> Result<()> {
        let pinned: Vec<(usize, PageId)> = {
            let mut state = self.state.lock();
            state
                .slots
                .iter_mut()
                .enumerate()
                .filter(|(_, s)| {
                    s.locks == 0
                        && s.swap == SwapState::Ready
                        && s.history.hints.contains(CacheHints::DIRTY)
                        && !s.history.hints.contains(CacheHints::RESET)
                })
                .map(|(idx, s)| {
                    s.locks += 1;
                    s.history.hints.remove(CacheHints::DIRTY);
                    (idx, s.page)
                })
                .collect()
        };
        for (idx, page) in pinned {
            if let Some(map) = self.frames[idx].map.write().as_mut() {
                write_back(map, page);
            }
            self.unlock_slot(idx);
        }
        Ok(())
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (slot, frame) in state.slots.iter().zip(self.frames.iter_mut()) {
            let hints = slot.history.hints;
            if !hints.contains(CacheHints::DIRTY) || hints.contains(CacheHints::RESET) {
                continue;
            }
            if let Some(map) = frame.map.get_mut().as_mut() {
                write_back(map, slot.page);
            }
        }
    }
}

// ============================================================================
// PageView
// ============================================================================

/// A locked page. Valid until the owning handle calls `finish`.
pub struct PageView<'a> {
    cache: &'a PageCache,
    slot: usize,
    page: PageId,
}

impl<'a> PageView<'a> {
    pub fn page(&self) -> PageId {
        self.page
    }

    pub fn read(&self) -> MappedRwLockReadGuard<'a, [u8]> {
        RwLockReadGuard::map(self.cache.frames[self.slot].map.read(), |m| {
            m.as_deref().unwrap_or(&[])
        })
    }

    pub fn write(&self) -> MappedRwLockWriteGuard<'a, [u8]> {
        RwLockWriteGuard::map(self.cache.frames[self.slot].map.write(), |m| {
            m.as_deref_mut().unwrap_or(&mut [])
        })
    }

    pub fn set_hint(&self, hints: CacheHints) {
        self.cache.set_hint(self.slot, hints);
    }
}

#[cfg(test)]
mod page_cache_tests {
    use std::thread;

    use super::*;
    use crate::test_utils::TestDir;

    fn setup(slots: usize, pages: u16) -> (TestDir, Arc<Datafile>, Arc<PageCache>, PageId) {
        let dir = TestDir::temp("page_cache");
        let config = StoreConfig::default()
            .with_cache_slots(slots)
            .with_cache_boost_ratio(0.0)
            .with_lock_timeout(Duration::from_millis(50));
        let file = Arc::new(Datafile::create(dir.as_ref().join("db"), &config).unwrap());
        let first = file.extend(pages).unwrap();
        let cache = PageCache::new(Arc::clone(&file), &config).unwrap();
        (dir, file, cache, first)
    }

    fn touch(handle: &mut CacheHandle, page: PageId, hints: CacheHints) {
        handle.with_page(page, hints, |_| Ok(())).unwrap();
    }

    #[test]
    fn round_robin_evicts_the_oldest_page() {
        let (_dir, _file, cache, first) = setup(4, 6);
        let mut handle = cache.handle();
        for i in 0..5 {
            touch(&mut handle, first.offset(i), CacheHints::empty());
        }
        assert!(!cache.is_resident(first));
        touch(&mut handle, first, CacheHints::empty());
        assert!(!cache.is_resident(first.offset(1)));
        assert!(cache.is_resident(first.offset(4)));
    }

    #[test]
    fn dirty_page_outlives_a_clean_one() {
        let (_dir, _file, cache, first) = setup(4, 8);
        let mut handle = cache.handle();
        touch(&mut handle, first, CacheHints::DIRTY);
        for i in 1..4 {
            touch(&mut handle, first.offset(i), CacheHints::empty());
        }
        touch(&mut handle, first.offset(4), CacheHints::empty());
        assert!(cache.is_resident(first), "dirty page must survive the first round");
        assert!(!cache.is_resident(first.offset(1)));
        touch(&mut handle, first.offset(5), CacheHints::empty());
        assert!(cache.is_resident(first), "and the next one");
        assert!(!cache.is_resident(first.offset(2)));
    }

    #[test]
    fn writes_reach_the_file_with_a_checksum() {
        let (_dir, file, cache, first) = setup(1, 2);
        let mut handle = cache.handle();
        handle
            .with_page(first, CacheHints::DIRTY, |view| {
                view.write()[100] = 0xAB;
                Ok(())
            })
            .unwrap();
        touch(&mut handle, first.offset(1), CacheHints::empty());
        let map = file.map_page(first).unwrap();
        assert_eq!(map[100], 0xAB);
        assert!(page::checksum_matches(&map));
    }

    #[test]
    fn reset_pages_are_evicted_first() {
        let (_dir, _file, cache, first) = setup(2, 3);
        let mut handle = cache.handle();
        touch(&mut handle, first, CacheHints::empty());
        touch(&mut handle, first, CacheHints::empty());
        touch(&mut handle, first.offset(1), CacheHints::empty());
        touch(&mut handle, first.offset(1), CacheHints::empty());
        cache.discard(Strait::new(first.offset(1), 1));
        touch(&mut handle, first.offset(2), CacheHints::empty());
        assert!(cache.is_resident(first));
        assert!(!cache.is_resident(first.offset(1)));
    }

    #[test]
    fn hit_rate_is_a_percentage() {
        let (_dir, _file, cache, first) = setup(2, 1);
        let stats = cache.enable_stats();
        assert_eq!(stats.hit_rate(), 0.0);
        let mut handle = cache.handle();
        for _ in 0..4 {
            touch(&mut handle, first, CacheHints::empty());
        }
        assert_eq!(stats.get(), (3, 1));
        assert_eq!(stats.hit_rate(), 75.0);
    }

    #[test]
    fn second_start_on_a_handle_is_rejected() {
        let (_dir, _file, cache, first) = setup(2, 2);
        let mut handle = cache.handle();
        drop(handle.start(first).unwrap());
        assert!(matches!(handle.start(first.offset(1)), Err(StoreError::Invalid(_))));
        handle.finish();
        handle.finish();
        touch(&mut handle, first.offset(1), CacheHints::empty());
    }

    #[test]
    fn all_slots_locked_times_out() {
        let (_dir, _file, cache, first) = setup(1, 2);
        let mut holder = cache.handle();
        let _view = holder.start(first).unwrap();
        let mut other = cache.handle();
        assert!(matches!(
            other.start(first.offset(1)),
            Err(StoreError::Timeout(_))
        ));
    }

    #[test]
    fn pages_past_the_end_are_eof() {
        let (_dir, file, cache, _first) = setup(2, 1);
        let mut handle = cache.handle();
        assert!(matches!(
            handle.start(PageId(file.page_count())),
            Err(StoreError::Eof)
        ));
        assert!(handle.start(PageId::NULL).is_err());
    }

    #[test]
    fn concurrent_starts_converge_on_one_fault() {
        let (_dir, _file, cache, first) = setup(4, 1);
        let stats = cache.enable_stats();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    let mut handle = cache.handle();
                    for _ in 0..50 {
                        handle
                            .with_page(first, CacheHints::empty(), |view| Ok(view.read().len()))
                            .unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let (hits, misses) = stats.get();
        assert_eq!(misses, 1);
        assert_eq!(hits, 8 * 50 - 1);
    }
}
