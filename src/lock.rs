//! Advisory locking between workers.
//!
//! Every structural mutation names what it protects with a [`LockIntent`].
//! Intents map onto byte ranges of the datafile so a cross-process byte-range
//! lock manager can stand behind the [`LockManager`] trait. The crate ships
//! [`LockTable`], an in-process implementation for single-process use.
//!
//! Ranges conflict when they overlap and at least one side is exclusive.
//! Locks are re-entrant per owner: an owner never blocks on its own grants,
//! and every acquire must be paired with one release.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::{
    error::{Result, StoreError},
    file::Geometry,
    page::{EntryField, RowLayout},
    EntryId, PageId,
};

pub type OwnerId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Half-open byte range `[start, start + len)` of the datafile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockRange {
    pub start: u64,
    pub len: u64,
}

impl LockRange {
    pub fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    pub fn overlaps(&self, other: &LockRange) -> bool {
        self.start < other.start + other.len && other.start < self.start + self.len
    }
}

/// What a lock protects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockIntent {
    /// The whole datafile, used by maintenance.
    File,
    /// Scanning the index for a free entry slot.
    EntryCreation,
    /// Scanning the structure chapter for a free slot.
    StructureCreation,
    /// An entry record as a whole.
    Entry(EntryId),
    /// An entry's `trash_last` pointer.
    TrashLast(EntryId),
    /// An entry's object page counter, held exclusively while growing.
    FreeCounter(EntryId),
    /// A lookup node that is already referenced by its tree.
    Lookup(PageId),
    /// A lookup node still being wired into its tree.
    NewLookup(PageId),
    /// The trash head of an object page.
    TrashOffset(PageId),
    /// One row of an object page.
    Row {
        page: PageId,
        row: u16,
        layout: RowLayout,
    },
}

impl LockIntent {
    /// Byte range standing for this intent.
    pub fn range(&self, geometry: &Geometry) -> Result<LockRange> {
        let range = match *self {
            LockIntent::File => LockRange::new(0, 1),
            LockIntent::EntryCreation => LockRange::new(1, 1),
            LockIntent::StructureCreation => LockRange::new(2, 1),
            LockIntent::Entry(entry) => {
                LockRange::new(geometry.entry_byte_offset(entry, EntryField::Kind)?, 1)
            }
            LockIntent::TrashLast(entry) => LockRange::new(
                geometry.entry_byte_offset(entry, EntryField::TrashLast)?,
                EntryField::TrashLast.len() as u64,
            ),
            LockIntent::FreeCounter(entry) => LockRange::new(
                geometry.entry_byte_offset(entry, EntryField::Ref0Count)?,
                EntryField::Ref0Count.len() as u64,
            ),
            LockIntent::Lookup(page) => LockRange::new(geometry.byte_offset(page) + 1, 1),
            LockIntent::NewLookup(page) => LockRange::new(geometry.byte_offset(page) + 2, 1),
            LockIntent::TrashOffset(page) => LockRange::new(geometry.byte_offset(page) + 42, 2),
            LockIntent::Row { page, row, layout } => LockRange::new(
                geometry.byte_offset(page) + layout.row_offset(row) as u64,
                layout.row_size as u64,
            ),
        };
        Ok(range)
    }
}

/// Acquire/release primitives consumed by the storage layer.
pub trait LockManager: Send + Sync + fmt::Debug {
    fn acquire(&self, owner: OwnerId, range: LockRange, mode: LockMode) -> Result<()>;

    fn release(&self, owner: OwnerId, range: LockRange, mode: LockMode);
}

#[derive(Debug)]
struct Grant {
    owner: OwnerId,
    range: LockRange,
    mode: LockMode,
}

/// In-process lock table.
#[derive(Debug)]
pub struct LockTable {
    granted: Mutex<Vec<Grant>>,
    cond_var: Condvar,
    timeout: Option<Duration>,
}

impl LockTable {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            granted: Mutex::new(Vec::new()),
            cond_var: Condvar::new(),
            timeout,
        }
    }

    #[cfg(test)]
    fn held(&self) -> usize {
        self.granted.lock().len()
    }
}

impl LockManager for LockTable {
    fn acquire(&self, owner: OwnerId, range: LockRange, mode: LockMode) -> Result<()> {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut granted = self.granted.lock();
        loop {
            let conflict = granted.iter().any(|g| {
                g.owner != owner
                    && g.range.overlaps(&range)
                    && (mode == LockMode::Exclusive || g.mode == LockMode::Exclusive)
            });
            if !conflict {
                break;
            }
            match deadline {
                Some(deadline) => {
                    if self.cond_var.wait_until(&mut granted, deadline).timed_out() {
                        return Err(StoreError::Timeout("lock"));
                    }
                }
                None => self.cond_var.wait(&mut granted),
            }
        }
        granted.push(Grant { owner, range, mode });
        Ok(())
    }

    fn release(&self, owner: OwnerId, range: LockRange, mode: LockMode) {
        let mut granted = self.granted.lock();
        match granted
            .iter()
            .position(|g| g.owner == owner && g.range == range && g.mode == mode)
        {
            Some(pos) => {
                granted.swap_remove(pos);
                self.cond_var.notify_all();
            }
            None => debug!(owner, ?range, "release of a lock that is not held"),
        }
    }
}

/// One owner's view of a lock manager, handing out RAII guards.
#[derive(Debug)]
pub struct Locker {
    manager: Arc<dyn LockManager>,
    owner: OwnerId,
    geometry: Geometry,
}

impl Locker {
    pub fn new(manager: Arc<dyn LockManager>, owner: OwnerId, geometry: Geometry) -> Self {
        Self {
            manager,
            owner,
            geometry,
        }
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn lock(&self, intent: LockIntent, mode: LockMode) -> Result<LockGuard> {
        let range = intent.range(&self.geometry)?;
        self.manager.acquire(self.owner, range, mode)?;
        Ok(LockGuard {
            manager: Arc::clone(&self.manager),
            owner: self.owner,
            range,
            mode,
        })
    }

    pub fn shared(&self, intent: LockIntent) -> Result<LockGuard> {
        self.lock(intent, LockMode::Shared)
    }

    pub fn exclusive(&self, intent: LockIntent) -> Result<LockGuard> {
        self.lock(intent, LockMode::Exclusive)
    }
}

/// Releases its lock when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    manager: Arc<dyn LockManager>,
    owner: OwnerId,
    range: LockRange,
    mode: LockMode,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.manager.release(self.owner, self.range, self.mode);
    }
}

#[cfg(test)]
mod lock_table_tests {
    use std::{sync::mpsc, thread};

    use super::*;

    fn geometry() -> Geometry {
        Geometry {
            page_size: 4096,
            index_pages: 1,
            structure_pages: 1,
        }
    }

    #[test]
    fn shared_locks_coexist() {
        let table = LockTable::new(Some(Duration::from_millis(10)));
        let range = LockRange::new(100, 8);
        table.acquire(1, range, LockMode::Shared).unwrap();
        table.acquire(2, range, LockMode::Shared).unwrap();
        table.release(1, range, LockMode::Shared);
        table.release(2, range, LockMode::Shared);
        assert_eq!(table.held(), 0);
    }

    #[test]
    fn exclusive_blocks_overlapping_ranges_only() {
        let table = LockTable::new(Some(Duration::from_millis(5)));
        table.acquire(1, LockRange::new(100, 8), LockMode::Exclusive).unwrap();
        assert!(matches!(
            table.acquire(2, LockRange::new(104, 2), LockMode::Shared),
            Err(StoreError::Timeout(_))
        ));
        table.acquire(2, LockRange::new(108, 8), LockMode::Exclusive).unwrap();
    }

    #[test]
    fn owner_reenters_its_own_locks() {
        let table = LockTable::new(Some(Duration::from_millis(5)));
        let range = LockRange::new(0, 1);
        table.acquire(1, range, LockMode::Exclusive).unwrap();
        table.acquire(1, range, LockMode::Exclusive).unwrap();
        table.release(1, range, LockMode::Exclusive);
        assert!(table.acquire(2, range, LockMode::Shared).is_err());
        table.release(1, range, LockMode::Exclusive);
        table.acquire(2, range, LockMode::Shared).unwrap();
    }

    #[test]
    fn release_wakes_a_waiter() {
        let table: Arc<dyn LockManager> = Arc::new(LockTable::new(None));
        let range = LockRange::new(10, 4);
        table.acquire(1, range, LockMode::Exclusive).unwrap();

        let (tx, rx) = mpsc::channel::<&'static str>();
        let waiter = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                tx.send("waiting").unwrap();
                table.acquire(2, range, LockMode::Exclusive).unwrap();
                tx.send("acquired").unwrap();
            })
        };
        assert_eq!(rx.recv().unwrap(), "waiting");
        thread::sleep(Duration::from_millis(20));
        assert!(rx.try_recv().is_err(), "waiter must still be blocked");
        table.release(1, range, LockMode::Exclusive);
        assert_eq!(rx.recv().unwrap(), "acquired");
        waiter.join().unwrap();
    }

    #[test]
    fn guards_release_on_drop() {
        let table = Arc::new(LockTable::new(Some(Duration::from_millis(5))));
        let a = Locker::new(table.clone(), 1, geometry());
        let b = Locker::new(table.clone(), 2, geometry());
        {
            let _guard = a.exclusive(LockIntent::TrashLast(4)).unwrap();
            assert!(b.shared(LockIntent::TrashLast(4)).is_err());
            b.exclusive(LockIntent::FreeCounter(4)).map(drop).unwrap();
        }
        assert_eq!(table.held(), 0);
        b.exclusive(LockIntent::TrashLast(4)).map(drop).unwrap();
    }

    #[test]
    fn intents_on_one_page_do_not_collide() {
        let geometry = geometry();
        let layout = RowLayout::new(4096, 64).unwrap();
        let page = PageId(9);
        let ranges = [
            LockIntent::Lookup(page),
            LockIntent::NewLookup(page),
            LockIntent::TrashOffset(page),
            LockIntent::Row { page, row: 0, layout },
            LockIntent::Row { page, row: 1, layout },
        ]
        .map(|intent| intent.range(&geometry).unwrap());
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
            }
        }
        assert!(LockIntent::Entry(60_000).range(&geometry).is_err());
    }
}
