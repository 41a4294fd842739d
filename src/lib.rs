//! Page-storage substrate of an embedded, multi-process database.
//!
//! One datafile holds a header page, a reserved index chapter of entry
//! records, a reserved structure chapter and any number of entry chapters
//! built from straits (contiguous runs) of pages. This crate provides:
//!
//! - [`allocator::PageAllocator`]: hands out and reclaims straits, keeping a
//!   window over the deleted-page free list.
//! - [`page_cache::PageCache`]: a slot cache of memory-mapped pages with
//!   LRU-K scoring boosted by usage hints.
//! - the per-entry lookup tree ([`Worker::locate`],
//!   [`Worker::append_object_strait`]) translating logical page offsets to
//!   physical pages.
//! - the trash/free-row manager ([`Worker::allocate_row`],
//!   [`Worker::delete_row`], [`Worker::undelete_row`]).
//!
//! A [`Store`] owns the shared per-process state; each thread works through
//! its own [`Worker`].

use std::fmt;

pub mod allocator;
pub mod config;
mod entry;
pub mod error;
pub mod file;
pub mod lock;
mod lookup;
pub mod page;
pub mod page_cache;
mod replacement;
mod store;
pub mod test_utils;
mod trash;

pub use config::StoreConfig;
pub use entry::{EntryParams, Structure};
pub use error::{ErrorClass, Result, StoreError};
pub use page::{EntryRecord, RowFlags, StructureDef};
pub use store::{CheckReport, Store, Worker};
pub use trash::RowLocation;

/// Physical page number inside the datafile. Page 0 is the file header and
/// doubles as the null reference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u64);

impl PageId {
    pub const NULL: PageId = PageId(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// The page `n` places further along the file.
    pub fn offset(self, n: u64) -> PageId {
        PageId(self.0 + n)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A run of physically contiguous pages created and deleted as a unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Strait {
    pub start: PageId,
    pub count: u16,
}

impl Strait {
    pub fn new(start: PageId, count: u16) -> Self {
        Self { start, count }
    }

    pub fn last(&self) -> PageId {
        self.start.offset(self.count as u64 - 1)
    }

    pub fn pages(&self) -> impl Iterator<Item = PageId> {
        let start = self.start.0;
        (start..start + self.count as u64).map(PageId)
    }
}

/// Index of an entry record in the index chapter.
pub type EntryId = u16;

/// Row number inside an entry: `page_offset * objects_per_page + row`.
pub type RowId = u64;

/// Reserved entry ids.
pub mod reserved {
    use crate::EntryId;

    pub const INDEX: EntryId = 0;
    pub const DELETED: EntryId = 1;
    pub const STRUCTURE: EntryId = 2;
    pub const FUTURE: EntryId = 3;
    /// First id handed out to user entries.
    pub const FIRST_USER: EntryId = 4;
}

/// Globally unique object id, the entry id in the top 16 bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Oid(pub u64);

impl Oid {
    const ROW_BITS: u32 = 48;
    const ROW_MASK: u64 = (1 << Self::ROW_BITS) - 1;

    pub fn new(entry: EntryId, row: RowId) -> Result<Self> {
        if row > Self::ROW_MASK {
            return Err(StoreError::invalid(format!("row id {row} does not fit an oid")));
        }
        Ok(Oid(((entry as u64) << Self::ROW_BITS) | row))
    }

    pub fn entry(&self) -> EntryId {
        (self.0 >> Self::ROW_BITS) as EntryId
    }

    pub fn row(&self) -> RowId {
        self.0 & Self::ROW_MASK
    }
}
