//! Free-row management.
//!
//! Every object page keeps its free rows on an in-page list (`trash_head`,
//! `trash_count`). Pages with free rows are chained through
//! `trash_predecessor`, starting at the entry's `trash_last`; a page on the
//! chain carries the `TRASH_CHAINED` flag.
//!
//! - allocate: pop from the page at `trash_last`. A page whose list is empty
//!   (rows were reused directly) is a trash fault: it is detached and the
//!   chain advances to its predecessor. An empty chain grows the entry by one
//!   object strait, at most once per call.
//! - delete: push onto the page's own list. A page off the chain that ends up
//!   more than half free is spliced back in front of `trash_last`.
//! - undelete: unlink a specific row from its page's list.

use tracing::{debug, trace};

use crate::{
    error::{Result, StoreError},
    lock::LockIntent,
    lookup::object_entry,
    page::{EntryField, ObjectPage, ObjectPageMut, RowFlags, RowLayout},
    page_cache::CacheHints,
    store::Worker,
    EntryId, PageId, RowId,
};

/// Where a row lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RowLocation {
    pub page: PageId,
    pub row: u16,
    pub row_id: RowId,
}

enum Pop {
    Row { row: u16, page_offset: u64 },
    Fault { predecessor: PageId },
}

#[cfg(feature = "invariant-checks")]
fn check_owner(page: &ObjectPage<'_>, entry: EntryId, id: PageId) -> Result<()> {
    if page.entry_id() != entry {
        return Err(StoreError::critical(format!(
            "object page {id} belongs to entry {}, reached from entry {entry}",
            page.entry_id()
        )));
    }
    Ok(())
}

#[cfg(not(feature = "invariant-checks"))]
fn check_owner(_page: &ObjectPage<'_>, _entry: EntryId, _id: PageId) -> Result<()> {
    Ok(())
}

impl Worker {
    /// Takes a free row of `entry`, growing the entry if no row is free.
    pub fn allocate_row(&mut self, entry: EntryId) -> Result<RowLocation> {
        let record = self.read_entry(entry)?;
        object_entry(&record, entry)?;
        let layout = self.row_layout(&record)?;
        self.pop_row(entry, layout, true)
    }

    pub(crate) fn pop_row(
        &mut self,
        entry: EntryId,
        layout: RowLayout,
        may_grow: bool,
    ) -> Result<RowLocation> {
        let _trash = self.locker.exclusive(LockIntent::TrashLast(entry))?;
        let mut grown = false;
        loop {
            let record = self.read_entry(entry)?;
            let page = PageId(record.trash_last);
            if page.is_null() {
                if !may_grow {
                    return Err(StoreError::NoSpace);
                }
                if grown {
                    return Err(StoreError::critical(format!(
                        "trash chain of entry {entry} is empty right after growth"
                    )));
                }
                self.append_object_strait(entry)?;
                grown = true;
                continue;
            }

            let _offset = self.locker.exclusive(LockIntent::TrashOffset(page))?;
            let popped = self.pages.with_page(page, CacheHints::DIRTY, |view| {
                let mut buf = view.write();
                let mut object = ObjectPageMut::new(&mut buf, layout)?;
                check_owner(&object.as_ref(), entry, page)?;
                match object.pop_free_row()? {
                    Some(row) => Ok(Pop::Row {
                        row,
                        page_offset: object.as_ref().page_offset(),
                    }),
                    None => {
                        let predecessor = object.as_ref().trash_predecessor();
                        object.set_chained(false);
                        object.set_trash_predecessor(PageId::NULL);
                        Ok(Pop::Fault { predecessor })
                    }
                }
            })?;
            match popped {
                Pop::Row { row, page_offset } => {
                    let row_id = page_offset * layout.rows_per_page as u64 + row as u64;
                    trace!(entry, %page, row, row_id, "allocated row");
                    return Ok(RowLocation { page, row, row_id });
                }
                Pop::Fault { predecessor } => {
                    debug!(entry, %page, next = %predecessor, "trash fault, skipping page");
                    self.write_entry_field(entry, EntryField::TrashLast, predecessor.0)?;
                }
            }
        }
    }

    /// Marks a row free. Deleting a free row does nothing.
    pub fn delete_row(&mut self, entry: EntryId, row_id: RowId) -> Result<()> {
        let record = self.read_entry(entry)?;
        let layout = self.row_layout(&record)?;
        let location = self.locate_row(entry, row_id)?;
        let page = location.page;

        let splice = {
            let _offset = self.locker.exclusive(LockIntent::TrashOffset(page))?;
            let _row = self.locker.exclusive(LockIntent::Row {
                page,
                row: location.row,
                layout,
            })?;
            self.pages.with_page(page, CacheHints::DIRTY, |view| {
                let mut buf = view.write();
                let mut object = ObjectPageMut::new(&mut buf, layout)?;
                check_owner(&object.as_ref(), entry, page)?;
                if !object.push_free_row(location.row)? {
                    return Ok(false);
                }
                let current = object.as_ref();
                Ok(current.is_critical() && !current.is_chained())
            })?
        };
        trace!(entry, %page, row = location.row, row_id, "deleted row");
        if splice {
            self.splice_page(entry, page, layout)?;
        }
        Ok(())
    }

    /// Puts a page back at the front of the trash chain if it still needs it
    /// once the chain is locked.
    fn splice_page(&mut self, entry: EntryId, page: PageId, layout: RowLayout) -> Result<()> {
        let _trash = self.locker.exclusive(LockIntent::TrashLast(entry))?;
        let _offset = self.locker.exclusive(LockIntent::TrashOffset(page))?;
        let last = PageId(self.read_entry(entry)?.trash_last);
        let spliced = self.pages.with_page(page, CacheHints::DIRTY, |view| {
            let mut buf = view.write();
            let mut object = ObjectPageMut::new(&mut buf, layout)?;
            let current = object.as_ref();
            if current.is_chained() || !current.is_critical() {
                return Ok(false);
            }
            object.set_trash_predecessor(last);
            object.set_chained(true);
            Ok(true)
        })?;
        if spliced {
            self.write_entry_field(entry, EntryField::TrashLast, page.0)?;
            debug!(entry, %page, "page rejoined the trash chain");
        }
        Ok(())
    }

    /// Takes a deleted row off its page's free list and marks it live again.
    pub fn undelete_row(&mut self, entry: EntryId, row_id: RowId) -> Result<RowLocation> {
        let record = self.read_entry(entry)?;
        let layout = self.row_layout(&record)?;
        let location = self.locate_row(entry, row_id)?;
        let page = location.page;
        let _offset = self.locker.exclusive(LockIntent::TrashOffset(page))?;
        let _row = self.locker.exclusive(LockIntent::Row {
            page,
            row: location.row,
            layout,
        })?;
        self.pages.with_page(page, CacheHints::DIRTY, |view| {
            let mut buf = view.write();
            let mut object = ObjectPageMut::new(&mut buf, layout)?;
            check_owner(&object.as_ref(), entry, page)?;
            object.unlink_free_row(location.row)
        })?;
        trace!(entry, %page, row = location.row, row_id, "undeleted row");
        Ok(location)
    }

    // ------------------------------------------------------------------------
    // Row contents
    // ------------------------------------------------------------------------

    pub fn is_row_deleted(&mut self, entry: EntryId, row_id: RowId) -> Result<bool> {
        Ok(self.row_flags(entry, row_id)?.contains(RowFlags::DELETED))
    }

    pub fn row_flags(&mut self, entry: EntryId, row_id: RowId) -> Result<RowFlags> {
        let (location, layout) = self.row_target(entry, row_id)?;
        let _row = self.locker.shared(LockIntent::Row {
            page: location.page,
            row: location.row,
            layout,
        })?;
        self.pages
            .with_page(location.page, CacheHints::empty(), |view| {
                ObjectPage::new(&view.read(), layout)?.row_flags(location.row)
            })
    }

    /// Copy of a live row's payload.
    pub fn read_row(&mut self, entry: EntryId, row_id: RowId) -> Result<Vec<u8>> {
        let (location, layout) = self.row_target(entry, row_id)?;
        let _row = self.locker.shared(LockIntent::Row {
            page: location.page,
            row: location.row,
            layout,
        })?;
        self.pages
            .with_page(location.page, CacheHints::empty(), |view| {
                let buf = view.read();
                let object = ObjectPage::new(&buf, layout)?;
                if object.row_flags(location.row)?.contains(RowFlags::DELETED) {
                    return Err(StoreError::NotFound("row"));
                }
                Ok(object.payload(location.row)?.to_vec())
            })
    }

    /// Overwrites the start of a live row's payload.
    pub fn write_row(&mut self, entry: EntryId, row_id: RowId, data: &[u8]) -> Result<()> {
        let (location, layout) = self.row_target(entry, row_id)?;
        let _row = self.locker.exclusive(LockIntent::Row {
            page: location.page,
            row: location.row,
            layout,
        })?;
        self.pages
            .with_page(location.page, CacheHints::DIRTY, |view| {
                let mut buf = view.write();
                let mut object = ObjectPageMut::new(&mut buf, layout)?;
                if object.as_ref().row_flags(location.row)?.contains(RowFlags::DELETED) {
                    return Err(StoreError::NotFound("row"));
                }
                let payload = object.payload_mut(location.row)?;
                if data.len() > payload.len() {
                    return Err(StoreError::invalid(format!(
                        "{} bytes do not fit a {} byte row",
                        data.len(),
                        payload.len()
                    )));
                }
                payload[..data.len()].copy_from_slice(data);
                Ok(())
            })
    }

    /// Replaces the user lock bits of a live row, keeping its other flags.
    pub fn set_user_locks(&mut self, entry: EntryId, row_id: RowId, locks: RowFlags) -> Result<()> {
        let (location, layout) = self.row_target(entry, row_id)?;
        let _row = self.locker.exclusive(LockIntent::Row {
            page: location.page,
            row: location.row,
            layout,
        })?;
        self.pages
            .with_page(location.page, CacheHints::DIRTY, |view| {
                let mut buf = view.write();
                let mut object = ObjectPageMut::new(&mut buf, layout)?;
                let flags = object.as_ref().row_flags(location.row)?;
                if flags.contains(RowFlags::DELETED) {
                    return Err(StoreError::NotFound("row"));
                }
                let flags = (flags - RowFlags::USER_LOCKS) | (locks & RowFlags::USER_LOCKS);
                object.set_row_flags(location.row, flags)
            })
    }

    fn row_target(&mut self, entry: EntryId, row_id: RowId) -> Result<(RowLocation, RowLayout)> {
        let record = self.read_entry(entry)?;
        let layout = self.row_layout(&record)?;
        Ok((self.locate_row(entry, row_id)?, layout))
    }
}

#[cfg(test)]
mod trash_tests {
    use super::*;
    use crate::{
        config::StoreConfig, entry::EntryParams, page::HEADER_SIZE, store::Store,
        test_utils::TestDir,
    };

    /// An entry whose pages hold exactly four rows.
    fn four_per_page(store: &Store, exponent: u8) -> (Worker, EntryId) {
        let mut worker = store.worker();
        let row_size = ((store.file().page_size() - HEADER_SIZE) / 4) as u16;
        let structure = worker.create_structure(row_size).unwrap();
        let entry = worker
            .create_entry(EntryParams::new(structure.id).with_strait_exponent(exponent))
            .unwrap();
        (worker, entry)
    }

    fn trash_last(worker: &mut Worker, entry: EntryId) -> PageId {
        PageId(worker.entry(entry).unwrap().trash_last)
    }

    #[test]
    fn rows_come_out_in_order_and_grow_on_demand() {
        let dir = TestDir::temp("trash_order");
        let store = dir.store(StoreConfig::default());
        let (mut worker, entry) = four_per_page(&store, 1);
        let rows: Vec<RowLocation> = (0..9).map(|_| worker.allocate_row(entry).unwrap()).collect();
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row.row_id, i as u64);
            assert_eq!(row.row, (i % 4) as u16);
        }
        let record = worker.entry(entry).unwrap();
        assert_eq!(record.ref0c, 4, "two straits of two pages");
        assert_eq!(rows[4].page, rows[0].page.offset(1));
        assert_eq!(worker.locate(entry, 2).unwrap(), rows[8].page);
        assert_eq!(worker.locate_row(entry, 8).unwrap(), rows[8]);
    }

    #[test]
    fn deleted_row_is_reused_exactly_once() {
        let dir = TestDir::temp("trash_reuse");
        let store = dir.store(StoreConfig::default());
        let (mut worker, entry) = four_per_page(&store, 0);
        for _ in 0..3 {
            worker.allocate_row(entry).unwrap();
        }
        worker.delete_row(entry, 1).unwrap();
        worker.delete_row(entry, 1).unwrap();
        assert!(worker.is_row_deleted(entry, 1).unwrap());

        let reused = worker.allocate_row(entry).unwrap();
        assert_eq!(reused.row_id, 1);
        assert!(!worker.is_row_deleted(entry, 1).unwrap());
        assert_eq!(worker.allocate_row(entry).unwrap().row_id, 3);
        assert_eq!(worker.allocate_row(entry).unwrap().row_id, 4);
    }

    #[test]
    fn direct_reuse_causes_a_trash_fault_skip() {
        let dir = TestDir::temp("trash_fault");
        let store = dir.store(StoreConfig::default());
        let (mut worker, entry) = four_per_page(&store, 0);
        for _ in 0..8 {
            worker.allocate_row(entry).unwrap();
        }
        // The second page heads the chain with an empty list. Free one of its
        // rows and take it back directly.
        let second = trash_last(&mut worker, entry);
        assert!(!second.is_null());
        worker.delete_row(entry, 5).unwrap();
        worker.undelete_row(entry, 5).unwrap();
        assert!(!worker.is_row_deleted(entry, 5).unwrap());
        assert!(matches!(
            worker.undelete_row(entry, 5),
            Err(StoreError::Invalid(_))
        ));

        let next = worker.allocate_row(entry).unwrap();
        assert_eq!(next.row_id, 8, "the emptied page is skipped, then the entry grows");
        assert_ne!(next.page, second);
    }

    #[test]
    fn trash_fault_detaches_the_page_completely() {
        let dir = TestDir::temp("trash_detach");
        let store = dir.store(StoreConfig::default());
        let (mut worker, entry) = four_per_page(&store, 1);
        for _ in 0..4 {
            worker.allocate_row(entry).unwrap();
        }
        let first = worker.locate(entry, 0).unwrap();
        let second = worker.locate(entry, 1).unwrap();
        assert_eq!(trash_last(&mut worker, entry), first);

        let row = worker.allocate_row(entry).unwrap();
        assert_eq!((row.page, row.row_id), (second, 4));
        assert_eq!(trash_last(&mut worker, entry), second);

        let record = worker.entry(entry).unwrap();
        let layout = worker.row_layout(&record).unwrap();
        let (chained, predecessor) = store
            .cache()
            .handle()
            .with_page(first, CacheHints::empty(), |view| {
                let buf = view.read();
                let page = ObjectPage::new(&buf, layout)?;
                Ok((page.is_chained(), page.trash_predecessor()))
            })
            .unwrap();
        assert!(!chained);
        assert_eq!(predecessor, PageId::NULL);
    }

    #[test]
    fn half_free_page_rejoins_the_chain() {
        let dir = TestDir::temp("trash_splice");
        let store = dir.store(StoreConfig::default());
        let (mut worker, entry) = four_per_page(&store, 0);
        for _ in 0..8 {
            worker.allocate_row(entry).unwrap();
        }
        let first_page = worker.locate(entry, 0).unwrap();
        let second_page = worker.locate(entry, 1).unwrap();
        // The first page was detached by a trash fault when it ran dry.
        worker.delete_row(entry, 0).unwrap();
        worker.delete_row(entry, 1).unwrap();
        assert_eq!(trash_last(&mut worker, entry), second_page);
        worker.delete_row(entry, 2).unwrap();
        assert_eq!(trash_last(&mut worker, entry), first_page);

        let mut reused: Vec<RowId> = (0..3)
            .map(|_| worker.allocate_row(entry).unwrap().row_id)
            .collect();
        reused.sort_unstable();
        assert_eq!(reused, vec![0, 1, 2]);
    }

    #[test]
    fn row_payloads_and_user_locks() {
        let dir = TestDir::temp("trash_rows");
        let store = dir.store(StoreConfig::default());
        let (mut worker, entry) = four_per_page(&store, 0);
        let row = worker.allocate_row(entry).unwrap();
        worker.write_row(entry, row.row_id, b"strait").unwrap();
        assert_eq!(&worker.read_row(entry, row.row_id).unwrap()[..6], b"strait");

        worker
            .set_user_locks(entry, row.row_id, RowFlags::USER_READ | RowFlags::DELETED)
            .unwrap();
        assert_eq!(worker.row_flags(entry, row.row_id).unwrap(), RowFlags::USER_READ);

        worker.delete_row(entry, row.row_id).unwrap();
        assert!(matches!(
            worker.read_row(entry, row.row_id),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            worker.write_row(entry, 4, b"x"),
            Err(StoreError::Eof)
        ));
    }

    #[test]
    fn growth_failure_leaves_the_entry_unchanged() {
        let dir = TestDir::temp("trash_no_space");
        let store = dir.store(StoreConfig::default());
        let (mut worker, entry) = four_per_page(&store, 0);
        for _ in 0..4 {
            worker.allocate_row(entry).unwrap();
        }
        let record = worker.entry(entry).unwrap();
        store.set_page_limit(Some(store.file().page_count()));
        assert!(matches!(worker.allocate_row(entry), Err(StoreError::NoSpace)));
        let after = worker.entry(entry).unwrap();
        assert_eq!(after.ref0c, record.ref0c);
        assert_eq!(after.last_lookup, record.last_lookup);
        store.set_page_limit(None);
        assert_eq!(worker.allocate_row(entry).unwrap().row_id, 4);
    }
}
