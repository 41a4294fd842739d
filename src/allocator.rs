//! Page allocator with a windowed deleted-page free list.
//!
//! Freed straits are recorded on dedicated "deleted" pages that form a
//! doubly-linked chain: `pleft` points at the older record, `pright` at the
//! newer one, and reserved entry 1 stores the oldest (`ref0`), the newest
//! (`ref1`) and the number of record pages (`ref0c`).
//!
//! Only a small window of records is kept mapped. The window is always a
//! run of neighbouring records ordered newest first.
//!
//! # Algorithm
//!
//! - allocate: first reference in the window long enough wins and is split.
//!   On a miss, while the newest window record is empty and an older record
//!   exists, slide toward the older end and retry on the newly mapped record.
//!   Otherwise extend the file.
//! - free: merge with a physically adjacent reference, else take a null
//!   slot, else slide toward the newer end, else create a new record page
//!   (allocated with `allocate(1)`) as the chain head and retry.
//!
//! # Complexity
//!
//! - allocate/free: O(window x references per record) plus one map per slide

use std::{collections::VecDeque, sync::Arc};

use memmap2::MmapMut;
use tracing::{debug, error};

use crate::{
    error::{Result, StoreError},
    file::Datafile,
    page::{DeletedPage, DeletedPageMut, EntryField, EntryRecord, IndexPage, IndexPageMut},
    page_cache::{CacheHandle, CacheHints, PageCache},
    reserved, PageId, Strait,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Length of the datafile in pages.
    pub file_pages: u64,
    /// Pages waiting on the free list.
    pub free_pages: u64,
    /// Pages used by the free list's own records.
    pub record_pages: u64,
}

struct RecordFrame {
    page: PageId,
    map: MmapMut,
}

fn close_frame(frame: RecordFrame) {
    if let Err(e) = frame.map.flush() {
        error!(page = %frame.page, error = %e, "flushing deleted-page record failed");
    }
}

pub struct PageAllocator {
    file: Arc<Datafile>,
    index: CacheHandle,
    window: VecDeque<RecordFrame>,
    window_size: usize,
    creating_record: bool,
}

impl PageAllocator {
    pub fn open(file: Arc<Datafile>, cache: &Arc<PageCache>, window_size: usize) -> Result<Self> {
        let mut allocator = Self {
            file,
            index: cache.handle(),
            window: VecDeque::new(),
            window_size: window_size.max(1),
            creating_record: false,
        };
        allocator.reload_window()?;
        Ok(allocator)
    }

    // ------------------------------------------------------------------------
    // Chain bookkeeping in reserved entry 1
    // ------------------------------------------------------------------------

    fn chain_entry(&mut self) -> Result<EntryRecord> {
        let (page, slot) = self.file.geometry().entry_location(reserved::DELETED)?;
        self.index.with_page(page, CacheHints::empty(), |view| {
            IndexPage::new(&view.read())?.entry(slot)
        })
    }

    fn set_chain_entry(&mut self, oldest: PageId, newest: PageId, records: u64) -> Result<()> {
        let (page, slot) = self.file.geometry().entry_location(reserved::DELETED)?;
        self.index.with_page(page, CacheHints::DIRTY, |view| {
            let mut buf = view.write();
            let mut index = IndexPageMut::new(&mut buf)?;
            index.set_field(slot, EntryField::Ref0, oldest.0)?;
            index.set_field(slot, EntryField::Ref1, newest.0)?;
            index.set_field(slot, EntryField::Ref0Count, records)
        })
    }

    fn map_record(&self, page: PageId) -> Result<RecordFrame> {
        let map = self.file.map_page(page)?;
        DeletedPage::new(&map)?;
        Ok(RecordFrame { page, map })
    }

    /// Maps the newest records, walking toward older ones.
    fn reload_window(&mut self) -> Result<()> {
        for frame in self.window.drain(..) {
            close_frame(frame);
        }
        let mut page = PageId(self.chain_entry()?.ref1);
        while !page.is_null() && self.window.len() < self.window_size {
            let frame = self.map_record(page)?;
            page = DeletedPage::new(&frame.map)?.left();
            self.window.push_back(frame);
        }
        Ok(())
    }

    fn slide_older(&mut self) -> Result<bool> {
        let Some(oldest) = self.window.back() else {
            return Ok(false);
        };
        let older = DeletedPage::new(&oldest.map)?.left();
        if older.is_null() {
            return Ok(false);
        }
        let frame = self.map_record(older)?;
        if self.window.len() >= self.window_size {
            if let Some(dropped) = self.window.pop_front() {
                close_frame(dropped);
            }
        }
        debug!(page = %older, "allocator window slid toward older records");
        self.window.push_back(frame);
        Ok(true)
    }

    fn slide_newer(&mut self) -> Result<bool> {
        let Some(newest) = self.window.front() else {
            return Ok(false);
        };
        let newer = DeletedPage::new(&newest.map)?.right();
        if newer.is_null() {
            return Ok(false);
        }
        let frame = self.map_record(newer)?;
        if self.window.len() >= self.window_size {
            if let Some(dropped) = self.window.pop_back() {
                close_frame(dropped);
            }
        }
        debug!(page = %newer, "allocator window slid toward newer records");
        self.window.push_front(frame);
        Ok(true)
    }

    fn newest_is_empty(&self) -> Result<bool> {
        match self.window.front() {
            Some(frame) => Ok(DeletedPage::new(&frame.map)?.ref_count() == 0),
            None => Ok(false),
        }
    }

    // ------------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------------

    /// Returns the first page of `count` contiguous fresh or recycled pages.
    pub fn allocate(&mut self, count: u16) -> Result<PageId> {
        if count == 0 {
            return Err(StoreError::invalid("cannot allocate an empty strait"));
        }
        for frame in self.window.iter_mut() {
            if let Some(page) = DeletedPageMut::new(&mut frame.map)?.take(count) {
                debug!(%page, count, "reused free pages");
                return Ok(page);
            }
        }
        while self.newest_is_empty()? && self.slide_older()? {
            if let Some(frame) = self.window.back_mut() {
                if let Some(page) = DeletedPageMut::new(&mut frame.map)?.take(count) {
                    debug!(%page, count, "reused free pages");
                    return Ok(page);
                }
            }
        }
        self.file.extend(count)
    }

    /// Returns a strait to the free list.
    pub fn free(&mut self, strait: Strait) -> Result<()> {
        if strait.count == 0 {
            return Err(StoreError::invalid("cannot free an empty strait"));
        }
        let first_free = self.file.geometry().first_free_page();
        if strait.start < first_free || strait.last().0 >= self.file.page_count() {
            return Err(StoreError::critical(format!(
                "freeing pages {}..={} outside the allocatable range",
                strait.start,
                strait.last()
            )));
        }
        loop {
            for frame in self.window.iter_mut() {
                if DeletedPageMut::new(&mut frame.map)?.merge(strait.start, strait.count) {
                    return Ok(());
                }
            }
            for frame in self.window.iter_mut() {
                if DeletedPageMut::new(&mut frame.map)?.insert(strait.start, strait.count) {
                    return Ok(());
                }
            }
            if self.slide_newer()? {
                continue;
            }
            self.create_record()?;
        }
    }

    /// Adds an empty record page at the head of the chain and maps the
    /// window from it.
    fn create_record(&mut self) -> Result<()> {
        if self.creating_record {
            return Err(StoreError::critical("deleted-page record creation re-entered"));
        }
        self.creating_record = true;
        let result = self.append_record();
        self.creating_record = false;
        let page = result?;
        debug!(%page, "created deleted-page record");
        self.reload_window()
    }

    fn append_record(&mut self) -> Result<PageId> {
        let chain = self.chain_entry()?;
        let page = self.allocate(1)?;
        let mut map = self.file.map_page(page)?;
        let head = PageId(chain.ref1);
        DeletedPageMut::init(&mut map).set_left(head);
        map.flush()?;
        if !head.is_null() {
            let mut head_map = self.file.map_page(head)?;
            DeletedPageMut::new(&mut head_map)?.set_right(page);
            head_map.flush()?;
        }
        let oldest = if chain.ref0 == 0 { page } else { PageId(chain.ref0) };
        self.set_chain_entry(oldest, page, chain.ref0c + 1)?;
        Ok(page)
    }

    /// Walks the whole chain.
    pub fn stats(&mut self) -> Result<AllocatorStats> {
        let file_pages = self.file.page_count();
        let mut stats = AllocatorStats {
            file_pages,
            ..Default::default()
        };
        let mut page = PageId(self.chain_entry()?.ref1);
        while !page.is_null() {
            if stats.record_pages > file_pages {
                return Err(StoreError::critical("cycle in the deleted-page chain"));
            }
            let map = self.file.map_page(page)?;
            let record = DeletedPage::new(&map)?;
            stats.free_pages += record.total_pages() as u64;
            stats.record_pages += 1;
            page = record.left();
        }
        Ok(stats)
    }

    #[cfg(test)]
    fn window_pages(&self) -> Vec<PageId> {
        self.window.iter().map(|f| f.page).collect()
    }

    #[cfg(test)]
    fn window_refs(&self) -> Vec<crate::page::DeletedRef> {
        self.window
            .iter()
            .flat_map(|f| {
                let record = DeletedPage::new(&f.map).unwrap();
                (0..record.capacity())
                    .map(|i| record.reference(i))
                    .filter(|r| !r.is_null())
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

impl Drop for PageAllocator {
    fn drop(&mut self) {
        for frame in self.window.drain(..) {
            close_frame(frame);
        }
    }
}
