//! The datafile: creation, validation, growth and page mapping.
//!
//! The file is a plain concatenation of pages. Page 0 is the header, pages
//! `1..=N` are the index chapter and the next `M` pages the structure chapter.
//! The file length is always a multiple of the page size; anything else means
//! something outside this process truncated or appended to it.

use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use memmap2::{MmapMut, MmapOptions};
use rand::RngCore;
use tracing::{debug, warn};

use crate::{
    config::StoreConfig,
    error::{Result, StoreError},
    page::{
        self, EntryKind, EntryRecord, FileHeader, IndexPageMut, ObjectInit, ObjectPageMut,
        RowLayout, StructureDef, ENTRY_RECORD_SIZE, HEADER_SIZE,
    },
    reserved, EntryId, PageId,
};

/// Page size reported by the operating system.
pub fn os_page_size() -> usize {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    4096
}

fn is_out_of_space(err: &io::Error) -> bool {
    #[cfg(target_os = "linux")]
    {
        matches!(err.raw_os_error(), Some(libc::ENOSPC) | Some(libc::EFBIG))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = err;
        false
    }
}

fn is_out_of_memory(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::OutOfMemory || {
        #[cfg(target_os = "linux")]
        {
            err.raw_os_error() == Some(libc::ENOMEM)
        }
        #[cfg(not(target_os = "linux"))]
        {
            false
        }
    }
}

/// Fixed placement of the reserved chapters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub page_size: usize,
    pub index_pages: u16,
    pub structure_pages: u16,
}

impl Geometry {
    pub fn entries_per_page(&self) -> usize {
        (self.page_size - HEADER_SIZE) / ENTRY_RECORD_SIZE
    }

    pub fn entry_count(&self) -> usize {
        self.entries_per_page() * self.index_pages as usize
    }

    /// Index page and slot holding an entry record.
    pub fn entry_location(&self, entry: EntryId) -> Result<(PageId, usize)> {
        let per_page = self.entries_per_page();
        if entry as usize >= self.entry_count() {
            return Err(StoreError::NotFound("entry"));
        }
        let page = PageId(1 + (entry as usize / per_page) as u64);
        Ok((page, entry as usize % per_page))
    }

    /// Absolute byte offset of one field of an entry record.
    pub fn entry_byte_offset(&self, entry: EntryId, field: page::EntryField) -> Result<u64> {
        let (page, slot) = self.entry_location(entry)?;
        Ok(self.byte_offset(page)
            + (HEADER_SIZE + slot * ENTRY_RECORD_SIZE + field.offset()) as u64)
    }

    pub fn first_structure_page(&self) -> PageId {
        PageId(1 + self.index_pages as u64)
    }

    /// First page id past the reserved chapters.
    pub fn first_free_page(&self) -> PageId {
        PageId(1 + self.index_pages as u64 + self.structure_pages as u64)
    }

    pub fn byte_offset(&self, page: PageId) -> u64 {
        page.0 * self.page_size as u64
    }
}

#[derive(Debug)]
pub struct Datafile {
    file: File,
    path: PathBuf,
    header: FileHeader,
    geometry: Geometry,
    pages: AtomicU64,
    /// Zero means unlimited.
    page_limit: AtomicU64,
}

impl Datafile {
    /// Creates and formats a new datafile. Fails if the path exists.
    pub fn create<P>(path: P, config: &StoreConfig) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let page_size = os_page_size() * config.page_multiplier.max(1) as usize;
        if page_size > u16::MAX as usize {
            return Err(StoreError::invalid(format!(
                "page size {page_size} does not fit the header"
            )));
        }
        if config.index_pages == 0 || config.structure_pages == 0 {
            return Err(StoreError::invalid("index and structure chapters need a page each"));
        }
        let geometry = Geometry {
            page_size,
            index_pages: config.index_pages,
            structure_pages: config.structure_pages,
        };
        if geometry.entry_count() <= reserved::FIRST_USER as usize {
            return Err(StoreError::invalid("index chapter cannot hold any user entry"));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        let total = geometry.first_free_page().0;
        file.set_len(total * page_size as u64)?;

        let mut id = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut id);
        let header = FileHeader {
            int_size: std::mem::size_of::<i32>() as u8,
            entry_size: ENTRY_RECORD_SIZE as u8,
            page_size: page_size as u16,
            page_multiplier: config.page_multiplier.max(1),
            id,
            host: 0,
            index_pages: config.index_pages,
            structure_pages: config.structure_pages,
        };
        let datafile = Self {
            file,
            path: path.as_ref().to_path_buf(),
            header,
            geometry,
            pages: AtomicU64::new(total),
            page_limit: AtomicU64::new(config.page_limit.unwrap_or(0)),
        };
        datafile.format()?;
        debug!(path = %datafile.path.display(), page_size, "created datafile");
        Ok(datafile)
    }

    /// Opens an existing datafile and checks it was written by a compatible
    /// build on compatible hardware.
    pub fn open<P>(path: P, config: &StoreConfig) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        let os_page = os_page_size();
        if len < os_page as u64 {
            return Err(StoreError::NotDatabase);
        }
        // SAFETY: the mapping is private to this call and dropped before return.
        let head = unsafe { MmapOptions::new().len(os_page).map(&file)? };
        let header = FileHeader::read(&head)?;
        drop(head);

        if header.int_size as usize != std::mem::size_of::<i32>()
            || header.entry_size as usize != ENTRY_RECORD_SIZE
        {
            return Err(StoreError::Incompatible(format!(
                "int size {} / entry size {}",
                header.int_size, header.entry_size
            )));
        }
        let page_size = header.page_size as usize;
        if page_size != os_page * header.page_multiplier as usize {
            return Err(StoreError::Incompatible(format!(
                "page size {page_size} is not {} x {os_page}",
                header.page_multiplier
            )));
        }
        if len % page_size as u64 != 0 {
            return Err(StoreError::critical(format!(
                "file length {len} is not a multiple of the page size {page_size}"
            )));
        }
        let geometry = Geometry {
            page_size,
            index_pages: header.index_pages,
            structure_pages: header.structure_pages,
        };
        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            header,
            geometry,
            pages: AtomicU64::new(len / page_size as u64),
            page_limit: AtomicU64::new(config.page_limit.unwrap_or(0)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn page_size(&self) -> usize {
        self.geometry.page_size
    }

    /// Length of the file in pages as last observed by this process.
    pub fn page_count(&self) -> u64 {
        self.pages.load(Ordering::Acquire)
    }

    /// Re-reads the file length, picking up growth by other processes.
    pub fn refresh_page_count(&self) -> Result<u64> {
        let pages = self.file.metadata()?.len() / self.page_size() as u64;
        self.pages.fetch_max(pages, Ordering::AcqRel);
        Ok(self.page_count())
    }

    pub fn set_page_limit(&self, limit: Option<u64>) {
        self.page_limit.store(limit.unwrap_or(0), Ordering::Release);
    }

    /// Appends `count` zero-filled pages and returns the first of them.
    /// Callers serialize growth through the allocator.
    pub(crate) fn extend(&self, count: u16) -> Result<PageId> {
        let page_size = self.page_size() as u64;
        let len = self.file.metadata()?.len();
        if len % page_size != 0 {
            return Err(StoreError::critical(format!(
                "file length {len} is not page aligned, refusing to grow"
            )));
        }
        let first = len / page_size;
        let total = first + count as u64;
        let limit = self.page_limit.load(Ordering::Acquire);
        if limit != 0 && total > limit {
            warn!(pages = total, limit, "datafile page limit reached");
            return Err(StoreError::NoSpace);
        }
        self.file.set_len(total * page_size).map_err(|e| {
            if is_out_of_space(&e) {
                warn!(error = %e, "datafile cannot grow");
                StoreError::NoSpace
            } else {
                StoreError::Io(e)
            }
        })?;
        self.pages.fetch_max(total, Ordering::AcqRel);
        debug!(first, count, "extended datafile");
        Ok(PageId(first))
    }

    /// Maps one page read-write, shared with every other mapping of the file.
    pub(crate) fn map_page(&self, id: PageId) -> Result<MmapMut> {
        if id.0 >= self.page_count() && id.0 >= self.refresh_page_count()? {
            return Err(StoreError::Eof);
        }
        // SAFETY: the range lies inside the file and the file is never
        // truncated while mapped by this process.
        let map = unsafe {
            MmapOptions::new()
                .offset(self.geometry.byte_offset(id))
                .len(self.page_size())
                .map_mut(&self.file)
        };
        map.map_err(|e| {
            if is_out_of_memory(&e) {
                StoreError::NoMemory(id)
            } else {
                StoreError::Io(e)
            }
        })
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Writes the header and initializes the reserved chapters.
    fn format(&self) -> Result<()> {
        let geometry = self.geometry;
        let mut head = self.map_page(PageId::NULL)?;
        self.header.write(&mut head);
        head.flush()?;

        let per_page = geometry.entries_per_page();
        for idx in 0..geometry.index_pages as u64 {
            let mut map = self.map_page(PageId(1 + idx))?;
            IndexPageMut::init(&mut map);
            page::update_checksum(&mut map);
            map.flush()?;
        }

        let layout = RowLayout::new(geometry.page_size, StructureDef::ROW_SIZE)?;
        let first = geometry.first_structure_page();
        let count = geometry.structure_pages as u64;
        for idx in 0..count {
            let mut map = self.map_page(first.offset(idx))?;
            let predecessor = if idx + 1 < count {
                first.offset(idx + 1)
            } else {
                PageId::NULL
            };
            ObjectPageMut::init(
                &mut map,
                layout,
                ObjectInit {
                    structure_id: 0,
                    entry_id: reserved::STRUCTURE,
                    page_offset: idx,
                    trash_predecessor: predecessor,
                },
            )?;
            page::update_checksum(&mut map);
            map.flush()?;
        }

        let mut map = self.map_page(PageId(1))?;
        let mut index = IndexPageMut::new(&mut map)?;
        index.set_entry(
            reserved::INDEX as usize,
            &EntryRecord {
                kind: EntryKind::Index as u8,
                objects_per_page: per_page as u16,
                ref0: 1,
                ref0c: geometry.index_pages as u64,
                ..Default::default()
            },
        )?;
        index.set_entry(
            reserved::DELETED as usize,
            &EntryRecord {
                kind: EntryKind::Deleted as u8,
                ..Default::default()
            },
        )?;
        index.set_entry(
            reserved::STRUCTURE as usize,
            &EntryRecord {
                kind: EntryKind::Structure as u8,
                objects_per_page: layout.rows_per_page,
                ref0: first.0,
                ref0c: count,
                trash_last: first.0,
                ..Default::default()
            },
        )?;
        page::update_checksum(&mut map);
        map.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod datafile_tests {
    use super::*;
    use crate::{
        page::{IndexPage, ObjectPage},
        test_utils::TestDir,
    };

    #[test]
    fn create_then_open_round_trips_the_header() {
        let dir = TestDir::temp("datafile_header");
        let path = dir.as_ref().join("db");
        let config = StoreConfig::default().with_index_pages(2).with_structure_pages(3);
        let created = Datafile::create(&path, &config).unwrap();
        assert_eq!(created.page_count(), 6);
        let id = created.header().id;
        drop(created);

        let opened = Datafile::open(&path, &StoreConfig::default()).unwrap();
        assert_eq!(opened.header().id, id);
        assert_eq!(opened.geometry().index_pages, 2);
        assert_eq!(opened.geometry().structure_pages, 3);
        assert_eq!(opened.geometry().first_free_page(), PageId(6));
    }

    #[test]
    fn reserved_entries_are_formatted() {
        let dir = TestDir::temp("datafile_format");
        let path = dir.as_ref().join("db");
        let file = Datafile::create(&path, &StoreConfig::default().with_structure_pages(2)).unwrap();
        let map = file.map_page(PageId(1)).unwrap();
        let index = IndexPage::new(&map).unwrap();
        let structures = index.entry(reserved::STRUCTURE as usize).unwrap();
        assert_eq!(structures.kind().unwrap(), EntryKind::Structure);
        assert_eq!(structures.ref0, 2);
        assert_eq!(structures.ref0c, 2);
        assert_eq!(structures.trash_last, 2);

        let layout = RowLayout::new(file.page_size(), StructureDef::ROW_SIZE).unwrap();
        let first = file.map_page(PageId(2)).unwrap();
        let first = ObjectPage::new(&first, layout).unwrap();
        assert_eq!(first.trash_predecessor(), PageId(3));
        assert!(page::checksum_matches(&map));
    }

    #[test]
    fn extend_honours_the_page_limit() {
        let dir = TestDir::temp("datafile_limit");
        let path = dir.as_ref().join("db");
        let file = Datafile::create(&path, &StoreConfig::default().with_page_limit(5)).unwrap();
        assert_eq!(file.extend(2).unwrap(), PageId(3));
        assert!(matches!(file.extend(1), Err(StoreError::NoSpace)));
        file.set_page_limit(None);
        assert_eq!(file.extend(1).unwrap(), PageId(5));
        assert!(matches!(file.map_page(PageId(6)), Err(StoreError::Eof)));
    }

    #[test]
    fn open_rejects_foreign_files() {
        let dir = TestDir::temp("datafile_foreign");
        let path = dir.as_ref().join("junk");
        std::fs::write(&path, vec![0u8; os_page_size()]).unwrap();
        assert!(matches!(
            Datafile::open(&path, &StoreConfig::default()),
            Err(StoreError::NotDatabase)
        ));
    }
}
