//! On-disk page layouts and typed views over raw page buffers.
//!
//! Every page starts with the same 32-byte common header followed by 16 bytes
//! of type-specific header, so the payload of every page type begins at
//! [`HEADER_SIZE`]. All integers are stored in native byte order.
//!
//! ```text
//! 0      4      8      12  13  14    16       24       32          48
//! +------+------+------+---+---+-----+--------+--------+-----------+---------
//! | crc  | hint | owner|flg|typ| rsv | pleft  | pright | type hdr  | payload
//! +------+------+------+---+---+-----+--------+--------+-----------+---------
//! ```
//!
//! Each page kind gets a read view (`XxxPage`) and a write view (`XxxPageMut`)
//! borrowing the buffer. Constructors validate the type tag and the buffer
//! length, accessors that take an index validate it against the page capacity.

use std::fmt;

use bitflags::bitflags;

use crate::{
    error::{Result, StoreError},
    PageId,
};

pub const COMMON_HEADER_SIZE: usize = 32;
/// Size of the full header shared by every page kind.
pub const HEADER_SIZE: usize = 48;
/// Sentinel for "no free row" in an object page's trash head.
pub const NO_FREE_ROW: u16 = 0xFFFF;
pub const ENTRY_RECORD_SIZE: usize = 72;
pub const LOOKUP_REF_SIZE: usize = 16;
pub const DELETED_REF_SIZE: usize = 16;
/// Bytes of the row flags word.
pub const ROW_FLAGS_SIZE: usize = 4;
/// A row must fit its flags word plus the free-list link.
pub const ROW_MIN_SIZE: usize = ROW_FLAGS_SIZE + 2;
pub const FILE_MAGIC: [u8; 2] = [0xA6, 0xF0];

const OFF_CHECKSUM: usize = 0;
const OFF_FLAGS: usize = 12;
const OFF_TYPE: usize = 13;
const OFF_LEFT: usize = 16;
const OFF_RIGHT: usize = 24;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageType {
    Init = 0,
    Deleted = 1,
    Structure = 2,
    Object = 3,
    Index = 4,
    Lookup = 6,
}

impl TryFrom<u8> for PageType {
    type Error = StoreError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PageType::Init),
            1 => Ok(PageType::Deleted),
            2 => Ok(PageType::Structure),
            3 => Ok(PageType::Object),
            4 => Ok(PageType::Index),
            6 => Ok(PageType::Lookup),
            other => Err(StoreError::critical(format!("unknown page type tag {other}"))),
        }
    }
}

bitflags! {
    /// Flags byte of the common page header.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// The object page is reachable from its entry's trash chain.
        const TRASH_CHAINED = 0x01;
    }
}

bitflags! {
    /// Flags word at the start of every object row.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RowFlags: u32 {
        const USER_DELETE = 0x0001;
        const USER_WRITE = 0x0002;
        const USER_READ = 0x0004;
        const USER_CREATE = 0x0008;
        const DELETED = 0x1000;
    }
}

impl RowFlags {
    pub const USER_LOCKS: RowFlags = RowFlags::USER_DELETE
        .union(RowFlags::USER_WRITE)
        .union(RowFlags::USER_READ)
        .union(RowFlags::USER_CREATE);
}

// ============================================================================
// Byte helpers
// ============================================================================

fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_ne_bytes([buf[off], buf[off + 1]])
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[off..off + 4]);
    u32::from_ne_bytes(raw)
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[off..off + 8]);
    u64::from_ne_bytes(raw)
}

fn put_u16(buf: &mut [u8], off: usize, value: u16) {
    buf[off..off + 2].copy_from_slice(&value.to_ne_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_ne_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_ne_bytes());
}

// ============================================================================
// Common header
// ============================================================================

/// Reads the type tag of any page buffer.
pub fn page_type(buf: &[u8]) -> Result<PageType> {
    if buf.len() < HEADER_SIZE {
        return Err(StoreError::critical(format!(
            "page buffer of {} bytes is shorter than the header",
            buf.len()
        )));
    }
    PageType::try_from(buf[OFF_TYPE])
}

/// Sum of every 32-bit word after the checksum word.
pub fn checksum(buf: &[u8]) -> u32 {
    buf[4..]
        .chunks_exact(4)
        .fold(0u32, |acc, word| {
            acc.wrapping_add(u32::from_ne_bytes([word[0], word[1], word[2], word[3]]))
        })
}

pub fn update_checksum(buf: &mut [u8]) {
    let sum = checksum(buf);
    put_u32(buf, OFF_CHECKSUM, sum);
}

pub fn checksum_matches(buf: &[u8]) -> bool {
    get_u32(buf, OFF_CHECKSUM) == checksum(buf)
}

/// Marks a page as no longer holding anything. A page with this tag is never
/// referenced by any structure and may be reclaimed after a crash.
pub fn retire(buf: &mut [u8]) {
    buf[OFF_TYPE] = PageType::Init as u8;
    buf[OFF_FLAGS] = 0;
}

fn init_common(buf: &mut [u8], page_type: PageType) {
    buf.fill(0);
    buf[OFF_TYPE] = page_type as u8;
}

fn expect_type(buf: &[u8], expected: PageType) -> Result<()> {
    let found = page_type(buf)?;
    if found != expected {
        return Err(StoreError::critical(format!(
            "expected a {expected:?} page, found {found:?}"
        )));
    }
    Ok(())
}

// ============================================================================
// File header page
// ============================================================================

/// Decoded contents of page 0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileHeader {
    pub int_size: u8,
    pub entry_size: u8,
    pub page_size: u16,
    pub page_multiplier: u16,
    pub id: [u8; 32],
    pub host: u64,
    pub index_pages: u16,
    pub structure_pages: u16,
}

impl FileHeader {
    const OFF_INT_SIZE: usize = 2;
    const OFF_ENTRY_SIZE: usize = 3;
    const OFF_PAGE_SIZE: usize = 4;
    const OFF_MULTIPLIER: usize = 6;
    const OFF_ID: usize = 32;
    const OFF_HOST: usize = 64;
    const OFF_INDEX_PAGES: usize = 72;
    const OFF_STRUCTURE_PAGES: usize = 74;
    pub const SIZE: usize = 76;

    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE || buf[..2] != FILE_MAGIC {
            return Err(StoreError::NotDatabase);
        }
        let mut id = [0u8; 32];
        id.copy_from_slice(&buf[Self::OFF_ID..Self::OFF_ID + 32]);
        Ok(Self {
            int_size: buf[Self::OFF_INT_SIZE],
            entry_size: buf[Self::OFF_ENTRY_SIZE],
            page_size: get_u16(buf, Self::OFF_PAGE_SIZE),
            page_multiplier: get_u16(buf, Self::OFF_MULTIPLIER),
            id,
            host: get_u64(buf, Self::OFF_HOST),
            index_pages: get_u16(buf, Self::OFF_INDEX_PAGES),
            structure_pages: get_u16(buf, Self::OFF_STRUCTURE_PAGES),
        })
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[..Self::SIZE].fill(0);
        buf[..2].copy_from_slice(&FILE_MAGIC);
        buf[Self::OFF_INT_SIZE] = self.int_size;
        buf[Self::OFF_ENTRY_SIZE] = self.entry_size;
        put_u16(buf, Self::OFF_PAGE_SIZE, self.page_size);
        put_u16(buf, Self::OFF_MULTIPLIER, self.page_multiplier);
        buf[Self::OFF_ID..Self::OFF_ID + 32].copy_from_slice(&self.id);
        put_u64(buf, Self::OFF_HOST, self.host);
        put_u16(buf, Self::OFF_INDEX_PAGES, self.index_pages);
        put_u16(buf, Self::OFF_STRUCTURE_PAGES, self.structure_pages);
    }
}

// ============================================================================
// Index pages and entry records
// ============================================================================

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Init = 0,
    Deleted = 1,
    Structure = 2,
    Object = 3,
    Index = 4,
    Pending = 5,
}

impl TryFrom<u8> for EntryKind {
    type Error = StoreError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(EntryKind::Init),
            1 => Ok(EntryKind::Deleted),
            2 => Ok(EntryKind::Structure),
            3 => Ok(EntryKind::Object),
            4 => Ok(EntryKind::Index),
            5 => Ok(EntryKind::Pending),
            other => Err(StoreError::critical(format!("unknown entry kind {other}"))),
        }
    }
}

/// A single field of an entry record, addressed by its byte offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryField {
    Kind,
    Ref0,
    Ref1,
    Ref2,
    Ref0Count,
    LastLookup,
    Ref2Count,
    TrashLast,
}

impl EntryField {
    pub fn offset(self) -> usize {
        match self {
            EntryField::Kind => 0,
            EntryField::Ref0 => 16,
            EntryField::Ref1 => 24,
            EntryField::Ref2 => 32,
            EntryField::Ref0Count => 40,
            EntryField::LastLookup => 48,
            EntryField::Ref2Count => 56,
            EntryField::TrashLast => 64,
        }
    }

    pub fn len(self) -> usize {
        match self {
            EntryField::Kind => 1,
            _ => 8,
        }
    }
}

/// Decoded copy of one entry record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EntryRecord {
    pub kind: u8,
    pub memory: u16,
    pub structure_id: u16,
    pub objects_per_page: u16,
    pub lookups_per_page: u16,
    pub ref0: u64,
    pub ref1: u64,
    pub ref2: u64,
    pub ref0c: u64,
    pub last_lookup: u64,
    pub ref2c: u64,
    pub trash_last: u64,
}

impl EntryRecord {
    const OFF_MEMORY: usize = 2;
    const OFF_STRUCTURE: usize = 4;
    const OFF_OBJECTS_PER_PAGE: usize = 6;
    const OFF_LOOKUPS_PER_PAGE: usize = 8;

    pub fn kind(&self) -> Result<EntryKind> {
        EntryKind::try_from(self.kind)
    }

    /// Pages per object strait.
    pub fn strait_pages(&self) -> u16 {
        1 << (self.memory & 0x0F)
    }

    /// Number of levels above the leaf level.
    pub fn depth(&self) -> u8 {
        (self.memory >> 12) as u8
    }
}

/// Read view over an index page holding entry records.
pub struct IndexPage<'a> {
    buf: &'a [u8],
}

impl<'a> IndexPage<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        expect_type(buf, PageType::Index)?;
        Ok(Self { buf })
    }

    pub fn capacity(&self) -> usize {
        (self.buf.len() - HEADER_SIZE) / ENTRY_RECORD_SIZE
    }

    fn slot_offset(&self, slot: usize) -> Result<usize> {
        if slot >= self.capacity() {
            return Err(StoreError::critical(format!("entry slot {slot} out of range")));
        }
        Ok(HEADER_SIZE + slot * ENTRY_RECORD_SIZE)
    }

    pub fn entry(&self, slot: usize) -> Result<EntryRecord> {
        let base = self.slot_offset(slot)?;
        let b = self.buf;
        let field = |f: EntryField| get_u64(b, base + f.offset());
        Ok(EntryRecord {
            kind: b[base],
            memory: get_u16(b, base + EntryRecord::OFF_MEMORY),
            structure_id: get_u16(b, base + EntryRecord::OFF_STRUCTURE),
            objects_per_page: get_u16(b, base + EntryRecord::OFF_OBJECTS_PER_PAGE),
            lookups_per_page: get_u16(b, base + EntryRecord::OFF_LOOKUPS_PER_PAGE),
            ref0: field(EntryField::Ref0),
            ref1: field(EntryField::Ref1),
            ref2: field(EntryField::Ref2),
            ref0c: field(EntryField::Ref0Count),
            last_lookup: field(EntryField::LastLookup),
            ref2c: field(EntryField::Ref2Count),
            trash_last: field(EntryField::TrashLast),
        })
    }
}

pub struct IndexPageMut<'a> {
    buf: &'a mut [u8],
}

impl<'a> IndexPageMut<'a> {
    pub fn init(buf: &'a mut [u8]) -> Self {
        init_common(buf, PageType::Index);
        Self { buf }
    }

    pub fn new(buf: &'a mut [u8]) -> Result<Self> {
        expect_type(buf, PageType::Index)?;
        Ok(Self { buf })
    }

    pub fn as_ref(&self) -> IndexPage<'_> {
        IndexPage { buf: &self.buf[..] }
    }

    pub fn set_entry(&mut self, slot: usize, record: &EntryRecord) -> Result<()> {
        let base = self.as_ref().slot_offset(slot)?;
        let b = &mut *self.buf;
        b[base] = record.kind;
        b[base + 1] = 0;
        put_u16(b, base + EntryRecord::OFF_MEMORY, record.memory);
        put_u16(b, base + EntryRecord::OFF_STRUCTURE, record.structure_id);
        put_u16(b, base + EntryRecord::OFF_OBJECTS_PER_PAGE, record.objects_per_page);
        put_u16(b, base + EntryRecord::OFF_LOOKUPS_PER_PAGE, record.lookups_per_page);
        b[base + 10..base + 16].fill(0);
        put_u64(b, base + EntryField::Ref0.offset(), record.ref0);
        put_u64(b, base + EntryField::Ref1.offset(), record.ref1);
        put_u64(b, base + EntryField::Ref2.offset(), record.ref2);
        put_u64(b, base + EntryField::Ref0Count.offset(), record.ref0c);
        put_u64(b, base + EntryField::LastLookup.offset(), record.last_lookup);
        put_u64(b, base + EntryField::Ref2Count.offset(), record.ref2c);
        put_u64(b, base + EntryField::TrashLast.offset(), record.trash_last);
        Ok(())
    }

    /// Overwrites a single field, leaving the rest of the record untouched.
    pub fn set_field(&mut self, slot: usize, field: EntryField, value: u64) -> Result<()> {
        let base = self.as_ref().slot_offset(slot)?;
        match field {
            EntryField::Kind => self.buf[base] = value as u8,
            _ => put_u64(self.buf, base + field.offset(), value),
        }
        Ok(())
    }
}

// ============================================================================
// Object pages
// ============================================================================

/// Row geometry of an object page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RowLayout {
    pub row_size: u16,
    pub rows_per_page: u16,
}

impl RowLayout {
    pub fn new(page_size: usize, row_size: u16) -> Result<Self> {
        let size = row_size as usize;
        if size < ROW_MIN_SIZE || size > page_size - HEADER_SIZE {
            return Err(StoreError::invalid(format!(
                "row size {row_size} must be between {ROW_MIN_SIZE} and {}",
                page_size - HEADER_SIZE
            )));
        }
        let rows = ((page_size - HEADER_SIZE) / size).min(NO_FREE_ROW as usize - 1);
        Ok(Self {
            row_size,
            rows_per_page: rows as u16,
        })
    }

    /// Byte offset of a row inside its page.
    pub fn row_offset(&self, row: u16) -> usize {
        HEADER_SIZE + row as usize * self.row_size as usize
    }
}

/// Header values for a freshly initialized object page.
#[derive(Clone, Copy, Debug)]
pub struct ObjectInit {
    pub structure_id: u16,
    pub entry_id: u16,
    /// Logical page offset of this page inside its entry.
    pub page_offset: u64,
    pub trash_predecessor: PageId,
}

pub struct ObjectPage<'a> {
    buf: &'a [u8],
    layout: RowLayout,
}

impl<'a> ObjectPage<'a> {
    const OFF_PREDECESSOR: usize = 32;
    const OFF_STRUCTURE: usize = 40;
    const OFF_TRASH_HEAD: usize = 42;
    const OFF_TRASH_COUNT: usize = 44;
    const OFF_ENTRY: usize = 46;

    pub fn new(buf: &'a [u8], layout: RowLayout) -> Result<Self> {
        expect_type(buf, PageType::Object)?;
        if layout.row_offset(layout.rows_per_page) > buf.len() {
            return Err(StoreError::critical("row layout does not fit the page"));
        }
        Ok(Self { buf, layout })
    }

    pub fn structure_id(&self) -> u16 {
        get_u16(self.buf, Self::OFF_STRUCTURE)
    }

    pub fn entry_id(&self) -> u16 {
        get_u16(self.buf, Self::OFF_ENTRY)
    }

    pub fn page_offset(&self) -> u64 {
        get_u64(self.buf, OFF_LEFT)
    }

    pub fn trash_predecessor(&self) -> PageId {
        PageId(get_u64(self.buf, Self::OFF_PREDECESSOR))
    }

    pub fn trash_head(&self) -> u16 {
        get_u16(self.buf, Self::OFF_TRASH_HEAD)
    }

    pub fn trash_count(&self) -> u16 {
        get_u16(self.buf, Self::OFF_TRASH_COUNT)
    }

    pub fn is_chained(&self) -> bool {
        PageFlags::from_bits_retain(self.buf[OFF_FLAGS]).contains(PageFlags::TRASH_CHAINED)
    }

    pub fn capacity(&self) -> u16 {
        self.layout.rows_per_page
    }

    /// More than half of the rows are free.
    pub fn is_critical(&self) -> bool {
        self.trash_count() as u32 * 2 > self.capacity() as u32
    }

    fn row_base(&self, row: u16) -> Result<usize> {
        if row >= self.layout.rows_per_page {
            return Err(StoreError::invalid(format!(
                "row {row} is beyond the {} rows of the page",
                self.layout.rows_per_page
            )));
        }
        Ok(self.layout.row_offset(row))
    }

    pub fn row_flags(&self, row: u16) -> Result<RowFlags> {
        let base = self.row_base(row)?;
        Ok(RowFlags::from_bits_retain(get_u32(self.buf, base)))
    }

    /// Free-list link of a deleted row.
    pub fn next_free(&self, row: u16) -> Result<u16> {
        let base = self.row_base(row)?;
        Ok(get_u16(self.buf, base + ROW_FLAGS_SIZE))
    }

    /// Row payload after the flags word.
    pub fn payload(&self, row: u16) -> Result<&'a [u8]> {
        let base = self.row_base(row)?;
        Ok(&self.buf[base + ROW_FLAGS_SIZE..base + self.layout.row_size as usize])
    }
}

pub struct ObjectPageMut<'a> {
    buf: &'a mut [u8],
    layout: RowLayout,
}

impl<'a> ObjectPageMut<'a> {
    /// Formats the buffer as an object page whose rows are all free and
    /// linked in ascending order.
    pub fn init(buf: &'a mut [u8], layout: RowLayout, init: ObjectInit) -> Result<Self> {
        init_common(buf, PageType::Object);
        let mut page = Self::new(buf, layout)?;
        put_u64(page.buf, OFF_LEFT, init.page_offset);
        put_u64(page.buf, ObjectPage::OFF_PREDECESSOR, init.trash_predecessor.0);
        put_u16(page.buf, ObjectPage::OFF_STRUCTURE, init.structure_id);
        put_u16(page.buf, ObjectPage::OFF_ENTRY, init.entry_id);
        let rows = layout.rows_per_page;
        for row in 0..rows {
            let base = layout.row_offset(row);
            put_u32(page.buf, base, RowFlags::DELETED.bits());
            let next = if row + 1 < rows { row + 1 } else { NO_FREE_ROW };
            put_u16(page.buf, base + ROW_FLAGS_SIZE, next);
        }
        page.set_trash_head(if rows > 0 { 0 } else { NO_FREE_ROW });
        page.set_trash_count(rows);
        page.set_chained(true);
        Ok(page)
    }

    pub fn new(buf: &'a mut [u8], layout: RowLayout) -> Result<Self> {
        ObjectPage::new(buf, layout)?;
        Ok(Self { buf, layout })
    }

    pub fn as_ref(&self) -> ObjectPage<'_> {
        ObjectPage {
            buf: &self.buf[..],
            layout: self.layout,
        }
    }

    pub fn set_trash_predecessor(&mut self, page: PageId) {
        put_u64(self.buf, ObjectPage::OFF_PREDECESSOR, page.0);
    }

    fn set_trash_head(&mut self, row: u16) {
        put_u16(self.buf, ObjectPage::OFF_TRASH_HEAD, row);
    }

    fn set_trash_count(&mut self, count: u16) {
        put_u16(self.buf, ObjectPage::OFF_TRASH_COUNT, count);
    }

    pub fn set_chained(&mut self, chained: bool) {
        let mut flags = PageFlags::from_bits_retain(self.buf[OFF_FLAGS]);
        flags.set(PageFlags::TRASH_CHAINED, chained);
        self.buf[OFF_FLAGS] = flags.bits();
    }

    pub fn set_row_flags(&mut self, row: u16, flags: RowFlags) -> Result<()> {
        let base = self.as_ref().row_base(row)?;
        put_u32(self.buf, base, flags.bits());
        Ok(())
    }

    fn set_next_free(&mut self, row: u16, next: u16) -> Result<()> {
        let base = self.as_ref().row_base(row)?;
        put_u16(self.buf, base + ROW_FLAGS_SIZE, next);
        Ok(())
    }

    pub fn payload_mut(&mut self, row: u16) -> Result<&mut [u8]> {
        let base = self.as_ref().row_base(row)?;
        let end = base + self.layout.row_size as usize;
        Ok(&mut self.buf[base + ROW_FLAGS_SIZE..end])
    }

    /// Takes the head of the trash list. `None` means the list is empty.
    pub fn pop_free_row(&mut self) -> Result<Option<u16>> {
        let head = self.as_ref().trash_head();
        if head == NO_FREE_ROW {
            return Ok(None);
        }
        let view = self.as_ref();
        let flags = view.row_flags(head)?;
        if !flags.contains(RowFlags::DELETED) {
            return Err(StoreError::critical(format!(
                "trash head row {head} is not marked deleted"
            )));
        }
        let next = view.next_free(head)?;
        let count = view.trash_count();
        if count == 0 {
            return Err(StoreError::critical("trash list is non-empty but its count is 0"));
        }
        self.set_trash_head(next);
        self.set_trash_count(count - 1);
        self.set_row_flags(head, flags - RowFlags::DELETED)?;
        Ok(Some(head))
    }

    /// Marks a row deleted and pushes it onto the trash list. Returns false
    /// if it was already deleted.
    pub fn push_free_row(&mut self, row: u16) -> Result<bool> {
        let flags = self.as_ref().row_flags(row)?;
        if flags.contains(RowFlags::DELETED) {
            return Ok(false);
        }
        let head = self.as_ref().trash_head();
        let count = self.as_ref().trash_count();
        self.set_row_flags(row, flags | RowFlags::DELETED)?;
        self.set_next_free(row, head)?;
        self.set_trash_head(row);
        self.set_trash_count(count + 1);
        Ok(true)
    }

    /// Splices a deleted row out of the middle of the trash list.
    pub fn unlink_free_row(&mut self, row: u16) -> Result<()> {
        let flags = self.as_ref().row_flags(row)?;
        if !flags.contains(RowFlags::DELETED) {
            return Err(StoreError::invalid(format!("row {row} is not deleted")));
        }
        let mut prev: Option<u16> = None;
        let mut cur = self.as_ref().trash_head();
        let mut steps = 0u32;
        while cur != NO_FREE_ROW {
            if steps > self.layout.rows_per_page as u32 {
                return Err(StoreError::critical("cycle in the page trash list"));
            }
            let next = self.as_ref().next_free(cur)?;
            if cur == row {
                match prev {
                    None => self.set_trash_head(next),
                    Some(p) => self.set_next_free(p, next)?,
                }
                let count = self.as_ref().trash_count();
                self.set_trash_count(count.saturating_sub(1));
                self.set_row_flags(row, flags - RowFlags::DELETED)?;
                return Ok(());
            }
            prev = Some(cur);
            cur = next;
            steps += 1;
        }
        Err(StoreError::critical(format!(
            "row {row} is marked deleted but missing from the trash list"
        )))
    }
}

// ============================================================================
// Lookup pages
// ============================================================================

/// One reference of a lookup node.
///
/// At the leaf level `target` is the last page of an object strait and
/// `offset` the logical offset of that page. Above the leaf level `target`
/// is a child node and `offset` the first logical offset of its subtree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LookupRef {
    pub target: PageId,
    pub offset: u64,
}

pub struct LookupPage<'a> {
    buf: &'a [u8],
}

impl<'a> LookupPage<'a> {
    const OFF_PARENT: usize = 32;
    const OFF_ENTRY: usize = 40;
    const OFF_REF_COUNT: usize = 42;
    const OFF_DEPTH: usize = 44;

    pub fn new(buf: &'a [u8]) -> Result<Self> {
        expect_type(buf, PageType::Lookup)?;
        let page = Self { buf };
        if page.ref_count() as usize > page.capacity() {
            return Err(StoreError::critical("lookup reference count exceeds the page"));
        }
        Ok(page)
    }

    pub fn parent(&self) -> PageId {
        PageId(get_u64(self.buf, Self::OFF_PARENT))
    }

    pub fn entry_id(&self) -> u16 {
        get_u16(self.buf, Self::OFF_ENTRY)
    }

    pub fn ref_count(&self) -> u16 {
        get_u16(self.buf, Self::OFF_REF_COUNT)
    }

    pub fn depth(&self) -> u8 {
        self.buf[Self::OFF_DEPTH]
    }

    pub fn left(&self) -> PageId {
        PageId(get_u64(self.buf, OFF_LEFT))
    }

    pub fn right(&self) -> PageId {
        PageId(get_u64(self.buf, OFF_RIGHT))
    }

    /// References that fit the page, independent of any per-entry cap.
    pub fn capacity(&self) -> usize {
        (self.buf.len() - HEADER_SIZE) / LOOKUP_REF_SIZE
    }

    pub fn reference(&self, idx: u16) -> Result<LookupRef> {
        if idx >= self.ref_count() {
            return Err(StoreError::critical(format!("lookup reference {idx} out of range")));
        }
        let base = HEADER_SIZE + idx as usize * LOOKUP_REF_SIZE;
        Ok(LookupRef {
            target: PageId(get_u64(self.buf, base)),
            offset: get_u64(self.buf, base + 8),
        })
    }

    pub fn references(&self) -> impl Iterator<Item = LookupRef> + '_ {
        (0..self.ref_count()).filter_map(move |idx| self.reference(idx).ok())
    }
}

pub struct LookupPageMut<'a> {
    buf: &'a mut [u8],
}

impl<'a> LookupPageMut<'a> {
    pub fn init(buf: &'a mut [u8], entry_id: u16, depth: u8) -> Self {
        init_common(buf, PageType::Lookup);
        put_u16(buf, LookupPage::OFF_ENTRY, entry_id);
        buf[LookupPage::OFF_DEPTH] = depth;
        Self { buf }
    }

    pub fn new(buf: &'a mut [u8]) -> Result<Self> {
        LookupPage::new(buf)?;
        Ok(Self { buf })
    }

    pub fn as_ref(&self) -> LookupPage<'_> {
        LookupPage { buf: &self.buf[..] }
    }

    pub fn set_parent(&mut self, parent: PageId) {
        put_u64(self.buf, LookupPage::OFF_PARENT, parent.0);
    }

    pub fn set_left(&mut self, left: PageId) {
        put_u64(self.buf, OFF_LEFT, left.0);
    }

    pub fn set_right(&mut self, right: PageId) {
        put_u64(self.buf, OFF_RIGHT, right.0);
    }

    /// Appends a reference. Returns false when `limit` references are
    /// already present.
    pub fn push(&mut self, reference: LookupRef, limit: usize) -> Result<bool> {
        let count = self.as_ref().ref_count();
        let limit = limit.min(self.as_ref().capacity());
        if count as usize >= limit {
            return Ok(false);
        }
        if count > 0 {
            let last = self.as_ref().reference(count - 1)?;
            if last.offset >= reference.offset {
                return Err(StoreError::critical(format!(
                    "lookup reference offset {} does not follow {}",
                    reference.offset, last.offset
                )));
            }
        }
        let base = HEADER_SIZE + count as usize * LOOKUP_REF_SIZE;
        put_u64(self.buf, base, reference.target.0);
        put_u64(self.buf, base + 8, reference.offset);
        put_u16(self.buf, LookupPage::OFF_REF_COUNT, count + 1);
        Ok(true)
    }

    /// Drops the last reference if it points at `target`.
    pub fn pop_if(&mut self, target: PageId) -> Result<bool> {
        let count = self.as_ref().ref_count();
        if count == 0 || self.as_ref().reference(count - 1)?.target != target {
            return Ok(false);
        }
        let base = HEADER_SIZE + (count as usize - 1) * LOOKUP_REF_SIZE;
        self.buf[base..base + LOOKUP_REF_SIZE].fill(0);
        put_u16(self.buf, LookupPage::OFF_REF_COUNT, count - 1);
        Ok(true)
    }
}

// ============================================================================
// Deleted-page records
// ============================================================================

/// A run of free pages recorded on a deleted page. `start == 0` is a null slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeletedRef {
    pub start: PageId,
    pub count: u16,
}

impl DeletedRef {
    pub fn is_null(&self) -> bool {
        self.start.is_null()
    }
}

pub struct DeletedPage<'a> {
    buf: &'a [u8],
}

impl<'a> DeletedPage<'a> {
    const OFF_LARGEST: usize = 32;
    const OFF_REF_COUNT: usize = 34;
    const OFF_TOTAL: usize = 36;

    pub fn new(buf: &'a [u8]) -> Result<Self> {
        expect_type(buf, PageType::Deleted)?;
        Ok(Self { buf })
    }

    pub fn largest_strait(&self) -> u16 {
        get_u16(self.buf, Self::OFF_LARGEST)
    }

    pub fn ref_count(&self) -> u16 {
        get_u16(self.buf, Self::OFF_REF_COUNT)
    }

    pub fn total_pages(&self) -> u32 {
        get_u32(self.buf, Self::OFF_TOTAL)
    }

    /// Older neighbour in the chain.
    pub fn left(&self) -> PageId {
        PageId(get_u64(self.buf, OFF_LEFT))
    }

    /// Newer neighbour in the chain.
    pub fn right(&self) -> PageId {
        PageId(get_u64(self.buf, OFF_RIGHT))
    }

    pub fn capacity(&self) -> usize {
        (self.buf.len() - HEADER_SIZE) / DELETED_REF_SIZE
    }

    pub fn is_full(&self) -> bool {
        self.ref_count() as usize >= self.capacity()
    }

    pub fn reference(&self, idx: usize) -> DeletedRef {
        let base = HEADER_SIZE + idx * DELETED_REF_SIZE;
        DeletedRef {
            start: PageId(get_u64(self.buf, base)),
            count: get_u16(self.buf, base + 8),
        }
    }
}

pub struct DeletedPageMut<'a> {
    buf: &'a mut [u8],
}

impl<'a> DeletedPageMut<'a> {
    pub fn init(buf: &'a mut [u8]) -> Self {
        init_common(buf, PageType::Deleted);
        Self { buf }
    }

    pub fn new(buf: &'a mut [u8]) -> Result<Self> {
        DeletedPage::new(buf)?;
        Ok(Self { buf })
    }

    pub fn as_ref(&self) -> DeletedPage<'_> {
        DeletedPage { buf: &self.buf[..] }
    }

    pub fn set_left(&mut self, left: PageId) {
        put_u64(self.buf, OFF_LEFT, left.0);
    }

    pub fn set_right(&mut self, right: PageId) {
        put_u64(self.buf, OFF_RIGHT, right.0);
    }

    fn set_ref_count(&mut self, count: u16) {
        put_u16(self.buf, DeletedPage::OFF_REF_COUNT, count);
    }

    fn set_total_pages(&mut self, total: u32) {
        put_u32(self.buf, DeletedPage::OFF_TOTAL, total);
    }

    fn write_reference(&mut self, idx: usize, reference: DeletedRef) {
        let base = HEADER_SIZE + idx * DELETED_REF_SIZE;
        self.buf[base..base + DELETED_REF_SIZE].fill(0);
        put_u64(self.buf, base, reference.start.0);
        put_u16(self.buf, base + 8, reference.count);
    }

    fn recompute_largest(&mut self) {
        let view = self.as_ref();
        let largest = (0..view.capacity())
            .map(|idx| view.reference(idx))
            .filter(|r| !r.is_null())
            .map(|r| r.count)
            .max()
            .unwrap_or(0);
        put_u16(self.buf, DeletedPage::OFF_LARGEST, largest);
    }

    /// Takes `count` pages from the first reference long enough to hold them.
    pub fn take(&mut self, count: u16) -> Option<PageId> {
        let view = self.as_ref();
        if view.largest_strait() < count {
            return None;
        }
        let idx = (0..view.capacity()).find(|&idx| {
            let r = view.reference(idx);
            !r.is_null() && r.count >= count
        })?;
        let found = view.reference(idx);
        let refs = view.ref_count();
        let total = view.total_pages();
        if found.count == count {
            self.write_reference(idx, DeletedRef::default());
            self.set_ref_count(refs.saturating_sub(1));
        } else {
            self.write_reference(
                idx,
                DeletedRef {
                    start: PageId(found.start.0 + count as u64),
                    count: found.count - count,
                },
            );
        }
        self.set_total_pages(total.saturating_sub(count as u32));
        self.recompute_largest();
        Some(found.start)
    }

    /// Extends a reference that is physically adjacent to the strait.
    pub fn merge(&mut self, start: PageId, count: u16) -> bool {
        let view = self.as_ref();
        let end = start.0 + count as u64;
        let hit = (0..view.capacity()).find_map(|idx| {
            let r = view.reference(idx);
            if r.is_null() || r.count as u32 + count as u32 > u16::MAX as u32 {
                return None;
            }
            if r.start.0 + r.count as u64 == start.0 {
                Some((idx, DeletedRef { start: r.start, count: r.count + count }))
            } else if end == r.start.0 {
                Some((idx, DeletedRef { start, count: r.count + count }))
            } else {
                None
            }
        });
        let Some((idx, merged)) = hit else {
            return false;
        };
        let total = view.total_pages();
        self.write_reference(idx, merged);
        self.set_total_pages(total + count as u32);
        self.recompute_largest();
        true
    }

    /// Stores the strait in a null slot. Returns false when the page is full.
    pub fn insert(&mut self, start: PageId, count: u16) -> bool {
        let view = self.as_ref();
        let Some(idx) = (0..view.capacity()).find(|&idx| view.reference(idx).is_null()) else {
            return false;
        };
        let refs = view.ref_count();
        let total = view.total_pages();
        self.write_reference(idx, DeletedRef { start, count });
        self.set_ref_count(refs + 1);
        self.set_total_pages(total + count as u32);
        self.recompute_largest();
        true
    }
}

// ============================================================================
// Structure records
// ============================================================================

/// Definition of a fixed-size row layout, stored as a row of the structure
/// chapter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StructureDef {
    /// Full row size including the flags word.
    pub fixed_len: u16,
    pub conf_len: u16,
    pub version: u16,
    pub flags: u8,
    pub data_ptr_count: u8,
}

impl StructureDef {
    /// Row size of the structure chapter itself.
    pub const ROW_SIZE: u16 = (ROW_FLAGS_SIZE + 8) as u16;

    pub fn read(payload: &[u8]) -> Self {
        Self {
            fixed_len: get_u16(payload, 0),
            conf_len: get_u16(payload, 2),
            version: get_u16(payload, 4),
            flags: payload[6],
            data_ptr_count: payload[7],
        }
    }

    pub fn write(&self, payload: &mut [u8]) {
        put_u16(payload, 0, self.fixed_len);
        put_u16(payload, 2, self.conf_len);
        put_u16(payload, 4, self.version);
        payload[6] = self.flags;
        payload[7] = self.data_ptr_count;
    }
}

impl fmt::Display for StructureDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "structure(len={}, version={})", self.fixed_len, self.version)
    }
}

#[cfg(test)]
mod page_tests {
    use super::*;

    const PAGE: usize = 4096;

    fn layout(row_size: u16) -> RowLayout {
        RowLayout::new(PAGE, row_size).unwrap()
    }

    fn object_page(buf: &mut [u8], row_size: u16) -> ObjectPageMut<'_> {
        ObjectPageMut::init(
            buf,
            layout(row_size),
            ObjectInit {
                structure_id: 7,
                entry_id: 4,
                page_offset: 3,
                trash_predecessor: PageId(11),
            },
        )
        .unwrap()
    }

    #[test]
    fn fresh_object_page_has_every_row_linked_in_order() {
        let mut buf = vec![0u8; PAGE];
        let page = object_page(&mut buf, 1012);
        let view = page.as_ref();
        assert_eq!(view.capacity(), 4);
        assert_eq!(view.trash_count(), 4);
        assert_eq!(view.trash_head(), 0);
        assert_eq!(view.page_offset(), 3);
        assert_eq!(view.trash_predecessor(), PageId(11));
        assert!(view.is_chained());
        for row in 0..4 {
            assert!(view.row_flags(row).unwrap().contains(RowFlags::DELETED));
        }
        assert_eq!(view.next_free(0).unwrap(), 1);
        assert_eq!(view.next_free(3).unwrap(), NO_FREE_ROW);
    }

    #[test]
    fn pop_push_and_unlink_keep_count_in_step() {
        let mut buf = vec![0u8; PAGE];
        let mut page = object_page(&mut buf, 1012);
        assert_eq!(page.pop_free_row().unwrap(), Some(0));
        assert_eq!(page.pop_free_row().unwrap(), Some(1));
        assert_eq!(page.as_ref().trash_count(), 2);
        assert!(!page.as_ref().row_flags(0).unwrap().contains(RowFlags::DELETED));

        assert!(page.push_free_row(0).unwrap());
        assert!(!page.push_free_row(0).unwrap(), "second delete is a no-op");
        assert_eq!(page.as_ref().trash_head(), 0);
        assert_eq!(page.as_ref().trash_count(), 3);

        page.unlink_free_row(3).unwrap();
        assert_eq!(page.as_ref().trash_count(), 2);
        assert_eq!(page.pop_free_row().unwrap(), Some(0));
        assert_eq!(page.pop_free_row().unwrap(), Some(2));
        assert_eq!(page.pop_free_row().unwrap(), None);
        assert!(page.unlink_free_row(1).is_err());
    }

    #[test]
    fn critical_threshold_is_more_than_half() {
        let mut buf = vec![0u8; PAGE];
        let mut page = object_page(&mut buf, 1012);
        for _ in 0..4 {
            page.pop_free_row().unwrap();
        }
        page.push_free_row(0).unwrap();
        page.push_free_row(1).unwrap();
        assert!(!page.as_ref().is_critical());
        page.push_free_row(2).unwrap();
        assert!(page.as_ref().is_critical());
    }

    #[test]
    fn checksum_covers_everything_but_itself() {
        let mut buf = vec![0u8; PAGE];
        object_page(&mut buf, 64);
        update_checksum(&mut buf);
        assert!(checksum_matches(&buf));
        buf[PAGE - 1] ^= 0xFF;
        assert!(!checksum_matches(&buf));
    }

    #[test]
    fn lookup_refs_must_increase() {
        let mut buf = vec![0u8; PAGE];
        let mut node = LookupPageMut::init(&mut buf, 4, 0);
        let first = LookupRef { target: PageId(20), offset: 1 };
        assert!(node.push(first, 2).unwrap());
        assert!(node
            .push(LookupRef { target: PageId(30), offset: 1 }, 2)
            .is_err());
        assert!(node.push(LookupRef { target: PageId(22), offset: 3 }, 2).unwrap());
        assert!(!node.push(LookupRef { target: PageId(24), offset: 5 }, 2).unwrap());
        assert!(node.pop_if(PageId(22)).unwrap());
        assert!(!node.pop_if(PageId(22)).unwrap());
        assert_eq!(node.as_ref().references().collect::<Vec<_>>(), vec![first]);
    }

    #[test]
    fn deleted_record_splits_and_merges() {
        let mut buf = vec![0u8; PAGE];
        let mut record = DeletedPageMut::init(&mut buf);
        assert!(record.insert(PageId(100), 4));
        assert_eq!(record.take(5), None);
        assert_eq!(record.take(3), Some(PageId(100)));
        assert_eq!(record.as_ref().reference(0), DeletedRef { start: PageId(103), count: 1 });
        assert_eq!(record.as_ref().largest_strait(), 1);

        assert!(record.merge(PageId(104), 2), "merge after the end");
        assert!(record.merge(PageId(101), 2), "merge before the start");
        assert_eq!(record.as_ref().reference(0), DeletedRef { start: PageId(101), count: 5 });
        assert_eq!(record.as_ref().total_pages(), 5);
        assert_eq!(record.as_ref().ref_count(), 1);

        assert_eq!(record.take(5), Some(PageId(101)));
        assert_eq!(record.as_ref().ref_count(), 0);
        assert_eq!(record.as_ref().largest_strait(), 0);
    }

    #[test]
    fn merge_refuses_to_overflow_the_counter() {
        let mut buf = vec![0u8; PAGE];
        let mut record = DeletedPageMut::init(&mut buf);
        assert!(record.insert(PageId(10), u16::MAX));
        assert!(!record.merge(PageId(10 + u16::MAX as u64), 1));
    }

    #[test]
    fn entry_records_survive_field_updates() {
        let mut buf = vec![0u8; PAGE];
        let mut index = IndexPageMut::init(&mut buf);
        let record = EntryRecord {
            kind: EntryKind::Object as u8,
            memory: (2 << 12) | 1,
            structure_id: 3,
            objects_per_page: 4,
            lookups_per_page: 253,
            ref1: 9,
            last_lookup: 11,
            ..Default::default()
        };
        index.set_entry(5, &record).unwrap();
        index.set_field(5, EntryField::TrashLast, 42).unwrap();
        let read = index.as_ref().entry(5).unwrap();
        assert_eq!(read.trash_last, 42);
        assert_eq!(read.depth(), 2);
        assert_eq!(read.strait_pages(), 2);
        assert_eq!(read.kind().unwrap(), EntryKind::Object);
        assert!(index.as_ref().entry(index.as_ref().capacity()).is_err());
    }

    #[test]
    fn header_rejects_foreign_files() {
        let buf = vec![0u8; PAGE];
        assert!(matches!(FileHeader::read(&buf), Err(StoreError::NotDatabase)));
    }
}
