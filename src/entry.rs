//! Entries and structures.
//!
//! An entry is one record of the index chapter describing a logical
//! sequence of object pages: its row structure, the size of its straits, the
//! depth of its lookup tree and the counters and pointers the lookup tree
//! and the trash chain hang off. A structure is a fixed row layout, stored as
//! one row of the structure chapter (reserved entry 2).

use tracing::{debug, error, warn};

use crate::{
    error::{Result, StoreError},
    lock::LockIntent,
    page::{
        EntryField, EntryKind, EntryRecord, IndexPage, IndexPageMut, LookupPageMut, LookupRef,
        ObjectPage, ObjectPageMut, RowFlags, RowLayout, StructureDef, HEADER_SIZE,
        LOOKUP_REF_SIZE,
    },
    page_cache::CacheHints,
    reserved,
    store::Worker,
    EntryId, PageId, RowId,
};

/// Deepest supported lookup tree, counted in levels above the leaves.
pub const MAX_DEPTH: u8 = 3;
pub const MAX_STRAIT_EXPONENT: u8 = 15;

/// Shape of a new entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryParams {
    pub structure_id: u16,
    /// Each object strait holds `1 << strait_exponent` pages.
    pub strait_exponent: u8,
    /// Levels of lookup nodes above the leaf level.
    pub depth: u8,
    /// Cap on references per lookup node. `None` fills the page.
    pub max_lookup_refs: Option<u16>,
}

impl EntryParams {
    pub fn new(structure_id: u16) -> Self {
        Self {
            structure_id,
            strait_exponent: 0,
            depth: 0,
            max_lookup_refs: None,
        }
    }

    pub fn with_strait_exponent(mut self, exponent: u8) -> Self {
        self.strait_exponent = exponent;
        self
    }

    pub fn with_depth(mut self, depth: u8) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_max_lookup_refs(mut self, refs: u16) -> Self {
        self.max_lookup_refs = Some(refs);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.strait_exponent > MAX_STRAIT_EXPONENT {
            return Err(StoreError::invalid(format!(
                "strait exponent {} exceeds {MAX_STRAIT_EXPONENT}",
                self.strait_exponent
            )));
        }
        if self.depth > MAX_DEPTH {
            return Err(StoreError::invalid(format!(
                "lookup depth {} exceeds {MAX_DEPTH}",
                self.depth
            )));
        }
        if self.max_lookup_refs == Some(0) {
            return Err(StoreError::invalid("lookup nodes need room for one reference"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Structure {
    pub id: u16,
    pub def: StructureDef,
}

impl Worker {
    /// Snapshot of an entry record.
    pub fn entry(&mut self, entry: EntryId) -> Result<EntryRecord> {
        let record = self.read_entry(entry)?;
        match record.kind()? {
            EntryKind::Init => Err(StoreError::NotFound("entry")),
            _ => Ok(record),
        }
    }

    pub(crate) fn structure_layout(&self) -> Result<RowLayout> {
        RowLayout::new(self.page_size(), StructureDef::ROW_SIZE)
    }

    /// Row layout of the pages of an entry.
    pub(crate) fn row_layout(&mut self, record: &EntryRecord) -> Result<RowLayout> {
        match record.kind()? {
            EntryKind::Structure => self.structure_layout(),
            EntryKind::Object => {
                if let Some(layout) = self.layouts.get(&record.structure_id) {
                    return Ok(*layout);
                }
                let def = self.structure(record.structure_id)?.def;
                let layout = RowLayout::new(self.page_size(), def.fixed_len)?;
                if layout.rows_per_page != record.objects_per_page {
                    return Err(StoreError::critical(format!(
                        "structure {} gives {} rows per page, the entry records {}",
                        record.structure_id, layout.rows_per_page, record.objects_per_page
                    )));
                }
                self.layouts.insert(record.structure_id, layout);
                Ok(layout)
            }
            kind => Err(StoreError::invalid(format!("a {kind:?} entry holds no rows"))),
        }
    }

    // ------------------------------------------------------------------------
    // Structures
    // ------------------------------------------------------------------------

    /// Registers a row layout of `fixed_len` bytes, flags word included.
    /// The structure chapter never grows.
    pub fn create_structure(&mut self, fixed_len: u16) -> Result<Structure> {
        RowLayout::new(self.page_size(), fixed_len)?;
        let layout = self.structure_layout()?;
        let _creation = self.locker.exclusive(LockIntent::StructureCreation)?;
        let location = self.pop_row(reserved::STRUCTURE, layout, false)?;
        let Ok(id) = u16::try_from(location.row_id) else {
            self.delete_row(reserved::STRUCTURE, location.row_id)?;
            return Err(StoreError::NoSpace);
        };
        let def = StructureDef {
            fixed_len,
            version: 1,
            ..Default::default()
        };
        self.pages
            .with_page(location.page, CacheHints::DIRTY, |view| {
                let mut buf = view.write();
                let mut page = ObjectPageMut::new(&mut buf, layout)?;
                def.write(page.payload_mut(location.row)?);
                Ok(())
            })?;
        debug!(structure = id, fixed_len, "created structure");
        Ok(Structure { id, def })
    }

    pub fn structure(&mut self, id: u16) -> Result<Structure> {
        let location = self.locate_row(reserved::STRUCTURE, id as RowId)?;
        let layout = self.structure_layout()?;
        let def = self
            .pages
            .with_page(location.page, CacheHints::empty(), |view| {
                let buf = view.read();
                let page = ObjectPage::new(&buf, layout)?;
                if page.row_flags(location.row)?.contains(RowFlags::DELETED) {
                    return Err(StoreError::NotFound("structure"));
                }
                Ok(StructureDef::read(page.payload(location.row)?))
            })?;
        Ok(Structure { id, def })
    }

    // ------------------------------------------------------------------------
    // Entries
    // ------------------------------------------------------------------------

    /// Creates an empty entry with its full lookup stack and returns its id.
    pub fn create_entry(&mut self, params: EntryParams) -> Result<EntryId> {
        params.validate()?;
        let structure = self.structure(params.structure_id)?;
        let layout = RowLayout::new(self.page_size(), structure.def.fixed_len)?;
        let capacity = (self.page_size() - HEADER_SIZE) / LOOKUP_REF_SIZE;
        let refs = params
            .max_lookup_refs
            .map_or(capacity, |max| (max as usize).min(capacity));

        let _creation = self.locker.exclusive(LockIntent::EntryCreation)?;
        let entry = self.claim_entry_slot()?;
        match self.build_entry(entry, &params, layout, refs as u16) {
            Ok(()) => {
                debug!(entry, depth = params.depth, "created entry");
                self.layouts.insert(params.structure_id, layout);
                Ok(entry)
            }
            Err(e) => {
                if let Err(undo) =
                    self.write_entry_field(entry, EntryField::Kind, EntryKind::Init as u64)
                {
                    error!(entry, error = %undo, "releasing a pending entry slot failed");
                }
                Err(e)
            }
        }
    }

    /// Finds an unused entry slot and marks it pending.
    fn claim_entry_slot(&mut self) -> Result<EntryId> {
        let geometry = self.geometry();
        let per_page = geometry.entries_per_page();
        for idx in 0..geometry.index_pages as usize {
            let page = PageId(1 + idx as u64);
            let first = idx * per_page;
            let claimed = self.pages.with_page(
                page,
                CacheHints::DIRTY | CacheHints::index(0),
                |view| {
                    let mut buf = view.write();
                    let slot = {
                        let index = IndexPage::new(&buf)?;
                        (0..index.capacity()).find(|&slot| {
                            first + slot >= reserved::FIRST_USER as usize
                                && matches!(index.entry(slot), Ok(r) if r.kind == EntryKind::Init as u8)
                        })
                    };
                    if let Some(slot) = slot {
                        IndexPageMut::new(&mut buf)?.set_field(
                            slot,
                            EntryField::Kind,
                            EntryKind::Pending as u64,
                        )?;
                    }
                    Ok(slot)
                },
            )?;
            if let Some(slot) = claimed {
                return EntryId::try_from(first + slot).map_err(|_| StoreError::NoSpace);
            }
        }
        warn!("index chapter is full");
        Err(StoreError::NoSpace)
    }

    fn build_entry(
        &mut self,
        entry: EntryId,
        params: &EntryParams,
        layout: RowLayout,
        refs: u16,
    ) -> Result<()> {
        let depth = params.depth as usize;
        let mut txn = self.begin_pages();
        let mut nodes = Vec::with_capacity(depth + 1);
        for _ in 0..=depth {
            nodes.push(txn.create(1)?.start);
        }
        for level in (0..=depth).rev() {
            let page = nodes[level];
            let parent = if level == 0 { PageId::NULL } else { nodes[level - 1] };
            let child = nodes.get(level + 1).copied();
            let _new = self.locker.exclusive(LockIntent::NewLookup(page))?;
            self.pages.with_page(
                page,
                CacheHints::DIRTY | CacheHints::index(level as u8),
                |view| {
                    let mut buf = view.write();
                    let mut node = LookupPageMut::init(&mut buf, entry, level as u8);
                    node.set_parent(parent);
                    if let Some(child) = child {
                        node.push(
                            LookupRef {
                                target: child,
                                offset: 0,
                            },
                            refs as usize,
                        )?;
                    }
                    Ok(())
                },
            )?;
        }
        let record = EntryRecord {
            kind: EntryKind::Object as u8,
            memory: ((params.depth as u16) << 12) | params.strait_exponent as u16,
            structure_id: params.structure_id,
            objects_per_page: layout.rows_per_page,
            lookups_per_page: refs,
            ref1: nodes[0].0,
            last_lookup: nodes[depth].0,
            ..Default::default()
        };
        self.write_entry(entry, &record)?;
        txn.commit();
        Ok(())
    }
}

#[cfg(test)]
mod entry_tests {
    use super::*;
    use crate::{config::StoreConfig, test_utils::TestDir};

    #[test]
    fn structures_round_trip() {
        let dir = TestDir::temp("entry_structures");
        let store = dir.store(StoreConfig::default());
        let mut worker = store.worker();
        let a = worker.create_structure(64).unwrap();
        let b = worker.create_structure(200).unwrap();
        assert_eq!((a.id, b.id), (0, 1));
        assert_eq!(worker.structure(1).unwrap().def.fixed_len, 200);
        assert!(matches!(worker.structure(2), Err(StoreError::NotFound(_))));
        assert!(matches!(worker.create_structure(2), Err(StoreError::Invalid(_))));
    }

    #[test]
    fn structure_chapter_does_not_grow() {
        let dir = TestDir::temp("entry_structure_full");
        let store = dir.store(StoreConfig::default());
        let mut worker = store.worker();
        let rows = worker.structure_layout().unwrap().rows_per_page;
        let pages = store.file().page_count();
        for _ in 0..rows {
            worker.create_structure(32).unwrap();
        }
        assert!(matches!(worker.create_structure(32), Err(StoreError::NoSpace)));
        assert_eq!(store.file().page_count(), pages);
        assert!(matches!(
            worker.structure(rows),
            Err(StoreError::Eof)
        ));
    }

    #[test]
    fn create_entry_builds_the_lookup_stack() {
        let dir = TestDir::temp("entry_create");
        let store = dir.store(StoreConfig::default());
        let mut worker = store.worker();
        let structure = worker.create_structure(64).unwrap();
        let pages = store.file().page_count();

        let params = EntryParams::new(structure.id)
            .with_depth(2)
            .with_strait_exponent(3)
            .with_max_lookup_refs(10);
        let entry = worker.create_entry(params).unwrap();
        assert_eq!(entry, reserved::FIRST_USER);
        assert_eq!(store.file().page_count(), pages + 3);

        let record = worker.entry(entry).unwrap();
        assert_eq!(record.kind().unwrap(), EntryKind::Object);
        assert_eq!(record.depth(), 2);
        assert_eq!(record.strait_pages(), 8);
        assert_eq!(record.lookups_per_page, 10);
        assert_eq!(record.ref0c, 0);
        assert_ne!(record.ref1, record.last_lookup);
        assert!(matches!(worker.locate(entry, 0), Err(StoreError::Eof)));

        let second = worker.create_entry(EntryParams::new(structure.id)).unwrap();
        assert_eq!(second, reserved::FIRST_USER + 1);
        assert!(matches!(
            worker.entry(second + 1),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn invalid_params_are_rejected() {
        let dir = TestDir::temp("entry_params");
        let store = dir.store(StoreConfig::default());
        let mut worker = store.worker();
        let structure = worker.create_structure(64).unwrap();
        for params in [
            EntryParams::new(structure.id).with_strait_exponent(16),
            EntryParams::new(structure.id).with_depth(4),
            EntryParams::new(structure.id).with_max_lookup_refs(0),
        ] {
            assert!(matches!(
                worker.create_entry(params),
                Err(StoreError::Invalid(_))
            ));
        }
        assert!(matches!(
            worker.create_entry(EntryParams::new(structure.id + 1)),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn failed_creation_releases_the_slot() {
        let dir = TestDir::temp("entry_rollback");
        let store = dir.store(StoreConfig::default());
        let mut worker = store.worker();
        let structure = worker.create_structure(64).unwrap();
        let spare = worker.create_pages(1).unwrap();
        worker.delete_pages(spare).unwrap();
        let in_use = |s: crate::allocator::AllocatorStats| s.file_pages - s.free_pages - s.record_pages;
        let before = store.allocator_stats().unwrap();

        store.set_page_limit(Some(store.file().page_count() + 2));
        let deep = EntryParams::new(structure.id).with_depth(3);
        assert!(matches!(worker.create_entry(deep), Err(StoreError::NoSpace)));
        assert_eq!(in_use(store.allocator_stats().unwrap()), in_use(before));

        store.set_page_limit(None);
        let entry = worker.create_entry(EntryParams::new(structure.id)).unwrap();
        assert_eq!(entry, reserved::FIRST_USER);
    }
}
