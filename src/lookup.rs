//! Per-entry lookup tree.
//!
//! Translates a logical page offset inside an entry to a physical page. The
//! tree has `depth + 1` levels of lookup nodes, level 0 being the root stored
//! in the entry's `ref1`. Every level is a left-to-right chain of siblings.
//!
//! - Leaf references hold `{ last page of a strait, logical offset of that
//!   page }`, so the strait covering an offset is the first reference whose
//!   offset is not below it.
//! - Branch references hold `{ child, first logical offset of the child's
//!   subtree }`, so the child covering an offset is the last reference whose
//!   start is not above it. Appending never rewrites an existing branch
//!   reference.
//!
//! # Algorithm
//!
//! - locate: iterative descent, one shared node lock at a time.
//! - append: allocate the strait, push its leaf reference into the rightmost
//!   leaf (`last_lookup`). A full node gets a new right sibling holding the
//!   pending reference and the sibling becomes the pending reference for the
//!   parent. A full root means the tree is full. New siblings are wired to
//!   their parents and left neighbours only after the ancestor push succeeded.
//!
//! # Complexity
//!
//! - locate: O(depth x references per node)
//! - append: O(depth) page visits plus one allocation per new node

use tracing::{debug, error, warn};

use crate::{
    error::{Result, StoreError},
    lock::LockIntent,
    page::{
        EntryField, EntryKind, EntryRecord, LookupPage, LookupPageMut, LookupRef, ObjectInit,
        ObjectPageMut, RowLayout,
    },
    page_cache::CacheHints,
    store::{PageTxn, Worker},
    trash::RowLocation,
    EntryId, PageId, RowId, Strait,
};

enum Step {
    Child(PageId),
    Found(PageId),
}

/// A lookup node created while growing, waiting to be wired into its level.
struct NewSibling {
    level: u8,
    page: PageId,
    /// The full node it continues.
    left: PageId,
}

#[cfg(feature = "invariant-checks")]
fn check_node(node: &LookupPage<'_>, entry: EntryId, level: u8) -> Result<()> {
    if node.entry_id() != entry || node.depth() != level {
        return Err(StoreError::critical(format!(
            "lookup node of entry {} at level {} visited as entry {entry} level {level}",
            node.entry_id(),
            node.depth()
        )));
    }
    Ok(())
}

#[cfg(not(feature = "invariant-checks"))]
fn check_node(_node: &LookupPage<'_>, _entry: EntryId, _level: u8) -> Result<()> {
    Ok(())
}

pub(crate) fn object_entry(record: &EntryRecord, entry: EntryId) -> Result<()> {
    match record.kind()? {
        EntryKind::Object => Ok(()),
        EntryKind::Init | EntryKind::Pending => Err(StoreError::NotFound("entry")),
        kind => Err(StoreError::invalid(format!(
            "entry {entry} is a {kind:?} entry without a lookup tree"
        ))),
    }
}

impl Worker {
    /// Physical page holding logical page `offset` of `entry`.
    pub fn locate(&mut self, entry: EntryId, offset: u64) -> Result<PageId> {
        let _counter = self.locker.shared(LockIntent::FreeCounter(entry))?;
        let record = self.read_entry(entry)?;
        object_entry(&record, entry)?;
        if offset >= record.ref0c {
            return Err(StoreError::Eof);
        }
        let depth = record.depth();
        let strait_pages = record.strait_pages() as u64;
        let mut node = PageId(record.ref1);
        for level in 0..=depth {
            let _node = self.locker.shared(LockIntent::Lookup(node))?;
            let step = self
                .pages
                .with_page(node, CacheHints::index(level), |view| {
                    let buf = view.read();
                    let lookup = LookupPage::new(&buf)?;
                    check_node(&lookup, entry, level)?;
                    if level < depth {
                        let child = lookup
                            .references()
                            .take_while(|r| r.offset <= offset)
                            .last()
                            .ok_or_else(|| {
                                StoreError::critical(format!(
                                    "lookup node {node} has no subtree covering offset {offset}"
                                ))
                            })?;
                        return Ok(Step::Child(child.target));
                    }
                    let leaf = lookup
                        .references()
                        .find(|r| r.offset >= offset)
                        .ok_or_else(|| {
                            StoreError::critical(format!(
                                "leaf {node} ends before offset {offset}"
                            ))
                        })?;
                    let distance = leaf.offset - offset;
                    if distance >= strait_pages || distance > leaf.target.0 {
                        return Err(StoreError::critical(format!(
                            "offset {offset} falls outside the strait ending at page {}",
                            leaf.target
                        )));
                    }
                    Ok(Step::Found(PageId(leaf.target.0 - distance)))
                })?;
            match step {
                Step::Child(child) => node = child,
                Step::Found(page) => return Ok(page),
            }
        }
        Err(StoreError::critical(format!(
            "descent of entry {entry} ended without reaching a leaf"
        )))
    }

    /// Page and row holding `row_id`.
    pub fn locate_row(&mut self, entry: EntryId, row_id: RowId) -> Result<RowLocation> {
        let record = self.read_entry(entry)?;
        let per_page = record.objects_per_page as u64;
        if per_page == 0 {
            return Err(StoreError::critical(format!(
                "entry {entry} records zero rows per page"
            )));
        }
        let offset = row_id / per_page;
        let row = (row_id % per_page) as u16;
        let page = match record.kind()? {
            // The structure chapter is one contiguous run of pages.
            EntryKind::Structure => {
                if offset >= record.ref0c {
                    return Err(StoreError::Eof);
                }
                PageId(record.ref0 + offset)
            }
            _ => self.locate(entry, offset)?,
        };
        Ok(RowLocation { page, row, row_id })
    }

    /// Allocates a new object strait for `entry`, indexes it in the lookup
    /// tree and puts its pages at the front of the trash chain.
    pub fn append_object_strait(&mut self, entry: EntryId) -> Result<Strait> {
        let _trash = self.locker.exclusive(LockIntent::TrashLast(entry))?;
        let _counter = self.locker.exclusive(LockIntent::FreeCounter(entry))?;
        let record = self.read_entry(entry)?;
        object_entry(&record, entry)?;
        let layout = self.row_layout(&record)?;
        let count = record.strait_pages();
        let first_offset = record.ref0c;

        let mut txn = self.begin_pages();
        let strait = txn.create(count)?;
        self.init_object_strait(entry, &record, layout, strait)?;
        let leaf = LookupRef {
            target: strait.last(),
            offset: first_offset + count as u64 - 1,
        };
        let new_leaf = self.insert_reference(entry, &record, leaf, first_offset, &mut txn)?;
        txn.commit();

        #[cfg(feature = "invariant-checks")]
        {
            let current = self.read_entry(entry)?.ref0c;
            if current != first_offset {
                return Err(StoreError::critical(format!(
                    "page counter of entry {entry} moved from {first_offset} to {current} while held"
                )));
            }
        }
        if let Some(leaf) = new_leaf {
            self.write_entry_field(entry, EntryField::LastLookup, leaf.0)?;
        }
        self.write_entry_field(entry, EntryField::Ref0Count, first_offset + count as u64)?;
        if record.ref0 == 0 {
            self.write_entry_field(entry, EntryField::Ref0, strait.start.0)?;
        }
        self.write_entry_field(entry, EntryField::TrashLast, strait.start.0)?;
        debug!(entry, start = %strait.start, count, offset = first_offset, "appended object strait");
        Ok(strait)
    }

    /// Formats the pages of a fresh strait as empty object pages chained in
    /// ascending order in front of the current trash chain.
    fn init_object_strait(
        &mut self,
        entry: EntryId,
        record: &EntryRecord,
        layout: RowLayout,
        strait: Strait,
    ) -> Result<()> {
        for (i, page) in strait.pages().enumerate() {
            let predecessor = if i + 1 < strait.count as usize {
                page.offset(1)
            } else {
                PageId(record.trash_last)
            };
            let init = ObjectInit {
                structure_id: record.structure_id,
                entry_id: entry,
                page_offset: record.ref0c + i as u64,
                trash_predecessor: predecessor,
            };
            self.pages.with_page(page, CacheHints::DIRTY, |view| {
                ObjectPageMut::init(&mut view.write(), layout, init)?;
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Pushes a leaf reference, splitting full nodes upward. Returns the new
    /// rightmost leaf if one was created.
    fn insert_reference(
        &mut self,
        entry: EntryId,
        record: &EntryRecord,
        leaf: LookupRef,
        start_offset: u64,
        txn: &mut PageTxn,
    ) -> Result<Option<PageId>> {
        let limit = record.lookups_per_page as usize;
        let mut pending = leaf;
        let mut node = PageId(record.last_lookup);
        let mut created: Vec<NewSibling> = Vec::new();
        let mut level = record.depth();
        let anchor = loop {
            let hints = CacheHints::DIRTY | CacheHints::index(level);
            let (pushed, parent) = {
                let _node = self.locker.exclusive(LockIntent::Lookup(node))?;
                self.pages.with_page(node, hints, |view| {
                    let mut buf = view.write();
                    let mut lookup = LookupPageMut::new(&mut buf)?;
                    check_node(&lookup.as_ref(), entry, level)?;
                    let pushed = lookup.push(pending, limit)?;
                    Ok((pushed, lookup.as_ref().parent()))
                })?
            };
            if pushed {
                break node;
            }
            if level == 0 {
                warn!(entry, "lookup tree is full");
                return Err(StoreError::NoSpace);
            }
            let sibling = txn.create(1)?.start;
            {
                let _new = self.locker.exclusive(LockIntent::NewLookup(sibling))?;
                self.pages.with_page(sibling, hints, |view| {
                    let mut buf = view.write();
                    let mut lookup = LookupPageMut::init(&mut buf, entry, level);
                    lookup.set_left(node);
                    lookup.push(pending, limit)?;
                    Ok(())
                })?;
            }
            created.push(NewSibling {
                level,
                page: sibling,
                left: node,
            });
            pending = LookupRef {
                target: sibling,
                offset: start_offset,
            };
            node = parent;
            level -= 1;
        };

        if created.is_empty() {
            return Ok(None);
        }
        if let Err(e) = self.wire_siblings(anchor, &created) {
            let top = created.last().map(|s| s.page).unwrap_or_default();
            let undo = self.pages.with_page(anchor, CacheHints::DIRTY, |view| {
                LookupPageMut::new(&mut view.write())?.pop_if(top)
            });
            if let Err(undo) = undo {
                error!(entry, page = %anchor, error = %undo, "dangling lookup reference");
            }
            return Err(e);
        }
        Ok(created.first().map(|s| s.page))
    }

    /// Sets parent pointers of new siblings top-down, then links them to
    /// their left neighbours.
    fn wire_siblings(&mut self, anchor: PageId, created: &[NewSibling]) -> Result<()> {
        let mut parent = anchor;
        for sibling in created.iter().rev() {
            self.pages.with_page(
                sibling.page,
                CacheHints::DIRTY | CacheHints::index(sibling.level),
                |view| {
                    LookupPageMut::new(&mut view.write())?.set_parent(parent);
                    Ok(())
                },
            )?;
            parent = sibling.page;
        }
        for (done, sibling) in created.iter().rev().enumerate() {
            let _node = self.locker.exclusive(LockIntent::Lookup(sibling.left))?;
            let linked = self.pages.with_page(
                sibling.left,
                CacheHints::DIRTY | CacheHints::index(sibling.level),
                |view| {
                    LookupPageMut::new(&mut view.write())?.set_right(sibling.page);
                    Ok(())
                },
            );
            if let Err(e) = linked {
                for undo in created.iter().rev().take(done) {
                    let cleared = self.pages.with_page(undo.left, CacheHints::DIRTY, |view| {
                        LookupPageMut::new(&mut view.write())?.set_right(PageId::NULL);
                        Ok(())
                    });
                    if let Err(err) = cleared {
                        error!(page = %undo.left, error = %err, "dangling sibling pointer");
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }
}
