//! In-memory pages.
//!
//! A [`MemPage`] is built from a decoded on-disk page and never changes the
//! decoded bytes. Its index is resolved once from the page type:
//!
//! - row and duplicate-internal pages index one entry per data or child
//!   item, each pointing at the key item it follows; entries that follow the
//!   same key item share one key cell
//! - variable and fixed column pages index one entry per record
//! - run-length encoded pages index one entry per run
//!
//! Pending changes live in the page's [`Overlay`] until reconciliation
//! writes a new image.

use crate::overlay::{Overlay, Update, UpdateChain, UpdateNode, WriteTicket};
use crate::reference::PageRef;
use bytes::Bytes;
use cambium_common::{Address, BtreeConfig, CambiumError, Collator, KeyTransform, Result};
use cambium_storage::{
    codec, fixed_deleted_record, is_fixed_deleted, overflow, BlockManager, DiskPage, Item,
    ItemCursor, ItemType, OffRecord, OffRef, OvflRef, PageBody, PageGeometry, PageHeader,
    PageType, RleRun,
};
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering as CmpOrdering;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// `read_gen` value that pins a page against eviction.
pub const READ_GEN_PINNED: u64 = u64::MAX;

/// Everything a page needs to touch the file.
#[derive(Clone)]
pub struct PageIo {
    pub blocks: Arc<dyn BlockManager>,
    pub geometry: PageGeometry,
    /// Values longer than this are written to overflow pages.
    pub overflow_threshold: u32,
    pub transform: Arc<dyn KeyTransform>,
}

impl PageIo {
    pub fn new(
        blocks: Arc<dyn BlockManager>,
        config: &BtreeConfig,
        transform: Arc<dyn KeyTransform>,
    ) -> Result<Self> {
        Ok(Self {
            blocks,
            geometry: PageGeometry::from_config(config)?,
            overflow_threshold: config.overflow_threshold,
            transform,
        })
    }

    /// Returns an item's payload, reading its overflow page if needed.
    pub fn resolve(&self, item: &Item) -> Result<Bytes> {
        overflow::resolve(&*self.blocks, &self.geometry, item)
    }

    /// Builds an item, writing the payload to an overflow page if it is
    /// longer than the threshold.
    pub fn spill(&self, kind: ItemType, payload: Bytes) -> Result<Item> {
        overflow::spill(
            &*self.blocks,
            &self.geometry,
            kind,
            payload,
            self.overflow_threshold,
        )
    }
}

impl std::fmt::Debug for PageIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageIo")
            .field("geometry", &self.geometry)
            .field("overflow_threshold", &self.overflow_threshold)
            .finish()
    }
}

#[derive(Debug)]
enum KeyState {
    /// Still the item on the page image.
    OnPage(Item),
    /// Decoded into an owned buffer.
    Owned(Bytes),
}

/// Key shared by the entries that follow one key item.
#[derive(Debug)]
pub struct KeyCell {
    state: RwLock<KeyState>,
}

impl KeyCell {
    fn on_page(item: Item) -> Self {
        Self {
            state: RwLock::new(KeyState::OnPage(item)),
        }
    }

    /// Returns true once the key was decoded into an owned buffer.
    pub fn is_materialized(&self) -> bool {
        matches!(*self.state.read(), KeyState::Owned(_))
    }
}

#[derive(Debug)]
struct RowEntry {
    key: Arc<KeyCell>,
    data: Item,
}

#[derive(Debug)]
struct ColEntry {
    recno: u64,
    item: Item,
}

#[derive(Debug)]
struct RleEntry {
    recno: u64,
    run: RleRun,
}

#[derive(Debug)]
enum PageIndex {
    Row(Vec<RowEntry>),
    Col(Vec<ColEntry>),
    Rle(Vec<RleEntry>),
}

impl PageIndex {
    fn len(&self) -> usize {
        match self {
            PageIndex::Row(entries) => entries.len(),
            PageIndex::Col(entries) => entries.len(),
            PageIndex::Rle(runs) => runs.len(),
        }
    }
}

/// A position on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// Index entry.
    Slot(u32),
    /// Absolute record number, on column pages.
    Record(u64),
}

/// The current value at a position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Data(Bytes),
    /// Stored on an overflow page; read it through [`PageIo::resolve`].
    Overflow(OvflRef),
    Deleted,
    /// Root of a child or off-page duplicate tree.
    Subtree(OffRecord),
}

/// An on-page key item recovered by walking the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyItem {
    /// First index entry that follows this key.
    pub slot: u32,
    /// Byte offset of the item in the image.
    pub offset: usize,
    pub item: Item,
}

/// Work collected while reconciling, applied once the new image is written.
#[derive(Debug, Default)]
struct Reconciled {
    /// Overflow pages written for overlay heads.
    spills: Vec<(u32, OvflRef)>,
    /// On-disk overflow items replaced by an update.
    released: Vec<(u32, OvflRef)>,
    key_spills: Vec<(u32, Option<OvflRef>)>,
    /// Overflow pages written during this pass.
    written: Vec<OvflRef>,
    frees: Vec<OvflRef>,
}

/// A cache-resident page.
pub struct MemPage {
    addr: AtomicU32,
    size: AtomicU32,
    records: AtomicU64,
    parent: Weak<MemPage>,
    parent_slot: u32,
    disk: DiskPage,
    fixed_len: u8,
    index: PageIndex,
    children: Vec<PageRef>,
    read_gen: AtomicU64,
    write_gen: AtomicU32,
    disk_gen: AtomicU32,
    overlay: RwLock<Overlay>,
    /// Blocks older images referred to, freed once no reader can hold them.
    retired: Mutex<Vec<OffRef>>,
}

impl MemPage {
    /// Builds the in-memory form of a page read from `addr`.
    pub fn new(
        disk: DiskPage,
        addr: Address,
        fixed_len: u8,
        parent: Weak<MemPage>,
        parent_slot: u32,
    ) -> Result<Self> {
        let index = build_index(&disk, addr)?;
        let children = build_children(&index, disk.header.page_type);
        let records = match disk.header.page_type {
            t if t.is_column() => disk.body.record_count(),
            _ => 0,
        };
        Ok(Self {
            addr: AtomicU32::new(addr.0),
            size: AtomicU32::new(disk.size()),
            records: AtomicU64::new(records),
            parent,
            parent_slot,
            disk,
            fixed_len,
            index,
            children,
            read_gen: AtomicU64::new(0),
            write_gen: AtomicU32::new(0),
            disk_gen: AtomicU32::new(0),
            overlay: RwLock::new(Overlay::default()),
            retired: Mutex::new(Vec::new()),
        })
    }

    #[inline]
    pub fn addr(&self) -> Address {
        Address(self.addr.load(Ordering::Acquire))
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    /// Records in the subtree, on column pages.
    #[inline]
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Acquire)
    }

    /// Location of the last image written for this page.
    pub fn location(&self) -> OffRecord {
        OffRecord::new(self.addr(), self.size(), self.records())
    }

    #[inline]
    pub fn page_type(&self) -> PageType {
        self.disk.header.page_type
    }

    #[inline]
    pub fn level(&self) -> u8 {
        self.disk.header.level
    }

    #[inline]
    pub fn start_recno(&self) -> u64 {
        self.disk.header.start_recno
    }

    /// The decoded image this page was built from.
    pub fn disk(&self) -> &DiskPage {
        &self.disk
    }

    /// The parent page, for lookups only.
    pub fn parent(&self) -> Option<Arc<MemPage>> {
        self.parent.upgrade()
    }

    /// Slot of the parent's reference to this page.
    pub fn parent_slot(&self) -> u32 {
        self.parent_slot
    }

    /// Number of index entries.
    pub fn entries(&self) -> usize {
        self.index.len()
    }

    /// References to child pages, ordered by slot.
    pub fn children(&self) -> &[PageRef] {
        &self.children
    }

    /// Reference to the child page at `slot`.
    pub fn child(&self, slot: u32) -> Option<&PageRef> {
        self.children
            .binary_search_by_key(&slot, PageRef::slot)
            .ok()
            .map(|at| &self.children[at])
    }

    /// Returns true if any child page is resident.
    pub fn has_resident_children(&self) -> bool {
        self.children.iter().any(PageRef::is_resident)
    }

    #[inline]
    pub fn read_gen(&self) -> u64 {
        self.read_gen.load(Ordering::Relaxed)
    }

    /// Records an access. Pinned pages stay pinned.
    pub fn touch(&self, gen: u64) {
        let _ = self
            .read_gen
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                (current != READ_GEN_PINNED).then_some(gen)
            });
    }

    /// Pins the page against eviction.
    pub fn pin(&self) {
        self.read_gen.store(READ_GEN_PINNED, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.read_gen() == READ_GEN_PINNED
    }

    #[inline]
    pub fn write_gen(&self) -> u32 {
        self.write_gen.load(Ordering::Acquire)
    }

    #[inline]
    pub fn disk_gen(&self) -> u32 {
        self.disk_gen.load(Ordering::Acquire)
    }

    /// Returns true if the page has changes not yet written.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.disk_gen() != self.write_gen()
    }

    /// Marks the page as needing a new image, e.g. after a child moved.
    pub fn mark_modified(&self, _ticket: &WriteTicket<'_>) -> u32 {
        self.write_gen.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Approximate memory held by the page.
    pub fn footprint(&self) -> usize {
        self.disk.image().len() + self.overlay.read().bytes()
    }

    /// Number of modified slots and expanded records.
    pub fn modified_count(&self) -> usize {
        self.overlay.read().modified_count()
    }

    /// The key of row entry `slot`.
    ///
    /// Inline keys are returned as views of the page image. Overflow keys
    /// and keys needing a transform are decoded once and the entry's key
    /// cell is switched to the owned copy.
    pub fn key(&self, slot: u32, io: &PageIo) -> Result<Bytes> {
        let cell = &self.row_entry(slot)?.key;
        let item = match &*cell.state.read() {
            KeyState::Owned(key) => return Ok(key.clone()),
            KeyState::OnPage(item) => item.clone(),
        };
        if !item.kind.is_overflow() && io.transform.is_identity() {
            return Ok(item.payload);
        }
        let raw = io.resolve(&item)?;
        let key = io.transform.decode(&raw)?;
        *cell.state.write() = KeyState::Owned(key.clone());
        tracing::trace!(addr = %self.addr(), slot, len = key.len(), "materialized key");
        Ok(key)
    }

    /// Returns true if the key of entry `slot` was decoded into an owned
    /// buffer.
    pub fn key_is_materialized(&self, slot: u32) -> Result<bool> {
        Ok(self.row_entry(slot)?.key.is_materialized())
    }

    /// Entries sharing the key of entry `slot`.
    ///
    /// Entries are grouped by key cell identity, not by key contents.
    pub fn group(&self, slot: u32) -> Result<Range<u32>> {
        let PageIndex::Row(entries) = &self.index else {
            return Err(self.wrong_type("key groups"));
        };
        let at = slot as usize;
        let Some(entry) = entries.get(at) else {
            return Err(out_of_range(slot, entries.len()));
        };
        let start = entries[..at]
            .iter()
            .rposition(|e| !Arc::ptr_eq(&e.key, &entry.key))
            .map_or(0, |p| p + 1);
        Ok(start as u32..group_end(entries, at) as u32)
    }

    /// Number of distinct key groups.
    pub fn key_groups(&self) -> usize {
        match &self.index {
            PageIndex::Row(entries) => {
                let mut groups = 0;
                let mut at = 0;
                while at < entries.len() {
                    at = group_end(entries, at);
                    groups += 1;
                }
                groups
            }
            _ => 0,
        }
    }

    /// Walks the page image and returns its key items in order, one per key
    /// group. Needed to recover an on-page key after its cell was replaced
    /// by an owned copy.
    pub fn key_items(&self) -> Result<Vec<KeyItem>> {
        if !matches!(self.index, PageIndex::Row(_)) {
            return Ok(Vec::new());
        }
        let mut cursor = ItemCursor::new(
            self.disk.image().clone(),
            PageHeader::SIZE,
            self.disk.header.entries,
            self.addr(),
        );
        let mut keys = Vec::new();
        let mut slot = 0u32;
        while let Some((offset, item)) = cursor.decode_next()? {
            if item.kind.is_key() {
                keys.push(KeyItem { slot, offset, item });
            } else {
                slot += 1;
            }
        }
        Ok(keys)
    }

    /// Checks the index against the page image.
    pub fn verify(&self) -> Result<()> {
        let PageIndex::Row(entries) = &self.index else {
            return Ok(());
        };
        let keys = self.key_items()?;
        let mut at = 0;
        let mut group = 0;
        while at < entries.len() {
            let Some(key) = keys.get(group) else {
                return Err(self.corrupt(format!("entry {} has no key item", at)));
            };
            if key.slot as usize != at {
                return Err(self.corrupt(format!(
                    "key item at offset {} starts entry {}, index starts a group at {}",
                    key.offset, key.slot, at
                )));
            }
            if let KeyState::OnPage(item) = &*entries[at].key.state.read() {
                if *item != key.item {
                    return Err(
                        self.corrupt(format!("key of entry {} does not match the image", at))
                    );
                }
            }
            at = group_end(entries, at);
            group += 1;
        }
        if group != keys.len() {
            return Err(self.corrupt(format!(
                "{} key items on the image, {} key groups in the index",
                keys.len(),
                group
            )));
        }
        Ok(())
    }

    /// Binary search of a row page.
    ///
    /// On a leaf, returns the first entry whose key is not less than `key`
    /// and whether it is equal. On an internal page, returns the last entry
    /// whose key is not greater than `key`, or entry 0.
    pub fn search_row(
        &self,
        key: &[u8],
        io: &PageIo,
        collator: &dyn Collator,
    ) -> Result<(u32, bool)> {
        let PageIndex::Row(entries) = &self.index else {
            return Err(self.wrong_type("key search"));
        };
        let mut lo = 0usize;
        let mut hi = entries.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if collator.compare(&self.key(mid as u32, io)?, key) == CmpOrdering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let exact = lo < entries.len()
            && collator.compare(&self.key(lo as u32, io)?, key) == CmpOrdering::Equal;
        if self.page_type().is_internal() && !exact {
            return Ok((lo.saturating_sub(1) as u32, false));
        }
        Ok((lo as u32, exact))
    }

    /// Child slot of a column internal page covering `recno`.
    pub fn child_for_record(&self, recno: u64) -> Option<u32> {
        let PageIndex::Col(entries) = &self.index else {
            return None;
        };
        let at = entries.partition_point(|e| e.recno <= recno).checked_sub(1)?;
        let child = entries[at].item.as_off_record()?;
        (recno - entries[at].recno < child.records).then_some(at as u32)
    }

    /// Returns true if `recno` is stored on this column leaf.
    pub fn contains_record(&self, recno: u64) -> bool {
        !self.page_type().is_internal() && self.record_slot(recno).is_ok()
    }

    /// The current value at `pos`. Never performs I/O.
    ///
    /// The newest update wins over the on-disk value. On run-length encoded
    /// pages the record's expansion is checked before the run's value.
    pub fn read_value(&self, pos: Position) -> Result<Value> {
        let overlay = self.overlay.read();
        let value = match (&self.index, pos) {
            (PageIndex::Row(entries), Position::Slot(slot)) => {
                let entry = entries
                    .get(slot as usize)
                    .ok_or_else(|| out_of_range(slot, entries.len()))?;
                match overlay.chain(slot).and_then(UpdateChain::head) {
                    Some(head) => head_value(head),
                    None => item_value(&entry.data),
                }
            }
            (PageIndex::Col(entries), pos) => {
                let slot = self.col_slot(entries, pos)?;
                match overlay.chain(slot).and_then(UpdateChain::head) {
                    Some(head) => head_value(head),
                    None => item_value(&entries[slot as usize].item),
                }
            }
            (PageIndex::Rle(runs), Position::Record(recno)) => {
                let slot = rle_slot(runs, recno)
                    .ok_or_else(|| CambiumError::InvalidPosition(format!("record {}", recno)))?;
                match overlay.expansion(slot, recno).and_then(UpdateChain::head) {
                    Some(head) => head_value(head),
                    None => Value::Data(runs[slot as usize].run.value.clone()),
                }
            }
            (PageIndex::Rle(_), Position::Slot(slot)) => {
                return Err(CambiumError::InvalidPosition(format!(
                    "slot {} of a run-length encoded page; use a record number",
                    slot
                )));
            }
            (PageIndex::Row(_), Position::Record(recno)) => {
                return Err(CambiumError::InvalidPosition(format!(
                    "record {} on a {:?} page",
                    recno,
                    self.page_type()
                )));
            }
        };
        Ok(match value {
            Value::Data(record) if self.is_fixed() && is_fixed_deleted(&record) => Value::Deleted,
            value => value,
        })
    }

    /// Values of every entry in the key group of `slot`.
    pub fn group_values(&self, slot: u32) -> Result<Vec<Value>> {
        self.group(slot)?
            .map(|s| self.read_value(Position::Slot(s)))
            .collect()
    }

    /// Applies a change to the overlay. The single mutation entry point.
    ///
    /// Fails with [`CambiumError::StaleVersion`] if the page changed since
    /// the caller observed `expected_write_gen`; nothing is modified in that
    /// case. Returns the new write generation.
    pub fn apply_update(
        &self,
        _ticket: &WriteTicket<'_>,
        pos: Position,
        update: Update,
        expected_write_gen: u32,
    ) -> Result<u32> {
        let current = self.write_gen();
        if expected_write_gen != current {
            return Err(CambiumError::StaleVersion {
                expected: expected_write_gen,
                current,
            });
        }
        let page_type = self.page_type();
        if page_type.is_internal() || page_type == PageType::DupLeaf {
            return Err(CambiumError::InvalidPageType(format!(
                "{:?} pages are not updated in place",
                page_type
            )));
        }

        let payload = match update {
            Update::Put(value) if self.is_fixed() && value.len() != self.fixed_len as usize => {
                return Err(CambiumError::Size {
                    what: "fixed-length record",
                    size: value.len(),
                    max: self.fixed_len as usize,
                });
            }
            Update::Delete if self.is_fixed() => Some(fixed_deleted_record(self.fixed_len)),
            update => update.into_payload(),
        };

        let slots = self.index.len();
        let mut overlay = self.overlay.write();
        match (&self.index, pos) {
            (PageIndex::Row(entries), Position::Slot(slot)) => {
                let entry = entries
                    .get(slot as usize)
                    .ok_or_else(|| out_of_range(slot, slots))?;
                if entry.data.kind == ItemType::OffRecord {
                    return Err(CambiumError::InvalidPosition(format!(
                        "slot {} holds an off-page duplicate tree",
                        slot
                    )));
                }
                overlay.push_update(slots, slot, payload);
            }
            (PageIndex::Col(entries), pos) => {
                let slot = self.col_slot(entries, pos)?;
                overlay.push_update(slots, slot, payload);
            }
            (PageIndex::Rle(runs), Position::Record(recno)) => {
                let slot = rle_slot(runs, recno)
                    .ok_or_else(|| CambiumError::InvalidPosition(format!("record {}", recno)))?;
                overlay.push_expansion(slots, slot, recno, payload);
            }
            (_, pos) => {
                return Err(CambiumError::InvalidPosition(format!(
                    "{:?} on a {:?} page",
                    pos, page_type
                )));
            }
        }
        Ok(self.write_gen.fetch_add(1, Ordering::AcqRel).wrapping_add(1))
    }

    /// Writes the page, with the overlay merged in, to a new location.
    ///
    /// Blocks the new image no longer refers to (the old image, replaced
    /// overflow values and keys) are retired, not freed: a reader may still
    /// hold an address read from the old version. See
    /// [`MemPage::free_retired`].
    ///
    /// Returns `None` without writing if the page is clean. On success
    /// `disk_gen` equals the `write_gen` at the time of the call.
    pub fn reconcile(&self, io: &PageIo, _ticket: &WriteTicket<'_>) -> Result<Option<OffRecord>> {
        let write_gen = self.write_gen();
        if write_gen == self.disk_gen() {
            return Ok(None);
        }

        let mut plan = Reconciled::default();
        let built = {
            let overlay = self.overlay.read();
            self.build_body(&overlay, io, &mut plan)
        };
        let written = built.and_then(|body| {
            let header = PageHeader::new(self.page_type(), self.level())
                .with_start_recno(self.start_recno())
                .with_lsn(self.disk.header.lsn);
            let image = codec::encode(&header, &body, &io.geometry)?;
            let (addr, size) = io.blocks.write(&image)?;
            Ok((addr, size, body.record_count()))
        });
        let (addr, size, records) = match written {
            Ok(written) => written,
            Err(e) => {
                for ovfl in &plan.written {
                    if let Err(free_err) = io.blocks.free(ovfl.addr, ovfl.size) {
                        tracing::warn!(addr = %ovfl.addr, error = %free_err, "failed to free overflow page");
                    }
                }
                return Err(e);
            }
        };

        let mut frees = std::mem::take(&mut plan.frees);
        {
            let mut overlay = self.overlay.write();
            for (slot, ovfl) in plan.spills {
                if let Some(head) = overlay.chain_mut(slot).and_then(UpdateChain::head_mut) {
                    head.set_spilled(ovfl);
                }
            }
            for (slot, ovfl) in plan.released {
                if overlay.release_original(slot) {
                    frees.push(ovfl);
                }
            }
            for (group, ovfl) in plan.key_spills {
                overlay.set_key_spill(group, ovfl);
            }
            frees.extend(overlay.take_stale_spills());
        }

        let old = self.location();
        let records = if self.page_type().is_column() { records } else { 0 };
        self.addr.store(addr.0, Ordering::Release);
        self.size.store(size, Ordering::Release);
        self.records.store(records, Ordering::Release);
        self.disk_gen.store(write_gen, Ordering::Release);

        let retired = {
            let mut retired = self.retired.lock();
            retired.extend(frees.iter().map(|ovfl| OffRef::new(ovfl.addr, ovfl.size)));
            if old.addr.is_valid() {
                retired.push(old.off());
            }
            retired.len()
        };
        tracing::debug!(
            old = %old.addr,
            new = %addr,
            size,
            write_gen,
            retired,
            page_type = ?self.page_type(),
            "reconciled page"
        );
        Ok(Some(OffRecord::new(addr, size, records)))
    }

    /// Number of retired blocks not yet freed.
    pub fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }

    /// Frees every retired block and returns how many there were.
    ///
    /// Only safe once no session holds a hazard reference to this page:
    /// overflow addresses handed out by [`MemPage::read_value`] stay valid
    /// until then. A block that cannot be freed is logged and leaked.
    pub fn free_retired(&self, io: &PageIo, _ticket: &WriteTicket<'_>) -> usize {
        let retired = std::mem::take(&mut *self.retired.lock());
        for block in &retired {
            if let Err(e) = io.blocks.free(block.addr, block.size) {
                tracing::warn!(addr = %block.addr, error = %e, "failed to free retired block");
            }
        }
        retired.len()
    }

    fn build_body(&self, overlay: &Overlay, io: &PageIo, plan: &mut Reconciled) -> Result<PageBody> {
        match (&self.index, self.page_type()) {
            (PageIndex::Row(entries), _) => self.build_row(entries, overlay, io, plan),
            (PageIndex::Col(entries), PageType::ColInt) => (0..entries.len() as u32)
                .map(|slot| self.child_location(slot))
                .collect::<Result<Vec<_>>>()
                .map(PageBody::Children),
            (PageIndex::Col(entries), PageType::ColFix) => Ok(PageBody::Fixed(
                entries
                    .iter()
                    .enumerate()
                    .map(|(slot, entry)| {
                        match overlay.chain(slot as u32).and_then(UpdateChain::head) {
                            Some(head) => head
                                .payload()
                                .cloned()
                                .unwrap_or_else(|| fixed_deleted_record(self.fixed_len)),
                            None => entry.item.payload.clone(),
                        }
                    })
                    .collect(),
            )),
            (PageIndex::Col(entries), _) => {
                let mut items = Vec::with_capacity(entries.len());
                for (slot, entry) in entries.iter().enumerate() {
                    let item = self.build_entry(slot as u32, &entry.item, overlay, io, plan)?;
                    items.push(item.unwrap_or_else(Item::deleted));
                }
                Ok(PageBody::Items(items))
            }
            (PageIndex::Rle(runs), _) => Ok(PageBody::Runs(build_runs(runs, overlay))),
        }
    }

    fn build_row(
        &self,
        entries: &[RowEntry],
        overlay: &Overlay,
        io: &PageIo,
        plan: &mut Reconciled,
    ) -> Result<PageBody> {
        let keys = self.key_items()?;
        let mut items = Vec::with_capacity(entries.len() * 2);
        let mut at = 0;
        let mut group = 0u32;
        while at < entries.len() {
            let end = group_end(entries, at);
            let key = keys.get(group as usize).ok_or_else(|| {
                CambiumError::Internal(format!("no key item for key group {}", group))
            })?;
            let mut values = Vec::with_capacity(end - at);
            for (slot, entry) in entries.iter().enumerate().take(end).skip(at) {
                if let Some(item) = self.build_entry(slot as u32, &entry.data, overlay, io, plan)? {
                    values.push(item);
                }
            }
            if values.is_empty() {
                self.retire_key(group, key, overlay, io, plan)?;
            } else {
                items.push(self.build_key(group, key, overlay, io, plan)?);
                items.extend(values);
            }
            at = end;
            group += 1;
        }
        Ok(PageBody::Items(items))
    }

    /// The item to write for one entry, or `None` if it was deleted.
    fn build_entry(
        &self,
        slot: u32,
        original: &Item,
        overlay: &Overlay,
        io: &PageIo,
        plan: &mut Reconciled,
    ) -> Result<Option<Item>> {
        let Some(head) = overlay.chain(slot).and_then(UpdateChain::head) else {
            return match original.kind {
                ItemType::Off => Ok(Some(Item::off(self.child_location(slot)?.off()))),
                ItemType::OffRecord => Ok(Some(Item::off_record(self.child_location(slot)?))),
                _ => Ok(Some(original.clone())),
            };
        };
        if let Some(ovfl) = original.as_ovfl() {
            if !overlay.is_released(slot) {
                plan.released.push((slot, ovfl));
            }
        }
        let Some(value) = head.payload() else {
            return Ok(None);
        };
        let kind = match inline_form(original.kind) {
            ItemType::Del => ItemType::Data,
            kind => kind,
        };
        if let (Some(ovfl), Some(ovfl_kind)) = (head.spilled(), kind.overflow_form()) {
            return Ok(Some(Item::overflow(ovfl_kind, ovfl)));
        }
        let item = io.spill(kind, value.clone())?;
        if let Some(ovfl) = item.as_ovfl() {
            plan.spills.push((slot, ovfl));
            plan.written.push(ovfl);
        }
        Ok(Some(item))
    }

    fn build_key(
        &self,
        group: u32,
        key: &KeyItem,
        overlay: &Overlay,
        io: &PageIo,
        plan: &mut Reconciled,
    ) -> Result<Item> {
        if !key.item.kind.is_overflow() {
            return Ok(key.item.clone());
        }
        match overlay.key_spill(group) {
            None => Ok(key.item.clone()),
            Some(Some(ovfl)) => Ok(Item::overflow(key.item.kind, ovfl)),
            Some(None) => {
                let raw = io.transform.encode(&self.key(key.slot, io)?)?;
                let ovfl = overflow::write_overflow(&*io.blocks, &io.geometry, &raw)?;
                plan.key_spills.push((group, Some(ovfl)));
                plan.written.push(ovfl);
                Ok(Item::overflow(key.item.kind, ovfl))
            }
        }
    }

    /// Frees the overflow page of a key none of whose entries survive. The
    /// key is materialized first so the entries remain searchable.
    fn retire_key(
        &self,
        group: u32,
        key: &KeyItem,
        overlay: &Overlay,
        io: &PageIo,
        plan: &mut Reconciled,
    ) -> Result<()> {
        let Some(original) = key.item.as_ovfl() else {
            return Ok(());
        };
        match overlay.key_spill(group) {
            None => {
                self.key(key.slot, io)?;
                plan.key_spills.push((group, None));
                plan.frees.push(original);
            }
            Some(Some(ovfl)) => {
                plan.key_spills.push((group, None));
                plan.frees.push(ovfl);
            }
            Some(None) => {}
        }
        Ok(())
    }

    fn child_location(&self, slot: u32) -> Result<OffRecord> {
        self.child(slot).map(PageRef::location).ok_or_else(|| {
            CambiumError::Internal(format!("slot {} of {} has no child reference", slot, self.addr()))
        })
    }

    fn row_entry(&self, slot: u32) -> Result<&RowEntry> {
        let PageIndex::Row(entries) = &self.index else {
            return Err(self.wrong_type("keys"));
        };
        entries
            .get(slot as usize)
            .ok_or_else(|| out_of_range(slot, entries.len()))
    }

    fn col_slot(&self, entries: &[ColEntry], pos: Position) -> Result<u32> {
        match pos {
            Position::Slot(slot) if (slot as usize) < entries.len() => Ok(slot),
            Position::Slot(slot) => Err(out_of_range(slot, entries.len())),
            Position::Record(recno) => self.record_slot(recno),
        }
    }

    fn record_slot(&self, recno: u64) -> Result<u32> {
        let missing = || CambiumError::InvalidPosition(format!("record {} is not on this page", recno));
        match &self.index {
            PageIndex::Col(entries) => {
                let offset = recno.checked_sub(self.start_recno()).ok_or_else(missing)?;
                if self.page_type() == PageType::ColInt || offset >= entries.len() as u64 {
                    return Err(missing());
                }
                Ok(offset as u32)
            }
            PageIndex::Rle(runs) => rle_slot(runs, recno).ok_or_else(missing),
            PageIndex::Row(_) => Err(missing()),
        }
    }

    fn is_fixed(&self) -> bool {
        matches!(self.page_type(), PageType::ColFix | PageType::ColRle)
    }

    fn wrong_type(&self, what: &str) -> CambiumError {
        CambiumError::InvalidPageType(format!("{} on a {:?} page", what, self.page_type()))
    }

    fn corrupt(&self, reason: String) -> CambiumError {
        CambiumError::corruption(self.addr().0, reason)
    }
}

impl std::fmt::Debug for MemPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemPage")
            .field("addr", &self.addr())
            .field("size", &self.size())
            .field("page_type", &self.page_type())
            .field("entries", &self.entries())
            .field("read_gen", &self.read_gen())
            .field("write_gen", &self.write_gen())
            .field("disk_gen", &self.disk_gen())
            .finish()
    }
}

fn build_index(disk: &DiskPage, addr: Address) -> Result<PageIndex> {
    let page_type = disk.header.page_type;
    let start = disk.header.start_recno;
    let index = match (&disk.body, page_type) {
        (PageBody::Items(items), PageType::RowInt | PageType::RowLeaf | PageType::DupInt) => {
            let mut entries = Vec::with_capacity(items.len() / 2 + 1);
            let mut key: Option<Arc<KeyCell>> = None;
            let mut key_has_data = true;
            for item in items {
                if item.kind.is_key() {
                    if !key_has_data {
                        return Err(CambiumError::corruption(addr.0, "key item without data"));
                    }
                    key = Some(Arc::new(KeyCell::on_page(item.clone())));
                    key_has_data = false;
                    continue;
                }
                let Some(cell) = &key else {
                    return Err(CambiumError::corruption(
                        addr.0,
                        format!("{:?} item before the first key", item.kind),
                    ));
                };
                entries.push(RowEntry {
                    key: Arc::clone(cell),
                    data: item.clone(),
                });
                key_has_data = true;
            }
            if !key_has_data {
                return Err(CambiumError::corruption(addr.0, "key item without data"));
            }
            PageIndex::Row(entries)
        }
        (PageBody::Items(items), PageType::ColVar | PageType::DupLeaf) => PageIndex::Col(
            items
                .iter()
                .zip(start..)
                .map(|(item, recno)| ColEntry {
                    recno,
                    item: item.clone(),
                })
                .collect(),
        ),
        (PageBody::Fixed(records), PageType::ColFix) => PageIndex::Col(
            records
                .iter()
                .zip(start..)
                .map(|(record, recno)| ColEntry {
                    recno,
                    item: Item::data(record.clone()),
                })
                .collect(),
        ),
        (PageBody::Children(children), PageType::ColInt) => {
            let mut recno = start;
            let mut entries = Vec::with_capacity(children.len());
            for child in children {
                entries.push(ColEntry {
                    recno,
                    item: Item::off_record(*child),
                });
                recno = recno.checked_add(child.records).ok_or_else(|| {
                    CambiumError::corruption(addr.0, "child record counts overflow")
                })?;
            }
            PageIndex::Col(entries)
        }
        (PageBody::Runs(runs), PageType::ColRle) => {
            let mut recno = start;
            let mut entries = Vec::with_capacity(runs.len());
            for run in runs {
                entries.push(RleEntry {
                    recno,
                    run: run.clone(),
                });
                recno = recno.checked_add(run.count as u64).ok_or_else(|| {
                    CambiumError::corruption(addr.0, "run lengths overflow the record number")
                })?;
            }
            PageIndex::Rle(entries)
        }
        (_, page_type) => {
            return Err(CambiumError::InvalidPageType(format!(
                "{:?} pages are not cached",
                page_type
            )));
        }
    };
    Ok(index)
}

fn build_children(index: &PageIndex, page_type: PageType) -> Vec<PageRef> {
    match index {
        PageIndex::Row(entries) => entries
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| {
                let location = match entry.data.kind {
                    ItemType::Off => entry
                        .data
                        .as_off()
                        .map(|off| OffRecord::new(off.addr, off.size, 0)),
                    ItemType::OffRecord => entry.data.as_off_record(),
                    _ => None,
                }?;
                Some(PageRef::new(slot as u32, location))
            })
            .collect(),
        PageIndex::Col(entries) if page_type == PageType::ColInt => entries
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| {
                entry
                    .item
                    .as_off_record()
                    .map(|location| PageRef::new(slot as u32, location))
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// End of the key group starting at or containing `at`.
fn group_end(entries: &[RowEntry], at: usize) -> usize {
    let key = &entries[at].key;
    at + entries[at..]
        .iter()
        .take_while(|e| Arc::ptr_eq(&e.key, key))
        .count()
}

fn rle_slot(runs: &[RleEntry], recno: u64) -> Option<u32> {
    let at = runs.partition_point(|r| r.recno <= recno).checked_sub(1)?;
    (recno - runs[at].recno < runs[at].run.count as u64).then_some(at as u32)
}

fn head_value(head: &UpdateNode) -> Value {
    match head.payload() {
        Some(value) => Value::Data(value.clone()),
        None => Value::Deleted,
    }
}

fn item_value(item: &Item) -> Value {
    match item.kind {
        ItemType::Del => Value::Deleted,
        ItemType::Off => item
            .as_off()
            .map_or(Value::Deleted, |off| Value::Subtree(OffRecord::new(off.addr, off.size, 0))),
        ItemType::OffRecord => item.as_off_record().map_or(Value::Deleted, Value::Subtree),
        kind if kind.is_overflow() => item.as_ovfl().map_or(Value::Deleted, Value::Overflow),
        _ => Value::Data(item.payload.clone()),
    }
}

/// The inline type an overflow item type was spilled from.
fn inline_form(kind: ItemType) -> ItemType {
    match kind {
        ItemType::KeyOvfl => ItemType::Key,
        ItemType::KeyDupOvfl => ItemType::KeyDup,
        ItemType::DataOvfl => ItemType::Data,
        ItemType::DataDupOvfl => ItemType::DataDup,
        kind => kind,
    }
}

/// Run-length encodes the page's records with expansions applied.
/// Adjacent runs of equal value are coalesced.
fn build_runs(runs: &[RleEntry], overlay: &Overlay) -> Vec<RleRun> {
    let mut out = Vec::with_capacity(runs.len());
    for (slot, entry) in runs.iter().enumerate() {
        let end = entry.recno + entry.run.count as u64;
        let Some(list) = overlay.expansions(slot as u32) else {
            push_run(&mut out, &entry.run.value, entry.run.count as u64);
            continue;
        };
        let mut overrides: Vec<(u64, Bytes)> = list
            .iter()
            .filter_map(|e| {
                let value = e.updates().head()?.payload()?;
                Some((e.recno(), value.clone()))
            })
            .collect();
        overrides.sort_by_key(|(recno, _)| *recno);
        let mut next = entry.recno;
        for (recno, value) in overrides {
            push_run(&mut out, &entry.run.value, recno - next);
            push_run(&mut out, &value, 1);
            next = recno + 1;
        }
        push_run(&mut out, &entry.run.value, end - next);
    }
    out
}

/// Appends `count` records of `value`, extending the last run when equal.
pub(crate) fn push_run(out: &mut Vec<RleRun>, value: &Bytes, mut count: u64) {
    while count > 0 {
        match out.last_mut() {
            Some(last) if last.value == *value && last.count < u16::MAX => {
                let add = count.min((u16::MAX - last.count) as u64);
                last.count += add as u16;
                count -= add;
            }
            _ => {
                let n = count.min(u16::MAX as u64);
                out.push(RleRun::new(n as u16, value.clone()));
                count -= n;
            }
        }
    }
}

fn out_of_range(slot: u32, len: usize) -> CambiumError {
    CambiumError::InvalidPosition(format!("slot {} of a page with {} entries", slot, len))
}

/// An empty, unattached row leaf.
#[cfg(test)]
pub(crate) fn test_page() -> Arc<MemPage> {
    use cambium_common::AllocationUnit;
    use cambium_storage::LEVEL_LEAF;

    let geometry = PageGeometry::new(AllocationUnit::default());
    let header = PageHeader::new(PageType::RowLeaf, LEVEL_LEAF);
    let image = codec::encode(&header, &PageBody::Items(Vec::new()), &geometry).unwrap();
    let disk = codec::decode(image, &geometry, Address(1)).unwrap();
    Arc::new(MemPage::new(disk, Address(1), 0, Weak::new(), 0).unwrap())
}
