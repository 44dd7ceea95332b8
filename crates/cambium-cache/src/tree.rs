//! Tree handle.
//!
//! A [`Btree`] owns the root reference of one file, the hazard table its
//! sessions publish into and the serialized write path. Every page below the
//! root is owned by the reference slot of its parent; the tree only walks
//! them.

use crate::bulk::{self, BulkInput};
use crate::hazard::{hazard_id, HazardTable, PageGuard, Session};
use crate::overlay::{Update, WritePath, WriteTicket};
use crate::page::{MemPage, PageIo, Position, Value};
use crate::reference::PageRef;
use bytes::Bytes;
use cambium_common::{
    Address, BtreeConfig, CacheConfig, CambiumError, Collaborators, Result, StoreKind,
};
use cambium_storage::{
    codec, overflow, BlockManager, OffRecord, PageBody, PageDescriptor, PageHeader, PageType,
    LEVEL_NONE,
};
use parking_lot::Mutex;
use std::ops::Range;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Leaf page and position found by a search.
///
/// The guard keeps the leaf resident until the result is dropped.
#[derive(Debug)]
pub struct SearchResult<'s> {
    pub guard: PageGuard<'s>,
    pub position: Position,
    /// `write_gen` of the leaf before it was searched.
    pub write_gen: u32,
    /// True if the key or record is on the leaf.
    pub exact: bool,
}

/// Result of one eviction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictOutcome {
    /// The page was written if dirty and released.
    Evicted,
    /// A hazard reference was observed; the page stays resident.
    Busy,
    /// The page was not a candidate (on disk, pinned, or a parent of
    /// resident pages).
    Skipped,
}

#[derive(Debug, Default)]
struct Counters {
    page_ins: AtomicU64,
    races_lost: AtomicU64,
    evicted: AtomicU64,
    eviction_busy: AtomicU64,
    flushed: AtomicU64,
    update_retries: AtomicU64,
}

/// Statistics about a tree's cache.
#[derive(Debug, Clone)]
pub struct TreeStats {
    /// Number of resident pages.
    pub resident_pages: usize,
    /// Approximate bytes held by resident pages.
    pub resident_bytes: usize,
    /// Resident pages with unwritten changes.
    pub dirty_pages: usize,
    /// Pages read from the file and published.
    pub page_ins: u64,
    /// Pages read and discarded because another reader published first.
    pub races_lost: u64,
    /// Pages released by eviction.
    pub evicted: u64,
    /// Evictions abandoned because a hazard reference was observed.
    pub eviction_busy: u64,
    /// Pages written to a new location.
    pub flushed: u64,
    /// Updates retried after a stale version.
    pub update_retries: u64,
    /// Hazard references currently published.
    pub active_hazards: usize,
    /// Blocks retired by resident pages and not yet freed.
    pub retired_blocks: usize,
}

/// An eviction candidate: the resident child at `index` of `parent`.
struct Candidate {
    parent: Arc<MemPage>,
    index: usize,
    read_gen: u64,
}

/// An open tree.
pub struct Btree {
    config: BtreeConfig,
    io: PageIo,
    collab: Collaborators,
    root: PageRef,
    desc: Mutex<PageDescriptor>,
    hazards: Arc<HazardTable>,
    write_path: WritePath,
    /// Source of read generations.
    clock: AtomicU64,
    counters: Counters,
}

impl Btree {
    /// Creates an empty tree in a file with no descriptor and opens it.
    pub fn create(
        config: BtreeConfig,
        cache: CacheConfig,
        blocks: Arc<dyn BlockManager>,
        collab: Collaborators,
    ) -> Result<Self> {
        Self::format(config, cache, blocks, collab, None)
    }

    /// Creates a tree holding `input`, writing every page once, and opens it.
    pub fn bulk_load(
        config: BtreeConfig,
        cache: CacheConfig,
        blocks: Arc<dyn BlockManager>,
        collab: Collaborators,
        input: BulkInput,
    ) -> Result<Self> {
        Self::format(config, cache, blocks, collab, Some(input))
    }

    fn format(
        config: BtreeConfig,
        cache: CacheConfig,
        blocks: Arc<dyn BlockManager>,
        collab: Collaborators,
        input: Option<BulkInput>,
    ) -> Result<Self> {
        config.validate()?;
        check_unit(&config, &*blocks)?;
        let io = PageIo::new(Arc::clone(&blocks), &config, Arc::clone(&collab.transform))?;

        let root = match input {
            Some(input) => bulk::build(&config, &io, &*collab.collator, input)?,
            None => {
                let (header, body) = bulk::empty_leaf(&config);
                let image = codec::encode(&header, &body, &io.geometry)?;
                let (addr, size) = blocks.write(&image)?;
                OffRecord::new(addr, size, 0)
            }
        };

        let mut desc = PageDescriptor::new(&config);
        desc.root_addr = root.addr;
        desc.root_size = root.size;
        desc.records = column_records(&config, root.records);
        blocks.write_descriptor(&desc.to_bytes())?;
        blocks.sync()?;
        tracing::info!(root = %root.addr, store = ?config.store, "created tree");

        Self::open(config, cache, blocks, collab)
    }

    /// Opens an existing tree.
    ///
    /// Geometry recorded in the descriptor overrides `config`. A bad
    /// descriptor, a missing root or an unreadable root page is a format
    /// error.
    pub fn open(
        mut config: BtreeConfig,
        cache: CacheConfig,
        blocks: Arc<dyn BlockManager>,
        collab: Collaborators,
    ) -> Result<Self> {
        cache.validate()?;
        let desc = PageDescriptor::from_bytes(&blocks.read_descriptor()?)?;
        desc.apply_to(&mut config);
        if config.fixed_len != 0 {
            config.store = StoreKind::ColumnFixed;
        } else if config.store == StoreKind::ColumnFixed {
            return Err(CambiumError::Format(
                "descriptor records no fixed record length".to_string(),
            ));
        }
        config.validate()?;
        check_unit(&config, &*blocks)?;
        let io = PageIo::new(Arc::clone(&blocks), &config, Arc::clone(&collab.transform))?;

        if desc.free_addr.is_valid() {
            load_freelist(&io, desc.free_addr, desc.free_size)?;
        }
        if !desc.root_addr.is_valid() {
            return Err(CambiumError::Format("descriptor names no root page".to_string()));
        }

        let location = OffRecord::new(desc.root_addr, desc.root_size, desc.records);
        let root = match read_page(&io, location, Weak::new(), 0) {
            Ok(page) => page,
            Err(e @ CambiumError::Corruption { .. }) => {
                collab
                    .extension
                    .error(&format!("root page {} is unreadable: {}", desc.root_addr, e));
                return Err(CambiumError::Format(format!("unreadable root page: {}", e)));
            }
            Err(e) => return Err(e),
        };
        if !root_type_allowed(&config, root.page_type()) {
            return Err(CambiumError::Format(format!(
                "root page is {:?}, not a page of a {:?} store",
                root.page_type(),
                config.store
            )));
        }
        root.pin();
        let root_ref = PageRef::new(0, location);
        root_ref.publish(Arc::new(root), root_ref.epoch());

        tracing::info!(
            root = %location.addr,
            store = ?config.store,
            sessions = cache.max_sessions,
            "opened tree"
        );
        Ok(Self {
            config,
            io,
            collab,
            root: root_ref,
            desc: Mutex::new(desc),
            hazards: Arc::new(HazardTable::new(
                cache.max_sessions,
                cache.hazard_slots_per_session,
            )),
            write_path: WritePath::new(),
            clock: AtomicU64::new(0),
            counters: Counters::default(),
        })
    }

    /// Effective configuration, after the descriptor was applied.
    pub fn config(&self) -> &BtreeConfig {
        &self.config
    }

    /// Snapshot of the descriptor as of the last checkpoint.
    pub fn descriptor(&self) -> PageDescriptor {
        *self.desc.lock()
    }

    pub fn root(&self) -> &PageRef {
        &self.root
    }

    pub fn hazards(&self) -> &Arc<HazardTable> {
        &self.hazards
    }

    pub fn write_path(&self) -> &WritePath {
        &self.write_path
    }

    pub fn io(&self) -> &PageIo {
        &self.io
    }

    /// Claims a row of the hazard table.
    pub fn session(&self) -> Result<Session> {
        self.hazards.open_session()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the page `r` names, reading it if it is not resident.
    ///
    /// When several readers miss on the same reference, each decodes the
    /// page but only the first to publish wins; the others drop their copy
    /// and use the winner's. A read that fails because the page moved or was
    /// published meanwhile is retried.
    pub fn page_in<'s>(
        &self,
        r: &PageRef,
        parent: Option<&Arc<MemPage>>,
        session: &'s Session,
    ) -> Result<PageGuard<'s>> {
        loop {
            if let Some(guard) = r.acquire(session)? {
                guard.touch(self.tick());
                return Ok(guard);
            }

            let epoch = r.epoch();
            let location = r.location();
            let parent_link = parent.map_or_else(Weak::new, Arc::downgrade);
            let page = match read_page(&self.io, location, parent_link, r.slot()) {
                Ok(page) => page,
                Err(_) if r.is_resident() || r.epoch() != epoch => continue,
                Err(e) => {
                    if matches!(e, CambiumError::Corruption { .. }) {
                        self.collab.extension.error(&format!(
                            "page {} of slot {} is unreadable: {}",
                            location.addr,
                            r.slot(),
                            e
                        ));
                    }
                    return Err(e);
                }
            };
            page.touch(self.tick());
            if r.publish(Arc::new(page), epoch) {
                self.counters.page_ins.fetch_add(1, Ordering::Relaxed);
            } else {
                self.counters.races_lost.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(addr = %location.addr, slot = r.slot(), "lost page-in race");
            }
        }
    }

    /// Descends to the row leaf that holds or would hold `key`.
    pub fn search_row<'s>(&self, session: &'s Session, key: &[u8]) -> Result<SearchResult<'s>> {
        if self.config.store != StoreKind::Row {
            return Err(CambiumError::InvalidPageType(format!(
                "key search in a {:?} store",
                self.config.store
            )));
        }
        let collator = &*self.collab.collator;
        let mut guard = self.page_in(&self.root, None, session)?;
        loop {
            match guard.page_type() {
                PageType::RowLeaf => {
                    let write_gen = guard.write_gen();
                    let (slot, exact) = guard.search_row(key, &self.io, collator)?;
                    return Ok(SearchResult {
                        guard,
                        position: Position::Slot(slot),
                        write_gen,
                        exact,
                    });
                }
                PageType::RowInt => {
                    let (slot, _) = guard.search_row(key, &self.io, collator)?;
                    let child = guard.child(slot).ok_or_else(|| no_child(&guard, slot))?;
                    let next = self.page_in(child, Some(guard.page()), session)?;
                    guard = next;
                }
                other => return Err(unexpected(&guard, other)),
            }
        }
    }

    /// Descends to the column leaf holding record `recno`.
    ///
    /// Fails with [`CambiumError::KeyNotFound`] if no subtree covers the
    /// record.
    pub fn search_col<'s>(&self, session: &'s Session, recno: u64) -> Result<SearchResult<'s>> {
        if self.config.store == StoreKind::Row {
            return Err(CambiumError::InvalidPageType(
                "record search in a row store".to_string(),
            ));
        }
        let mut guard = self.page_in(&self.root, None, session)?;
        loop {
            match guard.page_type() {
                PageType::ColVar | PageType::ColFix | PageType::ColRle => {
                    let write_gen = guard.write_gen();
                    let exact = guard.contains_record(recno);
                    return Ok(SearchResult {
                        guard,
                        position: Position::Record(recno),
                        write_gen,
                        exact,
                    });
                }
                PageType::ColInt => {
                    let slot = guard
                        .child_for_record(recno)
                        .ok_or(CambiumError::KeyNotFound)?;
                    let child = guard.child(slot).ok_or_else(|| no_child(&guard, slot))?;
                    let next = self.page_in(child, Some(guard.page()), session)?;
                    guard = next;
                }
                other => return Err(unexpected(&guard, other)),
            }
        }
    }

    /// Current value of `key`. For a duplicate set, the first value that is
    /// not deleted.
    pub fn get(&self, session: &Session, key: &[u8]) -> Result<Option<Bytes>> {
        let found = self.search_row(session, key)?;
        if !found.exact {
            return Ok(None);
        }
        let slots = self.group_slots(&found)?;
        let mut values = Vec::with_capacity(1);
        self.collect_values(&found.guard, slots, session, &mut values, 1)?;
        Ok(values.pop())
    }

    /// Every live value of `key`, in order, including values held in an
    /// off-page duplicate tree.
    pub fn get_duplicates(&self, session: &Session, key: &[u8]) -> Result<Vec<Bytes>> {
        let found = self.search_row(session, key)?;
        if !found.exact {
            return Ok(Vec::new());
        }
        let slots = self.group_slots(&found)?;
        let mut values = Vec::new();
        self.collect_values(&found.guard, slots, session, &mut values, usize::MAX)?;
        Ok(values)
    }

    /// Current value of record `recno`.
    pub fn get_col(&self, session: &Session, recno: u64) -> Result<Option<Bytes>> {
        let found = match self.search_col(session, recno) {
            Ok(found) => found,
            Err(CambiumError::KeyNotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        if !found.exact {
            return Ok(None);
        }
        match found.guard.read_value(found.position)? {
            Value::Data(value) => Ok(Some(value)),
            Value::Overflow(ovfl) => {
                overflow::read_overflow(&*self.io.blocks, &self.io.geometry, ovfl).map(Some)
            }
            Value::Deleted => Ok(None),
            Value::Subtree(_) => Err(unexpected(&found.guard, found.guard.page_type())),
        }
    }

    /// Replaces or deletes the value of an existing key. For a duplicate
    /// set, the first value is changed.
    ///
    /// A search that raced with another update is repeated. Returns the
    /// leaf's new write generation.
    pub fn update(&self, session: &Session, key: &[u8], update: Update) -> Result<u32> {
        loop {
            let found = self.search_row(session, key)?;
            if !found.exact {
                return Err(CambiumError::KeyNotFound);
            }
            match self.apply(&found, update.clone()) {
                Err(e) if e.is_retryable() => self.retry(&found, &e),
                result => return result,
            }
        }
    }

    /// Replaces or deletes record `recno`.
    pub fn update_col(&self, session: &Session, recno: u64, update: Update) -> Result<u32> {
        loop {
            let found = self.search_col(session, recno)?;
            if !found.exact {
                return Err(CambiumError::KeyNotFound);
            }
            match self.apply(&found, update.clone()) {
                Err(e) if e.is_retryable() => self.retry(&found, &e),
                result => return result,
            }
        }
    }

    fn apply(&self, found: &SearchResult<'_>, update: Update) -> Result<u32> {
        let ticket = self.write_path.enter();
        found
            .guard
            .apply_update(&ticket, found.position, update, found.write_gen)
    }

    fn retry(&self, found: &SearchResult<'_>, error: &CambiumError) {
        self.counters.update_retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(addr = %found.guard.addr(), %error, "retrying update");
    }

    /// Slots of the key group a row search landed on.
    fn group_slots(&self, found: &SearchResult<'_>) -> Result<Range<u32>> {
        match found.position {
            Position::Slot(slot) => found.guard.group(slot),
            Position::Record(recno) => Err(CambiumError::InvalidPosition(format!(
                "record {} in a row search",
                recno
            ))),
        }
    }

    /// Appends the live values of `slots` to `out`, stopping at `limit`.
    fn collect_values(
        &self,
        guard: &PageGuard<'_>,
        slots: Range<u32>,
        session: &Session,
        out: &mut Vec<Bytes>,
        limit: usize,
    ) -> Result<()> {
        for slot in slots {
            if out.len() >= limit {
                break;
            }
            match guard.read_value(Position::Slot(slot))? {
                Value::Data(value) => out.push(value),
                Value::Overflow(ovfl) => out.push(overflow::read_overflow(
                    &*self.io.blocks,
                    &self.io.geometry,
                    ovfl,
                )?),
                Value::Deleted => {}
                Value::Subtree(_) => {
                    let child = guard.child(slot).ok_or_else(|| no_child(guard, slot))?;
                    self.collect_subtree(child, guard.page(), session, out, limit)?;
                }
            }
        }
        Ok(())
    }

    /// Walks an off-page duplicate tree in order.
    fn collect_subtree(
        &self,
        r: &PageRef,
        parent: &Arc<MemPage>,
        session: &Session,
        out: &mut Vec<Bytes>,
        limit: usize,
    ) -> Result<()> {
        let guard = self.page_in(r, Some(parent), session)?;
        match guard.page_type() {
            PageType::DupLeaf => {
                let slots = 0..guard.entries() as u32;
                self.collect_values(&guard, slots, session, out, limit)
            }
            PageType::DupInt => {
                for child in guard.children() {
                    if out.len() >= limit {
                        break;
                    }
                    self.collect_subtree(child, guard.page(), session, out, limit)?;
                }
                Ok(())
            }
            other => Err(unexpected(&guard, other)),
        }
    }

    /// Writes `page`, owned by `r`, to a new location if it is dirty.
    ///
    /// The owning reference is pointed at the new image and the parent is
    /// marked modified so its next image refers to it. For the root, the
    /// in-memory descriptor is updated instead; it reaches the file at the
    /// next checkpoint. Blocks the page retired are freed if no session
    /// holds it.
    pub fn flush_page(
        &self,
        r: &PageRef,
        page: &Arc<MemPage>,
        ticket: &WriteTicket<'_>,
    ) -> Result<bool> {
        let reconciled = page.reconcile(&self.io, ticket)?;
        if let Some(location) = reconciled {
            r.set_location(location);
        }
        self.release_retired(page, ticket);
        let Some(location) = reconciled else {
            return Ok(false);
        };
        if std::ptr::eq(r, &self.root) {
            let mut desc = self.desc.lock();
            desc.root_addr = location.addr;
            desc.root_size = location.size;
            desc.records = column_records(&self.config, location.records);
        } else if let Some(parent) = page.parent() {
            parent.mark_modified(ticket);
        }
        self.counters.flushed.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Frees the blocks `page` retired unless a session holds the page.
    ///
    /// A retired block is unreachable from the page's current version, so
    /// only a reader that took its address earlier can use it, and such a
    /// reader holds a hazard reference until it is done.
    fn release_retired(&self, page: &Arc<MemPage>, ticket: &WriteTicket<'_>) -> usize {
        if page.retired_count() == 0 {
            return 0;
        }
        fence(Ordering::SeqCst);
        if self.hazards.is_hazard(hazard_id(page)) {
            tracing::trace!(
                addr = %page.addr(),
                retired = page.retired_count(),
                "page in use, retired blocks kept"
            );
            return 0;
        }
        page.free_retired(&self.io, ticket)
    }

    /// Writes every dirty page, children before parents, then the free list
    /// and the descriptor. Returns the number of pages written.
    pub fn checkpoint(&self) -> Result<usize> {
        let ticket = self.write_path.enter();
        let flushed = self.flush_tree(&self.root, &ticket)?;

        let mut desc = self.desc.lock();
        if desc.free_addr.is_valid() {
            self.io.blocks.free(desc.free_addr, desc.free_size)?;
        }
        let extents = self.io.blocks.free_extents();
        let (free_addr, free_size) = if extents.is_empty() {
            (Address::INVALID, 0)
        } else {
            let header = PageHeader::new(PageType::Freelist, LEVEL_NONE);
            let image = codec::encode(&header, &PageBody::Extents(extents), &self.io.geometry)?;
            self.io.blocks.append(&image)?
        };
        desc.free_addr = free_addr;
        desc.free_size = free_size;
        self.io.blocks.write_descriptor(&desc.to_bytes())?;
        self.io.blocks.sync()?;

        tracing::info!(
            flushed,
            root = %desc.root_addr,
            free_list = %free_addr,
            "checkpoint complete"
        );
        Ok(flushed)
    }

    fn flush_tree(&self, r: &PageRef, ticket: &WriteTicket<'_>) -> Result<usize> {
        let Some(page) = r.resident() else {
            return Ok(0);
        };
        let mut flushed = 0;
        for child in page.children() {
            flushed += self.flush_tree(child, ticket)?;
        }
        if self.flush_page(r, &page, ticket)? {
            flushed += 1;
        }
        Ok(flushed)
    }

    /// Tries to release the page `r` names.
    ///
    /// The reference is marked, a full fence is issued, and the hazard table
    /// is scanned. If any session holds the page the eviction is abandoned.
    /// Otherwise a dirty page is written and the owning pointer released.
    pub fn evict(&self, r: &PageRef) -> Result<EvictOutcome> {
        let ticket = self.write_path.enter();
        let Some(page) = r.resident() else {
            return Ok(EvictOutcome::Skipped);
        };
        if page.is_pinned() || page.has_resident_children() || !r.begin_eviction() {
            return Ok(EvictOutcome::Skipped);
        }
        fence(Ordering::SeqCst);

        if self.hazards.is_hazard(hazard_id(&page)) {
            r.abort_eviction();
            self.counters.eviction_busy.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(addr = %page.addr(), "eviction abandoned, page in use");
            return Ok(EvictOutcome::Busy);
        }
        // A reader that left before the fence may have paged in a child.
        if page.has_resident_children() {
            r.abort_eviction();
            return Ok(EvictOutcome::Skipped);
        }
        if let Err(e) = self.flush_page(r, &page, &ticket) {
            r.abort_eviction();
            tracing::warn!(addr = %page.addr(), error = %e, "failed to write page for eviction");
            return Err(e);
        }
        // No session holds the page and none can acquire it now.
        page.free_retired(&self.io, &ticket);
        drop(r.finish_eviction());
        self.counters.evicted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(addr = %page.addr(), slot = r.slot(), "evicted page");
        Ok(EvictOutcome::Evicted)
    }

    /// Evicts up to `batch` of the least recently read pages that have no
    /// resident children. Returns the number evicted.
    pub fn evict_pass(&self, batch: usize) -> Result<usize> {
        let mut candidates = Vec::new();
        if let Some(root) = self.root.resident() {
            collect_candidates(&root, &mut candidates);
        }
        candidates.sort_by_key(|c| c.read_gen);

        let mut evicted = 0;
        for candidate in candidates.iter().take(batch) {
            let r = &candidate.parent.children()[candidate.index];
            if self.evict(r)? == EvictOutcome::Evicted {
                evicted += 1;
            }
        }
        tracing::debug!(candidates = candidates.len(), evicted, "eviction pass");
        Ok(evicted)
    }

    /// Approximate bytes held by resident pages.
    pub fn resident_bytes(&self) -> usize {
        let mut bytes = 0;
        self.visit_resident(&mut |page| bytes += page.footprint());
        bytes
    }

    /// Number of resident pages.
    pub fn resident_pages(&self) -> usize {
        let mut pages = 0;
        self.visit_resident(&mut |_| pages += 1);
        pages
    }

    fn visit_resident(&self, f: &mut dyn FnMut(&MemPage)) {
        fn walk(page: &Arc<MemPage>, f: &mut dyn FnMut(&MemPage)) {
            f(page);
            for child in page.children() {
                if let Some(child) = child.resident() {
                    walk(&child, f);
                }
            }
        }
        if let Some(root) = self.root.resident() {
            walk(&root, f);
        }
    }

    /// Returns statistics about the tree's cache.
    pub fn stats(&self) -> TreeStats {
        let mut resident_pages = 0;
        let mut resident_bytes = 0;
        let mut dirty_pages = 0;
        let mut retired_blocks = 0;
        self.visit_resident(&mut |page| {
            resident_pages += 1;
            resident_bytes += page.footprint();
            retired_blocks += page.retired_count();
            if page.is_dirty() {
                dirty_pages += 1;
            }
        });
        TreeStats {
            resident_pages,
            resident_bytes,
            dirty_pages,
            page_ins: self.counters.page_ins.load(Ordering::Relaxed),
            races_lost: self.counters.races_lost.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            eviction_busy: self.counters.eviction_busy.load(Ordering::Relaxed),
            flushed: self.counters.flushed.load(Ordering::Relaxed),
            update_retries: self.counters.update_retries.load(Ordering::Relaxed),
            active_hazards: self.hazards.active(),
            retired_blocks,
        }
    }
}

impl std::fmt::Debug for Btree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Btree")
            .field("store", &self.config.store)
            .field("root", &self.root)
            .field("hazards", &self.hazards)
            .finish()
    }
}

fn read_page(
    io: &PageIo,
    location: OffRecord,
    parent: Weak<MemPage>,
    parent_slot: u32,
) -> Result<MemPage> {
    let image = io.blocks.read(location.addr, location.size)?;
    let disk = codec::decode(image, &io.geometry, location.addr)?;
    MemPage::new(disk, location.addr, io.geometry.fixed_len, parent, parent_slot)
}

fn load_freelist(io: &PageIo, addr: Address, size: u32) -> Result<()> {
    let image = io.blocks.read(addr, size)?;
    let page = codec::decode(image, &io.geometry, addr)?;
    match page.body {
        PageBody::Extents(extents) if page.header.page_type == PageType::Freelist => {
            tracing::debug!(%addr, extents = extents.len(), "loaded free list");
            io.blocks.load_free_extents(&extents);
            Ok(())
        }
        _ => Err(CambiumError::Format(format!(
            "free list at {} is a {:?} page",
            addr, page.header.page_type
        ))),
    }
}

fn check_unit(config: &BtreeConfig, blocks: &dyn BlockManager) -> Result<()> {
    let unit = config.allocation_unit()?;
    if unit != blocks.allocation_unit() {
        return Err(CambiumError::Config(format!(
            "allocation unit {} does not match the file's {}",
            unit.size(),
            blocks.allocation_unit().size()
        )));
    }
    Ok(())
}

fn root_type_allowed(config: &BtreeConfig, page_type: PageType) -> bool {
    match config.store {
        StoreKind::Row => matches!(page_type, PageType::RowLeaf | PageType::RowInt),
        StoreKind::ColumnVariable => matches!(page_type, PageType::ColVar | PageType::ColInt),
        StoreKind::ColumnFixed if config.run_length_encoding => {
            matches!(page_type, PageType::ColRle | PageType::ColInt)
        }
        StoreKind::ColumnFixed => matches!(page_type, PageType::ColFix | PageType::ColInt),
    }
}

/// Record count kept in the descriptor. Row stores do not count records.
fn column_records(config: &BtreeConfig, records: u64) -> u64 {
    match config.store {
        StoreKind::Row => 0,
        _ => records,
    }
}

fn collect_candidates(page: &Arc<MemPage>, out: &mut Vec<Candidate>) {
    for (index, child) in page.children().iter().enumerate() {
        let Some(resident) = child.resident() else {
            continue;
        };
        if resident.has_resident_children() {
            collect_candidates(&resident, out);
        } else if !resident.is_pinned() {
            out.push(Candidate {
                parent: Arc::clone(page),
                index,
                read_gen: resident.read_gen(),
            });
        }
    }
}

fn no_child(page: &MemPage, slot: u32) -> CambiumError {
    CambiumError::corruption(
        page.addr().0,
        format!("slot {} of a {:?} page has no child", slot, page.page_type()),
    )
}

fn unexpected(page: &MemPage, page_type: PageType) -> CambiumError {
    CambiumError::corruption(
        page.addr().0,
        format!("unexpected {:?} page at level {}", page_type, page.level()),
    )
}
