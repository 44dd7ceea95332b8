//! Bulk loading.
//!
//! Builds a tree bottom-up from complete input: leaves are packed up to the
//! configured maximum page size, then internal levels are stacked on top
//! until a single root remains. Every page is written once.

use crate::page::{push_run, PageIo};
use bytes::Bytes;
use cambium_common::{BtreeConfig, CambiumError, Collator, Result, StoreKind};
use cambium_storage::{
    codec, fixed_deleted_record, Item, ItemType, OffRecord, PageBody, PageHeader, PageType,
    RleRun, LEVEL_LEAF,
};
use std::cmp::Ordering;

/// Duplicate sets larger than this share of a leaf are moved to their own
/// tree.
const DUP_TREE_FRACTION: usize = 4;

/// Input of a bulk load.
#[derive(Debug, Clone)]
pub enum BulkInput {
    /// Key/value pairs of a row store, in any order. Equal keys form a
    /// duplicate set, kept in input order.
    Rows(Vec<(Bytes, Bytes)>),
    /// Records of a column store, numbered from the configured first record.
    /// `None` is a deleted record.
    Records(Vec<Option<Bytes>>),
}

/// Header and body of an empty leaf for the configured store.
pub(crate) fn empty_leaf(config: &BtreeConfig) -> (PageHeader, PageBody) {
    match config.store {
        StoreKind::Row => (
            PageHeader::new(PageType::RowLeaf, LEVEL_LEAF),
            PageBody::Items(Vec::new()),
        ),
        StoreKind::ColumnVariable => (
            PageHeader::new(PageType::ColVar, LEVEL_LEAF).with_start_recno(config.recno_offset),
            PageBody::Items(Vec::new()),
        ),
        StoreKind::ColumnFixed if config.run_length_encoding => (
            PageHeader::new(PageType::ColRle, LEVEL_LEAF).with_start_recno(config.recno_offset),
            PageBody::Runs(Vec::new()),
        ),
        StoreKind::ColumnFixed => (
            PageHeader::new(PageType::ColFix, LEVEL_LEAF).with_start_recno(config.recno_offset),
            PageBody::Fixed(Vec::new()),
        ),
    }
}

/// Writes the pages of a new tree and returns the root's location.
pub(crate) fn build(
    config: &BtreeConfig,
    io: &PageIo,
    collator: &dyn Collator,
    input: BulkInput,
) -> Result<OffRecord> {
    let root = match (config.store, input) {
        (StoreKind::Row, BulkInput::Rows(rows)) => build_rows(config, io, collator, rows)?,
        (StoreKind::Row, BulkInput::Records(_)) => {
            return Err(CambiumError::Config(
                "a row store is loaded from key/value pairs".to_string(),
            ));
        }
        (_, BulkInput::Rows(_)) => {
            return Err(CambiumError::Config(
                "a column store is loaded from records".to_string(),
            ));
        }
        (_, BulkInput::Records(records)) => build_records(config, io, records)?,
    };
    tracing::info!(
        root = %root.addr,
        size = root.size,
        records = root.records,
        store = ?config.store,
        "bulk load complete"
    );
    Ok(root)
}

fn write_page(
    io: &PageIo,
    header: PageHeader,
    body: PageBody,
    records: u64,
) -> Result<OffRecord> {
    let image = codec::encode(&header, &body, &io.geometry)?;
    let (addr, size) = io.blocks.write(&image)?;
    Ok(OffRecord::new(addr, size, records))
}

fn write_empty(config: &BtreeConfig, io: &PageIo) -> Result<OffRecord> {
    let (header, body) = empty_leaf(config);
    write_page(io, header, body, 0)
}

/// Items of one page being filled.
struct Filling {
    items: Vec<Item>,
    used: usize,
    limit: usize,
    first: Option<Bytes>,
    records: u64,
}

impl Filling {
    fn new(limit: u32) -> Self {
        Self {
            items: Vec::new(),
            used: PageHeader::SIZE,
            limit: limit as usize,
            first: None,
            records: 0,
        }
    }

    /// Returns true if `space` more bytes would overflow a non-empty page.
    fn is_full(&self, space: usize) -> bool {
        !self.items.is_empty() && self.used + space > self.limit
    }

    fn push(&mut self, first: &Bytes, items: Vec<Item>, records: u64) {
        if self.items.is_empty() {
            self.first = Some(first.clone());
        }
        self.used += items.iter().map(Item::space).sum::<usize>();
        self.items.extend(items);
        self.records += records;
    }

    fn take(&mut self) -> (Bytes, Vec<Item>, u64) {
        self.used = PageHeader::SIZE;
        (
            self.first.take().unwrap_or_default(),
            std::mem::take(&mut self.items),
            std::mem::take(&mut self.records),
        )
    }
}

fn build_rows(
    config: &BtreeConfig,
    io: &PageIo,
    collator: &dyn Collator,
    mut rows: Vec<(Bytes, Bytes)>,
) -> Result<OffRecord> {
    if rows.is_empty() {
        return write_empty(config, io);
    }
    rows.sort_by(|a, b| collator.compare(&a.0, &b.0));

    let mut leaves = Vec::new();
    let mut page = Filling::new(config.leaf_page_max);
    let mut at = 0;
    while at < rows.len() {
        let key = rows[at].0.clone();
        let end = at
            + rows[at..]
                .iter()
                .take_while(|(k, _)| collator.compare(k, &key) == Ordering::Equal)
                .count();
        let values: Vec<Bytes> = rows[at..end].iter().map(|(_, v)| v.clone()).collect();
        let group = key_group(config, io, &key, values)?;
        let space = group.iter().map(Item::space).sum();
        if page.is_full(space) {
            let (first, items, records) = page.take();
            let header = PageHeader::new(PageType::RowLeaf, LEVEL_LEAF);
            leaves.push((first, write_page(io, header, PageBody::Items(items), records)?));
        }
        page.push(&key, group, (end - at) as u64);
        at = end;
    }
    let (first, items, records) = page.take();
    let header = PageHeader::new(PageType::RowLeaf, LEVEL_LEAF);
    leaves.push((first, write_page(io, header, PageBody::Items(items), records)?));

    let root = stack_keyed(config, io, leaves, PageType::RowInt)?;
    // Row-store record counts are not tracked.
    Ok(OffRecord::new(root.addr, root.size, 0))
}

/// The key item and data items of one key.
fn key_group(
    config: &BtreeConfig,
    io: &PageIo,
    key: &Bytes,
    mut values: Vec<Bytes>,
) -> Result<Vec<Item>> {
    let key_item = io.spill(ItemType::Key, io.transform.encode(key)?)?;
    if values.len() == 1 {
        let value = values.pop().unwrap_or_default();
        return Ok(vec![key_item, io.spill(ItemType::Data, value)?]);
    }

    let dups = values
        .iter()
        .map(|v| io.spill(ItemType::DataDup, v.clone()))
        .collect::<Result<Vec<_>>>()?;
    let space: usize = dups.iter().map(Item::space).sum();
    if space <= config.leaf_page_max as usize / DUP_TREE_FRACTION {
        let mut group = Vec::with_capacity(dups.len() + 1);
        group.push(key_item);
        group.extend(dups);
        return Ok(group);
    }

    let mut leaves = Vec::new();
    let mut page = Filling::new(config.leaf_page_max);
    for (value, item) in values.iter().zip(dups) {
        if page.is_full(item.space()) {
            let (first, items, records) = page.take();
            let header = PageHeader::new(PageType::DupLeaf, LEVEL_LEAF);
            leaves.push((first, write_page(io, header, PageBody::Items(items), records)?));
        }
        page.push(value, vec![item], 1);
    }
    let (first, items, records) = page.take();
    let header = PageHeader::new(PageType::DupLeaf, LEVEL_LEAF);
    leaves.push((first, write_page(io, header, PageBody::Items(items), records)?));
    let root = stack_keyed(config, io, leaves, PageType::DupInt)?;
    tracing::debug!(values = root.records, root = %root.addr, "moved duplicate set off-page");
    Ok(vec![key_item, Item::off_record(root)])
}

/// Stacks internal levels of key/child pairs over `children` until one
/// page remains.
fn stack_keyed(
    config: &BtreeConfig,
    io: &PageIo,
    mut children: Vec<(Bytes, OffRecord)>,
    page_type: PageType,
) -> Result<OffRecord> {
    let key_kind = match page_type {
        PageType::DupInt => ItemType::KeyDup,
        _ => ItemType::Key,
    };
    let mut level = LEVEL_LEAF;
    while children.len() > 1 {
        level += 1;
        let mut parents = Vec::new();
        let mut page = Filling::new(config.internal_page_max);
        for (key, child) in children {
            let raw = io.transform.encode(&key)?;
            let pair = vec![io.spill(key_kind, raw)?, Item::off(child.off())];
            if page.is_full(pair.iter().map(Item::space).sum()) {
                let (first, items, records) = page.take();
                let header = PageHeader::new(page_type, level);
                parents.push((first, write_page(io, header, PageBody::Items(items), records)?));
            }
            page.push(&key, pair, child.records);
        }
        let (first, items, records) = page.take();
        let header = PageHeader::new(page_type, level);
        parents.push((first, write_page(io, header, PageBody::Items(items), records)?));
        children = parents;
    }
    children
        .pop()
        .map(|(_, root)| root)
        .ok_or_else(|| CambiumError::Internal("no pages were written".to_string()))
}

fn build_records(
    config: &BtreeConfig,
    io: &PageIo,
    records: Vec<Option<Bytes>>,
) -> Result<OffRecord> {
    if records.is_empty() {
        return write_empty(config, io);
    }
    let start = config.recno_offset;
    let room = (config.leaf_page_max as usize).saturating_sub(PageHeader::SIZE);
    let mut leaves = Vec::new();

    match config.store {
        StoreKind::ColumnVariable => {
            let mut page = Filling::new(config.leaf_page_max);
            let mut page_start = start;
            for record in records {
                let item = match record {
                    Some(value) => io.spill(ItemType::Data, value)?,
                    None => Item::deleted(),
                };
                if page.is_full(item.space()) {
                    let (_, items, count) = page.take();
                    let header =
                        PageHeader::new(PageType::ColVar, LEVEL_LEAF).with_start_recno(page_start);
                    leaves.push(write_page(io, header, PageBody::Items(items), count)?);
                    page_start += count;
                }
                page.push(&Bytes::new(), vec![item], 1);
            }
            let (_, items, count) = page.take();
            let header = PageHeader::new(PageType::ColVar, LEVEL_LEAF).with_start_recno(page_start);
            leaves.push(write_page(io, header, PageBody::Items(items), count)?);
        }
        StoreKind::ColumnFixed => {
            let fixed_len = config.fixed_len;
            let values = records
                .into_iter()
                .map(|record| match record {
                    Some(value) if value.len() != fixed_len as usize => Err(CambiumError::Size {
                        what: "fixed-length record",
                        size: value.len(),
                        max: fixed_len as usize,
                    }),
                    Some(value) => Ok(value),
                    None => Ok(fixed_deleted_record(fixed_len)),
                })
                .collect::<Result<Vec<_>>>()?;
            let mut page_start = start;
            if config.run_length_encoding {
                let mut runs: Vec<RleRun> = Vec::new();
                for value in &values {
                    push_run(&mut runs, value, 1);
                }
                let per_page = (room / (2 + fixed_len as usize)).max(1);
                for chunk in runs.chunks(per_page) {
                    let count: u64 = chunk.iter().map(|r| r.count as u64).sum();
                    let header =
                        PageHeader::new(PageType::ColRle, LEVEL_LEAF).with_start_recno(page_start);
                    leaves.push(write_page(io, header, PageBody::Runs(chunk.to_vec()), count)?);
                    page_start += count;
                }
            } else {
                let per_page = (room / fixed_len as usize).max(1);
                for chunk in values.chunks(per_page) {
                    let count = chunk.len() as u64;
                    let header =
                        PageHeader::new(PageType::ColFix, LEVEL_LEAF).with_start_recno(page_start);
                    leaves.push(write_page(io, header, PageBody::Fixed(chunk.to_vec()), count)?);
                    page_start += count;
                }
            }
        }
        StoreKind::Row => {
            return Err(CambiumError::Internal("row store in the column loader".to_string()));
        }
    }
    stack_counted(config, io, leaves, start)
}

/// Stacks column internal levels over `children` until one page remains.
fn stack_counted(
    config: &BtreeConfig,
    io: &PageIo,
    mut children: Vec<OffRecord>,
    start: u64,
) -> Result<OffRecord> {
    let room = (config.internal_page_max as usize).saturating_sub(PageHeader::SIZE);
    let per_page = (room / OffRecord::SIZE).max(2);
    let mut level = LEVEL_LEAF;
    while children.len() > 1 {
        level += 1;
        let mut parents = Vec::with_capacity(children.len() / per_page + 1);
        let mut page_start = start;
        for chunk in children.chunks(per_page) {
            let count: u64 = chunk.iter().map(|c| c.records).sum();
            let header = PageHeader::new(PageType::ColInt, level).with_start_recno(page_start);
            parents.push(write_page(io, header, PageBody::Children(chunk.to_vec()), count)?);
            page_start += count;
        }
        children = parents;
    }
    children
        .pop()
        .ok_or_else(|| CambiumError::Internal("no pages were written".to_string()))
}
