//! Typed page bodies.
//!
//! The page type alone decides how the bytes after the header are read;
//! bodies carry no self-describing framing beyond that tag.

use crate::item::{Item, ItemCursor, ItemType, OffRecord, OffRef};
use crate::page::{BodyLayout, PageHeader, PageType};
use bytes::{BufMut, Bytes, BytesMut};
use cambium_common::{Address, CambiumError, Result};

/// First byte of a deleted fixed-length record.
pub const FIXED_DELETED: u8 = 0x80;

/// Size of the repeat count in front of each run.
pub const RLE_COUNT_SIZE: usize = 2;

/// Returns true if a fixed-length record carries the deletion marker.
#[inline]
pub fn is_fixed_deleted(record: &[u8]) -> bool {
    record.first() == Some(&FIXED_DELETED)
}

/// A deleted fixed-length record: the marker byte followed by zeroes.
pub fn fixed_deleted_record(fixed_len: u8) -> Bytes {
    let mut buf = BytesMut::zeroed(fixed_len as usize);
    if let Some(first) = buf.first_mut() {
        *first = FIXED_DELETED;
    }
    buf.freeze()
}

/// One run of identical fixed-length records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RleRun {
    pub count: u16,
    pub value: Bytes,
}

impl RleRun {
    pub fn new(count: u16, value: impl Into<Bytes>) -> Self {
        Self {
            count,
            value: value.into(),
        }
    }
}

/// Decoded body of an on-disk page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageBody {
    /// Item stream (row pages, duplicate-tree pages, variable column leaves).
    Items(Vec<Item>),
    /// Fixed-length column records.
    Fixed(Vec<Bytes>),
    /// Column internal page children.
    Children(Vec<OffRecord>),
    /// Run-length encoded fixed-length records.
    Runs(Vec<RleRun>),
    /// Free-list extents (address and byte size).
    Extents(Vec<OffRef>),
    /// Overflow payload.
    Raw(Bytes),
}

/// Returns true if an item of type `kind` may appear on a page of type `page_type`.
pub fn item_allowed(page_type: PageType, kind: ItemType) -> bool {
    use ItemType::*;
    match page_type {
        PageType::RowInt => matches!(kind, Key | KeyOvfl | Off),
        PageType::RowLeaf => matches!(
            kind,
            Key | KeyOvfl | Data | DataOvfl | DataDup | DataDupOvfl | OffRecord
        ),
        PageType::DupInt => matches!(kind, KeyDup | KeyDupOvfl | Off),
        PageType::DupLeaf => matches!(kind, DataDup | DataDupOvfl),
        PageType::ColVar => matches!(kind, Data | DataOvfl | Del),
        _ => false,
    }
}

impl PageBody {
    /// Layout this body is written with.
    pub fn layout(&self) -> BodyLayout {
        match self {
            PageBody::Items(_) => BodyLayout::Items,
            PageBody::Fixed(_) => BodyLayout::FixedRecords,
            PageBody::Children(_) => BodyLayout::Children,
            PageBody::Runs(_) => BodyLayout::Runs,
            PageBody::Extents(_) => BodyLayout::Extents,
            PageBody::Raw(_) => BodyLayout::Raw,
        }
    }

    /// Value of the header's entries field: the element count, or the
    /// payload length for overflow pages.
    pub fn entries(&self) -> usize {
        match self {
            PageBody::Items(items) => items.len(),
            PageBody::Fixed(records) => records.len(),
            PageBody::Children(children) => children.len(),
            PageBody::Runs(runs) => runs.len(),
            PageBody::Extents(extents) => extents.len(),
            PageBody::Raw(data) => data.len(),
        }
    }

    /// Bytes the body occupies after the header, before allocation padding.
    pub fn encoded_len(&self, fixed_len: u8) -> usize {
        match self {
            PageBody::Items(items) => items.iter().map(Item::space).sum(),
            PageBody::Fixed(records) => records.len() * fixed_len as usize,
            PageBody::Children(children) => children.len() * OffRecord::SIZE,
            PageBody::Runs(runs) => runs.len() * (RLE_COUNT_SIZE + fixed_len as usize),
            PageBody::Extents(extents) => extents.len() * OffRef::SIZE,
            PageBody::Raw(data) => data.len(),
        }
    }

    /// Checks that this body may be written on a page of `page_type`.
    pub fn validate(&self, page_type: PageType, fixed_len: u8) -> Result<()> {
        if page_type.layout() != Some(self.layout()) {
            return Err(CambiumError::InvalidPageType(format!(
                "{:?} body cannot be written to a {:?} page",
                self.layout(),
                page_type
            )));
        }
        if page_type.needs_fixed_len() && fixed_len == 0 {
            return Err(CambiumError::Config(format!(
                "{:?} pages need a fixed record length",
                page_type
            )));
        }
        let check_record = |record: &Bytes| -> Result<()> {
            if record.len() != fixed_len as usize {
                return Err(CambiumError::Size {
                    what: "fixed-length record",
                    size: record.len(),
                    max: fixed_len as usize,
                });
            }
            Ok(())
        };
        match self {
            PageBody::Items(items) => {
                if let Some(bad) = items.iter().find(|i| !item_allowed(page_type, i.kind)) {
                    return Err(CambiumError::InvalidPageType(format!(
                        "{:?} item cannot be written to a {:?} page",
                        bad.kind, page_type
                    )));
                }
            }
            PageBody::Fixed(records) => records.iter().try_for_each(check_record)?,
            PageBody::Runs(runs) => {
                for run in runs {
                    if run.count == 0 {
                        return Err(CambiumError::Internal("empty run".to_string()));
                    }
                    check_record(&run.value)?;
                }
            }
            _ => {}
        }
        if self.entries() > u32::MAX as usize {
            return Err(CambiumError::Size {
                what: "page entries",
                size: self.entries(),
                max: u32::MAX as usize,
            });
        }
        Ok(())
    }

    /// Appends the body to `buf`. Call [`PageBody::validate`] first.
    pub fn write_to(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            PageBody::Items(items) => {
                for item in items {
                    item.encode(buf)?;
                }
            }
            PageBody::Fixed(records) => {
                for record in records {
                    buf.put_slice(record);
                }
            }
            PageBody::Children(children) => {
                for child in children {
                    buf.put_slice(&child.to_bytes());
                }
            }
            PageBody::Runs(runs) => {
                for run in runs {
                    buf.put_u16_le(run.count);
                    buf.put_slice(&run.value);
                }
            }
            PageBody::Extents(extents) => {
                for extent in extents {
                    buf.put_slice(&extent.to_bytes());
                }
            }
            PageBody::Raw(data) => buf.put_slice(data),
        }
        Ok(())
    }

    /// Interprets the bytes after the header of `image`.
    ///
    /// Item payloads, fixed records and overflow data are views into `image`.
    pub fn parse(header: &PageHeader, image: &Bytes, fixed_len: u8, addr: Address) -> Result<Self> {
        let layout = header.page_type.layout().ok_or_else(|| {
            CambiumError::corruption(addr.0, format!("{:?} page has no body", header.page_type))
        })?;
        if header.page_type.needs_fixed_len() && fixed_len == 0 {
            return Err(CambiumError::Format(format!(
                "{:?} page read without a fixed record length",
                header.page_type
            )));
        }

        let start = PageHeader::SIZE;
        let body_len = image.len().saturating_sub(start);
        let entries = header.entries as usize;
        let fits = |stride: usize| -> Result<()> {
            match entries.checked_mul(stride) {
                Some(len) if len <= body_len => Ok(()),
                _ => Err(CambiumError::corruption(
                    addr.0,
                    format!(
                        "{} entries of {} bytes overrun a {} byte body",
                        entries, stride, body_len
                    ),
                )),
            }
        };

        let body = match layout {
            BodyLayout::Items => {
                let mut items = Vec::with_capacity(entries);
                let mut cursor = ItemCursor::new(image.clone(), start, header.entries, addr);
                while let Some((offset, item)) = cursor.decode_next()? {
                    if !item_allowed(header.page_type, item.kind) {
                        return Err(CambiumError::corruption(
                            addr.0,
                            format!(
                                "{:?} item at {} on a {:?} page",
                                item.kind, offset, header.page_type
                            ),
                        ));
                    }
                    items.push(item);
                }
                PageBody::Items(items)
            }
            BodyLayout::FixedRecords => {
                let stride = fixed_len as usize;
                fits(stride)?;
                PageBody::Fixed(
                    (0..entries)
                        .map(|i| image.slice(start + i * stride..start + (i + 1) * stride))
                        .collect(),
                )
            }
            BodyLayout::Children => {
                fits(OffRecord::SIZE)?;
                PageBody::Children(
                    image[start..start + entries * OffRecord::SIZE]
                        .chunks_exact(OffRecord::SIZE)
                        .map(OffRecord::from_bytes)
                        .collect(),
                )
            }
            BodyLayout::Runs => {
                let stride = RLE_COUNT_SIZE + fixed_len as usize;
                fits(stride)?;
                let mut runs = Vec::with_capacity(entries);
                for i in 0..entries {
                    let at = start + i * stride;
                    let count = u16::from_le_bytes([image[at], image[at + 1]]);
                    if count == 0 {
                        return Err(CambiumError::corruption(
                            addr.0,
                            format!("run {} has a zero repeat count", i),
                        ));
                    }
                    runs.push(RleRun::new(count, image.slice(at + RLE_COUNT_SIZE..at + stride)));
                }
                PageBody::Runs(runs)
            }
            BodyLayout::Extents => {
                fits(OffRef::SIZE)?;
                PageBody::Extents(
                    image[start..start + entries * OffRef::SIZE]
                        .chunks_exact(OffRef::SIZE)
                        .map(OffRef::from_bytes)
                        .collect(),
                )
            }
            BodyLayout::Raw => {
                fits(1)?;
                PageBody::Raw(image.slice(start..start + entries))
            }
        };
        Ok(body)
    }

    /// Number of records a column leaf body holds.
    pub fn record_count(&self) -> u64 {
        match self {
            PageBody::Runs(runs) => runs.iter().map(|r| r.count as u64).sum(),
            PageBody::Children(children) => children
                .iter()
                .fold(0u64, |total, c| total.saturating_add(c.records)),
            PageBody::Items(items) => items.len() as u64,
            PageBody::Fixed(records) => records.len() as u64,
            PageBody::Extents(_) | PageBody::Raw(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::LEVEL_LEAF;

    fn image_for(header: &PageHeader, body: &PageBody) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(&header.to_bytes());
        body.write_to(&mut buf).unwrap();
        buf.freeze()
    }

    #[test]
    fn test_item_rules() {
        assert!(item_allowed(PageType::RowLeaf, ItemType::Key));
        assert!(item_allowed(PageType::RowLeaf, ItemType::DataDupOvfl));
        assert!(item_allowed(PageType::RowLeaf, ItemType::OffRecord));
        assert!(!item_allowed(PageType::RowLeaf, ItemType::Off));
        assert!(!item_allowed(PageType::RowLeaf, ItemType::Del));
        assert!(item_allowed(PageType::RowInt, ItemType::Off));
        assert!(!item_allowed(PageType::RowInt, ItemType::Data));
        assert!(item_allowed(PageType::DupInt, ItemType::KeyDupOvfl));
        assert!(!item_allowed(PageType::DupInt, ItemType::Key));
        assert!(item_allowed(PageType::DupLeaf, ItemType::DataDup));
        assert!(!item_allowed(PageType::DupLeaf, ItemType::Data));
        assert!(item_allowed(PageType::ColVar, ItemType::Del));
        assert!(!item_allowed(PageType::ColVar, ItemType::Key));
        assert!(!item_allowed(PageType::ColFix, ItemType::Data));
    }

    #[test]
    fn test_fixed_deleted_marker() {
        let rec = fixed_deleted_record(4);
        assert_eq!(rec.as_ref(), &[0x80, 0, 0, 0]);
        assert!(is_fixed_deleted(&rec));
        assert!(!is_fixed_deleted(&[0x7f, 0, 0, 0]));
        assert!(!is_fixed_deleted(&[]));
    }

    #[test]
    fn test_validate_rejects_wrong_layout() {
        let body = PageBody::Fixed(vec![Bytes::from_static(b"abcd")]);
        assert!(matches!(
            body.validate(PageType::RowLeaf, 4),
            Err(CambiumError::InvalidPageType(_))
        ));
    }

    #[test]
    fn test_validate_rejects_disallowed_item() {
        let body = PageBody::Items(vec![Item::deleted()]);
        assert!(body.validate(PageType::RowLeaf, 0).is_err());
        assert!(body.validate(PageType::ColVar, 0).is_ok());
    }

    #[test]
    fn test_validate_fixed_record_length() {
        let body = PageBody::Fixed(vec![Bytes::from_static(b"abc")]);
        assert!(matches!(
            body.validate(PageType::ColFix, 4),
            Err(CambiumError::Size { .. })
        ));
        assert!(body.validate(PageType::ColFix, 3).is_ok());
        assert!(matches!(
            body.validate(PageType::ColFix, 0),
            Err(CambiumError::Config(_))
        ));
    }

    #[test]
    fn test_parse_runs() {
        let mut header = PageHeader::new(PageType::ColRle, LEVEL_LEAF).with_start_recno(100);
        let body = PageBody::Runs(vec![
            RleRun::new(10, Bytes::from_static(b"VV")),
            RleRun::new(3, Bytes::from_static(b"WW")),
        ]);
        header.entries = 2;
        let image = image_for(&header, &body);
        let parsed = PageBody::parse(&header, &image, 2, Address(1)).unwrap();
        assert_eq!(parsed, body);
        assert_eq!(parsed.record_count(), 13);
        assert_eq!(body.encoded_len(2), 8);
    }

    #[test]
    fn test_parse_rejects_zero_count_run() {
        let mut header = PageHeader::new(PageType::ColRle, LEVEL_LEAF);
        header.entries = 1;
        let mut buf = BytesMut::new();
        buf.put_slice(&header.to_bytes());
        buf.put_u16_le(0);
        buf.put_slice(b"xx");
        let err = PageBody::parse(&header, &buf.freeze(), 2, Address(5)).unwrap_err();
        assert!(matches!(err, CambiumError::Corruption { addr: 5, .. }));
    }

    #[test]
    fn test_parse_rejects_overrun() {
        let mut header = PageHeader::new(PageType::Freelist, 0);
        header.entries = 3;
        let body = PageBody::Extents(vec![OffRef::new(Address(1), 512)]);
        let image = image_for(&header, &body);
        assert!(PageBody::parse(&header, &image, 0, Address(2)).is_err());
    }

    #[test]
    fn test_parse_rejects_disallowed_item() {
        let mut header = PageHeader::new(PageType::DupLeaf, LEVEL_LEAF);
        header.entries = 1;
        let body = PageBody::Items(vec![Item::key(Bytes::from_static(b"k"))]);
        let image = image_for(&header, &body);
        let err = PageBody::parse(&header, &image, 0, Address(4)).unwrap_err();
        assert!(matches!(err, CambiumError::Corruption { addr: 4, .. }));
    }

    #[test]
    fn test_record_count_children() {
        let body = PageBody::Children(vec![
            OffRecord::new(Address(1), 512, 40),
            OffRecord::new(Address(2), 512, 2),
        ]);
        assert_eq!(body.record_count(), 42);
        assert_eq!(body.encoded_len(0), 32);
    }
}
