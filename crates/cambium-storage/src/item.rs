//! Tagged variable-length items stored in page bodies.
//!
//! Item layout:
//! ```text
//! +----------------------------------------------+
//! | tag: u32 (LE)                                 |
//! |   bits  0..24  payload length                 |
//! |   bits 24..28  item type                      |
//! |   bits 28..32  unused (zero)                  |
//! +----------------------------------------------+
//! | payload (length bytes)                        |
//! | zero padding to the next 4-byte boundary      |
//! +----------------------------------------------+
//! ```
//!
//! The stream has no terminator: readers count entries using the page
//! header's entry count.

use bytes::{BufMut, Bytes, BytesMut};
use cambium_common::{Address, CambiumError, Result};

/// Size of the item tag in bytes.
pub const ITEM_HEADER_SIZE: usize = 4;

/// Largest payload an item can carry inline (2^24 - 1).
pub const ITEM_MAX_LEN: usize = 16 * 1024 * 1024 - 1;

const ITEM_LEN_MASK: u32 = 0x00ff_ffff;
const ITEM_TYPE_SHIFT: u32 = 24;
const ITEM_TYPE_MASK: u32 = 0x0f;
const ITEM_UNUSED_MASK: u32 = 0xf000_0000;

/// Item types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ItemType {
    /// Key.
    Key = 0,
    /// Key stored on an overflow page.
    KeyOvfl = 1,
    /// Key on an off-page duplicate tree internal page.
    KeyDup = 2,
    /// Duplicate-tree key stored on an overflow page.
    KeyDupOvfl = 3,
    /// Data.
    Data = 4,
    /// Data stored on an overflow page.
    DataOvfl = 5,
    /// One of several data items sharing the preceding key.
    DataDup = 6,
    /// Duplicate data stored on an overflow page.
    DataDupOvfl = 7,
    /// Placeholder for a deleted record that must keep its position.
    Del = 8,
    /// Off-page reference (address and size).
    Off = 9,
    /// Off-page reference with a subtree record count.
    OffRecord = 10,
}

impl ItemType {
    /// Decodes an item type.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => ItemType::Key,
            1 => ItemType::KeyOvfl,
            2 => ItemType::KeyDup,
            3 => ItemType::KeyDupOvfl,
            4 => ItemType::Data,
            5 => ItemType::DataOvfl,
            6 => ItemType::DataDup,
            7 => ItemType::DataDupOvfl,
            8 => ItemType::Del,
            9 => ItemType::Off,
            10 => ItemType::OffRecord,
            _ => return None,
        })
    }

    /// Returns true for the overflow forms.
    pub fn is_overflow(&self) -> bool {
        matches!(
            self,
            ItemType::KeyOvfl | ItemType::KeyDupOvfl | ItemType::DataOvfl | ItemType::DataDupOvfl
        )
    }

    /// Returns true for key items (including duplicate-tree keys).
    pub fn is_key(&self) -> bool {
        matches!(
            self,
            ItemType::Key | ItemType::KeyOvfl | ItemType::KeyDup | ItemType::KeyDupOvfl
        )
    }

    /// Returns true for data items.
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            ItemType::Data | ItemType::DataOvfl | ItemType::DataDup | ItemType::DataDupOvfl
        )
    }

    /// Returns true for duplicate data items.
    pub fn is_data_dup(&self) -> bool {
        matches!(self, ItemType::DataDup | ItemType::DataDupOvfl)
    }

    /// Returns the overflow form of an inline type, if it has one.
    pub fn overflow_form(&self) -> Option<ItemType> {
        match self {
            ItemType::Key => Some(ItemType::KeyOvfl),
            ItemType::KeyDup => Some(ItemType::KeyDupOvfl),
            ItemType::Data => Some(ItemType::DataOvfl),
            ItemType::DataDup => Some(ItemType::DataDupOvfl),
            _ => None,
        }
    }

    /// Payload length required by fixed-size item types.
    pub fn fixed_payload_len(&self) -> Option<usize> {
        match self {
            t if t.is_overflow() => Some(OvflRef::SIZE),
            ItemType::Off => Some(OffRef::SIZE),
            ItemType::OffRecord => Some(OffRecord::SIZE),
            ItemType::Del => Some(0),
            _ => None,
        }
    }
}

/// Packs an item tag.
#[inline]
pub fn pack_tag(kind: ItemType, len: usize) -> u32 {
    ((kind as u32) << ITEM_TYPE_SHIFT) | (len as u32 & ITEM_LEN_MASK)
}

/// Unpacks an item tag, rejecting unknown types and set unused bits.
#[inline]
pub fn unpack_tag(tag: u32) -> Option<(ItemType, usize)> {
    if tag & ITEM_UNUSED_MASK != 0 {
        return None;
    }
    let kind = ItemType::from_u8(((tag >> ITEM_TYPE_SHIFT) & ITEM_TYPE_MASK) as u8)?;
    Some((kind, (tag & ITEM_LEN_MASK) as usize))
}

/// Bytes an item with `len` payload bytes occupies, padding included.
#[inline]
pub fn item_space(len: usize) -> usize {
    (ITEM_HEADER_SIZE + len + 3) & !3
}

/// Appends one item to `buf`: tag, payload, zero padding.
pub fn encode_item(buf: &mut BytesMut, kind: ItemType, payload: &[u8]) -> Result<()> {
    if payload.len() > ITEM_MAX_LEN {
        return Err(CambiumError::Size {
            what: "item",
            size: payload.len(),
            max: ITEM_MAX_LEN,
        });
    }
    buf.put_u32_le(pack_tag(kind, payload.len()));
    buf.put_slice(payload);
    let pad = item_space(payload.len()) - ITEM_HEADER_SIZE - payload.len();
    buf.put_bytes(0, pad);
    Ok(())
}

/// Decodes the item starting at `offset` in `buf`.
///
/// Returns the item, whose payload is a view into `buf`, and the offset of
/// the next item.
pub fn decode_item(buf: &Bytes, offset: usize, addr: Address) -> Result<(Item, usize)> {
    let tag_bytes = buf
        .get(offset..offset + ITEM_HEADER_SIZE)
        .ok_or_else(|| CambiumError::corruption(addr.0, format!("item tag at {} overruns page", offset)))?;
    let tag = u32::from_le_bytes([tag_bytes[0], tag_bytes[1], tag_bytes[2], tag_bytes[3]]);
    let (kind, len) = unpack_tag(tag).ok_or_else(|| {
        CambiumError::corruption(addr.0, format!("invalid item tag {:#010x} at {}", tag, offset))
    })?;

    let start = offset + ITEM_HEADER_SIZE;
    let next = offset + item_space(len);
    if start + len > buf.len() || next > buf.len() {
        return Err(CambiumError::corruption(
            addr.0,
            format!("item at {} with length {} overruns page", offset, len),
        ));
    }
    if let Some(expected) = kind.fixed_payload_len() {
        if len != expected {
            return Err(CambiumError::corruption(
                addr.0,
                format!("{:?} item at {} has length {}, expected {}", kind, offset, len, expected),
            ));
        }
    }

    Ok((
        Item {
            kind,
            payload: buf.slice(start..start + len),
        },
        next,
    ))
}

/// A decoded item. The payload is a zero-copy view when it came from a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub kind: ItemType,
    pub payload: Bytes,
}

impl Item {
    /// Creates an item.
    pub fn new(kind: ItemType, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Creates a key item.
    pub fn key(key: impl Into<Bytes>) -> Self {
        Self::new(ItemType::Key, key)
    }

    /// Creates a data item.
    pub fn data(data: impl Into<Bytes>) -> Self {
        Self::new(ItemType::Data, data)
    }

    /// Creates a deleted placeholder.
    pub fn deleted() -> Self {
        Self::new(ItemType::Del, Bytes::new())
    }

    /// Creates an off-page reference item.
    pub fn off(off: OffRef) -> Self {
        Self::new(ItemType::Off, Bytes::copy_from_slice(&off.to_bytes()))
    }

    /// Creates an off-page reference item with record count.
    pub fn off_record(off: OffRecord) -> Self {
        Self::new(ItemType::OffRecord, Bytes::copy_from_slice(&off.to_bytes()))
    }

    /// Creates an overflow item of the given overflow type.
    pub fn overflow(kind: ItemType, ovfl: OvflRef) -> Self {
        debug_assert!(kind.is_overflow());
        Self::new(kind, Bytes::copy_from_slice(&ovfl.to_bytes()))
    }

    /// Bytes this item occupies in a page body.
    pub fn space(&self) -> usize {
        item_space(self.payload.len())
    }

    /// Appends this item to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        encode_item(buf, self.kind, &self.payload)
    }

    /// Interprets the payload as an off-page reference.
    pub fn as_off(&self) -> Option<OffRef> {
        (self.kind == ItemType::Off).then(|| OffRef::from_bytes(&self.payload))
    }

    /// Interprets the payload as an off-page reference with record count.
    pub fn as_off_record(&self) -> Option<OffRecord> {
        (self.kind == ItemType::OffRecord).then(|| OffRecord::from_bytes(&self.payload))
    }

    /// Interprets the payload as an overflow reference.
    pub fn as_ovfl(&self) -> Option<OvflRef> {
        self.kind.is_overflow().then(|| OvflRef::from_bytes(&self.payload))
    }
}

/// Walks an item stream, driven by a caller-held entry count.
pub struct ItemCursor {
    buf: Bytes,
    offset: usize,
    remaining: u32,
    addr: Address,
}

impl ItemCursor {
    /// Creates a cursor over `entries` items starting at `offset`.
    pub fn new(buf: Bytes, offset: usize, entries: u32, addr: Address) -> Self {
        Self {
            buf,
            offset,
            remaining: entries,
            addr,
        }
    }

    /// Offset of the next item to be decoded.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Items left to decode.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Decodes the next item, returning its offset with it.
    pub fn decode_next(&mut self) -> Result<Option<(usize, Item)>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let at = self.offset;
        let (item, next) = decode_item(&self.buf, at, self.addr)?;
        self.offset = next;
        self.remaining -= 1;
        Ok(Some((at, item)))
    }
}

impl Iterator for ItemCursor {
    type Item = Result<(usize, Item)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.decode_next() {
            Ok(Some(v)) => Some(Ok(v)),
            Ok(None) => None,
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}

/// Subtree reference without a record count.
///
/// Layout (8 bytes): addr u32, size u32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OffRef {
    pub addr: Address,
    pub size: u32,
}

impl OffRef {
    /// Size on disk.
    pub const SIZE: usize = 8;

    pub fn new(addr: Address, size: u32) -> Self {
        Self { addr, size }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.addr.0.to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// Deserializes from at least [`Self::SIZE`] bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            addr: Address(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
            size: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

/// Subtree reference carrying the subtree's record count.
///
/// Layout (16 bytes): addr u32, size u32, records u64. The first 8 bytes
/// match [`OffRef`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OffRecord {
    pub addr: Address,
    pub size: u32,
    pub records: u64,
}

impl OffRecord {
    /// Size on disk.
    pub const SIZE: usize = 16;

    pub fn new(addr: Address, size: u32, records: u64) -> Self {
        Self {
            addr,
            size,
            records,
        }
    }

    /// The address/size prefix.
    pub fn off(&self) -> OffRef {
        OffRef::new(self.addr, self.size)
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.off().to_bytes());
        buf[8..16].copy_from_slice(&self.records.to_le_bytes());
        buf
    }

    /// Deserializes from at least [`Self::SIZE`] bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        let off = OffRef::from_bytes(buf);
        let mut records = [0u8; 8];
        records.copy_from_slice(&buf[8..16]);
        Self {
            addr: off.addr,
            size: off.size,
            records: u64::from_le_bytes(records),
        }
    }
}

/// Location of an item too large to store inline.
///
/// Layout (8 bytes): addr u32, size u32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OvflRef {
    pub addr: Address,
    pub size: u32,
}

impl OvflRef {
    /// Size on disk.
    pub const SIZE: usize = 8;

    pub fn new(addr: Address, size: u32) -> Self {
        Self { addr, size }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        OffRef::new(self.addr, self.size).to_bytes()
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let off = OffRef::from_bytes(buf);
        Self {
            addr: off.addr,
            size: off.size,
        }
    }
}
