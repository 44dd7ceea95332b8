//! On-disk page types and the page header.

use cambium_common::Lsn;

/// Tree level of leaf pages. Levels increase toward the root.
pub const LEVEL_LEAF: u8 = 1;

/// Level of pages outside the tree (overflow and free-list pages).
pub const LEVEL_NONE: u8 = 0;

/// Page types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageType {
    /// Never written.
    Invalid = 0,
    /// Column store leaf with fixed-length records.
    ColFix = 1,
    /// Column store internal page.
    ColInt = 2,
    /// Column store leaf with run-length encoded fixed-length records.
    ColRle = 3,
    /// Column store leaf with variable-length records.
    ColVar = 4,
    /// Off-page duplicate tree internal page.
    DupInt = 5,
    /// Off-page duplicate tree leaf.
    DupLeaf = 6,
    /// Overflow page holding one large item.
    Ovfl = 7,
    /// Row store internal page.
    RowInt = 8,
    /// Row store leaf.
    RowLeaf = 9,
    /// Free list.
    Freelist = 10,
}

/// How a page body is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLayout {
    /// Tagged item stream.
    Items,
    /// Array of `fixed_len`-byte records.
    FixedRecords,
    /// Array of 16-byte child references with record counts.
    Children,
    /// Array of (u16 count, `fixed_len` bytes) runs.
    Runs,
    /// Array of 8-byte (address, size) extents.
    Extents,
    /// Raw bytes, length in the header.
    Raw,
}

impl PageType {
    /// Decodes a page type.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => PageType::Invalid,
            1 => PageType::ColFix,
            2 => PageType::ColInt,
            3 => PageType::ColRle,
            4 => PageType::ColVar,
            5 => PageType::DupInt,
            6 => PageType::DupLeaf,
            7 => PageType::Ovfl,
            8 => PageType::RowInt,
            9 => PageType::RowLeaf,
            10 => PageType::Freelist,
            _ => return None,
        })
    }

    /// Body layout for this page type.
    pub fn layout(&self) -> Option<BodyLayout> {
        match self {
            PageType::Invalid => None,
            PageType::ColFix => Some(BodyLayout::FixedRecords),
            PageType::ColInt => Some(BodyLayout::Children),
            PageType::ColRle => Some(BodyLayout::Runs),
            PageType::ColVar
            | PageType::DupInt
            | PageType::DupLeaf
            | PageType::RowInt
            | PageType::RowLeaf => Some(BodyLayout::Items),
            PageType::Ovfl => Some(BodyLayout::Raw),
            PageType::Freelist => Some(BodyLayout::Extents),
        }
    }

    /// Returns true for internal pages of any tree.
    pub fn is_internal(&self) -> bool {
        matches!(self, PageType::ColInt | PageType::DupInt | PageType::RowInt)
    }

    /// Returns true for leaf pages of any tree.
    pub fn is_leaf(&self) -> bool {
        matches!(
            self,
            PageType::ColFix
                | PageType::ColRle
                | PageType::ColVar
                | PageType::DupLeaf
                | PageType::RowLeaf
        )
    }

    /// Returns true for column store pages.
    pub fn is_column(&self) -> bool {
        matches!(
            self,
            PageType::ColFix | PageType::ColInt | PageType::ColRle | PageType::ColVar
        )
    }

    /// Returns true for pages addressed by key.
    pub fn is_row(&self) -> bool {
        matches!(
            self,
            PageType::RowInt | PageType::RowLeaf | PageType::DupInt | PageType::DupLeaf
        )
    }

    /// Returns true if the body width depends on the tree's fixed record length.
    pub fn needs_fixed_len(&self) -> bool {
        matches!(self, PageType::ColFix | PageType::ColRle)
    }
}

/// Header at the start of every on-disk page.
///
/// Layout (28 bytes, little-endian):
/// ```text
/// offset  size  field
///      0     8  start_recno   first record number (column store)
///      8     4  lsn.file
///     12     4  lsn.offset
///     16     4  checksum      crc32 of the page with this field zeroed
///     20     4  entries       item count, or data length on overflow pages
///     24     1  page_type
///     25     1  level         leaf = 1, 0 outside the tree
///     26     2  unused
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub start_recno: u64,
    pub lsn: Lsn,
    pub checksum: u32,
    /// Entry count, or payload length on overflow pages.
    pub entries: u32,
    pub page_type: PageType,
    pub level: u8,
}

impl PageHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 28;

    /// Offset of the checksum field.
    pub const CHECKSUM_OFFSET: usize = 16;

    /// Creates a header for a page of the given type and level.
    pub fn new(page_type: PageType, level: u8) -> Self {
        Self {
            start_recno: 0,
            lsn: Lsn::default(),
            checksum: 0,
            entries: 0,
            page_type,
            level,
        }
    }

    /// Sets the first record number.
    pub fn with_start_recno(mut self, recno: u64) -> Self {
        self.start_recno = recno;
        self
    }

    /// Sets the LSN.
    pub fn with_lsn(mut self, lsn: Lsn) -> Self {
        self.lsn = lsn;
        self
    }

    /// Payload length on overflow pages.
    #[inline]
    pub fn datalen(&self) -> u32 {
        self.entries
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.start_recno.to_le_bytes());
        buf[8..12].copy_from_slice(&self.lsn.file.to_le_bytes());
        buf[12..16].copy_from_slice(&self.lsn.offset.to_le_bytes());
        buf[16..20].copy_from_slice(&self.checksum.to_le_bytes());
        buf[20..24].copy_from_slice(&self.entries.to_le_bytes());
        buf[24] = self.page_type as u8;
        buf[25] = self.level;
        buf
    }

    /// Deserializes the header. Returns `None` if the page type is unknown.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let start_recno = u64::from_le_bytes([
            buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
        ]);
        Some(Self {
            start_recno,
            lsn: Lsn::new(u32_at(8), u32_at(12)),
            checksum: u32_at(16),
            entries: u32_at(20),
            page_type: PageType::from_u8(buf[24])?,
            level: buf[25],
        })
    }
}
