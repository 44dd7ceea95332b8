//! The 512-byte page descriptor at the start of every file.

use cambium_common::{Address, BtreeConfig, CambiumError, Result};

/// Descriptor size on disk.
pub const DESCRIPTOR_SIZE: usize = 512;

/// Magic number identifying a file.
pub const DESCRIPTOR_MAGIC: u32 = 120_897;

/// Current major version.
pub const DESCRIPTOR_MAJOR: u16 = 0;

/// Current minor version.
pub const DESCRIPTOR_MINOR: u16 = 1;

/// Flag: fixed-length column pages are run-length encoded.
pub const DESCRIPTOR_FLAG_RLE: u32 = 0x01;

/// File-level metadata.
///
/// Layout (512 bytes, little-endian):
/// ```text
/// offset  size  field
///      0     4  magic
///      4     2  major version
///      6     2  minor version
///      8     4  internal page max
///     12     4  internal page min
///     16     4  leaf page max
///     20     4  leaf page min
///     24     8  first record number
///     32     4  root address
///     36     4  root size
///     40     8  record count
///     48     4  free-list address
///     52     4  free-list size
///     56     4  flags
///     60     1  fixed record length
///     61   451  unused (zero)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDescriptor {
    pub magic: u32,
    pub major: u16,
    pub minor: u16,
    pub intlmax: u32,
    pub intlmin: u32,
    pub leafmax: u32,
    pub leafmin: u32,
    pub recno_offset: u64,
    pub root_addr: Address,
    pub root_size: u32,
    pub records: u64,
    pub free_addr: Address,
    pub free_size: u32,
    pub flags: u32,
    pub fixed_len: u8,
}

impl PageDescriptor {
    /// Creates the descriptor of a new, empty file.
    pub fn new(config: &BtreeConfig) -> Self {
        Self {
            magic: DESCRIPTOR_MAGIC,
            major: DESCRIPTOR_MAJOR,
            minor: DESCRIPTOR_MINOR,
            intlmax: config.internal_page_max,
            intlmin: config.internal_page_min,
            leafmax: config.leaf_page_max,
            leafmin: config.leaf_page_min,
            recno_offset: config.recno_offset,
            root_addr: Address::INVALID,
            root_size: 0,
            records: 0,
            free_addr: Address::INVALID,
            free_size: 0,
            flags: if config.run_length_encoding {
                DESCRIPTOR_FLAG_RLE
            } else {
                0
            },
            fixed_len: config.fixed_len,
        }
    }

    /// Returns true if fixed-length pages are run-length encoded.
    pub fn is_rle(&self) -> bool {
        self.flags & DESCRIPTOR_FLAG_RLE != 0
    }

    /// Overrides the geometry of `config` with the values recorded in the file.
    pub fn apply_to(&self, config: &mut BtreeConfig) {
        config.internal_page_max = self.intlmax;
        config.internal_page_min = self.intlmin;
        config.leaf_page_max = self.leafmax;
        config.leaf_page_min = self.leafmin;
        config.recno_offset = self.recno_offset;
        config.fixed_len = self.fixed_len;
        config.run_length_encoding = self.is_rle();
    }

    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut buf = [0u8; DESCRIPTOR_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..6].copy_from_slice(&self.major.to_le_bytes());
        buf[6..8].copy_from_slice(&self.minor.to_le_bytes());
        buf[8..12].copy_from_slice(&self.intlmax.to_le_bytes());
        buf[12..16].copy_from_slice(&self.intlmin.to_le_bytes());
        buf[16..20].copy_from_slice(&self.leafmax.to_le_bytes());
        buf[20..24].copy_from_slice(&self.leafmin.to_le_bytes());
        buf[24..32].copy_from_slice(&self.recno_offset.to_le_bytes());
        buf[32..36].copy_from_slice(&self.root_addr.0.to_le_bytes());
        buf[36..40].copy_from_slice(&self.root_size.to_le_bytes());
        buf[40..48].copy_from_slice(&self.records.to_le_bytes());
        buf[48..52].copy_from_slice(&self.free_addr.0.to_le_bytes());
        buf[52..56].copy_from_slice(&self.free_size.to_le_bytes());
        buf[56..60].copy_from_slice(&self.flags.to_le_bytes());
        buf[60] = self.fixed_len;
        buf
    }

    /// Deserializes and validates a descriptor.
    ///
    /// A short buffer, a bad magic number or a version newer than this
    /// software are format errors.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < DESCRIPTOR_SIZE {
            return Err(CambiumError::Format(format!(
                "descriptor is {} bytes, expected {}",
                buf.len(),
                DESCRIPTOR_SIZE
            )));
        }
        let u16_at = |at: usize| u16::from_le_bytes([buf[at], buf[at + 1]]);
        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(b)
        };

        let magic = u32_at(0);
        if magic != DESCRIPTOR_MAGIC {
            return Err(CambiumError::Format(format!(
                "bad magic number {}, expected {}",
                magic, DESCRIPTOR_MAGIC
            )));
        }
        let (major, minor) = (u16_at(4), u16_at(6));
        if major > DESCRIPTOR_MAJOR || (major == DESCRIPTOR_MAJOR && minor > DESCRIPTOR_MINOR) {
            return Err(CambiumError::Format(format!(
                "unsupported version {}.{}, this build reads up to {}.{}",
                major, minor, DESCRIPTOR_MAJOR, DESCRIPTOR_MINOR
            )));
        }

        Ok(Self {
            magic,
            major,
            minor,
            intlmax: u32_at(8),
            intlmin: u32_at(12),
            leafmax: u32_at(16),
            leafmin: u32_at(20),
            recno_offset: u64_at(24),
            root_addr: Address(u32_at(32)),
            root_size: u32_at(36),
            records: u64_at(40),
            free_addr: Address(u32_at(48)),
            free_size: u32_at(52),
            flags: u32_at(56),
            fixed_len: buf[60],
        })
    }
}
