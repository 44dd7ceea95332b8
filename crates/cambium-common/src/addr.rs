//! File addresses, allocation units and log sequence numbers.
//!
//! Every location stored on a page is a count of allocation units from the
//! start of the file, not a byte offset. Converting between the two requires
//! the allocation unit negotiated when the file was created.

use crate::error::{CambiumError, Result};
use serde::{Deserialize, Serialize};

/// Smallest allocation unit (512 B).
pub const ALLOCATION_SIZE_MIN: u32 = 512;

/// Largest allocation unit (128 MB).
pub const ALLOCATION_SIZE_MAX: u32 = 128 * 1024 * 1024;

/// Largest page the software will read or write (256 MB).
pub const PAGE_SIZE_MAX: u32 = 256 * 1024 * 1024;

/// A location in the file, counted in allocation units.
///
/// Two values at the top of the range are reserved: [`Address::INVALID`]
/// marks a page that does not exist and [`Address::DELETED`] marks a page
/// whose space has been reclaimed. Neither may be dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub u32);

impl Address {
    /// No page.
    pub const INVALID: Address = Address(u32::MAX);

    /// Page space reclaimed.
    pub const DELETED: Address = Address(u32::MAX - 1);

    /// Returns true if this address names real file space.
    #[inline]
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID && *self != Self::DELETED
    }

    /// Returns the raw allocation-unit count.
    #[inline]
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::INVALID => write!(f, "addr:invalid"),
            Self::DELETED => write!(f, "addr:deleted"),
            Self(a) => write!(f, "addr:{}", a),
        }
    }
}

/// The allocation unit of a file.
///
/// A power of two between 512 B and 128 MB. Page sizes are always a multiple
/// of the allocation unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationUnit(u32);

impl AllocationUnit {
    /// Creates an allocation unit, validating its size.
    pub fn new(size: u32) -> Result<Self> {
        if !(ALLOCATION_SIZE_MIN..=ALLOCATION_SIZE_MAX).contains(&size) || !size.is_power_of_two() {
            return Err(CambiumError::Config(format!(
                "allocation size {} must be a power of two between {} and {}",
                size, ALLOCATION_SIZE_MIN, ALLOCATION_SIZE_MAX
            )));
        }
        Ok(Self(size))
    }

    /// Returns the unit size in bytes.
    #[inline]
    pub fn size(&self) -> u32 {
        self.0
    }

    /// Converts an address to a byte offset.
    pub fn to_offset(&self, addr: Address) -> Result<u64> {
        if !addr.is_valid() {
            return Err(CambiumError::InvalidAddress(addr.0));
        }
        Ok(addr.0 as u64 * self.0 as u64)
    }

    /// Converts a byte offset to an address.
    ///
    /// The offset must be an exact multiple of the unit and must not land on
    /// one of the reserved sentinel addresses.
    pub fn to_addr(&self, offset: u64) -> Result<Address> {
        if offset % self.0 as u64 != 0 {
            return Err(CambiumError::Format(format!(
                "offset {} is not aligned to allocation unit {}",
                offset, self.0
            )));
        }
        let units = offset / self.0 as u64;
        if units >= Address::DELETED.0 as u64 {
            return Err(CambiumError::Format(format!(
                "offset {} exceeds the maximum file size {}",
                offset,
                self.max_file_size()
            )));
        }
        Ok(Address(units as u32))
    }

    /// Rounds a byte length up to a whole number of units.
    #[inline]
    pub fn align(&self, len: usize) -> usize {
        let unit = self.0 as usize;
        len.div_ceil(unit) * unit
    }

    /// Bytes needed to store `len` payload bytes behind a page header,
    /// rounded up to whole units.
    #[inline]
    pub fn bytes_to_alloc(&self, len: usize, header: usize) -> usize {
        self.align(len + header)
    }

    /// Largest addressable file size in bytes.
    pub fn max_file_size(&self) -> u64 {
        self.0 as u64 * (u32::MAX as u64 - 1)
    }
}

impl Default for AllocationUnit {
    fn default() -> Self {
        Self(ALLOCATION_SIZE_MIN)
    }
}

/// Log sequence number recorded on every page: the log file and the byte
/// offset of the write that produced this page version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Lsn {
    /// Log file identifier.
    pub file: u32,
    /// Offset within the log file.
    pub offset: u32,
}

impl Lsn {
    /// Creates a new LSN.
    pub fn new(file: u32, offset: u32) -> Self {
        Self { file, offset }
    }

    /// Returns the LSN packed as a single u64.
    pub fn as_u64(&self) -> u64 {
        ((self.file as u64) << 32) | (self.offset as u64)
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.file, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels() {
        assert_eq!(Address::INVALID.0, u32::MAX);
        assert_eq!(Address::DELETED.0, u32::MAX - 1);
        assert!(!Address::INVALID.is_valid());
        assert!(!Address::DELETED.is_valid());
        assert!(Address(0).is_valid());
        assert!(Address(u32::MAX - 2).is_valid());
    }

    #[test]
    fn test_allocation_unit_bounds() {
        assert!(AllocationUnit::new(512).is_ok());
        assert!(AllocationUnit::new(4096).is_ok());
        assert!(AllocationUnit::new(ALLOCATION_SIZE_MAX).is_ok());

        assert!(AllocationUnit::new(256).is_err());
        assert!(AllocationUnit::new(ALLOCATION_SIZE_MAX * 2).is_err());
        assert!(AllocationUnit::new(1000).is_err());
    }

    #[test]
    fn test_to_offset() {
        let unit = AllocationUnit::new(512).unwrap();
        assert_eq!(unit.to_offset(Address(0)).unwrap(), 0);
        assert_eq!(unit.to_offset(Address(3)).unwrap(), 1536);
        assert_eq!(
            unit.to_offset(Address(u32::MAX - 2)).unwrap(),
            (u32::MAX as u64 - 2) * 512
        );
    }

    #[test]
    fn test_to_offset_rejects_sentinels() {
        let unit = AllocationUnit::default();
        assert!(matches!(
            unit.to_offset(Address::INVALID),
            Err(CambiumError::InvalidAddress(_))
        ));
        assert!(matches!(
            unit.to_offset(Address::DELETED),
            Err(CambiumError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_to_addr_requires_alignment() {
        let unit = AllocationUnit::new(4096).unwrap();
        assert_eq!(unit.to_addr(8192).unwrap(), Address(2));
        assert!(matches!(unit.to_addr(8193), Err(CambiumError::Format(_))));
        assert!(matches!(unit.to_addr(100), Err(CambiumError::Format(_))));
    }

    #[test]
    fn test_to_addr_rejects_sentinel_range() {
        let unit = AllocationUnit::default();
        let deleted = (u32::MAX as u64 - 1) * 512;
        assert!(unit.to_addr(deleted).is_err());
        assert!(unit.to_addr(deleted - 512).is_ok());
    }

    #[test]
    fn test_address_bijection() {
        for size in [512u32, 4096, 65536, ALLOCATION_SIZE_MAX] {
            let unit = AllocationUnit::new(size).unwrap();
            for a in [0u32, 1, 2, 1000, 123_456_789, u32::MAX - 2] {
                let off = unit.to_offset(Address(a)).unwrap();
                assert_eq!(unit.to_addr(off).unwrap(), Address(a));
            }
        }
    }

    #[test]
    fn test_align_and_bytes_to_alloc() {
        let unit = AllocationUnit::new(512).unwrap();
        assert_eq!(unit.align(0), 0);
        assert_eq!(unit.align(1), 512);
        assert_eq!(unit.align(512), 512);
        assert_eq!(unit.align(513), 1024);
        assert_eq!(unit.bytes_to_alloc(100, 28), 512);
        assert_eq!(unit.bytes_to_alloc(490, 28), 1024);
    }

    #[test]
    fn test_max_file_size() {
        let unit = AllocationUnit::new(512).unwrap();
        assert_eq!(unit.max_file_size(), 512 * (u32::MAX as u64 - 1));
    }

    #[test]
    fn test_lsn() {
        let lsn = Lsn::new(3, 4096);
        assert_eq!(lsn.as_u64(), (3u64 << 32) | 4096);
        assert_eq!(lsn.to_string(), "3/4096");
        assert!(Lsn::new(1, 10) < Lsn::new(2, 0));
    }

    #[test]
    fn test_address_display() {
        assert_eq!(Address(7).to_string(), "addr:7");
        assert_eq!(Address::INVALID.to_string(), "addr:invalid");
        assert_eq!(Address::DELETED.to_string(), "addr:deleted");
    }
}
