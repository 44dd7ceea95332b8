//! Block managers: the file I/O boundary.
//!
//! Blocks are never overwritten in place. Every write lands at a fresh
//! address taken from the free list (first fit) or from the end of the file;
//! the caller frees the previous location once nothing refers to it. The
//! first allocation unit(s) covering [`DESCRIPTOR_SIZE`] bytes are reserved
//! for the descriptor.

use crate::desc::DESCRIPTOR_SIZE;
use crate::item::OffRef;
use bytes::Bytes;
use cambium_common::{Address, AllocationUnit, CambiumError, Result, PAGE_SIZE_MAX};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Reads, writes and frees page-sized blocks of a single file.
pub trait BlockManager: Send + Sync {
    /// Allocation unit of the file.
    fn allocation_unit(&self) -> AllocationUnit;

    /// Reads `size` bytes at `addr`.
    fn read(&self, addr: Address, size: u32) -> Result<Bytes>;

    /// Writes an image at a fresh location, reusing freed space first.
    fn write(&self, image: &[u8]) -> Result<(Address, u32)>;

    /// Writes an image past the end of the file, leaving the free list
    /// untouched.
    fn append(&self, image: &[u8]) -> Result<(Address, u32)>;

    /// Returns a block to the free list.
    fn free(&self, addr: Address, size: u32) -> Result<()>;

    /// Reads the descriptor bytes.
    fn read_descriptor(&self) -> Result<Bytes>;

    /// Writes the descriptor bytes.
    fn write_descriptor(&self, image: &[u8; DESCRIPTOR_SIZE]) -> Result<()>;

    /// Snapshot of the free list.
    fn free_extents(&self) -> Vec<OffRef>;

    /// Replaces the free list, typically with one loaded from a free-list page.
    fn load_free_extents(&self, extents: &[OffRef]);

    /// Forces written data to stable storage.
    fn sync(&self) -> Result<()>;
}

/// First address available for pages.
fn first_page_addr(unit: AllocationUnit) -> u32 {
    (unit.align(DESCRIPTOR_SIZE) / unit.size() as usize) as u32
}

fn check_image(unit: AllocationUnit, image: &[u8]) -> Result<u32> {
    if image.is_empty() || image.len() % unit.size() as usize != 0 {
        return Err(CambiumError::Internal(format!(
            "block of {} bytes is not a whole number of {} byte units",
            image.len(),
            unit.size()
        )));
    }
    Ok((image.len() / unit.size() as usize) as u32)
}

/// Rejects a read that no write could have produced: a size that is not a
/// whole page, or a block running past the end of the file.
fn check_extent(unit: AllocationUnit, addr: Address, size: u32, end: u32) -> Result<()> {
    if size == 0 || size % unit.size() != 0 || size > PAGE_SIZE_MAX {
        return Err(CambiumError::corruption(
            addr.0,
            format!("block size {} is not a valid page size", size),
        ));
    }
    let units = size / unit.size();
    if addr.0.checked_add(units).map_or(true, |last| last > end) {
        return Err(CambiumError::corruption(
            addr.0,
            format!("block of {} units runs past the end of the file", units),
        ));
    }
    Ok(())
}

/// Free space tracked as sorted, coalesced extents in allocation units.
#[derive(Debug, Default)]
struct FreeList {
    /// (address, units), sorted by address.
    extents: Vec<(u32, u32)>,
}

impl FreeList {
    /// Takes `units` from the first extent large enough.
    fn allocate(&mut self, units: u32) -> Option<u32> {
        let idx = self.extents.iter().position(|&(_, len)| len >= units)?;
        let (addr, len) = self.extents[idx];
        if len == units {
            self.extents.remove(idx);
        } else {
            self.extents[idx] = (addr + units, len - units);
        }
        Some(addr)
    }

    /// Returns space, merging with adjacent extents.
    fn release(&mut self, addr: u32, units: u32) -> Result<()> {
        let idx = self.extents.partition_point(|&(a, _)| a < addr);
        let overlaps_prev = idx > 0 && {
            let (a, l) = self.extents[idx - 1];
            a + l > addr
        };
        let overlaps_next = idx < self.extents.len() && addr + units > self.extents[idx].0;
        if overlaps_prev || overlaps_next {
            return Err(CambiumError::Internal(format!(
                "double free of {} units at address {}",
                units, addr
            )));
        }

        self.extents.insert(idx, (addr, units));
        if idx + 1 < self.extents.len() {
            let (a, l) = self.extents[idx];
            if a + l == self.extents[idx + 1].0 {
                self.extents[idx].1 += self.extents[idx + 1].1;
                self.extents.remove(idx + 1);
            }
        }
        if idx > 0 {
            let (a, l) = self.extents[idx - 1];
            if a + l == self.extents[idx].0 {
                self.extents[idx - 1].1 += self.extents[idx].1;
                self.extents.remove(idx);
            }
        }
        Ok(())
    }

    fn snapshot(&self, unit: AllocationUnit) -> Vec<OffRef> {
        self.extents
            .iter()
            .map(|&(a, l)| OffRef::new(Address(a), l * unit.size()))
            .collect()
    }

    fn load(&mut self, unit: AllocationUnit, extents: &[OffRef]) {
        self.extents.clear();
        for e in extents {
            let units = e.size / unit.size();
            if e.addr.is_valid() && units > 0 && self.release(e.addr.0, units).is_err() {
                tracing::warn!(addr = %e.addr, size = e.size, "overlapping free-list extent ignored");
            }
        }
    }
}

/// Configuration for a file-backed block manager.
#[derive(Debug, Clone)]
pub struct FileBlockManagerConfig {
    /// Path of the data file.
    pub path: PathBuf,
    /// Allocation unit.
    pub allocation_unit: AllocationUnit,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl FileBlockManagerConfig {
    pub fn new(path: impl Into<PathBuf>, allocation_unit: AllocationUnit) -> Self {
        Self {
            path: path.into(),
            allocation_unit,
            fsync_enabled: true,
        }
    }
}

/// State behind the file lock.
struct FileState {
    file: File,
    /// First address past the end of the file.
    next_addr: u32,
    free: FreeList,
}

/// Block manager over a single data file.
pub struct FileBlockManager {
    config: FileBlockManagerConfig,
    state: Mutex<FileState>,
    created: bool,
}

impl FileBlockManager {
    /// Opens the data file, creating it if it does not exist.
    pub fn open(config: FileBlockManagerConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&config.path)?;

        let unit = config.allocation_unit;
        let len = file.metadata()?.len();
        let units = len.div_ceil(unit.size() as u64);
        let next_addr = u32::try_from(units)
            .map_err(|_| CambiumError::Format(format!("file of {} bytes is too large", len)))?
            .max(first_page_addr(unit));

        tracing::debug!(path = %config.path.display(), len, next_addr, "opened block file");
        Ok(Self {
            created: len == 0,
            config,
            state: Mutex::new(FileState {
                file,
                next_addr,
                free: FreeList::default(),
            }),
        })
    }

    /// Returns the data file path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Returns true if the file was empty when opened.
    pub fn is_new(&self) -> bool {
        self.created
    }

    fn write_at(&self, state: &mut FileState, addr: u32, image: &[u8]) -> Result<()> {
        let offset = self.config.allocation_unit.to_offset(Address(addr))?;
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.write_all(image)?;
        if self.config.fsync_enabled {
            state.file.sync_data()?;
        }
        Ok(())
    }

    fn extend(state: &mut FileState, units: u32) -> Result<u32> {
        let addr = state.next_addr;
        state.next_addr = addr
            .checked_add(units)
            .filter(|end| *end < Address::DELETED.0)
            .ok_or_else(|| CambiumError::Size {
                what: "file",
                size: addr as usize + units as usize,
                max: Address::DELETED.0 as usize,
            })?;
        Ok(addr)
    }
}

impl BlockManager for FileBlockManager {
    fn allocation_unit(&self) -> AllocationUnit {
        self.config.allocation_unit
    }

    fn read(&self, addr: Address, size: u32) -> Result<Bytes> {
        let unit = self.config.allocation_unit;
        let offset = unit.to_offset(addr)?;
        let mut state = self.state.lock();
        check_extent(unit, addr, size, state.next_addr)?;
        state.file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; size as usize];
        state.file.read_exact(&mut buffer)?;
        Ok(Bytes::from(buffer))
    }

    fn write(&self, image: &[u8]) -> Result<(Address, u32)> {
        let units = check_image(self.config.allocation_unit, image)?;
        let mut state = self.state.lock();
        let addr = match state.free.allocate(units) {
            Some(addr) => addr,
            None => Self::extend(&mut state, units)?,
        };
        self.write_at(&mut state, addr, image)?;
        Ok((Address(addr), image.len() as u32))
    }

    fn append(&self, image: &[u8]) -> Result<(Address, u32)> {
        let units = check_image(self.config.allocation_unit, image)?;
        let mut state = self.state.lock();
        let addr = Self::extend(&mut state, units)?;
        self.write_at(&mut state, addr, image)?;
        Ok((Address(addr), image.len() as u32))
    }

    fn free(&self, addr: Address, size: u32) -> Result<()> {
        if !addr.is_valid() || addr.0 < first_page_addr(self.config.allocation_unit) {
            return Err(CambiumError::InvalidAddress(addr.0));
        }
        let units = size / self.config.allocation_unit.size();
        self.state.lock().free.release(addr.0, units)
    }

    fn read_descriptor(&self) -> Result<Bytes> {
        let mut state = self.state.lock();
        state.file.seek(SeekFrom::Start(0))?;
        let mut buffer = vec![0u8; DESCRIPTOR_SIZE];
        state.file.read_exact(&mut buffer)?;
        Ok(Bytes::from(buffer))
    }

    fn write_descriptor(&self, image: &[u8; DESCRIPTOR_SIZE]) -> Result<()> {
        let mut state = self.state.lock();
        self.write_at(&mut state, 0, image)
    }

    fn free_extents(&self) -> Vec<OffRef> {
        self.state.lock().free.snapshot(self.config.allocation_unit)
    }

    fn load_free_extents(&self, extents: &[OffRef]) {
        self.state
            .lock()
            .free
            .load(self.config.allocation_unit, extents);
    }

    fn sync(&self) -> Result<()> {
        self.state.lock().file.sync_all()?;
        Ok(())
    }
}

impl Drop for FileBlockManager {
    fn drop(&mut self) {
        if let Err(e) = self.state.lock().file.sync_all() {
            tracing::warn!(path = %self.config.path.display(), error = %e, "final sync failed");
        }
    }
}

/// State behind the in-memory lock.
#[derive(Default)]
struct MemState {
    blocks: HashMap<u32, Bytes>,
    descriptor: Option<Bytes>,
    next_addr: u32,
    free: FreeList,
}

/// Block manager held entirely in memory.
pub struct MemBlockManager {
    unit: AllocationUnit,
    state: Mutex<MemState>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemBlockManager {
    pub fn new(unit: AllocationUnit) -> Self {
        Self {
            unit,
            state: Mutex::new(MemState {
                next_addr: first_page_addr(unit),
                ..MemState::default()
            }),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of block reads served.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of block writes accepted.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of live blocks.
    pub fn block_count(&self) -> usize {
        self.state.lock().blocks.len()
    }

    /// Overwrites a stored block in place. Used to simulate media corruption.
    pub fn corrupt(&self, addr: Address, offset: usize, xor: u8) -> Result<()> {
        let mut state = self.state.lock();
        let block = state
            .blocks
            .get_mut(&addr.0)
            .ok_or(CambiumError::InvalidAddress(addr.0))?;
        let mut bytes = block.to_vec();
        if let Some(b) = bytes.get_mut(offset) {
            *b ^= xor;
        }
        *block = Bytes::from(bytes);
        Ok(())
    }

    fn store(&self, state: &mut MemState, addr: u32, image: &[u8]) {
        state.blocks.insert(addr, Bytes::copy_from_slice(image));
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

impl BlockManager for MemBlockManager {
    fn allocation_unit(&self) -> AllocationUnit {
        self.unit
    }

    fn read(&self, addr: Address, size: u32) -> Result<Bytes> {
        if !addr.is_valid() {
            return Err(CambiumError::InvalidAddress(addr.0));
        }
        let state = self.state.lock();
        let block = state
            .blocks
            .get(&addr.0)
            .ok_or(CambiumError::InvalidAddress(addr.0))?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(block.slice(..(size as usize).min(block.len())))
    }

    fn write(&self, image: &[u8]) -> Result<(Address, u32)> {
        let units = check_image(self.unit, image)?;
        let mut state = self.state.lock();
        let addr = match state.free.allocate(units) {
            Some(addr) => addr,
            None => {
                let addr = state.next_addr;
                state.next_addr += units;
                addr
            }
        };
        self.store(&mut state, addr, image);
        Ok((Address(addr), image.len() as u32))
    }

    fn append(&self, image: &[u8]) -> Result<(Address, u32)> {
        let units = check_image(self.unit, image)?;
        let mut state = self.state.lock();
        let addr = state.next_addr;
        state.next_addr += units;
        self.store(&mut state, addr, image);
        Ok((Address(addr), image.len() as u32))
    }

    fn free(&self, addr: Address, size: u32) -> Result<()> {
        let mut state = self.state.lock();
        if state.blocks.remove(&addr.0).is_none() {
            return Err(CambiumError::InvalidAddress(addr.0));
        }
        state.free.release(addr.0, size / self.unit.size())
    }

    fn read_descriptor(&self) -> Result<Bytes> {
        self.state.lock().descriptor.clone().ok_or_else(|| {
            CambiumError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "no descriptor written",
            ))
        })
    }

    fn write_descriptor(&self, image: &[u8; DESCRIPTOR_SIZE]) -> Result<()> {
        self.state.lock().descriptor = Some(Bytes::copy_from_slice(image));
        Ok(())
    }

    fn free_extents(&self) -> Vec<OffRef> {
        self.state.lock().free.snapshot(self.unit)
    }

    fn load_free_extents(&self, extents: &[OffRef]) {
        self.state.lock().free.load(self.unit, extents);
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
