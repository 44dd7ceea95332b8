//! On-disk storage format for Cambium.
//!
//! This crate provides:
//! - Item stream codec (tagged, 4-byte aligned variable-length items)
//! - Page header, typed page bodies and the whole-page codec with checksums
//! - The 512-byte file descriptor
//! - Overflow pages for items too large to inline
//! - Block managers for file and in-memory storage

mod block;
mod body;
pub mod codec;
mod desc;
mod item;
mod page;
pub mod overflow;

pub use block::{BlockManager, FileBlockManager, FileBlockManagerConfig, MemBlockManager};
pub use body::{fixed_deleted_record, is_fixed_deleted, item_allowed, PageBody, RleRun, FIXED_DELETED};
pub use codec::{decode, encode, page_checksum, DiskPage, PageGeometry};
pub use desc::{
    PageDescriptor, DESCRIPTOR_FLAG_RLE, DESCRIPTOR_MAGIC, DESCRIPTOR_MAJOR, DESCRIPTOR_MINOR,
    DESCRIPTOR_SIZE,
};
pub use item::{
    decode_item, encode_item, item_space, Item, ItemCursor, ItemType, OffRecord, OffRef, OvflRef,
    ITEM_HEADER_SIZE, ITEM_MAX_LEN,
};
pub use page::{BodyLayout, PageHeader, PageType, LEVEL_LEAF, LEVEL_NONE};
