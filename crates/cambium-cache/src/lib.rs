//! Page cache for Cambium.
//!
//! This crate provides:
//! - In-memory pages built from decoded images, with lazily materialized keys
//! - Modification overlays: replacement chains and run-length expansions
//! - Page references with hazard-protected, lock-free reads
//! - The tree handle: search, update, checkpoint and bulk load
//! - A background reclaiming agent

mod bulk;
mod evict;
mod hazard;
mod overlay;
mod page;
mod reference;
mod tree;

pub use bulk::BulkInput;
pub use evict::Evictor;
pub use hazard::{hazard_id, HazardTable, PageGuard, Session};
pub use overlay::{
    ExpansionList, ExpansionNode, Overlay, Update, UpdateChain, UpdateNode, WritePath, WriteTicket,
};
pub use page::{KeyCell, KeyItem, MemPage, PageIo, Position, Value, READ_GEN_PINNED};
pub use reference::{PageRef, RefState};
pub use tree::{Btree, EvictOutcome, SearchResult, TreeStats};
