//! Cambium common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all Cambium components.

pub mod addr;
pub mod config;
pub mod error;
pub mod ext;

pub use addr::{Address, AllocationUnit, Lsn, ALLOCATION_SIZE_MAX, ALLOCATION_SIZE_MIN, PAGE_SIZE_MAX};
pub use config::{BtreeConfig, CacheConfig, StoreKind};
pub use error::{CambiumError, Result};
pub use ext::{
    BytewiseCollator, Collaborators, Collator, Extension, IdentityTransform, KeyTransform,
    TracingExtension,
};
