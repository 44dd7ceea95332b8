//! Configuration structures for Cambium.

use crate::addr::{AllocationUnit, ALLOCATION_SIZE_MIN, PAGE_SIZE_MAX};
use crate::error::{CambiumError, Result};
use crate::ext::Extension;
use serde::{Deserialize, Serialize};
use sysinfo::System;

/// How records are organized in a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StoreKind {
    /// Key/value pairs sorted by key.
    #[default]
    Row,
    /// Variable-length records addressed by record number.
    ColumnVariable,
    /// Fixed-length records addressed by record number.
    ColumnFixed,
}

/// Geometry and layout configuration of a single tree file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BtreeConfig {
    /// Allocation unit in bytes.
    pub allocation_size: u32,
    /// Minimum internal page size in bytes.
    pub internal_page_min: u32,
    /// Maximum internal page size in bytes.
    pub internal_page_max: u32,
    /// Minimum leaf page size in bytes.
    pub leaf_page_min: u32,
    /// Maximum leaf page size in bytes.
    pub leaf_page_max: u32,
    /// Largest page image accepted by the page decoder.
    pub page_size_max: u32,
    /// Record layout.
    pub store: StoreKind,
    /// Fixed record length for fixed-length column stores (0 otherwise).
    pub fixed_len: u8,
    /// Run-length encode fixed-length column stores.
    pub run_length_encoding: bool,
    /// Items longer than this are written to overflow pages.
    pub overflow_threshold: u32,
    /// Record number of the first record in a column store.
    pub recno_offset: u64,
}

impl Default for BtreeConfig {
    fn default() -> Self {
        Self {
            allocation_size: ALLOCATION_SIZE_MIN,
            internal_page_min: 2 * 1024,
            internal_page_max: 2 * 1024,
            leaf_page_min: 32 * 1024,
            leaf_page_max: 1024 * 1024,
            page_size_max: PAGE_SIZE_MAX,
            store: StoreKind::Row,
            fixed_len: 0,
            run_length_encoding: false,
            overflow_threshold: 4 * 1024,
            recno_offset: 1,
        }
    }
}

impl BtreeConfig {
    /// Returns the validated allocation unit.
    pub fn allocation_unit(&self) -> Result<AllocationUnit> {
        AllocationUnit::new(self.allocation_size)
    }

    /// Checks the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        let unit = self.allocation_unit()?;
        let sizes = [
            ("internal_page_min", self.internal_page_min),
            ("internal_page_max", self.internal_page_max),
            ("leaf_page_min", self.leaf_page_min),
            ("leaf_page_max", self.leaf_page_max),
            ("page_size_max", self.page_size_max),
        ];
        for (name, size) in sizes {
            if size < unit.size() || size % unit.size() != 0 {
                return Err(CambiumError::Config(format!(
                    "{} ({}) must be a multiple of the allocation size ({})",
                    name,
                    size,
                    unit.size()
                )));
            }
            if size > PAGE_SIZE_MAX {
                return Err(CambiumError::Config(format!(
                    "{} ({}) exceeds the maximum page size ({})",
                    name, size, PAGE_SIZE_MAX
                )));
            }
        }
        if self.internal_page_min > self.internal_page_max {
            return Err(CambiumError::Config(
                "internal_page_min is larger than internal_page_max".to_string(),
            ));
        }
        if self.leaf_page_min > self.leaf_page_max {
            return Err(CambiumError::Config(
                "leaf_page_min is larger than leaf_page_max".to_string(),
            ));
        }
        match self.store {
            StoreKind::ColumnFixed if self.fixed_len == 0 => {
                return Err(CambiumError::Config(
                    "fixed-length column stores need a non-zero fixed_len".to_string(),
                ));
            }
            StoreKind::Row | StoreKind::ColumnVariable if self.fixed_len != 0 => {
                return Err(CambiumError::Config(
                    "fixed_len is only valid for fixed-length column stores".to_string(),
                ));
            }
            StoreKind::Row | StoreKind::ColumnVariable if self.run_length_encoding => {
                return Err(CambiumError::Config(
                    "run-length encoding is only valid for fixed-length column stores"
                        .to_string(),
                ));
            }
            _ => {}
        }
        if self.overflow_threshold == 0 {
            return Err(CambiumError::Config(
                "overflow_threshold must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds a configuration from defaults overridden by the values the
    /// extension layer supplies.
    pub fn from_extension(ext: &dyn Extension) -> Result<Self> {
        let mut config = Self::default();
        let lookup_u32 = |key: &str| -> Result<Option<u32>> {
            match ext.config_value(key) {
                Some(v) => v.trim().parse::<u32>().map(Some).map_err(|_| {
                    CambiumError::Config(format!("{} = {:?} is not a number", key, v))
                }),
                None => Ok(None),
            }
        };

        if let Some(v) = lookup_u32("allocation_size")? {
            config.allocation_size = v;
        }
        if let Some(v) = lookup_u32("internal_page_min")? {
            config.internal_page_min = v;
        }
        if let Some(v) = lookup_u32("internal_page_max")? {
            config.internal_page_max = v;
        }
        if let Some(v) = lookup_u32("leaf_page_min")? {
            config.leaf_page_min = v;
        }
        if let Some(v) = lookup_u32("leaf_page_max")? {
            config.leaf_page_max = v;
        }
        if let Some(v) = lookup_u32("overflow_threshold")? {
            config.overflow_threshold = v;
        }
        if let Some(v) = lookup_u32("fixed_len")? {
            config.fixed_len = u8::try_from(v).map_err(|_| {
                CambiumError::Config(format!("fixed_len = {} does not fit in a byte", v))
            })?;
        }
        if let Some(v) = ext.config_value("store") {
            config.store = match v.trim() {
                "row" => StoreKind::Row,
                "column-variable" => StoreKind::ColumnVariable,
                "column-fixed" => StoreKind::ColumnFixed,
                other => {
                    return Err(CambiumError::Config(format!("unknown store kind {:?}", other)));
                }
            };
        }
        if let Some(v) = ext.config_value("run_length_encoding") {
            config.run_length_encoding = matches!(v.trim(), "true" | "1" | "on");
        }

        config.validate()?;
        Ok(config)
    }
}

/// Configuration of the page cache and its reclaiming agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Bytes of decoded pages the cache tries to stay under.
    pub cache_size_bytes: u64,
    /// Maximum pages examined per eviction pass.
    pub eviction_batch: usize,
    /// Sleep between eviction passes, in milliseconds.
    pub eviction_interval_ms: u64,
    /// Maximum concurrent sessions (rows in the hazard table).
    pub max_sessions: usize,
    /// Hazard references each session may hold at once.
    pub hazard_slots_per_session: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_size_bytes: 64 * 1024 * 1024, // 64 MB
            eviction_batch: 32,
            eviction_interval_ms: 10,
            max_sessions: 64,
            hazard_slots_per_session: 16,
        }
    }
}

impl CacheConfig {
    /// Creates a cache configuration sized to 25% of available RAM.
    ///
    /// Minimum 1 MB so a tiny system still caches the upper tree levels.
    pub fn auto_sized() -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory();
        let cache_size_bytes = (available_bytes / 4).max(1024 * 1024);

        Self {
            cache_size_bytes,
            ..Self::default()
        }
    }

    /// Checks the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(CambiumError::Config("max_sessions must be non-zero".to_string()));
        }
        if self.hazard_slots_per_session == 0 {
            return Err(CambiumError::Config(
                "hazard_slots_per_session must be non-zero".to_string(),
            ));
        }
        if self.eviction_batch == 0 {
            return Err(CambiumError::Config("eviction_batch must be non-zero".to_string()));
        }
        Ok(())
    }
}
