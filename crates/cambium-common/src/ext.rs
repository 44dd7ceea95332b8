//! Capabilities supplied by the extension layer.
//!
//! The storage core reports diagnostics, borrows scratch memory and reads
//! configuration only through these traits. Key transforms and collation are
//! opaque here and are invoked only when a key is materialized or re-encoded.

use crate::error::Result;
use bytes::{Bytes, BytesMut};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Diagnostics, scratch memory and configuration lookup.
pub trait Extension: Send + Sync {
    /// Inserts a message into the error stream.
    fn error(&self, msg: &str);

    /// Inserts a message into the informational stream.
    fn message(&self, msg: &str);

    /// Allocates short-term scratch memory for a transient decode.
    fn scratch(&self, len: usize) -> BytesMut {
        BytesMut::zeroed(len)
    }

    /// Returns the value of a configuration key, if set.
    fn config_value(&self, key: &str) -> Option<String>;
}

/// Default extension: diagnostics go to `tracing`, configuration comes from
/// an in-memory map.
#[derive(Debug, Default, Clone)]
pub struct TracingExtension {
    config: HashMap<String, String>,
}

impl TracingExtension {
    /// Creates an extension with no configuration values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a configuration value.
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

impl Extension for TracingExtension {
    fn error(&self, msg: &str) {
        tracing::error!(target: "cambium", "{}", msg);
    }

    fn message(&self, msg: &str) {
        tracing::info!(target: "cambium", "{}", msg);
    }

    fn config_value(&self, key: &str) -> Option<String> {
        self.config.get(key).cloned()
    }
}

/// A reversible transform applied to keys (compression, Huffman coding).
///
/// `decode` runs when a key is materialized from its on-page form and
/// `encode` runs when a page is reconciled.
pub trait KeyTransform: Send + Sync {
    /// Converts an on-page key to its logical form.
    fn decode(&self, raw: &[u8]) -> Result<Bytes>;

    /// Converts a logical key to its on-page form.
    fn encode(&self, key: &[u8]) -> Result<Bytes>;

    /// Returns true if the transform leaves bytes untouched. Keys on pages
    /// without a real transform are used in place, without materialization.
    fn is_identity(&self) -> bool {
        false
    }
}

/// The transform that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransform;

impl KeyTransform for IdentityTransform {
    fn decode(&self, raw: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(raw))
    }

    fn encode(&self, key: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(key))
    }

    fn is_identity(&self) -> bool {
        true
    }
}

/// Orders row-store keys.
pub trait Collator: Send + Sync {
    /// Compares two logical keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Lexicographic byte order.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytewiseCollator;

impl Collator for BytewiseCollator {
    #[inline]
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// The full set of collaborators a tree is opened with.
#[derive(Clone)]
pub struct Collaborators {
    /// Receives error and informational messages and supplies configuration.
    pub extension: Arc<dyn Extension>,
    /// Decodes stored keys and encodes them for writing.
    pub transform: Arc<dyn KeyTransform>,
    /// Orders row keys.
    pub collator: Arc<dyn Collator>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            extension: Arc::new(TracingExtension::new()),
            transform: Arc::new(IdentityTransform),
            collator: Arc::new(BytewiseCollator),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("identity_transform", &self.transform.is_identity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_extension_config() {
        let ext = TracingExtension::new()
            .with_config("allocation_size", "4096")
            .with_config("leaf_page_max", "65536");
        assert_eq!(ext.config_value("allocation_size").as_deref(), Some("4096"));
        assert_eq!(ext.config_value("leaf_page_max").as_deref(), Some("65536"));
        assert!(ext.config_value("missing").is_none());
    }

    #[test]
    fn test_scratch_is_zeroed() {
        let ext = TracingExtension::new();
        let buf = ext.scratch(64);
        assert_eq!(buf.len(), 64);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_identity_transform() {
        let t = IdentityTransform;
        assert!(t.is_identity());
        assert_eq!(t.decode(b"abc").unwrap().as_ref(), b"abc");
        assert_eq!(t.encode(b"xyz").unwrap().as_ref(), b"xyz");
    }

    #[test]
    fn test_bytewise_collator() {
        let c = BytewiseCollator;
        assert_eq!(c.compare(b"apple", b"banana"), Ordering::Less);
        assert_eq!(c.compare(b"b", b"a"), Ordering::Greater);
        assert_eq!(c.compare(b"same", b"same"), Ordering::Equal);
        assert_eq!(c.compare(b"", b"a"), Ordering::Less);
    }

    #[test]
    fn test_default_collaborators() {
        let c = Collaborators::default();
        assert!(c.transform.is_identity());
        assert_eq!(c.collator.compare(b"a", b"b"), Ordering::Less);
    }
}
