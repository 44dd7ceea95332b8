//! Error types for Cambium.

use thiserror::Error;

/// Result type alias using CambiumError.
pub type Result<T> = std::result::Result<T, CambiumError>;

/// Errors that can occur in Cambium operations.
#[derive(Debug, Error)]
pub enum CambiumError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // File format errors
    #[error("Format error: {0}")]
    Format(String),

    #[error("Page corrupted at {addr}: {reason}")]
    Corruption { addr: u32, reason: String },

    #[error("{what} too large: {size} bytes (max {max})")]
    Size {
        what: &'static str,
        size: usize,
        max: usize,
    },

    #[error("Invalid address: {0}")]
    InvalidAddress(u32),

    // Page errors
    #[error("Invalid page type: {0}")]
    InvalidPageType(String),

    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    // Modification errors
    #[error("Stale page version: expected write generation {expected}, page is at {current}")]
    StaleVersion { expected: u32, current: u32 },

    #[error("Key not found")]
    KeyNotFound,

    // Cache errors
    #[error("Hazard table full: {slots} slots per session in use")]
    HazardTableFull { slots: usize },

    #[error("No free sessions: {max} in use")]
    SessionsExhausted { max: usize },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CambiumError {
    /// Address used in corruption reports about the page descriptor.
    pub const DESCRIPTOR_ADDR: u32 = 0;

    /// Returns true if the caller may re-search and retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CambiumError::StaleVersion { .. })
    }

    /// Returns true if the error makes the whole file unusable.
    ///
    /// Format errors are fatal to opening a file; corruption is fatal only
    /// when it hits the descriptor. Leaf corruption stays local to the page.
    pub fn is_fatal_to_file(&self) -> bool {
        match self {
            CambiumError::Format(_) => true,
            CambiumError::Corruption { addr, .. } => *addr == Self::DESCRIPTOR_ADDR,
            _ => false,
        }
    }

    /// Shorthand for a corruption report.
    pub fn corruption(addr: u32, reason: impl Into<String>) -> Self {
        CambiumError::Corruption {
            addr,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: CambiumError = io_err.into();
        assert!(matches!(err, CambiumError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_corruption_display() {
        let err = CambiumError::corruption(42, "checksum mismatch");
        assert_eq!(err.to_string(), "Page corrupted at 42: checksum mismatch");
    }

    #[test]
    fn test_size_display() {
        let err = CambiumError::Size {
            what: "item",
            size: 16 * 1024 * 1024,
            max: 16 * 1024 * 1024 - 1,
        };
        assert_eq!(
            err.to_string(),
            "item too large: 16777216 bytes (max 16777215)"
        );
    }

    #[test]
    fn test_stale_version_display() {
        let err = CambiumError::StaleVersion {
            expected: 3,
            current: 5,
        };
        assert_eq!(
            err.to_string(),
            "Stale page version: expected write generation 3, page is at 5"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(CambiumError::StaleVersion {
            expected: 0,
            current: 1
        }
        .is_retryable());
        assert!(!CambiumError::KeyNotFound.is_retryable());
        assert!(!CambiumError::corruption(9, "bad").is_retryable());
    }

    #[test]
    fn test_fatal_to_file() {
        assert!(CambiumError::Format("bad magic".to_string()).is_fatal_to_file());
        assert!(CambiumError::corruption(CambiumError::DESCRIPTOR_ADDR, "x").is_fatal_to_file());
        assert!(!CambiumError::corruption(17, "leaf").is_fatal_to_file());
        assert!(!CambiumError::Size {
            what: "page",
            size: 1,
            max: 0
        }
        .is_fatal_to_file());
    }

    #[test]
    fn test_cache_errors_display() {
        let err = CambiumError::HazardTableFull { slots: 8 };
        assert_eq!(err.to_string(), "Hazard table full: 8 slots per session in use");

        let err = CambiumError::SessionsExhausted { max: 4 };
        assert_eq!(err.to_string(), "No free sessions: 4 in use");
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CambiumError>();
    }
}
