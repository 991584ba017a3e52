//! Error handling for the register engine
//!
//! Two layers of errors exist:
//!
//! - [`TransactionError`] is what a Block records when a transaction fails
//!   (timeout, verify mismatch, or a failure reported by the transport). It is
//!   cheap to clone so a Block can keep it until the next check.
//! - [`RegError`] is the crate-wide error returned by fallible operations. A
//!   failed Block check surfaces as [`RegError::Transaction`].

use std::time::Duration;
use thiserror::Error;

/// Failure of a single Block transaction
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// The transaction stayed pending past the Block timeout
    #[error("transaction timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// Readback after a write did not match the written data under the verify mask
    #[error("verify mismatch at byte {offset}: expected 0x{expected:02X}, read 0x{actual:02X}")]
    Verify { offset: usize, expected: u8, actual: u8 },

    /// The transport rejected the address
    #[error("address error: {0}")]
    Address(String),

    /// The transport rejected the transfer size
    #[error("size error: {0}")]
    Size(String),

    /// Opaque failure reported by the transport
    #[error("transport error: {0}")]
    Transport(String),
}

impl TransactionError {
    /// Whether re-issuing the same transaction may succeed
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransactionError::Timeout { .. })
    }
}

/// Main error type for register engine operations
#[derive(Error, Debug)]
pub enum RegError {
    /// A Block transaction failed
    #[error("Transaction error at 0x{address:08X} ({path}): {source}")]
    Transaction {
        path: String,
        address: u64,
        #[source]
        source: TransactionError,
    },

    /// Malformed display string or value of the wrong shape for a codec
    #[error("Format error: {0}")]
    Format(String),

    /// Tree-structural violation (duplicate name, overlapping blocks, late attach)
    #[error("Node error: {0}")]
    Node(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to probe operations
    #[error("Probe error: {0}")]
    Probe(#[from] probe_rs::Error),

    /// Errors related to debug probe operations
    #[error("Debug probe error: {0}")]
    DebugProbe(#[from] probe_rs::probe::DebugProbeError),

    /// Errors related to target registry
    #[error("Registry error: {0}")]
    Registry(#[from] probe_rs::config::RegistryError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<RegError>,
    },
}

impl RegError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        RegError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The transaction failure carried by this error, looking through context layers
    pub fn transaction_error(&self) -> Option<&TransactionError> {
        match self {
            RegError::Transaction { source, .. } => Some(source),
            RegError::WithContext { source, .. } => source.transaction_error(),
            _ => None,
        }
    }

    /// Whether this error is (or wraps) a transaction timeout
    pub fn is_timeout(&self) -> bool {
        self.transaction_error()
            .is_some_and(TransactionError::is_timeout)
    }
}

/// Result type alias for register engine operations
pub type Result<T> = std::result::Result<T, RegError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl From<serde_json::Error> for RegError {
    fn from(err: serde_json::Error) -> Self {
        RegError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RegError::Format("bad literal 0xZZ".to_string());
        assert_eq!(err.to_string(), "Format error: bad literal 0xZZ");
    }

    #[test]
    fn test_error_with_context() {
        let err = RegError::Node("duplicate".to_string());
        let with_ctx = err.with_context("Failed to add Top.Reg");
        assert!(with_ctx.to_string().contains("Failed to add Top.Reg"));
    }

    #[test]
    fn test_transaction_error_display() {
        let err = RegError::Transaction {
            path: "Top.Status".to_string(),
            address: 0x100,
            source: TransactionError::Verify {
                offset: 2,
                expected: 0xAB,
                actual: 0x00,
            },
        };
        let text = err.to_string();
        assert!(text.contains("0x00000100"));
        assert!(text.contains("Top.Status"));
        assert!(text.contains("expected 0xAB"));
    }

    #[test]
    fn test_timeout_seen_through_context() {
        let err = RegError::Transaction {
            path: "Top".to_string(),
            address: 0,
            source: TransactionError::Timeout {
                elapsed: Duration::from_millis(10),
            },
        }
        .with_context("readAll");
        assert!(err.is_timeout());
        assert!(!RegError::Config("x".into()).is_timeout());
    }
}
