//! Memory transport boundary
//!
//! The engine never moves bytes itself. Each Block hands a [`Transaction`] to the
//! [`Transport`] its device was attached to, and the transport calls the
//! transaction's completion exactly once, from whatever thread it likes.
//!
//! # Implementations
//!
//! - [`MemoryTransport`] - emulated register space, for tests and simulation
//! - [`ProbeTransport`] - debug probe (SWD/JTAG) memory access via probe-rs
//!
//! # Contract
//!
//! - `request` may be called from any thread and must not block on the
//!   completion of the same transaction.
//! - Every transaction is completed at most once. A transaction that is never
//!   completed is reported by the Block as a timeout.
//! - Read-type transactions ([`TransactionKind::Read`], [`TransactionKind::Verify`])
//!   complete with the bytes read; write-type transactions complete with `None`.

pub mod memory;
pub mod probe;

pub use memory::{MemoryTransport, TransactionRecord};
pub use probe::ProbeTransport;

use crate::error::TransactionError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

/// Opaque transaction identifier, unique per process
pub type TransactionId = u64;

/// Kind of a Block transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    /// Read hardware into the Block data buffer
    Read,
    /// Write the Block data buffer to hardware
    Write,
    /// Read hardware into the verify buffer and compare under the verify mask
    Verify,
    /// Posted write: no response is required by the hardware
    Post,
}

impl TransactionKind {
    /// Whether the transport must return data for this kind
    pub fn is_read(&self) -> bool {
        matches!(self, TransactionKind::Read | TransactionKind::Verify)
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionKind::Read => write!(f, "Read"),
            TransactionKind::Write => write!(f, "Write"),
            TransactionKind::Verify => write!(f, "Verify"),
            TransactionKind::Post => write!(f, "Post"),
        }
    }
}

/// Outcome a transport reports for a transaction
pub type TransactionResult = std::result::Result<Option<Vec<u8>>, TransactionError>;

/// Receiver of transaction completions (implemented by Block)
pub trait TransactionSink: Send + Sync {
    fn transaction_done(&self, id: TransactionId, result: TransactionResult);
}

/// One-shot completion handle travelling with a transaction
pub struct Completion {
    id: TransactionId,
    sink: Weak<dyn TransactionSink>,
}

impl Completion {
    pub fn new(id: TransactionId, sink: Weak<dyn TransactionSink>) -> Self {
        Self { id, sink }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Deliver the result. A sink that no longer exists is ignored.
    pub fn complete(self, result: TransactionResult) {
        match self.sink.upgrade() {
            Some(sink) => sink.transaction_done(self.id, result),
            None => tracing::trace!(id = self.id, "Completion for dropped block ignored"),
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion").field("id", &self.id).finish()
    }
}

/// A request handed to a transport
#[derive(Debug)]
pub struct Transaction {
    pub id: TransactionId,
    pub kind: TransactionKind,
    /// Absolute address of the first byte
    pub address: u64,
    /// Bytes to write (write kinds) or a zeroed buffer of the transfer size (read kinds)
    pub data: Vec<u8>,
    completion: Completion,
}

impl Transaction {
    pub fn new(kind: TransactionKind, address: u64, data: Vec<u8>, completion: Completion) -> Self {
        Self {
            id: completion.id(),
            kind,
            address,
            data,
            completion,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Complete successfully; `data` is required for read kinds
    pub fn done(self, data: Option<Vec<u8>>) {
        self.completion.complete(Ok(data));
    }

    /// Complete with an error
    pub fn fail(self, error: TransactionError) {
        self.completion.complete(Err(error));
    }

    /// Take the completion handle, dropping the request payload
    pub fn into_completion(self) -> Completion {
        self.completion
    }
}

/// Unified interface for memory transports
///
/// Implementations must be `Send + Sync`: Blocks on many threads share one
/// transport through an `Arc`.
pub trait Transport: Send + Sync {
    /// Identity of the address space this transport reaches
    ///
    /// Blocks on the same endpoint must not overlap.
    fn endpoint_id(&self) -> u64;

    /// Minimum transfer granularity in bytes; Block sizes are rounded up to it
    fn min_access(&self) -> usize {
        1
    }

    /// Largest transfer the transport accepts in one transaction
    fn max_access(&self) -> usize {
        usize::MAX
    }

    /// Issue a transaction; completion may happen before this returns
    fn request(&self, transaction: Transaction);
}

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique endpoint id for a new transport
pub fn next_endpoint_id() -> u64 {
    NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Allocate a process-unique transaction id
pub fn next_transaction_id() -> TransactionId {
    NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(TransactionId, TransactionResult)>>,
    }

    impl TransactionSink for Recorder {
        fn transaction_done(&self, id: TransactionId, result: TransactionResult) {
            self.seen.lock().push((id, result));
        }
    }

    #[test]
    fn test_completion_delivers_once() {
        let recorder = Arc::new(Recorder::default());
        let sink: Arc<dyn TransactionSink> = recorder.clone();
        let txn = Transaction::new(
            TransactionKind::Read,
            0x100,
            vec![0; 4],
            Completion::new(7, Arc::downgrade(&sink)),
        );
        assert_eq!(txn.id, 7);
        assert_eq!(txn.size(), 4);
        txn.done(Some(vec![1, 2, 3, 4]));

        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], (7, Ok(Some(vec![1, 2, 3, 4]))));
    }

    #[test]
    fn test_completion_after_sink_dropped_is_ignored() {
        let sink: Arc<dyn TransactionSink> = Arc::new(Recorder::default());
        let completion = Completion::new(1, Arc::downgrade(&sink));
        drop(sink);
        completion.complete(Err(TransactionError::Transport("gone".into())));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = next_transaction_id();
        let b = next_transaction_id();
        assert_ne!(a, b);
        assert_ne!(next_endpoint_id(), next_endpoint_id());
    }

    #[test]
    fn test_kind_classification() {
        assert!(TransactionKind::Read.is_read());
        assert!(TransactionKind::Verify.is_read());
        assert!(!TransactionKind::Write.is_read());
        assert!(!TransactionKind::Post.is_read());
        assert_eq!(TransactionKind::Verify.to_string(), "Verify");
    }
}
