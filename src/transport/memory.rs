//! Emulated register space
//!
//! [`MemoryTransport`] answers transactions from in-process memory regions. It is
//! the transport used by the test-suite and by simulation setups that run a
//! device tree without hardware.
//!
//! # Features
//!
//! - **Regions**: reads/writes outside a mapped region fail with an address error
//! - **Synchronous or threaded completion**: completions are delivered inline by
//!   default, or from a worker thread fed through a crossbeam channel
//! - **Latency**: optional delay before each completion
//! - **Fault injection**: swallow completions (timeouts), fail the next N
//!   transactions, or corrupt readback data
//! - **Transaction log**: every request is recorded for assertions
//!
//! # Example
//!
//! ```ignore
//! use regtree_rs::transport::MemoryTransport;
//!
//! let mem = MemoryTransport::new()
//!     .with_region(0x0000, 0x1000)
//!     .threaded();
//! mem.poke(0x100, &[0xCD, 0xAB, 0x34, 0x12]);
//! ```

use super::{Transaction, TransactionKind, Transport};
use crate::error::TransactionError;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// One logged request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub kind: TransactionKind,
    pub address: u64,
    pub size: usize,
}

/// Mock memory regions mapped by base address
#[derive(Debug, Default)]
struct MockMemory {
    regions: HashMap<u64, Vec<u8>>,
}

impl MockMemory {
    fn add_region(&mut self, base_address: u64, size: usize) {
        self.regions.insert(base_address, vec![0u8; size]);
    }

    fn write(&mut self, address: u64, data: &[u8]) -> bool {
        for (&base, region) in &mut self.regions {
            let end = base + region.len() as u64;
            if address >= base && address + data.len() as u64 <= end {
                let offset = (address - base) as usize;
                region[offset..offset + data.len()].copy_from_slice(data);
                return true;
            }
        }
        false
    }

    fn read(&self, address: u64, size: usize) -> Option<Vec<u8>> {
        for (&base, region) in &self.regions {
            let end = base + region.len() as u64;
            if address >= base && address + size as u64 <= end {
                let offset = (address - base) as usize;
                return Some(region[offset..offset + size].to_vec());
            }
        }
        None
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    memory: MockMemory,
    log: Vec<TransactionRecord>,
    drop_completions: bool,
    fail_next: VecDeque<TransactionError>,
    corrupt_reads: bool,
    latency: Duration,
}

impl MemoryState {
    /// Apply a transaction and compute its outcome, or `None` to swallow it
    fn execute(&mut self, txn: &Transaction) -> Option<Result<Option<Vec<u8>>, TransactionError>> {
        self.log.push(TransactionRecord {
            kind: txn.kind,
            address: txn.address,
            size: txn.size(),
        });

        if self.drop_completions {
            return None;
        }
        if let Some(err) = self.fail_next.pop_front() {
            return Some(Err(err));
        }

        let result = if txn.kind.is_read() {
            match self.memory.read(txn.address, txn.size()) {
                Some(mut data) => {
                    if self.corrupt_reads {
                        for b in &mut data {
                            *b = !*b;
                        }
                    }
                    Ok(Some(data))
                }
                None => Err(unmapped(txn)),
            }
        } else if self.memory.write(txn.address, &txn.data) {
            Ok(None)
        } else {
            Err(unmapped(txn))
        };
        Some(result)
    }
}

fn unmapped(txn: &Transaction) -> TransactionError {
    TransactionError::Address(format!(
        "0x{:08X}+{} is not mapped",
        txn.address,
        txn.size()
    ))
}

/// In-process transport backed by emulated memory regions
pub struct MemoryTransport {
    endpoint: u64,
    min_access: usize,
    max_access: usize,
    state: Arc<Mutex<MemoryState>>,
    worker: Option<Sender<Transaction>>,
}

impl MemoryTransport {
    /// Create a transport with no mapped memory and inline completion
    pub fn new() -> Self {
        Self {
            endpoint: super::next_endpoint_id(),
            min_access: 1,
            max_access: usize::MAX,
            state: Arc::new(Mutex::new(MemoryState::default())),
            worker: None,
        }
    }

    /// Map a zero-filled region
    pub fn with_region(self, base_address: u64, size: usize) -> Self {
        self.state.lock().memory.add_region(base_address, size);
        self
    }

    /// Set the minimum access granularity in bytes
    pub fn with_min_access(mut self, bytes: usize) -> Self {
        self.min_access = bytes.max(1);
        self
    }

    /// Set the maximum transfer size in bytes
    pub fn with_max_access(mut self, bytes: usize) -> Self {
        self.max_access = bytes.max(1);
        self
    }

    /// Delay every completion by `latency`
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = latency;
        self
    }

    /// Complete transactions from a dedicated worker thread
    pub fn threaded(mut self) -> Self {
        let (tx, rx) = unbounded::<Transaction>();
        let state = self.state.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("mem-transport-{}", self.endpoint))
            .spawn(move || {
                for txn in rx {
                    let latency = state.lock().latency;
                    if !latency.is_zero() {
                        std::thread::sleep(latency);
                    }
                    let outcome = state.lock().execute(&txn);
                    if let Some(result) = outcome {
                        txn.into_completion().complete(result);
                    }
                }
                tracing::debug!("Memory transport worker stopped");
            });
        match spawned {
            Ok(_) => self.worker = Some(tx),
            Err(e) => tracing::warn!("Failed to spawn transport worker, completing inline: {}", e),
        }
        self
    }

    /// Write bytes directly into emulated memory (no transaction)
    pub fn poke(&self, address: u64, data: &[u8]) -> bool {
        self.state.lock().memory.write(address, data)
    }

    /// Read bytes directly from emulated memory (no transaction)
    pub fn peek(&self, address: u64, size: usize) -> Option<Vec<u8>> {
        self.state.lock().memory.read(address, size)
    }

    /// Swallow completions from now on (transactions will time out)
    pub fn set_drop_completions(&self, drop: bool) {
        self.state.lock().drop_completions = drop;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Fail the next transaction with `error`
    pub fn fail_next(&self, error: TransactionError) {
        self.state.lock().fail_next.push_back(error);
    }

    /// Invert every byte returned by read-type transactions
    pub fn set_corrupt_reads(&self, corrupt: bool) {
        self.state.lock().corrupt_reads = corrupt;
    }

    /// All requests seen so far
    pub fn log(&self) -> Vec<TransactionRecord> {
        self.state.lock().log.clone()
    }

    /// Number of logged requests of one kind
    pub fn count(&self, kind: TransactionKind) -> usize {
        self.state.lock().log.iter().filter(|r| r.kind == kind).count()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn endpoint_id(&self) -> u64 {
        self.endpoint
    }

    fn min_access(&self) -> usize {
        self.min_access
    }

    fn max_access(&self) -> usize {
        self.max_access
    }

    fn request(&self, transaction: Transaction) {
        if let Some(worker) = &self.worker {
            if let Err(e) = worker.send(transaction) {
                e.into_inner()
                    .fail(TransactionError::Transport("transport worker stopped".to_string()));
            }
            return;
        }

        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        let outcome = self.state.lock().execute(&transaction);
        if let Some(result) = outcome {
            transaction.into_completion().complete(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Completion, TransactionId, TransactionResult, TransactionSink};
    use crossbeam_channel::{bounded, Receiver};
    use std::sync::Arc;

    struct ChannelSink(Sender<(TransactionId, TransactionResult)>);

    impl TransactionSink for ChannelSink {
        fn transaction_done(&self, id: TransactionId, result: TransactionResult) {
            let _ = self.0.send((id, result));
        }
    }

    fn sink() -> (Arc<dyn TransactionSink>, Receiver<(TransactionId, TransactionResult)>) {
        let (tx, rx) = bounded(16);
        (Arc::new(ChannelSink(tx)), rx)
    }

    fn txn(
        sink: &Arc<dyn TransactionSink>,
        id: TransactionId,
        kind: TransactionKind,
        address: u64,
        data: Vec<u8>,
    ) -> Transaction {
        Transaction::new(kind, address, data, Completion::new(id, Arc::downgrade(sink)))
    }

    #[test]
    fn test_mock_memory() {
        let mut memory = MockMemory::default();
        memory.add_region(0x2000_0000, 1024);

        let data = [1u8, 2, 3, 4];
        assert!(memory.write(0x2000_0000, &data));

        let read = memory.read(0x2000_0000, 4).unwrap();
        assert_eq!(read, data);
        assert!(memory.read(0x2000_0400, 1).is_none());
    }

    #[test]
    fn test_write_then_read_inline() {
        let mem = MemoryTransport::new().with_region(0, 0x100);
        let (sink, rx) = sink();

        mem.request(txn(&sink, 1, TransactionKind::Write, 0x10, vec![0xAA, 0xBB]));
        assert_eq!(rx.try_recv().unwrap(), (1, Ok(None)));

        mem.request(txn(&sink, 2, TransactionKind::Read, 0x10, vec![0; 2]));
        assert_eq!(rx.try_recv().unwrap(), (2, Ok(Some(vec![0xAA, 0xBB]))));
        assert_eq!(mem.count(TransactionKind::Write), 1);
        assert_eq!(mem.count(TransactionKind::Read), 1);
    }

    #[test]
    fn test_unmapped_address_fails() {
        let mem = MemoryTransport::new().with_region(0, 0x10);
        let (sink, rx) = sink();
        mem.request(txn(&sink, 3, TransactionKind::Read, 0x0E, vec![0; 4]));
        let (_, result) = rx.try_recv().unwrap();
        assert!(matches!(result, Err(TransactionError::Address(_))));
    }

    #[test]
    fn test_threaded_completion() {
        let mem = MemoryTransport::new().with_region(0, 0x10).threaded();
        mem.poke(0, &[9, 8, 7, 6]);
        let (sink, rx) = sink();
        mem.request(txn(&sink, 4, TransactionKind::Verify, 0, vec![0; 4]));
        let (id, result) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(id, 4);
        assert_eq!(result, Ok(Some(vec![9, 8, 7, 6])));
    }

    #[test]
    fn test_fault_injection() {
        let mem = MemoryTransport::new().with_region(0, 0x10);
        let (sink, rx) = sink();

        mem.fail_next(TransactionError::Size("too big".into()));
        mem.request(txn(&sink, 5, TransactionKind::Write, 0, vec![1]));
        assert!(matches!(rx.try_recv().unwrap().1, Err(TransactionError::Size(_))));

        mem.set_drop_completions(true);
        mem.request(txn(&sink, 6, TransactionKind::Write, 0, vec![1]));
        assert!(rx.try_recv().is_err());
        assert_eq!(mem.log().len(), 2);

        mem.set_drop_completions(false);
        mem.set_corrupt_reads(true);
        mem.poke(0, &[0x0F]);
        mem.request(txn(&sink, 7, TransactionKind::Read, 0, vec![0]));
        assert_eq!(rx.try_recv().unwrap().1, Ok(Some(vec![0xF0])));
    }
}
