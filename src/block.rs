//! Register blocks and their transaction state machine
//!
//! A [`Block`] owns a contiguous byte range of the register space: the data
//! buffer Variables are packed into, a verify buffer for readback and a bit mask
//! of the bits that take part in verification. It runs at most one transaction at
//! a time; every method that touches the buffers first waits until the block is
//! quiescent.
//!
//! # Bit packing
//!
//! Variables are described by a [`BitLayout`]: one or more `(bit_offset,
//! bit_size)` pieces inside the block. The codec bytes of a value form a bit
//! stream that is spread over the pieces, least significant piece first. When
//! every piece is byte aligned the bytes are copied directly; otherwise bits are
//! copied one at a time. Both paths produce the same buffer contents for aligned
//! input.
//!
//! # Transactions
//!
//! ```text
//! start_transaction ──► pending(id) ──► transaction_done(id) ──► quiescent
//!                            │
//!                            └── timeout elapsed while waiting ──► Timeout error
//! ```
//!
//! Completions carrying an id other than the pending one are ignored. A blocking
//! caller collects the outcome of its own transaction id, so another thread
//! starting a transaction in between cannot take its error.

use crate::device::Enable;
use crate::error::{RegError, Result, TransactionError};
use crate::transport::{
    next_transaction_id, Completion, Transaction, TransactionId, TransactionKind,
    TransactionResult, TransactionSink, Transport,
};
use crate::variable::Variable;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

/// Access mode of a Variable or Block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Mode {
    #[serde(rename = "RO")]
    ReadOnly,
    #[serde(rename = "WO")]
    WriteOnly,
    #[default]
    #[serde(rename = "RW")]
    ReadWrite,
}

impl Mode {
    /// Whether a block in this mode takes part in a background transaction of `kind`
    pub fn allows(&self, kind: TransactionKind) -> bool {
        match kind {
            TransactionKind::Read => matches!(self, Mode::ReadOnly | Mode::ReadWrite),
            TransactionKind::Write | TransactionKind::Post => {
                matches!(self, Mode::WriteOnly | Mode::ReadWrite)
            }
            TransactionKind::Verify => *self == Mode::ReadWrite,
        }
    }

    /// Mode of a block shared by variables in `self` and `other` mode
    pub fn widen(self, other: Mode) -> Mode {
        if self == other {
            self
        } else {
            Mode::ReadWrite
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::ReadOnly => write!(f, "RO"),
            Mode::WriteOnly => write!(f, "WO"),
            Mode::ReadWrite => write!(f, "RW"),
        }
    }
}

/// Equal-stride slots of a list variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListLayout {
    pub num_values: usize,
    /// Bits of each value
    pub value_bits: usize,
    /// Distance in bits between the starts of consecutive values
    pub value_stride: usize,
}

/// Placement of a Variable inside its Block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitLayout {
    /// Byte offset of the Block within the owning device
    pub offset: u64,
    /// `(bit_offset, bit_size)` pieces, least significant first
    pub pieces: Vec<(usize, usize)>,
    /// Present for list variables; `pieces` then holds the first slot
    pub list: Option<ListLayout>,
    pub mode: Mode,
    pub verify: bool,
    /// Codec bytes are in big-endian order
    pub big_endian: bool,
}

impl BitLayout {
    /// Pieces of every value: one entry for scalars, `num_values` entries for lists
    pub fn fields(&self) -> Vec<Vec<(usize, usize)>> {
        match self.list {
            None => vec![self.pieces.clone()],
            Some(list) => {
                let base = self.pieces.first().map(|p| p.0).unwrap_or(0);
                (0..list.num_values)
                    .map(|i| vec![(base + i * list.value_stride, list.value_bits)])
                    .collect()
            }
        }
    }

    /// Bits carried by one value
    pub fn field_bits(&self) -> usize {
        match self.list {
            None => self.pieces.iter().map(|p| p.1).sum(),
            Some(list) => list.value_bits,
        }
    }

    /// One past the highest bit used
    pub fn end_bit(&self) -> usize {
        self.fields()
            .iter()
            .flatten()
            .map(|(o, s)| o + s)
            .max()
            .unwrap_or(0)
    }

    /// Whether values can be copied as whole bytes
    pub fn is_byte_aligned(&self) -> bool {
        let aligned = self.fields().iter().flatten().all(|(o, s)| o % 8 == 0 && s % 8 == 0);
        let pieces = match self.list {
            None => self.pieces.len(),
            Some(_) => 1,
        };
        aligned && (pieces == 1 || !self.big_endian)
    }
}

/// Copy `bits` bits from `src` (starting at bit `src_bit`) into `dst` at `dst_bit`
///
/// Bit `n` of a buffer is bit `n % 8` of byte `n / 8`.
pub fn copy_bits(dst: &mut [u8], dst_bit: usize, src: &[u8], src_bit: usize, bits: usize) {
    for i in 0..bits {
        let s = src_bit + i;
        let d = dst_bit + i;
        let bit = (src[s / 8] >> (s % 8)) & 1;
        if bit != 0 {
            dst[d / 8] |= 1 << (d % 8);
        } else {
            dst[d / 8] &= !(1 << (d % 8));
        }
    }
}

/// Byte-granular version of [`copy_bits`]; all arguments must be multiples of 8
pub fn copy_bytes(dst: &mut [u8], dst_bit: usize, src: &[u8], src_bit: usize, bits: usize) {
    let n = bits / 8;
    dst[dst_bit / 8..dst_bit / 8 + n].copy_from_slice(&src[src_bit / 8..src_bit / 8 + n]);
}

/// Spread a bit stream over the pieces of one field
pub fn insert_field(data: &mut [u8], pieces: &[(usize, usize)], stream: &[u8], fast: bool) {
    let mut cursor = 0;
    for &(offset, size) in pieces {
        if fast {
            copy_bytes(data, offset, stream, cursor, size);
        } else {
            copy_bits(data, offset, stream, cursor, size);
        }
        cursor += size;
    }
}

/// Gather the pieces of one field into a bit stream
pub fn extract_field(data: &[u8], pieces: &[(usize, usize)], fast: bool) -> Vec<u8> {
    let total: usize = pieces.iter().map(|p| p.1).sum();
    let mut stream = vec![0u8; total.div_ceil(8)];
    let mut cursor = 0;
    for &(offset, size) in pieces {
        if fast {
            copy_bytes(&mut stream, cursor, data, offset, size);
        } else {
            copy_bits(&mut stream, cursor, data, offset, size);
        }
        cursor += size;
    }
    stream
}

/// Resize codec bytes to `len`, padding or truncating at the most significant end
pub(crate) fn fit_bytes(bytes: &[u8], len: usize, big_endian: bool) -> Vec<u8> {
    if big_endian {
        let mut out = vec![0u8; len.saturating_sub(bytes.len())];
        let skip = bytes.len().saturating_sub(len);
        out.extend_from_slice(&bytes[skip..]);
        out
    } else {
        let mut out: Vec<u8> = bytes.iter().copied().take(len).collect();
        out.resize(len, 0);
        out
    }
}

pub(crate) fn set_mask(mask: &mut [u8], offset: usize, size: usize, set: bool) {
    for bit in offset..offset + size {
        if set {
            mask[bit / 8] |= 1 << (bit % 8);
        } else {
            mask[bit / 8] &= !(1 << (bit % 8));
        }
    }
}

/// Counters kept per block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockStats {
    pub reads: u64,
    pub writes: u64,
    pub verifies: u64,
    pub posts: u64,
    pub timeouts: u64,
    pub verify_failures: u64,
    /// Failures reported by the transport
    pub errors: u64,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    id: TransactionId,
    kind: TransactionKind,
    started: Instant,
}

struct Attachment {
    path: String,
    address: u64,
    transport: Arc<dyn Transport>,
    enable: Arc<Enable>,
}

struct BlockState {
    size: usize,
    min_access: usize,
    data: Vec<u8>,
    verify_data: Vec<u8>,
    verify_mask: Vec<u8>,
    mode: Mode,
    timeout: Duration,
    pending: Option<Pending>,
    error: Option<TransactionError>,
    /// Outcomes of tracked transactions, filled in on completion
    tracked: HashMap<TransactionId, Option<TransactionError>>,
    /// Kind of the last completed transaction, cleared once reported as an update
    completed: Option<TransactionKind>,
    stale: bool,
    mapped: Vec<(BitLayout, Weak<Variable>)>,
    stats: BlockStats,
}

impl BlockState {
    /// Record the end of transaction `id`
    ///
    /// A tracked transaction keeps its error for its own waiter; otherwise the
    /// error is left for the next check.
    fn finish(&mut self, id: TransactionId, kind: TransactionKind, error: Option<TransactionError>) {
        self.completed = Some(kind);
        match self.tracked.get_mut(&id) {
            Some(slot) => *slot = error,
            None => {
                if error.is_some() {
                    self.error = error;
                }
            }
        }
    }

    fn resize(&mut self, size: usize) {
        self.size = size;
        self.data.resize(size, 0);
        self.verify_data.resize(size, 0);
        self.verify_mask.resize(size, 0);
    }

    /// Rebuild the verify mask from the mapped layouts
    fn rebuild_mask(&mut self) {
        let mut mask = vec![0u8; self.size];
        for (layout, _) in &self.mapped {
            if layout.mode == Mode::ReadWrite && layout.verify {
                for (o, s) in layout.fields().into_iter().flatten() {
                    set_mask(&mut mask, o, s, true);
                }
            }
        }
        // RO and WO variables own their bits exclusively
        for (layout, _) in &self.mapped {
            if layout.mode != Mode::ReadWrite {
                for (o, s) in layout.fields().into_iter().flatten() {
                    set_mask(&mut mask, o, s, false);
                }
            }
        }
        self.verify_mask = mask;
    }

    fn check_bounds(&self, layout: &BitLayout) -> Result<()> {
        if layout.end_bit() > self.size * 8 {
            return Err(RegError::Node(format!(
                "field ends at bit {} beyond block of {} bytes",
                layout.end_bit(),
                self.size
            )));
        }
        Ok(())
    }
}

/// A contiguous register range with one in-flight transaction at a time
pub struct Block {
    offset: u64,
    me: Weak<Block>,
    attachment: OnceLock<Attachment>,
    state: Mutex<BlockState>,
    cond: Condvar,
}

impl Block {
    /// Create an empty block at `offset` bytes into its device
    pub fn new(offset: u64) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            offset,
            me: me.clone(),
            attachment: OnceLock::new(),
            state: Mutex::new(BlockState {
                size: 0,
                min_access: 1,
                data: Vec::new(),
                verify_data: Vec::new(),
                verify_mask: Vec::new(),
                mode: Mode::ReadWrite,
                timeout: Duration::from_millis(crate::config::DEFAULT_TIMEOUT_MS),
                pending: None,
                error: None,
                tracked: HashMap::new(),
                completed: None,
                stale: false,
                mapped: Vec::new(),
                stats: BlockStats::default(),
            }),
            cond: Condvar::new(),
        })
    }

    /// Offset within the owning device
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Absolute address, known once the tree is activated
    pub fn address(&self) -> Option<u64> {
        self.attachment.get().map(|a| a.address)
    }

    pub fn path(&self) -> &str {
        self.attachment.get().map_or("", |a| a.path.as_str())
    }

    pub fn size(&self) -> usize {
        self.state.lock().size
    }

    pub fn mode(&self) -> Mode {
        self.state.lock().mode
    }

    pub fn timeout(&self) -> Duration {
        self.state.lock().timeout
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.state.lock().timeout = timeout;
    }

    /// Whether the data buffer holds changes not yet written
    pub fn is_stale(&self) -> bool {
        self.state.lock().stale
    }

    pub fn stats(&self) -> BlockStats {
        self.state.lock().stats.clone()
    }

    /// Endpoint of the attached transport
    pub fn endpoint_id(&self) -> Option<u64> {
        self.attachment.get().map(|a| a.transport.endpoint_id())
    }

    pub fn data(&self) -> Vec<u8> {
        self.state.lock().data.clone()
    }

    pub fn verify_mask(&self) -> Vec<u8> {
        self.state.lock().verify_mask.clone()
    }

    /// Variables mapped into this block, in bind order
    pub fn variables(&self) -> Vec<Arc<Variable>> {
        self.state
            .lock()
            .mapped
            .iter()
            .filter_map(|(_, v)| v.upgrade())
            .collect()
    }

    fn enabled(&self) -> bool {
        self.attachment.get().map_or(true, |a| a.enable.is_enabled())
    }

    /// Map a variable into this block
    ///
    /// Returns `false` when the variable lives at a different offset.
    pub fn bind(&self, variable: &Arc<Variable>) -> Result<bool> {
        let Some(layout) = variable.layout() else {
            return Err(RegError::Node(format!(
                "{} is not a remote variable",
                variable.name()
            )));
        };
        if layout.offset != self.offset {
            return Ok(false);
        }

        let mut st = self.state.lock();
        self.wait_quiescent(&mut st);

        let needed = layout.end_bit().div_ceil(8);
        if needed > st.size {
            let size = needed.div_ceil(st.min_access) * st.min_access;
            st.resize(size);
        }
        st.mode = if st.mapped.is_empty() {
            layout.mode
        } else {
            st.mode.widen(layout.mode)
        };
        st.mapped.push((layout.clone(), Arc::downgrade(variable)));
        st.rebuild_mask();

        tracing::trace!(
            "Bound {} to block at 0x{:X} (size {}, mode {})",
            variable.name(),
            self.offset,
            st.size,
            st.mode
        );
        Ok(true)
    }

    /// Connect the block to its transport at tree activation
    pub(crate) fn attach(
        &self,
        path: &str,
        address: u64,
        transport: Arc<dyn Transport>,
        enable: Arc<Enable>,
        timeout: Duration,
    ) -> Result<()> {
        let min_access = transport.min_access().max(1);
        self.attachment
            .set(Attachment {
                path: path.to_string(),
                address,
                transport,
                enable,
            })
            .map_err(|_| RegError::Node(format!("block at 0x{:08X} already attached", address)))?;

        let mut st = self.state.lock();
        st.min_access = min_access;
        st.timeout = timeout;
        let size = st.size.div_ceil(min_access) * min_access;
        st.resize(size);
        Ok(())
    }

    /// Wait until no transaction is pending, failing it if its timeout passes
    fn wait_quiescent(&self, st: &mut MutexGuard<'_, BlockState>) {
        while let Some(pending) = st.pending {
            let deadline = pending.started + st.timeout;
            if self.cond.wait_until(st, deadline).timed_out()
                && st.pending.is_some_and(|p| p.id == pending.id)
            {
                let elapsed = pending.started.elapsed();
                tracing::warn!(
                    path = self.path(),
                    id = pending.id,
                    "{} timed out after {:?}",
                    pending.kind,
                    elapsed
                );
                st.pending = None;
                st.finish(pending.id, pending.kind, Some(TransactionError::Timeout { elapsed }));
                st.stats.timeouts += 1;
                self.cond.notify_all();
            }
        }
    }

    /// Pack codec bytes into the data buffer, one entry per value
    pub fn set_values(&self, layout: &BitLayout, values: &[Vec<u8>]) -> Result<()> {
        let mut st = self.state.lock();
        self.wait_quiescent(&mut st);
        st.check_bounds(layout)?;

        let fast = layout.is_byte_aligned();
        let field_bytes = layout.field_bits().div_ceil(8);
        for (pieces, bytes) in layout.fields().iter().zip(values) {
            let mut stream = fit_bytes(bytes, field_bytes, layout.big_endian);
            if layout.big_endian && !fast {
                stream.reverse();
            }
            insert_field(&mut st.data, pieces, &stream, fast);
        }
        st.stale = true;
        Ok(())
    }

    /// Unpack the bytes of every value of `layout` from the data buffer
    pub fn get_values(&self, layout: &BitLayout) -> Result<Vec<Vec<u8>>> {
        let mut st = self.state.lock();
        self.wait_quiescent(&mut st);
        if let Some(error) = st.error.take() {
            return Err(self.error(error));
        }
        st.check_bounds(layout)?;

        let fast = layout.is_byte_aligned();
        Ok(layout
            .fields()
            .iter()
            .map(|pieces| {
                let mut stream = extract_field(&st.data, pieces, fast);
                if layout.big_endian && !fast {
                    stream.reverse();
                }
                stream
            })
            .collect())
    }

    fn error(&self, source: TransactionError) -> RegError {
        RegError::Transaction {
            path: self.path().to_string(),
            address: self.address().unwrap_or(self.offset),
            source,
        }
    }

    /// Issue a transaction without waiting for it
    ///
    /// A block in a disabled subtree ignores the request.
    pub fn start_transaction(&self, kind: TransactionKind) -> Result<()> {
        self.issue(kind, false).map(|_| ())
    }

    /// Issue a transaction whose outcome only [`wait_transaction`](Self::wait_transaction) reports
    ///
    /// Returns `None` when the block is disabled and nothing was issued.
    pub fn start_transaction_tracked(&self, kind: TransactionKind) -> Result<Option<TransactionId>> {
        self.issue(kind, true)
    }

    fn issue(&self, kind: TransactionKind, tracked: bool) -> Result<Option<TransactionId>> {
        let Some(attachment) = self.attachment.get() else {
            return Err(RegError::Node(format!(
                "block at offset 0x{:X} is not attached to a transport",
                self.offset
            )));
        };

        let mut st = self.state.lock();
        self.wait_quiescent(&mut st);
        if !self.enabled() {
            st.completed = None;
            return Ok(None);
        }

        if let Some(dropped) = st.error.take() {
            tracing::debug!(path = self.path(), "Discarding unchecked error: {}", dropped);
        }

        let id = next_transaction_id();
        if tracked {
            st.tracked.insert(id, None);
        }

        if st.size > attachment.transport.max_access() {
            let error = TransactionError::Size(format!(
                "{} bytes exceeds transport maximum of {}",
                st.size,
                attachment.transport.max_access()
            ));
            st.finish(id, kind, Some(error));
            return Ok(Some(id));
        }

        let data = match kind {
            TransactionKind::Read | TransactionKind::Verify => vec![0u8; st.size],
            TransactionKind::Write | TransactionKind::Post => st.data.clone(),
        };
        st.pending = Some(Pending {
            id,
            kind,
            started: Instant::now(),
        });
        match kind {
            TransactionKind::Read => st.stats.reads += 1,
            TransactionKind::Write => st.stats.writes += 1,
            TransactionKind::Verify => st.stats.verifies += 1,
            TransactionKind::Post => st.stats.posts += 1,
        }
        drop(st);

        tracing::trace!(
            path = attachment.path.as_str(),
            id,
            "Starting {} of {} bytes at 0x{:08X}",
            kind,
            data.len(),
            attachment.address
        );
        let sink: Weak<dyn TransactionSink> = self.me.clone();
        attachment.transport.request(Transaction::new(
            kind,
            attachment.address,
            data,
            Completion::new(id, sink),
        ));
        Ok(Some(id))
    }

    /// Wait for a tracked transaction and report its own outcome
    pub fn wait_transaction(&self, id: TransactionId) -> Result<()> {
        let outcome = {
            let mut st = self.state.lock();
            self.wait_quiescent(&mut st);
            st.tracked.remove(&id)
        };
        match outcome {
            Some(Some(error)) => Err(self.error(error)),
            Some(None) => Ok(()),
            None => Err(RegError::Node(format!(
                "{}: transaction {} is not tracked",
                self.path(),
                id
            ))),
        }
    }

    /// Wait for the current transaction and report its outcome
    ///
    /// With `update`, a completed Read notifies the mapped variables.
    pub fn check_transaction(&self, update: bool) -> Result<()> {
        let (error, notify) = {
            let mut st = self.state.lock();
            self.wait_quiescent(&mut st);
            let error = st.error.take();
            let completed = st.completed.take();
            let notify = update
                && error.is_none()
                && completed == Some(TransactionKind::Read)
                && !st.mapped.is_empty();
            (error, notify)
        };

        if let Some(error) = error {
            return Err(self.error(error));
        }
        if notify {
            for variable in self.variables() {
                variable.block_updated();
            }
        }
        Ok(())
    }

    /// Start a transaction and wait for it
    pub fn blocking_transaction(&self, kind: TransactionKind) -> Result<()> {
        match self.start_transaction_tracked(kind)? {
            Some(id) => self.wait_transaction(id),
            None => Ok(()),
        }
    }

    /// [`blocking_transaction`](Self::blocking_transaction), re-issued up to
    /// `retries` times after a timeout
    pub fn blocking_transaction_with_retry(&self, kind: TransactionKind, retries: u32) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.blocking_transaction(kind) {
                Err(e) if e.is_timeout() && attempt < retries => {
                    attempt += 1;
                    tracing::debug!(path = self.path(), "Retrying {} ({}/{})", kind, attempt, retries);
                }
                other => return other,
            }
        }
    }
}

impl TransactionSink for Block {
    fn transaction_done(&self, id: TransactionId, result: TransactionResult) {
        let mut st = self.state.lock();
        let Some(pending) = st.pending.filter(|p| p.id == id) else {
            tracing::trace!(path = self.path(), id, "Ignoring stale completion");
            return;
        };
        st.pending = None;

        let mut error = None;
        match result {
            Err(e) => {
                st.stats.errors += 1;
                error = Some(e);
            }
            Ok(data) => match pending.kind {
                TransactionKind::Read | TransactionKind::Verify => match data {
                    Some(bytes) if bytes.len() >= st.size => {
                        let size = st.size;
                        if pending.kind == TransactionKind::Read {
                            st.data.copy_from_slice(&bytes[..size]);
                        } else {
                            st.verify_data.copy_from_slice(&bytes[..size]);
                            let mismatch = (0..size).find(|&i| {
                                st.data[i] & st.verify_mask[i] != st.verify_data[i] & st.verify_mask[i]
                            });
                            if let Some(offset) = mismatch {
                                st.stats.verify_failures += 1;
                                error = Some(TransactionError::Verify {
                                    offset,
                                    expected: st.data[offset] & st.verify_mask[offset],
                                    actual: st.verify_data[offset] & st.verify_mask[offset],
                                });
                            }
                        }
                    }
                    other => {
                        error = Some(TransactionError::Size(format!(
                            "expected {} bytes, got {}",
                            st.size,
                            other.map_or(0, |b| b.len())
                        )));
                    }
                },
                TransactionKind::Write | TransactionKind::Post => st.stale = false,
            },
        }
        st.finish(id, pending.kind, error);
        self.cond.notify_all();
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("offset", &self.offset)
            .field("address", &self.address())
            .field("size", &self.size())
            .finish()
    }
}
