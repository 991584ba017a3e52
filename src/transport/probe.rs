//! Debug probe transport
//!
//! Reaches registers of a target behind an SWD/JTAG debug port (a soft core or an
//! AXI bridge that exposes the register space to the debug access port). The
//! probe-rs [`Session`] is owned by a worker thread; Blocks hand it transactions
//! through a crossbeam channel and completions are delivered from that thread.
//!
//! # Example
//!
//! ```ignore
//! use regtree_rs::config::ProbeConfig;
//! use regtree_rs::transport::ProbeTransport;
//!
//! for info in ProbeTransport::list_probes() {
//!     println!("Found: {}", info);
//! }
//! let transport = ProbeTransport::connect(&ProbeConfig::default())?;
//! ```

use super::{Transaction, TransactionKind, Transport};
use crate::config::{ProbeConfig, ProbeProtocol};
use crate::error::{RegError, Result, TransactionError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use probe_rs::{probe::list::Lister, MemoryInterface, Permissions, Session};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// Information about a detected probe
#[derive(Debug, Clone)]
pub struct ProbeInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    pub probe_type: String,
}

impl std::fmt::Display for ProbeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({:04x}:{:04x})",
            self.probe_type, self.vendor_id, self.product_id
        )?;
        if let Some(serial) = &self.serial_number {
            write!(f, " - {}", serial)?;
        }
        Ok(())
    }
}

/// Counters for probe traffic
#[derive(Debug, Clone, Default)]
pub struct ProbeStats {
    pub reads: u64,
    pub writes: u64,
    pub failures: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Time spent inside probe-rs memory calls, in microseconds
    pub busy_time_us: u64,
}

/// Transport that executes transactions through a debug probe
pub struct ProbeTransport {
    endpoint: u64,
    sender: Sender<Transaction>,
    worker: Option<JoinHandle<()>>,
    stats: Arc<Mutex<ProbeStats>>,
}

impl ProbeTransport {
    /// List all available probes
    pub fn list_probes() -> Vec<ProbeInfo> {
        Lister::new()
            .list_all()
            .into_iter()
            .map(|probe| ProbeInfo {
                vendor_id: probe.vendor_id,
                product_id: probe.product_id,
                serial_number: probe.serial_number.clone(),
                probe_type: probe.probe_type().to_string(),
            })
            .collect()
    }

    /// Open a probe, attach to the target and start the worker thread
    pub fn connect(config: &ProbeConfig) -> Result<Self> {
        tracing::info!(
            "Connecting probe: target={}, speed={}kHz, protocol={}",
            config.target_chip,
            config.speed_khz,
            config.protocol
        );

        let probes = Lister::new().list_all();
        if probes.is_empty() {
            return Err(RegError::Config("No probes found".to_string()));
        }

        let info = match &config.probe_selector {
            Some(selector) => {
                let wanted = selector.to_lowercase();
                probes
                    .into_iter()
                    .find(|p| {
                        format!("{:04x}:{:04x}", p.vendor_id, p.product_id) == wanted
                            || p.serial_number
                                .as_ref()
                                .is_some_and(|s| s.to_lowercase().contains(&wanted))
                    })
                    .ok_or_else(|| RegError::Config(format!("Probe not found: {}", selector)))?
            }
            None => probes
                .into_iter()
                .next()
                .ok_or_else(|| RegError::Config("No probes available".to_string()))?,
        };

        let mut probe = info.open()?;
        if let Err(e) = probe.set_speed(config.speed_khz) {
            tracing::warn!("Failed to set probe speed: {}", e);
        }
        let protocol = match config.protocol {
            ProbeProtocol::Swd => probe_rs::probe::WireProtocol::Swd,
            ProbeProtocol::Jtag => probe_rs::probe::WireProtocol::Jtag,
        };
        probe.select_protocol(protocol)?;

        let target = probe_rs::config::Registry::from_builtin_families()
            .get_target_by_name(&config.target_chip)?;
        let session = probe.attach(target, Permissions::default())?;
        tracing::info!("Attached to target: {}", config.target_chip);

        Self::spawn(session, config.core_index)
    }

    fn spawn(session: Session, core_index: usize) -> Result<Self> {
        let endpoint = super::next_endpoint_id();
        let (sender, receiver) = unbounded::<Transaction>();
        let stats = Arc::new(Mutex::new(ProbeStats::default()));
        let worker_stats = stats.clone();

        let worker = std::thread::Builder::new()
            .name(format!("probe-{}", endpoint))
            .spawn(move || worker_loop(session, core_index, receiver, worker_stats))?;

        Ok(Self {
            endpoint,
            sender,
            worker: Some(worker),
            stats,
        })
    }

    pub fn stats(&self) -> ProbeStats {
        self.stats.lock().clone()
    }
}

fn worker_loop(
    mut session: Session,
    core_index: usize,
    receiver: Receiver<Transaction>,
    stats: Arc<Mutex<ProbeStats>>,
) {
    for txn in receiver {
        let started = Instant::now();
        let result = execute(&mut session, core_index, &txn);
        let elapsed = started.elapsed().as_micros() as u64;

        {
            let mut stats = stats.lock();
            stats.busy_time_us += elapsed;
            match (&result, txn.kind.is_read()) {
                (Err(_), _) => stats.failures += 1,
                (Ok(_), true) => {
                    stats.reads += 1;
                    stats.bytes_read += txn.size() as u64;
                }
                (Ok(_), false) => {
                    stats.writes += 1;
                    stats.bytes_written += txn.size() as u64;
                }
            }
        }

        if let Err(e) = &result {
            tracing::debug!(address = txn.address, "Probe {} failed: {}", txn.kind, e);
        }
        txn.into_completion().complete(result);
    }
    tracing::debug!("Probe worker stopped");
}

fn execute(
    session: &mut Session,
    core_index: usize,
    txn: &Transaction,
) -> std::result::Result<Option<Vec<u8>>, TransactionError> {
    let mut core = session
        .core(core_index)
        .map_err(|e| TransactionError::Transport(e.to_string()))?;

    match txn.kind {
        TransactionKind::Read | TransactionKind::Verify => {
            let mut buffer = vec![0u8; txn.size()];
            core.read(txn.address, &mut buffer)
                .map_err(|e| TransactionError::Transport(e.to_string()))?;
            Ok(Some(buffer))
        }
        TransactionKind::Write | TransactionKind::Post => {
            core.write_8(txn.address, &txn.data)
                .map_err(|e| TransactionError::Transport(e.to_string()))?;
            Ok(None)
        }
    }
}

impl Transport for ProbeTransport {
    fn endpoint_id(&self) -> u64 {
        self.endpoint
    }

    fn request(&self, transaction: Transaction) {
        submit(&self.sender, transaction);
    }
}

/// Queue a transaction for the worker, failing it when the worker is gone
fn submit(sender: &Sender<Transaction>, transaction: Transaction) {
    if let Err(e) = sender.send(transaction) {
        e.into_inner()
            .fail(TransactionError::Transport("probe worker stopped".to_string()));
    }
}

impl Drop for ProbeTransport {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop
        let (closed, _) = unbounded();
        drop(std::mem::replace(&mut self.sender, closed));
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("Probe worker panicked");
            }
        }
    }
}
