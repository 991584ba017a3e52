//! Batching of variable updates
//!
//! Every value change goes through [`UpdateAggregator::record`]. Outside a batch
//! the change is flushed on its own; inside one (see [`UpdateAggregator::scope`])
//! changes are collected per thread, keyed by variable path, so a path recorded
//! twice is delivered once with its latest value.
//!
//! Flushed batches go to a bounded queue drained by a single consumer thread.
//! For every batch the consumer:
//!
//! 1. calls each variable's own listeners,
//! 2. calls every batch listener in registration order,
//! 3. calls every batch-complete callback.
//!
//! A panicking listener is logged and skipped. Before [`start`](UpdateAggregator::start)
//! and after [`stop`](UpdateAggregator::stop) batches are dispatched on the
//! flushing thread.

use crate::codec::Value;
use crate::config::UpdateConfig;
use crate::error::Result;
use crate::variable::Variable;
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// One entry of a flushed batch
#[derive(Clone)]
pub struct Update {
    pub path: String,
    pub value: Value,
    pub variable: Arc<Variable>,
}

impl std::fmt::Debug for Update {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Update")
            .field("path", &self.path)
            .field("value", &self.value)
            .finish()
    }
}

pub type BatchListener = Arc<dyn Fn(&[Update]) + Send + Sync>;
pub type DoneCallback = Arc<dyn Fn() + Send + Sync>;

/// Open batch of one thread
struct ThreadBatch {
    depth: usize,
    /// Smallest non-zero trickle period requested by any nesting level
    period: Option<Duration>,
    last_flush: Instant,
    pending: BTreeMap<String, Update>,
}

impl ThreadBatch {
    fn trickle_due(&self) -> bool {
        !self.pending.is_empty()
            && self
                .period
                .is_some_and(|period| self.last_flush.elapsed() >= period)
    }

    fn take(&mut self) -> Vec<Update> {
        self.last_flush = Instant::now();
        std::mem::take(&mut self.pending).into_values().collect()
    }
}

#[derive(Default)]
struct Dispatcher {
    listeners: Mutex<Vec<BatchListener>>,
    done: Mutex<Vec<DoneCallback>>,
}

impl Dispatcher {
    fn dispatch(&self, batch: &[Update]) {
        for update in batch {
            update.variable.fire_listeners(&update.value);
        }

        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(batch))).is_err() {
                tracing::error!("Batch listener panicked ({} updates)", batch.len());
            }
        }

        let done = self.done.lock().clone();
        for callback in done {
            if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                tracing::error!("Batch-complete callback panicked");
            }
        }
    }
}

enum Message {
    Batch(Vec<Update>),
    Sync(Sender<()>),
}

struct Worker {
    tx: Sender<Message>,
    thread: ThreadId,
    handle: JoinHandle<()>,
}

/// Thread-scoped coalescing of variable updates
pub struct UpdateAggregator {
    batches: Mutex<HashMap<ThreadId, ThreadBatch>>,
    dispatcher: Arc<Dispatcher>,
    worker: Mutex<Option<Worker>>,
    config: UpdateConfig,
}

impl UpdateAggregator {
    pub fn new(config: UpdateConfig) -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(HashMap::new()),
            dispatcher: Arc::new(Dispatcher::default()),
            worker: Mutex::new(None),
            config,
        })
    }

    /// Start the consumer thread
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let (tx, rx) = bounded::<Message>(self.config.channel_capacity.max(1));
        let dispatcher = self.dispatcher.clone();
        let handle = std::thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || {
                for message in rx.iter() {
                    match message {
                        Message::Batch(batch) => dispatcher.dispatch(&batch),
                        Message::Sync(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
                tracing::debug!("Update consumer exiting");
            })?;

        *worker = Some(Worker {
            tx,
            thread: handle.thread().id(),
            handle,
        });
        Ok(())
    }

    /// Stop the consumer thread after it dispatched everything queued
    pub fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let Worker { tx, handle, thread } = worker;
        drop(tx);
        if std::thread::current().id() == thread {
            return;
        }
        if handle.join().is_err() {
            tracing::error!("Update consumer panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    pub fn add_batch_listener<F>(&self, listener: F)
    where
        F: Fn(&[Update]) + Send + Sync + 'static,
    {
        self.dispatcher.listeners.lock().push(Arc::new(listener));
    }

    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.dispatcher.done.lock().push(Arc::new(callback));
    }

    /// Open a batch on the calling thread
    ///
    /// Batches nest; the pending set is flushed when the outermost level exits,
    /// or earlier once `period` (if non-zero) has passed since the last flush.
    pub fn enter_batch(&self, period: Duration) {
        let mut batches = self.batches.lock();
        let batch = batches
            .entry(std::thread::current().id())
            .or_insert_with(|| ThreadBatch {
                depth: 0,
                period: None,
                last_flush: Instant::now(),
                pending: BTreeMap::new(),
            });
        batch.depth += 1;
        if !period.is_zero() {
            batch.period = Some(batch.period.map_or(period, |p| p.min(period)));
        }
    }

    /// Close one level of the calling thread's batch
    pub fn exit_batch(&self) {
        let flushed = {
            let mut batches = self.batches.lock();
            let id = std::thread::current().id();
            let Some(batch) = batches.get_mut(&id) else {
                tracing::warn!("exit_batch without a matching enter_batch");
                return;
            };
            batch.depth -= 1;
            if batch.depth > 0 {
                batch.trickle_due().then(|| batch.take())
            } else {
                batches.remove(&id).map(|mut b| b.take())
            }
        };
        if let Some(batch) = flushed {
            self.flush(batch);
        }
    }

    /// Batch scope closed on drop
    pub fn scope(&self, period: Duration) -> UpdateScope<'_> {
        self.enter_batch(period);
        UpdateScope { aggregator: self }
    }

    /// Depth of the calling thread's batch (0 outside any batch)
    pub fn depth(&self) -> usize {
        self.batches
            .lock()
            .get(&std::thread::current().id())
            .map_or(0, |b| b.depth)
    }

    /// Record a new value of `variable`
    pub fn record(&self, variable: &Arc<Variable>, value: Value) {
        let update = Update {
            path: variable.path().to_string(),
            value,
            variable: variable.clone(),
        };
        let flushed = {
            let mut batches = self.batches.lock();
            match batches.get_mut(&std::thread::current().id()) {
                Some(batch) => {
                    batch.pending.insert(update.path.clone(), update);
                    batch.trickle_due().then(|| batch.take())
                }
                None => Some(vec![update]),
            }
        };
        if let Some(batch) = flushed {
            self.flush(batch);
        }
    }

    fn flush(&self, batch: Vec<Update>) {
        if batch.is_empty() {
            return;
        }
        tracing::trace!("Flushing {} updates", batch.len());

        let tx = {
            let worker = self.worker.lock();
            worker
                .as_ref()
                .filter(|w| w.thread != std::thread::current().id())
                .map(|w| w.tx.clone())
        };
        match tx {
            Some(tx) => {
                if let Err(e) = tx.send(Message::Batch(batch)) {
                    if let Message::Batch(batch) = e.into_inner() {
                        self.dispatcher.dispatch(&batch);
                    }
                }
            }
            // No consumer, or a listener recording from the consumer itself
            None => self.dispatcher.dispatch(&batch),
        }
    }

    /// Wait until every batch queued so far was dispatched
    pub fn flush_sync(&self) {
        let tx = {
            let worker = self.worker.lock();
            worker
                .as_ref()
                .filter(|w| w.thread != std::thread::current().id())
                .map(|w| w.tx.clone())
        };
        let Some(tx) = tx else {
            return;
        };
        let (ack_tx, ack_rx) = bounded(1);
        if tx.send(Message::Sync(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }
}

impl Drop for UpdateAggregator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Guard returned by [`UpdateAggregator::scope`]
pub struct UpdateScope<'a> {
    aggregator: &'a UpdateAggregator,
}

impl Drop for UpdateScope<'_> {
    fn drop(&mut self) {
        self.aggregator.exit_batch();
    }
}
