//! Background polling of blocks and getter-backed variables
//!
//! The [`Poller`] keeps one entry per polled target in a [`PollQueue`], a
//! min-heap on due time. Its thread sleeps until the earliest entry is due (or
//! the schedule changes), then drains every due entry inside one update batch:
//!
//! ```text
//! wait ──► pop due ──► start Reads ──► reschedule ──► check Reads ──► wait
//! ```
//!
//! A block is polled at the shortest interval any of its variables (or
//! anything derived from them) asks for. Linked variables are polled through
//! the variables they depend on.
//!
//! Bulk foreground operations hold a [`PollBlockGuard`] so the poller starts no
//! new reads while they run; due times are kept meanwhile.

use crate::aggregator::UpdateAggregator;
use crate::block::Block;
use crate::config::PollConfig;
use crate::error::Result;
use crate::transport::TransactionKind;
use crate::variable::Variable;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Identity of a polled target
pub type PollKey = usize;

/// Key of a block, stable for the block's lifetime
pub fn block_key(block: &Arc<Block>) -> PollKey {
    Arc::as_ptr(block) as *const () as usize
}

pub fn variable_key(variable: &Arc<Variable>) -> PollKey {
    Arc::as_ptr(variable) as *const () as usize
}

/// `now` moved forward to the next whole wall-clock second
pub fn next_whole_second(now: Instant) -> Instant {
    let subsec = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    if subsec == 0 {
        now
    } else {
        now + Duration::from_nanos(1_000_000_000 - u64::from(subsec))
    }
}

struct Entry<T> {
    key: PollKey,
    target: T,
    interval: Duration,
}

/// A due entry handed out by [`PollQueue::pop_due`]
#[derive(Debug, Clone)]
pub struct DueEntry<T> {
    pub key: PollKey,
    pub target: T,
    pub interval: Duration,
    pub due: Instant,
}

/// Min-heap of poll entries with lazy replacement
///
/// Replacing or removing a key only forgets its live sequence number; the old
/// heap node is discarded when it reaches the top.
pub struct PollQueue<T> {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, Entry<T>>,
    live: HashMap<PollKey, u64>,
    next_seq: u64,
}

impl<T> Default for PollQueue<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            live: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<T: Clone> PollQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `key`
    pub fn insert(&mut self, key: PollKey, target: T, interval: Duration, due: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(old) = self.live.insert(key, seq) {
            self.entries.remove(&old);
        }
        self.entries.insert(
            seq,
            Entry {
                key,
                target,
                interval,
            },
        );
        self.heap.push(Reverse((due, seq)));
    }

    pub fn remove(&mut self, key: PollKey) -> bool {
        match self.live.remove(&key) {
            Some(seq) => {
                self.entries.remove(&seq);
                true
            }
            None => false,
        }
    }

    fn discard_dead(&mut self) {
        while let Some(Reverse((_, seq))) = self.heap.peek() {
            if self.entries.contains_key(seq) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Due time of the earliest live entry
    pub fn next_due(&mut self) -> Option<Instant> {
        self.discard_dead();
        self.heap.peek().map(|Reverse((due, _))| *due)
    }

    /// Remove and return every live entry due at `now`, earliest first
    pub fn pop_due(&mut self, now: Instant) -> Vec<DueEntry<T>> {
        let mut due_entries = Vec::new();
        while let Some(due) = self.next_due() {
            if due > now {
                break;
            }
            let Some(Reverse((due, seq))) = self.heap.pop() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&seq) {
                self.live.remove(&entry.key);
                due_entries.push(DueEntry {
                    key: entry.key,
                    target: entry.target,
                    interval: entry.interval,
                    due,
                });
            }
        }
        due_entries
    }

    pub fn interval(&self, key: PollKey) -> Option<Duration> {
        let seq = self.live.get(&key)?;
        self.entries.get(seq).map(|e| e.interval)
    }

    pub fn contains(&self, key: PollKey) -> bool {
        self.live.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

/// Something the poller refreshes
#[derive(Clone)]
pub enum PollTarget {
    Block(Arc<Block>),
    /// A local variable with a getter
    Variable(Arc<Variable>),
}

impl std::fmt::Debug for PollTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollTarget::Block(b) => write!(f, "Block({})", b.path()),
            PollTarget::Variable(v) => write!(f, "Variable({})", v.path()),
        }
    }
}

struct PollState {
    queue: PollQueue<PollTarget>,
    paused: bool,
    stop: bool,
    blocked: usize,
}

/// Background poll scheduler
pub struct Poller {
    state: Mutex<PollState>,
    cond: Condvar,
    aggregator: Arc<UpdateAggregator>,
    config: PollConfig,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Poller {
    pub fn new(aggregator: Arc<UpdateAggregator>, config: PollConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PollState {
                queue: PollQueue::new(),
                paused: false,
                stop: false,
                blocked: 0,
            }),
            cond: Condvar::new(),
            aggregator,
            config,
            handle: Mutex::new(None),
        })
    }

    /// Start the poll thread
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Ok(());
        }
        self.state.lock().stop = false;

        let poller = self.clone();
        *handle = Some(
            std::thread::Builder::new()
                .name(self.config.thread_name.clone())
                .spawn(move || poller.run())?,
        );
        tracing::info!("Poll thread started");
        Ok(())
    }

    /// Stop the poll thread; reads already started complete on their own
    pub fn stop(&self) {
        {
            let mut st = self.state.lock();
            st.stop = true;
            self.cond.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Poll thread panicked");
            }
            tracing::info!("Poll thread stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    pub fn pause(&self) {
        self.set_paused(true);
    }

    pub fn resume(&self) {
        self.set_paused(false);
    }

    pub fn set_paused(&self, paused: bool) {
        let mut st = self.state.lock();
        st.paused = paused;
        self.cond.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Hold off new poll reads until the matching [`block_decrement`](Self::block_decrement)
    pub fn block_increment(&self) {
        self.state.lock().blocked += 1;
    }

    pub fn block_decrement(&self) {
        let mut st = self.state.lock();
        st.blocked = st.blocked.saturating_sub(1);
        if st.blocked == 0 {
            self.cond.notify_all();
        }
    }

    /// [`block_increment`](Self::block_increment) released on drop
    pub fn guard(&self) -> PollBlockGuard<'_> {
        self.block_increment();
        PollBlockGuard { poller: self }
    }

    /// Schedule `target` under `key` every `interval`, first at the next whole second
    pub fn add_or_replace(&self, key: PollKey, target: PollTarget, interval: Duration) {
        let mut st = self.state.lock();
        let due = next_whole_second(Instant::now());
        tracing::debug!("Polling {:?} every {:?}", target, interval);
        st.queue.insert(key, target, interval, due);
        self.cond.notify_all();
    }

    pub fn remove(&self, key: PollKey) {
        let mut st = self.state.lock();
        if st.queue.remove(key) {
            self.cond.notify_all();
        }
    }

    /// Recompute a block's interval from its variables' demand
    pub fn update_block(&self, block: &Arc<Block>) {
        let demand = block
            .variables()
            .iter()
            .filter_map(|v| v.poll_demand())
            .min();
        let key = block_key(block);
        match demand {
            Some(interval) if block.mode().allows(TransactionKind::Read) => {
                if self.interval(key) != Some(interval) {
                    self.add_or_replace(key, PollTarget::Block(block.clone()), interval);
                }
            }
            _ => self.remove(key),
        }
    }

    /// Reschedule whatever backs `variable` after its poll interval changed
    pub fn recompute_interval(&self, variable: &Arc<Variable>) {
        if let Some(block) = variable.block() {
            self.update_block(block);
        } else if !variable.dependencies().is_empty() {
            for dependency in variable.dependencies() {
                self.recompute_interval(dependency);
            }
        } else if variable.has_getter() {
            let key = variable_key(variable);
            match variable.poll_demand() {
                Some(interval) => {
                    if self.interval(key) != Some(interval) {
                        self.add_or_replace(key, PollTarget::Variable(variable.clone()), interval);
                    }
                }
                None => self.remove(key),
            }
        }
    }

    /// Current interval scheduled under `key`
    pub fn interval(&self, key: PollKey) -> Option<Duration> {
        self.state.lock().queue.interval(key)
    }

    pub fn block_interval(&self, block: &Arc<Block>) -> Option<Duration> {
        self.interval(block_key(block))
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn run(&self) {
        let mut st = self.state.lock();
        loop {
            if st.stop {
                break;
            }
            if st.paused || st.blocked > 0 {
                self.cond.wait(&mut st);
                continue;
            }
            match st.queue.next_due() {
                None => {
                    self.cond.wait(&mut st);
                    continue;
                }
                Some(due) if due > Instant::now() => {
                    self.cond.wait_until(&mut st, due);
                    continue;
                }
                Some(_) => {}
            }

            let now = Instant::now();
            let drained = st.queue.pop_due(now);
            for entry in &drained {
                let mut next = entry.due + entry.interval;
                while next <= now {
                    next += entry.interval;
                }
                st.queue
                    .insert(entry.key, entry.target.clone(), entry.interval, next);
            }
            MutexGuard::unlocked(&mut st, || self.drain(&drained));
        }
        tracing::debug!("Poll loop exiting");
    }

    fn drain(&self, entries: &[DueEntry<PollTarget>]) {
        let _scope = self.aggregator.scope(self.config.flush_period());

        let mut started = Vec::new();
        for entry in entries {
            match &entry.target {
                PollTarget::Block(block) => match block.start_transaction(TransactionKind::Read) {
                    Ok(()) => started.push(block),
                    Err(e) => tracing::warn!("Poll of {} failed to start: {}", block.path(), e),
                },
                PollTarget::Variable(variable) => variable.poll(),
            }
        }
        for block in started {
            if let Err(e) = block.check_transaction(true) {
                tracing::warn!("Poll of {} failed: {}", block.path(), e);
            }
        }
    }
}

/// Guard returned by [`Poller::guard`]
pub struct PollBlockGuard<'a> {
    poller: &'a Poller,
}

impl Drop for PollBlockGuard<'_> {
    fn drop(&mut self) {
        self.poller.block_decrement();
    }
}
