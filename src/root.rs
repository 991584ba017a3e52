//! Top of a register tree
//!
//! A [`Root`] owns the top-level [`Device`], the [`UpdateAggregator`] and the
//! [`Poller`]. Build the tree with [`add_device`](Root::add_device) and
//! [`add_variable`](Root::add_variable), then call [`start`](Root::start):
//!
//! 1. paths and absolute addresses are assigned and blocks get their transports,
//! 2. overlapping blocks on one endpoint abort activation,
//! 3. the update consumer starts and every variable is registered for polling,
//! 4. the tree is read once (optional) and the poll thread starts (optional).
//!
//! # Example
//!
//! ```ignore
//! use regtree_rs::prelude::*;
//!
//! let transport = Arc::new(MemoryTransport::new().with_region(0, 0x1000));
//! let mut root = Root::new("Top", EngineConfig::default()).with_transport(transport);
//! let mut dev = Device::new("Dev").with_offset(0x100);
//! dev.add_variable(VariableBuilder::remote("Ctrl", 0x0).uint(32).build()?)?;
//! root.add_device(dev)?;
//! root.start()?;
//!
//! let ctrl = root.variable("Dev.Ctrl").unwrap();
//! ctrl.set(0x1234ABCDu32, true);
//! ```

use crate::aggregator::{Update, UpdateAggregator};
use crate::block::Mode;
use crate::codec::Value;
use crate::config::EngineConfig;
use crate::device::{check_overlaps, ActivationContext, Device, Node, ResetKind};
use crate::error::{RegError, Result};
use crate::poller::Poller;
use crate::transport::{TransactionKind, Transport};
use crate::variable::{RemoteVariableInfo, Variable};
use serde_json::Map;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Register tree root
pub struct Root {
    tree: Device,
    config: EngineConfig,
    aggregator: Arc<UpdateAggregator>,
    poller: Arc<Poller>,
    started: AtomicBool,
}

impl Root {
    pub fn new(name: impl Into<String>, config: EngineConfig) -> Self {
        let aggregator = UpdateAggregator::new(config.update.clone());
        let poller = Poller::new(aggregator.clone(), config.poll.clone());
        Self {
            tree: Device::new(name),
            config,
            aggregator,
            poller,
            started: AtomicBool::new(false),
        }
    }

    /// Default transport of the whole tree
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.tree.set_transport(transport);
        self
    }

    pub fn name(&self) -> &str {
        self.tree.name()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.tree
    }

    pub fn poller(&self) -> &Arc<Poller> {
        &self.poller
    }

    pub fn aggregator(&self) -> &Arc<UpdateAggregator> {
        &self.aggregator
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn add_device(&mut self, device: Device) -> Result<Arc<Device>> {
        self.tree.add_device(device)
    }

    pub fn add_variable(&mut self, variable: Arc<Variable>) -> Result<()> {
        self.tree.add_variable(variable)
    }

    /// Activate the tree and start the background threads
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(RegError::Node(format!("{} is already started", self.name())));
        }

        let ctx = ActivationContext {
            aggregator: self.aggregator.clone(),
            poller: Arc::downgrade(&self.poller),
            retries: self.config.transaction.retry_count,
            timeout: self.config.transaction.timeout(),
        };
        self.tree.activate(None, 0, None, None, &ctx)?;
        if self.config.startup.check_overlaps {
            check_overlaps(self.tree.block_extents())?;
        }

        self.aggregator.start()?;
        let variables = self.variables();
        for variable in &variables {
            self.poller.recompute_interval(variable);
        }

        if self.config.startup.initial_read {
            if let Err(e) = self.read_all() {
                tracing::warn!("Initial read of {} failed: {}", self.name(), e);
            }
        }
        if self.config.poll.enabled {
            self.poller.start()?;
        }

        tracing::info!(
            "Started {} ({} variables, {} polled targets)",
            self.name(),
            variables.len(),
            self.poller.len()
        );
        Ok(())
    }

    /// Stop polling and dispatch every pending update
    pub fn stop(&self) {
        self.poller.stop();
        self.aggregator.flush_sync();
        self.aggregator.stop();
    }

    fn relative<'a>(&self, path: &'a str) -> &'a str {
        path.strip_prefix(self.name())
            .and_then(|rest| rest.strip_prefix('.'))
            .unwrap_or(path)
    }

    /// Look up a node by dotted path, with or without the root name
    pub fn get_node(&self, path: &str) -> Option<Node> {
        self.tree.get_node(self.relative(path))
    }

    pub fn variable(&self, path: &str) -> Option<Arc<Variable>> {
        self.get_node(path)?.as_variable().cloned()
    }

    /// Every variable in tree order
    pub fn variables(&self) -> Vec<Arc<Variable>> {
        let mut out = Vec::new();
        self.tree.collect_variables(&mut out);
        out
    }

    fn bulk(&self, kind: TransactionKind, force: bool) -> Result<()> {
        let _gate = self.poller.guard();
        let _scope = self.aggregator.scope(Duration::ZERO);
        let started = self.tree.run_background_transaction(kind, force);
        let checked = self.tree.check_all(kind == TransactionKind::Read);
        started.and(checked)
    }

    /// Read every readable block and refresh its variables
    pub fn read_all(&self) -> Result<()> {
        self.bulk(TransactionKind::Read, false)
    }

    /// Write blocks with pending changes, or every writable block with `force`
    pub fn write_all(&self, force: bool) -> Result<()> {
        self.bulk(TransactionKind::Write, force)
    }

    /// Read back every RW block and compare under its verify mask
    pub fn verify_all(&self) -> Result<()> {
        self.bulk(TransactionKind::Verify, false)
    }

    /// Visit the address-map row of every bound remote variable
    pub fn for_each_remote_variable<F>(&self, mut visitor: F)
    where
        F: FnMut(&RemoteVariableInfo),
    {
        for variable in self.variables() {
            if let Some(info) = variable.remote_info() {
                visitor(&info);
            }
        }
    }

    pub fn add_batch_listener<F>(&self, listener: F)
    where
        F: Fn(&[Update]) + Send + Sync + 'static,
    {
        self.aggregator.add_batch_listener(listener);
    }

    pub fn add_batch_done_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.aggregator.add_done_callback(callback);
    }

    pub fn reset(&self, kind: ResetKind) {
        tracing::info!("{:?} reset of {}", kind, self.name());
        self.tree.reset(kind);
    }

    /// Cached values of variables in `modes` as a nested map of display strings
    ///
    /// The top-level key is the root name; list values become JSON arrays.
    pub fn export_values(&self, modes: &[Mode]) -> serde_json::Value {
        let mut top = Map::new();
        for variable in self.variables() {
            if !modes.contains(&variable.mode()) {
                continue;
            }
            let leaf = match variable.value() {
                Value::List(items) => serde_json::Value::Array(
                    items
                        .iter()
                        .map(|v| serde_json::Value::String(variable.to_display(v)))
                        .collect(),
                ),
                v => serde_json::Value::String(variable.to_display(&v)),
            };
            insert_path(&mut top, variable.path(), leaf);
        }
        serde_json::Value::Object(top)
    }

    /// Set variables from a nested map as produced by [`export_values`](Self::export_values)
    ///
    /// Values are staged without hardware access; with `write` one
    /// [`write_all`](Self::write_all) follows. Unknown paths and unparsable
    /// values are logged and skipped; the number of variables set is returned.
    pub fn apply_values(&self, values: &serde_json::Value, write: bool) -> Result<usize> {
        let serde_json::Value::Object(map) = values else {
            return Err(RegError::Format("expected a mapping of paths to values".into()));
        };

        let mut leaves = Vec::new();
        collect_leaves(map, String::new(), &mut leaves);

        let _gate = self.poller.guard();
        let _scope = self.aggregator.scope(Duration::ZERO);
        let mut applied = 0;
        for (path, text) in leaves {
            let Some(variable) = self.variable(&path) else {
                tracing::warn!("No variable at {}", path);
                continue;
            };
            match variable.try_set_disp(&text, false) {
                Ok(()) => applied += 1,
                Err(e) => tracing::warn!("Failed to apply {} = {}: {}", path, text, e),
            }
        }
        if write {
            self.write_all(false)?;
        }
        Ok(applied)
    }
}

impl Drop for Root {
    fn drop(&mut self) {
        if self.is_started() {
            self.stop();
        }
    }
}

fn insert_path(map: &mut Map<String, serde_json::Value>, path: &str, leaf: serde_json::Value) {
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), leaf);
        }
        Some((head, rest)) => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| serde_json::Value::Object(Map::new()));
            if let serde_json::Value::Object(child) = child {
                insert_path(child, rest, leaf);
            }
        }
    }
}

fn display_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(display_text).collect();
            format!("[{}]", parts.join(", "))
        }
        other => other.to_string(),
    }
}

fn collect_leaves(
    map: &Map<String, serde_json::Value>,
    prefix: String,
    out: &mut Vec<(String, String)>,
) {
    for (key, value) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            serde_json::Value::Object(child) => collect_leaves(child, path, out),
            leaf => out.push((path, display_text(leaf))),
        }
    }
}
