//! Named, typed views of register bits or software state
//!
//! A [`Variable`] is one of three storage kinds:
//!
//! - **Remote**: bits of a [`Block`]; `set`/`get` go through the block's buffer
//!   and transactions.
//! - **Local**: a value held in software, optionally computed by a getter and
//!   applied by a [`Setter`].
//! - **Linked**: derived from other variables through a getter; recomputed and
//!   re-announced whenever a dependency updates.
//!
//! Foreground `set`/`get` log failures instead of returning them so that one
//! broken register does not abort a bulk pass; `try_set`/`try_get` return the
//! typed error.
//!
//! # Example
//!
//! ```ignore
//! use regtree_rs::variable::VariableBuilder;
//!
//! let status = VariableBuilder::remote("Status", 0x100)
//!     .uint(32)
//!     .verify(true)
//!     .poll_interval(Duration::from_secs(1))
//!     .build()?;
//! status.set(0x1234_ABCDu32, true);
//! ```

use crate::aggregator::UpdateAggregator;
use crate::block::{self, BitLayout, Block, ListLayout, Mode};
use crate::codec::{self, Codec, CodecKind, CodecSpec, Endian, Value};
use crate::error::{RegError, Result};
use crate::poller::Poller;
use crate::transport::TransactionKind;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

/// Device-level hook run around transactions (deduplicated by identity)
pub type Hook = Arc<dyn Fn() + Send + Sync>;

/// Callback receiving `(path, value)` on every update
pub type Listener = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Computes the value of a local or linked variable
pub type Getter = Arc<dyn Fn() -> anyhow::Result<Value> + Send + Sync>;

/// Applies a value written to a local or linked variable
pub type SetFn = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// One step of a command sequence
#[derive(Clone)]
pub enum CommandStep {
    /// Set a variable to a value (with write)
    Set(Arc<Variable>, Value),
    /// Re-write a variable's current value
    Touch(Arc<Variable>),
    /// Write 1 then 0
    Toggle(Arc<Variable>),
    Sleep(Duration),
}

/// How a local or linked variable applies a written value
#[derive(Clone)]
pub enum Setter {
    Callable(SetFn),
    /// Steps run in order; the written value itself is only stored
    Sequence(Vec<CommandStep>),
}

impl Setter {
    fn apply(&self, value: &Value) -> Result<()> {
        match self {
            Setter::Callable(f) => f(value).map_err(|e| RegError::Node(format!("setter failed: {:#}", e))),
            Setter::Sequence(steps) => {
                for step in steps {
                    match step {
                        CommandStep::Set(var, v) => var.try_set(v.clone(), true)?,
                        CommandStep::Touch(var) => var.try_set(var.value(), true)?,
                        CommandStep::Toggle(var) => {
                            var.try_set(Value::UInt(1), true)?;
                            var.try_set(Value::UInt(0), true)?;
                        }
                        CommandStep::Sleep(d) => std::thread::sleep(*d),
                    }
                }
                Ok(())
            }
        }
    }
}

enum Storage {
    Remote {
        layout: BitLayout,
        block: OnceLock<Arc<Block>>,
    },
    Local {
        getter: Option<Getter>,
        setter: Option<Setter>,
    },
    Linked {
        dependencies: Vec<Arc<Variable>>,
        getter: Getter,
        setter: Option<Setter>,
    },
}

/// Engine services a variable reaches once its tree is activated
pub(crate) struct Runtime {
    pub aggregator: Arc<UpdateAggregator>,
    pub poller: Weak<Poller>,
    pub retries: u32,
}

struct Cached {
    value: Value,
    timestamp: Option<DateTime<Utc>>,
}

/// Address-map row for a remote variable
#[derive(Debug, Clone, Serialize)]
pub struct RemoteVariableInfo {
    pub path: String,
    /// Absolute address of the block
    pub address: u64,
    /// Offset of the block within its device
    pub offset: u64,
    pub bit_offsets: Vec<usize>,
    pub bit_sizes: Vec<usize>,
    pub mode: Mode,
    pub verify: bool,
    pub block_size: usize,
    /// Bits of the block owned by this variable
    pub mask: Vec<u8>,
    pub kind: CodecKind,
    pub bit_width: usize,
    pub num_values: usize,
    pub value_stride: usize,
    pub poll_interval_s: f64,
    pub description: String,
}

/// A named value in the device tree
pub struct Variable {
    name: String,
    description: String,
    units: Option<String>,
    mode: Mode,
    codec: Arc<Codec>,
    storage: Storage,
    enum_table: Vec<(Value, String)>,
    before_read: Option<Hook>,
    after_write: Option<Hook>,
    path: OnceLock<String>,
    runtime: OnceLock<Runtime>,
    poll_interval: Mutex<Duration>,
    cache: Mutex<Cached>,
    listeners: Mutex<Vec<Listener>>,
    dependents: Mutex<Vec<Weak<Variable>>>,
}

fn same_value(a: &Value, b: &Value) -> bool {
    match (a.as_i128(), b.as_i128()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

impl Variable {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dotted path from the root, or the name before activation
    pub fn path(&self) -> &str {
        self.path.get().map_or(self.name.as_str(), String::as_str)
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn units(&self) -> Option<&str> {
        self.units.as_deref()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn codec(&self) -> &Arc<Codec> {
        &self.codec
    }

    /// Bit placement, for remote variables
    pub fn layout(&self) -> Option<&BitLayout> {
        match &self.storage {
            Storage::Remote { layout, .. } => Some(layout),
            _ => None,
        }
    }

    /// Block holding this variable, once bound
    pub fn block(&self) -> Option<&Arc<Block>> {
        match &self.storage {
            Storage::Remote { block, .. } => block.get(),
            _ => None,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.storage, Storage::Remote { .. })
    }

    pub fn is_list(&self) -> bool {
        self.layout().is_some_and(|l| l.list.is_some())
    }

    /// Whether a getter computes the value (local and linked variables)
    pub fn has_getter(&self) -> bool {
        match &self.storage {
            Storage::Remote { .. } => false,
            Storage::Local { getter, .. } => getter.is_some(),
            Storage::Linked { .. } => true,
        }
    }

    pub fn dependencies(&self) -> &[Arc<Variable>] {
        match &self.storage {
            Storage::Linked { dependencies, .. } => dependencies,
            _ => &[],
        }
    }

    pub fn before_read_hook(&self) -> Option<&Hook> {
        self.before_read.as_ref()
    }

    pub fn after_write_hook(&self) -> Option<&Hook> {
        self.after_write.as_ref()
    }

    pub fn enum_table(&self) -> &[(Value, String)] {
        &self.enum_table
    }

    /// Last known value, without any transaction
    pub fn value(&self) -> Value {
        self.cache.lock().value.clone()
    }

    /// Time of the last update
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.cache.lock().timestamp
    }

    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Arc::new(listener));
    }

    pub fn poll_interval(&self) -> Duration {
        *self.poll_interval.lock()
    }

    /// Change the poll interval (zero disables polling) and reschedule
    pub fn set_poll_interval(self: &Arc<Self>, interval: Duration) {
        *self.poll_interval.lock() = interval;
        if let Some(poller) = self.runtime.get().and_then(|rt| rt.poller.upgrade()) {
            poller.recompute_interval(self);
        }
    }

    /// Shortest interval this variable or anything derived from it needs
    pub fn poll_demand(&self) -> Option<Duration> {
        let own = self.poll_interval();
        let mut demand = (!own.is_zero()).then_some(own);
        for dependent in self.live_dependents() {
            if let Some(d) = dependent.poll_demand() {
                demand = Some(demand.map_or(d, |cur| cur.min(d)));
            }
        }
        demand
    }

    fn live_dependents(&self) -> Vec<Arc<Variable>> {
        self.dependents.lock().iter().filter_map(Weak::upgrade).collect()
    }

    fn retries(&self) -> u32 {
        self.runtime.get().map_or(0, |rt| rt.retries)
    }

    pub(crate) fn attach_block(&self, new_block: &Arc<Block>) -> Result<()> {
        match &self.storage {
            Storage::Remote { block, .. } => block
                .set(new_block.clone())
                .map_err(|_| RegError::Node(format!("{} is already bound to a block", self.name))),
            _ => Err(RegError::Node(format!("{} is not a remote variable", self.name))),
        }
    }

    pub(crate) fn activate(&self, path: String, runtime: Runtime) -> Result<()> {
        self.path
            .set(path)
            .map_err(|_| RegError::Node(format!("{} is already part of an active tree", self.path())))?;
        // Path is unique per tree, so the runtime is unset here
        let _ = self.runtime.set(runtime);
        Ok(())
    }

    fn remote(&self) -> Result<(&BitLayout, &Arc<Block>)> {
        match &self.storage {
            Storage::Remote { layout, block } => block
                .get()
                .map(|b| (layout, b))
                .ok_or_else(|| RegError::Node(format!("{} is not bound to a block", self.path()))),
            _ => Err(RegError::Node(format!("{} is not a remote variable", self.path()))),
        }
    }

    fn encode(&self, value: &Value) -> Result<Vec<Vec<u8>>> {
        match (self.layout().and_then(|l| l.list), value) {
            (Some(list), Value::List(items)) => {
                if items.len() != list.num_values {
                    return Err(RegError::Format(format!(
                        "{} expects {} values, got {}",
                        self.path(),
                        list.num_values,
                        items.len()
                    )));
                }
                items.iter().map(|v| self.codec.to_bytes(v)).collect()
            }
            (Some(_), other) => Err(RegError::Format(format!(
                "{} expects a list, got {:?}",
                self.path(),
                other
            ))),
            (None, v) => Ok(vec![self.codec.to_bytes(v)?]),
        }
    }

    fn decode(&self, values: Vec<Vec<u8>>) -> Result<Value> {
        let big_endian = self.codec.endian() == Endian::Big;
        let mut decoded = values
            .iter()
            .map(|bytes| {
                let bytes = block::fit_bytes(bytes, self.codec.byte_len(), big_endian);
                self.codec.from_bytes(&bytes)
            })
            .collect::<Result<Vec<Value>>>()?;
        if self.is_list() {
            Ok(Value::List(decoded))
        } else {
            decoded
                .pop()
                .ok_or_else(|| RegError::Format(format!("{} has no value", self.path())))
        }
    }

    /// Set the value, logging any failure
    pub fn set(self: &Arc<Self>, value: impl Into<Value>, write: bool) {
        if let Err(e) = self.try_set(value.into(), write) {
            tracing::error!(path = self.path(), "Failed to set: {}", e);
        }
    }

    /// Set the value
    ///
    /// For a remote variable with `write`, this performs a blocking Write,
    /// runs the after-write hook and, on a verified RW block, the before-read
    /// hook and a blocking Verify.
    pub fn try_set(self: &Arc<Self>, value: Value, write: bool) -> Result<()> {
        if self.mode == Mode::ReadOnly {
            return Err(RegError::Node(format!("{} is read-only", self.path())));
        }

        match &self.storage {
            Storage::Remote { .. } => {
                let (layout, block) = self.remote()?;
                let bytes = self.encode(&value)?;
                block.set_values(layout, &bytes)?;

                if write && block.mode() != Mode::ReadOnly {
                    let retries = self.retries();
                    block.blocking_transaction_with_retry(TransactionKind::Write, retries)?;
                    if let Some(hook) = &self.after_write {
                        hook();
                    }
                    if block.mode() == Mode::ReadWrite && layout.verify {
                        if let Some(hook) = &self.before_read {
                            hook();
                        }
                        block.blocking_transaction_with_retry(TransactionKind::Verify, retries)?;
                    }
                }
                let stored = self.decode(block.get_values(layout)?)?;
                self.update(stored);
            }
            Storage::Local { setter, .. } => {
                if let Some(setter) = setter {
                    setter.apply(&value)?;
                }
                self.update(value);
            }
            Storage::Linked { setter, .. } => {
                let setter = setter.as_ref().ok_or_else(|| {
                    RegError::Node(format!("{} has no setter", self.path()))
                })?;
                setter.apply(&value)?;
            }
        }
        Ok(())
    }

    /// Fire-and-forget write through a Post transaction
    pub fn post(self: &Arc<Self>, value: impl Into<Value>) {
        if let Err(e) = self.try_post(value.into()) {
            tracing::error!(path = self.path(), "Failed to post: {}", e);
        }
    }

    pub fn try_post(self: &Arc<Self>, value: Value) -> Result<()> {
        match &self.storage {
            Storage::Remote { .. } => {
                if self.mode == Mode::ReadOnly {
                    return Err(RegError::Node(format!("{} is read-only", self.path())));
                }
                let (layout, block) = self.remote()?;
                block.set_values(layout, &self.encode(&value)?)?;
                block.start_transaction(TransactionKind::Post)?;
                self.update(value);
                Ok(())
            }
            _ => self.try_set(value, true),
        }
    }

    /// Get the value, logging any failure and returning `None`
    pub fn get(self: &Arc<Self>, read: bool) -> Option<Value> {
        match self.try_get(read) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::error!(path = self.path(), "Failed to get: {}", e);
                None
            }
        }
    }

    /// Get the value, optionally reading hardware first
    pub fn try_get(self: &Arc<Self>, read: bool) -> Result<Value> {
        match &self.storage {
            Storage::Remote { .. } => {
                let (layout, block) = self.remote()?;
                if read && block.mode() != Mode::WriteOnly {
                    if let Some(hook) = &self.before_read {
                        hook();
                    }
                    block.blocking_transaction_with_retry(TransactionKind::Read, self.retries())?;
                }
                let value = self.decode(block.get_values(layout)?)?;
                self.update(value.clone());
                Ok(value)
            }
            Storage::Local { getter, .. } => {
                let value = match getter {
                    Some(getter) => getter().map_err(|e| {
                        RegError::Node(format!("getter of {} failed: {:#}", self.path(), e))
                    })?,
                    None => self.value(),
                };
                self.update(value.clone());
                Ok(value)
            }
            Storage::Linked {
                dependencies,
                getter,
                ..
            } => {
                if read {
                    // Each dependency update refreshes this variable
                    for dependency in dependencies {
                        dependency.try_get(true)?;
                    }
                }
                let value = getter().map_err(|e| {
                    RegError::Node(format!("getter of {} failed: {:#}", self.path(), e))
                })?;
                if !read || dependencies.is_empty() {
                    self.update(value.clone());
                }
                Ok(value)
            }
        }
    }

    /// Display form of a value, using the enum table when one is set
    pub fn to_display(&self, value: &Value) -> String {
        match value {
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| self.to_display(v)).collect();
                format!("[{}]", parts.join(", "))
            }
            v => self
                .enum_table
                .iter()
                .find(|(k, _)| same_value(k, v))
                .map(|(_, name)| name.clone())
                .unwrap_or_else(|| self.codec.to_display(v)),
        }
    }

    /// Parse a display string, using the enum table when one is set
    pub fn parse_display(&self, text: &str) -> Result<Value> {
        let text = text.trim();
        if self.is_list() {
            let inner = text
                .strip_prefix('[')
                .and_then(|t| t.strip_suffix(']'))
                .ok_or_else(|| RegError::Format(format!("'{}' is not a list", text)))?;
            if inner.trim().is_empty() {
                return Ok(Value::List(Vec::new()));
            }
            return inner
                .split(',')
                .map(|part| self.parse_scalar(part.trim()))
                .collect::<Result<Vec<Value>>>()
                .map(Value::List);
        }
        self.parse_scalar(text)
    }

    fn parse_scalar(&self, text: &str) -> Result<Value> {
        if let Some((value, _)) = self.enum_table.iter().find(|(_, name)| name == text) {
            return Ok(value.clone());
        }
        if !self.enum_table.is_empty() && self.codec.kind() != CodecKind::Int {
            return Err(RegError::Format(format!(
                "'{}' is not one of {:?}",
                text,
                self.enum_table.iter().map(|(_, n)| n).collect::<Vec<_>>()
            )));
        }
        self.codec.from_display(text)
    }

    pub fn get_disp(self: &Arc<Self>, read: bool) -> Option<String> {
        self.get(read).map(|v| self.to_display(&v))
    }

    pub fn set_disp(self: &Arc<Self>, text: &str, write: bool) {
        if let Err(e) = self.try_set_disp(text, write) {
            tracing::error!(path = self.path(), "Failed to set '{}': {}", text, e);
        }
    }

    pub fn try_set_disp(self: &Arc<Self>, text: &str, write: bool) -> Result<()> {
        let value = self.parse_display(text)?;
        self.try_set(value, write)
    }

    /// Refresh from the block buffer after a background read
    pub(crate) fn block_updated(self: &Arc<Self>) {
        let result = self
            .remote()
            .and_then(|(layout, block)| block.get_values(layout))
            .and_then(|bytes| self.decode(bytes));
        match result {
            Ok(value) => self.update(value),
            Err(e) => tracing::warn!(path = self.path(), "Failed to decode update: {}", e),
        }
    }

    /// Scheduled refresh of a getter-backed variable
    pub(crate) fn poll(self: &Arc<Self>) {
        if let Err(e) = self.try_get(true) {
            tracing::warn!(path = self.path(), "Poll failed: {}", e);
        }
    }

    fn update(self: &Arc<Self>, value: Value) {
        {
            let mut cache = self.cache.lock();
            cache.value = value.clone();
            cache.timestamp = Some(Utc::now());
        }
        match self.runtime.get() {
            Some(rt) => rt.aggregator.record(self, value),
            None => self.fire_listeners(&value),
        }
        for dependent in self.live_dependents() {
            dependent.dependency_updated();
        }
    }

    fn dependency_updated(self: &Arc<Self>) {
        let Storage::Linked { getter, .. } = &self.storage else {
            return;
        };
        match getter() {
            Ok(value) => self.update(value),
            Err(e) => tracing::warn!(path = self.path(), "Failed to recompute: {:#}", e),
        }
    }

    /// Call every listener with `value`; a panicking listener is logged and skipped
    pub fn fire_listeners(&self, value: &Value) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener(self.path(), value)));
            if result.is_err() {
                tracing::error!(path = self.path(), "Variable listener panicked");
            }
        }
    }

    /// Address-map row, for remote variables bound to a block
    pub fn remote_info(&self) -> Option<RemoteVariableInfo> {
        let (layout, block) = self.remote().ok()?;
        let size = block.size();
        let mut mask = vec![0u8; size];
        for (o, s) in layout.fields().into_iter().flatten() {
            if o + s <= size * 8 {
                block::set_mask(&mut mask, o, s, true);
            }
        }
        let (num_values, value_stride) = layout
            .list
            .map_or((1, 0), |l| (l.num_values, l.value_stride));
        Some(RemoteVariableInfo {
            path: self.path().to_string(),
            address: block.address().unwrap_or(layout.offset),
            offset: layout.offset,
            bit_offsets: layout.pieces.iter().map(|p| p.0).collect(),
            bit_sizes: layout.pieces.iter().map(|p| p.1).collect(),
            mode: self.mode,
            verify: layout.verify,
            block_size: size,
            mask,
            kind: self.codec.kind(),
            bit_width: self.codec.bit_width(),
            num_values,
            value_stride,
            poll_interval_s: self.poll_interval().as_secs_f64(),
            description: self.description.clone(),
        })
    }
}

impl std::fmt::Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Variable")
            .field("path", &self.path())
            .field("mode", &self.mode)
            .field("codec", &self.codec.spec())
            .finish()
    }
}

enum Kind {
    Remote { offset: u64 },
    Local,
    Linked { dependencies: Vec<Arc<Variable>>, getter: Getter },
}

/// Builder for [`Variable`]s
pub struct VariableBuilder {
    name: String,
    kind: Kind,
    description: String,
    units: Option<String>,
    mode: Option<Mode>,
    codec: CodecSpec,
    pieces: Vec<(usize, usize)>,
    list: Option<(usize, Option<usize>)>,
    verify: bool,
    poll_interval: Duration,
    enum_table: Vec<(Value, String)>,
    before_read: Option<Hook>,
    after_write: Option<Hook>,
    getter: Option<Getter>,
    setter: Option<Setter>,
    initial: Option<Value>,
}

impl VariableBuilder {
    fn new(name: impl Into<String>, kind: Kind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: String::new(),
            units: None,
            mode: None,
            codec: CodecSpec::uint(32),
            pieces: Vec::new(),
            list: None,
            verify: true,
            poll_interval: Duration::ZERO,
            enum_table: Vec::new(),
            before_read: None,
            after_write: None,
            getter: None,
            setter: None,
            initial: None,
        }
    }

    /// Variable stored in the block at `offset` bytes into its device
    pub fn remote(name: impl Into<String>, offset: u64) -> Self {
        Self::new(name, Kind::Remote { offset })
    }

    /// Software variable
    pub fn local(name: impl Into<String>) -> Self {
        Self::new(name, Kind::Local)
    }

    /// Variable derived from `dependencies` by `getter`
    pub fn linked<F>(name: impl Into<String>, dependencies: Vec<Arc<Variable>>, getter: F) -> Self
    where
        F: Fn() -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self::new(
            name,
            Kind::Linked {
                dependencies,
                getter: Arc::new(getter),
            },
        )
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn codec(mut self, spec: CodecSpec) -> Self {
        self.codec = spec;
        self
    }

    pub fn uint(self, bits: usize) -> Self {
        self.codec(CodecSpec::uint(bits))
    }

    pub fn int(self, bits: usize) -> Self {
        self.codec(CodecSpec::int(bits))
    }

    pub fn boolean(self) -> Self {
        self.codec(CodecSpec::boolean())
    }

    pub fn string(self, bytes: usize) -> Self {
        self.codec(CodecSpec::string(bytes))
    }

    pub fn float(self) -> Self {
        self.codec(CodecSpec::float())
    }

    pub fn double(self) -> Self {
        self.codec(CodecSpec::double())
    }

    pub fn big_endian(mut self) -> Self {
        self.codec = self.codec.big_endian();
        self
    }

    /// Place the value at one `(bit_offset, bit_size)` piece
    pub fn bits(mut self, bit_offset: usize, bit_size: usize) -> Self {
        self.pieces = vec![(bit_offset, bit_size)];
        self
    }

    /// Append a further piece; pieces fill the value from its least significant bit
    pub fn add_bits(mut self, bit_offset: usize, bit_size: usize) -> Self {
        self.pieces.push((bit_offset, bit_size));
        self
    }

    /// Make this a list of `num_values` values spaced `stride` bits apart
    /// (default stride: the value width)
    pub fn list(mut self, num_values: usize, stride: Option<usize>) -> Self {
        self.list = Some((num_values, stride));
        self
    }

    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn enum_values<V, S>(mut self, table: impl IntoIterator<Item = (V, S)>) -> Self
    where
        V: Into<Value>,
        S: Into<String>,
    {
        self.enum_table = table.into_iter().map(|(v, s)| (v.into(), s.into())).collect();
        self
    }

    pub fn before_read(mut self, hook: Hook) -> Self {
        self.before_read = Some(hook);
        self
    }

    pub fn after_write(mut self, hook: Hook) -> Self {
        self.after_write = Some(hook);
        self
    }

    pub fn getter<F>(mut self, getter: F) -> Self
    where
        F: Fn() -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.getter = Some(Arc::new(getter));
        self
    }

    pub fn setter<F>(mut self, setter: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.setter = Some(Setter::Callable(Arc::new(setter)));
        self
    }

    pub fn sequence(mut self, steps: Vec<CommandStep>) -> Self {
        self.setter = Some(Setter::Sequence(steps));
        self
    }

    /// Initial value of a local variable
    pub fn value(mut self, value: impl Into<Value>) -> Self {
        self.initial = Some(value.into());
        self
    }

    pub fn build(self) -> Result<Arc<Variable>> {
        let codec = codec::intern(self.codec)?;

        let (storage, default_mode) = match self.kind {
            Kind::Remote { offset } => {
                let mut pieces = self.pieces;
                if pieces.is_empty() {
                    pieces.push((0, codec.bit_width()));
                }
                if pieces.iter().any(|p| p.1 == 0) {
                    return Err(RegError::Config(format!("{} has an empty bit field", self.name)));
                }
                let list = match self.list {
                    None => None,
                    Some((0, _)) => {
                        return Err(RegError::Config(format!("{} is an empty list", self.name)))
                    }
                    Some((num_values, stride)) => {
                        let value_bits = pieces[0].1;
                        Some(ListLayout {
                            num_values,
                            value_bits,
                            value_stride: stride.unwrap_or(value_bits),
                        })
                    }
                };
                let layout = BitLayout {
                    offset,
                    pieces,
                    list,
                    mode: self.mode.unwrap_or_default(),
                    verify: self.verify,
                    big_endian: self.codec.endian == Endian::Big,
                };
                (
                    Storage::Remote {
                        layout,
                        block: OnceLock::new(),
                    },
                    Mode::ReadWrite,
                )
            }
            Kind::Local => (
                Storage::Local {
                    getter: self.getter,
                    setter: self.setter,
                },
                Mode::ReadWrite,
            ),
            Kind::Linked {
                dependencies,
                getter,
            } => {
                let mode = if self.setter.is_some() {
                    Mode::ReadWrite
                } else {
                    Mode::ReadOnly
                };
                (
                    Storage::Linked {
                        dependencies,
                        getter,
                        setter: self.setter,
                    },
                    mode,
                )
            }
        };

        let variable = Arc::new(Variable {
            name: self.name,
            description: self.description,
            units: self.units,
            mode: self.mode.unwrap_or(default_mode),
            codec: codec.clone(),
            storage,
            enum_table: self.enum_table,
            before_read: self.before_read,
            after_write: self.after_write,
            path: OnceLock::new(),
            runtime: OnceLock::new(),
            poll_interval: Mutex::new(self.poll_interval),
            cache: Mutex::new(Cached {
                value: self.initial.unwrap_or_else(|| codec.default_value()),
                timestamp: None,
            }),
            listeners: Mutex::new(Vec::new()),
            dependents: Mutex::new(Vec::new()),
        });

        for dependency in variable.dependencies() {
            dependency.dependents.lock().push(Arc::downgrade(&variable));
        }
        Ok(variable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_local_variable_stores_value() {
        let v = VariableBuilder::local("Count").uint(16).value(5u32).build().unwrap();
        assert_eq!(v.get(true), Some(Value::UInt(5)));
        v.set(7u32, true);
        assert_eq!(v.value(), Value::UInt(7));
        assert!(v.timestamp().is_some());
    }

    #[test]
    fn test_local_getter_and_setter() {
        let store = Arc::new(Mutex::new(Value::Int(0)));
        let (g, s) = (store.clone(), store.clone());
        let v = VariableBuilder::local("Temp")
            .int(16)
            .getter(move || Ok(g.lock().clone()))
            .setter(move |value| {
                *s.lock() = value.clone();
                Ok(())
            })
            .build()
            .unwrap();
        v.set(-12i32, true);
        assert_eq!(*store.lock(), Value::Int(-12));
        assert_eq!(v.get(true), Some(Value::Int(-12)));
    }

    #[test]
    fn test_listeners_without_runtime_fire_inline() {
        let v = VariableBuilder::local("Flag").boolean().build().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        v.add_listener(move |path, value| seen2.lock().push((path.to_string(), value.clone())));
        v.set(true, false);
        assert_eq!(*seen.lock(), vec![("Flag".to_string(), Value::Bool(true))]);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let v = VariableBuilder::local("X").build().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        v.add_listener(|_, _| panic!("listener failure"));
        v.add_listener(move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        v.set(1u32, false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_linked_variable_follows_dependency() {
        let base = VariableBuilder::local("Raw").uint(16).value(10u32).build().unwrap();
        let dep = base.clone();
        let scaled = VariableBuilder::linked("Scaled", vec![base.clone()], move || {
            let raw = dep.value().as_f64().unwrap_or(0.0);
            Ok(Value::Float(raw * 0.5))
        })
        .double()
        .build()
        .unwrap();
        assert_eq!(scaled.mode(), Mode::ReadOnly);

        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        scaled.add_listener(move |_, v| *seen2.lock() = Some(v.clone()));

        base.set(40u32, false);
        assert_eq!(*seen.lock(), Some(Value::Float(20.0)));
        assert_eq!(scaled.get(false), Some(Value::Float(20.0)));
        assert!(scaled.try_set(Value::Float(1.0), true).is_err());
    }

    #[test]
    fn test_poll_demand_propagates_from_dependents() {
        let base = VariableBuilder::local("Raw").build().unwrap();
        let dep = base.clone();
        let derived = VariableBuilder::linked("Derived", vec![base.clone()], move || Ok(dep.value()))
            .poll_interval(Duration::from_secs(2))
            .build()
            .unwrap();
        assert_eq!(base.poll_demand(), Some(Duration::from_secs(2)));
        derived.set_poll_interval(Duration::ZERO);
        assert_eq!(base.poll_demand(), None);
    }

    #[test]
    fn test_command_sequence() {
        let target = VariableBuilder::local("Strobe").uint(1).build().unwrap();
        let writes = Arc::new(Mutex::new(Vec::new()));
        let w = writes.clone();
        target.add_listener(move |_, v| w.lock().push(v.clone()));

        let cmd = VariableBuilder::local("Pulse")
            .sequence(vec![
                CommandStep::Set(target.clone(), Value::UInt(1)),
                CommandStep::Sleep(Duration::from_millis(1)),
                CommandStep::Toggle(target.clone()),
            ])
            .build()
            .unwrap();
        cmd.set(0u32, true);
        assert_eq!(
            *writes.lock(),
            vec![Value::UInt(1), Value::UInt(1), Value::UInt(0)]
        );
    }

    #[test]
    fn test_enum_display() {
        let v = VariableBuilder::local("State")
            .uint(2)
            .enum_values([(0u32, "Idle"), (1u32, "Run"), (2u32, "Error")])
            .build()
            .unwrap();
        assert_eq!(v.to_display(&Value::UInt(1)), "Run");
        assert_eq!(v.to_display(&Value::UInt(3)), "0x3");
        assert_eq!(v.parse_display("Error").unwrap(), Value::UInt(2));
        assert_eq!(v.parse_display("0x3").unwrap(), Value::UInt(3));
        v.set_disp("Run", false);
        assert_eq!(v.get_disp(false).as_deref(), Some("Run"));
    }

    #[test]
    fn test_read_only_rejects_set() {
        let v = VariableBuilder::remote("Id", 0).mode(Mode::ReadOnly).build().unwrap();
        assert!(matches!(v.try_set(Value::UInt(1), true), Err(RegError::Node(_))));
    }

    #[test]
    fn test_remote_defaults() {
        let v = VariableBuilder::remote("Reg", 0x20).int(12).build().unwrap();
        let layout = v.layout().unwrap();
        assert_eq!(layout.offset, 0x20);
        assert_eq!(layout.pieces, vec![(0, 12)]);
        assert_eq!(v.mode(), Mode::ReadWrite);
        assert!(v.block().is_none());
        assert!(v.try_get(false).is_err());
    }

    #[test]
    fn test_list_layout_and_display() {
        let v = VariableBuilder::remote("Taps", 0)
            .bits(0, 8)
            .uint(8)
            .list(4, Some(16))
            .build()
            .unwrap();
        let list = v.layout().unwrap().list.unwrap();
        assert_eq!((list.num_values, list.value_bits, list.value_stride), (4, 8, 16));
        let parsed = v.parse_display("[0x1, 2, 0b11, 4]").unwrap();
        assert_eq!(
            parsed,
            Value::List(vec![Value::UInt(1), Value::UInt(2), Value::UInt(3), Value::UInt(4)])
        );
        assert_eq!(v.to_display(&parsed), "[0x1, 0x2, 0x3, 0x4]");
    }
}
