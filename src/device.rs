//! Device tree: address routing of background transactions
//!
//! A [`Device`] is a node of the register tree. It owns child devices,
//! Variables and the Blocks those Variables were packed into. Trees are built
//! mutably, then activated once by the [`Root`](crate::root::Root): activation
//! assigns dotted paths and absolute addresses, hands every Block its transport
//! and freezes the structure.
//!
//! # Array children
//!
//! Children named like `Chan[3]` or `Reg[1][2]` are additionally indexed by base
//! name, so `get_node("Chan[3]")` and [`Device::array`] work without any name
//! mangling by the caller.
//!
//! # Capabilities
//!
//! Specialised devices (run control, data writers, ...) are plain Devices with
//! one or more [`DeviceHooks`] attached.

use crate::aggregator::UpdateAggregator;
use crate::block::{Block, Mode};
use crate::error::{RegError, Result};
use crate::poller::Poller;
use crate::transport::{TransactionKind, Transport};
use crate::variable::{Hook, Runtime, Variable};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

/// Enable flag of a device, chained to its parent's
#[derive(Debug)]
pub struct Enable {
    flag: AtomicBool,
    parent: OnceLock<Arc<Enable>>,
}

impl Enable {
    /// A flag with no parent, initially enabled
    pub fn root() -> Arc<Self> {
        Arc::new(Self {
            flag: AtomicBool::new(true),
            parent: OnceLock::new(),
        })
    }

    /// Local flag only
    pub fn get(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn set(&self, enabled: bool) {
        self.flag.store(enabled, Ordering::Release);
    }

    /// Enabled here and in every ancestor
    pub fn is_enabled(&self) -> bool {
        self.get() && self.parent.get().map_or(true, |p| p.is_enabled())
    }

    fn set_parent(&self, parent: Arc<Enable>) {
        let _ = self.parent.set(parent);
    }
}

/// Kinds of reset propagated through the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResetKind {
    Hard,
    Soft,
    /// Clear counters only
    Count,
}

/// Behaviour a specialised device adds to the generic container
pub trait DeviceHooks: Send + Sync {
    /// Called before the device's blocks are transacted in a background pass
    fn on_background_transaction(&self, _device: &Device, _kind: TransactionKind) {}

    fn on_reset(&self, _device: &Device, _kind: ResetKind) {}
}

/// A child of a device
#[derive(Clone)]
pub enum Node {
    Device(Arc<Device>),
    Variable(Arc<Variable>),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Device(d) => d.name(),
            Node::Variable(v) => v.name(),
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Node::Device(d) => d.path(),
            Node::Variable(v) => v.path(),
        }
    }

    pub fn as_device(&self) -> Option<&Arc<Device>> {
        match self {
            Node::Device(d) => Some(d),
            Node::Variable(_) => None,
        }
    }

    pub fn as_variable(&self) -> Option<&Arc<Variable>> {
        match self {
            Node::Variable(v) => Some(v),
            Node::Device(_) => None,
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Node::Device(d) => write!(f, "Device({})", d.path()),
            Node::Variable(v) => write!(f, "Variable({})", v.path()),
        }
    }
}

/// Split `Name[1][2]` into `("Name", [1, 2])`
pub fn parse_array_name(name: &str) -> Option<(&str, Vec<usize>)> {
    let open = name.find('[')?;
    let (base, mut rest) = name.split_at(open);
    if base.is_empty() {
        return None;
    }
    let mut indices = Vec::new();
    while !rest.is_empty() {
        let inner = rest.strip_prefix('[')?;
        let close = inner.find(']')?;
        indices.push(inner[..close].trim().parse().ok()?);
        rest = &inner[close + 1..];
    }
    Some((base, indices))
}

/// Services handed down the tree at activation
pub(crate) struct ActivationContext {
    pub aggregator: Arc<UpdateAggregator>,
    pub poller: Weak<Poller>,
    pub retries: u32,
    pub timeout: Duration,
}

/// Placement of one block, as checked for overlaps
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockExtent {
    pub endpoint: u64,
    pub address: u64,
    pub size: usize,
    pub path: String,
}

/// Fail if two non-empty blocks on one endpoint share any byte
pub fn check_overlaps(mut extents: Vec<BlockExtent>) -> Result<()> {
    extents.retain(|e| e.size > 0);
    extents.sort();
    for pair in extents.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if a.endpoint == b.endpoint && a.address + a.size as u64 > b.address {
            return Err(RegError::Node(format!(
                "block {} [0x{:08X}, 0x{:08X}) overlaps block {} at 0x{:08X}",
                a.path,
                a.address,
                a.address + a.size as u64,
                b.path,
                b.address
            )));
        }
    }
    Ok(())
}

fn push_distinct(hooks: &mut Vec<Hook>, hook: &Hook) {
    let ptr = Arc::as_ptr(hook) as *const ();
    if !hooks.iter().any(|h| Arc::as_ptr(h) as *const () == ptr) {
        hooks.push(hook.clone());
    }
}

/// A node of the register tree
pub struct Device {
    name: String,
    description: String,
    offset: u64,
    transport: Option<Arc<dyn Transport>>,
    hooks: Vec<Arc<dyn DeviceHooks>>,
    enable: Arc<Enable>,
    children: Vec<Node>,
    index: HashMap<String, usize>,
    arrays: HashMap<String, BTreeMap<Vec<usize>, usize>>,
    blocks: Vec<Arc<Block>>,
    path: OnceLock<String>,
    address: OnceLock<u64>,
}

impl Device {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            offset: 0,
            transport: None,
            hooks: Vec::new(),
            enable: Enable::root(),
            children: Vec::new(),
            index: HashMap::new(),
            arrays: HashMap::new(),
            blocks: Vec::new(),
            path: OnceLock::new(),
            address: OnceLock::new(),
        }
    }

    /// Offset of this device within its parent's address space
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Transport for this subtree; devices without one inherit their parent's
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.set_transport(transport);
        self
    }

    pub fn set_transport(&mut self, transport: Arc<dyn Transport>) {
        self.transport = Some(transport);
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn DeviceHooks>) -> Self {
        self.hooks.push(hooks);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn path(&self) -> &str {
        self.path.get().map_or(self.name.as_str(), String::as_str)
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Absolute base address, once activated
    pub fn address(&self) -> Option<u64> {
        self.address.get().copied()
    }

    pub fn is_active(&self) -> bool {
        self.path.get().is_some()
    }

    pub fn enable(&self) -> &Arc<Enable> {
        &self.enable
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enable.set(enabled);
    }

    pub fn is_enabled(&self) -> bool {
        self.enable.is_enabled()
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    pub fn devices(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.children.iter().filter_map(Node::as_device)
    }

    pub fn variables(&self) -> impl Iterator<Item = &Arc<Variable>> {
        self.children.iter().filter_map(Node::as_variable)
    }

    pub fn blocks(&self) -> &[Arc<Block>] {
        &self.blocks
    }

    fn check_child_name(&self, name: &str) -> Result<()> {
        if self.is_active() {
            return Err(RegError::Node(format!(
                "cannot add {} to active device {}",
                name,
                self.path()
            )));
        }
        if name.is_empty() || name.contains('.') {
            return Err(RegError::Node(format!("invalid node name '{}'", name)));
        }
        if self.index.contains_key(name) {
            return Err(RegError::Node(format!(
                "{} already has a child named {}",
                self.path(),
                name
            )));
        }
        Ok(())
    }

    fn push_child(&mut self, node: Node) {
        let name = node.name().to_string();
        let position = self.children.len();
        if let Some((base, indices)) = parse_array_name(&name) {
            self.arrays
                .entry(base.to_string())
                .or_default()
                .insert(indices, position);
        }
        self.index.insert(name, position);
        self.children.push(node);
    }

    /// Add a child device
    pub fn add_device(&mut self, device: Device) -> Result<Arc<Device>> {
        self.check_child_name(device.name())?;
        let device = Arc::new(device);
        self.push_child(Node::Device(device.clone()));
        Ok(device)
    }

    /// Add a variable; remote variables are packed into the block at their offset
    pub fn add_variable(&mut self, variable: Arc<Variable>) -> Result<()> {
        self.check_child_name(variable.name())?;

        if let Some(layout) = variable.layout() {
            let mut bound = None;
            for block in &self.blocks {
                if block.bind(&variable)? {
                    bound = Some(block.clone());
                    break;
                }
            }
            let block = match bound {
                Some(block) => block,
                None => {
                    let block = Block::new(layout.offset);
                    block.bind(&variable)?;
                    self.blocks.push(block.clone());
                    block
                }
            };
            variable.attach_block(&block)?;
        }

        self.push_child(Node::Variable(variable));
        Ok(())
    }

    pub fn add(&mut self, node: Node) -> Result<()> {
        match node {
            Node::Device(device) => {
                self.check_child_name(device.name())?;
                self.push_child(Node::Device(device));
                Ok(())
            }
            Node::Variable(variable) => self.add_variable(variable),
        }
    }

    /// Direct child by name, including `Name[i]` array members
    pub fn child(&self, name: &str) -> Option<&Node> {
        if let Some(&i) = self.index.get(name) {
            return self.children.get(i);
        }
        let (base, indices) = parse_array_name(name)?;
        let position = self.arrays.get(base)?.get(&indices)?;
        self.children.get(*position)
    }

    /// Members of an array child in index order
    pub fn array(&self, base: &str) -> Vec<Node> {
        self.arrays
            .get(base)
            .map(|members| {
                members
                    .values()
                    .filter_map(|&i| self.children.get(i).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Look up a node by a path relative to this device (`Sub.Chan[2].Gain`)
    pub fn get_node(&self, path: &str) -> Option<Node> {
        let mut parts = path.split('.');
        let mut node = self.child(parts.next()?)?.clone();
        for part in parts {
            let next = node.as_device()?.child(part)?.clone();
            node = next;
        }
        Some(node)
    }

    pub(crate) fn activate(
        &self,
        parent_path: Option<&str>,
        parent_address: u64,
        parent_transport: Option<&Arc<dyn Transport>>,
        parent_enable: Option<&Arc<Enable>>,
        ctx: &ActivationContext,
    ) -> Result<()> {
        let path = match parent_path {
            Some(parent) => format!("{}.{}", parent, self.name),
            None => self.name.clone(),
        };
        self.path
            .set(path.clone())
            .map_err(|_| RegError::Node(format!("{} is already active", path)))?;
        let address = parent_address + self.offset;
        let _ = self.address.set(address);
        if let Some(parent) = parent_enable {
            self.enable.set_parent(parent.clone());
        }
        let transport = self.transport.as_ref().or(parent_transport);

        if !self.blocks.is_empty() {
            let transport = transport.ok_or_else(|| {
                RegError::Node(format!("{} has registers but no transport", path))
            })?;
            for block in &self.blocks {
                block.attach(
                    &path,
                    address + block.offset(),
                    transport.clone(),
                    self.enable.clone(),
                    ctx.timeout,
                )?;
            }
        }

        for child in &self.children {
            match child {
                Node::Variable(variable) => variable.activate(
                    format!("{}.{}", path, variable.name()),
                    Runtime {
                        aggregator: ctx.aggregator.clone(),
                        poller: ctx.poller.clone(),
                        retries: ctx.retries,
                    },
                )?,
                Node::Device(device) => {
                    device.activate(Some(&path), address, transport, Some(&self.enable), ctx)?
                }
            }
        }

        tracing::debug!(
            "Activated {} at 0x{:08X} ({} blocks)",
            path,
            address,
            self.blocks.len()
        );
        Ok(())
    }

    /// Every block of the subtree, depth first
    pub fn collect_blocks(&self, out: &mut Vec<Arc<Block>>) {
        out.extend(self.blocks.iter().cloned());
        for device in self.devices() {
            device.collect_blocks(out);
        }
    }

    /// Every variable of the subtree, in tree order
    pub fn collect_variables(&self, out: &mut Vec<Arc<Variable>>) {
        for child in &self.children {
            match child {
                Node::Variable(v) => out.push(v.clone()),
                Node::Device(d) => d.collect_variables(out),
            }
        }
    }

    /// Extents of every attached block, for the overlap check
    pub fn block_extents(&self) -> Vec<BlockExtent> {
        let mut blocks = Vec::new();
        self.collect_blocks(&mut blocks);
        blocks
            .iter()
            .filter_map(|b| {
                Some(BlockExtent {
                    endpoint: b.endpoint_id()?,
                    address: b.address()?,
                    size: b.size(),
                    path: b.path().to_string(),
                })
            })
            .collect()
    }

    fn distinct_hooks(&self, select: impl Fn(&Variable) -> Option<&Hook>) -> Vec<Hook> {
        let mut hooks = Vec::new();
        for variable in self.variables() {
            if let Some(hook) = select(variable.as_ref()) {
                push_distinct(&mut hooks, hook);
            }
        }
        hooks
    }

    /// Start `kind` on every compatible block of the subtree without waiting
    ///
    /// Writes skip blocks without pending changes unless `force` is set. The
    /// first failure is returned after every block was given its turn.
    pub fn run_background_transaction(&self, kind: TransactionKind, force: bool) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        for hooks in &self.hooks {
            hooks.on_background_transaction(self, kind);
        }
        if matches!(kind, TransactionKind::Read | TransactionKind::Verify) {
            for hook in self.distinct_hooks(Variable::before_read_hook) {
                hook();
            }
        }

        let mut first_error = None;
        for block in &self.blocks {
            let mode = block.mode();
            let wanted = mode.allows(kind)
                && (kind != TransactionKind::Write || force || block.is_stale());
            if wanted {
                if let Err(e) = block.start_transaction(kind) {
                    first_error.get_or_insert(e);
                }
            }
        }
        for device in self.devices() {
            if let Err(e) = device.run_background_transaction(kind, force) {
                first_error.get_or_insert(e);
            }
        }

        if kind == TransactionKind::Write {
            for hook in self.distinct_hooks(Variable::after_write_hook) {
                hook();
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Check every block of the subtree, returning the first failure
    pub fn check_all(&self, update: bool) -> Result<()> {
        let mut first_error = None;
        for block in &self.blocks {
            if let Err(e) = block.check_transaction(update) {
                tracing::warn!("{}", e);
                first_error.get_or_insert(e);
            }
        }
        for device in self.devices() {
            if let Err(e) = device.check_all(update) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Propagate a reset to the hooks of the subtree
    pub fn reset(&self, kind: ResetKind) {
        for hooks in &self.hooks {
            hooks.on_reset(self, kind);
        }
        for device in self.devices() {
            device.reset(kind);
        }
    }

    /// Blocks of this device (not the subtree) in `mode`
    pub fn blocks_with_mode(&self, mode: Mode) -> Vec<Arc<Block>> {
        self.blocks.iter().filter(|b| b.mode() == mode).cloned().collect()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("path", &self.path())
            .field("offset", &self.offset)
            .field("children", &self.children.len())
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variable::VariableBuilder;

    fn extent(endpoint: u64, address: u64, size: usize) -> BlockExtent {
        BlockExtent {
            endpoint,
            address,
            size,
            path: format!("B{:X}", address),
        }
    }

    #[test]
    fn test_parse_array_name() {
        assert_eq!(parse_array_name("Chan[3]"), Some(("Chan", vec![3])));
        assert_eq!(parse_array_name("Reg[1][2]"), Some(("Reg", vec![1, 2])));
        assert_eq!(parse_array_name("Plain"), None);
        assert_eq!(parse_array_name("Bad[x]"), None);
        assert_eq!(parse_array_name("[1]"), None);
    }

    #[test]
    fn test_overlap_detection() {
        assert!(check_overlaps(vec![extent(1, 0x0, 4), extent(1, 0x2, 4)]).is_err());
        assert!(check_overlaps(vec![extent(1, 0x0, 4), extent(1, 0x4, 4)]).is_ok());
        // Different endpoints never overlap
        assert!(check_overlaps(vec![extent(1, 0x0, 4), extent(2, 0x2, 4)]).is_ok());
        // Empty blocks are ignored
        assert!(check_overlaps(vec![extent(1, 0x0, 0), extent(1, 0x0, 4)]).is_ok());
    }

    #[test]
    fn test_enable_chain() {
        let parent = Enable::root();
        let child = Enable::root();
        child.set_parent(parent.clone());
        assert!(child.is_enabled());
        parent.set(false);
        assert!(!child.is_enabled());
        assert!(child.get());
    }

    #[test]
    fn test_variables_share_block_at_offset() {
        let mut dev = Device::new("Dev");
        let a = VariableBuilder::remote("A", 0x10).bits(0, 16).uint(16).build().unwrap();
        let b = VariableBuilder::remote("B", 0x10).bits(16, 16).uint(16).build().unwrap();
        let c = VariableBuilder::remote("C", 0x20).uint(32).build().unwrap();
        dev.add_variable(a.clone()).unwrap();
        dev.add_variable(b.clone()).unwrap();
        dev.add_variable(c).unwrap();
        assert_eq!(dev.blocks().len(), 2);
        assert!(Arc::ptr_eq(a.block().unwrap(), b.block().unwrap()));
        assert_eq!(dev.blocks()[0].size(), 4);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut dev = Device::new("Dev");
        dev.add_variable(VariableBuilder::local("X").build().unwrap()).unwrap();
        let err = dev.add_variable(VariableBuilder::local("X").build().unwrap());
        assert!(matches!(err, Err(RegError::Node(_))));
    }

    #[test]
    fn test_array_lookup() {
        let mut dev = Device::new("Dev");
        for i in [2usize, 0, 1] {
            dev.add_device(Device::new(format!("Chan[{}]", i))).unwrap();
        }
        let names: Vec<String> = dev.array("Chan").iter().map(|n| n.name().to_string()).collect();
        assert_eq!(names, vec!["Chan[0]", "Chan[1]", "Chan[2]"]);
        assert_eq!(dev.child("Chan[ 1 ]").map(|n| n.name().to_string()), Some("Chan[1]".to_string()));
        assert!(dev.child("Chan[5]").is_none());
    }

    #[test]
    fn test_get_node_nested() {
        let mut inner = Device::new("Inner");
        inner.add_variable(VariableBuilder::local("Gain").build().unwrap()).unwrap();
        let mut outer = Device::new("Outer");
        outer.add_device(inner).unwrap();
        let node = outer.get_node("Inner.Gain").unwrap();
        assert!(node.as_variable().is_some());
        assert!(outer.get_node("Inner.Missing").is_none());
        assert!(outer.get_node("Inner.Gain.Deeper").is_none());
    }
}
