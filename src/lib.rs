//! # regtree-rs: Register Transaction Engine
//!
//! A register tree for FPGA/ASIC data-acquisition hardware. Typed, bit-addressed
//! variables are packed into blocks of register space; blocks run Read, Write,
//! Verify and Post transactions against a pluggable transport, and a background
//! poller keeps status registers fresh.
//!
//! ## Architecture
//!
//! - **Codec**: value ↔ byte conversion for ints, bools, strings and floats
//! - **Block**: register buffer with bit packing and a one-at-a-time transaction state machine
//! - **Device**: tree nodes that own blocks and route background transactions by address
//! - **Variable**: named values backed by a block, local state or other variables
//! - **Poller**: min-heap scheduler issuing periodic reads on its own thread
//! - **Aggregator**: per-thread batching of change notifications, dispatched on a consumer thread
//! - **Transport**: in-memory emulation and probe-rs debug probe access
//!
//! ## Configuration
//!
//! Engine settings ([`EngineConfig`]) load from TOML or JSON. The default location
//! is the platform data directory under `regtree-rs`:
//!
//! - **Linux**: `~/.local/share/regtree-rs/engine.toml`
//! - **macOS**: `~/Library/Application Support/regtree-rs/engine.toml`
//! - **Windows**: `%APPDATA%\regtree-rs\engine.toml`
//!
//! ## Example
//!
//! ```ignore
//! use regtree_rs::prelude::*;
//!
//! fn main() -> regtree_rs::Result<()> {
//!     let _ = regtree_rs::logging::init(regtree_rs::logging::DEFAULT_FILTER);
//!
//!     let transport = Arc::new(MemoryTransport::new().with_region(0x0, 0x1000).threaded());
//!     let mut root = Root::new("Top", EngineConfig::default()).with_transport(transport);
//!
//!     let mut adc = Device::new("Adc").with_offset(0x100);
//!     adc.add_variable(VariableBuilder::remote("Gain", 0x0).uint(16).build()?)?;
//!     adc.add_variable(
//!         VariableBuilder::remote("Temp", 0x4)
//!             .int(12)
//!             .mode(Mode::ReadOnly)
//!             .poll_interval(std::time::Duration::from_secs(1))
//!             .build()?,
//!     )?;
//!     root.add_device(adc)?;
//!     root.start()?;
//!
//!     let gain = root.variable("Adc.Gain").unwrap();
//!     gain.set(12u32, true);
//!     println!("gain = {:?}", gain.get_disp(true));
//!     root.stop();
//!     Ok(())
//! }
//! ```

pub mod aggregator;
pub mod block;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod poller;
pub mod root;
pub mod transport;
pub mod variable;

// Re-export commonly used types
pub use aggregator::{Update, UpdateAggregator};
pub use block::{BitLayout, Block, Mode};
pub use codec::{Codec, CodecSpec, Value};
pub use config::{EngineConfig, ProbeConfig};
pub use device::{Device, DeviceHooks, Node, ResetKind};
pub use error::{RegError, Result, TransactionError};
pub use poller::Poller;
pub use root::Root;
pub use transport::{MemoryTransport, ProbeTransport, TransactionKind, Transport};
pub use variable::{CommandStep, Variable, VariableBuilder};

/// Everything needed to build and run a tree
pub mod prelude {
    pub use crate::{
        CodecSpec, CommandStep, Device, DeviceHooks, EngineConfig, MemoryTransport, Mode, Node,
        ResetKind, Root, TransactionKind, Transport, Value, Variable, VariableBuilder,
    };
    pub use std::sync::Arc;
}
