//! Test tree builders

use regtree_rs::prelude::*;
use std::time::Duration;

/// Config for deterministic tests: no poll thread, no initial read, short timeout
pub fn quiet_config() -> EngineConfig {
    EngineConfig::default()
        .with_polling(false)
        .with_initial_read(false)
        .with_timeout(super::test_timeout())
}

/// Inline memory transport covering `[0, 0x1000)`
pub fn memory() -> Arc<MemoryTransport> {
    Arc::new(MemoryTransport::new().with_region(0x0, 0x1000))
}

/// Root named `Top` on `transport` with `quiet_config`
pub fn root_on(transport: Arc<dyn Transport>) -> Root {
    Root::new("Top", quiet_config()).with_transport(transport)
}

/// Device `Dev` holding one unsigned 32-bit RW variable `Reg` at `offset`
pub fn single_register(offset: u64) -> Device {
    let mut dev = Device::new("Dev");
    dev.add_variable(
        VariableBuilder::remote("Reg", offset)
            .uint(32)
            .build()
            .expect("valid variable"),
    )
    .expect("unique name");
    dev
}

/// Remote u32 variable polled every `secs` seconds (0 disables polling)
pub fn polled(name: &str, offset: u64, bit_offset: usize, secs: u64) -> Arc<Variable> {
    VariableBuilder::remote(name, offset)
        .bits(bit_offset, 8)
        .uint(8)
        .mode(Mode::ReadOnly)
        .poll_interval(Duration::from_secs(secs))
        .build()
        .expect("valid variable")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_register_builder() {
        let dev = single_register(0x100);
        assert_eq!(dev.blocks().len(), 1);
        assert_eq!(dev.blocks()[0].size(), 4);
        assert_eq!(dev.blocks()[0].offset(), 0x100);
    }
}
