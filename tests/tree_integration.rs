//! Integration tests for tree structure and activation
//!
//! These tests validate:
//! - Overlap detection at activation
//! - Address and transport inheritance
//! - Array children and path lookup
//! - Device hooks, enable flags and resets

mod common;

use common::builders::{memory, quiet_config, root_on, single_register};
use parking_lot::Mutex;
use regtree_rs::prelude::*;
use regtree_rs::RegError;

fn register_at(name: &str, offset: u64) -> Device {
    let mut dev = Device::new(name).with_offset(offset);
    dev.add_variable(VariableBuilder::remote("Reg", 0x0).uint(32).build().unwrap())
        .unwrap();
    dev
}

#[test]
fn test_overlapping_blocks_fail_activation() {
    let mut root = root_on(memory());
    root.add_device(register_at("A", 0x0)).unwrap();
    root.add_device(register_at("B", 0x2)).unwrap();
    assert!(matches!(root.start(), Err(RegError::Node(_))));
}

#[test]
fn test_adjacent_blocks_activate() {
    let mut root = root_on(memory());
    root.add_device(register_at("A", 0x0)).unwrap();
    root.add_device(register_at("B", 0x4)).unwrap();
    root.start().unwrap();
}

#[test]
fn test_separate_endpoints_may_share_addresses() {
    let mut root = root_on(memory());
    root.add_device(register_at("A", 0x0)).unwrap();
    root.add_device(register_at("B", 0x2).with_transport(memory()))
        .unwrap();
    root.start().unwrap();
}

#[test]
fn test_overlap_check_can_be_disabled() {
    let mut config = quiet_config();
    config.startup.check_overlaps = false;
    let mut root = Root::new("Top", config).with_transport(memory());
    root.add_device(register_at("A", 0x0)).unwrap();
    root.add_device(register_at("B", 0x2)).unwrap();
    root.start().unwrap();
}

#[test]
fn test_missing_transport_fails_activation() {
    let mut root = Root::new("Top", quiet_config());
    root.add_device(single_register(0x0)).unwrap();
    assert!(matches!(root.start(), Err(RegError::Node(_))));
}

#[test]
fn test_addresses_accumulate_through_nesting() {
    let transport = memory();
    let mut root = root_on(transport.clone());
    let mut outer = Device::new("Outer").with_offset(0x200);
    outer.add_device(register_at("Inner", 0x10)).unwrap();
    root.add_device(outer).unwrap();
    root.start().unwrap();

    let reg = root.variable("Outer.Inner.Reg").unwrap();
    assert_eq!(reg.path(), "Top.Outer.Inner.Reg");
    assert_eq!(reg.block().unwrap().address(), Some(0x210));

    reg.set(1u32, true);
    assert_eq!(transport.log()[0].address, 0x210);
}

#[test]
fn test_array_children() {
    let mut root = root_on(memory());
    for i in 0..4u64 {
        root.add_device(register_at(&format!("Chan[{}]", i), i * 0x10))
            .unwrap();
    }
    root.start().unwrap();

    let members = root.device().array("Chan");
    assert_eq!(members.len(), 4);
    assert_eq!(members[2].path(), "Top.Chan[2]");
    let reg = root.variable("Chan[3].Reg").unwrap();
    assert_eq!(reg.block().unwrap().address(), Some(0x30));
    assert!(root.get_node("Chan[9]").is_none());
}

#[test]
fn test_duplicate_names_rejected() {
    let mut root = root_on(memory());
    root.add_device(Device::new("Dev")).unwrap();
    assert!(matches!(
        root.add_device(Device::new("Dev")),
        Err(RegError::Node(_))
    ));
}

#[test]
fn test_disabled_device_skips_background_transactions() {
    let transport = memory();
    let mut root = root_on(transport.clone());
    root.add_device(register_at("On", 0x0)).unwrap();
    let off = root.add_device(register_at("Off", 0x10)).unwrap();
    root.start().unwrap();

    off.set_enabled(false);
    root.read_all().unwrap();
    assert_eq!(transport.count(TransactionKind::Read), 1);
    assert_eq!(transport.log()[0].address, 0x0);

    // Disabling the root disables everything below it
    root.device().set_enabled(false);
    transport.clear_log();
    root.read_all().unwrap();
    assert!(transport.log().is_empty());
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl DeviceHooks for Recorder {
    fn on_background_transaction(&self, device: &Device, kind: TransactionKind) {
        self.events.lock().push(format!("{} {}", kind, device.name()));
    }

    fn on_reset(&self, device: &Device, kind: ResetKind) {
        self.events.lock().push(format!("{:?} {}", kind, device.name()));
    }
}

#[test]
fn test_device_hooks_and_reset() {
    let recorder = Arc::new(Recorder::default());
    let mut root = root_on(memory());
    root.add_device(register_at("Run", 0x0).with_hooks(recorder.clone()))
        .unwrap();
    root.start().unwrap();

    root.read_all().unwrap();
    root.reset(ResetKind::Soft);
    let events = recorder.events.lock().clone();
    assert_eq!(
        events,
        vec![
            format!("{} Run", TransactionKind::Read),
            "Soft Run".to_string()
        ]
    );
}

#[test]
fn test_shared_hooks_run_once_per_pass() {
    let reads = Arc::new(Mutex::new(0));
    let writes = Arc::new(Mutex::new(0));
    let before: regtree_rs::variable::Hook = {
        let reads = reads.clone();
        Arc::new(move || *reads.lock() += 1)
    };
    let after: regtree_rs::variable::Hook = {
        let writes = writes.clone();
        Arc::new(move || *writes.lock() += 1)
    };

    let mut dev = Device::new("Dev");
    for (i, name) in ["A", "B", "C"].into_iter().enumerate() {
        dev.add_variable(
            VariableBuilder::remote(name, (i * 4) as u64)
                .uint(32)
                .before_read(before.clone())
                .after_write(after.clone())
                .build()
                .unwrap(),
        )
        .unwrap();
    }
    let mut root = root_on(memory());
    root.add_device(dev).unwrap();
    root.start().unwrap();

    root.read_all().unwrap();
    root.write_all(true).unwrap();
    assert_eq!(*reads.lock(), 1);
    assert_eq!(*writes.lock(), 1);
}

#[test]
fn test_cannot_add_after_start() {
    let mut root = root_on(memory());
    root.add_device(Device::new("Dev")).unwrap();
    root.start().unwrap();
    assert!(matches!(
        root.add_device(Device::new("Late")),
        Err(RegError::Node(_))
    ));
}
