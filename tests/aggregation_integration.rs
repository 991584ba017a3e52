//! Integration tests for update batching
//!
//! These tests validate that notifications recorded inside a batch scope
//! coalesce per path, and that bulk operations flush once.

mod common;

use common::builders::{memory, root_on};
use parking_lot::Mutex;
use regtree_rs::prelude::*;
use std::time::Duration;

type Batches = Arc<Mutex<Vec<Vec<(String, Value)>>>>;

fn record_batches(root: &Root) -> Batches {
    let batches: Batches = Arc::new(Mutex::new(Vec::new()));
    let sink = batches.clone();
    root.add_batch_listener(move |batch| {
        sink.lock().push(
            batch
                .iter()
                .map(|u| (u.path.clone(), u.value.clone()))
                .collect(),
        );
    });
    batches
}

#[test]
fn test_same_path_twice_coalesces_to_latest() {
    let mut root = root_on(memory());
    let counter = VariableBuilder::local("Counter").value(0u32).build().unwrap();
    root.add_variable(counter.clone()).unwrap();
    let batches = record_batches(&root);
    root.start().unwrap();

    {
        let _scope = root.aggregator().scope(Duration::ZERO);
        counter.set(1u32, false);
        counter.set(2u32, false);
    }
    root.aggregator().flush_sync();

    let batches = batches.lock();
    assert_eq!(batches.len(), 1);
    assert_eq!(
        batches[0],
        vec![("Top.Counter".to_string(), Value::UInt(2))]
    );
}

#[test]
fn test_read_all_flushes_one_batch() {
    let transport = memory();
    let mut root = root_on(transport.clone());
    let mut dev = Device::new("Dev");
    for i in 0..8u64 {
        dev.add_variable(
            VariableBuilder::remote(format!("R{}", i), i * 4)
                .uint(32)
                .build()
                .unwrap(),
        )
        .unwrap();
    }
    root.add_device(dev).unwrap();
    let batches = record_batches(&root);
    let done = Arc::new(Mutex::new(0));
    let done_count = done.clone();
    root.add_batch_done_callback(move || *done_count.lock() += 1);
    root.start().unwrap();

    root.read_all().unwrap();
    root.aggregator().flush_sync();

    let batches = batches.lock();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 8);
    assert_eq!(*done.lock(), 1);
}

#[test]
fn test_variable_listeners_see_every_flush() {
    let mut root = root_on(memory());
    let level = VariableBuilder::local("Level").build().unwrap();
    root.add_variable(level.clone()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    level.add_listener(move |path, value| sink.lock().push((path.to_string(), value.clone())));
    root.start().unwrap();

    level.set(Value::Float(0.5), false);
    level.set(Value::Float(0.75), false);
    root.aggregator().flush_sync();

    assert_eq!(
        *seen.lock(),
        vec![
            ("Top.Level".to_string(), Value::Float(0.5)),
            ("Top.Level".to_string(), Value::Float(0.75)),
        ]
    );
}

#[test]
fn test_listener_may_set_other_variables() {
    let mut root = root_on(memory());
    let source = VariableBuilder::local("Source").build().unwrap();
    let mirror = VariableBuilder::local("Mirror").build().unwrap();
    root.add_variable(source.clone()).unwrap();
    root.add_variable(mirror.clone()).unwrap();

    let target = mirror.clone();
    source.add_listener(move |_, value| target.set(value.clone(), false));
    root.start().unwrap();

    source.set(5u32, false);
    root.aggregator().flush_sync();
    assert_eq!(mirror.value(), Value::UInt(5));
}
