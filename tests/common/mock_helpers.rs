//! Mock construction helpers

use mockall::{mock, Sequence};
use parking_lot::Mutex;
use regtree_rs::transport::{self, Transaction, TransactionKind};
use std::sync::Arc;

mock! {
    pub Transport {}

    impl transport::Transport for Transport {
        fn endpoint_id(&self) -> u64;
        fn min_access(&self) -> usize;
        fn max_access(&self) -> usize;
        fn request(&self, transaction: Transaction);
    }
}

/// Mock with fixed geometry and no request expectations yet
pub fn mock_transport(endpoint: u64) -> MockTransport {
    let mut mock = MockTransport::new();
    mock.expect_endpoint_id().return_const(endpoint);
    mock.expect_min_access().return_const(1usize);
    mock.expect_max_access().return_const(usize::MAX);
    mock
}

/// Expect exactly one Write followed by exactly one Verify
///
/// The Write completes and stores its bytes; the Verify returns them.
pub fn expect_write_then_verify(mock: &mut MockTransport, address: u64) {
    let mut seq = Sequence::new();
    let stored = Arc::new(Mutex::new(Vec::new()));

    let written = stored.clone();
    mock.expect_request()
        .withf(move |t| t.kind == TransactionKind::Write && t.address == address)
        .times(1)
        .in_sequence(&mut seq)
        .returning(move |t| {
            *written.lock() = t.data.clone();
            t.done(None);
        });

    let readback = stored;
    mock.expect_request()
        .withf(move |t| t.kind == TransactionKind::Verify && t.address == address)
        .times(1)
        .in_sequence(&mut seq)
        .returning(move |t| {
            let data = readback.lock().clone();
            t.done(Some(data));
        });
}
