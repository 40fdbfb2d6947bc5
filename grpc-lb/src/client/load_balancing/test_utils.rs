/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::client::ConnectivityState;
use crate::client::load_balancing::{
    ChannelController, LbState, PickArgs, PickResult, Picker, WorkScheduler,
};
use crate::client::name_resolution::Address;
use crate::client::subchannel::{
    ConnectivityWatcher, Subchannel, SubchannelState, SubchannelUpdate, WatchKey,
};
use crate::status::StatusCode;

// A test subchannel that forwards every call to a channel.  This allows tests
// to verify when a subchannel is asked to connect, watched, or unwatched.
#[derive(Debug)]
pub(crate) struct TestSubchannel {
    address: Address,
    tx_events: mpsc::UnboundedSender<TestEvent>,
    // Key of the most recent watch, kept after the watch is cancelled so tests
    // can deliver stale notifications.
    watch_key: Mutex<Option<WatchKey>>,
    watcher: Mutex<Option<ConnectivityWatcher>>,
}

impl TestSubchannel {
    pub(crate) fn new(address: Address, tx_events: mpsc::UnboundedSender<TestEvent>) -> Self {
        Self {
            address,
            tx_events,
            watch_key: Mutex::new(None),
            watcher: Mutex::new(None),
        }
    }

    pub(crate) fn watch_key(&self) -> Option<WatchKey> {
        *self.watch_key.lock()
    }

    /// Builds the update the most recent watch would deliver for `state`.
    pub(crate) fn update(&self, state: ConnectivityState) -> SubchannelUpdate {
        self.update_with_state(SubchannelState::new(state))
    }

    /// Builds a TRANSIENT_FAILURE update carrying `err` as the connection error.
    pub(crate) fn failure(&self, err: &str) -> SubchannelUpdate {
        self.update_with_state(SubchannelState::transient_failure(err.to_string()))
    }

    fn update_with_state(&self, state: SubchannelState) -> SubchannelUpdate {
        let key = self
            .watch_key()
            .unwrap_or_else(|| panic!("no connectivity watch started on {}", self.address));
        SubchannelUpdate { key, state }
    }

    /// Delivers `state` through the active watcher, the way a real subchannel
    /// would.
    pub(crate) fn notify(&self, state: SubchannelState) {
        let watcher = self.watcher.lock().clone();
        match watcher {
            Some(watcher) => watcher.on_connectivity_changed(state),
            None => panic!("no active connectivity watch on {}", self.address),
        }
    }
}

impl Subchannel for TestSubchannel {
    fn address(&self) -> Address {
        self.address.clone()
    }

    fn request_connection(&self) {
        self.tx_events
            .send(TestEvent::Connect(self.address.clone()))
            .unwrap();
    }

    fn reset_backoff(&self) {
        self.tx_events
            .send(TestEvent::ResetBackoff(self.address.clone()))
            .unwrap();
    }

    fn start_connectivity_watch(&self, watcher: ConnectivityWatcher) {
        *self.watch_key.lock() = Some(watcher.key());
        *self.watcher.lock() = Some(watcher);
        self.tx_events
            .send(TestEvent::StartWatch(self.address.clone()))
            .unwrap();
    }

    fn cancel_connectivity_watch(&self, _reason: &str) {
        *self.watcher.lock() = None;
        self.tx_events
            .send(TestEvent::CancelWatch(self.address.clone()))
            .unwrap();
    }
}

pub(crate) enum TestEvent {
    NewSubchannel(Arc<TestSubchannel>),
    UpdatePicker(LbState),
    RequestResolution,
    Connect(Address),
    StartWatch(Address),
    CancelWatch(Address),
    ResetBackoff(Address),
    ScheduleWork,
    SubchannelUpdate(SubchannelUpdate),
}

impl Debug for TestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewSubchannel(sc) => write!(f, "NewSubchannel({})", sc.address()),
            Self::UpdatePicker(state) => write!(
                f,
                "UpdatePicker({}, {:?})",
                state.connectivity_state,
                state.status.message()
            ),
            Self::RequestResolution => write!(f, "RequestResolution"),
            Self::Connect(addr) => write!(f, "Connect({addr})"),
            Self::StartWatch(addr) => write!(f, "StartWatch({addr})"),
            Self::CancelWatch(addr) => write!(f, "CancelWatch({addr})"),
            Self::ResetBackoff(addr) => write!(f, "ResetBackoff({addr})"),
            Self::ScheduleWork => write!(f, "ScheduleWork"),
            Self::SubchannelUpdate(update) => write!(f, "SubchannelUpdate({update:?})"),
        }
    }
}

/// A test channel controller that forwards calls to a channel.  This allows
/// tests to verify when a channel controller is asked to create subchannels or
/// update the picker.
pub(crate) struct TestChannelController {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
    // Addresses for which new_subchannel returns None.
    pub(crate) invalid_addresses: Vec<Address>,
}

impl TestChannelController {
    pub(crate) fn new(tx_events: mpsc::UnboundedSender<TestEvent>) -> Self {
        Self {
            tx_events,
            invalid_addresses: Vec::new(),
        }
    }
}

impl ChannelController for TestChannelController {
    fn new_subchannel(&mut self, address: &Address) -> Option<Arc<dyn Subchannel>> {
        if self.invalid_addresses.contains(address) {
            return None;
        }
        let subchannel = Arc::new(TestSubchannel::new(
            address.clone(),
            self.tx_events.clone(),
        ));
        self.tx_events
            .send(TestEvent::NewSubchannel(subchannel.clone()))
            .unwrap();
        Some(subchannel)
    }

    fn update_picker(&mut self, update: LbState) {
        self.tx_events
            .send(TestEvent::UpdatePicker(update))
            .unwrap();
    }

    fn request_resolution(&mut self) {
        self.tx_events.send(TestEvent::RequestResolution).unwrap();
    }
}

pub(crate) struct TestWorkScheduler {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl WorkScheduler for TestWorkScheduler {
    fn schedule_work(&self) {
        self.tx_events.send(TestEvent::ScheduleWork).unwrap();
    }

    fn schedule_subchannel_update(&self, update: SubchannelUpdate) {
        self.tx_events
            .send(TestEvent::SubchannelUpdate(update))
            .unwrap();
    }
}

// Sends tracing output from the code under test to the test harness.  Set
// RUST_LOG to see it.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Creates `n` distinct addresses.
pub(crate) fn test_addresses(n: usize) -> Vec<Address> {
    (0..n)
        .map(|i| Address::new(format!("{i}.{i}.{i}.{i}:{i}")))
        .collect()
}

// Performs a pick with empty call attributes.
pub(crate) fn pick(picker: &dyn Picker) -> PickResult {
    let headers = http::HeaderMap::new();
    picker.pick(&PickArgs {
        path: "/grpc.testing.TestService/UnaryCall",
        headers: &headers,
    })
}

// Performs a pick that must succeed and returns the address picked.
pub(crate) fn picked_address(picker: &dyn Picker) -> Address {
    match pick(picker) {
        PickResult::Pick(pick) => pick.subchannel.address(),
        other => panic!("unexpected pick result {other:?}"),
    }
}

// Verifies that subchannels are created for the given addresses in the given
// order.  Returns the subchannels created.
pub(crate) async fn verify_subchannel_creation(
    rx_events: &mut mpsc::UnboundedReceiver<TestEvent>,
    addresses: &[Address],
) -> Vec<Arc<TestSubchannel>> {
    let mut subchannels = Vec::new();
    for address in addresses {
        match rx_events.recv().await.unwrap() {
            TestEvent::NewSubchannel(sc) => {
                assert_eq!(&sc.address(), address);
                subchannels.push(sc);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    subchannels
}

// Verifies that connectivity watches are started on the given addresses in the
// given order.
pub(crate) async fn verify_watches_started(
    rx_events: &mut mpsc::UnboundedReceiver<TestEvent>,
    addresses: &[Address],
) {
    for address in addresses {
        match rx_events.recv().await.unwrap() {
            TestEvent::StartWatch(addr) => assert_eq!(&addr, address),
            other => panic!("unexpected event {other:?}"),
        }
    }
}

// Verifies that the connectivity watch on the given address is cancelled.
pub(crate) async fn verify_watch_cancelled(
    rx_events: &mut mpsc::UnboundedReceiver<TestEvent>,
    address: &Address,
) {
    match rx_events.recv().await.unwrap() {
        TestEvent::CancelWatch(addr) => assert_eq!(&addr, address),
        other => panic!("unexpected event {other:?}"),
    }
}

// Verifies that a connection attempt is made to the given address.
pub(crate) async fn verify_connection_attempt(
    rx_events: &mut mpsc::UnboundedReceiver<TestEvent>,
    address: &Address,
) {
    match rx_events.recv().await.unwrap() {
        TestEvent::Connect(addr) => assert_eq!(&addr, address),
        other => panic!("unexpected event {other:?}"),
    }
}

// Verifies that the LB policy requests re-resolution.
pub(crate) async fn verify_resolution_request(rx_events: &mut mpsc::UnboundedReceiver<TestEvent>) {
    match rx_events.recv().await.unwrap() {
        TestEvent::RequestResolution => {}
        other => panic!("unexpected event {other:?}"),
    }
}

// Verifies that the channel moves to IDLE with a picker that queues.
//
// Returns the picker for tests to make more picks, if required.
pub(crate) async fn verify_idle_picker(
    rx_events: &mut mpsc::UnboundedReceiver<TestEvent>,
) -> Arc<dyn Picker> {
    match rx_events.recv().await.unwrap() {
        TestEvent::UpdatePicker(update) => {
            assert_eq!(update.connectivity_state, ConnectivityState::Idle);
            update.picker
        }
        other => panic!("unexpected event {other:?}"),
    }
}

// Verifies that the channel moves to CONNECTING with a queuing picker.
pub(crate) async fn verify_connecting_picker(rx_events: &mut mpsc::UnboundedReceiver<TestEvent>) {
    match rx_events.recv().await.unwrap() {
        TestEvent::UpdatePicker(update) => {
            assert_eq!(update.connectivity_state, ConnectivityState::Connecting);
            assert!(update.status.is_ok());
            assert!(matches!(pick(update.picker.as_ref()), PickResult::Queue));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

// Verifies that the channel moves to READY.
//
// Returns the picker for tests to make more picks.
pub(crate) async fn verify_ready_picker(
    rx_events: &mut mpsc::UnboundedReceiver<TestEvent>,
) -> Arc<dyn Picker> {
    match rx_events.recv().await.unwrap() {
        TestEvent::UpdatePicker(update) => {
            assert_eq!(update.connectivity_state, ConnectivityState::Ready);
            assert!(update.status.is_ok());
            update.picker
        }
        other => panic!("unexpected event {other:?}"),
    }
}

// Verifies that the channel moves to TRANSIENT_FAILURE with a picker that fails
// with an UNAVAILABLE status whose message contains `want_error`.
pub(crate) async fn verify_transient_failure_picker(
    rx_events: &mut mpsc::UnboundedReceiver<TestEvent>,
    want_error: &str,
) {
    match rx_events.recv().await.unwrap() {
        TestEvent::UpdatePicker(update) => {
            assert_eq!(
                update.connectivity_state,
                ConnectivityState::TransientFailure
            );
            assert_eq!(update.status.code(), StatusCode::Unavailable);
            assert!(
                update.status.message().contains(want_error),
                "status {:?} does not contain {want_error:?}",
                update.status.message()
            );
            match pick(update.picker.as_ref()) {
                PickResult::Fail(status) => assert_eq!(status, update.status),
                other => panic!("unexpected pick result {other:?}"),
            }
        }
        other => panic!("unexpected event {other:?}"),
    }
}

const DEFAULT_TEST_SHORT_TIMEOUT: Duration = Duration::from_millis(50);

pub(crate) async fn verify_no_activity(rx_events: &mut mpsc::UnboundedReceiver<TestEvent>) {
    tokio::select! {
        _ = tokio::time::sleep(DEFAULT_TEST_SHORT_TIMEOUT) => {}
        event = rx_events.recv() => {
            panic!("unexpected event {:?}", event.unwrap());
        }
    }
}
