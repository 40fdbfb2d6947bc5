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

//! The boundary between LB policies and the connection layer.
//!
//! Subchannels are implemented outside this crate; an LB policy only sees the
//! [`Subchannel`] trait.  Connectivity changes flow back to the policy as
//! [`SubchannelUpdate`]s addressed by a [`WatchKey`], which the connection
//! layer marshals onto the policy's serialization domain through the
//! [`ConnectivityWatcher`] it was handed when the watch started.

use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::client::ConnectivityState;
use crate::client::load_balancing::WorkScheduler;
use crate::client::name_resolution::Address;

/// A Subchannel represents a method of communicating with a server which may be
/// connected or disconnected many times across its lifetime.
///
/// - Subchannels start IDLE.
///
/// - IDLE transitions to CONNECTING when request_connection() is called.
///
/// - CONNECTING transitions to READY on success or TRANSIENT_FAILURE on error.
///
/// - READY transitions to IDLE when the connection is lost.
///
/// - TRANSIENT_FAILURE transitions to CONNECTING when the reconnect backoff
///   timer has expired.  This timer scales exponentially and is reset when the
///   subchannel becomes READY.
///
/// Implementations are free-threaded.  They must never call into an LB policy
/// directly; every state change goes through the [`ConnectivityWatcher`].
pub trait Subchannel: Send + Sync + Debug {
    /// The address this subchannel connects to.
    fn address(&self) -> Address;

    /// Triggers a connection attempt if the subchannel is IDLE.  Does nothing
    /// otherwise.
    fn request_connection(&self);

    /// Resets the reconnect backoff timer so that the next connection attempt
    /// happens immediately.
    fn reset_backoff(&self);

    /// Starts delivering connectivity state changes to `watcher`.
    ///
    /// The first delivery must carry the subchannel's current state.  States
    /// must be delivered in the order they occurred, and Shutdown must never be
    /// delivered.
    fn start_connectivity_watch(&self, watcher: ConnectivityWatcher);

    /// Stops delivering connectivity state changes to the watcher installed by
    /// the last call to start_connectivity_watch.
    fn cancel_connectivity_watch(&self, reason: &str);
}

/// Represents the current state of a Subchannel.
#[derive(Clone)]
pub struct SubchannelState {
    /// The connectivity state of the subchannel.  See [`Subchannel`] for a
    /// description of the various states and their valid transitions.
    pub connectivity_state: ConnectivityState,
    // Set if connectivity state is TransientFailure to describe the most recent
    // connection error.  None for any other connectivity_state value.
    pub last_connection_error: Option<Arc<dyn Error + Send + Sync>>,
}

impl SubchannelState {
    pub fn new(connectivity_state: ConnectivityState) -> Self {
        Self {
            connectivity_state,
            last_connection_error: None,
        }
    }

    /// Creates a TransientFailure state carrying the connection error.
    pub fn transient_failure(error: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        let error: Box<dyn Error + Send + Sync> = error.into();
        Self {
            connectivity_state: ConnectivityState::TransientFailure,
            last_connection_error: Some(Arc::from(error)),
        }
    }
}

impl Default for SubchannelState {
    fn default() -> Self {
        Self::new(ConnectivityState::Idle)
    }
}

impl Debug for SubchannelState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubchannelState")
            .field("connectivity_state", &self.connectivity_state)
            .field(
                "last_connection_error",
                &self.last_connection_error.as_ref().map(|e| e.to_string()),
            )
            .finish()
    }
}

impl Display for SubchannelState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.last_connection_error {
            Some(err) => write!(f, "{} ({err})", self.connectivity_state),
            None => write!(f, "{}", self.connectivity_state),
        }
    }
}

static NEXT_SUBCHANNEL_LIST_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one subchannel list for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubchannelListId(u64);

impl SubchannelListId {
    pub(crate) fn new() -> Self {
        Self(NEXT_SUBCHANNEL_LIST_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for SubchannelListId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Routes a connectivity notification back to the subchannel list entry that
/// started the watch.  The key does not keep the list alive; the policy checks
/// at dispatch time whether the list is still in play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchKey {
    pub(crate) list: SubchannelListId,
    pub(crate) index: usize,
}

impl WatchKey {
    pub fn list(&self) -> SubchannelListId {
        self.list
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

/// A connectivity state change for one watched subchannel.
#[derive(Clone, Debug)]
pub struct SubchannelUpdate {
    pub key: WatchKey,
    pub state: SubchannelState,
}

/// Handed to [`Subchannel::start_connectivity_watch`].  The connection layer
/// calls [`on_connectivity_changed`] from any thread; the update is queued
/// onto the policy's work scheduler instead of running inline.
///
/// [`on_connectivity_changed`]: ConnectivityWatcher::on_connectivity_changed
#[derive(Clone)]
pub struct ConnectivityWatcher {
    key: WatchKey,
    work_scheduler: Arc<dyn WorkScheduler>,
}

impl ConnectivityWatcher {
    pub(crate) fn new(key: WatchKey, work_scheduler: Arc<dyn WorkScheduler>) -> Self {
        Self {
            key,
            work_scheduler,
        }
    }

    pub fn key(&self) -> WatchKey {
        self.key
    }

    /// Queues a state change for delivery to the LB policy.
    pub fn on_connectivity_changed(&self, state: SubchannelState) {
        self.work_scheduler
            .schedule_subchannel_update(SubchannelUpdate {
                key: self.key,
                state,
            });
    }
}

impl Debug for ConnectivityWatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityWatcher")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
