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

//! Shared bookkeeping for LB policies that manage one subchannel per resolved
//! address.
//!
//! A [`SubchannelList`] is built from a single resolver update and never
//! changes its membership afterwards; a new update always produces a new list.
//! Each entry is a [`SubchannelData`] holding the subchannel handle, whether a
//! connectivity watch is outstanding, the last state the subchannel reported,
//! and a policy-specific payload `D`.
//!
//! Watches are keyed by [`WatchKey`] (list id plus index) instead of pointing
//! back at the list.  The owning policy checks the key when a notification
//! arrives and drops it if the list is no longer in play.

use std::sync::Arc;

use tracing::{debug, error, trace};

use crate::client::ConnectivityState;
use crate::client::load_balancing::{ChannelController, WorkScheduler};
use crate::client::name_resolution::Address;
use crate::client::subchannel::{ConnectivityWatcher, Subchannel, SubchannelListId, WatchKey};

/// One address's entry in a [`SubchannelList`].
#[derive(Debug)]
pub(crate) struct SubchannelData<D> {
    address: Address,
    // None once the entry has been shut down.
    subchannel: Option<Arc<dyn Subchannel>>,
    // None until the first notification arrives.
    connectivity_state: Option<ConnectivityState>,
    watching: bool,
    pub(crate) data: D,
}

impl<D> SubchannelData<D> {
    pub(crate) fn address(&self) -> &Address {
        &self.address
    }

    pub(crate) fn subchannel(&self) -> Option<&Arc<dyn Subchannel>> {
        self.subchannel.as_ref()
    }

    /// The last raw state reported for this subchannel, if any.
    pub(crate) fn connectivity_state(&self) -> Option<ConnectivityState> {
        self.connectivity_state
    }
}

/// A raw connectivity change recorded against a [`SubchannelData`].  `old` is
/// None exactly once, on the first notification after the watch started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StateTransition {
    pub(crate) old: Option<ConnectivityState>,
    pub(crate) new: ConnectivityState,
}

/// An ordered, fixed-membership collection of subchannels built from one
/// address list.
#[derive(Debug)]
pub(crate) struct SubchannelList<D> {
    id: SubchannelListId,
    policy: &'static str,
    subchannels: Vec<SubchannelData<D>>,
}

impl<D: Default> SubchannelList<D> {
    /// Creates a subchannel for every usable address.  Addresses the channel
    /// rejects are skipped, so the resulting list may be shorter than
    /// `addresses` (or empty).
    ///
    /// No watches are started and no connections are requested; callers
    /// decide when to do either.
    pub(crate) fn new(
        policy: &'static str,
        addresses: &[Address],
        channel_controller: &mut dyn ChannelController,
    ) -> Self {
        let id = SubchannelListId::new();
        let mut subchannels = Vec::with_capacity(addresses.len());
        for address in addresses {
            let Some(subchannel) = channel_controller.new_subchannel(address) else {
                debug!(policy, list = %id, %address, "skipping unusable address");
                continue;
            };
            subchannels.push(SubchannelData {
                address: address.clone(),
                subchannel: Some(subchannel),
                connectivity_state: None,
                watching: false,
                data: D::default(),
            });
        }
        debug!(
            policy,
            list = %id,
            num_subchannels = subchannels.len(),
            "created subchannel list"
        );
        Self {
            id,
            policy,
            subchannels,
        }
    }
}

impl<D> SubchannelList<D> {
    pub(crate) fn id(&self) -> SubchannelListId {
        self.id
    }

    pub(crate) fn len(&self) -> usize {
        self.subchannels.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.subchannels.is_empty()
    }

    pub(crate) fn subchannel(&self, index: usize) -> &SubchannelData<D> {
        &self.subchannels[index]
    }

    pub(crate) fn subchannel_mut(&mut self, index: usize) -> &mut SubchannelData<D> {
        &mut self.subchannels[index]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &SubchannelData<D>> {
        self.subchannels.iter()
    }

    /// Reports whether `key` names an entry of this list whose watch is still
    /// outstanding.
    pub(crate) fn is_watching(&self, key: WatchKey) -> bool {
        key.list == self.id
            && self
                .subchannels
                .get(key.index)
                .is_some_and(|sd| sd.watching)
    }

    /// Starts delivering connectivity changes for the entry at `index` to
    /// `work_scheduler`.
    pub(crate) fn start_connectivity_watch(
        &mut self,
        index: usize,
        work_scheduler: &Arc<dyn WorkScheduler>,
    ) {
        let key = WatchKey {
            list: self.id,
            index,
        };
        let sd = &mut self.subchannels[index];
        let Some(subchannel) = &sd.subchannel else {
            return;
        };
        trace!(policy = self.policy, list = %self.id, index, "starting connectivity watch");
        sd.watching = true;
        subchannel.start_connectivity_watch(ConnectivityWatcher::new(key, work_scheduler.clone()));
    }

    /// Stops connectivity notifications for the entry at `index`.
    pub(crate) fn cancel_connectivity_watch(&mut self, index: usize, reason: &str) {
        let sd = &mut self.subchannels[index];
        if !sd.watching {
            return;
        }
        sd.watching = false;
        if let Some(subchannel) = &sd.subchannel {
            trace!(policy = self.policy, list = %self.id, index, reason, "cancelling connectivity watch");
            subchannel.cancel_connectivity_watch(reason);
        }
    }

    /// Cancels the watch on the entry at `index` and releases its subchannel.
    pub(crate) fn shutdown_subchannel(&mut self, index: usize, reason: &str) {
        self.cancel_connectivity_watch(index, reason);
        self.subchannels[index].subchannel = None;
    }

    /// Asks the subchannel at `index` to connect.  Does nothing if the entry
    /// has been shut down.
    pub(crate) fn request_connection(&self, index: usize) {
        if let Some(subchannel) = &self.subchannels[index].subchannel {
            subchannel.request_connection();
        }
    }

    pub(crate) fn reset_backoff(&self) {
        for subchannel in self.subchannels.iter().filter_map(|sd| sd.subchannel.as_ref()) {
            subchannel.reset_backoff();
        }
    }

    /// Reports whether every entry has delivered its first notification.
    pub(crate) fn all_subchannels_seen_initial_state(&self) -> bool {
        self.subchannels
            .iter()
            .all(|sd| sd.connectivity_state().is_some())
    }

    /// Records a raw state reported by the watch on the entry at `index`.
    ///
    /// Returns None if that watch is no longer outstanding, in which case the
    /// notification must be ignored.
    pub(crate) fn record_connectivity_state(
        &mut self,
        index: usize,
        new: ConnectivityState,
    ) -> Option<StateTransition> {
        let sd = self.subchannels.get_mut(index)?;
        if !sd.watching {
            return None;
        }
        if new == ConnectivityState::Shutdown {
            error!(
                policy = self.policy,
                list = %self.id,
                index,
                "subchannel reported SHUTDOWN through a connectivity watch"
            );
            debug_assert!(false, "SHUTDOWN delivered as a new connectivity state");
            return None;
        }
        let old = sd.connectivity_state.replace(new);
        trace!(
            policy = self.policy,
            list = %self.id,
            index,
            address = %sd.address,
            ?old,
            ?new,
            "subchannel connectivity changed"
        );
        Some(StateTransition { old, new })
    }
}

impl<D> Drop for SubchannelList<D> {
    fn drop(&mut self) {
        debug!(policy = self.policy, list = %self.id, "shutting down subchannel list");
        for index in 0..self.subchannels.len() {
            self.shutdown_subchannel(index, "subchannel list shut down");
        }
    }
}
