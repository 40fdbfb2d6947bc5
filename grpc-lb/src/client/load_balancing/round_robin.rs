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

//! The round_robin LB policy.
//!
//! round_robin connects to every address it is given and spreads RPCs across
//! all READY subchannels.  Failed subchannels are retried immediately, and
//! every failure asks the resolver for fresh addresses.
//!
//! The aggregate state is derived from per-list counters of each subchannel's
//! *logical* state: IDLE counts as CONNECTING, and a subchannel that reached
//! TRANSIENT_FAILURE keeps counting as failed until it becomes READY again.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use serde::Deserialize;
use tracing::{debug, error, trace};

use crate::client::ConnectivityState;
use crate::client::load_balancing::subchannel_list::SubchannelList;
use crate::client::load_balancing::{
    ChannelController, GLOBAL_LB_REGISTRY, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState,
    Pick, PickArgs, PickResult, Picker, WorkScheduler,
};
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::client::service_config::{LbConfig, LbConfigError, ParsedJsonLbConfig};
use crate::client::subchannel::{Subchannel, SubchannelUpdate};
use crate::status::Status;

pub static POLICY_NAME: &str = "round_robin";

struct RoundRobinBuilder {}

impl LbPolicyBuilder for RoundRobinBuilder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        debug!(policy = POLICY_NAME, "created LB policy");
        Box::new(RoundRobinPolicy::new(options.work_scheduler))
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, LbConfigError> {
        let cfg: RoundRobinConfig = config.convert_to(POLICY_NAME)?;
        Ok(Some(LbConfig::new(cfg)))
    }
}

// round_robin takes no options, but its config must still be a JSON object.
#[derive(Deserialize, Debug)]
struct RoundRobinConfig {}

/// Registers the round_robin policy in the global registry.
pub fn reg() {
    static REGISTER_ONCE: Once = Once::new();
    REGISTER_ONCE.call_once(|| {
        GLOBAL_LB_REGISTRY.add_builder(RoundRobinBuilder {});
    });
}

// A subchannel list whose per-subchannel data is the logical connectivity
// state, with running counts of each logical state.
#[derive(Debug)]
struct RoundRobinSubchannelList {
    list: SubchannelList<Option<ConnectivityState>>,
    num_ready: usize,
    num_connecting: usize,
    num_transient_failure: usize,
}

impl RoundRobinSubchannelList {
    // Builds the list, starts watching every subchannel and asks each one to
    // connect.
    fn new(
        addresses: &[Address],
        channel_controller: &mut dyn ChannelController,
        work_scheduler: &Arc<dyn WorkScheduler>,
    ) -> Self {
        let mut list = SubchannelList::new(POLICY_NAME, addresses, channel_controller);
        for index in 0..list.len() {
            list.start_connectivity_watch(index, work_scheduler);
        }
        for index in 0..list.len() {
            list.request_connection(index);
        }
        Self {
            list,
            num_ready: 0,
            num_connecting: 0,
            num_transient_failure: 0,
        }
    }

    // Folds a raw state into the logical state of the subchannel at `index`.
    // Returns true if the logical state changed.
    fn update_logical_state(&mut self, index: usize, state: ConnectivityState) -> bool {
        let old = self.list.subchannel(index).data;
        // Failures stick until the subchannel recovers.
        if old == Some(ConnectivityState::TransientFailure) && state != ConnectivityState::Ready {
            return false;
        }
        let new = match state {
            ConnectivityState::Idle => ConnectivityState::Connecting,
            other => other,
        };
        if old == Some(new) {
            return false;
        }
        self.update_state_counters(old, new);
        self.list.subchannel_mut(index).data = Some(new);
        true
    }

    fn update_state_counters(&mut self, old: Option<ConnectivityState>, new: ConnectivityState) {
        if let Some(old) = old {
            if let Some(counter) = self.counter_mut(old) {
                debug_assert!(*counter > 0, "state counter underflow");
                *counter = counter.saturating_sub(1);
            }
        }
        if let Some(counter) = self.counter_mut(new) {
            *counter += 1;
        }
    }

    fn counter_mut(&mut self, state: ConnectivityState) -> Option<&mut usize> {
        match state {
            ConnectivityState::Ready => Some(&mut self.num_ready),
            ConnectivityState::Connecting => Some(&mut self.num_connecting),
            ConnectivityState::TransientFailure => Some(&mut self.num_transient_failure),
            ConnectivityState::Idle | ConnectivityState::Shutdown => None,
        }
    }

    fn all_transient_failure(&self) -> bool {
        self.num_transient_failure == self.list.len()
    }

    fn ready_subchannels(&self) -> Vec<Arc<dyn Subchannel>> {
        self.list
            .iter()
            .filter(|sd| sd.data == Some(ConnectivityState::Ready))
            .filter_map(|sd| sd.subchannel().cloned())
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ListSlot {
    Current,
    Pending,
}

struct RoundRobinPolicy {
    work_scheduler: Arc<dyn WorkScheduler>,
    subchannel_list: Option<RoundRobinSubchannelList>,
    // The list built from the latest update, until it earns promotion.
    pending_subchannel_list: Option<RoundRobinSubchannelList>,
    shutdown: bool,
}

impl RoundRobinPolicy {
    fn new(work_scheduler: Arc<dyn WorkScheduler>) -> Self {
        Self {
            work_scheduler,
            subchannel_list: None,
            pending_subchannel_list: None,
            shutdown: false,
        }
    }

    fn list_mut(&mut self, slot: ListSlot) -> Option<&mut RoundRobinSubchannelList> {
        match slot {
            ListSlot::Current => self.subchannel_list.as_mut(),
            ListSlot::Pending => self.pending_subchannel_list.as_mut(),
        }
    }

    fn slot_watching(&self, update: &SubchannelUpdate) -> Option<ListSlot> {
        let watching = |list: &Option<RoundRobinSubchannelList>| {
            list.as_ref()
                .is_some_and(|l| l.list.is_watching(update.key))
        };
        if watching(&self.subchannel_list) {
            Some(ListSlot::Current)
        } else if watching(&self.pending_subchannel_list) {
            Some(ListSlot::Pending)
        } else {
            None
        }
    }

    // Promotes the pending list if it has earned it, then reports the state of
    // the current list if `slot` is (now) current.
    fn maybe_update_connectivity_state(
        &mut self,
        slot: ListSlot,
        status_for_transient_failure: Status,
        channel_controller: &mut dyn ChannelController,
    ) {
        let mut slot = slot;
        if let Some(pending) = self
            .pending_subchannel_list
            .as_ref()
            .filter(|_| slot == ListSlot::Pending)
        {
            let current_ready = self.subchannel_list.as_ref().map(|l| l.num_ready);
            // An all-failed pending list still wins: the latest update from
            // the control plane is honoured even if it regresses READY.
            if current_ready.is_none_or(|n| n == 0)
                || pending.num_ready > 0
                || pending.all_transient_failure()
            {
                debug!(
                    policy = POLICY_NAME,
                    old = ?self.subchannel_list.as_ref().map(|l| l.list.id()),
                    old_num_ready = ?current_ready,
                    new = %pending.list.id(),
                    num_ready = pending.num_ready,
                    num_connecting = pending.num_connecting,
                    num_transient_failure = pending.num_transient_failure,
                    "swapping in pending subchannel list"
                );
                self.subchannel_list = self.pending_subchannel_list.take();
                slot = ListSlot::Current;
            }
        }
        if slot != ListSlot::Current {
            return;
        }
        let Some(list) = &self.subchannel_list else {
            return;
        };
        // First matching rule wins.
        if list.num_ready > 0 {
            debug!(policy = POLICY_NAME, num_ready = list.num_ready, "reporting READY");
            let picker = RoundRobinPicker::new(list.ready_subchannels());
            channel_controller.update_picker(LbState::ready(Arc::new(picker)));
        } else if list.num_connecting > 0 {
            debug!(policy = POLICY_NAME, "reporting CONNECTING");
            channel_controller.update_picker(LbState::connecting());
        } else if list.all_transient_failure() {
            debug!(
                policy = POLICY_NAME,
                status = %status_for_transient_failure,
                "reporting TRANSIENT_FAILURE"
            );
            channel_controller.update_picker(LbState::transient_failure(
                status_for_transient_failure,
            ));
        }
    }
}

impl LbPolicy for RoundRobinPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        _config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) {
        if self.shutdown {
            return;
        }
        let resolution_note = update.resolution_note().to_string();
        let (addresses, resolver_error) = match update.addresses {
            Ok(addresses) => {
                debug!(
                    policy = POLICY_NAME,
                    num_addresses = addresses.len(),
                    "received resolver update"
                );
                (addresses, None)
            }
            Err(status) => {
                debug!(policy = POLICY_NAME, %status, "received resolver error");
                // Keep using the existing list, if there is one.
                if self.subchannel_list.is_some() {
                    return;
                }
                (Vec::new(), Some(status))
            }
        };

        let list =
            RoundRobinSubchannelList::new(&addresses, channel_controller, &self.work_scheduler);
        if let Some(old) = &self.pending_subchannel_list {
            debug!(
                policy = POLICY_NAME,
                old = %old.list.id(),
                new = %list.list.id(),
                "replacing pending subchannel list"
            );
        }
        let is_empty = list.list.is_empty();
        self.pending_subchannel_list = Some(list);

        if is_empty {
            self.subchannel_list = self.pending_subchannel_list.take();
            let status = resolver_error.unwrap_or_else(|| {
                Status::unavailable(format!("empty address list: {resolution_note}"))
            });
            debug!(policy = POLICY_NAME, %status, "no usable addresses");
            channel_controller.update_picker(LbState::transient_failure(status));
        }
    }

    fn subchannel_update(
        &mut self,
        update: SubchannelUpdate,
        channel_controller: &mut dyn ChannelController,
    ) {
        if self.shutdown {
            error!(policy = POLICY_NAME, key = ?update.key, "subchannel update after shutdown");
            debug_assert!(false, "subchannel update delivered after shutdown");
            return;
        }
        let Some(slot) = self.slot_watching(&update) else {
            trace!(policy = POLICY_NAME, key = ?update.key, "ignoring stale subchannel update");
            return;
        };
        let index = update.key.index();
        let Some(list) = self.list_mut(slot) else {
            return;
        };
        let Some(transition) = list
            .list
            .record_connectivity_state(index, update.state.connectivity_state)
        else {
            return;
        };

        // The initial IDLE is not a failure; losing a READY connection is.
        if transition.new == ConnectivityState::TransientFailure
            || (transition.old == Some(ConnectivityState::Ready)
                && transition.new == ConnectivityState::Idle)
        {
            debug!(
                policy = POLICY_NAME,
                address = %list.list.subchannel(index).address(),
                state = %update.state,
                "subchannel lost connectivity; requesting re-resolution"
            );
            channel_controller.request_resolution();
            list.list.request_connection(index);
        }

        if list.update_logical_state(index, transition.new) {
            let message = match &update.state.last_connection_error {
                Some(err) => format!("connections to all backends failing; last error: {err}"),
                None => "connections to all backends failing".to_string(),
            };
            self.maybe_update_connectivity_state(
                slot,
                Status::unavailable(message),
                channel_controller,
            );
        }
    }

    fn reset_backoff(&mut self) {
        for list in [&self.subchannel_list, &self.pending_subchannel_list]
            .into_iter()
            .flatten()
        {
            list.list.reset_backoff();
        }
    }

    fn shutdown(&mut self) {
        debug!(policy = POLICY_NAME, "shutting down");
        self.shutdown = true;
        self.subchannel_list = None;
        self.pending_subchannel_list = None;
    }
}

// Cycles through a snapshot of the READY subchannels.
#[derive(Debug)]
struct RoundRobinPicker {
    subchannels: Vec<Arc<dyn Subchannel>>,
    last_picked_index: AtomicUsize,
}

impl RoundRobinPicker {
    // Starts at a random position so that channels created together do not
    // all send their first RPCs to the same backend.
    fn new(subchannels: Vec<Arc<dyn Subchannel>>) -> Self {
        assert!(
            !subchannels.is_empty(),
            "round_robin picker built without READY subchannels"
        );
        let start = rand::random_range(..subchannels.len());
        Self::with_start_index(subchannels, start)
    }

    fn with_start_index(subchannels: Vec<Arc<dyn Subchannel>>, start: usize) -> Self {
        Self {
            subchannels,
            last_picked_index: AtomicUsize::new(start),
        }
    }
}

impl Picker for RoundRobinPicker {
    fn pick(&self, _args: &PickArgs<'_>) -> PickResult {
        let len = self.subchannels.len();
        let previous = self
            .last_picked_index
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |i| Some((i + 1) % len))
            .unwrap_or_else(|i| i);
        let index = (previous + 1) % len;
        trace!(policy = POLICY_NAME, index, "picked subchannel");
        PickResult::Pick(Pick {
            subchannel: self.subchannels[index].clone(),
            metadata: http::HeaderMap::new(),
        })
    }
}
