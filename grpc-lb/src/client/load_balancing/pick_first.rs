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

//! The pick_first LB policy.
//!
//! pick_first keeps a single connection.  It watches every subchannel of an
//! update, waits until each has reported its initial state, then tries the
//! addresses strictly in order until one becomes READY.  That subchannel is
//! selected and every other subchannel in its list is shut down.
//!
//! While a selected subchannel is in use, a new resolver update is staged as a
//! pending list.  The pending list replaces the current one as soon as one of
//! its subchannels becomes READY, once every one of its addresses has failed,
//! or when the selected subchannel stops being READY.

use std::sync::{Arc, LazyLock, Once};

use parking_lot::Mutex;
use rand::rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use crate::client::ConnectivityState;
use crate::client::load_balancing::subchannel_list::{StateTransition, SubchannelList};
use crate::client::load_balancing::{
    ChannelController, GLOBAL_LB_REGISTRY, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState,
    Pick, PickArgs, PickResult, Picker, WorkScheduler,
};
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::client::service_config::{LbConfig, LbConfigError, ParsedJsonLbConfig};
use crate::client::subchannel::{Subchannel, SubchannelState, SubchannelUpdate};
use crate::status::Status;

// A function type that takes a mutable slice of addresses and shuffles them.
type AddressShuffler = dyn Fn(&mut [Address]) + Send + Sync + 'static;

// A global shuffler function that can be overridden for testing.
pub static SHUFFLE_ADDRESSES_FN: LazyLock<Mutex<Box<AddressShuffler>>> =
    LazyLock::new(|| Mutex::new(thread_rng_shuffler()));

pub(crate) fn thread_rng_shuffler() -> Box<AddressShuffler> {
    Box::new(|addresses: &mut [Address]| {
        let mut rng = rng();
        addresses.shuffle(&mut rng);
    })
}

pub static POLICY_NAME: &str = "pick_first";

struct Builder {}

impl LbPolicyBuilder for Builder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        debug!(policy = POLICY_NAME, "created LB policy");
        Box::new(PickFirstPolicy {
            work_scheduler: options.work_scheduler,
            latest_update: None,
            subchannel_list: None,
            pending_subchannel_list: None,
            selected: None,
            idle: false,
            shutdown: false,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, LbConfigError> {
        let cfg: PickFirstConfig = config.convert_to(POLICY_NAME)?;
        Ok(Some(LbConfig::new(cfg)))
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(super) struct PickFirstConfig {
    shuffle_address_list: Option<bool>,
}

/// Registers the pick_first policy in the global registry.
pub fn reg() {
    static REGISTER_ONCE: Once = Once::new();
    REGISTER_ONCE.call_once(|| {
        GLOBAL_LB_REGISTRY.add_builder(Builder {});
    });
}

// The addresses used for the next connection attempt, retained while idle.
#[derive(Debug)]
struct LatestUpdate {
    addresses: Result<Vec<Address>, Status>,
    resolution_note: String,
}

#[derive(Debug)]
struct PickFirstSubchannelList {
    list: SubchannelList<()>,
    // Set once every address in the list has failed, cleared by the next
    // notification from any of them.
    in_transient_failure: bool,
}

impl PickFirstSubchannelList {
    fn new(list: SubchannelList<()>) -> Self {
        Self {
            list,
            in_transient_failure: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ListSlot {
    Current,
    Pending,
}

struct PickFirstPolicy {
    work_scheduler: Arc<dyn WorkScheduler>,
    latest_update: Option<LatestUpdate>,
    // The list backing the reported state.
    subchannel_list: Option<PickFirstSubchannelList>,
    // A newer list that has not yet replaced subchannel_list.  Only present
    // while a subchannel is selected.
    pending_subchannel_list: Option<PickFirstSubchannelList>,
    // Index of the selected subchannel in subchannel_list.  Only set while
    // that subchannel is READY.
    selected: Option<usize>,
    idle: bool,
    shutdown: bool,
}

impl LbPolicy for PickFirstPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) {
        if self.shutdown {
            return;
        }
        let resolution_note = update.resolution_note().to_string();
        let addresses = match update.addresses {
            Ok(mut addresses) => {
                debug!(
                    policy = POLICY_NAME,
                    num_addresses = addresses.len(),
                    "received resolver update"
                );
                if shuffle_requested(config) {
                    SHUFFLE_ADDRESSES_FN.lock()(&mut addresses);
                }
                Ok(addresses)
            }
            Err(status) => {
                debug!(policy = POLICY_NAME, %status, "received resolver error");
                // Keep using the last good addresses, if there are any.
                match self.latest_update.take() {
                    Some(LatestUpdate {
                        addresses: Ok(previous),
                        ..
                    }) => Ok(previous),
                    _ => Err(status),
                }
            }
        };
        self.latest_update = Some(LatestUpdate {
            addresses,
            resolution_note,
        });
        // While idle, the connection attempt is deferred until exit_idle.
        if !self.idle {
            self.attempt_to_connect_using_latest_update(channel_controller);
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
        let Some(transition) = self
            .list_mut(slot)
            .and_then(|l| l.list.record_connectivity_state(index, update.state.connectivity_state))
        else {
            return;
        };
        if slot == ListSlot::Current && self.selected == Some(index) {
            self.handle_selected_update(index, transition.new, channel_controller);
        } else {
            self.handle_unselected_update(slot, index, transition, &update.state, channel_controller);
        }
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        if self.shutdown || !self.idle {
            return;
        }
        debug!(policy = POLICY_NAME, "exiting idle");
        self.idle = false;
        self.attempt_to_connect_using_latest_update(channel_controller);
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
        self.selected = None;
        self.subchannel_list = None;
        self.pending_subchannel_list = None;
    }
}

fn shuffle_requested(config: Option<&LbConfig>) -> bool {
    config
        .and_then(|c| c.convert_to::<PickFirstConfig>())
        .is_some_and(|c| c.shuffle_address_list == Some(true))
}

impl PickFirstPolicy {
    fn list_mut(&mut self, slot: ListSlot) -> Option<&mut PickFirstSubchannelList> {
        match slot {
            ListSlot::Current => self.subchannel_list.as_mut(),
            ListSlot::Pending => self.pending_subchannel_list.as_mut(),
        }
    }

    // Finds which list, if any, still holds the watch that produced `update`.
    fn slot_watching(&self, update: &SubchannelUpdate) -> Option<ListSlot> {
        let watching = |list: &Option<PickFirstSubchannelList>| {
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

    fn promote_pending_list(&mut self) {
        debug!(
            policy = POLICY_NAME,
            pending = ?self.pending_subchannel_list.as_ref().map(|l| l.list.id()),
            current = ?self.subchannel_list.as_ref().map(|l| l.list.id()),
            "promoting pending subchannel list"
        );
        self.selected = None;
        self.subchannel_list = self.pending_subchannel_list.take();
    }

    fn attempt_to_connect_using_latest_update(
        &mut self,
        channel_controller: &mut dyn ChannelController,
    ) {
        let (addresses, error) = match &self.latest_update {
            Some(LatestUpdate {
                addresses: Ok(addresses),
                ..
            }) => (addresses.as_slice(), None),
            Some(LatestUpdate {
                addresses: Err(status),
                ..
            }) => (&[][..], Some(status.clone())),
            None => (&[][..], None),
        };
        let mut list = SubchannelList::new(POLICY_NAME, addresses, channel_controller);

        if list.is_empty() {
            // Installing the empty list drops every watch held by the old ones.
            self.subchannel_list = Some(PickFirstSubchannelList::new(list));
            self.pending_subchannel_list = None;
            self.selected = None;
            let status = error.unwrap_or_else(|| {
                let note = self
                    .latest_update
                    .as_ref()
                    .map_or("", |u| u.resolution_note.as_str());
                Status::unavailable(format!("empty address list: {note}"))
            });
            debug!(policy = POLICY_NAME, %status, "no usable addresses");
            channel_controller.update_picker(LbState::transient_failure(status));
            return;
        }

        // Connection attempts start once every subchannel has reported its
        // initial state.
        for index in 0..list.len() {
            list.start_connectivity_watch(index, &self.work_scheduler);
        }
        let list = PickFirstSubchannelList::new(list);
        if self.selected.is_none() {
            self.subchannel_list = Some(list);
        } else {
            if let Some(old) = &self.pending_subchannel_list {
                debug!(
                    policy = POLICY_NAME,
                    old = %old.list.id(),
                    new = %list.list.id(),
                    "replacing pending subchannel list"
                );
            }
            self.pending_subchannel_list = Some(list);
        }
    }

    fn handle_selected_update(
        &mut self,
        index: usize,
        new_state: ConnectivityState,
        channel_controller: &mut dyn ChannelController,
    ) {
        debug!(policy = POLICY_NAME, state = %new_state, "selected subchannel changed state");
        if new_state != ConnectivityState::Ready && self.pending_subchannel_list.is_some() {
            const REASON: &str = "selected subchannel failed; switching to pending update";
            if let Some(current) = self.subchannel_list.as_mut() {
                current.list.cancel_connectivity_watch(index, REASON);
            }
            self.promote_pending_list();
            let in_transient_failure = self
                .subchannel_list
                .as_ref()
                .is_some_and(|l| l.in_transient_failure);
            if in_transient_failure {
                channel_controller.update_picker(LbState::transient_failure(Status::unavailable(
                    REASON,
                )));
            } else {
                channel_controller.update_picker(LbState::connecting());
            }
            return;
        }
        match new_state {
            // IDLE deliberately takes the TRANSIENT_FAILURE path: keeping an
            // IDLE subchannel selected would leave nothing to reconnect it.
            ConnectivityState::TransientFailure | ConnectivityState::Idle => {
                // Stay off the old addresses until re-resolution completes and
                // an RPC asks for a connection again.
                self.idle = true;
                channel_controller.request_resolution();
                self.selected = None;
                self.subchannel_list = None;
                channel_controller.update_picker(LbState::idle(self.work_scheduler.clone()));
            }
            ConnectivityState::Ready => {
                // Redelivered READY, e.g. after notifications were coalesced.
                if let Some(subchannel) = self.subchannel_at(ListSlot::Current, index) {
                    channel_controller
                        .update_picker(LbState::ready(Arc::new(PickFirstPicker { subchannel })));
                }
            }
            ConnectivityState::Connecting => {
                channel_controller.update_picker(LbState::connecting());
            }
            ConnectivityState::Shutdown => {}
        }
    }

    fn handle_unselected_update(
        &mut self,
        slot: ListSlot,
        index: usize,
        transition: StateTransition,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(list) = self.list_mut(slot) else {
            return;
        };
        list.in_transient_failure = false;

        if transition.new == ConnectivityState::Ready {
            self.process_unselected_ready(slot, index, channel_controller);
            return;
        }

        // The last initial state is in: start with the first address.
        if transition.old.is_none() && list.list.all_subchannels_seen_initial_state() {
            list.list.request_connection(0);
            return;
        }

        match transition.new {
            ConnectivityState::TransientFailure => {
                let next_index = (index + 1) % list.list.len();
                let mut slot = slot;
                if next_index == 0 {
                    debug!(
                        policy = POLICY_NAME,
                        list = %list.list.id(),
                        "failed to connect to all addresses"
                    );
                    list.in_transient_failure = true;
                    // Dropping a working connection here honours the newer
                    // address list.
                    if slot == ListSlot::Pending {
                        self.promote_pending_list();
                        slot = ListSlot::Current;
                    }
                    channel_controller.request_resolution();
                    let message = match &state.last_connection_error {
                        Some(err) => format!("failed to connect to all addresses; last error: {err}"),
                        None => "failed to connect to all addresses".to_string(),
                    };
                    channel_controller
                        .update_picker(LbState::transient_failure(Status::unavailable(message)));
                }
                if let Some(list) = self.list_mut(slot) {
                    list.list.request_connection(next_index);
                }
            }
            ConnectivityState::Connecting | ConnectivityState::Idle => {
                // A pending list stays invisible until it is promoted.
                if slot == ListSlot::Current {
                    channel_controller.update_picker(LbState::connecting());
                }
            }
            ConnectivityState::Ready | ConnectivityState::Shutdown => {}
        }
    }

    fn process_unselected_ready(
        &mut self,
        slot: ListSlot,
        index: usize,
        channel_controller: &mut dyn ChannelController,
    ) {
        if slot == ListSlot::Pending {
            self.promote_pending_list();
        }
        let Some(subchannel) = self.subchannel_at(ListSlot::Current, index) else {
            error!(policy = POLICY_NAME, index, "READY subchannel has no handle");
            return;
        };
        debug!(policy = POLICY_NAME, address = %subchannel.address(), "selected subchannel");
        self.selected = Some(index);
        channel_controller.update_picker(LbState::ready(Arc::new(PickFirstPicker { subchannel })));
        if let Some(current) = self.subchannel_list.as_mut() {
            for other in (0..current.list.len()).filter(|&i| i != index) {
                current
                    .list
                    .shutdown_subchannel(other, "another subchannel was selected");
            }
        }
    }

    fn subchannel_at(&self, slot: ListSlot, index: usize) -> Option<Arc<dyn Subchannel>> {
        let list = match slot {
            ListSlot::Current => self.subchannel_list.as_ref(),
            ListSlot::Pending => self.pending_subchannel_list.as_ref(),
        }?;
        list.list.subchannel(index).subchannel().cloned()
    }
}

// Always picks the selected subchannel.
#[derive(Debug)]
struct PickFirstPicker {
    subchannel: Arc<dyn Subchannel>,
}

impl Picker for PickFirstPicker {
    fn pick(&self, _args: &PickArgs<'_>) -> PickResult {
        PickResult::Pick(Pick {
            subchannel: self.subchannel.clone(),
            metadata: http::HeaderMap::new(),
        })
    }
}
