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

//! Load balancing policies and the interfaces that connect them to the
//! channel.
//!
//! Every method on [`LbPolicy`] is called from the channel's serialization
//! domain (see [`work_serializer`]), one at a time.  Policies therefore hold
//! no locks; anything that happens elsewhere (subchannel state changes, picks
//! that want the policy to leave IDLE) is marshalled back through the
//! [`WorkScheduler`].

use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::client::ConnectivityState;
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::client::service_config::{LbConfig, LbConfigError, ParsedJsonLbConfig};
use crate::client::subchannel::{Subchannel, SubchannelUpdate};
use crate::status::Status;

pub mod pick_first;
pub mod registry;
pub mod round_robin;
pub(crate) mod subchannel_list;
pub mod work_serializer;

#[cfg(test)]
pub(crate) mod test_utils;

pub use registry::{GLOBAL_LB_REGISTRY, LbPolicyRegistry};

/// A collection of data configured on the channel that is constructing this
/// LbPolicy.
pub struct LbPolicyOptions {
    /// A hook into the channel's work scheduler that allows the LbPolicy to
    /// request the ability to perform operations on the ChannelController.
    pub work_scheduler: Arc<dyn WorkScheduler>,
}

impl Debug for LbPolicyOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LbPolicyOptions").finish_non_exhaustive()
    }
}

/// Used to asynchronously request calls into the LbPolicy from outside the
/// channel's serialization domain.
pub trait WorkScheduler: Send + Sync {
    // Schedules a call into the LbPolicy's exit_idle method.  If there is
    // already a pending call that has not yet started, this may not schedule
    // another one.
    fn schedule_work(&self);

    /// Schedules delivery of a subchannel connectivity change to the
    /// LbPolicy's subchannel_update method.
    fn schedule_subchannel_update(&self, update: SubchannelUpdate);
}

/// An LB policy factory that produces LbPolicy instances used by the channel
/// to manage connections and pick connections for RPCs.
pub trait LbPolicyBuilder: Send + Sync {
    /// Builds and returns a new LB policy instance.
    ///
    /// Note that build must not fail.  Any optional configuration is delivered
    /// via the LbPolicy's resolver_update method.
    ///
    /// An LbPolicy instance is assumed to begin in a Connecting state that
    /// queues RPCs until its first update.
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy>;

    /// Reports the name of the LB Policy.
    fn name(&self) -> &'static str;

    /// Parses the JSON LB policy configuration into an internal representation.
    ///
    /// LB policies do not need to accept a configuration, in which case the
    /// default implementation returns Ok(None).
    fn parse_config(
        &self,
        _config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, LbConfigError> {
        Ok(None)
    }
}

/// An LB policy instance.
///
/// LB policies are responsible for creating connections (modeled as
/// Subchannels) and producing Picker instances for picking connections for
/// RPCs.
///
/// None of these methods return errors.  Failures the policy expects (empty
/// address lists, resolver errors, backends refusing connections) are
/// reported to the channel as a TransientFailure state instead.
pub trait LbPolicy: Send {
    /// Called by the channel when the name resolver produces a new set of
    /// resolved addresses or a new service config.
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    );

    /// Called by the channel when any subchannel watched by the LB policy
    /// changes state.
    fn subchannel_update(
        &mut self,
        update: SubchannelUpdate,
        channel_controller: &mut dyn ChannelController,
    );

    /// Asks the policy to leave IDLE and start connecting.  A no-op for
    /// policies that are not idle.
    fn exit_idle(&mut self, _channel_controller: &mut dyn ChannelController) {}

    /// Resets the connection backoff of every subchannel the policy holds.
    fn reset_backoff(&mut self);

    /// Tears the policy down.  All connectivity watches are cancelled and no
    /// further calls are made into the policy afterwards.
    fn shutdown(&mut self);
}

/// Controls channel behaviors.
pub trait ChannelController: Send {
    /// Creates a new subchannel in IDLE state.  Returns None if the address
    /// cannot be used, in which case the LB policy skips it.
    fn new_subchannel(&mut self, address: &Address) -> Option<Arc<dyn Subchannel>>;

    /// Provides a new snapshot of the LB policy's state to the channel.
    fn update_picker(&mut self, update: LbState);

    /// Signals the name resolver to attempt to re-resolve addresses.  Typically
    /// used when connections fail, indicating a possible change in the overall
    /// network configuration.
    fn request_resolution(&mut self);
}

/// Data provided by the LB policy.
#[derive(Clone)]
pub struct LbState {
    pub connectivity_state: ConnectivityState,
    /// Why the policy is failing.  Only meaningful for TransientFailure; the
    /// OK status otherwise.
    pub status: Status,
    pub picker: Arc<dyn Picker>,
}

impl LbState {
    /// Returns a generic initial LbState which is Connecting and a picker which
    /// queues all picks.
    pub fn initial() -> Self {
        Self::connecting()
    }

    pub(crate) fn connecting() -> Self {
        Self {
            connectivity_state: ConnectivityState::Connecting,
            status: Status::ok(),
            picker: Arc::new(QueuingPicker {}),
        }
    }

    pub(crate) fn ready(picker: Arc<dyn Picker>) -> Self {
        Self {
            connectivity_state: ConnectivityState::Ready,
            status: Status::ok(),
            picker,
        }
    }

    pub(crate) fn idle(work_scheduler: Arc<dyn WorkScheduler>) -> Self {
        Self {
            connectivity_state: ConnectivityState::Idle,
            status: Status::ok(),
            picker: Arc::new(IdlePicker::new(work_scheduler)),
        }
    }

    pub(crate) fn transient_failure(status: Status) -> Self {
        Self {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(FailingPicker {
                status: status.clone(),
            }),
            status,
        }
    }
}

impl Debug for LbState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LbState")
            .field("connectivity_state", &self.connectivity_state)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Per-call data available to a Picker.
#[derive(Debug, Clone, Copy)]
pub struct PickArgs<'a> {
    /// The path of the call, e.g. "/helloworld.Greeter/SayHello".
    pub path: &'a str,
    /// The outgoing request headers.
    pub headers: &'a http::HeaderMap,
}

/// A Picker is responsible for deciding what Subchannel to use for any given
/// request.  A Picker is only used once for any RPC.  If pick() returns Queue,
/// the channel will queue the RPC until a new Picker is produced by the
/// LbPolicy, and will call pick() on the new Picker for the request.
///
/// Pickers are immutable snapshots: a policy that changes its mind produces a
/// new Picker rather than modifying an existing one.  They may be called from
/// any number of threads at once.
///
/// Pickers are always paired with a ConnectivityState which the channel will
/// expose to applications so they can predict what might happens when
/// performing RPCs:
///
/// If the ConnectivityState is Idle, the Picker should ensure connections are
/// initiated by the LbPolicy that produced the Picker, and return a Queue
/// result so the request is attempted the next time a Picker is produced.
///
/// If the ConnectivityState is Connecting, the Picker should return a Queue
/// result and continue to wait for pending connections.
///
/// If the ConnectivityState is Ready, the Picker should return a Ready
/// Subchannel.
///
/// If the ConnectivityState is TransientFailure, the Picker should return a
/// Fail result with a status that describes why connections are failing.
pub trait Picker: Send + Sync {
    /// Picks a connection to use for the request.
    ///
    /// This function should not block.  If the Picker needs to do blocking or
    /// time-consuming work to service this request, it should return Queue, and
    /// the Pick call will be repeated by the channel when a new Picker is
    /// produced by the LbPolicy.
    fn pick(&self, args: &PickArgs<'_>) -> PickResult;
}

#[derive(Debug)]
pub enum PickResult {
    /// Indicates the Subchannel in the Pick should be used for the request.
    Pick(Pick),
    /// Indicates the LbPolicy is attempting to connect to a server to use for
    /// the request.
    Queue,
    /// Indicates that the request should fail with the included error status.
    /// If the RPC is wait-for-ready, then it will not be terminated, but
    /// instead attempted on a new picker if one is produced before it is
    /// cancelled.
    Fail(Status),
}

/// A collection of data used by the channel for routing a request.
#[derive(Debug)]
pub struct Pick {
    /// The Subchannel for the request.
    pub subchannel: Arc<dyn Subchannel>,
    // Metadata to be added to existing outgoing metadata.
    pub metadata: http::HeaderMap,
}

/// QueuingPicker always returns Queue.  LB policies that are not actively
/// Connecting should not use this picker.
#[derive(Debug)]
pub struct QueuingPicker {}

impl Picker for QueuingPicker {
    fn pick(&self, _args: &PickArgs<'_>) -> PickResult {
        PickResult::Queue
    }
}

/// A picker that always queues picks.  The first pick also asks the work
/// scheduler to take the policy out of IDLE.
pub struct IdlePicker {
    work_scheduler: Arc<dyn WorkScheduler>,
    exit_idle_requested: AtomicBool,
}

impl IdlePicker {
    pub fn new(work_scheduler: Arc<dyn WorkScheduler>) -> Self {
        Self {
            work_scheduler,
            exit_idle_requested: AtomicBool::new(false),
        }
    }
}

impl Picker for IdlePicker {
    fn pick(&self, _args: &PickArgs<'_>) -> PickResult {
        if !self.exit_idle_requested.swap(true, Ordering::AcqRel) {
            self.work_scheduler.schedule_work();
        }
        PickResult::Queue
    }
}

impl Debug for IdlePicker {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdlePicker")
            .field("exit_idle_requested", &self.exit_idle_requested)
            .finish_non_exhaustive()
    }
}

/// A picker that fails every pick with the same status.
#[derive(Debug)]
pub struct FailingPicker {
    pub status: Status,
}

impl Picker for FailingPicker {
    fn pick(&self, _args: &PickArgs<'_>) -> PickResult {
        PickResult::Fail(self.status.clone())
    }
}
