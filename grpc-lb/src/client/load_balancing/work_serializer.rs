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

//! Runs an LB policy inside a serialization domain.
//!
//! [`WorkSerializer::spawn`] moves a policy and its [`ChannelController`]
//! onto a tokio task.  Resolver updates, subchannel connectivity changes and
//! requests to leave IDLE are queued as commands and applied one at a time,
//! so the policy never runs concurrently with itself and holds no locks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::client::load_balancing::{
    ChannelController, LbPolicy, LbPolicyOptions, LbPolicyRegistry, WorkScheduler,
};
use crate::client::name_resolution::ResolverUpdate;
use crate::client::service_config::{LbConfig, LbConfigError, ParsedJsonLbConfig};
use crate::client::subchannel::SubchannelUpdate;

/// Errors returned by [`WorkSerializer`].
#[derive(Debug, thiserror::Error)]
pub enum WorkSerializerError {
    /// No builder is registered under the requested policy name.
    #[error("no LB policy registered with name {0:?}")]
    UnknownPolicy(String),
    /// The policy rejected its configuration.
    #[error(transparent)]
    Config(#[from] LbConfigError),
    /// The policy has been shut down.
    #[error("work serializer is closed")]
    Closed,
}

#[derive(Debug)]
enum PolicyCommand {
    ResolverUpdate(ResolverUpdate),
    SubchannelUpdate(SubchannelUpdate),
    ExitIdle,
    ResetBackoff,
    Shutdown,
}

/// A handle to a policy running in its own serialization domain.
///
/// Handles are cheap to clone.  The policy is shut down when
/// [`shutdown`](WorkSerializer::shutdown) is called or when the last handle is
/// dropped.
#[derive(Clone, Debug)]
pub struct WorkSerializer {
    tx: mpsc::UnboundedSender<PolicyCommand>,
}

impl WorkSerializer {
    /// Builds the policy registered as `policy_name` and starts running it.
    ///
    /// `config` is parsed by the policy's builder and handed to the policy
    /// with every resolver update.  Must be called from within a tokio
    /// runtime.
    pub fn spawn(
        policy_name: &str,
        config: Option<&ParsedJsonLbConfig>,
        registry: &LbPolicyRegistry,
        channel_controller: Box<dyn ChannelController>,
    ) -> Result<Self, WorkSerializerError> {
        let builder = registry
            .get_policy(policy_name)
            .ok_or_else(|| WorkSerializerError::UnknownPolicy(policy_name.to_string()))?;
        let config = match config {
            Some(config) => builder.parse_config(config)?,
            None => None,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let exit_idle_pending = Arc::new(AtomicBool::new(false));
        let work_scheduler = Arc::new(SerializerWorkScheduler {
            tx: tx.downgrade(),
            exit_idle_pending: exit_idle_pending.clone(),
        });
        let policy = builder.build(LbPolicyOptions { work_scheduler });

        let task = PolicyTask {
            name: builder.name(),
            policy,
            config,
            channel_controller,
            exit_idle_pending,
        };
        debug!(policy = task.name, "starting work serializer");
        tokio::spawn(task.run(rx));
        Ok(Self { tx })
    }

    /// Queues a resolver update for the policy.
    pub fn update(&self, update: ResolverUpdate) -> Result<(), WorkSerializerError> {
        self.send(PolicyCommand::ResolverUpdate(update))
    }

    /// Asks the policy to leave IDLE.
    pub fn exit_idle(&self) -> Result<(), WorkSerializerError> {
        self.send(PolicyCommand::ExitIdle)
    }

    /// Asks the policy to reset the connection backoff of its subchannels.
    pub fn reset_backoff(&self) -> Result<(), WorkSerializerError> {
        self.send(PolicyCommand::ResetBackoff)
    }

    /// Shuts the policy down.  Commands queued after this one are discarded.
    pub fn shutdown(&self) -> Result<(), WorkSerializerError> {
        self.send(PolicyCommand::Shutdown)
    }

    /// Completes once the policy has been shut down.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }

    fn send(&self, command: PolicyCommand) -> Result<(), WorkSerializerError> {
        self.tx
            .send(command)
            .map_err(|_| WorkSerializerError::Closed)
    }
}

// The policy side of the queue.  It holds a weak sender so that the policy
// and its subchannel watchers do not keep the serializer alive.
struct SerializerWorkScheduler {
    tx: mpsc::WeakUnboundedSender<PolicyCommand>,
    // Set while an ExitIdle command is queued but has not yet run.
    exit_idle_pending: Arc<AtomicBool>,
}

impl SerializerWorkScheduler {
    fn send(&self, command: PolicyCommand) {
        let Some(tx) = self.tx.upgrade() else {
            trace!(?command, "dropping command for a closed work serializer");
            return;
        };
        if let Err(err) = tx.send(command) {
            trace!(command = ?err.0, "dropping command for a closed work serializer");
        }
    }
}

impl WorkScheduler for SerializerWorkScheduler {
    fn schedule_work(&self) {
        if self.exit_idle_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        self.send(PolicyCommand::ExitIdle);
    }

    fn schedule_subchannel_update(&self, update: SubchannelUpdate) {
        self.send(PolicyCommand::SubchannelUpdate(update));
    }
}

struct PolicyTask {
    name: &'static str,
    policy: Box<dyn LbPolicy>,
    config: Option<LbConfig>,
    channel_controller: Box<dyn ChannelController>,
    exit_idle_pending: Arc<AtomicBool>,
}

impl PolicyTask {
    // Applies commands until shutdown is requested or every handle is gone.
    // Dropping `rx` on return discards anything still queued.
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PolicyCommand>) {
        while let Some(command) = rx.recv().await {
            trace!(policy = self.name, ?command, "running command");
            let channel_controller = self.channel_controller.as_mut();
            match command {
                PolicyCommand::ResolverUpdate(update) => {
                    self.policy
                        .resolver_update(update, self.config.as_ref(), channel_controller);
                }
                PolicyCommand::SubchannelUpdate(update) => {
                    self.policy.subchannel_update(update, channel_controller);
                }
                PolicyCommand::ExitIdle => {
                    self.exit_idle_pending.store(false, Ordering::Release);
                    self.policy.exit_idle(channel_controller);
                }
                PolicyCommand::ResetBackoff => self.policy.reset_backoff(),
                PolicyCommand::Shutdown => break,
            }
        }
        rx.close();
        self.policy.shutdown();
        debug!(policy = self.name, "work serializer exited");
    }
}
