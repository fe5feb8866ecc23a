//! Fork channels: logical channels multiplexed over one shared channel.

use std::sync::{Arc, OnceLock, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use forkline_core::config::MuxConfig;
use forkline_core::{Address, Event, Message, MessageBatch, RoutingHeader, View};

use super::splice::{ensure_demux, fork_stack};
use super::stack::ForkStack;
use super::types::ForkError;
use crate::channel::{ChannelListener, ChannelStats, ChannelStatus, ListenerId, SharedChannel};
use crate::error::StageError;
use crate::stack::{Placement, StageRef, UpHandler};

/// A logical channel bound to one `(group_id, member_id)` pair.
///
/// Identity and connection state come from the shared channel; a fork
/// channel cannot change the shared channel's connection state.
pub struct ForkChannel {
    shared: Arc<dyn SharedChannel>,
    group_id: String,
    member_id: String,
    stack: Arc<ForkStack>,
    status: RwLock<ChannelStatus>,
    up_handler: RwLock<Option<Arc<dyn UpHandler>>>,
    listener: OnceLock<ListenerId>,
}

impl ForkChannel {
    pub fn builder() -> ForkChannelBuilder {
        ForkChannelBuilder::default()
    }

    /// Create a fork channel over `shared`, splicing in a demultiplexer at
    /// `placement` if needed and creating the group's fork stack from
    /// `stages` if it does not exist yet.
    pub fn new(
        shared: Arc<dyn SharedChannel>,
        group_id: &str,
        member_id: &str,
        create_if_absent: bool,
        placement: Placement,
        stages: Vec<StageRef>,
    ) -> Result<Arc<Self>, ForkError> {
        ForkChannelBuilder::default()
            .shared(shared)
            .group_id(group_id)
            .member_id(member_id)
            .create_if_absent(create_if_absent)
            .placement(placement)
            .stages(stages)
            .build()
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn address(&self) -> Option<Address> {
        self.shared.address()
    }

    pub fn name(&self) -> Option<String> {
        self.shared.name()
    }

    pub fn name_of(&self, member: &Address) -> Option<String> {
        self.shared.name_of(member)
    }

    pub fn cluster_name(&self) -> Option<String> {
        self.shared.cluster_name()
    }

    pub fn view(&self) -> Option<View> {
        self.shared.view()
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ChannelStatus::Connected
    }

    fn set_status(&self, status: ChannelStatus) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Set the consumer of this channel's inbound traffic.
    pub fn set_up_handler(&self, handler: Arc<dyn UpHandler>) {
        *self.up_handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    fn handler(&self) -> Option<Arc<dyn UpHandler>> {
        self.up_handler.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn deliver(&self, event: Event) -> Result<(), StageError> {
        match self.handler() {
            Some(h) => h.up(event),
            None => {
                trace!(
                    group_id = %self.group_id,
                    member_id = %self.member_id,
                    kind = event.kind(),
                    "No up handler; event dropped"
                );
                Ok(())
            }
        }
    }

    pub(crate) fn deliver_batch(&self, batch: MessageBatch) -> Result<(), StageError> {
        match self.handler() {
            Some(h) => h.up_batch(batch),
            None => {
                trace!(
                    group_id = %self.group_id,
                    member_id = %self.member_id,
                    size = batch.len(),
                    "No up handler; batch dropped"
                );
                Ok(())
            }
        }
    }

    /// Tag `msg` with this channel's member id and send it down the fork
    /// stack. An existing routing header only has its member id replaced.
    pub fn send(&self, mut msg: Message) -> Result<(), ForkError> {
        let status = self.status();
        if status != ChannelStatus::Connected {
            return Err(ForkError::NotConnected { status });
        }

        if let Some(hdr) = msg.routing_mut() {
            hdr.set_member_id(self.member_id.as_str());
        } else {
            let mut hdr = RoutingHeader::for_member(self.member_id.as_str());
            if self.stack.is_passthrough() {
                hdr.set_group_id(self.group_id.as_str());
            }
            msg.put_routing(hdr);
        }

        trace!(group_id = %self.group_id, member_id = %self.member_id, size = msg.len(), "Sending");
        self.stack.down(Event::Message(msg))?;
        Ok(())
    }

    /// Traffic counters of the shared channel.
    pub fn dump_stats(&self) -> ChannelStats {
        self.shared.stats()
    }

    #[allow(clippy::unused_self)]
    pub const fn flush_supported(&self) -> bool {
        false
    }

    pub fn connect(&self, _cluster: &str) -> Result<(), ForkError> {
        self.unsupported("connect")
    }

    pub fn connect_with_state(
        &self,
        _cluster: &str,
        _target: Option<Address>,
        _timeout: Duration,
    ) -> Result<(), ForkError> {
        self.unsupported("connect_with_state")
    }

    pub fn disconnect(&self) -> Result<(), ForkError> {
        self.unsupported("disconnect")
    }

    pub fn close(&self) -> Result<(), ForkError> {
        self.unsupported("close")
    }

    pub fn start_flush(&self, _automatic_resume: bool) -> Result<(), ForkError> {
        self.unsupported("start_flush")
    }

    pub fn stop_flush(&self) -> Result<(), ForkError> {
        self.unsupported("stop_flush")
    }

    pub fn fetch_state(
        &self,
        _target: Option<Address>,
        _timeout: Duration,
    ) -> Result<(), ForkError> {
        self.unsupported("fetch_state")
    }

    /// Fork stacks are private; there is no stack to hand out.
    pub fn protocol_stack(&self) -> Result<Vec<String>, ForkError> {
        self.unsupported("protocol_stack")
    }

    pub fn set_name(&self, _name: &str) -> Result<(), ForkError> {
        self.unsupported("set_name")
    }

    pub fn send_bytes(&self, _dest: Option<Address>, _payload: Bytes) -> Result<(), ForkError> {
        self.unsupported("send_bytes")
    }

    pub fn send_to(&self, _dest: Address, _payload: &[u8]) -> Result<(), ForkError> {
        self.unsupported("send_to")
    }

    fn unsupported<T>(&self, op: &'static str) -> Result<T, ForkError> {
        warn!(
            group_id = %self.group_id,
            member_id = %self.member_id,
            op,
            "Operation not supported by fork channel"
        );
        Err(ForkError::Unsupported(op))
    }
}

impl Drop for ForkChannel {
    fn drop(&mut self) {
        if let Some(id) = self.listener.get() {
            self.shared.unsubscribe(*id);
        }
        debug!(group_id = %self.group_id, member_id = %self.member_id, "Fork channel dropped");
    }
}

impl std::fmt::Debug for ForkChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkChannel")
            .field("group_id", &self.group_id)
            .field("member_id", &self.member_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Mirrors the shared channel's status into a fork channel.
struct StatusMirror {
    channel: Weak<ForkChannel>,
}

impl ChannelListener for StatusMirror {
    fn status_changed(&self, shared: &dyn SharedChannel, status: ChannelStatus) {
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        channel.set_status(status);
        debug!(
            group_id = %channel.group_id,
            member_id = %channel.member_id,
            %status,
            "Shared channel status changed"
        );

        if status == ChannelStatus::Connected
            && let Some(addr) = shared.address()
            && let Err(e) = channel.deliver(Event::SetLocalAddress(addr))
        {
            warn!(
                group_id = %channel.group_id,
                member_id = %channel.member_id,
                error = %e,
                "Local address notification failed"
            );
        }
    }
}

/// Builder for [`ForkChannel`].
pub struct ForkChannelBuilder {
    shared: Option<Arc<dyn SharedChannel>>,
    group_id: Option<String>,
    member_id: Option<String>,
    create_if_absent: bool,
    placement: Placement,
    require_fresh_group: bool,
    stages: Vec<StageRef>,
    up_handler: Option<Arc<dyn UpHandler>>,
}

impl Default for ForkChannelBuilder {
    fn default() -> Self {
        Self::from_config(&MuxConfig::default())
    }
}

impl ForkChannelBuilder {
    /// Builder with demultiplexer settings taken from `config`.
    pub fn from_config(config: &MuxConfig) -> Self {
        Self {
            shared: None,
            group_id: None,
            member_id: None,
            create_if_absent: config.create_if_absent,
            placement: Placement::from_config(config),
            require_fresh_group: config.require_fresh_group,
            stages: Vec::new(),
            up_handler: None,
        }
    }

    #[must_use]
    pub fn shared(mut self, shared: Arc<dyn SharedChannel>) -> Self {
        self.shared = Some(shared);
        self
    }

    #[must_use]
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    #[must_use]
    pub fn member_id(mut self, member_id: impl Into<String>) -> Self {
        self.member_id = Some(member_id.into());
        self
    }

    #[must_use]
    pub const fn create_if_absent(mut self, create: bool) -> Self {
        self.create_if_absent = create;
        self
    }

    #[must_use]
    pub fn placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    #[must_use]
    pub const fn require_fresh_group(mut self, fresh: bool) -> Self {
        self.require_fresh_group = fresh;
        self
    }

    /// Stages of the group's fork stack, bottom to top. Ignored when the
    /// group already exists.
    #[must_use]
    pub fn stages(mut self, stages: Vec<StageRef>) -> Self {
        self.stages = stages;
        self
    }

    #[must_use]
    pub fn stage(mut self, stage: StageRef) -> Self {
        self.stages.push(stage);
        self
    }

    #[must_use]
    pub fn up_handler(mut self, handler: Arc<dyn UpHandler>) -> Self {
        self.up_handler = Some(handler);
        self
    }

    /// Splice, bind and subscribe. Nothing stays bound if this fails.
    pub fn build(self) -> Result<Arc<ForkChannel>, ForkError> {
        let shared = self.shared.ok_or(ForkError::MissingSharedChannel)?;
        let group_id = non_empty(self.group_id, "group_id")?;
        let member_id = non_empty(self.member_id, "member_id")?;

        let demux = ensure_demux(shared.pipeline(), self.create_if_absent, &self.placement)?;
        let stack = fork_stack(
            &demux,
            shared.pipeline(),
            &group_id,
            self.stages,
            self.require_fresh_group,
        )?;

        let channel = Arc::new(ForkChannel {
            status: RwLock::new(shared.status()),
            shared: Arc::clone(&shared),
            group_id,
            member_id,
            stack,
            up_handler: RwLock::new(self.up_handler),
            listener: OnceLock::new(),
        });
        channel.stack.bind(&channel.member_id, &channel)?;

        let id = shared.subscribe(Arc::new(StatusMirror {
            channel: Arc::downgrade(&channel),
        }));
        if channel.listener.set(id).is_err() {
            shared.unsubscribe(id);
        }
        // The shared channel may have changed state before the mirror was in place.
        channel.set_status(shared.status());

        info!(
            group_id = %channel.group_id,
            member_id = %channel.member_id,
            status = %channel.status(),
            "Fork channel created"
        );
        Ok(channel)
    }
}

fn non_empty(value: Option<String>, field: &'static str) -> Result<String, ForkError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(ForkError::InvalidId { field })
}
