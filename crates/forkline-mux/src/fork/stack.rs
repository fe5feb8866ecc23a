//! Per-group fork stacks.
//!
//! A fork stack is a private pipeline `[ForkBottom, caller stages.., ForkTop]`.
//! `ForkBottom` tags outbound messages with the group and hands them to the
//! demultiplexer's position in the shared pipeline; `ForkTop` delivers inbound
//! traffic to the fork channel bound under the message's member id.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, warn};

use forkline_core::{Event, Message, MessageBatch, RoutingHeader};

use super::channel::ForkChannel;
use super::types::ForkError;
use crate::error::StageError;
use crate::stack::{DownHandler, Link, Pipeline, Stage, StageRef};

/// Private pipeline of one group, shared by all of its fork channels.
pub struct ForkStack {
    group_id: String,
    pipeline: Pipeline,
    top: Arc<ForkTop>,
    custom_stages: usize,
}

impl ForkStack {
    pub(crate) fn new(group_id: &str, stages: Vec<StageRef>, sink: Arc<dyn DownHandler>) -> Self {
        let custom_stages = stages.len();
        let top = Arc::new(ForkTop {
            group_id: group_id.to_string(),
            members: DashMap::new(),
        });

        let mut chain: Vec<StageRef> = Vec::with_capacity(custom_stages + 2);
        chain.push(Arc::new(ForkBottom {
            group_id: group_id.to_string(),
        }));
        chain.extend(stages);
        chain.push(Arc::clone(&top) as StageRef);

        let pipeline = Pipeline::new(format!("fork:{group_id}"), chain);
        pipeline.set_bottom_sink(sink);

        Self {
            group_id: group_id.to_string(),
            pipeline,
            top,
            custom_stages,
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Inbound entry point: the bottom stage.
    pub fn up(&self, event: Event) -> Result<(), StageError> {
        self.pipeline.up(event)
    }

    pub fn up_batch(&self, batch: MessageBatch) -> Result<(), StageError> {
        self.pipeline.up_batch(batch)
    }

    /// Outbound entry point: the top stage.
    pub fn down(&self, event: Event) -> Result<(), StageError> {
        self.pipeline.down(event)
    }

    /// Stage names, bottom to top, including the two synthetic stages.
    pub fn stage_names(&self) -> Vec<String> {
        self.pipeline.stage_names()
    }

    /// Whether the caller supplied no stages of its own.
    pub const fn is_passthrough(&self) -> bool {
        self.custom_stages == 0
    }

    /// Member ids with a live fork channel, sorted.
    pub fn members(&self) -> Vec<String> {
        let mut members: Vec<String> = self
            .top
            .members
            .iter()
            .filter(|e| e.value().strong_count() > 0)
            .map(|e| e.key().clone())
            .collect();
        members.sort();
        members
    }

    /// Bind `channel` under `member_id`. Atomic with respect to the existence
    /// check; a binding whose channel was dropped is taken over.
    pub(crate) fn bind(
        &self,
        member_id: &str,
        channel: &Arc<ForkChannel>,
    ) -> Result<(), ForkError> {
        match self.top.members.entry(member_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                match occupied.get().upgrade() {
                    Some(existing) if Arc::ptr_eq(&existing, channel) => return Ok(()),
                    Some(_) => {
                        return Err(ForkError::DuplicateMember {
                            group_id: self.group_id.clone(),
                            member_id: member_id.to_string(),
                        });
                    }
                    None => {
                        debug!(
                            group_id = %self.group_id,
                            member_id,
                            "Replacing stale fork channel binding"
                        );
                        occupied.insert(Arc::downgrade(channel));
                    }
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::downgrade(channel));
            }
        }
        info!(group_id = %self.group_id, member_id, "Fork channel bound");
        Ok(())
    }
}

impl std::fmt::Debug for ForkStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkStack")
            .field("group_id", &self.group_id)
            .field("stages", &self.stage_names())
            .field("members", &self.members())
            .finish()
    }
}

/// Bottom of a fork stack: tags the group on the way down.
struct ForkBottom {
    group_id: String,
}

impl Stage for ForkBottom {
    fn name(&self) -> &str {
        "fork-bottom"
    }

    fn down(&self, event: Event, link: &Link<'_>) -> Result<(), StageError> {
        let Event::Message(mut msg) = event else {
            return link.pass_down(event);
        };
        match msg.routing_mut() {
            Some(hdr) => hdr.set_group_id(self.group_id.as_str()),
            None => msg.put_routing(RoutingHeader::for_group(self.group_id.as_str())),
        }
        link.pass_down(Event::Message(msg))
    }
}

/// Top of a fork stack: routes to fork channels by member id.
struct ForkTop {
    group_id: String,
    members: DashMap<String, Weak<ForkChannel>>,
}

impl ForkTop {
    fn channel(&self, member_id: &str) -> Option<Arc<ForkChannel>> {
        self.members.get(member_id).and_then(|w| w.upgrade())
    }

    fn live_channels(&self) -> Vec<Arc<ForkChannel>> {
        self.members.iter().filter_map(|e| e.value().upgrade()).collect()
    }
}

fn member_of(msg: &Message) -> Option<&str> {
    msg.routing().and_then(RoutingHeader::member_id)
}

impl Stage for ForkTop {
    fn name(&self) -> &str {
        "fork-top"
    }

    fn up(&self, event: Event, _link: &Link<'_>) -> Result<(), StageError> {
        match event {
            Event::Message(msg) => {
                let Some(member_id) = member_of(&msg) else {
                    warn!(group_id = %self.group_id, "Message without member id; dropping");
                    return Ok(());
                };
                match self.channel(member_id) {
                    Some(channel) => channel.deliver(Event::Message(msg)),
                    None => {
                        warn!(
                            group_id = %self.group_id,
                            member_id,
                            "No fork channel for member; dropping"
                        );
                        Ok(())
                    }
                }
            }
            event if event.is_broadcast() => {
                for channel in self.live_channels() {
                    if let Err(e) = channel.deliver(event.clone()) {
                        warn!(
                            group_id = %self.group_id,
                            member_id = channel.member_id(),
                            error = %e,
                            "Fork channel rejected broadcast event"
                        );
                    }
                }
                Ok(())
            }
            other => {
                debug!(
                    group_id = %self.group_id,
                    kind = other.kind(),
                    "Ignoring event at fork top"
                );
                Ok(())
            }
        }
    }

    fn up_batch(&self, mut batch: MessageBatch, _link: &Link<'_>) -> Result<(), StageError> {
        let mut by_member: BTreeMap<String, Vec<Message>> = BTreeMap::new();
        for msg in batch.extract(|_| true) {
            match member_of(&msg) {
                Some(member_id) => by_member.entry(member_id.to_string()).or_default().push(msg),
                None => warn!(
                    group_id = %self.group_id,
                    "Batched message without member id; dropping"
                ),
            }
        }

        for (member_id, msgs) in by_member {
            let Some(channel) = self.channel(&member_id) else {
                warn!(
                    group_id = %self.group_id,
                    member_id,
                    count = msgs.len(),
                    "No fork channel for member; dropping batch"
                );
                continue;
            };
            if let Err(e) = channel.deliver_batch(batch.derive(msgs)) {
                warn!(
                    group_id = %self.group_id,
                    member_id,
                    error = %e,
                    "Fork channel rejected batch"
                );
            }
        }
        Ok(())
    }
}
