//! Demultiplexer stage of the shared pipeline.
//!
//! Routes inbound messages carrying a routing header into the fork stack
//! registered for their group, fans broadcast events out to every fork stack,
//! and passes everything else up the shared pipeline untouched.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, error, info, trace, warn};

use forkline_core::{Event, Message, MessageBatch};

use super::stack::ForkStack;
use super::types::DemuxStats;
use crate::error::StageError;
use crate::stack::{Link, Stage};

/// Stage name used when selecting the demultiplexer as a neighbor.
pub const DEMUX_STAGE_NAME: &str = "FORK";

#[derive(Default)]
struct Counters {
    routed: AtomicU64,
    passed_through: AtomicU64,
    misses: AtomicU64,
    broadcasts: AtomicU64,
    batches_split: AtomicU64,
    batch_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Routes multiplexed traffic by group id into fork stacks.
#[derive(Default)]
pub struct Demultiplexer {
    stacks: DashMap<String, Arc<ForkStack>>,
    counters: Counters,
}

impl Demultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fork stack registered for `group_id`.
    pub fn get(&self, group_id: &str) -> Option<Arc<ForkStack>> {
        self.stacks.get(group_id).map(|s| Arc::clone(s.value()))
    }

    /// Return the fork stack of `group_id`, registering the one built by
    /// `make` if there is none. The check and the insertion are atomic; the
    /// flag is `true` when `make` was used.
    pub fn register_if_absent<F>(&self, group_id: &str, make: F) -> (Arc<ForkStack>, bool)
    where
        F: FnOnce() -> ForkStack,
    {
        match self.stacks.entry(group_id.to_string()) {
            Entry::Occupied(existing) => (Arc::clone(existing.get()), false),
            Entry::Vacant(vacant) => {
                let stack = Arc::new(make());
                vacant.insert(Arc::clone(&stack));
                info!(group_id, stages = ?stack.stage_names(), "Fork stack registered");
                (stack, true)
            }
        }
    }

    /// Registered group ids, sorted.
    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.stacks.iter().map(|e| e.key().clone()).collect();
        groups.sort();
        groups
    }

    pub fn stats(&self) -> DemuxStats {
        let c = &self.counters;
        DemuxStats {
            groups: self.stacks.len(),
            routed: c.routed.load(Ordering::Relaxed),
            passed_through: c.passed_through.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            broadcasts: c.broadcasts.load(Ordering::Relaxed),
            batches_split: c.batches_split.load(Ordering::Relaxed),
            batch_failures: c.batch_failures.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of all fork stacks, so no map guard is held while they run.
    fn snapshot(&self) -> Vec<Arc<ForkStack>> {
        self.stacks.iter().map(|e| Arc::clone(e.value())).collect()
    }

    fn route(&self, msg: Message, link: &Link<'_>) -> Result<(), StageError> {
        let Some(hdr) = msg.routing() else {
            Counters::bump(&self.counters.passed_through, 1);
            return link.pass_up(Event::Message(msg));
        };
        let Some(group_id) = hdr.group_id() else {
            return Err(StageError::MalformedHeader(format!(
                "routing header {hdr} has no group id"
            )));
        };

        match self.get(group_id) {
            Some(stack) => {
                trace!(header = %hdr, "Routing message into fork stack");
                Counters::bump(&self.counters.routed, 1);
                stack.up(Event::Message(msg))
            }
            None => {
                warn!(header = %hdr, src = ?msg.src, "No fork stack for group; message dropped");
                Counters::bump(&self.counters.misses, 1);
                Ok(())
            }
        }
    }

    fn broadcast(&self, event: Event, link: &Link<'_>) -> Result<(), StageError> {
        let stacks = self.snapshot();
        debug!(kind = event.kind(), stacks = stacks.len(), "Broadcasting event to fork stacks");
        Counters::bump(&self.counters.broadcasts, 1);
        for stack in stacks {
            if let Err(e) = stack.up(event.clone()) {
                warn!(
                    group_id = stack.group_id(),
                    error = %e,
                    "Fork stack rejected broadcast event"
                );
            }
        }
        link.pass_up(event)
    }
}

impl Stage for Demultiplexer {
    fn name(&self) -> &str {
        DEMUX_STAGE_NAME
    }

    fn as_demux(&self) -> Option<&Demultiplexer> {
        Some(self)
    }

    fn up(&self, event: Event, link: &Link<'_>) -> Result<(), StageError> {
        match event {
            Event::Message(msg) => self.route(msg, link),
            event if event.is_broadcast() => self.broadcast(event, link),
            other => link.pass_up(other),
        }
    }

    fn up_batch(&self, mut batch: MessageBatch, link: &Link<'_>) -> Result<(), StageError> {
        let forked = batch.extract(|m| m.routing().is_some());

        let mut by_group: BTreeMap<String, Vec<Message>> = BTreeMap::new();
        for msg in forked {
            let group_id = msg
                .routing()
                .and_then(|h| h.group_id())
                .ok_or_else(|| {
                    StageError::MalformedHeader(format!(
                        "batched message from {} has no group id",
                        batch.sender()
                    ))
                })?
                .to_string();
            by_group.entry(group_id).or_default().push(msg);
        }

        for (group_id, msgs) in by_group {
            let Some(stack) = self.get(&group_id) else {
                warn!(group_id, count = msgs.len(), "No fork stack for group; batch dropped");
                Counters::bump(&self.counters.misses, msgs.len());
                continue;
            };
            let count = msgs.len();
            Counters::bump(&self.counters.batches_split, 1);
            Counters::bump(&self.counters.routed, count);
            if let Err(e) = stack.up_batch(batch.derive(msgs)) {
                Counters::bump(&self.counters.batch_failures, 1);
                error!(group_id, count, error = %e, "Failed passing up batch");
            }
        }

        if batch.is_empty() {
            return Ok(());
        }
        Counters::bump(&self.counters.passed_through, batch.len());
        link.pass_up_batch(batch)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use forkline_core::{Address, RoutingHeader, View};

    use super::*;
    use crate::stack::{Pipeline, StageRef};
    use crate::testing::{FailingStage, Recorder, RecordingStage, payload_strings, tagged};

    /// Shared pipeline `[below, demux, above]` with a recorder on top and
    /// fork stacks for `groups`, each ending in a recorder stage.
    struct Fixture {
        shared: Pipeline,
        demux: Arc<Demultiplexer>,
        above: Arc<RecordingStage>,
        top: Arc<Recorder>,
        groups: Vec<Arc<RecordingStage>>,
    }

    fn fixture(groups: &[&str]) -> Fixture {
        let demux = Arc::new(Demultiplexer::new());
        let above = Arc::new(RecordingStage::new("above"));
        let shared = Pipeline::new(
            "shared",
            vec![
                Arc::new(RecordingStage::new("below")) as StageRef,
                Arc::clone(&demux) as StageRef,
                Arc::clone(&above) as StageRef,
            ],
        );
        let top = Arc::new(Recorder::default());
        shared.set_top_handler(top.clone());

        let mut taps = Vec::new();
        for group in groups {
            let tap = Arc::new(RecordingStage::new(format!("tap-{group}")));
            let stages = vec![Arc::clone(&tap) as StageRef];
            let (_, created) = demux.register_if_absent(group, || {
                ForkStack::new(group, stages, Arc::new(Recorder::default()))
            });
            assert!(created);
            taps.push(tap);
        }

        Fixture {
            shared,
            demux,
            above,
            top,
            groups: taps,
        }
    }

    #[test]
    fn untagged_message_passes_through() {
        let f = fixture(&["g1"]);
        f.shared.up(Event::Message(Message::new("plain"))).unwrap();

        assert_eq!(payload_strings(&f.top.messages()), vec!["plain"]);
        assert_eq!(f.above.up_count(), 1);
        assert_eq!(f.groups[0].up_count(), 0);
        assert_eq!(f.demux.stats().passed_through, 1);
    }

    #[test]
    fn tagged_message_is_routed_exclusively() {
        let f = fixture(&["g1", "g2"]);
        f.shared.up(Event::Message(tagged("x", "g2", "m1"))).unwrap();

        assert_eq!(f.groups[0].up_count(), 0);
        assert_eq!(f.groups[1].up_count(), 1);
        assert_eq!(f.above.up_count(), 0);
        assert!(f.top.events().is_empty());
        assert_eq!(f.demux.stats().routed, 1);
    }

    #[test]
    fn unknown_group_is_dropped_and_counted() {
        let f = fixture(&["g1"]);
        f.shared.up(Event::Message(tagged("x", "nope", "m1"))).unwrap();

        assert_eq!(f.groups[0].up_count(), 0);
        assert!(f.top.events().is_empty());
        assert_eq!(f.demux.stats().misses, 1);
    }

    #[test]
    fn header_without_group_fails_fast() {
        let f = fixture(&["g1"]);
        let mut msg = Message::new("x");
        msg.put_routing(RoutingHeader::for_member("m1"));

        let err = f.shared.up(Event::Message(msg)).unwrap_err();
        assert!(matches!(err, StageError::MalformedHeader(_)));
        assert!(f.top.events().is_empty());
    }

    #[test]
    fn view_change_reaches_every_group_and_shared_pipeline() {
        let f = fixture(&["g1", "g2", "g3"]);
        let addr = Address::random();
        f.shared
            .up(Event::ViewChange(View::new(addr, 1, vec![addr])))
            .unwrap();

        for tap in &f.groups {
            assert_eq!(tap.up_count(), 1);
        }
        assert_eq!(f.above.up_count(), 1);
        assert_eq!(f.top.views().len(), 1);
        assert_eq!(f.demux.stats().broadcasts, 1);
    }

    #[test]
    fn other_control_events_pass_through_only() {
        let f = fixture(&["g1"]);
        f.shared.up(Event::Suspect(Address::random())).unwrap();

        assert_eq!(f.groups[0].up_count(), 0);
        assert_eq!(f.top.events().len(), 1);
    }

    fn batch(messages: Vec<Message>) -> MessageBatch {
        MessageBatch::new(None, Address::random(), "cluster", true, messages)
    }

    #[test]
    fn batch_is_split_per_group_with_remainder_forwarded() {
        let f = fixture(&["g1", "g2"]);
        f.shared
            .up_batch(batch(vec![
                Message::new("p1"),
                tagged("a1", "g1", "m"),
                tagged("b1", "g2", "m"),
                Message::new("p2"),
                tagged("a2", "g1", "m"),
            ]))
            .unwrap();

        assert_eq!(f.groups[0].up_batch_count(), 1);
        assert_eq!(f.groups[1].up_batch_count(), 1);

        let upward = f.top.batches();
        assert_eq!(upward.len(), 1);
        assert_eq!(payload_strings(upward[0].messages()), vec!["p1", "p2"]);
        assert_eq!(upward[0].cluster_name(), "cluster");

        let stats = f.demux.stats();
        assert_eq!(stats.batches_split, 2);
        assert_eq!(stats.routed, 3);
        assert_eq!(stats.passed_through, 2);
    }

    #[test]
    fn fully_routed_batch_is_not_forwarded() {
        let f = fixture(&["g1"]);
        f.shared
            .up_batch(batch(vec![tagged("a1", "g1", "m"), tagged("a2", "g1", "m")]))
            .unwrap();

        assert_eq!(f.groups[0].up_batch_count(), 1);
        assert!(f.top.batches().is_empty());
        assert_eq!(f.above.up_batch_count(), 0);
    }

    #[test]
    fn batch_with_groupless_header_is_rejected_whole() {
        let f = fixture(&["g1"]);
        let mut groupless = Message::new("bad");
        groupless.put_routing(RoutingHeader::for_member("m1"));

        let err = f
            .shared
            .up_batch(batch(vec![Message::new("plain"), tagged("a", "g1", "m1"), groupless]))
            .unwrap_err();

        assert!(matches!(err, StageError::MalformedHeader(_)));
        assert_eq!(f.groups[0].up_batch_count(), 0);
        assert!(f.top.batches().is_empty());
        assert_eq!(f.above.up_batch_count(), 0);
        let stats = f.demux.stats();
        assert_eq!(stats.routed, 0);
        assert_eq!(stats.passed_through, 0);
    }

    #[test]
    fn failing_group_does_not_block_others() {
        let f = fixture(&["g2"]);
        f.demux.register_if_absent("g1", || {
            ForkStack::new(
                "g1",
                vec![Arc::new(FailingStage) as StageRef],
                Arc::new(Recorder::default()),
            )
        });

        f.shared
            .up_batch(batch(vec![
                tagged("a", "g1", "m"),
                tagged("b", "g2", "m"),
                Message::new("plain"),
            ]))
            .unwrap();

        assert_eq!(f.groups[0].up_batch_count(), 1);
        assert_eq!(f.top.batches().len(), 1);
        assert_eq!(f.demux.stats().batch_failures, 1);
    }

    #[test]
    fn register_if_absent_keeps_first_stack() {
        let demux = Demultiplexer::new();
        let (first, created) = demux.register_if_absent("g", || {
            ForkStack::new("g", Vec::new(), Arc::new(Recorder::default()))
        });
        assert!(created);
        let (second, created) = demux.register_if_absent("g", || unreachable!());
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(demux.groups(), vec!["g"]);
    }
}
