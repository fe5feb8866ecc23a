//! Copy-on-write stage pipeline.

use std::sync::{Arc, RwLock};

use tracing::{debug, info, trace};

use forkline_core::config::{MuxConfig, StagePosition};
use forkline_core::{Event, MessageBatch};

use super::stage::{DownHandler, Stage, StageRef, UpHandler};
use crate::error::StageError;

/// Where to insert a stage: above or below a named neighbor, or at the
/// top/bottom edge when no neighbor is given.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placement {
    pub position: StagePosition,
    pub neighbor: Option<String>,
}

impl Placement {
    pub fn above(neighbor: impl Into<String>) -> Self {
        Self {
            position: StagePosition::Above,
            neighbor: Some(neighbor.into()),
        }
    }

    pub fn below(neighbor: impl Into<String>) -> Self {
        Self {
            position: StagePosition::Below,
            neighbor: Some(neighbor.into()),
        }
    }

    /// Topmost position in the pipeline.
    pub const fn top() -> Self {
        Self {
            position: StagePosition::Above,
            neighbor: None,
        }
    }

    pub fn from_config(config: &MuxConfig) -> Self {
        Self {
            position: config.position,
            neighbor: config.neighbor.clone(),
        }
    }

    fn index_in(&self, stages: &[StageRef]) -> Result<usize, StageError> {
        let Some(neighbor) = &self.neighbor else {
            return Ok(match self.position {
                StagePosition::Above => stages.len(),
                StagePosition::Below => 0,
            });
        };
        let idx = stages
            .iter()
            .position(|s| s.name() == neighbor)
            .ok_or_else(|| StageError::NeighborNotFound(neighbor.clone()))?;
        Ok(match self.position {
            StagePosition::Above => idx + 1,
            StagePosition::Below => idx,
        })
    }
}

/// Ordered chain of stages, bottom (index 0) to top.
///
/// Dispatch works on a snapshot of the stage list, so no lock is held while
/// stages run and a stage may safely re-enter the pipeline.
pub struct Pipeline {
    name: String,
    stages: RwLock<Arc<[StageRef]>>,
    top: RwLock<Option<Arc<dyn UpHandler>>>,
    bottom: RwLock<Option<Arc<dyn DownHandler>>>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, stages: Vec<StageRef>) -> Self {
        Self {
            name: name.into(),
            stages: RwLock::new(stages.into()),
            top: RwLock::new(None),
            bottom: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn snapshot(&self) -> Arc<[StageRef]> {
        Arc::clone(&self.stages.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn stages(&self) -> Vec<StageRef> {
        self.snapshot().to_vec()
    }

    /// Stage names, bottom to top.
    pub fn stage_names(&self) -> Vec<String> {
        self.snapshot().iter().map(|s| s.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Set the consumer of events leaving the top stage.
    pub fn set_top_handler(&self, handler: Arc<dyn UpHandler>) {
        *self.top.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Set the sink for events leaving the bottom stage.
    pub fn set_bottom_sink(&self, sink: Arc<dyn DownHandler>) {
        *self.bottom.write().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    /// Deliver an inbound event at the bottom stage.
    pub fn up(&self, event: Event) -> Result<(), StageError> {
        let stages = self.snapshot();
        match stages.first() {
            Some(first) => first.up(event, &Link::new(self, &stages, 0)),
            None => self.deliver_top(event),
        }
    }

    pub fn up_batch(&self, batch: MessageBatch) -> Result<(), StageError> {
        let stages = self.snapshot();
        match stages.first() {
            Some(first) => first.up_batch(batch, &Link::new(self, &stages, 0)),
            None => self.deliver_top_batch(batch),
        }
    }

    /// Send an outbound event from the top stage.
    pub fn down(&self, event: Event) -> Result<(), StageError> {
        let stages = self.snapshot();
        match stages.len().checked_sub(1) {
            Some(top) => stages[top].down(event, &Link::new(self, &stages, top)),
            None => self.deliver_bottom(event),
        }
    }

    /// Send an outbound event starting at `stage`, which must be part of this
    /// pipeline.
    pub fn down_at(&self, stage: &StageRef, event: Event) -> Result<(), StageError> {
        let stages = self.snapshot();
        let idx = stages
            .iter()
            .position(|s| Arc::ptr_eq(s, stage))
            .ok_or_else(|| StageError::Detached {
                pipeline: self.name.clone(),
                stage: stage.name().to_string(),
            })?;
        stages[idx].down(event, &Link::new(self, &stages, idx))
    }

    /// First stage, bottom up, matching `pred`.
    pub fn find(&self, pred: impl Fn(&dyn Stage) -> bool) -> Option<StageRef> {
        self.snapshot().iter().find(|s| pred(s.as_ref())).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<StageRef> {
        self.find(|s| s.name() == name)
    }

    pub fn find_demux(&self) -> Option<StageRef> {
        self.find(|s| s.as_demux().is_some())
    }

    /// Insert `stage` at `placement`.
    pub fn insert(&self, stage: StageRef, placement: &Placement) -> Result<(), StageError> {
        let mut guard = self.stages.write().unwrap_or_else(|e| e.into_inner());
        let idx = placement.index_in(&guard)?;
        let mut next = guard.to_vec();
        info!(
            pipeline = %self.name,
            stage = stage.name(),
            index = idx,
            "Inserting stage"
        );
        next.insert(idx, stage);
        *guard = next.into();
        Ok(())
    }

    /// Return the first stage matching `pred`, or insert the one built by
    /// `make` at `placement`. The search and the insertion happen under one
    /// write lock. The flag is `true` when a stage was inserted.
    pub fn find_or_insert<P, F>(
        &self,
        pred: P,
        make: F,
        placement: &Placement,
    ) -> Result<(StageRef, bool), StageError>
    where
        P: Fn(&dyn Stage) -> bool,
        F: FnOnce() -> StageRef,
    {
        let mut guard = self.stages.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = guard.iter().find(|s| pred(s.as_ref())) {
            return Ok((Arc::clone(existing), false));
        }
        let idx = placement.index_in(&guard)?;
        let stage = make();
        info!(
            pipeline = %self.name,
            stage = stage.name(),
            index = idx,
            "Inserting stage"
        );
        let mut next = guard.to_vec();
        next.insert(idx, Arc::clone(&stage));
        *guard = next.into();
        Ok((stage, true))
    }

    fn deliver_top(&self, event: Event) -> Result<(), StageError> {
        let handler = self.top.read().unwrap_or_else(|e| e.into_inner()).clone();
        match handler {
            Some(h) => h.up(event),
            None => {
                trace!(pipeline = %self.name, kind = event.kind(), "No top handler; event dropped");
                Ok(())
            }
        }
    }

    fn deliver_top_batch(&self, batch: MessageBatch) -> Result<(), StageError> {
        let handler = self.top.read().unwrap_or_else(|e| e.into_inner()).clone();
        match handler {
            Some(h) => h.up_batch(batch),
            None => {
                trace!(pipeline = %self.name, size = batch.len(), "No top handler; batch dropped");
                Ok(())
            }
        }
    }

    fn deliver_bottom(&self, event: Event) -> Result<(), StageError> {
        let sink = self.bottom.read().unwrap_or_else(|e| e.into_inner()).clone();
        match sink {
            Some(s) => s.down(event),
            None => {
                debug!(pipeline = %self.name, kind = event.kind(), "No bottom sink");
                Err(StageError::NoSink {
                    pipeline: self.name.clone(),
                })
            }
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("stages", &self.stage_names())
            .finish_non_exhaustive()
    }
}

/// A stage's view of its neighbors during one dispatch.
pub struct Link<'a> {
    pipeline: &'a Pipeline,
    stages: &'a [StageRef],
    index: usize,
}

impl<'a> Link<'a> {
    const fn new(pipeline: &'a Pipeline, stages: &'a [StageRef], index: usize) -> Self {
        Self {
            pipeline,
            stages,
            index,
        }
    }

    const fn at(&self, index: usize) -> Self {
        Self::new(self.pipeline, self.stages, index)
    }

    pub const fn pipeline(&self) -> &Pipeline {
        self.pipeline
    }

    /// Forward to the stage above, or to the top handler.
    pub fn pass_up(&self, event: Event) -> Result<(), StageError> {
        let next = self.index + 1;
        match self.stages.get(next) {
            Some(stage) => stage.up(event, &self.at(next)),
            None => self.pipeline.deliver_top(event),
        }
    }

    pub fn pass_up_batch(&self, batch: MessageBatch) -> Result<(), StageError> {
        let next = self.index + 1;
        match self.stages.get(next) {
            Some(stage) => stage.up_batch(batch, &self.at(next)),
            None => self.pipeline.deliver_top_batch(batch),
        }
    }

    /// Forward to the stage below, or to the bottom sink.
    pub fn pass_down(&self, event: Event) -> Result<(), StageError> {
        match self.index.checked_sub(1) {
            Some(prev) => self.stages[prev].down(event, &self.at(prev)),
            None => self.pipeline.deliver_bottom(event),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use forkline_core::{Address, Message};

    use super::*;
    use crate::testing::{Recorder, RecordingStage, payload_strings};

    fn named(names: &[&str]) -> Vec<StageRef> {
        names
            .iter()
            .map(|n| Arc::new(RecordingStage::new(*n)) as StageRef)
            .collect()
    }

    #[test]
    fn up_flows_bottom_to_top_handler() {
        let bottom = Arc::new(RecordingStage::new("A"));
        let top = Arc::new(RecordingStage::new("B"));
        let pipeline = Pipeline::new(
            "p",
            vec![bottom.clone() as StageRef, top.clone() as StageRef],
        );
        let recorder = Arc::new(Recorder::default());
        pipeline.set_top_handler(recorder.clone());

        pipeline.up(Event::Message(Message::new("hi"))).unwrap();

        assert_eq!(bottom.up_count(), 1);
        assert_eq!(top.up_count(), 1);
        assert_eq!(payload_strings(&recorder.messages()), vec!["hi"]);
    }

    #[test]
    fn down_flows_top_to_bottom_sink() {
        let bottom = Arc::new(RecordingStage::new("A"));
        let pipeline = Pipeline::new(
            "p",
            vec![
                bottom.clone() as StageRef,
                Arc::new(RecordingStage::new("B")) as StageRef,
            ],
        );
        let sink = Arc::new(Recorder::default());
        pipeline.set_bottom_sink(sink.clone());

        pipeline.down(Event::Message(Message::new("out"))).unwrap();

        assert_eq!(bottom.down_count(), 1);
        assert_eq!(payload_strings(&sink.messages()), vec!["out"]);
    }

    #[test]
    fn down_without_sink_fails() {
        let pipeline = Pipeline::new("p", named(&["A"]));
        let err = pipeline.down(Event::Message(Message::new("x"))).unwrap_err();
        assert!(matches!(err, StageError::NoSink { .. }));
    }

    #[test]
    fn empty_pipeline_connects_edges() {
        let pipeline = Pipeline::new("p", Vec::new());
        let recorder = Arc::new(Recorder::default());
        pipeline.set_top_handler(recorder.clone());
        pipeline.set_bottom_sink(recorder.clone());

        pipeline.up(Event::Suspect(Address::random())).unwrap();
        pipeline.down(Event::Message(Message::new("d"))).unwrap();
        assert_eq!(recorder.events().len(), 2);
    }

    #[test]
    fn insert_above_and_below_neighbor() {
        let pipeline = Pipeline::new("p", named(&["A", "B"]));
        pipeline
            .insert(Arc::new(RecordingStage::new("X")), &Placement::above("A"))
            .unwrap();
        pipeline
            .insert(Arc::new(RecordingStage::new("Y")), &Placement::below("A"))
            .unwrap();
        pipeline
            .insert(Arc::new(RecordingStage::new("Z")), &Placement::top())
            .unwrap();
        assert_eq!(pipeline.stage_names(), vec!["Y", "A", "X", "B", "Z"]);
    }

    #[test]
    fn insert_next_to_missing_neighbor_fails() {
        let pipeline = Pipeline::new("p", named(&["A"]));
        let err = pipeline
            .insert(Arc::new(RecordingStage::new("X")), &Placement::above("NOPE"))
            .unwrap_err();
        assert_eq!(err, StageError::NeighborNotFound("NOPE".into()));
        assert_eq!(pipeline.len(), 1);
    }

    #[test]
    fn find_or_insert_is_idempotent() {
        let pipeline = Pipeline::new("p", named(&["A"]));
        let make = || Arc::new(RecordingStage::new("X")) as StageRef;

        let (first, inserted) = pipeline
            .find_or_insert(|s| s.name() == "X", make, &Placement::top())
            .unwrap();
        assert!(inserted);
        let (second, inserted) = pipeline
            .find_or_insert(|s| s.name() == "X", make, &Placement::top())
            .unwrap();
        assert!(!inserted);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pipeline.stage_names(), vec!["A", "X"]);
    }

    #[test]
    fn down_at_starts_below_given_stage() {
        let stages = named(&["A", "B", "C"]);
        let pipeline = Pipeline::new("p", stages.clone());
        let sink = Arc::new(Recorder::default());
        pipeline.set_bottom_sink(sink.clone());

        pipeline
            .down_at(&stages[1], Event::Message(Message::new("m")))
            .unwrap();
        assert_eq!(sink.messages().len(), 1);

        let foreign: StageRef = Arc::new(RecordingStage::new("F"));
        assert!(matches!(
            pipeline.down_at(&foreign, Event::Message(Message::new("m"))),
            Err(StageError::Detached { .. })
        ));
    }
}
