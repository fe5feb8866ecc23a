//! Test fixtures shared by unit and integration tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use forkline_core::{Event, Message, MessageBatch, RoutingHeader, View};

use crate::error::StageError;
use crate::stack::{DownHandler, Link, Stage, UpHandler};

/// Records every event and batch it receives, from either direction.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    batches: Mutex<Vec<MessageBatch>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Messages received one by one.
    pub fn messages(&self) -> Vec<Message> {
        self.events()
            .into_iter()
            .filter_map(Event::into_message)
            .collect()
    }

    pub fn views(&self) -> Vec<View> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::ViewChange(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    pub fn batches(&self) -> Vec<MessageBatch> {
        self.batches.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}

impl UpHandler for Recorder {
    fn up(&self, event: Event) -> Result<(), StageError> {
        self.record(event);
        Ok(())
    }

    fn up_batch(&self, batch: MessageBatch) -> Result<(), StageError> {
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(batch);
        Ok(())
    }
}

impl DownHandler for Recorder {
    fn down(&self, event: Event) -> Result<(), StageError> {
        self.record(event);
        Ok(())
    }
}

/// Pass-through stage that records what it sees.
pub struct RecordingStage {
    name: String,
    up: Recorder,
    down: Recorder,
    up_batches: AtomicUsize,
}

impl RecordingStage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            up: Recorder::default(),
            down: Recorder::default(),
            up_batches: AtomicUsize::new(0),
        }
    }

    pub fn up_events(&self) -> Vec<Event> {
        self.up.events()
    }

    pub fn down_events(&self) -> Vec<Event> {
        self.down.events()
    }

    pub fn up_count(&self) -> usize {
        self.up.events().len()
    }

    pub fn down_count(&self) -> usize {
        self.down.events().len()
    }

    pub fn up_batch_count(&self) -> usize {
        self.up_batches.load(Ordering::SeqCst)
    }
}

impl Stage for RecordingStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn up(&self, event: Event, link: &Link<'_>) -> Result<(), StageError> {
        self.up.record(event.clone());
        link.pass_up(event)
    }

    fn up_batch(&self, batch: MessageBatch, link: &Link<'_>) -> Result<(), StageError> {
        self.up_batches.fetch_add(1, Ordering::SeqCst);
        link.pass_up_batch(batch)
    }

    fn down(&self, event: Event, link: &Link<'_>) -> Result<(), StageError> {
        self.down.record(event.clone());
        link.pass_down(event)
    }
}

/// Stage rejecting everything travelling up.
pub struct FailingStage;

impl Stage for FailingStage {
    fn name(&self) -> &str {
        "failing"
    }

    fn up(&self, _event: Event, _link: &Link<'_>) -> Result<(), StageError> {
        Err(StageError::failed("failing", "rejects inbound events"))
    }

    fn up_batch(&self, _batch: MessageBatch, _link: &Link<'_>) -> Result<(), StageError> {
        Err(StageError::failed("failing", "rejects inbound batches"))
    }
}

/// Message carrying a complete routing header.
pub fn tagged(payload: &str, group_id: &str, member_id: &str) -> Message {
    let mut msg = Message::new(payload.to_string());
    msg.put_routing(RoutingHeader::new(group_id, member_id));
    msg
}

/// Payloads as UTF-8 strings, in order.
pub fn payload_strings(msgs: &[Message]) -> Vec<String> {
    msgs.iter()
        .map(|m| String::from_utf8_lossy(&m.payload).into_owned())
        .collect()
}
