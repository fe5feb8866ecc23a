//! Bridge from synchronous pipeline delivery into async consumers.

use std::sync::Arc;

use tokio::sync::mpsc;

use forkline_core::Event;

use crate::error::StageError;
use crate::stack::UpHandler;

/// Up handler forwarding every event into an unbounded channel.
///
/// Sending never blocks, so it is safe to call from pipeline dispatch on any
/// thread, with or without a runtime.
pub struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    /// Create a sink and the receiver its events arrive on.
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl UpHandler for EventSink {
    fn up(&self, event: Event) -> Result<(), StageError> {
        self.tx
            .send(event)
            .map_err(|_| StageError::failed("event-sink", "receiver dropped"))
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use forkline_core::{Address, Message, MessageBatch};

    use super::*;

    #[tokio::test]
    async fn events_arrive_in_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.up(Event::Message(Message::new("a"))).unwrap();
        let batch = MessageBatch::new(
            None,
            Address::random(),
            "c",
            true,
            vec![Message::new("b"), Message::new("c")],
        );
        sink.up_batch(batch).unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event.into_message().unwrap().payload);
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[test]
    fn dropped_receiver_is_an_error() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        assert!(sink.up(Event::Message(Message::new("x"))).is_err());
    }
}
