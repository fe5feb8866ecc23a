//! Events travelling through pipelines.

use crate::message::Message;
use crate::types::{Address, View};

/// A unit of traffic handed from stage to stage.
#[derive(Debug, Clone)]
pub enum Event {
    /// An application message.
    Message(Message),
    /// A new membership view was installed.
    ViewChange(View),
    /// The local member's address became known.
    SetLocalAddress(Address),
    /// A member is suspected of having failed.
    Suspect(Address),
}

impl Event {
    /// Whether the event is fanned out to every logical channel instead of
    /// being routed to one of them.
    pub const fn is_broadcast(&self) -> bool {
        matches!(self, Self::ViewChange(_))
    }

    pub const fn as_message(&self) -> Option<&Message> {
        match self {
            Self::Message(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn into_message(self) -> Option<Message> {
        match self {
            Self::Message(msg) => Some(msg),
            _ => None,
        }
    }

    /// Short event kind used in log fields.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::ViewChange(_) => "view_change",
            Self::SetLocalAddress(_) => "set_local_address",
            Self::Suspect(_) => "suspect",
        }
    }
}

impl From<Message> for Event {
    fn from(msg: Message) -> Self {
        Self::Message(msg)
    }
}
