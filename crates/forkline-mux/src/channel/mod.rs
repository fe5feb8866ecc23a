//! Shared channel contract and an in-memory implementation.
//!
//! The fork layer only needs identity accessors, the shared pipeline, a
//! status-change subscription and a downward send path from the channel it
//! multiplexes over.

mod local;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use forkline_core::{Address, Message, View};

use crate::error::StageError;
use crate::stack::Pipeline;

pub use local::{LocalChannel, MemoryNetwork};

/// Connection status of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Open,
    Connecting,
    Connected,
    Closed,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
        })
    }
}

/// Traffic counters of a shared channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Subscription token returned by [`SharedChannel::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// Observer of a shared channel's status changes.
pub trait ChannelListener: Send + Sync {
    fn status_changed(&self, channel: &dyn SharedChannel, status: ChannelStatus);
}

/// The physical channel fork channels multiplex over.
pub trait SharedChannel: Send + Sync {
    fn address(&self) -> Option<Address>;

    fn name(&self) -> Option<String>;

    /// Logical name of another member, if known.
    fn name_of(&self, member: &Address) -> Option<String>;

    fn cluster_name(&self) -> Option<String>;

    fn view(&self) -> Option<View>;

    fn status(&self) -> ChannelStatus;

    fn pipeline(&self) -> &Arc<Pipeline>;

    /// Send a message down the whole shared pipeline.
    fn send(&self, msg: Message) -> Result<(), StageError>;

    fn stats(&self) -> ChannelStats;

    fn subscribe(&self, listener: Arc<dyn ChannelListener>) -> ListenerId;

    /// Returns `false` when `id` was not subscribed.
    fn unsubscribe(&self, id: ListenerId) -> bool;
}
