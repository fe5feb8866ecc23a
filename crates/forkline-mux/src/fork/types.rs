//! Fork layer types.

use serde::Serialize;

use crate::channel::ChannelStatus;
use crate::error::StageError;

/// Demultiplexer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DemuxStats {
    /// Fork stacks registered.
    pub groups: usize,
    /// Messages delivered into a fork stack.
    pub routed: u64,
    /// Messages without a routing header passed up the shared pipeline.
    pub passed_through: u64,
    /// Messages for a group with no fork stack.
    pub misses: u64,
    /// Broadcast events fanned out to every fork stack.
    pub broadcasts: u64,
    /// Sub-batches handed to fork stacks.
    pub batches_split: u64,
    /// Sub-batches a fork stack failed to accept.
    pub batch_failures: u64,
}

/// Fork channel setup and usage errors.
#[derive(Debug, thiserror::Error)]
pub enum ForkError {
    #[error("A shared channel is required")]
    MissingSharedChannel,

    #[error("{field} must be a non-empty identifier")]
    InvalidId { field: &'static str },

    #[error("No demultiplexer in the shared pipeline and auto-creation is disabled")]
    DemuxAbsent,

    #[error("Fork channel {group_id}:{member_id} is already present")]
    DuplicateMember { group_id: String, member_id: String },

    #[error("Fork stack {group_id} already exists")]
    GroupExists { group_id: String },

    #[error("Fork channel is not connected (status: {status})")]
    NotConnected { status: ChannelStatus },

    #[error("Operation not supported by fork channels: {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Stage(#[from] StageError),
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn stats_serialize_with_field_names() {
        let stats = DemuxStats {
            groups: 2,
            routed: 5,
            misses: 1,
            ..DemuxStats::default()
        };
        let value = serde_json::to_value(stats).unwrap();
        assert_eq!(value["groups"], 2);
        assert_eq!(value["routed"], 5);
        assert_eq!(value["misses"], 1);
        assert_eq!(value["batch_failures"], 0);
    }

    #[test]
    fn errors_name_the_offending_key() {
        let err = ForkError::DuplicateMember {
            group_id: "g".into(),
            member_id: "m".into(),
        };
        assert_eq!(err.to_string(), "Fork channel g:m is already present");

        let err = ForkError::NotConnected {
            status: ChannelStatus::Closed,
        };
        assert!(err.to_string().contains("closed"));
    }
}
