//! forkline multiplexer library
//!
//! Lets one shared, already established channel present itself as many
//! independent fork channels:
//! - Stage pipelines with up/down dispatch and positional insertion
//! - A demultiplexer stage routing traffic into per-group fork stacks
//! - Fork stacks spliced from caller-supplied stages
//! - Fork channel handles tagging and sending on behalf of one member
//! - An in-memory shared channel for local clusters and tests

pub mod channel;
pub mod error;
pub mod fork;
pub mod sink;
pub mod stack;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use channel::{
    ChannelListener, ChannelStats, ChannelStatus, ListenerId, LocalChannel, MemoryNetwork,
    SharedChannel,
};
pub use error::StageError;
pub use fork::{
    DemuxStats, Demultiplexer, ForkChannel, ForkChannelBuilder, ForkError, ForkStack,
};
pub use sink::EventSink;
pub use stack::{DownHandler, Link, Pipeline, Placement, Stage, StageRef, UpHandler};
