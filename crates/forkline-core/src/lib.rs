//! forkline Core Library
//!
//! Shared functionality for forkline components:
//! - Message, batch and event model carried through pipelines
//! - Routing header and message wire codec
//! - Configuration resolution and hierarchy
//! - Common error types and tracing setup

pub mod config;
pub mod error;
pub mod event;
pub mod header;
pub mod message;
pub mod tracing_init;
pub mod types;
pub mod wire;

pub use config::Config;
pub use error::{Error, Result};
pub use event::Event;
pub use header::{ROUTING_HEADER_ID, RoutingHeader};
pub use message::{Header, Headers, Message, MessageBatch};
pub use types::{Address, View};
