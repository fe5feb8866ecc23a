//! Fork channels: many logical channels over one shared channel.
//!
//! Data flow:
//! ```text
//! ForkChannel::send → ForkStack (top → caller stages → ForkBottom tags group)
//!     → Demultiplexer position in the shared pipeline → transport
//! transport → shared pipeline → Demultiplexer (route by group)
//!     → ForkStack (bottom → caller stages → ForkTop routes by member) → ForkChannel
//! ```

mod channel;
mod demux;
mod splice;
mod stack;
mod types;

pub use channel::{ForkChannel, ForkChannelBuilder};
pub use demux::{DEMUX_STAGE_NAME, Demultiplexer};
pub use splice::{ensure_demux, fork_stack};
pub use stack::ForkStack;
pub use types::{DemuxStats, ForkError};
