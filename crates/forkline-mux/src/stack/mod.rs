//! Stage pipelines.
//!
//! A pipeline is an ordered chain of stages, bottom to top. Inbound events
//! enter at the bottom and travel up; outbound events enter at the top and
//! travel down. Each stage forwards to its neighbors through a [`Link`].

mod pipeline;
mod stage;

pub use pipeline::{Link, Pipeline, Placement};
pub use stage::{DownHandler, Stage, StageRef, UpHandler};
