//! Stage and boundary handler contracts.

use std::sync::Arc;

use forkline_core::{Event, MessageBatch};

use super::pipeline::Link;
use crate::error::StageError;
use crate::fork::Demultiplexer;

/// Shared handle to a stage.
pub type StageRef = Arc<dyn Stage>;

/// One processing step in a pipeline.
///
/// Every method has a pass-through default, so a stage only overrides the
/// directions it cares about.
pub trait Stage: Send + Sync {
    /// Name used to select this stage as an insertion neighbor.
    fn name(&self) -> &str;

    /// Capability accessor: `Some` only for the demultiplexer stage.
    fn as_demux(&self) -> Option<&Demultiplexer> {
        None
    }

    fn up(&self, event: Event, link: &Link<'_>) -> Result<(), StageError> {
        link.pass_up(event)
    }

    fn up_batch(&self, batch: MessageBatch, link: &Link<'_>) -> Result<(), StageError> {
        link.pass_up_batch(batch)
    }

    fn down(&self, event: Event, link: &Link<'_>) -> Result<(), StageError> {
        link.pass_down(event)
    }
}

impl std::fmt::Debug for dyn Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Stage").field(&self.name()).finish()
    }
}

/// Receives whatever leaves the top of a pipeline.
pub trait UpHandler: Send + Sync {
    fn up(&self, event: Event) -> Result<(), StageError>;

    fn up_batch(&self, batch: MessageBatch) -> Result<(), StageError> {
        for msg in batch {
            self.up(Event::Message(msg))?;
        }
        Ok(())
    }
}

/// Receives whatever leaves the bottom of a pipeline.
pub trait DownHandler: Send + Sync {
    fn down(&self, event: Event) -> Result<(), StageError>;
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::RecordingStage;

    #[test]
    fn stage_ref_debug_shows_name() {
        let stage: StageRef = Arc::new(RecordingStage::new("NAKACK"));
        assert_eq!(format!("{stage:?}"), r#"Stage("NAKACK")"#);
    }
}
