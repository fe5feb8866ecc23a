//! Splicing fork stacks into a shared pipeline.

use std::sync::{Arc, Weak};

use tracing::{debug, info};

use forkline_core::Event;

use super::demux::Demultiplexer;
use super::stack::ForkStack;
use super::types::ForkError;
use crate::error::StageError;
use crate::stack::{DownHandler, Pipeline, Placement, Stage, StageRef};

/// Find the demultiplexer in `shared`, inserting a new one at `placement`
/// when `create_if_absent` is set. Lookup and insertion are atomic, so
/// concurrent callers always end up with the same stage.
pub fn ensure_demux(
    shared: &Pipeline,
    create_if_absent: bool,
    placement: &Placement,
) -> Result<StageRef, ForkError> {
    if !create_if_absent {
        return shared.find_demux().ok_or(ForkError::DemuxAbsent);
    }
    let (demux, inserted) = shared.find_or_insert(
        |s| s.as_demux().is_some(),
        || Arc::new(Demultiplexer::new()) as StageRef,
        placement,
    )?;
    if inserted {
        info!(pipeline = shared.name(), stages = ?shared.stage_names(), "Demultiplexer spliced in");
    } else {
        debug!(pipeline = shared.name(), "Reusing existing demultiplexer");
    }
    Ok(demux)
}

/// Return the fork stack of `group_id` registered with `demux`, creating it
/// from `stages` if absent. With `require_fresh`, an existing stack is an
/// error instead. `stages` is discarded when the stack already exists.
pub fn fork_stack(
    demux: &StageRef,
    shared: &Arc<Pipeline>,
    group_id: &str,
    stages: Vec<StageRef>,
    require_fresh: bool,
) -> Result<Arc<ForkStack>, ForkError> {
    let registry = demux.as_demux().ok_or(ForkError::DemuxAbsent)?;
    let anchor = Arc::new(DemuxAnchor {
        shared: Arc::downgrade(shared),
        demux: Arc::downgrade(demux),
    });
    let (stack, created) =
        registry.register_if_absent(group_id, || ForkStack::new(group_id, stages, anchor));
    if !created {
        if require_fresh {
            return Err(ForkError::GroupExists {
                group_id: group_id.to_string(),
            });
        }
        debug!(group_id, "Joining existing fork stack");
    }
    Ok(stack)
}

/// Bottom sink of a fork stack: re-enters the shared pipeline just below the
/// demultiplexer. Holds weak references so a fork stack never keeps the
/// shared pipeline alive.
struct DemuxAnchor {
    shared: Weak<Pipeline>,
    demux: Weak<dyn Stage>,
}

impl DownHandler for DemuxAnchor {
    fn down(&self, event: Event) -> Result<(), StageError> {
        let (Some(shared), Some(demux)) = (self.shared.upgrade(), self.demux.upgrade()) else {
            return Err(StageError::Transport("shared pipeline is gone".into()));
        };
        shared.down_at(&demux, event)
    }
}
