use std::path::PathBuf;

use fireworks_task::TaskError;
use fireworks_workflow::{FwId, FwState, LaunchId, WorkflowError};
use thiserror::Error;

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
  #[error(transparent)]
  Store(#[from] fireworks_store::Error),

  #[error(transparent)]
  Workflow(#[from] WorkflowError),

  #[error(transparent)]
  Task(#[from] TaskError),

  /// The operation is not allowed from the firework's current state.
  #[error("cannot {operation} firework {fw_id} in state {state}")]
  InvalidState {
    fw_id: FwId,
    state: FwState,
    operation: &'static str,
  },

  /// The launch no longer owns its firework (expired, defused or finished
  /// by someone else).
  #[error("launch {launch_id} lost ownership of its firework")]
  LaunchLost { launch_id: LaunchId },

  /// Concurrent writers kept invalidating our reads.
  #[error("gave up on {operation} after {attempts} conflicting attempts")]
  Contention {
    operation: &'static str,
    attempts: u32,
  },

  #[error("reset refused: password must be today's date ({expected})")]
  ResetRefused { expected: String },

  #[error("io error on {}: {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}
