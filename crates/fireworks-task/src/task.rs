use std::path::PathBuf;

use async_trait::async_trait;
use fireworks_workflow::{Action, FwId, LaunchId, Spec};

use crate::error::TaskError;

/// Context provided to a task during execution.
#[derive(Debug, Clone)]
pub struct TaskContext {
  pub fw_id: FwId,
  pub launch_id: LaunchId,
  /// Working directory of the launch; tasks run relative to it when set.
  pub launch_dir: Option<PathBuf>,
}

/// One unit of work inside a FireWork.
///
/// Tasks see the FireWork spec read-only and report their effect on the rest
/// of the graph through the returned [`Action`]. An `Err` fizzles the launch.
#[async_trait]
pub trait FireTask: Send + Sync + std::fmt::Debug {
  /// The `_fw_name` this task is registered under.
  fn name(&self) -> &str;

  async fn run_task(&self, spec: &Spec, ctx: &TaskContext) -> Result<Action, TaskError>;
}
