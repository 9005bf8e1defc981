use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::FwState;
use crate::{FwId, LaunchId, Spec, WorkflowId};

/// Spec key naming the worker category a FireWork requires.
pub const CATEGORY_KEY: &str = "_category";

/// Spec key holding the claim priority; higher is claimed first.
pub const PRIORITY_KEY: &str = "_priority";

/// One task entry of a FireWork, tagged by `_fw_name`.
///
/// The parameters stay untyped here; `fireworks-task` resolves the tag to a
/// constructor and hands it the parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
  #[serde(rename = "_fw_name")]
  pub name: String,
  #[serde(flatten)]
  pub params: Spec,
}

impl TaskSpec {
  pub fn new(name: impl Into<String>, params: Spec) -> Self {
    Self {
      name: name.into(),
      params,
    }
  }
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireWork {
  pub fw_id: FwId,
  pub workflow_id: WorkflowId,
  pub name: String,
  pub tasks: Vec<TaskSpec>,
  pub spec: Spec,
  pub state: FwState,
  /// Stored data of the completed launch.
  #[serde(default)]
  pub output: Spec,
  /// Launch history, oldest first. The last entry is the active launch
  /// while the FireWork is in flight.
  #[serde(default)]
  pub launch_ids: Vec<LaunchId>,
  /// Bumped by the store on every write.
  #[serde(default)]
  pub revision: u64,
  pub created_on: DateTime<Utc>,
  pub updated_on: DateTime<Utc>,
}

impl FireWork {
  pub fn category(&self) -> Option<&str> {
    self.spec.get(CATEGORY_KEY).and_then(Value::as_str)
  }

  pub fn priority(&self) -> f64 {
    self
      .spec
      .get(PRIORITY_KEY)
      .and_then(Value::as_f64)
      .unwrap_or(0.0)
  }

  pub fn active_launch_id(&self) -> Option<LaunchId> {
    if self.state.is_in_flight() {
      self.launch_ids.last().copied()
    } else {
      None
    }
  }
}
