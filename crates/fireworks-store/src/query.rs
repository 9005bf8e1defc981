use std::collections::BTreeMap;

use fireworks_workflow::{FireWork, FwId, FwState, Launch, LaunchState, WorkflowId, get_path};
use serde_json::Value;

/// Predicate over fireworks. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FireWorkQuery {
  /// Any of these states.
  pub states: Vec<FwState>,
  pub workflow_id: Option<WorkflowId>,
  pub fw_ids: Option<Vec<FwId>>,
  /// Dotted spec path -> required value.
  pub spec: BTreeMap<String, Value>,
}

impl FireWorkQuery {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn state(mut self, state: FwState) -> Self {
    self.states.push(state);
    self
  }

  pub fn states(mut self, states: impl IntoIterator<Item = FwState>) -> Self {
    self.states.extend(states);
    self
  }

  pub fn workflow(mut self, workflow_id: WorkflowId) -> Self {
    self.workflow_id = Some(workflow_id);
    self
  }

  pub fn ids(mut self, fw_ids: Vec<FwId>) -> Self {
    self.fw_ids = Some(fw_ids);
    self
  }

  pub fn spec_eq(mut self, path: impl Into<String>, value: Value) -> Self {
    self.spec.insert(path.into(), value);
    self
  }

  pub fn matches(&self, fw: &FireWork) -> bool {
    (self.states.is_empty() || self.states.contains(&fw.state))
      && self.workflow_id.is_none_or(|id| fw.workflow_id == id)
      && self
        .fw_ids
        .as_ref()
        .is_none_or(|ids| ids.contains(&fw.fw_id))
      && self.matches_spec(fw)
  }

  pub(crate) fn matches_spec(&self, fw: &FireWork) -> bool {
    self
      .spec
      .iter()
      .all(|(path, expected)| get_path(&fw.spec, path) == Some(expected))
  }
}

/// Predicate over launches. Empty fields match everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaunchQuery {
  pub state: Option<LaunchState>,
  pub fw_id: Option<FwId>,
}

impl LaunchQuery {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn state(mut self, state: LaunchState) -> Self {
    self.state = Some(state);
    self
  }

  pub fn firework(mut self, fw_id: FwId) -> Self {
    self.fw_id = Some(fw_id);
    self
  }

  pub fn matches(&self, launch: &Launch) -> bool {
    self.state.is_none_or(|s| launch.state == s) && self.fw_id.is_none_or(|id| launch.fw_id == id)
  }
}
