use serde::{Deserialize, Serialize};

use crate::Spec;
use crate::definition::WorkflowDef;
use crate::mods::SpecMod;

/// What a finished FireWork asks the engine to do with the rest of the graph.
///
/// Every variant carries `stored_data`, which becomes the FireWork's output.
/// For CONTINUE and MODIFY it is also merged into each pending child's spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
  Continue {
    #[serde(default)]
    stored_data: Spec,
  },
  Modify {
    #[serde(default)]
    stored_data: Spec,
    #[serde(default)]
    mods: Vec<SpecMod>,
  },
  Defuse {
    #[serde(default)]
    stored_data: Spec,
  },
  /// Splice `detour` between this FireWork and its current children.
  Detour {
    #[serde(default)]
    stored_data: Spec,
    detour: WorkflowDef,
  },
  /// Defuse every other pending FireWork of the workflow.
  Abort {
    #[serde(default)]
    stored_data: Spec,
  },
}

impl Default for Action {
  fn default() -> Self {
    Action::Continue {
      stored_data: Spec::new(),
    }
  }
}

impl Action {
  pub fn name(&self) -> &'static str {
    match self {
      Action::Continue { .. } => "CONTINUE",
      Action::Modify { .. } => "MODIFY",
      Action::Defuse { .. } => "DEFUSE",
      Action::Detour { .. } => "DETOUR",
      Action::Abort { .. } => "ABORT",
    }
  }

  pub fn stored_data(&self) -> &Spec {
    match self {
      Action::Continue { stored_data }
      | Action::Modify { stored_data, .. }
      | Action::Defuse { stored_data }
      | Action::Detour { stored_data, .. }
      | Action::Abort { stored_data } => stored_data,
    }
  }

  pub fn stored_data_mut(&mut self) -> &mut Spec {
    match self {
      Action::Continue { stored_data }
      | Action::Modify { stored_data, .. }
      | Action::Defuse { stored_data }
      | Action::Detour { stored_data, .. }
      | Action::Abort { stored_data } => stored_data,
    }
  }

  /// Mutations for pending children; empty for every variant but MODIFY.
  pub fn mods(&self) -> &[SpecMod] {
    match self {
      Action::Modify { mods, .. } => mods,
      _ => &[],
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_wire_form() {
    let action: Action = serde_json::from_value(json!({
      "action": "MODIFY",
      "stored_data": {"sum": 3},
      "mods": [{"op": "append", "path": "input_array", "value": 3}]
    }))
    .unwrap();

    assert_eq!(action.name(), "MODIFY");
    assert_eq!(action.stored_data()["sum"], json!(3));
    assert_eq!(action.mods().len(), 1);

    let bare: Action = serde_json::from_value(json!({"action": "CONTINUE"})).unwrap();
    assert_eq!(bare, Action::default());
  }
}
