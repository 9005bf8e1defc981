use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;

/// Lifecycle state of a FireWork.
///
/// ```text
/// WAITING -> READY -> RESERVED -> RUNNING -> COMPLETED | FIZZLED
/// ```
///
/// DEFUSED and ARCHIVED are reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FwState {
  Waiting,
  Ready,
  Reserved,
  Running,
  Completed,
  Fizzled,
  Defused,
  Archived,
}

impl FwState {
  pub const ALL: [FwState; 8] = [
    FwState::Waiting,
    FwState::Ready,
    FwState::Reserved,
    FwState::Running,
    FwState::Completed,
    FwState::Fizzled,
    FwState::Defused,
    FwState::Archived,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      FwState::Waiting => "WAITING",
      FwState::Ready => "READY",
      FwState::Reserved => "RESERVED",
      FwState::Running => "RUNNING",
      FwState::Completed => "COMPLETED",
      FwState::Fizzled => "FIZZLED",
      FwState::Defused => "DEFUSED",
      FwState::Archived => "ARCHIVED",
    }
  }

  /// No further transition happens without an operator.
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      FwState::Completed | FwState::Fizzled | FwState::Defused | FwState::Archived
    )
  }

  /// Owned by a launch (reserved or executing).
  pub fn is_in_flight(self) -> bool {
    matches!(self, FwState::Reserved | FwState::Running)
  }

  /// Not yet started; spec mutations may still be applied.
  pub fn is_pending(self) -> bool {
    matches!(self, FwState::Waiting | FwState::Ready)
  }
}

impl fmt::Display for FwState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for FwState {
  type Err = WorkflowError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    FwState::ALL
      .into_iter()
      .find(|state| state.as_str().eq_ignore_ascii_case(s))
      .ok_or_else(|| WorkflowError::UnknownState(s.to_string()))
  }
}

/// State of a single launch attempt. Mirrors the in-flight and terminal
/// subset of [`FwState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LaunchState {
  Reserved,
  Running,
  Completed,
  Fizzled,
}

impl LaunchState {
  pub fn as_str(self) -> &'static str {
    match self {
      LaunchState::Reserved => "RESERVED",
      LaunchState::Running => "RUNNING",
      LaunchState::Completed => "COMPLETED",
      LaunchState::Fizzled => "FIZZLED",
    }
  }

  pub fn is_terminal(self) -> bool {
    matches!(self, LaunchState::Completed | LaunchState::Fizzled)
  }
}

impl fmt::Display for LaunchState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for LaunchState {
  type Err = WorkflowError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    [
      LaunchState::Reserved,
      LaunchState::Running,
      LaunchState::Completed,
      LaunchState::Fizzled,
    ]
    .into_iter()
    .find(|state| state.as_str().eq_ignore_ascii_case(s))
    .ok_or_else(|| WorkflowError::UnknownState(s.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_states() {
    for state in FwState::ALL {
      assert_eq!(state.as_str().parse::<FwState>().unwrap(), state);
    }
    assert_eq!("ready".parse::<FwState>().unwrap(), FwState::Ready);
    assert!("LAUNCHED".parse::<FwState>().is_err());
    assert_eq!("running".parse::<LaunchState>().unwrap(), LaunchState::Running);
  }

  #[test]
  fn test_state_classes() {
    assert!(FwState::Defused.is_terminal());
    assert!(!FwState::Running.is_terminal());
    assert!(FwState::Reserved.is_in_flight());
    assert!(FwState::Waiting.is_pending());
    assert!(!FwState::Reserved.is_pending());
    assert!(LaunchState::Fizzled.is_terminal());
    assert!(!LaunchState::Reserved.is_terminal());
  }

  #[test]
  fn test_serde_names() {
    assert_eq!(
      serde_json::to_string(&FwState::Completed).unwrap(),
      "\"COMPLETED\""
    );
    let state: LaunchState = serde_json::from_str("\"RESERVED\"").unwrap();
    assert_eq!(state, LaunchState::Reserved);
  }
}
