use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::fworker::FWorker;
use crate::state::LaunchState;
use crate::{FwId, LaunchId};

/// One execution attempt of a FireWork.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Launch {
  pub launch_id: LaunchId,
  pub fw_id: FwId,
  pub fworker: FWorker,
  pub host: String,
  pub launch_dir: Option<String>,
  pub state: LaunchState,
  /// External queue job id when the launch was reserved through a queue.
  pub reservation_id: Option<String>,
  pub created_on: DateTime<Utc>,
  pub last_heartbeat: DateTime<Utc>,
  pub started_on: Option<DateTime<Utc>>,
  pub ended_on: Option<DateTime<Utc>>,
  pub action: Option<Action>,
  pub error: Option<String>,
}

impl Launch {
  /// A RUNNING launch whose heartbeat is strictly older than `expiration`.
  pub fn is_stale_run(&self, now: DateTime<Utc>, expiration: Duration) -> bool {
    self.state == LaunchState::Running && now - self.last_heartbeat > expiration
  }

  /// A RESERVED launch created strictly longer than `expiration` ago.
  pub fn is_stale_reservation(&self, now: DateTime<Utc>, expiration: Duration) -> bool {
    self.state == LaunchState::Reserved && now - self.created_on > expiration
  }
}
