use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fireworks_workflow::{
  Action, FWorker, FireWork, FwId, FwState, Launch, LaunchId, LaunchState, Spec, TaskSpec, Workflow,
};
use sqlx::FromRow;
use sqlx::types::Json;

use crate::Error;

/// A workflow as stored in the database.
#[derive(Debug, FromRow)]
pub(crate) struct WorkflowRow {
  pub workflow_id: i64,
  pub name: String,
  pub fw_ids: Json<Vec<FwId>>,
  pub links: Json<BTreeMap<FwId, Vec<FwId>>>,
  pub revision: i64,
  pub created_on: DateTime<Utc>,
  pub updated_on: DateTime<Utc>,
}

/// A firework as stored in the database.
#[derive(Debug, FromRow)]
pub(crate) struct FireWorkRow {
  pub fw_id: i64,
  pub workflow_id: i64,
  pub name: String,
  pub tasks: Json<Vec<TaskSpec>>,
  pub spec: Json<Spec>,
  pub state: String,
  pub output: Json<Spec>,
  pub launch_ids: Json<Vec<LaunchId>>,
  pub revision: i64,
  pub created_on: DateTime<Utc>,
  pub updated_on: DateTime<Utc>,
}

/// A launch as stored in the database.
#[derive(Debug, FromRow)]
pub(crate) struct LaunchRow {
  pub launch_id: i64,
  pub fw_id: i64,
  pub fworker: Json<FWorker>,
  pub host: String,
  pub launch_dir: Option<String>,
  pub state: String,
  pub reservation_id: Option<String>,
  pub created_on: DateTime<Utc>,
  pub last_heartbeat: DateTime<Utc>,
  pub started_on: Option<DateTime<Utc>>,
  pub ended_on: Option<DateTime<Utc>>,
  pub action: Option<Json<Action>>,
  pub error: Option<String>,
}

fn corrupt(record: String, message: impl ToString) -> Error {
  Error::Corrupt {
    record,
    message: message.to_string(),
  }
}

fn revision(record: impl Fn() -> String, value: i64) -> Result<u64, Error> {
  u64::try_from(value).map_err(|e| corrupt(record(), e))
}

impl TryFrom<WorkflowRow> for Workflow {
  type Error = Error;

  fn try_from(row: WorkflowRow) -> Result<Self, Error> {
    let record = || format!("workflow {}", row.workflow_id);
    Ok(Workflow {
      workflow_id: row.workflow_id,
      revision: revision(record, row.revision)?,
      name: row.name,
      fw_ids: row.fw_ids.0,
      links: row.links.0,
      created_on: row.created_on,
      updated_on: row.updated_on,
    })
  }
}

impl TryFrom<FireWorkRow> for FireWork {
  type Error = Error;

  fn try_from(row: FireWorkRow) -> Result<Self, Error> {
    let record = || format!("firework {}", row.fw_id);
    let state: FwState = row.state.parse().map_err(|e| corrupt(record(), e))?;
    Ok(FireWork {
      fw_id: row.fw_id,
      revision: revision(record, row.revision)?,
      workflow_id: row.workflow_id,
      name: row.name,
      tasks: row.tasks.0,
      spec: row.spec.0,
      state,
      output: row.output.0,
      launch_ids: row.launch_ids.0,
      created_on: row.created_on,
      updated_on: row.updated_on,
    })
  }
}

impl TryFrom<LaunchRow> for Launch {
  type Error = Error;

  fn try_from(row: LaunchRow) -> Result<Self, Error> {
    let state: LaunchState = row
      .state
      .parse()
      .map_err(|e| corrupt(format!("launch {}", row.launch_id), e))?;
    Ok(Launch {
      launch_id: row.launch_id,
      fw_id: row.fw_id,
      fworker: row.fworker.0,
      host: row.host,
      launch_dir: row.launch_dir,
      state,
      reservation_id: row.reservation_id,
      created_on: row.created_on,
      last_heartbeat: row.last_heartbeat,
      started_on: row.started_on,
      ended_on: row.ended_on,
      action: row.action.map(|a| a.0),
      error: row.error,
    })
  }
}
