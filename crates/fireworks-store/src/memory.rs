//! In-memory store for tests and single-process runs.
//!
//! State is lost when the process exits and is not shared across processes.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fireworks_workflow::{FireWork, FwId, Launch, LaunchId, LaunchState, Workflow, WorkflowId};

use crate::commit::{Commit, CommitOutcome, Conflict, LaunchGuard};
use crate::query::{FireWorkQuery, LaunchQuery};
use crate::{Error, IdKind, Store};

#[derive(Debug)]
struct Inner {
  workflows: BTreeMap<WorkflowId, Workflow>,
  fireworks: BTreeMap<FwId, FireWork>,
  launches: BTreeMap<LaunchId, Launch>,
  next_ids: HashMap<&'static str, i64>,
}

impl Default for Inner {
  fn default() -> Self {
    Self {
      workflows: BTreeMap::new(),
      fireworks: BTreeMap::new(),
      launches: BTreeMap::new(),
      next_ids: [IdKind::FireWork, IdKind::Launch, IdKind::Workflow]
        .into_iter()
        .map(|kind| (kind.as_str(), 1))
        .collect(),
    }
  }
}

/// Thread-safe store backed by one `RwLock`.
#[derive(Debug, Default)]
pub struct MemoryStore {
  inner: RwLock<Inner>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
  Error::Poisoned
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

fn next_revision(current: Option<u64>) -> u64 {
  current.map(|r| r + 1).unwrap_or(0)
}

impl Inner {
  fn put_workflow(&mut self, mut workflow: Workflow) {
    workflow.revision = next_revision(self.workflows.get(&workflow.workflow_id).map(|w| w.revision));
    self.workflows.insert(workflow.workflow_id, workflow);
  }

  fn put_firework(&mut self, mut firework: FireWork) {
    firework.revision = next_revision(self.fireworks.get(&firework.fw_id).map(|f| f.revision));
    self.fireworks.insert(firework.fw_id, firework);
  }

  fn put_launch(&mut self, launch: Launch) {
    self.launches.insert(launch.launch_id, launch);
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn allocate_ids(&self, kind: IdKind, count: usize) -> Result<Range<i64>, Error> {
    let mut inner = self.inner.write().map_err(poison_err)?;
    let next = inner.next_ids.entry(kind.as_str()).or_insert(1);
    let start = *next;
    *next += count as i64;
    Ok(start..*next)
  }

  async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow, Error> {
    let inner = self.inner.read().map_err(poison_err)?;
    inner
      .workflows
      .get(&workflow_id)
      .cloned()
      .ok_or(Error::NotFound {
        kind: "workflow",
        id: workflow_id,
      })
  }

  async fn get_firework(&self, fw_id: FwId) -> Result<FireWork, Error> {
    let inner = self.inner.read().map_err(poison_err)?;
    inner.fireworks.get(&fw_id).cloned().ok_or(Error::NotFound {
      kind: "firework",
      id: fw_id,
    })
  }

  async fn get_launch(&self, launch_id: LaunchId) -> Result<Launch, Error> {
    let inner = self.inner.read().map_err(poison_err)?;
    inner
      .launches
      .get(&launch_id)
      .cloned()
      .ok_or(Error::NotFound {
        kind: "launch",
        id: launch_id,
      })
  }

  async fn get_fireworks(&self, fw_ids: &[FwId]) -> Result<Vec<FireWork>, Error> {
    let inner = self.inner.read().map_err(poison_err)?;
    Ok(
      inner
        .fireworks
        .values()
        .filter(|fw| fw_ids.contains(&fw.fw_id))
        .cloned()
        .collect(),
    )
  }

  async fn query_fireworks(&self, query: &FireWorkQuery) -> Result<Vec<FireWork>, Error> {
    let inner = self.inner.read().map_err(poison_err)?;
    Ok(
      inner
        .fireworks
        .values()
        .filter(|fw| query.matches(fw))
        .cloned()
        .collect(),
    )
  }

  async fn query_launches(&self, query: &LaunchQuery) -> Result<Vec<Launch>, Error> {
    let inner = self.inner.read().map_err(poison_err)?;
    Ok(
      inner
        .launches
        .values()
        .filter(|l| query.matches(l))
        .cloned()
        .collect(),
    )
  }

  async fn upsert_workflow(&self, workflow: &Workflow) -> Result<(), Error> {
    let mut inner = self.inner.write().map_err(poison_err)?;
    inner.put_workflow(workflow.clone());
    Ok(())
  }

  async fn upsert_firework(&self, firework: &FireWork) -> Result<(), Error> {
    let mut inner = self.inner.write().map_err(poison_err)?;
    inner.put_firework(firework.clone());
    Ok(())
  }

  async fn upsert_launch(&self, launch: &Launch) -> Result<(), Error> {
    let mut inner = self.inner.write().map_err(poison_err)?;
    inner.put_launch(launch.clone());
    Ok(())
  }

  async fn commit(&self, commit: Commit) -> Result<CommitOutcome, Error> {
    let mut inner = self.inner.write().map_err(poison_err)?;

    for w in &commit.workflows {
      if !w.guard.admits(inner.workflows.get(&w.workflow.workflow_id)) {
        return Ok(CommitOutcome::Conflict(Conflict::Workflow(
          w.workflow.workflow_id,
        )));
      }
    }
    for f in &commit.fireworks {
      if !f.guard.admits(inner.fireworks.get(&f.firework.fw_id)) {
        return Ok(CommitOutcome::Conflict(Conflict::FireWork(f.firework.fw_id)));
      }
    }
    for l in &commit.launches {
      if !l.guard.admits(inner.launches.get(&l.launch.launch_id)) {
        return Ok(CommitOutcome::Conflict(Conflict::Launch(l.launch.launch_id)));
      }
    }

    for w in commit.workflows {
      inner.put_workflow(w.workflow);
    }
    for f in commit.fireworks {
      inner.put_firework(f.firework);
    }
    for l in commit.launches {
      let mut launch = l.launch;
      if matches!(l.guard, LaunchGuard::State(_) | LaunchGuard::Heartbeat { .. })
        && launch.reservation_id.is_none()
      {
        launch.reservation_id = inner
          .launches
          .get(&launch.launch_id)
          .and_then(|current| current.reservation_id.clone());
      }
      inner.put_launch(launch);
    }
    Ok(CommitOutcome::Applied)
  }

  async fn touch_launch(&self, launch_id: LaunchId, now: DateTime<Utc>) -> Result<bool, Error> {
    let mut inner = self.inner.write().map_err(poison_err)?;
    match inner.launches.get_mut(&launch_id) {
      Some(launch) if launch.state == LaunchState::Running => {
        launch.last_heartbeat = now;
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  async fn set_reservation_id(
    &self,
    launch_id: LaunchId,
    reservation_id: &str,
  ) -> Result<bool, Error> {
    let mut inner = self.inner.write().map_err(poison_err)?;
    match inner.launches.get_mut(&launch_id) {
      Some(launch) if matches!(launch.state, LaunchState::Reserved | LaunchState::Running) => {
        launch.reservation_id = Some(reservation_id.to_string());
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  async fn reset(&self) -> Result<(), Error> {
    let mut inner = self.inner.write().map_err(poison_err)?;
    *inner = Inner::default();
    Ok(())
  }
}
