//! Applies a finished launch's [`Action`] to the rest of its workflow.
//!
//! Completion of the FireWork, the launch record and every child mutation are
//! written as one guarded commit. Only a DETOUR rewrites the workflow's links;
//! every other action guards the FireWorks it writes, so siblings finishing
//! in parallel only collide when they share a child. A conflict means another
//! writer got there first: the interpreter backs off, re-reads and rebuilds
//! the commit.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fireworks_store::{Commit, CommitOutcome, FireWorkGuard, IdKind, LaunchGuard, WorkflowGuard};
use fireworks_workflow::{
  Action, FireWork, FwId, FwState, Graph, Launch, LaunchId, LaunchState, Spec, WorkflowDef,
  apply_mods, merge_into,
};
use tracing::{debug, info, warn};

use crate::{MAX_COMMIT_ATTEMPTS, backoff};
use crate::error::EngineError;
use crate::launchpad::LaunchPad;

/// A DETOUR sub-workflow with its stored ids already allocated.
struct PreparedDetour {
  def: WorkflowDef,
  id_map: BTreeMap<FwId, FwId>,
}

impl PreparedDetour {
  fn remap(&self, id: FwId) -> FwId {
    self.id_map.get(&id).copied().unwrap_or(id)
  }

  fn ids(&self) -> Vec<FwId> {
    self.def.fw_ids().into_iter().map(|id| self.remap(id)).collect()
  }

  fn links(&self) -> BTreeMap<FwId, Vec<FwId>> {
    self
      .def
      .links
      .iter()
      .map(|(from, children)| {
        (
          self.remap(*from),
          children.iter().map(|c| self.remap(*c)).collect(),
        )
      })
      .collect()
  }
}

impl LaunchPad {
  /// Finish `launch` of `fw` with `action`.
  ///
  /// Returns the ids of the FireWorks other than `fw` that were written.
  /// Fails with [`EngineError::LaunchLost`] when the launch no longer owns a
  /// RUNNING FireWork.
  pub async fn apply_action(
    &self,
    fw: &FireWork,
    launch: &Launch,
    action: Action,
  ) -> Result<Vec<FwId>, EngineError> {
    let detour = match &action {
      Action::Detour { detour, .. } => Some(self.prepare_detour(detour.clone()).await?),
      _ => None,
    };

    for attempt in 0..MAX_COMMIT_ATTEMPTS {
      if attempt > 0 {
        backoff(attempt).await;
      }
      let Some((commit, affected)) = self
        .build_completion(fw.fw_id, launch.launch_id, &action, detour.as_ref())
        .await?
      else {
        debug!(fw_id = fw.fw_id, attempt, "workflow_changed_during_read");
        continue;
      };
      match self.store().commit(commit).await? {
        CommitOutcome::Applied => {
          info!(
            fw_id = fw.fw_id,
            launch_id = launch.launch_id,
            action = action.name(),
            affected = affected.len(),
            "action_applied"
          );
          return Ok(affected);
        }
        CommitOutcome::Conflict(conflict) => {
          debug!(fw_id = fw.fw_id, ?conflict, attempt, "action_commit_conflict");
        }
      }
    }

    warn!(fw_id = fw.fw_id, action = action.name(), "action_gave_up");
    Err(EngineError::Contention {
      operation: "apply_action",
      attempts: MAX_COMMIT_ATTEMPTS,
    })
  }

  async fn prepare_detour(&self, def: WorkflowDef) -> Result<PreparedDetour, EngineError> {
    let def = def.normalized()?;
    let ids = self
      .store()
      .allocate_ids(IdKind::FireWork, def.fireworks.len())
      .await?;
    let id_map = def.fw_ids().into_iter().zip(ids).collect();
    Ok(PreparedDetour { def, id_map })
  }

  async fn build_completion(
    &self,
    fw_id: FwId,
    launch_id: LaunchId,
    action: &Action,
    detour: Option<&PreparedDetour>,
  ) -> Result<Option<(Commit, Vec<FwId>)>, EngineError> {
    let store = self.store();
    let mut fw = store.get_firework(fw_id).await?;
    let mut launch = store.get_launch(launch_id).await?;
    if fw.state != FwState::Running
      || launch.state != LaunchState::Running
      || fw.active_launch_id() != Some(launch_id)
    {
      return Err(EngineError::LaunchLost { launch_id });
    }
    let mut workflow = store.get_workflow(fw.workflow_id).await?;
    let revision_read = workflow.revision;
    let graph = workflow.graph();

    let now = Utc::now();
    let mut commit = Commit::new();
    let mut affected = Vec::new();
    let stored_data = action.stored_data();

    let fw_guard = FireWorkGuard::Exact {
      state: FwState::Running,
      revision: fw.revision,
    };
    fw.state = match action {
      Action::Defuse { .. } => FwState::Defused,
      _ => FwState::Completed,
    };
    fw.output = stored_data.clone();
    fw.updated_on = now;

    launch.state = LaunchState::Completed;
    launch.ended_on = Some(now);
    launch.action = Some(action.clone());
    commit.push_launch(launch, LaunchGuard::State(LaunchState::Running));

    match action {
      Action::Continue { .. } | Action::Modify { .. } => {
        for (child, guard) in self.updated_children(&graph, &fw, action, now).await? {
          affected.push(child.fw_id);
          commit.push_firework(child, guard);
        }
      }
      Action::Defuse { .. } => {
        if self.config().defuse_cascade {
          let descendants = graph.descendants(fw_id);
          for (child, guard) in defuse_pending(store.get_fireworks(&descendants).await?, now) {
            affected.push(child.fw_id);
            commit.push_firework(child, guard);
          }
        }
      }
      Action::Abort { .. } => {
        let others: Vec<FwId> = workflow
          .fw_ids
          .iter()
          .copied()
          .filter(|id| *id != fw_id)
          .collect();
        for (other, guard) in defuse_pending(store.get_fireworks(&others).await?, now) {
          affected.push(other.fw_id);
          commit.push_firework(other, guard);
        }
      }
      Action::Detour { .. } => {
        if let Some(detour) = detour {
          // Former children get new parents. Rewriting them makes a
          // concurrent readiness check conflict.
          let former = store.get_fireworks(graph.children(fw_id)).await?;
          for mut child in former.into_iter().filter(|c| c.state.is_pending()) {
            let guard = FireWorkGuard::Exact {
              state: child.state,
              revision: child.revision,
            };
            child.updated_on = now;
            commit.push_firework(child, guard);
          }

          let new_ids = detour.ids();
          let new_links = detour.links();
          workflow.splice_after(fw_id, &new_ids, &new_links)?;
          let sub = detour.def.graph();
          for def in &detour.def.fireworks {
            let placeholder = def.fw_id.unwrap_or_default();
            let id = detour.remap(placeholder);
            let mut spec = def.spec.clone();
            let state = if sub.parents(placeholder).is_empty() {
              merge_into(&mut spec, stored_data);
              FwState::Ready
            } else {
              FwState::Waiting
            };
            commit.push_firework(
              FireWork {
                fw_id: id,
                workflow_id: workflow.workflow_id,
                name: if def.name.is_empty() {
                  format!("Unnamed FW-{id}")
                } else {
                  def.name.clone()
                },
                tasks: def.tasks.clone(),
                spec,
                state,
                output: Spec::new(),
                launch_ids: Vec::new(),
                revision: 0,
                created_on: now,
                updated_on: now,
              },
              FireWorkGuard::Insert,
            );
            affected.push(id);
          }
          let wf_guard = WorkflowGuard::Revision(workflow.revision);
          workflow.updated_on = now;
          commit.push_workflow(workflow.clone(), wf_guard);
        }
      }
    }
    commit.push_firework(fw, fw_guard);

    // Readiness was judged against this revision of the links. A detour
    // committed since then may have re-parented a child.
    if store.get_workflow(workflow.workflow_id).await?.revision != revision_read {
      return Ok(None);
    }
    Ok(Some((commit, affected)))
  }

  /// Pending children of `fw` with the action's mods and stored data applied,
  /// promoted to READY when every other parent is already COMPLETED.
  async fn updated_children(
    &self,
    graph: &Graph,
    fw: &FireWork,
    action: &Action,
    now: DateTime<Utc>,
  ) -> Result<Vec<(FireWork, FireWorkGuard)>, EngineError> {
    let store = self.store();
    let children = store.get_fireworks(graph.children(fw.fw_id)).await?;
    let mut updated = Vec::with_capacity(children.len());

    for mut child in children {
      if !child.state.is_pending() {
        continue;
      }
      let guard = FireWorkGuard::Exact {
        state: child.state,
        revision: child.revision,
      };

      let mut spec = child.spec.clone();
      apply_mods(&mut spec, action.mods())?;
      merge_into(&mut spec, action.stored_data());
      child.spec = spec;

      let other_parents: Vec<FwId> = graph
        .parents(child.fw_id)
        .iter()
        .copied()
        .filter(|id| *id != fw.fw_id)
        .collect();
      let parents_done = store
        .get_fireworks(&other_parents)
        .await?
        .iter()
        .all(|p| p.state == FwState::Completed);
      if parents_done && child.state == FwState::Waiting {
        child.state = FwState::Ready;
      }
      child.updated_on = now;
      updated.push((child, guard));
    }
    Ok(updated)
  }

  /// Fizzle a launch that is not yet finished, and its FireWork if the launch
  /// still owns it. Returns false if the launch had already finished.
  pub(crate) async fn fizzle(
    &self,
    launch_id: LaunchId,
    error: &str,
  ) -> Result<bool, EngineError> {
    self.fizzle_when(launch_id, error, |_| true).await
  }

  /// [`LaunchPad::fizzle`], but only while `due` holds for the freshly read
  /// launch. The write is guarded on the heartbeat `due` looked at.
  pub(crate) async fn fizzle_when(
    &self,
    launch_id: LaunchId,
    error: &str,
    due: impl Fn(&Launch) -> bool,
  ) -> Result<bool, EngineError> {
    let store = self.store();
    for attempt in 0..MAX_COMMIT_ATTEMPTS {
      if attempt > 0 {
        backoff(attempt).await;
      }
      let mut launch = store.get_launch(launch_id).await?;
      if launch.state.is_terminal() || !due(&launch) {
        return Ok(false);
      }
      let mut fw = store.get_firework(launch.fw_id).await?;

      let now = Utc::now();
      let launch_guard = LaunchGuard::Heartbeat {
        state: launch.state,
        last_heartbeat: launch.last_heartbeat,
      };
      launch.state = LaunchState::Fizzled;
      launch.ended_on = Some(now);
      launch.error = Some(error.to_string());
      let fw_id = launch.fw_id;
      let mut commit = Commit::new().launch(launch, launch_guard);

      if fw.active_launch_id() == Some(launch_id) {
        let guard = FireWorkGuard::Exact {
          state: fw.state,
          revision: fw.revision,
        };
        fw.state = FwState::Fizzled;
        fw.updated_on = now;
        commit.push_firework(fw, guard);
      }

      if store.commit(commit).await?.is_applied() {
        warn!(fw_id, launch_id, error, "launch_fizzled");
        return Ok(true);
      }
    }
    Err(EngineError::Contention {
      operation: "fizzle",
      attempts: MAX_COMMIT_ATTEMPTS,
    })
  }
}

/// DEFUSED copies of the pending FireWorks in `fireworks`.
fn defuse_pending(
  fireworks: Vec<FireWork>,
  now: DateTime<Utc>,
) -> Vec<(FireWork, FireWorkGuard)> {
  fireworks
    .into_iter()
    .filter(|fw| fw.state.is_pending())
    .map(|mut fw| {
      let guard = FireWorkGuard::Exact {
        state: fw.state,
        revision: fw.revision,
      };
      fw.state = FwState::Defused;
      fw.updated_on = now;
      (fw, guard)
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  use fireworks_config::FwConfig;
  use fireworks_store::MemoryStore;
  use fireworks_workflow::{FWorker, FireWorkDef, SpecMod};
  use serde_json::json;

  use crate::ClaimOptions;

  async fn chain(lp: &LaunchPad) -> (FwId, FwId) {
    let def = WorkflowDef {
      name: "chain".to_string(),
      fireworks: vec![
        FireWorkDef {
          fw_id: Some(1),
          ..FireWorkDef::new("parent", vec![], Spec::new())
        },
        FireWorkDef {
          fw_id: Some(2),
          ..FireWorkDef::new(
            "child",
            vec![],
            json!({"input_array": [1, 2], "z": true}).as_object().cloned().unwrap(),
          )
        },
      ],
      links: BTreeMap::from([(1, vec![2])]),
    };
    let added = lp.add_wf(def).await.unwrap();
    (added.id_map[&1], added.id_map[&2])
  }

  /// Claim and mark RUNNING the way a rocket would.
  async fn start(lp: &LaunchPad, fw_id: FwId) -> (FireWork, Launch) {
    let claim = lp
      .claim_next(
        &FWorker::default(),
        ClaimOptions {
          fw_id: Some(fw_id),
          ..Default::default()
        },
      )
      .await
      .unwrap()
      .unwrap();
    let (mut fw, mut launch) = (claim.firework, claim.launch);
    let guard = FireWorkGuard::Exact {
      state: FwState::Reserved,
      revision: fw.revision,
    };
    fw.state = FwState::Running;
    launch.state = LaunchState::Running;
    let commit = Commit::new()
      .firework(fw.clone(), guard)
      .launch(launch.clone(), LaunchGuard::State(LaunchState::Reserved));
    assert!(lp.store().commit(commit).await.unwrap().is_applied());
    (fw, launch)
  }

  #[tokio::test]
  async fn test_modify_appends_and_merges() {
    let lp = LaunchPad::new(Arc::new(MemoryStore::new()), Arc::new(FwConfig::default()));
    let (parent, child) = chain(&lp).await;
    let (fw, launch) = start(&lp, parent).await;

    let action = Action::Modify {
      stored_data: json!({"sum": 3}).as_object().cloned().unwrap(),
      mods: vec![SpecMod::Append {
        path: "input_array".to_string(),
        value: json!(3),
      }],
    };
    let affected = lp.apply_action(&fw, &launch, action).await.unwrap();
    assert_eq!(affected, vec![child]);

    let child = lp.get_fw_by_id(child).await.unwrap();
    assert_eq!(child.state, FwState::Ready);
    assert_eq!(child.spec["input_array"], json!([1, 2, 3]));
    assert_eq!(child.spec["z"], json!(true));
    assert_eq!(child.spec["sum"], json!(3));

    let parent = lp.get_fw_by_id(parent).await.unwrap();
    assert_eq!(parent.state, FwState::Completed);
    assert_eq!(parent.output["sum"], json!(3));
    let launch = lp.get_launch(launch.launch_id).await.unwrap();
    assert_eq!(launch.state, LaunchState::Completed);
    assert_eq!(launch.action.map(|a| a.name()), Some("MODIFY"));
  }

  #[tokio::test]
  async fn test_bad_mod_fails_without_writing() {
    let lp = LaunchPad::new(Arc::new(MemoryStore::new()), Arc::new(FwConfig::default()));
    let (parent, child) = chain(&lp).await;
    let (fw, launch) = start(&lp, parent).await;

    let action = Action::Modify {
      stored_data: Spec::new(),
      mods: vec![SpecMod::Append {
        path: "z".to_string(),
        value: json!(1),
      }],
    };
    let err = lp.apply_action(&fw, &launch, action).await.unwrap_err();
    assert!(matches!(err, EngineError::Workflow(_)));
    assert_eq!(lp.get_fw_by_id(parent).await.unwrap().state, FwState::Running);
    assert_eq!(lp.get_fw_by_id(child).await.unwrap().state, FwState::Waiting);
  }

  #[tokio::test]
  async fn test_finished_launch_is_lost() {
    let lp = LaunchPad::new(Arc::new(MemoryStore::new()), Arc::new(FwConfig::default()));
    let (parent, _) = chain(&lp).await;
    let (fw, launch) = start(&lp, parent).await;

    assert!(lp.fizzle(launch.launch_id, "expired").await.unwrap());
    assert!(!lp.fizzle(launch.launch_id, "expired").await.unwrap());

    let err = lp
      .apply_action(&fw, &launch, Action::default())
      .await
      .unwrap_err();
    assert!(matches!(err, EngineError::LaunchLost { .. }));
    assert_eq!(lp.get_fw_by_id(parent).await.unwrap().state, FwState::Fizzled);
  }
}
