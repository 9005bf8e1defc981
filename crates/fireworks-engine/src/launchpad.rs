use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fireworks_config::FwConfig;
use fireworks_store::{
  Commit, CommitOutcome, FireWorkGuard, FireWorkQuery, IdKind, LaunchGuard, Store, WorkflowGuard,
};
use fireworks_workflow::{
  FWorker, FireWork, FwId, FwState, Launch, LaunchId, LaunchState, Spec, Workflow, WorkflowDef,
  WorkflowId,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::MAX_COMMIT_ATTEMPTS;
use crate::error::EngineError;

/// Result of inserting a workflow document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AddedWorkflow {
  pub workflow_id: WorkflowId,
  /// Placeholder id from the document -> stored id.
  pub id_map: BTreeMap<FwId, FwId>,
}

/// Entry point for every state change in the store.
#[derive(Clone)]
pub struct LaunchPad {
  store: Arc<dyn Store>,
  config: Arc<FwConfig>,
}

impl std::fmt::Debug for LaunchPad {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LaunchPad")
      .field("config", &self.config)
      .finish_non_exhaustive()
  }
}

impl LaunchPad {
  pub fn new(store: Arc<dyn Store>, config: Arc<FwConfig>) -> Self {
    Self { store, config }
  }

  pub fn store(&self) -> &Arc<dyn Store> {
    &self.store
  }

  pub fn config(&self) -> &Arc<FwConfig> {
    &self.config
  }

  /// Insert a workflow document with fresh ids.
  ///
  /// FireWorks without parents start READY, the rest WAITING. The workflow
  /// and all its FireWorks land in one commit.
  pub async fn add_wf(&self, def: WorkflowDef) -> Result<AddedWorkflow, EngineError> {
    let def = def.normalized()?;
    let graph = def.graph();

    let fw_ids = self
      .store
      .allocate_ids(IdKind::FireWork, def.fireworks.len())
      .await?;
    let workflow_id = self
      .store
      .allocate_ids(IdKind::Workflow, 1)
      .await?
      .start;

    let id_map: BTreeMap<FwId, FwId> = def.fw_ids().into_iter().zip(fw_ids).collect();
    let remap = |id: &FwId| id_map.get(id).copied().unwrap_or(*id);

    let now = Utc::now();
    let mut commit = Commit::new();
    for fw_def in &def.fireworks {
      let placeholder = fw_def.fw_id.unwrap_or_default();
      let state = if graph.parents(placeholder).is_empty() {
        FwState::Ready
      } else {
        FwState::Waiting
      };
      commit.push_firework(
        FireWork {
          fw_id: remap(&placeholder),
          workflow_id,
          name: if fw_def.name.is_empty() {
            format!("Unnamed FW-{}", remap(&placeholder))
          } else {
            fw_def.name.clone()
          },
          tasks: fw_def.tasks.clone(),
          spec: fw_def.spec.clone(),
          state,
          output: Spec::new(),
          launch_ids: Vec::new(),
          revision: 0,
          created_on: now,
          updated_on: now,
        },
        FireWorkGuard::Insert,
      );
    }

    let workflow = Workflow {
      workflow_id,
      name: if def.name.is_empty() {
        format!("Unnamed WF-{workflow_id}")
      } else {
        def.name.clone()
      },
      fw_ids: def.fw_ids().iter().map(remap).collect(),
      links: def
        .links
        .iter()
        .map(|(from, children)| (remap(from), children.iter().map(remap).collect()))
        .collect(),
      revision: 0,
      created_on: now,
      updated_on: now,
    };
    commit.push_workflow(workflow, WorkflowGuard::Insert);

    match self.store.commit(commit).await? {
      CommitOutcome::Applied => {}
      CommitOutcome::Conflict(conflict) => {
        warn!(?conflict, "workflow_insert_conflict");
        return Err(EngineError::Contention {
          operation: "add_wf",
          attempts: 1,
        });
      }
    }

    info!(
      workflow_id,
      fireworks = id_map.len(),
      "workflow_added"
    );
    Ok(AddedWorkflow {
      workflow_id,
      id_map,
    })
  }

  pub async fn get_fw_by_id(&self, fw_id: FwId) -> Result<FireWork, EngineError> {
    Ok(self.store.get_firework(fw_id).await?)
  }

  pub async fn get_wf_by_fw_id(&self, fw_id: FwId) -> Result<Workflow, EngineError> {
    let fw = self.store.get_firework(fw_id).await?;
    Ok(self.store.get_workflow(fw.workflow_id).await?)
  }

  pub async fn get_launch(&self, launch_id: LaunchId) -> Result<Launch, EngineError> {
    Ok(self.store.get_launch(launch_id).await?)
  }

  pub async fn get_fw_ids(&self, query: &FireWorkQuery) -> Result<Vec<FwId>, EngineError> {
    Ok(
      self
        .store
        .query_fireworks(query)
        .await?
        .into_iter()
        .map(|fw| fw.fw_id)
        .collect(),
    )
  }

  /// Whether any READY FireWork is eligible for `fworker`.
  pub async fn run_exists(&self, fworker: &FWorker) -> Result<bool, EngineError> {
    let ready = self
      .store
      .query_fireworks(&FireWorkQuery::new().state(FwState::Ready))
      .await?;
    Ok(ready.iter().any(|fw| fworker.accepts(fw)))
  }

  /// Wipe the store. `password` must be today's date as `YYYY-MM-DD`.
  pub async fn reset(&self, password: &str, now: DateTime<Utc>) -> Result<(), EngineError> {
    let expected = now.format("%Y-%m-%d").to_string();
    if password != expected {
      return Err(EngineError::ResetRefused { expected });
    }
    self.store.reset().await?;
    warn!("launchpad_reset");
    Ok(())
  }

  /// Operator override: DEFUSE a non-terminal FireWork.
  pub async fn defuse_fw(&self, fw_id: FwId) -> Result<FireWork, EngineError> {
    self.override_state(fw_id, FwState::Defused, "defuse").await
  }

  /// Operator override: ARCHIVE a non-terminal FireWork.
  pub async fn archive_fw(&self, fw_id: FwId) -> Result<FireWork, EngineError> {
    self.override_state(fw_id, FwState::Archived, "archive").await
  }

  /// Move a FireWork to `target`, fizzling its active launch if it has one.
  /// DEFUSE cascades to pending descendants when the policy is on.
  async fn override_state(
    &self,
    fw_id: FwId,
    target: FwState,
    operation: &'static str,
  ) -> Result<FireWork, EngineError> {
    for _ in 0..MAX_COMMIT_ATTEMPTS {
      let mut fw = self.store.get_firework(fw_id).await?;
      if fw.state.is_terminal() {
        return Err(EngineError::InvalidState {
          fw_id,
          state: fw.state,
          operation,
        });
      }

      let now = Utc::now();
      let mut commit = Commit::new();

      if let Some(launch_id) = fw.active_launch_id() {
        let mut launch = self.store.get_launch(launch_id).await?;
        if !launch.state.is_terminal() {
          let guard = LaunchGuard::State(launch.state);
          launch.state = LaunchState::Fizzled;
          launch.ended_on = Some(now);
          launch.error = Some(format!("firework {fw_id} was {}d by an operator", operation));
          commit.push_launch(launch, guard);
        }
      }

      if target == FwState::Defused && self.config.defuse_cascade {
        let workflow = self.store.get_workflow(fw.workflow_id).await?;
        let descendants = workflow.graph().descendants(fw_id);
        for mut child in self.store.get_fireworks(&descendants).await? {
          if child.state.is_pending() {
            let guard = FireWorkGuard::Exact {
              state: child.state,
              revision: child.revision,
            };
            child.state = FwState::Defused;
            child.updated_on = now;
            commit.push_firework(child, guard);
          }
        }
      }

      let guard = FireWorkGuard::Exact {
        state: fw.state,
        revision: fw.revision,
      };
      fw.state = target;
      fw.updated_on = now;
      commit.push_firework(fw.clone(), guard);

      if self.store.commit(commit).await?.is_applied() {
        info!(fw_id, state = %target, "firework_overridden");
        return self.get_fw_by_id(fw_id).await;
      }
    }
    Err(EngineError::Contention {
      operation,
      attempts: MAX_COMMIT_ATTEMPTS,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use fireworks_store::MemoryStore;
  use fireworks_workflow::{FireWorkDef, TaskSpec};
  use serde_json::json;

  fn launchpad() -> LaunchPad {
    LaunchPad::new(Arc::new(MemoryStore::new()), Arc::new(FwConfig::default()))
  }

  fn fw_def(id: FwId, name: &str) -> FireWorkDef {
    FireWorkDef {
      fw_id: Some(id),
      ..FireWorkDef::new(
        name,
        vec![TaskSpec::new("Script Task", Spec::new())],
        json!({"n": id}).as_object().cloned().unwrap(),
      )
    }
  }

  #[tokio::test]
  async fn test_add_wf_remaps_ids_and_sets_roots_ready() {
    let lp = launchpad();
    let def = WorkflowDef {
      name: "chain".to_string(),
      fireworks: vec![fw_def(-1, "a"), fw_def(-2, "b")],
      links: BTreeMap::from([(-1, vec![-2])]),
    };

    let added = lp.add_wf(def).await.unwrap();
    let a = added.id_map[&-1];
    let b = added.id_map[&-2];

    let wf = lp.store().get_workflow(added.workflow_id).await.unwrap();
    assert_eq!(wf.links.get(&a), Some(&vec![b]));
    assert_eq!(lp.get_fw_by_id(a).await.unwrap().state, FwState::Ready);
    assert_eq!(lp.get_fw_by_id(b).await.unwrap().state, FwState::Waiting);
    assert_eq!(lp.get_fw_by_id(b).await.unwrap().spec["n"], json!(-2));

    let again = lp.add_wf(fw_def(-1, "solo").into_workflow()).await.unwrap();
    assert_ne!(again.id_map[&-1], a);
  }

  #[tokio::test]
  async fn test_reset_requires_todays_date() {
    let lp = launchpad();
    lp.add_wf(fw_def(1, "x").into_workflow()).await.unwrap();

    let now = Utc::now();
    let err = lp.reset("1999-01-01", now).await.unwrap_err();
    assert!(matches!(err, EngineError::ResetRefused { .. }));

    lp.reset(&now.format("%Y-%m-%d").to_string(), now)
      .await
      .unwrap();
    assert!(lp.get_fw_ids(&FireWorkQuery::new()).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_defuse_and_archive_overrides() {
    let lp = launchpad();
    let added = lp
      .add_wf(WorkflowDef {
        name: String::new(),
        fireworks: vec![fw_def(1, "a"), fw_def(2, "b")],
        links: BTreeMap::from([(1, vec![2])]),
      })
      .await
      .unwrap();
    let a = added.id_map[&1];
    let b = added.id_map[&2];

    let defused = lp.defuse_fw(a).await.unwrap();
    assert_eq!(defused.state, FwState::Defused);
    // Cascade is off by default: the child stays blocked.
    assert_eq!(lp.get_fw_by_id(b).await.unwrap().state, FwState::Waiting);

    let err = lp.archive_fw(a).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));

    assert_eq!(lp.archive_fw(b).await.unwrap().state, FwState::Archived);
  }
}
