use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use fireworks_store::{Commit, CommitOutcome, FireWorkGuard, LaunchGuard};
use fireworks_task::{TaskContext, TaskRegistry};
use fireworks_workflow::{
  Action, FWorker, FireWork, FwId, FwState, Launch, LaunchId, LaunchState, Spec, merge_into,
};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::claim::ClaimOptions;
use crate::error::EngineError;
use crate::heartbeat::Heartbeat;
use crate::hostname;
use crate::launchpad::LaunchPad;

/// How a single rocket run ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RocketOutcome {
  /// Nothing was eligible to run.
  NoWork,
  Completed {
    fw_id: FwId,
    launch_id: LaunchId,
    action: &'static str,
  },
  Fizzled {
    fw_id: FwId,
    launch_id: LaunchId,
    error: String,
  },
  /// The launch stopped owning its FireWork before it could finish
  /// (expired, defused, or cancelled by someone else).
  Lost { fw_id: FwId, launch_id: LaunchId },
}

/// Runs one claimed FireWork: RESERVED -> RUNNING, tasks in order with a
/// heartbeat beside them, then the final action through the interpreter.
#[derive(Debug, Clone)]
pub struct Rocket {
  launchpad: LaunchPad,
  registry: Arc<TaskRegistry>,
}

impl Rocket {
  pub fn new(launchpad: LaunchPad, registry: Arc<TaskRegistry>) -> Self {
    Self {
      launchpad,
      registry,
    }
  }

  pub fn launchpad(&self) -> &LaunchPad {
    &self.launchpad
  }

  /// Claim a FireWork (the given one, or the next eligible) and run it.
  pub async fn launch(
    &self,
    fworker: &FWorker,
    launch_dir: Option<&Path>,
    fw_id: Option<FwId>,
  ) -> Result<RocketOutcome, EngineError> {
    let options = ClaimOptions {
      launch_dir: launch_dir.map(|d| d.display().to_string()),
      reservation_id: None,
      fw_id,
    };
    match self.launchpad.claim_next(fworker, options).await? {
      Some(claim) => self.run(claim.firework, claim.launch).await,
      None => Ok(RocketOutcome::NoWork),
    }
  }

  /// Run a launch reserved earlier, typically by the queue launcher.
  pub async fn run_launch(&self, launch_id: LaunchId) -> Result<RocketOutcome, EngineError> {
    let launch = self.launchpad.get_launch(launch_id).await?;
    if launch.state != LaunchState::Reserved {
      warn!(launch_id, state = %launch.state, "launch_not_reserved");
      return Ok(RocketOutcome::Lost {
        fw_id: launch.fw_id,
        launch_id,
      });
    }
    let fw = self.launchpad.get_fw_by_id(launch.fw_id).await?;
    self.run(fw, launch).await
  }

  #[instrument(
    name = "rocket",
    skip(self, fw, launch),
    fields(fw_id = fw.fw_id, launch_id = launch.launch_id)
  )]
  pub async fn run(&self, fw: FireWork, launch: Launch) -> Result<RocketOutcome, EngineError> {
    let fw_id = fw.fw_id;
    let launch_id = launch.launch_id;
    let lost = RocketOutcome::Lost { fw_id, launch_id };

    if let Some(dir) = &launch.launch_dir {
      tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| EngineError::Io {
          path: PathBuf::from(dir),
          source,
        })?;
    }

    let Some((fw, launch)) = self.start(fw_id, launch_id).await? else {
      warn!("rocket_start_lost");
      return Ok(lost);
    };
    info!(fw_name = %fw.name, tasks = fw.tasks.len(), "rocket_started");

    let heartbeat = Heartbeat::start(
      self.launchpad.store().clone(),
      launch_id,
      self.launchpad.config().ping_interval(),
    );
    let ctx = TaskContext {
      fw_id,
      launch_id,
      launch_dir: launch.launch_dir.as_ref().map(PathBuf::from),
    };
    let result = self.run_tasks(&fw, &ctx).await;
    heartbeat.stop().await;

    let failure = match result {
      Ok(action) => {
        let name = action.name();
        match self.launchpad.apply_action(&fw, &launch, action).await {
          Ok(_) => {
            info!(action = name, "rocket_completed");
            return Ok(RocketOutcome::Completed {
              fw_id,
              launch_id,
              action: name,
            });
          }
          Err(EngineError::LaunchLost { .. }) => {
            warn!("rocket_finish_lost");
            return Ok(lost);
          }
          // The heartbeat has stopped, so the launch must not stay RUNNING.
          Err(e) => format!("could not apply {name} action: {e}"),
        }
      }
      Err(message) => message,
    };

    error!(error = %failure, "rocket_fizzled");
    if self.launchpad.fizzle(launch_id, &failure).await? {
      Ok(RocketOutcome::Fizzled {
        fw_id,
        launch_id,
        error: failure,
      })
    } else {
      Ok(lost)
    }
  }

  /// RESERVED -> RUNNING for both records. `None` if the reservation was
  /// taken away in the meantime.
  async fn start(
    &self,
    fw_id: FwId,
    launch_id: LaunchId,
  ) -> Result<Option<(FireWork, Launch)>, EngineError> {
    let store = self.launchpad.store();
    let mut fw = store.get_firework(fw_id).await?;
    let mut launch = store.get_launch(launch_id).await?;
    if fw.state != FwState::Reserved
      || launch.state != LaunchState::Reserved
      || fw.active_launch_id() != Some(launch_id)
    {
      return Ok(None);
    }

    let now = Utc::now();
    let guard = FireWorkGuard::Exact {
      state: FwState::Reserved,
      revision: fw.revision,
    };
    fw.state = FwState::Running;
    fw.updated_on = now;
    launch.state = LaunchState::Running;
    launch.host = hostname();
    launch.started_on = Some(now);
    launch.last_heartbeat = now;

    let commit = Commit::new()
      .firework(fw.clone(), guard)
      .launch(launch.clone(), LaunchGuard::State(LaunchState::Reserved));
    match store.commit(commit).await? {
      CommitOutcome::Applied => {
        fw.revision += 1;
        Ok(Some((fw, launch)))
      }
      CommitOutcome::Conflict(_) => Ok(None),
    }
  }

  /// Run the task list in order; the first non-CONTINUE action ends it.
  /// `Err` carries the message the launch fizzles with.
  async fn run_tasks(&self, fw: &FireWork, ctx: &TaskContext) -> Result<Action, String> {
    let mut carried = Spec::new();
    let mut action = Action::default();

    for (index, task_spec) in fw.tasks.iter().enumerate() {
      let name = task_spec.name.clone();
      let task = self
        .registry
        .resolve(task_spec)
        .map_err(|e| format!("task {index} ({name}): {e}"))?;

      let spec = fw.spec.clone();
      let task_ctx = ctx.clone();
      let handle = tokio::spawn(async move { task.run_task(&spec, &task_ctx).await });
      let mut next = match handle.await {
        Ok(Ok(action)) => action,
        Ok(Err(e)) => return Err(format!("task {index} ({name}) failed: {e}")),
        Err(e) => return Err(format!("task {index} ({name}) aborted: {e}")),
      };

      let data = std::mem::take(next.stored_data_mut());
      merge_into(&mut carried, &data);
      *next.stored_data_mut() = carried.clone();

      let stop = !matches!(next, Action::Continue { .. });
      action = next;
      if stop {
        break;
      }
    }
    Ok(action)
  }
}
