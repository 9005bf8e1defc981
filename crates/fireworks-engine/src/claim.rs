//! Claim protocol: atomic check-out of READY FireWorks.
//!
//! A claim is one commit that moves the FireWork READY -> RESERVED (guarded
//! on state and revision) and inserts the new launch. Losing the race is a
//! conflict, never an error; the claimer moves on to the next candidate.

use std::cmp::Ordering;

use chrono::Utc;
use fireworks_store::{Commit, CommitOutcome, FireWorkGuard, FireWorkQuery, IdKind, LaunchGuard};
use fireworks_workflow::{FWorker, FireWork, FwId, FwState, Launch, LaunchId, LaunchState};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::launchpad::LaunchPad;
use crate::{MAX_COMMIT_ATTEMPTS, hostname};

#[derive(Debug, Clone, Default)]
pub struct ClaimOptions {
  pub launch_dir: Option<String>,
  /// Queue job id, when the reservation is made on behalf of a queued job.
  pub reservation_id: Option<String>,
  /// Claim this FireWork only.
  pub fw_id: Option<FwId>,
}

/// A reserved FireWork and the launch that owns it.
#[derive(Debug, Clone)]
pub struct Claim {
  pub firework: FireWork,
  pub launch: Launch,
}

/// Higher `_priority` first, then lower id.
fn claim_order(a: &FireWork, b: &FireWork) -> Ordering {
  b.priority()
    .partial_cmp(&a.priority())
    .unwrap_or(Ordering::Equal)
    .then(a.fw_id.cmp(&b.fw_id))
}

impl LaunchPad {
  /// Reserve the next READY FireWork `fworker` may run.
  ///
  /// Returns `None` when nothing is eligible.
  pub async fn claim_next(
    &self,
    fworker: &FWorker,
    options: ClaimOptions,
  ) -> Result<Option<Claim>, EngineError> {
    let store = self.store();
    let mut launch_id: Option<LaunchId> = None;

    for round in 0..MAX_COMMIT_ATTEMPTS {
      let mut query = FireWorkQuery::new().state(FwState::Ready);
      if let Some(fw_id) = options.fw_id {
        query = query.ids(vec![fw_id]);
      }
      let mut candidates: Vec<FireWork> = store
        .query_fireworks(&query)
        .await?
        .into_iter()
        .filter(|fw| fworker.accepts(fw))
        .collect();
      if candidates.is_empty() {
        return Ok(None);
      }
      candidates.sort_by(claim_order);

      // A failed insert leaves the id unused, so one id serves every attempt.
      let id = match launch_id {
        Some(id) => id,
        None => {
          let id = store.allocate_ids(IdKind::Launch, 1).await?.start;
          launch_id = Some(id);
          id
        }
      };

      for mut fw in candidates {
        let now = Utc::now();
        let launch = Launch {
          launch_id: id,
          fw_id: fw.fw_id,
          fworker: fworker.clone(),
          host: hostname(),
          launch_dir: options.launch_dir.clone(),
          state: LaunchState::Reserved,
          reservation_id: options.reservation_id.clone(),
          created_on: now,
          last_heartbeat: now,
          started_on: None,
          ended_on: None,
          action: None,
          error: None,
        };

        let guard = FireWorkGuard::Exact {
          state: FwState::Ready,
          revision: fw.revision,
        };
        fw.state = FwState::Reserved;
        fw.launch_ids.push(id);
        fw.updated_on = now;

        let commit = Commit::new()
          .firework(fw.clone(), guard)
          .launch(launch.clone(), LaunchGuard::Insert);
        match store.commit(commit).await? {
          CommitOutcome::Applied => {
            fw.revision += 1;
            info!(
              fw_id = fw.fw_id,
              launch_id = id,
              fworker = %fworker.name,
              "launch_reserved"
            );
            return Ok(Some(Claim {
              firework: fw,
              launch,
            }));
          }
          CommitOutcome::Conflict(conflict) => {
            debug!(fw_id = fw.fw_id, ?conflict, round, "claim_race_lost");
          }
        }
      }
    }

    warn!(attempts = MAX_COMMIT_ATTEMPTS, "claim_gave_up");
    Ok(None)
  }

  /// Reserve one specific FireWork, if it is READY and eligible.
  pub async fn claim_fw(
    &self,
    fw_id: FwId,
    fworker: &FWorker,
    launch_dir: Option<String>,
  ) -> Result<Option<Claim>, EngineError> {
    self
      .claim_next(
        fworker,
        ClaimOptions {
          launch_dir,
          reservation_id: None,
          fw_id: Some(fw_id),
        },
      )
      .await
  }

  /// Record the queue job id on a launch. The job may already have started
  /// it, so RUNNING launches accept the id too. Returns false once the
  /// launch has finished.
  pub async fn set_reservation_id(
    &self,
    launch_id: LaunchId,
    reservation_id: &str,
  ) -> Result<bool, EngineError> {
    let recorded = self
      .store()
      .set_reservation_id(launch_id, reservation_id)
      .await?;
    if recorded {
      debug!(launch_id, reservation_id, "reservation_recorded");
    } else {
      warn!(launch_id, reservation_id, "reservation_already_finished");
    }
    Ok(recorded)
  }

  /// Abandon a RESERVED launch: the launch FIZZLES with `reason` and its
  /// FireWork returns to READY. Returns false if the launch was no longer
  /// RESERVED.
  pub async fn cancel_reservation(
    &self,
    launch_id: LaunchId,
    reason: &str,
  ) -> Result<bool, EngineError> {
    let store = self.store();
    for _ in 0..MAX_COMMIT_ATTEMPTS {
      let mut launch = store.get_launch(launch_id).await?;
      if launch.state != LaunchState::Reserved {
        return Ok(false);
      }
      let mut fw = store.get_firework(launch.fw_id).await?;

      let now = Utc::now();
      launch.state = LaunchState::Fizzled;
      launch.ended_on = Some(now);
      launch.error = Some(reason.to_string());
      let mut commit = Commit::new().launch(launch, LaunchGuard::State(LaunchState::Reserved));

      if fw.state == FwState::Reserved && fw.active_launch_id() == Some(launch_id) {
        let guard = FireWorkGuard::Exact {
          state: FwState::Reserved,
          revision: fw.revision,
        };
        fw.state = FwState::Ready;
        fw.updated_on = now;
        commit.push_firework(fw, guard);
      }

      if store.commit(commit).await?.is_applied() {
        info!(launch_id, reason, "reservation_cancelled");
        return Ok(true);
      }
    }
    Err(EngineError::Contention {
      operation: "cancel_reservation",
      attempts: MAX_COMMIT_ATTEMPTS,
    })
  }
}
