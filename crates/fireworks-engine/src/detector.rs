//! Failure detection sweeps.
//!
//! Both sweeps query the store, report what they find, and in fix mode
//! repair each record with a guarded write. Re-running a sweep right after a
//! fix finds nothing.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fireworks_store::LaunchQuery;
use fireworks_workflow::{FwId, Launch, LaunchId, LaunchState};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::launchpad::LaunchPad;

/// A launch that missed its deadline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StaleLaunch {
  pub launch_id: LaunchId,
  pub fw_id: FwId,
  /// Last heartbeat for runs, creation time for reservations.
  pub since: DateTime<Utc>,
  pub reservation_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
  pub stale: Vec<StaleLaunch>,
  /// Launches repaired by this sweep (fix mode only).
  pub fixed: Vec<LaunchId>,
}

/// Cancels the external queue job behind a reservation.
#[async_trait]
pub trait ReservationCanceller: Send + Sync {
  async fn cancel(&self, reservation_id: &str) -> Result<(), String>;
}

fn expiration(duration: Duration) -> chrono::Duration {
  chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

impl LaunchPad {
  /// RUNNING launches whose heartbeat is older than `RUN_EXPIRATION_SECS`.
  pub async fn detect_fizzled(&self, fix: bool) -> Result<SweepReport, EngineError> {
    self
      .detect_fizzled_at(Utc::now(), self.config().run_expiration(), fix)
      .await
  }

  pub async fn detect_fizzled_at(
    &self,
    now: DateTime<Utc>,
    expiration_after: Duration,
    fix: bool,
  ) -> Result<SweepReport, EngineError> {
    let limit = expiration(expiration_after);
    let running = self
      .store()
      .query_launches(&LaunchQuery::new().state(LaunchState::Running))
      .await?;

    let mut report = SweepReport::default();
    for launch in running.into_iter().filter(|l| l.is_stale_run(now, limit)) {
      warn!(
        launch_id = launch.launch_id,
        fw_id = launch.fw_id,
        last_heartbeat = %launch.last_heartbeat,
        "stale_run_detected"
      );
      if fix {
        let reason = format!(
          "no heartbeat since {}; presumed dead",
          launch.last_heartbeat.to_rfc3339()
        );
        let still_stale = |l: &Launch| l.is_stale_run(now, limit);
        if self
          .fizzle_when(launch.launch_id, &reason, still_stale)
          .await?
        {
          report.fixed.push(launch.launch_id);
        }
      }
      report.stale.push(StaleLaunch {
        launch_id: launch.launch_id,
        fw_id: launch.fw_id,
        since: launch.last_heartbeat,
        reservation_id: launch.reservation_id,
      });
    }

    info!(
      stale = report.stale.len(),
      fixed = report.fixed.len(),
      "fizzled_sweep_done"
    );
    Ok(report)
  }

  /// RESERVED launches older than `RESERVATION_EXPIRATION_SECS`.
  pub async fn detect_unreserved(
    &self,
    fix: bool,
    canceller: Option<&dyn ReservationCanceller>,
  ) -> Result<SweepReport, EngineError> {
    self
      .detect_unreserved_at(
        Utc::now(),
        self.config().reservation_expiration(),
        fix,
        canceller,
      )
      .await
  }

  pub async fn detect_unreserved_at(
    &self,
    now: DateTime<Utc>,
    expiration_after: Duration,
    fix: bool,
    canceller: Option<&dyn ReservationCanceller>,
  ) -> Result<SweepReport, EngineError> {
    let limit = expiration(expiration_after);
    let reserved = self
      .store()
      .query_launches(&LaunchQuery::new().state(LaunchState::Reserved))
      .await?;

    let mut report = SweepReport::default();
    for launch in reserved
      .into_iter()
      .filter(|l| l.is_stale_reservation(now, limit))
    {
      warn!(
        launch_id = launch.launch_id,
        fw_id = launch.fw_id,
        reservation_id = launch.reservation_id.as_deref().unwrap_or(""),
        "stale_reservation_detected"
      );
      if fix
        && self
          .cancel_reservation(launch.launch_id, "reservation expired")
          .await?
      {
        report.fixed.push(launch.launch_id);
        // Only a cancelled launch has a job that can no longer start it.
        let cancelled = self.get_launch(launch.launch_id).await?;
        if let (Some(rid), Some(canceller)) = (&cancelled.reservation_id, canceller)
          && let Err(e) = canceller.cancel(rid).await
        {
          warn!(launch_id = launch.launch_id, reservation_id = %rid, error = %e, "queue_cancel_failed");
        }
      }
      report.stale.push(StaleLaunch {
        launch_id: launch.launch_id,
        fw_id: launch.fw_id,
        since: launch.created_on,
        reservation_id: launch.reservation_id,
      });
    }

    info!(
      stale = report.stale.len(),
      fixed = report.fixed.len(),
      "unreserved_sweep_done"
    );
    Ok(report)
  }
}
