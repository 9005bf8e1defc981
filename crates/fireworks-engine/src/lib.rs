//! FireWorks Engine
//!
//! Everything that changes state in the store goes through [`LaunchPad`]:
//!
//! - ingestion (`add_wf`) and operator overrides (defuse, archive, reset)
//! - the claim protocol (`claim_next`, `cancel_reservation`)
//! - the action interpreter (`apply_action`)
//! - the failure detector (`detect_fizzled`, `detect_unreserved`)
//!
//! A [`Rocket`] runs one claimed FireWork with a [`Heartbeat`] beside it, and
//! [`rapidfire`] runs rockets back to back in launcher directories.

mod claim;
mod detector;
mod error;
mod heartbeat;
mod interpreter;
mod launcher;
mod launchpad;
mod rocket;

pub use claim::{Claim, ClaimOptions};
pub use detector::{ReservationCanceller, StaleLaunch, SweepReport};
pub use error::EngineError;
pub use heartbeat::Heartbeat;
pub use launcher::{NLaunches, RapidfireOptions, RapidfireReport, create_unique_dir, rapidfire};
pub use launchpad::{AddedWorkflow, LaunchPad};
pub use rocket::{Rocket, RocketOutcome};

use std::time::Duration;

use rand::Rng;

/// Upper bound on re-read-and-retry rounds after a commit conflict.
pub(crate) const MAX_COMMIT_ATTEMPTS: u32 = 8;

const BACKOFF_BASE_MS: u64 = 5;

/// Sleep a random slice of a window that doubles with every failed attempt.
pub(crate) async fn backoff(attempt: u32) {
  let window = BACKOFF_BASE_MS << attempt.min(8);
  let delay = rand::thread_rng().gen_range(0..=window);
  tokio::time::sleep(Duration::from_millis(delay)).await;
}

/// Best-effort name of this host for launch records.
pub(crate) fn hostname() -> String {
  std::env::var("HOSTNAME")
    .ok()
    .filter(|h| !h.is_empty())
    .or_else(|| {
      std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
    })
    .unwrap_or_else(|| "localhost".to_string())
}
