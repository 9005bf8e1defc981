use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fireworks_workflow::FWorker;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::error::EngineError;
use crate::rocket::{Rocket, RocketOutcome};

/// How many rockets a rapidfire loop may launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NLaunches {
  /// Stop as soon as nothing is READY.
  UntilEmpty,
  /// Stop after this many launches, waiting for work in between.
  Limit(u32),
  /// Never stop on its own.
  Infinite,
}

impl FromStr for NLaunches {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if s.eq_ignore_ascii_case("infinite") {
      return Ok(NLaunches::Infinite);
    }
    match s.parse::<u32>() {
      Ok(0) => Ok(NLaunches::UntilEmpty),
      Ok(n) => Ok(NLaunches::Limit(n)),
      Err(_) => Err(format!(
        "expected a number of launches or \"infinite\", got {s:?}"
      )),
    }
  }
}

impl NLaunches {
  /// True once `launched` reaches the limit.
  pub fn reached(self, launched: u32) -> bool {
    matches!(self, NLaunches::Limit(n) if launched >= n)
  }
}

#[derive(Debug, Clone)]
pub struct RapidfireOptions {
  pub nlaunches: NLaunches,
  /// Pause between polls when nothing is READY.
  pub sleep: Duration,
  /// Launcher directories are created under this one.
  pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RapidfireReport {
  pub launched: u32,
  pub completed: u32,
  pub fizzled: u32,
  pub lost: u32,
}

/// Create `parent/<prefix><now formatted>`, adding `-1`, `-2`, ... until the
/// name is free. Directory creation decides between concurrent callers.
pub async fn create_unique_dir(
  parent: &Path,
  prefix: &str,
  format: &str,
  now: DateTime<Utc>,
) -> Result<PathBuf, EngineError> {
  let io_err = |path: &Path, source| EngineError::Io {
    path: path.to_path_buf(),
    source,
  };

  let mut stamp = String::new();
  write!(stamp, "{}", now.format(format)).map_err(|_| {
    io_err(
      parent,
      std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("bad directory time format {format:?}"),
      ),
    )
  })?;
  let base = format!("{prefix}{stamp}");

  tokio::fs::create_dir_all(parent)
    .await
    .map_err(|e| io_err(parent, e))?;

  let mut suffix = 0u32;
  loop {
    let name = if suffix == 0 {
      base.clone()
    } else {
      format!("{base}-{suffix}")
    };
    let path = parent.join(name);
    match tokio::fs::create_dir(&path).await {
      Ok(()) => return Ok(path),
      Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => suffix += 1,
      Err(e) => return Err(io_err(&path, e)),
    }
  }
}

/// Launch rockets one after another, each in a fresh `launcher_*` directory.
#[instrument(name = "rapidfire", skip_all, fields(fworker = %fworker.name))]
pub async fn rapidfire(
  rocket: &Rocket,
  fworker: &FWorker,
  options: &RapidfireOptions,
  cancel: &CancellationToken,
) -> Result<RapidfireReport, EngineError> {
  let launchpad = rocket.launchpad();
  let format = launchpad.config().fw_block_format.clone();
  let mut report = RapidfireReport::default();

  while !cancel.is_cancelled() && !options.nlaunches.reached(report.launched) {
    if !launchpad.run_exists(fworker).await? {
      if options.nlaunches == NLaunches::UntilEmpty {
        break;
      }
      debug!(sleep_ms = options.sleep.as_millis() as u64, "rapidfire_waiting");
      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = tokio::time::sleep(options.sleep) => continue,
      }
    }

    let dir = create_unique_dir(&options.base_dir, "launcher_", &format, Utc::now()).await?;
    match rocket.launch(fworker, Some(&dir), None).await? {
      RocketOutcome::NoWork => {
        // Someone else claimed it first.
        let _ = tokio::fs::remove_dir(&dir).await;
        continue;
      }
      RocketOutcome::Completed { .. } => report.completed += 1,
      RocketOutcome::Fizzled { .. } => report.fizzled += 1,
      RocketOutcome::Lost { .. } => report.lost += 1,
    }
    report.launched += 1;
  }

  info!(
    launched = report.launched,
    completed = report.completed,
    fizzled = report.fizzled,
    lost = report.lost,
    "rapidfire_done"
  );
  Ok(report)
}
