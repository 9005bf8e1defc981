use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fireworks_engine::{ClaimOptions, LaunchPad, NLaunches, create_unique_dir};
use fireworks_workflow::{FWorker, LaunchId};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::adapter::{QueueAdapter, ScriptContext};
use crate::error::QueueError;

const RETRY_DELAY: Duration = Duration::from_secs(5);

/// A job handed to the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
  pub job_id: String,
  pub launch_id: Option<LaunchId>,
  pub script: PathBuf,
}

#[derive(Debug, Clone)]
pub struct QueueRapidfireOptions {
  /// Jobs to keep in the queue.
  pub njobs_queue: usize,
  /// Jobs per block directory.
  pub njobs_block: usize,
  /// Fill loops to run.
  pub nlaunches: NLaunches,
  /// Pause between fill loops.
  pub sleep: Duration,
  pub reserve: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueReport {
  pub loops: u32,
  pub submitted: u32,
  pub failed: u32,
  pub blocks: Vec<PathBuf>,
}

/// Submits rockets to a queue on behalf of one FWorker.
pub struct QueueLauncher {
  launchpad: LaunchPad,
  adapter: Arc<dyn QueueAdapter>,
  fworker: FWorker,
  rocket_command: String,
  retry_delay: Duration,
}

impl QueueLauncher {
  /// `rocket_command` is the rlaunch invocation jobs run, for example
  /// `fireworks --db /shared/fw.db rlaunch`.
  pub fn new(
    launchpad: LaunchPad,
    adapter: Arc<dyn QueueAdapter>,
    fworker: FWorker,
    rocket_command: impl Into<String>,
  ) -> Self {
    Self {
      launchpad,
      adapter,
      fworker,
      rocket_command: rocket_command.into(),
      retry_delay: RETRY_DELAY,
    }
  }

  /// Pause between attempts at a failing queue command.
  pub fn with_retry_delay(mut self, delay: Duration) -> Self {
    self.retry_delay = delay;
    self
  }

  pub fn adapter(&self) -> &Arc<dyn QueueAdapter> {
    &self.adapter
  }

  /// Write the submit script into `launch_dir` and submit it.
  ///
  /// With `reserve`, a FireWork is claimed first and the job runs exactly that
  /// launch; `None` means nothing was READY. If every submission attempt
  /// fails the reservation is cancelled again.
  #[instrument(name = "launch_rocket_to_queue", skip(self), fields(launch_dir = %launch_dir.display()))]
  pub async fn launch_rocket_to_queue(
    &self,
    launch_dir: &Path,
    reserve: bool,
  ) -> Result<Option<Submission>, QueueError> {
    tokio::fs::create_dir_all(launch_dir)
      .await
      .map_err(|source| QueueError::Io {
        path: launch_dir.to_path_buf(),
        source,
      })?;

    let launch_id = if reserve {
      let options = ClaimOptions {
        launch_dir: Some(launch_dir.display().to_string()),
        ..ClaimOptions::default()
      };
      match self.launchpad.claim_next(&self.fworker, options).await? {
        Some(claim) => Some(claim.launch.launch_id),
        None => {
          info!("nothing_to_reserve");
          return Ok(None);
        }
      }
    } else {
      None
    };

    let rocket_command = match launch_id {
      Some(id) => format!("{} singleshot --launch-id {id}", self.rocket_command),
      None => format!("{} singleshot", self.rocket_command),
    };
    let ctx = ScriptContext {
      launch_dir: launch_dir.to_path_buf(),
      rocket_command,
      launch_id,
    };

    let submitted = self.write_and_submit(&ctx).await;
    let (script, job_id) = match submitted {
      Ok(done) => done,
      Err(e) => {
        if let Some(id) = launch_id {
          let reason = format!("queue submission failed: {e}");
          self.launchpad.cancel_reservation(id, &reason).await?;
        }
        error!(error = %e, "queue_submission_abandoned");
        return Err(e);
      }
    };

    if let Some(id) = launch_id {
      self.launchpad.set_reservation_id(id, &job_id).await?;
    }
    info!(job_id = %job_id, launch_id, "rocket_queued");
    Ok(Some(Submission {
      job_id,
      launch_id,
      script,
    }))
  }

  async fn write_and_submit(&self, ctx: &ScriptContext) -> Result<(PathBuf, String), QueueError> {
    let script = self.adapter.render_script(ctx)?;
    let path = ctx
      .launch_dir
      .join(&self.launchpad.config().submit_script_name);
    tokio::fs::write(&path, script)
      .await
      .map_err(|source| QueueError::Io {
        path: path.clone(),
        source,
      })?;

    let job_id = self
      .retry("submit", || self.adapter.submit(&path))
      .await?;
    Ok((path, job_id))
  }

  /// Run `op` up to `QUEUE_RETRY_ATTEMPTS` times.
  async fn retry<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, QueueError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, QueueError>>,
  {
    let attempts = self.launchpad.config().queue_retry_attempts.max(1);
    let mut last = String::new();
    for attempt in 1..=attempts {
      match op().await {
        Ok(value) => return Ok(value),
        Err(e) => {
          warn!(operation, attempt, attempts, error = %e, "queue_command_failed");
          last = e.to_string();
        }
      }
      if attempt < attempts {
        tokio::time::sleep(self.retry_delay).await;
      }
    }
    Err(QueueError::RetriesExhausted {
      operation,
      attempts,
      message: last,
    })
  }

  /// Keep `njobs_queue` jobs in the queue, grouping launch directories into
  /// blocks of at most `njobs_block`.
  #[instrument(name = "queue_rapidfire", skip_all, fields(base_dir = %base_dir.display()))]
  pub async fn rapidfire(
    &self,
    base_dir: &Path,
    options: &QueueRapidfireOptions,
    cancel: &CancellationToken,
  ) -> Result<QueueReport, QueueError> {
    let config = self.launchpad.config().clone();
    let format = config.fw_block_format.clone();
    let mut report = QueueReport::default();
    let mut block: Option<PathBuf> = None;
    let mut in_block = 0usize;

    'outer: while !cancel.is_cancelled() && !options.nlaunches.reached(report.loops) {
      if options.nlaunches == NLaunches::UntilEmpty
        && !self.launchpad.run_exists(&self.fworker).await?
      {
        info!("no_ready_fireworks");
        break;
      }

      let mut queued = self
        .retry("status", || self.adapter.njobs_in_queue())
        .await?;
      while queued < options.njobs_queue {
        if cancel.is_cancelled() {
          break 'outer;
        }
        if options.reserve && !self.launchpad.run_exists(&self.fworker).await? {
          info!("no_ready_fireworks");
          break;
        }

        let block_dir = match &block {
          Some(dir) if in_block < options.njobs_block => dir.clone(),
          _ => {
            let dir = create_unique_dir(base_dir, "block_", &format, Utc::now()).await?;
            info!(block = %dir.display(), "block_created");
            report.blocks.push(dir.clone());
            block = Some(dir.clone());
            in_block = 0;
            dir
          }
        };
        let launch_dir = create_unique_dir(&block_dir, "launcher_", &format, Utc::now()).await?;

        match self.launch_rocket_to_queue(&launch_dir, options.reserve).await {
          Ok(Some(_)) => {
            report.submitted += 1;
            in_block += 1;
          }
          Ok(None) => {
            let _ = tokio::fs::remove_dir(&launch_dir).await;
            break;
          }
          Err(QueueError::RetriesExhausted { .. }) => {
            report.failed += 1;
            break;
          }
          Err(e) => return Err(e),
        }

        tokio::select! {
          _ = cancel.cancelled() => break 'outer,
          _ = tokio::time::sleep(config.queue_update_wait()) => {}
        }
        queued = self
          .retry("status", || self.adapter.njobs_in_queue())
          .await?;
      }

      report.loops += 1;
      if options.nlaunches.reached(report.loops) {
        break;
      }
      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = tokio::time::sleep(options.sleep) => {}
      }
    }

    info!(
      loops = report.loops,
      submitted = report.submitted,
      failed = report.failed,
      "queue_rapidfire_done"
    );
    Ok(report)
  }
}
