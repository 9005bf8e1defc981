use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use fireworks_engine::ReservationCanceller;
use fireworks_workflow::LaunchId;
use minijinja::Environment;
use serde_json::{Value, json};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::QueueError;
use crate::params::QueueParams;

/// What a submit script needs to know about its launch.
#[derive(Debug, Clone)]
pub struct ScriptContext {
  pub launch_dir: PathBuf,
  /// Full command line of the rocket the job runs.
  pub rocket_command: String,
  /// Set when the job runs a reserved launch.
  pub launch_id: Option<LaunchId>,
}

/// One batch queue system.
#[async_trait]
pub trait QueueAdapter: Send + Sync {
  /// Render the submit script for one job.
  fn render_script(&self, ctx: &ScriptContext) -> Result<String, QueueError>;

  /// Submit the script at `script` and return the job id.
  async fn submit(&self, script: &Path) -> Result<String, QueueError>;

  /// Number of this user's jobs currently queued or running.
  async fn njobs_in_queue(&self) -> Result<usize, QueueError>;

  async fn cancel(&self, job_id: &str) -> Result<(), QueueError>;
}

/// Adapter for queue systems driven entirely by shell commands.
#[derive(Debug, Clone)]
pub struct CommandAdapter {
  params: QueueParams,
}

impl CommandAdapter {
  pub fn new(params: QueueParams) -> Self {
    Self { params }
  }

  pub fn params(&self) -> &QueueParams {
    &self.params
  }

  async fn run(&self, cmd: &[String], extra: Option<&str>) -> Result<Output, QueueError> {
    let (program, args) = cmd.split_first().ok_or_else(|| QueueError::Command {
      program: String::new(),
      message: "empty command".to_string(),
    })?;

    let mut command = Command::new(program);
    command.args(args);
    if let Some(extra) = extra {
      command.arg(extra);
    }
    debug!(program = %program, args = ?args, extra, "queue_command");

    let output = command
      .kill_on_drop(true)
      .output()
      .await
      .map_err(|source| QueueError::Spawn {
        program: program.clone(),
        source,
      })?;
    if !output.status.success() {
      return Err(QueueError::Command {
        program: program.clone(),
        message: format!(
          "exited with {}: {}",
          output.status,
          String::from_utf8_lossy(&output.stderr).trim()
        ),
      });
    }
    Ok(output)
  }
}

/// Job id from submit output: the last word of the first non-empty line.
/// Covers both `12345.server` and `Submitted batch job 12345`.
fn parse_job_id(stdout: &str) -> Option<String> {
  stdout
    .lines()
    .find(|line| !line.trim().is_empty())
    .and_then(|line| line.split_whitespace().last())
    .map(str::to_string)
}

#[async_trait]
impl QueueAdapter for CommandAdapter {
  fn render_script(&self, ctx: &ScriptContext) -> Result<String, QueueError> {
    let mut vars = self.params.vars.clone();
    vars.insert(
      "launch_dir".to_string(),
      json!(ctx.launch_dir.display().to_string()),
    );
    vars.insert("rocket_command".to_string(), json!(ctx.rocket_command));
    vars.insert(
      "launch_id".to_string(),
      ctx.launch_id.map(Value::from).unwrap_or(Value::Null),
    );

    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    env
      .render_str(&self.params.script_template, Value::Object(vars))
      .map_err(|e| QueueError::Template {
        message: e.to_string(),
      })
  }

  async fn submit(&self, script: &Path) -> Result<String, QueueError> {
    let script = script.display().to_string();
    let output = self.run(&self.params.submit_cmd, Some(&script)).await?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let job_id = parse_job_id(&stdout).ok_or_else(|| QueueError::Command {
      program: self.params.submit_cmd[0].clone(),
      message: "no job id in output".to_string(),
    })?;
    info!(job_id = %job_id, script = %script, "job_submitted");
    Ok(job_id)
  }

  async fn njobs_in_queue(&self) -> Result<usize, QueueError> {
    let output = self.run(&self.params.status_cmd, None).await?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(
      stdout
        .lines()
        .skip(self.params.status_header_lines)
        .filter(|line| !line.trim().is_empty())
        .count(),
    )
  }

  async fn cancel(&self, job_id: &str) -> Result<(), QueueError> {
    self.run(&self.params.cancel_cmd, Some(job_id)).await?;
    info!(job_id, "job_cancelled");
    Ok(())
  }
}

/// Lets the stale-reservation sweep cancel queue jobs.
#[derive(Clone)]
pub struct AdapterCanceller(pub Arc<dyn QueueAdapter>);

#[async_trait]
impl ReservationCanceller for AdapterCanceller {
  async fn cancel(&self, reservation_id: &str) -> Result<(), String> {
    self.0.cancel(reservation_id).await.map_err(|e| e.to_string())
  }
}
