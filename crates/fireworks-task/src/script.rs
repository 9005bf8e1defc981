use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use fireworks_workflow::{Action, Spec};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::TaskError;
use crate::task::{FireTask, TaskContext};

pub const SCRIPT_TASK: &str = "Script Task";

const DEFAULT_SHELL: &str = "/bin/sh";

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Script {
  Line(String),
  Argv(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
struct ScriptParams {
  script: Script,
  #[serde(default)]
  use_shell: bool,
  #[serde(default = "enabled")]
  use_shlex: bool,
  shell_exe: Option<String>,
  stdin_file: Option<PathBuf>,
  stdin_key: Option<String>,
  stdout_file: Option<PathBuf>,
  stderr_file: Option<PathBuf>,
  #[serde(default)]
  store_stdout: bool,
  #[serde(default)]
  store_stderr: bool,
  #[serde(default)]
  defuse_bad_rc: bool,
  #[serde(default)]
  fizzle_bad_rc: bool,
}

fn enabled() -> bool {
  true
}

/// Runs an external command.
///
/// Parameters:
/// - `script`: command line, or argv list
/// - `use_shell`: run through `shell_exe -c` (default `/bin/sh`)
/// - `use_shlex`: split a command line on whitespace honoring quotes (default true)
/// - `stdin_file` / `stdin_key`: feed a file, or a spec value, to stdin
/// - `stdout_file` / `stderr_file`: append captured output to a file
/// - `store_stdout` / `store_stderr`: keep captured output in stored data
/// - `defuse_bad_rc`: a non-zero exit code returns DEFUSE
/// - `fizzle_bad_rc`: a non-zero exit code fails the task
///
/// Stored data always carries `returncode`.
#[derive(Debug, Clone)]
pub struct ScriptTask {
  params: ScriptParams,
}

pub(crate) fn construct(params: &Spec) -> Result<Box<dyn FireTask>, TaskError> {
  Ok(Box::new(ScriptTask::from_params(params)?))
}

impl ScriptTask {
  pub fn from_params(params: &Spec) -> Result<Self, TaskError> {
    let params: ScriptParams =
      serde_json::from_value(Value::Object(params.clone())).map_err(|e| invalid(e.to_string()))?;
    if params.stdin_file.is_some() && params.stdin_key.is_some() {
      return Err(invalid("stdin_file and stdin_key are mutually exclusive"));
    }
    if params.defuse_bad_rc && params.fizzle_bad_rc {
      return Err(invalid("defuse_bad_rc and fizzle_bad_rc are mutually exclusive"));
    }
    Ok(Self { params })
  }

  /// A shell command line.
  pub fn shell(command: impl Into<String>) -> Self {
    Self {
      params: ScriptParams {
        script: Script::Line(command.into()),
        use_shell: true,
        use_shlex: true,
        shell_exe: None,
        stdin_file: None,
        stdin_key: None,
        stdout_file: None,
        stderr_file: None,
        store_stdout: false,
        store_stderr: false,
        defuse_bad_rc: false,
        fizzle_bad_rc: false,
      },
    }
  }

  fn argv(&self) -> Result<Vec<String>, TaskError> {
    let p = &self.params;
    let argv = match (&p.script, p.use_shell) {
      (Script::Line(line), true) => shell_argv(p, line.clone()),
      (Script::Argv(args), true) => shell_argv(p, args.join(" ")),
      (Script::Line(line), false) if p.use_shlex => split_args(line)?,
      (Script::Line(line), false) => vec![line.clone()],
      (Script::Argv(args), false) => args.clone(),
    };
    if argv.is_empty() || argv[0].is_empty() {
      return Err(invalid("script is empty"));
    }
    Ok(argv)
  }

  fn build_command(&self, spec: &Spec, ctx: &TaskContext) -> Result<(Command, Option<Vec<u8>>), TaskError> {
    let p = &self.params;
    let argv = self.argv()?;
    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]).kill_on_drop(true);

    if let Some(dir) = &ctx.launch_dir {
      command.current_dir(dir);
    }

    let mut stdin_data = None;
    if let Some(path) = &p.stdin_file {
      let path = resolve(ctx, path);
      let file = std::fs::File::open(&path).map_err(|source| TaskError::Io { path, source })?;
      command.stdin(Stdio::from(file));
    } else if let Some(key) = &p.stdin_key {
      let value = spec
        .get(key)
        .ok_or_else(|| TaskError::MissingSpecKey { key: key.clone() })?;
      let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
      };
      stdin_data = Some(text.into_bytes());
      command.stdin(Stdio::piped());
    } else {
      command.stdin(Stdio::null());
    }

    command.stdout(if p.store_stdout || p.stdout_file.is_some() {
      Stdio::piped()
    } else {
      Stdio::inherit()
    });
    command.stderr(if p.store_stderr || p.stderr_file.is_some() {
      Stdio::piped()
    } else {
      Stdio::inherit()
    });

    Ok((command, stdin_data))
  }
}

#[async_trait]
impl FireTask for ScriptTask {
  fn name(&self) -> &str {
    SCRIPT_TASK
  }

  async fn run_task(&self, spec: &Spec, ctx: &TaskContext) -> Result<Action, TaskError> {
    let p = &self.params;
    let (mut command, stdin_data) = self.build_command(spec, ctx)?;
    let program = format!("{:?}", command.as_std().get_program());

    debug!(fw_id = ctx.fw_id, program = %program, "script_spawning");
    let mut child = command.spawn().map_err(|source| TaskError::Spawn {
      program: program.clone(),
      source,
    })?;

    if let (Some(data), Some(mut stdin)) = (stdin_data, child.stdin.take()) {
      stdin
        .write_all(&data)
        .await
        .map_err(|source| TaskError::Spawn {
          program: program.clone(),
          source,
        })?;
    }

    let output = child
      .wait_with_output()
      .await
      .map_err(|source| TaskError::Spawn {
        program: program.clone(),
        source,
      })?;
    let returncode = output.status.code().unwrap_or(-1);

    if let Some(path) = &p.stdout_file {
      append_file(&resolve(ctx, path), &output.stdout).await?;
    }
    if let Some(path) = &p.stderr_file {
      append_file(&resolve(ctx, path), &output.stderr).await?;
    }

    let mut stored = Spec::new();
    if p.store_stdout {
      stored.insert(
        "stdout".to_string(),
        json!(String::from_utf8_lossy(&output.stdout)),
      );
    }
    if p.store_stderr {
      stored.insert(
        "stderr".to_string(),
        json!(String::from_utf8_lossy(&output.stderr)),
      );
    }
    stored.insert("returncode".to_string(), json!(returncode));

    info!(fw_id = ctx.fw_id, program = %program, returncode, "script_finished");

    if returncode != 0 {
      if p.defuse_bad_rc {
        return Ok(Action::Defuse {
          stored_data: stored,
        });
      }
      if p.fizzle_bad_rc {
        return Err(TaskError::Failed {
          message: format!("{} exited with code {}", program, returncode),
        });
      }
    }
    Ok(Action::Continue {
      stored_data: stored,
    })
  }
}

fn shell_argv(p: &ScriptParams, line: String) -> Vec<String> {
  let shell = p.shell_exe.clone().unwrap_or_else(|| DEFAULT_SHELL.to_string());
  vec![shell, "-c".to_string(), line]
}

fn resolve(ctx: &TaskContext, path: &Path) -> PathBuf {
  match &ctx.launch_dir {
    Some(dir) if path.is_relative() => dir.join(path),
    _ => path.to_path_buf(),
  }
}

async fn append_file(path: &Path, data: &[u8]) -> Result<(), TaskError> {
  let io_err = |source| TaskError::Io {
    path: path.to_path_buf(),
    source,
  };
  let mut file = tokio::fs::OpenOptions::new()
    .create(true)
    .append(true)
    .open(path)
    .await
    .map_err(io_err)?;
  file.write_all(data).await.map_err(io_err)?;
  file.flush().await.map_err(io_err)
}

fn invalid(message: impl Into<String>) -> TaskError {
  TaskError::InvalidParams {
    task: SCRIPT_TASK.to_string(),
    message: message.into(),
  }
}

/// Split a command line on whitespace. Single quotes are literal, double
/// quotes allow backslash escapes, a bare backslash escapes the next char.
fn split_args(line: &str) -> Result<Vec<String>, TaskError> {
  let mut args = Vec::new();
  let mut current = String::new();
  let mut in_word = false;
  let mut chars = line.chars();

  while let Some(c) = chars.next() {
    match c {
      '\'' => {
        in_word = true;
        loop {
          match chars.next() {
            Some('\'') => break,
            Some(ch) => current.push(ch),
            None => return Err(invalid("unterminated single quote")),
          }
        }
      }
      '"' => {
        in_word = true;
        loop {
          match chars.next() {
            Some('"') => break,
            Some('\\') => match chars.next() {
              Some(ch) => current.push(ch),
              None => return Err(invalid("unterminated double quote")),
            },
            Some(ch) => current.push(ch),
            None => return Err(invalid("unterminated double quote")),
          }
        }
      }
      '\\' => {
        in_word = true;
        if let Some(ch) = chars.next() {
          current.push(ch);
        }
      }
      c if c.is_whitespace() => {
        if in_word {
          args.push(std::mem::take(&mut current));
          in_word = false;
        }
      }
      c => {
        in_word = true;
        current.push(c);
      }
    }
  }
  if in_word {
    args.push(current);
  }
  Ok(args)
}
