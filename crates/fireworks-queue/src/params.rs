use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::QueueError;

/// Submit script used when the params file does not provide one.
pub const DEFAULT_SCRIPT_TEMPLATE: &str = "#!/bin/sh\ncd {{ launch_dir }}\n{{ rocket_command }}\n";

/// Which adapter drives the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
  /// Submit, status and cancel are plain commands.
  #[default]
  Command,
}

/// Queue description loaded from a YAML or JSON file.
///
/// ```yaml
/// adapter: command
/// submit_cmd: [sbatch]
/// status_cmd: [squeue, -h, -u, alice]
/// cancel_cmd: [scancel]
/// script_template: |
///   #!/bin/sh
///   #SBATCH --time={{ walltime }}
///   cd {{ launch_dir }}
///   {{ rocket_command }}
/// vars:
///   walltime: "01:00:00"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueParams {
  #[serde(default)]
  pub adapter: AdapterKind,

  /// Program and leading arguments; the script path is appended.
  pub submit_cmd: Vec<String>,

  /// Lists this user's jobs, one per line after the header.
  pub status_cmd: Vec<String>,

  /// Program and leading arguments; the job id is appended.
  pub cancel_cmd: Vec<String>,

  /// Lines of `status_cmd` output to skip before counting jobs.
  #[serde(default)]
  pub status_header_lines: usize,

  #[serde(default = "default_template")]
  pub script_template: String,

  /// Extra values available to the script template.
  #[serde(default)]
  pub vars: Map<String, Value>,
}

fn default_template() -> String {
  DEFAULT_SCRIPT_TEMPLATE.to_string()
}

impl QueueParams {
  pub fn from_file(path: &Path) -> Result<Self, QueueError> {
    let content = std::fs::read_to_string(path).map_err(|source| QueueError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    let params: Self = serde_yaml::from_str(&content).map_err(|e| QueueError::Params {
      path: path.to_path_buf(),
      message: e.to_string(),
    })?;
    params.validate(path)?;
    Ok(params)
  }

  fn validate(&self, path: &Path) -> Result<(), QueueError> {
    for (key, cmd) in [
      ("submit_cmd", &self.submit_cmd),
      ("status_cmd", &self.status_cmd),
      ("cancel_cmd", &self.cancel_cmd),
    ] {
      if cmd.first().is_none_or(|program| program.is_empty()) {
        return Err(QueueError::Params {
          path: path.to_path_buf(),
          message: format!("{key} must name a program"),
        });
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_from_file_yaml_and_json() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = dir.path().join("queue.yaml");
    std::fs::write(
      &yaml,
      "submit_cmd: [qsub]\nstatus_cmd: [qstat, -u, bob]\ncancel_cmd: [qdel]\nstatus_header_lines: 2\nvars:\n  nodes: 4\n",
    )
    .unwrap();
    let params = QueueParams::from_file(&yaml).unwrap();
    assert_eq!(params.adapter, AdapterKind::Command);
    assert_eq!(params.status_header_lines, 2);
    assert_eq!(params.script_template, DEFAULT_SCRIPT_TEMPLATE);
    assert_eq!(params.vars["nodes"], serde_json::json!(4));

    let json = dir.path().join("queue.json");
    std::fs::write(
      &json,
      r#"{"submit_cmd": ["sbatch"], "status_cmd": ["squeue"], "cancel_cmd": ["scancel"]}"#,
    )
    .unwrap();
    assert_eq!(QueueParams::from_file(&json).unwrap().submit_cmd, vec!["sbatch"]);
  }

  #[test]
  fn test_rejects_unknown_keys_and_empty_commands() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.yaml");

    std::fs::write(&path, "submit_cmd: [qsub]\nstatus_cmd: [qstat]\ncancel_cmd: [qdel]\nwalltime: 1\n").unwrap();
    assert!(matches!(
      QueueParams::from_file(&path),
      Err(QueueError::Params { .. })
    ));

    std::fs::write(&path, "submit_cmd: []\nstatus_cmd: [qstat]\ncancel_cmd: [qdel]\n").unwrap();
    let err = QueueParams::from_file(&path).unwrap_err();
    assert!(err.to_string().contains("submit_cmd"), "{err}");
  }
}
