use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name looked up in the working directory when no path is given.
pub const CONFIG_FILE_NAME: &str = "FW_config.yaml";

/// Environment variable naming an override file.
pub const CONFIG_ENV_VAR: &str = "FW_CONFIG_FILE";

const DEFAULT_PING_TIME_SECS: u64 = 3600;
const RUN_EXPIRATION_FACTOR: u64 = 4;

/// Process-wide tunables.
///
/// Construct with [`FwConfig::default`] or one of the loaders, wrap it in an
/// `Arc`, and pass it down. It is never mutated after startup.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct FwConfig {
  /// Task sources whose type tags are registered at startup.
  pub user_packages: Vec<String>,

  /// Deprecated task tag -> current tag, consulted before registry lookup.
  pub fw_name_updates: HashMap<String, String>,

  /// strftime format used to name block and launcher directories.
  pub fw_block_format: String,

  /// Attempts made when talking to the queue system before giving up.
  pub queue_retry_attempts: u32,

  /// Seconds to wait after a submission before the queue reflects it.
  pub queue_update_interval: u64,

  /// File name of the rendered queue submission script.
  pub submit_script_name: String,

  /// Heartbeat interval of a running launch.
  pub ping_time_secs: u64,

  /// A RUNNING launch without a heartbeat for this long is considered dead.
  pub run_expiration_secs: u64,

  /// A RESERVED launch older than this is considered abandoned.
  pub reservation_expiration_secs: u64,

  /// Whether a DEFUSE action also defuses every pending descendant.
  pub defuse_cascade: bool,
}

impl Default for FwConfig {
  fn default() -> Self {
    Self {
      user_packages: vec![
        "fireworks.user_objects".to_string(),
        "fw_tutorials".to_string(),
      ],
      fw_name_updates: HashMap::new(),
      fw_block_format: "%Y-%m-%d-%H-%M-%S-%f".to_string(),
      queue_retry_attempts: 10,
      queue_update_interval: 15,
      submit_script_name: "FW_submit.script".to_string(),
      ping_time_secs: DEFAULT_PING_TIME_SECS,
      run_expiration_secs: DEFAULT_PING_TIME_SECS * RUN_EXPIRATION_FACTOR,
      reservation_expiration_secs: 60 * 60 * 24 * 14,
      defuse_cascade: false,
    }
  }
}

/// Keys accepted in an override file. Every field is optional; anything not
/// listed here is a hard error.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
struct Overrides {
  user_packages: Option<Vec<String>>,
  add_user_packages: Option<Vec<String>>,
  fw_name_updates: Option<HashMap<String, String>>,
  fw_block_format: Option<String>,
  queue_retry_attempts: Option<u32>,
  queue_update_interval: Option<u64>,
  submit_script_name: Option<String>,
  ping_time_secs: Option<u64>,
  run_expiration_secs: Option<u64>,
  reservation_expiration_secs: Option<u64>,
  defuse_cascade: Option<bool>,
}

impl FwConfig {
  /// Load defaults overridden by the file at `path`.
  pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::parse(&content, &path.display().to_string())
  }

  /// Load defaults overridden by an in-memory YAML/JSON document.
  pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
    Self::parse(content, "<inline>")
  }

  /// Find and load the override file for this process.
  ///
  /// Lookup order: `explicit`, then the file named by `FW_CONFIG_FILE`, then
  /// `FW_config.yaml` in `cwd`. Returns the config and the file it came from,
  /// if any.
  pub fn discover(
    explicit: Option<&Path>,
    cwd: &Path,
  ) -> Result<(Self, Option<PathBuf>), ConfigError> {
    let from_env = std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from);
    match resolve_path(explicit, from_env, cwd) {
      Some(path) => Ok((Self::from_file(&path)?, Some(path))),
      None => Ok((Self::default(), None)),
    }
  }

  fn parse(content: &str, origin: &str) -> Result<Self, ConfigError> {
    let overrides: Overrides = if content.trim().is_empty() {
      Overrides::default()
    } else {
      serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
        origin: origin.to_string(),
        source,
      })?
    };

    let config = Self::default().apply(overrides)?;
    config.validate()?;
    Ok(config)
  }

  fn apply(mut self, o: Overrides) -> Result<Self, ConfigError> {
    if let Some(v) = o.user_packages {
      self.user_packages = v;
    }
    if let Some(extra) = o.add_user_packages {
      for package in extra {
        if !self.user_packages.contains(&package) {
          self.user_packages.push(package);
        }
      }
    }
    if let Some(v) = o.fw_name_updates {
      self.fw_name_updates.extend(v);
    }
    if let Some(v) = o.fw_block_format {
      self.fw_block_format = v;
    }
    if let Some(v) = o.queue_retry_attempts {
      self.queue_retry_attempts = v;
    }
    if let Some(v) = o.queue_update_interval {
      self.queue_update_interval = v;
    }
    if let Some(v) = o.submit_script_name {
      self.submit_script_name = v;
    }
    if let Some(v) = o.ping_time_secs {
      self.ping_time_secs = v;
      // The expiration window follows the heartbeat unless pinned explicitly.
      self.run_expiration_secs =
        v.checked_mul(RUN_EXPIRATION_FACTOR)
          .ok_or_else(|| ConfigError::Invalid {
            key: "PING_TIME_SECS",
            message: format!("{v} is too large"),
          })?;
    }
    if let Some(v) = o.run_expiration_secs {
      self.run_expiration_secs = v;
    }
    if let Some(v) = o.reservation_expiration_secs {
      self.reservation_expiration_secs = v;
    }
    if let Some(v) = o.defuse_cascade {
      self.defuse_cascade = v;
    }
    Ok(self)
  }

  /// Check cross-field constraints.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.ping_time_secs == 0 {
      return Err(ConfigError::Invalid {
        key: "PING_TIME_SECS",
        message: "must be greater than zero".to_string(),
      });
    }
    if self.run_expiration_secs <= self.ping_time_secs {
      return Err(ConfigError::Invalid {
        key: "RUN_EXPIRATION_SECS",
        message: format!(
          "must exceed PING_TIME_SECS ({}), got {}",
          self.ping_time_secs, self.run_expiration_secs
        ),
      });
    }
    if self.queue_retry_attempts == 0 {
      return Err(ConfigError::Invalid {
        key: "QUEUE_RETRY_ATTEMPTS",
        message: "must be at least 1".to_string(),
      });
    }
    if self.submit_script_name.is_empty() || self.submit_script_name.contains('/') {
      return Err(ConfigError::Invalid {
        key: "SUBMIT_SCRIPT_NAME",
        message: format!("not a plain file name: {:?}", self.submit_script_name),
      });
    }
    if StrftimeItems::new(&self.fw_block_format).any(|item| matches!(item, Item::Error)) {
      return Err(ConfigError::Invalid {
        key: "FW_BLOCK_FORMAT",
        message: format!("not a valid strftime format: {:?}", self.fw_block_format),
      });
    }
    Ok(())
  }

  pub fn ping_interval(&self) -> Duration {
    Duration::from_secs(self.ping_time_secs)
  }

  pub fn run_expiration(&self) -> Duration {
    Duration::from_secs(self.run_expiration_secs)
  }

  pub fn reservation_expiration(&self) -> Duration {
    Duration::from_secs(self.reservation_expiration_secs)
  }

  pub fn queue_update_wait(&self) -> Duration {
    Duration::from_secs(self.queue_update_interval)
  }
}

fn resolve_path(explicit: Option<&Path>, from_env: Option<PathBuf>, cwd: &Path) -> Option<PathBuf> {
  if let Some(path) = explicit {
    return Some(path.to_path_buf());
  }
  if let Some(path) = from_env.filter(|p| !p.as_os_str().is_empty()) {
    return Some(path);
  }
  let local = cwd.join(CONFIG_FILE_NAME);
  local.is_file().then_some(local)
}
