use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WorkflowError;
use crate::firework::FireWork;
use crate::mods::get_path;

pub const DEFAULT_NAME: &str = "anonymous worker";
pub const DEFAULT_CATEGORY: &str = "general worker";

/// Conventional worker file picked up from the working directory.
pub const FWORKER_FILE_NAME: &str = "my_fworker.yaml";

/// A compute-resource descriptor.
///
/// `query` maps dotted spec paths to the value they must equal. A FireWork
/// whose spec carries `_category` is only eligible for workers of that
/// category; FireWorks without one run anywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FWorker {
  #[serde(default = "default_name")]
  pub name: String,
  #[serde(default = "default_category")]
  pub category: String,
  #[serde(default)]
  pub query: BTreeMap<String, Value>,
  #[serde(default)]
  pub params: Value,
}

fn default_name() -> String {
  DEFAULT_NAME.to_string()
}

fn default_category() -> String {
  DEFAULT_CATEGORY.to_string()
}

impl Default for FWorker {
  fn default() -> Self {
    Self {
      name: default_name(),
      category: default_category(),
      query: BTreeMap::new(),
      params: Value::Null,
    }
  }
}

impl FWorker {
  pub fn from_file(path: &Path) -> Result<Self, WorkflowError> {
    let content = std::fs::read_to_string(path).map_err(|source| WorkflowError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    serde_yaml::from_str(&content).map_err(|e| WorkflowError::InvalidWorker {
      path: path.to_path_buf(),
      message: e.to_string(),
    })
  }

  /// Whether this worker may claim `fw`.
  pub fn accepts(&self, fw: &FireWork) -> bool {
    if let Some(category) = fw.category()
      && category != self.category
    {
      return false;
    }
    self
      .query
      .iter()
      .all(|(path, expected)| get_path(&fw.spec, path) == Some(expected))
  }
}
