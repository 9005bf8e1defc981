use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while resolving or running a task.
#[derive(Debug, Error)]
pub enum TaskError {
  /// No constructor is registered under this tag.
  #[error("unknown task type: {name}")]
  UnknownTask { name: String },

  /// `USER_PACKAGES` names a source that does not exist.
  #[error("unknown task source: {name}")]
  UnknownSource { name: String },

  /// Task parameters failed to parse or are inconsistent.
  #[error("invalid parameters for '{task}': {message}")]
  InvalidParams { task: String, message: String },

  /// The FireWork spec lacks a key the task reads.
  #[error("spec is missing required key '{key}'")]
  MissingSpecKey { key: String },

  /// The FireWork spec has a key with the wrong shape.
  #[error("spec key '{key}' is invalid: {message}")]
  InvalidSpecKey { key: String, message: String },

  #[error("io error on {}: {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to run '{program}': {source}")]
  Spawn {
    program: String,
    #[source]
    source: std::io::Error,
  },

  /// The task ran and reported failure.
  #[error("task failed: {message}")]
  Failed { message: String },
}
