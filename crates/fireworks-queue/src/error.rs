use std::path::PathBuf;

use fireworks_engine::EngineError;
use thiserror::Error;

/// Errors that can occur while talking to the batch queue.
#[derive(Debug, Error)]
pub enum QueueError {
  #[error(transparent)]
  Engine(#[from] EngineError),

  #[error("invalid queue params {}: {message}", path.display())]
  Params { path: PathBuf, message: String },

  #[error("failed to render submit script: {message}")]
  Template { message: String },

  #[error("failed to run '{program}': {source}")]
  Spawn {
    program: String,
    #[source]
    source: std::io::Error,
  },

  /// The queue command ran but reported failure or unreadable output.
  #[error("'{program}' failed: {message}")]
  Command { program: String, message: String },

  /// A queue command kept failing through every retry.
  #[error("queue {operation} failed after {attempts} attempts: {message}")]
  RetriesExhausted {
    operation: &'static str,
    attempts: u32,
    message: String,
  },

  #[error("io error on {}: {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}
