use std::path::PathBuf;

use thiserror::Error;

use crate::FwId;

#[derive(Debug, Error)]
pub enum WorkflowError {
  #[error("firework not found in workflow: {0}")]
  FireWorkNotFound(FwId),

  #[error("link references unknown firework: from={from}, to={to}")]
  InvalidLink { from: FwId, to: FwId },

  #[error("duplicate firework id: {0}")]
  DuplicateId(FwId),

  #[error("workflow contains a cycle through firework {0}")]
  Cycle(FwId),

  #[error("workflow has no fireworks")]
  Empty,

  #[error("unknown state: {0}")]
  UnknownState(String),

  #[error("cannot apply {op} at '{path}': {message}")]
  Mod {
    op: &'static str,
    path: String,
    message: String,
  },

  #[error("failed to read {}: {source}", path.display())]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error(
    "{} is neither a firework nor a workflow document\n  as firework: {as_firework}\n  as workflow: {as_workflow}",
    path.display()
  )]
  Malformed {
    path: PathBuf,
    as_firework: String,
    as_workflow: String,
  },

  #[error("invalid archive {}: {message}", path.display())]
  Archive { path: PathBuf, message: String },

  #[error("invalid worker file {}: {message}", path.display())]
  InvalidWorker { path: PathBuf, message: String },
}
