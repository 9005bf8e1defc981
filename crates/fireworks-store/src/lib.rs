//! FireWorks Store
//!
//! This crate provides the storage trait and implementations for workflows,
//! fireworks and launches.
//!
//! The [`Store`] trait defines:
//! - Point lookups and predicate queries
//! - Unconditional upserts
//! - [`Commit`]: a batch of guarded writes applied atomically or not at all
//!
//! Guarded commits are the only mutual-exclusion mechanism between worker
//! processes. Every FireWork and Workflow write bumps the record's
//! `revision`, so a guard on `(state, revision)` detects any interleaved
//! write.

mod commit;
mod memory;
mod query;
mod rows;
mod sqlite;

pub use commit::{
  Commit, CommitOutcome, Conflict, FireWorkGuard, FireWorkWrite, LaunchGuard, LaunchWrite,
  WorkflowGuard, WorkflowWrite,
};
pub use memory::MemoryStore;
pub use query::{FireWorkQuery, LaunchQuery};
pub use sqlite::SqliteStore;

use std::ops::Range;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fireworks_workflow::{FireWork, FwId, Launch, LaunchId, Workflow, WorkflowId};

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested record was not found.
  #[error("{kind} not found: {id}")]
  NotFound { kind: &'static str, id: i64 },

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  /// Applying schema migrations failed.
  #[error("migration error: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),

  /// A persisted record could not be decoded.
  #[error("corrupt {record}: {message}")]
  Corrupt { record: String, message: String },

  /// An in-memory lock was poisoned by a panicking writer.
  #[error("store lock poisoned")]
  Poisoned,
}

/// Which id counter to draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
  FireWork,
  Launch,
  Workflow,
}

impl IdKind {
  pub fn as_str(self) -> &'static str {
    match self {
      IdKind::FireWork => "firework",
      IdKind::Launch => "launch",
      IdKind::Workflow => "workflow",
    }
  }
}

/// Storage trait for workflows, fireworks and launches.
#[async_trait]
pub trait Store: Send + Sync {
  /// Reserve `count` consecutive fresh ids.
  async fn allocate_ids(&self, kind: IdKind, count: usize) -> Result<Range<i64>, Error>;

  async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow, Error>;

  async fn get_firework(&self, fw_id: FwId) -> Result<FireWork, Error>;

  async fn get_launch(&self, launch_id: LaunchId) -> Result<Launch, Error>;

  /// Fetch several fireworks ordered by id. Unknown ids are skipped.
  async fn get_fireworks(&self, fw_ids: &[FwId]) -> Result<Vec<FireWork>, Error>;

  /// Fireworks matching `query`, ordered by id.
  async fn query_fireworks(&self, query: &FireWorkQuery) -> Result<Vec<FireWork>, Error>;

  /// Launches matching `query`, ordered by id.
  async fn query_launches(&self, query: &LaunchQuery) -> Result<Vec<Launch>, Error>;

  async fn upsert_workflow(&self, workflow: &Workflow) -> Result<(), Error>;

  async fn upsert_firework(&self, firework: &FireWork) -> Result<(), Error>;

  async fn upsert_launch(&self, launch: &Launch) -> Result<(), Error>;

  /// Apply every write of `commit` if all guards hold, otherwise none.
  async fn commit(&self, commit: Commit) -> Result<CommitOutcome, Error>;

  /// Record a heartbeat. Applies only while the launch is RUNNING.
  async fn touch_launch(&self, launch_id: LaunchId, now: DateTime<Utc>) -> Result<bool, Error>;

  /// Record the queue job id of a RESERVED or RUNNING launch without
  /// touching its other fields. A guarded launch write that carries no
  /// reservation id keeps the stored one.
  async fn set_reservation_id(
    &self,
    launch_id: LaunchId,
    reservation_id: &str,
  ) -> Result<bool, Error>;

  /// Delete every record and restart the id counters.
  async fn reset(&self) -> Result<(), Error>;
}
