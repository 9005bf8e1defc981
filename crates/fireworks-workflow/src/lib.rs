//! FireWorks Workflow
//!
//! This crate is the data model shared by every other FireWorks crate:
//!
//! - [`Workflow`]: a DAG of FireWork ids with parent -> children links
//! - [`FireWork`]: a job made of ordered [`TaskSpec`]s plus a mutable spec
//! - [`Launch`]: one execution attempt of a FireWork
//! - [`Action`]: what a finished FireWork asks the engine to do next
//! - [`SpecMod`]: the closed set of spec mutation operators
//! - [`FWorker`]: a compute-resource descriptor used to filter claims
//! - [`WorkflowDef`]: the user-facing file format, with placeholder ids
//!
//! Everything here is plain data plus invariants. Persistence lives in
//! `fireworks-store`, state transitions in `fireworks-engine`.

mod action;
mod definition;
mod error;
mod firework;
mod fworker;
mod graph;
mod launch;
mod mods;
mod state;
mod workflow;

pub use action::Action;
pub use definition::{FireWorkDef, WorkflowDef};
pub use error::WorkflowError;
pub use firework::{FireWork, TaskSpec};
pub use fworker::{FWORKER_FILE_NAME, FWorker};
pub use graph::Graph;
pub use launch::Launch;
pub use mods::{SpecMod, apply_mods, get_path, merge_into};
pub use state::{FwState, LaunchState};
pub use workflow::Workflow;

/// Identifier of a FireWork, unique within a store.
pub type FwId = i64;

/// Identifier of a Launch, unique within a store.
pub type LaunchId = i64;

/// Identifier of a Workflow, unique within a store.
pub type WorkflowId = i64;

/// The key-value bag carried by a FireWork and passed to its tasks.
pub type Spec = serde_json::Map<String, serde_json::Value>;
