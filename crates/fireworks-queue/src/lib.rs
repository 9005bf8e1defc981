//! FireWorks Queue Launcher
//!
//! Submits rockets to an external batch queue. A [`QueueAdapter`] knows how
//! to talk to one queue system; [`CommandAdapter`] drives any system whose
//! submit, status and cancel steps are shell commands, as described by a
//! [`QueueParams`] file.
//!
//! [`QueueLauncher`] writes a submit script per launch directory and submits
//! it, optionally reserving a FireWork first so the job runs exactly that
//! launch. Its `rapidfire` loop keeps a target number of jobs in the queue.

mod adapter;
mod error;
mod launcher;
mod params;

pub use adapter::{AdapterCanceller, CommandAdapter, QueueAdapter, ScriptContext};
pub use error::QueueError;
pub use launcher::{QueueLauncher, QueueRapidfireOptions, QueueReport, Submission};
pub use params::{AdapterKind, DEFAULT_SCRIPT_TEMPLATE, QueueParams};
