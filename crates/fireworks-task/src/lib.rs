//! FireWorks Task
//!
//! A FireWork's `tasks` are stored as `_fw_name`-tagged parameter maps. The
//! [`TaskRegistry`] turns each into a [`FireTask`] at run time; tasks are
//! grouped into named sources that `USER_PACKAGES` enables.

mod error;
mod registry;
mod script;
mod task;
mod tutorial;

pub use error::TaskError;
pub use registry::{BUILTIN_SOURCES, TaskConstructor, TaskRegistry, TaskSource};
pub use script::{SCRIPT_TASK, ScriptTask};
pub use task::{FireTask, TaskContext};
pub use tutorial::{ADD_MODIFY_TASK, ADDITION_TASK, AddModifyTask, AdditionTask};
