//! FireWorks Config
//!
//! This crate holds the process-wide tunables for FireWorks. A [`FwConfig`] is
//! built once at process start from compiled-in defaults, optionally overridden
//! by a single YAML (or JSON) file, and then handed to every component by
//! reference. Nothing reads configuration from a global.
//!
//! Override files use the upper-case key names, e.g.:
//!
//! ```yaml
//! PING_TIME_SECS: 600
//! QUEUE_RETRY_ATTEMPTS: 3
//! ADD_USER_PACKAGES: [my_lab.tasks]
//! FW_NAME_UPDATES:
//!   Old Script Task: Script Task
//! ```
//!
//! Unknown keys are rejected so that a typo never silently falls back to a
//! default.

mod error;
mod fw_config;

pub use error::ConfigError;
pub use fw_config::{CONFIG_ENV_VAR, CONFIG_FILE_NAME, FwConfig};
