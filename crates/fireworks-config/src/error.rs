use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config file {}: {source}", path.display())]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid config in {origin}: {source}")]
  Parse {
    origin: String,
    #[source]
    source: serde_yaml::Error,
  },

  #[error("invalid value for {key}: {message}")]
  Invalid { key: &'static str, message: String },
}
