//! Error types for configuration handling.

use std::path::PathBuf;

use thiserror::Error;

/// Configuration error type.
#[derive(Error, Debug)]
pub enum Error {
    /// The config file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for the expected schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field holds a value outside its allowed range
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
