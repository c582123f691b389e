#![forbid(unsafe_code)]

//! Common error type for the Teredo crates.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// I/O related failures.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration parsing failures.
    #[error("Config parse error: {0}")]
    ConfigParse(toml::de::Error),

    /// A tunable is outside the range the relay can honour.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

impl CoreError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

/// Convenient alias for results throughout the Teredo crates.
pub type CoreResult<T> = Result<T, CoreError>;
