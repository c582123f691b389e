#![forbid(unsafe_code)]

pub mod config;
pub mod error;

pub use config::RelayConfig;
pub use error::{CoreError, CoreResult};
