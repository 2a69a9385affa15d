use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("settings file {path} could not be opened")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("settings file {path} could not be parsed")]
    Deserialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{field} must not be negative, got {value}")]
    Negative { field: &'static str, value: i64 },
    #[error("{field} value {value} is out of range")]
    OutOfRange { field: &'static str, value: i64 },
    #[error("burst duration must be at least one second")]
    ZeroDuration,
    #[error("{policy} trigger policy needs a non-zero {field}")]
    ZeroPolicyParameter {
        policy: &'static str,
        field: &'static str,
    },
    #[error("expected 3 or 4 burst parameters, got {got}")]
    ParamCount { got: usize },
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool {pool_id} is closed")]
    Closed { pool_id: u64 },
}
