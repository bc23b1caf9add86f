use thiserror::Error;

/// Rejected configuration: bad job registration or an invalid threshold table.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Job already registered: {0}")]
    DuplicateJob(String),

    #[error("Job {name} has non-positive interval ({interval_seconds}s)")]
    InvalidInterval { name: String, interval_seconds: i64 },

    #[error("Invalid range for {signal}: min {min} > max {max}")]
    InvalidRange { signal: String, min: f64, max: f64 },

    #[error("Invalid threshold {name}: {value}")]
    InvalidThreshold { name: String, value: f64 },

    #[error("Unknown signal type: {0}")]
    UnknownSignal(String),

    #[error("Failed to read config file {path}: {reason}")]
    File { path: String, reason: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),
}

/// Failure of a raw-record store operation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Append failed: {0}")]
    Append(String),

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Rejected record {id}: {reason}")]
    Rejected { id: String, reason: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}
