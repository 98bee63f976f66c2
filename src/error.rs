use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum AutoCancelError {
    #[error("API request failed with status {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("API request failed with status {status} after {retries} retries")]
    ApiErrorAfterRetries { status: u16, retries: u32 },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Cron expression '{0}' has no upcoming run")]
    NoUpcomingRun(String),

    #[error("Optimistic lock '{name}' gave up after {attempts} attempts")]
    LockRetriesExhausted { name: &'static str, attempts: u32 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, AutoCancelError>;
