use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoalescerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),
}

/// Errors returned by a [`PartialUpdateStore`](crate::contracts::PartialUpdateStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Update rejected: {0}")]
    Rejected(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid concurrency limit {0}: at least one concurrent flush is required")]
    InvalidConcurrency(usize),
}
