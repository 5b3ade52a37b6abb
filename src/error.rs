use thiserror::Error;

/// Failure taxonomy surfaced by the trigger executor and the HTTP layer.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("infrastructure error: {0:#}")]
    Infrastructure(#[from] anyhow::Error),
}

impl NotifyError {
    pub fn trigger_not_found(key: &str) -> Self {
        NotifyError::NotFound(format!("unknown trigger '{}'", key))
    }
}
