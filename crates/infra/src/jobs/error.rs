use thiserror::Error;

use depot_core::DomainError;

use crate::store::StoreError;

/// Job-system error.
///
/// Only `Store` is transient. Enqueue callers see it directly; worker loops
/// log it and retry after a cooldown. `Resolution` and `Execution` never
/// escape a worker: they are recorded as failure outcomes.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown task: {0}")]
    Resolution(String),

    #[error("task failed: {0}")]
    Execution(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl JobError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

impl From<DomainError> for JobError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => Self::Validation(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_errors_are_transient() {
        assert!(JobError::from(StoreError::Connection("reset".into())).is_transient());
        assert!(!JobError::validation("bad queue").is_transient());
        assert!(!JobError::Cancelled.is_transient());
        assert!(!JobError::from(DomainError::Validation("naive".into())).is_transient());
    }
}
