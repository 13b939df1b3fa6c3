use thiserror::Error;

/// Failures reported by a [`RequestStore`](crate::store::RequestStore) implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The stored object changed since it was read.
    #[error("conflicting update for {name}: {message}")]
    Conflict { name: String, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("decode error: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to open signing request watch: {0}")]
    Subscription(#[source] StoreError),
    #[error("watch registry has been stopped")]
    Stopped,
}

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("signing request {name} was modified concurrently")]
    UpdateConflict { name: String },
    #[error("transport error while updating {name}: {message}")]
    Transport { name: String, message: String },
    #[error("update of {name} rejected ({status}): {message}")]
    Rejected {
        name: String,
        status: u16,
        message: String,
    },
    #[error("signing request has no name")]
    MissingName,
}

impl ApprovalError {
    pub(crate) fn from_store(name: &str, err: StoreError) -> Self {
        match err {
            StoreError::Conflict { .. } => ApprovalError::UpdateConflict { name: name.into() },
            StoreError::Transport(message) => ApprovalError::Transport {
                name: name.into(),
                message,
            },
            StoreError::Api { status, message } => ApprovalError::Rejected {
                name: name.into(),
                status,
                message,
            },
            StoreError::Decode(message) => ApprovalError::Rejected {
                name: name.into(),
                status: 0,
                message,
            },
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ApprovalError::UpdateConflict { .. })
    }
}
