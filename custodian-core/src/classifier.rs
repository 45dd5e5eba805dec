use crate::store::StoreError;

/// Why a processing attempt failed.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub(crate) enum Failure {
    #[error("Decode Error - {0}")]
    Decode(String),

    #[error("Store Error - {0}")]
    Store(#[from] StoreError),
}

impl From<serde_json::Error> for Failure {
    fn from(err: serde_json::Error) -> Self {
        Failure::Decode(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureClassification {
    /// The store could not be reached, writing the same record again is expected to succeed.
    Transient,
    /// Anything else. Writing the same record again would fail the same way.
    Unknown,
}

/// Only a store that can not be reached is worth waiting for, every other failure belongs to
/// the record.
pub(crate) fn classify(failure: &Failure) -> FailureClassification {
    match failure {
        Failure::Store(StoreError::Connection(_)) => FailureClassification::Transient,
        Failure::Store(_) | Failure::Decode(_) => FailureClassification::Unknown,
    }
}
