//! Engine error model.

use thiserror::Error;

/// Result type used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Kind of entity a lookup failed for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Job,
    DeadLetterJob,
    Task,
    Blob,
    Scope,
}

impl core::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            EntityKind::Job => "job",
            EntityKind::DeadLetterJob => "dead-letter job",
            EntityKind::Task => "task",
            EntityKind::Blob => "blob",
            EntityKind::Scope => "scope",
        };
        f.write_str(name)
    }
}

/// Engine-level failure.
///
/// Only genuine failures live here. Expected concurrency outcomes (a lost claim
/// race, a lease taken over by another instance) are modelled as result variants
/// by the lease manager and never travel through this type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// A required identifier was missing or malformed. Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A referenced entity does not exist.
    #[error("{kind} {id} doesn't exist")]
    NotFound { kind: EntityKind, id: String },

    /// Stored blob content is not valid UTF-8. This is a data-integrity fault.
    #[error("blob '{slot}' holds content that is not valid utf-8: {source}")]
    Encoding {
        slot: String,
        #[source]
        source: core::str::Utf8Error,
    },

    /// The backing store could not complete a round trip.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A concurrent update won; reload and retry the logical operation.
    #[error("version conflict: {0}")]
    VersionConflict(String),
}

impl EngineError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(kind: EntityKind, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::StorageUnavailable(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::VersionConflict(msg.into())
    }

    /// Whether re-running the whole logical operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::VersionConflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_names_kind_and_id() {
        let err = EngineError::not_found(EntityKind::Task, "t-1");
        assert_eq!(err.to_string(), "task t-1 doesn't exist");
    }

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(EngineError::conflict("stale").is_retryable());
        assert!(!EngineError::invalid_argument("taskId is null").is_retryable());
        assert!(!EngineError::storage("down").is_retryable());
    }
}
