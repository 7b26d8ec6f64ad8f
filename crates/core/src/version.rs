//! Optimistic concurrency expectations.

use crate::error::{EngineError, EngineResult};

/// Optimistic concurrency expectation for an entity revision.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip revision checking (used by writes guarded some other way, e.g. lock owner).
    Any,
    /// Require the stored entity to be at an exact revision.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> EngineResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(EngineError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}
