//! Optimistic concurrency primitives.

use crate::error::{DomainError, DomainResult};

/// A record whose persisted state carries a monotonically increasing version.
///
/// Every persisted write increments the version by exactly one; writers read,
/// check and write against the version they observed.
pub trait Versioned {
    /// Strongly-typed record identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;

    fn version(&self) -> u64;

    /// Expectation a writer holding this snapshot must pass to the store.
    fn expected_version(&self) -> ExpectedVersion {
        ExpectedVersion::Exact(self.version())
    }
}

/// Optimistic concurrency expectation for a write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking (only for first inserts and tests).
    Any,
    /// Require the record to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}
