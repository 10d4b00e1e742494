//! Job identifiers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a job.
///
/// Ad hoc jobs get a random (UUIDv7, time-ordered) id. Deduplicated and
/// periodic jobs get a deterministic id derived from their content, so the
/// inner value is a string rather than a UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Create a new random identifier.
    pub fn random() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Wrap an already-derived identifier.
    ///
    /// Callers are expected to pass a non-empty string; use `FromStr` for
    /// untrusted input.
    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(DomainError::invalid_id("JobId: empty"));
        }
        Ok(Self(trimmed.to_string()))
    }
}
