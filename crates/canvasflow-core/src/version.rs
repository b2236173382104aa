//! `vA.B.C` version strings and the strict-increase publish rule.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;

static VERSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^v(\d{1,10})\.(\d{1,10})\.(\d{1,10})$").expect("version regex")
});

/// A parsed `vA.B.C` version. Ordering is lexicographic on `(A, B, C)`,
/// which the derived `Ord` provides through field order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SemVer3 {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl SemVer3 {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }

    pub fn parse(raw: &str) -> Result<Self, WorkflowError> {
        let caps = VERSION_RE.captures(raw).ok_or_else(|| {
            WorkflowError::invalid_parameter(format!(
                "version {raw:?} is not of the form vA.B.C"
            ))
        })?;
        // The regex bounds each component to 10 digits; overflow past u64
        // is still possible and is reported as the same parse failure.
        let part = |i: usize| -> Result<u64, WorkflowError> {
            caps[i].parse().map_err(|_| {
                WorkflowError::invalid_parameter(format!("version component out of range in {raw:?}"))
            })
        };
        Ok(Self::new(part(1)?, part(2)?, part(3)?))
    }

    /// The conventional successor suggested to publishers.
    pub fn next_patch(&self) -> Self {
        Self::new(self.major, self.minor, self.patch + 1)
    }
}

impl fmt::Display for SemVer3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Enforce the publish increment rule: `attempted` must be strictly greater
/// than `latest` (when one exists). Equal and backward versions are both
/// [`WorkflowError::VersionMonotonicity`].
pub fn ensure_monotonic(attempted: &str, latest: Option<&str>) -> Result<SemVer3, WorkflowError> {
    let new = SemVer3::parse(attempted)?;
    if let Some(latest_raw) = latest {
        let latest = SemVer3::parse(latest_raw)?;
        if new <= latest {
            return Err(WorkflowError::VersionMonotonicity {
                attempted: attempted.to_string(),
                latest: latest_raw.to_string(),
            });
        }
    }
    Ok(new)
}
