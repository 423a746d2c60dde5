//! Error taxonomy for the fleet engine.
//!
//! Only [`FleetError::FatalConfig`] ever aborts processing. Unit-level failures are
//! carried as [`AccessError`] values inside a discovery run, authorization denials and
//! operation failures are reported through structured results, and a run with failed
//! units exposes its errors as a [`PartialRunError`] summary.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::state::{DiscoveryError, Severity, TargetUnit};

/// Engine-level failures surfaced to callers.
#[derive(Debug, Clone, Error)]
pub enum FleetError {
    /// The configuration or target registry could not be loaded. Nothing was scanned.
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    /// A cache key did not match any unit in the target registry.
    #[error("unknown discovery scope '{0}'")]
    UnknownScope(String),
}

/// Classified reason a unit (account, region) could not be accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessErrorKind {
    AccessDenied,
    RoleNotFound,
    Throttled,
    Timeout,
    ServiceError,
}

impl AccessErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessErrorKind::AccessDenied => "access_denied",
            AccessErrorKind::RoleNotFound => "role_not_found",
            AccessErrorKind::Throttled => "throttled",
            AccessErrorKind::Timeout => "timeout",
            AccessErrorKind::ServiceError => "service_error",
        }
    }

    /// Transient kinds are expected to clear on a later run without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(self, AccessErrorKind::Throttled | AccessErrorKind::Timeout)
    }

    pub fn severity(&self) -> Severity {
        if self.is_transient() {
            Severity::Warning
        } else {
            Severity::Error
        }
    }
}

impl fmt::Display for AccessErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit-level credential or API failure. Always recoverable by skipping the unit.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} for account {account_id} in {region}: {message}")]
pub struct AccessError {
    pub kind: AccessErrorKind,
    pub account_id: String,
    pub region: String,
    pub message: String,
    pub remediation: String,
}

impl AccessError {
    pub fn unit(&self) -> TargetUnit {
        TargetUnit::new(&self.account_id, &self.region)
    }
}

/// Aggregate view of the unit failures of one discovery run.
///
/// Informational only: a run carrying a `PartialRunError` still returns all the records
/// its succeeding units produced.
#[derive(Debug, Clone, Error)]
#[error("{failed_units} of {attempted_units} discovery units failed")]
pub struct PartialRunError {
    pub failed_units: usize,
    pub attempted_units: usize,
    pub errors: Vec<DiscoveryError>,
}
