use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

use super::error::{AccessError, AccessErrorKind, PartialRunError};

/// One (account, region) pair scanned independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetUnit {
    pub account_id: String,
    pub region: String,
}

impl TargetUnit {
    pub fn new(account_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            region: region.into(),
        }
    }
}

impl fmt::Display for TargetUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.account_id, self.region)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Development,
    Test,
    Staging,
    Poc,
    Sandbox,
    Unknown,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Development => "development",
            Environment::Test => "test",
            Environment::Staging => "staging",
            Environment::Poc => "poc",
            Environment::Sandbox => "sandbox",
            Environment::Unknown => "unknown",
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Environment::Production => "Production",
            Environment::Development => "Development",
            Environment::Test => "Test",
            Environment::Staging => "Staging",
            Environment::Poc => "POC",
            Environment::Sandbox => "Sandbox",
            Environment::Unknown => "Unknown",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageAttributes {
    pub allocated_storage_gb: Option<i32>,
    /// Upper bound for storage autoscaling; `None` means autoscaling is off
    pub max_allocated_storage_gb: Option<i32>,
    pub storage_type: Option<String>,
    pub storage_encrypted: Option<bool>,
    pub iops: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttributes {
    pub endpoint_address: Option<String>,
    pub endpoint_port: Option<i32>,
    pub availability_zone: Option<String>,
    pub multi_az: Option<bool>,
    pub publicly_accessible: Option<bool>,
    pub vpc_id: Option<String>,
}

/// Normalized view of one managed database instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub account_id: String,
    pub region: String,
    pub engine: String,
    pub engine_version: String,
    pub instance_class: String,
    pub status: String,
    pub storage: StorageAttributes,
    pub network: NetworkAttributes,
    pub backup_window: Option<String>,
    pub backup_retention_days: Option<i32>,
    pub tags: BTreeMap<String, String>,
    pub environment: Environment,
    pub created_at: Option<DateTime<Utc>>, // Provider creation time
    pub last_seen_at: DateTime<Utc>,       // Last scan that returned this instance
    pub last_updated_at: DateTime<Utc>,    // Last scan that changed a semantic field
    #[serde(default)]
    pub removed_at: Option<DateTime<Utc>>, // Set when a successful scan no longer sees it
}

impl InstanceRecord {
    pub fn unit(&self) -> TargetUnit {
        TargetUnit::new(&self.account_id, &self.region)
    }

    pub fn is_removed(&self) -> bool {
        self.removed_at.is_some()
    }

    /// Compare everything a scan can observe, ignoring bookkeeping timestamps.
    pub fn semantically_equal(&self, other: &InstanceRecord) -> bool {
        self.instance_id == other.instance_id
            && self.account_id == other.account_id
            && self.region == other.region
            && self.engine == other.engine
            && self.engine_version == other.engine_version
            && self.instance_class == other.instance_class
            && self.status == other.status
            && self.storage == other.storage
            && self.network == other.network
            && self.backup_window == other.backup_window
            && self.backup_retention_days == other.backup_retention_days
            && self.tags == other.tags
            && self.environment == other.environment
            && self.created_at == other.created_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryErrorType {
    AccessDenied,
    RoleNotFound,
    Throttled,
    Timeout,
    ServiceError,
    Normalization,
}

impl From<AccessErrorKind> for DiscoveryErrorType {
    fn from(kind: AccessErrorKind) -> Self {
        match kind {
            AccessErrorKind::AccessDenied => DiscoveryErrorType::AccessDenied,
            AccessErrorKind::RoleNotFound => DiscoveryErrorType::RoleNotFound,
            AccessErrorKind::Throttled => DiscoveryErrorType::Throttled,
            AccessErrorKind::Timeout => DiscoveryErrorType::Timeout,
            AccessErrorKind::ServiceError => DiscoveryErrorType::ServiceError,
        }
    }
}

/// A per-unit problem recorded on a run. Never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryError {
    pub unit: TargetUnit,
    #[serde(rename = "type")]
    pub error_type: DiscoveryErrorType,
    pub severity: Severity,
    pub message: String,
    pub remediation: String,
    pub can_skip: bool,
}

impl From<AccessError> for DiscoveryError {
    fn from(err: AccessError) -> Self {
        Self {
            unit: err.unit(),
            error_type: err.kind.into(),
            severity: err.kind.severity(),
            message: err.message,
            remediation: err.remediation,
            can_skip: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryRun {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub units_attempted: BTreeSet<TargetUnit>,
    pub units_succeeded: BTreeSet<TargetUnit>,
    pub errors: Vec<DiscoveryError>,
    pub records: Vec<InstanceRecord>,
    pub duration_ms: u64,
}

impl DiscoveryRun {
    /// Distinct accounts that had at least one unit attempted
    pub fn accounts_attempted(&self) -> usize {
        self.units_attempted
            .iter()
            .map(|u| u.account_id.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Distinct accounts that had at least one unit scanned successfully
    pub fn accounts_scanned(&self) -> usize {
        self.units_succeeded
            .iter()
            .map(|u| u.account_id.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn unit_succeeded(&self, unit: &TargetUnit) -> bool {
        self.units_succeeded.contains(unit)
    }

    pub fn failed_units(&self) -> BTreeSet<&TargetUnit> {
        self.units_attempted
            .iter()
            .filter(|u| !self.units_succeeded.contains(*u))
            .collect()
    }

    /// True when units were attempted and none of them succeeded.
    pub fn all_units_failed(&self) -> bool {
        !self.units_attempted.is_empty() && self.units_succeeded.is_empty()
    }

    pub fn errors_for_unit<'a>(
        &'a self,
        unit: &'a TargetUnit,
    ) -> impl Iterator<Item = &'a DiscoveryError> + 'a {
        self.errors.iter().filter(move |e| &e.unit == unit)
    }

    /// Summary of failed units, if any failed.
    pub fn partial_error(&self) -> Option<PartialRunError> {
        let failed = self.failed_units().len();
        if failed == 0 {
            return None;
        }
        Some(PartialRunError {
            failed_units: failed,
            attempted_units: self.units_attempted.len(),
            errors: self.errors.clone(),
        })
    }
}

/// Outcome of reconciling one run against the stored inventory (instance ids).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub new: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub removed: Vec<String>,
    pub errors: Vec<String>,
}

/// What the cache stores per key: one discovery pass and its reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub scope: String,
    pub run: DiscoveryRun,
    pub reconciliation: ReconciliationReport,
}

impl FleetSnapshot {
    pub fn instance_count(&self) -> usize {
        self.run.records.len()
    }
}
