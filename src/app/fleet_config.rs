//! Static configuration for the fleet engine.
//!
//! Loaded once from a TOML file into an immutable [`FleetConfig`] that is shared behind an
//! `Arc` and handed to every component at construction.
//!
//! # dbfleet.toml Format
//!
//! ```toml
//! home_account_id = "111111111111"
//! role_name = "dbfleet-discovery"
//!
//! [external_id]
//! source = "env"
//! variable = "DBFLEET_EXTERNAL_ID"
//!
//! [[target_groups]]
//! accounts = ["111111111111", "222222222222"]
//! regions = ["us-east-1", "eu-west-1"]
//!
//! [cache]
//! ttl_secs = 300
//! ```
//!
//! Targets may also live in a separate YAML or TOML file referenced by `targets_file`.
//! That file is re-read on every discovery pass; failing to load it is the single fatal
//! condition of a discovery run.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use super::fleet::error::FleetError;
use super::fleet::state::{Environment, TargetUnit};

/// Cache key that selects every unit in the registry.
pub const ALL_SCOPE: &str = "all";

/// Upper bound on audit retention (100 years).
pub const MAX_RETENTION_DAYS: i64 = 36_500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Account the engine itself runs in. Units in this account skip role assumption.
    pub home_account_id: String,

    /// Role assumed in every other account
    #[serde(default = "default_role_name")]
    pub role_name: String,

    #[serde(default)]
    pub external_id: ExternalIdSource,

    #[serde(default)]
    pub targets: Vec<TargetUnit>,

    /// Cross product shorthand: every account in every region
    #[serde(default)]
    pub target_groups: Vec<TargetGroup>,

    #[serde(default)]
    pub targets_file: Option<PathBuf>,

    #[serde(default)]
    pub discovery: DiscoverySettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub operations: OperationSettings,

    #[serde(default)]
    pub environment: EnvironmentRules,

    #[serde(default)]
    pub audit: AuditSettings,
}

fn default_role_name() -> String {
    "dbfleet-discovery".to_string()
}

/// Where the shared secret for cross-account role assumption comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ExternalIdSource {
    #[default]
    None,
    Literal {
        value: String,
    },
    Env {
        variable: String,
    },
    SecretsManager {
        secret_id: String,
        #[serde(default)]
        region: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroup {
    pub accounts: Vec<String>,
    pub regions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub max_concurrent_units: usize,
    pub unit_timeout_secs: u64,
    pub run_timeout_secs: u64,
    /// Lifetime requested for assumed-role sessions
    pub session_duration_secs: i32,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            max_concurrent_units: 10,
            unit_timeout_secs: 60,
            run_timeout_secs: 300,
            session_duration_secs: 3600,
        }
    }
}

impl DiscoverySettings {
    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Freshness window
    pub ttl_secs: u64,
    /// Entries older than this are never served, even when refreshes keep failing
    pub hard_expiry_secs: u64,
    /// Bound on the synchronous discovery performed on a miss
    pub miss_timeout_secs: u64,
    pub max_entries: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            hard_expiry_secs: 3600,
            miss_timeout_secs: 120,
            max_entries: 256,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn hard_expiry(&self) -> Duration {
        Duration::from_secs(self.hard_expiry_secs)
    }

    pub fn miss_timeout(&self) -> Duration {
        Duration::from_secs(self.miss_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationSettings {
    pub safe_operations: Vec<String>,
    pub risky_operations: Vec<String>,
    /// Role memberships that grant the base `execute_operations` capability
    pub execute_roles: Vec<String>,
    /// Role memberships required for risky operations on production instances
    pub elevated_roles: Vec<String>,
    pub confirmation_parameter: String,
    pub poll_interval_secs: u64,
    pub poll_timeout_secs: u64,
}

impl Default for OperationSettings {
    fn default() -> Self {
        Self {
            safe_operations: vec![
                "create_snapshot".to_string(),
                "modify_backup_window".to_string(),
                "enable_storage_autoscaling".to_string(),
            ],
            risky_operations: vec![
                "stop_instance".to_string(),
                "start_instance".to_string(),
                "reboot_instance".to_string(),
                "modify_storage".to_string(),
            ],
            execute_roles: vec!["execute_operations".to_string()],
            elevated_roles: vec!["production_operator".to_string()],
            confirmation_parameter: "confirm_production".to_string(),
            poll_interval_secs: 30,
            poll_timeout_secs: 300,
        }
    }
}

impl OperationSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamingPattern {
    pub pattern: String,
    pub environment: Environment,
}

/// Inputs of the environment classifier strategies, in precedence order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentRules {
    /// Accepted spellings of the environment tag key, checked in order
    pub tag_keys: Vec<String>,
    /// Lower-case tag value -> environment
    pub value_aliases: HashMap<String, Environment>,
    pub instance_environments: HashMap<String, Environment>,
    pub account_environments: HashMap<String, Environment>,
    /// Regexes matched against the lower-cased instance identifier
    pub naming_patterns: Vec<NamingPattern>,
}

impl Default for EnvironmentRules {
    fn default() -> Self {
        let tag_keys = [
            "Environment",
            "environment",
            "ENVIRONMENT",
            "Env",
            "env",
            "ENV",
            "Stage",
            "stage",
            "EnvironmentType",
            "environment-type",
            "environment_type",
        ]
        .iter()
        .map(|k| k.to_string())
        .collect();

        let value_aliases = [
            ("production", Environment::Production),
            ("prod", Environment::Production),
            ("prd", Environment::Production),
            ("live", Environment::Production),
            ("development", Environment::Development),
            ("dev", Environment::Development),
            ("test", Environment::Test),
            ("testing", Environment::Test),
            ("qa", Environment::Test),
            ("uat", Environment::Test),
            ("staging", Environment::Staging),
            ("stage", Environment::Staging),
            ("stg", Environment::Staging),
            ("preprod", Environment::Staging),
            ("poc", Environment::Poc),
            ("proof-of-concept", Environment::Poc),
            ("sandbox", Environment::Sandbox),
            ("sbx", Environment::Sandbox),
        ]
        .iter()
        .map(|(alias, env)| (alias.to_string(), *env))
        .collect();

        let naming_patterns = [
            (r"(^|[-_.])(prod|prd|production)([-_.0-9]|$)", Environment::Production),
            (r"(^|[-_.])(stg|stage|staging|preprod)([-_.0-9]|$)", Environment::Staging),
            (r"(^|[-_.])(dev|development)([-_.0-9]|$)", Environment::Development),
            (r"(^|[-_.])(test|qa|uat)([-_.0-9]|$)", Environment::Test),
            (r"(^|[-_.])poc([-_.0-9]|$)", Environment::Poc),
            (r"(^|[-_.])(sandbox|sbx)([-_.0-9]|$)", Environment::Sandbox),
        ]
        .iter()
        .map(|(pattern, environment)| NamingPattern {
            pattern: pattern.to_string(),
            environment: *environment,
        })
        .collect();

        Self {
            tag_keys,
            value_aliases,
            instance_environments: HashMap::new(),
            account_environments: HashMap::new(),
            naming_patterns,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub retention_days: i64,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self { retention_days: 90 }
    }
}

/// Format of a standalone targets file.
#[derive(Debug, Default, Deserialize)]
struct TargetsFile {
    #[serde(default)]
    targets: Vec<TargetUnit>,
    #[serde(default)]
    target_groups: Vec<TargetGroup>,
}

/// The resolved, de-duplicated list of units to scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRegistry {
    units: Vec<TargetUnit>,
}

impl TargetRegistry {
    pub fn units(&self) -> &[TargetUnit] {
        &self.units
    }

    pub fn accounts(&self) -> BTreeSet<&str> {
        self.units.iter().map(|u| u.account_id.as_str()).collect()
    }

    /// Units selected by a cache key: `all`, or a single account id.
    pub fn units_for_scope(&self, scope: &str) -> Result<Vec<TargetUnit>, FleetError> {
        if scope == ALL_SCOPE {
            return Ok(self.units.clone());
        }
        let selected: Vec<TargetUnit> = self
            .units
            .iter()
            .filter(|u| u.account_id == scope)
            .cloned()
            .collect();
        if selected.is_empty() {
            return Err(FleetError::UnknownScope(scope.to_string()));
        }
        Ok(selected)
    }
}

impl FleetConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, FleetError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            FleetError::FatalConfig(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&contents)?;
        debug!(
            "Loaded fleet config from {:?}: home account {}, role {}",
            path, config.home_account_id, config.role_name
        );
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, FleetError> {
        let config: FleetConfig = toml::from_str(contents)
            .map_err(|e| FleetError::FatalConfig(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Minimal configuration used by tests and embedders that build targets in code.
    pub fn new(home_account_id: impl Into<String>, targets: Vec<TargetUnit>) -> Self {
        Self {
            home_account_id: home_account_id.into(),
            role_name: default_role_name(),
            external_id: ExternalIdSource::None,
            targets,
            target_groups: Vec::new(),
            targets_file: None,
            discovery: DiscoverySettings::default(),
            cache: CacheSettings::default(),
            operations: OperationSettings::default(),
            environment: EnvironmentRules::default(),
            audit: AuditSettings::default(),
        }
    }

    pub fn validate(&self) -> Result<(), FleetError> {
        if !is_account_id(&self.home_account_id) {
            return Err(FleetError::FatalConfig(format!(
                "home_account_id '{}' is not a 12-digit AWS account id",
                self.home_account_id
            )));
        }
        if self.role_name.trim().is_empty() {
            return Err(FleetError::FatalConfig("role_name must not be empty".to_string()));
        }
        if self.discovery.max_concurrent_units == 0 {
            return Err(FleetError::FatalConfig(
                "discovery.max_concurrent_units must be at least 1".to_string(),
            ));
        }
        if self.cache.hard_expiry_secs <= self.cache.ttl_secs {
            return Err(FleetError::FatalConfig(format!(
                "cache.hard_expiry_secs ({}) must exceed cache.ttl_secs ({})",
                self.cache.hard_expiry_secs, self.cache.ttl_secs
            )));
        }
        if self.operations.poll_interval_secs == 0 {
            return Err(FleetError::FatalConfig(
                "operations.poll_interval_secs must be at least 1".to_string(),
            ));
        }
        for (name, secs) in [
            ("discovery.unit_timeout_secs", self.discovery.unit_timeout_secs),
            ("discovery.run_timeout_secs", self.discovery.run_timeout_secs),
            ("cache.miss_timeout_secs", self.cache.miss_timeout_secs),
            ("operations.poll_timeout_secs", self.operations.poll_timeout_secs),
        ] {
            if secs == 0 {
                return Err(FleetError::FatalConfig(format!("{} must be at least 1", name)));
            }
        }
        if !(1..=MAX_RETENTION_DAYS).contains(&self.audit.retention_days) {
            return Err(FleetError::FatalConfig(format!(
                "audit.retention_days ({}) must be between 1 and {}",
                self.audit.retention_days, MAX_RETENTION_DAYS
            )));
        }

        let safe: BTreeSet<&str> = self
            .operations
            .safe_operations
            .iter()
            .map(String::as_str)
            .collect();
        let overlap: Vec<&str> = self
            .operations
            .risky_operations
            .iter()
            .map(String::as_str)
            .filter(|op| safe.contains(op))
            .collect();
        if !overlap.is_empty() {
            return Err(FleetError::FatalConfig(format!(
                "operations listed as both safe and risky: {}",
                overlap.join(", ")
            )));
        }

        for naming in &self.environment.naming_patterns {
            regex::Regex::new(&naming.pattern).map_err(|e| {
                FleetError::FatalConfig(format!(
                    "invalid naming pattern '{}': {}",
                    naming.pattern, e
                ))
            })?;
        }
        Ok(())
    }

    /// Resolve the target registry from inline targets, target groups and the optional
    /// targets file.
    pub fn target_registry(&self) -> Result<TargetRegistry, FleetError> {
        let mut units: Vec<TargetUnit> = self.targets.clone();
        units.extend(expand_groups(&self.target_groups));

        if let Some(path) = &self.targets_file {
            let file = load_targets_file(path)?;
            units.extend(file.targets);
            units.extend(expand_groups(&file.target_groups));
        }

        let mut seen = BTreeSet::new();
        let mut registry = Vec::with_capacity(units.len());
        for unit in units {
            if !is_account_id(&unit.account_id) {
                return Err(FleetError::FatalConfig(format!(
                    "target account '{}' is not a 12-digit AWS account id",
                    unit.account_id
                )));
            }
            if unit.region.trim().is_empty() {
                return Err(FleetError::FatalConfig(format!(
                    "target for account {} has an empty region",
                    unit.account_id
                )));
            }
            if seen.insert(unit.clone()) {
                registry.push(unit);
            } else {
                warn!("Duplicate target unit {} ignored", unit);
            }
        }

        if registry.is_empty() {
            return Err(FleetError::FatalConfig(
                "target registry is empty: configure targets, target_groups or targets_file"
                    .to_string(),
            ));
        }

        Ok(TargetRegistry { units: registry })
    }
}

fn expand_groups(groups: &[TargetGroup]) -> Vec<TargetUnit> {
    groups
        .iter()
        .flat_map(|group| {
            group.accounts.iter().flat_map(move |account| {
                group
                    .regions
                    .iter()
                    .map(move |region| TargetUnit::new(account, region))
            })
        })
        .collect()
}

fn load_targets_file(path: &Path) -> Result<TargetsFile, FleetError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        FleetError::FatalConfig(format!(
            "failed to read targets file {}: {}",
            path.display(),
            e
        ))
    })?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );

    if is_yaml {
        serde_yaml::from_str(&contents).map_err(|e| {
            FleetError::FatalConfig(format!("invalid targets file {}: {}", path.display(), e))
        })
    } else {
        toml::from_str(&contents).map_err(|e| {
            FleetError::FatalConfig(format!("invalid targets file {}: {}", path.display(), e))
        })
    }
}

fn is_account_id(value: &str) -> bool {
    value.len() == 12 && value.chars().all(|c| c.is_ascii_digit())
}
