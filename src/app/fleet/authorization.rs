//! Environment classification and the operation authorization rule.
//!
//! An operation request moves through
//! `Received → EnvironmentClassified → RiskClassified → Authorized | Denied`, and an
//! authorized request continues in the executor with
//! `Executing → Completed | Failed | TimedOut`. The classifier is an ordered list of
//! pure strategies; the first one that returns an environment wins.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use super::error::FleetError;
use super::state::{Environment, InstanceRecord};
use crate::app::fleet_config::{EnvironmentRules, FleetConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    CreateSnapshot,
    ModifyBackupWindow,
    EnableStorageAutoscaling,
    StopInstance,
    StartInstance,
    RebootInstance,
    ModifyStorage,
}

impl OperationType {
    pub const ALL: [OperationType; 7] = [
        OperationType::CreateSnapshot,
        OperationType::ModifyBackupWindow,
        OperationType::EnableStorageAutoscaling,
        OperationType::StopInstance,
        OperationType::StartInstance,
        OperationType::RebootInstance,
        OperationType::ModifyStorage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::CreateSnapshot => "create_snapshot",
            OperationType::ModifyBackupWindow => "modify_backup_window",
            OperationType::EnableStorageAutoscaling => "enable_storage_autoscaling",
            OperationType::StopInstance => "stop_instance",
            OperationType::StartInstance => "start_instance",
            OperationType::RebootInstance => "reboot_instance",
            OperationType::ModifyStorage => "modify_storage",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == name)
    }

    /// Operations whose effect is only visible after polling the provider.
    pub fn has_async_completion(&self) -> bool {
        matches!(
            self,
            OperationType::CreateSnapshot
                | OperationType::StopInstance
                | OperationType::StartInstance
                | OperationType::RebootInstance
        )
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Safe,
    Risky,
}

/// Caller identity, verified upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub role_memberships: BTreeSet<String>,
}

impl Identity {
    pub fn new<I, S>(user_id: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            user_id: user_id.into(),
            role_memberships: roles.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_any_role(&self, roles: &[String]) -> bool {
        roles.iter().any(|r| self.role_memberships.contains(r))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    pub instance_id: String,
    pub operation_type: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub identity: Identity,
    pub timestamp: DateTime<Utc>,
}

impl OperationRequest {
    pub fn new(
        instance_id: impl Into<String>,
        operation_type: impl Into<String>,
        identity: Identity,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            operation_type: operation_type.into(),
            parameters: BTreeMap::new(),
            identity,
            timestamp: Utc::now(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

/// Progress of one operation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Received,
    EnvironmentClassified,
    RiskClassified,
    Authorized,
    Denied,
    Executing,
    Completed,
    Failed,
    TimedOut,
}

/// What a classification strategy may look at.
#[derive(Debug, Clone, Copy)]
pub struct ClassificationSubject<'a> {
    pub instance_id: &'a str,
    pub account_id: &'a str,
    pub tags: &'a BTreeMap<String, String>,
}

impl<'a> From<&'a InstanceRecord> for ClassificationSubject<'a> {
    fn from(record: &'a InstanceRecord) -> Self {
        Self {
            instance_id: &record.instance_id,
            account_id: &record.account_id,
            tags: &record.tags,
        }
    }
}

pub trait EnvironmentStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn classify(&self, subject: &ClassificationSubject<'_>) -> Option<Environment>;
}

/// Environment tag under any of the configured key spellings.
pub struct TagMatchStrategy {
    tag_keys: Vec<String>,
    value_aliases: HashMap<String, Environment>,
}

impl EnvironmentStrategy for TagMatchStrategy {
    fn name(&self) -> &'static str {
        "tag_match"
    }

    fn classify(&self, subject: &ClassificationSubject<'_>) -> Option<Environment> {
        self.tag_keys.iter().find_map(|key| {
            subject
                .tags
                .get(key)
                .and_then(|value| self.value_aliases.get(&value.trim().to_lowercase()))
                .copied()
        })
    }
}

/// Operator-maintained instance and account mappings. Instance entries win.
pub struct ExplicitMappingStrategy {
    instances: HashMap<String, Environment>,
    accounts: HashMap<String, Environment>,
}

impl EnvironmentStrategy for ExplicitMappingStrategy {
    fn name(&self) -> &'static str {
        "explicit_mapping"
    }

    fn classify(&self, subject: &ClassificationSubject<'_>) -> Option<Environment> {
        self.instances
            .get(subject.instance_id)
            .or_else(|| self.accounts.get(subject.account_id))
            .copied()
    }
}

pub struct NamingPatternStrategy {
    patterns: Vec<(Regex, Environment)>,
}

impl EnvironmentStrategy for NamingPatternStrategy {
    fn name(&self) -> &'static str {
        "naming_pattern"
    }

    fn classify(&self, subject: &ClassificationSubject<'_>) -> Option<Environment> {
        let id = subject.instance_id.to_lowercase();
        self.patterns
            .iter()
            .find(|(regex, _)| regex.is_match(&id))
            .map(|(_, env)| *env)
    }
}

pub struct EnvironmentClassifier {
    strategies: Vec<Box<dyn EnvironmentStrategy>>,
}

impl EnvironmentClassifier {
    pub fn from_rules(rules: &EnvironmentRules) -> Result<Self, FleetError> {
        let patterns = rules
            .naming_patterns
            .iter()
            .map(|naming| {
                Regex::new(&naming.pattern)
                    .map(|regex| (regex, naming.environment))
                    .map_err(|e| {
                        FleetError::FatalConfig(format!(
                            "invalid naming pattern '{}': {}",
                            naming.pattern, e
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let value_aliases = rules
            .value_aliases
            .iter()
            .map(|(alias, env)| (alias.to_lowercase(), *env))
            .collect();

        Ok(Self {
            strategies: vec![
                Box::new(TagMatchStrategy {
                    tag_keys: rules.tag_keys.clone(),
                    value_aliases,
                }),
                Box::new(ExplicitMappingStrategy {
                    instances: rules.instance_environments.clone(),
                    accounts: rules.account_environments.clone(),
                }),
                Box::new(NamingPatternStrategy { patterns }),
            ],
        })
    }

    pub fn classify(&self, subject: &ClassificationSubject<'_>) -> Environment {
        for strategy in &self.strategies {
            if let Some(env) = strategy.classify(subject) {
                tracing::trace!(
                    "{} classified {} as {} via {}",
                    subject.account_id,
                    subject.instance_id,
                    env,
                    strategy.name()
                );
                return env;
            }
        }
        Environment::Unknown
    }

    pub fn classify_record(&self, record: &InstanceRecord) -> Environment {
        self.classify(&ClassificationSubject::from(record))
    }
}

/// Why a request was refused. Rendered verbatim to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenialReason {
    UnknownInstance {
        instance_id: String,
    },
    UnsupportedOperation {
        operation: String,
    },
    MissingCapability {
        required_roles: Vec<String>,
    },
    MissingElevatedRole {
        environment: Environment,
        operation: String,
        required_roles: Vec<String>,
    },
    MissingConfirmation {
        environment: Environment,
        operation: String,
        parameter: String,
    },
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::UnknownInstance { instance_id } => {
                write!(f, "instance '{}' is not in the inventory", instance_id)
            }
            DenialReason::UnsupportedOperation { operation } => {
                write!(f, "operation '{}' is not supported", operation)
            }
            DenialReason::MissingCapability { required_roles } => write!(
                f,
                "missing execute_operations capability: requires membership in one of [{}]",
                required_roles.join(", ")
            ),
            DenialReason::MissingElevatedRole {
                environment,
                operation,
                required_roles,
            } => write!(
                f,
                "{} on a {} instance requires elevated privilege: membership in one of [{}]",
                operation,
                environment,
                required_roles.join(", ")
            ),
            DenialReason::MissingConfirmation {
                environment,
                operation,
                parameter,
            } => write!(
                f,
                "{} on a {} instance requires explicit confirmation: set parameter '{}' to true",
                operation, environment, parameter
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizedOperation {
    pub operation: OperationType,
    pub environment: Environment,
    pub risk_tier: RiskTier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AuthorizationDecision {
    Authorized(AuthorizedOperation),
    Denied(DenialReason),
}

impl AuthorizationDecision {
    pub fn is_authorized(&self) -> bool {
        matches!(self, AuthorizationDecision::Authorized(_))
    }
}

pub struct AuthorizationEngine {
    config: Arc<FleetConfig>,
}

impl AuthorizationEngine {
    pub fn new(config: Arc<FleetConfig>) -> Self {
        Self { config }
    }

    pub fn risk_tier(&self, operation: OperationType) -> Option<RiskTier> {
        let settings = &self.config.operations;
        let name = operation.as_str();
        if settings.safe_operations.iter().any(|op| op == name) {
            Some(RiskTier::Safe)
        } else if settings.risky_operations.iter().any(|op| op == name) {
            Some(RiskTier::Risky)
        } else {
            None
        }
    }

    pub fn confirmation_given(&self, parameters: &BTreeMap<String, serde_json::Value>) -> bool {
        match parameters.get(&self.config.operations.confirmation_parameter) {
            Some(serde_json::Value::Bool(flag)) => *flag,
            Some(serde_json::Value::String(text)) => {
                matches!(text.trim().to_lowercase().as_str(), "true" | "yes")
            }
            _ => false,
        }
    }

    pub fn authorize(
        &self,
        environment: Environment,
        operation: &str,
        identity: &Identity,
        parameters: &BTreeMap<String, serde_json::Value>,
    ) -> AuthorizationDecision {
        let settings = &self.config.operations;

        let Some((op, tier)) =
            OperationType::from_name(operation).and_then(|op| self.risk_tier(op).map(|t| (op, t)))
        else {
            return AuthorizationDecision::Denied(DenialReason::UnsupportedOperation {
                operation: operation.to_string(),
            });
        };

        let has_base = identity.has_any_role(&settings.execute_roles)
            || identity.has_any_role(&settings.elevated_roles);
        if !has_base {
            let mut required_roles = settings.execute_roles.clone();
            required_roles.extend(settings.elevated_roles.iter().cloned());
            return AuthorizationDecision::Denied(DenialReason::MissingCapability {
                required_roles,
            });
        }

        if environment.is_production() && tier == RiskTier::Risky {
            if !identity.has_any_role(&settings.elevated_roles) {
                return AuthorizationDecision::Denied(DenialReason::MissingElevatedRole {
                    environment,
                    operation: op.as_str().to_string(),
                    required_roles: settings.elevated_roles.clone(),
                });
            }
            if !self.confirmation_given(parameters) {
                return AuthorizationDecision::Denied(DenialReason::MissingConfirmation {
                    environment,
                    operation: op.as_str().to_string(),
                    parameter: settings.confirmation_parameter.clone(),
                });
            }
        }

        AuthorizationDecision::Authorized(AuthorizedOperation {
            operation: op,
            environment,
            risk_tier: tier,
        })
    }
}
