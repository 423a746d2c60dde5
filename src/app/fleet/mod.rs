//! Fleet engine: discovery, reconciled inventory, refresh-ahead cache, and authorized
//! operations with an audit trail.
//!
//! # Data flow
//!
//! ```text
//! Target registry → CredentialBroker → DiscoveryScanner → InventoryStore
//!                                                          ↑
//!                                         DiscoveryCache (front)
//!
//! OperationRequest → InventoryStore (lookup) → AuthorizationEngine
//!                  → OperationExecutor → AuditLog
//! ```
//!
//! [`FleetService`] owns one instance of each component. All of them share the same
//! immutable `Arc<FleetConfig>`.

pub mod audit;
pub mod authorization;
pub mod aws_services;
pub mod cache;
pub mod credentials;
pub mod error;
pub mod executor;
pub mod inventory;
pub mod kv_store;
pub mod normalizer;
pub mod scanner;
pub mod sdk_errors;
pub mod state;

pub use audit::{AuditLog, OperationAuditRecord};
pub use authorization::{
    AuthorizationDecision, AuthorizationEngine, DenialReason, EnvironmentClassifier, Identity,
    OperationRequest, OperationState, OperationType, RiskTier,
};
pub use cache::{CacheResponse, CacheState, DiscoveryCache, DiscoverySource};
pub use credentials::{CredentialBroker, ExternalIdProvider};
pub use error::{AccessError, AccessErrorKind, FleetError, PartialRunError};
pub use executor::{ExecutionReport, OperationExecutor, OperationOutcome, OperationResult};
pub use inventory::InventoryStore;
pub use kv_store::{JsonFileStore, KeyValueStore, MemoryStore};
pub use scanner::DiscoveryScanner;
pub use state::{
    DiscoveryError, DiscoveryRun, Environment, FleetSnapshot, InstanceRecord,
    ReconciliationReport, TargetUnit,
};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_types::region::Region;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::fleet_config::{ExternalIdSource, FleetConfig};
use aws_services::{
    AwsClientFactory, ClientFactory, EnvSecret, LiteralSecret, RoleAssumer, SecretSource,
    SecretsManagerSource, StsRoleAssumer,
};
use normalizer::RdsInstanceNormalizer;

/// External collaborators of the engine.
pub struct FleetDependencies {
    pub role_assumer: Arc<dyn RoleAssumer>,
    pub client_factory: Arc<dyn ClientFactory>,
    pub external_id: Arc<ExternalIdProvider>,
    pub store: Arc<dyn KeyValueStore>,
}

/// Registry → scope → scan → reconcile, as the cache's backend.
pub struct FleetDiscovery {
    config: Arc<FleetConfig>,
    broker: Arc<CredentialBroker>,
    scanner: DiscoveryScanner,
    inventory: Arc<InventoryStore>,
}

impl FleetDiscovery {
    /// Run one discovery pass for a scope key (`all` or an account id).
    ///
    /// The target registry is resolved on every pass; failing to resolve it is the only
    /// error this returns besides an unknown scope.
    pub async fn run(&self, key: &str) -> Result<FleetSnapshot, FleetError> {
        let registry = self.config.target_registry()?;
        let units = registry.units_for_scope(key)?;
        self.broker.cleanup_expired_credentials().await;

        let run = self.scanner.discover(&units).await;
        if let Some(partial) = run.partial_error() {
            warn!("Discovery '{}': {}", key, partial);
        }
        let reconciliation = self.inventory.persist(&run).await;

        Ok(FleetSnapshot {
            scope: key.to_string(),
            run,
            reconciliation,
        })
    }
}

#[async_trait]
impl DiscoverySource for FleetDiscovery {
    async fn load(&self, key: &str) -> Result<FleetSnapshot, FleetError> {
        self.run(key).await
    }
}

pub struct FleetService {
    config: Arc<FleetConfig>,
    discovery: Arc<FleetDiscovery>,
    cache: DiscoveryCache,
    inventory: Arc<InventoryStore>,
    classifier: Arc<EnvironmentClassifier>,
    authorization: AuthorizationEngine,
    executor: OperationExecutor,
    audit: AuditLog,
}

impl FleetService {
    pub fn new(config: FleetConfig, deps: FleetDependencies) -> Result<Self, FleetError> {
        config.validate()?;
        let config = Arc::new(config);

        let classifier = Arc::new(EnvironmentClassifier::from_rules(&config.environment)?);
        let broker = Arc::new(CredentialBroker::new(
            Arc::clone(&config),
            deps.role_assumer,
            deps.client_factory,
            deps.external_id,
        ));
        let inventory = Arc::new(InventoryStore::new(Arc::clone(&deps.store)));
        let scanner = DiscoveryScanner::new(
            Arc::clone(&config),
            Arc::clone(&broker),
            Arc::new(RdsInstanceNormalizer::new(Arc::clone(&classifier))),
        );
        let discovery = Arc::new(FleetDiscovery {
            config: Arc::clone(&config),
            broker: Arc::clone(&broker),
            scanner,
            inventory: Arc::clone(&inventory),
        });
        let cache = DiscoveryCache::new(
            discovery.clone(),
            &config.cache,
            config.discovery.run_timeout(),
        );

        Ok(Self {
            authorization: AuthorizationEngine::new(Arc::clone(&config)),
            executor: OperationExecutor::new(Arc::clone(&config), Arc::clone(&broker)),
            audit: AuditLog::new(deps.store, config.audit.retention_days),
            config,
            discovery,
            cache,
            inventory,
            classifier,
        })
    }

    /// Build against real AWS endpoints using the default credential chain.
    pub async fn from_aws(
        config: FleetConfig,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self, FleetError> {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest()).load().await;

        let role_assumer = Arc::new(StsRoleAssumer::new(
            aws_sdk_sts::Client::new(&sdk_config),
            config.role_name.clone(),
        ));

        let secret: Option<Arc<dyn SecretSource>> = match &config.external_id {
            ExternalIdSource::None => None,
            ExternalIdSource::Literal { value } => Some(Arc::new(LiteralSecret(value.clone()))),
            ExternalIdSource::Env { variable } => Some(Arc::new(EnvSecret {
                variable: variable.clone(),
            })),
            ExternalIdSource::SecretsManager { secret_id, region } => {
                let mut builder = aws_sdk_secretsmanager::config::Builder::from(&sdk_config);
                if let Some(region) = region {
                    builder = builder.region(Region::new(region.clone()));
                }
                let client = aws_sdk_secretsmanager::Client::from_conf(builder.build());
                Some(Arc::new(SecretsManagerSource::new(client, secret_id.clone())))
            }
        };

        Self::new(
            config,
            FleetDependencies {
                role_assumer,
                client_factory: Arc::new(AwsClientFactory::new(sdk_config)),
                external_id: Arc::new(ExternalIdProvider::new(secret)),
                store,
            },
        )
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Cached discovery for a scope key.
    pub async fn discover(&self, key: &str) -> CacheResponse {
        self.cache.get(key).await
    }

    /// Uncached discovery pass; the result also primes the cache unless every unit
    /// failed.
    pub async fn run_discovery(&self, key: &str) -> Result<FleetSnapshot, FleetError> {
        let snapshot = self.discovery.run(key).await?;
        if !snapshot.run.all_units_failed() {
            self.cache.prime(key, &snapshot);
        }
        Ok(snapshot)
    }

    pub fn cache(&self) -> &DiscoveryCache {
        &self.cache
    }

    pub fn inventory(&self) -> &InventoryStore {
        &self.inventory
    }

    /// Authorize, execute and audit one operation request.
    ///
    /// Always returns exactly one outcome. The audit record is written before this
    /// returns; when that write fails the outcome is still reported, with
    /// `audit_write_failed` set.
    pub async fn execute(&self, request: OperationRequest) -> OperationResult {
        let mut states = vec![OperationState::Received];
        log_info!(
            "Operation request from {}: {} on {}",
            request.identity.user_id,
            request.operation_type,
            request.instance_id
        );

        let instance = match self.inventory.get(&request.instance_id).await {
            Ok(Some(record)) if !record.is_removed() => Some(record),
            Ok(_) => None,
            Err(e) => {
                log_warn!("Inventory lookup for {} failed: {:#}", request.instance_id, e);
                None
            }
        };

        let Some(instance) = instance else {
            let reason = DenialReason::UnknownInstance {
                instance_id: request.instance_id.clone(),
            };
            states.push(OperationState::Denied);
            return self
                .finish(&request, None, denied(reason), states)
                .await;
        };

        let environment = self.classifier.classify_record(&instance);
        states.push(OperationState::EnvironmentClassified);

        let decision = self.authorization.authorize(
            environment,
            &request.operation_type,
            &request.identity,
            &request.parameters,
        );

        let authorized = match decision {
            AuthorizationDecision::Authorized(authorized) => {
                states.push(OperationState::RiskClassified);
                states.push(OperationState::Authorized);
                authorized
            }
            AuthorizationDecision::Denied(reason) => {
                if !matches!(reason, DenialReason::UnsupportedOperation { .. }) {
                    states.push(OperationState::RiskClassified);
                }
                states.push(OperationState::Denied);
                log_warn!(
                    "Denied {} on {} for {}: {}",
                    request.operation_type,
                    request.instance_id,
                    request.identity.user_id,
                    reason
                );
                return self
                    .finish(
                        &request,
                        Some((&instance, environment)),
                        denied(reason),
                        states,
                    )
                    .await;
            }
        };

        states.push(OperationState::Executing);
        let report = self
            .executor
            .execute(&instance, authorized.operation, &request.parameters)
            .await;
        states.push(report.outcome.final_state());

        self.finish(&request, Some((&instance, environment)), report, states)
            .await
    }

    async fn finish(
        &self,
        request: &OperationRequest,
        target: Option<(&InstanceRecord, Environment)>,
        report: ExecutionReport,
        states: Vec<OperationState>,
    ) -> OperationResult {
        let recorded_at = Utc::now();
        let record = OperationAuditRecord {
            audit_id: Uuid::new_v4(),
            operation: request.operation_type.clone(),
            instance_id: request.instance_id.clone(),
            account_id: target.map(|(i, _)| i.account_id.clone()),
            region: target.map(|(i, _)| i.region.clone()),
            environment: target.map(|(_, env)| env),
            parameters: request.parameters.clone(),
            identity: request.identity.clone(),
            outcome: report.outcome,
            message: report.message.clone(),
            duration_seconds: report.duration_seconds,
            recorded_at,
            expiry: self.audit.expiry_for(recorded_at),
        };

        let audit_write_failed = match self.audit.append(&record).await {
            Ok(()) => false,
            Err(e) => {
                log_error!(
                    "Audit write for {} on {} failed: {:#}",
                    request.operation_type,
                    request.instance_id,
                    e
                );
                true
            }
        };

        info!(
            "Operation {} on {} by {}: {} ({:.1}s)",
            request.operation_type,
            request.instance_id,
            request.identity.user_id,
            report.outcome,
            report.duration_seconds
        );

        OperationResult {
            instance_id: request.instance_id.clone(),
            operation: request.operation_type.clone(),
            outcome: report.outcome,
            message: report.message,
            environment: record.environment,
            duration_seconds: report.duration_seconds,
            final_status: report.final_status,
            audit_id: record.audit_id,
            audit_write_failed,
            states,
        }
    }

    pub async fn audit_history(
        &self,
        instance_id: &str,
    ) -> anyhow::Result<Vec<OperationAuditRecord>> {
        self.audit.history(instance_id).await
    }
}

fn denied(reason: DenialReason) -> ExecutionReport {
    ExecutionReport {
        outcome: OperationOutcome::Denied,
        message: reason.to_string(),
        final_status: None,
        duration_seconds: 0.0,
    }
}
