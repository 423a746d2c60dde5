use aws_credential_types::Credentials;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

use super::aws_services::{
    AssumeRoleRequest, ClientFactory, DatabaseApi, RoleAssumer, SecretSource,
};
use super::error::{AccessError, AccessErrorKind};
use super::sdk_errors;
use super::state::TargetUnit;
use crate::app::fleet_config::FleetConfig;

/// Temporary credentials obtained for one target account
#[derive(Debug, Clone)]
pub struct AccountCredentials {
    pub account_id: String,
    pub role_name: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: DateTime<Utc>,
}

impl AccountCredentials {
    /// Check if credentials are expired or will expire within the next 5 minutes
    pub fn is_expired(&self) -> bool {
        let now = Utc::now();
        let buffer = chrono::Duration::minutes(5);
        now + buffer >= self.expiration
    }

    /// Create AWS SDK Credentials from this account's credentials
    pub fn to_aws_credentials(&self) -> Credentials {
        Credentials::from_keys(
            &self.access_key_id,
            &self.secret_access_key,
            Some(self.session_token.clone()),
        )
    }
}

/// A database client bound to one unit.
#[derive(Clone)]
pub struct ScopedClient {
    pub unit: TargetUnit,
    pub api: Arc<dyn DatabaseApi>,
    /// Role ARN used, `None` for the home account shortcut
    pub assumed_role: Option<String>,
}

impl std::fmt::Debug for ScopedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedClient")
            .field("unit", &self.unit)
            .field("assumed_role", &self.assumed_role)
            .finish()
    }
}

/// Process-wide memoized external id.
///
/// Initialized on first use from the configured source. A failed load leaves the cell
/// empty so the next caller retries.
pub struct ExternalIdProvider {
    source: Option<Arc<dyn SecretSource>>,
    cell: OnceCell<String>,
}

impl ExternalIdProvider {
    pub fn new(source: Option<Arc<dyn SecretSource>>) -> Self {
        Self {
            source,
            cell: OnceCell::new(),
        }
    }

    /// Provider for deployments whose trust policies don't require an external id.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub async fn get(&self) -> anyhow::Result<Option<String>> {
        let Some(source) = &self.source else {
            return Ok(None);
        };
        let value = self
            .cell
            .get_or_try_init(|| async {
                debug!("Loading external id for cross-account role assumption");
                source.load_secret().await
            })
            .await?;
        Ok(Some(value.clone()))
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }
}

/// Resolves scoped clients for (account, region) units.
///
/// Assumed-role credentials are cached per account; all regions of an account share
/// one session.
pub struct CredentialBroker {
    config: Arc<FleetConfig>,
    role_assumer: Arc<dyn RoleAssumer>,
    client_factory: Arc<dyn ClientFactory>,
    external_id: Arc<ExternalIdProvider>,
    credential_cache: Arc<RwLock<HashMap<String, AccountCredentials>>>,
}

impl CredentialBroker {
    pub fn new(
        config: Arc<FleetConfig>,
        role_assumer: Arc<dyn RoleAssumer>,
        client_factory: Arc<dyn ClientFactory>,
        external_id: Arc<ExternalIdProvider>,
    ) -> Self {
        Self {
            config,
            role_assumer,
            client_factory,
            external_id,
            credential_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn role_arn(&self, account_id: &str) -> String {
        format!("arn:aws:iam::{}:role/{}", account_id, self.config.role_name)
    }

    /// Resolve a client for one unit. Every failure is returned as a classified
    /// [`AccessError`] for that unit.
    pub async fn resolve(
        &self,
        account_id: &str,
        region: &str,
    ) -> Result<ScopedClient, AccessError> {
        let unit = TargetUnit::new(account_id, region);

        if account_id == self.config.home_account_id {
            debug!("Using home account identity for {}", unit);
            return Ok(ScopedClient {
                api: self.client_factory.direct_client(region),
                unit,
                assumed_role: None,
            });
        }

        let credentials = self.credentials_for_account(&unit).await?;
        Ok(ScopedClient {
            api: self.client_factory.client_with_credentials(region, &credentials),
            unit,
            assumed_role: Some(self.role_arn(account_id)),
        })
    }

    async fn credentials_for_account(
        &self,
        unit: &TargetUnit,
    ) -> Result<AccountCredentials, AccessError> {
        if let Some(cached) = self.get_cached_credentials(&unit.account_id).await {
            if !cached.is_expired() {
                debug!("Using cached credentials for account: {}", unit.account_id);
                return Ok(cached);
            }
            debug!(
                "Cached credentials for account {} are expired, assuming role again",
                unit.account_id
            );
        }

        let external_id = self.external_id.get().await.map_err(|e| {
            warn!("Failed to load external id: {:#}", e);
            sdk_errors::access_error_of_kind(
                AccessErrorKind::ServiceError,
                unit,
                &self.config.role_name,
                &format!("failed to load external id: {:#}", e),
            )
        })?;

        let request = AssumeRoleRequest {
            account_id: unit.account_id.clone(),
            role_arn: self.role_arn(&unit.account_id),
            session_name: format!("dbfleet-{}", unit.account_id),
            external_id,
            duration_seconds: self.config.discovery.session_duration_secs,
        };

        let credentials = self.role_assumer.assume_role(&request).await.map_err(|e| {
            let text = sdk_errors::error_text(&e);
            let err = sdk_errors::access_error(unit, &self.config.role_name, &text);
            warn!(
                "AssumeRole into {} failed ({}): {}",
                request.role_arn, err.kind, err.message
            );
            err
        })?;

        self.cache_credentials(&credentials).await;
        Ok(credentials)
    }

    async fn get_cached_credentials(&self, account_id: &str) -> Option<AccountCredentials> {
        let cache = self.credential_cache.read().await;
        cache.get(account_id).cloned()
    }

    async fn cache_credentials(&self, credentials: &AccountCredentials) {
        let mut cache = self.credential_cache.write().await;
        cache.insert(credentials.account_id.clone(), credentials.clone());
        debug!(
            "Cached credentials for account: {} using role: {}",
            credentials.account_id, credentials.role_name
        );
    }

    /// Clear expired credentials from cache
    pub async fn cleanup_expired_credentials(&self) -> usize {
        let mut cache = self.credential_cache.write().await;
        let initial_count = cache.len();

        cache.retain(|account_id, creds| {
            let expired = creds.is_expired();
            if expired {
                debug!("Removing expired credentials for account: {}", account_id);
            }
            !expired
        });

        let removed_count = initial_count - cache.len();
        if removed_count > 0 {
            info!("Cleaned up {} expired credential entries", removed_count);
        }

        removed_count
    }

    /// Get cache statistics for monitoring
    pub async fn cache_stats(&self) -> CredentialCacheStats {
        let cache = self.credential_cache.read().await;
        let total_entries = cache.len();
        let expired_entries = cache.values().filter(|c| c.is_expired()).count();

        CredentialCacheStats {
            total_entries,
            valid_entries: total_entries - expired_entries,
            expired_entries,
        }
    }
}

/// Statistics about the credential cache
#[derive(Debug, Clone)]
pub struct CredentialCacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
}
