//! AWS service adapters.
//!
//! Each adapter converts SDK responses into `serde_json::Value` objects keyed with the
//! AWS API member names and sits behind a trait, so the engine can be driven by test
//! doubles without network access.

pub mod rds;
pub mod secrets;
pub mod sts;

pub use rds::{DatabaseApi, InstanceModification, RDSService};
pub use secrets::{EnvSecret, LiteralSecret, SecretSource, SecretsManagerSource};
pub use sts::{AssumeRoleRequest, RoleAssumer, StsRoleAssumer};

use aws_config::SdkConfig;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_types::region::Region;
use std::sync::Arc;

use super::credentials::AccountCredentials;

/// Builds region-scoped database clients.
pub trait ClientFactory: Send + Sync {
    /// Client using the engine's own identity.
    fn direct_client(&self, region: &str) -> Arc<dyn DatabaseApi>;

    /// Client using temporary credentials of another account.
    fn client_with_credentials(
        &self,
        region: &str,
        credentials: &AccountCredentials,
    ) -> Arc<dyn DatabaseApi>;
}

pub struct AwsClientFactory {
    base: SdkConfig,
}

impl AwsClientFactory {
    pub fn new(base: SdkConfig) -> Self {
        Self { base }
    }
}

impl ClientFactory for AwsClientFactory {
    fn direct_client(&self, region: &str) -> Arc<dyn DatabaseApi> {
        let config = aws_sdk_rds::config::Builder::from(&self.base)
            .region(Region::new(region.to_string()))
            .build();
        Arc::new(RDSService::new(aws_sdk_rds::Client::from_conf(config)))
    }

    fn client_with_credentials(
        &self,
        region: &str,
        credentials: &AccountCredentials,
    ) -> Arc<dyn DatabaseApi> {
        let config = aws_sdk_rds::config::Builder::from(&self.base)
            .region(Region::new(region.to_string()))
            .credentials_provider(SharedCredentialsProvider::new(
                credentials.to_aws_credentials(),
            ))
            .build();
        Arc::new(RDSService::new(aws_sdk_rds::Client::from_conf(config)))
    }
}
