use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_sdk_sts as sts;
use aws_sdk_sts::error::DisplayErrorContext;
use chrono::{DateTime, Utc};

use super::super::credentials::AccountCredentials;

/// Parameters of one cross-account `AssumeRole` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssumeRoleRequest {
    pub account_id: String,
    pub role_arn: String,
    pub session_name: String,
    pub external_id: Option<String>,
    pub duration_seconds: i32,
}

/// Obtains temporary credentials in another account.
#[async_trait]
pub trait RoleAssumer: Send + Sync {
    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<AccountCredentials>;
}

pub struct StsRoleAssumer {
    client: sts::Client,
    role_name: String,
}

impl StsRoleAssumer {
    pub fn new(client: sts::Client, role_name: impl Into<String>) -> Self {
        Self {
            client,
            role_name: role_name.into(),
        }
    }
}

#[async_trait]
impl RoleAssumer for StsRoleAssumer {
    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<AccountCredentials> {
        let response = self
            .client
            .assume_role()
            .role_arn(&request.role_arn)
            .role_session_name(&request.session_name)
            .set_external_id(request.external_id.clone())
            .duration_seconds(request.duration_seconds)
            .send()
            .await
            .map_err(|e| anyhow!("{}", DisplayErrorContext(&e)))?;

        let credentials = response
            .credentials
            .context("AssumeRole response did not include credentials")?;

        let expiration = credentials.expiration();
        let expiration: DateTime<Utc> =
            DateTime::from_timestamp(expiration.secs(), expiration.subsec_nanos())
                .context("AssumeRole returned an out-of-range expiration")?;

        Ok(AccountCredentials {
            account_id: request.account_id.clone(),
            role_name: self.role_name.clone(),
            access_key_id: credentials.access_key_id().to_string(),
            secret_access_key: credentials.secret_access_key().to_string(),
            session_token: credentials.session_token().to_string(),
            expiration,
        })
    }
}
