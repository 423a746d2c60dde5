use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_sdk_secretsmanager as secretsmanager;
use aws_sdk_secretsmanager::error::DisplayErrorContext;

/// A single secret value, read on demand.
#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn load_secret(&self) -> Result<String>;
}

pub struct LiteralSecret(pub String);

#[async_trait]
impl SecretSource for LiteralSecret {
    async fn load_secret(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

pub struct EnvSecret {
    pub variable: String,
}

#[async_trait]
impl SecretSource for EnvSecret {
    async fn load_secret(&self) -> Result<String> {
        let value = std::env::var(&self.variable)
            .with_context(|| format!("environment variable {} is not set", self.variable))?;
        if value.trim().is_empty() {
            return Err(anyhow!("environment variable {} is empty", self.variable));
        }
        Ok(value)
    }
}

pub struct SecretsManagerSource {
    client: secretsmanager::Client,
    secret_id: String,
}

impl SecretsManagerSource {
    pub fn new(client: secretsmanager::Client, secret_id: impl Into<String>) -> Self {
        Self {
            client,
            secret_id: secret_id.into(),
        }
    }
}

#[async_trait]
impl SecretSource for SecretsManagerSource {
    async fn load_secret(&self) -> Result<String> {
        let response = self
            .client
            .get_secret_value()
            .secret_id(&self.secret_id)
            .send()
            .await
            .map_err(|e| {
                anyhow!(
                    "GetSecretValue failed for {}: {}",
                    self.secret_id,
                    DisplayErrorContext(&e)
                )
            })?;

        response
            .secret_string
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| anyhow!("secret {} has no string value", self.secret_id))
    }
}
