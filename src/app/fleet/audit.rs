use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use super::authorization::Identity;
use super::executor::OperationOutcome;
use super::kv_store::KeyValueStore;
use super::state::Environment;
use crate::app::fleet_config::MAX_RETENTION_DAYS;

const AUDIT_PREFIX: &str = "audit#";

/// One operation attempt. Written once, never modified, expires after the retention
/// window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationAuditRecord {
    pub audit_id: Uuid,
    pub operation: String,
    pub instance_id: String,
    pub account_id: Option<String>,
    pub region: Option<String>,
    pub environment: Option<Environment>,
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub identity: Identity,
    pub outcome: OperationOutcome,
    pub message: String,
    pub duration_seconds: f64,
    pub recorded_at: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
}

pub struct AuditLog {
    store: Arc<dyn KeyValueStore>,
    retention_days: i64,
}

impl AuditLog {
    /// `retention_days` is clamped to `1..=MAX_RETENTION_DAYS`.
    pub fn new(store: Arc<dyn KeyValueStore>, retention_days: i64) -> Self {
        Self {
            store,
            retention_days: retention_days.clamp(1, MAX_RETENTION_DAYS),
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.unsigned_abs() * 24 * 60 * 60)
    }

    /// Expiry timestamp for a record written at `recorded_at`.
    pub fn expiry_for(&self, recorded_at: DateTime<Utc>) -> DateTime<Utc> {
        recorded_at + chrono::Duration::days(self.retention_days)
    }

    pub async fn append(&self, record: &OperationAuditRecord) -> Result<()> {
        let value = serde_json::to_value(record).context("Failed to serialize audit record")?;
        self.store
            .put(
                &format!("{}{}", AUDIT_PREFIX, record.audit_id),
                value,
                Some(self.retention()),
            )
            .await
            .with_context(|| format!("Failed to write audit record {}", record.audit_id))
    }

    /// Audit records of one instance, newest first.
    pub async fn history(&self, instance_id: &str) -> Result<Vec<OperationAuditRecord>> {
        let mut records: Vec<OperationAuditRecord> = self
            .store
            .scan_prefix(AUDIT_PREFIX)
            .await?
            .into_iter()
            .filter_map(|(key, value)| {
                match serde_json::from_value::<OperationAuditRecord>(value) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!("Skipping unreadable audit item {}: {}", key, e);
                        None
                    }
                }
            })
            .filter(|record| record.instance_id == instance_id)
            .collect();
        records.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::fleet::kv_store::MemoryStore;

    fn record(instance_id: &str, minutes_ago: i64) -> OperationAuditRecord {
        let recorded_at = Utc::now() - chrono::Duration::minutes(minutes_ago);
        OperationAuditRecord {
            audit_id: Uuid::new_v4(),
            operation: "create_snapshot".to_string(),
            instance_id: instance_id.to_string(),
            account_id: Some("222222222222".to_string()),
            region: Some("us-east-1".to_string()),
            environment: Some(Environment::Development),
            parameters: BTreeMap::new(),
            identity: Identity::new("alice", ["execute_operations"]),
            outcome: OperationOutcome::Completed,
            message: "snapshot available".to_string(),
            duration_seconds: 12.5,
            recorded_at,
            expiry: recorded_at + chrono::Duration::days(90),
        }
    }

    #[tokio::test]
    async fn test_history_newest_first_and_filtered() {
        let log = AuditLog::new(Arc::new(MemoryStore::new()), 90);
        let older = record("orders-db", 10);
        let newer = record("orders-db", 1);
        log.append(&older).await.unwrap();
        log.append(&newer).await.unwrap();
        log.append(&record("billing-db", 5)).await.unwrap();

        let history = log.history("orders-db").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].audit_id, newer.audit_id);
        assert_eq!(history[1].audit_id, older.audit_id);
    }

    #[test]
    fn test_retention_window() {
        let log = AuditLog::new(Arc::new(MemoryStore::new()), 90);
        assert_eq!(log.retention(), Duration::from_secs(90 * 86_400));
        let now = Utc::now();
        assert_eq!(log.expiry_for(now) - now, chrono::Duration::days(90));
    }

    #[test]
    fn test_retention_clamped_to_supported_range() {
        let now = Utc::now();

        let log = AuditLog::new(Arc::new(MemoryStore::new()), 0);
        assert_eq!(log.retention(), Duration::from_secs(86_400));
        assert!(log.expiry_for(now) > now);

        let log = AuditLog::new(Arc::new(MemoryStore::new()), i64::MAX);
        assert_eq!(
            log.expiry_for(now) - now,
            chrono::Duration::days(MAX_RETENTION_DAYS)
        );
    }
}
