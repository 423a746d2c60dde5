use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::authorization::{ClassificationSubject, EnvironmentClassifier};
use super::state::{InstanceRecord, NetworkAttributes, StorageAttributes, TargetUnit};

/// Normalizer for RDS DB instances
pub struct RdsInstanceNormalizer {
    classifier: Arc<EnvironmentClassifier>,
}

impl RdsInstanceNormalizer {
    pub fn new(classifier: Arc<EnvironmentClassifier>) -> Self {
        Self { classifier }
    }

    /// Convert one `DescribeDBInstances` entry into an [`InstanceRecord`] owned by `unit`.
    ///
    /// Fails only when the entry carries no identifier.
    pub fn normalize(
        &self,
        raw: &serde_json::Value,
        unit: &TargetUnit,
        seen_at: DateTime<Utc>,
    ) -> Result<InstanceRecord> {
        let Some(instance_id) = str_field(raw, "DBInstanceIdentifier").filter(|id| !id.is_empty())
        else {
            bail!("DB instance entry without DBInstanceIdentifier");
        };

        let tags = extract_tags(raw);
        let environment = self.classifier.classify(&ClassificationSubject {
            instance_id: &instance_id,
            account_id: &unit.account_id,
            tags: &tags,
        });

        let created_at = raw
            .get("InstanceCreateTime")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let endpoint = raw.get("Endpoint");

        Ok(InstanceRecord {
            instance_id,
            account_id: unit.account_id.clone(),
            region: unit.region.clone(),
            engine: str_field(raw, "Engine").unwrap_or_else(unknown),
            engine_version: str_field(raw, "EngineVersion").unwrap_or_else(unknown),
            instance_class: str_field(raw, "DBInstanceClass").unwrap_or_else(unknown),
            status: str_field(raw, "DBInstanceStatus").unwrap_or_else(unknown),
            storage: StorageAttributes {
                allocated_storage_gb: i32_field(raw, "AllocatedStorage"),
                max_allocated_storage_gb: i32_field(raw, "MaxAllocatedStorage"),
                storage_type: str_field(raw, "StorageType"),
                storage_encrypted: raw.get("StorageEncrypted").and_then(|v| v.as_bool()),
                iops: i32_field(raw, "Iops"),
            },
            network: NetworkAttributes {
                endpoint_address: endpoint.and_then(|e| str_field(e, "Address")),
                endpoint_port: endpoint.and_then(|e| i32_field(e, "Port")),
                availability_zone: str_field(raw, "AvailabilityZone"),
                multi_az: raw.get("MultiAZ").and_then(|v| v.as_bool()),
                publicly_accessible: raw.get("PubliclyAccessible").and_then(|v| v.as_bool()),
                vpc_id: raw
                    .get("DBSubnetGroup")
                    .and_then(|g| str_field(g, "VpcId")),
            },
            backup_window: str_field(raw, "PreferredBackupWindow"),
            backup_retention_days: i32_field(raw, "BackupRetentionPeriod"),
            tags,
            environment,
            created_at,
            last_seen_at: seen_at,
            last_updated_at: seen_at,
            removed_at: None,
        })
    }
}

fn unknown() -> String {
    "unknown".to_string()
}

fn str_field(value: &serde_json::Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn i32_field(value: &serde_json::Value, key: &str) -> Option<i32> {
    value
        .get(key)
        .and_then(|v| v.as_i64())
        .and_then(|n| i32::try_from(n).ok())
}

/// `Tags: [{Key, Value}]` as a map; entries without a key are dropped.
fn extract_tags(raw: &serde_json::Value) -> BTreeMap<String, String> {
    raw.get("Tags")
        .and_then(|t| t.as_array())
        .map(|tags| {
            tags.iter()
                .filter_map(|tag| {
                    let key = tag.get("Key").and_then(|k| k.as_str())?;
                    let value = tag.get("Value").and_then(|v| v.as_str()).unwrap_or("");
                    Some((key.to_string(), value.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::fleet::state::Environment;
    use crate::app::fleet_config::EnvironmentRules;
    use serde_json::json;

    fn normalizer() -> RdsInstanceNormalizer {
        RdsInstanceNormalizer::new(Arc::new(
            EnvironmentClassifier::from_rules(&EnvironmentRules::default()).unwrap(),
        ))
    }

    #[test]
    fn test_full_instance() {
        let raw = json!({
            "DBInstanceIdentifier": "orders-db",
            "DBInstanceClass": "db.r6g.large",
            "Engine": "postgres",
            "EngineVersion": "15.4",
            "DBInstanceStatus": "available",
            "AllocatedStorage": 100,
            "MaxAllocatedStorage": 500,
            "StorageType": "gp3",
            "StorageEncrypted": true,
            "Endpoint": {"Address": "orders-db.abc.us-east-1.rds.amazonaws.com", "Port": 5432},
            "AvailabilityZone": "us-east-1a",
            "MultiAZ": true,
            "PubliclyAccessible": false,
            "DBSubnetGroup": {"VpcId": "vpc-1234"},
            "PreferredBackupWindow": "03:00-04:00",
            "BackupRetentionPeriod": 7,
            "InstanceCreateTime": "2024-01-15T10:30:00Z",
            "Tags": [{"Key": "Environment", "Value": "prod"}, {"Key": "team", "Value": "orders"}]
        });
        let unit = TargetUnit::new("222222222222", "us-east-1");
        let seen = Utc::now();

        let record = normalizer().normalize(&raw, &unit, seen).unwrap();

        assert_eq!(record.instance_id, "orders-db");
        assert_eq!(record.account_id, "222222222222");
        assert_eq!(record.environment, Environment::Production);
        assert_eq!(record.storage.max_allocated_storage_gb, Some(500));
        assert_eq!(record.network.endpoint_port, Some(5432));
        assert_eq!(record.network.vpc_id.as_deref(), Some("vpc-1234"));
        assert_eq!(record.tags.get("team").map(String::as_str), Some("orders"));
        assert_eq!(
            record.created_at.map(|t| t.to_rfc3339()),
            Some("2024-01-15T10:30:00+00:00".to_string())
        );
        assert_eq!(record.last_seen_at, seen);
        assert!(record.removed_at.is_none());
    }

    #[test]
    fn test_missing_fields_default() {
        let raw = json!({"DBInstanceIdentifier": "bare"});
        let record = normalizer()
            .normalize(&raw, &TargetUnit::new("222222222222", "eu-west-1"), Utc::now())
            .unwrap();

        assert_eq!(record.engine, "unknown");
        assert_eq!(record.status, "unknown");
        assert!(record.tags.is_empty());
        assert_eq!(record.environment, Environment::Unknown);
    }

    #[test]
    fn test_missing_identifier_fails() {
        let raw = json!({"Engine": "mysql"});
        assert!(normalizer()
            .normalize(&raw, &TargetUnit::new("222222222222", "eu-west-1"), Utc::now())
            .is_err());
    }
}
