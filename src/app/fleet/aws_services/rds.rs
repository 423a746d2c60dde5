use anyhow::{anyhow, Result};
use async_trait::async_trait;
use aws_sdk_rds as rds;
use aws_sdk_rds::error::DisplayErrorContext;
use aws_smithy_types::date_time::Format;

/// Storage and backup changes applied through a single `ModifyDBInstance` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceModification {
    pub backup_window: Option<String>,
    pub max_allocated_storage: Option<i32>,
    pub allocated_storage: Option<i32>,
    pub storage_type: Option<String>,
}

/// The managed database API as seen from one (account, region).
///
/// Responses are JSON objects keyed with the RDS API member names (`DBInstanceIdentifier`,
/// `DBInstanceStatus`, `Tags`, ...), which is what the normalizer consumes.
#[async_trait]
pub trait DatabaseApi: Send + Sync {
    async fn list_db_instances(&self) -> Result<Vec<serde_json::Value>>;

    async fn describe_db_instance(&self, instance_id: &str) -> Result<serde_json::Value>;

    async fn describe_db_snapshot(&self, snapshot_id: &str) -> Result<serde_json::Value>;

    async fn create_db_snapshot(
        &self,
        instance_id: &str,
        snapshot_id: &str,
    ) -> Result<serde_json::Value>;

    async fn stop_db_instance(&self, instance_id: &str) -> Result<serde_json::Value>;

    async fn start_db_instance(&self, instance_id: &str) -> Result<serde_json::Value>;

    async fn reboot_db_instance(&self, instance_id: &str) -> Result<serde_json::Value>;

    async fn modify_db_instance(
        &self,
        instance_id: &str,
        modification: &InstanceModification,
    ) -> Result<serde_json::Value>;
}

/// `DatabaseApi` backed by `aws-sdk-rds`.
pub struct RDSService {
    client: rds::Client,
}

impl RDSService {
    pub fn new(client: rds::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DatabaseApi for RDSService {
    /// List RDS DB instances
    async fn list_db_instances(&self) -> Result<Vec<serde_json::Value>> {
        let mut instances = Vec::new();

        let mut paginator = self.client.describe_db_instances().into_paginator().send();

        while let Some(result) = paginator.try_next().await.map_err(|e| {
            anyhow!("DescribeDBInstances failed: {}", DisplayErrorContext(&e))
        })? {
            let instance_list = result.db_instances.unwrap_or_default();
            for instance in instance_list {
                instances.push(db_instance_to_json(&instance));
            }
        }

        Ok(instances)
    }

    async fn describe_db_instance(&self, instance_id: &str) -> Result<serde_json::Value> {
        let response = self
            .client
            .describe_db_instances()
            .db_instance_identifier(instance_id)
            .send()
            .await
            .map_err(|e| anyhow!("DescribeDBInstances failed: {}", DisplayErrorContext(&e)))?;

        response
            .db_instances
            .and_then(|instances| instances.into_iter().next())
            .map(|instance| db_instance_to_json(&instance))
            .ok_or_else(|| anyhow!("DB instance not found: {}", instance_id))
    }

    async fn describe_db_snapshot(&self, snapshot_id: &str) -> Result<serde_json::Value> {
        let response = self
            .client
            .describe_db_snapshots()
            .db_snapshot_identifier(snapshot_id)
            .send()
            .await
            .map_err(|e| anyhow!("DescribeDBSnapshots failed: {}", DisplayErrorContext(&e)))?;

        response
            .db_snapshots
            .and_then(|snapshots| snapshots.into_iter().next())
            .map(|snapshot| db_snapshot_to_json(&snapshot))
            .ok_or_else(|| anyhow!("DB snapshot not found: {}", snapshot_id))
    }

    async fn create_db_snapshot(
        &self,
        instance_id: &str,
        snapshot_id: &str,
    ) -> Result<serde_json::Value> {
        let response = self
            .client
            .create_db_snapshot()
            .db_instance_identifier(instance_id)
            .db_snapshot_identifier(snapshot_id)
            .send()
            .await
            .map_err(|e| anyhow!("{}", DisplayErrorContext(&e)))?;

        Ok(response
            .db_snapshot
            .map(|snapshot| db_snapshot_to_json(&snapshot))
            .unwrap_or(serde_json::Value::Null))
    }

    async fn stop_db_instance(&self, instance_id: &str) -> Result<serde_json::Value> {
        let response = self
            .client
            .stop_db_instance()
            .db_instance_identifier(instance_id)
            .send()
            .await
            .map_err(|e| anyhow!("{}", DisplayErrorContext(&e)))?;

        Ok(response
            .db_instance
            .map(|instance| db_instance_to_json(&instance))
            .unwrap_or(serde_json::Value::Null))
    }

    async fn start_db_instance(&self, instance_id: &str) -> Result<serde_json::Value> {
        let response = self
            .client
            .start_db_instance()
            .db_instance_identifier(instance_id)
            .send()
            .await
            .map_err(|e| anyhow!("{}", DisplayErrorContext(&e)))?;

        Ok(response
            .db_instance
            .map(|instance| db_instance_to_json(&instance))
            .unwrap_or(serde_json::Value::Null))
    }

    async fn reboot_db_instance(&self, instance_id: &str) -> Result<serde_json::Value> {
        let response = self
            .client
            .reboot_db_instance()
            .db_instance_identifier(instance_id)
            .send()
            .await
            .map_err(|e| anyhow!("{}", DisplayErrorContext(&e)))?;

        Ok(response
            .db_instance
            .map(|instance| db_instance_to_json(&instance))
            .unwrap_or(serde_json::Value::Null))
    }

    async fn modify_db_instance(
        &self,
        instance_id: &str,
        modification: &InstanceModification,
    ) -> Result<serde_json::Value> {
        let response = self
            .client
            .modify_db_instance()
            .db_instance_identifier(instance_id)
            .set_preferred_backup_window(modification.backup_window.clone())
            .set_max_allocated_storage(modification.max_allocated_storage)
            .set_allocated_storage(modification.allocated_storage)
            .set_storage_type(modification.storage_type.clone())
            .apply_immediately(true)
            .send()
            .await
            .map_err(|e| anyhow!("{}", DisplayErrorContext(&e)))?;

        Ok(response
            .db_instance
            .map(|instance| db_instance_to_json(&instance))
            .unwrap_or(serde_json::Value::Null))
    }
}

type JsonMap = serde_json::Map<String, serde_json::Value>;

fn insert_str(map: &mut JsonMap, key: &str, value: &Option<String>) {
    if let Some(value) = value {
        map.insert(key.to_string(), serde_json::Value::String(value.clone()));
    }
}

fn insert_i32(map: &mut JsonMap, key: &str, value: Option<i32>) {
    if let Some(value) = value {
        map.insert(key.to_string(), serde_json::Value::Number(value.into()));
    }
}

fn insert_bool(map: &mut JsonMap, key: &str, value: Option<bool>) {
    if let Some(value) = value {
        map.insert(key.to_string(), serde_json::Value::Bool(value));
    }
}

/// Convert DB instance to JSON format
fn db_instance_to_json(instance: &rds::types::DbInstance) -> serde_json::Value {
    let mut instance_map = JsonMap::new();

    insert_str(&mut instance_map, "DBInstanceIdentifier", &instance.db_instance_identifier);
    insert_str(&mut instance_map, "DBInstanceClass", &instance.db_instance_class);
    insert_str(&mut instance_map, "Engine", &instance.engine);
    insert_str(&mut instance_map, "EngineVersion", &instance.engine_version);
    insert_str(&mut instance_map, "DBInstanceStatus", &instance.db_instance_status);
    insert_i32(&mut instance_map, "AllocatedStorage", instance.allocated_storage);
    insert_i32(&mut instance_map, "MaxAllocatedStorage", instance.max_allocated_storage);
    insert_str(&mut instance_map, "StorageType", &instance.storage_type);
    insert_bool(&mut instance_map, "StorageEncrypted", instance.storage_encrypted);
    insert_i32(&mut instance_map, "Iops", instance.iops);
    insert_str(&mut instance_map, "AvailabilityZone", &instance.availability_zone);
    insert_bool(&mut instance_map, "MultiAZ", instance.multi_az);
    insert_bool(&mut instance_map, "PubliclyAccessible", instance.publicly_accessible);
    insert_str(&mut instance_map, "PreferredBackupWindow", &instance.preferred_backup_window);
    insert_i32(&mut instance_map, "BackupRetentionPeriod", instance.backup_retention_period);

    if let Some(creation_time) = instance.instance_create_time {
        if let Ok(formatted) = creation_time.fmt(Format::DateTime) {
            instance_map.insert(
                "InstanceCreateTime".to_string(),
                serde_json::Value::String(formatted),
            );
        }
    }

    if let Some(endpoint) = &instance.endpoint {
        let mut endpoint_map = JsonMap::new();
        insert_str(&mut endpoint_map, "Address", &endpoint.address);
        insert_i32(&mut endpoint_map, "Port", endpoint.port);
        instance_map.insert("Endpoint".to_string(), serde_json::Value::Object(endpoint_map));
    }

    if let Some(subnet_group) = &instance.db_subnet_group {
        let mut subnet_map = JsonMap::new();
        insert_str(&mut subnet_map, "DBSubnetGroupName", &subnet_group.db_subnet_group_name);
        insert_str(&mut subnet_map, "VpcId", &subnet_group.vpc_id);
        instance_map.insert("DBSubnetGroup".to_string(), serde_json::Value::Object(subnet_map));
    }

    if let Some(tags) = &instance.tag_list {
        let tags_json: Vec<serde_json::Value> = tags
            .iter()
            .map(|tag| {
                let mut tag_json = JsonMap::new();
                insert_str(&mut tag_json, "Key", &tag.key);
                insert_str(&mut tag_json, "Value", &tag.value);
                serde_json::Value::Object(tag_json)
            })
            .collect();
        instance_map.insert("Tags".to_string(), serde_json::Value::Array(tags_json));
    }

    serde_json::Value::Object(instance_map)
}

/// Convert DB snapshot to JSON format
fn db_snapshot_to_json(snapshot: &rds::types::DbSnapshot) -> serde_json::Value {
    let mut snapshot_map = JsonMap::new();

    insert_str(&mut snapshot_map, "DBSnapshotIdentifier", &snapshot.db_snapshot_identifier);
    insert_str(&mut snapshot_map, "DBInstanceIdentifier", &snapshot.db_instance_identifier);
    insert_str(&mut snapshot_map, "Status", &snapshot.status);
    insert_i32(&mut snapshot_map, "PercentProgress", snapshot.percent_progress);

    if let Some(created) = snapshot.snapshot_create_time {
        if let Ok(formatted) = created.fmt(Format::DateTime) {
            snapshot_map.insert(
                "SnapshotCreateTime".to_string(),
                serde_json::Value::String(formatted),
            );
        }
    }

    serde_json::Value::Object(snapshot_map)
}
