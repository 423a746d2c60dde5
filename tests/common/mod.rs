//! Shared test doubles for the fleet engine integration tests.
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dbfleet::app::fleet::aws_services::{
    AssumeRoleRequest, ClientFactory, DatabaseApi, InstanceModification, RoleAssumer,
};
use dbfleet::app::fleet::credentials::AccountCredentials;
use dbfleet::app::fleet::{
    ExternalIdProvider, FleetError, FleetService, KeyValueStore, MemoryStore, TargetUnit,
};
use dbfleet::app::fleet_config::FleetConfig;
use dbfleet::app::fleet::FleetDependencies;

pub const HOME: &str = "111111111111";
pub const ACCOUNT_A: &str = "222222222222";
pub const ACCOUNT_B: &str = "333333333333";

pub fn instance_json(id: &str, status: &str, tags: &[(&str, &str)]) -> Value {
    let tags: Vec<Value> = tags
        .iter()
        .map(|(k, v)| json!({"Key": k, "Value": v}))
        .collect();
    json!({
        "DBInstanceIdentifier": id,
        "DBInstanceClass": "db.t4g.medium",
        "Engine": "postgres",
        "EngineVersion": "15.4",
        "DBInstanceStatus": status,
        "AllocatedStorage": 100,
        "StorageType": "gp3",
        "PreferredBackupWindow": "03:00-03:30",
        "BackupRetentionPeriod": 7,
        "Tags": tags,
    })
}

/// Scriptable per-unit database API.
#[derive(Default)]
pub struct MockDatabaseApi {
    pub instances: Mutex<Vec<Value>>,
    pub list_error: Mutex<Option<String>>,
    pub list_delay: Mutex<Option<Duration>>,
    /// Statuses returned by successive describe calls; the last one repeats
    pub snapshot_statuses: Mutex<VecDeque<String>>,
    pub instance_statuses: Mutex<VecDeque<String>>,
    pub mutation_error: Mutex<Option<String>>,
    pub calls: Mutex<Vec<String>>,
    pub list_calls: AtomicUsize,
}

impl MockDatabaseApi {
    pub fn with_instances(instances: Vec<Value>) -> Arc<Self> {
        let api = Self::default();
        *api.instances.lock().unwrap() = instances;
        Arc::new(api)
    }

    pub fn set_instances(&self, instances: Vec<Value>) {
        *self.instances.lock().unwrap() = instances;
    }

    pub fn fail_listing(&self, message: &str) {
        *self.list_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn delay_listing(&self, delay: Duration) {
        *self.list_delay.lock().unwrap() = Some(delay);
    }

    pub fn script_snapshot_statuses(&self, statuses: &[&str]) {
        *self.snapshot_statuses.lock().unwrap() =
            statuses.iter().map(|s| s.to_string()).collect();
    }

    pub fn script_instance_statuses(&self, statuses: &[&str]) {
        *self.instance_statuses.lock().unwrap() =
            statuses.iter().map(|s| s.to_string()).collect();
    }

    pub fn reject_mutations(&self, message: &str) {
        *self.mutation_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_status(queue: &Mutex<VecDeque<String>>) -> Option<String> {
        let mut queue = queue.lock().unwrap();
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }

    fn mutation_result(&self, response: Value) -> Result<Value> {
        match self.mutation_error.lock().unwrap().clone() {
            Some(message) => Err(anyhow!("{}", message)),
            None => Ok(response),
        }
    }
}

#[async_trait]
impl DatabaseApi for MockDatabaseApi {
    async fn list_db_instances(&self) -> Result<Vec<Value>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.list_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.list_error.lock().unwrap().clone() {
            return Err(anyhow!("{}", message));
        }
        Ok(self.instances.lock().unwrap().clone())
    }

    async fn describe_db_instance(&self, instance_id: &str) -> Result<Value> {
        self.record(format!("describe_db_instance:{}", instance_id));
        let status = Self::next_status(&self.instance_statuses)
            .ok_or_else(|| anyhow!("DBInstanceNotFound: {}", instance_id))?;
        Ok(json!({"DBInstanceIdentifier": instance_id, "DBInstanceStatus": status}))
    }

    async fn describe_db_snapshot(&self, snapshot_id: &str) -> Result<Value> {
        self.record(format!("describe_db_snapshot:{}", snapshot_id));
        let status = Self::next_status(&self.snapshot_statuses)
            .ok_or_else(|| anyhow!("DBSnapshotNotFound: {}", snapshot_id))?;
        Ok(json!({"DBSnapshotIdentifier": snapshot_id, "Status": status}))
    }

    async fn create_db_snapshot(&self, instance_id: &str, snapshot_id: &str) -> Result<Value> {
        self.record(format!("create_db_snapshot:{}:{}", instance_id, snapshot_id));
        self.mutation_result(json!({
            "DBSnapshotIdentifier": snapshot_id,
            "DBInstanceIdentifier": instance_id,
            "Status": "creating"
        }))
    }

    async fn stop_db_instance(&self, instance_id: &str) -> Result<Value> {
        self.record(format!("stop_db_instance:{}", instance_id));
        self.mutation_result(json!({
            "DBInstanceIdentifier": instance_id,
            "DBInstanceStatus": "stopping"
        }))
    }

    async fn start_db_instance(&self, instance_id: &str) -> Result<Value> {
        self.record(format!("start_db_instance:{}", instance_id));
        self.mutation_result(json!({
            "DBInstanceIdentifier": instance_id,
            "DBInstanceStatus": "starting"
        }))
    }

    async fn reboot_db_instance(&self, instance_id: &str) -> Result<Value> {
        self.record(format!("reboot_db_instance:{}", instance_id));
        self.mutation_result(json!({
            "DBInstanceIdentifier": instance_id,
            "DBInstanceStatus": "rebooting"
        }))
    }

    async fn modify_db_instance(
        &self,
        instance_id: &str,
        modification: &InstanceModification,
    ) -> Result<Value> {
        self.record(format!("modify_db_instance:{}:{:?}", instance_id, modification));
        self.mutation_result(json!({
            "DBInstanceIdentifier": instance_id,
            "DBInstanceStatus": "modifying"
        }))
    }
}

/// Routes clients to per-unit mocks. Units without a mock get an empty API.
pub struct MockClientFactory {
    home_account: String,
    apis: Mutex<HashMap<TargetUnit, Arc<MockDatabaseApi>>>,
}

impl MockClientFactory {
    pub fn new(home_account: &str) -> Arc<Self> {
        Arc::new(Self {
            home_account: home_account.to_string(),
            apis: Mutex::new(HashMap::new()),
        })
    }

    pub fn register(&self, account: &str, region: &str, api: Arc<MockDatabaseApi>) {
        self.apis
            .lock()
            .unwrap()
            .insert(TargetUnit::new(account, region), api);
    }

    pub fn api(&self, account: &str, region: &str) -> Arc<MockDatabaseApi> {
        let mut apis = self.apis.lock().unwrap();
        apis.entry(TargetUnit::new(account, region))
            .or_insert_with(|| Arc::new(MockDatabaseApi::default()))
            .clone()
    }
}

impl ClientFactory for MockClientFactory {
    fn direct_client(&self, region: &str) -> Arc<dyn DatabaseApi> {
        self.api(&self.home_account, region)
    }

    fn client_with_credentials(
        &self,
        region: &str,
        credentials: &AccountCredentials,
    ) -> Arc<dyn DatabaseApi> {
        self.api(&credentials.account_id, region)
    }
}

#[derive(Default)]
pub struct MockRoleAssumer {
    pub denied_accounts: Mutex<HashSet<String>>,
    pub missing_role_accounts: Mutex<HashSet<String>>,
    pub calls: AtomicUsize,
}

impl MockRoleAssumer {
    pub fn deny(&self, account: &str) {
        self.denied_accounts.lock().unwrap().insert(account.to_string());
    }

    pub fn remove_role(&self, account: &str) {
        self.missing_role_accounts
            .lock()
            .unwrap()
            .insert(account.to_string());
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RoleAssumer for MockRoleAssumer {
    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<AccountCredentials> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.denied_accounts.lock().unwrap().contains(&request.account_id) {
            return Err(anyhow!(
                "AccessDenied: User: arn:aws:sts::{}:assumed-role/dbfleet is not authorized to perform: sts:AssumeRole on resource: {}",
                HOME,
                request.role_arn
            ));
        }
        if self
            .missing_role_accounts
            .lock()
            .unwrap()
            .contains(&request.account_id)
        {
            return Err(anyhow!(
                "NoSuchEntity: The role with name dbfleet-discovery cannot be found."
            ));
        }
        Ok(AccountCredentials {
            account_id: request.account_id.clone(),
            role_name: "dbfleet-discovery".to_string(),
            access_key_id: "ASIATEST".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: "token".to_string(),
            expiration: Utc::now() + chrono::Duration::hours(1),
        })
    }
}

/// A store whose audit writes always fail.
#[derive(Default)]
pub struct AuditFailingStore {
    inner: MemoryStore,
}

#[async_trait]
impl KeyValueStore for AuditFailingStore {
    async fn get_by_key(&self, key: &str) -> Result<Option<Value>> {
        self.inner.get_by_key(key).await
    }

    async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        if key.starts_with("audit#") {
            return Err(anyhow!("ProvisionedThroughputExceededException: audit table"));
        }
        self.inner.put(key, value, ttl).await
    }

    async fn conditional_delete(&self, key: &str, expected: &Value) -> Result<bool> {
        self.inner.conditional_delete(key, expected).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        self.inner.scan_prefix(prefix).await
    }
}

pub struct Harness {
    pub service: FleetService,
    pub factory: Arc<MockClientFactory>,
    pub assumer: Arc<MockRoleAssumer>,
    pub store: Arc<dyn KeyValueStore>,
}

pub fn harness(config: FleetConfig) -> Harness {
    harness_with_store(config, Arc::new(MemoryStore::new()))
}

pub fn harness_with_store(config: FleetConfig, store: Arc<dyn KeyValueStore>) -> Harness {
    try_harness(config, store).expect("valid config")
}

pub fn try_harness(
    config: FleetConfig,
    store: Arc<dyn KeyValueStore>,
) -> Result<Harness, FleetError> {
    let factory = MockClientFactory::new(&config.home_account_id);
    let assumer = Arc::new(MockRoleAssumer::default());
    let service = FleetService::new(
        config,
        FleetDependencies {
            role_assumer: assumer.clone(),
            client_factory: factory.clone(),
            external_id: Arc::new(ExternalIdProvider::disabled()),
            store: Arc::clone(&store),
        },
    )?;
    Ok(Harness {
        service,
        factory,
        assumer,
        store,
    })
}

/// Two accounts in two regions each, home account excluded.
pub fn two_by_two_config() -> FleetConfig {
    FleetConfig::new(
        HOME,
        vec![
            TargetUnit::new(ACCOUNT_A, "us-east-1"),
            TargetUnit::new(ACCOUNT_A, "eu-west-1"),
            TargetUnit::new(ACCOUNT_B, "us-east-1"),
            TargetUnit::new(ACCOUNT_B, "eu-west-1"),
        ],
    )
}
