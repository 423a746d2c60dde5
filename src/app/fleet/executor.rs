use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::authorization::{OperationState, OperationType};
use super::aws_services::{DatabaseApi, InstanceModification};
use super::credentials::CredentialBroker;
use super::state::{Environment, InstanceRecord};
use crate::app::fleet_config::FleetConfig;

/// Exactly one of these is reported for every operation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationOutcome {
    #[serde(rename = "denied")]
    Denied,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "timeout")]
    TimedOut,
}

impl OperationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationOutcome::Denied => "denied",
            OperationOutcome::Completed => "completed",
            OperationOutcome::Failed => "failed",
            OperationOutcome::TimedOut => "timeout",
        }
    }

    pub fn final_state(&self) -> OperationState {
        match self {
            OperationOutcome::Denied => OperationState::Denied,
            OperationOutcome::Completed => OperationState::Completed,
            OperationOutcome::Failed => OperationState::Failed,
            OperationOutcome::TimedOut => OperationState::TimedOut,
        }
    }
}

impl fmt::Display for OperationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response to an operation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub instance_id: String,
    pub operation: String,
    pub outcome: OperationOutcome,
    pub message: String,
    pub environment: Option<Environment>,
    pub duration_seconds: f64,
    /// Last provider status observed while polling
    pub final_status: Option<String>,
    pub audit_id: Uuid,
    /// Set when the outcome is true but could not be written to the audit log
    pub audit_write_failed: bool,
    pub states: Vec<OperationState>,
}

/// What the executor observed, before auditing.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub outcome: OperationOutcome,
    pub message: String,
    pub final_status: Option<String>,
    pub duration_seconds: f64,
}

/// A validated provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PlannedAction {
    CreateSnapshot { snapshot_id: String },
    Stop,
    Start,
    Reboot,
    Modify(InstanceModification),
}

enum PollTarget {
    Snapshot(String),
    Instance { success: &'static str },
}

const INSTANCE_FAILURE_STATUSES: &[&str] = &[
    "failed",
    "incompatible-parameters",
    "incompatible-network",
    "inaccessible-encryption-credentials",
    "storage-full",
];

const SNAPSHOT_FAILURE_STATUSES: &[&str] = &["failed", "error"];

const STORAGE_TYPES: &[&str] = &["gp2", "gp3", "io1", "io2", "standard"];

pub struct OperationExecutor {
    config: Arc<FleetConfig>,
    broker: Arc<CredentialBroker>,
}

impl OperationExecutor {
    pub fn new(config: Arc<FleetConfig>, broker: Arc<CredentialBroker>) -> Self {
        Self { config, broker }
    }

    /// Run one authorized operation against `instance`, polling asynchronous operations
    /// until they reach a terminal status or the poll timeout elapses.
    pub async fn execute(
        &self,
        instance: &InstanceRecord,
        operation: OperationType,
        parameters: &BTreeMap<String, serde_json::Value>,
    ) -> ExecutionReport {
        let started = tokio::time::Instant::now();
        let report = |outcome, message: String, final_status: Option<String>| ExecutionReport {
            outcome,
            message,
            final_status,
            duration_seconds: started.elapsed().as_secs_f64(),
        };

        let action = match plan(instance, operation, parameters) {
            Ok(action) => action,
            Err(reason) => {
                log_warn!(
                    "Rejected {} on {}: invalid parameters: {}",
                    operation,
                    instance.instance_id,
                    reason
                );
                return report(
                    OperationOutcome::Failed,
                    format!("invalid parameters: {}", reason),
                    None,
                );
            }
        };

        let client = match self
            .broker
            .resolve(&instance.account_id, &instance.region)
            .await
        {
            Ok(client) => client,
            Err(err) => {
                log_warn!("Cannot reach {} for {}: {}", instance.unit(), operation, err);
                return report(
                    OperationOutcome::Failed,
                    format!("{}. {}", err.message, err.remediation),
                    None,
                );
            }
        };

        log_info!(
            "Executing {} on {} ({})",
            operation,
            instance.instance_id,
            instance.unit()
        );

        let api = client.api;
        let id = instance.instance_id.as_str();
        let invoked = match &action {
            PlannedAction::CreateSnapshot { snapshot_id } => {
                api.create_db_snapshot(id, snapshot_id).await
            }
            PlannedAction::Stop => api.stop_db_instance(id).await,
            PlannedAction::Start => api.start_db_instance(id).await,
            PlannedAction::Reboot => api.reboot_db_instance(id).await,
            PlannedAction::Modify(modification) => api.modify_db_instance(id, modification).await,
        };

        let accepted = match invoked {
            Ok(response) => response,
            Err(e) => {
                let message = format!("{:#}", e);
                log_warn!("Provider rejected {} on {}: {}", operation, id, message);
                return report(OperationOutcome::Failed, message, None);
            }
        };

        let target = match &action {
            PlannedAction::CreateSnapshot { snapshot_id } => {
                PollTarget::Snapshot(snapshot_id.clone())
            }
            PlannedAction::Stop => PollTarget::Instance { success: "stopped" },
            PlannedAction::Start | PlannedAction::Reboot => {
                PollTarget::Instance { success: "available" }
            }
            PlannedAction::Modify(_) => {
                let status = accepted
                    .get("DBInstanceStatus")
                    .and_then(|s| s.as_str())
                    .map(str::to_string);
                return report(
                    OperationOutcome::Completed,
                    format!("{} accepted by the provider", operation),
                    status,
                );
            }
        };

        let poll_timeout = self.config.operations.poll_timeout();
        let poll_interval = self.config.operations.poll_interval();
        let polled = tokio::time::timeout(
            poll_timeout,
            poll_until_terminal(api.as_ref(), id, &target, poll_interval),
        )
        .await;

        match polled {
            Ok(Ok(status)) => {
                let message = match &target {
                    PollTarget::Snapshot(snapshot_id) => {
                        format!("snapshot {} is {}", snapshot_id, status)
                    }
                    PollTarget::Instance { .. } => format!("instance {} is {}", id, status),
                };
                let result = report(OperationOutcome::Completed, message, Some(status));
                log_info!(
                    "{} on {} completed after {:.1}s",
                    operation,
                    id,
                    result.duration_seconds
                );
                result
            }
            Ok(Err(status)) => {
                log_warn!("{} on {} ended in status {}", operation, id, status);
                report(
                    OperationOutcome::Failed,
                    format!("{} ended in status '{}'", operation, status),
                    Some(status),
                )
            }
            Err(_) => {
                log_warn!(
                    "{} on {} not terminal after {}s",
                    operation,
                    id,
                    poll_timeout.as_secs()
                );
                report(
                    OperationOutcome::TimedOut,
                    format!(
                        "{} did not reach a terminal status within {}s",
                        operation,
                        poll_timeout.as_secs()
                    ),
                    None,
                )
            }
        }
    }
}

/// Poll until a terminal status. `Ok` carries a success status, `Err` a failure status.
async fn poll_until_terminal(
    api: &dyn DatabaseApi,
    instance_id: &str,
    target: &PollTarget,
    interval: Duration,
) -> Result<String, String> {
    loop {
        tokio::time::sleep(interval).await;

        let observed = match target {
            PollTarget::Snapshot(snapshot_id) => api
                .describe_db_snapshot(snapshot_id)
                .await
                .map(|v| status_field(&v, "Status")),
            PollTarget::Instance { .. } => api
                .describe_db_instance(instance_id)
                .await
                .map(|v| status_field(&v, "DBInstanceStatus")),
        };

        let status = match observed {
            Ok(Some(status)) => status,
            Ok(None) => {
                tracing::debug!("Status of {} not reported yet", instance_id);
                continue;
            }
            Err(e) => {
                log_warn!("Status poll for {} failed, will retry: {:#}", instance_id, e);
                continue;
            }
        };

        match target {
            PollTarget::Snapshot(_) => {
                if status == "available" {
                    return Ok(status);
                }
                if SNAPSHOT_FAILURE_STATUSES.contains(&status.as_str()) {
                    return Err(status);
                }
            }
            PollTarget::Instance { success } => {
                if status == *success {
                    return Ok(status);
                }
                if INSTANCE_FAILURE_STATUSES.contains(&status.as_str()) {
                    return Err(status);
                }
            }
        }
        tracing::debug!("{} still {}", instance_id, status);
    }
}

fn status_field(value: &serde_json::Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|s| s.as_str())
        .map(|s| s.to_lowercase())
}

fn plan(
    instance: &InstanceRecord,
    operation: OperationType,
    parameters: &BTreeMap<String, serde_json::Value>,
) -> Result<PlannedAction, String> {
    match operation {
        OperationType::CreateSnapshot => {
            let snapshot_id = match string_param(parameters, "snapshot_id")? {
                Some(id) => id,
                None => format!(
                    "{}-{}",
                    instance.instance_id,
                    chrono::Utc::now().format("%Y%m%d%H%M%S")
                ),
            };
            validate_snapshot_id(&snapshot_id)?;
            Ok(PlannedAction::CreateSnapshot { snapshot_id })
        }
        OperationType::StopInstance => Ok(PlannedAction::Stop),
        OperationType::StartInstance => Ok(PlannedAction::Start),
        OperationType::RebootInstance => Ok(PlannedAction::Reboot),
        OperationType::ModifyBackupWindow => {
            let window = string_param(parameters, "backup_window")?
                .ok_or_else(|| "backup_window is required".to_string())?;
            validate_backup_window(&window)?;
            Ok(PlannedAction::Modify(InstanceModification {
                backup_window: Some(window),
                ..Default::default()
            }))
        }
        OperationType::EnableStorageAutoscaling => {
            let max = int_param(parameters, "max_allocated_storage")?
                .ok_or_else(|| "max_allocated_storage is required".to_string())?;
            if let Some(current) = instance.storage.allocated_storage_gb {
                if max <= current {
                    return Err(format!(
                        "max_allocated_storage ({}) must exceed the allocated storage ({} GiB)",
                        max, current
                    ));
                }
            }
            Ok(PlannedAction::Modify(InstanceModification {
                max_allocated_storage: Some(max),
                ..Default::default()
            }))
        }
        OperationType::ModifyStorage => {
            let allocated = int_param(parameters, "allocated_storage")?
                .ok_or_else(|| "allocated_storage is required".to_string())?;
            if let Some(current) = instance.storage.allocated_storage_gb {
                if allocated <= current {
                    return Err(format!(
                        "allocated_storage ({}) must exceed the current allocation ({} GiB)",
                        allocated, current
                    ));
                }
            }
            let storage_type = string_param(parameters, "storage_type")?;
            if let Some(storage_type) = &storage_type {
                if !STORAGE_TYPES.contains(&storage_type.as_str()) {
                    return Err(format!(
                        "storage_type '{}' is not one of {}",
                        storage_type,
                        STORAGE_TYPES.join(", ")
                    ));
                }
            }
            Ok(PlannedAction::Modify(InstanceModification {
                allocated_storage: Some(allocated),
                storage_type,
                ..Default::default()
            }))
        }
    }
}

fn string_param(
    parameters: &BTreeMap<String, serde_json::Value>,
    key: &str,
) -> Result<Option<String>, String> {
    match parameters.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => {
            Err(format!("{} must not be empty", key))
        }
        Some(serde_json::Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(other) => Err(format!("{} must be a string, got {}", key, other)),
    }
}

fn int_param(
    parameters: &BTreeMap<String, serde_json::Value>,
    key: &str,
) -> Result<Option<i32>, String> {
    let parsed = match parameters.get(key) {
        None | Some(serde_json::Value::Null) => return Ok(None),
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<i64>().ok(),
        Some(_) => None,
    };
    match parsed.and_then(|n| i32::try_from(n).ok()) {
        Some(n) if n > 0 => Ok(Some(n)),
        _ => Err(format!("{} must be a positive integer", key)),
    }
}

static SNAPSHOT_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z](?:-?[A-Za-z0-9])*$").expect("valid snapshot id regex"));

static BACKUP_WINDOW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^((?:[01]\d|2[0-3]):[0-5]\d)-((?:[01]\d|2[0-3]):[0-5]\d)$")
        .expect("valid backup window regex")
});

fn validate_snapshot_id(snapshot_id: &str) -> Result<(), String> {
    if snapshot_id.len() <= 255 && SNAPSHOT_ID.is_match(snapshot_id) {
        Ok(())
    } else {
        Err(format!(
            "snapshot_id '{}' must start with a letter and contain only letters, digits and single hyphens",
            snapshot_id
        ))
    }
}

/// `hh24:mi-hh24:mi`, UTC.
fn validate_backup_window(window: &str) -> Result<(), String> {
    match BACKUP_WINDOW.captures(window) {
        Some(caps) if caps[1] != caps[2] => Ok(()),
        _ => Err(format!(
            "backup_window '{}' must have the form hh24:mi-hh24:mi",
            window
        )),
    }
}
