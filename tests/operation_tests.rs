mod common;

use common::*;
use dbfleet::app::fleet::{
    Environment, FleetError, Identity, MemoryStore, OperationOutcome, OperationRequest,
    OperationState, TargetUnit,
};
use dbfleet::app::fleet_config::{FleetConfig, ALL_SCOPE};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

fn operator() -> Identity {
    Identity::new("alice", ["execute_operations"])
}

fn production_operator() -> Identity {
    Identity::new("bob", ["execute_operations", "production_operator"])
}

fn config() -> FleetConfig {
    FleetConfig::new(HOME, vec![TargetUnit::new(ACCOUNT_A, "us-east-1")])
}

/// Discover one production and one development instance so they are in the inventory.
async fn seeded(h: &Harness) -> Arc<MockDatabaseApi> {
    let api = MockDatabaseApi::with_instances(vec![
        instance_json("orders-db", "available", &[("Environment", "prod")]),
        instance_json("scratch-db", "available", &[("Environment", "dev")]),
    ]);
    h.factory.register(ACCOUNT_A, "us-east-1", api.clone());
    h.service.run_discovery(ALL_SCOPE).await.unwrap();
    api
}

fn mutations(api: &MockDatabaseApi) -> Vec<String> {
    api.calls()
        .into_iter()
        .filter(|c| !c.starts_with("describe_"))
        .collect()
}

#[tokio::test]
async fn test_production_risky_operation_requires_elevated_role() {
    let h = harness(config());
    let api = seeded(&h).await;

    let result = h
        .service
        .execute(
            OperationRequest::new("orders-db", "stop_instance", operator())
                .with_parameter("confirm_production", json!(true)),
        )
        .await;

    assert_eq!(result.outcome, OperationOutcome::Denied);
    assert_eq!(result.environment, Some(Environment::Production));
    assert!(result.message.contains("requires elevated privilege"));
    assert!(!result.audit_write_failed);
    assert!(mutations(&api).is_empty());
    assert_eq!(
        result.states,
        vec![
            OperationState::Received,
            OperationState::EnvironmentClassified,
            OperationState::RiskClassified,
            OperationState::Denied,
        ]
    );

    let history = h.service.audit_history("orders-db").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, OperationOutcome::Denied);
    assert_eq!(history[0].identity.user_id, "alice");
    assert_eq!(history[0].environment, Some(Environment::Production));
}

#[tokio::test]
async fn test_production_risky_operation_requires_confirmation() {
    let h = harness(config());
    let api = seeded(&h).await;

    let result = h
        .service
        .execute(OperationRequest::new(
            "orders-db",
            "reboot_instance",
            production_operator(),
        ))
        .await;

    assert_eq!(result.outcome, OperationOutcome::Denied);
    assert!(result.message.contains("confirm_production"));
    assert!(mutations(&api).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_confirmed_production_stop_completes() {
    let h = harness(config());
    let api = seeded(&h).await;
    api.script_instance_statuses(&["stopping", "stopped"]);

    let result = h
        .service
        .execute(
            OperationRequest::new("orders-db", "stop_instance", production_operator())
                .with_parameter("confirm_production", json!("yes")),
        )
        .await;

    assert_eq!(result.outcome, OperationOutcome::Completed);
    assert_eq!(result.final_status.as_deref(), Some("stopped"));
    assert_eq!(mutations(&api), vec!["stop_db_instance:orders-db"]);
    assert_eq!(
        result.states,
        vec![
            OperationState::Received,
            OperationState::EnvironmentClassified,
            OperationState::RiskClassified,
            OperationState::Authorized,
            OperationState::Executing,
            OperationState::Completed,
        ]
    );
}

#[tokio::test]
async fn test_safe_operation_in_production_needs_only_base_role() {
    let h = harness(config());
    let api = seeded(&h).await;

    let result = h
        .service
        .execute(
            OperationRequest::new("orders-db", "modify_backup_window", operator())
                .with_parameter("backup_window", json!("04:00-04:30")),
        )
        .await;

    assert_eq!(result.outcome, OperationOutcome::Completed);
    assert_eq!(result.final_status.as_deref(), Some("modifying"));
    assert_eq!(mutations(&api).len(), 1);
    assert!(mutations(&api)[0].starts_with("modify_db_instance:orders-db"));
}

#[tokio::test]
async fn test_caller_without_roles_is_denied() {
    let h = harness(config());
    let api = seeded(&h).await;

    let result = h
        .service
        .execute(OperationRequest::new(
            "scratch-db",
            "create_snapshot",
            Identity::new("mallory", Vec::<String>::new()),
        ))
        .await;

    assert_eq!(result.outcome, OperationOutcome::Denied);
    assert!(result.message.contains("execute_operations"));
    assert!(mutations(&api).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_polls_until_available() {
    let h = harness(config());
    let api = seeded(&h).await;
    api.script_snapshot_statuses(&["creating", "creating", "available"]);

    let result = h
        .service
        .execute(
            OperationRequest::new("scratch-db", "create_snapshot", operator())
                .with_parameter("snapshot_id", json!("scratch-db-before-upgrade")),
        )
        .await;

    assert_eq!(result.outcome, OperationOutcome::Completed);
    assert_eq!(result.final_status.as_deref(), Some("available"));
    assert!(result.duration_seconds > 0.0);
    assert_eq!(
        mutations(&api),
        vec!["create_db_snapshot:scratch-db:scratch-db-before-upgrade"]
    );

    let history = h.service.audit_history("scratch-db").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, OperationOutcome::Completed);
    assert_eq!(history[0].account_id.as_deref(), Some(ACCOUNT_A));
    assert!(history[0].duration_seconds > 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_snapshot_status_is_failure() {
    let h = harness(config());
    let api = seeded(&h).await;
    api.script_snapshot_statuses(&["creating", "failed"]);

    let result = h
        .service
        .execute(OperationRequest::new("scratch-db", "create_snapshot", operator()))
        .await;

    assert_eq!(result.outcome, OperationOutcome::Failed);
    assert_eq!(result.final_status.as_deref(), Some("failed"));
    let created = mutations(&api);
    assert_eq!(created.len(), 1);
    assert!(created[0].starts_with("create_db_snapshot:scratch-db:scratch-db-"));
}

#[tokio::test(start_paused = true)]
async fn test_never_terminal_operation_times_out() {
    let h = harness(config());
    let api = seeded(&h).await;
    api.script_snapshot_statuses(&["creating"]);

    let result = h
        .service
        .execute(OperationRequest::new("scratch-db", "create_snapshot", operator()))
        .await;

    assert_eq!(result.outcome, OperationOutcome::TimedOut);
    assert_eq!(result.final_status, None);
    assert!(result.message.contains("300s"));
    assert!(result.duration_seconds >= 300.0);
    assert_eq!(result.states.last(), Some(&OperationState::TimedOut));

    let history = h.service.audit_history("scratch-db").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, OperationOutcome::TimedOut);
    assert_eq!(
        serde_json::to_value(&history[0]).unwrap()["outcome"],
        json!("timeout")
    );
}

#[tokio::test(start_paused = true)]
async fn test_poll_errors_are_retried() {
    let h = harness(config());
    let api = seeded(&h).await;
    // No scripted statuses yet: describe fails until the status appears.
    let poller = api.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(65)).await;
        poller.script_instance_statuses(&["available"]);
    });

    let result = h
        .service
        .execute(OperationRequest::new("scratch-db", "start_instance", operator()))
        .await;

    assert_eq!(result.outcome, OperationOutcome::Completed);
    assert!(api.calls().iter().filter(|c| c.starts_with("describe_")).count() >= 3);
}

#[tokio::test]
async fn test_provider_rejection_is_reported_verbatim() {
    let h = harness(config());
    let api = seeded(&h).await;
    api.reject_mutations("InvalidDBInstanceState: Instance scratch-db is not in available state.");

    let result = h
        .service
        .execute(OperationRequest::new("scratch-db", "reboot_instance", operator()))
        .await;

    assert_eq!(result.outcome, OperationOutcome::Failed);
    assert_eq!(
        result.message,
        "InvalidDBInstanceState: Instance scratch-db is not in available state."
    );
    assert_eq!(result.final_status, None);
    assert_eq!(h.service.audit_history("scratch-db").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_parameters_never_reach_provider() {
    let h = harness(config());
    let api = seeded(&h).await;

    let window = h
        .service
        .execute(
            OperationRequest::new("scratch-db", "modify_backup_window", operator())
                .with_parameter("backup_window", json!("25:00-26:00")),
        )
        .await;
    let storage = h
        .service
        .execute(
            OperationRequest::new("scratch-db", "modify_storage", operator())
                .with_parameter("allocated_storage", json!(50)),
        )
        .await;

    for result in [&window, &storage] {
        assert_eq!(result.outcome, OperationOutcome::Failed);
        assert!(result.message.starts_with("invalid parameters"));
    }
    assert!(storage.message.contains("100 GiB"));
    assert!(mutations(&api).is_empty());
    assert_eq!(h.service.audit_history("scratch-db").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_unknown_and_removed_instances_are_denied() {
    let h = harness(config());
    let api = seeded(&h).await;

    let unknown = h
        .service
        .execute(OperationRequest::new("ghost-db", "create_snapshot", operator()))
        .await;
    assert_eq!(unknown.outcome, OperationOutcome::Denied);
    assert_eq!(unknown.environment, None);
    let history = h.service.audit_history("ghost-db").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].account_id, None);

    api.set_instances(vec![instance_json(
        "orders-db",
        "available",
        &[("Environment", "prod")],
    )]);
    h.service.run_discovery(ALL_SCOPE).await.unwrap();

    let removed = h
        .service
        .execute(OperationRequest::new("scratch-db", "create_snapshot", operator()))
        .await;
    assert_eq!(removed.outcome, OperationOutcome::Denied);
    assert!(removed.message.contains("scratch-db"));
    assert!(mutations(&api).is_empty());
}

#[tokio::test]
async fn test_unsupported_operation_is_denied() {
    let h = harness(config());
    seeded(&h).await;

    let result = h
        .service
        .execute(OperationRequest::new("scratch-db", "delete_instance", operator()))
        .await;

    assert_eq!(result.outcome, OperationOutcome::Denied);
    assert!(!result.states.contains(&OperationState::RiskClassified));
}

#[tokio::test]
async fn test_audit_write_failure_is_flagged_not_hidden() {
    let h = harness_with_store(config(), Arc::new(AuditFailingStore::default()));
    let api = seeded(&h).await;

    let result = h
        .service
        .execute(
            OperationRequest::new("scratch-db", "modify_backup_window", operator())
                .with_parameter("backup_window", json!("01:00-01:30")),
        )
        .await;

    assert_eq!(result.outcome, OperationOutcome::Completed);
    assert!(result.audit_write_failed);
    assert_eq!(mutations(&api).len(), 1);
    assert!(h.service.audit_history("scratch-db").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_service_refuses_retention_that_would_drop_audit_records() {
    for days in [0, -30] {
        let mut config = config();
        config.audit.retention_days = days;
        let result = try_harness(config, Arc::new(MemoryStore::new()));
        assert!(matches!(result, Err(FleetError::FatalConfig(_))));
    }
}

#[tokio::test]
async fn test_denied_request_audit_survives_short_retention() {
    let mut config = config();
    config.audit.retention_days = 1;
    let h = harness(config);
    let api = seeded(&h).await;

    let result = h
        .service
        .execute(
            OperationRequest::new("orders-db", "stop_instance", operator())
                .with_parameter("confirm_production", json!(true)),
        )
        .await;

    assert_eq!(result.outcome, OperationOutcome::Denied);
    assert!(!result.audit_write_failed);
    assert!(mutations(&api).is_empty());
    let history = h.service.audit_history("orders-db").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(
        history[0].expiry - history[0].recorded_at,
        chrono::Duration::days(1)
    );
}
