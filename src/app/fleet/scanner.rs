use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::credentials::CredentialBroker;
use super::error::AccessErrorKind;
use super::normalizer::RdsInstanceNormalizer;
use super::sdk_errors;
use super::state::{
    DiscoveryError, DiscoveryErrorType, DiscoveryRun, InstanceRecord, Severity, TargetUnit,
};
use crate::app::fleet_config::FleetConfig;

enum UnitOutcome {
    Succeeded {
        records: Vec<InstanceRecord>,
        warnings: Vec<DiscoveryError>,
    },
    Failed(DiscoveryError),
}

/// Fans discovery out over target units with bounded parallelism.
///
/// Units are isolated from each other: a unit that fails, hangs or returns garbage only
/// ever contributes error entries to the run.
pub struct DiscoveryScanner {
    config: Arc<FleetConfig>,
    broker: Arc<CredentialBroker>,
    normalizer: Arc<RdsInstanceNormalizer>,
}

impl DiscoveryScanner {
    pub fn new(
        config: Arc<FleetConfig>,
        broker: Arc<CredentialBroker>,
        normalizer: Arc<RdsInstanceNormalizer>,
    ) -> Self {
        Self {
            config,
            broker,
            normalizer,
        }
    }

    pub async fn discover(&self, units: &[TargetUnit]) -> DiscoveryRun {
        let started = tokio::time::Instant::now();
        let timestamp = Utc::now();
        let settings = &self.config.discovery;
        let deadline = started + settings.run_timeout();
        let unit_timeout = settings.unit_timeout();

        let units_attempted: BTreeSet<TargetUnit> = units.iter().cloned().collect();
        let mut pending = units_attempted.clone();
        let mut run = DiscoveryRun {
            run_id: Uuid::new_v4(),
            timestamp,
            units_attempted,
            units_succeeded: BTreeSet::new(),
            errors: Vec::new(),
            records: Vec::new(),
            duration_ms: 0,
        };

        info!(
            "Discovery run {} starting: {} units, max {} concurrent",
            run.run_id,
            run.units_attempted.len(),
            settings.max_concurrent_units
        );

        let semaphore = Arc::new(Semaphore::new(settings.max_concurrent_units));
        let mut futures: FuturesUnordered<BoxFuture<'static, (TargetUnit, UnitOutcome)>> =
            FuturesUnordered::new();

        for unit in run.units_attempted.iter().cloned() {
            let semaphore = Arc::clone(&semaphore);
            let broker = Arc::clone(&self.broker);
            let normalizer = Arc::clone(&self.normalizer);
            let role_name = self.config.role_name.clone();

            let future = async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("Semaphore closed, aborting scan of {}", unit);
                        let err = sdk_errors::access_error_of_kind(
                            AccessErrorKind::ServiceError,
                            &unit,
                            &role_name,
                            "scan aborted before it started",
                        );
                        return (unit, UnitOutcome::Failed(err.into()));
                    }
                };

                let outcome = match tokio::time::timeout(
                    unit_timeout,
                    scan_unit(&broker, &normalizer, &role_name, &unit, timestamp),
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        let err = sdk_errors::access_error_of_kind(
                            AccessErrorKind::Timeout,
                            &unit,
                            &role_name,
                            &format!("unit scan exceeded {}s", unit_timeout.as_secs()),
                        );
                        UnitOutcome::Failed(err.into())
                    }
                };
                (unit, outcome)
            };
            futures.push(Box::pin(future));
        }

        loop {
            match tokio::time::timeout_at(deadline, futures.next()).await {
                Ok(Some((unit, outcome))) => {
                    pending.remove(&unit);
                    match outcome {
                        UnitOutcome::Succeeded { records, warnings } => {
                            debug!("Unit {} returned {} instances", unit, records.len());
                            run.records.extend(records);
                            run.errors.extend(warnings);
                            run.units_succeeded.insert(unit);
                        }
                        UnitOutcome::Failed(error) => {
                            warn!(
                                "Unit {} failed ({:?}): {}",
                                unit, error.error_type, error.message
                            );
                            run.errors.push(error);
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "Discovery run {} reached its {}s deadline with {} units pending",
                        run.run_id,
                        settings.run_timeout_secs,
                        pending.len()
                    );
                    break;
                }
            }
        }
        drop(futures);

        for unit in pending {
            let err = sdk_errors::access_error_of_kind(
                AccessErrorKind::Timeout,
                &unit,
                &self.config.role_name,
                &format!(
                    "discovery run deadline of {}s reached before the unit completed",
                    settings.run_timeout_secs
                ),
            );
            run.errors.push(err.into());
        }

        run.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Discovery run {} finished in {}ms: {}/{} units succeeded, {} instances, {} errors",
            run.run_id,
            run.duration_ms,
            run.units_succeeded.len(),
            run.units_attempted.len(),
            run.records.len(),
            run.errors.len()
        );
        run
    }
}

async fn scan_unit(
    broker: &CredentialBroker,
    normalizer: &RdsInstanceNormalizer,
    role_name: &str,
    unit: &TargetUnit,
    seen_at: DateTime<Utc>,
) -> UnitOutcome {
    let client = match broker.resolve(&unit.account_id, &unit.region).await {
        Ok(client) => client,
        Err(err) => return UnitOutcome::Failed(err.into()),
    };

    let raw_instances = match client.api.list_db_instances().await {
        Ok(instances) => instances,
        Err(e) => {
            let text = sdk_errors::error_text(&e);
            return UnitOutcome::Failed(sdk_errors::access_error(unit, role_name, &text).into());
        }
    };

    let mut records = Vec::with_capacity(raw_instances.len());
    let mut warnings = Vec::new();
    for raw in &raw_instances {
        match normalizer.normalize(raw, unit, seen_at) {
            Ok(record) => records.push(record),
            Err(e) => warnings.push(DiscoveryError {
                unit: unit.clone(),
                error_type: DiscoveryErrorType::Normalization,
                severity: Severity::Warning,
                message: format!("{:#}", e),
                remediation: "The entry was skipped; the remaining instances of this unit were \
                              recorded."
                    .to_string(),
                can_skip: true,
            }),
        }
    }

    UnitOutcome::Succeeded { records, warnings }
}
