use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::kv_store::KeyValueStore;
use super::state::{DiscoveryRun, InstanceRecord, ReconciliationReport};

const INSTANCE_PREFIX: &str = "instance#";

fn instance_key(instance_id: &str) -> String {
    format!("{}{}", INSTANCE_PREFIX, instance_id)
}

/// Reconciled inventory of instance records, keyed by instance id.
pub struct InventoryStore {
    store: Arc<dyn KeyValueStore>,
}

impl InventoryStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        match self.store.get_by_key(&instance_key(instance_id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value).with_context(|| {
                format!("Corrupt inventory record for {}", instance_id)
            })?)),
            None => Ok(None),
        }
    }

    /// Every stored record, soft-deleted ones included.
    pub async fn list_all(&self) -> Result<Vec<InstanceRecord>> {
        let items = self.store.scan_prefix(INSTANCE_PREFIX).await?;
        let mut records = Vec::with_capacity(items.len());
        for (key, value) in items {
            match serde_json::from_value::<InstanceRecord>(value) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping corrupt inventory item {}: {}", key, e),
            }
        }
        Ok(records)
    }

    pub async fn list_active(&self) -> Result<Vec<InstanceRecord>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|r| !r.is_removed())
            .collect())
    }

    /// Reconcile one discovery run against the stored records.
    ///
    /// Records of units that failed in this run are never touched. A record is
    /// soft-deleted only when its unit succeeded and the run did not return it.
    pub async fn persist(&self, run: &DiscoveryRun) -> ReconciliationReport {
        let mut report = ReconciliationReport::default();

        let existing = match self.list_all().await {
            Ok(records) => records,
            Err(e) => {
                warn!("Cannot load inventory for reconciliation: {:#}", e);
                report
                    .errors
                    .push(format!("failed to load stored inventory: {:#}", e));
                return report;
            }
        };
        let mut existing: HashMap<String, InstanceRecord> = existing
            .into_iter()
            .map(|r| (r.instance_id.clone(), r))
            .collect();

        let mut incoming_by_id: BTreeMap<&str, &InstanceRecord> = BTreeMap::new();
        for incoming in &run.records {
            if incoming_by_id
                .insert(incoming.instance_id.as_str(), incoming)
                .is_some()
            {
                warn!(
                    "Instance id {} returned by more than one unit in run {}; the later sighting in {}:{} wins",
                    incoming.instance_id, run.run_id, incoming.account_id, incoming.region
                );
            }
        }

        for incoming in incoming_by_id.into_values() {
            let previous = existing.remove(&incoming.instance_id);
            let (record, bucket) = match previous {
                None => (incoming.clone(), &mut report.new),
                Some(previous) => {
                    if previous.account_id != incoming.account_id {
                        warn!(
                            "Instance id {} moved from account {} to {}; keeping the newer sighting",
                            incoming.instance_id, previous.account_id, incoming.account_id
                        );
                    }
                    let mut record = incoming.clone();
                    record.created_at = incoming.created_at.or(previous.created_at);
                    if previous.semantically_equal(&record) && !previous.is_removed() {
                        record.last_updated_at = previous.last_updated_at;
                        (record, &mut report.unchanged)
                    } else {
                        record.last_updated_at = incoming.last_seen_at;
                        (record, &mut report.updated)
                    }
                }
            };

            match self.write(&record).await {
                Ok(()) => bucket.push(record.instance_id),
                Err(e) => report
                    .errors
                    .push(format!("failed to write {}: {:#}", record.instance_id, e)),
            }
        }

        // Whatever is left was not returned by this run.
        for (_, mut record) in existing {
            if record.is_removed() || !run.unit_succeeded(&record.unit()) {
                continue;
            }
            record.removed_at = Some(run.timestamp);
            match self.write(&record).await {
                Ok(()) => {
                    debug!(
                        "Soft-deleted {} ({}); absent from successful scan",
                        record.instance_id,
                        record.unit()
                    );
                    report.removed.push(record.instance_id);
                }
                Err(e) => report
                    .errors
                    .push(format!("failed to soft-delete {}: {:#}", record.instance_id, e)),
            }
        }

        report.new.sort();
        report.updated.sort();
        report.unchanged.sort();
        report.removed.sort();

        info!(
            "Reconciled run {}: {} new, {} updated, {} unchanged, {} removed, {} errors",
            run.run_id,
            report.new.len(),
            report.updated.len(),
            report.unchanged.len(),
            report.removed.len(),
            report.errors.len()
        );
        report
    }

    /// Physically delete soft-deleted records removed before `older_than`.
    ///
    /// Deletion is conditional on the stored value, so a record revived by a concurrent
    /// reconciliation survives.
    pub async fn purge_removed(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut purged = 0;
        for (key, value) in self.store.scan_prefix(INSTANCE_PREFIX).await? {
            let Ok(record) = serde_json::from_value::<InstanceRecord>(value.clone()) else {
                continue;
            };
            if record.removed_at.is_some_and(|at| at < older_than)
                && self.store.conditional_delete(&key, &value).await?
            {
                purged += 1;
            }
        }
        if purged > 0 {
            info!("Purged {} soft-deleted inventory records", purged);
        }
        Ok(purged)
    }

    async fn write(&self, record: &InstanceRecord) -> Result<()> {
        let value = serde_json::to_value(record).context("Failed to serialize record")?;
        self.store
            .put(&instance_key(&record.instance_id), value, None)
            .await
    }
}
