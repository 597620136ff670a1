//! Reconciliation orchestrator.
//!
//! Drives one batch of order records: resolves identities, builds
//! payloads, executes mutations through the resilient executor and
//! aggregates a [`SyncReport`]. Failure of one record never aborts the
//! batch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{StatusRef, TrackerClient};
use crate::config::{RetryConfig, SyncConfig, TrackerConfig};
use crate::error::{error_message, ErrorKind, SyncError, SyncResult};
use crate::executor::MutationExecutor;
use crate::fieldmap::{compute_diff, discover_fieldmap, FieldMap, FieldOverrides};
use crate::identity::{payload_fingerprint, IdentityKey, IdentityStore, KeyedLocks};
use crate::status::suggest_tracker_status;

use super::record::{EntityState, OrderRecord, RecordOutcome, SyncAction};
use super::report::SyncReport;

/// Shared state for one synchronization run.
///
/// Constructed once and passed explicitly to every operation; holds the
/// tracker client, the identity store handle, the mutation executor and
/// the per-project field map cache.
pub struct SyncContext {
    client: Arc<TrackerClient>,
    store: Arc<dyn IdentityStore>,
    executor: MutationExecutor,
    config: SyncConfig,
    overrides: FieldOverrides,
    fieldmaps: RwLock<HashMap<String, Arc<FieldMap>>>,
    statuses: RwLock<Option<Arc<HashMap<String, StatusRef>>>>,
    locks: KeyedLocks,
}

impl SyncContext {
    /// Build the context from configuration and an identity store.
    ///
    /// Loads the override tables eagerly so a malformed override file
    /// fails the run up front instead of surfacing per record.
    pub fn new(
        tracker: &TrackerConfig,
        retry: RetryConfig,
        config: SyncConfig,
        store: Arc<dyn IdentityStore>,
    ) -> SyncResult<Self> {
        let client = Arc::new(TrackerClient::new(tracker)?);
        let overrides = FieldOverrides::load(tracker)?;
        let quota = Arc::new(Semaphore::new(config.max_concurrent_requests));
        let executor = MutationExecutor::new(Arc::clone(&client), retry, quota);
        Ok(Self {
            client,
            store,
            executor,
            config,
            overrides,
            fieldmaps: RwLock::new(HashMap::new()),
            statuses: RwLock::new(None),
            locks: KeyedLocks::new(),
        })
    }

    /// Field map for a project, discovered once and cached for the run.
    async fn fieldmap_for(&self, project_key: &str) -> SyncResult<Arc<FieldMap>> {
        if let Some(map) = self.fieldmaps.read().await.get(project_key) {
            return Ok(Arc::clone(map));
        }
        let map = Arc::new(discover_fieldmap(&self.client, project_key, &self.overrides).await?);
        self.fieldmaps
            .write()
            .await
            .insert(project_key.to_string(), Arc::clone(&map));
        Ok(map)
    }

    /// Tracker status catalog, fetched once per run.
    ///
    /// Fails soft to an empty catalog; payloads then carry no workflow
    /// status link.
    async fn statuses(&self) -> Arc<HashMap<String, StatusRef>> {
        if let Some(catalog) = self.statuses.read().await.as_ref() {
            return Arc::clone(catalog);
        }
        let catalog = match self.client.list_statuses().await {
            Ok(catalog) => catalog,
            Err(error) => {
                warn!(%error, "status discovery failed; continuing without status links");
                HashMap::new()
            }
        };
        let catalog = Arc::new(catalog);
        *self.statuses.write().await = Some(Arc::clone(&catalog));
        catalog
    }
}

/// One order's records, grouped for story-after-epic ordering.
struct OrderGroup {
    project: String,
    order_id: String,
    records: Vec<OrderRecord>,
}

fn group_orders(batch: Vec<OrderRecord>) -> Vec<OrderGroup> {
    let mut index: HashMap<(String, String), usize> = HashMap::new();
    let mut groups: Vec<OrderGroup> = Vec::new();
    for record in batch {
        let key = (record.project.clone(), record.order_id.clone());
        match index.get(&key) {
            Some(&i) => groups[i].records.push(record),
            None => {
                index.insert(key, groups.len());
                groups.push(OrderGroup {
                    project: record.project.clone(),
                    order_id: record.order_id.clone(),
                    records: vec![record],
                });
            }
        }
    }
    groups
}

/// Batch synchronization engine.
pub struct SyncEngine {
    context: Arc<SyncContext>,
}

impl SyncEngine {
    /// Create an engine over a shared context.
    #[must_use]
    pub fn new(context: Arc<SyncContext>) -> Self {
        Self { context }
    }

    /// Synchronize one batch of order records.
    ///
    /// Distinct orders run on a bounded worker pool; records of the
    /// same order are processed in sequence, epic before stories. A
    /// configured deadline stops scheduling new orders; work already
    /// in flight runs to completion.
    pub async fn run(&self, batch: Vec<OrderRecord>) -> SyncReport {
        let mut report = SyncReport::start();
        let groups = group_orders(batch);
        info!(
            run_id = %report.run_id,
            orders = groups.len(),
            workers = self.context.config.workers,
            "starting synchronization run"
        );

        let deadline = self
            .context
            .config
            .deadline_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        let workers = Arc::new(Semaphore::new(self.context.config.workers));
        let mut tasks: JoinSet<Vec<RecordOutcome>> = JoinSet::new();

        for group in groups {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(
                    order_id = %group.order_id,
                    "batch deadline reached; order not scheduled"
                );
                for record in &group.records {
                    report.record(RecordOutcome::blocked(
                        record.identity_key(),
                        "batch deadline reached before scheduling",
                    ));
                }
                continue;
            }
            let permit = Arc::clone(&workers).acquire_owned().await.ok();
            let context = Arc::clone(&self.context);
            tasks.spawn(async move {
                let _permit = permit;
                sync_group(&context, group).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        report.record(outcome);
                    }
                }
                Err(error) => warn!(%error, "order worker task failed"),
            }
        }

        report.finish();
        info!(
            run_id = %report.run_id,
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            dropped = report.dropped,
            orphaned = report.orphaned,
            blocked = report.blocked,
            "synchronization run finished"
        );
        report
    }
}

/// Process every record of one order, epic first.
async fn sync_group(context: &SyncContext, group: OrderGroup) -> Vec<RecordOutcome> {
    let mut outcomes = Vec::with_capacity(group.records.len());
    let mut epic_record = None;
    let mut stories = Vec::new();
    for record in group.records {
        if record.is_epic() {
            if epic_record.is_none() {
                epic_record = Some(record);
            } else {
                warn!(order_id = %record.order_id, "duplicate epic record in batch");
                outcomes.push(RecordOutcome::dropped(
                    record.identity_key(),
                    None,
                    "duplicate epic record for this order",
                ));
            }
        } else {
            stories.push(record);
        }
    }

    // Stories need their parent epic resolved or created first.
    let (epic_key, block_reason) = match epic_record {
        Some(record) => {
            let outcome = sync_entity(context, &record, None).await;
            let epic_key = match outcome.state {
                EntityState::Registered => outcome.issue_key.clone(),
                _ => None,
            };
            let reason = match outcome.state {
                EntityState::Registered => None,
                EntityState::Orphaned => Some("parent epic is orphaned"),
                _ => Some("parent epic was not created"),
            };
            outcomes.push(outcome);
            (epic_key, reason)
        }
        None => match context
            .store
            .resolve_epic(&group.project, &group.order_id)
            .await
        {
            Ok(Some(epic_key)) => (Some(epic_key), None),
            Ok(None) => (None, Some("no epic record and no registered epic")),
            Err(error) => {
                warn!(order_id = %group.order_id, %error, "epic identity lookup failed");
                (None, Some("epic identity lookup failed"))
            }
        },
    };

    for record in stories {
        match &epic_key {
            Some(parent) => {
                let outcome = sync_entity(context, &record, Some(parent.clone())).await;
                outcomes.push(outcome);
            }
            None => {
                let reason = block_reason.unwrap_or("parent epic unavailable");
                outcomes.push(RecordOutcome::blocked(record.identity_key(), reason));
            }
        }
    }
    outcomes
}

/// Synchronize one entity: resolve, create or update, register.
///
/// Holds the per-key lock across the whole resolve, mutate, register
/// sequence so racing workers on the same key serialize.
async fn sync_entity(
    context: &SyncContext,
    record: &OrderRecord,
    parent_key: Option<String>,
) -> RecordOutcome {
    let key = record.identity_key();
    let _guard = context.locks.lock(&key).await;

    let resolved = match resolve_identity(context, record).await {
        Ok(resolved) => resolved,
        Err(error) => {
            warn!(key = %key, %error, "identity lookup failed");
            return RecordOutcome::dropped(key, None, error.to_string());
        }
    };

    let fieldmap = match context.fieldmap_for(&record.project).await {
        Ok(fieldmap) => fieldmap,
        Err(error) => {
            warn!(key = %key, %error, "field map discovery failed");
            return RecordOutcome::dropped(key, None, error.to_string());
        }
    };

    let spec = record.issue_spec(parent_key);
    let build = fieldmap.build_payload(&spec);
    let mut payload = build.payload;
    if !build.omitted.is_empty() {
        debug!(key = %key, omitted = ?build.omitted, "fields omitted from payload");
    }

    // Link the matching workflow status when the catalog knows it.
    if !record.status.trim().is_empty() {
        let catalog = context.statuses().await;
        let suggestion = suggest_tracker_status(&record.status, &catalog);
        if suggestion.matched {
            if let Some(status) = catalog.get(&suggestion.suggested.to_lowercase()) {
                payload["_links"]["status"] = json!({"href": status.href});
            }
        }
    }

    match resolved {
        Some(issue_key) => {
            update_entity(context, key, issue_key, payload, build.omitted).await
        }
        None => create_entity(context, record, key, payload, build.omitted).await,
    }
}

async fn resolve_identity(
    context: &SyncContext,
    record: &OrderRecord,
) -> SyncResult<Option<String>> {
    match record.instance {
        Some(instance) => {
            context
                .store
                .resolve_story(&record.project, &record.order_id, instance)
                .await
        }
        None => context.store.resolve_epic(&record.project, &record.order_id).await,
    }
}

async fn register_identity(
    context: &SyncContext,
    record: &OrderRecord,
    issue_key: &str,
) -> SyncResult<()> {
    match record.instance {
        Some(instance) => {
            context
                .store
                .register_story(&record.project, &record.order_id, instance, issue_key)
                .await
        }
        None => {
            context
                .store
                .register_epic(&record.project, &record.order_id, issue_key)
                .await
        }
    }
}

async fn create_entity(
    context: &SyncContext,
    record: &OrderRecord,
    key: IdentityKey,
    payload: serde_json::Value,
    omitted: Vec<String>,
) -> RecordOutcome {
    let fingerprint = payload_fingerprint(&payload);
    let outcome = context.executor.create(&payload).await;
    if !outcome.ok {
        warn!(key = %key, attempts = outcome.attempts, "create failed");
        return RecordOutcome::dropped(key, outcome.error, error_message(&outcome.body))
            .with_attempts(outcome.attempts)
            .with_omitted(omitted);
    }
    let Some(issue_key) = outcome.issue_key else {
        return RecordOutcome::dropped(
            key,
            None,
            "create succeeded but the response carried no issue key",
        )
        .with_attempts(outcome.attempts);
    };
    if let Err(error) = register_identity(context, record, &issue_key).await {
        // The invariant is already violated for this key; surface it,
        // never overwrite.
        warn!(key = %key, issue_key, %error, "identity registration failed");
        let kind = matches!(error, SyncError::IdentityConflict { .. })
            .then_some(ErrorKind::IdentityConflict);
        return RecordOutcome::dropped(key, kind, error.to_string())
            .with_attempts(outcome.attempts);
    }
    if let Err(error) = context.store.record_fingerprint(&key, &fingerprint).await {
        debug!(key = %key, %error, "fingerprint not recorded");
    }
    info!(key = %key, issue_key, "created issue");
    RecordOutcome::registered(key, SyncAction::Created, issue_key)
        .with_attempts(outcome.attempts)
        .with_omitted(omitted)
}

async fn update_entity(
    context: &SyncContext,
    key: IdentityKey,
    issue_key: String,
    payload: serde_json::Value,
    omitted: Vec<String>,
) -> RecordOutcome {
    if !context.config.update_existing {
        return RecordOutcome::registered(key, SyncAction::Unchanged, issue_key)
            .with_identity_hit();
    }

    // Existence is verified on every run; a deleted target must
    // surface as orphaned even when nothing drifted locally.
    let current = match context.client.get_work_package(&issue_key).await {
        Ok(Some(current)) => current,
        Ok(None) => {
            warn!(key = %key, issue_key, "registered issue is gone from the tracker");
            return RecordOutcome::orphaned(key, issue_key);
        }
        Err(error) => {
            warn!(key = %key, issue_key, %error, "fetching current issue failed");
            return RecordOutcome::dropped(key, None, error.to_string()).with_identity_hit();
        }
    };

    // Identical planned payload means nothing drifted since the last
    // applied write; skip the diff and the update call.
    let fingerprint = payload_fingerprint(&payload);
    let last = context
        .store
        .last_fingerprint(&key)
        .await
        .unwrap_or_default();
    if last.as_deref() == Some(fingerprint.as_str()) {
        debug!(key = %key, issue_key, "payload fingerprint unchanged");
        return RecordOutcome::registered(key, SyncAction::Unchanged, issue_key)
            .with_identity_hit();
    }

    let diff = compute_diff(&payload, &current);
    if diff.as_object().map_or(true, serde_json::Map::is_empty) {
        if let Err(error) = context.store.record_fingerprint(&key, &fingerprint).await {
            debug!(key = %key, %error, "fingerprint not recorded");
        }
        return RecordOutcome::registered(key, SyncAction::Unchanged, issue_key)
            .with_identity_hit();
    }

    let outcome = context.executor.update(&issue_key, &diff).await;
    if outcome.ok {
        if let Err(error) = context.store.record_fingerprint(&key, &fingerprint).await {
            debug!(key = %key, %error, "fingerprint not recorded");
        }
        info!(key = %key, issue_key, attempts = outcome.attempts, "updated issue");
        return RecordOutcome::registered(key, SyncAction::Updated, issue_key)
            .with_attempts(outcome.attempts)
            .with_identity_hit()
            .with_omitted(omitted);
    }
    if outcome.is_gone() {
        warn!(key = %key, issue_key, "update target is gone; orphaned identity");
        return RecordOutcome::orphaned(key, issue_key).with_attempts(outcome.attempts);
    }
    warn!(key = %key, issue_key, attempts = outcome.attempts, "update failed");
    RecordOutcome::dropped(key, outcome.error, error_message(&outcome.body))
        .with_attempts(outcome.attempts)
        .with_identity_hit()
}
