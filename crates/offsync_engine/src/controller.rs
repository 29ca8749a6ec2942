//! The sync controller.
//!
//! One sync episode:
//! 1. read the ledger and keep the eligible changes (pending, past backoff)
//! 2. group them by endpoint, each group in `enqueuedAt` order
//! 3. send every group concurrently, each bounded by the request timeout
//! 4. apply each outcome on its own: accepted changes leave the ledger and
//!    their records are refreshed; conflicts go through the policy; failed
//!    batches are rescheduled with exponential backoff
//!
//! The store is updated through write batches, so each outcome is applied
//! entirely or not at all.

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{SyncError, SyncResult};
use crate::ledger::ChangeLedger;
use crate::observer::{SyncErrorReport, SyncObserver};
use crate::transport::SyncTransport;
use futures::future::join_all;
use offsync_protocol::{
    Action, ChangeId, ChangeRequest, ChangeState, Conflict, ConflictId, LocalRecord, Method,
    QueuedChange, SyncBatchRequest, SyncBatchResponse, SyncStatus, SYNC_STATUS_FIELD,
    VERSION_FIELD,
};
use offsync_storage::{
    CollectionSchema, Document, LocalStore, Query, RecordKey, StorageError, StorageEstimate,
    StoreSchema, WriteBatch, KEY_FIELD,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Collection holding conflicts that wait for manual resolution.
pub const SYNC_CONFLICTS: &str = "syncConflicts";

/// The current state of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Not syncing.
    Idle,
    /// A sync episode is in flight.
    Syncing,
    /// Not syncing; some changes wait on a backoff deadline.
    Backoff,
}

impl SyncState {
    /// Returns true if a sync episode is in flight.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Syncing)
    }

    /// Returns true if a new episode may start.
    pub fn can_start_sync(&self) -> bool {
        !self.is_active()
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Sync episodes completed.
    pub cycles_completed: u64,
    /// Changes confirmed by the server.
    pub changes_synced: u64,
    /// Conflicts reported by the server.
    pub conflicts_encountered: u64,
    /// Batch sends that failed.
    pub failed_batches: u64,
    /// Changes that ran out of retries.
    pub changes_exhausted: u64,
}

/// Result of one sync episode.
#[derive(Debug, Clone, Default)]
pub struct SyncCycleResult {
    /// Changes the server accepted.
    pub synced: Vec<ChangeId>,
    /// Records refreshed from server copies.
    pub records_updated: usize,
    /// Conflicts reported by the server, with the action taken.
    pub conflicts: Vec<(Conflict, Action)>,
    /// Changes whose batch failed and that will be retried.
    pub failed: Vec<ChangeId>,
    /// Changes that ran out of retries in this episode.
    pub exhausted: Vec<ChangeId>,
    /// Changes sent but neither accepted nor in conflict. They stay queued.
    pub unacknowledged: Vec<ChangeId>,
    /// Endpoints whose outcome could not be applied locally. Their changes
    /// stay queued; other endpoints are unaffected.
    pub endpoint_errors: Vec<SyncErrorReport>,
    /// Queued changes left after the episode.
    pub pending_count: usize,
    /// Wall time of the episode.
    pub duration: Duration,
}

impl SyncCycleResult {
    /// Returns true if no batch failed and nothing was exhausted.
    pub fn success(&self) -> bool {
        self.failed.is_empty() && self.exhausted.is_empty() && self.endpoint_errors.is_empty()
    }

    /// Returns true if nothing was sent.
    pub fn is_empty(&self) -> bool {
        self.synced.is_empty()
            && self.conflicts.is_empty()
            && self.failed.is_empty()
            && self.exhausted.is_empty()
            && self.unacknowledged.is_empty()
            && self.endpoint_errors.is_empty()
    }
}

/// Snapshot returned by [`SyncController::sync_status`].
#[derive(Debug, Clone)]
pub struct SyncStatusReport {
    /// Connectivity.
    pub is_online: bool,
    /// Whether an episode is in flight.
    pub is_syncing: bool,
    /// Controller state.
    pub state: SyncState,
    /// End of the last episode, in milliseconds since the Unix epoch.
    pub last_sync_time: Option<i64>,
    /// Queued changes, whatever their state.
    pub pending_change_count: usize,
    /// Terminal errors, oldest first.
    pub sync_errors: Vec<SyncErrorReport>,
    /// Storage quota in bytes.
    pub storage_quota: u64,
    /// Storage in use in bytes.
    pub storage_usage: u64,
}

/// Clears the in-flight flag when an episode ends, however it ends.
struct EpisodeGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> EpisodeGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for EpisodeGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

enum BatchOutcome {
    Answered(SyncBatchResponse),
    Failed(SyncError),
}

/// Orchestrates queuing, sending and reconciling local changes.
///
/// # Example
///
/// ```rust
/// use offsync_engine::{ChangeRequest, ConnectivityMonitor, MockTransport, SyncConfig, SyncController};
/// use offsync_storage::LocalStore;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let controller = SyncController::new(
///     Arc::new(LocalStore::in_memory()),
///     Arc::new(MockTransport::new()),
///     ConnectivityMonitor::new(false),
///     SyncConfig::default(),
/// )?;
///
/// controller.queue_change(ChangeRequest::update("tasks", json!({"id": 7, "status": "done"})))?;
/// assert_eq!(controller.sync_status()?.pending_change_count, 1);
///
/// controller.connectivity().go_online();
/// controller.sync_now().await?;
/// assert_eq!(controller.sync_status()?.pending_change_count, 0);
/// # Ok(())
/// # }
/// ```
pub struct SyncController {
    store: Arc<LocalStore>,
    ledger: ChangeLedger,
    transport: Arc<dyn SyncTransport>,
    connectivity: ConnectivityMonitor,
    config: SyncConfig,
    observers: RwLock<Vec<Arc<dyn SyncObserver>>>,
    state: RwLock<SyncState>,
    in_flight: AtomicBool,
    stats: RwLock<SyncStats>,
    errors: RwLock<Vec<SyncErrorReport>>,
    last_sync_time: RwLock<Option<i64>>,
}

impl SyncController {
    /// Creates a controller, provisioning the ledger and conflict collections.
    pub fn new(
        store: Arc<LocalStore>,
        transport: Arc<dyn SyncTransport>,
        connectivity: ConnectivityMonitor,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        let ledger = ChangeLedger::open(Arc::clone(&store))?;
        store.provision(&StoreSchema::new().collection(CollectionSchema::new(SYNC_CONFLICTS)))?;

        Ok(Self {
            store,
            ledger,
            transport,
            connectivity,
            config,
            observers: RwLock::new(Vec::new()),
            state: RwLock::new(SyncState::Idle),
            in_flight: AtomicBool::new(false),
            stats: RwLock::new(SyncStats::default()),
            errors: RwLock::new(Vec::new()),
            last_sync_time: RwLock::new(None),
        })
    }

    /// Registers an observer.
    pub fn add_observer(&self, observer: Arc<dyn SyncObserver>) {
        self.observers.write().push(observer);
    }

    /// Returns the connectivity monitor.
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// Returns the ledger.
    pub fn ledger(&self) -> &ChangeLedger {
        &self.ledger
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    fn now(&self) -> i64 {
        self.config.clock.now_millis()
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    fn notify<F: Fn(&dyn SyncObserver)>(&self, f: F) {
        let observers = self.observers.read().clone();
        for observer in &observers {
            f(observer.as_ref());
        }
    }

    fn ensure_collection(&self, name: &str) -> SyncResult<()> {
        self.store
            .provision(&StoreSchema::new().collection(CollectionSchema::records(name)))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Enqueue
    // ------------------------------------------------------------------

    /// Queues a mutation. Returns once it is durable, never waiting on the
    /// network.
    ///
    /// The local copy of the targeted record is updated at once: creates and
    /// updates are merged into it and it is marked pending; deletes remove
    /// it.
    pub fn queue_change(&self, request: ChangeRequest) -> SyncResult<ChangeId> {
        request.validate()?;
        self.ensure_collection(&request.endpoint)?;

        let key = request.data.get(KEY_FIELD).and_then(RecordKey::from_value);
        let existing = match &key {
            Some(key) => self.store.get(&request.endpoint, key)?,
            None => None,
        };
        let base_version = existing
            .as_ref()
            .and_then(|r| r.get(VERSION_FIELD))
            .and_then(Value::as_u64);

        let change = QueuedChange::new(request, self.now()).with_base_version(base_version);

        let mut batch = WriteBatch::new();
        self.ledger.stage_put(&mut batch, &change)?;

        if let Some(key) = &key {
            match change.method {
                Method::Delete => {
                    batch.delete(change.endpoint.as_str(), key);
                }
                Method::Create | Method::Update => {
                    let mut record = existing.unwrap_or_default();
                    merge_payload(&mut record, &change.payload);
                    SyncStatus::Pending.apply(&mut record);
                    batch.put(change.endpoint.as_str(), Value::Object(record));
                }
            }
        }

        self.store.write(batch)?;
        tracing::debug!(
            change_id = %change.id,
            endpoint = %change.endpoint,
            method = %change.method,
            "change queued"
        );
        Ok(change.id)
    }

    // ------------------------------------------------------------------
    // Sync episodes
    // ------------------------------------------------------------------

    /// Runs one sync episode now.
    ///
    /// Each endpoint's outcome is applied on its own. One that cannot be
    /// applied is listed in [`SyncCycleResult::endpoint_errors`] and leaves
    /// its changes queued; the other endpoints still complete.
    ///
    /// # Errors
    ///
    /// - [`SyncError::NotConnected`] while offline
    /// - [`SyncError::AlreadySyncing`] if an episode is in flight
    /// - storage errors raised while reading the ledger
    pub async fn sync_now(&self) -> SyncResult<SyncCycleResult> {
        if !self.connectivity.is_online() {
            return Err(SyncError::NotConnected);
        }
        let Some(_guard) = EpisodeGuard::acquire(&self.in_flight) else {
            return Err(SyncError::AlreadySyncing);
        };

        self.set_state(SyncState::Syncing);
        self.notify(|o| o.on_sync_start());
        let start = Instant::now();

        let outcome = self.run_episode().await;

        *self.last_sync_time.write() = Some(self.now());
        let next_state = match self.next_backoff_deadline() {
            Ok(Some(_)) => SyncState::Backoff,
            _ => SyncState::Idle,
        };
        self.set_state(next_state);

        let mut result = match outcome {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(error = %err, "sync episode failed");
                let report = SyncErrorReport {
                    change_id: None,
                    endpoint: None,
                    message: err.to_string(),
                    retry_count: 0,
                    at: self.now(),
                };
                self.record_error(report.clone());
                self.notify(|o| o.on_sync_error(&report));
                return Err(err);
            }
        };

        result.duration = start.elapsed();
        result.pending_count = self.ledger.count()?;
        self.stats.write().cycles_completed += 1;

        tracing::info!(
            synced = result.synced.len(),
            conflicts = result.conflicts.len(),
            failed = result.failed.len(),
            exhausted = result.exhausted.len(),
            pending = result.pending_count,
            "sync episode complete"
        );
        self.notify(|o| o.on_sync_complete(&result));
        self.check_storage();

        Ok(result)
    }

    async fn run_episode(&self) -> SyncResult<SyncCycleResult> {
        let mut result = SyncCycleResult::default();
        let now = self.now();

        let mut groups: BTreeMap<String, Vec<QueuedChange>> = BTreeMap::new();
        for change in self.ledger.list_all()? {
            if change.is_eligible(now) {
                groups.entry(change.endpoint.clone()).or_default().push(change);
            }
        }

        if groups.is_empty() {
            tracing::debug!("nothing eligible to sync");
            return Ok(result);
        }

        let sends = groups.into_iter().map(|(endpoint, changes)| async move {
            let request = SyncBatchRequest::new(endpoint.clone(), changes.clone());
            tracing::debug!(%endpoint, changes = changes.len(), "sending batch");
            let send = self.transport.send_batch(request);
            let outcome = match tokio::time::timeout(self.config.request_timeout, send).await {
                Ok(Ok(response)) => BatchOutcome::Answered(response),
                Ok(Err(err)) => BatchOutcome::Failed(err),
                Err(_) => BatchOutcome::Failed(SyncError::Timeout),
            };
            (endpoint, changes, outcome)
        });

        for (endpoint, sent, outcome) in join_all(sends).await {
            let applied = match outcome {
                BatchOutcome::Answered(response) => {
                    let acknowledged: HashSet<ChangeId> = response
                        .synced_ids
                        .iter()
                        .copied()
                        .chain(response.conflicts.iter().map(|c| c.client_change.id))
                        .collect();
                    result.unacknowledged.extend(
                        sent.iter()
                            .map(|c| c.id)
                            .filter(|id| !acknowledged.contains(id)),
                    );
                    self.apply_response(&endpoint, response, &mut result)
                }
                BatchOutcome::Failed(err) => {
                    self.apply_failure(&endpoint, &sent, &err, &mut result)
                }
            };
            if let Err(err) = applied {
                self.report_endpoint_error(&endpoint, &err, &mut result);
            }
        }

        Ok(result)
    }

    /// Logs an outcome that could not be applied. The endpoint's changes stay
    /// queued as they were.
    fn report_endpoint_error(
        &self,
        endpoint: &str,
        err: &SyncError,
        result: &mut SyncCycleResult,
    ) {
        tracing::error!(%endpoint, error = %err, "could not apply batch outcome");
        let report = SyncErrorReport {
            change_id: None,
            endpoint: Some(endpoint.to_string()),
            message: err.to_string(),
            retry_count: 0,
            at: self.now(),
        };
        self.record_error(report.clone());
        self.notify(|o| o.on_sync_error(&report));
        result.endpoint_errors.push(report);
    }

    /// Applies a server response for `endpoint`.
    ///
    /// Ids that are no longer queued are skipped, so applying the same
    /// response twice changes nothing the second time.
    pub fn apply_response(
        &self,
        endpoint: &str,
        response: SyncBatchResponse,
        result: &mut SyncCycleResult,
    ) -> SyncResult<()> {
        self.ensure_collection(endpoint)?;

        let mut batch = WriteBatch::new();
        let mut confirmed = HashSet::new();
        let mut accepted = Vec::new();

        for id in &response.synced_ids {
            match self.ledger.get(*id)? {
                Some(change) => {
                    self.ledger.stage_remove(&mut batch, *id);
                    confirmed.insert(*id);
                    accepted.push(change);
                }
                None => tracing::debug!(change_id = %id, "ignoring already confirmed change"),
            }
        }

        let mut refreshed = HashSet::new();
        for update in response.updates {
            let Some(key) = update.get(KEY_FIELD).and_then(RecordKey::from_value) else {
                tracing::warn!(%endpoint, "server update without an id, skipping");
                continue;
            };
            let Value::Object(record) = update else {
                continue;
            };
            self.stage_server_copy(&mut batch, endpoint, &key, record, &confirmed)?;
            refreshed.insert(key);
            result.records_updated += 1;
        }

        // Accepted changes the server sent no copy for.
        for change in &accepted {
            let Some(key) = change.record_id().and_then(RecordKey::from_value) else {
                continue;
            };
            if refreshed.contains(&key) {
                continue;
            }
            if change.method == Method::Delete {
                batch.delete(endpoint, &key);
            } else if let Some(mut record) = self.store.get(endpoint, &key)? {
                self.status_after(endpoint, &key, &confirmed)?.apply(&mut record);
                batch.put_verbatim(endpoint, Value::Object(record));
            }
        }

        self.store.write(batch)?;

        result.synced.extend(accepted.iter().map(|c| c.id));
        self.stats.write().changes_synced += accepted.len() as u64;

        for report in response.conflicts {
            let Some(change) = self.ledger.get(report.client_change.id)? else {
                tracing::debug!(
                    change_id = %report.client_change.id,
                    "ignoring conflict for a change no longer queued"
                );
                continue;
            };
            let mut conflict = Conflict::from_report(report, self.now());
            conflict.client_change = change;
            let action = self.handle_conflict(&conflict)?;
            result.conflicts.push((conflict, action));
        }

        Ok(())
    }

    /// Changes still referencing a record once those in `confirmed` are gone.
    fn remaining_references(
        &self,
        endpoint: &str,
        key: &RecordKey,
        confirmed: &HashSet<ChangeId>,
    ) -> SyncResult<Vec<QueuedChange>> {
        Ok(self
            .ledger
            .references(endpoint, key)?
            .into_iter()
            .filter(|c| !confirmed.contains(&c.id))
            .collect())
    }

    /// Status a record should carry once the changes in `confirmed` are gone.
    fn status_after(
        &self,
        endpoint: &str,
        key: &RecordKey,
        confirmed: &HashSet<ChangeId>,
    ) -> SyncResult<SyncStatus> {
        Ok(status_of(&self.remaining_references(endpoint, key, confirmed)?))
    }

    /// Stages a server copy as the local record, with the client's remaining
    /// changes to it replayed on top.
    ///
    /// Remaining changes that are not deferred are rebased on the server's
    /// version: they were made after the changes the server just took.
    fn stage_server_copy(
        &self,
        batch: &mut WriteBatch,
        endpoint: &str,
        key: &RecordKey,
        server: Document,
        confirmed: &HashSet<ChangeId>,
    ) -> SyncResult<()> {
        let remaining = self.remaining_references(endpoint, key, confirmed)?;
        let version = server.get(VERSION_FIELD).and_then(Value::as_u64);
        let mut record = Some(server);

        for change in &remaining {
            if version.is_some() && !change.is_deferred() && change.base_version != version {
                let mut rebased = change.clone();
                rebased.base_version = version;
                self.ledger.stage_put(batch, &rebased)?;
            }
            match change.method {
                Method::Delete => record = None,
                Method::Create | Method::Update => {
                    merge_payload(record.get_or_insert_with(Document::new), &change.payload);
                }
            }
        }

        match record {
            Some(mut record) => {
                status_of(&remaining).apply(&mut record);
                batch.put_verbatim(endpoint, Value::Object(record));
            }
            None => {
                batch.delete(endpoint, key);
            }
        }
        Ok(())
    }

    fn handle_conflict(&self, conflict: &Conflict) -> SyncResult<Action> {
        let action = self.config.conflict_policy.resolve(conflict);
        let change = &conflict.client_change;
        tracing::info!(
            conflict_id = %conflict.id,
            change_id = %change.id,
            endpoint = %change.endpoint,
            ?action,
            "conflict detected"
        );
        self.stats.write().conflicts_encountered += 1;

        match action {
            Action::AcceptServer => self.accept_server_version(conflict)?,
            Action::ResendClient => {
                let server_version = conflict.server_version_number();
                let now = self.now();
                self.ledger.reschedule(change.id, |c| {
                    c.mark_resent();
                    c.enqueued_at = now;
                    c.next_attempt_at = None;
                    c.state = ChangeState::Pending;
                    c.base_version = server_version;
                })?;
            }
            Action::Defer => {
                let mut deferred = change.clone();
                deferred.state = ChangeState::Deferred {
                    conflict_id: conflict.id,
                };
                let mut batch = WriteBatch::new();
                self.ledger.stage_put(&mut batch, &deferred)?;
                batch.put_verbatim(SYNC_CONFLICTS, serde_json::to_value(conflict)?);
                self.store.write(batch)?;
            }
        }

        self.notify(|o| o.on_conflict(conflict));
        Ok(action)
    }

    /// Replaces the local record with the server copy and drops the change.
    fn accept_server_version(&self, conflict: &Conflict) -> SyncResult<()> {
        let change = &conflict.client_change;
        let endpoint = change.endpoint.as_str();
        self.ensure_collection(endpoint)?;

        let mut batch = WriteBatch::new();
        self.ledger.stage_remove(&mut batch, change.id);
        batch.delete(SYNC_CONFLICTS, conflict.id.to_string());

        let confirmed = HashSet::from([change.id]);
        match &conflict.server_version {
            Value::Object(server) => {
                // A server copy without a usable id still replaces the
                // record the change targeted.
                let id = server
                    .get(KEY_FIELD)
                    .filter(|id| RecordKey::from_value(id).is_some())
                    .or_else(|| change.record_id())
                    .cloned();
                let keyed = id.and_then(|id| RecordKey::from_value(&id).map(|key| (id, key)));
                if let Some((id, key)) = keyed {
                    let mut server = server.clone();
                    server.insert(KEY_FIELD.to_string(), id);
                    self.stage_server_copy(&mut batch, endpoint, &key, server, &confirmed)?;
                }
            }
            _ => {
                if let Some(key) = change.record_id().and_then(RecordKey::from_value) {
                    batch.delete(endpoint, &key);
                }
            }
        }

        self.store.write(batch)?;
        Ok(())
    }

    fn apply_failure(
        &self,
        endpoint: &str,
        sent: &[QueuedChange],
        error: &SyncError,
        result: &mut SyncCycleResult,
    ) -> SyncResult<()> {
        tracing::warn!(
            %endpoint,
            changes = sent.len(),
            error = %error,
            retryable = error.is_retryable(),
            "batch failed"
        );
        self.stats.write().failed_batches += 1;

        let now = self.now();
        let retry = &self.config.retry;
        let mut batch = WriteBatch::new();
        let mut exhausted = Vec::new();

        for sent_change in sent {
            let Some(mut change) = self.ledger.get(sent_change.id)? else {
                continue;
            };
            change.retry_count += 1;

            if retry.is_exhausted(change.failed_attempts()) {
                change.state = ChangeState::Exhausted;
                change.next_attempt_at = None;
                exhausted.push(change.clone());
            } else {
                let delay = retry.delay_for_attempt(change.failed_attempts());
                change.next_attempt_at = Some(now + delay.as_millis() as i64);
                result.failed.push(change.id);
            }
            self.ledger.stage_put(&mut batch, &change)?;
        }
        self.store.write(batch)?;

        if exhausted.is_empty() {
            return Ok(());
        }

        // Mark records failed now that their changes are exhausted.
        let mut batch = WriteBatch::new();
        for change in &exhausted {
            if let Some(key) = change.record_id().and_then(RecordKey::from_value) {
                if let Some(mut record) = self.store.get(endpoint, &key)? {
                    self.status_after(endpoint, &key, &HashSet::new())?.apply(&mut record);
                    batch.put_verbatim(endpoint, Value::Object(record));
                }
            }
        }
        self.store.write(batch)?;

        for change in exhausted {
            tracing::error!(
                change_id = %change.id,
                %endpoint,
                retries = change.retry_count,
                "change exhausted its retries"
            );
            let report = SyncErrorReport {
                change_id: Some(change.id),
                endpoint: Some(endpoint.to_string()),
                message: error.to_string(),
                retry_count: change.retry_count,
                at: now,
            };
            self.record_error(report.clone());
            self.notify(|o| o.on_sync_error(&report));
            self.stats.write().changes_exhausted += 1;
            result.exhausted.push(change.id);
        }

        Ok(())
    }

    fn record_error(&self, report: SyncErrorReport) {
        let mut errors = self.errors.write();
        errors.push(report);
        let max = self.config.max_sync_errors;
        if errors.len() > max {
            let excess = errors.len() - max;
            errors.drain(..excess);
        }
    }

    fn check_storage(&self) {
        match self.store.estimate() {
            Ok(estimate) if estimate.ratio() >= self.config.quota_warning_ratio => {
                tracing::warn!(
                    usage = estimate.usage,
                    quota = estimate.quota,
                    "local storage is nearly full"
                );
                self.notify(|o| o.on_storage_warning(&estimate));
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "could not estimate storage"),
        }
    }

    /// Earliest backoff deadline among pending changes, if any is in the
    /// future.
    pub fn next_backoff_deadline(&self) -> SyncResult<Option<i64>> {
        let now = self.now();
        Ok(self
            .ledger
            .list_all()?
            .iter()
            .filter(|c| c.is_backing_off(now))
            .filter_map(|c| c.next_attempt_at)
            .min())
    }

    /// Time until [`next_backoff_deadline`](Self::next_backoff_deadline).
    pub fn time_until_backoff_deadline(&self) -> SyncResult<Option<Duration>> {
        let now = self.now();
        Ok(self
            .next_backoff_deadline()?
            .map(|deadline| Duration::from_millis((deadline - now).max(0) as u64)))
    }

    // ------------------------------------------------------------------
    // Manual resolution
    // ------------------------------------------------------------------

    /// Conflicts waiting for a decision, oldest first.
    pub fn pending_conflicts(&self) -> SyncResult<Vec<Conflict>> {
        let mut conflicts = self
            .store
            .get_all(SYNC_CONFLICTS, &Query::new())?
            .into_iter()
            .map(|d| serde_json::from_value(Value::Object(d)))
            .collect::<Result<Vec<Conflict>, _>>()?;
        conflicts.sort_by_key(|c| (c.detected_at, c.id));
        Ok(conflicts)
    }

    fn load_conflict(&self, id: ConflictId) -> SyncResult<Conflict> {
        let document = self
            .store
            .get(SYNC_CONFLICTS, id.to_string())?
            .ok_or(SyncError::UnknownConflict(id))?;
        Ok(serde_json::from_value(Value::Object(document))?)
    }

    /// Resolves a deferred conflict in favour of the server.
    pub fn accept_server(&self, conflict_id: ConflictId) -> SyncResult<()> {
        let conflict = self.load_conflict(conflict_id)?;
        self.accept_server_version(&conflict)?;
        tracing::info!(%conflict_id, "conflict resolved, server version kept");
        Ok(())
    }

    /// Resolves a deferred conflict in favour of the client: the change is
    /// sent again on the next episode, based on the server's version.
    pub fn resend_client(&self, conflict_id: ConflictId) -> SyncResult<()> {
        let conflict = self.load_conflict(conflict_id)?;
        let change_id = conflict.client_change.id;

        let mut batch = WriteBatch::new();
        batch.delete(SYNC_CONFLICTS, conflict_id.to_string());
        if let Some(mut change) = self.ledger.get(change_id)? {
            change.state = ChangeState::Pending;
            change.next_attempt_at = None;
            change.base_version = conflict.server_version_number();
            self.ledger.stage_put(&mut batch, &change)?;
        }
        self.store.write(batch)?;

        tracing::info!(%conflict_id, %change_id, "conflict resolved, client change resent");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Terminal error recovery
    // ------------------------------------------------------------------

    /// Makes a change eligible again: resets an exhausted change's retries,
    /// or clears a backoff deadline.
    pub fn retry_change(&self, change_id: ChangeId) -> SyncResult<()> {
        let mut change = self
            .ledger
            .get(change_id)?
            .ok_or(SyncError::UnknownChange(change_id))?;

        if change.is_exhausted() {
            change.reset_retries();
            change.state = ChangeState::Pending;
        }
        change.next_attempt_at = None;

        let mut batch = WriteBatch::new();
        self.ledger.stage_put(&mut batch, &change)?;
        if let Some(key) = change.record_id().and_then(RecordKey::from_value) {
            if let Some(mut record) = self.store.get(&change.endpoint, &key)? {
                SyncStatus::Pending.apply(&mut record);
                batch.put_verbatim(change.endpoint.as_str(), Value::Object(record));
            }
        }
        self.store.write(batch)?;

        self.errors.write().retain(|e| e.change_id != Some(change_id));
        tracing::info!(%change_id, "change rescheduled");
        Ok(())
    }

    /// Drops a change from the ledger, with its conflict and logged errors.
    pub fn discard_change(&self, change_id: ChangeId) -> SyncResult<()> {
        let change = self
            .ledger
            .get(change_id)?
            .ok_or(SyncError::UnknownChange(change_id))?;

        let mut batch = WriteBatch::new();
        self.ledger.stage_remove(&mut batch, change_id);
        if let ChangeState::Deferred { conflict_id } = change.state {
            batch.delete(SYNC_CONFLICTS, conflict_id.to_string());
        }
        if let Some(key) = change.record_id().and_then(RecordKey::from_value) {
            if self.store.collections().contains(&change.endpoint) {
                if let Some(mut record) = self.store.get(&change.endpoint, &key)? {
                    self.status_after(&change.endpoint, &key, &HashSet::from([change_id]))?
                        .apply(&mut record);
                    batch.put_verbatim(change.endpoint.as_str(), Value::Object(record));
                }
            }
        }
        self.store.write(batch)?;

        self.errors.write().retain(|e| e.change_id != Some(change_id));
        tracing::info!(%change_id, "change discarded");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Local data
    // ------------------------------------------------------------------

    /// Reads a cached record.
    pub fn get_local_data(
        &self,
        collection: &str,
        id: impl Into<RecordKey>,
    ) -> SyncResult<Option<LocalRecord>> {
        if !self.store.collections().iter().any(|c| c == collection) {
            return Ok(None);
        }
        match self.store.get(collection, id)? {
            Some(document) => Ok(Some(LocalRecord::from_document(document)?)),
            None => Ok(None),
        }
    }

    /// Writes a record locally and marks it pending. Nothing is queued; the
    /// record stays pending until a server copy replaces it.
    pub fn set_local_data(&self, collection: &str, record: Value) -> SyncResult<LocalRecord> {
        self.ensure_collection(collection)?;
        let Value::Object(mut record) = record else {
            return Err(StorageError::NotAnObject {
                collection: collection.to_string(),
            }
            .into());
        };
        SyncStatus::Pending.apply(&mut record);
        let stored = self.store.put(collection, Value::Object(record))?;
        Ok(LocalRecord::from_document(stored)?)
    }

    /// Removes every cached record of a collection.
    pub fn clear_local_data(&self, collection: &str) -> SyncResult<()> {
        if self.store.collections().iter().any(|c| c == collection) {
            self.store.clear(collection)?;
        }
        Ok(())
    }

    /// Queries cached records.
    pub fn query_local_data(
        &self,
        collection: &str,
        query: &Query,
    ) -> SyncResult<Vec<LocalRecord>> {
        self.ensure_collection(collection)?;
        self.store
            .get_all(collection, query)?
            .into_iter()
            .map(|d| LocalRecord::from_document(d).map_err(SyncError::from))
            .collect()
    }

    /// Cached records of a collection with the given sync status.
    pub fn records_with_status(
        &self,
        collection: &str,
        status: SyncStatus,
    ) -> SyncResult<Vec<LocalRecord>> {
        self.query_local_data(
            collection,
            &Query::new().by_index(SYNC_STATUS_FIELD, status.to_value()),
        )
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    /// Current status.
    pub fn sync_status(&self) -> SyncResult<SyncStatusReport> {
        let estimate: StorageEstimate = self.store.estimate()?;
        Ok(SyncStatusReport {
            is_online: self.connectivity.is_online(),
            is_syncing: self.in_flight.load(Ordering::Acquire),
            state: self.state(),
            last_sync_time: *self.last_sync_time.read(),
            pending_change_count: self.ledger.count()?,
            sync_errors: self.errors.read().clone(),
            storage_quota: estimate.quota,
            storage_usage: estimate.usage,
        })
    }

    /// Terminal errors, oldest first.
    pub fn sync_errors(&self) -> Vec<SyncErrorReport> {
        self.errors.read().clone()
    }
}

fn merge_payload(record: &mut Document, payload: &Value) {
    if let Value::Object(fields) = payload {
        for (field, value) in fields {
            record.insert(field.clone(), value.clone());
        }
    }
}

fn status_of(remaining: &[QueuedChange]) -> SyncStatus {
    if remaining.is_empty() {
        SyncStatus::Synced
    } else if remaining.iter().all(QueuedChange::is_exhausted) {
        SyncStatus::Failed
    } else {
        SyncStatus::Pending
    }
}
