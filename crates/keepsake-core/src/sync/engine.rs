//! Push/pull reconciliation between the local store and the remote service.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::scheduler::SyncDriver;
use super::state::{
    ItemError, ItemErrorKind, PullSummary, SyncEvents, SyncMode, SyncNotification, SyncResult,
    SyncState, SyncStatus,
};
use crate::auth::CredentialProvider;
use crate::config::SyncSettings;
use crate::db::ApplyOutcome;
use crate::models::{OutboxEntry, RecordId};
use crate::remote::{PullBatch, PushAck, RemoteError, RemoteGateway};
use crate::services::RecordStore;

/// Failure of a whole sync cycle
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("A sync cycle is already in progress")]
    SyncInProgress,
    #[error("Authentication expired: {0}")]
    AuthExpired(String),
    #[error("Local store error: {0}")]
    Store(#[from] crate::Error),
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
}

impl SyncError {
    /// Whether an automatic retry of the cycle may succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Remote(error) => {
                error.is_retryable() || matches!(error, RemoteError::Conflict { .. })
            }
            Self::SyncInProgress | Self::AuthExpired(_) | Self::Store(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct EngineSettings {
    batch_size: usize,
    max_entry_retries: u32,
    request_timeout: Duration,
}

impl From<&SyncSettings> for EngineSettings {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            max_entry_retries: settings.max_entry_retries,
            request_timeout: settings.request_timeout,
        }
    }
}

/// Holds the in-progress flag for one cycle; releases it even if the cycle is cancelled.
struct CycleGuard<'a> {
    flag: &'a AtomicBool,
    events: &'a SyncEvents,
}

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool, events: &'a SyncEvents) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag, events })
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.events.update_state(|state| {
            if state.status.is_active() {
                state.status = SyncStatus::Idle;
            }
        });
        self.flag.store(false, Ordering::Release);
    }
}

/// Offline-first sync engine.
pub struct SyncEngine<G, C> {
    store: RecordStore,
    gateway: G,
    credentials: C,
    settings: EngineSettings,
    events: SyncEvents,
    in_progress: AtomicBool,
    pull_required: AtomicBool,
    auth_paused: AtomicBool,
}

impl<G: RemoteGateway, C: CredentialProvider> SyncEngine<G, C> {
    pub fn new(store: RecordStore, gateway: G, credentials: C, settings: &SyncSettings) -> Self {
        Self {
            store,
            gateway,
            credentials,
            settings: settings.into(),
            events: SyncEvents::new(),
            in_progress: AtomicBool::new(false),
            pull_required: AtomicBool::new(false),
            auth_paused: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn events(&self) -> &SyncEvents {
        &self.events
    }

    #[must_use]
    pub const fn store(&self) -> &RecordStore {
        &self.store
    }

    #[must_use]
    pub fn state(&self) -> SyncState {
        self.events.current_state()
    }

    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Number of queued outbox entries; also republished to observers.
    pub async fn pending_count(&self) -> Result<usize, SyncError> {
        let pending = self.store.pending_count().await?;
        self.events
            .update_state(|state| state.pending_count = pending);
        Ok(pending)
    }

    /// Leave the `Error` state and resume syncing after the cause was fixed.
    pub fn clear_error(&self) {
        self.auth_paused.store(false, Ordering::Release);
        self.events.update_state(|state| {
            if state.status == SyncStatus::Error {
                state.status = SyncStatus::Idle;
                state.error = None;
            }
        });
        tracing::info!("Sync error cleared");
    }

    pub async fn perform_full_sync(&self) -> Result<SyncResult, SyncError> {
        self.perform_sync(SyncMode::Full).await
    }

    pub async fn perform_quick_sync(&self) -> Result<SyncResult, SyncError> {
        self.perform_sync(SyncMode::Quick).await
    }

    /// Run one push + pull cycle; fails fast if another cycle is running.
    ///
    /// While paused on expired credentials, each call first asks the
    /// credential provider for a refresh and resumes only if it succeeds.
    pub async fn perform_sync(&self, mode: SyncMode) -> Result<SyncResult, SyncError> {
        let Some(_guard) = CycleGuard::acquire(&self.in_progress, &self.events) else {
            tracing::debug!(%mode, "Sync requested while a cycle is running");
            return Err(SyncError::SyncInProgress);
        };
        if self.auth_paused.load(Ordering::Acquire) {
            self.resume_after_reauth().await?;
        }

        tracing::info!(%mode, "Starting sync cycle");
        self.events.notify(SyncNotification::SyncStart { mode });

        let mut result = SyncResult::new(mode);
        let outcome = self.run_cycle(mode, &mut result).await;
        let pending = self.store.pending_count().await.ok();

        match outcome {
            Ok(()) => {
                let now = self.store.clock().now();
                self.events.update_state(|state| {
                    state.status = SyncStatus::Idle;
                    state.last_sync = Some(now);
                    state.error = None;
                    if let Some(pending) = pending {
                        state.pending_count = pending;
                    }
                });
                tracing::info!(
                    %mode,
                    pushed = result.processed_count,
                    pulled = result.pulled_count,
                    errors = result.error_count,
                    "Sync cycle finished"
                );
                self.events
                    .notify(SyncNotification::SyncComplete(result.clone()));
                Ok(result)
            }
            Err(error) => {
                if matches!(error, SyncError::AuthExpired(_)) {
                    self.auth_paused.store(true, Ordering::Release);
                }
                let message = error.to_string();
                self.events.update_state(|state| {
                    state.status = SyncStatus::Error;
                    state.error = Some(message.clone());
                    if let Some(pending) = pending {
                        state.pending_count = pending;
                    }
                });
                tracing::warn!(%mode, "Sync cycle failed: {}", message);
                self.events.notify(SyncNotification::SyncError { message });
                Err(error)
            }
        }
    }

    async fn resume_after_reauth(&self) -> Result<(), SyncError> {
        match self.credentials.refresh().await {
            Ok(()) => {
                tracing::info!("Credentials renewed; resuming sync");
                self.clear_error();
                Ok(())
            }
            Err(error) => {
                tracing::debug!("Sync still paused: {}", error);
                Err(SyncError::AuthExpired(format!(
                    "sync is paused until credentials are renewed: {error}"
                )))
            }
        }
    }

    async fn run_cycle(&self, mode: SyncMode, result: &mut SyncResult) -> Result<(), SyncError> {
        if self.pull_required.load(Ordering::Acquire) {
            tracing::info!("Pulling before push to settle an earlier conflict");
            self.set_status(SyncStatus::Pulling);
            self.pull_phase(SyncMode::Quick, result).await?;
        }

        self.set_status(SyncStatus::Pushing);
        self.push_phase(result).await?;

        self.set_status(SyncStatus::Pulling);
        self.pull_phase(mode, result).await
    }

    fn set_status(&self, status: SyncStatus) {
        self.events.update_state(|state| state.status = status);
    }

    async fn push_phase(&self, result: &mut SyncResult) -> Result<(), SyncError> {
        let mut cursor = None;
        let mut blocked: HashSet<RecordId> = HashSet::new();

        loop {
            let batch = self
                .store
                .peek_outbox_after(cursor, self.settings.batch_size)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = Some(last.entry_id);

            for entry in batch {
                if blocked.contains(&entry.record_id) {
                    result.push_error(ItemError::for_entry(
                        &entry,
                        ItemErrorKind::Blocked,
                        "an earlier mutation of this record is still pending",
                    ));
                    continue;
                }

                if let Err(error) = entry.validate() {
                    let message = error.to_string();
                    self.store
                        .drop_entry(&entry, ItemErrorKind::PermanentRejection.as_str(), &message)
                        .await?;
                    result.push_error(ItemError::for_entry(
                        &entry,
                        ItemErrorKind::PermanentRejection,
                        message,
                    ));
                    continue;
                }

                match self.push_entry(&entry).await? {
                    Ok(ack) => {
                        let at = ack.synced_at.unwrap_or_else(|| self.store.clock().now());
                        self.store.acknowledge(&entry, at).await?;
                        tracing::debug!(
                            entry_id = entry.entry_id,
                            record_id = %entry.record_id,
                            operation = %entry.operation,
                            "Pushed outbox entry"
                        );
                        result.processed_count += 1;
                    }
                    Err(error) => {
                        self.handle_push_failure(&entry, error, result, &mut blocked)
                            .await?;
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_push_failure(
        &self,
        entry: &OutboxEntry,
        error: RemoteError,
        result: &mut SyncResult,
        blocked: &mut HashSet<RecordId>,
    ) -> Result<(), SyncError> {
        let message = error.to_string();
        match error {
            RemoteError::ClientError { .. } => {
                self.store
                    .drop_entry(entry, ItemErrorKind::PermanentRejection.as_str(), &message)
                    .await?;
                result.push_error(ItemError::for_entry(
                    entry,
                    ItemErrorKind::PermanentRejection,
                    message,
                ));
            }
            RemoteError::Unauthorized(message) => return Err(SyncError::AuthExpired(message)),
            RemoteError::Conflict { .. }
            | RemoteError::Network(_)
            | RemoteError::ServerError { .. }
            | RemoteError::InvalidResponse(_) => {
                let conflict = matches!(error, RemoteError::Conflict { .. });
                if conflict {
                    self.pull_required.store(true, Ordering::Release);
                }
                blocked.insert(entry.record_id);

                let attempts = self.store.record_failure(entry, &message).await?;
                if attempts > self.settings.max_entry_retries {
                    let message = format!("gave up after {attempts} attempts: {message}");
                    self.store
                        .drop_entry(entry, ItemErrorKind::RetryExhausted.as_str(), &message)
                        .await?;
                    result.push_error(ItemError::for_entry(
                        entry,
                        ItemErrorKind::RetryExhausted,
                        message,
                    ));
                } else {
                    let kind = if conflict {
                        ItemErrorKind::Conflict
                    } else {
                        ItemErrorKind::Transient
                    };
                    result.push_error(ItemError::for_entry(entry, kind, message));
                }
            }
        }
        Ok(())
    }

    async fn pull_phase(&self, mode: SyncMode, result: &mut SyncResult) -> Result<(), SyncError> {
        let checkpoint = self.store.load_checkpoint().await?;
        let since = match mode {
            SyncMode::Quick => checkpoint.last_pull_at,
            SyncMode::Full => None,
        };

        let batch = self.pull_changes(since).await?;
        let synced_at = batch.last_sync_at;
        result.pulled_count += batch.records.len() + batch.deleted_ids.len();

        let mut summary = PullSummary::default();
        for remote in &batch.records {
            let (outcome, superseded) = self.store.apply_pulled(remote, synced_at).await?;
            tally(&mut summary, outcome, false);
            summary.superseded += superseded;
        }
        for id in &batch.deleted_ids {
            let (outcome, superseded) = self
                .store
                .apply_pulled_deletion(id, synced_at, synced_at)
                .await?;
            tally(&mut summary, outcome, true);
            summary.superseded += superseded;
        }

        // Every item applied: only now may the watermark move.
        let mut next = checkpoint.advanced_to(synced_at);
        if mode == SyncMode::Full {
            next.last_full_sync_at = Some(self.store.clock().now());
        }
        self.store.save_checkpoint(&next).await?;
        self.pull_required.store(false, Ordering::Release);

        tracing::debug!(
            %mode,
            applied = summary.applied(),
            kept_local = summary.kept_local,
            superseded = summary.superseded,
            "Pull batch applied"
        );
        merge_summary(&mut result.pull, summary);
        Ok(())
    }

    async fn push_entry(
        &self,
        entry: &OutboxEntry,
    ) -> Result<Result<PushAck, RemoteError>, SyncError> {
        match self.with_timeout(self.gateway.push(entry)).await {
            Err(RemoteError::Unauthorized(_)) => {
                self.refresh_credentials().await?;
                match self.with_timeout(self.gateway.push(entry)).await {
                    Err(RemoteError::Unauthorized(message)) => Err(SyncError::AuthExpired(message)),
                    other => Ok(other),
                }
            }
            other => Ok(other),
        }
    }

    async fn pull_changes(&self, since: Option<DateTime<Utc>>) -> Result<PullBatch, SyncError> {
        match self.with_timeout(self.gateway.pull(since)).await {
            Err(RemoteError::Unauthorized(_)) => {
                self.refresh_credentials().await?;
                match self.with_timeout(self.gateway.pull(since)).await {
                    Err(RemoteError::Unauthorized(message)) => Err(SyncError::AuthExpired(message)),
                    other => Ok(other?),
                }
            }
            other => Ok(other?),
        }
    }

    async fn refresh_credentials(&self) -> Result<(), SyncError> {
        tracing::info!("Remote rejected the credential; refreshing");
        self.credentials.refresh().await.map_err(|error| {
            tracing::warn!("Credential refresh failed: {}", error);
            SyncError::AuthExpired(error.to_string())
        })
    }

    async fn with_timeout<T>(
        &self,
        call: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        let timeout = self.settings.request_timeout;
        tokio::time::timeout(timeout, call)
            .await
            .unwrap_or_else(|_| {
                Err(RemoteError::Network(format!(
                    "request timed out after {}s",
                    timeout.as_secs_f32()
                )))
            })
    }
}

impl<G: RemoteGateway, C: CredentialProvider> SyncDriver for SyncEngine<G, C> {
    fn sync(&self, mode: SyncMode) -> impl Future<Output = Result<SyncResult, SyncError>> + Send {
        self.perform_sync(mode)
    }

    async fn last_full_sync_at(&self) -> Option<DateTime<Utc>> {
        match self.store.load_checkpoint().await {
            Ok(checkpoint) => checkpoint.last_full_sync_at,
            Err(error) => {
                tracing::warn!("Failed to load sync checkpoint: {}", error);
                None
            }
        }
    }

    fn network_changed(&self, online: bool) {
        self.events
            .notify(SyncNotification::NetworkChange { online });
    }
}

fn tally(summary: &mut PullSummary, outcome: ApplyOutcome, deletion: bool) {
    match outcome {
        ApplyOutcome::Inserted => summary.inserted += 1,
        ApplyOutcome::Updated if deletion => summary.deleted += 1,
        ApplyOutcome::Updated => summary.updated += 1,
        ApplyOutcome::Unchanged => summary.unchanged += 1,
        ApplyOutcome::KeptLocal => summary.kept_local += 1,
    }
}

fn merge_summary(total: &mut PullSummary, batch: PullSummary) {
    total.inserted += batch.inserted;
    total.updated += batch.updated;
    total.unchanged += batch.unchanged;
    total.kept_local += batch.kept_local;
    total.deleted += batch.deleted;
    total.superseded += batch.superseded;
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::auth::{AuthError, AuthResult};
    use crate::clock::ManualClock;
    use crate::models::{fields_from_value, OutboxOperation, RecordFields, RemoteRecord};
    use crate::util::from_millis;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tokio::sync::Notify;

    const T0: i64 = 1_700_000_000_000;
    const SERVER_NOW: i64 = T0 + 60_000;

    #[derive(Default)]
    struct FakeRemote {
        calls: Mutex<Vec<String>>,
        pushed: Mutex<Vec<OutboxEntry>>,
        push_script: Mutex<VecDeque<Result<PushAck, RemoteError>>>,
        push_failure: Mutex<Option<RemoteError>>,
        push_gate: Mutex<Option<Arc<Notify>>>,
        pulls: Mutex<Vec<Option<DateTime<Utc>>>>,
        pull_script: Mutex<VecDeque<Result<PullBatch, RemoteError>>>,
    }

    impl FakeRemote {
        fn script_push(&self, response: Result<PushAck, RemoteError>) {
            self.push_script.lock().unwrap().push_back(response);
        }

        fn script_pull(&self, response: Result<PullBatch, RemoteError>) {
            self.pull_script.lock().unwrap().push_back(response);
        }

        fn fail_all_pushes(&self, error: Option<RemoteError>) {
            *self.push_failure.lock().unwrap() = error;
        }

        fn pushed_ops(&self) -> Vec<(OutboxOperation, RecordId)> {
            self.pushed
                .lock()
                .unwrap()
                .iter()
                .map(|entry| (entry.operation, entry.record_id))
                .collect()
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl RemoteGateway for FakeRemote {
        async fn push(&self, entry: &OutboxEntry) -> Result<PushAck, RemoteError> {
            let gate = self.push_gate.lock().unwrap().take();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            self.calls
                .lock()
                .unwrap()
                .push(format!("push:{}", entry.entry_id));
            self.pushed.lock().unwrap().push(entry.clone());

            let scripted = self.push_script.lock().unwrap().pop_front();
            if let Some(response) = scripted {
                return response;
            }
            let failure = self.push_failure.lock().unwrap().clone();
            failure.map_or(Ok(PushAck::default()), Err)
        }

        async fn pull(&self, since: Option<DateTime<Utc>>) -> Result<PullBatch, RemoteError> {
            self.calls.lock().unwrap().push("pull".to_string());
            self.pulls.lock().unwrap().push(since);
            let scripted = self.pull_script.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| Ok(empty_batch()))
        }
    }

    #[derive(Default)]
    struct FakeCredentials {
        refresh_fails: AtomicBool,
        refreshes: AtomicUsize,
    }

    impl CredentialProvider for FakeCredentials {
        async fn bearer_token(&self) -> AuthResult<String> {
            Ok("token".to_string())
        }

        async fn refresh(&self) -> AuthResult<()> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if self.refresh_fails.load(Ordering::SeqCst) {
                Err(AuthError::Refresh("session revoked".to_string()))
            } else {
                Ok(())
            }
        }
    }

    type TestEngine = SyncEngine<Arc<FakeRemote>, Arc<FakeCredentials>>;

    struct Harness {
        engine: Arc<TestEngine>,
        remote: Arc<FakeRemote>,
        credentials: Arc<FakeCredentials>,
        clock: Arc<ManualClock>,
    }

    fn harness_with(settings: &SyncSettings) -> Harness {
        harness_over(RecordStore::open_in_memory().unwrap(), settings)
    }

    fn harness_over(store: RecordStore, settings: &SyncSettings) -> Harness {
        let clock = Arc::new(ManualClock::new(from_millis(T0)));
        let store = store.with_clock(clock.clone());
        let remote = Arc::new(FakeRemote::default());
        let credentials = Arc::new(FakeCredentials::default());
        let engine = Arc::new(SyncEngine::new(
            store,
            remote.clone(),
            credentials.clone(),
            settings,
        ));
        Harness {
            engine,
            remote,
            credentials,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with(&SyncSettings::default())
    }

    fn fields(value: Value) -> RecordFields {
        fields_from_value(value).unwrap()
    }

    fn empty_batch() -> PullBatch {
        PullBatch {
            records: Vec::new(),
            deleted_ids: Vec::new(),
            last_sync_at: from_millis(SERVER_NOW),
        }
    }

    fn batch(records: Vec<RemoteRecord>, last_sync_at: i64) -> PullBatch {
        PullBatch {
            records,
            deleted_ids: Vec::new(),
            last_sync_at: from_millis(last_sync_at),
        }
    }

    fn remote_record(id: RecordId, updated_at: i64, value: Value) -> RemoteRecord {
        RemoteRecord {
            id,
            fields: fields(value),
            created_at: None,
            updated_at: from_millis(updated_at),
            deleted_at: None,
        }
    }

    fn server_error() -> RemoteError {
        RemoteError::ServerError {
            status: 503,
            message: "unavailable".to_string(),
        }
    }

    #[tokio::test]
    async fn push_drains_outbox_in_fifo_order() {
        let h = harness();
        let store = h.engine.store();
        let r1 = store.create(fields(json!({"name": "one"}))).await.unwrap();
        store
            .update(&r1.id, fields(json!({"name": "one!"})))
            .await
            .unwrap();
        let r2 = store.create(fields(json!({"name": "two"}))).await.unwrap();

        let result = h.engine.perform_quick_sync().await.unwrap();

        assert_eq!(result.processed_count, 3);
        assert_eq!(result.error_count, 0);
        assert_eq!(
            h.remote.pushed_ops(),
            vec![
                (OutboxOperation::Create, r1.id),
                (OutboxOperation::Update, r1.id),
                (OutboxOperation::Create, r2.id),
            ]
        );
        assert_eq!(store.pending_count().await.unwrap(), 0);
        assert!(store.get(&r1.id).await.unwrap().unwrap().is_synced());
        assert!(store.get(&r2.id).await.unwrap().unwrap().is_synced());
    }

    #[tokio::test]
    async fn transient_failure_keeps_entry_and_blocks_later_siblings() {
        let h = harness();
        let store = h.engine.store();
        let r1 = store.create(fields(json!({"name": "one"}))).await.unwrap();
        store
            .update(&r1.id, fields(json!({"name": "one!"})))
            .await
            .unwrap();
        let r2 = store.create(fields(json!({"name": "two"}))).await.unwrap();
        h.remote.script_push(Err(server_error()));

        let result = h.engine.perform_quick_sync().await.unwrap();

        // r1's update is not attempted; r2 is not held back by r1.
        assert_eq!(
            h.remote.pushed_ops(),
            vec![
                (OutboxOperation::Create, r1.id),
                (OutboxOperation::Create, r2.id)
            ]
        );
        assert_eq!(result.processed_count, 1);
        let kinds: Vec<ItemErrorKind> = result.errors.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ItemErrorKind::Transient, ItemErrorKind::Blocked]);
        assert!(result.has_retryable_failures());

        let remaining = store.peek_outbox_after(None, 10).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].retry_count, 1);
        assert!(remaining[0].last_error.is_some());
        assert_eq!(remaining[1].retry_count, 0);

        // Next cycle delivers both in order.
        h.engine.perform_quick_sync().await.unwrap();
        assert_eq!(store.pending_count().await.unwrap(), 0);
        assert!(store.get(&r1.id).await.unwrap().unwrap().is_synced());
    }

    #[tokio::test]
    async fn entry_is_dropped_after_retry_bound() {
        let settings = SyncSettings {
            max_entry_retries: 2,
            ..SyncSettings::default()
        };
        let h = harness_with(&settings);
        let store = h.engine.store();
        let record = store.create(fields(json!({"name": "x"}))).await.unwrap();
        h.remote
            .fail_all_pushes(Some(RemoteError::Network("offline".to_string())));

        for _ in 0..2 {
            let result = h.engine.perform_quick_sync().await.unwrap();
            assert_eq!(result.errors[0].kind, ItemErrorKind::Transient);
        }
        let result = h.engine.perform_quick_sync().await.unwrap();

        assert_eq!(result.errors[0].kind, ItemErrorKind::RetryExhausted);
        assert!(!result.has_retryable_failures());
        assert_eq!(store.pending_count().await.unwrap(), 0);

        let errors = store.list_errors(10).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].record_id, record.id);
        assert_eq!(errors[0].kind, "retry_exhausted");
    }

    #[tokio::test]
    async fn client_error_drops_entry_and_continues() {
        let h = harness();
        let store = h.engine.store();
        let rejected = store.create(fields(json!({"name": "bad"}))).await.unwrap();
        let accepted = store.create(fields(json!({"name": "good"}))).await.unwrap();
        h.remote.script_push(Err(RemoteError::ClientError {
            status: 422,
            message: "invalid".to_string(),
        }));

        let result = h.engine.perform_quick_sync().await.unwrap();

        assert_eq!(result.processed_count, 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].record_id, rejected.id);
        assert_eq!(result.errors[0].kind, ItemErrorKind::PermanentRejection);
        assert_eq!(store.pending_count().await.unwrap(), 0);
        assert!(store.get(&accepted.id).await.unwrap().unwrap().is_synced());
        assert_eq!(store.list_errors(10).await.unwrap()[0].kind, "rejected");
    }

    #[tokio::test]
    async fn unauthorized_push_refreshes_and_retries_once() {
        let h = harness();
        let store = h.engine.store();
        store.create(fields(json!({"name": "x"}))).await.unwrap();
        h.remote
            .script_push(Err(RemoteError::Unauthorized("expired".to_string())));

        let result = h.engine.perform_quick_sync().await.unwrap();

        assert_eq!(result.processed_count, 1);
        assert_eq!(h.credentials.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(h.remote.pushed.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_refresh_pauses_sync_until_cleared() {
        let h = harness();
        let store = h.engine.store();
        store.create(fields(json!({"name": "x"}))).await.unwrap();
        h.credentials.refresh_fails.store(true, Ordering::SeqCst);
        h.remote
            .script_push(Err(RemoteError::Unauthorized("expired".to_string())));

        let error = h.engine.perform_quick_sync().await.unwrap_err();
        assert!(matches!(error, SyncError::AuthExpired(_)));
        assert_eq!(h.engine.state().status, SyncStatus::Error);

        // The entry is untouched and no further requests are made.
        let entries = store.peek_outbox_after(None, 10).await.unwrap();
        assert_eq!(entries[0].retry_count, 0);
        assert!(matches!(
            h.engine.perform_quick_sync().await,
            Err(SyncError::AuthExpired(_))
        ));
        assert_eq!(h.remote.pushed.lock().unwrap().len(), 1);
        assert_eq!(h.engine.state().status, SyncStatus::Error);

        h.credentials.refresh_fails.store(false, Ordering::SeqCst);
        h.engine.clear_error();
        assert_eq!(h.engine.state().status, SyncStatus::Idle);

        h.engine.perform_quick_sync().await.unwrap();
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn paused_sync_resumes_once_credentials_are_renewed() {
        let h = harness();
        let store = h.engine.store();
        store.create(fields(json!({"name": "x"}))).await.unwrap();
        h.credentials.refresh_fails.store(true, Ordering::SeqCst);
        h.remote
            .script_push(Err(RemoteError::Unauthorized("expired".to_string())));

        assert!(matches!(
            h.engine.perform_quick_sync().await,
            Err(SyncError::AuthExpired(_))
        ));
        assert_eq!(h.credentials.refreshes.load(Ordering::SeqCst), 1);

        // A new token shows up; the next trigger refreshes and drains the outbox
        // without anyone calling clear_error.
        h.credentials.refresh_fails.store(false, Ordering::SeqCst);
        let result = h.engine.perform_quick_sync().await.unwrap();

        assert_eq!(h.credentials.refreshes.load(Ordering::SeqCst), 2);
        assert_eq!(result.processed_count, 1);
        assert_eq!(store.pending_count().await.unwrap(), 0);
        assert_eq!(h.engine.state().status, SyncStatus::Idle);
        assert_eq!(h.engine.state().error, None);
    }

    #[tokio::test]
    async fn pull_advances_checkpoint_and_feeds_next_pull() {
        let h = harness();
        let store = h.engine.store();
        let id = RecordId::new();
        h.remote.script_pull(Ok(batch(
            vec![remote_record(id, T0 - 1_000, json!({"name": "remote"}))],
            SERVER_NOW,
        )));

        let result = h.engine.perform_quick_sync().await.unwrap();

        assert_eq!(result.pulled_count, 1);
        assert_eq!(result.pull.inserted, 1);
        let pulled = store.get(&id).await.unwrap().unwrap();
        assert!(pulled.is_synced());
        assert_eq!(store.pending_count().await.unwrap(), 0);
        assert_eq!(
            store.load_checkpoint().await.unwrap().last_pull_at,
            Some(from_millis(SERVER_NOW))
        );

        h.engine.perform_quick_sync().await.unwrap();
        assert_eq!(
            *h.remote.pulls.lock().unwrap(),
            vec![None, Some(from_millis(SERVER_NOW))]
        );
    }

    #[tokio::test]
    async fn checkpoint_never_moves_backwards() {
        let h = harness();
        let store = h.engine.store();
        h.remote.script_pull(Ok(batch(Vec::new(), SERVER_NOW)));
        h.remote.script_pull(Ok(batch(Vec::new(), SERVER_NOW - 5_000)));

        h.engine.perform_quick_sync().await.unwrap();
        h.engine.perform_quick_sync().await.unwrap();

        assert_eq!(
            store.load_checkpoint().await.unwrap().last_pull_at,
            Some(from_millis(SERVER_NOW))
        );
    }

    #[tokio::test]
    async fn failed_pull_leaves_checkpoint_untouched() {
        let h = harness();
        let store = h.engine.store();
        h.remote.script_pull(Err(server_error()));

        let error = h.engine.perform_quick_sync().await.unwrap_err();

        assert!(error.is_retryable());
        assert_eq!(h.engine.state().status, SyncStatus::Error);
        assert_eq!(store.load_checkpoint().await.unwrap().last_pull_at, None);

        // A later successful cycle clears the error state.
        h.engine.perform_quick_sync().await.unwrap();
        let state = h.engine.state();
        assert_eq!(state.status, SyncStatus::Idle);
        assert_eq!(state.error, None);
    }

    #[tokio::test]
    async fn failure_midway_through_a_batch_keeps_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keepsake.db");
        let h = harness_over(RecordStore::open_path(&path).unwrap(), &SyncSettings::default());
        let store = h.engine.store();
        let first = RecordId::new();
        let second = RecordId::new();
        let delivery = || {
            batch(
                vec![
                    remote_record(first, T0 - 2_000, json!({"name": "first"})),
                    remote_record(second, T0 - 1_000, json!({"name": "second"})),
                ],
                SERVER_NOW,
            )
        };

        let side = rusqlite::Connection::open(&path).unwrap();
        side.execute_batch(&format!(
            "CREATE TRIGGER reject_second BEFORE INSERT ON records
             WHEN NEW.id = '{}'
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            second.as_str()
        ))
        .unwrap();
        h.remote.script_pull(Ok(delivery()));

        let error = h.engine.perform_quick_sync().await.unwrap_err();

        assert!(matches!(error, SyncError::Store(_)));
        assert_eq!(store.load_checkpoint().await.unwrap().last_pull_at, None);
        assert!(store.get(&first).await.unwrap().is_some());
        assert!(store.get(&second).await.unwrap().is_none());

        // Redelivery from the unchanged checkpoint converges.
        side.execute_batch("DROP TRIGGER reject_second").unwrap();
        h.remote.script_pull(Ok(delivery()));
        let result = h.engine.perform_quick_sync().await.unwrap();

        assert_eq!(h.remote.pulls.lock().unwrap().clone(), vec![None, None]);
        assert_eq!(result.pull.unchanged, 1);
        assert_eq!(result.pull.inserted, 1);
        assert_eq!(
            store.load_checkpoint().await.unwrap().last_pull_at,
            Some(from_millis(SERVER_NOW))
        );
        for (id, name) in [(first, "first"), (second, "second")] {
            let record = store.get(&id).await.unwrap().unwrap();
            assert_eq!(record.fields, fields(json!({ "name": name })));
            assert!(record.is_synced());
        }
    }

    #[tokio::test]
    async fn delete_after_unsent_create_pushes_both_in_order() {
        let h = harness();
        let store = h.engine.store();
        let record = store.create(fields(json!({"name": "draft"}))).await.unwrap();
        h.clock.advance(chrono::Duration::seconds(1));
        store.soft_delete(&record.id).await.unwrap();

        let result = h.engine.perform_quick_sync().await.unwrap();

        assert_eq!(result.processed_count, 2);
        assert_eq!(
            h.remote.pushed_ops(),
            vec![
                (OutboxOperation::Create, record.id),
                (OutboxOperation::Delete, record.id),
            ]
        );
        let stored = store.get(&record.id).await.unwrap().unwrap();
        assert!(stored.is_deleted());
        assert!(stored.is_synced());
        assert_eq!(store.pending_count().await.unwrap(), 0);
        assert!(store.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn redelivered_pull_batch_is_idempotent() {
        let h = harness();
        let store = h.engine.store();
        let id = RecordId::new();
        let deleted = RecordId::new();
        store
            .apply_pulled(
                &remote_record(deleted, T0 - 10_000, json!({"name": "old"})),
                from_millis(T0 - 10_000),
            )
            .await
            .unwrap();
        let redelivered = PullBatch {
            records: vec![remote_record(id, T0 - 1_000, json!({"name": "remote"}))],
            deleted_ids: vec![deleted],
            last_sync_at: from_millis(SERVER_NOW),
        };
        h.remote.script_pull(Ok(redelivered.clone()));
        h.remote.script_pull(Ok(redelivered));

        h.engine.perform_quick_sync().await.unwrap();
        let first = store.changes_since(None).await.unwrap();
        let second_result = h.engine.perform_quick_sync().await.unwrap();

        assert_eq!(store.changes_since(None).await.unwrap(), first);
        assert_eq!(second_result.pull.applied(), 0);
        assert_eq!(store.pending_count().await.unwrap(), 0);
        assert!(store.get(&deleted).await.unwrap().unwrap().is_deleted());
    }

    #[tokio::test]
    async fn full_sync_pulls_everything_and_stamps_freshness() {
        let h = harness();
        let store = h.engine.store();

        h.engine.perform_quick_sync().await.unwrap();
        assert_eq!(store.load_checkpoint().await.unwrap().last_full_sync_at, None);

        h.clock.advance(chrono::Duration::minutes(5));
        let result = h.engine.perform_full_sync().await.unwrap();

        assert_eq!(result.mode, SyncMode::Full);
        assert_eq!(h.remote.pulls.lock().unwrap()[1], None);
        assert_eq!(
            store.load_checkpoint().await.unwrap().last_full_sync_at,
            Some(from_millis(T0 + 5 * 60_000))
        );
    }

    #[tokio::test]
    async fn conflict_forces_pull_before_next_push() {
        let h = harness();
        let store = h.engine.store();
        store.create(fields(json!({"name": "x"}))).await.unwrap();
        h.remote.script_push(Err(RemoteError::Conflict {
            status: 409,
            message: "stale".to_string(),
        }));
        h.remote.script_pull(Err(RemoteError::Network("dropped".to_string())));

        assert!(h.engine.perform_quick_sync().await.is_err());
        h.remote.calls.lock().unwrap().clear();

        h.engine.perform_quick_sync().await.unwrap();

        let calls = h.remote.calls();
        assert_eq!(calls.first().map(String::as_str), Some("pull"));
        assert!(calls[1].starts_with("push:"));
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn newer_remote_version_discards_pending_local_entries() {
        let h = harness();
        let store = h.engine.store();
        let record = store.create(fields(json!({"name": "local"}))).await.unwrap();
        h.remote.script_push(Err(server_error()));
        h.remote.script_pull(Ok(batch(
            vec![remote_record(record.id, T0 + 10_000, json!({"name": "remote"}))],
            SERVER_NOW,
        )));

        let result = h.engine.perform_quick_sync().await.unwrap();

        assert_eq!(result.pull.updated, 1);
        assert_eq!(result.pull.superseded, 1);
        assert_eq!(store.pending_count().await.unwrap(), 0);
        let stored = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.fields, fields(json!({"name": "remote"})));
        assert!(stored.is_synced());
        assert_eq!(store.list_conflicts(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_sync_fails_fast() {
        let h = harness();
        h.engine
            .store()
            .create(fields(json!({"name": "x"})))
            .await
            .unwrap();
        let gate = Arc::new(Notify::new());
        *h.remote.push_gate.lock().unwrap() = Some(gate.clone());

        let mut state = h.engine.events().subscribe_state();
        let engine = h.engine.clone();
        let running = tokio::spawn(async move { engine.perform_quick_sync().await });

        state
            .wait_for(|state| state.status == SyncStatus::Pushing)
            .await
            .unwrap();
        assert!(h.engine.is_syncing());
        assert!(matches!(
            h.engine.perform_quick_sync().await,
            Err(SyncError::SyncInProgress)
        ));

        gate.notify_one();
        let result = running.await.unwrap().unwrap();
        assert_eq!(result.processed_count, 1);
        assert!(!h.engine.is_syncing());
    }

    #[tokio::test]
    async fn cancelled_cycle_releases_flag_and_keeps_outbox() {
        let h = harness();
        let store = h.engine.store();
        store.create(fields(json!({"name": "x"}))).await.unwrap();
        *h.remote.push_gate.lock().unwrap() = Some(Arc::new(Notify::new()));

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            h.engine.perform_quick_sync(),
        )
        .await;
        assert!(cancelled.is_err());
        assert!(!h.engine.is_syncing());
        assert_eq!(h.engine.state().status, SyncStatus::Idle);

        let entries = store.peek_outbox_after(None, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].retry_count, 0);

        h.engine.perform_quick_sync().await.unwrap();
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn notifications_bracket_each_cycle() {
        let h = harness();
        let mut notifications = h.engine.events().subscribe_notifications();

        h.engine.perform_quick_sync().await.unwrap();

        assert_eq!(
            notifications.recv().await.unwrap(),
            SyncNotification::SyncStart {
                mode: SyncMode::Quick
            }
        );
        assert!(matches!(
            notifications.recv().await.unwrap(),
            SyncNotification::SyncComplete(SyncResult {
                mode: SyncMode::Quick,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn offline_edit_then_reconnect_scenario() {
        let h = harness();
        let store = h.engine.store();

        // Offline: the local commit succeeds, push fails transiently.
        let r1 = store.create(fields(json!({"name": "A"}))).await.unwrap();
        assert_eq!(r1.updated_at, from_millis(T0));
        h.remote
            .fail_all_pushes(Some(RemoteError::Network("offline".to_string())));
        h.remote.script_pull(Err(RemoteError::Network("offline".to_string())));
        assert!(h.engine.perform_quick_sync().await.is_err());
        assert_eq!(store.pending_count().await.unwrap(), 1);
        assert!(!store.get(&r1.id).await.unwrap().unwrap().is_synced());

        // Online: push succeeds; a stale remote copy loses.
        h.remote.fail_all_pushes(None);
        h.remote.script_pull(Ok(batch(
            vec![remote_record(r1.id, T0 - 5_000, json!({"name": "stale"}))],
            SERVER_NOW,
        )));
        let result = h.engine.perform_quick_sync().await.unwrap();
        assert_eq!(result.processed_count, 1);
        assert_eq!(result.pull.kept_local, 1);
        let stored = store.get(&r1.id).await.unwrap().unwrap();
        assert_eq!(stored.fields, fields(json!({"name": "A"})));
        assert!(stored.is_synced());
        assert_eq!(store.pending_count().await.unwrap(), 0);

        // A newer remote version wins without creating an outbox entry.
        h.remote.script_pull(Ok(batch(
            vec![remote_record(r1.id, T0 + 10_000, json!({"name": "B"}))],
            SERVER_NOW + 10_000,
        )));
        h.engine.perform_quick_sync().await.unwrap();
        let stored = store.get(&r1.id).await.unwrap().unwrap();
        assert_eq!(stored.fields, fields(json!({"name": "B"})));
        assert_eq!(stored.updated_at, from_millis(T0 + 10_000));
        assert!(stored.synced_at.unwrap() >= from_millis(T0 + 10_000));
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }
}
