//! # Sync Coordinator
//!
//! Decides what each device must sync, in what order, and with what
//! retry/backoff policy.
//!
//! ## Overview
//!
//! The `SyncCoordinator` ties the sync components together:
//! - Device lifecycle through the `DeviceRegistry`
//! - Token issue/refresh/revoke through the `TokenManager`
//! - Item bookkeeping through the `QueueManager`
//! - Settings reconciliation through the `ConflictResolver`
//! - Session outcomes into the `MetricsAggregator` and `ErrorLog`
//! - Events on the `EventBus` and state documents in the repository
//!
//! ## Session workflow
//!
//! 1. Take the device lock (a busy lock means a session is already running)
//!    and register the session's cancellation token
//! 2. Create the session, move it to `in_progress`, persist
//! 3. Make sure the device token is fresh, failing closed otherwise
//! 4. Apply payloads published by the device (settings go through the
//!    conflict resolver first). The session deadline stops receiving but
//!    never interrupts an apply
//! 5. Drain enabled categories in priority order: settings, messages and
//!    contacts one item at a time, media in bounded parallel batches
//! 6. Finalize as `completed`, `failed` or `cancelled`, update the device
//!    status through the transition function, record metrics, persist
//! 7. Release the lock, then notify
//!
//! ## Usage
//!
//! ```rust,ignore
//! let coordinator = SyncCoordinator::new(config).with_repository(repository);
//!
//! let registered = coordinator
//!     .register_device(key.clone(), DeviceInfo::new("Phone", Platform::Ios, "4.2.0"), None)
//!     .await?;
//! coordinator.enqueue(&key, SyncCategory::Messages, "msg-1").await?;
//!
//! let session = coordinator.sync_now(&key).await?;
//! println!("{} items synced", session.stats.items_synced);
//! ```

use crate::conflict::{ConflictResolver, SettingsChange};
use crate::error::{Result, SyncError};
use crate::errors::{ErrorLog, SyncErrorEntry};
use crate::metrics::{DeviceMetrics, MetricsAggregator};
use crate::queue::{ItemOutcome, QueueManager, QueueStats, SyncItem};
use crate::registry::{DeviceInfo, DeviceRecord, DeviceRegistry, SyncConfig};
use crate::repository::{
    DeviceStateDocument, QueuesDocument, SettingsQueueDocument, SyncStateRepository,
};
use crate::session::{
    apply_transition, BackoffPolicy, SessionState, SessionStats, SessionTrigger, SyncSession,
};
use bridge_traits::{
    Clock, DeviceKey, DomainStore, NotificationDispatcher, NotificationKind, SyncCategory,
    SyncNotification, SyncPayload, Transport,
};
use core_auth::{SyncToken, TokenManager, TokenMetadata};
use core_runtime::events::{CoreEvent, DeviceEvent, EventBus, SyncEvent};
use core_runtime::{CoreConfig, SyncPolicy};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Result of [`SyncCoordinator::register_device`]
#[derive(Debug, Clone)]
pub struct RegisteredDevice {
    pub record: DeviceRecord,
    pub token: SyncToken,
    pub reactivated: bool,
}

/// Externally observable state of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub record: DeviceRecord,
    pub queue: QueueStats,
    pub unresolved_errors: usize,
    pub token: Option<TokenMetadata>,
    pub session_active: bool,
}

/// Active session tracking
struct ActiveSession {
    session_id: crate::session::SessionId,
    cancellation_token: CancellationToken,
    reason: Option<String>,
}

/// How session work ended relative to the max-duration deadline
enum SessionEnd {
    Finished(Result<()>),
    DeadlineExceeded,
}

/// Sync coordinator for all registered devices
pub struct SyncCoordinator {
    policy: SyncPolicy,
    domain_store: Arc<dyn DomainStore>,
    transport: Arc<dyn Transport>,
    notifier: Option<Arc<dyn NotificationDispatcher>>,
    clock: Arc<dyn Clock>,
    event_bus: EventBus,
    registry: Arc<DeviceRegistry>,
    tokens: Arc<TokenManager>,
    queue: Arc<QueueManager>,
    resolver: Arc<ConflictResolver>,
    metrics: Arc<MetricsAggregator>,
    errors: Arc<ErrorLog>,
    repository: Option<Arc<dyn SyncStateRepository>>,
    /// Per-device session locks
    device_locks: Arc<Mutex<HashMap<DeviceKey, Arc<Mutex<()>>>>>,
    active_sessions: Arc<Mutex<HashMap<DeviceKey, ActiveSession>>>,
}

impl SyncCoordinator {
    /// Create a coordinator from a validated [`CoreConfig`].
    ///
    /// The coordinator keeps state in memory only until a repository is
    /// attached with [`with_repository`](Self::with_repository).
    pub fn new(config: CoreConfig) -> Self {
        let event_bus = EventBus::new(config.event_buffer_size);
        let clock = config.clock.clone();
        let policy = config.sync_policy.clone();

        let tokens = TokenManager::new(
            config.secure_store.clone(),
            event_bus.clone(),
            clock.clone(),
            config.token_policy.clone(),
        )
        .with_operation_timeout(policy.operation_timeout());

        let errors = Arc::new(ErrorLog::new(clock.clone()));
        let queue = QueueManager::new(policy.retry_thresholds.clone(), errors.clone(), clock.clone());

        Self {
            domain_store: config.domain_store,
            transport: config.transport,
            notifier: config.notifier,
            registry: Arc::new(DeviceRegistry::new(clock.clone())),
            tokens: Arc::new(tokens),
            queue: Arc::new(queue),
            resolver: Arc::new(ConflictResolver::new()),
            metrics: Arc::new(MetricsAggregator::new(policy.metrics_window)),
            errors,
            repository: None,
            device_locks: Arc::new(Mutex::new(HashMap::new())),
            active_sessions: Arc::new(Mutex::new(HashMap::new())),
            event_bus,
            clock,
            policy,
        }
    }

    /// Persist device documents and session history through `repository`.
    pub fn with_repository(mut self, repository: Arc<dyn SyncStateRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Token manager for device-facing validate/refresh calls
    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    /// Clone for background tasks (avoids Arc<Arc<...>>)
    fn clone_for_task(&self) -> Self {
        Self {
            policy: self.policy.clone(),
            domain_store: Arc::clone(&self.domain_store),
            transport: Arc::clone(&self.transport),
            notifier: self.notifier.clone(),
            clock: Arc::clone(&self.clock),
            event_bus: self.event_bus.clone(),
            registry: Arc::clone(&self.registry),
            tokens: Arc::clone(&self.tokens),
            queue: Arc::clone(&self.queue),
            resolver: Arc::clone(&self.resolver),
            metrics: Arc::clone(&self.metrics),
            errors: Arc::clone(&self.errors),
            repository: self.repository.clone(),
            device_locks: Arc::clone(&self.device_locks),
            active_sessions: Arc::clone(&self.active_sessions),
        }
    }

    // ------------------------------------------------------------------
    // Device lifecycle
    // ------------------------------------------------------------------

    /// Register a device (idempotent) and issue its sync token.
    ///
    /// Without an explicit `config` the device gets the default
    /// configuration with the policy's default interval.
    #[instrument(skip(self, info, config), fields(device = %key))]
    pub async fn register_device(
        &self,
        key: DeviceKey,
        info: DeviceInfo,
        config: Option<SyncConfig>,
    ) -> Result<RegisteredDevice> {
        let config = config.unwrap_or_else(|| {
            SyncConfig::default().with_interval_secs(self.policy.default_sync_interval_secs)
        });

        let registration = self.registry.register(key.clone(), info, config).await;
        let token = self.tokens.issue(&key).await?;

        let _ = self.event_bus.emit(CoreEvent::Device(DeviceEvent::Registered {
            user_id: key.user_id.to_string(),
            device_id: key.device_id.to_string(),
            reactivated: registration.reactivated,
        }));

        self.persist_device(&key).await;

        Ok(RegisteredDevice {
            record: registration.record,
            token,
            reactivated: registration.reactivated,
        })
    }

    /// Refresh device metadata and its last-active timestamp.
    #[instrument(skip(self, info), fields(device = %key))]
    pub async fn heartbeat(&self, key: &DeviceKey, info: DeviceInfo) -> Result<DeviceRecord> {
        let record = self.registry.heartbeat(key, info).await?;
        self.persist_device(key).await;
        Ok(record)
    }

    #[instrument(skip(self, config), fields(device = %key))]
    pub async fn update_config(&self, key: &DeviceKey, config: SyncConfig) -> Result<DeviceRecord> {
        let record = self.registry.update_config(key, config).await?;

        let _ = self.event_bus.emit(CoreEvent::Device(DeviceEvent::ConfigUpdated {
            user_id: key.user_id.to_string(),
            device_id: key.device_id.to_string(),
        }));

        self.persist_device(key).await;
        Ok(record)
    }

    /// Mark the device inactive, cancel its running session and revoke its
    /// token.
    #[instrument(skip(self), fields(device = %key))]
    pub async fn deactivate_device(&self, key: &DeviceKey) -> Result<DeviceRecord> {
        let record = self.registry.deactivate(key).await?;

        self.signal_cancel(key, "device deactivated").await;
        self.tokens.revoke(key).await?;

        let _ = self.event_bus.emit(CoreEvent::Device(DeviceEvent::Deactivated {
            user_id: key.user_id.to_string(),
            device_id: key.device_id.to_string(),
        }));

        self.persist_device(key).await;
        Ok(record)
    }

    // ------------------------------------------------------------------
    // Queues
    // ------------------------------------------------------------------

    /// Queue an item for the device. Enqueuing the same reference twice in
    /// one category keeps a single item.
    #[instrument(skip(self), fields(device = %key, category = %category))]
    pub async fn enqueue(
        &self,
        key: &DeviceKey,
        category: SyncCategory,
        item_ref: &str,
    ) -> Result<SyncItem> {
        let record = self.registry.require(key).await?;
        if !record.active {
            return Err(SyncError::DeviceInactive {
                device: key.to_string(),
            });
        }

        let (item, inserted) = self.queue.enqueue(key, category, item_ref).await;
        if inserted {
            self.persist_device(key).await;
        }
        Ok(item)
    }

    pub async fn queue_stats(&self, key: &DeviceKey) -> Result<QueueStats> {
        self.registry.require(key).await?;
        Ok(self.queue.stats(key).await)
    }

    pub async fn queue_items(&self, key: &DeviceKey, category: SyncCategory) -> Result<Vec<SyncItem>> {
        self.registry.require(key).await?;
        Ok(self.queue.items(key, category).await)
    }

    pub async fn failed_items(&self, key: &DeviceKey) -> Result<Vec<SyncItem>> {
        self.registry.require(key).await?;
        Ok(self.queue.failed_items(key).await)
    }

    /// Drop synced items from the device's queues.
    pub async fn purge_completed(&self, key: &DeviceKey) -> Result<usize> {
        self.registry.require(key).await?;
        let purged = self.queue.purge_completed(key).await;
        if purged > 0 {
            self.persist_device(key).await;
        }
        Ok(purged)
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Run a session for the device right away.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown devices, `DeviceInactive` for deactivated ones
    /// and `SessionInProgress` while another session holds the device lock.
    /// Session-level failures do not surface here: they end the returned
    /// session as `failed`.
    #[instrument(skip(self), fields(device = %key))]
    pub async fn sync_now(&self, key: &DeviceKey) -> Result<SyncSession> {
        self.run_session(key.clone(), SessionTrigger::Manual).await
    }

    /// Run sessions for every due device concurrently.
    ///
    /// Returns the finished sessions ordered by device. Devices whose lock
    /// is busy are skipped.
    #[instrument(skip(self))]
    pub async fn run_due_sessions(&self) -> Vec<SyncSession> {
        let due = self.registry.due_devices(self.clock.now()).await;
        if due.is_empty() {
            return Vec::new();
        }
        info!(count = due.len(), "Starting sessions for due devices");

        let mut tasks = JoinSet::new();
        for key in due {
            let coordinator = self.clone_for_task();
            tasks.spawn(async move {
                let result = coordinator
                    .run_session(key.clone(), SessionTrigger::Scheduled)
                    .await;
                (key, result)
            });
        }

        let mut sessions = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(session))) => sessions.push(session),
                Ok((key, Err(SyncError::SessionInProgress { .. }))) => {
                    debug!(device = %key, "Skipping device with a running session");
                }
                Ok((key, Err(e))) => {
                    warn!(device = %key, error = %e, "Scheduled session did not start");
                }
                Err(e) => {
                    error!(error = %e, "Session task aborted");
                }
            }
        }

        sessions.sort_by(|a, b| a.device.cmp(&b.device));
        sessions
    }

    /// Request cooperative cancellation of the device's running session.
    ///
    /// Returns whether a session was running.
    #[instrument(skip(self), fields(device = %key))]
    pub async fn cancel_sync(&self, key: &DeviceKey) -> Result<bool> {
        self.registry.require(key).await?;
        Ok(self.signal_cancel(key, "cancelled by user").await)
    }

    async fn signal_cancel(&self, key: &DeviceKey, reason: &str) -> bool {
        let mut active = self.active_sessions.lock().await;
        match active.get_mut(key) {
            Some(session) => {
                session.reason.get_or_insert_with(|| reason.to_string());
                session.cancellation_token.cancel();
                info!(device = %key, session_id = %session.session_id, reason, "Session cancellation requested");
                true
            }
            None => false,
        }
    }

    async fn device_lock(&self, key: &DeviceKey) -> Arc<Mutex<()>> {
        let mut locks = self.device_locks.lock().await;
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn run_session(&self, key: DeviceKey, trigger: SessionTrigger) -> Result<SyncSession> {
        let record = self.registry.require(&key).await?;
        if !record.active {
            return Err(SyncError::DeviceInactive {
                device: key.to_string(),
            });
        }

        let lock = self.device_lock(&key).await;
        let guard = lock.try_lock_owned().map_err(|_| SyncError::SessionInProgress {
            device: key.to_string(),
        })?;

        // Visible to `signal_cancel` before the session row is written
        let cancellation_token = CancellationToken::new();
        let session = SyncSession::new(key.clone(), trigger, self.clock.now());
        self.active_sessions.lock().await.insert(
            key.clone(),
            ActiveSession {
                session_id: session.id,
                cancellation_token: cancellation_token.clone(),
                reason: None,
            },
        );

        let (session, record) = match self.begin_session(session).await {
            Ok(started) => started,
            Err(e) => {
                self.active_sessions.lock().await.remove(&key);
                return Err(e);
            }
        };

        let _ = self.event_bus.emit(CoreEvent::Sync(SyncEvent::Started {
            session_id: session.id.to_string(),
            user_id: key.user_id.to_string(),
            device_id: key.device_id.to_string(),
            trigger: trigger.to_string(),
        }));
        info!(device = %key, session_id = %session.id, trigger = %trigger, "Sync session started");

        let mut stats = SessionStats::default();
        let deadline = Instant::now() + self.policy.max_session_duration();
        let outcome = self
            .execute_session(&key, &record.config, &cancellation_token, deadline, &mut stats)
            .await;

        let released = self.queue.release_in_flight(&key).await;
        if released > 0 {
            debug!(device = %key, released, "Returned in-flight items to the queue");
        }

        let cancel_reason = self
            .active_sessions
            .lock()
            .await
            .remove(&key)
            .and_then(|active| active.reason);

        let finished_at = self.clock.now();
        let session = match outcome {
            SessionEnd::Finished(Ok(())) if stats.items_exhausted > 0 && stats.items_synced == 0 => {
                let error = SyncError::RetryExhausted {
                    category: "session".to_string(),
                    item_ref: session.id.to_string(),
                    attempts: stats.items_exhausted as u32,
                };
                self.errors.record(&key, &error, "session").await;
                session.fail(stats, error.to_string(), finished_at)?
            }
            SessionEnd::Finished(Ok(())) => session.complete(stats, finished_at)?,
            SessionEnd::Finished(Err(e))
                if cancellation_token.is_cancelled() || matches!(e, SyncError::Cancelled) =>
            {
                if !matches!(e, SyncError::Cancelled) {
                    debug!(device = %key, error = %e, "Session error after cancellation");
                }
                let reason = cancel_reason.unwrap_or_else(|| "cancelled".to_string());
                session.cancel(stats, reason, finished_at)?
            }
            SessionEnd::Finished(Err(e)) => {
                self.errors.record(&key, &e, error_component(&e)).await;
                session.fail(stats, e.to_string(), finished_at)?
            }
            SessionEnd::DeadlineExceeded => {
                let error = SyncError::Timeout {
                    operation: "sync session".to_string(),
                    secs: self.policy.max_session_duration_secs,
                };
                self.errors.record(&key, &error, "session").await;
                session.cancel(stats, error.to_string(), finished_at)?
            }
        };

        self.metrics.record_session(&key, &session).await;
        let record = self.record_transition(&session).await?;
        self.emit_finished(&session, &record);

        drop(guard);

        self.notify(&session, &record).await;
        Ok(session)
    }

    /// Re-check the device under its session lock, then persist and start
    /// `session`.
    async fn begin_session(&self, session: SyncSession) -> Result<(SyncSession, DeviceRecord)> {
        let record = self.registry.require(&session.device).await?;
        if !record.active {
            return Err(SyncError::DeviceInactive {
                device: session.device.to_string(),
            });
        }

        self.persist_session(&session, true).await;
        let session = session.start(self.clock.now())?;
        let record = self.record_transition(&session).await?;
        Ok((session, record))
    }

    /// Apply the device status transition for `session`, then persist the
    /// session row and the device document.
    async fn record_transition(&self, session: &SyncSession) -> Result<DeviceRecord> {
        let current = self.registry.require(&session.device).await?;
        let status = apply_transition(
            &current.status,
            session,
            current.config.sync_interval(),
            &BackoffPolicy::from(&self.policy),
            self.clock.now(),
        );
        let record = self.registry.set_status(&session.device, status).await?;
        self.persist_session(session, false).await;
        self.persist_device(&session.device).await;
        Ok(record)
    }

    async fn execute_session(
        &self,
        key: &DeviceKey,
        config: &SyncConfig,
        cancellation_token: &CancellationToken,
        deadline: Instant,
        stats: &mut SessionStats,
    ) -> SessionEnd {
        if cancellation_token.is_cancelled() {
            return SessionEnd::Finished(Err(SyncError::Cancelled));
        }

        // Fails closed: an expired or unrefreshable token aborts the session
        match timeout_at(deadline, self.tokens.ensure_fresh(key)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return SessionEnd::Finished(Err(e.into())),
            Err(_) => return SessionEnd::DeadlineExceeded,
        }

        if let Err(e) = self
            .drain_inbound(key, config, cancellation_token, deadline, stats)
            .await
        {
            return SessionEnd::Finished(Err(e));
        }
        if Instant::now() >= deadline {
            return SessionEnd::DeadlineExceeded;
        }

        // Dropping an outbound transfer is safe: in-flight items are released
        match timeout_at(
            deadline,
            self.drain_outbound(key, config, cancellation_token, stats),
        )
        .await
        {
            Ok(result) => SessionEnd::Finished(result),
            Err(_) => SessionEnd::DeadlineExceeded,
        }
    }

    async fn drain_outbound(
        &self,
        key: &DeviceKey,
        config: &SyncConfig,
        cancellation_token: &CancellationToken,
        stats: &mut SessionStats,
    ) -> Result<()> {
        for category in config.categories_in_order() {
            if category.allows_parallel_transfer() {
                self.drain_parallel(key, category, cancellation_token, stats)
                    .await?;
            } else {
                self.drain_sequential(key, category, cancellation_token, stats)
                    .await?;
            }
        }
        Ok(())
    }

    async fn drain_sequential(
        &self,
        key: &DeviceKey,
        category: SyncCategory,
        cancellation_token: &CancellationToken,
        stats: &mut SessionStats,
    ) -> Result<()> {
        loop {
            if cancellation_token.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let Some(item) = self.queue.dequeue_next(key, category).await else {
                return Ok(());
            };

            let (outcome, bytes) = self.transfer_item(key, &item).await;
            self.record_outcome(key, &item, outcome, bytes, stats).await?;
        }
    }

    async fn drain_parallel(
        &self,
        key: &DeviceKey,
        category: SyncCategory,
        cancellation_token: &CancellationToken,
        stats: &mut SessionStats,
    ) -> Result<()> {
        let limit = self.policy.media_concurrency.max(1);
        loop {
            if cancellation_token.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let batch = self.queue.dequeue_batch(key, category, limit).await;
            if batch.is_empty() {
                return Ok(());
            }
            debug!(device = %key, category = %category, size = batch.len(), "Transferring batch");

            let results = join_all(batch.iter().map(|item| self.transfer_item(key, item))).await;
            for (item, (outcome, bytes)) in batch.iter().zip(results) {
                self.record_outcome(key, item, outcome, bytes, stats).await?;
            }
        }
    }

    /// Fetch an item from the domain store and send it to the device.
    async fn transfer_item(&self, key: &DeviceKey, item: &SyncItem) -> (ItemOutcome, u64) {
        let op_timeout = self.policy.operation_timeout();

        let data = match timeout(
            op_timeout,
            self.domain_store.fetch_item(item.category, &item.item_ref),
        )
        .await
        {
            Ok(Ok(data)) => data,
            Ok(Err(e)) => return (ItemOutcome::Failure(e.to_string()), 0),
            Err(_) => return (ItemOutcome::Failure(self.timeout_message("fetch_item")), 0),
        };

        let payload = SyncPayload::new(item.category, item.item_ref.clone(), data);
        let outgoing_change = if item.category == SyncCategory::Settings {
            serde_json::from_slice::<SettingsChange>(&payload.data).ok()
        } else {
            None
        };
        let size = payload.size_bytes();

        match timeout(op_timeout, self.transport.send(key, payload)).await {
            Ok(Ok(ack)) => {
                if let Some(change) = outgoing_change {
                    if let Err(e) = self.resolver.record(key, change).await {
                        warn!(device = %key, item_ref = %item.item_ref, error = %e, "Outgoing settings change not recorded");
                    }
                }
                let bytes = if ack.bytes_transferred > 0 {
                    ack.bytes_transferred
                } else {
                    size
                };
                (ItemOutcome::Success, bytes)
            }
            Ok(Err(e)) => (ItemOutcome::Failure(e.to_string()), 0),
            Err(_) => (ItemOutcome::Failure(self.timeout_message("send")), 0),
        }
    }

    async fn record_outcome(
        &self,
        key: &DeviceKey,
        item: &SyncItem,
        outcome: ItemOutcome,
        bytes: u64,
        stats: &mut SessionStats,
    ) -> Result<()> {
        let failed = matches!(outcome, ItemOutcome::Failure(_));
        let updated = self
            .queue
            .mark_result(key, item.category, &item.item_ref, outcome)
            .await?;

        if !failed {
            stats.items_synced += 1;
            stats.bytes_transferred = stats.bytes_transferred.saturating_add(bytes);
            return Ok(());
        }

        stats.items_failed += 1;
        let terminal = updated.status.is_terminal();
        if terminal {
            stats.items_exhausted += 1;
        }

        let _ = self.event_bus.emit(CoreEvent::Sync(SyncEvent::ItemFailed {
            user_id: key.user_id.to_string(),
            device_id: key.device_id.to_string(),
            category: item.category.to_string(),
            item_ref: item.item_ref.clone(),
            retry_count: updated.retry_count,
            terminal,
        }));
        Ok(())
    }

    /// Apply payloads the device published since its last session.
    async fn drain_inbound(
        &self,
        key: &DeviceKey,
        config: &SyncConfig,
        cancellation_token: &CancellationToken,
        deadline: Instant,
        stats: &mut SessionStats,
    ) -> Result<()> {
        for _ in 0..self.policy.inbound_batch_limit {
            if cancellation_token.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if Instant::now() >= deadline {
                break;
            }

            // Only the receive is bounded by the session deadline; a payload
            // already taken from the transport is always applied
            let receive_by = deadline.min(Instant::now() + self.policy.operation_timeout());
            let payload = match timeout_at(receive_by, self.transport.receive(key)).await {
                Ok(Ok(Some(payload))) => payload,
                Ok(Ok(None)) => break,
                Err(_) if receive_by == deadline => {
                    debug!(device = %key, "Session deadline reached while receiving");
                    break;
                }
                Ok(Err(e)) => {
                    self.errors
                        .append(key, "TRANSPORT_ERROR", e.to_string(), "inbound")
                        .await;
                    break;
                }
                Err(_) => {
                    self.errors
                        .append(key, "TIMEOUT", self.timeout_message("receive"), "inbound")
                        .await;
                    break;
                }
            };

            if !config.enabled_categories.contains(&payload.category) {
                debug!(device = %key, category = %payload.category, "Ignoring payload for disabled category");
                continue;
            }

            if let Err(e) = self.apply_inbound(key, payload, stats).await {
                self.errors.record(key, &e, "inbound").await;
            }
        }
        Ok(())
    }

    async fn apply_inbound(
        &self,
        key: &DeviceKey,
        payload: SyncPayload,
        stats: &mut SessionStats,
    ) -> Result<()> {
        if payload.category == SyncCategory::Settings {
            let remote: SettingsChange = serde_json::from_slice(&payload.data)?;
            let resolution = self.resolver.reconcile(key, remote.clone()).await?;

            if resolution.loser.is_some() {
                stats.conflicts_resolved += 1;
                let _ = self.event_bus.emit(CoreEvent::Sync(SyncEvent::ConflictResolved {
                    user_id: key.user_id.to_string(),
                    device_id: key.device_id.to_string(),
                    key: remote.key.clone(),
                    winner_device_id: resolution.winner.origin_device.to_string(),
                }));
            }

            if !resolution.remote_won(&remote) {
                debug!(device = %key, key = %remote.key, "Remote settings change superseded");
                return Ok(());
            }
        }

        match timeout(
            self.policy.operation_timeout(),
            self.domain_store
                .apply_remote_change(payload.category, &payload.item_ref, payload.data),
        )
        .await
        {
            Ok(Ok(())) => {
                stats.inbound_applied += 1;
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(SyncError::Timeout {
                operation: "apply_remote_change".to_string(),
                secs: self.policy.operation_timeout_secs,
            }),
        }
    }

    fn timeout_message(&self, operation: &str) -> String {
        SyncError::Timeout {
            operation: operation.to_string(),
            secs: self.policy.operation_timeout_secs,
        }
        .to_string()
    }

    fn emit_finished(&self, session: &SyncSession, record: &DeviceRecord) {
        let user_id = session.device.user_id.to_string();
        let device_id = session.device.device_id.to_string();
        let session_id = session.id.to_string();

        let event = match session.state {
            SessionState::Completed => {
                info!(
                    device = %session.device,
                    session_id = %session.id,
                    items_synced = session.stats.items_synced,
                    duration_ms = session.duration_ms(),
                    "Sync session completed"
                );
                SyncEvent::Completed {
                    session_id,
                    user_id,
                    device_id,
                    items_synced: session.stats.items_synced,
                    items_failed: session.stats.items_failed,
                    bytes_transferred: session.stats.bytes_transferred,
                    duration_ms: session.duration_ms(),
                }
            }
            SessionState::Failed => {
                let next_sync_at = record
                    .status
                    .next_sync_at
                    .map(|t| t.timestamp())
                    .unwrap_or_default();
                warn!(
                    device = %session.device,
                    session_id = %session.id,
                    consecutive_failures = record.status.consecutive_failures,
                    next_sync_at,
                    "Sync session failed"
                );
                SyncEvent::Failed {
                    session_id,
                    user_id,
                    device_id,
                    message: session.error_message.clone().unwrap_or_default(),
                    consecutive_failures: record.status.consecutive_failures,
                    next_sync_at,
                }
            }
            SessionState::Cancelled => {
                info!(device = %session.device, session_id = %session.id, "Sync session cancelled");
                SyncEvent::Cancelled {
                    session_id,
                    user_id,
                    device_id,
                    reason: session.error_message.clone().unwrap_or_default(),
                }
            }
            SessionState::Pending | SessionState::InProgress => return,
        };

        let _ = self.event_bus.emit(CoreEvent::Sync(event));
    }

    /// Fire-and-forget notification; failures are only logged.
    async fn notify(&self, session: &SyncSession, record: &DeviceRecord) {
        let Some(notifier) = &self.notifier else {
            return;
        };

        let failures = record.status.consecutive_failures;
        let (kind, message) = match session.state {
            SessionState::Completed => (
                NotificationKind::SyncCompleted,
                format!("{} items synced", session.stats.items_synced),
            ),
            SessionState::Failed if failures > self.policy.notify_failure_threshold => (
                NotificationKind::SyncFailing,
                session.error_message.clone().unwrap_or_default(),
            ),
            _ => return,
        };

        let notification = SyncNotification {
            device: session.device.clone(),
            kind,
            consecutive_failures: failures,
            message,
            push_token: record.info.push_token.clone(),
        };

        match timeout(self.policy.operation_timeout(), notifier.dispatch(notification)).await {
            Ok(Ok(())) => debug!(device = %session.device, "Notification dispatched"),
            Ok(Err(e)) => warn!(device = %session.device, error = %e, "Notification dispatch failed"),
            Err(_) => warn!(device = %session.device, "Notification dispatch timed out"),
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn device(&self, key: &DeviceKey) -> Result<DeviceRecord> {
        self.registry.require(key).await
    }

    pub async fn devices_for_user(&self, user_id: &bridge_traits::UserId) -> Vec<DeviceRecord> {
        self.registry.list_for_user(user_id).await
    }

    pub async fn status(&self, key: &DeviceKey) -> Result<DeviceStatus> {
        let record = self.registry.require(key).await?;
        let token = self.current_token_metadata(key).await;
        let session_active = self.active_sessions.lock().await.contains_key(key);

        Ok(DeviceStatus {
            record,
            queue: self.queue.stats(key).await,
            unresolved_errors: self.errors.unresolved(key).await.len(),
            token,
            session_active,
        })
    }

    pub async fn metrics(&self, key: &DeviceKey) -> Result<DeviceMetrics> {
        self.registry.require(key).await?;
        Ok(self.metrics.snapshot(key).await)
    }

    pub async fn errors(&self, key: &DeviceKey) -> Result<Vec<SyncErrorEntry>> {
        self.registry.require(key).await?;
        Ok(self.errors.list(key).await)
    }

    /// Flag an error entry as resolved.
    #[instrument(skip(self), fields(device = %key, error_id = %error_id))]
    pub async fn resolve_error(&self, key: &DeviceKey, error_id: Uuid) -> Result<SyncErrorEntry> {
        self.registry.require(key).await?;
        let entry = self.errors.resolve(key, error_id).await?;
        self.persist_device(key).await;
        Ok(entry)
    }

    /// Most recent sessions first. Empty without a repository.
    pub async fn session_history(&self, key: &DeviceKey, limit: u32) -> Result<Vec<SyncSession>> {
        self.registry.require(key).await?;
        match &self.repository {
            Some(repository) => repository.session_history(key, limit).await,
            None => Ok(Vec::new()),
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Load every stored device document into memory.
    ///
    /// Sessions interrupted by a restart are recorded as cancelled so the
    /// device becomes schedulable again.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> Result<usize> {
        let Some(repository) = &self.repository else {
            return Ok(0);
        };

        let documents = repository.list_device_states().await?;
        let count = documents.len();

        for document in documents {
            let key = document.key();
            let mut record = document.record();
            if record.status.current.map(|s| s.is_active()).unwrap_or(false) {
                record.status.current = Some(SessionState::Cancelled);
            }

            self.registry.restore(record).await;
            self.queue.restore(&key, document.queues.all_items()).await;
            self.resolver
                .restore(&key, document.queues.settings.log())
                .await;
            self.metrics.restore(&key, document.metrics).await;
            self.errors.restore(&key, document.errors).await;
        }

        info!(devices = count, "Restored device sync state");
        Ok(count)
    }

    async fn current_token_metadata(&self, key: &DeviceKey) -> Option<TokenMetadata> {
        match self.tokens.current(key).await {
            Ok(token) => token.map(|t| t.metadata()),
            Err(e) => {
                warn!(device = %key, error = %e, "Token lookup failed");
                None
            }
        }
    }

    /// Build the persisted document for a device from in-memory state.
    pub async fn snapshot(&self, key: &DeviceKey) -> Result<DeviceStateDocument> {
        let record = self.registry.require(key).await?;

        let settings = SettingsQueueDocument::new(
            self.resolver.log(key).await,
            self.queue.items(key, SyncCategory::Settings).await,
        );
        let queues = QueuesDocument {
            messages: self.queue.items(key, SyncCategory::Messages).await,
            media: self.queue.items(key, SyncCategory::Media).await,
            contacts: self.queue.items(key, SyncCategory::Contacts).await,
            settings,
        };

        Ok(DeviceStateDocument {
            user_id: record.key.user_id.clone(),
            device_id: record.key.device_id.clone(),
            device_info: record.info,
            sync_config: record.config,
            sync_status: record.status,
            active: record.active,
            registered_at: record.registered_at,
            updated_at: record.updated_at,
            token: self.current_token_metadata(key).await,
            queues,
            metrics: self.metrics.record(key).await,
            errors: self.errors.list(key).await,
        })
    }

    /// Idempotent write of the device document; failures are logged and do
    /// not change in-memory state.
    async fn persist_device(&self, key: &DeviceKey) {
        let Some(repository) = &self.repository else {
            return;
        };

        let result = match self.snapshot(key).await {
            Ok(document) => repository.save_device_state(&document).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(device = %key, error = %e, "Failed to persist device state");
        }
    }

    async fn persist_session(&self, session: &SyncSession, insert: bool) {
        let Some(repository) = &self.repository else {
            return;
        };

        let result = if insert {
            repository.insert_session(session).await
        } else {
            repository.update_session(session).await
        };
        if let Err(e) = result {
            warn!(session_id = %session.id, error = %e, "Failed to persist session");
        }
    }
}

fn error_component(error: &SyncError) -> &'static str {
    match error {
        SyncError::TokenExpired(_) | SyncError::TokenInvalid(_) | SyncError::Auth(_) => "auth",
        SyncError::ConflictUnresolvable { .. } => "settings",
        _ => "session",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::{BridgeError, ManualClock, SecureStore, TransportAck};
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};
    use core_runtime::TokenPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct MemoryStore {
        secrets: AsyncMutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl SecureStore for MemoryStore {
        async fn set_secret(&self, key: &str, value: &[u8]) -> BridgeResult<()> {
            self.secrets
                .lock()
                .await
                .insert(key.to_string(), value.to_vec());
            Ok(())
        }

        async fn get_secret(&self, key: &str) -> BridgeResult<Option<Vec<u8>>> {
            Ok(self.secrets.lock().await.get(key).cloned())
        }

        async fn delete_secret(&self, key: &str) -> BridgeResult<()> {
            self.secrets.lock().await.remove(key);
            Ok(())
        }

        async fn list_keys(&self) -> BridgeResult<Vec<String>> {
            Ok(self.secrets.lock().await.keys().cloned().collect())
        }

        async fn clear_all(&self) -> BridgeResult<()> {
            self.secrets.lock().await.clear();
            Ok(())
        }
    }

    struct EchoDomain;

    #[async_trait::async_trait]
    impl DomainStore for EchoDomain {
        async fn fetch_item(&self, _category: SyncCategory, item_ref: &str) -> BridgeResult<Bytes> {
            Ok(Bytes::from(item_ref.to_string()))
        }

        async fn apply_remote_change(
            &self,
            _category: SyncCategory,
            _item_ref: &str,
            _payload: Bytes,
        ) -> BridgeResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingTransport {
        sent: AtomicUsize,
        fail_sends: bool,
    }

    #[async_trait::async_trait]
    impl Transport for CountingTransport {
        async fn send(&self, _device: &DeviceKey, payload: SyncPayload) -> BridgeResult<TransportAck> {
            if self.fail_sends {
                return Err(BridgeError::OperationFailed("link down".to_string()));
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(TransportAck {
                bytes_transferred: payload.size_bytes(),
            })
        }

        async fn receive(&self, _device: &DeviceKey) -> BridgeResult<Option<SyncPayload>> {
            Ok(None)
        }
    }

    fn coordinator(transport: Arc<CountingTransport>) -> (SyncCoordinator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let config = CoreConfig::builder()
            .domain_store(Arc::new(EchoDomain))
            .transport(transport)
            .secure_store(Arc::new(MemoryStore::default()))
            .clock(clock.clone())
            .token_policy(TokenPolicy::default())
            .build()
            .unwrap();
        (SyncCoordinator::new(config), clock)
    }

    fn phone() -> DeviceInfo {
        DeviceInfo::new("Phone", crate::registry::Platform::Ios, "1.0.0")
    }

    #[tokio::test]
    async fn test_register_issues_token() {
        let (coordinator, _) = coordinator(Arc::new(CountingTransport::default()));
        let key = DeviceKey::new("alice", "phone");

        let registered = coordinator
            .register_device(key.clone(), phone(), None)
            .await
            .unwrap();
        assert!(!registered.reactivated);
        assert_eq!(registered.record.config.sync_interval_secs, 300);

        let validation = coordinator
            .tokens()
            .validate(&registered.token.token)
            .await
            .unwrap();
        assert!(validation.valid);
        assert_eq!(validation.device, Some(key));
    }

    #[tokio::test]
    async fn test_sync_now_drains_queue() {
        let transport = Arc::new(CountingTransport::default());
        let (coordinator, _) = coordinator(transport.clone());
        let key = DeviceKey::new("alice", "phone");
        coordinator.register_device(key.clone(), phone(), None).await.unwrap();

        coordinator.enqueue(&key, SyncCategory::Messages, "m1").await.unwrap();
        coordinator.enqueue(&key, SyncCategory::Media, "p1").await.unwrap();

        let session = coordinator.sync_now(&key).await.unwrap();
        assert_eq!(session.state, SessionState::Completed);
        assert_eq!(session.stats.items_synced, 2);
        assert_eq!(transport.sent.load(Ordering::SeqCst), 2);

        let status = coordinator.status(&key).await.unwrap();
        assert_eq!(status.record.status.current, Some(SessionState::Completed));
        assert!(!status.session_active);
        assert!(status.token.is_some());
    }

    #[tokio::test]
    async fn test_exhausted_items_fail_session() {
        let transport = Arc::new(CountingTransport {
            fail_sends: true,
            ..CountingTransport::default()
        });
        let (coordinator, _) = coordinator(transport);
        let key = DeviceKey::new("alice", "phone");
        coordinator.register_device(key.clone(), phone(), None).await.unwrap();
        coordinator.enqueue(&key, SyncCategory::Contacts, "c1").await.unwrap();

        let session = coordinator.sync_now(&key).await.unwrap();
        assert_eq!(session.state, SessionState::Failed);
        assert_eq!(session.stats.items_failed, 3);
        assert_eq!(session.stats.items_exhausted, 1);

        let errors = coordinator.errors(&key).await.unwrap();
        assert!(errors.iter().any(|e| e.component == "contacts"));
        assert!(errors.iter().any(|e| e.component == "session"));
    }

    #[tokio::test]
    async fn test_inactive_and_unknown_devices() {
        let (coordinator, _) = coordinator(Arc::new(CountingTransport::default()));
        let key = DeviceKey::new("alice", "phone");

        assert!(matches!(
            coordinator.sync_now(&key).await,
            Err(SyncError::NotFound { .. })
        ));

        coordinator.register_device(key.clone(), phone(), None).await.unwrap();
        coordinator.deactivate_device(&key).await.unwrap();

        assert!(matches!(
            coordinator.sync_now(&key).await,
            Err(SyncError::DeviceInactive { .. })
        ));
        assert!(matches!(
            coordinator.enqueue(&key, SyncCategory::Messages, "m1").await,
            Err(SyncError::DeviceInactive { .. })
        ));
        assert!(coordinator.tokens().current(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_error_flags_entry() {
        let transport = Arc::new(CountingTransport {
            fail_sends: true,
            ..CountingTransport::default()
        });
        let (coordinator, _) = coordinator(transport);
        let key = DeviceKey::new("alice", "phone");
        coordinator.register_device(key.clone(), phone(), None).await.unwrap();
        coordinator.enqueue(&key, SyncCategory::Settings, "theme").await.unwrap();
        coordinator.sync_now(&key).await.unwrap();

        let entry = coordinator.errors(&key).await.unwrap().remove(0);
        let resolved = coordinator.resolve_error(&key, entry.id).await.unwrap();
        assert!(resolved.resolved);

        let status = coordinator.status(&key).await.unwrap();
        assert_eq!(
            status.unresolved_errors,
            coordinator.errors(&key).await.unwrap().len() - 1
        );
    }

    #[tokio::test]
    async fn test_cancel_without_running_session() {
        let (coordinator, _) = coordinator(Arc::new(CountingTransport::default()));
        let key = DeviceKey::new("alice", "phone");
        coordinator.register_device(key.clone(), phone(), None).await.unwrap();

        assert!(!coordinator.cancel_sync(&key).await.unwrap());
        assert!(matches!(
            coordinator.cancel_sync(&DeviceKey::new("alice", "ghost")).await,
            Err(SyncError::NotFound { .. })
        ));
    }
}
