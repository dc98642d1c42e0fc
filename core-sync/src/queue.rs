//! # Sync Queue Manager
//!
//! Per-device, per-category queues of items waiting to be synced.
//!
//! ## Overview
//!
//! Items live in an arena keyed by `(device, category, item_ref)` with a FIFO
//! index per category. Each device has its own lock, so queue updates are
//! atomic per device and never block other devices.
//!
//! ## Item lifecycle
//!
//! ```text
//! Pending → InFlight → Synced
//!    ↑         ↓
//!    └──── (failure, retries left)
//!              ↓
//!           Failed (terminal, retry threshold reached)
//! ```
//!
//! Media items report their status with transfer labels
//! (`queued`/`downloading`/`completed`/`failed`).

use crate::error::{Result, SyncError};
use crate::errors::ErrorLog;
use bridge_traits::{Clock, DeviceKey, SyncCategory};
use chrono::{DateTime, Utc};
use core_runtime::RetryThresholds;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Status of a queued item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    InFlight,
    Synced,
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Synced | ItemStatus::Failed)
    }

    /// Status label as reported for the given category
    pub fn label(&self, category: SyncCategory) -> &'static str {
        match (category, self) {
            (SyncCategory::Media, ItemStatus::Pending) => "queued",
            (SyncCategory::Media, ItemStatus::InFlight) => "downloading",
            (SyncCategory::Media, ItemStatus::Synced) => "completed",
            (_, ItemStatus::Pending) => "pending",
            (_, ItemStatus::InFlight) => "in_flight",
            (_, ItemStatus::Synced) => "synced",
            (_, ItemStatus::Failed) => "failed",
        }
    }
}

/// A unit of work in a category queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncItem {
    pub category: SyncCategory,
    pub item_ref: String,
    pub status: ItemStatus,
    pub retry_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    /// Enqueue sequence within the device, used for FIFO order
    pub seq: u64,
}

impl SyncItem {
    pub fn status_label(&self) -> &'static str {
        self.status.label(self.category)
    }
}

/// Result of one transfer attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Success,
    Failure(String),
}

/// Per-category item counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub pending: usize,
    pub in_flight: usize,
    pub synced: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub categories: BTreeMap<SyncCategory, CategoryStats>,
}

impl QueueStats {
    pub fn total_pending(&self) -> usize {
        self.categories.values().map(|c| c.pending + c.in_flight).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.categories.values().map(|c| c.failed).sum()
    }
}

#[derive(Debug, Default)]
struct DeviceQueues {
    items: HashMap<(SyncCategory, String), SyncItem>,
    fifo: HashMap<SyncCategory, VecDeque<String>>,
    next_seq: u64,
}

impl DeviceQueues {
    fn ordered(&self, category: SyncCategory) -> impl Iterator<Item = &SyncItem> {
        self.fifo
            .get(&category)
            .into_iter()
            .flat_map(|refs| refs.iter())
            .filter_map(move |item_ref| self.items.get(&(category, item_ref.clone())))
    }
}

pub struct QueueManager {
    devices: RwLock<HashMap<DeviceKey, Arc<Mutex<DeviceQueues>>>>,
    thresholds: RetryThresholds,
    error_log: Arc<ErrorLog>,
    clock: Arc<dyn Clock>,
}

impl QueueManager {
    pub fn new(thresholds: RetryThresholds, error_log: Arc<ErrorLog>, clock: Arc<dyn Clock>) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            thresholds,
            error_log,
            clock,
        }
    }

    pub fn threshold(&self, category: SyncCategory) -> u32 {
        self.thresholds.for_category(category)
    }

    async fn device_queues(&self, device: &DeviceKey) -> Arc<Mutex<DeviceQueues>> {
        if let Some(queues) = self.devices.read().await.get(device) {
            return queues.clone();
        }
        self.devices
            .write()
            .await
            .entry(device.clone())
            .or_default()
            .clone()
    }

    async fn existing_queues(&self, device: &DeviceKey) -> Option<Arc<Mutex<DeviceQueues>>> {
        self.devices.read().await.get(device).cloned()
    }

    /// Append an item unless the same `item_ref` is already queued in the
    /// category. Returns the stored item and whether it was newly inserted.
    pub async fn enqueue(
        &self,
        device: &DeviceKey,
        category: SyncCategory,
        item_ref: &str,
    ) -> (SyncItem, bool) {
        let queues = self.device_queues(device).await;
        let mut queues = queues.lock().await;

        let key = (category, item_ref.to_string());
        if let Some(existing) = queues.items.get(&key) {
            debug!(device = %device, category = %category, item_ref, "Item already queued");
            return (existing.clone(), false);
        }

        let seq = queues.next_seq;
        queues.next_seq += 1;
        let item = SyncItem {
            category,
            item_ref: item_ref.to_string(),
            status: ItemStatus::Pending,
            retry_count: 0,
            last_attempt_at: None,
            last_error: None,
            enqueued_at: self.clock.now(),
            seq,
        };
        queues.items.insert(key, item.clone());
        queues
            .fifo
            .entry(category)
            .or_default()
            .push_back(item_ref.to_string());

        debug!(device = %device, category = %category, item_ref, seq, "Item enqueued");
        (item, true)
    }

    /// Take the oldest pending item of a category and mark it in flight.
    ///
    /// Terminal and in-flight items are skipped.
    pub async fn dequeue_next(
        &self,
        device: &DeviceKey,
        category: SyncCategory,
    ) -> Option<SyncItem> {
        let queues = self.existing_queues(device).await?;
        let mut queues = queues.lock().await;

        let item_ref = queues
            .ordered(category)
            .find(|item| item.status == ItemStatus::Pending)
            .map(|item| item.item_ref.clone())?;

        let now = self.clock.now();
        let item = queues.items.get_mut(&(category, item_ref))?;
        item.status = ItemStatus::InFlight;
        item.last_attempt_at = Some(now);
        Some(item.clone())
    }

    /// Take up to `limit` pending items of a category, oldest first.
    pub async fn dequeue_batch(
        &self,
        device: &DeviceKey,
        category: SyncCategory,
        limit: usize,
    ) -> Vec<SyncItem> {
        let mut batch = Vec::with_capacity(limit);
        while batch.len() < limit {
            match self.dequeue_next(device, category).await {
                Some(item) => batch.push(item),
                None => break,
            }
        }
        batch
    }

    /// Record the outcome of a transfer attempt.
    ///
    /// A failure increments the retry count; once it reaches the category's
    /// threshold the item becomes terminal `Failed` and an error entry with
    /// the category as component is appended to the device's error log.
    pub async fn mark_result(
        &self,
        device: &DeviceKey,
        category: SyncCategory,
        item_ref: &str,
        outcome: ItemOutcome,
    ) -> Result<SyncItem> {
        let not_found = || SyncError::NotFound {
            entity: "sync item",
            id: format!("{device}/{category}/{item_ref}"),
        };

        let queues = self.existing_queues(device).await.ok_or_else(not_found)?;
        let threshold = self.threshold(category);

        let exhausted = {
            let mut queues = queues.lock().await;
            let item = queues
                .items
                .get_mut(&(category, item_ref.to_string()))
                .ok_or_else(not_found)?;

            match (item.status, outcome) {
                (ItemStatus::Synced, ItemOutcome::Success) => return Ok(item.clone()),
                (ItemStatus::Synced | ItemStatus::Failed, _) => {
                    return Err(SyncError::InvalidStateTransition {
                        from: item.status_label().to_string(),
                        to: "mark_result".to_string(),
                        reason: format!("Item {item_ref} is already terminal"),
                    });
                }
                (_, ItemOutcome::Success) => {
                    item.status = ItemStatus::Synced;
                    item.last_error = None;
                    debug!(device = %device, category = %category, item_ref, "Item synced");
                    return Ok(item.clone());
                }
                (_, ItemOutcome::Failure(message)) => {
                    item.retry_count = item.retry_count.saturating_add(1);
                    item.last_error = Some(message);

                    if item.retry_count >= threshold {
                        item.status = ItemStatus::Failed;
                        item.clone()
                    } else {
                        item.status = ItemStatus::Pending;
                        debug!(
                            device = %device,
                            category = %category,
                            item_ref,
                            retry_count = item.retry_count,
                            threshold,
                            "Item failed, will retry"
                        );
                        return Ok(item.clone());
                    }
                }
            }
        };

        let error = SyncError::RetryExhausted {
            category: category.to_string(),
            item_ref: item_ref.to_string(),
            attempts: exhausted.retry_count,
        };
        self.error_log
            .record(device, &error, category.as_str())
            .await;

        warn!(
            device = %device,
            category = %category,
            item_ref,
            attempts = exhausted.retry_count,
            "Item retries exhausted"
        );
        Ok(exhausted)
    }

    /// Return in-flight items to pending, e.g. after a session was aborted
    /// mid-transfer. Retry counts are kept.
    pub async fn release_in_flight(&self, device: &DeviceKey) -> usize {
        let Some(queues) = self.existing_queues(device).await else {
            return 0;
        };
        let mut queues = queues.lock().await;
        let mut released = 0;
        for item in queues.items.values_mut() {
            if item.status == ItemStatus::InFlight {
                item.status = ItemStatus::Pending;
                released += 1;
            }
        }
        released
    }

    pub async fn pending_count(&self, device: &DeviceKey, category: SyncCategory) -> usize {
        let Some(queues) = self.existing_queues(device).await else {
            return 0;
        };
        let queues = queues.lock().await;
        queues
            .ordered(category)
            .filter(|item| item.status == ItemStatus::Pending)
            .count()
    }

    /// Items of a category in FIFO order
    pub async fn items(&self, device: &DeviceKey, category: SyncCategory) -> Vec<SyncItem> {
        let Some(queues) = self.existing_queues(device).await else {
            return Vec::new();
        };
        let queues = queues.lock().await;
        queues.ordered(category).cloned().collect()
    }

    /// Terminally failed items across all categories
    pub async fn failed_items(&self, device: &DeviceKey) -> Vec<SyncItem> {
        let Some(queues) = self.existing_queues(device).await else {
            return Vec::new();
        };
        let queues = queues.lock().await;
        let mut failed: Vec<SyncItem> = queues
            .items
            .values()
            .filter(|item| item.status == ItemStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by_key(|item| item.seq);
        failed
    }

    pub async fn stats(&self, device: &DeviceKey) -> QueueStats {
        let mut stats = QueueStats::default();
        let Some(queues) = self.existing_queues(device).await else {
            return stats;
        };
        let queues = queues.lock().await;
        for item in queues.items.values() {
            let entry = stats.categories.entry(item.category).or_default();
            match item.status {
                ItemStatus::Pending => entry.pending += 1,
                ItemStatus::InFlight => entry.in_flight += 1,
                ItemStatus::Synced => entry.synced += 1,
                ItemStatus::Failed => entry.failed += 1,
            }
        }
        stats
    }

    /// Drop synced items. Failed items are kept so they stay visible.
    pub async fn purge_completed(&self, device: &DeviceKey) -> usize {
        let Some(queues) = self.existing_queues(device).await else {
            return 0;
        };
        let mut queues = queues.lock().await;
        let before = queues.items.len();
        queues
            .items
            .retain(|_, item| item.status != ItemStatus::Synced);

        let DeviceQueues { items, fifo, .. } = &mut *queues;
        for (category, refs) in fifo.iter_mut() {
            refs.retain(|item_ref| items.contains_key(&(*category, item_ref.clone())));
        }

        let purged = before - queues.items.len();
        info!(device = %device, purged, "Purged synced items");
        purged
    }

    /// Replace a device's queues with persisted items.
    pub async fn restore(&self, device: &DeviceKey, mut items: Vec<SyncItem>) {
        items.sort_by_key(|item| item.seq);

        let mut restored = DeviceQueues::default();
        for mut item in items {
            if item.status == ItemStatus::InFlight {
                item.status = ItemStatus::Pending;
            }
            restored.next_seq = restored.next_seq.max(item.seq + 1);
            restored
                .fifo
                .entry(item.category)
                .or_default()
                .push_back(item.item_ref.clone());
            restored
                .items
                .insert((item.category, item.item_ref.clone()), item);
        }

        self.devices
            .write()
            .await
            .insert(device.clone(), Arc::new(Mutex::new(restored)));
    }
}
