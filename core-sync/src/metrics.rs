//! Per-device session metrics.
//!
//! Pure aggregation over terminal sessions: a rolling window of outcomes and
//! durations plus cumulative counters. Nothing here feeds back into
//! scheduling.

use crate::session::{SessionState, SyncSession};
use bridge_traits::DeviceKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct WindowEntry {
    state: SessionState,
    duration_ms: u64,
}

/// Stored aggregation state for one device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsRecord {
    window: VecDeque<WindowEntry>,
    pub total_sessions: u64,
    pub successful_sessions: u64,
    pub failed_sessions: u64,
    pub cancelled_sessions: u64,
    pub data_transferred_bytes: u64,
    pub items_synced: u64,
    pub last_session_at: Option<DateTime<Utc>>,
}

/// Read-only view returned by [`MetricsAggregator::snapshot`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetrics {
    pub total_sessions: u64,
    pub successful_sessions: u64,
    pub failed_sessions: u64,
    pub cancelled_sessions: u64,
    /// Successful share of the sessions in the window, 0.0 when empty
    pub sync_success_rate: f64,
    /// Mean duration of the sessions in the window
    pub average_sync_duration_ms: f64,
    pub data_transferred_bytes: u64,
    pub items_synced: u64,
    pub last_session_at: Option<DateTime<Utc>>,
}

impl MetricsRecord {
    fn snapshot(&self) -> DeviceMetrics {
        let windowed = self.window.len();
        let (success_rate, average_duration) = if windowed == 0 {
            (0.0, 0.0)
        } else {
            let successes = self
                .window
                .iter()
                .filter(|e| e.state == SessionState::Completed)
                .count();
            let total_ms: u64 = self.window.iter().map(|e| e.duration_ms).sum();
            (
                successes as f64 / windowed as f64,
                total_ms as f64 / windowed as f64,
            )
        };

        DeviceMetrics {
            total_sessions: self.total_sessions,
            successful_sessions: self.successful_sessions,
            failed_sessions: self.failed_sessions,
            cancelled_sessions: self.cancelled_sessions,
            sync_success_rate: success_rate,
            average_sync_duration_ms: average_duration,
            data_transferred_bytes: self.data_transferred_bytes,
            items_synced: self.items_synced,
            last_session_at: self.last_session_at,
        }
    }
}

pub struct MetricsAggregator {
    window: usize,
    devices: RwLock<HashMap<DeviceKey, MetricsRecord>>,
}

impl MetricsAggregator {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Fold a terminal session into the device's metrics. Non-terminal
    /// sessions are ignored.
    pub async fn record_session(&self, device: &DeviceKey, session: &SyncSession) {
        if !session.state.is_terminal() {
            return;
        }

        let mut devices = self.devices.write().await;
        let record = devices.entry(device.clone()).or_default();

        record.total_sessions += 1;
        match session.state {
            SessionState::Completed => record.successful_sessions += 1,
            SessionState::Failed => record.failed_sessions += 1,
            SessionState::Cancelled => record.cancelled_sessions += 1,
            SessionState::Pending | SessionState::InProgress => {}
        }
        record.data_transferred_bytes = record
            .data_transferred_bytes
            .saturating_add(session.stats.bytes_transferred);
        record.items_synced = record
            .items_synced
            .saturating_add(session.stats.items_synced);
        record.last_session_at = session.ended_at.or(record.last_session_at);

        record.window.push_back(WindowEntry {
            state: session.state,
            duration_ms: session.duration_ms(),
        });
        while record.window.len() > self.window {
            record.window.pop_front();
        }

        trace!(device = %device, state = %session.state, "Session recorded in metrics");
    }

    pub async fn snapshot(&self, device: &DeviceKey) -> DeviceMetrics {
        self.devices
            .read()
            .await
            .get(device)
            .map(MetricsRecord::snapshot)
            .unwrap_or_default()
    }

    pub async fn record(&self, device: &DeviceKey) -> MetricsRecord {
        self.devices
            .read()
            .await
            .get(device)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn restore(&self, device: &DeviceKey, record: MetricsRecord) {
        self.devices.write().await.insert(device.clone(), record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionStats, SessionTrigger};
    use chrono::{Duration, TimeZone};

    fn finished(state: SessionState, duration_ms: i64, bytes: u64) -> SyncSession {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let end = start + Duration::milliseconds(duration_ms);
        let stats = SessionStats {
            bytes_transferred: bytes,
            items_synced: 1,
            ..SessionStats::default()
        };
        let session = SyncSession::new(DeviceKey::new("alice", "phone"), SessionTrigger::Scheduled, start)
            .start(start)
            .unwrap();
        match state {
            SessionState::Completed => session.complete(stats, end).unwrap(),
            SessionState::Failed => session.fail(stats, "boom", end).unwrap(),
            _ => session.cancel(stats, "stop", end).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_snapshot_of_unknown_device_is_empty() {
        let metrics = MetricsAggregator::new(20);
        let snapshot = metrics.snapshot(&DeviceKey::new("alice", "phone")).await;
        assert_eq!(snapshot, DeviceMetrics::default());
    }

    #[tokio::test]
    async fn test_rates_and_totals() {
        let metrics = MetricsAggregator::new(20);
        let device = DeviceKey::new("alice", "phone");

        metrics
            .record_session(&device, &finished(SessionState::Completed, 1000, 100))
            .await;
        metrics
            .record_session(&device, &finished(SessionState::Completed, 3000, 50))
            .await;
        metrics
            .record_session(&device, &finished(SessionState::Failed, 2000, 0))
            .await;
        metrics
            .record_session(&device, &finished(SessionState::Cancelled, 2000, 10))
            .await;

        let snapshot = metrics.snapshot(&device).await;
        assert_eq!(snapshot.total_sessions, 4);
        assert_eq!(snapshot.successful_sessions, 2);
        assert_eq!(snapshot.failed_sessions, 1);
        assert_eq!(snapshot.cancelled_sessions, 1);
        assert!((snapshot.sync_success_rate - 0.5).abs() < f64::EPSILON);
        assert!((snapshot.average_sync_duration_ms - 2000.0).abs() < f64::EPSILON);
        assert_eq!(snapshot.data_transferred_bytes, 160);
    }

    #[tokio::test]
    async fn test_window_rolls_but_bytes_accumulate() {
        let metrics = MetricsAggregator::new(2);
        let device = DeviceKey::new("alice", "phone");

        metrics
            .record_session(&device, &finished(SessionState::Failed, 500, 10))
            .await;
        metrics
            .record_session(&device, &finished(SessionState::Completed, 500, 10))
            .await;
        metrics
            .record_session(&device, &finished(SessionState::Completed, 500, 10))
            .await;

        let snapshot = metrics.snapshot(&device).await;
        assert!((snapshot.sync_success_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(snapshot.total_sessions, 3);
        assert_eq!(snapshot.data_transferred_bytes, 30);
    }

    #[tokio::test]
    async fn test_non_terminal_sessions_are_ignored() {
        let metrics = MetricsAggregator::new(20);
        let device = DeviceKey::new("alice", "phone");
        let running = SyncSession::new(device.clone(), SessionTrigger::Manual, Utc::now())
            .start(Utc::now())
            .unwrap();

        metrics.record_session(&device, &running).await;
        assert_eq!(metrics.snapshot(&device).await.total_sessions, 0);
    }
}
