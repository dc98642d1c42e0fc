//! # Sync Session State Machine
//!
//! One `SyncSession` per sync attempt, with validated state transitions.
//!
//! ```text
//! Pending → InProgress → Completed
//!    ↓          ↓
//!    └──────→ Failed
//!    └──────→ Cancelled
//! ```
//!
//! Session transitions are pure: [`SyncSession`] methods consume the session
//! and return the next one, and [`apply_transition`] derives the device's new
//! [`DeviceSyncStatus`] from the session that just transitioned. The
//! coordinator calls both while holding the device lock and persists the
//! result afterwards.

use crate::error::{Result, SyncError};
use crate::registry::DeviceSyncStatus;
use bridge_traits::DeviceKey;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a sync session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a session ID from a string
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a valid UUID
    pub fn from_string(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| SyncError::NotFound {
                entity: "session",
                id: format!("{s} ({e})"),
            })
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The current state of a sync session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Pending | SessionState::InProgress)
    }

    /// String representation for database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::InProgress => "in_progress",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        }
    }
}

impl FromStr for SessionState {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SessionState::Pending),
            "in_progress" => Ok(SessionState::InProgress),
            "completed" => Ok(SessionState::Completed),
            "failed" => Ok(SessionState::Failed),
            "cancelled" => Ok(SessionState::Cancelled),
            _ => Err(SyncError::InvalidStatus(s.to_string())),
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What started the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionTrigger {
    /// The device became due
    Scheduled,
    /// Explicit request from the caller
    Manual,
}

impl SessionTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionTrigger::Scheduled => "scheduled",
            SessionTrigger::Manual => "manual",
        }
    }
}

impl FromStr for SessionTrigger {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(SessionTrigger::Scheduled),
            "manual" => Ok(SessionTrigger::Manual),
            _ => Err(SyncError::InvalidStatus(s.to_string())),
        }
    }
}

impl std::fmt::Display for SessionTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Counters accumulated while a session drains its queues
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub items_synced: u64,
    pub items_failed: u64,
    /// Items that reached their retry threshold during this session
    pub items_exhausted: u64,
    pub inbound_applied: u64,
    pub conflicts_resolved: u64,
    pub bytes_transferred: u64,
}

/// A sync session with state machine semantics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSession {
    pub id: SessionId,
    pub device: DeviceKey,
    pub state: SessionState,
    pub trigger: SessionTrigger,
    pub stats: SessionStats,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl SyncSession {
    /// Create a new session in pending state
    pub fn new(device: DeviceKey, trigger: SessionTrigger, now: DateTime<Utc>) -> Self {
        Self {
            id: SessionId::new(),
            device,
            state: SessionState::Pending,
            trigger,
            stats: SessionStats::default(),
            error_message: None,
            created_at: now,
            started_at: None,
            ended_at: None,
        }
    }

    /// # Errors
    ///
    /// Returns an error if the session is not `Pending`
    pub fn start(mut self, now: DateTime<Utc>) -> Result<Self> {
        self.validate_transition(SessionState::InProgress)?;
        self.state = SessionState::InProgress;
        self.started_at = Some(now);
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns an error if the session is not `InProgress`
    pub fn complete(mut self, stats: SessionStats, now: DateTime<Utc>) -> Result<Self> {
        self.validate_transition(SessionState::Completed)?;
        self.state = SessionState::Completed;
        self.stats = stats;
        self.ended_at = Some(now);
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns an error if the session is already terminal
    pub fn fail(
        mut self,
        stats: SessionStats,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        self.validate_transition(SessionState::Failed)?;
        self.state = SessionState::Failed;
        self.stats = stats;
        self.error_message = Some(message.into());
        self.ended_at = Some(now);
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns an error if the session is already terminal
    pub fn cancel(
        mut self,
        stats: SessionStats,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        self.validate_transition(SessionState::Cancelled)?;
        self.state = SessionState::Cancelled;
        self.stats = stats;
        self.error_message = Some(reason.into());
        self.ended_at = Some(now);
        Ok(self)
    }

    /// Wall-clock duration between start and end, if both are known
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration()
            .map(|d| d.num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }

    fn validate_transition(&self, to: SessionState) -> Result<()> {
        let valid = match (self.state, to) {
            (SessionState::Pending, SessionState::InProgress) => true,
            (SessionState::Pending, SessionState::Failed) => true,
            (SessionState::Pending, SessionState::Cancelled) => true,

            (SessionState::InProgress, SessionState::Completed) => true,
            (SessionState::InProgress, SessionState::Failed) => true,
            (SessionState::InProgress, SessionState::Cancelled) => true,

            _ => false,
        };

        if !valid {
            return Err(SyncError::InvalidStateTransition {
                from: self.state.as_str().to_string(),
                to: to.as_str().to_string(),
                reason: format!(
                    "Cannot transition from {} to {}",
                    self.state.as_str(),
                    to.as_str()
                ),
            });
        }

        Ok(())
    }
}

/// Exponential backoff for failed sessions:
/// `min(max_delay, base_delay * 2^consecutive_failures)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl BackoffPolicy {
    pub fn new(base_delay_secs: u64, max_delay_secs: u64) -> Self {
        Self {
            base_delay_secs,
            max_delay_secs,
        }
    }

    pub fn delay_secs(&self, consecutive_failures: u32) -> u64 {
        let factor = 1u64.checked_shl(consecutive_failures).unwrap_or(u64::MAX);
        self.base_delay_secs
            .saturating_mul(factor)
            .min(self.max_delay_secs)
    }

    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        secs_to_duration(self.delay_secs(consecutive_failures))
    }
}

impl From<&core_runtime::SyncPolicy> for BackoffPolicy {
    fn from(policy: &core_runtime::SyncPolicy) -> Self {
        Self::new(policy.base_delay_secs, policy.max_delay_secs)
    }
}

/// Derive the device status that follows `session`'s latest transition.
///
/// This is the only place `consecutive_failures` changes:
/// - `InProgress` records the attempt
/// - `Completed` resets failures and schedules one interval ahead
/// - `Failed` increments failures, then backs off using the new count
/// - `Cancelled` leaves failures untouched and schedules one interval ahead
pub fn apply_transition(
    status: &DeviceSyncStatus,
    session: &SyncSession,
    sync_interval: Duration,
    backoff: &BackoffPolicy,
    now: DateTime<Utc>,
) -> DeviceSyncStatus {
    let mut next = status.clone();
    next.current = Some(session.state);
    next.current_session_id = Some(session.id);

    match session.state {
        SessionState::Pending => {}
        SessionState::InProgress => {
            next.last_attempt_at = Some(session.started_at.unwrap_or(now));
        }
        SessionState::Completed => {
            next.consecutive_failures = 0;
            next.last_success_at = Some(now);
            next.next_sync_at = Some(now + sync_interval);
        }
        SessionState::Failed => {
            next.consecutive_failures = status.consecutive_failures.saturating_add(1);
            next.next_sync_at = Some(now + backoff.delay_for(next.consecutive_failures));
        }
        SessionState::Cancelled => {
            next.next_sync_at = Some(now + sync_interval);
        }
    }

    next
}

pub(crate) fn secs_to_duration(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}
