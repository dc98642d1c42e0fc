//! # Event Bus System
//!
//! Provides an event-driven architecture for the device sync coordinator using
//! `tokio::sync::broadcast`. Registry, token and session changes are published
//! as typed events so hosts can observe sync activity without polling.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: Strongly-typed enum hierarchies for device, auth and sync domains
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Wrapper for consuming events with filtering
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    emit     ┌───────────┐
//! │ TokenManager ├────────────>│           │
//! └──────────────┘             │ EventBus  │    subscribe    ┌────────────┐
//!                              │ (broadcast├────────────────>│ Subscriber │
//! ┌──────────────┐    emit     │  channel) │                 └────────────┘
//! │ Coordinator  ├────────────>│           │
//! └──────────────┘             └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, DeviceEvent, EventBus};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut subscriber = event_bus.subscribe();
//!
//! event_bus
//!     .emit(CoreEvent::Device(DeviceEvent::Registered {
//!         user_id: "alice".to_string(),
//!         device_id: "phone".to_string(),
//!         reactivated: false,
//!     }))
//!     .ok();
//!
//! let event = subscriber.recv().await.unwrap();
//! assert_eq!(event.description(), "Device registered");
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   This is non-fatal; the subscriber can continue receiving new events.
//! - **`RecvError::Closed`**: All senders have been dropped. This indicates shutdown.
//!
//! Publishers ignore the error returned when nobody is subscribed.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

// Re-export commonly used types
pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
///
/// Subscribers that can't keep up will receive `RecvError::Lagged`.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Device registry events
    Device(DeviceEvent),
    /// Token lifecycle events
    Auth(AuthEvent),
    /// Sync session events
    Sync(SyncEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Device(e) => e.description(),
            CoreEvent::Auth(e) => e.description(),
            CoreEvent::Sync(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Auth(AuthEvent::AuthError { .. }) => EventSeverity::Error,
            CoreEvent::Sync(SyncEvent::Failed { .. }) => EventSeverity::Error,
            CoreEvent::Sync(SyncEvent::ItemFailed { terminal: true, .. }) => {
                EventSeverity::Warning
            }
            CoreEvent::Sync(SyncEvent::Cancelled { .. }) => EventSeverity::Warning,
            CoreEvent::Device(DeviceEvent::Registered { .. })
            | CoreEvent::Device(DeviceEvent::Deactivated { .. }) => EventSeverity::Info,
            CoreEvent::Sync(SyncEvent::Completed { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    /// Debug-level events (verbose)
    Debug,
    /// Informational events
    Info,
    /// Warning events
    Warning,
    /// Error events
    Error,
}

// ============================================================================
// Device Events
// ============================================================================

/// Events related to the device registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum DeviceEvent {
    /// A device was registered or re-registered.
    Registered {
        user_id: String,
        device_id: String,
        /// True when an inactive record was brought back.
        reactivated: bool,
    },
    /// Sync configuration was replaced.
    ConfigUpdated { user_id: String, device_id: String },
    /// A device was marked inactive.
    Deactivated { user_id: String, device_id: String },
}

impl DeviceEvent {
    fn description(&self) -> &str {
        match self {
            DeviceEvent::Registered { .. } => "Device registered",
            DeviceEvent::ConfigUpdated { .. } => "Device sync configuration updated",
            DeviceEvent::Deactivated { .. } => "Device deactivated",
        }
    }
}

// ============================================================================
// Authentication Events
// ============================================================================

/// Events related to per-device sync tokens.
///
/// Token values never appear in events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum AuthEvent {
    /// A fresh token pair was issued.
    TokenIssued {
        user_id: String,
        device_id: String,
        /// Unix epoch seconds
        expires_at: i64,
    },
    /// A refresh is underway.
    TokenRefreshing { user_id: String, device_id: String },
    /// The token pair was rotated.
    TokenRefreshed {
        user_id: String,
        device_id: String,
        /// Unix epoch seconds
        expires_at: i64,
    },
    /// The device's tokens were invalidated.
    TokenRevoked { user_id: String, device_id: String },
    /// Authentication error occurred.
    AuthError {
        user_id: Option<String>,
        device_id: Option<String>,
        /// Human-readable error message.
        message: String,
        /// Whether the error is recoverable (e.g., retry possible).
        recoverable: bool,
    },
}

impl AuthEvent {
    fn description(&self) -> &str {
        match self {
            AuthEvent::TokenIssued { .. } => "Sync token issued",
            AuthEvent::TokenRefreshing { .. } => "Refreshing sync token",
            AuthEvent::TokenRefreshed { .. } => "Sync token refreshed",
            AuthEvent::TokenRevoked { .. } => "Sync token revoked",
            AuthEvent::AuthError { .. } => "Authentication error",
        }
    }
}

// ============================================================================
// Sync Events
// ============================================================================

/// Events emitted by sync sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SyncEvent {
    /// A session moved to `in_progress`.
    Started {
        session_id: String,
        user_id: String,
        device_id: String,
        /// `scheduled` or `manual`
        trigger: String,
    },
    /// A session drained its due items.
    Completed {
        session_id: String,
        user_id: String,
        device_id: String,
        items_synced: u64,
        items_failed: u64,
        bytes_transferred: u64,
        duration_ms: u64,
    },
    /// A session failed and backoff was scheduled.
    Failed {
        session_id: String,
        user_id: String,
        device_id: String,
        message: String,
        consecutive_failures: u32,
        /// Unix epoch seconds of the next attempt
        next_sync_at: i64,
    },
    /// A session was aborted.
    Cancelled {
        session_id: String,
        user_id: String,
        device_id: String,
        reason: String,
    },
    /// An item transfer failed.
    ItemFailed {
        user_id: String,
        device_id: String,
        category: String,
        item_ref: String,
        retry_count: u32,
        /// True when the item reached its retry threshold.
        terminal: bool,
    },
    /// Concurrent settings changes were reconciled.
    ConflictResolved {
        user_id: String,
        device_id: String,
        key: String,
        winner_device_id: String,
    },
}

impl SyncEvent {
    fn description(&self) -> &str {
        match self {
            SyncEvent::Started { .. } => "Sync session started",
            SyncEvent::Completed { .. } => "Sync session completed",
            SyncEvent::Failed { .. } => "Sync session failed",
            SyncEvent::Cancelled { .. } => "Sync session cancelled",
            SyncEvent::ItemFailed { .. } => "Sync item failed",
            SyncEvent::ConflictResolved { .. } => "Settings conflict resolved",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to events.
///
/// Cloning the bus is cheap; all clones share one channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of events to buffer per subscriber.
    ///   When a subscriber falls behind by more than this amount, it will
    ///   receive a `RecvError::Lagged` error.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an error
    /// if there are no active subscribers.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber to receive events.
    ///
    /// Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

/// Type alias for event filter functions.
type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with additional filtering capabilities.
///
/// # Example
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventSeverity, EventStream};
///
/// let event_bus = EventBus::new(100);
/// let failures = EventStream::new(event_bus.subscribe())
///     .filter(|event| event.severity() >= EventSeverity::Warning);
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    /// Creates a new event stream from a receiver.
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Adds a filter function to this stream.
    ///
    /// Only events that match the filter will be returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Receives the next event that passes the filter (if any).
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;

            let Some(filter) = &self.filter else {
                return Ok(event);
            };

            if filter(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without blocking.
    ///
    /// Returns `None` if no events are currently available.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    let Some(filter) = &self.filter else {
                        return Some(Ok(event));
                    };

                    if filter(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn registered(device_id: &str) -> CoreEvent {
        CoreEvent::Device(DeviceEvent::Registered {
            user_id: "alice".to_string(),
            device_id: device_id.to_string(),
            reactivated: false,
        })
    }

    fn completed() -> CoreEvent {
        CoreEvent::Sync(SyncEvent::Completed {
            session_id: "session-1".to_string(),
            user_id: "alice".to_string(),
            device_id: "phone".to_string(),
            items_synced: 3,
            items_failed: 0,
            bytes_transferred: 1024,
            duration_ms: 250,
        })
    }

    #[tokio::test]
    async fn test_event_bus_subscription() {
        let bus = EventBus::new(10);
        assert_eq!(bus.subscriber_count(), 0);
        let _sub1 = bus.subscribe();
        let _sub2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_event_emission_no_subscribers() {
        let bus = EventBus::new(10);

        // Should error when no subscribers
        assert!(bus.emit(registered("phone")).is_err());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_receive_same_event() {
        let bus = EventBus::new(10);
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();

        let event = completed();
        assert_eq!(bus.emit(event.clone()).unwrap(), 2);

        assert_eq!(sub1.recv().await.unwrap(), event);
        assert_eq!(sub2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_event_stream_with_filter() {
        let bus = EventBus::new(10);
        let mut stream =
            EventStream::new(bus.subscribe()).filter(|event| matches!(event, CoreEvent::Auth(_)));

        bus.emit(completed()).ok();

        let auth_event = CoreEvent::Auth(AuthEvent::TokenRevoked {
            user_id: "alice".to_string(),
            device_id: "phone".to_string(),
        });
        bus.emit(auth_event.clone()).ok();

        let received = stream.recv().await.unwrap();
        assert_eq!(received, auth_event);
    }

    #[tokio::test]
    async fn test_lagged_subscriber() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();

        for i in 0..5 {
            bus.emit(registered(&format!("device-{}", i))).ok();
        }

        let result = sub.recv().await;
        assert!(matches!(result, Err(RecvError::Lagged(_))));
    }

    #[test]
    fn test_event_severity() {
        let failed = CoreEvent::Sync(SyncEvent::Failed {
            session_id: "s".to_string(),
            user_id: "alice".to_string(),
            device_id: "phone".to_string(),
            message: "token refresh failed".to_string(),
            consecutive_failures: 1,
            next_sync_at: 0,
        });
        assert_eq!(failed.severity(), EventSeverity::Error);
        assert_eq!(completed().severity(), EventSeverity::Info);

        let retrying = CoreEvent::Sync(SyncEvent::ItemFailed {
            user_id: "alice".to_string(),
            device_id: "phone".to_string(),
            category: "media".to_string(),
            item_ref: "m1".to_string(),
            retry_count: 1,
            terminal: false,
        });
        assert_eq!(retrying.severity(), EventSeverity::Debug);

        let exhausted = CoreEvent::Sync(SyncEvent::ItemFailed {
            user_id: "alice".to_string(),
            device_id: "phone".to_string(),
            category: "media".to_string(),
            item_ref: "m1".to_string(),
            retry_count: 5,
            terminal: true,
        });
        assert_eq!(exhausted.severity(), EventSeverity::Warning);
    }

    #[tokio::test]
    async fn test_concurrent_publishers() {
        let bus = EventBus::new(100);
        let mut sub = bus.subscribe();

        let bus1 = bus.clone();
        let bus2 = bus.clone();

        let handle1 = tokio::spawn(async move {
            for i in 0..10 {
                bus1.emit(registered(&format!("device-{}", i))).ok();
            }
        });

        let handle2 = tokio::spawn(async move {
            for _ in 0..10 {
                bus2.emit(completed()).ok();
            }
        });

        handle1.await.ok();
        handle2.await.ok();

        let mut count = 0;
        while sub.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 20);
    }

    #[test]
    fn test_event_serialization() {
        let event = CoreEvent::Sync(SyncEvent::ConflictResolved {
            user_id: "alice".to_string(),
            device_id: "phone".to_string(),
            key: "theme".to_string(),
            winner_device_id: "alpha".to_string(),
        });

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"Sync\""));
        assert!(json.contains("\"event\":\"ConflictResolved\""));

        let deserialized: CoreEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, event);
    }

    #[tokio::test]
    async fn test_try_recv_empty() {
        let bus = EventBus::default();
        let mut stream = EventStream::new(bus.subscribe());

        assert!(stream.try_recv().is_none());

        bus.emit(registered("phone")).ok();
        let received = stream.try_recv().unwrap().unwrap();
        assert_eq!(received.description(), "Device registered");
    }
}
