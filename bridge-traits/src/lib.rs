//! # Host Bridge Traits
//!
//! Boundary contracts between the device sync coordinator and the host
//! application.
//!
//! ## Overview
//!
//! The coordinator decides *what* must sync, *in what order* and *with what
//! retry policy*. Everything else is supplied by the host through the traits
//! in this crate: the owners of messages, media and settings, the
//! point-to-point transport, the notification dispatcher and the secure
//! credential store.
//!
//! ## Traits
//!
//! ### Sync collaborators
//! - [`DomainStore`](sync::DomainStore) - Fetch local items and apply remote changes
//! - [`Transport`](sync::Transport) - Reliable point-to-point delivery to a device
//! - [`NotificationDispatcher`](sync::NotificationDispatcher) - Fire-and-forget user notifications
//!
//! ### Security & Storage
//! - [`SecureStore`](storage::SecureStore) - Credential persistence (Keychain/Keystore)
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! should convert platform errors into it and keep messages actionable.
//!
//! ## Thread Safety
//!
//! All traits require `Send + Sync`; sessions for different devices call into
//! the same bridge concurrently.

pub mod error;
pub mod storage;
pub mod sync;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use storage::SecureStore;
pub use sync::{
    DeviceId, DeviceKey, DomainStore, NotificationDispatcher, NotificationKind, SyncCategory,
    SyncNotification, SyncPayload, Transport, TransportAck, UserId,
};
pub use time::{Clock, ConsoleLogger, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
