//! # Device Sync Module
//!
//! Coordinates synchronization of user data across a user's devices.
//!
//! ## Overview
//!
//! This module manages the lifecycle of device sync sessions, including:
//! - Registering devices and issuing their sync tokens
//! - Queuing items per device and category with bounded retries
//! - Scheduling sessions by interval and exponential backoff
//! - Resolving concurrent settings changes with last-writer-wins
//! - Aggregating per-device metrics and an error log
//! - Persisting device state documents and session history
//!
//! ## Components
//!
//! - **Device Registry** (`registry`): Device records, sync configuration and due-time computation
//! - **Sync Session** (`session`): Session state machine and the device status transition function
//! - **Queue Manager** (`queue`): Per-device FIFO queues with retry thresholds
//! - **Conflict Resolver** (`conflict`): Settings change logs and deterministic resolution
//! - **Metrics** (`metrics`): Rolling success rate and duration per device
//! - **Error Log** (`errors`): Operator-visible sync errors with resolution flags
//! - **Repository** (`repository`): SQLite persistence for device documents and sessions
//! - **Sync Coordinator** (`coordinator`): Runs sessions and ties the components together

pub mod conflict;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod errors;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod repository;
pub mod session;

pub use conflict::{resolve, ConflictResolver, Resolution, SettingsChange, SettingsLog};
pub use coordinator::{DeviceStatus, RegisteredDevice, SyncCoordinator};
pub use db::{create_pool, create_test_pool, DatabaseConfig};
pub use error::{Result, SyncError};
pub use errors::{ErrorLog, SyncErrorEntry};
pub use metrics::{DeviceMetrics, MetricsAggregator, MetricsRecord};
pub use queue::{CategoryStats, ItemOutcome, ItemStatus, QueueManager, QueueStats, SyncItem};
pub use registry::{
    DataPriority, DeviceInfo, DeviceRecord, DeviceRegistry, DeviceSyncStatus, Platform,
    Registration, SyncConfig,
};
pub use repository::{DeviceStateDocument, SqliteSyncStateRepository, SyncStateRepository};
pub use session::{
    apply_transition, BackoffPolicy, SessionId, SessionState, SessionStats, SessionTrigger,
    SyncSession,
};
