//! Sync Collaborator Contracts
//!
//! Identity types shared across the workspace plus the traits the coordinator
//! uses to reach domain data, remote devices and the notification pipeline.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

/// Identifier of the user owning a set of devices.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of a device, unique within one user.
///
/// Ordering is lexicographic on the raw identifier; the conflict resolver
/// relies on it to break timestamp ties.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// The `(user, device)` pair identifying one device record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceKey {
    pub user_id: UserId,
    pub device_id: DeviceId,
}

impl DeviceKey {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: UserId::new(user_id),
            device_id: DeviceId::new(device_id),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.device_id)
    }
}

/// Category of synchronized data.
///
/// Declaration order is the drain priority: small, high-value state reaches
/// other devices before bulk transfers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SyncCategory {
    Settings,
    Messages,
    Contacts,
    Media,
}

impl SyncCategory {
    /// All categories in drain order.
    pub const PRIORITY_ORDER: [SyncCategory; 4] = [
        SyncCategory::Settings,
        SyncCategory::Messages,
        SyncCategory::Contacts,
        SyncCategory::Media,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncCategory::Settings => "settings",
            SyncCategory::Messages => "messages",
            SyncCategory::Contacts => "contacts",
            SyncCategory::Media => "media",
        }
    }

    /// Parse a category from its storage identifier
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "settings" => Some(SyncCategory::Settings),
            "messages" => Some(SyncCategory::Messages),
            "contacts" => Some(SyncCategory::Contacts),
            "media" => Some(SyncCategory::Media),
            _ => None,
        }
    }

    /// Whether items of this category may be transferred concurrently.
    pub fn allows_parallel_transfer(&self) -> bool {
        matches!(self, SyncCategory::Media)
    }
}

impl fmt::Display for SyncCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of data moving between the coordinator and a device.
///
/// `data` is opaque except for the settings category, where it carries a
/// JSON-encoded settings change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub category: SyncCategory,
    pub item_ref: String,
    pub data: Bytes,
}

impl SyncPayload {
    pub fn new(category: SyncCategory, item_ref: impl Into<String>, data: Bytes) -> Self {
        Self {
            category,
            item_ref: item_ref.into(),
            data,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Acknowledgement returned by a successful [`Transport::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportAck {
    /// Bytes accepted by the remote end
    pub bytes_transferred: u64,
}

/// Owners of messages, media, contacts and settings.
///
/// The coordinator treats payloads as opaque and never interprets them
/// beyond settings change triples.
#[async_trait]
pub trait DomainStore: Send + Sync {
    /// Load the payload for a queued item.
    async fn fetch_item(&self, category: SyncCategory, item_ref: &str) -> Result<Bytes>;

    /// Apply a change received from another device.
    async fn apply_remote_change(
        &self,
        category: SyncCategory,
        item_ref: &str,
        payload: Bytes,
    ) -> Result<()>;
}

/// Reliable point-to-point channel to a device.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a payload to the device.
    async fn send(&self, device: &DeviceKey, payload: SyncPayload) -> Result<TransportAck>;

    /// Take the next payload the device has published, if any.
    async fn receive(&self, device: &DeviceKey) -> Result<Option<SyncPayload>>;
}

/// What a [`SyncNotification`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    SyncCompleted,
    SyncFailing,
}

/// Notification handed to the host dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncNotification {
    pub device: DeviceKey,
    pub kind: NotificationKind,
    pub consecutive_failures: u32,
    pub message: String,
    /// Push token registered by the device, if any
    pub push_token: Option<String>,
}

/// Fire-and-forget notification delivery.
///
/// Failures are logged by the caller and never influence sync behavior.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, notification: SyncNotification) -> Result<()>;
}
