use bridge_traits::{DeviceId, DeviceKey};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-device sync credential.
///
/// Owned by exactly one device record. The token authorizes sync sessions
/// until `expires_at`; the refresh token can mint a new pair until
/// `refresh_expires_at`.
///
/// # Security
///
/// Tokens should be stored securely and never logged. The `Debug`
/// implementation redacts both secret values.
///
/// # Examples
///
/// ```
/// use bridge_traits::DeviceKey;
/// use chrono::{Duration, Utc};
/// use core_auth::SyncToken;
///
/// let issued_at = Utc::now();
/// let token = SyncToken {
///     token: "t0k".to_string(),
///     refresh_token: "r3f".to_string(),
///     device: DeviceKey::new("alice", "phone"),
///     issued_at,
///     expires_at: issued_at + Duration::hours(1),
///     refresh_expires_at: issued_at + Duration::days(30),
///     encryption_key_ref: "devsync-key:1".to_string(),
/// };
///
/// assert!(!token.is_expired(issued_at));
/// assert!(!format!("{:?}", token).contains("t0k"));
/// ```
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncToken {
    /// Opaque token presented by the device
    pub token: String,
    /// Single-use refresh token
    pub refresh_token: String,
    /// Device this token belongs to
    pub device: DeviceKey,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    /// Reference to the payload encryption key held by the host
    pub encryption_key_ref: String,
}

impl SyncToken {
    /// Whether the token no longer authorizes sessions at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether the refresh token can no longer be redeemed at `now`.
    pub fn is_refresh_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.refresh_expires_at
    }

    /// Total lifetime of the token.
    pub fn ttl(&self) -> Duration {
        self.expires_at - self.issued_at
    }

    /// Whether the remaining lifetime dropped below `ratio` of the TTL.
    ///
    /// Expired tokens always need a refresh.
    pub fn needs_refresh(&self, now: DateTime<Utc>, ratio: f64) -> bool {
        if self.is_expired(now) {
            return true;
        }
        let remaining_ms = (self.expires_at - now).num_milliseconds();
        let threshold_ms = (self.ttl().num_milliseconds() as f64 * ratio) as i64;
        remaining_ms < threshold_ms
    }

    /// Non-secret view of the token suitable for persisted device state.
    pub fn metadata(&self) -> TokenMetadata {
        TokenMetadata {
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            refresh_expires_at: self.refresh_expires_at,
            encryption_key_ref: self.encryption_key_ref.clone(),
        }
    }
}

impl fmt::Debug for SyncToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncToken")
            .field("token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("device", &self.device)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .field("encryption_key_ref", &self.encryption_key_ref)
            .finish()
    }
}

/// Token fields that may be persisted outside the secure store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub encryption_key_ref: String,
}

/// Result of [`TokenManager::validate`](crate::TokenManager::validate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenValidation {
    pub valid: bool,
    /// Owning device when the token is known, even if it has expired
    pub device: Option<DeviceKey>,
}

impl TokenValidation {
    pub fn device_id(&self) -> Option<&DeviceId> {
        self.device.as_ref().map(|d| &d.device_id)
    }
}
