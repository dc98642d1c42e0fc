//! # Token Lifecycle Manager
//!
//! Issues, validates, refreshes and revokes per-device sync tokens.
//!
//! ## Overview
//!
//! Every registered device holds one [`SyncToken`]. The manager mints token
//! pairs from a cryptographically secure RNG, persists them through the
//! [`TokenStore`], and emits auth events on the shared event bus.
//!
//! ## Concurrency
//!
//! Refreshes for one device are serialized by a per-device lock so two
//! sessions racing on an expiring token never rotate it twice. Different
//! devices refresh in parallel.
//!
//! ## Failure model
//!
//! Token handling fails closed: a missing, rotated or expired credential is
//! an error, never a silently re-issued token.
//!
//! ## Usage
//!
//! ```ignore
//! use core_auth::TokenManager;
//!
//! let manager = TokenManager::new(secure_store, event_bus, clock, TokenPolicy::default());
//! let token = manager.issue(&device).await?;
//! assert!(manager.validate(&token.token).await?.valid);
//! let fresh = manager.ensure_fresh(&device).await?;
//! ```

use crate::error::{AuthError, Result};
use crate::token_store::TokenStore;
use crate::types::{SyncToken, TokenValidation};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bridge_traits::{Clock, DeviceKey, SecureStore};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use core_runtime::config::TokenPolicy;
use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, instrument, warn};

/// Default timeout for secure-store round trips during refresh
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Random bytes per token value
const TOKEN_BYTES: usize = 32;

/// Per-device sync token lifecycle.
pub struct TokenManager {
    token_store: TokenStore,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    policy: TokenPolicy,
    operation_timeout: Duration,
    /// Per-device refresh locks to prevent concurrent rotation
    refresh_locks: Arc<Mutex<HashMap<DeviceKey, Arc<Mutex<()>>>>>,
}

impl TokenManager {
    pub fn new(
        secure_store: Arc<dyn SecureStore>,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
        policy: TokenPolicy,
    ) -> Self {
        Self {
            token_store: TokenStore::new(secure_store),
            event_bus,
            clock,
            policy,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            refresh_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Bound each refresh to `operation_timeout`.
    pub fn with_operation_timeout(mut self, operation_timeout: Duration) -> Self {
        self.operation_timeout = operation_timeout;
        self
    }

    pub fn policy(&self) -> &TokenPolicy {
        &self.policy
    }

    /// Issue a fresh token pair for a device, replacing any existing pair.
    #[instrument(skip(self), fields(device = %device))]
    pub async fn issue(&self, device: &DeviceKey) -> Result<SyncToken> {
        let lock = self.device_lock(device).await;
        let _guard = lock.lock().await;

        let token = self.mint(device, self.clock.now());
        self.token_store.rotate(&token).await?;

        let _ = self.event_bus.emit(CoreEvent::Auth(AuthEvent::TokenIssued {
            user_id: device.user_id.to_string(),
            device_id: device.device_id.to_string(),
            expires_at: token.expires_at.timestamp(),
        }));

        info!(expires_at = %token.expires_at, "Sync token issued");
        Ok(token)
    }

    /// Check whether a presented token currently authorizes its device.
    ///
    /// Unknown tokens validate as `{ valid: false, device: None }`; a known
    /// but expired token reports its device with `valid: false`.
    pub async fn validate(&self, token: &str) -> Result<TokenValidation> {
        let Some(device) = self.token_store.find_by_token(token).await? else {
            debug!("Presented token matches no device");
            return Ok(TokenValidation {
                valid: false,
                device: None,
            });
        };

        let current = self.token_store.load(&device).await?;
        let valid = current
            .as_ref()
            .map(|t| t.token == token && !t.is_expired(self.clock.now()))
            .unwrap_or(false);

        debug!(device = %device, valid, "Token validated");
        Ok(TokenValidation {
            valid,
            device: Some(device),
        })
    }

    /// Redeem a refresh token for a new pair.
    ///
    /// # Errors
    ///
    /// - [`AuthError::TokenInvalid`] if the refresh token matches no device or
    ///   has already been rotated
    /// - [`AuthError::TokenExpired`] if the refresh token has expired; the
    ///   device must re-register
    #[instrument(skip(self, refresh_token))]
    pub async fn refresh(&self, refresh_token: &str) -> Result<SyncToken> {
        let device = self
            .token_store
            .find_by_refresh_token(refresh_token)
            .await?
            .ok_or_else(|| {
                warn!("Refresh token matches no active device");
                AuthError::TokenInvalid("refresh token not recognized".to_string())
            })?;

        let lock = self.device_lock(&device).await;
        let _guard = lock.lock().await;

        let current = self.token_store.load(&device).await?.ok_or_else(|| {
            AuthError::TokenInvalid(format!("no active token for device {}", device))
        })?;

        // A concurrent refresh may have rotated the pair while we waited
        if current.refresh_token != refresh_token {
            warn!(device = %device, "Refresh token already rotated");
            return Err(AuthError::TokenInvalid(
                "refresh token already rotated".to_string(),
            ));
        }

        self.rotate_locked(&current).await
    }

    /// Invalidate a device's tokens. Idempotent.
    #[instrument(skip(self), fields(device = %device))]
    pub async fn revoke(&self, device: &DeviceKey) -> Result<()> {
        let lock = self.device_lock(device).await;
        let _guard = lock.lock().await;

        let existed = self.token_store.delete(device).await?;

        if existed {
            let _ = self.event_bus.emit(CoreEvent::Auth(AuthEvent::TokenRevoked {
                user_id: device.user_id.to_string(),
                device_id: device.device_id.to_string(),
            }));
            info!("Sync token revoked");
        }

        Ok(())
    }

    /// Return a token valid for a full session, refreshing proactively when
    /// less than `refresh_threshold_ratio` of its TTL remains.
    #[instrument(skip(self), fields(device = %device))]
    pub async fn ensure_fresh(&self, device: &DeviceKey) -> Result<SyncToken> {
        let lock = self.device_lock(device).await;
        let _guard = lock.lock().await;

        let current = self.token_store.load(device).await?.ok_or_else(|| {
            warn!("No token found for device");
            AuthError::TokenInvalid(format!("no active token for device {}", device))
        })?;

        if !current.needs_refresh(self.clock.now(), self.policy.refresh_threshold_ratio) {
            debug!("Token is valid, no refresh needed");
            return Ok(current);
        }

        info!("Token expired or expiring soon, refreshing");
        self.rotate_locked(&current).await
    }

    /// Current token for a device, if any.
    pub async fn current(&self, device: &DeviceKey) -> Result<Option<SyncToken>> {
        self.token_store.load(device).await
    }

    /// Rotate `current`; the caller holds the device lock.
    async fn rotate_locked(&self, current: &SyncToken) -> Result<SyncToken> {
        let device = &current.device;
        let now = self.clock.now();

        if current.is_refresh_expired(now) {
            error!(device = %device, "Refresh token expired, device must re-register");
            self.emit_auth_error(device, "Refresh token expired", false);
            return Err(AuthError::TokenExpired(device.to_string()));
        }

        let _ = self
            .event_bus
            .emit(CoreEvent::Auth(AuthEvent::TokenRefreshing {
                user_id: device.user_id.to_string(),
                device_id: device.device_id.to_string(),
            }));

        let next = self.mint(device, now);

        match timeout(self.operation_timeout, self.token_store.rotate(&next)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                error!(device = %device, error = %e, "Token refresh failed");
                self.emit_auth_error(device, &format!("Token refresh failed: {}", e), true);
                return Err(e);
            }
            Err(_) => {
                error!(device = %device, "Token refresh timed out");
                self.emit_auth_error(device, "Token refresh timeout", true);
                return Err(AuthError::OperationTimeout {
                    operation: "token refresh".to_string(),
                });
            }
        }

        let _ = self
            .event_bus
            .emit(CoreEvent::Auth(AuthEvent::TokenRefreshed {
                user_id: device.user_id.to_string(),
                device_id: device.device_id.to_string(),
                expires_at: next.expires_at.timestamp(),
            }));

        info!(device = %device, expires_at = %next.expires_at, "Token refreshed successfully");
        Ok(next)
    }

    async fn device_lock(&self, device: &DeviceKey) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        locks
            .entry(device.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn mint(&self, device: &DeviceKey, now: DateTime<Utc>) -> SyncToken {
        SyncToken {
            token: random_token(),
            refresh_token: random_token(),
            device: device.clone(),
            issued_at: now,
            expires_at: now + secs(self.policy.ttl_secs),
            refresh_expires_at: now + secs(self.policy.refresh_ttl_secs),
            encryption_key_ref: format!("devsync-key:{}", uuid::Uuid::new_v4()),
        }
    }

    fn emit_auth_error(&self, device: &DeviceKey, message: &str, recoverable: bool) {
        let _ = self.event_bus.emit(CoreEvent::Auth(AuthEvent::AuthError {
            user_id: Some(device.user_id.to_string()),
            device_id: Some(device.device_id.to_string()),
            message: message.to_string(),
            recoverable,
        }));
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn secs(value: u64) -> ChronoDuration {
    ChronoDuration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1000))
}
