//! Secure Token Storage
//!
//! Persists per-device sync tokens through the host `SecureStore`
//! (Keychain, Keystore, an encrypted server table, ...).
//!
//! ## Layout
//!
//! - `sync_tokens:<user>:<device>` holds the JSON-encoded [`SyncToken`].
//! - `sync_token_index:<sha256(token)>` and
//!   `sync_refresh_index:<sha256(refresh_token)>` map a presented secret back
//!   to its device without storing the secret a second time.
//!
//! ## Security Features
//!
//! - Tokens are never logged or exposed in error messages
//! - Index keys only carry SHA-256 digests
//! - Rotation removes the previous pair's index entries

use crate::error::{AuthError, Result};
use crate::types::SyncToken;
use bridge_traits::storage::SecureStore;
use bridge_traits::DeviceKey;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, warn};

const TOKEN_PREFIX: &str = "sync_tokens:";
const TOKEN_INDEX_PREFIX: &str = "sync_token_index:";
const REFRESH_INDEX_PREFIX: &str = "sync_refresh_index:";

/// Secure storage for sync tokens
///
/// # Security Considerations
///
/// - Tokens are serialized to JSON before storage
/// - All operations use the underlying `SecureStore` trait
/// - Token values are never logged
#[derive(Clone)]
pub struct TokenStore {
    secure_store: Arc<dyn SecureStore>,
}

/// Hex-encoded SHA-256 digest of a secret value.
pub fn token_digest(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        let _ = write!(hex, "{:02x}", byte);
    }
    hex
}

impl TokenStore {
    pub fn new(secure_store: Arc<dyn SecureStore>) -> Self {
        debug!("Initializing TokenStore");
        Self { secure_store }
    }

    /// Store a token and its lookup indexes.
    ///
    /// Any previous token for the device is overwritten; its index entries
    /// are left alone, use [`rotate`](Self::rotate) to replace a pair.
    pub async fn store(&self, token: &SyncToken) -> Result<()> {
        let device = &token.device;

        let json = serde_json::to_vec(token).map_err(|e| {
            warn!(device = %device, error = %e, "Failed to serialize token");
            AuthError::Serialization(e.to_string())
        })?;
        let device_json =
            serde_json::to_vec(device).map_err(|e| AuthError::Serialization(e.to_string()))?;

        self.put(&Self::storage_key(device), &json, device).await?;
        self.put(
            &Self::token_index_key(&token.token),
            &device_json,
            device,
        )
        .await?;
        self.put(
            &Self::refresh_index_key(&token.refresh_token),
            &device_json,
            device,
        )
        .await?;

        info!(
            device = %device,
            expires_at = %token.expires_at,
            "Sync token stored securely"
        );

        Ok(())
    }

    /// Retrieve the token for a device.
    ///
    /// Corrupted entries are deleted and reported as
    /// [`AuthError::TokenCorrupted`].
    pub async fn load(&self, device: &DeviceKey) -> Result<Option<SyncToken>> {
        let key = Self::storage_key(device);

        let data = self.secure_store.get_secret(&key).await.map_err(|e| {
            warn!(device = %device, error = %e, "Failed to retrieve token from secure storage");
            AuthError::SecureStorageUnavailable(e.to_string())
        })?;

        let Some(data) = data else {
            debug!(device = %device, "No token found in storage");
            return Ok(None);
        };

        match serde_json::from_slice::<SyncToken>(&data) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                warn!(
                    device = %device,
                    error = %e,
                    "Failed to deserialize token, it may be corrupted"
                );

                if let Err(delete_err) = self.secure_store.delete_secret(&key).await {
                    warn!(
                        device = %device,
                        error = %delete_err,
                        "Failed to delete corrupted token data"
                    );
                }

                Err(AuthError::TokenCorrupted {
                    device: device.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Resolve the device owning a presented token.
    pub async fn find_by_token(&self, token: &str) -> Result<Option<DeviceKey>> {
        self.resolve_index(&Self::token_index_key(token)).await
    }

    /// Resolve the device owning a presented refresh token.
    pub async fn find_by_refresh_token(&self, refresh_token: &str) -> Result<Option<DeviceKey>> {
        self.resolve_index(&Self::refresh_index_key(refresh_token))
            .await
    }

    /// Delete a device's token and its indexes.
    ///
    /// Idempotent; succeeds when nothing is stored. Returns whether a token
    /// was present.
    pub async fn delete(&self, device: &DeviceKey) -> Result<bool> {
        let existing = match self.load(device).await {
            Ok(existing) => existing,
            // load() already removed the corrupted entry
            Err(AuthError::TokenCorrupted { .. }) => None,
            Err(e) => return Err(e),
        };

        if let Some(token) = &existing {
            self.remove_indexes(token).await?;
        }

        self.remove(&Self::storage_key(device), device).await?;

        info!(device = %device, had_token = existing.is_some(), "Sync token deleted");
        Ok(existing.is_some())
    }

    /// Replace a device's token pair, returning the previous one.
    pub async fn rotate(&self, new_token: &SyncToken) -> Result<Option<SyncToken>> {
        let previous = match self.load(&new_token.device).await {
            Ok(previous) => previous,
            Err(AuthError::TokenCorrupted { .. }) => None,
            Err(e) => return Err(e),
        };

        if let Some(old) = &previous {
            self.remove_indexes(old).await?;
        }

        self.store(new_token).await?;

        debug!(
            device = %new_token.device,
            had_previous_token = previous.is_some(),
            "Sync token rotated"
        );

        Ok(previous)
    }

    /// List all devices that currently hold a token.
    pub async fn list_devices(&self) -> Result<Vec<DeviceKey>> {
        let keys = self.secure_store.list_keys().await.map_err(|e| {
            warn!(error = %e, "Failed to list keys from secure storage");
            AuthError::SecureStorageUnavailable(e.to_string())
        })?;

        let devices: Vec<DeviceKey> = keys
            .iter()
            .filter_map(|key| key.strip_prefix(TOKEN_PREFIX))
            .filter_map(|rest| rest.split_once(':'))
            .map(|(user, device)| DeviceKey::new(user, device))
            .collect();

        debug!(count = devices.len(), "Listed devices with stored tokens");
        Ok(devices)
    }

    async fn resolve_index(&self, key: &str) -> Result<Option<DeviceKey>> {
        let data = self
            .secure_store
            .get_secret(key)
            .await
            .map_err(|e| AuthError::SecureStorageUnavailable(e.to_string()))?;

        match data {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| AuthError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    async fn remove_indexes(&self, token: &SyncToken) -> Result<()> {
        self.remove(&Self::token_index_key(&token.token), &token.device)
            .await?;
        self.remove(
            &Self::refresh_index_key(&token.refresh_token),
            &token.device,
        )
        .await
    }

    async fn put(&self, key: &str, value: &[u8], device: &DeviceKey) -> Result<()> {
        self.secure_store.set_secret(key, value).await.map_err(|e| {
            warn!(device = %device, error = %e, "Failed to write to secure storage");
            AuthError::SecureStorageUnavailable(e.to_string())
        })
    }

    async fn remove(&self, key: &str, device: &DeviceKey) -> Result<()> {
        self.secure_store.delete_secret(key).await.map_err(|e| {
            warn!(device = %device, error = %e, "Failed to delete from secure storage");
            AuthError::SecureStorageUnavailable(e.to_string())
        })
    }

    fn storage_key(device: &DeviceKey) -> String {
        format!("{}{}:{}", TOKEN_PREFIX, device.user_id, device.device_id)
    }

    fn token_index_key(token: &str) -> String {
        format!("{}{}", TOKEN_INDEX_PREFIX, token_digest(token))
    }

    fn refresh_index_key(refresh_token: &str) -> String {
        format!("{}{}", REFRESH_INDEX_PREFIX, token_digest(refresh_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::BridgeError;
    use chrono::{Duration, Utc};
    use mockall::mock;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    /// In-memory SecureStore for testing
    #[derive(Clone, Default)]
    struct MemorySecureStore {
        storage: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    }

    #[async_trait::async_trait]
    impl SecureStore for MemorySecureStore {
        async fn set_secret(&self, key: &str, value: &[u8]) -> bridge_traits::error::Result<()> {
            self.storage
                .lock()
                .await
                .insert(key.to_string(), value.to_vec());
            Ok(())
        }

        async fn get_secret(&self, key: &str) -> bridge_traits::error::Result<Option<Vec<u8>>> {
            Ok(self.storage.lock().await.get(key).cloned())
        }

        async fn delete_secret(&self, key: &str) -> bridge_traits::error::Result<()> {
            self.storage.lock().await.remove(key);
            Ok(())
        }

        async fn list_keys(&self) -> bridge_traits::error::Result<Vec<String>> {
            Ok(self.storage.lock().await.keys().cloned().collect())
        }

        async fn clear_all(&self) -> bridge_traits::error::Result<()> {
            self.storage.lock().await.clear();
            Ok(())
        }
    }

    mock! {
        FailingStore {}

        #[async_trait::async_trait]
        impl SecureStore for FailingStore {
            async fn set_secret(&self, key: &str, value: &[u8]) -> bridge_traits::error::Result<()>;
            async fn get_secret(&self, key: &str) -> bridge_traits::error::Result<Option<Vec<u8>>>;
            async fn delete_secret(&self, key: &str) -> bridge_traits::error::Result<()>;
            async fn list_keys(&self) -> bridge_traits::error::Result<Vec<String>>;
            async fn clear_all(&self) -> bridge_traits::error::Result<()>;
        }
    }

    fn token(device: &str, suffix: &str) -> SyncToken {
        let now = Utc::now();
        SyncToken {
            token: format!("token-{}", suffix),
            refresh_token: format!("refresh-{}", suffix),
            device: DeviceKey::new("alice", device),
            issued_at: now,
            expires_at: now + Duration::hours(1),
            refresh_expires_at: now + Duration::days(30),
            encryption_key_ref: format!("key-{}", suffix),
        }
    }

    #[tokio::test]
    async fn test_store_and_load_token() {
        let token_store = TokenStore::new(Arc::new(MemorySecureStore::default()));
        let stored = token("phone", "1");

        token_store.store(&stored).await.unwrap();
        let loaded = token_store.load(&stored.device).await.unwrap().unwrap();

        assert_eq!(loaded, stored);
    }

    #[tokio::test]
    async fn test_load_missing_token() {
        let token_store = TokenStore::new(Arc::new(MemorySecureStore::default()));
        let result = token_store
            .load(&DeviceKey::new("alice", "ghost"))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_indexes_resolve_device_without_raw_secret_keys() {
        let secure_store = MemorySecureStore::default();
        let token_store = TokenStore::new(Arc::new(secure_store.clone()));
        let stored = token("phone", "1");
        token_store.store(&stored).await.unwrap();

        assert_eq!(
            token_store.find_by_token("token-1").await.unwrap(),
            Some(stored.device.clone())
        );
        assert_eq!(
            token_store.find_by_refresh_token("refresh-1").await.unwrap(),
            Some(stored.device.clone())
        );
        assert!(token_store.find_by_token("nope").await.unwrap().is_none());

        let keys = secure_store.list_keys().await.unwrap();
        assert!(keys.iter().all(|k| !k.contains("token-1")));
    }

    #[tokio::test]
    async fn test_rotate_drops_old_indexes() {
        let token_store = TokenStore::new(Arc::new(MemorySecureStore::default()));
        let first = token("phone", "1");
        let second = token("phone", "2");

        assert!(token_store.rotate(&first).await.unwrap().is_none());
        let previous = token_store.rotate(&second).await.unwrap().unwrap();
        assert_eq!(previous.token, "token-1");

        assert!(token_store.find_by_token("token-1").await.unwrap().is_none());
        assert!(token_store
            .find_by_refresh_token("refresh-1")
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            token_store.find_by_token("token-2").await.unwrap(),
            Some(second.device.clone())
        );
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let token_store = TokenStore::new(Arc::new(MemorySecureStore::default()));
        let stored = token("phone", "1");
        token_store.store(&stored).await.unwrap();

        assert!(token_store.delete(&stored.device).await.unwrap());
        assert!(!token_store.delete(&stored.device).await.unwrap());
        assert!(token_store.find_by_token("token-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupted_token_is_removed() {
        let secure_store = MemorySecureStore::default();
        secure_store
            .set_secret("sync_tokens:alice:phone", b"not json")
            .await
            .unwrap();
        let token_store = TokenStore::new(Arc::new(secure_store.clone()));

        let err = token_store
            .load(&DeviceKey::new("alice", "phone"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TokenCorrupted { .. }));
        assert!(!secure_store
            .has_secret("sync_tokens:alice:phone")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_list_devices() {
        let token_store = TokenStore::new(Arc::new(MemorySecureStore::default()));
        token_store.store(&token("phone", "1")).await.unwrap();
        token_store.store(&token("tablet", "2")).await.unwrap();

        let mut devices = token_store.list_devices().await.unwrap();
        devices.sort();
        assert_eq!(
            devices,
            vec![
                DeviceKey::new("alice", "phone"),
                DeviceKey::new("alice", "tablet")
            ]
        );
    }

    #[tokio::test]
    async fn test_storage_failure_maps_to_unavailable() {
        let mut failing = MockFailingStore::new();
        failing
            .expect_set_secret()
            .returning(|_, _| Err(BridgeError::NotAvailable("keychain locked".to_string())));
        let token_store = TokenStore::new(Arc::new(failing));

        let err = token_store.store(&token("phone", "1")).await.unwrap_err();
        assert!(matches!(err, AuthError::SecureStorageUnavailable(_)));
    }

    #[test]
    fn test_token_digest_is_stable_hex() {
        let digest = token_digest("abc");
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
