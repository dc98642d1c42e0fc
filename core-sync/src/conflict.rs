//! # Settings Conflict Resolver
//!
//! Reconciles concurrent changes to the same settings key with
//! last-writer-wins on `synced_at`. Equal timestamps go to the change whose
//! origin device id sorts first, so the same pair always yields the same
//! winner regardless of argument order.
//!
//! Every resolution appends both changes to the device's settings log. The
//! losing change is kept with `superseded = true`.

use crate::error::{Result, SyncError};
use bridge_traits::{DeviceId, DeviceKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A versioned change to one settings key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsChange {
    /// Position in the owning device's log; assigned on append
    #[serde(default)]
    pub version: u64,
    pub key: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: serde_json::Value,
    pub origin_device: DeviceId,
    pub synced_at: DateTime<Utc>,
    #[serde(default)]
    pub superseded: bool,
}

impl SettingsChange {
    pub fn new(
        key: impl Into<String>,
        old_value: Option<serde_json::Value>,
        new_value: serde_json::Value,
        origin_device: DeviceId,
        synced_at: DateTime<Utc>,
    ) -> Self {
        Self {
            version: 0,
            key: key.into(),
            old_value,
            new_value,
            origin_device,
            synced_at,
            superseded: false,
        }
    }

    fn same_write(&self, other: &SettingsChange) -> bool {
        self.origin_device == other.origin_device
            && self.synced_at == other.synced_at
            && self.new_value == other.new_value
    }
}

/// Append-only change log of one device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsLog {
    pub version: u64,
    pub changes: Vec<SettingsChange>,
}

impl SettingsLog {
    fn append(&mut self, mut change: SettingsChange) -> SettingsChange {
        self.version += 1;
        change.version = self.version;
        self.changes.push(change.clone());
        change
    }

    /// Latest change for `key` that has not been superseded
    pub fn latest(&self, key: &str) -> Option<&SettingsChange> {
        self.changes
            .iter()
            .rev()
            .find(|c| c.key == key && !c.superseded)
    }
}

/// Outcome of a recorded resolution
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub winner: SettingsChange,
    pub loser: Option<SettingsChange>,
}

impl Resolution {
    /// True when the incoming change won and must be applied locally
    pub fn remote_won(&self, remote: &SettingsChange) -> bool {
        self.winner.origin_device == remote.origin_device
            && self.winner.synced_at == remote.synced_at
    }
}

/// Pick the winner between two changes to `key`.
///
/// # Errors
///
/// `ConflictUnresolvable` when either change belongs to another key, or when
/// one device reports two different values at the same instant.
pub fn resolve(
    key: &str,
    local: &SettingsChange,
    remote: &SettingsChange,
) -> Result<SettingsChange> {
    if local.key != key || remote.key != key {
        return Err(SyncError::ConflictUnresolvable {
            key: key.to_string(),
            reason: format!(
                "changes target '{}' and '{}'",
                local.key, remote.key
            ),
        });
    }

    let winner = match local.synced_at.cmp(&remote.synced_at) {
        Ordering::Greater => local,
        Ordering::Less => remote,
        Ordering::Equal => match local.origin_device.cmp(&remote.origin_device) {
            Ordering::Less => local,
            Ordering::Greater => remote,
            Ordering::Equal if local.new_value == remote.new_value => local,
            Ordering::Equal => {
                return Err(SyncError::ConflictUnresolvable {
                    key: key.to_string(),
                    reason: format!(
                        "device {} wrote two values at {}",
                        local.origin_device, local.synced_at
                    ),
                });
            }
        },
    };

    Ok(winner.clone())
}

/// Per-device settings logs with resolution bookkeeping
#[derive(Default)]
pub struct ConflictResolver {
    logs: RwLock<HashMap<DeviceKey, SettingsLog>>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `remote` against the device's latest change for the same key
    /// and append the outcome to the log.
    ///
    /// With no prior change the remote change is recorded as-is.
    pub async fn reconcile(
        &self,
        device: &DeviceKey,
        remote: SettingsChange,
    ) -> Result<Resolution> {
        let mut logs = self.logs.write().await;
        let log = logs.entry(device.clone()).or_default();

        let local = match log.latest(&remote.key).cloned() {
            Some(local) if local.same_write(&remote) => {
                debug!(device = %device, key = %remote.key, "Settings change already recorded");
                return Ok(Resolution {
                    winner: local,
                    loser: None,
                });
            }
            Some(local) => local,
            None => {
                let winner = log.append(SettingsChange {
                    superseded: false,
                    ..remote
                });
                return Ok(Resolution {
                    winner,
                    loser: None,
                });
            }
        };

        let key = remote.key.clone();
        let winner = resolve(&key, &local, &remote)?;
        let remote_won = winner.same_write(&remote);

        // Mark the local entry superseded in place when the remote wins
        if remote_won {
            if let Some(entry) = log
                .changes
                .iter_mut()
                .rev()
                .find(|c| c.version == local.version)
            {
                entry.superseded = true;
            }
        }

        let (winner, loser) = if remote_won {
            let winner = log.append(SettingsChange {
                superseded: false,
                ..remote
            });
            (
                winner,
                SettingsChange {
                    superseded: true,
                    ..local
                },
            )
        } else {
            let loser = log.append(SettingsChange {
                superseded: true,
                ..remote
            });
            (local, loser)
        };

        info!(
            device = %device,
            key = %key,
            winner = %winner.origin_device,
            loser = %loser.origin_device,
            "Settings conflict resolved"
        );

        Ok(Resolution {
            winner,
            loser: Some(loser),
        })
    }

    /// Record a locally originated change.
    ///
    /// Local changes go through the same last-writer-wins pass as remote
    /// ones, so a change recorded out of `synced_at` order is kept as
    /// superseded instead of becoming the latest entry.
    pub async fn record(&self, device: &DeviceKey, change: SettingsChange) -> Result<Resolution> {
        self.reconcile(device, change).await
    }

    pub async fn latest(&self, device: &DeviceKey, key: &str) -> Option<SettingsChange> {
        self.logs
            .read()
            .await
            .get(device)
            .and_then(|log| log.latest(key).cloned())
    }

    pub async fn log(&self, device: &DeviceKey) -> SettingsLog {
        self.logs
            .read()
            .await
            .get(device)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn restore(&self, device: &DeviceKey, log: SettingsLog) {
        self.logs.write().await.insert(device.clone(), log);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn change(device: &str, secs: i64, value: &str) -> SettingsChange {
        SettingsChange::new("theme", None, json!(value), DeviceId::new(device), at(secs))
    }

    #[test]
    fn test_later_change_wins() {
        let local = change("beta", 10, "dark");
        let remote = change("alpha", 12, "light");

        let winner = resolve("theme", &local, &remote).unwrap();
        assert_eq!(winner.new_value, json!("light"));
    }

    #[test]
    fn test_tie_goes_to_smallest_device_id() {
        let alpha = change("alpha", 10, "dark");
        let beta = change("beta", 10, "light");

        for _ in 0..10 {
            let a = resolve("theme", &alpha, &beta).unwrap();
            let b = resolve("theme", &beta, &alpha).unwrap();
            assert_eq!(a.origin_device.as_str(), "alpha");
            assert_eq!(b.origin_device.as_str(), "alpha");
        }
    }

    #[test]
    fn test_key_mismatch_is_unresolvable() {
        let local = change("alpha", 10, "dark");
        let mut remote = change("beta", 10, "light");
        remote.key = "language".to_string();

        assert!(matches!(
            resolve("theme", &local, &remote),
            Err(SyncError::ConflictUnresolvable { .. })
        ));
    }

    #[test]
    fn test_same_device_same_instant_different_values() {
        let first = change("alpha", 10, "dark");
        let second = change("alpha", 10, "light");
        assert!(resolve("theme", &first, &second).is_err());

        let duplicate = change("alpha", 10, "dark");
        assert!(resolve("theme", &first, &duplicate).is_ok());
    }

    #[tokio::test]
    async fn test_reconcile_keeps_loser_superseded() {
        let resolver = ConflictResolver::new();
        let device = DeviceKey::new("alice", "beta");

        resolver.record(&device, change("beta", 10, "light")).await.unwrap();
        let resolution = resolver
            .reconcile(&device, change("alpha", 10, "dark"))
            .await
            .unwrap();

        assert_eq!(resolution.winner.origin_device.as_str(), "alpha");
        let loser = resolution.loser.unwrap();
        assert_eq!(loser.origin_device.as_str(), "beta");
        assert!(loser.superseded);

        let log = resolver.log(&device).await;
        assert_eq!(log.version, 2);
        assert_eq!(log.changes.len(), 2);
        assert!(log.changes[0].superseded);
        assert!(!log.changes[1].superseded);
        assert_eq!(
            resolver.latest(&device, "theme").await.unwrap().new_value,
            json!("dark")
        );
    }

    #[tokio::test]
    async fn test_reconcile_losing_remote_is_logged() {
        let resolver = ConflictResolver::new();
        let device = DeviceKey::new("alice", "phone");

        resolver.record(&device, change("phone", 20, "dark")).await.unwrap();
        let remote = change("tablet", 15, "light");
        let resolution = resolver.reconcile(&device, remote.clone()).await.unwrap();

        assert!(!resolution.remote_won(&remote));
        let log = resolver.log(&device).await;
        assert_eq!(log.changes.len(), 2);
        assert!(log.changes[1].superseded);
        assert_eq!(log.changes[1].origin_device.as_str(), "tablet");
    }

    #[tokio::test]
    async fn test_out_of_order_record_keeps_newest() {
        let resolver = ConflictResolver::new();
        let device = DeviceKey::new("alice", "phone");

        resolver.record(&device, change("phone", 20, "dark")).await.unwrap();
        let stale = resolver
            .record(&device, change("phone", 10, "light"))
            .await
            .unwrap();
        assert_eq!(stale.winner.new_value, json!("dark"));

        let latest = resolver.latest(&device, "theme").await.unwrap();
        assert_eq!(latest.synced_at, at(20));
        let log = resolver.log(&device).await;
        assert!(!log.changes[0].superseded);
        assert!(log.changes[1].superseded);

        let remote = change("tablet", 15, "light");
        let resolution = resolver.reconcile(&device, remote.clone()).await.unwrap();
        assert!(!resolution.remote_won(&remote));
        assert_eq!(
            resolver.latest(&device, "theme").await.unwrap().new_value,
            json!("dark")
        );
    }

    #[tokio::test]
    async fn test_reconcile_without_local_change() {
        let resolver = ConflictResolver::new();
        let device = DeviceKey::new("alice", "phone");
        let remote = change("tablet", 15, "light");

        let resolution = resolver.reconcile(&device, remote.clone()).await.unwrap();
        assert!(resolution.remote_won(&remote));
        assert!(resolution.loser.is_none());
        assert_eq!(resolution.winner.version, 1);

        // Replaying the same change does not grow the log
        resolver.reconcile(&device, remote).await.unwrap();
        assert_eq!(resolver.log(&device).await.changes.len(), 1);
    }
}
