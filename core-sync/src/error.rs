use core_auth::AuthError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Sync token expired for device {0}; the device must re-register")]
    TokenExpired(String),

    #[error("Sync token invalid: {0}")]
    TokenInvalid(String),

    #[error("Retries exhausted for {category} item {item_ref} after {attempts} attempts")]
    RetryExhausted {
        category: String,
        item_ref: String,
        attempts: u32,
    },

    #[error("Settings conflict on '{key}' cannot be resolved: {reason}")]
    ConflictUnresolvable { key: String, reason: String },

    #[error("{operation} timed out after {secs} seconds")]
    Timeout { operation: String, secs: u64 },

    #[error("Sync already in progress for device {device}")]
    SessionInProgress { device: String },

    #[error("Device {device} is inactive")]
    DeviceInactive { device: String },

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Invalid session state: {0}")]
    InvalidStatus(String),

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Bridge error: {0}")]
    Bridge(#[from] bridge_traits::BridgeError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl SyncError {
    /// Stable machine-readable code recorded in the device error log.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::NotFound { .. } => "NOT_FOUND",
            SyncError::TokenExpired(_) => "TOKEN_EXPIRED",
            SyncError::TokenInvalid(_) => "TOKEN_INVALID",
            SyncError::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            SyncError::ConflictUnresolvable { .. } => "CONFLICT_UNRESOLVABLE",
            SyncError::Timeout { .. } => "TIMEOUT",
            SyncError::SessionInProgress { .. } => "SESSION_IN_PROGRESS",
            SyncError::DeviceInactive { .. } => "DEVICE_INACTIVE",
            SyncError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            SyncError::InvalidStatus(_) => "INVALID_STATUS",
            SyncError::Cancelled => "CANCELLED",
            SyncError::Auth(_) => "AUTH_ERROR",
            SyncError::Bridge(_) => "BRIDGE_ERROR",
            SyncError::Serialization(_) => "SERIALIZATION_ERROR",
            SyncError::Database(_) => "DATABASE_ERROR",
        }
    }

    /// Whether the failure may succeed on a later attempt.
    ///
    /// `NotFound` and `ConflictUnresolvable` surface immediately.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SyncError::NotFound { .. }
                | SyncError::ConflictUnresolvable { .. }
                | SyncError::TokenExpired(_)
                | SyncError::DeviceInactive { .. }
                | SyncError::InvalidStateTransition { .. }
        )
    }
}

impl From<AuthError> for SyncError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::TokenExpired(device) => SyncError::TokenExpired(device),
            AuthError::TokenInvalid(reason) => SyncError::TokenInvalid(reason),
            AuthError::OperationTimeout { operation } => SyncError::Timeout {
                operation,
                secs: 0,
            },
            other => SyncError::Auth(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_errors_keep_token_semantics() {
        let expired: SyncError = AuthError::TokenExpired("alice/phone".to_string()).into();
        assert!(matches!(expired, SyncError::TokenExpired(_)));
        assert_eq!(expired.code(), "TOKEN_EXPIRED");
        assert!(!expired.is_retryable());

        let invalid: SyncError = AuthError::TokenInvalid("rotated".to_string()).into();
        assert!(matches!(invalid, SyncError::TokenInvalid(_)));

        let storage: SyncError =
            AuthError::SecureStorageUnavailable("locked".to_string()).into();
        assert!(matches!(storage, SyncError::Auth(_)));
        assert!(storage.is_retryable());
    }

    #[test]
    fn test_non_retryable_errors() {
        let not_found = SyncError::NotFound {
            entity: "device",
            id: "alice/ghost".to_string(),
        };
        assert!(!not_found.is_retryable());
        assert_eq!(not_found.to_string(), "device not found: alice/ghost");

        let conflict = SyncError::ConflictUnresolvable {
            key: "theme".to_string(),
            reason: "same origin".to_string(),
        };
        assert!(!conflict.is_retryable());

        let timeout = SyncError::Timeout {
            operation: "send".to_string(),
            secs: 30,
        };
        assert!(timeout.is_retryable());
    }
}
