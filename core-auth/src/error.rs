use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    /// The refresh token has expired; the device must re-register.
    #[error("Sync token expired for device {0}")]
    TokenExpired(String),

    /// The token matches no active device or was already rotated.
    #[error("Sync token invalid: {0}")]
    TokenInvalid(String),

    #[error("Stored token for device {device} is corrupted: {reason}")]
    TokenCorrupted { device: String, reason: String },

    #[error("Secure storage unavailable: {0}")]
    SecureStorageUnavailable(String),

    #[error("Token serialization failed: {0}")]
    Serialization(String),

    #[error("Operation timed out: {operation}")]
    OperationTimeout { operation: String },
}

pub type Result<T> = std::result::Result<T, AuthError>;
