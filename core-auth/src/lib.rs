//! # Authentication Module
//!
//! Per-device sync token lifecycle for the device sync coordinator.
//!
//! ## Overview
//!
//! Each registered device holds an opaque sync token and a refresh token.
//! This crate issues, validates, refreshes and revokes those pairs, persisting
//! them through the host `SecureStore` and reporting changes on the event bus.
//!
//! ## Features
//!
//! - Cryptographically random token values
//! - Proactive refresh when the remaining TTL drops below a configured ratio
//! - Per-device serialization of concurrent refreshes
//! - Digest-indexed lookup so presented tokens resolve to their device
//! - Auth event emission

pub mod error;
pub mod manager;
pub mod token_store;
pub mod types;

pub use error::{AuthError, Result};
pub use manager::TokenManager;
pub use token_store::{token_digest, TokenStore};
pub use types::{SyncToken, TokenMetadata, TokenValidation};
