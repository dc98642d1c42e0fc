//! # Core Configuration Module
//!
//! Provides configuration management for the device sync coordinator.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `CoreConfig`
//! instance holding every host bridge and policy the coordinator needs. It
//! enforces fail-fast validation so a missing bridge or an inconsistent policy
//! is reported at startup instead of during the first sync session.
//!
//! ## Required Dependencies
//!
//! - `DomainStore` - Fetches local items and applies remote changes
//! - `Transport` - Delivers payloads to devices
//! - `SecureStore` - Persists per-device sync tokens
//!
//! ## Optional Dependencies
//!
//! - `NotificationDispatcher` - Session outcome notifications (disabled when absent)
//! - `Clock` - Time source (defaults to `SystemClock`)
//! - `LoggerSink` - Host log forwarding, picked up by [`CoreConfig::logging_config`]
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{CoreConfig, SyncPolicy};
//! use std::sync::Arc;
//!
//! let config = CoreConfig::builder()
//!     .domain_store(Arc::new(MyDomainStore))
//!     .transport(Arc::new(MyTransport))
//!     .secure_store(Arc::new(MySecureStore))
//!     .sync_policy(SyncPolicy {
//!         media_concurrency: 4,
//!         ..SyncPolicy::default()
//!     })
//!     .build()?;
//! ```
//!
//! Policies are plain `serde` structs so hosts can load them from any
//! configuration file format:
//!
//! ```
//! use core_runtime::config::SyncPolicy;
//!
//! let policy: SyncPolicy = serde_json::from_str(r#"{ "base_delay_secs": 10 }"#).unwrap();
//! assert_eq!(policy.base_delay_secs, 10);
//! assert_eq!(policy.max_delay_secs, 3600);
//! ```

use crate::error::{Error, Result};
use crate::logging::LoggingConfig;
use bridge_traits::{
    Clock, DomainStore, LoggerSink, NotificationDispatcher, SecureStore, SyncCategory,
    SystemClock, Transport,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Core configuration for the device sync coordinator.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Owner of local domain data (required)
    pub domain_store: Arc<dyn DomainStore>,

    /// Point-to-point channel to devices (required)
    pub transport: Arc<dyn Transport>,

    /// Secure credential storage for sync tokens (required)
    pub secure_store: Arc<dyn SecureStore>,

    /// Notification pipeline (optional)
    pub notifier: Option<Arc<dyn NotificationDispatcher>>,

    /// Time source
    pub clock: Arc<dyn Clock>,

    /// Host log forwarding (optional)
    pub logger_sink: Option<Arc<dyn LoggerSink>>,

    /// Scheduling, retry and timeout policy
    pub sync_policy: SyncPolicy,

    /// Token lifetimes
    pub token_policy: TokenPolicy,

    /// Event bus buffer size
    pub event_buffer_size: usize,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("domain_store", &"DomainStore { ... }")
            .field("transport", &"Transport { ... }")
            .field("secure_store", &"SecureStore { ... }")
            .field(
                "notifier",
                &self
                    .notifier
                    .as_ref()
                    .map(|_| "NotificationDispatcher { ... }"),
            )
            .field(
                "logger_sink",
                &self.logger_sink.as_ref().map(|_| "LoggerSink { ... }"),
            )
            .field("sync_policy", &self.sync_policy)
            .field("token_policy", &self.token_policy)
            .field("event_buffer_size", &self.event_buffer_size)
            .finish()
    }
}

/// Per-category retry thresholds.
///
/// An item whose retry count reaches its category's threshold becomes
/// terminally failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryThresholds {
    pub settings: u32,
    pub messages: u32,
    pub contacts: u32,
    pub media: u32,
}

impl Default for RetryThresholds {
    fn default() -> Self {
        Self {
            settings: 3,
            messages: 3,
            contacts: 3,
            media: 5,
        }
    }
}

impl RetryThresholds {
    pub fn for_category(&self, category: SyncCategory) -> u32 {
        match category {
            SyncCategory::Settings => self.settings,
            SyncCategory::Messages => self.messages,
            SyncCategory::Contacts => self.contacts,
            SyncCategory::Media => self.media,
        }
    }
}

/// Scheduling, retry and timeout policy for sync sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPolicy {
    /// Interval between scheduled sessions for devices without their own
    pub default_sync_interval_secs: u64,

    /// Backoff base: a failed session waits `base * 2^failures`
    pub base_delay_secs: u64,

    /// Backoff ceiling
    pub max_delay_secs: u64,

    /// Sessions running longer than this are cancelled
    pub max_session_duration_secs: u64,

    /// Timeout applied to each refresh, fetch, send and receive
    pub operation_timeout_secs: u64,

    /// Concurrent media transfers per device
    pub media_concurrency: usize,

    pub retry_thresholds: RetryThresholds,

    /// Failing-sync notifications go out once consecutive failures exceed this
    pub notify_failure_threshold: u32,

    /// Number of recent sessions used for the success rate
    pub metrics_window: usize,

    /// Maximum inbound payloads applied per session
    pub inbound_batch_limit: usize,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            default_sync_interval_secs: 300,
            base_delay_secs: 30,
            max_delay_secs: 3600,
            max_session_duration_secs: 600,
            operation_timeout_secs: 30,
            media_concurrency: 3,
            retry_thresholds: RetryThresholds::default(),
            notify_failure_threshold: 3,
            metrics_window: 20,
            inbound_batch_limit: 100,
        }
    }
}

impl SyncPolicy {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn max_session_duration(&self) -> Duration {
        Duration::from_secs(self.max_session_duration_secs)
    }

    /// Validates the policy.
    pub fn validate(&self) -> Result<()> {
        if self.default_sync_interval_secs == 0 {
            return Err(Error::Config(
                "Default sync interval must be greater than 0 seconds".to_string(),
            ));
        }

        if self.base_delay_secs == 0 {
            return Err(Error::Config(
                "Backoff base delay must be greater than 0 seconds".to_string(),
            ));
        }

        if self.max_delay_secs < self.base_delay_secs {
            return Err(Error::Config(format!(
                "Backoff max delay ({}s) must not be smaller than the base delay ({}s)",
                self.max_delay_secs, self.base_delay_secs
            )));
        }

        if self.operation_timeout_secs == 0 {
            return Err(Error::Config(
                "Operation timeout must be greater than 0 seconds".to_string(),
            ));
        }

        if self.max_session_duration_secs < self.operation_timeout_secs {
            return Err(Error::Config(
                "Maximum session duration must cover at least one operation timeout".to_string(),
            ));
        }

        if self.media_concurrency == 0 {
            return Err(Error::Config(
                "Media concurrency must be at least 1".to_string(),
            ));
        }

        for category in SyncCategory::PRIORITY_ORDER {
            if self.retry_thresholds.for_category(category) == 0 {
                return Err(Error::Config(format!(
                    "Retry threshold for '{}' must be at least 1",
                    category
                )));
            }
        }

        if self.metrics_window == 0 {
            return Err(Error::Config(
                "Metrics window must hold at least one session".to_string(),
            ));
        }

        if self.inbound_batch_limit == 0 {
            return Err(Error::Config(
                "Inbound batch limit must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Lifetimes of issued sync tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenPolicy {
    /// Lifetime of a sync token
    pub ttl_secs: u64,

    /// Lifetime of a refresh token
    pub refresh_ttl_secs: u64,

    /// Fraction of the TTL below which `ensure_fresh` proactively refreshes
    pub refresh_threshold_ratio: f64,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            refresh_ttl_secs: 30 * 24 * 3600,
            refresh_threshold_ratio: 0.1,
        }
    }
}

impl TokenPolicy {
    /// Validates the policy.
    pub fn validate(&self) -> Result<()> {
        if self.ttl_secs == 0 {
            return Err(Error::Config(
                "Token TTL must be greater than 0 seconds".to_string(),
            ));
        }

        if self.refresh_ttl_secs < self.ttl_secs {
            return Err(Error::Config(
                "Refresh token TTL must not be shorter than the token TTL".to_string(),
            ));
        }

        if !(self.refresh_threshold_ratio > 0.0 && self.refresh_threshold_ratio < 1.0) {
            return Err(Error::Config(format!(
                "Refresh threshold ratio must be within (0, 1), got {}",
                self.refresh_threshold_ratio
            )));
        }

        Ok(())
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates policies and buffer sizes.
    pub fn validate(&self) -> Result<()> {
        self.sync_policy.validate()?;
        self.token_policy.validate()?;

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Logging setup for [`init_logging`](crate::logging::init_logging) that
    /// forwards records to the configured host sink.
    pub fn logging_config(&self) -> LoggingConfig {
        match &self.logger_sink {
            Some(sink) => LoggingConfig::default().with_logger_sink(sink.clone()),
            None => LoggingConfig::default(),
        }
    }
}

fn missing(capability: &str, message: &str) -> Error {
    Error::CapabilityMissing {
        capability: capability.to_string(),
        message: message.to_string(),
    }
}

/// Builder for [`CoreConfig`].
#[derive(Default)]
pub struct CoreConfigBuilder {
    domain_store: Option<Arc<dyn DomainStore>>,
    transport: Option<Arc<dyn Transport>>,
    secure_store: Option<Arc<dyn SecureStore>>,
    notifier: Option<Arc<dyn NotificationDispatcher>>,
    clock: Option<Arc<dyn Clock>>,
    logger_sink: Option<Arc<dyn LoggerSink>>,
    sync_policy: Option<SyncPolicy>,
    token_policy: Option<TokenPolicy>,
    event_buffer_size: Option<usize>,
}

impl CoreConfigBuilder {
    pub fn domain_store(mut self, store: Arc<dyn DomainStore>) -> Self {
        self.domain_store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn secure_store(mut self, store: Arc<dyn SecureStore>) -> Self {
        self.secure_store = Some(store);
        self
    }

    /// Sets the notification dispatcher. Without one, no notifications are sent.
    pub fn notifier(mut self, notifier: Arc<dyn NotificationDispatcher>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Sets the time source.
    ///
    /// Default: [`SystemClock`]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn logger_sink(mut self, sink: Arc<dyn LoggerSink>) -> Self {
        self.logger_sink = Some(sink);
        self
    }

    pub fn sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = Some(policy);
        self
    }

    pub fn token_policy(mut self, policy: TokenPolicy) -> Self {
        self.token_policy = Some(policy);
        self
    }

    /// Sets the event bus buffer size.
    ///
    /// Default: [`DEFAULT_EVENT_BUFFER_SIZE`](crate::events::DEFAULT_EVENT_BUFFER_SIZE)
    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Builds the final `CoreConfig` instance.
    ///
    /// Returns an error with an actionable message when a required bridge is
    /// missing or a policy is inconsistent.
    pub fn build(self) -> Result<CoreConfig> {
        let domain_store = self.domain_store.ok_or_else(|| {
            missing(
                "DomainStore",
                "DomainStore implementation is required to fetch local items and apply \
                 remote changes. Use .domain_store() to inject it.",
            )
        })?;

        let transport = self.transport.ok_or_else(|| {
            missing(
                "Transport",
                "Transport implementation is required to deliver payloads to devices. \
                 Use .transport() to inject it.",
            )
        })?;

        let secure_store = self.secure_store.ok_or_else(|| {
            missing(
                "SecureStore",
                "SecureStore implementation is required for sync token persistence. \
                 Mobile: inject Keychain/Keystore storage. Server: inject an encrypted store.",
            )
        })?;

        let config = CoreConfig {
            domain_store,
            transport,
            secure_store,
            notifier: self.notifier,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            logger_sink: self.logger_sink,
            sync_policy: self.sync_policy.unwrap_or_default(),
            token_policy: self.token_policy.unwrap_or_default(),
            event_buffer_size: self
                .event_buffer_size
                .unwrap_or(crate::events::DEFAULT_EVENT_BUFFER_SIZE),
        };

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::{DeviceKey, SyncPayload, TransportAck};
    use bytes::Bytes;

    struct NoopDomainStore;

    #[async_trait]
    impl DomainStore for NoopDomainStore {
        async fn fetch_item(&self, _category: SyncCategory, _item_ref: &str) -> BridgeResult<Bytes> {
            Ok(Bytes::new())
        }

        async fn apply_remote_change(
            &self,
            _category: SyncCategory,
            _item_ref: &str,
            _payload: Bytes,
        ) -> BridgeResult<()> {
            Ok(())
        }
    }

    struct NoopTransport;

    #[async_trait]
    impl Transport for NoopTransport {
        async fn send(&self, _device: &DeviceKey, _payload: SyncPayload) -> BridgeResult<TransportAck> {
            Ok(TransportAck::default())
        }

        async fn receive(&self, _device: &DeviceKey) -> BridgeResult<Option<SyncPayload>> {
            Ok(None)
        }
    }

    struct NoopSecureStore;

    #[async_trait]
    impl SecureStore for NoopSecureStore {
        async fn set_secret(&self, _key: &str, _value: &[u8]) -> BridgeResult<()> {
            Ok(())
        }

        async fn get_secret(&self, _key: &str) -> BridgeResult<Option<Vec<u8>>> {
            Ok(None)
        }

        async fn delete_secret(&self, _key: &str) -> BridgeResult<()> {
            Ok(())
        }

        async fn list_keys(&self) -> BridgeResult<Vec<String>> {
            Ok(Vec::new())
        }

        async fn clear_all(&self) -> BridgeResult<()> {
            Ok(())
        }
    }

    fn complete_builder() -> CoreConfigBuilder {
        CoreConfig::builder()
            .domain_store(Arc::new(NoopDomainStore))
            .transport(Arc::new(NoopTransport))
            .secure_store(Arc::new(NoopSecureStore))
    }

    #[test]
    fn test_builder_with_all_required_fields() {
        let config = complete_builder().build().unwrap();

        assert_eq!(config.sync_policy, SyncPolicy::default());
        assert_eq!(config.token_policy, TokenPolicy::default());
        assert!(config.notifier.is_none());
        assert_eq!(
            config.event_buffer_size,
            crate::events::DEFAULT_EVENT_BUFFER_SIZE
        );
    }

    #[test]
    fn test_builder_requires_domain_store() {
        let err = CoreConfig::builder()
            .transport(Arc::new(NoopTransport))
            .secure_store(Arc::new(NoopSecureStore))
            .build()
            .unwrap_err();

        assert!(matches!(err, Error::CapabilityMissing { ref capability, .. } if capability == "DomainStore"));
    }

    #[test]
    fn test_builder_requires_transport() {
        let err = CoreConfig::builder()
            .domain_store(Arc::new(NoopDomainStore))
            .secure_store(Arc::new(NoopSecureStore))
            .build()
            .unwrap_err();

        assert!(err.to_string().contains("Transport"));
    }

    #[test]
    fn test_builder_requires_secure_store() {
        let err = CoreConfig::builder()
            .domain_store(Arc::new(NoopDomainStore))
            .transport(Arc::new(NoopTransport))
            .build()
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("SecureStore"));
        assert!(message.contains("sync token persistence"));
    }

    #[test]
    fn test_sync_policy_defaults() {
        let policy = SyncPolicy::default();
        assert_eq!(policy.base_delay_secs, 30);
        assert_eq!(policy.max_delay_secs, 3600);
        assert_eq!(policy.operation_timeout(), Duration::from_secs(30));
        assert_eq!(policy.media_concurrency, 3);
        assert_eq!(policy.retry_thresholds.for_category(SyncCategory::Media), 5);
        assert_eq!(
            policy.retry_thresholds.for_category(SyncCategory::Messages),
            3
        );
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let result = complete_builder()
            .sync_policy(SyncPolicy {
                base_delay_secs: 120,
                max_delay_secs: 60,
                ..SyncPolicy::default()
            })
            .build();

        assert!(result.unwrap_err().to_string().contains("max delay"));
    }

    #[test]
    fn test_validate_rejects_zero_media_concurrency() {
        let policy = SyncPolicy {
            media_concurrency: 0,
            ..SyncPolicy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_retry_threshold() {
        let policy = SyncPolicy {
            retry_thresholds: RetryThresholds {
                contacts: 0,
                ..RetryThresholds::default()
            },
            ..SyncPolicy::default()
        };
        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("contacts"));
    }

    #[test]
    fn test_token_policy_ratio_bounds() {
        let mut policy = TokenPolicy::default();
        assert!(policy.validate().is_ok());

        policy.refresh_threshold_ratio = 1.0;
        assert!(policy.validate().is_err());

        policy.refresh_threshold_ratio = 0.0;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_policy_deserializes_with_defaults() {
        let policy: SyncPolicy = serde_json::from_str(
            r#"{ "media_concurrency": 5, "retry_thresholds": { "media": 8 } }"#,
        )
        .unwrap();

        assert_eq!(policy.media_concurrency, 5);
        assert_eq!(policy.retry_thresholds.media, 8);
        assert_eq!(policy.retry_thresholds.settings, 3);
        assert_eq!(policy.default_sync_interval_secs, 300);
    }

    #[test]
    fn test_logging_config_forwards_to_sink() {
        let sink: Arc<dyn LoggerSink> = Arc::new(bridge_traits::ConsoleLogger::default());
        let config = complete_builder().logger_sink(sink.clone()).build().unwrap();

        let logging = config.logging_config();
        assert!(Arc::ptr_eq(logging.logger_sink.as_ref().unwrap(), &sink));
        assert!(logging.redact_pii);

        let without = complete_builder().build().unwrap().logging_config();
        assert!(without.logger_sink.is_none());
    }

    #[test]
    fn test_debug_hides_bridges() {
        let config = complete_builder().build().unwrap();
        let rendered = format!("{:?}", config);
        assert!(rendered.contains("Transport { ... }"));
        assert!(rendered.contains("sync_policy"));
    }
}
