//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the device sync coordinator:
//! - Logging and tracing infrastructure
//! - Configuration management (bridges, sync and token policies)
//! - Event bus system
//!
//! ## Overview
//!
//! This crate contains the runtime utilities the auth and sync crates depend
//! on. It establishes the logging conventions, the validated configuration
//! surface and the event broadcasting used throughout the workspace.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use config::{CoreConfig, CoreConfigBuilder, RetryThresholds, SyncPolicy, TokenPolicy};
pub use error::{Error, Result};
pub use events::{CoreEvent, EventBus};
