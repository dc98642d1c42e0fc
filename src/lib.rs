//! Workspace placeholder crate.
//!
//! This crate re-exports the member crates behind the `coordinator` feature so
//! host applications can depend on `devsync-workspace` alone instead of wiring
//! `core-sync`, `core-auth`, `core-runtime` and `bridge-traits` individually.

#[cfg(feature = "coordinator")]
pub use bridge_traits;
#[cfg(feature = "coordinator")]
pub use core_auth;
#[cfg(feature = "coordinator")]
pub use core_runtime;
#[cfg(feature = "coordinator")]
pub use core_sync;
