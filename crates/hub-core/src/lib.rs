//! # hub-core - Core Domain Types
//!
//! Foundation crate for the automation hub. Provides the error taxonomy,
//! device/app domain types, and logging setup.
//!
//! This crate has **zero internal dependencies** -- it only depends on external
//! crates (serde, thiserror, tracing).
//!
//! ## Public API
//!
//! ### Domain Types (`types`)
//! - [`LifecycleState`] - Device power state (Unknown, Shutdown, Booted)
//! - [`ConnectionState`] - Whether the app under test reported in
//! - [`DeviceState`] - Both states, with the `Connected => Booted` invariant
//! - [`DeviceInfo`] - Immutable device metadata
//! - [`AppParameter`] - Application under test
//! - [`Platform`] - Platform family (iOS simulator, Android, macOS)
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Error enum with `fatal` vs `recoverable` classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`ResultExt`] - Extension trait for adding error context
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use hub_core::prelude::*;
//! ```

pub mod error;
pub mod logging;
pub mod types;

/// Prelude for common imports used throughout all hub crates
pub mod prelude {
    pub use super::error::{Error, Result, ResultExt};
    pub use tracing::{debug, error, info, instrument, trace, warn};
}

pub use error::{Error, Result, ResultExt};
pub use types::{
    AppParameter, ConnectionState, DeviceInfo, DeviceState, LifecycleState, Platform,
};
