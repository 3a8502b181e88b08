//! # hub-device - Devices, Drivers and Managers
//!
//! Owns everything that touches a device: platform tool invocation,
//! supervision of launched processes, the [`Device`] handle with its state
//! machine, and the per-platform [`DeviceManager`].
//!
//! Depends on [`hub_core`] for domain types and errors, and on [`hub_node`]
//! for devices hosted on a remote node.
//!
//! ## Public API
//!
//! ### Devices
//! - [`Device`] - One controllable device: state, app lifecycle, recording
//! - [`Driver`] - Platform dispatch chosen when the device is created
//!
//! ### Inventory
//! - [`DeviceManager`] - One platform's inventory and power control
//! - [`DeviceEvent`] - Inventory change notifications
//!
//! ### Platform Utilities
//! - [`LaunchedProcess`] - Supervised child process
//! - [`ToolAvailability`] - Check for `xcrun simctl` and `adb`

pub mod command;
pub mod device;
pub mod driver;
pub mod drivers;
pub mod manager;
pub mod process;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;
pub mod tool_availability;

pub use device::{Device, STOP_GRACE};
pub use driver::{DiscoveredDevice, Driver, Recording};
pub use drivers::{AndroidDriver, IosSimulatorDriver, MacOsDriver, RemoteDriver};
pub use manager::{DeviceEvent, DeviceManager, Discovery};
pub use process::LaunchedProcess;
pub use tool_availability::ToolAvailability;
