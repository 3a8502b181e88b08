//! Test utilities for device types
//!
//! Provides helpers for building test devices and a scripted stand-in for
//! an app under test.

use std::net::IpAddr;
use std::path::Path;

use tempfile::TempDir;

use hub_core::{AppParameter, DeviceInfo, LifecycleState, Platform};

use crate::device::Device;
use crate::driver::Driver;
use crate::drivers::MacOsDriver;

/// Identifier used by [`script_app`]
pub const TEST_APP_ID: &str = "com.example.under-test";

/// Loopback, for devices that report back to this host
pub fn localhost() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

/// Creates device metadata with basic defaults.
///
/// # Arguments
/// * `id` - Device identifier
/// * `platform` - Platform family
pub fn test_device_info(id: &str, platform: Platform) -> DeviceInfo {
    DeviceInfo {
        id: id.to_string(),
        name: format!("Test {id}"),
        os_name: "test".to_string(),
        os_version: "1-0".to_string(),
        ip_address: localhost(),
        platform,
    }
}

/// Creates a booted desktop device whose apps run as local processes.
pub fn test_device(id: &str) -> Device {
    Device::new(
        test_device_info(id, Platform::MacOs),
        LifecycleState::Booted,
        Driver::MacOs(MacOsDriver),
    )
}

/// Writes an executable shell script standing in for an app under test.
///
/// The script ignores its arguments and runs `body`. The returned
/// [`TempDir`] must outlive the app.
#[cfg(unix)]
pub fn script_app(body: &str) -> (TempDir, AppParameter) {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("app-under-test");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write app script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("make app script executable");

    let app = AppParameter::new(TEST_APP_ID, &path);
    (dir, app)
}

/// A long-running scripted app that exits on SIGINT
#[cfg(unix)]
pub fn sleeping_app() -> (TempDir, AppParameter) {
    script_app("exec sleep 30")
}

/// An app parameter pointing at a path that does not exist
pub fn missing_app(dir: &Path) -> AppParameter {
    AppParameter::new(TEST_APP_ID, dir.join("does-not-exist"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_basic() {
        let device = test_device("test-id");
        assert_eq!(device.id(), "test-id");
        assert_eq!(device.name(), "Test test-id");
        assert_eq!(device.platform(), Platform::MacOs);
        assert!(device.state().is_booted());
    }

    #[cfg(unix)]
    #[test]
    fn test_script_app_is_executable() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, app) = sleeping_app();
        let mode = std::fs::metadata(&app.app_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
        assert_eq!(app.identifier, TEST_APP_ID);
    }
}
