//! macOS desktop host: one fixed device, apps launched as local processes.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use hub_core::prelude::*;
use hub_core::{AppParameter, DeviceInfo, LifecycleState, Platform};

use crate::driver::{launch_arguments, DiscoveredDevice};
use crate::process::LaunchedProcess;

pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Stable id of the host device
pub const HOST_DEVICE_ID: &str = "54decb62-3993-4031-9c6a-18ce048cc63c";

#[derive(Debug, Clone, Copy, Default)]
pub struct MacOsDriver;

impl MacOsDriver {
    /// The fixed host device, always booted
    pub fn discover(host_ip: IpAddr) -> Vec<DiscoveredDevice> {
        vec![DiscoveredDevice {
            info: DeviceInfo {
                id: HOST_DEVICE_ID.to_string(),
                name: "MacOS".to_string(),
                os_name: "MacOSX".to_string(),
                os_version: host_os_version(),
                ip_address: host_ip,
                platform: Platform::MacOs,
            },
            lifecycle: LifecycleState::Booted,
        }]
    }

    /// An app is "installed" when its artifact exists on disk
    pub fn is_app_installed(&self, app: &AppParameter) -> bool {
        app.app_path.exists()
    }

    pub fn launch(
        &self,
        device: &DeviceInfo,
        app: &AppParameter,
        session_id: &str,
        host_ip: IpAddr,
    ) -> Result<LaunchedProcess> {
        if !app.app_path.exists() {
            return Err(Error::installation(
                &device.id,
                "start app",
                format!("{} does not exist", app.app_path.display()),
            ));
        }

        let label = format!("macos:{}", app.identifier);
        let session_args = launch_arguments(session_id, host_ip);

        if is_app_bundle(&app.app_path) {
            let mut args = vec![
                "-W".to_string(),
                "-n".to_string(),
                app.app_path.display().to_string(),
                "--args".to_string(),
            ];
            args.extend(session_args);
            LaunchedProcess::spawn("open", &args, label)
        } else {
            LaunchedProcess::spawn(&app.app_path, &session_args, label)
        }
    }
}

fn is_app_bundle(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "app")
}

fn host_os_version() -> String {
    // `sw_vers` is only present on macOS; the version is informational
    std::process::Command::new("sw_vers")
        .arg("-productVersion")
        .output()
        .ok()
        .filter(|out| out.status.success())
        .map(|out| String::from_utf8_lossy(&out.stdout).trim().replace('.', "-"))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_returns_fixed_booted_device() {
        let devices = MacOsDriver::discover("127.0.0.1".parse().unwrap());
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].info.id, HOST_DEVICE_ID);
        assert_eq!(devices[0].info.os_name, "MacOSX");
        assert_eq!(devices[0].lifecycle, LifecycleState::Booted);
    }

    #[test]
    fn test_is_app_bundle() {
        assert!(is_app_bundle(Path::new("/Applications/Game.app")));
        assert!(!is_app_bundle(Path::new("/usr/local/bin/game")));
    }

    #[test]
    fn test_installed_means_artifact_exists() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("game");
        std::fs::write(&present, "").unwrap();

        assert!(MacOsDriver.is_app_installed(&AppParameter::new("com.example.game", &present)));
        assert!(!MacOsDriver.is_app_installed(&AppParameter::new(
            "com.example.game",
            dir.path().join("missing")
        )));
    }
}
