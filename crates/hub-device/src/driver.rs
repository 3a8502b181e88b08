//! Platform dispatch for device operations.
//!
//! A [`Driver`] is chosen when a manager creates a device and never changes.
//! All variants honor the same contract; callers go through
//! [`crate::Device`] and never see which one they hold.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hub_core::prelude::*;
use hub_core::{AppParameter, DeviceInfo, LifecycleState};

use crate::drivers::{
    android, ios_simulator, macos, AndroidDriver, IosSimulatorDriver, MacOsDriver, RemoteDriver,
};
use crate::process::LaunchedProcess;

/// A device as reported by one discovery pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub info: DeviceInfo,
    pub lifecycle: LifecycleState,
}

/// An in-progress screen recording
#[derive(Debug)]
pub struct Recording {
    /// Local capture process, if the platform uses one
    pub process: Option<LaunchedProcess>,
    pub output: PathBuf,
}

/// Arguments through which a launched app learns its session and where to
/// report back
pub fn launch_arguments(session_id: &str, host_ip: IpAddr) -> Vec<String> {
    vec![
        "SESSION_ID".to_string(),
        session_id.to_string(),
        "HOST".to_string(),
        host_ip.to_string(),
    ]
}

/// `<path>.mp4`, unless `path` already ends in `.mp4`
pub fn recording_file(path: &Path) -> PathBuf {
    if path.extension().is_some_and(|ext| ext == "mp4") {
        path.to_path_buf()
    } else {
        PathBuf::from(format!("{}.mp4", path.display()))
    }
}

#[derive(Debug, Clone)]
pub enum Driver {
    IosSimulator(IosSimulatorDriver),
    Android(AndroidDriver),
    MacOs(MacOsDriver),
    Remote(RemoteDriver),
}

impl Driver {
    pub fn is_remote(&self) -> bool {
        matches!(self, Driver::Remote(_))
    }

    /// Never fails; an unconfirmable installation reads as `false`
    pub async fn is_app_installed(&self, device: &DeviceInfo, app: &AppParameter) -> bool {
        match self {
            Driver::IosSimulator(d) => d.is_app_installed(device, app).await,
            Driver::Android(d) => d.is_app_installed(device, app).await,
            Driver::MacOs(d) => d.is_app_installed(app),
            Driver::Remote(d) => d.is_app_installed(device, app).await,
        }
    }

    pub async fn install_app(&self, device: &DeviceInfo, app: &AppParameter) -> Result<()> {
        match self {
            Driver::IosSimulator(d) => d.install_app(device, app).await,
            Driver::Android(d) => d.install_app(device, app).await,
            Driver::MacOs(_) => Ok(()),
            Driver::Remote(d) => d.install_app(device, app).await,
        }
    }

    pub async fn uninstall_app(&self, device: &DeviceInfo, app_id: &str) -> Result<()> {
        match self {
            Driver::IosSimulator(d) => d.uninstall_app(device, app_id).await,
            Driver::Android(d) => d.uninstall_app(device, app_id).await,
            Driver::MacOs(_) => Ok(()),
            Driver::Remote(d) => d.uninstall_app(device, app_id).await,
        }
    }

    /// Start the app. Returns the process handle when the launch itself
    /// stays alive for the session.
    pub async fn launch(
        &self,
        device: &DeviceInfo,
        app: &AppParameter,
        session_id: &str,
        host_ip: IpAddr,
    ) -> Result<Option<LaunchedProcess>> {
        match self {
            Driver::IosSimulator(d) => d.launch(device, app, session_id, host_ip).map(Some),
            Driver::Android(d) => d
                .launch(device, app, session_id, host_ip)
                .await
                .map(|_| None),
            Driver::MacOs(d) => d.launch(device, app, session_id, host_ip).map(Some),
            Driver::Remote(d) => d
                .launch(device, app, session_id, host_ip)
                .await
                .map(|_| None),
        }
    }

    /// Platform-side stop, run after the session's own process is gone
    pub async fn stop_app(&self, device: &DeviceInfo, app: &AppParameter) -> Result<()> {
        match self {
            Driver::IosSimulator(d) => d.stop_app(device, app).await,
            Driver::Android(d) => d.stop_app(device, app).await,
            Driver::MacOs(_) => Ok(()),
            Driver::Remote(d) => d.stop_app(device, app).await,
        }
    }

    pub async fn connection_timeout(&self, device: &DeviceInfo) -> Duration {
        match self {
            Driver::IosSimulator(_) => ios_simulator::CONNECTION_TIMEOUT,
            Driver::Android(_) => android::CONNECTION_TIMEOUT,
            Driver::MacOs(_) => macos::CONNECTION_TIMEOUT,
            Driver::Remote(d) => d.connection_timeout(device).await,
        }
    }

    /// `Ok(None)` where the platform cannot record
    pub async fn start_recording(
        &self,
        device: &DeviceInfo,
        path: &Path,
    ) -> Result<Option<Recording>> {
        match self {
            Driver::IosSimulator(d) => d.start_recording(device, path).map(Some),
            Driver::Android(d) => d.start_recording(device, path).map(Some),
            Driver::MacOs(_) => Ok(None),
            Driver::Remote(d) => d.start_recording(device, path).await.map(Some),
        }
    }

    pub async fn stop_recording(&self, device: &DeviceInfo, recording: Recording) -> Result<()> {
        match self {
            Driver::IosSimulator(d) => d.stop_recording(device, recording).await,
            Driver::Android(d) => d.stop_recording(device, recording).await,
            Driver::MacOs(_) => Ok(()),
            Driver::Remote(d) => d.stop_recording(device).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_arguments() {
        let args = launch_arguments("abc123", "10.0.0.7".parse().unwrap());
        assert_eq!(args, vec!["SESSION_ID", "abc123", "HOST", "10.0.0.7"]);
    }

    #[test]
    fn test_recording_file_appends_extension() {
        assert_eq!(
            recording_file(Path::new("runs/session-1")),
            PathBuf::from("runs/session-1.mp4")
        );
        assert_eq!(
            recording_file(Path::new("runs/session-1.mp4")),
            PathBuf::from("runs/session-1.mp4")
        );
    }

    #[tokio::test]
    async fn test_desktop_recording_is_a_no_op() {
        let driver = Driver::MacOs(MacOsDriver);
        let device = MacOsDriver::discover("127.0.0.1".parse().unwrap())
            .remove(0)
            .info;
        let recording = driver
            .start_recording(&device, Path::new("/tmp/ignored"))
            .await
            .unwrap();
        assert!(recording.is_none());
    }

    #[test]
    fn test_connection_timeouts_per_platform() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let device = MacOsDriver::discover("127.0.0.1".parse().unwrap())
            .remove(0)
            .info;

        let ios = rt.block_on(Driver::IosSimulator(IosSimulatorDriver).connection_timeout(&device));
        let android = rt.block_on(Driver::Android(AndroidDriver).connection_timeout(&device));
        let mac = rt.block_on(Driver::MacOs(MacOsDriver).connection_timeout(&device));

        assert_eq!(ios, Duration::from_secs(10));
        assert_eq!(android, Duration::from_secs(120));
        assert_eq!(mac, Duration::from_secs(10));
    }
}
