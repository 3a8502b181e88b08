//! iOS simulators driven through `xcrun simctl`

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use hub_core::prelude::*;
use hub_core::{AppParameter, DeviceInfo, LifecycleState, Platform};

use crate::command;
use crate::driver::{launch_arguments, recording_file, DiscoveredDevice, Recording};
use crate::process::LaunchedProcess;

pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Time a `recordVideo` process gets to finalize its file after SIGINT
const RECORDING_GRACE: Duration = Duration::from_secs(10);

/// Matches runtime identifiers like
/// `com.apple.CoreSimulator.SimRuntime.iOS-17-2`
static RUNTIME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"com\.apple\.CoreSimulator\.SimRuntime\.([a-zA-Z]+OS)-([0-9]+-[0-9]+)")
        .expect("runtime regex is valid")
});

/// `simctl list devices --json` output
#[derive(Debug, Deserialize)]
struct SimctlList {
    devices: HashMap<String, Vec<SimctlDevice>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimctlDevice {
    udid: String,
    name: String,
    state: String,
    #[serde(default = "default_available")]
    is_available: bool,
}

fn default_available() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IosSimulatorDriver;

impl IosSimulatorDriver {
    /// Enumerate simulators via `xcrun simctl list devices --json`
    pub async fn discover(host_ip: IpAddr) -> Result<Vec<DiscoveredDevice>> {
        let output =
            command::run_checked("xcrun", &["simctl", "list", "devices", "--json"]).await?;
        parse_simctl_list(&output.stdout, host_ip)
    }

    pub async fn is_app_installed(&self, device: &DeviceInfo, app: &AppParameter) -> bool {
        match command::run(
            "xcrun",
            &["simctl", "get_app_container", &device.id, &app.identifier],
        )
        .await
        {
            Ok(output) => output.success,
            Err(e) => {
                debug!("get_app_container failed on {}: {}", device.id, e);
                false
            }
        }
    }

    /// `simctl install` replaces an existing installation
    pub async fn install_app(&self, device: &DeviceInfo, app: &AppParameter) -> Result<()> {
        let path = app.app_path.display().to_string();
        command::run_checked("xcrun", &["simctl", "install", &device.id, &path])
            .await
            .map_err(|e| Error::installation(&device.id, "install", e.to_string()))?;
        Ok(())
    }

    pub async fn uninstall_app(&self, device: &DeviceInfo, app_id: &str) -> Result<()> {
        command::run_checked("xcrun", &["simctl", "uninstall", &device.id, app_id])
            .await
            .map_err(|e| Error::installation(&device.id, "uninstall", e.to_string()))?;
        Ok(())
    }

    /// Launch attached to the console so the process lives as long as the app
    pub fn launch(
        &self,
        device: &DeviceInfo,
        app: &AppParameter,
        session_id: &str,
        host_ip: IpAddr,
    ) -> Result<LaunchedProcess> {
        let mut args = vec![
            "simctl".to_string(),
            "launch".to_string(),
            "--console-pty".to_string(),
            device.id.clone(),
            app.identifier.clone(),
        ];
        args.extend(launch_arguments(session_id, host_ip));
        LaunchedProcess::spawn("xcrun", &args, format!("simctl:{}", device.id))
    }

    pub async fn stop_app(&self, device: &DeviceInfo, app: &AppParameter) -> Result<()> {
        let output =
            command::run("xcrun", &["simctl", "terminate", &device.id, &app.identifier]).await?;
        if output.success || output.stderr.contains("found nothing to terminate") {
            return Ok(());
        }
        Err(Error::process(format!(
            "simctl terminate {} on {} failed: {}",
            app.identifier,
            device.id,
            output.stderr.trim()
        )))
    }

    pub fn start_recording(&self, device: &DeviceInfo, path: &Path) -> Result<Recording> {
        let output = recording_file(path);
        let file = output.display().to_string();
        let process = LaunchedProcess::spawn(
            "xcrun",
            &["simctl", "io", &device.id, "recordVideo", &file],
            format!("recordVideo:{}", device.id),
        )?;
        Ok(Recording {
            process: Some(process),
            output,
        })
    }

    pub async fn stop_recording(&self, _device: &DeviceInfo, mut recording: Recording) -> Result<()> {
        if let Some(process) = recording.process.as_mut() {
            process.terminate(RECORDING_GRACE).await?;
        }
        info!("Recording saved to {}", recording.output.display());
        Ok(())
    }

    /// Boot a simulator. Booting an already booted one succeeds.
    pub async fn boot(device_id: &str) -> Result<()> {
        let output = command::run("xcrun", &["simctl", "boot", device_id]).await?;
        if output.success || output.stderr.contains("current state: Booted") {
            Ok(())
        } else {
            Err(Error::process(format!(
                "simctl boot {} failed: {}",
                device_id,
                output.stderr.trim()
            )))
        }
    }

    pub async fn shutdown(device_id: &str) -> Result<()> {
        let output = command::run("xcrun", &["simctl", "shutdown", device_id]).await?;
        if output.success || output.stderr.contains("current state: Shutdown") {
            Ok(())
        } else {
            Err(Error::process(format!(
                "simctl shutdown {} failed: {}",
                device_id,
                output.stderr.trim()
            )))
        }
    }

    /// Bring up the Simulator application
    pub async fn start_service() -> Result<()> {
        command::run_checked("open", &["-a", "Simulator"]).await?;
        Ok(())
    }

    pub async fn stop_service() -> Result<()> {
        command::run("killall", &["Simulator"]).await?;
        Ok(())
    }
}

fn parse_simctl_list(json: &str, host_ip: IpAddr) -> Result<Vec<DiscoveredDevice>> {
    let list: SimctlList = serde_json::from_str(json)
        .map_err(|e| Error::discovery(format!("unparsable simctl output: {e}")))?;

    let mut devices = Vec::new();
    for (runtime, sims) in list.devices {
        let Some(caps) = RUNTIME_REGEX.captures(&runtime) else {
            debug!("Skipping unrecognized simulator runtime {}", runtime);
            continue;
        };

        let os_name = match &caps[1] {
            "iOS" => "iphonesimulator".to_string(),
            other => other.to_string(),
        };
        let os_version = caps[2].to_string();

        for sim in sims.into_iter().filter(|s| s.is_available) {
            devices.push(DiscoveredDevice {
                info: DeviceInfo {
                    id: sim.udid,
                    name: sim.name,
                    os_name: os_name.clone(),
                    os_version: os_version.clone(),
                    ip_address: host_ip,
                    platform: Platform::IosSimulator,
                },
                lifecycle: LifecycleState::from_tool_state(&sim.state),
            });
        }
    }

    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMCTL_JSON: &str = r#"{
        "devices": {
            "com.apple.CoreSimulator.SimRuntime.iOS-17-2": [
                {"udid": "AAAA-1111", "name": "iPhone 15", "state": "Booted", "isAvailable": true},
                {"udid": "BBBB-2222", "name": "iPad Air", "state": "Shutdown", "isAvailable": true},
                {"udid": "CCCC-3333", "name": "iPhone X", "state": "Shutdown", "isAvailable": false}
            ],
            "com.apple.CoreSimulator.SimRuntime.tvOS-17-0": [
                {"udid": "DDDD-4444", "name": "Apple TV", "state": "Creating"}
            ],
            "com.apple.CoreSimulator.SimRuntime.xrOS-1-0-beta": []
        }
    }"#;

    fn parse() -> Vec<DiscoveredDevice> {
        let mut devices = parse_simctl_list(SIMCTL_JSON, "192.168.1.5".parse().unwrap()).unwrap();
        devices.sort_by(|a, b| a.info.id.cmp(&b.info.id));
        devices
    }

    #[test]
    fn test_parses_available_simulators() {
        let devices = parse();
        let ids: Vec<_> = devices.iter().map(|d| d.info.id.as_str()).collect();
        assert_eq!(ids, vec!["AAAA-1111", "BBBB-2222", "DDDD-4444"]);
    }

    #[test]
    fn test_runtime_maps_os_name_and_version() {
        let devices = parse();
        assert_eq!(devices[0].info.os_name, "iphonesimulator");
        assert_eq!(devices[0].info.os_version, "17-2");
        assert_eq!(devices[2].info.os_name, "tvOS");
        assert_eq!(devices[2].info.os_version, "17-0");
    }

    #[test]
    fn test_state_mapping() {
        let devices = parse();
        assert_eq!(devices[0].lifecycle, LifecycleState::Booted);
        assert_eq!(devices[1].lifecycle, LifecycleState::Shutdown);
        assert_eq!(devices[2].lifecycle, LifecycleState::Unknown);
    }

    #[test]
    fn test_simulators_use_host_ip() {
        let devices = parse();
        assert!(devices
            .iter()
            .all(|d| d.info.ip_address.to_string() == "192.168.1.5"));
    }

    #[test]
    fn test_invalid_json_is_discovery_error() {
        let err = parse_simctl_list("xcrun: error", "127.0.0.1".parse().unwrap()).unwrap_err();
        assert!(matches!(err, Error::Discovery { .. }));
    }
}
