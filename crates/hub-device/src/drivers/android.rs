//! Android devices and emulators driven through `adb`

use std::net::IpAddr;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use hub_core::prelude::*;
use hub_core::{AppParameter, DeviceInfo, LifecycleState, Platform};

use crate::command;
use crate::driver::{recording_file, DiscoveredDevice, Recording};
use crate::process::LaunchedProcess;

pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(120);

/// On-device scratch file for `screenrecord`
const DEVICE_RECORDING_PATH: &str = "/data/local/tmp/automation_hub_record.mp4";

/// `screenrecord` needs a moment after SIGINT to finish the mp4 container
const RECORDING_GRACE: Duration = Duration::from_secs(5);

/// `<serial>   device <properties...>` from `adb devices -l`
static DEVICE_LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-zA-Z0-9.:\-_]+)\s+device(?:\s+(.*))?$").expect("Invalid device line regex")
});

static MODEL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"model:(\S+)").expect("Invalid model regex"));

/// `inet 192.168.1.23/24 brd 192.168.1.255 ...` from `ip -f inet addr show`
static INET_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"inet\s+([0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3})/[0-9]+")
        .expect("Invalid inet regex")
});

#[derive(Debug, Clone, Copy, Default)]
pub struct AndroidDriver;

impl AndroidDriver {
    /// Enumerate attached devices via `adb devices -l`
    pub async fn discover(host_ip: IpAddr) -> Result<Vec<DiscoveredDevice>> {
        let output = command::run_checked("adb", &["devices", "-l"]).await?;

        let mut devices = Vec::new();
        for (serial, name) in parse_device_list(&output.stdout) {
            let os_version = getprop(&serial, "ro.build.version.release")
                .await
                .unwrap_or_else(|| "unknown".to_string());
            let ip_address = lookup_device_ip(&serial).await.unwrap_or(host_ip);

            devices.push(DiscoveredDevice {
                info: DeviceInfo {
                    id: serial,
                    name,
                    os_name: "android".to_string(),
                    os_version,
                    ip_address,
                    platform: Platform::Android,
                },
                lifecycle: LifecycleState::Booted,
            });
        }

        Ok(devices)
    }

    pub async fn is_app_installed(&self, device: &DeviceInfo, app: &AppParameter) -> bool {
        match command::run(
            "adb",
            &["-s", &device.id, "shell", "pm", "list", "packages", &app.identifier],
        )
        .await
        {
            Ok(output) => package_listed(&output.stdout, &app.identifier),
            Err(e) => {
                debug!("pm list packages failed on {}: {}", device.id, e);
                false
            }
        }
    }

    /// `install -r` reinstalls in place, so repeating it is harmless
    pub async fn install_app(&self, device: &DeviceInfo, app: &AppParameter) -> Result<()> {
        let path = app.app_path.display().to_string();
        let output = command::run("adb", &["-s", &device.id, "install", "-r", "-g", &path])
            .await
            .map_err(|e| Error::installation(&device.id, "install", e.to_string()))?;

        if let Some(failure) = failure_line(&output.stdout).or_else(|| failure_line(&output.stderr)) {
            return Err(Error::installation(&device.id, "install", failure));
        }
        if !output.success {
            return Err(Error::installation(
                &device.id,
                "install",
                output.stderr.trim().to_string(),
            ));
        }
        Ok(())
    }

    pub async fn uninstall_app(&self, device: &DeviceInfo, app_id: &str) -> Result<()> {
        let output = command::run("adb", &["-s", &device.id, "uninstall", app_id])
            .await
            .map_err(|e| Error::installation(&device.id, "uninstall", e.to_string()))?;

        if let Some(failure) = failure_line(&output.stdout).or_else(|| failure_line(&output.stderr)) {
            if package_was_absent(&failure) {
                debug!("{} was not installed on {}", app_id, device.id);
                return Ok(());
            }
            return Err(Error::installation(&device.id, "uninstall", failure));
        }
        if !output.success {
            return Err(Error::installation(
                &device.id,
                "uninstall",
                output.stderr.trim().to_string(),
            ));
        }
        Ok(())
    }

    /// `am start -W` returns once the activity is up; no handle is kept
    pub async fn launch(
        &self,
        device: &DeviceInfo,
        app: &AppParameter,
        session_id: &str,
        host_ip: IpAddr,
    ) -> Result<()> {
        let activity = app.launch_activity.as_deref().ok_or_else(|| {
            Error::config(format!(
                "{} has no launch activity configured",
                app.identifier
            ))
        })?;
        let component = format!("{}/{}", app.identifier, activity);
        let host = host_ip.to_string();

        let output = command::run(
            "adb",
            &[
                "-s",
                &device.id,
                "shell",
                "am",
                "start",
                "-W",
                "-n",
                &component,
                "-e",
                "SESSION_ID",
                session_id,
                "-e",
                "HOST",
                &host,
            ],
        )
        .await?;

        if !output.success || output.stdout.contains("Error:") {
            return Err(Error::process(format!(
                "am start {} on {} failed: {}{}",
                component,
                device.id,
                output.stdout.trim(),
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    pub async fn stop_app(&self, device: &DeviceInfo, app: &AppParameter) -> Result<()> {
        command::run_checked(
            "adb",
            &["-s", &device.id, "shell", "am", "force-stop", &app.identifier],
        )
        .await?;
        Ok(())
    }

    pub fn start_recording(&self, device: &DeviceInfo, path: &Path) -> Result<Recording> {
        let process = LaunchedProcess::spawn(
            "adb",
            &["-s", &device.id, "shell", "screenrecord", DEVICE_RECORDING_PATH],
            format!("screenrecord:{}", device.id),
        )?;
        Ok(Recording {
            process: Some(process),
            output: recording_file(path),
        })
    }

    /// Stop `screenrecord` and pull the file next to the requested path
    pub async fn stop_recording(&self, device: &DeviceInfo, mut recording: Recording) -> Result<()> {
        if let Some(process) = recording.process.as_mut() {
            if let Err(e) = process.terminate(RECORDING_GRACE).await {
                warn!("screenrecord on {} did not stop cleanly: {}", device.id, e);
            }
        }

        let output = recording.output.display().to_string();
        command::run_checked("adb", &["-s", &device.id, "pull", DEVICE_RECORDING_PATH, &output])
            .await?;
        info!("Recording saved to {}", output);
        Ok(())
    }

    pub async fn start_service() -> Result<()> {
        command::run_checked("adb", &["start-server"]).await?;
        Ok(())
    }

    pub async fn stop_service() -> Result<()> {
        command::run_checked("adb", &["kill-server"]).await?;
        Ok(())
    }
}

/// Extract `(serial, display name)` pairs for devices in the `device` state
fn parse_device_list(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let caps = DEVICE_LINE_REGEX.captures(line.trim())?;
            let serial = caps[1].to_string();
            let name = caps
                .get(2)
                .and_then(|props| MODEL_REGEX.captures(props.as_str()))
                .map(|model| model[1].replace('_', " "))
                .unwrap_or_else(|| serial.clone());
            Some((serial, name))
        })
        .collect()
}

fn package_listed(output: &str, package: &str) -> bool {
    let wanted = format!("package:{package}");
    output.lines().any(|line| line.trim() == wanted)
}

fn failure_line(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.contains("Failure ["))
        .map(|line| line.trim().to_string())
}

async fn getprop(serial: &str, property: &str) -> Option<String> {
    let output = command::run("adb", &["-s", serial, "shell", "getprop", property])
        .await
        .ok()?;
    let value = output.stdout.trim();
    (output.success && !value.is_empty()).then(|| value.to_string())
}

async fn lookup_device_ip(serial: &str) -> Option<IpAddr> {
    for interface in ["wlan0", "eth0"] {
        let Ok(output) = command::run(
            "adb",
            &["-s", serial, "shell", "ip", "-f", "inet", "addr", "show", interface],
        )
        .await
        else {
            continue;
        };
        if let Some(ip) = parse_inet_address(&output.stdout) {
            return Some(ip);
        }
    }
    None
}

/// `adb uninstall` failures that only mean the package was never there
fn package_was_absent(failure: &str) -> bool {
    failure.contains("DELETE_FAILED_INTERNAL_ERROR") || failure.contains("not installed")
}

fn parse_inet_address(output: &str) -> Option<IpAddr> {
    INET_REGEX
        .captures(output)
        .and_then(|caps| caps[1].parse().ok())
}
