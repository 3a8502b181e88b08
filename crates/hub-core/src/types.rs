//! Domain types shared by every hub crate

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Power/availability state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum LifecycleState {
    #[default]
    Unknown,
    Shutdown,
    Booted,
}

impl LifecycleState {
    /// Map a platform tool's state string ("Booted", "Shutdown", ...)
    pub fn from_tool_state(state: &str) -> Self {
        match state {
            "Booted" => LifecycleState::Booted,
            "Shutdown" => LifecycleState::Shutdown,
            _ => LifecycleState::Unknown,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Unknown => write!(f, "unknown"),
            LifecycleState::Shutdown => write!(f, "shutdown"),
            LifecycleState::Booted => write!(f, "booted"),
        }
    }
}

/// Whether the app under test has reported back for the current session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Combined device state.
///
/// Invariant: `connection == Connected` implies `lifecycle == Booted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct DeviceState {
    pub lifecycle: LifecycleState,
    pub connection: ConnectionState,
}

impl DeviceState {
    pub fn booted() -> Self {
        Self {
            lifecycle: LifecycleState::Booted,
            connection: ConnectionState::Disconnected,
        }
    }

    pub fn is_booted(&self) -> bool {
        self.lifecycle == LifecycleState::Booted
    }

    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    /// Check the `Connected => Booted` invariant
    pub fn is_consistent(&self) -> bool {
        !self.is_connected() || self.is_booted()
    }
}

/// Platform family a device belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    IosSimulator,
    Android,
    MacOs,
}

impl Platform {
    /// Manager name used in configuration and on the node wire
    pub fn manager_name(&self) -> &'static str {
        match self {
            Platform::IosSimulator => "iossim",
            Platform::Android => "android",
            Platform::MacOs => "macos",
        }
    }

    pub fn from_manager_name(name: &str) -> Option<Self> {
        match name {
            "iossim" => Some(Platform::IosSimulator),
            "android" => Some(Platform::Android),
            "macos" => Some(Platform::MacOs),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::IosSimulator => write!(f, "iOS Simulator"),
            Platform::Android => write!(f, "Android"),
            Platform::MacOs => write!(f, "macOS"),
        }
    }
}

/// Descriptive metadata of a discovered device, immutable after discovery
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Platform-assigned serial or UUID
    pub id: String,
    pub name: String,
    pub os_name: String,
    pub os_version: String,
    /// Address the app under test uses to call back into the hub
    pub ip_address: IpAddr,
    pub platform: Platform,
}

impl DeviceInfo {
    pub fn display_name(&self) -> String {
        format!("{} ({} {})", self.name, self.os_name, self.os_version)
    }
}

/// Describes the application under test
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppParameter {
    /// Bundle identifier / package name
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// Local path of the installable artifact (.app, .apk, executable)
    #[serde(default)]
    pub app_path: PathBuf,
    /// Android launch activity
    #[serde(default)]
    pub launch_activity: Option<String>,
}

impl AppParameter {
    pub fn new(identifier: impl Into<String>, app_path: impl Into<PathBuf>) -> Self {
        Self {
            identifier: identifier.into(),
            app_path: app_path.into(),
            ..Default::default()
        }
    }

    pub fn with_launch_activity(mut self, activity: impl Into<String>) -> Self {
        self.launch_activity = Some(activity.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_from_tool_state() {
        assert_eq!(
            LifecycleState::from_tool_state("Booted"),
            LifecycleState::Booted
        );
        assert_eq!(
            LifecycleState::from_tool_state("Shutdown"),
            LifecycleState::Shutdown
        );
        assert_eq!(
            LifecycleState::from_tool_state("Creating"),
            LifecycleState::Unknown
        );
    }

    #[test]
    fn test_device_state_consistency() {
        let ok = DeviceState {
            lifecycle: LifecycleState::Booted,
            connection: ConnectionState::Connected,
        };
        assert!(ok.is_consistent());

        let broken = DeviceState {
            lifecycle: LifecycleState::Shutdown,
            connection: ConnectionState::Connected,
        };
        assert!(!broken.is_consistent());

        assert!(DeviceState::default().is_consistent());
    }

    #[test]
    fn test_platform_manager_names_roundtrip() {
        for platform in [Platform::IosSimulator, Platform::Android, Platform::MacOs] {
            assert_eq!(
                Platform::from_manager_name(platform.manager_name()),
                Some(platform)
            );
        }
        assert_eq!(Platform::from_manager_name("unity"), None);
    }

    #[test]
    fn test_device_info_serializes_camel_case() {
        let info = DeviceInfo {
            id: "A1".into(),
            name: "iPhone 15".into(),
            os_name: "iphonesimulator".into(),
            os_version: "17-2".into(),
            ip_address: "127.0.0.1".parse().unwrap(),
            platform: Platform::IosSimulator,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["osName"], "iphonesimulator");
        assert_eq!(json["ipAddress"], "127.0.0.1");
        assert_eq!(json["platform"], "ios_simulator");
    }
}
