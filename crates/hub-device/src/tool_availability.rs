//! Tool availability checking for local device managers
//!
//! The iOS simulator manager needs `xcrun simctl` (macOS with Xcode), the
//! Android manager needs `adb` on the PATH. The desktop manager needs
//! nothing beyond the host itself.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

use hub_core::Platform;

/// Cached availability of external tools (checked once at startup)
#[derive(Debug, Clone, Default)]
pub struct ToolAvailability {
    /// Whether `xcrun simctl` responds
    pub xcrun_simctl: bool,

    /// Resolved path of `adb`, if found
    pub adb_path: Option<PathBuf>,

    /// Whether this host is a macOS desktop
    pub macos_host: bool,
}

impl ToolAvailability {
    pub async fn check() -> Self {
        Self {
            xcrun_simctl: Self::check_xcrun_simctl().await,
            adb_path: Self::find_adb(),
            macos_host: cfg!(target_os = "macos"),
        }
    }

    async fn check_xcrun_simctl() -> bool {
        if which::which("xcrun").is_err() {
            return false;
        }

        Command::new("xcrun")
            .args(["simctl", "help"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .inspect_err(|e| tracing::debug!("xcrun simctl check failed: {}", e))
            .unwrap_or(false)
    }

    fn find_adb() -> Option<PathBuf> {
        which::which("adb")
            .inspect_err(|e| tracing::debug!("adb not on PATH: {}", e))
            .ok()
    }

    /// Whether a local manager for `platform` can run here
    pub fn supports(&self, platform: Platform) -> bool {
        match platform {
            Platform::IosSimulator => self.xcrun_simctl,
            Platform::Android => self.adb_path.is_some(),
            Platform::MacOs => self.macos_host,
        }
    }

    /// User-facing reason a manager is skipped, `None` when it can run
    pub fn unavailable_message(&self, platform: Platform) -> Option<&'static str> {
        if self.supports(platform) {
            return None;
        }
        match platform {
            Platform::IosSimulator => {
                if self.macos_host {
                    Some("Xcode not installed. Install Xcode to manage iOS simulators.")
                } else {
                    Some("iOS simulators are only available on macOS.")
                }
            }
            Platform::Android => Some("adb not found. Install the Android platform tools."),
            Platform::MacOs => Some("The desktop manager only runs on a macOS host."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_supports_nothing() {
        let availability = ToolAvailability::default();
        assert!(!availability.supports(Platform::IosSimulator));
        assert!(!availability.supports(Platform::Android));
        assert!(!availability.supports(Platform::MacOs));
    }

    #[test]
    fn test_unavailable_messages() {
        let availability = ToolAvailability::default();
        assert!(availability
            .unavailable_message(Platform::IosSimulator)
            .unwrap()
            .contains("only available on macOS"));
        assert!(availability
            .unavailable_message(Platform::Android)
            .unwrap()
            .contains("adb"));
    }

    #[test]
    fn test_available_has_no_message() {
        let availability = ToolAvailability {
            xcrun_simctl: true,
            adb_path: Some(PathBuf::from("/usr/local/bin/adb")),
            macos_host: true,
        };
        assert!(availability.unavailable_message(Platform::IosSimulator).is_none());
        assert!(availability.unavailable_message(Platform::Android).is_none());
        assert!(availability.unavailable_message(Platform::MacOs).is_none());
    }

    #[tokio::test]
    async fn test_check_is_consistent_with_host() {
        let availability = ToolAvailability::check().await;
        assert_eq!(availability.macos_host, cfg!(target_os = "macos"));
    }
}
