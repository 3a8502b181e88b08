//! Settings loader for hub.toml

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::Path;

use hub_core::prelude::*;

use super::types::{HubSettings, NodeSettings, Settings};

pub const CONFIG_FILENAME: &str = "hub.toml";

/// Address used only to pick the outbound interface; nothing is sent
const OUTBOUND_PROBE: &str = "8.8.8.8:80";

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

/// Load settings from `path`.
///
/// Returns default settings if the file doesn't exist or can't be parsed.
pub fn load_settings(path: &Path) -> Settings {
    if !path.exists() {
        debug!("No config file at {:?}, using defaults", path);
        return Settings::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(settings) => {
                debug!("Loaded settings from {:?}", path);
                settings
            }
            Err(e) => {
                warn!("Failed to parse {:?}: {}", path, e);
                Settings::default()
            }
        },
        Err(e) => {
            warn!("Failed to read {:?}: {}", path, e);
            Settings::default()
        }
    }
}

/// Reject values no component could start with
pub fn validate_settings(settings: &Settings) -> Result<()> {
    parse_socket_addr("hub.node_listen", &settings.hub.node_listen)?;
    parse_socket_addr("log_ingestion.bind", &settings.log_ingestion.bind)?;

    if settings.hub.host_ip != "auto" {
        settings.hub.host_ip.parse::<IpAddr>().map_err(|e| {
            Error::config(format!(
                "hub.host_ip '{}' is neither \"auto\" nor an IP: {}",
                settings.hub.host_ip, e
            ))
        })?;
    }

    let url = url::Url::parse(&settings.node.master_url).map_err(|e| {
        Error::config(format!(
            "node.master_url '{}' is invalid: {}",
            settings.node.master_url, e
        ))
    })?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(Error::config(format!(
            "node.master_url must use ws:// or wss://, got {}://",
            url.scheme()
        )));
    }

    Ok(())
}

pub fn parse_socket_addr(key: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .map_err(|e| Error::config(format!("{key} '{value}' is not a socket address: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Host identity
// ─────────────────────────────────────────────────────────────────────────────

/// The address apps report back to.
///
/// "auto" picks the interface the OS would route outbound traffic through,
/// falling back to loopback when there is no route.
pub fn resolve_host_ip(hub: &HubSettings) -> IpAddr {
    if hub.host_ip != "auto" {
        if let Ok(ip) = hub.host_ip.parse() {
            return ip;
        }
        warn!("Invalid host_ip '{}', detecting instead", hub.host_ip);
    }

    match outbound_ip() {
        Ok(ip) => ip,
        Err(e) => {
            warn!("Could not detect outbound address ({}), using loopback", e);
            IpAddr::from([127, 0, 0, 1])
        }
    }
}

fn outbound_ip() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(OUTBOUND_PROBE)?;
    Ok(socket.local_addr()?.ip())
}

/// Hostname of this machine, best effort
pub fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

impl NodeSettings {
    pub fn resolved_hostname(&self) -> String {
        self.hostname.clone().unwrap_or_else(local_hostname)
    }

    pub fn resolved_identifier(&self) -> String {
        self.identifier
            .clone()
            .unwrap_or_else(|| self.resolved_hostname())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Writing
// ─────────────────────────────────────────────────────────────────────────────

/// Write the commented default config to `path` if nothing is there yet.
///
/// Returns `true` when a file was created.
pub fn init_config(path: &Path) -> Result<bool> {
    if path.exists() {
        debug!("Config already present at {:?}", path);
        return Ok(false);
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::config(format!("Failed to create {:?}: {}", parent, e)))?;
    }

    std::fs::write(path, generate_default_config())
        .map_err(|e| Error::config(format!("Failed to write {:?}: {}", path, e)))?;
    info!("Created default config at {:?}", path);
    Ok(true)
}

/// Save settings to `path`.
///
/// Uses atomic write (temp file + rename).
pub fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    let content = toml::to_string_pretty(settings)
        .map_err(|e| Error::config(format!("Failed to serialize settings: {}", e)))?;
    let full_content = format!("{}{}", generate_config_header(), content);

    let temp_path = path.with_extension("toml.tmp");
    std::fs::write(&temp_path, &full_content)
        .map_err(|e| Error::config(format!("Failed to write temp file: {}", e)))?;
    std::fs::rename(&temp_path, path)
        .map_err(|e| Error::config(format!("Failed to rename temp file: {}", e)))?;

    info!("Saved settings to {:?}", path);
    Ok(())
}

fn generate_config_header() -> String {
    "# Automation Hub Configuration\n\n".to_string()
}

fn generate_default_config() -> String {
    r#"# Automation Hub Configuration

[hub]
host_ip = "auto"               # Address apps report back to ("auto" or an IP)
node_listen = "0.0.0.0:8002"   # Where nodes connect
refresh_interval_secs = 10     # Device inventory refresh
# max_connection_wait_secs = 60  # Cap on the per-platform connection budget

[log_ingestion]
enabled = true
bind = "0.0.0.0:6666"          # UDP endpoint apps send log lines to

[managers]
ios_simulator = true           # Needs Xcode
android = true                 # Needs adb
macos = true                   # macOS hosts only

[rpc]
call_timeout_secs = 30
ping_interval_secs = 10
ping_timeout_secs = 30         # Node redials after this much silence

[node]
master_url = "ws://127.0.0.1:8002/node"
# identifier = "lab-mac-01"    # Defaults to the hostname
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    fn test_load_settings_missing_file() {
        let temp = tempdir().unwrap();
        let settings = load_settings(&temp.path().join(CONFIG_FILENAME));
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_load_settings_custom() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(CONFIG_FILENAME);
        std::fs::write(
            &path,
            r#"
[hub]
host_ip = "10.1.2.3"

[log_ingestion]
bind = "127.0.0.1:7777"
"#,
        )
        .unwrap();

        let settings = load_settings(&path);
        assert_eq!(settings.hub.host_ip, "10.1.2.3");
        assert_eq!(settings.log_ingestion.bind, "127.0.0.1:7777");
        assert_eq!(resolve_host_ip(&settings.hub).to_string(), "10.1.2.3");
    }

    #[test]
    fn test_load_settings_invalid_toml() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(CONFIG_FILENAME);
        std::fs::write(&path, "not valid toml {{{{").unwrap();

        assert_eq!(load_settings(&path), Settings::default());
    }

    #[test]
    fn test_init_config_writes_valid_defaults() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("conf").join(CONFIG_FILENAME);

        assert!(init_config(&path).unwrap());
        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: Settings = toml::from_str(&content).expect("default config should be valid TOML");
        assert_eq!(parsed, Settings::default());
    }

    #[test]
    fn test_init_config_is_idempotent() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(CONFIG_FILENAME);
        std::fs::write(&path, "[hub]\nhost_ip = \"10.0.0.1\"\n").unwrap();

        assert!(!init_config(&path).unwrap());
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("10.0.0.1"));
    }

    #[test]
    fn test_save_then_load() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(CONFIG_FILENAME);
        let mut settings = Settings::default();
        settings.rpc.call_timeout_secs = 5;
        settings.node.identifier = Some("lab-1".to_string());

        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path), settings);
    }

    #[test]
    fn test_validate_defaults() {
        validate_settings(&Settings::default()).unwrap();
    }

    #[test]
    fn test_validate_rejects_http_master_url() {
        let mut settings = Settings::default();
        settings.node.master_url = "http://hub.local/node".to_string();
        let err = validate_settings(&settings).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_validate_rejects_bad_bind() {
        let mut settings = Settings::default();
        settings.log_ingestion.bind = "port 6666".to_string();
        assert!(validate_settings(&settings).is_err());
    }

    #[test]
    #[serial]
    fn test_hostname_from_environment() {
        let saved = std::env::var("HOSTNAME").ok();
        std::env::set_var("HOSTNAME", "  rack-07\n");
        assert_eq!(local_hostname(), "rack-07");

        let node = NodeSettings::default();
        assert_eq!(node.resolved_identifier(), "rack-07");

        match saved {
            Some(value) => std::env::set_var("HOSTNAME", value),
            None => std::env::remove_var("HOSTNAME"),
        }
    }

    #[test]
    fn test_identifier_falls_back_to_hostname() {
        let node = NodeSettings {
            hostname: Some("mac-mini".to_string()),
            ..Default::default()
        };
        assert_eq!(node.resolved_identifier(), "mac-mini");
    }
}
