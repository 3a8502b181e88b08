//! Configuration types for hub.toml

use std::time::Duration;

use serde::{Deserialize, Serialize};

use hub_core::Platform;

/// Everything read from hub.toml. Read once at startup, then passed down.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub hub: HubSettings,

    #[serde(default)]
    pub log_ingestion: LogIngestionSettings,

    #[serde(default)]
    pub managers: ManagerSettings,

    #[serde(default)]
    pub rpc: RpcSettings,

    #[serde(default)]
    pub node: NodeSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubSettings {
    /// Address apps report back to: "auto" or a literal IP
    #[serde(default = "default_host_ip")]
    pub host_ip: String,

    /// Where the controller accepts node connections
    #[serde(default = "default_node_listen")]
    pub node_listen: String,

    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Upper bound on any platform's connection budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connection_wait_secs: Option<u64>,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            host_ip: default_host_ip(),
            node_listen: default_node_listen(),
            refresh_interval_secs: default_refresh_interval_secs(),
            max_connection_wait_secs: None,
        }
    }
}

impl HubSettings {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn max_connection_wait(&self) -> Option<Duration> {
        self.max_connection_wait_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogIngestionSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_log_bind")]
    pub bind: String,
}

impl Default for LogIngestionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_log_bind(),
        }
    }
}

/// Which local managers to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerSettings {
    #[serde(default = "default_true")]
    pub ios_simulator: bool,

    #[serde(default = "default_true")]
    pub android: bool,

    #[serde(default = "default_true")]
    pub macos: bool,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            ios_simulator: true,
            android: true,
            macos: true,
        }
    }
}

impl ManagerSettings {
    pub fn enabled(&self) -> Vec<Platform> {
        [
            (Platform::IosSimulator, self.ios_simulator),
            (Platform::Android, self.android),
            (Platform::MacOs, self.macos),
        ]
        .into_iter()
        .filter_map(|(platform, on)| on.then_some(platform))
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcSettings {
    /// Deadline for one node call
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// How often the controller pings each node
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Silence after which a node drops and redials its controller
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
        }
    }
}

impl RpcSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Controller endpoint the node dials
    #[serde(default = "default_master_url")]
    pub master_url: String,

    /// Defaults to the hostname
    #[serde(default)]
    pub identifier: Option<String>,

    #[serde(default)]
    pub hostname: Option<String>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            master_url: default_master_url(),
            identifier: None,
            hostname: None,
        }
    }
}

fn default_host_ip() -> String {
    "auto".to_string()
}

fn default_node_listen() -> String {
    "0.0.0.0:8002".to_string()
}

fn default_refresh_interval_secs() -> u64 {
    10
}

fn default_log_bind() -> String {
    "0.0.0.0:6666".to_string()
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_ping_interval_secs() -> u64 {
    10
}

fn default_ping_timeout_secs() -> u64 {
    30
}

fn default_master_url() -> String {
    "ws://127.0.0.1:8002/node".to_string()
}

fn default_true() -> bool {
    true
}
