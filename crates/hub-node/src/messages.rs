//! Request/response payloads of the `RPCNode.*` methods.

use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use hub_core::{AppParameter, DeviceInfo, DeviceState};

/// Method names served by a node
pub mod methods {
    pub const PING: &str = "RPCNode.Ping";
    pub const GET_DEVICES: &str = "RPCNode.GetDevices";
    pub const START_DEVICE: &str = "RPCNode.StartDevice";
    pub const STOP_DEVICE: &str = "RPCNode.StopDevice";
    pub const IS_APP_INSTALLED: &str = "RPCNode.IsAppInstalled";
    pub const INSTALL_APP: &str = "RPCNode.InstallApp";
    pub const UNINSTALL_APP: &str = "RPCNode.UninstallApp";
    pub const START_APP: &str = "RPCNode.StartApp";
    pub const STOP_APP: &str = "RPCNode.StopApp";
    pub const IS_CONNECTED: &str = "RPCNode.IsConnected";
    pub const CONNECTION_TIMEOUT: &str = "RPCNode.ConnectionTimeout";
    pub const START_RECORDING: &str = "RPCNode.StartRecording";
    pub const STOP_RECORDING: &str = "RPCNode.StopRecording";
}

/// First frame a node sends after dialing the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub struct RegisterNode {
    pub identifier: String,
    pub hostname: String,
    /// Manager names the node serves ("iossim", "android", "macos")
    pub managers: Vec<String>,
}

/// Empty payload. Serializes as `{}` so a successful reply is never `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Void {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerRequest {
    pub manager: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequest {
    pub manager: String,
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRequest {
    pub manager: String,
    pub device_id: String,
    pub app: AppParameter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAppRequest {
    pub manager: String,
    pub device_id: String,
    pub app: AppParameter,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "hostIP")]
    pub host_ip: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingRequest {
    pub manager: String,
    pub device_id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoolResponse {
    pub value: bool,
}

/// One device as reported by a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDevice {
    pub info: DeviceInfo,
    pub state: DeviceState,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DevicesResponse {
    pub devices: Vec<RemoteDevice>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutResponse {
    pub timeout_ms: u64,
}
