//! Devices hosted by a node; every operation becomes an `RPCNode.*` call.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use hub_core::prelude::*;
use hub_core::{AppParameter, DeviceInfo};
use hub_node::messages::{
    methods, AppRequest, BoolResponse, DeviceRequest, DevicesResponse, ManagerRequest,
    RecordingRequest, StartAppRequest, TimeoutResponse, Void,
};
use hub_node::NodeClient;

use crate::driver::{DiscoveredDevice, Recording};

/// Used when the node cannot tell us its own budget
pub const FALLBACK_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct RemoteDriver {
    client: NodeClient,
    /// Manager name on the node ("iossim", "android", "macos")
    manager: String,
}

impl RemoteDriver {
    pub fn new(client: NodeClient, manager: impl Into<String>) -> Self {
        Self {
            client,
            manager: manager.into(),
        }
    }

    fn device_request(&self, device_id: &str) -> DeviceRequest {
        DeviceRequest {
            manager: self.manager.clone(),
            device_id: device_id.to_string(),
        }
    }

    fn app_request(&self, device_id: &str, app: &AppParameter) -> AppRequest {
        AppRequest {
            manager: self.manager.clone(),
            device_id: device_id.to_string(),
            app: app.clone(),
        }
    }

    /// Devices the node's manager currently knows
    pub async fn discover(&self) -> Result<Vec<DiscoveredDevice>> {
        let response: DevicesResponse = self
            .client
            .call(
                methods::GET_DEVICES,
                &ManagerRequest {
                    manager: self.manager.clone(),
                },
            )
            .await?;

        Ok(response
            .devices
            .into_iter()
            .map(|remote| DiscoveredDevice {
                info: remote.info,
                lifecycle: remote.state.lifecycle,
            })
            .collect())
    }

    pub async fn ping(&self) -> Result<()> {
        let _: Void = self.client.call(methods::PING, &Void {}).await?;
        Ok(())
    }

    pub async fn start_device(&self, device_id: &str) -> Result<()> {
        let _: Void = self
            .client
            .call(methods::START_DEVICE, &self.device_request(device_id))
            .await?;
        Ok(())
    }

    pub async fn stop_device(&self, device_id: &str) -> Result<()> {
        let _: Void = self
            .client
            .call(methods::STOP_DEVICE, &self.device_request(device_id))
            .await?;
        Ok(())
    }

    /// Any failure reads as "not installed"
    pub async fn is_app_installed(&self, device: &DeviceInfo, app: &AppParameter) -> bool {
        match self
            .client
            .call::<_, BoolResponse>(methods::IS_APP_INSTALLED, &self.app_request(&device.id, app))
            .await
        {
            Ok(response) => response.value,
            Err(e) => {
                debug!("IsAppInstalled on {} failed: {}", device.id, e);
                false
            }
        }
    }

    pub async fn install_app(&self, device: &DeviceInfo, app: &AppParameter) -> Result<()> {
        let _: Void = self
            .client
            .call(methods::INSTALL_APP, &self.app_request(&device.id, app))
            .await
            .map_err(|e| remote_installation(&device.id, "install", e))?;
        Ok(())
    }

    pub async fn uninstall_app(&self, device: &DeviceInfo, app_id: &str) -> Result<()> {
        let app = AppParameter {
            identifier: app_id.to_string(),
            ..Default::default()
        };
        let _: Void = self
            .client
            .call(methods::UNINSTALL_APP, &self.app_request(&device.id, &app))
            .await
            .map_err(|e| remote_installation(&device.id, "uninstall", e))?;
        Ok(())
    }

    pub async fn launch(
        &self,
        device: &DeviceInfo,
        app: &AppParameter,
        session_id: &str,
        host_ip: IpAddr,
    ) -> Result<()> {
        let request = StartAppRequest {
            manager: self.manager.clone(),
            device_id: device.id.clone(),
            app: app.clone(),
            session_id: session_id.to_string(),
            host_ip,
        };
        let _: Void = self.client.call(methods::START_APP, &request).await?;
        Ok(())
    }

    pub async fn stop_app(&self, device: &DeviceInfo, app: &AppParameter) -> Result<()> {
        let _: Void = self
            .client
            .call(methods::STOP_APP, &self.app_request(&device.id, app))
            .await?;
        Ok(())
    }

    /// Connection state of the app as seen by the node
    pub async fn is_connected(&self, device: &DeviceInfo) -> Result<bool> {
        let response: BoolResponse = self
            .client
            .call(methods::IS_CONNECTED, &self.device_request(&device.id))
            .await?;
        Ok(response.value)
    }

    pub async fn connection_timeout(&self, device: &DeviceInfo) -> Duration {
        match self
            .client
            .call::<_, TimeoutResponse>(
                methods::CONNECTION_TIMEOUT,
                &self.device_request(&device.id),
            )
            .await
        {
            Ok(response) => Duration::from_millis(response.timeout_ms),
            Err(e) => {
                warn!(
                    "ConnectionTimeout on {} failed ({}), using {:?}",
                    device.id, e, FALLBACK_CONNECTION_TIMEOUT
                );
                FALLBACK_CONNECTION_TIMEOUT
            }
        }
    }

    pub async fn start_recording(&self, device: &DeviceInfo, path: &Path) -> Result<Recording> {
        let request = RecordingRequest {
            manager: self.manager.clone(),
            device_id: device.id.clone(),
            path: path.to_path_buf(),
        };
        let _: Void = self.client.call(methods::START_RECORDING, &request).await?;
        Ok(Recording {
            process: None,
            output: path.to_path_buf(),
        })
    }

    pub async fn stop_recording(&self, device: &DeviceInfo) -> Result<()> {
        let _: Void = self
            .client
            .call(methods::STOP_RECORDING, &self.device_request(&device.id))
            .await?;
        Ok(())
    }
}

/// Keep transport failures visible; wrap remote failures as installation errors
fn remote_installation(device_id: &str, operation: &str, err: Error) -> Error {
    match err {
        Error::RemoteInvocation { message, .. } => {
            Error::installation(device_id, operation, message)
        }
        other => other,
    }
}
