//! Per-platform device inventory and power control

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use hub_core::prelude::*;
use hub_core::{DeviceInfo, LifecycleState, Platform};
use hub_node::NodeClient;

use crate::device::Device;
use crate::driver::{DiscoveredDevice, Driver};
use crate::drivers::{AndroidDriver, IosSimulatorDriver, MacOsDriver, RemoteDriver};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Inventory changes, for whoever persists device records
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Added(DeviceInfo),
    Removed { id: String },
    LifecycleChanged { id: String, lifecycle: LifecycleState },
}

/// Where a manager's devices come from
#[derive(Debug, Clone)]
pub enum Discovery {
    IosSimulator,
    Android,
    MacOs,
    Remote(RemoteDriver),
}

impl Discovery {
    async fn discover(&self, host_ip: IpAddr) -> Result<Vec<DiscoveredDevice>> {
        match self {
            Discovery::IosSimulator => IosSimulatorDriver::discover(host_ip).await,
            Discovery::Android => AndroidDriver::discover(host_ip).await,
            Discovery::MacOs => Ok(MacOsDriver::discover(host_ip)),
            Discovery::Remote(remote) => remote.discover().await,
        }
    }

    /// Driver given to each device this manager creates
    fn driver(&self) -> Driver {
        match self {
            Discovery::IosSimulator => Driver::IosSimulator(IosSimulatorDriver),
            Discovery::Android => Driver::Android(AndroidDriver),
            Discovery::MacOs => Driver::MacOs(MacOsDriver),
            Discovery::Remote(remote) => Driver::Remote(remote.clone()),
        }
    }
}

/// Owns one platform's devices.
///
/// Devices are shared out as `Arc<Device>`; a refresh reconciles the map
/// in place so handles held by running sessions stay valid.
#[derive(Debug)]
pub struct DeviceManager {
    name: String,
    platform: Platform,
    host_ip: IpAddr,
    discovery: Discovery,
    devices: RwLock<HashMap<String, Arc<Device>>>,
    events: broadcast::Sender<DeviceEvent>,
}

impl DeviceManager {
    fn with_discovery(
        name: impl Into<String>,
        platform: Platform,
        host_ip: IpAddr,
        discovery: Discovery,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            platform,
            host_ip,
            discovery,
            devices: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn ios_simulator(host_ip: IpAddr) -> Self {
        Self::for_platform(Platform::IosSimulator, host_ip)
    }

    pub fn android(host_ip: IpAddr) -> Self {
        Self::for_platform(Platform::Android, host_ip)
    }

    pub fn macos(host_ip: IpAddr) -> Self {
        Self::for_platform(Platform::MacOs, host_ip)
    }

    /// A local manager for `platform`
    pub fn for_platform(platform: Platform, host_ip: IpAddr) -> Self {
        let discovery = match platform {
            Platform::IosSimulator => Discovery::IosSimulator,
            Platform::Android => Discovery::Android,
            Platform::MacOs => Discovery::MacOs,
        };
        Self::with_discovery(platform.manager_name(), platform, host_ip, discovery)
    }

    /// A manager whose devices live on a node.
    ///
    /// `manager` is the node-side manager name ("iossim", "android", "macos").
    pub fn remote(
        client: NodeClient,
        node: &str,
        manager: &str,
        host_ip: IpAddr,
    ) -> Result<Self> {
        let platform = Platform::from_manager_name(manager).ok_or_else(|| {
            Error::discovery(format!("node {node} announced unknown manager '{manager}'"))
        })?;
        Ok(Self::with_discovery(
            format!("{node}/{manager}"),
            platform,
            host_ip,
            Discovery::Remote(RemoteDriver::new(client, manager)),
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn host_ip(&self) -> IpAddr {
        self.host_ip
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.discovery, Discovery::Remote(_))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: DeviceEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Bring up the platform service this manager depends on
    pub async fn start(&self) -> Result<()> {
        info!("Starting {} manager", self.name);
        match self.discovery {
            Discovery::IosSimulator => IosSimulatorDriver::start_service().await,
            Discovery::Android => AndroidDriver::start_service().await,
            Discovery::MacOs | Discovery::Remote(_) => Ok(()),
        }
    }

    pub async fn stop(&self) -> Result<()> {
        info!("Stopping {} manager", self.name);
        match self.discovery {
            Discovery::IosSimulator => IosSimulatorDriver::stop_service().await,
            Discovery::Android => AndroidDriver::stop_service().await,
            Discovery::MacOs | Discovery::Remote(_) => Ok(()),
        }
    }

    /// Re-enumerate devices and reconcile the inventory.
    ///
    /// Known devices keep their handle. A busy device is never downgraded
    /// out of `Booted` or removed by a refresh. On discovery failure the
    /// last known inventory is kept and the error is returned.
    pub async fn refresh_devices(&self) -> Result<()> {
        let discovered = match self.discovery.discover(self.host_ip).await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("{}: discovery failed, keeping last inventory: {}", self.name, e);
                return Err(match e {
                    Error::Discovery { .. } => e,
                    other => Error::discovery(format!("{}: {}", self.name, other)),
                });
            }
        };

        // Busy checks wait on a device's session lock, which a launch holds
        // for its whole duration; settle them before taking the write lock
        let busy = self.busy_devices_at_risk(&discovered).await;

        let mut devices = self.devices.write().await;
        let mut seen = Vec::with_capacity(discovered.len());

        for found in discovered {
            let id = found.info.id.clone();
            seen.push(id.clone());

            match devices.get(&id) {
                Some(device) => {
                    if device.state().lifecycle == found.lifecycle {
                        continue;
                    }
                    if found.lifecycle != LifecycleState::Booted && busy.contains(&id) {
                        warn!(
                            "{}: {} reported {} while running a session, keeping it booted",
                            self.name, id, found.lifecycle
                        );
                        continue;
                    }
                    if device.set_lifecycle(found.lifecycle) {
                        debug!("{}: {} is now {}", self.name, id, found.lifecycle);
                        self.emit(DeviceEvent::LifecycleChanged {
                            id,
                            lifecycle: found.lifecycle,
                        });
                    }
                }
                None => {
                    info!("{}: found {}", self.name, found.info.display_name());
                    let device = Device::new(found.info.clone(), found.lifecycle, self.discovery.driver());
                    devices.insert(id, Arc::new(device));
                    self.emit(DeviceEvent::Added(found.info));
                }
            }
        }

        let vanished: Vec<String> = devices
            .keys()
            .filter(|id| !seen.contains(id))
            .cloned()
            .collect();
        for id in vanished {
            if busy.contains(&id) {
                warn!("{}: {} disappeared while running a session, keeping it", self.name, id);
                continue;
            }
            info!("{}: {} is gone", self.name, id);
            devices.remove(&id);
            self.emit(DeviceEvent::Removed { id });
        }

        Ok(())
    }

    /// Ids of known devices that this discovery would downgrade or drop
    /// and that are running a session
    async fn busy_devices_at_risk(&self, discovered: &[DiscoveredDevice]) -> HashSet<String> {
        let known: Vec<Arc<Device>> = self.devices.read().await.values().cloned().collect();
        let mut busy = HashSet::new();

        for device in known {
            let at_risk = match discovered.iter().find(|f| f.info.id == device.id()) {
                Some(found) => {
                    found.lifecycle != LifecycleState::Booted
                        && found.lifecycle != device.state().lifecycle
                }
                None => true,
            };
            if at_risk && device.is_busy().await {
                busy.insert(device.id().to_string());
            }
        }

        busy
    }

    /// Snapshot of the inventory, ordered by id
    pub async fn get_devices(&self) -> Vec<Arc<Device>> {
        let mut devices: Vec<_> = self.devices.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.id().cmp(b.id()));
        devices
    }

    pub async fn find_device(&self, id: &str) -> Option<Arc<Device>> {
        self.devices.read().await.get(id).cloned()
    }

    pub async fn get_device(&self, id: &str) -> Result<Arc<Device>> {
        self.find_device(id)
            .await
            .ok_or_else(|| Error::device_not_found(id))
    }

    /// Whether `device` is the very handle this manager holds
    pub async fn has_device(&self, device: &Arc<Device>) -> bool {
        self.devices
            .read()
            .await
            .get(device.id())
            .is_some_and(|held| Arc::ptr_eq(held, device))
    }

    /// Power a device on. A no-op where the platform has no power control.
    pub async fn start_device(&self, id: &str) -> Result<()> {
        let device = self.get_device(id).await?;
        match &self.discovery {
            Discovery::IosSimulator => IosSimulatorDriver::boot(id).await?,
            Discovery::Remote(remote) => remote.start_device(id).await?,
            Discovery::Android | Discovery::MacOs => {
                debug!("{}: power control not supported, {} left as is", self.name, id);
                return Ok(());
            }
        }
        self.apply_lifecycle(&device, LifecycleState::Booted);
        Ok(())
    }

    /// Power a device off. A no-op where the platform has no power control.
    pub async fn stop_device(&self, id: &str) -> Result<()> {
        let device = self.get_device(id).await?;
        if let Some(session) = device.active_session().await {
            warn!("{}: stopping {} under running session {}", self.name, id, session);
        }
        match &self.discovery {
            Discovery::IosSimulator => IosSimulatorDriver::shutdown(id).await?,
            Discovery::Remote(remote) => remote.stop_device(id).await?,
            Discovery::Android | Discovery::MacOs => {
                debug!("{}: power control not supported, {} left as is", self.name, id);
                return Ok(());
            }
        }
        self.apply_lifecycle(&device, LifecycleState::Shutdown);
        Ok(())
    }

    fn apply_lifecycle(&self, device: &Device, lifecycle: LifecycleState) {
        if device.set_lifecycle(lifecycle) {
            self.emit(DeviceEvent::LifecycleChanged {
                id: device.id().to_string(),
                lifecycle,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::macos::HOST_DEVICE_ID;
    use futures_util::SinkExt;
    use hub_core::DeviceState;
    use hub_node::messages::{methods, DevicesResponse, RemoteDevice};
    use hub_node::{next_text, RequestFrame, ResponseFrame};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::WebSocketStream;

    fn host() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_macos_refresh_yields_one_booted_device() {
        let manager = DeviceManager::macos(host());
        assert!(manager.get_devices().await.is_empty());

        manager.refresh_devices().await.unwrap();

        let devices = manager.get_devices().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id(), HOST_DEVICE_ID);
        assert_eq!(devices[0].state().lifecycle, LifecycleState::Booted);
    }

    #[tokio::test]
    async fn test_refresh_keeps_existing_handles() {
        let manager = DeviceManager::macos(host());
        manager.refresh_devices().await.unwrap();
        let first = manager.get_device(HOST_DEVICE_ID).await.unwrap();
        first
            .set_connection(hub_core::ConnectionState::Connected)
            .unwrap();

        manager.refresh_devices().await.unwrap();
        let second = manager.get_device(HOST_DEVICE_ID).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(second.state().is_connected());
    }

    #[tokio::test]
    async fn test_has_device_is_identity() {
        let manager = DeviceManager::macos(host());
        manager.refresh_devices().await.unwrap();
        let held = manager.get_device(HOST_DEVICE_ID).await.unwrap();
        assert!(manager.has_device(&held).await);

        let other = DeviceManager::macos(host());
        other.refresh_devices().await.unwrap();
        let foreign = other.get_device(HOST_DEVICE_ID).await.unwrap();
        assert!(!manager.has_device(&foreign).await);
    }

    #[tokio::test]
    async fn test_power_control_is_a_no_op_on_desktop() {
        let manager = DeviceManager::macos(host());
        manager.refresh_devices().await.unwrap();
        manager.stop_device(HOST_DEVICE_ID).await.unwrap();
        let device = manager.get_device(HOST_DEVICE_ID).await.unwrap();
        assert_eq!(device.state(), DeviceState::booted());
    }

    #[tokio::test]
    async fn test_unknown_device_is_not_found() {
        let manager = DeviceManager::macos(host());
        let err = manager.start_device("nope").await.unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_refresh_emits_added_once() {
        let manager = DeviceManager::macos(host());
        let mut events = manager.subscribe();

        manager.refresh_devices().await.unwrap();
        manager.refresh_devices().await.unwrap();

        match events.try_recv().unwrap() {
            DeviceEvent::Added(info) => assert_eq!(info.id, HOST_DEVICE_ID),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remote_rejects_unknown_manager() {
        let (a, _b) = tokio::io::duplex(1024);
        let ws = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let client = NodeClient::new(ws, Duration::from_secs(1));
        let err = DeviceManager::remote(client, "node-1", "winphone", host()).unwrap_err();
        assert!(matches!(err, Error::Discovery { .. }));
    }

    #[tokio::test]
    async fn test_remote_discovery_failure_keeps_inventory() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client_ws = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let mut node_ws = WebSocketStream::from_raw_socket(b, Role::Server, None).await;

        // Answers one GetDevices with a single booted device, then hangs up
        let node = tokio::spawn(async move {
            let text = next_text(&mut node_ws).await.unwrap().unwrap();
            let request: RequestFrame = serde_json::from_str(&text).unwrap();
            assert_eq!(request.method, methods::GET_DEVICES);

            let mut info = MacOsDriver::discover("10.0.0.9".parse().unwrap())
                .remove(0)
                .info;
            info.id = "remote-1".to_string();
            let devices = DevicesResponse {
                devices: vec![RemoteDevice {
                    info,
                    state: DeviceState::booted(),
                }],
            };
            let response =
                ResponseFrame::success(request.id, serde_json::to_value(devices).unwrap());
            node_ws
                .send(WsMessage::Text(
                    serde_json::to_string(&response).unwrap().into(),
                ))
                .await
                .unwrap();
            node_ws.close(None).await.ok();
        });

        let client = NodeClient::new(client_ws, Duration::from_secs(5));
        let manager = DeviceManager::remote(client.clone(), "node-1", "macos", host()).unwrap();
        assert_eq!(manager.name(), "node-1/macos");

        manager.refresh_devices().await.unwrap();
        assert_eq!(manager.get_devices().await.len(), 1);

        node.await.unwrap();
        client.closed().await;

        let err = manager.refresh_devices().await.unwrap_err();
        assert!(matches!(err, Error::Discovery { .. }));
        let devices = manager.get_devices().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id(), "remote-1");
        assert!(devices[0].driver().is_remote());
    }

    #[tokio::test]
    async fn test_inventory_readable_while_refresh_waits_on_launch() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client_ws = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let mut node_ws = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();

        // Reports the device booted, then shut down; never answers StartApp
        let _node = tokio::spawn(async move {
            let mut lifecycle = LifecycleState::Booted;
            while let Some(Ok(text)) = next_text(&mut node_ws).await {
                let request: RequestFrame = serde_json::from_str(&text).unwrap();
                let _ = seen_tx.send(request.method.clone());
                if request.method != methods::GET_DEVICES {
                    continue;
                }

                let mut info = MacOsDriver::discover("10.0.0.9".parse().unwrap())
                    .remove(0)
                    .info;
                info.id = "remote-1".to_string();
                let devices = DevicesResponse {
                    devices: vec![RemoteDevice {
                        info,
                        state: DeviceState {
                            lifecycle,
                            ..DeviceState::booted()
                        },
                    }],
                };
                lifecycle = LifecycleState::Shutdown;
                let response =
                    ResponseFrame::success(request.id, serde_json::to_value(devices).unwrap());
                node_ws
                    .send(WsMessage::Text(
                        serde_json::to_string(&response).unwrap().into(),
                    ))
                    .await
                    .unwrap();
            }
        });

        let client = NodeClient::new(client_ws, Duration::from_secs(30));
        let manager = Arc::new(DeviceManager::remote(client, "node-1", "macos", host()).unwrap());
        manager.refresh_devices().await.unwrap();
        assert_eq!(seen_rx.recv().await.as_deref(), Some(methods::GET_DEVICES));

        let device = manager.get_device("remote-1").await.unwrap();
        let launch = tokio::spawn(async move {
            let app = hub_core::AppParameter::new("com.example.app", "/apps/example");
            device.start_app(&app, "s1", host()).await
        });
        assert_eq!(seen_rx.recv().await.as_deref(), Some(methods::START_APP));

        let refresh = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.refresh_devices().await })
        };
        assert_eq!(seen_rx.recv().await.as_deref(), Some(methods::GET_DEVICES));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let devices = tokio::time::timeout(Duration::from_secs(1), manager.get_devices())
            .await
            .unwrap();
        assert_eq!(devices.len(), 1);
        assert!(devices[0].state().is_booted());

        launch.abort();
        refresh.abort();
    }
}
