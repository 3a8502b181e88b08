//! Controller side of the node link.
//!
//! Nodes dial in, announce themselves with a `RegisterNode` frame and are
//! then driven as RPC servers. Each announced manager becomes a remote
//! [`DeviceManager`] registered with the session coordinator for as long
//! as the node answers pings.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::{accept_async, WebSocketStream};

use hub_core::prelude::*;
use hub_device::DeviceManager;
use hub_node::messages::{methods, RegisterNode, Void};
use hub_node::{next_text, NodeClient};

use crate::config::RpcSettings;
use crate::session::SessionCoordinator;

/// How long a fresh connection may take to send its registration
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// A registered node and the managers this link contributed
#[derive(Debug)]
pub struct AttachedNode {
    pub identifier: String,
    pub hostname: String,
    pub client: NodeClient,
    pub managers: Vec<Arc<DeviceManager>>,
}

impl AttachedNode {
    /// Coordinator-side names (`<node>/<manager>`)
    pub fn manager_names(&self) -> Vec<&str> {
        self.managers.iter().map(|m| m.name()).collect()
    }
}

#[derive(Debug)]
pub struct NodeListener {
    coordinator: Arc<SessionCoordinator>,
    call_timeout: Duration,
    ping_interval: Duration,
}

impl NodeListener {
    pub fn new(coordinator: Arc<SessionCoordinator>, rpc: &RpcSettings) -> Self {
        Self {
            coordinator,
            call_timeout: rpc.call_timeout(),
            ping_interval: rpc.ping_interval(),
        }
    }

    /// Accept node connections until `shutdown` flips to `true`
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = listener.local_addr() {
            info!("Accepting nodes on {}", addr);
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let this = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = this.handle_connection(stream, peer).await {
                                warn!("Node connection from {} failed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => warn!("Node accept failed: {}", e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Node listener stopped");
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let ws = accept_async(stream)
            .await
            .map_err(|e| Error::transport(format!("handshake with {peer}: {e}")))?;
        let node = self.attach(ws).await?;
        self.supervise(node).await;
        Ok(())
    }

    /// Read the registration frame and register the node's managers.
    ///
    /// A node that registers again under the same identifier replaces its
    /// previous managers.
    pub async fn attach<S>(&self, mut ws: WebSocketStream<S>) -> Result<AttachedNode>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let text = tokio::time::timeout(REGISTRATION_TIMEOUT, next_text(&mut ws))
            .await
            .map_err(|_| Error::transport("node sent no registration"))?
            .ok_or_else(|| Error::transport("node closed before registering"))??;
        let registration: RegisterNode = serde_json::from_str(&text)
            .map_err(|e| Error::transport(format!("bad registration frame: {e}")))?;

        let client = NodeClient::new(ws, self.call_timeout);
        let host_ip = self.coordinator.host_ip();
        let mut managers = Vec::new();

        for manager_name in &registration.managers {
            let manager = match DeviceManager::remote(
                client.clone(),
                &registration.identifier,
                manager_name,
                host_ip,
            ) {
                Ok(manager) => Arc::new(manager),
                Err(e) => {
                    warn!("{}", e);
                    continue;
                }
            };

            self.coordinator.unregister_manager(manager.name()).await;
            if let Err(e) = manager.refresh_devices().await {
                warn!("Initial refresh of {} failed: {}", manager.name(), e);
            }
            self.coordinator.register_manager(Arc::clone(&manager)).await;
            managers.push(manager);
        }

        info!(
            "Node '{}' ({}) attached with {} manager(s)",
            registration.identifier,
            registration.hostname,
            managers.len()
        );

        Ok(AttachedNode {
            identifier: registration.identifier,
            hostname: registration.hostname,
            client,
            managers,
        })
    }

    /// Ping the node until the transport fails, then drop its managers
    pub async fn supervise(&self, node: AttachedNode) {
        let mut ticker = tokio::time::interval(self.ping_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match node.client.call::<_, Void>(methods::PING, &Void {}).await {
                        Ok(_) => trace!("Node '{}' answered ping", node.identifier),
                        Err(e) if e.is_transport() => {
                            warn!("Node '{}' stopped answering: {}", node.identifier, e);
                            break;
                        }
                        Err(e) => warn!("Node '{}' ping failed: {}", node.identifier, e),
                    }
                }
                _ = node.client.closed() => {
                    info!("Node '{}' disconnected", node.identifier);
                    break;
                }
            }
        }

        self.detach(&node).await;
    }

    /// Drop the managers this link registered. Managers from a newer link
    /// of the same node stay registered.
    async fn detach(&self, node: &AttachedNode) {
        for manager in &node.managers {
            if !self.coordinator.unregister_manager_instance(manager).await {
                debug!("{} was already replaced by a newer link", manager.name());
            }
        }
        node.client.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_agent::send_registration;
    use crate::node_service::NodeService;
    use hub_device::test_utils::localhost;
    use hub_device::drivers::macos::HOST_DEVICE_ID;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn ws_pair() -> (
        WebSocketStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let node = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let controller = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (node, controller)
    }

    fn registration(managers: &[&str]) -> RegisterNode {
        RegisterNode {
            identifier: "lab-1".to_string(),
            hostname: "lab-1.local".to_string(),
            managers: managers.iter().map(|m| m.to_string()).collect(),
        }
    }

    fn listener(coordinator: Arc<SessionCoordinator>) -> NodeListener {
        let rpc = RpcSettings {
            call_timeout_secs: 5,
            ping_interval_secs: 1,
            ping_timeout_secs: 5,
        };
        NodeListener::new(coordinator, &rpc)
    }

    /// Node end: register, then serve a macOS manager
    async fn spawn_node(
        mut ws: WebSocketStream<tokio::io::DuplexStream>,
        managers: &[&str],
    ) -> tokio::task::JoinHandle<crate::node_service::ServeEnd> {
        send_registration(&mut ws, &registration(managers))
            .await
            .unwrap();
        let service = Arc::new(NodeService::new([Arc::new(DeviceManager::macos(
            localhost(),
        ))]));
        tokio::spawn(service.serve(ws, Duration::from_secs(30)))
    }

    #[tokio::test]
    async fn test_attach_registers_remote_managers() {
        let coordinator = Arc::new(SessionCoordinator::new(localhost()));
        let (node_ws, controller_ws) = ws_pair().await;
        let _node = spawn_node(node_ws, &["macos"]).await;

        let node = listener(coordinator.clone()).attach(controller_ws).await.unwrap();
        assert_eq!(node.identifier, "lab-1");
        assert_eq!(node.manager_names(), vec!["lab-1/macos"]);

        let managers = coordinator.managers().await;
        assert_eq!(managers.len(), 1);
        assert!(managers[0].is_remote());

        // The initial refresh pulled the node's inventory
        let device = coordinator.find_device(HOST_DEVICE_ID).await.unwrap();
        assert!(device.state().is_booted());
    }

    #[tokio::test]
    async fn test_unknown_announced_manager_is_skipped() {
        let coordinator = Arc::new(SessionCoordinator::new(localhost()));
        let (node_ws, controller_ws) = ws_pair().await;
        let _node = spawn_node(node_ws, &["macos", "windows"]).await;

        let node = listener(coordinator.clone()).attach(controller_ws).await.unwrap();
        assert_eq!(node.manager_names(), vec!["lab-1/macos"]);
    }

    #[tokio::test]
    async fn test_garbage_registration_is_rejected() {
        use futures_util::SinkExt;
        use tokio_tungstenite::tungstenite::Message as WsMessage;

        let coordinator = Arc::new(SessionCoordinator::new(localhost()));
        let (mut node_ws, controller_ws) = ws_pair().await;
        node_ws
            .send(WsMessage::Text("hello".into()))
            .await
            .unwrap();

        let err = listener(coordinator.clone())
            .attach(controller_ws)
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert!(coordinator.managers().await.is_empty());
    }

    #[tokio::test]
    async fn test_node_loss_unregisters_managers() {
        let coordinator = Arc::new(SessionCoordinator::new(localhost()));
        let (node_ws, controller_ws) = ws_pair().await;
        let node_task = spawn_node(node_ws, &["macos"]).await;

        let listener = listener(coordinator.clone());
        let node = listener.attach(controller_ws).await.unwrap();
        assert_eq!(coordinator.managers().await.len(), 1);

        node_task.abort();
        tokio::time::timeout(Duration::from_secs(10), listener.supervise(node))
            .await
            .unwrap();
        assert!(coordinator.managers().await.is_empty());
    }

    #[tokio::test]
    async fn test_stale_link_loss_keeps_reregistered_managers() {
        let coordinator = Arc::new(SessionCoordinator::new(localhost()));
        let listener = listener(coordinator.clone());

        let (old_node_ws, old_controller_ws) = ws_pair().await;
        let old_node_task = spawn_node(old_node_ws, &["macos"]).await;
        let old = listener.attach(old_controller_ws).await.unwrap();

        // The node redials before the controller noticed the old link drop
        let (new_node_ws, new_controller_ws) = ws_pair().await;
        let _new_node_task = spawn_node(new_node_ws, &["macos"]).await;
        let new = listener.attach(new_controller_ws).await.unwrap();
        assert_eq!(coordinator.managers().await.len(), 1);

        old_node_task.abort();
        tokio::time::timeout(Duration::from_secs(10), listener.supervise(old))
            .await
            .unwrap();

        let managers = coordinator.managers().await;
        assert_eq!(managers.len(), 1);
        assert!(Arc::ptr_eq(&managers[0], &new.managers[0]));
        assert!(new.client.is_open());
        assert!(coordinator.find_device(HOST_DEVICE_ID).await.is_some());
    }
}
