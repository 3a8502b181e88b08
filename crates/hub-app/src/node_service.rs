//! Node side of the node transport: serves `RPCNode.*` calls against the
//! node's local device managers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use hub_core::prelude::*;
use hub_device::{Device, DeviceManager};
use hub_node::messages::{
    methods, AppRequest, BoolResponse, DeviceRequest, DevicesResponse, ManagerRequest,
    RecordingRequest, RemoteDevice, StartAppRequest, TimeoutResponse, Void,
};
use hub_node::{next_text, RequestFrame, ResponseFrame};

const RESPONSE_CHANNEL_CAPACITY: usize = 64;

/// Why a served connection ended
#[derive(Debug)]
pub enum ServeEnd {
    /// The controller closed the connection
    Closed,
    /// No ping arrived within the watchdog window
    PingTimeout,
    Failed(Error),
}

/// Dispatches node RPC calls to local managers, keyed by manager name
#[derive(Debug, Default)]
pub struct NodeService {
    managers: HashMap<String, Arc<DeviceManager>>,
}

impl NodeService {
    pub fn new(managers: impl IntoIterator<Item = Arc<DeviceManager>>) -> Self {
        Self {
            managers: managers
                .into_iter()
                .map(|m| (m.name().to_string(), m))
                .collect(),
        }
    }

    /// Manager names announced on registration
    pub fn manager_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.managers.keys().cloned().collect();
        names.sort();
        names
    }

    fn manager(&self, name: &str) -> Result<&Arc<DeviceManager>> {
        self.managers
            .get(name)
            .ok_or_else(|| Error::invalid_state(format!("node has no manager '{name}'")))
    }

    async fn device(&self, manager: &str, device_id: &str) -> Result<Arc<Device>> {
        self.manager(manager)?.get_device(device_id).await
    }

    /// Answer one request frame
    pub async fn handle(&self, request: RequestFrame) -> ResponseFrame {
        let id = request.id;
        let method = request.method.clone();
        match self.dispatch(&method, request.param()).await {
            Ok(result) => ResponseFrame::success(id, result),
            Err(e) => {
                debug!("{} failed: {}", method, e);
                ResponseFrame::failure(id, e.to_string())
            }
        }
    }

    async fn dispatch(&self, method: &str, param: Value) -> Result<Value> {
        match method {
            methods::PING => reply(Void {}),

            methods::GET_DEVICES => {
                let req: ManagerRequest = decode(param)?;
                let manager = self.manager(&req.manager)?;
                if let Err(e) = manager.refresh_devices().await {
                    warn!("Refresh before GetDevices failed: {}", e);
                }
                let devices = manager
                    .get_devices()
                    .await
                    .into_iter()
                    .map(|d| RemoteDevice {
                        info: d.info().clone(),
                        state: d.state(),
                    })
                    .collect();
                reply(DevicesResponse { devices })
            }

            methods::START_DEVICE => {
                let req: DeviceRequest = decode(param)?;
                self.manager(&req.manager)?
                    .start_device(&req.device_id)
                    .await?;
                reply(Void {})
            }

            methods::STOP_DEVICE => {
                let req: DeviceRequest = decode(param)?;
                self.manager(&req.manager)?
                    .stop_device(&req.device_id)
                    .await?;
                reply(Void {})
            }

            methods::IS_APP_INSTALLED => {
                let req: AppRequest = decode(param)?;
                let device = self.device(&req.manager, &req.device_id).await?;
                reply(BoolResponse {
                    value: device.is_app_installed(&req.app).await,
                })
            }

            methods::INSTALL_APP => {
                let req: AppRequest = decode(param)?;
                let device = self.device(&req.manager, &req.device_id).await?;
                device.install_app(&req.app).await?;
                reply(Void {})
            }

            methods::UNINSTALL_APP => {
                let req: AppRequest = decode(param)?;
                let device = self.device(&req.manager, &req.device_id).await?;
                device.uninstall_app(&req.app.identifier).await?;
                reply(Void {})
            }

            methods::START_APP => {
                let req: StartAppRequest = decode(param)?;
                let device = self.device(&req.manager, &req.device_id).await?;
                device
                    .start_app(&req.app, &req.session_id, req.host_ip)
                    .await?;
                reply(Void {})
            }

            methods::STOP_APP => {
                let req: AppRequest = decode(param)?;
                let device = self.device(&req.manager, &req.device_id).await?;
                device.stop_app(&req.app).await?;
                reply(Void {})
            }

            methods::IS_CONNECTED => {
                let req: DeviceRequest = decode(param)?;
                let device = self.device(&req.manager, &req.device_id).await?;
                reply(BoolResponse {
                    value: device.is_app_connected().await,
                })
            }

            methods::CONNECTION_TIMEOUT => {
                let req: DeviceRequest = decode(param)?;
                let device = self.device(&req.manager, &req.device_id).await?;
                let timeout = device.connection_timeout().await;
                reply(TimeoutResponse {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }

            methods::START_RECORDING => {
                let req: RecordingRequest = decode(param)?;
                let device = self.device(&req.manager, &req.device_id).await?;
                device.start_recording(&req.path).await?;
                reply(Void {})
            }

            methods::STOP_RECORDING => {
                let req: DeviceRequest = decode(param)?;
                let device = self.device(&req.manager, &req.device_id).await?;
                device.stop_recording().await?;
                reply(Void {})
            }

            other => Err(Error::invalid_state(format!("rpc: can't find method {other}"))),
        }
    }

    /// Serve request frames on `ws` until it closes or the ping watchdog
    /// fires.
    ///
    /// Each request runs on its own task; responses go out through one
    /// writer task in completion order.
    pub async fn serve<S>(
        self: Arc<Self>,
        ws: WebSocketStream<S>,
        ping_timeout: Duration,
    ) -> ServeEnd
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (response_tx, mut response_rx) = mpsc::channel::<String>(RESPONSE_CHANNEL_CAPACITY);

        let writer = tokio::spawn(async move {
            while let Some(text) = response_rx.recv().await {
                if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                    warn!("Failed to write node response: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let watchdog = tokio::time::sleep(ping_timeout);
        tokio::pin!(watchdog);

        let end = loop {
            tokio::select! {
                _ = &mut watchdog => break ServeEnd::PingTimeout,

                frame = next_text(&mut stream) => {
                    let text = match frame {
                        None => break ServeEnd::Closed,
                        Some(Err(e)) => break ServeEnd::Failed(e),
                        Some(Ok(text)) => text,
                    };

                    let request: RequestFrame = match serde_json::from_str(&text) {
                        Ok(request) => request,
                        Err(e) => {
                            warn!("Dropping malformed request frame: {}", e);
                            continue;
                        }
                    };

                    if request.method == methods::PING {
                        watchdog.as_mut().reset(Instant::now() + ping_timeout);
                    }
                    trace!("<- {} (id {})", request.method, request.id);

                    let service = self.clone();
                    let response_tx = response_tx.clone();
                    tokio::spawn(async move {
                        let response = service.handle(request).await;
                        match serde_json::to_string(&response) {
                            Ok(text) => {
                                let _ = response_tx.send(text).await;
                            }
                            Err(e) => error!("Failed to encode response {}: {}", response.id, e),
                        }
                    });
                }
            }
        };

        drop(response_tx);
        writer.abort();
        end
    }
}

fn decode<T: DeserializeOwned>(param: Value) -> Result<T> {
    Ok(serde_json::from_value(param)?)
}

fn reply<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}
