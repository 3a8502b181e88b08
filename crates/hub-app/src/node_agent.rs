//! Node process side of the link: dial the controller, announce this node's
//! managers, then serve RPC calls until the link dies, and dial again.

use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, WebSocketStream};

use hub_core::prelude::*;
use hub_node::messages::RegisterNode;

use crate::config::Settings;
use crate::node_service::{NodeService, ServeEnd};

/// First redial delay
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Redial delay cap
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Dials the controller and keeps the node registered
#[derive(Debug)]
pub struct NodeAgent {
    master_url: String,
    registration: RegisterNode,
    service: Arc<NodeService>,
    ping_timeout: Duration,
}

impl NodeAgent {
    pub fn new(settings: &Settings, service: Arc<NodeService>) -> Self {
        let registration = RegisterNode {
            identifier: settings.node.resolved_identifier(),
            hostname: settings.node.resolved_hostname(),
            managers: service.manager_names(),
        };

        Self {
            master_url: settings.node.master_url.clone(),
            registration,
            service,
            ping_timeout: settings.rpc.ping_timeout(),
        }
    }

    pub fn registration(&self) -> &RegisterNode {
        &self.registration
    }

    /// One link: dial, register, serve until it ends
    pub async fn connect_once(&self) -> Result<ServeEnd> {
        let (mut ws, _response) = connect_async(self.master_url.as_str())
            .await
            .map_err(|e| Error::transport(format!("dial {}: {e}", self.master_url)))?;

        send_registration(&mut ws, &self.registration).await?;
        info!(
            "Registered with {} as '{}' ({})",
            self.master_url,
            self.registration.identifier,
            self.registration.managers.join(", ")
        );

        Ok(Arc::clone(&self.service)
            .serve(ws, self.ping_timeout)
            .await)
    }

    /// Keep the node registered until `shutdown` flips to `true`.
    ///
    /// Failed dials back off exponentially; a link that registered resets
    /// the backoff.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let outcome = tokio::select! {
                outcome = self.connect_once() => outcome,
                _ = shutdown.changed() => break,
            };

            match outcome {
                Ok(ServeEnd::Closed) => {
                    info!("Controller closed the link");
                    attempt = 0;
                }
                Ok(ServeEnd::PingTimeout) => {
                    warn!(
                        "No ping from controller for {:?}, redialing",
                        self.ping_timeout
                    );
                    attempt = 0;
                }
                Ok(ServeEnd::Failed(e)) => {
                    warn!("Link to controller failed: {}", e);
                    attempt = 0;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    warn!("{} (attempt {})", e, attempt);
                }
            }

            let backoff = compute_backoff(attempt);
            debug!("Redialing {} in {:?}", self.master_url, backoff);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("Node agent stopped");
    }
}

/// Send the registration frame that opens every link
pub async fn send_registration<S>(
    ws: &mut WebSocketStream<S>,
    registration: &RegisterNode,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text = serde_json::to_string(registration)?;
    ws.send(WsMessage::Text(text.into()))
        .await
        .map_err(|e| Error::transport(format!("send registration: {e}")))
}

/// `INITIAL_BACKOFF * 2^(n-1)` capped at `MAX_BACKOFF`; attempt 0 redials
/// after the initial delay.
fn compute_backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let multiplier: u64 = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    let secs = INITIAL_BACKOFF.as_secs().saturating_mul(multiplier);
    Duration::from_secs(secs.min(MAX_BACKOFF.as_secs()))
}
