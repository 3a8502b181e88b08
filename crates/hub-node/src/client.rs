//! RPC client for one node connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        NodeClient (Clone)                     │
//! │                                                               │
//! │  call() ──cmd──▶ ┌──────────────────────────────────────┐     │
//! │                  │  Background I/O task                  │     │
//! │  call() ──cmd──▶ │  - record + encode (codec lock)       │     │
//! │                  │  - write frame                        │     │
//! │  ◀──oneshot───── │  - read frame, claim entry, deliver   │     │
//! │                  │  - purge expired entries              │     │
//! │                  └──────────────────────────────────────┘     │
//! │                                                               │
//! │  ClientCodec (Arc<Mutex>): pending table id -> method         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every caller blocks only on its own reply channel. When the connection
//! drops, every pending call fails with [`Error::Transport`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use hub_core::prelude::*;

use crate::protocol::{ClientCodec, ReplySender};

/// Capacity of the command channel between callers and the I/O task
const CMD_CHANNEL_CAPACITY: usize = 64;

/// How often the I/O task sweeps the pending table for expired calls
const PURGE_INTERVAL: Duration = Duration::from_secs(1);

/// Default per-call deadline
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Whether the underlying connection is still usable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Open,
    Closed,
}

/// Internal messages sent from [`NodeClient`] handles to the I/O task
enum ClientCommand {
    Call {
        id: u64,
        method: String,
        param: Value,
        reply: ReplySender,
    },
    Close,
}

/// Clonable handle to one node connection
#[derive(Clone)]
pub struct NodeClient {
    cmd_tx: mpsc::Sender<ClientCommand>,
    codec: Arc<Mutex<ClientCodec>>,
    next_id: Arc<AtomicU64>,
    state_rx: watch::Receiver<TransportState>,
    call_timeout: Duration,
}

impl std::fmt::Debug for NodeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeClient")
            .field("state", &*self.state_rx.borrow())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl NodeClient {
    /// Wrap an established WebSocket and spawn its I/O task
    pub fn new<S>(ws: WebSocketStream<S>, call_timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(TransportState::Open);
        let codec = Arc::new(Mutex::new(ClientCodec::new()));

        tokio::spawn(run_io_loop(
            ws,
            cmd_rx,
            Arc::clone(&codec),
            state_tx,
            call_timeout,
        ));

        Self {
            cmd_tx,
            codec,
            next_id: Arc::new(AtomicU64::new(1)),
            state_rx,
            call_timeout,
        }
    }

    /// Invoke `method` with one positional parameter and decode the result.
    ///
    /// # Errors
    ///
    /// - [`Error::Transport`] if the connection is closed, drops while the
    ///   call is pending, or no response arrives within the call deadline.
    /// - [`Error::RemoteInvocation`] if the node answered with an error.
    /// - [`Error::Json`] if the result does not match `R`.
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if !self.is_open() {
            return Err(Error::transport(format!("{method}: connection is closed")));
        }

        let param = serde_json::to_value(params)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();

        self.cmd_tx
            .send(ClientCommand::Call {
                id,
                method: method.to_string(),
                param,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::transport(format!("{method}: connection is closed")))?;

        let value = match tokio::time::timeout(self.call_timeout, reply_rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(Error::transport(format!(
                    "{method}: connection dropped before a response arrived"
                )))
            }
            Err(_) => {
                self.lock_codec().abandon(id);
                return Err(Error::transport(format!(
                    "{method}: no response within {:?}",
                    self.call_timeout
                )));
            }
        };

        Ok(serde_json::from_value(value)?)
    }

    /// Number of calls currently waiting for a response
    pub fn pending_count(&self) -> usize {
        self.lock_codec().len()
    }

    pub fn is_open(&self) -> bool {
        *self.state_rx.borrow() == TransportState::Open
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        let mut rx = self.state_rx.clone();
        let _ = rx.wait_for(|state| *state == TransportState::Closed).await;
    }

    /// Ask the I/O task to send a Close frame and stop
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(ClientCommand::Close).await;
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    fn lock_codec(&self) -> std::sync::MutexGuard<'_, ClientCodec> {
        self.codec.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Background I/O task
// ---------------------------------------------------------------------------

async fn run_io_loop<S>(
    ws: WebSocketStream<S>,
    mut cmd_rx: mpsc::Receiver<ClientCommand>,
    codec: Arc<Mutex<ClientCodec>>,
    state_tx: watch::Sender<TransportState>,
    call_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sink, mut ws_stream) = ws.split();

    let mut purge_interval = tokio::time::interval(PURGE_INTERVAL);
    purge_interval.tick().await;

    let reason = loop {
        tokio::select! {
            frame = ws_stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_response_text(text.as_str(), &codec);
                    }
                    Some(Ok(WsMessage::Close(_))) => break "connection closed by node",
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("Node transport read error: {}", err);
                        break "connection read error";
                    }
                    None => break "connection ended",
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ClientCommand::Call { id, method, param, reply }) => {
                        let encoded = lock(&codec).write_request(id, &method, param, reply);
                        match encoded {
                            Ok(text) => {
                                trace!("-> {} (id {})", method, id);
                                if let Err(err) = ws_sink.send(WsMessage::Text(text.into())).await {
                                    warn!("Node transport write error: {}", err);
                                    break "connection write error";
                                }
                            }
                            Err(err) => warn!("Failed to encode {} request: {}", method, err),
                        }
                    }
                    Some(ClientCommand::Close) | None => {
                        let _ = ws_sink.send(WsMessage::Close(None)).await;
                        let _ = ws_sink.close().await;
                        break "connection closed locally";
                    }
                }
            }

            _ = purge_interval.tick() => {
                let expired = lock(&codec).purge_expired(call_timeout);
                if !expired.is_empty() {
                    debug!("Purged {} expired node call(s): {:?}", expired.len(), expired);
                }
            }
        }
    };

    // Mark closed before failing the table so no new call slips in unanswered
    let _ = state_tx.send(TransportState::Closed);
    cmd_rx.close();
    while let Ok(ClientCommand::Call { reply, method, .. }) = cmd_rx.try_recv() {
        let _ = reply.send(Err(Error::transport(format!("{method}: {reason}"))));
    }

    let failed = lock(&codec).fail_all(reason);
    if failed > 0 {
        warn!("Node transport down ({}), failed {} pending call(s)", reason, failed);
    } else {
        info!("Node transport down ({})", reason);
    }
}

fn handle_response_text(text: &str, codec: &Mutex<ClientCodec>) {
    // Decode under the lock, deliver outside it
    let completion = lock(codec).read_response(text);
    match completion {
        Ok(completion) => {
            trace!(
                "<- {} (id {})",
                completion.response.method,
                completion.response.id
            );
            if !completion.deliver() {
                debug!("Caller stopped waiting before its response arrived");
            }
        }
        Err(err) => warn!("Dropping node response: {}", err),
    }
}

fn lock(codec: &Mutex<ClientCodec>) -> std::sync::MutexGuard<'_, ClientCodec> {
    codec.lock().unwrap_or_else(|e| e.into_inner())
}

/// Read the next text frame from a node socket.
///
/// Returns `None` when the stream ends or closes. Non-text frames are skipped.
pub async fn next_text<S>(stream: &mut S) -> Option<Result<String>>
where
    S: Stream<Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    loop {
        match stream.next().await? {
            Ok(WsMessage::Text(text)) => return Some(Ok(text.as_str().to_string())),
            Ok(WsMessage::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => return Some(Err(Error::transport(e.to_string()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RequestFrame, ResponseFrame};
    use serde_json::json;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn ws_pair() -> (
        WebSocketStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (client, server)
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let (client_ws, mut server_ws) = ws_pair().await;
        let client = NodeClient::new(client_ws, Duration::from_secs(5));

        let server = tokio::spawn(async move {
            let text = next_text(&mut server_ws).await.unwrap().unwrap();
            let request: RequestFrame = serde_json::from_str(&text).unwrap();
            assert_eq!(request.method, "RPCNode.IsAppInstalled");
            let response = ResponseFrame::success(request.id, json!({"value": true}));
            server_ws
                .send(WsMessage::Text(serde_json::to_string(&response).unwrap().into()))
                .await
                .unwrap();
            server_ws
        });

        let value: Value = tokio_test::assert_ok!(
            client
                .call("RPCNode.IsAppInstalled", &json!({"deviceId": "x"}))
                .await
        );
        assert_eq!(value, json!({"value": true}));
        assert_eq!(client.pending_count(), 0);

        let _server_ws = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_error_is_remote_invocation() {
        let (client_ws, mut server_ws) = ws_pair().await;
        let client = NodeClient::new(client_ws, Duration::from_secs(5));

        tokio::spawn(async move {
            let text = next_text(&mut server_ws).await.unwrap().unwrap();
            let request: RequestFrame = serde_json::from_str(&text).unwrap();
            let response = ResponseFrame::failure(request.id, "bundle not found");
            server_ws
                .send(WsMessage::Text(serde_json::to_string(&response).unwrap().into()))
                .await
                .unwrap();
            // keep the socket open until the test ends
            let _ = next_text(&mut server_ws).await;
        });

        let err = client
            .call::<_, Value>("RPCNode.StartApp", &json!({}))
            .await
            .unwrap_err();
        match err {
            Error::RemoteInvocation { method, message } => {
                assert_eq!(method, "RPCNode.StartApp");
                assert_eq!(message, "bundle not found");
            }
            other => panic!("expected RemoteInvocation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_deadline_purges_entry() {
        let (client_ws, mut server_ws) = ws_pair().await;
        let client = NodeClient::new(client_ws, Duration::from_millis(100));

        // Node reads but never answers
        tokio::spawn(async move { while next_text(&mut server_ws).await.is_some() {} });

        let err = tokio_test::assert_err!(client.call::<_, Value>("RPCNode.Ping", &json!({})).await);
        assert!(err.is_transport());
        assert_eq!(client.pending_count(), 0);
        assert!(client.is_open());
    }

    #[tokio::test]
    async fn test_calls_after_close_fail_fast() {
        let (client_ws, server_ws) = ws_pair().await;
        let client = NodeClient::new(client_ws, Duration::from_secs(5));

        drop(server_ws);
        client.closed().await;

        let err = client
            .call::<_, Value>("RPCNode.Ping", &json!({}))
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }
}
