//! Node wire protocol: RPC frames and the client-side codec.
//!
//! One WebSocket text message carries exactly one frame.
//!
//! ```text
//! request:  {"method": "RPCNode.StartApp", "params": [ {...} ], "id": 7}
//! response: {"id": 7, "result": {...}, "error": null}
//! ```
//!
//! Responses do not repeat the method name. The [`ClientCodec`] keeps the
//! pending table (`id -> method`) and rebuilds a full [`RpcResponse`] for
//! every frame it reads.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use hub_core::prelude::*;

/// Error text substituted for an empty error string on the wire
pub const UNSPECIFIED_ERROR: &str = "unspecified error";

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Request frame. `params` always holds exactly one positional value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub method: String,
    pub params: Vec<Value>,
    pub id: u64,
}

impl RequestFrame {
    pub fn new(id: u64, method: impl Into<String>, param: Value) -> Self {
        Self {
            method: method.into(),
            params: vec![param],
            id,
        }
    }

    /// The single positional argument (`null` when the sender left it out)
    pub fn param(&self) -> Value {
        self.params.first().cloned().unwrap_or(Value::Null)
    }
}

/// Response frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl ResponseFrame {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(Value::String(message.into())),
        }
    }
}

/// Reply channel handed to the caller waiting on one request
pub type ReplySender = oneshot::Sender<Result<Value>>;

// ---------------------------------------------------------------------------
// Client codec
// ---------------------------------------------------------------------------

/// Response record rebuilt from the pending table
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub id: u64,
    /// Method name recovered from the pending table
    pub method: String,
    pub result: Option<Value>,
    /// Normalized error text; `None` means success
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(message) => Err(Error::remote(self.method, message)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// A decoded response matched to the caller waiting on it
#[derive(Debug)]
pub struct Completion {
    pub response: RpcResponse,
    reply: ReplySender,
}

impl Completion {
    /// Hand the response to its caller. Returns `false` if the caller
    /// stopped waiting.
    pub fn deliver(self) -> bool {
        self.reply.send(self.response.into_result()).is_ok()
    }
}

struct PendingCall {
    method: String,
    sent_at: Instant,
    reply: ReplySender,
}

/// Pending table plus frame encoding/decoding for the calling side of a
/// node connection.
///
/// Not synchronized on its own; the owner wraps it in a mutex so that
/// recording an entry and decoding a response never interleave.
#[derive(Default)]
pub struct ClientCodec {
    pending: HashMap<u64, PendingCall>,
}

impl ClientCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id -> method` and encode the request frame.
    ///
    /// The entry exists before the frame leaves, so a fast response can
    /// always be matched. If encoding fails the entry is removed again.
    pub fn write_request(
        &mut self,
        id: u64,
        method: &str,
        param: Value,
        reply: ReplySender,
    ) -> Result<String> {
        if self.pending.contains_key(&id) {
            return Err(Error::transport(format!("request id {id} is already pending")));
        }

        self.pending.insert(
            id,
            PendingCall {
                method: method.to_string(),
                sent_at: Instant::now(),
                reply,
            },
        );

        match serde_json::to_string(&RequestFrame::new(id, method, param)) {
            Ok(text) => Ok(text),
            Err(e) => {
                self.pending.remove(&id);
                Err(e.into())
            }
        }
    }

    /// Decode one response frame and claim its pending entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] when the frame is malformed or names an
    /// id with no pending entry. Such a frame is never delivered to anyone.
    /// A frame that carries neither a result nor an error fails its caller
    /// with a transport error as well.
    pub fn read_response(&mut self, text: &str) -> Result<Completion> {
        let frame: ResponseFrame = serde_json::from_str(text)
            .map_err(|e| Error::transport(format!("malformed response frame: {e}")))?;

        let call = self.pending.remove(&frame.id).ok_or_else(|| {
            Error::transport(format!("response for unknown request id {}", frame.id))
        })?;

        let error = match (frame.error, &frame.result) {
            (Some(Value::String(message)), _) if message.is_empty() => {
                Some(UNSPECIFIED_ERROR.to_string())
            }
            (Some(Value::String(message)), _) => Some(message),
            (Some(Value::Null), Some(_)) | (None, Some(_)) => None,
            (Some(Value::Null), None) | (None, None) => {
                let message = format!(
                    "invalid response to {} (id {}): neither result nor error",
                    call.method, frame.id
                );
                let _ = call.reply.send(Err(Error::transport(message.clone())));
                return Err(Error::transport(message));
            }
            (Some(other), _) => Some(other.to_string()),
        };

        Ok(Completion {
            response: RpcResponse {
                id: frame.id,
                method: call.method,
                result: frame.result,
                error,
            },
            reply: call.reply,
        })
    }

    /// Drop a pending entry without notifying its caller
    pub fn abandon(&mut self, id: u64) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Fail every pending call with a transport error and clear the table.
    ///
    /// Returns the number of calls that were failed.
    pub fn fail_all(&mut self, reason: &str) -> usize {
        let count = self.pending.len();
        for (id, call) in self.pending.drain() {
            debug!("Failing pending {} (id {}): {}", call.method, id, reason);
            let _ = call.reply.send(Err(Error::transport(format!(
                "{} (id {id}): {reason}",
                call.method
            ))));
        }
        count
    }

    /// Fail calls that have been pending longer than `deadline`.
    ///
    /// Returns the ids that were purged.
    pub fn purge_expired(&mut self, deadline: Duration) -> Vec<u64> {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, call)| now.duration_since(call.sent_at) > deadline)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(call) = self.pending.remove(id) {
                let _ = call.reply.send(Err(Error::transport(format!(
                    "{} (id {id}): no response within {deadline:?}",
                    call.method
                ))));
            }
        }

        expired
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Method name recorded for `id`, if still pending
    pub fn pending_method(&self, id: u64) -> Option<&str> {
        self.pending.get(&id).map(|call| call.method.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
