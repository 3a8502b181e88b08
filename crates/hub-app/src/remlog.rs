//! Remote log ingestion over UDP.
//!
//! Apps under test send free-form text datagrams to a fixed port. Every
//! datagram is handed to one consumer, synchronously and in arrival order.
//! The service knows nothing about sessions.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use hub_core::prelude::*;

/// Largest UDP payload
const MAX_DATAGRAM: usize = 65_535;

/// One received datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub text: String,
    pub sender: SocketAddr,
    pub received_at: DateTime<Local>,
}

/// Receives log datagrams and forwards them to a consumer
pub struct LogIngestionService;

impl LogIngestionService {
    /// Bind `bind` and start the receive loop.
    ///
    /// Bind errors are returned here, before anything runs in the
    /// background. `consumer` runs on the receive loop: a slow consumer
    /// delays every datagram behind it.
    pub async fn run<F>(bind: SocketAddr, consumer: F) -> Result<LogIngestionHandle>
    where
        F: Fn(LogLine) + Send + Sync + 'static,
    {
        let socket = UdpSocket::bind(bind)
            .await
            .with_context(|| format!("Failed to bind log ingestion on {bind}"))?;
        let local_addr = socket.local_addr()?;
        info!("Log ingestion listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(receive_loop(socket, Arc::new(consumer), shutdown_rx));

        Ok(LogIngestionHandle {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }
}

async fn receive_loop<F>(
    socket: UdpSocket,
    consumer: Arc<F>,
    mut shutdown_rx: oneshot::Receiver<()>,
) where
    F: Fn(LogLine) + Send + Sync + 'static,
{
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("Log ingestion shutting down");
                break;
            }
            received = socket.recv_from(&mut buf) => {
                let (len, sender) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        // e.g. ICMP port unreachable surfaced on some platforms
                        warn!("Log ingestion receive error: {}", e);
                        continue;
                    }
                };

                match std::str::from_utf8(&buf[..len]) {
                    Ok(text) => consumer(LogLine {
                        text: text.to_string(),
                        sender,
                        received_at: Local::now(),
                    }),
                    Err(e) => warn!("Dropping undecodable datagram from {}: {}", sender, e),
                }
            }
        }
    }
}

/// Owns the running service. Dropping it stops the receive loop.
#[derive(Debug)]
pub struct LogIngestionHandle {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl LogIngestionHandle {
    /// The bound address (useful when binding port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the loop and wait for it to finish
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("Log ingestion task ended abnormally: {}", e);
        }
    }
}
