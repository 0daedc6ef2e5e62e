//! WebSocket front end of the [Coordinator].
//!
//! Each accepted socket becomes one coordinator connection. Text frames carry JSON encoded
//! [ClientMessage]s in and [ServerMessage]s out; a dedicated writer task drains the connection's
//! outbox so that messages reach the socket in the order the coordinator produced them.

use crate::coordinator::Coordinator;
use crate::error::Error;
use crate::signal::{ClientMessage, ConnectionId, ServerMessage};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8000";

/// How long a closing connection may take to flush messages still queued for it.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: SocketAddr::from(([0, 0, 0, 0], 8000)),
        }
    }
}

pub struct SignalingServer {
    config: ServerConfig,
    coordinator: Coordinator,
    shutdown: CancellationToken,
}

impl SignalingServer {
    pub fn new(config: ServerConfig) -> Self {
        SignalingServer {
            config,
            coordinator: Coordinator::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Token which stops [SignalingServer::run] and every connection it accepted once cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), Error> {
        let listener = TcpListener::bind(self.config.listen)
            .await
            .map_err(Error::transport)?;
        log::info!("signaling server listening on {}", self.config.listen);
        self.serve(listener).await
    }

    /// Serves connections accepted from an already bound `listener` until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Error> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    log::info!("signaling server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, addr) = accepted.map_err(Error::transport)?;
                    let coordinator = self.coordinator.clone();
                    let shutdown = self.shutdown.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(coordinator, stream, addr, shutdown).await {
                            log::warn!("connection from {} failed: {}", addr, e);
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    coordinator: Coordinator,
    stream: TcpStream,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let ws_stream = accept_async(stream).await.map_err(Error::transport)?;
    let (id, outbox) = coordinator.register();
    log::info!("{} connected from {}", id, addr);

    let (write, read) = ws_stream.split();
    let mut writer = tokio::spawn(write_outbox(id, write, outbox));
    let res = read_frames(&coordinator, id, read, shutdown).await;

    // drops every sender of the outbox, so the writer ends once it has flushed what is queued
    coordinator.disconnect(id);
    if timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        log::debug!("{} did not drain its outbox in time", id);
        writer.abort();
    }
    log::info!("{} disconnected", id);
    res
}

async fn write_outbox(
    id: ConnectionId,
    mut write: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut outbox: UnboundedReceiver<ServerMessage>,
) {
    while let Some(msg) = outbox.recv().await {
        let json = match serde_json::to_string(&msg) {
            Ok(json) => json,
            Err(e) => {
                log::warn!("failed to serialize message for {}: {}", id, e);
                continue;
            }
        };
        if let Err(e) = write.send(Message::Text(json)).await {
            log::debug!("failed to write to {}: {}", id, e);
            return;
        }
    }
    let _ = write.close().await;
}

async fn read_frames(
    coordinator: &Coordinator,
    id: ConnectionId,
    mut read: SplitStream<WebSocketStream<TcpStream>>,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = read.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => {
                    log::trace!("{} sent {}", id, msg.name());
                    coordinator.handle(id, msg);
                }
                Err(e) => log::warn!("dropping malformed message from {}: {}", id, e),
            },
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(Error::transport(e)),
        }
    }
}
