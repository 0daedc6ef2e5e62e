//! Message channels between a negotiation engine and the room coordinator.
//!
//! A transport only sends. Messages coming back from the coordinator are delivered through the
//! receiver handed out together with the transport when it connects, so that every engine gets
//! its own explicitly constructed channel pair.

use crate::coordinator::Coordinator;
use crate::error::Error;
use crate::signal::{ClientMessage, ConnectionId, ServerMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[async_trait]
pub trait SignalTransport: Send + Sync {
    async fn send(&self, msg: ClientMessage) -> Result<(), Error>;
}

/// Transport to a coordinator living in the same process. Dropping it disconnects.
pub struct LocalTransport {
    coordinator: Coordinator,
    id: ConnectionId,
}

impl LocalTransport {
    pub fn connect(coordinator: &Coordinator) -> (Self, UnboundedReceiver<ServerMessage>) {
        let (id, inbox) = coordinator.register();
        let transport = LocalTransport {
            coordinator: coordinator.clone(),
            id,
        };
        (transport, inbox)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

#[async_trait]
impl SignalTransport for LocalTransport {
    async fn send(&self, msg: ClientMessage) -> Result<(), Error> {
        self.coordinator.handle(self.id, msg);
        Ok(())
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.coordinator.disconnect(self.id);
    }
}

/// JSON over WebSocket transport to a remote coordinator.
#[derive(Debug, Clone)]
pub struct WsTransport {
    outgoing: UnboundedSender<ClientMessage>,
}

impl WsTransport {
    pub async fn connect(url: &str) -> Result<(Self, UnboundedReceiver<ServerMessage>), Error> {
        let (ws_stream, _) = connect_async(url).await.map_err(Error::transport)?;
        let (mut write, mut read) = ws_stream.split();

        let (incoming_tx, incoming_rx) = unbounded_channel();
        let (outgoing_tx, mut outgoing_rx) = unbounded_channel::<ClientMessage>();

        // outgoing messages
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if let Err(e) = write.send(Message::Text(json)).await {
                            log::warn!("websocket send failed: {}", e);
                            break;
                        }
                    }
                    Err(e) => log::warn!("failed to serialize {}: {}", msg.name(), e),
                }
            }
            let _ = write.close().await;
        });

        // incoming messages
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => {
                            if incoming_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("dropping malformed message from coordinator: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("websocket receive failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok((
            WsTransport {
                outgoing: outgoing_tx,
            },
            incoming_rx,
        ))
    }
}

#[async_trait]
impl SignalTransport for WsTransport {
    async fn send(&self, msg: ClientMessage) -> Result<(), Error> {
        self.outgoing
            .send(msg)
            .map_err(|e| Error::transport(format!("websocket writer is gone: {}", e)))
    }
}
