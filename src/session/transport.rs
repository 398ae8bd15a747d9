//! Duplex text transport
//!
//! A connected transport is a pair of Tokio channels: frames the session wants
//! to send, and events the remote side produced. The WebSocket implementation
//! bridges those channels to a socket with one reader and one writer task.

use crate::error::AgentError;
use crate::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const CHANNEL_CAPACITY: usize = 64;

/// Frame queued for transmission
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Close,
}

/// Something the remote side did
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Text(String),
    Closed,
}

/// Both halves of an established connection
pub struct TransportLink {
    pub outbound: mpsc::Sender<OutboundFrame>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

impl TransportLink {
    /// Create a link plus the far ends of its channels.
    pub fn pair() -> (Self, mpsc::Receiver<OutboundFrame>, mpsc::Sender<TransportEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self {
                outbound: outbound_tx,
                inbound: inbound_rx,
            },
            outbound_rx,
            inbound_tx,
        )
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<TransportLink>;
}

/// WebSocket transport over `tokio-tungstenite`
#[derive(Debug, Default, Clone)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<TransportLink> {
        info!(%url, "Connecting to agent WebSocket");

        let (ws_stream, _) = connect_async(url).await.map_err(|e| {
            AgentError::Transport(format!("Failed to connect to {}: {}", url, e))
        })?;

        let (mut write, mut read) = ws_stream.split();
        let (link, mut outbound_rx, inbound_tx) = TransportLink::pair();

        // Writer task: drains queued frames into the socket
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let result = match frame {
                    OutboundFrame::Text(text) => write.send(Message::Text(text)).await,
                    OutboundFrame::Close => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = result {
                    warn!(error = %e, "WebSocket write failed");
                    break;
                }
            }
            let _ = write.close().await;
            debug!("WebSocket writer finished");
        });

        // Reader task: forwards text frames, reports closure exactly once
        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(TransportEvent::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        info!("WebSocket closed by remote");
                        break;
                    }
                    Ok(_) => {} // Ignore pings, pongs, binary
                    Err(e) => {
                        error!(error = %e, "WebSocket error");
                        break;
                    }
                }
            }
            let _ = inbound_tx.send(TransportEvent::Closed).await;
        });

        info!(%url, "WebSocket connected");
        Ok(link)
    }
}
