//! Socket transport abstraction.
//!
//! The engine talks to the gateway through a [`Link`]: an outbound channel of
//! frame strings and an inbound channel of [`SocketEvent`]s. Dialing is
//! behind the [`Transport`] trait so tests can substitute a scripted
//! transport and drive both ends of the conversation without a network.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use gatelink_core::{ClientError, Result};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;
use url::Url;

// ----------------------------------------------------------------------------
// Link Types
// ----------------------------------------------------------------------------

/// Something the socket told us.
#[derive(Debug)]
pub enum SocketEvent {
    /// A complete text frame arrived
    Frame(String),
    /// The socket is gone; no more frames will arrive
    Closed { reason: String },
}

/// A live socket, seen as a pair of channel endpoints.
///
/// Dropping the link tears the socket down: the writer task ends when the
/// outbound sender goes away, and the reader task ends when its events stop
/// being received.
#[derive(Debug)]
pub struct Link {
    /// Outbound frames, already serialized
    pub tx: mpsc::UnboundedSender<String>,
    /// Inbound frames and the final close notification
    pub rx: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Dials a gateway URL and produces a [`Link`].
#[async_trait]
pub trait Transport: Send {
    async fn open(&mut self, url: &str) -> Result<Link>;
}

// ----------------------------------------------------------------------------
// WebSocket Transport
// ----------------------------------------------------------------------------

/// Production transport over tokio-tungstenite.
#[derive(Debug, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&mut self, url: &str) -> Result<Link> {
        let url = Url::parse(url)
            .map_err(|e| ClientError::config_error(format!("invalid gateway url: {e}")))?;
        let (socket, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::transport_failed(e.to_string()))?;
        debug!(%url, "websocket open");

        let (mut sink, mut stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<SocketEvent>();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if event_tx.send(SocketEvent::Frame(text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by gateway".to_string());
                    }
                    // Pings are answered by tungstenite itself; binary frames
                    // are not part of this protocol.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "socket closed".to_string(),
                }
            };
            let _ = event_tx.send(SocketEvent::Closed { reason });
        });

        Ok(Link {
            tx: out_tx,
            rx: event_rx,
        })
    }
}
