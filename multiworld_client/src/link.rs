// WebSocket link to the relay.
//
// Two small object-safe traits form the seam between the connection manager
// and the network:
// - `RelayConnector::open()` dials the relay and returns a live link.
// - `RelayLink` sends text frames, yields the next inbound event, and closes
//   with a code and reason.
//
// `WsConnector`/`WsLink` implement them over tokio-tungstenite. Tests swap in
// channel-backed links so the connection manager can be driven without a
// socket.
//
// A link never reports errors from `next_event()`: read failures and a
// stream that simply ends both surface as `LinkEvent::Closed` with no
// reason, which the connection manager treats as transient. Only a close
// frame with a non-empty reason is terminal.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use crate::error::TransportError;

/// How a link ended.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: Option<u16>,
    pub reason: String,
}

impl CloseInfo {
    /// A close with no explanation (dropped connection, empty close frame).
    pub fn transient() -> Self {
        Self::default()
    }

    /// The relay closes with a reason only when it does not want us back.
    pub fn is_terminal(&self) -> bool {
        !self.reason.trim().is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Frame(String),
    Closed(CloseInfo),
}

/// An open connection to the relay.
#[async_trait]
pub trait RelayLink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Next inbound frame or the close. After `Closed`, the link is dead.
    async fn next_event(&mut self) -> LinkEvent;

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// Opens relay links.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn RelayLink>, TransportError>;
}

/// tokio-tungstenite connector.
#[derive(Clone, Debug)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl RelayConnector for WsConnector {
    async fn open(&self, url: &str) -> Result<Box<dyn RelayLink>, TransportError> {
        let (stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                url: url.to_owned(),
            })?
            .map_err(|e| TransportError::Connect {
                url: url.to_owned(),
                reason: e.to_string(),
            })?;
        debug!(%url, "relay socket open");
        Ok(Box::new(WsLink { stream }))
    }
}

pub struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl RelayLink for WsLink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.stream.send(Message::text(text)).await?;
        Ok(())
    }

    async fn next_event(&mut self) -> LinkEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return LinkEvent::Frame(text.to_string()),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return LinkEvent::Frame(text),
                    Err(_) => warn!(len = bytes.len(), "ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    return LinkEvent::Closed(match frame {
                        Some(frame) => CloseInfo {
                            code: Some(u16::from(frame.code)),
                            reason: frame.reason.to_string(),
                        },
                        None => CloseInfo::transient(),
                    });
                }
                // Ping/pong are answered by tungstenite.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "relay socket read failed");
                    return LinkEvent::Closed(CloseInfo::transient());
                }
                None => return LinkEvent::Closed(CloseInfo::transient()),
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        self.stream
            .close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_owned().into(),
            }))
            .await?;
        Ok(())
    }
}
