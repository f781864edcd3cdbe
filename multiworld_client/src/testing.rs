// Channel-backed relay links for unit tests.
//
// `ChannelConnector` hands out links whose inbound side is an mpsc channel
// the test feeds, and whose outbound frames (plus close requests, recorded
// as `close:<code>:<reason>`) land in a shared list.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use multiworld_protocol::{ClientMessage, ServerMessage, decode_client_frame, encode_server_frame};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::link::{CloseInfo, LinkEvent, RelayConnector, RelayLink};

struct ChannelLink {
    connection: usize,
    inbound: mpsc::UnboundedReceiver<LinkEvent>,
    sent: Arc<Mutex<Vec<(usize, String)>>>,
}

#[async_trait]
impl RelayLink for ChannelLink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push((self.connection, text));
        Ok(())
    }

    async fn next_event(&mut self) -> LinkEvent {
        match self.inbound.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((self.connection, format!("close:{code}:{reason}")));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct ChannelConnector {
    feeds: Mutex<Vec<mpsc::UnboundedSender<LinkEvent>>>,
    sent: Arc<Mutex<Vec<(usize, String)>>>,
}

impl ChannelConnector {
    pub(crate) fn opened(&self) -> usize {
        self.feeds.lock().unwrap().len()
    }

    pub(crate) fn feed(&self, connection: usize) -> mpsc::UnboundedSender<LinkEvent> {
        self.feeds.lock().unwrap()[connection].clone()
    }

    /// Deliver a relay message on the newest link.
    pub(crate) fn push(&self, message: &ServerMessage) {
        let text = encode_server_frame(message).unwrap();
        let feed = self.feed(self.opened() - 1);
        let _ = feed.send(LinkEvent::Frame(text));
    }

    pub(crate) fn close_latest(&self, reason: &str) {
        let feed = self.feed(self.opened() - 1);
        let _ = feed.send(LinkEvent::Closed(CloseInfo {
            code: Some(1000),
            reason: reason.to_owned(),
        }));
    }

    /// Raw frames in send order, with the link index they went out on.
    pub(crate) fn sent(&self) -> Vec<(usize, String)> {
        self.sent.lock().unwrap().clone()
    }

    /// Decodable client messages, with their link index.
    pub(crate) fn messages(&self) -> Vec<(usize, ClientMessage)> {
        self.sent()
            .into_iter()
            .filter_map(|(conn, text)| decode_client_frame(&text).ok().map(|m| (conn, m)))
            .collect()
    }
}

#[async_trait]
impl RelayConnector for ChannelConnector {
    async fn open(&self, _url: &str) -> Result<Box<dyn RelayLink>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut feeds = self.feeds.lock().unwrap();
        feeds.push(tx);
        Ok(Box::new(ChannelLink {
            connection: feeds.len() - 1,
            inbound: rx,
            sent: self.sent.clone(),
        }))
    }
}
