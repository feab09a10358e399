//! In-memory transport.
//!
//! [`memory_transport`] returns a connector and the listener that receives
//! the remote end of every connection it opens. Tests drive the remote side
//! through [`MemoryPeer`].

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::error::{ChannelError, ChannelResult};
use crate::transport::{Connector, FrameSink, FrameStream};

/// Create a connected connector/listener pair.
pub fn memory_transport() -> (MemoryConnector, MemoryListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MemoryConnector { accept: tx }, MemoryListener { incoming: rx })
}

/// Connector whose connections land on a [`MemoryListener`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accept: mpsc::UnboundedSender<MemoryPeer>,
}

/// Receives the remote ends of new connections.
#[derive(Debug)]
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryListener {
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.incoming.recv().await
    }
}

/// Remote end of one in-memory connection.
#[derive(Debug)]
pub struct MemoryPeer {
    url: Url,
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// URL the client connected to.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Deliver a packet to the client. Returns false once the client is gone.
    pub fn send(&self, text: impl Into<String>) -> bool {
        self.to_client.send(text.into()).is_ok()
    }

    /// Next packet written by the client; `None` once it closed its sink.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next packet, skipping heartbeat pings.
    pub async fn recv_data(&mut self) -> Option<String> {
        loop {
            let text = self.recv().await?;
            if text != "2" {
                return Some(text);
            }
        }
    }

    /// Drop the connection from the remote side.
    pub fn hang_up(self) {}
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &Url) -> ChannelResult<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (client_tx, from_client) = mpsc::unbounded_channel();

        self.accept
            .send(MemoryPeer {
                url: url.clone(),
                to_client,
                from_client,
            })
            .map_err(|_| ChannelError::Connect("connection refused".into()))?;

        Ok((
            Box::new(MemorySink { tx: Some(client_tx) }),
            Box::new(MemoryStream { rx: client_rx }),
        ))
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_text(&mut self, text: String) -> ChannelResult<()> {
        let tx = self.tx.as_ref().ok_or(ChannelError::Closed)?;
        tx.send(text)
            .map_err(|_| ChannelError::Transport("peer gone".into()))
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn next_text(&mut self) -> Option<ChannelResult<String>> {
        self.rx.recv().await.map(Ok)
    }
}
