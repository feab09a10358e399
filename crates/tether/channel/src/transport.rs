//! Transport seam.
//!
//! A transport moves whole text packets. The channel owns the framing, the
//! pumps and the heartbeat; a [`Connector`] only has to open a duplex pipe.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};
use url::Url;

use crate::error::{ChannelError, ChannelResult};

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> ChannelResult<(Box<dyn FrameSink>, Box<dyn FrameStream>)>;
}

/// Write half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> ChannelResult<()>;

    /// Close the write half. Errors are not interesting at this point.
    async fn close(&mut self);
}

/// Read half of a transport.
#[async_trait]
pub trait FrameStream: Send {
    /// Next text packet; `None` once the remote has closed.
    async fn next_text(&mut self) -> Option<ChannelResult<String>>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport over `ws://` or `wss://`.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> ChannelResult<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        let (stream, response) = connect_async(url.as_str())
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;

        debug!(
            host = url.host_str().unwrap_or_default(),
            status = %response.status(),
            "WebSocket established"
        );

        let (sink, stream) = stream.split();
        Ok((
            Box::new(WebSocketSink { inner: sink }),
            Box::new(WebSocketFrames { inner: stream }),
        ))
    }
}

struct WebSocketSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send_text(&mut self, text: String) -> ChannelResult<()> {
        self.inner
            .send(Message::Text(text))
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.inner.close().await;
    }
}

struct WebSocketFrames {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WebSocketFrames {
    async fn next_text(&mut self) -> Option<ChannelResult<String>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "WebSocket closed by remote");
                    return None;
                }
                // Control frames are answered by tungstenite itself.
                Ok(other) => trace!(len = other.len(), "Skipping non-text message"),
                Err(e) => return Some(Err(ChannelError::Transport(e.to_string()))),
            }
        }
    }
}
