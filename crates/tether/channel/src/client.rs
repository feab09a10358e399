//! Protocol client: session handshake and event dispatch on a [`Channel`].

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, instrument, trace, warn};
use url::Url;

use crate::channel::{
    Channel, ChannelConfig, CloseReason, FrameHandler, FrameSender, HeartbeatMode, HeartbeatTiming,
};
use crate::endpoint::DEFAULT_ENGINE_VERSION;
use crate::error::{ChannelError, ChannelResult};
use crate::frame::Frame;
use crate::router::EventRouter;
use crate::transport::Connector;

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Transport open, handshake pending.
    Connecting,
    /// Namespace connected; events flow.
    Open,
    /// Closed locally.
    Closed,
    /// Lost to a transport or remote failure; the owner should reconnect.
    Reconnecting,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientState::Connecting => write!(f, "connecting"),
            ClientState::Open => write!(f, "open"),
            ClientState::Closed => write!(f, "closed"),
            ClientState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub channel: ChannelConfig,

    /// Time allowed between transport open and namespace connect.
    pub handshake_timeout: Duration,

    /// Engine protocol revision. From 4 on the client requests the
    /// namespace itself and the remote drives the heartbeat; before that
    /// the remote connects the namespace unasked and the client pings.
    pub engine_version: u8,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            handshake_timeout: Duration::from_secs(10),
            engine_version: DEFAULT_ENGINE_VERSION,
        }
    }
}

struct Session {
    state: watch::Sender<ClientState>,
    sid: OnceLock<String>,
    router: Arc<EventRouter>,
    engine_version: u8,
}

#[async_trait]
impl FrameHandler for Session {
    async fn handle(&self, frame: Frame, sender: &FrameSender) {
        match frame {
            Frame::Open(open) => {
                if self.sid.set(open.sid.clone()).is_err() {
                    warn!(sid = %open.sid, "Ignoring repeated open packet");
                    return;
                }
                debug!(
                    sid = %open.sid,
                    ping_interval_ms = open.ping_interval,
                    ping_timeout_ms = open.ping_timeout,
                    "Session opened"
                );
                sender.retime_heartbeat(HeartbeatTiming {
                    interval: Duration::from_millis(open.ping_interval),
                    timeout: Duration::from_millis(open.ping_timeout),
                });
                if self.engine_version >= 4 && sender.send(Frame::Connect).await.is_err() {
                    debug!("Channel closed before namespace connect request");
                }
            }
            Frame::Connect => {
                if self.sid.get().is_none() {
                    warn!("Namespace connect before open packet");
                }
                let opened = self.state.send_if_modified(|state| {
                    if *state == ClientState::Connecting {
                        *state = ClientState::Open;
                        true
                    } else {
                        false
                    }
                });
                if opened {
                    info!(sid = ?self.sid.get(), "Session connected");
                }
            }
            Frame::ConnectError(payload) => {
                let message = payload
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| payload.to_string());
                sender.shutdown(CloseReason::Rejected(message));
            }
            Frame::Disconnect => {
                sender.shutdown(CloseReason::Remote);
            }
            Frame::Event { name, payload } => {
                let state = *self.state.borrow();
                if state != ClientState::Open {
                    warn!(event = %name, %state, "Dropping event received before namespace connect");
                    return;
                }
                self.router.dispatch(&name, payload).await;
            }
            other => trace!(kind = other.kind(), "Ignoring frame"),
        }
    }
}

/// One session with the control plane.
///
/// The client never reconnects by itself: once [`disconnected`](Self::disconnected)
/// resolves, the owner decides whether and when to connect again.
pub struct ProtocolClient {
    channel: Channel,
    session: Arc<Session>,
}

impl ProtocolClient {
    /// Connect and complete the handshake.
    #[instrument(skip_all, fields(host = url.host_str().unwrap_or_default()))]
    pub async fn connect(
        connector: &dyn Connector,
        url: &Url,
        router: Arc<EventRouter>,
        config: ClientConfig,
    ) -> ChannelResult<Self> {
        let (state, mut state_rx) = watch::channel(ClientState::Connecting);
        let session = Arc::new(Session {
            state,
            sid: OnceLock::new(),
            router,
            engine_version: config.engine_version,
        });

        let channel_config = ChannelConfig {
            heartbeat: HeartbeatMode::for_engine(config.engine_version),
            ..config.channel.clone()
        };
        let channel = Channel::connect(connector, url, session.clone(), channel_config).await?;
        let close = channel.close_signal();

        let handshake = tokio::time::timeout(config.handshake_timeout, async {
            tokio::select! {
                reason = close.closed() => Err(reason),
                opened = state_rx.wait_for(|s| *s == ClientState::Open) => {
                    opened.map(|_| ()).map_err(|_| CloseReason::Local)
                }
            }
        })
        .await;

        let failure = match handshake {
            Ok(Ok(())) => None,
            Ok(Err(reason)) => Some(ChannelError::Handshake(reason.to_string())),
            Err(_) => Some(ChannelError::HandshakeTimeout {
                timeout_ms: config.handshake_timeout.as_millis() as u64,
            }),
        };
        if let Some(err) = failure {
            channel.close().await;
            session.state.send_replace(ClientState::Closed);
            return Err(err);
        }

        let watched = session.clone();
        tokio::spawn(async move {
            let reason = close.closed().await;
            let next = if reason.is_local() {
                ClientState::Closed
            } else {
                ClientState::Reconnecting
            };
            watched.state.send_replace(next);
        });

        Ok(Self { channel, session })
    }

    /// Send an application event.
    pub async fn emit<T: Serialize>(&self, event: &str, payload: &T) -> ChannelResult<()> {
        if self.state() != ClientState::Open {
            return Err(ChannelError::NotOpen);
        }
        self.channel.send(Frame::event(event, payload)?).await
    }

    pub fn state(&self) -> ClientState {
        *self.session.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.session.state.subscribe()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.sid.get().map(String::as_str)
    }

    pub fn is_healthy(&self) -> bool {
        self.channel.is_healthy()
    }

    /// Resolves when the session ends.
    pub async fn disconnected(&self) -> CloseReason {
        self.channel.closed().await
    }

    /// Close the session and join the channel workers.
    pub async fn close(&self) {
        self.channel.close().await;
        self.session.state.send_replace(ClientState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{memory_transport, MemoryPeer};
    use serde_json::json;
    use std::sync::Mutex;

    const OPEN: &str = r#"0{"sid":"s-1","upgrades":[],"pingInterval":25000,"pingTimeout":5000}"#;

    fn url() -> Url {
        Url::parse("ws://control.test/socket.io/?EIO=3&transport=websocket&token=t").unwrap()
    }

    fn config() -> ClientConfig {
        ClientConfig {
            channel: ChannelConfig {
                ping_interval: Duration::from_secs(30),
                ..ChannelConfig::default()
            },
            handshake_timeout: Duration::from_secs(2),
            engine_version: 3,
        }
    }

    fn recording_router() -> (Arc<EventRouter>, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut router = EventRouter::new();
        router
            .on("deploy", move |payload: Value| {
                let sink = sink.clone();
                async move { sink.lock().unwrap().push(payload) }
            })
            .unwrap();
        (Arc::new(router), seen)
    }

    async fn open_session(
        router: Arc<EventRouter>,
    ) -> (ProtocolClient, MemoryPeer) {
        let (connector, mut listener) = memory_transport();
        let remote = tokio::spawn(async move {
            let peer = listener.accept().await.unwrap();
            peer.send(OPEN);
            peer.send("40");
            peer
        });
        let client = ProtocolClient::connect(&connector, &url(), router, config())
            .await
            .unwrap();
        (client, remote.await.unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_opens_session() {
        let (router, _) = recording_router();
        let (client, _peer) = open_session(router).await;

        assert_eq!(client.state(), ClientState::Open);
        assert_eq!(client.session_id(), Some("s-1"));
        client.close().await;
        assert_eq!(client.state(), ClientState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_dispatched_after_connect() {
        let (router, seen) = recording_router();
        let (client, peer) = open_session(router).await;

        peer.send(r#"42["deploy",{"appId":"web"}]"#);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*seen.lock().unwrap(), vec![json!({"appId": "web"})]);
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_before_connect_are_dropped() {
        let (router, seen) = recording_router();
        let (connector, mut listener) = memory_transport();
        let remote = tokio::spawn(async move {
            let peer = listener.accept().await.unwrap();
            peer.send(OPEN);
            peer.send(r#"42["deploy",{"early":true}]"#);
            peer.send("40");
            peer.send(r#"42["deploy",{"early":false}]"#);
            peer
        });

        let client = ProtocolClient::connect(&connector, &url(), router, config())
            .await
            .unwrap();
        let _peer = remote.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*seen.lock().unwrap(), vec![json!({"early": false})]);
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let (router, _) = recording_router();
        let (connector, mut listener) = memory_transport();
        let remote = tokio::spawn(async move {
            let peer = listener.accept().await.unwrap();
            peer.send(OPEN);
            // Keep the transport open without connecting the namespace.
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(peer);
        });

        let err = ProtocolClient::connect(&connector, &url(), router, config())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ChannelError::HandshakeTimeout { timeout_ms: 2000 }));
        remote.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_handshake() {
        let (router, _) = recording_router();
        let (connector, mut listener) = memory_transport();
        let remote = tokio::spawn(async move {
            let peer = listener.accept().await.unwrap();
            peer.send(OPEN);
            peer.send(r#"44{"message":"invalid token"}"#);
            peer
        });

        let err = ProtocolClient::connect(&connector, &url(), router, config())
            .await
            .err()
            .unwrap();
        assert!(matches!(&err, ChannelError::Handshake(msg) if msg.contains("invalid token")));
        drop(remote);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emit_writes_event_packet() {
        let (router, _) = recording_router();
        let (client, mut peer) = open_session(router).await;

        client
            .emit("appStatus", &json!({"appId": "web", "state": "Ready"}))
            .await
            .unwrap();
        assert_eq!(
            peer.recv_data().await.unwrap(),
            r#"42["appStatus",{"appId":"web","state":"Ready"}]"#
        );
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_v4_requests_namespace() {
        let (router, _) = recording_router();
        let (connector, mut listener) = memory_transport();
        let remote = tokio::spawn(async move {
            let mut peer = listener.accept().await.unwrap();
            peer.send(OPEN);
            let request = peer.recv_data().await.unwrap();
            peer.send("40");
            (peer, request)
        });

        let client = ProtocolClient::connect(
            &connector,
            &url(),
            router,
            ClientConfig {
                engine_version: 4,
                ..config()
            },
        )
        .await
        .unwrap();
        let (_peer, request) = remote.await.unwrap();

        assert_eq!(request, "40");
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_v3_pings_on_announced_interval() {
        let (router, _) = recording_router();
        let (connector, mut listener) = memory_transport();
        let remote = tokio::spawn(async move {
            let peer = listener.accept().await.unwrap();
            peer.send(r#"0{"sid":"s-1","upgrades":[],"pingInterval":1000,"pingTimeout":500}"#);
            peer.send("40");
            peer
        });

        // Configured interval is 30s; the announced one wins.
        let client = ProtocolClient::connect(&connector, &url(), router, config())
            .await
            .unwrap();
        let mut peer = remote.await.unwrap();
        let started = tokio::time::Instant::now();

        for _ in 0..3 {
            assert_eq!(peer.recv().await.unwrap(), "2");
            assert!(peer.send("3"));
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(client.state(), ClientState::Open);
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_v4_answers_server_heartbeat() {
        let (router, _) = recording_router();
        let (connector, mut listener) = memory_transport();
        let remote = tokio::spawn(async move {
            let mut peer = listener.accept().await.unwrap();
            peer.send(r#"0{"sid":"s-4","upgrades":[],"pingInterval":30000,"pingTimeout":20000}"#);
            assert_eq!(peer.recv_data().await.unwrap(), "40");
            peer.send("40");
            peer
        });

        let client = ProtocolClient::connect(
            &connector,
            &url(),
            router,
            ClientConfig {
                engine_version: 4,
                ..config()
            },
        )
        .await
        .unwrap();
        let mut peer = remote.await.unwrap();

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(30)).await;
            assert!(peer.send("2"));
            assert_eq!(peer.recv().await.unwrap(), "3");
        }

        assert_eq!(client.state(), ClientState::Open);
        assert!(client.is_healthy());
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_v4_silent_server_times_out() {
        let (router, _) = recording_router();
        let (connector, mut listener) = memory_transport();
        let remote = tokio::spawn(async move {
            let mut peer = listener.accept().await.unwrap();
            peer.send(r#"0{"sid":"s-4","upgrades":[],"pingInterval":30000,"pingTimeout":20000}"#);
            assert_eq!(peer.recv_data().await.unwrap(), "40");
            peer.send("40");
            peer
        });

        let client = ProtocolClient::connect(
            &connector,
            &url(),
            router,
            ClientConfig {
                engine_version: 4,
                ..config()
            },
        )
        .await
        .unwrap();
        let _peer = remote.await.unwrap();
        let started = tokio::time::Instant::now();

        assert_eq!(client.disconnected().await, CloseReason::HeartbeatTimeout);
        assert!(started.elapsed() >= Duration::from_secs(45));
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_loss_moves_to_reconnecting() {
        let (router, _) = recording_router();
        let (client, peer) = open_session(router).await;
        let mut states = client.subscribe_state();

        peer.hang_up();
        assert_eq!(client.disconnected().await, CloseReason::Remote);
        states
            .wait_for(|s| *s == ClientState::Reconnecting)
            .await
            .unwrap();

        assert!(matches!(
            client.emit("appStatus", &json!({})).await,
            Err(ChannelError::NotOpen)
        ));
        client.close().await;
    }
}
