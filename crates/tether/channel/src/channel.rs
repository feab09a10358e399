//! Framed duplex channel with heartbeat.
//!
//! A connected [`Channel`] runs three workers on one transport:
//!
//! - **inbound**: reads packets, answers heartbeat traffic and hands every
//!   other frame to the [`FrameHandler`], one at a time
//! - **outbound**: the only writer; drains a bounded FIFO queue
//! - **heartbeat**: watches liveness in one of two [`HeartbeatMode`]s. Either
//!   the channel pings and expects a pong within the timeout, or the remote
//!   pings and must do so within interval plus timeout. The timing can be
//!   replaced while running, see [`FrameSender::retime_heartbeat`].
//!
//! The first close wins and records its [`CloseReason`]; later attempts are
//! no-ops. [`Channel::close`] then joins every worker, aborting any that does
//! not finish within the drain timeout.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::{ChannelError, ChannelResult};
use crate::frame::Frame;
use crate::transport::{Connector, FrameSink, FrameStream};

/// Which side of the channel sends pings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeartbeatMode {
    /// The channel pings and waits for a pong.
    #[default]
    ClientPings,
    /// The remote pings; the channel only answers.
    ServerPings,
}

impl HeartbeatMode {
    /// Engine revisions before 4 expect the client to ping.
    pub fn for_engine(engine_version: u8) -> Self {
        if engine_version >= 4 {
            HeartbeatMode::ServerPings
        } else {
            HeartbeatMode::ClientPings
        }
    }
}

/// Heartbeat interval and timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatTiming {
    pub interval: Duration,
    pub timeout: Duration,
}

/// Channel tuning.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Capacity of the outbound queue.
    pub send_queue: usize,

    /// Interval between pings, until the remote announces its own.
    pub ping_interval: Duration,

    /// How long to wait for a pong after a ping, until the remote announces
    /// its own.
    pub pong_timeout: Duration,

    /// How long `close` waits for each worker before aborting it.
    pub drain_timeout: Duration,

    pub heartbeat: HeartbeatMode,
}

impl ChannelConfig {
    fn timing(&self) -> HeartbeatTiming {
        HeartbeatTiming {
            interval: self.ping_interval,
            timeout: self.pong_timeout,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            send_queue: 64,
            ping_interval: Duration::from_secs(25),
            pong_timeout: Duration::from_secs(20),
            drain_timeout: Duration::from_secs(2),
            heartbeat: HeartbeatMode::default(),
        }
    }
}

/// Why a channel closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close` was called locally.
    Local,
    /// The remote closed the transport or the session.
    Remote,
    /// No pong arrived within the timeout.
    HeartbeatTimeout,
    /// The remote refused the session.
    Rejected(String),
    /// Reading or writing the transport failed.
    Transport(String),
}

impl CloseReason {
    pub fn is_local(&self) -> bool {
        matches!(self, CloseReason::Local)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => write!(f, "closed locally"),
            CloseReason::Remote => write!(f, "closed by remote"),
            CloseReason::HeartbeatTimeout => write!(f, "heartbeat timed out"),
            CloseReason::Rejected(reason) => write!(f, "rejected: {}", reason),
            CloseReason::Transport(reason) => write!(f, "transport failed: {}", reason),
        }
    }
}

/// Receives inbound frames other than heartbeat traffic.
///
/// Calls are serialized: the next frame is not read before the previous
/// call returns. A call may be dropped mid-way when the channel closes.
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    async fn handle(&self, frame: Frame, sender: &FrameSender);
}

/// State shared by the workers and every handle.
struct Shared {
    reason: OnceLock<CloseReason>,
    healthy: AtomicBool,
    shutdown: CancellationToken,
    timing: watch::Sender<HeartbeatTiming>,
}

impl Shared {
    /// Record the close reason and stop the workers. Only the first call
    /// has any effect; returns whether this call was it.
    fn mark_closed(&self, reason: CloseReason) -> bool {
        if self.reason.set(reason.clone()).is_err() {
            return false;
        }

        self.healthy.store(false, Ordering::SeqCst);
        match &reason {
            CloseReason::Local => debug!("Channel closed locally"),
            other => warn!(reason = %other, "Channel closed"),
        }
        self.shutdown.cancel();
        true
    }

    fn reason(&self) -> Option<CloseReason> {
        self.reason.get().cloned()
    }
}

/// Cloneable handle that enqueues frames on a channel.
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Frame>,
    shared: Arc<Shared>,
}

impl FrameSender {
    /// Enqueue a frame, waiting for queue capacity.
    pub async fn send(&self, frame: Frame) -> ChannelResult<()> {
        if self.shared.shutdown.is_cancelled() {
            return Err(ChannelError::Closed);
        }

        tokio::select! {
            biased;
            _ = self.shared.shutdown.cancelled() => Err(ChannelError::Closed),
            sent = self.tx.send(frame) => sent.map_err(|_| ChannelError::Closed),
        }
    }

    /// Close the channel from inside a handler.
    pub fn shutdown(&self, reason: CloseReason) -> bool {
        self.shared.mark_closed(reason)
    }

    /// Replace the heartbeat timing; the current wait restarts with it.
    pub fn retime_heartbeat(&self, timing: HeartbeatTiming) {
        if timing.interval.is_zero() || timing.timeout.is_zero() {
            debug!(?timing, "Ignoring empty heartbeat timing");
            return;
        }
        self.shared.timing.send_if_modified(|current| {
            let changed = *current != timing;
            *current = timing;
            changed
        });
    }
}

/// Resolves once the channel has closed.
#[derive(Clone)]
pub struct CloseSignal {
    shared: Arc<Shared>,
}

impl CloseSignal {
    pub async fn closed(&self) -> CloseReason {
        self.shared.shutdown.cancelled().await;
        self.shared
            .reason()
            .unwrap_or_else(|| CloseReason::Transport("closed without reason".into()))
    }
}

/// One background role of a channel.
struct Worker {
    role: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Worker {
    fn spawn<F>(role: &'static str, token: CancellationToken, run: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            role,
            token,
            handle: tokio::spawn(run),
        }
    }

    async fn join(mut self, drain_timeout: Duration) {
        self.token.cancel();
        if timeout(drain_timeout, &mut self.handle).await.is_err() {
            warn!(worker = self.role, "Worker did not stop in time, aborting");
            self.handle.abort();
        }
    }
}

/// A connected channel.
pub struct Channel {
    sender: FrameSender,
    shared: Arc<Shared>,
    workers: Mutex<Vec<Worker>>,
    drain_timeout: Duration,
}

impl Channel {
    /// Open the transport and start the workers.
    pub async fn connect(
        connector: &dyn Connector,
        url: &Url,
        handler: Arc<dyn FrameHandler>,
        config: ChannelConfig,
    ) -> ChannelResult<Self> {
        let (sink, stream) = connector.connect(url).await?;
        Ok(Self::start(sink, stream, handler, config))
    }

    fn start(
        sink: Box<dyn FrameSink>,
        stream: Box<dyn FrameStream>,
        handler: Arc<dyn FrameHandler>,
        config: ChannelConfig,
    ) -> Self {
        let (timing, timing_rx) = watch::channel(config.timing());
        let shared = Arc::new(Shared {
            reason: OnceLock::new(),
            healthy: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            timing,
        });
        let (tx, rx) = mpsc::channel(config.send_queue.max(1));
        let sender = FrameSender {
            tx,
            shared: shared.clone(),
        };
        let (pong_tx, pong_rx) = watch::channel(0u64);

        let inbound_token = shared.shutdown.child_token();
        let outbound_token = shared.shutdown.child_token();
        let heartbeat_token = shared.shutdown.child_token();

        let workers = vec![
            Worker::spawn(
                "inbound",
                inbound_token.clone(),
                inbound_pump(stream, handler, sender.clone(), pong_tx, inbound_token),
            ),
            Worker::spawn(
                "outbound",
                outbound_token.clone(),
                outbound_pump(sink, rx, shared.clone(), outbound_token),
            ),
            Worker::spawn(
                "heartbeat",
                heartbeat_token.clone(),
                heartbeat(
                    sender.clone(),
                    pong_rx,
                    timing_rx,
                    config.heartbeat,
                    heartbeat_token,
                ),
            ),
        ];

        debug!(
            mode = ?config.heartbeat,
            ping_interval_ms = config.ping_interval.as_millis() as u64,
            pong_timeout_ms = config.pong_timeout.as_millis() as u64,
            "Channel started"
        );

        Self {
            sender,
            shared,
            workers: Mutex::new(workers),
            drain_timeout: config.drain_timeout,
        }
    }

    /// Enqueue a frame for the outbound pump.
    pub async fn send(&self, frame: Frame) -> ChannelResult<()> {
        self.sender.send(frame).await
    }

    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    pub fn close_signal(&self) -> CloseSignal {
        CloseSignal {
            shared: self.shared.clone(),
        }
    }

    /// Resolves once the channel has closed, for whatever reason.
    pub async fn closed(&self) -> CloseReason {
        self.close_signal().closed().await
    }

    /// Reason of the close, if the channel has closed.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.reason()
    }

    pub fn is_healthy(&self) -> bool {
        self.shared.healthy.load(Ordering::SeqCst)
    }

    /// Close the channel and join its workers. Idempotent.
    pub async fn close(&self) {
        self.shared.mark_closed(CloseReason::Local);

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            worker.join(self.drain_timeout).await;
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shared.mark_closed(CloseReason::Local);
    }
}

async fn inbound_pump(
    mut stream: Box<dyn FrameStream>,
    handler: Arc<dyn FrameHandler>,
    sender: FrameSender,
    pongs: watch::Sender<u64>,
    token: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = stream.next_text() => next,
        };

        let text = match next {
            Some(Ok(text)) => text,
            Some(Err(e)) => {
                sender.shutdown(CloseReason::Transport(e.to_string()));
                break;
            }
            None => {
                sender.shutdown(CloseReason::Remote);
                break;
            }
        };

        let frame = match Frame::decode(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable packet");
                continue;
            }
        };
        trace!(kind = frame.kind(), "Inbound frame");

        match frame {
            Frame::Pong => {
                pongs.send_modify(|seen| *seen += 1);
            }
            Frame::Ping => {
                // A remote that pings is alive too.
                pongs.send_modify(|seen| *seen += 1);
                if sender.send(Frame::Pong).await.is_err() {
                    break;
                }
            }
            Frame::Close => {
                sender.shutdown(CloseReason::Remote);
                break;
            }
            frame => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = handler.handle(frame, &sender) => {}
                }
            }
        }
    }

    trace!("Inbound pump stopped");
}

async fn outbound_pump(
    mut sink: Box<dyn FrameSink>,
    mut queue: mpsc::Receiver<Frame>,
    shared: Arc<Shared>,
    token: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            frame = queue.recv() => frame,
        };
        let Some(frame) = frame else { break };

        if let Err(e) = sink.send_text(frame.encode()).await {
            shared.mark_closed(CloseReason::Transport(e.to_string()));
            break;
        }
    }

    // Best effort: whatever was queued before the close still goes out.
    queue.close();
    while let Ok(frame) = queue.try_recv() {
        if sink.send_text(frame.encode()).await.is_err() {
            break;
        }
    }
    sink.close().await;

    trace!("Outbound pump stopped");
}

async fn heartbeat(
    sender: FrameSender,
    mut pongs: watch::Receiver<u64>,
    mut timing: watch::Receiver<HeartbeatTiming>,
    mode: HeartbeatMode,
    token: CancellationToken,
) {
    loop {
        let current = *timing.borrow_and_update();

        let answered = match mode {
            HeartbeatMode::ClientPings => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = timing.changed() => continue,
                    _ = sleep(current.interval) => {}
                }

                pongs.borrow_and_update();
                if sender.send(Frame::Ping).await.is_err() {
                    break;
                }

                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    changed = timeout(current.timeout, pongs.changed()) => matches!(changed, Ok(Ok(()))),
                }
            }
            HeartbeatMode::ServerPings => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = timing.changed() => continue,
                    changed = timeout(current.interval + current.timeout, pongs.changed()) => {
                        matches!(changed, Ok(Ok(())))
                    }
                }
            }
        };

        if !answered {
            if sender.shutdown(CloseReason::HeartbeatTimeout) {
                info!(
                    mode = ?mode,
                    interval_ms = current.interval.as_millis() as u64,
                    timeout_ms = current.timeout.as_millis() as u64,
                    "No heartbeat received, channel marked unhealthy"
                );
            }
            break;
        }
    }

    trace!("Heartbeat stopped");
}
