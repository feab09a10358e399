//! Session lifecycle: connect, dispatch, reconnect.

use std::sync::Arc;
use std::time::Duration;

use tether_channel::{
    socket_url, ChannelResult, ClientConfig, Connector, EventRouter, ProtocolClient,
};
use tether_deployment::{ApplyEngine, Applier};
use tether_health::ClusterReader;
use tether_release::VersionSequencer;
use tether_task::{TaskStatusTracker, TaskStore};
use tether_types::{
    AppInformersRequest, DesiredState, UndeployRequest, EVENT_APP_INFORMERS, EVENT_DEPLOY,
    EVENT_UNDEPLOY,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::backoff::Backoff;
use crate::config::AgentConfig;
use crate::error::DaemonResult;
use crate::outbox::Outbox;
use crate::reconciler::{Command, Reconciler};
use crate::upstream::UpstreamClient;

const COMMAND_QUEUE: usize = 64;

/// External capabilities the loop drives.
pub struct Collaborators {
    pub connector: Arc<dyn Connector>,
    pub applier: Arc<dyn Applier>,
    pub reader: Arc<dyn ClusterReader>,
    pub task_store: Arc<dyn TaskStore>,
    pub upstream: Option<UpstreamClient>,
}

/// Keeps one session with the control plane alive and feeds its events to
/// the [`Reconciler`].
pub struct ControlLoop {
    connector: Arc<dyn Connector>,
    socket_url: Url,
    client_config: ClientConfig,
    backoff: Backoff,
    resync_on_connect: bool,
    outbox: Outbox,
    reconciler: Arc<Reconciler>,
}

impl ControlLoop {
    pub fn new(config: &AgentConfig, collaborators: Collaborators) -> DaemonResult<Self> {
        let socket_url = socket_url(
            &config.upstream.endpoint,
            &config.upstream.token,
            config.channel.engine_version,
        )?;

        let outbox = Outbox::new();
        let engine = ApplyEngine::with_policy(collaborators.applier, config.apply.policy());
        let tracker = TaskStatusTracker::with_tick(
            collaborators.task_store,
            Duration::from_millis(config.task.tick_ms),
        );
        let reconciler = Arc::new(Reconciler::new(
            engine,
            collaborators.reader,
            tracker,
            outbox.clone(),
            collaborators.upstream,
            VersionSequencer::new(config.upstream.include_prerelease),
            config.monitor.monitor_config(),
        ));

        Ok(Self {
            connector: collaborators.connector,
            socket_url,
            client_config: config.channel.client_config(),
            backoff: Backoff::from(&config.reconnect),
            resync_on_connect: config.upstream.resync_on_connect,
            outbox,
            reconciler,
        })
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn socket_url(&self) -> &Url {
        &self.socket_url
    }

    /// Run until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> DaemonResult<()> {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let router = Arc::new(build_router(tx)?);
        let commands = tokio::spawn(command_loop(
            Arc::clone(&self.reconciler),
            rx,
            shutdown.clone(),
        ));

        info!(
            host = self.socket_url.host_str().unwrap_or_default(),
            events = ?router.events(),
            "Control loop started"
        );

        let mut attempt: u32 = 0;
        while !shutdown.is_cancelled() {
            let connect = ProtocolClient::connect(
                self.connector.as_ref(),
                &self.socket_url,
                Arc::clone(&router),
                self.client_config.clone(),
            );
            let connected = tokio::select! {
                _ = shutdown.cancelled() => break,
                connected = connect => connected,
            };

            match connected {
                Ok(client) => {
                    attempt = 0;
                    if !self.serve(Arc::new(client), &shutdown).await {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, attempt, "Failed to connect to control plane"),
            }

            let delay = self.backoff.next(attempt);
            attempt = attempt.saturating_add(1);
            debug!(delay_ms = delay.as_millis() as u64, attempt, "Waiting before reconnect");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Control loop stopping");
        self.outbox.detach().await;
        if let Err(e) = commands.await {
            warn!(error = %e, "Command loop ended abnormally");
        }
        self.reconciler.shutdown().await;
        info!("Control loop stopped");
        Ok(())
    }

    /// Drive one open session. Returns false when shutdown ended it.
    async fn serve(&self, client: Arc<ProtocolClient>, shutdown: &CancellationToken) -> bool {
        info!(sid = client.session_id().unwrap_or_default(), "Control-plane session open");
        self.outbox.attach(Arc::clone(&client)).await;

        self.reconciler.resend_statuses().await;
        if self.resync_on_connect {
            let reconciler = Arc::clone(&self.reconciler);
            tokio::spawn(async move { reconciler.resync().await });
        }

        let lost = tokio::select! {
            _ = shutdown.cancelled() => None,
            reason = client.disconnected() => Some(reason),
        };

        self.outbox.detach().await;
        match lost {
            Some(reason) => {
                warn!(%reason, state = %client.state(), "Control-plane session lost");
                client.close().await;
                true
            }
            None => {
                client.close().await;
                false
            }
        }
    }
}

/// Register the inbound events. Handlers only forward to the command
/// queue so the inbound pump is never held up by a run.
pub fn build_router(tx: mpsc::Sender<Command>) -> ChannelResult<EventRouter> {
    let mut router = EventRouter::new();

    let deploy = tx.clone();
    router.on(EVENT_DEPLOY, move |state: DesiredState| {
        let tx = deploy.clone();
        async move { forward(&tx, Command::Deploy(state)).await }
    })?;

    let undeploy = tx.clone();
    router.on(EVENT_UNDEPLOY, move |request: UndeployRequest| {
        let tx = undeploy.clone();
        async move { forward(&tx, Command::Undeploy(request)).await }
    })?;

    router.on(EVENT_APP_INFORMERS, move |request: AppInformersRequest| {
        let tx = tx.clone();
        async move { forward(&tx, Command::Informers(request)).await }
    })?;

    Ok(router)
}

async fn forward(tx: &mpsc::Sender<Command>, command: Command) {
    if tx.send(command).await.is_err() {
        debug!("Command queue closed, dropping event");
    }
}

async fn command_loop(
    reconciler: Arc<Reconciler>,
    mut rx: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        reconciler.handle(command).await;
    }
    debug!("Command loop stopped");
}
