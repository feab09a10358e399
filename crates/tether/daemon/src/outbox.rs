//! Outbound events through whichever session is current.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tether_channel::ProtocolClient;
use tether_health::StatusSink;
use tether_types::{AppStatus, EVENT_APP_STATUS};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Handle to the live session, shared by everything that emits.
///
/// Emits while no session is open are dropped: delivery is at most once
/// and nothing is replayed on reconnect.
#[derive(Clone, Default)]
pub struct Outbox {
    current: Arc<RwLock<Option<Arc<ProtocolClient>>>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, client: Arc<ProtocolClient>) {
        *self.current.write().await = Some(client);
    }

    pub async fn detach(&self) {
        self.current.write().await.take();
    }

    pub async fn is_attached(&self) -> bool {
        self.current.read().await.is_some()
    }

    /// Emit `event`; returns whether it was queued on a session.
    pub async fn emit<T: Serialize + Sync>(&self, event: &str, payload: &T) -> bool {
        let Some(client) = self.current.read().await.clone() else {
            debug!(event, "No session, dropping event");
            return false;
        };

        match client.emit(event, payload).await {
            Ok(()) => true,
            Err(e) => {
                warn!(event, error = %e, "Failed to emit event");
                false
            }
        }
    }
}

/// Pushes debounced statuses upstream as `appStatus` events.
pub struct ChannelStatusSink {
    outbox: Outbox,
}

impl ChannelStatusSink {
    pub fn new(outbox: Outbox) -> Self {
        Self { outbox }
    }
}

#[async_trait]
impl StatusSink for ChannelStatusSink {
    async fn push(&self, status: AppStatus) {
        self.outbox.emit(EVENT_APP_STATUS, &status).await;
    }
}
