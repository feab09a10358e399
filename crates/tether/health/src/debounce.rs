//! Single-slot coalescing buffer between the poll cycle and the upstream push.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tether_types::AppStatus;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Destination for debounced statuses.
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Deliver one status. Delivery errors are the sink's concern.
    async fn push(&self, status: AppStatus);
}

/// Sink that keeps every status it receives.
#[derive(Default)]
pub struct RecordingStatusSink {
    pushed: StdMutex<Vec<AppStatus>>,
}

impl RecordingStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses(&self) -> Vec<AppStatus> {
        self.pushed.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl StatusSink for RecordingStatusSink {
    async fn push(&self, status: AppStatus) {
        if let Ok(mut pushed) = self.pushed.lock() {
            pushed.push(status);
        }
    }
}

#[derive(Default)]
struct Slot {
    pending: Option<AppStatus>,
    timer: Option<JoinHandle<()>>,
}

/// Coalesces offers so that at most one push leaves per window.
///
/// The first offer into an empty slot arms a timer; later offers within the
/// window overwrite the pending value. When the timer fires the latest value
/// is pushed and the slot is emptied.
pub struct StatusDebouncer {
    window: Duration,
    sink: Arc<dyn StatusSink>,
    slot: Arc<Mutex<Slot>>,
}

impl StatusDebouncer {
    pub fn new(window: Duration, sink: Arc<dyn StatusSink>) -> Self {
        Self {
            window,
            sink,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Place a status in the slot, arming the timer if it is idle.
    pub async fn offer(&self, status: AppStatus) {
        let mut slot = self.slot.lock().await;
        trace!(app_id = %status.app_id, state = %status.state, "Status offered");
        slot.pending = Some(status);

        if slot.timer.is_none() {
            let window = self.window;
            let sink = Arc::clone(&self.sink);
            let shared = Arc::clone(&self.slot);

            slot.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(window).await;
                let pending = {
                    let mut slot = shared.lock().await;
                    slot.timer = None;
                    slot.pending.take()
                };
                if let Some(status) = pending {
                    debug!(app_id = %status.app_id, state = %status.state, "Pushing status");
                    sink.push(status).await;
                }
            }));
        }
    }

    /// Push whatever is pending right away.
    pub async fn flush(&self) {
        let pending = {
            let mut slot = self.slot.lock().await;
            if let Some(timer) = slot.timer.take() {
                timer.abort();
            }
            slot.pending.take()
        };
        if let Some(status) = pending {
            self.sink.push(status).await;
        }
    }

    /// Drop the pending value and disarm the timer.
    pub async fn cancel(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        slot.pending = None;
    }

    pub async fn has_pending(&self) -> bool {
        self.slot.lock().await.pending.is_some()
    }
}

impl Drop for StatusDebouncer {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.slot.try_lock() {
            if let Some(timer) = slot.timer.take() {
                timer.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_types::{AppId, Informer, ResourceKind, ResourceState, State};

    const WINDOW: Duration = Duration::from_secs(2);

    fn status(state: State) -> AppStatus {
        let informer = Informer::new(ResourceKind::Deployment, "web");
        AppStatus::from_states(
            AppId::new("shop"),
            vec![ResourceState::new(&informer, "prod", state)],
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_push_per_window_with_last_value() {
        let sink = Arc::new(RecordingStatusSink::new());
        let debouncer = StatusDebouncer::new(WINDOW, sink.clone());

        debouncer.offer(status(State::Unavailable)).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        debouncer.offer(status(State::Degraded)).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        debouncer.offer(status(State::Ready)).await;

        // Still inside the first window.
        assert!(sink.statuses().is_empty());

        tokio::time::sleep(WINDOW).await;
        let pushed = sink.statuses();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].state, State::Ready);
        assert!(!debouncer.has_pending().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offer_after_push_opens_new_window() {
        let sink = Arc::new(RecordingStatusSink::new());
        let debouncer = StatusDebouncer::new(WINDOW, sink.clone());

        debouncer.offer(status(State::Degraded)).await;
        tokio::time::sleep(WINDOW + Duration::from_millis(10)).await;
        debouncer.offer(status(State::Ready)).await;
        tokio::time::sleep(WINDOW + Duration::from_millis(10)).await;

        let states: Vec<State> = sink.statuses().iter().map(|s| s.state).collect();
        assert_eq!(states, vec![State::Degraded, State::Ready]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_and_cancel() {
        let sink = Arc::new(RecordingStatusSink::new());
        let debouncer = StatusDebouncer::new(WINDOW, sink.clone());

        debouncer.offer(status(State::Missing)).await;
        debouncer.flush().await;
        assert_eq!(sink.statuses().len(), 1);

        debouncer.offer(status(State::Ready)).await;
        debouncer.cancel().await;
        tokio::time::sleep(WINDOW * 2).await;
        assert_eq!(sink.statuses().len(), 1);
    }
}
