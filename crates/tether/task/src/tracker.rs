//! Task status tracker.
//!
//! Starting a task writes its record and spawns a ticker that touches the
//! record once per interval. Finishing the task cancels the ticker and waits
//! for it before writing the final state, so no touch can land after
//! completion.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{failure_message, TaskResult};
use crate::store::{TaskStore, STATUS_FAILED, STATUS_RUNNING};

/// Default interval between liveness touches.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Starts and tracks long-running operations.
#[derive(Clone)]
pub struct TaskStatusTracker {
    store: Arc<dyn TaskStore>,
    tick: Duration,
}

impl TaskStatusTracker {
    /// Create a tracker touching records every second.
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self::with_tick(store, DEFAULT_TICK)
    }

    /// Create a tracker with a custom touch interval.
    pub fn with_tick(store: Arc<dyn TaskStore>, tick: Duration) -> Self {
        Self { store, tick }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Record the task as running and start touching it.
    #[instrument(skip(self, message))]
    pub async fn start(&self, id: &str, message: &str) -> TaskResult<ActiveTask> {
        self.store.set(id, message, STATUS_RUNNING).await?;

        let cancel = CancellationToken::new();
        let ticker = tokio::spawn(run_ticker(
            self.store.clone(),
            id.to_string(),
            self.tick,
            cancel.clone(),
        ));

        debug!(task_id = %id, "Task started");

        Ok(ActiveTask {
            id: id.to_string(),
            store: self.store.clone(),
            cancel,
            ticker: Some(ticker),
        })
    }
}

async fn run_ticker(
    store: Arc<dyn TaskStore>,
    id: String,
    tick: Duration,
    cancel: CancellationToken,
) {
    let mut interval = interval_at(Instant::now() + tick, tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            // Completion always wins over a due tick.
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = store.touch(&id).await {
                    warn!(task_id = %id, error = %e, "Failed to touch task");
                }
            }
        }
    }
}

/// Handle of a running task.
///
/// Dropping the handle without finishing stops the ticker and leaves the
/// record as it was, which readers will eventually see as stalled.
pub struct ActiveTask {
    id: String,
    store: Arc<dyn TaskStore>,
    cancel: CancellationToken,
    ticker: Option<JoinHandle<()>>,
}

impl ActiveTask {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Replace the progress message.
    pub async fn update(&self, message: &str) -> TaskResult<()> {
        self.store.set(&self.id, message, STATUS_RUNNING).await
    }

    /// Finish successfully: the record is cleared.
    pub async fn succeed(mut self) -> TaskResult<()> {
        self.stop().await;
        self.store.clear(&self.id).await?;
        info!(task_id = %self.id, "Task completed");
        Ok(())
    }

    /// Finish with an error: the record keeps a terminal message.
    pub async fn fail(mut self, err: &(dyn StdError + Send + Sync + 'static)) -> TaskResult<()> {
        self.stop().await;
        let message = failure_message(err);
        self.store.set(&self.id, &message, STATUS_FAILED).await?;
        warn!(task_id = %self.id, message = %message, "Task failed");
        Ok(())
    }

    /// Finish from an operation result.
    pub async fn finish<T, E>(self, result: &Result<T, E>) -> TaskResult<()>
    where
        E: StdError + Send + Sync + 'static,
    {
        match result {
            Ok(_) => self.succeed().await,
            Err(e) => self.fail(e).await,
        }
    }

    async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(ticker) = self.ticker.take() {
            // The ticker only ends by observing cancellation.
            let _ = ticker.await;
        }
    }
}

impl Drop for ActiveTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
