//! Event name to typed handler map.

use std::collections::HashMap;
use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ChannelError, ChannelResult};

type BoxedHandler = Box<dyn Fn(Value) -> ChannelResult<BoxFuture<'static, ()>> + Send + Sync>;

/// Routes application events to handlers registered up front.
///
/// ```
/// use tether_channel::EventRouter;
///
/// let mut router = EventRouter::new();
/// router
///     .on("ping", |payload: serde_json::Value| async move {
///         println!("ping {}", payload);
///     })
///     .unwrap();
/// assert!(router.on("ping", |_: serde_json::Value| async {}).is_err());
/// ```
#[derive(Default)]
pub struct EventRouter {
    handlers: HashMap<String, BoxedHandler>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `event`; its payload is decoded as `T`.
    pub fn on<T, F, Fut>(&mut self, event: &str, handler: F) -> ChannelResult<&mut Self>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.handlers.contains_key(event) {
            return Err(ChannelError::DuplicateHandler(event.to_string()));
        }

        let boxed: BoxedHandler = Box::new(move |payload| {
            let typed: T = serde_json::from_value(payload)?;
            Ok(handler(typed).boxed())
        });
        self.handlers.insert(event.to_string(), boxed);
        Ok(self)
    }

    pub fn handles(&self, event: &str) -> bool {
        self.handlers.contains_key(event)
    }

    /// Registered event names, sorted.
    pub fn events(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run the handler for `event`. Returns whether a handler ran.
    pub async fn dispatch(&self, event: &str, payload: Value) -> bool {
        let Some(handler) = self.handlers.get(event) else {
            debug!(event, "No handler registered, ignoring event");
            return false;
        };

        match handler(payload) {
            Ok(run) => {
                run.await;
                true
            }
            Err(e) => {
                warn!(event, error = %e, "Dropping event with undecodable payload");
                false
            }
        }
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("events", &self.events())
            .finish()
    }
}
