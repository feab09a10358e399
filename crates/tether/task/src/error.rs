//! Error types for tether-task.

use std::error::Error as StdError;
use thiserror::Error;

/// Errors raised by task stores.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The backing store rejected the operation.
    #[error("task store error: {0}")]
    Store(String),

    /// No record exists for the task.
    #[error("task not found: {0}")]
    NotFound(String),
}

/// Result type for task operations.
pub type TaskResult<T> = Result<T, TaskError>;

/// An error whose own message is meant for the remote operator.
///
/// When a failing operation's error chain contains an `ActionableError`,
/// that message is stored instead of the outer, more technical text.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ActionableError {
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl ActionableError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Message to record for a failed operation.
///
/// Walks the source chain for an [`ActionableError`]; falls back to the
/// outermost error's text.
pub fn failure_message(err: &(dyn StdError + 'static)) -> String {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);

    while let Some(e) = current {
        if let Some(actionable) = e.downcast_ref::<ActionableError>() {
            return actionable.message.clone();
        }
        current = e.source();
    }

    err.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("apply step failed")]
    struct Wrapper(#[source] ActionableError);

    #[derive(Debug, Error)]
    #[error("connection reset by peer")]
    struct Plain;

    #[test]
    fn test_actionable_message_preferred() {
        let err = Wrapper(ActionableError::with_source(
            "Registry credentials are invalid",
            Box::new(Plain) as Box<dyn StdError + Send + Sync>,
        ));
        assert_eq!(failure_message(&err), "Registry credentials are invalid");
    }

    #[test]
    fn test_plain_error_uses_outer_text() {
        assert_eq!(failure_message(&Plain), "connection reset by peer");
    }

    #[test]
    fn test_anyhow_context_chain() {
        let err = anyhow::Error::new(ActionableError::new("Disk quota exceeded"))
            .context("failed to apply generation 4");
        assert_eq!(failure_message(err.as_ref()), "Disk quota exceeded");

        let err = anyhow::anyhow!("kubectl exited with status 1").context("apply failed");
        assert_eq!(failure_message(err.as_ref()), "apply failed");
    }
}
