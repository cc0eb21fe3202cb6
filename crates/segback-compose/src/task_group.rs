//! Tracked tasks sharing one cancellation signal.
//!
//! The first task to fail records its error and cancels the shared token; the
//! remaining tasks observe the token at their next blocking point and stop.
//! Later errors are logged and discarded.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, warn};

use crate::error::{ComposeError, Result};

/// A set of spawned tasks that fail together.
#[derive(Clone)]
pub struct TaskGroup {
    tracker: TaskTracker,
    cancel: CancellationToken,
    first_error: Arc<Mutex<Option<ComposeError>>>,
}

impl TaskGroup {
    /// Create a group whose token is a child of `parent`.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancel: parent.child_token(),
            first_error: Arc::new(Mutex::new(None)),
        }
    }

    /// The shared cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// True once any task failed or the parent was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Spawn a tracked task. A returned error or a panic fails the group.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let group = self.clone();
        self.tracker.spawn(async move {
            let outcome = match tokio::spawn(fut).await {
                Ok(result) => result,
                Err(join_err) => Err(ComposeError::Pack {
                    name: String::new(),
                    reason: format!("task panicked: {}", join_err),
                }),
            };
            if let Err(e) = outcome {
                group.record(e);
            }
        });
    }

    /// Record a failure. Only the first concrete error is kept.
    pub fn record(&self, err: ComposeError) {
        let mut slot = self.first_error.lock();
        match slot.as_ref() {
            None if matches!(err, ComposeError::Cancelled) && self.cancel.is_cancelled() => {
                // a task that noticed the cancellation is not the cause of it
            }
            None => {
                error!(error = %err, "Composition task failed, cancelling run");
                *slot = Some(err);
                self.cancel.cancel();
            }
            Some(_) => warn!(error = %err, "Discarding error after first failure"),
        }
    }

    /// First recorded error, if any.
    pub fn first_error(&self) -> Option<ComposeError> {
        self.first_error.lock().clone()
    }

    /// Error to surface after a failed operation: the recorded first error, or
    /// `Cancelled` when the group was cancelled from outside.
    pub fn failure(&self) -> ComposeError {
        self.first_error().unwrap_or(ComposeError::Cancelled)
    }

    /// Wait for every task spawned so far and any they spawn in turn.
    pub async fn wait(&self) -> Result<()> {
        self.tracker.close();
        self.tracker.wait().await;
        match self.first_error() {
            Some(e) => Err(e),
            None if self.cancel.is_cancelled() => Err(ComposeError::Cancelled),
            None => Ok(()),
        }
    }
}
