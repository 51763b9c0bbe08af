use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/* ============================= CONTEXT ============================= */

/// Cooperative cancellation carried on every public operation.
///
/// Wraps a [`CancellationToken`] plus an optional deadline. Derived contexts
/// share the parent's token lineage: cancelling a parent cancels every child.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled. Root of every context tree.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A child context with its own cancel handle.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// A child context that additionally expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(self.deadline.map_or(deadline, |d| d.min(deadline))),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fast-path check at operation entry.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }

    /// Resolves when the context is cancelled (directly, via a parent, or by
    /// deadline expiry).
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep(remaining) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/* ============================= TESTS ============================= */
