//! Index event logs and watch subscriptions.
//!
//! Every index key owns an append-only event log. A subscription replays
//! `Added` for the entities matching at registration, then tails the log in
//! commit order. Delivery is at-least-once: a failing callback is retried
//! with exponential backoff before the subscription tears down.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::context::Context;
use crate::entity::Entity;
use crate::error::Result;

/* ============================= EVENTS ============================= */

/// Operation code carried on watched events. Wire values are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOp {
    Added = 1,
    Updated = 2,
    Deleted = 3,
}

impl EventOp {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// One index event: the operation, the entity's revision at commit time,
/// and a snapshot. `Deleted` snapshots carry the pre-deletion attributes.
#[derive(Debug, Clone)]
pub struct Event {
    pub op: EventOp,
    pub revision: u64,
    pub entity: Arc<Entity>,
}

/* ============================= LOG ============================= */

/// Append-only event log for a single `(attr-id, value)` index key.
#[derive(Default)]
pub struct IndexLog {
    events: RwLock<Vec<Event>>,
    notify: Notify,
}

impl IndexLog {
    pub fn append(&self, event: Event) {
        self.events.write().expect("index log lock").push(event);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.events.read().expect("index log lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, cursor: usize) -> Option<Event> {
        self.events.read().expect("index log lock").get(cursor).cloned()
    }
}

/* ============================= BACKOFF ============================= */

const RETRY_MIN: Duration = Duration::from_millis(50);
const RETRY_MAX: Duration = Duration::from_secs(5);
const RETRY_ATTEMPTS: u32 = 10;

/// Delay before retry attempt `attempt` (0-based): 50ms doubling, capped at 5s.
pub(crate) fn retry_delay(attempt: u32) -> Duration {
    RETRY_MIN
        .checked_mul(2u32.saturating_pow(attempt))
        .map_or(RETRY_MAX, |d| d.min(RETRY_MAX))
}

/* ============================= SUBSCRIPTION ============================= */

/// Async event callback. Errors trigger the at-least-once retry policy.
pub type WatchCallback = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Handle for one watch. Dropping it does not stop delivery; call
/// [`Subscription::close`] (or cancel the supplying context).
#[derive(Debug)]
pub struct Subscription {
    ctx: Context,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Stop delivery and wait for the pending callback to drain.
    pub async fn close(self) {
        self.ctx.cancel();
        let _ = self.task.await;
    }
}

/// Spawn the delivery task for one subscription.
///
/// `replay` is the `Added` backlog snapshotted at registration; `cursor` is
/// the log position the tail starts from (snapshotted under the same lock).
pub(crate) fn spawn_subscription(
    label: String,
    ctx: Context,
    replay: Vec<Event>,
    log: Arc<IndexLog>,
    cursor: usize,
    callback: WatchCallback,
) -> Subscription {
    let task_ctx = ctx.clone();
    let task = tokio::spawn(async move {
        let mut cursor = cursor;

        for event in replay {
            if task_ctx.is_canceled() {
                return;
            }
            if !deliver(&label, &task_ctx, &callback, event).await {
                return;
            }
        }

        loop {
            let notified = log.notify.notified();
            tokio::pin!(notified);

            if let Some(event) = log.get(cursor) {
                cursor += 1;
                if task_ctx.is_canceled() {
                    return;
                }
                if !deliver(&label, &task_ctx, &callback, event).await {
                    return;
                }
                continue;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = task_ctx.cancelled() => return,
            }
        }
    });

    Subscription { ctx, task }
}

/// Deliver one event with the retry policy. Returns false when the
/// subscription should tear down.
async fn deliver(label: &str, ctx: &Context, callback: &WatchCallback, event: Event) -> bool {
    for attempt in 0..RETRY_ATTEMPTS {
        match callback(event.clone()).await {
            Ok(()) => return true,
            Err(err) => {
                warn!(
                    watch = %label,
                    revision = event.revision,
                    attempt,
                    error = %err,
                    "watch_callback_error"
                );
                let delay = retry_delay(attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.cancelled() => return false,
                }
            }
        }
    }
    info!(watch = %label, revision = event.revision, "watch_subscription_failed");
    false
}

/* ============================= TESTS ============================= */
