//! The reconciliation framework: turns per-kind callbacks into a correct
//! control loop.
//!
//! On start the framework replays every entity of the controller's kind as a
//! `Create`, then tails the kind index. Per entity it guarantees single-
//! flight with coalescing (the newest suppressed event is dispatched once
//! the in-flight callback returns) and revision-monotonic delivery. Across
//! entities there is no ordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::context::Context;
use crate::entity::Id;
use crate::error::Result;
use crate::metrics;
use crate::model::Kinded;
use crate::store::watch::retry_delay;
use crate::store::{EntityStore, Event, EventOp, Subscription, WatchCallback};

/* ============================= CONTROLLER ============================= */

/// Delivery metadata for one reconcile.
#[derive(Debug, Clone, Copy)]
pub struct Meta {
    pub revision: u64,
    pub op: EventOp,
}

/// A typed controller owning one kind of entity.
///
/// `update` routes through `create` by default, for implementations that
/// fold both into a single reconcile.
#[async_trait]
pub trait Controller<K: Kinded>: Send + Sync + 'static {
    async fn create(&self, ctx: &Context, obj: K, meta: Meta) -> Result<()>;

    async fn update(&self, ctx: &Context, obj: K, meta: Meta) -> Result<()> {
        self.create(ctx, obj, meta).await
    }

    async fn delete(&self, ctx: &Context, id: Id) -> Result<()>;
}

/* ============================= DISPATCHER ============================= */

const MAX_ATTEMPTS: u32 = 10;

struct EntityState {
    in_flight: bool,
    pending: Option<Event>,
    /// Highest revision successfully reconciled; stale events are dropped.
    last_done: u64,
}

struct Dispatcher {
    states: Mutex<HashMap<Id, EntityState>>,
    active: AtomicUsize,
    idle: Notify,
}

impl Dispatcher {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            states: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    /// Admit an event for `id`: either claim the single-flight slot or
    /// coalesce onto the pending slot (newest event wins).
    fn admit(&self, id: &Id, event: Event) -> bool {
        let mut states = self.states.lock().expect("dispatcher lock");
        let state = states.entry(id.clone()).or_insert(EntityState {
            in_flight: false,
            pending: None,
            last_done: 0,
        });
        if event.op != EventOp::Deleted && event.revision < state.last_done {
            return false;
        }
        if state.in_flight {
            state.pending = Some(event);
            return false;
        }
        state.in_flight = true;
        self.active.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Record a finished callback; returns the coalesced event to run next,
    /// if any. Clears the single-flight slot otherwise.
    fn finish(&self, id: &Id, done_revision: Option<u64>, deleted: bool) -> Option<Event> {
        let mut states = self.states.lock().expect("dispatcher lock");
        let Some(state) = states.get_mut(id) else {
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.idle.notify_waiters();
            return None;
        };
        if let Some(revision) = done_revision {
            state.last_done = state.last_done.max(revision);
        }
        if let Some(next) = state.pending.take() {
            return Some(next);
        }
        state.in_flight = false;
        if deleted {
            states.remove(id);
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.idle.notify_waiters();
        None
    }

    async fn drain(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/* ============================= RUN ============================= */

/// A running controller. `close` cancels the subscription and waits for
/// in-flight callbacks to drain.
pub struct ControllerHandle {
    ctx: Context,
    subscription: Subscription,
    dispatcher: Arc<Dispatcher>,
}

impl ControllerHandle {
    pub async fn close(self) {
        self.ctx.cancel();
        self.subscription.close().await;
        self.dispatcher.drain().await;
    }
}

/// Start a controller over its kind index: init replay, then live tail.
pub fn run<K, C>(store: &EntityStore, controller: Arc<C>, ctx: &Context) -> Result<ControllerHandle>
where
    K: Kinded,
    C: Controller<K>,
{
    let kind = K::kind();
    let ctx = ctx.child();
    let dispatcher = Dispatcher::new();

    let cb_ctx = ctx.clone();
    let cb_dispatcher = dispatcher.clone();
    let cb_kind = kind.clone();
    let callback: WatchCallback = Arc::new(move |event: Event| {
        let ctx = cb_ctx.clone();
        let dispatcher = cb_dispatcher.clone();
        let controller = controller.clone();
        let kind = cb_kind.clone();
        Box::pin(async move {
            let Some(id) = event.entity.id() else {
                warn!(kind = %kind, "event_without_entity_id");
                return Ok(());
            };
            if dispatcher.admit(&id, event.clone()) {
                tokio::spawn(run_chain::<K, C>(ctx, dispatcher, controller, kind, id, event));
            }
            Ok(())
        })
    });

    let subscription = store.watch_kind(&ctx, &kind, callback)?;
    info!(kind = %kind, "controller_started");
    Ok(ControllerHandle {
        ctx,
        subscription,
        dispatcher,
    })
}

/// Process one entity's event chain: the admitted event, then whatever
/// coalesced while it ran.
async fn run_chain<K, C>(
    ctx: Context,
    dispatcher: Arc<Dispatcher>,
    controller: Arc<C>,
    kind: Id,
    id: Id,
    first: Event,
) where
    K: Kinded,
    C: Controller<K>,
{
    let mut event = first;
    loop {
        let outcome = if ctx.is_canceled() {
            None
        } else {
            dispatch_one::<K, C>(&ctx, &controller, &kind, &id, &event).await
        };
        let deleted = event.op == EventOp::Deleted && outcome.is_some();
        // A cancelled chain still loops through coalesced events (without
        // invoking callbacks) so the dispatcher drains to idle.
        match dispatcher.finish(&id, outcome, deleted) {
            Some(next) => event = next,
            None => return,
        }
    }
}

/// Run one callback with the at-least-once retry policy. Returns the
/// revision to mark done, or `None` after exhaustion.
async fn dispatch_one<K, C>(
    ctx: &Context,
    controller: &Arc<C>,
    kind: &Id,
    id: &Id,
    event: &Event,
) -> Option<u64>
where
    K: Kinded,
    C: Controller<K>,
{
    let kind_label = kind.as_str();
    for attempt in 0..MAX_ATTEMPTS {
        metrics::RECONCILES_TOTAL.with_label_values(&[kind_label]).inc();

        let meta = Meta {
            revision: event.revision,
            op: event.op,
        };
        let result = match event.op {
            EventOp::Deleted => controller.delete(ctx, id.clone()).await,
            EventOp::Added | EventOp::Updated => match K::decode(&event.entity) {
                Ok(obj) => {
                    if event.op == EventOp::Added {
                        controller.create(ctx, obj, meta).await
                    } else {
                        controller.update(ctx, obj, meta).await
                    }
                }
                Err(err) => {
                    // A snapshot that cannot decode will not improve on
                    // retry; drop the event.
                    warn!(kind = %kind, entity = %id, error = %err, "reconcile_decode_failed");
                    return Some(event.revision);
                }
            },
        };

        match result {
            Ok(()) => return Some(event.revision),
            Err(err) => {
                metrics::RECONCILE_ERRORS.with_label_values(&[kind_label]).inc();
                warn!(
                    kind = %kind,
                    entity = %id,
                    revision = event.revision,
                    attempt,
                    error = %err,
                    "reconcile_error"
                );
                tokio::select! {
                    _ = tokio::time::sleep(retry_delay(attempt)) => {}
                    _ = ctx.cancelled() => return None,
                }
            }
        }
    }
    // The entity stays in its last successfully-reconciled state.
    metrics::RECONCILE_EXHAUSTED.with_label_values(&[kind_label]).inc();
    warn!(kind = %kind, entity = %id, revision = event.revision, "reconcile_exhausted");
    None
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::error::Error;
    use crate::model::compute::{Node, NodeStatus};
    use crate::model::{self, Kinded};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct RecordingController {
        log: StdMutex<Vec<String>>,
        fail_first_n: AtomicUsize,
        delay: Option<Duration>,
    }

    impl RecordingController {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                log: StdMutex::new(Vec::new()),
                fail_first_n: AtomicUsize::new(0),
                delay: None,
            })
        }

        fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                log: StdMutex::new(Vec::new()),
                fail_first_n: AtomicUsize::new(0),
                delay: Some(delay),
            })
        }

        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Controller<Node> for RecordingController {
        async fn create(&self, _ctx: &Context, obj: Node, meta: Meta) -> Result<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self
                .fail_first_n
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Provider("transient".into()));
            }
            self.log
                .lock()
                .unwrap()
                .push(format!("create:{}:{}", obj.id.name(), meta.revision));
            Ok(())
        }

        async fn delete(&self, _ctx: &Context, id: Id) -> Result<()> {
            self.log.lock().unwrap().push(format!("delete:{}", id.name()));
            Ok(())
        }
    }

    fn open_store() -> EntityStore {
        EntityStore::open(model::registry()).unwrap()
    }

    fn node(name: &str) -> Node {
        Node::new(Id::new(&format!("io.weft.compute/{name}"))).with_status(NodeStatus::Ready)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition should hold within the timeout");
    }

    #[tokio::test]
    async fn test_init_replay_delivers_existing_entities() {
        let store = open_store();
        let ctx = Context::background();
        store.put(&ctx, node("n1").encode(), 0).unwrap();
        store.put(&ctx, node("n2").encode(), 0).unwrap();

        let controller = RecordingController::new();
        let handle = run(&store, controller.clone(), &ctx).unwrap();

        wait_for(|| controller.entries().len() == 2).await;
        let entries = controller.entries();
        assert!(entries.contains(&"create:n1:1".to_string()));
        assert!(entries.contains(&"create:n2:1".to_string()));
        handle.close().await;
    }

    #[tokio::test]
    async fn test_live_events_create_update_delete() {
        let store = open_store();
        let ctx = Context::background();
        let controller = RecordingController::new();
        let handle = run(&store, controller.clone(), &ctx).unwrap();

        store.put(&ctx, node("n1").encode(), 0).unwrap();
        wait_for(|| controller.entries().len() == 1).await;

        store.put(&ctx, node("n1").encode(), 1).unwrap();
        wait_for(|| controller.entries().len() == 2).await;

        store.delete(&ctx, &Id::new("io.weft.compute/n1")).unwrap();
        wait_for(|| controller.entries().len() == 3).await;

        assert_eq!(
            controller.entries(),
            vec!["create:n1:1", "create:n1:2", "delete:n1"]
        );
        handle.close().await;
    }

    #[tokio::test]
    async fn test_single_flight_coalesces_to_latest() {
        let store = open_store();
        let ctx = Context::background();
        // Slow callbacks so several puts land while one is in flight.
        let controller = RecordingController::with_delay(Duration::from_millis(100));
        let handle = run(&store, controller.clone(), &ctx).unwrap();

        store.put(&ctx, node("n1").encode(), 0).unwrap();
        for rev in 1..=4 {
            store.put(&ctx, node("n1").encode(), rev).unwrap();
        }

        // The chain must finish with revision 5; intermediate revisions may
        // coalesce away, but never run out of order or in parallel.
        wait_for(|| {
            controller
                .entries()
                .last()
                .is_some_and(|e| e == "create:n1:5")
        })
        .await;
        let entries = controller.entries();
        assert!(entries.len() < 5, "coalescing should drop intermediate events");
        let revisions: Vec<u64> = entries
            .iter()
            .map(|e| e.rsplit(':').next().unwrap().parse().unwrap())
            .collect();
        let mut sorted = revisions.clone();
        sorted.sort_unstable();
        assert_eq!(revisions, sorted, "per-entity delivery must be revision ordered");
        handle.close().await;
    }

    #[tokio::test]
    async fn test_callback_errors_are_retried() {
        let store = open_store();
        let ctx = Context::background();
        let controller = RecordingController::new();
        controller.fail_first_n.store(2, Ordering::SeqCst);
        let handle = run(&store, controller.clone(), &ctx).unwrap();

        store.put(&ctx, node("n1").encode(), 0).unwrap();
        wait_for(|| controller.entries() == vec!["create:n1:1"]).await;
        handle.close().await;
    }

    #[tokio::test]
    async fn test_close_stops_delivery() {
        let store = open_store();
        let ctx = Context::background();
        let controller = RecordingController::new();
        let handle = run(&store, controller.clone(), &ctx).unwrap();
        handle.close().await;

        store.put(&ctx, node("n1").encode(), 0).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(controller.entries().is_empty());
    }
}
