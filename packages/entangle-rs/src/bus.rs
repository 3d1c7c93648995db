//! Event bus: subscription registry, dispatcher, and history.
//!
//! # Guarantees
//!
//! - **Priority order**: handlers run in descending priority; equal
//!   priorities keep registration order
//! - **One at a time**: handler N+1 starts only after handler N finished
//! - **Failure isolation**: a handler that errors, panics or times out is
//!   reported on the failure channel and the emission carries on
//! - **Once means once**: a `once` subscription is claimed before it runs and
//!   removed right after, so not even a re-entrant `emit` from its own
//!   handler can fire it twice
//! - **In-memory only**: events are kept in a bounded history ring and never
//!   persisted
//!
//! # Re-entrancy
//!
//! Handlers may call `emit` on a clone of the bus. Each emission iterates a
//! snapshot of the subscriptions taken when it started, so subscriptions
//! added or removed while it runs only affect later emissions.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::core::{Event, Payload, SubscriptionId};
use crate::error::{FailureKind, HandlerFailure};
use crate::history::{HistoryRing, DEFAULT_HISTORY_CAPACITY};
use crate::tap::{EventTap, TapContext, TapRunner};

/// Default capacity of the failure broadcast channel.
pub const DEFAULT_FAILURE_CAPACITY: usize = 256;

// =============================================================================
// Handler
// =============================================================================

/// Something that reacts to emitted events.
///
/// Implemented automatically for async closures taking `Arc<Event>`:
///
/// ```ignore
/// bus.on("auth:login", |event: Arc<Event>| async move {
///     tracing::info!(user = ?event.get("user"), "logged in");
///     Ok(())
/// });
/// ```
///
/// Returning `Err` (or panicking) marks this handler as failed for the
/// emission; it does not stop the handlers after it.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: Arc<Event>) -> Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, event: Arc<Event>) -> Result<()> {
        (self)(event).await
    }
}

/// Options for [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Remove the subscription after it fires once.
    pub once: bool,
    /// Higher runs earlier. Defaults to 0.
    pub priority: i32,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// A registered handler bound to one event type.
pub(crate) struct Subscription {
    id: SubscriptionId,
    event_type: String,
    handler: Arc<dyn EventHandler>,
    once: bool,
    priority: i32,
    created_at: DateTime<Utc>,
    /// Set when a `once` subscription has been claimed by an emission.
    fired: AtomicBool,
}

impl Subscription {
    /// Claim the right to run. Always true for regular subscriptions; true
    /// exactly one time for `once` subscriptions.
    fn claim(&self) -> bool {
        !self.once || !self.fired.swap(true, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .field("once", &self.once)
            .field("priority", &self.priority)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Removes a claimed `once` subscription when dropped.
struct OnceRemoval<'a> {
    bus: &'a EventBus,
    subscription: &'a Subscription,
}

impl Drop for OnceRemoval<'_> {
    fn drop(&mut self) {
        self.bus
            .registry()
            .remove(&self.subscription.event_type, self.subscription.id);
    }
}

/// Event type → subscriptions, each bucket kept in dispatch order.
#[derive(Default)]
struct SubscriptionRegistry {
    buckets: HashMap<String, Vec<Arc<Subscription>>>,
}

impl SubscriptionRegistry {
    fn insert(&mut self, subscription: Arc<Subscription>) {
        let bucket = self
            .buckets
            .entry(subscription.event_type.clone())
            .or_default();
        // After every existing entry of equal or higher priority, which keeps
        // registration order among ties.
        let at = bucket.partition_point(|s| s.priority >= subscription.priority);
        bucket.insert(at, subscription);
    }

    fn remove(&mut self, event_type: &str, id: SubscriptionId) -> bool {
        let Some(bucket) = self.buckets.get_mut(event_type) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|s| s.id != id);
        let removed = bucket.len() != before;
        if bucket.is_empty() {
            self.buckets.remove(event_type);
        }
        removed
    }

    fn clear(&mut self, event_type: Option<&str>) -> usize {
        match event_type {
            Some(t) => self.buckets.remove(t).map_or(0, |b| b.len()),
            None => {
                let count = self.buckets.values().map(Vec::len).sum();
                self.buckets.clear();
                count
            }
        }
    }

    fn snapshot(&self, event_type: &str) -> Vec<Arc<Subscription>> {
        self.buckets.get(event_type).cloned().unwrap_or_default()
    }

    fn count(&self, event_type: &str) -> usize {
        self.buckets.get(event_type).map_or(0, Vec::len)
    }

    fn event_types(&self) -> BTreeSet<String> {
        self.buckets
            .iter()
            .filter(|(_, bucket)| !bucket.is_empty())
            .map(|(t, _)| t.clone())
            .collect()
    }
}

// =============================================================================
// Event Bus
// =============================================================================

struct BusInner {
    registry: Mutex<SubscriptionRegistry>,
    history: Mutex<HistoryRing>,
    taps: Vec<TapRunner>,
    handler_timeout: Option<Duration>,
    failures: broadcast::Sender<HandlerFailure>,
}

/// In-process publish/subscribe bus.
///
/// `EventBus` is a cheap handle; clones share the same registry and
/// history, so a handler can capture a clone and emit from inside an
/// emission.
///
/// # Example
///
/// ```ignore
/// let bus = EventBus::new();
///
/// bus.subscribe(
///     "wallet:transaction",
///     |event: Arc<Event>| async move { ledger.apply(&event.data).await },
///     SubscribeOptions::new().priority(10),
/// );
/// bus.on("wallet:transaction", |event: Arc<Event>| async move {
///     audit.record(&event).await
/// });
///
/// let notified = bus.emit("wallet:transaction", payload! { "amount" => 5 }).await;
/// ```
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus with default history capacity and no handler timeout.
    pub fn new() -> Self {
        EventBusBuilder::new().build()
    }

    /// Start configuring a bus.
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::new()
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register `handler` for `event_type`.
    ///
    /// Returns the generated subscription ID, needed for [`unsubscribe`].
    ///
    /// [`unsubscribe`]: EventBus::unsubscribe
    pub fn subscribe<H: EventHandler>(
        &self,
        event_type: impl Into<String>,
        handler: H,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        let subscription = Arc::new(Subscription {
            id: SubscriptionId::new(),
            event_type: event_type.into(),
            handler: Arc::new(handler),
            once: options.once,
            priority: options.priority,
            created_at: Utc::now(),
            fired: AtomicBool::new(false),
        });
        let id = subscription.id;

        debug!(
            event_type = %subscription.event_type,
            subscription_id = %id,
            priority = options.priority,
            once = options.once,
            "subscribed"
        );

        self.registry().insert(subscription);
        id
    }

    /// Register a handler with default options.
    pub fn on<H: EventHandler>(&self, event_type: impl Into<String>, handler: H) -> SubscriptionId {
        self.subscribe(event_type, handler, SubscribeOptions::default())
    }

    /// Register a handler that fires at most once.
    pub fn once<H: EventHandler>(
        &self,
        event_type: impl Into<String>,
        handler: H,
    ) -> SubscriptionId {
        self.subscribe(event_type, handler, SubscribeOptions::new().once())
    }

    /// Remove a subscription.
    ///
    /// Returns `false` for unknown types or IDs; this is never an error.
    pub fn unsubscribe(&self, event_type: &str, id: SubscriptionId) -> bool {
        let removed = self.registry().remove(event_type, id);
        if removed {
            debug!(event_type, subscription_id = %id, "unsubscribed");
        }
        removed
    }

    /// Remove every subscription for `event_type`, or every subscription
    /// at all when `None`.
    pub fn unsubscribe_all(&self, event_type: Option<&str>) {
        let removed = self.registry().clear(event_type);
        debug!(event_type = ?event_type, removed, "unsubscribed all");
    }

    // =========================================================================
    // Emission
    // =========================================================================

    /// Emit an event and deliver it to every current subscriber.
    ///
    /// Returns how many handlers completed without failing. Zero
    /// subscribers is not an error; the event is still recorded in history.
    pub async fn emit(&self, event_type: impl Into<String>, data: Payload) -> usize {
        self.emit_event(Event::new(event_type, data)).await
    }

    /// Emit an already-built event.
    pub async fn emit_event(&self, event: Event) -> usize {
        let event = Arc::new(event);

        self.history().push(event.clone());
        let subscriptions = self.registry().snapshot(&event.event_type);

        debug!(
            event_type = %event.event_type,
            event_id = %event.id,
            subscribers = subscriptions.len(),
            "emitting event"
        );

        let mut notified = 0;
        let mut invoked = 0;
        for subscription in &subscriptions {
            if !subscription.claim() {
                continue;
            }
            invoked += 1;

            // Dropped after the handler finishes, fails, or the emission
            // itself is dropped mid-handler.
            let _removal = subscription.once.then(|| OnceRemoval {
                bus: self,
                subscription,
            });

            if self.invoke(subscription, &event).await {
                notified += 1;
            }
        }

        if !self.inner.taps.is_empty() {
            let ctx = TapContext::new(notified, invoked);
            for tap in &self.inner.taps {
                tap.run(&event, &ctx).await;
            }
        }

        notified
    }

    /// Run one handler, turning errors, panics and timeouts into reports.
    async fn invoke(&self, subscription: &Subscription, event: &Arc<Event>) -> bool {
        // AssertUnwindSafe is required because the handler is not UnwindSafe
        let call = AssertUnwindSafe(subscription.handler.handle(event.clone())).catch_unwind();

        let outcome = match self.inner.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.report(
                        subscription,
                        event,
                        FailureKind::Timeout,
                        format!("handler exceeded {:?}", limit),
                    );
                    return false;
                }
            },
            None => call.await,
        };

        match outcome {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                self.report(subscription, event, FailureKind::Error, format!("{:#}", e));
                false
            }
            Err(panic_info) => {
                let message = extract_panic_message(&panic_info);
                self.report(subscription, event, FailureKind::Panic, message);
                false
            }
        }
    }

    fn report(&self, subscription: &Subscription, event: &Event, kind: FailureKind, message: String) {
        match kind {
            FailureKind::Panic => error!(
                event_type = %event.event_type,
                subscription_id = %subscription.id,
                panic = %message,
                "handler panicked"
            ),
            _ => warn!(
                event_type = %event.event_type,
                subscription_id = %subscription.id,
                kind = %kind,
                error = %message,
                "handler failed"
            ),
        }

        // No receivers is fine; the log line above is the fallback channel
        let _ = self.inner.failures.send(HandlerFailure {
            subscription_id: subscription.id,
            event_id: event.id,
            event_type: event.event_type.clone(),
            kind,
            message,
        });
    }

    /// Subscribe to handler failure reports.
    ///
    /// Only failures that happen after this call are received.
    pub fn failures(&self) -> broadcast::Receiver<HandlerFailure> {
        self.inner.failures.subscribe()
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Event types with at least one live subscription.
    pub fn event_types(&self) -> BTreeSet<String> {
        self.registry().event_types()
    }

    pub fn listener_count(&self, event_type: &str) -> usize {
        self.registry().count(event_type)
    }

    /// The last `limit` emitted events, most recent last.
    pub fn recent_events(&self, limit: usize) -> Vec<Arc<Event>> {
        self.history().recent(limit)
    }

    pub fn clear_history(&self) {
        self.history().clear();
    }

    pub fn history_len(&self) -> usize {
        self.history().len()
    }

    pub fn history_capacity(&self) -> usize {
        self.history().capacity()
    }

    // Poisoned locks are recovered: every critical section leaves the
    // registry and ring consistent.
    fn registry(&self) -> MutexGuard<'_, SubscriptionRegistry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn history(&self) -> MutexGuard<'_, HistoryRing> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("event_types", &self.event_types())
            .field("history_len", &self.history_len())
            .field("taps", &self.inner.taps)
            .finish()
    }
}

/// Extract a message from a panic payload.
fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`EventBus`].
///
/// ```ignore
/// let bus = EventBus::builder()
///     .with_history_capacity(500)
///     .with_handler_timeout(Duration::from_secs(5))
///     .with_tap(AuditTap::new(sink))
///     .build();
/// ```
pub struct EventBusBuilder {
    history_capacity: usize,
    handler_timeout: Option<Duration>,
    failure_capacity: usize,
    taps: Vec<TapRunner>,
}

impl EventBusBuilder {
    pub fn new() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            handler_timeout: None,
            failure_capacity: DEFAULT_FAILURE_CAPACITY,
            taps: Vec::new(),
        }
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Treat handlers that run longer than `timeout` as failed.
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    pub fn with_optional_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// How many unread failure reports a slow receiver may fall behind by.
    pub fn with_failure_capacity(mut self, capacity: usize) -> Self {
        self.failure_capacity = capacity;
        self
    }

    /// Observe every emission.
    pub fn with_tap<T: EventTap>(mut self, tap: T) -> Self {
        self.taps.push(TapRunner::new(tap));
        self
    }

    /// Observe emissions of one event type.
    pub fn with_tap_for<T: EventTap>(mut self, event_type: impl Into<String>, tap: T) -> Self {
        self.taps.push(TapRunner::for_type(event_type, tap));
        self
    }

    pub fn build(self) -> EventBus {
        // broadcast::channel panics on zero capacity
        let (failures, _) = broadcast::channel(self.failure_capacity.max(1));
        EventBus {
            inner: Arc::new(BusInner {
                registry: Mutex::new(SubscriptionRegistry::default()),
                history: Mutex::new(HistoryRing::new(self.history_capacity)),
                taps: self.taps,
                handler_timeout: self.handler_timeout,
                failures,
            }),
        }
    }
}

impl Default for EventBusBuilder {
    fn default() -> Self {
        Self::new()
    }
}
