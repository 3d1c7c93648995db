//! Event Taps - observe emissions without taking part in them.
//!
//! Taps are the bus's middleware hook. They are registered once, when the
//! bus is built, and see every emitted event after its handlers ran. Use
//! them for:
//! - Forwarding integration events to an external system
//! - Metrics and auditing
//! - Logging
//!
//! Collaborators that want to announce their own operations call `emit`
//! themselves; nothing wraps or patches their methods.
//!
//! # Execution Order
//!
//! ```text
//! emit(type, data)
//!  → history.push
//!  → handlers (priority order, one at a time)
//!  → taps     ← here (observe the finished emission)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use entangle::{EventTap, TapContext, Event};
//!
//! pub struct AuditTap {
//!     sink: AuditSink,
//! }
//!
//! #[async_trait]
//! impl EventTap for AuditTap {
//!     async fn on_event(&self, event: &Event, ctx: &TapContext) -> Result<()> {
//!         self.sink.record(&event.event_type, ctx.notified).await
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use crate::core::Event;

// =============================================================================
// Tap Context
// =============================================================================

/// Context provided to event taps.
///
/// Intentionally minimal - taps observe, they don't act.
#[derive(Debug, Clone)]
pub struct TapContext {
    /// Handlers that completed successfully for this emission.
    pub notified: usize,
    /// Handlers actually invoked for this emission. Skips `once`
    /// subscriptions already claimed by another emission.
    pub subscribers: usize,
    /// When the tap was invoked.
    pub timestamp: Instant,
}

impl TapContext {
    pub(crate) fn new(notified: usize, subscribers: usize) -> Self {
        Self {
            notified,
            subscribers,
            timestamp: Instant::now(),
        }
    }

    /// Number of handlers that failed for this emission.
    pub fn failed(&self) -> usize {
        self.subscribers.saturating_sub(self.notified)
    }
}

// =============================================================================
// Event Tap Trait
// =============================================================================

/// Trait for observing emitted events.
///
/// Errors are logged but do not affect the emission or its return value.
#[async_trait]
pub trait EventTap: Send + Sync + 'static {
    /// Called once per emission, after every handler finished.
    async fn on_event(&self, event: &Event, ctx: &TapContext) -> Result<()>;
}

// =============================================================================
// Tap Runner
// =============================================================================

/// A registered tap plus its optional event-type filter.
pub(crate) struct TapRunner {
    tap: Arc<dyn EventTap>,
    event_type: Option<String>,
    name: &'static str,
}

impl TapRunner {
    /// Tap every event.
    pub fn new<T: EventTap>(tap: T) -> Self {
        Self {
            tap: Arc::new(tap),
            event_type: None,
            name: std::any::type_name::<T>(),
        }
    }

    /// Tap only events of `event_type`.
    pub fn for_type<T: EventTap>(event_type: impl Into<String>, tap: T) -> Self {
        Self {
            event_type: Some(event_type.into()),
            ..Self::new(tap)
        }
    }

    pub fn matches(&self, event_type: &str) -> bool {
        self.event_type.as_deref().map_or(true, |t| t == event_type)
    }

    /// Run the tap if the event matches. Failures are logged and swallowed.
    pub async fn run(&self, event: &Event, ctx: &TapContext) {
        if !self.matches(&event.event_type) {
            return;
        }
        if let Err(e) = self.tap.on_event(event, ctx).await {
            warn!(
                tap = self.name,
                event_type = %event.event_type,
                error = %e,
                "tap failed"
            );
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl std::fmt::Debug for TapRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapRunner")
            .field("name", &self.name)
            .field("event_type", &self.event_type)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Payload;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTap {
        seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventTap for CountingTap {
        async fn on_event(&self, _event: &Event, _ctx: &TapContext) -> Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct BrokenTap;

    #[async_trait]
    impl EventTap for BrokenTap {
        async fn on_event(&self, _event: &Event, _ctx: &TapContext) -> Result<()> {
            anyhow::bail!("sink unavailable")
        }
    }

    #[tokio::test]
    async fn test_unfiltered_tap_sees_everything() {
        let seen = Arc::new(AtomicUsize::new(0));
        let runner = TapRunner::new(CountingTap { seen: seen.clone() });
        let ctx = TapContext::new(0, 0);

        runner.run(&Event::new("a", Payload::new()), &ctx).await;
        runner.run(&Event::new("b", Payload::new()), &ctx).await;

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_filtered_tap_skips_other_types() {
        let seen = Arc::new(AtomicUsize::new(0));
        let runner = TapRunner::for_type("auth:login", CountingTap { seen: seen.clone() });
        let ctx = TapContext::new(0, 0);

        runner.run(&Event::new("auth:logout", Payload::new()), &ctx).await;
        runner.run(&Event::new("auth:login", Payload::new()), &ctx).await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tap_error_is_swallowed() {
        let runner = TapRunner::new(BrokenTap);
        // Must not panic or propagate
        runner
            .run(&Event::new("a", Payload::new()), &TapContext::new(1, 1))
            .await;
        assert!(runner.name().contains("BrokenTap"));
    }

    #[test]
    fn test_context_failed_count() {
        let ctx = TapContext::new(2, 3);
        assert_eq!(ctx.failed(), 1);
    }
}
