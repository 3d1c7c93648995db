//! Test doubles for code built on entangle.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! entangle = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Example
//!
//! ```ignore
//! use entangle::testing::{EventLatch, RecordingHandler};
//!
//! let recorder = RecordingHandler::new();
//! bus.on("wallet:created", recorder.clone());
//!
//! let latch = EventLatch::new(1);
//! bus.on("wallet:created", latch.handler());
//!
//! service.create_wallet().await?;
//! latch.await_zero().await;
//!
//! assert_eq!(recorder.count(), 1);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

use crate::adapter::Adapter;
use crate::bus::EventHandler;
use crate::core::Event;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// RecordingHandler
// =============================================================================

/// Handler that remembers every event it receives.
///
/// Clones share the same record, so keep one clone and subscribe another.
#[derive(Debug, Clone, Default)]
pub struct RecordingHandler {
    events: Arc<Mutex<Vec<Arc<Event>>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Arc<Event>> {
        lock(&self.events).clone()
    }

    /// Event types in the order received.
    pub fn event_types(&self) -> Vec<String> {
        lock(&self.events)
            .iter()
            .map(|e| e.event_type.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn last(&self) -> Option<Arc<Event>> {
        lock(&self.events).last().cloned()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: Arc<Event>) -> Result<()> {
        lock(&self.events).push(event);
        Ok(())
    }
}

// =============================================================================
// FailingHandler
// =============================================================================

#[derive(Debug, Clone)]
enum FailureMode {
    Error(String),
    Panic(String),
}

/// Handler that always fails, either by returning an error or by panicking.
///
/// Counts its invocations so tests can check it was still reached.
#[derive(Debug, Clone)]
pub struct FailingHandler {
    mode: FailureMode,
    calls: Arc<AtomicUsize>,
}

impl FailingHandler {
    /// Fail by returning `Err(message)`.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            mode: FailureMode::Error(message.into()),
            calls: Arc::default(),
        }
    }

    /// Fail by panicking with `message`.
    pub fn panic(message: impl Into<String>) -> Self {
        Self {
            mode: FailureMode::Panic(message.into()),
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for FailingHandler {
    async fn handle(&self, _event: Arc<Event>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            FailureMode::Error(message) => Err(anyhow!("{}", message)),
            FailureMode::Panic(message) => panic!("{}", message),
        }
    }
}

// =============================================================================
// EventLatch
// =============================================================================

#[derive(Debug)]
struct LatchState {
    remaining: AtomicUsize,
    notify: Notify,
}

/// Countdown latch for waiting on an exact number of events.
///
/// Tests should wait for meaning, not time. Clones share the same count.
///
/// ```ignore
/// let latch = EventLatch::new(2);
/// bus.on("token:generated", latch.handler());
///
/// timeout(Duration::from_secs(5), latch.await_zero())
///     .await
///     .expect("latch timed out");
/// ```
#[derive(Debug, Clone)]
pub struct EventLatch {
    state: Arc<LatchState>,
}

impl EventLatch {
    /// Create a latch expecting `expected` events.
    pub fn new(expected: usize) -> Self {
        Self {
            state: Arc::new(LatchState {
                remaining: AtomicUsize::new(expected),
                notify: Notify::new(),
            }),
        }
    }

    /// Count one event down.
    ///
    /// # Panics
    ///
    /// Panics if called more times than expected.
    pub fn dec(&self) {
        let prev = self.state.remaining.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            panic!("EventLatch decremented below zero - more events than expected");
        }
        if prev == 1 {
            self.state.notify.notify_waiters();
        }
    }

    /// Wait for the count to reach zero. Returns at once if it already has.
    pub async fn await_zero(&self) {
        loop {
            // Register before checking so a concurrent dec is not missed
            let notified = self.state.notify.notified();
            if self.remaining() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn remaining(&self) -> usize {
        self.state.remaining.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// A handler that counts the latch down once per event.
    pub fn handler(&self) -> impl EventHandler {
        let latch = self.clone();
        move |_event: Arc<Event>| {
            let latch = latch.clone();
            async move {
                latch.dec();
                anyhow::Ok(())
            }
        }
    }
}

// =============================================================================
// MockAdapter
// =============================================================================

/// One call made to a [`MockAdapter`].
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterCall {
    Connect(Value),
    Send(Value),
    Receive,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<AdapterCall>,
    responses: VecDeque<Value>,
    inbound: VecDeque<Value>,
    failure: Option<String>,
}

/// Scriptable adapter that records every call.
///
/// `send` answers from the queued responses (or `Null`), `receive` from the
/// queued inbound values (or `Null`). Clones share the same script.
#[derive(Debug, Clone, Default)]
pub struct MockAdapter {
    state: Arc<Mutex<MockState>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the response for a future `send`.
    pub fn respond_with(&self, response: Value) -> &Self {
        lock(&self.state).responses.push_back(response);
        self
    }

    /// Queue a value for a future `receive`.
    pub fn push_inbound(&self, value: Value) -> &Self {
        lock(&self.state).inbound.push_back(value);
        self
    }

    /// Make every following call fail with `message`.
    pub fn fail_with(&self, message: impl Into<String>) -> &Self {
        lock(&self.state).failure = Some(message.into());
        self
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        lock(&self.state).calls.clone()
    }

    /// Payloads passed to `send`, in order.
    pub fn sent(&self) -> Vec<Value> {
        lock(&self.state)
            .calls
            .iter()
            .filter_map(|call| match call {
                AdapterCall::Send(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: AdapterCall) -> Result<MutexGuard<'_, MockState>> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        if let Some(message) = state.failure.clone() {
            return Err(anyhow!(message));
        }
        Ok(state)
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    async fn connect(&self, config: Value) -> Result<()> {
        self.record(AdapterCall::Connect(config))?;
        Ok(())
    }

    async fn send(&self, data: Value) -> Result<Value> {
        let mut state = self.record(AdapterCall::Send(data))?;
        Ok(state.responses.pop_front().unwrap_or(Value::Null))
    }

    async fn receive(&self) -> Result<Value> {
        let mut state = self.record(AdapterCall::Receive)?;
        Ok(state.inbound.pop_front().unwrap_or(Value::Null))
    }
}
