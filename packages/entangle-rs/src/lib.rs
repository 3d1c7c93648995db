//! # Entangle
//!
//! An in-process, event-driven integration layer: services talk through an
//! event bus, multi-step workflows live in table-driven state machines, and
//! machines reach the outside world through pluggable adapters.
//!
//! ## Core Concepts
//!
//! - [`EventBus`] = who hears about what happened
//! - [`MachineRegistry`] = where each workflow stands
//! - [`AdapterRegistry`] = how workflows talk to external transports
//!
//! The three are independent. A [`Hub`] builds them together from a
//! [`Config`] and links the first two through [`Hub::drive`].
//!
//! ## Architecture
//!
//! ```text
//! Auth service ──emit("auth:login")──┐
//!                                    ▼
//! Wallet service ◄──handler──── EventBus ◄──emit("machine:transition")──┐
//!                                    │                                  │
//!                                    └─► history ring (bounded)         │
//!                                                                       │
//! Hub::drive(id, event) ──► MachineRegistry.transition() ───────────────┘
//!                                    │
//!                                    ▼
//!                           AdapterRegistry ──► http / websocket
//! ```
//!
//! ## Guarantees
//!
//! - **Priority order**: handlers run highest priority first, ties in
//!   registration order
//! - **Failure isolation**: a failing handler never stops its siblings and
//!   never fails the emitter
//! - **Once means once**: one-shot handlers fire at most one time
//! - **In-memory only**: nothing is persisted; machines are serde types so
//!   callers can persist them
//!
//! ## Example
//!
//! ```ignore
//! use entangle::{payload, Config, Event, Hub, MachineConfig, TransitionTable};
//!
//! let hub = Hub::new(&Config::from_env()?)?;
//!
//! hub.bus().on("machine:transition", |event: Arc<Event>| async move {
//!     tracing::info!(to = ?event.get("to"), "payment moved");
//!     Ok(())
//! });
//!
//! hub.machines().register(
//!     "payment-1",
//!     MachineConfig::new().transitions(
//!         [("idle", "start", "processing"), ("processing", "complete", "done")]
//!             .into_iter()
//!             .collect::<TransitionTable>(),
//!     ),
//! );
//!
//! hub.drive("payment-1", "start", payload! { "amount" => 500 }).await?;
//! ```

// Core modules
mod adapter;
mod bus;
mod config;
mod core;
mod error;
mod history;
mod http_adapter;
mod hub;
mod machine;
mod socket_adapter;
mod tap;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export core types
pub use crate::core::{topics, Event, EventId, Payload, SubscriptionId};

// Re-export error types
pub use crate::error::{EntangleError, FailureKind, HandlerFailure};

// Re-export bus types
pub use bus::{EventBus, EventBusBuilder, EventHandler, SubscribeOptions, DEFAULT_FAILURE_CAPACITY};
pub use history::{HistoryRing, DEFAULT_HISTORY_CAPACITY};

// Re-export tap types (event observation)
pub use tap::{EventTap, TapContext};

// Re-export machine types
pub use machine::{
    merge_context, Machine, MachineConfig, MachineRegistry, TransitionResult, TransitionTable,
    DEFAULT_INITIAL_STATE, DEFAULT_MACHINE_TYPE,
};

// Re-export adapter types
pub use adapter::{Adapter, AdapterRegistry, HTTP_ADAPTER, SOCKET_ADAPTER};
pub use http_adapter::{HttpAdapter, HttpConfig, HttpRequest, DEFAULT_HTTP_TIMEOUT};
pub use socket_adapter::SocketAdapter;

// Re-export entry points
pub use config::Config;
pub use hub::Hub;

// Re-export commonly used external types
pub use async_trait::async_trait;

// Used by the `payload!` macro so callers need no serde_json dependency
#[doc(hidden)]
pub use serde_json as __serde_json;
