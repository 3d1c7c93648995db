//! Structured error types and handler failure reports.
//!
//! `EntangleError` provides pattern-matchable errors for the framework's own
//! failure modes (unknown machine, unknown adapter, adapter misuse).
//! `HandlerFailure` describes a handler that failed during an emission.
//!
//! # The Isolation Rule
//!
//! > **A failing handler never fails the emission.**
//!
//! - Handler, tap and adapter code returns `anyhow::Result` (ergonomic for
//!   collaborators)
//! - Handler errors are converted into a [`HandlerFailure`], logged, and
//!   published on the bus failure channel; `emit` itself never returns them
//! - Adapter errors propagate unchanged to whoever called the adapter
//!
//! # Error Example
//!
//! ```ignore
//! use entangle::{AdapterRegistry, EntangleError};
//!
//! match adapters.send("smtp", data).await {
//!     Ok(response) => println!("{response}"),
//!     Err(e) => match e.downcast_ref::<EntangleError>() {
//!         Some(EntangleError::AdapterNotFound { adapter_type }) => {
//!             eprintln!("no adapter registered for {adapter_type}");
//!         }
//!         _ => eprintln!("adapter failed: {e:#}"),
//!     },
//! }
//! ```

use std::fmt;

use thiserror::Error;

use crate::core::{EventId, SubscriptionId};

// =============================================================================
// Entangle Error
// =============================================================================

/// Structured error type for entangle operations.
#[derive(Debug, Error)]
pub enum EntangleError {
    /// No machine is registered under the given ID.
    #[error("machine not found: {machine_id}")]
    MachineNotFound {
        /// The unknown machine ID.
        machine_id: String,
    },

    /// No adapter is registered under the given type name.
    #[error("adapter not found: {adapter_type}")]
    AdapterNotFound {
        /// The unknown adapter type.
        adapter_type: String,
    },

    /// The adapter was used before `connect` succeeded.
    #[error("adapter {adapter_type} is not connected")]
    NotConnected {
        /// The adapter type that was used too early.
        adapter_type: &'static str,
    },

    /// The data handed to an adapter could not be interpreted.
    #[error("invalid adapter request: {message}")]
    InvalidRequest {
        /// What was wrong with the request.
        message: String,
    },

    /// The remote endpoint answered with a non-success status.
    #[error("http request failed with status {status}: {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body, verbatim.
        body: String,
    },
}

impl EntangleError {
    pub(crate) fn machine_not_found(machine_id: impl Into<String>) -> Self {
        Self::MachineNotFound {
            machine_id: machine_id.into(),
        }
    }

    pub(crate) fn adapter_not_found(adapter_type: impl Into<String>) -> Self {
        Self::AdapterNotFound {
            adapter_type: adapter_type.into(),
        }
    }

    pub(crate) fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }
}

// =============================================================================
// Handler Failure
// =============================================================================

/// How a handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The handler returned `Err`.
    Error,
    /// The handler panicked.
    Panic,
    /// The handler exceeded the bus's handler timeout.
    Timeout,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Error => write!(f, "error"),
            FailureKind::Panic => write!(f, "panic"),
            FailureKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// Report of a handler that failed during an emission.
///
/// Published on the channel returned by
/// [`EventBus::failures`](crate::EventBus::failures). The emission that
/// produced it carried on with the next handler.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    /// The subscription whose handler failed.
    pub subscription_id: SubscriptionId,
    /// The event being delivered.
    pub event_id: EventId,
    /// Type of the event being delivered.
    pub event_type: String,
    /// How the handler failed.
    pub kind: FailureKind,
    /// Rendered error or panic message.
    pub message: String,
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "handler {} for {} failed ({}): {}",
            self.subscription_id, self.event_type, self.kind, self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_not_found_display() {
        let err = EntangleError::machine_not_found("checkout");
        assert_eq!(err.to_string(), "machine not found: checkout");
    }

    #[test]
    fn test_adapter_not_found_display() {
        let err = EntangleError::adapter_not_found("smtp");
        assert!(err.to_string().contains("adapter not found"));
        assert!(err.to_string().contains("smtp"));
    }

    #[test]
    fn test_error_can_be_downcast_from_anyhow() {
        let err: anyhow::Error = EntangleError::adapter_not_found("smtp").into();

        match err.downcast_ref::<EntangleError>() {
            Some(EntangleError::AdapterNotFound { adapter_type }) => {
                assert_eq!(adapter_type, "smtp");
            }
            other => panic!("Expected AdapterNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_http_error_display_includes_status_and_body() {
        let err = EntangleError::Http {
            status: 502,
            body: "bad gateway".into(),
        };
        let display = err.to_string();
        assert!(display.contains("502"));
        assert!(display.contains("bad gateway"));
    }

    #[test]
    fn test_handler_failure_display() {
        let failure = HandlerFailure {
            subscription_id: SubscriptionId::new(),
            event_id: EventId::new(),
            event_type: "wallet:transaction".into(),
            kind: FailureKind::Panic,
            message: "boom".into(),
        };
        let display = failure.to_string();
        assert!(display.contains("wallet:transaction"));
        assert!(display.contains("panic"));
        assert!(display.contains("boom"));
    }
}
