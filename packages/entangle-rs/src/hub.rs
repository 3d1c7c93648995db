//! Hub: the bus, machines and adapters of one process, built together.
//!
//! ```ignore
//! let hub = Hub::new(&Config::from_env()?)?;
//!
//! hub.machines().register("payment-1", payment_config());
//! let result = hub.drive("payment-1", "start", payload! { "amount" => 500 }).await?;
//! ```

use anyhow::Result;
use tracing::info;

use crate::adapter::AdapterRegistry;
use crate::bus::{EventBus, EventBusBuilder};
use crate::config::Config;
use crate::core::{topics, Payload};
use crate::error::EntangleError;
use crate::machine::{MachineRegistry, TransitionResult};

/// Owns one [`EventBus`], one [`MachineRegistry`] and one
/// [`AdapterRegistry`].
///
/// Cheap to clone; clones share all three.
#[derive(Debug, Clone)]
pub struct Hub {
    bus: EventBus,
    machines: MachineRegistry,
    adapters: AdapterRegistry,
}

impl Hub {
    /// Build a hub with the default adapters from `config`.
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_bus(config, EventBus::builder())
    }

    /// Like [`new`](Self::new), with a caller-prepared bus builder.
    ///
    /// Use this to register taps; history, timeout and failure capacity
    /// from `config` are applied on top.
    pub fn with_bus(config: &Config, builder: EventBusBuilder) -> Result<Self> {
        let bus = builder
            .with_history_capacity(config.history_capacity)
            .with_optional_handler_timeout(config.handler_timeout)
            .with_failure_capacity(config.failure_channel_capacity)
            .build();
        let adapters = AdapterRegistry::with_defaults_from(&config.http())?;

        info!(
            history_capacity = config.history_capacity,
            handler_timeout_ms = config.handler_timeout.map(|t| t.as_millis() as u64),
            adapters = ?adapters.adapter_types(),
            "hub ready"
        );

        Ok(Self::from_parts(bus, MachineRegistry::new(), adapters))
    }

    /// Assemble a hub from existing components.
    pub fn from_parts(bus: EventBus, machines: MachineRegistry, adapters: AdapterRegistry) -> Self {
        Self {
            bus,
            machines,
            adapters,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn machines(&self) -> &MachineRegistry {
        &self.machines
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    /// Transition machine `id` and announce it.
    ///
    /// On success a `machine:transition` event carrying the result is
    /// emitted before returning. Rejected transitions are returned with
    /// `success: false` and emit nothing.
    pub async fn drive(
        &self,
        id: &str,
        event: &str,
        payload: Payload,
    ) -> Result<TransitionResult, EntangleError> {
        let result = self.machines.transition(id, event, payload)?;

        if result.success {
            self.bus
                .emit(topics::MACHINE_TRANSITION, result.to_payload())
                .await;
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Event;
    use crate::machine::{MachineConfig, TransitionTable};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn payment_machine() -> MachineConfig {
        MachineConfig::new().transitions(
            [
                ("idle", "start", "processing"),
                ("processing", "complete", "done"),
                ("processing", "fail", "failed"),
            ]
            .into_iter()
            .collect::<TransitionTable>(),
        )
    }

    #[test]
    fn test_config_reaches_components() {
        let config = Config {
            history_capacity: 3,
            handler_timeout: Some(Duration::from_millis(20)),
            ..Config::default()
        };
        let hub = Hub::new(&config).unwrap();

        assert_eq!(hub.bus().history_capacity(), 3);
        assert!(hub.machines().is_empty());
        assert!(hub.adapters().get("http").is_some());
        assert!(hub.adapters().get("websocket").is_some());
    }

    #[tokio::test]
    async fn test_drive_announces_successful_transitions() {
        let hub = Hub::new(&Config::default()).unwrap();
        hub.machines().register("payment-1", payment_machine());

        let seen: Arc<Mutex<Vec<Arc<Event>>>> = Arc::default();
        let sink = seen.clone();
        hub.bus().on(topics::MACHINE_TRANSITION, move |event: Arc<Event>| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(event);
                anyhow::Ok(())
            }
        });

        let result = hub
            .drive("payment-1", "start", crate::payload! { "amount" => 500 })
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.to, "processing");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].get("machineId"), Some(&json!("payment-1")));
        assert_eq!(seen[0].get("from"), Some(&json!("idle")));
        assert_eq!(seen[0].get("to"), Some(&json!("processing")));
        assert_eq!(seen[0].get("context"), Some(&json!({ "amount": 500 })));
    }

    #[tokio::test]
    async fn test_drive_rejection_emits_nothing() {
        let hub = Hub::new(&Config::default()).unwrap();
        hub.machines().register("payment-1", payment_machine());

        let result = hub
            .drive("payment-1", "complete", Payload::new())
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.from, "idle");
        assert_eq!(hub.bus().history_len(), 0);
        assert_eq!(hub.machines().get("payment-1").unwrap().state(), "idle");
    }

    #[tokio::test]
    async fn test_drive_unknown_machine() {
        let hub = Hub::new(&Config::default()).unwrap();

        let err = hub.drive("ghost", "start", Payload::new()).await.unwrap_err();
        assert!(matches!(err, EntangleError::MachineNotFound { .. }));
        assert_eq!(hub.bus().history_len(), 0);
    }

    #[test]
    fn test_clones_share_state() {
        let hub = Hub::new(&Config::default()).unwrap();
        let other = hub.clone();

        other.machines().register("m", MachineConfig::default());
        assert!(hub.machines().contains("m"));
    }
}
