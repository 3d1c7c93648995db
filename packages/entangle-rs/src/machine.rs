//! Table-driven state machines and the registry that owns them.
//!
//! A machine is a named instance of `state + transition table + context`.
//! Driving it is a lookup, not code: `transitions[state][event]` names the
//! destination, and the payload is shallow-merged into the context.
//!
//! # Key Properties
//!
//! - **Synchronous**: `transition` never suspends
//! - **Rejection is a result**: an event with no table entry returns
//!   `success: false` and changes nothing; calling it again changes nothing
//!   again
//! - **Last writer wins**: re-registering an ID replaces the machine, and
//!   payload keys replace context keys
//! - **Terminal states are legal**: a destination with no outbound events
//!   simply rejects everything afterwards
//!
//! # Example
//!
//! ```ignore
//! let machines = MachineRegistry::new();
//! machines.register(
//!     "flow",
//!     MachineConfig::new().transitions(
//!         TransitionTable::new()
//!             .on("idle", "start", "processing")
//!             .on("processing", "complete", "done"),
//!     ),
//! );
//!
//! let result = machines.transition("flow", "start", Payload::new())?;
//! assert!(result.success);
//! assert_eq!(result.to, "processing");
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::Payload;
use crate::error::EntangleError;

/// State a machine starts in when its config doesn't say otherwise.
pub const DEFAULT_INITIAL_STATE: &str = "idle";

/// Machine type used when its config doesn't say otherwise.
pub const DEFAULT_MACHINE_TYPE: &str = "generic";

// =============================================================================
// Context merge
// =============================================================================

/// Shallow-merge `overlay` into `base`.
///
/// Keys are processed in `overlay` order and an overlay value always
/// replaces the base value for the same key (last writer wins). Nested
/// objects are replaced, not merged.
pub fn merge_context(mut base: Payload, overlay: Payload) -> Payload {
    for (key, value) in overlay {
        base.insert(key, value);
    }
    base
}

// =============================================================================
// Transition Table
// =============================================================================

/// `state → (event → destination)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransitionTable(BTreeMap<String, BTreeMap<String, String>>);

impl TransitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `from --event--> to`, replacing any existing entry.
    pub fn on(
        mut self,
        from: impl Into<String>,
        event: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        self.insert(from, event, to);
        self
    }

    pub fn insert(
        &mut self,
        from: impl Into<String>,
        event: impl Into<String>,
        to: impl Into<String>,
    ) {
        self.0
            .entry(from.into())
            .or_default()
            .insert(event.into(), to.into());
    }

    /// Where `event` leads from `state`, if anywhere.
    pub fn destination(&self, state: &str, event: &str) -> Option<&str> {
        self.0.get(state)?.get(event).map(String::as_str)
    }

    /// Events accepted in `state`, sorted.
    pub fn events_from(&self, state: &str) -> Vec<&str> {
        self.0
            .get(state)
            .map(|events| events.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Every state named in the table, as a source or a destination.
    pub fn states(&self) -> BTreeSet<&str> {
        let mut states = BTreeSet::new();
        for (from, events) in &self.0 {
            states.insert(from.as_str());
            states.extend(events.values().map(String::as_str));
        }
        states
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeMap::is_empty)
    }
}

impl From<BTreeMap<String, BTreeMap<String, String>>> for TransitionTable {
    fn from(table: BTreeMap<String, BTreeMap<String, String>>) -> Self {
        Self(table)
    }
}

impl<F, E, T> FromIterator<(F, E, T)> for TransitionTable
where
    F: Into<String>,
    E: Into<String>,
    T: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (F, E, T)>>(iter: I) -> Self {
        let mut table = Self::new();
        for (from, event, to) in iter {
            table.insert(from, event, to);
        }
        table
    }
}

// =============================================================================
// Machine Config
// =============================================================================

/// How to build a machine.
///
/// Every field has a default, both through [`MachineConfig::default`] and
/// when deserializing, so `{}` is a valid config:
///
/// ```json
/// {
///   "type": "payment",
///   "initialState": "idle",
///   "transitions": { "idle": { "start": "processing" } },
///   "context": { "currency": "USD" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MachineConfig {
    pub initial_state: String,
    pub transitions: TransitionTable,
    pub context: Payload,
    #[serde(rename = "type")]
    pub machine_type: String,
}

impl MachineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initial_state(mut self, state: impl Into<String>) -> Self {
        self.initial_state = state.into();
        self
    }

    pub fn transitions(mut self, transitions: TransitionTable) -> Self {
        self.transitions = transitions;
        self
    }

    pub fn context(mut self, context: Payload) -> Self {
        self.context = context;
        self
    }

    pub fn machine_type(mut self, machine_type: impl Into<String>) -> Self {
        self.machine_type = machine_type.into();
        self
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            initial_state: DEFAULT_INITIAL_STATE.to_string(),
            transitions: TransitionTable::default(),
            context: Payload::new(),
            machine_type: DEFAULT_MACHINE_TYPE.to_string(),
        }
    }
}

// =============================================================================
// Machine
// =============================================================================

/// A registered machine instance.
///
/// Values handed out by [`MachineRegistry`] are snapshots; changing the
/// registry's copy only happens through [`MachineRegistry::transition`].
/// Serializable so a persistence collaborator can store it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    id: String,
    #[serde(rename = "type")]
    machine_type: String,
    state: String,
    transitions: TransitionTable,
    context: Payload,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Machine {
    fn from_config(id: String, config: MachineConfig) -> Self {
        let now = Utc::now();
        Self {
            id,
            machine_type: config.machine_type,
            state: config.initial_state,
            transitions: config.transitions,
            context: config.context,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn machine_type(&self) -> &str {
        &self.machine_type
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn transitions(&self) -> &TransitionTable {
        &self.transitions
    }

    pub fn context(&self) -> &Payload {
        &self.context
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Events that would be accepted in the current state.
    pub fn available_events(&self) -> Vec<&str> {
        self.transitions.events_from(&self.state)
    }

    /// True when the current state accepts no events.
    pub fn is_terminal(&self) -> bool {
        self.available_events().is_empty()
    }
}

// =============================================================================
// Transition Result
// =============================================================================

/// Outcome of [`MachineRegistry::transition`].
///
/// Callers must check `success`: a rejected event is reported here, not as
/// an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionResult {
    pub machine_id: String,
    pub success: bool,
    pub from: String,
    pub to: String,
    pub event: String,
    /// The merged context; present only on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Payload>,
}

impl TransitionResult {
    fn rejected(machine_id: &str, state: String, event: &str) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            success: false,
            from: state.clone(),
            to: state,
            event: event.to_string(),
            context: None,
        }
    }

    /// Render as the data of a `machine:transition` event.
    pub fn to_payload(&self) -> Payload {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            // A struct of strings, bools and maps always serializes to an object
            _ => Payload::new(),
        }
    }
}

// =============================================================================
// Machine Registry
// =============================================================================

/// Owns every machine and applies transitions.
///
/// Cheap to clone; clones share the same machines. Each machine is guarded
/// by its map shard, so transitions on one machine are serialized.
#[derive(Clone, Default)]
pub struct MachineRegistry {
    machines: Arc<DashMap<String, Machine>>,
}

impl MachineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a machine, replacing any machine with the same ID.
    ///
    /// Replacement is total: the old table, state and context are dropped.
    pub fn register(&self, id: impl Into<String>, config: MachineConfig) -> Machine {
        let id = id.into();
        let machine = Machine::from_config(id.clone(), config);

        let replaced = self.machines.insert(id.clone(), machine.clone()).is_some();
        debug!(
            machine_id = %id,
            machine_type = %machine.machine_type,
            state = %machine.state,
            replaced,
            "machine registered"
        );

        machine
    }

    /// Snapshot of one machine.
    pub fn get(&self, id: &str) -> Option<Machine> {
        self.machines.get(id).map(|m| m.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.machines.contains_key(id)
    }

    /// Remove a machine, returning its last state.
    pub fn unregister(&self, id: &str) -> Option<Machine> {
        self.machines.remove(id).map(|(_, machine)| machine)
    }

    /// Drive machine `id` with `event`.
    ///
    /// # Errors
    ///
    /// [`EntangleError::MachineNotFound`] if `id` is not registered. A
    /// missing table entry is not an error; see [`TransitionResult`].
    pub fn transition(
        &self,
        id: &str,
        event: &str,
        payload: Payload,
    ) -> Result<TransitionResult, EntangleError> {
        let mut entry = self
            .machines
            .get_mut(id)
            .ok_or_else(|| EntangleError::machine_not_found(id))?;
        let machine = entry.value_mut();

        let from = machine.state.clone();
        let Some(to) = machine.transitions.destination(&from, event).map(str::to_owned) else {
            debug!(machine_id = %id, state = %from, event, "transition rejected");
            return Ok(TransitionResult::rejected(id, from, event));
        };

        machine.state = to.clone();
        machine.updated_at = Utc::now();
        machine.context = merge_context(std::mem::take(&mut machine.context), payload);

        debug!(machine_id = %id, from = %from, to = %to, event, "transition applied");

        Ok(TransitionResult {
            machine_id: id.to_string(),
            success: true,
            from,
            to,
            event: event.to_string(),
            context: Some(machine.context.clone()),
        })
    }

    /// Snapshot of every machine, ordered by ID.
    pub fn all(&self) -> Vec<Machine> {
        let mut machines: Vec<Machine> = self
            .machines
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        machines.sort_by(|a, b| a.id.cmp(&b.id));
        machines
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }
}

impl std::fmt::Debug for MachineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineRegistry")
            .field("machine_count", &self.machines.len())
            .finish()
    }
}
