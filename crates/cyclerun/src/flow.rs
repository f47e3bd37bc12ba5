//! Per-cycle flow variables.
//!
//! Templates that capture values (for example a generated key reused by a
//! later field) register variable names once at preparation time and get a
//! stable ordinal back. Each motor then keeps a slot-local [`FlowContext`]
//! indexed by those ordinals, cleared at the start of every cycle.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde_json::Value;

use crate::cycles::Cycle;

pub const DEFAULT_SPACE: &str = "default";

/// Stable index of a flow variable within an activity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarOrdinal(usize);

impl VarOrdinal {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Default)]
struct Registry {
    by_name: HashMap<(String, String), VarOrdinal>,
    names: Vec<(String, String)>,
}

/// Activity-wide registry of flow variable names, partitioned by space.
/// Ordinals are handed out monotonically and never reused.
#[derive(Debug, Default)]
pub struct FlowVariables {
    registry: Mutex<Registry>,
}

impl FlowVariables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ordinal for `(space, name)`, registering it on first use.
    pub fn ordinal(&self, space: &str, name: &str) -> VarOrdinal {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (space.to_string(), name.to_string());
        if let Some(ordinal) = registry.by_name.get(&key) {
            return *ordinal;
        }
        let ordinal = VarOrdinal(registry.names.len());
        registry.names.push(key.clone());
        registry.by_name.insert(key, ordinal);
        ordinal
    }

    pub fn lookup(&self, space: &str, name: &str) -> Option<VarOrdinal> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_name
            .get(&(space.to_string(), name.to_string()))
            .copied()
    }

    pub fn name_of(&self, ordinal: VarOrdinal) -> Option<(String, String)> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .names
            .get(ordinal.0)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .names
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Slot-local variable storage for the cycle a motor is currently running.
#[derive(Debug, Default)]
pub struct FlowContext {
    slot: usize,
    cycle: Option<Cycle>,
    values: Vec<Option<Value>>,
}

impl FlowContext {
    pub fn new(slot: usize) -> Self {
        Self {
            slot,
            cycle: None,
            values: Vec::new(),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn cycle(&self) -> Option<Cycle> {
        self.cycle
    }

    /// Clears all values and binds the context to `cycle`.
    pub fn reset(&mut self, cycle: Cycle) {
        self.cycle = Some(cycle);
        self.values.iter_mut().for_each(|value| *value = None);
    }

    pub fn set(&mut self, ordinal: VarOrdinal, value: Value) {
        let index = ordinal.index();
        if index >= self.values.len() {
            self.values.resize(index + 1, None);
        }
        self.values[index] = Some(value);
    }

    pub fn get(&self, ordinal: VarOrdinal) -> Option<&Value> {
        self.values.get(ordinal.index()).and_then(Option::as_ref)
    }

    pub fn take(&mut self, ordinal: VarOrdinal) -> Option<Value> {
        self.values.get_mut(ordinal.index()).and_then(Option::take)
    }

    /// Number of variables holding a value for the current cycle.
    pub fn captured(&self) -> usize {
        self.values.iter().filter(|value| value.is_some()).count()
    }
}
