use crate::error::GatingError;
use crate::strategy::Parameters;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Built-in pseudo-strategy tags. These route to the set-algebra
/// operations, never to a plugin.
pub const MERGE_TAG: &str = "merge";
pub const SUBTRACT_TAG: &str = "subtract";

/// Gate lifecycle. `Created` gates have no committed children yet;
/// `Applied` gates do; `Edited` marks a gate whose geometry was replaced
/// after application. Removal deletes the record outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateState {
    Created,
    Applied,
    Edited,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gate {
    pub name: String,
    pub parent: String,
    pub strategy: String,
    pub method: String,
    pub parameters: Parameters,
    pub children: Vec<String>,
    pub state: GateState,
}

impl Gate {
    pub fn is_builtin(&self) -> bool {
        self.strategy == MERGE_TAG || self.strategy == SUBTRACT_TAG
    }
}

/// Named gate records in insertion order. The registry owns gate
/// definitions only; populations are referenced by name and owned by the
/// tree.
#[derive(Debug, Clone, Default)]
pub struct GateRegistry {
    gates: HashMap<String, Gate>,
    order: Vec<String>,
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.gates.contains_key(name)
    }

    /// Gate names in creation order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn get(&self, name: &str) -> Result<&Gate, GatingError> {
        self.gates.get(name).ok_or_else(|| {
            GatingError::validation(format!(
                "Gate '{name}' does not exist; it must be created first"
            ))
        })
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Result<&mut Gate, GatingError> {
        self.gates
            .get_mut(name)
            .ok_or_else(|| GatingError::validation(format!("Gate '{name}' does not exist")))
    }

    pub fn insert(&mut self, gate: Gate) -> Result<(), GatingError> {
        if self.gates.contains_key(&gate.name) {
            return Err(GatingError::validation(format!(
                "Gate '{}' already exists",
                gate.name
            )));
        }
        self.order.push(gate.name.clone());
        self.gates.insert(gate.name.clone(), gate);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<Gate, GatingError> {
        let gate = self
            .gates
            .remove(name)
            .ok_or_else(|| GatingError::validation(format!("Gate '{name}' does not exist")))?;
        self.order.retain(|n| n != name);
        Ok(gate)
    }

    pub fn clear(&mut self) {
        self.gates.clear();
        self.order.clear();
    }

    /// Gates whose parent population lies among `populations`, in creation
    /// order. Used to find the gates invalidated by a destructive cascade.
    pub fn gates_with_parent_in(&self, populations: &[String]) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| {
                self.gates
                    .get(*name)
                    .map(|g| populations.contains(&g.parent))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}
