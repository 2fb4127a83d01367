use crate::dataset::EventId;
use crate::error::GatingError;
use crate::geometry::Geometry;
use crate::population::Population;
use crate::registry::Gate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Persisted form of one population node. Geometry travels as key-value
/// pairs so a snapshot stays readable without the geometry enum; the root
/// node has an empty geometry list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationRecord {
    pub name: String,
    pub parent: Option<String>,
    pub index: Vec<EventId>,
    pub geometry: Vec<(String, Value)>,
    pub prop_of_parent: f64,
    pub prop_of_total: f64,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateRecord {
    pub name: String,
    pub parent: String,
    pub strategy: String,
    pub method: String,
    pub parameters: Vec<(String, Value)>,
    pub children: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub sample_id: String,
    pub populations: Vec<PopulationRecord>,
    pub gates: Vec<GateRecord>,
}

impl PopulationRecord {
    pub fn from_population(population: &Population) -> Self {
        Self {
            name: population.name.clone(),
            parent: population.parent.clone(),
            index: population.index.clone(),
            geometry: population
                .geometry
                .as_ref()
                .map(Geometry::to_kv)
                .unwrap_or_default(),
            prop_of_parent: population.prop_of_parent,
            prop_of_total: population.prop_of_total,
            warnings: population.warnings.clone(),
        }
    }

    pub fn geometry(&self) -> Result<Option<Geometry>, GatingError> {
        if self.geometry.is_empty() {
            return Ok(None);
        }
        Geometry::from_kv(&self.geometry).map(Some)
    }
}

impl GateRecord {
    pub fn from_gate(gate: &Gate) -> Self {
        Self {
            name: gate.name.clone(),
            parent: gate.parent.clone(),
            strategy: gate.strategy.clone(),
            method: gate.method.clone(),
            parameters: gate
                .parameters
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            children: gate.children.clone(),
        }
    }

    pub fn parameters(&self) -> BTreeMap<String, Value> {
        self.parameters
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Storage seam for tree and gate snapshots.
pub trait PersistenceAdapter {
    /// `Ok(None)` when no snapshot exists for the sample yet.
    fn load(&self, sample_id: &str) -> Result<Option<Snapshot>, GatingError>;
    fn save(&self, snapshot: &Snapshot) -> Result<(), GatingError>;
}

/// One pretty-printed JSON file per sample under a base directory.
#[derive(Debug, Clone)]
pub struct JsonFileAdapter {
    base_dir: PathBuf,
}

impl JsonFileAdapter {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn path_for(&self, sample_id: &str) -> PathBuf {
        self.base_dir.join(format!("{sample_id}.gating.json"))
    }
}

impl PersistenceAdapter for JsonFileAdapter {
    fn load(&self, sample_id: &str) -> Result<Option<Snapshot>, GatingError> {
        let path = self.path_for(sample_id);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path).map_err(|e| {
            GatingError::io(format!(
                "Could not read snapshot file '{}': {e}",
                path.display()
            ))
        })?;
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| {
                GatingError::validation(format!(
                    "Could not parse snapshot JSON '{}': {e}",
                    path.display()
                ))
            })
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), GatingError> {
        let text = serde_json::to_string_pretty(snapshot)
            .map_err(|e| GatingError::internal(format!("Could not serialize snapshot: {e}")))?;
        let path = self.path_for(snapshot.sample_id.as_str());
        std::fs::write(&path, text).map_err(|e| {
            GatingError::io(format!(
                "Could not write snapshot file '{}': {e}",
                path.display()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::tests::rect;
    use crate::geometry::Sign;

    fn population() -> Population {
        Population {
            name: "cd4".to_string(),
            parent: Some("root".to_string()),
            children: vec![],
            index: vec![1, 2, 3],
            geometry: Some(rect(0.0, 5.0, 0.0, 5.0, Sign::Positive)),
            prop_of_parent: 0.5,
            prop_of_total: 0.25,
            warnings: vec!["low event count".to_string()],
            clusters: vec![],
            signature: BTreeMap::new(),
        }
    }

    #[test]
    fn test_population_record_round_trip() {
        let record = PopulationRecord::from_population(&population());
        assert_eq!(record.index, vec![1, 2, 3]);
        let geometry = record.geometry().unwrap().unwrap();
        assert_eq!(geometry, rect(0.0, 5.0, 0.0, 5.0, Sign::Positive));
    }

    #[test]
    fn test_root_record_has_no_geometry() {
        let mut root = population();
        root.name = "root".to_string();
        root.parent = None;
        root.geometry = None;
        let record = PopulationRecord::from_population(&root);
        assert!(record.geometry.is_empty());
        assert!(record.geometry().unwrap().is_none());
    }

    #[test]
    fn test_json_adapter_round_trip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = JsonFileAdapter::new(dir.path());
        assert!(adapter.load("s1").unwrap().is_none());

        let snapshot = Snapshot {
            sample_id: "s1".to_string(),
            populations: vec![PopulationRecord::from_population(&population())],
            gates: vec![],
        };
        adapter.save(&snapshot).unwrap();
        let loaded = adapter.load("s1").unwrap().unwrap();
        assert_eq!(loaded.populations.len(), 1);
        assert_eq!(loaded.populations[0].name, "cd4");
    }
}
