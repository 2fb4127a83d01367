use crate::dataset::{DatasetProvider, EventId, EventTable};
use crate::error::GatingError;
use crate::fmo::{AxisProfile, FmoCache, ProjectionSettings};
use crate::geometry::Geometry;
use crate::persist::{GateRecord, PersistenceAdapter, PopulationRecord, Snapshot};
use crate::population::{Population, PopulationTree, ROOT};
use crate::registry::{Gate, GateRegistry, GateState, MERGE_TAG, SUBTRACT_TAG};
use crate::set_algebra;
use crate::strategy::{
    GateOutput, GatingStrategy, Parameters, QuantileStrategy, StaticStrategy,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineParameters {
    /// Fallback axis when a 1D gate needs a second projection dimension.
    pub default_axis: String,
    /// Upper bound on FMO classifier training rows per hop.
    pub max_training_rows: usize,
    pub knn_neighbors: usize,
    pub training_seed: u64,
}

impl Default for EngineParameters {
    fn default() -> Self {
        Self {
            default_axis: "FSC-A".to_string(),
            max_training_rows: 10_000,
            knn_neighbors: 5,
            training_seed: 0x9E3779B97F4A7C15,
        }
    }
}

/// Result of applying a gate: which populations were committed, plus the
/// warnings and human-readable feedback collected along the way.
#[derive(Debug, Clone, Default)]
pub struct GateOutcome {
    pub gate: String,
    pub created: Vec<String>,
    pub warnings: Vec<String>,
    pub messages: Vec<String>,
}

/// Result of editing a gate. `stale_gates` must be re-applied by the
/// caller; the descendants of the edited children were removed because
/// their indices were not recomputed.
#[derive(Debug, Clone, Default)]
pub struct EditOutcome {
    pub gate: String,
    pub updated: Vec<String>,
    pub removed_populations: Vec<String>,
    pub stale_gates: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RemovalOutcome {
    pub removed_gates: Vec<String>,
    pub removed_populations: Vec<String>,
}

/// One engine instance per analysed sample. Owns the primary and control
/// event tables, the population tree, the gate registry, the strategy
/// bindings, and the FMO projection cache. All operations run to
/// completion synchronously; sharing an instance across threads needs
/// external mutual exclusion.
pub struct GatingEngine {
    sample_id: String,
    primary: EventTable,
    controls: HashMap<String, EventTable>,
    tree: PopulationTree,
    registry: GateRegistry,
    strategies: HashMap<String, Box<dyn GatingStrategy>>,
    fmo_cache: FmoCache,
    parameters: EngineParameters,
}

impl GatingEngine {
    pub fn new(
        sample_id: impl Into<String>,
        primary: EventTable,
        controls: HashMap<String, EventTable>,
    ) -> Self {
        let tree = PopulationTree::new(primary.ids().to_vec());
        let mut fmo_cache = FmoCache::new();
        for (name, table) in &controls {
            fmo_cache.seed_root(name, table.ids().to_vec());
        }
        let mut strategies: HashMap<String, Box<dyn GatingStrategy>> = HashMap::new();
        strategies.insert("static".to_string(), Box::new(StaticStrategy));
        strategies.insert("quantile".to_string(), Box::new(QuantileStrategy));
        Self {
            sample_id: sample_id.into(),
            primary,
            controls,
            tree,
            registry: GateRegistry::new(),
            strategies,
            fmo_cache,
            parameters: EngineParameters::default(),
        }
    }

    /// Build an engine by pulling the sample's datasets from a provider.
    pub fn from_provider(
        provider: &dyn DatasetProvider,
        sample_id: &str,
    ) -> Result<Self, GatingError> {
        let primary = provider.primary_dataset(sample_id)?;
        let controls = provider.control_datasets(sample_id)?;
        Ok(Self::new(sample_id, primary, controls))
    }

    /// Rebuild an engine from a persisted snapshot. Population records are
    /// expected parent-first (the order `save` writes them in); gates whose
    /// children all exist come back as applied.
    pub fn restore(
        sample_id: impl Into<String>,
        primary: EventTable,
        controls: HashMap<String, EventTable>,
        snapshot: &Snapshot,
    ) -> Result<Self, GatingError> {
        let mut engine = Self::new(sample_id, primary, controls);
        for record in &snapshot.populations {
            if record.name == ROOT {
                continue;
            }
            let parent = record.parent.as_deref().ok_or_else(|| {
                GatingError::validation(format!(
                    "Persisted population '{}' has no parent",
                    record.name
                ))
            })?;
            let geometry = record.geometry()?.ok_or_else(|| {
                GatingError::validation(format!(
                    "Persisted population '{}' has no geometry",
                    record.name
                ))
            })?;
            engine.tree.create(
                &record.name,
                parent,
                record.index.clone(),
                geometry,
                record.warnings.clone(),
                BTreeMap::new(),
            )?;
        }
        for record in &snapshot.gates {
            let applied = !record.children.is_empty()
                && record.children.iter().all(|c| engine.tree.contains(c));
            engine.registry.insert(Gate {
                name: record.name.clone(),
                parent: record.parent.clone(),
                strategy: record.strategy.clone(),
                method: record.method.clone(),
                parameters: record.parameters(),
                children: record.children.clone(),
                state: if applied {
                    GateState::Applied
                } else {
                    GateState::Created
                },
            })?;
        }
        Ok(engine)
    }

    pub fn sample_id(&self) -> &str {
        &self.sample_id
    }

    pub fn tree(&self) -> &PopulationTree {
        &self.tree
    }

    pub fn registry(&self) -> &GateRegistry {
        &self.registry
    }

    pub fn parameters(&self) -> &EngineParameters {
        &self.parameters
    }

    pub fn fmo_cache(&self) -> &FmoCache {
        &self.fmo_cache
    }

    pub fn control_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.controls.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn register_strategy(&mut self, name: impl Into<String>, strategy: Box<dyn GatingStrategy>) {
        self.strategies.insert(name.into(), strategy);
    }

    pub fn population_size(&self, population: &str) -> Result<usize, GatingError> {
        Ok(self.tree.get(population)?.n())
    }

    pub fn fetch_geometry(&self, population: &str) -> Result<Geometry, GatingError> {
        self.tree
            .get(population)?
            .geometry
            .clone()
            .ok_or_else(|| {
                GatingError::validation(format!("Population '{population}' has no geometry"))
            })
    }

    /// Filter a list of names down to the populations that exist.
    pub fn valid_populations(&self, populations: &[String]) -> Vec<String> {
        populations
            .iter()
            .filter(|name| {
                let known = self.tree.contains(name);
                if !known {
                    warn!(population = name.as_str(), "not a valid population");
                }
                known
            })
            .cloned()
            .collect()
    }

    pub fn find_dependencies(&self, population: &str) -> Result<Vec<String>, GatingError> {
        self.tree.dependents(population)
    }

    /// The population's events as a standalone table.
    pub fn population_frame(&self, population: &str) -> Result<EventTable, GatingError> {
        self.primary.subset(&self.tree.get(population)?.index)
    }

    /// Each member event of `population` labelled with the deepest
    /// dependent population it belongs to.
    pub fn labelled_events(
        &self,
        population: &str,
    ) -> Result<Vec<(EventId, String)>, GatingError> {
        let index = self.tree.get(population)?.index.clone();
        let mut labels: HashMap<EventId, String> = index
            .iter()
            .map(|id| (*id, population.to_string()))
            .collect();
        for dependent in self.tree.dependents(population)? {
            for id in &self.tree.get(&dependent)?.index {
                if let Some(label) = labels.get_mut(id) {
                    *label = dependent.clone();
                }
            }
        }
        Ok(index
            .into_iter()
            .map(|id| {
                let label = labels.remove(&id).unwrap_or_else(|| population.to_string());
                (id, label)
            })
            .collect())
    }

    pub fn render_tree(&self) -> String {
        self.tree.render()
    }

    /// Register a gate definition for later application. Nothing touches
    /// the population tree here; a missing strategy parameter is reported
    /// (all at once) and the registry is left unchanged.
    pub fn create_gate(
        &mut self,
        name: &str,
        parent: &str,
        strategy: &str,
        method: &str,
        parameters: Parameters,
        children: Vec<String>,
    ) -> Result<(), GatingError> {
        if self.registry.contains(name) {
            return Err(GatingError::validation(format!(
                "Gate '{name}' already exists"
            )));
        }
        if children.is_empty() {
            return Err(GatingError::validation(format!(
                "Gate '{name}' declares no child populations"
            )));
        }
        let mut seen = HashSet::new();
        for child in &children {
            if !seen.insert(child.clone()) {
                return Err(GatingError::validation(format!(
                    "Gate '{name}' declares child population '{child}' twice"
                )));
            }
        }
        let required: Vec<&str> = match strategy {
            MERGE_TAG => vec!["inputs"],
            SUBTRACT_TAG => vec!["targets"],
            plugin => {
                let strategy = self.strategies.get(plugin).ok_or_else(|| {
                    GatingError::validation(format!(
                        "Invalid gate strategy '{plugin}'; no such strategy is registered"
                    ))
                })?;
                strategy.required_parameters(method)?
            }
        };
        let missing: Vec<&str> = required
            .iter()
            .filter(|key| !parameters.contains_key(**key))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(GatingError::validation(format!(
                "Gate '{name}' is missing required parameter(s) for {strategy}::{method}: {}",
                missing.join(", ")
            )));
        }
        self.registry.insert(Gate {
            name: name.to_string(),
            parent: parent.to_string(),
            strategy: strategy.to_string(),
            method: method.to_string(),
            parameters,
            children,
            state: GateState::Created,
        })
    }

    /// Apply a previously created gate and commit its child populations.
    pub fn apply(&mut self, gate_name: &str) -> Result<GateOutcome, GatingError> {
        let gate = self.registry.get(gate_name)?.clone();
        if !self.tree.contains(&gate.parent) {
            return Err(GatingError::validation(format!(
                "Parent population '{}' of gate '{gate_name}' does not exist",
                gate.parent
            )));
        }
        for child in &gate.children {
            if self.tree.contains(child) {
                return Err(GatingError::validation(format!(
                    "Population '{child}' already exists; remove it before re-applying \
                     gate '{gate_name}'"
                )));
            }
        }
        debug!(gate = gate_name, strategy = gate.strategy.as_str(), "applying gate");
        let outcome = match gate.strategy.as_str() {
            MERGE_TAG => self.apply_merge(&gate)?,
            SUBTRACT_TAG => self.apply_subtract(&gate)?,
            _ => self.apply_strategy(&gate)?,
        };
        self.registry.get_mut(gate_name)?.state = GateState::Applied;
        Ok(outcome)
    }

    /// Apply several gates in order. With `apply_all`, the gate list is
    /// ignored and every registered gate runs against a tree that must
    /// hold only the root population.
    pub fn apply_many(
        &mut self,
        gates: &[String],
        apply_all: bool,
    ) -> Result<Vec<GateOutcome>, GatingError> {
        let to_apply: Vec<String> = if apply_all {
            if self.tree.len() != 1 {
                return Err(GatingError::validation(
                    "apply_all expects a tree with no populations besides root; \
                     remove existing populations first",
                ));
            }
            self.registry.names().to_vec()
        } else {
            if let Some(unknown) = gates.iter().find(|g| !self.registry.contains(g)) {
                return Err(GatingError::validation(format!(
                    "Gate '{unknown}' does not exist"
                )));
            }
            gates.to_vec()
        };
        let mut outcomes = Vec::with_capacity(to_apply.len());
        for gate in &to_apply {
            outcomes.push(self.apply(gate)?);
        }
        Ok(outcomes)
    }

    fn apply_strategy(&mut self, gate: &Gate) -> Result<GateOutcome, GatingError> {
        let strategy = self.strategies.get(&gate.strategy).ok_or_else(|| {
            GatingError::validation(format!(
                "Invalid gate strategy '{}'; no such strategy is registered",
                gate.strategy
            ))
        })?;
        let parent_index = self.tree.get(&gate.parent)?.index.clone();
        let result = strategy.gate(
            &self.primary,
            &parent_index,
            &gate.method,
            &gate.parameters,
            &gate.children,
        )?;
        let declared: HashSet<&str> = gate.children.iter().map(String::as_str).collect();
        let produced: HashSet<&str> = result.outputs.iter().map(|o| o.child.as_str()).collect();
        if declared != produced {
            return Err(GatingError::internal(format!(
                "Strategy '{}' produced populations {:?} but gate '{}' declares {:?}",
                gate.strategy, produced, gate.name, declared
            )));
        }
        self.commit_outputs(gate, &parent_index, result.outputs, result.warnings)
    }

    fn apply_merge(&mut self, gate: &Gate) -> Result<GateOutcome, GatingError> {
        let inputs = string_list(&gate.parameters, "inputs")?;
        if inputs.len() < 2 {
            return Err(GatingError::validation(format!(
                "Merge gate '{}' needs at least two input populations",
                gate.name
            )));
        }
        let populations: Vec<&Population> = inputs
            .iter()
            .map(|name| self.tree.get(name))
            .collect::<Result<_, _>>()?;
        let explicit = gate.children.first().map(String::as_str);
        let merged = set_algebra::merge_multiple_populations(&populations, explicit)?;
        if merged.parent.as_deref() != Some(gate.parent.as_str()) {
            return Err(GatingError::consistency(format!(
                "Merge inputs descend from {:?}, not from gate parent '{}'",
                merged.parent, gate.parent
            )));
        }
        let parent_index = self.tree.get(&gate.parent)?.index.clone();
        let output = GateOutput {
            child: merged.name.clone(),
            geometry: merged.geometry.clone().ok_or_else(|| {
                GatingError::internal("Merged population lost its geometry")
            })?,
            index: merged.index.clone(),
        };
        self.commit_outputs(gate, &parent_index, vec![output], merged.warnings)
    }

    fn apply_subtract(&mut self, gate: &Gate) -> Result<GateOutcome, GatingError> {
        let targets = string_list(&gate.parameters, "targets")?;
        if targets.is_empty() {
            return Err(GatingError::validation(format!(
                "Subtraction gate '{}' names no target populations",
                gate.name
            )));
        }
        let parent = self.tree.get(&gate.parent)?;
        let target_refs: Vec<&Population> = targets
            .iter()
            .map(|name| self.tree.get(name))
            .collect::<Result<_, _>>()?;
        let new_name = gate.children.first().cloned().ok_or_else(|| {
            GatingError::validation(format!(
                "Subtraction gate '{}' declares no child population",
                gate.name
            ))
        })?;
        let (x, y) = self.subtraction_axes(parent);
        let result =
            set_algebra::subtract_populations(parent, &target_refs, &new_name, x, y)?;
        let parent_index = parent.index.clone();
        let output = GateOutput {
            child: result.name.clone(),
            geometry: result.geometry.clone().ok_or_else(|| {
                GatingError::internal("Subtracted population lost its geometry")
            })?,
            index: result.index.clone(),
        };
        self.commit_outputs(gate, &parent_index, vec![output], result.warnings)
    }

    fn subtraction_axes(&self, parent: &Population) -> (String, Option<String>) {
        match &parent.geometry {
            Some(geometry) => (
                geometry.x_axis().to_string(),
                geometry.y_axis().map(str::to_string),
            ),
            None => (self.parameters.default_axis.clone(), None),
        }
    }

    /// Validate every output against the parent index, then commit them
    /// all. Validation happens up front so a failure commits nothing.
    fn commit_outputs(
        &mut self,
        gate: &Gate,
        parent_index: &[EventId],
        outputs: Vec<GateOutput>,
        warnings: Vec<String>,
    ) -> Result<GateOutcome, GatingError> {
        let members: HashSet<EventId> = parent_index.iter().copied().collect();
        for output in &outputs {
            if let Some(stray) = output.index.iter().find(|id| !members.contains(id)) {
                return Err(GatingError::validation(format!(
                    "Population '{}' contains event {stray} not present in parent '{}'",
                    output.child, gate.parent
                )));
            }
        }
        let mut outcome = GateOutcome {
            gate: gate.name.clone(),
            warnings: warnings.clone(),
            ..GateOutcome::default()
        };
        for output in outputs {
            let signature = self.signature_of(&output.index);
            self.tree.create(
                &output.child,
                &gate.parent,
                output.index,
                output.geometry,
                warnings.clone(),
                signature,
            )?;
            let node = self.tree.get(&output.child)?;
            outcome.messages.push(format!(
                "New population '{}': {:.3} of parent, {:.3} of total",
                output.child, node.prop_of_parent, node.prop_of_total
            ));
            outcome.created.push(output.child);
        }
        Ok(outcome)
    }

    fn signature_of(&self, index: &[EventId]) -> BTreeMap<String, f64> {
        let mut signature = BTreeMap::new();
        for column in self.primary.columns() {
            if let Ok(Some(median)) = self.primary.column_median(column, index) {
                signature.insert(column.clone(), median);
            }
        }
        signature
    }

    /// Replace the geometry of an applied gate's children, re-evaluating
    /// their indices against the current parent data. Descendants of the
    /// edited children are removed (their indices were not recomputed) and
    /// the gates that must be re-applied are reported back.
    pub fn edit_gate(
        &mut self,
        gate_name: &str,
        updated_geometry: &HashMap<String, Geometry>,
    ) -> Result<EditOutcome, GatingError> {
        let gate = self.registry.get(gate_name)?.clone();
        for child in &gate.children {
            if !self.tree.contains(child) {
                return Err(GatingError::validation(format!(
                    "Gate '{gate_name}' has not been applied; child population \
                     '{child}' does not exist"
                )));
            }
            if !updated_geometry.contains_key(child) {
                return Err(GatingError::validation(format!(
                    "Missing updated geometry for child population '{child}' of \
                     gate '{gate_name}'"
                )));
            }
        }

        // New indices are computed up front so a bad geometry aborts the
        // edit before any mutation.
        let mut new_indices: HashMap<String, Vec<EventId>> = HashMap::new();
        for child in &gate.children {
            let geometry = &updated_geometry[child];
            let parent_name = self.tree.get(child)?.parent.clone().ok_or_else(|| {
                GatingError::internal(format!("Population '{child}' has no parent"))
            })?;
            let parent_index = self.tree.get(&parent_name)?.index.clone();
            new_indices.insert(
                child.clone(),
                crate::region::evaluate(geometry, &self.primary, &parent_index)?,
            );
        }

        let mut outcome = EditOutcome {
            gate: gate_name.to_string(),
            ..EditOutcome::default()
        };
        let mut affected: Vec<String> = vec![];
        let mut grandchildren: Vec<String> = vec![];
        for child in &gate.children {
            affected.extend(self.tree.dependents(child)?);
            grandchildren.extend(self.tree.get(child)?.children.clone());
        }
        outcome.stale_gates = self
            .registry
            .gates_with_parent_in(&affected)
            .into_iter()
            .filter(|name| name != gate_name)
            .collect();

        for child in &gate.children {
            let index = new_indices.remove(child).unwrap_or_default();
            self.tree
                .update_geometry_and_index(child, updated_geometry[child].clone(), index)?;
            outcome.updated.push(child.clone());
        }
        for grandchild in grandchildren {
            if self.tree.contains(&grandchild) {
                outcome
                    .removed_populations
                    .extend(self.tree.remove(&grandchild)?);
            }
        }
        if !outcome.stale_gates.is_empty() {
            warn!(
                gate = gate_name,
                stale = ?outcome.stale_gates,
                "downstream gates must be re-applied after edit"
            );
        }
        self.registry.get_mut(gate_name)?.state = GateState::Edited;
        Ok(outcome)
    }

    /// Shift a threshold gate without re-declaring its geometry.
    pub fn nudge_threshold(
        &mut self,
        gate_name: &str,
        new_x: f64,
        new_y: Option<f64>,
    ) -> Result<EditOutcome, GatingError> {
        let gate = self.registry.get(gate_name)?.clone();
        let mut updated = HashMap::new();
        for child in &gate.children {
            let geometry = match self.fetch_geometry(child)? {
                Geometry::Threshold1D {
                    x,
                    transform_x,
                    definitions,
                    ..
                } => Geometry::Threshold1D {
                    x,
                    transform_x,
                    threshold: new_x,
                    definitions,
                },
                Geometry::Threshold2D {
                    x,
                    y,
                    transform_x,
                    transform_y,
                    threshold_y,
                    definitions,
                    ..
                } => Geometry::Threshold2D {
                    x,
                    y,
                    transform_x,
                    transform_y,
                    threshold_x: new_x,
                    threshold_y: new_y.unwrap_or(threshold_y),
                    definitions,
                },
                other => {
                    return Err(GatingError::validation(format!(
                        "Can only nudge threshold gates; population '{child}' is \
                         '{}'-gated",
                        other.kind()
                    )))
                }
            };
            updated.insert(child.clone(), geometry);
        }
        self.edit_gate(gate_name, &updated)
    }

    /// Merge two sibling populations, committing the result and recording
    /// the merge as an applied gate.
    pub fn merge(
        &mut self,
        left: &str,
        right: &str,
        new_name: Option<&str>,
    ) -> Result<GateOutcome, GatingError> {
        self.merge_many(&[left.to_string(), right.to_string()], new_name)
    }

    /// N-way merge, reduced pairwise left to right.
    pub fn merge_many(
        &mut self,
        inputs: &[String],
        new_name: Option<&str>,
    ) -> Result<GateOutcome, GatingError> {
        if inputs.len() < 2 {
            return Err(GatingError::validation(
                "Merging requires at least two populations",
            ));
        }
        for input in inputs {
            self.tree.get(input)?;
        }
        let population_name = new_name
            .map(str::to_string)
            .unwrap_or_else(|| format!("merge_{}", inputs.join("_")));
        if self.tree.contains(&population_name) {
            return Err(GatingError::validation(format!(
                "Population '{population_name}' already exists"
            )));
        }
        let parent = self
            .tree
            .get(&inputs[0])?
            .parent
            .clone()
            .ok_or_else(|| GatingError::consistency("The root population cannot be merged"))?;
        let gate_name = format!("merge_{}", inputs.join("_"));
        let mut parameters = Parameters::new();
        parameters.insert(
            "inputs".to_string(),
            Value::Array(inputs.iter().map(|i| Value::String(i.clone())).collect()),
        );
        parameters.insert("name".to_string(), Value::String(population_name.clone()));
        self.create_gate(
            &gate_name,
            &parent,
            MERGE_TAG,
            MERGE_TAG,
            parameters,
            vec![population_name],
        )?;
        match self.apply(&gate_name) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                // The gate record must not outlive a failed application.
                let _ = self.registry.remove(&gate_name);
                Err(err)
            }
        }
    }

    /// Derive a new population by removing the target populations' events
    /// from a parent population.
    pub fn subtract(
        &mut self,
        parent: &str,
        targets: &[String],
        new_name: &str,
    ) -> Result<GateOutcome, GatingError> {
        self.tree.get(parent)?;
        for target in targets {
            self.tree.get(target)?;
        }
        if self.tree.contains(new_name) {
            return Err(GatingError::validation(format!(
                "Population '{new_name}' already exists"
            )));
        }
        let gate_name = format!("{parent}_minus_{}", targets.join("_"));
        let mut parameters = Parameters::new();
        parameters.insert(
            "targets".to_string(),
            Value::Array(targets.iter().map(|t| Value::String(t.clone())).collect()),
        );
        parameters.insert("name".to_string(), Value::String(new_name.to_string()));
        self.create_gate(
            &gate_name,
            parent,
            SUBTRACT_TAG,
            SUBTRACT_TAG,
            parameters,
            vec![new_name.to_string()],
        )?;
        match self.apply(&gate_name) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let _ = self.registry.remove(&gate_name);
                Err(err)
            }
        }
    }

    /// Remove a population and everything below it.
    pub fn remove_population(&mut self, population: &str) -> Result<Vec<String>, GatingError> {
        self.tree.remove(population)
    }

    /// Remove a gate. A gate with committed children refuses removal
    /// without propagation; with it, all dependent populations and every
    /// gate parented inside them go too, and both sets are returned.
    pub fn remove_gate(
        &mut self,
        gate_name: &str,
        propagate: bool,
    ) -> Result<RemovalOutcome, GatingError> {
        let gate = self.registry.get(gate_name)?.clone();
        let committed: Vec<String> = gate
            .children
            .iter()
            .filter(|c| self.tree.contains(c))
            .cloned()
            .collect();
        if committed.is_empty() {
            self.registry.remove(gate_name)?;
            return Ok(RemovalOutcome {
                removed_gates: vec![gate_name.to_string()],
                removed_populations: vec![],
            });
        }
        if !propagate {
            return Err(GatingError::validation(format!(
                "Gate '{gate_name}' has committed child populations; removing it \
                 without propagation would orphan them"
            )));
        }
        let mut removed_populations: Vec<String> = vec![];
        for child in &committed {
            removed_populations.extend(self.tree.remove(child)?);
        }
        let mut removed_gates = self.registry.gates_with_parent_in(&removed_populations);
        if !removed_gates.iter().any(|g| g == gate_name) {
            removed_gates.push(gate_name.to_string());
        }
        for gate in &removed_gates {
            self.registry.remove(gate)?;
        }
        debug!(
            gate = gate_name,
            gates = removed_gates.len(),
            populations = removed_populations.len(),
            "removed gate with propagation"
        );
        Ok(RemovalOutcome {
            removed_gates,
            removed_populations,
        })
    }

    pub fn clear_gates(&mut self) {
        self.registry.clear();
    }

    /// Project a population onto a control dataset, caching every hop.
    pub fn fmo_projection(
        &mut self,
        population: &str,
        control: &str,
        axis_profiles: &HashMap<String, AxisProfile>,
    ) -> Result<Vec<EventId>, GatingError> {
        let table = self.controls.get(control).ok_or_else(|| {
            GatingError::not_found(format!("Control dataset '{control}' not found"))
        })?;
        let settings = ProjectionSettings {
            default_axis: self.parameters.default_axis.clone(),
            max_training_rows: self.parameters.max_training_rows,
            knn_neighbors: self.parameters.knn_neighbors,
            training_seed: self.parameters.training_seed,
        };
        crate::fmo::project(
            &mut self.fmo_cache,
            &self.tree,
            &self.primary,
            control,
            table,
            population,
            axis_profiles,
            &settings,
        )
    }

    /// The projected population's control events as a standalone table.
    pub fn fmo_frame(
        &mut self,
        population: &str,
        control: &str,
        axis_profiles: &HashMap<String, AxisProfile>,
    ) -> Result<EventTable, GatingError> {
        let index = self.fmo_projection(population, control, axis_profiles)?;
        let table = self.controls.get(control).ok_or_else(|| {
            GatingError::not_found(format!("Control dataset '{control}' not found"))
        })?;
        table.subset(&index)
    }

    pub fn set_parameter(&mut self, name: &str, value: Value) -> Result<(), GatingError> {
        match name {
            "default_axis" => {
                self.parameters.default_axis = value
                    .as_str()
                    .ok_or_else(|| {
                        GatingError::validation("Parameter 'default_axis' must be a string")
                    })?
                    .to_string();
            }
            "max_training_rows" => {
                let rows = value.as_u64().ok_or_else(|| {
                    GatingError::validation("Parameter 'max_training_rows' must be a positive integer")
                })?;
                if rows == 0 {
                    return Err(GatingError::validation(
                        "Parameter 'max_training_rows' must be at least 1",
                    ));
                }
                self.parameters.max_training_rows = rows as usize;
            }
            "knn_neighbors" => {
                let k = value.as_u64().ok_or_else(|| {
                    GatingError::validation("Parameter 'knn_neighbors' must be a positive integer")
                })?;
                if k == 0 {
                    return Err(GatingError::validation(
                        "Parameter 'knn_neighbors' must be at least 1",
                    ));
                }
                self.parameters.knn_neighbors = k as usize;
            }
            "training_seed" => {
                self.parameters.training_seed = value.as_u64().ok_or_else(|| {
                    GatingError::validation("Parameter 'training_seed' must be an integer")
                })?;
            }
            other => {
                return Err(GatingError::validation(format!(
                    "Unknown engine parameter '{other}'"
                )))
            }
        }
        Ok(())
    }

    /// Persist the tree and gate registry. If a previously saved snapshot
    /// holds a different index for any population still in the tree, the
    /// save aborts with a stale-index error unless `overwrite` is set.
    pub fn save(
        &self,
        adapter: &dyn PersistenceAdapter,
        overwrite: bool,
    ) -> Result<(), GatingError> {
        if let Some(existing) = adapter.load(&self.sample_id)? {
            for record in &existing.populations {
                if let Ok(node) = self.tree.get(&record.name) {
                    if node.index != record.index && !overwrite {
                        return Err(GatingError::stale_index(format!(
                            "The index for population '{}' has changed; pass overwrite \
                             to replace the persisted data",
                            record.name
                        )));
                    }
                }
            }
        }
        let populations = self
            .tree
            .names()
            .iter()
            .map(|name| self.tree.get(name).map(PopulationRecord::from_population))
            .collect::<Result<Vec<_>, _>>()?;
        let gates = self
            .registry
            .names()
            .iter()
            .map(|name| self.registry.get(name).map(GateRecord::from_gate))
            .collect::<Result<Vec<_>, _>>()?;
        adapter.save(&Snapshot {
            sample_id: self.sample_id.clone(),
            populations,
            gates,
        })
    }
}

fn string_list(parameters: &Parameters, key: &str) -> Result<Vec<String>, GatingError> {
    parameters
        .get(key)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
        })
        .flatten()
        .ok_or_else(|| {
            GatingError::validation(format!("Parameter '{key}' must be a list of strings"))
        })
}
