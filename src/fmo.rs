//! Projection of gated populations onto FMO control data. Controls are
//! never gated directly: each population along the path from root to the
//! target is predicted by a nearest-neighbour classifier trained on the
//! parent's primary events, and every hop is cached per control so repeat
//! projections are free.
//!
//! Cache entries are never invalidated. Editing an ancestor gate leaves
//! previously projected control indices stale; that mirrors the behaviour
//! of the in-memory search cache this is modelled on and is accepted until
//! a product decision says otherwise.

use crate::dataset::{EventId, EventTable};
use crate::error::GatingError;
use crate::geometry::Geometry;
use crate::knn::KnnClassifier;
use crate::population::{PopulationTree, ROOT};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Axis pair for projecting a population whose gate has no usable shape
/// (supervised ML gates).
#[derive(Debug, Clone)]
pub struct AxisProfile {
    pub x: String,
    pub y: String,
}

#[derive(Debug, Clone)]
pub struct ProjectionSettings {
    /// Fallback y axis for 1D gates.
    pub default_axis: String,
    /// Upper bound on classifier training rows per hop.
    pub max_training_rows: usize,
    pub knn_neighbors: usize,
    /// Seed for the deterministic training sub-sample.
    pub training_seed: u64,
}

/// Per-control, per-population cache of projected indices. Scoped to one
/// engine instance; never persisted.
#[derive(Debug, Clone, Default)]
pub struct FmoCache {
    entries: HashMap<(String, String), Vec<EventId>>,
    trainings: u64,
}

impl FmoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_root(&mut self, control: &str, index: Vec<EventId>) {
        self.entries
            .insert((control.to_string(), ROOT.to_string()), index);
    }

    pub fn get(&self, control: &str, population: &str) -> Option<&Vec<EventId>> {
        self.entries
            .get(&(control.to_string(), population.to_string()))
    }

    fn insert(&mut self, control: &str, population: &str, index: Vec<EventId>) {
        self.entries
            .insert((control.to_string(), population.to_string()), index);
    }

    /// How many classifier trainings have run; cache hits do not move it.
    pub fn classifier_runs(&self) -> u64 {
        self.trainings
    }
}

/// Project `target` onto the named control, filling the cache for every
/// population along the way.
pub fn project(
    cache: &mut FmoCache,
    tree: &PopulationTree,
    primary: &EventTable,
    control_name: &str,
    control: &EventTable,
    target: &str,
    axis_profiles: &HashMap<String, AxisProfile>,
    settings: &ProjectionSettings,
) -> Result<Vec<EventId>, GatingError> {
    tree.get(target)?;
    if let Some(cached) = cache.get(control_name, target) {
        return Ok(cached.clone());
    }
    if cache.get(control_name, ROOT).is_none() {
        cache.seed_root(control_name, control.ids().to_vec());
    }

    // Path from root to target, then drop everything up to and including
    // the deepest ancestor that is already cached.
    let mut path = vec![target.to_string()];
    let mut cursor = target.to_string();
    while let Some(parent) = tree.get(&cursor)?.parent.clone() {
        path.push(parent.clone());
        cursor = parent;
    }
    path.reverse();
    let start = path
        .iter()
        .rposition(|pop| cache.get(control_name, pop).is_some())
        .unwrap_or(0);
    let mut previous = cache
        .get(control_name, &path[start])
        .cloned()
        .unwrap_or_default();

    for pop in &path[start + 1..] {
        let node = tree.get(pop)?;
        let geometry = node.geometry.as_ref().ok_or_else(|| {
            GatingError::internal(format!("Population '{pop}' has no geometry to project"))
        })?;
        let (x, y) = projection_axes(pop, geometry, axis_profiles, settings)?;
        let parent = node.parent.as_deref().ok_or_else(|| {
            GatingError::internal(format!("Population '{pop}' has no parent to train on"))
        })?;

        let train = primary.axis_pair(&x, &y, &tree.get(parent)?.index)?;
        let train = bounded_sample(&train, settings.max_training_rows, settings.training_seed);
        if train.is_empty() {
            return Err(GatingError::missing_data(format!(
                "No training events available for population '{pop}'"
            )));
        }
        let members: HashSet<EventId> = node.index.iter().copied().collect();
        let (points, labels): (Vec<[f64; 2]>, Vec<bool>) = train
            .iter()
            .map(|(id, point)| (*point, members.contains(id)))
            .unzip();
        let knn = KnnClassifier::fit(settings.knn_neighbors, points, labels)?;
        cache.trainings += 1;
        debug!(
            population = pop.as_str(),
            control = control_name,
            training_rows = train.len(),
            "training FMO hop classifier"
        );

        let candidates = control.axis_pair(&x, &y, &previous)?;
        let predicted: Vec<EventId> = candidates
            .iter()
            .filter(|(_, point)| knn.predict(*point))
            .map(|(id, _)| *id)
            .collect();
        cache.insert(control_name, pop, predicted.clone());
        previous = predicted;
    }

    Ok(previous)
}

fn projection_axes(
    pop: &str,
    geometry: &Geometry,
    axis_profiles: &HashMap<String, AxisProfile>,
    settings: &ProjectionSettings,
) -> Result<(String, String), GatingError> {
    if matches!(geometry, Geometry::Supervised { .. }) {
        let profile = axis_profiles.get(pop).ok_or_else(|| {
            GatingError::missing_data(format!(
                "Population '{pop}' is supervised-ML defined and needs an axis profile"
            ))
        })?;
        return Ok((profile.x.clone(), profile.y.clone()));
    }
    let x = geometry.x_axis().to_string();
    let y = geometry
        .y_axis()
        .unwrap_or(&settings.default_axis)
        .to_string();
    Ok((x, y))
}

/// Deterministic bounded sub-sample: a seeded multiply-add generator picks
/// distinct positions, which are then restored to input order.
fn bounded_sample<T: Copy>(rows: &[T], cap: usize, seed: u64) -> Vec<T> {
    if rows.len() <= cap {
        return rows.to_vec();
    }
    let mut state = seed;
    let mut seen: HashSet<usize> = HashSet::with_capacity(cap * 2);
    let mut chosen: Vec<usize> = Vec::with_capacity(cap);
    while chosen.len() < cap {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let idx = (state as usize) % rows.len();
        if seen.insert(idx) {
            chosen.push(idx);
        }
    }
    chosen.sort_unstable();
    chosen.into_iter().map(|i| rows[i]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Sign;
    use std::collections::BTreeMap;

    fn settings() -> ProjectionSettings {
        ProjectionSettings {
            default_axis: "FSC-A".to_string(),
            max_training_rows: 10_000,
            knn_neighbors: 5,
            training_seed: 0x9E3779B97F4A7C15,
        }
    }

    /// Primary and control both carry a low cluster near 0 and a high
    /// cluster near 10 on CD4.
    fn two_cluster_table(ids_base: u64) -> EventTable {
        let mut t = EventTable::new(vec!["CD4".to_string(), "FSC-A".to_string()]).unwrap();
        for i in 0..20 {
            t.push_row(ids_base + i, vec![i as f64 * 0.01, 1.0]).unwrap();
        }
        for i in 20..40 {
            t.push_row(ids_base + i, vec![10.0 + (i - 20) as f64 * 0.01, 1.0])
                .unwrap();
        }
        t
    }

    fn gated_tree(primary: &EventTable) -> PopulationTree {
        let mut tree = PopulationTree::new(primary.ids().to_vec());
        let geometry = Geometry::Threshold1D {
            x: "CD4".to_string(),
            transform_x: None,
            threshold: 5.0,
            definitions: vec![Sign::Positive],
        };
        let index = crate::region::evaluate(&geometry, primary, primary.ids()).unwrap();
        tree.create("cd4_pos", ROOT, index, geometry, vec![], BTreeMap::new())
            .unwrap();
        tree
    }

    #[test]
    fn test_projection_finds_high_cluster_in_control() {
        let primary = two_cluster_table(0);
        let control = two_cluster_table(1000);
        let tree = gated_tree(&primary);
        let mut cache = FmoCache::new();
        let projected = project(
            &mut cache,
            &tree,
            &primary,
            "CD4-FMO",
            &control,
            "cd4_pos",
            &HashMap::new(),
            &settings(),
        )
        .unwrap();
        // The high cluster in the control is ids 1020..1040.
        assert_eq!(projected, (1020..1040).collect::<Vec<_>>());
        assert_eq!(cache.classifier_runs(), 1);
    }

    #[test]
    fn test_cache_hit_skips_training() {
        let primary = two_cluster_table(0);
        let control = two_cluster_table(1000);
        let tree = gated_tree(&primary);
        let mut cache = FmoCache::new();
        let first = project(
            &mut cache,
            &tree,
            &primary,
            "CD4-FMO",
            &control,
            "cd4_pos",
            &HashMap::new(),
            &settings(),
        )
        .unwrap();
        let runs = cache.classifier_runs();
        let second = project(
            &mut cache,
            &tree,
            &primary,
            "CD4-FMO",
            &control,
            "cd4_pos",
            &HashMap::new(),
            &settings(),
        )
        .unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.classifier_runs(), runs);
    }

    #[test]
    fn test_supervised_population_requires_axis_profile() {
        let primary = two_cluster_table(0);
        let control = two_cluster_table(1000);
        let mut tree = PopulationTree::new(primary.ids().to_vec());
        tree.create(
            "ml_pop",
            ROOT,
            (20..40).collect(),
            Geometry::Supervised {
                x: "CD4".to_string(),
                y: None,
            },
            vec![],
            BTreeMap::new(),
        )
        .unwrap();
        let mut cache = FmoCache::new();
        let err = project(
            &mut cache,
            &tree,
            &primary,
            "CD4-FMO",
            &control,
            "ml_pop",
            &HashMap::new(),
            &settings(),
        )
        .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::MissingData);
        // The failed projection must not leave a cache entry behind.
        assert!(cache.get("CD4-FMO", "ml_pop").is_none());

        let mut profiles = HashMap::new();
        profiles.insert(
            "ml_pop".to_string(),
            AxisProfile {
                x: "CD4".to_string(),
                y: "FSC-A".to_string(),
            },
        );
        let projected = project(
            &mut cache,
            &tree,
            &primary,
            "CD4-FMO",
            &control,
            "ml_pop",
            &profiles,
            &settings(),
        )
        .unwrap();
        assert_eq!(projected, (1020..1040).collect::<Vec<_>>());
    }

    #[test]
    fn test_bounded_sample_is_deterministic_and_capped() {
        let rows: Vec<u64> = (0..100).collect();
        let a = bounded_sample(&rows, 10, 42);
        let b = bounded_sample(&rows, 10, 42);
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(bounded_sample(&rows, 200, 42), rows);
    }
}
