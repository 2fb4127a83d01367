use crate::dataset::EventId;
use crate::error::GatingError;
use crate::geometry::Geometry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

pub const ROOT: &str = "root";

/// Minimal record of a cluster attached to a population by an external
/// clustering run. The engine only tracks enough to void clusters (with a
/// warning) when the population's index changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub cluster_id: String,
    pub tag: String,
    pub n: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Population {
    pub name: String,
    /// None only for root.
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub index: Vec<EventId>,
    /// None only for root.
    pub geometry: Option<Geometry>,
    pub prop_of_parent: f64,
    pub prop_of_total: f64,
    pub warnings: Vec<String>,
    pub clusters: Vec<Cluster>,
    /// Per-channel median of member events.
    pub signature: BTreeMap<String, f64>,
}

impl Population {
    pub fn n(&self) -> usize {
        self.index.len()
    }
}

/// Arena of population nodes addressed by name. Parent links and child
/// lists are kept in step by every mutation, so traversal never needs a
/// scan and ordering stays deterministic.
#[derive(Debug, Clone)]
pub struct PopulationTree {
    nodes: HashMap<String, Population>,
}

impl PopulationTree {
    pub fn new(root_index: Vec<EventId>) -> Self {
        let root = Population {
            name: ROOT.to_string(),
            parent: None,
            children: vec![],
            index: dedupe(root_index),
            geometry: None,
            prop_of_parent: 1.0,
            prop_of_total: 1.0,
            warnings: vec![],
            clusters: vec![],
            signature: BTreeMap::new(),
        };
        let mut nodes = HashMap::new();
        nodes.insert(ROOT.to_string(), root);
        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<&Population, GatingError> {
        self.nodes
            .get(name)
            .ok_or_else(|| GatingError::validation(format!("Population '{name}' does not exist")))
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Result<&mut Population, GatingError> {
        self.nodes
            .get_mut(name)
            .ok_or_else(|| GatingError::validation(format!("Population '{name}' does not exist")))
    }

    /// All population names, root first, then preorder.
    pub fn names(&self) -> Vec<String> {
        self.dependents(ROOT).unwrap_or_default()
    }

    pub fn root_size(&self) -> usize {
        self.nodes.get(ROOT).map(|n| n.index.len()).unwrap_or(0)
    }

    pub fn create(
        &mut self,
        name: &str,
        parent_name: &str,
        index: Vec<EventId>,
        geometry: Geometry,
        warnings: Vec<String>,
        signature: BTreeMap<String, f64>,
    ) -> Result<(), GatingError> {
        if self.nodes.contains_key(name) {
            return Err(GatingError::validation(format!(
                "Population '{name}' already exists"
            )));
        }
        let parent = self.get(parent_name)?;
        let index = dedupe(index);
        let members: HashSet<EventId> = parent.index.iter().copied().collect();
        if let Some(stray) = index.iter().find(|id| !members.contains(id)) {
            return Err(GatingError::validation(format!(
                "Population '{name}' contains event {stray} not present in parent '{parent_name}'"
            )));
        }
        let node = Population {
            name: name.to_string(),
            parent: Some(parent_name.to_string()),
            children: vec![],
            index,
            geometry: Some(geometry),
            prop_of_parent: 0.0,
            prop_of_total: 0.0,
            warnings,
            clusters: vec![],
            signature,
        };
        self.nodes.insert(name.to_string(), node);
        self.get_mut(parent_name)?.children.push(name.to_string());
        self.recompute_proportions(name)
    }

    /// All nodes whose path from root passes through `name`, `name` itself
    /// first, then preorder over the explicit child lists.
    pub fn dependents(&self, name: &str) -> Result<Vec<String>, GatingError> {
        self.get(name)?;
        let mut out = Vec::new();
        let mut stack = vec![name.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(&current) {
                for child in node.children.iter().rev() {
                    stack.push(child.clone());
                }
            }
            out.push(current);
        }
        Ok(out)
    }

    /// Detach `name` and remove it together with every dependent. Returns
    /// the removed names in traversal order.
    pub fn remove(&mut self, name: &str) -> Result<Vec<String>, GatingError> {
        if name == ROOT {
            return Err(GatingError::validation(
                "The root population cannot be removed",
            ));
        }
        let removed = self.dependents(name)?;
        let parent = self.get(name)?.parent.clone();
        for gone in &removed {
            self.nodes.remove(gone);
        }
        if let Some(parent) = parent {
            if let Some(node) = self.nodes.get_mut(&parent) {
                node.children.retain(|c| c != name);
            }
        }
        Ok(removed)
    }

    /// Replace geometry and index, recomputing proportions for this node
    /// only. Descendants keep their (now possibly stale) indices; cascading
    /// is the caller's decision.
    pub fn update_geometry_and_index(
        &mut self,
        name: &str,
        geometry: Geometry,
        new_index: Vec<EventId>,
    ) -> Result<(), GatingError> {
        if name == ROOT {
            return Err(GatingError::validation(
                "The root population has no geometry to update",
            ));
        }
        let parent_name = self
            .get(name)?
            .parent
            .clone()
            .ok_or_else(|| GatingError::internal(format!("Population '{name}' has no parent")))?;
        let new_index = dedupe(new_index);
        let members: HashSet<EventId> = self.get(&parent_name)?.index.iter().copied().collect();
        if let Some(stray) = new_index.iter().find(|id| !members.contains(id)) {
            return Err(GatingError::validation(format!(
                "Updated index for '{name}' contains event {stray} not present in parent '{parent_name}'"
            )));
        }
        let node = self.get_mut(name)?;
        node.geometry = Some(geometry);
        node.index = new_index;
        self.recompute_proportions(name)
    }

    fn recompute_proportions(&mut self, name: &str) -> Result<(), GatingError> {
        let n = self.get(name)?.n();
        let parent_n = match &self.get(name)?.parent {
            Some(parent) => self.get(parent)?.n(),
            None => n,
        };
        let root_n = self.root_size();
        let node = self.get_mut(name)?;
        if n == 0 {
            node.prop_of_parent = 0.0;
            node.prop_of_total = 0.0;
        } else {
            node.prop_of_parent = n as f64 / parent_n as f64;
            node.prop_of_total = n as f64 / root_n as f64;
        }
        Ok(())
    }

    /// Hierarchical text rendering of the tree, one node per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_node(ROOT, "", true, true, &mut out);
        out
    }

    fn render_node(&self, name: &str, prefix: &str, last: bool, is_root: bool, out: &mut String) {
        let Some(node) = self.nodes.get(name) else {
            return;
        };
        if is_root {
            out.push_str(name);
        } else {
            out.push_str(prefix);
            out.push_str(if last { "└── " } else { "├── " });
            out.push_str(name);
        }
        out.push('\n');
        let child_prefix = if is_root {
            String::new()
        } else {
            format!("{prefix}{}", if last { "    " } else { "│   " })
        };
        for (i, child) in node.children.iter().enumerate() {
            let child_last = i + 1 == node.children.len();
            self.render_node(child, &child_prefix, child_last, false, out);
        }
    }
}

fn dedupe(index: Vec<EventId>) -> Vec<EventId> {
    let mut seen = HashSet::with_capacity(index.len());
    index.into_iter().filter(|id| seen.insert(*id)).collect()
}
