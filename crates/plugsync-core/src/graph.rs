//! Dependency graph over plugin descriptors.
//!
//! Edges point from a node to the names it depends on. Required edges gate
//! completeness; optional edges only influence ordering and forced
//! refreshes. Targets need not be nodes themselves.
//!
//! Node names are artifact node ids (see [`node_id`]): the plain plugin name,
//! or `name[type]` for a type-tagged artifact, so artifacts that share a name
//! but not a type tag stay separate nodes.
//!
//! Cycles are tolerated: a cycle whose members are all present is complete,
//! and [`DependencyGraph::deployment_order`] breaks it by emitting the
//! cycle member with the smallest input position.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

use tracing::{debug, warn};

use crate::descriptor::Descriptor;
use crate::types::ArtifactKey;

/// Graph node id of an artifact.
pub fn node_id(key: &ArtifactKey) -> String {
    key.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorNode {
    pub name: String,
    pub required: Vec<String>,
    pub optional: Vec<String>,
}

impl DescriptorNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: Vec::new(),
            optional: Vec::new(),
        }
    }

    pub fn requires(mut self, name: impl Into<String>) -> Self {
        self.required.push(name.into());
        self
    }

    pub fn optionally(mut self, name: impl Into<String>) -> Self {
        self.optional.push(name.into());
        self
    }
}

impl From<&Descriptor> for DescriptorNode {
    fn from(d: &Descriptor) -> Self {
        Self {
            name: d.name.clone(),
            required: d.required.clone(),
            optional: d.optional.clone(),
        }
    }
}

/// A node removed by [`DependencyGraph::reduce`] and the chain that sank it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrunedNode {
    pub name: String,
    /// `name`, then each blocking dependency, ending with the missing one.
    pub chain: Vec<String>,
}

impl fmt::Display for PrunedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (missing)", self.chain.join(" -> "))
    }
}

#[derive(Debug, Clone)]
pub struct Reduction {
    pub graph: DependencyGraph,
    pub pruned: Vec<PrunedNode>,
}

/// Ordered registration work plus what had to be left out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentPlan {
    pub order: Vec<String>,
    pub excluded: Vec<PrunedNode>,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<DescriptorNode>,
    index: HashMap<String, usize>,
}

impl DependencyGraph {
    /// Build from descriptors in input order. A repeated name replaces the
    /// earlier node's edges but keeps its position.
    pub fn build<I>(descriptors: I) -> Self
    where
        I: IntoIterator<Item = DescriptorNode>,
    {
        let mut graph = Self::default();
        for node in descriptors {
            match graph.index.get(&node.name) {
                Some(&i) => graph.nodes[i] = node,
                None => {
                    graph.index.insert(node.name.clone(), graph.nodes.len());
                    graph.nodes.push(node);
                }
            }
        }
        graph
    }

    /// Build from descriptors keyed by name and type tag. A dependency on a
    /// name points at every node carrying that name.
    pub fn from_descriptors<'a, I>(descriptors: I) -> Self
    where
        I: IntoIterator<Item = &'a Descriptor>,
    {
        let descriptors: Vec<&Descriptor> = descriptors.into_iter().collect();
        let mut ids_by_name: HashMap<&str, Vec<String>> = HashMap::new();
        for d in &descriptors {
            let id = node_id(&d.key());
            let ids = ids_by_name.entry(d.name.as_str()).or_default();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }

        let resolve = |deps: &[String]| -> Vec<String> {
            deps.iter()
                .flat_map(|dep| {
                    ids_by_name
                        .get(dep.as_str())
                        .cloned()
                        .unwrap_or_else(|| vec![dep.clone()])
                })
                .collect()
        };

        Self::build(descriptors.iter().map(|d| DescriptorNode {
            name: node_id(&d.key()),
            required: resolve(&d.required),
            optional: resolve(&d.optional),
        }))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn node(&self, name: &str) -> Option<&DescriptorNode> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.name.as_str())
    }

    /// Whether every required dependency resolves to a node, with one
    /// diagnostic line per unresolved edge.
    pub fn is_complete(&self) -> (bool, Vec<String>) {
        let diagnostics: Vec<String> = self
            .nodes
            .iter()
            .flat_map(|node| {
                node.required
                    .iter()
                    .filter(|dep| !self.contains(dep))
                    .map(move |dep| format!("{} requires missing plugin '{}'", node.name, dep))
            })
            .collect();
        (diagnostics.is_empty(), diagnostics)
    }

    /// Names referenced by required edges that are not nodes.
    pub fn missing_dependencies(&self) -> BTreeSet<String> {
        self.nodes
            .iter()
            .flat_map(|n| n.required.iter())
            .filter(|dep| !self.contains(dep))
            .cloned()
            .collect()
    }

    /// Remove every node whose required chain cannot be satisfied, repeating
    /// until nothing else falls out.
    pub fn reduce(&self) -> Reduction {
        let mut alive: HashSet<&str> = self.names().collect();
        // name -> the dependency that blocked it
        let mut blocked_by: HashMap<&str, &str> = HashMap::new();
        let mut removal_order: Vec<&str> = Vec::new();

        loop {
            let doomed: Vec<(&str, &str)> = self
                .nodes
                .iter()
                .filter(|n| alive.contains(n.name.as_str()))
                .filter_map(|n| {
                    n.required
                        .iter()
                        .find(|dep| !alive.contains(dep.as_str()))
                        .map(|dep| (n.name.as_str(), dep.as_str()))
                })
                .collect();
            if doomed.is_empty() {
                break;
            }
            for (name, dep) in doomed {
                alive.remove(name);
                blocked_by.insert(name, dep);
                removal_order.push(name);
            }
        }

        let pruned: Vec<PrunedNode> = removal_order
            .iter()
            .map(|&name| {
                let mut chain = vec![name.to_string()];
                let mut current = name;
                while let Some(&dep) = blocked_by.get(current) {
                    chain.push(dep.to_string());
                    current = dep;
                }
                PrunedNode {
                    name: name.to_string(),
                    chain,
                }
            })
            .collect();

        for p in &pruned {
            debug!("Pruned {}", p);
        }

        let graph = Self::build(
            self.nodes
                .iter()
                .filter(|n| alive.contains(n.name.as_str()))
                .cloned(),
        );
        Reduction { graph, pruned }
    }

    /// Topological order: dependencies (required or optional, when present)
    /// before dependents, ties broken by input position.
    pub fn deployment_order(&self) -> Vec<String> {
        let n = self.nodes.len();
        let mut in_degree = vec![0usize; n];
        let mut deps_of: Vec<BTreeSet<usize>> = Vec::with_capacity(n);
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (i, node) in self.nodes.iter().enumerate() {
            let deps: BTreeSet<usize> = node
                .required
                .iter()
                .chain(node.optional.iter())
                .filter_map(|dep| self.index.get(dep).copied())
                .filter(|&d| d != i)
                .collect();
            in_degree[i] = deps.len();
            for &d in &deps {
                dependents[d].push(i);
            }
            deps_of.push(deps);
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut remaining: BTreeSet<usize> = (0..n).collect();
        let mut order = Vec::with_capacity(n);

        while !remaining.is_empty() {
            let next = match ready.pop_first() {
                Some(i) => i,
                None => {
                    let Some(i) = remaining
                        .iter()
                        .copied()
                        .find(|&i| on_cycle(i, &deps_of, &remaining))
                        .or_else(|| remaining.first().copied())
                    else {
                        break;
                    };
                    warn!(
                        "Dependency cycle involving '{}', registering it first",
                        self.nodes[i].name
                    );
                    i
                }
            };
            if !remaining.remove(&next) {
                continue;
            }
            order.push(self.nodes[next].name.clone());
            for &dependent in &dependents[next] {
                if remaining.contains(&dependent) {
                    in_degree[dependent] = in_degree[dependent].saturating_sub(1);
                    if in_degree[dependent] == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        order
    }

    /// Reduce, then order what is left.
    pub fn plan(&self) -> DeploymentPlan {
        let Reduction { graph, pruned } = self.reduce();
        DeploymentPlan {
            order: graph.deployment_order(),
            excluded: pruned,
        }
    }

    /// Nodes that optionally depend on `name`, in input order.
    pub fn optional_dependents_of(&self, name: &str) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.optional.iter().any(|d| d == name))
            .map(|n| n.name.clone())
            .collect()
    }

    /// Every name `name` depends on, directly or transitively, through
    /// required and optional edges. Targets that are not nodes are included.
    pub fn all_dependencies(&self, name: &str) -> Vec<String> {
        self.walk(name, |node| {
            node.required
                .iter()
                .chain(node.optional.iter())
                .cloned()
                .collect()
        })
    }

    /// Every node that depends on `name`, directly or transitively.
    pub fn all_dependents(&self, name: &str) -> Vec<String> {
        let mut reverse: HashMap<&str, Vec<String>> = HashMap::new();
        for node in &self.nodes {
            for dep in node.required.iter().chain(node.optional.iter()) {
                reverse
                    .entry(dep.as_str())
                    .or_default()
                    .push(node.name.clone());
            }
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        let mut queue: VecDeque<String> = VecDeque::from([name.to_string()]);
        while let Some(current) = queue.pop_front() {
            for dependent in reverse.get(current.as_str()).into_iter().flatten() {
                if dependent != name && seen.insert(dependent.clone()) {
                    out.push(dependent.clone());
                    queue.push_back(dependent.clone());
                }
            }
        }
        out
    }

    fn walk<F>(&self, start: &str, edges: F) -> Vec<String>
    where
        F: Fn(&DescriptorNode) -> Vec<String>,
    {
        let mut seen: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        let mut queue: VecDeque<String> = VecDeque::from([start.to_string()]);
        while let Some(current) = queue.pop_front() {
            let Some(node) = self.node(&current) else {
                continue;
            };
            for dep in edges(node) {
                if dep != start && seen.insert(dep.clone()) {
                    out.push(dep.clone());
                    queue.push_back(dep);
                }
            }
        }
        out
    }
}

/// Whether `start` can reach itself through dependencies still in
/// `remaining`.
fn on_cycle(start: usize, deps_of: &[BTreeSet<usize>], remaining: &BTreeSet<usize>) -> bool {
    let mut seen = HashSet::new();
    let mut stack: Vec<usize> = deps_of[start].iter().copied().collect();
    while let Some(i) = stack.pop() {
        if i == start {
            return true;
        }
        if remaining.contains(&i) && seen.insert(i) {
            stack.extend(deps_of[i].iter().copied());
        }
    }
    false
}
