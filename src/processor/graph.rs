use crate::error::GraphError;
use crate::processor::job::{NodeAction, NodeGroup};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// External quota shared by several nodes. Nodes in the same group never run
/// at the same time and their starts are spaced apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QuotaGroup {
    Yahoo,
    Llm,
}

impl QuotaGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaGroup::Yahoo => "yahoo",
            QuotaGroup::Llm => "llm",
        }
    }
}

impl fmt::Display for QuotaGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the executor does with a node whose upstream did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpstreamPolicy {
    /// Start anyway; the action inspects `RunContext::upstream` itself.
    #[default]
    Run,
    SkipOnFailure,
}

#[derive(Clone)]
pub struct NodeSpec {
    pub name: String,
    pub group: NodeGroup,
    pub dependencies: Vec<String>,
    pub quota: Option<QuotaGroup>,
    pub upstream_policy: UpstreamPolicy,
    pub timeout: Option<Duration>,
    pub action: Arc<dyn NodeAction>,
}

impl NodeSpec {
    pub fn new(name: &str, group: NodeGroup, action: Arc<dyn NodeAction>) -> Self {
        Self {
            name: name.to_string(),
            group,
            dependencies: Vec::new(),
            quota: None,
            upstream_policy: UpstreamPolicy::Run,
            timeout: None,
            action,
        }
    }

    pub fn depends_on<'a>(mut self, upstream: impl IntoIterator<Item = &'a str>) -> Self {
        for name in upstream {
            if !self.dependencies.iter().any(|d| d == name) {
                self.dependencies.push(name.to_string());
            }
        }
        self
    }

    pub fn quota(mut self, quota: QuotaGroup) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn skip_on_failure(mut self) -> Self {
        self.upstream_policy = UpstreamPolicy::SkipOnFailure;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSpec")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("dependencies", &self.dependencies)
            .field("quota", &self.quota)
            .field("upstream_policy", &self.upstream_policy)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Collects nodes and edges. Duplicate names and cycles are rejected as soon
/// as they are introduced; dangling dependencies are allowed until `build`.
#[derive(Default, Debug)]
pub struct TaskGraphBuilder {
    nodes: BTreeMap<String, NodeSpec>,
}

impl TaskGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: NodeSpec) -> Result<&mut Self, GraphError> {
        if self.nodes.contains_key(&spec.name) {
            return Err(GraphError::DuplicateNode(spec.name));
        }
        let name = spec.name.clone();
        self.nodes.insert(name.clone(), spec);
        if let Some(cycle) = self.cycle_through(&name) {
            self.nodes.remove(&name);
            return Err(GraphError::Cycle(cycle));
        }
        Ok(self)
    }

    pub fn add_dependency(&mut self, node: &str, upstream: &str) -> Result<&mut Self, GraphError> {
        let spec = self
            .nodes
            .get_mut(node)
            .ok_or_else(|| GraphError::UnknownNode(node.to_string()))?;
        if spec.dependencies.iter().any(|d| d == upstream) {
            return Ok(self);
        }
        spec.dependencies.push(upstream.to_string());

        if let Some(cycle) = self.cycle_through(node) {
            if let Some(spec) = self.nodes.get_mut(node) {
                spec.dependencies.retain(|d| d != upstream);
            }
            return Err(GraphError::Cycle(cycle));
        }
        Ok(self)
    }

    pub fn build(self) -> Result<TaskGraph, GraphError> {
        for spec in self.nodes.values() {
            for dependency in &spec.dependencies {
                if !self.nodes.contains_key(dependency) {
                    return Err(GraphError::UnknownDependency {
                        node: spec.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }
        Ok(TaskGraph {
            nodes: self
                .nodes
                .into_iter()
                .map(|(name, spec)| (name, Arc::new(spec)))
                .collect(),
        })
    }

    /// Path `start -> ... -> start` along dependency edges, if one exists.
    fn cycle_through(&self, start: &str) -> Option<Vec<String>> {
        let mut path = vec![start.to_string()];
        let mut visited = BTreeSet::new();
        if self.walk(start, start, &mut path, &mut visited) {
            Some(path)
        } else {
            None
        }
    }

    fn walk<'a>(
        &'a self,
        current: &'a str,
        target: &str,
        path: &mut Vec<String>,
        visited: &mut BTreeSet<&'a str>,
    ) -> bool {
        let Some(spec) = self.nodes.get(current) else {
            return false;
        };
        for dependency in &spec.dependencies {
            path.push(dependency.clone());
            if dependency == target {
                return true;
            }
            if visited.insert(dependency.as_str()) && self.walk(dependency, target, path, visited) {
                return true;
            }
            path.pop();
        }
        false
    }
}

/// Validated, immutable DAG.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    nodes: BTreeMap<String, Arc<NodeSpec>>,
}

impl TaskGraph {
    pub fn node(&self, name: &str) -> Option<&Arc<NodeSpec>> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Node names in alphabetical order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Topological order of `subset`. Among nodes that are ready at the same
    /// time the alphabetically smallest goes first, so the order only depends
    /// on the subset. Dependencies outside the subset count as satisfied.
    pub fn execution_order<S: AsRef<str>>(&self, subset: &[S]) -> Result<Vec<String>, GraphError> {
        let mut selected = BTreeSet::new();
        for name in subset {
            let name = name.as_ref();
            let (key, _) = self
                .nodes
                .get_key_value(name)
                .ok_or_else(|| GraphError::UnknownNode(name.to_string()))?;
            selected.insert(key.as_str());
        }

        let mut remaining: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for &name in &selected {
            let spec = &self.nodes[name];
            let inside: Vec<&str> = spec
                .dependencies
                .iter()
                .map(String::as_str)
                .filter(|d| selected.contains(d))
                .collect();
            remaining.insert(name, inside.len());
            for dependency in inside {
                dependents.entry(dependency).or_default().push(name);
            }
        }

        let mut ready: BTreeSet<&str> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(selected.len());
        while let Some(name) = ready.pop_first() {
            order.push(name.to_string());
            for &dependent in dependents.get(name).map(Vec::as_slice).unwrap_or_default() {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if order.len() != selected.len() {
            // Unreachable for a built graph; kept so a bad subset never loops.
            let stuck = selected
                .iter()
                .filter(|n| !order.iter().any(|o| o == *n))
                .map(|n| n.to_string())
                .collect();
            return Err(GraphError::Cycle(stuck));
        }
        Ok(order)
    }

    /// Every node that transitively depends on one of `names`, plus `names`.
    pub fn with_downstream<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<String>, GraphError> {
        let mut closure: BTreeSet<String> = BTreeSet::new();
        for name in names {
            if !self.contains(name.as_ref()) {
                return Err(GraphError::UnknownNode(name.as_ref().to_string()));
            }
            closure.insert(name.as_ref().to_string());
        }
        loop {
            let added: Vec<String> = self
                .nodes
                .values()
                .filter(|spec| !closure.contains(&spec.name))
                .filter(|spec| spec.dependencies.iter().any(|d| closure.contains(d)))
                .map(|spec| spec.name.clone())
                .collect();
            if added.is_empty() {
                break;
            }
            closure.extend(added);
        }
        Ok(closure.into_iter().collect())
    }
}
