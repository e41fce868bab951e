use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{Component, ComponentId, Edge};

/// Substrings that mark an id as an analyzer artifact rather than a real
/// component. Ids containing any of these are dropped from the leaf set.
const ERROR_ID_MARKERS: &[&str] = &["error", "exception", "failed", "invalid"];

/// Directed dependency graph over extracted components.
///
/// Only resolved edges participate in the adjacency map and therefore in
/// leaf detection; unresolved edges are kept on the side for the artifact.
#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraph<ComponentId, usize>,
    index: HashMap<ComponentId, NodeIndex>,
    adjacency: BTreeMap<ComponentId, BTreeSet<ComponentId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
            adjacency: BTreeMap::new(),
        }
    }

    /// Add a component as a node. Idempotent.
    pub fn add_component(&mut self, component: &Component) -> NodeIndex {
        if let Some(&idx) = self.index.get(&component.id) {
            return idx;
        }
        let idx = self.graph.add_node(component.id.clone());
        self.index.insert(component.id.clone(), idx);
        self.adjacency.entry(component.id.clone()).or_default();
        idx
    }

    /// Add a resolved edge between two known components. Edges whose endpoints
    /// are not in the node index are rejected, preserving the invariant that
    /// every adjacency key exists in the component table.
    pub fn add_resolved_edge(&mut self, edge: &Edge) {
        let (Some(&from), Some(&to)) = (self.index.get(&edge.caller), self.index.get(&edge.callee))
        else {
            warn!(
                caller = %edge.caller,
                callee = %edge.callee,
                "dropping edge with unknown endpoint"
            );
            return;
        };
        if edge.caller == edge.callee {
            return;
        }
        self.graph.add_edge(from, to, edge.line);
        self.adjacency
            .entry(edge.caller.clone())
            .or_default()
            .insert(edge.callee.clone());
    }

    /// Resolved outgoing callees of a component.
    pub fn resolved_callees(&self, id: &ComponentId) -> Option<&BTreeSet<ComponentId>> {
        self.adjacency.get(id)
    }

    pub fn contains(&self, id: &ComponentId) -> bool {
        self.index.contains_key(id)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the leaf set: components with no resolved outgoing edges whose
/// kind is class/interface/struct. Functions are admitted only when the
/// repository has no component of those kinds at all.
///
/// Ids that are empty, error-flavored, or missing from the table are dropped
/// with a warning.
pub fn extract_leaves(
    graph: &DependencyGraph,
    components: &BTreeMap<ComponentId, Component>,
) -> Vec<ComponentId> {
    let has_primary = components.values().any(|c| c.kind.is_primary());

    let mut leaves = Vec::new();
    for (id, component) in components {
        let eligible_kind = component.kind.is_primary()
            || (!has_primary && component.kind == crate::types::ComponentKind::Function);
        if !eligible_kind {
            continue;
        }
        let outgoing_empty = graph
            .resolved_callees(id)
            .map(|set| set.is_empty())
            .unwrap_or(true);
        if !outgoing_empty {
            continue;
        }
        if id.0.trim().is_empty() {
            warn!("skipping empty leaf id");
            continue;
        }
        let lowered = id.0.to_lowercase();
        if ERROR_ID_MARKERS.iter().any(|m| lowered.contains(m)) {
            warn!(id = %id, "skipping error-flavored leaf id");
            continue;
        }
        leaves.push(id.clone());
    }
    leaves
}

/// Serializable form of the analysis result, written to
/// `<sanitized_repo_name>_dependency_graph.json`.
#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyArtifact {
    pub components: BTreeMap<ComponentId, Component>,
    pub edges: Vec<Edge>,
    pub leaves: Vec<ComponentId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ComponentKind;
    use std::path::PathBuf;

    fn make_component(id: &str, kind: ComponentKind) -> Component {
        Component {
            id: ComponentId(id.to_string()),
            name: id.rsplit('.').next().unwrap().to_string(),
            kind,
            file_path: PathBuf::from("test.go"),
            relative_path: "test.go".to_string(),
            source_code: "type X struct {}".to_string(),
            start_line: 1,
            end_line: 1,
        }
    }

    fn make_edge(from: &str, to: &str) -> Edge {
        Edge {
            caller: ComponentId(from.to_string()),
            callee: ComponentId(to.to_string()),
            line: 1,
            resolved: true,
        }
    }

    fn build(components: &[Component], edges: &[Edge]) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for c in components {
            graph.add_component(c);
        }
        for e in edges {
            graph.add_resolved_edge(e);
        }
        graph
    }

    fn table(components: &[Component]) -> BTreeMap<ComponentId, Component> {
        components
            .iter()
            .map(|c| (c.id.clone(), c.clone()))
            .collect()
    }

    #[test]
    fn test_leaves_have_no_resolved_out_edges() {
        let components = vec![
            make_component("a.X", ComponentKind::Struct),
            make_component("a.Y", ComponentKind::Struct),
        ];
        let edges = vec![make_edge("a.X", "a.Y")];
        let graph = build(&components, &edges);
        let leaves = extract_leaves(&graph, &table(&components));
        assert_eq!(leaves, vec![ComponentId("a.Y".to_string())]);
    }

    #[test]
    fn test_methods_are_not_leaves() {
        let components = vec![
            make_component("a.X", ComponentKind::Struct),
            make_component("a.X.Run", ComponentKind::Method),
        ];
        let graph = build(&components, &[]);
        let leaves = extract_leaves(&graph, &table(&components));
        assert_eq!(leaves, vec![ComponentId("a.X".to_string())]);
    }

    #[test]
    fn test_functions_admitted_only_without_primary_kinds() {
        let funcs_only = vec![
            make_component("a.run", ComponentKind::Function),
            make_component("a.setup", ComponentKind::Function),
        ];
        let graph = build(&funcs_only, &[]);
        let leaves = extract_leaves(&graph, &table(&funcs_only));
        assert_eq!(leaves.len(), 2, "functions should be leaves in a C-style repo");

        let mixed = vec![
            make_component("a.run", ComponentKind::Function),
            make_component("a.X", ComponentKind::Struct),
        ];
        let graph = build(&mixed, &[]);
        let leaves = extract_leaves(&graph, &table(&mixed));
        assert_eq!(leaves, vec![ComponentId("a.X".to_string())]);
    }

    #[test]
    fn test_error_flavored_ids_filtered() {
        let components = vec![
            make_component("a.ParseError", ComponentKind::Struct),
            make_component("a.FailedJob", ComponentKind::Struct),
            make_component("a.Widget", ComponentKind::Struct),
        ];
        let graph = build(&components, &[]);
        let leaves = extract_leaves(&graph, &table(&components));
        assert_eq!(leaves, vec![ComponentId("a.Widget".to_string())]);
    }

    #[test]
    fn test_edge_with_unknown_endpoint_dropped() {
        let components = vec![make_component("a.X", ComponentKind::Struct)];
        let edges = vec![make_edge("a.X", "nowhere.Z")];
        let graph = build(&components, &edges);
        assert_eq!(graph.edge_count(), 0);
        // X keeps an empty out-set and stays a leaf.
        let leaves = extract_leaves(&graph, &table(&components));
        assert_eq!(leaves.len(), 1);
    }

    #[test]
    fn test_self_edges_ignored() {
        let components = vec![make_component("a.X", ComponentKind::Struct)];
        let edges = vec![make_edge("a.X", "a.X")];
        let graph = build(&components, &edges);
        let leaves = extract_leaves(&graph, &table(&components));
        assert_eq!(leaves.len(), 1);
    }
}
