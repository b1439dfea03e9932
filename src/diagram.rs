//! Graphviz view of the model's generative structure.

use crate::posterior::ReportError;
use petgraph::Graph;
use petgraph::dot::{Config, Dot};
use petgraph::graph::NodeIndex;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Observed,
    Data,
    Stochastic,
    Deterministic,
}

impl NodeKind {
    fn attrs(self) -> &'static str {
        match self {
            Self::Observed => "shape = box, style = \"rounded,filled\", fillcolor = \"#f2f2f2\"",
            Self::Data => "shape = box, style = rounded",
            Self::Stochastic => "shape = ellipse",
            Self::Deterministic => "shape = box",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ModelNode {
    pub key: &'static str,
    pub label: &'static str,
    pub kind: NodeKind,
}

impl fmt::Display for ModelNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}

pub type ModelGraph = Graph<ModelNode, &'static str>;

const NODES: [(&str, &str, NodeKind); 16] = [
    ("y", "Observed score\ny[i,m,t]", NodeKind::Observed),
    ("mu", "Linear predictor\nmu[i,m,t]", NodeKind::Deterministic),
    ("time", "Time coding\ntime[t]", NodeKind::Data),
    ("alpha", "Global intercept\nalpha", NodeKind::Stochastic),
    ("beta_time", "Global time effect\nbeta_time", NodeKind::Stochastic),
    ("sigma_id", "Subject effect scales\nsigma_id", NodeKind::Stochastic),
    ("corr_id", "Subject effect correlation\ncorr_id", NodeKind::Stochastic),
    ("L_id", "Cholesky factor\nL_id", NodeKind::Deterministic),
    ("b0", "Subject intercept\nb0[i]", NodeKind::Stochastic),
    ("b1", "Subject slope\nb1[i]", NodeKind::Stochastic),
    ("sd_u0", "Instrument intercept sd\nsd_u0", NodeKind::Stochastic),
    ("sd_u1", "Instrument slope sd\nsd_u1", NodeKind::Stochastic),
    ("u0_m", "Instrument intercept\nu0_m[m]", NodeKind::Stochastic),
    ("u1_m", "Instrument slope\nu1_m[m]", NodeKind::Stochastic),
    ("sigma", "Residual sd\nsigma", NodeKind::Stochastic),
    ("beta_m", "Instrument time effect\nbeta_m = beta_time + u1_m", NodeKind::Deterministic),
];

const EDGES: [(&str, &str); 17] = [
    ("alpha", "mu"),
    ("beta_time", "mu"),
    ("time", "mu"),
    ("b0", "mu"),
    ("b1", "mu"),
    ("u0_m", "mu"),
    ("u1_m", "mu"),
    ("mu", "y"),
    ("sigma", "y"),
    ("sigma_id", "L_id"),
    ("corr_id", "L_id"),
    ("L_id", "b0"),
    ("L_id", "b1"),
    ("sd_u0", "u0_m"),
    ("sd_u1", "u1_m"),
    ("beta_time", "beta_m"),
    ("u1_m", "beta_m"),
];

/// Directed graph from each quantity to the quantities it parameterizes.
pub fn model_graph() -> ModelGraph {
    let mut graph = ModelGraph::new();
    let index: HashMap<&str, NodeIndex> = NODES
        .iter()
        .map(|&(key, label, kind)| (key, graph.add_node(ModelNode { key, label, kind })))
        .collect();
    for (from, to) in EDGES {
        graph.add_edge(index[from], index[to], "");
    }
    graph
}

/// DOT source for [`model_graph`].
pub fn diagram_dot() -> String {
    let graph = model_graph();
    let dot = Dot::with_attr_getters(
        &graph,
        &[Config::NodeNoLabel, Config::EdgeNoLabel],
        &|_, _| String::new(),
        &|_, (_, node)| format!("label = {:?}, {}", node.label, node.kind.attrs()),
    );
    dot.to_string()
}

pub fn write_diagram(path: &Path) -> Result<(), ReportError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| ReportError::io(parent, e))?;
    }
    std::fs::write(path, diagram_dot()).map_err(|e| ReportError::io(path, e))?;
    log::info!("wrote model diagram to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{NodeKind, diagram_dot, model_graph, write_diagram};
    use petgraph::algo::is_cyclic_directed;
    use std::collections::HashSet;
    use tempfile::tempdir;

    #[test]
    fn graph_carries_the_generative_edges() {
        let graph = model_graph();
        assert_eq!(graph.node_count(), 16);
        let edges: HashSet<(&str, &str)> = graph
            .edge_indices()
            .filter_map(|e| graph.edge_endpoints(e))
            .map(|(a, b)| (graph[a].key, graph[b].key))
            .collect();
        assert_eq!(edges.len(), 17);
        for edge in [
            ("L_id", "b0"),
            ("L_id", "b1"),
            ("sigma_id", "L_id"),
            ("corr_id", "L_id"),
            ("sd_u0", "u0_m"),
            ("sd_u1", "u1_m"),
            ("mu", "y"),
            ("sigma", "y"),
            ("beta_time", "beta_m"),
            ("u1_m", "beta_m"),
        ] {
            assert!(edges.contains(&edge), "{edge:?}");
        }
        assert!(!is_cyclic_directed(&graph));
    }

    #[test]
    fn observed_node_is_a_sink() {
        let graph = model_graph();
        let y = graph
            .node_indices()
            .find(|&i| graph[i].kind == NodeKind::Observed)
            .unwrap();
        assert_eq!(graph[y].key, "y");
        assert_eq!(
            graph
                .neighbors_directed(y, petgraph::Direction::Outgoing)
                .count(),
            0
        );
    }

    #[test]
    fn dot_file_is_written() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("docs").join("model_diagram.dot");
        write_diagram(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, diagram_dot());
        assert!(text.starts_with("digraph"));
        assert!(text.contains("Cholesky factor"));
        assert!(text.contains("->"));
    }
}
