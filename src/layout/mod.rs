//! 2-D layout of the topology for display
//!
//! Pure functions from a node set and an edge set to coordinates. The
//! default is a Kamada-Kawai stress layout; the radial layout is a cheaper
//! tree-like fallback.

pub mod kamada_kawai;
pub mod radial;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::topology::TopologyGraph;

pub use kamada_kawai::kamada_kawai_layout;
pub use radial::{radial_layout, DEFAULT_BASE_DISTANCE};

/// Node name to `(x, y)`
pub type Positions = BTreeMap<String, (f64, f64)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayoutAlgorithm {
    #[default]
    KamadaKawai,
    Radial,
}

impl fmt::Display for LayoutAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutAlgorithm::KamadaKawai => write!(f, "kamada-kawai"),
            LayoutAlgorithm::Radial => write!(f, "radial"),
        }
    }
}

impl FromStr for LayoutAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "kamada-kawai" | "kk" | "stress" => Ok(LayoutAlgorithm::KamadaKawai),
            "radial" | "bfs" => Ok(LayoutAlgorithm::Radial),
            other => Err(format!(
                "Unknown layout '{}' (expected kamada-kawai or radial)",
                other
            )),
        }
    }
}

/// Lay out every node of the graph, using its deduplicated edges
pub fn layout_graph(graph: &TopologyGraph, algorithm: LayoutAlgorithm) -> Positions {
    let nodes: Vec<String> = graph.names().map(|n| n.to_string()).collect();
    let edges: Vec<(String, String)> = graph
        .edges()
        .into_iter()
        .map(|e| (e.source, e.target))
        .collect();
    match algorithm {
        LayoutAlgorithm::KamadaKawai => kamada_kawai_layout(&nodes, &edges),
        LayoutAlgorithm::Radial => radial_layout(&nodes, &edges, DEFAULT_BASE_DISTANCE),
    }
}

/// Undirected adjacency over node indices, nodes sorted by name
pub(crate) struct Adjacency {
    pub names: Vec<String>,
    pub neighbors: Vec<Vec<usize>>,
}

impl Adjacency {
    pub fn new(nodes: &[String], edges: &[(String, String)]) -> Self {
        let names: Vec<String> = nodes
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let index: HashMap<&str, usize> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();

        let mut sets = vec![BTreeSet::new(); names.len()];
        for (a, b) in edges {
            if let (Some(&i), Some(&j)) = (index.get(a.as_str()), index.get(b.as_str())) {
                if i != j {
                    sets[i].insert(j);
                    sets[j].insert(i);
                }
            }
        }
        Self {
            names,
            neighbors: sets.into_iter().map(|s| s.into_iter().collect()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Hop counts from `source`; `None` for unreachable nodes
    pub fn bfs_distances(&self, source: usize) -> Vec<Option<usize>> {
        let mut dist = vec![None; self.len()];
        let mut queue = VecDeque::new();
        dist[source] = Some(0);
        queue.push_back(source);
        while let Some(current) = queue.pop_front() {
            let next = dist[current].map(|d| d + 1);
            for &peer in &self.neighbors[current] {
                if dist[peer].is_none() {
                    dist[peer] = next;
                    queue.push_back(peer);
                }
            }
        }
        dist
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{link_pair, TopologyRecord};

    #[test]
    fn test_algorithm_names() {
        assert_eq!("radial".parse::<LayoutAlgorithm>(), Ok(LayoutAlgorithm::Radial));
        assert_eq!(
            "Kamada-Kawai".parse::<LayoutAlgorithm>(),
            Ok(LayoutAlgorithm::KamadaKawai)
        );
        assert!("spring".parse::<LayoutAlgorithm>().is_err());
        assert_eq!(LayoutAlgorithm::default().to_string(), "kamada-kawai");
    }

    #[test]
    fn test_layout_graph_positions_every_node() {
        let (r, sw) = link_pair(1, "r1", "sw1", None, None);
        let graph = TopologyGraph::from_records(vec![
            TopologyRecord::new("r1", vec![r]),
            TopologyRecord::new("sw1", vec![sw]),
            TopologyRecord::new("fw1", vec![]),
        ]);
        for algorithm in [LayoutAlgorithm::KamadaKawai, LayoutAlgorithm::Radial] {
            let positions = layout_graph(&graph, algorithm);
            assert_eq!(positions.len(), 3);
        }
    }

    #[test]
    fn test_adjacency_ignores_unknown_and_self_edges() {
        let nodes = vec!["b".to_string(), "a".to_string()];
        let edges = vec![
            ("a".to_string(), "b".to_string()),
            ("a".to_string(), "a".to_string()),
            ("a".to_string(), "zz".to_string()),
        ];
        let adj = Adjacency::new(&nodes, &edges);
        assert_eq!(adj.names, vec!["a", "b"]);
        assert_eq!(adj.neighbors, vec![vec![1], vec![0]]);
        assert_eq!(adj.bfs_distances(0), vec![Some(0), Some(1)]);
    }
}
