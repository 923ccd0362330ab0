//! Topology view served to a front end

use serde::Serialize;

use crate::layout::{layout_graph, LayoutAlgorithm};
use crate::topology::{Edge, TopologyGraph};

/// Multiplier from layout units to view pixels
pub const VIEW_SCALE: f64 = 500.0;
/// Fixed node width and height in the view
pub const NODE_SIZE: f64 = 50.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewPosition {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewNode {
    pub id: String,
    /// `host`, `switch`, `firewall`, `router` or `unknown`
    pub kind: String,
    /// First numbered address, in CIDR form
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub position: ViewPosition,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewEdge {
    pub id: String,
    pub source: String,
    pub target: String,
}

impl From<Edge> for ViewEdge {
    fn from(edge: Edge) -> Self {
        Self {
            id: format!("link{}", edge.uid),
            source: edge.source,
            target: edge.target,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopologyView {
    pub layout: LayoutAlgorithm,
    pub nodes: Vec<ViewNode>,
    pub edges: Vec<ViewEdge>,
}

impl TopologyView {
    pub fn build(graph: &TopologyGraph, algorithm: LayoutAlgorithm) -> Self {
        let positions = layout_graph(graph, algorithm);
        let nodes = graph
            .records()
            .map(|record| {
                let (x, y) = positions.get(record.name()).copied().unwrap_or((0.0, 0.0));
                ViewNode {
                    id: record.name().to_string(),
                    kind: record
                        .node_kind()
                        .map(|k| k.as_str().to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                    ip: record.primary_ip().map(|ip| ip.to_string()),
                    position: ViewPosition {
                        x: x * VIEW_SCALE,
                        y: y * VIEW_SCALE,
                    },
                    width: NODE_SIZE,
                    height: NODE_SIZE,
                }
            })
            .collect();
        Self {
            layout: algorithm,
            nodes,
            edges: graph.edges().into_iter().map(ViewEdge::from).collect(),
        }
    }
}
