//! In-memory snapshot of the topology graph
//!
//! The store holds one record per node; this module assembles them into a
//! name-indexed snapshot that the allocator, the route resolver and the
//! layout engine read from.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use super::model::{HalfLink, NodeKind, TopologyRecord};

/// A deduplicated, undirected edge (one per uid)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub uid: u32,
    pub source: String,
    pub target: String,
}

/// A link whose two halves disagree or where one half is missing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asymmetry {
    pub uid: u32,
    pub node: String,
    pub reason: String,
}

/// Snapshot of every topology record, keyed by node name
#[derive(Debug, Clone, Default)]
pub struct TopologyGraph {
    records: BTreeMap<String, TopologyRecord>,
}

impl TopologyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = TopologyRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|r| (r.metadata.name.clone(), r))
                .collect(),
        }
    }

    pub fn insert(&mut self, record: TopologyRecord) {
        self.records.insert(record.metadata.name.clone(), record);
    }

    pub fn remove(&mut self, name: &str) -> Option<TopologyRecord> {
        self.records.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&TopologyRecord> {
        self.records.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(|k| k.as_str())
    }

    pub fn records(&self) -> impl Iterator<Item = &TopologyRecord> {
        self.records.values()
    }

    pub fn links_of(&self, name: &str) -> &[HalfLink] {
        self.records
            .get(name)
            .map(|r| r.spec.links.as_slice())
            .unwrap_or(&[])
    }

    /// Peers of `name`, in record order
    pub fn neighbors(&self, name: &str) -> impl Iterator<Item = &str> {
        self.links_of(name).iter().map(|l| l.peer.as_str())
    }

    /// Nodes of the given kind, sorted by name
    pub fn nodes_of_kind(&self, kind: NodeKind) -> Vec<&str> {
        self.names()
            .filter(|n| NodeKind::of_name(n) == Some(kind))
            .collect()
    }

    /// Degree counts every half-link on the node's own record
    pub fn degree(&self, name: &str) -> usize {
        self.links_of(name).len()
    }

    /// One edge per uid. Halves pointing at nodes without a record are
    /// skipped.
    pub fn edges(&self) -> Vec<Edge> {
        let mut seen = BTreeSet::new();
        let mut edges = Vec::new();
        for (name, record) in &self.records {
            for link in &record.spec.links {
                if !self.records.contains_key(&link.peer) {
                    continue;
                }
                if seen.insert(link.uid) {
                    edges.push(Edge {
                        uid: link.uid,
                        source: name.clone(),
                        target: link.peer.clone(),
                    });
                }
            }
        }
        edges
    }

    /// Check that every half has a matching mirror on its peer
    pub fn check_symmetry(&self) -> Vec<Asymmetry> {
        let mut problems = Vec::new();
        let mut counts: BTreeMap<u32, usize> = BTreeMap::new();

        for (name, record) in &self.records {
            for link in &record.spec.links {
                *counts.entry(link.uid).or_default() += 1;

                let Some(peer) = self.records.get(&link.peer) else {
                    problems.push(Asymmetry {
                        uid: link.uid,
                        node: name.clone(),
                        reason: format!("peer '{}' has no record", link.peer),
                    });
                    continue;
                };
                let expected = link.mirror(name);
                match peer.spec.links.iter().find(|l| l.uid == link.uid) {
                    None => problems.push(Asymmetry {
                        uid: link.uid,
                        node: name.clone(),
                        reason: format!("missing half on '{}'", link.peer),
                    }),
                    Some(other) if *other != expected => problems.push(Asymmetry {
                        uid: link.uid,
                        node: name.clone(),
                        reason: format!("half on '{}' is not swapped", link.peer),
                    }),
                    Some(_) => {}
                }
            }
        }

        for (uid, count) in counts {
            if count > 2 {
                problems.push(Asymmetry {
                    uid,
                    node: String::new(),
                    reason: format!("uid used by {} halves", count),
                });
            }
        }
        problems
    }
}
