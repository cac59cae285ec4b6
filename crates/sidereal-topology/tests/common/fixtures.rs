//! Test fixtures for topology integration tests.

use sidereal_topology::{NodeRecord, RawLatencies};

/// Builder for creating test NodeRecord instances.
pub struct NodeBuilder {
    record: NodeRecord,
}

impl NodeBuilder {
    /// Creates a new node builder with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            record: NodeRecord::new(name),
        }
    }

    /// Adds a label.
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.record.labels.insert(key.to_owned(), value.to_owned());
        self
    }

    /// Places the node in a zone.
    pub fn in_zone(self, zone: &str) -> Self {
        self.with_label("topology.kubernetes.io/zone", zone)
    }

    /// Builds the NodeRecord.
    pub fn build(self) -> NodeRecord {
        self.record
    }
}

/// Builds a latency payload from `(source, peer, ms)` triples.
pub fn latencies(entries: &[(&str, &str, f64)]) -> RawLatencies {
    let mut raw = RawLatencies::new();
    for (source, peer, ms) in entries {
        raw.entry((*source).to_owned())
            .or_default()
            .insert((*peer).to_owned(), *ms);
    }
    raw
}

/// Three nodes with symmetric latencies of 10, 20 and 30 ms.
pub fn triangle() -> RawLatencies {
    latencies(&[
        ("A", "B", 10.0),
        ("A", "C", 30.0),
        ("B", "A", 10.0),
        ("B", "C", 20.0),
        ("C", "A", 30.0),
        ("C", "B", 20.0),
    ])
}

/// Nodes A, B and C with no labels.
pub fn triangle_nodes() -> Vec<NodeRecord> {
    ["A", "B", "C"]
        .into_iter()
        .map(|n| NodeBuilder::new(n).build())
        .collect()
}
