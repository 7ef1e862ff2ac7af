use crate::error::{Error, Result};
use crate::parser::{parse_network_file, ParsedNetwork};
use log::debug;
use rustc_hash::FxHashMap;
use std::borrow::Cow;
use std::path::Path;

/// One weighted input link between node positions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputEdge {
    pub source: usize,
    pub target: usize,
    pub weight: f64,
}

/// Anything that can hand the optimizer a weighted network.
///
/// Nodes are addressed by position `0..node_count()`.
pub trait NetworkSource {
    fn node_count(&self) -> usize;

    fn node_name(&self, node: usize) -> Cow<'_, str>;

    /// Used when teleportation targets are weighted by node.
    fn node_weight(&self, _node: usize) -> f64 {
        1.0
    }

    fn edges(&self) -> Box<dyn Iterator<Item = InputEdge> + '_>;
}

#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub id: u32,
    pub name: Option<String>,
    pub weight: f64,
}

/// In-memory network with optional names and node weights.
#[derive(Debug, Clone, Default)]
pub struct Network {
    nodes: Vec<NodeRecord>,
    edges: Vec<InputEdge>,
}

impl Network {
    /// Network of `n` unnamed nodes with ids `1..=n` and no edges.
    pub fn with_nodes(n: usize) -> Self {
        Self {
            nodes: (0..n)
                .map(|i| NodeRecord {
                    id: i as u32 + 1,
                    name: None,
                    weight: 1.0,
                })
                .collect(),
            edges: Vec::new(),
        }
    }

    pub fn from_edges<I>(n: usize, edges: I) -> Result<Self>
    where
        I: IntoIterator<Item = (usize, usize, f64)>,
    {
        let mut network = Self::with_nodes(n);
        for (source, target, weight) in edges {
            network.add_edge(source, target, weight)?;
        }
        Ok(network)
    }

    pub fn add_edge(&mut self, source: usize, target: usize, weight: f64) -> Result<()> {
        let node_count = self.nodes.len();
        for node in [source, target] {
            if node >= node_count {
                return Err(Error::UnknownNode { node, node_count });
            }
        }
        self.edges.push(InputEdge {
            source,
            target,
            weight,
        });
        Ok(())
    }

    pub fn set_name(&mut self, node: usize, name: impl Into<String>) {
        self.nodes[node].name = Some(name.into());
    }

    pub fn set_weight(&mut self, node: usize, weight: f64) {
        self.nodes[node].weight = weight;
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_parsed(parse_network_file(path)?)
    }

    /// Maps file ids to positions in ascending id order.
    pub fn from_parsed(parsed: ParsedNetwork) -> Result<Self> {
        let mut node_ids: Vec<u32> = parsed.vertices.keys().copied().collect();
        node_ids.sort_unstable();

        let mut id_to_idx: FxHashMap<u32, usize> = FxHashMap::default();
        id_to_idx.reserve(node_ids.len());
        for (idx, id) in node_ids.iter().copied().enumerate() {
            id_to_idx.insert(id, idx);
        }

        let nodes: Vec<NodeRecord> = node_ids
            .iter()
            .map(|id| {
                let v = &parsed.vertices[id];
                NodeRecord {
                    id: *id,
                    name: v.name.clone(),
                    weight: v.weight,
                }
            })
            .collect();

        let node_count = nodes.len();
        let mut edges: Vec<InputEdge> = Vec::with_capacity(parsed.links.len());
        for ((s_id, t_id), weight) in parsed.links {
            let lookup = |id: u32| {
                id_to_idx.get(&id).copied().ok_or(Error::UnknownNode {
                    node: id as usize,
                    node_count,
                })
            };
            edges.push(InputEdge {
                source: lookup(s_id)?,
                target: lookup(t_id)?,
                weight,
            });
        }
        edges.sort_unstable_by(|a, b| a.source.cmp(&b.source).then(a.target.cmp(&b.target)));

        debug!(
            "Read network with {} nodes and {} links ({} skipped)",
            node_count,
            edges.len(),
            parsed.skipped_links
        );

        Ok(Self { nodes, edges })
    }

    pub fn node(&self, node: usize) -> &NodeRecord {
        &self.nodes[node]
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}

impl NetworkSource for Network {
    fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn node_name(&self, node: usize) -> Cow<'_, str> {
        match &self.nodes[node].name {
            Some(name) => Cow::Borrowed(name.as_str()),
            None => Cow::Owned(self.nodes[node].id.to_string()),
        }
    }

    fn node_weight(&self, node: usize) -> f64 {
        self.nodes[node].weight
    }

    fn edges(&self) -> Box<dyn Iterator<Item = InputEdge> + '_> {
        Box::new(self.edges.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::VertexInput;

    #[test]
    fn unknown_nodes_are_rejected() {
        let err = Network::from_edges(2, [(0, 2, 1.0)]).unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownNode {
                node: 2,
                node_count: 2
            }
        ));
    }

    #[test]
    fn parsed_ids_are_remapped_in_ascending_order() {
        let mut parsed = ParsedNetwork::default();
        parsed.vertices.insert(
            10,
            VertexInput {
                name: Some("ten".into()),
                weight: 1.0,
            },
        );
        parsed.vertices.insert(
            3,
            VertexInput {
                name: None,
                weight: 2.0,
            },
        );
        parsed.links.insert((10, 3), 1.5);

        let network = Network::from_parsed(parsed).unwrap();
        assert_eq!(network.node_count(), 2);
        assert_eq!(network.node_name(0), "3");
        assert_eq!(network.node_name(1), "ten");
        assert_eq!(network.node_weight(0), 2.0);
        let edges: Vec<InputEdge> = network.edges().collect();
        assert_eq!(
            edges,
            vec![InputEdge {
                source: 1,
                target: 0,
                weight: 1.5
            }]
        );
    }
}
