use crate::config::Config;
use crate::infomap::Infomap;
use crate::model::FlowModel;
use crate::objective::FlowData;
use crate::partition_queue::PartitionQueue;
use crate::tree::{NodeId, Tree};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub(crate) struct SubNode {
    pub data: FlowData,
    pub original_index: u32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SubEdge {
    pub source: u32,
    pub target: u32,
    pub weight: f64,
    pub flow: f64,
}

/// Detached copy of the children of one node and the links among them.
///
/// Node flow data is copied as is, so enter/exit flow still include links
/// leaving the parent.
#[derive(Debug, Clone, Default)]
pub(crate) struct SubNetwork {
    pub root_data: FlowData,
    pub nodes: Vec<SubNode>,
    pub edges: Vec<SubEdge>,
    pub exit_network_flow: f64,
}

impl SubNetwork {
    pub fn from_children(tree: &Tree, parent: NodeId) -> Self {
        let children = tree.children(parent);
        let mut local: FxHashMap<NodeId, u32> = FxHashMap::default();
        local.reserve(children.len());
        let mut nodes = Vec::with_capacity(children.len());
        for (i, &child) in children.iter().enumerate() {
            local.insert(child, i as u32);
            let node = tree.node(child);
            nodes.push(SubNode {
                data: node.data,
                original_index: node.original_index,
            });
        }

        let mut edges = Vec::new();
        for (i, &child) in children.iter().enumerate() {
            for &e in tree.node(child).out_edges() {
                let edge = tree.edge(e);
                if let Some(&target) = local.get(&edge.target) {
                    edges.push(SubEdge {
                        source: i as u32,
                        target,
                        weight: edge.weight,
                        flow: edge.flow,
                    });
                }
            }
        }

        let root_data = *tree.data(parent);
        Self {
            root_data,
            nodes,
            edges,
            exit_network_flow: root_data.exit_flow,
        }
    }

    /// Module-level network for indexing: a module is visited when it is
    /// entered. The root keeps only the entered flow, nothing of the parent.
    pub fn transform_node_flow_to_enter_flow(&mut self) {
        let mut total = 0.0;
        for node in self.nodes.iter_mut() {
            node.data.flow = node.data.enter_flow;
            total += node.data.flow;
        }
        self.root_data = FlowData::with_flow(total);
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum SubTask {
    /// Recursive search inside a queued module.
    Queue { level: u32, try_indexing: bool },
    /// Plain partition, as used when coarse-tuning and indexing.
    Partition { recursive_count: u32, fast: bool },
}

#[derive(Debug)]
pub(crate) struct SubJob {
    pub network: SubNetwork,
    pub seed: u64,
    pub sub_level: u32,
    pub task: SubTask,
}

#[derive(Debug)]
pub(crate) struct SubOutcome {
    pub infomap: Infomap,
    pub queue: PartitionQueue,
}

impl SubJob {
    fn run(self, config: &Arc<Config>, model: FlowModel) -> SubOutcome {
        let mut infomap =
            Infomap::from_sub_network(Arc::clone(config), model, self.network, self.seed, self.sub_level);
        let mut queue = PartitionQueue::default();
        match self.task {
            SubTask::Queue {
                level,
                try_indexing,
            } => {
                queue.level = level;
                infomap.partition_and_queue_next_level(&mut queue, try_indexing);
            }
            SubTask::Partition {
                recursive_count,
                fast,
            } => {
                infomap.partition(recursive_count, fast);
            }
        }
        SubOutcome { infomap, queue }
    }
}

/// Runs sibling jobs, on the current rayon pool when more than one worker is
/// configured. Outcomes come back in job order either way.
pub(crate) fn run_sub_jobs(
    config: &Arc<Config>,
    model: FlowModel,
    jobs: Vec<SubJob>,
) -> Vec<SubOutcome> {
    if config.worker_threads() > 1 && jobs.len() > 1 {
        jobs.into_par_iter()
            .map(|job| job.run(config, model))
            .collect()
    } else {
        jobs.into_iter().map(|job| job.run(config, model)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_copy_keeps_internal_links_only() {
        let mut tree = Tree::new(0);
        for i in 0..3 {
            tree.add_leaf(i, FlowData::with_flow(1.0 / 3.0));
        }
        let root = tree.root();
        let leaves = tree.leaves().to_vec();
        tree.add_edge(leaves[0], leaves[1], 1.0, 0.2);
        tree.add_edge(leaves[1], leaves[2], 2.0, 0.3);
        tree.release_children(root);
        let a = tree.create_module(FlowData {
            flow: 2.0 / 3.0,
            exit_flow: 0.3,
            enter_flow: 0.3,
            ..FlowData::default()
        });
        let b = tree.create_module(FlowData::with_flow(1.0 / 3.0));
        tree.add_child(root, a);
        tree.add_child(root, b);
        tree.add_child(a, leaves[0]);
        tree.add_child(a, leaves[1]);
        tree.add_child(b, leaves[2]);

        let sub = SubNetwork::from_children(&tree, a);
        assert_eq!(sub.node_count(), 2);
        assert_eq!(sub.edges.len(), 1);
        assert_eq!((sub.edges[0].source, sub.edges[0].target), (0, 1));
        assert_eq!(sub.exit_network_flow, 0.3);
        assert_eq!(sub.nodes[1].original_index, 1);
    }

    #[test]
    fn enter_flow_network_root_holds_entered_flow() {
        let mut tree = Tree::new(0);
        for (i, enter) in [0.1, 0.3].into_iter().enumerate() {
            tree.add_leaf(
                i as u32,
                FlowData {
                    flow: 0.5,
                    enter_flow: enter,
                    exit_flow: enter,
                    ..FlowData::default()
                },
            );
        }
        let root = tree.root();
        tree.data_mut(root).flow = 1.0;

        let mut sub = SubNetwork::from_children(&tree, root);
        sub.transform_node_flow_to_enter_flow();
        assert_eq!(sub.nodes[0].data.flow, 0.1);
        assert_eq!(sub.nodes[1].data.flow, 0.3);
        assert!((sub.root_data.flow - 0.4).abs() < 1e-15);
        assert_eq!(sub.root_data.exit_flow, 0.0);
        assert_eq!(sub.exit_network_flow, 0.0);
    }
}
