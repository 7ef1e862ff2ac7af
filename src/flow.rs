use crate::config::{Config, FlowModelKind, TeleportTo};
use crate::error::{Error, Result};
use crate::graph::NetworkSource;
use log::{debug, warn};
use rustc_hash::FxHashMap;

const MAX_ITERATIONS: usize = 200;
const MIN_ITERATIONS: usize = 50;
const CONVERGENCE_ERROR: f64 = 1.0e-15;

/// Aggregated link with its raw weight and derived flow.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Connection {
    pub source: usize,
    pub target: usize,
    pub weight: f64,
    pub flow: f64,
}

impl Connection {
    #[inline]
    pub fn is_self_link(&self) -> bool {
        self.source == self.target
    }
}

/// Stationary node flow and link flow of an input network.
#[derive(Debug, Clone, Default)]
pub struct FlowNetwork {
    pub node_flow: Vec<f64>,
    pub node_teleport_weights: Vec<f64>,
    pub connections: Vec<Connection>,
}

fn normalize(v: &mut [f64]) {
    let sum: f64 = v.iter().sum();
    if sum > 0.0 {
        for x in v.iter_mut() {
            *x /= sum;
        }
    }
}

/// Sums parallel links and drops non-positive ones. Undirected links are
/// keyed on their unordered endpoint pair. Output is sorted by endpoints.
fn aggregate_links<N: NetworkSource + ?Sized>(
    network: &N,
    undirected: bool,
) -> Result<Vec<Connection>> {
    let node_count = network.node_count();
    let mut index: FxHashMap<(usize, usize), usize> = FxHashMap::default();
    let mut connections: Vec<Connection> = Vec::new();
    let mut skipped = 0usize;

    for edge in network.edges() {
        for node in [edge.source, edge.target] {
            if node >= node_count {
                return Err(Error::UnknownNode { node, node_count });
            }
        }
        if !(edge.weight > 0.0) || !edge.weight.is_finite() {
            skipped += 1;
            continue;
        }
        let (mut s, mut t) = (edge.source, edge.target);
        if undirected && t < s {
            std::mem::swap(&mut s, &mut t);
        }
        match index.get(&(s, t)) {
            Some(&i) => connections[i].weight += edge.weight,
            None => {
                index.insert((s, t), connections.len());
                connections.push(Connection {
                    source: s,
                    target: t,
                    weight: edge.weight,
                    flow: 0.0,
                });
            }
        }
    }

    if skipped > 0 {
        warn!("Skipped {} links with non-positive or non-finite weight", skipped);
    }
    connections.sort_unstable_by(|a, b| a.source.cmp(&b.source).then(a.target.cmp(&b.target)));
    Ok(connections)
}

impl FlowNetwork {
    pub fn calculate<N: NetworkSource + ?Sized>(network: &N, config: &Config) -> Result<Self> {
        let n = network.node_count();
        if n == 0 {
            return Err(Error::EmptyNetwork);
        }
        let kind = config.flow_model_kind();
        let mut connections = aggregate_links(network, kind == FlowModelKind::Undirected)?;

        let mut flow_network = match kind {
            FlowModelKind::Undirected => {
                let node_flow = undirected_flow(n, &mut connections, config.include_self_links);
                Self {
                    node_flow,
                    node_teleport_weights: vec![0.0; n],
                    connections,
                }
            }
            FlowModelKind::Directed | FlowModelKind::DirectedUnrecorded => {
                let teleport_weights = teleport_weights(network, &connections, config);
                let node_flow = directed_flow(
                    n,
                    &mut connections,
                    &teleport_weights,
                    config,
                    kind == FlowModelKind::Directed,
                );
                Self {
                    node_flow,
                    node_teleport_weights: teleport_weights,
                    connections,
                }
            }
        };

        // An edgeless network still has to encode which node is visited.
        if flow_network.node_flow.iter().sum::<f64>() <= 0.0 {
            flow_network.node_flow = vec![1.0 / n as f64; n];
        }
        Ok(flow_network)
    }

    pub fn node_count(&self) -> usize {
        self.node_flow.len()
    }
}

/// Degree-weighted flow; a link carries `w / (2W - W_self)` in each direction.
fn undirected_flow(n: usize, connections: &mut [Connection], include_self_links: bool) -> Vec<f64> {
    let mut sum_weight = 0.0;
    let mut self_weight = 0.0;
    for c in connections.iter() {
        if c.is_self_link() {
            if !include_self_links {
                continue;
            }
            self_weight += c.weight;
        }
        sum_weight += c.weight;
    }
    let sum_weighted_degree = 2.0 * sum_weight - self_weight;

    let mut node_flow = vec![0.0f64; n];
    if sum_weighted_degree <= 0.0 {
        return node_flow;
    }
    for c in connections.iter_mut() {
        if c.is_self_link() && !include_self_links {
            c.flow = 0.0;
            continue;
        }
        c.flow = c.weight / sum_weighted_degree;
        node_flow[c.source] += c.flow;
        if !c.is_self_link() {
            node_flow[c.target] += c.flow;
        }
    }
    node_flow
}

fn teleport_weights<N: NetworkSource + ?Sized>(
    network: &N,
    connections: &[Connection],
    config: &Config,
) -> Vec<f64> {
    let n = network.node_count();
    let mut weights = match config.teleport_to {
        TeleportTo::Uniform => vec![1.0; n],
        TeleportTo::NodeWeight => (0..n).map(|i| network.node_weight(i).max(0.0)).collect(),
        TeleportTo::LinkWeight => {
            let mut w = vec![0.0; n];
            for c in connections {
                w[c.source] += c.weight;
            }
            w
        }
    };
    if weights.iter().sum::<f64>() <= 0.0 {
        weights = vec![1.0; n];
    }
    normalize(&mut weights);
    weights
}

/// PageRank power iteration. With `record_teleportation` the link flow is the
/// real walker flow `beta * p_s * w / w_out(s)`; otherwise teleportation steps
/// are left out and link flow is renormalized to sum to one.
fn directed_flow(
    n: usize,
    connections: &mut [Connection],
    teleport_weights: &[f64],
    config: &Config,
    record_teleportation: bool,
) -> Vec<f64> {
    let mut sum_link_out_weight = vec![0.0f64; n];
    for c in connections.iter() {
        if c.is_self_link() && !config.include_self_links {
            continue;
        }
        sum_link_out_weight[c.source] += c.weight;
    }

    // Transition probabilities, stored in `flow` until the final pass.
    for c in connections.iter_mut() {
        c.flow = if (c.is_self_link() && !config.include_self_links)
            || sum_link_out_weight[c.source] <= 0.0
        {
            0.0
        } else {
            c.weight / sum_link_out_weight[c.source]
        };
    }

    let mut node_flow = teleport_weights.to_vec();
    let mut node_flow_tmp = vec![0.0f64; n];

    let teleportation_probability = config.teleportation_probability;
    let mut alpha = teleportation_probability;
    let mut beta = 1.0 - alpha;
    let mut iterations = 0usize;
    let mut err = 0.0f64;
    let dangling_rank_last = loop {
        let old_err = err;

        let dangling_rank: f64 = (0..n)
            .filter(|&i| sum_link_out_weight[i] <= 0.0)
            .map(|i| node_flow[i])
            .sum();

        let tele_flow = alpha + beta * dangling_rank;
        for i in 0..n {
            node_flow_tmp[i] = tele_flow * teleport_weights[i];
        }
        for c in connections.iter() {
            node_flow_tmp[c.target] += beta * c.flow * node_flow[c.source];
        }

        let mut node_flow_diff = -1.0f64;
        err = 0.0;
        for i in 0..n {
            node_flow_diff += node_flow_tmp[i];
            err += (node_flow_tmp[i] - node_flow[i]).abs();
        }

        node_flow.copy_from_slice(&node_flow_tmp);

        if node_flow_diff.abs() > 1.0e-10 {
            let denom = node_flow_diff + 1.0;
            if denom != 0.0 {
                for x in node_flow.iter_mut() {
                    *x /= denom;
                }
            }
        }

        // Nudge out of an oscillating equilibrium.
        if (err - old_err).abs() < 1.0e-17 {
            alpha += 1.0e-12;
            beta = 1.0 - alpha;
        }

        iterations += 1;
        if iterations >= MAX_ITERATIONS || (err <= CONVERGENCE_ERROR && iterations >= MIN_ITERATIONS) {
            break dangling_rank;
        }
    };
    debug!(
        "Power iteration finished after {} iterations (error {:e})",
        iterations, err
    );

    if record_teleportation {
        let beta = 1.0 - teleportation_probability;
        for c in connections.iter_mut() {
            c.flow *= beta * node_flow[c.source];
        }
        return node_flow;
    }

    let mut sum_node_rank = 1.0 - dangling_rank_last;
    if sum_node_rank <= 0.0 {
        sum_node_rank = 1.0;
    }
    let mut link_flow_node = vec![0.0f64; n];
    for c in connections.iter_mut() {
        c.flow *= node_flow[c.source] / sum_node_rank;
        link_flow_node[c.target] += c.flow;
    }
    link_flow_node
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Network;

    fn config(undirected: bool, record_teleportation: bool) -> Config {
        Config {
            undirected,
            record_teleportation,
            ..Config::default()
        }
    }

    #[test]
    fn undirected_flow_is_degree_weighted() {
        // Path 0 - 1 - 2 with weights 1 and 3.
        let network = Network::from_edges(3, [(0, 1, 1.0), (2, 1, 3.0)]).unwrap();
        let flow = FlowNetwork::calculate(&network, &config(true, false)).unwrap();
        let expected = [1.0 / 8.0, 4.0 / 8.0, 3.0 / 8.0];
        for (got, want) in flow.node_flow.iter().zip(expected) {
            assert!((got - want).abs() < 1e-15);
        }
        // Reversed duplicate is normalized to (1, 2).
        assert_eq!(flow.connections[1].source, 1);
        assert_eq!(flow.connections[1].target, 2);
        assert!((flow.connections[1].flow - 3.0 / 8.0).abs() < 1e-15);
    }

    #[test]
    fn undirected_symmetric_pairs_merge() {
        let network = Network::from_edges(2, [(0, 1, 1.0), (1, 0, 1.0)]).unwrap();
        let flow = FlowNetwork::calculate(&network, &config(true, false)).unwrap();
        assert_eq!(flow.connections.len(), 1);
        assert_eq!(flow.connections[0].weight, 2.0);
        assert!((flow.node_flow[0] - 0.5).abs() < 1e-15);
    }

    #[test]
    fn self_links_only_count_when_included() {
        let network = Network::from_edges(2, [(0, 1, 1.0), (0, 0, 2.0)]).unwrap();
        let flow = FlowNetwork::calculate(&network, &config(true, false)).unwrap();
        assert!((flow.node_flow[0] - 0.5).abs() < 1e-15);

        let cfg = Config {
            include_self_links: true,
            ..config(true, false)
        };
        let flow = FlowNetwork::calculate(&network, &cfg).unwrap();
        // S = 2 * 3 - 2 = 4
        assert!((flow.node_flow[0] - 0.75).abs() < 1e-15);
        assert!((flow.node_flow[1] - 0.25).abs() < 1e-15);
    }

    #[test]
    fn directed_flow_sums_to_one() {
        let network =
            Network::from_edges(4, [(0, 1, 1.0), (1, 2, 1.0), (2, 0, 1.0), (2, 3, 1.0)]).unwrap();
        for record in [false, true] {
            let flow = FlowNetwork::calculate(&network, &config(false, record)).unwrap();
            let total: f64 = flow.node_flow.iter().sum();
            assert!((total - 1.0).abs() < 1e-9, "total {}", total);
            assert!(flow.node_flow.iter().all(|&f| f >= 0.0));
        }
    }

    #[test]
    fn recorded_link_flow_is_beta_times_source_flow() {
        let network = Network::from_edges(3, [(0, 1, 1.0), (1, 2, 1.0), (2, 0, 1.0)]).unwrap();
        let flow = FlowNetwork::calculate(&network, &config(false, true)).unwrap();
        for c in &flow.connections {
            let expected = 0.85 * flow.node_flow[c.source];
            assert!((c.flow - expected).abs() < 1e-12);
        }
        // A directed cycle is uniform.
        for f in &flow.node_flow {
            assert!((f - 1.0 / 3.0).abs() < 1e-9);
        }
    }

    #[test]
    fn zero_weight_edges_are_dropped_and_edgeless_is_uniform() {
        let network = Network::from_edges(3, [(0, 1, 0.0)]).unwrap();
        let flow = FlowNetwork::calculate(&network, &config(true, false)).unwrap();
        assert!(flow.connections.is_empty());
        for f in &flow.node_flow {
            assert!((f - 1.0 / 3.0).abs() < 1e-15);
        }
    }

    #[test]
    fn empty_network_is_an_error() {
        let network = Network::with_nodes(0);
        assert!(matches!(
            FlowNetwork::calculate(&network, &Config::default()),
            Err(Error::EmptyNetwork)
        ));
    }
}
