use crate::config::Config;
use crate::error::Result;
use crate::flow::FlowNetwork;
use crate::graph::NetworkSource;
use crate::model::FlowModel;
use crate::objective::{plogp, FlowData, OptimizerState, PLOGP_EPSILON};
use crate::optimizer::ModuleOptimizer;
use crate::partition_queue::PartitionQueue;
use crate::rng::{mix_seed, Lcg};
use crate::subnetwork::{run_sub_jobs, SubJob, SubNetwork, SubTask};
use crate::tree::{NodeId, Tree};
use log::{debug, info, warn};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Offset added to `sub_level` for instances searching super-modules.
const TOP_LEVEL_ADDITION: u32 = 1 << 20;

/// Codelength of every trial of one [`Infomap::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunStatistics {
    pub one_level_codelength: f64,
    pub trial_codelengths: Vec<f64>,
    pub best_trial: usize,
}

impl RunStatistics {
    pub fn best_codelength(&self) -> f64 {
        self.trial_codelengths
            .get(self.best_trial)
            .copied()
            .unwrap_or(self.one_level_codelength)
    }

    pub fn min_codelength(&self) -> f64 {
        self.trial_codelengths
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min)
    }

    pub fn max_codelength(&self) -> f64 {
        self.trial_codelengths
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn average_codelength(&self) -> f64 {
        if self.trial_codelengths.is_empty() {
            return 0.0;
        }
        self.trial_codelengths.iter().sum::<f64>() / self.trial_codelengths.len() as f64
    }

    /// Fraction of the one-level codelength saved by the best trial.
    pub fn compression(&self) -> f64 {
        if self.one_level_codelength <= 0.0 {
            return 0.0;
        }
        (self.one_level_codelength - self.best_codelength()) / self.one_level_codelength
    }
}

/// Codelength per hierarchy depth; `index[0]` is the top index codebook.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerLevelCodelength {
    pub index: Vec<f64>,
    pub leaf: Vec<f64>,
}

impl PerLevelCodelength {
    pub fn num_levels(&self) -> usize {
        self.leaf.len()
    }

    pub fn total(&self) -> Vec<f64> {
        self.index
            .iter()
            .zip(&self.leaf)
            .map(|(index, leaf)| index + leaf)
            .collect()
    }
}

/// Solution kept aside while later trials overwrite the tree.
#[derive(Debug, Clone)]
struct Snapshot {
    tree: Tree,
    state: OptimizerState,
    hierarchical_codelength: f64,
    num_non_trivial_top_modules: usize,
}

/// Hierarchical map-equation search over one network, or over the interior
/// of one module when spawned by a parent instance.
#[derive(Debug, Clone)]
pub struct Infomap {
    config: Arc<Config>,
    model: FlowModel,
    tree: Tree,
    optimizer: ModuleOptimizer,
    state: OptimizerState,
    rng: Lcg,
    sub_level: u32,
    one_level_codelength: f64,
    hierarchical_codelength: f64,
    num_non_trivial_top_modules: usize,
    iteration_count: u32,
    is_coarse_tune: bool,
    leaf_names: Vec<String>,
}

impl Infomap {
    /// Computes the flow of `network` and builds a flat tree of its nodes.
    pub fn new<N: NetworkSource + ?Sized>(config: Config, network: &N) -> Result<Self> {
        config.validate()?;
        let flow = FlowNetwork::calculate(network, &config)?;
        let model = FlowModel::from_config(&config);

        let n = flow.node_count();
        let mut tree = Tree::new(0);
        let mut leaf_names = Vec::with_capacity(n);
        for i in 0..n {
            tree.add_leaf(
                i as u32,
                FlowData {
                    flow: flow.node_flow[i],
                    teleport_weight: flow.node_teleport_weights[i],
                    ..FlowData::default()
                },
            );
            leaf_names.push(network.node_name(i).into_owned());
        }
        let leaves = tree.leaves().to_vec();
        for c in &flow.connections {
            tree.add_edge(leaves[c.source], leaves[c.target], c.weight, c.flow);
        }
        model.init_enter_exit_flow(&mut tree);

        let root = tree.root();
        tree.data_mut(root).flow = flow.node_flow.iter().sum();

        info!(
            "Built {:?} flow network with {} nodes and {} links",
            model,
            n,
            tree.num_leaf_edges()
        );

        let rng = Lcg::new(config.seed);
        let mut infomap = Self {
            config: Arc::new(config),
            model,
            tree,
            optimizer: ModuleOptimizer::default(),
            state: OptimizerState::default(),
            rng,
            sub_level: 0,
            one_level_codelength: 0.0,
            hierarchical_codelength: 0.0,
            num_non_trivial_top_modules: 0,
            iteration_count: 0,
            is_coarse_tune: false,
            leaf_names,
        };
        infomap.init_one_level_codelength();
        Ok(infomap)
    }

    /// Instance over a detached sub-network. Uids and the random stream both
    /// derive from `seed`, so siblings never share either.
    pub(crate) fn from_sub_network(
        config: Arc<Config>,
        model: FlowModel,
        network: SubNetwork,
        seed: u64,
        sub_level: u32,
    ) -> Self {
        let mut tree = Tree::new(mix_seed(seed) >> 2);
        for node in &network.nodes {
            tree.add_leaf(node.original_index, node.data);
        }
        let leaves = tree.leaves().to_vec();
        for edge in &network.edges {
            tree.add_edge(
                leaves[edge.source as usize],
                leaves[edge.target as usize],
                edge.weight,
                edge.flow,
            );
        }
        let root = tree.root();
        *tree.data_mut(root) = network.root_data;

        let mut state = OptimizerState::default();
        state.set_exit_network_flow(network.exit_network_flow);

        let mut infomap = Self {
            config,
            model,
            tree,
            optimizer: ModuleOptimizer::default(),
            state,
            rng: Lcg::new(seed),
            sub_level,
            one_level_codelength: 0.0,
            hierarchical_codelength: 0.0,
            num_non_trivial_top_modules: 0,
            iteration_count: 0,
            is_coarse_tune: false,
            leaf_names: Vec::new(),
        };
        infomap.init_one_level_codelength();
        infomap
    }

    fn init_one_level_codelength(&mut self) {
        let root = self.tree.root();
        let codelength = self.calc_codelength_from_flow_within_or_exit(root);
        self.tree.node_mut(root).codelength = codelength;
        self.one_level_codelength = codelength;
        self.hierarchical_codelength = codelength;
        self.state.index_codelength = codelength;
        self.state.codelength = codelength;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn model(&self) -> FlowModel {
        self.model
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Name of the input node at `position`; empty for nested instances.
    pub fn leaf_name(&self, position: usize) -> &str {
        self.leaf_names.get(position).map_or("", String::as_str)
    }

    pub fn one_level_codelength(&self) -> f64 {
        self.one_level_codelength
    }

    /// Two-level codelength of the top partition.
    pub fn codelength(&self) -> f64 {
        self.state.codelength
    }

    pub fn index_codelength(&self) -> f64 {
        self.state.index_codelength
    }

    pub fn module_codelength(&self) -> f64 {
        self.state.module_codelength
    }

    /// Codelength of the full hierarchy, including nested sub-structure.
    pub fn hierarchical_codelength(&self) -> f64 {
        self.hierarchical_codelength
    }

    pub fn num_top_modules(&self) -> usize {
        self.tree.num_top_modules()
    }

    pub fn num_non_trivial_top_modules(&self) -> usize {
        self.num_non_trivial_top_modules
    }

    pub fn num_leaf_nodes(&self) -> usize {
        self.tree.num_leaf_nodes()
    }

    /// Top-level module of every input node, numbered `0..num_top_modules()`
    /// in the order the modules hang under the root.
    pub fn cluster_vector(&self) -> Vec<u32> {
        let root = self.tree.root();
        let position: FxHashMap<NodeId, u32> = self
            .tree
            .children(root)
            .iter()
            .enumerate()
            .map(|(i, &module)| (module, i as u32))
            .collect();
        self.tree
            .leaves()
            .iter()
            .map(|&leaf| {
                position
                    .get(&self.tree.top_module_of(leaf))
                    .copied()
                    .unwrap_or(0)
            })
            .collect()
    }

    /// Runs all trials and keeps the one with the shortest hierarchical codelength.
    pub fn run(&mut self) -> RunStatistics {
        let threads = self.config.worker_threads();
        if threads > 1 {
            match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
                Ok(pool) => return pool.install(|| self.run_trials()),
                Err(err) => warn!("Can't start {} worker threads, running sequentially: {}", threads, err),
            }
        }
        self.run_trials()
    }

    fn run_trials(&mut self) -> RunStatistics {
        let root = self.tree.root();
        let one_level = self.calc_codelength_from_flow_within_or_exit(root);
        self.tree.node_mut(root).codelength = one_level;
        self.state.index_codelength = one_level;
        self.one_level_codelength = one_level;
        info!("One-level codelength: {:.6}", one_level);

        let num_trials = self.config.num_trials as usize;
        let mut codelengths = Vec::with_capacity(num_trials);
        let mut best_codelength = f64::INFINITY;
        let mut best_trial = 0;
        let mut best: Option<Snapshot> = None;

        for trial in 0..num_trials {
            info!("Attempt {}/{}", trial + 1, num_trials);
            self.iteration_count = 0;
            while !self.tree.is_leaf_level_flat() {
                self.tree.replace_children_with_grandchildren(root);
            }

            self.run_partition();
            codelengths.push(self.hierarchical_codelength);
            info!(
                "Trial {} found {} top modules with codelength {:.9}",
                trial + 1,
                self.tree.num_top_modules(),
                self.hierarchical_codelength
            );

            if self.hierarchical_codelength < best_codelength {
                best_codelength = self.hierarchical_codelength;
                best_trial = trial;
                // The last trial stays in place; only earlier ones need a copy.
                best = if trial + 1 < num_trials {
                    Some(self.snapshot())
                } else {
                    None
                };
                if self.config.verbosity > 0 {
                    self.log_per_level_codelength();
                }
            }
        }

        if let Some(snapshot) = best {
            self.restore(snapshot);
        }

        let statistics = RunStatistics {
            one_level_codelength: one_level,
            trial_codelengths: codelengths,
            best_trial,
        };
        if num_trials > 1 {
            info!(
                "[min, average, max] codelength: [{:.9}, {:.9}, {:.9}]",
                statistics.min_codelength(),
                statistics.average_codelength(),
                statistics.max_codelength()
            );
        }
        info!(
            "Best solution: {} top modules, codelength {:.9} ({:.2}% compression)",
            self.tree.num_top_modules(),
            self.hierarchical_codelength,
            statistics.compression() * 100.0
        );
        statistics
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            tree: self.tree.clone(),
            state: self.state.clone(),
            hierarchical_codelength: self.hierarchical_codelength,
            num_non_trivial_top_modules: self.num_non_trivial_top_modules,
        }
    }

    fn restore(&mut self, snapshot: Snapshot) {
        self.tree = snapshot.tree;
        self.state = snapshot.state;
        self.hierarchical_codelength = snapshot.hierarchical_codelength;
        self.num_non_trivial_top_modules = snapshot.num_non_trivial_top_modules;
        self.optimizer = ModuleOptimizer::default();
    }

    fn run_partition(&mut self) {
        self.hierarchical_codelength = self.one_level_codelength;
        self.state.index_codelength = self.one_level_codelength;
        self.state.module_codelength = 0.0;

        if self.config.two_level {
            self.partition(0, false);
            self.hierarchical_codelength = self.state.codelength;
            self.store_top_module_codelengths();
            return;
        }

        let mut queue = PartitionQueue::default();
        let fast_level = self.config.fast_hierarchical_solution;
        if fast_level != 0 {
            let levels = self.find_super_modules_iteratively_fast(&mut queue);
            if fast_level < 3 {
                info!(
                    "Fast hierarchical solution: {} levels with codelength {:.9}",
                    levels, self.hierarchical_codelength
                );
            }
            if fast_level == 1 {
                self.delete_sub_levels();
                self.queue_top_modules(&mut queue);
            } else {
                self.reset_module_flow_from_leaf_nodes();
                queue.level = levels;
            }
        } else {
            self.partition_and_queue_next_level(&mut queue, true);
        }

        if fast_level > 2 || queue.is_empty() {
            return;
        }

        info!(
            "Current codelength: {:.6} + {:.6} = {:.6}",
            self.state.index_codelength,
            self.hierarchical_codelength - self.state.index_codelength,
            self.hierarchical_codelength
        );

        let mut sum_consolidated_codelength = self.hierarchical_codelength - queue.module_codelength;
        while !queue.is_empty() {
            info!(
                "Level {}: {:.4}% of the flow in {} modules. Partitioning...",
                queue.level,
                queue.flow * 100.0,
                queue.len()
            );
            let mut next_level = PartitionQueue::default();
            self.process_partition_queue(&mut queue, &mut next_level, true);

            let left_to_improve = queue.module_codelength;
            sum_consolidated_codelength += queue.index_codelength + queue.leaf_codelength;
            let limit_codelength = sum_consolidated_codelength + left_to_improve;
            debug!(
                "Level {} done: {:.6} + {:.6} (+ {:.6} left to improve) -> limit {:.10} bits",
                queue.level,
                queue.index_codelength,
                queue.leaf_codelength,
                left_to_improve,
                limit_codelength
            );
            self.hierarchical_codelength = limit_codelength;
            queue.swap(&mut next_level);
        }
        info!(
            "Recursive sub-structure compression to codelength {:.6}",
            self.hierarchical_codelength
        );
    }

    fn store_top_module_codelengths(&mut self) {
        let root = self.tree.root();
        for module in self.tree.children(root).to_vec() {
            let codelength = self.calc_codelength_from_flow_within_or_exit(module);
            self.tree.node_mut(module).codelength = codelength;
        }
    }

    /// Two-level partition, optionally indexed, with the resulting top
    /// modules queued for a deeper search. Returns the hierarchical codelength.
    pub(crate) fn partition_and_queue_next_level(
        &mut self,
        queue: &mut PartitionQueue,
        try_indexing: bool,
    ) -> f64 {
        let root = self.tree.root();
        self.state.codelength = self.tree.node(root).codelength;
        self.hierarchical_codelength = self.state.codelength;

        if self.tree.num_leaf_nodes() == 1 {
            return self.hierarchical_codelength;
        }

        self.partition(0, false);
        self.hierarchical_codelength = self.state.codelength;

        if self.tree.num_top_modules() == 1 {
            if let Some(&module) = self.tree.children(root).first() {
                self.tree.node_mut(module).codelength = self.state.codelength;
            }
            return self.hierarchical_codelength;
        } else if try_indexing {
            self.try_indexing_iteratively();
        }

        self.queue_top_modules(queue);
        self.hierarchical_codelength
    }

    fn queue_top_modules(&self, queue: &mut PartitionQueue) {
        let root = self.tree.root();
        queue.num_non_trivial_modules = self.num_non_trivial_top_modules;
        queue.flow = self.tree.data(root).flow;
        queue.modules.clear();
        let mut non_trivial_flow = 0.0;
        for &module in self.tree.children(root) {
            queue.modules.push(vec![module]);
            if self.tree.child_degree(module) > 1 {
                non_trivial_flow += self.tree.data(module).flow;
            }
        }
        queue.non_trivial_flow = non_trivial_flow;
        queue.index_codelength = self.state.index_codelength;
        queue.module_codelength = self.state.module_codelength;
    }

    /// Adds index codebooks above the top modules as long as a partition of
    /// the module network shortens the index code.
    fn try_indexing_iteratively(&mut self) {
        let verbose = self.sub_level == 0;
        let replace_existing = self.config.fast_hierarchical_solution == 0;
        let mut min_hierarchical_codelength = self.hierarchical_codelength;
        let mut num_indexing = 0;

        loop {
            let root = self.tree.root();
            let mut network = SubNetwork::from_children(&self.tree, root);
            network.transform_node_flow_to_enter_flow();
            let job = SubJob {
                network,
                seed: self.tree.next_uid(),
                sub_level: self.sub_level + TOP_LEVEL_ADDITION,
                task: SubTask::Partition {
                    recursive_count: 0,
                    fast: false,
                },
            };
            let Some(outcome) = run_sub_jobs(&self.config, self.model, vec![job]).pop() else {
                break;
            };
            let super_infomap = outcome.infomap;

            if super_infomap.num_non_trivial_top_modules == 1
                || super_infomap.num_top_modules() == self.tree.num_top_modules()
            {
                if verbose {
                    debug!("Failed to find non-trivial super modules");
                }
                break;
            }
            if super_infomap.codelength()
                > self.state.index_codelength - self.config.minimum_codelength_improvement
            {
                if verbose {
                    debug!("Two-level index codebook not improved over one-level");
                }
                break;
            }

            min_hierarchical_codelength += super_infomap.codelength() - self.state.index_codelength;
            if verbose {
                info!(
                    "Found {} super modules with estimated hierarchical codelength {:.6}",
                    super_infomap.num_top_modules(),
                    min_hierarchical_codelength
                );
            }

            // Super module of each current module, by position under the root.
            let super_tree = &super_infomap.tree;
            let super_indices: Vec<u32> = super_tree
                .leaves()
                .iter()
                .map(|&leaf| {
                    super_tree
                        .parent(leaf)
                        .map_or(0, |parent| super_tree.node(parent).index)
                })
                .collect();

            self.optimizer.set_active_network_from_leaves(&self.tree);
            self.optimizer
                .init_module_optimization(&mut self.tree, &self.model, &mut self.state);
            let modules = self.tree.children(root).to_vec();
            for (module, &super_index) in modules.into_iter().zip(&super_indices) {
                for &leaf in self.tree.children(module) {
                    let position = self.tree.node(leaf).index as usize;
                    self.optimizer.move_to[position] = super_index;
                }
            }
            self.optimizer
                .move_nodes_to_predefined_modules(&mut self.tree, &self.model, &mut self.state);
            self.consolidate(replace_existing, false);
            num_indexing += 1;

            if !(self.num_non_trivial_top_modules > 1
                && self.tree.num_top_modules() != self.tree.num_leaf_nodes())
            {
                break;
            }
        }

        if verbose && num_indexing > 0 {
            debug!(
                "Indexing completed {} times, estimated codelength {:.6}",
                num_indexing, min_hierarchical_codelength
            );
        }
        self.hierarchical_codelength = if replace_existing {
            self.state.codelength
        } else {
            min_hierarchical_codelength
        };
    }

    /// Builds index levels in place by optimizing the module network of the
    /// previous level, without nested instances. Returns the levels created.
    fn find_super_modules_iteratively_fast(&mut self, queue: &mut PartitionQueue) -> u32 {
        let verbose = self.sub_level == 0;
        let root = self.tree.root();
        let mut levels_created = 0u32;
        let mut is_leaf_level = self.tree.is_leaf_level_flat();

        loop {
            let old_index_codelength = self.state.index_codelength;
            let mut working_codelength = self.hierarchical_codelength;

            if is_leaf_level {
                self.optimizer.set_active_network_from_leaves(&self.tree);
            } else {
                self.optimizer.set_active_network_from_children(&self.tree, root);
                self.transform_node_flow_to_enter_flow(root);
            }
            self.optimizer.init_constant_terms(&self.tree, &mut self.state);
            self.optimizer
                .init_module_optimization(&mut self.tree, &self.model, &mut self.state);
            let rounds = self.optimizer.optimize_modules(
                &mut self.tree,
                &self.model,
                &mut self.state,
                &mut self.rng,
                &self.config,
            );

            // At least one modular level is always kept.
            let accept = self.state.codelength
                < old_index_codelength - self.config.minimum_codelength_improvement
                || levels_created == 0;
            working_codelength += self.state.codelength - old_index_codelength;

            if verbose {
                debug!(
                    "Level {}: {} modules in {} loops, hierarchical codelength {:.6}{}",
                    levels_created + 1,
                    self.optimizer.num_dynamic_modules(),
                    rounds,
                    working_codelength,
                    if accept { "" } else { ", discarded" }
                );
            }

            if !accept {
                self.state.index_codelength = old_index_codelength;
                break;
            }

            self.consolidate(false, false);
            self.hierarchical_codelength = working_codelength;
            self.store_top_module_codelengths();

            if is_leaf_level && self.config.fast_hierarchical_solution > 1 {
                self.queue_top_modules(queue);
            }
            is_leaf_level = false;
            levels_created += 1;

            if self.num_non_trivial_top_modules == 1 {
                break;
            }
        }

        if verbose {
            info!(
                "Added {} levels with {} top modules to codelength {:.6}",
                levels_created,
                self.tree.num_top_modules(),
                self.hierarchical_codelength
            );
        }
        levels_created
    }

    /// Removes every module level below the top modules. Returns how many went.
    fn delete_sub_levels(&mut self) -> u32 {
        let Some(&first) = self.tree.leaves().first() else {
            return 0;
        };
        let mut depth = 0u32;
        let mut node = first;
        while let Some(parent) = self.tree.parent(node) {
            node = parent;
            depth += 1;
        }
        if depth <= 2 {
            return 0;
        }

        let root = self.tree.root();
        for module in self.tree.children(root).to_vec() {
            for _ in 2..depth {
                self.tree.replace_children_with_grandchildren(module);
            }
        }

        self.optimizer.set_active_network_from_leaves(&self.tree);
        self.optimizer.init_constant_terms(&self.tree, &mut self.state);
        self.reset_module_flow_from_leaf_nodes();

        let mut sum_module_codelength = 0.0;
        for module in self.tree.children(root).to_vec() {
            let codelength = self.calc_codelength_from_flow_within_or_exit(module);
            self.tree.node_mut(module).codelength = codelength;
            sum_module_codelength += codelength;
        }
        self.state.module_codelength = sum_module_codelength;
        self.state.codelength = self.state.index_codelength + sum_module_codelength;
        self.hierarchical_codelength = self.state.codelength;

        if self.sub_level == 0 {
            info!(
                "Cleared {} levels of sub-modules: two-level codelength {:.6} + {:.6} = {:.6} in {} modules",
                depth - 2,
                self.state.index_codelength,
                self.state.module_codelength,
                self.state.codelength,
                self.tree.num_top_modules()
            );
        }
        depth - 2
    }

    /// Recomputes the flow of every module as the sum of its leaves.
    fn reset_module_flow_from_leaf_nodes(&mut self) {
        let root = self.tree.root();
        self.tree.data_mut(root).flow = 0.0;
        for node in self.tree.descendants(root) {
            if !self.tree.is_leaf(node) {
                self.tree.data_mut(node).flow = 0.0;
            }
        }
        for leaf in self.tree.leaves().to_vec() {
            let flow = self.tree.data(leaf).flow;
            let mut current = leaf;
            while let Some(parent) = self.tree.parent(current) {
                self.tree.data_mut(parent).flow += flow;
                current = parent;
            }
        }
    }

    fn transform_node_flow_to_enter_flow(&mut self, parent: NodeId) {
        for child in self.tree.children(parent).to_vec() {
            let data = self.tree.data_mut(child);
            data.flow = data.enter_flow;
        }
    }

    /// Walks sub-structure boxes down to the instance owning the last module of `path`.
    fn resolve_mut(&mut self, path: &[NodeId]) -> Option<(&mut Infomap, NodeId)> {
        match path {
            [] => None,
            [module] => Some((self, *module)),
            [owner, rest @ ..] => self
                .tree
                .node_mut(*owner)
                .sub_structure
                .infomap
                .as_deref_mut()?
                .resolve_mut(rest),
        }
    }

    /// Searches every queued module for sub-structure and collects the
    /// modules of accepted sub-structures into `next_level`.
    fn process_partition_queue(
        &mut self,
        queue: &mut PartitionQueue,
        next_level: &mut PartitionQueue,
        try_indexing: bool,
    ) {
        let num_modules = queue.len();
        let mut index_codelengths = vec![0.0f64; num_modules];
        let mut module_codelengths = vec![0.0f64; num_modules];
        let mut leaf_codelengths = vec![0.0f64; num_modules];
        let mut sub_queues: Vec<Option<PartitionQueue>> = vec![None; num_modules];

        let mut jobs = Vec::new();
        let mut job_modules = Vec::new();
        for (i, path) in queue.modules.iter().enumerate() {
            let seed = self.tree.next_uid();
            let Some((owner, module)) = self.resolve_mut(path) else {
                debug_assert!(false, "queued module path does not resolve");
                continue;
            };
            owner.tree.node_mut(module).sub_structure.infomap = None;
            let codelength = owner.calc_codelength_from_flow_within_or_exit(module);
            owner.tree.node_mut(module).codelength = codelength;

            // Two children can't split any better than apart.
            if owner.tree.child_degree(module) <= 2 {
                leaf_codelengths[i] = codelength;
                continue;
            }
            jobs.push(SubJob {
                network: SubNetwork::from_children(&owner.tree, module),
                seed,
                sub_level: owner.sub_level + 1,
                task: SubTask::Queue {
                    level: queue.level + 1,
                    try_indexing,
                },
            });
            job_modules.push(i);
        }

        let outcomes = run_sub_jobs(&self.config, self.model, jobs);
        let min_improvement = self.config.minimum_codelength_improvement;
        for (i, outcome) in job_modules.into_iter().zip(outcomes) {
            let path = &queue.modules[i];
            let Some((owner, module)) = self.resolve_mut(path) else {
                continue;
            };
            let module_codelength = owner.tree.node(module).codelength;
            let sub = outcome.infomap;
            let top = sub.num_top_modules();
            let non_trivial = top > 1 && top < sub.num_leaf_nodes();
            let improvement =
                non_trivial && sub.hierarchical_codelength < module_codelength - min_improvement;

            if improvement {
                index_codelengths[i] = sub.state.index_codelength;
                module_codelengths[i] = sub.state.module_codelength;
                owner.tree.node_mut(module).sub_structure.infomap = Some(Box::new(sub));
                sub_queues[i] = Some(outcome.queue.prefixed(path));
            } else {
                leaf_codelengths[i] = module_codelength;
                owner
                    .tree
                    .node_mut(module)
                    .sub_structure
                    .explored_without_improvement = true;
            }
        }

        queue.index_codelength = index_codelengths.iter().sum();
        queue.leaf_codelength = leaf_codelengths.iter().sum();
        queue.module_codelength = module_codelengths.iter().sum();

        *next_level = PartitionQueue::with_level(queue.level + 1);
        for sub_queue in sub_queues.into_iter().flatten() {
            if sub_queue.skip {
                continue;
            }
            next_level.flow += sub_queue.flow;
            next_level.non_trivial_flow += sub_queue.non_trivial_flow;
            next_level.num_non_trivial_modules += sub_queue.num_non_trivial_modules;
            next_level.modules.extend(sub_queue.modules);
        }
    }

    /// Two-level search: core loop and repeated aggregation, then alternating
    /// fine and coarse tuning. With `recursive_count > 0` every module is
    /// partitioned again and its sub-modules replace it.
    pub(crate) fn partition(&mut self, recursive_count: u32, fast: bool) {
        if !self.tree.is_leaf_level_flat() {
            debug!(
                "Already partitioned with codelength {:.6} in {} modules",
                self.state.codelength,
                self.tree.num_top_modules()
            );
            return;
        }
        let verbose = self.sub_level == 0;
        let root = self.tree.root();

        self.optimizer.set_active_network_from_children(&self.tree, root);
        self.optimizer.init_constant_terms(&self.tree, &mut self.state);
        self.optimizer
            .init_module_optimization(&mut self.tree, &self.model, &mut self.state);

        if verbose {
            debug!(
                "Initiated to codelength {:.6} + {:.6} = {:.6} in {} modules",
                self.state.index_codelength,
                self.state.module_codelength,
                self.state.codelength,
                self.tree.num_top_modules()
            );
        }

        let initial_codelength = self.state.codelength;
        self.merge_and_consolidate_repeatedly();

        let config = Arc::clone(&self.config);
        if !fast
            && config.tune_iteration_limit != 1
            && self.tree.num_top_modules() != self.tree.num_leaf_nodes()
        {
            let mut tune_iteration_count = 1u32;
            let mut coarse_tune_level = config.coarse_tune_level - 1;
            let mut do_fine_tune = true;
            let mut old_codelength = self.state.codelength;
            while self.tree.num_top_modules() > 1 {
                if do_fine_tune {
                    self.fine_tune();
                } else {
                    let level = if config.alternate_coarse_tune_level {
                        coarse_tune_level += 1;
                        coarse_tune_level % config.coarse_tune_level
                    } else {
                        config.coarse_tune_level - 1
                    };
                    self.coarse_tune(level);
                }
                let codelength = self.state.codelength;
                if codelength
                    > old_codelength
                        - initial_codelength * config.minimum_relative_tune_iteration_improvement
                    || codelength > old_codelength - config.minimum_codelength_improvement
                {
                    break;
                }
                old_codelength = codelength;

                tune_iteration_count += 1;
                if config.tune_iteration_limit == tune_iteration_count {
                    break;
                }
                do_fine_tune = !do_fine_tune;
            }
        }

        if verbose {
            info!(
                "Two-level codelength: {:.6} + {:.6} = {:.6} in {} modules",
                self.state.index_codelength,
                self.state.module_codelength,
                self.state.codelength,
                self.tree.num_top_modules()
            );
        }

        let top = self.tree.num_top_modules();
        if !fast && recursive_count > 0 && top != 1 && top != self.tree.num_leaf_nodes() {
            self.partition_each_module(recursive_count - 1, false);
            self.move_leaves_to_their_index_and_consolidate_sub_modules();
            self.pack_module_indices();
        }
    }

    /// Moves each leaf to the module in its `index` and consolidates the
    /// result under the current top modules, which then give way.
    fn move_leaves_to_their_index_and_consolidate_sub_modules(&mut self) {
        self.optimizer.set_active_network_from_leaves(&self.tree);
        let targets: Vec<u32> = self
            .tree
            .leaves()
            .iter()
            .map(|&leaf| self.tree.node(leaf).index)
            .collect();
        self.optimizer
            .init_module_optimization(&mut self.tree, &self.model, &mut self.state);
        self.optimizer.move_to.copy_from_slice(&targets);
        self.optimizer
            .move_nodes_to_predefined_modules(&mut self.tree, &self.model, &mut self.state);
        self.consolidate(true, true);
    }

    fn merge_and_consolidate_repeatedly(&mut self) {
        self.iteration_count += 1;
        let verbose = self.sub_level == 0;
        let root = self.tree.root();

        let mut rounds = self.optimizer.optimize_modules(
            &mut self.tree,
            &self.model,
            &mut self.state,
            &mut self.rng,
            &self.config,
        );
        if verbose {
            debug!(
                "Iteration {}, moving {} nodes in {} loops",
                self.iteration_count,
                self.optimizer.active.len(),
                rounds
            );
        }

        // Modules are created even when worse; leaves and modules never share a parent.
        self.consolidate(true, false);
        let mut levels_consolidated = 1u32;

        while self.tree.num_top_modules() > 1
            && levels_consolidated != self.config.level_aggregation_limit
        {
            let consolidated_codelength = self.state.codelength;
            let consolidated_index_codelength = self.state.index_codelength;
            let consolidated_module_codelength = self.state.module_codelength;

            self.optimizer.set_active_network_from_children(&self.tree, root);
            self.optimizer
                .init_module_optimization(&mut self.tree, &self.model, &mut self.state);
            rounds = self.optimizer.optimize_modules(
                &mut self.tree,
                &self.model,
                &mut self.state,
                &mut self.rng,
                &self.config,
            );
            if verbose {
                debug!(
                    "Moving {} modules in {} loops",
                    self.optimizer.active.len(),
                    rounds
                );
            }

            if !(self.state.codelength
                < consolidated_codelength - self.config.minimum_codelength_improvement)
            {
                self.state.index_codelength = consolidated_index_codelength;
                self.state.module_codelength = consolidated_module_codelength;
                self.state.codelength = consolidated_codelength;
                break;
            }

            self.consolidate(true, false);
            levels_consolidated += 1;
        }

        if verbose {
            debug!(
                "Merged {} to codelength {:.6} in {} modules ({} non-trivial)",
                if self.is_coarse_tune { "modules" } else { "nodes" },
                self.state.codelength,
                self.tree.num_top_modules(),
                self.num_non_trivial_top_modules
            );
        }
        self.pack_module_indices();
    }

    /// Restarts from the leaves with the current modules as initial assignment.
    fn fine_tune(&mut self) {
        self.is_coarse_tune = false;
        self.optimizer.set_active_network_from_leaves(&self.tree);
        let targets: Vec<u32> = self
            .tree
            .leaves()
            .iter()
            .map(|&leaf| {
                self.tree
                    .parent(leaf)
                    .map_or(0, |module| self.tree.node(module).index)
            })
            .collect();
        self.optimizer
            .init_module_optimization(&mut self.tree, &self.model, &mut self.state);
        self.optimizer.move_to.copy_from_slice(&targets);
        self.optimizer
            .move_nodes_to_predefined_modules(&mut self.tree, &self.model, &mut self.state);
        self.merge_and_consolidate_repeatedly();
    }

    /// Splits every module on its own, then lets the pieces move between
    /// the former modules, starting from where they came from.
    fn coarse_tune(&mut self, recursive_count: u32) {
        if self.tree.num_top_modules() == 1 {
            return;
        }
        self.is_coarse_tune = true;
        let fast = self.config.fast_coarse_tune_partition;
        self.partition_each_module(recursive_count, fast);
        self.move_leaves_to_their_index_and_consolidate_sub_modules();

        let root = self.tree.root();
        self.optimizer.set_active_network_from_children(&self.tree, root);
        let targets: Vec<u32> = self
            .tree
            .children(root)
            .iter()
            .map(|&sub_module| self.tree.node(sub_module).index)
            .collect();
        self.optimizer
            .init_module_optimization(&mut self.tree, &self.model, &mut self.state);
        self.optimizer.move_to.copy_from_slice(&targets);
        self.optimizer
            .move_nodes_to_predefined_modules(&mut self.tree, &self.model, &mut self.state);
        self.merge_and_consolidate_repeatedly();
    }

    /// Partitions the interior of every top module in its own instance and
    /// stores the global sub-module index on each leaf's `index`.
    fn partition_each_module(&mut self, recursive_count: u32, fast: bool) {
        let root = self.tree.root();
        let modules = self.tree.children(root).to_vec();

        let mut jobs = Vec::new();
        for &module in &modules {
            if self.tree.child_degree(module) == 1 {
                continue;
            }
            jobs.push(SubJob {
                network: SubNetwork::from_children(&self.tree, module),
                seed: self.tree.next_uid(),
                sub_level: self.sub_level + 1,
                task: SubTask::Partition {
                    recursive_count,
                    fast,
                },
            });
        }
        let mut outcomes = run_sub_jobs(&self.config, self.model, jobs).into_iter();

        let mut offset = 0u32;
        for module in modules {
            let children = self.tree.children(module).to_vec();
            if children.len() == 1 {
                self.tree.node_mut(children[0]).index = offset;
                offset += 1;
                continue;
            }
            let Some(outcome) = outcomes.next() else {
                break;
            };
            let sub_tree = &outcome.infomap.tree;
            for (child, &sub_leaf) in children.into_iter().zip(sub_tree.leaves()) {
                let sub_module_index = sub_tree
                    .parent(sub_leaf)
                    .map_or(0, |parent| sub_tree.node(parent).index);
                self.tree.node_mut(child).index = sub_module_index + offset;
            }
            offset += sub_tree.num_top_modules() as u32;
        }
    }

    fn consolidate(&mut self, replace_existing: bool, as_sub_modules: bool) -> usize {
        let created = self.optimizer.consolidate_modules(
            &mut self.tree,
            &self.model,
            replace_existing,
            as_sub_modules,
        );
        let root = self.tree.root();
        self.num_non_trivial_top_modules = self
            .tree
            .children(root)
            .iter()
            .filter(|&&module| self.tree.child_degree(module) != 1)
            .count();
        created
    }

    fn pack_module_indices(&mut self) {
        let root = self.tree.root();
        for (i, module) in self.tree.children(root).to_vec().into_iter().enumerate() {
            let node = self.tree.node_mut(module);
            node.index = i as u32;
            node.original_index = i as u32;
        }
    }

    /// Entropy of the flow within `parent` split over its children and its exit,
    /// weighted by that total flow.
    pub fn calc_codelength_from_flow_within_or_exit(&self, parent: NodeId) -> f64 {
        let data = self.tree.data(parent);
        let total_flow = data.flow + data.exit_flow;
        if total_flow < PLOGP_EPSILON {
            return 0.0;
        }
        let mut index_length = 0.0;
        for &child in self.tree.children(parent) {
            index_length -= plogp(self.tree.data(child).flow / total_flow);
        }
        index_length -= plogp(data.exit_flow / total_flow);
        index_length * total_flow
    }

    pub fn per_level_codelength(&self) -> PerLevelCodelength {
        let mut levels = PerLevelCodelength::default();
        self.aggregate_per_level_codelength(self.tree.root(), &mut levels, 0);
        let num_levels = levels.leaf.len();
        levels.index.resize(num_levels, 0.0);
        levels
    }

    fn aggregate_per_level_codelength(
        &self,
        parent: NodeId,
        levels: &mut PerLevelCodelength,
        level: usize,
    ) {
        if levels.index.len() < level + 1 {
            levels.index.resize(level + 1, 0.0);
        }
        if levels.leaf.len() < level + 2 {
            levels.leaf.resize(level + 2, 0.0);
        }
        let root = self.tree.root();
        levels.index[level] += if parent == root {
            self.state.index_codelength
        } else {
            self.tree.node(parent).codelength
        };

        for &module in self.tree.children(parent) {
            let node = self.tree.node(module);
            if let Some(sub) = node.sub_structure.infomap.as_deref() {
                sub.aggregate_per_level_codelength(sub.tree.root(), levels, level + 1);
            } else if !node.is_leaf() {
                let leaf_children = node
                    .children()
                    .first()
                    .map_or(false, |&child| self.tree.is_leaf(child));
                if leaf_children {
                    levels.leaf[level + 1] += node.codelength;
                } else {
                    self.aggregate_per_level_codelength(module, levels, level + 1);
                }
            }
        }
    }

    fn log_per_level_codelength(&self) {
        let levels = self.per_level_codelength();
        let format = |values: &[f64]| {
            values
                .iter()
                .map(|v| format!("{:.9}", v))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let total = levels.total();
        info!(
            "Per level codelength for modules:    [{}] (sum: {:.9})",
            format(&levels.index),
            levels.index.iter().sum::<f64>()
        );
        info!(
            "Per level codelength for leaf nodes: [{}] (sum: {:.9})",
            format(&levels.leaf),
            levels.leaf.iter().sum::<f64>()
        );
        info!(
            "Per level codelength total:          [{}] (sum: {:.9})",
            format(&total),
            total.iter().sum::<f64>()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Network;

    fn two_cliques() -> Network {
        // Two 4-cliques joined by one link.
        let mut edges = Vec::new();
        for offset in [0, 4] {
            for i in 0..4 {
                for j in (i + 1)..4 {
                    edges.push((offset + i, offset + j, 1.0));
                }
            }
        }
        edges.push((3, 4, 1.0));
        Network::from_edges(8, edges).unwrap()
    }

    #[test]
    fn two_nodes_merge_into_one_module() {
        let network = Network::from_edges(2, [(0, 1, 1.0)]).unwrap();
        let mut infomap = Infomap::new(Config::default(), &network).unwrap();
        assert!((infomap.one_level_codelength() - 1.0).abs() < 1e-12);
        let stats = infomap.run();
        // Apart: 1 bit of index code plus 2 bits of module code.
        assert!((infomap.hierarchical_codelength() - 1.0).abs() < 1e-12);
        assert_eq!(stats.trial_codelengths.len(), 1);
        assert_eq!(infomap.cluster_vector(), vec![0, 0]);
        assert_eq!(infomap.num_top_modules(), 1);
    }

    #[test]
    fn single_node_has_zero_codelength() {
        let network = Network::with_nodes(1);
        let mut infomap = Infomap::new(Config::default(), &network).unwrap();
        let stats = infomap.run();
        assert_eq!(infomap.hierarchical_codelength(), 0.0);
        assert_eq!(stats.best_codelength(), 0.0);
        assert_eq!(infomap.cluster_vector(), vec![0]);
        assert_eq!(infomap.num_top_modules(), 1);
    }

    #[test]
    fn cliques_become_modules_with_conserved_flow() {
        let mut infomap = Infomap::new(Config::default(), &two_cliques()).unwrap();
        infomap.run();
        let clusters = infomap.cluster_vector();
        assert_eq!(infomap.num_top_modules(), 2);
        assert!(clusters[..4].iter().all(|&c| c == clusters[0]));
        assert!(clusters[4..].iter().all(|&c| c == clusters[4]));
        assert_ne!(clusters[0], clusters[4]);
        assert!(infomap.hierarchical_codelength() < infomap.one_level_codelength());

        let tree = infomap.tree();
        let root = tree.root();
        let module_flow: f64 = tree.children(root).iter().map(|&m| tree.data(m).flow).sum();
        assert!((module_flow - 1.0).abs() < 1e-12);
        for &module in tree.children(root) {
            let data = tree.data(module);
            assert!((data.enter_flow - data.exit_flow).abs() < 1e-15);
        }
    }

    #[test]
    fn two_level_codelength_matches_module_sum() {
        let config = Config {
            two_level: true,
            ..Config::default()
        };
        let mut infomap = Infomap::new(config, &two_cliques()).unwrap();
        infomap.run();
        let tree = infomap.tree();
        let root = tree.root();
        let module_sum: f64 = tree.children(root).iter().map(|&m| tree.node(m).codelength).sum();
        let total = infomap.index_codelength() + module_sum;
        assert!((total - infomap.hierarchical_codelength()).abs() < 1e-10);
        let levels = infomap.per_level_codelength();
        assert_eq!(levels.num_levels(), 2);
        let sum: f64 = levels.total().iter().sum();
        assert!((sum - infomap.hierarchical_codelength()).abs() < 1e-10);
    }

    #[test]
    fn sub_network_instance_keeps_exit_flow() {
        let mut tree = Tree::new(0);
        for i in 0..3 {
            tree.add_leaf(i, FlowData::with_flow(0.2));
        }
        let root = tree.root();
        *tree.data_mut(root) = FlowData {
            flow: 0.6,
            exit_flow: 0.1,
            enter_flow: 0.1,
            ..FlowData::default()
        };
        let network = SubNetwork::from_children(&tree, root);
        let sub = Infomap::from_sub_network(
            Arc::new(Config::default()),
            FlowModel::Undirected,
            network,
            42,
            1,
        );
        assert_eq!(sub.state.exit_network_flow(), 0.1);
        let expected = -(3.0 * plogp(0.2 / 0.7) + plogp(0.1 / 0.7)) * 0.7;
        assert!((sub.one_level_codelength() - expected).abs() < 1e-12);
        assert!(sub.leaf_name(0).is_empty());
    }
}
