use crate::config::Config;
use crate::model::FlowModel;
use crate::objective::{DeltaFlow, FlowData, OptimizerState};
use crate::rng::Lcg;
use crate::tree::{NodeId, Tree};
use std::collections::BTreeMap;

/// Moves must beat this to be taken, so rounding noise can't cause cycling.
pub(crate) const MIN_SINGLE_NODE_IMPROVEMENT: f64 = 1e-16;

#[derive(Debug, Clone, Default)]
struct MoveWorkspace {
    // Reused across rounds to avoid allocator churn in the hot loop.
    node_order: Vec<u32>,
    redirect: Vec<u32>,
    candidates: Vec<DeltaFlow>,
}

/// Greedy local search over an active network: the leaves, or the current
/// modules treated as atomic nodes. A node's module is kept in its tree `index`.
#[derive(Debug, Clone, Default)]
pub(crate) struct ModuleOptimizer {
    pub active: Vec<NodeId>,
    pub module_flow: Vec<FlowData>,
    pub module_members: Vec<u32>,
    pub empty_modules: Vec<u32>,
    /// Target module per active position for `move_nodes_to_predefined_modules`.
    pub move_to: Vec<u32>,
    workspace: MoveWorkspace,
}

impl ModuleOptimizer {
    pub fn set_active_network(&mut self, nodes: Vec<NodeId>) {
        self.move_to.clear();
        self.move_to.resize(nodes.len(), 0);
        self.active = nodes;
    }

    pub fn set_active_network_from_leaves(&mut self, tree: &Tree) {
        self.set_active_network(tree.leaves().to_vec());
    }

    pub fn set_active_network_from_children(&mut self, tree: &Tree, parent: NodeId) {
        self.set_active_network(tree.children(parent).to_vec());
    }

    pub fn init_constant_terms(&self, tree: &Tree, state: &mut OptimizerState) {
        state.init_constant_terms(self.active.iter().map(|&id| tree.data(id)));
    }

    /// One module per active node, then codelength from scratch.
    pub fn init_module_optimization(
        &mut self,
        tree: &mut Tree,
        model: &FlowModel,
        state: &mut OptimizerState,
    ) {
        let n = self.active.len();
        self.module_flow.clear();
        self.module_flow.reserve(n);
        self.module_members.clear();
        self.module_members.resize(n, 1);
        self.empty_modules.clear();
        self.empty_modules.reserve(n);

        for (i, &id) in self.active.iter().enumerate() {
            let node = tree.node_mut(id);
            node.index = i as u32;
            self.module_flow.push(node.data);
        }
        model.init_partition(state, self.module_flow.iter());
    }

    pub fn num_dynamic_modules(&self) -> usize {
        self.active.len() - self.empty_modules.len()
    }

    /// Runs move rounds until a round gains less than the minimum improvement
    /// or the loop limit is hit. Returns the number of rounds.
    pub fn optimize_modules(
        &mut self,
        tree: &mut Tree,
        model: &FlowModel,
        state: &mut OptimizerState,
        rng: &mut Lcg,
        config: &Config,
    ) -> u32 {
        let mut loop_limit = config.core_loop_limit;
        if loop_limit > 0 && config.randomize_core_loop_limit {
            loop_limit = (rng.next_double() * loop_limit as f64) as u32 + 1;
        }

        let mut rounds = 0u32;
        loop {
            let old_codelength = state.codelength;
            self.try_move_each_node_into_best_module(tree, model, state, rng);
            rounds += 1;
            if rounds == loop_limit
                || state.codelength >= old_codelength - config.minimum_codelength_improvement
            {
                break;
            }
        }
        rounds
    }

    /// One pass over the active network in random order, moving each node to
    /// the neighbouring (or an empty) module that lowers the codelength most.
    pub fn try_move_each_node_into_best_module(
        &mut self,
        tree: &mut Tree,
        model: &FlowModel,
        state: &mut OptimizerState,
        rng: &mut Lcg,
    ) -> u32 {
        let n = self.active.len();
        let MoveWorkspace {
            node_order,
            redirect,
            candidates,
        } = &mut self.workspace;

        node_order.resize(n, 0);
        rng.randomized_index_vector(node_order);
        redirect.clear();
        redirect.resize(n, 0);

        // Entries at or above `offset` belong to the node being visited.
        let mut offset: u32 = 1;
        let max_offset = u32::MAX - 1 - n as u32;
        let mut moved = 0u32;

        for &position in node_order.iter() {
            if offset > max_offset {
                redirect.fill(0);
                offset = 1;
            }
            let node_id = self.active[position as usize];
            let node = tree.node(node_id);
            let current_module = node.index;
            let current = node.data;

            candidates.clear();
            let mut add_candidate = |module: u32, delta_exit: f64, delta_enter: f64| {
                let slot = &mut redirect[module as usize];
                if *slot >= offset {
                    let c = &mut candidates[(*slot - offset) as usize];
                    c.delta_exit += delta_exit;
                    c.delta_enter += delta_enter;
                } else {
                    *slot = offset + candidates.len() as u32;
                    candidates.push(DeltaFlow::new(module, delta_exit, delta_enter));
                }
            };

            let mut linked = false;
            for &e in node.out_edges() {
                let edge = tree.edge(e);
                if edge.is_self_pointing() {
                    continue;
                }
                linked = true;
                add_candidate(tree.node(edge.target).index, edge.flow, 0.0);
            }
            for &e in node.in_edges() {
                let edge = tree.edge(e);
                if edge.is_self_pointing() {
                    continue;
                }
                linked = true;
                add_candidate(tree.node(edge.source).index, 0.0, edge.flow);
            }
            if !linked {
                // Isolated; moving it could never change the codelength.
                continue;
            }
            add_candidate(current_module, 0.0, 0.0);

            model.add_teleportation_deltas(&current, current_module, candidates, &self.module_flow);

            if self.module_members[current_module as usize] > 1 {
                if let Some(&empty) = self.empty_modules.last() {
                    candidates.push(DeltaFlow::new(empty, 0.0, 0.0));
                }
            }

            let old_delta = candidates[(redirect[current_module as usize] - offset) as usize];
            rng.shuffle(candidates);

            let context = model.prepare_move(state, &current, &old_delta, &self.module_flow);
            let mut best_delta = old_delta;
            let mut best_delta_codelength = 0.0f64;
            for candidate in candidates.iter() {
                if candidate.module == current_module {
                    continue;
                }
                let delta =
                    model.compute_delta_with_context(state, &context, candidate, &self.module_flow);
                if delta < best_delta_codelength - MIN_SINGLE_NODE_IMPROVEMENT {
                    best_delta = *candidate;
                    best_delta_codelength = delta;
                }
            }

            if best_delta.module != current_module {
                let best_module = best_delta.module;
                if self.module_members[best_module as usize] == 0 {
                    self.empty_modules.pop();
                }
                if self.module_members[current_module as usize] == 1 {
                    self.empty_modules.push(current_module);
                }
                model.apply_move(state, &current, &old_delta, &best_delta, &mut self.module_flow);
                self.module_members[current_module as usize] -= 1;
                self.module_members[best_module as usize] += 1;
                tree.node_mut(node_id).index = best_module;
                moved += 1;
            }

            offset += n as u32;
        }
        moved
    }

    /// Moves every active node to `move_to[position]`, unconditionally.
    pub fn move_nodes_to_predefined_modules(
        &mut self,
        tree: &mut Tree,
        model: &FlowModel,
        state: &mut OptimizerState,
    ) -> u32 {
        let mut moved = 0u32;
        for position in 0..self.active.len() {
            let node_id = self.active[position];
            let node = tree.node(node_id);
            let old_module = node.index;
            let new_module = self.move_to[position];
            if old_module == new_module {
                continue;
            }
            let current = node.data;

            let mut old_delta = DeltaFlow::new(old_module, 0.0, 0.0);
            let mut new_delta = DeltaFlow::new(new_module, 0.0, 0.0);
            for &e in node.out_edges() {
                let edge = tree.edge(e);
                if edge.is_self_pointing() {
                    continue;
                }
                let other_module = tree.node(edge.target).index;
                if other_module == old_module {
                    old_delta.delta_exit += edge.flow;
                } else if other_module == new_module {
                    new_delta.delta_exit += edge.flow;
                }
            }
            for &e in node.in_edges() {
                let edge = tree.edge(e);
                if edge.is_self_pointing() {
                    continue;
                }
                let other_module = tree.node(edge.source).index;
                if other_module == old_module {
                    old_delta.delta_enter += edge.flow;
                } else if other_module == new_module {
                    new_delta.delta_enter += edge.flow;
                }
            }
            model.add_teleportation_delta_on_old_module(
                &current,
                &self.module_flow[old_module as usize],
                &mut old_delta,
            );
            model.add_teleportation_delta_on_new_module(
                &current,
                &self.module_flow[new_module as usize],
                &mut new_delta,
            );

            if self.module_members[new_module as usize] == 0 {
                if let Some(i) = self.empty_modules.iter().rposition(|&m| m == new_module) {
                    self.empty_modules.remove(i);
                }
            }
            if self.module_members[old_module as usize] == 1 {
                self.empty_modules.push(old_module);
            }

            model.apply_move(state, &current, &old_delta, &new_delta, &mut self.module_flow);
            self.module_members[old_module as usize] -= 1;
            self.module_members[new_module as usize] += 1;
            tree.node_mut(node_id).index = new_module;
            moved += 1;
        }
        moved
    }

    /// Turns the dynamic module assignment into module nodes with aggregated
    /// links. Returns the number of modules created.
    ///
    /// With `as_sub_modules` the new modules go under the existing top modules;
    /// with `replace_existing` a module-level active network is dissolved into
    /// the new modules.
    pub fn consolidate_modules(
        &mut self,
        tree: &mut Tree,
        model: &FlowModel,
        replace_existing: bool,
        as_sub_modules: bool,
    ) -> usize {
        let n = self.active.len();
        if n == 0 {
            return 0;
        }
        let root = tree.root();
        let first = self.active[0];
        let already_module_level = tree.parent(first) != Some(root);
        let active_is_leaf = tree.is_leaf(first);

        if as_sub_modules {
            debug_assert!(already_module_level, "sub-modules need an existing module level");
            let tops = tree.children(root).to_vec();
            for top in tops {
                tree.release_children(top);
            }
        } else {
            if already_module_level {
                tree.replace_children_with_grandchildren(root);
            }
            tree.release_children(root);
        }

        let mut modules: Vec<Option<NodeId>> = vec![None; n];
        let mut created: Vec<NodeId> = Vec::new();
        for &node in &self.active {
            let module_index = tree.node(node).index as usize;
            let module = match modules[module_index] {
                Some(module) => module,
                None => {
                    let module = tree.create_module(self.module_flow[module_index]);
                    tree.node_mut(module).index = module_index as u32;
                    if let Some(parent) = tree.parent(node) {
                        tree.add_child(parent, module);
                    }
                    modules[module_index] = Some(module);
                    created.push(module);
                    module
                }
            };
            tree.add_child(module, node);
        }

        if as_sub_modules {
            let tops = tree.children(root).to_vec();
            for (i, top) in tops.into_iter().enumerate() {
                let subs = tree.children(top).to_vec();
                for sub in subs {
                    tree.node_mut(sub).index = i as u32;
                }
            }
            if replace_existing {
                tree.replace_children_with_grandchildren(root);
            }
        }

        // Ordered on uid pairs so link order never depends on hashing.
        let mut module_links: BTreeMap<(u64, u64), (NodeId, NodeId, f64)> = BTreeMap::new();
        for &node in &self.active {
            let Some(parent) = tree.parent(node) else {
                continue;
            };
            for &e in tree.node(node).out_edges() {
                let edge = tree.edge(e);
                let Some(other_parent) = tree.parent(edge.target) else {
                    continue;
                };
                if other_parent == parent {
                    continue;
                }
                let (mut m1, mut m2) = (parent, other_parent);
                if !model.is_directed() && tree.node(m1).uid > tree.node(m2).uid {
                    std::mem::swap(&mut m1, &mut m2);
                }
                let key = (tree.node(m1).uid, tree.node(m2).uid);
                module_links.entry(key).or_insert((m1, m2, 0.0)).2 += edge.flow;
            }
        }
        for (_, (m1, m2, flow)) in module_links {
            tree.add_edge(m1, m2, 0.0, flow);
        }

        if !active_is_leaf && replace_existing {
            for &module in &created {
                tree.replace_children_with_grandchildren(module);
            }
        }

        created.len()
    }
}
