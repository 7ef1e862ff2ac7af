use crate::config::{Config, FlowModelKind};
use crate::objective::{DeltaFlow, FlowData, MoveDeltaContext, OptimizerState};
use crate::tree::Tree;

/// Flow model selected once per run; every instance in the recursion shares it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlowModel {
    /// Links carry the same flow in both directions; enter equals exit.
    Undirected,
    /// Teleportation is part of the encoded walk and adds to enter/exit flow.
    Directed { alpha: f64, beta: f64 },
    /// Enter and exit flow come from links only and generally differ.
    DirectedUnrecorded,
}

impl FlowModel {
    pub fn from_config(config: &Config) -> Self {
        match config.flow_model_kind() {
            FlowModelKind::Undirected => FlowModel::Undirected,
            FlowModelKind::Directed => FlowModel::Directed {
                alpha: config.teleportation_probability,
                beta: 1.0 - config.teleportation_probability,
            },
            FlowModelKind::DirectedUnrecorded => FlowModel::DirectedUnrecorded,
        }
    }

    pub fn is_directed(&self) -> bool {
        !matches!(self, FlowModel::Undirected)
    }

    /// Whether the index codebook can use exit flow in place of enter flow.
    pub fn is_detailed_balance(&self) -> bool {
        !matches!(self, FlowModel::DirectedUnrecorded)
    }

    /// Link flow between a node and a module, counted for both boundary directions.
    #[inline]
    pub fn enter_exit_delta(&self, delta: &DeltaFlow) -> f64 {
        let sum = delta.delta_enter + delta.delta_exit;
        match self {
            // One stored link stands for a flow in each direction.
            FlowModel::Undirected => 2.0 * sum,
            _ => sum,
        }
    }

    /// Sets enter, exit and teleportation flow on every leaf from its links.
    pub fn init_enter_exit_flow(&self, tree: &mut Tree) {
        let leaves = tree.leaves().to_vec();
        for &leaf in &leaves {
            let data = tree.data_mut(leaf);
            data.enter_flow = 0.0;
            data.exit_flow = 0.0;
            data.dangling_flow = 0.0;
            data.teleport_source_flow = 0.0;
        }

        if let FlowModel::Directed { alpha, beta } = *self {
            let mut sum_dangling_flow = 0.0;
            for &leaf in &leaves {
                if tree.node(leaf).is_dangling() {
                    let data = tree.data_mut(leaf);
                    data.dangling_flow = data.flow;
                    sum_dangling_flow += data.flow;
                }
            }
            for &leaf in &leaves {
                let data = tree.data_mut(leaf);
                data.teleport_source_flow = alpha * data.flow + beta * data.dangling_flow;
                data.exit_flow = data.teleport_source_flow * (1.0 - data.teleport_weight);
                data.enter_flow = (alpha * (1.0 - data.flow)
                    + beta * (sum_dangling_flow - data.dangling_flow))
                    * data.teleport_weight;
            }
        }

        for &leaf in &leaves {
            let mut exit = 0.0;
            let mut enter = 0.0;
            let node = tree.node(leaf);
            for &e in node.out_edges() {
                let edge = tree.edge(e);
                if !edge.is_self_pointing() {
                    exit += edge.flow;
                }
            }
            for &e in node.in_edges() {
                let edge = tree.edge(e);
                if !edge.is_self_pointing() {
                    enter += edge.flow;
                }
            }
            let data = tree.data_mut(leaf);
            match self {
                FlowModel::Undirected => {
                    let boundary = exit + enter;
                    data.exit_flow = boundary;
                    data.enter_flow = boundary;
                }
                _ => {
                    data.exit_flow += exit;
                    data.enter_flow += enter;
                }
            }
        }
    }

    /// Adds the teleportation flow a move would create or remove to the old
    /// module entry and to every candidate entry.
    pub fn add_teleportation_deltas(
        &self,
        current: &FlowData,
        current_module: u32,
        candidates: &mut [DeltaFlow],
        module_flow: &[FlowData],
    ) {
        if !matches!(self, FlowModel::Directed { .. }) {
            return;
        }
        for candidate in candidates.iter_mut() {
            let module = &module_flow[candidate.module as usize];
            if candidate.module == current_module {
                self.add_teleportation_delta_on_old_module(current, module, candidate);
            } else {
                self.add_teleportation_delta_on_new_module(current, module, candidate);
            }
        }
    }

    pub fn add_teleportation_delta_on_old_module(
        &self,
        current: &FlowData,
        old_module: &FlowData,
        delta: &mut DeltaFlow,
    ) {
        if let FlowModel::Directed { .. } = self {
            delta.delta_exit += current.teleport_source_flow
                * (old_module.teleport_weight - current.teleport_weight);
            delta.delta_enter += (old_module.teleport_source_flow - current.teleport_source_flow)
                * current.teleport_weight;
        }
    }

    pub fn add_teleportation_delta_on_new_module(
        &self,
        current: &FlowData,
        new_module: &FlowData,
        delta: &mut DeltaFlow,
    ) {
        if let FlowModel::Directed { .. } = self {
            delta.delta_exit += current.teleport_source_flow * new_module.teleport_weight;
            delta.delta_enter += new_module.teleport_source_flow * current.teleport_weight;
        }
    }

    pub(crate) fn prepare_move(
        &self,
        state: &OptimizerState,
        current: &FlowData,
        old_delta: &DeltaFlow,
        module_flow: &[FlowData],
    ) -> MoveDeltaContext {
        state.prepare_move(
            current,
            &module_flow[old_delta.module as usize],
            self.enter_exit_delta(old_delta),
        )
    }

    pub(crate) fn compute_delta_with_context(
        &self,
        state: &OptimizerState,
        context: &MoveDeltaContext,
        new_delta: &DeltaFlow,
        module_flow: &[FlowData],
    ) -> f64 {
        state.delta_with_context(
            context,
            &module_flow[new_delta.module as usize],
            self.enter_exit_delta(new_delta),
            self.is_detailed_balance(),
        )
    }

    /// Codelength change if `current` moved from `old_delta.module` to `new_delta.module`.
    pub fn compute_delta(
        &self,
        state: &OptimizerState,
        current: &FlowData,
        old_delta: &DeltaFlow,
        new_delta: &DeltaFlow,
        module_flow: &[FlowData],
    ) -> f64 {
        let context = self.prepare_move(state, current, old_delta, module_flow);
        self.compute_delta_with_context(state, &context, new_delta, module_flow)
    }

    /// Performs the move on the module records and the running sums.
    ///
    /// With recorded teleportation the module enter flow is updated on its own
    /// even though the index codebook is coded from exit flow: teleportation
    /// into a module depends on its teleport weight, out of it on its flow.
    pub fn apply_move(
        &self,
        state: &mut OptimizerState,
        current: &FlowData,
        old_delta: &DeltaFlow,
        new_delta: &DeltaFlow,
        module_flow: &mut [FlowData],
    ) {
        state.apply_move(
            current,
            old_delta.module as usize,
            new_delta.module as usize,
            self.enter_exit_delta(old_delta),
            self.enter_exit_delta(new_delta),
            module_flow,
            self.is_detailed_balance(),
        );
    }

    pub fn init_partition<'a, I>(&self, state: &mut OptimizerState, modules: I)
    where
        I: IntoIterator<Item = &'a FlowData>,
    {
        state.init_partition(modules, self.is_detailed_balance());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(tree: &mut Tree, flows: &[f64], teleport_weight: f64) {
        for (i, &flow) in flows.iter().enumerate() {
            tree.add_leaf(
                i as u32,
                FlowData {
                    flow,
                    teleport_weight,
                    ..FlowData::default()
                },
            );
        }
    }

    #[test]
    fn undirected_boundary_flow_ignores_self_links() {
        let mut tree = Tree::new(0);
        leaves(&mut tree, &[0.5, 0.5], 0.0);
        let l = tree.leaves().to_vec();
        tree.add_edge(l[0], l[1], 1.0, 0.4);
        tree.add_edge(l[1], l[1], 1.0, 0.1);
        FlowModel::Undirected.init_enter_exit_flow(&mut tree);
        for &leaf in &l {
            let d = tree.data(leaf);
            assert!((d.exit_flow - 0.4).abs() < 1e-15);
            assert_eq!(d.enter_flow, d.exit_flow);
        }
    }

    #[test]
    fn recorded_teleportation_balances_enter_and_exit() {
        // Directed 3-cycle, uniform flow and teleport weights.
        let alpha = 0.15;
        let model = FlowModel::Directed {
            alpha,
            beta: 1.0 - alpha,
        };
        let mut tree = Tree::new(0);
        leaves(&mut tree, &[1.0 / 3.0; 3], 1.0 / 3.0);
        let l = tree.leaves().to_vec();
        for i in 0..3 {
            tree.add_edge(l[i], l[(i + 1) % 3], 1.0, (1.0 - alpha) / 3.0);
        }
        model.init_enter_exit_flow(&mut tree);
        for &leaf in &l {
            let d = tree.data(leaf);
            assert!((d.enter_flow - d.exit_flow).abs() < 1e-15);
            assert!((d.teleport_source_flow - alpha / 3.0).abs() < 1e-15);
            let expected_exit = alpha / 3.0 * (2.0 / 3.0) + (1.0 - alpha) / 3.0;
            assert!((d.exit_flow - expected_exit).abs() < 1e-15);
        }
    }

    #[test]
    fn teleportation_deltas_match_module_exit_change() {
        let alpha = 0.2;
        let model = FlowModel::Directed {
            alpha,
            beta: 1.0 - alpha,
        };
        let node = FlowData {
            flow: 0.2,
            teleport_weight: 0.25,
            teleport_source_flow: alpha * 0.2,
            ..FlowData::default()
        };
        let module = FlowData {
            flow: 0.3,
            teleport_weight: 0.5,
            teleport_source_flow: alpha * 0.3,
            ..FlowData::default()
        };
        let mut delta = DeltaFlow::new(1, 0.0, 0.0);
        model.add_teleportation_delta_on_new_module(&node, &module, &mut delta);
        assert!((delta.delta_exit - alpha * 0.2 * 0.5).abs() < 1e-15);
        assert!((delta.delta_enter - alpha * 0.3 * 0.25).abs() < 1e-15);

        let mut untouched = DeltaFlow::new(1, 0.0, 0.0);
        FlowModel::Undirected.add_teleportation_delta_on_new_module(&node, &module, &mut untouched);
        assert_eq!(untouched, DeltaFlow::new(1, 0.0, 0.0));
    }

    #[test]
    fn detailed_balance_flags() {
        assert!(FlowModel::Undirected.is_detailed_balance());
        assert!(FlowModel::Directed {
            alpha: 0.15,
            beta: 0.85
        }
        .is_detailed_balance());
        assert!(!FlowModel::DirectedUnrecorded.is_detailed_balance());
        assert!(!FlowModel::Undirected.is_directed());
        assert_eq!(
            FlowModel::Undirected.enter_exit_delta(&DeltaFlow::new(0, 0.1, 0.2)),
            2.0 * (0.1 + 0.2)
        );
    }
}
