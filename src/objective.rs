use std::fmt;

/// Flows below this are treated as exactly zero in entropy terms.
pub const PLOGP_EPSILON: f64 = 1.0e-16;

/// `p * log2(p)` with `0 * log(0) := 0`.
#[inline]
pub fn plogp(p: f64) -> f64 {
    if p > PLOGP_EPSILON {
        p * p.log2()
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FlowData {
    pub flow: f64,
    pub enter_flow: f64,
    pub exit_flow: f64,
    pub teleport_weight: f64,
    /// `alpha * flow + beta * dangling_flow`: flow leaving by teleportation.
    pub teleport_source_flow: f64,
    pub dangling_flow: f64,
}

impl FlowData {
    pub fn with_flow(flow: f64) -> Self {
        Self {
            flow,
            ..Self::default()
        }
    }

    pub fn add_assign(&mut self, other: &FlowData) {
        self.flow += other.flow;
        self.enter_flow += other.enter_flow;
        self.exit_flow += other.exit_flow;
        self.teleport_weight += other.teleport_weight;
        self.teleport_source_flow += other.teleport_source_flow;
        self.dangling_flow += other.dangling_flow;
    }

    pub fn sub_assign(&mut self, other: &FlowData) {
        self.flow -= other.flow;
        self.enter_flow -= other.enter_flow;
        self.exit_flow -= other.exit_flow;
        self.teleport_weight -= other.teleport_weight;
        self.teleport_source_flow -= other.teleport_source_flow;
        self.dangling_flow -= other.dangling_flow;
    }
}

impl fmt::Display for FlowData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "flow: {}, enter: {}, exit: {}",
            self.flow, self.enter_flow, self.exit_flow
        )
    }
}

/// Flow between a node and one candidate module, gathered while evaluating a move.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeltaFlow {
    pub module: u32,
    pub delta_exit: f64,
    pub delta_enter: f64,
}

impl DeltaFlow {
    pub fn new(module: u32, delta_exit: f64, delta_enter: f64) -> Self {
        Self {
            module,
            delta_exit,
            delta_enter,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct MoveDeltaContext {
    // Old-module terms reused across every candidate destination of one node.
    de_old: f64,
    current_flow: f64,
    current_enter_flow: f64,
    current_exit_flow: f64,
    old_enter_before: f64,
    old_enter_after: f64,
    old_exit_before: f64,
    old_exit_after: f64,
    old_total_before: f64,
    old_total_after: f64,
}

/// Running sums of the two-level map equation over the active partition.
///
/// After `init_partition` the sums are only changed through `apply_move`,
/// which keeps them equal (up to rounding) to a recomputation from scratch.
#[derive(Debug, Clone, Default)]
pub struct OptimizerState {
    pub codelength: f64,
    pub index_codelength: f64,
    pub module_codelength: f64,

    node_flow_log_node_flow: f64,
    flow_log_flow: f64,
    exit_log_exit: f64,
    enter_log_enter: f64,
    enter_flow: f64,
    enter_flow_log_enter_flow: f64,

    exit_network_flow: f64,
    exit_network_flow_log_exit_network_flow: f64,
}

impl OptimizerState {
    /// Flow leaving the whole (sub-)network; zero at the top level.
    pub fn set_exit_network_flow(&mut self, exit_network_flow: f64) {
        self.exit_network_flow = exit_network_flow;
        self.exit_network_flow_log_exit_network_flow = plogp(exit_network_flow);
    }

    pub fn exit_network_flow(&self) -> f64 {
        self.exit_network_flow
    }

    pub fn init_constant_terms<'a, I>(&mut self, nodes: I)
    where
        I: IntoIterator<Item = &'a FlowData>,
    {
        self.node_flow_log_node_flow = nodes.into_iter().map(|n| plogp(n.flow)).sum();
    }

    pub fn init_partition<'a, I>(&mut self, modules: I, detailed_balance: bool)
    where
        I: IntoIterator<Item = &'a FlowData>,
    {
        self.flow_log_flow = 0.0;
        self.exit_log_exit = 0.0;
        self.enter_log_enter = 0.0;
        self.enter_flow = 0.0;

        for d in modules {
            self.flow_log_flow += plogp(d.flow + d.exit_flow);
            self.exit_log_exit += plogp(d.exit_flow);
            self.enter_log_enter += plogp(d.enter_flow);
            self.enter_flow += if detailed_balance {
                d.exit_flow
            } else {
                d.enter_flow
            };
        }
        self.enter_flow += self.exit_network_flow;
        self.refresh(detailed_balance);
    }

    fn refresh(&mut self, detailed_balance: bool) {
        let enter_log_enter = if detailed_balance {
            self.exit_log_exit
        } else {
            self.enter_log_enter
        };
        self.enter_flow_log_enter_flow = plogp(self.enter_flow);
        self.index_codelength = self.enter_flow_log_enter_flow
            - enter_log_enter
            - self.exit_network_flow_log_exit_network_flow;
        self.module_codelength =
            -self.exit_log_exit + self.flow_log_flow - self.node_flow_log_node_flow;
        self.codelength = self.index_codelength + self.module_codelength;
    }

    pub(crate) fn prepare_move(
        &self,
        current: &FlowData,
        old_module: &FlowData,
        de_old: f64,
    ) -> MoveDeltaContext {
        MoveDeltaContext {
            de_old,
            current_flow: current.flow,
            current_enter_flow: current.enter_flow,
            current_exit_flow: current.exit_flow,
            old_enter_before: plogp(old_module.enter_flow),
            old_enter_after: plogp(old_module.enter_flow - current.enter_flow + de_old),
            old_exit_before: plogp(old_module.exit_flow),
            old_exit_after: plogp(old_module.exit_flow - current.exit_flow + de_old),
            old_total_before: plogp(old_module.exit_flow + old_module.flow),
            old_total_after: plogp(
                old_module.exit_flow + old_module.flow - current.exit_flow - current.flow
                    + de_old,
            ),
        }
    }

    pub(crate) fn delta_with_context(
        &self,
        context: &MoveDeltaContext,
        new_module: &FlowData,
        de_new: f64,
        detailed_balance: bool,
    ) -> f64 {
        let delta_enter =
            plogp(self.enter_flow + context.de_old - de_new) - self.enter_flow_log_enter_flow;

        let delta_exit_log_exit = -context.old_exit_before - plogp(new_module.exit_flow)
            + context.old_exit_after
            + plogp(new_module.exit_flow + context.current_exit_flow - de_new);

        let delta_flow_log_flow = -context.old_total_before
            - plogp(new_module.exit_flow + new_module.flow)
            + context.old_total_after
            + plogp(
                new_module.exit_flow + new_module.flow + context.current_exit_flow
                    + context.current_flow
                    - de_new,
            );

        if detailed_balance {
            return delta_enter - 2.0 * delta_exit_log_exit + delta_flow_log_flow;
        }

        let delta_enter_log_enter = -context.old_enter_before - plogp(new_module.enter_flow)
            + context.old_enter_after
            + plogp(new_module.enter_flow + context.current_enter_flow - de_new);

        delta_enter - delta_enter_log_enter - delta_exit_log_exit + delta_flow_log_flow
    }

    /// Moves `current` from module `old_m` to `new_m`, updating both module records
    /// and the running sums. `de_old`/`de_new` are the enter+exit link flows between
    /// the node and the two modules.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn apply_move(
        &mut self,
        current: &FlowData,
        old_m: usize,
        new_m: usize,
        de_old: f64,
        de_new: f64,
        modules: &mut [FlowData],
        detailed_balance: bool,
    ) {
        self.remove_module_terms(&modules[old_m], detailed_balance);
        self.remove_module_terms(&modules[new_m], detailed_balance);

        modules[old_m].sub_assign(current);
        modules[new_m].add_assign(current);

        modules[old_m].enter_flow += de_old;
        modules[old_m].exit_flow += de_old;
        modules[new_m].enter_flow -= de_new;
        modules[new_m].exit_flow -= de_new;

        self.add_module_terms(&modules[old_m], detailed_balance);
        self.add_module_terms(&modules[new_m], detailed_balance);
        self.refresh(detailed_balance);
    }

    #[inline]
    fn remove_module_terms(&mut self, d: &FlowData, detailed_balance: bool) {
        // Detailed balance counts exit flow in the enter total, as in init_partition.
        self.enter_flow -= if detailed_balance {
            d.exit_flow
        } else {
            d.enter_flow
        };
        self.enter_log_enter -= plogp(d.enter_flow);
        self.exit_log_exit -= plogp(d.exit_flow);
        self.flow_log_flow -= plogp(d.exit_flow + d.flow);
    }

    #[inline]
    fn add_module_terms(&mut self, d: &FlowData, detailed_balance: bool) {
        self.enter_flow += if detailed_balance {
            d.exit_flow
        } else {
            d.enter_flow
        };
        self.enter_log_enter += plogp(d.enter_flow);
        self.exit_log_exit += plogp(d.exit_flow);
        self.flow_log_flow += plogp(d.exit_flow + d.flow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn undirected_pair() -> Vec<FlowData> {
        // Two nodes joined by one undirected link of flow 0.5 per direction.
        vec![
            FlowData {
                flow: 0.5,
                enter_flow: 0.5,
                exit_flow: 0.5,
                ..FlowData::default()
            };
            2
        ]
    }

    #[test]
    fn plogp_convention() {
        assert_eq!(plogp(0.0), 0.0);
        assert_eq!(plogp(-1.0e-20), 0.0);
        assert_eq!(plogp(1.0e-17), 0.0);
        assert_eq!(plogp(1.0), 0.0);
        assert!((plogp(0.5) + 0.5).abs() < 1e-15);
        assert!((plogp(0.25) + 0.5).abs() < 1e-15);
        for i in 1..100 {
            assert!(plogp(i as f64 / 100.0) <= 0.0);
        }
    }

    #[test]
    fn flow_data_add_sub_roundtrip() {
        let mut a = FlowData {
            flow: 0.3,
            enter_flow: 0.1,
            exit_flow: 0.2,
            teleport_weight: 0.25,
            teleport_source_flow: 0.05,
            dangling_flow: 0.0,
        };
        let b = FlowData {
            flow: 0.2,
            enter_flow: 0.05,
            exit_flow: 0.05,
            teleport_weight: 0.25,
            teleport_source_flow: 0.03,
            dangling_flow: 0.2,
        };
        let orig = a;
        a.add_assign(&b);
        assert!((a.flow - 0.5).abs() < 1e-15);
        assert!((a.dangling_flow - 0.2).abs() < 1e-15);
        a.sub_assign(&b);
        assert!((a.flow - orig.flow).abs() < 1e-15);
        assert!((a.teleport_weight - orig.teleport_weight).abs() < 1e-15);
    }

    #[test]
    fn singleton_pair_costs_three_bits() {
        let modules = undirected_pair();
        let mut state = OptimizerState::default();
        state.init_constant_terms(modules.iter());
        state.init_partition(modules.iter(), true);
        assert!((state.index_codelength - 1.0).abs() < 1e-12);
        assert!((state.module_codelength - 2.0).abs() < 1e-12);
        assert!((state.codelength - 3.0).abs() < 1e-12);
    }

    #[test]
    fn merging_the_pair_saves_two_bits() {
        let nodes = undirected_pair();
        let mut modules = nodes.clone();
        let mut state = OptimizerState::default();
        state.init_constant_terms(nodes.iter());
        state.init_partition(modules.iter(), true);

        // Undirected links count from both endpoints.
        let de_old = 0.0;
        let de_new = 2.0 * 0.5;
        let context = state.prepare_move(&nodes[0], &modules[0], de_old);
        let delta = state.delta_with_context(&context, &modules[1], de_new, true);
        assert!((delta + 2.0).abs() < 1e-12);

        let before = state.codelength;
        state.apply_move(&nodes[0], 0, 1, de_old, de_new, &mut modules, true);
        assert!((state.codelength - (before + delta)).abs() < 1e-12);
        assert!((state.codelength - 1.0).abs() < 1e-12);
        assert!(modules[0].flow.abs() < 1e-15);
        assert!((modules[1].flow - 1.0).abs() < 1e-15);
        assert!(modules[1].exit_flow.abs() < 1e-15);
    }

    #[test]
    fn incremental_state_matches_recomputation() {
        let nodes = vec![
            FlowData {
                flow: 0.2,
                enter_flow: 0.15,
                exit_flow: 0.1,
                ..FlowData::default()
            },
            FlowData {
                flow: 0.5,
                enter_flow: 0.2,
                exit_flow: 0.25,
                ..FlowData::default()
            },
            FlowData {
                flow: 0.3,
                enter_flow: 0.1,
                exit_flow: 0.1,
                ..FlowData::default()
            },
        ];
        let mut modules = nodes.clone();
        let mut state = OptimizerState::default();
        state.init_constant_terms(nodes.iter());
        state.init_partition(modules.iter(), false);

        // node 0 -> module 1 with 0.05 out and 0.08 in between them.
        let old = DeltaFlow::new(0, 0.0, 0.0);
        let new = DeltaFlow::new(1, 0.05, 0.08);
        let de_old = old.delta_enter + old.delta_exit;
        let de_new = new.delta_enter + new.delta_exit;
        let context = state.prepare_move(&nodes[0], &modules[0], de_old);
        let delta = state.delta_with_context(&context, &modules[1], de_new, false);
        let before = state.codelength;
        state.apply_move(&nodes[0], 0, 1, de_old, de_new, &mut modules, false);
        assert!((state.codelength - before - delta).abs() < 1e-12);

        let mut fresh = OptimizerState::default();
        fresh.init_constant_terms(nodes.iter());
        fresh.init_partition(modules.iter(), false);
        assert!((fresh.codelength - state.codelength).abs() < 1e-12);
        assert!((fresh.index_codelength - state.index_codelength).abs() < 1e-12);
    }
}
