use crate::error::{Error, Result};
use std::path::PathBuf;

/// Which flow model drives flow calculation and the move deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowModelKind {
    Undirected,
    /// Directed flow with teleportation steps encoded in enter/exit flow.
    Directed,
    /// Directed flow where teleportation only shapes the stationary distribution.
    DirectedUnrecorded,
}

/// Where teleporting walkers land on directed networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TeleportTo {
    #[default]
    Uniform,
    /// Proportional to the node weights given by the network source.
    NodeWeight,
    /// Proportional to each node's total out-link weight.
    LinkWeight,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub network_file: PathBuf,
    pub out_dir: PathBuf,
    pub out_name: String,

    pub undirected: bool,
    pub record_teleportation: bool,
    pub teleportation_probability: f64,
    pub teleport_to: TeleportTo,
    pub include_self_links: bool,

    pub num_trials: u32,
    pub seed: u64,
    pub two_level: bool,
    pub core_loop_limit: u32,
    pub randomize_core_loop_limit: bool,
    pub minimum_codelength_improvement: f64,
    pub minimum_relative_tune_iteration_improvement: f64,
    pub tune_iteration_limit: u32,
    pub coarse_tune_level: u32,
    pub alternate_coarse_tune_level: bool,
    pub fast_coarse_tune_partition: bool,
    pub level_aggregation_limit: u32,
    pub fast_hierarchical_solution: u32,
    pub cluster_data_file: Option<PathBuf>,

    pub threads: Option<usize>,
    pub verbosity: u8,
    pub silent: bool,

    pub print_tree: bool,
    pub print_clu: bool,
    pub print_rank: bool,
    pub print_flow: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network_file: PathBuf::new(),
            out_dir: PathBuf::from("."),
            out_name: String::new(),
            undirected: true,
            record_teleportation: false,
            teleportation_probability: 0.15,
            teleport_to: TeleportTo::Uniform,
            include_self_links: false,
            num_trials: 1,
            seed: 123,
            two_level: false,
            core_loop_limit: 10,
            randomize_core_loop_limit: false,
            minimum_codelength_improvement: 1.0e-10,
            minimum_relative_tune_iteration_improvement: 1.0e-5,
            tune_iteration_limit: 0,
            coarse_tune_level: 1,
            alternate_coarse_tune_level: false,
            fast_coarse_tune_partition: false,
            level_aggregation_limit: 0,
            fast_hierarchical_solution: 0,
            cluster_data_file: None,
            threads: None,
            verbosity: 0,
            silent: false,
            print_tree: true,
            print_clu: false,
            print_rank: false,
            print_flow: false,
        }
    }
}

impl Config {
    pub fn flow_model_kind(&self) -> FlowModelKind {
        if self.undirected {
            FlowModelKind::Undirected
        } else if self.record_teleportation {
            FlowModelKind::Directed
        } else {
            FlowModelKind::DirectedUnrecorded
        }
    }

    pub fn any_output_enabled(&self) -> bool {
        self.print_tree || self.print_clu || self.print_rank || self.print_flow
    }

    /// Number of workers for sibling sub-partitions; 1 means run them inline.
    pub fn worker_threads(&self) -> usize {
        self.threads.unwrap_or(1).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(path) = &self.cluster_data_file {
            return Err(Error::Unsupported(format!(
                "initial cluster data ('{}') is not supported",
                path.display()
            )));
        }
        if !(0.0..=1.0).contains(&self.teleportation_probability) {
            return Err(Error::invalid(
                "teleportation_probability",
                format!("{} is outside [0, 1]", self.teleportation_probability),
            ));
        }
        if self.num_trials == 0 {
            return Err(Error::invalid("num_trials", "at least one trial is required"));
        }
        if self.coarse_tune_level == 0 {
            return Err(Error::invalid("coarse_tune_level", "must be at least 1"));
        }
        if self.fast_hierarchical_solution > 3 {
            return Err(Error::invalid(
                "fast_hierarchical_solution",
                format!("{} is not one of 0..=3", self.fast_hierarchical_solution),
            ));
        }
        if !(self.minimum_codelength_improvement >= 0.0) {
            return Err(Error::invalid(
                "minimum_codelength_improvement",
                "must be a non-negative number",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_and_undirected() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.flow_model_kind(), FlowModelKind::Undirected);
        assert_eq!(cfg.worker_threads(), 1);
    }

    #[test]
    fn directed_variants_follow_teleportation_flag() {
        let mut cfg = Config {
            undirected: false,
            ..Config::default()
        };
        assert_eq!(cfg.flow_model_kind(), FlowModelKind::DirectedUnrecorded);
        cfg.record_teleportation = true;
        assert_eq!(cfg.flow_model_kind(), FlowModelKind::Directed);
    }

    #[test]
    fn cluster_data_is_rejected_as_unsupported() {
        let cfg = Config {
            cluster_data_file: Some(PathBuf::from("seed.clu")),
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Unsupported(_))));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let cfg = Config {
            teleportation_probability: 1.5,
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig { .. })));

        let cfg = Config {
            coarse_tune_level: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
