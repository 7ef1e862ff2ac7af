use crate::config::{Config, TeleportTo};
use clap::{Parser, ValueEnum};
use std::ffi::OsString;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TeleportArg {
    Uniform,
    NodeWeight,
    LinkWeight,
}

impl From<TeleportArg> for TeleportTo {
    fn from(arg: TeleportArg) -> Self {
        match arg {
            TeleportArg::Uniform => TeleportTo::Uniform,
            TeleportArg::NodeWeight => TeleportTo::NodeWeight,
            TeleportArg::LinkWeight => TeleportTo::LinkWeight,
        }
    }
}

/// Hierarchical community detection with the map equation.
#[derive(Debug, Parser)]
#[command(name = "infomap")]
#[command(version)]
pub struct Args {
    /// Network file (Pajek or link list)
    pub network_file: PathBuf,

    /// Directory for output files
    pub out_dir: PathBuf,

    /// Treat links as directed
    #[arg(short, long)]
    pub directed: bool,

    /// Encode teleportation steps of the directed walk
    #[arg(long)]
    pub recorded_teleportation: bool,

    /// Teleportation probability of the directed walk
    #[arg(short = 'p', long, default_value_t = 0.15)]
    pub teleportation_probability: f64,

    /// Where teleporting walkers land
    #[arg(long, value_enum, default_value_t = TeleportArg::Uniform)]
    pub teleport_to: TeleportArg,

    /// Let self-links carry flow
    #[arg(long)]
    pub include_self_links: bool,

    /// Number of outer-most loops to run before picking the best solution
    #[arg(short = 'N', long, default_value_t = 1)]
    pub num_trials: u32,

    /// Seed of the random number generator
    #[arg(short, long, default_value_t = 123)]
    pub seed: u64,

    /// Optimize a two-level partition only
    #[arg(long)]
    pub two_level: bool,

    /// Maximum number of loops in the core algorithm; 0 means no limit
    #[arg(long, default_value_t = 10)]
    pub core_loop_limit: u32,

    /// Draw the core loop limit uniformly from 1 up to the limit
    #[arg(long)]
    pub randomize_core_loop_limit: bool,

    /// Smallest codelength change counted as an improvement
    #[arg(long, default_value_t = 1.0e-10)]
    pub min_improvement: f64,

    /// Smallest relative tuning improvement before tuning stops
    #[arg(long, default_value_t = 1.0e-5)]
    pub min_relative_tune_improvement: f64,

    /// Maximum number of tune iterations; 0 means no limit
    #[arg(long, default_value_t = 0)]
    pub tune_iteration_limit: u32,

    /// Recursion depth when coarse tuning splits modules
    #[arg(long, default_value_t = 1)]
    pub coarse_tune_level: u32,

    /// Cycle the coarse tune level between tune iterations
    #[arg(long)]
    pub alternate_coarse_tune_level: bool,

    /// Skip tuning when partitioning modules during coarse tuning
    #[arg(long)]
    pub fast_coarse_tune: bool,

    /// Maximum number of module aggregation levels; 0 means no limit
    #[arg(long, default_value_t = 0)]
    pub level_aggregation_limit: u32,

    /// Build the hierarchy in place: 1 keeps the top level, 2 all levels, 3 skips recursion
    #[arg(short = 'F', long, default_value_t = 0)]
    pub fast_hierarchical_solution: u32,

    /// Initial cluster assignment (not supported)
    #[arg(long)]
    pub cluster_data: Option<PathBuf>,

    /// Worker threads for independent sub-partitions
    #[arg(long)]
    pub threads: Option<usize>,

    /// Base name of output files; defaults to the network file stem
    #[arg(long)]
    pub out_name: Option<String>,

    /// Comma-separated output files: tree, clu, rank, flow
    #[arg(short, long, value_delimiter = ',', default_value = "tree")]
    pub output: Vec<String>,

    /// More log output; repeat for debug detail
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// No summary on stdout
    #[arg(long)]
    pub silent: bool,
}

impl Args {
    pub fn into_config(self) -> Config {
        let mut cfg = Config {
            network_file: self.network_file,
            out_dir: self.out_dir,
            out_name: self.out_name.unwrap_or_default(),
            undirected: !self.directed,
            record_teleportation: self.recorded_teleportation,
            teleportation_probability: self.teleportation_probability,
            teleport_to: self.teleport_to.into(),
            include_self_links: self.include_self_links,
            num_trials: self.num_trials,
            seed: self.seed,
            two_level: self.two_level,
            core_loop_limit: self.core_loop_limit,
            randomize_core_loop_limit: self.randomize_core_loop_limit,
            minimum_codelength_improvement: self.min_improvement,
            minimum_relative_tune_iteration_improvement: self.min_relative_tune_improvement,
            tune_iteration_limit: self.tune_iteration_limit,
            coarse_tune_level: self.coarse_tune_level,
            alternate_coarse_tune_level: self.alternate_coarse_tune_level,
            fast_coarse_tune_partition: self.fast_coarse_tune,
            level_aggregation_limit: self.level_aggregation_limit,
            fast_hierarchical_solution: self.fast_hierarchical_solution,
            cluster_data_file: self.cluster_data,
            threads: self.threads,
            verbosity: self.verbose,
            silent: self.silent,
            print_tree: false,
            print_clu: false,
            print_rank: false,
            print_flow: false,
        };
        for token in &self.output {
            match token.trim() {
                "tree" => cfg.print_tree = true,
                "clu" => cfg.print_clu = true,
                "rank" => cfg.print_rank = true,
                "flow" => cfg.print_flow = true,
                _ => {}
            }
        }
        cfg
    }
}

/// Parses a full argument list, program name first.
pub fn parse_args<I, T>(args: I) -> Result<Config, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Ok(Args::try_parse_from(args)?.into_config())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlowModelKind;

    #[test]
    fn defaults_match_config_defaults() {
        let cfg = parse_args(["infomap", "net.txt", "out"]).unwrap();
        let default = Config::default();
        assert_eq!(cfg.network_file, PathBuf::from("net.txt"));
        assert_eq!(cfg.out_dir, PathBuf::from("out"));
        assert_eq!(cfg.seed, default.seed);
        assert_eq!(cfg.num_trials, default.num_trials);
        assert_eq!(cfg.core_loop_limit, default.core_loop_limit);
        assert_eq!(cfg.teleportation_probability, default.teleportation_probability);
        assert_eq!(cfg.flow_model_kind(), FlowModelKind::Undirected);
        assert!(cfg.print_tree && !cfg.print_clu);
    }

    #[test]
    fn flags_map_onto_config() {
        let cfg = parse_args([
            "infomap",
            "net.txt",
            "out",
            "--directed",
            "--recorded-teleportation",
            "-N",
            "5",
            "--seed=7",
            "--output",
            "clu,rank,flow",
            "--teleport-to",
            "node-weight",
            "-vv",
            "--threads",
            "4",
        ])
        .unwrap();
        assert_eq!(cfg.flow_model_kind(), FlowModelKind::Directed);
        assert_eq!(cfg.num_trials, 5);
        assert_eq!(cfg.seed, 7);
        assert!(!cfg.print_tree && cfg.print_clu && cfg.print_rank && cfg.print_flow);
        assert_eq!(cfg.teleport_to, TeleportTo::NodeWeight);
        assert_eq!(cfg.verbosity, 2);
        assert_eq!(cfg.worker_threads(), 4);
    }

    #[test]
    fn missing_positionals_is_an_error() {
        assert!(parse_args(["infomap", "net.txt"]).is_err());
    }
}
