pub mod cli;
pub mod config;
pub mod error;
pub mod flow;
pub mod graph;
pub mod infomap;
pub mod logger;
pub mod model;
pub mod objective;
pub(crate) mod optimizer;
pub mod output;
pub mod parser;
pub(crate) mod partition_queue;
pub mod rng;
pub(crate) mod subnetwork;
pub mod tree;

pub use config::Config;
pub use error::{Error, Result};
pub use graph::{InputEdge, Network, NetworkSource};
pub use infomap::{Infomap, PerLevelCodelength, RunStatistics};
