use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("network has no nodes")]
    EmptyNetwork,

    /// Configuration asks for something the optimizer does not implement.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("invalid value for '{option}': {message}")]
    InvalidConfig {
        option: &'static str,
        message: String,
    },

    #[error("edge references node {node} but the network has {node_count} nodes")]
    UnknownNode { node: usize, node_count: usize },

    #[error("can't parse line {line} of '{}': {message}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid(option: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            option,
            message: message.into(),
        }
    }
}
