//! Errors shared by the log parser, the cpptraj bridge, and the report writer.
//!
//! Most per-stage problems never reach the caller as an error: they're logged and the stage
//! degrades to a "no data" row. What remains here is what a component can't recover from locally.

use std::{io, path::PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum QaError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("could not parse config file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("missing input: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("`{0}` executable not found in the system PATH")]
    ToolNotFound(String),

    #[error("`{tool}` exited with status {status:?}: {stderr}")]
    ExternalTool {
        tool: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("`{0}` produced none of its declared output files")]
    NoToolOutput(String),

    #[error("malformed data table: {0}")]
    Table(String),

    #[error("invalid DCD file: {0}")]
    Dcd(String),

    #[error("plotting failed: {0}")]
    Plot(String),
}

impl QaError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, QaError>;
