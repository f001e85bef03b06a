use thiserror::Error;

use crate::types::NodeId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("shape mismatch in {op}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        op: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("constant node {0:?} forwarded without a value")]
    UnsetConstant(Option<String>),
    #[error("duplicate node name: {0}")]
    DuplicateName(String),
    #[error("node {0:?} is not a settable leaf")]
    NotALeaf(NodeId),
    #[error("variable count mismatch: current {current}, snapshot {snapshot}")]
    VariableCountMismatch { current: usize, snapshot: usize },
    #[error("stale version: have {have:?}, current {current}")]
    VersionMismatch { have: Option<String>, current: String },
    #[error("codec error: {0}")]
    Codec(String),
    #[error("model plug-in error: {0}")]
    ModelLoad(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn shape(op: &'static str, expected: (usize, usize), found: (usize, usize)) -> Self {
        Error::ShapeMismatch { op, expected, found }
    }
}
