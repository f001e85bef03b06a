use serde::{Deserialize, Serialize};

/// Unique identifier for a node in the computation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// (rows, cols) of a dense matrix.
pub type Dims = (usize, usize);
