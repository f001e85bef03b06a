pub mod codec;
pub mod errors;
pub mod graph;
mod macros;
pub mod optim;
pub mod server;
pub mod tensor;
pub mod training;
pub mod types;
pub mod util;

pub use errors::{Error, Result};
pub use graph::Graph;
pub use tensor::Tensor;
pub use training::Training;
pub use types::NodeId;
