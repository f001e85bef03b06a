use rand::rngs::StdRng;

use crate::errors::Result;
use crate::tensor::Tensor;
use crate::types::{Dims, NodeId};

/// A differentiable operation in the DAG.
///
/// `forward` writes the node value into a preallocated `out` buffer so the
/// hot path stays allocation-free once shapes have settled. `backward_input`
/// is the pullback for one input edge: it accumulates the input's share of
/// the upstream gradient into `acc` (which has the input's shape).
pub trait Operation: Send {
    fn name(&self) -> &'static str;

    /// Output (rows, cols) from the input shapes; rejects incompatible inputs.
    fn output_shape(&self, inputs: &[Dims]) -> Result<Dims>;

    fn forward(&mut self, inputs: &[&Tensor], out: &mut Tensor, rng: &mut StdRng) -> Result<()>;

    fn backward_input(
        &self,
        index: usize,
        inputs: &[&Tensor],
        value: &Tensor,
        grad: &Tensor,
        acc: &mut Tensor,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Value set externally each step; never trained.
    Constant,
    /// Trainable parameter, enumerated by `Graph::variables`.
    Variable,
    Op,
}

/// A vertex in the computation graph.
pub struct Node {
    pub(crate) kind: NodeKind,
    pub(crate) op: Option<Box<dyn Operation>>,
    pub(crate) inputs: Vec<NodeId>,
    pub(crate) value: Option<Tensor>,
    /// Epoch at which `value` was last computed (op nodes only).
    pub(crate) epoch: u64,
    pub(crate) gradient: Option<Tensor>,
    pub(crate) backprop: bool,
    pub(crate) name: Option<String>,
    /// Declared shape for constants; checked on every `set_value`.
    pub(crate) declared: Option<Dims>,
}

impl Node {
    pub(crate) fn leaf(kind: NodeKind, value: Option<Tensor>, declared: Option<Dims>) -> Self {
        Self {
            kind,
            op: None,
            inputs: Vec::new(),
            value,
            epoch: 0,
            gradient: None,
            backprop: true,
            name: None,
            declared,
        }
    }

    pub(crate) fn op(op: Box<dyn Operation>, inputs: Vec<NodeId>) -> Self {
        Self {
            kind: NodeKind::Op,
            op: Some(op),
            inputs,
            value: None,
            epoch: 0,
            gradient: None,
            backprop: true,
            name: None,
            declared: None,
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}
