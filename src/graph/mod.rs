pub mod compose;
pub mod nn;
pub mod node;
pub mod ops;

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::errors::{Error, Result};
use crate::tensor::Tensor;
use crate::types::NodeId;

use node::{Node, NodeKind, Operation};

const DEFAULT_EPSILON: f32 = 1e-3;

/// f64 accumulation keeps the central-difference quotient out of f32
/// cancellation territory.
fn sum64(t: &Tensor) -> f64 {
    t.as_slice().iter().map(|&v| v as f64).sum()
}

/// The computation graph: an arena owning every node, the forward
/// memoization epoch and the RNG feeding stochastic operators.
///
/// Forward and backward are single-threaded; concurrent training uses one
/// private graph per worker thread.
pub struct Graph {
    nodes: Vec<Node>,
    variables: Vec<NodeId>,
    names: HashMap<String, NodeId>,
    epoch: u64,
    rng: StdRng,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            nodes: Vec::new(),
            variables: Vec::new(),
            names: HashMap::new(),
            // Fresh op nodes carry epoch 0, so the first forward always
            // computes.
            epoch: 1,
            rng,
        }
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    /// Adopt an operation node; inputs must already live in this graph.
    pub fn op(&mut self, op: Box<dyn Operation>, inputs: Vec<NodeId>) -> NodeId {
        debug_assert!(inputs.iter().all(|i| i.0 < self.nodes.len()));
        self.push(Node::op(op, inputs))
    }

    // --- Leaves ---

    /// Unset constant with a declared shape; `set_value` fills it each step.
    pub fn constant(&mut self, rows: usize, cols: usize) -> NodeId {
        self.push(Node::leaf(NodeKind::Constant, None, Some((rows, cols))))
    }

    pub fn constant_from(&mut self, value: Tensor) -> NodeId {
        let shape = value.shape();
        self.push(Node::leaf(NodeKind::Constant, Some(value), Some(shape)))
    }

    /// Trainable parameter, uniformly initialized from the graph RNG.
    pub fn variable(&mut self, rows: usize, cols: usize) -> NodeId {
        let value = Tensor::random(rows, cols, &mut self.rng);
        self.variable_from(value)
    }

    pub fn variable_from(&mut self, value: Tensor) -> NodeId {
        let shape = value.shape();
        let id = self.push(Node::leaf(NodeKind::Variable, Some(value), Some(shape)));
        self.variables.push(id);
        id
    }

    /// Empty variable slot, sized later by the first weight load.
    pub(crate) fn variable_placeholder(&mut self) -> NodeId {
        let id = self.push(Node::leaf(NodeKind::Variable, Some(Tensor::zeros(0, 0)), None));
        self.variables.push(id);
        id
    }

    /// Set a leaf's value. Constants must match their declared shape;
    /// sized variables keep their shape for the session. Op nodes are
    /// computed, not set, and are rejected.
    pub fn set_value(&mut self, id: NodeId, value: Tensor) -> Result<()> {
        let node = &mut self.nodes[id.0];
        if node.kind == NodeKind::Op {
            return Err(Error::NotALeaf(id));
        }
        if let Some(declared) = node.declared {
            if value.shape() != declared {
                return Err(Error::shape("set_value", declared, value.shape()));
            }
        } else {
            node.declared = Some(value.shape());
        }
        node.value = Some(value);
        Ok(())
    }

    // --- Names ---

    pub fn name(&mut self, id: NodeId, name: &str) -> Result<()> {
        if self.names.contains_key(name) {
            return Err(Error::DuplicateName(name.to_string()));
        }
        self.names.insert(name.to_string(), id);
        self.nodes[id.0].name = Some(name.to_string());
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    // --- Introspection ---

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Variables in insertion order; this order is the serialization
    /// contract for weight exchange.
    pub fn variables(&self) -> &[NodeId] {
        &self.variables
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn value(&self, id: NodeId) -> Option<&Tensor> {
        self.nodes[id.0].value.as_ref()
    }

    pub fn gradient(&self, id: NodeId) -> Option<&Tensor> {
        self.nodes[id.0].gradient.as_ref()
    }

    /// Mutable variable value alongside its (read-only) gradient, for
    /// optimizer steps.
    pub fn variable_parts_mut(&mut self, id: NodeId) -> (&mut Tensor, Option<&Tensor>) {
        let node = &mut self.nodes[id.0];
        debug_assert_eq!(node.kind, NodeKind::Variable);
        (
            node.value.as_mut().expect("variables always hold a value"),
            node.gradient.as_ref(),
        )
    }

    /// Gate gradient flow through a node without changing its kind.
    pub fn set_backprop(&mut self, id: NodeId, enabled: bool) {
        self.nodes[id.0].backprop = enabled;
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    // --- Evaluation ---

    /// Advance the epoch: every cached op value goes stale in O(1).
    pub fn recache(&mut self) {
        self.epoch += 1;
    }

    /// Zero every variable's gradient accumulator.
    pub fn zero_grad(&mut self) {
        for &id in &self.variables {
            if let Some(g) = &mut self.nodes[id.0].gradient {
                g.zero();
            }
        }
    }

    /// Evaluate `id`, memoized per epoch. Each node forwards at most once
    /// per epoch.
    pub fn forward(&mut self, id: NodeId) -> Result<&Tensor> {
        self.run_forward(id)?;
        Ok(self.nodes[id.0]
            .value
            .as_ref()
            .expect("run_forward leaves a value"))
    }

    fn run_forward(&mut self, id: NodeId) -> Result<()> {
        let mut stack: Vec<(NodeId, bool)> = vec![(id, false)];
        while let Some((nid, ready)) = stack.pop() {
            let node = &self.nodes[nid.0];
            match node.kind {
                NodeKind::Constant => {
                    if node.value.is_none() {
                        return Err(Error::UnsetConstant(node.name.clone()));
                    }
                }
                NodeKind::Variable => {}
                NodeKind::Op => {
                    if node.epoch == self.epoch && node.value.is_some() {
                        continue;
                    }
                    if ready {
                        self.compute(nid)?;
                    } else {
                        stack.push((nid, true));
                        for &input in node.inputs.iter().rev() {
                            stack.push((input, false));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn compute(&mut self, nid: NodeId) -> Result<()> {
        let mut op = self.nodes[nid.0].op.take().expect("op node");
        let inputs = self.nodes[nid.0].inputs.clone();

        let result = (|| {
            let mut shapes = Vec::with_capacity(inputs.len());
            for &i in &inputs {
                let value = self.nodes[i.0]
                    .value
                    .as_ref()
                    .ok_or_else(|| Error::UnsetConstant(self.nodes[i.0].name.clone()))?;
                shapes.push(value.shape());
            }
            let (rows, cols) = op.output_shape(&shapes)?;
            let mut out = match self.nodes[nid.0].value.take() {
                Some(t) if t.shape() == (rows, cols) => t,
                _ => Tensor::zeros(rows, cols),
            };
            {
                let (nodes, rng) = (&self.nodes, &mut self.rng);
                let input_refs: Vec<&Tensor> = inputs
                    .iter()
                    .map(|i| nodes[i.0].value.as_ref().expect("checked above"))
                    .collect();
                op.forward(&input_refs, &mut out, rng)?;
            }
            let node = &mut self.nodes[nid.0];
            node.value = Some(out);
            node.epoch = self.epoch;
            Ok(())
        })();

        self.nodes[nid.0].op = Some(op);
        result
    }

    /// Reverse-mode sweep seeded at `f`. Zeroes every gradient, deposits
    /// `seed` at `f`, then runs each reached node's pullbacks exactly once
    /// in reverse insertion order (inputs always precede their consumers).
    /// Nodes with backprop disabled do not propagate.
    pub fn backward(&mut self, f: NodeId, seed: &Tensor) -> Result<()> {
        let out_shape = self.nodes[f.0]
            .value
            .as_ref()
            .ok_or_else(|| Error::UnsetConstant(self.nodes[f.0].name.clone()))?
            .shape();
        if seed.shape() != out_shape {
            return Err(Error::shape("backward", out_shape, seed.shape()));
        }

        for node in &mut self.nodes {
            if let Some(g) = &mut node.gradient {
                g.zero();
            }
        }

        let mut reached = vec![false; self.nodes.len()];
        let mut stack = vec![f];
        reached[f.0] = true;
        while let Some(nid) = stack.pop() {
            for &input in &self.nodes[nid.0].inputs {
                if !reached[input.0] {
                    reached[input.0] = true;
                    stack.push(input);
                }
            }
        }

        {
            let node = &mut self.nodes[f.0];
            let mut g = match node.gradient.take() {
                Some(t) if t.shape() == out_shape => t,
                _ => Tensor::zeros(out_shape.0, out_shape.1),
            };
            g.copy_from(seed)?;
            node.gradient = Some(g);
        }

        for idx in (0..=f.0).rev() {
            if !reached[idx] {
                continue;
            }
            let node = &self.nodes[idx];
            if node.op.is_none() || !node.backprop || node.gradient.is_none() {
                continue;
            }
            self.pullback(NodeId(idx))?;
        }
        Ok(())
    }

    fn pullback(&mut self, nid: NodeId) -> Result<()> {
        let op = self.nodes[nid.0].op.take().expect("op node");
        let grad = self.nodes[nid.0].gradient.take().expect("gradient present");
        let value = self.nodes[nid.0].value.take().expect("forwarded");
        let inputs = self.nodes[nid.0].inputs.clone();

        let mut result = Ok(());
        for (k, &pid) in inputs.iter().enumerate() {
            let pshape = self.nodes[pid.0]
                .value
                .as_ref()
                .expect("inputs were forwarded")
                .shape();
            let mut pgrad = match self.nodes[pid.0].gradient.take() {
                Some(t) if t.shape() == pshape => t,
                _ => Tensor::zeros(pshape.0, pshape.1),
            };
            {
                let nodes = &self.nodes;
                let input_refs: Vec<&Tensor> = inputs
                    .iter()
                    .map(|i| nodes[i.0].value.as_ref().expect("inputs were forwarded"))
                    .collect();
                result = op.backward_input(k, &input_refs, &value, &grad, &mut pgrad);
            }
            self.nodes[pid.0].gradient = Some(pgrad);
            if result.is_err() {
                break;
            }
        }

        let node = &mut self.nodes[nid.0];
        node.op = Some(op);
        node.gradient = Some(grad);
        node.value = Some(value);
        result
    }

    /// Central-difference Jacobian of `sum(forward(f))` with respect to the
    /// elements of leaf `x`. Test utility; leaves the graph recached.
    pub fn dfdx(&mut self, f: NodeId, x: NodeId) -> Result<Tensor> {
        self.dfdx_with(f, x, DEFAULT_EPSILON)
    }

    pub fn dfdx_with(&mut self, f: NodeId, x: NodeId, epsilon: f32) -> Result<Tensor> {
        let (rows, cols) = self.nodes[x.0]
            .value
            .as_ref()
            .ok_or_else(|| Error::UnsetConstant(self.nodes[x.0].name.clone()))?
            .shape();
        let mut jacobian = Tensor::zeros(rows, cols);
        for i in 0..rows {
            for j in 0..cols {
                let origin = self.nodes[x.0].value.as_ref().unwrap().get(i, j);

                self.nodes[x.0].value.as_mut().unwrap().set(i, j, origin + epsilon);
                self.recache();
                let plus = sum64(self.forward(f)?);

                self.nodes[x.0].value.as_mut().unwrap().set(i, j, origin - epsilon);
                self.recache();
                let minus = sum64(self.forward(f)?);

                self.nodes[x.0].value.as_mut().unwrap().set(i, j, origin);
                jacobian.set(i, j, ((plus - minus) / (2.0 * epsilon as f64)) as f32);
            }
        }
        self.recache();
        Ok(jacobian)
    }

    // --- Operator factories ---

    pub fn neg(&mut self, x: NodeId) -> NodeId {
        self.op(Box::new(ops::Neg), vec![x])
    }

    pub fn abs(&mut self, x: NodeId) -> NodeId {
        self.op(Box::new(ops::Abs), vec![x])
    }

    pub fn log(&mut self, x: NodeId) -> NodeId {
        self.op(Box::new(ops::Log), vec![x])
    }

    pub fn exp(&mut self, x: NodeId) -> NodeId {
        self.op(Box::new(ops::Exp), vec![x])
    }

    pub fn tanh(&mut self, x: NodeId) -> NodeId {
        self.op(Box::new(ops::Tanh), vec![x])
    }

    pub fn sigmoid(&mut self, x: NodeId) -> NodeId {
        self.op(Box::new(ops::Sigmoid), vec![x])
    }

    pub fn relu(&mut self, x: NodeId) -> NodeId {
        self.op(Box::new(ops::Relu), vec![x])
    }

    pub fn erf(&mut self, x: NodeId) -> NodeId {
        self.op(Box::new(ops::Erf), vec![x])
    }

    pub fn gelu(&mut self, x: NodeId) -> NodeId {
        self.op(Box::new(ops::Gelu), vec![x])
    }

    pub fn softplus(&mut self, x: NodeId) -> NodeId {
        self.op(Box::new(ops::Softplus), vec![x])
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.binary(ops::BinaryKind::Add, a, b)
    }

    pub fn sub(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.binary(ops::BinaryKind::Sub, a, b)
    }

    pub fn mul(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.binary(ops::BinaryKind::Mul, a, b)
    }

    pub fn div(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.binary(ops::BinaryKind::Div, a, b)
    }

    pub fn pow(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.binary(ops::BinaryKind::Pow, a, b)
    }

    pub fn min(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.binary(ops::BinaryKind::Min, a, b)
    }

    pub fn max(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.binary(ops::BinaryKind::Max, a, b)
    }

    fn binary(&mut self, kind: ops::BinaryKind, a: NodeId, b: NodeId) -> NodeId {
        self.op(Box::new(ops::Binary { kind }), vec![a, b])
    }

    pub fn sum(&mut self, x: NodeId) -> NodeId {
        self.op(Box::new(ops::Sum), vec![x])
    }

    pub fn mean(&mut self, x: NodeId) -> NodeId {
        self.op(Box::new(ops::Mean), vec![x])
    }

    pub fn transpose(&mut self, x: NodeId) -> NodeId {
        self.op(Box::new(ops::Transpose), vec![x])
    }

    pub fn reshape(&mut self, x: NodeId, rows: usize, cols: usize) -> NodeId {
        self.op(Box::new(ops::Reshape { rows, cols }), vec![x])
    }

    /// Rectangular crop anchored at (row, col).
    pub fn split(&mut self, x: NodeId, row: usize, col: usize, rows: usize, cols: usize) -> NodeId {
        self.op(Box::new(ops::Split { row, col, rows, cols }), vec![x])
    }

    /// Row-major concatenation of `a` then `b` into a (rows, cols) tensor.
    pub fn join(&mut self, a: NodeId, b: NodeId, rows: usize, cols: usize) -> NodeId {
        self.op(Box::new(ops::Join { rows, cols }), vec![a, b])
    }

    pub fn broadcast(&mut self, x: NodeId, rows: usize, cols: usize) -> NodeId {
        self.op(Box::new(ops::Broadcast { rows, cols }), vec![x])
    }

    /// Matrix product.
    pub fn product(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.op(Box::new(ops::MatMul), vec![a, b])
    }

    /// `x . W^T + b` with W: (out, in), b: (1, out).
    pub fn linear(&mut self, x: NodeId, w: NodeId, b: NodeId) -> NodeId {
        self.op(Box::new(ops::Linear), vec![x, w, b])
    }

    pub fn iderivative(&mut self, x: NodeId) -> NodeId {
        self.op(Box::new(ops::IDerivative), vec![x])
    }

    pub fn softmax(&mut self, x: NodeId) -> NodeId {
        self.op(Box::new(nn::Softmax), vec![x])
    }

    pub fn log_softmax(&mut self, x: NodeId) -> NodeId {
        self.op(Box::new(nn::LogSoftmax), vec![x])
    }

    pub fn gaussian(&mut self, x: NodeId, mu: NodeId, sigma: NodeId) -> NodeId {
        self.op(Box::new(nn::Gaussian), vec![x, mu, sigma])
    }

    pub fn log_gaussian(&mut self, x: NodeId, mu: NodeId, sigma: NodeId) -> NodeId {
        self.op(Box::new(nn::LogGaussian), vec![x, mu, sigma])
    }

    pub fn sampler(&mut self, mu: NodeId, sigma: NodeId) -> NodeId {
        self.op(Box::new(nn::Sampler::new()), vec![mu, sigma])
    }

    pub fn dropout(&mut self, x: NodeId, rate: f32) -> NodeId {
        self.op(Box::new(nn::Dropout::new(rate)), vec![x])
    }

    pub fn embedding(&mut self, indices: NodeId, table: NodeId) -> NodeId {
        self.op(Box::new(nn::Embedding), vec![indices, table])
    }

    pub fn layer_norm(&mut self, x: NodeId, a: NodeId, b: NodeId) -> NodeId {
        self.op(Box::new(nn::LayerNorm::new()), vec![x, a, b])
    }

    pub fn conv2d(&mut self, x: NodeId, kernel: NodeId, conv: nn::Conv2D) -> NodeId {
        self.op(Box::new(conv), vec![x, kernel])
    }
}
