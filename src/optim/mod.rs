//! Optimizers over a graph's variable list.
//!
//! Moment accumulators are allocated on the first `step` and reused, so a
//! warmed-up training loop takes no further allocations here.

use crate::errors::Result;
use crate::graph::Graph;
use crate::tensor::Tensor;
use crate::types::NodeId;

pub trait Optimizer {
    /// Apply one update to every tracked variable using its current
    /// gradient. Variables without a gradient (backward never reached
    /// them) are left untouched.
    fn step(&mut self, graph: &mut Graph) -> Result<()>;

    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, lr: f32);
}

pub struct Sgd {
    vars: Vec<NodeId>,
    lr: f32,
}

impl Sgd {
    pub fn new(vars: Vec<NodeId>, lr: f32) -> Self {
        Self { vars, lr }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, graph: &mut Graph) -> Result<()> {
        for &id in &self.vars {
            let (value, grad) = graph.variable_parts_mut(id);
            if let Some(grad) = grad {
                let lr = self.lr;
                for (v, g) in value.as_slice_mut().iter_mut().zip(grad.as_slice()) {
                    *v -= lr * g;
                }
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }
}

/// Adam with the usual defaults (beta1 0.9, beta2 0.999, eps 1e-8) and
/// per-step bias correction.
pub struct Adam {
    vars: Vec<NodeId>,
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    step_count: u64,
    m: Vec<Option<Tensor>>,
    v: Vec<Option<Tensor>>,
}

impl Adam {
    pub fn new(vars: Vec<NodeId>, lr: f32) -> Self {
        let n = vars.len();
        Self {
            vars,
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            step_count: 0,
            m: (0..n).map(|_| None).collect(),
            v: (0..n).map(|_| None).collect(),
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, graph: &mut Graph) -> Result<()> {
        self.step_count += 1;
        let c1 = 1.0 - self.beta1.powi(self.step_count as i32);
        let c2 = 1.0 - self.beta2.powi(self.step_count as i32);
        for (i, &id) in self.vars.iter().enumerate() {
            let (value, grad) = graph.variable_parts_mut(id);
            let grad = match grad {
                Some(g) => g,
                None => continue,
            };
            let (rows, cols) = value.shape();
            let m = self.m[i].get_or_insert_with(|| Tensor::zeros(rows, cols));
            let v = self.v[i].get_or_insert_with(|| Tensor::zeros(rows, cols));
            let (b1, b2, eps, lr) = (self.beta1, self.beta2, self.eps, self.lr);
            for (((p, g), m), v) in value
                .as_slice_mut()
                .iter_mut()
                .zip(grad.as_slice())
                .zip(m.as_slice_mut())
                .zip(v.as_slice_mut())
            {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                let m_hat = *m / c1;
                let v_hat = *v / c2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }
}

/// Adam without bias correction, for continual settings where the step
/// count never resets.
pub struct AdamNc {
    vars: Vec<NodeId>,
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    m: Vec<Option<Tensor>>,
    v: Vec<Option<Tensor>>,
}

impl AdamNc {
    pub fn new(vars: Vec<NodeId>, lr: f32) -> Self {
        let n = vars.len();
        Self {
            vars,
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            m: (0..n).map(|_| None).collect(),
            v: (0..n).map(|_| None).collect(),
        }
    }
}

impl Optimizer for AdamNc {
    fn step(&mut self, graph: &mut Graph) -> Result<()> {
        for (i, &id) in self.vars.iter().enumerate() {
            let (value, grad) = graph.variable_parts_mut(id);
            let grad = match grad {
                Some(g) => g,
                None => continue,
            };
            let (rows, cols) = value.shape();
            let m = self.m[i].get_or_insert_with(|| Tensor::zeros(rows, cols));
            let v = self.v[i].get_or_insert_with(|| Tensor::zeros(rows, cols));
            let (b1, b2, eps, lr) = (self.beta1, self.beta2, self.eps, self.lr);
            for (((p, g), m), v) in value
                .as_slice_mut()
                .iter_mut()
                .zip(grad.as_slice())
                .zip(m.as_slice_mut())
                .zip(v.as_slice_mut())
            {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                *p -= lr * *m / (v.sqrt() + eps);
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }
}

/// Yogi: Adam's first moment with an additive-sign second-moment update,
/// `v <- v - (1 - beta2) sign(v - g^2) g^2`.
pub struct Yogi {
    vars: Vec<NodeId>,
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    step_count: u64,
    m: Vec<Option<Tensor>>,
    v: Vec<Option<Tensor>>,
}

impl Yogi {
    pub fn new(vars: Vec<NodeId>, lr: f32) -> Self {
        let n = vars.len();
        Self {
            vars,
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            step_count: 0,
            m: (0..n).map(|_| None).collect(),
            v: (0..n).map(|_| None).collect(),
        }
    }
}

impl Optimizer for Yogi {
    fn step(&mut self, graph: &mut Graph) -> Result<()> {
        self.step_count += 1;
        let c1 = 1.0 - self.beta1.powi(self.step_count as i32);
        let c2 = 1.0 - self.beta2.powi(self.step_count as i32);
        for (i, &id) in self.vars.iter().enumerate() {
            let (value, grad) = graph.variable_parts_mut(id);
            let grad = match grad {
                Some(g) => g,
                None => continue,
            };
            let (rows, cols) = value.shape();
            let m = self.m[i].get_or_insert_with(|| Tensor::zeros(rows, cols));
            let v = self.v[i].get_or_insert_with(|| Tensor::zeros(rows, cols));
            let (b1, b2, eps, lr) = (self.beta1, self.beta2, self.eps, self.lr);
            for (((p, g), m), v) in value
                .as_slice_mut()
                .iter_mut()
                .zip(grad.as_slice())
                .zip(m.as_slice_mut())
                .zip(v.as_slice_mut())
            {
                let g2 = g * g;
                *m = b1 * *m + (1.0 - b1) * g;
                *v -= (1.0 - b2) * (*v - g2).signum() * g2;
                let m_hat = *m / c1;
                let v_hat = *v / c2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }
}

/// RMSProp: exponential second-moment decay with a direct step.
pub struct RmsProp {
    vars: Vec<NodeId>,
    lr: f32,
    alpha: f32,
    eps: f32,
    v: Vec<Option<Tensor>>,
}

impl RmsProp {
    pub fn new(vars: Vec<NodeId>, lr: f32, alpha: f32) -> Self {
        let n = vars.len();
        Self {
            vars,
            lr,
            alpha,
            eps: 1e-8,
            v: (0..n).map(|_| None).collect(),
        }
    }
}

impl Optimizer for RmsProp {
    fn step(&mut self, graph: &mut Graph) -> Result<()> {
        for (i, &id) in self.vars.iter().enumerate() {
            let (value, grad) = graph.variable_parts_mut(id);
            let grad = match grad {
                Some(g) => g,
                None => continue,
            };
            let (rows, cols) = value.shape();
            let v = self.v[i].get_or_insert_with(|| Tensor::zeros(rows, cols));
            let (alpha, eps, lr) = (self.alpha, self.eps, self.lr);
            for ((p, g), v) in value
                .as_slice_mut()
                .iter_mut()
                .zip(grad.as_slice())
                .zip(v.as_slice_mut())
            {
                *v = alpha * *v + (1.0 - alpha) * g * g;
                *p -= lr * g / (*v + eps).sqrt();
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }
}
