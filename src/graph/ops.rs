//! Element-wise, reduction, shape and matrix operators.

use rand::rngs::StdRng;
use statrs::function::erf;

use crate::errors::{Error, Result};
use crate::graph::node::Operation;
use crate::tensor::Tensor;
use crate::types::Dims;

const FRAC_2_SQRT_PI: f32 = std::f32::consts::FRAC_2_SQRT_PI;
const FRAC_1_SQRT_2: f32 = std::f32::consts::FRAC_1_SQRT_2;
const INV_SQRT_2PI: f32 = 0.398_942_28;

pub(crate) fn erf_f32(x: f32) -> f32 {
    erf::erf(x as f64) as f32
}

pub(crate) fn sigmoid_f32(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Result shape of a broadcasting element-wise binary op.
///
/// Accepted pairs: equal shapes, a 1x1 scalar against anything, and a
/// row (1xC) or column (Rx1) vector against a matching matrix.
pub(crate) fn broadcast_dims(op: &'static str, a: Dims, b: Dims) -> Result<Dims> {
    if a == b {
        return Ok(a);
    }
    match (a, b) {
        ((1, 1), _) => Ok(b),
        (_, (1, 1)) => Ok(a),
        ((1, ac), (br, bc)) if ac == bc && br > 1 => Ok((br, bc)),
        ((ar, ac), (1, bc)) if ac == bc && ar > 1 => Ok((ar, ac)),
        ((ar, 1), (br, bc)) if ar == br && bc > 1 => Ok((br, bc)),
        ((ar, ac), (br, 1)) if ar == br && ac > 1 => Ok((ar, ac)),
        _ => Err(Error::shape(op, a, b)),
    }
}

/// Copy of `t` expanded to `shape`; equal shapes pass through as clones.
/// Equal-shape callers take their own fast paths first, so this only runs
/// on the broadcasting slow path.
fn materialize(op: &'static str, t: &Tensor, shape: Dims) -> Result<Tensor> {
    if t.shape() == shape {
        Ok(t.clone())
    } else {
        t.broadcast_to(shape.0, shape.1)
            .map_err(|_| Error::shape(op, shape, t.shape()))
    }
}

/// Fold a full-shape gradient contribution down into `acc`, summing over
/// any axes the input was broadcast along.
pub(crate) fn reduce_into(contrib: &Tensor, acc: &mut Tensor) {
    let full = contrib.shape();
    match acc.shape() {
        shape if shape == full => *acc += contrib,
        (1, 1) => {
            let s = contrib.sum();
            acc.set(0, 0, acc.get(0, 0) + s);
        }
        (1, c) => {
            debug_assert_eq!(c, full.1);
            for j in 0..c {
                let mut s = 0.0;
                for i in 0..full.0 {
                    s += contrib.get(i, j);
                }
                acc.set(0, j, acc.get(0, j) + s);
            }
        }
        (r, 1) => {
            debug_assert_eq!(r, full.0);
            for i in 0..r {
                let mut s = 0.0;
                for j in 0..full.1 {
                    s += contrib.get(i, j);
                }
                acc.set(i, 0, acc.get(i, 0) + s);
            }
        }
        _ => unreachable!("broadcast_dims admits no other input shape"),
    }
}

// --- Unary element-wise operators ---

macro_rules! unary_op {
    ($name:ident, $label:literal, $fwd:expr, $bwd:expr) => {
        pub struct $name;

        impl Operation for $name {
            fn name(&self) -> &'static str {
                $label
            }

            fn output_shape(&self, inputs: &[Dims]) -> Result<Dims> {
                Ok(inputs[0])
            }

            fn forward(
                &mut self,
                inputs: &[&Tensor],
                out: &mut Tensor,
                _rng: &mut StdRng,
            ) -> Result<()> {
                inputs[0].map_into(out, $fwd);
                Ok(())
            }

            fn backward_input(
                &self,
                _index: usize,
                inputs: &[&Tensor],
                value: &Tensor,
                grad: &Tensor,
                acc: &mut Tensor,
            ) -> Result<()> {
                let df = $bwd;
                grad.zip_accumulate(inputs[0], acc, |g, x| g * df(x, value));
                Ok(())
            }
        }
    };
}

unary_op!(Neg, "neg", |x: f32| -x, |_x: f32, _y: &Tensor| -1.0);
unary_op!(Abs, "abs", |x: f32| x.abs(), |x: f32, _y: &Tensor| {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
});
unary_op!(Log, "log", |x: f32| x.ln(), |x: f32, _y: &Tensor| 1.0 / x);
unary_op!(Erf, "erf", erf_f32, |x: f32, _y: &Tensor| {
    FRAC_2_SQRT_PI * (-x * x).exp()
});
unary_op!(Softplus, "softplus", |x: f32| {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}, |x: f32, _y: &Tensor| sigmoid_f32(x));
unary_op!(Gelu, "gelu", |x: f32| {
    x * 0.5 * (1.0 + erf_f32(x * FRAC_1_SQRT_2))
}, |x: f32, _y: &Tensor| {
    let phi_cdf = 0.5 * (1.0 + erf_f32(x * FRAC_1_SQRT_2));
    let phi_pdf = INV_SQRT_2PI * (-0.5 * x * x).exp();
    phi_cdf + x * phi_pdf
});

// Exp, Tanh and Sigmoid reuse the cached output in their pullbacks.

pub struct Exp;

impl Operation for Exp {
    fn name(&self) -> &'static str {
        "exp"
    }

    fn output_shape(&self, inputs: &[Dims]) -> Result<Dims> {
        Ok(inputs[0])
    }

    fn forward(&mut self, inputs: &[&Tensor], out: &mut Tensor, _rng: &mut StdRng) -> Result<()> {
        inputs[0].map_into(out, f32::exp);
        Ok(())
    }

    fn backward_input(
        &self,
        _index: usize,
        _inputs: &[&Tensor],
        value: &Tensor,
        grad: &Tensor,
        acc: &mut Tensor,
    ) -> Result<()> {
        grad.zip_accumulate(value, acc, |g, y| g * y);
        Ok(())
    }
}

pub struct Tanh;

impl Operation for Tanh {
    fn name(&self) -> &'static str {
        "tanh"
    }

    fn output_shape(&self, inputs: &[Dims]) -> Result<Dims> {
        Ok(inputs[0])
    }

    fn forward(&mut self, inputs: &[&Tensor], out: &mut Tensor, _rng: &mut StdRng) -> Result<()> {
        inputs[0].map_into(out, f32::tanh);
        Ok(())
    }

    fn backward_input(
        &self,
        _index: usize,
        _inputs: &[&Tensor],
        value: &Tensor,
        grad: &Tensor,
        acc: &mut Tensor,
    ) -> Result<()> {
        grad.zip_accumulate(value, acc, |g, y| g * (1.0 - y * y));
        Ok(())
    }
}

pub struct Sigmoid;

impl Operation for Sigmoid {
    fn name(&self) -> &'static str {
        "sigmoid"
    }

    fn output_shape(&self, inputs: &[Dims]) -> Result<Dims> {
        Ok(inputs[0])
    }

    fn forward(&mut self, inputs: &[&Tensor], out: &mut Tensor, _rng: &mut StdRng) -> Result<()> {
        inputs[0].map_into(out, sigmoid_f32);
        Ok(())
    }

    fn backward_input(
        &self,
        _index: usize,
        _inputs: &[&Tensor],
        value: &Tensor,
        grad: &Tensor,
        acc: &mut Tensor,
    ) -> Result<()> {
        grad.zip_accumulate(value, acc, |g, y| g * y * (1.0 - y));
        Ok(())
    }
}

pub struct Relu;

impl Operation for Relu {
    fn name(&self) -> &'static str {
        "relu"
    }

    fn output_shape(&self, inputs: &[Dims]) -> Result<Dims> {
        Ok(inputs[0])
    }

    fn forward(&mut self, inputs: &[&Tensor], out: &mut Tensor, _rng: &mut StdRng) -> Result<()> {
        inputs[0].map_into(out, |x| x.max(0.0));
        Ok(())
    }

    fn backward_input(
        &self,
        _index: usize,
        inputs: &[&Tensor],
        _value: &Tensor,
        grad: &Tensor,
        acc: &mut Tensor,
    ) -> Result<()> {
        grad.zip_accumulate(inputs[0], acc, |g, x| if x > 0.0 { g } else { 0.0 });
        Ok(())
    }
}

// --- Binary element-wise operators with broadcasting ---

#[derive(Clone, Copy)]
pub enum BinaryKind {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Min,
    Max,
}

pub struct Binary {
    pub kind: BinaryKind,
}

impl Binary {
    fn label(&self) -> &'static str {
        match self.kind {
            BinaryKind::Add => "add",
            BinaryKind::Sub => "sub",
            BinaryKind::Mul => "mul",
            BinaryKind::Div => "div",
            BinaryKind::Pow => "pow",
            BinaryKind::Min => "min",
            BinaryKind::Max => "max",
        }
    }

    fn apply(&self, a: f32, b: f32) -> f32 {
        match self.kind {
            BinaryKind::Add => a + b,
            BinaryKind::Sub => a - b,
            BinaryKind::Mul => a * b,
            BinaryKind::Div => a / b,
            BinaryKind::Pow => a.powf(b),
            BinaryKind::Min => a.min(b),
            BinaryKind::Max => a.max(b),
        }
    }

    /// Local derivative of the op with respect to operand `index`.
    fn partial(&self, index: usize, a: f32, b: f32) -> f32 {
        match (self.kind, index) {
            (BinaryKind::Add, _) => 1.0,
            (BinaryKind::Sub, 0) => 1.0,
            (BinaryKind::Sub, _) => -1.0,
            (BinaryKind::Mul, 0) => b,
            (BinaryKind::Mul, _) => a,
            (BinaryKind::Div, 0) => 1.0 / b,
            (BinaryKind::Div, _) => -a / (b * b),
            (BinaryKind::Pow, 0) => b * a.powf(b - 1.0),
            (BinaryKind::Pow, _) => a.powf(b) * a.ln(),
            (BinaryKind::Min, 0) => {
                if a <= b {
                    1.0
                } else {
                    0.0
                }
            }
            (BinaryKind::Min, _) => {
                if b < a {
                    1.0
                } else {
                    0.0
                }
            }
            (BinaryKind::Max, 0) => {
                if a >= b {
                    1.0
                } else {
                    0.0
                }
            }
            (BinaryKind::Max, _) => {
                if b > a {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

impl Operation for Binary {
    fn name(&self) -> &'static str {
        self.label()
    }

    fn output_shape(&self, inputs: &[Dims]) -> Result<Dims> {
        broadcast_dims(self.label(), inputs[0], inputs[1])
    }

    fn forward(&mut self, inputs: &[&Tensor], out: &mut Tensor, _rng: &mut StdRng) -> Result<()> {
        let (a, b) = (inputs[0], inputs[1]);
        if a.shape() == b.shape() {
            let kind = *self;
            a.zip_into(b, out, move |x, y| kind.apply(x, y));
            return Ok(());
        }
        let shape = out.shape();
        let a = materialize(self.label(), a, shape)?;
        let b = materialize(self.label(), b, shape)?;
        let kind = *self;
        a.zip_into(&b, out, move |x, y| kind.apply(x, y));
        Ok(())
    }

    fn backward_input(
        &self,
        index: usize,
        inputs: &[&Tensor],
        _value: &Tensor,
        grad: &Tensor,
        acc: &mut Tensor,
    ) -> Result<()> {
        let shape = grad.shape();
        let same = inputs[0].shape() == shape && inputs[1].shape() == shape;
        let kind = *self;
        if same && acc.shape() == shape {
            // Fast path: no broadcasting anywhere.
            let (a, b) = (inputs[0], inputs[1]);
            let ga = grad.as_slice();
            let (xa, xb) = (a.as_slice(), b.as_slice());
            for (i, o) in acc.as_slice_mut().iter_mut().enumerate() {
                *o += ga[i] * kind.partial(index, xa[i], xb[i]);
            }
            return Ok(());
        }
        let a = materialize(self.label(), inputs[0], shape)?;
        let b = materialize(self.label(), inputs[1], shape)?;
        let mut contrib = Tensor::zeros(shape.0, shape.1);
        {
            let ga = grad.as_slice();
            let (xa, xb) = (a.as_slice(), b.as_slice());
            for (i, o) in contrib.as_slice_mut().iter_mut().enumerate() {
                *o = ga[i] * kind.partial(index, xa[i], xb[i]);
            }
        }
        reduce_into(&contrib, acc);
        Ok(())
    }
}

impl Clone for Binary {
    fn clone(&self) -> Self {
        Self { kind: self.kind }
    }
}

impl Copy for Binary {}

// --- Reductions ---

pub struct Sum;

impl Operation for Sum {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn output_shape(&self, _inputs: &[Dims]) -> Result<Dims> {
        Ok((1, 1))
    }

    fn forward(&mut self, inputs: &[&Tensor], out: &mut Tensor, _rng: &mut StdRng) -> Result<()> {
        out.set(0, 0, inputs[0].sum());
        Ok(())
    }

    fn backward_input(
        &self,
        _index: usize,
        _inputs: &[&Tensor],
        _value: &Tensor,
        grad: &Tensor,
        acc: &mut Tensor,
    ) -> Result<()> {
        let g = grad.get(0, 0);
        for v in acc.as_slice_mut() {
            *v += g;
        }
        Ok(())
    }
}

pub struct Mean;

impl Operation for Mean {
    fn name(&self) -> &'static str {
        "mean"
    }

    fn output_shape(&self, _inputs: &[Dims]) -> Result<Dims> {
        Ok((1, 1))
    }

    fn forward(&mut self, inputs: &[&Tensor], out: &mut Tensor, _rng: &mut StdRng) -> Result<()> {
        out.set(0, 0, inputs[0].mean());
        Ok(())
    }

    fn backward_input(
        &self,
        _index: usize,
        inputs: &[&Tensor],
        _value: &Tensor,
        grad: &Tensor,
        acc: &mut Tensor,
    ) -> Result<()> {
        let g = grad.get(0, 0) / inputs[0].len() as f32;
        for v in acc.as_slice_mut() {
            *v += g;
        }
        Ok(())
    }
}

// --- Shape operators ---

pub struct Transpose;

impl Operation for Transpose {
    fn name(&self) -> &'static str {
        "transpose"
    }

    fn output_shape(&self, inputs: &[Dims]) -> Result<Dims> {
        Ok((inputs[0].1, inputs[0].0))
    }

    fn forward(&mut self, inputs: &[&Tensor], out: &mut Tensor, _rng: &mut StdRng) -> Result<()> {
        let x = inputs[0];
        for i in 0..x.rows() {
            for j in 0..x.cols() {
                out.set(j, i, x.get(i, j));
            }
        }
        Ok(())
    }

    fn backward_input(
        &self,
        _index: usize,
        _inputs: &[&Tensor],
        _value: &Tensor,
        grad: &Tensor,
        acc: &mut Tensor,
    ) -> Result<()> {
        for i in 0..grad.rows() {
            for j in 0..grad.cols() {
                acc.set(j, i, acc.get(j, i) + grad.get(i, j));
            }
        }
        Ok(())
    }
}

pub struct Reshape {
    pub rows: usize,
    pub cols: usize,
}

impl Operation for Reshape {
    fn name(&self) -> &'static str {
        "reshape"
    }

    fn output_shape(&self, inputs: &[Dims]) -> Result<Dims> {
        let (r, c) = inputs[0];
        if r * c != self.rows * self.cols {
            return Err(Error::shape("reshape", (self.rows, self.cols), (r, c)));
        }
        Ok((self.rows, self.cols))
    }

    fn forward(&mut self, inputs: &[&Tensor], out: &mut Tensor, _rng: &mut StdRng) -> Result<()> {
        out.as_slice_mut().copy_from_slice(inputs[0].as_slice());
        Ok(())
    }

    fn backward_input(
        &self,
        _index: usize,
        _inputs: &[&Tensor],
        _value: &Tensor,
        grad: &Tensor,
        acc: &mut Tensor,
    ) -> Result<()> {
        for (o, &g) in acc.as_slice_mut().iter_mut().zip(grad.as_slice()) {
            *o += g;
        }
        Ok(())
    }
}

/// Rectangular crop of the input.
pub struct Split {
    pub row: usize,
    pub col: usize,
    pub rows: usize,
    pub cols: usize,
}

impl Operation for Split {
    fn name(&self) -> &'static str {
        "split"
    }

    fn output_shape(&self, inputs: &[Dims]) -> Result<Dims> {
        let (r, c) = inputs[0];
        if self.row + self.rows > r || self.col + self.cols > c {
            return Err(Error::shape("split", (self.rows, self.cols), (r, c)));
        }
        Ok((self.rows, self.cols))
    }

    fn forward(&mut self, inputs: &[&Tensor], out: &mut Tensor, _rng: &mut StdRng) -> Result<()> {
        inputs[0].read_block_into(self.row, self.col, out)
    }

    fn backward_input(
        &self,
        _index: usize,
        _inputs: &[&Tensor],
        _value: &Tensor,
        grad: &Tensor,
        acc: &mut Tensor,
    ) -> Result<()> {
        acc.add_block(self.row, self.col, grad)
    }
}

/// Row-major element concatenation of two inputs into a target shape.
pub struct Join {
    pub rows: usize,
    pub cols: usize,
}

impl Operation for Join {
    fn name(&self) -> &'static str {
        "join"
    }

    fn output_shape(&self, inputs: &[Dims]) -> Result<Dims> {
        let total = inputs[0].0 * inputs[0].1 + inputs[1].0 * inputs[1].1;
        if total != self.rows * self.cols {
            return Err(Error::shape("join", (self.rows, self.cols), inputs[0]));
        }
        Ok((self.rows, self.cols))
    }

    fn forward(&mut self, inputs: &[&Tensor], out: &mut Tensor, _rng: &mut StdRng) -> Result<()> {
        let split = inputs[0].len();
        let slice = out.as_slice_mut();
        slice[..split].copy_from_slice(inputs[0].as_slice());
        slice[split..].copy_from_slice(inputs[1].as_slice());
        Ok(())
    }

    fn backward_input(
        &self,
        index: usize,
        inputs: &[&Tensor],
        _value: &Tensor,
        grad: &Tensor,
        acc: &mut Tensor,
    ) -> Result<()> {
        let offset = if index == 0 { 0 } else { inputs[0].len() };
        let g = grad.as_slice();
        for (i, o) in acc.as_slice_mut().iter_mut().enumerate() {
            *o += g[offset + i];
        }
        Ok(())
    }
}

/// Expand a scalar, row or column input to a fixed target shape.
pub struct Broadcast {
    pub rows: usize,
    pub cols: usize,
}

impl Operation for Broadcast {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    fn output_shape(&self, inputs: &[Dims]) -> Result<Dims> {
        match inputs[0] {
            (1, 1) => Ok((self.rows, self.cols)),
            (1, c) if c == self.cols => Ok((self.rows, self.cols)),
            (r, 1) if r == self.rows => Ok((self.rows, self.cols)),
            found => Err(Error::shape("broadcast", (self.rows, self.cols), found)),
        }
    }

    fn forward(&mut self, inputs: &[&Tensor], out: &mut Tensor, _rng: &mut StdRng) -> Result<()> {
        let x = inputs[0];
        let shape = x.shape();
        for i in 0..self.rows {
            for j in 0..self.cols {
                let v = match shape {
                    (1, 1) => x.get(0, 0),
                    (1, _) => x.get(0, j),
                    _ => x.get(i, 0),
                };
                out.set(i, j, v);
            }
        }
        Ok(())
    }

    fn backward_input(
        &self,
        _index: usize,
        _inputs: &[&Tensor],
        _value: &Tensor,
        grad: &Tensor,
        acc: &mut Tensor,
    ) -> Result<()> {
        reduce_into(grad, acc);
        Ok(())
    }
}

// --- Matrix operators ---

pub struct MatMul;

impl Operation for MatMul {
    fn name(&self) -> &'static str {
        "product"
    }

    fn output_shape(&self, inputs: &[Dims]) -> Result<Dims> {
        let (a, b) = (inputs[0], inputs[1]);
        if a.1 != b.0 {
            return Err(Error::shape("product", a, b));
        }
        Ok((a.0, b.1))
    }

    fn forward(&mut self, inputs: &[&Tensor], out: &mut Tensor, _rng: &mut StdRng) -> Result<()> {
        Tensor::matmul_t(inputs[0], false, inputs[1], false, 0.0, out)
    }

    fn backward_input(
        &self,
        index: usize,
        inputs: &[&Tensor],
        _value: &Tensor,
        grad: &Tensor,
        acc: &mut Tensor,
    ) -> Result<()> {
        match index {
            // dA += G · B^T
            0 => Tensor::matmul_t(grad, false, inputs[1], true, 1.0, acc),
            // dB += A^T · G
            _ => Tensor::matmul_t(inputs[0], true, grad, false, 1.0, acc),
        }
    }
}

/// Affine map `y = x · W^T + b`, W: (out, in), b: (1, out).
pub struct Linear;

impl Operation for Linear {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn output_shape(&self, inputs: &[Dims]) -> Result<Dims> {
        let (x, w, b) = (inputs[0], inputs[1], inputs[2]);
        if x.1 != w.1 {
            return Err(Error::shape("linear", (x.0, w.1), x));
        }
        if b != (1, w.0) {
            return Err(Error::shape("linear", (1, w.0), b));
        }
        Ok((x.0, w.0))
    }

    fn forward(&mut self, inputs: &[&Tensor], out: &mut Tensor, _rng: &mut StdRng) -> Result<()> {
        let (x, w, b) = (inputs[0], inputs[1], inputs[2]);
        Tensor::matmul_t(x, false, w, true, 0.0, out)?;
        for i in 0..out.rows() {
            for j in 0..out.cols() {
                out.set(i, j, out.get(i, j) + b.get(0, j));
            }
        }
        Ok(())
    }

    fn backward_input(
        &self,
        index: usize,
        inputs: &[&Tensor],
        _value: &Tensor,
        grad: &Tensor,
        acc: &mut Tensor,
    ) -> Result<()> {
        match index {
            // dX += G · W
            0 => Tensor::matmul_t(grad, false, inputs[1], false, 1.0, acc),
            // dW += G^T · X
            1 => Tensor::matmul_t(grad, true, inputs[0], false, 1.0, acc),
            // db += column sums of G
            _ => {
                for j in 0..grad.cols() {
                    let mut s = 0.0;
                    for i in 0..grad.rows() {
                        s += grad.get(i, j);
                    }
                    acc.set(0, j, acc.get(0, j) + s);
                }
                Ok(())
            }
        }
    }
}

/// Identity with a pass-through pullback; routes an externally supplied
/// gradient into an inner subgraph without duplicating it.
pub struct IDerivative;

impl Operation for IDerivative {
    fn name(&self) -> &'static str {
        "iderivative"
    }

    fn output_shape(&self, inputs: &[Dims]) -> Result<Dims> {
        Ok(inputs[0])
    }

    fn forward(&mut self, inputs: &[&Tensor], out: &mut Tensor, _rng: &mut StdRng) -> Result<()> {
        out.copy_from(inputs[0])
    }

    fn backward_input(
        &self,
        _index: usize,
        _inputs: &[&Tensor],
        _value: &Tensor,
        grad: &Tensor,
        acc: &mut Tensor,
    ) -> Result<()> {
        *acc += grad;
        Ok(())
    }
}
