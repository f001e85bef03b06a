//! Probabilistic, regularization, sequence and spatial operators.

use ndarray_rand::rand_distr::StandardNormal;
use rand::rngs::StdRng;
use rand::Rng;

use crate::errors::{Error, Result};
use crate::graph::node::Operation;
use crate::tensor::Tensor;
use crate::types::Dims;

const LN_2PI: f32 = 1.837_877_1;

/// Numerically stable row-wise softmax.
pub struct Softmax;

impl Operation for Softmax {
    fn name(&self) -> &'static str {
        "softmax"
    }

    fn output_shape(&self, inputs: &[Dims]) -> Result<Dims> {
        Ok(inputs[0])
    }

    fn forward(&mut self, inputs: &[&Tensor], out: &mut Tensor, _rng: &mut StdRng) -> Result<()> {
        let x = inputs[0];
        for i in 0..x.rows() {
            let mut max = f32::NEG_INFINITY;
            for j in 0..x.cols() {
                max = max.max(x.get(i, j));
            }
            let mut sum = 0.0;
            for j in 0..x.cols() {
                let e = (x.get(i, j) - max).exp();
                out.set(i, j, e);
                sum += e;
            }
            for j in 0..x.cols() {
                out.set(i, j, out.get(i, j) / sum);
            }
        }
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
        // Per row: dz = (g - (g . y) 1) (*) y
        for i in 0..value.rows() {
            let mut dot = 0.0;
            for j in 0..value.cols() {
                dot += grad.get(i, j) * value.get(i, j);
            }
            for j in 0..value.cols() {
                let d = value.get(i, j) * (grad.get(i, j) - dot);
                acc.set(i, j, acc.get(i, j) + d);
            }
        }
        Ok(())
    }
}

/// Row-wise `z - logsumexp(z)`.
pub struct LogSoftmax;

impl Operation for LogSoftmax {
    fn name(&self) -> &'static str {
        "log_softmax"
    }

    fn output_shape(&self, inputs: &[Dims]) -> Result<Dims> {
        Ok(inputs[0])
    }

    fn forward(&mut self, inputs: &[&Tensor], out: &mut Tensor, _rng: &mut StdRng) -> Result<()> {
        let x = inputs[0];
        for i in 0..x.rows() {
            let mut max = f32::NEG_INFINITY;
            for j in 0..x.cols() {
                max = max.max(x.get(i, j));
            }
            let mut sum = 0.0;
            for j in 0..x.cols() {
                sum += (x.get(i, j) - max).exp();
            }
            let lse = max + sum.ln();
            for j in 0..x.cols() {
                out.set(i, j, x.get(i, j) - lse);
            }
        }
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
        // dz = g - softmax(z) * rowsum(g), softmax(z) = exp(value)
        for i in 0..value.rows() {
            let mut gsum = 0.0;
            for j in 0..value.cols() {
                gsum += grad.get(i, j);
            }
            for j in 0..value.cols() {
                let d = grad.get(i, j) - value.get(i, j).exp() * gsum;
                acc.set(i, j, acc.get(i, j) + d);
            }
        }
        Ok(())
    }
}

fn same_three(op: &'static str, inputs: &[Dims]) -> Result<Dims> {
    if inputs[0] != inputs[1] || inputs[0] != inputs[2] {
        return Err(Error::shape(op, inputs[0], inputs[1]));
    }
    Ok(inputs[0])
}

/// Element-wise normal density N(x; mu, sigma).
pub struct Gaussian;

impl Operation for Gaussian {
    fn name(&self) -> &'static str {
        "gaussian"
    }

    fn output_shape(&self, inputs: &[Dims]) -> Result<Dims> {
        same_three("gaussian", inputs)
    }

    fn forward(&mut self, inputs: &[&Tensor], out: &mut Tensor, _rng: &mut StdRng) -> Result<()> {
        let (x, mu, sigma) = (inputs[0], inputs[1], inputs[2]);
        for i in 0..x.rows() {
            for j in 0..x.cols() {
                let z = (x.get(i, j) - mu.get(i, j)) / sigma.get(i, j);
                let p = (-0.5 * z * z).exp() / (sigma.get(i, j) * (2.0 * std::f32::consts::PI).sqrt());
                out.set(i, j, p);
            }
        }
        Ok(())
    }

    fn backward_input(
        &self,
        index: usize,
        inputs: &[&Tensor],
        value: &Tensor,
        grad: &Tensor,
        acc: &mut Tensor,
    ) -> Result<()> {
        let (x, mu, sigma) = (inputs[0], inputs[1], inputs[2]);
        for i in 0..x.rows() {
            for j in 0..x.cols() {
                let s = sigma.get(i, j);
                let d = x.get(i, j) - mu.get(i, j);
                let p = value.get(i, j);
                let partial = match index {
                    0 => -p * d / (s * s),
                    1 => p * d / (s * s),
                    _ => p * (d * d / (s * s * s) - 1.0 / s),
                };
                acc.set(i, j, acc.get(i, j) + grad.get(i, j) * partial);
            }
        }
        Ok(())
    }
}

/// Element-wise log-density of the normal distribution.
pub struct LogGaussian;

impl Operation for LogGaussian {
    fn name(&self) -> &'static str {
        "log_gaussian"
    }

    fn output_shape(&self, inputs: &[Dims]) -> Result<Dims> {
        same_three("log_gaussian", inputs)
    }

    fn forward(&mut self, inputs: &[&Tensor], out: &mut Tensor, _rng: &mut StdRng) -> Result<()> {
        let (x, mu, sigma) = (inputs[0], inputs[1], inputs[2]);
        for i in 0..x.rows() {
            for j in 0..x.cols() {
                let s = sigma.get(i, j);
                let z = (x.get(i, j) - mu.get(i, j)) / s;
                out.set(i, j, -0.5 * z * z - s.ln() - 0.5 * LN_2PI);
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
        let (x, mu, sigma) = (inputs[0], inputs[1], inputs[2]);
        for i in 0..x.rows() {
            for j in 0..x.cols() {
                let s = sigma.get(i, j);
                let d = x.get(i, j) - mu.get(i, j);
                let partial = match index {
                    0 => -d / (s * s),
                    1 => d / (s * s),
                    _ => d * d / (s * s * s) - 1.0 / s,
                };
                acc.set(i, j, acc.get(i, j) + grad.get(i, j) * partial);
            }
        }
        Ok(())
    }
}

/// Reparameterized normal sample `mu + sigma (*) eps`, eps ~ N(0, 1).
/// The noise draw is cached for the epoch so backward sees the same eps.
pub struct Sampler {
    eps: Option<Tensor>,
}

impl Sampler {
    pub fn new() -> Self {
        Self { eps: None }
    }
}

impl Operation for Sampler {
    fn name(&self) -> &'static str {
        "sampler"
    }

    fn output_shape(&self, inputs: &[Dims]) -> Result<Dims> {
        if inputs[0] != inputs[1] {
            return Err(Error::shape("sampler", inputs[0], inputs[1]));
        }
        Ok(inputs[0])
    }

    fn forward(&mut self, inputs: &[&Tensor], out: &mut Tensor, rng: &mut StdRng) -> Result<()> {
        let (mu, sigma) = (inputs[0], inputs[1]);
        let (rows, cols) = mu.shape();
        let mut eps = match self.eps.take() {
            Some(t) if t.shape() == (rows, cols) => t,
            _ => Tensor::zeros(rows, cols),
        };
        for v in eps.as_slice_mut() {
            *v = rng.sample::<f32, _>(StandardNormal);
        }
        for i in 0..rows {
            for j in 0..cols {
                out.set(i, j, mu.get(i, j) + sigma.get(i, j) * eps.get(i, j));
            }
        }
        self.eps = Some(eps);
        Ok(())
    }

    fn backward_input(
        &self,
        index: usize,
        _inputs: &[&Tensor],
        _value: &Tensor,
        grad: &Tensor,
        acc: &mut Tensor,
    ) -> Result<()> {
        match index {
            0 => {
                *acc += grad;
                Ok(())
            }
            _ => {
                let eps = self
                    .eps
                    .as_ref()
                    .expect("sampler backward follows forward");
                grad.zip_accumulate(eps, acc, |g, e| g * e);
                Ok(())
            }
        }
    }
}

/// Inverted dropout: mask ~ Bernoulli(1-r) / (1-r), fixed per forward.
pub struct Dropout {
    rate: f32,
    mask: Option<Tensor>,
}

impl Dropout {
    pub fn new(rate: f32) -> Self {
        Self { rate, mask: None }
    }
}

impl Operation for Dropout {
    fn name(&self) -> &'static str {
        "dropout"
    }

    fn output_shape(&self, inputs: &[Dims]) -> Result<Dims> {
        Ok(inputs[0])
    }

    fn forward(&mut self, inputs: &[&Tensor], out: &mut Tensor, rng: &mut StdRng) -> Result<()> {
        let x = inputs[0];
        if self.rate == 0.0 {
            // Identity; no RNG is consumed.
            out.copy_from(x)?;
            self.mask = None;
            return Ok(());
        }
        let keep = 1.0 - self.rate;
        let scale = 1.0 / keep;
        let (rows, cols) = x.shape();
        let mut mask = match self.mask.take() {
            Some(t) if t.shape() == (rows, cols) => t,
            _ => Tensor::zeros(rows, cols),
        };
        for v in mask.as_slice_mut() {
            *v = if rng.gen::<f32>() < keep { scale } else { 0.0 };
        }
        x.zip_into(&mask, out, |a, m| a * m);
        self.mask = Some(mask);
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
        match &self.mask {
            None => {
                *acc += grad;
                Ok(())
            }
            Some(mask) => {
                grad.zip_accumulate(mask, acc, |g, m| g * m);
                Ok(())
            }
        }
    }
}

/// Row lookup: stacks rows of the table selected by integer-valued indices.
/// Duplicate indices accumulate their gradients in the table.
pub struct Embedding;

impl Operation for Embedding {
    fn name(&self) -> &'static str {
        "embedding"
    }

    fn output_shape(&self, inputs: &[Dims]) -> Result<Dims> {
        let count = inputs[0].0 * inputs[0].1;
        Ok((count, inputs[1].1))
    }

    fn forward(&mut self, inputs: &[&Tensor], out: &mut Tensor, _rng: &mut StdRng) -> Result<()> {
        let (indices, table) = (inputs[0], inputs[1]);
        for (k, &raw) in indices.as_slice().iter().enumerate() {
            let idx = raw as usize;
            if raw < 0.0 || idx >= table.rows() {
                return Err(Error::shape("embedding", (table.rows(), table.cols()), (idx, 0)));
            }
            for j in 0..table.cols() {
                out.set(k, j, table.get(idx, j));
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
        // The index vector itself is not differentiable.
        if index == 0 {
            return Ok(());
        }
        let indices = inputs[0];
        for (k, &raw) in indices.as_slice().iter().enumerate() {
            let idx = raw as usize;
            for j in 0..grad.cols() {
                acc.set(idx, j, acc.get(idx, j) + grad.get(k, j));
            }
        }
        Ok(())
    }
}

/// Per-row normalization with trainable scale A and shift B (both 1xC).
pub struct LayerNorm {
    epsilon: f32,
    xhat: Option<Tensor>,
    inv_std: Option<Tensor>,
}

impl LayerNorm {
    pub fn new() -> Self {
        Self {
            epsilon: 1e-8,
            xhat: None,
            inv_std: None,
        }
    }
}

impl Operation for LayerNorm {
    fn name(&self) -> &'static str {
        "layer_norm"
    }

    fn output_shape(&self, inputs: &[Dims]) -> Result<Dims> {
        let (x, a, b) = (inputs[0], inputs[1], inputs[2]);
        if a != (1, x.1) {
            return Err(Error::shape("layer_norm", (1, x.1), a));
        }
        if b != (1, x.1) {
            return Err(Error::shape("layer_norm", (1, x.1), b));
        }
        Ok(x)
    }

    fn forward(&mut self, inputs: &[&Tensor], out: &mut Tensor, _rng: &mut StdRng) -> Result<()> {
        let (x, a, b) = (inputs[0], inputs[1], inputs[2]);
        let (rows, cols) = x.shape();
        let n = cols as f32;
        let mut xhat = match self.xhat.take() {
            Some(t) if t.shape() == (rows, cols) => t,
            _ => Tensor::zeros(rows, cols),
        };
        let mut inv_std = match self.inv_std.take() {
            Some(t) if t.shape() == (rows, 1) => t,
            _ => Tensor::zeros(rows, 1),
        };
        for i in 0..rows {
            let mut mean = 0.0;
            for j in 0..cols {
                mean += x.get(i, j);
            }
            mean /= n;
            let mut var = 0.0;
            for j in 0..cols {
                let d = x.get(i, j) - mean;
                var += d * d;
            }
            var /= n;
            let inv = 1.0 / (var + self.epsilon).sqrt();
            inv_std.set(i, 0, inv);
            for j in 0..cols {
                let h = (x.get(i, j) - mean) * inv;
                xhat.set(i, j, h);
                out.set(i, j, a.get(0, j) * h + b.get(0, j));
            }
        }
        self.xhat = Some(xhat);
        self.inv_std = Some(inv_std);
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
        let a = inputs[1];
        let xhat = self.xhat.as_ref().expect("layer_norm backward follows forward");
        let inv_std = self.inv_std.as_ref().expect("layer_norm backward follows forward");
        let (rows, cols) = grad.shape();
        let n = cols as f32;
        match index {
            0 => {
                for i in 0..rows {
                    let mut m1 = 0.0;
                    let mut m2 = 0.0;
                    for j in 0..cols {
                        let dh = grad.get(i, j) * a.get(0, j);
                        m1 += dh;
                        m2 += dh * xhat.get(i, j);
                    }
                    m1 /= n;
                    m2 /= n;
                    let inv = inv_std.get(i, 0);
                    for j in 0..cols {
                        let dh = grad.get(i, j) * a.get(0, j);
                        let dx = inv * (dh - m1 - xhat.get(i, j) * m2);
                        acc.set(i, j, acc.get(i, j) + dx);
                    }
                }
            }
            1 => {
                for j in 0..cols {
                    let mut s = 0.0;
                    for i in 0..rows {
                        s += grad.get(i, j) * xhat.get(i, j);
                    }
                    acc.set(0, j, acc.get(0, j) + s);
                }
            }
            _ => {
                for j in 0..cols {
                    let mut s = 0.0;
                    for i in 0..rows {
                        s += grad.get(i, j);
                    }
                    acc.set(0, j, acc.get(0, j) + s);
                }
            }
        }
        Ok(())
    }
}

/// 2-D convolution over a flattened channel-major-row-major row vector.
///
/// Input is 1 x (in_ch * in_r * in_c); the kernel tensor packs blocks as
/// (out_ch * k_r, in_ch * k_c); output is 1 x (out_ch * out_r * out_c).
/// Forward goes through an im2col patch matrix reused across epochs.
pub struct Conv2D {
    pub in_rows: usize,
    pub in_cols: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub k_rows: usize,
    pub k_cols: usize,
    pub stride: usize,
    pub padding: usize,
    pub dilation: usize,
    patches: Option<Tensor>,
    kmat: Option<Tensor>,
    y2: Option<Tensor>,
}

impl Conv2D {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_rows: usize,
        in_cols: usize,
        in_channels: usize,
        out_channels: usize,
        k_rows: usize,
        k_cols: usize,
        stride: usize,
        padding: usize,
        dilation: usize,
    ) -> Self {
        Self {
            in_rows,
            in_cols,
            in_channels,
            out_channels,
            k_rows,
            k_cols,
            stride,
            padding,
            dilation,
            patches: None,
            kmat: None,
            y2: None,
        }
    }

    fn out_extent(&self, input: usize, kernel: usize) -> Option<usize> {
        let span = (input + 2 * self.padding) as isize
            - (self.dilation * (kernel - 1) + 1) as isize;
        if span < 0 {
            return None;
        }
        Some(span as usize / self.stride + 1)
    }

    pub fn out_rows(&self) -> usize {
        self.out_extent(self.in_rows, self.k_rows).unwrap_or(0)
    }

    pub fn out_cols(&self) -> usize {
        self.out_extent(self.in_cols, self.k_cols).unwrap_or(0)
    }

    /// Source pixel (channel-major-row-major flat offset) for a patch cell,
    /// or None when it falls into padding.
    fn source_offset(&self, ic: usize, kr: usize, kc: usize, orow: usize, ocol: usize) -> Option<usize> {
        let ir = (orow * self.stride + kr * self.dilation) as isize - self.padding as isize;
        let icol = (ocol * self.stride + kc * self.dilation) as isize - self.padding as isize;
        if ir < 0 || ir >= self.in_rows as isize || icol < 0 || icol >= self.in_cols as isize {
            return None;
        }
        Some(ic * self.in_rows * self.in_cols + ir as usize * self.in_cols + icol as usize)
    }
}

impl Operation for Conv2D {
    fn name(&self) -> &'static str {
        "conv2d"
    }

    fn output_shape(&self, inputs: &[Dims]) -> Result<Dims> {
        let expected_x = (1, self.in_channels * self.in_rows * self.in_cols);
        if inputs[0] != expected_x {
            return Err(Error::shape("conv2d", expected_x, inputs[0]));
        }
        let expected_k = (
            self.out_channels * self.k_rows,
            self.in_channels * self.k_cols,
        );
        if inputs[1] != expected_k {
            return Err(Error::shape("conv2d", expected_k, inputs[1]));
        }
        let (orows, ocols) = (
            self.out_extent(self.in_rows, self.k_rows),
            self.out_extent(self.in_cols, self.k_cols),
        );
        match (orows, ocols) {
            (Some(r), Some(c)) if r > 0 && c > 0 => Ok((1, self.out_channels * r * c)),
            _ => Err(Error::shape("conv2d", expected_x, inputs[0])),
        }
    }

    fn forward(&mut self, inputs: &[&Tensor], out: &mut Tensor, _rng: &mut StdRng) -> Result<()> {
        let (x, kernel) = (inputs[0], inputs[1]);
        let (orows, ocols) = (self.out_rows(), self.out_cols());
        let patch_rows = self.in_channels * self.k_rows * self.k_cols;
        let patch_cols = orows * ocols;

        let mut patches = match self.patches.take() {
            Some(t) if t.shape() == (patch_rows, patch_cols) => t,
            _ => Tensor::zeros(patch_rows, patch_cols),
        };
        let xs = x.as_slice();
        for ic in 0..self.in_channels {
            for kr in 0..self.k_rows {
                for kc in 0..self.k_cols {
                    let prow = (ic * self.k_rows + kr) * self.k_cols + kc;
                    for orow in 0..orows {
                        for ocol in 0..ocols {
                            let v = self
                                .source_offset(ic, kr, kc, orow, ocol)
                                .map_or(0.0, |off| xs[off]);
                            patches.set(prow, orow * ocols + ocol, v);
                        }
                    }
                }
            }
        }

        let mut kmat = match self.kmat.take() {
            Some(t) if t.shape() == (self.out_channels, patch_rows) => t,
            _ => Tensor::zeros(self.out_channels, patch_rows),
        };
        for oc in 0..self.out_channels {
            for ic in 0..self.in_channels {
                for kr in 0..self.k_rows {
                    for kc in 0..self.k_cols {
                        kmat.set(
                            oc,
                            (ic * self.k_rows + kr) * self.k_cols + kc,
                            kernel.get(oc * self.k_rows + kr, ic * self.k_cols + kc),
                        );
                    }
                }
            }
        }

        let mut y2 = match self.y2.take() {
            Some(t) if t.shape() == (self.out_channels, patch_cols) => t,
            _ => Tensor::zeros(self.out_channels, patch_cols),
        };
        Tensor::matmul_t(&kmat, false, &patches, false, 0.0, &mut y2)?;
        out.as_slice_mut().copy_from_slice(y2.as_slice());

        self.patches = Some(patches);
        self.kmat = Some(kmat);
        self.y2 = Some(y2);
        Ok(())
    }

    fn backward_input(
        &self,
        index: usize,
        _inputs: &[&Tensor],
        _value: &Tensor,
        grad: &Tensor,
        acc: &mut Tensor,
    ) -> Result<()> {
        let (orows, ocols) = (self.out_rows(), self.out_cols());
        let patch_rows = self.in_channels * self.k_rows * self.k_cols;
        let patch_cols = orows * ocols;
        let dy2 = Tensor::from_vec(self.out_channels, patch_cols, grad.as_slice().to_vec())?;

        match index {
            0 => {
                // dX via col2im of kmat^T . dY2
                let kmat = self.kmat.as_ref().expect("conv2d backward follows forward");
                let mut dpatches = Tensor::zeros(patch_rows, patch_cols);
                Tensor::matmul_t(kmat, true, &dy2, false, 0.0, &mut dpatches)?;
                for ic in 0..self.in_channels {
                    for kr in 0..self.k_rows {
                        for kc in 0..self.k_cols {
                            let prow = (ic * self.k_rows + kr) * self.k_cols + kc;
                            for orow in 0..orows {
                                for ocol in 0..ocols {
                                    if let Some(off) = self.source_offset(ic, kr, kc, orow, ocol) {
                                        let v = dpatches.get(prow, orow * ocols + ocol);
                                        acc.set(0, off, acc.get(0, off) + v);
                                    }
                                }
                            }
                        }
                    }
                }
                Ok(())
            }
            _ => {
                // dK: dY2 . P^T, scattered back into the blocked kernel layout
                let patches = self.patches.as_ref().expect("conv2d backward follows forward");
                let mut dkmat = Tensor::zeros(self.out_channels, patch_rows);
                Tensor::matmul_t(&dy2, false, patches, true, 0.0, &mut dkmat)?;
                for oc in 0..self.out_channels {
                    for ic in 0..self.in_channels {
                        for kr in 0..self.k_rows {
                            for kc in 0..self.k_cols {
                                let v = dkmat.get(oc, (ic * self.k_rows + kr) * self.k_cols + kc);
                                let (r, c) = (oc * self.k_rows + kr, ic * self.k_cols + kc);
                                acc.set(r, c, acc.get(r, c) + v);
                            }
                        }
                    }
                }
                Ok(())
            }
        }
    }
}
