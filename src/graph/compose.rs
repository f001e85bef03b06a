//! Composite builders: GRU cell, attention, multi-head attention and
//! row-wise application. These assemble primitive nodes into subgraphs;
//! gradients flow through the ordinary pullbacks of the pieces.

use crate::errors::{Error, Result};
use crate::graph::Graph;
use crate::tensor::Tensor;
use crate::types::NodeId;

/// Large finite stand-in for -inf in attention masks; keeps softmax
/// gradients NaN-free.
const MASK_PENALTY: f32 = 1e9;

/// A single GRU cell over row vectors: x is 1 x input, h is 1 x hidden.
///
/// Gate equations (z gates the previous state):
///   z  = sigmoid(x W_z^T + h U_z^T + b_z)
///   r  = sigmoid(x W_r^T + h U_r^T + b_r)
///   h~ = tanh(x W_h^T + (r (*) h) U_h^T + b_h)
///   h' = z (*) h + (1 - z) (*) h~
pub struct GruCell {
    pub wz: NodeId,
    pub uz: NodeId,
    pub bz: NodeId,
    pub wr: NodeId,
    pub ur: NodeId,
    pub br: NodeId,
    pub wh: NodeId,
    pub uh: NodeId,
    pub bh: NodeId,
    pub output: NodeId,
}

/// Multi-head attention with four embed x embed projections.
pub struct MultiHeadAttention {
    pub wq: NodeId,
    pub wk: NodeId,
    pub wv: NodeId,
    pub wo: NodeId,
    pub bq: Option<NodeId>,
    pub bk: Option<NodeId>,
    pub bv: Option<NodeId>,
    pub bo: Option<NodeId>,
    pub output: NodeId,
}

impl Graph {
    /// Recurrent gate against a hidden state: `x W^T + h U^T + b`.
    fn gru_gate(&mut self, x: NodeId, h: NodeId, w: NodeId, u: NodeId, b: NodeId) -> NodeId {
        let xw = self.linear(x, w, b);
        let ut = self.transpose(u);
        let hu = self.product(h, ut);
        self.add(xw, hu)
    }

    pub fn gru(&mut self, x: NodeId, h: NodeId, input_size: usize, hidden_size: usize) -> GruCell {
        let wz = self.variable(hidden_size, input_size);
        let uz = self.variable(hidden_size, hidden_size);
        let bz = self.variable_from(Tensor::zeros(1, hidden_size));
        let wr = self.variable(hidden_size, input_size);
        let ur = self.variable(hidden_size, hidden_size);
        let br = self.variable_from(Tensor::zeros(1, hidden_size));
        let wh = self.variable(hidden_size, input_size);
        let uh = self.variable(hidden_size, hidden_size);
        let bh = self.variable_from(Tensor::zeros(1, hidden_size));

        let z_pre = self.gru_gate(x, h, wz, uz, bz);
        let z = self.sigmoid(z_pre);
        let r_pre = self.gru_gate(x, h, wr, ur, br);
        let r = self.sigmoid(r_pre);

        let xw = self.linear(x, wh, bh);
        let rh = self.mul(r, h);
        let uht = self.transpose(uh);
        let rhu = self.product(rh, uht);
        let hh_pre = self.add(xw, rhu);
        let hh = self.tanh(hh_pre);

        let one = self.constant_from(Tensor::ones(1, 1));
        let ones = self.broadcast(one, 1, hidden_size);
        let keep = self.mul(z, h);
        let gate = self.sub(ones, z);
        let blend = self.mul(gate, hh);
        let output = self.add(keep, blend);

        GruCell {
            wz,
            uz,
            bz,
            wr,
            ur,
            br,
            wh,
            uh,
            bh,
            output,
        }
    }

    /// Scaled dot-product attention:
    /// `softmax_row((Q K^T) / sqrt(D) + bias) V`, where bias is a large
    /// negative penalty wherever `mask == 0`. Q is L x D, K and V are S x D.
    pub fn attention(
        &mut self,
        q: NodeId,
        k: NodeId,
        v: NodeId,
        mask: Option<NodeId>,
        seq_q: usize,
        seq_k: usize,
        head_dim: usize,
        dropout: f32,
    ) -> NodeId {
        let kt = self.transpose(k);
        let scores = self.product(q, kt);
        let scale = self.constant_from(Tensor::full(1, 1, 1.0 / (head_dim as f32).sqrt()));
        let scale_b = self.broadcast(scale, seq_q, seq_k);
        let scaled = self.mul(scores, scale_b);

        let biased = match mask {
            Some(m) => {
                let one = self.constant_from(Tensor::ones(1, 1));
                let ones = self.broadcast(one, seq_q, seq_k);
                let shifted = self.sub(m, ones);
                let penalty = self.constant_from(Tensor::full(1, 1, MASK_PENALTY));
                let penalty_b = self.broadcast(penalty, seq_q, seq_k);
                let bias = self.mul(shifted, penalty_b);
                self.add(scaled, bias)
            }
            None => scaled,
        };

        let probs = self.softmax(biased);
        let probs = if dropout > 0.0 {
            self.dropout(probs, dropout)
        } else {
            probs
        };
        self.product(probs, v)
    }

    /// Horizontal concatenation built from primitives: element-wise join
    /// works on transposed operands, then the result is transposed back.
    fn concat_cols(
        &mut self,
        a: NodeId,
        b: NodeId,
        rows: usize,
        cols_a: usize,
        cols_b: usize,
    ) -> NodeId {
        let at = self.transpose(a);
        let bt = self.transpose(b);
        let joined = self.join(at, bt, cols_a + cols_b, rows);
        self.transpose(joined)
    }

    /// Multi-head attention over row-major sequences: q is L x E, k and v
    /// are S x E, heads attend over D = E / H columns each.
    #[allow(clippy::too_many_arguments)]
    pub fn multi_head_attention(
        &mut self,
        q: NodeId,
        k: NodeId,
        v: NodeId,
        mask: Option<NodeId>,
        seq_q: usize,
        seq_k: usize,
        embed: usize,
        heads: usize,
        bias: bool,
        dropout: f32,
    ) -> Result<MultiHeadAttention> {
        if heads == 0 || embed % heads != 0 {
            return Err(Error::shape("multi_head_attention", (heads, 0), (embed, 0)));
        }
        let head_dim = embed / heads;

        let wq = self.variable(embed, embed);
        let wk = self.variable(embed, embed);
        let wv = self.variable(embed, embed);
        let wo = self.variable(embed, embed);
        let mut biases = (None, None, None, None);
        if bias {
            biases = (
                Some(self.variable_from(Tensor::zeros(1, embed))),
                Some(self.variable_from(Tensor::zeros(1, embed))),
                Some(self.variable_from(Tensor::zeros(1, embed))),
                Some(self.variable_from(Tensor::zeros(1, embed))),
            );
        }

        let project = |g: &mut Graph, x: NodeId, w: NodeId, b: Option<NodeId>| match b {
            Some(b) => g.linear(x, w, b),
            None => {
                let wt = g.transpose(w);
                g.product(x, wt)
            }
        };

        let pq = project(self, q, wq, biases.0);
        let pk = project(self, k, wk, biases.1);
        let pv = project(self, v, wv, biases.2);

        let mut merged: Option<NodeId> = None;
        for head in 0..heads {
            let col = head * head_dim;
            let qh = self.split(pq, 0, col, seq_q, head_dim);
            let kh = self.split(pk, 0, col, seq_k, head_dim);
            let vh = self.split(pv, 0, col, seq_k, head_dim);
            let ah = self.attention(qh, kh, vh, mask, seq_q, seq_k, head_dim, dropout);
            merged = Some(match merged {
                None => ah,
                Some(prev) => self.concat_cols(prev, ah, seq_q, col, head_dim),
            });
        }
        let merged = merged.expect("heads > 0");
        let output = project(self, merged, wo, biases.3);

        Ok(MultiHeadAttention {
            wq,
            wk,
            wv,
            wo,
            bq: biases.0,
            bk: biases.1,
            bv: biases.2,
            bo: biases.3,
            output,
        })
    }

    /// Apply `build` to every row of `x` (each exposed as a 1 x cols crop)
    /// and stack the 1 x out_cols results vertically.
    pub fn rowwise<F>(
        &mut self,
        x: NodeId,
        rows: usize,
        cols: usize,
        out_cols: usize,
        mut build: F,
    ) -> NodeId
    where
        F: FnMut(&mut Graph, NodeId) -> NodeId,
    {
        assert!(rows > 0, "rowwise over an empty input");
        let mut stacked: Option<NodeId> = None;
        for i in 0..rows {
            let row = self.split(x, i, 0, 1, cols);
            let y = build(self, row);
            stacked = Some(match stacked {
                None => y,
                Some(prev) => self.join(prev, y, i + 1, out_cols),
            });
        }
        stacked.expect("rows > 0")
    }
}
