//! The distributed training contract: a model owns a live graph and a
//! snapshot of the last weights seen from the master, and exchanges
//! weight sets and deltas as codec byte streams.

use crate::codec;
use crate::errors::{Error, Result};
use crate::graph::Graph;
use crate::tensor::Tensor;

/// Implemented by concrete models (usually loaded as plug-ins).
///
/// `curr` is the live graph mutated by `batch_train`; `prev` holds the
/// variable values from the last `set_weights`, so `get_update` is the
/// per-variable difference accumulated locally since the last sync.
pub trait Training: Send {
    fn curr(&mut self) -> &mut Graph;

    fn prev(&mut self) -> &mut Graph;

    /// One local optimization step: fill inputs, forward the loss,
    /// backward, optimizer update, zero gradients.
    fn batch_train(&mut self) -> Result<()>;

    /// Serialize the live variable set in insertion order.
    fn get_weights(&mut self) -> Result<Vec<u8>> {
        let graph = self.curr();
        let tensors = collect_variables(graph)?;
        codec::encode_variables(&tensors)
    }

    /// Load a serialized variable set into both graphs, instantiating
    /// missing variable slots. Right after this call `get_update` is zero.
    fn set_weights(&mut self, bytes: &[u8]) -> Result<()> {
        let tensors = codec::decode_variables(bytes)?;
        load_variables(self.curr(), &tensors)?;
        load_variables(self.prev(), &tensors)?;
        Ok(())
    }

    /// Serialize `curr[i] - prev[i]` for every variable.
    fn get_update(&mut self) -> Result<Vec<u8>> {
        let current = collect_variables(self.curr())?;
        let snapshot = collect_variables(self.prev())?;
        if current.len() != snapshot.len() {
            return Err(Error::VariableCountMismatch {
                current: current.len(),
                snapshot: snapshot.len(),
            });
        }
        let mut deltas = Vec::with_capacity(current.len());
        for (c, p) in current.iter().zip(&snapshot) {
            if c.shape() != p.shape() {
                return Err(Error::shape("get_update", p.shape(), c.shape()));
            }
            deltas.push(c - p);
        }
        codec::encode_variables(&deltas)
    }

    /// Add a serialized delta into the live variables.
    fn upd_weights(&mut self, bytes: &[u8]) -> Result<()> {
        let deltas = codec::decode_variables(bytes)?;
        let graph = self.curr();
        if deltas.len() != graph.variables().len() {
            return Err(Error::VariableCountMismatch {
                current: graph.variables().len(),
                snapshot: deltas.len(),
            });
        }
        let ids: Vec<_> = graph.variables().to_vec();
        for (id, delta) in ids.into_iter().zip(&deltas) {
            let (value, _) = graph.variable_parts_mut(id);
            if value.shape() != delta.shape() {
                return Err(Error::shape("upd_weights", value.shape(), delta.shape()));
            }
            *value += delta;
        }
        Ok(())
    }
}

fn collect_variables(graph: &mut Graph) -> Result<Vec<Tensor>> {
    let ids: Vec<_> = graph.variables().to_vec();
    let mut tensors = Vec::with_capacity(ids.len());
    for id in ids {
        let value = graph
            .value(id)
            .ok_or_else(|| Error::Codec("variable without a value".into()))?;
        tensors.push(value.clone());
    }
    Ok(tensors)
}

fn load_variables(graph: &mut Graph, tensors: &[Tensor]) -> Result<()> {
    while graph.variables().len() < tensors.len() {
        graph.variable_placeholder();
    }
    let ids: Vec<_> = graph.variables().to_vec();
    for (id, tensor) in ids.into_iter().zip(tensors) {
        graph.set_value(id, tensor.clone())?;
    }
    Ok(())
}

/// Apply a serialized delta onto a serialized weight set; used by the
/// master when merging completed worker updates.
pub fn apply_delta(weights: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut base = codec::decode_variables(weights)?;
    let deltas = codec::decode_variables(delta)?;
    if base.len() != deltas.len() {
        return Err(Error::VariableCountMismatch {
            current: base.len(),
            snapshot: deltas.len(),
        });
    }
    for (b, d) in base.iter_mut().zip(&deltas) {
        if b.shape() != d.shape() {
            return Err(Error::shape("apply_delta", b.shape(), d.shape()));
        }
        *b += d;
    }
    codec::encode_variables(&base)
}
