//! Layer stacks: the building block of branch classifiers and ensemble sub-networks.

use super::layers::{Layer, LayerCache, Tape};
use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequential {
    pub name: String,
    pub input_dim: usize,
    pub layers: Vec<Layer>,
}

impl Sequential {
    pub fn output_dim(&self) -> usize {
        self.layers
            .iter()
            .rev()
            .find_map(|l| match l {
                Layer::Dense(d) => Some(d.out_dim()),
                _ => None,
            })
            .unwrap_or(self.input_dim)
    }

    pub fn param_count(&self) -> usize {
        self.layers.iter().map(Layer::param_count).sum()
    }

    pub fn forward_train<R: Rng + ?Sized>(
        &mut self,
        x: Array2<f32>,
        rng: &mut R,
    ) -> (Array2<f32>, Vec<LayerCache>) {
        let mut caches = Vec::with_capacity(self.layers.len());
        let mut h = x;
        for layer in &mut self.layers {
            let (out, cache) = layer.forward_train(h, rng);
            caches.push(cache);
            h = out;
        }
        (h, caches)
    }

    pub fn forward_infer(&self, x: Array2<f32>) -> Array2<f32> {
        self.layers.iter().fold(x, |h, layer| layer.forward_infer(h))
    }

    /// Backpropagate `grad` through the stack. Returns the gradient w.r.t. the stack
    /// input and one tape per parameterized layer, in forward order.
    pub fn backward(
        &self,
        caches: Vec<LayerCache>,
        grad: Array2<f32>,
        at_logits: bool,
    ) -> (Array2<f32>, Vec<Tape>) {
        let last = self.layers.len().saturating_sub(1);
        let mut tapes = Vec::new();
        let mut g = grad;
        for (i, (layer, cache)) in self.layers.iter().zip(caches).enumerate().rev() {
            let (dx, tape) = layer.backward(cache, g, at_logits && i == last);
            tapes.extend(tape);
            g = dx;
        }
        tapes.reverse();
        (g, tapes)
    }

    pub fn param_layers_mut(&mut self) -> impl Iterator<Item = &mut Layer> {
        self.layers.iter_mut().filter(|l| l.has_params())
    }
}
