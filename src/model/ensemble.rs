//! Multi-branch fraud network: per-modality sub-networks over fixed input slices,
//! concatenated embeddings, shared dense head.

use super::layers::{LayerCache, Tape};
use super::sequential::Sequential;
use crate::features::Modality;
use ndarray::{concatenate, s, Array2, ArrayView2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubNetwork {
    pub modality: Modality,
    pub net: Sequential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleNet {
    pub name: String,
    pub branches: Vec<SubNetwork>,
    pub head: Sequential,
}

pub struct EnsembleCache {
    branches: Vec<Vec<LayerCache>>,
    head: Vec<LayerCache>,
}

impl EnsembleNet {
    pub fn embedding_dim(&self) -> usize {
        self.branches.iter().map(|b| b.net.output_dim()).sum()
    }

    pub fn param_count(&self) -> usize {
        self.branches.iter().map(|b| b.net.param_count()).sum::<usize>() + self.head.param_count()
    }

    fn branch_input(x: ArrayView2<'_, f32>, modality: Modality) -> Array2<f32> {
        let r = modality.range();
        x.slice(s![.., r.start..r.end]).to_owned()
    }

    pub fn forward_train<R: Rng + ?Sized>(
        &mut self,
        x: ArrayView2<'_, f32>,
        rng: &mut R,
    ) -> (Array2<f32>, EnsembleCache) {
        let mut embeddings = Vec::with_capacity(self.branches.len());
        let mut branch_caches = Vec::with_capacity(self.branches.len());
        for b in &mut self.branches {
            let (emb, cache) = b.net.forward_train(Self::branch_input(x, b.modality), rng);
            embeddings.push(emb);
            branch_caches.push(cache);
        }
        let combined = concat(&embeddings);
        let (out, head) = self.head.forward_train(combined, rng);
        (
            out,
            EnsembleCache {
                branches: branch_caches,
                head,
            },
        )
    }

    pub fn forward_infer(&self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        let embeddings: Vec<Array2<f32>> = self
            .branches
            .iter()
            .map(|b| b.net.forward_infer(Self::branch_input(x, b.modality)))
            .collect();
        self.head.forward_infer(concat(&embeddings))
    }

    /// Tapes ordered as branch parameters (in branch order) followed by head parameters.
    pub fn backward(&self, cache: EnsembleCache, d_logits: Array2<f32>) -> Vec<Tape> {
        let (d_combined, head_tapes) = self.head.backward(cache.head, d_logits, true);
        let mut tapes = Vec::new();
        let mut offset = 0;
        for (b, caches) in self.branches.iter().zip(cache.branches) {
            let width = b.net.output_dim();
            let g = d_combined.slice(s![.., offset..offset + width]).to_owned();
            offset += width;
            let (_, branch_tapes) = b.net.backward(caches, g, false);
            tapes.extend(branch_tapes);
        }
        tapes.extend(head_tapes);
        tapes
    }
}

fn concat(parts: &[Array2<f32>]) -> Array2<f32> {
    let views: Vec<ArrayView2<'_, f32>> = parts.iter().map(|p| p.view()).collect();
    concatenate(Axis(1), &views).expect("branch embeddings share the batch dimension")
}
