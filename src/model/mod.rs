//! Fraud classifiers: four single-modality branches and the fused ensemble.

mod ensemble;
mod factory;
mod layers;
mod sequential;

pub use ensemble::{EnsembleNet, SubNetwork};
pub use factory::{
    branch_design, build_branch, build_ensemble, ensemble_subnet_design, LayerSpec, ENSEMBLE_NAME,
};
pub use layers::{sigmoid, Activation, BatchNorm, Dense, Dropout, Layer, ParamGrad, Tape};
pub use sequential::Sequential;

use crate::features::{Modality, FEATURE_DIM};
use ndarray::{s, Array1, ArrayView2, Axis};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Individual,
    Ensemble,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FraudModel {
    Branch { modality: Modality, net: Sequential },
    Ensemble(EnsembleNet),
}

/// Training-mode activations kept for the backward pass.
pub enum ForwardCache {
    Branch(Vec<layers::LayerCache>),
    Ensemble(ensemble::EnsembleCache),
}

impl FraudModel {
    pub fn name(&self) -> &str {
        match self {
            FraudModel::Branch { modality, .. } => modality.as_str(),
            FraudModel::Ensemble(e) => &e.name,
        }
    }

    pub fn kind(&self) -> ModelKind {
        match self {
            FraudModel::Branch { .. } => ModelKind::Individual,
            FraudModel::Ensemble(_) => ModelKind::Ensemble,
        }
    }

    /// Columns of the full feature vector this model consumes.
    pub fn input_columns(&self) -> Range<usize> {
        match self {
            FraudModel::Branch { modality, .. } => modality.range(),
            FraudModel::Ensemble(_) => 0..FEATURE_DIM,
        }
    }

    pub fn input_dim(&self) -> usize {
        let r = self.input_columns();
        r.end - r.start
    }

    /// Modality slices read by this model, relative to the full feature vector.
    pub fn slice_ranges(&self) -> Vec<(Modality, Range<usize>)> {
        match self {
            FraudModel::Branch { modality, .. } => vec![(*modality, modality.range())],
            FraudModel::Ensemble(e) => e
                .branches
                .iter()
                .map(|b| (b.modality, b.modality.range()))
                .collect(),
        }
    }

    /// `[batch, features]` with an unbounded batch dimension.
    pub fn input_shape(&self) -> [Option<usize>; 2] {
        [None, Some(self.input_dim())]
    }

    pub fn output_shape(&self) -> [Option<usize>; 2] {
        [None, Some(1)]
    }

    pub fn param_count(&self) -> usize {
        match self {
            FraudModel::Branch { net, .. } => net.param_count(),
            FraudModel::Ensemble(e) => e.param_count(),
        }
    }

    /// Select this model's input columns from full 34-wide rows.
    pub fn select_input<'a>(&self, full: ArrayView2<'a, f32>) -> ArrayView2<'a, f32> {
        let r = self.input_columns();
        full.slice_move(s![.., r.start..r.end])
    }

    /// Fraud probability per row of model input (already column-selected).
    pub fn predict(&self, x: ArrayView2<'_, f32>) -> Array1<f32> {
        let out = match self {
            FraudModel::Branch { net, .. } => net.forward_infer(x.to_owned()),
            FraudModel::Ensemble(e) => e.forward_infer(x),
        };
        out.index_axis_move(Axis(1), 0)
    }

    pub fn forward_train<R: Rng + ?Sized>(
        &mut self,
        x: ArrayView2<'_, f32>,
        rng: &mut R,
    ) -> (Array1<f32>, ForwardCache) {
        let (out, cache) = match self {
            FraudModel::Branch { net, .. } => {
                let (o, c) = net.forward_train(x.to_owned(), rng);
                (o, ForwardCache::Branch(c))
            }
            FraudModel::Ensemble(e) => {
                let (o, c) = e.forward_train(x, rng);
                (o, ForwardCache::Ensemble(c))
            }
        };
        (out.index_axis_move(Axis(1), 0), cache)
    }

    /// Per-row tapes given the loss gradient w.r.t. the output logit of each row.
    pub fn backward(&self, cache: ForwardCache, d_logits: Array1<f32>) -> Vec<Tape> {
        let grad = d_logits.insert_axis(Axis(1));
        match (self, cache) {
            (FraudModel::Branch { net, .. }, ForwardCache::Branch(c)) => net.backward(c, grad, true).1,
            (FraudModel::Ensemble(e), ForwardCache::Ensemble(c)) => e.backward(c, grad),
            _ => unreachable!("forward cache from a different model kind"),
        }
    }

    /// Plain SGD step: `θ ← θ − lr · g`.
    pub fn apply(&mut self, grad: &Gradient, lr: f32) {
        let layers: Vec<&mut Layer> = match self {
            FraudModel::Branch { net, .. } => net.param_layers_mut().collect(),
            FraudModel::Ensemble(e) => e
                .branches
                .iter_mut()
                .flat_map(|b| b.net.param_layers_mut())
                .chain(e.head.param_layers_mut())
                .collect(),
        };
        debug_assert_eq!(layers.len(), grad.0.len());
        for (layer, g) in layers.into_iter().zip(&grad.0) {
            layer.apply(g, lr);
        }
    }
}

/// Gradient over every parameterized layer of a model, in forward order.
#[derive(Debug, Clone)]
pub struct Gradient(pub Vec<ParamGrad>);

impl Gradient {
    /// Sum of per-row gradients over `rows`.
    pub fn from_tapes(tapes: &[Tape], rows: Range<usize>) -> Self {
        Gradient(tapes.iter().map(|t| t.gradient(rows.clone())).collect())
    }

    pub fn l2_norm(&self) -> f32 {
        self.0.iter().map(ParamGrad::squared_norm).sum::<f32>().sqrt()
    }

    pub fn scale(&mut self, k: f32) {
        self.0.iter_mut().for_each(|g| g.scale(k));
    }

    pub fn add_scaled(&mut self, k: f32, other: &Gradient) {
        for (a, b) in self.0.iter_mut().zip(&other.0) {
            a.add_scaled(k, b);
        }
    }

    /// Add independent `N(0, std²)` noise to every coordinate.
    pub fn add_gaussian_noise<R: Rng + ?Sized>(&mut self, std: f32, rng: &mut R) {
        if std <= 0.0 {
            return;
        }
        let Ok(noise) = Normal::new(0.0f32, std) else {
            return;
        };
        for g in &mut self.0 {
            g.for_each_mut(|v| *v += noise.sample(&mut *rng));
        }
    }
}
