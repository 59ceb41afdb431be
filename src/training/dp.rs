//! DP-SGD: microbatch gradient clipping, Gaussian noise, plain SGD update.

use super::PrivacyBudget;
use crate::model::{FraudModel, Gradient, Tape};
use ndarray::{ArrayView1, ArrayView2};
use rand::Rng;
use std::ops::Range;

const PROB_EPS: f32 = 1e-7;

/// Differentially-private SGD with a fixed privacy budget.
#[derive(Debug, Clone)]
pub struct DpSgd {
    budget: PrivacyBudget,
    learning_rate: f32,
}

/// A model bound to the optimizer that will train it.
pub struct CompiledModel {
    pub model: FraudModel,
    pub optimizer: DpSgd,
}

impl DpSgd {
    pub fn new(budget: PrivacyBudget, learning_rate: f32) -> Self {
        Self {
            budget,
            learning_rate,
        }
    }

    pub fn compile(self, model: FraudModel) -> CompiledModel {
        CompiledModel {
            model,
            optimizer: self,
        }
    }

    pub fn budget(&self) -> PrivacyBudget {
        self.budget
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }

    /// One update on a batch. Returns the mean binary cross-entropy of the batch
    /// before the update.
    pub fn step<R: Rng + ?Sized>(
        &self,
        model: &mut FraudModel,
        x: ArrayView2<'_, f32>,
        y: ArrayView1<'_, f32>,
        rng: &mut R,
    ) -> f32 {
        let (p, cache) = model.forward_train(x, rng);
        let loss = binary_cross_entropy(p.view(), y);
        // d(BCE)/d(logit) for a sigmoid output, per example.
        let d_logits = &p - &y;
        let tapes = model.backward(cache, d_logits);
        let grad = self.privatize(&tapes, p.len(), rng);
        model.apply(&grad, self.learning_rate);
        loss
    }

    /// Clip each microbatch's mean gradient to `l2_norm_clip`, sum, add
    /// `N(0, (noise_multiplier · l2_norm_clip)²)` noise, and average over microbatches.
    pub fn privatize<R: Rng + ?Sized>(&self, tapes: &[Tape], batch_len: usize, rng: &mut R) -> Gradient {
        let clip = self.budget.l2_norm_clip;
        let bounds = microbatch_bounds(batch_len, self.budget.num_microbatches);
        let mut total: Option<Gradient> = None;
        for range in &bounds {
            let mut g = Gradient::from_tapes(tapes, range.clone());
            g.scale(1.0 / range.len() as f32);
            let norm = g.l2_norm();
            if norm > clip {
                g.scale(clip / norm);
            }
            match total.as_mut() {
                Some(t) => t.add_scaled(1.0, &g),
                None => total = Some(g),
            }
        }
        let mut total = total.unwrap_or_else(|| Gradient::from_tapes(tapes, 0..0));
        total.add_gaussian_noise(self.budget.noise_multiplier * clip, rng);
        total.scale(1.0 / bounds.len().max(1) as f32);
        total
    }
}

/// Contiguous groups for a batch of `batch_len` rows. The group count is
/// `min(num_microbatches, batch_len)` so a short final batch still splits cleanly;
/// sizes differ by at most one.
pub fn microbatch_bounds(batch_len: usize, num_microbatches: usize) -> Vec<Range<usize>> {
    let groups = num_microbatches.min(batch_len).max(1);
    let base = batch_len / groups;
    let extra = batch_len % groups;
    let mut out = Vec::with_capacity(groups);
    let mut start = 0;
    for i in 0..groups {
        let len = base + usize::from(i < extra);
        out.push(start..start + len);
        start += len;
    }
    out
}

/// Mean binary cross-entropy with probabilities clamped away from 0 and 1.
pub fn binary_cross_entropy(p: ArrayView1<'_, f32>, y: ArrayView1<'_, f32>) -> f32 {
    if p.is_empty() {
        return 0.0;
    }
    let sum: f32 = p
        .iter()
        .zip(y.iter())
        .map(|(&p, &y)| {
            let p = p.clamp(PROB_EPS, 1.0 - PROB_EPS);
            -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
        })
        .sum();
    sum / p.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::Modality;
    use crate::model::build_branch;
    use crate::training::seeded_rng;
    use ndarray::{array, Array1, Array2};

    fn budget(clip: f32, noise: f32, micro: usize) -> PrivacyBudget {
        PrivacyBudget {
            l2_norm_clip: clip,
            noise_multiplier: noise,
            num_microbatches: micro,
        }
    }

    fn tapes_for(batch: usize) -> (FraudModel, Vec<Tape>) {
        let mut rng = seeded_rng(3, 0);
        let mut model = build_branch(Modality::NavigationPattern, &mut rng);
        let x = Array2::from_shape_fn((batch, 6), |(r, c)| (r as f32 * 0.9 - c as f32) * 3.0);
        let (p, cache) = model.forward_train(x.view(), &mut rng);
        let d = p.mapv(|v| v - 1.0);
        let tapes = model.backward(cache, d);
        (model, tapes)
    }

    #[test]
    fn microbatches_cover_batch_contiguously() {
        let b = microbatch_bounds(32, 250);
        assert_eq!(b.len(), 32);
        assert!(b.iter().all(|r| r.len() == 1));
        let b = microbatch_bounds(10, 4);
        assert_eq!(b, vec![0..3, 3..6, 6..8, 8..10]);
        assert_eq!(microbatch_bounds(7, 1), vec![0..7]);
    }

    #[test]
    fn noiseless_update_norm_is_bounded_by_clip() {
        let (_, tapes) = tapes_for(8);
        let opt = DpSgd::new(budget(0.05, 0.0, 8), 0.1);
        let mut rng = seeded_rng(0, 1);
        let g = opt.privatize(&tapes, 8, &mut rng);
        assert!(g.l2_norm() <= 0.05 + 1e-5, "norm {}", g.l2_norm());
    }

    #[test]
    fn noise_scales_with_multiplier() {
        let (_, tapes) = tapes_for(4);
        let mut rng = seeded_rng(0, 2);
        let quiet = DpSgd::new(budget(1.0, 0.0, 4), 0.1).privatize(&tapes, 4, &mut rng);
        let loud = DpSgd::new(budget(1.0, 4.0, 4), 0.1).privatize(&tapes, 4, &mut rng);
        let mut diff = loud.clone();
        diff.add_scaled(-1.0, &quiet);
        // Noise per coordinate has std 4.0 / 4 = 1.0 after averaging.
        assert!(diff.l2_norm() > quiet.l2_norm());
        assert!(diff.l2_norm() > 1.0);
    }

    #[test]
    fn bce_matches_closed_form() {
        let p = array![0.9f32, 0.2];
        let y = array![1.0f32, 0.0];
        let expected = -((0.9f32).ln() + (0.8f32).ln()) / 2.0;
        assert!((binary_cross_entropy(p.view(), y.view()) - expected).abs() < 1e-6);
        let saturated = binary_cross_entropy(array![0.0f32].view(), array![1.0f32].view());
        assert!(saturated.is_finite());
    }

    #[test]
    fn step_reduces_loss_without_noise() {
        let mut rng = seeded_rng(11, 0);
        let mut model = build_branch(Modality::DeviceOrientation, &mut rng);
        let x = Array2::from_shape_fn((64, 8), |(r, c)| if r % 2 == 0 { 1.0 } else { -1.0 } * (c as f32 + 1.0) * 0.2);
        let y = Array1::from_iter((0..64).map(|r| if r % 2 == 0 { 1.0f32 } else { 0.0 }));
        let opt = DpSgd::new(budget(5.0, 0.0, 8), 0.2);
        let before = binary_cross_entropy(model.predict(x.view()).view(), y.view());
        for _ in 0..50 {
            opt.step(&mut model, x.view(), y.view(), &mut rng);
        }
        let after = binary_cross_entropy(model.predict(x.view()).view(), y.view());
        assert!(after < before, "{before} -> {after}");
    }
}
