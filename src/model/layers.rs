//! Dense, dropout, and batch-normalization layers with forward caches and gradient tapes.

use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    Sigmoid,
}

impl Activation {
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::Relu => x.max(0.0),
            Activation::Sigmoid => sigmoid(x),
        }
    }

    /// Derivative with respect to the pre-activation value.
    fn derivative(self, pre: f32) -> f32 {
        match self {
            Activation::Relu => {
                if pre > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::Sigmoid => {
                let s = sigmoid(pre);
                s * (1.0 - s)
            }
        }
    }
}

pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Fully connected layer; `weight` is `[in, out]` so `y = x · W + b`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dense {
    pub name: String,
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
    pub activation: Activation,
}

impl Dense {
    /// Glorot-uniform weights, zero bias.
    pub fn new<R: Rng + ?Sized>(
        name: impl Into<String>,
        fan_in: usize,
        fan_out: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
        let dist = Uniform::new_inclusive(-limit, limit);
        let weight = Array2::from_shape_simple_fn((fan_in, fan_out), || dist.sample(&mut *rng));
        Self {
            name: name.into(),
            weight,
            bias: Array1::zeros(fan_out),
            activation,
        }
    }

    pub fn in_dim(&self) -> usize {
        self.weight.nrows()
    }

    pub fn out_dim(&self) -> usize {
        self.weight.ncols()
    }

    pub fn pre_activation(&self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        x.dot(&self.weight) + &self.bias
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dropout {
    pub rate: f32,
}

/// Batch normalization. The moving statistics are used at inference and folded by
/// the edge converter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchNorm {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
    pub moving_mean: Array1<f32>,
    pub moving_var: Array1<f32>,
    pub momentum: f32,
    pub epsilon: f32,
}

impl BatchNorm {
    pub fn new(units: usize) -> Self {
        Self {
            gamma: Array1::ones(units),
            beta: Array1::zeros(units),
            moving_mean: Array1::zeros(units),
            moving_var: Array1::ones(units),
            momentum: 0.99,
            epsilon: 1e-3,
        }
    }

    /// Per-feature `(scale, shift)` such that inference output is `x * scale + shift`.
    pub fn affine(&self) -> (Array1<f32>, Array1<f32>) {
        let scale = &self.gamma / &self.moving_var.mapv(|v| (v + self.epsilon).sqrt());
        let shift = &self.beta - &(&self.moving_mean * &scale);
        (scale, shift)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Layer {
    Dense(Dense),
    Dropout(Dropout),
    BatchNorm(BatchNorm),
}

/// What a layer remembers from the training forward pass.
pub enum LayerCache {
    Dense { input: Array2<f32>, pre: Array2<f32> },
    Dropout { mask: Array2<f32> },
    BatchNorm { normalized: Array2<f32>, inv_std: Array1<f32> },
}

/// Per-row gradient material for one parameterized layer. Summing a row range gives
/// the gradient of that group of examples without re-running backpropagation.
pub enum Tape {
    Dense { input: Array2<f32>, delta: Array2<f32> },
    BatchNorm { normalized: Array2<f32>, delta: Array2<f32> },
}

#[derive(Debug, Clone)]
pub enum ParamGrad {
    Dense { weight: Array2<f32>, bias: Array1<f32> },
    BatchNorm { gamma: Array1<f32>, beta: Array1<f32> },
}

impl Layer {
    pub fn has_params(&self) -> bool {
        !matches!(self, Layer::Dropout(_))
    }

    /// Trainable plus non-trainable weights (normalization statistics included).
    pub fn param_count(&self) -> usize {
        match self {
            Layer::Dense(d) => d.weight.len() + d.bias.len(),
            Layer::Dropout(_) => 0,
            Layer::BatchNorm(b) => 4 * b.gamma.len(),
        }
    }

    pub fn forward_train<R: Rng + ?Sized>(
        &mut self,
        x: Array2<f32>,
        rng: &mut R,
    ) -> (Array2<f32>, LayerCache) {
        match self {
            Layer::Dense(d) => {
                let pre = d.pre_activation(x.view());
                let out = pre.mapv(|v| d.activation.apply(v));
                (out, LayerCache::Dense { input: x, pre })
            }
            Layer::Dropout(dr) => {
                let keep = 1.0 - dr.rate;
                let mask = x.mapv(|_| if rng.gen::<f32>() < keep { 1.0 / keep } else { 0.0 });
                (&x * &mask, LayerCache::Dropout { mask })
            }
            Layer::BatchNorm(bn) => {
                let mean = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(x.ncols()));
                let var = x.var_axis(Axis(0), 0.0);
                let inv_std = var.mapv(|v| 1.0 / (v + bn.epsilon).sqrt());
                let normalized = (&x - &mean) * &inv_std;
                let out = &normalized * &bn.gamma + &bn.beta;
                let m = bn.momentum;
                bn.moving_mean = &bn.moving_mean * m + &mean * (1.0 - m);
                bn.moving_var = &bn.moving_var * m + &var * (1.0 - m);
                (out, LayerCache::BatchNorm { normalized, inv_std })
            }
        }
    }

    pub fn forward_infer(&self, x: Array2<f32>) -> Array2<f32> {
        match self {
            Layer::Dense(d) => d.pre_activation(x.view()).mapv(|v| d.activation.apply(v)),
            Layer::Dropout(_) => x,
            Layer::BatchNorm(bn) => {
                let (scale, shift) = bn.affine();
                x * &scale + &shift
            }
        }
    }

    /// Propagate `grad` (w.r.t. this layer's output) backwards. When `at_logits` is set,
    /// `grad` is already w.r.t. the dense pre-activation and the activation derivative
    /// is skipped. Batch statistics are treated as constants so per-row gradients stay
    /// independent of the rest of the batch.
    pub fn backward(
        &self,
        cache: LayerCache,
        grad: Array2<f32>,
        at_logits: bool,
    ) -> (Array2<f32>, Option<Tape>) {
        match (self, cache) {
            (Layer::Dense(d), LayerCache::Dense { input, pre }) => {
                let delta = if at_logits {
                    grad
                } else {
                    let mut g = grad;
                    Zip::from(&mut g)
                        .and(&pre)
                        .for_each(|g, &p| *g *= d.activation.derivative(p));
                    g
                };
                let dx = delta.dot(&d.weight.t());
                (dx, Some(Tape::Dense { input, delta }))
            }
            (Layer::Dropout(_), LayerCache::Dropout { mask }) => (grad * &mask, None),
            (Layer::BatchNorm(bn), LayerCache::BatchNorm { normalized, inv_std }) => {
                let dx = &grad * &(&bn.gamma * &inv_std);
                (
                    dx,
                    Some(Tape::BatchNorm {
                        normalized,
                        delta: grad,
                    }),
                )
            }
            _ => unreachable!("layer cache does not match layer kind"),
        }
    }

    pub fn apply(&mut self, grad: &ParamGrad, lr: f32) {
        match (self, grad) {
            (Layer::Dense(d), ParamGrad::Dense { weight, bias }) => {
                d.weight.scaled_add(-lr, weight);
                d.bias.scaled_add(-lr, bias);
            }
            (Layer::BatchNorm(bn), ParamGrad::BatchNorm { gamma, beta }) => {
                bn.gamma.scaled_add(-lr, gamma);
                bn.beta.scaled_add(-lr, beta);
            }
            _ => unreachable!("gradient does not match layer kind"),
        }
    }
}

impl Tape {
    /// Gradient summed over `rows`.
    pub fn gradient(&self, rows: Range<usize>) -> ParamGrad {
        match self {
            Tape::Dense { input, delta } => {
                let x = input.slice(ndarray::s![rows.clone(), ..]);
                let d = delta.slice(ndarray::s![rows, ..]);
                ParamGrad::Dense {
                    weight: x.t().dot(&d),
                    bias: d.sum_axis(Axis(0)),
                }
            }
            Tape::BatchNorm { normalized, delta } => {
                let n = normalized.slice(ndarray::s![rows.clone(), ..]);
                let d = delta.slice(ndarray::s![rows, ..]);
                ParamGrad::BatchNorm {
                    gamma: (&d * &n).sum_axis(Axis(0)),
                    beta: d.sum_axis(Axis(0)),
                }
            }
        }
    }
}

impl ParamGrad {
    pub fn squared_norm(&self) -> f32 {
        match self {
            ParamGrad::Dense { weight, bias } => {
                weight.iter().map(|v| v * v).sum::<f32>() + bias.iter().map(|v| v * v).sum::<f32>()
            }
            ParamGrad::BatchNorm { gamma, beta } => {
                gamma.iter().map(|v| v * v).sum::<f32>() + beta.iter().map(|v| v * v).sum::<f32>()
            }
        }
    }

    pub fn scale(&mut self, k: f32) {
        match self {
            ParamGrad::Dense { weight, bias } => {
                weight.mapv_inplace(|v| v * k);
                bias.mapv_inplace(|v| v * k);
            }
            ParamGrad::BatchNorm { gamma, beta } => {
                gamma.mapv_inplace(|v| v * k);
                beta.mapv_inplace(|v| v * k);
            }
        }
    }

    pub fn add_scaled(&mut self, k: f32, other: &ParamGrad) {
        match (self, other) {
            (ParamGrad::Dense { weight, bias }, ParamGrad::Dense { weight: w, bias: b }) => {
                weight.scaled_add(k, w);
                bias.scaled_add(k, b);
            }
            (ParamGrad::BatchNorm { gamma, beta }, ParamGrad::BatchNorm { gamma: g, beta: b }) => {
                gamma.scaled_add(k, g);
                beta.scaled_add(k, b);
            }
            _ => unreachable!("gradient layouts differ"),
        }
    }

    pub fn for_each_mut(&mut self, mut f: impl FnMut(&mut f32)) {
        match self {
            ParamGrad::Dense { weight, bias } => {
                weight.iter_mut().for_each(&mut f);
                bias.iter_mut().for_each(&mut f);
            }
            ParamGrad::BatchNorm { gamma, beta } => {
                gamma.iter_mut().for_each(&mut f);
                beta.iter_mut().for_each(&mut f);
            }
        }
    }
}
