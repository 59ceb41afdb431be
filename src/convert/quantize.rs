//! Full-integer int8 lowering and the integer-only kernels that execute it.
//!
//! Activations use asymmetric per-tensor int8, weights symmetric per-output-channel
//! int8, biases int32 at `input_scale * weight_scale`. Every rescale goes through a
//! Q31 fixed-point multiplier, so inference needs no floating point.

use super::calibrate::Range;
use super::graph::{InferenceGraph, Op, TensorId};
use crate::error::ConversionError;

/// Output scale and zero point of the logistic kernel: `[0, 1)` mapped onto int8.
pub const SIGMOID_SCALE: f32 = 1.0 / 256.0;
pub const SIGMOID_ZERO_POINT: i32 = -128;

/// `real = (q - zero_point) * scale`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QParams {
    pub scale: f32,
    pub zero_point: i32,
}

impl QParams {
    pub fn from_range(range: Range) -> Self {
        let (min, max) = (range.min.min(0.0), range.max.max(0.0));
        let scale = (max - min) / 255.0;
        if !(scale > 0.0) {
            return Self {
                scale: 1.0,
                zero_point: 0,
            };
        }
        let zero_point = (-128.0 - min / scale).round().clamp(-128.0, 127.0) as i32;
        Self { scale, zero_point }
    }

    pub fn quantize(&self, v: f32) -> i8 {
        let q = (v / self.scale).round() + self.zero_point as f32;
        q.clamp(-128.0, 127.0) as i8
    }

    pub fn dequantize(&self, q: i8) -> f32 {
        (i32::from(q) - self.zero_point) as f32 * self.scale
    }
}

/// A positive real multiplier `m ≈ multiplier · 2^(shift − 31)` with `multiplier` in Q31.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedMultiplier {
    pub multiplier: i32,
    pub shift: i32,
}

impl FixedMultiplier {
    pub fn from_real(m: f64) -> Self {
        if !(m > 0.0) || !m.is_finite() {
            return Self {
                multiplier: 0,
                shift: 0,
            };
        }
        // m = q · 2^shift with q in [0.5, 1)
        let mut shift = m.log2().floor() as i32 + 1;
        let mut q = m / 2f64.powi(shift);
        while q >= 1.0 {
            q /= 2.0;
            shift += 1;
        }
        while q < 0.5 {
            q *= 2.0;
            shift -= 1;
        }
        let mut multiplier = (q * (1i64 << 31) as f64).round() as i64;
        if multiplier == 1i64 << 31 {
            multiplier /= 2;
            shift += 1;
        }
        Self {
            multiplier: multiplier as i32,
            shift,
        }
    }

    /// `round(x · m)` in integer arithmetic (round half up), saturated to `i32`.
    pub fn apply(&self, x: i64) -> i32 {
        let prod = i128::from(x) * i128::from(self.multiplier);
        let right = 31 - i64::from(self.shift);
        let v = if right <= 0 {
            prod.saturating_mul(1i128 << (-right).min(63))
        } else if right >= 127 {
            0
        } else {
            (prod + (1i128 << (right - 1))) >> right
        };
        v.clamp(i128::from(i32::MIN), i128::from(i32::MAX)) as i32
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QOp {
    Slice {
        start: usize,
        end: usize,
    },
    /// Row-major `[in, out]` int8 weights; one bias and requantization multiplier
    /// per output channel.
    Dense {
        in_dim: usize,
        out_dim: usize,
        weight: Vec<i8>,
        bias: Vec<i32>,
        multipliers: Vec<FixedMultiplier>,
        relu: bool,
    },
    /// Inference no-op left behind by an unoptimized graph.
    Identity,
    /// One multiplier per input, rescaling into the output parameters.
    Concat { rescale: Vec<FixedMultiplier> },
    Sigmoid { table: Vec<i8> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct QNode {
    pub op: QOp,
    pub inputs: Vec<TensorId>,
    pub output: QParams,
}

/// Integer-only graph; tensor numbering matches [`InferenceGraph`].
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedGraph {
    pub input_dim: usize,
    pub input: QParams,
    pub nodes: Vec<QNode>,
}

/// Lower an optimized float graph to int8 using calibrated ranges. Operators without
/// an integer kernel are rejected, never executed in float.
pub fn quantize_graph(graph: &InferenceGraph, ranges: &[Range]) -> Result<QuantizedGraph, ConversionError> {
    if ranges.len() != graph.tensor_count() {
        return Err(ConversionError::Format(format!(
            "{} ranges for {} tensors",
            ranges.len(),
            graph.tensor_count()
        )));
    }
    let mut params: Vec<QParams> = Vec::with_capacity(graph.tensor_count());
    params.push(QParams::from_range(ranges[0]));
    let mut nodes = Vec::with_capacity(graph.nodes.len());

    for (i, node) in graph.nodes.iter().enumerate() {
        let input = params[node.inputs[0]];
        let (op, output) = match &node.op {
            Op::Slice { start, end } => (
                QOp::Slice {
                    start: *start,
                    end: *end,
                },
                input,
            ),
            Op::Dense { weight, bias, relu } => {
                let output = QParams::from_range(ranges[i + 1]);
                (quantize_dense(i, weight, bias, *relu, input, output)?, output)
            }
            Op::Concat => {
                let output = QParams::from_range(ranges[i + 1]);
                let rescale = node
                    .inputs
                    .iter()
                    .map(|&t| FixedMultiplier::from_real(f64::from(params[t].scale) / f64::from(output.scale)))
                    .collect();
                (QOp::Concat { rescale }, output)
            }
            Op::Sigmoid => {
                let output = QParams {
                    scale: SIGMOID_SCALE,
                    zero_point: SIGMOID_ZERO_POINT,
                };
                (QOp::Sigmoid { table: sigmoid_table(input) }, output)
            }
            Op::Dropout => (QOp::Identity, input),
            Op::BatchNorm { .. } => {
                return Err(ConversionError::UnsupportedOperator { op: node.op.name() });
            }
        };
        params.push(output);
        nodes.push(QNode {
            op,
            inputs: node.inputs.clone(),
            output,
        });
    }

    Ok(QuantizedGraph {
        input_dim: graph.input_dim,
        input: params[0],
        nodes,
    })
}

fn quantize_dense(
    node: usize,
    weight: &ndarray::Array2<f32>,
    bias: &ndarray::Array1<f32>,
    relu: bool,
    input: QParams,
    output: QParams,
) -> Result<QOp, ConversionError> {
    let (in_dim, out_dim) = weight.dim();
    let channel_scales: Vec<f32> = weight
        .columns()
        .into_iter()
        .map(|col| {
            let max_abs = col.iter().fold(0.0f32, |m, v| m.max(v.abs()));
            if max_abs > 0.0 {
                max_abs / 127.0
            } else {
                1.0
            }
        })
        .collect();

    let mut q_weight = Vec::with_capacity(in_dim * out_dim);
    for row in weight.rows() {
        for (v, s) in row.iter().zip(&channel_scales) {
            q_weight.push((v / s).round().clamp(-127.0, 127.0) as i8);
        }
    }
    // A bias that does not fit the int32 accumulator scale means the input range
    // collapsed; reject instead of clamping.
    let q_bias = bias
        .iter()
        .zip(&channel_scales)
        .map(|(b, s)| {
            let acc_scale = f64::from(input.scale) * f64::from(*s);
            let q = (f64::from(*b) / acc_scale).round();
            if q.is_finite() && q >= f64::from(i32::MIN) && q <= f64::from(i32::MAX) {
                Ok(q as i32)
            } else {
                Err(ConversionError::BiasOverflow { node })
            }
        })
        .collect::<Result<Vec<i32>, _>>()?;
    let multipliers = channel_scales
        .iter()
        .map(|s| FixedMultiplier::from_real(f64::from(input.scale) * f64::from(*s) / f64::from(output.scale)))
        .collect();

    Ok(QOp::Dense {
        in_dim,
        out_dim,
        weight: q_weight,
        bias: q_bias,
        multipliers,
        relu,
    })
}

/// 256-entry logistic lookup indexed by `q + 128`.
fn sigmoid_table(input: QParams) -> Vec<i8> {
    let out = QParams {
        scale: SIGMOID_SCALE,
        zero_point: SIGMOID_ZERO_POINT,
    };
    (-128i32..=127)
        .map(|q| out.quantize(crate::model::sigmoid(input.dequantize(q as i8))))
        .collect()
}

impl QuantizedGraph {
    pub fn output_params(&self) -> QParams {
        self.nodes.last().map(|n| n.output).unwrap_or(self.input)
    }

    /// Integer forward pass over an already-quantized row of `input_dim` values.
    /// Returns the output tensor.
    pub fn run(&self, x: &[i8]) -> Vec<i8> {
        let mut tensors: Vec<Vec<i8>> = Vec::with_capacity(self.nodes.len() + 1);
        let mut params: Vec<QParams> = Vec::with_capacity(self.nodes.len() + 1);
        tensors.push(x.to_vec());
        params.push(self.input);

        for node in &self.nodes {
            let a = &tensors[node.inputs[0]];
            let a_zp = params[node.inputs[0]].zero_point;
            let y = match &node.op {
                QOp::Slice { start, end } => a[*start..*end].to_vec(),
                QOp::Identity => a.clone(),
                QOp::Dense {
                    in_dim,
                    out_dim,
                    weight,
                    bias,
                    multipliers,
                    relu,
                } => {
                    let lo = if *relu {
                        node.output.zero_point.max(-128)
                    } else {
                        -128
                    };
                    (0..*out_dim)
                        .map(|j| {
                            let mut acc = i64::from(bias[j]);
                            for i in 0..*in_dim {
                                acc += i64::from(i32::from(a[i]) - a_zp) * i64::from(weight[i * out_dim + j]);
                            }
                            let v = multipliers[j].apply(acc).saturating_add(node.output.zero_point);
                            v.clamp(lo, 127) as i8
                        })
                        .collect()
                }
                QOp::Concat { rescale } => node
                    .inputs
                    .iter()
                    .zip(rescale)
                    .flat_map(|(&t, m)| {
                        let zp = params[t].zero_point;
                        tensors[t].iter().map(move |&q| {
                            let v = m.apply(i64::from(i32::from(q) - zp)) + node.output.zero_point;
                            v.clamp(-128, 127) as i8
                        })
                    })
                    .collect(),
                QOp::Sigmoid { table } => a.iter().map(|&q| table[(i32::from(q) + 128) as usize]).collect(),
            };
            tensors.push(y);
            params.push(node.output);
        }
        tensors.pop().unwrap_or_default()
    }

    /// Quantize a float row, run the integer graph, dequantize the single output.
    pub fn predict(&self, x: &[f32]) -> f32 {
        let q: Vec<i8> = x.iter().map(|&v| self.input.quantize(v)).collect();
        let out = self.run(&q);
        out.first().map(|&v| self.output_params().dequantize(v)).unwrap_or(0.0)
    }
}
