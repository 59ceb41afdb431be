//! Inference graph: the trained model lowered to a flat list of operators.
//!
//! Tensor `0` is the graph input; node `i` produces tensor `i + 1`. Nodes are stored
//! in topological order, and the last node produces the graph output.

use crate::model::{Activation, FraudModel, Layer, Sequential};
use ndarray::{Array1, Array2, ArrayView1};

pub type TensorId = usize;

pub const INPUT: TensorId = 0;

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Columns `start..end` of the input tensor.
    Slice { start: usize, end: usize },
    /// `y = x · W + b`, optionally followed by ReLU.
    Dense {
        weight: Array2<f32>,
        bias: Array1<f32>,
        relu: bool,
    },
    /// Inference-time batch normalization, `y = x * scale + shift`.
    BatchNorm {
        scale: Array1<f32>,
        shift: Array1<f32>,
    },
    Dropout,
    Concat,
    Sigmoid,
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Slice { .. } => "slice",
            Op::Dense { .. } => "fully_connected",
            Op::BatchNorm { .. } => "batch_norm",
            Op::Dropout => "dropout",
            Op::Concat => "concatenation",
            Op::Sigmoid => "logistic",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub op: Op,
    pub inputs: Vec<TensorId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceGraph {
    pub input_dim: usize,
    pub nodes: Vec<Node>,
}

impl InferenceGraph {
    pub fn lower(model: &FraudModel) -> Self {
        let mut graph = Self {
            input_dim: model.input_dim(),
            nodes: Vec::new(),
        };
        match model {
            FraudModel::Branch { net, .. } => {
                graph.push_chain(net, INPUT);
            }
            FraudModel::Ensemble(e) => {
                let mut embeddings = Vec::with_capacity(e.branches.len());
                for b in &e.branches {
                    let r = b.modality.range();
                    let slice = graph.push(
                        Op::Slice {
                            start: r.start,
                            end: r.end,
                        },
                        vec![INPUT],
                    );
                    embeddings.push(graph.push_chain(&b.net, slice));
                }
                let joined = graph.push(Op::Concat, embeddings);
                graph.push_chain(&e.head, joined);
            }
        }
        graph
    }

    fn push(&mut self, op: Op, inputs: Vec<TensorId>) -> TensorId {
        self.nodes.push(Node { op, inputs });
        self.nodes.len()
    }

    fn push_chain(&mut self, net: &Sequential, mut t: TensorId) -> TensorId {
        for layer in &net.layers {
            t = match layer {
                Layer::Dense(d) => {
                    let relu = d.activation == Activation::Relu;
                    let dense = self.push(
                        Op::Dense {
                            weight: d.weight.clone(),
                            bias: d.bias.clone(),
                            relu,
                        },
                        vec![t],
                    );
                    if d.activation == Activation::Sigmoid {
                        self.push(Op::Sigmoid, vec![dense])
                    } else {
                        dense
                    }
                }
                Layer::Dropout(_) => self.push(Op::Dropout, vec![t]),
                Layer::BatchNorm(bn) => {
                    let (scale, shift) = bn.affine();
                    self.push(Op::BatchNorm { scale, shift }, vec![t])
                }
            };
        }
        t
    }

    pub fn output(&self) -> TensorId {
        self.nodes.len()
    }

    pub fn tensor_count(&self) -> usize {
        self.nodes.len() + 1
    }

    /// Width of every tensor, input first.
    pub fn tensor_widths(&self) -> Vec<usize> {
        let mut widths = Vec::with_capacity(self.tensor_count());
        widths.push(self.input_dim);
        for node in &self.nodes {
            let w = match &node.op {
                Op::Slice { start, end } => end - start,
                Op::Dense { weight, .. } => weight.ncols(),
                Op::Concat => node.inputs.iter().map(|&t| widths[t]).sum(),
                Op::BatchNorm { .. } | Op::Dropout | Op::Sigmoid => widths[node.inputs[0]],
            };
            widths.push(w);
        }
        widths
    }

    fn consumers(&self, tensor: TensorId) -> impl Iterator<Item = usize> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(move |(_, n)| n.inputs.contains(&tensor))
            .map(|(i, _)| i)
    }

    /// True when `tensor` reaches exactly one dense node, possibly through dropouts.
    fn feeds_single_dense(&self, tensor: TensorId) -> bool {
        let consumers: Vec<usize> = self.consumers(tensor).collect();
        match consumers.as_slice() {
            [only] => match self.nodes[*only].op {
                Op::Dense { .. } => true,
                Op::Dropout => self.feeds_single_dense(only + 1),
                _ => false,
            },
            _ => false,
        }
    }

    /// Drop dropout nodes and fold batch normalization into the dense layer it feeds.
    /// A batch-norm that cannot be folded stays in the graph.
    pub fn optimize(&self) -> Self {
        let mut remap: Vec<TensorId> = vec![INPUT];
        let mut pending: Vec<Option<(Array1<f32>, Array1<f32>)>> = vec![None];
        let mut out = Self {
            input_dim: self.input_dim,
            nodes: Vec::with_capacity(self.nodes.len()),
        };

        for (i, node) in self.nodes.iter().enumerate() {
            let tensor = i + 1;
            let src = node.inputs[0];
            match &node.op {
                Op::Dropout => {
                    remap.push(remap[src]);
                    pending.push(pending[src].clone());
                    continue;
                }
                Op::BatchNorm { scale, shift } if self.feeds_single_dense(tensor) => {
                    remap.push(remap[src]);
                    pending.push(Some((scale.clone(), shift.clone())));
                    continue;
                }
                _ => {}
            }
            let op = match (&node.op, &pending[src]) {
                (Op::Dense { weight, bias, relu }, Some((scale, shift))) => fold(weight, bias, *relu, scale, shift),
                (op, _) => op.clone(),
            };
            let inputs = node.inputs.iter().map(|&t| remap[t]).collect();
            remap.push(out.push(op, inputs));
            pending.push(None);
        }
        debug_assert_eq!(remap.len(), self.tensor_count());
        out
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.iter().any(|n| n.op.name() == name)
    }

    /// Float evaluation of one row. Returns every tensor, input first.
    pub fn evaluate(&self, x: &[f32]) -> Vec<Vec<f32>> {
        let mut tensors: Vec<Vec<f32>> = Vec::with_capacity(self.tensor_count());
        tensors.push(x.to_vec());
        for node in &self.nodes {
            let a = &tensors[node.inputs[0]];
            let y = match &node.op {
                Op::Slice { start, end } => a[*start..*end].to_vec(),
                Op::Dense { weight, bias, relu } => {
                    let mut y = ArrayView1::from(a.as_slice()).dot(weight) + bias;
                    if *relu {
                        y.mapv_inplace(|v| v.max(0.0));
                    }
                    y.to_vec()
                }
                Op::BatchNorm { scale, shift } => a
                    .iter()
                    .zip(scale.iter().zip(shift.iter()))
                    .map(|(v, (s, b))| v * s + b)
                    .collect(),
                Op::Dropout => a.clone(),
                Op::Concat => node.inputs.iter().flat_map(|&t| tensors[t].iter().copied()).collect(),
                Op::Sigmoid => a.iter().map(|&v| crate::model::sigmoid(v)).collect(),
            };
            tensors.push(y);
        }
        tensors
    }

    pub fn predict(&self, x: &[f32]) -> f32 {
        let mut tensors = self.evaluate(x);
        tensors.pop().and_then(|t| t.first().copied()).unwrap_or(0.0)
    }
}

/// `(x * s + t) · W + b  =  x · (diag(s) W) + (t · W + b)`
fn fold(weight: &Array2<f32>, bias: &Array1<f32>, relu: bool, scale: &Array1<f32>, shift: &Array1<f32>) -> Op {
    let mut w = weight.clone();
    for (mut row, &s) in w.rows_mut().into_iter().zip(scale.iter()) {
        row *= s;
    }
    Op::Dense {
        bias: shift.dot(weight) + bias,
        weight: w,
        relu,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Modality, FEATURE_DIM};
    use crate::model::{build_branch, build_ensemble, Layer};
    use crate::training::seeded_rng;
    use ndarray::Array2;

    fn perturb_batch_norm(model: &mut FraudModel) {
        if let FraudModel::Branch { net, .. } = model {
            for layer in &mut net.layers {
                if let Layer::BatchNorm(bn) = layer {
                    bn.moving_mean.mapv_inplace(|_| 0.3);
                    bn.moving_var.mapv_inplace(|_| 2.5);
                    bn.gamma.mapv_inplace(|_| 1.4);
                    bn.beta.mapv_inplace(|_| -0.2);
                }
            }
        }
    }

    #[test]
    fn lowering_matches_model_inference() {
        let mut rng = seeded_rng(11, 0);
        let model = build_ensemble(&mut rng);
        let graph = InferenceGraph::lower(&model);
        let x = Array2::from_shape_fn((4, FEATURE_DIM), |(r, c)| ((r * 3 + c) % 7) as f32 - 3.0);
        let expected = model.predict(x.view());
        for (row, want) in x.rows().into_iter().zip(expected.iter()) {
            let got = graph.predict(row.as_slice().unwrap());
            assert!((got - want).abs() < 1e-5);
        }
        assert_eq!(graph.nodes.iter().filter(|n| n.op == Op::Concat).count(), 1);
    }

    #[test]
    fn optimization_folds_batch_norm_and_keeps_outputs() {
        let mut rng = seeded_rng(12, 0);
        let mut model = build_branch(Modality::TouchDynamics, &mut rng);
        perturb_batch_norm(&mut model);
        let raw = InferenceGraph::lower(&model);
        let opt = raw.optimize();
        assert!(raw.contains("batch_norm") && raw.contains("dropout"));
        assert!(!opt.contains("batch_norm") && !opt.contains("dropout"));
        assert!(opt.nodes.len() < raw.nodes.len());
        for r in 0..5 {
            let x: Vec<f32> = (0..10).map(|c| ((r + c) as f32 * 0.37).sin() * 2.0).collect();
            assert!((raw.predict(&x) - opt.predict(&x)).abs() < 1e-5);
        }
    }

    #[test]
    fn tensor_widths_follow_the_layout() {
        let mut rng = seeded_rng(13, 0);
        let graph = InferenceGraph::lower(&build_ensemble(&mut rng)).optimize();
        let widths = graph.tensor_widths();
        assert_eq!(widths[INPUT], FEATURE_DIM);
        assert_eq!(widths[graph.output()], 1);
        let concat = graph.nodes.iter().position(|n| n.op == Op::Concat).unwrap();
        assert_eq!(widths[concat + 1], 16 + 16 + 8 + 8);
    }
}
