//! `BGQM` binary artifact: deterministic little-endian encoding of a float or int8 graph.
//!
//! ```text
//! magic "BGQM" | version u16 | format u8 | name (u16 len + utf8) | input_dim u32
//! [int8: input qparams] | node count u32 | nodes...
//! ```

use super::graph::{InferenceGraph, Node, Op};
use super::quantize::{FixedMultiplier, QNode, QOp, QParams, QuantizedGraph};
use crate::error::ConversionError;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

pub const MAGIC: &[u8; 4] = b"BGQM";
pub const VERSION: u16 = 1;

const OP_SLICE: u8 = 1;
const OP_DENSE: u8 = 2;
const OP_BATCH_NORM: u8 = 3;
const OP_DROPOUT: u8 = 4;
const OP_CONCAT: u8 = 5;
const OP_SIGMOID: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactFormat {
    Float32,
    Int8,
}

impl ArtifactFormat {
    fn tag(self) -> u8 {
        match self {
            ArtifactFormat::Float32 => 0,
            ArtifactFormat::Int8 => 1,
        }
    }
}

struct Writer(Vec<u8>);

impl Writer {
    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }
    fn u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn u32(&mut self, v: usize) {
        self.0.extend_from_slice(&(v as u32).to_le_bytes());
    }
    fn i32(&mut self, v: i32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn f32(&mut self, v: f32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn f32s<'a>(&mut self, vs: impl IntoIterator<Item = &'a f32>) {
        vs.into_iter().for_each(|&v| self.f32(v));
    }
    fn qparams(&mut self, p: QParams) {
        self.f32(p.scale);
        self.i32(p.zero_point);
    }
    fn multiplier(&mut self, m: FixedMultiplier) {
        self.i32(m.multiplier);
        self.i32(m.shift);
    }
    fn inputs(&mut self, inputs: &[usize]) {
        self.u32(inputs.len());
        inputs.iter().for_each(|&t| self.u32(t));
    }
    fn header(&mut self, format: ArtifactFormat, name: &str, input_dim: usize) {
        self.0.extend_from_slice(MAGIC);
        self.u16(VERSION);
        self.u8(format.tag());
        self.u16(name.len() as u16);
        self.0.extend_from_slice(name.as_bytes());
        self.u32(input_dim);
    }
}

pub fn encode_float(name: &str, graph: &InferenceGraph) -> Vec<u8> {
    let mut w = Writer(Vec::new());
    w.header(ArtifactFormat::Float32, name, graph.input_dim);
    w.u32(graph.nodes.len());
    for node in &graph.nodes {
        match &node.op {
            Op::Slice { start, end } => {
                w.u8(OP_SLICE);
                w.inputs(&node.inputs);
                w.u32(*start);
                w.u32(*end);
            }
            Op::Dense { weight, bias, relu } => {
                w.u8(OP_DENSE);
                w.inputs(&node.inputs);
                w.u8(u8::from(*relu));
                w.u32(weight.nrows());
                w.u32(weight.ncols());
                w.f32s(weight.iter());
                w.f32s(bias.iter());
            }
            Op::BatchNorm { scale, shift } => {
                w.u8(OP_BATCH_NORM);
                w.inputs(&node.inputs);
                w.u32(scale.len());
                w.f32s(scale.iter());
                w.f32s(shift.iter());
            }
            Op::Dropout => {
                w.u8(OP_DROPOUT);
                w.inputs(&node.inputs);
            }
            Op::Concat => {
                w.u8(OP_CONCAT);
                w.inputs(&node.inputs);
            }
            Op::Sigmoid => {
                w.u8(OP_SIGMOID);
                w.inputs(&node.inputs);
            }
        }
    }
    w.0
}

pub fn encode_int8(name: &str, graph: &QuantizedGraph) -> Vec<u8> {
    let mut w = Writer(Vec::new());
    w.header(ArtifactFormat::Int8, name, graph.input_dim);
    w.qparams(graph.input);
    w.u32(graph.nodes.len());
    for node in &graph.nodes {
        match &node.op {
            QOp::Slice { start, end } => {
                w.u8(OP_SLICE);
                w.inputs(&node.inputs);
                w.u32(*start);
                w.u32(*end);
            }
            QOp::Dense {
                in_dim,
                out_dim,
                weight,
                bias,
                multipliers,
                relu,
            } => {
                w.u8(OP_DENSE);
                w.inputs(&node.inputs);
                w.u8(u8::from(*relu));
                w.u32(*in_dim);
                w.u32(*out_dim);
                w.0.extend(weight.iter().map(|&v| v as u8));
                bias.iter().for_each(|&b| w.i32(b));
                multipliers.iter().for_each(|&m| w.multiplier(m));
            }
            QOp::Identity => {
                w.u8(OP_DROPOUT);
                w.inputs(&node.inputs);
            }
            QOp::Concat { rescale } => {
                w.u8(OP_CONCAT);
                w.inputs(&node.inputs);
                rescale.iter().for_each(|&m| w.multiplier(m));
            }
            QOp::Sigmoid { table } => {
                w.u8(OP_SIGMOID);
                w.inputs(&node.inputs);
                w.0.extend(table.iter().map(|&v| v as u8));
            }
        }
        w.qparams(node.output);
    }
    w.0
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

fn truncated() -> ConversionError {
    ConversionError::Format("unexpected end of artifact".to_string())
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ConversionError> {
        let end = self.pos.checked_add(n).ok_or_else(truncated)?;
        let bytes = self.buf.get(self.pos..end).ok_or_else(truncated)?;
        self.pos = end;
        Ok(bytes)
    }
    fn array<const N: usize>(&mut self) -> Result<[u8; N], ConversionError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
    fn u8(&mut self) -> Result<u8, ConversionError> {
        Ok(self.array::<1>()?[0])
    }
    fn u16(&mut self) -> Result<u16, ConversionError> {
        Ok(u16::from_le_bytes(self.array()?))
    }
    fn u32(&mut self) -> Result<usize, ConversionError> {
        Ok(u32::from_le_bytes(self.array()?) as usize)
    }
    fn i32(&mut self) -> Result<i32, ConversionError> {
        Ok(i32::from_le_bytes(self.array()?))
    }
    fn f32(&mut self) -> Result<f32, ConversionError> {
        Ok(f32::from_le_bytes(self.array()?))
    }
    fn f32s(&mut self, n: usize) -> Result<Vec<f32>, ConversionError> {
        (0..n).map(|_| self.f32()).collect()
    }
    fn i8s(&mut self, n: usize) -> Result<Vec<i8>, ConversionError> {
        Ok(self.take(n)?.iter().map(|&b| b as i8).collect())
    }
    fn qparams(&mut self) -> Result<QParams, ConversionError> {
        Ok(QParams {
            scale: self.f32()?,
            zero_point: self.i32()?,
        })
    }
    fn multiplier(&mut self) -> Result<FixedMultiplier, ConversionError> {
        Ok(FixedMultiplier {
            multiplier: self.i32()?,
            shift: self.i32()?,
        })
    }
    /// Input tensor ids; each must refer to the graph input or an earlier node.
    fn inputs(&mut self, node: usize) -> Result<Vec<usize>, ConversionError> {
        let n = self.u32()?;
        let inputs: Vec<usize> = (0..n).map(|_| self.u32()).collect::<Result<_, _>>()?;
        if inputs.is_empty() || inputs.iter().any(|&t| t > node) {
            return Err(ConversionError::Format(format!("node {node} has invalid inputs {inputs:?}")));
        }
        Ok(inputs)
    }
    fn dims(&mut self) -> Result<(usize, usize), ConversionError> {
        let (rows, cols) = (self.u32()?, self.u32()?);
        rows.checked_mul(cols).ok_or_else(truncated)?;
        Ok((rows, cols))
    }
    fn finish(&self) -> Result<(), ConversionError> {
        if self.pos != self.buf.len() {
            return Err(ConversionError::Format(format!(
                "{} trailing bytes",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

/// A decoded artifact ready to score full-precision feature rows.
#[derive(Debug, Clone)]
pub enum EdgeModel {
    Float { name: String, graph: InferenceGraph },
    Int8 { name: String, graph: QuantizedGraph },
}

impl EdgeModel {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConversionError> {
        let mut r = Reader { buf: bytes, pos: 0 };
        if r.take(4)? != MAGIC {
            return Err(ConversionError::Format("bad magic".to_string()));
        }
        let version = r.u16()?;
        if version != VERSION {
            return Err(ConversionError::Format(format!("unsupported version {version}")));
        }
        let format = r.u8()?;
        let name_len = r.u16()? as usize;
        let name = String::from_utf8(r.take(name_len)?.to_vec())
            .map_err(|e| ConversionError::Format(e.to_string()))?;
        let input_dim = r.u32()?;

        let model = match format {
            0 => EdgeModel::Float {
                graph: decode_float(&mut r, input_dim)?,
                name,
            },
            1 => EdgeModel::Int8 {
                graph: decode_int8(&mut r, input_dim)?,
                name,
            },
            other => return Err(ConversionError::Format(format!("unknown format tag {other}"))),
        };
        r.finish()?;
        Ok(model)
    }

    pub fn name(&self) -> &str {
        match self {
            EdgeModel::Float { name, .. } | EdgeModel::Int8 { name, .. } => name,
        }
    }

    pub fn format(&self) -> ArtifactFormat {
        match self {
            EdgeModel::Float { .. } => ArtifactFormat::Float32,
            EdgeModel::Int8 { .. } => ArtifactFormat::Int8,
        }
    }

    pub fn input_dim(&self) -> usize {
        match self {
            EdgeModel::Float { graph, .. } => graph.input_dim,
            EdgeModel::Int8 { graph, .. } => graph.input_dim,
        }
    }

    /// Fraud probability for one normalized row of this model's input width.
    pub fn predict(&self, x: &[f32]) -> Result<f32, ConversionError> {
        if x.len() != self.input_dim() {
            return Err(ConversionError::InputWidth {
                expected: self.input_dim(),
                got: x.len(),
            });
        }
        Ok(match self {
            EdgeModel::Float { graph, .. } => graph.predict(x),
            EdgeModel::Int8 { graph, .. } => graph.predict(x),
        })
    }
}

/// Tensor widths seen so far while decoding; every node is checked against the
/// width of the tensors it reads so a decoded graph never indexes out of bounds.
struct Widths(Vec<usize>);

impl Widths {
    fn of(&self, inputs: &[usize]) -> usize {
        self.0[inputs[0]]
    }

    fn slice(&self, node: usize, inputs: &[usize], start: usize, end: usize) -> Result<usize, ConversionError> {
        if start > end || end > self.of(inputs) {
            return Err(shape_error(node, format!("slice {start}..{end} of width {}", self.of(inputs))));
        }
        Ok(end - start)
    }

    fn dense(&self, node: usize, inputs: &[usize], in_dim: usize) -> Result<(), ConversionError> {
        if in_dim != self.of(inputs) {
            return Err(shape_error(node, format!("dense expects {in_dim}, input has {}", self.of(inputs))));
        }
        Ok(())
    }

    fn concat(&self, inputs: &[usize]) -> usize {
        inputs.iter().map(|&t| self.0[t]).sum()
    }
}

fn shape_error(node: usize, detail: String) -> ConversionError {
    ConversionError::Format(format!("node {node}: {detail}"))
}

fn decode_float(r: &mut Reader<'_>, input_dim: usize) -> Result<InferenceGraph, ConversionError> {
    let count = r.u32()?;
    let mut nodes = Vec::with_capacity(count.min(1024));
    let mut widths = Widths(vec![input_dim]);
    for i in 0..count {
        let tag = r.u8()?;
        let inputs = r.inputs(i)?;
        let (op, width) = match tag {
            OP_SLICE => {
                let (start, end) = (r.u32()?, r.u32()?);
                let width = widths.slice(i, &inputs, start, end)?;
                (Op::Slice { start, end }, width)
            }
            OP_DENSE => {
                let relu = r.u8()? != 0;
                let (rows, cols) = r.dims()?;
                widths.dense(i, &inputs, rows)?;
                let weight = Array2::from_shape_vec((rows, cols), r.f32s(rows * cols)?)
                    .map_err(|e| ConversionError::Format(e.to_string()))?;
                let bias = Array1::from(r.f32s(cols)?);
                (Op::Dense { weight, bias, relu }, cols)
            }
            OP_BATCH_NORM => {
                let n = r.u32()?;
                if n != widths.of(&inputs) {
                    return Err(shape_error(i, format!("batch norm over {n}, input has {}", widths.of(&inputs))));
                }
                let op = Op::BatchNorm {
                    scale: Array1::from(r.f32s(n)?),
                    shift: Array1::from(r.f32s(n)?),
                };
                (op, n)
            }
            OP_DROPOUT => (Op::Dropout, widths.of(&inputs)),
            OP_CONCAT => (Op::Concat, widths.concat(&inputs)),
            OP_SIGMOID => (Op::Sigmoid, widths.of(&inputs)),
            other => return Err(ConversionError::Format(format!("unknown opcode {other}"))),
        };
        widths.0.push(width);
        nodes.push(Node { op, inputs });
    }
    Ok(InferenceGraph { input_dim, nodes })
}

fn decode_int8(r: &mut Reader<'_>, input_dim: usize) -> Result<QuantizedGraph, ConversionError> {
    let input = r.qparams()?;
    let count = r.u32()?;
    let mut nodes = Vec::with_capacity(count.min(1024));
    let mut widths = Widths(vec![input_dim]);
    for i in 0..count {
        let tag = r.u8()?;
        let inputs = r.inputs(i)?;
        let (op, width) = match tag {
            OP_SLICE => {
                let (start, end) = (r.u32()?, r.u32()?);
                let width = widths.slice(i, &inputs, start, end)?;
                (QOp::Slice { start, end }, width)
            }
            OP_DENSE => {
                let relu = r.u8()? != 0;
                let (in_dim, out_dim) = r.dims()?;
                widths.dense(i, &inputs, in_dim)?;
                let weight = r.i8s(in_dim * out_dim)?;
                let bias = (0..out_dim).map(|_| r.i32()).collect::<Result<_, _>>()?;
                let multipliers = (0..out_dim).map(|_| r.multiplier()).collect::<Result<_, _>>()?;
                let op = QOp::Dense {
                    in_dim,
                    out_dim,
                    weight,
                    bias,
                    multipliers,
                    relu,
                };
                (op, out_dim)
            }
            OP_DROPOUT => (QOp::Identity, widths.of(&inputs)),
            OP_CONCAT => {
                let rescale = (0..inputs.len()).map(|_| r.multiplier()).collect::<Result<_, _>>()?;
                (QOp::Concat { rescale }, widths.concat(&inputs))
            }
            OP_SIGMOID => (QOp::Sigmoid { table: r.i8s(256)? }, widths.of(&inputs)),
            other => return Err(ConversionError::Format(format!("opcode {other} in int8 artifact"))),
        };
        widths.0.push(width);
        let output = r.qparams()?;
        nodes.push(QNode { op, inputs, output });
    }
    Ok(QuantizedGraph {
        input_dim,
        input,
        nodes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::Modality;
    use crate::model::{build_branch, build_ensemble};
    use crate::training::seeded_rng;

    #[test]
    fn float_artifact_decodes_to_the_same_graph() {
        let mut rng = seeded_rng(41, 0);
        let graph = InferenceGraph::lower(&build_branch(Modality::TouchDynamics, &mut rng));
        let bytes = encode_float("touch_dynamics", &graph);
        assert_eq!(&bytes[..4], MAGIC);
        let model = EdgeModel::from_bytes(&bytes).unwrap();
        assert_eq!(model.name(), "touch_dynamics");
        assert_eq!(model.format(), ArtifactFormat::Float32);
        let EdgeModel::Float { graph: decoded, .. } = model else { unreachable!() };
        assert_eq!(decoded, graph);
    }

    #[test]
    fn corrupt_artifacts_are_rejected() {
        let mut rng = seeded_rng(42, 0);
        let graph = InferenceGraph::lower(&build_branch(Modality::NavigationPattern, &mut rng));
        let bytes = encode_float("navigation_pattern", &graph);

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(EdgeModel::from_bytes(&bad_magic).is_err());
        assert!(EdgeModel::from_bytes(&bytes[..bytes.len() - 3]).is_err());
        let mut trailing = bytes;
        trailing.push(0);
        assert!(matches!(EdgeModel::from_bytes(&trailing), Err(ConversionError::Format(_))));
    }

    #[test]
    fn inconsistent_tensor_widths_are_rejected() {
        let mut rng = seeded_rng(43, 0);
        let mut ensemble = InferenceGraph::lower(&build_ensemble(&mut rng)).optimize();
        let slice = ensemble
            .nodes
            .iter()
            .position(|n| matches!(n.op, Op::Slice { .. }))
            .unwrap();
        ensemble.nodes[slice].op = Op::Slice { start: 30, end: 40 };
        assert!(matches!(
            EdgeModel::from_bytes(&encode_float("ensemble_fraud_model", &ensemble)),
            Err(ConversionError::Format(_))
        ));

        let mut branch = InferenceGraph::lower(&build_branch(Modality::TypingRhythm, &mut rng)).optimize();
        branch.input_dim = 4;
        assert!(matches!(
            EdgeModel::from_bytes(&encode_float("typing_rhythm", &branch)),
            Err(ConversionError::Format(_))
        ));

        let q = QuantizedGraph {
            input_dim: 4,
            input: QParams {
                scale: 0.1,
                zero_point: 0,
            },
            nodes: vec![QNode {
                op: QOp::Dense {
                    in_dim: 5,
                    out_dim: 1,
                    weight: vec![1; 5],
                    bias: vec![0],
                    multipliers: vec![FixedMultiplier::from_real(0.5)],
                    relu: false,
                },
                inputs: vec![0],
                output: QParams {
                    scale: 0.1,
                    zero_point: 0,
                },
            }],
        };
        assert!(matches!(
            EdgeModel::from_bytes(&encode_int8("typing_rhythm", &q)),
            Err(ConversionError::Format(_))
        ));
    }
}
