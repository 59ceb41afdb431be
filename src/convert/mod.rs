//! Edge conversion: graph optimization, range calibration, and int8 lowering into a
//! compact deployable artifact.

mod calibrate;
mod format;
mod graph;
mod quantize;

pub use calibrate::{calibrate, Range};
pub use format::{encode_float, encode_int8, ArtifactFormat, EdgeModel, MAGIC, VERSION};
pub use graph::{InferenceGraph, Node, Op, TensorId};
pub use quantize::{quantize_graph, FixedMultiplier, QNode, QOp, QParams, QuantizedGraph};

use crate::config::TrainingConfig;
use crate::error::ConversionError;
use crate::model::FraudModel;
use ndarray::ArrayView2;
use sha2::{Digest, Sha256};
use tracing::info;

/// Serialized edge model. Immutable once produced.
#[derive(Debug, Clone)]
pub struct QuantizedArtifact {
    pub bytes: Vec<u8>,
    /// Length of `bytes`, measured after encoding.
    pub size_bytes: usize,
    pub sha256: String,
    pub format: ArtifactFormat,
}

impl QuantizedArtifact {
    fn new(bytes: Vec<u8>, format: ArtifactFormat) -> Self {
        let mut h = Sha256::new();
        h.update(&bytes);
        Self {
            size_bytes: bytes.len(),
            sha256: format!("{:x}", h.finalize()),
            bytes,
            format,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EdgeConverter {
    pub optimize: bool,
    pub quantize: bool,
}

impl EdgeConverter {
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            optimize: config.tflite_optimization,
            quantize: config.quantization,
        }
    }

    /// Convert `model`. `calibration` holds normalized full-width (34 column) rows and
    /// is required when quantizing; each row is sliced to the model's input columns.
    pub fn convert(
        &self,
        model: &FraudModel,
        calibration: Option<ArrayView2<'_, f32>>,
    ) -> Result<QuantizedArtifact, ConversionError> {
        let mut graph = InferenceGraph::lower(model);
        if self.optimize {
            graph = graph.optimize();
        }

        let artifact = if self.quantize {
            let rows = calibration.ok_or(ConversionError::MissingCalibration)?;
            let rows = model.select_input(rows).to_owned();
            let ranges = calibrate(&graph, rows.rows().into_iter().map(|r| r.to_slice().unwrap_or(&[])))?;
            let q = quantize_graph(&graph, &ranges)?;
            QuantizedArtifact::new(encode_int8(model.name(), &q), ArtifactFormat::Int8)
        } else {
            QuantizedArtifact::new(encode_float(model.name(), &graph), ArtifactFormat::Float32)
        };

        info!(
            model = model.name(),
            format = ?artifact.format,
            nodes = graph.nodes.len(),
            size_bytes = artifact.size_bytes,
            "model converted"
        );
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Modality, FEATURE_DIM};
    use crate::model::{build_branch, build_ensemble};
    use crate::training::seeded_rng;
    use ndarray::{s, Array2};
    use rand_distr::{Distribution, Normal};

    fn rows(n: usize, offset: usize) -> Array2<f32> {
        Array2::from_shape_fn((n, FEATURE_DIM), |(r, c)| {
            (((r + offset) * 13 + c * 7) % 29) as f32 / 29.0 * 2.4 - 1.2
        })
    }

    fn normal_rows(n: usize, stream: u64) -> Array2<f32> {
        let mut rng = seeded_rng(500, stream);
        let dist = Normal::new(0.0f32, 0.8).unwrap();
        Array2::from_shape_fn((n, FEATURE_DIM), |_| dist.sample(&mut rng))
    }

    #[test]
    fn conversion_is_deterministic() {
        let mut rng = seeded_rng(51, 0);
        let model = build_ensemble(&mut rng);
        let cal = rows(100, 0);
        let converter = EdgeConverter {
            optimize: true,
            quantize: true,
        };
        let a = converter.convert(&model, Some(cal.view())).unwrap();
        let b = converter.convert(&model, Some(cal.view())).unwrap();
        assert_eq!(a.bytes, b.bytes);
        assert_eq!(a.sha256, b.sha256);
        assert_eq!(a.size_bytes, a.bytes.len());
        assert_eq!(a.format, ArtifactFormat::Int8);
    }

    #[test]
    fn int8_artifact_stays_close_to_float_model_on_unseen_rows() {
        let mut rng = seeded_rng(52, 0);
        let model = build_branch(Modality::TouchDynamics, &mut rng);
        let cal = normal_rows(100, 1);
        let converter = EdgeConverter {
            optimize: true,
            quantize: true,
        };
        let artifact = converter.convert(&model, Some(cal.view())).unwrap();
        let edge = EdgeModel::from_bytes(&artifact.bytes).unwrap();
        assert_eq!(edge.input_dim(), 10);
        let held_out = normal_rows(50, 2);
        let float = model.predict(model.select_input(held_out.view()));
        for (row, p) in held_out.rows().into_iter().zip(float.iter()) {
            let x = row.slice(s![10..20]).to_vec();
            let q = edge.predict(&x).unwrap();
            assert!((q - p).abs() <= 0.05, "int8 {q} vs float {p}");
        }
    }

    #[test]
    fn edge_model_rejects_rows_of_the_wrong_width() {
        let mut rng = seeded_rng(56, 0);
        let model = build_branch(Modality::TypingRhythm, &mut rng);
        let cal = rows(20, 0);
        for quantize in [true, false] {
            let converter = EdgeConverter { optimize: true, quantize };
            let artifact = converter.convert(&model, Some(cal.view())).unwrap();
            let edge = EdgeModel::from_bytes(&artifact.bytes).unwrap();
            assert!(matches!(
                edge.predict(&[0.1; 4]),
                Err(ConversionError::InputWidth { expected: 10, got: 4 })
            ));
            assert!(edge.predict(&[0.1; 10]).is_ok());
        }
    }

    #[test]
    fn quantization_requires_calibration() {
        let mut rng = seeded_rng(53, 0);
        let model = build_branch(Modality::TypingRhythm, &mut rng);
        let converter = EdgeConverter {
            optimize: true,
            quantize: true,
        };
        assert!(matches!(
            converter.convert(&model, None),
            Err(ConversionError::MissingCalibration)
        ));
    }

    #[test]
    fn unoptimized_batch_norm_blocks_int8() {
        let mut rng = seeded_rng(54, 0);
        let model = build_branch(Modality::TouchDynamics, &mut rng);
        let cal = rows(10, 0);
        let converter = EdgeConverter {
            optimize: false,
            quantize: true,
        };
        assert!(matches!(
            converter.convert(&model, Some(cal.view())),
            Err(ConversionError::UnsupportedOperator { .. })
        ));
    }

    #[test]
    fn float_artifact_needs_no_calibration() {
        let mut rng = seeded_rng(55, 0);
        let model = build_branch(Modality::DeviceOrientation, &mut rng);
        let converter = EdgeConverter {
            optimize: false,
            quantize: false,
        };
        let artifact = converter.convert(&model, None).unwrap();
        assert_eq!(artifact.format, ArtifactFormat::Float32);
        let edge = EdgeModel::from_bytes(&artifact.bytes).unwrap();
        let x = rows(1, 0);
        let want = model.predict(model.select_input(x.view()))[0];
        let got = edge.predict(&x.row(0).slice(s![20..28]).to_vec()).unwrap();
        assert!((want - got).abs() < 1e-6);
    }
}
