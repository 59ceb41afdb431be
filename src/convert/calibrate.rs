//! Activation range calibration over a representative input stream.

use super::graph::InferenceGraph;
use crate::error::ConversionError;

/// Observed `[min, max]` of one tensor. Always contains 0 so zero is exactly representable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    pub min: f32,
    pub max: f32,
}

impl Default for Range {
    fn default() -> Self {
        Self { min: 0.0, max: 0.0 }
    }
}

impl Range {
    fn observe(&mut self, values: &[f32]) {
        for &v in values {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
    }
}

/// Run the float graph over every sample and record per-tensor ranges.
pub fn calibrate<'a, I>(graph: &InferenceGraph, samples: I) -> Result<Vec<Range>, ConversionError>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut ranges = vec![Range::default(); graph.tensor_count()];
    let mut seen = 0usize;
    for sample in samples {
        if sample.len() != graph.input_dim {
            return Err(ConversionError::CalibrationShape {
                expected: graph.input_dim,
                got: sample.len(),
            });
        }
        for (range, tensor) in ranges.iter_mut().zip(graph.evaluate(sample)) {
            range.observe(&tensor);
        }
        seen += 1;
    }
    if seen == 0 {
        return Err(ConversionError::EmptyCalibration);
    }
    if let Some(node) = ranges.iter().position(|r| !r.min.is_finite() || !r.max.is_finite()) {
        return Err(ConversionError::InvalidRange { node });
    }
    tracing::debug!(samples = seen, tensors = ranges.len(), "calibration complete");
    Ok(ranges)
}
