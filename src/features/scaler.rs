//! Zero-mean / unit-variance scaling with persisted parameters.

use super::{FEATURE_DIM, LAYOUT_VERSION};
use crate::error::{DataError, PipelineError};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Fitted per-column statistics. Immutable once produced; refit to get a new instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationParameters {
    pub scaler_type: String,
    pub feature_dim: usize,
    pub layout_version: u32,
    mean: Array1<f32>,
    scale: Array1<f32>,
}

pub struct StandardScaler;

impl StandardScaler {
    /// Replace non-finite values with 0.0, then fit and apply per-column statistics.
    pub fn fit_transform(
        raw: ArrayView2<'_, f32>,
    ) -> Result<(Array2<f32>, NormalizationParameters), DataError> {
        if raw.nrows() == 0 {
            return Err(DataError::Empty);
        }
        let clean = replace_non_finite(raw);
        let params = Self::fit(&clean);
        let normalized = params.apply(clean);
        Ok((normalized, params))
    }

    fn fit(clean: &Array2<f32>) -> NormalizationParameters {
        let n = clean.nrows() as f64;
        let cols = clean.ncols();
        let mut mean = Array1::<f32>::zeros(cols);
        let mut scale = Array1::<f32>::ones(cols);
        for (j, col) in clean.axis_iter(Axis(1)).enumerate() {
            // f64 accumulation keeps 10k-row columns stable.
            let m = col.iter().map(|&v| v as f64).sum::<f64>() / n;
            let var = col.iter().map(|&v| (v as f64 - m).powi(2)).sum::<f64>() / n;
            let sd = var.sqrt();
            mean[j] = m as f32;
            scale[j] = if sd > f64::EPSILON { sd as f32 } else { 1.0 };
        }
        NormalizationParameters {
            scaler_type: "StandardScaler".to_string(),
            feature_dim: cols,
            layout_version: LAYOUT_VERSION,
            mean,
            scale,
        }
    }
}

fn replace_non_finite(raw: ArrayView2<'_, f32>) -> Array2<f32> {
    raw.mapv(|v| if v.is_finite() { v } else { 0.0 })
}

impl NormalizationParameters {
    pub fn mean(&self) -> &Array1<f32> {
        &self.mean
    }

    pub fn scale(&self) -> &Array1<f32> {
        &self.scale
    }

    /// Apply the fitted statistics to new rows (non-finite values become 0.0 first).
    pub fn transform(&self, raw: ArrayView2<'_, f32>) -> Result<Array2<f32>, DataError> {
        if raw.ncols() != self.feature_dim {
            return Err(DataError::Schema(format!(
                "expected {} feature columns, got {}",
                self.feature_dim,
                raw.ncols()
            )));
        }
        Ok(self.apply(replace_non_finite(raw)))
    }

    fn apply(&self, mut m: Array2<f32>) -> Array2<f32> {
        for mut row in m.axis_iter_mut(Axis(0)) {
            row -= &self.mean;
            row /= &self.scale;
        }
        m
    }

    pub fn save(&self, path: &Path) -> Result<(), PipelineError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| PipelineError::artifact(path, e))?;
        tracing::info!(path = %path.display(), "normalization parameters saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let data = std::fs::read_to_string(path).map_err(|e| PipelineError::artifact(path, e))?;
        let params: Self = serde_json::from_str(&data)?;
        if params.feature_dim != FEATURE_DIM || params.layout_version != LAYOUT_VERSION {
            return Err(DataError::Schema(format!(
                "scaler fitted for dim {} layout v{}, expected dim {} layout v{}",
                params.feature_dim, params.layout_version, FEATURE_DIM, LAYOUT_VERSION
            ))
            .into());
        }
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn columns_are_standardized() {
        let raw = Array2::from_shape_fn((500, FEATURE_DIM), |(r, c)| {
            ((r * 7 + c * 13) % 23) as f32 * (c as f32 + 1.0) + c as f32
        });
        let (norm, _) = StandardScaler::fit_transform(raw.view()).unwrap();
        for col in norm.axis_iter(Axis(1)) {
            let n = col.len() as f32;
            let mean = col.sum() / n;
            let sd = (col.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n).sqrt();
            assert!(mean.abs() < 1e-4, "mean {mean}");
            assert!((sd - 1.0).abs() < 1e-3, "sd {sd}");
        }
    }

    #[test]
    fn nan_is_zeroed_before_statistics() {
        let raw = array![[f32::NAN, 1.0], [2.0, f32::INFINITY], [4.0, 3.0]];
        let (norm, params) = StandardScaler::fit_transform(raw.view()).unwrap();
        // Column 0 statistics come from [0, 2, 4]; a NaN-skipping fit would give mean 3.
        assert!((params.mean()[0] - 2.0).abs() < 1e-6);
        assert!((params.mean()[1] - 4.0 / 3.0).abs() < 1e-6);
        let sd0 = (8.0f32 / 3.0).sqrt();
        assert!((norm[[0, 0]] - (0.0 - 2.0) / sd0).abs() < 1e-5);
        assert!(norm.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn constant_column_maps_to_zero() {
        let raw = array![[5.0, 1.0], [5.0, 2.0]];
        let (norm, params) = StandardScaler::fit_transform(raw.view()).unwrap();
        assert_eq!(params.scale()[0], 1.0);
        assert!(norm.column(0).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn empty_input_is_rejected() {
        let raw = Array2::<f32>::zeros((0, FEATURE_DIM));
        assert!(matches!(
            StandardScaler::fit_transform(raw.view()),
            Err(DataError::Empty)
        ));
    }

    #[test]
    fn refit_is_independent_and_persisted_params_round_trip() {
        let a = Array2::from_shape_fn((10, FEATURE_DIM), |(r, c)| (r + c) as f32);
        let b = a.mapv(|v| v * 3.0 + 1.0);
        let (_, pa) = StandardScaler::fit_transform(a.view()).unwrap();
        let (_, pb) = StandardScaler::fit_transform(b.view()).unwrap();
        assert_ne!(pa, pb);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scalers.json");
        pa.save(&path).unwrap();
        let loaded = NormalizationParameters::load(&path).unwrap();
        assert_eq!(loaded, pa);
        let t = loaded.transform(a.view()).unwrap();
        assert!(t.column(3).sum().abs() < 1e-4);
    }
}
