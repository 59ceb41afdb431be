//! Behavioral feature layout and normalization.
//!
//! A feature vector holds 34 measurements split into four contiguous modality slices.
//! [`FEATURE_LAYOUT`] is the single source of those boundaries; branch models, the
//! ensemble graph, and the edge converter all read it.

mod scaler;

pub use scaler::{NormalizationParameters, StandardScaler};

use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Number of behavioral measurements per sample.
pub const FEATURE_DIM: usize = 34;

/// Bumped whenever a slice boundary moves; persisted next to normalization parameters.
pub const LAYOUT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    TypingRhythm,
    TouchDynamics,
    DeviceOrientation,
    NavigationPattern,
}

/// Modality → half-open column range, in feature-vector order.
pub const FEATURE_LAYOUT: [(Modality, Range<usize>); 4] = [
    (Modality::TypingRhythm, 0..10),
    (Modality::TouchDynamics, 10..20),
    (Modality::DeviceOrientation, 20..28),
    (Modality::NavigationPattern, 28..34),
];

impl Modality {
    pub const ALL: [Modality; 4] = [
        Modality::TypingRhythm,
        Modality::TouchDynamics,
        Modality::DeviceOrientation,
        Modality::NavigationPattern,
    ];

    pub fn index(self) -> usize {
        match self {
            Modality::TypingRhythm => 0,
            Modality::TouchDynamics => 1,
            Modality::DeviceOrientation => 2,
            Modality::NavigationPattern => 3,
        }
    }

    pub fn range(self) -> Range<usize> {
        FEATURE_LAYOUT[self.index()].1.clone()
    }

    pub fn width(self) -> usize {
        let r = self.range();
        r.end - r.start
    }

    /// Model identifier used for artifacts and metadata.
    pub fn as_str(self) -> &'static str {
        match self {
            Modality::TypingRhythm => "typing_rhythm",
            Modality::TouchDynamics => "touch_dynamics",
            Modality::DeviceOrientation => "device_orientation",
            Modality::NavigationPattern => "navigation_pattern",
        }
    }

    pub fn feature_group_name(self) -> String {
        format!("{}_features", self.as_str())
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Columns of `matrix` belonging to `modality` (owned copy, row-major).
pub fn slice_columns(matrix: ArrayView2<'_, f32>, modality: Modality) -> Array2<f32> {
    let r = modality.range();
    matrix.slice(s![.., r.start..r.end]).to_owned()
}

/// Split a single feature vector into its four modality slices.
pub fn partition(vector: &[f32]) -> Option<[&[f32]; 4]> {
    if vector.len() != FEATURE_DIM {
        return None;
    }
    Some(Modality::ALL.map(|m| &vector[m.range()]))
}

/// Names recorded in model metadata, one per modality group.
pub fn feature_group_names() -> Vec<String> {
    Modality::ALL.iter().map(|m| m.feature_group_name()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_contiguous_and_covers_all_features() {
        let mut next = 0;
        for (m, r) in FEATURE_LAYOUT.iter() {
            assert_eq!(r.start, next, "{m} does not start where the previous slice ends");
            assert!(r.end > r.start);
            next = r.end;
        }
        assert_eq!(next, FEATURE_DIM);
    }

    #[test]
    fn partition_uses_fixed_boundaries() {
        let v: Vec<f32> = (0..FEATURE_DIM).map(|i| i as f32).collect();
        let parts = partition(&v).unwrap();
        assert_eq!(parts[0].len(), 10);
        assert_eq!(parts[1][0], 10.0);
        assert_eq!(parts[2], &v[20..28]);
        assert_eq!(parts[3].last().copied(), Some(33.0));
        assert!(partition(&v[..33]).is_none());
    }

    #[test]
    fn slice_columns_matches_range() {
        let m = Array2::from_shape_fn((3, FEATURE_DIM), |(r, c)| (r * 100 + c) as f32);
        let nav = slice_columns(m.view(), Modality::NavigationPattern);
        assert_eq!(nav.dim(), (3, 6));
        assert_eq!(nav[[2, 0]], 228.0);
    }
}
