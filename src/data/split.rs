//! Deterministic label-stratified train / validation / test partitioning.

use crate::error::ConfigError;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Row indices of each partition.
#[derive(Debug, Clone)]
pub struct SplitIndices {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
    pub test: Vec<usize>,
}

/// Split row indices so that every partition keeps the class ratio of `labels`.
///
/// Each class is shuffled with a seeded RNG and cut into test / validation / train by
/// rounding its own size times the split ratio. A class that is absent, or too small to
/// put at least one member in every partition, is a configuration error.
pub fn stratified_split(
    labels: &[u8],
    validation_split: f64,
    test_split: f64,
    seed: u64,
) -> Result<SplitIndices, ConfigError> {
    if !(validation_split > 0.0 && test_split > 0.0 && validation_split + test_split < 1.0) {
        return Err(ConfigError::Invalid {
            key: "validation_split",
            reason: format!(
                "need 0 < validation_split, 0 < test_split, sum < 1 (got {validation_split}, {test_split})"
            ),
        });
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut split = SplitIndices {
        train: Vec::new(),
        validation: Vec::new(),
        test: Vec::new(),
    };

    for class in [0u8, 1u8] {
        let mut members: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(_, &l)| l == class)
            .map(|(i, _)| i)
            .collect();
        let n = members.len();
        if n == 0 {
            return Err(ConfigError::DegenerateSplit(format!("no samples with label {class}")));
        }
        members.shuffle(&mut rng);

        let n_test = (n as f64 * test_split).round() as usize;
        let n_val = (n as f64 * validation_split).round() as usize;
        if n_test == 0 || n_val == 0 || n_test + n_val >= n {
            return Err(ConfigError::DegenerateSplit(format!(
                "label {class} has {n} samples, too few for validation={validation_split} test={test_split}"
            )));
        }
        split.test.extend_from_slice(&members[..n_test]);
        split.validation.extend_from_slice(&members[n_test..n_test + n_val]);
        split.train.extend_from_slice(&members[n_test + n_val..]);
    }

    split.train.shuffle(&mut rng);
    split.validation.shuffle(&mut rng);
    split.test.shuffle(&mut rng);

    tracing::debug!(
        train = split.train.len(),
        validation = split.validation.len(),
        test = split.test.len(),
        "stratified split"
    );
    Ok(split)
}
