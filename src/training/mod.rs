//! Differentially-private training: DP-SGD, epoch policies, evaluation, orchestration.

mod dp;
mod metrics;
mod policy;
mod trainer;

pub use dp::{binary_cross_entropy, microbatch_bounds, CompiledModel, DpSgd};
pub use metrics::{BinaryMetrics, ClassReport, ClassificationReport};
pub use policy::{EarlyStopping, Observation, ReduceLrOnPlateau, TrainingSchedule};
pub use trainer::{EpochRecord, PartitionedData, StopReason, TrainedModel, Trainer};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// `(l2_norm_clip, noise_multiplier, num_microbatches)`; configuration, never learned.
/// Recorded verbatim next to every model trained with it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrivacyBudget {
    pub l2_norm_clip: f32,
    pub noise_multiplier: f32,
    pub num_microbatches: usize,
}

/// Independent, reproducible random stream for one model and purpose.
pub fn seeded_rng(seed: u64, stream: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(stream);
    rng
}
