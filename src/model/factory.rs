//! Fixed architecture tables for the four branch classifiers and the ensemble.
//!
//! Hidden layers use ReLU; every classifier ends in a single sigmoid unit.

use super::ensemble::{EnsembleNet, SubNetwork};
use super::layers::{Activation, BatchNorm, Dense, Dropout, Layer};
use super::sequential::Sequential;
use super::FraudModel;
use crate::features::{Modality, FEATURE_DIM};
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LayerSpec {
    Dense(usize),
    BatchNorm,
    Dropout(f32),
}

use LayerSpec::{BatchNorm as Bn, Dense as Fc, Dropout as Dp};

const TYPING: &[LayerSpec] = &[Fc(64), Dp(0.3), Fc(32), Dp(0.2), Fc(16)];
const TOUCH: &[LayerSpec] = &[Fc(48), Bn, Dp(0.3), Fc(24), Dp(0.2), Fc(12)];
const ORIENTATION: &[LayerSpec] = &[Fc(32), Dp(0.2), Fc(16), Fc(8)];
const NAVIGATION: &[LayerSpec] = &[Fc(24), Dp(0.2), Fc(12), Fc(6)];

const WIDE_SUBNET: &[LayerSpec] = &[Fc(32), Dp(0.2), Fc(16)];
const NARROW_SUBNET: &[LayerSpec] = &[Fc(16), Dp(0.1), Fc(8)];
const ENSEMBLE_HEAD: &[LayerSpec] = &[Fc(64), Dp(0.3), Fc(32), Dp(0.2), Fc(16)];

pub const ENSEMBLE_NAME: &str = "ensemble_fraud_model";

/// Hidden layers of the standalone classifier for `modality` (output unit excluded).
pub fn branch_design(modality: Modality) -> &'static [LayerSpec] {
    match modality {
        Modality::TypingRhythm => TYPING,
        Modality::TouchDynamics => TOUCH,
        Modality::DeviceOrientation => ORIENTATION,
        Modality::NavigationPattern => NAVIGATION,
    }
}

/// Embedding sub-network for `modality` inside the ensemble.
pub fn ensemble_subnet_design(modality: Modality) -> &'static [LayerSpec] {
    match modality {
        Modality::TypingRhythm | Modality::TouchDynamics => WIDE_SUBNET,
        Modality::DeviceOrientation | Modality::NavigationPattern => NARROW_SUBNET,
    }
}

fn layer_prefix(modality: Modality) -> &'static str {
    match modality {
        Modality::TypingRhythm => "typing",
        Modality::TouchDynamics => "touch",
        Modality::DeviceOrientation => "orientation",
        Modality::NavigationPattern => "nav",
    }
}

fn build_stack<R: Rng + ?Sized>(
    name: String,
    prefix: &str,
    input_dim: usize,
    design: &[LayerSpec],
    with_output: bool,
    rng: &mut R,
) -> Sequential {
    let mut layers = Vec::with_capacity(design.len() + 1);
    let mut width = input_dim;
    let mut dense_idx = 0;
    for spec in design {
        match *spec {
            LayerSpec::Dense(units) => {
                dense_idx += 1;
                let n = format!("{prefix}_dense{dense_idx}");
                layers.push(Layer::Dense(Dense::new(n, width, units, Activation::Relu, rng)));
                width = units;
            }
            LayerSpec::BatchNorm => layers.push(Layer::BatchNorm(BatchNorm::new(width))),
            LayerSpec::Dropout(rate) => layers.push(Layer::Dropout(Dropout { rate })),
        }
    }
    if with_output {
        let n = format!("{prefix}_output");
        layers.push(Layer::Dense(Dense::new(n, width, 1, Activation::Sigmoid, rng)));
    }
    Sequential {
        name,
        input_dim,
        layers,
    }
}

/// Standalone classifier for one modality; its input width comes from the feature layout.
pub fn build_branch<R: Rng + ?Sized>(modality: Modality, rng: &mut R) -> FraudModel {
    let net = build_stack(
        format!("{}_model", modality.as_str()),
        layer_prefix(modality),
        modality.width(),
        branch_design(modality),
        true,
        rng,
    );
    FraudModel::Branch { modality, net }
}

/// Ensemble over the full 34-wide vector. Sub-networks read the same layout slices as
/// the standalone branches.
pub fn build_ensemble<R: Rng + ?Sized>(rng: &mut R) -> FraudModel {
    let branches: Vec<SubNetwork> = Modality::ALL
        .iter()
        .map(|&m| SubNetwork {
            modality: m,
            net: build_stack(
                format!("{}_branch", layer_prefix(m)),
                &format!("{}_branch", layer_prefix(m)),
                m.width(),
                ensemble_subnet_design(m),
                false,
                rng,
            ),
        })
        .collect();
    let combined: usize = branches.iter().map(|b| b.net.output_dim()).sum();
    let head = build_stack(
        "ensemble_head".to_string(),
        "ensemble",
        combined,
        ENSEMBLE_HEAD,
        true,
        rng,
    );
    debug_assert_eq!(
        branches.iter().map(|b| b.net.input_dim).sum::<usize>(),
        FEATURE_DIM
    );
    FraudModel::Ensemble(EnsembleNet {
        name: ENSEMBLE_NAME.to_string(),
        branches,
        head,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn dense_widths(net: &Sequential) -> Vec<usize> {
        net.layers
            .iter()
            .filter_map(|l| match l {
                Layer::Dense(d) => Some(d.out_dim()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn branch_widths_strictly_decrease_to_one() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        for m in Modality::ALL {
            let FraudModel::Branch { net, .. } = build_branch(m, &mut rng) else {
                panic!("expected branch");
            };
            let widths = dense_widths(&net);
            assert!(widths.windows(2).all(|w| w[0] > w[1]), "{m}: {widths:?}");
            assert_eq!(widths.last(), Some(&1));
            assert_eq!(net.input_dim, m.width());
            assert!(matches!(net.layers[1], Layer::Dropout(_) | Layer::BatchNorm(_)));
        }
    }

    #[test]
    fn only_touch_dynamics_normalizes() {
        let with_norm: Vec<Modality> = Modality::ALL
            .into_iter()
            .filter(|&m| branch_design(m).contains(&LayerSpec::BatchNorm))
            .collect();
        assert_eq!(with_norm, vec![Modality::TouchDynamics]);
    }

    #[test]
    fn typing_branch_parameter_count() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let m = build_branch(Modality::TypingRhythm, &mut rng);
        // 10*64+64 + 64*32+32 + 32*16+16 + 16+1
        assert_eq!(m.param_count(), 704 + 2080 + 528 + 17);
    }

    #[test]
    fn ensemble_has_more_capacity_than_any_branch() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let ensemble = build_ensemble(&mut rng);
        let FraudModel::Ensemble(net) = &ensemble else { panic!("expected ensemble") };
        assert_eq!(net.embedding_dim(), 48);
        assert_eq!(dense_widths(&net.head), vec![64, 32, 16, 1]);
        for m in Modality::ALL {
            assert!(ensemble.param_count() > build_branch(m, &mut rng).param_count());
        }
    }
}
