//! Inference benchmark: float model vs decoded int8 edge artifact (on-device target).

use bankguard_trainer::convert::{EdgeConverter, EdgeModel};
use bankguard_trainer::features::{Modality, FEATURE_DIM};
use bankguard_trainer::model::{build_branch, build_ensemble, FraudModel};
use bankguard_trainer::training::seeded_rng;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::Array2;

fn calibration() -> Array2<f32> {
    Array2::from_shape_fn((100, FEATURE_DIM), |(r, c)| ((r * 7 + c * 3) % 19) as f32 / 19.0 - 0.5)
}

fn edge(model: &FraudModel, quantize: bool) -> EdgeModel {
    let cal = calibration();
    let artifact = EdgeConverter {
        optimize: true,
        quantize,
    }
    .convert(model, Some(cal.view()))
    .unwrap();
    EdgeModel::from_bytes(&artifact.bytes).unwrap()
}

fn bench_single_row(c: &mut Criterion) {
    let mut rng = seeded_rng(3, 0);
    let models = [build_branch(Modality::TouchDynamics, &mut rng), build_ensemble(&mut rng)];
    let cal = calibration();

    let mut g = c.benchmark_group("predict_single_row");
    for model in &models {
        let row = model.select_input(cal.view()).row(0).to_vec();
        let float = edge(model, false);
        let int8 = edge(model, true);
        g.bench_function(format!("{}_float32", model.name()).as_str(), |b| {
            b.iter(|| float.predict(black_box(&row)))
        });
        g.bench_function(format!("{}_int8", model.name()).as_str(), |b| {
            b.iter(|| int8.predict(black_box(&row)))
        });
    }
    g.finish();
}

criterion_group!(benches, bench_single_row);
criterion_main!(benches);
