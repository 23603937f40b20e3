use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use jetflow::{
    config::ErrorTreatment,
    unfolding::{Chi2Unfolder, PriorNormalization, SvdUnfolder},
    Binning, FlowUnfolder, Histogram1D, Histogram2D, Plane, RawInput, Unfolder,
    UnfoldingAlgorithm, UnfoldingConfig, UnfoldingInput,
};

fn smeared_response(binning: &Binning, width: f64) -> Histogram2D {
    let mut response = Histogram2D::new(binning.clone(), binning.clone());
    for (ix, x) in binning.centers().enumerate() {
        for (iy, y) in binning.centers().enumerate() {
            response.set_content(ix, iy, (-0.5 * ((y - x) / width).powi(2)).exp());
        }
    }
    jetflow::normalize_columns(&mut response);
    response
}

fn power_law(binning: &Binning, scale: f64) -> Histogram1D {
    let contents = binning.centers().map(|x| scale * x.powf(-4.5)).collect();
    Histogram1D::from_contents(binning.clone(), contents).unwrap()
}

fn unfolding_input(n_bins: usize) -> UnfoldingInput {
    let binning = Binning::uniform(n_bins, (20.0, 170.0)).unwrap();
    let response = smeared_response(&binning, 8.0);
    let measured = jetflow::fold(
        &power_law(&binning, 1e12),
        &response,
        &jetflow::kinematic_efficiency(&response),
    )
    .unwrap();
    UnfoldingInput {
        plane: Plane::In,
        efficiency: jetflow::kinematic_efficiency(&response),
        prior: measured.clone(),
        measured,
        response,
        source: None,
    }
}

fn svd_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("SVD unfolding");
    for n_bins in [10, 20, 40] {
        let input = unfolding_input(n_bins);
        group.bench_with_input(BenchmarkId::new("analytic", n_bins), &input, |b, input| {
            let mut unfolder = SvdUnfolder::new(PriorNormalization::Current, 4, 4)
                .with_errors(ErrorTreatment::Covariance, 0, 0);
            b.iter(|| black_box(unfolder.unfold(input).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("toys", n_bins), &input, |b, input| {
            let mut unfolder = SvdUnfolder::new(PriorNormalization::Current, 4, 4)
                .with_errors(ErrorTreatment::Toy, 200, 1);
            b.iter(|| black_box(unfolder.unfold(input).unwrap()))
        });
    }
    group.finish();
}

fn chi2_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("Chi2 unfolding");
    for n_bins in [10, 20] {
        let input = unfolding_input(n_bins);
        group.bench_with_input(BenchmarkId::from_parameter(n_bins), &input, |b, input| {
            let mut unfolder = Chi2Unfolder::new(0.1, 0.1);
            b.iter(|| black_box(unfolder.unfold(input).unwrap()))
        });
    }
    group.finish();
}

fn full_run_benchmark(c: &mut Criterion) {
    let binning = Binning::uniform(15, (20.0, 170.0)).unwrap();
    let delta_pt_binning = Binning::uniform(200, (-30.0, 170.0)).unwrap();
    let delta_pt = Histogram1D::from_contents(
        delta_pt_binning.clone(),
        delta_pt_binning
            .centers()
            .map(|x| (-0.5 * (x / 5.0).powi(2)).exp())
            .collect(),
    )
    .unwrap();
    let input = RawInput::new(
        smeared_response(&binning, 5.0),
        power_law(&binning, 1.2e12),
        power_law(&binning, 0.8e12),
        delta_pt.clone(),
        delta_pt,
        0.0,
    )
    .unwrap();
    let config = UnfoldingConfig::default()
        .with_algorithm(UnfoldingAlgorithm::Svd)
        .with_bins_true(binning.clone())
        .with_bins_rec(binning)
        .with_svd_toys(false)
        .with_detector_response(false)
        .with_smoothing(false);
    c.bench_function("SVD full run", |b| {
        b.iter_batched(
            || FlowUnfolder::new(config.clone()).with_raw_input(input.clone()),
            |mut unfolder| black_box(unfolder.make().unwrap()),
            BatchSize::SmallInput,
        )
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(10));
    targets = svd_benchmark, chi2_benchmark, full_run_benchmark
}
criterion_main!(benches);
