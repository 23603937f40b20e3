use tracing::debug;

use crate::{
    histogram::{Binning, Histogram1D, Histogram2D},
    JetFlowError, JetFlowResult,
};

/// Values below this magnitude close the tail of a delta-pt response row when rounding-error
/// suppression is enabled.
const ROUNDING_THRESHOLD: f64 = 1e-8;

/// The fine axis on which the extraction pipeline builds delta-pt responses: 300 unit-wide bins
/// covering $`[-50, 250)`$ GeV/c.
pub fn delta_pt_axis() -> JetFlowResult<Binning> {
    Binning::uniform(300, (-50.0, 250.0))
}

/// Compose a delta-pt response with a detector response.
///
/// The result is the matrix product along the shared intermediate axis,
/// ```math
/// R(t, r) = \sum_k D(t, k) \cdot M(k, r),
/// ```
/// so its true axis is the true axis of `delta_pt` and its reconstructed axis that of
/// `detector`.
///
/// # Errors
///
/// Returns [`JetFlowError::DimensionMismatch`] if the number of reconstructed bins of `delta_pt`
/// differs from the number of true bins of `detector`.
pub fn compose_responses(
    delta_pt: &Histogram2D,
    detector: &Histogram2D,
) -> JetFlowResult<Histogram2D> {
    if delta_pt.ny() != detector.nx() {
        return Err(JetFlowError::DimensionMismatch {
            operation: "compose_responses".to_string(),
            left: delta_pt.ny(),
            right: detector.nx(),
        });
    }
    let product = delta_pt.to_matrix() * detector.to_matrix();
    Histogram2D::from_matrix(
        delta_pt.x_binning().clone(),
        detector.y_binning().clone(),
        &product,
    )
}

/// Build a square response from a distribution of (reconstructed - true) momentum differences.
///
/// The cell at (true `j`, reconstructed `k`) holds the content of the `distribution` bin which
/// contains `center(k) - center(j)`, or zero if that difference lies outside of the distribution.
///
/// With `avoid_rounding_error`, scanning a true row upward past the diagonal, the first
/// near-zero value closes the row: every cell after it is set to zero, so numerical noise in the
/// far tail of the distribution cannot leak probability.
pub fn build_delta_pt_response(
    distribution: &Histogram1D,
    axis: &Binning,
    avoid_rounding_error: bool,
) -> Histogram2D {
    let mut response = Histogram2D::new(axis.clone(), axis.clone());
    let centers: Vec<f64> = axis.centers().collect();
    for (j, true_center) in centers.iter().enumerate() {
        let mut tail_closed = false;
        for (k, rec_center) in centers.iter().enumerate() {
            let value = distribution.content_at(rec_center - true_center);
            if !tail_closed {
                response.set_content(j, k, value);
            }
            if avoid_rounding_error && k > j && value.abs() < ROUNDING_THRESHOLD {
                tail_closed = true;
            }
        }
    }
    response
}

/// An identity-like response: one on matching true/reconstructed bin indices, zero elsewhere.
pub fn unity_response(bins_true: &Binning, bins_rec: &Binning) -> Histogram2D {
    let mut unity = Histogram2D::new(bins_true.clone(), bins_rec.clone());
    for i in 0..bins_true.n_bins().min(bins_rec.n_bins()) {
        unity.set_content(i, i, 1.0);
    }
    unity
}

/// The kinematic efficiency of a response: its projection onto the true axis, without errors.
pub fn kinematic_efficiency(response: &Histogram2D) -> Histogram1D {
    let mut efficiency = response.projection_x(0..response.ny());
    efficiency.suppress_errors();
    efficiency
}

/// Scale every true slice of a transposed response (x = reconstructed, y = true) by the content
/// of `prior` in that true bin.
pub fn normalize_with_prior(
    transposed: &Histogram2D,
    prior: &Histogram1D,
) -> JetFlowResult<Histogram2D> {
    if transposed.ny() != prior.n_bins() {
        return Err(JetFlowError::DimensionMismatch {
            operation: "normalize_with_prior".to_string(),
            left: transposed.ny(),
            right: prior.n_bins(),
        });
    }
    let mut normalized = transposed.clone();
    for it in 0..transposed.ny() {
        let weight = prior.content(it);
        for ir in 0..transposed.nx() {
            normalized.set_content(ir, it, transposed.content(ir, it) * weight);
            normalized.set_variance(ir, it, transposed.variance(ir, it) * weight * weight);
        }
    }
    Ok(normalized)
}

/// Fold a true spectrum through a response:
/// ```math
/// f(r) = \sum_t s(t)\,\epsilon(t)\,R(t, r)
/// ```
/// The errors of `spectrum` are propagated assuming uncorrelated bins.
pub fn fold(
    spectrum: &Histogram1D,
    response: &Histogram2D,
    efficiency: &Histogram1D,
) -> JetFlowResult<Histogram1D> {
    if spectrum.n_bins() != response.nx() {
        return Err(JetFlowError::DimensionMismatch {
            operation: "fold (spectrum)".to_string(),
            left: spectrum.n_bins(),
            right: response.nx(),
        });
    }
    if efficiency.n_bins() != response.nx() {
        return Err(JetFlowError::DimensionMismatch {
            operation: "fold (efficiency)".to_string(),
            left: efficiency.n_bins(),
            right: response.nx(),
        });
    }
    let mut folded = Histogram1D::new(response.y_binning().clone());
    for ir in 0..response.ny() {
        let (mut content, mut variance) = (0.0, 0.0);
        for it in 0..response.nx() {
            let weight = efficiency.content(it) * response.content(it, ir);
            content += spectrum.content(it) * weight;
            variance += spectrum.variance(it) * weight * weight;
        }
        folded.set_content(ir, content);
        folded.set_variance(ir, variance);
    }
    debug!(
        bins = folded.n_bins(),
        integral = folded.integral(),
        "folded spectrum"
    );
    Ok(folded)
}
