use std::f64::consts::PI;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{histogram::Histogram1D, JetFlowError, JetFlowResult};

/// One point of a [`Graph`] with symmetric errors.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphPoint {
    pub x: f64,
    pub y: f64,
    pub x_error: f64,
    pub y_error: f64,
}

/// The result of fitting a constant to a [`Graph`].
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConstantFit {
    pub value: f64,
    pub error: f64,
    pub chi2: f64,
    pub ndf: usize,
    pub range: (f64, f64),
}

impl ConstantFit {
    /// The error-weighted mean of the points with x inside `range`. Points without a positive
    /// y-error carry no weight. Returns [`None`] if no point carries weight.
    pub fn fit(points: &[GraphPoint], range: (f64, f64)) -> Option<Self> {
        let weighted: Vec<(f64, f64)> = points
            .iter()
            .filter(|p| p.x >= range.0 && p.x <= range.1 && p.y_error > 0.0)
            .map(|p| (p.y, 1.0 / (p.y_error * p.y_error)))
            .collect();
        let sum_w: f64 = weighted.iter().map(|(_, w)| w).sum();
        if weighted.is_empty() || sum_w <= 0.0 {
            return None;
        }
        let value = weighted.iter().map(|(y, w)| y * w).sum::<f64>() / sum_w;
        let chi2 = weighted.iter().map(|(y, w)| w * (y - value).powi(2)).sum();
        Some(Self {
            value,
            error: sum_w.sqrt().recip(),
            chi2,
            ndf: weighted.len() - 1,
            range,
        })
    }
}

/// A list of points with errors, optionally named and carrying a constant fit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    name: Option<String>,
    points: Vec<GraphPoint>,
    fit: Option<ConstantFit>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name<T: AsRef<str>>(mut self, name: T) -> Self {
        self.name = Some(name.as_ref().to_string());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn push(&mut self, point: GraphPoint) {
        self.points.push(point);
    }

    pub fn points(&self) -> &[GraphPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn fit(&self) -> Option<&ConstantFit> {
        self.fit.as_ref()
    }

    /// Fit a constant over `range` and store the result.
    pub fn fit_constant(&mut self, range: (f64, f64)) -> Option<&ConstantFit> {
        self.fit = ConstantFit::fit(&self.points, range);
        self.fit.as_ref()
    }
}

/// Options for [`ratio`].
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RatioOptions {
    /// Range of the constant fit, or [`None`] for no fit.
    pub fit_range: Option<(f64, f64)>,
    /// Points with centers above this value are left out.
    pub x_max: Option<f64>,
}

impl Default for RatioOptions {
    fn default() -> Self {
        Self {
            fit_range: Some((10.0, 100.0)),
            x_max: None,
        }
    }
}

impl RatioOptions {
    pub fn without_fit(mut self) -> Self {
        self.fit_range = None;
        self
    }

    pub fn with_x_max(mut self, x_max: f64) -> Self {
        self.x_max = Some(x_max);
        self
    }
}

/// The bin-wise ratio of two spectra as a [`Graph`].
///
/// Every bin of `numerator` is compared to the bin of `denominator` containing its center, so
/// the two may be binned differently. Bins without a positive denominator are left out. The
/// errors are
/// ```math
/// \sigma^2 = \left(\frac{\sigma_1}{c_2}\right)^2 + \left(\frac{c_1\sigma_2}{c_2^2}\right)^2
/// ```
pub fn ratio(numerator: &Histogram1D, denominator: &Histogram1D, options: &RatioOptions) -> Graph {
    let mut graph = Graph::new();
    let binning = numerator.binning();
    for bin in 0..numerator.n_bins() {
        let center = binning.center(bin);
        if options.x_max.is_some_and(|x_max| center > x_max) {
            continue;
        }
        let Some(other) = denominator.binning().find_bin(center) else {
            continue;
        };
        let c2 = denominator.content(other);
        if c2 <= 0.0 {
            continue;
        }
        let (c1, e1, e2) = (
            numerator.content(bin),
            numerator.error(bin),
            denominator.error(other),
        );
        let a = e1 / c2;
        let b = if e2 > 0.0 { c1 * e2 / (c2 * c2) } else { 0.0 };
        graph.push(GraphPoint {
            x: center,
            y: c1 / c2,
            x_error: binning.width(bin) / 2.0,
            y_error: a.hypot(b),
        });
    }
    if let Some(range) = options.fit_range {
        if let Some(fit) = graph.fit_constant(range) {
            debug!(value = fit.value, chi2 = fit.chi2, ndf = fit.ndf, "constant fit to ratio");
        }
    }
    graph
}

/// The elliptic flow coefficient from in- and out-of-plane spectra,
/// ```math
/// v_2 = \frac{\pi}{4R}\,\frac{N_\text{in} - N_\text{out}}{N_\text{in} + N_\text{out}}
/// ```
/// where $`R`$ is the event-plane resolution. Bins where the out-of-plane yield is not positive
/// or the summed yield vanishes are left out.
pub fn flow_coefficient(
    in_plane: &Histogram1D,
    out_of_plane: &Histogram1D,
    resolution: f64,
) -> JetFlowResult<Graph> {
    if in_plane.binning() != out_of_plane.binning() {
        return Err(JetFlowError::BinningMismatch {
            operation: "flow_coefficient".to_string(),
        });
    }
    let prefactor = PI / (4.0 * resolution);
    let mut graph = Graph::new();
    let binning = in_plane.binning();
    for bin in 0..in_plane.n_bins() {
        let (n_in, n_out) = (in_plane.content(bin), out_of_plane.content(bin));
        let sum = n_in + n_out;
        if n_out <= 0.0 || sum == 0.0 {
            continue;
        }
        let variance = prefactor.powi(2)
            * 4.0
            * (n_out.powi(2) * in_plane.variance(bin) + n_in.powi(2) * out_of_plane.variance(bin))
            / sum.powi(4);
        graph.push(GraphPoint {
            x: binning.center(bin),
            y: prefactor * (n_in - n_out) / sum,
            x_error: binning.width(bin) / 2.0,
            y_error: variance.sqrt(),
        });
    }
    Ok(graph)
}

/// Correlation coefficients of a covariance matrix. Entries whose diagonal terms vanish are
/// zero. An empty matrix has no coefficients.
pub fn pearson_coefficients(covariance: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if covariance.is_empty() {
        return None;
    }
    Some(DMatrix::from_fn(
        covariance.nrows(),
        covariance.ncols(),
        |i, j| {
            let norm = covariance[(i, i)] * covariance[(j, j)];
            if covariance[(i, i)] != 0.0 && covariance[(j, j)] != 0.0 {
                covariance[(i, j)] / norm.abs().sqrt()
            } else {
                0.0
            }
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::Binning;
    use approx::assert_relative_eq;

    fn histogram(contents: Vec<f64>) -> Histogram1D {
        let n = contents.len();
        Histogram1D::from_contents(Binning::uniform(n, (0.0, 10.0 * n as f64)).unwrap(), contents)
            .unwrap()
    }

    #[test]
    fn test_ratio_skips_empty_denominator() {
        let h1 = histogram(vec![4.0, 9.0, 16.0]);
        let h2 = histogram(vec![4.0, 0.0, 4.0]);
        let graph = ratio(&h1, &h2, &RatioOptions::default().without_fit());
        assert_eq!(graph.len(), 2);
        let last = graph.points()[1];
        assert_relative_eq!(last.x, 25.0);
        assert_relative_eq!(last.y, 4.0);
        assert_relative_eq!(last.x_error, 5.0);
        // (4/4)² + (16·2/16)²
        assert_relative_eq!(last.y_error, 5.0_f64.sqrt());
        assert!(graph.fit().is_none());
    }

    #[test]
    fn test_ratio_x_max_and_fit() {
        let h = histogram(vec![100.0, 100.0, 100.0, 100.0]);
        let graph = ratio(&h, &h, &RatioOptions::default().with_x_max(20.0));
        assert_eq!(graph.len(), 2);
        let fit = graph.fit().unwrap();
        assert_relative_eq!(fit.value, 1.0);
        assert_relative_eq!(fit.chi2, 0.0);
        assert_eq!(fit.ndf, 1);
    }

    #[test]
    fn test_ratio_with_different_binnings() {
        let fine = Histogram1D::from_contents(
            Binning::uniform(4, (0.0, 4.0)).unwrap(),
            vec![1.0, 2.0, 3.0, 4.0],
        )
        .unwrap();
        let coarse =
            Histogram1D::from_contents(Binning::uniform(2, (0.0, 4.0)).unwrap(), vec![2.0, 8.0])
                .unwrap();
        let graph = ratio(&fine, &coarse, &RatioOptions::default().without_fit());
        let y: Vec<f64> = graph.points().iter().map(|p| p.y).collect();
        assert_eq!(y, vec![0.5, 1.0, 0.375, 0.5]);
    }

    #[test]
    fn test_constant_fit_weighted_mean() {
        let points = [
            GraphPoint {
                x: 20.0,
                y: 1.0,
                x_error: 0.0,
                y_error: 1.0,
            },
            GraphPoint {
                x: 30.0,
                y: 2.0,
                x_error: 0.0,
                y_error: 0.5,
            },
            GraphPoint {
                x: 300.0,
                y: 50.0,
                x_error: 0.0,
                y_error: 0.1,
            },
        ];
        let fit = ConstantFit::fit(&points, (10.0, 100.0)).unwrap();
        assert_relative_eq!(fit.value, 1.8, max_relative = 1e-12);
        assert_relative_eq!(fit.error, 0.2_f64.sqrt(), max_relative = 1e-12);
        assert_relative_eq!(fit.chi2, 0.64 + 4.0 * 0.04, max_relative = 1e-12);
        assert!(ConstantFit::fit(&points, (400.0, 500.0)).is_none());
    }

    #[test]
    fn test_flow_coefficient() {
        let in_plane = histogram(vec![100.0, 150.0, 10.0]);
        let out_of_plane = histogram(vec![100.0, 50.0, 0.0]);
        let graph = flow_coefficient(&in_plane, &out_of_plane, 0.5).unwrap();
        assert_eq!(graph.len(), 2);
        assert_relative_eq!(graph.points()[0].y, 0.0);
        let prefactor = PI / 2.0;
        assert_relative_eq!(graph.points()[1].y, prefactor * 0.5);
        let expected =
            prefactor * 2.0 * (50.0_f64.powi(2) * 150.0 + 150.0_f64.powi(2) * 50.0).sqrt()
                / 200.0_f64.powi(2);
        assert_relative_eq!(graph.points()[1].y_error, expected, max_relative = 1e-12);
    }

    #[test]
    fn test_flow_coefficient_needs_same_binning() {
        assert!(flow_coefficient(&histogram(vec![1.0]), &histogram(vec![1.0, 2.0]), 0.6).is_err());
    }

    #[test]
    fn test_pearson_coefficients() {
        let covariance = DMatrix::from_row_slice(3, 3, &[4.0, 2.0, 0.0, 2.0, 9.0, 0.0, 0.0, 0.0, 0.0]);
        let pearson = pearson_coefficients(&covariance).unwrap();
        assert_relative_eq!(pearson[(0, 0)], 1.0);
        assert_relative_eq!(pearson[(0, 1)], 2.0 / 6.0, max_relative = 1e-12);
        assert_relative_eq!(pearson[(1, 2)], 0.0);
        assert_relative_eq!(pearson[(2, 2)], 0.0);
        assert!(pearson_coefficients(&DMatrix::zeros(0, 0)).is_none());
    }
}
