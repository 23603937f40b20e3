use nalgebra::{DMatrix, DVector};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    analysis::{pearson_coefficients, ratio, RatioOptions},
    binning::{normalize_columns, rebin1d, rebin2d},
    config::{ErrorTreatment, PriorChoice, UnfoldingAlgorithm, UnfoldingConfig},
    histogram::{Binning, Histogram1D, Histogram2D},
    response::{fold, kinematic_efficiency, normalize_with_prior},
    spectrum::Smoothing,
    JetFlowError, JetFlowResult,
};

use super::{
    chi2::Chi2Unfolder, diagonal_variances, Diagnostics, Plane, Unfolder, UnfoldingInput,
    UnfoldingResult,
};

/// Added to the diagonal of the curvature matrix so that it can be inverted.
const CURVATURE_REGULATOR: f64 = 1e-5;

/// How the transposed response is weighted with the prior before inversion.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriorNormalization {
    /// Weight with prior × kinematic efficiency; the prior is also the truth of the response.
    Current,
    /// Weight with the prior alone; the truth is the projection of the weighted response.
    Legacy,
}

/// Everything the SVD unfolding produces besides the spectra.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SvdDiagnostics {
    /// Singular values of $`AC^{-1}`$ in descending order.
    pub singular_values: Histogram1D,
    /// $`|d_i|`$, the rotated measurement.
    pub d_vector: Histogram1D,
    /// The transposed response (x = reconstructed, y = true) weighted with the prior.
    pub transposed_response: Histogram2D,
    /// The transposed column-normalized response weighted with the prior (legacy only).
    pub transposed_response_normalized: Option<Histogram2D>,
    /// The column-normalized response used for refolding (legacy only).
    pub normalized_response: Option<Histogram2D>,
    /// The measured spectrum on the true binning after smoothing.
    pub prior_smoothed: Histogram1D,
    /// The measured spectrum on the true binning as it came in.
    pub prior_template: Histogram1D,
}

/// A response in counts whose truth distribution is its own projection. Applying it to a truth
/// spectrum uses the per-true-bin migration probabilities.
struct LinearResponse {
    /// x = reconstructed, y = true
    transposed: Histogram2D,
    truth: Histogram1D,
}

impl LinearResponse {
    fn new(transposed: Histogram2D) -> Self {
        let truth = transposed.projection_y(0..transposed.nx());
        Self { transposed, truth }
    }

    fn apply_to_truth(&self, spectrum: &Histogram1D) -> JetFlowResult<Histogram1D> {
        if spectrum.n_bins() != self.transposed.ny() {
            return Err(JetFlowError::DimensionMismatch {
                operation: "LinearResponse::apply_to_truth".to_string(),
                left: spectrum.n_bins(),
                right: self.transposed.ny(),
            });
        }
        let mut folded = Histogram1D::new(self.transposed.x_binning().clone());
        for r in 0..self.transposed.nx() {
            let (mut content, mut variance) = (0.0, 0.0);
            for t in 0..self.transposed.ny() {
                let total = self.truth.content(t);
                if total == 0.0 {
                    continue;
                }
                let probability = self.transposed.content(r, t) / total;
                content += probability * spectrum.content(t);
                variance += probability * probability * spectrum.variance(t);
            }
            folded.set_content(r, content);
            folded.set_variance(r, variance);
        }
        Ok(folded)
    }
}

/// The tridiagonal second-derivative matrix with reflecting ends.
fn curvature_matrix(n: usize) -> DMatrix<f64> {
    let mut c = DMatrix::zeros(n, n);
    for i in 0..n {
        c[(i, i)] = -2.0 + CURVATURE_REGULATOR;
        if i > 0 {
            c[(i, i - 1)] = 1.0;
        }
        if i + 1 < n {
            c[(i, i + 1)] = 1.0;
        }
    }
    if n > 0 {
        c[(0, 0)] = -1.0 + CURVATURE_REGULATOR;
        c[(n - 1, n - 1)] = -1.0 + CURVATURE_REGULATOR;
    }
    c
}

/// The regularized inversion of Höcker & Kartvelishvili.
///
/// With $`A`$ the detector matrix in counts (reconstructed × true) and rows and measurement
/// divided by the measured errors, $`AC^{-1} = USV^T`$ and $`d = U^T b`$. The damped solution
/// ```math
/// z_i = \frac{d_i s_i}{s_i^2 + \tau}, \quad \tau = s_{k-1}^2
/// ```
/// for a regularization rank $`1 \le k \le n`$, counting singular values from one in descending
/// order. A rank of zero, or one beyond the number of singular values, leaves the inversion
/// undamped. The damped solution is rotated back to $`w = C^{-1}Vz`$ and the unfolded spectrum is $`w`$ times the truth the
/// detector matrix was built from. All of this is linear in the measurement, so it is stored as a
/// single operator.
struct SvdInversion {
    /// true × reconstructed
    operator: DMatrix<f64>,
    /// `operator` with the measured errors folded in, i.e. the square root of the covariance.
    error_operator: DMatrix<f64>,
    singular_values: Vec<f64>,
    d: Vec<f64>,
    tau: f64,
}

impl SvdInversion {
    fn new(
        detector: &DMatrix<f64>,
        truth: &[f64],
        measured: &Histogram1D,
        kreg: usize,
    ) -> JetFlowResult<Self> {
        let (n_rec, n_true) = detector.shape();
        if measured.n_bins() != n_rec {
            return Err(JetFlowError::DimensionMismatch {
                operation: "SVD inversion (measured)".to_string(),
                left: measured.n_bins(),
                right: n_rec,
            });
        }
        if truth.len() != n_true {
            return Err(JetFlowError::DimensionMismatch {
                operation: "SVD inversion (truth)".to_string(),
                left: truth.len(),
                right: n_true,
            });
        }
        let inverse_errors: Vec<f64> = measured
            .errors()
            .iter()
            .map(|e| if *e > 0.0 { 1.0 / e } else { 1.0 })
            .collect();
        let a = DMatrix::from_fn(n_rec, n_true, |r, t| detector[(r, t)] * inverse_errors[r]);
        let b = DVector::from_fn(n_rec, |r, _| measured.content(r) * inverse_errors[r]);
        let c_inv = curvature_matrix(n_true)
            .try_inverse()
            .ok_or_else(|| JetFlowError::Custom("curvature matrix is singular".to_string()))?;
        let svd = (&a * &c_inv).svd(true, true);
        let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
            return Err(JetFlowError::Custom(
                "singular value decomposition failed".to_string(),
            ));
        };
        let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
        order.sort_by(|&i, &j| svd.singular_values[j].total_cmp(&svd.singular_values[i]));
        let k = order.len();
        let s: Vec<f64> = order.iter().map(|&i| svd.singular_values[i]).collect();
        let u = DMatrix::from_fn(n_rec, k, |r, c| u[(r, order[c])]);
        let v = DMatrix::from_fn(n_true, k, |t, c| v_t[(order[c], t)]);

        let tau = if (1..=k).contains(&kreg) {
            s[kreg - 1].powi(2)
        } else {
            0.0
        };
        let filter = DVector::from_iterator(
            k,
            s.iter().map(|si| {
                let denominator = si * si + tau;
                if denominator != 0.0 {
                    si / denominator
                } else {
                    0.0
                }
            }),
        );
        debug!(k, kreg, tau, "svd decomposition");
        let d = u.transpose() * &b;
        // diag(truth) C⁻¹ V diag(filter), true × k
        let rotate_back = DMatrix::from_fn(n_true, n_true, |i, j| truth[i] * c_inv[(i, j)])
            * v
            * DMatrix::from_diagonal(&filter);
        let error_operator = &rotate_back * u.transpose();
        let operator = &error_operator * DMatrix::from_diagonal(&DVector::from_vec(inverse_errors));
        Ok(Self {
            operator,
            error_operator,
            singular_values: s,
            d: d.iter().copied().collect(),
            tau,
        })
    }

    fn apply(&self, measured: &DVector<f64>) -> DVector<f64> {
        &self.operator * measured
    }

    /// Propagation of uncorrelated measured errors.
    fn covariance(&self) -> DMatrix<f64> {
        &self.error_operator * self.error_operator.transpose()
    }

    fn toy(&self, measured: &Histogram1D, seed: u64) -> DVector<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let varied = DVector::from_fn(measured.n_bins(), |r, _| {
            let z: f64 = rng.sample(StandardNormal);
            measured.content(r) + measured.error(r) * z
        });
        self.apply(&varied)
    }

    /// Sample covariance of the unfolded spectrum over `n_toys` fluctuations of the measurement.
    #[cfg(feature = "rayon")]
    fn toy_covariance(&self, measured: &Histogram1D, n_toys: usize, seed: u64) -> DMatrix<f64> {
        let toys: Vec<DVector<f64>> = (0..n_toys)
            .into_par_iter()
            .map(|t| self.toy(measured, seed.wrapping_add(t as u64)))
            .collect();
        sample_covariance(&toys, self.operator.nrows())
    }

    /// Sample covariance of the unfolded spectrum over `n_toys` fluctuations of the measurement.
    #[cfg(not(feature = "rayon"))]
    fn toy_covariance(&self, measured: &Histogram1D, n_toys: usize, seed: u64) -> DMatrix<f64> {
        let toys: Vec<DVector<f64>> = (0..n_toys)
            .map(|t| self.toy(measured, seed.wrapping_add(t as u64)))
            .collect();
        sample_covariance(&toys, self.operator.nrows())
    }
}

fn sample_covariance(samples: &[DVector<f64>], dim: usize) -> DMatrix<f64> {
    if samples.is_empty() {
        return DMatrix::zeros(0, 0);
    }
    let n = samples.len() as f64;
    let mean = samples
        .iter()
        .fold(DVector::zeros(dim), |acc, x| acc + x)
        / n;
    samples.iter().fold(DMatrix::zeros(dim, dim), |acc, x| {
        let delta = x - &mean;
        acc + &delta * delta.transpose()
    }) / n
}

fn index_histogram(values: impl ExactSizeIterator<Item = f64>) -> JetFlowResult<Histogram1D> {
    let n = values.len();
    let binning = Binning::uniform(n, (0.0, n as f64))?;
    Histogram1D::from_parts(binning, values.collect(), vec![0.0; n])
}

/// SVD unfolding of one plane at a time, with the regularization strength set per plane.
///
/// The prior is either the measured spectrum on the true binning or a $`\chi^2`$ unfolding. In
/// the latter case the $`\chi^2`$ step can run on its own binnings, starting from the raw spectrum
/// and full response carried in [`UnfoldingInput::source`].
#[derive(Clone, Debug)]
pub struct SvdUnfolder {
    normalization: PriorNormalization,
    kreg_in: usize,
    kreg_out: usize,
    error_treatment: ErrorTreatment,
    n_toys: usize,
    toy_seed: u64,
    prior_choice: PriorChoice,
    prior_binnings: Option<(Binning, Binning)>,
    smoothing: Option<Smoothing>,
    chi2: Chi2Unfolder,
}

impl SvdUnfolder {
    pub fn new(normalization: PriorNormalization, kreg_in: usize, kreg_out: usize) -> Self {
        Self {
            normalization,
            kreg_in,
            kreg_out,
            error_treatment: ErrorTreatment::Toy,
            n_toys: 1000,
            toy_seed: 0,
            prior_choice: PriorChoice::Measured,
            prior_binnings: None,
            smoothing: None,
            chi2: Chi2Unfolder::new(0.1, 0.1),
        }
    }

    pub fn from_config(
        config: &UnfoldingConfig,
        normalization: PriorNormalization,
        smoothing: Option<Smoothing>,
    ) -> Self {
        let mut unfolder = Self::new(normalization, config.svd_reg_in, config.svd_reg_out)
            .with_errors(config.error_treatment(), config.n_toys, config.toy_seed)
            .with_prior(config.prior)
            .with_chi2_prior(
                Chi2Unfolder::new(config.beta_in, config.beta_out)
                    .with_smoothing(smoothing.clone()),
            )
            .with_smoothing(smoothing);
        unfolder.prior_binnings = config.prior_binnings();
        unfolder
    }

    pub fn with_errors(mut self, treatment: ErrorTreatment, n_toys: usize, seed: u64) -> Self {
        self.error_treatment = treatment;
        self.n_toys = n_toys;
        self.toy_seed = seed;
        self
    }

    pub fn with_prior(mut self, prior: PriorChoice) -> Self {
        self.prior_choice = prior;
        self
    }

    /// Run the $`\chi^2`$ prior on `(true, rec)` binnings of its own.
    pub fn with_prior_binnings(mut self, true_prior: Binning, rec_prior: Binning) -> Self {
        self.prior_binnings = Some((true_prior, rec_prior));
        self
    }

    pub fn with_chi2_prior(mut self, chi2: Chi2Unfolder) -> Self {
        self.chi2 = chi2;
        self
    }

    pub fn with_smoothing(mut self, smoothing: Option<Smoothing>) -> Self {
        self.smoothing = smoothing;
        self
    }

    pub fn kreg(&self, plane: Plane) -> usize {
        match plane {
            Plane::In => self.kreg_in,
            Plane::Out => self.kreg_out,
        }
    }

    fn smooth(&mut self, spectrum: &Histogram1D) -> Histogram1D {
        match self.smoothing.as_mut() {
            Some(smoothing) => smoothing.apply(spectrum),
            None => spectrum.clone(),
        }
    }

    fn chi2_prior(&mut self, input: &UnfoldingInput) -> JetFlowResult<UnfoldingResult> {
        match (&self.prior_binnings, &input.source) {
            (Some((true_prior, rec_prior)), Some(source)) => {
                let response = rebin2d(&source.full_response, true_prior, rec_prior);
                let prior_input = UnfoldingInput {
                    plane: input.plane,
                    measured: rebin1d(&source.raw_spectrum, rec_prior),
                    efficiency: kinematic_efficiency(&response),
                    response,
                    prior: rebin1d(&source.raw_spectrum, true_prior),
                    source: None,
                };
                self.chi2.unfold(&prior_input)
            }
            (Some(_), None) => Err(JetFlowError::MissingInput {
                name: "raw spectrum and full response for the prior binnings".to_string(),
            }),
            (None, _) => self.chi2.unfold(input),
        }
    }
}

impl Unfolder for SvdUnfolder {
    fn algorithm(&self) -> UnfoldingAlgorithm {
        match self.normalization {
            PriorNormalization::Current => UnfoldingAlgorithm::Svd,
            PriorNormalization::Legacy => UnfoldingAlgorithm::SvdLegacy,
        }
    }

    fn unfold(&mut self, input: &UnfoldingInput) -> JetFlowResult<UnfoldingResult> {
        let plane = input.plane;
        let kreg = self.kreg(plane);

        let (prior, prior_result) = match self.prior_choice {
            PriorChoice::Measured => (self.smooth(&input.prior), None),
            PriorChoice::Chi2 => {
                let result = self.chi2_prior(input)?;
                if !result.converged {
                    warn!(%plane, "no prior from chi2 unfolding, skipping SVD");
                    let mut failed =
                        UnfoldingResult::not_converged(input.prior.clone(), input.measured.clone());
                    failed.prior_result = Some(Box::new(result));
                    return Ok(failed);
                }
                let prior = match self.prior_binnings {
                    Some(_) => rebin1d(&result.unfolded, input.prior.binning()),
                    None => result.unfolded.clone(),
                };
                (prior, Some(Box::new(result)))
            }
        };

        let measured = self.smooth(&input.measured);
        let prior_smoothed = self.smooth(&input.prior);
        let prior_local = self.smooth(&prior);

        let transposed = input.response.transpose();
        let (detector, truth, transposed_normalized, normalized_response) =
            match self.normalization {
                PriorNormalization::Current => {
                    let weights = prior_local.multiply(&input.efficiency)?;
                    let detector = normalize_with_prior(&transposed, &weights)?;
                    (detector, prior_local.contents().to_vec(), None, None)
                }
                PriorNormalization::Legacy => {
                    if input.response.nx() != input.response.ny() {
                        warn!(
                            %plane,
                            n_true = input.response.nx(),
                            n_rec = input.response.ny(),
                            "SVD unfolding expects equal true and reconstructed bin counts"
                        );
                    }
                    let detector = normalize_with_prior(&transposed, &prior_local)?;
                    let truth = detector.projection_y(0..detector.nx()).contents().to_vec();
                    let mut normalized = input.response.clone();
                    normalize_columns(&mut normalized);
                    let transposed_normalized =
                        normalize_with_prior(&normalized.transpose(), &prior_local)?;
                    (detector, truth, Some(transposed_normalized), Some(normalized))
                }
            };

        let inversion = SvdInversion::new(&detector.to_matrix(), &truth, &measured, kreg)?;
        let b = DVector::from_column_slice(measured.contents());
        let raw = inversion.apply(&b);
        let covariance = match self.error_treatment {
            ErrorTreatment::Covariance => inversion.covariance(),
            ErrorTreatment::Toy => inversion.toy_covariance(&measured, self.n_toys, self.toy_seed),
        };
        let mut unfolded = Histogram1D::new(input.response.x_binning().clone());
        for (t, value) in raw.iter().enumerate() {
            unfolded.set_content(t, *value);
        }
        let Some(pearson) = covariance
            .iter()
            .all(|c| c.is_finite())
            .then(|| pearson_coefficients(&covariance))
            .flatten()
        else {
            warn!(%plane, kreg, "SVD unfolding produced no usable covariance");
            let mut failed = UnfoldingResult::not_converged(unfolded, measured);
            failed.prior = Some(prior_local);
            failed.prior_result = prior_result;
            return Ok(failed);
        };
        for (t, variance) in diagonal_variances(&covariance).into_iter().enumerate() {
            unfolded.set_variance(t, variance);
        }
        let unfolded = unfolded.divide(&input.efficiency)?;

        let refolded = match &normalized_response {
            Some(normalized) => fold(&unfolded, normalized, &input.efficiency)?,
            None => LinearResponse::new(detector.clone())
                .apply_to_truth(&unfolded.multiply(&input.efficiency)?)?,
        };
        let ratio = ratio(&measured, &refolded, &RatioOptions::default());
        info!(%plane, kreg, algorithm = %self.algorithm(), "SVD unfolding converged");

        let diagnostics = SvdDiagnostics {
            singular_values: index_histogram(inversion.singular_values.iter().copied())?,
            d_vector: index_histogram(inversion.d.iter().map(|d| d.abs()))?,
            transposed_response: detector,
            transposed_response_normalized: transposed_normalized,
            normalized_response,
            prior_smoothed,
            prior_template: input.prior.clone(),
        };
        Ok(UnfoldingResult {
            unfolded,
            measured,
            covariance: Some(covariance),
            pearson: Some(pearson),
            refolded: Some(refolded),
            ratio: Some(ratio),
            prior: Some(prior_local),
            converged: true,
            diagnostics: Diagnostics::Svd(Box::new(diagnostics)),
            prior_result,
        })
    }
}
