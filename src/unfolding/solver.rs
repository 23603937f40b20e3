use std::convert::Infallible;

use ganesh::{algorithms::LBFGSB, Function, Minimizer};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    binning::normalize_columns,
    histogram::{Histogram1D, Histogram2D},
    JetFlowError, JetFlowResult,
};

/// Starting values below this fraction of the largest measured bin are raised to it, since a
/// parameter at exactly zero has no gradient.
const MINIMUM_INITIAL_VALUE: f64 = 1e-6;

/// Settings for one $`\chi^2`$ minimization.
///
/// A fresh configuration is created for every unfolding so no state leaks from one fit into the
/// next.
#[derive(Clone, Debug, PartialEq)]
pub struct SolverConfig {
    /// Weight of the log-log curvature penalty.
    pub beta: f64,
    pub n_rec: usize,
    pub n_true: usize,
    /// Maximum number of minimizer steps per attempt.
    pub max_iterations: usize,
    /// Relative step of the finite-difference Hessian.
    pub hessian_step: f64,
}

impl SolverConfig {
    pub fn new(beta: f64, n_rec: usize, n_true: usize) -> Self {
        Self {
            beta,
            n_rec,
            n_true,
            max_iterations: 100_000,
            hessian_step: 1e-4,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }
}

/// The inputs of one $`\chi^2`$ minimization.
#[derive(Copy, Clone, Debug)]
pub struct Chi2Problem<'a> {
    pub response: &'a Histogram2D,
    pub efficiency: &'a Histogram1D,
    pub measured: &'a Histogram1D,
    pub prior: &'a Histogram1D,
}

impl Chi2Problem<'_> {
    fn validate(&self) -> JetFlowResult<()> {
        let n_true = self.response.nx();
        for (what, n) in [
            ("efficiency", self.efficiency.n_bins()),
            ("prior", self.prior.n_bins()),
        ] {
            if n != n_true {
                return Err(JetFlowError::DimensionMismatch {
                    operation: format!("chi2 problem ({what})"),
                    left: n,
                    right: n_true,
                });
            }
        }
        if self.measured.n_bins() != self.response.ny() {
            return Err(JetFlowError::DimensionMismatch {
                operation: "chi2 problem (measured)".to_string(),
                left: self.measured.n_bins(),
                right: self.response.ny(),
            });
        }
        Ok(())
    }
}

/// Whether the Hessian at the minimum could be used for the covariance.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HessianQuality {
    /// Positive definite; the covariance is trustworthy.
    Reliable,
    /// Computed, but not positive definite.
    NotPositiveDefinite,
    /// Not computed.
    Unavailable,
}

/// What a [`Chi2Solver`] returns for one attempt.
#[derive(Clone, Debug)]
pub struct SolverOutcome {
    /// The best unfolded spectrum found, on the true binning.
    pub candidate: Histogram1D,
    /// Zero if the minimizer converged, negative otherwise.
    pub status: i32,
    pub hessian: HessianQuality,
    pub covariance: Option<DMatrix<f64>>,
    /// The data part of the $`\chi^2`$ at the minimum.
    pub chi2: f64,
    /// The weighted regularization part of the $`\chi^2`$ at the minimum.
    pub penalty: f64,
}

/// Summary of a converged or exhausted $`\chi^2`$ unfolding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitStatus {
    pub chi2: f64,
    pub penalty: f64,
    /// Number of reconstructed bins minus number of true bins.
    pub degrees_of_freedom: i64,
    /// Number of minimizations which were run.
    pub attempts: usize,
}

/// The minimizer behind the $`\chi^2`$ unfolding.
///
/// Implementors get everything they need through the arguments. The [`SolverConfig`] is built
/// anew for every unfolding.
pub trait Chi2Solver {
    /// Minimize the regularized $`\chi^2`$ of `problem`, starting from its prior.
    fn solve(
        &mut self,
        config: &SolverConfig,
        problem: &Chi2Problem<'_>,
    ) -> JetFlowResult<SolverOutcome>;
}

/// The default [`Chi2Solver`], which minimizes
/// ```math
/// \chi^2(y) = \sum_r \frac{\left(m_r - \sum_t \hat{R}(t, r)\,\epsilon_t\,y_t\right)^2}{\sigma_r^2}
///     + \beta\,P(y)
/// ```
/// with L-BFGS-B. Here $`\hat{R}`$ is the column-normalized response and $`P`$ the summed squared
/// second derivative of $`\ln y`$ with respect to $`\ln p_T`$. The spectrum is parameterized as
/// $`y_t = p_t^2`$ to keep it non-negative. Bins with zero measured error do not enter.
#[derive(Clone, Debug, Default)]
pub struct MinimizerSolver;

struct Chi2Objective {
    /// Folding matrix (rec × true) including the efficiency.
    folding: DMatrix<f64>,
    measured: DVector<f64>,
    weights: DVector<f64>,
    log_centers: Vec<f64>,
    beta: f64,
}

impl Chi2Objective {
    fn terms(&self, parameters: &[f64]) -> (f64, f64) {
        let y = DVector::from_iterator(parameters.len(), parameters.iter().map(|p| p * p));
        let residuals = &self.measured - &self.folding * &y;
        let chi2 = residuals
            .iter()
            .zip(self.weights.iter())
            .map(|(r, w)| w * r * r)
            .sum();
        (chi2, self.beta * log_log_curvature(y.as_slice(), &self.log_centers))
    }
}

impl Function<(), Infallible> for Chi2Objective {
    fn evaluate(&self, parameters: &[f64], _user_data: &mut ()) -> Result<f64, Infallible> {
        let (chi2, penalty) = self.terms(parameters);
        Ok(chi2 + penalty)
    }
}

/// Sum of squared differences of neighbouring log-log slopes. Triplets containing a
/// non-positive value are skipped.
fn log_log_curvature(y: &[f64], log_x: &[f64]) -> f64 {
    let mut penalty = 0.0;
    for i in 1..y.len().saturating_sub(1) {
        if y[i - 1] <= 0.0 || y[i] <= 0.0 || y[i + 1] <= 0.0 {
            continue;
        }
        let left = (y[i] / y[i - 1]).ln() / (log_x[i] - log_x[i - 1]);
        let right = (y[i + 1] / y[i]).ln() / (log_x[i + 1] - log_x[i]);
        penalty += (right - left).powi(2);
    }
    penalty
}

/// Central finite-difference Hessian of `f` at `x`.
fn hessian<F: Fn(&[f64]) -> f64>(f: F, x: &[f64], relative_step: f64) -> DMatrix<f64> {
    let n = x.len();
    let steps: Vec<f64> = x
        .iter()
        .map(|xi| relative_step * xi.abs().max(1e-2))
        .collect();
    let f0 = f(x);
    let mut shifted = x.to_vec();
    let mut h = DMatrix::zeros(n, n);
    for i in 0..n {
        shifted[i] = x[i] + steps[i];
        let f_plus = f(&shifted);
        shifted[i] = x[i] - steps[i];
        let f_minus = f(&shifted);
        shifted[i] = x[i];
        h[(i, i)] = (f_plus - 2.0 * f0 + f_minus) / (steps[i] * steps[i]);
        for j in 0..i {
            let mut corner = |si: f64, sj: f64| {
                shifted[i] = x[i] + si * steps[i];
                shifted[j] = x[j] + sj * steps[j];
                let value = f(&shifted);
                shifted[i] = x[i];
                shifted[j] = x[j];
                value
            };
            let value = (corner(1.0, 1.0) - corner(1.0, -1.0) - corner(-1.0, 1.0)
                + corner(-1.0, -1.0))
                / (4.0 * steps[i] * steps[j]);
            h[(i, j)] = value;
            h[(j, i)] = value;
        }
    }
    h
}

impl Chi2Solver for MinimizerSolver {
    fn solve(
        &mut self,
        config: &SolverConfig,
        problem: &Chi2Problem<'_>,
    ) -> JetFlowResult<SolverOutcome> {
        problem.validate()?;
        let true_binning = problem.response.x_binning();
        let (n_true, n_rec) = (problem.response.nx(), problem.response.ny());

        // work with spectra of order one
        let scale = problem
            .measured
            .contents()
            .iter()
            .fold(0.0_f64, |acc, c| acc.max(c.abs()));
        let scale = if scale > 0.0 { scale } else { 1.0 };

        let mut normalized = problem.response.clone();
        normalize_columns(&mut normalized);
        let folding = DMatrix::from_fn(n_rec, n_true, |r, t| {
            normalized.content(t, r) * problem.efficiency.content(t)
        });
        let measured = DVector::from_iterator(
            n_rec,
            problem.measured.contents().iter().map(|c| c / scale),
        );
        let weights = DVector::from_iterator(
            n_rec,
            problem.measured.variances().iter().map(|v| {
                if *v > 0.0 {
                    scale * scale / v
                } else {
                    0.0
                }
            }),
        );
        let log_centers: Vec<f64> = if true_binning.min() > 0.0 {
            true_binning.centers().map(f64::ln).collect()
        } else {
            (0..n_true).map(|i| i as f64).collect()
        };
        let objective = Chi2Objective {
            folding,
            measured,
            weights,
            log_centers,
            beta: config.beta,
        };

        let p0: Vec<f64> = problem
            .prior
            .contents()
            .iter()
            .map(|c| (c / scale).max(MINIMUM_INITIAL_VALUE).sqrt())
            .collect();
        let mut m = Minimizer::new(Box::new(LBFGSB::default()), n_true)
            .with_max_steps(config.max_iterations);
        m.minimize(&objective, &p0, &mut ())
            .unwrap_or_else(|never| match never {});
        let parameters: Vec<f64> = m.status.x.iter().copied().collect();
        let (chi2, penalty) = objective.terms(&parameters);
        let status = if m.status.converged && (chi2 + penalty).is_finite() {
            0
        } else {
            -1
        };
        trace!(status, chi2, penalty, "minimization finished");

        let h = hessian(
            |p| {
                let (c, r) = objective.terms(p);
                c + r
            },
            &parameters,
            config.hessian_step,
        );
        let (hessian_quality, covariance) = match h.clone().cholesky() {
            Some(cholesky) => {
                let cov_p = cholesky.inverse() * 2.0;
                // y = p², so dy/dp = 2p, and back to the original scale
                let cov_y = DMatrix::from_fn(n_true, n_true, |i, j| {
                    4.0 * parameters[i] * parameters[j] * cov_p[(i, j)] * scale * scale
                });
                (HessianQuality::Reliable, Some(cov_y))
            }
            None => {
                debug!("hessian is not positive definite");
                (HessianQuality::NotPositiveDefinite, None)
            }
        };

        let mut candidate = Histogram1D::new(true_binning.clone());
        for (t, p) in parameters.iter().enumerate() {
            candidate.set_content(t, p * p * scale);
            if let Some(cov) = &covariance {
                candidate.set_variance(t, cov[(t, t)].max(0.0));
            }
        }
        Ok(SolverOutcome {
            candidate,
            status,
            hessian: hessian_quality,
            covariance,
            chi2,
            penalty,
        })
    }
}
