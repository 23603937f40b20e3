use tracing::{debug, info, warn};

use crate::{
    analysis::{pearson_coefficients, ratio, RatioOptions},
    config::UnfoldingAlgorithm,
    response::fold,
    spectrum::Smoothing,
    JetFlowResult,
};

use super::{
    solver::{Chi2Problem, Chi2Solver, FitStatus, HessianQuality, MinimizerSolver, SolverConfig},
    Diagnostics, Plane, Unfolder, UnfoldingInput, UnfoldingResult,
};

/// How often a failed minimization is restarted from its own last candidate.
pub const MAX_ATTEMPTS: usize = 100;

/// Regularized $`\chi^2`$ unfolding.
///
/// Each plane is minimized with its own $`\beta`$. A minimization which ends with a negative
/// status is restarted from the spectrum it ended on, up to [`MAX_ATTEMPTS`] times in total. The
/// result only counts as converged if the last status is zero and the Hessian at the minimum is
/// positive definite.
#[derive(Clone, Debug)]
pub struct Chi2Unfolder<S: Chi2Solver = MinimizerSolver> {
    beta_in: f64,
    beta_out: f64,
    smoothing: Option<Smoothing>,
    solver: S,
}

impl Chi2Unfolder {
    pub fn new(beta_in: f64, beta_out: f64) -> Self {
        Self {
            beta_in,
            beta_out,
            smoothing: None,
            solver: MinimizerSolver,
        }
    }
}

impl<S: Chi2Solver> Chi2Unfolder<S> {
    /// Smooth the measured spectrum and the prior before unfolding.
    pub fn with_smoothing(mut self, smoothing: Option<Smoothing>) -> Self {
        self.smoothing = smoothing;
        self
    }

    /// Replace the minimizer.
    pub fn with_solver<T: Chi2Solver>(self, solver: T) -> Chi2Unfolder<T> {
        Chi2Unfolder {
            beta_in: self.beta_in,
            beta_out: self.beta_out,
            smoothing: self.smoothing,
            solver,
        }
    }

    pub fn solver(&self) -> &S {
        &self.solver
    }

    pub fn beta(&self, plane: Plane) -> f64 {
        match plane {
            Plane::In => self.beta_in,
            Plane::Out => self.beta_out,
        }
    }
}

impl<S: Chi2Solver> Unfolder for Chi2Unfolder<S> {
    fn algorithm(&self) -> UnfoldingAlgorithm {
        UnfoldingAlgorithm::Chi2
    }

    fn unfold(&mut self, input: &UnfoldingInput) -> JetFlowResult<UnfoldingResult> {
        let (measured, prior) = match self.smoothing.as_mut() {
            Some(smoothing) => (smoothing.apply(&input.measured), smoothing.apply(&input.prior)),
            None => (input.measured.clone(), input.prior.clone()),
        };
        let config = SolverConfig::new(
            self.beta(input.plane),
            input.response.ny(),
            input.response.nx(),
        );
        let mut start = prior.clone();
        let mut attempts = 0;
        let outcome = loop {
            let outcome = self.solver.solve(
                &config,
                &Chi2Problem {
                    response: &input.response,
                    efficiency: &input.efficiency,
                    measured: &measured,
                    prior: &start,
                },
            )?;
            attempts += 1;
            if outcome.status >= 0 || attempts >= MAX_ATTEMPTS {
                break outcome;
            }
            debug!(
                plane = %input.plane,
                attempt = attempts,
                status = outcome.status,
                "restarting from last candidate"
            );
            start = outcome.candidate.clone();
        };
        let status = FitStatus {
            chi2: outcome.chi2,
            penalty: outcome.penalty,
            degrees_of_freedom: config.n_rec as i64 - config.n_true as i64,
            attempts,
        };
        let converged = outcome.status == 0 && outcome.hessian == HessianQuality::Reliable;
        if !converged {
            warn!(
                plane = %input.plane,
                status = outcome.status,
                hessian = ?outcome.hessian,
                attempts,
                "chi2 unfolding did not converge"
            );
            let mut result = UnfoldingResult::not_converged(outcome.candidate, measured);
            result.prior = Some(prior);
            result.diagnostics = Diagnostics::Chi2(status);
            return Ok(result);
        }
        info!(
            plane = %input.plane,
            chi2 = status.chi2,
            penalty = status.penalty,
            attempts,
            "chi2 unfolding converged"
        );
        let unfolded = outcome.candidate;
        let pearson = outcome.covariance.as_ref().and_then(pearson_coefficients);
        let refolded = fold(&unfolded, &input.response, &input.efficiency)?;
        let ratio = ratio(&measured, &refolded, &RatioOptions::default());
        Ok(UnfoldingResult {
            unfolded,
            measured,
            covariance: outcome.covariance,
            pearson,
            refolded: Some(refolded),
            ratio: Some(ratio),
            prior: Some(prior),
            converged,
            diagnostics: Diagnostics::Chi2(status),
            prior_result: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::{Binning, Histogram1D};
    use crate::response::unity_response;
    use crate::unfolding::solver::SolverOutcome;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    /// Fails a fixed number of times, then succeeds with the given Hessian quality. Every
    /// candidate is the starting spectrum doubled.
    struct ScriptedSolver {
        failures: usize,
        hessian: HessianQuality,
        starts: Vec<Histogram1D>,
    }

    impl ScriptedSolver {
        fn new(failures: usize, hessian: HessianQuality) -> Self {
            Self {
                failures,
                hessian,
                starts: Vec::new(),
            }
        }
    }

    impl Chi2Solver for ScriptedSolver {
        fn solve(
            &mut self,
            _config: &SolverConfig,
            problem: &Chi2Problem<'_>,
        ) -> JetFlowResult<SolverOutcome> {
            self.starts.push(problem.prior.clone());
            let status = if self.starts.len() > self.failures {
                0
            } else {
                -1
            };
            let n = problem.prior.n_bins();
            Ok(SolverOutcome {
                candidate: problem.prior.scaled(2.0),
                status,
                hessian: self.hessian,
                covariance: Some(DMatrix::identity(n, n)),
                chi2: 1.5,
                penalty: 0.5,
            })
        }
    }

    fn input(plane: Plane) -> UnfoldingInput {
        let binning = Binning::uniform(5, (20.0, 70.0)).unwrap();
        let measured =
            Histogram1D::from_contents(binning.clone(), vec![50.0, 40.0, 30.0, 20.0, 10.0])
                .unwrap();
        let efficiency =
            Histogram1D::from_parts(binning.clone(), vec![1.0; 5], vec![0.0; 5]).unwrap();
        UnfoldingInput {
            plane,
            measured: measured.clone(),
            response: unity_response(&binning, &binning),
            efficiency,
            prior: measured,
            source: None,
        }
    }

    #[test]
    fn test_retries_from_last_candidate() {
        let mut unfolder = Chi2Unfolder::new(0.1, 0.2)
            .with_solver(ScriptedSolver::new(3, HessianQuality::Reliable));
        let result = unfolder.unfold(&input(Plane::In)).unwrap();
        assert!(result.converged);
        let starts = &unfolder.solver().starts;
        assert_eq!(starts.len(), 4);
        assert_relative_eq!(starts[1].content(0), 100.0);
        assert_relative_eq!(starts[3].content(0), 400.0);
        match result.diagnostics {
            Diagnostics::Chi2(status) => {
                assert_eq!(status.attempts, 4);
                assert_eq!(status.degrees_of_freedom, 0);
                assert_relative_eq!(status.penalty, 0.5);
            }
            _ => panic!("expected chi2 diagnostics"),
        }
        assert!(result.refolded.is_some());
        assert!(result.ratio.is_some());
        assert!(result.pearson.is_some());
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let mut unfolder = Chi2Unfolder::new(0.1, 0.2)
            .with_solver(ScriptedSolver::new(usize::MAX, HessianQuality::Reliable));
        let result = unfolder.unfold(&input(Plane::Out)).unwrap();
        assert!(!result.converged);
        assert_eq!(unfolder.solver().starts.len(), MAX_ATTEMPTS);
        assert!(result.refolded.is_none());
        assert!(result.ratio.is_none());
    }

    #[test]
    fn test_unreliable_hessian_is_not_converged() {
        let mut unfolder = Chi2Unfolder::new(0.1, 0.2)
            .with_solver(ScriptedSolver::new(0, HessianQuality::NotPositiveDefinite));
        let result = unfolder.unfold(&input(Plane::In)).unwrap();
        assert!(!result.converged);
        assert_eq!(unfolder.solver().starts.len(), 1);
        assert!(result.pearson.is_none());
    }

    #[test]
    fn test_beta_per_plane() {
        let unfolder = Chi2Unfolder::new(0.1, 0.2);
        assert_relative_eq!(unfolder.beta(Plane::In), 0.1);
        assert_relative_eq!(unfolder.beta(Plane::Out), 0.2);
    }

    #[test]
    fn test_unfolds_power_law_through_identity() {
        let binning = Binning::uniform(6, (20.0, 80.0)).unwrap();
        let contents: Vec<f64> = binning.centers().map(|x| 5e6 * x.powf(-3.0)).collect();
        let measured = Histogram1D::from_contents(binning.clone(), contents).unwrap();
        let efficiency =
            Histogram1D::from_parts(binning.clone(), vec![1.0; 6], vec![0.0; 6]).unwrap();
        let input = UnfoldingInput {
            plane: Plane::In,
            measured: measured.clone(),
            response: unity_response(&binning, &binning),
            efficiency,
            prior: measured.clone(),
            source: None,
        };
        let result = Chi2Unfolder::new(0.1, 0.1).unfold(&input).unwrap();
        assert!(result.converged);
        match &result.diagnostics {
            Diagnostics::Chi2(status) => assert_eq!(status.attempts, 1),
            _ => panic!("expected chi2 diagnostics"),
        }
        for bin in 0..6 {
            assert_relative_eq!(
                result.unfolded.content(bin),
                measured.content(bin),
                max_relative = 1e-3
            );
        }
        let ratio = result.ratio.unwrap();
        for point in ratio.points() {
            assert_relative_eq!(point.y, 1.0, epsilon = 1e-3);
        }
    }
}
