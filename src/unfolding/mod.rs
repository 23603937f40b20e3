use std::{fmt::Display, str::FromStr};

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::{
    analysis::Graph,
    config::{UnfoldingAlgorithm, UnfoldingConfig},
    histogram::{Histogram1D, Histogram2D},
    spectrum::SpectrumModel,
    JetFlowError, JetFlowResult,
};

/// Regularized $`\chi^2`$ unfolding with a retry loop.
pub mod chi2;
/// The pass-through "unfolding".
pub mod none;
/// The interface to the numerical minimizer used by the $`\chi^2`$ method.
pub mod solver;
/// SVD unfolding (Höcker & Kartvelishvili) in its current and legacy normalizations.
pub mod svd;

pub use chi2::Chi2Unfolder;
pub use none::PassThrough;
pub use solver::{Chi2Solver, FitStatus, HessianQuality, MinimizerSolver, SolverConfig};
pub use svd::{PriorNormalization, SvdDiagnostics, SvdUnfolder};

/// The orientation of jets with respect to the second-order event plane.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Plane {
    /// In plane.
    In,
    /// Out of plane.
    Out,
}

impl Plane {
    /// Both planes, in the order they are processed.
    pub const ALL: [Plane; 2] = [Plane::In, Plane::Out];
}

impl Display for Plane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Plane::In => write!(f, "in"),
            Plane::Out => write!(f, "out"),
        }
    }
}

impl FromStr for Plane {
    type Err = JetFlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "in" | "inplane" | "in plane" | "in-plane" => Ok(Self::In),
            "out" | "outofplane" | "out of plane" | "out-of-plane" => Ok(Self::Out),
            _ => Err(JetFlowError::ParseError {
                name: s.to_string(),
                object: "Plane".to_string(),
            }),
        }
    }
}

/// The unrebinned inputs from which a prior can be derived on a different binning.
#[derive(Clone, Debug)]
pub struct PriorSource {
    /// The measured spectrum before rebinning.
    pub raw_spectrum: Histogram1D,
    /// The column-normalized full response before rebinning.
    pub full_response: Histogram2D,
}

/// Everything an [`Unfolder`] needs for one plane.
#[derive(Clone, Debug)]
pub struct UnfoldingInput {
    pub plane: Plane,
    /// The measured spectrum on the reconstructed binning.
    pub measured: Histogram1D,
    /// The response on true (x) × reconstructed (y) binnings.
    pub response: Histogram2D,
    /// The kinematic efficiency on the true binning.
    pub efficiency: Histogram1D,
    /// The measured spectrum rebinned to the true binning.
    pub prior: Histogram1D,
    pub source: Option<PriorSource>,
}

/// Method-specific output of an unfolding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Diagnostics {
    Chi2(FitStatus),
    Svd(Box<SvdDiagnostics>),
    None,
}

/// The outcome of unfolding one plane.
#[derive(Clone, Debug)]
pub struct UnfoldingResult {
    /// The unfolded spectrum.
    pub unfolded: Histogram1D,
    /// The measured spectrum as it entered the unfolding (after optional smoothing).
    pub measured: Histogram1D,
    pub covariance: Option<DMatrix<f64>>,
    pub pearson: Option<DMatrix<f64>>,
    /// The unfolded spectrum folded back through the response.
    pub refolded: Option<Histogram1D>,
    /// Measured over refolded spectrum.
    pub ratio: Option<Graph>,
    /// The prior the unfolding started from.
    pub prior: Option<Histogram1D>,
    pub converged: bool,
    pub diagnostics: Diagnostics,
    /// The unfolding which produced the prior, if the prior came from one.
    pub prior_result: Option<Box<UnfoldingResult>>,
}

impl UnfoldingResult {
    pub(crate) fn not_converged(unfolded: Histogram1D, measured: Histogram1D) -> Self {
        Self {
            unfolded,
            measured,
            covariance: None,
            pearson: None,
            refolded: None,
            ratio: None,
            prior: None,
            converged: false,
            diagnostics: Diagnostics::None,
            prior_result: None,
        }
    }
}

/// The common contract of all unfolding methods.
pub trait Unfolder {
    /// The method this unfolder implements.
    fn algorithm(&self) -> UnfoldingAlgorithm;

    /// Unfold one plane. Non-convergence is reported through [`UnfoldingResult::converged`];
    /// an error means the inputs themselves were unusable.
    fn unfold(&mut self, input: &UnfoldingInput) -> JetFlowResult<UnfoldingResult>;
}

/// Build the [`Unfolder`] selected by `config`, smoothing with `model` if smoothing is enabled.
pub fn build_unfolder(config: &UnfoldingConfig, model: &(dyn SpectrumModel + 'static)) -> Box<dyn Unfolder> {
    let smoothing = config.smoothing(model);
    match config.algorithm {
        UnfoldingAlgorithm::Chi2 => Box::new(
            Chi2Unfolder::new(config.beta_in, config.beta_out).with_smoothing(smoothing),
        ),
        UnfoldingAlgorithm::Svd => Box::new(SvdUnfolder::from_config(
            config,
            PriorNormalization::Current,
            smoothing,
        )),
        UnfoldingAlgorithm::SvdLegacy => Box::new(SvdUnfolder::from_config(
            config,
            PriorNormalization::Legacy,
            smoothing,
        )),
        UnfoldingAlgorithm::None => Box::new(PassThrough::new(smoothing)),
    }
}

/// The diagonal of a covariance matrix with negative entries clamped to zero.
pub(crate) fn diagonal_variances(covariance: &DMatrix<f64>) -> Vec<f64> {
    covariance.diagonal().iter().map(|v| v.max(0.0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectrum::PowerLaw;

    #[test]
    fn test_plane_displays_and_parses() {
        assert_eq!(format!("{}", Plane::In), "in");
        assert_eq!("Out of plane".parse::<Plane>().unwrap(), Plane::Out);
        assert!("sideways".parse::<Plane>().is_err());
    }

    #[test]
    fn test_build_unfolder_dispatch() {
        for algorithm in [
            UnfoldingAlgorithm::Chi2,
            UnfoldingAlgorithm::Svd,
            UnfoldingAlgorithm::SvdLegacy,
            UnfoldingAlgorithm::None,
        ] {
            let config = UnfoldingConfig::default().with_algorithm(algorithm);
            assert_eq!(build_unfolder(&config, &PowerLaw).algorithm(), algorithm);
        }
    }
}
