use std::{
    fmt::Display,
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
    str::FromStr,
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    histogram::Binning,
    spectrum::{AngleSelection, FitWindow, Smoothing, SpectrumModel},
    unfolding::Plane,
    JetFlowError, JetFlowResult,
};

/// The method used to unfold both planes of a run.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnfoldingAlgorithm {
    /// Regularized $`\chi^2`$ minimization.
    Chi2,
    /// SVD inversion with a prior and efficiency weighted response.
    Svd,
    /// SVD inversion with a prior weighted response and explicit refolding.
    SvdLegacy,
    /// No unfolding at all: the (optionally smoothed) measured spectrum is passed through.
    None,
}
impl Display for UnfoldingAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnfoldingAlgorithm::Chi2 => write!(f, "Chi2"),
            UnfoldingAlgorithm::Svd => write!(f, "SVD"),
            UnfoldingAlgorithm::SvdLegacy => write!(f, "SVD (legacy)"),
            UnfoldingAlgorithm::None => write!(f, "None"),
        }
    }
}
impl FromStr for UnfoldingAlgorithm {
    type Err = JetFlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chi2" | "chi-square" | "chisquare" | "kchi2" => Ok(Self::Chi2),
            "svd" | "ksvd" => Ok(Self::Svd),
            "svdlegacy" | "svd legacy" | "svd-legacy" | "svd (legacy)" | "ksvdlegacy" => {
                Ok(Self::SvdLegacy)
            }
            "none" | "knone" | "passthrough" => Ok(Self::None),
            _ => Err(JetFlowError::ParseError {
                name: s.to_string(),
                object: "UnfoldingAlgorithm".to_string(),
            }),
        }
    }
}

/// Where the SVD methods take their prior from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriorChoice {
    /// The measured spectrum rebinned to the true binning.
    Measured,
    /// The result of a $`\chi^2`$ unfolding.
    Chi2,
}
impl Display for PriorChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PriorChoice::Measured => write!(f, "Measured"),
            PriorChoice::Chi2 => write!(f, "Chi2"),
        }
    }
}
impl FromStr for PriorChoice {
    type Err = JetFlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "measured" | "meas" | "kpriormeasured" => Ok(Self::Measured),
            "chi2" | "chi-square" | "kpriorchi2" => Ok(Self::Chi2),
            _ => Err(JetFlowError::ParseError {
                name: s.to_string(),
                object: "PriorChoice".to_string(),
            }),
        }
    }
}

/// How the covariance of an SVD unfolding is obtained.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorTreatment {
    /// Sample covariance of unfoldings of Gaussian toy variations of the measured spectrum.
    Toy,
    /// Analytic propagation of the measured errors.
    Covariance,
}
impl Display for ErrorTreatment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorTreatment::Toy => write!(f, "Toy"),
            ErrorTreatment::Covariance => write!(f, "Covariance"),
        }
    }
}
impl FromStr for ErrorTreatment {
    type Err = JetFlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "toy" | "toys" | "kcovtoy" => Ok(Self::Toy),
            "covariance" | "cov" | "analytic" | "kcovariance" => Ok(Self::Covariance),
            _ => Err(JetFlowError::ParseError {
                name: s.to_string(),
                object: "ErrorTreatment".to_string(),
            }),
        }
    }
}

/// Every option of an unfolding run.
///
/// The defaults correspond to the reference analysis: $`\beta = 0.1`$ in both planes, SVD
/// regularization 5, toy errors, jet radius 0.3, event-count normalization and smoothing on with a
/// fit over $`[60, 105]`$ GeV/c replacing everything above 75 GeV/c, event-plane resolution 0.63,
/// and the detector response folded in. Binnings have no default and must be set before a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnfoldingConfig {
    pub algorithm: UnfoldingAlgorithm,
    pub beta_in: f64,
    pub beta_out: f64,
    pub svd_reg_in: usize,
    pub svd_reg_out: usize,
    pub svd_toys: bool,
    pub n_toys: usize,
    pub toy_seed: u64,
    pub prior: PriorChoice,
    pub bins_true: Option<Binning>,
    pub bins_rec: Option<Binning>,
    pub bins_true_prior: Option<Binning>,
    pub bins_rec_prior: Option<Binning>,
    pub smoothen: bool,
    pub fit_min: f64,
    pub fit_max: f64,
    pub fit_start: f64,
    pub normalize_spectra: bool,
    /// Overrides the event count of the input when set.
    pub event_count: Option<f64>,
    /// Recorded in the configuration summary only.
    pub jet_radius: f64,
    /// Replace the full response by a unity response.
    pub test_mode: bool,
    /// Ignore the event-plane angle and unfold the full spectrum twice.
    pub no_dphi: bool,
    pub event_plane_resolution: f64,
    pub use_detector_response: bool,
    pub avoid_rounding_error: bool,
    pub save_full: bool,
    pub centrality_bin: usize,
    /// Seed every smoothing fit with the result of the previous one.
    pub train_power: bool,
}

impl Default for UnfoldingConfig {
    fn default() -> Self {
        Self {
            algorithm: UnfoldingAlgorithm::Chi2,
            beta_in: 0.1,
            beta_out: 0.1,
            svd_reg_in: 5,
            svd_reg_out: 5,
            svd_toys: true,
            n_toys: 1000,
            toy_seed: 0,
            prior: PriorChoice::Measured,
            bins_true: None,
            bins_rec: None,
            bins_true_prior: None,
            bins_rec_prior: None,
            smoothen: true,
            fit_min: 60.0,
            fit_max: 105.0,
            fit_start: 75.0,
            normalize_spectra: true,
            event_count: None,
            jet_radius: 0.3,
            test_mode: false,
            no_dphi: false,
            event_plane_resolution: 0.63,
            use_detector_response: true,
            avoid_rounding_error: false,
            save_full: false,
            centrality_bin: 0,
            train_power: false,
        }
    }
}

impl UnfoldingConfig {
    /// Read a configuration from a JSON file. Missing fields take their default values.
    pub fn read_json<T: AsRef<str>>(file_path: T) -> JetFlowResult<Self> {
        let expanded_path = shellexpand::full(file_path.as_ref())?;
        let file = File::open(Path::new(expanded_path.as_ref()))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Write this configuration to a JSON file.
    pub fn write_json<T: AsRef<str>>(&self, file_path: T) -> JetFlowResult<()> {
        let expanded_path = shellexpand::full(file_path.as_ref())?;
        let file = File::create(Path::new(expanded_path.as_ref()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn with_algorithm(mut self, algorithm: UnfoldingAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }
    /// Set the $`\chi^2`$ regularization strength for both planes.
    pub fn with_beta(mut self, beta_in: f64, beta_out: f64) -> Self {
        self.beta_in = beta_in;
        self.beta_out = beta_out;
        self
    }
    /// Set the SVD regularization rank for both planes.
    pub fn with_svd_reg(mut self, svd_reg_in: usize, svd_reg_out: usize) -> Self {
        self.svd_reg_in = svd_reg_in;
        self.svd_reg_out = svd_reg_out;
        self
    }
    /// Select toy-based (`true`) or analytic (`false`) SVD errors.
    pub fn with_svd_toys(mut self, svd_toys: bool) -> Self {
        self.svd_toys = svd_toys;
        self
    }
    pub fn with_n_toys(mut self, n_toys: usize) -> Self {
        self.n_toys = n_toys;
        self
    }
    pub fn with_toy_seed(mut self, toy_seed: u64) -> Self {
        self.toy_seed = toy_seed;
        self
    }
    pub fn with_prior(mut self, prior: PriorChoice) -> Self {
        self.prior = prior;
        self
    }
    pub fn with_bins_true(mut self, bins_true: Binning) -> Self {
        self.bins_true = Some(bins_true);
        self
    }
    pub fn with_bins_rec(mut self, bins_rec: Binning) -> Self {
        self.bins_rec = Some(bins_rec);
        self
    }
    /// Use separate binnings for the $`\chi^2`$ unfolding which provides an SVD prior.
    pub fn with_prior_binnings(mut self, bins_true_prior: Binning, bins_rec_prior: Binning) -> Self {
        self.bins_true_prior = Some(bins_true_prior);
        self.bins_rec_prior = Some(bins_rec_prior);
        self
    }
    pub fn with_smoothing(mut self, smoothen: bool) -> Self {
        self.smoothen = smoothen;
        self
    }
    /// Set the fit range and the point above which the fit replaces the data.
    pub fn with_fit_range(mut self, fit_min: f64, fit_max: f64, fit_start: f64) -> Self {
        self.fit_min = fit_min;
        self.fit_max = fit_max;
        self.fit_start = fit_start;
        self
    }
    pub fn with_normalization(mut self, normalize_spectra: bool) -> Self {
        self.normalize_spectra = normalize_spectra;
        self
    }
    pub fn with_event_count(mut self, event_count: f64) -> Self {
        self.event_count = Some(event_count);
        self
    }
    pub fn with_jet_radius(mut self, jet_radius: f64) -> Self {
        self.jet_radius = jet_radius;
        self
    }
    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }
    pub fn with_no_dphi(mut self, no_dphi: bool) -> Self {
        self.no_dphi = no_dphi;
        self
    }
    pub fn with_event_plane_resolution(mut self, event_plane_resolution: f64) -> Self {
        self.event_plane_resolution = event_plane_resolution;
        self
    }
    pub fn with_detector_response(mut self, use_detector_response: bool) -> Self {
        self.use_detector_response = use_detector_response;
        self
    }
    pub fn with_avoid_rounding_error(mut self, avoid_rounding_error: bool) -> Self {
        self.avoid_rounding_error = avoid_rounding_error;
        self
    }
    pub fn with_save_full(mut self, save_full: bool) -> Self {
        self.save_full = save_full;
        self
    }
    pub fn with_centrality_bin(mut self, centrality_bin: usize) -> Self {
        self.centrality_bin = centrality_bin;
        self
    }
    pub fn with_train_power(mut self, train_power: bool) -> Self {
        self.train_power = train_power;
        self
    }

    /// The true binning, or [`JetFlowError::MissingBinning`].
    pub fn true_binning(&self) -> JetFlowResult<&Binning> {
        self.bins_true.as_ref().ok_or(JetFlowError::MissingBinning {
            axis: "true".to_string(),
        })
    }

    /// The reconstructed binning, or [`JetFlowError::MissingBinning`].
    pub fn rec_binning(&self) -> JetFlowResult<&Binning> {
        self.bins_rec.as_ref().ok_or(JetFlowError::MissingBinning {
            axis: "rec".to_string(),
        })
    }

    /// The separate prior binnings, if both are set.
    pub fn prior_binnings(&self) -> Option<(Binning, Binning)> {
        match (&self.bins_true_prior, &self.bins_rec_prior) {
            (Some(t), Some(r)) => Some((t.clone(), r.clone())),
            _ => None,
        }
    }

    pub fn beta(&self, plane: Plane) -> f64 {
        match plane {
            Plane::In => self.beta_in,
            Plane::Out => self.beta_out,
        }
    }

    pub fn svd_reg(&self, plane: Plane) -> usize {
        match plane {
            Plane::In => self.svd_reg_in,
            Plane::Out => self.svd_reg_out,
        }
    }

    pub fn error_treatment(&self) -> ErrorTreatment {
        if self.svd_toys {
            ErrorTreatment::Toy
        } else {
            ErrorTreatment::Covariance
        }
    }

    pub fn angle_selection(&self) -> AngleSelection {
        if self.no_dphi {
            AngleSelection::NoAngleDependence
        } else {
            AngleSelection::EventPlane
        }
    }

    pub fn fit_window(&self) -> FitWindow {
        FitWindow {
            min: self.fit_min,
            max: self.fit_max,
            start: self.fit_start,
        }
    }

    /// The smoothing step described by this configuration, or [`None`] if smoothing is off.
    pub fn smoothing(&self, model: &(dyn SpectrumModel + 'static)) -> Option<Smoothing> {
        self.smoothen.then(|| {
            Smoothing::new(dyn_clone::clone_box(model), self.fit_window())
                .with_training(self.train_power)
        })
    }

    /// A flat record of the options which identify a run, together with its convergence.
    pub fn summary(&self, converged_in: bool, converged_out: bool) -> IndexMap<String, f64> {
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        let algorithm = match self.algorithm {
            UnfoldingAlgorithm::Chi2 => 0.0,
            UnfoldingAlgorithm::Svd => 1.0,
            UnfoldingAlgorithm::SvdLegacy => 2.0,
            UnfoldingAlgorithm::None => 3.0,
        };
        let prior = match self.prior {
            PriorChoice::Chi2 => 0.0,
            PriorChoice::Measured => 1.0,
        };
        [
            ("beta_in", self.beta_in),
            ("beta_out", self.beta_out),
            ("centrality_bin", self.centrality_bin as f64),
            ("converged_in", flag(converged_in)),
            ("converged_out", flag(converged_out)),
            ("avoid_rounding_error", flag(self.avoid_rounding_error)),
            ("algorithm", algorithm),
            ("prior", prior),
            ("svd_reg_in", self.svd_reg_in as f64),
            ("svd_reg_out", self.svd_reg_out as f64),
            ("svd_toys", flag(self.svd_toys)),
            ("jet_radius", self.jet_radius),
            ("normalize_spectra", flag(self.normalize_spectra)),
            ("smoothen", flag(self.smoothen)),
            ("test_mode", flag(self.test_mode)),
            ("use_detector_response", flag(self.use_detector_response)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectrum::PowerLaw;

    #[test]
    fn test_enum_displays_and_parses() {
        assert_eq!(format!("{}", UnfoldingAlgorithm::SvdLegacy), "SVD (legacy)");
        assert_eq!(format!("{}", PriorChoice::Chi2), "Chi2");
        assert_eq!(format!("{}", ErrorTreatment::Toy), "Toy");
        for algorithm in [
            UnfoldingAlgorithm::Chi2,
            UnfoldingAlgorithm::Svd,
            UnfoldingAlgorithm::SvdLegacy,
            UnfoldingAlgorithm::None,
        ] {
            assert_eq!(
                algorithm.to_string().parse::<UnfoldingAlgorithm>().unwrap(),
                algorithm
            );
        }
        assert_eq!(
            "kSVDlegacy".parse::<UnfoldingAlgorithm>().unwrap(),
            UnfoldingAlgorithm::SvdLegacy
        );
        assert!(matches!(
            "bayes".parse::<UnfoldingAlgorithm>(),
            Err(JetFlowError::ParseError { .. })
        ));
        assert_eq!(
            "analytic".parse::<ErrorTreatment>().unwrap(),
            ErrorTreatment::Covariance
        );
    }

    #[test]
    fn test_defaults() {
        let config = UnfoldingConfig::default();
        assert_eq!(config.beta(Plane::In), 0.1);
        assert_eq!(config.svd_reg(Plane::Out), 5);
        assert_eq!(config.error_treatment(), ErrorTreatment::Toy);
        assert_eq!(config.angle_selection(), AngleSelection::EventPlane);
        assert!(config.smoothing(&PowerLaw).is_some());
        assert!(matches!(
            config.true_binning(),
            Err(JetFlowError::MissingBinning { .. })
        ));
        assert!(config.prior_binnings().is_none());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: UnfoldingConfig = serde_json::from_str(
            r#"{"algorithm": "Svd", "beta_out": 0.5, "bins_true": [20.0, 40.0, 80.0]}"#,
        )
        .unwrap();
        assert_eq!(config.algorithm, UnfoldingAlgorithm::Svd);
        assert_eq!(config.beta_in, 0.1);
        assert_eq!(config.beta_out, 0.5);
        assert_eq!(config.true_binning().unwrap().n_bins(), 2);
    }

    #[test]
    fn test_summary_has_sixteen_fields() {
        let summary = UnfoldingConfig::default()
            .with_algorithm(UnfoldingAlgorithm::Svd)
            .summary(true, false);
        assert_eq!(summary.len(), 16);
        assert_eq!(summary["converged_in"], 1.0);
        assert_eq!(summary["converged_out"], 0.0);
        assert_eq!(summary["algorithm"], 1.0);
    }
}
