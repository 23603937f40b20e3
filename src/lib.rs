//! `jetflow` is a library for unfolding event-plane dependent jet spectra. Measured jet
//! transverse-momentum spectra, split into an in-plane and an out-of-plane part with respect to
//! the second-order event plane, are corrected for background fluctuations ("delta-pt") and for
//! detector smearing. The unfolded spectra are then compared to obtain the in-plane/out-of-plane
//! yield ratio and the elliptic flow coefficient $`v_2`$ of jets.
//!
//! # Key Features
//! * Histograms on arbitrary (non-uniform) binnings with rebinning and weighted response
//!   redistribution.
//! * Construction of the full response operator from a delta-pt distribution and a detector
//!   response.
//! * Three interchangeable unfolding methods behind the [`Unfolder`](crate::unfolding::Unfolder)
//!   trait: regularized $`\chi^2`$ minimization, SVD inversion (current and legacy
//!   normalization), and a pass-through used for sanity checks.
//! * A hierarchical [`OutputStore`] which keeps every intermediate and final object keyed by
//!   run label, plane, and artifact kind.
//!
//! # Quick Start
//! ```rust,no_run
//! use jetflow::{Binning, FlowUnfolder, InputCollection, UnfoldingAlgorithm, UnfoldingConfig};
//!
//! let input = InputCollection::read("~/analysis/jet_flow_input.bin").unwrap();
//! let config = UnfoldingConfig::default()
//!     .with_algorithm(UnfoldingAlgorithm::Svd)
//!     .with_bins_true(Binning::uniform(15, (20.0, 170.0)).unwrap())
//!     .with_bins_rec(Binning::uniform(15, (20.0, 170.0)).unwrap());
//! let mut unfolder = FlowUnfolder::new(config).with_input(input);
//! unfolder.set_active_run("svd_default");
//! let summary = unfolder.make().unwrap();
//! println!("in plane converged: {}", summary.converged_in);
//! unfolder.output().write("unfolded_spectra.bin").unwrap();
//! ```
#![warn(clippy::perf, clippy::style)]
#![allow(clippy::excessive_precision)]

use thiserror::Error;

/// Post-unfolding observables: ratios, $`v_2`$, and Pearson coefficients.
pub mod analysis;
/// Rebinning of spectra and response matrices.
pub mod binning;
/// Run configuration and the enums which select between algorithms.
pub mod config;
/// The top-level driver which sequences a full in-plane/out-of-plane unfolding run.
pub mod flow;
/// One- and two-dimensional histograms on arbitrary binnings.
pub mod histogram;
/// Input collections produced by upstream analysis tasks.
pub mod input;
/// Hierarchical storage of everything a run produces.
pub mod output;
/// Construction and manipulation of response operators.
pub mod response;
/// Extraction, normalization, and smoothing of jet spectra.
pub mod spectrum;
/// Unfolding algorithms.
pub mod unfolding;

pub use crate::analysis::{
    flow_coefficient, pearson_coefficients, ratio, ConstantFit, Graph, RatioOptions,
};
pub use crate::binning::{normalize_columns, rebin1d, rebin2d};
pub use crate::config::{ErrorTreatment, PriorChoice, UnfoldingAlgorithm, UnfoldingConfig};
pub use crate::flow::{FlowUnfolder, RunSummary};
pub use crate::histogram::{Binning, Histogram1D, Histogram2D};
pub use crate::input::{InputCollection, RawInput};
pub use crate::output::{Artifact, ArtifactKind, OutputStore, Scope};
pub use crate::response::{
    build_delta_pt_response, compose_responses, fold, kinematic_efficiency, unity_response,
};
pub use crate::spectrum::{PowerLaw, SpectrumModel, SpectrumPair};
pub use crate::unfolding::{Plane, UnfoldingInput, UnfoldingResult, Unfolder};

/// Shorthand for results returned by `jetflow` methods.
pub type JetFlowResult<T> = Result<T, JetFlowError>;

/// The error type used by all `jetflow` internal methods
#[derive(Error, Debug)]
pub enum JetFlowError {
    /// An alias for [`std::io::Error`].
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),
    /// An alias for [`bincode::Error`].
    #[error("Serialization Error: {0}")]
    BincodeError(#[from] bincode::Error),
    /// An alias for [`serde_json::Error`].
    #[error("JSON Error: {0}")]
    JsonError(#[from] serde_json::Error),
    /// An alias for [`shellexpand::LookupError`].
    #[error("Failed to expand path: {0}")]
    LookupError(#[from] shellexpand::LookupError<std::env::VarError>),
    /// An error which occurs when the user tries to parse an invalid string of text, typically
    /// into an enum variant.
    #[error("Failed to parse string: \"{name}\" does not correspond to a valid \"{object}\"!")]
    ParseError {
        /// The string which was parsed
        name: String,
        /// The name of the object it failed to parse into
        object: String,
    },
    /// Two operators can't be combined because their shared axes have different sizes.
    #[error("Dimension mismatch in {operation}: {left} bins vs. {right} bins")]
    DimensionMismatch {
        /// The operation which was attempted
        operation: String,
        /// Number of bins on the left operand's shared axis
        left: usize,
        /// Number of bins on the right operand's shared axis
        right: usize,
    },
    /// Two histograms which must share a binning do not.
    #[error("Binning mismatch in {operation}")]
    BinningMismatch {
        /// The operation which was attempted
        operation: String,
    },
    /// Bin edges which are not strictly increasing, or too few of them.
    #[error("Invalid binning: {reason}")]
    InvalidBinning {
        /// Why the edges were rejected
        reason: String,
    },
    /// A required input object was not supplied or could not be found.
    #[error("Missing input: {name}")]
    MissingInput {
        /// Name of the missing object
        name: String,
    },
    /// The true or reconstructed binning has not been configured.
    #[error("No {axis} binning set")]
    MissingBinning {
        /// Which axis is missing ("true" or "rec")
        axis: String,
    },
    /// An artifact with the same key was already written for the active run.
    #[error("Artifact \"{kind}\" already exists in {scope} of run \"{run}\"")]
    DuplicateArtifact {
        /// Run label
        run: String,
        /// Scope within the run
        scope: String,
        /// Artifact kind
        kind: String,
    },
    /// A custom fallback error for errors too complex or too infrequent to warrant their own error
    /// category.
    #[error("{0}")]
    Custom(String),
}
