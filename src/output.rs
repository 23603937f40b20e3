use std::fmt::Display;

use indexmap::IndexMap;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::{
    analysis::Graph,
    histogram::{Binning, Histogram1D, Histogram2D, Profile},
    input::{read_bincode, write_bincode},
    unfolding::{FitStatus, Plane, SvdDiagnostics},
    JetFlowError, JetFlowResult,
};

/// Where inside a run an artifact belongs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// Objects describing the run as a whole.
    Run,
    /// The unfolding of one plane.
    Plane(Plane),
    /// The unfolding which produced the prior for one plane.
    Prior(Plane),
}

impl Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Run => write!(f, "run"),
            Scope::Plane(plane) => write!(f, "plane \"{plane}\""),
            Scope::Prior(plane) => write!(f, "prior of plane \"{plane}\""),
        }
    }
}

/// What an artifact is.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArtifactKind {
    /// The measured spectrum on the reconstructed binning, as it entered the unfolding.
    InputSpectrum,
    UnfoldedSpectrum,
    RefoldedSpectrum,
    /// Measured over refolded spectrum.
    RatioRefoldedMeasured,
    Covariance,
    PearsonCoefficients,
    FitStatus,
    SvdDiagnostics,
    Prior,
    /// The rebinned full response.
    ResponseMatrix,
    KinematicEfficiency,
    /// The spectrum before rebinning.
    OriginalSpectrum,
    DeltaPtDistribution,
    DeltaPtMatrix,
    /// The full response before rebinning.
    FullResponse,
    RatioInOutPlane,
    V2,
    DetectorResponse,
    DeltaPtDeltaPhi,
    JetPtDeltaPhi,
    Configuration,
}

impl Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A stored object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Artifact {
    Histogram1D(Histogram1D),
    Histogram2D(Histogram2D),
    Graph(Graph),
    Matrix(DMatrix<f64>),
    FitStatus(FitStatus),
    SvdDiagnostics(Box<SvdDiagnostics>),
    Summary(IndexMap<String, f64>),
}

impl Artifact {
    pub fn as_histogram1d(&self) -> Option<&Histogram1D> {
        match self {
            Artifact::Histogram1D(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_histogram2d(&self) -> Option<&Histogram2D> {
        match self {
            Artifact::Histogram2D(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_graph(&self) -> Option<&Graph> {
        match self {
            Artifact::Graph(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_matrix(&self) -> Option<&DMatrix<f64>> {
        match self {
            Artifact::Matrix(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_fit_status(&self) -> Option<&FitStatus> {
        match self {
            Artifact::FitStatus(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_svd_diagnostics(&self) -> Option<&SvdDiagnostics> {
        match self {
            Artifact::SvdDiagnostics(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_summary(&self) -> Option<&IndexMap<String, f64>> {
        match self {
            Artifact::Summary(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Histogram1D> for Artifact {
    fn from(value: Histogram1D) -> Self {
        Artifact::Histogram1D(value)
    }
}

impl From<Histogram2D> for Artifact {
    fn from(value: Histogram2D) -> Self {
        Artifact::Histogram2D(value)
    }
}

impl From<Graph> for Artifact {
    fn from(value: Graph) -> Self {
        Artifact::Graph(value)
    }
}

impl From<DMatrix<f64>> for Artifact {
    fn from(value: DMatrix<f64>) -> Self {
        Artifact::Matrix(value)
    }
}

impl From<FitStatus> for Artifact {
    fn from(value: FitStatus) -> Self {
        Artifact::FitStatus(value)
    }
}

impl From<SvdDiagnostics> for Artifact {
    fn from(value: SvdDiagnostics) -> Self {
        Artifact::SvdDiagnostics(Box::new(value))
    }
}

impl From<IndexMap<String, f64>> for Artifact {
    fn from(value: IndexMap<String, f64>) -> Self {
        Artifact::Summary(value)
    }
}

/// Profiles which accumulate the unfolded spectra and their ratio over every run in which both
/// planes converged. Their spread measures the variation between runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpreadProfiles {
    /// Filled with weight $`1/\sigma^2`$.
    pub spectrum_in: Profile,
    /// Filled with weight $`1/\sigma^2`$.
    pub spectrum_out: Profile,
    /// Filled unweighted.
    pub ratio: Profile,
}

impl SpreadProfiles {
    pub fn new(binning: &Binning) -> Self {
        Self {
            spectrum_in: Profile::new(binning.clone()),
            spectrum_out: Profile::new(binning.clone()),
            ratio: Profile::new(binning.clone()),
        }
    }

    /// Add one pair of unfolded spectra.
    pub fn update(&mut self, unfolded_in: &Histogram1D, unfolded_out: &Histogram1D) {
        for bin in 0..unfolded_in.n_bins().min(unfolded_out.n_bins()) {
            let x = unfolded_in.binning().center(bin);
            let (c_in, e_in) = (unfolded_in.content(bin), unfolded_in.error(bin));
            let (c_out, e_out) = (unfolded_out.content(bin), unfolded_out.error(bin));
            if e_in > 0.0 {
                self.spectrum_in.fill(x, c_in, 1.0 / (e_in * e_in));
            }
            if e_out > 0.0 {
                self.spectrum_out.fill(x, c_out, 1.0 / (e_out * e_out));
            }
            if c_out > 0.0 {
                self.ratio.fill(x, c_in / c_out, 1.0);
            }
        }
    }
}

type RunArtifacts = IndexMap<Scope, IndexMap<ArtifactKind, Artifact>>;

/// Everything produced by a sequence of runs, as run label → scope → kind → artifact, in
/// insertion order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputStore {
    runs: IndexMap<String, RunArtifacts>,
    spread: Option<SpreadProfiles>,
}

impl OutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an artifact.
    ///
    /// # Errors
    ///
    /// Returns [`JetFlowError::DuplicateArtifact`] if `run` already holds an artifact of `kind`
    /// in `scope`. The stored artifact is left untouched.
    pub fn insert<A: Into<Artifact>>(
        &mut self,
        run: &str,
        scope: Scope,
        kind: ArtifactKind,
        artifact: A,
    ) -> JetFlowResult<()> {
        let artifacts = self
            .runs
            .entry(run.to_string())
            .or_default()
            .entry(scope)
            .or_default();
        if artifacts.contains_key(&kind) {
            return Err(JetFlowError::DuplicateArtifact {
                run: run.to_string(),
                scope: scope.to_string(),
                kind: kind.to_string(),
            });
        }
        artifacts.insert(kind, artifact.into());
        Ok(())
    }

    pub fn get(&self, run: &str, scope: Scope, kind: ArtifactKind) -> Option<&Artifact> {
        self.runs.get(run)?.get(&scope)?.get(&kind)
    }

    pub fn contains(&self, run: &str, scope: Scope, kind: ArtifactKind) -> bool {
        self.get(run, scope, kind).is_some()
    }

    pub fn contains_run(&self, run: &str) -> bool {
        self.runs.contains_key(run)
    }

    /// Drop everything stored under `run`. Returns whether there was anything to drop.
    pub fn remove_run(&mut self, run: &str) -> bool {
        self.runs.shift_remove(run).is_some()
    }

    /// Run labels in the order the runs were stored.
    pub fn runs(&self) -> impl Iterator<Item = &str> {
        self.runs.keys().map(String::as_str)
    }

    /// The kinds stored for `run` in `scope`, in insertion order.
    pub fn kinds(&self, run: &str, scope: Scope) -> Vec<ArtifactKind> {
        self.runs
            .get(run)
            .and_then(|scopes| scopes.get(&scope))
            .map(|artifacts| artifacts.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn spread_profiles(&self) -> Option<&SpreadProfiles> {
        self.spread.as_ref()
    }

    /// The spread profiles, created on `binning` if there are none yet.
    pub fn spread_profiles_mut(&mut self, binning: &Binning) -> &mut SpreadProfiles {
        self.spread
            .get_or_insert_with(|| SpreadProfiles::new(binning))
    }

    /// Read a store from a bincode file. The path may contain `~` and environment variables.
    pub fn read<T: AsRef<str>>(file_path: T) -> JetFlowResult<Self> {
        read_bincode(file_path.as_ref())
    }

    pub fn write<T: AsRef<str>>(&self, file_path: T) -> JetFlowResult<()> {
        write_bincode(self, file_path.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn spectrum(contents: Vec<f64>) -> Histogram1D {
        Histogram1D::from_contents(Binning::uniform(2, (0.0, 2.0)).unwrap(), contents).unwrap()
    }

    #[test]
    fn test_duplicate_artifact_is_rejected() {
        let mut store = OutputStore::new();
        let plane = Scope::Plane(Plane::In);
        store
            .insert("run", plane, ArtifactKind::UnfoldedSpectrum, spectrum(vec![1.0, 2.0]))
            .unwrap();
        let err = store
            .insert("run", plane, ArtifactKind::UnfoldedSpectrum, spectrum(vec![3.0, 4.0]))
            .unwrap_err();
        assert!(matches!(err, JetFlowError::DuplicateArtifact { .. }));
        let kept = store
            .get("run", plane, ArtifactKind::UnfoldedSpectrum)
            .and_then(Artifact::as_histogram1d)
            .unwrap();
        assert_relative_eq!(kept.content(0), 1.0);
        // same kind elsewhere is fine
        store
            .insert(
                "run",
                Scope::Plane(Plane::Out),
                ArtifactKind::UnfoldedSpectrum,
                spectrum(vec![3.0, 4.0]),
            )
            .unwrap();
        store
            .insert("other", plane, ArtifactKind::UnfoldedSpectrum, spectrum(vec![3.0, 4.0]))
            .unwrap();
        assert_eq!(store.runs().collect::<Vec<_>>(), vec!["run", "other"]);
    }

    #[test]
    fn test_kinds_keep_insertion_order() {
        let mut store = OutputStore::new();
        store
            .insert("a", Scope::Run, ArtifactKind::V2, Graph::new())
            .unwrap();
        store
            .insert("a", Scope::Run, ArtifactKind::DetectorResponse, DMatrix::<f64>::zeros(1, 1))
            .unwrap();
        assert_eq!(
            store.kinds("a", Scope::Run),
            vec![ArtifactKind::V2, ArtifactKind::DetectorResponse]
        );
        assert!(store.kinds("b", Scope::Run).is_empty());
    }

    #[test]
    fn test_removed_run_can_be_stored_again() {
        let mut store = OutputStore::new();
        for run in ["a", "b"] {
            store
                .insert(run, Scope::Run, ArtifactKind::V2, Graph::new())
                .unwrap();
        }
        assert!(store.remove_run("a"));
        assert!(!store.remove_run("a"));
        assert!(!store.contains_run("a"));
        assert_eq!(store.runs().collect::<Vec<_>>(), vec!["b"]);
        store
            .insert("a", Scope::Run, ArtifactKind::V2, Graph::new())
            .unwrap();
        assert_eq!(store.runs().collect::<Vec<_>>(), vec!["b", "a"]);
    }

    #[test]
    fn test_spread_profiles() {
        let mut store = OutputStore::new();
        let binning = Binning::uniform(2, (0.0, 2.0)).unwrap();
        let profiles = store.spread_profiles_mut(&binning);
        profiles.update(&spectrum(vec![4.0, 9.0]), &spectrum(vec![2.0, 0.0]));
        profiles.update(&spectrum(vec![16.0, 9.0]), &spectrum(vec![4.0, 0.0]));
        let profiles = store.spread_profiles().unwrap();
        assert_eq!(profiles.ratio.entries(0), 2);
        assert_eq!(profiles.ratio.entries(1), 0);
        assert_relative_eq!(profiles.ratio.mean(0).unwrap(), 3.0);
        // weights 1/4 and 1/16
        assert_relative_eq!(
            profiles.spectrum_in.mean(0).unwrap(),
            (4.0 / 4.0 + 16.0 / 16.0) / (1.0 / 4.0 + 1.0 / 16.0),
            max_relative = 1e-12
        );
        assert_eq!(profiles.spectrum_out.entries(1), 0);
    }

    #[test]
    fn test_store_file_round_trip() {
        let mut store = OutputStore::new();
        store
            .insert("run", Scope::Prior(Plane::Out), ArtifactKind::Prior, spectrum(vec![1.0, 2.0]))
            .unwrap();
        let path = std::env::temp_dir().join("jetflow_output_store_test.bin");
        let path = path.to_string_lossy();
        store.write(&*path).unwrap();
        assert_eq!(OutputStore::read(&*path).unwrap(), store);
        std::fs::remove_file(&*path).unwrap();
    }
}
