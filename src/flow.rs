use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    analysis::{flow_coefficient, ratio, RatioOptions},
    binning::{normalize_columns, rebin1d, rebin2d},
    config::UnfoldingConfig,
    histogram::{Binning, Histogram2D},
    input::{InputCollection, RawInput},
    output::{Artifact, ArtifactKind, OutputStore, Scope},
    response::{
        build_delta_pt_response, compose_responses, delta_pt_axis, kinematic_efficiency,
        unity_response,
    },
    spectrum::{normalize_to_event_count, project_planes, PowerLaw, SpectrumModel, SpectrumPair},
    unfolding::{
        build_unfolder, Diagnostics, Plane, PriorSource, Unfolder, UnfoldingInput,
        UnfoldingResult,
    },
    JetFlowError, JetFlowResult,
};

/// Which planes converged in a call to [`FlowUnfolder::make`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub converged_in: bool,
    pub converged_out: bool,
}

impl RunSummary {
    pub fn converged(&self, plane: Plane) -> bool {
        match plane {
            Plane::In => self.converged_in,
            Plane::Out => self.converged_out,
        }
    }

    pub fn both_converged(&self) -> bool {
        self.converged_in && self.converged_out
    }
}

#[derive(Clone, Debug)]
enum InputSource {
    Collection(InputCollection),
    Raw(RawInput),
}

/// Inputs after plane splitting and normalization, before any rebinning.
struct PreparedInput {
    spectra: SpectrumPair,
    delta_pt: SpectrumPair,
    delta_pt_in: Histogram2D,
    delta_pt_out: Histogram2D,
    detector_response: Histogram2D,
    /// The (angle × momentum) and (angle × delta-pt) histograms, if the planes were projected
    /// here.
    angle_inputs: Option<(Histogram2D, Histogram2D)>,
}

impl PreparedInput {
    fn delta_pt_response(&self, plane: Plane) -> &Histogram2D {
        match plane {
            Plane::In => &self.delta_pt_in,
            Plane::Out => &self.delta_pt_out,
        }
    }
}

/// Sequences full unfolding runs: input preparation, response construction, unfolding of both
/// planes, and the in/out comparison. Every run writes into one [`OutputStore`] under its own
/// label, so the same unfolder can be rerun with varied configurations.
pub struct FlowUnfolder {
    config: UnfoldingConfig,
    input: Option<InputSource>,
    detector_response: Option<Histogram2D>,
    model: Box<dyn SpectrumModel>,
    unfolder: Option<Box<dyn Unfolder>>,
    active_run: String,
    output: OutputStore,
}

impl FlowUnfolder {
    pub fn new(config: UnfoldingConfig) -> Self {
        Self {
            config,
            input: None,
            detector_response: None,
            model: Box::new(PowerLaw),
            unfolder: None,
            active_run: "default".to_string(),
            output: OutputStore::new(),
        }
    }

    /// Take spectra from a collection of jet task output.
    pub fn with_input(mut self, input: InputCollection) -> Self {
        self.input = Some(InputSource::Collection(input));
        self
    }

    /// Take spectra which were already split by plane.
    pub fn with_raw_input(mut self, input: RawInput) -> Self {
        self.input = Some(InputSource::Raw(input));
        self
    }

    /// Use this detector response instead of the one in the input.
    pub fn with_detector_response(mut self, detector_response: Histogram2D) -> Self {
        self.detector_response = Some(detector_response);
        self
    }

    /// Smooth spectra with this model instead of a power law.
    pub fn with_model(mut self, model: Box<dyn SpectrumModel>) -> Self {
        self.model = model;
        self
    }

    /// Unfold both planes with `unfolder` instead of the algorithm selected in the
    /// configuration. The same instance is reused for every run.
    pub fn with_unfolder(mut self, unfolder: Box<dyn Unfolder>) -> Self {
        self.unfolder = Some(unfolder);
        self
    }

    pub fn config(&self) -> &UnfoldingConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut UnfoldingConfig {
        &mut self.config
    }

    /// Label under which the next run is stored.
    pub fn set_active_run<T: AsRef<str>>(&mut self, label: T) {
        self.active_run = label.as_ref().to_string();
    }

    pub fn active_run(&self) -> &str {
        &self.active_run
    }

    pub fn output(&self) -> &OutputStore {
        &self.output
    }

    pub fn into_output(self) -> OutputStore {
        self.output
    }

    fn prepare(&self) -> JetFlowResult<PreparedInput> {
        let config = &self.config;
        let source = self.input.as_ref().ok_or_else(|| JetFlowError::MissingInput {
            name: "input collection or raw input".to_string(),
        })?;
        match source {
            InputSource::Collection(collection) => {
                let centrality = collection.centrality(config.centrality_bin)?;
                let detector_response = match &self.detector_response {
                    Some(response) => response.clone(),
                    None => collection.detector_response()?.clone(),
                };
                let selection = config.angle_selection();
                let mut spectra = project_planes(&centrality.jet_pt_dphi, selection)?;
                if config.normalize_spectra {
                    let event_count = config.event_count.unwrap_or(centrality.event_count);
                    if event_count > 0.0 {
                        debug!(event_count, "normalizing spectra to event count");
                        spectra = spectra.map(|h| normalize_to_event_count(h, event_count));
                    }
                }
                let delta_pt = project_planes(&centrality.delta_pt_dphi, selection)?;
                let axis = delta_pt_axis()?;
                let avoid = config.avoid_rounding_error;
                Ok(PreparedInput {
                    delta_pt_in: build_delta_pt_response(delta_pt.in_plane(), &axis, avoid),
                    delta_pt_out: build_delta_pt_response(delta_pt.out_of_plane(), &axis, avoid),
                    spectra,
                    delta_pt,
                    detector_response,
                    angle_inputs: Some((
                        centrality.jet_pt_dphi.clone(),
                        centrality.delta_pt_dphi.clone(),
                    )),
                })
            }
            InputSource::Raw(raw) => {
                let event_count = if config.normalize_spectra {
                    Some(raw.event_count)
                } else {
                    config.event_count
                };
                let spectra = match event_count {
                    Some(n) if n > 0.0 => raw.spectra.map(|h| h / n),
                    _ => raw.spectra.clone(),
                };
                let avoid = config.avoid_rounding_error;
                let delta_pt_in = build_delta_pt_response(
                    raw.delta_pt.in_plane(),
                    raw.delta_pt.in_plane().binning(),
                    avoid,
                );
                let delta_pt_out = build_delta_pt_response(
                    raw.delta_pt.out_of_plane(),
                    raw.delta_pt.out_of_plane().binning(),
                    avoid,
                );
                Ok(PreparedInput {
                    spectra,
                    delta_pt: raw.delta_pt.clone(),
                    delta_pt_in,
                    delta_pt_out,
                    detector_response: self
                        .detector_response
                        .clone()
                        .unwrap_or_else(|| raw.detector_response.clone()),
                    angle_inputs: None,
                })
            }
        }
    }

    /// Run the full chain for both planes and store everything under the active run label.
    ///
    /// # Errors
    ///
    /// Fails if no input or binning is set, if input objects are missing or inconsistent, or if
    /// the active run already holds results. A plane which does not converge is not an error;
    /// it is reported in the returned [`RunSummary`].
    pub fn make(&mut self) -> JetFlowResult<RunSummary> {
        let bins_true = self.config.true_binning()?.clone();
        let bins_rec = self.config.rec_binning()?.clone();
        let run = self.active_run.clone();
        if self.output.contains_run(&run) {
            return Err(JetFlowError::DuplicateArtifact {
                run,
                scope: Scope::Run.to_string(),
                kind: "any".to_string(),
            });
        }
        let prepared = self.prepare()?;
        let made = self.make_run(&run, prepared, &bins_true, &bins_rec);
        if made.is_err() && self.output.remove_run(&run) {
            debug!(run = %run, "discarded partial run");
        }
        made
    }

    /// Everything after input preparation. Artifacts are stored as they are produced; the spread
    /// profiles are only touched once every artifact of the run is stored.
    fn make_run(
        &mut self,
        run: &str,
        prepared: PreparedInput,
        bins_true: &Binning,
        bins_rec: &Binning,
    ) -> JetFlowResult<RunSummary> {
        info!(
            run = %run,
            algorithm = %self.config.algorithm,
            n_true = bins_true.n_bins(),
            n_rec = bins_rec.n_bins(),
            "starting unfolding run"
        );

        let mut detector_response = prepared.detector_response.clone();
        normalize_columns(&mut detector_response);

        let custom = self.unfolder.is_some();
        let mut unfolder = match self.unfolder.take() {
            Some(unfolder) => unfolder,
            None => build_unfolder(&self.config, self.model.as_ref()),
        };
        let results = self.unfold_planes(
            run,
            &prepared,
            &detector_response,
            (bins_true, bins_rec),
            unfolder.as_mut(),
        );
        if custom {
            self.unfolder = Some(unfolder);
        }
        let results = results?;
        let summary = RunSummary {
            converged_in: results[0].converged,
            converged_out: results[1].converged,
        };

        if summary.both_converged() {
            let (unfolded_in, unfolded_out) = (&results[0].unfolded, &results[1].unfolded);
            let in_out = ratio(unfolded_in, unfolded_out, &RatioOptions::default().without_fit())
                .with_name("RatioInOutPlane");
            let v2 = flow_coefficient(
                unfolded_in,
                unfolded_out,
                self.config.event_plane_resolution,
            )?
            .with_name("v2");
            self.store(run, Scope::Run, ArtifactKind::RatioInOutPlane, in_out)?;
            self.store(run, Scope::Run, ArtifactKind::V2, v2)?;
        } else {
            warn!(
                run = %run,
                converged_in = summary.converged_in,
                converged_out = summary.converged_out,
                "not all planes converged, skipping in/out ratio and v2"
            );
        }

        self.store(run, Scope::Run, ArtifactKind::DetectorResponse, detector_response)?;
        if let Some((jet_pt_dphi, delta_pt_dphi)) = prepared.angle_inputs {
            self.store(run, Scope::Run, ArtifactKind::JetPtDeltaPhi, jet_pt_dphi)?;
            self.store(run, Scope::Run, ArtifactKind::DeltaPtDeltaPhi, delta_pt_dphi)?;
        }
        let configuration = self
            .config
            .summary(summary.converged_in, summary.converged_out);
        self.store(run, Scope::Run, ArtifactKind::Configuration, configuration)?;

        if summary.both_converged() {
            self.output
                .spread_profiles_mut(bins_true)
                .update(&results[0].unfolded, &results[1].unfolded);
        }
        Ok(summary)
    }

    fn unfold_planes(
        &mut self,
        run: &str,
        prepared: &PreparedInput,
        detector_response: &Histogram2D,
        (bins_true, bins_rec): (&Binning, &Binning),
        unfolder: &mut dyn Unfolder,
    ) -> JetFlowResult<Vec<UnfoldingResult>> {
        let resized = prepared.spectra.map(|h| rebin1d(h, bins_rec));
        let templates = prepared.spectra.map(|h| rebin1d(h, bins_true));
        let mut results = Vec::with_capacity(2);
        for plane in Plane::ALL {
            let mut full_response = if self.config.test_mode {
                unity_response(bins_true, bins_rec)
            } else if self.config.use_detector_response {
                compose_responses(prepared.delta_pt_response(plane), detector_response)?
            } else {
                prepared.delta_pt_response(plane).clone()
            };
            normalize_columns(&mut full_response);
            let response = rebin2d(&full_response, bins_true, bins_rec);
            let input = UnfoldingInput {
                plane,
                measured: resized.get(plane).clone(),
                efficiency: kinematic_efficiency(&response),
                response,
                prior: templates.get(plane).clone(),
                source: Some(PriorSource {
                    raw_spectrum: prepared.spectra.get(plane).clone(),
                    full_response: full_response.clone(),
                }),
            };
            let result = unfolder.unfold(&input)?;
            info!(run = %run, %plane, converged = result.converged, "plane unfolded");
            self.store_plane(run, &input, &result)?;
            if self.config.save_full {
                self.store_full(run, plane, prepared, full_response)?;
            }
            results.push(result);
        }
        Ok(results)
    }

    fn store<A: Into<Artifact>>(
        &mut self,
        run: &str,
        scope: Scope,
        kind: ArtifactKind,
        artifact: A,
    ) -> JetFlowResult<()> {
        self.output.insert(run, scope, kind, artifact)
    }

    fn store_result(
        &mut self,
        run: &str,
        scope: Scope,
        result: &UnfoldingResult,
    ) -> JetFlowResult<()> {
        self.store(run, scope, ArtifactKind::InputSpectrum, result.measured.clone())?;
        self.store(run, scope, ArtifactKind::UnfoldedSpectrum, result.unfolded.clone())?;
        if let Some(refolded) = &result.refolded {
            self.store(run, scope, ArtifactKind::RefoldedSpectrum, refolded.clone())?;
        }
        if let Some(ratio) = &result.ratio {
            let ratio = ratio.clone().with_name("RatioRefoldedMeasured");
            self.store(run, scope, ArtifactKind::RatioRefoldedMeasured, ratio)?;
        }
        if let Some(covariance) = &result.covariance {
            self.store(run, scope, ArtifactKind::Covariance, covariance.clone())?;
        }
        if let Some(pearson) = &result.pearson {
            self.store(run, scope, ArtifactKind::PearsonCoefficients, pearson.clone())?;
        }
        if let Some(prior) = &result.prior {
            self.store(run, scope, ArtifactKind::Prior, prior.clone())?;
        }
        match &result.diagnostics {
            Diagnostics::Chi2(status) => {
                self.store(run, scope, ArtifactKind::FitStatus, status.clone())?
            }
            Diagnostics::Svd(diagnostics) => self.store(
                run,
                scope,
                ArtifactKind::SvdDiagnostics,
                Artifact::SvdDiagnostics(diagnostics.clone()),
            )?,
            Diagnostics::None => {}
        }
        Ok(())
    }

    fn store_plane(
        &mut self,
        run: &str,
        input: &UnfoldingInput,
        result: &UnfoldingResult,
    ) -> JetFlowResult<()> {
        let scope = Scope::Plane(input.plane);
        self.store_result(run, scope, result)?;
        if let Some(prior_result) = &result.prior_result {
            self.store_result(run, Scope::Prior(input.plane), prior_result)?;
        }
        self.store(run, scope, ArtifactKind::ResponseMatrix, input.response.clone())?;
        self.store(
            run,
            scope,
            ArtifactKind::KinematicEfficiency,
            input.efficiency.clone(),
        )
    }

    fn store_full(
        &mut self,
        run: &str,
        plane: Plane,
        prepared: &PreparedInput,
        full_response: Histogram2D,
    ) -> JetFlowResult<()> {
        let scope = Scope::Plane(plane);
        self.store(
            run,
            scope,
            ArtifactKind::OriginalSpectrum,
            prepared.spectra.get(plane).clone(),
        )?;
        self.store(
            run,
            scope,
            ArtifactKind::DeltaPtDistribution,
            prepared.delta_pt.get(plane).clone(),
        )?;
        self.store(
            run,
            scope,
            ArtifactKind::DeltaPtMatrix,
            prepared.delta_pt_response(plane).clone(),
        )?;
        self.store(run, scope, ArtifactKind::FullResponse, full_response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UnfoldingAlgorithm;
    use crate::histogram::Histogram1D;
    use crate::unfolding::PassThrough;
    use approx::assert_relative_eq;

    fn raw_input() -> RawInput {
        let pt = Binning::uniform(6, (20.0, 80.0)).unwrap();
        let spectrum = |scale: f64| {
            let contents: Vec<f64> = pt.centers().map(|x| scale * 1e8 * x.powf(-4.0)).collect();
            Histogram1D::from_contents(pt.clone(), contents).unwrap()
        };
        let delta_pt = Histogram1D::new(Binning::uniform(5, (-2.5, 2.5)).unwrap());
        RawInput::new(
            unity_response(&pt, &pt),
            spectrum(1.2),
            spectrum(0.8),
            delta_pt.clone(),
            delta_pt,
            0.0,
        )
        .unwrap()
    }

    fn config() -> UnfoldingConfig {
        let pt = Binning::uniform(6, (20.0, 80.0)).unwrap();
        UnfoldingConfig::default()
            .with_algorithm(UnfoldingAlgorithm::None)
            .with_bins_true(pt.clone())
            .with_bins_rec(pt)
            .with_smoothing(false)
            .with_test_mode(true)
    }

    #[test]
    fn test_make_requires_binning_and_input() {
        let mut unfolder = FlowUnfolder::new(UnfoldingConfig::default());
        assert!(matches!(
            unfolder.make(),
            Err(JetFlowError::MissingBinning { .. })
        ));
        let mut unfolder = FlowUnfolder::new(config());
        assert!(matches!(
            unfolder.make(),
            Err(JetFlowError::MissingInput { .. })
        ));
    }

    #[test]
    fn test_pass_through_run() {
        let mut unfolder = FlowUnfolder::new(config()).with_raw_input(raw_input());
        unfolder.set_active_run("pass");
        let summary = unfolder.make().unwrap();
        assert!(summary.both_converged());
        let output = unfolder.output();
        let v2 = output
            .get("pass", Scope::Run, ArtifactKind::V2)
            .and_then(|a| a.as_graph())
            .unwrap();
        assert_eq!(v2.name(), Some("v2"));
        // in/out = 1.5 everywhere
        for point in v2.points() {
            assert_relative_eq!(
                point.y,
                std::f64::consts::PI / (4.0 * 0.63) * 0.2,
                max_relative = 1e-12
            );
        }
        assert!(output.contains("pass", Scope::Run, ArtifactKind::Configuration));
        assert!(!output.contains("pass", Scope::Run, ArtifactKind::JetPtDeltaPhi));
        assert_eq!(
            output
                .spread_profiles()
                .map(|p| p.ratio.entries(0)),
            Some(1)
        );
        // the same label can not be reused
        assert!(unfolder.make().is_err());
        unfolder.set_active_run("again");
        unfolder.make().unwrap();
        assert_eq!(
            unfolder.output().spread_profiles().map(|p| p.ratio.entries(0)),
            Some(2)
        );
    }

    struct BrokenOutOfPlane;

    impl Unfolder for BrokenOutOfPlane {
        fn algorithm(&self) -> UnfoldingAlgorithm {
            UnfoldingAlgorithm::None
        }

        fn unfold(&mut self, input: &UnfoldingInput) -> JetFlowResult<UnfoldingResult> {
            match input.plane {
                Plane::In => PassThrough::new(None).unfold(input),
                Plane::Out => Err(JetFlowError::Custom("out of plane unusable".to_string())),
            }
        }
    }

    #[test]
    fn test_failed_run_leaves_no_partial_output() {
        let mut unfolder = FlowUnfolder::new(config())
            .with_raw_input(raw_input())
            .with_unfolder(Box::new(BrokenOutOfPlane));
        unfolder.set_active_run("retry");
        assert!(matches!(unfolder.make(), Err(JetFlowError::Custom(_))));
        assert!(!unfolder.output().contains_run("retry"));
        assert!(unfolder.output().spread_profiles().is_none());

        let mut unfolder = unfolder.with_unfolder(Box::new(PassThrough::new(None)));
        let summary = unfolder.make().unwrap();
        assert!(summary.both_converged());
        assert!(unfolder
            .output()
            .contains("retry", Scope::Plane(Plane::Out), ArtifactKind::UnfoldedSpectrum));
        assert_eq!(
            unfolder.output().spread_profiles().map(|p| p.ratio.entries(0)),
            Some(1)
        );
    }
}
