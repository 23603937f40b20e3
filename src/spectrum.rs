use std::{convert::Infallible, fmt::Debug};

use dyn_clone::DynClone;
use ganesh::{algorithms::LBFGSB, Function, Minimizer};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    histogram::{Histogram1D, Histogram2D},
    unfolding::Plane,
    JetFlowError, JetFlowResult,
};

/// An in-plane and an out-of-plane spectrum on the same binning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpectrumPair {
    in_plane: Histogram1D,
    out_of_plane: Histogram1D,
}

impl SpectrumPair {
    /// Pair two spectra.
    ///
    /// # Errors
    ///
    /// Returns [`JetFlowError::BinningMismatch`] if the two spectra do not share a binning.
    pub fn new(in_plane: Histogram1D, out_of_plane: Histogram1D) -> JetFlowResult<Self> {
        if in_plane.binning() != out_of_plane.binning() {
            return Err(JetFlowError::BinningMismatch {
                operation: "SpectrumPair::new".to_string(),
            });
        }
        Ok(Self {
            in_plane,
            out_of_plane,
        })
    }

    pub fn in_plane(&self) -> &Histogram1D {
        &self.in_plane
    }

    pub fn out_of_plane(&self) -> &Histogram1D {
        &self.out_of_plane
    }

    /// The spectrum belonging to `plane`.
    pub fn get(&self, plane: Plane) -> &Histogram1D {
        match plane {
            Plane::In => &self.in_plane,
            Plane::Out => &self.out_of_plane,
        }
    }

    /// Apply `op` to both spectra.
    pub fn map<F>(&self, op: F) -> Self
    where
        F: Fn(&Histogram1D) -> Histogram1D,
    {
        Self {
            in_plane: op(&self.in_plane),
            out_of_plane: op(&self.out_of_plane),
        }
    }
}

/// How the azimuthal angle with respect to the event plane is used when splitting a spectrum.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AngleSelection {
    /// In plane: the first and last quarter of the angle range. Out of plane: the middle half.
    EventPlane,
    /// Both spectra receive the projection over the full angle range.
    NoAngleDependence,
}

/// Split a (angle × momentum) histogram into in-plane and out-of-plane momentum spectra.
///
/// # Errors
///
/// With [`AngleSelection::EventPlane`], the number of angle bins must be a positive multiple of
/// four, otherwise [`JetFlowError::InvalidBinning`] is returned.
pub fn project_planes(
    angle_vs_pt: &Histogram2D,
    selection: AngleSelection,
) -> JetFlowResult<SpectrumPair> {
    let n = angle_vs_pt.nx();
    match selection {
        AngleSelection::NoAngleDependence => {
            let full = angle_vs_pt.projection_y(0..n);
            SpectrumPair::new(full.clone(), full)
        }
        AngleSelection::EventPlane => {
            if n == 0 || n % 4 != 0 {
                return Err(JetFlowError::InvalidBinning {
                    reason: format!("{n} angle bins can not be split into quarters"),
                });
            }
            let quarter = n / 4;
            let in_plane = angle_vs_pt
                .projection_y(0..quarter)
                .add(&angle_vs_pt.projection_y(3 * quarter..n))?;
            let out_of_plane = angle_vs_pt.projection_y(quarter..3 * quarter);
            SpectrumPair::new(in_plane, out_of_plane)
        }
    }
}

/// Divide a spectrum by the number of events.
///
/// The propagated variance $`\sigma^2/N^2`$ is used wherever it is positive. Elsewhere the bin
/// falls back to a counting error, $`\sigma^2 = c/N`$, or zero if the normalized content is not
/// positive.
pub fn normalize_to_event_count(spectrum: &Histogram1D, event_count: f64) -> Histogram1D {
    let mut normalized = spectrum.clone();
    let n_sq = event_count * event_count;
    for bin in 0..spectrum.n_bins() {
        let content = spectrum.content(bin) / event_count;
        let variance = spectrum.variance(bin) / n_sq;
        normalized.set_content(bin, content);
        if variance > 0.0 {
            normalized.set_variance(bin, variance);
        } else if content > 0.0 {
            normalized.set_variance(bin, content);
        } else {
            normalized.set_variance(bin, 0.0);
        }
    }
    normalized
}

/// A parametric shape which can be fit to a falling spectrum.
pub trait SpectrumModel: DynClone + Debug + Send + Sync {
    /// The number of free parameters.
    fn n_parameters(&self) -> usize;

    /// The value of the model at `x`.
    fn value(&self, x: f64, parameters: &[f64]) -> f64;

    /// A starting point for the fit, given the bin centers and contents inside the fit range.
    fn initial_parameters(&self, x: &[f64], y: &[f64]) -> Vec<f64>;

    /// The integral of the model over `[low, high]`. The default uses composite Simpson
    /// integration.
    fn integral(&self, low: f64, high: f64, parameters: &[f64]) -> f64 {
        const INTERVALS: usize = 32;
        let h = (high - low) / INTERVALS as f64;
        let mut sum = self.value(low, parameters) + self.value(high, parameters);
        for i in 1..INTERVALS {
            let weight = if i % 2 == 1 { 4.0 } else { 2.0 };
            sum += weight * self.value(low + i as f64 * h, parameters);
        }
        sum * h / 3.0
    }
}

dyn_clone::clone_trait_object!(SpectrumModel);

/// A power law $`a x^{-b}`$, parameterized as $`(\ln a, b)`$ so the amplitude stays positive.
#[derive(Clone, Debug, Default)]
pub struct PowerLaw;

impl SpectrumModel for PowerLaw {
    fn n_parameters(&self) -> usize {
        2
    }

    fn value(&self, x: f64, parameters: &[f64]) -> f64 {
        (parameters[0] - parameters[1] * x.ln()).exp()
    }

    fn initial_parameters(&self, x: &[f64], y: &[f64]) -> Vec<f64> {
        // straight line in log-log space
        let points: Vec<(f64, f64)> = x
            .iter()
            .zip(y)
            .filter(|(&x, &y)| x > 0.0 && y > 0.0)
            .map(|(x, y)| (x.ln(), y.ln()))
            .collect();
        let n = points.len() as f64;
        let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
        let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
        let sxx: f64 = points.iter().map(|p| (p.0 - mean_x).powi(2)).sum();
        let sxy: f64 = points
            .iter()
            .map(|p| (p.0 - mean_x) * (p.1 - mean_y))
            .sum();
        let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
        vec![mean_y - slope * mean_x, -slope]
    }

    fn integral(&self, low: f64, high: f64, parameters: &[f64]) -> f64 {
        let (ln_a, b) = (parameters[0], parameters[1]);
        if (b - 1.0).abs() < 1e-12 {
            ln_a.exp() * (high / low).ln()
        } else {
            ln_a.exp() / (1.0 - b) * (high.powf(1.0 - b) - low.powf(1.0 - b))
        }
    }
}

/// The range used to fit a model and the point above which the fit replaces the data.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitWindow {
    pub min: f64,
    pub max: f64,
    pub start: f64,
}

/// Binned Poisson likelihood of a model, with predictions taken as bin-averaged integrals.
/// Contents and predictions are divided by `scale` so that normalized spectra give an objective of
/// order one.
struct BinnedLikelihood<'a> {
    model: &'a dyn SpectrumModel,
    bins: Vec<(f64, f64, f64)>,
    scale: f64,
}

impl Function<(), Infallible> for BinnedLikelihood<'_> {
    fn evaluate(&self, parameters: &[f64], _user_data: &mut ()) -> Result<f64, Infallible> {
        let mut nll = 0.0;
        for &(low, high, count) in &self.bins {
            let mu = self.model.integral(low, high, parameters) / (high - low) / self.scale;
            if !(mu > 0.0) || !mu.is_finite() {
                return Ok(1e30);
            }
            nll += mu - (count / self.scale) * mu.ln();
        }
        Ok(nll)
    }
}

/// Fit `model` to the bins of `spectrum` whose centers lie in `[min, max]`. Returns the best fit
/// parameters, or [`None`] if the fit did not converge.
pub fn fit_model(
    spectrum: &Histogram1D,
    model: &dyn SpectrumModel,
    min: f64,
    max: f64,
    start: Option<&[f64]>,
) -> Option<Vec<f64>> {
    let binning = spectrum.binning();
    let bins: Vec<(f64, f64, f64)> = (0..spectrum.n_bins())
        .filter(|&i| (min..=max).contains(&binning.center(i)))
        .map(|i| (binning.low_edge(i), binning.up_edge(i), spectrum.content(i)))
        .collect();
    let n_positive = bins.iter().filter(|b| b.2 > 0.0).count();
    if n_positive < model.n_parameters() {
        debug!(
            points = n_positive,
            parameters = model.n_parameters(),
            "too few filled bins to fit"
        );
        return None;
    }
    let scale = bins.iter().map(|b| b.2).fold(0.0, f64::max);
    let p0 = match start {
        Some(p) => p.to_vec(),
        None => {
            let x: Vec<f64> = bins.iter().map(|b| 0.5 * (b.0 + b.1)).collect();
            let y: Vec<f64> = bins.iter().map(|b| b.2).collect();
            model.initial_parameters(&x, &y)
        }
    };
    let likelihood = BinnedLikelihood {
        model,
        bins,
        scale,
    };
    let mut m = Minimizer::new(Box::new(LBFGSB::default()), model.n_parameters())
        .with_max_steps(4000);
    m.minimize(&likelihood, &p0, &mut ())
        .unwrap_or_else(|never| match never {});
    let parameters: Vec<f64> = m.status.x.iter().copied().collect();
    if m.status.converged && parameters.iter().all(|p| p.is_finite()) {
        Some(parameters)
    } else {
        None
    }
}

/// Replaces the sparsely filled tail of spectra with a fitted model.
#[derive(Clone, Debug)]
pub struct Smoothing {
    model: Box<dyn SpectrumModel>,
    window: FitWindow,
    train: bool,
    trained: Option<Vec<f64>>,
}

impl Smoothing {
    pub fn new(model: Box<dyn SpectrumModel>, window: FitWindow) -> Self {
        Self {
            model,
            window,
            train: false,
            trained: None,
        }
    }

    /// If set, every successful fit seeds the next one instead of starting from the model's
    /// data-driven guess.
    pub fn with_training(mut self, train: bool) -> Self {
        self.train = train;
        self
    }

    pub fn window(&self) -> FitWindow {
        self.window
    }

    /// Fit the model and overwrite every bin with center above the window's start with the
    /// model's bin average (error $`\sqrt{c}`$). If the fit fails the spectrum is returned as is.
    pub fn apply(&mut self, spectrum: &Histogram1D) -> Histogram1D {
        let seed = if self.train {
            self.trained.as_deref()
        } else {
            None
        };
        let Some(parameters) = fit_model(
            spectrum,
            self.model.as_ref(),
            self.window.min,
            self.window.max,
            seed,
        ) else {
            warn!(
                min = self.window.min,
                max = self.window.max,
                "smoothing fit failed, spectrum left unchanged"
            );
            return spectrum.clone();
        };
        let mut smoothed = spectrum.clone();
        let binning = spectrum.binning();
        for bin in 0..spectrum.n_bins() {
            if binning.center(bin) <= self.window.start {
                continue;
            }
            let content = self.model.integral(
                binning.low_edge(bin),
                binning.up_edge(bin),
                &parameters,
            ) / binning.width(bin);
            smoothed.set_content(bin, content);
            if content > 0.0 {
                smoothed.set_variance(bin, content);
            }
        }
        debug!(?parameters, "smoothed spectrum");
        if self.train {
            self.trained = Some(parameters);
        }
        smoothed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::Binning;
    use approx::assert_relative_eq;

    #[test]
    fn test_project_planes_quarters() {
        let angle = Binning::uniform(8, (0.0, std::f64::consts::PI)).unwrap();
        let pt = Binning::uniform(2, (0.0, 20.0)).unwrap();
        let mut h = Histogram2D::new(angle.clone(), pt);
        for (i, center) in angle.centers().enumerate() {
            h.fill(center, 5.0, (i + 1) as f64);
        }
        let pair = project_planes(&h, AngleSelection::EventPlane).unwrap();
        // bins 0, 1, 6, 7 in plane; 2..6 out of plane
        assert_relative_eq!(pair.in_plane().content(0), 1.0 + 2.0 + 7.0 + 8.0);
        assert_relative_eq!(pair.out_of_plane().content(0), 3.0 + 4.0 + 5.0 + 6.0);
        assert_eq!(pair.in_plane().content(1), 0.0);

        let flat = project_planes(&h, AngleSelection::NoAngleDependence).unwrap();
        assert_eq!(flat.in_plane(), flat.out_of_plane());
        assert_relative_eq!(flat.in_plane().content(0), 36.0);
    }

    #[test]
    fn test_project_planes_rejects_odd_angle_binning() {
        let h = Histogram2D::new(
            Binning::uniform(6, (0.0, 3.0)).unwrap(),
            Binning::uniform(2, (0.0, 2.0)).unwrap(),
        );
        assert!(project_planes(&h, AngleSelection::EventPlane).is_err());
    }

    #[test]
    fn test_normalize_to_event_count_branches() {
        let binning = Binning::uniform(3, (0.0, 3.0)).unwrap();
        let spectrum =
            Histogram1D::from_parts(binning, vec![100.0, 50.0, -4.0], vec![100.0, 0.0, 0.0])
                .unwrap();
        let normalized = normalize_to_event_count(&spectrum, 10.0);
        assert_relative_eq!(normalized.content(0), 10.0);
        assert_relative_eq!(normalized.variance(0), 1.0);
        // degenerate variance falls back to the normalized content
        assert_relative_eq!(normalized.content(1), 5.0);
        assert_relative_eq!(normalized.variance(1), 5.0);
        assert_eq!(normalized.variance(2), 0.0);
    }

    fn power_law_spectrum(ln_a: f64, b: f64) -> Histogram1D {
        let binning = Binning::uniform(16, (20.0, 180.0)).unwrap();
        let model = PowerLaw;
        let contents = (0..16)
            .map(|i| {
                model.integral(binning.low_edge(i), binning.up_edge(i), &[ln_a, b])
                    / binning.width(i)
            })
            .collect();
        Histogram1D::from_contents(binning, contents).unwrap()
    }

    #[test]
    fn test_power_law_integral_matches_simpson() {
        #[derive(Clone, Debug)]
        struct Numeric;
        impl SpectrumModel for Numeric {
            fn n_parameters(&self) -> usize {
                2
            }
            fn value(&self, x: f64, parameters: &[f64]) -> f64 {
                PowerLaw.value(x, parameters)
            }
            fn initial_parameters(&self, x: &[f64], y: &[f64]) -> Vec<f64> {
                PowerLaw.initial_parameters(x, y)
            }
        }
        let p = [10.0, 4.5];
        assert_relative_eq!(
            Numeric.integral(60.0, 70.0, &p),
            PowerLaw.integral(60.0, 70.0, &p),
            max_relative = 1e-6
        );
    }

    #[test]
    fn test_smoothing_reproduces_power_law() {
        let spectrum = power_law_spectrum(12.0, 5.0);
        let mut noisy = spectrum.clone();
        // disturb the tail, which the smoothing replaces
        noisy.set_content(15, 3.0 * spectrum.content(15));
        let mut smoothing = Smoothing::new(
            Box::new(PowerLaw),
            FitWindow {
                min: 60.0,
                max: 105.0,
                start: 75.0,
            },
        );
        let smoothed = smoothing.apply(&noisy);
        for bin in 0..16 {
            assert_relative_eq!(
                smoothed.content(bin),
                spectrum.content(bin),
                max_relative = 1e-3
            );
        }
        // below the start the data is untouched
        assert_eq!(smoothed.content(3), noisy.content(3));
    }

    #[test]
    fn test_smoothing_failure_leaves_spectrum() {
        let binning = Binning::uniform(10, (0.0, 100.0)).unwrap();
        let mut spectrum = Histogram1D::new(binning);
        spectrum.set_content(6, 1.0);
        let mut smoothing = Smoothing::new(
            Box::new(PowerLaw),
            FitWindow {
                min: 60.0,
                max: 105.0,
                start: 75.0,
            },
        );
        assert_eq!(smoothing.apply(&spectrum), spectrum);
    }
}
