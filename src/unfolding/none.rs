use tracing::debug;

use crate::{config::UnfoldingAlgorithm, spectrum::Smoothing, JetFlowResult};

use super::{Unfolder, UnfoldingInput, UnfoldingResult};

/// Returns the measured spectrum, optionally smoothed, as the unfolded one.
///
/// Useful to run the full chain (ratios, $`v_2`$, persistence) on detector-level spectra.
#[derive(Clone, Debug, Default)]
pub struct PassThrough {
    smoothing: Option<Smoothing>,
}

impl PassThrough {
    pub fn new(smoothing: Option<Smoothing>) -> Self {
        Self { smoothing }
    }
}

impl Unfolder for PassThrough {
    fn algorithm(&self) -> UnfoldingAlgorithm {
        UnfoldingAlgorithm::None
    }

    fn unfold(&mut self, input: &UnfoldingInput) -> JetFlowResult<UnfoldingResult> {
        debug!(plane = %input.plane, "passing measured spectrum through");
        let measured = match self.smoothing.as_mut() {
            Some(smoothing) => smoothing.apply(&input.measured),
            None => input.measured.clone(),
        };
        let mut result = UnfoldingResult::not_converged(measured.clone(), measured);
        result.converged = true;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::{Binning, Histogram1D};
    use crate::response::unity_response;
    use crate::unfolding::Plane;

    #[test]
    fn test_pass_through_returns_measured() {
        let binning = Binning::uniform(3, (0.0, 3.0)).unwrap();
        let measured = Histogram1D::from_contents(binning.clone(), vec![3.0, 2.0, 1.0]).unwrap();
        let input = UnfoldingInput {
            plane: Plane::Out,
            measured: measured.clone(),
            response: unity_response(&binning, &binning),
            efficiency: measured.clone(),
            prior: measured.clone(),
            source: None,
        };
        let result = PassThrough::new(None).unfold(&input).unwrap();
        assert!(result.converged);
        assert_eq!(result.unfolded, measured);
        assert!(result.covariance.is_none());
    }
}
