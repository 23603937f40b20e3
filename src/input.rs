use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

use indexmap::IndexMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    histogram::{Histogram1D, Histogram2D},
    spectrum::SpectrumPair,
    JetFlowError, JetFlowResult,
};

pub(crate) fn read_bincode<T: DeserializeOwned>(file_path: &str) -> JetFlowResult<T> {
    let expanded_path = shellexpand::full(file_path)?;
    let file = File::open(Path::new(expanded_path.as_ref()))?;
    Ok(bincode::deserialize_from(BufReader::new(file))?)
}

pub(crate) fn write_bincode<T: Serialize>(value: &T, file_path: &str) -> JetFlowResult<()> {
    let expanded_path = shellexpand::full(file_path)?;
    let file = File::create(Path::new(expanded_path.as_ref()))?;
    bincode::serialize_into(BufWriter::new(file), value)?;
    Ok(())
}

/// The jet task output for one centrality bin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CentralityInput {
    /// Jet yield with the angle to the event plane on x and the jet momentum on y.
    pub jet_pt_dphi: Histogram2D,
    /// Delta-pt distribution with the angle to the event plane on x and delta-pt on y.
    pub delta_pt_dphi: Histogram2D,
    /// Number of events, used when no explicit event count is configured.
    pub event_count: f64,
}

/// Everything the upstream jet task produces, keyed by centrality bin, together with the
/// detector response (true × reconstructed).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InputCollection {
    pub detector_response: Option<Histogram2D>,
    pub centralities: IndexMap<usize, CentralityInput>,
}

impl InputCollection {
    pub fn new(detector_response: Histogram2D) -> Self {
        Self {
            detector_response: Some(detector_response),
            centralities: IndexMap::new(),
        }
    }

    pub fn with_centrality(mut self, bin: usize, input: CentralityInput) -> Self {
        self.centralities.insert(bin, input);
        self
    }

    /// # Errors
    ///
    /// Returns [`JetFlowError::MissingInput`] if the collection holds nothing for `bin`.
    pub fn centrality(&self, bin: usize) -> JetFlowResult<&CentralityInput> {
        self.centralities
            .get(&bin)
            .ok_or_else(|| JetFlowError::MissingInput {
                name: format!("jet spectrum and delta-pt distribution for centrality bin {bin}"),
            })
    }

    /// # Errors
    ///
    /// Returns [`JetFlowError::MissingInput`] if no detector response was provided.
    pub fn detector_response(&self) -> JetFlowResult<&Histogram2D> {
        self.detector_response
            .as_ref()
            .ok_or_else(|| JetFlowError::MissingInput {
                name: "detector response".to_string(),
            })
    }

    /// Read a collection from a bincode file. The path may contain `~` and environment
    /// variables.
    pub fn read<T: AsRef<str>>(file_path: T) -> JetFlowResult<Self> {
        read_bincode(file_path.as_ref())
    }

    pub fn write<T: AsRef<str>>(&self, file_path: T) -> JetFlowResult<()> {
        write_bincode(self, file_path.as_ref())
    }
}

/// Spectra and delta-pt distributions which were already split by plane.
///
/// The delta-pt responses are built on the binning of the distributions themselves.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawInput {
    pub detector_response: Histogram2D,
    pub spectra: SpectrumPair,
    pub delta_pt: SpectrumPair,
    pub event_count: f64,
}

impl RawInput {
    /// # Errors
    ///
    /// Returns [`JetFlowError::BinningMismatch`] if the in- and out-of-plane histograms of
    /// either pair are binned differently.
    pub fn new(
        detector_response: Histogram2D,
        jet_pt_in: Histogram1D,
        jet_pt_out: Histogram1D,
        delta_pt_in: Histogram1D,
        delta_pt_out: Histogram1D,
        event_count: f64,
    ) -> JetFlowResult<Self> {
        Ok(Self {
            detector_response,
            spectra: SpectrumPair::new(jet_pt_in, jet_pt_out)?,
            delta_pt: SpectrumPair::new(delta_pt_in, delta_pt_out)?,
            event_count,
        })
    }

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
    use crate::histogram::Binning;

    fn collection() -> InputCollection {
        let pt = Binning::uniform(4, (0.0, 40.0)).unwrap();
        let angle = Binning::uniform(4, (0.0, std::f64::consts::PI)).unwrap();
        let mut jets = Histogram2D::new(angle.clone(), pt.clone());
        jets.fill(0.1, 15.0, 3.0);
        InputCollection::new(Histogram2D::new(pt.clone(), pt.clone())).with_centrality(
            1,
            CentralityInput {
                jet_pt_dphi: jets,
                delta_pt_dphi: Histogram2D::new(angle, pt),
                event_count: 1e6,
            },
        )
    }

    #[test]
    fn test_missing_centrality() {
        let input = collection();
        assert!(input.centrality(1).is_ok());
        assert!(matches!(
            input.centrality(0),
            Err(JetFlowError::MissingInput { .. })
        ));
        assert!(InputCollection::default().detector_response().is_err());
    }

    #[test]
    fn test_collection_file_round_trip() {
        let input = collection();
        let path = std::env::temp_dir().join("jetflow_input_collection_test.bin");
        let path = path.to_string_lossy();
        input.write(&*path).unwrap();
        assert_eq!(InputCollection::read(&*path).unwrap(), input);
        std::fs::remove_file(&*path).unwrap();
    }

    #[test]
    fn test_raw_input_needs_matching_pairs() {
        let a = Histogram1D::new(Binning::uniform(4, (0.0, 40.0)).unwrap());
        let b = Histogram1D::new(Binning::uniform(5, (0.0, 40.0)).unwrap());
        let response = Histogram2D::new(a.binning().clone(), a.binning().clone());
        assert!(RawInput::new(response, a.clone(), b, a.clone(), a, 1.0).is_err());
    }
}
