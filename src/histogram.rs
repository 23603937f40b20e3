use std::ops::Range;

use auto_ops::*;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::{JetFlowError, JetFlowResult};

/// An ordered set of strictly increasing bin edges.
///
/// Bins are half-open, `[low, high)`, so a value equal to the last edge falls outside of the
/// binning (into the implicit overflow).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct Binning {
    edges: Vec<f64>,
}

impl TryFrom<Vec<f64>> for Binning {
    type Error = JetFlowError;

    fn try_from(edges: Vec<f64>) -> Result<Self, Self::Error> {
        Self::new(edges)
    }
}

impl From<Binning> for Vec<f64> {
    fn from(binning: Binning) -> Self {
        binning.edges
    }
}

impl Binning {
    /// Create a [`Binning`] from explicit edges.
    ///
    /// # Errors
    ///
    /// Returns [`JetFlowError::InvalidBinning`] if fewer than two edges are given or if the edges
    /// are not strictly increasing.
    pub fn new(edges: Vec<f64>) -> JetFlowResult<Self> {
        if edges.len() < 2 {
            return Err(JetFlowError::InvalidBinning {
                reason: format!("at least two edges are required, got {}", edges.len()),
            });
        }
        if let Some(w) = edges.windows(2).find(|w| !(w[1] > w[0])) {
            return Err(JetFlowError::InvalidBinning {
                reason: format!("edges must be strictly increasing ({} >= {})", w[0], w[1]),
            });
        }
        Ok(Self { edges })
    }

    /// Create a [`Binning`] with evenly spaced `bins` over the given `range`.
    pub fn uniform(bins: usize, range: (f64, f64)) -> JetFlowResult<Self> {
        if bins == 0 {
            return Err(JetFlowError::InvalidBinning {
                reason: "number of bins must be greater than zero".to_string(),
            });
        }
        let bin_width = (range.1 - range.0) / (bins as f64);
        Self::new(
            (0..=bins)
                .map(|i| range.0 + (i as f64 * bin_width))
                .collect(),
        )
    }

    /// The bin edges (one more than the number of bins).
    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// The number of bins.
    pub fn n_bins(&self) -> usize {
        self.edges.len() - 1
    }

    /// Lower edge of the first bin.
    pub fn min(&self) -> f64 {
        self.edges[0]
    }

    /// Upper edge of the last bin.
    pub fn max(&self) -> f64 {
        self.edges[self.edges.len() - 1]
    }

    pub fn low_edge(&self, bin: usize) -> f64 {
        self.edges[bin]
    }

    pub fn up_edge(&self, bin: usize) -> f64 {
        self.edges[bin + 1]
    }

    pub fn center(&self, bin: usize) -> f64 {
        0.5 * (self.edges[bin] + self.edges[bin + 1])
    }

    pub fn width(&self, bin: usize) -> f64 {
        self.edges[bin + 1] - self.edges[bin]
    }

    /// Iterator over all bin centers.
    pub fn centers(&self) -> impl Iterator<Item = f64> + '_ {
        self.edges.windows(2).map(|w| 0.5 * (w[0] + w[1]))
    }

    /// Index of the bin containing `value`, or [`None`] if it lies outside of the binning.
    pub fn find_bin(&self, value: f64) -> Option<usize> {
        let idx = self.edges.partition_point(|&edge| edge <= value);
        if idx == 0 || idx > self.n_bins() {
            None
        } else {
            Some(idx - 1)
        }
    }

    /// Fraction of the interval `[low, high)` which overlaps with `bin`.
    pub fn overlap_fraction(&self, bin: usize, low: f64, high: f64) -> f64 {
        let width = high - low;
        if width <= 0.0 {
            return 0.0;
        }
        let overlap = self.up_edge(bin).min(high) - self.low_edge(bin).max(low);
        if overlap > 0.0 {
            overlap / width
        } else {
            0.0
        }
    }
}

/// A one-dimensional histogram storing a content and a variance (squared error) per bin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Histogram1D {
    binning: Binning,
    contents: Vec<f64>,
    variances: Vec<f64>,
}

impl Histogram1D {
    /// An empty histogram over `binning`.
    pub fn new(binning: Binning) -> Self {
        let n = binning.n_bins();
        Self {
            binning,
            contents: vec![0.0; n],
            variances: vec![0.0; n],
        }
    }

    /// A histogram with the given contents and Poisson variances (`|content|`).
    pub fn from_contents(binning: Binning, contents: Vec<f64>) -> JetFlowResult<Self> {
        let variances = contents.iter().map(|c| c.abs()).collect();
        Self::from_parts(binning, contents, variances)
    }

    /// A histogram with explicit contents and variances.
    pub fn from_parts(
        binning: Binning,
        contents: Vec<f64>,
        variances: Vec<f64>,
    ) -> JetFlowResult<Self> {
        if contents.len() != binning.n_bins() || variances.len() != binning.n_bins() {
            return Err(JetFlowError::DimensionMismatch {
                operation: "Histogram1D::from_parts".to_string(),
                left: binning.n_bins(),
                right: contents.len().max(variances.len()),
            });
        }
        Ok(Self {
            binning,
            contents,
            variances,
        })
    }

    pub fn binning(&self) -> &Binning {
        &self.binning
    }

    pub fn n_bins(&self) -> usize {
        self.binning.n_bins()
    }

    pub fn contents(&self) -> &[f64] {
        &self.contents
    }

    pub fn variances(&self) -> &[f64] {
        &self.variances
    }

    /// Per-bin errors (square root of the variances).
    pub fn errors(&self) -> Vec<f64> {
        self.variances.iter().map(|v| v.max(0.0).sqrt()).collect()
    }

    pub fn content(&self, bin: usize) -> f64 {
        self.contents[bin]
    }

    pub fn variance(&self, bin: usize) -> f64 {
        self.variances[bin]
    }

    pub fn error(&self, bin: usize) -> f64 {
        self.variances[bin].max(0.0).sqrt()
    }

    pub fn set_content(&mut self, bin: usize, content: f64) {
        self.contents[bin] = content;
    }

    pub fn set_variance(&mut self, bin: usize, variance: f64) {
        self.variances[bin] = variance;
    }

    pub fn set_error(&mut self, bin: usize, error: f64) {
        self.variances[bin] = error * error;
    }

    /// Add `weight` to the bin containing `x` (the variance grows by `weight²`). Values outside of
    /// the binning are dropped.
    pub fn fill(&mut self, x: f64, weight: f64) {
        if let Some(bin) = self.binning.find_bin(x) {
            self.contents[bin] += weight;
            self.variances[bin] += weight * weight;
        }
    }

    /// Content of the bin containing `x`, or zero if `x` lies outside of the binning.
    pub fn content_at(&self, x: f64) -> f64 {
        self.binning.find_bin(x).map_or(0.0, |bin| self.contents[bin])
    }

    /// Sum of all bin contents.
    pub fn integral(&self) -> f64 {
        self.contents.iter().sum()
    }

    /// A copy of this histogram with contents multiplied by `factor` (variances by `factor²`).
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            binning: self.binning.clone(),
            contents: self.contents.iter().map(|c| c * factor).collect(),
            variances: self
                .variances
                .iter()
                .map(|v| v * factor * factor)
                .collect(),
        }
    }

    /// Replace every variance by zero.
    pub fn suppress_errors(&mut self) {
        self.variances.iter_mut().for_each(|v| *v = 0.0);
    }

    fn check_compatible(&self, other: &Self, operation: &str) -> JetFlowResult<()> {
        if self.n_bins() != other.n_bins() {
            return Err(JetFlowError::DimensionMismatch {
                operation: operation.to_string(),
                left: self.n_bins(),
                right: other.n_bins(),
            });
        }
        Ok(())
    }

    /// Bin-wise sum; variances add.
    pub fn add(&self, other: &Self) -> JetFlowResult<Self> {
        self.check_compatible(other, "Histogram1D::add")?;
        let mut result = self.clone();
        for i in 0..self.n_bins() {
            result.contents[i] += other.contents[i];
            result.variances[i] += other.variances[i];
        }
        Ok(result)
    }

    /// Bin-wise product with uncorrelated error propagation.
    pub fn multiply(&self, other: &Self) -> JetFlowResult<Self> {
        self.check_compatible(other, "Histogram1D::multiply")?;
        let mut result = self.clone();
        for i in 0..self.n_bins() {
            let (c1, c2) = (self.contents[i], other.contents[i]);
            result.contents[i] = c1 * c2;
            result.variances[i] = self.variances[i] * c2 * c2 + other.variances[i] * c1 * c1;
        }
        Ok(result)
    }

    /// Bin-wise quotient with uncorrelated error propagation. Bins where the denominator is zero
    /// are set to zero.
    pub fn divide(&self, other: &Self) -> JetFlowResult<Self> {
        self.check_compatible(other, "Histogram1D::divide")?;
        let mut result = self.clone();
        for i in 0..self.n_bins() {
            let (c1, c2) = (self.contents[i], other.contents[i]);
            if c2 == 0.0 {
                result.contents[i] = 0.0;
                result.variances[i] = 0.0;
                continue;
            }
            let c2_sq = c2 * c2;
            result.contents[i] = c1 / c2;
            result.variances[i] =
                (self.variances[i] * c2_sq + other.variances[i] * c1 * c1) / (c2_sq * c2_sq);
        }
        Ok(result)
    }
}

impl_op_ex_commutative!(*|a: &Histogram1D, b: &f64| -> Histogram1D { a.scaled(*b) });
impl_op_ex!(/|a: &Histogram1D, b: &f64| -> Histogram1D { a.scaled(1.0 / *b) });

/// A two-dimensional histogram. For response operators, the x-axis is the true (generated)
/// momentum and the y-axis the reconstructed momentum, so a "true column" is a fixed x-bin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Histogram2D {
    x: Binning,
    y: Binning,
    contents: Vec<f64>,
    variances: Vec<f64>,
}

impl Histogram2D {
    /// An empty histogram over the two binnings.
    pub fn new(x: Binning, y: Binning) -> Self {
        let n = x.n_bins() * y.n_bins();
        Self {
            x,
            y,
            contents: vec![0.0; n],
            variances: vec![0.0; n],
        }
    }

    /// A histogram filled from a matrix whose rows follow `x` and columns follow `y`. Variances
    /// are left at zero.
    pub fn from_matrix(x: Binning, y: Binning, matrix: &DMatrix<f64>) -> JetFlowResult<Self> {
        if matrix.nrows() != x.n_bins() || matrix.ncols() != y.n_bins() {
            return Err(JetFlowError::DimensionMismatch {
                operation: "Histogram2D::from_matrix".to_string(),
                left: x.n_bins() * y.n_bins(),
                right: matrix.nrows() * matrix.ncols(),
            });
        }
        let mut hist = Self::new(x, y);
        for ix in 0..hist.nx() {
            for iy in 0..hist.ny() {
                hist.set_content(ix, iy, matrix[(ix, iy)]);
            }
        }
        Ok(hist)
    }

    pub fn x_binning(&self) -> &Binning {
        &self.x
    }

    pub fn y_binning(&self) -> &Binning {
        &self.y
    }

    pub fn nx(&self) -> usize {
        self.x.n_bins()
    }

    pub fn ny(&self) -> usize {
        self.y.n_bins()
    }

    #[inline]
    fn index(&self, ix: usize, iy: usize) -> usize {
        ix * self.ny() + iy
    }

    pub fn content(&self, ix: usize, iy: usize) -> f64 {
        self.contents[self.index(ix, iy)]
    }

    pub fn variance(&self, ix: usize, iy: usize) -> f64 {
        self.variances[self.index(ix, iy)]
    }

    pub fn error(&self, ix: usize, iy: usize) -> f64 {
        self.variance(ix, iy).max(0.0).sqrt()
    }

    pub fn set_content(&mut self, ix: usize, iy: usize, content: f64) {
        let idx = self.index(ix, iy);
        self.contents[idx] = content;
    }

    pub fn set_variance(&mut self, ix: usize, iy: usize, variance: f64) {
        let idx = self.index(ix, iy);
        self.variances[idx] = variance;
    }

    /// Add to both the content and the variance of a cell.
    pub fn accumulate(&mut self, ix: usize, iy: usize, content: f64, variance: f64) {
        let idx = self.index(ix, iy);
        self.contents[idx] += content;
        self.variances[idx] += variance;
    }

    /// Add `weight` to the cell containing `(x, y)`; values outside of either binning are dropped.
    pub fn fill(&mut self, x: f64, y: f64, weight: f64) {
        if let (Some(ix), Some(iy)) = (self.x.find_bin(x), self.y.find_bin(y)) {
            self.accumulate(ix, iy, weight, weight * weight);
        }
    }

    /// Sum of the contents of the true column `ix`.
    pub fn column_sum(&self, ix: usize) -> f64 {
        (0..self.ny()).map(|iy| self.content(ix, iy)).sum()
    }

    pub fn integral(&self) -> f64 {
        self.contents.iter().sum()
    }

    /// Project onto the x-axis, summing the y-bins in `y_bins`.
    pub fn projection_x(&self, y_bins: Range<usize>) -> Histogram1D {
        let mut projection = Histogram1D::new(self.x.clone());
        let y_bins = y_bins.start.min(self.ny())..y_bins.end.min(self.ny());
        for ix in 0..self.nx() {
            let (mut content, mut variance) = (0.0, 0.0);
            for iy in y_bins.clone() {
                content += self.content(ix, iy);
                variance += self.variance(ix, iy);
            }
            projection.set_content(ix, content);
            projection.set_variance(ix, variance);
        }
        projection
    }

    /// Project onto the y-axis, summing the x-bins in `x_bins`.
    pub fn projection_y(&self, x_bins: Range<usize>) -> Histogram1D {
        let mut projection = Histogram1D::new(self.y.clone());
        let x_bins = x_bins.start.min(self.nx())..x_bins.end.min(self.nx());
        for iy in 0..self.ny() {
            let (mut content, mut variance) = (0.0, 0.0);
            for ix in x_bins.clone() {
                content += self.content(ix, iy);
                variance += self.variance(ix, iy);
            }
            projection.set_content(iy, content);
            projection.set_variance(iy, variance);
        }
        projection
    }

    /// Swap the two axes.
    pub fn transpose(&self) -> Self {
        let mut transposed = Self::new(self.y.clone(), self.x.clone());
        for ix in 0..self.nx() {
            for iy in 0..self.ny() {
                transposed.set_content(iy, ix, self.content(ix, iy));
                transposed.set_variance(iy, ix, self.variance(ix, iy));
            }
        }
        transposed
    }

    /// The contents as a matrix with rows along x and columns along y.
    pub fn to_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.nx(), self.ny(), |ix, iy| self.content(ix, iy))
    }
}

/// A weighted profile: per bin, the weighted mean and spread of the values filled into it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    binning: Binning,
    sum_w: Vec<f64>,
    sum_wy: Vec<f64>,
    sum_wy2: Vec<f64>,
    entries: Vec<usize>,
}

impl Profile {
    pub fn new(binning: Binning) -> Self {
        let n = binning.n_bins();
        Self {
            binning,
            sum_w: vec![0.0; n],
            sum_wy: vec![0.0; n],
            sum_wy2: vec![0.0; n],
            entries: vec![0; n],
        }
    }

    pub fn binning(&self) -> &Binning {
        &self.binning
    }

    /// Record `y` with weight `w` in the bin containing `x`.
    pub fn fill(&mut self, x: f64, y: f64, w: f64) {
        if let Some(bin) = self.binning.find_bin(x) {
            self.sum_w[bin] += w;
            self.sum_wy[bin] += w * y;
            self.sum_wy2[bin] += w * y * y;
            self.entries[bin] += 1;
        }
    }

    pub fn entries(&self, bin: usize) -> usize {
        self.entries[bin]
    }

    /// Weighted mean of the values in `bin`, or [`None`] if the bin is empty.
    pub fn mean(&self, bin: usize) -> Option<f64> {
        (self.sum_w[bin] > 0.0).then(|| self.sum_wy[bin] / self.sum_w[bin])
    }

    /// Weighted standard deviation of the values in `bin`.
    pub fn spread(&self, bin: usize) -> Option<f64> {
        let mean = self.mean(bin)?;
        let variance = self.sum_wy2[bin] / self.sum_w[bin] - mean * mean;
        Some(variance.max(0.0).sqrt())
    }
}
