use tracing::debug;

use crate::histogram::{Binning, Histogram1D, Histogram2D};

/// Spectrum shape used to average true-axis columns which are merged by [`rebin2d`]. It peaks at
/// low momentum and falls steeply, which approximates a jet spectrum.
fn merge_weight(x: f64) -> f64 {
    x * (1.0 + x / (8.0 * 0.9)).powi(-8)
}

/// Move the content of every source bin into the target bin which contains the source bin's
/// center.
///
/// This is not an area-weighted rebinning: source bins which straddle a target edge are assigned
/// wholesale. Content whose center falls outside of `target` is dropped. Errors are not
/// propagated; every bin of the result carries the counting error $`\sqrt{|c|}`$.
pub fn rebin1d(histogram: &Histogram1D, target: &Binning) -> Histogram1D {
    let mut rebinned = Histogram1D::new(target.clone());
    for (bin, center) in histogram.binning().centers().enumerate() {
        rebinned.fill(center, histogram.content(bin));
    }
    for bin in 0..rebinned.n_bins() {
        let content = rebinned.content(bin);
        rebinned.set_variance(bin, content.abs());
    }
    rebinned
}

/// Redistribute a response matrix onto new true (x) and reconstructed (y) binnings.
///
/// Every source cell is split across the destination cells it overlaps. Along the reconstructed
/// axis the overlapping fractions are summed, so a normalized true column stays normalized.
/// Along the true axis, source columns which end up in the same destination column are averaged
/// with a falling-spectrum weight evaluated at the source column center. If those weights do not
/// sum to a positive value the columns are averaged by overlap alone.
pub fn rebin2d(
    histogram: &Histogram2D,
    true_binning: &Binning,
    rec_binning: &Binning,
) -> Histogram2D {
    let source_x = histogram.x_binning();
    let source_y = histogram.y_binning();
    let mut rebinned = Histogram2D::new(true_binning.clone(), rec_binning.clone());

    // fraction of each source rec bin which lands in each destination rec bin
    let rec_fractions: Vec<Vec<f64>> = (0..rec_binning.n_bins())
        .map(|dest| {
            (0..source_y.n_bins())
                .map(|iy| {
                    rec_binning.overlap_fraction(dest, source_y.low_edge(iy), source_y.up_edge(iy))
                })
                .collect()
        })
        .collect();

    for dest_x in 0..true_binning.n_bins() {
        let overlaps: Vec<(usize, f64)> = (0..source_x.n_bins())
            .filter_map(|ix| {
                let fraction = true_binning.overlap_fraction(
                    dest_x,
                    source_x.low_edge(ix),
                    source_x.up_edge(ix),
                );
                (fraction > 0.0).then_some((ix, fraction))
            })
            .collect();
        if overlaps.is_empty() {
            continue;
        }
        let mut weights: Vec<f64> = overlaps
            .iter()
            .map(|&(ix, fraction)| fraction * merge_weight(source_x.center(ix)))
            .collect();
        let mut total: f64 = weights.iter().sum();
        if !(total > 0.0) {
            debug!(
                bin = dest_x,
                "merge weights vanish, falling back to overlap weights"
            );
            weights = overlaps.iter().map(|&(_, fraction)| fraction).collect();
            total = weights.iter().sum();
        }
        for ((ix, _), weight) in overlaps.iter().zip(weights.iter()) {
            let w = weight / total;
            for (dest_y, fractions) in rec_fractions.iter().enumerate() {
                let (mut content, mut variance) = (0.0, 0.0);
                for (iy, f) in fractions.iter().enumerate() {
                    if *f > 0.0 {
                        content += histogram.content(*ix, iy) * f;
                        variance += histogram.variance(*ix, iy) * f * f;
                    }
                }
                rebinned.accumulate(dest_x, dest_y, w * content, w * w * variance);
            }
        }
    }
    rebinned
}

/// Normalize every true column (fixed x-bin) of `matrix` to unit sum, in place.
///
/// Variances are divided by the square of the column sum. Columns whose sum is not positive are
/// left untouched.
pub fn normalize_columns(matrix: &mut Histogram2D) {
    for ix in 0..matrix.nx() {
        let sum = matrix.column_sum(ix);
        if sum <= 0.0 {
            continue;
        }
        for iy in 0..matrix.ny() {
            let content = matrix.content(ix, iy);
            let variance = matrix.variance(ix, iy);
            matrix.set_content(ix, iy, content / sum);
            matrix.set_variance(ix, iy, variance / (sum * sum));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rebin1d_nearest_bin() {
        let source = Histogram1D::from_contents(
            Binning::uniform(6, (0.0, 6.0)).unwrap(),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        )
        .unwrap();
        let target = Binning::new(vec![1.0, 3.0, 4.8]).unwrap();
        let rebinned = rebin1d(&source, &target);
        // centers 1.5, 2.5 -> bin 0; 3.5, 4.5 -> bin 1; 0.5 and 5.5 dropped
        assert_relative_eq!(rebinned.content(0), 5.0);
        assert_relative_eq!(rebinned.content(1), 9.0);
        assert_relative_eq!(rebinned.error(1), 3.0);
        assert_relative_eq!(rebinned.integral(), 14.0);
    }

    #[test]
    fn test_normalize_columns() {
        let x = Binning::uniform(3, (0.0, 3.0)).unwrap();
        let y = Binning::uniform(4, (0.0, 4.0)).unwrap();
        let mut m = Histogram2D::new(x, y);
        let values = [[1.0, 2.0, 3.0, 4.0], [0.0, 0.0, 0.0, 0.0], [0.3, 0.0, 7.1, 1e-3]];
        for (ix, row) in values.iter().enumerate() {
            for (iy, v) in row.iter().enumerate() {
                m.set_content(ix, iy, *v);
                m.set_variance(ix, iy, *v);
            }
        }
        normalize_columns(&mut m);
        assert_relative_eq!(m.column_sum(0), 1.0, epsilon = 1e-9);
        assert_relative_eq!(m.column_sum(2), 1.0, epsilon = 1e-9);
        for iy in 0..4 {
            assert_eq!(m.content(1, iy), 0.0);
        }
        assert_relative_eq!(m.variance(0, 3), 4.0 / 100.0);
    }

    #[test]
    fn test_rebin2d_keeps_column_normalization() {
        let fine = Binning::uniform(8, (20.0, 100.0)).unwrap();
        let mut m = Histogram2D::new(fine.clone(), fine.clone());
        for ix in 0..8 {
            for iy in 0..8 {
                let d = ix as f64 - iy as f64;
                m.set_content(ix, iy, (-0.5 * d * d).exp());
            }
        }
        normalize_columns(&mut m);
        let coarse_true = Binning::new(vec![20.0, 40.0, 60.0, 100.0]).unwrap();
        let coarse_rec = Binning::new(vec![0.0, 50.0, 100.0, 150.0]).unwrap();
        let rebinned = rebin2d(&m, &coarse_true, &coarse_rec);
        for ix in 0..3 {
            assert_relative_eq!(rebinned.column_sum(ix), 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_rebin2d_identity_binning() {
        let b = Binning::uniform(3, (0.0, 3.0)).unwrap();
        let mut m = Histogram2D::new(b.clone(), b.clone());
        m.set_content(0, 1, 2.0);
        m.set_content(2, 2, 5.0);
        let rebinned = rebin2d(&m, &b, &b);
        assert_eq!(rebinned, m);
    }
}
