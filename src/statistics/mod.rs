//! # Chunked band statistics
//!
//! Means and the band × band estimator matrix are built from fixed-size block
//! reductions. Bands are streamed from the sources one [`RowBlock`] at a time
//! and each block is reduced to a handful of sums ([`Moments`]) before the
//! next is read, so a mean unit holds one block and a pair unit holds two,
//! whatever the number of pixels.
//!
//! Values are centred on the band mean before they are squared or multiplied,
//! which keeps the co-moments accurate when the means are large compared to the
//! spread. Pixels are stored as `f32`; every accumulator is `f64`.

use log::info;
use ndarray::{Array1, Array2};
use serde::Serialize;
use std::time::Instant;

use crate::config::Estimator;
use crate::error::{PcaError, Result, Stage};
use crate::mask::{BandStack, NodataMask, RowBlock};
use crate::scheduler::{TaskScheduler, Unit};

/// Variances at or below this fraction of `mean² + 1` count as zero.
const ZERO_VARIANCE_TOLERANCE: f64 = 1e-24;

/// Sums of one block of paired, centred values.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Moments {
    pub n: usize,
    pub sum_x: f64,
    pub sum_y: f64,
    pub sum_xx: f64,
    pub sum_yy: f64,
    pub sum_xy: f64,
}

impl Moments {
    /// Reduces the pixels of one block not marked in `invalid`; `x` and `y`
    /// are centred on `mean_x` / `mean_y`.
    pub fn from_block(
        x: &[f32],
        y: &[f32],
        invalid: &[bool],
        mean_x: f64,
        mean_y: f64,
    ) -> Self {
        debug_assert_eq!(x.len(), y.len());
        debug_assert_eq!(x.len(), invalid.len());
        let mut m = Moments::default();
        for ((&a, &b), &bad) in x.iter().zip(y).zip(invalid) {
            if bad {
                continue;
            }
            let dx = a as f64 - mean_x;
            let dy = b as f64 - mean_y;
            m.n += 1;
            m.sum_x += dx;
            m.sum_y += dy;
            m.sum_xx += dx * dx;
            m.sum_yy += dy * dy;
            m.sum_xy += dx * dy;
        }
        m
    }

    pub fn merge(self, other: Moments) -> Moments {
        Moments {
            n: self.n + other.n,
            sum_x: self.sum_x + other.sum_x,
            sum_y: self.sum_y + other.sum_y,
            sum_xx: self.sum_xx + other.sum_xx,
            sum_yy: self.sum_yy + other.sum_yy,
            sum_xy: self.sum_xy + other.sum_xy,
        }
    }

    // The `sum_x * sum_y / n` terms remove what is left of the mean after centring.
    fn co_moment_xy(&self) -> f64 {
        self.sum_xy - self.sum_x * self.sum_y / self.n as f64
    }

    // NaN passes through so unmasked NaN pixels are caught downstream.
    fn co_moment_xx(&self) -> f64 {
        non_negative(self.sum_xx - self.sum_x * self.sum_x / self.n as f64)
    }

    fn co_moment_yy(&self) -> f64 {
        non_negative(self.sum_yy - self.sum_y * self.sum_y / self.n as f64)
    }

    /// Population variance of `x`.
    pub fn variance_x(&self) -> f64 {
        self.co_moment_xx() / self.n as f64
    }

    /// Population covariance (divisor `n`).
    pub fn covariance(&self) -> f64 {
        self.co_moment_xy() / self.n as f64
    }

    /// Pearson correlation, `None` when either side has no spread.
    pub fn correlation(&self) -> Option<f64> {
        let denom = (self.co_moment_xx() * self.co_moment_yy()).sqrt();
        if denom == 0.0 || !denom.is_finite() {
            return None;
        }
        Some((self.co_moment_xy() / denom).clamp(-1.0, 1.0))
    }
}

fn non_negative(v: f64) -> f64 {
    if v < 0.0 {
        0.0
    } else {
        v
    }
}

/// Mean of stacked band `band` over the pixels `mask` leaves valid.
pub fn band_mean(
    stack: &BandStack<'_>,
    mask: &NodataMask,
    band: usize,
    blocks: &[RowBlock],
) -> Result<f64> {
    let width = stack.dimensions().width;
    let mut n = 0usize;
    let mut total = 0.0f64;
    for &block in blocks {
        let values = stack.read_block(band, block)?;
        let mut block_sum = 0.0f64;
        for (&v, &bad) in values.iter().zip(mask.window(block, width)) {
            if !bad {
                n += 1;
                block_sum += v as f64;
            }
        }
        total += block_sum;
    }
    if n == 0 {
        return Err(PcaError::SingularInput("no valid pixels to average".into()));
    }
    Ok(total / n as f64)
}

/// Co-moments of stacked bands `i` and `j`, reduced block by block.
pub fn pair_moments(
    stack: &BandStack<'_>,
    mask: &NodataMask,
    (i, j): (usize, usize),
    means: &Array1<f64>,
    blocks: &[RowBlock],
) -> Result<Moments> {
    let width = stack.dimensions().width;
    let mut moments = Moments::default();
    for &block in blocks {
        let x = stack.read_block(i, block)?;
        let y = if i == j {
            None
        } else {
            Some(stack.read_block(j, block)?)
        };
        let y = y.as_deref().unwrap_or(&x);
        let invalid = mask.window(block, width);
        moments = moments.merge(Moments::from_block(&x, y, invalid, means[i], means[j]));
    }
    Ok(moments)
}

/// Per-band means and the estimator matrix they centre.
#[derive(Debug, Clone, Serialize)]
pub struct BandStatistics {
    pub estimator: Estimator,
    pub valid_pixels: usize,
    pub means: Array1<f64>,
    pub matrix: Array2<f64>,
}

/// Computes every band mean, one unit per band.
pub fn band_means(
    stack: &BandStack<'_>,
    mask: &NodataMask,
    block_size: usize,
    scheduler: &TaskScheduler,
) -> Result<Array1<f64>> {
    let blocks = stack.row_blocks(block_size);
    let means = scheduler.run(Stage::Estimator, &stack.band_units(), |unit| {
        let Unit::Band(band) = *unit else {
            unreachable!("mean units are bands")
        };
        band_mean(stack, mask, band, &blocks)
    })?;
    Ok(Array1::from(means))
}

fn pair_value(
    moments: &Moments,
    mean_i: f64,
    estimator: Estimator,
    (i, j): (usize, usize),
) -> Result<f64> {
    if moments.n == 0 {
        return Err(PcaError::SingularInput("no valid pixels".into()));
    }

    let value = match estimator {
        Estimator::Covariance => moments.covariance(),
        Estimator::Correlation if i == j => {
            let variance = moments.variance_x();
            if !variance.is_finite() {
                variance
            } else if variance <= ZERO_VARIANCE_TOLERANCE * (mean_i * mean_i + 1.0) {
                return Err(PcaError::SingularInput(format!(
                    "band {} has zero variance, correlation is undefined",
                    i + 1
                )));
            } else {
                1.0
            }
        }
        Estimator::Correlation => moments.correlation().ok_or_else(|| {
            PcaError::SingularInput(format!(
                "bands {} and {} have no spread, correlation is undefined",
                i + 1,
                j + 1
            ))
        })?,
    };

    if !value.is_finite() {
        return Err(PcaError::SingularInput(format!(
            "non-finite {} between bands {} and {}",
            estimator,
            i + 1,
            j + 1
        )));
    }
    Ok(value)
}

/// Builds the symmetric estimator matrix from the upper triangle, one unit
/// per pair.
///
/// Diagonal cells run first so a zero-variance band is reported as such before
/// any off-diagonal pair is attempted.
pub fn estimator_matrix(
    stack: &BandStack<'_>,
    mask: &NodataMask,
    means: &Array1<f64>,
    estimator: Estimator,
    block_size: usize,
    scheduler: &TaskScheduler,
) -> Result<Array2<f64>> {
    let n = stack.band_count();
    let blocks = stack.row_blocks(block_size);
    let diagonal: Vec<Unit> = (0..n).map(|i| Unit::Pair(i, i)).collect();
    let off_diagonal: Vec<Unit> = (0..n)
        .flat_map(|i| ((i + 1)..n).map(move |j| Unit::Pair(i, j)))
        .collect();

    let cell = |unit: &Unit| {
        let Unit::Pair(i, j) = *unit else {
            unreachable!("matrix units are pairs")
        };
        let moments = pair_moments(stack, mask, (i, j), means, &blocks)?;
        pair_value(&moments, means[i], estimator, (i, j))
    };

    let diagonal_values = scheduler.run(Stage::Estimator, &diagonal, cell)?;
    let off_diagonal_values = scheduler.run(Stage::Estimator, &off_diagonal, cell)?;

    let mut matrix = Array2::<f64>::zeros((n, n));
    for (i, value) in diagonal_values.into_iter().enumerate() {
        matrix[[i, i]] = value;
    }
    for (unit, value) in off_diagonal.iter().zip(off_diagonal_values) {
        if let Unit::Pair(i, j) = *unit {
            matrix[[i, j]] = value;
            matrix[[j, i]] = value;
        }
    }
    Ok(matrix)
}

/// Means, then (after every mean is known) the estimator matrix.
pub fn estimate(
    stack: &BandStack<'_>,
    mask: &NodataMask,
    estimator: Estimator,
    block_size: usize,
    scheduler: &TaskScheduler,
) -> Result<BandStatistics> {
    let start = Instant::now();
    let means = band_means(stack, mask, block_size, scheduler)?;
    let matrix = estimator_matrix(stack, mask, &means, estimator, block_size, scheduler)?;
    info!(
        "{} matrix for {} bands over {} pixels in {:?}",
        estimator,
        stack.band_count(),
        mask.valid_count(),
        start.elapsed()
    );
    Ok(BandStatistics {
        estimator,
        valid_pixels: mask.valid_count(),
        means,
        matrix,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::raster::{Dimensions, MemoryRaster};
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn raster(w: usize, h: usize, bands: Vec<Vec<f32>>) -> MemoryRaster {
        MemoryRaster::new("test", Dimensions::new(w, h), bands).unwrap()
    }

    fn random_bands(n_bands: usize, pixels: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let base: Vec<f32> = (0..pixels).map(|_| rng.random_range(0.0..100.0)).collect();
        (0..n_bands)
            .map(|b| {
                base.iter()
                    .map(|&v| v * (b as f32 + 1.0) + rng.random_range(-5.0..5.0))
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_mean_independent_of_block_size() {
        let values: Vec<f32> = (1..=1001).map(|v| v as f32).collect();
        let source = raster(7, 143, vec![values]);
        let stack = BandStack::new(&source, None).unwrap();
        let mask = NodataMask::none(1001);
        for block_size in [1, 7, 100, 5000] {
            let mean = band_mean(&stack, &mask, 0, &stack.row_blocks(block_size)).unwrap();
            assert_abs_diff_eq!(mean, 501.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_masked_pixels_are_skipped() {
        let source = raster(3, 1, vec![vec![1.0, 99.0, 3.0], vec![2.0, 50.0, 6.0]]);
        let stack = BandStack::new(&source, None).unwrap();
        let mask = NodataMask::from_invalid(vec![false, true, false], Some(99.0));
        let scheduler = TaskScheduler::new(2).unwrap();

        let stats = estimate(&stack, &mask, Estimator::Covariance, 1, &scheduler).unwrap();
        assert_eq!(stats.valid_pixels, 2);
        assert_abs_diff_eq!(stats.means[0], 2.0);
        assert_abs_diff_eq!(stats.means[1], 4.0);
        assert_abs_diff_eq!(stats.matrix[[0, 1]], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_merged_blocks_match_single_pass() {
        let bands = random_bands(2, 997, 7);
        let valid = vec![false; 997];
        let whole = Moments::from_block(&bands[0], &bands[1], &valid, 50.0, 100.0);
        let blocked = bands[0]
            .chunks(64)
            .zip(bands[1].chunks(64))
            .zip(valid.chunks(64))
            .map(|((x, y), m)| Moments::from_block(x, y, m, 50.0, 100.0))
            .fold(Moments::default(), Moments::merge);
        assert_eq!(whole.n, blocked.n);
        assert_abs_diff_eq!(whole.covariance(), blocked.covariance(), epsilon = 1e-8);
        assert_abs_diff_eq!(
            whole.correlation().unwrap(),
            blocked.correlation().unwrap(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_covariance_scenario() {
        let source = raster(2, 2, vec![vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0, 8.0]]);
        let stack = BandStack::new(&source, None).unwrap();
        let scheduler = TaskScheduler::new(2).unwrap();
        let stats =
            estimate(&stack, &NodataMask::none(4), Estimator::Covariance, 3, &scheduler).unwrap();

        assert_abs_diff_eq!(stats.means[0], 2.5);
        assert_abs_diff_eq!(stats.means[1], 6.5);
        for v in stats.matrix.iter() {
            assert_abs_diff_eq!(*v, 1.25, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_matrix_is_symmetric_with_unit_diagonal() {
        let source = raster(40, 50, random_bands(5, 2_000, 11));
        let stack = BandStack::new(&source, None).unwrap();
        let scheduler = TaskScheduler::new(3).unwrap();
        let stats =
            estimate(&stack, &NodataMask::none(2_000), Estimator::Correlation, 128, &scheduler)
                .unwrap();

        for i in 0..5 {
            assert_eq!(stats.matrix[[i, i]], 1.0);
            for j in 0..5 {
                assert_eq!(stats.matrix[[i, j]], stats.matrix[[j, i]]);
                assert!(stats.matrix[[i, j]].abs() <= 1.0);
            }
        }
    }

    #[test]
    fn test_matrix_independent_of_block_size() {
        let source = raster(30, 20, random_bands(3, 600, 17));
        let stack = BandStack::new(&source, None).unwrap();
        let mask = NodataMask::none(600);
        let scheduler = TaskScheduler::new(2).unwrap();

        let whole = estimate(&stack, &mask, Estimator::Covariance, 1_000_000, &scheduler).unwrap();
        let blocked = estimate(&stack, &mask, Estimator::Covariance, 45, &scheduler).unwrap();
        for (a, b) in whole.matrix.iter().zip(blocked.matrix.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-9 * a.abs().max(1.0));
        }
    }

    #[test]
    fn test_correlation_is_shift_invariant() {
        // large offsets must not eat the precision of the co-moments
        let bands = random_bands(2, 500, 3);
        let shifted: Vec<Vec<f32>> = bands
            .iter()
            .map(|b| b.iter().map(|&v| v + 10_000.0).collect())
            .collect();
        let (plain, shifted) = (raster(25, 20, bands), raster(25, 20, shifted));
        let scheduler = TaskScheduler::new(1).unwrap();
        let mask = NodataMask::none(500);

        let stack = BandStack::new(&plain, None).unwrap();
        let a = estimate(&stack, &mask, Estimator::Correlation, 50, &scheduler).unwrap();
        let stack = BandStack::new(&shifted, None).unwrap();
        let b = estimate(&stack, &mask, Estimator::Correlation, 50, &scheduler).unwrap();
        assert_abs_diff_eq!(a.matrix[[0, 1]], b.matrix[[0, 1]], epsilon = 1e-3);
    }

    #[test]
    fn test_zero_variance_is_singular_under_correlation() {
        let source = raster(3, 2, vec![vec![3.0; 6], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]]);
        let stack = BandStack::new(&source, None).unwrap();
        let mask = NodataMask::none(6);
        let scheduler = TaskScheduler::new(2).unwrap();

        let err = estimate(&stack, &mask, Estimator::Correlation, 4, &scheduler).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SingularInput);
        assert_eq!(err.stage(), Some(Stage::Estimator));
        assert_eq!(err.unit(), Some("pair (1, 1)"));

        // covariance is still defined
        let stats = estimate(&stack, &mask, Estimator::Covariance, 4, &scheduler).unwrap();
        assert_eq!(stats.matrix[[0, 0]], 0.0);
        assert_eq!(stats.matrix[[0, 1]], 0.0);
    }

    #[test]
    fn test_no_valid_pixels_is_singular() {
        let source = raster(2, 1, vec![vec![7.0, 7.0], vec![1.0, 2.0]]);
        let stack = BandStack::new(&source, None).unwrap();
        let mask = NodataMask::from_invalid(vec![true, true], Some(7.0));
        let scheduler = TaskScheduler::new(1).unwrap();
        let err = estimate(&stack, &mask, Estimator::Covariance, 4, &scheduler).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SingularInput);
    }

    #[test]
    fn test_unmasked_nan_is_reported() {
        let source = raster(3, 1, vec![vec![1.0, f32::NAN, 3.0]]);
        let stack = BandStack::new(&source, None).unwrap();
        let scheduler = TaskScheduler::new(1).unwrap();
        for estimator in [Estimator::Covariance, Estimator::Correlation] {
            let err = estimate(&stack, &NodataMask::none(3), estimator, 2, &scheduler).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::SingularInput);
        }
    }
}
