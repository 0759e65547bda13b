//! # Eigen-decomposition of the estimator matrix
//!
//! The estimator matrix is real and symmetric, so it is factored with
//! nalgebra's symmetric eigensolver. Components come back ordered by
//! descending eigenvalue. Equal eigenvalues keep the solver's own order, which
//! is deterministic for identical input.

use log::debug;
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{s, Array1, Array2, ArrayView1};
use serde::Serialize;

use crate::error::{PcaError, Result};

const MAX_ITERATIONS: usize = 10_000;
const SYMMETRY_TOLERANCE: f64 = 1e-10;

/// Leading eigenpairs of an estimator matrix.
#[derive(Debug, Clone, Serialize)]
pub struct EigenBasis {
    /// Every eigenvalue, descending.
    eigenvalues: Array1<f64>,
    /// Retained eigenvectors, one per row, unit length.
    components: Array2<f64>,
    explained_variance_ratio: Array1<f64>,
}

impl EigenBasis {
    /// Factors `matrix` and keeps the first `n_components` eigenpairs.
    ///
    /// Each eigenvector is signed so that its largest-magnitude entry is
    /// positive (the first such entry on ties).
    pub fn decompose(matrix: &Array2<f64>, n_components: usize) -> Result<Self> {
        let (rows, cols) = matrix.dim();
        if rows != cols || rows == 0 {
            return Err(PcaError::invalid_argument(
                "matrix",
                format!("{rows}x{cols}"),
                "must be square and non-empty",
            ));
        }
        if n_components == 0 || n_components > rows {
            return Err(PcaError::invalid_argument(
                "n_components",
                n_components,
                format!("must be between 1 and the band count ({rows})"),
            ));
        }
        check_symmetric(matrix)?;

        let dm = DMatrix::from_fn(rows, cols, |i, j| matrix[[i, j]]);
        let eigen = SymmetricEigen::try_new(dm, f64::EPSILON, MAX_ITERATIONS).ok_or_else(|| {
            PcaError::SingularInput("symmetric eigensolver did not converge".into())
        })?;

        let mut order: Vec<usize> = (0..rows).collect();
        // stable: equal eigenvalues keep solver order
        order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

        let eigenvalues: Array1<f64> = order.iter().map(|&i| eigen.eigenvalues[i]).collect();
        let mut components = Array2::<f64>::zeros((n_components, rows));
        for (k, &idx) in order.iter().take(n_components).enumerate() {
            let column = eigen.eigenvectors.column(idx);
            let sign = orientation(column.iter().copied());
            for j in 0..rows {
                components[[k, j]] = sign * column[j];
            }
        }

        let total: f64 = eigenvalues.iter().filter(|&&v| v > 0.0).sum();
        let explained_variance_ratio = eigenvalues
            .slice(s![..n_components])
            .mapv(|v| if total > 0.0 { v.max(0.0) / total } else { 0.0 });

        debug!(
            "eigenvalues {:?}, keeping {} components",
            eigenvalues.as_slice(),
            n_components
        );

        Ok(EigenBasis {
            eigenvalues,
            components,
            explained_variance_ratio,
        })
    }

    pub fn eigenvalues(&self) -> &Array1<f64> {
        &self.eigenvalues
    }

    pub fn components(&self) -> &Array2<f64> {
        &self.components
    }

    /// Eigenvector of component `k` (0-based).
    pub fn component(&self, k: usize) -> ArrayView1<'_, f64> {
        self.components.row(k)
    }

    pub fn n_components(&self) -> usize {
        self.components.nrows()
    }

    pub fn explained_variance_ratio(&self) -> &Array1<f64> {
        &self.explained_variance_ratio
    }
}

fn check_symmetric(matrix: &Array2<f64>) -> Result<()> {
    let n = matrix.nrows();
    for i in 0..n {
        for j in i..n {
            let (a, b) = (matrix[[i, j]], matrix[[j, i]]);
            if !a.is_finite() {
                return Err(PcaError::SingularInput(format!(
                    "matrix entry ({}, {}) is not finite",
                    i + 1,
                    j + 1
                )));
            }
            if (a - b).abs() > SYMMETRY_TOLERANCE * a.abs().max(b.abs()).max(1.0) {
                return Err(PcaError::invalid_argument(
                    "matrix",
                    format!("({}, {})", i + 1, j + 1),
                    "not symmetric",
                ));
            }
        }
    }
    Ok(())
}

/// `-1.0` when the largest-magnitude entry is negative, else `1.0`.
fn orientation(values: impl Iterator<Item = f64>) -> f64 {
    let mut best = 0.0f64;
    for v in values {
        if v.abs() > best.abs() {
            best = v;
        }
    }
    if best < 0.0 {
        -1.0
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_spd(n: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let a = Array2::from_shape_fn((n, n), |_| rng.random_range(-1.0..1.0));
        a.t().dot(&a) + Array2::<f64>::eye(n) * 0.1
    }

    #[test]
    fn test_perfectly_correlated_pair() {
        let m = array![[1.25, 1.25], [1.25, 1.25]];
        let basis = EigenBasis::decompose(&m, 1).unwrap();

        assert_abs_diff_eq!(basis.eigenvalues()[0], 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(basis.eigenvalues()[1], 0.0, epsilon = 1e-12);
        let inv_sqrt2 = std::f64::consts::FRAC_1_SQRT_2;
        assert_abs_diff_eq!(basis.component(0)[0], inv_sqrt2, epsilon = 1e-12);
        assert_abs_diff_eq!(basis.component(0)[1], inv_sqrt2, epsilon = 1e-12);
        assert_abs_diff_eq!(basis.explained_variance_ratio()[0], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_eigenvalues_non_increasing() {
        let m = random_spd(7, 1);
        let basis = EigenBasis::decompose(&m, 7).unwrap();
        for w in basis.eigenvalues().windows(2) {
            assert!(w[0] >= w[1]);
        }
    }

    #[test]
    fn test_eigenvectors_orthonormal() {
        let m = random_spd(6, 2);
        let basis = EigenBasis::decompose(&m, 6).unwrap();
        let v = basis.components();
        let gram = v.dot(&v.t());
        for i in 0..6 {
            for j in 0..6 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(gram[[i, j]], expected, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_eigenvectors_satisfy_definition() {
        let m = random_spd(5, 3);
        let basis = EigenBasis::decompose(&m, 3).unwrap();
        for k in 0..3 {
            let v = basis.component(k);
            let mv = m.dot(&v);
            for j in 0..5 {
                assert_abs_diff_eq!(mv[j], basis.eigenvalues()[k] * v[j], epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_sign_convention() {
        let m = random_spd(4, 4);
        let basis = EigenBasis::decompose(&m, 4).unwrap();
        for k in 0..4 {
            let v = basis.component(k);
            let largest = v.iter().copied().fold(0.0f64, |acc, x| {
                if x.abs() > acc.abs() {
                    x
                } else {
                    acc
                }
            });
            assert!(largest > 0.0);
        }
    }

    #[test]
    fn test_repeated_eigenvalues_are_deterministic() {
        let m = Array2::<f64>::eye(4) * 2.0;
        let a = EigenBasis::decompose(&m, 4).unwrap();
        let b = EigenBasis::decompose(&m, 4).unwrap();
        assert_eq!(a.components(), b.components());
        assert_eq!(a.eigenvalues(), b.eigenvalues());
    }

    #[test]
    fn test_truncation() {
        let m = random_spd(5, 5);
        let basis = EigenBasis::decompose(&m, 2).unwrap();
        assert_eq!(basis.n_components(), 2);
        assert_eq!(basis.components().dim(), (2, 5));
        assert_eq!(basis.eigenvalues().len(), 5);
        assert_eq!(basis.explained_variance_ratio().len(), 2);
    }

    #[test]
    fn test_component_count_out_of_range() {
        let m = random_spd(3, 6);
        assert_eq!(
            EigenBasis::decompose(&m, 0).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            EigenBasis::decompose(&m, 4).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_asymmetric_matrix_rejected() {
        let m = array![[1.0, 0.5], [0.2, 1.0]];
        assert_eq!(
            EigenBasis::decompose(&m, 1).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }
}
