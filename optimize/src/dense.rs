use nalgebra::{DMatrix, DVector};

use crate::sparse::{LinearSolver, SparseMatrix};
use crate::{check_finite, check_system, Error, Result};

/// Dense Cholesky factorization through nalgebra.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseCholeskySolver;

impl DenseCholeskySolver {
    /// Solve a dense symmetric system; the matrix is symmetrized first.
    pub fn solve_dense(&self, a: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>> {
        if a.nrows() != a.ncols() || a.nrows() != b.len() {
            return Err(Error::DimensionMismatch(format!(
                "{}x{} matrix with rhs of length {}",
                a.nrows(),
                a.ncols(),
                b.len()
            )));
        }
        if b.is_empty() {
            return Ok(DVector::zeros(0));
        }

        let symmetric = (a + a.transpose()) * 0.5;
        let cholesky = symmetric.cholesky().ok_or(Error::NotPositiveDefinite)?;
        check_finite(cholesky.solve(b))
    }
}

impl LinearSolver for DenseCholeskySolver {
    fn solve(&self, a: &SparseMatrix, b: &DVector<f64>) -> Result<DVector<f64>> {
        check_system(a, b)?;
        self.solve_dense(&a.to_dense(), b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_solve() {
        let a = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 2.0]);
        let b = DVector::from_vec(vec![2.0, 4.0]);
        let x = DenseCholeskySolver.solve_dense(&a, &b).expect("solve failed");
        assert!((x[0] - 1.0).abs() < 1e-12);
        assert!((x[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_asymmetry_is_removed() {
        // Off-diagonal 1.0 vs 1.0 + 1e-12 must factorize as the symmetric mean.
        let a = DMatrix::from_row_slice(2, 2, &[3.0, 1.0, 1.0 + 1e-12, 3.0]);
        let b = DVector::from_vec(vec![4.0, 4.0]);
        let x = DenseCholeskySolver.solve_dense(&a, &b).unwrap();
        assert!((x[0] - 1.0).abs() < 1e-9);
        assert!((x[1] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_indefinite_fails() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        let b = DVector::from_vec(vec![1.0, 1.0]);
        assert!(matches!(
            DenseCholeskySolver.solve_dense(&a, &b),
            Err(Error::NotPositiveDefinite)
        ));
    }
}
