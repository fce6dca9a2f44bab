use faer::sparse::linalg::solvers::{Llt, SymbolicLlt};
pub use faer::sparse::Triplet;
use faer::sparse::SparseColMat;
use faer::{linalg::solvers::Solve, Mat, Side};
use nalgebra::{DMatrix, DVector, SMatrix};

use crate::{check_finite, check_system, Error, Result};

/// Sparse matrix in triplet form using faer as factorization backend.
///
/// Entries with the same `(row, col)` are summed on conversion.
#[derive(Debug, Clone)]
pub struct SparseMatrix {
    pub rows: usize,
    pub cols: usize,
    pub triplets: Vec<Triplet<usize, usize, f64>>,
}

impl SparseMatrix {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            triplets: Vec::new(),
        }
    }

    pub fn with_capacity(rows: usize, cols: usize, nnz: usize) -> Self {
        Self {
            rows,
            cols,
            triplets: Vec::with_capacity(nnz),
        }
    }

    pub fn add(&mut self, row: usize, col: usize, value: f64) {
        self.triplets.push(Triplet::new(row, col, value));
    }

    /// Add a dense block with its top-left corner at `(row, col)`.
    pub fn add_block<const R: usize, const C: usize>(
        &mut self,
        row: usize,
        col: usize,
        block: &SMatrix<f64, R, C>,
    ) {
        for c in 0..C {
            for r in 0..R {
                self.triplets.push(Triplet::new(row + r, col + c, block[(r, c)]));
            }
        }
    }

    pub fn nnz(&self) -> usize {
        self.triplets.len()
    }

    /// Convert to faer `SparseColMat`.
    pub fn to_faer(&self) -> Result<SparseColMat<usize, f64>> {
        SparseColMat::try_new_from_triplets(self.rows, self.cols, &self.triplets)
            .map_err(|e| Error::SparseMatrixCreation(format!("{:?}", e)))
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(self.rows, self.cols);
        for t in &self.triplets {
            dense[(t.row, t.col)] += t.val;
        }
        dense
    }

    pub fn mul_vec(&self, x: &DVector<f64>) -> DVector<f64> {
        let mut y = DVector::zeros(self.rows);
        for t in &self.triplets {
            y[t.row] += t.val * x[t.col];
        }
        y
    }

    /// Square diagonal block of size `n` starting at `start` (clipped to the matrix).
    pub fn diagonal_block(&self, start: usize, n: usize) -> DMatrix<f64> {
        let n = n.min(self.rows.saturating_sub(start));
        let mut block = DMatrix::zeros(n, n);
        for t in &self.triplets {
            if t.row >= start && t.row < start + n && t.col >= start && t.col < start + n {
                block[(t.row - start, t.col - start)] += t.val;
            }
        }
        block
    }
}

pub trait LinearSolver: Send + Sync {
    fn solve(&self, a: &SparseMatrix, b: &DVector<f64>) -> Result<DVector<f64>>;
}

/// Sparse Cholesky (LLᵀ) factorization through faer, lower triangle.
#[derive(Debug, Clone, Copy, Default)]
pub struct SparseCholeskySolver;

impl LinearSolver for SparseCholeskySolver {
    fn solve(&self, a: &SparseMatrix, b: &DVector<f64>) -> Result<DVector<f64>> {
        check_system(a, b)?;
        if b.is_empty() {
            return Ok(DVector::zeros(0));
        }

        let mat = a.to_faer()?;
        let symbolic = SymbolicLlt::try_new(mat.symbolic(), Side::Lower).map_err(|e| {
            Error::FactorizationFailed(format!("symbolic Cholesky failed: {:?}", e))
        })?;
        let cholesky = Llt::try_new_with_symbolic(symbolic, mat.as_ref(), Side::Lower)
            .map_err(|_| Error::NotPositiveDefinite)?;

        let rhs = Mat::from_fn(b.len(), 1, |i, _| b[i]);
        let x = cholesky.solve(&rhs);
        check_finite(DVector::from_fn(b.len(), |i, _| x[(i, 0)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix2;

    fn spd_3x3() -> SparseMatrix {
        let mut a = SparseMatrix::new(3, 3);
        a.add(0, 0, 4.0);
        a.add(0, 1, 1.0);
        a.add(1, 0, 1.0);
        a.add(1, 1, 3.0);
        a.add(2, 2, 2.0);
        a
    }

    #[test]
    fn test_sparse_cholesky_solve() {
        let a = spd_3x3();
        let b = DVector::from_vec(vec![1.0, 2.0, 4.0]);
        let x = SparseCholeskySolver.solve(&a, &b).expect("solve failed");
        let residual = a.mul_vec(&x) - &b;
        assert!(residual.norm() < 1e-10);
        assert!((x[2] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_duplicates_are_summed() {
        let mut a = SparseMatrix::new(2, 2);
        a.add(0, 0, 1.0);
        a.add(0, 0, 1.0);
        a.add(1, 1, 2.0);
        let dense = a.to_dense();
        assert_eq!(dense[(0, 0)], 2.0);

        let x = SparseCholeskySolver
            .solve(&a, &DVector::from_vec(vec![2.0, 4.0]))
            .unwrap();
        assert!((x[0] - 1.0).abs() < 1e-12);
        assert!((x[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_indefinite_matrix_fails() {
        let mut a = SparseMatrix::new(2, 2);
        a.add_block(0, 0, &Matrix2::new(1.0, 2.0, 2.0, 1.0));
        let result = SparseCholeskySolver.solve(&a, &DVector::from_vec(vec![1.0, 1.0]));
        assert!(result.is_err());
    }

    #[test]
    fn test_dimension_mismatch() {
        let a = spd_3x3();
        let result = SparseCholeskySolver.solve(&a, &DVector::zeros(2));
        assert!(matches!(result, Err(Error::DimensionMismatch(_))));
    }

    #[test]
    fn test_diagonal_block() {
        let a = spd_3x3();
        let block = a.diagonal_block(0, 2);
        assert_eq!(block, DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]));
        assert_eq!(a.diagonal_block(2, 6).nrows(), 1);
    }
}
