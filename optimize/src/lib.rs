//! Linear solvers for the reduced camera system
//!
//! The reduced system produced by Schur elimination is symmetric positive
//! (semi)definite. It can be factorized sparsely with faer, densely with
//! nalgebra, or solved approximately with block-Jacobi preconditioned
//! conjugate gradients. `LinearSolverDispatcher` picks among them.

pub mod dense;
pub mod dispatch;
pub mod iterative;
pub mod sparse;

pub use dense::DenseCholeskySolver;
pub use dispatch::{AdaptivePolicy, LinearSolverDispatcher, LinearSolverType};
pub use iterative::CgSolver;
pub use sparse::{LinearSolver, SparseCholeskySolver, SparseMatrix};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Sparse matrix creation failed: {0}")]
    SparseMatrixCreation(String),

    #[error("Factorization failed: {0}")]
    FactorizationFailed(String),

    #[error("Matrix is not positive definite")]
    NotPositiveDefinite,

    #[error("Conjugate gradients did not converge after {iterations} iterations (relative residual {residual:e})")]
    NotConverged { iterations: usize, residual: f64 },

    #[error("Solution contains non-finite values")]
    NonFiniteSolution,
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn check_system(a: &SparseMatrix, b: &nalgebra::DVector<f64>) -> Result<()> {
    if a.rows != a.cols {
        return Err(Error::DimensionMismatch(format!(
            "matrix must be square, got {}x{}",
            a.rows, a.cols
        )));
    }
    if a.rows != b.len() {
        return Err(Error::DimensionMismatch(format!(
            "matrix has {} rows but rhs has {}",
            a.rows,
            b.len()
        )));
    }
    Ok(())
}

pub(crate) fn check_finite(x: nalgebra::DVector<f64>) -> Result<nalgebra::DVector<f64>> {
    if x.iter().all(|v| v.is_finite()) {
        Ok(x)
    } else {
        Err(Error::NonFiniteSolution)
    }
}
