use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::sparse::{LinearSolver, SparseMatrix};
use crate::{check_finite, check_system, Error, Result};

/// Preconditioned conjugate gradients with a block-Jacobi preconditioner.
///
/// Convergence is declared when `‖b − A x‖ ≤ tolerance · ‖b‖`. Running out
/// of iterations is an error rather than a partial solution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CgSolver {
    pub max_iterations: usize,
    pub tolerance: f64,
    /// Size of the diagonal blocks inverted by the preconditioner (6 for poses).
    pub block_size: usize,
}

impl Default for CgSolver {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            tolerance: 1e-10,
            block_size: 6,
        }
    }
}

impl CgSolver {
    pub fn new(max_iterations: usize, tolerance: f64) -> Self {
        Self {
            max_iterations,
            tolerance,
            ..Self::default()
        }
    }
}

/// Inverted diagonal blocks; a block whose Cholesky fails falls back to scalar Jacobi.
struct BlockJacobi {
    block_size: usize,
    inverses: Vec<DMatrix<f64>>,
}

impl BlockJacobi {
    fn new(a: &SparseMatrix, block_size: usize) -> Self {
        let block_size = block_size.max(1);
        let mut blocks: Vec<DMatrix<f64>> = (0..a.rows.div_ceil(block_size))
            .map(|b| {
                let n = block_size.min(a.rows - b * block_size);
                DMatrix::zeros(n, n)
            })
            .collect();

        for t in &a.triplets {
            let (br, bc) = (t.row / block_size, t.col / block_size);
            if br == bc {
                blocks[br][(t.row % block_size, t.col % block_size)] += t.val;
            }
        }

        let inverses = blocks
            .into_iter()
            .map(|block| {
                let symmetric = (&block + block.transpose()) * 0.5;
                match symmetric.clone().cholesky() {
                    Some(ch) => ch.inverse(),
                    None => DMatrix::from_diagonal(&symmetric.diagonal().map(|d| {
                        if d.abs() > 1e-12 {
                            1.0 / d
                        } else {
                            1.0
                        }
                    })),
                }
            })
            .collect();

        Self {
            block_size,
            inverses,
        }
    }

    fn apply(&self, r: &DVector<f64>) -> DVector<f64> {
        let mut z = DVector::zeros(r.len());
        for (b, inv) in self.inverses.iter().enumerate() {
            let start = b * self.block_size;
            let n = inv.nrows();
            let zb = inv * r.rows(start, n);
            z.rows_mut(start, n).copy_from(&zb);
        }
        z
    }
}

impl LinearSolver for CgSolver {
    fn solve(&self, a: &SparseMatrix, b: &DVector<f64>) -> Result<DVector<f64>> {
        check_system(a, b)?;

        let n = b.len();
        let b_norm = b.norm();
        if n == 0 || b_norm == 0.0 {
            return Ok(DVector::zeros(n));
        }

        let preconditioner = BlockJacobi::new(a, self.block_size);
        let mut x = DVector::zeros(n);
        let mut r = b.clone();
        let mut z = preconditioner.apply(&r);
        let mut p = z.clone();
        let mut rz_old = r.dot(&z);
        let mut relative = 1.0;

        for _ in 0..self.max_iterations {
            let ap = a.mul_vec(&p);
            let p_ap = p.dot(&ap);
            if !(p_ap > 0.0) || !p_ap.is_finite() {
                return Err(Error::NotPositiveDefinite);
            }

            let alpha = rz_old / p_ap;
            x.axpy(alpha, &p, 1.0);
            r.axpy(-alpha, &ap, 1.0);

            relative = r.norm() / b_norm;
            if relative <= self.tolerance {
                return check_finite(x);
            }

            z = preconditioner.apply(&r);
            let rz_new = r.dot(&z);
            let beta = rz_new / rz_old;
            p = &z + beta * &p;
            rz_old = rz_new;
        }

        tracing::warn!(
            iterations = self.max_iterations,
            relative_residual = relative,
            "conjugate gradients hit its iteration cap"
        );
        Err(Error::NotConverged {
            iterations: self.max_iterations,
            residual: relative,
        })
    }
}
