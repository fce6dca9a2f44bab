//! Elimination of point variables.
//!
//! With damped blocks `U_i` (poses), `C_p` (points) and cross blocks `W_ip`,
//! the reduced camera system is
//!
//! ```text
//! S_ii = U_i − Σ_p W_ip C_p⁻¹ W_ipᵀ
//! S_ij =     − Σ_{p ∈ common(i, j)} W_ip C_p⁻¹ W_jpᵀ
//! r_i  = Jce_i − Σ_p W_ip C_p⁻¹ Jpe_p
//! ```
//!
//! and point deltas follow from `dz_p = C_p⁻¹ (Jpe_p − Σ_i W_ipᵀ dy_i)`.
//! Points whose block is singular are left out of all three.

use nalgebra::{DVector, Matrix3, Matrix6, Vector3, Vector6};
use rayon::prelude::*;
use sba_optimize::SparseMatrix;

use crate::association::Associations;
use crate::normal::{Damping, NormalEquations};

/// Relative determinant below which a point block counts as singular.
pub const SINGULAR_THRESHOLD: f64 = 1e-12;

/// Inverse of a symmetric 3×3 block, `None` when it is singular or indefinite.
pub fn invert_point_block(block: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let scale = block.trace() / 3.0;
    if !(scale > 0.0 && scale.is_finite()) {
        return None;
    }
    if block.determinant().abs() <= SINGULAR_THRESHOLD * scale.powi(3) {
        return None;
    }
    block.cholesky().map(|c| c.inverse())
}

#[derive(Debug, Clone, Default)]
pub struct PointInverses {
    inverses: Vec<Option<Matrix3<f64>>>,
}

impl PointInverses {
    pub fn compute(normal: &NormalEquations, damping: &Damping) -> Self {
        let inverses: Vec<Option<Matrix3<f64>>> = (0..normal.point_num())
            .into_par_iter()
            .map(|point| invert_point_block(&normal.damped_point_block(point, damping)))
            .collect();

        let singular = inverses.iter().filter(|i| i.is_none()).count();
        if singular > 0 {
            tracing::debug!(singular, "skipping singular point blocks");
        }
        Self { inverses }
    }

    pub fn get(&self, point: usize) -> Option<&Matrix3<f64>> {
        self.inverses.get(point).and_then(Option::as_ref)
    }

    pub fn len(&self) -> usize {
        self.inverses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inverses.is_empty()
    }

    pub fn singular_count(&self) -> usize {
        self.inverses.iter().filter(|i| i.is_none()).count()
    }
}

/// Reduced camera system over an ordered subset of poses.
#[derive(Debug, Clone)]
pub struct ReducedSystem {
    /// Global pose index of each 6-row block.
    pub poses: Vec<usize>,
    pub matrix: SparseMatrix,
    pub rhs: DVector<f64>,
}

type RowBlocks = (Matrix6<f64>, Vector6<f64>, Vec<(usize, Matrix6<f64>)>);

impl ReducedSystem {
    pub fn build(
        poses: &[usize],
        associations: &Associations,
        normal: &NormalEquations,
        inverses: &PointInverses,
        damping: &Damping,
    ) -> Self {
        let mut local = vec![None; associations.pose_num()];
        for (i, &pose) in poses.iter().enumerate() {
            local[pose] = Some(i);
        }

        let rows: Vec<RowBlocks> = poses
            .par_iter()
            .enumerate()
            .map(|(i, &pose)| {
                let mut diag = normal.damped_pose_block(pose, damping);
                let mut rhs = normal.jc_e[pose];
                for &(point, proj) in &associations.pose_projections[pose] {
                    if let Some(c_inv) = inverses.get(point) {
                        let w_c = normal.jc_jp[proj] * c_inv;
                        diag -= w_c * normal.jc_jp[proj].transpose();
                        rhs -= w_c * normal.jp_e[point];
                    }
                }

                let mut off_diagonal = Vec::new();
                for (other, points) in &associations.common_points[pose] {
                    let Some(j) = local[*other] else { continue };
                    if j <= i {
                        continue;
                    }
                    let mut block = Matrix6::zeros();
                    let mut coupled = false;
                    for &point in points {
                        let Some(c_inv) = inverses.get(point) else {
                            continue;
                        };
                        let (Some(pi), Some(pj)) = (
                            associations.projection(pose, point),
                            associations.projection(*other, point),
                        ) else {
                            continue;
                        };
                        block -= normal.jc_jp[pi] * c_inv * normal.jc_jp[pj].transpose();
                        coupled = true;
                    }
                    if coupled {
                        off_diagonal.push((j, block));
                    }
                }
                (diag, rhs, off_diagonal)
            })
            .collect();

        let dim = poses.len() * 6;
        let nnz = rows.iter().map(|(_, _, off)| 36 * (1 + 2 * off.len())).sum();
        let mut matrix = SparseMatrix::with_capacity(dim, dim, nnz);
        let mut rhs = DVector::zeros(dim);
        for (i, (diag, r, off_diagonal)) in rows.into_iter().enumerate() {
            let symmetric = (diag + diag.transpose()) * 0.5;
            matrix.add_block(6 * i, 6 * i, &symmetric);
            rhs.fixed_rows_mut::<6>(6 * i).copy_from(&r);
            for (j, block) in off_diagonal {
                matrix.add_block(6 * i, 6 * j, &block);
                matrix.add_block(6 * j, 6 * i, &block.transpose());
            }
        }

        Self {
            poses: poses.to_vec(),
            matrix,
            rhs,
        }
    }

    pub fn dim(&self) -> usize {
        self.rhs.len()
    }

    /// Scatter a solution vector back to `(pose, delta)` pairs.
    pub fn split(&self, x: &DVector<f64>) -> Vec<(usize, Vector6<f64>)> {
        self.poses
            .iter()
            .enumerate()
            .map(|(i, &pose)| (pose, x.fixed_rows::<6>(6 * i).into_owned()))
            .collect()
    }
}

/// Point delta given the delta of every pose (zero for poses held fixed).
pub fn back_substitute(
    point: usize,
    associations: &Associations,
    normal: &NormalEquations,
    inverses: &PointInverses,
    pose_delta: &[Vector6<f64>],
) -> Vector3<f64> {
    let Some(c_inv) = inverses.get(point) else {
        return Vector3::zeros();
    };
    let mut r = normal.jp_e[point];
    for &(pose, proj) in &associations.point_projections[point] {
        r -= normal.jc_jp[proj].transpose() * pose_delta[pose];
    }
    c_inv * r
}
