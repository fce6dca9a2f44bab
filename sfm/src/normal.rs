//! Block normal equations `JᵀWJ δ = JᵀWe`.
//!
//! Each output block has exactly one writer: pose blocks are reduced over the
//! pose's sorted projection list, point blocks over the point's, and cross
//! blocks are per projection. No block is ever incremented concurrently.

use nalgebra::{Matrix3, Matrix6, Matrix6x3, SMatrix, Vector3, Vector6};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::association::Associations;
use crate::evaluator::Evaluation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DampingMode {
    /// `H + λ I`
    Additive,
    /// `H + λ diag(max(H_ii, floor))`
    #[default]
    Multiplicative,
}

/// Levenberg-Marquardt regularization applied to block diagonals on the fly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Damping {
    pub lambda: f64,
    pub mode: DampingMode,
    /// Lower bound on diagonal entries scaled in multiplicative mode.
    pub floor: f64,
}

impl Damping {
    pub fn new(lambda: f64, mode: DampingMode, floor: f64) -> Self {
        Self {
            lambda,
            mode,
            floor,
        }
    }

    /// No regularization at all.
    pub fn none() -> Self {
        Self::new(0.0, DampingMode::Additive, 0.0)
    }

    pub fn apply<const D: usize>(&self, block: &SMatrix<f64, D, D>) -> SMatrix<f64, D, D> {
        let mut damped = *block;
        for i in 0..D {
            damped[(i, i)] += match self.mode {
                DampingMode::Additive => self.lambda,
                DampingMode::Multiplicative => self.lambda * block[(i, i)].max(self.floor),
            };
        }
        damped
    }
}

#[derive(Debug, Clone, Default)]
pub struct NormalEquations {
    /// `JcᵀWJc` per pose.
    pub jc_jc: Vec<Matrix6<f64>>,
    /// `JcᵀWe` per pose.
    pub jc_e: Vec<Vector6<f64>>,
    /// `JpᵀWJp` per point.
    pub jp_jp: Vec<Matrix3<f64>>,
    /// `JpᵀWe` per point.
    pub jp_e: Vec<Vector3<f64>>,
    /// `JcᵀWJp` per projection.
    pub jc_jp: Vec<Matrix6x3<f64>>,
}

impl NormalEquations {
    pub fn accumulate(evaluation: &Evaluation, associations: &Associations) -> Self {
        let jc_jp: Vec<Matrix6x3<f64>> = (0..evaluation.weights.len())
            .into_par_iter()
            .map(|proj| {
                let w = evaluation.weights[proj];
                evaluation.pose_jacobians[proj].transpose() * evaluation.point_jacobians[proj] * w
            })
            .collect();

        let (jc_jc, jc_e): (Vec<_>, Vec<_>) = associations
            .pose_projections
            .par_iter()
            .map(|list| {
                let mut h = Matrix6::zeros();
                let mut g = Vector6::zeros();
                for &(_, proj) in list {
                    if !evaluation.residuals.valid[proj] {
                        continue;
                    }
                    let jt = evaluation.pose_jacobians[proj].transpose();
                    let w = evaluation.weights[proj];
                    h += jt * evaluation.pose_jacobians[proj] * w;
                    g += jt * evaluation.residuals.values[proj] * w;
                }
                (h, g)
            })
            .unzip();

        let (jp_jp, jp_e): (Vec<_>, Vec<_>) = associations
            .point_projections
            .par_iter()
            .map(|list| {
                let mut h = Matrix3::zeros();
                let mut g = Vector3::zeros();
                for &(_, proj) in list {
                    if !evaluation.residuals.valid[proj] {
                        continue;
                    }
                    let jt = evaluation.point_jacobians[proj].transpose();
                    let w = evaluation.weights[proj];
                    h += jt * evaluation.point_jacobians[proj] * w;
                    g += jt * evaluation.residuals.values[proj] * w;
                }
                (h, g)
            })
            .unzip();

        Self {
            jc_jc,
            jc_e,
            jp_jp,
            jp_e,
            jc_jp,
        }
    }

    pub fn pose_num(&self) -> usize {
        self.jc_jc.len()
    }

    pub fn point_num(&self) -> usize {
        self.jp_jp.len()
    }

    pub fn damped_pose_block(&self, pose: usize, damping: &Damping) -> Matrix6<f64> {
        damping.apply(&self.jc_jc[pose])
    }

    pub fn damped_point_block(&self, point: usize, damping: &Damping) -> Matrix3<f64> {
        damping.apply(&self.jp_jp[point])
    }

    /// Max-norm of the gradient over the poses accepted by `pose_free` and all points.
    pub fn gradient_max_norm<F>(&self, pose_free: F) -> f64
    where
        F: Fn(usize) -> bool,
    {
        let pose_max = self
            .jc_e
            .iter()
            .enumerate()
            .filter(|(pose, _)| pose_free(*pose))
            .map(|(_, g)| g.amax())
            .fold(0.0, f64::max);
        self.jp_e.iter().map(|g| g.amax()).fold(pose_max, f64::max)
    }
}
