//! Reprojection residuals and their analytic Jacobians.
//!
//! Residuals are `observed − predicted`; the stored Jacobians are those of
//! the predicted projection. A projection whose point lies behind its
//! camera is invalid for the current parameters: its residual, Jacobians
//! and weight are zero and it is excluded from the cost.

use nalgebra::{Matrix2x3, Matrix2x6, Vector2};
use rayon::prelude::*;
use sba_core::{project, project_with_jacobian, RobustLoss};
use serde::{Deserialize, Serialize};

use crate::data_block::{IntrinsicBlock, PointBlock, PoseBlock, ProjectionBlock};

/// Borrowed view of everything needed to evaluate projections.
#[derive(Clone, Copy)]
pub struct Evaluator<'a> {
    pub poses: &'a PoseBlock,
    pub points: &'a PointBlock,
    pub intrinsics: &'a IntrinsicBlock,
    pub projections: &'a ProjectionBlock,
    pub pose_group: &'a [usize],
    pub loss: RobustLoss,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Residuals {
    pub values: Vec<Vector2<f64>>,
    pub valid: Vec<bool>,
}

/// Residuals plus per-projection Jacobians and IRLS weights.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub residuals: Residuals,
    pub pose_jacobians: Vec<Matrix2x6<f64>>,
    pub point_jacobians: Vec<Matrix2x3<f64>>,
    pub weights: Vec<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReprojectionStats {
    pub mean: f64,
    pub median: f64,
    pub max: f64,
    /// Number of valid projections the statistics are computed over.
    pub count: usize,
}

impl<'a> Evaluator<'a> {
    pub fn residual(&self, proj: usize) -> Option<Vector2<f64>> {
        let pose = self.projections.pose(proj);
        let intrinsic = self.intrinsics.get(self.pose_group[pose]);
        let predicted = project(
            &intrinsic,
            &self.poses.get(pose),
            &self.points.get(self.projections.point(proj)),
        )?;
        Some(self.projections.observation(proj) - predicted)
    }

    pub fn residuals(&self) -> Residuals {
        let evaluated: Vec<Option<Vector2<f64>>> = (0..self.projections.len())
            .into_par_iter()
            .map(|proj| self.residual(proj))
            .collect();
        Residuals::from_options(evaluated)
    }

    pub fn evaluate(&self) -> Evaluation {
        let evaluated: Vec<_> = (0..self.projections.len())
            .into_par_iter()
            .map(|proj| {
                let pose = self.projections.pose(proj);
                let intrinsic = self.intrinsics.get(self.pose_group[pose]);
                project_with_jacobian(
                    &intrinsic,
                    &self.poses.get(pose),
                    &self.points.get(self.projections.point(proj)),
                )
                .map(|(predicted, jacobian)| {
                    let residual = self.projections.observation(proj) - predicted;
                    (residual, jacobian, self.loss.weight(residual.norm()))
                })
            })
            .collect();

        let n = evaluated.len();
        let mut evaluation = Evaluation {
            residuals: Residuals {
                values: Vec::with_capacity(n),
                valid: Vec::with_capacity(n),
            },
            pose_jacobians: Vec::with_capacity(n),
            point_jacobians: Vec::with_capacity(n),
            weights: Vec::with_capacity(n),
        };
        for item in evaluated {
            match item {
                Some((residual, jacobian, weight)) => {
                    evaluation.residuals.values.push(residual);
                    evaluation.residuals.valid.push(true);
                    evaluation.pose_jacobians.push(jacobian.pose);
                    evaluation.point_jacobians.push(jacobian.point);
                    evaluation.weights.push(weight);
                }
                None => {
                    evaluation.residuals.values.push(Vector2::zeros());
                    evaluation.residuals.valid.push(false);
                    evaluation.pose_jacobians.push(Matrix2x6::zeros());
                    evaluation.point_jacobians.push(Matrix2x3::zeros());
                    evaluation.weights.push(0.0);
                }
            }
        }
        evaluation
    }
}

impl Residuals {
    fn from_options(evaluated: Vec<Option<Vector2<f64>>>) -> Self {
        let valid = evaluated.iter().map(Option::is_some).collect();
        let values = evaluated
            .into_iter()
            .map(|r| r.unwrap_or_else(Vector2::zeros))
            .collect();
        Self { values, valid }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn invalid_count(&self) -> usize {
        self.valid.iter().filter(|v| !**v).count()
    }

    /// `Σ ρ(‖e‖)` over valid projections, summed in projection order.
    pub fn cost(&self, loss: &RobustLoss) -> f64 {
        self.values
            .iter()
            .zip(&self.valid)
            .filter(|(_, valid)| **valid)
            .map(|(r, _)| loss.evaluate(r.norm()))
            .sum()
    }

    pub fn stats(&self) -> ReprojectionStats {
        let mut norms: Vec<f64> = self
            .values
            .iter()
            .zip(&self.valid)
            .filter(|(_, valid)| **valid)
            .map(|(r, _)| r.norm())
            .collect();
        if norms.is_empty() {
            return ReprojectionStats::default();
        }

        norms.sort_by(|a, b| a.total_cmp(b));
        let count = norms.len();
        let median = if count % 2 == 1 {
            norms[count / 2]
        } else {
            0.5 * (norms[count / 2 - 1] + norms[count / 2])
        };
        ReprojectionStats {
            mean: norms.iter().sum::<f64>() / count as f64,
            median,
            max: norms[count - 1],
            count,
        }
    }
}
