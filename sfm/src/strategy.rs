//! Elimination strategies.
//!
//! The iteration skeleton is fixed; a strategy decides how point blocks are
//! inverted, which reduced systems are formed and solved, and how point
//! deltas are recovered. Every hook has a default implementation, so a
//! variant overrides only what differs.

use std::collections::{BTreeSet, VecDeque};
use std::fmt::Debug;

use nalgebra::{Vector3, Vector6};
use rayon::prelude::*;
use sba_optimize::{LinearSolverDispatcher, LinearSolverType};

use crate::association::Associations;
use crate::normal::{Damping, NormalEquations};
use crate::schur::{back_substitute, PointInverses, ReducedSystem};
use crate::Result;

/// Read-only inputs of one linear step.
#[derive(Clone, Copy)]
pub struct SchurContext<'a> {
    pub associations: &'a Associations,
    pub normal: &'a NormalEquations,
    pub damping: Damping,
    pub dispatcher: &'a LinearSolverDispatcher,
}

/// Pose delta for every pose (zero where not solved) and the solver used.
#[derive(Debug, Clone)]
pub struct PoseStep {
    pub delta: Vec<Vector6<f64>>,
    pub solver: LinearSolverType,
}

pub trait SchurStrategy: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Whether `pose` takes part in the optimization.
    fn is_pose_free(&self, _pose: usize) -> bool {
        true
    }

    fn point_inverses(&self, ctx: &SchurContext<'_>) -> PointInverses {
        PointInverses::compute(ctx.normal, &ctx.damping)
    }

    fn reduced_system(
        &self,
        ctx: &SchurContext<'_>,
        poses: &[usize],
        inverses: &PointInverses,
    ) -> ReducedSystem {
        ReducedSystem::build(poses, ctx.associations, ctx.normal, inverses, &ctx.damping)
    }

    fn delta_pose(&self, ctx: &SchurContext<'_>, inverses: &PointInverses) -> Result<PoseStep> {
        let poses: Vec<usize> = (0..ctx.associations.pose_num())
            .filter(|&pose| self.is_pose_free(pose))
            .collect();
        let mut delta = vec![Vector6::zeros(); ctx.associations.pose_num()];
        let solver = solve_pose_subset(self, ctx, &poses, inverses, &mut delta)?;
        Ok(PoseStep { delta, solver })
    }

    fn delta_point(
        &self,
        ctx: &SchurContext<'_>,
        inverses: &PointInverses,
        pose_delta: &[Vector6<f64>],
    ) -> Vec<Vector3<f64>> {
        (0..ctx.associations.point_num())
            .into_par_iter()
            .map(|point| {
                back_substitute(point, ctx.associations, ctx.normal, inverses, pose_delta)
            })
            .collect()
    }
}

/// Solve the reduced system of `poses` and scatter the result into `delta`.
pub fn solve_pose_subset<S: SchurStrategy + ?Sized>(
    strategy: &S,
    ctx: &SchurContext<'_>,
    poses: &[usize],
    inverses: &PointInverses,
    delta: &mut [Vector6<f64>],
) -> Result<LinearSolverType> {
    if poses.is_empty() {
        return Ok(ctx.dispatcher.resolve(0, 0));
    }
    let system = strategy.reduced_system(ctx, poses, inverses);
    let (x, solver) = ctx.dispatcher.solve(
        &system.matrix,
        &system.rhs,
        poses.len(),
        ctx.associations.max_degree(),
    )?;
    for (pose, d) in system.split(&x) {
        delta[pose] = d;
    }
    Ok(solver)
}

/// One reduced solve over every pose.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardSchur;

impl SchurStrategy for StandardSchur {
    fn name(&self) -> &'static str {
        "standard"
    }
}

/// Poses in `fixed` are held constant; the reduced system covers the rest.
#[derive(Debug, Clone, Default)]
pub struct FixedPoseSchur {
    pub fixed: BTreeSet<usize>,
}

impl FixedPoseSchur {
    pub fn new<I: IntoIterator<Item = usize>>(fixed: I) -> Self {
        Self {
            fixed: fixed.into_iter().collect(),
        }
    }
}

impl SchurStrategy for FixedPoseSchur {
    fn name(&self) -> &'static str {
        "fixed_pose"
    }

    fn is_pose_free(&self, pose: usize) -> bool {
        !self.fixed.contains(&pose)
    }
}

/// Partial solves over connected clusters of the camera graph.
///
/// Each cluster is grown breadth-first from its seed, visiting the strongest
/// common-point edges first, and its reduced system is solved separately.
/// Coupling between clusters is dropped for the step.
#[derive(Debug, Clone, Copy)]
pub struct ClusteredSchur {
    pub cluster_size: usize,
}

impl Default for ClusteredSchur {
    fn default() -> Self {
        Self { cluster_size: 100 }
    }
}

impl ClusteredSchur {
    pub fn new(cluster_size: usize) -> Self {
        Self {
            cluster_size: cluster_size.max(1),
        }
    }

    pub fn clusters(&self, associations: &Associations) -> Vec<Vec<usize>> {
        let pose_num = associations.pose_num();
        let limit = self.cluster_size.max(1);
        let mut assigned = vec![false; pose_num];
        let mut queued = vec![false; pose_num];
        let mut clusters = Vec::new();

        for seed in 0..pose_num {
            if assigned[seed] {
                continue;
            }
            let mut cluster = Vec::with_capacity(limit);
            let mut queue = VecDeque::from([seed]);
            queued[seed] = true;

            while let Some(pose) = queue.pop_front() {
                if cluster.len() == limit {
                    queue.push_front(pose);
                    break;
                }
                cluster.push(pose);
                assigned[pose] = true;

                let mut neighbors: Vec<(usize, usize)> = associations.common_points[pose]
                    .iter()
                    .filter(|(other, _)| !assigned[*other] && !queued[*other])
                    .map(|(other, points)| (*other, points.len()))
                    .collect();
                neighbors.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
                for (other, _) in neighbors {
                    queued[other] = true;
                    queue.push_back(other);
                }
            }
            for pose in queue {
                queued[pose] = false;
            }
            cluster.sort_unstable();
            clusters.push(cluster);
        }
        clusters
    }
}

impl SchurStrategy for ClusteredSchur {
    fn name(&self) -> &'static str {
        "clustered"
    }

    fn delta_pose(&self, ctx: &SchurContext<'_>, inverses: &PointInverses) -> Result<PoseStep> {
        let clusters = self.clusters(ctx.associations);
        tracing::debug!(clusters = clusters.len(), "solving clustered reduced systems");

        let solved: Vec<Result<(Vec<(usize, Vector6<f64>)>, LinearSolverType)>> = clusters
            .par_iter()
            .map(|cluster| {
                let system = self.reduced_system(ctx, cluster, inverses);
                let (x, solver) = ctx.dispatcher.solve(
                    &system.matrix,
                    &system.rhs,
                    cluster.len(),
                    ctx.associations.max_degree().min(cluster.len().saturating_sub(1)),
                )?;
                Ok((system.split(&x), solver))
            })
            .collect();

        let mut delta = vec![Vector6::zeros(); ctx.associations.pose_num()];
        let mut solver = ctx.dispatcher.resolve(0, 0);
        for (i, result) in solved.into_iter().enumerate() {
            let (pairs, used) = result?;
            if i == 0 {
                solver = used;
            }
            for (pose, d) in pairs {
                delta[pose] = d;
            }
        }
        Ok(PoseStep { delta, solver })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_block::ProjectionBlock;
    use nalgebra::Vector2;

    /// Camera graph with `(pose, pose, shared points)` edges.
    fn graph(pose_num: usize, edges: &[(usize, usize, usize)]) -> Associations {
        let mut pairs = Vec::new();
        let mut point = 0;
        for &(a, b, shared) in edges {
            for _ in 0..shared {
                pairs.push((a, point));
                pairs.push((b, point));
                point += 1;
            }
        }
        let mut block = ProjectionBlock::new(pairs.len());
        for (i, &(pose, pt)) in pairs.iter().enumerate() {
            block.set(i, pose, pt, &Vector2::zeros());
        }
        Associations::build(&vec![0; pose_num], 1, point, &block).unwrap()
    }

    #[test]
    fn test_clusters_cover_every_pose_once() {
        let assoc = graph(5, &[(0, 1, 1), (1, 2, 1), (2, 3, 1), (3, 4, 1)]);
        let clusters = ClusteredSchur::new(2).clusters(&assoc);
        assert_eq!(clusters, vec![vec![0, 1], vec![2, 3], vec![4]]);

        let single = ClusteredSchur::new(10).clusters(&assoc);
        assert_eq!(single, vec![vec![0, 1, 2, 3, 4]]);
    }

    #[test]
    fn test_clusters_follow_strongest_edges() {
        // Pose 0 shares one point with pose 1 and five with pose 2.
        let assoc = graph(3, &[(0, 1, 1), (0, 2, 5)]);
        let clusters = ClusteredSchur::new(2).clusters(&assoc);
        assert_eq!(clusters, vec![vec![0, 2], vec![1]]);
    }

    #[test]
    fn test_disconnected_poses_form_their_own_clusters() {
        let assoc = graph(4, &[(0, 1, 2), (2, 3, 2)]);
        let clusters = ClusteredSchur::new(8).clusters(&assoc);
        assert_eq!(clusters, vec![vec![0, 1], vec![2, 3]]);
    }

    #[test]
    fn test_fixed_pose_membership() {
        let strategy = FixedPoseSchur::new([0, 3]);
        assert!(!strategy.is_pose_free(0));
        assert!(strategy.is_pose_free(1));
        assert!(StandardSchur.is_pose_free(0));
        assert_eq!(strategy.name(), "fixed_pose");
    }
}
