use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::dense::DenseCholeskySolver;
use crate::iterative::CgSolver;
use crate::sparse::{LinearSolver, SparseCholeskySolver, SparseMatrix};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LinearSolverType {
    Sparse,
    Dense,
    Iterative,
    #[default]
    Adaptive,
}

impl std::fmt::Display for LinearSolverType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LinearSolverType::Sparse => "sparse",
            LinearSolverType::Dense => "dense",
            LinearSolverType::Iterative => "iterative",
            LinearSolverType::Adaptive => "adaptive",
        };
        f.write_str(name)
    }
}

/// Thresholds used by [`LinearSolverType::Adaptive`].
///
/// Small or densely connected camera graphs go to the dense factorization,
/// very large ones to conjugate gradients, everything else to sparse Cholesky.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdaptivePolicy {
    pub dense_max_poses: usize,
    /// `max_degree / pose_num` at or above which the reduced system counts as dense.
    pub dense_degree_ratio: f64,
    pub iterative_min_poses: usize,
}

impl Default for AdaptivePolicy {
    fn default() -> Self {
        Self {
            dense_max_poses: 100,
            dense_degree_ratio: 0.5,
            iterative_min_poses: 5000,
        }
    }
}

impl AdaptivePolicy {
    pub fn select(&self, pose_num: usize, max_degree: usize) -> LinearSolverType {
        if pose_num <= self.dense_max_poses {
            return LinearSolverType::Dense;
        }
        let ratio = max_degree as f64 / pose_num as f64;
        if ratio >= self.dense_degree_ratio {
            LinearSolverType::Dense
        } else if pose_num >= self.iterative_min_poses {
            LinearSolverType::Iterative
        } else {
            LinearSolverType::Sparse
        }
    }
}

/// Routes a reduced system to the configured linear solver.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LinearSolverDispatcher {
    pub kind: LinearSolverType,
    pub policy: AdaptivePolicy,
    pub iterative: CgSolver,
}

impl LinearSolverDispatcher {
    pub fn new(kind: LinearSolverType) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn with_policy(mut self, policy: AdaptivePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_iterative(mut self, iterative: CgSolver) -> Self {
        self.iterative = iterative;
        self
    }

    /// Concrete solver for a camera graph with `pose_num` poses and the given maximum degree.
    pub fn resolve(&self, pose_num: usize, max_degree: usize) -> LinearSolverType {
        match self.kind {
            LinearSolverType::Adaptive => self.policy.select(pose_num, max_degree),
            kind => kind,
        }
    }

    /// Solve `a x = b`, returning the solution and the solver actually used.
    pub fn solve(
        &self,
        a: &SparseMatrix,
        b: &DVector<f64>,
        pose_num: usize,
        max_degree: usize,
    ) -> Result<(DVector<f64>, LinearSolverType)> {
        let kind = self.resolve(pose_num, max_degree);
        tracing::debug!(
            requested = %self.kind,
            selected = %kind,
            pose_num,
            max_degree,
            dim = b.len(),
            "solving reduced system"
        );

        let x = match kind {
            LinearSolverType::Dense => DenseCholeskySolver.solve(a, b)?,
            LinearSolverType::Iterative => self.iterative.solve(a, b)?,
            LinearSolverType::Sparse | LinearSolverType::Adaptive => {
                SparseCholeskySolver.solve(a, b)?
            }
        };
        Ok((x, kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix6;

    /// Block tridiagonal SPD system resembling a chain of cameras.
    fn chain_system(blocks: usize) -> (SparseMatrix, DVector<f64>) {
        let n = blocks * 6;
        let mut a = SparseMatrix::new(n, n);
        let coupling = Matrix6::from_fn(|r, c| if r == c { -1.0 } else { 0.1 });
        for i in 0..blocks {
            let diag = Matrix6::from_fn(|r, c| if r == c { 10.0 + r as f64 } else { 0.5 });
            a.add_block(i * 6, i * 6, &diag);
            if i + 1 < blocks {
                a.add_block(i * 6, (i + 1) * 6, &coupling);
                a.add_block((i + 1) * 6, i * 6, &coupling.transpose());
            }
        }
        let b = DVector::from_fn(n, |i, _| ((i * 7) % 5) as f64 - 2.0);
        (a, b)
    }

    #[test]
    fn test_strategies_agree() {
        let (a, b) = chain_system(5);
        let reference = DenseCholeskySolver.solve(&a, &b).unwrap();

        for kind in [
            LinearSolverType::Sparse,
            LinearSolverType::Dense,
            LinearSolverType::Iterative,
            LinearSolverType::Adaptive,
        ] {
            let dispatcher = LinearSolverDispatcher::new(kind)
                .with_iterative(CgSolver::new(500, 1e-13));
            let (x, used) = dispatcher.solve(&a, &b, 5, 2).unwrap();
            assert!(
                (&x - &reference).norm() < 1e-8,
                "{kind} (used {used}) diverges from dense reference"
            );
            assert!((a.mul_vec(&x) - &b).norm() < 1e-8);
        }
    }

    #[test]
    fn test_adaptive_thresholds() {
        let policy = AdaptivePolicy::default();
        assert_eq!(policy.select(10, 9), LinearSolverType::Dense);
        assert_eq!(policy.select(100, 2), LinearSolverType::Dense);
        assert_eq!(policy.select(1000, 600), LinearSolverType::Dense);
        assert_eq!(policy.select(1000, 20), LinearSolverType::Sparse);
        assert_eq!(policy.select(6000, 20), LinearSolverType::Iterative);
    }

    #[test]
    fn test_explicit_kind_is_not_overridden() {
        let dispatcher = LinearSolverDispatcher::new(LinearSolverType::Sparse);
        assert_eq!(dispatcher.resolve(3, 2), LinearSolverType::Sparse);
        let adaptive = LinearSolverDispatcher::default();
        assert_eq!(adaptive.resolve(3, 2), LinearSolverType::Dense);
    }

    #[test]
    fn test_failure_is_propagated() {
        let mut a = SparseMatrix::new(2, 2);
        a.add(0, 0, -1.0);
        a.add(1, 1, -1.0);
        let b = DVector::from_vec(vec![1.0, 1.0]);
        for kind in [
            LinearSolverType::Sparse,
            LinearSolverType::Dense,
            LinearSolverType::Iterative,
        ] {
            assert!(LinearSolverDispatcher::new(kind).solve(&a, &b, 1, 0).is_err());
        }
    }
}
