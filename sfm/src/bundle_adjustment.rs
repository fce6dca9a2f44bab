use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nalgebra::{Vector3, Vector6};
use sba_core::RobustLoss;
use sba_optimize::{AdaptivePolicy, CgSolver, LinearSolverDispatcher, LinearSolverType};
use sba_runtime::ThreadConfig;
use serde::{Deserialize, Serialize};

use crate::bundle_block::BundleBlock;
use crate::evaluator::{ReprojectionStats, Residuals};
use crate::normal::{Damping, DampingMode, NormalEquations};
use crate::problem::BaProblem;
use crate::report::{self, IterationRecord, ProblemSize};
use crate::schur::PointInverses;
use crate::strategy::{SchurContext, SchurStrategy, StandardSchur};
use crate::{Result, SfmError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleAdjustmentConfig {
    /// Budget of accepted iterations.
    pub max_iterations: usize,
    /// Consecutive rejected or unsolvable steps tolerated before failing.
    pub max_consecutive_failures: usize,
    pub gradient_tolerance: f64,
    pub function_tolerance: f64,
    pub parameter_tolerance: f64,
    pub initial_lambda: f64,
    pub min_lambda: f64,
    pub max_lambda: f64,
    pub lambda_decrease: f64,
    pub lambda_increase: f64,
    pub damping_mode: DampingMode,
    pub min_diagonal: f64,
    pub linear_solver: LinearSolverType,
    pub adaptive_policy: AdaptivePolicy,
    pub iterative: CgSolver,
    pub loss: RobustLoss,
    pub threads: ThreadConfig,
    pub debug_folder: Option<PathBuf>,
}

impl Default for BundleAdjustmentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            max_consecutive_failures: 10,
            gradient_tolerance: 1e-10,
            function_tolerance: 1e-8,
            parameter_tolerance: 1e-10,
            initial_lambda: 1e-3,
            min_lambda: 1e-12,
            max_lambda: 1e12,
            lambda_decrease: 0.1,
            lambda_increase: 10.0,
            damping_mode: DampingMode::Multiplicative,
            min_diagonal: 1e-6,
            linear_solver: LinearSolverType::Adaptive,
            adaptive_policy: AdaptivePolicy::default(),
            iterative: CgSolver::default(),
            loss: RobustLoss::Trivial,
            threads: ThreadConfig::default(),
            debug_folder: None,
        }
    }
}

impl BundleAdjustmentConfig {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.threads.num_threads = Some(num_threads);
        self
    }

    pub fn with_linear_solver(mut self, linear_solver: LinearSolverType) -> Self {
        self.linear_solver = linear_solver;
        self
    }

    pub fn with_loss(mut self, loss: RobustLoss) -> Self {
        self.loss = loss;
        self
    }

    pub fn with_damping_mode(mut self, mode: DampingMode) -> Self {
        self.damping_mode = mode;
        self
    }

    pub fn with_initial_lambda(mut self, lambda: f64) -> Self {
        self.initial_lambda = lambda;
        self
    }

    pub fn with_tolerances(mut self, gradient: f64, function: f64, parameter: f64) -> Self {
        self.gradient_tolerance = gradient;
        self.function_tolerance = function;
        self.parameter_tolerance = parameter;
        self
    }

    pub fn with_debug_folder<P: Into<PathBuf>>(mut self, folder: P) -> Self {
        self.debug_folder = Some(folder.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.loss.validate()?;
        let checks = [
            (self.initial_lambda > 0.0, "initial_lambda must be > 0"),
            (self.min_lambda > 0.0, "min_lambda must be > 0"),
            (self.max_lambda > self.min_lambda, "max_lambda must exceed min_lambda"),
            (
                self.lambda_decrease > 0.0 && self.lambda_decrease < 1.0,
                "lambda_decrease must lie in (0, 1)",
            ),
            (self.lambda_increase > 1.0, "lambda_increase must be > 1"),
            (self.min_diagonal >= 0.0, "min_diagonal must be >= 0"),
            (
                self.gradient_tolerance >= 0.0
                    && self.function_tolerance >= 0.0
                    && self.parameter_tolerance >= 0.0,
                "tolerances must be >= 0",
            ),
            (self.iterative.max_iterations > 0, "iterative.max_iterations must be > 0"),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, message)) => Err(SfmError::InvalidConfig(message.to_string())),
            None => Ok(()),
        }
    }

    pub fn dispatcher(&self) -> LinearSolverDispatcher {
        LinearSolverDispatcher::new(self.linear_solver)
            .with_policy(self.adaptive_policy)
            .with_iterative(self.iterative)
    }

    fn damping(&self, lambda: f64) -> Damping {
        Damping::new(lambda, self.damping_mode, self.min_diagonal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveState {
    Evaluating,
    Building,
    Solving,
    Updating,
    Converged(TerminationReason),
    Failed(FailureReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    GradientTolerance,
    FunctionTolerance,
    ParameterTolerance,
    ZeroCost,
    IterationLimit,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            TerminationReason::GradientTolerance => "gradient below tolerance",
            TerminationReason::FunctionTolerance => "relative cost decrease below tolerance",
            TerminationReason::ParameterTolerance => "step below parameter tolerance",
            TerminationReason::ZeroCost => "zero cost",
            TerminationReason::IterationLimit => "iteration limit reached",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ConsecutiveFailures,
    DampingOverflow,
    NonFiniteCost,
    NonFiniteParameters,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            FailureReason::ConsecutiveFailures => "too many consecutive rejected steps",
            FailureReason::DampingOverflow => "damping exceeded its upper bound",
            FailureReason::NonFiniteCost => "cost is not finite",
            FailureReason::NonFiniteParameters => "parameters became non-finite",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveSummary {
    pub strategy: String,
    pub size: ProblemSize,
    pub threads: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    /// Accepted iterations.
    pub iterations: usize,
    pub rejected_steps: usize,
    pub final_lambda: f64,
    pub termination: Option<TerminationReason>,
    pub failure: Option<FailureReason>,
    pub reprojection: ReprojectionStats,
    pub elapsed: Duration,
    pub records: Vec<IterationRecord>,
}

impl SolveSummary {
    pub fn converged(&self) -> bool {
        self.failure.is_none()
    }
}

/// Refine `block` in place with the standard elimination.
pub fn bundle_adjust(block: &mut BundleBlock, config: &BundleAdjustmentConfig) -> Result<SolveSummary> {
    bundle_adjust_with(block, config, &StandardSchur)
}

pub fn bundle_adjust_with(
    block: &mut BundleBlock,
    config: &BundleAdjustmentConfig,
    strategy: &dyn SchurStrategy,
) -> Result<SolveSummary> {
    let mut problem = BaProblem::new(config.clone())?;
    problem.initialize(block)?;
    let result = problem.solve_with(strategy);
    problem.update(block)?;
    result
}

pub(crate) fn run(problem: &mut BaProblem, strategy: &dyn SchurStrategy) -> Result<SolveSummary> {
    if problem.projection_num() == 0 {
        return Err(SfmError::EmptyProblem);
    }
    problem.ensure_associations()?;
    let group = Arc::clone(&problem.group);
    group.install(|| optimize(problem, strategy))
}

struct Step {
    pose_delta: Vec<Vector6<f64>>,
    point_delta: Vec<Vector3<f64>>,
    solver: LinearSolverType,
}

/// Counters shared by every state of the loop.
struct Progress {
    lambda: f64,
    accepted: usize,
    rejected: usize,
    consecutive_failures: usize,
    attempt: usize,
}

impl Progress {
    fn reject(&mut self, config: &BundleAdjustmentConfig) -> SolveState {
        self.rejected += 1;
        self.consecutive_failures += 1;
        self.lambda *= config.lambda_increase;
        if self.consecutive_failures > config.max_consecutive_failures {
            SolveState::Failed(FailureReason::ConsecutiveFailures)
        } else if self.lambda > config.max_lambda {
            SolveState::Failed(FailureReason::DampingOverflow)
        } else {
            SolveState::Building
        }
    }

    fn accept(&mut self, config: &BundleAdjustmentConfig) {
        self.accepted += 1;
        self.consecutive_failures = 0;
        self.lambda = (self.lambda * config.lambda_decrease).max(config.min_lambda);
    }
}

fn optimize(problem: &mut BaProblem, strategy: &dyn SchurStrategy) -> Result<SolveSummary> {
    let config = problem.config().clone();
    let dispatcher = config.dispatcher();
    let loss = config.loss;
    let start = Instant::now();
    let size = problem.size();
    let associations = problem
        .associations
        .as_ref()
        .ok_or_else(|| SfmError::InvalidStructure("associations are not built".to_string()))?;

    let mut evaluation = problem.evaluator().evaluate();
    let mut residuals: Residuals = evaluation.residuals.clone();
    let mut cost = residuals.cost(&loss);
    let mut invalid = residuals.invalid_count();
    let initial_cost = cost;

    let mut progress = Progress {
        lambda: config.initial_lambda,
        accepted: 0,
        rejected: 0,
        consecutive_failures: 0,
        attempt: 0,
    };
    let mut normal = NormalEquations::default();
    let mut inverses = PointInverses::default();
    let mut step: Option<Step> = None;
    let mut records = Vec::new();

    tracing::info!(
        strategy = strategy.name(),
        poses = size.poses,
        points = size.points,
        projections = size.projections,
        max_degree = size.max_degree,
        initial_cost,
        invalid,
        "starting bundle adjustment"
    );

    let mut state = SolveState::Evaluating;
    loop {
        state = match state {
            SolveState::Evaluating => {
                if !cost.is_finite() {
                    SolveState::Failed(FailureReason::NonFiniteCost)
                } else if cost == 0.0 {
                    SolveState::Converged(TerminationReason::ZeroCost)
                } else if progress.accepted >= config.max_iterations {
                    SolveState::Converged(TerminationReason::IterationLimit)
                } else {
                    normal = NormalEquations::accumulate(&evaluation, associations);
                    let gradient = normal.gradient_max_norm(|pose| strategy.is_pose_free(pose));
                    if gradient <= config.gradient_tolerance {
                        SolveState::Converged(TerminationReason::GradientTolerance)
                    } else {
                        SolveState::Building
                    }
                }
            }
            SolveState::Building => {
                let ctx = SchurContext {
                    associations,
                    normal: &normal,
                    damping: config.damping(progress.lambda),
                    dispatcher: &dispatcher,
                };
                inverses = strategy.point_inverses(&ctx);
                SolveState::Solving
            }
            SolveState::Solving => {
                progress.attempt += 1;
                let ctx = SchurContext {
                    associations,
                    normal: &normal,
                    damping: config.damping(progress.lambda),
                    dispatcher: &dispatcher,
                };
                match strategy.delta_pose(&ctx, &inverses) {
                    Ok(pose_step) => {
                        let point_delta = strategy.delta_point(&ctx, &inverses, &pose_step.delta);
                        step = Some(Step {
                            pose_delta: pose_step.delta,
                            point_delta,
                            solver: pose_step.solver,
                        });
                        SolveState::Updating
                    }
                    Err(e) => {
                        tracing::warn!(lambda = progress.lambda, error = %e, "linear solve failed");
                        records.push(IterationRecord {
                            iteration: progress.accepted,
                            attempt: progress.attempt,
                            cost,
                            trial_cost: None,
                            lambda: progress.lambda,
                            accepted: false,
                            solver: None,
                            singular_points: inverses.singular_count(),
                            elapsed_ms: elapsed_ms(start),
                        });
                        progress.reject(&config)
                    }
                }
            }
            SolveState::Updating => {
                let Some(Step {
                    pose_delta,
                    point_delta,
                    solver,
                }) = step.take()
                else {
                    return Err(SfmError::InvalidStructure(
                        "update requested without a solved step".to_string(),
                    ));
                };

                let mut step_norm2 = 0.0;
                let mut param_norm2 = 0.0;
                for (pose, delta) in pose_delta.iter().enumerate() {
                    if strategy.is_pose_free(pose) {
                        param_norm2 += problem.poses.vector(pose).norm_squared();
                        step_norm2 += delta.norm_squared();
                    }
                }
                for (point, delta) in point_delta.iter().enumerate() {
                    param_norm2 += problem.points.get(point).norm_squared();
                    step_norm2 += delta.norm_squared();
                }
                let step_norm = step_norm2.sqrt();
                let param_norm = param_norm2.sqrt();

                if !step_norm.is_finite() {
                    SolveState::Failed(FailureReason::NonFiniteParameters)
                } else if step_norm
                    <= config.parameter_tolerance * (param_norm + config.parameter_tolerance)
                {
                    tracing::debug!(step_norm, param_norm, "step below parameter tolerance");
                    SolveState::Converged(TerminationReason::ParameterTolerance)
                } else {
                    let saved_poses = problem.poses.clone();
                    let saved_points = problem.points.clone();
                    for (pose, delta) in pose_delta.iter().enumerate() {
                        if strategy.is_pose_free(pose) {
                            let current = problem.poses.vector(pose);
                            problem.poses.set_vector(pose, &(current + delta));
                        }
                    }
                    for (point, delta) in point_delta.iter().enumerate() {
                        let current = problem.points.get(point);
                        problem.points.set(point, &(current + delta));
                    }

                    let trial = problem.evaluator().residuals();
                    let trial_cost = trial.cost(&loss);
                    let trial_invalid = trial.invalid_count();
                    let success =
                        trial_cost.is_finite() && trial_cost < cost && trial_invalid <= invalid;

                    records.push(IterationRecord {
                        iteration: progress.accepted + usize::from(success),
                        attempt: progress.attempt,
                        cost: if success { trial_cost } else { cost },
                        trial_cost: Some(trial_cost),
                        lambda: progress.lambda,
                        accepted: success,
                        solver: Some(solver),
                        singular_points: inverses.singular_count(),
                        elapsed_ms: elapsed_ms(start),
                    });

                    if success {
                        let relative_decrease = (cost - trial_cost) / cost;
                        progress.accept(&config);
                        cost = trial_cost;
                        invalid = trial_invalid;
                        residuals = trial;
                        tracing::info!(
                            iteration = progress.accepted,
                            cost,
                            lambda = progress.lambda,
                            solver = %solver,
                            "accepted step"
                        );
                        if let Some(folder) = &config.debug_folder {
                            if let Err(e) =
                                report::write_snapshot(folder, progress.accepted, &problem.export())
                            {
                                tracing::warn!(error = %e, "failed to write debug snapshot");
                            }
                        }

                        if relative_decrease < config.function_tolerance {
                            SolveState::Converged(TerminationReason::FunctionTolerance)
                        } else {
                            evaluation = problem.evaluator().evaluate();
                            SolveState::Evaluating
                        }
                    } else {
                        problem.poses = saved_poses;
                        problem.points = saved_points;
                        tracing::debug!(
                            trial_cost,
                            cost,
                            trial_invalid,
                            lambda = progress.lambda,
                            "rejected step"
                        );
                        progress.reject(&config)
                    }
                }
            }
            SolveState::Converged(_) | SolveState::Failed(_) => break,
        };
    }

    let (termination, failure) = match state {
        SolveState::Converged(reason) => (Some(reason), None),
        SolveState::Failed(reason) => (None, Some(reason)),
        _ => (None, None),
    };
    let summary = SolveSummary {
        strategy: strategy.name().to_string(),
        size,
        threads: problem.thread_num(),
        initial_cost,
        final_cost: cost,
        iterations: progress.accepted,
        rejected_steps: progress.rejected,
        final_lambda: progress.lambda,
        termination,
        failure,
        reprojection: residuals.stats(),
        elapsed: start.elapsed(),
        records,
    };
    problem.finish(residuals, summary.clone());

    match failure {
        Some(reason) => {
            tracing::warn!(
                %reason,
                iterations = summary.iterations,
                final_cost = summary.final_cost,
                "bundle adjustment failed"
            );
            Err(SfmError::SolveFailed {
                reason,
                summary: Box::new(summary),
            })
        }
        None => {
            tracing::info!(
                termination = ?summary.termination,
                iterations = summary.iterations,
                initial_cost = summary.initial_cost,
                final_cost = summary.final_cost,
                "bundle adjustment converged"
            );
            Ok(summary)
        }
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1e3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(BundleAdjustmentConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let config = BundleAdjustmentConfig {
            lambda_increase: 0.5,
            ..BundleAdjustmentConfig::default()
        };
        assert!(matches!(config.validate(), Err(SfmError::InvalidConfig(_))));

        let loss = BundleAdjustmentConfig::default().with_loss(RobustLoss::Huber { mu: -1.0 });
        assert!(loss.validate().is_err());
    }

    #[test]
    fn test_config_json_defaults() {
        let config: BundleAdjustmentConfig =
            serde_json::from_str(r#"{"max_iterations": 5, "linear_solver": "dense"}"#).unwrap();
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.linear_solver, LinearSolverType::Dense);
        assert_eq!(config.initial_lambda, 1e-3);

        let text = serde_json::to_string(&config).unwrap();
        let back: BundleAdjustmentConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_lambda_schedule() {
        let config = BundleAdjustmentConfig::default();
        let mut progress = Progress {
            lambda: 1e-3,
            accepted: 0,
            rejected: 0,
            consecutive_failures: 0,
            attempt: 0,
        };
        assert_eq!(progress.reject(&config), SolveState::Building);
        assert!((progress.lambda - 1e-2).abs() < 1e-15);
        progress.accept(&config);
        progress.accept(&config);
        assert!((progress.lambda - 1e-4).abs() < 1e-18);
        assert_eq!(progress.consecutive_failures, 0);

        progress.lambda = 1e-12;
        progress.accept(&config);
        assert_eq!(progress.lambda, config.min_lambda);

        for _ in 0..config.max_consecutive_failures {
            assert_eq!(progress.reject(&config), SolveState::Building);
        }
        assert_eq!(
            progress.reject(&config),
            SolveState::Failed(FailureReason::ConsecutiveFailures)
        );
    }
}
