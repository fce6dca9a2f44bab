//! Bundle adjustment by Schur complement
//!
//! A `BaProblem` holds poses, points, intrinsic groups and projections in
//! flat parameter blocks. Each Levenberg-Marquardt iteration evaluates
//! residuals and Jacobians, accumulates the normal equations, eliminates the
//! points into a reduced camera system, solves it and back-substitutes the
//! point updates. The elimination steps are hooks of `SchurStrategy`.

pub mod association;
pub mod bundle_adjustment;
pub mod bundle_block;
pub mod data_block;
pub mod evaluator;
pub mod normal;
pub mod problem;
pub mod report;
pub mod schur;
pub mod strategy;
pub mod synthetic;

pub use association::{Associations, IndexMap};
pub use bundle_adjustment::{
    bundle_adjust, bundle_adjust_with, BundleAdjustmentConfig, FailureReason, SolveState,
    SolveSummary, TerminationReason,
};
pub use bundle_block::{BundleBlock, BundleCamera, BundleGroup, BundleTrack, BundleView};
pub use evaluator::{ReprojectionStats, Residuals};
pub use normal::{Damping, DampingMode};
pub use problem::BaProblem;
pub use report::{IterationRecord, ProblemSize};
pub use strategy::{ClusteredSchur, FixedPoseSchur, SchurStrategy, StandardSchur};

#[derive(Debug, thiserror::Error)]
pub enum SfmError {
    #[error("Invalid problem structure: {0}")]
    InvalidStructure(String),

    #[error("Index out of range: {kind} {index} (size {size})")]
    IndexOutOfRange {
        kind: &'static str,
        index: usize,
        size: usize,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Problem has no projections")]
    EmptyProblem,

    #[error("Problem has not been solved")]
    NotSolved,

    #[error("Solve failed: {reason}")]
    SolveFailed {
        reason: FailureReason,
        summary: Box<SolveSummary>,
    },

    #[error(transparent)]
    Core(#[from] sba_core::Error),

    #[error(transparent)]
    Runtime(#[from] sba_runtime::Error),

    #[error(transparent)]
    Solver(#[from] sba_optimize::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SfmError>;
