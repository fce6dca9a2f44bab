//! Solve reports and debug snapshots.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use sba_optimize::LinearSolverType;
use serde::{Deserialize, Serialize};

use crate::bundle_adjustment::SolveSummary;
use crate::bundle_block::BundleBlock;
use crate::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemSize {
    pub poses: usize,
    pub points: usize,
    pub groups: usize,
    pub projections: usize,
    pub max_degree: usize,
}

/// One attempted step of the update loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// Accepted iterations so far, including this step when accepted.
    pub iteration: usize,
    pub attempt: usize,
    /// Cost after the accept/reject decision.
    pub cost: f64,
    /// Cost at the trial parameters; `None` when the linear solve failed.
    pub trial_cost: Option<f64>,
    pub lambda: f64,
    pub accepted: bool,
    pub solver: Option<LinearSolverType>,
    pub singular_points: usize,
    pub elapsed_ms: f64,
}

pub fn render(summary: &SolveSummary) -> String {
    summary.to_string()
}

impl fmt::Display for SolveSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = &self.size;
        writeln!(f, "Bundle adjustment report")?;
        writeln!(f, "strategy:     {}", self.strategy)?;
        writeln!(
            f,
            "problem:      {} poses, {} points, {} groups, {} projections, max degree {}",
            size.poses, size.points, size.groups, size.projections, size.max_degree
        )?;
        writeln!(f, "threads:      {}", self.threads)?;
        writeln!(f, "initial cost: {:.6e}", self.initial_cost)?;
        writeln!(f, "final cost:   {:.6e}", self.final_cost)?;
        writeln!(
            f,
            "iterations:   {} accepted, {} rejected",
            self.iterations, self.rejected_steps
        )?;
        match (&self.termination, &self.failure) {
            (_, Some(reason)) => writeln!(f, "status:       failed ({reason})")?,
            (Some(reason), None) => writeln!(f, "status:       converged ({reason})")?,
            (None, None) => writeln!(f, "status:       unknown")?,
        }
        writeln!(
            f,
            "reprojection: mean {:.6} px, median {:.6} px, max {:.6} px",
            self.reprojection.mean, self.reprojection.median, self.reprojection.max
        )?;
        writeln!(f, "elapsed:      {:.3} s", self.elapsed.as_secs_f64())?;
        writeln!(f)?;
        writeln!(
            f,
            "{:>6} {:>8} {:>14} {:>14} {:>10} {:>9} {:>10} {:>9} {:>10}",
            "iter", "attempt", "cost", "trial cost", "lambda", "accepted", "solver", "singular", "time(ms)"
        )?;
        for r in &self.records {
            let trial = r
                .trial_cost
                .map(|c| format!("{c:.6e}"))
                .unwrap_or_else(|| "-".to_string());
            let solver = r
                .solver
                .map(|s| s.to_string())
                .unwrap_or_else(|| "failed".to_string());
            writeln!(
                f,
                "{:>6} {:>8} {:>14.6e} {:>14} {:>10.2e} {:>9} {:>10} {:>9} {:>10.2}",
                r.iteration,
                r.attempt,
                r.cost,
                trial,
                r.lambda,
                if r.accepted { "yes" } else { "no" },
                solver,
                r.singular_points,
                r.elapsed_ms
            )?;
        }
        Ok(())
    }
}

pub fn save_report<P: AsRef<Path>>(path: P, summary: &SolveSummary) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, render(summary))?;
    tracing::info!(path = %path.display(), "saved bundle adjustment report");
    Ok(())
}

/// Write the model after `iteration` as `iteration_NNNN.json` inside `folder`.
pub fn write_snapshot(folder: &Path, iteration: usize, block: &BundleBlock) -> Result<PathBuf> {
    fs::create_dir_all(folder)?;
    let path = folder.join(format!("iteration_{iteration:04}.json"));
    block.save_json(&path)?;
    tracing::debug!(path = %path.display(), "wrote debug snapshot");
    Ok(path)
}
