//! Robust loss functions for outlier-aware reprojection costs
//!
//! Each loss is expressed on the residual norm `r = ‖e‖`. All of them behave
//! like `r²/2` near zero, so `weight(r) = ρ'(r)/r` tends to one and the
//! trivial loss reproduces plain least squares.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RobustLoss {
    /// Plain least squares: ρ(r) = r²/2
    #[default]
    Trivial,
    /// Huber: ρ(r) = { r²/2 if |r| ≤ μ, μ(|r| − μ/2) otherwise }
    Huber { mu: f64 },
    /// Cauchy: ρ(r) = (μ²/2) log(1 + (r/μ)²)
    Cauchy { mu: f64 },
    /// Geman-McClure: ρ(r) = (μ r² / 2) / (μ + r²)
    GemanMcClure { mu: f64 },
    /// Welsch/Leclerc: ρ(r) = (μ/2)(1 − exp(−r²/μ))
    Welsch { mu: f64 },
    /// Tukey/biweight: ρ(r) = { (μ²/6)(1 − (1 − (r/μ)²)³) if |r| ≤ μ, μ²/6 otherwise }
    Tukey { mu: f64 },
    /// Truncated least squares: ρ(r) = { r²/2 if |r| < c, c²/2 otherwise }
    TruncatedLeastSquares { c: f64 },
}

impl RobustLoss {
    pub fn evaluate(&self, residual: f64) -> f64 {
        let r = residual.abs();
        let r2 = r * r;
        match *self {
            RobustLoss::Trivial => 0.5 * r2,
            RobustLoss::Huber { mu } => {
                if r <= mu {
                    0.5 * r2
                } else {
                    mu * (r - 0.5 * mu)
                }
            }
            RobustLoss::Cauchy { mu } => 0.5 * mu * mu * (1.0 + r2 / (mu * mu)).ln(),
            RobustLoss::GemanMcClure { mu } => 0.5 * mu * r2 / (mu + r2),
            RobustLoss::Welsch { mu } => 0.5 * mu * (1.0 - (-r2 / mu).exp()),
            RobustLoss::Tukey { mu } => {
                if r <= mu {
                    let t = 1.0 - r2 / (mu * mu);
                    (mu * mu / 6.0) * (1.0 - t * t * t)
                } else {
                    mu * mu / 6.0
                }
            }
            RobustLoss::TruncatedLeastSquares { c } => {
                if r < c {
                    0.5 * r2
                } else {
                    0.5 * c * c
                }
            }
        }
    }

    /// Weight for iteratively reweighted least squares, `ρ'(r)/r` (1 near zero).
    pub fn weight(&self, residual: f64) -> f64 {
        let r = residual.abs();
        if r < 1e-12 {
            return 1.0;
        }
        let r2 = r * r;

        match *self {
            RobustLoss::Trivial => 1.0,
            RobustLoss::Huber { mu } => {
                if r <= mu {
                    1.0
                } else {
                    mu / r
                }
            }
            RobustLoss::Cauchy { mu } => 1.0 / (1.0 + r2 / (mu * mu)),
            RobustLoss::GemanMcClure { mu } => {
                let s = mu + r2;
                mu * mu / (s * s)
            }
            RobustLoss::Welsch { mu } => (-r2 / mu).exp(),
            RobustLoss::Tukey { mu } => {
                if r <= mu {
                    let t = 1.0 - r2 / (mu * mu);
                    t * t
                } else {
                    0.0
                }
            }
            RobustLoss::TruncatedLeastSquares { c } => {
                if r < c {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    pub fn get_param(&self) -> Option<f64> {
        match *self {
            RobustLoss::Trivial => None,
            RobustLoss::Huber { mu }
            | RobustLoss::Cauchy { mu }
            | RobustLoss::GemanMcClure { mu }
            | RobustLoss::Welsch { mu }
            | RobustLoss::Tukey { mu } => Some(mu),
            RobustLoss::TruncatedLeastSquares { c } => Some(c),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.get_param() {
            Some(p) if !(p.is_finite() && p > 0.0) => Err(Error::InvalidParameter(format!(
                "robust loss scale must be finite and > 0 (got {p})"
            ))),
            _ => Ok(()),
        }
    }
}
