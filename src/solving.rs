//! Fixed-point iteration configuration and diagnostics shared by the demand contraction and the
//! equilibrium pricing solver.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::{BlpError, Result};

/// Norm used to measure the size of a fixed-point update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Norm {
    /// Maximum absolute element.
    #[default]
    Infinity,
    /// Square root of the sum of squares.
    Euclidean,
}

impl Norm {
    /// Measures `vector` under this norm.
    pub fn measure(&self, vector: &DVector<f64>) -> f64 {
        match self {
            Self::Infinity => vector.amax(),
            Self::Euclidean => vector.norm(),
        }
    }
}

/// Stopping rule and step policy for a fixed-point iteration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IterationOptions {
    /// Convergence tolerance on the norm of the update.
    pub tolerance: f64,
    /// Maximum number of iterations allowed before aborting.
    pub max_iterations: usize,
    /// Norm applied to the update.
    pub norm: Norm,
    /// Fraction of the full update taken each iteration; `1.0` is the undamped map.
    pub damping: f64,
}

impl Default for IterationOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-12,
            max_iterations: 5_000,
            norm: Norm::Infinity,
            damping: 1.0,
        }
    }
}

impl IterationOptions {
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_norm(mut self, norm: Norm) -> Self {
        self.norm = norm;
        self
    }

    pub fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }

    /// Rejects negative tolerances and damping outside `(0, 1]`.
    pub fn validate(&self) -> Result<()> {
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(BlpError::InvalidOption {
                reason: "tolerance must be finite and non-negative",
            });
        }
        if !(self.damping > 0.0 && self.damping <= 1.0) {
            return Err(BlpError::InvalidOption {
                reason: "damping must lie in (0, 1]",
            });
        }
        Ok(())
    }
}

/// Functional form of the BLP demand contraction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractionType {
    /// `δ ← δ + ln s − ln ŝ(δ)`.
    #[default]
    Linear,
    /// `exp(δ) ← exp(δ) · s / ŝ(δ)`, iterating on exponentiated mean utilities.
    Exponential,
}

/// Configuration for the BLP contraction that recovers mean utilities.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContractionOptions {
    pub iteration: IterationOptions,
    pub contraction_type: ContractionType,
    /// Lower bound enforced on predicted shares to avoid taking `ln(0)`.
    pub minimum_share: f64,
    /// Solve markets on the rayon thread pool.
    pub parallel: bool,
}

impl Default for ContractionOptions {
    fn default() -> Self {
        Self {
            iteration: IterationOptions::default().with_tolerance(1e-14),
            contraction_type: ContractionType::Linear,
            minimum_share: 1e-300,
            parallel: true,
        }
    }
}

impl ContractionOptions {
    pub fn with_iteration(mut self, iteration: IterationOptions) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn with_contraction_type(mut self, contraction_type: ContractionType) -> Self {
        self.contraction_type = contraction_type;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}

/// Diagnostics returned alongside a fixed point.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SolverStats {
    /// Whether the tolerance was met.
    pub converged: bool,
    /// Number of iterations performed.
    pub iterations: usize,
    /// Number of share-function evaluations.
    pub evaluations: usize,
    /// Norm of the final update.
    pub max_gap: f64,
}

impl SolverStats {
    /// Aggregates per-market statistics into totals.
    pub fn combine<'a>(stats: impl IntoIterator<Item = &'a SolverStats>) -> SolverStats {
        stats.into_iter().fold(
            SolverStats {
                converged: true,
                ..SolverStats::default()
            },
            |total, market| SolverStats {
                converged: total.converged && market.converged,
                iterations: total.iterations + market.iterations,
                evaluations: total.evaluations + market.evaluations,
                max_gap: total.max_gap.max(market.max_gap),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn norms_measure_updates() {
        let update = DVector::from_vec(vec![3.0, -4.0]);
        assert_eq!(Norm::Infinity.measure(&update), 4.0);
        assert!((Norm::Euclidean.measure(&update) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn damping_must_be_a_fraction() {
        assert!(IterationOptions::default().validate().is_ok());
        assert!(IterationOptions::default()
            .with_damping(0.0)
            .validate()
            .is_err());
        assert!(IterationOptions::default()
            .with_damping(1.5)
            .validate()
            .is_err());
    }

    #[test]
    fn options_round_trip_through_json() {
        let options = ContractionOptions::default()
            .with_contraction_type(ContractionType::Exponential)
            .with_iteration(IterationOptions::default().with_norm(Norm::Euclidean));
        let json = serde_json::to_string(&options).unwrap();
        let restored: ContractionOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, options);
    }
}
