use thiserror::Error;

/// Unified error type for `blpsim` operations.
#[derive(Debug, Error)]
pub enum BlpError {
    /// Raised when provided arrays or matrices have incompatible dimensions.
    #[error("dimension mismatch in {context}: expected {expected} but found {found}")]
    DimensionMismatch {
        /// Human-readable context describing the operation.
        context: &'static str,
        /// The required dimension, often the model-implied value.
        expected: usize,
        /// The dimension that was actually supplied.
        found: usize,
    },

    /// Raised when the supplied market ids are not grouped contiguously.
    #[error("market identifiers must appear in contiguous blocks; market `{market_id}` is split")]
    NonContiguousMarket { market_id: String },

    /// Raised when id generation receives an impossible layout.
    #[error("invalid id layout: {reason}")]
    InvalidIds { reason: &'static str },

    /// Raised when product shares are non-positive.
    #[error("product share at index {index} must be positive, found {share}")]
    NonPositiveShare { index: usize, share: f64 },

    /// Raised when the outside good share becomes non-positive.
    #[error("outside share for market `{market_id}` must be positive, found {share}")]
    NonPositiveOutsideShare { market_id: String, share: f64 },

    /// Raised when a normalization or weight vector is invalid.
    #[error("weights must be strictly positive and sum to one (slack {slack})")]
    InvalidWeights { slack: f64 },

    /// Raised when an option lies outside of its admissible range.
    #[error("invalid option: {reason}")]
    InvalidOption { reason: &'static str },

    /// Raised when a fixed-point iteration exhausts its budget.
    #[error(
        "fixed point for market `{market_id}` did not converge after {iterations} iterations; last gap {max_gap}"
    )]
    ConvergenceFailure {
        /// Market whose iteration failed.
        market_id: String,
        /// Number of iterations performed before termination.
        iterations: usize,
        /// Norm of the final update (infinite when no iteration ran).
        max_gap: f64,
        /// Last iterate, so callers may restart from it.
        last_iterate: Vec<f64>,
    },

    /// Raised when the markup term is undefined at the current iterate.
    #[error("numerical degeneracy in market `{market_id}` during {context}")]
    NumericalDegeneracy {
        market_id: String,
        context: &'static str,
    },

    /// Raised when numerical routines produce NaN or infinities outside of a market solve.
    #[error("encountered NaN during {context}")]
    NumericalError { context: &'static str },

    /// Raised when a required component has not been provided to a builder or solver.
    #[error("{component} must be provided before solving the problem")]
    MissingComponent { component: &'static str },

    /// Raised when prices and shares are assigned to data that is already solved.
    #[error("product data already carries equilibrium prices and shares")]
    AlreadySolved,

    /// Raised when log costs meet a non-positive marginal cost.
    #[error("marginal cost of product {index} must be positive under log costs, found {cost}")]
    NonPositiveCosts { index: usize, cost: f64 },
}

impl BlpError {
    /// Helper to format a [`DimensionMismatch`](BlpError::DimensionMismatch) error.
    pub fn dimension_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            found,
        }
    }

    /// Helper for bubbling up missing component errors from builders.
    pub fn missing_component(component: &'static str) -> Self {
        Self::MissingComponent { component }
    }

    /// Helper for per-market degeneracies.
    pub fn degenerate(market_id: &str, context: &'static str) -> Self {
        Self::NumericalDegeneracy {
            market_id: market_id.to_string(),
            context,
        }
    }

    /// Whether the error is a budget exhaustion rather than a hard failure.
    pub fn is_convergence_failure(&self) -> bool {
        matches!(self, Self::ConvergenceFailure { .. })
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, BlpError>;
