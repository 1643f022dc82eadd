//! Structural demand and cost parameters.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::data::ProductData;
use crate::error::{BlpError, Result};
use crate::integration::Agents;

/// Parameters of the random coefficients logit demand and the marginal cost function.
///
/// Utility of agent `i` for product `j` is
/// `X1_j β + (α + σ_p ν_{i,K2}) p_j + ξ_j + X2_j Σ ν_i`, where `ν_i` are agent nodes. The price
/// coefficient only draws on the extra node column when `price_sigma` is non-zero.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    /// Linear taste parameters on `X1`.
    pub beta: DVector<f64>,
    /// Mean price coefficient, negative for downward-sloping demand.
    pub alpha: f64,
    /// Standard deviation of the price coefficient across agents.
    pub price_sigma: f64,
    /// Cholesky root of the covariance of random coefficients on `X2`.
    pub sigma: DMatrix<f64>,
    /// Cost parameters on `X3`.
    pub gamma: DVector<f64>,
}

impl Parameters {
    /// Creates parameters without heterogeneity or cost shifters.
    pub fn logit(beta: DVector<f64>, alpha: f64) -> Self {
        Self {
            beta,
            alpha,
            price_sigma: 0.0,
            sigma: DMatrix::zeros(0, 0),
            gamma: DVector::zeros(0),
        }
    }

    /// Sets the random coefficient matrix on `X2`.
    pub fn with_sigma(mut self, sigma: DMatrix<f64>) -> Self {
        self.sigma = sigma;
        self
    }

    /// Sets the standard deviation of the price coefficient.
    pub fn with_price_sigma(mut self, price_sigma: f64) -> Self {
        self.price_sigma = price_sigma;
        self
    }

    /// Sets the cost parameters.
    pub fn with_gamma(mut self, gamma: DVector<f64>) -> Self {
        self.gamma = gamma;
        self
    }

    /// Whether the price coefficient varies across agents.
    pub fn has_random_price(&self) -> bool {
        self.price_sigma != 0.0
    }

    /// Agent node dimension implied by these parameters.
    pub fn agent_dimension(&self) -> usize {
        self.sigma.nrows() + usize::from(self.has_random_price())
    }

    /// Checks that the parameters conform to the data and agents.
    pub fn validate(&self, data: &ProductData, agents: &Agents) -> Result<()> {
        if self.beta.len() != data.linear_dim() {
            return Err(BlpError::dimension_mismatch(
                "beta length",
                data.linear_dim(),
                self.beta.len(),
            ));
        }
        let k2 = data.nonlinear_dim();
        if self.sigma.nrows() != k2 || self.sigma.ncols() != k2 {
            return Err(BlpError::dimension_mismatch(
                "sigma dimension",
                k2,
                self.sigma.nrows(),
            ));
        }
        if !self.gamma.is_empty() && self.gamma.len() != data.cost_dim() {
            return Err(BlpError::dimension_mismatch(
                "gamma length",
                data.cost_dim(),
                self.gamma.len(),
            ));
        }
        if agents.dimension() != self.agent_dimension() {
            return Err(BlpError::dimension_mismatch(
                "agent dimension",
                self.agent_dimension(),
                agents.dimension(),
            ));
        }
        let finite = self.alpha.is_finite()
            && self.price_sigma.is_finite()
            && self.beta.iter().all(|v| v.is_finite())
            && self.sigma.iter().all(|v| v.is_finite())
            && self.gamma.iter().all(|v| v.is_finite());
        if !finite {
            return Err(BlpError::NumericalError {
                context: "parameter validation",
            });
        }
        Ok(())
    }
}
