//! Supply side: marginal costs from cost characteristics, and the inversion of observed prices
//! into markups and marginal costs.

use log::warn;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::data::ProductData;
use crate::demand::MarketDemand;
use crate::error::{BlpError, Result};
use crate::integration::Agents;
use crate::ownership::OwnershipStructure;
use crate::parameters::Parameters;

/// Functional form linking cost characteristics to marginal costs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CostsType {
    /// `c = X3 γ + ω`.
    #[default]
    Linear,
    /// `ln c = X3 γ + ω`.
    Log,
}

impl CostsType {
    /// Maps transformed costs `X3 γ + ω` to marginal costs.
    pub fn from_tilde(&self, tilde: f64) -> f64 {
        match self {
            Self::Linear => tilde,
            Self::Log => tilde.exp(),
        }
    }
}

/// Computes marginal costs for every product.
pub fn compute_costs(
    data: &ProductData,
    parameters: &Parameters,
    costs_type: CostsType,
) -> Result<DVector<f64>> {
    if parameters.gamma.len() != data.cost_dim() {
        return Err(BlpError::dimension_mismatch(
            "gamma length",
            data.cost_dim(),
            parameters.gamma.len(),
        ));
    }
    let tilde = data.x3() * &parameters.gamma + data.omega();
    let costs = tilde.map(|value| costs_type.from_tilde(value));
    if costs.iter().any(|cost| !cost.is_finite()) {
        return Err(BlpError::NumericalError {
            context: "marginal cost computation",
        });
    }
    Ok(costs)
}

/// Markups `η = p − c` implied by the first-order conditions at `prices` and `shares`.
///
/// Solves `(O ∘ Jᵀ) η = −s`, where `J[j, k] = ∂s_j / ∂p_k`.
pub fn compute_markups(
    market: &MarketDemand<'_>,
    ownership: &DMatrix<f64>,
    prices: &DVector<f64>,
    shares: &DVector<f64>,
) -> Result<DVector<f64>> {
    let jacobian = market.jacobian(prices)?;
    let capital_delta = ownership.component_mul(&jacobian.transpose());
    let eta = capital_delta
        .lu()
        .solve(&(-shares))
        .ok_or_else(|| BlpError::degenerate(market.id(), "markup system"))?;
    if eta.iter().any(|value| !value.is_finite()) {
        return Err(BlpError::degenerate(market.id(), "markup system"));
    }
    Ok(eta)
}

/// Options for recovering marginal costs from observed prices.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CostRecoveryOptions {
    pub costs_type: CostsType,
    /// Recovered costs are clipped to `[lower, upper]`.
    pub bounds: (f64, f64),
    pub ownership: OwnershipStructure,
}

impl Default for CostRecoveryOptions {
    fn default() -> Self {
        Self {
            costs_type: CostsType::Linear,
            bounds: (f64::NEG_INFINITY, f64::INFINITY),
            ownership: OwnershipStructure::Firms,
        }
    }
}

impl CostRecoveryOptions {
    pub fn with_costs_type(mut self, costs_type: CostsType) -> Self {
        self.costs_type = costs_type;
        self
    }

    pub fn with_bounds(mut self, lower: f64, upper: f64) -> Self {
        self.bounds = (lower, upper);
        self
    }
}

/// Marginal costs recovered from prices, shares and demand.
#[derive(Clone, Debug)]
pub struct RecoveredCosts {
    pub markups: DVector<f64>,
    pub costs: DVector<f64>,
    /// `c` under linear costs, `ln c` under log costs.
    pub tilde_costs: DVector<f64>,
    /// Products whose costs were clipped to the bounds.
    pub clipped: Vec<bool>,
}

/// Recovers marginal costs `c = p − η` from observed prices and shares.
pub fn recover_costs(
    data: &ProductData,
    agents: &Agents,
    parameters: &Parameters,
    options: &CostRecoveryOptions,
) -> Result<RecoveredCosts> {
    parameters.validate(data, agents)?;
    let (lower, upper) = options.bounds;
    if !(lower <= upper) {
        return Err(BlpError::InvalidOption {
            reason: "cost bounds must satisfy lower <= upper",
        });
    }
    let prices = data
        .prices()
        .ok_or_else(|| BlpError::missing_component("prices"))?;
    let shares = data
        .shares()
        .ok_or_else(|| BlpError::missing_component("shares"))?;

    let n = data.product_count();
    let mut markups = DVector::zeros(n);
    for segment in data.partition().markets() {
        let (start, j) = (segment.start, segment.product_count());
        let market = MarketDemand::new(data, agents, parameters, segment);
        let ownership = options
            .ownership
            .matrix(&data.firm_ids()[segment.range()]);
        let eta = compute_markups(
            &market,
            &ownership,
            &prices.rows(start, j).into_owned(),
            &shares.rows(start, j).into_owned(),
        )?;
        markups.rows_mut(start, j).copy_from(&eta);
    }

    let raw = prices - &markups;
    let clipped: Vec<bool> = raw.iter().map(|cost| *cost < lower || *cost > upper).collect();
    let costs = raw.map(|cost| cost.clamp(lower, upper));
    let clipped_count = clipped.iter().filter(|flag| **flag).count();
    if clipped_count > 0 {
        warn!("clipped {clipped_count} marginal costs to [{lower}, {upper}]");
    }

    let tilde_costs = match options.costs_type {
        CostsType::Linear => costs.clone(),
        CostsType::Log => {
            if let Some((index, cost)) = costs.iter().enumerate().find(|(_, cost)| **cost <= 0.0) {
                return Err(BlpError::NonPositiveCosts { index, cost: *cost });
            }
            costs.map(f64::ln)
        }
    };

    Ok(RecoveredCosts {
        markups,
        costs,
        tilde_costs,
        clipped,
    })
}
