//! Demand-side primitives: per-market share functions, share Jacobians with respect to prices,
//! and the BLP contraction that inverts observed shares into mean utilities.

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

use crate::data::{MarketSegment, ProductData};
use crate::error::{BlpError, Result};
use crate::integration::Agents;
use crate::parameters::Parameters;
use crate::solving::{ContractionOptions, ContractionType, SolverStats};

/// Demand system of a single market, integrated over the shared agents.
///
/// Everything that does not depend on prices is computed once at construction, so repeated share
/// evaluations inside a fixed-point loop only redo the logit probabilities.
#[derive(Clone, Debug)]
pub struct MarketDemand<'a> {
    segment: &'a MarketSegment,
    /// `X1 β + ξ` for each product.
    exogenous_utility: DVector<f64>,
    /// `X2 Σ ν_i` for each product (rows) and agent (columns).
    mu: DMatrix<f64>,
    /// Mean price coefficient.
    alpha: f64,
    /// `α + σ_p ν_{i,K2}` for each agent.
    price_derivatives: DVector<f64>,
    weights: &'a DVector<f64>,
}

impl<'a> MarketDemand<'a> {
    /// Builds the demand system for `segment`. Parameters are assumed validated.
    pub fn new(
        data: &ProductData,
        agents: &'a Agents,
        parameters: &Parameters,
        segment: &'a MarketSegment,
    ) -> Self {
        let start = segment.start;
        let j = segment.product_count();
        let k2 = data.nonlinear_dim();
        let i = agents.agent_count();

        let x1 = data.x1().rows(start, j);
        let xi = data.xi().rows(start, j);
        let exogenous_utility = x1 * &parameters.beta + xi;

        let mu = if k2 == 0 {
            DMatrix::zeros(j, i)
        } else {
            let x2 = data.x2().rows(start, j);
            let nodes = agents.nodes().columns(0, k2);
            x2 * &parameters.sigma * nodes.transpose()
        };

        let price_derivatives = if parameters.has_random_price() {
            agents
                .nodes()
                .column(k2)
                .map(|node| parameters.alpha + parameters.price_sigma * node)
        } else {
            DVector::from_element(i, parameters.alpha)
        };

        Self {
            segment,
            exogenous_utility,
            mu,
            alpha: parameters.alpha,
            price_derivatives,
            weights: agents.weights(),
        }
    }

    /// Identifier of the market.
    pub fn id(&self) -> &str {
        self.segment.id()
    }

    pub fn segment(&self) -> &MarketSegment {
        self.segment
    }

    /// Number of products in the market.
    pub fn product_count(&self) -> usize {
        self.exogenous_utility.len()
    }

    /// Agent price derivatives of utility, `∂u_ij / ∂p_j`.
    pub fn price_derivatives(&self) -> &DVector<f64> {
        &self.price_derivatives
    }

    /// Mean utility `δ = X1 β + α p + ξ` at `prices`.
    pub fn delta(&self, prices: &DVector<f64>) -> DVector<f64> {
        &self.exogenous_utility + prices * self.alpha
    }

    /// Logit choice probabilities (products by agents) at mean utilities `delta`.
    ///
    /// `prices` only matter through the agent-specific deviation of the price coefficient.
    pub fn probabilities_at_delta(
        &self,
        delta: &DVector<f64>,
        prices: &DVector<f64>,
    ) -> Result<DMatrix<f64>> {
        let j = self.product_count();
        let mut probabilities = DMatrix::zeros(j, self.weights.len());

        for (agent, mut column) in probabilities.column_iter_mut().enumerate() {
            let deviation = self.price_derivatives[agent] - self.alpha;
            // Reduce by the largest utility, counting the outside good's zero.
            let mut reduction = 0.0_f64;
            for product in 0..j {
                let utility =
                    delta[product] + self.mu[(product, agent)] + deviation * prices[product];
                column[product] = utility;
                reduction = reduction.max(utility);
            }

            let mut denominator = (-reduction).exp();
            for value in column.iter_mut() {
                *value = (*value - reduction).exp();
                denominator += *value;
            }
            if !denominator.is_finite() || denominator <= 0.0 {
                return Err(BlpError::degenerate(self.id(), "utility exponentiation"));
            }
            column /= denominator;
        }

        Ok(probabilities)
    }

    /// Logit choice probabilities (products by agents) at `prices`.
    pub fn probabilities(&self, prices: &DVector<f64>) -> Result<DMatrix<f64>> {
        self.probabilities_at_delta(&self.delta(prices), prices)
    }

    /// Integrates agent probabilities into market shares.
    pub fn aggregate(&self, probabilities: &DMatrix<f64>) -> DVector<f64> {
        probabilities * self.weights
    }

    /// Market shares at `prices`.
    pub fn shares(&self, prices: &DVector<f64>) -> Result<DVector<f64>> {
        Ok(self.aggregate(&self.probabilities(prices)?))
    }

    /// Decomposes the share Jacobian as `∂s/∂p = diag(Λ) − Γ`.
    ///
    /// Returns the diagonal `Λ_j = Σ_i w_i a_i P_ji` and `Γ = P diag(w ∘ a) Pᵀ`.
    pub fn derivative_components(
        &self,
        probabilities: &DMatrix<f64>,
    ) -> (DVector<f64>, DMatrix<f64>) {
        let weighted_derivatives = self.weights.component_mul(&self.price_derivatives);
        let lambda = probabilities * &weighted_derivatives;
        let mut scaled = probabilities.clone();
        for (agent, mut column) in scaled.column_iter_mut().enumerate() {
            column *= weighted_derivatives[agent];
        }
        let gamma = scaled * probabilities.transpose();
        (lambda, gamma)
    }

    /// Share Jacobian with `[j, k] = ∂s_j / ∂p_k` at `prices`.
    pub fn jacobian(&self, prices: &DVector<f64>) -> Result<DMatrix<f64>> {
        let probabilities = self.probabilities(prices)?;
        let (lambda, gamma) = self.derivative_components(&probabilities);
        Ok(DMatrix::from_diagonal(&lambda) - gamma)
    }
}

/// Computes model-implied shares for every product given mean utilities `delta`.
///
/// Prices are read from `data` when the price coefficient is random.
pub fn predict_shares(
    delta: &DVector<f64>,
    data: &ProductData,
    agents: &Agents,
    parameters: &Parameters,
) -> Result<DVector<f64>> {
    if delta.len() != data.product_count() {
        return Err(BlpError::dimension_mismatch(
            "delta length",
            data.product_count(),
            delta.len(),
        ));
    }
    parameters.validate(data, agents)?;
    let prices = contraction_prices(data, parameters)?;

    let mut predicted = DVector::zeros(delta.len());
    for segment in data.partition().markets() {
        let market = MarketDemand::new(data, agents, parameters, segment);
        let range = segment.range();
        let local_delta = delta.rows(segment.start, range.len()).into_owned();
        let local_prices = prices.rows(segment.start, range.len()).into_owned();
        let shares = market.aggregate(&market.probabilities_at_delta(&local_delta, &local_prices)?);
        predicted.rows_mut(segment.start, range.len()).copy_from(&shares);
    }
    Ok(predicted)
}

/// Solves the BLP fixed point recovering mean utilities `δ` from observed shares.
///
/// Without heterogeneity the logit inversion `δ = ln s − ln s₀` is exact and no iteration runs.
pub fn solve_delta(
    data: &ProductData,
    agents: &Agents,
    parameters: &Parameters,
    options: &ContractionOptions,
) -> Result<(DVector<f64>, SolverStats)> {
    options.iteration.validate()?;
    parameters.validate(data, agents)?;
    let shares = data
        .shares()
        .ok_or_else(|| BlpError::missing_component("shares"))?;
    let prices = contraction_prices(data, parameters)?;
    let homogeneous = data.nonlinear_dim() == 0 && !parameters.has_random_price();

    let results = data.partition().map_markets(options.parallel, |segment| {
        let j = segment.product_count();
        let observed = shares.rows(segment.start, j).into_owned();
        let outside = 1.0 - observed.sum();
        let initial = observed.map(|share| (share / outside).ln());
        if homogeneous {
            let stats = SolverStats {
                converged: true,
                ..SolverStats::default()
            };
            return Ok((initial, stats));
        }

        let market = MarketDemand::new(data, agents, parameters, segment);
        let local_prices = prices.rows(segment.start, j).into_owned();
        contract_market(&market, &observed, &local_prices, initial, options)
    });

    let mut delta = DVector::zeros(data.product_count());
    let mut stats = Vec::with_capacity(results.len());
    for (segment, result) in data.partition().markets().zip(results) {
        let (local, market_stats) = result?;
        delta
            .rows_mut(segment.start, segment.product_count())
            .copy_from(&local);
        stats.push(market_stats);
    }
    Ok((delta, SolverStats::combine(&stats)))
}

fn contract_market(
    market: &MarketDemand<'_>,
    observed: &DVector<f64>,
    prices: &DVector<f64>,
    initial: DVector<f64>,
    options: &ContractionOptions,
) -> Result<(DVector<f64>, SolverStats)> {
    let iteration = &options.iteration;
    let log_observed = observed.map(f64::ln);
    let mut delta = initial;
    let mut stats = SolverStats {
        max_gap: f64::INFINITY,
        ..SolverStats::default()
    };

    while stats.iterations < iteration.max_iterations {
        let predicted = market.aggregate(&market.probabilities_at_delta(&delta, prices)?);
        stats.evaluations += 1;
        if predicted.iter().any(|share| *share < options.minimum_share) {
            return Err(BlpError::degenerate(market.id(), "predicted share underflow"));
        }

        let step = match options.contraction_type {
            ContractionType::Linear => (&log_observed - predicted.map(f64::ln)) * iteration.damping,
            ContractionType::Exponential => {
                // exp(δ) moves a fraction λ of the way toward exp(δ) · s / ŝ.
                let ratios = observed.component_div(&predicted);
                ratios.map(|ratio| (1.0 + iteration.damping * (ratio - 1.0)).ln())
            }
        };
        if step.iter().any(|value| !value.is_finite()) {
            return Err(BlpError::degenerate(market.id(), "contraction update"));
        }

        stats.iterations += 1;
        stats.max_gap = iteration.norm.measure(&step);
        delta += step;
        if stats.max_gap < iteration.tolerance {
            stats.converged = true;
            debug!(
                "market {} delta converged after {} iterations",
                market.id(),
                stats.iterations
            );
            return Ok((delta, stats));
        }
    }

    warn!(
        "market {} delta contraction exhausted {} iterations (gap {})",
        market.id(),
        stats.iterations,
        stats.max_gap
    );
    Err(BlpError::ConvergenceFailure {
        market_id: market.id().to_string(),
        iterations: stats.iterations,
        max_gap: stats.max_gap,
        last_iterate: delta.iter().copied().collect(),
    })
}

/// Prices entering the contraction: observed prices when the price coefficient is random.
fn contraction_prices(data: &ProductData, parameters: &Parameters) -> Result<DVector<f64>> {
    match data.prices() {
        Some(prices) => Ok(prices.clone()),
        None if parameters.has_random_price() => Err(BlpError::missing_component("prices")),
        None => Ok(DVector::zeros(data.product_count())),
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::data::ProductDataBuilder;

    fn logit_data() -> ProductData {
        ProductDataBuilder::new(vec!["m1".to_string(), "m1".to_string()])
            .x1(DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 2.0]))
            .shares(DVector::from_vec(vec![0.2, 0.3]))
            .prices(DVector::from_vec(vec![1.0, 1.5]))
            .build()
            .unwrap()
    }

    /// Without heterogeneity the inversion is the closed-form log share ratio.
    #[test]
    fn contraction_with_zero_sigma_matches_logit() {
        let data = logit_data();
        let agents = Agents::monte_carlo(1, 0, 123).unwrap();
        let parameters = Parameters::logit(DVector::from_vec(vec![0.0, 0.0]), -1.0);

        let (delta, stats) =
            solve_delta(&data, &agents, &parameters, &ContractionOptions::default()).unwrap();
        assert_eq!(stats.iterations, 0);
        assert!(stats.converged);

        let outside = data.outside_share_for_product(0).unwrap();
        assert_relative_eq!(delta[0], (0.2_f64 / outside).ln(), epsilon = 1e-12);
        let predicted = predict_shares(&delta, &data, &agents, &parameters).unwrap();
        assert_relative_eq!(predicted, data.shares().unwrap().clone(), epsilon = 1e-12);
    }

    #[test]
    fn jacobian_matches_logit_formula() {
        let data = logit_data();
        let agents = Agents::product_rule(1, 0).unwrap();
        let parameters = Parameters::logit(DVector::from_vec(vec![0.5, -0.2]), -2.0);
        let segment = &data.partition().segments()[0];
        let market = MarketDemand::new(&data, &agents, &parameters, segment);

        let prices = DVector::from_vec(vec![1.0, 1.2]);
        let shares = market.shares(&prices).unwrap();
        let jacobian = market.jacobian(&prices).unwrap();
        assert_relative_eq!(
            jacobian[(0, 0)],
            -2.0 * shares[0] * (1.0 - shares[0]),
            epsilon = 1e-12
        );
        assert_relative_eq!(jacobian[(0, 1)], 2.0 * shares[0] * shares[1], epsilon = 1e-12);
        assert_relative_eq!(jacobian, jacobian.transpose(), epsilon = 1e-12);
    }

    #[test]
    fn jacobian_matches_finite_differences_with_heterogeneity() {
        let data = ProductDataBuilder::new(vec!["m".to_string(); 3])
            .x1(DMatrix::from_row_slice(3, 1, &[1.0, 1.0, 1.0]))
            .x2(DMatrix::from_row_slice(3, 1, &[0.5, 1.0, 2.0]))
            .build()
            .unwrap();
        let agents = Agents::product_rule(4, 2).unwrap();
        let parameters = Parameters::logit(DVector::from_vec(vec![1.0]), -1.5)
            .with_sigma(DMatrix::from_element(1, 1, 0.8))
            .with_price_sigma(0.3);
        let segment = &data.partition().segments()[0];
        let market = MarketDemand::new(&data, &agents, &parameters, segment);

        let prices = DVector::from_vec(vec![1.0, 1.4, 2.0]);
        let jacobian = market.jacobian(&prices).unwrap();
        let step = 1e-6;
        for k in 0..3 {
            let mut up = prices.clone();
            let mut down = prices.clone();
            up[k] += step;
            down[k] -= step;
            let numeric = (market.shares(&up).unwrap() - market.shares(&down).unwrap()) / (2.0 * step);
            for j in 0..3 {
                assert_relative_eq!(jacobian[(j, k)], numeric[j], epsilon = 1e-7);
            }
        }
    }

    #[test]
    fn heterogeneous_contraction_recovers_mean_utilities() {
        let x1 = DMatrix::from_row_slice(4, 1, &[1.0, 1.0, 1.0, 1.0]);
        let x2 = DMatrix::from_row_slice(4, 1, &[0.2, 1.0, 0.5, 1.5]);
        let prices = DVector::from_vec(vec![1.0, 2.0, 1.5, 2.5]);
        let skeleton = ProductDataBuilder::new(vec![
            "a".to_string(),
            "a".to_string(),
            "b".to_string(),
            "b".to_string(),
        ])
        .x1(x1.clone())
        .x2(x2.clone())
        .build()
        .unwrap();
        let agents = Agents::product_rule(7, 1).unwrap();
        let parameters = Parameters::logit(DVector::from_vec(vec![2.0]), -1.0)
            .with_sigma(DMatrix::from_element(1, 1, 1.5));

        let true_delta = DVector::from_vec(vec![1.0, 0.0, 0.5, -0.5]);
        let shares = predict_shares(&true_delta, &skeleton, &agents, &parameters).unwrap();
        let observed = ProductDataBuilder::new(vec![
            "a".to_string(),
            "a".to_string(),
            "b".to_string(),
            "b".to_string(),
        ])
        .x1(x1)
        .x2(x2)
        .prices(prices)
        .shares(shares)
        .build()
        .unwrap();

        for contraction_type in [ContractionType::Linear, ContractionType::Exponential] {
            let options = ContractionOptions::default()
                .with_contraction_type(contraction_type)
                .with_iteration(crate::solving::IterationOptions::default().with_tolerance(1e-12));
            let (delta, stats) = solve_delta(&observed, &agents, &parameters, &options).unwrap();
            assert!(stats.converged);
            assert!(stats.iterations > 0);
            assert_relative_eq!(delta, true_delta, epsilon = 1e-9);
        }
    }

    #[test]
    fn contraction_budget_exhaustion_reports_failure() {
        let data = ProductDataBuilder::new(vec!["m".to_string(); 2])
            .x1(DMatrix::from_row_slice(2, 1, &[1.0, 1.0]))
            .x2(DMatrix::from_row_slice(2, 1, &[1.0, 3.0]))
            .shares(DVector::from_vec(vec![0.3, 0.1]))
            .build()
            .unwrap();
        let agents = Agents::product_rule(5, 1).unwrap();
        let parameters = Parameters::logit(DVector::from_vec(vec![0.0]), -1.0)
            .with_sigma(DMatrix::from_element(1, 1, 2.0));
        let options = ContractionOptions::default()
            .with_iteration(crate::solving::IterationOptions::default().with_max_iterations(2));

        let error = solve_delta(&data, &agents, &parameters, &options).unwrap_err();
        assert!(error.is_convergence_failure());
    }
}
