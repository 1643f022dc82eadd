//! Bertrand–Nash equilibrium prices via the ζ-markup fixed point of Morrow and Skerlos.
//!
//! Writing the share Jacobian as `∂s/∂p = diag(Λ) − Γ`, the multi-product first-order
//! conditions `s + (O ∘ ∂sᵀ/∂p)(p − c) = 0` rearrange into
//!
//! ```text
//! p = c + ζ(p),    ζ(p) = Λ⁻¹ (O ∘ Γ)ᵀ (p − c) − Λ⁻¹ s
//! ```
//!
//! Iterating on this map converges far more reliably for logit-type demand than iterating on
//! the inverted first-order conditions directly. Markets are independent and solved in parallel.

use std::ops::Range;

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::data::ProductData;
use crate::demand::MarketDemand;
use crate::error::{BlpError, Result};
use crate::integration::Agents;
use crate::ownership::OwnershipStructure;
use crate::parameters::Parameters;
use crate::solving::{IterationOptions, SolverStats};

/// Configuration of the equilibrium pricing solver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EquilibriumOptions {
    /// Stopping rule and damping of the ζ-markup iteration.
    pub iteration: IterationOptions,
    /// Which products are priced jointly.
    pub ownership: OwnershipStructure,
    /// Shares below this bound make the markup undefined.
    pub minimum_share: f64,
    /// Diagonal share derivatives `Λ_j` smaller than this in magnitude make the markup undefined.
    pub minimum_derivative: f64,
    /// Solve markets on the rayon thread pool.
    pub parallel: bool,
}

impl Default for EquilibriumOptions {
    fn default() -> Self {
        Self {
            iteration: IterationOptions::default(),
            ownership: OwnershipStructure::Firms,
            minimum_share: 1e-300,
            minimum_derivative: 1e-300,
            parallel: true,
        }
    }
}

impl EquilibriumOptions {
    pub fn with_iteration(mut self, iteration: IterationOptions) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn with_ownership(mut self, ownership: OwnershipStructure) -> Self {
        self.ownership = ownership;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_minimum_share(mut self, minimum_share: f64) -> Self {
        self.minimum_share = minimum_share;
        self
    }

    pub fn with_minimum_derivative(mut self, minimum_derivative: f64) -> Self {
        self.minimum_derivative = minimum_derivative;
        self
    }

    /// Convenience for overriding only the iteration budget.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.iteration.max_iterations = max_iterations;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.iteration.validate()?;
        if !(self.minimum_share >= 0.0) || !(self.minimum_derivative >= 0.0) {
            return Err(BlpError::InvalidOption {
                reason: "share and derivative floors must be non-negative",
            });
        }
        Ok(())
    }
}

/// Lifecycle of a single market's price fixed point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketStatus {
    Unsolved,
    Iterating,
    Converged,
    Failed,
}

impl MarketStatus {
    /// Whether no further iterations can change the outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Converged | Self::Failed)
    }
}

/// Equilibrium of one market.
#[derive(Clone, Debug)]
pub struct MarketEquilibrium {
    pub market_id: String,
    /// Product indices of this market in the flattened data.
    pub range: Range<usize>,
    pub prices: DVector<f64>,
    pub shares: DVector<f64>,
    /// ζ markups at the fixed point, `p − c` up to the tolerance.
    pub markups: DVector<f64>,
    pub stats: SolverStats,
}

/// The ζ-markup iteration for one market, advanced one step at a time.
#[derive(Debug)]
pub struct ZetaIteration<'m, 'a> {
    market: &'m MarketDemand<'a>,
    costs: DVector<f64>,
    ownership: DMatrix<f64>,
    options: &'m EquilibriumOptions,
    prices: DVector<f64>,
    status: MarketStatus,
    stats: SolverStats,
}

impl<'m, 'a> ZetaIteration<'m, 'a> {
    /// Prepares an iteration starting from `initial_prices`.
    pub fn new(
        market: &'m MarketDemand<'a>,
        costs: DVector<f64>,
        ownership: DMatrix<f64>,
        initial_prices: DVector<f64>,
        options: &'m EquilibriumOptions,
    ) -> Result<Self> {
        let j = market.product_count();
        if costs.len() != j {
            return Err(BlpError::dimension_mismatch("market costs", j, costs.len()));
        }
        if ownership.nrows() != j || ownership.ncols() != j {
            return Err(BlpError::dimension_mismatch(
                "ownership matrix",
                j,
                ownership.nrows(),
            ));
        }
        if initial_prices.len() != j {
            return Err(BlpError::dimension_mismatch(
                "initial prices",
                j,
                initial_prices.len(),
            ));
        }
        Ok(Self {
            market,
            costs,
            ownership,
            options,
            prices: initial_prices,
            status: MarketStatus::Unsolved,
            stats: SolverStats {
                max_gap: f64::INFINITY,
                ..SolverStats::default()
            },
        })
    }

    pub fn status(&self) -> MarketStatus {
        self.status
    }

    /// Current price iterate.
    pub fn prices(&self) -> &DVector<f64> {
        &self.prices
    }

    pub fn stats(&self) -> &SolverStats {
        &self.stats
    }

    /// Evaluates `ζ(p)` and the shares it was computed from.
    pub fn zeta(&self, prices: &DVector<f64>) -> Result<(DVector<f64>, DVector<f64>)> {
        let probabilities = self.market.probabilities(prices)?;
        let shares = self.checked_shares(self.market.aggregate(&probabilities))?;

        let (lambda, gamma) = self.market.derivative_components(&probabilities);
        if lambda
            .iter()
            .any(|value| !value.is_finite() || value.abs() < self.options.minimum_derivative)
        {
            return Err(BlpError::degenerate(self.market.id(), "share derivative"));
        }

        let margins = prices - &self.costs;
        let tilde = self.ownership.component_mul(&gamma).transpose() * margins;
        let zeta = (tilde - &shares).component_div(&lambda);
        if zeta.iter().any(|value| !value.is_finite()) {
            return Err(BlpError::degenerate(self.market.id(), "zeta markup"));
        }
        Ok((zeta, shares))
    }

    /// Performs one iteration and returns the resulting status.
    ///
    /// Stepping a terminal iteration is a no-op. Exhausting the budget moves the iteration to
    /// `Failed` and reports a [`BlpError::ConvergenceFailure`] carrying the last iterate.
    pub fn step(&mut self) -> Result<MarketStatus> {
        if self.status.is_terminal() {
            return Ok(self.status);
        }
        let options = self.options;
        let iteration = &options.iteration;
        if self.stats.iterations >= iteration.max_iterations {
            self.status = MarketStatus::Failed;
            warn!(
                "market {} prices did not converge after {} iterations (gap {})",
                self.market.id(),
                self.stats.iterations,
                self.stats.max_gap
            );
            return Err(BlpError::ConvergenceFailure {
                market_id: self.market.id().to_string(),
                iterations: self.stats.iterations,
                max_gap: self.stats.max_gap,
                last_iterate: self.prices.iter().copied().collect(),
            });
        }
        self.status = MarketStatus::Iterating;

        let (zeta, _) = match self.zeta(&self.prices) {
            Ok(result) => result,
            Err(error) => {
                self.status = MarketStatus::Failed;
                warn!("market {} failed: {error}", self.market.id());
                return Err(error);
            }
        };
        self.stats.evaluations += 1;

        let target = &self.costs + zeta;
        let step = (target - &self.prices) * iteration.damping;
        self.stats.iterations += 1;
        self.stats.max_gap = iteration.norm.measure(&step);
        self.prices += step;

        if self.stats.max_gap < iteration.tolerance {
            self.status = MarketStatus::Converged;
            self.stats.converged = true;
        }
        Ok(self.status)
    }

    /// Iterates to a terminal state and evaluates shares at the fixed point.
    pub fn run(mut self) -> Result<MarketEquilibrium> {
        while self.step()? != MarketStatus::Converged {}

        let shares = self.checked_shares(self.market.shares(&self.prices)?)?;
        self.stats.evaluations += 1;
        let markups = &self.prices - &self.costs;
        debug!(
            "market {} converged after {} iterations and {} share evaluations",
            self.market.id(),
            self.stats.iterations,
            self.stats.evaluations
        );

        Ok(MarketEquilibrium {
            market_id: self.market.id().to_string(),
            range: self.market.segment().range(),
            prices: self.prices,
            shares,
            markups,
            stats: self.stats,
        })
    }

    fn checked_shares(&self, shares: DVector<f64>) -> Result<DVector<f64>> {
        if shares
            .iter()
            .any(|share| !share.is_finite() || *share < self.options.minimum_share)
        {
            return Err(BlpError::degenerate(self.market.id(), "share collapse"));
        }
        if 1.0 - shares.sum() <= 0.0 {
            return Err(BlpError::degenerate(
                self.market.id(),
                "outside share collapse",
            ));
        }
        Ok(shares)
    }
}

/// Solves one market from `initial_prices`.
pub fn solve_market(
    market: &MarketDemand<'_>,
    costs: DVector<f64>,
    ownership: DMatrix<f64>,
    initial_prices: DVector<f64>,
    options: &EquilibriumOptions,
) -> Result<MarketEquilibrium> {
    ZetaIteration::new(market, costs, ownership, initial_prices, options)?.run()
}

/// Equilibrium pricing problem over every market of a product data set.
#[derive(Clone, Debug)]
pub struct EquilibriumSolver<'a> {
    data: &'a ProductData,
    agents: &'a Agents,
    parameters: &'a Parameters,
    costs: DVector<f64>,
    firm_ids: Vec<usize>,
    initial_prices: Option<DVector<f64>>,
    options: EquilibriumOptions,
}

impl<'a> EquilibriumSolver<'a> {
    /// Validates the inputs of an equilibrium problem with marginal `costs`.
    pub fn new(
        data: &'a ProductData,
        agents: &'a Agents,
        parameters: &'a Parameters,
        costs: DVector<f64>,
        options: EquilibriumOptions,
    ) -> Result<Self> {
        options.validate()?;
        parameters.validate(data, agents)?;
        if costs.len() != data.product_count() {
            return Err(BlpError::dimension_mismatch(
                "costs length",
                data.product_count(),
                costs.len(),
            ));
        }
        if costs.iter().any(|cost| !cost.is_finite()) {
            return Err(BlpError::NumericalError {
                context: "marginal costs",
            });
        }
        Ok(Self {
            data,
            agents,
            parameters,
            costs,
            firm_ids: data.firm_ids().to_vec(),
            initial_prices: None,
            options,
        })
    }

    /// Replaces the firm ids used for ownership, e.g. to simulate a merger.
    pub fn with_firm_ids(mut self, firm_ids: Vec<usize>) -> Result<Self> {
        if firm_ids.len() != self.data.product_count() {
            return Err(BlpError::dimension_mismatch(
                "firm ids length",
                self.data.product_count(),
                firm_ids.len(),
            ));
        }
        self.firm_ids = firm_ids;
        Ok(self)
    }

    /// Starts the iteration from `prices` instead of marginal costs.
    pub fn with_initial_prices(mut self, prices: DVector<f64>) -> Result<Self> {
        if prices.len() != self.data.product_count() {
            return Err(BlpError::dimension_mismatch(
                "initial prices length",
                self.data.product_count(),
                prices.len(),
            ));
        }
        self.initial_prices = Some(prices);
        Ok(self)
    }

    pub fn costs(&self) -> &DVector<f64> {
        &self.costs
    }

    /// Solves every market independently; one outcome per market, in market order.
    pub fn solve(&self) -> EquilibriumReport {
        let initial = self.initial_prices.as_ref().unwrap_or(&self.costs);
        let outcomes = self
            .data
            .partition()
            .map_markets(self.options.parallel, |segment| {
                let j = segment.product_count();
                let market = MarketDemand::new(self.data, self.agents, self.parameters, segment);
                let ownership = self
                    .options
                    .ownership
                    .matrix(&self.firm_ids[segment.range()]);
                solve_market(
                    &market,
                    self.costs.rows(segment.start, j).into_owned(),
                    ownership,
                    initial.rows(segment.start, j).into_owned(),
                    &self.options,
                )
            });

        EquilibriumReport {
            product_count: self.data.product_count(),
            outcomes,
        }
    }
}

/// Per-market outcomes of [`EquilibriumSolver::solve`].
#[derive(Debug)]
pub struct EquilibriumReport {
    product_count: usize,
    outcomes: Vec<Result<MarketEquilibrium>>,
}

impl EquilibriumReport {
    pub fn outcomes(&self) -> &[Result<MarketEquilibrium>] {
        &self.outcomes
    }

    /// Terminal status of each market.
    pub fn statuses(&self) -> Vec<MarketStatus> {
        self.outcomes
            .iter()
            .map(|outcome| match outcome {
                Ok(_) => MarketStatus::Converged,
                Err(_) => MarketStatus::Failed,
            })
            .collect()
    }

    /// Whether every market converged.
    pub fn all_converged(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.is_ok())
    }

    /// Assembles flat prices and shares, surfacing the first failed market.
    pub fn into_equilibrium(self) -> Result<Equilibrium> {
        let mut prices = DVector::zeros(self.product_count);
        let mut shares = DVector::zeros(self.product_count);
        let mut markups = DVector::zeros(self.product_count);
        let mut market_stats = Vec::with_capacity(self.outcomes.len());

        for outcome in self.outcomes {
            let market = outcome?;
            let (start, j) = (market.range.start, market.range.len());
            prices.rows_mut(start, j).copy_from(&market.prices);
            shares.rows_mut(start, j).copy_from(&market.shares);
            markups.rows_mut(start, j).copy_from(&market.markups);
            market_stats.push(market.stats);
        }

        let stats = SolverStats::combine(&market_stats);
        info!(
            "equilibrium solved for {} markets ({} iterations, {} share evaluations)",
            market_stats.len(),
            stats.iterations,
            stats.evaluations
        );
        Ok(Equilibrium {
            prices,
            shares,
            markups,
            stats,
            market_stats,
        })
    }
}

/// Flattened equilibrium across all markets.
#[derive(Clone, Debug)]
pub struct Equilibrium {
    pub prices: DVector<f64>,
    pub shares: DVector<f64>,
    pub markups: DVector<f64>,
    /// Totals across markets.
    pub stats: SolverStats,
    pub market_stats: Vec<SolverStats>,
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::data::ProductDataBuilder;

    fn duopoly() -> (ProductData, Agents, Parameters) {
        let data = ProductDataBuilder::new(vec!["m".to_string(); 2])
            .firm_ids(vec![0, 1])
            .x1(DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 1.0, 1.0]))
            .build()
            .unwrap();
        let agents = Agents::product_rule(1, 0).unwrap();
        let parameters = Parameters::logit(DVector::from_vec(vec![1.0, 1.0]), -1.0);
        (data, agents, parameters)
    }

    #[test]
    fn iteration_walks_through_lifecycle() {
        let (data, agents, parameters) = duopoly();
        let segment = &data.partition().segments()[0];
        let market = MarketDemand::new(&data, &agents, &parameters, segment);
        let options = EquilibriumOptions::default();
        let costs = DVector::from_vec(vec![1.0, 1.0]);

        let mut iteration = ZetaIteration::new(
            &market,
            costs.clone(),
            DMatrix::identity(2, 2),
            costs,
            &options,
        )
        .unwrap();
        assert_eq!(iteration.status(), MarketStatus::Unsolved);
        assert_eq!(iteration.step().unwrap(), MarketStatus::Iterating);
        while !iteration.status().is_terminal() {
            iteration.step().unwrap();
        }
        assert_eq!(iteration.status(), MarketStatus::Converged);
        assert_eq!(iteration.step().unwrap(), MarketStatus::Converged);
    }

    #[test]
    fn equilibrium_satisfies_first_order_conditions() {
        let (data, agents, parameters) = duopoly();
        let costs = DVector::from_vec(vec![0.5, 0.8]);
        let solver = EquilibriumSolver::new(
            &data,
            &agents,
            &parameters,
            costs.clone(),
            EquilibriumOptions::default(),
        )
        .unwrap();
        let equilibrium = solver.solve().into_equilibrium().unwrap();

        // Single-product logit firms: p_j − c_j = −1 / (α (1 − s_j)).
        for j in 0..2 {
            let expected = 1.0 / (1.0 - equilibrium.shares[j]);
            assert_relative_eq!(equilibrium.markups[j], expected, epsilon = 1e-9);
        }

        let segment = &data.partition().segments()[0];
        let market = MarketDemand::new(&data, &agents, &parameters, segment);
        let jacobian = market.jacobian(&equilibrium.prices).unwrap();
        let foc = &equilibrium.shares
            + jacobian.transpose().component_mul(&DMatrix::identity(2, 2))
                * (&equilibrium.prices - &costs);
        assert!(foc.amax() < 1e-9);
    }

    #[test]
    fn joint_ownership_raises_prices() {
        let (data, agents, parameters) = duopoly();
        let costs = DVector::from_vec(vec![1.0, 1.0]);
        let competitive = EquilibriumSolver::new(
            &data,
            &agents,
            &parameters,
            costs.clone(),
            EquilibriumOptions::default(),
        )
        .unwrap()
        .solve()
        .into_equilibrium()
        .unwrap();
        let merged = EquilibriumSolver::new(
            &data,
            &agents,
            &parameters,
            costs,
            EquilibriumOptions::default().with_ownership(OwnershipStructure::Monopoly),
        )
        .unwrap()
        .solve()
        .into_equilibrium()
        .unwrap();

        for j in 0..2 {
            assert!(merged.prices[j] > competitive.prices[j]);
        }
        // Multi-product logit markups are equal across a firm's products.
        assert_relative_eq!(merged.markups[0], merged.markups[1], epsilon = 1e-9);
    }

    #[test]
    fn damped_and_euclidean_iteration_reach_same_prices() {
        let (data, agents, parameters) = duopoly();
        let costs = DVector::from_vec(vec![1.0, 1.5]);
        let solve = |iteration: IterationOptions| {
            EquilibriumSolver::new(
                &data,
                &agents,
                &parameters,
                costs.clone(),
                EquilibriumOptions::default()
                    .with_iteration(iteration)
                    .with_parallel(false),
            )
            .unwrap()
            .solve()
            .into_equilibrium()
            .unwrap()
        };

        let undamped = solve(IterationOptions::default());
        let damped = solve(
            IterationOptions::default()
                .with_damping(0.5)
                .with_norm(crate::solving::Norm::Euclidean),
        );
        assert_relative_eq!(undamped.prices, damped.prices, epsilon = 1e-9);
        assert!(damped.stats.iterations > undamped.stats.iterations);
    }

    #[test]
    fn vanishing_shares_are_degenerate() {
        let (data, agents, parameters) = duopoly();
        let costs = DVector::from_vec(vec![1.0e4, 1.0]);
        let report = EquilibriumSolver::new(
            &data,
            &agents,
            &parameters,
            costs,
            EquilibriumOptions::default(),
        )
        .unwrap()
        .solve();

        assert_eq!(report.statuses(), vec![MarketStatus::Failed]);
        assert!(matches!(
            report.into_equilibrium(),
            Err(BlpError::NumericalDegeneracy { .. })
        ));
    }

    #[test]
    fn share_floor_flags_small_shares() {
        let (data, agents, parameters) = duopoly();
        let costs = DVector::from_vec(vec![1.0, 1.0]);
        let solve = |options: EquilibriumOptions| {
            EquilibriumSolver::new(&data, &agents, &parameters, costs.clone(), options)
                .unwrap()
                .solve()
                .into_equilibrium()
        };

        assert!(solve(EquilibriumOptions::default().with_minimum_share(1e-6)).is_ok());
        match solve(EquilibriumOptions::default().with_minimum_share(0.5)) {
            Err(BlpError::NumericalDegeneracy { context, .. }) => {
                assert_eq!(context, "share collapse")
            }
            other => panic!("expected a degeneracy, got {other:?}"),
        }
        assert!(matches!(
            EquilibriumOptions::default()
                .with_minimum_derivative(-1.0)
                .validate(),
            Err(BlpError::InvalidOption { .. })
        ));
    }

    #[test]
    fn derivative_floor_flags_flat_demand() {
        let (data, agents, parameters) = duopoly();
        let costs = DVector::from_vec(vec![1.0, 1.0]);
        let report = EquilibriumSolver::new(
            &data,
            &agents,
            &parameters,
            costs,
            EquilibriumOptions::default().with_minimum_derivative(10.0),
        )
        .unwrap()
        .solve();

        match report.into_equilibrium() {
            Err(BlpError::NumericalDegeneracy { context, .. }) => {
                assert_eq!(context, "share derivative")
            }
            other => panic!("expected a degeneracy, got {other:?}"),
        }
    }
}
