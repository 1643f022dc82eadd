//! Simulation of synthetic BLP markets: exogenous characteristics and shocks are drawn once,
//! then prices and shares are replaced by their Bertrand–Nash equilibrium values.

use log::info;
use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::costs::{compute_costs, CostsType};
use crate::data::{ProductData, ProductDataBuilder};
use crate::equilibrium::{Equilibrium, EquilibriumOptions, EquilibriumSolver};
use crate::error::{BlpError, Result};
use crate::ids::IdData;
use crate::integration::Agents;
use crate::parameters::Parameters;

/// Layout of the synthetic product characteristics and shock distribution.
///
/// `X1 = [1, x]`, `X2` selects columns of `X1`, and `X3 = [1, x, w]`, where the exogenous
/// characteristics `x` and cost shifters `w` are uniform on `[0, 1)`. The constant is omitted
/// when `constant` is false.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub constant: bool,
    /// Number of exogenous demand characteristics `x`.
    pub characteristics: usize,
    /// Number of excluded cost shifters `w`.
    pub cost_shifters: usize,
    /// Columns of `X1` that carry random coefficients.
    pub nonlinear_columns: Vec<usize>,
    pub xi_variance: f64,
    pub omega_variance: f64,
    /// Correlation between `ξ` and `ω`.
    pub correlation: f64,
    pub costs_type: CostsType,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            constant: true,
            characteristics: 1,
            cost_shifters: 1,
            nonlinear_columns: Vec::new(),
            xi_variance: 1.0,
            omega_variance: 1.0,
            correlation: 0.9,
            costs_type: CostsType::Linear,
            seed: 0,
        }
    }
}

impl SimulationConfig {
    /// Number of columns in `X1`.
    pub fn linear_dim(&self) -> usize {
        usize::from(self.constant) + self.characteristics
    }

    /// Number of columns in `X3`.
    pub fn cost_dim(&self) -> usize {
        self.linear_dim() + self.cost_shifters
    }

    pub fn validate(&self) -> Result<()> {
        if self.linear_dim() == 0 {
            return Err(BlpError::InvalidOption {
                reason: "X1 needs a constant or at least one characteristic",
            });
        }
        if self
            .nonlinear_columns
            .iter()
            .any(|column| *column >= self.linear_dim())
        {
            return Err(BlpError::InvalidOption {
                reason: "nonlinear columns must index columns of X1",
            });
        }
        if !(self.xi_variance >= 0.0) || !(self.omega_variance >= 0.0) {
            return Err(BlpError::InvalidOption {
                reason: "shock variances must be non-negative",
            });
        }
        if !(self.correlation.abs() <= 1.0) {
            return Err(BlpError::InvalidOption {
                reason: "shock correlation must lie in [-1, 1]",
            });
        }
        Ok(())
    }
}

/// Synthetic markets whose prices and shares are not yet determined.
#[derive(Clone, Debug)]
pub struct Simulation {
    products: ProductData,
    agents: Agents,
    parameters: Parameters,
    costs: DVector<f64>,
    config: SimulationConfig,
}

impl Simulation {
    /// Draws exogenous characteristics and shocks and computes marginal costs.
    pub fn new(
        ids: IdData,
        agents: Agents,
        parameters: Parameters,
        config: SimulationConfig,
    ) -> Result<Self> {
        config.validate()?;
        let n = ids.product_count();
        let mut rng = SmallRng::seed_from_u64(config.seed);

        let x = DMatrix::from_fn(n, config.characteristics, |_, _| rng.gen::<f64>());
        let w = DMatrix::from_fn(n, config.cost_shifters, |_, _| rng.gen::<f64>());
        let (xi, omega) = draw_shocks(&mut rng, n, &config);

        let k1 = config.linear_dim();
        let offset = usize::from(config.constant);
        let x1 = DMatrix::from_fn(n, k1, |row, column| {
            if column < offset {
                1.0
            } else {
                x[(row, column - offset)]
            }
        });
        let x2 = x1.select_columns(config.nonlinear_columns.iter());
        let x3 = DMatrix::from_fn(n, config.cost_dim(), |row, column| {
            if column < k1 {
                x1[(row, column)]
            } else {
                w[(row, column - k1)]
            }
        });

        let products = ProductDataBuilder::new(ids.market_ids)
            .firm_ids(ids.firm_ids)
            .x1(x1)
            .x2(x2)
            .x3(x3)
            .xi(xi)
            .omega(omega)
            .build()?;
        parameters.validate(&products, &agents)?;
        let costs = compute_costs(&products, &parameters, config.costs_type)?;

        Ok(Self {
            products,
            agents,
            parameters,
            costs,
            config,
        })
    }

    /// Exogenous product data; prices and shares are unset.
    pub fn products(&self) -> &ProductData {
        &self.products
    }

    pub fn agents(&self) -> &Agents {
        &self.agents
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    /// Marginal costs implied by `X3`, `γ` and `ω`.
    pub fn costs(&self) -> &DVector<f64> {
        &self.costs
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Solves for equilibrium prices and shares in every market.
    pub fn replace_endogenous(&self, options: &EquilibriumOptions) -> Result<SimulationResults> {
        let equilibrium = EquilibriumSolver::new(
            &self.products,
            &self.agents,
            &self.parameters,
            self.costs.clone(),
            options.clone(),
        )?
        .solve()
        .into_equilibrium()?;

        let products = self
            .products
            .clone()
            .with_equilibrium(equilibrium.prices.clone(), equilibrium.shares.clone())?;
        info!(
            "simulated {} products in {} markets",
            products.product_count(),
            products.partition().market_count()
        );

        Ok(SimulationResults {
            products,
            costs: self.costs.clone(),
            equilibrium,
        })
    }
}

/// Draws `(ξ, ω)` from a bivariate normal with the configured variances and correlation.
fn draw_shocks(
    rng: &mut SmallRng,
    n: usize,
    config: &SimulationConfig,
) -> (DVector<f64>, DVector<f64>) {
    let xi_scale = config.xi_variance.sqrt();
    let omega_scale = config.omega_variance.sqrt();
    let residual = (1.0 - config.correlation.powi(2)).sqrt();

    let mut xi = DVector::zeros(n);
    let mut omega = DVector::zeros(n);
    for index in 0..n {
        let first: f64 = StandardNormal.sample(rng);
        let second: f64 = StandardNormal.sample(rng);
        xi[index] = xi_scale * first;
        omega[index] = omega_scale * (config.correlation * first + residual * second);
    }
    (xi, omega)
}

/// Solved simulation.
#[derive(Clone, Debug)]
pub struct SimulationResults {
    products: ProductData,
    costs: DVector<f64>,
    equilibrium: Equilibrium,
}

impl SimulationResults {
    /// Product data with equilibrium prices and shares filled in.
    pub fn product_data(&self) -> &ProductData {
        &self.products
    }

    pub fn into_product_data(self) -> ProductData {
        self.products
    }

    pub fn costs(&self) -> &DVector<f64> {
        &self.costs
    }

    pub fn equilibrium(&self) -> &Equilibrium {
        &self.equilibrium
    }
}
