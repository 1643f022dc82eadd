//! Simulation of Berry–Levinsohn–Pakes (BLP) demand-and-supply markets.
//!
//! The crate follows the workflow of a structural IO exercise:
//!
//! - generate market and firm identifiers (`ids` module),
//! - build integration nodes for heterogeneous consumers (`integration` module),
//! - draw exogenous characteristics and shocks (`simulation` module),
//! - solve the ζ-markup fixed point for Bertrand–Nash prices and shares (`equilibrium`), and
//! - invert solved data back into mean utilities (`demand`) and marginal costs (`costs`).
//!
//! Markets are independent, so both the pricing fixed point and the demand contraction run
//! market by market on the rayon thread pool.
//!
//! # Quick start
//!
//! ```no_run
//! use blpsim::equilibrium::EquilibriumOptions;
//! use blpsim::ids::build_id_data;
//! use blpsim::integration::Agents;
//! use blpsim::parameters::Parameters;
//! use blpsim::simulation::{Simulation, SimulationConfig};
//! use nalgebra::{DMatrix, DVector};
//!
//! let ids = build_id_data(50, 20, 10).expect("valid layout");
//! let agents = Agents::product_rule(7, 1).expect("Gauss-Hermite nodes");
//! let parameters = Parameters::logit(DVector::from_vec(vec![1.0, 0.5]), -2.0)
//!     .with_sigma(DMatrix::from_element(1, 1, 1.0))
//!     .with_gamma(DVector::from_vec(vec![1.0, 0.5, 0.5]));
//! let config = SimulationConfig {
//!     nonlinear_columns: vec![1],
//!     ..SimulationConfig::default()
//! };
//!
//! let simulation = Simulation::new(ids, agents, parameters, config).expect("valid simulation");
//! let results = simulation
//!     .replace_endogenous(&EquilibriumOptions::default())
//!     .expect("converged");
//! println!("Prices: {:?}", results.product_data().prices());
//! ```

pub mod costs;
pub mod data;
pub mod demand;
pub mod equilibrium;
pub mod error;
pub mod ids;
pub mod integration;
pub mod ownership;
pub mod parameters;
pub mod simulation;
pub mod solving;

pub use equilibrium::{Equilibrium, EquilibriumOptions, EquilibriumSolver, MarketStatus};
pub use error::{BlpError, Result};
pub use simulation::{Simulation, SimulationConfig, SimulationResults};
pub use solving::{ContractionOptions, IterationOptions, Norm, SolverStats};
