//! Integration rules for heterogeneous consumer tastes.
//!
//! Agents are weighted nodes drawn from, or approximating, the standard normal distribution of
//! unobserved taste shocks. Monte Carlo draws and Gauss–Hermite product rules are supported.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::error::{BlpError, Result};

/// Declarative choice of integration rule, suitable for configuration files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum IntegrationRule {
    /// Pseudo-random standard normal draws with uniform weights.
    MonteCarlo { size: usize, seed: u64 },
    /// Gauss–Hermite tensor product with `level` nodes per dimension.
    Product { level: usize },
}

impl IntegrationRule {
    /// Builds agents of the requested dimension.
    pub fn build(&self, dimension: usize) -> Result<Agents> {
        match *self {
            Self::MonteCarlo { size, seed } => Agents::monte_carlo(size, dimension, seed),
            Self::Product { level } => Agents::product_rule(level, dimension),
        }
    }
}

/// Weighted integration nodes shared by every market.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Agents {
    nodes: DMatrix<f64>,
    weights: DVector<f64>,
}

impl Agents {
    /// Builds agents from matrices of nodes and weights.
    pub fn new(nodes: DMatrix<f64>, weights: DVector<f64>) -> Result<Self> {
        if nodes.nrows() == 0 {
            return Err(BlpError::dimension_mismatch("agent nodes", 1, 0));
        }
        if nodes.nrows() != weights.len() {
            return Err(BlpError::dimension_mismatch(
                "agent weight length",
                nodes.nrows(),
                weights.len(),
            ));
        }
        for weight in weights.iter() {
            if *weight <= 0.0 || !weight.is_finite() {
                return Err(BlpError::InvalidWeights { slack: *weight });
            }
        }
        let sum: f64 = weights.iter().sum();
        let slack = (sum - 1.0).abs();
        if slack > 1e-8 {
            return Err(BlpError::InvalidWeights { slack });
        }

        Ok(Self { nodes, weights })
    }

    /// Generates standard normal draws with uniform weights.
    pub fn monte_carlo(size: usize, dimension: usize, seed: u64) -> Result<Self> {
        if size == 0 {
            return Err(BlpError::dimension_mismatch("Monte Carlo draws", 1, 0));
        }
        let count = size.checked_mul(dimension).ok_or(BlpError::InvalidOption {
            reason: "Monte Carlo draw count overflows usize",
        })?;
        let mut rng = SmallRng::seed_from_u64(seed);
        let values: Vec<f64> = (0..count)
            .map(|_| StandardNormal.sample(&mut rng))
            .collect();
        let nodes = DMatrix::from_vec(size, dimension, values);
        let weights = DVector::from_element(size, 1.0 / size as f64);
        Self::new(nodes, weights)
    }

    /// Builds a Gauss–Hermite product rule for the standard normal.
    ///
    /// The rule has `level.pow(dimension)` nodes and integrates polynomials of degree up to
    /// `2 * level - 1` exactly in each dimension.
    pub fn product_rule(level: usize, dimension: usize) -> Result<Self> {
        if level == 0 {
            return Err(BlpError::InvalidOption {
                reason: "product rule level must be positive",
            });
        }
        let (nodes_1d, weights_1d) = gauss_hermite(level)?;

        let count = u32::try_from(dimension)
            .ok()
            .and_then(|exponent| level.checked_pow(exponent))
            .ok_or(BlpError::InvalidOption {
                reason: "product rule node count overflows usize",
            })?;
        let mut nodes = DMatrix::zeros(count, dimension);
        let mut weights = DVector::from_element(count, 1.0);
        for row in 0..count {
            // Decode the row index as a base-`level` number, one digit per dimension.
            let mut remainder = row;
            for column in (0..dimension).rev() {
                let digit = remainder % level;
                remainder /= level;
                nodes[(row, column)] = nodes_1d[digit];
                weights[row] *= weights_1d[digit];
            }
        }

        Self::new(nodes, weights)
    }

    /// Number of agents.
    pub fn agent_count(&self) -> usize {
        self.nodes.nrows()
    }

    /// Dimension of the taste shocks.
    pub fn dimension(&self) -> usize {
        self.nodes.ncols()
    }

    /// Returns the node matrix (agents by dimensions).
    pub fn nodes(&self) -> &DMatrix<f64> {
        &self.nodes
    }

    /// Returns the integration weights (normalized to sum to one).
    pub fn weights(&self) -> &DVector<f64> {
        &self.weights
    }
}

/// Nodes and weights of the probabilists' Gauss–Hermite rule via Golub–Welsch.
fn gauss_hermite(level: usize) -> Result<(Vec<f64>, Vec<f64>)> {
    let mut jacobi = DMatrix::zeros(level, level);
    for k in 1..level {
        let off_diagonal = (k as f64).sqrt();
        jacobi[(k - 1, k)] = off_diagonal;
        jacobi[(k, k - 1)] = off_diagonal;
    }

    let eigen = SymmetricEigen::new(jacobi);
    let mut pairs: Vec<(f64, f64)> = (0..level)
        .map(|i| {
            let first = eigen.eigenvectors[(0, i)];
            (eigen.eigenvalues[i], first * first)
        })
        .collect();
    if pairs.iter().any(|(node, weight)| !node.is_finite() || !weight.is_finite()) {
        return Err(BlpError::NumericalError {
            context: "Gauss-Hermite eigendecomposition",
        });
    }
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    Ok(pairs.into_iter().unzip())
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn monte_carlo_generates_expected_shapes() {
        let agents = Agents::monte_carlo(128, 2, 7).unwrap();
        assert_eq!(agents.agent_count(), 128);
        assert_eq!(agents.dimension(), 2);
        let weights_sum: f64 = agents.weights.iter().sum();
        assert!((weights_sum - 1.0).abs() < 1e-10);
    }

    #[test]
    fn gauss_hermite_matches_normal_moments() {
        let agents = Agents::product_rule(5, 1).unwrap();
        let mut moments = [0.0; 5];
        for (node, weight) in agents.nodes().iter().zip(agents.weights().iter()) {
            for (power, moment) in moments.iter_mut().enumerate() {
                *moment += weight * node.powi(power as i32);
            }
        }
        assert_relative_eq!(moments[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(moments[1], 0.0, epsilon = 1e-12);
        assert_relative_eq!(moments[2], 1.0, epsilon = 1e-10);
        assert_relative_eq!(moments[3], 0.0, epsilon = 1e-10);
        assert_relative_eq!(moments[4], 3.0, epsilon = 1e-9);
    }

    #[test]
    fn product_rule_tensorizes_dimensions() {
        let agents = Agents::product_rule(3, 2).unwrap();
        assert_eq!(agents.agent_count(), 9);
        let cross: f64 = agents
            .nodes()
            .row_iter()
            .zip(agents.weights().iter())
            .map(|(row, weight)| weight * row[0].powi(2) * row[1].powi(2))
            .sum();
        assert_relative_eq!(cross, 1.0, epsilon = 1e-10);
    }

    #[test]
    fn zero_dimensional_rule_is_a_single_agent() {
        let agents = IntegrationRule::Product { level: 4 }.build(0).unwrap();
        assert_eq!(agents.agent_count(), 1);
        assert_relative_eq!(agents.weights()[0], 1.0);
    }

    #[test]
    fn oversized_rules_are_rejected() {
        assert!(matches!(
            Agents::product_rule(10, 20),
            Err(BlpError::InvalidOption { .. })
        ));
        assert!(matches!(
            Agents::monte_carlo(usize::MAX, 2, 0),
            Err(BlpError::InvalidOption { .. })
        ));
    }

    #[test]
    fn rejects_unnormalized_weights() {
        let nodes = DMatrix::from_row_slice(2, 1, &[-1.0, 1.0]);
        let weights = DVector::from_vec(vec![0.5, 0.6]);
        assert!(matches!(
            Agents::new(nodes, weights),
            Err(BlpError::InvalidWeights { .. })
        ));
    }
}
