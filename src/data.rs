//! Product-level data containers and validation utilities.
//!
//! All product arrays are flat and index-based; markets are contiguous blocks described by a
//! [`MarketPartition`], so per-market work only ever touches a range of indices.

use std::collections::HashSet;

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::error::{BlpError, Result};

/// Product-level data for a collection of markets.
///
/// Exogenous components (characteristics, shocks, ownership) are fixed at construction. Prices
/// and shares start unset for simulated data and are assigned exactly once, either up front for
/// observed data or via [`ProductData::with_equilibrium`].
#[derive(Clone, Debug)]
pub struct ProductData {
    market_ids: Vec<String>,
    firm_ids: Vec<usize>,
    x1: DMatrix<f64>,
    x2: DMatrix<f64>,
    x3: DMatrix<f64>,
    xi: DVector<f64>,
    omega: DVector<f64>,
    prices: Option<DVector<f64>>,
    shares: Option<DVector<f64>>,
    partition: MarketPartition,
}

impl ProductData {
    /// Number of products across all markets.
    pub fn product_count(&self) -> usize {
        self.market_ids.len()
    }

    /// Number of linear demand characteristics (`X1`).
    pub fn linear_dim(&self) -> usize {
        self.x1.ncols()
    }

    /// Number of nonlinear demand characteristics (`X2`).
    pub fn nonlinear_dim(&self) -> usize {
        self.x2.ncols()
    }

    /// Number of cost characteristics (`X3`).
    pub fn cost_dim(&self) -> usize {
        self.x3.ncols()
    }

    pub fn x1(&self) -> &DMatrix<f64> {
        &self.x1
    }

    pub fn x2(&self) -> &DMatrix<f64> {
        &self.x2
    }

    pub fn x3(&self) -> &DMatrix<f64> {
        &self.x3
    }

    /// Unobserved demand shocks.
    pub fn xi(&self) -> &DVector<f64> {
        &self.xi
    }

    /// Unobserved cost shocks.
    pub fn omega(&self) -> &DVector<f64> {
        &self.omega
    }

    pub fn firm_ids(&self) -> &[usize] {
        &self.firm_ids
    }

    /// Prices, if they have been observed or solved.
    pub fn prices(&self) -> Option<&DVector<f64>> {
        self.prices.as_ref()
    }

    /// Market shares, if they have been observed or solved.
    pub fn shares(&self) -> Option<&DVector<f64>> {
        self.shares.as_ref()
    }

    /// Whether both prices and shares are present.
    pub fn is_solved(&self) -> bool {
        self.prices.is_some() && self.shares.is_some()
    }

    /// Provides access to the precomputed market partition.
    pub fn partition(&self) -> &MarketPartition {
        &self.partition
    }

    /// Returns the market identifier for a given product index.
    pub fn market_id(&self, product_index: usize) -> &str {
        &self.market_ids[product_index]
    }

    /// Returns the outside share for the market containing product `i`, if shares are known.
    pub fn outside_share_for_product(&self, product_index: usize) -> Option<f64> {
        let shares = self.shares.as_ref()?;
        let market = &self.partition.markets[self.partition.market_of(product_index)];
        Some(1.0 - market.range().map(|j| shares[j]).sum::<f64>())
    }

    /// Assigns equilibrium prices and shares, consuming the unsolved data.
    pub fn with_equilibrium(mut self, prices: DVector<f64>, shares: DVector<f64>) -> Result<Self> {
        if self.prices.is_some() || self.shares.is_some() {
            return Err(BlpError::AlreadySolved);
        }
        validate_prices(&prices, self.product_count())?;
        validate_shares(&shares, &self.market_ids, &self.partition)?;
        self.prices = Some(prices);
        self.shares = Some(shares);
        Ok(self)
    }
}

/// Builder that validates dimensions and market structure before constructing [`ProductData`].
#[derive(Debug)]
pub struct ProductDataBuilder {
    market_ids: Vec<String>,
    firm_ids: Option<Vec<usize>>,
    x1: Option<DMatrix<f64>>,
    x2: Option<DMatrix<f64>>,
    x3: Option<DMatrix<f64>>,
    xi: Option<DVector<f64>>,
    omega: Option<DVector<f64>>,
    prices: Option<DVector<f64>>,
    shares: Option<DVector<f64>>,
}

impl ProductDataBuilder {
    /// Start building product data from market identifiers.
    pub fn new(market_ids: Vec<String>) -> Self {
        Self {
            market_ids,
            firm_ids: None,
            x1: None,
            x2: None,
            x3: None,
            xi: None,
            omega: None,
            prices: None,
            shares: None,
        }
    }

    /// Sets firm identifiers. Defaults to one firm per product.
    pub fn firm_ids(mut self, firm_ids: Vec<usize>) -> Self {
        self.firm_ids = Some(firm_ids);
        self
    }

    /// Sets the linear demand characteristics matrix (`X1`), excluding prices.
    pub fn x1(mut self, matrix: DMatrix<f64>) -> Self {
        self.x1 = Some(matrix);
        self
    }

    /// Sets the nonlinear demand characteristics matrix (`X2`).
    pub fn x2(mut self, matrix: DMatrix<f64>) -> Self {
        self.x2 = Some(matrix);
        self
    }

    /// Sets the cost characteristics matrix (`X3`).
    pub fn x3(mut self, matrix: DMatrix<f64>) -> Self {
        self.x3 = Some(matrix);
        self
    }

    /// Sets the demand shocks. Defaults to zero.
    pub fn xi(mut self, xi: DVector<f64>) -> Self {
        self.xi = Some(xi);
        self
    }

    /// Sets the cost shocks. Defaults to zero.
    pub fn omega(mut self, omega: DVector<f64>) -> Self {
        self.omega = Some(omega);
        self
    }

    /// Sets observed prices.
    pub fn prices(mut self, prices: DVector<f64>) -> Self {
        self.prices = Some(prices);
        self
    }

    /// Sets observed market shares.
    pub fn shares(mut self, shares: DVector<f64>) -> Self {
        self.shares = Some(shares);
        self
    }

    /// Finalizes construction after validating shapes and market structure.
    pub fn build(self) -> Result<ProductData> {
        let n = self.market_ids.len();
        if n == 0 {
            return Err(BlpError::dimension_mismatch("product count", 1, 0));
        }

        let firm_ids = self.firm_ids.unwrap_or_else(|| (0..n).collect());
        if firm_ids.len() != n {
            return Err(BlpError::dimension_mismatch(
                "firm ids length",
                n,
                firm_ids.len(),
            ));
        }

        let x1 = self.x1.ok_or_else(|| BlpError::missing_component("X1"))?;
        if x1.nrows() != n {
            return Err(BlpError::dimension_mismatch("X1 rows", n, x1.nrows()));
        }

        let x2 = self.x2.unwrap_or_else(|| DMatrix::zeros(n, 0));
        if x2.nrows() != n {
            return Err(BlpError::dimension_mismatch("X2 rows", n, x2.nrows()));
        }

        let x3 = self.x3.unwrap_or_else(|| DMatrix::zeros(n, 0));
        if x3.nrows() != n {
            return Err(BlpError::dimension_mismatch("X3 rows", n, x3.nrows()));
        }

        let xi = self.xi.unwrap_or_else(|| DVector::zeros(n));
        if xi.len() != n {
            return Err(BlpError::dimension_mismatch("xi length", n, xi.len()));
        }

        let omega = self.omega.unwrap_or_else(|| DVector::zeros(n));
        if omega.len() != n {
            return Err(BlpError::dimension_mismatch("omega length", n, omega.len()));
        }

        let partition = MarketPartition::new(&self.market_ids)?;

        if let Some(prices) = &self.prices {
            validate_prices(prices, n)?;
        }
        if let Some(shares) = &self.shares {
            validate_shares(shares, &self.market_ids, &partition)?;
        }

        Ok(ProductData {
            market_ids: self.market_ids,
            firm_ids,
            x1,
            x2,
            x3,
            xi,
            omega,
            prices: self.prices,
            shares: self.shares,
            partition,
        })
    }
}

fn validate_prices(prices: &DVector<f64>, n: usize) -> Result<()> {
    if prices.len() != n {
        return Err(BlpError::dimension_mismatch("prices length", n, prices.len()));
    }
    if prices.iter().any(|price| !price.is_finite()) {
        return Err(BlpError::NumericalError {
            context: "price validation",
        });
    }
    Ok(())
}

fn validate_shares(
    shares: &DVector<f64>,
    market_ids: &[String],
    partition: &MarketPartition,
) -> Result<()> {
    if shares.len() != market_ids.len() {
        return Err(BlpError::dimension_mismatch(
            "shares length",
            market_ids.len(),
            shares.len(),
        ));
    }
    for (index, share) in shares.iter().enumerate() {
        if !share.is_finite() {
            return Err(BlpError::NumericalError {
                context: "share validation",
            });
        }
        if *share <= 0.0 {
            return Err(BlpError::NonPositiveShare {
                index,
                share: *share,
            });
        }
    }
    for market in partition.markets() {
        let outside_share = 1.0 - market.range().map(|j| shares[j]).sum::<f64>();
        if outside_share <= 0.0 {
            return Err(BlpError::NonPositiveOutsideShare {
                market_id: market.id().to_string(),
                share: outside_share,
            });
        }
    }
    Ok(())
}

/// Describes the markets contained in the product data.
#[derive(Clone, Debug)]
pub struct MarketPartition {
    markets: Vec<MarketSegment>,
    product_to_market: Vec<usize>,
}

impl MarketPartition {
    /// Constructs a partition by scanning contiguous market identifiers.
    fn new(market_ids: &[String]) -> Result<Self> {
        let n = market_ids.len();
        let mut markets = Vec::new();
        let mut product_to_market = vec![0usize; n];
        let mut seen = HashSet::new();

        let mut start = 0usize;
        while start < n {
            let market_id = market_ids[start].clone();
            if !seen.insert(market_id.clone()) {
                return Err(BlpError::NonContiguousMarket { market_id });
            }

            let mut end = start + 1;
            while end < n && market_ids[end] == market_id {
                end += 1;
            }
            for slot in &mut product_to_market[start..end] {
                *slot = markets.len();
            }

            markets.push(MarketSegment {
                market_id,
                start,
                end,
            });
            start = end;
        }

        Ok(Self {
            markets,
            product_to_market,
        })
    }

    /// Returns the number of distinct markets.
    pub fn market_count(&self) -> usize {
        self.markets.len()
    }

    /// Iterates over market segments.
    pub fn markets(&self) -> impl Iterator<Item = &MarketSegment> {
        self.markets.iter()
    }

    /// Slice of all market segments, convenient for parallel iteration.
    pub fn segments(&self) -> &[MarketSegment] {
        &self.markets
    }

    /// Finds the index of the market containing `product_index`.
    pub fn market_of(&self, product_index: usize) -> usize {
        self.product_to_market[product_index]
    }

    /// Applies `f` to every market, on the rayon pool when `parallel` is set.
    ///
    /// Results are returned in market order either way.
    pub fn map_markets<T, F>(&self, parallel: bool, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(&MarketSegment) -> T + Sync + Send,
    {
        if parallel {
            self.markets.par_iter().map(f).collect()
        } else {
            self.markets.iter().map(f).collect()
        }
    }
}

/// Metadata for a single market.
#[derive(Clone, Debug)]
pub struct MarketSegment {
    market_id: String,
    /// Start index (inclusive) of this market in the flattened product arrays.
    pub(crate) start: usize,
    /// End index (exclusive) of this market.
    pub(crate) end: usize,
}

impl MarketSegment {
    /// Returns the identifier of the market.
    pub fn id(&self) -> &str {
        &self.market_id
    }

    /// Returns the range of product indices that belong to this market.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }

    /// Number of products inside the market.
    pub fn product_count(&self) -> usize {
        self.end - self.start
    }
}
