//! Synthetic market and firm identifiers for simulated product data.

use serde::{Deserialize, Serialize};

use crate::error::{BlpError, Result};

/// Market and firm identifiers for a balanced panel of products.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdData {
    /// Market identifier of each product, grouped contiguously.
    pub market_ids: Vec<String>,
    /// Firm identifier of each product.
    pub firm_ids: Vec<usize>,
}

impl IdData {
    /// Number of products across all markets.
    pub fn product_count(&self) -> usize {
        self.market_ids.len()
    }
}

/// Builds ids for `markets` markets with `products` products each, split across `firms` firms.
///
/// Within each market product `j` belongs to firm `floor(j * firms / products)`, so firms own
/// contiguous, nearly equal blocks of products.
pub fn build_id_data(markets: usize, products: usize, firms: usize) -> Result<IdData> {
    if markets == 0 {
        return Err(BlpError::InvalidIds {
            reason: "at least one market is required",
        });
    }
    if products == 0 {
        return Err(BlpError::InvalidIds {
            reason: "at least one product per market is required",
        });
    }
    if firms == 0 || firms > products {
        return Err(BlpError::InvalidIds {
            reason: "firm count must lie between one and the number of products",
        });
    }

    let total = markets
        .checked_mul(products)
        .ok_or(BlpError::InvalidIds {
            reason: "product count overflows usize",
        })?;
    let mut market_ids = Vec::with_capacity(total);
    let mut firm_ids = Vec::with_capacity(total);
    for t in 0..markets {
        let market_id = t.to_string();
        for j in 0..products {
            market_ids.push(market_id.clone());
            firm_ids.push(j * firms / products);
        }
    }

    Ok(IdData {
        market_ids,
        firm_ids,
    })
}
