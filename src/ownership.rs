//! Ownership matrices that encode which products are priced jointly.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// How firms control products when computing markups.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnershipStructure {
    /// Products sharing a firm id are priced jointly.
    #[default]
    Firms,
    /// A single firm prices every product in the market.
    Monopoly,
    /// Every product is priced by its own firm.
    SingleProduct,
}

impl OwnershipStructure {
    /// Builds the `J × J` ownership matrix for one market's firm ids.
    pub fn matrix(&self, firm_ids: &[usize]) -> DMatrix<f64> {
        let j = firm_ids.len();
        match self {
            Self::Firms => build_ownership(firm_ids),
            Self::Monopoly => DMatrix::from_element(j, j, 1.0),
            Self::SingleProduct => DMatrix::identity(j, j),
        }
    }
}

/// `O[j, k] = 1` when products `j` and `k` belong to the same firm, else `0`.
pub fn build_ownership(firm_ids: &[usize]) -> DMatrix<f64> {
    let j = firm_ids.len();
    DMatrix::from_fn(j, j, |row, col| {
        if firm_ids[row] == firm_ids[col] {
            1.0
        } else {
            0.0
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firm_blocks_are_symmetric() {
        let ownership = build_ownership(&[0, 0, 1]);
        assert_eq!(ownership[(0, 1)], 1.0);
        assert_eq!(ownership[(1, 0)], 1.0);
        assert_eq!(ownership[(0, 2)], 0.0);
        assert_eq!(ownership[(2, 2)], 1.0);
        assert_eq!(ownership, ownership.transpose());
    }

    #[test]
    fn overrides_ignore_firm_ids() {
        let ids = [0, 1, 2];
        assert_eq!(
            OwnershipStructure::Monopoly.matrix(&ids),
            DMatrix::from_element(3, 3, 1.0)
        );
        assert_eq!(
            OwnershipStructure::SingleProduct.matrix(&[4, 4]),
            DMatrix::identity(2, 2)
        );
    }
}
