//! Intrinsic energy charged before any contract code runs.

/// Charged for every external transaction.
pub const TX_BASE_COST: u64 = 21_000;
pub const TX_DATA_ZERO_COST: u64 = 4;
pub const TX_DATA_NONZERO_COST: u64 = 64;

/// The energy an external transaction consumes up front.
///
/// Depends only on the payload; deployments pay for their code through the
/// runtime's deploy cost.
pub fn basic_transaction_cost(data: &[u8]) -> u64 {
    let zeros = data.iter().filter(|byte| **byte == 0).count() as u64;
    let non_zeros = data.len() as u64 - zeros;
    TX_BASE_COST + zeros * TX_DATA_ZERO_COST + non_zeros * TX_DATA_NONZERO_COST
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::CREATE_ENERGY_LIMIT_MIN;

    #[test]
    fn test_basic_cost() {
        assert_eq!(basic_transaction_cost(&[]), 21_000);
        assert_eq!(basic_transaction_cost(&[0, 0, 7]), 21_000 + 8 + 64);
    }

    #[test]
    fn test_minimum_create_limit_covers_intrinsic_cost() {
        let code = [1u8; 64];
        assert!(basic_transaction_cost(&code) < CREATE_ENERGY_LIMIT_MIN);
    }
}
