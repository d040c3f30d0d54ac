//! Per-transaction fuel accounting

use crate::error::ResourceError;
use serde::{Deserialize, Serialize};

/// Fuel budget of one transaction
///
/// Every storage statement issued on behalf of a contract charges its
/// estimated execution cost here before it runs, so overspend is detected
/// without side effects. `used()` is what the fee settlement bills at the
/// end of a successful call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuelMeter {
    limit: i64,
    balance: i64,
    price: i64,
}

impl FuelMeter {
    pub fn new(limit: i64) -> Self {
        Self {
            limit,
            balance: limit,
            price: 0,
        }
    }

    /// Pick the budget from, in priority order: the per-transaction
    /// override, the ecosystem's configured maximum, the chain default.
    pub fn from_limits(tx_override: Option<i64>, ecosystem_max: Option<i64>, default: i64) -> Self {
        let limit = tx_override
            .filter(|v| *v > 0)
            .or(ecosystem_max.filter(|v| *v > 0))
            .unwrap_or(default);
        Self::new(limit)
    }

    /// Spend `cost` units; fails before any side effect when the balance
    /// would go negative.
    pub fn charge(&mut self, cost: i64) -> Result<(), ResourceError> {
        if cost > self.balance {
            return Err(ResourceError::FuelExhausted {
                needed: cost,
                remaining: self.balance,
            });
        }
        self.balance -= cost;
        Ok(())
    }

    /// Record the contract's custom price, billed on top of metered cost
    pub fn set_price(&mut self, price: i64) {
        self.price = price;
    }

    pub fn price(&self) -> i64 {
        self.price
    }

    pub fn balance(&self) -> i64 {
        self.balance
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    /// Metered fuel actually consumed so far
    pub fn used(&self) -> i64 {
        self.limit - self.balance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_within_budget() {
        let mut meter = FuelMeter::new(100);
        meter.charge(40).unwrap();
        meter.charge(60).unwrap();
        assert_eq!(meter.balance(), 0);
        assert_eq!(meter.used(), 100);
    }

    #[test]
    fn test_charge_over_budget_fails_without_spending() {
        let mut meter = FuelMeter::new(50);
        meter.charge(30).unwrap();
        let err = meter.charge(30);
        assert!(err.is_err());
        assert_eq!(meter.balance(), 20, "failed charge must not spend");
    }

    #[test]
    fn test_used_is_never_negative() {
        let mut meter = FuelMeter::new(10);
        assert_eq!(meter.used(), 0);
        meter.charge(10).unwrap();
        assert!(meter.used() >= 0);
    }

    #[test]
    fn test_limit_priority() {
        assert_eq!(FuelMeter::from_limits(Some(5), Some(7), 9).limit(), 5);
        assert_eq!(FuelMeter::from_limits(None, Some(7), 9).limit(), 7);
        assert_eq!(FuelMeter::from_limits(None, None, 9).limit(), 9);
        assert_eq!(
            FuelMeter::from_limits(Some(0), None, 9).limit(),
            9,
            "zero override is no override"
        );
    }
}
