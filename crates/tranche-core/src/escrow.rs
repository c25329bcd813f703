//! Escrow instruments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::authorization::validate_money;
use crate::condition::{self, Condition, Fulfillment};
use crate::error::Result;

/// Funds held against one milestone, releasable only with the fulfillment
/// matching `condition`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EscrowInstrument {
    pub id: Uuid,
    pub contract_id: Uuid,
    pub milestone_id: Uuid,
    /// Amount in minor currency units.
    pub amount: u64,
    pub currency: String,
    /// Commitment recorded at creation.
    pub condition: Condition,
    pub created_at: DateTime<Utc>,
}

impl EscrowInstrument {
    /// Create an escrow and its sealed fulfillment.
    pub fn create(
        contract_id: Uuid,
        milestone_id: Uuid,
        amount: u64,
        currency: impl Into<String>,
    ) -> Result<(Self, Fulfillment)> {
        let currency = currency.into();
        validate_money(amount, &currency)?;

        let id = Uuid::new_v4();
        let (condition, fulfillment) = condition::generate(id, milestone_id);
        Ok((
            Self {
                id,
                contract_id,
                milestone_id,
                amount,
                currency,
                condition,
                created_at: Utc::now(),
            },
            fulfillment,
        ))
    }

    /// Returns true if `fulfillment` releases this escrow.
    pub fn is_fulfilled_by(&self, fulfillment: &Fulfillment) -> bool {
        condition::validate(&self.condition, fulfillment, self.id, self.milestone_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_binds_fulfillment() {
        let (escrow, fulfillment) =
            EscrowInstrument::create(Uuid::new_v4(), Uuid::new_v4(), 1_000, "USD").unwrap();
        assert!(escrow.is_fulfilled_by(&fulfillment));

        let (other, other_fulfillment) =
            EscrowInstrument::create(escrow.contract_id, escrow.milestone_id, 1_000, "USD")
                .unwrap();
        assert!(!escrow.is_fulfilled_by(&other_fulfillment));
        assert!(!other.is_fulfilled_by(&fulfillment));
    }

    #[test]
    fn test_invalid_amount() {
        assert!(EscrowInstrument::create(Uuid::new_v4(), Uuid::new_v4(), 0, "USD").is_err());
    }
}
