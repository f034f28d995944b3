use crate::domain::error::BillingError;
use crate::domain::models::{ChargeId, TransferId};
use crate::domain::money::Piasters;
use crate::domain::time::TimestampMs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeOrigin {
    Manual,
    Transfer(TransferId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charge {
    pub id: ChargeId,
    pub amount: Piasters,
    pub reason: Option<String>,
    pub created_at: TimestampMs,
    pub origin: ChargeOrigin,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChargeTotals {
    pub manual: Piasters,
    pub transferred_in: Piasters,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChargeLedger {
    charges: Vec<Charge>,
}

impl ChargeLedger {
    pub fn from_charges(charges: Vec<Charge>) -> Self {
        Self { charges }
    }

    pub fn charges(&self) -> &[Charge] {
        &self.charges
    }

    /// Manual charges must be positive and within `MAX_AMOUNT`; a transfer may carry zero.
    pub fn add(&mut self, charge: Charge) -> Result<ChargeId, BillingError> {
        match charge.origin {
            ChargeOrigin::Manual => ensure_positive(charge.amount)?,
            ChargeOrigin::Transfer(_) if charge.amount.is_negative() => {
                return Err(BillingError::InvalidAmount(charge.amount.0));
            }
            ChargeOrigin::Transfer(_) => {}
        }
        let id = charge.id;
        self.charges.push(charge);
        Ok(id)
    }

    pub fn edit(
        &mut self,
        id: ChargeId,
        amount: Piasters,
        reason: Option<String>,
    ) -> Result<(), BillingError> {
        ensure_positive(amount)?;
        let charge = self.editable_mut(id)?;
        charge.amount = amount;
        charge.reason = reason;
        Ok(())
    }

    pub fn remove(&mut self, id: ChargeId) -> Result<Charge, BillingError> {
        self.editable_mut(id)?;
        let index = self
            .charges
            .iter()
            .position(|charge| charge.id == id)
            .ok_or(BillingError::ChargeNotFound(id))?;
        Ok(self.charges.remove(index))
    }

    pub fn totals(&self) -> ChargeTotals {
        self.charges
            .iter()
            .fold(ChargeTotals::default(), |mut totals, charge| {
                match charge.origin {
                    ChargeOrigin::Manual => totals.manual += charge.amount,
                    ChargeOrigin::Transfer(_) => totals.transferred_in += charge.amount,
                }
                totals
            })
    }

    fn editable_mut(&mut self, id: ChargeId) -> Result<&mut Charge, BillingError> {
        let charge = self
            .charges
            .iter_mut()
            .find(|charge| charge.id == id)
            .ok_or(BillingError::ChargeNotFound(id))?;
        if let ChargeOrigin::Transfer(_) = charge.origin {
            return Err(BillingError::ChargeNotEditable(id));
        }
        Ok(charge)
    }
}

fn ensure_positive(amount: Piasters) -> Result<(), BillingError> {
    if amount.is_positive() && !amount.exceeds_limit() {
        Ok(())
    } else {
        Err(BillingError::InvalidAmount(amount.0))
    }
}

#[cfg(test)]
mod tests {
    use super::{Charge, ChargeLedger, ChargeOrigin};
    use crate::domain::error::BillingError;
    use crate::domain::models::{ChargeId, TransferId};
    use crate::domain::money::{MAX_AMOUNT, Piasters};
    use crate::domain::time::TimestampMs;

    fn manual(id: i64, amount: i64) -> Charge {
        Charge {
            id: ChargeId(id),
            amount: Piasters(amount),
            reason: Some("extra controller".to_string()),
            created_at: TimestampMs(0),
            origin: ChargeOrigin::Manual,
        }
    }

    #[test]
    fn adds_edits_and_removes_manual_charges() {
        let mut ledger = ChargeLedger::default();
        ledger.add(manual(1, 500)).expect("add should succeed");
        ledger.add(manual(2, 250)).expect("add should succeed");

        ledger
            .edit(ChargeId(1), Piasters(700), None)
            .expect("edit should succeed");
        let removed = ledger.remove(ChargeId(2)).expect("remove should succeed");

        assert_eq!(removed.amount, Piasters(250));
        assert_eq!(ledger.charges().len(), 1);
        assert_eq!(ledger.charges()[0].amount, Piasters(700));
        assert_eq!(ledger.charges()[0].reason, None);
    }

    #[test]
    fn rejects_non_positive_amounts() {
        let mut ledger = ChargeLedger::default();
        assert_eq!(
            ledger.add(manual(1, 0)),
            Err(BillingError::InvalidAmount(0))
        );
        ledger.add(manual(2, 100)).expect("add should succeed");
        assert_eq!(
            ledger.edit(ChargeId(2), Piasters(-5), None),
            Err(BillingError::InvalidAmount(-5))
        );
        assert_eq!(ledger.charges()[0].amount, Piasters(100));
    }

    #[test]
    fn rejects_amounts_above_the_limit() {
        let mut ledger = ChargeLedger::default();
        let huge = MAX_AMOUNT.0 + 1;
        assert_eq!(
            ledger.add(manual(1, huge)),
            Err(BillingError::InvalidAmount(huge))
        );
        ledger.add(manual(2, MAX_AMOUNT.0)).expect("limit itself is accepted");
        assert_eq!(
            ledger.edit(ChargeId(2), Piasters(i64::MAX), None),
            Err(BillingError::InvalidAmount(i64::MAX))
        );
        assert_eq!(ledger.totals().manual, MAX_AMOUNT);
    }

    #[test]
    fn transfer_charges_are_locked() {
        let mut ledger = ChargeLedger::default();
        ledger
            .add(Charge {
                origin: ChargeOrigin::Transfer(TransferId(8)),
                ..manual(4, 1500)
            })
            .expect("add should succeed");

        assert_eq!(
            ledger.remove(ChargeId(4)),
            Err(BillingError::ChargeNotEditable(ChargeId(4)))
        );
        assert_eq!(
            ledger.edit(ChargeId(4), Piasters(1), None),
            Err(BillingError::ChargeNotEditable(ChargeId(4)))
        );
    }

    #[test]
    fn totals_split_manual_and_transferred_amounts() {
        let mut ledger = ChargeLedger::default();
        ledger.add(manual(1, 500)).expect("add should succeed");
        ledger
            .add(Charge {
                origin: ChargeOrigin::Transfer(TransferId(1)),
                ..manual(2, 1200)
            })
            .expect("add should succeed");

        let totals = ledger.totals();
        assert_eq!(totals.manual, Piasters(500));
        assert_eq!(totals.transferred_in, Piasters(1200));
    }

    #[test]
    fn unknown_charge_is_reported() {
        let mut ledger = ChargeLedger::default();
        assert_eq!(
            ledger.remove(ChargeId(42)),
            Err(BillingError::ChargeNotFound(ChargeId(42)))
        );
    }
}
