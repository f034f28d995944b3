use crate::domain::error::BillingError;
use crate::domain::models::TransferId;
use crate::domain::money::{Piasters, round_to_nearest};
use crate::domain::time::TimestampMs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosingPolicy {
    Rounded,
    /// Waived; the caller has already confirmed the intent.
    Zero,
    Custom(Piasters),
}

impl ClosingPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rounded => "rounded",
            Self::Zero => "zero",
            Self::Custom(_) => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrueTotal {
    pub gaming: Piasters,
    pub orders: Piasters,
    pub charges: Piasters,
    pub transferred_in: Piasters,
}

impl TrueTotal {
    pub fn total(&self) -> Piasters {
        self.gaming + self.orders + self.charges + self.transferred_in
    }
}

/// Terminal record of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closing {
    pub ended_at: TimestampMs,
    pub policy: ClosingPolicy,
    pub final_amount: Piasters,
    pub true_total: TrueTotal,
    pub transferred_out: Option<TransferId>,
}

pub fn final_amount(
    true_total: &TrueTotal,
    policy: ClosingPolicy,
    rounding_step: Piasters,
) -> Result<Piasters, BillingError> {
    match policy {
        ClosingPolicy::Rounded => Ok(round_to_nearest(true_total.total(), rounding_step)),
        ClosingPolicy::Zero => Ok(Piasters::ZERO),
        ClosingPolicy::Custom(amount) if amount.is_negative() || amount.exceeds_limit() => {
            Err(BillingError::InvalidAmount(amount.0))
        }
        ClosingPolicy::Custom(amount) => Ok(amount),
    }
}
