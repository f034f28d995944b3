use crate::domain::error::BillingError;
use crate::domain::models::Station;
use crate::domain::money::Piasters;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BillingMode {
    Single,
    Multi,
}

impl BillingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Multi => "multi",
        }
    }
}

impl std::str::FromStr for BillingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(Self::Single),
            "multi" => Ok(Self::Multi),
            _ => Err(format!("invalid billing mode: {s}")),
        }
    }
}

/// Hourly rates of one station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StationRates {
    pub single_per_hour: Piasters,
    pub multi_per_hour: Option<Piasters>,
}

impl StationRates {
    pub fn new(
        single_per_hour: Piasters,
        multi_per_hour: Option<Piasters>,
    ) -> Result<Self, BillingError> {
        if !single_per_hour.is_positive() || single_per_hour.exceeds_limit() {
            return Err(BillingError::InvalidAmount(single_per_hour.0));
        }
        if let Some(multi) = multi_per_hour
            && (!multi.is_positive() || multi.exceeds_limit())
        {
            return Err(BillingError::InvalidAmount(multi.0));
        }

        Ok(Self {
            single_per_hour,
            multi_per_hour,
        })
    }
}

pub fn rate_for(station: &Station, mode: BillingMode) -> Result<Piasters, BillingError> {
    match mode {
        BillingMode::Single => Ok(station.rates.single_per_hour),
        BillingMode::Multi => station
            .rates
            .multi_per_hour
            .ok_or(BillingError::ModeUnavailable(station.id)),
    }
}

#[cfg(test)]
mod tests {
    use super::{BillingMode, StationRates, rate_for};
    use crate::domain::error::BillingError;
    use crate::domain::models::{Station, StationId, StationStatus};
    use crate::domain::money::{MAX_AMOUNT, Piasters};

    fn station(multi: Option<i64>) -> Station {
        Station {
            id: StationId(3),
            name: "PS-3".to_string(),
            rates: StationRates::new(Piasters(3000), multi.map(Piasters))
                .expect("rates should be valid"),
            status: StationStatus::Available,
            reachable: true,
            network_address: None,
        }
    }

    #[test]
    fn resolves_rate_per_mode() {
        let station = station(Some(4500));
        assert_eq!(rate_for(&station, BillingMode::Single), Ok(Piasters(3000)));
        assert_eq!(rate_for(&station, BillingMode::Multi), Ok(Piasters(4500)));
    }

    #[test]
    fn rejects_multi_mode_without_multi_rate() {
        let station = station(None);
        assert_eq!(
            rate_for(&station, BillingMode::Multi),
            Err(BillingError::ModeUnavailable(StationId(3)))
        );
    }

    #[test]
    fn rejects_non_positive_rates() {
        assert_eq!(
            StationRates::new(Piasters(0), None),
            Err(BillingError::InvalidAmount(0))
        );
        assert_eq!(
            StationRates::new(Piasters(3000), Some(Piasters(-1))),
            Err(BillingError::InvalidAmount(-1))
        );
        assert_eq!(
            StationRates::new(Piasters(MAX_AMOUNT.0 + 1), None),
            Err(BillingError::InvalidAmount(MAX_AMOUNT.0 + 1))
        );
    }

    #[test]
    fn parses_mode_names() {
        assert_eq!("multi".parse::<BillingMode>(), Ok(BillingMode::Multi));
        assert!("duo".parse::<BillingMode>().is_err());
    }
}
