use chrono::NaiveDate;
use thiserror::Error;

use crate::pricing::PricingError;

pub type Result<T> = std::result::Result<T, AllocError>;

/// Failures surfaced to the caller. Each is recoverable at the request level.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AllocError {
    #[error("No interest rate data available for {date}.")]
    NoMarketData { date: NaiveDate },

    #[error("Unable to adjust life table to a life expectancy of {target:.1} years.")]
    LifeTableAdjustment { field: &'static str, target: f64 },

    #[error(
        "Two or more rows of covariance matrix appear equal under scaling. This means asset allocation has no unique solution."
    )]
    IdenticalCovariance,

    #[error("Pricing failed: {0}")]
    Pricing(#[from] PricingError),
}

impl AllocError {
    /// Input field the failure should be attached to, if any.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            AllocError::NoMarketData { .. } => Some("quoteDate"),
            AllocError::LifeTableAdjustment { field, .. } => Some(*field),
            AllocError::IdenticalCovariance | AllocError::Pricing(_) => None,
        }
    }

    /// Attaches a pricing failure to the input that caused it.
    pub fn from_pricing(err: PricingError, life_table_field: &'static str) -> Self {
        match err {
            PricingError::NoData { date, .. } => AllocError::NoMarketData { date },
            PricingError::UnableToAdjust { target, .. } => AllocError::LifeTableAdjustment {
                field: life_table_field,
                target,
            },
        }
    }
}
