//! Narrow interface to the annuity pricing service.
//!
//! The engine never looks inside a yield curve or a life table; it asks the
//! oracle for handles keyed by quote date and demographics and then asks it to
//! price payment streams built from those handles.

mod reference;

use std::fmt;

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

pub use reference::{ReferenceConfig, ReferenceOracle};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CurveKind {
    Real,
    Nominal,
    /// Zero-rate curve, used to count expected payment years.
    Fixed,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Male,
    Female,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TableKind {
    /// Cohort population mortality.
    Population,
    /// Annuitant mortality with actual-to-expected experience applied.
    Annuitant,
    /// Everyone survives to 120. Cheap stand-in for cash flows that are certain.
    CertainTo120,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LifeTableSpec {
    pub table: TableKind,
    pub sex: Sex,
    pub age: f64,
    /// Remaining life expectancy in years the table must be adjusted to.
    pub life_expectancy: Option<f64>,
    pub date: NaiveDate,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CpiAdjust {
    /// Every payment indexed from the valuation date.
    All,
    /// Indexation applied on calendar-year boundaries.
    Calendar,
}

/// Relative cash-flow multiplier `base^t` for `t` years from now, zero from
/// `cutoff_years` on.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct GrowthSchedule {
    pub base: f64,
    pub cutoff_years: Option<f64>,
}

impl GrowthSchedule {
    pub fn compounding(base: f64) -> Self {
        Self {
            base,
            cutoff_years: None,
        }
    }

    pub fn until(base: f64, cutoff_years: f64) -> Self {
        Self {
            base,
            cutoff_years: Some(cutoff_years),
        }
    }

    pub fn multiplier(&self, years: f64) -> f64 {
        match self.cutoff_years {
            Some(cutoff) if years >= cutoff => 0.0,
            _ => self.base.powf(years),
        }
    }
}

/// One payment stream to be priced per unit of annual payout.
#[derive(Clone, Debug)]
pub struct PriceRequest<'a, C, T> {
    pub curve: &'a C,
    pub payout_delay_months: f64,
    pub life_table: &'a T,
    pub life_table2: Option<&'a T>,
    pub joint_payout_fraction: f64,
    pub joint_contingent: bool,
    pub period_certain: f64,
    pub frequency: u32,
    pub cpi_adjust: CpiAdjust,
    /// Pay in full until this survival percentile instead of weighting by the
    /// probability of survival.
    pub percentile: Option<f64>,
    pub schedule: Option<GrowthSchedule>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Valuation {
    pub present_value: f64,
    pub annual_return: f64,
    pub duration: f64,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PricingError {
    #[error("no {kind:?} interest rate data available for {date}")]
    NoData { kind: CurveKind, date: NaiveDate },
    #[error("unable to adjust life table at age {age:.1} to a life expectancy of {target:.1} years")]
    UnableToAdjust { age: f64, target: f64 },
}

pub trait PricingOracle {
    type Curve: Clone + fmt::Debug;
    type Table: Clone + fmt::Debug;

    fn yield_curve(&self, kind: CurveKind, date: NaiveDate) -> Result<Self::Curve, PricingError>;

    /// Date of the quotes actually backing a curve.
    fn curve_date(&self, curve: &Self::Curve) -> NaiveDate;

    fn life_table(&self, spec: &LifeTableSpec) -> Result<Self::Table, PricingError>;

    fn price(
        &self,
        request: &PriceRequest<'_, Self::Curve, Self::Table>,
    ) -> Result<Valuation, PricingError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_is_zero_from_cutoff() {
        let schedule = GrowthSchedule::until(1.1, 2.0);
        assert!((schedule.multiplier(0.0) - 1.0).abs() < 1e-12);
        assert!((schedule.multiplier(1.0) - 1.1).abs() < 1e-12);
        assert_eq!(schedule.multiplier(2.0), 0.0);
        assert_eq!(schedule.multiplier(7.5), 0.0);
    }

    #[test]
    fn compounding_schedule_never_cuts_off() {
        let schedule = GrowthSchedule::compounding(0.5);
        assert!((schedule.multiplier(3.0) - 0.125).abs() < 1e-12);
        assert!(schedule.multiplier(200.0) > 0.0);
    }
}
