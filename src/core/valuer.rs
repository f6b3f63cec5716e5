use tracing::warn;

use super::types::{AllocationRequest, DefinedBenefit, JointType, Owner, Person};
use crate::error::{AllocError, Result};
use crate::pricing::{
    CpiAdjust, CurveKind, GrowthSchedule, LifeTableSpec, PriceRequest, PricingOracle, TableKind,
    Valuation,
};

/// Payment frequency for everything paid during retirement.
const MONTHLY: u32 = 12;
/// Survival percentile up to which consumption is planned.
const CONSUME_PERCENTILE: f64 = 97.0;

const PRIMARY_LE_FIELD: &str = "lifeExpectancy";
const SPOUSE_LE_FIELD: &str = "spouseLifeExpectancy";

/// Curves and tables for one quote date and household, and the streams the
/// engine prices with them.
pub struct AnnuityValuer<'o, O: PricingOracle> {
    oracle: &'o O,
    real: O::Curve,
    nominal: O::Curve,
    fixed: O::Curve,
    population: O::Table,
    population2: Option<O::Table>,
    annuitant: O::Table,
    annuitant2: Option<O::Table>,
    certain: O::Table,
    primary_age: f64,
    spouse_age: Option<f64>,
    pre_retirement_years: f64,
    joint_income_fraction: f64,
    contribution: f64,
}

impl<'o, O: PricingOracle> AnnuityValuer<'o, O> {
    pub fn new(oracle: &'o O, request: &AllocationRequest) -> Result<Self> {
        let date = request.quote_date;
        let curve = |kind| {
            oracle
                .yield_curve(kind, date)
                .map_err(|err| AllocError::from_pricing(err, PRIMARY_LE_FIELD))
        };
        let real = curve(CurveKind::Real)?;
        let nominal = curve(CurveKind::Nominal)?;
        let fixed = curve(CurveKind::Fixed)?;

        let table = |person: &Person, kind: TableKind, field: &'static str| {
            let life_expectancy = match kind {
                TableKind::Population => person
                    .life_expectancy_age
                    .map(|age_at_death| age_at_death - person.age),
                _ => None,
            };
            let spec = LifeTableSpec {
                table: kind,
                sex: person.sex,
                age: person.age,
                life_expectancy,
                date,
            };
            oracle
                .life_table(&spec)
                .map_err(|err| AllocError::from_pricing(err, field))
        };

        let primary = &request.primary;
        let population = table(primary, TableKind::Population, PRIMARY_LE_FIELD)?;
        let annuitant = table(primary, TableKind::Annuitant, PRIMARY_LE_FIELD)?;
        let (population2, annuitant2) = match &request.spouse {
            Some(spouse) => (
                Some(table(spouse, TableKind::Population, SPOUSE_LE_FIELD)?),
                Some(table(spouse, TableKind::Annuitant, SPOUSE_LE_FIELD)?),
            ),
            None => (None, None),
        };
        // Contributions are certain until retirement; only the shape of the
        // table matters, so anchor it at birth.
        let certain = table(
            &Person {
                age: 0.0,
                life_expectancy_age: None,
                ..primary.clone()
            },
            TableKind::CertainTo120,
            PRIMARY_LE_FIELD,
        )?;

        let contribution = if request.mode.uses_savings() {
            request.contributions.amount
        } else {
            0.0
        };

        Ok(Self {
            oracle,
            real,
            nominal,
            fixed,
            population,
            population2,
            annuitant,
            annuitant2,
            certain,
            primary_age: primary.age,
            spouse_age: request.spouse.as_ref().map(|s| s.age),
            pre_retirement_years: (request.retirement_age - primary.age).max(0.0),
            joint_income_fraction: request.joint_income_fraction,
            contribution,
        })
    }

    pub fn pre_retirement_years(&self) -> f64 {
        self.pre_retirement_years
    }

    fn payout_delay_months(&self) -> f64 {
        self.pre_retirement_years * 12.0
    }

    /// Quote date of the curves, naming both when real and nominal differ.
    pub fn yield_curve_date(&self) -> String {
        let real = self.oracle.curve_date(&self.real);
        let nominal = self.oracle.curve_date(&self.nominal);
        if real == nominal {
            real.to_string()
        } else {
            format!("{real} real, {nominal} nominal")
        }
    }

    fn curve(&self, kind: CurveKind) -> &O::Curve {
        match kind {
            CurveKind::Real => &self.real,
            CurveKind::Nominal => &self.nominal,
            CurveKind::Fixed => &self.fixed,
        }
    }

    fn tables(&self, kind: TableKind) -> (&O::Table, Option<&O::Table>) {
        match kind {
            TableKind::Annuitant => (&self.annuitant, self.annuitant2.as_ref()),
            TableKind::CertainTo120 => (&self.certain, Some(&self.certain)),
            TableKind::Population => (&self.population, self.population2.as_ref()),
        }
    }

    /// Present value and return of the contributions still to be made, growing
    /// at `growth` until retirement.
    pub fn price_contribution_stream(&self, growth: f64) -> Result<Valuation> {
        let request = PriceRequest {
            curve: &self.real,
            payout_delay_months: 0.0,
            life_table: &self.certain,
            life_table2: Some(&self.certain),
            joint_payout_fraction: 1.0,
            joint_contingent: true,
            period_certain: self.pre_retirement_years,
            frequency: 1,
            cpi_adjust: CpiAdjust::All,
            percentile: None,
            schedule: Some(GrowthSchedule::until(
                1.0 + growth,
                self.pre_retirement_years,
            )),
        };
        let unit = self.oracle.price(&request)?;
        Ok(Valuation {
            present_value: self.contribution * unit.present_value,
            ..unit
        })
    }

    /// Present value of one guaranteed income item. `None` when the item has
    /// nothing to value.
    pub fn price_defined_benefit(&self, item: &DefinedBenefit) -> Result<Option<f64>> {
        if item.amount == 0.0 {
            return Ok(None);
        }
        let (starting_age, life_table, life_table2) = match item.owner {
            Owner::Primary => (
                self.primary_age,
                &self.population,
                self.population2.as_ref(),
            ),
            Owner::Spouse => match (self.spouse_age, self.population2.as_ref()) {
                (Some(age), Some(table)) => (age, table, Some(&self.population)),
                _ => {
                    warn!(benefit = item.label(), "spouse-owned benefit without a spouse; skipped");
                    return Ok(None);
                }
            },
        };

        let delay = item.start_age - starting_age;
        let positive_delay = delay.max(0.0);
        let negative_delay = delay.min(0.0);
        let period_certain = 0.0_f64
            .max(self.pre_retirement_years - positive_delay)
            .max(item.period_certain + negative_delay);
        let curve = if item.inflation_indexed {
            &self.real
        } else {
            &self.nominal
        };

        let request = PriceRequest {
            curve,
            payout_delay_months: positive_delay * 12.0,
            life_table,
            life_table2,
            joint_payout_fraction: item.joint_payout_fraction,
            joint_contingent: item.joint_type == JointType::Contingent,
            period_certain,
            frequency: MONTHLY,
            cpi_adjust: CpiAdjust::Calendar,
            percentile: None,
            schedule: None,
        };
        Ok(Some(self.oracle.price(&request)?.present_value * item.amount))
    }

    /// Household income stream from retirement on, valued on `curve` with
    /// `table` mortality. On the fixed curve this is a life expectancy.
    pub fn price_life_expectancy_floor(
        &self,
        curve: CurveKind,
        table: TableKind,
    ) -> Result<Valuation> {
        let (life_table, life_table2) = self.tables(table);
        let request = PriceRequest {
            curve: self.curve(curve),
            payout_delay_months: self.payout_delay_months(),
            life_table,
            life_table2,
            joint_payout_fraction: self.joint_income_fraction,
            joint_contingent: true,
            period_certain: 0.0,
            frequency: MONTHLY,
            cpi_adjust: CpiAdjust::Calendar,
            percentile: None,
            schedule: None,
        };
        Ok(self.oracle.price(&request)?)
    }

    /// Fraction of a portfolio compounding at `growth` that can be withdrawn
    /// each year of retirement.
    pub fn consume_factor(&self, growth: f64) -> Result<f64> {
        let request = PriceRequest {
            curve: &self.fixed,
            payout_delay_months: self.payout_delay_months(),
            life_table: &self.population,
            life_table2: self.population2.as_ref(),
            joint_payout_fraction: self.joint_income_fraction,
            joint_contingent: true,
            period_certain: 0.0,
            frequency: MONTHLY,
            cpi_adjust: CpiAdjust::Calendar,
            percentile: Some(CONSUME_PERCENTILE),
            schedule: Some(GrowthSchedule::compounding(1.0 / (1.0 + growth))),
        };
        let price = self.oracle.price(&request)?.present_value;
        Ok(if price == 0.0 { 0.0 } else { 1.0 / price })
    }
}
