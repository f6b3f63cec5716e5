use chrono::{Datelike, Duration, NaiveDate, Weekday};

use super::{
    CurveKind, LifeTableSpec, PriceRequest, PricingError, PricingOracle, Sex, TableKind,
    Valuation,
};
use crate::core::solver::{Bisection, Step};

const OMEGA: f64 = 120.0;
const ANNUITANT_LONGEVITY_YEARS: f64 = 3.0;

/// Flat yield curves and Gompertz mortality. Enough to run the engine end to
/// end without a market data feed.
#[derive(Clone, Debug)]
pub struct ReferenceConfig {
    pub real_rate: f64,
    pub nominal_rate: f64,
    pub first_quote_date: NaiveDate,
    pub last_quote_date: Option<NaiveDate>,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            real_rate: 0.01,
            nominal_rate: 0.03,
            first_quote_date: NaiveDate::from_ymd_opt(2005, 1, 3).unwrap_or_default(),
            last_quote_date: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReferenceOracle {
    config: ReferenceConfig,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FlatCurve {
    kind: CurveKind,
    curve_date: NaiveDate,
    rate: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GompertzTable {
    age: f64,
    modal_age: f64,
    dispersion: f64,
    certain: bool,
}

impl GompertzTable {
    fn survival(&self, years: f64) -> f64 {
        if self.age + years >= OMEGA {
            return 0.0;
        }
        if self.certain {
            return 1.0;
        }
        let hazard_scale = ((self.age - self.modal_age) / self.dispersion).exp();
        (hazard_scale * (1.0 - (years / self.dispersion).exp())).exp()
    }

    fn life_expectancy(&self) -> f64 {
        let step = 1.0 / 12.0;
        let span = (OMEGA - self.age).max(0.0);
        let mut t = 0.5 * step;
        let mut total = 0.0;
        while t < span {
            total += self.survival(t) * step;
            t += step;
        }
        total
    }
}

impl ReferenceOracle {
    pub fn new(config: ReferenceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReferenceConfig {
        &self.config
    }

    fn base_table(spec: &LifeTableSpec) -> GompertzTable {
        let (modal_age, dispersion) = match spec.sex {
            Sex::Male => (86.0, 10.5),
            Sex::Female => (89.5, 9.0),
        };
        match spec.table {
            TableKind::Population => GompertzTable {
                age: spec.age,
                modal_age,
                dispersion,
                certain: false,
            },
            TableKind::Annuitant => GompertzTable {
                age: spec.age,
                modal_age: modal_age + ANNUITANT_LONGEVITY_YEARS,
                dispersion,
                certain: false,
            },
            TableKind::CertainTo120 => GompertzTable {
                age: spec.age,
                modal_age,
                dispersion,
                certain: true,
            },
        }
    }

    fn adjust_to(table: GompertzTable, target: f64) -> Result<GompertzTable, PricingError> {
        let fail = PricingError::UnableToAdjust {
            age: table.age,
            target,
        };
        if table.certain || !target.is_finite() || target <= 0.0 {
            return Err(fail);
        }

        let at = |modal_age: f64| GompertzTable {
            modal_age,
            ..table.clone()
        };
        let lo = table.age - 80.0;
        let hi = table.age + 120.0;
        if at(lo).life_expectancy() > target || at(hi).life_expectancy() < target {
            return Err(fail);
        }

        let mut found = hi;
        Bisection::new(lo, hi).tolerance(1e-6).run(|modal_age| {
            if at(modal_age).life_expectancy() >= target {
                found = modal_age;
                Step::Lower
            } else {
                Step::Higher
            }
        });
        Ok(at(found))
    }

    fn joint_survival(t1: &GompertzTable, t2: Option<&GompertzTable>, years: f64) -> f64 {
        let p1 = t1.survival(years);
        match t2 {
            None => p1,
            Some(t2) => {
                let p2 = t2.survival(years);
                p1 + p2 - p1 * p2
            }
        }
    }

    /// Years until the probability anyone is still alive drops below
    /// `1 - percentile / 100`.
    fn percentile_horizon(t1: &GompertzTable, t2: Option<&GompertzTable>, percentile: f64) -> f64 {
        let threshold = 1.0 - percentile / 100.0;
        let step = 1.0 / 12.0;
        let span = Self::span(t1, t2);
        let mut t = 0.0;
        while t < span {
            if Self::joint_survival(t1, t2, t) < threshold {
                return t;
            }
            t += step;
        }
        span
    }

    fn span(t1: &GompertzTable, t2: Option<&GompertzTable>) -> f64 {
        let youngest = t2.map_or(t1.age, |t2| t1.age.min(t2.age));
        (OMEGA - youngest).max(0.0)
    }
}

impl PricingOracle for ReferenceOracle {
    type Curve = FlatCurve;
    type Table = GompertzTable;

    fn yield_curve(&self, kind: CurveKind, date: NaiveDate) -> Result<FlatCurve, PricingError> {
        let curve_date = match date.weekday() {
            Weekday::Sat => date - Duration::days(1),
            Weekday::Sun => date - Duration::days(2),
            _ => date,
        };
        let too_late = self
            .config
            .last_quote_date
            .is_some_and(|last| curve_date > last);
        if curve_date < self.config.first_quote_date || too_late {
            return Err(PricingError::NoData { kind, date });
        }

        let rate = match kind {
            CurveKind::Real => self.config.real_rate,
            CurveKind::Nominal => self.config.nominal_rate,
            CurveKind::Fixed => 0.0,
        };
        Ok(FlatCurve {
            kind,
            curve_date,
            rate,
        })
    }

    fn curve_date(&self, curve: &FlatCurve) -> NaiveDate {
        curve.curve_date
    }

    fn life_table(&self, spec: &LifeTableSpec) -> Result<GompertzTable, PricingError> {
        let table = Self::base_table(spec);
        match spec.life_expectancy {
            Some(target) => Self::adjust_to(table, target),
            None => Ok(table),
        }
    }

    // Both CPI adjustment modes index continuously on a flat real curve.
    fn price(
        &self,
        request: &PriceRequest<'_, FlatCurve, GompertzTable>,
    ) -> Result<Valuation, PricingError> {
        let t1 = request.life_table;
        let t2 = request.life_table2;
        let delay = request.payout_delay_months.max(0.0) / 12.0;
        let step = 1.0 / request.frequency.max(1) as f64;
        let span = Self::span(t1, t2);
        let horizon = request
            .percentile
            .map(|p| Self::percentile_horizon(t1, t2, p));
        let fraction = request.joint_payout_fraction;

        let mut present_value = 0.0;
        let mut weighted_time = 0.0;
        let mut k = 0u32;
        loop {
            let t = delay + f64::from(k) * step;
            if t >= span {
                break;
            }
            k += 1;

            let alive = if t - delay < request.period_certain {
                1.0
            } else if let Some(horizon) = horizon {
                if t < horizon { 1.0 } else { 0.0 }
            } else {
                let p1 = t1.survival(t);
                match t2 {
                    None => p1,
                    Some(t2) => {
                        let p2 = t2.survival(t);
                        if request.joint_contingent {
                            p1 + fraction * (p2 - p1 * p2)
                        } else {
                            p1 * p2 + fraction * (p1 + p2 - 2.0 * p1 * p2)
                        }
                    }
                }
            };
            let multiplier = request.schedule.map_or(1.0, |s| s.multiplier(t));
            let discounted = alive * multiplier * step * (1.0 + request.curve.rate).powf(-t);
            present_value += discounted;
            weighted_time += t * discounted;
        }

        let duration = if present_value > 0.0 {
            weighted_time / present_value
        } else {
            0.0
        };
        Ok(Valuation {
            present_value,
            annual_return: request.curve.rate,
            duration,
        })
    }
}
