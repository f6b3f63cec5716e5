use tracing::trace;

use super::percentile::percentile;
use super::ratio_or;
use super::returns::{ReturnModel, tail_loss};
use super::solver::{Bisection, Step};
use super::weights::AllocationWeights;
use crate::error::Result;

/// Money's worth ratio of a newly purchased income annuity.
pub const MWR: f64 = 1.0;
/// Growth percentile assumed for the portfolio when there is no guaranteed
/// income cushion. Calibrated against stochastic dynamic programming.
const GROWTH_PERCENTILE_NO_DB: f64 = 0.43;
const BLEND_TOLERANCE: f64 = 1e-4;

/// Everything needed to turn a set of weights into a consumption estimate.
pub struct ConsumptionModel<'a> {
    pub net_worth: f64,
    /// Expected payout years of population mortality, discounted at the real rate.
    pub discounted_le: f64,
    /// Same with annuitant mortality.
    pub discounted_le_annuity: f64,
    pub consume_factor: &'a dyn Fn(f64) -> Result<f64>,
}

impl ConsumptionModel<'_> {
    pub fn consume(&self, model: &ReturnModel, w: &AllocationWeights) -> Result<f64> {
        let stats = model.total_statistics(&w.non_annuitized(true));
        let guaranteed = w.guaranteed();
        let growth_percentile =
            (1.0 - guaranteed) * GROWTH_PERCENTILE_NO_DB + guaranteed * 0.5;
        let growth = percentile(
            growth_percentile,
            1.0 + stats.expected_return,
            stats.volatility,
        ) - 1.0;
        let factor = (self.consume_factor)(growth)?;

        Ok(self.net_worth
            * (ratio_or(w.existing_income, self.discounted_le, 0.0)
                + ratio_or(w.new_annuities * MWR, self.discounted_le_annuity, 0.0)
                + (1.0 - guaranteed) * factor))
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Limited {
    pub weights: AllocationWeights,
    pub consume: f64,
    pub loss: f64,
}

/// Moves stocks into the safe bucket (or regular bonds) until the tail loss of
/// the investments is within the tolerance.
pub struct RiskLimiter<'a> {
    pub model: &'a ReturnModel,
    pub risk_tolerance: f64,
    pub consumption: &'a ConsumptionModel<'a>,
}

impl RiskLimiter<'_> {
    pub fn limit(&self, use_lm_bonds: bool, initial: &AllocationWeights) -> Result<Limited> {
        let tolerance = self.risk_tolerance;
        let mut found: Option<(AllocationWeights, f64)> = None;

        Bisection::new(-1.0, 1.0)
            .tolerance(BLEND_TOLERANCE)
            .run(|mid| {
                let w = blend(initial, mid, use_lm_bonds);
                let loss = tail_loss(&self.model.investment_statistics(&w));
                let best = *found.get_or_insert((w, loss));

                if loss <= tolerance || (tolerance < loss && loss < best.1) {
                    found = Some((w, loss));
                    if mid == 0.0 { Step::Stop } else { Step::Lower }
                } else {
                    Step::Higher
                }
            });

        let (weights, loss) = found.unwrap_or_else(|| {
            let w = blend(initial, 0.0, use_lm_bonds);
            (w, tail_loss(&self.model.investment_statistics(&w)))
        });
        let consume = self.consumption.consume(self.model, &weights)?;
        trace!(use_lm_bonds, loss, consume, "risk limited");

        Ok(Limited {
            weights,
            consume,
            loss,
        })
    }
}

/// Shifts `mid` of the stock weight into the safe bucket. Without liability
/// matching bonds the safe bucket is held as regular bonds.
fn blend(initial: &AllocationWeights, mid: f64, use_lm_bonds: bool) -> AllocationWeights {
    let mut w = *initial;
    let adjust = mid * w.stocks;
    w.stocks -= adjust;
    w.safe += adjust;
    if !use_lm_bonds {
        w.bonds += w.safe;
        w.safe = 0.0;
    }
    w
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::returns::SafeAsset;
    use crate::core::types::{ContributionPlan, CovarianceMode, MarketAssumptions};

    fn model() -> ReturnModel {
        let market = MarketAssumptions {
            equity_return: 0.072,
            equity_vol: 0.17,
            bonds_return: 0.0,
            bonds_vol: 0.087,
            equity_bonds_correlation: 0.073,
            real_vol_10yr: 0.049,
            bonds_lm_bonds_correlation_short: 0.289,
            equity_return_se: 0.017,
            expense: 0.001,
            covariance_mode: CovarianceMode::default(),
        };
        let safe = SafeAsset {
            expected_return: 0.01,
            vol_short: 0.03,
        };
        ReturnModel::new(&market, &ContributionPlan::default(), safe, 0.0, 0.0)
    }

    fn constant_factor(_growth: f64) -> Result<f64> {
        Ok(0.04)
    }

    fn consumption() -> ConsumptionModel<'static> {
        ConsumptionModel {
            net_worth: 1_000_000.0,
            discounted_le: 20.0,
            discounted_le_annuity: 22.0,
            consume_factor: &constant_factor,
        }
    }

    fn all_stocks() -> AllocationWeights {
        AllocationWeights {
            stocks: 1.0,
            ..AllocationWeights::default()
        }
    }

    #[test]
    fn allocation_within_tolerance_is_left_alone() {
        let model = model();
        let consumption = consumption();
        let limiter = RiskLimiter {
            model: &model,
            risk_tolerance: 0.2,
            consumption: &consumption,
        };
        let limited = limiter.limit(true, &all_stocks()).expect("limit");
        assert_eq!(limited.weights, all_stocks());
        assert!(limited.loss > 0.15 && limited.loss < 0.2, "{}", limited.loss);
    }

    #[test]
    fn excess_risk_moves_into_safe_bucket() {
        let model = model();
        let consumption = consumption();
        let limiter = RiskLimiter {
            model: &model,
            risk_tolerance: 0.1,
            consumption: &consumption,
        };
        let limited = limiter.limit(true, &all_stocks()).expect("limit");
        assert!(limited.loss <= 0.1);
        assert!(limited.weights.stocks < 1.0);
        assert!(limited.weights.safe > 0.0);
        assert_eq!(limited.weights.bonds, 0.0);
        assert!((limited.weights.sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn without_lm_bonds_safe_weight_is_held_as_bonds() {
        let model = model();
        let consumption = consumption();
        let limiter = RiskLimiter {
            model: &model,
            risk_tolerance: 0.1,
            consumption: &consumption,
        };
        let initial = AllocationWeights {
            stocks: 0.8,
            safe: 0.2,
            ..AllocationWeights::default()
        };
        let limited = limiter.limit(false, &initial).expect("limit");
        assert_eq!(limited.weights.safe, 0.0);
        assert!(limited.weights.bonds >= 0.2);
        assert!((limited.weights.sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn guaranteed_income_is_consumed_over_discounted_life_expectancy() {
        let model = model();
        let consumption = consumption();
        let w = AllocationWeights {
            existing_income: 0.5,
            new_annuities: 0.5,
            ..AllocationWeights::default()
        };
        let consume = consumption.consume(&model, &w).expect("consume");
        let expected = 1_000_000.0 * (0.5 / 20.0 + 0.5 * MWR / 22.0);
        assert!((consume - expected).abs() < 1e-6);
    }

    #[test]
    fn zero_life_expectancy_contributes_nothing() {
        let model = model();
        let consumption = ConsumptionModel {
            discounted_le: 0.0,
            discounted_le_annuity: 0.0,
            ..consumption()
        };
        let w = AllocationWeights {
            existing_income: 0.25,
            stocks: 0.75,
            ..AllocationWeights::default()
        };
        let consume = consumption.consume(&model, &w).expect("consume");
        assert!((consume - 1_000_000.0 * 0.75 * 0.04).abs() < 1e-6);
    }
}
