use super::percentile::{geomean, percentile};
use super::types::{ContributionPlan, MarketAssumptions, PortfolioStats};
use super::weights::AllocationWeights;

/// Percentile of the lognormal at which losses are reported. Stock returns are
/// fat tailed: the empirical 10th percentile sits near the lognormal 6th.
pub const LOSS_PERCENTILE_FAT_TAIL: f64 = 0.06;

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Volatilities {
    pub stocks: f64,
    pub bonds: f64,
    pub contributions: f64,
    pub safe: f64,
}

/// Only these pairs co-vary; the safe bucket is independent of everything
/// except bonds.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Covariances {
    pub equity_contributions: f64,
    pub bonds_contributions: f64,
    pub equity_bonds: f64,
    pub bonds_safe: f64,
}

/// Liability-matching bond characteristics derived from the real yield curve.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SafeAsset {
    pub expected_return: f64,
    pub vol_short: f64,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ReturnModel {
    /// Expected return per bucket.
    pub returns: AllocationWeights,
    pub vols: Volatilities,
    pub covs: Covariances,
    /// Short-horizon figures used for the investment tail-loss test.
    pub short_vols: Volatilities,
    pub short_covs: Covariances,
}

impl ReturnModel {
    pub fn new(
        market: &MarketAssumptions,
        contributions: &ContributionPlan,
        safe: SafeAsset,
        contributions_return: f64,
        equity_shift: f64,
    ) -> Self {
        let mode = market.covariance_mode;
        let returns = AllocationWeights {
            stocks: market.equity_return - market.expense + equity_shift,
            bonds: market.bonds_return - market.expense,
            contributions: contributions_return,
            safe: safe.expected_return,
            existing_income: safe.expected_return,
            new_annuities: safe.expected_return,
        };
        let vols = Volatilities {
            stocks: market.equity_vol,
            bonds: market.bonds_vol,
            contributions: contributions.vol,
            safe: 0.0,
        };
        let covs = Covariances {
            equity_contributions: mode.covariance(
                market.equity_vol,
                contributions.vol,
                contributions.equity_correlation,
            ),
            bonds_contributions: mode.covariance(
                market.bonds_vol,
                contributions.vol,
                contributions.bonds_correlation,
            ),
            equity_bonds: mode.covariance(
                market.equity_vol,
                market.bonds_vol,
                market.equity_bonds_correlation,
            ),
            bonds_safe: 0.0,
        };
        let short_vols = Volatilities {
            safe: safe.vol_short,
            ..vols
        };
        let short_covs = Covariances {
            bonds_safe: mode.covariance(
                market.bonds_vol,
                safe.vol_short,
                market.bonds_lm_bonds_correlation_short,
            ),
            ..covs
        };

        Self {
            returns,
            vols,
            covs,
            short_vols,
            short_covs,
        }
    }

    pub fn equity_geometric_return(&self) -> f64 {
        geomean(1.0 + self.returns.stocks, self.vols.stocks) - 1.0
    }

    pub fn bonds_geometric_return(&self) -> f64 {
        geomean(1.0 + self.returns.bonds, self.vols.bonds) - 1.0
    }

    pub fn total_statistics(&self, w: &AllocationWeights) -> PortfolioStats {
        statistics(w, &self.returns, &self.vols, &self.covs)
    }

    /// Statistics of the investable portfolio alone: no contributions, no
    /// guaranteed income.
    pub fn investment_statistics(&self, w: &AllocationWeights) -> PortfolioStats {
        let investments = w.non_annuitized(false);
        statistics(&investments, &self.returns, &self.short_vols, &self.short_covs)
    }
}

pub fn statistics(
    w: &AllocationWeights,
    returns: &AllocationWeights,
    vols: &Volatilities,
    covs: &Covariances,
) -> PortfolioStats {
    let expected_return = w.stocks * returns.stocks
        + w.bonds * returns.bonds
        + w.contributions * returns.contributions
        + w.safe * returns.safe
        + w.existing_income * returns.existing_income
        + w.new_annuities * returns.new_annuities;

    let variance = w.contributions.powi(2) * vols.contributions.powi(2)
        + w.stocks.powi(2) * vols.stocks.powi(2)
        + w.bonds.powi(2) * vols.bonds.powi(2)
        + w.safe.powi(2) * vols.safe.powi(2)
        + 2.0 * w.contributions * w.stocks * covs.equity_contributions
        + 2.0 * w.contributions * w.bonds * covs.bonds_contributions
        + 2.0 * w.stocks * w.bonds * covs.equity_bonds
        + 2.0 * w.bonds * w.safe * covs.bonds_safe;
    let volatility = variance.max(0.0).sqrt();

    PortfolioStats {
        expected_return,
        volatility,
        geometric_return: geomean(1.0 + expected_return, volatility) - 1.0,
    }
}

/// Loss at the fat-tail percentile of the lognormal fit to `stats`.
pub fn tail_loss(stats: &PortfolioStats) -> f64 {
    1.0 - percentile(
        LOSS_PERCENTILE_FAT_TAIL,
        1.0 + stats.expected_return,
        stats.volatility,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::CovarianceMode;

    const EPS: f64 = 1e-12;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn market(mode: CovarianceMode) -> MarketAssumptions {
        MarketAssumptions {
            equity_return: 0.072,
            equity_vol: 0.17,
            bonds_return: 0.0,
            bonds_vol: 0.087,
            equity_bonds_correlation: -0.3,
            real_vol_10yr: 0.049,
            bonds_lm_bonds_correlation_short: 0.289,
            equity_return_se: 0.017,
            expense: 0.001,
            covariance_mode: mode,
        }
    }

    fn model(mode: CovarianceMode) -> ReturnModel {
        let plan = ContributionPlan {
            amount: 2_000.0,
            growth: 0.07,
            vol: 0.1,
            equity_correlation: 0.5,
            bonds_correlation: 0.0,
        };
        let safe = SafeAsset {
            expected_return: 0.012,
            vol_short: 0.04,
        };
        ReturnModel::new(&market(mode), &plan, safe, 0.02, 0.0)
    }

    #[test]
    fn returns_are_net_of_expenses_and_shifted() {
        let plan = ContributionPlan::default();
        let safe = SafeAsset {
            expected_return: 0.01,
            vol_short: 0.0,
        };
        let shifted = ReturnModel::new(
            &market(CovarianceMode::default()),
            &plan,
            safe,
            0.0,
            -0.02,
        );
        assert_approx(shifted.returns.stocks, 0.072 - 0.001 - 0.02);
        assert_approx(shifted.returns.bonds, -0.001);
        assert_approx(shifted.returns.new_annuities, 0.01);
    }

    #[test]
    fn correlation_squared_discards_sign() {
        let squared = model(CovarianceMode::CorrelationSquared);
        let signed = model(CovarianceMode::Signed);
        assert_approx(squared.covs.equity_bonds, 0.17 * 0.087 * 0.09);
        assert_approx(signed.covs.equity_bonds, 0.17 * 0.087 * -0.3);
        assert_approx(squared.covs.equity_contributions, 0.17 * 0.1 * 0.25);
        assert_approx(signed.covs.equity_contributions, 0.17 * 0.1 * 0.5);
        assert_approx(squared.covs.bonds_safe, 0.0);
        assert!(squared.short_covs.bonds_safe > 0.0);
    }

    #[test]
    fn single_bucket_statistics() {
        let model = model(CovarianceMode::default());
        let w = AllocationWeights {
            stocks: 1.0,
            ..AllocationWeights::default()
        };
        let stats = model.total_statistics(&w);
        assert_approx(stats.expected_return, 0.071);
        assert_approx(stats.volatility, 0.17);
        assert_approx(stats.geometric_return, model.equity_geometric_return());
    }

    #[test]
    fn two_bucket_variance_includes_covariance() {
        let model = model(CovarianceMode::Signed);
        let w = AllocationWeights {
            stocks: 0.6,
            bonds: 0.4,
            ..AllocationWeights::default()
        };
        let stats = model.total_statistics(&w);
        let variance = 0.36 * 0.17_f64.powi(2)
            + 0.16 * 0.087_f64.powi(2)
            + 2.0 * 0.6 * 0.4 * model.covs.equity_bonds;
        assert_approx(stats.volatility, variance.sqrt());
    }

    #[test]
    fn investment_statistics_ignore_guaranteed_income() {
        let model = model(CovarianceMode::default());
        let w = AllocationWeights {
            stocks: 0.25,
            safe: 0.25,
            existing_income: 0.5,
            ..AllocationWeights::default()
        };
        let stats = model.investment_statistics(&w);
        assert_approx(stats.expected_return, 0.5 * 0.071 + 0.5 * 0.012);
        let variance = 0.25 * 0.17_f64.powi(2) + 0.25 * 0.04_f64.powi(2);
        assert_approx(stats.volatility, variance.sqrt());
    }

    #[test]
    fn riskless_portfolio_has_no_tail_loss_beyond_return() {
        let stats = PortfolioStats {
            expected_return: 0.01,
            volatility: 0.0,
            geometric_return: 0.01,
        };
        assert_approx(tail_loss(&stats), -0.01);
    }
}
