use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::weights::AllocationWeights;
use crate::pricing::Sex;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanMode {
    /// Recommend an allocation for the savings already held.
    Allocation,
    /// Find the portfolio needed to fund the desired income from scratch.
    RetirementNumber,
    /// Find the extra savings needed on top of current savings and contributions.
    Retire,
}

impl PlanMode {
    pub fn targets_income(self) -> bool {
        !matches!(self, PlanMode::Allocation)
    }

    pub fn uses_savings(self) -> bool {
        !matches!(self, PlanMode::RetirementNumber)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Owner {
    #[serde(alias = "self")]
    Primary,
    Spouse,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JointType {
    /// Full payout while both live, the joint fraction once one has died.
    Survivor,
    /// Full payout while the owner lives, the joint fraction to the partner after.
    Contingent,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CovarianceMode {
    /// `σa·σb·ρ²`; discards the sign of the correlation.
    #[default]
    CorrelationSquared,
    /// `σa·σb·ρ`.
    Signed,
}

impl CovarianceMode {
    pub fn covariance(self, vol_a: f64, vol_b: f64, correlation: f64) -> f64 {
        match self {
            CovarianceMode::CorrelationSquared => vol_a * vol_b * correlation * correlation,
            CovarianceMode::Signed => vol_a * vol_b * correlation,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Person {
    pub sex: Sex,
    pub age: f64,
    /// Expected age at death the population table is adjusted to.
    pub life_expectancy_age: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinedBenefit {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub social_security: bool,
    pub owner: Owner,
    pub start_age: f64,
    pub amount: f64,
    pub inflation_indexed: bool,
    #[serde(default)]
    pub period_certain: f64,
    pub joint_type: JointType,
    #[serde(default)]
    pub joint_payout_fraction: f64,
}

impl DefinedBenefit {
    pub fn label(&self) -> &str {
        match &self.description {
            Some(d) if !d.is_empty() => d,
            _ if self.social_security => "Social Security",
            _ => "Defined benefit",
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Balances {
    pub tax_deferred: f64,
    pub tax_free: f64,
    pub taxable: f64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct ContributionPlan {
    pub amount: f64,
    pub growth: f64,
    pub vol: f64,
    pub equity_correlation: f64,
    pub bonds_correlation: f64,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MarketAssumptions {
    pub equity_return: f64,
    pub equity_vol: f64,
    pub bonds_return: f64,
    pub bonds_vol: f64,
    pub equity_bonds_correlation: f64,
    /// Volatility of ten-year real rates; scales the LM-bond short-horizon volatility.
    pub real_vol_10yr: f64,
    pub bonds_lm_bonds_correlation_short: f64,
    /// Standard error of the expected equity return; drives the confidence scenarios.
    pub equity_return_se: f64,
    pub expense: f64,
    pub covariance_mode: CovarianceMode,
}

#[derive(Clone, Debug)]
pub struct AllocationRequest {
    pub mode: PlanMode,
    pub primary: Person,
    pub spouse: Option<Person>,
    pub defined_benefits: Vec<DefinedBenefit>,
    pub balances: Balances,
    pub withdrawal_tax_rate: f64,
    pub contributions: ContributionPlan,
    pub retirement_age: f64,
    pub joint_income_fraction: f64,
    pub required_income: Option<f64>,
    pub desired_income: Option<f64>,
    pub purchase_income_annuity: bool,
    pub use_lm_bonds: bool,
    pub market: MarketAssumptions,
    pub gamma: f64,
    pub risk_tolerance: f64,
    pub quote_date: NaiveDate,
    pub confidence: f64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioStats {
    pub expected_return: f64,
    pub volatility: f64,
    pub geometric_return: f64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnuitizeTarget {
    pub stocks: f64,
    pub bonds: f64,
    pub safe: f64,
}

impl AnnuitizeTarget {
    pub fn any(&self) -> bool {
        self.stocks > 0.0 || self.bonds > 0.0 || self.safe > 0.0
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BenefitValue {
    pub description: String,
    pub owner: Owner,
    pub present_value: f64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresentValues {
    pub defined_benefits: f64,
    pub tax_deferred: f64,
    pub tax_free: f64,
    pub taxable: f64,
    pub investments: f64,
    pub contributions: f64,
    pub contributions_return: f64,
    pub total: f64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioResult {
    pub description: &'static str,
    pub lm_bonds_return: f64,
    pub lm_bonds_duration: f64,
    pub retirement_life_expectancy: f64,
    pub consume: f64,
    pub equity_return: f64,
    pub bonds_return: f64,
    pub equity_geometric_return: f64,
    pub bonds_geometric_return: f64,
    pub future_growth: f64,
    /// Unconstrained optimizer output.
    pub merton_weights: AllocationWeights,
    pub discounted_contributions: f64,
    pub discounted_contributions_share: f64,
    /// Optimizer output floored at zero with the safe bucket taking the remainder.
    pub raw_weights: AllocationWeights,
    pub annuitize: AnnuitizeTarget,
    pub annuitize_gain: f64,
    pub annuitize_delay_cost: f64,
    pub weights: AllocationWeights,
    pub consume_annuitize: f64,
    pub consume_unannuitize: f64,
    pub purchase_income_annuity: f64,
    pub aa_equity: f64,
    pub aa_bonds: f64,
    pub investments: PortfolioStats,
    pub total: PortfolioStats,
    pub investments_loss: f64,
    pub total_loss: f64,
    pub annuitize_plan: bool,
    /// Extra taxable savings found by the funding search.
    pub extra_taxable: Option<f64>,
    pub present_values: PresentValues,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResult {
    pub mode: PlanMode,
    pub yield_curve_date: String,
    pub pre_retirement_years: f64,
    pub defined_benefits: Vec<BenefitValue>,
    pub present_values: PresentValues,
    pub scenarios: Vec<ScenarioResult>,
}

impl PlanResult {
    pub fn baseline(&self) -> Option<&ScenarioResult> {
        self.scenarios.first()
    }
}
