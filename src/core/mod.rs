mod annuitize;
mod engine;
mod fixer;
mod merton;
mod percentile;
mod returns;
mod risk;
pub mod solver;
mod types;
mod valuer;
mod weights;

pub use annuitize::{ANNUITIZATION_DELAY_COST, AnnuitizationDecision, annuitize_targets, delay_cost};
pub use engine::{PlanContext, compute_plan};
pub use merton::solve_merton;
pub use percentile::{geomean, normal_quantile, percentile};
pub use returns::{LOSS_PERCENTILE_FAT_TAIL, ReturnModel};
pub use types::{
    AllocationRequest, AnnuitizeTarget, Balances, BenefitValue, ContributionPlan,
    CovarianceMode, DefinedBenefit, JointType, MarketAssumptions, Owner, Person, PlanMode,
    PlanResult, PortfolioStats, PresentValues, ScenarioResult,
};
pub use weights::{AllocationWeights, Bucket, WEIGHT_EPSILON};

/// `num / den`, or `fallback` when the denominator is exactly zero.
pub(crate) fn ratio_or(num: f64, den: f64, fallback: f64) -> f64 {
    if den == 0.0 { fallback } else { num / den }
}
