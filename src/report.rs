//! Chart rows for the plotting collaborator.

use std::fmt::Write;

use crate::core::{Bucket, PlanMode, ScenarioResult};

const CHART_BUCKETS: [Bucket; 5] = [
    Bucket::Stocks,
    Bucket::Bonds,
    Bucket::Safe,
    Bucket::ExistingIncome,
    Bucket::NewAnnuities,
];

/// One row per allocation bucket of the fixed weights. Future contributions
/// only appear when they are part of the plan.
pub fn allocation_csv(mode: PlanMode, scenario: &ScenarioResult) -> String {
    let mut out = String::from("class,allocation\n");
    let contributions = (mode == PlanMode::Allocation).then_some(Bucket::Contributions);
    for bucket in CHART_BUCKETS.into_iter().chain(contributions) {
        let _ = writeln!(out, "{},{:.6}", bucket.label(), scenario.weights.get(bucket));
    }
    out
}

/// Equity/bond split of the investment portfolio.
pub fn aa_csv(scenario: &ScenarioResult) -> String {
    format!(
        "asset class,allocation\nstocks,{:.6}\nbonds,{:.6}\n",
        scenario.aa_equity, scenario.aa_bonds
    )
}
