use tracing::debug;

use super::ratio_or;
use super::risk::{Limited, MWR, RiskLimiter};
use super::types::{AnnuitizeTarget, PlanMode, PortfolioStats};
use super::weights::AllocationWeights;
use crate::error::Result;

/// Household inputs the fixer needs beyond the return model.
#[derive(Copy, Clone, Debug)]
pub struct FixInputs {
    pub mode: PlanMode,
    pub net_worth: f64,
    pub defined_benefits_value: f64,
    pub contributions_value: f64,
    pub required_income: Option<f64>,
    pub desired_income: Option<f64>,
    pub use_lm_bonds: bool,
    pub discounted_le: f64,
    pub discounted_le_annuity: f64,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FixedAllocation {
    pub weights: AllocationWeights,
    pub consume: f64,
    pub total: PortfolioStats,
}

/// Turns unconstrained weights into a feasible allocation that honors the
/// guaranteed income already owned, the required income floor and the risk
/// tolerance.
pub struct AllocationFixer<'a> {
    pub inputs: FixInputs,
    pub limiter: RiskLimiter<'a>,
}

impl AllocationFixer<'_> {
    pub fn fix(
        &self,
        unconstrained: &AllocationWeights,
        annuitize: &AnnuitizeTarget,
    ) -> Result<FixedAllocation> {
        let inputs = &self.inputs;
        let nv = inputs.net_worth;
        let clamp = |w: f64| w.max(0.0).min(1.0);

        let mut w = AllocationWeights {
            stocks: clamp(unconstrained.stocks * (1.0 - annuitize.stocks)),
            bonds: clamp(unconstrained.bonds * (1.0 - annuitize.bonds)),
            safe: clamp(unconstrained.safe * (1.0 - annuitize.safe)),
            contributions: ratio_or(inputs.contributions_value, nv, 1.0),
            ..AllocationWeights::default()
        };
        let mut guaranteed = 1.0 - w.sum();
        w.existing_income = ratio_or(inputs.defined_benefits_value, nv, 0.0);

        let required_safe = self.required_safe(w.existing_income, w.contributions);
        let target_guaranteed = if annuitize.any() {
            w.existing_income.max(required_safe).max(guaranteed)
        } else {
            w.existing_income
        };

        // Waterfall: guaranteed income, then safe, then bonds, then stocks.
        w.safe += guaranteed - target_guaranteed;
        guaranteed = target_guaranteed;
        w.new_annuities = (guaranteed - w.existing_income).max(0.0);
        let target_safe = 0.0_f64
            .max(w.safe)
            .max(required_safe - guaranteed)
            .min(1.0);
        w.bonds += w.safe - target_safe;
        w.safe = target_safe;
        let target_bonds = clamp(w.bonds);
        w.stocks += w.bonds - target_bonds;
        w.bonds = target_bonds;
        w.stocks = w.stocks.max(0.0);

        let mut limited = self.limit(&w)?;
        let excess = inputs
            .desired_income
            .filter(|&desired| inputs.mode.targets_income() && limited.consume > desired);
        if let Some(desired) = excess {
            let ratio = desired / limited.consume;
            debug!(ratio, consume = limited.consume, "scaling back to desired income");
            limited = self.limit(&rescale(&w, ratio, required_safe, annuitize.safe))?;
        }

        let weights = limited.weights.settle();
        let consume = self.limiter.consumption.consume(self.limiter.model, &weights)?;
        let total = self.limiter.model.total_statistics(&weights);
        Ok(FixedAllocation {
            weights,
            consume,
            total,
        })
    }

    /// Share of net worth that must be held as safe assets or guaranteed
    /// income to fund the required income.
    fn required_safe(&self, existing: f64, contributions: f64) -> f64 {
        let inputs = &self.inputs;
        let Some(required) = inputs.required_income else {
            return 0.0;
        };
        let shortfall = if inputs.net_worth == 0.0 || inputs.discounted_le == 0.0 {
            0.0
        } else {
            inputs.discounted_le_annuity / MWR
                * (required / inputs.net_worth - existing / inputs.discounted_le)
        };
        (shortfall + existing).max(0.0).min(1.0 - contributions)
    }

    /// Risk limits with and without liability matching bonds, keeping the
    /// bonds when they consume at least as much without adding risk.
    fn limit(&self, w: &AllocationWeights) -> Result<Limited> {
        let plain = self.limiter.limit(false, w)?;
        if !self.inputs.use_lm_bonds {
            return Ok(plain);
        }
        let matched = self.limiter.limit(true, w)?;
        let tolerance = self.limiter.risk_tolerance;
        if matched.consume >= plain.consume
            && (matched.loss <= tolerance || matched.loss <= plain.loss)
        {
            Ok(matched)
        } else {
            Ok(plain)
        }
    }
}

/// Scales bonds and the safe block by `ratio`, never taking the safe block
/// below the required floor, and refills stocks.
fn rescale(
    initial: &AllocationWeights,
    ratio: f64,
    required_safe: f64,
    annuitize_safe: f64,
) -> AllocationWeights {
    let mut w = *initial;
    w.bonds *= ratio;
    let safe_block = w.safe + w.existing_income + w.new_annuities;
    let new_safe = (safe_block * ratio).max(required_safe) - w.existing_income;
    let new_safe = new_safe.max(0.0);
    let annuitizable = (safe_block * annuitize_safe - w.existing_income).max(0.0);
    w.new_annuities = new_safe.min(annuitizable);
    w.safe = new_safe - w.new_annuities;
    w.stocks = 0.0;
    w.stocks = (1.0 - w.sum()).max(0.0);
    w
}
