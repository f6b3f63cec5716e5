use serde::Serialize;

use super::types::AnnuitizeTarget;

/// Cost of delaying annuitization by ten years, per decade of age.
pub const ANNUITIZATION_DELAY_COST: [f64; 10] =
    [0.0, 0.0, 0.0, 0.013, 0.018, 0.029, 0.049, 0.093, 0.221, 0.391];

/// Annuitization must raise consumption by more than this share to be worth
/// the loss of liquidity.
const MIN_GAIN: f64 = 0.04;
const MIN_DELAY_FRACTION: f64 = 0.001;

/// Fractions of each asset class to annuitize at the younger partner's age.
pub fn annuitize_targets(min_age: f64, age: f64, retirement_age: f64) -> AnnuitizeTarget {
    let clamp = |x: f64| x.clamp(0.0, 1.0);
    let lm_bonds_age = (40.0 + (retirement_age - age + min_age - 50.0) / 2.0).clamp(40.0, 50.0);
    AnnuitizeTarget {
        stocks: clamp((min_age - 65.0) / 25.0),
        bonds: clamp((min_age - 30.0) / 30.0),
        safe: if min_age >= lm_bonds_age { 1.0 } else { 0.0 },
    }
}

/// Yearly cost of not annuitizing, interpolated from the decade table. The
/// table looks ten years ahead, so it is read five years early.
pub fn delay_cost(min_age: f64) -> f64 {
    let last = ANNUITIZATION_DELAY_COST.len() - 1;
    let use_age = (min_age - 5.0).max(0.0);
    let index = ((use_age / 10.0) as usize).min(last);
    let next_index = (((use_age + 10.0) / 10.0) as usize).min(last);
    let weight = (use_age % 10.0) / 10.0;
    let low = ANNUITIZATION_DELAY_COST[index] / 10.0;
    let high = ANNUITIZATION_DELAY_COST[next_index] / 10.0;
    (1.0 - weight) * low + weight * high
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnuitizationDecision {
    pub gain: f64,
    /// Net worth lost per year of delay.
    pub delay_cost: f64,
    pub purchase: f64,
    pub plan: bool,
}

impl AnnuitizationDecision {
    /// Compares consumption with and without new annuities. `force` overrides
    /// the recommendation so that related scenarios agree.
    pub fn evaluate(
        consume_annuitize: f64,
        consume_unannuitize: f64,
        new_annuities_weight: f64,
        net_worth: f64,
        min_age: f64,
        force: Option<bool>,
    ) -> Self {
        let gain = consume_annuitize - consume_unannuitize;
        let delay_fraction = delay_cost(min_age) * new_annuities_weight;
        let plan = force.unwrap_or(
            gain > MIN_GAIN * consume_unannuitize && delay_fraction > MIN_DELAY_FRACTION,
        );
        Self {
            gain,
            delay_cost: net_worth * delay_fraction,
            purchase: net_worth * new_annuities_weight,
            plan,
        }
    }
}
