use tracing::debug;

use super::annuitize::{AnnuitizationDecision, annuitize_targets};
use super::fixer::{AllocationFixer, FixInputs};
use super::merton::solve_merton;
use super::percentile::normal_quantile;
use super::ratio_or;
use super::returns::{ReturnModel, SafeAsset, tail_loss};
use super::risk::{ConsumptionModel, RiskLimiter};
use super::solver::{Bisection, Step};
use super::types::{
    AllocationRequest, AnnuitizeTarget, Balances, BenefitValue, ContributionPlan, PlanMode,
    PlanResult, PresentValues, ScenarioResult,
};
use super::valuer::AnnuityValuer;
use super::weights::AllocationWeights;
use crate::error::{AllocError, Result};
use crate::pricing::{CurveKind, PricingOracle, TableKind, Valuation};

/// Nobody is planned to live past this age.
const MAX_AGE: f64 = 120.0;
const GROWTH_TOLERANCE: f64 = 1e-6;
const FUNDING_RELATIVE_TOLERANCE: f64 = 1e-6;

/// Everything about a request that does not depend on the scenario.
pub struct PlanContext<'a, O: PricingOracle> {
    request: &'a AllocationRequest,
    valuer: AnnuityValuer<'a, O>,
    contributions: ContributionPlan,
    balances: Balances,
    withdrawal_tax_rate: f64,
    min_age: f64,
    contributions_value: f64,
    contributions_return: f64,
    benefits: Vec<BenefitValue>,
    defined_benefits_value: f64,
    retirement_le: f64,
    discounted_le: f64,
    discounted_le_annuity: f64,
    lm_bonds: Valuation,
    lm_bonds_vol_short: f64,
}

impl<'a, O: PricingOracle> PlanContext<'a, O> {
    pub fn new(oracle: &'a O, request: &'a AllocationRequest) -> Result<Self> {
        let valuer = AnnuityValuer::new(oracle, request)?;

        // A retirement number is computed from scratch.
        let (contributions, balances, withdrawal_tax_rate) = if request.mode.uses_savings() {
            (
                request.contributions,
                request.balances,
                request.withdrawal_tax_rate,
            )
        } else {
            (ContributionPlan::default(), Balances::default(), 0.0)
        };

        let min_age = request
            .spouse
            .as_ref()
            .map_or(request.primary.age, |spouse| {
                request.primary.age.min(spouse.age)
            });

        let contributions_stream = valuer.price_contribution_stream(contributions.growth)?;

        let mut benefits = Vec::new();
        let mut defined_benefits_value = 0.0;
        for item in &request.defined_benefits {
            if let Some(present_value) = valuer.price_defined_benefit(item)? {
                defined_benefits_value += present_value;
                benefits.push(BenefitValue {
                    description: item.label().to_string(),
                    owner: item.owner,
                    present_value,
                });
            }
        }

        let retirement_le = valuer
            .price_life_expectancy_floor(CurveKind::Fixed, TableKind::Population)?
            .present_value;
        let discounted_le_annuity = valuer
            .price_life_expectancy_floor(CurveKind::Real, TableKind::Annuitant)?
            .present_value;
        let lm_bonds =
            valuer.price_life_expectancy_floor(CurveKind::Real, TableKind::Population)?;
        let modified_duration = lm_bonds.duration / (1.0 + lm_bonds.annual_return);
        let lm_bonds_vol_short = modified_duration / 10.0 * request.market.real_vol_10yr;

        debug!(
            contributions = contributions_stream.present_value,
            defined_benefits = defined_benefits_value,
            retirement_le,
            lm_bonds_return = lm_bonds.annual_return,
            lm_bonds_duration = lm_bonds.duration,
            "plan context"
        );

        Ok(Self {
            request,
            valuer,
            contributions,
            balances,
            withdrawal_tax_rate,
            min_age,
            contributions_value: contributions_stream.present_value,
            contributions_return: contributions_stream.annual_return,
            benefits,
            defined_benefits_value,
            retirement_le,
            discounted_le: lm_bonds.present_value,
            discounted_le_annuity,
            lm_bonds,
            lm_bonds_vol_short,
        })
    }

    pub fn pre_retirement_years(&self) -> f64 {
        self.valuer.pre_retirement_years()
    }

    /// Net worth breakdown with `extra_taxable` added to taxable savings.
    pub fn present_values(&self, extra_taxable: f64) -> PresentValues {
        let tax_deferred = self.balances.tax_deferred * (1.0 - self.withdrawal_tax_rate);
        let tax_free = self.balances.tax_free;
        let taxable = self.balances.taxable + extra_taxable;
        let investments = tax_deferred + tax_free + taxable;
        PresentValues {
            defined_benefits: self.defined_benefits_value,
            tax_deferred,
            tax_free,
            taxable,
            investments,
            contributions: self.contributions_value,
            contributions_return: self.contributions_return,
            total: self.defined_benefits_value + investments + self.contributions_value,
        }
    }

    fn return_model(&self, equity_shift: f64) -> ReturnModel {
        let safe = SafeAsset {
            expected_return: self.lm_bonds.annual_return,
            vol_short: self.lm_bonds_vol_short,
        };
        ReturnModel::new(
            &self.request.market,
            &self.contributions,
            safe,
            self.contributions_return,
            equity_shift,
        )
    }
}

/// Unconstrained optimizer output before the fixer gets to it.
#[derive(Copy, Clone, Debug)]
struct MertonStage {
    merton: AllocationWeights,
    raw: AllocationWeights,
    future_growth: f64,
    discounted_contributions: f64,
    discounted_contributions_share: f64,
}

/// Candidate from one step of the future-growth search.
#[derive(Copy, Clone, Debug)]
struct GrowthCandidate {
    merton: AllocationWeights,
    future_growth: f64,
    discounted_contributions: f64,
    discounted_net_worth: f64,
    share: f64,
}

fn merton_stage<O: PricingOracle>(
    ctx: &PlanContext<'_, O>,
    model: &ReturnModel,
    net_worth: f64,
) -> Result<MertonStage> {
    let request = ctx.request;
    let vols = &model.vols;
    let covs = &model.covs;
    let risk_free = ctx.lm_bonds.annual_return;

    let mut stage = if request.mode == PlanMode::Allocation && ctx.contributions.vol > 0.0 {
        // Solve for the contribution growth at which the discounted stream is
        // exactly the share of net worth the optimizer wants in it.
        let candidate = |future_growth: f64| -> Result<GrowthCandidate> {
            let sigma = [
                [vols.stocks.powi(2), covs.equity_bonds, covs.equity_contributions],
                [covs.equity_bonds, vols.bonds.powi(2), covs.bonds_contributions],
                [covs.equity_contributions, covs.bonds_contributions, vols.contributions.powi(2)],
            ];
            let alpha = [model.returns.stocks, model.returns.bonds, future_growth];
            let [stocks, bonds, contributions] =
                solve_merton(request.gamma, sigma, alpha, risk_free)?;
            let merton = AllocationWeights {
                stocks,
                bonds,
                contributions,
                safe: 1.0 - stocks - bonds - contributions,
                ..AllocationWeights::default()
            };
            let discount_growth = (1.0 + ctx.contributions.growth) / (1.0 + future_growth) - 1.0;
            let discounted_contributions = ctx
                .valuer
                .price_contribution_stream(discount_growth)?
                .present_value;
            let discounted_net_worth =
                net_worth - ctx.contributions_value + discounted_contributions;
            Ok(GrowthCandidate {
                merton,
                future_growth,
                discounted_contributions,
                discounted_net_worth,
                share: ratio_or(discounted_contributions, discounted_net_worth, 0.0),
            })
        };

        let mut last = None;
        Bisection::new(-0.5, 0.5)
            .tolerance(GROWTH_TOLERANCE)
            .try_run(|future_growth| {
                let c = candidate(future_growth)?;
                last = Some(c);
                Ok::<_, AllocError>(if c.share > c.merton.contributions {
                    Step::Higher
                } else {
                    Step::Lower
                })
            })?;
        let found = match last {
            Some(found) => found,
            None => candidate(0.0)?,
        };

        let scale = ratio_or(found.discounted_net_worth, net_worth, 0.0);
        let mut raw = found.merton.map(|w| w * scale);
        raw.contributions = 0.0;
        raw.contributions = 1.0 - raw.sum();
        MertonStage {
            merton: found.merton,
            raw,
            future_growth: found.future_growth,
            discounted_contributions: found.discounted_contributions,
            discounted_contributions_share: found.share,
        }
    } else {
        let discounted_contributions = ctx
            .valuer
            .price_contribution_stream(ctx.contributions.growth)?
            .present_value;
        let share = ratio_or(discounted_contributions, net_worth, 0.0);
        let sigma = [
            [vols.stocks.powi(2), covs.equity_bonds],
            [covs.equity_bonds, vols.bonds.powi(2)],
        ];
        let alpha = [model.returns.stocks, model.returns.bonds];
        let [stocks, bonds] = solve_merton(request.gamma, sigma, alpha, risk_free)?;
        let merton = AllocationWeights {
            stocks,
            bonds,
            contributions: share,
            safe: 1.0 - stocks - bonds - share,
            ..AllocationWeights::default()
        };
        MertonStage {
            merton,
            raw: merton,
            future_growth: 0.0,
            discounted_contributions,
            discounted_contributions_share: share,
        }
    };

    stage.raw = stage.raw.map(|w| w.max(0.0));
    stage.raw.safe = 0.0;
    stage.raw.safe = 1.0 - stage.raw.sum();
    Ok(stage)
}

/// One scenario at a fixed net worth.
fn evaluate_scenario<O: PricingOracle>(
    ctx: &PlanContext<'_, O>,
    description: &'static str,
    shift: f64,
    force_annuitize: Option<bool>,
    extra_taxable: f64,
) -> Result<ScenarioResult> {
    let request = ctx.request;
    let present_values = ctx.present_values(extra_taxable);
    let net_worth = present_values.total;
    let model = ctx.return_model(shift * request.market.equity_return_se);
    let stage = merton_stage(ctx, &model, net_worth)?;

    let consume_factor = |growth: f64| ctx.valuer.consume_factor(growth);
    let consumption = ConsumptionModel {
        net_worth,
        discounted_le: ctx.discounted_le,
        discounted_le_annuity: ctx.discounted_le_annuity,
        consume_factor: &consume_factor,
    };
    let fixer = AllocationFixer {
        inputs: FixInputs {
            mode: request.mode,
            net_worth,
            defined_benefits_value: ctx.defined_benefits_value,
            contributions_value: ctx.contributions_value,
            required_income: request.required_income,
            desired_income: request.desired_income,
            use_lm_bonds: request.use_lm_bonds,
            discounted_le: ctx.discounted_le,
            discounted_le_annuity: ctx.discounted_le_annuity,
        },
        limiter: RiskLimiter {
            model: &model,
            risk_tolerance: request.risk_tolerance,
            consumption: &consumption,
        },
    };

    let unannuitized = fixer.fix(&stage.raw, &AnnuitizeTarget::default())?;
    let (fixed, annuitize, decision, consume_annuitize) = if request.purchase_income_annuity {
        let target = annuitize_targets(ctx.min_age, request.primary.age, request.retirement_age);
        let annuitized = fixer.fix(&stage.raw, &target)?;
        let decision = AnnuitizationDecision::evaluate(
            annuitized.consume,
            unannuitized.consume,
            annuitized.weights.new_annuities,
            net_worth,
            ctx.min_age,
            force_annuitize,
        );
        let chosen = if decision.plan {
            annuitized
        } else {
            unannuitized
        };
        (chosen, target, decision, annuitized.consume)
    } else {
        (
            unannuitized,
            AnnuitizeTarget::default(),
            AnnuitizationDecision::default(),
            0.0,
        )
    };

    let weights = fixed.weights;
    let investments = model.investment_statistics(&weights);
    let aa_equity = ratio_or(weights.stocks, weights.investments(), 1.0);

    Ok(ScenarioResult {
        description,
        lm_bonds_return: ctx.lm_bonds.annual_return,
        lm_bonds_duration: ctx.lm_bonds.duration,
        retirement_life_expectancy: ctx.retirement_le,
        consume: fixed.consume,
        equity_return: model.returns.stocks,
        bonds_return: model.returns.bonds,
        equity_geometric_return: model.equity_geometric_return(),
        bonds_geometric_return: model.bonds_geometric_return(),
        future_growth: stage.future_growth,
        merton_weights: stage.merton,
        discounted_contributions: stage.discounted_contributions,
        discounted_contributions_share: stage.discounted_contributions_share,
        raw_weights: stage.raw,
        annuitize,
        annuitize_gain: decision.gain,
        annuitize_delay_cost: decision.delay_cost,
        weights,
        consume_annuitize,
        consume_unannuitize: unannuitized.consume,
        purchase_income_annuity: decision.purchase,
        aa_equity,
        aa_bonds: 1.0 - aa_equity,
        investments,
        total: fixed.total,
        investments_loss: tail_loss(&investments),
        total_loss: tail_loss(&fixed.total),
        annuitize_plan: decision.plan,
        extra_taxable: request.mode.targets_income().then_some(extra_taxable),
        present_values,
    })
}

/// Finds the smallest extra taxable balance whose consumption meets the
/// desired income.
fn fund_scenario<O: PricingOracle>(
    ctx: &PlanContext<'_, O>,
    description: &'static str,
    shift: f64,
    force_annuitize: Option<bool>,
) -> Result<ScenarioResult> {
    let request = ctx.request;
    let Some(desired) = request.desired_income else {
        return evaluate_scenario(ctx, description, shift, force_annuitize, 0.0);
    };
    let max_portfolio = desired * (MAX_AGE - ctx.min_age - ctx.pre_retirement_years());
    if max_portfolio <= 0.0 {
        return evaluate_scenario(ctx, description, shift, force_annuitize, 0.0);
    }

    // Consumption can jump where annuitization switches on, so keep a point
    // that actually meets the target rather than the bracket midpoint.
    let mut found: Option<ScenarioResult> = None;
    let outcome = Bisection::new(0.0, max_portfolio)
        .relative_tolerance(FUNDING_RELATIVE_TOLERANCE)
        .try_run(|extra| {
            let scenario = evaluate_scenario(ctx, description, shift, force_annuitize, extra)?;
            let meets = scenario.consume >= desired;
            if meets || found.is_none() {
                found = Some(scenario);
            }
            Ok::<_, AllocError>(if meets { Step::Lower } else { Step::Higher })
        })?;

    let scenario = match found {
        Some(scenario) => scenario,
        None => evaluate_scenario(ctx, description, shift, force_annuitize, 0.0)?,
    };
    debug!(
        description,
        extra_taxable = scenario.extra_taxable,
        iterations = outcome.iterations,
        consume = scenario.consume,
        desired,
        "funding search"
    );
    Ok(scenario)
}

fn run_scenario<O: PricingOracle>(
    ctx: &PlanContext<'_, O>,
    description: &'static str,
    shift: f64,
    force_annuitize: Option<bool>,
) -> Result<ScenarioResult> {
    let scenario = if ctx.request.mode.targets_income() {
        fund_scenario(ctx, description, shift, force_annuitize)?
    } else {
        evaluate_scenario(ctx, description, shift, force_annuitize, 0.0)?
    };
    debug!(
        description,
        consume = scenario.consume,
        annuitize = scenario.annuitize_plan,
        stocks = scenario.weights.stocks,
        "scenario"
    );
    Ok(scenario)
}

/// Baseline, low and high return scenarios for one household.
///
/// The low and high scenarios follow the baseline's annuitization decision
/// so the three differ only in the equity return.
pub fn compute_plan<O: PricingOracle>(
    oracle: &O,
    request: &AllocationRequest,
) -> Result<PlanResult> {
    let ctx = PlanContext::new(oracle, request)?;
    let z = normal_quantile(0.5 + request.confidence / 2.0);

    let baseline = run_scenario(&ctx, "Baseline estimate", 0.0, None)?;
    let force = Some(baseline.annuitize_plan);
    let low = run_scenario(&ctx, "Low returns estimate", -z, force)?;
    let high = run_scenario(&ctx, "High returns estimate", z, force)?;

    Ok(PlanResult {
        mode: request.mode,
        yield_curve_date: ctx.valuer.yield_curve_date(),
        pre_retirement_years: ctx.pre_retirement_years(),
        defined_benefits: ctx.benefits.clone(),
        present_values: baseline.present_values,
        scenarios: vec![baseline, low, high],
    })
}
