use axum::{
    Router,
    extract::{Json, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{Days, NaiveDate, Utc};
use clap::{ArgAction, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::core::{
    AllocationRequest, Balances, ContributionPlan, CovarianceMode, DefinedBenefit, JointType,
    MarketAssumptions, Owner, Person, PlanMode, PlanResult, compute_plan,
};
use crate::error::AllocError;
use crate::pricing::{ReferenceConfig, ReferenceOracle, Sex};
use crate::report::{aa_csv, allocation_csv};

const MAX_INPUT_AGE: f64 = 110.0;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum CliMode {
    /// Allocate existing savings and contributions.
    #[serde(alias = "allocation")]
    Aa,
    /// Size the portfolio needed for the desired income.
    #[serde(alias = "retirementNumber", alias = "retirement-number")]
    Number,
    /// Extra savings needed to retire now on top of what is held.
    Retire,
}

impl From<CliMode> for PlanMode {
    fn from(value: CliMode) -> Self {
        match value {
            CliMode::Aa => PlanMode::Allocation,
            CliMode::Number => PlanMode::RetirementNumber,
            CliMode::Retire => PlanMode::Retire,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
enum CliSex {
    Male,
    Female,
}

impl From<CliSex> for Sex {
    fn from(value: CliSex) -> Self {
        match value {
            CliSex::Male => Sex::Male,
            CliSex::Female => Sex::Female,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum CliCovarianceMode {
    #[serde(alias = "correlationSquared")]
    CorrelationSquared,
    Signed,
}

impl From<CliCovarianceMode> for CovarianceMode {
    fn from(value: CliCovarianceMode) -> Self {
        match value {
            CliCovarianceMode::CorrelationSquared => CovarianceMode::CorrelationSquared,
            CliCovarianceMode::Signed => CovarianceMode::Signed,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliOutput {
    Json,
    /// Chart rows for the baseline scenario.
    Csv,
}

/// One guaranteed income stream as entered by the user, percentages unconverted.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct BenefitArg {
    description: Option<String>,
    social_security: bool,
    #[serde(alias = "who")]
    owner: Owner,
    #[serde(alias = "age")]
    start_age: f64,
    amount: f64,
    inflation_indexed: bool,
    period_certain: f64,
    joint_type: JointType,
    #[serde(alias = "jointPayoutPct")]
    joint_payout: f64,
}

impl Default for BenefitArg {
    fn default() -> Self {
        Self {
            description: None,
            social_security: false,
            owner: Owner::Primary,
            start_age: 66.0,
            amount: 0.0,
            inflation_indexed: true,
            period_certain: 0.0,
            joint_type: JointType::Survivor,
            joint_payout: 0.0,
        }
    }
}

/// Parses `key=value` pairs separated by commas, e.g.
/// `ss,who=self,age=67,amount=18000` or
/// `desc=Pension,amount=9000,indexed=false,joint=contingent,payout=50`.
fn parse_benefit_arg(raw: &str) -> Result<BenefitArg, String> {
    let mut benefit = BenefitArg::default();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = part.split_once('=').unwrap_or((part, ""));
        let value = value.trim();
        match key.trim() {
            "ss" | "social-security" => benefit.social_security = parse_switch(key, value)?,
            "desc" | "description" => benefit.description = Some(value.to_string()),
            "who" | "owner" => {
                benefit.owner = match value {
                    "self" | "primary" => Owner::Primary,
                    "spouse" => Owner::Spouse,
                    _ => return Err(format!("owner must be self or spouse, got '{value}'")),
                }
            }
            "age" => benefit.start_age = parse_number(key, value)?,
            "amount" => benefit.amount = parse_number(key, value)?,
            "indexed" => benefit.inflation_indexed = parse_switch(key, value)?,
            "certain" => benefit.period_certain = parse_number(key, value)?,
            "joint" => {
                benefit.joint_type = match value {
                    "survivor" => JointType::Survivor,
                    "contingent" => JointType::Contingent,
                    _ => {
                        return Err(format!(
                            "joint must be survivor or contingent, got '{value}'"
                        ));
                    }
                }
            }
            "payout" => benefit.joint_payout = parse_number(key, value)?,
            other => return Err(format!("unknown benefit key '{other}'")),
        }
    }
    Ok(benefit)
}

fn parse_switch(key: &str, value: &str) -> Result<bool, String> {
    match value {
        "" | "true" | "yes" => Ok(true),
        "false" | "no" => Ok(false),
        _ => Err(format!("{key} must be true or false, got '{value}'")),
    }
}

fn parse_number(key: &str, value: &str) -> Result<f64, String> {
    value
        .parse::<f64>()
        .map_err(|_| format!("{key} must be a number, got '{value}'"))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct AllocPayload {
    mode: Option<CliMode>,
    sex: Option<CliSex>,
    age: Option<f64>,
    #[serde(alias = "leSet")]
    life_expectancy: Option<f64>,
    #[serde(alias = "sex2")]
    spouse_sex: Option<CliSex>,
    #[serde(alias = "age2")]
    spouse_age: Option<f64>,
    #[serde(alias = "leSet2")]
    spouse_life_expectancy: Option<f64>,
    db: Option<Vec<BenefitArg>>,
    #[serde(alias = "pTraditionalIras")]
    tax_deferred: Option<f64>,
    #[serde(alias = "pRothIras")]
    tax_free: Option<f64>,
    #[serde(alias = "p")]
    taxable: Option<f64>,
    #[serde(alias = "taxRatePct")]
    withdrawal_tax_rate: Option<f64>,
    contribution: Option<f64>,
    #[serde(alias = "contributionGrowthPct")]
    contribution_growth_rate: Option<f64>,
    #[serde(alias = "contributionVolPct")]
    contribution_volatility: Option<f64>,
    #[serde(alias = "equityContributionCorrPct")]
    equity_contribution_correlation: Option<f64>,
    #[serde(alias = "bondsContributionCorrPct")]
    bonds_contribution_correlation: Option<f64>,
    retirement_age: Option<f64>,
    #[serde(alias = "jointIncomePct")]
    joint_income: Option<f64>,
    required_income: Option<f64>,
    desired_income: Option<f64>,
    purchase_income_annuity: Option<bool>,
    use_lm_bonds: Option<bool>,
    #[serde(alias = "equityRetPct")]
    equity_return: Option<f64>,
    #[serde(alias = "equityVolPct")]
    equity_volatility: Option<f64>,
    #[serde(alias = "bondsRetPct")]
    bonds_return: Option<f64>,
    #[serde(alias = "bondsVolPct")]
    bonds_volatility: Option<f64>,
    #[serde(alias = "equityBondsCorrPct")]
    equity_bonds_correlation: Option<f64>,
    #[serde(alias = "realVol10yrPct")]
    real_volatility_10yr: Option<f64>,
    #[serde(alias = "bondsLmBondsCorrShortPct")]
    bonds_lm_bonds_correlation: Option<f64>,
    #[serde(alias = "equitySePct")]
    equity_return_se: Option<f64>,
    #[serde(alias = "expensePct")]
    expense: Option<f64>,
    covariance_mode: Option<CliCovarianceMode>,
    #[serde(alias = "confidencePct")]
    confidence: Option<f64>,
    gamma: Option<f64>,
    #[serde(alias = "riskTolerancePct")]
    risk_tolerance: Option<f64>,
    #[serde(alias = "date")]
    quote_date: Option<String>,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "lifecycle-alloc",
    about = "Life-cycle asset allocation and income annuity planner"
)]
struct Cli {
    #[arg(long, value_enum, default_value_t = CliMode::Aa)]
    mode: CliMode,
    #[arg(long, value_enum, default_value_t = CliSex::Male)]
    sex: CliSex,
    #[arg(long, default_value_t = 50.0)]
    age: f64,
    #[arg(long, help = "Expected age at death; adjusts the population life table")]
    life_expectancy: Option<f64>,
    #[arg(long, value_enum)]
    spouse_sex: Option<CliSex>,
    #[arg(long)]
    spouse_age: Option<f64>,
    #[arg(long, help = "Spouse's expected age at death")]
    spouse_life_expectancy: Option<f64>,
    #[arg(
        long,
        value_parser = parse_benefit_arg,
        help = "Defined benefit as key=value pairs: ss, desc, who, age, amount, indexed, certain, joint, payout (percent). Repeatable"
    )]
    db: Vec<BenefitArg>,
    #[arg(long, default_value_t = 0.0, help = "Traditional IRA and 401(k) balance")]
    tax_deferred: f64,
    #[arg(long, default_value_t = 0.0, help = "Roth balance")]
    tax_free: f64,
    #[arg(long, default_value_t = 0.0)]
    taxable: f64,
    #[arg(
        long,
        default_value_t = 30.0,
        help = "Flat tax rate on tax-deferred withdrawals in percent"
    )]
    withdrawal_tax_rate: f64,
    #[arg(long, default_value_t = 2000.0, help = "Annual contribution until retirement")]
    contribution: f64,
    #[arg(long, default_value_t = 7.0, help = "Annual contribution growth in percent")]
    contribution_growth_rate: f64,
    #[arg(long, default_value_t = 10.0, help = "Contribution volatility in percent")]
    contribution_volatility: f64,
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    equity_contribution_correlation: f64,
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    bonds_contribution_correlation: f64,
    #[arg(long, default_value_t = 66.0)]
    retirement_age: f64,
    #[arg(
        long,
        default_value_t = 70.0,
        help = "Percent of income continuing to the surviving partner"
    )]
    joint_income: f64,
    #[arg(long, help = "Income that must be met from guaranteed sources")]
    required_income: Option<f64>,
    #[arg(long, help = "Income above which no more is sought")]
    desired_income: Option<f64>,
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    purchase_income_annuity: bool,
    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        help = "Hold liability matching bonds in the safe bucket"
    )]
    use_lm_bonds: bool,
    #[arg(long, default_value_t = 7.2, help = "Expected real equity return in percent")]
    equity_return: f64,
    #[arg(long, default_value_t = 17.0, help = "Equity volatility in percent")]
    equity_volatility: f64,
    #[arg(
        long,
        default_value_t = 0.0,
        allow_hyphen_values = true,
        help = "Expected real bond return in percent"
    )]
    bonds_return: f64,
    #[arg(long, default_value_t = 8.7, help = "Bond volatility in percent")]
    bonds_volatility: f64,
    #[arg(long, default_value_t = 7.3, allow_hyphen_values = true)]
    equity_bonds_correlation: f64,
    #[arg(
        long,
        default_value_t = 4.9,
        help = "Volatility of ten year real interest rates in percent"
    )]
    real_volatility_10yr: f64,
    #[arg(long, default_value_t = 28.9, allow_hyphen_values = true)]
    bonds_lm_bonds_correlation: f64,
    #[arg(
        long,
        default_value_t = 1.7,
        help = "Standard error of the expected equity return in percent"
    )]
    equity_return_se: f64,
    #[arg(long, default_value_t = 0.1, help = "Investment expense ratio in percent")]
    expense: f64,
    #[arg(long, value_enum, default_value_t = CliCovarianceMode::CorrelationSquared)]
    covariance_mode: CliCovarianceMode,
    #[arg(
        long,
        default_value_t = 80.0,
        help = "Confidence level of the low and high scenarios in percent"
    )]
    confidence: f64,
    #[arg(long, default_value_t = 3.0, help = "Coefficient of relative risk aversion")]
    gamma: f64,
    #[arg(
        long,
        default_value_t = 20.0,
        help = "Largest acceptable tail loss of the investments in percent"
    )]
    risk_tolerance: f64,
    #[arg(
        long,
        help = "Quote date as YYYY-MM-DD, MM/DD/YYYY or MM/DD/YY; defaults to yesterday"
    )]
    quote_date: Option<String>,
    #[arg(
        long,
        default_value_t = 1.0,
        allow_hyphen_values = true,
        help = "Reference pricer real yield in percent"
    )]
    real_rate: f64,
    #[arg(
        long,
        default_value_t = 3.0,
        allow_hyphen_values = true,
        help = "Reference pricer nominal yield in percent"
    )]
    nominal_rate: f64,
    #[arg(long, value_enum, default_value_t = CliOutput::Json)]
    output: CliOutput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AllocResponse {
    #[serde(flatten)]
    plan: PlanResult,
    charts: Option<ChartData>,
}

#[derive(Debug, Serialize)]
struct ChartData {
    allocation: String,
    aa: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<&'static str>,
}

fn ensure_between(flag: &str, value: f64, min: f64, max: f64) -> Result<(), String> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(format!("--{flag} must be between {min} and {max}"))
    }
}

fn ensure_non_negative(flag: &str, value: f64) -> Result<(), String> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(format!("--{flag} must be >= 0"))
    }
}

fn parse_quote_date(raw: &str) -> Result<NaiveDate, String> {
    let raw = raw.trim();
    let two_digit_year = raw.rsplit('/').next().is_some_and(|year| year.len() == 2);
    let format = if raw.contains('-') {
        "%Y-%m-%d"
    } else if two_digit_year {
        "%m/%d/%y"
    } else {
        "%m/%d/%Y"
    };
    NaiveDate::parse_from_str(raw, format)
        .map_err(|_| "--quote-date must be YYYY-MM-DD, MM/DD/YYYY or MM/DD/YY".to_string())
}

/// Yesterday's quotes are the latest available.
fn default_quote_date() -> NaiveDate {
    let today = Utc::now().date_naive();
    today.checked_sub_days(Days::new(1)).unwrap_or(today)
}

fn build_person(
    flags: (&str, &str),
    sex: CliSex,
    age: f64,
    life_expectancy: Option<f64>,
) -> Result<Person, String> {
    let (age_flag, le_flag) = flags;
    ensure_between(age_flag, age, 0.0, MAX_INPUT_AGE)?;
    if let Some(le) = life_expectancy {
        ensure_between(le_flag, le, 0.0, MAX_INPUT_AGE)?;
    }
    Ok(Person {
        sex: sex.into(),
        age,
        life_expectancy_age: life_expectancy,
    })
}

fn build_benefit(benefit: &BenefitArg, has_spouse: bool) -> Result<DefinedBenefit, String> {
    ensure_between("db age", benefit.start_age, 0.0, MAX_INPUT_AGE)?;
    ensure_non_negative("db amount", benefit.amount)?;
    ensure_non_negative("db certain", benefit.period_certain)?;
    ensure_between("db payout", benefit.joint_payout, 0.0, 100.0)?;

    if benefit.owner == Owner::Spouse && benefit.amount > 0.0 && !has_spouse {
        return Err("--db spouse benefits given but no spouse present".to_string());
    }
    if benefit.social_security {
        if !benefit.inflation_indexed {
            return Err("--db Social Security must be inflation indexed".to_string());
        }
        if benefit.period_certain != 0.0 {
            return Err("--db Social Security period certain must be 0".to_string());
        }
        if benefit.joint_type == JointType::Contingent {
            return Err("--db Social Security death benefit must be survivor".to_string());
        }
    }

    Ok(DefinedBenefit {
        description: benefit.description.clone().filter(|d| !d.trim().is_empty()),
        social_security: benefit.social_security,
        owner: benefit.owner,
        start_age: benefit.start_age,
        amount: benefit.amount,
        inflation_indexed: benefit.inflation_indexed,
        period_certain: benefit.period_certain,
        joint_type: benefit.joint_type,
        joint_payout_fraction: benefit.joint_payout / 100.0,
    })
}

fn build_inputs(cli: Cli) -> Result<AllocationRequest, String> {
    let primary = build_person(
        ("age", "life-expectancy"),
        cli.sex,
        cli.age,
        cli.life_expectancy,
    )?;

    let spouse = match (cli.spouse_sex, cli.spouse_age) {
        (Some(sex), Some(age)) => Some(build_person(
            ("spouse-age", "spouse-life-expectancy"),
            sex,
            age,
            cli.spouse_life_expectancy,
        )?),
        (None, None) => None,
        _ => return Err("--spouse-sex and --spouse-age must be given together".to_string()),
    };
    if spouse.is_none() && cli.spouse_life_expectancy.is_some() {
        return Err("--spouse-life-expectancy given but no spouse present".to_string());
    }

    let defined_benefits = cli
        .db
        .iter()
        .map(|benefit| build_benefit(benefit, spouse.is_some()))
        .collect::<Result<Vec<_>, _>>()?;

    ensure_non_negative("tax-deferred", cli.tax_deferred)?;
    ensure_non_negative("tax-free", cli.tax_free)?;
    ensure_non_negative("taxable", cli.taxable)?;
    ensure_between("withdrawal-tax-rate", cli.withdrawal_tax_rate, 0.0, 100.0)?;
    ensure_non_negative("contribution", cli.contribution)?;
    ensure_non_negative("contribution-volatility", cli.contribution_volatility)?;
    ensure_between(
        "equity-contribution-correlation",
        cli.equity_contribution_correlation,
        -100.0,
        100.0,
    )?;
    ensure_between(
        "bonds-contribution-correlation",
        cli.bonds_contribution_correlation,
        -100.0,
        100.0,
    )?;
    ensure_between("retirement-age", cli.retirement_age, 0.0, MAX_INPUT_AGE)?;
    ensure_between("joint-income", cli.joint_income, 0.0, 100.0)?;

    let mode = PlanMode::from(cli.mode);
    if let Some(required) = cli.required_income {
        ensure_non_negative("required-income", required)?;
    }
    if let Some(desired) = cli.desired_income {
        ensure_non_negative("desired-income", desired)?;
    }
    if mode.targets_income() && cli.required_income.is_none() {
        return Err("--required-income is required in number and retire modes".to_string());
    }
    if let (Some(required), Some(desired)) = (cli.required_income, cli.desired_income) {
        if required > desired {
            return Err("--required-income must be <= --desired-income".to_string());
        }
    }

    if !cli.equity_return.is_finite() || !cli.bonds_return.is_finite() {
        return Err("--equity-return and --bonds-return must be numbers".to_string());
    }
    // Zero volatility or perfect correlation leaves the optimizer without a solution.
    ensure_between("equity-volatility", cli.equity_volatility, 1.0, 100.0)?;
    ensure_between("bonds-volatility", cli.bonds_volatility, 1.0, 100.0)?;
    ensure_between("equity-bonds-correlation", cli.equity_bonds_correlation, -99.0, 99.0)?;
    ensure_non_negative("real-volatility-10yr", cli.real_volatility_10yr)?;
    ensure_between(
        "bonds-lm-bonds-correlation",
        cli.bonds_lm_bonds_correlation,
        -100.0,
        100.0,
    )?;
    ensure_non_negative("equity-return-se", cli.equity_return_se)?;
    ensure_non_negative("expense", cli.expense)?;
    ensure_between("confidence", cli.confidence, 0.0, 99.99)?;
    if !cli.gamma.is_finite() || cli.gamma <= 0.0 || cli.gamma > 50.0 {
        return Err("--gamma must be > 0 and <= 50".to_string());
    }
    ensure_non_negative("risk-tolerance", cli.risk_tolerance)?;

    let quote_date = match cli.quote_date.as_deref() {
        Some(raw) => parse_quote_date(raw)?,
        None => default_quote_date(),
    };

    Ok(AllocationRequest {
        mode,
        primary,
        spouse,
        defined_benefits,
        balances: Balances {
            tax_deferred: cli.tax_deferred,
            tax_free: cli.tax_free,
            taxable: cli.taxable,
        },
        withdrawal_tax_rate: cli.withdrawal_tax_rate / 100.0,
        contributions: ContributionPlan {
            amount: cli.contribution,
            growth: cli.contribution_growth_rate / 100.0,
            vol: cli.contribution_volatility / 100.0,
            equity_correlation: cli.equity_contribution_correlation / 100.0,
            bonds_correlation: cli.bonds_contribution_correlation / 100.0,
        },
        retirement_age: cli.retirement_age,
        joint_income_fraction: cli.joint_income / 100.0,
        required_income: cli.required_income,
        desired_income: cli.desired_income,
        purchase_income_annuity: cli.purchase_income_annuity,
        use_lm_bonds: cli.use_lm_bonds,
        market: MarketAssumptions {
            equity_return: cli.equity_return / 100.0,
            equity_vol: cli.equity_volatility / 100.0,
            bonds_return: cli.bonds_return / 100.0,
            bonds_vol: cli.bonds_volatility / 100.0,
            equity_bonds_correlation: cli.equity_bonds_correlation / 100.0,
            real_vol_10yr: cli.real_volatility_10yr / 100.0,
            bonds_lm_bonds_correlation_short: cli.bonds_lm_bonds_correlation / 100.0,
            equity_return_se: cli.equity_return_se / 100.0,
            expense: cli.expense / 100.0,
            covariance_mode: cli.covariance_mode.into(),
        },
        gamma: cli.gamma,
        risk_tolerance: cli.risk_tolerance / 100.0,
        quote_date,
        confidence: cli.confidence / 100.0,
    })
}

fn reference_config(cli: &Cli) -> Result<ReferenceConfig, String> {
    if !cli.real_rate.is_finite() || cli.real_rate <= -100.0 {
        return Err("--real-rate must be > -100".to_string());
    }
    if !cli.nominal_rate.is_finite() || cli.nominal_rate <= -100.0 {
        return Err("--nominal-rate must be > -100".to_string());
    }
    Ok(ReferenceConfig {
        real_rate: cli.real_rate / 100.0,
        nominal_rate: cli.nominal_rate / 100.0,
        ..ReferenceConfig::default()
    })
}

fn describe_error(err: &AllocError) -> String {
    match err.field() {
        Some(field) => format!("{field}: {err}"),
        None => err.to_string(),
    }
}

fn charts_for(plan: &PlanResult) -> Option<ChartData> {
    plan.baseline().map(|baseline| ChartData {
        allocation: allocation_csv(plan.mode, baseline),
        aa: aa_csv(baseline),
    })
}

/// Parses command line arguments, computes the plan with the reference pricer
/// and renders it. Exits the process on `--help` or unparseable arguments.
pub fn run_cli<I, T>(args: I) -> Result<String, String>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    let output = cli.output;
    let oracle = ReferenceOracle::new(reference_config(&cli)?);
    let request = build_inputs(cli)?;
    info!(mode = ?request.mode, date = %request.quote_date, "computing plan");

    let plan = compute_plan(&oracle, &request).map_err(|err| describe_error(&err))?;
    match output {
        CliOutput::Json => serde_json::to_string_pretty(&plan)
            .map_err(|e| format!("Failed to serialize plan: {e}")),
        CliOutput::Csv => Ok(charts_for(&plan)
            .map(|charts| format!("{}\n{}", charts.allocation, charts.aa))
            .unwrap_or_default()),
    }
}

pub async fn run_http_server(port: u16, config: ReferenceConfig) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let oracle = Arc::new(ReferenceOracle::new(config));
    let app = Router::new()
        .route("/api/alloc", get(alloc_get_handler).post(alloc_post_handler))
        .route("/healthz", get(health_handler))
        .fallback(not_found_handler)
        .with_state(oracle);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "allocation HTTP API listening");

    axum::serve(listener, app).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found", None)
}

async fn alloc_get_handler(
    State(oracle): State<Arc<ReferenceOracle>>,
    Query(payload): Query<AllocPayload>,
) -> Response {
    alloc_response(&oracle, payload)
}

async fn alloc_post_handler(
    State(oracle): State<Arc<ReferenceOracle>>,
    Json(payload): Json<AllocPayload>,
) -> Response {
    alloc_response(&oracle, payload)
}

/// Runs the default household end to end.
async fn health_handler(State(oracle): State<Arc<ReferenceOracle>>) -> Response {
    let outcome = build_inputs(default_cli_for_api())
        .and_then(|request| compute_plan(&*oracle, &request).map_err(|e| describe_error(&e)));
    match outcome {
        Ok(_) => json_response(StatusCode::OK, serde_json::json!({ "status": "ok" })),
        Err(msg) => {
            warn!(error = %msg, "health check failed");
            error_response(StatusCode::SERVICE_UNAVAILABLE, &msg, None)
        }
    }
}

fn alloc_response(oracle: &ReferenceOracle, payload: AllocPayload) -> Response {
    let request = match api_request_from_payload(payload) {
        Ok(request) => request,
        Err(msg) => {
            info!(error = %msg, "rejected allocation request");
            return error_response(StatusCode::BAD_REQUEST, &msg, None);
        }
    };

    match compute_plan(oracle, &request) {
        Ok(plan) => {
            info!(
                mode = ?plan.mode,
                consume = plan.baseline().map(|s| s.consume),
                "allocation computed"
            );
            let charts = charts_for(&plan);
            json_response(StatusCode::OK, AllocResponse { plan, charts })
        }
        Err(err) => {
            warn!(error = %err, field = err.field(), "allocation failed");
            error_response(StatusCode::UNPROCESSABLE_ENTITY, &err.to_string(), err.field())
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str, field: Option<&'static str>) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
            field,
        },
    )
}

#[cfg(test)]
fn api_request_from_json(json: &str) -> Result<AllocationRequest, String> {
    let payload = serde_json::from_str::<AllocPayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    api_request_from_payload(payload)
}

fn api_request_from_payload(payload: AllocPayload) -> Result<AllocationRequest, String> {
    let mut cli = default_cli_for_api();

    if let Some(v) = payload.mode {
        cli.mode = v;
    }
    if let Some(v) = payload.sex {
        cli.sex = v;
    }
    if let Some(v) = payload.age {
        cli.age = v;
    }
    cli.life_expectancy = payload.life_expectancy;
    cli.spouse_sex = payload.spouse_sex;
    cli.spouse_age = payload.spouse_age;
    cli.spouse_life_expectancy = payload.spouse_life_expectancy;
    if let Some(v) = payload.db {
        cli.db = v;
    }
    if let Some(v) = payload.tax_deferred {
        cli.tax_deferred = v;
    }
    if let Some(v) = payload.tax_free {
        cli.tax_free = v;
    }
    if let Some(v) = payload.taxable {
        cli.taxable = v;
    }
    if let Some(v) = payload.withdrawal_tax_rate {
        cli.withdrawal_tax_rate = v;
    }
    if let Some(v) = payload.contribution {
        cli.contribution = v;
    }
    if let Some(v) = payload.contribution_growth_rate {
        cli.contribution_growth_rate = v;
    }
    if let Some(v) = payload.contribution_volatility {
        cli.contribution_volatility = v;
    }
    if let Some(v) = payload.equity_contribution_correlation {
        cli.equity_contribution_correlation = v;
    }
    if let Some(v) = payload.bonds_contribution_correlation {
        cli.bonds_contribution_correlation = v;
    }
    if let Some(v) = payload.retirement_age {
        cli.retirement_age = v;
    }
    if let Some(v) = payload.joint_income {
        cli.joint_income = v;
    }
    cli.required_income = payload.required_income;
    cli.desired_income = payload.desired_income;
    if let Some(v) = payload.purchase_income_annuity {
        cli.purchase_income_annuity = v;
    }
    if let Some(v) = payload.use_lm_bonds {
        cli.use_lm_bonds = v;
    }
    if let Some(v) = payload.equity_return {
        cli.equity_return = v;
    }
    if let Some(v) = payload.equity_volatility {
        cli.equity_volatility = v;
    }
    if let Some(v) = payload.bonds_return {
        cli.bonds_return = v;
    }
    if let Some(v) = payload.bonds_volatility {
        cli.bonds_volatility = v;
    }
    if let Some(v) = payload.equity_bonds_correlation {
        cli.equity_bonds_correlation = v;
    }
    if let Some(v) = payload.real_volatility_10yr {
        cli.real_volatility_10yr = v;
    }
    if let Some(v) = payload.bonds_lm_bonds_correlation {
        cli.bonds_lm_bonds_correlation = v;
    }
    if let Some(v) = payload.equity_return_se {
        cli.equity_return_se = v;
    }
    if let Some(v) = payload.expense {
        cli.expense = v;
    }
    if let Some(v) = payload.covariance_mode {
        cli.covariance_mode = v;
    }
    if let Some(v) = payload.confidence {
        cli.confidence = v;
    }
    if let Some(v) = payload.gamma {
        cli.gamma = v;
    }
    if let Some(v) = payload.risk_tolerance {
        cli.risk_tolerance = v;
    }
    if let Some(v) = payload.quote_date.filter(|d| !d.trim().is_empty()) {
        cli.quote_date = Some(v);
    }

    build_inputs(cli)
}

fn default_cli_for_api() -> Cli {
    Cli {
        mode: CliMode::Aa,
        sex: CliSex::Male,
        age: 50.0,
        life_expectancy: None,
        spouse_sex: None,
        spouse_age: None,
        spouse_life_expectancy: None,
        db: vec![BenefitArg {
            social_security: true,
            amount: 15_000.0,
            ..BenefitArg::default()
        }],
        tax_deferred: 0.0,
        tax_free: 0.0,
        taxable: 0.0,
        withdrawal_tax_rate: 30.0,
        contribution: 2_000.0,
        contribution_growth_rate: 7.0,
        contribution_volatility: 10.0,
        equity_contribution_correlation: 0.0,
        bonds_contribution_correlation: 0.0,
        retirement_age: 66.0,
        joint_income: 70.0,
        required_income: None,
        desired_income: None,
        purchase_income_annuity: true,
        use_lm_bonds: true,
        equity_return: 7.2,
        equity_volatility: 17.0,
        bonds_return: 0.0,
        bonds_volatility: 8.7,
        equity_bonds_correlation: 7.3,
        real_volatility_10yr: 4.9,
        bonds_lm_bonds_correlation: 28.9,
        equity_return_se: 1.7,
        expense: 0.1,
        covariance_mode: CliCovarianceMode::CorrelationSquared,
        confidence: 80.0,
        gamma: 3.0,
        risk_tolerance: 20.0,
        quote_date: None,
        real_rate: 1.0,
        nominal_rate: 3.0,
        output: CliOutput::Json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn sample_cli() -> Cli {
        let mut cli = default_cli_for_api();
        cli.tax_deferred = 200_000.0;
        cli.tax_free = 100_000.0;
        cli.taxable = 300_000.0;
        cli.quote_date = Some("2024-06-03".to_string());
        cli
    }

    fn oracle() -> ReferenceOracle {
        ReferenceOracle::new(ReferenceConfig::default())
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[test]
    fn build_inputs_converts_percentages_to_fractions() {
        let request = build_inputs(sample_cli()).expect("valid inputs");

        assert_eq!(request.mode, PlanMode::Allocation);
        assert_approx(request.market.equity_return, 0.072);
        assert_approx(request.market.equity_vol, 0.17);
        assert_approx(request.market.bonds_lm_bonds_correlation_short, 0.289);
        assert_approx(request.market.expense, 0.001);
        assert_approx(request.withdrawal_tax_rate, 0.3);
        assert_approx(request.contributions.growth, 0.07);
        assert_approx(request.joint_income_fraction, 0.7);
        assert_approx(request.risk_tolerance, 0.2);
        assert_approx(request.confidence, 0.8);
        assert_approx(request.gamma, 3.0);
        assert_eq!(
            request.quote_date,
            NaiveDate::from_ymd_opt(2024, 6, 3).expect("date")
        );
        assert_eq!(request.defined_benefits.len(), 1);
        assert!(request.defined_benefits[0].social_security);
        assert_eq!(request.defined_benefits[0].label(), "Social Security");
    }

    #[test]
    fn clap_parses_flags_and_repeated_benefits() {
        let cli = Cli::try_parse_from([
            "lifecycle-alloc",
            "--mode",
            "retire",
            "--spouse-sex",
            "female",
            "--spouse-age",
            "48",
            "--db",
            "ss,amount=18000,age=67",
            "--db",
            "desc=Pension,who=spouse,amount=9000,indexed=false,joint=contingent,payout=50",
            "--required-income",
            "30000",
            "--use-lm-bonds",
            "false",
            "--bonds-return",
            "-0.5",
            "--quote-date",
            "06/03/2024",
        ])
        .expect("valid args");
        let request = build_inputs(cli).expect("valid inputs");

        assert_eq!(request.mode, PlanMode::Retire);
        assert!(!request.use_lm_bonds);
        assert_approx(request.market.bonds_return, -0.005);
        assert_eq!(request.spouse.as_ref().map(|s| s.sex), Some(Sex::Female));
        assert_eq!(request.defined_benefits.len(), 2);

        let pension = &request.defined_benefits[1];
        assert_eq!(pension.label(), "Pension");
        assert_eq!(pension.owner, Owner::Spouse);
        assert!(!pension.inflation_indexed);
        assert_eq!(pension.joint_type, JointType::Contingent);
        assert_approx(pension.joint_payout_fraction, 0.5);
        assert_eq!(
            request.quote_date,
            NaiveDate::from_ymd_opt(2024, 6, 3).expect("date")
        );
    }

    #[test]
    fn benefit_arg_rejects_unknown_keys_and_values() {
        assert!(parse_benefit_arg("amount=12000,colour=blue").is_err());
        assert!(parse_benefit_arg("who=cousin").is_err());
        assert!(parse_benefit_arg("amount=lots").is_err());
        assert!(parse_benefit_arg("indexed=maybe").is_err());

        let parsed = parse_benefit_arg("ss, amount = 15000").expect("valid");
        assert!(parsed.social_security);
        assert_approx(parsed.amount, 15_000.0);
        assert_approx(parsed.start_age, 66.0);
    }

    #[test]
    fn build_inputs_requires_spouse_sex_and_age_together() {
        let mut cli = sample_cli();
        cli.spouse_age = Some(45.0);

        let err = build_inputs(cli).expect_err("must reject half a spouse");
        assert!(err.contains("--spouse-sex"));
    }

    #[test]
    fn build_inputs_rejects_spouse_life_expectancy_without_spouse() {
        let mut cli = sample_cli();
        cli.spouse_life_expectancy = Some(90.0);

        let err = build_inputs(cli).expect_err("must reject orphan life expectancy");
        assert!(err.contains("--spouse-life-expectancy"));
    }

    #[test]
    fn build_inputs_rejects_spouse_benefits_without_spouse() {
        let mut cli = sample_cli();
        cli.db.push(BenefitArg {
            owner: Owner::Spouse,
            amount: 5_000.0,
            ..BenefitArg::default()
        });
        let err = build_inputs(cli).expect_err("must reject spouse benefit");
        assert!(err.contains("no spouse"));

        let mut cli = sample_cli();
        cli.db.push(BenefitArg {
            owner: Owner::Spouse,
            ..BenefitArg::default()
        });
        assert!(build_inputs(cli).is_ok());
    }

    #[test]
    fn build_inputs_enforces_social_security_shape() {
        let mut cli = sample_cli();
        cli.db[0].inflation_indexed = false;
        assert!(
            build_inputs(cli)
                .expect_err("unindexed")
                .contains("inflation indexed")
        );

        let mut cli = sample_cli();
        cli.db[0].period_certain = 5.0;
        assert!(
            build_inputs(cli)
                .expect_err("period certain")
                .contains("period certain")
        );

        let mut cli = sample_cli();
        cli.db[0].joint_type = JointType::Contingent;
        assert!(build_inputs(cli).expect_err("contingent").contains("survivor"));
    }

    #[test]
    fn build_inputs_rejects_required_above_desired() {
        let mut cli = sample_cli();
        cli.required_income = Some(50_000.0);
        cli.desired_income = Some(40_000.0);

        let err = build_inputs(cli).expect_err("must reject inverted targets");
        assert!(err.contains("--required-income"));
    }

    #[test]
    fn income_modes_need_a_required_income() {
        let mut cli = sample_cli();
        cli.mode = CliMode::Number;
        let err = build_inputs(cli).expect_err("number mode needs an income");
        assert!(err.contains("--required-income"));

        let mut cli = sample_cli();
        cli.mode = CliMode::Number;
        cli.required_income = Some(20_000.0);
        assert!(build_inputs(cli).is_ok());
    }

    #[test]
    fn build_inputs_checks_bounds() {
        let cases: [(fn(&mut Cli), &str); 6] = [
            (|c: &mut Cli| c.age = 111.0, "--age"),
            (|c: &mut Cli| c.taxable = -1.0, "--taxable"),
            (|c: &mut Cli| c.gamma = 0.0, "--gamma"),
            (|c: &mut Cli| c.confidence = 100.0, "--confidence"),
            (|c: &mut Cli| c.equity_bonds_correlation = 100.0, "--equity-bonds-correlation"),
            (|c: &mut Cli| c.equity_volatility = 0.0, "--equity-volatility"),
        ];
        for (mutate, flag) in cases {
            let mut cli = sample_cli();
            mutate(&mut cli);
            let err = build_inputs(cli).expect_err("out of range");
            assert!(err.contains(flag), "{err} should name {flag}");
        }
    }

    #[test]
    fn quote_dates_accept_three_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 6, 3).expect("date");
        assert_eq!(parse_quote_date("2024-06-03"), Ok(expected));
        assert_eq!(parse_quote_date("06/03/2024"), Ok(expected));
        assert_eq!(parse_quote_date("06/03/24"), Ok(expected));
        assert!(parse_quote_date("3 June 2024").is_err());
    }

    #[test]
    fn api_request_from_json_parses_web_keys() {
        let json = r#"{
          "mode": "number",
          "sex": "female",
          "age": 60,
          "sex2": "male",
          "age2": 62,
          "leSet": 92,
          "db": [
            {"socialSecurity": true, "who": "self", "age": 67, "amount": 20000},
            {"description": "Pension", "who": "spouse", "age": 65, "amount": 10000,
             "inflationIndexed": false, "periodCertain": 5, "jointType": "contingent",
             "jointPayoutPct": 60}
          ],
          "requiredIncome": 30000,
          "desiredIncome": 60000,
          "equityRetPct": 6.5,
          "riskTolerancePct": 15,
          "covarianceMode": "signed",
          "date": "2024-06-03"
        }"#;
        let request = api_request_from_json(json).expect("json should parse");

        assert_eq!(request.mode, PlanMode::RetirementNumber);
        assert_eq!(request.primary.sex, Sex::Female);
        assert_eq!(request.primary.life_expectancy_age, Some(92.0));
        assert_eq!(request.spouse.as_ref().map(|s| s.age), Some(62.0));
        assert_eq!(request.defined_benefits.len(), 2);
        assert_approx(request.defined_benefits[0].start_age, 67.0);
        assert_eq!(request.defined_benefits[1].owner, Owner::Spouse);
        assert_approx(request.defined_benefits[1].joint_payout_fraction, 0.6);
        assert_eq!(request.required_income, Some(30_000.0));
        assert_eq!(request.desired_income, Some(60_000.0));
        assert_approx(request.market.equity_return, 0.065);
        assert_approx(request.risk_tolerance, 0.15);
        assert_eq!(request.market.covariance_mode, CovarianceMode::Signed);
    }

    #[test]
    fn api_request_defaults_match_cli_defaults() {
        let from_api = api_request_from_json(r#"{"date": "2024-06-03"}"#).expect("defaults");
        let mut cli = Cli::try_parse_from(["lifecycle-alloc", "--db", "ss,amount=15000"])
            .expect("defaults");
        cli.quote_date = Some("2024-06-03".to_string());
        let from_cli = build_inputs(cli).expect("defaults");

        assert_eq!(from_api.market, from_cli.market);
        assert_eq!(from_api.contributions, from_cli.contributions);
        assert_eq!(from_api.defined_benefits, from_cli.defined_benefits);
        assert_eq!(from_api.primary, from_cli.primary);
        assert_approx(from_api.risk_tolerance, from_cli.risk_tolerance);
    }

    #[tokio::test]
    async fn alloc_response_returns_plan_and_charts() {
        let payload = serde_json::from_str::<AllocPayload>(
            r#"{"taxable": 500000, "date": "2024-06-03"}"#,
        )
        .expect("payload");
        let response = alloc_response(&oracle(), payload);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CACHE_CONTROL)
                .and_then(|v| v.to_str().ok()),
            Some("no-store")
        );

        let body = body_json(response).await;
        assert_eq!(body["mode"], "allocation");
        assert_eq!(body["scenarios"].as_array().map(Vec::len), Some(3));
        let allocation = body["charts"]["allocation"].as_str().expect("csv");
        assert!(allocation.starts_with("class,allocation\nstocks,"));
        assert!(allocation.contains("future contribs"));
    }

    #[tokio::test]
    async fn invalid_inputs_are_bad_requests() {
        let payload = serde_json::from_str::<AllocPayload>(r#"{"age2": 40}"#).expect("payload");
        let response = alloc_response(&oracle(), payload);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert!(body["error"].as_str().is_some_and(|e| e.contains("--spouse-sex")));
        assert!(body.get("field").is_none());
    }

    #[tokio::test]
    async fn engine_failures_name_the_field() {
        let payload =
            serde_json::from_str::<AllocPayload>(r#"{"date": "2001-02-05"}"#).expect("payload");
        let response = alloc_response(&oracle(), payload);
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = body_json(response).await;
        assert_eq!(body["field"], "quoteDate");
        assert!(
            body["error"]
                .as_str()
                .is_some_and(|e| e.contains("2001-02-05"))
        );
    }

    #[test]
    fn csv_output_renders_both_charts() {
        let output = run_cli([
            "lifecycle-alloc",
            "--taxable",
            "400000",
            "--quote-date",
            "2024-06-03",
            "--output",
            "csv",
        ])
        .expect("plan");
        assert!(output.starts_with("class,allocation\n"));
        assert!(output.contains("\nasset class,allocation\nstocks,"));
    }
}
