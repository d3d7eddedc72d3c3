use axum::{
    Router,
    extract::{Json, Query},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::core::{
    BenefitPhase, LedgerRow, PhasedIncome, ReturnModel, ShockOverride, SimulationConfig,
    SolveBounds, SpendingPolicy, SteppedAnnuity, build_guardrail_plan, estimate_risk,
    run_guardrail_policy, solve_balance_for_risk, solve_spending_for_risk,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliReturnModel {
    AdditiveNormal,
    LogNormal,
}

impl From<CliReturnModel> for ReturnModel {
    fn from(value: CliReturnModel) -> Self {
        match value {
            CliReturnModel::AdditiveNormal => ReturnModel::AdditiveNormal,
            CliReturnModel::LogNormal => ReturnModel::LogNormal,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiReturnModel {
    #[serde(alias = "additiveNormal", alias = "additive_normal", alias = "normal")]
    AdditiveNormal,
    #[serde(alias = "logNormal", alias = "log_normal", alias = "lognormal")]
    LogNormal,
}

impl From<ApiReturnModel> for CliReturnModel {
    fn from(value: ApiReturnModel) -> Self {
        match value {
            ApiReturnModel::AdditiveNormal => CliReturnModel::AdditiveNormal,
            ApiReturnModel::LogNormal => CliReturnModel::LogNormal,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "guardrails",
    about = "Monte Carlo risk-of-ruin planner with guardrail spending adjustments"
)]
struct Cli {
    #[arg(
        long,
        default_value_t = 1_500_000.0,
        help = "Starting portfolio balance in today's money"
    )]
    balance: f64,
    #[arg(
        long,
        help = "Base annual spending in today's money; solved from --target-risk when omitted"
    )]
    spending: Option<f64>,
    #[arg(long, default_value_t = 100_000, help = "Monte Carlo trials per risk estimate")]
    simulations: u32,
    #[arg(long, default_value_t = 30, help = "Years the plan must fund")]
    horizon_years: u32,
    #[arg(
        long,
        default_value_t = 3.9,
        help = "Expected annual real return in percent"
    )]
    mean_return: f64,
    #[arg(
        long,
        default_value_t = 10.89,
        help = "Annual real return volatility in percent"
    )]
    return_volatility: f64,
    #[arg(long, value_enum, default_value_t = CliReturnModel::AdditiveNormal)]
    return_model: CliReturnModel,
    #[arg(long, default_value_t = 2.5, help = "Expected annual inflation in percent")]
    inflation_rate: f64,
    #[arg(
        long,
        default_value_t = 0.0,
        help = "Inflation volatility in percent; 0 keeps inflation deterministic"
    )]
    inflation_volatility: f64,
    #[arg(
        long,
        default_value_t = 15.0,
        help = "Ruin risk the plan re-targets after a guardrail adjustment, percent"
    )]
    target_risk: f64,
    #[arg(
        long,
        default_value_t = 20.0,
        help = "Projected risk that triggers a spending cut, percent"
    )]
    cut_risk: f64,
    #[arg(
        long,
        default_value_t = 5.0,
        help = "Projected risk that triggers a spending raise, percent"
    )]
    raise_risk: f64,
    #[arg(
        long,
        default_value_t = 1.0,
        help = "Spending multiplier during the initial go-go window"
    )]
    go_go_multiplier: f64,
    #[arg(long, default_value_t = 0, help = "Length of the go-go window in years")]
    go_go_years: u32,
    #[arg(
        long,
        default_value_t = 0,
        help = "Forced poor-return years at the start of every path"
    )]
    shock_years: u32,
    #[arg(
        long,
        default_value_t = -15.0,
        help = "Annual return during forced shock years, percent"
    )]
    shock_return: f64,
    #[arg(long, default_value_t = 20, help = "Bisection iterations per solve")]
    solver_iterations: u32,
    #[arg(
        long,
        default_value_t = 30.0,
        help = "Upper spending search bound as percent of balance"
    )]
    spending_search_limit: f64,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(
        long,
        default_value_t = 0.0,
        help = "Primary annual benefit (e.g. state pension) in today's money"
    )]
    benefit_annual: f64,
    #[arg(long, default_value_t = 1)]
    benefit_start_year: u32,
    #[arg(
        long,
        default_value_t = 1.0,
        help = "Fraction of the primary benefit paid in its first year"
    )]
    benefit_first_year_fraction: f64,
    #[arg(
        long,
        default_value_t = 0.0,
        help = "Secondary annual benefit (e.g. a spouse's later claim)"
    )]
    second_benefit_annual: f64,
    #[arg(long, default_value_t = 2)]
    second_benefit_start_year: u32,
    #[arg(long, default_value_t = 1.0)]
    second_benefit_first_year_fraction: f64,
    #[arg(long, default_value_t = 0.0, help = "Nominal annuity payout per year")]
    annuity_annual: f64,
    #[arg(long, default_value_t = 2)]
    annuity_start_year: u32,
    #[arg(
        long,
        default_value_t = 0.75,
        help = "Fraction of the annuity paid in its first year"
    )]
    annuity_first_year_fraction: f64,
    #[arg(
        long,
        default_value_t = 7.0,
        help = "Nominal return above which the annuity steps up, percent"
    )]
    annuity_step_up_threshold: f64,
}

#[derive(Debug)]
struct ApiRequest {
    config: SimulationConfig,
    income: PhasedIncome,
    balance: f64,
    spending: Option<f64>,
}

impl ApiRequest {
    fn spending_bounds(&self) -> SolveBounds {
        SolveBounds {
            lo: 0.0,
            hi: self.balance * self.config.spending_search_fraction,
        }
    }

    fn balance_bounds(&self, spending: f64) -> SolveBounds {
        SolveBounds {
            lo: 0.0,
            hi: (spending * 50.0).max(self.balance),
        }
    }
}

fn build_request(cli: Cli) -> Result<ApiRequest, String> {
    if !cli.balance.is_finite() || cli.balance <= 0.0 {
        return Err("--balance must be > 0".to_string());
    }
    if let Some(spending) = cli.spending {
        if !spending.is_finite() || spending < 0.0 {
            return Err("--spending must be >= 0".to_string());
        }
    }
    if cli.simulations == 0 {
        return Err("--simulations must be > 0".to_string());
    }
    if cli.return_volatility < 0.0 {
        return Err("--return-volatility must be >= 0".to_string());
    }
    if cli.inflation_volatility < 0.0 {
        return Err("--inflation-volatility must be >= 0".to_string());
    }
    for (value, flag) in [
        (cli.target_risk, "--target-risk"),
        (cli.cut_risk, "--cut-risk"),
        (cli.raise_risk, "--raise-risk"),
    ] {
        if !(0.0..=100.0).contains(&value) {
            return Err(format!("{flag} must be between 0 and 100"));
        }
    }
    if cli.go_go_multiplier <= 0.0 {
        return Err("--go-go-multiplier must be > 0".to_string());
    }
    if cli.shock_return < -100.0 {
        return Err("--shock-return must be >= -100".to_string());
    }
    if cli.solver_iterations == 0 {
        return Err("--solver-iterations must be > 0".to_string());
    }
    if cli.spending_search_limit <= 0.0 {
        return Err("--spending-search-limit must be > 0".to_string());
    }
    for (value, flag) in [
        (cli.benefit_first_year_fraction, "--benefit-first-year-fraction"),
        (
            cli.second_benefit_first_year_fraction,
            "--second-benefit-first-year-fraction",
        ),
        (
            cli.annuity_first_year_fraction,
            "--annuity-first-year-fraction",
        ),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(format!("{flag} must be between 0 and 1"));
        }
    }
    for (value, flag) in [
        (cli.benefit_annual, "--benefit-annual"),
        (cli.second_benefit_annual, "--second-benefit-annual"),
        (cli.annuity_annual, "--annuity-annual"),
    ] {
        if !value.is_finite() || value < 0.0 {
            return Err(format!("{flag} must be >= 0"));
        }
    }

    let shock = (cli.shock_years > 0).then_some(ShockOverride {
        years: cli.shock_years,
        annual_return: cli.shock_return / 100.0,
    });

    let config = SimulationConfig {
        trials: cli.simulations,
        horizon_years: cli.horizon_years,
        mean_return: cli.mean_return / 100.0,
        return_vol: cli.return_volatility / 100.0,
        return_model: cli.return_model.into(),
        inflation_mean: cli.inflation_rate / 100.0,
        inflation_vol: cli.inflation_volatility / 100.0,
        target_risk: cli.target_risk / 100.0,
        cut_risk: cli.cut_risk / 100.0,
        raise_risk: cli.raise_risk / 100.0,
        go_go_multiplier: cli.go_go_multiplier,
        go_go_years: cli.go_go_years,
        shock,
        solver_iterations: cli.solver_iterations,
        spending_search_fraction: cli.spending_search_limit / 100.0,
        seed: cli.seed,
    };
    config.validate()?;

    let mut benefits = Vec::new();
    if cli.benefit_annual > 0.0 {
        benefits.push(BenefitPhase {
            annual_amount: cli.benefit_annual,
            start_year: cli.benefit_start_year,
            first_year_fraction: cli.benefit_first_year_fraction,
        });
    }
    if cli.second_benefit_annual > 0.0 {
        benefits.push(BenefitPhase {
            annual_amount: cli.second_benefit_annual,
            start_year: cli.second_benefit_start_year,
            first_year_fraction: cli.second_benefit_first_year_fraction,
        });
    }
    let annuity = (cli.annuity_annual > 0.0).then_some(SteppedAnnuity {
        annual_amount: cli.annuity_annual,
        start_year: cli.annuity_start_year,
        first_year_fraction: cli.annuity_first_year_fraction,
        step_up_threshold: cli.annuity_step_up_threshold / 100.0,
    });

    Ok(ApiRequest {
        config,
        income: PhasedIncome { benefits, annuity },
        balance: cli.balance,
        spending: cli.spending,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    balance: Option<f64>,
    spending: Option<f64>,
    simulations: Option<u32>,
    horizon_years: Option<u32>,
    mean_return: Option<f64>,
    return_volatility: Option<f64>,
    return_model: Option<ApiReturnModel>,
    inflation_rate: Option<f64>,
    inflation_volatility: Option<f64>,
    target_risk: Option<f64>,
    cut_risk: Option<f64>,
    raise_risk: Option<f64>,
    go_go_multiplier: Option<f64>,
    go_go_years: Option<u32>,
    shock_years: Option<u32>,
    shock_return: Option<f64>,
    solver_iterations: Option<u32>,
    spending_search_limit: Option<f64>,
    seed: Option<u64>,
    benefit_annual: Option<f64>,
    benefit_start_year: Option<u32>,
    benefit_first_year_fraction: Option<f64>,
    second_benefit_annual: Option<f64>,
    second_benefit_start_year: Option<u32>,
    second_benefit_first_year_fraction: Option<f64>,
    annuity_annual: Option<f64>,
    annuity_start_year: Option<u32>,
    annuity_first_year_fraction: Option<f64>,
    annuity_step_up_threshold: Option<f64>,
}

fn default_cli_for_api() -> Cli {
    Cli {
        balance: 1_500_000.0,
        spending: None,
        simulations: 100_000,
        horizon_years: 30,
        mean_return: 3.9,
        return_volatility: 10.89,
        return_model: CliReturnModel::AdditiveNormal,
        inflation_rate: 2.5,
        inflation_volatility: 0.0,
        target_risk: 15.0,
        cut_risk: 20.0,
        raise_risk: 5.0,
        go_go_multiplier: 1.0,
        go_go_years: 0,
        shock_years: 0,
        shock_return: -15.0,
        solver_iterations: 20,
        spending_search_limit: 30.0,
        seed: 42,
        benefit_annual: 0.0,
        benefit_start_year: 1,
        benefit_first_year_fraction: 1.0,
        second_benefit_annual: 0.0,
        second_benefit_start_year: 2,
        second_benefit_first_year_fraction: 1.0,
        annuity_annual: 0.0,
        annuity_start_year: 2,
        annuity_first_year_fraction: 0.75,
        annuity_step_up_threshold: 7.0,
    }
}

fn request_from_payload(payload: SimulatePayload) -> Result<ApiRequest, String> {
    let mut cli = default_cli_for_api();

    if let Some(v) = payload.balance {
        cli.balance = v;
    }
    if payload.spending.is_some() {
        cli.spending = payload.spending;
    }
    if let Some(v) = payload.simulations {
        cli.simulations = v;
    }
    if let Some(v) = payload.horizon_years {
        cli.horizon_years = v;
    }
    if let Some(v) = payload.mean_return {
        cli.mean_return = v;
    }
    if let Some(v) = payload.return_volatility {
        cli.return_volatility = v;
    }
    if let Some(v) = payload.return_model {
        cli.return_model = v.into();
    }
    if let Some(v) = payload.inflation_rate {
        cli.inflation_rate = v;
    }
    if let Some(v) = payload.inflation_volatility {
        cli.inflation_volatility = v;
    }
    if let Some(v) = payload.target_risk {
        cli.target_risk = v;
    }
    if let Some(v) = payload.cut_risk {
        cli.cut_risk = v;
    }
    if let Some(v) = payload.raise_risk {
        cli.raise_risk = v;
    }
    if let Some(v) = payload.go_go_multiplier {
        cli.go_go_multiplier = v;
    }
    if let Some(v) = payload.go_go_years {
        cli.go_go_years = v;
    }
    if let Some(v) = payload.shock_years {
        cli.shock_years = v;
    }
    if let Some(v) = payload.shock_return {
        cli.shock_return = v;
    }
    if let Some(v) = payload.solver_iterations {
        cli.solver_iterations = v;
    }
    if let Some(v) = payload.spending_search_limit {
        cli.spending_search_limit = v;
    }
    if let Some(v) = payload.seed {
        cli.seed = v;
    }
    if let Some(v) = payload.benefit_annual {
        cli.benefit_annual = v;
    }
    if let Some(v) = payload.benefit_start_year {
        cli.benefit_start_year = v;
    }
    if let Some(v) = payload.benefit_first_year_fraction {
        cli.benefit_first_year_fraction = v;
    }
    if let Some(v) = payload.second_benefit_annual {
        cli.second_benefit_annual = v;
    }
    if let Some(v) = payload.second_benefit_start_year {
        cli.second_benefit_start_year = v;
    }
    if let Some(v) = payload.second_benefit_first_year_fraction {
        cli.second_benefit_first_year_fraction = v;
    }
    if let Some(v) = payload.annuity_annual {
        cli.annuity_annual = v;
    }
    if let Some(v) = payload.annuity_start_year {
        cli.annuity_start_year = v;
    }
    if let Some(v) = payload.annuity_first_year_fraction {
        cli.annuity_first_year_fraction = v;
    }
    if let Some(v) = payload.annuity_step_up_threshold {
        cli.annuity_step_up_threshold = v;
    }

    build_request(cli)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RiskResponse {
    spending: f64,
    risk: f64,
    standard_error: f64,
    trials: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpendingSolveResponse {
    spending: f64,
    achieved_risk: f64,
    standard_error: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BalanceSolveResponse {
    balance: f64,
    achieved_risk: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GuardrailsResponse {
    initial_spending: f64,
    exhausted: bool,
    rows: Vec<LedgerRow>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlanResponse {
    balance: f64,
    base_spending: f64,
    go_go_spending: f64,
    initial_withdrawal_rate: f64,
    cut_trigger_balance: f64,
    raise_trigger_balance: f64,
    spending_after_cut: f64,
    spending_after_raise: f64,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route("/api/risk", get(risk_get_handler).post(risk_post_handler))
        .route(
            "/api/spending",
            get(spending_get_handler).post(spending_post_handler),
        )
        .route(
            "/api/balance",
            get(balance_get_handler).post(balance_post_handler),
        )
        .route(
            "/api/guardrails",
            get(guardrails_get_handler).post(guardrails_post_handler),
        )
        .route("/api/plan", get(plan_get_handler).post(plan_post_handler))
        .fallback(not_found_handler);

    let listener = TcpListener::bind(addr).await?;
    println!("Listening on http://{addr}");
    axum::serve(listener, app).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn risk_get_handler(Query(payload): Query<SimulatePayload>) -> Response {
    risk_handler_impl(payload)
}

async fn risk_post_handler(Json(payload): Json<SimulatePayload>) -> Response {
    risk_handler_impl(payload)
}

fn risk_handler_impl(payload: SimulatePayload) -> Response {
    let request = match request_from_payload(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    let Some(spending) = request.spending else {
        return error_response(StatusCode::BAD_REQUEST, "spending is required");
    };

    let policy = SpendingPolicy::from_config(&request.config, spending);
    let estimate = estimate_risk(
        &request.config,
        request.balance,
        &policy,
        &request.income,
        0,
        request.config.seed,
    );
    json_response(
        StatusCode::OK,
        RiskResponse {
            spending,
            risk: estimate.probability,
            standard_error: estimate.standard_error(),
            trials: estimate.trials,
        },
    )
}

async fn spending_get_handler(Query(payload): Query<SimulatePayload>) -> Response {
    spending_handler_impl(payload)
}

async fn spending_post_handler(Json(payload): Json<SimulatePayload>) -> Response {
    spending_handler_impl(payload)
}

fn spending_handler_impl(payload: SimulatePayload) -> Response {
    let request = match request_from_payload(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    let solved = match solve_spending_for_risk(
        &request.config,
        request.balance,
        request.config.target_risk,
        &request.income,
        0,
        request.spending_bounds(),
    ) {
        Ok(solved) => solved,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    let policy = SpendingPolicy::from_config(&request.config, solved);
    let achieved = estimate_risk(
        &request.config,
        request.balance,
        &policy,
        &request.income,
        0,
        request.config.seed,
    );
    json_response(
        StatusCode::OK,
        SpendingSolveResponse {
            spending: solved,
            achieved_risk: achieved.probability,
            standard_error: achieved.standard_error(),
        },
    )
}

async fn balance_get_handler(Query(payload): Query<SimulatePayload>) -> Response {
    balance_handler_impl(payload)
}

async fn balance_post_handler(Json(payload): Json<SimulatePayload>) -> Response {
    balance_handler_impl(payload)
}

fn balance_handler_impl(payload: SimulatePayload) -> Response {
    let request = match request_from_payload(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    let Some(spending) = request.spending else {
        return error_response(StatusCode::BAD_REQUEST, "spending is required");
    };

    let solved = match solve_balance_for_risk(
        &request.config,
        spending,
        request.config.target_risk,
        &request.income,
        0,
        request.balance_bounds(spending),
    ) {
        Ok(solved) => solved,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    let policy = SpendingPolicy::from_config(&request.config, spending);
    let achieved = estimate_risk(
        &request.config,
        solved,
        &policy,
        &request.income,
        0,
        request.config.seed,
    );
    json_response(
        StatusCode::OK,
        BalanceSolveResponse {
            balance: solved,
            achieved_risk: achieved.probability,
        },
    )
}

async fn guardrails_get_handler(Query(payload): Query<SimulatePayload>) -> Response {
    guardrails_handler_impl(payload)
}

async fn guardrails_post_handler(Json(payload): Json<SimulatePayload>) -> Response {
    guardrails_handler_impl(payload)
}

fn guardrails_handler_impl(payload: SimulatePayload) -> Response {
    let request = match request_from_payload(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    // Mirror the launch flow: when no spending is supplied, start from the
    // level that hits the target risk on day one.
    let initial_spending = match request.spending {
        Some(spending) => spending,
        None => {
            match solve_spending_for_risk(
                &request.config,
                request.balance,
                request.config.target_risk,
                &request.income,
                0,
                request.spending_bounds(),
            ) {
                Ok(solved) => solved,
                Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
            }
        }
    };

    let rows = match run_guardrail_policy(
        &request.config,
        request.balance,
        initial_spending,
        &request.income,
    ) {
        Ok(rows) => rows,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    let exhausted = rows
        .last()
        .is_some_and(|row| row.action == crate::core::GuardrailAction::Exhausted);
    json_response(
        StatusCode::OK,
        GuardrailsResponse {
            initial_spending,
            exhausted,
            rows,
        },
    )
}

async fn plan_get_handler(Query(payload): Query<SimulatePayload>) -> Response {
    plan_handler_impl(payload)
}

async fn plan_post_handler(Json(payload): Json<SimulatePayload>) -> Response {
    plan_handler_impl(payload)
}

fn plan_handler_impl(payload: SimulatePayload) -> Response {
    let request = match request_from_payload(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    let plan = match build_guardrail_plan(&request.config, request.balance, &request.income) {
        Ok(plan) => plan,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    let go_go_spending = plan.base_spending * request.config.go_go_multiplier;
    let first_year_spending = if request.config.go_go_years > 0 {
        go_go_spending
    } else {
        plan.base_spending
    };
    json_response(
        StatusCode::OK,
        PlanResponse {
            balance: request.balance,
            base_spending: plan.base_spending,
            go_go_spending,
            initial_withdrawal_rate: first_year_spending / request.balance,
            cut_trigger_balance: plan.cut_trigger_balance,
            raise_trigger_balance: plan.raise_trigger_balance,
            spending_after_cut: plan.spending_after_cut,
            spending_after_raise: plan.spending_after_raise,
        },
    )
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
fn request_from_json(json: &str) -> Result<ApiRequest, String> {
    let payload = serde_json::from_str::<SimulatePayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    request_from_payload(payload)
}
