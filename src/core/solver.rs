use super::engine::estimate_risk;
use super::income::IncomeSchedule;
use super::rng::{BALANCE_SOLVER_STREAM, SPENDING_SOLVER_STREAM, derive_seed};
use super::types::{GuardrailPlan, SimulationConfig, SpendingPolicy};

/// Search interval for the bisection solvers. The solver does not verify
/// that the root is bracketed; bounds wide enough to straddle the target are
/// the caller's responsibility, and a root outside `[lo, hi]` silently
/// converges to the nearer boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveBounds {
    pub lo: f64,
    pub hi: f64,
}

impl SolveBounds {
    fn validate(&self) -> Result<(), String> {
        if !self.lo.is_finite() || !self.hi.is_finite() {
            return Err("solver bounds must be finite".to_string());
        }
        if self.lo > self.hi {
            return Err("solver bounds must satisfy lo <= hi".to_string());
        }
        Ok(())
    }
}

/// Finds the base spending whose estimated ruin risk lands on `target_risk`.
/// Risk is monotonically non-decreasing in spending, so plain bisection
/// applies; the iteration budget is fixed because the objective is itself a
/// noisy statistic and extra iterations chase noise, not signal.
pub fn solve_spending_for_risk(
    config: &SimulationConfig,
    balance: f64,
    target_risk: f64,
    income: &dyn IncomeSchedule,
    start_year: u32,
    bounds: SolveBounds,
) -> Result<f64, String> {
    config.validate()?;
    bounds.validate()?;
    validate_target(target_risk)?;
    validate_balance(balance)?;

    Ok(bisect_spending(
        config,
        balance,
        target_risk,
        income,
        start_year,
        bounds,
        derive_seed(config.seed, SPENDING_SOLVER_STREAM, start_year),
    ))
}

/// Finds the balance whose estimated ruin risk lands on `target_risk` at a
/// fixed spending level. Risk is monotonically non-increasing in balance, so
/// the comparison direction is inverted relative to the spending solver.
pub fn solve_balance_for_risk(
    config: &SimulationConfig,
    spending: f64,
    target_risk: f64,
    income: &dyn IncomeSchedule,
    start_year: u32,
    bounds: SolveBounds,
) -> Result<f64, String> {
    config.validate()?;
    bounds.validate()?;
    validate_target(target_risk)?;
    if !spending.is_finite() || spending < 0.0 {
        return Err("spending must be >= 0".to_string());
    }

    let policy = SpendingPolicy::from_config(config, spending);
    let seed = derive_seed(config.seed, BALANCE_SOLVER_STREAM, start_year);
    let mut lo = bounds.lo;
    let mut hi = bounds.hi;
    for iteration in 0..config.solver_iterations {
        let mid = (lo + hi) * 0.5;
        let estimate = estimate_risk(
            config,
            mid,
            &policy,
            income,
            start_year,
            derive_seed(seed, iteration, 0),
        );
        if estimate.probability > target_risk {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Ok((lo + hi) * 0.5)
}

pub(crate) fn bisect_spending(
    config: &SimulationConfig,
    balance: f64,
    target_risk: f64,
    income: &dyn IncomeSchedule,
    start_year: u32,
    bounds: SolveBounds,
    seed: u64,
) -> f64 {
    let mut lo = bounds.lo;
    let mut hi = bounds.hi;
    for iteration in 0..config.solver_iterations {
        let mid = (lo + hi) * 0.5;
        let policy = SpendingPolicy::from_config(config, mid);
        let estimate = estimate_risk(
            config,
            balance,
            &policy,
            income,
            start_year,
            derive_seed(seed, iteration, 0),
        );
        if estimate.probability < target_risk {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    (lo + hi) * 0.5
}

/// Solves the launch dashboard for a starting balance: sustainable base
/// spending at the target risk, the portfolio balances at which that
/// spending hits the cut/raise rails, and the spending levels a triggered
/// re-solve would reset to.
pub fn build_guardrail_plan(
    config: &SimulationConfig,
    initial_balance: f64,
    income: &dyn IncomeSchedule,
) -> Result<GuardrailPlan, String> {
    config.validate()?;
    validate_balance(initial_balance)?;
    if initial_balance <= 0.0 {
        return Err("initial_balance must be > 0".to_string());
    }

    let spending_bounds = |balance: f64| SolveBounds {
        lo: 0.0,
        hi: balance * config.spending_search_fraction,
    };
    let balance_bounds = SolveBounds {
        lo: 0.0,
        hi: initial_balance * 5.0,
    };

    let base_spending = solve_spending_for_risk(
        config,
        initial_balance,
        config.target_risk,
        income,
        0,
        spending_bounds(initial_balance),
    )?;
    let cut_trigger_balance = solve_balance_for_risk(
        config,
        base_spending,
        config.cut_risk,
        income,
        0,
        balance_bounds,
    )?;
    let raise_trigger_balance = solve_balance_for_risk(
        config,
        base_spending,
        config.raise_risk,
        income,
        0,
        balance_bounds,
    )?;
    let spending_after_cut = solve_spending_for_risk(
        config,
        cut_trigger_balance,
        config.target_risk,
        income,
        0,
        spending_bounds(cut_trigger_balance),
    )?;
    let spending_after_raise = solve_spending_for_risk(
        config,
        raise_trigger_balance,
        config.target_risk,
        income,
        0,
        spending_bounds(raise_trigger_balance),
    )?;

    Ok(GuardrailPlan {
        base_spending,
        cut_trigger_balance,
        raise_trigger_balance,
        spending_after_cut,
        spending_after_raise,
    })
}

fn validate_target(target_risk: f64) -> Result<(), String> {
    if !(0.0..=1.0).contains(&target_risk) {
        return Err("target_risk must be between 0 and 1".to_string());
    }
    Ok(())
}

fn validate_balance(balance: f64) -> Result<(), String> {
    if !balance.is_finite() || balance < 0.0 {
        return Err("balance must be >= 0".to_string());
    }
    Ok(())
}
