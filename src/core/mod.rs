mod engine;
mod income;
mod market;
mod rng;
mod solver;
mod types;

pub use engine::{GuardrailEngine, estimate_risk, run_guardrail_policy, run_trial};
pub use income::{BenefitPhase, IncomeSchedule, NoIncome, PhasedIncome, SteppedAnnuity};
pub use market::{MarketDraw, sample_market};
pub use rng::Rng;
pub use solver::{
    SolveBounds, build_guardrail_plan, solve_balance_for_risk, solve_spending_for_risk,
};
pub use types::{
    GuardrailAction, GuardrailPlan, LedgerRow, ReturnModel, RiskEstimate, ShockOverride,
    SimulationConfig, SpendingPolicy, TrialOutcome,
};
