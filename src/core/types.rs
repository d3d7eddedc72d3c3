use serde::Serialize;

/// Distribution family for the annual return draw. The choice changes the
/// skew and the floor: log-normal can never produce a return below -100%,
/// additive normal can, and the simulator tolerates that rather than
/// treating it as an error.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReturnModel {
    AdditiveNormal,
    LogNormal,
}

/// Forces the first `years` years to a fixed annual return, bypassing the
/// return distribution entirely. Used to stress early sequence-of-returns
/// risk.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ShockOverride {
    pub years: u32,
    pub annual_return: f64,
}

/// All amounts and return parameters are in real (today's money) terms; the
/// inflation draw only exists to form nominal returns for return-conditioned
/// income step-up rules.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub trials: u32,
    pub horizon_years: u32,
    pub mean_return: f64,
    pub return_vol: f64,
    pub return_model: ReturnModel,
    pub inflation_mean: f64,
    pub inflation_vol: f64,
    pub target_risk: f64,
    pub cut_risk: f64,
    pub raise_risk: f64,
    pub go_go_multiplier: f64,
    pub go_go_years: u32,
    pub shock: Option<ShockOverride>,
    pub solver_iterations: u32,
    pub spending_search_fraction: f64,
    pub seed: u64,
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.trials == 0 {
            return Err("trials must be > 0".to_string());
        }
        if !self.mean_return.is_finite() {
            return Err("mean_return must be finite".to_string());
        }
        if !self.return_vol.is_finite() || self.return_vol < 0.0 {
            return Err("return_vol must be >= 0".to_string());
        }
        if !self.inflation_mean.is_finite() {
            return Err("inflation_mean must be finite".to_string());
        }
        if !self.inflation_vol.is_finite() || self.inflation_vol < 0.0 {
            return Err("inflation_vol must be >= 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.target_risk) {
            return Err("target_risk must be between 0 and 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.cut_risk) {
            return Err("cut_risk must be between 0 and 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.raise_risk) {
            return Err("raise_risk must be between 0 and 1".to_string());
        }
        if !self.go_go_multiplier.is_finite() || self.go_go_multiplier <= 0.0 {
            return Err("go_go_multiplier must be > 0".to_string());
        }
        if let Some(shock) = self.shock {
            if !shock.annual_return.is_finite() || shock.annual_return < -1.0 {
                return Err("shock annual_return must be >= -100%".to_string());
            }
        }
        if self.solver_iterations == 0 {
            return Err("solver_iterations must be > 0".to_string());
        }
        if !self.spending_search_fraction.is_finite() || self.spending_search_fraction <= 0.0 {
            return Err("spending_search_fraction must be > 0".to_string());
        }
        Ok(())
    }
}

/// Gross desired withdrawal per year, before external income offsets.
/// Encodes the elevated go-go spending window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpendingPolicy {
    pub base_spending: f64,
    pub go_go_multiplier: f64,
    pub go_go_years: u32,
}

impl SpendingPolicy {
    pub fn flat(base_spending: f64) -> Self {
        Self {
            base_spending,
            go_go_multiplier: 1.0,
            go_go_years: 0,
        }
    }

    pub fn from_config(config: &SimulationConfig, base_spending: f64) -> Self {
        Self {
            base_spending,
            go_go_multiplier: config.go_go_multiplier,
            go_go_years: config.go_go_years,
        }
    }

    pub fn phase_multiplier(&self, year: u32) -> f64 {
        if year < self.go_go_years {
            self.go_go_multiplier
        } else {
            1.0
        }
    }

    pub fn gross_for_year(&self, year: u32) -> f64 {
        self.base_spending * self.phase_multiplier(year)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TrialOutcome {
    pub survived: bool,
    pub depleted_year: Option<u32>,
}

/// Fraction of failed trials; an unbiased but noisy statistic of the true
/// ruin probability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskEstimate {
    pub probability: f64,
    pub trials: u32,
}

impl RiskEstimate {
    pub fn standard_error(&self) -> f64 {
        if self.trials == 0 {
            return 0.0;
        }
        let p = self.probability.clamp(0.0, 1.0);
        (p * (1.0 - p) / self.trials as f64).sqrt()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardrailAction {
    Steady,
    Cut,
    Raise,
    Exhausted,
}

/// One realized year of the guardrail policy run. `start_balance` is the
/// pre-draw balance; `projected_risk` is the forward-looking estimate that
/// drove the action.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerRow {
    pub year: u32,
    pub start_balance: f64,
    pub spending: f64,
    pub external_income: f64,
    pub portfolio_draw: f64,
    pub projected_risk: f64,
    pub action: GuardrailAction,
    pub end_balance: f64,
}

/// Solved dashboard numbers for a starting balance: sustainable base
/// spending at the target risk plus the portfolio trigger balances and the
/// spending levels a cut or raise would reset to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardrailPlan {
    pub base_spending: f64,
    pub cut_trigger_balance: f64,
    pub raise_trigger_balance: f64,
    pub spending_after_cut: f64,
    pub spending_after_raise: f64,
}
