use super::market::MarketDraw;

/// Externally supplied income that offsets portfolio withdrawals.
///
/// `draws` holds the path's realized market draws for years `0..year`, so an
/// implementation may condition on the return history (e.g. step-up rules)
/// but never on global state. The same schedule is evaluated inside every
/// Monte Carlo trial and inside the one realized trajectory.
pub trait IncomeSchedule {
    fn income_for(&self, year: u32, draws: &[MarketDraw]) -> f64;
}

pub struct NoIncome;

impl IncomeSchedule for NoIncome {
    fn income_for(&self, _year: u32, _draws: &[MarketDraw]) -> f64 {
        0.0
    }
}

/// A benefit with delayed onset and optional first-year proration, e.g. a
/// government pension claimed mid-year.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BenefitPhase {
    pub annual_amount: f64,
    pub start_year: u32,
    pub first_year_fraction: f64,
}

impl BenefitPhase {
    fn amount_for(&self, year: u32) -> f64 {
        if year < self.start_year {
            0.0
        } else if year == self.start_year {
            self.annual_amount * self.first_year_fraction
        } else {
            self.annual_amount
        }
    }
}

/// An annuity-like source whose real value decays with inflation but steps
/// up in years where the nominal return exceeds a threshold. The first
/// payout year may be reduced (e.g. a 75% first-year amount).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SteppedAnnuity {
    pub annual_amount: f64,
    pub start_year: u32,
    pub first_year_fraction: f64,
    pub step_up_threshold: f64,
}

impl SteppedAnnuity {
    fn amount_for(&self, year: u32, draws: &[MarketDraw]) -> f64 {
        if year < self.start_year {
            return 0.0;
        }

        let nominal = if year == self.start_year {
            self.annual_amount * self.first_year_fraction
        } else {
            self.annual_amount
        };

        let mut real_value = nominal;
        for offset in self.start_year..year {
            let Some(draw) = draws.get(offset as usize) else {
                break;
            };
            let step_up = (draw.nominal_return() - self.step_up_threshold).max(0.0);
            real_value = real_value * (1.0 + step_up) / (1.0 + draw.inflation).max(1e-9);
        }
        real_value
    }
}

/// Sum of zero or more benefit phases plus an optional stepped annuity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhasedIncome {
    pub benefits: Vec<BenefitPhase>,
    pub annuity: Option<SteppedAnnuity>,
}

impl PhasedIncome {
    pub fn is_empty(&self) -> bool {
        self.benefits.is_empty() && self.annuity.is_none()
    }
}

impl IncomeSchedule for PhasedIncome {
    fn income_for(&self, year: u32, draws: &[MarketDraw]) -> f64 {
        let mut total = 0.0;
        for benefit in &self.benefits {
            total += benefit.amount_for(year);
        }
        if let Some(annuity) = &self.annuity {
            total += annuity.amount_for(year, draws);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    fn flat_draw(real_return: f64, inflation: f64) -> MarketDraw {
        MarketDraw {
            real_return,
            inflation,
        }
    }

    #[test]
    fn no_income_is_always_zero() {
        assert_eq!(NoIncome.income_for(0, &[]), 0.0);
        assert_eq!(NoIncome.income_for(29, &[]), 0.0);
    }

    #[test]
    fn benefit_starts_prorated_then_pays_in_full() {
        let schedule = PhasedIncome {
            benefits: vec![BenefitPhase {
                annual_amount: 40_524.0,
                start_year: 2,
                first_year_fraction: 1.0 / 12.0,
            }],
            annuity: None,
        };
        assert_eq!(schedule.income_for(1, &[]), 0.0);
        assert_approx(schedule.income_for(2, &[]), 40_524.0 / 12.0);
        assert_approx(schedule.income_for(3, &[]), 40_524.0);
    }

    #[test]
    fn two_phase_claims_stack() {
        let schedule = PhasedIncome {
            benefits: vec![
                BenefitPhase {
                    annual_amount: 40_404.0,
                    start_year: 1,
                    first_year_fraction: 1.0,
                },
                BenefitPhase {
                    annual_amount: 40_524.0,
                    start_year: 2,
                    first_year_fraction: 1.0,
                },
            ],
            annuity: None,
        };
        assert_eq!(schedule.income_for(0, &[]), 0.0);
        assert_approx(schedule.income_for(1, &[]), 40_404.0);
        assert_approx(schedule.income_for(2, &[]), 80_928.0);
    }

    #[test]
    fn annuity_first_year_is_reduced() {
        let annuity = SteppedAnnuity {
            annual_amount: 22_599.0,
            start_year: 2,
            first_year_fraction: 0.75,
            step_up_threshold: 0.07,
        };
        assert_eq!(annuity.amount_for(1, &[]), 0.0);
        assert_approx(annuity.amount_for(2, &[]), 22_599.0 * 0.75);
    }

    #[test]
    fn annuity_real_value_decays_with_inflation_when_returns_are_weak() {
        let annuity = SteppedAnnuity {
            annual_amount: 100.0,
            start_year: 0,
            first_year_fraction: 1.0,
            step_up_threshold: 0.07,
        };
        // Nominal return 3% is below the 7% threshold: no step-up, pure decay.
        let draws = vec![flat_draw(0.0, 0.03); 2];
        assert_approx(annuity.amount_for(1, &draws), 100.0 / 1.03);
        assert_approx(annuity.amount_for(2, &draws), 100.0 / (1.03 * 1.03));
    }

    #[test]
    fn annuity_steps_up_when_nominal_return_clears_threshold() {
        let annuity = SteppedAnnuity {
            annual_amount: 100.0,
            start_year: 0,
            first_year_fraction: 1.0,
            step_up_threshold: 0.07,
        };
        // Real 10%, no inflation: nominal 10%, step-up 3%.
        let draws = vec![flat_draw(0.10, 0.0)];
        assert_approx(annuity.amount_for(1, &draws), 103.0);
    }

    #[test]
    fn annuity_ignores_years_beyond_the_supplied_path() {
        let annuity = SteppedAnnuity {
            annual_amount: 100.0,
            start_year: 0,
            first_year_fraction: 1.0,
            step_up_threshold: 0.07,
        };
        // Only one draw available for a two-year decay window.
        let draws = vec![flat_draw(0.0, 0.03)];
        assert_approx(annuity.amount_for(2, &draws), 100.0 / 1.03);
    }

    #[test]
    fn empty_schedule_reports_empty() {
        assert!(PhasedIncome::default().is_empty());
    }
}
