use super::rng::Rng;
use super::types::{ReturnModel, SimulationConfig};

/// One year's market scenario. Real return and inflation are drawn
/// independently; nominal is derived, never sampled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketDraw {
    pub real_return: f64,
    pub inflation: f64,
}

impl MarketDraw {
    pub fn nominal_return(&self) -> f64 {
        (1.0 + self.real_return) * (1.0 + self.inflation) - 1.0
    }
}

pub(crate) fn mean_draw(config: &SimulationConfig) -> MarketDraw {
    MarketDraw {
        real_return: config.mean_return,
        inflation: config.inflation_mean,
    }
}

pub fn sample_market(config: &SimulationConfig, year: u32, rng: &mut Rng) -> MarketDraw {
    let real_return = match config.shock {
        Some(shock) if year < shock.years => shock.annual_return,
        _ => match config.return_model {
            ReturnModel::AdditiveNormal => {
                config.mean_return + config.return_vol * rng.standard_normal()
            }
            ReturnModel::LogNormal => {
                let drift = config.mean_return - 0.5 * config.return_vol * config.return_vol;
                (drift + config.return_vol * rng.standard_normal()).exp() - 1.0
            }
        },
    };

    let inflation = config.inflation_mean + config.inflation_vol * rng.standard_normal();

    MarketDraw {
        real_return,
        inflation,
    }
}
