use std::f64::consts::PI;

// Disjoint draw streams so realized paths, nested projections, and solver
// iterations never replay one another's random state.
pub(crate) const REALIZED_STREAM: u32 = 0;
pub(crate) const PROJECTION_STREAM: u32 = 1;
pub(crate) const SPENDING_SOLVER_STREAM: u32 = 2;
pub(crate) const BALANCE_SOLVER_STREAM: u32 = 3;

pub(crate) fn derive_seed(base_seed: u64, stream: u32, index: u32) -> u64 {
    let mixed = base_seed ^ ((stream as u64) << 32) ^ index as u64;
    splitmix64(mixed)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Seedable xorshift64* generator with Box-Muller normals. Every sampling
/// call site threads one of these explicitly; there is no global random
/// state anywhere in the crate.
pub struct Rng {
    state: u64,
    cached_normal: Option<f64>,
}

impl Rng {
    pub fn new(seed: u64) -> Self {
        let state = if seed == 0 {
            0xA5A5_A5A5_A5A5_A5A5
        } else {
            seed
        };
        Self {
            state,
            cached_normal: None,
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    fn next_f64(&mut self) -> f64 {
        const DENOM: f64 = (1_u64 << 53) as f64;
        let v = self.next_u64() >> 11;
        ((v as f64) + 0.5) / DENOM
    }

    pub(crate) fn standard_normal(&mut self) -> f64 {
        if let Some(z) = self.cached_normal.take() {
            return z;
        }

        let u1 = self.next_f64().max(1e-12);
        let u2 = self.next_f64();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * PI * u2;

        let z0 = r * theta.cos();
        let z1 = r * theta.sin();
        self.cached_normal = Some(z1);
        z0
    }
}
