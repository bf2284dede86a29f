//! Noise textures for the first convolution pass.
//!
//! Output channels: r noise value, g alpha (always 1).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::image::Image;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum NoiseKind {
    Uniform,
    #[default]
    Gaussian,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NoiseParams {
    pub kind: NoiseKind,
    /// Side length of the square texture; rounded up to a multiple of
    /// `grain`.
    pub size: usize,
    /// Side length of the square cells sharing one random value.
    pub grain: usize,
    pub min_value: f32,
    pub max_value: f32,
    /// Number of distinct values between `min_value` and `max_value`.
    pub levels: u32,
    /// Probability that a cell receives a random value instead of
    /// `impulse_background`.
    pub impulse_probability: f64,
    pub impulse_background: f32,
    pub seed: u64,
}

impl Default for NoiseParams {
    fn default() -> Self {
        Self {
            kind: NoiseKind::Gaussian,
            size: 200,
            grain: 1,
            min_value: 0.0,
            max_value: 0.8,
            levels: 256,
            impulse_probability: 1.0,
            impulse_background: 0.0,
            seed: 1,
        }
    }
}

impl NoiseParams {
    /// Texture side and grain actually used.
    pub fn valid_dimensions(&self) -> (usize, usize) {
        let grain = self.grain.max(1);
        let side = self.size.max(grain);
        (side.div_ceil(grain) * grain, grain)
    }
}

struct Quantizer {
    min: f32,
    range: f32,
    levels: u32,
}

impl Quantizer {
    fn new(params: &NoiseParams) -> Self {
        let min = params.min_value.max(0.0);
        let max = params.max_value.min(1.0);
        Self {
            min,
            range: max - min,
            levels: params.levels.max(1),
        }
    }

    /// Map `u` in [0, 1] onto one of `levels` evenly spaced values.
    #[inline]
    fn level(&self, u: f64) -> f32 {
        if self.levels == 1 {
            return self.min + self.range;
        }
        let max_level = self.levels - 1;
        let l = ((u * self.levels as f64) as u32).min(max_level);
        self.min + (l as f32 / max_level as f32) * self.range
    }
}

/// Standard normal sample by the Box-Muller transform.
#[inline]
fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = 1.0 - rng.random::<f64>();
    let u2: f64 = rng.random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

/// Generate a square noise texture.
pub fn generate_noise(params: &NoiseParams) -> Image {
    let (side, grain) = params.valid_dimensions();
    let cells = side / grain;
    let prob = params.impulse_probability.clamp(0.0, 1.0);
    let background = params.impulse_background.clamp(0.0, 1.0);
    let quant = Quantizer::new(params);

    let mut value_rng = StdRng::seed_from_u64(params.seed);
    let mut prob_rng = StdRng::seed_from_u64(params.seed ^ 0x9E37_79B9_7F4A_7C15);
    let hit = |rng: &mut StdRng| prob >= 1.0 || rng.random::<f64>() > 1.0 - prob;

    let values: Vec<f32> = match params.kind {
        NoiseKind::Uniform => (0..cells * cells)
            .map(|_| {
                if hit(&mut prob_rng) {
                    quant.level(value_rng.random::<f64>())
                } else {
                    background
                }
            })
            .collect(),
        NoiseKind::Gaussian => {
            let raw: Vec<Option<f64>> = (0..cells * cells)
                .map(|_| hit(&mut prob_rng).then(|| standard_normal(&mut value_rng)))
                .collect();
            let (lo, hi) = raw
                .iter()
                .flatten()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                    (lo.min(*v), hi.max(*v))
                });
            let diff = hi - lo;
            raw.iter()
                .map(|v| match v {
                    Some(v) if diff > 0.0 => quant.level((v - lo) / diff),
                    Some(_) => quant.level(1.0),
                    None => background,
                })
                .collect()
        }
    };

    Image::from_fn([side, side], |i, j| {
        let cell = (j as usize / grain) * cells + i as usize / grain;
        [values[cell], 1.0, 0.0, 0.0]
    })
}

#[cfg(test)]
mod tests {
    use super::{NoiseKind, NoiseParams, generate_noise};

    #[test]
    fn defaults_produce_quantized_values_in_range() {
        let noise = generate_noise(&NoiseParams::default());
        assert_eq!(noise.dims(), [200, 200]);
        let step = 0.8 / 255.0;
        for px in noise.data().chunks_exact(4) {
            assert!((0.0..=0.8 + 1e-6).contains(&px[0]), "{}", px[0]);
            let l = px[0] / step;
            assert!((l - l.round()).abs() < 1e-3, "{} is not on a level", px[0]);
            assert_eq!(px[1], 1.0);
        }
    }

    #[test]
    fn same_seed_same_texture() {
        let p = NoiseParams {
            kind: NoiseKind::Uniform,
            size: 32,
            ..NoiseParams::default()
        };
        assert_eq!(generate_noise(&p), generate_noise(&p));
        let q = NoiseParams { seed: 2, ..p.clone() };
        assert_ne!(generate_noise(&p), generate_noise(&q));
    }

    #[test]
    fn grain_cells_share_one_value_and_size_rounds_up() {
        let p = NoiseParams {
            size: 10,
            grain: 4,
            levels: 2,
            ..NoiseParams::default()
        };
        assert_eq!(p.valid_dimensions(), (12, 4));
        let noise = generate_noise(&p);
        assert_eq!(noise.dims(), [12, 12]);
        for j in 0..4 {
            for i in 0..4 {
                assert_eq!(noise.pixel(i, j), noise.pixel(0, 0));
            }
        }
        for px in noise.data().chunks_exact(4) {
            assert!(px[0] == 0.0 || px[0] == 0.8, "{}", px[0]);
        }
    }

    #[test]
    fn zero_impulse_probability_gives_background() {
        let p = NoiseParams {
            size: 8,
            impulse_probability: 0.0,
            impulse_background: 0.25,
            ..NoiseParams::default()
        };
        let noise = generate_noise(&p);
        assert!(noise.data().chunks_exact(4).all(|px| px[0] == 0.25));
    }
}
