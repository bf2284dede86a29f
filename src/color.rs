//! Combination of the LIC intensity with the surface colors, and the
//! optional lightness stretch of the result.

use log::debug;
use rayon::prelude::*;

use crate::comm::Communicator;
use crate::error::LicResult;
use crate::extent::PixelExtent;
use crate::image::Image;
use crate::lic::passes::for_each_pixel;
use crate::lic::{check_contrast_factors, global_min_max};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ColorMode {
    /// `(1 - k) * color + k * lic`.
    #[default]
    Blend,
    /// `color * (lic + bias)`.
    Multiply,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ColorParams {
    pub mode: ColorMode,
    pub lic_intensity: f32,
    pub map_bias: f32,
    /// Blend factor toward `mask_color` on masked fragments.
    pub mask_intensity: f32,
    pub mask_color: [f32; 3],
    /// Fractions of the global lightness range trimmed before the color
    /// contrast stretch.
    pub low_contrast_factor: f32,
    pub high_contrast_factor: f32,
}

impl Default for ColorParams {
    fn default() -> Self {
        Self {
            mode: ColorMode::Blend,
            lic_intensity: 0.8,
            map_bias: 0.0,
            mask_intensity: 0.0,
            mask_color: [0.5, 0.5, 0.5],
            low_contrast_factor: 0.0,
            high_contrast_factor: 0.0,
        }
    }
}

impl ColorParams {
    pub fn contrast_factors(mut self, low: f32, high: f32) -> Self {
        self.low_contrast_factor = low;
        self.high_contrast_factor = high;
        self
    }

    pub fn validate(&self) -> LicResult<()> {
        check_contrast_factors(self.low_contrast_factor, self.high_contrast_factor)
    }
}

/// Produce the colored LIC image over `extents`. `lic` is an integrator
/// output buffer, `colors` the surface RGBA. Pixels outside `extents` are
/// left transparent black.
pub fn combine_colors(lic: &Image, colors: &Image, extents: &[PixelExtent], params: &ColorParams) -> Image {
    let mut out = Image::new(lic.dims());
    for_each_pixel(extents, &mut out, |i, j| {
        let l = lic.pixel(i, j);
        let c = colors.pixel(i, j);
        let mut rgb = [c[0], c[1], c[2]];
        if l[1] != 0.0 {
            let k = params.mask_intensity;
            for (q, v) in rgb.iter_mut().enumerate() {
                *v = (1.0 - k) * *v + k * params.mask_color[q];
            }
        } else {
            for v in rgb.iter_mut() {
                *v = match params.mode {
                    ColorMode::Blend => {
                        (1.0 - params.lic_intensity) * *v + params.lic_intensity * l[0]
                    }
                    ColorMode::Multiply => *v * (l[0] + params.map_bias),
                };
                *v = v.clamp(0.0, 1.0);
            }
        }
        [rgb[0], rgb[1], rgb[2], c[3]]
    });
    out
}

/// RGB in [0, 1] to `[hue, saturation, lightness]`, all in [0, 1].
pub fn rgb_to_hsl(rgb: [f32; 3]) -> [f32; 3] {
    let [r, g, b] = rgb;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let l = 0.5 * (max + min);
    let d = max - min;
    if d <= 0.0 {
        return [0.0, 0.0, l];
    }
    let s = if l > 0.5 { d / (2.0 - max - min) } else { d / (max + min) };
    let h = if max == r {
        (g - b) / d + if g < b { 6.0 } else { 0.0 }
    } else if max == g {
        (b - r) / d + 2.0
    } else {
        (r - g) / d + 4.0
    };
    [h / 6.0, s, l]
}

pub fn hsl_to_rgb(hsl: [f32; 3]) -> [f32; 3] {
    let [h, s, l] = hsl;
    if s <= 0.0 {
        return [l, l, l];
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    let channel = |t: f32| {
        let t = t.rem_euclid(1.0);
        if t < 1.0 / 6.0 {
            p + (q - p) * 6.0 * t
        } else if t < 0.5 {
            q
        } else if t < 2.0 / 3.0 {
            p + (q - p) * (2.0 / 3.0 - t) * 6.0
        } else {
            p
        }
    };
    [channel(h + 1.0 / 3.0), channel(h), channel(h - 1.0 / 3.0)]
}

/// Lightness range over the pixels of `extents` that carry geometry
/// (alpha != 0).
pub fn lightness_range(color: &Image, extents: &[PixelExtent]) -> Option<(f32, f32)> {
    let screen = color.extent();
    let mut range: Option<(f32, f32)> = None;
    for ext in extents {
        let ext = *ext & screen;
        if ext.is_empty() {
            continue;
        }
        let (lo, hi) = (ext.ymin()..=ext.ymax())
            .into_par_iter()
            .map(|j| {
                (ext.xmin()..=ext.xmax())
                    .map(|i| color.pixel(i, j))
                    .filter(|c| c[3] != 0.0)
                    .map(|c| rgb_to_hsl([c[0], c[1], c[2]])[2])
                    .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), l| {
                        (lo.min(l), hi.max(l))
                    })
            })
            .reduce(
                || (f32::INFINITY, f32::NEG_INFINITY),
                |a, b| (a.0.min(b.0), a.1.max(b.1)),
            );
        if lo <= hi {
            range = Some(match range {
                Some((a, b)) => (a.min(lo), b.max(hi)),
                None => (lo, hi),
            });
        }
    }
    range
}

/// Stretch the lightness of `color` over `extents` onto [0, 1] using the
/// global lightness range, trimmed by the contrast factors. Collective when
/// `comm` is given; a rank without a color image still takes part. Returns
/// the applied range.
pub fn enhance_color_contrast(
    comm: Option<&dyn Communicator>,
    color: Option<&mut Image>,
    extents: &[PixelExtent],
    params: &ColorParams,
) -> LicResult<(f32, f32)> {
    let rank = comm.map_or(0, |c| c.rank());
    let local = color.as_deref().and_then(|c| lightness_range(c, extents));
    let (mut lo, mut hi) = global_min_max(comm, rank, local, "color CE")?;
    let d = hi - lo;
    lo += d * params.low_contrast_factor;
    hi -= d * params.high_contrast_factor;
    debug!("rank {rank}: color CE stretching lightness [{lo}, {hi}]");

    if let Some(color) = color {
        let src = color.clone();
        let span = hi - lo;
        for_each_pixel(extents, color, |i, j| {
            let c = src.pixel(i, j);
            if c[3] == 0.0 {
                return c;
            }
            let [h, s, l] = rgb_to_hsl([c[0], c[1], c[2]]);
            let l = ((l - lo) / span).clamp(0.0, 1.0);
            let [r, g, b] = hsl_to_rgb([h, s, l]);
            [r, g, b, c[3]]
        });
    }
    Ok((lo, hi))
}
