//! Per-pixel pass kernels.
//!
//! Every kernel writes only inside the given extents, one row per rayon
//! task. Pixels are computed independently, so results do not depend on the
//! thread count.
//!
//! LIC buffer channels: r accumulator, g mask flag, b contrast-skip flag,
//! a sample count. Seed buffer: (s, t) texture coordinate of the streamline
//! head.

use rayon::prelude::*;

use super::buffers::{LIC_CLEAR, ReadSet, WriteSet};
use super::params::VectorSpace;
use crate::extent::PixelExtent;
use crate::image::{COMPONENTS, Image, Rgba};

const AA_WEIGHTS: [f32; 5] = [1.0, 4.0, 6.0, 4.0, 1.0];

/// Where convolution input values come from.
#[derive(Clone, Copy)]
pub enum NoiseSource<'a> {
    /// Small texture repeated over the screen.
    Tiled(&'a Image),
    /// Screen-sized image, e.g. the edge-enhanced first pass.
    Screen(&'a Image),
}

impl NoiseSource<'_> {
    #[inline]
    fn at_pixel(&self, i: i32, j: i32) -> Rgba {
        match self {
            NoiseSource::Tiled(img) => {
                let [nx, ny] = img.dims();
                if nx == 0 || ny == 0 {
                    return [0.0; 4];
                }
                img.pixel(i.rem_euclid(nx as i32), j.rem_euclid(ny as i32))
            }
            NoiseSource::Screen(img) => img.pixel(i, j),
        }
    }

    /// Nearest lookup at a screen texture coordinate.
    #[inline]
    fn at_tc(&self, tc: [f32; 2], dims: [usize; 2]) -> Rgba {
        let i = ((tc[0] * dims[0] as f32).floor() as i32).clamp(0, dims[0] as i32 - 1);
        let j = ((tc[1] * dims[1] as f32).floor() as i32).clamp(0, dims[1] as i32 - 1);
        self.at_pixel(i, j)
    }
}

#[inline]
fn pixel_center_tc(i: i32, j: i32, dims: [usize; 2]) -> [f32; 2] {
    [
        (i as f32 + 0.5) / dims[0] as f32,
        (j as f32 + 0.5) / dims[1] as f32,
    ]
}

#[inline]
fn is_masked(px: &Rgba) -> bool {
    px[1] != 0.0
}

/// Evaluate `f` over every pixel of `extents` into `out`.
pub fn for_each_pixel<F>(extents: &[PixelExtent], out: &mut Image, f: F)
where
    F: Fn(i32, i32) -> Rgba + Sync,
{
    let screen = out.extent();
    let stride = out.row_stride();
    for ext in extents {
        let ext = *ext & screen;
        if ext.is_empty() {
            continue;
        }
        let lo = ext.ymin() as usize * stride;
        let hi = (ext.ymax() as usize + 1) * stride;
        out.data_mut()[lo..hi]
            .par_chunks_mut(stride)
            .enumerate()
            .for_each(|(r, row)| {
                let j = ext.ymin() + r as i32;
                for i in ext.xmin()..=ext.xmax() {
                    let o = i as usize * COMPONENTS;
                    row[o..o + COMPONENTS].copy_from_slice(&f(i, j));
                }
            });
    }
}

/// Evaluate `f` over every pixel of `extents` into a LIC/seed pair.
pub fn for_each_pixel_pair<F>(extents: &[PixelExtent], out: WriteSet<'_>, f: F)
where
    F: Fn(i32, i32) -> (Rgba, Rgba) + Sync,
{
    let WriteSet { lic, seed } = out;
    let screen = lic.extent() & seed.extent();
    let stride = lic.row_stride();
    for ext in extents {
        let ext = *ext & screen;
        if ext.is_empty() {
            continue;
        }
        let lo = ext.ymin() as usize * stride;
        let hi = (ext.ymax() as usize + 1) * stride;
        let lic_rows = lic.data_mut()[lo..hi].par_chunks_mut(stride);
        let seed_rows = seed.data_mut()[lo..hi].par_chunks_mut(stride);
        lic_rows
            .zip(seed_rows)
            .enumerate()
            .for_each(|(r, (lic_row, seed_row))| {
                let j = ext.ymin() + r as i32;
                for i in ext.xmin()..=ext.xmax() {
                    let o = i as usize * COMPONENTS;
                    let (l, s) = f(i, j);
                    lic_row[o..o + COMPONENTS].copy_from_slice(&l);
                    seed_row[o..o + COMPONENTS].copy_from_slice(&s);
                }
            });
    }
}

/// Stage the vector field in screen pixel units. Everything outside
/// `extents` reads as a zero vector afterwards.
pub fn transform_vectors(vectors: &Image, extents: &[PixelExtent], space: VectorSpace, out: &mut Image) {
    let [nx, ny] = out.dims();
    let full = out.extent();
    out.clear_extent(&full, [0.0; 4]);
    let (sx, sy) = match space {
        VectorSpace::Screen => (1.0, 1.0),
        VectorSpace::Texture => (nx as f32, ny as f32),
    };
    for_each_pixel(extents, out, |i, j| {
        let v = vectors.pixel(i, j);
        [v[0] * sx, v[1] * sy, v[2], v[3]]
    });
}

/// Convolution init. Seeds the accumulator with the input value and the
/// seed buffer with the pixel centre; masked fragments get the clear value.
pub fn lic0(
    out: WriteSet<'_>,
    extents: &[PixelExtent],
    input: NoiseSource<'_>,
    mask_vectors: &Image,
    mask_threshold: f32,
) {
    let dims = out.lic.dims();
    for_each_pixel_pair(extents, out, |i, j| {
        let tc = pixel_center_tc(i, j, dims);
        let seed = [tc[0], tc[1], 0.0, 0.0];
        let mv = mask_vectors.pixel(i, j);
        if mv[0].hypot(mv[1]) <= mask_threshold {
            return (LIC_CLEAR, seed);
        }
        let n = input.at_pixel(i, j);
        let skip = if n[1] == 0.0 { 1.0 } else { 0.0 };
        ([n[0], 0.0, skip, 1.0], seed)
    });
}

/// Seed reset before forward integration; the accumulator passes through.
pub fn lic0_reset(read: ReadSet<'_>, out: WriteSet<'_>, extents: &[PixelExtent]) {
    let dims = out.lic.dims();
    for_each_pixel_pair(extents, out, |i, j| {
        let tc = pixel_center_tc(i, j, dims);
        (read.lic.pixel(i, j), [tc[0], tc[1], 0.0, 0.0])
    });
}

/// Velocity in texture units per step at `p`, or `None` at a critical point.
#[inline]
fn velocity(vectors: &Image, p: [f32; 2], h: f32, normalize: bool) -> Option<[f32; 2]> {
    let [nx, ny] = vectors.dims();
    let v = vectors.sample_bilinear(p[0], p[1]);
    let mut vx = v[0];
    let mut vy = v[1];
    let norm = vx.hypot(vy);
    if norm == 0.0 || !norm.is_finite() {
        return None;
    }
    if normalize {
        vx /= norm;
        vy /= norm;
    }
    Some([h * vx / nx as f32, h * vy / ny as f32])
}

/// One classical Runge-Kutta step in texture space. `None` when the
/// streamline hits a zero vector or leaves the unit square.
pub fn rk4_step(vectors: &Image, p: [f32; 2], h: f32, normalize: bool) -> Option<[f32; 2]> {
    let k1 = velocity(vectors, p, h, normalize)?;
    let k2 = velocity(vectors, [p[0] + 0.5 * k1[0], p[1] + 0.5 * k1[1]], h, normalize)?;
    let k3 = velocity(vectors, [p[0] + 0.5 * k2[0], p[1] + 0.5 * k2[1]], h, normalize)?;
    let k4 = velocity(vectors, [p[0] + k3[0], p[1] + k3[1]], h, normalize)?;
    let q = [
        p[0] + (k1[0] + 2.0 * k2[0] + 2.0 * k3[0] + k4[0]) / 6.0,
        p[1] + (k1[1] + 2.0 * k2[1] + 2.0 * k3[1] + k4[1]) / 6.0,
    ];
    let inside = (0.0..=1.0).contains(&q[0]) && (0.0..=1.0).contains(&q[1]);
    inside.then_some(q)
}

/// One integration step: advance every live streamline by `h` pixels and
/// accumulate the input value found there.
pub fn lici(
    read: ReadSet<'_>,
    out: WriteSet<'_>,
    extents: &[PixelExtent],
    input: NoiseSource<'_>,
    h: f32,
    normalize: bool,
) {
    let dims = out.lic.dims();
    for_each_pixel_pair(extents, out, |i, j| {
        let lic = read.lic.pixel(i, j);
        let seed = read.seed.pixel(i, j);
        if is_masked(&lic) {
            return (lic, seed);
        }
        match rk4_step(read.vectors, [seed[0], seed[1]], h, normalize) {
            Some(q) => {
                let n = input.at_tc(q, dims);
                (
                    [lic[0] + n[0], lic[1], lic[2], lic[3] + 1.0],
                    [q[0], q[1], 0.0, 0.0],
                )
            }
            None => (lic, seed),
        }
    });
}

/// Divide the accumulator by the sample count.
pub fn licn(read: ReadSet<'_>, out: WriteSet<'_>, extents: &[PixelExtent]) {
    for_each_pixel_pair(extents, out, |i, j| {
        let lic = read.lic.pixel(i, j);
        let seed = read.seed.pixel(i, j);
        if is_masked(&lic) || lic[3] <= 0.0 {
            return (lic, seed);
        }
        ([lic[0] / lic[3], lic[1], lic[2], 1.0], seed)
    });
}

/// Intensity range over unmasked, non-skipped fragments of `extents`.
pub fn find_min_max(lic: &Image, extents: &[PixelExtent]) -> Option<(f32, f32)> {
    let screen = lic.extent();
    let mut range: Option<(f32, f32)> = None;
    for ext in extents {
        let ext = *ext & screen;
        if ext.is_empty() {
            continue;
        }
        let part = (ext.ymin()..=ext.ymax())
            .into_par_iter()
            .map(|j| {
                let mut lo = f32::INFINITY;
                let mut hi = f32::NEG_INFINITY;
                for i in ext.xmin()..=ext.xmax() {
                    let px = lic.pixel(i, j);
                    if is_masked(&px) || px[2] != 0.0 {
                        continue;
                    }
                    lo = lo.min(px[0]);
                    hi = hi.max(px[0]);
                }
                (lo, hi)
            })
            .reduce(
                || (f32::INFINITY, f32::NEG_INFINITY),
                |a, b| (a.0.min(b.0), a.1.max(b.1)),
            );
        if part.0 <= part.1 {
            range = Some(match range {
                Some((lo, hi)) => (lo.min(part.0), hi.max(part.1)),
                None => part,
            });
        }
    }
    range
}

/// Linear stretch of `[min, min + diff]` onto `[0, 1]`.
pub fn contrast_stretch(read: ReadSet<'_>, out: &mut Image, extents: &[PixelExtent], min: f32, diff: f32) {
    for_each_pixel(extents, out, |i, j| {
        let px = read.lic.pixel(i, j);
        if is_masked(&px) {
            return px;
        }
        let v = ((px[0] - min) / diff).clamp(0.0, 1.0);
        [v, px[1], px[2], px[3]]
    });
}

/// Laplacian sharpen of the LIC intensity. Masked neighbours take the
/// centre value. Output: (value, alpha, 0, 0) with alpha 0 on skipped
/// fragments, ready to serve as second-pass input.
pub fn edge_enhance(lic: &Image, extents: &[PixelExtent], out: &mut Image) {
    let screen = lic.extent();
    for_each_pixel(extents, out, |i, j| {
        let px = lic.pixel(i, j);
        if is_masked(&px) {
            return [0.0; 4];
        }
        let c = px[0];
        let tap = |di: i32, dj: i32| {
            let n = lic.pixel(i + di, j + dj);
            if !screen.contains_pixel(i + di, j + dj) || is_masked(&n) { c } else { n[0] }
        };
        let sum = tap(-1, 0) + tap(1, 0) + tap(0, -1) + tap(0, 1);
        let v = (5.0 * c - sum).clamp(0.0, 1.0);
        let alpha = if px[2] != 0.0 { 0.0 } else { 1.0 };
        [v, alpha, 0.0, 0.0]
    });
}

/// One 5-tap binomial blur along `axis` (0 = x, 1 = y) over unmasked
/// neighbours.
pub fn anti_alias(read: ReadSet<'_>, out: &mut Image, extents: &[PixelExtent], axis: usize) {
    let screen = read.lic.extent();
    for_each_pixel(extents, out, |i, j| {
        let px = read.lic.pixel(i, j);
        if is_masked(&px) {
            return px;
        }
        let mut sum = 0.0f32;
        let mut wsum = 0.0f32;
        for (k, w) in AA_WEIGHTS.iter().enumerate() {
            let d = k as i32 - 2;
            let (ni, nj) = if axis == 0 { (i + d, j) } else { (i, j + d) };
            let n = read.lic.pixel(ni, nj);
            if !screen.contains_pixel(ni, nj) || is_masked(&n) {
                continue;
            }
            sum += w * n[0];
            wsum += w;
        }
        [sum / wsum, px[1], px[2], px[3]]
    });
}
