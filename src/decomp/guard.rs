//! Guard-pixel sizing.

use crate::comm::{Communicator, ReduceOp};
use crate::error::LicResult;
use crate::extent::PixelExtent;
use crate::image::Image;
use crate::lic::{LicParams, VectorSpace};

/// Smallest guard ever applied.
pub const MIN_GUARD_PIXELS: i32 = 2;

/// Guard width for a streamline whose speed is bounded by `vmax` pixels
/// per unit step.
pub fn guard_pixels(params: &LicParams, guard_levels: f64, fudge: f64, vmax: f64) -> i32 {
    let reach = params.step_size as f64
        * params.step_count as f64
        * guard_levels
        * params.reach_levels()
        * fudge
        * vmax.max(0.0);
    let reach = if reach.is_finite() {
        reach.ceil().min((i32::MAX / 4) as f64) as i32
    } else {
        i32::MAX / 4
    };
    (reach + params.kernel_margin()).max(MIN_GUARD_PIXELS)
}

/// Local peak vector magnitude in pixel units over `ext`.
fn local_peak(vectors: &Image, geometry: &[PixelExtent], ext: &PixelExtent, params: &LicParams) -> f64 {
    let [nx, ny] = vectors.dims();
    let mut vmax = 0.0f64;
    for g in geometry {
        let overlap = *ext & *g;
        if overlap.is_empty() {
            continue;
        }
        let m = match params.vector_space {
            VectorSpace::Screen => vectors.max_xy_norm(&overlap) as f64,
            VectorSpace::Texture => {
                let mut m = 0.0f64;
                for j in overlap.rows() {
                    for i in overlap.xmin()..=overlap.xmax() {
                        let v = vectors.pixel(i, j);
                        m = m.max((v[0] as f64 * nx as f64).hypot(v[1] as f64 * ny as f64));
                    }
                }
                m
            }
        };
        vmax = vmax.max(m);
    }
    vmax
}

/// Per-block guard sizes for `blocks` (every rank's LIC blocks, flattened
/// in rank order).
///
/// With normalized vectors every block shares one scalar guard. Otherwise
/// each block's peak speed is measured on the ranks owning the vectors,
/// max-reduced across ranks, then widened by the peaks of touching blocks
/// since a streamline can carry on into a neighbour.
pub fn guard_sizes(
    comm: &dyn Communicator,
    blocks: &[PixelExtent],
    local_geometry: &[PixelExtent],
    vectors: &Image,
    params: &LicParams,
    guard_levels: f64,
    fudge: f64,
) -> LicResult<Vec<i32>> {
    if params.normalize_vectors {
        let g = guard_pixels(params, guard_levels, fudge, 1.0);
        return Ok(vec![g; blocks.len()]);
    }

    let local: Vec<f64> = blocks
        .iter()
        .map(|b| local_peak(vectors, local_geometry, b, params))
        .collect();
    let reduced = comm.all_reduce(&local, ReduceOp::Max)?;

    let widened: Vec<f64> = blocks
        .iter()
        .enumerate()
        .map(|(i, b)| {
            let halo = b.grown(1);
            blocks
                .iter()
                .zip(&reduced)
                .filter(|(other, _)| halo.intersects(other))
                .fold(reduced[i], |acc, (_, v)| acc.max(*v))
        })
        .collect();

    Ok(widened
        .into_iter()
        .map(|vmax| guard_pixels(params, guard_levels, fudge, vmax))
        .collect())
}
