//! Screen-sized 4-component `f32` images.
//!
//! Pixel `(i, j)` of an image is screen pixel `(i, j)`; every rank allocates
//! its images at full screen size and only touches its own extents.

use rayon::prelude::*;

use crate::extent::PixelExtent;

pub const COMPONENTS: usize = 4;

pub type Rgba = [f32; 4];

#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    dims: [usize; 2],
    data: Vec<f32>,
}

impl Image {
    pub fn new(dims: [usize; 2]) -> Self {
        Self::filled(dims, [0.0; 4])
    }

    pub fn filled(dims: [usize; 2], value: Rgba) -> Self {
        let mut data = Vec::with_capacity(dims[0] * dims[1] * COMPONENTS);
        for _ in 0..dims[0] * dims[1] {
            data.extend_from_slice(&value);
        }
        Self { dims, data }
    }

    /// Build an image by evaluating `f(i, j)` for every pixel, rows in parallel.
    pub fn from_fn<F>(dims: [usize; 2], f: F) -> Self
    where
        F: Fn(i32, i32) -> Rgba + Sync,
    {
        let mut image = Self::new(dims);
        let stride = dims[0] * COMPONENTS;
        if stride > 0 {
            image
                .data
                .par_chunks_mut(stride)
                .enumerate()
                .for_each(|(j, row)| {
                    for (i, px) in row.chunks_exact_mut(COMPONENTS).enumerate() {
                        px.copy_from_slice(&f(i as i32, j as i32));
                    }
                });
        }
        image
    }

    #[inline]
    pub fn dims(&self) -> [usize; 2] {
        self.dims
    }

    #[inline]
    pub fn extent(&self) -> PixelExtent {
        PixelExtent::from_size(self.dims[0], self.dims[1])
    }

    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    #[inline]
    pub fn row_stride(&self) -> usize {
        self.dims[0] * COMPONENTS
    }

    #[inline]
    fn offset(&self, i: i32, j: i32) -> usize {
        (j as usize * self.dims[0] + i as usize) * COMPONENTS
    }

    /// Pixel value; zero outside the image.
    #[inline]
    pub fn pixel(&self, i: i32, j: i32) -> Rgba {
        if i < 0 || j < 0 || i as usize >= self.dims[0] || j as usize >= self.dims[1] {
            return [0.0; 4];
        }
        let o = self.offset(i, j);
        [
            self.data[o],
            self.data[o + 1],
            self.data[o + 2],
            self.data[o + 3],
        ]
    }

    #[inline]
    pub fn set_pixel(&mut self, i: i32, j: i32, value: Rgba) {
        if i < 0 || j < 0 || i as usize >= self.dims[0] || j as usize >= self.dims[1] {
            return;
        }
        let o = self.offset(i, j);
        self.data[o..o + COMPONENTS].copy_from_slice(&value);
    }

    /// Row slice of `ext` (already clipped to the image) on row `j`.
    #[inline]
    fn span(&self, ext: &PixelExtent, j: i32) -> std::ops::Range<usize> {
        let start = self.offset(ext.xmin(), j);
        start..start + ext.width() * COMPONENTS
    }

    /// Copy the pixels of `ext` into a packed row-major buffer.
    pub fn pack(&self, ext: &PixelExtent) -> Vec<f32> {
        let ext = *ext & self.extent();
        let mut out = Vec::with_capacity(ext.size() * COMPONENTS);
        for j in ext.rows() {
            out.extend_from_slice(&self.data[self.span(&ext, j)]);
        }
        out
    }

    /// Add a packed block onto the pixels of `ext`. Nothing outside `ext` is
    /// touched. Returns false when `block` does not match the extent size.
    pub fn accumulate(&mut self, ext: &PixelExtent, block: &[f32]) -> bool {
        let ext = *ext & self.extent();
        if block.len() != ext.size() * COMPONENTS {
            return false;
        }
        let row_len = ext.width() * COMPONENTS;
        for (j, src) in ext.rows().zip(block.chunks_exact(row_len.max(1))) {
            let span = self.span(&ext, j);
            for (d, s) in self.data[span].iter_mut().zip(src) {
                *d += *s;
            }
        }
        true
    }

    /// Additive blit of `src` onto `self` over `ext`.
    pub fn accumulate_from(&mut self, src: &Image, ext: &PixelExtent) {
        let ext = *ext & self.extent() & src.extent();
        for j in ext.rows() {
            let span = self.span(&ext, j);
            let src_span = src.span(&ext, j);
            for (d, s) in self.data[span].iter_mut().zip(&src.data[src_span]) {
                *d += *s;
            }
        }
    }

    /// Overwriting blit of `src` onto `self` over `ext`.
    pub fn copy_from(&mut self, src: &Image, ext: &PixelExtent) {
        let ext = *ext & self.extent() & src.extent();
        for j in ext.rows() {
            let span = self.span(&ext, j);
            let src_span = src.span(&ext, j);
            self.data[span].copy_from_slice(&src.data[src_span]);
        }
    }

    pub fn clear_extent(&mut self, ext: &PixelExtent, value: Rgba) {
        let ext = *ext & self.extent();
        for j in ext.rows() {
            let span = self.span(&ext, j);
            for px in self.data[span].chunks_exact_mut(COMPONENTS) {
                px.copy_from_slice(&value);
            }
        }
    }

    /// Bilinear lookup at texture coordinate `(s, t)` with texel centres at
    /// `(i + 0.5) / nx`, clamped to the edge texels.
    pub fn sample_bilinear(&self, s: f32, t: f32) -> Rgba {
        let [nx, ny] = self.dims;
        if nx == 0 || ny == 0 {
            return [0.0; 4];
        }
        let x = (s * nx as f32 - 0.5).clamp(0.0, (nx - 1) as f32);
        let y = (t * ny as f32 - 0.5).clamp(0.0, (ny - 1) as f32);
        let i0 = x.floor() as i32;
        let j0 = y.floor() as i32;
        let i1 = (i0 + 1).min(nx as i32 - 1);
        let j1 = (j0 + 1).min(ny as i32 - 1);
        let fx = x - i0 as f32;
        let fy = y - j0 as f32;
        let p00 = self.pixel(i0, j0);
        let p10 = self.pixel(i1, j0);
        let p01 = self.pixel(i0, j1);
        let p11 = self.pixel(i1, j1);
        let mut out = [0.0; 4];
        for c in 0..COMPONENTS {
            let bottom = p00[c] + (p10[c] - p00[c]) * fx;
            let top = p01[c] + (p11[c] - p01[c]) * fx;
            out[c] = bottom + (top - bottom) * fy;
        }
        out
    }

    /// Largest `|(r, g)|` over `ext`, i.e. the peak vector magnitude.
    pub fn max_xy_norm(&self, ext: &PixelExtent) -> f32 {
        let ext = *ext & self.extent();
        let mut vmax = 0.0f32;
        for j in ext.rows() {
            for px in self.data[self.span(&ext, j)].chunks_exact(COMPONENTS) {
                vmax = vmax.max(px[0].hypot(px[1]));
            }
        }
        vmax
    }
}

/// Shrink `ext` to the pixels whose alpha is positive. Returns the empty
/// extent when no such pixel exists.
pub fn tight_bounds(image: &Image, ext: &PixelExtent) -> PixelExtent {
    let ext = *ext & image.extent();
    let mut out = PixelExtent::empty();
    for j in ext.rows() {
        for i in ext.xmin()..=ext.xmax() {
            if image.pixel(i, j)[3] > 0.0 {
                out |= PixelExtent::new(i, i, j, j);
            }
        }
    }
    out
}

/// `tight_bounds` over a block list, dropping blocks that end up empty.
pub fn tight_block_bounds(image: &Image, blocks: &[PixelExtent]) -> Vec<PixelExtent> {
    blocks
        .iter()
        .map(|b| tight_bounds(image, b))
        .filter(|b| !b.is_empty())
        .collect()
}
