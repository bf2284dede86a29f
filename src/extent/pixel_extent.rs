//! `PixelExtent`: an inclusive axis-aligned integer pixel rectangle.
//!
//! Layout is `[xmin, xmax, ymin, ymax]`. The empty extent is a canonical
//! sentinel with `min > max` on both axes, so intersections that miss
//! collapse to it and unions with it are no-ops.

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Index};

const EMPTY_DATA: [i32; 4] = [i32::MAX, i32::MIN, i32::MAX, i32::MIN];

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelExtent {
    data: [i32; 4],
}

impl Default for PixelExtent {
    fn default() -> Self {
        Self::empty()
    }
}

impl PixelExtent {
    #[inline]
    pub const fn new(xmin: i32, xmax: i32, ymin: i32, ymax: i32) -> Self {
        Self {
            data: [xmin, xmax, ymin, ymax],
        }
    }

    /// Extent `[0, nx-1, 0, ny-1]` of a screen or image of the given size.
    #[inline]
    pub const fn from_size(nx: usize, ny: usize) -> Self {
        if nx == 0 || ny == 0 {
            return Self::empty();
        }
        Self::new(0, nx as i32 - 1, 0, ny as i32 - 1)
    }

    #[inline]
    pub const fn empty() -> Self {
        Self { data: EMPTY_DATA }
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.data[0] > self.data[1] || self.data[2] > self.data[3]
    }

    #[inline]
    pub const fn xmin(&self) -> i32 {
        self.data[0]
    }

    #[inline]
    pub const fn xmax(&self) -> i32 {
        self.data[1]
    }

    #[inline]
    pub const fn ymin(&self) -> i32 {
        self.data[2]
    }

    #[inline]
    pub const fn ymax(&self) -> i32 {
        self.data[3]
    }

    #[inline]
    pub const fn data(&self) -> [i32; 4] {
        self.data
    }

    /// Number of pixels along each axis; `[0, 0]` when empty.
    #[inline]
    pub fn dims(&self) -> [usize; 2] {
        if self.is_empty() {
            return [0, 0];
        }
        [
            (self.data[1] as i64 - self.data[0] as i64 + 1) as usize,
            (self.data[3] as i64 - self.data[2] as i64 + 1) as usize,
        ]
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.dims()[0]
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.dims()[1]
    }

    /// Total pixel count.
    #[inline]
    pub fn size(&self) -> usize {
        let [nx, ny] = self.dims();
        nx * ny
    }

    #[inline]
    pub fn contains_pixel(&self, i: i32, j: i32) -> bool {
        i >= self.data[0] && i <= self.data[1] && j >= self.data[2] && j <= self.data[3]
    }

    /// True when `other` lies entirely inside `self`. The empty extent is
    /// contained in everything.
    #[inline]
    pub fn contains(&self, other: &PixelExtent) -> bool {
        if other.is_empty() {
            return true;
        }
        !self.is_empty()
            && other.data[0] >= self.data[0]
            && other.data[1] <= self.data[1]
            && other.data[2] >= self.data[2]
            && other.data[3] <= self.data[3]
    }

    #[inline]
    pub fn intersects(&self, other: &PixelExtent) -> bool {
        !(*self & *other).is_empty()
    }

    /// Intersection. Misses produce the empty sentinel.
    pub fn intersection(&self, other: &PixelExtent) -> PixelExtent {
        if self.is_empty() || other.is_empty() {
            return Self::empty();
        }
        let out = Self::new(
            self.data[0].max(other.data[0]),
            self.data[1].min(other.data[1]),
            self.data[2].max(other.data[2]),
            self.data[3].min(other.data[3]),
        );
        if out.is_empty() { Self::empty() } else { out }
    }

    /// Bounding union.
    pub fn union(&self, other: &PixelExtent) -> PixelExtent {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Self::new(
            self.data[0].min(other.data[0]),
            self.data[1].max(other.data[1]),
            self.data[2].min(other.data[2]),
            self.data[3].max(other.data[3]),
        )
    }

    /// Grow (or shrink, for negative `n`) every side by `n` pixels.
    pub fn grow(&mut self, n: i32) {
        if self.is_empty() {
            return;
        }
        self.data[0] = self.data[0].saturating_sub(n);
        self.data[1] = self.data[1].saturating_add(n);
        self.data[2] = self.data[2].saturating_sub(n);
        self.data[3] = self.data[3].saturating_add(n);
        if self.is_empty() {
            *self = Self::empty();
        }
    }

    /// Grow only along axis `q` (0 = x, 1 = y).
    pub fn grow_axis(&mut self, q: usize, n: i32) {
        if self.is_empty() {
            return;
        }
        let lo = 2 * q;
        self.data[lo] = self.data[lo].saturating_sub(n);
        self.data[lo + 1] = self.data[lo + 1].saturating_add(n);
        if self.is_empty() {
            *self = Self::empty();
        }
    }

    #[inline]
    pub fn shrink(&mut self, n: i32) {
        self.grow(-n);
    }

    #[inline]
    pub fn grown(mut self, n: i32) -> PixelExtent {
        self.grow(n);
        self
    }

    /// Clip to `bounds` in place.
    #[inline]
    pub fn clip(&mut self, bounds: &PixelExtent) {
        *self = self.intersection(bounds);
    }

    pub fn shift(&mut self, dx: i32, dy: i32) {
        if self.is_empty() {
            return;
        }
        self.data[0] += dx;
        self.data[1] += dx;
        self.data[2] += dy;
        self.data[3] += dy;
    }

    /// Convert a cell-centred extent into its node extent (one more node than
    /// cells along each axis).
    pub fn cell_to_node(&mut self) {
        if self.is_empty() {
            return;
        }
        self.data[1] += 1;
        self.data[3] += 1;
    }

    pub fn node_to_cell(&mut self) {
        if self.is_empty() {
            return;
        }
        self.data[1] -= 1;
        self.data[3] -= 1;
        if self.is_empty() {
            *self = Self::empty();
        }
    }

    /// Texture-coordinate bounds `[s0, s1, t0, t1]` of this extent inside a
    /// texture of `dims` pixels. Uses node coordinates so the far edge of the
    /// last pixel maps to `(xmax + 1) / nx`.
    pub fn tex_bounds(&self, dims: [usize; 2]) -> [f32; 4] {
        if self.is_empty() || dims[0] == 0 || dims[1] == 0 {
            return [0.0; 4];
        }
        let mut nodes = *self;
        nodes.cell_to_node();
        let nx = dims[0] as f32;
        let ny = dims[1] as f32;
        [
            nodes.data[0] as f32 / nx,
            nodes.data[1] as f32 / nx,
            nodes.data[2] as f32 / ny,
            nodes.data[3] as f32 / ny,
        ]
    }

    /// Row indices `ymin..=ymax`; yields nothing when empty.
    pub fn rows(&self) -> impl Iterator<Item = i32> {
        let (lo, hi) = if self.is_empty() {
            (1, 0)
        } else {
            (self.data[2], self.data[3])
        };
        lo..=hi
    }
}

impl Index<usize> for PixelExtent {
    type Output = i32;

    #[inline]
    fn index(&self, q: usize) -> &i32 {
        &self.data[q]
    }
}

impl BitAnd for PixelExtent {
    type Output = PixelExtent;

    #[inline]
    fn bitand(self, rhs: PixelExtent) -> PixelExtent {
        self.intersection(&rhs)
    }
}

impl BitAndAssign for PixelExtent {
    #[inline]
    fn bitand_assign(&mut self, rhs: PixelExtent) {
        *self = self.intersection(&rhs);
    }
}

impl BitOr for PixelExtent {
    type Output = PixelExtent;

    #[inline]
    fn bitor(self, rhs: PixelExtent) -> PixelExtent {
        self.union(&rhs)
    }
}

impl BitOrAssign for PixelExtent {
    #[inline]
    fn bitor_assign(&mut self, rhs: PixelExtent) {
        *self = self.union(&rhs);
    }
}

impl fmt::Debug for PixelExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for PixelExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("[empty]");
        }
        write!(
            f,
            "[{}, {}, {}, {}]",
            self.data[0], self.data[1], self.data[2], self.data[3]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::PixelExtent;

    #[test]
    fn size_and_dims_are_inclusive() {
        let ext = PixelExtent::new(2, 5, 10, 10);
        assert_eq!(ext.dims(), [4, 1]);
        assert_eq!(ext.size(), 4);
        assert_eq!(PixelExtent::empty().size(), 0);
        assert_eq!(PixelExtent::from_size(0, 7), PixelExtent::empty());
    }

    #[test]
    fn disjoint_intersection_is_canonical_empty() {
        let a = PixelExtent::new(0, 3, 0, 3);
        let b = PixelExtent::new(5, 8, 0, 3);
        assert_eq!(a & b, PixelExtent::empty());
        assert_eq!((a & b) | b, b);
    }

    #[test]
    fn shrinking_past_zero_collapses_to_empty() {
        let mut ext = PixelExtent::new(0, 3, 0, 1);
        ext.shrink(1);
        assert!(ext.is_empty());
        assert_eq!(ext, PixelExtent::empty());
    }

    #[test]
    fn tex_bounds_cover_whole_pixels() {
        let ext = PixelExtent::new(0, 3, 2, 3);
        assert_eq!(ext.tex_bounds([4, 4]), [0.0, 1.0, 0.5, 1.0]);
    }

    #[test]
    fn node_cell_conversion_round_trips() {
        let mut ext = PixelExtent::new(1, 4, 1, 2);
        ext.cell_to_node();
        assert_eq!(ext, PixelExtent::new(1, 5, 1, 3));
        ext.node_to_cell();
        assert_eq!(ext, PixelExtent::new(1, 4, 1, 2));
    }
}
