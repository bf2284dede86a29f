//! Integer pixel rectangles and the set algebra built on them.

mod ops;
mod pixel_extent;

pub use ops::{
    make_disjoint, make_disjoint_tagged, merge, split_tiles, subtract, subtract_all, total_size,
    union_bounds,
};
pub use pixel_extent::PixelExtent;
