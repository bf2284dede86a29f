//! Composite strategy selection.

use std::sync::OnceLock;

use crate::extent::PixelExtent;

/// Requested strategy. `Auto` is resolved per decomposition by
/// `select_strategy`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CompositeStrategy {
    #[default]
    Auto,
    InPlace,
    InPlaceDisjoint,
    Balanced,
}

/// Strategy actually used for a decomposition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Each rank convolves its own geometry blocks.
    InPlace,
    /// Geometry blocks made globally disjoint, largest first.
    InPlaceDisjoint,
    /// Bounding extent regridded into tiles dealt round-robin.
    Balanced,
}

impl Strategy {
    /// Whether LIC results must be scattered back to the geometry
    /// decomposition.
    #[inline]
    pub fn needs_scatter(self) -> bool {
        !matches!(self, Strategy::InPlace)
    }
}

static ENV_STRATEGY: OnceLock<Option<CompositeStrategy>> = OnceLock::new();

impl CompositeStrategy {
    pub fn parse(v: &str) -> Option<Self> {
        let v = v.trim();
        if v.eq_ignore_ascii_case("auto") {
            Some(Self::Auto)
        } else if v.eq_ignore_ascii_case("inplace") || v.eq_ignore_ascii_case("in-place") {
            Some(Self::InPlace)
        } else if v.eq_ignore_ascii_case("disjoint")
            || v.eq_ignore_ascii_case("inplace-disjoint")
        {
            Some(Self::InPlaceDisjoint)
        } else if v.eq_ignore_ascii_case("balanced") {
            Some(Self::Balanced)
        } else {
            None
        }
    }

    /// `TURBOLIC_STRATEGY` override, read once per process.
    pub fn from_env() -> Option<Self> {
        *ENV_STRATEGY.get_or_init(|| {
            std::env::var("TURBOLIC_STRATEGY")
                .ok()
                .and_then(|v| Self::parse(&v))
        })
    }
}

/// Fraction of in-place pixels that are also owned by another rank.
/// `blocks` must be locally disjoint per rank.
pub fn cross_rank_overlap_fraction(blocks: &[Vec<PixelExtent>]) -> f64 {
    let total: usize = blocks.iter().flatten().map(PixelExtent::size).sum();
    if total == 0 {
        return 0.0;
    }
    let mut overlap = 0usize;
    for (r, mine) in blocks.iter().enumerate() {
        for theirs in &blocks[r + 1..] {
            for a in mine {
                for b in theirs {
                    overlap += (*a & *b).size();
                }
            }
        }
    }
    overlap as f64 / total as f64
}

/// Resolve the requested strategy against the gathered geometry blocks.
///
/// Without cross-rank overlap the in-place layout is already globally
/// disjoint. A small overlap is cheaper to convolve twice than to
/// redistribute; past `threshold` the geometry is made disjoint.
pub fn select_strategy(
    requested: CompositeStrategy,
    blocks: &[Vec<PixelExtent>],
    threshold: f64,
) -> Strategy {
    match requested {
        CompositeStrategy::InPlace => Strategy::InPlace,
        CompositeStrategy::InPlaceDisjoint => Strategy::InPlaceDisjoint,
        CompositeStrategy::Balanced => Strategy::Balanced,
        CompositeStrategy::Auto => {
            let f = cross_rank_overlap_fraction(blocks);
            if f > 0.0 && f < threshold {
                Strategy::InPlace
            } else {
                Strategy::InPlaceDisjoint
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CompositeStrategy, Strategy, cross_rank_overlap_fraction, select_strategy};
    use crate::extent::PixelExtent;

    fn halves(overlap_rows: i32) -> Vec<Vec<PixelExtent>> {
        vec![
            vec![PixelExtent::new(0, 99, 0, 49 + overlap_rows)],
            vec![PixelExtent::new(0, 99, 50, 99)],
        ]
    }

    #[test]
    fn auto_prefers_disjoint_without_overlap() {
        let blocks = halves(0);
        assert_eq!(cross_rank_overlap_fraction(&blocks), 0.0);
        assert_eq!(
            select_strategy(CompositeStrategy::Auto, &blocks, 0.3),
            Strategy::InPlaceDisjoint
        );
    }

    #[test]
    fn auto_threshold_splits_small_and_large_overlap() {
        let small = halves(10);
        assert_eq!(
            select_strategy(CompositeStrategy::Auto, &small, 0.3),
            Strategy::InPlace
        );
        let large = halves(50);
        assert!(cross_rank_overlap_fraction(&large) >= 0.3);
        assert_eq!(
            select_strategy(CompositeStrategy::Auto, &large, 0.3),
            Strategy::InPlaceDisjoint
        );
    }

    #[test]
    fn forced_strategies_are_respected() {
        let blocks = halves(0);
        assert_eq!(
            select_strategy(CompositeStrategy::Balanced, &blocks, 0.3),
            Strategy::Balanced
        );
        assert_eq!(
            select_strategy(CompositeStrategy::InPlace, &blocks, 0.3),
            Strategy::InPlace
        );
        assert!(!Strategy::InPlace.needs_scatter());
    }

    #[test]
    fn parse_accepts_documented_names() {
        assert_eq!(CompositeStrategy::parse(" Balanced "), Some(CompositeStrategy::Balanced));
        assert_eq!(
            CompositeStrategy::parse("disjoint"),
            Some(CompositeStrategy::InPlaceDisjoint)
        );
        assert_eq!(CompositeStrategy::parse("nope"), None);
    }
}
