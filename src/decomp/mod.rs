//! Domain decomposition: turns each rank's geometry blocks into the
//! decomposition the LIC passes run on, with guard pixels.

mod guard;
mod strategy;

pub use guard::{MIN_GUARD_PIXELS, guard_pixels, guard_sizes};
pub use strategy::{CompositeStrategy, Strategy, cross_rank_overlap_fraction, select_strategy};

use log::{debug, info};

use crate::comm::Communicator;
use crate::error::LicResult;
use crate::extent::{PixelExtent, make_disjoint, make_disjoint_tagged, split_tiles, union_bounds};
use crate::image::Image;
use crate::lic::LicParams;

pub const DEFAULT_AUTO_THRESHOLD: f64 = 0.3;
pub const DEFAULT_GUARD_LEVELS: f64 = 1.0;
pub const DEFAULT_ASPECT_FUDGE: f64 = 1.5;
pub const DEFAULT_BALANCED_TILE: [usize; 2] = [128, 128];

/// Configuration for the decomposer.
///
/// The thresholds are empirical tuning knobs, not correctness constants.
#[derive(Clone, Debug, PartialEq)]
pub struct DecompConfig {
    /// `None` means `TURBOLIC_STRATEGY` if set, otherwise `Auto`.
    pub strategy: Option<CompositeStrategy>,
    /// Cross-rank overlap fraction below which `Auto` stays in place.
    pub auto_threshold: f64,
    pub guard_levels: f64,
    /// Safety factor on the streamline reach.
    pub aspect_fudge: f64,
    pub balanced_tile: [usize; 2],
}

impl Default for DecompConfig {
    fn default() -> Self {
        Self {
            strategy: None,
            auto_threshold: DEFAULT_AUTO_THRESHOLD,
            guard_levels: DEFAULT_GUARD_LEVELS,
            aspect_fudge: DEFAULT_ASPECT_FUDGE,
            balanced_tile: DEFAULT_BALANCED_TILE,
        }
    }
}

impl DecompConfig {
    pub fn strategy(mut self, s: CompositeStrategy) -> Self {
        self.strategy = Some(s);
        self
    }

    pub fn auto_threshold(mut self, t: f64) -> Self {
        self.auto_threshold = t;
        self
    }

    pub fn guard_levels(mut self, levels: f64) -> Self {
        self.guard_levels = levels;
        self
    }

    pub fn aspect_fudge(mut self, fudge: f64) -> Self {
        self.aspect_fudge = fudge;
        self
    }

    pub fn balanced_tile(mut self, nx: usize, ny: usize) -> Self {
        self.balanced_tile = [nx.max(1), ny.max(1)];
        self
    }

    pub fn resolved_strategy(&self) -> CompositeStrategy {
        self.strategy
            .or_else(CompositeStrategy::from_env)
            .unwrap_or_default()
    }
}

/// Result of decomposing one frame. Every per-rank table is indexed by rank
/// and is identical on all ranks.
#[derive(Clone, Debug, PartialEq)]
pub struct Decomposition {
    pub strategy: Strategy,
    pub bounds: PixelExtent,
    /// Geometry blocks, locally disjoint per rank.
    pub geometry: Vec<Vec<PixelExtent>>,
    /// Valid (unguarded) LIC blocks.
    pub lic: Vec<Vec<PixelExtent>>,
    /// Guard width of each LIC block.
    pub guards: Vec<Vec<i32>>,
    /// Guarded LIC blocks, clipped to `bounds` and locally disjoint.
    pub guarded: Vec<Vec<PixelExtent>>,
}

impl Decomposition {
    /// Decomposition with nothing to compute; callers skip the frame.
    pub fn empty(size: usize) -> Self {
        Self {
            strategy: Strategy::InPlace,
            bounds: PixelExtent::empty(),
            geometry: vec![Vec::new(); size],
            lic: vec![Vec::new(); size],
            guards: vec![Vec::new(); size],
            guarded: vec![Vec::new(); size],
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.geometry.len()
    }

    pub fn max_guard(&self) -> i32 {
        self.guards.iter().flatten().copied().max().unwrap_or(0)
    }
}

fn balanced_blocks(
    bounds: &PixelExtent,
    geometry: &[Vec<PixelExtent>],
    tile: [usize; 2],
    size: usize,
) -> Vec<Vec<PixelExtent>> {
    let mut out = vec![Vec::new(); size];
    let mut next = 0usize;
    for t in split_tiles(bounds, tile) {
        let shrunk = geometry
            .iter()
            .flatten()
            .fold(PixelExtent::empty(), |acc, g| acc | (t & *g));
        if shrunk.is_empty() {
            continue;
        }
        out[next % size].push(shrunk);
        next += 1;
    }
    out
}

fn globally_disjoint(geometry: &[Vec<PixelExtent>], size: usize) -> Vec<Vec<PixelExtent>> {
    let tagged: Vec<(usize, PixelExtent)> = geometry
        .iter()
        .enumerate()
        .flat_map(|(r, blocks)| blocks.iter().map(move |b| (r, *b)))
        .collect();
    let mut out = vec![Vec::new(); size];
    for (r, b) in make_disjoint_tagged(tagged) {
        out[r].push(b);
    }
    out
}

/// Build the LIC decomposition for this frame.
///
/// `local_blocks` are this rank's geometry extents (possibly overlapping);
/// `vectors` is this rank's vector image, read only when vectors are not
/// normalized. Collective: every rank must call this together.
pub fn decompose(
    comm: &dyn Communicator,
    local_blocks: &[PixelExtent],
    vectors: &Image,
    params: &LicParams,
    config: &DecompConfig,
) -> LicResult<Decomposition> {
    params.validate()?;
    let (rank, size) = (comm.rank(), comm.size());

    let local = make_disjoint(local_blocks);
    let geometry = comm.all_gather_extents(&local)?;
    let bounds = union_bounds(geometry.iter().flatten());
    if bounds.is_empty() {
        info!("rank {rank}: no visible geometry on any rank, frame skipped");
        return Ok(Decomposition::empty(size));
    }

    let strategy = select_strategy(config.resolved_strategy(), &geometry, config.auto_threshold);
    let lic = match strategy {
        Strategy::InPlace => geometry.clone(),
        Strategy::InPlaceDisjoint => globally_disjoint(&geometry, size),
        Strategy::Balanced => balanced_blocks(&bounds, &geometry, config.balanced_tile, size),
    };

    let flat: Vec<PixelExtent> = lic.iter().flatten().copied().collect();
    let flat_guards = guard_sizes(
        comm,
        &flat,
        &geometry[rank],
        vectors,
        params,
        config.guard_levels,
        config.aspect_fudge,
    )?;

    let mut guards = Vec::with_capacity(size);
    let mut guarded = Vec::with_capacity(size);
    let mut cursor = 0usize;
    for blocks in &lic {
        let g = flat_guards[cursor..cursor + blocks.len()].to_vec();
        cursor += blocks.len();
        let grown: Vec<PixelExtent> = blocks
            .iter()
            .zip(&g)
            .map(|(b, n)| b.grown(*n) & bounds)
            .collect();
        guarded.push(make_disjoint(&grown));
        guards.push(g);
    }

    debug!(
        "rank {rank}: {strategy:?} decomposition of {bounds}, {} LIC blocks, max guard {}",
        flat.len(),
        flat_guards.iter().max().copied().unwrap_or(0)
    );

    Ok(Decomposition {
        strategy,
        bounds,
        geometry,
        lic,
        guards,
        guarded,
    })
}
