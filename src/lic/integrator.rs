//! Multi-pass LIC integrator.
//!
//! Pass order per frame, over the guarded compute extents:
//! VT, LIC0, LICI x N backward, LIC0 seed reset, LICI x N forward, LICN.
//! Enhanced mode adds CE1 (optional), EE and a second convolution of the
//! EE image with N/2 steps. Then AA rounds and the final CE2.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use log::{debug, warn};

use super::buffers::{PingPongBuffers, ResourceRole};
use super::params::{LicParams, VectorSpace};
use super::passes::{
    NoiseSource, anti_alias, contrast_stretch, edge_enhance, find_min_max, lic0, lic0_reset, lici,
    licn, transform_vectors,
};
use crate::comm::{Communicator, ReduceOp};
use crate::error::{LicError, LicResult};
use crate::extent::PixelExtent;
use crate::image::Image;

static PHYSICAL_CORES: OnceLock<usize> = OnceLock::new();

/// Upper bound of the auto-detected pool size.
const MAX_AUTO_THREADS: usize = 32;

#[inline]
fn physical_core_count() -> usize {
    *PHYSICAL_CORES.get_or_init(|| num_cpus::get_physical().max(1))
}

/// One worker per physical core, at most `MAX_AUTO_THREADS`.
#[inline]
fn auto_pool_thread_count_for_physical(physical: usize) -> usize {
    physical.clamp(1, MAX_AUTO_THREADS)
}

fn resolve_thread_count(config: &IntegratorConfig) -> usize {
    let requested = config
        .thread_count
        .unwrap_or_else(|| auto_pool_thread_count_for_physical(physical_core_count()));
    config
        .max_threads
        .map_or(requested, |cap| requested.min(cap))
        .max(1)
}

/// Sizing of the pass pool. Unset knobs are detected from the host.
#[derive(Clone, Debug, Default)]
pub struct IntegratorConfig {
    /// Workers in the pass pool; `None` uses one per physical core.
    pub thread_count: Option<usize>,
    /// Cap applied after detection.
    pub max_threads: Option<usize>,
}

impl IntegratorConfig {
    pub fn thread_count(mut self, n: usize) -> Self {
        self.thread_count = Some(n.max(1));
        self
    }

    pub fn max_threads(mut self, n: usize) -> Self {
        self.max_threads = Some(n.max(1));
        self
    }
}

/// Images and extents one integration consumes. All images except `noise`
/// are screen-sized.
#[derive(Clone, Copy)]
pub struct LicInputs<'a> {
    pub vectors: &'a Image,
    /// Field used for the mask test; `vectors` when absent.
    pub mask_vectors: Option<&'a Image>,
    /// Noise texture, tiled over the screen.
    pub noise: &'a Image,
    /// Guarded extents the passes run over, disjoint.
    pub compute_extents: &'a [PixelExtent],
    /// Unguarded extents used for contrast statistics.
    pub valid_extents: &'a [PixelExtent],
}

#[derive(Debug)]
pub struct LicOutput {
    /// Final LIC buffer: r intensity, g mask flag, b skip flag, a count.
    pub image: Image,
    /// Range mapped onto [0, 1] by the final contrast stretch.
    pub final_range: Option<(f32, f32)>,
    /// Enhancement passes that failed and were skipped.
    pub degraded: Vec<&'static str>,
    pub timings: Vec<(&'static str, Duration)>,
}

impl LicOutput {
    #[inline]
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

pub struct LicIntegrator {
    pool: rayon::ThreadPool,
    threads: usize,
}

/// Per-frame pass state.
struct Frame<'a> {
    rank: usize,
    comm: Option<&'a dyn Communicator>,
    inputs: LicInputs<'a>,
    params: &'a LicParams,
    bufs: PingPongBuffers,
    degraded: Vec<&'static str>,
    timings: Vec<(&'static str, Duration)>,
}

impl LicIntegrator {
    pub fn new() -> LicResult<Self> {
        Self::with_config(IntegratorConfig::default())
    }

    pub fn with_config(config: IntegratorConfig) -> LicResult<Self> {
        let threads = resolve_thread_count(&config);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| LicError::resource("pool", e))?;
        Ok(Self { pool, threads })
    }

    #[inline]
    pub fn thread_count(&self) -> usize {
        self.threads
    }

    /// Run every pass for one frame.
    ///
    /// `comm` is needed for contrast enhancement: both stretches use a range
    /// reduced over all ranks, so every rank must call this together when
    /// it is enabled. With `None` the range is local.
    pub fn integrate(
        &self,
        comm: Option<&dyn Communicator>,
        inputs: LicInputs<'_>,
        params: &LicParams,
    ) -> LicResult<LicOutput> {
        params.validate()?;
        let dims = inputs.vectors.dims();
        if dims[0] == 0 || dims[1] == 0 {
            return Err(LicError::config("vector image is empty"));
        }
        let noise_dims = inputs.noise.dims();
        if noise_dims[0] == 0 || noise_dims[1] == 0 {
            return Err(LicError::resource("LIC0", "noise texture is empty"));
        }

        let bufs = PingPongBuffers::new(dims, params.enhanced_lic);
        if let Some(mask) = inputs.mask_vectors {
            bufs.check_binding("LIC0", ResourceRole::MaskVector, mask)?;
        }

        let mut frame = Frame {
            rank: comm.map(|c| c.rank()).unwrap_or(0),
            comm,
            inputs,
            params,
            bufs,
            degraded: Vec::new(),
            timings: Vec::new(),
        };
        let final_range = self.pool.install(|| frame.run())?;

        Ok(LicOutput {
            image: frame.bufs.into_current_lic(),
            final_range,
            degraded: frame.degraded,
            timings: frame.timings,
        })
    }
}

impl Frame<'_> {
    fn run(&mut self) -> LicResult<Option<(f32, f32)>> {
        let extents = self.inputs.compute_extents;
        debug!(
            "rank {}: LIC over {} extents, {} steps each way, enhanced {}",
            self.rank,
            extents.len(),
            self.params.step_count,
            self.params.enhanced_lic
        );

        let t = Instant::now();
        let pass = match self.params.vector_space {
            VectorSpace::Texture => "VT",
            VectorSpace::Screen => "stage",
        };
        self.bufs.check_binding(pass, ResourceRole::Vector, self.inputs.vectors)?;
        transform_vectors(
            self.inputs.vectors,
            extents,
            self.params.vector_space,
            self.bufs.image_vectors_mut(),
        );
        self.timings.push((pass, t.elapsed()));

        self.bufs.clear(extents, true);
        let t = Instant::now();
        let noise = self.inputs.noise;
        self.convolve(NoiseSource::Tiled(noise), self.params.step_count)?;
        self.timings.push(("integrate1", t.elapsed()));

        if self.params.enhanced_lic {
            if self.params.enhance_contrast.lic() {
                let t = Instant::now();
                if let Err(e) = self.contrast(0.0, 0.0, extents, "CE1") {
                    self.degrade("CE1", &e);
                }
                self.timings.push(("CE1", t.elapsed()));
            }
            let t = Instant::now();
            match self.edge_pass() {
                Ok(edge) => {
                    self.timings.push(("EE", t.elapsed()));
                    let t = Instant::now();
                    self.bufs.clear(extents, false);
                    self.convolve(NoiseSource::Screen(&edge), self.params.second_pass_steps())?;
                    self.timings.push(("integrate2", t.elapsed()));
                }
                Err(e) => self.degrade("EE", &e),
            }
        }

        if self.params.anti_alias > 0 {
            let t = Instant::now();
            for _ in 0..self.params.anti_alias {
                for axis in 0..2 {
                    let (read, write) = self.bufs.split();
                    anti_alias(read, write.lic, extents, axis);
                    self.bufs.swap();
                }
            }
            self.timings.push(("AA", t.elapsed()));
        }

        let mut final_range = None;
        if self.params.enhance_contrast.lic() {
            let t = Instant::now();
            let valid = self.inputs.valid_extents;
            match self.contrast(
                self.params.low_contrast_factor,
                self.params.high_contrast_factor,
                valid,
                "CE2",
            ) {
                Ok(range) => final_range = Some(range),
                Err(e) => self.degrade("CE2", &e),
            }
            self.timings.push(("CE2", t.elapsed()));
        }
        Ok(final_range)
    }

    fn degrade(&mut self, pass: &'static str, err: &LicError) {
        warn!("rank {}: {pass} failed, continuing without it: {err}", self.rank);
        self.degraded.push(pass);
    }

    /// LIC0, backward LICI, seed reset, forward LICI, LICN.
    fn convolve(&mut self, input: NoiseSource<'_>, steps: i32) -> LicResult<()> {
        let extents = self.inputs.compute_extents;
        let mask = self.inputs.mask_vectors.unwrap_or(self.inputs.vectors);
        let h = self.params.step_size;
        let normalize = self.params.normalize_vectors;

        let (_, write) = self.bufs.split();
        lic0(write, extents, input, mask, self.params.mask_threshold);
        self.bufs.swap();

        for _ in 0..steps {
            let (read, write) = self.bufs.split();
            lici(read, write, extents, input, -h, normalize);
            self.bufs.swap();
        }

        let (read, write) = self.bufs.split();
        lic0_reset(read, write, extents);
        self.bufs.swap();

        for _ in 0..steps {
            let (read, write) = self.bufs.split();
            lici(read, write, extents, input, h, normalize);
            self.bufs.swap();
        }

        let (read, write) = self.bufs.split();
        licn(read, write, extents);
        self.bufs.swap();
        Ok(())
    }

    fn edge_pass(&mut self) -> LicResult<Image> {
        let extents = self.inputs.compute_extents;
        let (lic, edge) = self.bufs.edge_with_current()?;
        edge_enhance(lic, extents, edge);
        self.bufs
            .take_edge()
            .ok_or_else(|| LicError::resource("EE", "edge-enhance buffer missing after pass"))
    }

    fn global_range(&self, pass: &'static str) -> LicResult<(f32, f32)> {
        let local = find_min_max(self.bufs.current_lic(), self.inputs.valid_extents);
        global_min_max(self.comm, self.rank, local, pass)
    }

    /// Contrast stretch of the current buffer over `extents`, after
    /// trimming `low`/`high` fractions off the global range.
    fn contrast(
        &mut self,
        low: f32,
        high: f32,
        extents: &[PixelExtent],
        pass: &'static str,
    ) -> LicResult<(f32, f32)> {
        let (mut lo, mut hi) = self.global_range(pass)?;
        let d = hi - lo;
        lo += d * low;
        hi -= d * high;
        debug!("rank {}: {pass} stretching [{lo}, {hi}]", self.rank);
        let (read, write) = self.bufs.split();
        contrast_stretch(read, write.lic, extents, lo, hi - lo);
        self.bufs.swap();
        Ok((lo, hi))
    }
}

/// Global range of a per-rank `[lo, hi]` sample range. Local ranges that
/// are degenerate or outside [0, 1] are replaced by [0, 1]; ranks without
/// samples contribute nothing. A degenerate global range becomes [0, 1].
pub(crate) fn global_min_max(
    comm: Option<&dyn Communicator>,
    rank: usize,
    local: Option<(f32, f32)>,
    pass: &'static str,
) -> LicResult<(f32, f32)> {
    let local = match local {
        Some((lo, hi)) if hi <= lo || hi > 1.0 || lo < 0.0 => {
            warn!("rank {rank}: {pass} invalid range [{lo}, {hi}], using [0, 1]");
            Some((0.0, 1.0))
        }
        other => other,
    };
    let (lo, hi) = local.unwrap_or((f32::INFINITY, f32::NEG_INFINITY));
    let (lo, hi) = match comm {
        Some(comm) => {
            let reduced = comm.all_reduce(&[lo as f64, -(hi as f64)], ReduceOp::Min)?;
            (reduced[0] as f32, -reduced[1] as f32)
        }
        None => (lo, hi),
    };
    if hi <= lo {
        return Ok((0.0, 1.0));
    }
    Ok((lo, hi))
}

#[cfg(test)]
mod tests {
    use super::{IntegratorConfig, auto_pool_thread_count_for_physical, resolve_thread_count};

    #[test]
    fn auto_pool_uses_every_physical_core_up_to_the_cap() {
        assert_eq!(auto_pool_thread_count_for_physical(0), 1);
        assert_eq!(auto_pool_thread_count_for_physical(12), 12);
        assert_eq!(auto_pool_thread_count_for_physical(32), 32);
        assert_eq!(auto_pool_thread_count_for_physical(96), 32);
    }

    #[test]
    fn explicit_threads_respect_the_cap() {
        let cfg = IntegratorConfig::default().thread_count(16).max_threads(3);
        assert_eq!(resolve_thread_count(&cfg), 3);
        let cfg = IntegratorConfig::default().thread_count(2);
        assert_eq!(resolve_thread_count(&cfg), 2);
    }
}
