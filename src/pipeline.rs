//! Frame driver: decomposition cache, gather, integrate, scatter, color.

use log::{debug, error, info, warn};

use crate::color::{ColorParams, combine_colors, enhance_color_contrast};
use crate::comm::{Communicator, next_epoch};
use crate::decomp::{DecompConfig, Decomposition, decompose};
use crate::error::{LicError, LicResult};
use crate::extent::PixelExtent;
use crate::image::{Image, tight_block_bounds};
use crate::lic::{EnhanceContrast, LIC_CLEAR, LicInputs, LicIntegrator, LicParams};
use crate::noise::{NoiseParams, generate_noise};
use crate::transfer::{TransferKind, TransferProgram, TransferStats};

/// Decomposition and transfer programs, valid for one `(input, params)`
/// generation pair.
#[derive(Clone, Debug)]
pub struct ProgramCache {
    pub generation: (u64, u64),
    pub decomposition: Decomposition,
    pub gather: TransferProgram,
    pub scatter: TransferProgram,
}

/// One rank's inputs for a frame.
#[derive(Clone, Copy)]
pub struct FrameInputs<'a> {
    /// Bumped by the caller, identically on every rank, whenever geometry or
    /// view changes.
    pub generation: u64,
    /// Screen extents this rank rendered geometry into.
    pub blocks: &'a [PixelExtent],
    /// Screen-sized vector image; alpha > 0 where geometry was drawn.
    pub vectors: &'a Image,
    /// Vectors deciding the LIC mask. Given on every rank or on none.
    pub mask_vectors: Option<&'a Image>,
    /// Surface colors for the final combination.
    pub colors: Option<&'a Image>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Nothing visible on any rank.
    Skipped,
    /// A pass or transfer failed; the image is usable but incomplete.
    Degraded,
    Complete,
}

/// Layout of the returned LIC image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tiling {
    /// Covers this rank's geometry blocks.
    Geometry,
    /// Scatter failed on some rank: covers this rank's LIC blocks instead.
    LicDecomposition,
}

#[derive(Debug)]
pub struct FrameResult {
    pub outcome: FrameOutcome,
    pub tiling: Tiling,
    /// Extents of `lic` holding this rank's result.
    pub extents: Vec<PixelExtent>,
    pub lic: Option<Image>,
    pub color: Option<Image>,
    /// Intensity range mapped by the final contrast stretch, identical on
    /// every rank.
    pub final_range: Option<(f32, f32)>,
    /// Lightness range mapped by the color contrast stretch.
    pub color_range: Option<(f32, f32)>,
    pub gather: TransferStats,
    pub scatter: TransferStats,
}

impl FrameResult {
    fn skipped() -> Self {
        Self {
            outcome: FrameOutcome::Skipped,
            tiling: Tiling::Geometry,
            extents: Vec::new(),
            lic: None,
            color: None,
            final_range: None,
            color_range: None,
            gather: TransferStats::default(),
            scatter: TransferStats::default(),
        }
    }
}

/// Distributed screen-space LIC for one rank.
pub struct SurfaceLic<C: Communicator> {
    comm: C,
    integrator: LicIntegrator,
    params: LicParams,
    param_generation: u64,
    decomp_config: DecompConfig,
    color_params: ColorParams,
    noise: Image,
    cache: Option<ProgramCache>,
    /// Epoch of the next frame.
    epoch: u32,
}

impl<C: Communicator> SurfaceLic<C> {
    pub fn new(comm: C, integrator: LicIntegrator) -> Self {
        Self {
            comm,
            integrator,
            params: LicParams::default(),
            param_generation: 0,
            decomp_config: DecompConfig::default(),
            color_params: ColorParams::default(),
            noise: generate_noise(&NoiseParams::default()),
            cache: None,
            epoch: 0,
        }
    }

    #[inline]
    pub fn comm(&self) -> &C {
        &self.comm
    }

    #[inline]
    pub fn params(&self) -> &LicParams {
        &self.params
    }

    /// Replace the LIC parameters. Programs are rebuilt only on change.
    pub fn set_params(&mut self, params: LicParams) {
        if params != self.params {
            self.params = params;
            self.param_generation += 1;
        }
    }

    pub fn set_decomp_config(&mut self, config: DecompConfig) {
        if config != self.decomp_config {
            self.decomp_config = config;
            self.param_generation += 1;
        }
    }

    pub fn set_color_params(&mut self, params: ColorParams) {
        self.color_params = params;
    }

    pub fn set_noise(&mut self, params: &NoiseParams) {
        self.noise = generate_noise(params);
    }

    pub fn set_noise_image(&mut self, noise: Image) {
        self.noise = noise;
    }

    /// Drop cached programs; the next frame decomposes again. Call on every
    /// rank before the same frame.
    pub fn invalidate(&mut self) {
        self.cache = None;
    }

    pub fn cache(&self) -> Option<&ProgramCache> {
        self.cache.as_ref()
    }

    fn ensure_programs(&mut self, inputs: &FrameInputs<'_>) -> LicResult<()> {
        let key = (inputs.generation, self.param_generation);
        if self.cache.as_ref().is_some_and(|c| c.generation == key) {
            return Ok(());
        }
        self.cache = None;
        let blocks = tight_block_bounds(inputs.vectors, inputs.blocks);
        let decomposition = decompose(
            &self.comm,
            &blocks,
            inputs.vectors,
            &self.params,
            &self.decomp_config,
        );
        let decomposition = self.agree("decomposition", decomposition)?;
        let size = self.comm.size();
        let (gather, scatter) = if decomposition.is_empty() {
            (
                TransferProgram::empty(TransferKind::Gather, size),
                TransferProgram::empty(TransferKind::Scatter, size),
            )
        } else {
            (
                TransferProgram::gather(&decomposition),
                TransferProgram::scatter(&decomposition),
            )
        };
        info!(
            "rank {}: programs rebuilt for generation {key:?}: {:?}, gather {} ({} remote), scatter {} ({} remote)",
            self.comm.rank(),
            decomposition.strategy,
            gather.transactions().len(),
            gather.remote_count(),
            scatter.transactions().len(),
            scatter.remote_count()
        );
        self.cache = Some(ProgramCache {
            generation: key,
            decomposition,
            gather,
            scatter,
        });
        Ok(())
    }

    /// Collective: `Ok` on every rank only when `result` is `Ok` on all of
    /// them.
    fn agree<T>(&self, stage: &'static str, result: LicResult<T>) -> LicResult<T> {
        let agreed = self.comm.all_ok(result.is_ok());
        match result {
            Ok(value) if agreed => Ok(value),
            Ok(_) => Err(LicError::PeerFailed { stage }),
            Err(e) => Err(e),
        }
    }

    /// Single-pass unenhanced LIC over this rank's own blocks, without any
    /// collective. Used when the gather failed.
    fn local_fallback(&self, inputs: &FrameInputs<'_>) -> FrameResult {
        let blocks = tight_block_bounds(inputs.vectors, inputs.blocks);
        let params = self
            .params
            .clone()
            .enhanced_lic(false)
            .enhance_contrast(EnhanceContrast::Off);
        let lic_inputs = LicInputs {
            vectors: inputs.vectors,
            mask_vectors: inputs.mask_vectors,
            noise: &self.noise,
            compute_extents: &blocks,
            valid_extents: &blocks,
        };
        let lic = match self.integrator.integrate(None, lic_inputs, &params) {
            Ok(out) => out.image,
            Err(e) => {
                error!("rank {}: fallback LIC failed: {e}", self.comm.rank());
                Image::filled(inputs.vectors.dims(), LIC_CLEAR)
            }
        };
        let color = inputs
            .colors
            .map(|c| combine_colors(&lic, c, &blocks, &self.color_params));
        FrameResult {
            outcome: FrameOutcome::Degraded,
            tiling: Tiling::Geometry,
            extents: blocks,
            lic: Some(lic),
            color,
            final_range: None,
            color_range: None,
            gather: TransferStats::default(),
            scatter: TransferStats::default(),
        }
    }

    /// Compute one frame. Collective: every rank calls this together with
    /// the same generation.
    ///
    /// Configuration and decomposition errors are returned and the frame is
    /// skipped. Transfer and enhancement failures degrade the result. Every
    /// transfer is followed by an agreement step, so a failure on any rank
    /// sends all ranks down the same fallback and drops their programs.
    pub fn render_frame(&mut self, inputs: FrameInputs<'_>) -> LicResult<FrameResult> {
        let epoch = self.epoch;
        self.epoch = next_epoch(epoch);
        self.comm.begin_epoch(epoch);

        self.params.validate()?;
        self.color_params.validate()?;
        self.ensure_programs(&inputs)?;
        let rank = self.comm.rank();
        let Some(cache) = self.cache.take() else {
            return Ok(FrameResult::skipped());
        };
        if cache.decomposition.is_empty() {
            self.cache = Some(cache);
            return Ok(FrameResult::skipped());
        }
        let dims = inputs.vectors.dims();
        let decomp = &cache.decomposition;

        let mut lic_vectors = Image::new(dims);
        let gathered = cache
            .gather
            .execute(&self.comm, inputs.vectors, &mut lic_vectors);
        let gathered = self.agree("gather", gathered).and_then(|stats| match inputs.mask_vectors {
            Some(mask) => {
                let mut lic_mask = Image::new(dims);
                let done = cache.gather.execute(&self.comm, mask, &mut lic_mask);
                self.agree("mask gather", done)?;
                Ok((stats, Some(lic_mask)))
            }
            None => Ok((stats, None)),
        });
        let (gather_stats, lic_mask) = match gathered {
            Ok(done) => done,
            Err(e) => {
                warn!("rank {rank}: gather failed, falling back to local LIC: {e}");
                return Ok(self.local_fallback(&inputs));
            }
        };

        let mut outcome = FrameOutcome::Complete;
        let mut final_range = None;
        let lic_inputs = LicInputs {
            vectors: &lic_vectors,
            mask_vectors: lic_mask.as_ref(),
            noise: &self.noise,
            compute_extents: &decomp.guarded[rank],
            valid_extents: &decomp.lic[rank],
        };
        let comm: &dyn Communicator = &self.comm;
        let lic = match self.integrator.integrate(Some(comm), lic_inputs, &self.params) {
            Ok(out) => {
                if out.is_degraded() {
                    outcome = FrameOutcome::Degraded;
                }
                final_range = out.final_range;
                for (pass, t) in &out.timings {
                    debug!("rank {rank}: {pass} {:.3} ms", t.as_secs_f64() * 1e3);
                }
                out.image
            }
            Err(e) => {
                error!("rank {rank}: LIC failed, contributing an empty result: {e}");
                outcome = FrameOutcome::Degraded;
                Image::filled(dims, LIC_CLEAR)
            }
        };

        let mut scatter_stats = TransferStats::default();
        let mut keep_cache = true;
        let (lic, tiling) = if decomp.strategy.needs_scatter() {
            let mut scattered = Image::new(dims);
            let done = cache.scatter.execute(&self.comm, &lic, &mut scattered);
            match self.agree("scatter", done) {
                Ok(stats) => {
                    scatter_stats = stats;
                    (scattered, Tiling::Geometry)
                }
                Err(e) => {
                    warn!("rank {rank}: scatter failed, result left in LIC tiling: {e}");
                    outcome = FrameOutcome::Degraded;
                    keep_cache = false;
                    (lic, Tiling::LicDecomposition)
                }
            }
        } else {
            (lic, Tiling::Geometry)
        };

        let extents = match tiling {
            Tiling::Geometry => decomp.geometry[rank].clone(),
            Tiling::LicDecomposition => decomp.lic[rank].clone(),
        };
        let mut color = match (inputs.colors, tiling) {
            (Some(colors), Tiling::Geometry) => {
                Some(combine_colors(&lic, colors, &extents, &self.color_params))
            }
            _ => None,
        };
        let mut color_range = None;
        if tiling == Tiling::Geometry && self.params.enhance_contrast.color() {
            match enhance_color_contrast(Some(comm), color.as_mut(), &extents, &self.color_params) {
                Ok(range) => color_range = color.is_some().then_some(range),
                Err(e) => {
                    warn!("rank {rank}: color contrast failed, colors left unstretched: {e}");
                    outcome = FrameOutcome::Degraded;
                }
            }
        }

        if keep_cache {
            self.cache = Some(cache);
        }
        Ok(FrameResult {
            outcome,
            tiling,
            extents,
            lic: Some(lic),
            color,
            final_range,
            color_range,
            gather: gather_stats,
            scatter: scatter_stats,
        })
    }
}
