use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use turbo_lic::comm::{COLLECTIVE_BIT, Payload, RecvRequest, SCATTER_BIT, SendRequest, Tag};
use turbo_lic::decomp::{CompositeStrategy, DecompConfig, decompose};
use turbo_lic::extent::PixelExtent;
use turbo_lic::{
    ColorParams, CommError, Communicator, EnhanceContrast, FrameInputs, FrameOutcome,
    FrameResult, Image, IntegratorConfig, LicIntegrator, LicParams, LocalComm, LocalWorld,
    Strategy, SurfaceLic, Tiling, VectorSpace,
};

const SIDE: usize = 64;

fn field(i: i32, j: i32) -> [f32; 4] {
    let x = i as f32 / 11.0;
    let y = j as f32 / 6.0;
    [1.0 + 0.4 * y.sin(), 0.8 * x.cos(), 0.0, 1.0]
}

/// Horizontal stripe of rank `r`, sharing `overlap` rows with its
/// neighbours.
fn stripe(ranks: usize, overlap: usize, r: usize) -> PixelExtent {
    let y0 = (r * SIDE / ranks).saturating_sub(overlap / 2);
    let y1 = ((r + 1) * SIDE / ranks + overlap.div_ceil(2)).min(SIDE);
    PixelExtent::new(0, SIDE as i32 - 1, y0 as i32, y1 as i32 - 1)
}

fn stripes(ranks: usize) -> Vec<PixelExtent> {
    (0..ranks).map(|r| stripe(ranks, 0, r)).collect()
}

fn vectors_for(block: &PixelExtent) -> Image {
    Image::from_fn([SIDE, SIDE], |i, j| {
        if block.contains_pixel(i, j) { field(i, j) } else { [0.0; 4] }
    })
}

fn surface<C: Communicator>(comm: C, params: LicParams, config: DecompConfig) -> SurfaceLic<C> {
    let integrator = LicIntegrator::with_config(IntegratorConfig::default().thread_count(2))
        .expect("pool");
    let mut lic = SurfaceLic::new(comm, integrator);
    lic.set_params(params);
    lic.set_decomp_config(config);
    lic
}

/// What every rank draws.
#[derive(Clone, Copy, Default)]
struct Scene {
    overlap: usize,
    /// Mask vectors vanish left of this column; 0 passes no mask image.
    masked_columns: i32,
    /// Vectors handed over in texture units.
    texture: bool,
    colors: bool,
}

struct Rendered {
    frame: FrameResult,
    /// This rank's LIC blocks in the cached programs after the frame.
    cached_lic: Option<Vec<PixelExtent>>,
}

/// Render `frames` frames of one generation on every rank of `comms`.
fn run<C: Communicator>(
    comms: Vec<C>,
    frames: usize,
    scene: Scene,
    params: &LicParams,
    config: &DecompConfig,
    colors: &ColorParams,
) -> Vec<Vec<Rendered>> {
    let ranks = comms.len();
    thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let (params, config, colors) = (params.clone(), config.clone(), colors.clone());
                s.spawn(move || {
                    let rank = comm.rank();
                    let mine = [stripe(ranks, scene.overlap, rank)];
                    let mut vectors = vectors_for(&mine[0]);
                    if scene.texture {
                        vectors = Image::from_fn([SIDE, SIDE], |i, j| {
                            let v = vectors.pixel(i, j);
                            [v[0] / SIDE as f32, v[1] / SIDE as f32, v[2], v[3]]
                        });
                    }
                    let mask = (scene.masked_columns > 0).then(|| {
                        Image::from_fn([SIDE, SIDE], |i, j| {
                            if i < scene.masked_columns { [0.0; 4] } else { vectors.pixel(i, j) }
                        })
                    });
                    let ramp = Image::from_fn([SIDE, SIDE], |i, _| {
                        let t = i as f32 / SIDE as f32;
                        [t, 0.35, 1.0 - t, 1.0]
                    });
                    let mut lic = surface(comm, params, config);
                    lic.set_color_params(colors);
                    (0..frames)
                        .map(|n| {
                            let frame = lic
                                .render_frame(FrameInputs {
                                    generation: 1,
                                    blocks: &mine,
                                    vectors: &vectors,
                                    mask_vectors: mask.as_ref(),
                                    colors: scene.colors.then_some(&ramp),
                                })
                                .unwrap_or_else(|e| panic!("rank {rank} frame {n}: {e}"));
                            let cached_lic = lic.cache().map(|c| c.decomposition.lic[rank].clone());
                            Rendered { frame, cached_lic }
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    })
}

fn render_scene(
    ranks: usize,
    scene: Scene,
    params: &LicParams,
    config: &DecompConfig,
    colors: &ColorParams,
) -> Vec<FrameResult> {
    run(LocalWorld::new(ranks), 1, scene, params, config, colors)
        .into_iter()
        .filter_map(|frames| frames.into_iter().next())
        .map(|r| r.frame)
        .collect()
}

fn render(ranks: usize, params: &LicParams, config: &DecompConfig) -> Vec<FrameResult> {
    render_scene(ranks, Scene::default(), params, config, &ColorParams::default())
}

fn params() -> LicParams {
    LicParams::default()
        .step_size(1.0)
        .step_count(4)
        .enhanced_lic(false)
}

/// Every rank's result over its own extents equals `reference`.
fn assert_matches_reference(reference: &Image, frames: &[FrameResult], label: &str) {
    for (r, frame) in frames.iter().enumerate() {
        assert_eq!(frame.outcome, FrameOutcome::Complete, "{label} rank {r}");
        assert_eq!(frame.tiling, Tiling::Geometry, "{label} rank {r}");
        let lic = frame.lic.as_ref().expect("image");
        for ext in &frame.extents {
            for j in ext.rows() {
                for i in ext.xmin()..=ext.xmax() {
                    let (got, want) = (lic.pixel(i, j), reference.pixel(i, j));
                    assert!(
                        (got[0] - want[0]).abs() < 1e-5 && got[1] == want[1],
                        "{label} rank {r} ({i},{j}): {got:?} vs {want:?}"
                    );
                }
            }
        }
    }
}

/// Wraps a `LocalComm` and fails the first receive of one message class
/// with a timeout, as a transient network fault would.
struct Flaky {
    inner: LocalComm,
    class: Tag,
    armed: AtomicBool,
}

impl Flaky {
    fn world(size: usize, class: Tag, armed: impl Fn(usize) -> bool) -> Vec<Flaky> {
        LocalWorld::with_timeout(size, Duration::from_secs(5))
            .into_iter()
            .enumerate()
            .map(|(rank, inner)| Flaky {
                inner,
                class,
                armed: AtomicBool::new(armed(rank)),
            })
            .collect()
    }
}

impl Communicator for Flaky {
    fn rank(&self) -> usize {
        self.inner.rank()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn post_send(&self, dest: usize, tag: Tag, payload: Payload) -> Result<SendRequest, CommError> {
        self.inner.post_send(dest, tag, payload)
    }

    fn wait_any(&self, pending: &[RecvRequest]) -> Result<(usize, Payload), CommError> {
        if let Some(req) = pending.first() {
            let class = req.tag & (COLLECTIVE_BIT | SCATTER_BIT);
            if class == self.class && self.armed.swap(false, Ordering::SeqCst) {
                return Err(CommError::Timeout {
                    peer: req.source,
                    tag: req.tag,
                });
            }
        }
        self.inner.wait_any(pending)
    }

    fn wait_all_sends(&self, sends: Vec<SendRequest>) -> Result<(), CommError> {
        self.inner.wait_all_sends(sends)
    }

    fn begin_epoch(&self, epoch: u32) {
        self.inner.begin_epoch(epoch)
    }

    fn epoch(&self) -> u32 {
        self.inner.epoch()
    }

    fn next_collective_tag(&self) -> Tag {
        self.inner.next_collective_tag()
    }

    fn messages_sent(&self) -> usize {
        self.inner.messages_sent()
    }
}

#[test]
fn distributed_result_matches_single_rank() {
    let reference = render(1, &params(), &DecompConfig::default());
    let reference = reference[0].lic.as_ref().expect("reference image");

    for strategy in [CompositeStrategy::InPlaceDisjoint, CompositeStrategy::Balanced] {
        let config = DecompConfig::default()
            .strategy(strategy)
            .balanced_tile(16, 16);
        let frames = render(2, &params(), &config);
        assert_matches_reference(reference, &frames, &format!("{strategy:?}"));
    }
}

#[test]
fn enhanced_contrast_and_anti_aliased_result_matches_single_rank() {
    let params = LicParams::default()
        .step_size(1.0)
        .step_count(4)
        .enhanced_lic(true)
        .enhance_contrast(EnhanceContrast::Lic)
        .contrast_factors(0.02, 0.05)
        .anti_alias(1);
    let reference = render(1, &params, &DecompConfig::default());
    let reference = reference[0].lic.as_ref().expect("reference image");

    for strategy in [CompositeStrategy::InPlaceDisjoint, CompositeStrategy::Balanced] {
        let config = DecompConfig::default()
            .strategy(strategy)
            .balanced_tile(16, 16);
        let frames = render(3, &params, &config);
        assert_matches_reference(reference, &frames, &format!("enhanced {strategy:?}"));
    }
}

#[test]
fn overlapping_stripes_in_place_match_single_rank() {
    let params = params().enhanced_lic(true).anti_alias(1);
    let reference = render(1, &params, &DecompConfig::default());
    let reference = reference[0].lic.as_ref().expect("reference image");

    let scene = Scene {
        overlap: 8,
        ..Scene::default()
    };
    let config = DecompConfig::default().strategy(CompositeStrategy::InPlace);
    let frames = render_scene(2, scene, &params, &config, &ColorParams::default());
    assert_matches_reference(reference, &frames, "in-place overlap");
    assert!(frames.iter().all(|f| f.scatter == Default::default()));
}

#[test]
fn mask_vectors_are_gathered_with_the_field() {
    let scene = Scene {
        masked_columns: 20,
        ..Scene::default()
    };
    let config = DecompConfig::default().strategy(CompositeStrategy::InPlaceDisjoint);
    let colors = ColorParams::default();
    let reference = render_scene(1, scene, &params(), &config, &colors);
    let reference = reference[0].lic.as_ref().expect("reference image");

    let frames = render_scene(2, scene, &params(), &config, &colors);
    assert_matches_reference(reference, &frames, "masked");
    for frame in &frames {
        let lic = frame.lic.as_ref().expect("image");
        for ext in &frame.extents {
            for j in ext.rows() {
                assert_eq!(lic.pixel(5, j)[1], 1.0, "(5,{j}) should be masked");
                assert_eq!(lic.pixel(40, j)[1], 0.0, "(40,{j}) should not be masked");
            }
        }
    }
}

#[test]
fn texture_space_vectors_match_screen_space() {
    let screen = params().normalize_vectors(false);
    let reference = render(1, &screen, &DecompConfig::default());
    let reference = reference[0].lic.as_ref().expect("reference image");

    let scene = Scene {
        texture: true,
        ..Scene::default()
    };
    let texture = screen.clone().vector_space(VectorSpace::Texture);
    let config = DecompConfig::default().strategy(CompositeStrategy::InPlaceDisjoint);
    let frames = render_scene(2, scene, &texture, &config, &ColorParams::default());
    assert_matches_reference(reference, &frames, "texture");
}

#[test]
fn contrast_range_matches_single_rank() {
    let params = LicParams::default()
        .step_size(1.0)
        .step_count(4)
        .enhance_contrast(EnhanceContrast::Lic)
        .contrast_factors(0.02, 0.05);
    let config = DecompConfig::default();
    let reference = render(1, &params, &config)[0]
        .final_range
        .expect("single-rank range");
    assert!(reference.0 < reference.1, "{reference:?}");
    for frame in render(2, &params, &config) {
        assert_eq!(frame.outcome, FrameOutcome::Complete);
        let range = frame.final_range.expect("range");
        assert!(
            (range.0 - reference.0).abs() < 1e-6 && (range.1 - reference.1).abs() < 1e-6,
            "{range:?} vs {reference:?}"
        );
    }
}

#[test]
fn color_lightness_range_is_shared_by_all_ranks() {
    let params = params().enhance_contrast(EnhanceContrast::Color);
    let colors = ColorParams::default().contrast_factors(0.05, 0.05);
    let scene = Scene {
        colors: true,
        ..Scene::default()
    };
    let config = DecompConfig::default();
    let reference = render_scene(1, scene, &params, &config, &colors);
    let want = reference[0].color_range.expect("single-rank lightness range");
    let reference_color = reference[0].color.as_ref().expect("reference colors");
    assert!(want.0 < want.1, "{want:?}");
    assert!(reference[0].final_range.is_none(), "LIC contrast stays off");

    let frames = render_scene(3, scene, &params, &config, &colors);
    for (r, frame) in frames.iter().enumerate() {
        assert_eq!(frame.outcome, FrameOutcome::Complete);
        let got = frame.color_range.expect("lightness range");
        assert!(
            (got.0 - want.0).abs() < 1e-6 && (got.1 - want.1).abs() < 1e-6,
            "rank {r}: {got:?} vs {want:?}"
        );
        let color = frame.color.as_ref().expect("colors");
        for ext in &frame.extents {
            for j in ext.rows() {
                for i in ext.xmin()..=ext.xmax() {
                    let (a, b) = (color.pixel(i, j), reference_color.pixel(i, j));
                    assert!(
                        a.iter().zip(&b).all(|(x, y)| (x - y).abs() < 1e-4),
                        "rank {r} ({i},{j}): {a:?} vs {b:?}"
                    );
                }
            }
        }
    }
}

#[test]
fn balanced_frames_scatter_across_ranks() {
    let config = DecompConfig::default()
        .strategy(CompositeStrategy::Balanced)
        .balanced_tile(16, 16);
    let frames = render(2, &params(), &config);
    assert!(frames.iter().any(|f| f.scatter.sent > 0));
    assert!(frames.iter().all(|f| f.gather.received > 0));
}

#[test]
fn nothing_visible_skips_the_frame() {
    let frames = thread::scope(|s| {
        let handles: Vec<_> = LocalWorld::new(2)
            .into_iter()
            .map(|comm| {
                s.spawn(move || {
                    let vectors = Image::new([SIDE, SIDE]);
                    let blocks = [PixelExtent::from_size(SIDE, SIDE)];
                    let mut lic = surface(comm, params(), DecompConfig::default());
                    lic.render_frame(FrameInputs {
                        generation: 1,
                        blocks: &blocks,
                        vectors: &vectors,
                        mask_vectors: None,
                        colors: None,
                    })
                    .expect("frame")
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect::<Vec<_>>()
    });
    for f in &frames {
        assert_eq!(f.outcome, FrameOutcome::Skipped);
        assert!(f.lic.is_none());
    }
}

#[test]
fn programs_are_reused_until_inputs_or_parameters_change() {
    let world = LocalWorld::new(1);
    let Some(comm) = world.into_iter().next() else {
        panic!("world has no rank");
    };
    let block = PixelExtent::from_size(SIDE, SIDE);
    let vectors = vectors_for(&block);
    let colors = Image::filled([SIDE, SIDE], [0.2, 0.4, 0.6, 1.0]);
    let mut lic = surface(comm, params(), DecompConfig::default());
    let inputs = FrameInputs {
        generation: 7,
        blocks: &[block],
        vectors: &vectors,
        mask_vectors: None,
        colors: Some(&colors),
    };

    let first = lic.render_frame(inputs).expect("frame");
    let key = lic.cache().expect("cache").generation;
    let color = first.color.expect("color image");
    let px = color.pixel(10, 10);
    assert!(px[..3].iter().all(|c| (0.0..=1.0).contains(c)), "{px:?}");
    assert_eq!(px[3], 1.0);

    lic.render_frame(inputs).expect("frame");
    assert_eq!(lic.cache().expect("cache").generation, key);

    lic.set_params(params());
    assert_eq!(lic.cache().expect("cache").generation, key, "unchanged params");

    lic.set_params(params().step_count(6));
    lic.render_frame(inputs).expect("frame");
    let rebuilt = lic.cache().expect("cache");
    assert_ne!(rebuilt.generation, key);
    assert_eq!(rebuilt.decomposition.guards, vec![vec![9]]);

    lic.render_frame(FrameInputs {
        generation: 8,
        ..inputs
    })
    .expect("frame");
    assert_eq!(lic.cache().expect("cache").generation.0, 8);
}

#[test]
fn invalid_parameters_fail_the_frame() {
    let world = LocalWorld::new(1);
    let Some(comm) = world.into_iter().next() else {
        panic!("world has no rank");
    };
    let block = PixelExtent::from_size(SIDE, SIDE);
    let vectors = vectors_for(&block);
    let mut lic = surface(comm, params().step_count(-1), DecompConfig::default());
    let result = lic.render_frame(FrameInputs {
        generation: 1,
        blocks: &[block],
        vectors: &vectors,
        mask_vectors: None,
        colors: None,
    });
    assert!(result.is_err());
}

#[test]
fn lost_peer_during_gather_falls_back_to_local_lic() {
    let blocks = stripes(2);
    let outcomes = thread::scope(|s| {
        let handles: Vec<_> = LocalWorld::with_timeout(2, Duration::from_millis(200))
            .into_iter()
            .map(|comm| {
                let blocks = &blocks;
                s.spawn(move || {
                    let r = comm.rank();
                    let mine = [blocks[r]];
                    let vectors = vectors_for(&mine[0]);
                    if r == 1 {
                        // joins the decomposition, then disappears
                        let d = decompose(
                            &comm,
                            &mine,
                            &vectors,
                            &params(),
                            &DecompConfig::default(),
                        )
                        .expect("decompose");
                        assert_eq!(d.strategy, Strategy::InPlaceDisjoint);
                        assert!(comm.all_ok(true));
                        return None;
                    }
                    let mut lic = surface(comm, params(), DecompConfig::default());
                    let frame = lic
                        .render_frame(FrameInputs {
                            generation: 1,
                            blocks: &mine,
                            vectors: &vectors,
                            mask_vectors: None,
                            colors: None,
                        })
                        .expect("frame");
                    Some((frame, lic.cache().is_none()))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect::<Vec<_>>()
    });
    let Some((frame, invalidated)) = &outcomes[0] else {
        panic!("rank 0 produced no frame");
    };
    assert_eq!(frame.outcome, FrameOutcome::Degraded);
    assert_eq!(frame.tiling, Tiling::Geometry);
    assert!(frame.lic.is_some());
    assert!(invalidated, "a failed gather must drop the cached programs");
}

#[test]
fn transient_gather_failure_degrades_one_frame_on_every_rank() {
    let comms = Flaky::world(2, 0, |rank| rank == 0);
    let config = DecompConfig::default().strategy(CompositeStrategy::InPlaceDisjoint);
    let ranks = run(comms, 5, Scene::default(), &params(), &config, &ColorParams::default());
    for (r, frames) in ranks.iter().enumerate() {
        assert_eq!(frames[0].frame.outcome, FrameOutcome::Degraded, "rank {r} frame 0");
        assert!(frames[0].cached_lic.is_none(), "rank {r} kept stale programs");
        for (n, rendered) in frames.iter().enumerate().skip(1) {
            assert_eq!(rendered.frame.outcome, FrameOutcome::Complete, "rank {r} frame {n}");
            assert!(rendered.cached_lic.is_some());
        }
    }
}

#[test]
fn scatter_failure_leaves_every_rank_in_lic_tiling() {
    let reference = render(1, &params(), &DecompConfig::default());
    let reference = reference[0].lic.as_ref().expect("reference image");

    let comms = Flaky::world(2, SCATTER_BIT, |_| true);
    let config = DecompConfig::default()
        .strategy(CompositeStrategy::Balanced)
        .balanced_tile(16, 16);
    let ranks = run(comms, 2, Scene::default(), &params(), &config, &ColorParams::default());
    for (r, frames) in ranks.iter().enumerate() {
        let (failed, next) = (&frames[0], &frames[1]);
        assert_eq!(failed.frame.outcome, FrameOutcome::Degraded, "rank {r}");
        assert_eq!(failed.frame.tiling, Tiling::LicDecomposition, "rank {r}");
        assert!(failed.cached_lic.is_none());
        assert_eq!(Some(&failed.frame.extents), next.cached_lic.as_ref(), "rank {r}");
        let lic = failed.frame.lic.as_ref().expect("image");
        for ext in &failed.frame.extents {
            for j in ext.rows() {
                for i in ext.xmin()..=ext.xmax() {
                    let (got, want) = (lic.pixel(i, j)[0], reference.pixel(i, j)[0]);
                    assert!((got - want).abs() < 1e-5, "rank {r} ({i},{j}): {got} vs {want}");
                }
            }
        }

        assert_eq!(next.frame.outcome, FrameOutcome::Complete, "rank {r}");
        assert_eq!(next.frame.tiling, Tiling::Geometry);
    }
}
