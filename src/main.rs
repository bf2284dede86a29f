#[cfg(feature = "mimalloc-global")]
#[global_allocator]
static GLOBAL_ALLOCATOR: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use log::info;
use turbo_lic::{
    ColorParams, CompositeStrategy, DecompConfig, EnhanceContrast, FrameInputs, FrameResult, Image,
    IntegratorConfig, LicIntegrator, LicParams, LocalWorld, NoiseKind, NoiseParams, PixelExtent,
    SurfaceLic,
};

/// Render a vortex through the distributed LIC pipeline with one thread per
/// rank and write the assembled result as a PNG.
#[derive(Parser, Debug)]
#[command(name = "turbo-lic", version)]
struct Args {
    /// Square screen side in pixels.
    #[arg(long, default_value_t = 512)]
    size: usize,
    /// Number of simulated ranks; each owns one horizontal stripe.
    #[arg(long, default_value_t = 4)]
    ranks: usize,
    /// Rows shared by adjacent stripes.
    #[arg(long, default_value_t = 0)]
    overlap: usize,
    #[arg(long, default_value_t = 20)]
    steps: i32,
    #[arg(long, default_value_t = 0.5)]
    step_size: f32,
    /// auto, inplace, disjoint or balanced.
    #[arg(long, default_value = "auto")]
    strategy: String,
    #[arg(long)]
    no_enhance: bool,
    /// off, lic, color or both.
    #[arg(long, default_value = "off")]
    contrast: String,
    #[arg(long, default_value_t = 0)]
    anti_alias: u32,
    #[arg(long)]
    uniform_noise: bool,
    /// Blend the LIC with a horizontal color ramp.
    #[arg(long)]
    color: bool,
    /// Worker threads per rank.
    #[arg(long)]
    threads: Option<usize>,
    #[arg(long, default_value = "lic.png")]
    output: PathBuf,
}

fn vortex(size: usize) -> impl Fn(i32, i32) -> [f32; 4] + Sync {
    let c = size as f32 * 0.5;
    let radius = size as f32 * 0.45;
    move |i, j| {
        let x = i as f32 + 0.5 - c;
        let y = j as f32 + 0.5 - c;
        if x.hypot(y) > radius {
            return [0.0; 4];
        }
        [-y + 0.15 * x, x + 0.15 * y, 0.0, 1.0]
    }
}

fn stripe(size: usize, ranks: usize, overlap: usize, r: usize) -> PixelExtent {
    let y0 = (r * size / ranks).saturating_sub(overlap / 2);
    let y1 = ((r + 1) * size / ranks + overlap.div_ceil(2)).min(size);
    PixelExtent::new(0, size as i32 - 1, y0 as i32, y1 as i32 - 1)
}

fn run_rank(
    args: &Args,
    comm: turbo_lic::LocalComm,
    params: LicParams,
    decomp: DecompConfig,
    noise: &NoiseParams,
) -> Result<(PixelExtent, FrameResult), turbo_lic::LicError> {
    let rank = turbo_lic::Communicator::rank(&comm);
    let block = stripe(args.size, args.ranks, args.overlap, rank);
    let field = vortex(args.size);
    let vectors = Image::from_fn([args.size, args.size], |i, j| {
        if block.contains_pixel(i, j) { field(i, j) } else { [0.0; 4] }
    });
    let size = args.size as f32;
    let colors = Image::from_fn([args.size, args.size], |i, _| {
        let s = i as f32 / size;
        [s, 0.35, 1.0 - s, 1.0]
    });

    let mut config = IntegratorConfig::default();
    if let Some(n) = args.threads {
        config = config.thread_count(n);
    }
    let mut lic = SurfaceLic::new(comm, LicIntegrator::with_config(config)?);
    lic.set_params(params);
    lic.set_decomp_config(decomp);
    lic.set_noise(noise);
    lic.set_color_params(ColorParams::default());

    let blocks = [block];
    let result = lic.render_frame(FrameInputs {
        generation: 1,
        blocks: &blocks,
        vectors: &vectors,
        mask_vectors: None,
        colors: args.color.then_some(&colors),
    })?;
    Ok((block, result))
}

fn to_u8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();
    let strategy = CompositeStrategy::parse(&args.strategy)
        .ok_or_else(|| format!("unknown strategy: {}", args.strategy))?;
    let contrast = EnhanceContrast::parse(&args.contrast)
        .ok_or_else(|| format!("unknown contrast mode: {}", args.contrast))?;
    let params = LicParams::default()
        .step_size(args.step_size)
        .step_count(args.steps)
        .enhanced_lic(!args.no_enhance)
        .enhance_contrast(contrast)
        .anti_alias(args.anti_alias);
    let decomp = DecompConfig::default().strategy(strategy);
    let noise = NoiseParams {
        kind: if args.uniform_noise {
            NoiseKind::Uniform
        } else {
            NoiseKind::Gaussian
        },
        ..NoiseParams::default()
    };

    let start = Instant::now();
    let world = LocalWorld::new(args.ranks.max(1));
    let results = std::thread::scope(|scope| {
        let handles: Vec<_> = world
            .into_iter()
            .map(|comm| {
                let (args, params, decomp, noise) = (&args, params.clone(), decomp.clone(), &noise);
                scope.spawn(move || run_rank(args, comm, params, decomp, noise))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().map_err(|_| "rank thread panicked".to_string()))
            .collect::<Result<Vec<_>, _>>()
    })?;
    let elapsed = start.elapsed();

    let mut png = image::RgbaImage::new(args.size as u32, args.size as u32);
    for (rank, result) in results.into_iter().enumerate() {
        let (block, frame) = result?;
        info!(
            "rank {rank}: {:?} ({:?}), gather {} sent, scatter {} sent",
            frame.outcome, frame.tiling, frame.gather.sent, frame.scatter.sent
        );
        let Some(lic) = frame.lic.as_ref() else {
            continue;
        };
        let field = vortex(args.size);
        for ext in &frame.extents {
            for j in ext.rows() {
                for i in ext.xmin()..=ext.xmax() {
                    if !block.contains_pixel(i, j) || field(i, j)[3] <= 0.0 {
                        continue;
                    }
                    let px = match frame.color.as_ref() {
                        Some(color) => {
                            let c = color.pixel(i, j);
                            [to_u8(c[0]), to_u8(c[1]), to_u8(c[2]), 255]
                        }
                        None => {
                            let v = to_u8(lic.pixel(i, j)[0]);
                            [v, v, v, 255]
                        }
                    };
                    png.put_pixel(i as u32, j as u32, image::Rgba(px));
                }
            }
        }
    }
    png.save(&args.output)?;
    println!(
        "{} ranks, {}x{} in {:.1} ms -> {}",
        args.ranks,
        args.size,
        args.size,
        elapsed.as_secs_f64() * 1e3,
        args.output.display()
    );
    Ok(())
}
