use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use turbo_lic::{
    CompositeStrategy, DecompConfig, FrameInputs, Image, LicIntegrator, LicParams, LocalWorld,
    PixelExtent, SurfaceLic,
};

/// Smooth random field: a few randomly placed vortices.
fn field(size: usize, seed: u64) -> Vec<(f32, f32, f32)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..6)
        .map(|_| {
            (
                rng.random_range(0.0..size as f32),
                rng.random_range(0.0..size as f32),
                if rng.random::<bool>() { 1.0 } else { -1.0 },
            )
        })
        .collect()
}

fn sample(vortices: &[(f32, f32, f32)], i: i32, j: i32) -> [f32; 4] {
    let (x, y) = (i as f32 + 0.5, j as f32 + 0.5);
    let mut v = [0.0f32, 0.0, 0.0, 1.0];
    for &(cx, cy, s) in vortices {
        let (dx, dy) = (x - cx, y - cy);
        let w = s / (1.0 + dx * dx + dy * dy).sqrt();
        v[0] -= dy * w;
        v[1] += dx * w;
    }
    v
}

fn bench(size: usize, ranks: usize, strategy: CompositeStrategy, frames: usize) -> (f64, usize) {
    let vortices = field(size, 0x5EED_1234_ABCD_EF01);
    let params = LicParams::default().step_size(0.5).step_count(20);
    let world = LocalWorld::new(ranks);
    let start = Instant::now();
    let sent = std::thread::scope(|scope| {
        let handles: Vec<_> = world
            .into_iter()
            .enumerate()
            .map(|(r, comm)| {
                let (vortices, params) = (&vortices, params.clone());
                scope.spawn(move || {
                    let y0 = (r * size / ranks) as i32;
                    let y1 = ((r + 1) * size / ranks) as i32 - 1;
                    let block = PixelExtent::new(0, size as i32 - 1, y0, y1);
                    let vectors = Image::from_fn([size, size], |i, j| {
                        if block.contains_pixel(i, j) {
                            sample(vortices, i, j)
                        } else {
                            [0.0; 4]
                        }
                    });
                    let integrator = LicIntegrator::new().expect("thread pool");
                    let mut lic = SurfaceLic::new(comm, integrator);
                    lic.set_params(params);
                    lic.set_decomp_config(DecompConfig::default().strategy(strategy));
                    let blocks = [block];
                    let mut sent = 0;
                    for _ in 0..frames {
                        let frame = lic
                            .render_frame(FrameInputs {
                                generation: 1,
                                blocks: &blocks,
                                vectors: &vectors,
                                mask_vectors: None,
                                colors: None,
                            })
                            .expect("frame");
                        sent += frame.gather.sent + frame.scatter.sent;
                    }
                    sent
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread"))
            .sum::<usize>()
    });
    (start.elapsed().as_secs_f64() * 1000.0, sent)
}

fn main() {
    let cases: &[(usize, usize, CompositeStrategy, usize)] = &[
        (256, 1, CompositeStrategy::Auto, 10),
        (256, 4, CompositeStrategy::InPlaceDisjoint, 10),
        (512, 4, CompositeStrategy::InPlaceDisjoint, 5),
        (512, 4, CompositeStrategy::Balanced, 5),
        (1024, 8, CompositeStrategy::InPlaceDisjoint, 3),
        (1024, 8, CompositeStrategy::Balanced, 3),
    ];

    println!(
        "{:<10} {:>6} {:>18} {:>8} {:>12} {:>10} {:>10}",
        "Screen", "Ranks", "Strategy", "Frames", "Total(ms)", "Avg(ms)", "Messages"
    );
    println!("{}", "-".repeat(80));

    for &(size, ranks, strategy, frames) in cases {
        let (total_ms, sent) = bench(size, ranks, strategy, frames);
        let avg_ms = total_ms / frames as f64;
        println!(
            "{:<10} {:>6} {:>18} {:>8} {:>12.1} {:>10.3} {:>10}",
            format!("{}x{}", size, size),
            ranks,
            format!("{strategy:?}"),
            frames,
            total_ms,
            avg_ms,
            sent
        );
    }
}
