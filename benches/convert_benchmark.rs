use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use progressive_preview::color::ToneMapper;
use progressive_preview::image::{convert, AlphaPolicy, RenderImage};

fn noisy_image(width: u32, height: u32, has_alpha: bool) -> RenderImage {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
    let pixels = (0..width * height * 4).map(|_| rng.gen_range(0.0..4.0)).collect();
    RenderImage::new(width, height, pixels, has_alpha)
}

fn bench(c: &mut Criterion) {
    let mapper = ToneMapper::default();
    let image = noisy_image(1280, 720, false);

    let mut group = c.benchmark_group("convert 1280x720");
    group.throughput(Throughput::Elements(1280 * 720));
    for profile in 0..4 {
        group.bench_with_input(BenchmarkId::new("profile", profile), &profile, |b, &profile| {
            b.iter(|| convert(&image, profile, 0.5, &mapper, AlphaPolicy::CompositeOverWhite))
        });
    }
    group.finish();

    let transparent = noisy_image(1280, 720, true);
    c.bench_function("convert transparent", |b| {
        b.iter(|| convert(&transparent, 0, 0.0, &mapper, AlphaPolicy::Preserve))
    });
}

criterion_group!(benches, bench);
criterion_main!(benches);
