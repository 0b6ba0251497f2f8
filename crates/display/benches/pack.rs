use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use display::{Packer, PixelFormat};

const WIDTH: u32 = 1920;
const HEIGHT: u32 = 1080;

fn test_pattern() -> Vec<u8> {
    (0..WIDTH as usize * HEIGHT as usize * 3)
        .map(|i| (i * 7 % 251) as u8)
        .collect()
}

fn bench_pack(c: &mut Criterion) {
    let rgb = test_pattern();
    let mut group = c.benchmark_group("pack_1080p");
    group.throughput(Throughput::Elements(WIDTH as u64 * HEIGHT as u64));

    for (name, format) in [("rgb565", PixelFormat::Rgb565), ("xrgb8888", PixelFormat::Xrgb8888)] {
        let mut packer = Packer::new(format, WIDTH, HEIGHT);
        group.bench_function(name, |b| {
            b.iter(|| {
                black_box(packer.pack(black_box(&rgb)));
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_pack);
criterion_main!(benches);
