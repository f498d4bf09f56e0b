#[macro_use]
extern crate bencher;

extern crate waverr;

use bencher::Bencher;
use waverr::cdf97::Cdf97;
use waverr::math::Dims;

fn plane(dims: Dims) -> Vec<f64> {
    (0..dims.count())
        .map(|index| ((index as f64) * 0.137).sin() * 512.0)
        .collect()
}

/// Forward multi-level 2D transform of one 256x256 slice
fn forward_2d(bench: &mut Bencher) {
    let dims = Dims(256, 256, 1);
    let samples = plane(dims);
    let mut transform = Cdf97::new();

    bench.iter(|| {
        transform.take(samples.clone(), dims).unwrap();
        transform.dwt2d();
        bencher::black_box(transform.release());
    })
}

/// Forward and inverse, the whole reversible pair
fn roundtrip_2d(bench: &mut Bencher) {
    let dims = Dims(256, 256, 1);
    let samples = plane(dims);
    let mut transform = Cdf97::new();

    bench.iter(|| {
        transform.take(samples.clone(), dims).unwrap();
        transform.dwt2d();
        transform.idwt2d();
        bencher::black_box(transform.release());
    })
}

/// Dyadic 3D transform of a 64-cube
fn forward_3d(bench: &mut Bencher) {
    let dims = Dims(64, 64, 64);
    let samples = plane(dims);
    let mut transform = Cdf97::new();

    bench.iter(|| {
        transform.take(samples.clone(), dims).unwrap();
        transform.dwt3d();
        bencher::black_box(transform.release());
    })
}

benchmark_group!(benches, forward_2d, roundtrip_2d, forward_3d);
benchmark_main!(benches);
