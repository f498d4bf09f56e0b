
//! Whole-pipeline tests: compress and decompress slices and volumes
//! under each quality target, and check the promised guarantees.

extern crate waverr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use waverr::math::Dims;
use waverr::prelude::*;
use waverr::stream::MIN_CHUNK_PREFIX;


/// A smooth synthetic field with a little deterministic noise,
/// shaped like typical simulation output.
fn field(dims: Dims, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);

    (0..dims.count())
        .map(|index| {
            let x = (index % dims.x()) as f64;
            let y = ((index / dims.x()) % dims.y()) as f64;
            let z = (index / (dims.x() * dims.y())) as f64;

            (x * 0.11).sin() * 40.0
                + (y * 0.07).cos() * 40.0
                + (z * 0.19).sin() * 20.0
                + rng.random::<f64>() * 2.0
        })
        .collect()
}

fn psnr(original: &[f64], decoded: &[f64]) -> f64 {
    let (min, max) = original.iter().fold(
        (f64::MAX, f64::MIN),
        |(min, max), &value| (min.min(value), max.max(value)),
    );

    let mse = original.iter().zip(decoded)
        .map(|(original, decoded)| (original - decoded) * (original - decoded))
        .sum::<f64>() / original.len() as f64;

    let range = max - min;
    10.0 * (range * range / mse).log10()
}

fn max_error(original: &[f64], decoded: &[f64]) -> f64 {
    original.iter().zip(decoded)
        .map(|(original, decoded)| (original - decoded).abs())
        .fold(0.0, f64::max)
}

fn compress_volume(
    samples: &[f64], vol: Dims, chunk: Dims,
    configure: impl Fn(&mut VolumeCompressor) -> UnitResult,
) -> Vec<u8> {
    let mut compressor = VolumeCompressor::new();
    compressor.set_dims_and_chunks(vol, chunk).unwrap();
    configure(&mut compressor).unwrap();
    compressor.compress(samples).unwrap();
    compressor.get_encoded_bitstream().unwrap()
}

fn decompress_volume(stream: &[u8]) -> Vec<f64> {
    let mut decompressor = VolumeDecompressor::new();
    decompressor.setup_decomp(stream).unwrap();
    decompressor.decompress(stream).unwrap();
    decompressor.release_data()
}


#[test]
fn constant_volume_decodes_exactly_and_stays_tiny() {
    let vol = Dims(32, 20, 16);
    let samples = vec![std::f64::consts::E; vol.count()];

    let stream = compress_volume(&samples, vol, Dims(32, 20, 16), |compressor| {
        compressor.set_target_bpp(2.0)
    });

    // the single chunk boils down to its conditioner header
    let header_len = stream::header_len(&stream).unwrap();
    assert!(stream.len() - header_len <= 30);

    let decoded = decompress_volume(&stream);
    assert!(decoded.iter().all(|&value| value == std::f64::consts::E));
}

#[test]
fn pwe_bound_holds_across_chunked_volume() {
    let vol = Dims(64, 64, 64);
    let samples = field(vol, 7);
    let tolerance = 0.45;

    let stream = compress_volume(&samples, vol, Dims(32, 40, 64), |compressor| {
        compressor.set_target_pwe(tolerance)
    });

    let decoded = decompress_volume(&stream);
    assert!(
        max_error(&samples, &decoded) <= tolerance,
        "worst error {} exceeds the bound {}", max_error(&samples, &decoded), tolerance
    );
}

#[test]
fn pwe_bound_holds_for_f32_input_with_tiny_tolerance() {
    let vol = Dims(64, 64, 41);
    let wide = field(vol, 13);
    let samples: Vec<f32> = wide.iter().map(|&value| value as f32 * 1e-4).collect();
    let tolerance = 1.5e-7;

    let mut compressor = VolumeCompressor::new();
    compressor.set_dims_and_chunks(vol, Dims(64, 64, 41)).unwrap();
    compressor.set_num_threads(4);
    compressor.set_target_pwe(tolerance).unwrap();
    compressor.compress(&samples).unwrap();
    let stream = compressor.get_encoded_bitstream().unwrap();

    let mut decompressor = VolumeDecompressor::new();
    decompressor.setup_decomp(&stream).unwrap();
    decompressor.decompress(&stream).unwrap();
    let decoded = decompressor.view_data();

    for (decoded, original) in decoded.iter().zip(&samples) {
        assert!(
            (decoded - *original as f64).abs() <= tolerance,
            "error {} exceeds {}", (decoded - *original as f64).abs(), tolerance
        );
    }
}

#[test]
fn f64_input_guards_f32_readback_under_pwe() {
    let dims = Dims(96, 96, 1);
    let samples = field(dims, 29);

    // a tolerance close to the f32 spacing of the values, so narrowing
    // the readback genuinely threatens the bound
    let tolerance = 2e-5;

    let mut compressor = SliceCompressor::new();
    compressor.take_data(samples.clone(), dims).unwrap();
    compressor.set_target_pwe(tolerance).unwrap();
    compressor.compress().unwrap();
    let stream = compressor.release_encoded_bitstream();

    let mut decompressor = SliceDecompressor::new();
    decompressor.use_bitstream(&stream).unwrap();
    decompressor.decompress().unwrap();

    // the bound holds for the wide reconstruction
    assert!(max_error(&samples, decompressor.view_data()) <= tolerance);

    // and it survives narrowing the readback, even though the input was f64
    let narrow = decompressor.get_data::<f32>();
    for (narrow, original) in narrow.iter().zip(&samples) {
        let narrow_error = (f64::from(*narrow) - f64::from(*original as f32)).abs();
        assert!(
            narrow_error <= tolerance,
            "f32 readback error {} exceeds {}", narrow_error, tolerance
        );
    }
}

#[test]
fn psnr_target_is_reached() {
    let vol = Dims(17, 17, 17);
    let samples = field(vol, 3);

    let stream = compress_volume(&samples, vol, Dims(17, 17, 17), |compressor| {
        compressor.set_target_psnr(90.0)
    });

    let decoded = decompress_volume(&stream);
    let quality = psnr(&samples, &decoded);
    assert!(quality > 90.0, "reached only {} dB", quality);
}

#[test]
fn thread_count_does_not_change_the_bytes() {
    let vol = Dims(48, 48, 48);
    let samples = field(vol, 21);

    let mut streams = Vec::new();
    for &threads in &[1_usize, 2, 4, 7] {
        let mut compressor = VolumeCompressor::new();
        compressor.set_dims_and_chunks(vol, Dims(24, 24, 24)).unwrap();
        compressor.set_num_threads(threads);
        compressor.set_target_bpp(3.0).unwrap();
        compressor.compress(&samples).unwrap();
        streams.push(compressor.get_encoded_bitstream().unwrap());
    }

    for stream in &streams[1..] {
        assert_eq!(stream, &streams[0], "output must not depend on the thread count");
    }
}

#[test]
fn volume_rate_target_caps_the_stream() {
    let vol = Dims(64, 64, 32);
    let samples = field(vol, 5);
    let rate = 2.5;

    let stream = compress_volume(&samples, vol, Dims(32, 32, 32), |compressor| {
        compressor.set_target_bpp(rate)
    });

    // the per-chunk coder headers ride on top of the payload budget
    let budget_bytes = (rate * vol.count() as f64 / 8.0) as usize;
    let info = stream::stream_info(&stream).unwrap();
    let slack = info.chunk_offsets.len() * (MIN_CHUNK_PREFIX + 8);
    assert!(stream.len() <= budget_bytes + slack);

    let decoded = decompress_volume(&stream);
    assert!(psnr(&samples, &decoded) > 20.0);
}

#[test]
fn slice_pipeline_under_every_target() {
    let dims = Dims(128, 128, 1);
    let samples = field(dims, 11);

    // rate target
    let mut compressor = SliceCompressor::new();
    compressor.take_data(samples.clone(), dims).unwrap();
    compressor.set_target_bpp(1.0).unwrap();
    compressor.compress().unwrap();
    let rate_stream = compressor.release_encoded_bitstream();
    assert!(rate_stream.len() <= dims.count() / 8 + 64);

    // psnr target
    let mut compressor = SliceCompressor::new();
    compressor.take_data(samples.clone(), dims).unwrap();
    compressor.set_target_psnr(70.0).unwrap();
    compressor.compress().unwrap();
    let psnr_stream = compressor.release_encoded_bitstream();

    // pwe target
    let mut compressor = SliceCompressor::new();
    compressor.take_data(samples.clone(), dims).unwrap();
    compressor.set_target_pwe(0.01).unwrap();
    compressor.compress().unwrap();
    let pwe_stream = compressor.release_encoded_bitstream();

    for (stream, check) in [
        (&rate_stream, None),
        (&psnr_stream, Some(70.0)),
        (&pwe_stream, None),
    ] {
        let mut decompressor = SliceDecompressor::new();
        decompressor.use_bitstream(stream).unwrap();
        decompressor.decompress().unwrap();
        assert_eq!(decompressor.get_dims(), dims);

        if let Some(target) = check {
            assert!(psnr(&samples, decompressor.view_data()) > target);
        }
    }

    let mut decompressor = SliceDecompressor::new();
    decompressor.use_bitstream(&pwe_stream).unwrap();
    decompressor.decompress().unwrap();
    assert!(max_error(&samples, decompressor.view_data()) <= 0.01);
}

#[test]
fn narrow_and_wide_input_agree() {
    let dims = Dims(64, 64, 1);
    let wide = field(dims, 17);
    let narrow: Vec<f32> = wide.iter().map(|&value| value as f32).collect();

    let mut compressor = SliceCompressor::new();
    compressor.copy_data(&narrow, dims).unwrap();
    compressor.set_target_psnr(80.0).unwrap();
    compressor.compress().unwrap();
    let stream = compressor.release_encoded_bitstream();

    let mut decompressor = SliceDecompressor::new();
    decompressor.use_bitstream(&stream).unwrap();
    decompressor.decompress().unwrap();

    let as_f32 = decompressor.get_data::<f32>();
    let as_f64 = decompressor.get_data::<f64>();
    for (narrow, wide) in as_f32.iter().zip(&as_f64) {
        assert_eq!(*narrow, *wide as f32);
    }
}

#[test]
fn mismatched_decompressors_reject_each_other() {
    let vol = Dims(16, 16, 16);
    let samples = field(vol, 2);
    let volume_stream = compress_volume(&samples, vol, vol, |compressor| {
        compressor.set_target_psnr(60.0)
    });

    // a slice decompressor must refuse the volume stream
    let mut slice_decompressor = SliceDecompressor::new();
    assert!(matches!(
        slice_decompressor.use_bitstream(&volume_stream),
        Err(Error::SliceVolumeMismatch)
    ));

    // a volume decompressor must refuse a slice stream
    let dims = Dims(32, 32, 1);
    let mut compressor = SliceCompressor::new();
    compressor.take_data(field(dims, 4), dims).unwrap();
    compressor.set_target_psnr(60.0).unwrap();
    compressor.compress().unwrap();
    let slice_stream = compressor.release_encoded_bitstream();

    let mut volume_decompressor = VolumeDecompressor::new();
    assert!(volume_decompressor.setup_decomp(&slice_stream).is_err());
}
