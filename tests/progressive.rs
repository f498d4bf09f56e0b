
//! Progressive access: any truncated portion of a chunked stream must
//! decode, and quality must only improve with the number of bytes kept.

extern crate waverr;

use waverr::math::Dims;
use waverr::prelude::*;


fn field(dims: Dims) -> Vec<f64> {
    (0..dims.count())
        .map(|index| {
            let x = (index % dims.x()) as f64;
            let rest = (index / dims.x()) as f64;
            (x * 0.09).sin() * 120.0 + (rest * 0.023).cos() * 80.0
        })
        .collect()
}

fn mean_squared_error(original: &[f64], decoded: &[f64]) -> f64 {
    original.iter().zip(decoded)
        .map(|(original, decoded)| (original - decoded) * (original - decoded))
        .sum::<f64>() / original.len() as f64
}

fn decompress(stream: &[u8]) -> Vec<f64> {
    let mut decompressor = VolumeDecompressor::new();
    decompressor.setup_decomp(stream).unwrap();
    decompressor.decompress(stream).unwrap();
    decompressor.release_data()
}

fn full_stream(vol: Dims, chunk: Dims) -> (Vec<f64>, Vec<u8>) {
    let samples = field(vol);

    let mut compressor = VolumeCompressor::new();
    compressor.set_dims_and_chunks(vol, chunk).unwrap();
    compressor.set_target_psnr(85.0).unwrap();
    compressor.compress(&samples).unwrap();

    (samples, compressor.get_encoded_bitstream().unwrap())
}


#[test]
fn every_portion_decodes_and_quality_is_monotone() {
    let vol = Dims(64, 64, 32);
    let (samples, stream) = full_stream(vol, Dims(32, 32, 32));

    let mut previous_error = f64::MAX;
    for &rate in &[0.1, 0.5, 1.0, 2.0, 8.0] {
        let portion = stream::truncate(&stream, rate).unwrap();
        let decoded = decompress(&portion);
        assert_eq!(decoded.len(), vol.count());

        // the transform is only near-orthogonal, so allow a sliver of noise
        let error = mean_squared_error(&samples, &decoded);
        assert!(
            error <= previous_error * 1.001 + 1e-12,
            "more bytes decoded worse: {} after {}", error, previous_error
        );
        previous_error = error;
    }
}

#[test]
fn generous_portion_equals_the_full_stream() {
    let vol = Dims(32, 32, 32);
    let (samples, stream) = full_stream(vol, Dims(32, 32, 32));

    // a rate beyond the actual stream size keeps every chunk whole
    let portion = stream::truncate(&stream, 64.0).unwrap();
    assert_eq!(decompress(&portion), decompress(&stream));

    let full_error = mean_squared_error(&samples, &decompress(&stream));
    assert!(full_error < 1.0);
}

#[test]
fn portions_of_pwe_streams_decode_too() {
    let vol = Dims(48, 48, 16);
    let samples = field(vol);

    let mut compressor = VolumeCompressor::new();
    compressor.set_dims_and_chunks(vol, Dims(48, 48, 16)).unwrap();
    compressor.set_target_pwe(1e-3).unwrap();
    compressor.compress(&samples).unwrap();
    let stream = compressor.get_encoded_bitstream().unwrap();

    // cutting the correction pass away loses the strict bound,
    // but decoding must still succeed with reasonable quality
    let portion = stream::truncate(&stream, 4.0).unwrap();
    let decoded = decompress(&portion);
    assert!(mean_squared_error(&samples, &decoded) < 1.0);
}

#[test]
fn progressive_read_truncates_a_file() {
    let vol = Dims(32, 32, 16);
    let (_, stream) = full_stream(vol, Dims(16, 16, 16));

    let path = std::env::temp_dir().join("waverr_progressive_read_test.bin");
    std::fs::write(&path, &stream).unwrap();

    let portion = stream::progressive_read(&path, 1.0).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(portion, stream::truncate(&stream, 1.0).unwrap());
    assert!(stream::stream_info(&portion).unwrap().is_portion);

    let decoded = decompress(&portion);
    assert_eq!(decoded.len(), vol.count());
}
