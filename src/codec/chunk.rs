
//! The per-chunk 3D pipeline. A chunk stream carries no meta block of its
//! own: the chunked volume header describes dimensions and flags for all
//! chunks. The layout is just `conditioner(17) · coder stream · outlier
//! stream?`, and a truncated prefix of it still decodes.

use crate::buffer::{Sample, SampleBuffer};
use crate::cdf97::Cdf97;
use crate::conditioner::{self, Conditioner};
use crate::error::{u64_to_usize, Error, UnitResult};
use crate::math::Dims;
use crate::outlier::{self, Outlier, OutlierCoder};
use crate::speck::{self, Speck3d};

use super::slice::narrowing_tolerance;
use super::Targets;


/// Compresses one cuboidal chunk of a volume.
#[derive(Debug, Default)]
pub struct ChunkCompressor {
    dims: Dims,
    samples: SampleBuffer,
    original: Vec<f64>,

    settings: conditioner::Settings,
    transform: Cdf97,
    coder: Speck3d,
    outlier_coder: OutlierCoder,
    targets: Targets,

    conditioner_header: conditioner::Header,
    coder_stream: Vec<u8>,
    outlier_stream: Vec<u8>,
    encoded: Vec<u8>,
    num_outliers: usize,
}

impl ChunkCompressor {

    /// A compressor without contents.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy a chunk of `f32` or `f64` samples in. Resets previous input.
    pub fn copy_data<T: Sample>(&mut self, samples: &[T], dims: Dims) -> UnitResult {
        self.samples.copy_from(samples, dims)?;
        self.dims = dims;
        Ok(())
    }

    /// Take ownership of `f64` samples. Resets previous input.
    pub fn take_data(&mut self, samples: Vec<f64>, dims: Dims) -> UnitResult {
        self.samples.take(samples, dims)?;
        self.dims = dims;
        Ok(())
    }

    /// Choose which conditioning operations may run.
    pub fn toggle_conditioning(&mut self, settings: conditioner::Settings) {
        self.settings = settings;
    }

    /// Use an exact bit budget for this chunk, apportioned by the driver.
    /// Clears the other targets.
    pub fn set_bit_budget(&mut self, budget: usize) {
        self.targets.set_bit_budget(budget);
    }

    /// Target a peak signal-to-noise ratio, clearing the other targets.
    pub fn set_target_psnr(&mut self, psnr: f64) -> UnitResult {
        self.targets.set_psnr(psnr)
    }

    /// Guarantee a maximum per-sample error, clearing the other targets.
    pub fn set_target_pwe(&mut self, pwe: f64) -> UnitResult {
        self.targets.set_pwe(pwe)
    }

    /// Terminate at a fixed quantization level. Superseded by `set_target_pwe`.
    pub fn set_target_qz_level(&mut self, level: i32) {
        self.targets.set_qz_level(level);
    }

    /// Adopt targets already prepared by the chunked driver.
    pub(crate) fn set_targets(&mut self, targets: Targets) {
        self.targets = targets;
    }

    /// How many outliers the last compression corrected,
    /// and how many bytes their correction stream took.
    pub fn get_outlier_stats(&self) -> (usize, usize) {
        (self.num_outliers, self.outlier_stream.len())
    }

    /// Borrow the stream assembled by the last `compress`.
    pub fn view_encoded_bitstream(&self) -> &[u8] {
        &self.encoded
    }

    /// Transfer the assembled stream out.
    pub fn release_encoded_bitstream(&mut self) -> Vec<u8> {
        std::mem::replace(&mut self.encoded, Vec::new())
    }

    /// Run the pipeline: condition, transform, code, and in
    /// point-wise-error mode detect and encode the outliers.
    /// Consumes the input samples.
    pub fn compress(&mut self) -> UnitResult {
        let dims = self.dims;
        if self.samples.len() != dims.count() || self.samples.is_empty() {
            return Err(Error::invalid("no samples to compress"));
        }

        self.coder_stream.clear();
        self.outlier_stream.clear();
        self.encoded.clear();
        self.original.clear();
        self.num_outliers = 0;

        let conditioner = Conditioner::new(self.settings);
        let mut samples = self.samples.release();

        if let Some(header) = conditioner.test_constant(&samples) {
            self.conditioner_header = header;
            self.assemble();
            return Ok(());
        }

        let params = self.targets.coder_params(0);
        let mode = params.mode()?;

        if mode == speck::Mode::FixedPsnr {
            let (min, max) = samples.iter().fold(
                (f64::MAX, f64::MIN),
                |(min, max), &value| (min.min(value), max.max(value)),
            );
            self.coder.set_data_range(max - min);
        }
        else if mode == speck::Mode::FixedPwe {
            self.original = samples.clone();
        }

        self.conditioner_header = conditioner.condition(&mut samples)?;

        self.transform.take(samples, dims)?;
        self.transform.dwt3d();

        self.coder.set_coefficients(self.transform.release(), dims)?;
        self.coder.set_params(self.targets.coder_params(conditioner::HEADER_SIZE * 8));
        self.coder.encode()?;

        self.coder_stream = self.coder.release_stream();
        if self.coder_stream.is_empty() {
            return Err(Error::EmptyStream);
        }

        if mode == speck::Mode::FixedPwe {
            self.correct_outliers(&conditioner)?;
        }

        self.assemble();
        Ok(())
    }

    fn correct_outliers(&mut self, conditioner: &Conditioner) -> UnitResult {
        let dims = self.dims;

        self.transform.take(self.coder.release_quantized(), dims)?;
        self.transform.idwt3d();
        let mut reconstruction = self.transform.release();
        conditioner.inverse_condition(&mut reconstruction, &self.conditioner_header)?;

        let tolerance = self.targets.target_pwe;
        let detection = narrowing_tolerance(&self.original, &reconstruction, tolerance);

        let outliers: Vec<Outlier> = self.original.iter()
            .zip(&reconstruction)
            .enumerate()
            .filter_map(|(location, (original, reconstructed))| {
                let difference = original - reconstructed;
                if difference.abs() >= detection {
                    Some(Outlier::new(location as u64, difference))
                }
                else { None }
            })
            .collect();

        self.num_outliers = outliers.len();
        if outliers.is_empty() {
            return Ok(());
        }

        self.outlier_coder.set_length(dims.count() as u64);
        self.outlier_coder.set_tolerance(detection);
        self.outlier_coder.take_outliers(outliers);
        self.outlier_coder.encode()?;

        self.outlier_stream = self.outlier_coder.release_stream();
        if self.outlier_stream.is_empty() {
            return Err(Error::EmptyStream);
        }

        Ok(())
    }

    fn assemble(&mut self) {
        self.encoded.clear();
        self.encoded.reserve(
            conditioner::HEADER_SIZE + self.coder_stream.len() + self.outlier_stream.len()
        );

        self.encoded.extend_from_slice(&self.conditioner_header);
        self.encoded.extend_from_slice(&self.coder_stream);
        self.encoded.extend_from_slice(&self.outlier_stream);
    }
}


/// Decompresses the streams of `ChunkCompressor`,
/// including truncated prefixes of them.
#[derive(Debug, Default)]
pub struct ChunkDecompressor {
    dims: Dims,
    conditioner_header: conditioner::Header,
    coder_stream: Vec<u8>,
    outlier_stream: Vec<u8>,

    coder: Speck3d,
    transform: Cdf97,
    outlier_coder: OutlierCoder,

    samples: SampleBuffer,
}

impl ChunkDecompressor {

    /// A decompressor without contents.
    pub fn new() -> Self {
        Self::default()
    }

    /// The chunk dimensions, which the volume header knows but the
    /// chunk stream itself does not carry.
    pub fn set_dims(&mut self, dims: Dims) -> UnitResult {
        if dims.is_empty() {
            return Err(Error::WrongDims);
        }

        self.dims = dims;
        Ok(())
    }

    /// Split a chunk stream into its parts. A stream cut short by
    /// progressive truncation loses its outlier part first and then any
    /// suffix of the coder payload, both of which are acceptable here.
    pub fn use_bitstream(&mut self, bytes: &[u8]) -> UnitResult {
        self.coder_stream.clear();
        self.outlier_stream.clear();

        if bytes.len() < conditioner::HEADER_SIZE {
            return Err(Error::WrongLength);
        }

        self.conditioner_header.copy_from_slice(&bytes[..conditioner::HEADER_SIZE]);
        let rest = &bytes[conditioner::HEADER_SIZE..];

        if Conditioner::parse_constant(&self.conditioner_header)?.is_some() {
            return if rest.is_empty() { Ok(()) } else { Err(Error::WrongLength) };
        }

        let declared = speck::stream_size(rest)? as usize;

        if declared >= rest.len() {
            // truncated: everything that remains belongs to the coder
            self.coder_stream = rest.to_vec();
        }
        else {
            self.coder_stream = rest[..declared].to_vec();

            // progressive truncation may have cut into the outlier part;
            // whatever useless scrap remains of it is dropped
            let outliers = &rest[declared..];
            if outliers.len() >= outlier::HEADER_SIZE {
                self.outlier_stream = outliers.to_vec();
            }
        }

        Ok(())
    }

    /// Run the reverse pipeline on the parsed stream.
    pub fn decompress(&mut self) -> UnitResult {
        if let Some((value, count)) = Conditioner::parse_constant(&self.conditioner_header)? {
            if u64_to_usize(count) != self.dims.count() {
                return Err(Error::WrongLength);
            }

            self.samples.take(vec![value; u64_to_usize(count)], self.dims)?;
            return Ok(());
        }

        if self.coder_stream.is_empty() {
            return Err(Error::invalid("no stream to decompress"));
        }

        self.coder.parse_stream(&self.coder_stream, self.dims)?;
        self.coder.decode()?;

        self.transform.take(self.coder.release_coefficients(), self.dims)?;
        self.transform.idwt3d();

        let mut samples = self.transform.release();
        Conditioner::default().inverse_condition(&mut samples, &self.conditioner_header)?;

        if !self.outlier_stream.is_empty() {
            let corrections = self.outlier_coder.parse_stream(&self.outlier_stream)
                .and_then(|_| self.outlier_coder.decode());

            match corrections {
                Ok(()) => {
                    for outlier in self.outlier_coder.decoded_outliers() {
                        samples[u64_to_usize(outlier.location)] += outlier.error;
                    }
                }

                // a truncated correction tail no longer guarantees the
                // error bound, but the prefix reconstruction stands
                Err(Error::Exhausted) => {}
                Err(error) => return Err(error),
            }
        }

        self.samples.take(samples, self.dims)
    }

    /// Copy the reconstruction out at the requested precision.
    pub fn get_data<T: Sample>(&self) -> Vec<T> {
        self.samples.to_vec()
    }

    /// Borrow the reconstruction.
    pub fn view_data(&self) -> &[f64] {
        self.samples.view()
    }

    /// Transfer the reconstruction out.
    pub fn release_data(&mut self) -> Vec<f64> {
        self.samples.release()
    }

    /// The chunk dimensions previously set.
    pub fn get_dims(&self) -> Dims {
        self.dims
    }
}


#[cfg(test)]
mod test {
    use super::*;

    fn smooth_volume(dims: Dims) -> Vec<f64> {
        (0..dims.count())
            .map(|index| {
                let x = (index % dims.x()) as f64;
                let rest = (index / dims.x()) as f64;
                (x * 0.14).sin() * 30.0 + (rest * 0.05).cos() * 90.0
            })
            .collect()
    }

    fn roundtrip(stream: &[u8], dims: Dims) -> Vec<f64> {
        let mut decompressor = ChunkDecompressor::new();
        decompressor.set_dims(dims).unwrap();
        decompressor.use_bitstream(stream).unwrap();
        decompressor.decompress().unwrap();
        decompressor.release_data()
    }

    #[test]
    fn pwe_mode_bounds_every_sample(){
        let dims = Dims(17, 17, 17);
        let original = smooth_volume(dims);
        let tolerance = 0.02;

        let mut compressor = ChunkCompressor::new();
        compressor.take_data(original.clone(), dims).unwrap();
        compressor.set_target_pwe(tolerance).unwrap();
        compressor.compress().unwrap();

        let decoded = roundtrip(compressor.view_encoded_bitstream(), dims);
        for (restored, original) in decoded.iter().zip(&original) {
            assert!((restored - original).abs() <= tolerance);
        }
    }

    #[test]
    fn psnr_mode_reaches_the_target(){
        let dims = Dims(32, 32, 16);
        let original = smooth_volume(dims);

        let mut compressor = ChunkCompressor::new();
        compressor.take_data(original.clone(), dims).unwrap();
        compressor.set_target_psnr(70.0).unwrap();
        compressor.compress().unwrap();

        let decoded = roundtrip(compressor.view_encoded_bitstream(), dims);

        let (min, max) = original.iter().fold(
            (f64::MAX, f64::MIN),
            |(min, max), &value| (min.min(value), max.max(value)),
        );
        let mse: f64 = decoded.iter().zip(&original)
            .map(|(restored, original)| (restored - original) * (restored - original))
            .sum::<f64>() / original.len() as f64;
        let psnr = 10.0 * ((max - min) * (max - min) / mse).log10();

        assert!(psnr > 70.0, "reached only {} dB", psnr);
    }

    #[test]
    fn truncated_chunk_still_decodes(){
        let dims = Dims(24, 24, 24);
        let original = smooth_volume(dims);

        let mut compressor = ChunkCompressor::new();
        compressor.take_data(original.clone(), dims).unwrap();
        compressor.set_target_psnr(90.0).unwrap();
        compressor.compress().unwrap();
        let stream = compressor.release_encoded_bitstream();

        let keep = (stream.len() / 3).max(conditioner::HEADER_SIZE + speck::HEADER_SIZE);
        let decoded = roundtrip(&stream[..keep], dims);
        assert_eq!(decoded.len(), dims.count());

        // the prefix reconstruction is coarse but not unrelated
        let full = roundtrip(&stream, dims);
        let coarse_error: f64 = decoded.iter().zip(&original).map(|(a, b)| (a - b).abs()).sum();
        let full_error: f64 = full.iter().zip(&original).map(|(a, b)| (a - b).abs()).sum();
        assert!(full_error <= coarse_error);
    }

    #[test]
    fn constant_chunk_is_exactly_the_conditioner_header(){
        let dims = Dims(32, 20, 16);

        let mut compressor = ChunkCompressor::new();
        compressor.copy_data(&vec![-7.125_f32; dims.count()], dims).unwrap();
        compressor.set_target_pwe(1e-6).unwrap();
        compressor.compress().unwrap();

        let stream = compressor.release_encoded_bitstream();
        assert_eq!(stream.len(), conditioner::HEADER_SIZE);

        let decoded = roundtrip(&stream, dims);
        assert!(decoded.iter().all(|&value| value == -7.125));
    }
}
