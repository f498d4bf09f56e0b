
//! The 2D pipeline: a single slice in, a self-describing stream out,
//! and the reverse. The stream leads with a ten-byte meta block:
//! `version(1) · flags(1) · nx u32 · ny u32`, then the conditioner header,
//! the coder stream, and the outlier stream when one was needed.

use bit_field::BitField;

use crate::buffer::{Sample, SampleBuffer};
use crate::cdf97::Cdf97;
use crate::conditioner::{self, Conditioner};
use crate::error::{u32_to_usize, u64_to_usize, usize_to_u32, Error, UnitResult};
use crate::io::Data;
use crate::math::Dims;
use crate::outlier::{self, Outlier, OutlierCoder};
use crate::speck::{self, Speck2d};

use super::{Targets, VERSION_MAJOR};


/// Byte length of the leading meta block of a 2D stream.
pub const META_SIZE: usize = 10;

// meaning of the flag bits in byte 1
const FLAG_ENTROPY_CODED: usize = 0;
const FLAG_IS_3D: usize = 1;
const FLAG_ORIG_IS_F32: usize = 2;
const FLAG_HAS_OUTLIERS: usize = 3;


/// Compresses one 2D slice of samples.
#[derive(Debug, Default)]
pub struct SliceCompressor {
    dims: Dims,
    samples: SampleBuffer,
    original: Vec<f64>,
    orig_is_float: bool,

    settings: conditioner::Settings,
    transform: Cdf97,
    coder: Speck2d,
    outlier_coder: OutlierCoder,
    targets: Targets,

    conditioner_header: conditioner::Header,
    coder_stream: Vec<u8>,
    outlier_stream: Vec<u8>,
    encoded: Vec<u8>,
    num_outliers: usize,
}

impl SliceCompressor {

    /// A compressor without contents.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy a slice of `f32` or `f64` samples in. Resets previous input.
    pub fn copy_data<T: Sample>(&mut self, samples: &[T], dims: Dims) -> UnitResult {
        if !dims.is_2d() {
            return Err(Error::WrongDims);
        }

        self.samples.copy_from(samples, dims)?;
        self.dims = dims;
        self.orig_is_float = T::IS_NARROW;
        Ok(())
    }

    /// Take ownership of `f64` samples. Resets previous input.
    pub fn take_data(&mut self, samples: Vec<f64>, dims: Dims) -> UnitResult {
        if !dims.is_2d() {
            return Err(Error::WrongDims);
        }

        self.samples.take(samples, dims)?;
        self.dims = dims;
        self.orig_is_float = false;
        Ok(())
    }

    /// Choose which conditioning operations may run.
    pub fn toggle_conditioning(&mut self, settings: conditioner::Settings) {
        self.settings = settings;
    }

    /// Target a bit rate. Requires the data to be set first,
    /// and clears the other targets.
    pub fn set_target_bpp(&mut self, bpp: f64) -> UnitResult {
        let header_bytes = META_SIZE + conditioner::HEADER_SIZE;
        self.targets.set_bpp(bpp, self.dims.count(), header_bytes)
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

        // constant fields skip the whole pipeline
        if let Some(header) = conditioner.test_constant(&samples) {
            self.conditioner_header = header;
            return self.assemble();
        }

        let params = self.targets.coder_params(0);
        let mode = params.mode()?;

        if mode == speck::Mode::FixedPsnr {
            let (min, max) = min_max(&samples);
            self.coder.set_data_range(max - min);
        }
        else if mode == speck::Mode::FixedPwe {
            self.original = samples.clone();
        }

        self.conditioner_header = conditioner.condition(&mut samples)?;

        self.transform.take(samples, dims)?;
        self.transform.dwt2d();

        self.coder.set_coefficients(self.transform.release(), dims)?;
        let header_bits = (META_SIZE + conditioner::HEADER_SIZE) * 8;
        self.coder.set_params(self.targets.coder_params(header_bits));
        self.coder.encode()?;

        self.coder_stream = self.coder.release_stream();
        if self.coder_stream.is_empty() {
            return Err(Error::EmptyStream);
        }

        if mode == speck::Mode::FixedPwe {
            self.correct_outliers(&conditioner)?;
        }

        self.assemble()
    }

    /// Reproduce the decoder's reconstruction from the quantized
    /// coefficients, find every sample beyond the tolerance, and encode
    /// the corrections.
    fn correct_outliers(&mut self, conditioner: &Conditioner) -> UnitResult {
        let dims = self.dims;

        self.transform.take(self.coder.release_quantized(), dims)?;
        self.transform.idwt2d();
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

    fn assemble(&mut self) -> UnitResult {
        let mut flags = 0_u8;
        flags.set_bit(FLAG_ORIG_IS_F32, self.orig_is_float);
        flags.set_bit(FLAG_HAS_OUTLIERS, !self.outlier_stream.is_empty());

        self.encoded.clear();
        self.encoded.reserve(
            META_SIZE + conditioner::HEADER_SIZE
                + self.coder_stream.len() + self.outlier_stream.len()
        );

        self.encoded.push(VERSION_MAJOR);
        self.encoded.push(flags);
        usize_to_u32(self.dims.x())?.write(&mut self.encoded)?;
        usize_to_u32(self.dims.y())?.write(&mut self.encoded)?;

        self.encoded.extend_from_slice(&self.conditioner_header);
        self.encoded.extend_from_slice(&self.coder_stream);
        self.encoded.extend_from_slice(&self.outlier_stream);
        Ok(())
    }
}


/// Decompresses the streams of `SliceCompressor`.
#[derive(Debug, Default)]
pub struct SliceDecompressor {
    dims: Dims,
    conditioner_header: conditioner::Header,
    coder_stream: Vec<u8>,
    outlier_stream: Vec<u8>,

    coder: Speck2d,
    transform: Cdf97,
    outlier_coder: OutlierCoder,

    samples: SampleBuffer,
}

impl SliceDecompressor {

    /// A decompressor without contents.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the meta block and split the stream into its parts.
    pub fn use_bitstream(&mut self, bytes: &[u8]) -> UnitResult {
        self.coder_stream.clear();
        self.outlier_stream.clear();

        if bytes.len() < META_SIZE + conditioner::HEADER_SIZE {
            return Err(Error::WrongLength);
        }

        if bytes[0] != VERSION_MAJOR {
            return Err(Error::VersionMismatch);
        }

        let flags = bytes[1];
        if flags.get_bit(FLAG_IS_3D) {
            return Err(Error::SliceVolumeMismatch);
        }
        if flags.get_bit(FLAG_ENTROPY_CODED) {
            return Err(Error::ZstdMismatch);
        }
        let has_outliers = flags.get_bit(FLAG_HAS_OUTLIERS);

        let mut read = &bytes[2..];
        let size_x = u32_to_usize(u32::read(&mut read)?);
        let size_y = u32_to_usize(u32::read(&mut read)?);
        self.dims = Dims(size_x, size_y, 1);
        if self.dims.count() == 0 {
            return Err(Error::invalid("a stream with empty dimensions"));
        }

        let mut rest = &bytes[META_SIZE..];
        self.conditioner_header.copy_from_slice(&rest[..conditioner::HEADER_SIZE]);
        rest = &rest[conditioner::HEADER_SIZE..];

        // a constant field carries no streams at all
        if Conditioner::parse_constant(&self.conditioner_header)?.is_some() {
            return if rest.is_empty() { Ok(()) } else { Err(Error::WrongLength) };
        }

        let coder_size = speck::stream_size(rest)? as usize;
        if coder_size > rest.len() {
            return Err(Error::WrongLength);
        }

        self.coder_stream = rest[..coder_size].to_vec();
        rest = &rest[coder_size..];

        if has_outliers {
            if rest.len() < outlier::HEADER_SIZE {
                return Err(Error::WrongLength);
            }
            self.outlier_stream = rest.to_vec();
        }
        else if !rest.is_empty() {
            return Err(Error::WrongLength);
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
        self.transform.idwt2d();

        let mut samples = self.transform.release();
        Conditioner::default().inverse_condition(&mut samples, &self.conditioner_header)?;

        if !self.outlier_stream.is_empty() {
            self.outlier_coder.parse_stream(&self.outlier_stream)?;
            self.outlier_coder.decode()?;

            for outlier in self.outlier_coder.decoded_outliers() {
                samples[u64_to_usize(outlier.location)] += outlier.error;
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

    /// The dimensions declared by the parsed stream.
    pub fn get_dims(&self) -> Dims {
        self.dims
    }
}


/// Smallest and largest sample.
fn min_max(samples: &[f64]) -> (f64, f64) {
    samples.iter().fold(
        (f64::MAX, f64::MIN),
        |(min, max), &value| (min.min(value), max.max(value)),
    )
}

/// Samples whose error narrows past the tolerance in `f32` while staying
/// inside it in `f64` would silently break the guarantee for single
/// precision readback. Lower the detection tolerance to the smallest such
/// error so those samples are corrected too. Readback precision is the
/// reader's choice, unrelated to the precision the data arrived in,
/// so this runs for every compression.
pub(crate) fn narrowing_tolerance(
    original: &[f64], reconstruction: &[f64], tolerance: f64,
) -> f64 {
    let mut detection = tolerance;

    for (original, reconstructed) in original.iter().zip(reconstruction) {
        let wide = (original - reconstructed).abs();
        let narrow = ((*original as f32) as f64 - (*reconstructed as f32) as f64).abs();

        if narrow > tolerance && wide <= tolerance {
            detection = detection.min(wide);
        }
    }

    detection
}
