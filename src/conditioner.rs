
//! Removes trivially compressible patterns from a sample buffer before the
//! wavelet transform, and records its decisions in a fixed-size header.
//! Also the place where constant fields are detected, which skip the whole
//! pipeline on both ends.

use bit_field::BitField;

use crate::error::{usize_to_u64, Error, Result, UnitResult};
use crate::io::Data;


/// Byte length of the serialized conditioner header.
pub const HEADER_SIZE: usize = 17;

/// The serialized record of what the conditioner did to a buffer.
/// Byte 0 holds the flags (bit 0: mean subtracted, bit 7: constant field),
/// bytes 1..9 hold the subtracted mean or the constant value,
/// bytes 9..17 hold the sample count of a constant field and are zero otherwise.
pub type Header = [u8; HEADER_SIZE];

const MEAN_SUBTRACTED_BIT: usize = 0;
const CONSTANT_FIELD_BIT: usize = 7;

/// The number of segments used for the stride-wise mean;
/// reduced to a divisor of the buffer length before use.
const DEFAULT_NUM_STRIDES: usize = 2048;


/// Which conditioning operations the compressor may apply.
/// Constant-field detection is not configurable, it always runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {

    /// Subtract the mean of all samples before the transform. Default on.
    pub subtract_mean: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings { subtract_mean: true }
    }
}


/// Applies and reverses the conditioning operations.
#[derive(Debug, Clone, Default)]
pub struct Conditioner {
    settings: Settings,
}

impl Conditioner {

    /// A conditioner applying the specified operations.
    pub fn new(settings: Settings) -> Self {
        Conditioner { settings }
    }

    /// Fast pre-check: if every sample equals every other, returns the
    /// finished header describing the constant field. No other stage of the
    /// pipeline needs to run in that case.
    pub fn test_constant(&self, samples: &[f64]) -> Option<Header> {
        let first = *samples.first()?;
        if samples.iter().any(|&sample| sample != first) {
            return None;
        }

        let mut header = [0_u8; HEADER_SIZE];
        header[0].set_bit(CONSTANT_FIELD_BIT, true);

        let mut write = &mut header[1..];
        first.write(&mut write).expect("header buffer write failed");
        usize_to_u64(samples.len()).write(&mut write).expect("header buffer write failed");

        Some(header)
    }

    /// Apply the enabled operations to the buffer in place and
    /// return the header that allows reversing them.
    pub fn condition(&self, samples: &mut [f64]) -> Result<Header> {
        if samples.is_empty() {
            return Err(Error::invalid_param("cannot condition an empty buffer"));
        }

        let mut header = [0_u8; HEADER_SIZE];
        let mut mean = 0.0;

        if self.settings.subtract_mean {
            mean = strided_mean(samples);
            for sample in samples.iter_mut() { *sample -= mean; }
            header[0].set_bit(MEAN_SUBTRACTED_BIT, true);
        }

        let mut write = &mut header[1..];
        mean.write(&mut write)?;

        Ok(header)
    }

    /// Reverse every operation the header records, in reverse order.
    pub fn inverse_condition(&self, samples: &mut [f64], header: &Header) -> UnitResult {
        if samples.is_empty() {
            return Err(Error::invalid_param("cannot condition an empty buffer"));
        }

        let mut read = &header[1..];
        let mean = f64::read(&mut read)?;

        if header[0].get_bit(MEAN_SUBTRACTED_BIT) {
            for sample in samples.iter_mut() { *sample += mean; }
        }

        Ok(())
    }

    /// If the header describes a constant field,
    /// returns the constant value and the sample count.
    pub fn parse_constant(header: &Header) -> Result<Option<(f64, u64)>> {
        if !header[0].get_bit(CONSTANT_FIELD_BIT) {
            return Ok(None);
        }

        let mut read = &header[1..];
        let value = f64::read(&mut read)?;
        let count = u64::read(&mut read)?;
        Ok(Some((value, count)))
    }
}


/// Mean of all samples, accumulated per stride to keep the partial sums small.
fn strided_mean(samples: &[f64]) -> f64 {
    let mut num_strides = DEFAULT_NUM_STRIDES.min(samples.len());
    while samples.len() % num_strides != 0 {
        num_strides -= 1;
    }

    let stride_len = samples.len() / num_strides;
    let total: f64 = samples
        .chunks_exact(stride_len)
        .map(|stride| stride.iter().sum::<f64>())
        .sum();

    total / samples.len() as f64
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn constant_field_detection(){
        let conditioner = Conditioner::default();

        let constant = vec![4.25_f64; 640];
        let header = conditioner.test_constant(&constant).unwrap();
        assert_eq!(Conditioner::parse_constant(&header).unwrap(), Some((4.25, 640)));

        let mut nearly = constant.clone();
        nearly[399] += 1e-12;
        assert!(conditioner.test_constant(&nearly).is_none());
    }

    #[test]
    fn mean_subtraction_roundtrip(){
        let conditioner = Conditioner::default();
        let original: Vec<f64> = (0..100).map(|index| index as f64 * 0.75 + 3.0).collect();

        let mut samples = original.clone();
        let header = conditioner.condition(&mut samples).unwrap();

        let mean: f64 = original.iter().sum::<f64>() / original.len() as f64;
        assert!((samples[0] - (original[0] - mean)).abs() < 1e-12);
        assert_eq!(Conditioner::parse_constant(&header).unwrap(), None);

        conditioner.inverse_condition(&mut samples, &header).unwrap();
        for (restored, original) in samples.iter().zip(&original) {
            assert!((restored - original).abs() < 1e-12);
        }
    }

    #[test]
    fn stride_count_adapts_to_awkward_lengths(){
        // length is prime, so the strides collapse to a single one
        let samples = vec![2.0_f64; 7919];
        assert!((strided_mean(&samples) - 2.0).abs() < 1e-14);

        let samples: Vec<f64> = (0..4096).map(|index| index as f64).collect();
        assert!((strided_mean(&samples) - 2047.5).abs() < 1e-9);
    }

    #[test]
    fn disabled_mean_subtraction_is_recorded(){
        let conditioner = Conditioner::new(Settings { subtract_mean: false });
        let original = vec![5.0, 7.0, 9.0];

        let mut samples = original.clone();
        let header = conditioner.condition(&mut samples).unwrap();
        assert_eq!(samples, original);

        conditioner.inverse_condition(&mut samples, &header).unwrap();
        assert_eq!(samples, original);
    }

    #[test]
    fn empty_buffer_is_rejected(){
        let conditioner = Conditioner::default();
        assert!(matches!(
            conditioner.condition(&mut []),
            Err(Error::InvalidParam(_))
        ));
    }
}
