
//! Owning sample containers with explicit dimensions.
//! The pipeline stages hand the same allocation to each other
//! through `take` and `release` instead of sharing it.

use crate::error::{Error, UnitResult};
use crate::math::Dims;


/// A sample type the compressor accepts and the decompressor can emit.
/// Everything is widened to `f64` internally; this is a one-of-two tag,
/// not dynamic dispatch.
pub trait Sample: Copy + Default {

    /// Whether this type loses precision compared to the internal samples.
    const IS_NARROW: bool;

    /// Widen to the internal representation.
    fn to_f64(self) -> f64;

    /// Narrow from the internal representation.
    fn from_f64(value: f64) -> Self;
}

impl Sample for f32 {
    const IS_NARROW: bool = true;
    fn to_f64(self) -> f64 { self as f64 }
    fn from_f64(value: f64) -> Self { value as f32 }
}

impl Sample for f64 {
    const IS_NARROW: bool = false;
    fn to_f64(self) -> f64 { self }
    fn from_f64(value: f64) -> Self { value }
}


/// An owning, contiguous buffer of `f64` samples with explicit dimensions.
/// Row-major with `x` varying fastest. The invariant `len == dims.count()`
/// holds whenever the buffer is non-empty.
#[derive(Debug, Clone, Default)]
pub struct SampleBuffer {
    samples: Vec<f64>,
    dims: Dims,
}

impl SampleBuffer {

    /// An empty buffer without dimensions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy samples of any supported precision into this buffer,
    /// discarding previous contents. The dimensions must match the slice length.
    pub fn copy_from<T: Sample>(&mut self, source: &[T], dims: Dims) -> UnitResult {
        if source.len() != dims.count() || dims.is_empty() {
            return Err(Error::WrongDims);
        }

        self.samples.clear();
        self.samples.extend(source.iter().map(|sample| sample.to_f64()));
        self.dims = dims;
        Ok(())
    }

    /// Take ownership of an existing allocation, discarding previous contents.
    pub fn take(&mut self, samples: Vec<f64>, dims: Dims) -> UnitResult {
        if samples.len() != dims.count() || dims.is_empty() {
            return Err(Error::WrongDims);
        }

        self.samples = samples;
        self.dims = dims;
        Ok(())
    }

    /// Reallocate for different dimensions. The contents afterwards are unspecified.
    pub fn resize(&mut self, dims: Dims) {
        self.samples.resize(dims.count(), 0.0);
        self.dims = dims;
    }

    /// Borrow the samples.
    pub fn view(&self) -> &[f64] { &self.samples }

    /// Borrow the samples mutably.
    pub fn view_mut(&mut self) -> &mut [f64] { &mut self.samples }

    /// Transfer the allocation out of this buffer, leaving it empty.
    pub fn release(&mut self) -> Vec<f64> {
        self.dims = Dims::default();
        std::mem::replace(&mut self.samples, Vec::new())
    }

    /// The dimensions of the contained data.
    pub fn dims(&self) -> Dims { self.dims }

    /// Number of contained samples.
    pub fn len(&self) -> usize { self.samples.len() }

    /// Whether the buffer currently holds no samples.
    pub fn is_empty(&self) -> bool { self.samples.is_empty() }

    /// Copy the samples out at the requested precision.
    pub fn to_vec<T: Sample>(&self) -> Vec<T> {
        self.samples.iter().map(|&sample| T::from_f64(sample)).collect()
    }
}
