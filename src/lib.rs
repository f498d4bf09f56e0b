
//! Progressive, wavelet-based lossy compression for 2D and 3D arrays of
//! floating-point samples. Choose one of three quality guarantees: a bit
//! rate, a target PSNR, or a strict per-sample maximum error. Any prefix
//! of a produced chunked stream decodes to a valid lower-quality
//! reconstruction of the full data.

#![warn(
    rust_2018_idioms,
    future_incompatible,
    unused_extern_crates,
    unused,

    missing_copy_implementations,
    missing_debug_implementations,
)]

#![deny(
    unused_variables,
    unused_assignments,
    dead_code,
    unused_must_use,
    trivial_numeric_casts,
)]

#![forbid(unsafe_code)]

pub mod error;
pub mod io; // public to allow for custom header parsing

pub mod math;
pub mod bits;
pub mod buffer;
pub mod conditioner;
pub mod cdf97;
pub mod subband;
pub mod speck;
pub mod outlier;
pub mod codec;
pub mod volume;
pub mod stream;

/// Re-exports of the types commonly required
/// for simply compressing and decompressing data.
pub mod prelude {

    // main exports
    pub use crate::codec::{SliceCompressor, SliceDecompressor};
    pub use crate::volume::{VolumeCompressor, VolumeDecompressor};

    // secondary data types
    pub use crate::codec::VERSION_MAJOR;
    pub use crate::error::{Error, Result, UnitResult};
    pub use crate::math::Dims;
    pub use crate::stream;
}
