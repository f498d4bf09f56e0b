
//! The set-partitioning bit-plane coder that turns a buffer of wavelet
//! coefficients into an embedded stream, and back.
//!
//! Any prefix of the produced stream decodes to a valid lower-quality
//! version of the coefficients; the encoder simply stops emitting once its
//! termination target is met, and the decoder stops when the bits run out.

mod storage;
mod coder2d;
mod coder3d;

pub use coder2d::Speck2d;
pub use coder3d::Speck3d;

use crate::error::{Error, Result};
use crate::io::Data;


/// Byte length of the header that precedes the coded payload.
pub const HEADER_SIZE: usize = 10;

/// Hard cap on the number of bit planes either endpoint will walk.
pub(crate) const MAX_PLANES: i32 = 128;

/// The coder refuses to descend below this plane.
pub(crate) const MIN_PLANE: i32 = -63;

/// Extra headroom between the point-wise error target and the terminal
/// threshold, absorbing the error growth of the inverse transform.
/// The outlier pass enforces the exact bound afterwards.
pub(crate) const PWE_HEADROOM: f64 = 1.5;


/// Which single criterion terminates the bit-plane loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {

    /// Stop once the output reaches a fixed number of bits.
    FixedRate,

    /// Stop once the estimated reconstruction quality reaches a target PSNR.
    FixedPsnr,

    /// Stop once the threshold is fine enough for the point-wise error
    /// target; outliers are corrected by a separate pass.
    FixedPwe,

    /// Stop at a fixed quantization level. Superseded by `FixedPwe`,
    /// kept for compatibility with older streams.
    FixedQz,
}

/// Termination parameters. Exactly one of them must be active;
/// the inactive ones keep their never-terminate sentinels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Params {

    /// Total payload bit budget, `usize::MAX` when unlimited.
    pub budget_bits: usize,

    /// Target PSNR in dB, `f64::MAX` when unlimited.
    pub target_psnr: f64,

    /// Target point-wise error, zero when unlimited.
    pub target_pwe: f64,

    /// Legacy terminal quantization level, `i32::MIN` when unused.
    pub qz_level: i32,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            budget_bits: usize::MAX,
            target_psnr: f64::MAX,
            target_pwe: 0.0,
            qz_level: i32::MIN,
        }
    }
}

impl Params {

    /// Derive the single active termination criterion.
    pub fn mode(&self) -> Result<Mode> {
        let rate = self.budget_bits != usize::MAX;
        let psnr = self.target_psnr != f64::MAX;
        let pwe = self.target_pwe > 0.0;
        let qz = self.qz_level != i32::MIN;

        match (rate, psnr, pwe, qz) {
            (true, false, false, false) => Ok(Mode::FixedRate),
            (false, true, false, false) => Ok(Mode::FixedPsnr),
            (false, false, true, false) => Ok(Mode::FixedPwe),
            (false, false, false, true) => Ok(Mode::FixedQz),
            _ => Err(Error::invalid_param("exactly one compression target must be set")),
        }
    }
}


/// The fixed-size header of a coded stream:
/// `max_coeff_bit: i32`, `qz_level: i16`, `len_bits: u32`, little-endian.
/// `max_coeff_bit` is `i32::MIN` for an all-zero coefficient buffer,
/// `qz_level` is zero unless the legacy fixed-level mode produced the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StreamHeader {
    pub max_coeff_bit: i32,
    pub qz_level: i16,
    pub len_bits: u32,
}

impl StreamHeader {

    pub fn write(&self, bytes: &mut Vec<u8>) {
        self.max_coeff_bit.write(bytes).expect("in-memory write failed");
        self.qz_level.write(bytes).expect("in-memory write failed");
        self.len_bits.write(bytes).expect("in-memory write failed");
    }

    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::WrongLength);
        }

        let mut read = bytes;
        let max_coeff_bit = i32::read(&mut read)?;
        let qz_level = i16::read(&mut read)?;
        let len_bits = u32::read(&mut read)?;

        // double-precision magnitudes cannot reach exponents anywhere near
        // the integer range, so anything out there is a corrupt header
        if max_coeff_bit != i32::MIN && !(-1100..=1100).contains(&max_coeff_bit) {
            return Err(Error::invalid("coefficient magnitude header out of range"));
        }

        Ok(StreamHeader { max_coeff_bit, qz_level, len_bits })
    }
}


/// Probe the total byte length of a coded stream, header included,
/// without consuming or validating the payload.
pub fn stream_size(bytes: &[u8]) -> Result<u64> {
    let header = StreamHeader::read(bytes)?;
    Ok(HEADER_SIZE as u64 + (header.len_bits as u64 + 7) / 8)
}


/// Raised by the encoder internals once the bit budget is reached.
/// Unwinds the sorting recursion without being an error.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BudgetMet;

pub(crate) type PassResult = std::result::Result<(), BudgetMet>;


/// Common garbage markers of the significance lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SetKind {

    /// A regular partitioning set.
    Sorting,

    /// The 2D residual region that still holds undecomposed detail bands.
    Residual,

    /// Processed and waiting for compaction.
    Garbage,
}
