//! Error type definitions and convenient conversions.

use std::convert::TryFrom;
use std::fmt;

/// A result that, if ok, contains something, or otherwise contains `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// A result that, if ok, contains nothing, and otherwise contains `Error`.
pub type UnitResult = Result<()>;

pub use std::io::Error as IoError;
pub use std::io::Result as IoResult;

/// All possible error states of this crate.
/// `Exhausted` deserves a note: it reports that a decoder ran out of bits
/// in the middle of a symbol. For a deliberately truncated stream that is the
/// expected end of the data, and the decoders treat it as a clean stop that
/// leaves a valid lower-quality reconstruction behind.
#[derive(Debug)]
pub enum Error {

    /// A parameter is outside of its documented range,
    /// or parameters were supplied in an impossible order.
    InvalidParam(String),

    /// The length of a sample buffer does not equal the product of its dimensions.
    WrongDims,

    /// A declared stream length disagrees with the bytes that are actually present.
    WrongLength,

    /// The version byte of a stream disagrees with the version of this library.
    VersionMismatch,

    /// A 2D decompressor was fed a 3D stream, or the other way around.
    SliceVolumeMismatch,

    /// The stream announces an entropy post-pass that this build does not apply.
    ZstdMismatch,

    /// A decoder ran out of bits in the middle of a symbol. Recoverable:
    /// everything decoded so far forms a valid prefix reconstruction.
    Exhausted,

    /// A chunk produced no output at all.
    EmptyStream,

    /// An internal invariant was violated. The message names it.
    Invalid(String),

    /// File access from one of the convenience functions failed.
    Io(IoError),
}

impl Error {

    /// Create an error of the variant `Invalid`.
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::Invalid(message.into())
    }

    /// Create an error of the variant `InvalidParam`.
    pub fn invalid_param(message: impl Into<String>) -> Self {
        Error::InvalidParam(message.into())
    }

    /// Whether this is the clean end of a truncated stream.
    pub fn is_exhausted(&self) -> bool {
        match self { Error::Exhausted => true, _ => false }
    }
}

/// Enable using the `?` operator on `std::io::Result`.
impl From<IoError> for Error {
    fn from(error: IoError) -> Self {
        Error::Io(error)
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidParam(message) => write!(formatter, "invalid parameter: {}", message),
            Error::WrongDims => write!(formatter, "buffer length does not match its dimensions"),
            Error::WrongLength => write!(formatter, "declared stream length does not match the data"),
            Error::VersionMismatch => write!(formatter, "the stream was written by an incompatible library version"),
            Error::SliceVolumeMismatch => write!(formatter, "2D/3D mismatch between stream and decompressor"),
            Error::ZstdMismatch => write!(formatter, "the stream requires an entropy post-pass this build does not apply"),
            Error::Exhausted => write!(formatter, "the stream ended in the middle of a symbol"),
            Error::EmptyStream => write!(formatter, "a chunk produced an empty stream"),
            Error::Invalid(message) => write!(formatter, "invalid state: {}", message),
            Error::Io(error) => write!(formatter, "io error: {}", error),
        }
    }
}

/// Panics on overflow. Use only where the value is already known to fit.
pub fn u64_to_usize(value: u64) -> usize {
    usize::try_from(value).expect("(u64 as usize) overflowed")
}

/// Panics on overflow. Use only where the value is already known to fit.
pub fn u32_to_usize(value: u32) -> usize {
    usize::try_from(value).expect("(u32 as usize) overflowed")
}

/// Returns an `Error::Invalid` if the value does not fit into 32 bits.
pub fn usize_to_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::invalid("number does not fit into 32 bits"))
}

/// Panics on overflow. Use only where the value is already known to fit.
pub fn usize_to_u64(value: usize) -> u64 {
    u64::try_from(value).expect("(usize as u64) overflowed")
}
