
//! Pure functions over a compressed chunked bitstream: probing the header,
//! locating the chunk payloads, and cutting every chunk down to a byte
//! prefix for progressive access.

use bit_field::BitField;

use crate::conditioner;
use crate::error::{u32_to_usize, usize_to_u32, Error, Result};
use crate::io::Data;
use crate::math::Dims;
use crate::speck;
use crate::volume::{chunk_volume, HEADER_MAGIC};


// meaning of the flag bits in byte 1 of a chunked stream
pub(crate) const FLAG_ENTROPY_CODED: usize = 0;
pub(crate) const FLAG_IS_3D: usize = 1;
pub(crate) const FLAG_IS_PORTION: usize = 2;
pub(crate) const FLAG_ORIG_IS_F32: usize = 3;

/// The smallest per-chunk prefix progressive truncation keeps: the
/// conditioner header plus the coder header, so a cut chunk always parses.
/// Chunks shorter than this (constant fields) are kept whole.
pub const MIN_CHUNK_PREFIX: usize = conditioner::HEADER_SIZE + speck::HEADER_SIZE;


/// Everything the header of a chunked stream declares,
/// plus the chunk payload locations computed from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {

    /// The version byte the stream leads with.
    pub version: u8,

    /// Whether an entropy post-pass was applied to the payload.
    pub entropy_coded: bool,

    /// Whether this is a chunked volume stream; always true here.
    pub is_3d: bool,

    /// Whether the stream is a progressively truncated portion.
    pub is_portion: bool,

    /// Whether the original samples were `f32`.
    pub orig_is_float: bool,

    /// Dimensions of the whole volume.
    pub vol_dims: Dims,

    /// Preferred chunk dimensions the encoder was configured with.
    pub chunk_dims: Dims,

    /// Byte length of the header, including the chunk table.
    pub header_len: usize,

    /// Total byte length of header plus all chunk payloads.
    pub stream_len: usize,

    /// Absolute byte offset and length of every chunk payload.
    pub chunk_offsets: Vec<(usize, usize)>,
}


/// Byte length of the full header of a chunked stream, derived from its
/// fixed leading part.
pub fn header_len(bytes: &[u8]) -> Result<usize> {
    let (_, _, vol_dims, chunk_dims) = parse_magic(bytes)?;
    let num_chunks = chunk_volume(vol_dims, chunk_dims).len();
    Ok(HEADER_MAGIC + 4 * num_chunks)
}

/// Parse the header of a chunked stream and locate every chunk payload.
pub fn stream_info(bytes: &[u8]) -> Result<StreamInfo> {
    let (version, flags, vol_dims, chunk_dims) = parse_magic(bytes)?;
    let num_chunks = chunk_volume(vol_dims, chunk_dims).len();
    let header_len = HEADER_MAGIC + 4 * num_chunks;

    if bytes.len() < header_len {
        return Err(Error::WrongLength);
    }

    let mut read = &bytes[HEADER_MAGIC..header_len];
    let mut chunk_offsets = Vec::with_capacity(num_chunks);
    let mut offset = header_len;

    for _ in 0..num_chunks {
        let len = u32_to_usize(u32::read(&mut read)?);
        chunk_offsets.push((offset, len));
        offset += len;
    }

    Ok(StreamInfo {
        version,
        entropy_coded: flags.get_bit(FLAG_ENTROPY_CODED),
        is_3d: flags.get_bit(FLAG_IS_3D),
        is_portion: flags.get_bit(FLAG_IS_PORTION),
        orig_is_float: flags.get_bit(FLAG_ORIG_IS_F32),
        vol_dims,
        chunk_dims,
        header_len,
        stream_len: offset,
        chunk_offsets,
    })
}

fn parse_magic(bytes: &[u8]) -> Result<(u8, u8, Dims, Dims)> {
    if bytes.len() < HEADER_MAGIC {
        return Err(Error::WrongLength);
    }

    let version = bytes[0];
    let flags = bytes[1];

    let mut read = &bytes[2..];
    let mut extents = [0_usize; 6];
    for extent in &mut extents {
        *extent = u32_to_usize(u32::read(&mut read)?);
    }

    let vol_dims = Dims(extents[0], extents[1], extents[2]);
    let chunk_dims = Dims(extents[3], extents[4], extents[5]);
    if vol_dims.is_empty() || chunk_dims.is_empty() {
        return Err(Error::invalid("a stream with empty dimensions"));
    }

    Ok((version, flags, vol_dims, chunk_dims))
}

/// Cut every chunk down to the first `ceil(chunk_vals * bpp / 8)` bytes
/// (never less than `MIN_CHUNK_PREFIX`, never more than the chunk has),
/// rewrite the chunk table, and mark the result as a portion.
///
/// The output is a valid stream; feeding it back in with a coarser rate
/// yields byte-identical results to truncating the original directly.
pub fn truncate(bytes: &[u8], bits_per_sample: f64) -> Result<Vec<u8>> {
    if !(bits_per_sample > 0.0) || bits_per_sample > 64.0 {
        return Err(Error::invalid_param("bits per sample must be in (0, 64]"));
    }

    let info = stream_info(bytes)?;
    if info.entropy_coded {
        return Err(Error::ZstdMismatch);
    }
    if info.stream_len > bytes.len() {
        return Err(Error::WrongLength);
    }

    let regions = chunk_volume(info.vol_dims, info.chunk_dims);

    let keep: Vec<usize> = regions.iter()
        .zip(&info.chunk_offsets)
        .map(|(region, &(_, len))| {
            let wanted = (region.count() as f64 * bits_per_sample / 8.0).ceil() as usize;
            len.min(wanted.max(MIN_CHUNK_PREFIX))
        })
        .collect();

    let mut output = Vec::with_capacity(info.header_len + keep.iter().sum::<usize>());
    output.extend_from_slice(&bytes[..2]);
    output[1].set_bit(FLAG_IS_PORTION, true);
    output.extend_from_slice(&bytes[2..HEADER_MAGIC]);

    for &len in &keep {
        usize_to_u32(len)?.write(&mut output)?;
    }

    for (&(offset, _), &len) in info.chunk_offsets.iter().zip(&keep) {
        output.extend_from_slice(&bytes[offset..offset + len]);
    }

    Ok(output)
}

/// Read a chunked stream from a file and truncate it to the given rate.
pub fn progressive_read(path: impl AsRef<std::path::Path>, bits_per_sample: f64) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path)?;
    truncate(&bytes, bits_per_sample)
}
