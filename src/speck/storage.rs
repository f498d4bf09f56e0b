
//! State and passes shared between the 2D and the 3D coder:
//! coefficient ownership, sign capture, the refinement pass,
//! termination arithmetic, and stream assembly.

use crate::bits::BitBuffer;
use crate::error::{usize_to_u32, Error, Result, UnitResult};
use crate::math::{floor_log2, Dims};

use super::{
    BudgetMet, Mode, Params, PassResult, StreamHeader,
    HEADER_SIZE, MAX_PLANES, MIN_PLANE, PWE_HEADROOM,
};


/// The power of two for a bit plane, exact for all planes in use.
pub(crate) fn plane_threshold(plane: i32) -> f64 {
    (plane as f64).exp2()
}

fn ceil_log2(value: f64) -> i32 {
    if value <= 0.0 { i32::MIN } else { value.log2().ceil() as i32 }
}


/// Everything a set-partitioning coder owns besides its partition lists.
#[derive(Debug, Clone, Default)]
pub(crate) struct Storage {
    pub dims: Dims,

    /// Magnitudes while encoding (reduced as planes are emitted),
    /// the reconstruction while decoding.
    pub coeff: Vec<f64>,

    /// One captured sign per coefficient, true for non-negative.
    pub sign: Vec<bool>,

    /// Decoder-mirror magnitudes, maintained only in point-wise-error mode
    /// so the compressor can reproduce the decoder's view for outlier
    /// detection without a second decoding pass.
    pub quant: Vec<f64>,
    pub track_quant: bool,

    pub bits: BitBuffer,
    pub budget: usize,

    pub threshold: f64,
    pub bit_plane: i32,
    pub max_coeff_bit: i32,

    pub lsp_new: Vec<usize>,
    pub lsp_old: Vec<usize>,

    pub params: Params,
    pub data_range: f64,

    pub encoded: Vec<u8>,
}

impl Storage {

    /// Take ownership of a coefficient buffer. Resets the coder.
    pub fn set_coefficients(&mut self, coeff: Vec<f64>, dims: Dims) -> UnitResult {
        if coeff.len() != dims.count() || dims.is_empty() {
            return Err(Error::WrongDims);
        }

        self.coeff = coeff;
        self.dims = dims;
        Ok(())
    }

    /// Transfer the coefficient buffer out. After decoding, this is the
    /// signed reconstruction.
    pub fn release_coefficients(&mut self) -> Vec<f64> {
        std::mem::replace(&mut self.coeff, Vec::new())
    }

    /// Set the termination parameters for the next encode.
    pub fn set_params(&mut self, params: Params) {
        self.params = params;
    }

    /// Provide the value range of the original data,
    /// required by the fixed-PSNR termination estimate.
    pub fn set_data_range(&mut self, range: f64) {
        self.data_range = range;
    }

    /// Borrow the assembled stream of the last encode.
    pub fn encoded_stream(&self) -> &[u8] {
        &self.encoded
    }

    /// Transfer the assembled stream out.
    pub fn release_stream(&mut self) -> Vec<u8> {
        std::mem::replace(&mut self.encoded, Vec::new())
    }

    /// The signed magnitudes a decoder of this stream would reconstruct.
    /// Only available after encoding in point-wise-error mode.
    pub fn release_quantized(&mut self) -> Vec<f64> {
        let mut quantized = std::mem::replace(&mut self.quant, Vec::new());
        for (value, &positive) in quantized.iter_mut().zip(&self.sign) {
            if !positive { *value = -*value; }
        }
        quantized
    }

    /// Capture signs, switch to magnitudes, find the top bit plane.
    /// Returns the active mode, or the top plane sentinel for an all-zero
    /// buffer which needs no payload at all.
    pub fn begin_encode(&mut self) -> Result<Mode> {
        let mode = self.params.mode()?;

        if self.coeff.is_empty() || self.coeff.len() != self.dims.count() {
            return Err(Error::invalid("no coefficients to encode"));
        }

        self.bits.clear();
        self.encoded.clear();
        self.lsp_new.clear();
        self.lsp_old.clear();
        self.budget = self.params.budget_bits;

        self.sign.clear();
        self.sign.extend(self.coeff.iter().map(|value| *value >= 0.0));
        for value in self.coeff.iter_mut() { *value = value.abs(); }

        self.track_quant = mode == Mode::FixedPwe;
        self.quant.clear();
        if self.track_quant { self.quant.resize(self.coeff.len(), 0.0); }

        let max_magnitude = self.coeff.iter().cloned().fold(0.0_f64, f64::max);
        self.max_coeff_bit =
            if max_magnitude == 0.0 { i32::MIN }
            else { floor_log2(max_magnitude) };

        // the all-zero sentinel never reaches the plane loop
        self.bit_plane = self.max_coeff_bit;
        self.threshold = plane_threshold(self.bit_plane);
        Ok(mode)
    }

    /// Allocate the reconstruction buffers for decoding.
    pub fn begin_decode(&mut self) -> UnitResult {
        let count = self.dims.count();
        if count == 0 {
            return Err(Error::WrongDims);
        }

        self.coeff.clear();
        self.coeff.resize(count, 0.0);
        self.sign.clear();
        self.sign.resize(count, true);
        self.lsp_new.clear();
        self.lsp_old.clear();

        self.bit_plane = self.max_coeff_bit;
        self.threshold = plane_threshold(self.bit_plane);
        Ok(())
    }

    /// The last plane the encoder will emit under the active mode.
    pub fn lowest_plane(&self, mode: Mode) -> i32 {
        let target = match mode {
            Mode::FixedRate => MIN_PLANE,
            Mode::FixedQz => self.params.qz_level,

            // terminal threshold derived from the data range; the worst-case
            // coefficient error it permits keeps the PSNR above the target
            Mode::FixedPsnr => ceil_log2(
                self.data_range * (10.0_f64).powf(-self.params.target_psnr / 20.0)
            ),

            Mode::FixedPwe => ceil_log2(self.params.target_pwe / PWE_HEADROOM),
        };

        target.max(self.max_coeff_bit - (MAX_PLANES - 1)).max(MIN_PLANE)
    }

    /// The plane below which a decoder gives up waiting for more bits.
    pub fn decode_floor(&self) -> i32 {
        (self.max_coeff_bit - (MAX_PLANES - 1)).max(MIN_PLANE)
    }

    /// Step both endpoints to the next finer plane.
    pub fn next_plane(&mut self) {
        self.bit_plane -= 1;
        self.threshold *= 0.5;
    }

    /// Append one bit, signalling once the budget is reached.
    pub fn emit(&mut self, bit: bool) -> PassResult {
        self.bits.put_bit(bit);
        if self.bits.write_position() >= self.budget { Err(BudgetMet) } else { Ok(()) }
    }

    /// Emit one more magnitude bit for every previously significant
    /// coefficient, and fold the newly significant ones into the list.
    pub fn refinement_pass_encode(&mut self) -> PassResult {
        for index in 0..self.lsp_old.len() {
            let location = self.lsp_old[index];
            let bit = self.coeff[location] >= self.threshold;
            self.emit(bit)?;

            if bit {
                self.coeff[location] -= self.threshold;
                if self.track_quant { self.quant[location] += self.threshold * 0.5; }
            }
            else if self.track_quant {
                self.quant[location] -= self.threshold * 0.5;
            }
        }

        for &location in &self.lsp_new {
            self.coeff[location] -= self.threshold;
        }

        self.lsp_old.append(&mut self.lsp_new);
        Ok(())
    }

    /// Decoder mirror of `refinement_pass_encode`.
    pub fn refinement_pass_decode(&mut self) -> Result<()> {
        for index in 0..self.lsp_old.len() {
            let location = self.lsp_old[index];
            let adjustment = self.threshold * 0.5;

            if self.bits.get_bit()? { self.coeff[location] += adjustment; }
            else { self.coeff[location] -= adjustment; }
        }

        self.lsp_old.append(&mut self.lsp_new);
        Ok(())
    }

    /// Re-attach the captured signs to the decoded magnitudes.
    pub fn apply_signs(&mut self) {
        for (value, &positive) in self.coeff.iter_mut().zip(&self.sign) {
            if !positive { *value = -*value; }
        }
    }

    /// Prepend the header and pack the payload bits into the final stream.
    pub fn finish_stream(&mut self) -> UnitResult {
        let len_bits = usize_to_u32(self.bits.len())?;
        let qz_level =
            if self.params.qz_level == i32::MIN { 0 }
            else { self.params.qz_level as i16 };

        let header = StreamHeader {
            max_coeff_bit: self.max_coeff_bit,
            qz_level,
            len_bits,
        };

        self.encoded.clear();
        self.encoded.reserve(HEADER_SIZE + self.bits.as_bytes().len());
        header.write(&mut self.encoded);

        self.bits.flush();
        self.encoded.extend_from_slice(self.bits.as_bytes());
        Ok(())
    }

    /// Adopt an encoded stream for decoding. A payload shorter than the
    /// header declares is accepted; reads simply exhaust earlier.
    pub fn parse_stream(&mut self, bytes: &[u8], dims: Dims) -> UnitResult {
        if dims.is_empty() {
            return Err(Error::WrongDims);
        }

        let header = StreamHeader::read(bytes)?;
        let payload = &bytes[HEADER_SIZE..];
        let valid_bits = (header.len_bits as usize).min(payload.len() * 8);

        self.bits = BitBuffer::from_bytes(payload.to_vec(), valid_bits);
        self.max_coeff_bit = header.max_coeff_bit;
        self.dims = dims;
        Ok(())
    }
}
