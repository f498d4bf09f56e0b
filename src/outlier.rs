
//! The outlier corrector: a bit-plane coder over a sparse list of
//! `(location, error)` pairs, used to enforce a strict per-sample error
//! bound after the main coder has done its best.
//!
//! The index space `[0, total_len)` is halved recursively like a 1D
//! version of the set coder. Iteration runs one plane past the tolerance,
//! so every recorded outlier is discovered and refined to well within the
//! bound. Tolerance and starting threshold travel through the header as
//! `f32`; both endpoints run the plane loop on exactly those rounded
//! values, which keeps them in lockstep.

use crate::bits::BitBuffer;
use crate::error::{usize_to_u32, Error, Result, UnitResult};
use crate::io::Data;
use crate::math::num_partitions;


/// Byte length of the header that precedes the coded payload:
/// `total_len: u64`, `tolerance: f32`, `max_threshold: f32`,
/// `num_outliers: u32`, little-endian.
pub const HEADER_SIZE: usize = 20;


/// A sample whose reconstruction error exceeds the tolerance,
/// and by how much.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Outlier {

    /// Linear index of the sample inside the chunk.
    pub location: u64,

    /// The signed reconstruction error at this sample.
    pub error: f64,
}

impl Outlier {

    /// A new outlier at the given location.
    pub fn new(location: u64, error: f64) -> Self {
        Outlier { location, error }
    }
}


/// An interval of the linear index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Set1 {
    start: u64,
    length: u64,
    level: u16,
    garbage: bool,
}

impl Set1 {
    fn is_pixel(&self) -> bool { self.length == 1 }
}


/// Encodes and decodes the correction stream for a list of outliers.
#[derive(Debug, Clone, Default)]
pub struct OutlierCoder {
    total_len: u64,
    tolerance: f64,

    // the list being encoded, sorted by location
    outliers: Vec<Outlier>,
    magnitudes: Vec<f64>,
    signs: Vec<bool>,

    // the list being decoded
    decoded_locations: Vec<u64>,
    decoded_magnitudes: Vec<f64>,
    decoded_signs: Vec<bool>,

    lis: Vec<Vec<Set1>>,
    lsp_new: Vec<usize>,
    lsp_old: Vec<usize>,

    bits: BitBuffer,
    threshold: f64,
    encoded: Vec<u8>,

    // decode state taken from the header
    coded_tolerance: f32,
    max_threshold: f32,
    num_outliers: u32,
}

impl OutlierCoder {

    /// A coder without contents.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the length of the index space the outlier locations live in.
    pub fn set_length(&mut self, total_len: u64) {
        self.total_len = total_len;
    }

    /// Set the error tolerance. Every supplied outlier must carry an error
    /// of at least this magnitude, and it must be positive.
    pub fn set_tolerance(&mut self, tolerance: f64) {
        self.tolerance = tolerance;
    }

    /// Add a single outlier. Existing ones are unaffected;
    /// each location must occur at most once.
    pub fn add_outlier(&mut self, outlier: Outlier) {
        self.outliers.push(outlier);
    }

    /// Replace the outlier list with a copy of the provided one.
    pub fn copy_outliers(&mut self, outliers: &[Outlier]) {
        self.outliers.clear();
        self.outliers.extend_from_slice(outliers);
    }

    /// Replace the outlier list, taking ownership.
    pub fn take_outliers(&mut self, outliers: Vec<Outlier>) {
        self.outliers = outliers;
    }

    /// The outliers recovered by the last `decode`, sorted by location.
    pub fn decoded_outliers(&self) -> &[Outlier] {
        &self.outliers
    }

    /// Transfer the recovered outliers out.
    pub fn release_outliers(&mut self) -> Vec<Outlier> {
        std::mem::replace(&mut self.outliers, Vec::new())
    }

    /// Borrow the stream assembled by the last `encode`.
    pub fn encoded_stream(&self) -> &[u8] {
        &self.encoded
    }

    /// Transfer the assembled stream out.
    pub fn release_stream(&mut self) -> Vec<u8> {
        std::mem::replace(&mut self.encoded, Vec::new())
    }

    /// Encode the owned outlier list.
    pub fn encode(&mut self) -> UnitResult {
        if self.total_len == 0 || self.outliers.is_empty() {
            return Err(Error::invalid("no outliers to encode"));
        }
        if !(self.tolerance > 0.0) {
            return Err(Error::invalid_param("the outlier tolerance must be positive"));
        }

        self.outliers.sort_unstable_by_key(|outlier| outlier.location);
        self.magnitudes.clear();
        self.magnitudes.extend(self.outliers.iter().map(|outlier| outlier.error.abs()));
        self.signs.clear();
        self.signs.extend(self.outliers.iter().map(|outlier| outlier.error >= 0.0));

        debug_assert!(
            self.magnitudes.iter().all(|magnitude| *magnitude >= self.tolerance),
            "every outlier must exceed the tolerance"
        );

        // both endpoints iterate on the f32-rounded values from the header;
        // the tolerance is rounded down so the guarantee never weakens
        self.coded_tolerance = round_down(self.tolerance);
        let max_magnitude = self.magnitudes.iter().cloned().fold(0.0_f64, f64::max);
        self.max_threshold = max_magnitude as f32;
        self.num_outliers = usize_to_u32(self.outliers.len())?;

        if !(self.coded_tolerance > 0.0) || !self.max_threshold.is_finite() {
            return Err(Error::invalid_param("the tolerance or errors exceed single precision"));
        }

        self.bits.clear();
        self.initialize_lists();
        self.lsp_new.clear();
        self.lsp_old.clear();

        self.threshold = self.max_threshold as f64;
        let tolerance = self.coded_tolerance as f64;

        loop {
            self.sorting_pass_encode();
            self.refinement_pass_encode();

            // run one plane past the tolerance: the final refinement leaves
            // every discovered error at well under half the bound
            if self.threshold < tolerance { break; }
            self.threshold *= 0.5;
            self.compact_lists();
        }

        self.finish_stream();
        Ok(())
    }

    /// Adopt an encoded stream for decoding.
    pub fn parse_stream(&mut self, bytes: &[u8]) -> UnitResult {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::WrongLength);
        }

        let mut read = bytes;
        self.total_len = u64::read(&mut read)?;
        self.coded_tolerance = f32::read(&mut read)?;
        self.max_threshold = f32::read(&mut read)?;
        self.num_outliers = u32::read(&mut read)?;

        if self.total_len == 0 || self.num_outliers == 0
            || !(self.coded_tolerance > 0.0)
            || !(self.max_threshold > 0.0) || !self.max_threshold.is_finite()
        {
            return Err(Error::invalid("corrupt outlier stream header"));
        }

        let payload = bytes[HEADER_SIZE..].to_vec();
        let len_bits = payload.len() * 8;
        self.bits = BitBuffer::from_bytes(payload, len_bits);
        Ok(())
    }

    /// Decode the parsed stream, recovering every outlier.
    pub fn decode(&mut self) -> UnitResult {
        self.decoded_locations.clear();
        self.decoded_magnitudes.clear();
        self.decoded_signs.clear();
        self.lsp_new.clear();
        self.lsp_old.clear();
        self.initialize_lists();

        self.threshold = self.max_threshold as f64;
        let tolerance = self.coded_tolerance as f64;

        loop {
            self.sorting_pass_decode()?;
            self.refinement_pass_decode()?;

            if self.threshold < tolerance { break; }
            self.threshold *= 0.5;
            self.compact_lists();
        }

        if self.decoded_locations.len() != self.num_outliers as usize {
            return Err(Error::invalid("outlier stream decoded to a different count"));
        }

        self.outliers = self.decoded_locations.iter()
            .zip(&self.decoded_magnitudes)
            .zip(&self.decoded_signs)
            .map(|((&location, &magnitude), &positive)| Outlier {
                location,
                error: if positive { magnitude } else { -magnitude },
            })
            .collect();

        self.outliers.sort_unstable_by_key(|outlier| outlier.location);
        Ok(())
    }


    // -- list management, shared by both directions --

    fn initialize_lists(&mut self) {
        for list in &mut self.lis { list.clear(); }
        let capacity = num_partitions(self.total_len as usize) + 1;
        if self.lis.len() < capacity { self.lis.resize(capacity, Vec::new()); }

        self.lis[0].push(Set1 {
            start: 0,
            length: self.total_len,
            level: 0,
            garbage: false,
        });
    }

    fn push_set(&mut self, set: Set1) -> (usize, usize) {
        let level = set.level as usize;
        if level >= self.lis.len() {
            self.lis.resize(level + 1, Vec::new());
        }

        self.lis[level].push(set);
        (level, self.lis[level].len() - 1)
    }

    fn compact_lists(&mut self) {
        for list in &mut self.lis {
            list.retain(|set| !set.garbage);
        }
    }

    /// Halve an interval, the longer part first.
    fn partition(set: &Set1) -> [Set1; 2] {
        let low = set.length - set.length / 2;
        let level = set.level + 1;

        [
            Set1 { start: set.start, length: low, level, garbage: false },
            Set1 { start: set.start + low, length: set.length - low, level, garbage: false },
        ]
    }


    // -- encoding --

    /// Whether any not-yet-discovered outlier in the interval reaches the
    /// threshold. Discovered ones were partitioned away and cannot be here.
    fn interval_significant(&self, set: &Set1) -> bool {
        let from = self.outliers.partition_point(|outlier| outlier.location < set.start);
        let to = self.outliers.partition_point(|outlier| outlier.location < set.start + set.length);
        self.magnitudes[from..to].iter().any(|magnitude| *magnitude >= self.threshold)
    }

    /// The outlier index at exactly this location, if any.
    fn outlier_at(&self, location: u64) -> Option<usize> {
        let index = self.outliers.partition_point(|outlier| outlier.location < location);
        match self.outliers.get(index) {
            Some(outlier) if outlier.location == location => Some(index),
            _ => None,
        }
    }

    fn sorting_pass_encode(&mut self) {
        for level in (0..self.lis.len()).rev() {
            for index in 0..self.lis[level].len() {
                if !self.lis[level][index].garbage {
                    let mut newly_significant = 0;
                    self.process_set_encode(level, index, true, &mut newly_significant);
                }
            }
        }
    }

    fn process_set_encode(
        &mut self, level: usize, index: usize,
        output: bool, newly_significant: &mut usize,
    ) {
        let set = self.lis[level][index];
        let significant = self.interval_significant(&set);

        if output { self.bits.put_bit(significant); }
        else { debug_assert!(significant, "an inferred interval must be significant"); }

        if significant {
            *newly_significant += 1;

            if set.is_pixel() {
                let outlier = self.outlier_at(set.start)
                    .expect("a significant pixel interval must hold an outlier");
                self.bits.put_bit(self.signs[outlier]);
                self.lsp_new.push(outlier);
            }
            else {
                self.code_set_encode(level, index);
            }

            self.lis[level][index].garbage = true;
        }
    }

    fn code_set_encode(&mut self, level: usize, index: usize) {
        let set = self.lis[level][index];
        let children = Self::partition(&set);

        let mut newly_significant = 0;
        for (position, child) in children.iter().enumerate() {
            let inferred = position + 1 == children.len() && newly_significant == 0;
            let (child_level, child_index) = self.push_set(*child);
            self.process_set_encode(child_level, child_index, !inferred, &mut newly_significant);
        }
    }

    /// Refine the running remainder of every discovered outlier
    /// by another bit of magnitude.
    fn refinement_pass_encode(&mut self) {
        for index in 0..self.lsp_old.len() {
            let outlier = self.lsp_old[index];
            let bit = self.magnitudes[outlier] >= self.threshold;
            self.bits.put_bit(bit);
            if bit { self.magnitudes[outlier] -= self.threshold; }
        }

        for &outlier in &self.lsp_new {
            self.magnitudes[outlier] -= self.threshold;
        }

        self.lsp_old.append(&mut self.lsp_new);
    }

    fn finish_stream(&mut self) {
        self.encoded.clear();
        self.total_len.write(&mut self.encoded).expect("in-memory write failed");
        self.coded_tolerance.write(&mut self.encoded).expect("in-memory write failed");
        self.max_threshold.write(&mut self.encoded).expect("in-memory write failed");
        self.num_outliers.write(&mut self.encoded).expect("in-memory write failed");

        self.bits.flush();
        self.encoded.extend_from_slice(self.bits.as_bytes());
    }


    // -- decoding --

    fn sorting_pass_decode(&mut self) -> Result<()> {
        for level in (0..self.lis.len()).rev() {
            for index in 0..self.lis[level].len() {
                if !self.lis[level][index].garbage {
                    let mut newly_significant = 0;
                    self.process_set_decode(level, index, true, &mut newly_significant)?;
                }
            }
        }

        Ok(())
    }

    fn process_set_decode(
        &mut self, level: usize, index: usize,
        input: bool, newly_significant: &mut usize,
    ) -> Result<()> {
        let significant = if input { self.bits.get_bit()? } else { true };

        if significant {
            *newly_significant += 1;
            let set = self.lis[level][index];

            if set.is_pixel() {
                let positive = self.bits.get_bit()?;
                self.decoded_locations.push(set.start);
                self.decoded_magnitudes.push(self.threshold * 1.5);
                self.decoded_signs.push(positive);
                self.lsp_new.push(self.decoded_magnitudes.len() - 1);
            }
            else {
                self.code_set_decode(level, index)?;
            }

            self.lis[level][index].garbage = true;
        }

        Ok(())
    }

    fn code_set_decode(&mut self, level: usize, index: usize) -> Result<()> {
        let set = self.lis[level][index];
        let children = Self::partition(&set);

        let mut newly_significant = 0;
        for (position, child) in children.iter().enumerate() {
            let inferred = position + 1 == children.len() && newly_significant == 0;
            let (child_level, child_index) = self.push_set(*child);
            self.process_set_decode(child_level, child_index, !inferred, &mut newly_significant)?;
        }

        Ok(())
    }

    fn refinement_pass_decode(&mut self) -> Result<()> {
        for index in 0..self.lsp_old.len() {
            let outlier = self.lsp_old[index];
            let adjustment = self.threshold * 0.5;

            if self.bits.get_bit()? { self.decoded_magnitudes[outlier] += adjustment; }
            else { self.decoded_magnitudes[outlier] -= adjustment; }
        }

        self.lsp_old.append(&mut self.lsp_new);
        Ok(())
    }
}


fn round_down(value: f64) -> f32 {
    let rounded = value as f32;
    if rounded as f64 > value { f32::from_bits(rounded.to_bits() - 1) } else { rounded }
}


#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip(total_len: u64, tolerance: f64, outliers: &[Outlier]) -> Vec<Outlier> {
        let mut encoder = OutlierCoder::new();
        encoder.set_length(total_len);
        encoder.set_tolerance(tolerance);
        encoder.copy_outliers(outliers);
        encoder.encode().unwrap();
        let stream = encoder.release_stream();
        assert!(stream.len() >= HEADER_SIZE);

        let mut decoder = OutlierCoder::new();
        decoder.parse_stream(&stream).unwrap();
        decoder.decode().unwrap();
        decoder.release_outliers()
    }

    #[test]
    fn every_outlier_is_recovered_within_half_tolerance(){
        let tolerance = 0.01;
        let outliers = [
            Outlier::new(3, 0.0417),
            Outlier::new(190, -0.78),
            Outlier::new(191, 0.0100001),
            Outlier::new(1077, -0.0123),
            Outlier::new(65535, 12.75),
        ];

        let decoded = roundtrip(65536, tolerance, &outliers);
        assert_eq!(decoded.len(), outliers.len());

        for (decoded, original) in decoded.iter().zip(&outliers) {
            assert_eq!(decoded.location, original.location);
            assert!(
                (decoded.error - original.error).abs() < tolerance,
                "correction for {} too coarse: {} vs {}",
                original.location, decoded.error, original.error
            );
        }
    }

    #[test]
    fn single_outlier(){
        let decoded = roundtrip(100, 0.5, &[Outlier::new(42, -1.75)]);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].location, 42);
        assert!((decoded[0].error - (-1.75)).abs() < 0.5);
    }

    #[test]
    fn dense_cluster_of_outliers(){
        let tolerance = 1e-6;
        let outliers: Vec<Outlier> = (64..96)
            .map(|location| Outlier::new(location, (location as f64 - 80.0) * 1e-5 + 2e-5))
            .filter(|outlier| outlier.error.abs() >= tolerance)
            .collect();

        let decoded = roundtrip(1 << 20, tolerance, &outliers);
        assert_eq!(decoded.len(), outliers.len());

        for (decoded, original) in decoded.iter().zip(&outliers) {
            assert_eq!(decoded.location, original.location);
            assert!((decoded.error - original.error).abs() < tolerance);
        }
    }

    #[test]
    fn unsorted_input_is_sorted_by_the_encoder(){
        let outliers = [
            Outlier::new(900, 1.0),
            Outlier::new(7, -2.0),
            Outlier::new(300, 1.5),
        ];

        let decoded = roundtrip(1000, 0.25, &outliers);
        let locations: Vec<u64> = decoded.iter().map(|outlier| outlier.location).collect();
        assert_eq!(locations, vec![7, 300, 900]);
    }

    #[test]
    fn rejects_missing_inputs(){
        let mut encoder = OutlierCoder::new();
        assert!(encoder.encode().is_err());

        encoder.set_length(100);
        encoder.add_outlier(Outlier::new(1, 1.0));
        assert!(encoder.encode().is_err()); // tolerance still missing
    }

    #[test]
    fn tolerance_rounding_never_rises(){
        for &value in &[0.1, 1.5e-7, 0.45, 1e-30, 7.0] {
            let rounded = round_down(value);
            assert!(rounded as f64 <= value);
            assert!(rounded > 0.0);
        }
    }
}
