
//! The 3D coder. The volume is decomposed by octant partitioning, with the
//! initial skeleton mirroring the transform structure so every partition
//! level lines up with a subband boundary. Single coefficients live in their
//! own pixel list instead of the set lists.

use smallvec::SmallVec;

use crate::error::{Error, Result, UnitResult};
use crate::math::{approx_detail_len, num_levels, num_partitions, Dims};

use super::storage::Storage;
use super::{Params, PassResult, SetKind};


/// Marks a pixel-list entry as consumed until the next compaction.
const TOMBSTONE: usize = usize::MAX;

/// A cuboidal region of the coefficient volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Set3 {
    x: u32,
    y: u32,
    z: u32,
    len_x: u32,
    len_y: u32,
    len_z: u32,

    /// Total number of partitions producing this set, over all axes.
    /// Also its list index: deeper levels are examined first.
    level: u16,

    kind: SetKind,
}

impl Set3 {
    fn is_empty(&self) -> bool {
        self.len_x == 0 || self.len_y == 0 || self.len_z == 0
    }

    fn is_pixel(&self) -> bool {
        self.len_x == 1 && self.len_y == 1 && self.len_z == 1
    }

    fn contains(&self, point: (u32, u32, u32)) -> bool {
        let (x, y, z) = point;
        x >= self.x && x < self.x + self.len_x
            && y >= self.y && y < self.y + self.len_y
            && z >= self.z && z < self.z + self.len_z
    }
}


/// Encodes and decodes the embedded stream of a 3D coefficient volume.
#[derive(Debug, Clone, Default)]
pub struct Speck3d {
    store: Storage,
    lis: Vec<Vec<Set3>>,
    lip: Vec<usize>,
}

impl Speck3d {

    /// A coder without contents.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of the coefficients to encode. Resets the coder.
    pub fn set_coefficients(&mut self, coeff: Vec<f64>, dims: Dims) -> UnitResult {
        self.store.set_coefficients(coeff, dims)
    }

    /// Transfer the coefficients out. After `decode`, this is the
    /// signed reconstruction.
    pub fn release_coefficients(&mut self) -> Vec<f64> {
        self.store.release_coefficients()
    }

    /// Set the termination parameters for the next encode.
    pub fn set_params(&mut self, params: Params) {
        self.store.set_params(params);
    }

    /// Provide the value range of the original data for fixed-PSNR mode.
    pub fn set_data_range(&mut self, range: f64) {
        self.store.set_data_range(range);
    }

    /// Borrow the stream assembled by the last `encode`.
    pub fn encoded_stream(&self) -> &[u8] {
        self.store.encoded_stream()
    }

    /// Transfer the assembled stream out.
    pub fn release_stream(&mut self) -> Vec<u8> {
        self.store.release_stream()
    }

    /// The signed magnitudes a decoder of this stream would see.
    /// Only maintained while encoding in point-wise-error mode.
    pub fn release_quantized(&mut self) -> Vec<f64> {
        self.store.release_quantized()
    }

    /// Adopt an encoded stream and the volume dimensions for decoding.
    pub fn parse_stream(&mut self, bytes: &[u8], dims: Dims) -> UnitResult {
        self.store.parse_stream(bytes, dims)
    }

    /// Encode the owned coefficients into an embedded stream.
    pub fn encode(&mut self) -> UnitResult {
        let mode = self.store.begin_encode()?;

        if self.store.max_coeff_bit == i32::MIN {
            return self.store.finish_stream();
        }

        self.initialize_lists();
        let lowest = self.store.lowest_plane(mode);

        loop {
            if self.sorting_pass_encode().is_err() { break; }
            if self.store.refinement_pass_encode().is_err() { break; }
            if self.store.bit_plane <= lowest { break; }

            self.store.next_plane();
            self.compact_lists();
        }

        self.store.finish_stream()
    }

    /// Decode a parsed stream into coefficients. A truncated payload
    /// terminates cleanly with a valid lower-quality reconstruction.
    pub fn decode(&mut self) -> UnitResult {
        self.store.begin_decode()?;

        if self.store.max_coeff_bit == i32::MIN {
            return Ok(());
        }

        self.initialize_lists();
        let floor = self.store.decode_floor();

        let outcome = loop {
            match self.sorting_pass_decode() {
                Err(error) => break Err(error),
                Ok(()) => {}
            }

            match self.store.refinement_pass_decode() {
                Err(error) => break Err(error),
                Ok(()) => {}
            }

            if self.store.bit_plane <= floor { break Ok(()); }

            self.store.next_plane();
            self.compact_lists();
        };

        match outcome {
            Ok(()) | Err(Error::Exhausted) => {
                self.store.apply_signs();
                Ok(())
            }
            Err(error) => Err(error),
        }
    }


    // -- list management, shared by both directions --

    /// Build the initial sets by unfolding the volume the same way the
    /// transform did: shared octant levels first, then the surplus plane or
    /// depth levels of the wavelet-packet variant.
    fn initialize_lists(&mut self) {
        let dims = self.store.dims;

        for list in &mut self.lis { list.clear(); }
        let capacity = num_partitions(dims.x().max(dims.y()).max(dims.z())) + 1;
        if self.lis.len() < capacity { self.lis.resize(capacity, Vec::new()); }
        self.lip.clear();

        let levels_xy = num_levels(dims.x().min(dims.y()));
        let levels_z = num_levels(dims.z());

        let mut remaining = Set3 {
            x: 0, y: 0, z: 0,
            len_x: dims.x() as u32,
            len_y: dims.y() as u32,
            len_z: dims.z() as u32,
            level: 0,
            kind: SetKind::Sorting,
        };

        let mut step = 0;
        while step < levels_xy.min(levels_z) {
            let children = Self::partition_xyz(&remaining);
            remaining = children[0];
            for child in children.iter().skip(1).filter(|child| !child.is_empty()) {
                self.push_set(*child);
            }
            step += 1;
        }

        while step < levels_xy {
            let children = Self::partition_xy(&remaining);
            remaining = children[0];
            for child in children.iter().skip(1).filter(|child| !child.is_empty()) {
                self.push_set(*child);
            }
            step += 1;
        }

        while step < levels_z {
            let children = Self::partition_z(&remaining);
            remaining = children[0];
            if !children[1].is_empty() {
                self.push_set(children[1]);
            }
            step += 1;
        }

        self.push_set(remaining);
    }

    fn push_set(&mut self, set: Set3) -> (usize, usize) {
        let level = set.level as usize;
        if level >= self.lis.len() {
            self.lis.resize(level + 1, Vec::new());
        }

        self.lis[level].push(set);
        (level, self.lis[level].len() - 1)
    }

    fn compact_lists(&mut self) {
        for list in &mut self.lis {
            list.retain(|set| set.kind != SetKind::Garbage);
        }

        self.lip.retain(|&location| location != TOMBSTONE);
    }

    /// Octant split, low halves first, `x` varying fastest, then `y`, then `z`.
    /// Axes of length one produce empty high halves.
    fn partition_xyz(set: &Set3) -> [Set3; 8] {
        let (low_x, high_x) = approx_detail_len(set.len_x as usize);
        let (low_y, high_y) = approx_detail_len(set.len_y as usize);
        let (low_z, high_z) = approx_detail_len(set.len_z as usize);
        let level = set.level + 1;
        let kind = SetKind::Sorting;

        let mut children = [Set3 { x: 0, y: 0, z: 0, len_x: 0, len_y: 0, len_z: 0, level, kind }; 8];
        let mut position = 0;

        for select_z in 0..2 {
            for select_y in 0..2 {
                for select_x in 0..2 {
                    children[position] = Set3 {
                        x: if select_x == 0 { set.x } else { set.x + low_x as u32 },
                        y: if select_y == 0 { set.y } else { set.y + low_y as u32 },
                        z: if select_z == 0 { set.z } else { set.z + low_z as u32 },
                        len_x: if select_x == 0 { low_x as u32 } else { high_x as u32 },
                        len_y: if select_y == 0 { low_y as u32 } else { high_y as u32 },
                        len_z: if select_z == 0 { low_z as u32 } else { high_z as u32 },
                        level,
                        kind,
                    };
                    position += 1;
                }
            }
        }

        children
    }

    /// Quadrant split within each plane, leaving `z` whole.
    fn partition_xy(set: &Set3) -> [Set3; 4] {
        let (low_x, high_x) = approx_detail_len(set.len_x as usize);
        let (low_y, high_y) = approx_detail_len(set.len_y as usize);
        let level = set.level + 1;
        let kind = SetKind::Sorting;

        let mut children = [Set3 { x: 0, y: 0, z: 0, len_x: 0, len_y: 0, len_z: 0, level, kind }; 4];
        let mut position = 0;

        for select_y in 0..2 {
            for select_x in 0..2 {
                children[position] = Set3 {
                    x: if select_x == 0 { set.x } else { set.x + low_x as u32 },
                    y: if select_y == 0 { set.y } else { set.y + low_y as u32 },
                    z: set.z,
                    len_x: if select_x == 0 { low_x as u32 } else { high_x as u32 },
                    len_y: if select_y == 0 { low_y as u32 } else { high_y as u32 },
                    len_z: set.len_z,
                    level,
                    kind,
                };
                position += 1;
            }
        }

        children
    }

    /// Binary split along `z` only.
    fn partition_z(set: &Set3) -> [Set3; 2] {
        let (low_z, high_z) = approx_detail_len(set.len_z as usize);
        let level = set.level + 1;
        let kind = SetKind::Sorting;

        [
            Set3 { len_z: low_z as u32, level, ..*set },
            Set3 { z: set.z + low_z as u32, len_z: high_z as u32, level, kind, ..*set },
        ]
    }


    // -- encoding --

    /// Scan the region in memory order; the first coefficient reaching the
    /// threshold becomes the witness that steers the child partitions.
    fn significant_at(&self, set: &Set3) -> Option<(u32, u32, u32)> {
        let dims = self.store.dims;
        let threshold = self.store.threshold;

        for z in set.z..set.z + set.len_z {
            for y in set.y..set.y + set.len_y {
                let start = dims.index_of(set.x as usize, y as usize, z as usize);
                let row = &self.store.coeff[start..start + set.len_x as usize];

                if let Some(offset) = row.iter().position(|magnitude| *magnitude >= threshold) {
                    return Some((set.x + offset as u32, y, z));
                }
            }
        }

        None
    }

    fn sorting_pass_encode(&mut self) -> PassResult {
        for index in 0..self.lip.len() {
            if self.lip[index] != TOMBSTONE {
                let mut newly_significant = 0;
                self.process_pixel_encode(index, true, &mut newly_significant)?;
            }
        }

        for level in (0..self.lis.len()).rev() {
            for index in 0..self.lis[level].len() {
                if self.lis[level][index].kind != SetKind::Garbage {
                    let mut newly_significant = 0;
                    self.process_set_encode(level, index, None, true, &mut newly_significant)?;
                }
            }
        }

        Ok(())
    }

    fn process_pixel_encode(
        &mut self, lip_index: usize,
        output: bool, newly_significant: &mut usize,
    ) -> PassResult {
        let location = self.lip[lip_index];
        let significant = self.store.coeff[location] >= self.store.threshold;

        if output { self.store.emit(significant)?; }
        else { debug_assert!(significant, "an inferred pixel must be significant"); }

        if significant {
            *newly_significant += 1;
            self.store.emit(self.store.sign[location])?;
            self.store.lsp_new.push(location);
            if self.store.track_quant {
                self.store.quant[location] = self.store.threshold * 1.5;
            }

            self.lip[lip_index] = TOMBSTONE;
        }

        Ok(())
    }

    fn process_set_encode(
        &mut self, level: usize, index: usize,
        hint: Option<(u32, u32, u32)>,
        output: bool, newly_significant: &mut usize,
    ) -> PassResult {
        let set = self.lis[level][index];
        let witness = match hint {
            Some(point) => Some(point),
            None => self.significant_at(&set),
        };

        let significant = witness.is_some();
        if output { self.store.emit(significant)?; }
        else { debug_assert!(significant, "an inferred set must be significant"); }

        if significant {
            *newly_significant += 1;

            if set.is_pixel() {
                // only reachable for degenerate volumes that start as a pixel
                let location = self.store.dims
                    .index_of(set.x as usize, set.y as usize, set.z as usize);
                self.store.emit(self.store.sign[location])?;
                self.store.lsp_new.push(location);
                if self.store.track_quant {
                    self.store.quant[location] = self.store.threshold * 1.5;
                }
            }
            else {
                let witness = witness.expect("significant sets always carry a witness");
                self.code_set_encode(level, index, witness)?;
            }

            self.lis[level][index].kind = SetKind::Garbage;
        }

        Ok(())
    }

    fn code_set_encode(
        &mut self, level: usize, index: usize,
        witness: (u32, u32, u32),
    ) -> PassResult {
        let set = self.lis[level][index];
        let children: SmallVec<[Set3; 8]> = Self::partition_xyz(&set)
            .iter().copied()
            .filter(|child| !child.is_empty())
            .collect();

        let total = children.len();
        let mut newly_significant = 0;

        for (position, child) in children.into_iter().enumerate() {
            let inferred = position + 1 == total && newly_significant == 0;
            let hint = if child.contains(witness) { Some(witness) } else { None };

            if child.is_pixel() {
                let location = self.store.dims
                    .index_of(child.x as usize, child.y as usize, child.z as usize);
                self.lip.push(location);
                let lip_index = self.lip.len() - 1;
                self.process_pixel_encode(lip_index, !inferred, &mut newly_significant)?;
            }
            else {
                let (child_level, child_index) = self.push_set(child);
                self.process_set_encode(
                    child_level, child_index, hint, !inferred, &mut newly_significant,
                )?;
            }
        }

        Ok(())
    }


    // -- decoding, mirroring every emitted bit --

    fn sorting_pass_decode(&mut self) -> Result<()> {
        for index in 0..self.lip.len() {
            if self.lip[index] != TOMBSTONE {
                let mut newly_significant = 0;
                self.process_pixel_decode(index, true, &mut newly_significant)?;
            }
        }

        for level in (0..self.lis.len()).rev() {
            for index in 0..self.lis[level].len() {
                if self.lis[level][index].kind != SetKind::Garbage {
                    let mut newly_significant = 0;
                    self.process_set_decode(level, index, true, &mut newly_significant)?;
                }
            }
        }

        Ok(())
    }

    fn process_pixel_decode(
        &mut self, lip_index: usize,
        input: bool, newly_significant: &mut usize,
    ) -> Result<()> {
        let significant = if input { self.store.bits.get_bit()? } else { true };

        if significant {
            *newly_significant += 1;
            let location = self.lip[lip_index];

            let positive = self.store.bits.get_bit()?;
            self.store.sign[location] = positive;
            self.store.coeff[location] = self.store.threshold * 1.5;
            self.store.lsp_new.push(location);

            self.lip[lip_index] = TOMBSTONE;
        }

        Ok(())
    }

    fn process_set_decode(
        &mut self, level: usize, index: usize,
        input: bool, newly_significant: &mut usize,
    ) -> Result<()> {
        let significant = if input { self.store.bits.get_bit()? } else { true };

        if significant {
            *newly_significant += 1;
            let set = self.lis[level][index];

            if set.is_pixel() {
                let location = self.store.dims
                    .index_of(set.x as usize, set.y as usize, set.z as usize);
                let positive = self.store.bits.get_bit()?;
                self.store.sign[location] = positive;
                self.store.coeff[location] = self.store.threshold * 1.5;
                self.store.lsp_new.push(location);
            }
            else {
                self.code_set_decode(level, index)?;
            }

            self.lis[level][index].kind = SetKind::Garbage;
        }

        Ok(())
    }

    fn code_set_decode(&mut self, level: usize, index: usize) -> Result<()> {
        let set = self.lis[level][index];
        let children: SmallVec<[Set3; 8]> = Self::partition_xyz(&set)
            .iter().copied()
            .filter(|child| !child.is_empty())
            .collect();

        let total = children.len();
        let mut newly_significant = 0;

        for (position, child) in children.into_iter().enumerate() {
            let inferred = position + 1 == total && newly_significant == 0;

            if child.is_pixel() {
                let location = self.store.dims
                    .index_of(child.x as usize, child.y as usize, child.z as usize);
                self.lip.push(location);
                let lip_index = self.lip.len() - 1;
                self.process_pixel_decode(lip_index, !inferred, &mut newly_significant)?;
            }
            else {
                let (child_level, child_index) = self.push_set(child);
                self.process_set_decode(child_level, child_index, !inferred, &mut newly_significant)?;
            }
        }

        Ok(())
    }
}


#[cfg(test)]
mod test {
    use super::*;

    fn test_volume(dims: Dims) -> Vec<f64> {
        (0..dims.count())
            .map(|index| {
                let position = index as f64;
                (position * 0.029).sin() * 2000.0 + (position * 0.61).cos() * 15.0
            })
            .collect()
    }

    fn roundtrip(dims: Dims, params: Params) -> (Vec<f64>, Vec<f64>) {
        let original = test_volume(dims);

        let mut encoder = Speck3d::new();
        encoder.set_coefficients(original.clone(), dims).unwrap();
        encoder.set_params(params);
        encoder.encode().unwrap();
        let stream = encoder.release_stream();

        let mut decoder = Speck3d::new();
        decoder.parse_stream(&stream, dims).unwrap();
        decoder.decode().unwrap();
        (original, decoder.release_coefficients())
    }

    #[test]
    fn deep_roundtrip_bounds_every_coefficient(){
        let params = Params { qz_level: -18, ..Params::default() };
        let (original, decoded) = roundtrip(Dims(16, 16, 16), params);

        for (restored, original) in decoded.iter().zip(&original) {
            assert!((restored - original).abs() < (-17.0_f64).exp2());
        }
    }

    #[test]
    fn lopsided_volume_roundtrip(){
        // differing level counts exercise the plane and depth partitions
        let params = Params { qz_level: -14, ..Params::default() };
        for &dims in &[Dims(32, 32, 4), Dims(17, 17, 17), Dims(9, 31, 64)] {
            let (original, decoded) = roundtrip(dims, params);

            for (restored, original) in decoded.iter().zip(&original) {
                assert!((restored - original).abs() < (-13.0_f64).exp2());
            }
        }
    }

    #[test]
    fn budget_caps_the_stream(){
        let dims = Dims(32, 32, 8);
        let params = Params { budget_bits: 8192, ..Params::default() };

        let mut encoder = Speck3d::new();
        encoder.set_coefficients(test_volume(dims), dims).unwrap();
        encoder.set_params(params);
        encoder.encode().unwrap();

        let stream = encoder.release_stream();
        assert!(stream.len() <= super::super::HEADER_SIZE + 8192 / 8 + 1);

        let mut decoder = Speck3d::new();
        decoder.parse_stream(&stream, dims).unwrap();
        decoder.decode().unwrap();
        assert_eq!(decoder.release_coefficients().len(), dims.count());
    }

    #[test]
    fn prefix_decode_improves_with_length(){
        let dims = Dims(16, 16, 16);
        let original = test_volume(dims);

        let mut encoder = Speck3d::new();
        encoder.set_coefficients(original.clone(), dims).unwrap();
        encoder.set_params(Params { qz_level: -20, ..Params::default() });
        encoder.encode().unwrap();
        let stream = encoder.release_stream();

        let mut previous_error = f64::MAX;
        for &keep in &[stream.len() / 6, stream.len() / 2, stream.len()] {
            let mut decoder = Speck3d::new();
            decoder.parse_stream(&stream[..keep], dims).unwrap();
            decoder.decode().unwrap();
            let decoded = decoder.release_coefficients();

            let error: f64 = decoded.iter().zip(&original)
                .map(|(restored, original)| (restored - original) * (restored - original))
                .sum();

            assert!(error <= previous_error, "longer prefix must not decode worse");
            previous_error = error;
        }
    }

    #[test]
    fn quantized_view_matches_decoder(){
        let dims = Dims(16, 16, 8);
        let original = test_volume(dims);

        let mut encoder = Speck3d::new();
        encoder.set_coefficients(original.clone(), dims).unwrap();
        encoder.set_params(Params { target_pwe: 0.125, ..Params::default() });
        encoder.encode().unwrap();
        let stream = encoder.release_stream();
        let quantized = encoder.release_quantized();

        let mut decoder = Speck3d::new();
        decoder.parse_stream(&stream, dims).unwrap();
        decoder.decode().unwrap();
        let decoded = decoder.release_coefficients();

        for (mirrored, decoded) in quantized.iter().zip(&decoded) {
            assert_eq!(mirrored, decoded, "encoder must mirror the decoder exactly");
        }
    }
}
