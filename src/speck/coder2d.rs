
//! The 2D coder. The plane is decomposed into a quadtree of sorting sets
//! plus one residual region that lazily unfolds the finer detail bands,
//! one transform level at a time.

use smallvec::SmallVec;

use crate::error::{Error, Result, UnitResult};
use crate::math::{approx_detail_len, approx_len, num_levels, num_partitions, Dims};
use crate::subband;

use super::storage::Storage;
use super::{Params, PassResult, SetKind};


/// A rectangular region of the coefficient plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Set2 {
    x: u32,
    y: u32,
    len_x: u32,
    len_y: u32,

    /// How many partitions produced this set. Also its list index:
    /// deeper levels hold smaller sets, which are examined first.
    level: u16,

    kind: SetKind,
}

impl Set2 {
    fn is_empty(&self) -> bool { self.len_x == 0 || self.len_y == 0 }
    fn is_pixel(&self) -> bool { self.len_x == 1 && self.len_y == 1 }
}

impl Default for Set2 {
    fn default() -> Self {
        Set2 { x: 0, y: 0, len_x: 0, len_y: 0, level: 0, kind: SetKind::Garbage }
    }
}


/// Encodes and decodes the embedded stream of a 2D coefficient plane.
#[derive(Debug, Clone, Default)]
pub struct Speck2d {
    store: Storage,
    lis: Vec<Vec<Set2>>,
    residual: Set2,
}

impl Speck2d {

    /// A coder without contents.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of the coefficients to encode. Resets the coder.
    pub fn set_coefficients(&mut self, coeff: Vec<f64>, dims: Dims) -> UnitResult {
        if !dims.is_2d() {
            return Err(Error::WrongDims);
        }

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

    /// Adopt an encoded stream and the plane dimensions for decoding.
    pub fn parse_stream(&mut self, bytes: &[u8], dims: Dims) -> UnitResult {
        if !dims.is_2d() {
            return Err(Error::WrongDims);
        }

        self.store.parse_stream(bytes, dims)
    }

    /// Encode the owned coefficients into an embedded stream.
    pub fn encode(&mut self) -> UnitResult {
        let mode = self.store.begin_encode()?;

        // an all-zero buffer encodes as a bare header
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
            return Ok(()); // the plane is entirely zero
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

    fn initialize_lists(&mut self) {
        let dims = self.store.dims;
        let levels = num_levels(dims.x().min(dims.y()));
        let root = subband::list_2d(dims, levels)[0];

        for list in &mut self.lis { list.clear(); }
        let capacity = num_partitions(dims.x().max(dims.y())) + 1;
        if self.lis.len() < capacity { self.lis.resize(capacity, Vec::new()); }

        self.push_set(Set2 {
            x: 0,
            y: 0,
            len_x: root.size.x() as u32,
            len_y: root.size.y() as u32,
            level: levels as u16,
            kind: SetKind::Sorting,
        });

        self.residual = Set2 {
            x: root.size.x() as u32,
            y: root.size.y() as u32,
            len_x: dims.x() as u32,
            len_y: dims.y() as u32,
            level: levels as u16,
            kind: if levels == 0 { SetKind::Garbage } else { SetKind::Residual },
        };
    }

    fn push_set(&mut self, set: Set2) -> (usize, usize) {
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
    }

    /// Quadrant split, low halves first, `x` varying fastest.
    fn partition(set: &Set2) -> [Set2; 4] {
        let (low_x, high_x) = approx_detail_len(set.len_x as usize);
        let (low_y, high_y) = approx_detail_len(set.len_y as usize);
        let (low_x, high_x) = (low_x as u32, high_x as u32);
        let (low_y, high_y) = (low_y as u32, high_y as u32);
        let level = set.level + 1;
        let kind = SetKind::Sorting;

        [
            Set2 { x: set.x, y: set.y, len_x: low_x, len_y: low_y, level, kind },
            Set2 { x: set.x + low_x, y: set.y, len_x: high_x, len_y: low_y, level, kind },
            Set2 { x: set.x, y: set.y + low_y, len_x: low_x, len_y: high_y, level, kind },
            Set2 { x: set.x + low_x, y: set.y + low_y, len_x: high_x, len_y: high_y, level, kind },
        ]
    }

    /// Unfold one transform level of the residual region: the three detail
    /// bands completing the next coarser frontier become sorting sets, the
    /// region keeps everything beyond them. Returns the three bands.
    fn partition_residual(&mut self) -> SmallVec<[Set2; 3]> {
        let dims = self.store.dims;
        let remaining = self.residual.level as usize;
        debug_assert!(remaining >= 1, "residual region partitioned too often");

        let (start_x, start_y) = (self.residual.x, self.residual.y);
        let next_x = approx_len(dims.x(), remaining - 1) as u32;
        let next_y = approx_len(dims.y(), remaining - 1) as u32;
        let level = self.residual.level;
        let kind = SetKind::Sorting;

        let mut bands = SmallVec::new();
        bands.push(Set2 { x: start_x, y: 0, len_x: next_x - start_x, len_y: start_y, level, kind });
        bands.push(Set2 { x: 0, y: start_y, len_x: start_x, len_y: next_y - start_y, level, kind });
        bands.push(Set2 {
            x: start_x, y: start_y,
            len_x: next_x - start_x, len_y: next_y - start_y,
            level, kind,
        });

        self.residual.x = next_x;
        self.residual.y = next_y;
        self.residual.level -= 1;
        if next_x as usize == dims.x() && next_y as usize == dims.y() {
            self.residual.kind = SetKind::Garbage;
        }

        bands
    }


    // -- encoding --

    fn region_significant(&self, x: u32, y: u32, len_x: u32, len_y: u32) -> bool {
        let stride = self.store.dims.x();
        let threshold = self.store.threshold;

        (y..y + len_y).any(|row| {
            let start = row as usize * stride + x as usize;
            self.store.coeff[start..start + len_x as usize]
                .iter()
                .any(|magnitude| *magnitude >= threshold)
        })
    }

    fn residual_significant(&self) -> bool {
        let dims = self.store.dims;
        let (frontier_x, frontier_y) = (self.residual.x, self.residual.y);

        self.region_significant(frontier_x, 0, dims.x() as u32 - frontier_x, frontier_y)
            || self.region_significant(0, frontier_y, dims.x() as u32, dims.y() as u32 - frontier_y)
    }

    fn sorting_pass_encode(&mut self) -> PassResult {
        for level in (0..self.lis.len()).rev() {
            for index in 0..self.lis[level].len() {
                if self.lis[level][index].kind != SetKind::Garbage {
                    let mut newly_significant = 0;
                    self.process_set_encode(level, index, true, &mut newly_significant)?;
                }
            }
        }

        self.process_residual_encode(true)
    }

    fn process_set_encode(
        &mut self, level: usize, index: usize,
        output: bool, newly_significant: &mut usize,
    ) -> PassResult {
        let set = self.lis[level][index];
        let significant = self.region_significant(set.x, set.y, set.len_x, set.len_y);

        if output { self.store.emit(significant)?; }
        else { debug_assert!(significant, "an inferred set must be significant"); }

        if significant {
            *newly_significant += 1;

            if set.is_pixel() {
                let location = self.store.dims.index_of(set.x as usize, set.y as usize, 0);
                self.store.emit(self.store.sign[location])?;
                self.store.lsp_new.push(location);
                if self.store.track_quant {
                    self.store.quant[location] = self.store.threshold * 1.5;
                }
            }
            else {
                self.code_set_encode(level, index)?;
            }

            self.lis[level][index].kind = SetKind::Garbage;
        }

        Ok(())
    }

    fn code_set_encode(&mut self, level: usize, index: usize) -> PassResult {
        let set = self.lis[level][index];
        let children: SmallVec<[Set2; 4]> = Self::partition(&set)
            .iter().copied()
            .filter(|child| !child.is_empty())
            .collect();

        let total = children.len();
        let mut newly_significant = 0;

        for (position, child) in children.into_iter().enumerate() {
            // when every other child is insignificant,
            // the last one must hold the significant coefficient
            let inferred = position + 1 == total && newly_significant == 0;
            let (child_level, child_index) = self.push_set(child);
            self.process_set_encode(child_level, child_index, !inferred, &mut newly_significant)?;
        }

        Ok(())
    }

    fn process_residual_encode(&mut self, output: bool) -> PassResult {
        if self.residual.kind == SetKind::Garbage {
            return Ok(());
        }

        let significant = self.residual_significant();
        if output { self.store.emit(significant)?; }
        else { debug_assert!(significant, "an inferred region must be significant"); }

        if significant {
            self.code_residual_encode()?;
        }

        Ok(())
    }

    fn code_residual_encode(&mut self) -> PassResult {
        let bands = self.partition_residual();
        let remains = self.residual.kind != SetKind::Garbage;

        let non_empty: SmallVec<[Set2; 3]> =
            bands.into_iter().filter(|band| !band.is_empty()).collect();

        let total = non_empty.len();
        let mut newly_significant = 0;

        for (position, band) in non_empty.into_iter().enumerate() {
            let inferred = !remains && position + 1 == total && newly_significant == 0;
            let (band_level, band_index) = self.push_set(band);
            self.process_set_encode(band_level, band_index, !inferred, &mut newly_significant)?;
        }

        if remains {
            // if no band was significant, the rest of the region must be
            self.process_residual_encode(newly_significant > 0)?;
        }

        Ok(())
    }


    // -- decoding, mirroring every emitted bit --

    fn sorting_pass_decode(&mut self) -> Result<()> {
        for level in (0..self.lis.len()).rev() {
            for index in 0..self.lis[level].len() {
                if self.lis[level][index].kind != SetKind::Garbage {
                    let mut newly_significant = 0;
                    self.process_set_decode(level, index, true, &mut newly_significant)?;
                }
            }
        }

        self.process_residual_decode(true)
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
                let location = self.store.dims.index_of(set.x as usize, set.y as usize, 0);
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
        let children: SmallVec<[Set2; 4]> = Self::partition(&set)
            .iter().copied()
            .filter(|child| !child.is_empty())
            .collect();

        let total = children.len();
        let mut newly_significant = 0;

        for (position, child) in children.into_iter().enumerate() {
            let inferred = position + 1 == total && newly_significant == 0;
            let (child_level, child_index) = self.push_set(child);
            self.process_set_decode(child_level, child_index, !inferred, &mut newly_significant)?;
        }

        Ok(())
    }

    fn process_residual_decode(&mut self, input: bool) -> Result<()> {
        if self.residual.kind == SetKind::Garbage {
            return Ok(());
        }

        let significant = if input { self.store.bits.get_bit()? } else { true };
        if significant {
            self.code_residual_decode()?;
        }

        Ok(())
    }

    fn code_residual_decode(&mut self) -> Result<()> {
        let bands = self.partition_residual();
        let remains = self.residual.kind != SetKind::Garbage;

        let non_empty: SmallVec<[Set2; 3]> =
            bands.into_iter().filter(|band| !band.is_empty()).collect();

        let total = non_empty.len();
        let mut newly_significant = 0;

        for (position, band) in non_empty.into_iter().enumerate() {
            let inferred = !remains && position + 1 == total && newly_significant == 0;
            let (band_level, band_index) = self.push_set(band);
            self.process_set_decode(band_level, band_index, !inferred, &mut newly_significant)?;
        }

        if remains {
            self.process_residual_decode(newly_significant > 0)?;
        }

        Ok(())
    }
}
