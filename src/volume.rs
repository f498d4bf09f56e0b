
//! Compressing whole volumes: the volume is cut into cuboidal chunks,
//! every chunk runs through its own independent pipeline (in parallel when
//! the `rayon` feature is active), and the resulting streams are glued
//! behind one header that locates them. Chunks never share mutable state,
//! so any thread count produces byte-identical output.

use crate::buffer::{Sample, SampleBuffer};
use crate::codec::{ChunkCompressor, ChunkDecompressor, Targets, VERSION_MAJOR};
use crate::conditioner::Settings;
use crate::error::{usize_to_u32, Error, Result, UnitResult};
use crate::io::Data;
use crate::math::Dims;
use crate::stream::{self, StreamInfo};

use bit_field::BitField;


/// Byte length of the fixed part of a chunked volume header:
/// `version(1) · flags(1) · vol_dims 3×u32 · chunk_dims 3×u32`.
/// One `u32` chunk length per chunk follows.
pub const HEADER_MAGIC: usize = 26;


/// One cuboidal piece of a volume, in volume coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRegion {

    /// Position of the first sample of this chunk.
    pub start: Dims,

    /// Extent of this chunk along each axis.
    pub size: Dims,
}

impl ChunkRegion {

    /// Number of samples in this chunk.
    pub fn count(&self) -> usize {
        self.size.count()
    }
}


/// Cut a volume into chunks of approximately the preferred dimensions,
/// iterating lexicographically with `x` fastest. A remainder of up to half
/// a chunk length merges into the last chunk of its axis; a larger
/// remainder becomes a chunk of its own. Encoder and decoder must agree
/// on this list exactly.
pub fn chunk_volume(vol_dims: Dims, chunk_dims: Dims) -> Vec<ChunkRegion> {
    let ticks_x = axis_ticks(vol_dims.x(), chunk_dims.x());
    let ticks_y = axis_ticks(vol_dims.y(), chunk_dims.y());
    let ticks_z = axis_ticks(vol_dims.z(), chunk_dims.z());

    let mut regions = Vec::with_capacity(
        (ticks_x.len() - 1) * (ticks_y.len() - 1) * (ticks_z.len() - 1)
    );

    for z in ticks_z.windows(2) {
        for y in ticks_y.windows(2) {
            for x in ticks_x.windows(2) {
                regions.push(ChunkRegion {
                    start: Dims(x[0], y[0], z[0]),
                    size: Dims(x[1] - x[0], y[1] - y[0], z[1] - z[0]),
                });
            }
        }
    }

    regions
}

/// The segment boundaries of one axis, including both ends.
fn axis_ticks(len: usize, chunk: usize) -> Vec<usize> {
    let mut segments = len / chunk;
    if len % chunk > chunk / 2 { segments += 1; }
    let segments = segments.max(1);

    let mut ticks: Vec<usize> = (0..segments).map(|segment| segment * chunk).collect();
    ticks.push(len);
    ticks
}

/// Copy a strided cuboid out of the volume into a contiguous buffer,
/// widening to `f64`.
pub fn gather_chunk<T: Sample>(samples: &[T], vol_dims: Dims, region: ChunkRegion) -> Vec<f64> {
    let mut chunk = Vec::with_capacity(region.count());

    for z in region.start.z()..region.start.z() + region.size.z() {
        for y in region.start.y()..region.start.y() + region.size.y() {
            let row = vol_dims.index_of(region.start.x(), y, z);
            chunk.extend(
                samples[row..row + region.size.x()].iter().map(|sample| sample.to_f64())
            );
        }
    }

    chunk
}

/// Copy a contiguous chunk back into its cuboid inside the volume.
pub fn scatter_chunk(volume: &mut [f64], vol_dims: Dims, chunk: &[f64], region: ChunkRegion) {
    debug_assert_eq!(chunk.len(), region.count());
    let mut source = 0;

    for z in region.start.z()..region.start.z() + region.size.z() {
        for y in region.start.y()..region.start.y() + region.size.y() {
            let row = vol_dims.index_of(region.start.x(), y, z);
            volume[row..row + region.size.x()]
                .copy_from_slice(&chunk[source..source + region.size.x()]);
            source += region.size.x();
        }
    }
}


/// Run one closure per chunk, on a worker pool when available.
/// Results come back in chunk order regardless of scheduling.
fn run_tasks<R: Send>(
    num_threads: usize, count: usize,
    task: impl Fn(usize) -> R + Sync,
) -> Vec<R> {
    #[cfg(feature = "rayon")]
    {
        let pool = rayon_core::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build();

        if let Ok(pool) = pool {
            let mut slots: Vec<Option<R>> = (0..count).map(|_| None).collect();

            pool.scope(|scope| {
                for (index, slot) in slots.iter_mut().enumerate() {
                    let task = &task;
                    scope.spawn(move |_| { *slot = Some(task(index)); });
                }
            });

            return slots.into_iter()
                .map(|slot| slot.expect("a chunk worker died without a result"))
                .collect();
        }
    }

    #[cfg(not(feature = "rayon"))]
    let _ = num_threads;

    (0..count).map(task).collect()
}


/// Compresses a volume chunk by chunk.
#[derive(Debug, Default)]
pub struct VolumeCompressor {
    vol_dims: Dims,
    chunk_dims: Dims,
    num_threads: usize,
    orig_is_float: bool,

    settings: Settings,
    targets: Targets,

    chunk_streams: Vec<Vec<u8>>,
    outlier_stats: Vec<(usize, usize)>,
}

impl VolumeCompressor {

    /// A compressor without dimensions. Set them before anything else.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the volume dimensions and the preferred chunk dimensions.
    /// Chunk dimensions are clamped into `1..=vol_dims`.
    pub fn set_dims_and_chunks(&mut self, vol_dims: Dims, chunk_dims: Dims) -> UnitResult {
        if vol_dims.is_empty() {
            return Err(Error::invalid_param("the volume dimensions must not be zero"));
        }

        self.vol_dims = vol_dims;
        self.chunk_dims = Dims(
            chunk_dims.x().clamp(1, vol_dims.x()),
            chunk_dims.y().clamp(1, vol_dims.y()),
            chunk_dims.z().clamp(1, vol_dims.z()),
        );
        Ok(())
    }

    /// How many worker threads to use, zero meaning all available cores.
    pub fn set_num_threads(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    /// Choose which conditioning operations may run in every chunk.
    pub fn toggle_conditioning(&mut self, settings: Settings) {
        self.settings = settings;
    }

    /// Target an overall bit rate; each chunk receives a share of the
    /// budget proportional to its sample count. Requires the dimensions
    /// to be set first, and clears the other targets.
    pub fn set_target_bpp(&mut self, bpp: f64) -> UnitResult {
        if self.vol_dims.is_empty() || self.chunk_dims.is_empty() {
            return Err(Error::invalid_param("set the dimensions before the bit rate"));
        }

        let num_chunks = chunk_volume(self.vol_dims, self.chunk_dims).len();
        let header_bytes = HEADER_MAGIC + 4 * num_chunks;
        self.targets.set_bpp(bpp, self.vol_dims.count(), header_bytes)
    }

    /// Target a peak signal-to-noise ratio for every chunk,
    /// clearing the other targets.
    pub fn set_target_psnr(&mut self, psnr: f64) -> UnitResult {
        self.targets.set_psnr(psnr)
    }

    /// Guarantee a maximum per-sample error across the whole volume,
    /// clearing the other targets.
    pub fn set_target_pwe(&mut self, pwe: f64) -> UnitResult {
        self.targets.set_pwe(pwe)
    }

    /// Terminate every chunk at a fixed quantization level.
    /// Superseded by `set_target_pwe`.
    pub fn set_target_qz_level(&mut self, level: i32) {
        self.targets.set_qz_level(level);
    }

    /// Total outlier count and correction bytes over all chunks.
    pub fn get_outlier_stats(&self) -> (usize, usize) {
        self.outlier_stats.iter().fold(
            (0, 0),
            |(count, bytes), &(chunk_count, chunk_bytes)| {
                (count + chunk_count, bytes + chunk_bytes)
            },
        )
    }

    /// Compress the volume. Chunks are gathered and encoded independently;
    /// the first failing chunk aborts the whole operation.
    pub fn compress<T: Sample + Sync>(&mut self, samples: &[T]) -> UnitResult {
        let vol_dims = self.vol_dims;
        if vol_dims.is_empty() {
            return Err(Error::invalid_param("dimensions were never set"));
        }
        if samples.len() != vol_dims.count() {
            return Err(Error::WrongDims);
        }

        self.orig_is_float = T::IS_NARROW;
        self.chunk_streams.clear();
        self.outlier_stats.clear();

        let regions = chunk_volume(vol_dims, self.chunk_dims);
        let header_bits = (HEADER_MAGIC + 4 * regions.len()) * 8;
        let total_vals = vol_dims.count();

        // validate the targets once, instead of once per worker
        self.targets.coder_params(0).mode()?;
        if self.targets.bit_budget != usize::MAX && self.targets.bit_budget <= header_bits {
            return Err(Error::invalid_param("the bit budget does not exceed the headers"));
        }

        let targets = self.targets;
        let settings = self.settings;
        let regions_ref = &regions;

        let results: Vec<Result<(Vec<u8>, (usize, usize))>> =
            run_tasks(self.num_threads, regions.len(), move |index| {
                let region = regions_ref[index];

                let mut compressor = ChunkCompressor::new();
                compressor.take_data(gather_chunk(samples, vol_dims, region), region.size)?;
                compressor.toggle_conditioning(settings);
                compressor.set_targets(
                    chunk_targets(targets, region.count(), total_vals, header_bits)
                );

                compressor.compress()?;
                Ok((compressor.release_encoded_bitstream(), compressor.get_outlier_stats()))
            });

        for result in results {
            let (stream, stats) = result?;
            if stream.is_empty() {
                return Err(Error::EmptyStream);
            }

            self.chunk_streams.push(stream);
            self.outlier_stats.push(stats);
        }

        Ok(())
    }

    /// Assemble the header and all chunk streams into one bitstream.
    pub fn get_encoded_bitstream(&self) -> Result<Vec<u8>> {
        if self.chunk_streams.is_empty() {
            return Err(Error::EmptyStream);
        }

        let payload: usize = self.chunk_streams.iter().map(Vec::len).sum();
        let mut bytes = Vec::with_capacity(HEADER_MAGIC + 4 * self.chunk_streams.len() + payload);

        bytes.push(VERSION_MAJOR);

        let mut flags = 0_u8;
        flags.set_bit(stream::FLAG_IS_3D, true);
        flags.set_bit(stream::FLAG_ORIG_IS_F32, self.orig_is_float);
        bytes.push(flags);

        for &extent in &[
            self.vol_dims.x(), self.vol_dims.y(), self.vol_dims.z(),
            self.chunk_dims.x(), self.chunk_dims.y(), self.chunk_dims.z(),
        ] {
            usize_to_u32(extent)?.write(&mut bytes)?;
        }

        for stream in &self.chunk_streams {
            usize_to_u32(stream.len())?.write(&mut bytes)?;
        }

        for stream in &self.chunk_streams {
            bytes.extend_from_slice(stream);
        }

        Ok(bytes)
    }
}


/// The per-chunk share of the volume targets.
fn chunk_targets(targets: Targets, chunk_vals: usize, total_vals: usize, header_bits: usize) -> Targets {
    if targets.bit_budget == usize::MAX {
        return targets;
    }

    let available = (targets.bit_budget - header_bits) as f64;
    let mut share = (chunk_vals as f64 / total_vals as f64 * available) as usize;
    share -= share % 8;

    let mut chunk_targets = targets;
    chunk_targets.bit_budget = share.max(8);
    chunk_targets
}


/// Decompresses the chunked streams of `VolumeCompressor`,
/// including progressively truncated ones.
#[derive(Debug, Default)]
pub struct VolumeDecompressor {
    info: Option<StreamInfo>,
    num_threads: usize,
    volume: SampleBuffer,
}

impl VolumeDecompressor {

    /// A decompressor without contents.
    pub fn new() -> Self {
        Self::default()
    }

    /// How many worker threads to use, zero meaning all available cores.
    pub fn set_num_threads(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    /// Validate the header and record the chunk table.
    /// The same bytes must later be passed to `decompress`.
    pub fn setup_decomp(&mut self, bytes: &[u8]) -> UnitResult {
        let info = stream::stream_info(bytes)?;

        if info.version != VERSION_MAJOR {
            return Err(Error::VersionMismatch);
        }
        if !info.is_3d {
            return Err(Error::SliceVolumeMismatch);
        }
        if info.entropy_coded {
            return Err(Error::ZstdMismatch);
        }
        if info.stream_len != bytes.len() {
            return Err(Error::WrongLength);
        }

        self.info = Some(info);
        Ok(())
    }

    /// Decode every chunk and scatter the reconstructions into the volume.
    pub fn decompress(&mut self, bytes: &[u8]) -> UnitResult {
        let info = self.info.as_ref()
            .ok_or_else(|| Error::invalid("decompress requires a prior setup"))?;

        if bytes.len() != info.stream_len {
            return Err(Error::WrongLength);
        }

        let vol_dims = info.vol_dims;
        let regions = chunk_volume(vol_dims, info.chunk_dims);
        if regions.len() != info.chunk_offsets.len() {
            return Err(Error::invalid("chunk table does not match the dimensions"));
        }

        let offsets_ref = &info.chunk_offsets;
        let regions_ref = &regions;

        let results: Vec<Result<Vec<f64>>> =
            run_tasks(self.num_threads, regions.len(), move |index| {
                let (offset, len) = offsets_ref[index];

                let mut decompressor = ChunkDecompressor::new();
                decompressor.set_dims(regions_ref[index].size)?;
                decompressor.use_bitstream(&bytes[offset..offset + len])?;
                decompressor.decompress()?;
                Ok(decompressor.release_data())
            });

        let mut volume = vec![0.0; vol_dims.count()];
        for (region, result) in regions.iter().zip(results) {
            let chunk = result?;
            if chunk.len() != region.count() {
                return Err(Error::invalid("a chunk decoded to the wrong size"));
            }

            scatter_chunk(&mut volume, vol_dims, &chunk, *region);
        }

        self.volume.take(volume, vol_dims)
    }

    /// Copy the reconstruction out at the requested precision.
    pub fn get_data<T: Sample>(&self) -> Vec<T> {
        self.volume.to_vec()
    }

    /// Borrow the reconstruction.
    pub fn view_data(&self) -> &[f64] {
        self.volume.view()
    }

    /// Transfer the reconstruction out.
    pub fn release_data(&mut self) -> Vec<f64> {
        self.volume.release()
    }

    /// The volume dimensions declared by the stream.
    pub fn get_dims(&self) -> Dims {
        self.info.as_ref().map(|info| info.vol_dims).unwrap_or_default()
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn chunks_cover_the_volume_once(){
        for &(vol, chunk) in &[
            (Dims(128, 128, 128), Dims(64, 70, 80)),
            (Dims(128, 128, 41), Dims(64, 64, 41)),
            (Dims(17, 17, 17), Dims(17, 17, 17)),
            (Dims(100, 7, 3), Dims(32, 32, 32)),
        ] {
            let regions = chunk_volume(vol, Dims(
                chunk.x().clamp(1, vol.x()),
                chunk.y().clamp(1, vol.y()),
                chunk.z().clamp(1, vol.z()),
            ));

            let mut covered = vec![0_u32; vol.count()];
            for region in &regions {
                for z in region.start.z()..region.start.z() + region.size.z() {
                    for y in region.start.y()..region.start.y() + region.size.y() {
                        for x in region.start.x()..region.start.x() + region.size.x() {
                            covered[vol.index_of(x, y, z)] += 1;
                        }
                    }
                }
            }

            assert!(covered.iter().all(|&count| count == 1));
        }
    }

    #[test]
    fn small_remainders_merge_into_the_last_chunk(){
        // 128 = 70 + 58: the 58 remainder exceeds half of 70, so it stands alone
        assert_eq!(axis_ticks(128, 70), vec![0, 70, 128]);

        // 100 = 64 + 36: 36 exceeds half of 64, so it stands alone as well
        assert_eq!(axis_ticks(100, 64), vec![0, 64, 100]);

        // 96 = 64 + 32: the remainder is exactly half, so it merges
        assert_eq!(axis_ticks(96, 64), vec![0, 96]);

        assert_eq!(axis_ticks(41, 41), vec![0, 41]);
        assert_eq!(axis_ticks(7, 32), vec![0, 7]);
    }

    #[test]
    fn gather_scatter_roundtrip(){
        let vol = Dims(8, 6, 4);
        let samples: Vec<f64> = (0..vol.count()).map(|index| index as f64).collect();

        let region = ChunkRegion { start: Dims(3, 2, 1), size: Dims(4, 3, 2) };
        let chunk = gather_chunk(&samples, vol, region);
        assert_eq!(chunk.len(), region.count());
        assert_eq!(chunk[0], samples[vol.index_of(3, 2, 1)]);

        let mut restored = samples.clone();
        scatter_chunk(&mut restored, vol, &chunk, region);
        assert_eq!(restored, samples);
    }

    #[test]
    fn chunk_budget_shares_are_proportional_and_byte_aligned(){
        let targets = {
            let mut targets = Targets::default();
            targets.set_bit_budget(1_000_000);
            targets
        };

        let share = chunk_targets(targets, 1000, 4000, 8000);
        assert_eq!(share.bit_budget % 8, 0);
        assert!(share.bit_budget <= (1_000_000 - 8000) / 4 + 8);
        assert!(share.bit_budget >= (1_000_000 - 8000) / 4 - 8);
    }
}
