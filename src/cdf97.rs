
//! Forward and inverse Cohen-Daubechies-Feauveau 9/7 wavelet transforms
//! with symmetric boundary extension, implemented via the lifting scheme.
//!
//! The lifting constants are derived from the filter bank published in
//! "Biorthogonal Bases of Compactly Supported Wavelets" by Cohen et al.,
//! page 551. One level transforms a signal in place: predict and update
//! sweeps over the interleaved samples, then a split that moves the
//! low-pass half to the front.

use crate::error::{Error, UnitResult};
use crate::math::{approx_len, num_levels, Dims};


// Filter bank h[0..4] and its lifting factorization:
//   h = [0.602949018236, 0.266864118443, -0.078223266529,
//        -0.016864118443, 0.026748757411]
const ALPHA: f64 = -1.586_134_342_059_423_8;
const BETA: f64 = -0.052_980_118_573_376_651;
const GAMMA: f64 = 0.882_911_075_528_503_34;
const DELTA: f64 = 0.443_506_852_044_983_02;
const EPSILON: f64 = 1.149_604_398_860_296_2;
const INV_EPSILON: f64 = 1.0 / EPSILON;


/// Owns a coefficient buffer while transforming it.
/// The same instance runs forward transforms on samples
/// and inverse transforms on quantized coefficients.
#[derive(Debug, Clone, Default)]
pub struct Cdf97 {
    samples: Vec<f64>,
    dims: Dims,

    // scratch space for one gathered line and its interleaved copy
    line: Vec<f64>,
    interleaved: Vec<f64>,
}

impl Cdf97 {

    /// A transformer without contents.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a buffer to transform in place.
    /// Resets all internal state.
    pub fn take(&mut self, samples: Vec<f64>, dims: Dims) -> UnitResult {
        if samples.len() != dims.count() || dims.is_empty() {
            return Err(Error::WrongDims);
        }

        let longest = dims.x().max(dims.y()).max(dims.z());
        self.line.resize(longest, 0.0);
        self.interleaved.resize(longest, 0.0);

        self.samples = samples;
        self.dims = dims;
        Ok(())
    }

    /// Borrow the current contents.
    pub fn view(&self) -> &[f64] { &self.samples }

    /// Transfer the transformed buffer out, leaving this instance empty.
    pub fn release(&mut self) -> Vec<f64> {
        self.dims = Dims::default();
        std::mem::replace(&mut self.samples, Vec::new())
    }

    /// The dimensions of the contained data.
    pub fn dims(&self) -> Dims { self.dims }

    /// Multi-level forward transform of the buffer viewed as a 1D signal.
    pub fn dwt1d(&mut self) {
        let len = self.samples.len();
        for level in 0..num_levels(len) {
            forward_line(&mut self.samples[..approx_len(len, level)], &mut self.interleaved);
        }
    }

    /// Exact inverse of `dwt1d`.
    pub fn idwt1d(&mut self) {
        let len = self.samples.len();
        for level in (0..num_levels(len)).rev() {
            inverse_line(&mut self.samples[..approx_len(len, level)], &mut self.interleaved);
        }
    }

    /// Multi-level forward transform of the buffer viewed as a 2D plane.
    pub fn dwt2d(&mut self) {
        let Dims(size_x, size_y, _) = self.dims;
        let levels = num_levels(size_x.min(size_y));

        for level in 0..levels {
            forward_plane(
                &mut self.samples, size_x,
                approx_len(size_x, level), approx_len(size_y, level),
                &mut self.line, &mut self.interleaved,
            );
        }
    }

    /// Exact inverse of `dwt2d`.
    pub fn idwt2d(&mut self) {
        let Dims(size_x, size_y, _) = self.dims;
        let levels = num_levels(size_x.min(size_y));

        for level in (0..levels).rev() {
            inverse_plane(
                &mut self.samples, size_x,
                approx_len(size_x, level), approx_len(size_y, level),
                &mut self.line, &mut self.interleaved,
            );
        }
    }

    /// Multi-level forward transform of the volume. Chooses between the
    /// dyadic and the wavelet-packet strategy from the dimensions alone,
    /// so the decoder arrives at the same choice.
    pub fn dwt3d(&mut self) {
        if Self::use_dyadic(self.dims) { self.dwt3d_dyadic() }
        else { self.dwt3d_packet() }
    }

    /// Exact inverse of `dwt3d`.
    pub fn idwt3d(&mut self) {
        if Self::use_dyadic(self.dims) { self.idwt3d_dyadic() }
        else { self.idwt3d_packet() }
    }

    /// The dyadic strategy requires the plane and the depth axis
    /// to support the same number of levels.
    fn use_dyadic(dims: Dims) -> bool {
        num_levels(dims.x().min(dims.y())) == num_levels(dims.z())
    }

    /// One shared level count: each level transforms all three axes
    /// of the current low-pass block, then recurses into it.
    fn dwt3d_dyadic(&mut self) {
        let Dims(size_x, size_y, size_z) = self.dims;
        let levels = num_levels(size_x.min(size_y).min(size_z));

        for level in 0..levels {
            let (len_x, len_y, len_z) =
                (approx_len(size_x, level), approx_len(size_y, level), approx_len(size_z, level));

            for z in 0..len_z {
                let plane = &mut self.samples[z * size_x * size_y..][..size_x * size_y];
                forward_plane(plane, size_x, len_x, len_y, &mut self.line, &mut self.interleaved);
            }

            self.transform_depth_columns(len_x, len_y, len_z, true);
        }
    }

    fn idwt3d_dyadic(&mut self) {
        let Dims(size_x, size_y, size_z) = self.dims;
        let levels = num_levels(size_x.min(size_y).min(size_z));

        for level in (0..levels).rev() {
            let (len_x, len_y, len_z) =
                (approx_len(size_x, level), approx_len(size_y, level), approx_len(size_z, level));

            self.transform_depth_columns(len_x, len_y, len_z, false);

            for z in 0..len_z {
                let plane = &mut self.samples[z * size_x * size_y..][..size_x * size_y];
                inverse_plane(plane, size_x, len_x, len_y, &mut self.line, &mut self.interleaved);
            }
        }
    }

    /// Differing level counts: exhaust all plane levels on every slice,
    /// then all depth levels on every column.
    fn dwt3d_packet(&mut self) {
        let Dims(size_x, size_y, size_z) = self.dims;
        let levels_xy = num_levels(size_x.min(size_y));
        let levels_z = num_levels(size_z);

        for z in 0..size_z {
            let plane = &mut self.samples[z * size_x * size_y..][..size_x * size_y];
            for level in 0..levels_xy {
                forward_plane(
                    plane, size_x,
                    approx_len(size_x, level), approx_len(size_y, level),
                    &mut self.line, &mut self.interleaved,
                );
            }
        }

        for level in 0..levels_z {
            self.transform_depth_columns(size_x, size_y, approx_len(size_z, level), true);
        }
    }

    fn idwt3d_packet(&mut self) {
        let Dims(size_x, size_y, size_z) = self.dims;
        let levels_xy = num_levels(size_x.min(size_y));
        let levels_z = num_levels(size_z);

        for level in (0..levels_z).rev() {
            self.transform_depth_columns(size_x, size_y, approx_len(size_z, level), false);
        }

        for z in 0..size_z {
            let plane = &mut self.samples[z * size_x * size_y..][..size_x * size_y];
            for level in (0..levels_xy).rev() {
                inverse_plane(
                    plane, size_x,
                    approx_len(size_x, level), approx_len(size_y, level),
                    &mut self.line, &mut self.interleaved,
                );
            }
        }
    }

    /// One transform level along `z` for every column of the `len_x * len_y`
    /// top-left region, gathering the strided samples into a contiguous line.
    fn transform_depth_columns(&mut self, len_x: usize, len_y: usize, len_z: usize, forward: bool) {
        let plane_len = self.dims.x() * self.dims.y();
        let row_len = self.dims.x();

        for y in 0..len_y {
            for x in 0..len_x {
                let column_start = y * row_len + x;

                for z in 0..len_z {
                    self.line[z] = self.samples[column_start + z * plane_len];
                }

                if forward { forward_line(&mut self.line[..len_z], &mut self.interleaved); }
                else { inverse_line(&mut self.line[..len_z], &mut self.interleaved); }

                for z in 0..len_z {
                    self.samples[column_start + z * plane_len] = self.line[z];
                }
            }
        }
    }
}


/// One level of 2D transform on the `len_x * len_y` top-left region of a
/// plane with row stride `stride`: all rows first, then all columns.
fn forward_plane(
    plane: &mut [f64], stride: usize,
    len_x: usize, len_y: usize,
    line: &mut [f64], interleaved: &mut [f64],
) {
    for y in 0..len_y {
        forward_line(&mut plane[y * stride..y * stride + len_x], interleaved);
    }

    for x in 0..len_x {
        for y in 0..len_y { line[y] = plane[y * stride + x]; }
        forward_line(&mut line[..len_y], interleaved);
        for y in 0..len_y { plane[y * stride + x] = line[y]; }
    }
}

/// Exact inverse of `forward_plane`: columns first, then rows.
fn inverse_plane(
    plane: &mut [f64], stride: usize,
    len_x: usize, len_y: usize,
    line: &mut [f64], interleaved: &mut [f64],
) {
    for x in 0..len_x {
        for y in 0..len_y { line[y] = plane[y * stride + x]; }
        inverse_line(&mut line[..len_y], interleaved);
        for y in 0..len_y { plane[y * stride + x] = line[y]; }
    }

    for y in 0..len_y {
        inverse_line(&mut plane[y * stride..y * stride + len_x], interleaved);
    }
}

/// One level of 1D transform: lifting sweeps over the interleaved copy,
/// then the split that gathers the low-pass half at the front.
fn forward_line(signal: &mut [f64], interleaved: &mut [f64]) {
    let count = signal.len();
    if count < 2 {
        if count == 1 { signal[0] *= std::f64::consts::SQRT_2; }
        return;
    }

    let buffer = &mut interleaved[..count];
    buffer.copy_from_slice(signal);

    if count % 2 == 0 { analysis_even(buffer) }
    else { analysis_odd(buffer) }

    let low_count = count - count / 2;
    for index in 0..low_count { signal[index] = buffer[2 * index]; }
    for index in 0..count / 2 { signal[low_count + index] = buffer[2 * index + 1]; }
}

/// Exact inverse of `forward_line`.
fn inverse_line(signal: &mut [f64], interleaved: &mut [f64]) {
    let count = signal.len();
    if count < 2 {
        if count == 1 { signal[0] *= std::f64::consts::FRAC_1_SQRT_2; }
        return;
    }

    let buffer = &mut interleaved[..count];
    let low_count = count - count / 2;
    for index in 0..low_count { buffer[2 * index] = signal[index]; }
    for index in 0..count / 2 { buffer[2 * index + 1] = signal[low_count + index]; }

    if count % 2 == 0 { synthesis_even(buffer) }
    else { synthesis_odd(buffer) }

    signal.copy_from_slice(buffer);
}


// The four lifting kernels. Even indices carry the scaling signal, odd
// indices the wavelet signal; boundary samples use symmetric extension.

fn analysis_even(signal: &mut [f64]) {
    let count = signal.len();
    debug_assert!(count >= 2 && count % 2 == 0);

    for index in (1..count - 2).step_by(2) {
        signal[index] += ALPHA * (signal[index - 1] + signal[index + 1]);
    }
    signal[count - 1] += 2.0 * ALPHA * signal[count - 2];

    signal[0] += 2.0 * BETA * signal[1];
    for index in (2..count).step_by(2) {
        signal[index] += BETA * (signal[index + 1] + signal[index - 1]);
    }

    for index in (1..count - 2).step_by(2) {
        signal[index] += GAMMA * (signal[index - 1] + signal[index + 1]);
    }
    signal[count - 1] += 2.0 * GAMMA * signal[count - 2];

    signal[0] = EPSILON * (signal[0] + 2.0 * DELTA * signal[1]);
    for index in (2..count).step_by(2) {
        signal[index] = EPSILON * (signal[index] + DELTA * (signal[index + 1] + signal[index - 1]));
    }

    for index in (1..count).step_by(2) {
        signal[index] *= -INV_EPSILON;
    }
}

fn synthesis_even(signal: &mut [f64]) {
    let count = signal.len();
    debug_assert!(count >= 2 && count % 2 == 0);

    for index in (1..count).step_by(2) {
        signal[index] *= -EPSILON;
    }

    signal[0] = signal[0] * INV_EPSILON - 2.0 * DELTA * signal[1];
    for index in (2..count).step_by(2) {
        signal[index] = signal[index] * INV_EPSILON - DELTA * (signal[index + 1] + signal[index - 1]);
    }

    for index in (1..count - 2).step_by(2) {
        signal[index] -= GAMMA * (signal[index - 1] + signal[index + 1]);
    }
    signal[count - 1] -= 2.0 * GAMMA * signal[count - 2];

    signal[0] -= 2.0 * BETA * signal[1];
    for index in (2..count).step_by(2) {
        signal[index] -= BETA * (signal[index + 1] + signal[index - 1]);
    }

    for index in (1..count - 2).step_by(2) {
        signal[index] -= ALPHA * (signal[index - 1] + signal[index + 1]);
    }
    signal[count - 1] -= 2.0 * ALPHA * signal[count - 2];
}

fn analysis_odd(signal: &mut [f64]) {
    let count = signal.len();
    debug_assert!(count >= 3 && count % 2 == 1);

    for index in (1..count - 1).step_by(2) {
        signal[index] += ALPHA * (signal[index - 1] + signal[index + 1]);
    }

    signal[0] += 2.0 * BETA * signal[1];
    for index in (2..count - 2).step_by(2) {
        signal[index] += BETA * (signal[index + 1] + signal[index - 1]);
    }
    signal[count - 1] += 2.0 * BETA * signal[count - 2];

    for index in (1..count - 1).step_by(2) {
        signal[index] += GAMMA * (signal[index - 1] + signal[index + 1]);
    }

    signal[0] = EPSILON * (signal[0] + 2.0 * DELTA * signal[1]);
    for index in (2..count - 2).step_by(2) {
        signal[index] = EPSILON * (signal[index] + DELTA * (signal[index + 1] + signal[index - 1]));
    }
    signal[count - 1] = EPSILON * (signal[count - 1] + 2.0 * DELTA * signal[count - 2]);

    for index in (1..count).step_by(2) {
        signal[index] *= -INV_EPSILON;
    }
}

fn synthesis_odd(signal: &mut [f64]) {
    let count = signal.len();
    debug_assert!(count >= 3 && count % 2 == 1);

    for index in (1..count).step_by(2) {
        signal[index] *= -EPSILON;
    }

    signal[0] = signal[0] * INV_EPSILON - 2.0 * DELTA * signal[1];
    for index in (2..count - 2).step_by(2) {
        signal[index] = signal[index] * INV_EPSILON - DELTA * (signal[index + 1] + signal[index - 1]);
    }
    signal[count - 1] = signal[count - 1] * INV_EPSILON - 2.0 * DELTA * signal[count - 2];

    for index in (1..count - 1).step_by(2) {
        signal[index] -= GAMMA * (signal[index - 1] + signal[index + 1]);
    }

    signal[0] -= 2.0 * BETA * signal[1];
    for index in (2..count - 2).step_by(2) {
        signal[index] -= BETA * (signal[index + 1] + signal[index - 1]);
    }
    signal[count - 1] -= 2.0 * BETA * signal[count - 2];

    for index in (1..count - 1).step_by(2) {
        signal[index] -= ALPHA * (signal[index - 1] + signal[index + 1]);
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::math::Dims;

    fn wavy(count: usize) -> Vec<f64> {
        (0..count)
            .map(|index| {
                let position = index as f64;
                (position * 0.17).sin() * 40.0 + (position * 0.023).cos() * 250.0
            })
            .collect()
    }

    fn assert_close(result: &[f64], original: &[f64]) {
        let max = original.iter().fold(0.0_f64, |max, value| max.max(value.abs()));
        for (restored, original) in result.iter().zip(original) {
            assert!(
                (restored - original).abs() <= 1e-9 * max,
                "roundtrip error too large: {} vs {}", restored, original
            );
        }
    }

    #[test]
    fn line_roundtrip_even_and_odd(){
        for &count in &[2, 3, 8, 9, 64, 65, 127, 128] {
            let original = wavy(count);
            let mut signal = original.clone();
            let mut scratch = vec![0.0; count];

            forward_line(&mut signal, &mut scratch);
            inverse_line(&mut signal, &mut scratch);
            assert_close(&signal, &original);
        }
    }

    #[test]
    fn forward_transform_actually_decorrelates(){
        // a smooth signal should concentrate its energy in the low-pass half
        let original = wavy(128);
        let mut signal = original.clone();
        let mut scratch = vec![0.0; 128];
        forward_line(&mut signal, &mut scratch);

        let low_energy: f64 = signal[..64].iter().map(|value| value * value).sum();
        let high_energy: f64 = signal[64..].iter().map(|value| value * value).sum();
        assert!(low_energy > high_energy * 100.0);
    }

    #[test]
    fn multi_level_1d_roundtrip(){
        let original = wavy(300);
        let mut transform = Cdf97::new();
        transform.take(original.clone(), Dims(300, 1, 1)).unwrap();
        transform.dwt1d();
        transform.idwt1d();
        assert_close(transform.view(), &original);
    }

    #[test]
    fn multi_level_2d_roundtrip(){
        for &(size_x, size_y) in &[(64, 64), (65, 64), (127, 33), (17, 17)] {
            let original = wavy(size_x * size_y);
            let mut transform = Cdf97::new();
            transform.take(original.clone(), Dims(size_x, size_y, 1)).unwrap();
            transform.dwt2d();
            transform.idwt2d();
            assert_close(transform.view(), &original);
        }
    }

    #[test]
    fn dyadic_3d_roundtrip(){
        let dims = Dims(16, 16, 16);
        assert!(Cdf97::use_dyadic(dims));

        let original = wavy(dims.count());
        let mut transform = Cdf97::new();
        transform.take(original.clone(), dims).unwrap();
        transform.dwt3d();
        transform.idwt3d();
        assert_close(transform.view(), &original);
    }

    #[test]
    fn wavelet_packet_3d_roundtrip(){
        // a thin volume gets fewer levels along z than in the plane
        let dims = Dims(32, 32, 4);
        assert!(!Cdf97::use_dyadic(dims));

        let original = wavy(dims.count());
        let mut transform = Cdf97::new();
        transform.take(original.clone(), dims).unwrap();
        transform.dwt3d();
        transform.idwt3d();
        assert_close(transform.view(), &original);

        let dims = Dims(64, 64, 17);
        assert!(!Cdf97::use_dyadic(dims));

        let original = wavy(dims.count());
        transform.take(original.clone(), dims).unwrap();
        transform.dwt3d();
        transform.idwt3d();
        assert_close(transform.view(), &original);
    }

    #[test]
    fn rejects_mismatched_buffer(){
        let mut transform = Cdf97::new();
        assert!(matches!(
            transform.take(vec![0.0; 10], Dims(3, 3, 1)),
            Err(Error::WrongDims)
        ));
    }
}
