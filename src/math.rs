
// level and partition arithmetic shared by the transform and the coders


/// A triple of sizes describing a 1D, 2D or 3D sample array.
/// `x` is the fastest-varying axis in memory; 2D data carries `z() == 1`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct Dims(pub usize, pub usize, pub usize);

impl Dims {

    /// The width, along the fastest-varying axis.
    pub fn x(self) -> usize { self.0 }

    /// The height.
    pub fn y(self) -> usize { self.1 }

    /// The depth or frame count.
    pub fn z(self) -> usize { self.2 }

    /// Total number of samples described by these dimensions.
    pub fn count(self) -> usize { self.0 * self.1 * self.2 }

    /// Number of samples in one `z`-plane.
    pub fn plane(self) -> usize { self.0 * self.1 }

    /// Whether these dimensions describe a single 2D plane.
    pub fn is_2d(self) -> bool { self.2 == 1 }

    /// Whether any axis is zero, making the array empty.
    pub fn is_empty(self) -> bool { self.0 == 0 || self.1 == 0 || self.2 == 0 }

    /// Linear index of the sample at `(x, y, z)`, row-major with `x` fastest.
    pub fn index_of(self, x: usize, y: usize, z: usize) -> usize {
        (z * self.1 + y) * self.0 + x
    }
}

/// computes floor(log(x)/log(2)) of the magnitude of a positive float
pub fn floor_log2(value: f64) -> i32 {
    debug_assert!(value > 0.0);
    value.log2().floor() as i32
}

/// How many levels of wavelet transform a signal of this length receives.
/// Eight samples is the minimal length for one level, so the coarsest
/// approximation never drops below four samples.
pub fn num_levels(len: usize) -> usize {
    if len < 8 { 0 }
    else { (len as f64 / 8.0).log2() as usize + 1 }
}

/// Lengths of the low-pass and high-pass halves after one split.
/// The low-pass half takes the extra sample of an odd length.
pub fn approx_detail_len(len: usize) -> (usize, usize) {
    (len - len / 2, len / 2)
}

/// Length of the low-pass part after this many splits.
pub fn approx_len(mut len: usize, levels: usize) -> usize {
    for _ in 0..levels {
        len -= len / 2;
    }
    len
}

/// How many times a length can be halved before reaching a single sample.
pub fn num_partitions(mut len: usize) -> usize {
    let mut count = 0;
    while len > 1 {
        count += 1;
        len -= len / 2;
    }
    count
}
