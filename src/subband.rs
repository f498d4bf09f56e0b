
//! Pure index arithmetic over the subband pyramid that a multi-level
//! transform leaves behind in a coefficient buffer. Subband 0 is the
//! coarsest approximation; higher indices hold ever finer detail bands.

use crate::math::{approx_len, Dims};


/// One rectangular or cuboidal frequency region of a transformed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subband {

    /// Position of the first sample of this band inside the buffer.
    pub origin: Dims,

    /// Extent of this band along each axis.
    pub size: Dims,

    /// The transform level this band belongs to.
    /// The coarsest approximation carries the highest level.
    pub level: usize,
}

impl Subband {

    /// Linear index of the first sample of this band
    /// inside a buffer of the given dimensions.
    pub fn offset(&self, dims: Dims) -> usize {
        dims.index_of(self.origin.x(), self.origin.y(), self.origin.z())
    }

    /// Number of samples in this band.
    pub fn count(&self) -> usize {
        self.size.count()
    }
}


/// Number of subbands of a 2D pyramid with this many levels.
pub fn count_2d(levels: usize) -> usize { 3 * levels + 1 }

/// Number of subbands of a dyadic 3D pyramid with this many levels.
pub fn count_3d(levels: usize) -> usize { 7 * levels + 1 }

/// The transform level a subband index belongs to, for 2D pyramids.
pub fn level_of_2d(index: usize, levels: usize) -> usize {
    if index == 0 { levels } else { levels - (index - 1) / 3 }
}

/// The transform level a subband index belongs to, for dyadic 3D pyramids.
pub fn level_of_3d(index: usize, levels: usize) -> usize {
    if index == 0 { levels } else { levels - (index - 1) / 7 }
}

/// All subbands of a 2D pyramid, coarsest first.
/// Within a level the order is horizontal, vertical, diagonal detail.
pub fn list_2d(dims: Dims, levels: usize) -> Vec<Subband> {
    let mut bands = Vec::with_capacity(count_2d(levels));

    bands.push(Subband {
        origin: Dims(0, 0, 0),
        size: Dims(approx_len(dims.x(), levels), approx_len(dims.y(), levels), 1),
        level: levels,
    });

    for level in (1..=levels).rev() {
        let low_x = approx_len(dims.x(), level);
        let low_y = approx_len(dims.y(), level);
        let high_x = approx_len(dims.x(), level - 1) - low_x;
        let high_y = approx_len(dims.y(), level - 1) - low_y;

        bands.push(Subband { origin: Dims(low_x, 0, 0), size: Dims(high_x, low_y, 1), level });
        bands.push(Subband { origin: Dims(0, low_y, 0), size: Dims(low_x, high_y, 1), level });
        bands.push(Subband { origin: Dims(low_x, low_y, 0), size: Dims(high_x, high_y, 1), level });
    }

    bands
}

/// All subbands of a dyadic 3D pyramid, coarsest first.
/// Within a level the seven detail bands are ordered with `x` varying
/// fastest over the low/high combinations.
pub fn list_3d(dims: Dims, levels: usize) -> Vec<Subband> {
    let mut bands = Vec::with_capacity(count_3d(levels));

    bands.push(Subband {
        origin: Dims(0, 0, 0),
        size: Dims(
            approx_len(dims.x(), levels),
            approx_len(dims.y(), levels),
            approx_len(dims.z(), levels),
        ),
        level: levels,
    });

    for level in (1..=levels).rev() {
        let low = Dims(
            approx_len(dims.x(), level),
            approx_len(dims.y(), level),
            approx_len(dims.z(), level),
        );
        let high = Dims(
            approx_len(dims.x(), level - 1) - low.x(),
            approx_len(dims.y(), level - 1) - low.y(),
            approx_len(dims.z(), level - 1) - low.z(),
        );

        for select_z in 0..2 {
            for select_y in 0..2 {
                for select_x in 0..2 {
                    if select_x == 0 && select_y == 0 && select_z == 0 { continue; }

                    bands.push(Subband {
                        origin: Dims(
                            if select_x == 0 { 0 } else { low.x() },
                            if select_y == 0 { 0 } else { low.y() },
                            if select_z == 0 { 0 } else { low.z() },
                        ),
                        size: Dims(
                            if select_x == 0 { low.x() } else { high.x() },
                            if select_y == 0 { low.y() } else { high.y() },
                            if select_z == 0 { low.z() } else { high.z() },
                        ),
                        level,
                    });
                }
            }
        }
    }

    bands
}
