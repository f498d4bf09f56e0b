
//! Specialized binary input and output.
//! Uses the error handling for this crate and is used by all headers.

pub use ::std::io::{Read, Write};
use lebe::prelude::*;
use crate::error::{Error, Result, UnitResult};


/// Extension trait for primitive types like numbers and arrays.
/// Everything this crate persists goes through here, in little-endian order.
pub trait Data: Sized + Default + Clone {

    /// Number of bytes this would consume in a stream.
    const BYTE_SIZE: usize = ::std::mem::size_of::<Self>();

    /// Read a value of type `Self`.
    fn read(read: &mut impl Read) -> Result<Self>;

    /// Read as many values of type `Self` as fit into the provided slice.
    /// If the slice cannot be filled, returns `Invalid`.
    fn read_slice(read: &mut impl Read, slice: &mut [Self]) -> UnitResult;

    /// Read as many values of type `Self` as specified with `data_size`.
    fn read_vec(read: &mut impl Read, data_size: usize) -> Result<Vec<Self>> {
        let mut vec = vec![Self::default(); data_size];
        Self::read_slice(read, &mut vec)?;
        Ok(vec)
    }

    /// Write this value to the stream.
    fn write(self, write: &mut impl Write) -> UnitResult;

    /// Write all values of that slice to the stream.
    fn write_slice(write: &mut impl Write, slice: &[Self]) -> UnitResult;
}


macro_rules! implement_data_for_primitive {
    ($kind: ident) => {
        impl Data for $kind {
            fn read(read: &mut impl Read) -> Result<Self> {
                read.read_from_little_endian().map_err(|_| Error::invalid("byte source ended early"))
            }

            fn write(self, write: &mut impl Write) -> UnitResult {
                write.write_as_little_endian(&self).map_err(|_| Error::invalid("byte destination failed"))
            }

            fn read_slice(read: &mut impl Read, slice: &mut [Self]) -> UnitResult {
                read.read_from_little_endian_into(slice).map_err(|_| Error::invalid("byte source ended early"))
            }

            fn write_slice(write: &mut impl Write, slice: &[Self]) -> UnitResult {
                write.write_as_little_endian(slice).map_err(|_| Error::invalid("byte destination failed"))
            }
        }
    };
}

implement_data_for_primitive!(u8);
implement_data_for_primitive!(i8);
implement_data_for_primitive!(i16);
implement_data_for_primitive!(u16);
implement_data_for_primitive!(u32);
implement_data_for_primitive!(i32);
implement_data_for_primitive!(i64);
implement_data_for_primitive!(u64);
implement_data_for_primitive!(f32);
implement_data_for_primitive!(f64);
