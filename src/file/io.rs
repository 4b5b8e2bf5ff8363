//! Low-level little-endian reading and writing utilities for PE structures.
//!
//! Every structure the loader touches (optional header fields, data directories, section
//! headers, relocation blocks, import descriptors, thunks and export tables) is stored
//! little-endian. This module provides bounds-checked primitive reads and writes over byte
//! slices so that no component has to index buffers or dereference raw pointers directly.
//!
//! # Key Components
//!
//! - [`crate::file::io::ImageIO`] - Trait mapping a primitive type to its byte representation
//! - [`crate::file::io::read_le`] / [`crate::file::io::read_le_at`] - Bounds-checked reads
//! - [`crate::file::io::write_le`] / [`crate::file::io::write_le_at`] - Bounds-checked writes
//!
//! # Examples
//!
//! ```rust,ignore
//! use memmodule::file::io::{read_le_at, write_le_at};
//!
//! let mut data = [0u8; 8];
//! let mut offset = 0;
//! write_le_at(&mut data, &mut offset, 0x1000_u32)?;
//! write_le_at(&mut data, &mut offset, 12_u32)?;
//!
//! let mut offset = 0;
//! let page: u32 = read_le_at(&data, &mut offset)?;
//! let size: u32 = read_le_at(&data, &mut offset)?;
//! assert_eq!((page, size), (0x1000, 12));
//! # Ok::<(), memmodule::Error>(())
//! ```
//!
//! # Error Handling
//!
//! All functions return [`crate::Error::OutOfBounds`] when the buffer holds fewer bytes than
//! the operation needs, including when `offset + size` would overflow.

use crate::Result;

/// Trait for types that can be decoded from and encoded to little-endian byte arrays.
///
/// Each implementation names the fixed-size array it converts through (e.g. `[u8; 4]` for
/// `u32`).
pub trait ImageIO: Sized {
    /// Byte array type matching the size of `Self`.
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Read T from a byte buffer in little-endian
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Write T to a byte buffer in little-endian
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_image_io {
    ($($ty:ty),*) => {
        $(
            impl ImageIO for $ty {
                type Bytes = [u8; std::mem::size_of::<$ty>()];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_image_io!(u8, u16, u32, u64, usize);

/// Safely reads a value of type `T` in little-endian byte order from the start of a buffer.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_le<T: ImageIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Safely reads a value of type `T` in little-endian byte order at `offset`, advancing the
/// offset by the size of `T`.
///
/// # Arguments
///
/// * `data` - The byte buffer to read from
/// * `offset` - Mutable reference to the offset position (will be advanced after reading)
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes. The offset is left
/// untouched in that case.
///
/// # Examples
///
/// ```rust,ignore
/// use memmodule::file::io::read_le_at;
///
/// let data = [0x01, 0x00, 0x02, 0x00];
/// let mut offset = 0;
///
/// let first: u16 = read_le_at(&data, &mut offset)?;
/// let second: u16 = read_le_at(&data, &mut offset)?;
/// assert_eq!((first, second, offset), (1, 2, 4));
/// # Ok::<(), memmodule::Error>(())
/// ```
pub fn read_le_at<T: ImageIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(out_of_bounds_error!());
    };

    if end > data.len() {
        return Err(out_of_bounds_error!());
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(out_of_bounds_error!());
    };

    *offset = end;

    Ok(T::from_le_bytes(read))
}

/// Safely writes a value of type `T` in little-endian byte order to the start of a buffer.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn write_le<T: ImageIO>(data: &mut [u8], value: T) -> Result<()> {
    let mut offset = 0_usize;
    write_le_at(data, &mut offset, value)
}

/// Safely writes a value of type `T` in little-endian byte order at `offset`, advancing the
/// offset by the size of `T`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn write_le_at<T: ImageIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(out_of_bounds_error!());
    };

    if end > data.len() {
        return Err(out_of_bounds_error!());
    }

    data[*offset..end].copy_from_slice(value.to_le_bytes().as_ref());
    *offset = end;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_BUFFER: [u8; 8] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

    #[test]
    fn read_le_u8() {
        let result = read_le::<u8>(&TEST_BUFFER).unwrap();
        assert_eq!(result, 0x01);
    }

    #[test]
    fn read_le_u16() {
        let result = read_le::<u16>(&TEST_BUFFER).unwrap();
        assert_eq!(result, 0x0201);
    }

    #[test]
    fn read_le_u32() {
        let result = read_le::<u32>(&TEST_BUFFER).unwrap();
        assert_eq!(result, 0x0403_0201);
    }

    #[test]
    fn read_le_u64() {
        let result = read_le::<u64>(&TEST_BUFFER).unwrap();
        assert_eq!(result, 0x0807_0605_0403_0201);
    }

    #[test]
    fn read_le_at_advances() {
        let mut offset = 2;
        let result = read_le_at::<u16>(&TEST_BUFFER, &mut offset).unwrap();
        assert_eq!(result, 0x0403);
        assert_eq!(offset, 4);
    }

    #[test]
    fn read_le_usize_matches_pointer_width() {
        let result = read_le::<usize>(&TEST_BUFFER).unwrap();
        assert_eq!(std::mem::size_of_val(&result), std::mem::size_of::<usize>());
        assert_eq!(result & 0xFF, 0x01);
    }

    #[test]
    fn errors() {
        let buffer = [0xFF, 0xFF, 0xFF, 0xFF];

        let result = read_le::<u64>(&buffer);
        assert!(matches!(result, Err(crate::Error::OutOfBounds { .. })));

        let mut offset = 2;
        let result = read_le_at::<u32>(&buffer, &mut offset);
        assert!(result.is_err());
        assert_eq!(offset, 2);

        let mut offset = usize::MAX;
        assert!(read_le_at::<u8>(&buffer, &mut offset).is_err());
    }

    #[test]
    fn write_le_u32() {
        let mut data = [0u8; 4];
        write_le(&mut data, 0x1234_5678_u32).unwrap();
        assert_eq!(data, [0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn write_le_at_sequential() {
        let mut data = [0u8; 14];
        let mut offset = 0;

        write_le_at(&mut data, &mut offset, 0x0102_u16).unwrap();
        write_le_at(&mut data, &mut offset, 0x0304_0506_u32).unwrap();
        write_le_at(&mut data, &mut offset, 0x0708_090A_0B0C_0D0E_u64).unwrap();

        assert_eq!(offset, 14);
        assert_eq!(
            data,
            [0x02, 0x01, 0x06, 0x05, 0x04, 0x03, 0x0E, 0x0D, 0x0C, 0x0B, 0x0A, 0x09, 0x08, 0x07]
        );
    }

    #[test]
    fn write_errors() {
        let mut data = [0u8; 3];

        assert!(write_le(&mut data, 0_u32).is_err());
        assert_eq!(data, [0, 0, 0]);

        let mut offset = 2;
        assert!(write_le_at(&mut data, &mut offset, 0_u16).is_err());
        assert_eq!(offset, 2);
    }
}
