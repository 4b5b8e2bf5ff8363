//! Cursor-based byte parser for sequential PE structures.
//!
//! The [`crate::file::parser::Parser`] type keeps a position inside a byte slice and offers
//! bounds-checked reads that advance it. It is used for the structures the loader walks in
//! order: the optional header, the section table and the packed entries of relocation blocks.
//!
//! # Examples
//!
//! ```rust,ignore
//! use memmodule::Parser;
//!
//! // One relocation block header followed by two entries
//! let data = [0x00, 0x10, 0x00, 0x00, 0x0C, 0x00, 0x00, 0x00, 0x10, 0xA0, 0x00, 0x00];
//! let mut parser = Parser::new(&data);
//!
//! let page_rva = parser.read_le::<u32>()?;
//! let block_size = parser.read_le::<u32>()?;
//! assert_eq!((page_rva, block_size), (0x1000, 12));
//!
//! let entry = parser.read_le::<u16>()?;
//! assert_eq!(entry >> 12, 10);
//! # Ok::<(), memmodule::Error>(())
//! ```

use crate::{
    file::io::{read_le_at, ImageIO},
    Result,
};

/// A cursor over a byte slice with bounds-checked, position-advancing reads.
///
/// All read methods leave the position unchanged when they fail.
pub struct Parser<'a> {
    /// The binary data being parsed
    data: &'a [u8],
    /// Current position within the data buffer
    position: usize,
}

impl<'a> Parser<'a> {
    /// Create a new [`crate::file::parser::Parser`] from a byte slice.
    ///
    /// # Arguments
    /// * `data` - The byte slice to read from
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Parser { data, position: 0 }
    }

    /// Returns the length of the underlying data buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the underlying data buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Move the position forward by the specified number of bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if advancing by step would exceed the data length.
    pub fn advance_by(&mut self, step: usize) -> Result<()> {
        self.position = self.calc_end_position(step)?;
        Ok(())
    }

    /// Get the current position of the parser within the data buffer.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Read a little-endian value and advance past it.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
    pub fn read_le<T: ImageIO>(&mut self) -> Result<T> {
        read_le_at::<T>(self.data, &mut self.position)
    }

    /// Returns the number of bytes left after the current position.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    /// Ensures that at least `needed` bytes are available from the current position.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if fewer than `needed` bytes remain.
    pub fn ensure_remaining(&self, needed: usize) -> Result<()> {
        if self.remaining() < needed {
            return Err(out_of_bounds_error!());
        }
        Ok(())
    }

    /// Calculates `position + length` with overflow checking, ensuring the result does not
    /// exceed the data.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the calculation would overflow or if the
    /// resulting position exceeds the data length.
    pub fn calc_end_position(&self, length: usize) -> Result<usize> {
        let end = self
            .position
            .checked_add(length)
            .ok_or(out_of_bounds_error!())?;

        if end > self.data.len() {
            return Err(out_of_bounds_error!());
        }

        Ok(end)
    }

    /// Reads a slice of bytes of the specified length from the current position.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if reading `length` bytes would exceed the data.
    pub fn read_bytes(&mut self, length: usize) -> Result<&'a [u8]> {
        let end = self.calc_end_position(length)?;
        let bytes = &self.data[self.position..end];
        self.position = end;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_reads() {
        let data = [0x00, 0x10, 0x00, 0x00, 0x0C, 0x00, 0x00, 0x00, 0x10, 0xA0];
        let mut parser = Parser::new(&data);

        assert_eq!(parser.read_le::<u32>().unwrap(), 0x1000);
        assert_eq!(parser.read_le::<u32>().unwrap(), 12);
        assert_eq!(parser.pos(), 8);
        assert_eq!(parser.read_le::<u16>().unwrap(), 0xA010);
        assert_eq!(parser.remaining(), 0);
    }

    #[test]
    fn test_error_handling() {
        let data = [0x01, 0x02, 0x03];
        let mut parser = Parser::new(&data);

        assert!(parser.read_le::<u32>().is_err());
        assert_eq!(parser.pos(), 0);
        assert!(parser.advance_by(4).is_err());
        assert!(parser.advance_by(usize::MAX).is_err());
        assert!(parser.ensure_remaining(4).is_err());
        assert!(parser.ensure_remaining(3).is_ok());
    }

    #[test]
    fn test_read_bytes() {
        let data = [0x2E, 0x74, 0x65, 0x78, 0x74, 0x00, 0x00, 0x00, 0xFF];
        let mut parser = Parser::new(&data);

        assert_eq!(parser.read_bytes(8).unwrap(), b".text\0\0\0");
        assert_eq!(parser.remaining(), 1);
        assert!(parser.read_bytes(2).is_err());
        assert_eq!(parser.pos(), 8);
    }
}
