//! Image sources and byte-level readers.
//!
//! The loader itself only needs a `&[u8]`, but callers usually start from a file on disk or a
//! buffer pulled out of some container. This module provides an owned image source over both,
//! plus the bounds-checked primitives every other module reads with.
//!
//! # Key Components
//!
//! - [`RawImage`] - an image buffer with its parsed header summary
//! - [`Backend`] - trait for data sources (memory-mapped file, owned `Vec<u8>`)
//! - [`parser::Parser`] - cursor over a byte slice with little-endian reads
//! - [`io`] - free functions for little-endian reads and writes at an offset
//!
//! # Examples
//!
//! ```rust,no_run
//! use memmodule::RawImage;
//! use std::path::Path;
//!
//! let image = RawImage::from_file(Path::new("plugin.dll"))?;
//! println!("Preferred base: 0x{:X}", image.imagebase());
//! for section in image.sections()? {
//!     println!("{} at RVA 0x{:X}", section.name(), section.virtual_address);
//! }
//! # Ok::<(), memmodule::Error>(())
//! ```

pub mod io;
pub mod parser;

mod physical;

use std::path::Path;

use crate::{loader::headers::ImageHeaders, loader::headers::SectionHeader, Error::Empty, Result};

pub use physical::Physical;

/// Backend trait for image data sources.
///
/// Abstracts over where the bytes of an image live, so an image can be inspected and loaded
/// the same way whether it was read into memory or mapped from disk.
pub trait Backend: Send + Sync {
    /// Returns a slice of the data at the given offset and length.
    ///
    /// # Arguments
    ///
    /// * `offset` - The starting offset within the data.
    /// * `len` - The length of the slice in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the requested range is out of bounds.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]>;

    /// Returns the entire data buffer.
    fn data(&self) -> &[u8];

    /// Returns the total length of the data buffer.
    fn len(&self) -> usize;
}

/// Owned heap buffers, as handed to [`RawImage::from_mem`].
impl Backend for Vec<u8> {
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        offset
            .checked_add(len)
            .and_then(|end| self.get(offset..end))
            .ok_or(out_of_bounds_error!())
    }

    fn data(&self) -> &[u8] {
        self
    }

    fn len(&self) -> usize {
        Vec::len(self)
    }
}

/// An image in its on-disk format, owned together with its parsed headers.
///
/// Construction validates the headers, so a `RawImage` always describes something the loader
/// will at least attempt to map. The bytes are never modified.
///
/// # Examples
///
/// ```rust,no_run
/// use memmodule::{Loader, RawImage};
///
/// let image = RawImage::from_mem(std::fs::read("plugin.dll")?)?;
/// let module = unsafe { Loader::new().load(image.data())? };
/// drop(image);
///
/// println!("Mapped at 0x{:X}", module.base_address());
/// # Ok::<(), memmodule::Error>(())
/// ```
pub struct RawImage {
    data: Box<dyn Backend>,
    headers: ImageHeaders,
}

impl RawImage {
    /// Map an image file from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be opened or mapped
    /// - The file is empty
    /// - The headers do not describe a loadable library for this process
    pub fn from_file(file: &Path) -> Result<RawImage> {
        let input = Physical::new(file)?;

        Self::load(input)
    }

    /// Take ownership of an image already in memory.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Empty`] for an empty buffer, otherwise any header validation
    /// error from [`ImageHeaders::parse`].
    pub fn from_mem(data: Vec<u8>) -> Result<RawImage> {
        Self::load(data)
    }

    fn load<T: Backend + 'static>(data: T) -> Result<RawImage> {
        if data.len() == 0 {
            return Err(Empty);
        }

        let headers = ImageHeaders::parse(data.data())?;
        Ok(RawImage {
            data: Box::new(data),
            headers,
        })
    }

    /// Total size of the image buffer in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the buffer is empty. Never the case for a constructed image.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.len() == 0
    }

    /// The whole image buffer.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.data()
    }

    /// `len` bytes at file offset `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range leaves the buffer.
    pub fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.data.data_slice(offset, len)
    }

    /// The parsed header summary.
    #[must_use]
    pub fn headers(&self) -> &ImageHeaders {
        &self.headers
    }

    /// Preferred base address.
    #[must_use]
    pub fn imagebase(&self) -> u64 {
        self.headers.image_base
    }

    /// Every section header, in table order.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the section table is truncated.
    pub fn sections(&self) -> Result<Vec<SectionHeader>> {
        self.headers.sections(self.data()).collect()
    }

    /// Converts a relative virtual address to a file offset.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if no section's raw data covers `rva`.
    pub fn rva_to_offset(&self, rva: u32) -> Result<usize> {
        for section in self.headers.sections(self.data()) {
            let section = section?;
            let Some(section_max) = section
                .virtual_address
                .checked_add(section.size_of_raw_data.min(section.mapped_size()))
            else {
                return Err(malformed_error!(
                    "Section malformed, causing integer overflow - {} + {}",
                    section.virtual_address,
                    section.size_of_raw_data
                ));
            };

            if section.virtual_address <= rva && section_max > rva {
                return Ok((rva - section.virtual_address) as usize
                    + section.pointer_to_raw_data as usize);
            }
        }

        Err(malformed_error!(
            "RVA could not be converted to offset - 0x{:X}",
            rva
        ))
    }
}

impl std::fmt::Debug for RawImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawImage")
            .field("len", &self.len())
            .field("headers", &self.headers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::{
        test::{image::ImageBuilder, TEXT_RVA},
        Error,
    };

    fn verify_image(image: &RawImage, expected_len: usize) {
        assert_eq!(image.len(), expected_len);
        assert!(!image.is_empty());
        assert_eq!(image.data_slice(0, 2).unwrap(), b"MZ");

        let sections = image.sections().unwrap();
        assert_eq!(sections[0].name(), ".text");
        assert_eq!(sections[0].virtual_address, TEXT_RVA);
        assert!(sections.iter().any(|section| section.name() == ".rdata"));
    }

    #[test]
    fn load_buffer() {
        let built = ImageBuilder::new().export("Only", 0).build();
        let image = RawImage::from_mem(built.bytes.clone()).unwrap();

        verify_image(&image, built.bytes.len());
        assert_eq!(image.imagebase(), built.image_base);
        assert_eq!(image.headers().size_of_image, built.size_of_image);
        assert!(image.headers().exports.is_some());
    }

    #[test]
    fn buffer_slice_bounds() {
        let built = ImageBuilder::new().build();
        let len = built.bytes.len();
        let image = RawImage::from_mem(built.bytes).unwrap();

        assert_eq!(image.data_slice(len, 0).unwrap(), &[] as &[u8]);
        assert!(matches!(image.data_slice(len - 1, 2), Err(Error::OutOfBounds { .. })));
        assert!(matches!(image.data_slice(usize::MAX, 1), Err(Error::OutOfBounds { .. })));
    }

    #[test]
    fn load_file() {
        let built = ImageBuilder::new().export("Only", 0).build();
        let path = std::env::temp_dir().join(format!("memmodule_{}_raw.dll", std::process::id()));
        std::fs::write(&path, &built.bytes).unwrap();

        let image = RawImage::from_file(&path).unwrap();
        verify_image(&image, built.bytes.len());
        assert_eq!(image.data(), built.bytes.as_slice());

        drop(image);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn load_invalid() {
        assert!(matches!(RawImage::from_mem(Vec::new()), Err(Error::Empty)));
        assert!(RawImage::from_mem(b"not an image at all".to_vec()).is_err());
        assert!(matches!(
            RawImage::from_file(&PathBuf::from("/nonexistent/plugin.dll")),
            Err(Error::FileError(_))
        ));
    }

    #[test]
    fn rva_to_offset() {
        let built = ImageBuilder::new().text(vec![0x90; 0x80]).build();
        let image = RawImage::from_mem(built.bytes.clone()).unwrap();

        let text = &image.sections().unwrap()[0];
        let offset = image.rva_to_offset(TEXT_RVA + 0x10).unwrap();
        assert_eq!(offset, text.pointer_to_raw_data as usize + 0x10);
        assert_eq!(image.data()[offset], 0x90);

        assert!(image.rva_to_offset(0x00FF_0000).is_err());
    }
}
