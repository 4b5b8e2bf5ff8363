//! Section mapping and the bounds-checked view over a mapped image.
//!
//! [`map`] copies the header region and every section of an on-disk image into a region
//! obtained from the host, laid out by relative virtual address. All later stages touch the
//! region exclusively through [`MappedImage`], whose accessors take relative addresses and
//! fail with [`crate::Error::OutOfBounds`] instead of reading or writing past the region.

use std::{ffi::CStr, ptr::NonNull};

use log::{debug, trace};

use crate::{
    file::io::{read_le, write_le, ImageIO},
    loader::headers::ImageHeaders,
    Result,
};

/// A (base, length) view over the memory region an image is mapped into.
///
/// The view does not own the region; [`crate::LoadedModule`] releases it.
#[derive(Debug)]
pub struct MappedImage {
    base: NonNull<u8>,
    size: usize,
}

impl MappedImage {
    /// Wrap an existing region.
    ///
    /// # Safety
    /// `base` must point to `size` bytes that are readable and writable for as long as the
    /// view exists, and that nothing else accesses while it is borrowed mutably.
    pub(crate) unsafe fn new(base: NonNull<u8>, size: usize) -> MappedImage {
        MappedImage { base, size }
    }

    /// First byte of the region.
    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Size of the region in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Returns `true` for a zero-sized region.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Absolute address of `rva`. Does not check that `rva` lies inside the region.
    #[must_use]
    pub fn address(&self, rva: u32) -> usize {
        (self.base.as_ptr() as usize).wrapping_add(rva as usize)
    }

    fn check(&self, rva: usize, len: usize) -> Result<()> {
        match rva.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(out_of_bounds_error!()),
        }
    }

    /// The whole region as a byte slice.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.size) }
    }

    /// `len` bytes starting at `rva`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range leaves the region.
    pub fn bytes(&self, rva: usize, len: usize) -> Result<&[u8]> {
        self.check(rva, len)?;
        Ok(unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(rva), len) })
    }

    /// Mutable `len` bytes starting at `rva`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range leaves the region.
    pub fn bytes_mut(&mut self, rva: usize, len: usize) -> Result<&mut [u8]> {
        self.check(rva, len)?;
        Ok(unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr().add(rva), len) })
    }

    /// Read a little-endian value at `rva`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the value does not fit the region.
    pub fn read<T: ImageIO>(&self, rva: usize) -> Result<T> {
        read_le(self.bytes(rva, std::mem::size_of::<T>())?)
    }

    /// Write a little-endian value at `rva`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the value does not fit the region.
    pub fn write<T: ImageIO>(&mut self, rva: usize, value: T) -> Result<()> {
        write_le(self.bytes_mut(rva, std::mem::size_of::<T>())?, value)
    }

    /// Read a pointer-sized field (4 or 8 bytes) at `rva`, widened to `u64`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the field does not fit the region.
    pub fn read_pointer(&self, rva: usize, is_64: bool) -> Result<u64> {
        if is_64 {
            self.read::<u64>(rva)
        } else {
            self.read::<u32>(rva).map(u64::from)
        }
    }

    /// Write a pointer-sized field (4 or 8 bytes) at `rva`, truncating `value` for 4 bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the field does not fit the region.
    pub fn write_pointer(&mut self, rva: usize, is_64: bool, value: u64) -> Result<()> {
        if is_64 {
            self.write::<u64>(rva, value)
        } else {
            self.write::<u32>(rva, value as u32)
        }
    }

    /// NUL-terminated string starting at `rva`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `rva` is outside the region and
    /// [`crate::Error::Malformed`] if the string runs off its end.
    pub fn c_str(&self, rva: usize) -> Result<&CStr> {
        let tail = self.bytes(rva, self.size.saturating_sub(rva))?;
        CStr::from_bytes_until_nul(tail)
            .map_err(|_| malformed_error!("Unterminated string at RVA 0x{:X}", rva))
    }
}

/// A section as it was placed into the mapped image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadedSection {
    /// Section name without NUL padding
    pub name: String,
    /// Relative address of the section
    pub virtual_address: u32,
    /// Declared virtual size
    pub virtual_size: u32,
    /// Size of initialized data in the file
    pub raw_size: u32,
    /// Section characteristic flags
    pub characteristics: u32,
}

impl LoadedSection {
    /// Returns `true` if the section is marked executable.
    #[must_use]
    pub fn is_code(&self) -> bool {
        self.characteristics & goblin::pe::section_table::IMAGE_SCN_MEM_EXECUTE != 0
    }
}

/// Copy headers and sections from `data` into `image`.
///
/// The header region is copied verbatim. Each section's in-memory extent (its virtual size, or
/// its raw size when the virtual size is zero) is zeroed and then receives
/// `min(extent, raw size)` bytes of payload, so zero-fill past the raw data is guaranteed.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if a section's extent leaves the image or its payload
/// leaves the input buffer.
pub fn map(
    data: &[u8],
    headers: &ImageHeaders,
    image: &mut MappedImage,
) -> Result<Vec<LoadedSection>> {
    let header_size = headers.size_of_headers as usize;
    let Some(header_region) = data.get(..header_size) else {
        return Err(malformed_error!(
            "SizeOfHeaders 0x{:X} exceeds the input",
            header_size
        ));
    };
    image.bytes_mut(0, header_size)?.copy_from_slice(header_region);

    let mut sections = Vec::with_capacity(usize::from(headers.number_of_sections));
    for section in headers.sections(data) {
        let section = section?;
        let extent = section.mapped_size() as usize;
        let rva = section.virtual_address as usize;

        let Ok(target) = image.bytes_mut(rva, extent) else {
            return Err(malformed_error!(
                "Section '{}' (0x{:X}+0x{:X}) exceeds SizeOfImage 0x{:X}",
                section.name(),
                rva,
                extent,
                headers.size_of_image
            ));
        };
        target.fill(0);

        let copy_len = extent.min(section.size_of_raw_data as usize);
        if copy_len > 0 {
            let raw = section.pointer_to_raw_data as usize;
            let Some(payload) = raw.checked_add(copy_len).and_then(|end| data.get(raw..end)) else {
                return Err(malformed_error!(
                    "Section '{}' raw data (0x{:X}+0x{:X}) exceeds the input",
                    section.name(),
                    raw,
                    copy_len
                ));
            };
            target[..copy_len].copy_from_slice(payload);
        }

        trace!(
            "Mapped section '{}' at RVA 0x{:X} ({} of {} bytes from file)",
            section.name(),
            rva,
            copy_len,
            extent
        );

        sections.push(LoadedSection {
            name: section.name().to_string(),
            virtual_address: section.virtual_address,
            virtual_size: section.virtual_size,
            raw_size: section.size_of_raw_data,
            characteristics: section.characteristics,
        });
    }

    debug!(
        "Mapped {} sections into 0x{:X} bytes at {:p}",
        sections.len(),
        image.len(),
        image.base()
    );

    Ok(sections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test::{
            image::{patch_u32, ImageBuilder, SECTION_TABLE_OFFSET},
            scratch_image, TEXT_RVA,
        },
        Error,
    };

    #[test]
    fn view_bounds() {
        let mut buffer = vec![0_u8; 64];
        let mut image = scratch_image(&mut buffer);

        image.write::<u32>(60, 0xDEAD_BEEF).unwrap();
        assert_eq!(image.read::<u32>(60).unwrap(), 0xDEAD_BEEF);
        assert!(matches!(
            image.read::<u64>(60),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(image.write::<u8>(64, 1).is_err());
        assert!(image.bytes(usize::MAX, 2).is_err());
        assert_eq!(image.bytes(64, 0).unwrap().len(), 0);

        image.write_pointer(0, false, 0x1_2345_6789).unwrap();
        assert_eq!(image.read_pointer(0, false).unwrap(), 0x2345_6789);
        image.write_pointer(8, true, 0x1_2345_6789).unwrap();
        assert_eq!(image.read_pointer(8, true).unwrap(), 0x1_2345_6789);
    }

    #[test]
    fn view_strings() {
        let mut buffer = b"\0\0KERNEL32.dll\0tail".to_vec();
        let image = scratch_image(&mut buffer);

        assert_eq!(image.c_str(2).unwrap().to_bytes(), b"KERNEL32.dll");
        assert!(matches!(image.c_str(15), Err(Error::Malformed { .. })));
        assert!(image.c_str(100).is_err());
    }

    #[test]
    fn map_headers_and_sections() {
        let built = ImageBuilder::new()
            .text(vec![0xAB; 0x20])
            .section(".data", vec![0x11; 8], 0x100)
            .build();
        let headers = ImageHeaders::parse(&built.bytes).unwrap();

        let mut buffer = vec![0xEE_u8; headers.size_of_image as usize];
        let mut image = scratch_image(&mut buffer);
        let sections = map(&built.bytes, &headers, &mut image).unwrap();

        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].name, ".text");
        assert!(sections[0].is_code());
        assert_eq!(sections[1].name, ".data");

        // Headers are copied verbatim
        assert_eq!(image.bytes(0, 0x400).unwrap(), &built.bytes[..0x400]);

        // Payload, then zero fill up to the virtual size
        let text = image.bytes(TEXT_RVA as usize, 0x20).unwrap();
        assert!(text.iter().all(|&b| b == 0xAB));

        let data_rva = built.section_rvas[1] as usize;
        let data = image.bytes(data_rva, 0x100).unwrap();
        assert!(data[..8].iter().all(|&b| b == 0x11));
        assert!(data[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn map_raw_larger_than_virtual() {
        // File alignment pads raw data to 0x200, but only the virtual size is copied
        let built = ImageBuilder::new()
            .section(".data", vec![0x22; 0x80], 0x10)
            .build();
        let headers = ImageHeaders::parse(&built.bytes).unwrap();

        let mut buffer = vec![0xEE_u8; headers.size_of_image as usize];
        let mut image = scratch_image(&mut buffer);
        map(&built.bytes, &headers, &mut image).unwrap();

        let data_rva = built.section_rvas[1] as usize;
        assert!(image.bytes(data_rva, 0x10).unwrap().iter().all(|&b| b == 0x22));
        // Not part of any section extent, so the pre-existing content is untouched
        assert_eq!(image.read::<u8>(data_rva + 0x10).unwrap(), 0xEE);
    }

    #[test]
    fn map_zero_virtual_size_uses_raw_size() {
        let built = ImageBuilder::new()
            .section(".data", vec![0x33; 0x10], 0)
            .build();
        let headers = ImageHeaders::parse(&built.bytes).unwrap();

        let mut buffer = vec![0_u8; headers.size_of_image as usize];
        let mut image = scratch_image(&mut buffer);
        let sections = map(&built.bytes, &headers, &mut image).unwrap();

        assert_eq!(sections[1].virtual_size, 0);
        let data_rva = built.section_rvas[1] as usize;
        // Raw size is the file-aligned 0x200, of which 0x10 bytes are payload
        assert!(image.bytes(data_rva, 0x10).unwrap().iter().all(|&b| b == 0x33));
        assert!(image.bytes(data_rva + 0x10, 0x1F0).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn map_section_outside_image() {
        let mut built = ImageBuilder::new().text(vec![0xC3; 0x10]).build();
        // Move .text past SizeOfImage
        patch_u32(&mut built.bytes, SECTION_TABLE_OFFSET + 12, 0x8000);
        let headers = ImageHeaders::parse(&built.bytes).unwrap();

        let mut buffer = vec![0_u8; headers.size_of_image as usize];
        let mut image = scratch_image(&mut buffer);
        assert!(matches!(
            map(&built.bytes, &headers, &mut image),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn map_payload_outside_input() {
        let mut built = ImageBuilder::new().text(vec![0xC3; 0x10]).build();
        patch_u32(&mut built.bytes, SECTION_TABLE_OFFSET + 20, 0x00FF_0000);
        let headers = ImageHeaders::parse(&built.bytes).unwrap();

        let mut buffer = vec![0_u8; headers.size_of_image as usize];
        let mut image = scratch_image(&mut buffer);
        assert!(matches!(
            map(&built.bytes, &headers, &mut image),
            Err(Error::Malformed { .. })
        ));
    }
}
