//! Base relocation processing.
//!
//! When an image lands anywhere but its preferred base, every absolute address the linker
//! baked into it is off by `actual_base - preferred_base`. The base relocation directory lists
//! where those addresses live as a sequence of blocks: a page-relative address and a byte size,
//! followed by packed 16-bit entries (4-bit kind, 12-bit offset into the page).
//!
//! [`apply`] walks the blocks and adds the delta to every listed location. The delta is always
//! applied, even when it is zero.

use log::{debug, trace};

use crate::{
    file::parser::Parser,
    loader::{headers::ImageHeaders, mapper::MappedImage, RelocationMode},
    Error, Result,
};

/// Base relocation kinds from the PE format.
mod reloc_type {
    /// No-op, used for padding a block to 32-bit alignment.
    pub const IMAGE_REL_BASED_ABSOLUTE: u16 = 0;
    /// Add the high 16 bits of the delta to a 16-bit field.
    pub const IMAGE_REL_BASED_HIGH: u16 = 1;
    /// Add the low 16 bits of the delta to a 16-bit field.
    pub const IMAGE_REL_BASED_LOW: u16 = 2;
    /// Add the delta to a 32-bit field.
    pub const IMAGE_REL_BASED_HIGHLOW: u16 = 3;
    /// Add the delta to a 64-bit field.
    pub const IMAGE_REL_BASED_DIR64: u16 = 10;
}

/// Size of a relocation block header (page RVA + block size).
const BLOCK_HEADER_SIZE: usize = 8;

/// Apply base relocations for the difference between where `image` was mapped and the
/// preferred base in `headers`.
///
/// Returns the number of fixups applied.
///
/// # Errors
///
/// - [`crate::Error::RelocationsStripped`] if the image has no relocation directory, was linked
///   with relocations stripped and did not land at its preferred base
/// - [`crate::Error::Malformed`] for a block shorter than its header or running past the
///   directory, and for fixups outside the image
/// - [`crate::Error::UnsupportedRelocation`] in [`RelocationMode::Typed`] for kinds other than
///   `ABSOLUTE`, `HIGH`, `LOW`, `HIGHLOW` and `DIR64`
pub fn apply(image: &mut MappedImage, headers: &ImageHeaders, mode: RelocationMode) -> Result<usize> {
    let actual = image.base().as_ptr() as u64;
    let delta = actual.wrapping_sub(headers.image_base);

    let Some(directory) = headers.relocations else {
        if delta != 0 && headers.relocations_stripped() {
            return Err(Error::RelocationsStripped);
        }

        debug!("No relocation directory, delta 0x{:X} left unapplied", delta);
        return Ok(0);
    };

    let table = image
        .bytes(directory.virtual_address as usize, directory.size as usize)?
        .to_vec();
    let mut parser = Parser::new(&table);
    let mut applied = 0_usize;

    while parser.remaining() >= BLOCK_HEADER_SIZE {
        let block_start = parser.pos();
        let page_rva = parser.read_le::<u32>()?;
        let block_size = parser.read_le::<u32>()? as usize;

        // Some linkers terminate the table with an empty block
        if page_rva == 0 && block_size == 0 {
            break;
        }

        let block_end = block_start.checked_add(block_size);
        if block_size < BLOCK_HEADER_SIZE || block_end.map_or(true, |end| end > table.len()) {
            return Err(malformed_error!(
                "Relocation block at RVA 0x{:X} has invalid size {}",
                directory.virtual_address as usize + block_start,
                block_size
            ));
        }

        let entries = (block_size - BLOCK_HEADER_SIZE) / 2;
        trace!(
            "Relocation block for page 0x{:X}, {} entries",
            page_rva,
            entries
        );

        for _ in 0..entries {
            let entry = parser.read_le::<u16>()?;
            let kind = entry >> 12;
            let rva = page_rva.wrapping_add(u32::from(entry & 0x0FFF));

            if kind == reloc_type::IMAGE_REL_BASED_ABSOLUTE {
                continue;
            }

            let fixed = match mode {
                RelocationMode::Typed => apply_typed(image, kind, rva, delta)?,
                RelocationMode::Compatible => {
                    add_pointer(image, rva, delta)?;
                    true
                }
            };
            if fixed {
                applied += 1;
            }
        }

        // Skip an odd trailing byte so the next block starts where the size says
        parser.advance_by(block_start + block_size - parser.pos())?;
    }

    debug!(
        "Applied {} relocations for delta 0x{:X} (preferred 0x{:X}, actual 0x{:X})",
        applied, delta, headers.image_base, actual
    );

    Ok(applied)
}

fn out_of_image(rva: u32) -> Error {
    malformed_error!("Relocation target RVA 0x{:X} is outside the image", rva)
}

/// Apply one entry of `kind`. Returns `false` for kinds that carry no fixup.
fn apply_typed(image: &mut MappedImage, kind: u16, rva: u32, delta: u64) -> Result<bool> {
    let offset = rva as usize;
    match kind {
        reloc_type::IMAGE_REL_BASED_HIGH => {
            let value = image.read::<u16>(offset).map_err(|_| out_of_image(rva))?;
            let high = (delta >> 16) as u16;
            image.write::<u16>(offset, value.wrapping_add(high))?;
        }
        reloc_type::IMAGE_REL_BASED_LOW => {
            let value = image.read::<u16>(offset).map_err(|_| out_of_image(rva))?;
            image.write::<u16>(offset, value.wrapping_add(delta as u16))?;
        }
        reloc_type::IMAGE_REL_BASED_HIGHLOW => {
            let value = image.read::<u32>(offset).map_err(|_| out_of_image(rva))?;
            image.write::<u32>(offset, value.wrapping_add(delta as u32))?;
        }
        reloc_type::IMAGE_REL_BASED_DIR64 => {
            let value = image.read::<u64>(offset).map_err(|_| out_of_image(rva))?;
            image.write::<u64>(offset, value.wrapping_add(delta))?;
        }
        _ => return Err(Error::UnsupportedRelocation { kind, rva }),
    }

    Ok(true)
}

/// Add `delta` to the host pointer-width word at `rva`, whatever the entry kind.
fn add_pointer(image: &mut MappedImage, rva: u32, delta: u64) -> Result<()> {
    let offset = rva as usize;
    let value = image.read::<usize>(offset).map_err(|_| out_of_image(rva))?;
    image.write::<usize>(offset, value.wrapping_add(delta as usize))
}
