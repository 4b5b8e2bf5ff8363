//! Import resolution.
//!
//! The import directory is an array of 20-byte descriptors, one per dependency, terminated by
//! a descriptor whose name reference is zero:
//!
//! | Offset | Field                                 |
//! |--------|---------------------------------------|
//! | 0      | OriginalFirstThunk (lookup table RVA) |
//! | 4      | TimeDateStamp                         |
//! | 8      | ForwarderChain                        |
//! | 12     | Name (library name RVA)               |
//! | 16     | FirstThunk (address table RVA)        |
//!
//! Each dependency is loaded through the host's ordinary library loader. Its lookup entries
//! are pointer-sized: with the top bit set the low 16 bits are an ordinal, otherwise the entry
//! is the RVA of a 2-byte hint followed by the symbol name. The resolved address overwrites
//! the matching slot of the address table.

use std::ffi::CString;

use log::{debug, trace, warn};

use crate::{
    host::{ImportName, LibraryLoader},
    loader::{headers::ImageHeaders, mapper::MappedImage, ImportPolicy},
    Error, Result,
};

/// Size of one import descriptor.
const SIZEOF_IMPORT_DESCRIPTOR: usize = 20;

/// A decoded import descriptor.
#[derive(Clone, Copy, Debug)]
struct ImportDescriptor {
    original_first_thunk: u32,
    time_date_stamp: u32,
    name: u32,
    first_thunk: u32,
}

impl ImportDescriptor {
    fn read(image: &MappedImage, rva: usize) -> Result<ImportDescriptor> {
        Ok(ImportDescriptor {
            original_first_thunk: image.read::<u32>(rva)?,
            time_date_stamp: image.read::<u32>(rva + 4)?,
            name: image.read::<u32>(rva + 12)?,
            first_thunk: image.read::<u32>(rva + 16)?,
        })
    }

    /// The table lookup entries are read from.
    ///
    /// A zero timestamp means the address table was never bound and still holds the lookup
    /// entries; otherwise they come from the original table, if there is one.
    fn source_table(&self) -> u32 {
        if self.time_date_stamp == 0 || self.original_first_thunk == 0 {
            self.first_thunk
        } else {
            self.original_first_thunk
        }
    }

    /// Both thunk tables must exist and lie past the header copy.
    fn check_tables(&self, rva: usize, headers: &ImageHeaders) -> Result<()> {
        if self.first_thunk == 0 {
            return Err(malformed_error!(
                "Import descriptor at 0x{:X} has no address table",
                rva
            ));
        }

        let lowest = self.first_thunk.min(self.source_table());
        if lowest < headers.size_of_headers {
            return Err(malformed_error!(
                "Import descriptor at 0x{:X} points into the headers - 0x{:X}",
                rva,
                lowest
            ));
        }

        Ok(())
    }
}

/// Load every dependency named in the import directory and patch the address tables.
///
/// Each acquired library handle is pushed to `libraries` as soon as it is loaded, so the
/// caller can release them even if a later import fails. Returns the number of address-table
/// slots written.
///
/// # Errors
///
/// - [`crate::Error::LibraryNotFound`] / [`crate::Error::ImportNotFound`] under
///   [`ImportPolicy::Eager`]
/// - [`crate::Error::OutOfBounds`] / [`crate::Error::Malformed`] for tables or names outside
///   the image, or a descriptor without an address table or with tables inside the headers
pub fn resolve<H: LibraryLoader>(
    host: &H,
    image: &mut MappedImage,
    headers: &ImageHeaders,
    policy: ImportPolicy,
    libraries: &mut Vec<H::Library>,
) -> Result<usize> {
    let Some(directory) = headers.imports else {
        return Ok(0);
    };

    let pointer_size = headers.pointer_size();
    let ordinal_flag = 1_u64 << (pointer_size * 8 - 1);
    let mut patched = 0_usize;
    let mut descriptor_rva = directory.virtual_address as usize;

    loop {
        let descriptor = ImportDescriptor::read(image, descriptor_rva)?;
        if descriptor.name == 0 {
            break;
        }
        descriptor.check_tables(descriptor_rva, headers)?;
        descriptor_rva += SIZEOF_IMPORT_DESCRIPTOR;

        let library_name: CString = image.c_str(descriptor.name as usize)?.to_owned();
        let display_name = library_name.to_string_lossy().into_owned();
        let source = descriptor.source_table() as usize;
        let target = descriptor.first_thunk as usize;

        let library = match host.load_library(&library_name) {
            Ok(library) => library,
            Err(error) => {
                if policy == ImportPolicy::Eager {
                    return Err(error);
                }

                warn!("Dependency '{}' not loaded, nulling its imports: {}", display_name, error);
                let mut index = 0;
                while image.read_pointer(source + index * pointer_size, headers.is_64)? != 0 {
                    image.write_pointer(target + index * pointer_size, headers.is_64, 0)?;
                    index += 1;
                }
                continue;
            }
        };
        libraries.push(library);
        let library = &libraries[libraries.len() - 1];

        debug!(
            "Resolving imports from '{}' (lookup 0x{:X}, address table 0x{:X})",
            display_name, source, target
        );

        let mut index = 0;
        loop {
            let entry = image.read_pointer(source + index * pointer_size, headers.is_64)?;
            if entry == 0 {
                break;
            }

            let (address, import) = {
                let import = if entry & ordinal_flag != 0 {
                    ImportName::Ordinal(entry as u16)
                } else {
                    // Skip the 2-byte hint in front of the name
                    let name_rva = (entry & 0x7FFF_FFFF) as usize + 2;
                    ImportName::Name(image.c_str(name_rva)?)
                };
                (host.symbol(library, import), import.to_string())
            };

            let address = match address {
                Some(address) => address,
                None if policy == ImportPolicy::Eager => {
                    return Err(Error::ImportNotFound {
                        library: display_name,
                        import,
                    });
                }
                None => {
                    warn!("'{}' does not provide '{}', slot left null", display_name, import);
                    0
                }
            };

            trace!("{}!{} -> 0x{:X}", display_name, import, address);
            image.write_pointer(target + index * pointer_size, headers.is_64, address as u64)?;
            patched += 1;
            index += 1;
        }
    }

    Ok(patched)
}
