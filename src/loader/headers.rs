//! Header-chain parsing for PE/COFF library images.
//!
//! [`ImageHeaders::parse`] walks the DOS header, the `PE\0\0` signature, the COFF file header
//! and the optional header of an on-disk image and condenses them into a small `Copy` summary:
//! where the section table lives, how large the mapped image is, the preferred base address,
//! the entry point and the three data directories the loader consumes (exports, imports and
//! base relocations).
//!
//! Parsing never allocates and never mutates the input. Every offset and size the image
//! describes about itself is validated here, so later stages can rely on the summary being
//! consistent with the buffer it was parsed from.
//!
//! The DOS and COFF headers are decoded with `goblin`; the optional header and the section
//! table are read field by field with [`crate::file::io`] so that only the fields the loader
//! needs are touched.

use goblin::pe::{
    characteristic::IMAGE_FILE_RELOCS_STRIPPED,
    header::{CoffHeader, DosHeader, PE_MAGIC, SIZEOF_COFF_HEADER},
    optional_header::{MAGIC_32, MAGIC_64},
    section_table::IMAGE_SCN_MEM_EXECUTE,
};

use crate::{
    file::{io::read_le_at, parser::Parser},
    Error, Result,
};

/// Size of one entry in the section table.
pub const SIZEOF_SECTION_HEADER: usize = 40;

/// Size of one data directory entry (RVA + size).
const SIZEOF_DATA_DIRECTORY: usize = 8;

/// Index of the export directory in the data directory array.
const DIRECTORY_EXPORT: usize = 0;
/// Index of the import directory in the data directory array.
const DIRECTORY_IMPORT: usize = 1;
/// Index of the base relocation directory in the data directory array.
const DIRECTORY_BASE_RELOCATION: usize = 5;

/// Field offsets inside the optional header that differ between PE32 and PE32+.
struct OptionalLayout {
    image_base: usize,
    number_of_rva_and_sizes: usize,
    data_directories: usize,
}

const LAYOUT_PE32: OptionalLayout = OptionalLayout {
    image_base: 28,
    number_of_rva_and_sizes: 92,
    data_directories: 96,
};

const LAYOUT_PE32_PLUS: OptionalLayout = OptionalLayout {
    image_base: 24,
    number_of_rva_and_sizes: 108,
    data_directories: 112,
};

// Offsets shared by both optional header formats
const OFFSET_ENTRY_POINT: usize = 16;
const OFFSET_SECTION_ALIGNMENT: usize = 32;
const OFFSET_SIZE_OF_IMAGE: usize = 56;
const OFFSET_SIZE_OF_HEADERS: usize = 60;

/// COFF machine type of the running host, `None` when the host has no PE machine type.
#[cfg(target_arch = "x86_64")]
pub const HOST_MACHINE: Option<u16> = Some(goblin::pe::header::COFF_MACHINE_X86_64);
/// COFF machine type of the running host, `None` when the host has no PE machine type.
#[cfg(target_arch = "x86")]
pub const HOST_MACHINE: Option<u16> = Some(goblin::pe::header::COFF_MACHINE_X86);
/// COFF machine type of the running host, `None` when the host has no PE machine type.
#[cfg(target_arch = "aarch64")]
pub const HOST_MACHINE: Option<u16> = Some(goblin::pe::header::COFF_MACHINE_ARM64);
/// COFF machine type of the running host, `None` when the host has no PE machine type.
#[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
pub const HOST_MACHINE: Option<u16> = None;

/// Location of a data directory inside the mapped image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataDirectory {
    /// Relative virtual address of the directory
    pub virtual_address: u32,
    /// Size of the directory in bytes
    pub size: u32,
}

impl DataDirectory {
    /// Relative address one past the end of the directory.
    #[must_use]
    pub fn end(&self) -> u64 {
        u64::from(self.virtual_address) + u64::from(self.size)
    }

    /// Returns `true` if `rva` falls inside the directory.
    #[must_use]
    pub fn contains(&self, rva: u32) -> bool {
        rva >= self.virtual_address && u64::from(rva) < self.end()
    }
}

/// One entry of the section table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SectionHeader {
    /// Raw, NUL-padded section name
    pub name: [u8; 8],
    /// Size of the section once mapped
    pub virtual_size: u32,
    /// Relative address of the section once mapped
    pub virtual_address: u32,
    /// Size of the initialized data in the file
    pub size_of_raw_data: u32,
    /// File offset of the initialized data
    pub pointer_to_raw_data: u32,
    /// Section characteristic flags
    pub characteristics: u32,
}

impl SectionHeader {
    /// Decode a section header from a parser positioned at its first byte.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if fewer than 40 bytes remain.
    pub fn read(parser: &mut Parser<'_>) -> Result<SectionHeader> {
        parser.ensure_remaining(SIZEOF_SECTION_HEADER)?;

        let mut name = [0_u8; 8];
        name.copy_from_slice(parser.read_bytes(8)?);
        let virtual_size = parser.read_le::<u32>()?;
        let virtual_address = parser.read_le::<u32>()?;
        let size_of_raw_data = parser.read_le::<u32>()?;
        let pointer_to_raw_data = parser.read_le::<u32>()?;
        // PointerToRelocations, PointerToLinenumbers, NumberOfRelocations, NumberOfLinenumbers
        parser.advance_by(12)?;
        let characteristics = parser.read_le::<u32>()?;

        Ok(SectionHeader {
            name,
            virtual_size,
            virtual_address,
            size_of_raw_data,
            pointer_to_raw_data,
            characteristics,
        })
    }

    /// The section name with trailing NUL padding removed.
    ///
    /// Names that are not valid UTF-8 are returned as an empty string.
    #[must_use]
    pub fn name(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(8);
        std::str::from_utf8(&self.name[..end]).unwrap_or_default()
    }

    /// Number of bytes the section occupies once mapped.
    ///
    /// Sections that declare a zero virtual size occupy their raw size.
    #[must_use]
    pub fn mapped_size(&self) -> u32 {
        if self.virtual_size == 0 {
            self.size_of_raw_data
        } else {
            self.virtual_size
        }
    }

    /// Returns `true` if the section is marked executable.
    #[must_use]
    pub fn is_code(&self) -> bool {
        self.characteristics & IMAGE_SCN_MEM_EXECUTE != 0
    }
}

/// Condensed, validated view of an image's header chain.
///
/// Produced by [`ImageHeaders::parse`]. The struct holds no references into the buffer it was
/// parsed from; methods that need the section table take that buffer again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageHeaders {
    /// File offset of the `PE\0\0` signature (`e_lfanew`)
    pub nt_offset: usize,
    /// COFF machine type
    pub machine: u16,
    /// COFF characteristics flags
    pub characteristics: u16,
    /// `true` for PE32+ images
    pub is_64: bool,
    /// Number of entries in the section table
    pub number_of_sections: u16,
    /// File offset of the first section header
    pub section_table_offset: usize,
    /// Section alignment declared by the optional header
    pub section_alignment: u32,
    /// Total size of the mapped image
    pub size_of_image: u32,
    /// Size of the header region copied verbatim to the image base
    pub size_of_headers: u32,
    /// Preferred base address
    pub image_base: u64,
    /// Relative address of the entry point, 0 when the image has none
    pub entry_point: u32,
    /// Export directory, if present
    pub exports: Option<DataDirectory>,
    /// Import directory, if present
    pub imports: Option<DataDirectory>,
    /// Base relocation directory, if present
    pub relocations: Option<DataDirectory>,
}

impl ImageHeaders {
    /// Parse and validate the header chain of an on-disk image.
    ///
    /// Besides structural consistency this checks that the image can run on the current host:
    /// its machine type must match the host architecture and its optional header format must
    /// match the host pointer width.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::Empty`] for an empty buffer
    /// - [`crate::Error::GoblinErr`] if the DOS or COFF header cannot be decoded
    /// - [`crate::Error::ArchitectureMismatch`] for images built for another machine
    /// - [`crate::Error::NotSupported`] for an optional header of the wrong pointer width
    /// - [`crate::Error::Malformed`] for any inconsistent offset or size
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use memmodule::ImageHeaders;
    ///
    /// let bytes = std::fs::read("plugin.dll")?;
    /// let headers = ImageHeaders::parse(&bytes)?;
    /// println!("Preferred base 0x{:X}, {} bytes mapped", headers.image_base, headers.size_of_image);
    /// for section in headers.sections(&bytes) {
    ///     let section = section?;
    ///     println!("{:8} RVA 0x{:08X}", section.name(), section.virtual_address);
    /// }
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn parse(data: &[u8]) -> Result<ImageHeaders> {
        if data.is_empty() {
            return Err(Error::Empty);
        }

        let dos = DosHeader::parse(data)?;
        let nt_offset = dos.pe_pointer as usize;

        let mut offset = nt_offset;
        let signature = read_le_at::<u32>(data, &mut offset)
            .map_err(|_| malformed_error!("PE signature offset 0x{:X} is outside the image", nt_offset))?;
        if signature != PE_MAGIC {
            return Err(malformed_error!("Invalid PE signature 0x{:08X}", signature));
        }

        let coff = CoffHeader::parse(data, &mut offset)?;
        if let Some(host) = HOST_MACHINE {
            if coff.machine != host {
                return Err(Error::ArchitectureMismatch {
                    machine: coff.machine,
                });
            }
        }

        let optional_offset = nt_offset + 4 + SIZEOF_COFF_HEADER;
        let optional_size = usize::from(coff.size_of_optional_header);
        let Some(optional) = data.get(optional_offset..optional_offset.saturating_add(optional_size))
        else {
            return Err(malformed_error!(
                "Optional header ({} bytes) exceeds the image",
                optional_size
            ));
        };

        let magic = read_le_at::<u16>(optional, &mut 0)
            .map_err(|_| malformed_error!("Image has no optional header"))?;
        let (is_64, layout) = match magic {
            MAGIC_64 => (true, &LAYOUT_PE32_PLUS),
            MAGIC_32 => (false, &LAYOUT_PE32),
            _ => return Err(malformed_error!("Invalid optional header magic 0x{:04X}", magic)),
        };
        if is_64 != cfg!(target_pointer_width = "64") {
            return Err(Error::NotSupported);
        }

        let field = |at: usize| -> Result<u32> {
            read_le_at::<u32>(optional, &mut { at })
                .map_err(|_| malformed_error!("Optional header truncated at offset {}", at))
        };

        let entry_point = field(OFFSET_ENTRY_POINT)?;
        let section_alignment = field(OFFSET_SECTION_ALIGNMENT)?;
        let size_of_image = field(OFFSET_SIZE_OF_IMAGE)?;
        let size_of_headers = field(OFFSET_SIZE_OF_HEADERS)?;
        let image_base = if is_64 {
            read_le_at::<u64>(optional, &mut { layout.image_base })
                .map_err(|_| malformed_error!("Optional header truncated at ImageBase"))?
        } else {
            u64::from(field(layout.image_base)?)
        };

        if size_of_image == 0 {
            return Err(malformed_error!("SizeOfImage is zero"));
        }
        if size_of_headers as usize > data.len() || size_of_headers > size_of_image {
            return Err(malformed_error!(
                "SizeOfHeaders 0x{:X} exceeds the image (file 0x{:X}, image 0x{:X})",
                size_of_headers,
                data.len(),
                size_of_image
            ));
        }
        if entry_point >= size_of_image {
            return Err(malformed_error!(
                "Entry point 0x{:X} is outside SizeOfImage 0x{:X}",
                entry_point,
                size_of_image
            ));
        }

        let section_table_offset = optional_offset + optional_size;
        let section_table_end = section_table_offset
            + usize::from(coff.number_of_sections) * SIZEOF_SECTION_HEADER;
        if section_table_end > data.len() {
            return Err(malformed_error!(
                "Section table of {} entries exceeds the file",
                coff.number_of_sections
            ));
        }

        // Directories past NumberOfRvaAndSizes do not exist, even if the header has room
        let directory_count = field(layout.number_of_rva_and_sizes).unwrap_or(0) as usize;
        let directory = |index: usize| -> Result<Option<DataDirectory>> {
            if index >= directory_count {
                return Ok(None);
            }

            let mut offset = layout.data_directories + index * SIZEOF_DATA_DIRECTORY;
            let (Ok(virtual_address), Ok(size)) = (
                read_le_at::<u32>(optional, &mut offset),
                read_le_at::<u32>(optional, &mut offset),
            ) else {
                return Ok(None);
            };

            if virtual_address == 0 || size == 0 {
                return Ok(None);
            }

            let directory = DataDirectory {
                virtual_address,
                size,
            };
            if directory.end() > u64::from(size_of_image) {
                return Err(malformed_error!(
                    "Data directory {} (0x{:X}+0x{:X}) exceeds SizeOfImage 0x{:X}",
                    index,
                    virtual_address,
                    size,
                    size_of_image
                ));
            }

            Ok(Some(directory))
        };

        Ok(ImageHeaders {
            nt_offset,
            machine: coff.machine,
            characteristics: coff.characteristics,
            is_64,
            number_of_sections: coff.number_of_sections,
            section_table_offset,
            section_alignment,
            size_of_image,
            size_of_headers,
            image_base,
            entry_point,
            exports: directory(DIRECTORY_EXPORT)?,
            imports: directory(DIRECTORY_IMPORT)?,
            relocations: directory(DIRECTORY_BASE_RELOCATION)?,
        })
    }

    /// Iterate over the section table of `data`, which must be the buffer these headers were
    /// parsed from.
    pub fn sections<'a>(&self, data: &'a [u8]) -> Sections<'a> {
        let start = self.section_table_offset.min(data.len());
        Sections {
            parser: Parser::new(&data[start..]),
            remaining: self.number_of_sections,
        }
    }

    /// Returns `true` if the linker stripped base relocations from the image.
    #[must_use]
    pub fn relocations_stripped(&self) -> bool {
        self.characteristics & IMAGE_FILE_RELOCS_STRIPPED != 0
    }

    /// Width in bytes of pointer-sized fields (thunks, `DIR64` fixups).
    #[must_use]
    pub fn pointer_size(&self) -> usize {
        if self.is_64 {
            8
        } else {
            4
        }
    }
}

/// Iterator over the section headers of an image.
///
/// Yields an error and stops if an entry cannot be read.
pub struct Sections<'a> {
    parser: Parser<'a>,
    remaining: u16,
}

impl Iterator for Sections<'_> {
    type Item = Result<SectionHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        match SectionHeader::read(&mut self.parser) {
            Ok(section) => {
                self.remaining -= 1;
                Some(Ok(section))
            }
            Err(error) => {
                self.remaining = 0;
                Some(Err(error))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(usize::from(self.remaining)))
    }
}
