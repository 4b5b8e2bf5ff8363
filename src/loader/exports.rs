//! Export lookup on a mapped image.
//!
//! The export directory holds three parallel-ish tables: the function table (RVAs indexed by
//! `ordinal - base`), the name table (RVAs of NUL-terminated names) and the name-ordinal table
//! (16-bit function-table indices, one per name). A by-name lookup finds the name's position
//! `i`, reads index `j` from the name-ordinal table at `i`, and returns the base address plus
//! the function table entry at `j`.
//!
//! Lookups never fail loudly: a missing name, an out-of-range index, an unreadable entry, a
//! zero function RVA or a forwarded export all produce `None`.

use log::{debug, warn};

use crate::{
    loader::{
        headers::{DataDirectory, ImageHeaders},
        mapper::MappedImage,
    },
    Result,
};

/// A named export of a loaded module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Export {
    /// Exported name
    pub name: String,
    /// Export ordinal (ordinal base + function index)
    pub ordinal: u32,
    /// Absolute address inside the module
    pub address: usize,
}

/// Decoded fields of the export directory.
#[derive(Clone, Copy, Debug)]
struct ExportDirectory {
    location: DataDirectory,
    base: u32,
    number_of_functions: u32,
    number_of_names: u32,
    address_of_functions: u32,
    address_of_names: u32,
    address_of_name_ordinals: u32,
}

impl ExportDirectory {
    fn read(image: &MappedImage, headers: &ImageHeaders) -> Option<ExportDirectory> {
        let location = headers.exports?;
        let rva = location.virtual_address as usize;

        let read = || -> Result<ExportDirectory> {
            Ok(ExportDirectory {
                location,
                base: image.read::<u32>(rva + 16)?,
                number_of_functions: image.read::<u32>(rva + 20)?,
                number_of_names: image.read::<u32>(rva + 24)?,
                address_of_functions: image.read::<u32>(rva + 28)?,
                address_of_names: image.read::<u32>(rva + 32)?,
                address_of_name_ordinals: image.read::<u32>(rva + 36)?,
            })
        };

        match read() {
            Ok(directory) => Some(directory),
            Err(error) => {
                warn!("Unreadable export directory at RVA 0x{:X}: {}", rva, error);
                None
            }
        }
    }

    /// Name at position `index` of the name table.
    fn name<'a>(&self, image: &'a MappedImage, index: u32) -> Result<&'a [u8]> {
        let entry = self.address_of_names as usize + index as usize * 4;
        let rva = image.read::<u32>(entry)?;
        Ok(image.c_str(rva as usize)?.to_bytes())
    }

    /// Function table index recorded for name position `index`.
    fn name_ordinal(&self, image: &MappedImage, index: u32) -> Result<u32> {
        let entry = self.address_of_name_ordinals as usize + index as usize * 2;
        image.read::<u16>(entry).map(u32::from)
    }

    /// Absolute address for function table `index`, `None` if the slot holds no usable code.
    fn function(&self, image: &MappedImage, index: u32) -> Option<usize> {
        if index >= self.number_of_functions {
            warn!(
                "Export function index {} out of range ({} functions)",
                index, self.number_of_functions
            );
            return None;
        }

        let entry = self.address_of_functions as usize + index as usize * 4;
        let rva = match image.read::<u32>(entry) {
            Ok(rva) => rva,
            Err(error) => {
                warn!("Unreadable export function entry {}: {}", index, error);
                return None;
            }
        };

        if rva == 0 {
            return None;
        }
        if self.location.contains(rva) {
            debug!("Export {} is forwarded, not resolving", index);
            return None;
        }
        if rva as usize >= image.len() {
            warn!("Export {} points outside the image (RVA 0x{:X})", index, rva);
            return None;
        }

        Some(image.address(rva))
    }
}

/// Address of the export called `name`, matched case-sensitively.
#[must_use]
pub fn resolve(image: &MappedImage, headers: &ImageHeaders, name: &str) -> Option<usize> {
    let directory = ExportDirectory::read(image, headers)?;

    for index in 0..directory.number_of_names {
        let candidate = match directory.name(image, index) {
            Ok(candidate) => candidate,
            Err(error) => {
                warn!("Unreadable export name {}: {}", index, error);
                return None;
            }
        };

        if candidate == name.as_bytes() {
            let function = match directory.name_ordinal(image, index) {
                Ok(function) => function,
                Err(error) => {
                    warn!("Unreadable export ordinal {}: {}", index, error);
                    return None;
                }
            };
            return directory.function(image, function);
        }
    }

    None
}

/// Address of the export with the given `ordinal`.
#[must_use]
pub fn resolve_ordinal(image: &MappedImage, headers: &ImageHeaders, ordinal: u32) -> Option<usize> {
    let directory = ExportDirectory::read(image, headers)?;
    let index = ordinal.checked_sub(directory.base)?;
    directory.function(image, index)
}

/// Every named export that resolves to an address, in name-table order.
#[must_use]
pub fn exports(image: &MappedImage, headers: &ImageHeaders) -> Vec<Export> {
    let Some(directory) = ExportDirectory::read(image, headers) else {
        return Vec::new();
    };

    (0..directory.number_of_names)
        .filter_map(|index| {
            let name = directory.name(image, index).ok()?;
            let function = directory.name_ordinal(image, index).ok()?;
            let address = directory.function(image, function)?;
            Some(Export {
                name: String::from_utf8_lossy(name).into_owned(),
                ordinal: directory.base.wrapping_add(function),
                address,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{image::ImageBuilder, mapped, TEXT_RVA};

    /// Three exports declared out of alphabetical order, so name positions differ from
    /// function-table indices.
    fn three_exports() -> ImageBuilder {
        ImageBuilder::new()
            .text(vec![0xC3; 0x40])
            .export("Gamma", 0x00)
            .export("Alpha", 0x10)
            .export("Beta", 0x20)
    }

    #[test]
    fn by_name() {
        let built = three_exports().build();
        let (_buffer, image, headers) = mapped(&built.bytes);

        assert_eq!(
            resolve(&image, &headers, "Alpha"),
            Some(image.address(TEXT_RVA + 0x10))
        );
        assert_eq!(
            resolve(&image, &headers, "Beta"),
            Some(image.address(TEXT_RVA + 0x20))
        );
        assert_eq!(
            resolve(&image, &headers, "Gamma"),
            Some(image.address(TEXT_RVA))
        );
    }

    #[test]
    fn idempotent_and_absent() {
        let built = three_exports().build();
        let (_buffer, image, headers) = mapped(&built.bytes);

        let first = resolve(&image, &headers, "Beta");
        assert!(first.is_some());
        assert_eq!(resolve(&image, &headers, "Beta"), first);

        assert_eq!(resolve(&image, &headers, "Delta"), None);
        assert_eq!(resolve(&image, &headers, "alpha"), None);
        assert_eq!(resolve(&image, &headers, "Alph"), None);
        assert_eq!(resolve(&image, &headers, ""), None);
    }

    #[test]
    fn no_export_directory() {
        let built = ImageBuilder::new().build();
        let (_buffer, image, headers) = mapped(&built.bytes);

        assert_eq!(resolve(&image, &headers, "Alpha"), None);
        assert_eq!(resolve_ordinal(&image, &headers, 1), None);
        assert!(exports(&image, &headers).is_empty());
    }

    #[test]
    fn by_ordinal() {
        let built = three_exports().ordinal_base(5).build();
        let (_buffer, image, headers) = mapped(&built.bytes);

        assert_eq!(
            resolve_ordinal(&image, &headers, 5),
            Some(image.address(TEXT_RVA))
        );
        assert_eq!(
            resolve_ordinal(&image, &headers, 7),
            Some(image.address(TEXT_RVA + 0x20))
        );
        assert_eq!(resolve_ordinal(&image, &headers, 4), None);
        assert_eq!(resolve_ordinal(&image, &headers, 8), None);
    }

    #[test]
    fn listing() {
        let built = three_exports().build();
        let (_buffer, image, headers) = mapped(&built.bytes);

        let listed = exports(&image, &headers);
        let names: Vec<&str> = listed.iter().map(|export| export.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "Beta", "Gamma"]);
        assert_eq!(listed[0].ordinal, 2);
        assert_eq!(listed[0].address, image.address(TEXT_RVA + 0x10));
        assert_eq!(listed[2].ordinal, 1);
    }

    #[test]
    fn forwarded_and_null() {
        let built = ImageBuilder::new()
            .export("Local", 0)
            .forwarded_export("Elsewhere", "OTHER.Function")
            .export_rva("Hole", 0)
            .build();
        let (_buffer, image, headers) = mapped(&built.bytes);

        assert!(resolve(&image, &headers, "Local").is_some());
        assert_eq!(resolve(&image, &headers, "Elsewhere"), None);
        assert_eq!(resolve(&image, &headers, "Hole"), None);
        assert_eq!(exports(&image, &headers).len(), 1);
    }

    #[test]
    fn outside_image() {
        let built = ImageBuilder::new().export_rva("Far", 0x00F0_0000).build();
        let (_buffer, image, headers) = mapped(&built.bytes);

        assert_eq!(resolve(&image, &headers, "Far"), None);
    }

    #[test]
    fn corrupt_name_ordinal() {
        let built = three_exports().build();
        let (_buffer, mut image, headers) = mapped(&built.bytes);

        let directory = headers.exports.unwrap().virtual_address as usize;
        let ordinals = image.read::<u32>(directory + 36).unwrap() as usize;
        // "Alpha" is the first name; point it past the function table
        image.write::<u16>(ordinals, 40).unwrap();

        assert_eq!(resolve(&image, &headers, "Alpha"), None);
        assert!(resolve(&image, &headers, "Beta").is_some());
    }

    #[test]
    fn corrupt_names_table() {
        let built = three_exports().build();
        let (_buffer, mut image, headers) = mapped(&built.bytes);

        let directory = headers.exports.unwrap().virtual_address as usize;
        image.write::<u32>(directory + 32, 0x00FF_0000).unwrap();

        assert_eq!(resolve(&image, &headers, "Alpha"), None);
    }
}
