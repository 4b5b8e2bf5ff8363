use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! out_of_bounds_error {
    () => {
        crate::Error::OutOfBounds {
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Every fallible step of loading an image (parsing the header chain, mapping, relocating,
/// resolving imports and running the entry point) reports through this enum. Symbol lookups on
/// an already loaded module are not fallible; they return `Option` instead.
///
/// # Error Categories
///
/// ## Image Parsing Errors
/// - [`Error::Malformed`] - Corrupted or self-inconsistent image structure
/// - [`Error::OutOfBounds`] - Attempted to read or write beyond a buffer or the mapped region
/// - [`Error::NotSupported`] - Image format variant this loader does not handle
/// - [`Error::ArchitectureMismatch`] - Image built for a different machine than the host
/// - [`Error::Empty`] - Empty input provided
///
/// ## Loading Errors
/// - [`Error::OutOfMemory`] - The host could not reserve the image region
/// - [`Error::RelocationsStripped`] - Image cannot be moved away from its preferred base
/// - [`Error::UnsupportedRelocation`] - Base relocation kind outside the supported set
/// - [`Error::LibraryNotFound`] - A dependency library could not be loaded
/// - [`Error::ImportNotFound`] - A dependency does not provide an imported symbol
/// - [`Error::EntryPointFailed`] - The image's entry point rejected process attach
/// - [`Error::SymbolNotFound`] - A required export is missing from a loaded module
///
/// ## I/O and External Errors
/// - [`Error::FileError`] - Filesystem I/O errors
/// - [`Error::GoblinErr`] - Header decoding errors from the goblin crate
///
/// # Examples
///
/// ```rust,no_run
/// use memmodule::{Error, Loader};
///
/// let bytes = std::fs::read("plugin.dll")?;
/// match unsafe { Loader::new().load(&bytes) } {
///     Ok(module) => println!("Loaded at 0x{:X}", module.base_address()),
///     Err(Error::ArchitectureMismatch { machine }) => {
///         eprintln!("Built for machine 0x{:04X}", machine);
///     }
///     Err(Error::Malformed { message, file, line }) => {
///         eprintln!("Malformed image: {} ({}:{})", message, file, line);
///     }
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // Image parsing Errors
    /// The image is damaged and could not be parsed.
    ///
    /// This error indicates that an offset, size or count described by the image itself is
    /// inconsistent with the buffer or with the declared image size. The error includes the
    /// source location where the malformation was detected for debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted.
    ///
    /// Raised by the byte readers and by the mapped image view when an offset plus length does
    /// not fit the underlying buffer. It's a safety check to prevent buffer overruns.
    #[error("Out of Bound access would have occurred - {file}:{line}")]
    OutOfBounds {
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// This image type is not supported.
    ///
    /// Returned for optional-header formats whose pointer width does not match the host, and
    /// for image variants the loader has no handling for.
    #[error("This file type is not supported")]
    NotSupported,

    /// The image targets a different machine than the running host.
    ///
    /// The associated value is the COFF machine field of the image.
    #[error("Image machine 0x{machine:04X} does not match the host architecture")]
    ArchitectureMismatch {
        /// COFF machine type declared by the image
        machine: u16,
    },

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// File I/O error.
    ///
    /// Wraps standard I/O errors that can occur when reading an image from disk.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),

    /// Error from the goblin crate while decoding the DOS or COFF headers.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    // Loading Errors
    /// The host refused to reserve the region for the image.
    ///
    /// Allocation failure is fatal for a load and never retried.
    #[error("Failed to reserve {size} bytes for the image")]
    OutOfMemory {
        /// Requested region size in bytes
        size: usize,
    },

    /// The image had its base relocations stripped and could not be placed at its preferred
    /// base address.
    #[error("Image has no relocations and cannot be loaded away from its preferred base")]
    RelocationsStripped,

    /// The relocation directory contains an entry kind the loader does not apply.
    #[error("Unsupported base relocation kind {kind} at RVA 0x{rva:X}")]
    UnsupportedRelocation {
        /// The 4-bit relocation kind
        kind: u16,
        /// Relative address the entry refers to
        rva: u32,
    },

    /// A dependency named in the import directory could not be loaded by the host loader.
    #[error("Failed to load dependency '{name}' - {reason}")]
    LibraryNotFound {
        /// Library name as written in the import directory
        name: String,
        /// Host-provided failure description
        reason: String,
    },

    /// A dependency was loaded but does not provide an imported symbol.
    #[error("'{library}' does not provide '{import}'")]
    ImportNotFound {
        /// Library the import was requested from
        library: String,
        /// Symbol name, or `#ordinal` for ordinal imports
        import: String,
    },

    /// The entry point returned failure for the process-attach notification.
    #[error("The image entry point failed process attach")]
    EntryPointFailed,

    /// A symbol required by a [`crate::SymbolTable`] is not exported by the module.
    #[error("Required export '{0}' not found")]
    SymbolNotFound(String),
}
