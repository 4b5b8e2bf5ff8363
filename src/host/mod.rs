//! Operating system services consumed by the loader.
//!
//! Manually mapping an image still needs two things from the host: a region of memory the
//! image can execute from, and the ordinary dynamic-library loader for the image's
//! dependencies. Both are abstracted here so that [`crate::Loader`] can be driven by the real
//! operating system ([`SystemHost`]) or by a scripted stand-in in tests.
//!
//! # Key Components
//!
//! - [`VirtualMemory`] - reserve/commit, release and instruction-cache flush
//! - [`LibraryLoader`] - load a dependency by name, look up symbols, release it
//! - [`Host`] - blanket trait for types providing both
//! - [`SystemHost`] - `VirtualAlloc`/`LoadLibraryA` on Windows, `mmap`/`dlopen` on Unix
//!
//! # Example
//!
//! ```rust,no_run
//! use memmodule::host::{ImportName, LibraryLoader, SystemHost};
//!
//! let host = SystemHost;
//! let library = host.load_library(c"kernel32.dll")?;
//! let address = host.symbol(&library, ImportName::Name(c"GetTickCount"));
//! println!("GetTickCount at {:X?}", address);
//! host.free_library(library);
//! # Ok::<(), memmodule::Error>(())
//! ```

use std::{ffi::CStr, fmt, ptr::NonNull};

use crate::Result;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

/// How an import names the symbol it wants from a dependency.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportName<'a> {
    /// Lookup by exported name
    Name(&'a CStr),
    /// Lookup by export ordinal
    Ordinal(u16),
}

impl fmt::Display for ImportName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportName::Name(name) => write!(f, "{}", name.to_string_lossy()),
            ImportName::Ordinal(ordinal) => write!(f, "#{}", ordinal),
        }
    }
}

/// Virtual memory services used to host a mapped image.
pub trait VirtualMemory {
    /// Reserve and commit a zero-initialized, readable, writable and executable region of
    /// exactly `size` bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfMemory`] if the region cannot be provided.
    fn allocate(&self, size: usize) -> Result<NonNull<u8>>;

    /// Release a region previously returned by [`VirtualMemory::allocate`].
    ///
    /// # Safety
    /// `base` and `size` must describe a live allocation from this host, and nothing may
    /// access the region afterwards.
    unsafe fn release(&self, base: NonNull<u8>, size: usize);

    /// Make freshly written code in the region visible to instruction fetch.
    fn flush_instruction_cache(&self, base: NonNull<u8>, size: usize);
}

/// Dynamic-library services used to satisfy an image's imports.
///
/// Dependencies are always loaded through the host's own loader, never mapped manually.
pub trait LibraryLoader {
    /// Handle to a loaded dependency.
    type Library;

    /// Load a dependency by the name recorded in the import directory.
    ///
    /// # Errors
    /// Returns [`crate::Error::LibraryNotFound`] if the host loader cannot provide it.
    fn load_library(&self, name: &CStr) -> Result<Self::Library>;

    /// Address of `import` inside `library`, `None` if it is not exported.
    fn symbol(&self, library: &Self::Library, import: ImportName<'_>) -> Option<usize>;

    /// Release a dependency handle obtained from [`LibraryLoader::load_library`].
    fn free_library(&self, library: Self::Library);
}

/// Everything the loader needs from its environment.
pub trait Host: VirtualMemory + LibraryLoader {}

impl<T: VirtualMemory + LibraryLoader> Host for T {}

/// The running operating system.
///
/// A zero-sized handle; copies are free and interchangeable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SystemHost;

#[cfg(windows)]
pub use self::windows::Library;

#[cfg(unix)]
pub use self::unix::Library;
