//! Manual image loading.
//!
//! This module turns the bytes of a PE/COFF library into a live [`LoadedModule`] without going
//! through the operating system's own loader. Loading is a fixed pipeline; each stage lives in
//! its own submodule:
//!
//! 1. [`headers`] - walk DOS header, NT headers, optional header and section table
//! 2. [`mapper`] - reserve a region of `SizeOfImage` bytes, copy headers and sections
//! 3. [`relocation`] - rebase absolute addresses for the actual base
//! 4. [`imports`] - load dependencies through the host and patch the address tables
//! 5. [`entry`] - run the entry point with the attach reasons
//!
//! Export lookup ([`exports`]) runs on demand afterwards, and teardown happens when the module
//! is unloaded or dropped.
//!
//! # Example
//!
//! ```rust,no_run
//! use memmodule::{Loader, LoaderConfig, ImportPolicy};
//!
//! let bytes = std::fs::read("plugin.dll")?;
//! let loader = Loader::with_config(
//!     LoaderConfig::new().with_import_policy(ImportPolicy::Lazy),
//! );
//!
//! let module = unsafe { loader.load(&bytes)? };
//! if let Some(address) = module.resolve("PluginInit") {
//!     println!("PluginInit at 0x{:X}", address);
//! }
//! module.unload();
//! # Ok::<(), memmodule::Error>(())
//! ```

use log::debug;

use crate::{
    host::{Host, SystemHost},
    Result,
};

pub mod entry;
pub mod exports;
pub mod headers;
pub mod imports;
pub mod mapper;
mod module;
pub mod relocation;

pub use exports::Export;
pub use headers::{DataDirectory, ImageHeaders, SectionHeader};
pub use mapper::{LoadedSection, MappedImage};
pub use module::LoadedModule;

/// What to do when a dependency or one of its symbols cannot be found.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ImportPolicy {
    /// Fail the load with [`crate::Error::LibraryNotFound`] or [`crate::Error::ImportNotFound`]
    #[default]
    Eager,
    /// Log a warning and leave the affected address-table slots null
    Lazy,
}

/// How base relocation entries are interpreted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RelocationMode {
    /// Honour the entry kind; unknown kinds fail with [`crate::Error::UnsupportedRelocation`]
    #[default]
    Typed,
    /// Treat every entry except padding as a pointer-width add of the delta
    Compatible,
}

/// Options for [`Loader`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Handling of missing dependencies and symbols
    pub import_policy: ImportPolicy,
    /// Interpretation of base relocation entries
    pub relocation_mode: RelocationMode,
    /// Whether the entry point is run at load and unload
    pub call_entry_point: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            import_policy: ImportPolicy::Eager,
            relocation_mode: RelocationMode::Typed,
            call_entry_point: true,
        }
    }
}

impl LoaderConfig {
    /// Eager imports, typed relocations, entry point enabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the import policy.
    #[must_use]
    pub fn with_import_policy(mut self, policy: ImportPolicy) -> Self {
        self.import_policy = policy;
        self
    }

    /// Set the relocation mode.
    #[must_use]
    pub fn with_relocation_mode(mut self, mode: RelocationMode) -> Self {
        self.relocation_mode = mode;
        self
    }

    /// Map and link the image but never call its entry point.
    #[must_use]
    pub fn without_entry_point(mut self) -> Self {
        self.call_entry_point = false;
        self
    }
}

/// Loads images into memory through a [`Host`].
#[derive(Clone, Debug)]
pub struct Loader<H = SystemHost> {
    host: H,
    config: LoaderConfig,
}

impl Loader<SystemHost> {
    /// A loader backed by the operating system with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(LoaderConfig::default())
    }

    /// A loader backed by the operating system with `config`.
    #[must_use]
    pub fn with_config(config: LoaderConfig) -> Self {
        Loader {
            host: SystemHost,
            config,
        }
    }
}

impl Default for Loader<SystemHost> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Host + Clone> Loader<H> {
    /// A loader backed by `host` with the default configuration.
    pub fn with_host(host: H) -> Self {
        Self::with_host_and_config(host, LoaderConfig::default())
    }

    /// A loader backed by `host` with `config`.
    pub fn with_host_and_config(host: H, config: LoaderConfig) -> Self {
        Loader { host, config }
    }

    /// The active configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// The host services in use.
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Map, relocate and link the image in `data`, then run its entry point.
    ///
    /// `data` is only borrowed for the duration of the call. On failure everything acquired
    /// so far (dependency handles and the mapped region) is released before returning, and
    /// the detach reasons are never sent.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::Malformed`], [`crate::Error::OutOfBounds`],
    ///   [`crate::Error::NotSupported`] or [`crate::Error::ArchitectureMismatch`] for input
    ///   that is not a loadable library for this process
    /// - [`crate::Error::OutOfMemory`] if the host cannot provide the region
    /// - [`crate::Error::RelocationsStripped`] / [`crate::Error::UnsupportedRelocation`] from
    ///   rebasing
    /// - [`crate::Error::LibraryNotFound`] / [`crate::Error::ImportNotFound`] under
    ///   [`ImportPolicy::Eager`]
    /// - [`crate::Error::EntryPointFailed`] if the entry point rejects process attach
    ///
    /// # Safety
    ///
    /// Loading executes code from the image (its entry point, and the initializers of every
    /// dependency it names). The caller must trust `data` as much as any library it would
    /// load from disk.
    pub unsafe fn load(&self, data: &[u8]) -> Result<LoadedModule<H>> {
        let headers = ImageHeaders::parse(data)?;

        let size = headers.size_of_image as usize;
        let base = self.host.allocate(size)?;
        debug!(
            "Reserved 0x{:X} bytes at {:p} (preferred base 0x{:X})",
            size, base, headers.image_base
        );

        // From here on dropping `module` releases whatever has been acquired
        let mut module = LoadedModule::new(self.host.clone(), base, headers);

        module.sections = mapper::map(data, &headers, &mut module.image)?;

        let fixups = relocation::apply(&mut module.image, &headers, self.config.relocation_mode)?;
        debug!("Applied {} relocations", fixups);

        let patched = imports::resolve(
            &self.host,
            &mut module.image,
            &headers,
            self.config.import_policy,
            &mut module.libraries,
        )?;
        debug!(
            "Patched {} import slots from {} libraries",
            patched,
            module.libraries.len()
        );

        self.host
            .flush_instruction_cache(module.image.base(), module.image.len());

        if self.config.call_entry_point && headers.entry_point != 0 {
            entry::attach(&module.image, headers.entry_point)?;
            module.attached = true;
        }

        Ok(module)
    }
}
