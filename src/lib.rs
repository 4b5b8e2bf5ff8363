// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
// - 'host/*' calls into the operating system's memory and library APIs
// - 'loader/mapper.rs' views the mapped region through raw pointers
// - 'loader/entry.rs' calls into mapped code
// - 'file/physical.rs' uses mmap to map a file into memory

//! # memmodule
//!
//! Load a Windows PE library (a DLL) straight from a byte buffer, without writing it to disk
//! and without registering it with the operating system's loader.
//!
//! `memmodule` does the work of the system loader itself: it validates the headers, maps the
//! sections into a fresh executable region, applies base relocations, resolves the library's
//! own imports through the host's ordinary loader, and runs the entry point. The result is a
//! [`LoadedModule`] whose exports can be looked up by name, and which is torn down again when
//! unloaded or dropped.
//!
//! ## Features
//!
//! - **Buffer-only input** - the image is borrowed for the duration of the load call only
//! - **Bounds-checked** - every header, table and fixup is range-checked against its buffer
//! - **PE32 and PE32+** - whichever matches the running process
//! - **Pluggable host** - OS services sit behind the [`host::Host`] traits
//! - **Scoped symbols** - [`SymbolTable`] resolves a fixed set of exports up front
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! let bytes = std::fs::read("plugin.dll")?;
//!
//! // Loading runs the library's entry point
//! let module = unsafe { memmodule::load(&bytes)? };
//!
//! if let Some(address) = module.resolve("PluginVersion") {
//!     let version: extern "system" fn() -> u32 = unsafe { std::mem::transmute(address) };
//!     println!("Plugin version {}", version());
//! }
//!
//! memmodule::unload(module);
//! # Ok::<(), memmodule::Error>(())
//! ```
//!
//! ### Configuring the Loader
//!
//! ```rust,no_run
//! use memmodule::{ImportPolicy, Loader, LoaderConfig, RelocationMode};
//!
//! let config = LoaderConfig::new()
//!     .with_import_policy(ImportPolicy::Lazy)
//!     .with_relocation_mode(RelocationMode::Compatible)
//!     .without_entry_point();
//!
//! let bytes = std::fs::read("plugin.dll")?;
//! let module = unsafe { Loader::with_config(config).load(&bytes)? };
//! for export in module.exports() {
//!     println!("{} (#{}) at 0x{:X}", export.name, export.ordinal, export.address);
//! }
//! # Ok::<(), memmodule::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`loader`] - the loading pipeline and [`LoadedModule`]
//! - [`host`] - operating system services the pipeline consumes
//! - [`file`] - image sources and bounds-checked byte readers
//! - [`symbols`] - [`SymbolTable`], a module plus its pre-resolved exports
//! - [`Error`] and [`Result`] - error handling
//!
//! Only images built for the running architecture can be loaded. Thread-local storage
//! callbacks, delay-load imports and forwarded exports are not processed.
//!
//! ## Logging
//!
//! Pipeline milestones are logged at `debug`, per-relocation-block and per-import detail at
//! `trace`, and tolerated anomalies at `warn`, all through the [`log`] facade. No logger is
//! installed by this crate.
//!
//! ## Error Handling
//!
//! ```rust,no_run
//! use memmodule::Error;
//!
//! let bytes = std::fs::read("plugin.dll")?;
//! match unsafe { memmodule::load(&bytes) } {
//!     Ok(module) => println!("Loaded at 0x{:X}", module.base_address()),
//!     Err(Error::ArchitectureMismatch { machine }) => println!("Wrong machine 0x{:X}", machine),
//!     Err(Error::LibraryNotFound { name, .. }) => println!("Missing dependency {}", name),
//!     Err(Error::Malformed { message, .. }) => println!("Malformed image: {}", message),
//!     Err(e) => println!("Other error: {}", e),
//! }
//! # Ok::<(), memmodule::Error>(())
//! ```
//!
//! ## Development and Testing
//!
//! ```bash
//! cargo test
//! cargo bench
//!
//! # Fuzz the header parser
//! cargo +nightly fuzz run headers --release
//! ```

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust,no_run
/// use memmodule::prelude::*;
///
/// let bytes = std::fs::read("plugin.dll")?;
/// let module: LoadedModule = unsafe { Loader::new().load(&bytes)? };
/// println!("{} sections", module.sections().len());
/// # Ok::<(), memmodule::Error>(())
/// ```
pub mod prelude;

pub mod file;
pub mod host;
pub mod loader;
pub mod symbols;

/// `memmodule` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `memmodule` Error type
///
/// The main error type for all operations in this crate.
pub use error::Error;

pub use file::{parser::Parser, RawImage};
pub use host::SystemHost;
pub use loader::{
    Export, ImageHeaders, ImportPolicy, LoadedModule, LoadedSection, Loader, LoaderConfig,
    RelocationMode,
};
pub use symbols::SymbolTable;

/// Load the image in `data` with the default configuration on the running system.
///
/// Shorthand for `Loader::new().load(data)`.
///
/// # Errors
/// See [`Loader::load`].
///
/// # Safety
/// See [`Loader::load`]. The image's entry point runs before this returns.
pub unsafe fn load(data: &[u8]) -> Result<LoadedModule> {
    Loader::new().load(data)
}

/// Unload a module returned by [`load`].
///
/// Runs the detach reasons if the entry point was attached, releases the module's
/// dependencies and frees its memory. Equivalent to [`LoadedModule::unload`].
pub fn unload(module: LoadedModule) {
    module.unload();
}
