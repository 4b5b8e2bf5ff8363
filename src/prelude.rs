//! # memmodule Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the memmodule library. Import this module to get quick access to everything needed
//! to load a library from memory and call into it.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all memmodule operations
pub use crate::Error;

/// The result type used throughout memmodule
pub use crate::Result;

// ================================================================================================
// Main Entry Points
// ================================================================================================

/// Loader, its configuration and the loaded module
pub use crate::{ImportPolicy, LoadedModule, Loader, LoaderConfig, RelocationMode};

/// One-shot load and unload on the running system
pub use crate::{load, unload};

/// Module plus pre-resolved exports
pub use crate::SymbolTable;

// ================================================================================================
// Inspection
// ================================================================================================

/// Image sources and header summary
pub use crate::{ImageHeaders, RawImage};

/// Mapped sections and exports of a loaded module
pub use crate::{Export, LoadedSection};

// ================================================================================================
// Host Services
// ================================================================================================

/// Operating system services consumed by the loader
pub use crate::host::{Host, ImportName, LibraryLoader, SystemHost, VirtualMemory};
