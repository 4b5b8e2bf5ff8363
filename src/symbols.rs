//! A loaded module together with the exports its caller depends on.
//!
//! Code that activates an embedded library usually needs a fixed set of entry points from it
//! and wants to fail up front if any is missing. [`SymbolTable`] loads the image, resolves
//! every required name immediately, and then serves those addresses until it is torn down.
//! It is an ordinary value: construct it once and pass it to whatever needs the symbols.
//!
//! # Example
//!
//! ```rust,no_run
//! use memmodule::{Loader, SymbolTable};
//!
//! let bytes = std::fs::read("support.dll")?;
//! let table = unsafe { SymbolTable::init(&Loader::new(), &bytes, &["Start", "Stop"])? };
//!
//! let start: extern "system" fn() -> i32 = unsafe { table.function("Start") }.unwrap();
//! println!("Start returned {}", start());
//!
//! table.teardown();
//! # Ok::<(), memmodule::Error>(())
//! ```

use std::collections::HashMap;

use log::debug;

use crate::{
    host::{Host, SystemHost},
    Error, LoadedModule, Loader, Result,
};

/// Required exports of a module, resolved once at load.
#[derive(Debug)]
pub struct SymbolTable<H: Host = SystemHost> {
    module: LoadedModule<H>,
    addresses: HashMap<String, usize>,
}

impl<H: Host + Clone> SymbolTable<H> {
    /// Load `data` with `loader` and resolve every name in `names`.
    ///
    /// # Errors
    /// Any error from [`Loader::load`], or [`Error::SymbolNotFound`] for the first name the
    /// module does not export. The module is unloaded before that error is returned.
    ///
    /// # Safety
    /// See [`Loader::load`].
    pub unsafe fn init<S: AsRef<str>>(loader: &Loader<H>, data: &[u8], names: &[S]) -> Result<Self> {
        let module = loader.load(data)?;

        let mut addresses = HashMap::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            let Some(address) = module.resolve(name) else {
                return Err(Error::SymbolNotFound(name.to_string()));
            };
            addresses.insert(name.to_string(), address);
        }

        debug!(
            "Resolved {} symbols from image at 0x{:X}",
            addresses.len(),
            module.base_address()
        );
        Ok(SymbolTable { module, addresses })
    }
}

impl<H: Host> SymbolTable<H> {
    /// Address of a required symbol, `None` if it was not requested at init.
    #[must_use]
    pub fn address(&self, name: &str) -> Option<usize> {
        self.addresses.get(name).copied()
    }

    /// A required symbol reinterpreted as `F`, normally an `extern "system" fn` type.
    ///
    /// Returns `None` if the symbol was not requested at init or `F` is not pointer-sized.
    ///
    /// # Safety
    /// `F` must match the export's real signature and calling convention, and the value must
    /// not be used after [`SymbolTable::teardown`].
    #[must_use]
    pub unsafe fn function<F: Copy>(&self, name: &str) -> Option<F> {
        if std::mem::size_of::<F>() != std::mem::size_of::<usize>() {
            return None;
        }
        let address = self.address(name)?;
        Some(std::mem::transmute_copy::<usize, F>(&address))
    }

    /// The names requested at init, in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.addresses.keys().map(String::as_str)
    }

    /// The module the symbols live in.
    #[must_use]
    pub fn module(&self) -> &LoadedModule<H> {
        &self.module
    }

    /// Unload the module. Every address handed out becomes invalid.
    pub fn teardown(self) {
        self.module.unload();
    }
}
