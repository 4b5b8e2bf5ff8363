//! [`SystemHost`] on Windows.

use std::{ffi::CStr, ptr::NonNull};

use log::{debug, warn};
use windows::{
    core::PCSTR,
    Win32::{
        Foundation::{FreeLibrary, HMODULE},
        System::{
            Diagnostics::Debug::FlushInstructionCache,
            LibraryLoader::{GetProcAddress, LoadLibraryA},
            Memory::{VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE},
            Threading::GetCurrentProcess,
        },
    },
};

use super::{ImportName, LibraryLoader, SystemHost, VirtualMemory};
use crate::{Error, Result};

/// Handle to a dependency loaded with `LoadLibraryA`.
#[derive(Debug)]
pub struct Library(HMODULE);

// Module handles are process-wide and valid from any thread
unsafe impl Send for Library {}

impl VirtualMemory for SystemHost {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        let base = unsafe { VirtualAlloc(None, size, MEM_RESERVE | MEM_COMMIT, PAGE_EXECUTE_READWRITE) };

        match NonNull::new(base.cast::<u8>()) {
            Some(base) => Ok(base),
            None => {
                warn!(
                    "VirtualAlloc of {} bytes failed: {}",
                    size,
                    std::io::Error::last_os_error()
                );
                Err(Error::OutOfMemory { size })
            }
        }
    }

    unsafe fn release(&self, base: NonNull<u8>, _size: usize) {
        // MEM_RELEASE frees the whole reservation and requires a size of zero
        if let Err(error) = VirtualFree(base.as_ptr().cast(), 0, MEM_RELEASE) {
            warn!("VirtualFree at {:p} failed: {}", base, error);
        }
    }

    fn flush_instruction_cache(&self, base: NonNull<u8>, size: usize) {
        let result = unsafe {
            FlushInstructionCache(GetCurrentProcess(), Some(base.as_ptr().cast_const().cast()), size)
        };
        if let Err(error) = result {
            warn!("FlushInstructionCache at {:p} failed: {}", base, error);
        }
    }
}

impl LibraryLoader for SystemHost {
    type Library = Library;

    fn load_library(&self, name: &CStr) -> Result<Library> {
        match unsafe { LoadLibraryA(PCSTR(name.as_ptr().cast())) } {
            Ok(handle) => {
                debug!("LoadLibraryA({}) -> {:?}", name.to_string_lossy(), handle);
                Ok(Library(handle))
            }
            Err(error) => Err(Error::LibraryNotFound {
                name: name.to_string_lossy().into_owned(),
                reason: error.to_string(),
            }),
        }
    }

    fn symbol(&self, library: &Library, import: ImportName<'_>) -> Option<usize> {
        let procedure = match import {
            ImportName::Name(name) => unsafe { GetProcAddress(library.0, PCSTR(name.as_ptr().cast())) },
            // Ordinals are passed in the low word of the name pointer
            ImportName::Ordinal(ordinal) => unsafe {
                GetProcAddress(library.0, PCSTR(usize::from(ordinal) as *const u8))
            },
        };

        procedure.map(|procedure| procedure as usize)
    }

    fn free_library(&self, library: Library) {
        if let Err(error) = unsafe { FreeLibrary(library.0) } {
            warn!("FreeLibrary({:?}) failed: {}", library.0, error);
        }
    }
}
