//! [`SystemHost`] on Unix-like systems.
//!
//! Regions come from anonymous `mmap`, which the kernel hands out zero-filled. Dependencies go
//! through `dlopen`, so import names must be resolvable by the dynamic linker; lookup by
//! ordinal has no Unix equivalent and always fails.

use std::{ffi::CStr, ptr::NonNull};

use log::{debug, warn};

use super::{ImportName, LibraryLoader, SystemHost, VirtualMemory};
use crate::{Error, Result};

/// Handle to a dependency loaded with `dlopen`.
#[derive(Debug)]
pub struct Library(NonNull<libc::c_void>);

// dlopen handles are process-wide and valid from any thread
unsafe impl Send for Library {}

/// Most recent dynamic linker error.
fn dl_error() -> String {
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        return "unknown dynamic linker error".to_string();
    }

    unsafe { CStr::from_ptr(message) }
        .to_string_lossy()
        .into_owned()
}

#[cfg(target_arch = "aarch64")]
extern "C" {
    fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
}

impl VirtualMemory for SystemHost {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if base == libc::MAP_FAILED {
            warn!(
                "mmap of {} bytes failed: {}",
                size,
                std::io::Error::last_os_error()
            );
            return Err(Error::OutOfMemory { size });
        }

        NonNull::new(base.cast::<u8>()).ok_or(Error::OutOfMemory { size })
    }

    unsafe fn release(&self, base: NonNull<u8>, size: usize) {
        if libc::munmap(base.as_ptr().cast(), size) != 0 {
            warn!(
                "munmap at {:p} failed: {}",
                base,
                std::io::Error::last_os_error()
            );
        }
    }

    #[allow(unused_variables)]
    fn flush_instruction_cache(&self, base: NonNull<u8>, size: usize) {
        #[cfg(target_arch = "aarch64")]
        unsafe {
            let start = base.as_ptr().cast::<libc::c_char>();
            __clear_cache(start, start.add(size));
        }
    }
}

impl LibraryLoader for SystemHost {
    type Library = Library;

    fn load_library(&self, name: &CStr) -> Result<Library> {
        let handle = unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_NOW) };
        match NonNull::new(handle) {
            Some(handle) => {
                debug!("dlopen({}) -> {:p}", name.to_string_lossy(), handle);
                Ok(Library(handle))
            }
            None => Err(Error::LibraryNotFound {
                name: name.to_string_lossy().into_owned(),
                reason: dl_error(),
            }),
        }
    }

    fn symbol(&self, library: &Library, import: ImportName<'_>) -> Option<usize> {
        match import {
            ImportName::Name(name) => {
                let address = unsafe { libc::dlsym(library.0.as_ptr(), name.as_ptr()) };
                (!address.is_null()).then_some(address as usize)
            }
            ImportName::Ordinal(_) => None,
        }
    }

    fn free_library(&self, library: Library) {
        if unsafe { libc::dlclose(library.0.as_ptr()) } != 0 {
            warn!("dlclose({:p}) failed: {}", library.0, dl_error());
        }
    }
}
