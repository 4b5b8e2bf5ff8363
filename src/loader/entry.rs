//! Entry point invocation.
//!
//! A library's entry point has the `DllMain` shape and is told about lifecycle events through
//! its `reason` argument. After mapping it is called with process attach then thread attach;
//! before the region is released it is called with thread detach then process detach.

use std::ffi::c_void;

use log::debug;

use crate::{loader::mapper::MappedImage, Error, Result};

/// Signature of a library entry point.
pub type DllEntryPoint =
    unsafe extern "system" fn(module: *mut c_void, reason: u32, reserved: *mut c_void) -> i32;

/// The library is being unloaded from the process.
pub const DLL_PROCESS_DETACH: u32 = 0;
/// The library was loaded into the process.
pub const DLL_PROCESS_ATTACH: u32 = 1;
/// A thread is starting.
pub const DLL_THREAD_ATTACH: u32 = 2;
/// A thread is exiting.
pub const DLL_THREAD_DETACH: u32 = 3;

/// Call the entry point at `entry_rva` once with `reason`.
///
/// # Safety
/// `entry_rva` must be the entry point of the fully relocated and import-resolved image in
/// `image`, and the region must be executable.
unsafe fn call(image: &MappedImage, entry_rva: u32, reason: u32) -> i32 {
    let entry: DllEntryPoint = std::mem::transmute::<usize, DllEntryPoint>(image.address(entry_rva));
    entry(image.base().as_ptr().cast(), reason, std::ptr::null_mut())
}

/// Send process attach and thread attach.
///
/// # Errors
/// Returns [`crate::Error::EntryPointFailed`] if process attach returns zero; thread attach is
/// not sent in that case.
///
/// # Safety
/// Runs code from the image; see [`crate::Loader::load`].
pub unsafe fn attach(image: &MappedImage, entry_rva: u32) -> Result<()> {
    debug!(
        "Calling entry point at 0x{:X} with DLL_PROCESS_ATTACH",
        image.address(entry_rva)
    );
    if call(image, entry_rva, DLL_PROCESS_ATTACH) == 0 {
        return Err(Error::EntryPointFailed);
    }

    call(image, entry_rva, DLL_THREAD_ATTACH);
    Ok(())
}

/// Send thread detach and process detach. Return values are ignored.
///
/// # Safety
/// The image must have been attached successfully and not detached since.
pub unsafe fn detach(image: &MappedImage, entry_rva: u32) {
    debug!(
        "Calling entry point at 0x{:X} with DLL_PROCESS_DETACH",
        image.address(entry_rva)
    );
    call(image, entry_rva, DLL_THREAD_DETACH);
    call(image, entry_rva, DLL_PROCESS_DETACH);
}
