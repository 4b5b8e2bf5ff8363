//! Shared test support: a synthetic image writer and a scripted host.

use std::ptr::NonNull;

use crate::loader::{headers::ImageHeaders, mapper, mapper::MappedImage};


pub use image::TEXT_RVA;

/// View a heap buffer as a mapped region.
///
/// The view does not borrow `buffer`; the buffer must outlive it and must not be resized.
pub fn scratch_image(buffer: &mut Vec<u8>) -> MappedImage {
    let base = NonNull::new(buffer.as_mut_ptr()).expect("scratch buffer must not be empty");
    unsafe { MappedImage::new(base, buffer.len()) }
}

/// Parse `bytes` and map them into a zeroed heap buffer of `SizeOfImage` bytes.
///
/// The buffer is returned alongside the view and has to be kept alive by the caller.
pub fn mapped(bytes: &[u8]) -> (Vec<u8>, MappedImage, ImageHeaders) {
    let headers = ImageHeaders::parse(bytes).unwrap();
    let mut buffer = vec![0_u8; headers.size_of_image as usize];
    let mut image = scratch_image(&mut buffer);
    mapper::map(bytes, &headers, &mut image).unwrap();
    (buffer, image, headers)
}
