use std::{fmt, ptr::NonNull};

use log::debug;

use crate::{
    host::{Host, SystemHost},
    loader::{
        entry,
        exports::{self, Export},
        headers::ImageHeaders,
        mapper::{LoadedSection, MappedImage},
    },
};

/// A library mapped into memory by [`crate::Loader`].
///
/// The module owns its memory region and every dependency handle acquired while linking it.
/// [`LoadedModule::unload`] (or dropping the module) sends the detach reasons to the entry
/// point if it was attached, releases the dependencies in reverse order and frees the region.
/// Addresses obtained from [`LoadedModule::resolve`] are only valid until then.
pub struct LoadedModule<H: Host = SystemHost> {
    host: H,
    pub(super) image: MappedImage,
    pub(super) headers: ImageHeaders,
    pub(super) sections: Vec<LoadedSection>,
    pub(super) libraries: Vec<H::Library>,
    pub(super) attached: bool,
}

// The region and the library handles belong to this value alone; nothing in it is tied to
// the thread that loaded it.
unsafe impl<H> Send for LoadedModule<H>
where
    H: Host + Send,
    H::Library: Send,
{
}

impl<H: Host> LoadedModule<H> {
    /// Take ownership of a freshly allocated region of `headers.size_of_image` bytes.
    pub(super) fn new(host: H, base: NonNull<u8>, headers: ImageHeaders) -> Self {
        LoadedModule {
            host,
            image: unsafe { MappedImage::new(base, headers.size_of_image as usize) },
            headers,
            sections: Vec::new(),
            libraries: Vec::new(),
            attached: false,
        }
    }

    /// Address the image was mapped at.
    #[must_use]
    pub fn base_address(&self) -> usize {
        self.image.base().as_ptr() as usize
    }

    /// Size of the mapped region.
    #[must_use]
    pub fn size(&self) -> usize {
        self.image.len()
    }

    /// Base address the image was linked for.
    #[must_use]
    pub fn preferred_base(&self) -> u64 {
        self.headers.image_base
    }

    /// Absolute address of the entry point, `None` if the image declares none.
    #[must_use]
    pub fn entry_point(&self) -> Option<usize> {
        match self.headers.entry_point {
            0 => None,
            rva => Some(self.image.address(rva)),
        }
    }

    /// Returns `true` if the entry point accepted process attach.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Header summary the image was loaded from.
    #[must_use]
    pub fn headers(&self) -> &ImageHeaders {
        &self.headers
    }

    /// Sections in the order they were mapped.
    #[must_use]
    pub fn sections(&self) -> &[LoadedSection] {
        &self.sections
    }

    /// Bounds-checked view of the mapped region.
    #[must_use]
    pub fn image(&self) -> &MappedImage {
        &self.image
    }

    /// Number of dependency libraries held open by this module.
    #[must_use]
    pub fn library_count(&self) -> usize {
        self.libraries.len()
    }

    /// Absolute address of the export called `name`.
    ///
    /// Names are compared case-sensitively. A missing name, a forwarded export or a damaged
    /// export table all yield `None`. Repeated calls return the same result.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<usize> {
        exports::resolve(&self.image, &self.headers, name)
    }

    /// Absolute address of the export with `ordinal`.
    #[must_use]
    pub fn resolve_ordinal(&self, ordinal: u32) -> Option<usize> {
        exports::resolve_ordinal(&self.image, &self.headers, ordinal)
    }

    /// Every named export that resolves to an address.
    #[must_use]
    pub fn exports(&self) -> Vec<Export> {
        exports::exports(&self.image, &self.headers)
    }

    /// The export called `name` reinterpreted as `F`, normally an `extern "system" fn` type.
    ///
    /// Returns `None` if the export is missing or `F` is not pointer-sized.
    ///
    /// # Safety
    /// `F` must match the export's real signature and calling convention, and the value must
    /// not be used after the module is unloaded.
    #[must_use]
    pub unsafe fn symbol<F: Copy>(&self, name: &str) -> Option<F> {
        if std::mem::size_of::<F>() != std::mem::size_of::<usize>() {
            return None;
        }
        let address = self.resolve(name)?;
        Some(std::mem::transmute_copy::<usize, F>(&address))
    }

    /// Detach, release dependencies and free the region.
    pub fn unload(self) {
        drop(self);
    }
}

impl<H: Host> Drop for LoadedModule<H> {
    fn drop(&mut self) {
        if self.attached {
            self.attached = false;
            unsafe { entry::detach(&self.image, self.headers.entry_point) };
        }

        for library in self.libraries.drain(..).rev() {
            self.host.free_library(library);
        }

        unsafe { self.host.release(self.image.base(), self.image.len()) };
        debug!(
            "Unloaded image at {:p} (0x{:X} bytes)",
            self.image.base(),
            self.image.len()
        );
    }
}

impl<H: Host> fmt::Debug for LoadedModule<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModule")
            .field("base", &self.image.base())
            .field("size", &self.image.len())
            .field("preferred_base", &self.headers.image_base)
            .field("entry_point", &self.headers.entry_point)
            .field("sections", &self.sections)
            .field("libraries", &self.libraries.len())
            .field("attached", &self.attached)
            .finish()
    }
}
