#![no_main]

use libfuzzer_sys::fuzz_target;
use memmodule::{ImageHeaders, RawImage};

fuzz_target!(|data: &[u8]| {
    if let Ok(headers) = ImageHeaders::parse(data) {
        for section in headers.sections(data) {
            let _ = section.map(|section| section.mapped_size());
        }
    }
    let _ = RawImage::from_mem(data.to_vec()).and_then(|image| image.sections());
});
