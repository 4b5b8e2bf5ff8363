//! End-to-end loading of synthetic libraries on the running system.

#![cfg(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64"))]

#[path = "../src/test/image.rs"]
mod image;

use image::{ImageBuilder, ImportEntry, TEXT_RVA};
use memmodule::{
    host::{ImportName, LibraryLoader, SystemHost, VirtualMemory},
    Error, ImportPolicy, Loader, LoaderConfig, RawImage, SymbolTable,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn load_and_unload_plain_image() {
    init_logging();
    let built = ImageBuilder::new().text(vec![0xC3; 0x40]).build();

    let module = unsafe { memmodule::load(&built.bytes) }.unwrap();
    assert_ne!(module.base_address(), 0);
    assert_eq!(module.size(), built.size_of_image as usize);
    assert_eq!(module.library_count(), 0);
    assert_eq!(module.entry_point(), None);
    assert_eq!(module.sections().len(), 1);

    memmodule::unload(module);
}

#[test]
fn unload_frees_region() {
    init_logging();
    let built = ImageBuilder::new().build();

    let module = unsafe { memmodule::load(&built.bytes) }.unwrap();
    let size = module.size();
    module.unload();

    let host = SystemHost;
    let base = host.allocate(size).unwrap();
    unsafe { host.release(base, size) };
}

#[test]
fn pointers_follow_the_actual_base() {
    init_logging();
    let builder = ImageBuilder::new();
    let preferred = builder.build().preferred_text_address(0x30);
    let mut text = vec![0_u8; 0x40];
    text[0x08..0x10].copy_from_slice(&preferred.to_le_bytes());
    let built = builder.text(text).relocation(0x08, 10).build();

    let module = unsafe { memmodule::load(&built.bytes) }.unwrap();
    let fixed = module
        .image()
        .read::<u64>(TEXT_RVA as usize + 0x08)
        .unwrap();

    assert_eq!(
        fixed,
        preferred - module.preferred_base() + module.base_address() as u64
    );
}

#[test]
fn exports_by_name_and_ordinal() {
    init_logging();
    let built = ImageBuilder::new()
        .text(vec![0xC3; 0x30])
        .export("Charlie", 0x00)
        .export("Alpha", 0x10)
        .export("Bravo", 0x20)
        .ordinal_base(10)
        .build();

    let module = unsafe { memmodule::load(&built.bytes) }.unwrap();
    let text = module.base_address() + TEXT_RVA as usize;

    assert_eq!(module.resolve("Alpha"), Some(text + 0x10));
    assert_eq!(module.resolve("Bravo"), Some(text + 0x20));
    assert_eq!(module.resolve("Charlie"), Some(text));
    assert_eq!(module.resolve("Alpha"), module.resolve("Alpha"));
    assert_eq!(module.resolve("Delta"), None);

    assert_eq!(module.resolve_ordinal(10), Some(text));
    assert_eq!(module.resolve_ordinal(12), Some(text + 0x20));
    assert_eq!(module.resolve_ordinal(13), None);

    let names: Vec<String> = module.exports().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["Alpha", "Bravo", "Charlie"]);
}

#[test]
fn foreign_machine_rejected() {
    let built = ImageBuilder::new().machine(0x01C0).build();

    assert!(matches!(
        unsafe { memmodule::load(&built.bytes) },
        Err(Error::ArchitectureMismatch { machine: 0x01C0 })
    ));
}

#[test]
fn truncated_input_rejected() {
    let built = ImageBuilder::new().text(vec![0x90; 0x400]).build();
    let truncated = &built.bytes[..built.bytes.len() - 0x200];

    assert!(unsafe { memmodule::load(truncated) }.is_err());
    assert!(unsafe { memmodule::load(&[]) }.is_err());
}

#[test]
fn missing_dependency() {
    init_logging();
    let built = ImageBuilder::new()
        .import(
            "memmodule-no-such-library.dll",
            &[ImportEntry::name("Nothing")],
        )
        .build();

    match unsafe { memmodule::load(&built.bytes) } {
        Err(Error::LibraryNotFound { name, .. }) => {
            assert_eq!(name, "memmodule-no-such-library.dll");
        }
        other => panic!("Expected LibraryNotFound, got {:?}", other),
    }

    let lazy = Loader::with_config(LoaderConfig::new().with_import_policy(ImportPolicy::Lazy));
    let module = unsafe { lazy.load(&built.bytes) }.unwrap();
    let is_64 = module.headers().is_64;
    let slot = built.import_slots[0][0] as usize;
    assert_eq!(module.image().read_pointer(slot, is_64).unwrap(), 0);
}

#[cfg(any(windows, all(target_os = "linux", target_env = "gnu")))]
#[test]
fn imports_match_host_lookup() {
    init_logging();
    #[cfg(windows)]
    let (library, symbol) = ("kernel32.dll", c"GetTickCount");
    #[cfg(not(windows))]
    let (library, symbol) = ("libc.so.6", c"getpid");

    let built = ImageBuilder::new()
        .import(
            library,
            &[ImportEntry::name(symbol.to_str().unwrap())],
        )
        .build();

    let host = SystemHost;
    let handle = host
        .load_library(&std::ffi::CString::new(library).unwrap())
        .unwrap();
    let expected = host.symbol(&handle, ImportName::Name(symbol)).unwrap();

    let module = unsafe { memmodule::load(&built.bytes) }.unwrap();
    let is_64 = module.headers().is_64;
    let slot = built.import_slots[0][0] as usize;
    assert_eq!(
        module.image().read_pointer(slot, is_64).unwrap(),
        expected as u64
    );
    assert_eq!(module.library_count(), 1);

    module.unload();
    host.free_library(handle);
}

#[test]
fn raw_image_feeds_loader() {
    let built = ImageBuilder::new().export("Only", 0).build();
    let raw = RawImage::from_mem(built.bytes.clone()).unwrap();
    assert_eq!(raw.imagebase(), built.image_base);

    let module = unsafe { Loader::new().load(raw.data()) }.unwrap();
    drop(raw);
    assert!(module.resolve("Only").is_some());
}

#[cfg(target_arch = "x86_64")]
#[test]
fn call_export_through_symbol_table() {
    init_logging();

    // mov rax, imm64 (relocated address of text+0x80); mov dword [rax], imm32; ret
    let builder = ImageBuilder::new();
    let target = builder.build().preferred_text_address(0x80);
    let mut text = vec![0x48, 0xB8];
    text.extend_from_slice(&target.to_le_bytes());
    text.extend_from_slice(&[0xC7, 0x00]);
    text.extend_from_slice(&0x0BAD_F00D_u32.to_le_bytes());
    text.push(0xC3);
    text.resize(0x88, 0);

    let built = builder
        .text(text)
        .relocation(2, 10)
        .export("KnownExport", 0)
        .export("Sentinel", 0x80)
        .build();

    let table =
        unsafe { SymbolTable::init(&Loader::new(), &built.bytes, &["KnownExport", "Sentinel"]) }
            .unwrap();
    let known: extern "system" fn() = unsafe { table.function("KnownExport") }.unwrap();
    let sentinel = table.address("Sentinel").unwrap();

    assert_eq!(unsafe { std::ptr::read_volatile(sentinel as *const u32) }, 0);
    known();
    assert_eq!(
        unsafe { std::ptr::read_volatile(sentinel as *const u32) },
        0x0BAD_F00D
    );

    table.teardown();
}

#[test]
fn symbol_table_requires_every_name() {
    let built = ImageBuilder::new().export("Present", 0).build();

    let result = unsafe { SymbolTable::init(&Loader::new(), &built.bytes, &["Present", "Absent"]) };
    assert!(matches!(result, Err(Error::SymbolNotFound(name)) if name == "Absent"));
}
