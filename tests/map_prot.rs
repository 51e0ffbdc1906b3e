//! Protection and sharing: access checks at map time and what the hardware enforces.

mod common;

use std::fs::{self, File, OpenOptions};

use common::{create_rw, tmp_path};
use pmem_map::probe::{check_access, Access};
use pmem_map::{
    AccessMode, CopyFlags, ErrorKind, Granularity, MapConfig, Platform, PmemError, Protection,
    Sharing, Source,
};

#[test]
fn read_only_source_refuses_shared_write() {
    let path = tmp_path("read_only_source_refuses_shared_write");
    drop(create_rw(&path, 4096));
    let f = File::open(&path).expect("open ro");
    let src = Source::from_file(&f).expect("src");
    assert_eq!(src.access(), AccessMode::ReadOnly);

    let cfg = MapConfig::new(Granularity::Page).with_protection(Protection::READ | Protection::WRITE);
    let err = Platform::native().map(&cfg, &src).expect_err("denied");
    assert!(matches!(err, PmemError::AccessDenied { .. }));
    assert_eq!(err.kind(), ErrorKind::Config);

    // Read-only protection, or a private copy, is fine on the same descriptor.
    Platform::native()
        .map(&cfg.with_protection(Protection::READ), &src)
        .expect("read-only map");
    Platform::native()
        .map(&cfg.with_sharing(Sharing::Private), &src)
        .expect("private map");

    let _ = fs::remove_file(&path);
}

#[test]
fn write_only_source_cannot_be_mapped() {
    let path = tmp_path("write_only_source_cannot_be_mapped");
    drop(create_rw(&path, 4096));
    let f = OpenOptions::new().write(true).open(&path).expect("open wo");
    let src = Source::from_file(&f).expect("src");
    for protection in [Protection::READ, Protection::WRITE, Protection::NONE] {
        let cfg = MapConfig::new(Granularity::Page).with_protection(protection);
        assert!(matches!(
            Platform::native().map(&cfg, &src),
            Err(PmemError::AccessDenied { .. })
        ));
    }
    let _ = fs::remove_file(&path);
}

#[test]
fn protection_is_enforced_by_hardware() {
    let path = tmp_path("protection_is_enforced_by_hardware");
    let f = create_rw(&path, 8192);
    let src = Source::from_file(&f).expect("src");
    let platform = Platform::native();

    let rw = platform.map(&MapConfig::new(Granularity::Page), &src).expect("rw");
    check_access(rw.address(), rw.size(), Access::Write).expect("rw writable");

    let ro = platform
        .map(&MapConfig::new(Granularity::Page).with_protection(Protection::READ), &src)
        .expect("ro");
    check_access(ro.address(), ro.size(), Access::Read).expect("ro readable");
    let err = check_access(ro.address(), 16, Access::Write).expect_err("ro not writable");
    assert_eq!(err.kind(), ErrorKind::Access);

    let none = platform
        .map(&MapConfig::new(Granularity::Page).with_protection(Protection::NONE), &src)
        .expect("none");
    assert!(matches!(
        check_access(none.address(), 1, Access::Read),
        Err(PmemError::AccessFault { .. })
    ));
    // Persisting an inaccessible mapping is a no-op, not a fault.
    none.persist(0, none.size()).expect("persist none");

    let _ = fs::remove_file(&path);
}

#[test]
fn shared_writes_reach_the_file() {
    let path = tmp_path("shared_writes_reach_the_file");
    let f = create_rw(&path, 4096);
    let map = Platform::native()
        .map(&MapConfig::new(Granularity::Page), &Source::from_file(&f).expect("src"))
        .expect("map");

    map.copy_fn().call(10, b"shared", CopyFlags::empty()).expect("copy");
    map.set_fn().call(100, b'z', 4, CopyFlags::empty()).expect("set");
    map.unmap();

    let data = fs::read(&path).expect("read back");
    assert_eq!(&data[10..16], b"shared");
    assert_eq!(&data[100..104], b"zzzz");
    let _ = fs::remove_file(&path);
}

#[test]
fn private_writes_leave_the_file_untouched() {
    let path = tmp_path("private_writes_leave_the_file_untouched");
    {
        let f = create_rw(&path, 4096);
        let map = Platform::native()
            .map(&MapConfig::new(Granularity::Page), &Source::from_file(&f).expect("src"))
            .expect("map");
        map.copy_fn().call(0, b"original", CopyFlags::empty()).expect("seed");
    }

    let f = File::open(&path).expect("open ro");
    let private = Platform::native()
        .map(
            &MapConfig::new(Granularity::Page).with_sharing(Sharing::Private),
            &Source::from_file(&f).expect("src"),
        )
        .expect("private");
    private.copy_fn().call(0, b"scribble", CopyFlags::empty()).expect("cow write");

    let mut seen = [0u8; 8];
    private.read_into(0, &mut seen).expect("read");
    assert_eq!(&seen, b"scribble");
    private.unmap();

    let data = fs::read(&path).expect("read back");
    assert_eq!(&data[..8], b"original");
    let _ = fs::remove_file(&path);
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[test]
fn exec_mapping_runs_written_routine() {
    // mov eax, 2 ; add eax, eax ; ret
    const ROUTINE: [u8; 8] = [0xB8, 0x02, 0x00, 0x00, 0x00, 0x01, 0xC0, 0xC3];

    // The target directory, unlike /tmp, is not commonly mounted noexec.
    let path = std::path::Path::new(env!("CARGO_TARGET_TMPDIR"))
        .join(format!("pmem_map_exec_{}", std::process::id()));
    let f = create_rw(&path, 4096);
    let src = Source::from_file(&f).expect("src");

    let writable = Platform::native()
        .map(
            &MapConfig::new(Granularity::Page)
                .with_protection(Protection::READ | Protection::WRITE | Protection::EXEC),
            &src,
        )
        .expect("map rwx");
    writable
        .copy_fn()
        .call(0, &ROUTINE, CopyFlags::empty())
        .expect("write routine");
    writable.unmap();

    let exec = Platform::native()
        .map(
            &MapConfig::new(Granularity::Page).with_protection(Protection::READ | Protection::EXEC),
            &src,
        )
        .expect("map rx");
    assert!(check_access(exec.address(), ROUTINE.len(), Access::Write).is_err());

    // SAFETY: the mapping holds the routine above and is executable.
    let routine: extern "C" fn() -> i32 = unsafe { std::mem::transmute(exec.address()) };
    assert_eq!(routine(), 4);

    exec.unmap();
    let _ = fs::remove_file(&path);
}
