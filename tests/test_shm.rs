// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared memory handle: creation, attachment, reference counting and
// size checks.

use std::sync::atomic::{AtomicUsize, Ordering};

use shmproxy::{ShmHandle, ShmOpenMode};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_shm_{}_{n}", std::process::id())
}

#[test]
fn acquire_create() {
    let name = unique_name("acquire_create");
    ShmHandle::unlink_by_name(&name);

    let shm = ShmHandle::acquire(&name, 1024, ShmOpenMode::Create).expect("acquire create");
    assert!(shm.mapped_size() >= 1024);
    assert_eq!(shm.user_size(), 1024);
    assert_eq!(shm.name(), format!("/{name}"));
}

#[test]
fn acquire_open_nonexistent() {
    let name = unique_name("acquire_open_fail");
    ShmHandle::unlink_by_name(&name);

    assert!(ShmHandle::acquire(&name, 1024, ShmOpenMode::Open).is_err());
}

#[test]
fn create_exclusive_fails_if_exists() {
    let name = unique_name("create_excl");
    ShmHandle::unlink_by_name(&name);

    let _h1 = ShmHandle::acquire(&name, 256, ShmOpenMode::Create).expect("first create");
    assert!(ShmHandle::acquire(&name, 256, ShmOpenMode::Create).is_err());
}

#[test]
fn open_sees_creator_writes() {
    let name = unique_name("shared_data");
    ShmHandle::unlink_by_name(&name);

    let owner = ShmHandle::acquire(&name, 512, ShmOpenMode::Create).expect("create");
    let payload = b"Shared memory test data";
    unsafe {
        std::ptr::copy_nonoverlapping(payload.as_ptr(), owner.as_mut_ptr(), payload.len());
    }

    let peer = ShmHandle::acquire(&name, 512, ShmOpenMode::Open).expect("open");
    let read_back = unsafe { std::slice::from_raw_parts(peer.as_ptr(), payload.len()) };
    assert_eq!(read_back, payload);
}

#[test]
fn open_rejects_size_mismatch() {
    let name = unique_name("size_mismatch");
    ShmHandle::unlink_by_name(&name);

    let owner = ShmHandle::acquire(&name, 256, ShmOpenMode::Create).expect("create");
    for size in [8192, 128] {
        let err = ShmHandle::acquire(&name, size, ShmOpenMode::Open)
            .err()
            .expect("mismatched open must fail");
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
    // Failed opens never touched the counter.
    assert_eq!(owner.ref_count(), 1);
    ShmHandle::acquire(&name, 256, ShmOpenMode::Open).expect("exact open");
}

#[test]
fn ref_count_tracks_handles() {
    let name = unique_name("ref_count");
    ShmHandle::unlink_by_name(&name);

    let h1 = ShmHandle::acquire(&name, 512, ShmOpenMode::Create).unwrap();
    assert_eq!(h1.ref_count(), 1);

    let h2 = ShmHandle::acquire(&name, 512, ShmOpenMode::Open).unwrap();
    let h3 = ShmHandle::acquire(&name, 512, ShmOpenMode::Open).unwrap();
    assert_eq!(h1.ref_count(), 3);
    assert_eq!(h3.ref_count(), 3);

    drop(h3);
    assert_eq!(h1.ref_count(), 2);
    drop(h2);
    assert_eq!(h1.ref_count(), 1);
}

#[test]
fn last_handle_unlinks() {
    let name = unique_name("last_unlinks");
    ShmHandle::unlink_by_name(&name);

    {
        let _shm = ShmHandle::acquire(&name, 256, ShmOpenMode::Create).expect("acquire");
    }
    assert!(
        ShmHandle::acquire(&name, 256, ShmOpenMode::Open).is_err(),
        "should not be able to open after last handle dropped"
    );
}

#[test]
fn open_after_unlink_fails() {
    let name = unique_name("open_after_unlink");
    ShmHandle::unlink_by_name(&name);

    let shm = ShmHandle::acquire(&name, 256, ShmOpenMode::Create).expect("create");
    shm.unlink();

    assert!(ShmHandle::acquire(&name, 256, ShmOpenMode::Open).is_err());
    // The mapping itself stays usable.
    unsafe { *shm.as_mut_ptr() = 7 };
    assert_eq!(unsafe { *shm.as_ptr() }, 7);
}

#[test]
fn empty_name_fails() {
    assert!(ShmHandle::acquire("", 256, ShmOpenMode::Create).is_err());
}

#[test]
fn zero_size_fails() {
    let name = unique_name("zero_size");
    assert!(ShmHandle::acquire(&name, 0, ShmOpenMode::Create).is_err());
}

#[test]
fn various_sizes() {
    for &size in &[1usize, 7, 31, 32, 33, 1023, 4096, 4128, 65536] {
        let name = unique_name(&format!("size_{size}"));
        ShmHandle::unlink_by_name(&name);

        let shm = ShmHandle::acquire(&name, size, ShmOpenMode::Create)
            .unwrap_or_else(|e| panic!("failed to acquire shm of size {size}: {e}"));
        assert!(shm.mapped_size() >= size, "mapped_size {} < requested {size}", shm.mapped_size());
    }
}
