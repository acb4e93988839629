// Copyright 2025 The coro Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Stack allocation for the hosted convenience constructor.
//!
//! Stacks are mmap'd with an inaccessible guard page below them, so running
//! off the end of a coroutine stack faults instead of silently corrupting
//! neighbouring memory. The release half is a plain function rather than a
//! destructor because it is stored in the channel record as a
//! `(argument, fn)` pair and runs after the parent observes termination.

use std::io::Error;
use std::ptr::{self, NonNull};

/// Stack size used by [`Channel::create`](crate::Channel::create),
/// excluding the guard page.
pub const DEFAULT_STACK_SIZE: usize = 512 * 1024;

/// Minimum usable stack size.
pub const MIN_STACK_SIZE: usize = 4096;

/// Maps a [`DEFAULT_STACK_SIZE`] block preceded by a guard page and
/// returns the base of the usable region. Failure is fatal.
pub fn allocate() -> NonNull<u8> {
    let size = DEFAULT_STACK_SIZE.max(MIN_STACK_SIZE);
    let page_size = page_size();
    let mmap_len = mmap_len(size, page_size);

    // OpenBSD requires MAP_STACK on anything that is used as a stack.
    cfg_if::cfg_if! {
        if #[cfg(target_os = "openbsd")] {
            let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
        } else {
            let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
        }
    }

    // Safety: fresh anonymous mapping, flags and lengths computed above.
    unsafe {
        // Reserve address space for the guard page and the stack.
        let mmap = libc::mmap(ptr::null_mut(), mmap_len, libc::PROT_NONE, map_flags, -1, 0);
        assert!(
            mmap != libc::MAP_FAILED,
            "failed to map coroutine stack: {}",
            Error::last_os_error()
        );

        // Make everything except the guard page accessible.
        let base = mmap.cast::<u8>().add(page_size);
        let ret = libc::mprotect(base.cast(), size, libc::PROT_READ | libc::PROT_WRITE);
        assert!(
            ret == 0,
            "failed to unprotect coroutine stack: {}",
            Error::last_os_error()
        );

        NonNull::new_unchecked(base)
    }
}

/// Releases a stack returned by [`allocate`]. Installed in the channel
/// record as the release hook.
///
/// # Safety
///
/// `base` must have been returned by [`allocate`] and must not be used
/// afterwards.
pub unsafe fn release(base: *mut u8) {
    let page_size = page_size();
    let mmap_len = mmap_len(DEFAULT_STACK_SIZE.max(MIN_STACK_SIZE), page_size);

    // Safety: undoes the mapping made by allocate(), guard page included.
    unsafe {
        let ret = libc::munmap(base.sub(page_size).cast(), mmap_len);
        debug_assert_eq!(ret, 0);
    }
}

/// Guard page plus stack, rounded up to a page boundary.
fn mmap_len(size: usize, page_size: usize) -> usize {
    size.checked_add(page_size + page_size - 1)
        .expect("integer overflow while calculating stack size")
        & !(page_size - 1)
}

fn page_size() -> usize {
    // Safety: sysconf(_SC_PAGESIZE) has no preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    assert!(page_size.is_power_of_two());
    page_size
}
