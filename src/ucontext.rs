// Copyright 2025 The coro Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Portable backend over the host's ucontext API.
//!
//! Same contract as the native backend, implemented with
//! `getcontext`/`makecontext`/`swapcontext`. Noticeably slower, since
//! glibc saves and restores the signal mask on every switch, but needs no
//! per-architecture assembly.
//!
//! The record stays small: it holds only a pointer to the inactive party's
//! `ucontext_t`, which lives in that party's own suspended stack frame.
//! The child's *initial* context has no frame to live in yet, so it is
//! carved out of the top of the child's stack block, just below the
//! channel record.

use crate::{Channel, springboard_impl};
use std::cell::Cell;
use std::mem::{self, MaybeUninit};
use std::ptr;

pub const STACK_ALIGNMENT: usize = 16;

/// Pointer to the suspended party's saved `ucontext_t`.
pub struct Context {
    inactive: Cell<*mut libc::ucontext_t>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            inactive: Cell::new(ptr::null_mut()),
        }
    }
}

/// Builds the child's initial context on its stack block and performs the
/// first transfer into it.
pub unsafe fn bootstrap(ctx: *mut Channel, stack_base: *mut u8) {
    let record = ctx as usize;
    let ucp_addr = (record - size_of::<libc::ucontext_t>()) & !(align_of::<libc::ucontext_t>() - 1);
    let stack_len = ucp_addr - stack_base as usize;
    assert!(
        stack_len >= libc::MINSIGSTKSZ,
        "stack block too small for a ucontext coroutine"
    );

    let ucp = ucp_addr as *mut libc::ucontext_t;

    // Safety: `ucp` is in bounds of the caller's block (checked above) and
    // stays valid until the child is first entered; the shim reassembles
    // the channel pointer it is handed in halves.
    unsafe {
        let ret = libc::getcontext(ucp);
        assert!(ret == 0, "getcontext failed");

        (*ucp).uc_stack.ss_sp = stack_base.cast();
        (*ucp).uc_stack.ss_size = stack_len;
        (*ucp).uc_stack.ss_flags = 0;
        (*ucp).uc_link = ptr::null_mut();

        // makecontext passes arguments as C ints; split the pointer into
        // two halves and let the shim put it back together.
        let shim: unsafe extern "C" fn(libc::c_uint, libc::c_uint) = springboard_shim;
        let shim: extern "C" fn() = mem::transmute::<
            unsafe extern "C" fn(libc::c_uint, libc::c_uint),
            extern "C" fn(),
        >(shim);
        let addr = ctx as u64;
        libc::makecontext(
            ucp,
            shim,
            2,
            (addr & 0xffff_ffff) as libc::c_uint,
            (addr >> 32) as libc::c_uint,
        );

        let shared = &*(*ctx).inactive.get();
        shared.inactive.set(ucp);
        swap(ctx);
    }
}

/// Exchanges the running context with the suspended one.
pub unsafe fn swap(ctx: *mut Channel) {
    // Safety: the caller is a party of a live channel, so `inactive`
    // points at the peer's saved context; our own save area lives in this
    // very frame, which stays alive while we are suspended.
    unsafe {
        let shared = &*(*ctx).inactive.get();

        let mut here = MaybeUninit::<libc::ucontext_t>::uninit();
        let peer = shared.inactive.replace(here.as_mut_ptr());

        let ret = libc::swapcontext(here.as_mut_ptr(), peer);
        assert!(ret == 0, "swapcontext failed");
    }
}

/// makecontext entry: runs the springboard body, then transfers to the
/// parent for good.
unsafe extern "C" fn springboard_shim(lo: libc::c_uint, hi: libc::c_uint) {
    let addr = (u64::from(hi) << 32) | u64::from(lo);
    let ctx = addr as usize as *mut Channel;

    // Safety: entered exactly once per channel with the pointer bootstrap
    // split; the record outlives the child.
    unsafe {
        springboard_impl(ctx);

        // Terminal transfer. The child context is dead past this point,
        // so there is nothing to save.
        let shared = &*(*ctx).inactive.get();
        let ret = libc::setcontext(shared.inactive.get());
        assert!(ret == 0, "setcontext failed");
    }
}
