// Copyright 2025 The coro Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Native context-switch backend.
//!
//! Each architecture provides a `Context`, the saved {program counter,
//! stack pointer, frame pointer, reserved callee-saved register} quadruple
//! stored in the channel record, and three primitives over `*mut Channel`:
//!
//! - `bootstrap` saves the caller's context, points the stack pointer at
//!   the channel record (aligned down to `STACK_ALIGNMENT`) and *calls*
//!   [`springboard`] so the ABI's stack-alignment rule at function entry
//!   holds.
//! - `swap` exchanges the running context for the one stored in the record
//!   and jumps to its resume address.
//! - `finish` is the one-way terminal variant of `swap`: it restores the
//!   parent context without saving anything.
//!
//! Only the quadruple is saved explicitly. Every other callee-saved
//! register (integer and floating-point alike) is declared as an asm
//! clobber, so
//! the compiler spills exactly the registers that are live across the
//! switch. The fourth slot exists because one callee-saved register per
//! architecture (rbx / ebx / x19 / r7 / s1) is reserved by the code
//! generator and cannot appear in a clobber list.

cfg_if::cfg_if! {
    if #[cfg(any(target_arch = "riscv64", target_arch = "riscv32"))] {
        mod riscv;
        pub use riscv::*;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::*;
    } else if #[cfg(all(target_arch = "x86_64", not(windows)))] {
        mod x86_64;
        pub use x86_64::*;
    } else if #[cfg(target_arch = "x86")] {
        mod x86;
        pub use x86::*;
    } else if #[cfg(all(target_arch = "arm", any(not(target_feature = "thumb-mode"), target_feature = "thumb2")))] {
        mod arm;
        pub use arm::*;
    } else {
        compile_error!(
            "no native context-switch backend for this target; \
             enable the \"threads\" feature (or \"os-context\" on linux-gnu)"
        );
    }
}

/// First and only frame on a fresh coroutine stack.
///
/// Runs the shared springboard body (pull the argument, run the user entry,
/// mark the channel terminated) and then performs the terminal transfer
/// back to the parent. Entered exactly once per channel, by `bootstrap`.
pub(super) unsafe extern "C" fn springboard(ctx: *mut crate::Channel) -> ! {
    // Safety: bootstrap enters us on the fresh child stack with a fully
    // initialised record.
    unsafe {
        crate::springboard_impl(ctx);
        finish(ctx)
    }
}
