// Copyright 2025 The coro Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Portable backend over kernel threads.
//!
//! The child runs on a dedicated OS thread and `swap` is a
//! condition-variable ping-pong under a per-channel mutex, so exactly one
//! party runs at any instant. This is the same strictly-alternating
//! execution as the native backend, two to three orders of magnitude
//! slower per round-trip and without hard-realtime bounds. Useful where no
//! native backend and no ucontext API exist.
//!
//! The parent joins the child thread inside the swap that observes
//! termination. That ordering matters: the synchronisation state lives in
//! the channel record, which may sit in memory the parent is about to
//! release.

use crate::{Channel, springboard_impl};
use std::sync::{Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

pub const STACK_ALIGNMENT: usize = 16;

/// Hand-off state shared by the two parties.
pub struct Context {
    state: Mutex<State>,
    wake: Condvar,
}

struct State {
    turn: Turn,
    child: Option<ThreadId>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Turn {
    Parent,
    Child,
}

impl Turn {
    fn other(self) -> Self {
        match self {
            Turn::Parent => Turn::Child,
            Turn::Child => Turn::Parent,
        }
    }
}

impl Context {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                turn: Turn::Parent,
                child: None,
                handle: None,
            }),
            wake: Condvar::new(),
        }
    }
}

struct Carry(*mut Channel);

// Safety: the record is shared between exactly two threads which never run
// at the same time; every access to it is serialised by the turn protocol.
unsafe impl Send for Carry {}

/// Spawns the child thread and blocks until its first hand-off.
pub unsafe fn bootstrap(ctx: *mut Channel, _stack_base: *mut u8) {
    // Safety: the record was initialised by the caller and outlives both
    // parties.
    let shared = unsafe { &*(*ctx).inactive.get() };

    // Holding the lock across the spawn means the child cannot observe the
    // state before the thread id and handle are recorded: its first lock
    // acquisition blocks until we sit down in wait().
    let mut state = shared.state.lock().expect("channel state poisoned");

    let carry = Carry(ctx);
    let handle = thread::spawn(move || child_main(carry));

    state.child = Some(handle.thread().id());
    state.handle = Some(handle);
    state.turn = Turn::Child;

    while state.turn != Turn::Parent {
        state = shared.wake.wait(state).expect("channel state poisoned");
    }
    reap(ctx, &mut state);
}

/// Hands the turn to the peer and blocks until it is handed back.
pub unsafe fn swap(ctx: *mut Channel) {
    // Safety: the caller is a party of a live channel.
    let shared = unsafe { &*(*ctx).inactive.get() };

    let mut state = shared.state.lock().expect("channel state poisoned");
    let me = if state.child == Some(thread::current().id()) {
        Turn::Child
    } else {
        Turn::Parent
    };

    state.turn = me.other();
    shared.wake.notify_one();
    while state.turn != me {
        state = shared.wake.wait(state).expect("channel state poisoned");
    }

    if me == Turn::Parent {
        reap(ctx, &mut state);
    }
}

fn child_main(carry: Carry) {
    let ctx = carry.0;

    // Safety: entered exactly once per channel; the record outlives the
    // child and accesses to it are serialised by the turn protocol.
    unsafe {
        springboard_impl(ctx);
    }

    // Terminal hand-off: give the turn back and fall off the end of the
    // thread. The parent joins us before the record can be released.
    // Safety: as above.
    let shared = unsafe { &*(*ctx).inactive.get() };
    let mut state = shared.state.lock().expect("channel state poisoned");
    state.turn = Turn::Parent;
    shared.wake.notify_one();
    drop(state);
}

/// Joins the child thread once it has terminated, so that releasing the
/// block holding this record cannot race the exiting thread.
fn reap(ctx: *mut Channel, state: &mut State) {
    // Safety: `entry` is cleared by the child strictly before its terminal
    // hand-off, and we hold the turn.
    let terminated = unsafe { (*ctx).entry.get().is_none() };
    if terminated {
        if let Some(handle) = state.handle.take() {
            handle.join().expect("coroutine thread panicked");
        }
    }
}
