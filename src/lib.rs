//! Stackful, asymmetric, cooperative coroutines.
//!
//! Every coroutine owns a full call stack and is paired with its creator
//! through a [`Channel`]: a small record placed at the high end of the
//! coroutine's own stack block. The record holds the saved execution context
//! of whichever party is currently suspended, the child's entry function,
//! and a single-slot rendezvous cell. Suspending and resuming is a single
//! context switch that saves and restores {program counter, stack pointer,
//! frame pointer} plus whatever callee-saved state the compiler decides to
//! spill around the switch. There is no scheduler and no hidden global
//! state, which makes the channels usable from real-time callbacks and
//! from independent host threads at the same time.
//!
//! Control transfers strictly between a parent and its immediate child, and
//! exactly one party of a channel runs at any instant. Data moves through
//! the rendezvous cell: [`Channel::yield_to`] deposits a datum and hands
//! control over, [`Channel::recv`] blocks (by handing control over) until
//! the peer deposits one. A `None` payload always means *end of stream*;
//! a child that receives it is expected to return, which surfaces to the
//! parent as `None` from its next [`Channel::recv`].
//!
//! The context switch itself comes from one of three interchangeable
//! backends: per-architecture inline assembly (the default), the host's
//! ucontext API (`os-context` feature), or one kernel thread per coroutine
//! with a condition-variable hand-off (`threads` feature). The fallbacks
//! trade switch latency for portability; their observable behaviour is
//! identical.

#![cfg_attr(all(not(test), target_os = "none"), no_std)]

use core::cell::{Cell, UnsafeCell};
use core::marker::PhantomData;
use core::ptr::{self, NonNull};

cfg_if::cfg_if! {
    if #[cfg(feature = "threads")] {
        mod threads;
        use threads as backend;
        pub use threads::STACK_ALIGNMENT;
    } else if #[cfg(all(feature = "os-context", target_os = "linux", target_env = "gnu"))] {
        mod ucontext;
        use ucontext as backend;
        pub use ucontext::STACK_ALIGNMENT;
    } else {
        mod arch;
        use arch as backend;
        pub use arch::STACK_ALIGNMENT;
    }
}

#[cfg(unix)]
mod stack;

#[cfg(unix)]
pub use stack::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};

/// A coroutine's top-level function.
///
/// Receives the channel that pairs the coroutine with its creator and the
/// argument the creator passed at construction (`None` if the argument was
/// the end-of-stream marker). Returning from this function terminates the
/// coroutine.
pub type Entry = fn(&Channel, Option<NonNull<u8>>);

/// Contents of the rendezvous cell.
///
/// This is the variant-tag rendering of the classic sentinel scheme: a
/// dedicated `Empty` state instead of a magic address, and `End` instead of
/// overloading a null payload.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// No datum present; the receiver has taken the previous one.
    Empty,
    /// End of stream in this direction.
    End,
    /// A user payload.
    Datum(NonNull<u8>),
}

/// Hook installed by the allocating constructor so the stack block can be
/// reclaimed once the parent observes termination.
#[derive(Clone, Copy)]
struct ReleaseHook {
    argument: *mut u8,
    release: unsafe fn(*mut u8),
}

/// The rendezvous record pairing one parent coroutine with one child.
///
/// A channel is identified by its address; the record lives inside the
/// child's stack allocation (at its high end), so its lifetime is exactly
/// the lifetime of the stack block. Both parties mutate the record, but
/// never concurrently: each party touches it only while it is the running
/// one, and every context switch is a compiler barrier.
#[repr(C)]
pub struct Channel {
    /// Saved execution context of whichever party is suspended. The
    /// per-architecture assembly addresses this field by offset and relies
    /// on it being first.
    pub(crate) inactive: UnsafeCell<backend::Context>,
    /// The child's entry function; `None` exactly once the child has
    /// returned. Set to `None` by the springboard, never reset.
    pub(crate) entry: Cell<Option<Entry>>,
    /// Single-slot rendezvous cell.
    pub(crate) value: Cell<Slot>,
    /// Optional reclamation hook, taken at most once.
    pub(crate) release: Cell<Option<ReleaseHook>>,
    /// Channel must be `!Send`.
    /// ```compile_fail
    /// fn send<T: Send>() {}
    /// send::<coro::Channel>();
    /// ```
    pub(crate) _not_send: PhantomData<*mut ()>,
}

// The record is placed at a STACK_ALIGNMENT boundary, which must satisfy
// its own alignment.
const _: () = assert!(align_of::<Channel>() <= STACK_ALIGNMENT);

impl Channel {
    /// Size of the channel record, for sizing static storage that doubles
    /// as a coroutine stack.
    pub const RECORD_SIZE: usize = size_of::<Channel>();

    /// Creates a coroutine inside a caller-supplied block of memory.
    ///
    /// The channel record is placed at the high end of the block, aligned
    /// down to [`STACK_ALIGNMENT`]; the coroutine's stack grows downward
    /// from just below the record. The child runs immediately, up to its
    /// first suspension, before this returns.
    ///
    /// `arg` is deposited in the rendezvous cell for the child's entry
    /// function; `None` hands the child an immediate end-of-stream.
    ///
    /// # Safety
    ///
    /// `block` must be valid for reads and writes for `len` bytes and must
    /// outlive every use of the returned channel. `len` must accommodate
    /// the record plus the deepest call chain the child will run; overflow
    /// of the child stack is not detected.
    ///
    /// # Panics
    ///
    /// Panics if `len` cannot hold the channel record.
    pub unsafe fn with_stack(
        entry: Entry,
        arg: Option<NonNull<u8>>,
        block: NonNull<u8>,
        len: usize,
    ) -> NonNull<Channel> {
        assert!(
            len >= Self::RECORD_SIZE + STACK_ALIGNMENT,
            "stack block cannot hold the channel record"
        );

        let top = block.as_ptr() as usize + len;
        let record = (top - Self::RECORD_SIZE) & !(STACK_ALIGNMENT - 1);
        let ctx = record as *mut Channel;

        // Safety: `record` is in bounds (checked above), aligned, and the
        // caller guarantees the block is writable.
        unsafe {
            ctx.write(Channel {
                inactive: UnsafeCell::new(backend::Context::new()),
                entry: Cell::new(Some(entry)),
                value: Cell::new(match arg {
                    Some(datum) => Slot::Datum(datum),
                    None => Slot::End,
                }),
                release: Cell::new(None),
                _not_send: PhantomData,
            });

            backend::bootstrap(ctx, block.as_ptr());

            NonNull::new_unchecked(ctx)
        }
    }

    /// Creates a coroutine on a freshly allocated [`DEFAULT_STACK_SIZE`]
    /// stack with a guard page below it.
    ///
    /// The stack is reclaimed automatically once the parent observes
    /// termination (inside [`Channel::recv`]) or calls
    /// [`Channel::close_and_join`]. Allocation failure is fatal.
    #[cfg(unix)]
    pub fn create(entry: Entry, arg: Option<NonNull<u8>>) -> NonNull<Channel> {
        let block = stack::allocate();
        // Safety: a fresh mapping of DEFAULT_STACK_SIZE usable bytes, alive
        // until the release hook runs.
        let ctx = unsafe { Self::with_stack(entry, arg, block, stack::DEFAULT_STACK_SIZE) };
        // Safety: the record is live; the child is suspended.
        unsafe { ctx.as_ref() }.release.set(Some(ReleaseHook {
            argument: block.as_ptr(),
            release: stack::release,
        }));
        ctx
    }

    /// Deposits `payload` in the rendezvous cell and transfers control to
    /// the peer. Returns when the peer transfers back; by then the cell is
    /// logically empty or holds the peer's next datum.
    ///
    /// A `None` payload is the end-of-stream marker for the peer.
    ///
    /// # Safety
    ///
    /// The caller must be one of the two parties of this channel, the
    /// channel's stack block must still be live, and a pointer payload must
    /// stay valid until the caller is resumed.
    pub unsafe fn yield_to(&self, payload: Option<NonNull<u8>>) {
        self.value.set(match payload {
            Some(datum) => Slot::Datum(datum),
            None => Slot::End,
        });
        // Safety: caller is a party of a live channel.
        unsafe { backend::swap(ptr::from_ref(self).cast_mut()) };
    }

    /// Takes the peer's next datum, transferring control to the peer if the
    /// cell is empty and the peer is still running.
    ///
    /// Returns `None` when the stream ends: either the peer yielded the
    /// end-of-stream marker, or the child terminated. In the latter case
    /// the channel's backing memory is released (if this channel owns it)
    /// before returning, and the channel must not be touched again.
    ///
    /// # Safety
    ///
    /// The caller must be one of the two parties of this channel and the
    /// channel's stack block must still be live.
    pub unsafe fn recv(&self) -> Option<NonNull<u8>> {
        if self.entry.get().is_some() && self.value.get() == Slot::Empty {
            // Safety: caller is a party of a live channel.
            unsafe { backend::swap(ptr::from_ref(self).cast_mut()) };
        }

        if self.entry.get().is_none() {
            // The child has returned; tear down and surface end-of-stream.
            // Safety: per this function's contract.
            unsafe { self.release() };
            return None;
        }

        match self.value.replace(Slot::Empty) {
            Slot::Datum(datum) => Some(datum),
            _ => None,
        }
    }

    /// Signals end-of-stream to the child until it terminates, then
    /// releases the channel's backing memory (if this channel owns it).
    ///
    /// This terminates for any child that falls out of its consume loop on
    /// end-of-stream, including one that is still mid-way through a
    /// payload-less [`Channel::switch`] loop. Calling it on an
    /// already-terminated channel just releases the resources.
    ///
    /// # Safety
    ///
    /// Must be called by the parent of a live channel whose child exits on
    /// end-of-stream input.
    pub unsafe fn close_and_join(&self) {
        while self.entry.get().is_some() {
            // Safety: per this function's contract.
            unsafe { self.yield_to(None) };
        }
        // Safety: the child has terminated; nothing touches the record
        // after the hook runs.
        unsafe { self.release() };
    }

    /// Raw hand-off: transfers control to the peer without any payload
    /// semantics. Does nothing if the child has terminated.
    ///
    /// # Safety
    ///
    /// The caller must be one of the two parties of this channel and the
    /// channel's stack block must still be live.
    pub unsafe fn switch(&self) {
        if self.entry.get().is_some() {
            // Safety: caller is a party of a live channel.
            unsafe { backend::swap(ptr::from_ref(self).cast_mut()) };
        }
    }

    /// Runs the reclamation hook, at most once.
    ///
    /// # Safety
    ///
    /// The hook frees the block holding this very record, so it is copied
    /// out first and `self` must not be touched afterwards.
    unsafe fn release(&self) {
        if let Some(hook) = self.release.take() {
            // Safety: the argument was captured alongside the hook by the
            // constructor that owns the block.
            unsafe { (hook.release)(hook.argument) };
        }
    }
}

/// Shared body of the first function run on a fresh coroutine stack.
///
/// Takes the construction argument out of the rendezvous cell (so the
/// parent's first `recv` correctly blocks), runs the user entry, and marks
/// the channel terminated. Each backend wraps this with its own terminal
/// transfer back to the parent.
pub(crate) unsafe fn springboard_impl(ctx: *mut Channel) {
    // Safety: the record was fully initialised before the backend entered
    // the child.
    let channel = unsafe { &*ctx };

    let arg = match channel.value.replace(Slot::Empty) {
        Slot::Datum(datum) => Some(datum),
        _ => None,
    };

    let entry = channel
        .entry
        .get()
        .expect("fresh coroutine without an entry function");

    #[cfg(target_os = "none")]
    entry(channel, arg);

    #[cfg(not(target_os = "none"))]
    {
        // Unwinding through a context switch is undefined; contain panics
        // here and give up on the whole process instead.
        let caught =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| entry(channel, arg)));
        if caught.is_err() {
            std::process::abort();
        }
    }

    channel.entry.set(None);
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    reason = "the tests drive the raw pointer protocol; the safety argument is the strict alternation documented on the operations"
)]
mod tests {
    use super::*;

    fn give<T>(value: &T) -> Option<NonNull<u8>> {
        Some(NonNull::from(value).cast())
    }

    unsafe fn take<T: Copy>(datum: NonNull<u8>) -> T {
        unsafe { *datum.cast::<T>().as_ref() }
    }

    fn counter(ctx: &Channel, _arg: Option<NonNull<u8>>) {
        for i in 0..5u64 {
            unsafe { ctx.yield_to(give(&i)) };
        }
    }

    fn doubler(ctx: &Channel, arg: Option<NonNull<u8>>) {
        let doubled = unsafe { take::<u64>(arg.unwrap()) } * 2;
        unsafe { ctx.yield_to(give(&doubled)) };
    }

    fn nop(_ctx: &Channel, _arg: Option<NonNull<u8>>) {}

    #[test]
    fn drains_a_generator() {
        let ctx = Channel::create(counter, None);
        let ctx = unsafe { ctx.as_ref() };

        let mut got = Vec::new();
        while let Some(datum) = unsafe { ctx.recv() } {
            got.push(unsafe { take::<u64>(datum) });
        }
        assert_eq!(got, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn runs_in_caller_memory() {
        let mut block = vec![0u8; 64 * 1024];
        let base = NonNull::new(block.as_mut_ptr()).unwrap();
        let ctx = unsafe { Channel::with_stack(counter, None, base, block.len()) };
        let ctx = unsafe { ctx.as_ref() };

        let mut total = 0;
        while let Some(datum) = unsafe { ctx.recv() } {
            total += unsafe { take::<u64>(datum) };
        }
        assert_eq!(total, 10);

        // Terminated, nothing to release: these must be no-ops.
        unsafe { ctx.switch() };
        unsafe { ctx.close_and_join() };
    }

    #[test]
    fn passes_the_argument() {
        let input = 21u64;
        let ctx = Channel::create(doubler, give(&input));
        let ctx = unsafe { ctx.as_ref() };

        let datum = unsafe { ctx.recv() }.expect("child yields once");
        assert_eq!(unsafe { take::<u64>(datum) }, 42);
        assert!(unsafe { ctx.recv() }.is_none());
    }

    #[test]
    fn immediate_termination_is_end_of_stream() {
        let ctx = Channel::create(nop, None);
        assert!(unsafe { ctx.as_ref().recv() }.is_none());
    }

    #[test]
    fn record_is_at_the_top_of_the_block() {
        let mut block = vec![0u8; 32 * 1024];
        let base = NonNull::new(block.as_mut_ptr()).unwrap();
        let ctx = unsafe { Channel::with_stack(nop, None, base, block.len()) };

        let record = ctx.as_ptr() as usize;
        let top = base.as_ptr() as usize + block.len();
        assert_eq!(record % STACK_ALIGNMENT, 0);
        assert!(record + Channel::RECORD_SIZE <= top);
        assert!(top - record < Channel::RECORD_SIZE + STACK_ALIGNMENT + STACK_ALIGNMENT);
    }
}
