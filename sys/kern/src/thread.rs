// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thread control blocks and the fixed thread pool.
//!
//! A `Thread` is the sole allocation unit for threads. All of them live in a
//! fixed array inside [`Pool`], indexed by `ThreadId`; an `Inactive` state
//! marks a free slot, and slot indices are reused after destruction.
//!
//! Creation validates the caller-provided stack against the MPU geometry
//! rules, precomputes the stack region registers, and builds the initial
//! stack frame so that the first context switch into the thread restores it
//! as if it had just been preempted. It does *not* enroll the thread in the
//! scheduler -- that is a separate step, so callers can construct all their
//! threads before starting any of them.

use abi::{Priority, ThreadId, DEFAULT_TIME_SLICE, MAX_THREADS};

use crate::mpu::{self, StackRegion};
use crate::{ipc, Kernel};

/// Entry point signature for threads. The argument is whatever pointer-sized
/// value the creator put in the config; it arrives in `r0`.
pub type Entry = extern "C" fn(usize);

/// Lifecycle state of a TCB slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ThreadState {
    /// Free slot; every other field is meaningless.
    Inactive = 0,
    /// Runnable, linked into exactly one per-priority ready list.
    Ready,
    /// The unique current thread; in no ready list.
    Running,
    /// Waiting in at most one wait queue, or on a wakeup tick, or both.
    Blocked,
}

/// Everything a caller specifies to create a thread. The stack buffer is
/// caller-owned and must outlive the thread; the TCB only refers to it.
pub struct ThreadConfig {
    pub entry: Entry,
    pub arg: usize,
    pub name: &'static str,
    pub stack_base: *mut u32,
    /// Stack size in bytes. Must satisfy [`mpu::validate_stack`].
    pub stack_size: u32,
    pub priority: Priority,
    /// Round-robin quantum in ticks; 0 selects [`DEFAULT_TIME_SLICE`].
    pub time_slice: u32,
    /// When false, the thread runs unprivileged and reaches kernel services
    /// only through the SVC gate.
    pub privileged: bool,
}

/// A thread control block.
///
/// `repr(C)` with `stack_pointer` first: the context-switch assembly reads
/// and writes the saved stack pointer through the `CURRENT_TCB` / `NEXT_TCB`
/// globals at offset 0. That layout is ABI; do not reorder.
#[repr(C)]
pub struct Thread {
    /// Saved process stack pointer. **Must stay at offset 0.**
    stack_pointer: u32,
    state: ThreadState,
    /// Self-index, kept redundantly for integrity checks and diagnostics.
    id: ThreadId,
    /// Priority as created; never changes while the thread lives.
    base_priority: Priority,
    /// Effective priority. Rises under priority inheritance, never drops
    /// below `base_priority`.
    current_priority: Priority,
    privileged: bool,
    /// Link for the scheduler's per-priority ready lists.
    next_ready: Option<ThreadId>,
    /// Link for wait queues. Distinct from `next_ready` so scheduler
    /// transitions can never corrupt a wait list or vice versa.
    next_wait: Option<ThreadId>,
    time_slice: u32,
    time_slice_remaining: u32,
    /// Absolute tick at which a sleeping thread becomes ready; 0 = not
    /// sleeping.
    wakeup_tick: u32,
    stack_base: u32,
    stack_size: u32,
    mpu: StackRegion,
    name: &'static str,
}

impl Thread {
    const INACTIVE: Self = Self {
        stack_pointer: 0,
        state: ThreadState::Inactive,
        id: ThreadId::INVALID,
        base_priority: Priority(0),
        current_priority: Priority(0),
        privileged: true,
        next_ready: None,
        next_wait: None,
        time_slice: 0,
        time_slice_remaining: 0,
        wakeup_tick: 0,
        stack_base: 0,
        stack_size: 0,
        mpu: StackRegion::DISABLED,
        name: "",
    };

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub(crate) fn set_state(&mut self, s: ThreadState) {
        self.state = s;
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn privileged(&self) -> bool {
        self.privileged
    }

    pub fn base_priority(&self) -> Priority {
        self.base_priority
    }

    pub fn current_priority(&self) -> Priority {
        self.current_priority
    }

    pub(crate) fn set_current_priority(&mut self, p: Priority) {
        self.current_priority = p;
    }

    pub(crate) fn next_ready(&self) -> Option<ThreadId> {
        self.next_ready
    }

    pub(crate) fn set_next_ready(&mut self, n: Option<ThreadId>) {
        self.next_ready = n;
    }

    pub(crate) fn next_wait(&self) -> Option<ThreadId> {
        self.next_wait
    }

    pub(crate) fn set_next_wait(&mut self, n: Option<ThreadId>) {
        self.next_wait = n;
    }

    /// Burns one tick of quantum; returns true when it has run out.
    pub(crate) fn consume_slice(&mut self) -> bool {
        if self.time_slice_remaining > 0 {
            self.time_slice_remaining -= 1;
        }
        self.time_slice_remaining == 0
    }

    pub(crate) fn refill_slice(&mut self) {
        self.time_slice_remaining = self.time_slice;
    }

    pub fn time_slice_remaining(&self) -> u32 {
        self.time_slice_remaining
    }

    pub fn wakeup_tick(&self) -> u32 {
        self.wakeup_tick
    }

    pub(crate) fn set_wakeup_tick(&mut self, t: u32) {
        self.wakeup_tick = t;
    }

    pub fn stack_base(&self) -> u32 {
        self.stack_base
    }

    pub fn stack_size(&self) -> u32 {
        self.stack_size
    }

    pub fn stack_pointer(&self) -> u32 {
        self.stack_pointer
    }

    /// Precomputed MPU stack region, loaded by the arch layer on context
    /// switch.
    pub fn mpu_region(&self) -> StackRegion {
        self.mpu
    }
}

/// The fixed TCB array.
pub struct Pool {
    slots: [Thread; MAX_THREADS],
}

impl Pool {
    pub const fn new() -> Self {
        Self {
            slots: [Thread::INACTIVE; MAX_THREADS],
        }
    }

    /// Looks up a TCB, tolerating out-of-range ids (returns `None`). The slot
    /// may still be `Inactive`; use [`Pool::is_live`] when that matters.
    pub fn get(&self, id: ThreadId) -> Option<&Thread> {
        self.slots.get(id.index())
    }

    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.slots.get_mut(id.index())
    }

    /// True when `id` names an in-range, non-`Inactive` slot.
    pub fn is_live(&self, id: ThreadId) -> bool {
        self.get(id).is_some_and(|t| t.state != ThreadState::Inactive)
    }

    /// Iterates ids of all live threads, lowest index first. (Wakeup scans
    /// rely on this order; see the tick handler.)
    pub fn live_ids(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, t)| {
            (t.state != ThreadState::Inactive).then_some(ThreadId(i as u8))
        })
    }

    /// Creates a thread in the first free slot and leaves it `Ready` but not
    /// scheduled. Returns `None` when the pool is full or the stack fails MPU
    /// validation.
    pub fn create(&mut self, config: &ThreadConfig) -> Option<ThreadId> {
        let base = config.stack_base as usize as u32;
        if !mpu::validate_stack(base, config.stack_size) {
            return None;
        }

        let index = self
            .slots
            .iter()
            .position(|t| t.state == ThreadState::Inactive)?;
        let id = ThreadId(index as u8);

        let sp = build_initial_frame(config);

        self.slots[index] = Thread {
            stack_pointer: sp,
            state: ThreadState::Ready,
            id,
            base_priority: config.priority,
            current_priority: config.priority,
            privileged: config.privileged,
            next_ready: None,
            next_wait: None,
            time_slice: if config.time_slice == 0 {
                DEFAULT_TIME_SLICE
            } else {
                config.time_slice
            },
            time_slice_remaining: if config.time_slice == 0 {
                DEFAULT_TIME_SLICE
            } else {
                config.time_slice
            },
            wakeup_tick: 0,
            stack_base: base,
            stack_size: config.stack_size,
            mpu: mpu::compute_stack_region(base, config.stack_size),
            name: config.name,
        };
        Some(id)
    }

    /// Returns a slot to the free state. Scheduler and wait-queue removal is
    /// the caller's job; see [`destroy`].
    pub(crate) fn deactivate(&mut self, id: ThreadId) {
        if let Some(t) = self.get_mut(id) {
            *t = Thread::INACTIVE;
        }
    }
}

impl core::ops::Index<ThreadId> for Pool {
    type Output = Thread;

    fn index(&self, id: ThreadId) -> &Thread {
        &self.slots[id.index()]
    }
}

impl core::ops::IndexMut<ThreadId> for Pool {
    fn index_mut(&mut self, id: ThreadId) -> &mut Thread {
        &mut self.slots[id.index()]
    }
}

/// Builds the 16-word initial stack frame at the top of the configured stack
/// and returns the value the TCB should record as the saved stack pointer.
///
/// Layout, top of stack at highest address:
///
/// ```text
///   xPSR  PC  LR  r12  r3  r2  r1  r0     <- hardware-stacked on exception
///   r11  r10  r9  r8  r7  r6  r5  r4      <- software-saved by the switch
/// ```
///
/// `LR` points at the exit trampoline, so a thread whose entry function
/// returns is destroyed rather than wandering off the end of its stack.
fn build_initial_frame(config: &ThreadConfig) -> u32 {
    let words = config.stack_size as usize / core::mem::size_of::<u32>();

    // Safety: the stack buffer is caller-owned, covers `words` words, and per
    // the config contract outlives the thread. We only write within it.
    unsafe {
        let top = config.stack_base.add(words);
        // AAPCS requires 8-byte stack alignment at the point of call.
        let top = (top as usize & !7) as *mut u32;
        let frame = top.sub(16);

        // Software-saved context, popped by the context-switch routine.
        for i in 0..8 {
            frame.add(i).write(0); // r4..r11
        }

        // Hardware exception frame, unstacked automatically on return.
        frame.add(8).write(config.arg as u32); // r0 = argument
        frame.add(9).write(0); // r1
        frame.add(10).write(0); // r2
        frame.add(11).write(0); // r3
        frame.add(12).write(0); // r12
        frame.add(13).write(crate::startup::exit_trampoline as usize as u32); // lr
        frame.add(14).write(config.entry as usize as u32); // pc
        frame.add(15).write(crate::arch::initial_status_register()); // xpsr

        frame as usize as u32
    }
}

/// Tears a thread down completely: out of the scheduler, out of every wait
/// queue, mailbox reset, slot freed for reuse.
///
/// Refuses to destroy the idle thread or an id that is out of range or
/// already free.
pub fn destroy(k: &mut Kernel, id: ThreadId) -> bool {
    if !k.threads.is_live(id) || k.sched.idle_thread() == Some(id) {
        return false;
    }

    crate::arch::enter_critical();
    k.sched.remove_thread(&mut k.threads, id);

    // The thread can sit in at most one wait queue, but it is cheaper to
    // sweep them all than to track which one.
    for i in 0..abi::MAX_MUTEXES {
        crate::mutex::forget_waiter(k, i, id);
    }
    for i in 0..abi::MAX_SEMAPHORES {
        crate::sema::forget_waiter(k, i, id);
    }
    ipc::forget_waiter(k, id);

    ipc::reset_mailbox(k, id);
    k.threads.deactivate(id);
    crate::arch::exit_critical();
    true
}
