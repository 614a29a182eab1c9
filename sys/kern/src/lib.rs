// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tern kernel.
//!
//! A small preemptive RTOS core for ARM Cortex-M3/M4: fixed thread pool,
//! per-priority scheduling with time slicing, mutexes with priority
//! inheritance, counting semaphores, mailbox IPC with synchronous
//! send/receive/reply, and a numbered SVC gate for unprivileged threads.
//!
//! # Design principles
//!
//! 1. Everything is statically allocated. Thread, mutex, and semaphore
//!    control blocks live in fixed pools; mailboxes are rings of fixed-size
//!    messages. The only dynamic memory is the application-facing heap,
//!    which the kernel itself never allocates from.
//! 2. The portable kernel is exactly that: everything outside `arch` builds
//!    and runs on the host, which is where the test suite lives. The `arch`
//!    seam is a handful of functions (critical sections, the context-switch
//!    trigger, SVC entry, the tick source) plus two exported TCB pointers
//!    whose layout is ABI.
//! 3. A strong preference for safe code where reasonable; `unsafe` is
//!    reserved for the privilege boundary, the heap arena, and the places
//!    where hardware reads our memory.

#![cfg_attr(target_os = "none", no_std)]

pub mod arch;
pub mod crash;
pub mod fdt;
pub mod heap;
pub mod ipc;
pub mod mpu;
pub mod mutex;
pub mod sched;
pub mod sema;
pub mod startup;
pub mod syscalls;
pub mod thread;
pub mod time;
pub mod waitq;

#[cfg(target_os = "none")]
mod fail;

#[cfg(test)]
pub(crate) mod testutil;

use abi::MAX_THREADS;

/// The kernel-state aggregate: every mutable structure the kernel owns, in
/// one place.
///
/// On hardware there is exactly one of these, reached through
/// [`startup::with_kernel`]; all mutation happens inside the short,
/// non-nesting critical sections described in the concurrency model. Tests
/// build their own instances and drive them directly.
pub struct Kernel {
    pub threads: thread::Pool,
    pub sched: sched::Scheduler,
    pub mutexes: mutex::Pool,
    pub sems: sema::Pool,
    /// One mailbox per TCB slot; the thread id indexes both.
    pub mailboxes: [ipc::Mailbox; MAX_THREADS],
    pub heap: heap::Heap,
    /// Monotonic tick counter; wraps, and all deadline math knows it.
    pub ticks: u32,
}

impl Kernel {
    pub const fn new() -> Self {
        Self {
            threads: thread::Pool::new(),
            sched: sched::Scheduler::new(),
            mutexes: mutex::Pool::new(),
            sems: sema::Pool::new(),
            mailboxes: [ipc::Mailbox::EMPTY; MAX_THREADS],
            heap: heap::Heap::empty(),
            ticks: 0,
        }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}
