// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared scaffolding for the host test suite.
//!
//! Tests drive a private `Kernel` instance through the fake arch. Because
//! there is no real context switch on the host, a blocking operation returns
//! to the test immediately after its bookkeeping; the helpers here let a
//! test adopt different threads' perspectives the way the scheduler would
//! have arranged them on hardware.

use abi::{Priority, ThreadId};

use crate::thread::{ThreadConfig, ThreadState};
use crate::Kernel;

pub const STACK_BYTES: u32 = 1024;

/// MPU rules require stacks aligned to their (power-of-two) size.
#[repr(align(1024))]
pub struct Stack(pub [u32; 256]);

/// A stack buffer that outlives the test's threads.
pub fn leak_stack() -> *mut u32 {
    Box::leak(Box::new(Stack([0; 256]))).0.as_mut_ptr()
}

pub extern "C" fn noop_entry(_arg: usize) {}

/// A bare pool with one thread per listed priority, ids in order. For tests
/// below the scheduler (wait queues, lists).
pub fn pool_with(priorities: &[u8]) -> crate::thread::Pool {
    let mut pool = crate::thread::Pool::new();
    for &p in priorities {
        pool.create(&ThreadConfig {
            entry: noop_entry,
            arg: 0,
            name: "t",
            stack_base: leak_stack(),
            stack_size: STACK_BYTES,
            priority: Priority(p),
            time_slice: 0,
            privileged: true,
        })
        .expect("thread pool full");
    }
    pool
}

/// Fresh kernel with an idle thread registered, fake-arch state cleared.
pub fn kernel_with_idle() -> Kernel {
    crate::arch::testing::reset();
    let mut k = Kernel::new();
    let idle = k
        .threads
        .create(&ThreadConfig {
            entry: noop_entry,
            arg: 0,
            name: "idle",
            stack_base: leak_stack(),
            stack_size: STACK_BYTES,
            priority: Priority::IDLE,
            time_slice: 1,
            privileged: true,
        })
        .expect("idle thread");
    k.sched.set_idle_thread(idle);
    k
}

/// Creates and enrolls a thread.
pub fn spawn(k: &mut Kernel, name: &'static str, priority: u8) -> ThreadId {
    let id = k
        .threads
        .create(&ThreadConfig {
            entry: noop_entry,
            arg: 0,
            name,
            stack_base: leak_stack(),
            stack_size: STACK_BYTES,
            priority: Priority(priority),
            time_slice: 0,
            privileged: true,
        })
        .expect("thread pool full");
    k.sched.add_thread(&mut k.threads, id);
    id
}

/// Takes a Ready thread out of scheduler custody and blocks it, as if it had
/// parked itself on something.
pub fn park(k: &mut Kernel, id: ThreadId) {
    k.sched.remove_thread(&mut k.threads, id);
    k.threads[id].set_state(ThreadState::Blocked);
}

/// Makes `id` the running thread the way a context switch would: the old
/// current rotates back to Ready, `id` leaves its ready list.
pub fn run(k: &mut Kernel, id: ThreadId) {
    if k.sched.current_thread() == Some(id) {
        return;
    }
    if let Some(cur) = k.sched.current_thread() {
        if k.threads[cur].state() == ThreadState::Running {
            k.threads[cur].set_state(ThreadState::Ready);
            k.sched.add_thread(&mut k.threads, cur);
        }
    }
    k.sched.remove_thread(&mut k.threads, id);
    k.sched.set_current(&mut k.threads, id);
}
