// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Priority scheduler with preemption and round-robin time slicing.
//!
//! Ready threads live in one singly-linked FIFO list per priority level
//! (head and tail ids, links through the TCB `next_ready` field), and a
//! one-word bitmap advertises which levels are non-empty. "Highest ready
//! priority" is a count-trailing-zeros away, so selection cost does not
//! depend on thread count.
//!
//! [`Scheduler::switch_context`] is the *only* function that changes the
//! current thread. Everything else -- tick accounting, yield, block/unblock
//! -- merely arranges state so that the next `switch_context` picks the right
//! victim, and reports whether one is needed. The idle thread is never
//! enrolled in a ready list; it is the fallback when the bitmap is empty.

use abi::{Priority, ThreadId, PRIORITY_LEVELS};

use crate::thread::{Pool, ThreadState};
use crate::{arch, Kernel};

pub struct Scheduler {
    /// Bit *p* set iff ready list *p* is non-empty.
    ready_bitmap: u32,
    heads: [Option<ThreadId>; PRIORITY_LEVELS],
    tails: [Option<ThreadId>; PRIORITY_LEVELS],
    current: Option<ThreadId>,
    idle: Option<ThreadId>,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            ready_bitmap: 0,
            heads: [None; PRIORITY_LEVELS],
            tails: [None; PRIORITY_LEVELS],
            current: None,
            idle: None,
        }
    }

    pub fn current_thread(&self) -> Option<ThreadId> {
        self.current
    }

    pub fn idle_thread(&self) -> Option<ThreadId> {
        self.idle
    }

    /// Registers the idle fallback. The idle thread must never also be
    /// enrolled via [`Scheduler::add_thread`].
    pub fn set_idle_thread(&mut self, id: ThreadId) {
        self.idle = Some(id);
    }

    /// Forces `id` to be the running thread. Used at startup before the first
    /// context switch, and by tests to adopt a thread's perspective.
    pub fn set_current(&mut self, pool: &mut Pool, id: ThreadId) {
        self.current = Some(id);
        pool[id].set_state(ThreadState::Running);
    }

    /// Enrolls a `Ready` thread at the tail of its priority class.
    pub fn add_thread(&mut self, pool: &mut Pool, id: ThreadId) {
        self.enqueue_ready(pool, id);
    }

    /// Removes a thread from scheduler custody entirely: its ready list if
    /// enqueued, or the current slot if it is running. Used on destruction.
    pub fn remove_thread(&mut self, pool: &mut Pool, id: ThreadId) {
        match pool[id].state() {
            ThreadState::Ready => {
                let p = pool[id].current_priority();
                self.unlink_ready(pool, id, p);
            }
            ThreadState::Running => {
                if self.current == Some(id) {
                    self.current = None;
                }
            }
            _ => {}
        }
    }

    /// Selects and installs the next thread to run, returning its id.
    ///
    /// The outgoing thread, if still `Running`, is demoted to `Ready` and
    /// appended to the tail of its class, which is what rotates equal-priority
    /// peers. A blocked or destroyed outgoing thread is simply left wherever
    /// the blocking code put it.
    ///
    /// # Panics
    ///
    /// If no thread is ready and no idle thread is registered. Once the
    /// scheduler is live that is an unrecoverable kernel state, and it lands
    /// in the fault path.
    pub fn switch_context(&mut self, pool: &mut Pool) -> ThreadId {
        if let Some(out) = self.current {
            if pool[out].state() == ThreadState::Running {
                pool[out].set_state(ThreadState::Ready);
                self.enqueue_ready(pool, out);
            }
        }

        let next = match self.pop_highest(pool) {
            Some(id) => id,
            None => self.idle.expect("nothing runnable and no idle thread"),
        };
        pool[next].set_state(ThreadState::Running);
        self.current = Some(next);
        next
    }

    /// One tick of time accounting for the current thread. Returns true when
    /// the caller should perform a context switch: quantum exhausted, or the
    /// idle thread is running while real work is ready.
    pub fn tick(&mut self, pool: &mut Pool) -> bool {
        let Some(cur) = self.current else {
            return false;
        };

        if Some(cur) == self.idle {
            return self.ready_bitmap != 0;
        }

        if pool[cur].consume_slice() {
            pool[cur].refill_slice();
            return true;
        }
        false
    }

    /// Moves the current thread from `Running` to `Blocked`. Deliberately
    /// does not switch; the caller follows up with `switch_context` inside
    /// the same critical section.
    pub fn block_current(&mut self, pool: &mut Pool) {
        if let Some(cur) = self.current {
            pool[cur].set_state(ThreadState::Blocked);
        }
    }

    /// Makes a blocked thread ready and enrolls it. Returns true iff the
    /// woken thread is strictly more important than the current one, i.e.
    /// the caller should preempt.
    pub fn unblock(&mut self, pool: &mut Pool, id: ThreadId) -> bool {
        if pool[id].state() != ThreadState::Blocked {
            return false;
        }
        pool[id].set_state(ThreadState::Ready);
        self.enqueue_ready(pool, id);

        match self.current {
            Some(cur) => pool[id]
                .current_priority()
                .is_more_important_than(pool[cur].current_priority()),
            None => false,
        }
    }

    /// Changes a thread's effective priority. Only the priority-inheritance
    /// path calls this. A `Ready` thread is moved to the tail of its new
    /// class; a thread sitting in a wait queue is *not* re-sorted there (the
    /// queue's sort key is the priority at insertion time).
    pub fn set_priority(&mut self, pool: &mut Pool, id: ThreadId, new: Priority) {
        let old = pool[id].current_priority();
        if old == new {
            return;
        }
        if pool[id].state() == ThreadState::Ready {
            self.unlink_ready(pool, id, old);
            pool[id].set_current_priority(new);
            self.enqueue_ready(pool, id);
        } else {
            pool[id].set_current_priority(new);
        }
    }

    /// Number of threads across all ready lists. Diagnostic.
    pub fn ready_count(&self, pool: &Pool) -> usize {
        let mut n = 0;
        for p in 0..PRIORITY_LEVELS {
            let mut cursor = self.heads[p];
            while let Some(id) = cursor {
                n += 1;
                cursor = pool[id].next_ready();
            }
        }
        n
    }

    fn enqueue_ready(&mut self, pool: &mut Pool, id: ThreadId) {
        let p = pool[id].current_priority().0 as usize;
        pool[id].set_next_ready(None);
        match self.tails[p] {
            Some(tail) => pool[tail].set_next_ready(Some(id)),
            None => self.heads[p] = Some(id),
        }
        self.tails[p] = Some(id);
        self.ready_bitmap |= 1 << p;
    }

    fn pop_highest(&mut self, pool: &mut Pool) -> Option<ThreadId> {
        if self.ready_bitmap == 0 {
            return None;
        }
        let p = self.ready_bitmap.trailing_zeros() as usize;
        let head = self.heads[p].expect("bitmap/list mismatch");
        self.heads[p] = pool[head].next_ready();
        if self.heads[p].is_none() {
            self.tails[p] = None;
            self.ready_bitmap &= !(1 << p);
        }
        pool[head].set_next_ready(None);
        Some(head)
    }

    fn unlink_ready(&mut self, pool: &mut Pool, id: ThreadId, pri: Priority) {
        let p = pri.0 as usize;
        let Some(head) = self.heads[p] else {
            return;
        };

        if head == id {
            self.heads[p] = pool[id].next_ready();
        } else {
            let mut prev = head;
            loop {
                match pool[prev].next_ready() {
                    Some(next) if next == id => {
                        let new_next = pool[id].next_ready();
                        pool[prev].set_next_ready(new_next);
                        break;
                    }
                    Some(next) => prev = next,
                    None => return, // not in this list after all
                }
            }
            if self.tails[p] == Some(id) {
                self.tails[p] = Some(prev);
            }
        }
        if self.heads[p].is_none() {
            self.tails[p] = None;
            self.ready_bitmap &= !(1 << p);
        }
        pool[id].set_next_ready(None);
    }
}

/// Runs the selection bookkeeping and arms the pending context switch by
/// publishing the next TCB to the arch layer. Must be called with interrupts
/// disabled; the caller re-enables them and then triggers the switch.
pub(crate) fn switch_and_arm(k: &mut Kernel) -> ThreadId {
    let next = k.sched.switch_context(&mut k.threads);
    arch::set_next_tcb(&mut k.threads[next]);
    next
}

/// Voluntarily gives up the CPU: the current thread's quantum is refilled and
/// it rotates to the back of its priority class.
pub fn yield_now(k: &mut Kernel) {
    arch::enter_critical();
    if let Some(cur) = k.sched.current_thread() {
        k.threads[cur].refill_slice();
    }
    switch_and_arm(k);
    arch::exit_critical();
    arch::trigger_context_switch();
}

#[cfg(test)]
impl Scheduler {
    /// Checks the universal scheduler invariants against the pool. Test-only.
    pub(crate) fn assert_consistent(&self, pool: &Pool) {
        for p in 0..PRIORITY_LEVELS {
            let mut cursor = self.heads[p];
            let mut last = None;
            let mut seen = 0;
            while let Some(id) = cursor {
                assert_eq!(pool[id].state(), ThreadState::Ready);
                assert_eq!(pool[id].current_priority().0 as usize, p);
                assert_ne!(self.current, Some(id));
                last = Some(id);
                seen += 1;
                assert!(seen <= abi::MAX_THREADS, "ready list cycle");
                cursor = pool[id].next_ready();
            }
            assert_eq!(self.tails[p], last);
            assert_eq!(self.ready_bitmap & (1 << p) != 0, seen != 0);
        }
        if let Some(cur) = self.current {
            assert_eq!(pool[cur].state(), ThreadState::Running);
        }
    }
}
