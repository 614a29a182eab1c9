// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counting semaphores.
//!
//! Binary semaphore: create with `max_count = 1`. Counting semaphore: a
//! larger `max_count` manages a pool of identical resources.
//!
//! `signal` hands a unit directly to the most important waiter instead of
//! incrementing the count; the waiter's decrement was anticipated when it
//! blocked. This is the only pair of kernel operations legal from interrupt
//! handlers besides notifications: `signal` and `try_wait` never block, so an
//! ISR may produce into or poll a semaphore.

use abi::{SemId, ThreadId, MAX_SEMAPHORES};

use crate::{arch, sched, waitq, Kernel};

pub(crate) struct Semaphore {
    active: bool,
    count: u32,
    max_count: u32,
    wait_head: Option<ThreadId>,
    name: &'static str,
}

impl Semaphore {
    const FREE: Self = Self {
        active: false,
        count: 0,
        max_count: 0,
        wait_head: None,
        name: "",
    };
}

/// Fixed pool of semaphore control blocks.
pub struct Pool {
    slots: [Semaphore; MAX_SEMAPHORES],
}

impl Pool {
    pub const fn new() -> Self {
        Self {
            slots: [Semaphore::FREE; MAX_SEMAPHORES],
        }
    }

    fn is_active(&self, id: SemId) -> bool {
        self.slots.get(id.index()).is_some_and(|s| s.active)
    }

    pub fn count(&self, id: SemId) -> u32 {
        self.slots.get(id.index()).map_or(0, |s| s.count)
    }

    pub fn name(&self, id: SemId) -> &'static str {
        self.slots.get(id.index()).map_or("", |s| s.name)
    }
}

/// Allocates a semaphore with `initial <= max` units available. Returns
/// `None` on pool exhaustion, bad counts, or from interrupt context.
pub fn create(
    k: &mut Kernel,
    initial: u32,
    max: u32,
    name: &'static str,
) -> Option<SemId> {
    if arch::in_isr_context() || initial > max || max == 0 {
        return None;
    }
    let index = k.sems.slots.iter().position(|s| !s.active)?;
    k.sems.slots[index] = Semaphore {
        active: true,
        count: initial,
        max_count: max,
        wait_head: None,
        name,
    };
    Some(SemId(index as u8))
}

pub fn destroy(k: &mut Kernel, id: SemId) {
    if arch::in_isr_context() {
        return;
    }
    if let Some(s) = k.sems.slots.get_mut(id.index()) {
        s.active = false;
    }
}

/// Takes one unit, blocking while none are available. Returns false for bad
/// ids and from interrupt context. On resume after blocking, the unit was
/// consumed on the caller's behalf by the signaller.
pub fn wait(k: &mut Kernel, id: SemId) -> bool {
    if arch::in_isr_context() || !k.sems.is_active(id) {
        return false;
    }

    arch::enter_critical();
    {
        let s = &mut k.sems.slots[id.index()];
        if s.count > 0 {
            s.count -= 1;
            arch::exit_critical();
            return true;
        }
    }

    let Some(cur) = k.sched.current_thread() else {
        arch::exit_critical();
        return false;
    };
    waitq::insert(
        &mut k.threads,
        &mut k.sems.slots[id.index()].wait_head,
        cur,
    );
    k.sched.block_current(&mut k.threads);
    sched::switch_and_arm(k);
    arch::exit_critical();
    arch::trigger_context_switch();
    true
}

/// Takes one unit iff immediately available. Legal from ISRs.
pub fn try_wait(k: &mut Kernel, id: SemId) -> bool {
    if !k.sems.is_active(id) {
        return false;
    }
    arch::enter_critical();
    let s = &mut k.sems.slots[id.index()];
    let got = if s.count > 0 {
        s.count -= 1;
        true
    } else {
        false
    };
    arch::exit_critical();
    got
}

/// Releases one unit. If a thread is waiting, the unit passes to it directly
/// (the count is untouched) and we preempt if it out-ranks us. With no
/// waiters the count increments, unless it already sits at `max_count`, which
/// reports false. Legal from ISRs.
pub fn signal(k: &mut Kernel, id: SemId) -> bool {
    if !k.sems.is_active(id) {
        return false;
    }

    arch::enter_critical();
    let woken = waitq::remove_head(
        &mut k.threads,
        &mut k.sems.slots[id.index()].wait_head,
    );
    if let Some(waiter) = woken {
        if k.sched.unblock(&mut k.threads, waiter) {
            sched::switch_and_arm(k);
            arch::exit_critical();
            arch::trigger_context_switch();
            return true;
        }
        arch::exit_critical();
        return true;
    }

    let s = &mut k.sems.slots[id.index()];
    if s.count >= s.max_count {
        arch::exit_critical();
        return false;
    }
    s.count += 1;
    arch::exit_critical();
    true
}

/// Drops `id`'s claim on a thread being destroyed, if it happens to be
/// waiting here.
pub(crate) fn forget_waiter(k: &mut Kernel, index: usize, thread: ThreadId) {
    if k.sems.slots[index].active {
        waitq::remove(
            &mut k.threads,
            &mut k.sems.slots[index].wait_head,
            thread,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::testing;
    use crate::testutil::{kernel_with_idle, run, spawn};
    use crate::thread::ThreadState;

    #[test]
    fn create_validates_counts() {
        let mut k = kernel_with_idle();
        assert!(create(&mut k, 2, 1, "bad").is_none());
        assert!(create(&mut k, 0, 0, "bad").is_none());
        assert!(create(&mut k, 0, 1, "ok").is_some());
    }

    #[test]
    fn wait_then_signal_is_identity_on_count() {
        let mut k = kernel_with_idle();
        spawn(&mut k, "t", 10);
        k.sched.switch_context(&mut k.threads);
        let s = create(&mut k, 2, 4, "s").unwrap();

        assert!(wait(&mut k, s));
        assert_eq!(k.sems.count(s), 1);
        assert!(signal(&mut k, s));
        assert_eq!(k.sems.count(s), 2);
    }

    #[test]
    fn try_wait_fails_at_zero() {
        let mut k = kernel_with_idle();
        spawn(&mut k, "t", 10);
        k.sched.switch_context(&mut k.threads);
        let s = create(&mut k, 1, 1, "s").unwrap();

        assert!(try_wait(&mut k, s));
        assert!(!try_wait(&mut k, s));
    }

    #[test]
    fn signal_saturates_at_max() {
        let mut k = kernel_with_idle();
        spawn(&mut k, "t", 10);
        k.sched.switch_context(&mut k.threads);
        let s = create(&mut k, 1, 1, "s").unwrap();

        assert!(!signal(&mut k, s));
        assert_eq!(k.sems.count(s), 1);
    }

    #[test]
    fn blocked_waiter_takes_the_signalled_unit() {
        let mut k = kernel_with_idle();
        let a = spawn(&mut k, "a", 10);
        let b = spawn(&mut k, "b", 10);
        let s = create(&mut k, 0, 4, "s").unwrap();

        run(&mut k, a);
        assert!(wait(&mut k, s)); // blocks; b takes over
        assert_eq!(k.threads[a].state(), ThreadState::Blocked);
        assert_eq!(k.sched.current_thread(), Some(b));

        assert!(signal(&mut k, s));
        // Unit went straight to a; count never moved.
        assert_eq!(k.sems.count(s), 0);
        assert_eq!(k.threads[a].state(), ThreadState::Ready);
    }

    #[test]
    fn signal_preempts_for_more_important_waiter() {
        let mut k = kernel_with_idle();
        let lo = spawn(&mut k, "lo", 20);
        let hi = spawn(&mut k, "hi", 5);
        let s = create(&mut k, 0, 1, "s").unwrap();

        run(&mut k, hi);
        assert!(wait(&mut k, s)); // hi blocks; lo runs
        assert_eq!(k.sched.current_thread(), Some(lo));

        assert!(signal(&mut k, s));
        assert_eq!(k.sched.current_thread(), Some(hi));
        assert_eq!(k.threads[lo].state(), ThreadState::Ready);
    }

    #[test]
    fn waiters_wake_priority_first_fifo_within() {
        let mut k = kernel_with_idle();
        let boss = spawn(&mut k, "boss", 1);
        let m1 = spawn(&mut k, "m1", 10);
        let m2 = spawn(&mut k, "m2", 10);
        let hi = spawn(&mut k, "hi", 5);
        let s = create(&mut k, 0, 4, "s").unwrap();

        for t in [m1, m2, hi] {
            run(&mut k, t);
            assert!(wait(&mut k, s));
        }
        run(&mut k, boss);

        let mut order = Vec::new();
        for _ in 0..3 {
            assert!(signal(&mut k, s));
            for t in [m1, m2, hi] {
                if k.threads[t].state() == ThreadState::Ready
                    && !order.contains(&t)
                {
                    order.push(t);
                }
            }
        }
        assert_eq!(order, vec![hi, m1, m2]);
    }

    #[test]
    fn isr_policy_signal_and_try_wait_only() {
        let mut k = kernel_with_idle();
        spawn(&mut k, "t", 10);
        k.sched.switch_context(&mut k.threads);
        let s = create(&mut k, 1, 2, "s").unwrap();

        testing::set_isr_mode(true);
        assert!(!wait(&mut k, s));
        assert!(create(&mut k, 0, 1, "nope").is_none());
        assert!(try_wait(&mut k, s)); // allowed
        assert!(signal(&mut k, s)); // allowed
        testing::set_isr_mode(false);
        assert_eq!(k.sems.count(s), 1);
    }
}
