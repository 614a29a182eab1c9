// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel time: the tick counter, sleep, and the tick interrupt body.
//!
//! Time is a monotonic `u32` tick count, incremented by the periodic tick
//! interrupt (nominally 1 kHz, so it wraps after about 49 days). Deadlines
//! are compared as unsigned differences, which keeps relative intervals
//! correct across the wrap indefinitely.

use abi::ThreadId;

use crate::sched;
use crate::thread::ThreadState;
use crate::{arch, Kernel};

/// Ticks elapsed since the scheduler started.
pub fn tick_count(k: &Kernel) -> u32 {
    k.ticks
}

/// Wrap-safe "has `deadline` passed at `now`". Valid as long as the true
/// distance is under half the counter range, which a 32-bit millisecond
/// counter gives us ~24 days of headroom for.
fn deadline_reached(now: u32, deadline: u32) -> bool {
    now.wrapping_sub(deadline) as i32 >= 0
}

/// Blocks the current thread for `ticks` ticks. `sleep(0)` degenerates to a
/// yield, as an explicit quantum give-up rather than a zero-length wait.
pub fn sleep(k: &mut Kernel, ticks: u32) {
    if ticks == 0 {
        sched::yield_now(k);
        return;
    }

    arch::enter_critical();
    if let Some(cur) = k.sched.current_thread() {
        let deadline = match k.ticks.wrapping_add(ticks) {
            // Tick 0 doubles as the not-sleeping sentinel.
            0 => 1,
            t => t,
        };
        k.threads[cur].set_wakeup_tick(deadline);
        k.sched.block_current(&mut k.threads);
        sched::switch_and_arm(k);
    }
    arch::exit_critical();
    arch::trigger_context_switch();
}

/// Body of the periodic tick interrupt: advance time, wake expired sleepers,
/// run quantum accounting, and arm at most one context switch.
///
/// Sleepers are scanned in pool index order (lowest id first). If several
/// threads expire on the same tick they are enqueued in that order, but the
/// selection below still picks the most important one, so the scan order is
/// observable only in the intermediate ready-queue ordering.
pub fn tick_isr(k: &mut Kernel) {
    k.ticks = k.ticks.wrapping_add(1);
    let now = k.ticks;

    let mut preempt = false;
    for i in 0..abi::MAX_THREADS as u8 {
        let id = ThreadId(i);
        let expired = {
            let t = &k.threads[id];
            t.state() == ThreadState::Blocked
                && t.wakeup_tick() != 0
                && deadline_reached(now, t.wakeup_tick())
        };
        if expired {
            k.threads[id].set_wakeup_tick(0);
            preempt |= k.sched.unblock(&mut k.threads, id);
        }
    }

    if k.sched.tick(&mut k.threads) || preempt {
        sched::switch_and_arm(k);
        arch::trigger_context_switch();
    }
}
