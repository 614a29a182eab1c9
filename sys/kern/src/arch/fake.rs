// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host stand-in for the arch layer.
//!
//! Keeps the portable kernel buildable and testable off-target. State is
//! thread-local so the test harness can run cases in parallel; the
//! [`testing`] module exposes the knobs and counters tests poke.
//!
//! Critical-section entry asserts the non-nesting discipline the real
//! implementation depends on: interrupt masking on the metal has no nesting
//! count, so a nested enter there would unmask early on the inner exit.

use std::cell::Cell;

use crate::thread::Thread;

std::thread_local! {
    static CRITICAL_DEPTH: Cell<u32> = const { Cell::new(0) };
    static PENDED_SWITCHES: Cell<u32> = const { Cell::new(0) };
    static ISR_MODE: Cell<bool> = const { Cell::new(false) };
    static IN_SYSCALL: Cell<bool> = const { Cell::new(false) };
    static CURRENT_TCB: Cell<*mut Thread> =
        const { Cell::new(core::ptr::null_mut()) };
    static NEXT_TCB: Cell<*mut Thread> =
        const { Cell::new(core::ptr::null_mut()) };
}

pub fn enter_critical() {
    CRITICAL_DEPTH.with(|d| {
        assert_eq!(d.get(), 0, "critical sections must not nest");
        d.set(1);
    });
}

pub fn exit_critical() {
    CRITICAL_DEPTH.with(|d| {
        assert_eq!(d.get(), 1, "unbalanced critical-section exit");
        d.set(0);
    });
}

pub fn trigger_context_switch() {
    PENDED_SWITCHES.with(|p| p.set(p.get() + 1));
}

pub fn set_current_tcb(tcb: *mut Thread) {
    CURRENT_TCB.with(|c| c.set(tcb));
}

pub fn set_next_tcb(tcb: *mut Thread) {
    NEXT_TCB.with(|n| n.set(tcb));
}

pub fn in_isr_context() -> bool {
    if IN_SYSCALL.with(Cell::get) {
        return false;
    }
    ISR_MODE.with(Cell::get)
}

pub fn set_syscall_context(active: bool) {
    IN_SYSCALL.with(|s| s.set(active));
}

pub fn initial_status_register() -> u32 {
    // Same value the M-profile implementation uses: Thumb bit set.
    1 << 24
}

pub fn configure_systick(_tick_divisor: u32) {}

pub fn set_interrupt_priorities() {}

pub fn mpu_init(_heap_base: u32, _heap_size: u32) {}

pub fn start_first_thread() -> ! {
    panic!("start_first_thread on the host");
}

/// Test instrumentation for the fake arch.
pub mod testing {
    use super::*;

    /// Clears all fake-arch state for a fresh test case.
    pub fn reset() {
        CRITICAL_DEPTH.with(|d| d.set(0));
        PENDED_SWITCHES.with(|p| p.set(0));
        ISR_MODE.with(|i| i.set(false));
        IN_SYSCALL.with(|s| s.set(false));
        CURRENT_TCB.with(|c| c.set(core::ptr::null_mut()));
        NEXT_TCB.with(|n| n.set(core::ptr::null_mut()));
    }

    /// Simulates executing inside an interrupt handler.
    pub fn set_isr_mode(active: bool) {
        ISR_MODE.with(|i| i.set(active));
    }

    /// Returns and clears the number of context switches pended since the
    /// last call.
    pub fn take_pended_switches() -> u32 {
        PENDED_SWITCHES.with(|p| p.replace(0))
    }

    pub fn syscall_context() -> bool {
        IN_SYSCALL.with(Cell::get)
    }

    pub fn next_tcb() -> *mut Thread {
        NEXT_TCB.with(Cell::get)
    }
}
