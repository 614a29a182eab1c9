// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The architecture seam.
//!
//! Everything the portable kernel needs from the machine fits behind this
//! module's function set:
//!
//! - `enter_critical` / `exit_critical` -- interrupt masking around brief
//!   kernel sections; use sites are paired and never nest.
//! - `trigger_context_switch` -- pend the lowest-priority interrupt whose
//!   handler performs the save/restore, once it is safe to do so.
//! - `set_current_tcb` / `set_next_tcb` -- publish the TCB pointers that the
//!   context-switch handler consumes.
//! - `configure_systick`, `set_interrupt_priorities`, `mpu_init`,
//!   `start_first_thread` -- boot-time bring-up.
//! - `initial_status_register` -- the status word for freshly built frames.
//! - `in_isr_context` / `set_syscall_context` -- handler-vs-thread
//!   discipline, with the SVC gate counted as thread context.
//!
//! Bare-metal builds get the ARMv7-M implementation; everything else gets a
//! fake suitable for running the kernel (and its tests) on the host.

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        #[path = "arch/arm_m.rs"]
        mod imp;
    } else {
        #[path = "arch/fake.rs"]
        mod imp;
    }
}

pub use imp::*;
