// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Unprivileged application support: syscall stubs.
//!
//! Each kernel operation has a `sys_*` wrapper that places its arguments in
//! `r0..r3`, executes `svc` with the operation's number as the immediate,
//! and reads the result back from `r0`. The numbers are [`abi::Sysnum`];
//! they appear below as literal immediates because the instruction encoding
//! wants a constant, and the dispatch switch on the kernel side is the
//! other half of the contract.
//!
//! Privileged threads don't need any of this -- they call the kernel's
//! `startup` API directly -- so the stubs only exist on bare-metal builds.
//!
//! Pointer arguments cross the boundary as plain addresses. The kernel
//! copies message and stats structures in and out after its own checks; the
//! buffers must merely stay alive and inside the calling thread's MPU
//! regime for the duration of the call.

#![no_std]

pub use abi::*;

#[cfg(target_os = "none")]
mod stubs {
    use super::*;
    use core::arch::asm;

    /// Gives up the rest of the current time slice.
    #[inline]
    pub fn sys_yield() {
        unsafe {
            // The kernel writes a (zero) result into stacked r0 even for
            // resultless calls.
            asm!(
                "svc #1",
                lateout("r0") _,
                options(nomem, preserves_flags),
            );
        }
    }

    /// Blocks the calling thread for `ticks` kernel ticks.
    #[inline]
    pub fn sys_sleep(ticks: u32) {
        unsafe {
            asm!(
                "svc #2",
                inout("r0") ticks => _,
                options(nomem, preserves_flags),
            );
        }
    }

    /// Ticks since the scheduler started.
    #[inline]
    pub fn sys_tick_count() -> u32 {
        let out: u32;
        unsafe {
            asm!(
                "svc #3",
                out("r0") out,
                options(nomem, preserves_flags),
            );
        }
        out
    }

    /// Allocates a mutex. Debug names don't cross the privilege boundary;
    /// the kernel-side block is unnamed.
    #[inline]
    pub fn sys_mutex_create() -> MutexId {
        let out: u32;
        unsafe {
            asm!(
                "svc #4",
                out("r0") out,
                options(nomem, preserves_flags),
            );
        }
        MutexId(out as u8)
    }

    #[inline]
    pub fn sys_mutex_destroy(id: MutexId) {
        unsafe {
            asm!(
                "svc #5",
                inout("r0") u32::from(id.0) => _,
                options(nomem, preserves_flags),
            );
        }
    }

    #[inline]
    pub fn sys_mutex_lock(id: MutexId) -> bool {
        let out: u32;
        unsafe {
            asm!(
                "svc #6",
                inout("r0") u32::from(id.0) => out,
                options(nomem, preserves_flags),
            );
        }
        out != 0
    }

    #[inline]
    pub fn sys_mutex_try_lock(id: MutexId) -> bool {
        let out: u32;
        unsafe {
            asm!(
                "svc #7",
                inout("r0") u32::from(id.0) => out,
                options(nomem, preserves_flags),
            );
        }
        out != 0
    }

    #[inline]
    pub fn sys_mutex_unlock(id: MutexId) -> bool {
        let out: u32;
        unsafe {
            asm!(
                "svc #8",
                inout("r0") u32::from(id.0) => out,
                options(nomem, preserves_flags),
            );
        }
        out != 0
    }

    #[inline]
    pub fn sys_sem_create(initial: u32, max: u32) -> SemId {
        let out: u32;
        unsafe {
            asm!(
                "svc #9",
                inout("r0") initial => out,
                in("r1") max,
                options(nomem, preserves_flags),
            );
        }
        SemId(out as u8)
    }

    #[inline]
    pub fn sys_sem_destroy(id: SemId) {
        unsafe {
            asm!(
                "svc #10",
                inout("r0") u32::from(id.0) => _,
                options(nomem, preserves_flags),
            );
        }
    }

    #[inline]
    pub fn sys_sem_wait(id: SemId) -> bool {
        let out: u32;
        unsafe {
            asm!(
                "svc #11",
                inout("r0") u32::from(id.0) => out,
                options(nomem, preserves_flags),
            );
        }
        out != 0
    }

    #[inline]
    pub fn sys_sem_try_wait(id: SemId) -> bool {
        let out: u32;
        unsafe {
            asm!(
                "svc #12",
                inout("r0") u32::from(id.0) => out,
                options(nomem, preserves_flags),
            );
        }
        out != 0
    }

    #[inline]
    pub fn sys_sem_signal(id: SemId) -> bool {
        let out: u32;
        unsafe {
            asm!(
                "svc #13",
                inout("r0") u32::from(id.0) => out,
                options(nomem, preserves_flags),
            );
        }
        out != 0
    }

    fn ipc_result(code: u32) -> Result<(), IpcError> {
        match code as i32 {
            0 => Ok(()),
            c => Err(IpcError::try_from(c).unwrap_or(IpcError::Invalid)),
        }
    }

    /// Synchronous RPC: delivers `msg` and blocks until the server's reply
    /// is written into `reply`.
    #[inline]
    pub fn sys_send(
        dest: ThreadId,
        msg: &Message,
        reply: &mut Message,
    ) -> Result<(), IpcError> {
        let out: u32;
        unsafe {
            asm!(
                "svc #14",
                inout("r0") u32::from(dest.0) => out,
                in("r1") msg as *const Message,
                in("r2") reply as *mut Message,
                options(preserves_flags),
            );
        }
        ipc_result(out)
    }

    /// Blocks until a message arrives, then copies it into `msg`.
    #[inline]
    pub fn sys_receive(msg: &mut Message) -> Result<(), IpcError> {
        let out: u32;
        unsafe {
            asm!(
                "svc #15",
                inout("r0") msg as *mut Message => out,
                options(preserves_flags),
            );
        }
        ipc_result(out)
    }

    /// Completes an RPC begun by a client's [`sys_send`].
    #[inline]
    pub fn sys_reply(dest: ThreadId, msg: &Message) -> Result<(), IpcError> {
        let out: u32;
        unsafe {
            asm!(
                "svc #16",
                inout("r0") u32::from(dest.0) => out,
                in("r1") msg as *const Message,
                options(preserves_flags),
            );
        }
        ipc_result(out)
    }

    /// One-shot delivery without awaiting a reply; `Err(Full)` instead of
    /// blocking.
    #[inline]
    pub fn sys_try_send(
        dest: ThreadId,
        msg: &Message,
    ) -> Result<(), IpcError> {
        let out: u32;
        unsafe {
            asm!(
                "svc #17",
                inout("r0") u32::from(dest.0) => out,
                in("r1") msg as *const Message,
                options(preserves_flags),
            );
        }
        ipc_result(out)
    }

    /// Fetches a queued message if one exists; `Err(Empty)` otherwise.
    #[inline]
    pub fn sys_try_receive(msg: &mut Message) -> Result<(), IpcError> {
        let out: u32;
        unsafe {
            asm!(
                "svc #18",
                inout("r0") msg as *mut Message => out,
                options(preserves_flags),
            );
        }
        ipc_result(out)
    }

    /// Posts notification bits to `dest`. Lossy aggregation by design.
    #[inline]
    pub fn sys_notify(dest: ThreadId, bits: u32) -> Result<(), IpcError> {
        let out: u32;
        unsafe {
            asm!(
                "svc #19",
                inout("r0") u32::from(dest.0) => out,
                in("r1") bits,
                options(nomem, preserves_flags),
            );
        }
        ipc_result(out)
    }

    /// Reads and clears the calling thread's notification word.
    #[inline]
    pub fn sys_check_notify() -> u32 {
        let out: u32;
        unsafe {
            asm!(
                "svc #20",
                out("r0") out,
                options(nomem, preserves_flags),
            );
        }
        out
    }

    /// Allocates from the kernel heap; null on failure.
    #[inline]
    pub fn sys_heap_alloc(size: u32) -> *mut u8 {
        let out: u32;
        unsafe {
            asm!(
                "svc #21",
                inout("r0") size => out,
                options(nomem, preserves_flags),
            );
        }
        out as usize as *mut u8
    }

    #[inline]
    pub fn sys_heap_free(ptr: *mut u8) {
        unsafe {
            asm!(
                "svc #22",
                inout("r0") ptr => _,
                options(nomem, preserves_flags),
            );
        }
    }

    /// Snapshots heap usage into `stats`.
    #[inline]
    pub fn sys_heap_stats(stats: &mut HeapStats) -> Result<(), IpcError> {
        let out: u32;
        unsafe {
            asm!(
                "svc #23",
                inout("r0") stats as *mut HeapStats => out,
                options(preserves_flags),
            );
        }
        ipc_result(out)
    }
}

#[cfg(target_os = "none")]
pub use stubs::*;
