// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent syscall dispatch.
//!
//! Unprivileged threads reach the kernel through the SVC instruction. The
//! arch entry sequence extracts the immediate from the instruction and hands
//! us the hardware-stacked exception frame; arguments travel in the stacked
//! `r0..r3` and the result goes back into stacked `r0`, where the CPU will
//! restore it into the caller's `r0` on exception return.
//!
//! The mapping from number to operation is a plain `match` rather than a
//! function-pointer table, so a reader (or a static analyzer) can see every
//! reachable kernel entry point in one place.
//!
//! Because the handler itself runs in handler mode, the dispatch brackets
//! every call with the syscall-context flag: `in_isr_context()` then reports
//! thread context, so blocking operations block the *caller* instead of
//! refusing. Pointer arguments carry the caller's addresses; messages and
//! stats are copied in and out here after an address/alignment check, so the
//! kernel never trusts a user buffer beyond that.

use core::convert::TryFrom;

use abi::{
    ipc_code, IpcError, Message, MutexId, SemId, Sysnum, ThreadId,
};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{arch, ipc, mutex, sched, sema, time, Kernel};

/// The eight words the CPU pushes on exception entry, in stacking order.
/// This layout is hardware ABI; the initial-frame builder and the SVC entry
/// assembly both depend on it.
#[derive(
    Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct ExcFrame {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r12: u32,
    pub lr: u32,
    pub pc: u32,
    pub xpsr: u32,
}

/// Reads a `T` from a caller-supplied address. Rejects null and misaligned
/// pointers; beyond that, the caller's MPU regime has already bounded what
/// the address can name while the caller was running, and the copy keeps the
/// kernel from depending on the buffer afterwards.
fn copy_in<T: FromBytes + Copy>(addr: u32) -> Result<T, IpcError> {
    let addr = addr as usize;
    if addr == 0 || addr % core::mem::align_of::<T>() != 0 {
        return Err(IpcError::Invalid);
    }
    // Safety: non-null, aligned, and T is FromBytes so any bit pattern is
    // a value.
    Ok(unsafe { core::ptr::read(addr as *const T) })
}

/// Address/alignment check shared by the copy-out paths. Done *before* any
/// operation with side effects, so a bogus destination cannot block the
/// caller or consume a message first.
fn check_user_ptr<T>(addr: u32) -> Result<(), IpcError> {
    if addr == 0 || addr as usize % core::mem::align_of::<T>() != 0 {
        Err(IpcError::Invalid)
    } else {
        Ok(())
    }
}

/// Writes a `T` to a caller-supplied, pre-checked address.
fn copy_out<T: IntoBytes + Copy>(addr: u32, value: &T) -> Result<(), IpcError> {
    check_user_ptr::<T>(addr)?;
    // Safety: non-null and aligned.
    unsafe { core::ptr::write(addr as usize as *mut T, *value) };
    Ok(())
}

/// Routes one supervisor call. `num` is the SVC immediate; `frame` is the
/// caller's stacked exception frame.
///
/// Number 0 (first-thread launch) never arrives here -- the SVC entry
/// assembly consumes it -- and is treated like an unknown number if it
/// somehow does.
pub fn dispatch(k: &mut Kernel, num: u32, frame: &mut ExcFrame) {
    arch::set_syscall_context(true);

    let (a0, a1, a2) = (frame.r0, frame.r1, frame.r2);
    let result: u32 = match Sysnum::try_from(num) {
        Ok(Sysnum::Yield) => {
            sched::yield_now(k);
            0
        }
        Ok(Sysnum::Sleep) => {
            time::sleep(k, a0);
            0
        }
        Ok(Sysnum::TickCount) => time::tick_count(k),

        Ok(Sysnum::MutexCreate) => {
            // The name pointer is a privileged-side convenience; across the
            // boundary we don't marshal strings.
            let id = mutex::create(k, "").unwrap_or(MutexId::INVALID);
            u32::from(id.0)
        }
        Ok(Sysnum::MutexDestroy) => {
            mutex::destroy(k, MutexId(a0 as u8));
            0
        }
        Ok(Sysnum::MutexLock) => mutex::lock(k, MutexId(a0 as u8)) as u32,
        Ok(Sysnum::MutexTryLock) => {
            mutex::try_lock(k, MutexId(a0 as u8)) as u32
        }
        Ok(Sysnum::MutexUnlock) => mutex::unlock(k, MutexId(a0 as u8)) as u32,

        Ok(Sysnum::SemCreate) => {
            let id = sema::create(k, a0, a1, "").unwrap_or(SemId::INVALID);
            u32::from(id.0)
        }
        Ok(Sysnum::SemDestroy) => {
            sema::destroy(k, SemId(a0 as u8));
            0
        }
        Ok(Sysnum::SemWait) => sema::wait(k, SemId(a0 as u8)) as u32,
        Ok(Sysnum::SemTryWait) => sema::try_wait(k, SemId(a0 as u8)) as u32,
        Ok(Sysnum::SemSignal) => sema::signal(k, SemId(a0 as u8)) as u32,

        Ok(Sysnum::MsgSend) => {
            // The reply lands directly in the caller's buffer when the
            // server replies; validate that now, deliver later.
            let r = check_user_ptr::<Message>(a2)
                .and_then(|()| copy_in::<Message>(a1))
                .and_then(|msg| {
                    ipc::send(
                        k,
                        ThreadId(a0 as u8),
                        &msg,
                        a2 as usize as *mut _,
                    )
                });
            ipc_code(r) as u32
        }
        Ok(Sysnum::MsgReceive) => {
            let r = check_user_ptr::<Message>(a0).and_then(|()| {
                let mut msg = Message::ZERO;
                ipc::receive(k, &mut msg).and_then(|()| copy_out(a0, &msg))
            });
            ipc_code(r) as u32
        }
        Ok(Sysnum::MsgReply) => {
            let r = copy_in::<Message>(a1)
                .and_then(|msg| ipc::reply(k, ThreadId(a0 as u8), &msg));
            ipc_code(r) as u32
        }
        Ok(Sysnum::MsgTrySend) => {
            let r = copy_in::<Message>(a1)
                .and_then(|msg| ipc::try_send(k, ThreadId(a0 as u8), &msg));
            ipc_code(r) as u32
        }
        Ok(Sysnum::MsgTryReceive) => {
            let r = check_user_ptr::<Message>(a0).and_then(|()| {
                let mut msg = Message::ZERO;
                ipc::try_receive(k, &mut msg)
                    .and_then(|()| copy_out(a0, &msg))
            });
            ipc_code(r) as u32
        }
        Ok(Sysnum::MsgNotify) => {
            ipc_code(ipc::notify(k, ThreadId(a0 as u8), a1)) as u32
        }
        Ok(Sysnum::MsgCheckNotify) => ipc::check_notify(k),

        Ok(Sysnum::HeapAlloc) => k.heap.alloc(a0) as usize as u32,
        Ok(Sysnum::HeapFree) => {
            k.heap.free(a0 as usize as *mut u8);
            0
        }
        Ok(Sysnum::HeapStats) => {
            let stats = k.heap.stats();
            ipc_code(copy_out(a0, &stats)) as u32
        }

        // SVC 0 is handled in the entry assembly; an unknown number gets
        // the same nothing.
        Ok(Sysnum::StartFirstThread) | Err(_) => 0,
    };

    frame.r0 = result;
    arch::set_syscall_context(false);
}
