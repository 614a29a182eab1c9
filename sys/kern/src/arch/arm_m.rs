// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7-M (Cortex-M3/M4).
//!
//! # Interrupt plumbing
//!
//! Three handlers do all the work, and the vector table (owned by the board
//! layer) is expected to reference them by name:
//!
//! - `SVCall` implements the SVC instruction: syscall entry for unprivileged
//!   threads, and -- for immediate 0 only -- the one-time first-thread
//!   launch issued from `start_first_thread`.
//! - `SysTick` drives kernel time.
//! - `PendSV` performs the deferred context switch.
//!
//! `PendSV` is the interesting one. Kernel code never switches contexts
//! inline; it updates the scheduler's bookkeeping, publishes the chosen TCB
//! in `NEXT_TCB`, and pends PendSV. Because PendSV sits at the lowest
//! interrupt priority, the hardware runs it only after every other handler
//! has unwound, which guarantees the save/restore always happens against a
//! consistent thread context. The handler itself stacks `r4..r11` onto the
//! outgoing thread's process stack, stores the resulting PSP at offset 0 of
//! its TCB, and restores the mirror image from the incoming one -- so the
//! saved-state layout is shared between this file and the initial frames
//! built by `thread::Pool::create`.
//!
//! The tick and PendSV share the lowest priority and therefore never preempt
//! one another; SVCall sits there too, which keeps the kernel non-reentrant
//! without any further locking. Faults are configured above everything so a
//! kernel bug still reaches the crash dumper.

use core::arch::global_asm;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::crash::{self, FaultRecord, ThreadSnapshot};
use crate::mpu::{self, RegionAttributes, RegionSlot, StackRegion};
use crate::startup::with_kernel;
use crate::syscalls::ExcFrame;
use crate::thread::Thread;
use crate::time;

/// TCB of the thread the CPU is (or was last) running. Read and written by
/// the handlers below; the name and the offset-0 stack pointer are ABI.
#[no_mangle]
static CURRENT_TCB: AtomicPtr<Thread> = AtomicPtr::new(core::ptr::null_mut());

/// TCB chosen by the most recent scheduler decision; what PendSV switches
/// to.
#[no_mangle]
static NEXT_TCB: AtomicPtr<Thread> = AtomicPtr::new(core::ptr::null_mut());

/// Set while the SVC dispatcher runs on a thread's behalf, so handler mode
/// is reported as thread context for blocking purposes.
static IN_SYSCALL: AtomicBool = AtomicBool::new(false);

/// Initial xPSR for new threads: just the Thumb bit, the minimum required.
///
/// EXC_RETURN is not part of saved state: every exception exit in this
/// kernel is "thread mode, process stack, no FP", 0xFFFFFFFD, materialized
/// inline by the handlers.
const INITIAL_PSR: u32 = 1 << 24;

pub fn initial_status_register() -> u32 {
    INITIAL_PSR
}

pub fn enter_critical() {
    cortex_m::interrupt::disable();
}

pub fn exit_critical() {
    // Safety: paired with a preceding enter_critical; the kernel's critical
    // sections never nest, so unmasking here cannot be premature.
    unsafe { cortex_m::interrupt::enable() };
}

pub fn trigger_context_switch() {
    cortex_m::peripheral::SCB::set_pendsv();
}

pub fn set_current_tcb(tcb: *mut Thread) {
    CURRENT_TCB.store(tcb, Ordering::Relaxed);
}

pub fn set_next_tcb(tcb: *mut Thread) {
    NEXT_TCB.store(tcb, Ordering::Relaxed);
}

pub fn set_syscall_context(active: bool) {
    IN_SYSCALL.store(active, Ordering::Relaxed);
}

/// True in handler mode, except while the SVC dispatcher is acting for its
/// calling thread.
pub fn in_isr_context() -> bool {
    if IN_SYSCALL.load(Ordering::Relaxed) {
        return false;
    }
    // ICSR.VECTACTIVE is non-zero in any exception handler.
    let icsr = unsafe { (*cortex_m::peripheral::SCB::PTR).icsr.read() };
    icsr & 0x1FF != 0
}

/// Programs the SysTick timer for periodic interrupts every `tick_divisor`
/// processor cycles.
pub fn configure_systick(tick_divisor: u32) {
    // Safety: writes to our own timer; no memory-safety consequences.
    unsafe {
        let syst = &*cortex_m::peripheral::SYST::PTR;
        syst.rvr.write(tick_divisor - 1);
        syst.cvr.write(0);
        // Enable counter and interrupt, processor clock.
        syst.csr.modify(|v| v | 0b111);
    }
}

/// Places SVCall, PendSV, and SysTick at the bottom of the priority space
/// (tick just above the switch so a pending switch never delays time), and
/// promotes the configurable faults above everything, with the
/// divide-by-zero and unaligned-access traps enabled so those surface with
/// a precise PC instead of silently producing garbage.
pub fn set_interrupt_priorities() {
    // Safety: purely lowers exception priorities from their reset values
    // and enables fault reporting; nothing here can cause preemption that
    // wasn't already possible.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;

        // Split MemManage/BusFault/UsageFault out of HardFault.
        scb.shcsr.modify(|x| x | 0b111 << 16);

        // MemManage, BusFault, UsageFault: highest configurable.
        scb.shpr[0].write(0x00);
        scb.shpr[1].write(0x00);
        scb.shpr[2].write(0x00);
        // SVCall lowest.
        scb.shpr[7].write(0xFF);
        // PendSV lowest, SysTick one notch above it.
        scb.shpr[10].write(0xFF);
        scb.shpr[11].write(0xFE);

        const DIV_0_TRP: u32 = 1 << 4;
        const UNALIGN_TRP: u32 = 1 << 3;
        scb.ccr.modify(|x| x | DIV_0_TRP | UNALIGN_TRP);
    }
}

fn write_region(mpu: &cortex_m::peripheral::mpu::RegisterBlock, r: StackRegion) {
    // Safety: MPU programming with the MPU disabled; affects protection,
    // not memory safety of this code.
    unsafe {
        mpu.rbar.write(r.rbar);
        mpu.rasr.write(r.rasr);
    }
}

/// Installs the static region map and enables the MPU.
///
/// `PRIVDEFENA` keeps the default map for privileged code, so the kernel is
/// never denied anything; `HFNMIENA` stays off so the HardFault handler
/// (and with it the crash dumper's console access) runs with the MPU out of
/// the way.
pub fn mpu_init(heap_base: u32, heap_size: u32) {
    let mpu = unsafe { &*cortex_m::peripheral::MPU::PTR };

    const ENABLE: u32 = 0b001;
    const PRIVDEFENA: u32 = 0b100;

    // Safety: reconfiguring protection while it is disabled.
    unsafe {
        mpu.ctrl.write(0);
    }
    cortex_m::asm::dsb();
    cortex_m::asm::isb();

    // Flash: read-only everywhere, executable.
    write_region(
        mpu,
        mpu::compute_region(
            RegionSlot::Flash,
            0x0800_0000,
            1 << 20,
            RegionAttributes::READ | RegionAttributes::EXECUTE,
        ),
    );
    // Kernel SRAM: privileged only.
    write_region(
        mpu,
        mpu::compute_region(
            RegionSlot::KernelSram,
            0x2000_0000,
            128 * 1024,
            RegionAttributes::empty(),
        ),
    );
    // Peripherals and the system control space: privileged device memory.
    write_region(
        mpu,
        mpu::compute_region(
            RegionSlot::Peripherals,
            0x4000_0000,
            512 << 20,
            RegionAttributes::DEVICE,
        ),
    );
    write_region(
        mpu,
        mpu::compute_region(
            RegionSlot::System,
            0xE000_0000,
            512 << 20,
            RegionAttributes::DEVICE,
        ),
    );
    // Heap: full access, never executable.
    write_region(
        mpu,
        mpu::compute_region(
            RegionSlot::Heap,
            heap_base,
            mpu::round_up_size(heap_size),
            RegionAttributes::READ | RegionAttributes::WRITE,
        ),
    );
    // Thread-stack slot starts disabled; loaded per context switch.
    write_region(mpu, StackRegion::DISABLED);

    // Safety: as above.
    unsafe {
        mpu.ctrl.write(ENABLE | PRIVDEFENA);
    }
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

/// Loads one thread's stack region into the MPU and drops (or restores)
/// thread-mode privilege to match the TCB. Runs on every switch, from
/// handler mode.
unsafe fn install_thread_state(tcb: *const Thread) {
    let region = (*tcb).mpu_region();
    let mpu = &*cortex_m::peripheral::MPU::PTR;
    mpu.rbar.write(region.rbar);
    mpu.rasr.write(region.rasr);

    let control: u32 = if (*tcb).privileged() { 0 } else { 1 };
    core::arch::asm!(
        "msr CONTROL, {0}",
        "isb",
        in(reg) control,
        options(nostack, preserves_flags),
    );
}

/// Launches the first scheduled thread. `CURRENT_TCB` must already point at
/// it. Traps into `SVCall` with immediate 0, which restores the thread's
/// initial frame and drops into thread mode.
pub fn start_first_thread() -> ! {
    unsafe {
        core::arch::asm!(
            "svc #0",
            options(noreturn),
        )
    }
}

// Handler for the SVC instruction. The common case is a syscall: recover
// the immediate from the instruction that trapped, call into the portable
// dispatcher with the stacked argument frame, and return; any context
// switch the syscall armed arrives via PendSV on the way out.
//
// Immediate 0 is the boot-time first-thread launch: restore the initial
// software-saved registers from the TCB named by CURRENT_TCB and return
// into thread mode on the process stack.
global_asm! {"
    .section .text.SVCall
    .globl SVCall
    .type SVCall,function
    SVCall:
        @ Frame lives on MSP for the boot trap, PSP for real syscalls.
        tst lr, #4
        ite eq
        mrseq r1, msp
        mrsne r1, psp
        @ Stacked PC is the instruction after the SVC; its low byte holds
        @ the syscall number.
        ldr r0, [r1, #24]
        ldrb r0, [r0, #-2]
        cbz r0, 1f

        @ Syscall: svc_entry(number, frame). r4 rides along to keep the
        @ stack 8-aligned.
        push {{r4, lr}}
        bl svc_entry
        pop {{r4, lr}}
        bx lr

    1:  @ First-thread launch.
        bl first_thread_entry
        movw r0, #:lower16:CURRENT_TCB
        movt r0, #:upper16:CURRENT_TCB
        ldr r0, [r0]
        @ Saved stack pointer is the TCB's first word.
        ldr r1, [r0]
        ldmia r1!, {{r4-r11}}
        msr PSP, r1
        movw lr, #0xFFFD
        movt lr, #0xFFFF
        bx lr
    ",
}

// Deferred context switch. Stacks the callee-saved registers onto the
// outgoing thread's process stack (hardware already stacked the rest),
// records the PSP in the TCB, asks the Rust side to promote NEXT_TCB, and
// unstacks the incoming thread.
global_asm! {"
    .section .text.PendSV
    .globl PendSV
    .type PendSV,function
    PendSV:
        push {{r0, lr}}
        movw r0, #:lower16:CURRENT_TCB
        movt r0, #:upper16:CURRENT_TCB
        ldr r1, [r0]
        cbz r1, 1f
        mrs r2, PSP
        stmdb r2!, {{r4-r11}}
        str r2, [r1]
    1:  bl pendsv_entry
        pop {{r0, lr}}
        movw r0, #:lower16:CURRENT_TCB
        movt r0, #:upper16:CURRENT_TCB
        ldr r0, [r0]
        ldr r1, [r0]
        ldmia r1!, {{r4-r11}}
        msr PSP, r1
        bx lr
    ",
}

/// Rust half of PendSV: commits the scheduler's published choice and loads
/// the incoming thread's MPU region and privilege.
#[no_mangle]
unsafe extern "C" fn pendsv_entry() {
    let next = NEXT_TCB.load(Ordering::Relaxed);
    if !next.is_null() {
        CURRENT_TCB.store(next, Ordering::Relaxed);
        install_thread_state(next);
    }
}

/// Rust half of the first-thread launch: arm protection and privilege for
/// the thread `CURRENT_TCB` names before the assembly unstacks it.
#[no_mangle]
unsafe extern "C" fn first_thread_entry() {
    let first = CURRENT_TCB.load(Ordering::Relaxed);
    if !first.is_null() {
        install_thread_state(first);
    }
}

/// Rust half of SVCall: route the syscall against the kernel state.
#[no_mangle]
unsafe extern "C" fn svc_entry(num: u32, frame: *mut ExcFrame) {
    with_kernel(|k| crate::syscalls::dispatch(k, num, &mut *frame));
}

/// Periodic tick. (Name is referenced by the vector table.)
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    with_kernel(time::tick_isr);
}

// All configurable faults funnel through one capture sequence: find the
// exception frame (either stack), carry EXC_RETURN along, and hand off to
// the Rust reporter. These never return.
global_asm! {"
    .section .text.KernelFault
    .globl KernelFault
    .type KernelFault,function
    KernelFault:
        tst lr, #4
        ite eq
        mrseq r0, msp
        mrsne r0, psp
        mov r1, lr
        b handle_fault

    .section .text.HardFault
    .globl HardFault
    .type HardFault,function
    HardFault:
        b KernelFault

    .section .text.MemManage
    .globl MemManage
    .type MemManage,function
    MemManage:
        b KernelFault

    .section .text.BusFault
    .globl BusFault
    .type BusFault,function
    BusFault:
        b KernelFault

    .section .text.UsageFault
    .globl UsageFault
    .type UsageFault,function
    UsageFault:
        b KernelFault
    ",
}

/// Terminal fault path: capture a [`FaultRecord`], emit the one-shot crash
/// dump, and park in the diagnostic loop. An external watchdog is the only
/// way out; the kernel never reboots itself.
#[no_mangle]
unsafe extern "C" fn handle_fault(frame: *const ExcFrame, exc_return: u32) -> ! {
    let ipsr: u32;
    core::arch::asm!(
        "mrs {}, IPSR",
        out(reg) ipsr,
        options(pure, nomem, preserves_flags, nostack),
    );
    let kind = match ipsr & 0x1FF {
        3 => "HardFault",
        4 => "MemManage",
        5 => "BusFault",
        6 => "UsageFault",
        _ => "Fault",
    };

    let scb = &*cortex_m::peripheral::SCB::PTR;
    let status_regs = [
        ("CFSR", scb.cfsr.read()),
        ("HFSR", scb.hfsr.read()),
        ("MMFAR", scb.mmfar.read()),
        ("BFAR", scb.bfar.read()),
    ];

    let thread = {
        let tcb = CURRENT_TCB.load(Ordering::Relaxed);
        if tcb.is_null() {
            None
        } else {
            Some(ThreadSnapshot {
                id: (*tcb).id().0,
                name: (*tcb).name(),
                stack_base: (*tcb).stack_base(),
                stack_size: (*tcb).stack_size(),
            })
        }
    };

    let frame = &*frame;
    crash::dump_to_console(&FaultRecord {
        kind,
        r0: frame.r0,
        r1: frame.r1,
        r2: frame.r2,
        r3: frame.r3,
        r12: frame.r12,
        lr: frame.lr,
        pc: frame.pc,
        psr: frame.xpsr,
        sp: frame as *const _ as u32,
        exc_return,
        status_regs,
        thread,
    });

    loop {
        cortex_m::asm::wfe();
    }
}
