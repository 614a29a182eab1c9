// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel instance, boot path, and the privileged-thread API.
//!
//! The single [`Kernel`] lives here, behind [`with_kernel`]. Privileged
//! threads call the thin wrappers below directly; unprivileged threads get
//! the same operations via the SVC gate in `syscalls`.

use core::cell::UnsafeCell;

use abi::ThreadId;

use crate::thread::{self, ThreadConfig};
use crate::{arch, sched, time, Kernel};

/// Wrapper granting the kernel static interior mutability. Sync is sound
/// because this is a single-core system and every mutation path masks
/// interrupts around its access (see the concurrency model in the crate
/// docs).
struct KernelCell(UnsafeCell<Kernel>);

// Safety: see the type's comment.
unsafe impl Sync for KernelCell {}

static KERNEL: KernelCell = KernelCell(UnsafeCell::new(Kernel::new()));

/// Runs `body` against the kernel state.
///
/// # Safety
///
/// Callers must not re-enter (`with_kernel` inside `with_kernel` aliases the
/// `&mut`). The service handlers cannot stack on each other -- they share
/// the lowest interrupt priority -- but the tick handler *can* fire while a
/// privileged thread sits inside one of the wrappers below; that is sound
/// only because every mutation of kernel state happens inside an
/// interrupts-off critical section, so handler and thread accesses are
/// strictly ordered. New callers must preserve that discipline.
pub unsafe fn with_kernel<R>(body: impl FnOnce(&mut Kernel) -> R) -> R {
    body(&mut *KERNEL.0.get())
}

/// Creates a thread and enrolls it with the scheduler, ready to run once
/// scheduling starts (or immediately, if it out-ranks the creator and the
/// scheduler is live). `None` on pool exhaustion or bad stack geometry.
pub fn create_thread(config: &ThreadConfig) -> Option<ThreadId> {
    // Safety: called from thread context; not re-entered.
    unsafe {
        with_kernel(|k| {
            let id = k.threads.create(config)?;
            k.sched.add_thread(&mut k.threads, id);
            Some(id)
        })
    }
}

/// Destroys a thread, freeing its slot for reuse. Refuses the idle thread.
pub fn destroy_thread(id: ThreadId) -> bool {
    // Safety: as in create_thread.
    unsafe { with_kernel(|k| thread::destroy(k, id)) }
}

/// Gives up the rest of the current time slice.
pub fn yield_now() {
    // Safety: as in create_thread.
    unsafe { with_kernel(sched::yield_now) }
}

/// Blocks the calling thread for `ticks` ticks.
pub fn sleep(ticks: u32) {
    // Safety: as in create_thread.
    unsafe { with_kernel(|k| time::sleep(k, ticks)) }
}

/// Ticks since the scheduler started.
pub fn tick_count() -> u32 {
    // Safety: as in create_thread.
    unsafe { with_kernel(|k| time::tick_count(k)) }
}

/// Where threads land when their entry function returns: tear the thread
/// down and hand the CPU to whoever is next. Never returns; the closing
/// loop only exists to satisfy the type system until the pended switch
/// fires.
pub extern "C" fn exit_trampoline() {
    // Safety: runs in the exiting thread's context, not re-entered.
    unsafe {
        with_kernel(|k| {
            if let Some(cur) = k.sched.current_thread() {
                thread::destroy(k, cur);
            }
            arch::enter_critical();
            sched::switch_and_arm(k);
            arch::exit_critical();
        });
    }
    arch::trigger_context_switch();
    loop {
        core::hint::spin_loop();
    }
}

/// Ticks per second the boot path programs the tick source for.
pub const TICK_HZ: u32 = 1_000;

#[cfg(target_os = "none")]
mod boot {
    use super::*;
    use abi::Priority;

    /// The idle thread needs only enough stack for an interrupt frame, but
    /// the MPU floor is a power-of-two, size-aligned buffer.
    #[repr(align(512))]
    struct IdleStack([u32; 128]);

    static mut IDLE_STACK: IdleStack = IdleStack([0; 128]);

    extern "C" fn idle_main(_arg: usize) {
        loop {
            cortex_m::asm::wfi();
        }
    }

    /// The main kernel entry point.
    ///
    /// The board layer does clock and console bring-up, locates the DTB
    /// blob, and calls this. We read the tick clock from the tree, install
    /// memory protection and the idle thread, pick the first runnable
    /// thread, and drop into it; applications are expected to have created
    /// their threads (with [`create_thread`]) beforehand.
    ///
    /// # Safety
    ///
    /// Call exactly once per boot, from privileged thread mode on the main
    /// stack, with interrupts configured but scheduling not yet started.
    pub unsafe fn start_kernel(dtb: &[u8]) -> ! {
        extern "C" {
            // Provided by the linker script.
            static mut _heap_start: u8;
            static mut _heap_end: u8;
        }

        let Some(board) = crate::fdt::BoardConfig::from_dtb(dtb) else {
            panic!("unusable device tree");
        };

        let tick_divisor = board.system_clock_hz / TICK_HZ;

        with_kernel(|k| {
            // Safety: the linker symbols delimit the dedicated heap region;
            // the idle stack is a private static handed to exactly one
            // thread. Both accesses happen once, here, before scheduling.
            unsafe {
                let heap_base = core::ptr::addr_of_mut!(_heap_start);
                let heap_end = core::ptr::addr_of_mut!(_heap_end);
                k.heap.init(heap_base, heap_end);
                arch::mpu_init(
                    heap_base as u32,
                    heap_end as u32 - heap_base as u32,
                );

                let idle = k
                    .threads
                    .create(&ThreadConfig {
                        entry: idle_main,
                        arg: 0,
                        name: "idle",
                        stack_base: core::ptr::addr_of_mut!(IDLE_STACK.0)
                            as *mut u32,
                        stack_size: core::mem::size_of::<IdleStack>() as u32,
                        priority: Priority::IDLE,
                        time_slice: 1,
                        privileged: true,
                    })
                    .unwrap_or_else(|| panic!("idle thread unallocatable"));
                k.sched.set_idle_thread(idle);
            }

            arch::set_interrupt_priorities();

            // Select the first thread and publish it for the launch trap.
            let first = sched::switch_and_arm(k);
            arch::set_current_tcb(&mut k.threads[first]);
        });

        arch::configure_systick(tick_divisor);
        arch::start_first_thread()
    }
}

#[cfg(target_os = "none")]
pub use boot::start_kernel;
