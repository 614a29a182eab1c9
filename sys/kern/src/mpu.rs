// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Portable MPU region math for PMSAv7 (ARMv7-M).
//!
//! This module computes region register values; it never touches hardware.
//! Actually loading the registers is the arch layer's job, both at boot
//! (static regions) and on context switch (the per-thread stack region).
//!
//! PMSAv7 geometry rules: a region's size is a power of two no smaller than 32
//! bytes, and its base address must be aligned to its size. Thread stacks are
//! validated against these rules at creation time so the per-switch work is a
//! plain two-register store of precomputed values.

use bitflags::bitflags;

bitflags! {
    /// Access attributes used to cook up RASR values.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct RegionAttributes: u8 {
        /// Readable by unprivileged code.
        const READ = 1 << 0;
        /// Writable by unprivileged code.
        const WRITE = 1 << 1;
        /// Executable.
        const EXECUTE = 1 << 2;
        /// Device memory (strongly-ordered-ish, uncached).
        const DEVICE = 1 << 3;
    }
}

/// Fixed assignment of the eight PMSAv7 region slots.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum RegionSlot {
    Flash = 0,
    KernelSram = 1,
    Peripherals = 2,
    System = 3,
    /// Rewritten on every context switch with the incoming thread's stack.
    ThreadStack = 4,
    Heap = 5,
}

/// Precomputed RBAR/RASR pair for one thread's stack region.
///
/// `repr(C)` to preserve field order, which matches the register order in the
/// MPU. We don't bit-copy the struct into the hardware, but keeping the order
/// aligned improves code generation in practice.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(C)]
pub struct StackRegion {
    pub rbar: u32,
    pub rasr: u32,
}

impl StackRegion {
    /// Placeholder used before a thread has a validated stack (idle-thread
    /// bring-up, freshly reset TCB slots). RASR enable bit clear, so loading
    /// it disables the thread-stack slot.
    pub const DISABLED: Self = Self {
        rbar: RBAR_VALID | RegionSlot::ThreadStack as u32,
        rasr: 0,
    };
}

// RBAR: setting VALID makes the write also select the region in bits [3:0],
// saving the separate RNR store.
pub const RBAR_VALID: u32 = 1 << 4;

// RASR fields.
pub const RASR_ENABLE: u32 = 1 << 0;
pub const RASR_XN: u32 = 1 << 28;

// AP encodings (RASR bits [26:24]). Chosen so that privileged code is never
// denied access to the memory.
pub const AP_PRIV_RW: u32 = 0b001 << 24;
pub const AP_FULL_ACCESS: u32 = 0b011 << 24;
pub const AP_RO_ALL: u32 = 0b110 << 24;

// TEX/S/C/B composites (RASR bits [21:16]). See table B3-13 in the ARMv7-M
// ARM.
pub const TEX_NORMAL_NONCACHE: u32 = (0b001 << 19) | (1 << 18);
pub const TEX_DEVICE: u32 = (1 << 18) | (1 << 16);
pub const TEX_NORMAL_WT: u32 = (1 << 18) | (1 << 17);

/// Rounds `n` up to the next power of two, with a floor of 32 (the smallest
/// legal PMSAv7 region).
pub fn round_up_size(n: u32) -> u32 {
    if n <= 32 {
        return 32;
    }
    n.next_power_of_two()
}

/// Encodes a power-of-two region size into the 5-bit RASR SIZE field, which
/// holds `log2(size) - 1`. Returns 0 for values that are not a power of two
/// or are below the 32-byte minimum -- 0 is not a legal encoding for any
/// region we program, so it doubles as the failure sentinel.
pub fn size_encoding(size: u32) -> u8 {
    if size < 32 || !size.is_power_of_two() {
        return 0;
    }
    (size.trailing_zeros() - 1) as u8
}

/// Checks that a stack buffer satisfies the region geometry rules: at least
/// 32 bytes, power-of-two sized, base aligned to size.
pub fn validate_stack(base: u32, size: u32) -> bool {
    size >= 32 && size.is_power_of_two() && base & (size - 1) == 0
}

/// Assembles the register pair for a thread's stack region: full access,
/// execute-never, normal non-cacheable memory in the `ThreadStack` slot.
///
/// Callers are expected to have run [`validate_stack`] first; an invalid
/// geometry here would produce a region covering the wrong extent.
pub fn compute_stack_region(base: u32, size: u32) -> StackRegion {
    let rbar = (base & !0x1F) | RBAR_VALID | RegionSlot::ThreadStack as u32;
    let rasr = u32::from(size_encoding(size)) << 1
        | AP_FULL_ACCESS
        | RASR_XN
        | TEX_NORMAL_NONCACHE
        | RASR_ENABLE;
    StackRegion { rbar, rasr }
}

/// Assembles the register pair for one of the static boot-time regions.
pub fn compute_region(
    slot: RegionSlot,
    base: u32,
    size: u32,
    atts: RegionAttributes,
) -> StackRegion {
    let xn = !atts.contains(RegionAttributes::EXECUTE);
    let ap = if atts.contains(RegionAttributes::WRITE) {
        if atts.contains(RegionAttributes::READ) {
            AP_FULL_ACCESS
        } else {
            AP_PRIV_RW
        }
    } else if atts.contains(RegionAttributes::READ) {
        AP_RO_ALL
    } else {
        AP_PRIV_RW
    };
    let tex = if atts.contains(RegionAttributes::DEVICE) {
        TEX_DEVICE
    } else if atts.contains(RegionAttributes::EXECUTE) {
        TEX_NORMAL_WT
    } else {
        TEX_NORMAL_NONCACHE
    };
    StackRegion {
        rbar: (base & !0x1F) | RBAR_VALID | slot as u32,
        rasr: u32::from(size_encoding(size)) << 1
            | ap
            | if xn { RASR_XN } else { 0 }
            | tex
            | RASR_ENABLE,
    }
}
