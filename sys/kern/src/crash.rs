// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Portable crash-dump formatting.
//!
//! When the CPU faults, the arch layer captures the stacked registers and the
//! fault-status registers into a [`FaultRecord`] and hands it here, along
//! with a polled byte sink supplied by the board (typically a UART TX-empty
//! spin loop). This module turns the record into a single-shot structured
//! report: fault kind, registers, each status register in hex with its set
//! bits decoded by name, thread identity and stack geometry, and the
//! exception-return value.
//!
//! The dump is printed exactly once and the system then parks in a
//! diagnostic-indicator loop; rebooting is an external watchdog's decision,
//! not ours.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicUsize, Ordering};

/// Snapshot of one thread's identity for the report.
#[derive(Copy, Clone, Debug)]
pub struct ThreadSnapshot {
    pub id: u8,
    pub name: &'static str,
    pub stack_base: u32,
    pub stack_size: u32,
}

/// Everything the formatter needs, gathered by arch-specific code.
#[derive(Copy, Clone, Debug)]
pub struct FaultRecord {
    /// "HardFault", "MemManage", "BusFault", "UsageFault", ...
    pub kind: &'static str,
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r12: u32,
    pub lr: u32,
    pub pc: u32,
    pub psr: u32,
    pub sp: u32,
    /// EXC_RETURN observed at handler entry.
    pub exc_return: u32,
    /// Fault status registers with display names, e.g. CFSR/HFSR/MMFAR/BFAR.
    pub status_regs: [(&'static str, u32); 4],
    /// The thread that was current, if any (a fault can hit before the
    /// scheduler starts).
    pub thread: Option<ThreadSnapshot>,
}

/// Set-bit meanings of the Configurable Fault Status Register (ARMv7-M).
/// MMFSR occupies bits 0..8, BFSR 8..16, UFSR 16..32.
const CFSR_BITS: &[(u32, &str)] = &[
    (0, "IACCVIOL"),
    (1, "DACCVIOL"),
    (3, "MUNSTKERR"),
    (4, "MSTKERR"),
    (5, "MLSPERR"),
    (7, "MMARVALID"),
    (8, "IBUSERR"),
    (9, "PRECISERR"),
    (10, "IMPRECISERR"),
    (11, "UNSTKERR"),
    (12, "STKERR"),
    (13, "LSPERR"),
    (15, "BFARVALID"),
    (16, "UNDEFINSTR"),
    (17, "INVSTATE"),
    (18, "INVPC"),
    (19, "NOCP"),
    (24, "UNALIGNED"),
    (25, "DIVBYZERO"),
];

/// Set-bit meanings of the HardFault Status Register.
const HFSR_BITS: &[(u32, &str)] = &[
    (1, "VECTTBL"),
    (30, "FORCED"),
    (31, "DEBUGEVT"),
];

struct Sink<'a> {
    putb: &'a mut dyn FnMut(u8),
}

impl fmt::Write for Sink<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            if b == b'\n' {
                (self.putb)(b'\r');
            }
            (self.putb)(b);
        }
        Ok(())
    }
}

fn decode_bits(
    out: &mut Sink<'_>,
    value: u32,
    table: &[(u32, &str)],
) -> fmt::Result {
    let mut first = true;
    for &(bit, name) in table {
        if value & (1 << bit) != 0 {
            out.write_str(if first { " [" } else { " " })?;
            out.write_str(name)?;
            first = false;
        }
    }
    if !first {
        out.write_str("]")?;
    }
    Ok(())
}

fn emit(rec: &FaultRecord, out: &mut Sink<'_>) -> fmt::Result {
    write!(out, "\n*** KERNEL FAULT: {} ***\n", rec.kind)?;
    write!(
        out,
        " r0 ={:08x} r1 ={:08x} r2 ={:08x} r3 ={:08x}\n",
        rec.r0, rec.r1, rec.r2, rec.r3
    )?;
    write!(
        out,
        " r12={:08x} lr ={:08x} pc ={:08x} psr={:08x}\n",
        rec.r12, rec.lr, rec.pc, rec.psr
    )?;
    write!(
        out,
        " sp ={:08x} exc_return={:08x}\n",
        rec.sp, rec.exc_return
    )?;

    for (name, value) in rec.status_regs {
        write!(out, " {:<5}={:08x}", name, value)?;
        match name {
            "CFSR" => decode_bits(out, value, CFSR_BITS)?,
            "HFSR" => decode_bits(out, value, HFSR_BITS)?,
            _ => {}
        }
        out.write_str("\n")?;
    }

    match rec.thread {
        Some(t) => write!(
            out,
            " thread {} '{}' stack {:08x}+{:x}\n",
            t.id, t.name, t.stack_base, t.stack_size
        )?,
        None => out.write_str(" no thread (fault before scheduling)\n")?,
    }
    out.write_str("*** END FAULT ***\n")
}

/// Formats `rec` through `putb`, one byte at a time. Infallible by
/// construction; the sink cannot fail.
pub fn dump(rec: &FaultRecord, putb: &mut dyn FnMut(u8)) {
    let mut sink = Sink { putb };
    // The sink never errors, so neither can emit.
    let _ = emit(rec, &mut sink);
}

/// The board-installed polled console, stored as a bare function address so
/// it is usable from any fault context. Zero means none installed.
static CONSOLE: AtomicUsize = AtomicUsize::new(0);

/// Installs the polled byte-output primitive the dumper should use. Boards
/// call this once during bring-up, before faults can be reported.
pub fn set_console(putb: fn(u8)) {
    CONSOLE.store(putb as usize, Ordering::Relaxed);
}

/// The installed console, if any.
pub fn console() -> Option<fn(u8)> {
    match CONSOLE.load(Ordering::Relaxed) {
        0 => None,
        // Safety: the only non-zero value ever stored is a fn(u8) address.
        f => Some(unsafe { core::mem::transmute::<usize, fn(u8)>(f) }),
    }
}

/// Dumps through the installed console; silently does nothing when no
/// console has been installed (a crash before board bring-up has nowhere to
/// report to anyway).
pub fn dump_to_console(rec: &FaultRecord) {
    if let Some(putb) = console() {
        dump(rec, &mut |b| putb(b));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FaultRecord {
        FaultRecord {
            kind: "MemManage",
            r0: 0x1,
            r1: 0x2,
            r2: 0x3,
            r3: 0x4,
            r12: 0xC,
            lr: 0x0800_1235,
            pc: 0x0800_4000,
            psr: 0x0100_0000,
            sp: 0x2000_07C0,
            exc_return: 0xFFFF_FFFD,
            status_regs: [
                ("CFSR", (1 << 7) | (1 << 1)), // MMARVALID | DACCVIOL
                ("HFSR", 0),
                ("MMFAR", 0x2000_03FC),
                ("BFAR", 0),
            ],
            thread: Some(ThreadSnapshot {
                id: 3,
                name: "worker",
                stack_base: 0x2000_0400,
                stack_size: 0x400,
            }),
        }
    }

    fn render(rec: &FaultRecord) -> String {
        let mut bytes = Vec::new();
        dump(rec, &mut |b| bytes.push(b));
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn report_carries_kind_registers_and_thread() {
        let text = render(&sample());
        assert!(text.contains("KERNEL FAULT: MemManage"));
        assert!(text.contains("pc =08004000"));
        assert!(text.contains("exc_return=fffffffd"));
        assert!(text.contains("thread 3 'worker' stack 20000400+400"));
    }

    #[test]
    fn cfsr_bits_are_decoded_by_name() {
        let text = render(&sample());
        assert!(text.contains("DACCVIOL"));
        assert!(text.contains("MMARVALID"));
        assert!(!text.contains("DIVBYZERO"));
    }

    #[test]
    fn divide_by_zero_decodes() {
        let mut rec = sample();
        rec.kind = "UsageFault";
        rec.status_regs[0] = ("CFSR", 1 << 25);
        let text = render(&rec);
        assert!(text.contains("DIVBYZERO"));
    }

    #[test]
    fn pre_scheduler_fault_has_no_thread_line() {
        let mut rec = sample();
        rec.thread = None;
        let text = render(&rec);
        assert!(text.contains("no thread"));
    }

    #[test]
    fn newlines_become_crlf() {
        let text = render(&sample());
        assert!(text.contains("\r\n"));
        assert!(!text.replace("\r\n", "").contains('\n'));
    }
}
