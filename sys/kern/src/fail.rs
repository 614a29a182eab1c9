// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! What happens when the kernel itself is wrong.
//!
//! Invariant violations in kernel code reach `panic!`, which lands here on
//! bare-metal builds. There is no recovery story: report through the crash
//! console if one is installed, then park next to the fault path's
//! diagnostic loop and wait for the watchdog (or the person with the
//! debugger).

use core::fmt::Write;

struct PanicConsole(fn(u8));

impl Write for PanicConsole {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for b in s.bytes() {
            if b == b'\n' {
                (self.0)(b'\r');
            }
            (self.0)(b);
        }
        Ok(())
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    cortex_m::interrupt::disable();

    if let Some(putb) = crate::crash::console() {
        let mut console = PanicConsole(putb);
        let _ = writeln!(console, "\n*** KERNEL PANIC: {} ***", info);
    }

    loop {
        cortex_m::asm::wfe();
    }
}
