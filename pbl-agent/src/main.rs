// SPDX-License-Identifier: MPL-2.0

//! `pbl-agent`: the on-board half of the bootloader. Emits the wake word,
//! receives the framed image and MBI into fixed physical addresses, and
//! hands off to the kernel.

#![no_std]
#![no_main]

mod boot;
mod handoff;
mod link;
mod receive;
mod uart;

use core::panic::PanicInfo;

/// Top of the agent's own stack, comfortably below the MBI placement
/// floor at `0x000F_C000` so the transfer never tramples it.
const STACK_TOP: u64 = 0x000F_0000;

/// Entered from `boot::_start` once BSS is zeroed and the stack is live.
/// `atags` is whatever firmware left in `x0` on entry to `_start`.
#[no_mangle]
extern "C" fn kmain(atags: u32) -> ! {
    // SAFETY: called exactly once, before any other link operation, on
    // the only core that reaches this function.
    unsafe { link::init() };
    receive::run(atags);
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    link::send_nak();
    loop {
        unsafe { core::arch::asm!("wfe", options(nomem, nostack, preserves_flags)) };
    }
}
