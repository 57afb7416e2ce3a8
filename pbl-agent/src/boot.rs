// SPDX-License-Identifier: MPL-2.0

//! Entry point assembly: a secondary-core park/wake convention (spin on the
//! per-core mailbox at `0xE0 + 8*coreId`, `dsb`/`sev` to release) layered
//! over a minimal "clear BSS, set SP, call Rust" entry shape.
//!
//! Core 0 does all of the work; cores 1-3 spin on their mailbox until
//! [`crate::handoff::release`] writes the kernel's entry address there.

core::arch::global_asm! {
    ".section .text._start",
    ".global _start",
    "_start:",
    "mrs x1, MPIDR_EL1",
    "and x1, x1, 0b11",
    "cbz x1, 0f",

    // Secondary cores: spin on this core's mailbox slot until it holds a
    // non-zero address, then jump there.
    "1:",
    "wfe",
    "ldr x2, ={MAILBOX_BASE}",
    "add x2, x2, x1, lsl 3",
    "ldr x3, [x2]",
    "cbz x3, 1b",
    "br x3",

    "0:",
    // Core 0: disable interrupts, zero BSS, set up the stack, hand off to
    // Rust.
    "msr DAIFSET, 0b1111",
    "adrp x2, __bss_start",
    "add x2, x2, :lo12:__bss_start",
    "adrp x3, __bss_end",
    "add x3, x3, :lo12:__bss_end",
    "2:",
    "cmp x2, x3",
    "b.ge 3f",
    "str xzr, [x2], 8",
    "b 2b",
    "3:",
    "ldr x2, ={STACK_TOP}",
    "mov sp, x2",
    "bl {kmain}",
    "4:",
    "wfe",
    "b 4b",
    MAILBOX_BASE = const crate::handoff::MAILBOX_BASE,
    STACK_TOP = const crate::STACK_TOP,
    kmain = sym crate::kmain,
}
