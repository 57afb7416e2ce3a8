// SPDX-License-Identifier: MPL-2.0

//! The PL011 UART as a byte-duplex MMIO device.
//!
//! This is the minimal register set needed to exercise the abstract link,
//! not a general-purpose driver. GPIO alt-function muxing and the UART
//! clock are assumed to already be configured by firmware before `_start`
//! runs.

use core::ptr::{read_volatile, write_volatile};

/// Peripheral base for a Raspberry Pi 2/3 class board, matching the single
/// `[0, 0x3F00_0000)` memory-map entry the MBI builder publishes.
const PERIPHERAL_BASE: usize = 0x3F20_0000;
const UART0_BASE: usize = PERIPHERAL_BASE + 0x1000;

const DR: usize = UART0_BASE;
const FR: usize = UART0_BASE + 0x18;
const IBRD: usize = UART0_BASE + 0x24;
const FBRD: usize = UART0_BASE + 0x28;
const LCRH: usize = UART0_BASE + 0x2C;
const CR: usize = UART0_BASE + 0x30;
const ICR: usize = UART0_BASE + 0x44;

const FR_RXFE: u32 = 1 << 4;
const FR_TXFF: u32 = 1 << 5;

const LCRH_FEN: u32 = 1 << 4;
const LCRH_WLEN_8BIT: u32 = 0b11 << 5;

const CR_UARTEN: u32 = 1 << 0;
const CR_TXE: u32 = 1 << 8;
const CR_RXE: u32 = 1 << 9;

/// A byte-duplex link over the on-board UART: the same two read modes, the
/// same handful of operations as the host-side `Link`, but here talking
/// directly to MMIO instead of a host serial port.
pub struct Pl011 {
    _private: (),
}

impl Pl011 {
    /// Program 115200 8N1 with FIFOs enabled, no flow control. The UART
    /// clock is assumed to be the default 48 MHz firmware leaves it at.
    ///
    /// # Safety
    /// Must be called exactly once, before any other MMIO access to UART0,
    /// with no other core concurrently touching these registers.
    pub unsafe fn init() -> Self {
        unsafe {
            write_volatile(CR as *mut u32, 0);
            write_volatile(ICR as *mut u32, 0x7FF);

            // 115200 baud at 48 MHz: divisor = 48_000_000 / (16 * 115200) = 26.0417
            write_volatile(IBRD as *mut u32, 26);
            write_volatile(FBRD as *mut u32, 3);

            write_volatile(LCRH as *mut u32, LCRH_WLEN_8BIT | LCRH_FEN);
            write_volatile(CR as *mut u32, CR_UARTEN | CR_TXE | CR_RXE);
        }
        Pl011 { _private: () }
    }

    fn flags(&self) -> u32 {
        unsafe { read_volatile(FR as *const u32) }
    }

    /// Non-blocking: `Some(byte)` if one was waiting, `None` otherwise.
    pub fn try_read_byte(&mut self) -> Option<u8> {
        if self.flags() & FR_RXFE != 0 {
            None
        } else {
            Some(unsafe { read_volatile(DR as *const u32) } as u8)
        }
    }

    /// Blocking: suspend until a byte arrives.
    pub fn read_byte(&mut self) -> u8 {
        loop {
            if let Some(b) = self.try_read_byte() {
                return b;
            }
            core::hint::spin_loop();
        }
    }

    pub fn write_byte(&mut self, byte: u8) {
        while self.flags() & FR_TXFF != 0 {
            core::hint::spin_loop();
        }
        unsafe { write_volatile(DR as *mut u32, byte as u32) };
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.write_byte(b);
        }
    }
}
