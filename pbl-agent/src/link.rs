// SPDX-License-Identifier: MPL-2.0

//! The agent's side of the byte-duplex link, backed by [`crate::uart::Pl011`]
//! behind a spinlock so `read_byte`/`write_byte` can be called from
//! anywhere in `receive` without threading a `&mut` through every function.

use spin::Mutex;

use crate::uart::Pl011;

static UART: Mutex<Option<Pl011>> = Mutex::new(None);

/// # Safety
/// Must be called exactly once, early in `_start`'s Rust entry, before any
/// other link operation.
pub unsafe fn init() {
    let port = unsafe { Pl011::init() };
    *UART.lock() = Some(port);
}

fn with_uart<R>(f: impl FnOnce(&mut Pl011) -> R) -> R {
    let mut guard = UART.lock();
    f(guard.as_mut().expect("link::init was not called"))
}

pub fn write_byte(byte: u8) {
    with_uart(|u| u.write_byte(byte));
}

pub fn write_bytes(bytes: &[u8]) {
    with_uart(|u| u.write_bytes(bytes));
}

pub fn read_byte() -> u8 {
    with_uart(|u| u.read_byte())
}

/// Read exactly 4 bytes and decode them as little-endian.
pub fn read_u32_le() -> u32 {
    let mut bytes = [0u8; 4];
    for b in &mut bytes {
        *b = read_byte();
    }
    pbl_proto::wire::decode_u32_le(bytes)
}

/// Copy `len` bytes from the link directly into physical memory starting
/// at `dest`, without an intermediate buffer.
///
/// # Safety
/// `dest..dest + len` must be valid, writable physical memory not aliased
/// by any live Rust reference.
pub unsafe fn read_into(dest: *mut u8, len: u32) {
    for i in 0..len {
        let byte = read_byte();
        unsafe { dest.add(i as usize).write_volatile(byte) };
    }
}

pub fn emit_wake_word() {
    for _ in 0..pbl_proto::wire::WAKE_WORD_LEN {
        write_byte(pbl_proto::wire::WAKE_BYTE);
    }
}

pub fn send_ack() {
    write_byte(pbl_proto::wire::ACK);
}

pub fn send_nak() {
    write_byte(pbl_proto::wire::NAK);
}
