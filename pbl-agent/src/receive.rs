// SPDX-License-Identifier: MPL-2.0

//! The agent's receive loop. Strictly sequential: each step either advances
//! or halts, there is no retry and no Reinit (unlike the server side, see
//! `pbl-server::state`).

use pbl_proto::wire::{
    KERNEL_LOAD_ADDR, MAX_IMAGE_SIZE, MAX_MBI_SIZE, MBI_ADDR, MBI_PLACEMENT_FLOOR,
};

use crate::link;

/// Why the receive loop gave up. Every variant maps to a NAK plus a
/// diagnostic string on the link, then a halt.
pub enum ReceiveError {
    ImageTooLarge,
    MbiTooLarge,
    MbiPlacementInvalid,
    PermissionDenied,
}

impl ReceiveError {
    fn diagnostic(&self) -> &'static str {
        match self {
            ReceiveError::ImageTooLarge => "image size exceeds 0x3FF00000",
            ReceiveError::MbiTooLarge => "mbi size exceeds 0x4000",
            ReceiveError::MbiPlacementInvalid => "mbi placement below 0x000FC000",
            ReceiveError::PermissionDenied => "server withheld permission to boot",
        }
    }
}

/// Run the whole sequence, never returning on success (it jumps into the
/// kernel) or on failure (it halts).
///
/// `atags` is the boot argument pointer handed to `_start` by firmware,
/// preserved verbatim through to the kernel.
pub fn run(atags: u32) -> ! {
    link::write_bytes(b"\r\n### pbl-agent ready, waiting for wake word\r\n");
    link::emit_wake_word();

    match run_fallible(atags) {
        Ok(never) => match never {},
        Err(e) => {
            link::send_nak();
            link::write_bytes(e.diagnostic().as_bytes());
            halt();
        }
    }
}

fn run_fallible(atags: u32) -> Result<core::convert::Infallible, ReceiveError> {
    // Step 1: image size.
    let image_size = link::read_u32_le();
    if image_size > MAX_IMAGE_SIZE {
        return Err(ReceiveError::ImageTooLarge);
    }
    link::send_ack();

    // Step 2: the image itself, straight into RAM.
    // SAFETY: `image_size <= MAX_IMAGE_SIZE` keeps the write inside the
    // RAM region the MBI's memory map describes as available.
    unsafe { link::read_into(KERNEL_LOAD_ADDR as *mut u8, image_size) };
    link::send_ack();

    // Step 3: the MBI, bounded by its own `mbiSize` rather than reusing
    // `image_size`'s now-exhausted counter.
    let mbi_size = link::read_u32_le();
    if mbi_size > MAX_MBI_SIZE {
        return Err(ReceiveError::MbiTooLarge);
    }
    let placement = (KERNEL_LOAD_ADDR.wrapping_sub(mbi_size)) & !0xFFF;
    if placement < MBI_PLACEMENT_FLOOR {
        return Err(ReceiveError::MbiPlacementInvalid);
    }
    link::send_ack();
    // SAFETY: `placement` was just checked against the floor and the MBI
    // always lands at `MBI_ADDR` in practice.
    unsafe { link::read_into(placement as *mut u8, mbi_size) };
    link::send_ack();

    // Step 4: entry VA.
    let entry_va = link::read_u32_le();
    link::send_ack();

    // Step 5: final permission to boot.
    let permission = link::read_byte();
    if permission != pbl_proto::wire::ACK {
        return Err(ReceiveError::PermissionDenied);
    }

    // Step 6: release secondary cores and jump in.
    // SAFETY: every prior step validated sizes and placement, and the
    // image + MBI are now fully resident.
    unsafe { crate::handoff::release(entry_va, MBI_ADDR, atags) };
}

fn halt() -> ! {
    loop {
        unsafe { core::arch::asm!("wfe", options(nomem, nostack, preserves_flags)) };
    }
}
