// SPDX-License-Identifier: MPL-2.0

//! Framing bytes, fixed physical addresses, and payload limits agreed
//! between the server and the agent.

/// A single byte of the wake word; three of these in a row requests a
/// kernel from the server.
pub const WAKE_BYTE: u8 = 0x03;

/// Number of consecutive [`WAKE_BYTE`]s that form the wake word.
pub const WAKE_WORD_LEN: usize = 3;

/// Positive handshake acknowledgment.
pub const ACK: u8 = 0x06;

/// Negative handshake acknowledgment.
pub const NAK: u8 = 0x15;

/// Physical address the kernel image (program header payloads + BSS) is
/// loaded at.
pub const KERNEL_LOAD_ADDR: u32 = 0x0010_0000;

/// Physical address of the Multiboot information block.
pub const MBI_ADDR: u32 = 0x000F_E000;

/// Maximum total image size the agent will accept, leaving room below the
/// 1 GiB mark for the image itself.
pub const MAX_IMAGE_SIZE: u32 = 0x3FF0_0000;

/// Upper bound implied by [`MAX_IMAGE_SIZE`]: `KERNEL_LOAD_ADDR + imageSize`
/// must never exceed this.
pub const IMAGE_SPACE_LIMIT: u32 = 0x4000_0000;

/// Maximum size of the transmitted MBI block.
pub const MAX_MBI_SIZE: u32 = 0x4000;

/// Size of the MBI block as it is always transmitted, regardless of how much
/// of it is actually populated (tail-packed module name slots must survive).
pub const MBI_BLOCK_SIZE: usize = 8192;

/// The multiboot bootloader magic the agent places in its first argument
/// register at handoff.
pub const MULTIBOOT_BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

/// Lower bound the agent's computed MBI placement must respect.
pub const MBI_PLACEMENT_FLOOR: u32 = 0x000F_C000;

/// Size in bytes of one 32-bit little-endian ELF32 program header entry.
pub const ELF32_PHDR_SIZE: usize = 32;

/// Number of bytes read up front to locate and validate the ELF header and
/// its program header table.
pub const ELF_HEADER_READ_SIZE: usize = 4096;

/// Encode a `u32` as four little-endian bytes, the wire's only multi-byte
/// integer representation.
#[inline]
pub const fn encode_u32_le(value: u32) -> [u8; 4] {
    value.to_le_bytes()
}

/// Decode four little-endian bytes into a `u32`.
#[inline]
pub const fn decode_u32_le(bytes: [u8; 4]) -> u32 {
    u32::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_endianness() {
        let values = [0u32, 1, 0x0010_0000, 0x2BADB002, 0xFFFF_FFFF];
        for v in values {
            let bytes = encode_u32_le(v);
            assert_eq!(decode_u32_le(bytes), v);
        }
    }

    #[test]
    fn little_endian_byte_order() {
        let bytes = encode_u32_le(0x0010_0000);
        assert_eq!(bytes, [0x00, 0x00, 0x10, 0x00]);
    }

    #[test]
    fn image_space_limit_matches_max_image_size() {
        assert_eq!(KERNEL_LOAD_ADDR + MAX_IMAGE_SIZE, IMAGE_SPACE_LIMIT);
    }
}
