// SPDX-License-Identifier: MPL-2.0

//! The Multiboot-1 information block builder.
//!
//! Field names below follow `Redstone-OS-ignite`'s `Multiboot1Info` /
//! `Multiboot1Module` naming. The block is built with typed append methods
//! and explicit byte writers rather than pointer arithmetic over a raw
//! array.

use pbl_proto::wire::MBI_ADDR;
use pbl_proto::AlignExt;

/// Size of the populated MB1 info header, up to and including
/// `mmap_addr` — the standard 116-byte structure, even though this
/// implementation only ever sets bits 3 and 6.
const HEADER_SIZE: usize = 116;
/// Size of one memory-map entry: a 4-byte `size` field followed by 20 bytes
/// of `{base_addr, length, type}`.
const MMAP_ENTRY_SIZE: usize = 24;
/// Size of one module table record: `{mod_start, mod_end, string, reserved}`.
const MODULE_RECORD_SIZE: usize = 16;
/// Size of one tail-packed module name slot.
const NAME_SLOT_SIZE: usize = 34;
/// Maximum modules the 8 KiB block can hold without the module table
/// colliding with the tail name slots; the manifest's own cap of nine
/// modules keeps this from ever binding in practice.
const MAX_MODULES: usize = 9;

const FLAG_MODULES: u32 = 1 << 3;
const FLAG_MMAP: u32 = 1 << 6;

const MMAP_OFFSET: usize = HEADER_SIZE;
const MODULE_TABLE_OFFSET: usize = MMAP_OFFSET + MMAP_ENTRY_SIZE;

/// A fully populated 8 KiB Multiboot-1 information block, always
/// transmitted in full so the tail-packed name slots survive.
pub struct MbiBlock(pub [u8; pbl_proto::wire::MBI_BLOCK_SIZE]);

impl MbiBlock {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn flags(&self) -> u32 {
        read_u32(&self.0, 0)
    }

    pub fn mmap_addr(&self) -> u32 {
        read_u32(&self.0, 48)
    }

    pub fn mmap_length(&self) -> u32 {
        read_u32(&self.0, 44)
    }

    pub fn mods_count(&self) -> u32 {
        read_u32(&self.0, 20)
    }

    pub fn mods_addr(&self) -> u32 {
        read_u32(&self.0, 24)
    }

    pub fn mmap_entry(&self) -> (u32, u64, u64, u32) {
        let off = MMAP_OFFSET;
        let size = read_u32(&self.0, off);
        let base = read_u64(&self.0, off + 4);
        let length = read_u64(&self.0, off + 12);
        let ty = read_u32(&self.0, off + 20);
        (size, base, length, ty)
    }

    pub fn module_record(&self, index: usize) -> (u32, u32, u32, u32) {
        let off = MODULE_TABLE_OFFSET + index * MODULE_RECORD_SIZE;
        (
            read_u32(&self.0, off),
            read_u32(&self.0, off + 4),
            read_u32(&self.0, off + 8),
            read_u32(&self.0, off + 12),
        )
    }

    /// The NUL-terminated basename at tail slot `index`.
    pub fn name_slot(&self, index: usize) -> &str {
        let off = name_slot_offset(index);
        let slot = &self.0[off..off + NAME_SLOT_SIZE];
        let end = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
        std::str::from_utf8(&slot[..end]).unwrap_or("")
    }
}

fn name_slot_offset(index: usize) -> usize {
    pbl_proto::wire::MBI_BLOCK_SIZE - NAME_SLOT_SIZE * (index + 1)
}

/// Builds an [`MbiBlock`] across the lifetime of a transfer: the static
/// parts (flags, memory map) are set once at construction, then one module
/// record + name slot is appended per module as the transfer streams each
/// one during `SendModules`.
pub struct MbiBuilder {
    block: [u8; pbl_proto::wire::MBI_BLOCK_SIZE],
    module_count: usize,
}

impl MbiBuilder {
    /// Build the static portions: flags and the single memory map entry
    /// covering `[0, 0x3F00_0000)`.
    pub fn new() -> Self {
        let mut block = [0u8; pbl_proto::wire::MBI_BLOCK_SIZE];

        write_u32(&mut block, 0, FLAG_MODULES | FLAG_MMAP);

        let mmap_addr = MBI_ADDR + MMAP_OFFSET as u32;
        write_u32(&mut block, MMAP_OFFSET, 20); // size (excludes this field itself)
        write_u64(&mut block, MMAP_OFFSET + 4, 0); // base_addr
        write_u64(&mut block, MMAP_OFFSET + 12, 0x3F00_0000); // length
        write_u32(&mut block, MMAP_OFFSET + 20, 1); // type = available

        write_u32(&mut block, 44, MMAP_ENTRY_SIZE as u32); // mmap_length
        write_u32(&mut block, 48, mmap_addr); // mmap_addr

        MbiBuilder {
            block,
            module_count: 0,
        }
    }

    /// Append a module's record and tail-packed name slot. `mod_start` is
    /// the module's physical base address; `size` is its unpadded byte
    /// length.
    pub fn add_module(&mut self, name: &str, mod_start: u32, size: u32) {
        assert!(self.module_count < MAX_MODULES, "too many modules for one MBI block");

        let k = self.module_count;
        let record_off = MODULE_TABLE_OFFSET + k * MODULE_RECORD_SIZE;
        let name_off = name_slot_offset(k);

        write_u32(&mut self.block, record_off, mod_start);
        write_u32(&mut self.block, record_off + 4, mod_start + size);
        write_u32(&mut self.block, record_off + 8, MBI_ADDR + name_off as u32);
        write_u32(&mut self.block, record_off + 12, 0); // reserved

        let name_bytes = name.as_bytes();
        let max_len = NAME_SLOT_SIZE - 1;
        let copy_len = name_bytes.len().min(max_len);
        self.block[name_off..name_off + copy_len].copy_from_slice(&name_bytes[..copy_len]);
        self.block[name_off + copy_len] = 0;

        self.module_count += 1;
        write_u32(&mut self.block, 20, self.module_count as u32); // mods_count
        write_u32(&mut self.block, 24, MBI_ADDR + MODULE_TABLE_OFFSET as u32); // mods_addr
    }

    pub fn finish(self) -> MbiBlock {
        MbiBlock(self.block)
    }
}

impl Default for MbiBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Running physical base address for the next module, starting right after
/// the kernel image and advancing by each module's unpadded size.
pub fn first_module_base(kernel_transmit_size: u32) -> u32 {
    pbl_proto::wire::KERNEL_LOAD_ADDR + kernel_transmit_size
}

pub fn next_module_base(current: u32, module_size: u32) -> u32 {
    current + module_size
}

pub fn round_up_page(value: u32) -> u32 {
    value.align_up(4096)
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

fn write_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_and_mmap_are_fixed() {
        let mbi = MbiBuilder::new().finish();
        assert_eq!(mbi.flags(), 0x48);
        let (size, base, length, ty) = mbi.mmap_entry();
        assert_eq!(size, 20);
        assert_eq!(base, 0);
        assert_eq!(length, 0x3F00_0000);
        assert_eq!(ty, 1);
        assert_eq!(mbi.mmap_length(), 24);
    }

    /// Kernel plus `mod_a` (3000 B), `mod_b` (5000 B).
    #[test]
    fn module_table_and_name_slots_match_scenario() {
        let kernel_transmit_size = 0x2000; // arbitrary K for this test
        let mut builder = MbiBuilder::new();

        let base_a = first_module_base(kernel_transmit_size);
        builder.add_module("mod_a", base_a, 3000);
        let padded_a = round_up_page(3000);
        let base_b = next_module_base(base_a, padded_a);
        builder.add_module("mod_b", base_b, 5000);

        let mbi = builder.finish();
        assert_eq!(mbi.mods_count(), 2);

        let (start_a, end_a, _, _) = mbi.module_record(0);
        assert_eq!(start_a, 0x0010_0000 + kernel_transmit_size);
        assert_eq!(end_a, 0x0010_0000 + kernel_transmit_size + 3000);

        let (start_b, end_b, _, _) = mbi.module_record(1);
        assert_eq!(start_b, start_a + padded_a);
        assert_eq!(end_b, start_b + 5000);

        assert_eq!(mbi.name_slot(0), "mod_a");
        assert_eq!(mbi.name_slot(1), "mod_b");

        assert_eq!(mbi.as_bytes().len(), 8192);
    }

    #[test]
    fn name_slots_are_tail_packed_at_exact_offsets() {
        assert_eq!(name_slot_offset(0), 8192 - 34);
        assert_eq!(name_slot_offset(1), 8192 - 68);
    }
}
