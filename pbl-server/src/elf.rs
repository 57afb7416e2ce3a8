// SPDX-License-Identifier: MPL-2.0

//! The ELF reader.
//!
//! The kernel file is untrusted input, so this reads through an explicit
//! byte buffer and decodes fields by hand rather than overlaying a
//! `#[repr(C)]` struct onto attacker-controlled bytes.

use std::io::{Read, Seek, SeekFrom};

use pbl_proto::wire::{ELF32_PHDR_SIZE, ELF_HEADER_READ_SIZE};
use pbl_proto::AlignExt;

use crate::error::{Error, Result};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;

/// One program header's file/memory layout, enough to drive the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    pub file_offset: u32,
    pub file_size: u32,
    pub mem_size: u32,
}

/// What the server needs from the kernel's ELF image: where to jump, and
/// how to stream it.
#[derive(Debug, Clone)]
pub struct ElfSummary {
    pub entry_va: u32,
    pub program_headers: Vec<ProgramHeader>,
}

impl ElfSummary {
    /// Sum of each program header's memory footprint, rounded up to a 4 KiB
    /// multiple — the kernel's transmit size.
    pub fn transmit_size(&self) -> u32 {
        self.program_headers
            .iter()
            .map(|ph| ph.mem_size.align_up(4096))
            .sum()
    }
}

/// Read and validate the first 4096 bytes of `file`, parse its program
/// header table, and return the resulting summary.
pub fn read<F: Read + Seek>(file: &mut F) -> Result<ElfSummary> {
    let mut header = [0u8; ELF_HEADER_READ_SIZE];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header)
        .map_err(|_| Error::ElfInvalid("kernel file is shorter than the 4096-byte ELF header read"))?;

    if header[0..4] != ELF_MAGIC {
        return Err(Error::ElfInvalid("bad ELF magic"));
    }
    if header[4] != ELFCLASS32 {
        return Err(Error::ElfInvalid("not a 32-bit ELF (ELFCLASS32)"));
    }
    if header[5] != ELFDATA2LSB {
        return Err(Error::ElfInvalid("not little-endian (ELFDATA2LSB)"));
    }
    let e_type = read_u16(&header, 16);
    if e_type != ET_EXEC {
        return Err(Error::ElfInvalid("not an executable (ET_EXEC)"));
    }

    let e_entry = read_u32(&header, 24);
    let e_phoff = read_u32(&header, 28) as usize;
    let e_phnum = read_u16(&header, 44) as usize;

    let mut program_headers = Vec::with_capacity(e_phnum);
    for i in 0..e_phnum {
        let off = e_phoff + i * ELF32_PHDR_SIZE;
        let ph_bytes = header
            .get(off..off + ELF32_PHDR_SIZE)
            .ok_or(Error::ElfInvalid("program header table extends past the 4096-byte read"))?;
        program_headers.push(ProgramHeader {
            file_offset: read_u32(ph_bytes, 4),
            file_size: read_u32(ph_bytes, 16),
            mem_size: read_u32(ph_bytes, 20),
        });
    }

    Ok(ElfSummary {
        entry_va: e_entry,
        program_headers,
    })
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Build a minimal valid ELF32 LE executable header with one program
    /// header.
    fn make_elf(entry: u32, offset: u32, filesz: u32, memsz: u32) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        buf[0..4].copy_from_slice(&ELF_MAGIC);
        buf[4] = ELFCLASS32;
        buf[5] = ELFDATA2LSB;
        buf[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        buf[24..28].copy_from_slice(&entry.to_le_bytes());
        buf[28..32].copy_from_slice(&52u32.to_le_bytes()); // e_phoff
        buf[44..46].copy_from_slice(&1u16.to_le_bytes()); // e_phnum

        let ph_off = 52;
        buf[ph_off + 4..ph_off + 8].copy_from_slice(&offset.to_le_bytes());
        buf[ph_off + 16..ph_off + 20].copy_from_slice(&filesz.to_le_bytes());
        buf[ph_off + 20..ph_off + 24].copy_from_slice(&memsz.to_le_bytes());
        buf
    }

    #[test]
    fn reads_valid_elf_s1_scenario() {
        let data = make_elf(0x0010_8000, 4096, 1024, 8192);
        let mut cursor = Cursor::new(data);
        let summary = read(&mut cursor).unwrap();
        assert_eq!(summary.entry_va, 0x0010_8000);
        assert_eq!(summary.program_headers.len(), 1);
        assert_eq!(summary.transmit_size(), 0x2000);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = make_elf(0, 4096, 0, 0);
        data[0] = 0x00;
        let mut cursor = Cursor::new(data);
        assert!(matches!(read(&mut cursor), Err(Error::ElfInvalid(_))));
    }

    #[test]
    fn rejects_wrong_class() {
        let mut data = make_elf(0, 4096, 0, 0);
        data[4] = 2;
        let mut cursor = Cursor::new(data);
        assert!(matches!(read(&mut cursor), Err(Error::ElfInvalid(_))));
    }

    #[test]
    fn rejects_wrong_endianness() {
        let mut data = make_elf(0, 4096, 0, 0);
        data[5] = 2;
        let mut cursor = Cursor::new(data);
        assert!(matches!(read(&mut cursor), Err(Error::ElfInvalid(_))));
    }

    #[test]
    fn rejects_wrong_type() {
        let mut data = make_elf(0, 4096, 0, 0);
        data[16..18].copy_from_slice(&1u16.to_le_bytes());
        let mut cursor = Cursor::new(data);
        assert!(matches!(read(&mut cursor), Err(Error::ElfInvalid(_))));
    }

    #[test]
    fn rejects_short_file() {
        let data = vec![0u8; 4095];
        let mut cursor = Cursor::new(data);
        assert!(matches!(read(&mut cursor), Err(Error::ElfInvalid(_))));
    }
}
