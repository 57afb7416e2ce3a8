// SPDX-License-Identifier: MPL-2.0

//! The server state machine.
//!
//! [`ServerState`] enumerates the transfer lifecycle as a plain sum type;
//! [`run_transfer`] drives it with an explicit `loop`/`match` rather than
//! hand-chaining the per-state methods, so the states and their order are
//! one exhaustive match away from being wrong. The per-state methods live on
//! [`Session`] so they can also be driven directly in tests against a
//! `FakeLink`, without going through the interactive `Tty` state's
//! stdin/link multiplexing (see `tty.rs`).

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, warn};
use pbl_proto::wire::{ACK, MAX_IMAGE_SIZE, MAX_MBI_SIZE, MBI_BLOCK_SIZE, WAKE_BYTE, WAKE_WORD_LEN};

use crate::elf::{self, ElfSummary};
use crate::error::{Error, Result};
use crate::link::{Link, Mode};
use crate::manifest::{self, EntryKind, Manifest};
use crate::mbi::{self, MbiBlock, MbiBuilder};

/// The server's lifecycle states. `OpenDevice`, `Reinit`, and `Tty` are
/// driven by the outer loop in `main`; the rest are driven by
/// [`run_transfer`] dispatching to [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    OpenDevice,
    Reinit,
    Tty,
    ReadConfig,
    CheckConfig,
    SendSize,
    SendKernel,
    SendModules,
    SendMbiSize,
    SendMbi,
    SendEntry,
    Exit,
}

/// Detects the three-consecutive-`0x03` wake word in a byte stream that may
/// split it across arbitrary read boundaries, while preserving any
/// `0x03` run that turns out *not* to complete the word so it can still
/// reach the console.
#[derive(Debug, Default)]
pub struct WakeDetector {
    run: u8,
}

/// What [`WakeDetector::feed`] wants the caller to do with one input byte.
pub enum Emit {
    /// Write these bytes to the console; the wake word has not completed.
    Bytes(Vec<u8>),
    /// The wake word just completed; no bytes should reach the console for
    /// it.
    Woke,
}

impl WakeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, byte: u8) -> Emit {
        if byte == WAKE_BYTE {
            self.run += 1;
            if self.run as usize == WAKE_WORD_LEN {
                self.run = 0;
                return Emit::Woke;
            }
            return Emit::Bytes(Vec::new());
        }

        let mut out = Vec::with_capacity(self.run as usize + 1);
        out.extend(std::iter::repeat(WAKE_BYTE).take(self.run as usize));
        out.push(byte);
        self.run = 0;
        Emit::Bytes(out)
    }
}

/// The built-up derived state for one transfer attempt: the checked
/// manifest, the kernel's ELF summary, and the MBI under construction.
/// `Reinit` drops all of this, which falls naturally out of owning it in a
/// local, not global, value.
pub struct TransferState {
    pub manifest: Manifest,
    pub elf: ElfSummary,
    pub mbi: MbiBuilder,
}

/// Drives one transfer attempt over an already-woken link, from
/// `ReadConfig` through `SendEntry`.
pub struct Session<'a, T: Read + Write> {
    link: &'a mut Link<T>,
}

impl<'a, T: Read + Write> Session<'a, T> {
    pub fn new(link: &'a mut Link<T>) -> Self {
        Session { link }
    }

    /// `ReadConfig`: load the manifest.
    pub fn read_config(&self, manifest_path: &Path) -> Result<Manifest> {
        manifest::load(manifest_path)
    }

    /// `CheckConfig`: validate the kernel's ELF image and fold its memory
    /// footprint back into the manifest's kernel entry.
    pub fn check_config(&self, manifest: &mut Manifest) -> Result<ElfSummary> {
        let kernel = manifest.kernel_mut();
        let summary = elf::read(&mut kernel.file)?;
        kernel.size = summary.transmit_size();
        kernel.padding = 0;
        Ok(summary)
    }

    /// `SendSize`: announce the total transmit size and wait for the
    /// agent's go-ahead. Rejects a total that exceeds the wire limit before
    /// writing anything, rather than letting the agent discover it by NAK.
    pub fn send_size(&mut self, manifest: &Manifest) -> Result<()> {
        let total = manifest.total_transmit_size();
        check_total_size(total)?;
        self.link.set_mode(Mode::Blocking);
        self.link.write_u32_le(total)?;
        expect_ack(self.link)?;
        Ok(())
    }

    /// `SendKernel`: stream each program header's file bytes through a
    /// scratch buffer, then pad with zeros up to its page-rounded memory
    /// size. No handshake between headers.
    pub fn send_kernel(&mut self, manifest: &mut Manifest, elf: &ElfSummary) -> Result<()> {
        const SCRATCH_SIZE: usize = 64 * 1024;
        let mut scratch = vec![0u8; SCRATCH_SIZE];

        let kernel_file = &mut manifest.kernel_mut().file;
        for ph in &elf.program_headers {
            kernel_file.seek(SeekFrom::Start(ph.file_offset as u64))?;
            let mut remaining = ph.file_size;
            while remaining > 0 {
                let chunk = remaining.min(SCRATCH_SIZE as u32) as usize;
                kernel_file.read_exact(&mut scratch[..chunk])?;
                self.link.write_bytes(&scratch[..chunk])?;
                remaining -= chunk as u32;
            }

            let padded = pbl_proto::AlignExt::align_up(ph.mem_size, 4096);
            let zero_count = padded - ph.file_size;
            write_zeros(self.link, zero_count, &mut scratch)?;
        }
        Ok(())
    }

    /// `SendModules`: stream each module's bytes + padding, updating the
    /// MBI's module table and tail name slots as we go, then wait for the
    /// agent's intermediate ACK.
    pub fn send_modules(&mut self, state: &mut TransferState) -> Result<()> {
        const SCRATCH_SIZE: usize = 64 * 1024;
        let mut scratch = vec![0u8; SCRATCH_SIZE];

        let kernel_transmit_size = state.manifest.kernel().size;
        let mut module_base = mbi::first_module_base(kernel_transmit_size);

        for m in state.manifest.entries[1..].iter_mut() {
            debug_assert_eq!(m.kind, EntryKind::Module);

            let mut remaining = m.size;
            m.file.seek(SeekFrom::Start(0))?;
            while remaining > 0 {
                let chunk = remaining.min(SCRATCH_SIZE as u32) as usize;
                m.file.read_exact(&mut scratch[..chunk])?;
                self.link.write_bytes(&scratch[..chunk])?;
                remaining -= chunk as u32;
            }
            write_zeros(self.link, m.padding, &mut scratch)?;

            state.mbi.add_module(&m.name, module_base, m.size);
            module_base = mbi::next_module_base(module_base, mbi::round_up_page(m.size));
        }

        expect_ack(self.link)?;
        self.link.set_mode(Mode::NonBlocking);
        Ok(())
    }

    /// `SendMbiSize` + `SendMbi`: always announce and send the full
    /// 8192-byte block.
    pub fn send_mbi(&mut self, mbi: &MbiBlock) -> Result<()> {
        check_mbi_size(MBI_BLOCK_SIZE as u32)?;
        self.link.set_mode(Mode::Blocking);
        self.link.write_u32_le(MBI_BLOCK_SIZE as u32)?;
        expect_ack(self.link)?;

        self.link.write_bytes(mbi.as_bytes())?;
        expect_ack(self.link)?;
        Ok(())
    }

    /// `SendEntry`: transmit the kernel's entry point and wait for final
    /// permission-to-boot.
    pub fn send_entry(&mut self, entry_va: u32) -> Result<()> {
        self.link.write_u32_le(entry_va)?;
        expect_ack(self.link)?;
        self.link.set_mode(Mode::NonBlocking);
        Ok(())
    }
}

fn expect_ack<T: Read + Write>(link: &mut Link<T>) -> Result<()> {
    let got = link.read_byte_blocking()?;
    if got != ACK {
        return Err(Error::ProtocolViolation { expected: ACK, got });
    }
    Ok(())
}

fn write_zeros<T: Read + Write>(link: &mut Link<T>, mut count: u32, scratch: &mut [u8]) -> Result<()> {
    for b in scratch.iter_mut() {
        *b = 0;
    }
    while count > 0 {
        let chunk = count.min(scratch.len() as u32) as usize;
        link.write_bytes(&scratch[..chunk])?;
        count -= chunk as u32;
    }
    Ok(())
}

/// Run one whole transfer attempt by exhaustively matching [`ServerState`]
/// from `ReadConfig` through `SendEntry`. Any error here is the caller's
/// cue to fall back to `Reinit`.
pub fn run_transfer<T: Read + Write>(link: &mut Link<T>, manifest_path: &Path) -> Result<()> {
    let mut session = Session::new(link);
    let mut state = ServerState::ReadConfig;

    let mut manifest: Option<Manifest> = None;
    let mut transfer: Option<TransferState> = None;
    let mut mbi: Option<MbiBlock> = None;
    let mut entry_va: u32 = 0;

    loop {
        state = match state {
            ServerState::ReadConfig => {
                debug!("state = ReadConfig");
                manifest = Some(session.read_config(manifest_path)?);
                ServerState::CheckConfig
            }
            ServerState::CheckConfig => {
                debug!("state = CheckConfig");
                let mut m = manifest.take().expect("ReadConfig populates manifest");
                let elf = session.check_config(&mut m)?;
                entry_va = elf.entry_va;
                transfer = Some(TransferState {
                    manifest: m,
                    elf,
                    mbi: MbiBuilder::new(),
                });
                ServerState::SendSize
            }
            ServerState::SendSize => {
                debug!("state = SendSize");
                let t = transfer.as_ref().expect("CheckConfig populates transfer");
                session.send_size(&t.manifest)?;
                ServerState::SendKernel
            }
            ServerState::SendKernel => {
                debug!("state = SendKernel");
                let t = transfer.as_mut().expect("CheckConfig populates transfer");
                let elf = t.elf.clone();
                session.send_kernel(&mut t.manifest, &elf)?;
                ServerState::SendModules
            }
            ServerState::SendModules => {
                debug!("state = SendModules");
                let t = transfer.as_mut().expect("CheckConfig populates transfer");
                session.send_modules(t)?;
                ServerState::SendMbiSize
            }
            ServerState::SendMbiSize => {
                debug!("state = SendMbiSize");
                let t = transfer.take().expect("CheckConfig populates transfer");
                mbi = Some(t.mbi.finish());
                ServerState::SendMbi
            }
            ServerState::SendMbi => {
                debug!("state = SendMbi");
                session.send_mbi(mbi.as_ref().expect("SendMbiSize populates the MBI block"))?;
                ServerState::SendEntry
            }
            ServerState::SendEntry => {
                debug!("state = SendEntry");
                session.send_entry(entry_va)?;
                ServerState::Exit
            }
            ServerState::Exit => return Ok(()),
            ServerState::OpenDevice | ServerState::Reinit | ServerState::Tty => {
                unreachable!("OpenDevice/Reinit/Tty are driven by the outer loop in main")
            }
        };
    }
}

/// Guard rail so a manifest that would be rejected by the agent is caught
/// server-side with a clear diagnostic instead of silently hanging on a NAK
/// the agent never sends back over our assumed framing.
pub fn check_total_size(total: u32) -> Result<()> {
    if total > MAX_IMAGE_SIZE {
        return Err(Error::SizeExceeded {
            limit: MAX_IMAGE_SIZE,
            actual: total,
        });
    }
    Ok(())
}

pub fn check_mbi_size(size: u32) -> Result<()> {
    if size > MAX_MBI_SIZE {
        return Err(Error::SizeExceeded {
            limit: MAX_MBI_SIZE,
            actual: size,
        });
    }
    Ok(())
}

/// Logs a `Reinit` transition with its cause as a one-line diagnostic.
pub fn log_reinit(err: &Error) {
    warn!("transfer aborted, returning to console: {err}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::tests::FakeTransport;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    fn write_temp(contents: &[u8]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(contents).unwrap();
        f
    }

    fn make_elf(entry: u32, offset: u32, filesz: u32, memsz: u32) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        buf[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        buf[4] = 1;
        buf[5] = 1;
        buf[16..18].copy_from_slice(&2u16.to_le_bytes());
        buf[24..28].copy_from_slice(&entry.to_le_bytes());
        buf[28..32].copy_from_slice(&52u32.to_le_bytes());
        buf[44..46].copy_from_slice(&1u16.to_le_bytes());
        buf[56..60].copy_from_slice(&offset.to_le_bytes());
        buf[68..72].copy_from_slice(&filesz.to_le_bytes());
        buf[72..76].copy_from_slice(&memsz.to_le_bytes());
        buf
    }

    #[test]
    fn s1_round_trip_produces_expected_wire_bytes() {
        let mut kernel_bytes = make_elf(0x0010_8000, 4096, 1024, 8192);
        // Program header file bytes: anything distinguishable at offset 4096.
        kernel_bytes.resize(4096 + 1024, 0xAB);
        let kernel = write_temp(&kernel_bytes);
        let manifest_text = format!("kernel {}\n", kernel.path().display());
        let manifest_file = write_temp(manifest_text.as_bytes());

        // Every handshake answered with ACK up front.
        let acks = vec![ACK; 5];
        let mut link = Link::from_transport(FakeTransport::new(acks));

        run_transfer(&mut link, manifest_file.path()).unwrap();

        let out = &link.transport.outbound;
        // imageSize
        assert_eq!(&out[0..4], &0x2000u32.to_le_bytes());
        // 1024 file bytes of 0xAB
        assert!(out[4..4 + 1024].iter().all(|&b| b == 0xAB));
        // 7168 zero bytes
        assert!(out[4 + 1024..4 + 1024 + 7168].iter().all(|&b| b == 0));
        let after_kernel = 4 + 1024 + 7168;
        // mbiSize
        assert_eq!(
            &out[after_kernel..after_kernel + 4],
            &8192u32.to_le_bytes()
        );
        let mbi_start = after_kernel + 4;
        assert_eq!(out.len() - mbi_start, 8192 + 4); // MBI block + entry VA
        let entry_off = mbi_start + 8192;
        assert_eq!(&out[entry_off..entry_off + 4], &0x0010_8000u32.to_le_bytes());
    }

    #[test]
    fn s2_oversized_manifest_rejected_before_any_wire_bytes() {
        let kernel = write_temp(b"not-really-an-elf-but-long-enough");
        let mut text = format!("kernel {}\n", kernel.path().display());
        for _ in 0..10 {
            text.push_str("module /tmp/does-not-matter\n");
        }
        let manifest_file = write_temp(text.as_bytes());

        let mut link = Link::from_transport(FakeTransport::new(vec![]));
        let err = run_transfer(&mut link, manifest_file.path()).unwrap_err();
        assert!(matches!(err, Error::ManifestSyntax { .. }));
    }

    #[test]
    fn s3_truncated_kernel_file_fails_elf_read() {
        let kernel = write_temp(&vec![0u8; 4095]);
        let manifest_file = write_temp(format!("kernel {}\n", kernel.path().display()).as_bytes());

        let mut link = Link::from_transport(FakeTransport::new(vec![]));
        let err = run_transfer(&mut link, manifest_file.path()).unwrap_err();
        assert!(matches!(err, Error::ElfInvalid(_)));
    }

    #[test]
    fn wake_detector_fires_once_after_third_consecutive_byte() {
        let mut det = WakeDetector::new();
        let mut stdout_bytes = Vec::new();
        let mut woke_count = 0;
        let bytes = [b'A', WAKE_BYTE, b'B', WAKE_BYTE, WAKE_BYTE, WAKE_BYTE, b'C'];

        for (i, &b) in bytes.iter().enumerate() {
            match det.feed(b) {
                Emit::Bytes(v) => stdout_bytes.extend(v),
                Emit::Woke => {
                    woke_count += 1;
                    assert_eq!(i, 5, "wake must fire right after the third consecutive 0x03");
                    break;
                }
            }
        }

        assert_eq!(woke_count, 1);
        assert_eq!(stdout_bytes, vec![b'A', WAKE_BYTE, b'B']);
    }

    #[test]
    fn isolated_wake_byte_reaches_stdout_with_its_breaker() {
        let mut det = WakeDetector::new();
        let mut stdout_bytes = Vec::new();
        for b in [b'X', WAKE_BYTE, b'Y'] {
            if let Emit::Bytes(v) = det.feed(b) {
                stdout_bytes.extend(v);
            }
        }
        assert_eq!(stdout_bytes, vec![b'X', WAKE_BYTE, b'Y']);
    }
}
