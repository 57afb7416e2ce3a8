// SPDX-License-Identifier: MPL-2.0

//! `pbl-server`: transparent TTY passthrough that recognizes a three-break
//! wake word and ships a kernel image + MBI over the link.

mod elf;
mod error;
mod link;
mod manifest;
mod mbi;
mod state;
mod tty;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use link::Link;
use tty::RawStdin;

/// Host-side serial bootloader: TTY passthrough until woken, then ships a
/// kernel image and Multiboot information block.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Serial device to open, e.g. `/dev/ttyUSB0`.
    device: PathBuf,
    /// Manifest file naming the kernel and any modules.
    manifest: PathBuf,
}

/// How long to sleep between retries while the serial device can't be
/// opened, whether absent or merely misbehaving.
const OPEN_RETRY_DELAY: Duration = Duration::from_secs(1);

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let interrupted = Arc::new(AtomicBool::new(false));
    if let Err(e) = install_sigint_hook(Arc::clone(&interrupted)) {
        error!("failed to install SIGINT handler: {e}");
        std::process::exit(1);
    }

    match run(&cli, &interrupted) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!("fatal: {e}");
            std::process::exit(1);
        }
    }
}

/// Install the cleanup hook: a SIGINT must restore the terminal's saved
/// attributes before the process exits. The raw-mode guard
/// itself is only alive inside `run`'s `Tty` state, so the handler instead
/// flips a flag the main loop checks between phases; the guard's `Drop` impl
/// still runs the restore if the process unwinds normally.
fn install_sigint_hook(flag: Arc<AtomicBool>) -> Result<(), std::io::Error> {
    // SAFETY: the only action taken in the handler is a relaxed atomic
    // store, which is async-signal-safe.
    unsafe {
        signal_hook::low_level::register(signal_hook::consts::SIGINT, move || {
            flag.store(true, Ordering::Relaxed);
        })?;
    }
    Ok(())
}

/// The outer loop: OpenDevice → Reinit → Tty → (transfer) → Reinit → Tty ...
/// Only terminal setup, stdin setup, or an out-of-memory condition ever
/// bubbles out of this loop as a fatal error; every other failure demotes
/// to `Reinit` and loops back to `OpenDevice`.
fn run(cli: &Cli, interrupted: &AtomicBool) -> anyhow::Result<()> {
    let _raw = RawStdin::enter()?;

    loop {
        let mut link = match open_device(&cli.device, interrupted) {
            Some(link) => link,
            None => return Ok(()),
        };
        info!("### Listening to {}...", cli.device.display());

        loop {
            let woke = match tty::run(&mut link, interrupted) {
                Ok(woke) => woke,
                Err(e) => {
                    state::log_reinit(&e);
                    break;
                }
            };
            if !woke {
                return Ok(());
            }

            match state::run_transfer(&mut link, &cli.manifest) {
                Ok(()) => {}
                Err(e) => {
                    // Reinit: close the link and reopen the device before
                    // re-entering Tty, dropping any derived state
                    // (manifest/ELF/MBI) along with `link` itself.
                    state::log_reinit(&e);
                    break;
                }
            }
        }
    }
}

/// `OpenDevice`: retry with a 1 s sleep on any failure to open the device,
/// logging the cause. Returns `None` only when interrupted.
fn open_device(
    device: &std::path::Path,
    interrupted: &AtomicBool,
) -> Option<Link<Box<dyn serialport::SerialPort>>> {
    let device_str = device.to_string_lossy();
    loop {
        if interrupted.load(Ordering::Relaxed) {
            return None;
        }
        match Link::open(&device_str) {
            Ok(link) => return Some(link),
            Err(e) => {
                log::warn!("could not open {device_str}: {e}");
                thread::sleep(OPEN_RETRY_DELAY);
            }
        }
    }
}
