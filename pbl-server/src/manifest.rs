// SPDX-License-Identifier: MPL-2.0

//! The manifest loader and checker.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{Error, Result};

/// Maximum number of logical lines a manifest may contain.
const MAX_LINES: usize = 10;
/// Maximum size of the manifest file itself.
const MAX_MANIFEST_BYTES: usize = 2560;
/// Maximum module entries (one kernel + up to nine modules).
const MAX_MODULES: usize = 9;
/// Module/kernel page size used for padding computations.
const PAGE_SIZE: u32 = 4096;
/// Length of the short basename field, including the NUL terminator.
const NAME_FIELD_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Kernel,
    Module,
}

/// One entry of a loaded manifest: either the single kernel or one of up to
/// nine modules.
pub struct ManifestEntry {
    pub kind: EntryKind,
    pub path: std::path::PathBuf,
    pub file: File,
    /// Payload byte count. For modules this is the file length; for the
    /// kernel it is left at 0 until the ELF reader overwrites it with the
    /// memory footprint.
    pub size: u32,
    /// Zero-padding, in bytes, appended after `size` on the wire so the
    /// next entry starts on a 4 KiB boundary.
    pub padding: u32,
    /// Basename, truncated to fit [`NAME_FIELD_LEN`] minus the NUL.
    pub name: String,
}

/// The parsed, checked manifest: exactly one kernel at index 0 followed by
/// zero or more modules, in file order.
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn kernel(&self) -> &ManifestEntry {
        &self.entries[0]
    }

    pub fn kernel_mut(&mut self) -> &mut ManifestEntry {
        &mut self.entries[0]
    }

    pub fn modules(&self) -> &[ManifestEntry] {
        &self.entries[1..]
    }

    /// Sum of `size + padding` across every entry — the value transmitted
    /// as the image size in `SendSize`.
    pub fn total_transmit_size(&self) -> u32 {
        self.entries.iter().map(|e| e.size + e.padding).sum()
    }
}

/// Load and check the manifest at `path`.
pub fn load(path: &Path) -> Result<Manifest> {
    let text = read_manifest_text(path)?;
    let lines = split_lines(&text)?;

    let mut entries = Vec::with_capacity(lines.len());
    let mut module_count = 0usize;

    for (index, raw_line) in lines.iter().enumerate() {
        let line = raw_line.trim_start_matches([' ', '\t']);
        if line.is_empty() {
            continue;
        }

        let (keyword, rest) = line
            .split_once(char::is_whitespace)
            .ok_or(Error::ManifestSyntax {
                line: index,
                reason: "is missing a path",
            })?;
        let path_str = rest.trim_end();

        let kind = match (index, keyword) {
            (0, "kernel") => EntryKind::Kernel,
            (0, _) => {
                return Err(Error::ManifestSyntax {
                    line: index,
                    reason: "must start with the `kernel` keyword",
                })
            }
            (_, "module") => EntryKind::Module,
            (_, _) => {
                return Err(Error::ManifestSyntax {
                    line: index,
                    reason: "has an invalid keyword",
                })
            }
        };

        if kind == EntryKind::Module {
            module_count += 1;
            if module_count > MAX_MODULES {
                return Err(Error::ManifestSyntax {
                    line: index,
                    reason: "exceeds the maximum of nine modules",
                });
            }
        }

        entries.push(open_entry(kind, index, Path::new(path_str))?);
    }

    if entries.is_empty() || entries[0].kind != EntryKind::Kernel {
        return Err(Error::ManifestSyntax {
            line: 0,
            reason: "must start with the `kernel` keyword",
        });
    }

    Ok(Manifest { entries })
}

fn read_manifest_text(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut buf = String::new();
    file.read_to_string(&mut buf).map_err(Error::from)?;
    if buf.len() > MAX_MANIFEST_BYTES {
        return Err(Error::ManifestSyntax {
            line: 0,
            reason: "exceeds the 2560-byte manifest size limit",
        });
    }
    Ok(buf)
}

/// Split on `\n` or `\r`, capping at [`MAX_LINES`] non-empty logical lines.
/// An empty line — whether a deliberate separator or an artifact of CRLF
/// endings splitting on both `\n` and `\r` — is not an entry and does not
/// count toward the cap.
fn split_lines(text: &str) -> Result<Vec<&str>> {
    let lines: Vec<&str> = text.split(['\n', '\r']).collect();
    let non_empty_count = lines.iter().filter(|l| !l.is_empty()).count();
    if non_empty_count > MAX_LINES {
        return Err(Error::ManifestSyntax {
            line: MAX_LINES,
            reason: "has more than ten entries",
        });
    }
    Ok(lines)
}

fn open_entry(kind: EntryKind, line: usize, path: &Path) -> Result<ManifestEntry> {
    let file = File::open(path).map_err(|_| Error::ManifestSemantics {
        line,
        reason: "could not be opened for reading",
    })?;
    let len = file
        .metadata()
        .map_err(|_| Error::ManifestSemantics {
            line,
            reason: "could not be stat'd",
        })?
        .len();
    if len == 0 {
        return Err(Error::ManifestSemantics {
            line,
            reason: "is empty",
        });
    }

    let size = u32::try_from(len).map_err(|_| Error::ManifestSemantics {
        line,
        reason: "is too large to transmit",
    })?;
    // The kernel's size is deferred to the ELF reader.
    let (size, padding) = match kind {
        EntryKind::Kernel => (0, 0),
        // `(-size) mod 4096`, computed without signed arithmetic.
        EntryKind::Module => (size, (PAGE_SIZE - size % PAGE_SIZE) % PAGE_SIZE),
    };

    let name = basename(path, line)?;

    Ok(ManifestEntry {
        kind,
        path: path.to_path_buf(),
        file,
        size,
        padding,
        name,
    })
}

fn basename(path: &Path, line: usize) -> Result<String> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(Error::ManifestSemantics {
            line,
            reason: "has no valid basename",
        })?;
    let max_len = NAME_FIELD_LEN - 1;
    Ok(if name.len() > max_len {
        name[..max_len].to_string()
    } else {
        name.to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(contents: &[u8]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(contents).unwrap();
        f
    }

    #[test]
    fn loads_kernel_only_manifest() {
        let kernel = write_temp(b"fake-kernel-bytes");
        let manifest_text = format!("kernel {}\n", kernel.path().display());
        let manifest_file = write_temp(manifest_text.as_bytes());

        let manifest = load(manifest_file.path()).unwrap();
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.kernel().kind, EntryKind::Kernel);
    }

    #[test]
    fn loads_kernel_and_modules_with_padding() {
        let kernel = write_temp(b"fake-kernel-bytes");
        let mod_a = write_temp(&vec![0u8; 3000]);
        let mod_b = write_temp(&vec![0u8; 5000]);
        let manifest_text = format!(
            "kernel {}\nmodule {}\nmodule {}\n",
            kernel.path().display(),
            mod_a.path().display(),
            mod_b.path().display()
        );
        let manifest_file = write_temp(manifest_text.as_bytes());

        let manifest = load(manifest_file.path()).unwrap();
        assert_eq!(manifest.modules().len(), 2);
        assert_eq!(manifest.modules()[0].size, 3000);
        assert_eq!(manifest.modules()[0].padding, 4096 - 3000);
        assert_eq!(manifest.modules()[1].size, 5000);
        assert_eq!(manifest.modules()[1].padding, 8192 - 5000);
    }

    #[test]
    fn rejects_non_kernel_first_line() {
        let m = write_temp(b"module /tmp/whatever\n");
        let err = load(m.path()).unwrap_err();
        assert!(matches!(err, Error::ManifestSyntax { line: 0, .. }));
    }

    #[test]
    fn rejects_missing_file() {
        let manifest_text = "kernel /does/not/exist\n";
        let m = write_temp(manifest_text.as_bytes());
        let err = load(m.path()).unwrap_err();
        assert!(matches!(err, Error::ManifestSemantics { line: 0, .. }));
    }

    #[test]
    fn rejects_empty_file() {
        let kernel = write_temp(b"");
        let manifest_text = format!("kernel {}\n", kernel.path().display());
        let m = write_temp(manifest_text.as_bytes());
        let err = load(m.path()).unwrap_err();
        assert!(matches!(err, Error::ManifestSemantics { line: 0, .. }));
    }

    #[test]
    fn rejects_more_than_ten_lines() {
        let kernel = write_temp(b"fake-kernel-bytes");
        let mut text = format!("kernel {}\n", kernel.path().display());
        for _ in 0..10 {
            text.push_str("module /tmp/whatever\n");
        }
        let m = write_temp(text.as_bytes());
        let err = load(m.path()).unwrap_err();
        assert!(matches!(err, Error::ManifestSyntax { .. }));
    }

    #[test]
    fn truncates_long_basenames() {
        let long_name = "a".repeat(64);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(&long_name);
        std::fs::write(&path, b"contents").unwrap();
        let entry = open_entry(EntryKind::Module, 1, &path).unwrap();
        assert_eq!(entry.name.len(), 31);
    }
}
