//! Read-only view of the host mount table.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::Context;
use color_eyre::Result;

/// Answers which paths are currently mount points.
pub trait MountTable {
    /// All current mount targets.
    fn targets(&self) -> Result<Vec<Utf8PathBuf>>;

    fn is_mounted(&self, path: &Utf8Path) -> Result<bool> {
        Ok(self.targets()?.iter().any(|t| t == path))
    }

    /// Mount targets at or below `root`.
    fn mounted_under(&self, root: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
        Ok(self
            .targets()?
            .into_iter()
            .filter(|t| t.starts_with(root))
            .collect())
    }
}

/// Mount table of the calling process, from `/proc/self/mountinfo`.
#[derive(Debug, Default)]
pub struct SystemMountTable;

impl MountTable for SystemMountTable {
    fn targets(&self) -> Result<Vec<Utf8PathBuf>> {
        let buf = std::fs::read_to_string("/proc/self/mountinfo")
            .context("Reading /proc/self/mountinfo")?;
        Ok(parse_mountinfo(&buf))
    }
}

/// Extract mount targets (the fifth field) from mountinfo content.
pub(crate) fn parse_mountinfo(content: &str) -> Vec<Utf8PathBuf> {
    content
        .lines()
        .filter_map(|line| line.split_ascii_whitespace().nth(4))
        .map(|target| Utf8PathBuf::from(unescape_octal(target)))
        .collect()
}

/// The kernel escapes space, tab, newline and backslash as `\NNN`.
fn unescape_octal(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let parsed = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|d| u8::from_str_radix(d, 8).ok());
            if let Some(v) = parsed {
                out.push(v);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
