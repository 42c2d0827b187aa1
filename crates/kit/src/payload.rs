//! The host directory supplying workloads and scripts for the guest.
//!
//! ```text
//! payload/
//!   workloads/    built with `make -C` when it has a Makefile
//!   bin/          -> /usr/local/bin
//!   boot/         -> /opt/labvm/boot, run at every boot
//!   experiments/  -> /opt/labvm/experiments
//! ```
//!
//! Every subdirectory is optional.

use camino::Utf8PathBuf;

pub const GUEST_BIN_DIR: &str = "/usr/local/bin";
pub const GUEST_BOOT_DIR: &str = "/opt/labvm/boot";
pub const GUEST_EXPERIMENTS_DIR: &str = "/opt/labvm/experiments";
/// Parent of everything the payload installs under `/opt`.
pub const GUEST_PAYLOAD_ROOT: &str = "/opt/labvm";

const COPIES: &[(&str, &str)] = &[
    ("bin", GUEST_BIN_DIR),
    ("boot", GUEST_BOOT_DIR),
    ("experiments", GUEST_EXPERIMENTS_DIR),
];

#[derive(Debug, Clone)]
pub struct Payload {
    root: Utf8PathBuf,
}

impl Payload {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The workloads directory, if it has something to build.
    pub fn workloads_dir(&self) -> Option<Utf8PathBuf> {
        let dir = self.root.join("workloads");
        dir.join("Makefile").is_file().then_some(dir)
    }

    /// Existing payload directories and the guest directory each lands in.
    pub fn copies(&self) -> Vec<(Utf8PathBuf, &'static str)> {
        COPIES
            .iter()
            .map(|(sub, guest)| (self.root.join(sub), *guest))
            .filter(|(src, _)| src.is_dir())
            .collect()
    }

    pub fn has_boot_scripts(&self) -> bool {
        self.root.join("boot").is_dir()
    }

    /// Whether anything gets installed under [`GUEST_PAYLOAD_ROOT`].
    pub fn installs_under_opt(&self) -> bool {
        self.copies()
            .iter()
            .any(|(_, guest)| guest.starts_with(GUEST_PAYLOAD_ROOT))
    }
}
