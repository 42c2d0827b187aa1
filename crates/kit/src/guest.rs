//! Configuration applied to the guest tree through the chroot boundary
//!
//! The sequence runs in order and stops at the first failure. It is not
//! transactional: a failure partway leaves the image partly configured,
//! while host resources are still torn down by the pipeline.
//!
//! The account credentials are fixed so experiment automation can log in
//! non-interactively. The image is meant for a disposable, isolated VM.

use std::io::Write as _;

use camino::Utf8PathBuf;
use color_eyre::eyre::Context;
use color_eyre::Result;
use indoc::formatdoc;

use crate::layout::ImageLayout;
use crate::payload::{Payload, GUEST_BOOT_DIR, GUEST_PAYLOAD_ROOT};
use crate::runner::{CommandLine, CommandRunner};

pub const GUEST_USER: &str = "labvm";
pub const GUEST_PASSWORD: &str = "labvm";
pub const GUEST_HOSTNAME: &str = "labvm";

/// Installed on top of the bootstrapped base system.
pub const GUEST_PACKAGES: &[&str] = &[
    "sudo",
    "openssh-server",
    "python3",
    "make",
    "gcc",
    "numactl",
    "linux-perf",
    "stress-ng",
];

pub const SWAP_FILE: &str = "/swapfile";
pub const SWAP_SIZE: &str = "2G";

/// Virtual consoles the headless guest never uses.
const UNUSED_CONSOLES: &[&str] = &["tty1", "tty2", "tty3", "tty4", "tty5", "tty6"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestCommand {
    /// Executed inside the guest tree via chroot.
    Run(CommandLine),
    /// Written host-side at the guest path.
    WriteFile {
        path: Utf8PathBuf,
        contents: String,
        mode: u32,
    },
    /// Appended host-side at the guest path.
    AppendFile { path: Utf8PathBuf, contents: String },
}

impl GuestCommand {
    fn run<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Run(CommandLine::new(argv))
    }

    fn write(path: &str, contents: impl Into<String>, mode: u32) -> Self {
        Self::WriteFile {
            path: path.into(),
            contents: contents.into(),
            mode,
        }
    }

    fn append(path: &str, contents: impl Into<String>) -> Self {
        Self::AppendFile {
            path: path.into(),
            contents: contents.into(),
        }
    }

    /// Apply against the image mounted at `layout.mount_dir`.
    pub fn apply(&self, layout: &ImageLayout, runner: &dyn CommandRunner) -> Result<()> {
        match self {
            GuestCommand::Run(cmd) => {
                runner.run(&cmd.clone().in_chroot(&layout.mount_dir))?;
            }
            GuestCommand::WriteFile {
                path,
                contents,
                mode,
            } => {
                use std::os::unix::fs::PermissionsExt;
                let host = layout.guest_path(path);
                if let Some(parent) = host.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Creating {parent}"))?;
                }
                std::fs::write(&host, contents).with_context(|| format!("Writing {host}"))?;
                std::fs::set_permissions(&host, std::fs::Permissions::from_mode(*mode))
                    .with_context(|| format!("Setting mode of {host}"))?;
            }
            GuestCommand::AppendFile { path, contents } => {
                let host = layout.guest_path(path);
                if let Some(parent) = host.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Creating {parent}"))?;
                }
                let mut f = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&host)
                    .with_context(|| format!("Opening {host}"))?;
                f.write_all(contents.as_bytes())
                    .with_context(|| format!("Appending to {host}"))?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for GuestCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuestCommand::Run(cmd) => write!(f, "{cmd}"),
            GuestCommand::WriteFile { path, mode, .. } => write!(f, "write {path} ({mode:o})"),
            GuestCommand::AppendFile { path, .. } => write!(f, "append to {path}"),
        }
    }
}

fn apt_get<'a>(args: impl IntoIterator<Item = &'a str>) -> GuestCommand {
    let argv = std::iter::once("apt-get").chain(args);
    GuestCommand::Run(CommandLine::new(argv).env("DEBIAN_FRONTEND", "noninteractive"))
}

/// The ordered configuration batch for an image built from `payload`.
pub fn configuration_sequence(payload: &Payload) -> Vec<GuestCommand> {
    let mut seq = vec![
        GuestCommand::write("/etc/hostname", format!("{GUEST_HOSTNAME}\n"), 0o644),
        GuestCommand::append("/etc/fstab", "/dev/vda / ext4 errors=remount-ro 0 1\n"),
        GuestCommand::run(
            ["systemctl", "mask"]
                .into_iter()
                .map(ToOwned::to_owned)
                .chain(UNUSED_CONSOLES.iter().map(|t| format!("getty@{t}.service"))),
        ),
        GuestCommand::run(["useradd", "-m", "-s", "/bin/bash", GUEST_USER]),
        GuestCommand::run([
            "sh",
            "-c",
            &format!("echo '{GUEST_USER}:{GUEST_PASSWORD}' | chpasswd"),
        ]),
        GuestCommand::write(
            "/etc/systemd/system/serial-getty@ttyS0.service.d/autologin.conf",
            formatdoc! {"
                [Service]
                ExecStart=
                ExecStart=-/sbin/agetty --autologin {GUEST_USER} --keep-baud 115200,57600,38400,9600 %I $TERM
            "},
            0o644,
        ),
        GuestCommand::write(
            &format!("/etc/sudoers.d/{GUEST_USER}"),
            format!("{GUEST_USER} ALL=(ALL) NOPASSWD:ALL\n"),
            0o440,
        ),
        apt_get(["update"]),
        apt_get(
            ["install", "-y", "--no-install-recommends"]
                .into_iter()
                .chain(GUEST_PACKAGES.iter().copied()),
        ),
        GuestCommand::run(["fallocate", "-l", SWAP_SIZE, SWAP_FILE]),
        GuestCommand::run(["chmod", "600", SWAP_FILE]),
        GuestCommand::run(["mkswap", SWAP_FILE]),
        GuestCommand::append("/etc/fstab", format!("{SWAP_FILE} none swap sw 0 0\n")),
    ];

    if payload.installs_under_opt() {
        seq.push(GuestCommand::run([
            "chown",
            "-R",
            &format!("{GUEST_USER}:{GUEST_USER}"),
            GUEST_PAYLOAD_ROOT,
        ]));
    }
    if payload.has_boot_scripts() {
        seq.push(GuestCommand::write(
            "/etc/systemd/system/labvm-boot.service",
            formatdoc! {"
                [Unit]
                Description=labvm boot-time scripts
                After=network-online.target
                Wants=network-online.target

                [Service]
                Type=oneshot
                RemainAfterExit=yes
                ExecStart=/bin/run-parts --verbose --regex=. {GUEST_BOOT_DIR}

                [Install]
                WantedBy=multi-user.target
            "},
            0o644,
        ));
        seq.push(GuestCommand::run([
            "systemctl",
            "enable",
            "labvm-boot.service",
        ]));
    }
    seq
}

/// Extra packages debootstrap installs into the base system.
pub const BOOTSTRAP_INCLUDE: &[&str] = &[
    "systemd-sysv",
    "udev",
    "kmod",
    "ifupdown",
    "isc-dhcp-client",
    "iproute2",
    "ca-certificates",
];
