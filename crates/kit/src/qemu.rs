use std::process::{Command, ExitStatus};

use camino::Utf8PathBuf;
use color_eyre::eyre::Context;
use color_eyre::Result;

pub const QEMU_BINARY: &str = "qemu-system-x86_64";

/// How the guest sees the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum DiskMode {
    /// Guest writes land in the image.
    ReadWrite,
    /// Guest writes go to a temporary overlay and are discarded.
    Snapshot,
}

#[derive(Debug)]
pub struct QemuConfig {
    pub memory_mb: u32,
    pub vcpus: u32,
    pub kernel_path: Utf8PathBuf,
    pub disk_path: Utf8PathBuf,
    pub disk_mode: DiskMode,
    pub kernel_cmdline: Vec<String>,
    /// Host port forwarded to the guest's SSH port.
    pub ssh_port: u16,
}

impl QemuConfig {
    pub fn args(&self) -> Vec<String> {
        let mut drive = format!("file={},format=raw,if=virtio", self.disk_path);
        if self.disk_mode == DiskMode::Snapshot {
            drive.push_str(",snapshot=on");
        }
        vec![
            "-m".to_owned(),
            format!("{}M", self.memory_mb),
            "-smp".to_owned(),
            self.vcpus.to_string(),
            "-enable-kvm".to_owned(),
            "-cpu".to_owned(),
            "host".to_owned(),
            "-kernel".to_owned(),
            self.kernel_path.to_string(),
            "-append".to_owned(),
            self.kernel_cmdline.join(" "),
            "-drive".to_owned(),
            drive,
            "-netdev".to_owned(),
            format!("user,id=net0,hostfwd=tcp::{}-:22", self.ssh_port),
            "-device".to_owned(),
            "virtio-net-pci,netdev=net0".to_owned(),
            "-serial".to_owned(),
            "mon:stdio".to_owned(),
            "-display".to_owned(),
            "none".to_owned(),
        ]
    }
}

/// Run the hypervisor attached to the terminal until the guest powers off.
pub fn run_qemu(config: &QemuConfig) -> Result<ExitStatus> {
    let mut cmd = Command::new(QEMU_BINARY);
    cmd.args(config.args());
    tracing::debug!("exec: {QEMU_BINARY} {:?}", config.args());
    cmd.status().context("Failed to spawn QEMU")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(disk_mode: DiskMode) -> QemuConfig {
        QemuConfig {
            memory_mb: 8192,
            vcpus: 4,
            kernel_path: "kernels/stock/bzImage".into(),
            disk_path: "disk.img".into(),
            disk_mode,
            kernel_cmdline: vec!["root=/dev/vda".into(), "console=ttyS0".into()],
            ssh_port: 10022,
        }
    }

    fn value_of<'a>(args: &'a [String], flag: &str) -> &'a str {
        let pos = args.iter().position(|a| a == flag).unwrap();
        &args[pos + 1]
    }

    #[test]
    fn test_snapshot_mode_discards_writes() {
        let args = config(DiskMode::Snapshot).args();
        assert_eq!(
            value_of(&args, "-drive"),
            "file=disk.img,format=raw,if=virtio,snapshot=on"
        );
        let args = config(DiskMode::ReadWrite).args();
        assert_eq!(value_of(&args, "-drive"), "file=disk.img,format=raw,if=virtio");
    }

    #[test]
    fn test_args() {
        let args = config(DiskMode::ReadWrite).args();
        assert_eq!(value_of(&args, "-m"), "8192M");
        assert_eq!(value_of(&args, "-smp"), "4");
        assert_eq!(value_of(&args, "-kernel"), "kernels/stock/bzImage");
        assert_eq!(value_of(&args, "-append"), "root=/dev/vda console=ttyS0");
        assert_eq!(
            value_of(&args, "-netdev"),
            "user,id=net0,hostfwd=tcp::10022-:22"
        );
        assert!(args.iter().any(|a| a == "-enable-kvm"));
    }
}
