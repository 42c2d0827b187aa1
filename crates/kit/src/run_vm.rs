//! Boot the provisioned image.
//!
//! The kernel is not taken from the image: each variant lives at
//! `<kernel-dir>/<variant>/bzImage`, so the same image can be booted with a
//! stock and a patched kernel side by side.

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use tracing::info;

use crate::layout::ImageOpts;
use crate::qemu::{self, DiskMode, QemuConfig};
use crate::utils;

/// Kernel builds available to boot the image with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum KernelVariant {
    Stock,
    Patched,
}

#[derive(Debug, Parser)]
pub struct RunOpts {
    #[clap(flatten)]
    pub image: ImageOpts,

    /// Whether guest writes persist to the image
    #[clap(long, value_enum, default_value_t = DiskMode::Snapshot)]
    pub disk_mode: DiskMode,

    /// Kernel variant to boot
    #[clap(long, value_enum, default_value_t = KernelVariant::Stock)]
    pub kernel: KernelVariant,

    /// Directory containing one subdirectory per kernel variant
    #[clap(long, env = "LABVM_KERNEL_DIR", default_value = "kernels")]
    pub kernel_dir: Utf8PathBuf,

    /// Guest memory (e.g. 8G, 4096M)
    #[clap(long, default_value = "8G")]
    pub memory: String,

    /// Number of virtual CPUs
    #[clap(long, default_value_t = 4)]
    pub vcpus: u32,

    /// Host port forwarded to the guest's SSH server
    #[clap(long, default_value_t = 10022)]
    pub ssh_port: u16,
}

impl RunOpts {
    fn kernel_path(&self) -> Utf8PathBuf {
        self.kernel_dir
            .join(self.kernel.to_string())
            .join("bzImage")
    }

    fn qemu_config(&self) -> Result<QemuConfig> {
        let disk_path = self.image.layout()?.image;
        if !disk_path.exists() {
            return Err(eyre!("Disk image {disk_path} not found; run `labvm build` first"));
        }
        let kernel_path = self.kernel_path();
        if !kernel_path.exists() {
            return Err(eyre!(
                "Kernel {kernel_path} not found for the {} variant",
                self.kernel
            ));
        }
        Ok(QemuConfig {
            memory_mb: utils::parse_memory_to_mb(&self.memory)?,
            vcpus: self.vcpus,
            kernel_path,
            disk_path,
            disk_mode: self.disk_mode,
            kernel_cmdline: ["root=/dev/vda", "rw", "console=ttyS0"]
                .map(ToOwned::to_owned)
                .to_vec(),
            ssh_port: self.ssh_port,
        })
    }
}

/// Returns the hypervisor's exit code.
pub fn run(opts: RunOpts) -> Result<i32> {
    let config = opts.qemu_config()?;
    info!(
        "Booting {} with the {} kernel ({} disk, ssh on port {})",
        config.disk_path, opts.kernel, config.disk_mode, config.ssh_port
    );
    let status = qemu::run_qemu(&config)?;
    Ok(status.code().unwrap_or(1))
}
