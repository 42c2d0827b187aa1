//! Paths of one provisioning run.

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;

/// File name of the resource journal inside the working directory.
pub const JOURNAL_NAME: &str = "labvm-resources.json";

/// Location of the image, shared by every subcommand.
#[derive(Debug, Clone, clap::Args)]
pub struct ImageOpts {
    /// Directory holding the image, its mount point and the resource journal
    #[clap(long, env = "LABVM_WORKDIR", default_value = ".")]
    pub workdir: Utf8PathBuf,

    /// Image file name, relative to the working directory
    #[clap(long, env = "LABVM_IMAGE", default_value = "disk.img")]
    pub image: Utf8PathBuf,
}

impl ImageOpts {
    /// The layout rooted at the absolute working directory. Mount targets
    /// are compared against the kernel's absolute view of the mount table.
    pub fn layout(&self) -> Result<ImageLayout> {
        let workdir = std::path::absolute(&self.workdir)
            .with_context(|| format!("Resolving {}", self.workdir))?;
        let workdir = Utf8PathBuf::from_path_buf(workdir)
            .map_err(|p| eyre!("Working directory {} is not UTF-8", p.display()))?;
        Ok(ImageLayout::new(workdir, &self.image))
    }
}

/// Drop `.` components, which the mount table never contains.
fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    path.components()
        .filter(|c| !matches!(c, Utf8Component::CurDir))
        .collect()
}

/// Where the image, its mount point and the journal live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLayout {
    pub workdir: Utf8PathBuf,
    pub image: Utf8PathBuf,
    pub mount_dir: Utf8PathBuf,
}

impl ImageLayout {
    /// `image` is resolved relative to `workdir` unless absolute.
    pub fn new(workdir: impl Into<Utf8PathBuf>, image: impl AsRef<Utf8Path>) -> Self {
        let workdir = normalize(&workdir.into());
        let image = normalize(&workdir.join(image.as_ref()));
        let mount_dir = workdir.join("mnt");
        Self {
            workdir,
            image,
            mount_dir,
        }
    }

    pub fn journal(&self) -> Utf8PathBuf {
        self.workdir.join(JOURNAL_NAME)
    }

    pub fn dev_dir(&self) -> Utf8PathBuf {
        self.guest_path("/dev")
    }

    pub fn proc_dir(&self) -> Utf8PathBuf {
        self.guest_path("/proc")
    }

    /// Map an absolute guest path onto the host side of the mounted image.
    pub fn guest_path(&self, guest: impl AsRef<Utf8Path>) -> Utf8PathBuf {
        let guest = guest.as_ref();
        let relative = guest.strip_prefix("/").unwrap_or(guest);
        self.mount_dir.join(relative)
    }

    /// Mount points beneath the image root, innermost first.
    pub fn mount_points(&self) -> [Utf8PathBuf; 3] {
        [self.proc_dir(), self.dev_dir(), self.mount_dir.clone()]
    }
}
