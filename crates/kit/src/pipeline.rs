//! Build a bootable disk image from scratch
//!
//! The pipeline is a fixed, ordered list of [`PipelineStep`]s. Every step that
//! acquires a host resource names the [`ResourceHandle`] it produces, and the
//! handle is recorded in the [`ResourceTracker`] only after the step
//! succeeds. When a step fails, or the operator interrupts the run, the
//! remaining steps are skipped, a partial teardown unwinds exactly what the
//! tracker holds, and then the final teardown runs as it does after every
//! run.
//!
//! # Step order
//!
//! 1. Build the payload workloads (`make -C`), when there is a Makefile.
//! 2. Allocate the sparse image file.
//! 3. Format it as ext4.
//! 4. Create the mount point and loop-mount the image.
//! 5. Bootstrap the base system with debootstrap. The image file becomes a
//!    kept artifact once this succeeds.
//! 6. Copy the payload into the image.
//! 7. Bind-mount the host `/dev` into the image.
//! 8. Mount `proc` for the chroot and apply the guest configuration.
//! 9. Tear everything down again.

use std::fs::OpenOptions;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::{Report, Result};
use indicatif::ProgressBar;
use itertools::Itertools;
use tracing::{error, info, instrument};

use crate::cleanup::{CleanupManager, TeardownMode, TeardownReport};
use crate::guest::{self, GuestCommand};
use crate::interrupt::{Interrupt, INTERRUPTED_EXIT_CODE};
use crate::layout::ImageLayout;
use crate::mounts::MountTable;
use crate::payload::Payload;
use crate::resources::{ResourceHandle, ResourceKind, ResourceTracker};
use crate::runner::{CommandError, CommandLine, CommandRunner};

/// Inputs of one provisioning run.
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    pub layout: ImageLayout,
    pub payload: Payload,
    /// Apparent size of the image file in bytes.
    pub disk_size: u64,
    /// Distribution suite passed to debootstrap.
    pub suite: String,
    pub mirror: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// An external command on the host.
    Command(CommandLine),
    /// Create a sparse file of `size` bytes; an existing file is an error.
    AllocateDisk { path: Utf8PathBuf, size: u64 },
    /// Create a directory and any missing parents.
    CreateDir(Utf8PathBuf),
    /// One entry of the guest configuration batch.
    Guest(GuestCommand),
}

impl std::fmt::Display for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepAction::Command(cmd) => write!(f, "{cmd}"),
            StepAction::AllocateDisk { path, size } => write!(f, "allocate {size} bytes at {path}"),
            StepAction::CreateDir(path) => write!(f, "mkdir -p {path}"),
            StepAction::Guest(cmd) => write!(f, "{cmd}"),
        }
    }
}

/// One entry of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStep {
    /// Position in the canonical step order (1-based).
    pub index: usize,
    pub description: String,
    pub action: StepAction,
    /// Recorded in the tracker once the action succeeds.
    pub produces: Option<ResourceHandle>,
    /// Marked as a kept artifact once the action succeeds.
    pub promotes: Option<ResourceKind>,
}

impl PipelineStep {
    fn new(index: usize, description: impl Into<String>, action: StepAction) -> Self {
        Self {
            index,
            description: description.into(),
            action,
            produces: None,
            promotes: None,
        }
    }

    fn producing(mut self, kind: ResourceKind, path: impl Into<Utf8PathBuf>) -> Self {
        self.produces = Some(ResourceHandle::new(kind, path, self.index));
        self
    }

    fn promoting(mut self, kind: ResourceKind) -> Self {
        self.promotes = Some(kind);
        self
    }
}

/// Terminal result of one pipeline run.
#[derive(Debug)]
pub struct ProvisioningOutcome {
    pub succeeded: bool,
    /// Description of the step that failed or was interrupted.
    pub failed_step: Option<String>,
    /// The command line that failed, when the failure was a command.
    pub failed_command: Option<String>,
    pub error: Option<String>,
    pub exit_code: i32,
    /// Everything both teardown passes did.
    pub cleanup: TeardownReport,
}

struct StepFailure {
    step: String,
    command: Option<String>,
    error: String,
    exit_code: i32,
}

impl StepFailure {
    fn from_error(step: &PipelineStep, e: &Report) -> Self {
        let cmd_err = e.downcast_ref::<CommandError>();
        let exit_code = cmd_err.map(|c| c.exit_code()).filter(|c| *c != 0).unwrap_or(1);
        Self {
            step: step.description.clone(),
            command: cmd_err.map(|c| c.command().to_owned()),
            error: format!("{e:#}"),
            exit_code,
        }
    }

    fn interrupted(step: &PipelineStep) -> Self {
        Self {
            step: format!("interrupted during {}", step.description),
            command: None,
            error: "interrupted by signal".to_owned(),
            exit_code: INTERRUPTED_EXIT_CODE,
        }
    }
}

pub struct ProvisioningPipeline<'a> {
    config: &'a ProvisionConfig,
    runner: &'a dyn CommandRunner,
    mounts: &'a dyn MountTable,
    interrupt: Interrupt,
    progress: ProgressBar,
}

impl std::fmt::Debug for ProvisioningPipeline<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningPipeline")
            .field("config", &self.config)
            .field("interrupt", &self.interrupt)
            .finish()
    }
}

impl<'a> ProvisioningPipeline<'a> {
    pub fn new(
        config: &'a ProvisionConfig,
        runner: &'a dyn CommandRunner,
        mounts: &'a dyn MountTable,
    ) -> Self {
        Self {
            config,
            runner,
            mounts,
            interrupt: Interrupt::new(),
            progress: ProgressBar::hidden(),
        }
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Show the current step on `progress`.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// The full ordered step list for this configuration.
    pub fn steps(&self) -> Vec<PipelineStep> {
        let layout = &self.config.layout;
        let image = layout.image.as_str();
        let mnt = layout.mount_dir.as_str();
        let mut steps = Vec::new();

        if let Some(dir) = self.config.payload.workloads_dir() {
            steps.push(PipelineStep::new(
                1,
                "Building workloads",
                StepAction::Command(CommandLine::new(["make", "-C", dir.as_str()])),
            ));
        }
        steps.push(
            PipelineStep::new(
                2,
                "Allocating disk image",
                StepAction::AllocateDisk {
                    path: layout.image.clone(),
                    size: self.config.disk_size,
                },
            )
            .producing(ResourceKind::DiskFile, &layout.image),
        );
        steps.push(PipelineStep::new(
            3,
            "Formatting disk image",
            StepAction::Command(CommandLine::new(["mkfs.ext4", "-F", "-q", image])),
        ));
        steps.push(
            PipelineStep::new(
                4,
                "Creating mount point",
                StepAction::CreateDir(layout.mount_dir.clone()),
            )
            .producing(ResourceKind::MountDir, &layout.mount_dir),
        );
        steps.push(
            PipelineStep::new(
                4,
                "Mounting disk image",
                StepAction::Command(CommandLine::new(["mount", "-o", "loop", image, mnt])),
            )
            .producing(ResourceKind::LoopMount, &layout.mount_dir),
        );
        let include = format!("--include={}", guest::BOOTSTRAP_INCLUDE.iter().join(","));
        steps.push(
            PipelineStep::new(
                5,
                "Bootstrapping base system",
                StepAction::Command(CommandLine::new([
                    "debootstrap",
                    include.as_str(),
                    self.config.suite.as_str(),
                    mnt,
                    self.config.mirror.as_str(),
                ])),
            )
            .promoting(ResourceKind::DiskFile),
        );
        for (src, guest_dir) in self.config.payload.copies() {
            let dst = layout.guest_path(guest_dir);
            steps.push(PipelineStep::new(
                6,
                format!("Creating {guest_dir}"),
                StepAction::CreateDir(dst.clone()),
            ));
            steps.push(PipelineStep::new(
                6,
                format!("Copying {src} to {guest_dir}"),
                StepAction::Command(CommandLine::new([
                    "cp".to_owned(),
                    "-a".to_owned(),
                    format!("{src}/."),
                    dst.to_string(),
                ])),
            ));
        }
        let dev = layout.dev_dir();
        steps.push(PipelineStep::new(
            7,
            "Creating /dev mount point",
            StepAction::CreateDir(dev.clone()),
        ));
        steps.push(
            PipelineStep::new(
                7,
                "Bind-mounting /dev",
                StepAction::Command(CommandLine::new(["mount", "--bind", "/dev", dev.as_str()])),
            )
            .producing(ResourceKind::BindMount, &dev),
        );
        let proc = layout.proc_dir();
        steps.push(PipelineStep::new(
            8,
            "Creating /proc mount point",
            StepAction::CreateDir(proc.clone()),
        ));
        steps.push(
            PipelineStep::new(
                8,
                "Mounting proc for chroot",
                StepAction::Command(CommandLine::new([
                    "mount",
                    "-t",
                    "proc",
                    "proc",
                    proc.as_str(),
                ])),
            )
            .producing(ResourceKind::ChrootContext, &proc),
        );
        for cmd in guest::configuration_sequence(&self.config.payload) {
            steps.push(PipelineStep::new(
                8,
                format!("Configuring guest: {cmd}"),
                StepAction::Guest(cmd),
            ));
        }
        steps
    }

    /// Run every step, then tear down. `tracker` may already hold resources
    /// left by an earlier run; they are torn down along with this run's.
    #[instrument(skip_all, fields(image = %self.config.layout.image))]
    pub fn provision(&self, tracker: &mut ResourceTracker) -> ProvisioningOutcome {
        let mut failure = None;
        for step in self.steps() {
            if self.interrupt.is_raised() {
                failure = Some(StepFailure::interrupted(&step));
                break;
            }
            self.progress.set_message(step.description.clone());
            info!("Step {}: {}", step.index, step.description);
            if let Err(e) = self.execute(&step) {
                error!("{}: {e:#}", step.description);
                failure = Some(if self.interrupt.is_raised() {
                    StepFailure::interrupted(&step)
                } else {
                    StepFailure::from_error(&step, &e)
                });
                break;
            }
            if let Some(handle) = &step.produces {
                tracker.acquire(handle.clone());
            }
            if let Some(kind) = step.promotes {
                tracker.promote(kind);
            }
        }

        self.progress.set_message("Cleaning up");
        let cleanup = CleanupManager::new(self.runner, self.mounts).with_layout(&self.config.layout);
        let mut report = if failure.is_some() {
            cleanup.teardown(tracker, TeardownMode::Partial)
        } else {
            TeardownReport::default()
        };
        report.supersede(cleanup.teardown(tracker, TeardownMode::Final));
        self.progress.finish_and_clear();

        if failure.is_none() && !report.is_clean() {
            failure = Some(StepFailure {
                step: "Final teardown".to_owned(),
                command: None,
                error: report.failures.iter().join("; "),
                exit_code: 1,
            });
        }

        match failure {
            None => ProvisioningOutcome {
                succeeded: true,
                failed_step: None,
                failed_command: None,
                error: None,
                exit_code: 0,
                cleanup: report,
            },
            Some(f) => ProvisioningOutcome {
                succeeded: false,
                failed_step: Some(f.step),
                failed_command: f.command,
                error: Some(f.error),
                exit_code: f.exit_code,
                cleanup: report,
            },
        }
    }

    fn execute(&self, step: &PipelineStep) -> Result<()> {
        match &step.action {
            StepAction::Command(cmd) => {
                self.runner.run(cmd)?;
            }
            StepAction::AllocateDisk { path, size } => allocate_sparse(path, *size)?,
            StepAction::CreateDir(path) => {
                std::fs::create_dir_all(path).with_context(|| format!("Creating {path}"))?
            }
            StepAction::Guest(cmd) => cmd.apply(&self.config.layout, self.runner)?,
        }
        Ok(())
    }
}

/// Create `path` as a sparse file of `size` bytes.
fn allocate_sparse(path: &Utf8Path, size: u64) -> Result<()> {
    let file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(eyre!("{path} already exists; remove it to build a new image"));
        }
        Err(e) => return Err(e).with_context(|| format!("Creating {path}")),
    };
    if let Err(e) = file.set_len(size) {
        drop(file);
        let _ = std::fs::remove_file(path);
        return Err(e).with_context(|| format!("Resizing {path} to {size} bytes"));
    }
    Ok(())
}
