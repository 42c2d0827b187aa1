//! Provision the experiment disk image
//!
//! `labvm build` gates on the preflight validator, then drives the
//! [`ProvisioningPipeline`] against the real host. The resource tracker is
//! journaled into the working directory so that `labvm cleanup` can finish
//! the teardown if this process dies before it does.
//!
//! # Usage Examples
//!
//! ```bash
//! # Build ./disk.img from ./payload
//! sudo labvm build
//!
//! # Build a larger image from another mirror
//! sudo labvm build --disk-size 20G --mirror http://ftp.de.debian.org/debian
//! ```

use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing::debug;

use crate::interrupt::Interrupt;
use crate::layout::ImageOpts;
use crate::mounts::SystemMountTable;
use crate::payload::Payload;
use crate::pipeline::{ProvisionConfig, ProvisioningOutcome, ProvisioningPipeline};
use crate::preflight::{PreflightValidator, SystemProbe};
use crate::resources::ResourceTracker;
use crate::runner::SystemRunner;
use crate::utils;

#[derive(Debug, Parser)]
pub struct BuildOpts {
    #[clap(flatten)]
    pub image: ImageOpts,

    /// Directory with workloads, scripts and experiments for the guest
    #[clap(long, env = "LABVM_PAYLOAD", default_value = "payload")]
    pub payload: Utf8PathBuf,

    /// Apparent size of the image (e.g. 10G, 20480M)
    #[clap(long, env = "LABVM_DISK_SIZE", default_value = "10G")]
    pub disk_size: String,

    /// Distribution suite to bootstrap
    #[clap(long, env = "LABVM_SUITE", default_value = "bookworm")]
    pub suite: String,

    /// Package mirror used by debootstrap
    #[clap(long, env = "LABVM_MIRROR", default_value = "http://deb.debian.org/debian")]
    pub mirror: String,

    /// Build even when the host readiness checks report blocking issues
    #[clap(long)]
    pub skip_preflight: bool,
}

impl BuildOpts {
    fn config(&self) -> Result<ProvisionConfig> {
        Ok(ProvisionConfig {
            layout: self.image.layout()?,
            payload: Payload::new(&self.payload),
            disk_size: utils::parse_size(&self.disk_size)?,
            suite: self.suite.clone(),
            mirror: self.mirror.clone(),
        })
    }
}

fn step_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_draw_target(ProgressDrawTarget::stderr());
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn print_outcome(config: &ProvisionConfig, outcome: &ProvisioningOutcome) {
    if outcome.succeeded {
        println!("Disk image ready: {}", config.layout.image);
    } else {
        if let Some(step) = &outcome.failed_step {
            eprintln!("Provisioning failed at step: {step}");
        }
        if let Some(cmd) = &outcome.failed_command {
            eprintln!("Failed command: {cmd}");
        }
        if let Some(e) = &outcome.error {
            eprintln!("Error: {e}");
        }
    }
    eprint!("{}", outcome.cleanup);
}

/// Returns the process exit code.
pub fn run(opts: BuildOpts) -> Result<i32> {
    if !rustix::process::geteuid().is_root() {
        return Err(eyre!(
            "labvm build must run as root to create loop and bind mounts"
        ));
    }
    let config = opts.config()?;

    if opts.skip_preflight {
        debug!("Skipping preflight checks");
    } else {
        let report = PreflightValidator::new(SystemProbe::new(&config.layout.workdir)).validate();
        if !report.is_ready() {
            print!("{}", report.render());
            return Ok(report.exit_code());
        }
    }

    std::fs::create_dir_all(&config.layout.workdir)?;
    let journal = config.layout.journal();
    let mut tracker = ResourceTracker::with_journal(&journal)?;
    if !tracker.is_empty() {
        return Err(eyre!(
            "{journal} records {} resources from an earlier run; run `labvm cleanup` first",
            tracker.len()
        ));
    }

    let interrupt = Interrupt::install()?;
    let runner = SystemRunner;
    let mounts = SystemMountTable;
    let outcome = ProvisioningPipeline::new(&config, &runner, &mounts)
        .with_interrupt(interrupt)
        .with_progress(step_progress_bar())
        .provision(&mut tracker);
    print_outcome(&config, &outcome);
    Ok(outcome.exit_code)
}
