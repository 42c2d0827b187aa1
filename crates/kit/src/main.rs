use clap::{Parser, Subcommand};
use color_eyre::{Report, Result};

mod build;
mod cleanup;
mod guest;
mod interrupt;
mod layout;
mod mounts;
mod payload;
mod pipeline;
mod preflight;
mod qemu;
mod resources;
mod run_vm;
mod runner;
#[cfg(test)]
mod testing;
mod utils;

/// Provision and boot a disposable virtual machine for experiments.
///
/// labvm builds a raw ext4 disk image with a minimal Debian system and the
/// experiment payload, checks that the host can run it, and boots it with
/// QEMU/KVM. Every host resource taken during a build is released again,
/// including after failures and interrupts.
#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the disk image (requires root)
    Build(build::BuildOpts),

    /// Check that this host can build and run the image
    Preflight(preflight::PreflightOpts),

    /// Boot the disk image
    Run(run_vm::RunOpts),

    /// Release mounts and files left behind by an interrupted build
    Cleanup(cleanup::CleanupOpts),
}

/// Install and configure the tracing/logging system.
///
/// Logs are filtered by RUST_LOG environment variable, defaulting to 'info'.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Build(opts) => build::run(opts)?,
        Commands::Preflight(opts) => preflight::run(opts)?,
        Commands::Run(opts) => run_vm::run(opts)?,
        Commands::Cleanup(opts) => cleanup::run(opts)?,
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
