//! Host readiness checks run before provisioning
//!
//! Four independent checks read host state through a [`HostProbe`] and are
//! folded into one [`PreflightReport`]. Every check always runs, so the
//! operator gets the complete list of problems at once.
//!
//! Missing tools are reported but are advisory: only disk space, memory and
//! virtualization problems land in `blocking_issues` and make the command
//! exit non-zero.

use std::fmt::Write as _;
use std::io::Write as _;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use itertools::Itertools;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::runner::find_in_path;

const GIB: u64 = 1024 * 1024 * 1024;

/// Minimum free space on the filesystem that will hold the image.
pub const MIN_FREE_DISK_BYTES: u64 = 15 * GIB;

/// Minimum available (not total) memory.
pub const MIN_AVAILABLE_MEMORY_BYTES: u64 = 12 * GIB;

/// Executables the build and run commands shell out to.
pub const REQUIRED_TOOLS: &[&str] = &[
    "qemu-system-x86_64",
    "debootstrap",
    "mkfs.ext4",
    "chroot",
    "make",
    "python3",
];

pub const KVM_DEVICE: &str = "/dev/kvm";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum CheckStatus {
    Ok,
    Missing,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckResult {
    fn new(name: impl Into<String>, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
    pub missing_tools: Vec<String>,
    pub blocking_issues: Vec<String>,
}

impl PreflightReport {
    pub fn is_ready(&self) -> bool {
        self.blocking_issues.is_empty()
    }

    /// 0 when nothing blocks, 1 otherwise; missing tools never count.
    pub fn exit_code(&self) -> i32 {
        if self.is_ready() {
            0
        } else {
            1
        }
    }

    /// Human-readable status lines followed by the issue list.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for check in &self.checks {
            let status = format!("[{}]", check.status);
            let _ = writeln!(out, "{status:<10}{}: {}", check.name, check.detail);
        }
        out.push('\n');
        if !self.missing_tools.is_empty() {
            let _ = writeln!(
                out,
                "Missing tools (advisory): {}",
                self.missing_tools.iter().join(", ")
            );
        }
        if self.blocking_issues.is_empty() {
            out.push_str("No blocking issues detected\n");
        } else {
            out.push_str("Blocking issues:\n");
            for issue in &self.blocking_issues {
                let _ = writeln!(out, "  - {issue}");
            }
        }
        out
    }

    fn push(&mut self, check: CheckResult, blocking: Option<String>) {
        self.checks.push(check);
        self.blocking_issues.extend(blocking);
    }
}

/// Source of the host facts the checks evaluate.
pub trait HostProbe {
    fn locate_tool(&self, name: &str) -> Option<Utf8PathBuf>;
    /// Filesystem the free-space check applies to.
    fn disk_target(&self) -> &Utf8Path;
    fn free_disk_bytes(&self) -> Result<u64>;
    fn available_memory_bytes(&self) -> Result<u64>;
    fn has_kvm_device(&self) -> bool;
    fn cpu_flags(&self) -> Result<Vec<String>>;
}

/// Probes the running host.
#[derive(Debug)]
pub struct SystemProbe {
    target: Utf8PathBuf,
}

impl SystemProbe {
    /// `target` is where the image will be written; it need not exist yet.
    pub fn new(target: impl Into<Utf8PathBuf>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

impl HostProbe for SystemProbe {
    fn locate_tool(&self, name: &str) -> Option<Utf8PathBuf> {
        find_in_path(name)
    }

    fn disk_target(&self) -> &Utf8Path {
        &self.target
    }

    fn free_disk_bytes(&self) -> Result<u64> {
        let existing = self
            .target
            .ancestors()
            .find(|p| !p.as_str().is_empty() && p.exists())
            .unwrap_or(Utf8Path::new("."));
        let st = rustix::fs::statvfs(existing.as_std_path())
            .with_context(|| format!("statvfs {existing}"))?;
        Ok(st.f_bavail.saturating_mul(st.f_frsize))
    }

    fn available_memory_bytes(&self) -> Result<u64> {
        let meminfo =
            std::fs::read_to_string("/proc/meminfo").context("Reading /proc/meminfo")?;
        parse_mem_available(&meminfo)
    }

    fn has_kvm_device(&self) -> bool {
        Utf8Path::new(KVM_DEVICE).exists()
    }

    fn cpu_flags(&self) -> Result<Vec<String>> {
        let cpuinfo =
            std::fs::read_to_string("/proc/cpuinfo").context("Reading /proc/cpuinfo")?;
        Ok(parse_cpu_flags(&cpuinfo))
    }
}

/// `MemAvailable` from `/proc/meminfo`, in bytes.
pub(crate) fn parse_mem_available(meminfo: &str) -> Result<u64> {
    let line = meminfo
        .lines()
        .find_map(|l| l.strip_prefix("MemAvailable:"))
        .ok_or_else(|| eyre!("MemAvailable not found in /proc/meminfo"))?;
    let mut parts = line.split_ascii_whitespace();
    let value: u64 = parts
        .next()
        .ok_or_else(|| eyre!("Empty MemAvailable line"))?
        .parse()
        .context("Parsing MemAvailable")?;
    match parts.next() {
        Some("kB") | None => Ok(value * 1024),
        Some(unit) => Err(eyre!("Unexpected MemAvailable unit: {unit}")),
    }
}

/// Union of the feature flags of every processor listed in `/proc/cpuinfo`.
pub(crate) fn parse_cpu_flags(cpuinfo: &str) -> Vec<String> {
    cpuinfo
        .lines()
        .filter_map(|l| l.split_once(':'))
        .filter(|(k, _)| matches!(k.trim(), "flags" | "Features"))
        .flat_map(|(_, v)| v.split_ascii_whitespace())
        .unique()
        .map(ToOwned::to_owned)
        .collect()
}

fn gib(bytes: u64) -> String {
    format!("{:.1} GiB", bytes as f64 / GIB as f64)
}

#[derive(Debug)]
pub struct PreflightValidator<P> {
    probe: P,
}

impl<P: HostProbe> PreflightValidator<P> {
    pub fn new(probe: P) -> Self {
        Self { probe }
    }

    #[instrument(skip_all)]
    pub fn validate(&self) -> PreflightReport {
        let mut report = PreflightReport::default();
        self.check_tools(&mut report);
        self.check_disk(&mut report);
        self.check_memory(&mut report);
        self.check_virtualization(&mut report);
        debug!(
            "preflight: {} checks, {} missing tools, {} blocking",
            report.checks.len(),
            report.missing_tools.len(),
            report.blocking_issues.len()
        );
        report
    }

    fn check_tools(&self, report: &mut PreflightReport) {
        for tool in REQUIRED_TOOLS {
            let check = match self.probe.locate_tool(tool) {
                Some(path) => CheckResult::new(*tool, CheckStatus::Ok, path.as_str()),
                None => {
                    report.missing_tools.push((*tool).to_owned());
                    CheckResult::new(*tool, CheckStatus::Missing, "not found in PATH")
                }
            };
            report.push(check, None);
        }
    }

    fn check_disk(&self, report: &mut PreflightReport) {
        let target = self.probe.disk_target();
        let (check, blocking) = match self.probe.free_disk_bytes() {
            Ok(free) if free >= MIN_FREE_DISK_BYTES => (
                CheckResult::new(
                    "disk-space",
                    CheckStatus::Ok,
                    format!("{} free in {target}", gib(free)),
                ),
                None,
            ),
            Ok(free) => (
                CheckResult::new(
                    "disk-space",
                    CheckStatus::Warn,
                    format!("{} free in {target}", gib(free)),
                ),
                Some(format!(
                    "Insufficient free disk space in {target}: {} available, at least {} required",
                    gib(free),
                    gib(MIN_FREE_DISK_BYTES)
                )),
            ),
            Err(e) => (
                CheckResult::new("disk-space", CheckStatus::Warn, format!("{e:#}")),
                Some(format!("Unable to determine free disk space in {target}: {e:#}")),
            ),
        };
        report.push(check, blocking);
    }

    fn check_memory(&self, report: &mut PreflightReport) {
        let (check, blocking) = match self.probe.available_memory_bytes() {
            Ok(avail) if avail >= MIN_AVAILABLE_MEMORY_BYTES => (
                CheckResult::new(
                    "memory",
                    CheckStatus::Ok,
                    format!("{} available", gib(avail)),
                ),
                None,
            ),
            Ok(avail) => (
                CheckResult::new(
                    "memory",
                    CheckStatus::Warn,
                    format!("{} available", gib(avail)),
                ),
                Some(format!(
                    "Insufficient available memory: {} available, at least {} required",
                    gib(avail),
                    gib(MIN_AVAILABLE_MEMORY_BYTES)
                )),
            ),
            Err(e) => (
                CheckResult::new("memory", CheckStatus::Warn, format!("{e:#}")),
                Some(format!("Unable to determine available memory: {e:#}")),
            ),
        };
        report.push(check, blocking);
    }

    fn check_virtualization(&self, report: &mut PreflightReport) {
        if self.probe.has_kvm_device() {
            report.push(
                CheckResult::new("kvm", CheckStatus::Ok, format!("{KVM_DEVICE} present")),
                None,
            );
            return;
        }
        let capable = match self.probe.cpu_flags() {
            Ok(flags) => flags.iter().any(|f| f == "vmx" || f == "svm"),
            Err(e) => {
                debug!("Unable to read CPU flags: {e:#}");
                false
            }
        };
        let (detail, issue) = if capable {
            (
                format!("{KVM_DEVICE} missing; CPU supports hardware virtualization"),
                format!(
                    "{KVM_DEVICE} not found although the CPU supports hardware virtualization; \
                     ensure KVM modules are loaded (modprobe kvm_intel or kvm_amd)"
                ),
            )
        } else {
            (
                format!("{KVM_DEVICE} missing; no vmx/svm CPU flag"),
                "CPU does not advertise hardware virtualization (vmx/svm); \
                 enable VT-x/AMD-V in the firmware or use a host that supports KVM"
                    .to_owned(),
            )
        };
        report.push(CheckResult::new("kvm", CheckStatus::Warn, detail), Some(issue));
    }
}

#[derive(Debug, clap::Parser)]
pub struct PreflightOpts {
    /// Directory whose filesystem will hold the image
    #[clap(long, env = "LABVM_WORKDIR", default_value = ".")]
    pub workdir: Utf8PathBuf,

    /// Print the report as JSON instead of status lines
    #[clap(long)]
    pub json: bool,
}

/// Validate the host and print the report; returns the exit code.
pub fn run(opts: PreflightOpts) -> Result<i32> {
    let report = PreflightValidator::new(SystemProbe::new(&opts.workdir)).validate();
    if opts.json {
        let mut stdout = std::io::stdout().lock();
        serde_json::to_writer_pretty(&mut stdout, &report)?;
        writeln!(stdout)?;
    } else {
        print!("{}", report.render());
    }
    Ok(report.exit_code())
}
