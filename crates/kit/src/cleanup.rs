//! Teardown of resources acquired by a provisioning run
//!
//! Two modes share one walk over the [`ResourceTracker`], newest handle first:
//!
//! - [`TeardownMode::Partial`] runs right after a failed step. Each mount gets
//!   one graceful unmount; anything that refuses stays in the tracker for the
//!   final pass. Failures are collected, never raised, so the step failure
//!   remains the reported cause.
//! - [`TeardownMode::Final`] runs after every pipeline run and from
//!   `labvm cleanup`. It terminates processes working inside the image,
//!   releases stale layout mounts the tracker does not know about, and
//!   escalates busy unmounts to a lazy detach. Running it again on the
//!   resulting state is a no-op.
//!
//! In both modes the mount directory and a scratch image file are only
//! removed once nothing remains mounted beneath them, and the image file is
//! only ever deleted through its tracked handle.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tracing::{debug, info, instrument, warn};

use crate::layout::{ImageLayout, ImageOpts};
use crate::mounts::{MountTable, SystemMountTable};
use crate::resources::{Disposition, ResourceHandle, ResourceKind, ResourceTracker};
use crate::runner::{CommandLine, CommandOutput, CommandRunner, SystemRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum TeardownMode {
    Partial,
    Final,
}

/// What one teardown pass did.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Resources released, in release order.
    pub released: Vec<ResourceHandle>,
    /// Artifacts dropped from tracking but left in place.
    pub retained: Vec<ResourceHandle>,
    /// Untracked mounts found under the layout and detached.
    pub stale_mounts: Vec<Utf8PathBuf>,
    /// Processes sent SIGTERM because they worked inside the image.
    pub terminated: Vec<u32>,
    pub failures: Vec<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Whether the pass found nothing at all to do.
    pub fn is_empty(&self) -> bool {
        self.released.is_empty()
            && self.retained.is_empty()
            && self.stale_mounts.is_empty()
            && self.terminated.is_empty()
            && self.failures.is_empty()
    }

    /// Fold in a later pass, dropping earlier failures for resources that
    /// pass released or retained.
    pub fn supersede(&mut self, later: TeardownReport) {
        let resolved: Vec<String> = later
            .released
            .iter()
            .chain(&later.retained)
            .map(|h| format!("{h}: "))
            .collect();
        self.failures
            .retain(|f| !resolved.iter().any(|prefix| f.starts_with(prefix)));
        self.merge(later);
    }

    fn merge(&mut self, other: TeardownReport) {
        self.released.extend(other.released);
        self.retained.extend(other.retained);
        self.stale_mounts.extend(other.stale_mounts);
        self.terminated.extend(other.terminated);
        self.failures.extend(other.failures);
    }
}

impl std::fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for pid in &self.terminated {
            writeln!(f, "Terminated process {pid}")?;
        }
        for target in &self.stale_mounts {
            writeln!(f, "Unmounted stale {target}")?;
        }
        for h in &self.released {
            writeln!(f, "Released {h}")?;
        }
        for h in &self.retained {
            writeln!(f, "Kept {h}")?;
        }
        for failure in &self.failures {
            writeln!(f, "Failed to release {failure}")?;
        }
        Ok(())
    }
}

enum Outcome {
    Released,
    Retained,
}

pub struct CleanupManager<'a> {
    runner: &'a dyn CommandRunner,
    mounts: &'a dyn MountTable,
    layout: Option<&'a ImageLayout>,
    proc_root: Utf8PathBuf,
}

impl std::fmt::Debug for CleanupManager<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupManager")
            .field("layout", &self.layout)
            .field("proc_root", &self.proc_root)
            .finish()
    }
}

impl<'a> CleanupManager<'a> {
    pub fn new(runner: &'a dyn CommandRunner, mounts: &'a dyn MountTable) -> Self {
        Self {
            runner,
            mounts,
            layout: None,
            proc_root: Utf8PathBuf::from("/proc"),
        }
    }

    /// Also sweep the well-known mount points of `layout` in final mode.
    pub fn with_layout(mut self, layout: &'a ImageLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    /// Where to scan for process working directories.
    #[cfg(test)]
    pub fn with_proc_root(mut self, proc_root: impl Into<Utf8PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self
    }

    #[instrument(skip_all, fields(mode = %mode))]
    pub fn teardown(&self, tracker: &mut ResourceTracker, mode: TeardownMode) -> TeardownReport {
        let mut report = TeardownReport::default();

        if mode == TeardownMode::Final {
            if let Some(root) = self.image_root(tracker) {
                report.terminated = self.terminate_processes_under(&root);
            }
            self.release_stale_mounts(tracker, &mut report);
        }

        // Mounts that refused to go; anything enclosing them must stay.
        let mut held: Vec<Utf8PathBuf> = Vec::new();
        for handle in tracker.release_order() {
            if handle.kind.is_mount() {
                if let Some(inner) = held.iter().find(|p| p.starts_with(&handle.path)) {
                    report
                        .failures
                        .push(format!("{handle}: {inner} is still mounted"));
                    held.push(handle.path.clone());
                    continue;
                }
            }
            match self.release(&handle, tracker, mode) {
                Ok(Outcome::Released) => {
                    info!("Released {handle}");
                    tracker.release(&handle);
                    report.released.push(handle);
                }
                Ok(Outcome::Retained) => {
                    info!("Keeping {handle}");
                    tracker.release(&handle);
                    report.retained.push(handle);
                }
                Err(e) => {
                    warn!("Failed to release {handle}: {e:#}");
                    report.failures.push(format!("{handle}: {e:#}"));
                    if handle.kind.is_mount() {
                        held.push(handle.path.clone());
                    }
                }
            }
        }
        report
    }

    /// The loop-mounted image root, when anything is mounted beneath it.
    fn image_root(&self, tracker: &ResourceTracker) -> Option<Utf8PathBuf> {
        let root = tracker
            .find(ResourceKind::LoopMount)
            .map(|h| h.path.clone())
            .or_else(|| self.layout.map(|l| l.mount_dir.clone()))?;
        match self.mounts.mounted_under(&root) {
            Ok(m) if !m.is_empty() => Some(root),
            Ok(_) => None,
            Err(e) => {
                warn!("Unable to read mount table: {e:#}");
                None
            }
        }
    }

    fn release_stale_mounts(&self, tracker: &ResourceTracker, report: &mut TeardownReport) {
        let Some(layout) = self.layout else {
            return;
        };
        for target in layout.mount_points() {
            let tracked = tracker
                .handles()
                .iter()
                .any(|h| h.kind.is_mount() && h.path == target);
            if tracked {
                continue;
            }
            match self.mounts.is_mounted(&target) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    report.failures.push(format!("{target}: {e:#}"));
                    continue;
                }
            }
            info!("Releasing stale mount {target}");
            match self.unmount(&target, TeardownMode::Final) {
                Ok(()) => report.stale_mounts.push(target),
                Err(e) => report.failures.push(format!("{target}: {e:#}")),
            }
        }
    }

    fn release(
        &self,
        handle: &ResourceHandle,
        tracker: &ResourceTracker,
        mode: TeardownMode,
    ) -> Result<Outcome> {
        match handle.kind {
            ResourceKind::LoopMount | ResourceKind::BindMount | ResourceKind::ChrootContext => {
                if !self.mounts.is_mounted(&handle.path)? {
                    debug!("{} is no longer mounted", handle.path);
                    return Ok(Outcome::Released);
                }
                self.unmount(&handle.path, mode)?;
                Ok(Outcome::Released)
            }
            ResourceKind::MountDir => {
                self.ensure_nothing_mounted_under(&handle.path, tracker)?;
                match std::fs::remove_dir(&handle.path) {
                    Ok(()) => Ok(Outcome::Released),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Outcome::Released),
                    Err(e) => {
                        Err(e).with_context(|| format!("Removing mount point {}", handle.path))
                    }
                }
            }
            ResourceKind::DiskFile => {
                if handle.disposition == Disposition::Artifact {
                    return Ok(Outcome::Retained);
                }
                if tracker.holds_mounts() {
                    return Err(eyre!("image may still be mounted"));
                }
                match std::fs::remove_file(&handle.path) {
                    Ok(()) => Ok(Outcome::Released),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Outcome::Released),
                    Err(e) => Err(e).with_context(|| format!("Removing {}", handle.path)),
                }
            }
        }
    }

    fn ensure_nothing_mounted_under(&self, dir: &Utf8Path, tracker: &ResourceTracker) -> Result<()> {
        if let Some(h) = tracker.handles().iter().find(|h| h.kind.is_mount()) {
            return Err(eyre!("{h} is still held"));
        }
        let remaining = self.mounts.mounted_under(dir)?;
        if let Some(m) = remaining.first() {
            return Err(eyre!("{m} is still mounted"));
        }
        Ok(())
    }

    /// Graceful unmount; in final mode a busy target is detached lazily.
    fn unmount(&self, target: &Utf8Path, mode: TeardownMode) -> Result<()> {
        // Busy detection reads the message, which must not be translated.
        let graceful = CommandLine::new(["umount", target.as_str()]).env("LC_ALL", "C");
        let output = self.runner.execute(&graceful)?;
        let busy = is_busy(&output);
        let Err(e) = output.check(&graceful) else {
            return Ok(());
        };
        if mode == TeardownMode::Final && busy {
            warn!("{target} is busy; detaching lazily");
            let lazy = CommandLine::new(["umount", "-l", target.as_str()]).env("LC_ALL", "C");
            self.runner.run(&lazy)?;
            return Ok(());
        }
        Err(e.into())
    }

    /// SIGTERM every process whose working directory is inside `root`.
    fn terminate_processes_under(&self, root: &Utf8Path) -> Vec<u32> {
        let pids = match processes_with_cwd_under(&self.proc_root, root) {
            Ok(p) => p,
            Err(e) => {
                warn!("Unable to scan {}: {e:#}", self.proc_root);
                return Vec::new();
            }
        };
        pids.into_iter()
            .filter(|pid| {
                let kill = CommandLine::new(["kill", "-TERM", &pid.to_string()]);
                match self.runner.run(&kill) {
                    Ok(_) => {
                        info!("Terminated process {pid} working in {root}");
                        true
                    }
                    Err(e) => {
                        warn!("Failed to terminate process {pid}: {e}");
                        false
                    }
                }
            })
            .collect()
    }
}

fn is_busy(output: &CommandOutput) -> bool {
    output.stderr.to_ascii_lowercase().contains("busy")
}

/// Process IDs under `proc_root` whose `cwd` link points inside `root`.
fn processes_with_cwd_under(proc_root: &Utf8Path, root: &Utf8Path) -> Result<Vec<u32>> {
    let me = std::process::id();
    let mut pids = Vec::new();
    for entry in proc_root.read_dir_utf8()? {
        let entry = entry?;
        let Ok(pid) = entry.file_name().parse::<u32>() else {
            continue;
        };
        if pid == me {
            continue;
        }
        // Processes exit or deny access while we scan.
        let Ok(cwd) = std::fs::read_link(entry.path().join("cwd")) else {
            continue;
        };
        if cwd.starts_with(root) {
            pids.push(pid);
        }
    }
    pids.sort_unstable();
    Ok(pids)
}

#[derive(Debug, clap::Parser)]
pub struct CleanupOpts {
    #[clap(flatten)]
    pub image: ImageOpts,
}

/// Release whatever an earlier build left behind; returns the exit code.
pub fn run(opts: CleanupOpts) -> Result<i32> {
    let layout = opts.image.layout()?;
    let mut tracker = ResourceTracker::with_journal(layout.journal())?;
    let runner = SystemRunner;
    let mounts = SystemMountTable;
    let report = CleanupManager::new(&runner, &mounts)
        .with_layout(&layout)
        .teardown(&mut tracker, TeardownMode::Final);
    if report.is_empty() {
        println!("Nothing to clean up");
    } else {
        print!("{report}");
    }
    Ok(if report.is_clean() { 0 } else { 1 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{utf8_tempdir, FakeHost};

    struct Fixture {
        _td: tempfile::TempDir,
        layout: ImageLayout,
        host: FakeHost,
        tracker: ResourceTracker,
    }

    /// A run that got as far as the bind mount.
    fn acquired_through_bind_mount() -> Fixture {
        let (td, dir) = utf8_tempdir();
        let layout = ImageLayout::new(&dir, "disk.img");
        std::fs::write(&layout.image, b"").unwrap();
        std::fs::create_dir_all(layout.dev_dir()).unwrap();
        let host = FakeHost::new();
        host.premount(&layout.mount_dir);
        host.premount(layout.dev_dir());

        let mut tracker = ResourceTracker::new();
        tracker.acquire(ResourceHandle::new(ResourceKind::DiskFile, &layout.image, 1));
        tracker.acquire(ResourceHandle::new(ResourceKind::MountDir, &layout.mount_dir, 3));
        tracker.acquire(ResourceHandle::new(ResourceKind::LoopMount, &layout.mount_dir, 3));
        tracker.acquire(ResourceHandle::new(ResourceKind::BindMount, layout.dev_dir(), 6));
        Fixture {
            _td: td,
            layout,
            host,
            tracker,
        }
    }

    fn no_processes() -> Utf8PathBuf {
        Utf8PathBuf::from("/nonexistent/proc")
    }

    #[test]
    fn test_partial_releases_in_reverse_order() {
        let mut f = acquired_through_bind_mount();
        let cleanup = CleanupManager::new(&f.host, &f.host);
        let report = cleanup.teardown(&mut f.tracker, TeardownMode::Partial);

        assert!(report.is_clean(), "{:?}", report.failures);
        let kinds: Vec<_> = report.released.iter().map(|h| h.kind).collect();
        similar_asserts::assert_eq!(
            kinds,
            vec![
                ResourceKind::BindMount,
                ResourceKind::LoopMount,
                ResourceKind::MountDir,
                ResourceKind::DiskFile,
            ]
        );
        similar_asserts::assert_eq!(
            f.host.commands(),
            vec![
                format!("umount {}", f.layout.dev_dir()),
                format!("umount {}", f.layout.mount_dir),
            ]
        );
        assert!(f.tracker.is_empty());
        assert!(!f.layout.mount_dir.exists());
        assert!(!f.layout.image.exists());
    }

    #[test]
    fn test_artifact_image_is_kept() {
        let mut f = acquired_through_bind_mount();
        f.tracker.promote(ResourceKind::DiskFile);
        let cleanup = CleanupManager::new(&f.host, &f.host);
        let report = cleanup.teardown(&mut f.tracker, TeardownMode::Partial);

        assert!(report.is_clean());
        assert_eq!(report.retained.len(), 1);
        assert!(f.layout.image.exists());
        assert!(!f.layout.mount_dir.exists());
        assert!(f.tracker.is_empty());
    }

    #[test]
    fn test_partial_does_not_escalate_busy_mount() {
        let mut f = acquired_through_bind_mount();
        f.host.set_busy(f.layout.dev_dir(), 1);
        let cleanup = CleanupManager::new(&f.host, &f.host);
        let report = cleanup.teardown(&mut f.tracker, TeardownMode::Partial);

        assert!(!report.is_clean());
        assert!(!f.host.commands().iter().any(|c| c.contains("-l")));
        // The enclosing loop mount is not even attempted.
        assert_eq!(f.host.commands(), vec![format!("umount {}", f.layout.dev_dir())]);
        assert_eq!(report.released.len(), 0);
        assert_eq!(report.failures.len(), 4);
        assert_eq!(f.tracker.len(), 4);
        assert!(f.layout.image.exists());
        assert!(f.layout.mount_dir.exists());
    }

    #[test]
    fn test_final_escalates_busy_mount() {
        let mut f = acquired_through_bind_mount();
        f.host.set_busy(f.layout.dev_dir(), 1);
        let cleanup = CleanupManager::new(&f.host, &f.host)
            .with_layout(&f.layout)
            .with_proc_root(no_processes());
        let report = cleanup.teardown(&mut f.tracker, TeardownMode::Final);

        assert!(report.is_clean(), "{:?}", report.failures);
        let dev = f.layout.dev_dir();
        similar_asserts::assert_eq!(
            f.host.commands(),
            vec![
                format!("umount {dev}"),
                format!("umount -l {dev}"),
                format!("umount {}", f.layout.mount_dir),
            ]
        );
        assert!(f.host.mounted().is_empty());
        assert!(f.tracker.is_empty());
    }

    #[test]
    fn test_final_reports_failed_escalation() {
        let mut f = acquired_through_bind_mount();
        f.host.set_stuck(f.layout.dev_dir());
        let cleanup = CleanupManager::new(&f.host, &f.host).with_proc_root(no_processes());
        let report = cleanup.teardown(&mut f.tracker, TeardownMode::Final);

        assert!(!report.is_clean());
        assert!(f.tracker.find(ResourceKind::BindMount).is_some());
        assert!(f.layout.mount_dir.exists(), "mount point kept while a mount remains");
        assert!(f.layout.image.exists());
    }

    #[test]
    fn test_final_is_idempotent() {
        let mut f = acquired_through_bind_mount();
        let cleanup = CleanupManager::new(&f.host, &f.host)
            .with_layout(&f.layout)
            .with_proc_root(no_processes());
        let first = cleanup.teardown(&mut f.tracker, TeardownMode::Final);
        assert!(first.is_clean());
        let commands = f.host.commands().len();

        let second = cleanup.teardown(&mut f.tracker, TeardownMode::Final);
        assert!(second.is_clean());
        assert!(second.released.is_empty());
        assert_eq!(f.host.commands().len(), commands);
        assert!(f.host.mounted().is_empty());
        assert!(!f.layout.mount_dir.exists());
    }

    #[test]
    fn test_final_on_already_released_mounts() {
        let mut f = acquired_through_bind_mount();
        // Someone else unmounted everything already.
        f.host.run(&CommandLine::new(["umount", f.layout.dev_dir().as_str()])).unwrap();
        f.host.run(&CommandLine::new(["umount", f.layout.mount_dir.as_str()])).unwrap();
        let cleanup = CleanupManager::new(&f.host, &f.host).with_proc_root(no_processes());
        let report = cleanup.teardown(&mut f.tracker, TeardownMode::Final);
        assert!(report.is_clean());
        assert!(f.tracker.is_empty());
    }

    #[test]
    fn test_final_sweeps_stale_layout_mounts() {
        let (_td, dir) = utf8_tempdir();
        let layout = ImageLayout::new(&dir, "disk.img");
        std::fs::create_dir_all(layout.proc_dir()).unwrap();
        let host = FakeHost::new();
        host.premount(&layout.mount_dir);
        host.premount(layout.proc_dir());
        let mut tracker = ResourceTracker::new();

        let cleanup = CleanupManager::new(&host, &host)
            .with_layout(&layout)
            .with_proc_root(no_processes());
        let report = cleanup.teardown(&mut tracker, TeardownMode::Final);
        assert!(report.is_clean());
        assert_eq!(report.stale_mounts, vec![layout.proc_dir(), layout.mount_dir.clone()]);
        assert!(host.mounted().is_empty());
        // Untracked directories are left alone.
        assert!(layout.mount_dir.exists());
    }

    #[test]
    fn test_final_terminates_processes_inside_image() {
        let mut f = acquired_through_bind_mount();
        let (_proc_td, proc_root) = utf8_tempdir();
        let inside = f.layout.guest_path("/root");
        std::fs::create_dir_all(&inside).unwrap();
        for (pid, cwd) in [("4242", inside.as_str()), ("77", "/tmp")] {
            let dir = proc_root.join(pid);
            std::fs::create_dir(&dir).unwrap();
            std::os::unix::fs::symlink(cwd, dir.join("cwd")).unwrap();
        }
        std::fs::create_dir(proc_root.join("self")).unwrap();

        let cleanup = CleanupManager::new(&f.host, &f.host).with_proc_root(&proc_root);
        let report = cleanup.teardown(&mut f.tracker, TeardownMode::Final);
        assert!(report.is_clean());
        assert_eq!(report.terminated, vec![4242]);
        assert_eq!(f.host.commands()[0], "kill -TERM 4242");
        assert_eq!(f.host.programs()[1], "umount");
    }

    #[test]
    fn test_disk_file_without_mounts() {
        let (_td, dir) = utf8_tempdir();
        let layout = ImageLayout::new(&dir, "disk.img");
        std::fs::write(&layout.image, b"").unwrap();
        let host = FakeHost::new();
        let mut tracker = ResourceTracker::new();
        tracker.acquire(ResourceHandle::new(ResourceKind::DiskFile, &layout.image, 1));

        let report = CleanupManager::new(&host, &host).teardown(&mut tracker, TeardownMode::Partial);
        assert!(report.is_clean());
        assert!(!layout.image.exists());
        assert!(host.commands().is_empty());
    }

    #[test]
    fn test_report_summary() {
        let mut f = acquired_through_bind_mount();
        f.tracker.promote(ResourceKind::DiskFile);
        f.host.set_stuck(f.layout.dev_dir());
        let report = CleanupManager::new(&f.host, &f.host)
            .with_proc_root(no_processes())
            .teardown(&mut f.tracker, TeardownMode::Final);
        assert!(!report.is_empty());

        let summary = report.to_string();
        let dev = f.layout.dev_dir();
        assert!(summary.starts_with(&format!("Kept disk-file {}\n", f.layout.image)));
        assert!(summary.contains(&format!("Failed to release bind-mount {dev}: ")));
        assert!(summary.contains(&format!("loop-mount {}: {dev} is still mounted", f.layout.mount_dir)));
        assert!(TeardownReport::default().is_empty());
    }

    #[test]
    fn test_unmount_runs_in_c_locale() {
        let mut f = acquired_through_bind_mount();
        f.host.set_busy(f.layout.dev_dir(), 1);
        let report = CleanupManager::new(&f.host, &f.host)
            .with_proc_root(no_processes())
            .teardown(&mut f.tracker, TeardownMode::Final);
        assert!(report.is_clean(), "{:?}", report.failures);

        let umounts: Vec<_> = f
            .host
            .recorded()
            .into_iter()
            .filter(|c| c.program() == Some("umount"))
            .collect();
        assert_eq!(umounts.len(), 3, "graceful, lazy, graceful");
        for cmd in umounts {
            assert!(
                cmd.env.contains(&("LC_ALL".to_owned(), "C".to_owned())),
                "{cmd}"
            );
        }
    }

    #[test]
    fn test_default_workdir_matches_kernel_mount_table() -> Result<()> {
        #[derive(Debug, clap::Parser)]
        struct Cli {
            #[clap(flatten)]
            image: ImageOpts,
        }
        use clap::Parser;

        let layout = Cli::try_parse_from(["labvm"])?.image.layout()?;
        let cwd = Utf8PathBuf::from_path_buf(std::env::current_dir()?).unwrap();
        // The kernel reports absolute targets regardless of how they were mounted.
        let host = FakeHost::new();
        host.premount(cwd.join("mnt"));
        host.premount(cwd.join("mnt/dev"));

        let mut tracker = ResourceTracker::new();
        tracker.acquire(ResourceHandle::new(ResourceKind::LoopMount, &layout.mount_dir, 4));
        tracker.acquire(ResourceHandle::new(ResourceKind::BindMount, layout.dev_dir(), 7));
        let report = CleanupManager::new(&host, &host)
            .with_layout(&layout)
            .with_proc_root(no_processes())
            .teardown(&mut tracker, TeardownMode::Final);

        assert!(report.is_clean(), "{:?}", report.failures);
        assert!(tracker.is_empty());
        assert!(host.mounted().is_empty(), "{:?}", host.mounted());
        similar_asserts::assert_eq!(
            host.commands(),
            vec![
                format!("umount {}", cwd.join("mnt/dev")),
                format!("umount {}", cwd.join("mnt")),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_final_pass_supersedes_partial_failures() {
        let mut f = acquired_through_bind_mount();
        f.host.set_busy(f.layout.dev_dir(), 1);
        let cleanup = CleanupManager::new(&f.host, &f.host).with_proc_root(no_processes());

        let mut report = cleanup.teardown(&mut f.tracker, TeardownMode::Partial);
        assert!(!report.is_clean());
        report.supersede(cleanup.teardown(&mut f.tracker, TeardownMode::Final));

        assert!(report.is_clean(), "{:?}", report.failures);
        assert!(f.tracker.is_empty());
        assert!(report.to_string().contains(&format!("Released bind-mount {}", f.layout.dev_dir())));
    }
}
