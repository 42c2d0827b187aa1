//! Acquisition-ordered record of host resources held by a provisioning run
//!
//! A [`ResourceHandle`] exists exactly while its underlying resource is held:
//! it is pushed the moment the acquisition succeeds and removed the moment
//! the release succeeds. Teardown walks the handles newest-first, which is
//! what nested mounts require.
//!
//! When constructed with a journal path the tracker rewrites a JSON copy of
//! itself after every change, so `labvm cleanup` can resume teardown after a
//! crash.

use std::io::Write as _;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::Context;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// The kinds of host resource the pipeline acquires.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ResourceKind {
    /// The sparse image file.
    DiskFile,
    /// The directory the image is mounted on.
    MountDir,
    /// The image loop-mounted on its mount directory.
    LoopMount,
    /// The host device directory bind-mounted into the image.
    BindMount,
    /// `proc` mounted inside the image for chroot execution.
    ChrootContext,
}

impl ResourceKind {
    /// Whether releasing this resource means unmounting it.
    pub fn is_mount(self) -> bool {
        matches!(
            self,
            ResourceKind::LoopMount | ResourceKind::BindMount | ResourceKind::ChrootContext
        )
    }
}

/// What teardown does with a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Disposition {
    /// Released by teardown.
    #[default]
    Scratch,
    /// The build product; teardown stops tracking it but leaves it in place.
    Artifact,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceHandle {
    pub kind: ResourceKind,
    pub path: Utf8PathBuf,
    /// Index of the pipeline step that acquired it.
    pub acquired_at: usize,
    #[serde(default)]
    pub disposition: Disposition,
}

impl ResourceHandle {
    pub fn new(kind: ResourceKind, path: impl Into<Utf8PathBuf>, acquired_at: usize) -> Self {
        Self {
            kind,
            path: path.into(),
            acquired_at,
            disposition: Disposition::Scratch,
        }
    }
}

impl std::fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.path)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Journal {
    resources: Vec<ResourceHandle>,
}

#[derive(Debug, Default)]
pub struct ResourceTracker {
    handles: Vec<ResourceHandle>,
    journal: Option<Utf8PathBuf>,
}

impl ResourceTracker {
    /// An in-memory tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the tracker persisted at `path`, or start empty when it does not
    /// exist. Subsequent changes are written back to the same path.
    pub fn with_journal(path: impl Into<Utf8PathBuf>) -> Result<Self> {
        let path = path.into();
        let handles = match std::fs::read(&path) {
            Ok(buf) => {
                let journal: Journal = serde_json::from_slice(&buf)
                    .with_context(|| format!("Parsing resource journal {path}"))?;
                journal.resources
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e).with_context(|| format!("Reading resource journal {path}")),
        };
        Ok(Self {
            handles,
            journal: Some(path),
        })
    }

    /// Record a successfully acquired resource.
    pub fn acquire(&mut self, handle: ResourceHandle) {
        debug!("acquired {handle}");
        self.handles.push(handle);
        self.persist();
    }

    /// Forget a resource whose release has succeeded.
    pub fn release(&mut self, handle: &ResourceHandle) -> bool {
        let Some(pos) = self.handles.iter().rposition(|h| h == handle) else {
            return false;
        };
        let removed = self.handles.remove(pos);
        debug!("released {removed}");
        self.persist();
        true
    }

    /// Mark the newest resource of `kind` as a kept artifact.
    pub fn promote(&mut self, kind: ResourceKind) -> bool {
        let Some(h) = self.handles.iter_mut().rev().find(|h| h.kind == kind) else {
            return false;
        };
        h.disposition = Disposition::Artifact;
        self.persist();
        true
    }

    /// Handles in acquisition order.
    pub fn handles(&self) -> &[ResourceHandle] {
        &self.handles
    }

    /// Handles in release order (newest first).
    pub fn release_order(&self) -> Vec<ResourceHandle> {
        self.handles.iter().rev().cloned().collect()
    }

    pub fn find(&self, kind: ResourceKind) -> Option<&ResourceHandle> {
        self.handles.iter().rev().find(|h| h.kind == kind)
    }

    pub fn holds_mounts(&self) -> bool {
        self.handles.iter().any(|h| h.kind.is_mount())
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    fn persist(&self) {
        let Some(path) = self.journal.as_deref() else {
            return;
        };
        // Best-effort: the in-memory record is authoritative for this process.
        if let Err(e) = self.write_journal(path) {
            warn!("Failed to update resource journal {path}: {e:#}");
        }
    }

    fn write_journal(&self, path: &Utf8Path) -> Result<()> {
        if self.handles.is_empty() {
            return match std::fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            };
        }
        let dir = match path.parent() {
            Some(p) if !p.as_str().is_empty() => p,
            _ => Utf8Path::new("."),
        };
        let journal = Journal {
            resources: self.handles.clone(),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, &journal)?;
        tmp.write_all(b"\n")?;
        tmp.persist(path)?;
        Ok(())
    }
}
