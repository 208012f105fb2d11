//! Best-effort reversal of a run's host changes

use cbuildrt_core::TeardownWarning;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::backend::MountBackend;
use crate::handle::{HandleEntry, MountHandle};
use crate::root::ContainerRoot;

/// What a teardown pass did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    /// Entries in the order they were reversed
    pub reversed: Vec<HandleEntry>,
    /// Entries that could not be reversed, and root removal problems
    pub warnings: Vec<TeardownWarning>,
    /// Number of mounts that are possibly still attached
    pub failed_unmounts: usize,
}

impl TeardownReport {
    /// Whether every entry was reversed cleanly
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    /// Number of entries reversed without a warning
    #[must_use]
    pub fn released(&self) -> usize {
        self.reversed.len() - self.warnings.len().min(self.reversed.len())
    }
}

/// Reverses a [`MountHandle`] and releases the [`ContainerRoot`]
#[derive(Debug)]
pub struct Teardown<'b, B: MountBackend> {
    backend: &'b B,
}

impl<'b, B: MountBackend> Teardown<'b, B> {
    /// Create a teardown over `backend`
    pub const fn new(backend: &'b B) -> Self {
        Self { backend }
    }

    /// Reverse every entry of `handle`, newest first
    ///
    /// Never stops early: each failure becomes a warning and the remaining
    /// entries are still attempted.
    pub fn unwind(&self, mut handle: MountHandle) -> TeardownReport {
        let mut report = TeardownReport::default();

        for entry in handle.take_entries().into_iter().rev() {
            let outcome = match &entry {
                HandleEntry::Mounted { target } => {
                    self.backend.unmount(target).map_err(io::Error::from)
                }
                HandleEntry::ReadOnly { target } => {
                    self.backend.remount(target, false).map_err(io::Error::from)
                }
                HandleEntry::Created { path } => remove_mount_point(path),
            };

            match outcome {
                Ok(()) => debug!(%entry, "Reversed"),
                Err(e) => {
                    warn!(%entry, error = %e, "Could not reverse");
                    if entry.is_mount() {
                        report.failed_unmounts += 1;
                    }
                    report
                        .warnings
                        .push(TeardownWarning::new(entry.path(), format!("{entry}: {e}")));
                }
            }
            report.reversed.push(entry);
        }

        report
    }

    /// Release the root lock, removing the directory if this run created it
    ///
    /// The directory is left in place when any mount might still be
    /// attached below it: deleting recursively through a live bind would
    /// delete host files.
    pub fn release_root(&self, root: ContainerRoot, mounts_detached: bool) -> Vec<TeardownWarning> {
        let mut warnings = Vec::new();

        if root.is_ephemeral() {
            let path = root.path().to_path_buf();
            if mounts_detached {
                if let Err(e) = fs::remove_dir_all(&path) {
                    warn!(root = %path.display(), error = %e, "Could not remove container root");
                    warnings.push(TeardownWarning::new(&path, format!("remove root: {e}")));
                }
            } else {
                warn!(root = %path.display(), "Leaving container root in place, mounts remain");
                warnings.push(TeardownWarning::new(
                    &path,
                    "container root left in place because some mounts could not be detached",
                ));
            }
        }

        drop(root);
        warnings
    }

    /// Unwind `handle`, then release `root`
    pub fn finish(&self, handle: MountHandle, root: ContainerRoot) -> TeardownReport {
        let mut report = self.unwind(handle);
        let detached = report.failed_unmounts == 0;
        report.warnings.extend(self.release_root(root, detached));

        info!(
            reversed = report.reversed.len(),
            warnings = report.warnings.len(),
            "Teardown finished"
        );
        report
    }
}

fn remove_mount_point(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    }
}
