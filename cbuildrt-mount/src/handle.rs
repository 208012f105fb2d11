//! Record of everything a run changed on the host

use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

/// One reversible change made while applying a plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleEntry {
    /// A filesystem was mounted at `target`
    Mounted {
        /// Host path of the mount
        target: PathBuf,
    },
    /// The mount at `target` was made read-only
    ReadOnly {
        /// Host path of the mount
        target: PathBuf,
    },
    /// A mount point was created on the root filesystem
    Created {
        /// Host path of the new file or directory
        path: PathBuf,
    },
}

impl HandleEntry {
    /// Host path the entry refers to
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Mounted { target } | Self::ReadOnly { target } => target,
            Self::Created { path } => path,
        }
    }

    /// Whether the entry is a live mount
    #[must_use]
    pub const fn is_mount(&self) -> bool {
        matches!(self, Self::Mounted { .. })
    }
}

impl fmt::Display for HandleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mounted { target } => write!(f, "mount {}", target.display()),
            Self::ReadOnly { target } => write!(f, "read-only {}", target.display()),
            Self::Created { path } => write!(f, "mount point {}", path.display()),
        }
    }
}

/// Ordered record of the changes made for one run
///
/// Entries are kept in the order they happened; teardown reverses them.
/// A handle must be passed to [`Teardown`](crate::Teardown); dropping a
/// non-empty handle leaves mounts behind and logs a warning.
#[derive(Debug, Default)]
pub struct MountHandle {
    entries: Vec<HandleEntry>,
}

impl MountHandle {
    /// Create an empty handle
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, entry: HandleEntry) {
        self.entries.push(entry);
    }

    /// Entries in the order they were made
    #[must_use]
    pub fn entries(&self) -> &[HandleEntry] {
        &self.entries
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was changed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Host paths of live mounts, in mount order
    pub fn mounts(&self) -> impl Iterator<Item = &Path> {
        self.entries
            .iter()
            .filter(|e| e.is_mount())
            .map(HandleEntry::path)
    }

    /// Take the entries out, leaving the handle empty
    pub(crate) fn take_entries(&mut self) -> Vec<HandleEntry> {
        std::mem::take(&mut self.entries)
    }
}

impl Drop for MountHandle {
    /// Fallback warning (if the handle never reached teardown)
    fn drop(&mut self) {
        if self.entries.is_empty() {
            return;
        }

        warn!(
            entries = self.entries.len(),
            "Mount handle dropped without teardown, host mounts may remain"
        );
    }
}
