//! Declarative mount requests

use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Kind of filesystem placed at a mount target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountKind {
    /// Bind of a host file or directory
    Bind,
    /// Fresh, empty tmpfs
    Tmpfs,
    /// Process filesystem for the run's PID namespace
    Proc,
    /// Minimal device tree (tmpfs populated with host device nodes)
    Devtmpfs,
}

impl MountKind {
    /// Whether the mount has to be performed from inside the PID namespace
    #[must_use]
    pub const fn is_pid_scoped(self) -> bool {
        matches!(self, Self::Proc)
    }

    /// Whether the kind takes a host path
    #[must_use]
    pub const fn needs_host_path(self) -> bool {
        matches!(self, Self::Bind)
    }
}

impl fmt::Display for MountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bind => "bind",
            Self::Tmpfs => "tmpfs",
            Self::Proc => "proc",
            Self::Devtmpfs => "devtmpfs",
        };
        f.write_str(name)
    }
}

/// Access mode seen from inside the container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountMode {
    /// Writes fail with `EROFS`
    ReadOnly,
    /// Writes go through to the mounted filesystem
    #[default]
    ReadWrite,
}

/// One mount in the container's filesystem view
///
/// Specs are immutable once constructed; the plan builder produces
/// normalized copies (canonical host path, lexically clean container path).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MountSpec {
    host_path: Option<PathBuf>,
    container_path: PathBuf,
    mode: MountMode,
    kind: MountKind,
}

impl MountSpec {
    /// Bind `host_path` to `container_path` (read-write until [`read_only`](Self::read_only))
    pub fn bind(host_path: impl Into<PathBuf>, container_path: impl Into<PathBuf>) -> Self {
        Self {
            host_path: Some(host_path.into()),
            container_path: container_path.into(),
            mode: MountMode::ReadWrite,
            kind: MountKind::Bind,
        }
    }

    /// Empty tmpfs at `container_path`
    pub fn tmpfs(container_path: impl Into<PathBuf>) -> Self {
        Self::filesystem(MountKind::Tmpfs, container_path)
    }

    /// Procfs at `container_path`
    pub fn proc(container_path: impl Into<PathBuf>) -> Self {
        Self::filesystem(MountKind::Proc, container_path)
    }

    /// Device tree at `container_path`
    pub fn devtmpfs(container_path: impl Into<PathBuf>) -> Self {
        Self::filesystem(MountKind::Devtmpfs, container_path)
    }

    fn filesystem(kind: MountKind, container_path: impl Into<PathBuf>) -> Self {
        Self {
            host_path: None,
            container_path: container_path.into(),
            mode: MountMode::ReadWrite,
            kind,
        }
    }

    /// Make the mount read-only
    #[must_use]
    pub const fn read_only(mut self) -> Self {
        self.mode = MountMode::ReadOnly;
        self
    }

    /// Set the access mode
    #[must_use]
    pub const fn with_mode(mut self, mode: MountMode) -> Self {
        self.mode = mode;
        self
    }

    /// Host source (only for [`MountKind::Bind`])
    #[must_use]
    pub fn host_path(&self) -> Option<&Path> {
        self.host_path.as_deref()
    }

    /// Absolute target path inside the container
    #[must_use]
    pub fn container_path(&self) -> &Path {
        &self.container_path
    }

    /// Access mode
    #[must_use]
    pub const fn mode(&self) -> MountMode {
        self.mode
    }

    /// Filesystem kind
    #[must_use]
    pub const fn kind(&self) -> MountKind {
        self.kind
    }

    /// Whether the mount must end up read-only
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.mode == MountMode::ReadOnly
    }

    /// Number of path components below the container root
    #[must_use]
    pub fn depth(&self) -> usize {
        self.container_path
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .count()
    }

    /// Whether the mount target has to be a regular file (binds of files)
    #[must_use]
    pub fn targets_file(&self) -> bool {
        self.host_path.as_deref().is_some_and(|p| !p.is_dir())
    }

    pub(crate) fn normalized(&self, host_path: Option<PathBuf>, container_path: PathBuf) -> Self {
        Self {
            host_path,
            container_path,
            mode: self.mode,
            kind: self.kind,
        }
    }
}

impl fmt::Display for MountSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            MountMode::ReadOnly => "ro",
            MountMode::ReadWrite => "rw",
        };
        match &self.host_path {
            Some(host) => write!(
                f,
                "{} {} -> {} ({mode})",
                self.kind,
                host.display(),
                self.container_path.display()
            ),
            None => write!(f, "{} {} ({mode})", self.kind, self.container_path.display()),
        }
    }
}

/// Lexically normalize an absolute container path
///
/// Resolves `.` and `..` without touching the filesystem.
///
/// # Errors
/// Returns the rejection reason if the path is relative, climbs above the
/// container root, or names the root itself.
pub fn normalize_container_path(path: &Path) -> Result<PathBuf, &'static str> {
    if !path.is_absolute() {
        return Err("container path must be absolute");
    }

    let mut parts: Vec<&OsStr> = Vec::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err("container path escapes the container root");
                }
            }
            Component::Normal(part) => parts.push(part),
            Component::Prefix(_) => return Err("container path has an unsupported prefix"),
        }
    }

    if parts.is_empty() {
        return Err("cannot mount over the container root itself");
    }

    let mut normalized = PathBuf::from("/");
    normalized.extend(parts);
    Ok(normalized)
}
