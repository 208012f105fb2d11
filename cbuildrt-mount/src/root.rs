//! Container root directory ownership

use cbuildrt_core::{Error, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, DirBuilder, File};
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory that becomes `/` for one run
///
/// Holds an exclusive `flock` on the directory for as long as it lives, so
/// two runs can never share a root. A root created by the runtime is
/// *ephemeral* and is removed again during teardown.
#[derive(Debug)]
pub struct ContainerRoot {
    path: PathBuf,
    ephemeral: bool,
    read_only: bool,
    _lock: Flock<File>,
}

impl ContainerRoot {
    /// Claim `path` as the container root, creating it if absent
    ///
    /// # Errors
    /// - [`Error::InvalidMountSpec`] if the path is relative, not a
    ///   directory, or already locked by another run
    /// - [`Error::Io`] if the directory cannot be created or opened
    pub fn acquire(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_absolute() {
            return Err(Error::invalid_mount(
                path,
                "container root must be an absolute path",
            ));
        }

        let ephemeral = match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => false,
            Ok(_) => {
                return Err(Error::invalid_mount(
                    path,
                    "container root is not a directory",
                ));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                DirBuilder::new().mode(0o755).create(path)?;
                true
            }
            Err(e) => return Err(e.into()),
        };

        Self::lock(path.to_path_buf(), ephemeral, read_only)
    }

    /// Create a fresh ephemeral root under the system temp directory
    ///
    /// # Errors
    /// Returns error if the directory cannot be created or locked
    pub fn scratch(read_only: bool) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("cbuildrt-").tempdir()?;
        let path = dir.keep();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        Self::lock(path, true, read_only)
    }

    fn lock(path: PathBuf, ephemeral: bool, read_only: bool) -> Result<Self> {
        let file = File::open(&path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                debug!(
                    root = %path.display(),
                    ephemeral,
                    read_only,
                    "Acquired container root"
                );
                Ok(Self {
                    path,
                    ephemeral,
                    read_only,
                    _lock: lock,
                })
            }
            Err((_, errno)) => {
                if ephemeral {
                    let _ = fs::remove_dir(&path);
                }
                if errno == Errno::EWOULDBLOCK {
                    Err(Error::invalid_mount(
                        path,
                        "container root is in use by another run",
                    ))
                } else {
                    Err(Error::System(errno))
                }
            }
        }
    }

    /// Host path of the root
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the runtime created the directory
    #[must_use]
    pub const fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Whether the root is remounted read-only after the plan is applied
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Host path corresponding to an absolute container path
    #[must_use]
    pub fn resolve(&self, container_path: &Path) -> PathBuf {
        self.path
            .join(container_path.strip_prefix("/").unwrap_or(container_path))
    }
}
