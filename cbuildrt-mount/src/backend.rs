//! Mount backend trait for pluggable implementations

use nix::mount::{MntFlags, MsFlags};
use nix::sys::statvfs::{FsFlags, statvfs};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

/// Trait for the mount syscalls used by the executor and teardown
///
/// This allows for different implementations:
/// - [`LinuxBackend`] - Real `mount(2)`/`umount2(2)`
/// - [`MockBackend`] - Recording backend for tests, touches no mount table
///
/// Methods report the raw errno; callers attach context.
pub trait MountBackend {
    /// Bind `source` onto `target`
    ///
    /// `recursive` also binds every mount below `source`.
    fn bind(&self, source: &Path, target: &Path, recursive: bool) -> nix::Result<()>;

    /// Mount a fresh filesystem of type `fstype` at `target`
    fn mount_fs(
        &self,
        fstype: &str,
        target: &Path,
        flags: MsFlags,
        data: Option<&str>,
    ) -> nix::Result<()>;

    /// Flip the read-only flag of the mount at `target`
    fn remount(&self, target: &Path, read_only: bool) -> nix::Result<()>;

    /// Stop propagation of mount events below `target`
    fn make_private(&self, target: &Path) -> nix::Result<()>;

    /// Detach the mount at `target`
    fn unmount(&self, target: &Path) -> nix::Result<()>;
}

impl<B: MountBackend + ?Sized> MountBackend for &B {
    fn bind(&self, source: &Path, target: &Path, recursive: bool) -> nix::Result<()> {
        (**self).bind(source, target, recursive)
    }

    fn mount_fs(
        &self,
        fstype: &str,
        target: &Path,
        flags: MsFlags,
        data: Option<&str>,
    ) -> nix::Result<()> {
        (**self).mount_fs(fstype, target, flags, data)
    }

    fn remount(&self, target: &Path, read_only: bool) -> nix::Result<()> {
        (**self).remount(target, read_only)
    }

    fn make_private(&self, target: &Path) -> nix::Result<()> {
        (**self).make_private(target)
    }

    fn unmount(&self, target: &Path) -> nix::Result<()> {
        (**self).unmount(target)
    }
}

/// Production backend issuing real mount syscalls
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxBackend;

impl LinuxBackend {
    /// Create the backend
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Flags a bind remount has to carry over
    ///
    /// Inside a user namespace the kernel locks these flags on mounts
    /// inherited from the parent namespace; dropping one yields `EPERM`.
    fn locked_flags(target: &Path) -> nix::Result<MsFlags> {
        let current = statvfs(target)?.flags();
        let mut flags = MsFlags::empty();
        for (fs_flag, ms_flag) in [
            (FsFlags::ST_NOSUID, MsFlags::MS_NOSUID),
            (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
            (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
        ] {
            if current.contains(fs_flag) {
                flags |= ms_flag;
            }
        }
        Ok(flags)
    }
}

impl MountBackend for LinuxBackend {
    fn bind(&self, source: &Path, target: &Path, recursive: bool) -> nix::Result<()> {
        let mut flags = MsFlags::MS_BIND;
        if recursive {
            flags |= MsFlags::MS_REC;
        }
        nix::mount::mount(Some(source), target, None::<&str>, flags, None::<&str>)
    }

    fn mount_fs(
        &self,
        fstype: &str,
        target: &Path,
        flags: MsFlags,
        data: Option<&str>,
    ) -> nix::Result<()> {
        nix::mount::mount(Some(fstype), target, Some(fstype), flags, data)
    }

    fn remount(&self, target: &Path, read_only: bool) -> nix::Result<()> {
        let mut flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | Self::locked_flags(target)?;
        if read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        nix::mount::mount(None::<&str>, target, None::<&str>, flags, None::<&str>)
    }

    fn make_private(&self, target: &Path) -> nix::Result<()> {
        nix::mount::mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        )
    }

    fn unmount(&self, target: &Path) -> nix::Result<()> {
        nix::mount::umount2(target, MntFlags::MNT_DETACH)
    }
}

/// One call recorded by the [`MockBackend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountOp {
    /// `bind(source, target, recursive)`
    Bind {
        /// Source path
        source: PathBuf,
        /// Target path
        target: PathBuf,
        /// Recursive bind
        recursive: bool,
    },
    /// `mount_fs(fstype, target, ..)`
    Mount {
        /// Filesystem type
        fstype: String,
        /// Target path
        target: PathBuf,
    },
    /// `remount(target, read_only)`
    Remount {
        /// Target path
        target: PathBuf,
        /// Requested read-only state
        read_only: bool,
    },
    /// `make_private(target)`
    MakePrivate {
        /// Target path
        target: PathBuf,
    },
    /// `unmount(target)`
    Unmount {
        /// Target path
        target: PathBuf,
    },
}

/// Mock backend for testing (doesn't touch the mount table)
///
/// Records every call, tracks which targets are currently mounted, and can
/// be told to fail a specific mount or unmount.
///
/// # Example
/// ```
/// use cbuildrt_mount::{MockBackend, MountBackend, MountOp};
/// use std::path::Path;
///
/// let backend = MockBackend::new();
/// backend.bind(Path::new("/src"), Path::new("/root/input"), true).unwrap();
/// assert!(backend.is_mounted(Path::new("/root/input")));
///
/// backend.unmount(Path::new("/root/input")).unwrap();
/// assert_eq!(backend.ops().len(), 2);
/// assert!(matches!(backend.ops()[1], MountOp::Unmount { .. }));
/// ```
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    ops: Vec<MountOp>,
    mounted: Vec<PathBuf>,
    fail_mount: HashSet<PathBuf>,
    fail_unmount: HashSet<PathBuf>,
}

impl MockBackend {
    /// Create a new mock backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A test that panicked mid-call still leaves usable state behind
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Make any mount onto `target` fail with `EPERM`
    pub fn fail_mount_at(&self, target: impl Into<PathBuf>) {
        self.state().fail_mount.insert(target.into());
    }

    /// Make unmounting `target` fail with `EBUSY`
    pub fn fail_unmount_at(&self, target: impl Into<PathBuf>) {
        self.state().fail_unmount.insert(target.into());
    }

    /// All calls made so far, in order
    #[must_use]
    pub fn ops(&self) -> Vec<MountOp> {
        self.state().ops.clone()
    }

    /// Currently mounted targets, in mount order
    #[must_use]
    pub fn mounted(&self) -> Vec<PathBuf> {
        self.state().mounted.clone()
    }

    /// Whether `target` is currently mounted
    #[must_use]
    pub fn is_mounted(&self, target: &Path) -> bool {
        self.state().mounted.iter().any(|m| m == target)
    }

    fn record_mount(&self, op: MountOp, target: &Path) -> nix::Result<()> {
        let mut state = self.state();
        state.ops.push(op);
        if state.fail_mount.contains(target) {
            debug!(target = %target.display(), "Mock: injected mount failure");
            return Err(nix::Error::EPERM);
        }
        state.mounted.push(target.to_path_buf());
        Ok(())
    }
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend").finish_non_exhaustive()
    }
}

impl MountBackend for MockBackend {
    fn bind(&self, source: &Path, target: &Path, recursive: bool) -> nix::Result<()> {
        trace!(source = %source.display(), target = %target.display(), "Mock: bind");
        self.record_mount(
            MountOp::Bind {
                source: source.to_path_buf(),
                target: target.to_path_buf(),
                recursive,
            },
            target,
        )
    }

    fn mount_fs(
        &self,
        fstype: &str,
        target: &Path,
        _flags: MsFlags,
        _data: Option<&str>,
    ) -> nix::Result<()> {
        trace!(fstype, target = %target.display(), "Mock: mount");
        self.record_mount(
            MountOp::Mount {
                fstype: fstype.to_string(),
                target: target.to_path_buf(),
            },
            target,
        )
    }

    fn remount(&self, target: &Path, read_only: bool) -> nix::Result<()> {
        let mut state = self.state();
        state.ops.push(MountOp::Remount {
            target: target.to_path_buf(),
            read_only,
        });
        if read_only && state.fail_mount.contains(target) {
            return Err(nix::Error::EPERM);
        }
        if state.mounted.iter().any(|m| m == target) {
            Ok(())
        } else {
            Err(nix::Error::EINVAL)
        }
    }

    fn make_private(&self, target: &Path) -> nix::Result<()> {
        self.state().ops.push(MountOp::MakePrivate {
            target: target.to_path_buf(),
        });
        Ok(())
    }

    fn unmount(&self, target: &Path) -> nix::Result<()> {
        let mut state = self.state();
        state.ops.push(MountOp::Unmount {
            target: target.to_path_buf(),
        });

        if state.fail_unmount.contains(target) {
            debug!(target = %target.display(), "Mock: injected unmount failure");
            return Err(nix::Error::EBUSY);
        }

        // Topmost mount on the target goes first, like the kernel
        match state.mounted.iter().rposition(|m| m == target) {
            Some(index) => {
                state.mounted.remove(index);
                Ok(())
            }
            None => Err(nix::Error::EINVAL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_backend_tracks_mounts() {
        let backend = MockBackend::new();
        let target = Path::new("/root/tmp");

        backend
            .mount_fs("tmpfs", target, MsFlags::empty(), None)
            .unwrap();
        assert!(backend.is_mounted(target));

        backend.remount(target, true).unwrap();
        backend.unmount(target).unwrap();
        assert!(!backend.is_mounted(target));

        assert_eq!(
            backend.ops(),
            vec![
                MountOp::Mount {
                    fstype: "tmpfs".to_string(),
                    target: target.to_path_buf(),
                },
                MountOp::Remount {
                    target: target.to_path_buf(),
                    read_only: true,
                },
                MountOp::Unmount {
                    target: target.to_path_buf(),
                },
            ]
        );
    }

    #[test]
    fn test_mock_backend_unmount_missing_target() {
        let backend = MockBackend::new();
        assert_eq!(
            backend.unmount(Path::new("/nowhere")),
            Err(nix::Error::EINVAL)
        );
    }

    #[test]
    fn test_mock_backend_injected_failures() {
        let backend = MockBackend::new();
        backend.fail_mount_at("/root/input");
        backend.fail_unmount_at("/root/output");

        let err = backend
            .bind(Path::new("/src"), Path::new("/root/input"), true)
            .unwrap_err();
        assert_eq!(err, nix::Error::EPERM);
        assert!(!backend.is_mounted(Path::new("/root/input")));

        backend
            .bind(Path::new("/out"), Path::new("/root/output"), true)
            .unwrap();
        assert_eq!(
            backend.unmount(Path::new("/root/output")),
            Err(nix::Error::EBUSY)
        );
        assert!(backend.is_mounted(Path::new("/root/output")));
    }

    #[test]
    fn test_mock_backend_clones_share_state() {
        let backend = MockBackend::new();
        let clone = backend.clone();

        clone
            .bind(Path::new("/a"), Path::new("/root/a"), false)
            .unwrap();
        assert_eq!(backend.mounted(), vec![PathBuf::from("/root/a")]);
    }
}
