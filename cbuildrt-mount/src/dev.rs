//! Minimal `/dev` tree for the container
//!
//! A [`Devtmpfs`](crate::MountKind::Devtmpfs) mount is a small tmpfs holding
//! bind mounts of a fixed set of host character devices, a private devpts
//! instance, a shared-memory tmpfs and the usual convenience symlinks.
//! Creating device nodes needs `CAP_MKNOD` in the initial namespace, so
//! host nodes are bound instead.

use cbuildrt_core::{Error, Result};
use nix::mount::MsFlags;
use std::fs::{DirBuilder, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, symlink};
use std::path::Path;
use tracing::debug;

use crate::backend::MountBackend;
use crate::handle::{HandleEntry, MountHandle};

/// Host device nodes bound into the device tree
pub const DEVICE_NODES: [&str; 6] = ["null", "zero", "full", "random", "urandom", "tty"];

/// Symlinks created in the device tree
pub const DEVICE_LINKS: [(&str, &str); 5] = [
    ("ptmx", "pts/ptmx"),
    ("fd", "/proc/self/fd"),
    ("stdin", "/proc/self/fd/0"),
    ("stdout", "/proc/self/fd/1"),
    ("stderr", "/proc/self/fd/2"),
];

const DEVPTS_OPTIONS: &str = "newinstance,ptmxmode=0666,mode=0620";
const SHM_OPTIONS: &str = "mode=1777";

/// Whether `name` is an entry the device tree creates itself
#[must_use]
pub fn is_reserved(name: &str) -> bool {
    DEVICE_NODES.contains(&name)
        || DEVICE_LINKS.iter().any(|(link, _)| *link == name)
        || matches!(name, "pts" | "shm")
}

/// Fill the freshly mounted tmpfs at `dev_dir`
///
/// Every mount is recorded in `handle` so a partial failure can be unwound.
/// Files and directories live on the tmpfs and vanish with it.
pub(crate) fn populate<B: MountBackend>(
    backend: &B,
    dev_dir: &Path,
    handle: &mut MountHandle,
) -> Result<()> {
    for node in DEVICE_NODES {
        let source = Path::new("/dev").join(node);
        if !source.exists() {
            debug!(device = %source.display(), "Host device missing, skipping");
            continue;
        }

        let target = dev_dir.join(node);
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(&target)
            .map_err(|e| device_error(&target, e))?;

        backend
            .bind(&source, &target, false)
            .map_err(|e| Error::mount_failed(format!("device {}", source.display()), e))?;
        handle.push(HandleEntry::Mounted { target });
    }

    let pts = dev_dir.join("pts");
    make_dir(&pts)?;
    backend
        .mount_fs(
            "devpts",
            &pts,
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            Some(DEVPTS_OPTIONS),
        )
        .map_err(|e| Error::mount_failed(format!("devpts {}", pts.display()), e))?;
    handle.push(HandleEntry::Mounted { target: pts });

    let shm = dev_dir.join("shm");
    make_dir(&shm)?;
    backend
        .mount_fs(
            "tmpfs",
            &shm,
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some(SHM_OPTIONS),
        )
        .map_err(|e| Error::mount_failed(format!("tmpfs {}", shm.display()), e))?;
    handle.push(HandleEntry::Mounted { target: shm });

    for (name, destination) in DEVICE_LINKS {
        let link = dev_dir.join(name);
        match symlink(destination, &link) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(device_error(&link, e)),
        }
    }

    debug!(dev = %dev_dir.display(), "Populated device tree");
    Ok(())
}

fn make_dir(path: &Path) -> Result<()> {
    match DirBuilder::new().mode(0o755).create(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(device_error(path, e)),
    }
}

fn device_error(path: &Path, source: io::Error) -> Error {
    Error::MountFailed {
        spec: format!("device tree entry {}", path.display()),
        source,
    }
}
