//! Realizing a mount plan under a container root

use cbuildrt_core::{Error, Result};
use nix::errno::Errno;
use nix::mount::MsFlags;
use std::fs::{self, DirBuilder, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Component, Path};
use tracing::{debug, error, info, warn};

use crate::backend::MountBackend;
use crate::dev;
use crate::handle::{HandleEntry, MountHandle};
use crate::plan::MountPlan;
use crate::root::ContainerRoot;
use crate::spec::{MountKind, MountSpec};
use crate::teardown::Teardown;

/// Host procfs, bound when the run has no PID namespace of its own
const HOST_PROC: &str = "/proc";

/// Applies a [`MountPlan`] through a [`MountBackend`]
///
/// Must run inside the run's private mount namespace.
#[derive(Debug)]
pub struct MountExecutor<'b, B: MountBackend> {
    backend: &'b B,
}

impl<'b, B: MountBackend> MountExecutor<'b, B> {
    /// Create an executor over `backend`
    pub const fn new(backend: &'b B) -> Self {
        Self { backend }
    }

    /// Mount every host-stage spec of `plan` under `root`
    ///
    /// The root is bind-mounted onto itself first (a pivot target must be a
    /// mount point) and remounted read-only last when requested. `Proc`
    /// specs only get their mount point here; see
    /// [`mount_pid_scoped`](Self::mount_pid_scoped).
    ///
    /// # Errors
    /// [`Error::MountFailed`] on the first failing step. Everything
    /// established before the failure has already been reversed.
    pub fn execute(&self, plan: &MountPlan, root: &ContainerRoot) -> Result<MountHandle> {
        let mut handle = MountHandle::new();

        match self.realize(plan, root, &mut handle) {
            Ok(()) => {
                info!(
                    root = %root.path().display(),
                    entries = handle.len(),
                    "Mount plan applied"
                );
                Ok(handle)
            }
            Err(err) => {
                error!(error = %err, entries = handle.len(), "Mount plan failed, unwinding");
                let report = Teardown::new(self.backend).unwind(handle);
                for warning in &report.warnings {
                    warn!(%warning, "Unwind left a resource behind");
                }
                Err(err)
            }
        }
    }

    fn realize(
        &self,
        plan: &MountPlan,
        root: &ContainerRoot,
        handle: &mut MountHandle,
    ) -> Result<()> {
        let root_path = root.path();
        self.backend
            .bind(root_path, root_path, false)
            .map_err(|e| Error::mount_failed(format!("container root {}", root_path.display()), e))?;
        handle.push(HandleEntry::Mounted {
            target: root_path.to_path_buf(),
        });

        for spec in plan {
            // Mount points on the root filesystem are ours to remove later;
            // inside another mount they vanish with it
            let on_root_fs = plan.enclosing(spec).is_none();
            let target = root.resolve(spec.container_path());
            prepare_target(root_path, spec, on_root_fs, handle)?;

            if spec.kind().is_pid_scoped() {
                continue;
            }
            self.mount_one(spec, &target, handle)?;
        }

        if root.is_read_only() {
            self.backend
                .remount(root_path, true)
                .map_err(|e| Error::mount_failed(format!("read-only root {}", root_path.display()), e))?;
            handle.push(HandleEntry::ReadOnly {
                target: root_path.to_path_buf(),
            });
        }

        Ok(())
    }

    fn mount_one(&self, spec: &MountSpec, target: &Path, handle: &mut MountHandle) -> Result<()> {
        debug!(mount = %spec, target = %target.display(), "Mounting");

        let result = match spec.kind() {
            MountKind::Bind => match spec.host_path() {
                Some(source) => self.backend.bind(source, target, true),
                None => Err(Errno::EINVAL),
            },
            MountKind::Tmpfs => {
                self.backend
                    .mount_fs("tmpfs", target, MsFlags::MS_NOSUID | MsFlags::MS_NODEV, None)
            }
            MountKind::Devtmpfs => self.backend.mount_fs(
                "tmpfs",
                target,
                MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
                Some("mode=0755"),
            ),
            MountKind::Proc => return Ok(()),
        };
        result.map_err(|e| Error::mount_failed(spec, e))?;
        handle.push(HandleEntry::Mounted {
            target: target.to_path_buf(),
        });

        if spec.kind() == MountKind::Devtmpfs {
            dev::populate(self.backend, target, handle)?;
        }

        if spec.is_read_only() {
            self.backend
                .remount(target, true)
                .map_err(|e| Error::mount_failed(spec, e))?;
            handle.push(HandleEntry::ReadOnly {
                target: target.to_path_buf(),
            });
        }

        Ok(())
    }

    /// Mount the `Proc` specs of `plan` under `root`
    ///
    /// Runs in the child after it entered the PID namespace and its own
    /// mount namespace, so nothing is recorded: the mounts die with that
    /// namespace. `fresh_procfs` mounts a new procfs; otherwise the host
    /// `/proc` is bound.
    ///
    /// # Errors
    /// [`Error::MountFailed`] on the first failing mount.
    pub fn mount_pid_scoped(&self, plan: &MountPlan, root: &Path, fresh_procfs: bool) -> Result<()> {
        for spec in plan.pid_stage() {
            let target = root.join(
                spec.container_path()
                    .strip_prefix("/")
                    .unwrap_or(spec.container_path()),
            );

            let result = if fresh_procfs {
                self.backend.mount_fs(
                    "proc",
                    &target,
                    MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                    None,
                )
            } else {
                self.backend.bind(Path::new(HOST_PROC), &target, true)
            };
            result.map_err(|e| Error::mount_failed(spec, e))?;

            if spec.is_read_only() {
                self.backend
                    .remount(&target, true)
                    .map_err(|e| Error::mount_failed(spec, e))?;
            }
        }
        Ok(())
    }
}

/// Make sure the mount point for `spec` exists below `root`
///
/// Missing components are created (directories `0755`, a file `0644` for
/// file binds). Existing symlinks are refused so a mount can never land
/// outside the root. Creations are recorded only when `record` is set.
fn prepare_target(
    root: &Path,
    spec: &MountSpec,
    record: bool,
    handle: &mut MountHandle,
) -> Result<()> {
    let wants_file = spec.targets_file();
    let components: Vec<_> = spec
        .container_path()
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect();

    let mut current = root.to_path_buf();
    for (index, part) in components.iter().enumerate() {
        current.push(part);
        let last = index + 1 == components.len();
        let want_dir = !(last && wants_file);

        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(target_error(spec, &current, Errno::ELOOP));
            }
            Ok(meta) if meta.is_dir() != want_dir => {
                let errno = if want_dir { Errno::ENOTDIR } else { Errno::EISDIR };
                return Err(target_error(spec, &current, errno));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let created = if want_dir {
                    DirBuilder::new().mode(0o755).create(&current)
                } else {
                    OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(0o644)
                        .open(&current)
                        .map(drop)
                };
                created.map_err(|source| Error::MountFailed {
                    spec: spec.to_string(),
                    source,
                })?;
                debug!(path = %current.display(), "Created mount point");
                if record {
                    handle.push(HandleEntry::Created {
                        path: current.clone(),
                    });
                }
            }
            Err(source) => {
                return Err(Error::MountFailed {
                    spec: spec.to_string(),
                    source,
                });
            }
        }
    }
    Ok(())
}

fn target_error(spec: &MountSpec, path: &Path, errno: Errno) -> Error {
    Error::MountFailed {
        spec: spec.to_string(),
        source: io::Error::new(
            io::Error::from(errno).kind(),
            format!("unusable mount point {}: {}", path.display(), errno.desc()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, MountOp};
    use crate::plan::{Essentials, MountPlanBuilder};

    #[test]
    fn test_execute_records_creation_order() {
        let src = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let root = ContainerRoot::acquire(dir.path(), false).unwrap();
        let plan = MountPlanBuilder::new()
            .essentials(Essentials::none())
            .mount(MountSpec::bind(src.path(), "/input").read_only())
            .build()
            .unwrap();

        let backend = MockBackend::new();
        let mut handle = MountExecutor::new(&backend).execute(&plan, &root).unwrap();

        let input = dir.path().join("input");
        assert_eq!(
            handle.take_entries(),
            vec![
                HandleEntry::Mounted {
                    target: dir.path().to_path_buf()
                },
                HandleEntry::Created {
                    path: input.clone()
                },
                HandleEntry::Mounted {
                    target: input.clone()
                },
                HandleEntry::ReadOnly { target: input },
            ]
        );
    }

    #[test]
    fn test_nested_mount_points_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let root = ContainerRoot::acquire(dir.path(), false).unwrap();
        let plan = MountPlanBuilder::new()
            .essentials(Essentials::none())
            .mount(MountSpec::tmpfs("/scratch"))
            .mount(MountSpec::tmpfs("/scratch/inner"))
            .build()
            .unwrap();

        let backend = MockBackend::new();
        let mut handle = MountExecutor::new(&backend).execute(&plan, &root).unwrap();
        let created: Vec<_> = handle
            .take_entries()
            .into_iter()
            .filter(|e| matches!(e, HandleEntry::Created { .. }))
            .collect();

        assert_eq!(
            created,
            vec![HandleEntry::Created {
                path: dir.path().join("scratch")
            }]
        );
    }

    #[test]
    fn test_refuses_symlinked_mount_point() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("/etc", dir.path().join("escape")).unwrap();
        let root = ContainerRoot::acquire(dir.path(), false).unwrap();
        let plan = MountPlanBuilder::new()
            .essentials(Essentials::none())
            .mount(MountSpec::tmpfs("/escape"))
            .build()
            .unwrap();

        let backend = MockBackend::new();
        let err = MountExecutor::new(&backend)
            .execute(&plan, &root)
            .unwrap_err();

        assert!(matches!(err, Error::MountFailed { .. }));
        assert!(backend.mounted().is_empty());
    }

    #[test]
    fn test_read_only_root_remounted_last() {
        let dir = tempfile::tempdir().unwrap();
        let root = ContainerRoot::acquire(dir.path(), true).unwrap();
        let plan = MountPlanBuilder::new()
            .essentials(Essentials::none())
            .mount(MountSpec::tmpfs("/tmp"))
            .build()
            .unwrap();

        let backend = MockBackend::new();
        let mut handle = MountExecutor::new(&backend).execute(&plan, &root).unwrap();

        assert_eq!(
            backend.ops().last(),
            Some(&MountOp::Remount {
                target: dir.path().to_path_buf(),
                read_only: true,
            })
        );
        assert!(matches!(
            handle.take_entries().last(),
            Some(HandleEntry::ReadOnly { .. })
        ));
    }

    #[test]
    fn test_proc_deferred_to_pid_stage() {
        let dir = tempfile::tempdir().unwrap();
        let root = ContainerRoot::acquire(dir.path(), false).unwrap();
        let plan = MountPlanBuilder::new()
            .essentials(Essentials {
                proc: true,
                ..Essentials::none()
            })
            .build()
            .unwrap();

        let backend = MockBackend::new();
        let mut handle = MountExecutor::new(&backend).execute(&plan, &root).unwrap();

        // Only the root bind happened; /proc exists as an empty mount point
        assert_eq!(backend.mounted(), vec![dir.path().to_path_buf()]);
        assert!(dir.path().join("proc").is_dir());

        MountExecutor::new(&backend)
            .mount_pid_scoped(&plan, dir.path(), true)
            .unwrap();
        assert!(backend.ops().contains(&MountOp::Mount {
            fstype: "proc".to_string(),
            target: dir.path().join("proc"),
        }));
        handle.take_entries();
    }
}
