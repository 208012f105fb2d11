//! Mount plan building and validation
//!
//! Everything here is pure validation: the builder only reads the host
//! filesystem (`canonicalize`, `access`, `stat`) and never issues a mount
//! or namespace syscall, so a rejected plan leaves no trace.

use cbuildrt_core::{Error, Result};
use nix::unistd::{AccessFlags, access};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::dev;
use crate::spec::{MountKind, MountSpec, normalize_container_path};

/// Host resolver configuration bound into the container
pub const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Implicit mounts every run gets unless switched off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Essentials {
    /// Procfs at `/proc`
    pub proc: bool,
    /// Device tree at `/dev`
    pub dev: bool,
    /// Tmpfs at `/tmp`
    pub tmp: bool,
    /// Tmpfs at `/run`
    pub run: bool,
    /// Read-only bind of the host resolver configuration
    pub resolv_conf: bool,
}

impl Default for Essentials {
    fn default() -> Self {
        Self {
            proc: true,
            dev: true,
            tmp: true,
            run: true,
            resolv_conf: true,
        }
    }
}

impl Essentials {
    /// No implicit mounts at all
    #[must_use]
    pub const fn none() -> Self {
        Self {
            proc: false,
            dev: false,
            tmp: false,
            run: false,
            resolv_conf: false,
        }
    }

    /// Specs for the enabled essentials, in declaration order
    #[must_use]
    pub fn specs(&self) -> Vec<MountSpec> {
        let mut specs = Vec::new();
        if self.proc {
            specs.push(MountSpec::proc("/proc"));
        }
        if self.dev {
            specs.push(MountSpec::devtmpfs("/dev"));
        }
        if self.tmp {
            specs.push(MountSpec::tmpfs("/tmp"));
        }
        if self.run {
            specs.push(MountSpec::tmpfs("/run"));
        }
        if self.resolv_conf {
            // Often a symlink into /run; bind the file it points to
            match fs::canonicalize(RESOLV_CONF) {
                Ok(source) => specs.push(MountSpec::bind(source, RESOLV_CONF).read_only()),
                Err(e) => debug!(error = %e, "No usable host resolv.conf, skipping"),
            }
        }
        specs
    }
}

/// Builder turning mount declarations into a validated [`MountPlan`]
///
/// # Example
/// ```no_run
/// use cbuildrt_mount::{Essentials, MountPlanBuilder, MountSpec};
///
/// let plan = MountPlanBuilder::new()
///     .essentials(Essentials::none())
///     .mount(MountSpec::bind("/srv/src", "/input").read_only())
///     .mount(MountSpec::bind("/srv/out", "/output"))
///     .build()?;
///
/// assert_eq!(plan.len(), 2);
/// # Ok::<(), cbuildrt_core::Error>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct MountPlanBuilder {
    essentials: Essentials,
    declared: Vec<MountSpec>,
}

impl MountPlanBuilder {
    /// Builder with default essentials and no declared mounts
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the implicit mounts
    #[must_use]
    pub const fn essentials(mut self, essentials: Essentials) -> Self {
        self.essentials = essentials;
        self
    }

    /// Declare one mount
    #[must_use]
    pub fn mount(mut self, spec: MountSpec) -> Self {
        self.declared.push(spec);
        self
    }

    /// Declare several mounts, keeping their order
    #[must_use]
    pub fn mounts(mut self, specs: impl IntoIterator<Item = MountSpec>) -> Self {
        self.declared.extend(specs);
        self
    }

    /// Validate every declaration and order the plan
    ///
    /// An explicit declaration replaces the essential mount with the same
    /// target; two explicit declarations of one target are an error.
    ///
    /// # Errors
    /// [`Error::InvalidMountSpec`] for the first rejected declaration.
    pub fn build(self) -> Result<MountPlan> {
        let declared = self
            .declared
            .iter()
            .map(validate_spec)
            .collect::<Result<Vec<_>>>()?;

        let mut seen = HashSet::new();
        for spec in &declared {
            if !seen.insert(spec.container_path().to_path_buf()) {
                return Err(Error::invalid_mount(
                    spec.container_path(),
                    "container path is declared more than once",
                ));
            }
        }

        let mut specs = Vec::with_capacity(declared.len() + 5);
        for essential in self.essentials.specs() {
            let essential = validate_spec(&essential)?;
            if seen.contains(essential.container_path()) {
                debug!(
                    target = %essential.container_path().display(),
                    "Declared mount replaces essential"
                );
                continue;
            }
            specs.push(essential);
        }
        specs.extend(declared);

        // Stable: equal depths keep declaration order
        specs.sort_by_key(MountSpec::depth);

        let plan = MountPlan { specs };
        plan.check_nesting()?;

        debug!(mounts = plan.len(), "Mount plan validated");
        Ok(plan)
    }
}

fn validate_spec(spec: &MountSpec) -> Result<MountSpec> {
    let container_path = normalize_container_path(spec.container_path())
        .map_err(|reason| Error::invalid_mount(spec.container_path(), reason))?;

    let host_path = match (spec.kind(), spec.host_path()) {
        (MountKind::Bind, Some(host)) => Some(validate_host_path(host)?),
        (MountKind::Bind, None) => {
            return Err(Error::invalid_mount(
                &container_path,
                "bind mount requires a host path",
            ));
        }
        (kind, Some(_)) => {
            return Err(Error::invalid_mount(
                &container_path,
                format!("{kind} mount does not take a host path"),
            ));
        }
        (_, None) => None,
    };

    Ok(spec.normalized(host_path, container_path))
}

fn validate_host_path(host: &Path) -> Result<PathBuf> {
    if !host.is_absolute() {
        return Err(Error::invalid_mount(host, "host path must be absolute"));
    }

    let canonical = fs::canonicalize(host)
        .map_err(|e| Error::invalid_mount(host, format!("host path does not exist: {e}")))?;

    access(&canonical, AccessFlags::R_OK)
        .map_err(|e| Error::invalid_mount(host, format!("host path is not readable: {e}")))?;

    Ok(canonical)
}

/// Validated, ordered list of mounts for one run
///
/// Specs are sorted by container path depth (ties in declaration order).
/// Teardown reverses exactly this order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPlan {
    specs: Vec<MountSpec>,
}

impl MountPlan {
    /// All specs in mount order
    #[must_use]
    pub fn specs(&self) -> &[MountSpec] {
        &self.specs
    }

    /// Iterate in mount order
    pub fn iter(&self) -> std::slice::Iter<'_, MountSpec> {
        self.specs.iter()
    }

    /// Number of specs
    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Whether the plan mounts nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Whether any spec must be mounted from inside the PID namespace
    #[must_use]
    pub fn has_pid_scoped(&self) -> bool {
        self.specs.iter().any(|s| s.kind().is_pid_scoped())
    }

    /// Specs mounted by the runtime before the child starts
    pub fn host_stage(&self) -> impl Iterator<Item = &MountSpec> {
        self.specs.iter().filter(|s| !s.kind().is_pid_scoped())
    }

    /// Specs mounted by the child inside its PID namespace
    pub fn pid_stage(&self) -> impl Iterator<Item = &MountSpec> {
        self.specs.iter().filter(|s| s.kind().is_pid_scoped())
    }

    /// Nearest earlier spec whose target contains the target of `spec`
    #[must_use]
    pub fn enclosing(&self, spec: &MountSpec) -> Option<&MountSpec> {
        let target = spec.container_path();
        self.specs
            .iter()
            .take_while(|candidate| *candidate != spec)
            .filter(|candidate| {
                let parent = candidate.container_path();
                parent != target && target.starts_with(parent)
            })
            .max_by_key(|candidate| candidate.depth())
    }

    fn check_nesting(&self) -> Result<()> {
        for spec in &self.specs {
            let Some(parent) = self.enclosing(spec) else {
                continue;
            };
            let target = spec.container_path();
            let relative = target
                .strip_prefix(parent.container_path())
                .unwrap_or(target);

            match parent.kind() {
                MountKind::Proc => {
                    return Err(Error::invalid_mount(
                        target,
                        format!(
                            "would be hidden by the procfs at {}",
                            parent.container_path().display()
                        ),
                    ));
                }
                MountKind::Bind => {
                    let Some(source) = parent.host_path() else {
                        continue;
                    };
                    if !source.is_dir() {
                        return Err(Error::invalid_mount(
                            target,
                            format!("cannot mount below the file bind {}", source.display()),
                        ));
                    }
                    let mountpoint = source.join(relative);
                    if fs::symlink_metadata(&mountpoint).is_err() {
                        return Err(Error::invalid_mount(
                            target,
                            format!(
                                "mount point {} does not exist in the bind source",
                                mountpoint.display()
                            ),
                        ));
                    }
                }
                MountKind::Tmpfs | MountKind::Devtmpfs if parent.is_read_only() => {
                    return Err(Error::invalid_mount(
                        target,
                        format!(
                            "cannot create a mount point inside the read-only {} at {}",
                            parent.kind(),
                            parent.container_path().display()
                        ),
                    ));
                }
                MountKind::Devtmpfs => {
                    let first = relative.components().next().and_then(|c| match c {
                        Component::Normal(name) => name.to_str(),
                        _ => None,
                    });
                    if first.is_some_and(dev::is_reserved) {
                        return Err(Error::invalid_mount(
                            target,
                            "conflicts with an entry of the device tree",
                        ));
                    }
                }
                MountKind::Tmpfs => {}
            }
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a MountPlan {
    type Item = &'a MountSpec;
    type IntoIter = std::slice::Iter<'a, MountSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.specs.iter()
    }
}
