//! Namespace lifecycle management

use cbuildrt_core::{Error, ProcessId, Result};
use cbuildrt_mount::MountBackend;
use nix::errno::Errno;
use nix::sched::{CloneFlags, unshare};
use std::fs::{self, File};
use std::io;
use std::path::Path;
use tracing::{debug, error, info};

use crate::config::NamespaceConfig;

/// Namespace manager for entering the run's namespaces
#[derive(Debug)]
pub struct NamespaceManager {
    config: NamespaceConfig,
}

impl NamespaceManager {
    /// Create a new namespace manager
    #[must_use]
    pub const fn new(config: NamespaceConfig) -> Self {
        Self { config }
    }

    /// Get the configuration
    #[must_use]
    pub const fn config(&self) -> &NamespaceConfig {
        &self.config
    }

    /// Move the calling process into the configured namespaces
    ///
    /// Order matters:
    /// 1. user namespace first, then `setgroups`, `uid_map`, `gid_map`
    /// 2. mount namespace, with `/` made recursively private
    /// 3. PID (and network) namespace, which only applies to children
    ///
    /// The caller must be single-threaded and never returns to the host
    /// namespaces; [`Runtime`](crate::Runtime) calls this from a forked run
    /// process. The PID namespace has no member yet, so its descriptor is
    /// taken later with [`NamespaceSet::hold_pid`].
    ///
    /// # Errors
    /// [`Error::NamespaceUnavailable`] when the host refuses any step.
    pub fn enter<B: MountBackend>(&self, backend: &B) -> Result<NamespaceSet> {
        self.config.validate()?;

        let enabled = self.config.enabled_namespaces();
        info!(namespaces = ?enabled, "Creating namespaces");

        if self.config.use_user_ns {
            unshare_as("unshare(CLONE_NEWUSER)", CloneFlags::CLONE_NEWUSER)?;
            self.write_id_maps()?;
        }

        unshare_as("unshare(CLONE_NEWNS)", CloneFlags::CLONE_NEWNS)?;
        backend
            .make_private(Path::new("/"))
            .map_err(|e| unavailable("make / private", e))?;
        debug!("Mount propagation of / is private");

        let mut rest = CloneFlags::empty();
        if self.config.use_pid_ns {
            rest |= CloneFlags::CLONE_NEWPID;
        }
        if self.config.use_net_ns {
            rest |= CloneFlags::CLONE_NEWNET;
        }
        if !rest.is_empty() {
            unshare_as("unshare(CLONE_NEWPID|CLONE_NEWNET)", rest)?;
        }

        let set = NamespaceSet::open(&self.config)?;
        info!(namespaces = ?enabled, held = set.len(), "Namespace setup complete");
        Ok(set)
    }

    fn write_id_maps(&self) -> Result<()> {
        // Validated above: both maps are present with a user namespace
        let (Some(uid_map), Some(gid_map)) = (self.config.uid_map, self.config.gid_map) else {
            return Err(Error::invalid_config("user namespace needs id maps"));
        };

        // Unprivileged gid_map writes require setgroups to be denied first
        match fs::write("/proc/self/setgroups", "deny") {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Kernel has no /proc/self/setgroups");
            }
            Err(e) => return Err(unavailable("write /proc/self/setgroups", errno_of(&e))),
        }

        fs::write("/proc/self/uid_map", format!("{uid_map}\n"))
            .map_err(|e| unavailable("write /proc/self/uid_map", errno_of(&e)))?;
        fs::write("/proc/self/gid_map", format!("{gid_map}\n"))
            .map_err(|e| unavailable("write /proc/self/gid_map", errno_of(&e)))?;

        debug!(uid_map = %uid_map, gid_map = %gid_map, "Wrote id maps");
        Ok(())
    }
}

fn unshare_as(operation: &str, flags: CloneFlags) -> Result<()> {
    unshare(flags).map_err(|e| {
        error!(operation, error = %e, "Failed to create namespace");
        unavailable(operation, e)
    })
}

fn unavailable(operation: &str, source: Errno) -> Error {
    Error::NamespaceUnavailable {
        operation: operation.to_string(),
        source,
    }
}

fn errno_of(err: &io::Error) -> Errno {
    Errno::from_raw(err.raw_os_error().unwrap_or(libc::EIO))
}

/// Open descriptors of the namespaces a run created
///
/// Held by the run context and closed during teardown.
#[derive(Debug)]
pub struct NamespaceSet {
    handles: Vec<(&'static str, File)>,
}

impl NamespaceSet {
    fn open(config: &NamespaceConfig) -> Result<Self> {
        let mut wanted = Vec::new();
        if config.use_user_ns {
            wanted.push(("user", "user"));
        }
        wanted.push(("mnt", "mnt"));
        if config.use_net_ns {
            wanted.push(("net", "net"));
        }

        let mut handles = Vec::with_capacity(wanted.len() + 1);
        for (name, entry) in wanted {
            handles.push((name, open_ns(&Path::new("/proc/self/ns").join(entry), name)?));
        }

        Ok(Self { handles })
    }

    /// Hold the PID namespace that `init` is the first member of
    ///
    /// # Errors
    /// [`Error::NamespaceUnavailable`] if the process is already gone
    pub fn hold_pid(&mut self, init: ProcessId) -> Result<()> {
        let path = Path::new("/proc").join(init.to_string()).join("ns/pid");
        let file = open_ns(&path, "pid")?;
        self.handles.push(("pid", file));
        Ok(())
    }

    /// Number of held namespace descriptors
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no descriptor is held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Names of the held namespaces
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handles.iter().map(|(name, _)| *name)
    }

    /// Close every descriptor, returning how many were released
    pub fn release(self) -> usize {
        let count = self.handles.len();
        drop(self);
        count
    }
}

fn open_ns(path: &Path, name: &str) -> Result<File> {
    let file = File::open(path)
        .map_err(|e| unavailable(&format!("open {}", path.display()), errno_of(&e)))?;
    if let Ok(id) = fs::read_link(path) {
        debug!(namespace = name, id = %id.display(), "Holding namespace");
    }
    Ok(file)
}

/// Namespace identifiers of the calling process, as shown in `/proc/self/ns`
#[derive(Debug, Clone, Default)]
pub struct NamespaceInfo {
    /// User namespace ID
    pub user: Option<String>,
    /// Mount namespace ID
    pub mnt: Option<String>,
    /// PID namespace ID
    pub pid: Option<String>,
    /// Network namespace ID
    pub net: Option<String>,
}

impl NamespaceInfo {
    /// Namespaces of the calling process
    #[must_use]
    pub fn current() -> Self {
        let read_ns = |name: &str| {
            fs::read_link(Path::new("/proc/self/ns").join(name))
                .ok()
                .map(|p| p.to_string_lossy().into_owned())
        };

        Self {
            user: read_ns("user"),
            mnt: read_ns("mnt"),
            pid: read_ns("pid"),
            net: read_ns("net"),
        }
    }

    /// Names of the namespace kinds the kernel exposes
    #[must_use]
    pub fn available(&self) -> Vec<&'static str> {
        [
            ("user", &self.user),
            ("mnt", &self.mnt),
            ("pid", &self.pid),
            ("net", &self.net),
        ]
        .into_iter()
        .filter(|(_, id)| id.is_some())
        .map(|(name, _)| name)
        .collect()
    }
}

impl std::fmt::Display for NamespaceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Namespace Info:")?;
        if let Some(ref user) = self.user {
            writeln!(f, "  USER: {user}")?;
        }
        if let Some(ref mnt) = self.mnt {
            writeln!(f, "  MNT:  {mnt}")?;
        }
        if let Some(ref pid) = self.pid {
            writeln!(f, "  PID:  {pid}")?;
        }
        if let Some(ref net) = self.net {
            writeln!(f, "  NET:  {net}")?;
        }
        Ok(())
    }
}
